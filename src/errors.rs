// File: src/errors.rs
//
// Error handling and reporting for the Vesper language.
// Syntax and compile problems are collected as diagnostics with source
// locations; runtime failures carry the exception class, message and a
// rendered traceback.

use std::fmt;

/// A single parser or compiler diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self { file: file.into(), line, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

/// Errors surfaced by the public entry points.
#[derive(Debug, Clone)]
pub enum VesperError {
    /// The source did not parse.
    Syntax(Vec<Diagnostic>),
    /// The AST did not compile.
    Compile(Diagnostic),
    /// An exception escaped the program.
    Runtime(RuntimeError),
    /// A compiled module file was malformed.
    Deserialize(String),
    /// A compiled module file was built by an incompatible version.
    VersionMismatch { found: (u8, u8), expected: (u8, u8) },
}

/// The payload of an unhandled exception: its class name, message and the
/// traceback rendered per the reporting rules (most recent call last,
/// repeated frames collapsed, cause chains separated by a marker line).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub class: String,
    pub message: String,
    pub traceback: String,
}

impl fmt::Display for VesperError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VesperError::Syntax(diags) => {
                for (i, d) in diags.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", d)?;
                }
                Ok(())
            }
            VesperError::Compile(d) => write!(f, "{}", d),
            VesperError::Runtime(err) => write!(f, "{}", err.traceback),
            VesperError::Deserialize(msg) => write!(f, "invalid compiled module: {}", msg),
            VesperError::VersionMismatch { found, expected } => write!(
                f,
                "compiled module version {}.{} is not supported by runtime version {}.{}",
                found.0, found.1, expected.0, expected.1
            ),
        }
    }
}

impl std::error::Error for VesperError {}

/// One record of a captured stack trace: where a frame was executing when an
/// exception was first raised.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub module: String,
    pub function: String,
    pub line: u32,
    pub path: String,
}

impl TraceRecord {
    fn render(&self) -> String {
        format!("    {}:{}: error in {}.{}()", self.path, self.line, self.module, self.function)
    }
}

/// Renders trace records most-recent-call-last, collapsing runs of identical
/// frames into a `[Previous line repeated N times]` marker.
pub fn render_trace(records: &[TraceRecord]) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    let mut i = 0;
    while i < records.len() {
        let line = records[i].render();
        let mut run = 1;
        while i + run < records.len() && records[i + run] == records[i] {
            run += 1;
        }
        out.push_str(&line);
        out.push('\n');
        if run > 1 {
            out.push_str(&format!("    [Previous line repeated {} times]\n", run - 1));
        }
        i += run;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(function: &str, line: u32) -> TraceRecord {
        TraceRecord {
            module: "__main__".to_string(),
            function: function.to_string(),
            line,
            path: "script.vsp".to_string(),
        }
    }

    #[test]
    fn trace_renders_most_recent_last() {
        let trace = render_trace(&[rec("<main>", 1), rec("boom", 3)]);
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines[0], "Traceback (most recent call last):");
        assert!(lines[1].contains("__main__.<main>()"));
        assert!(lines[2].contains("__main__.boom()"));
    }

    #[test]
    fn trace_collapses_repeats() {
        let records = vec![rec("<main>", 1), rec("recur", 5), rec("recur", 5), rec("recur", 5)];
        let trace = render_trace(&records);
        assert!(trace.contains("[Previous line repeated 2 times]"));
        // The repeated frame itself is printed once.
        assert_eq!(trace.matches("recur").count(), 1);
    }
}
