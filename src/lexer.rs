// File: src/lexer.rs
//
// Tokenizer for Vesper source. String tokens keep their raw contents:
// escape sequences are decoded later by the compiler so that it owns the
// error reporting (and the scratch buffer) for bad escapes.

use crate::errors::Diagnostic;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    /// Raw contents between the quotes, escapes untouched.
    Str(String),
    Operator(String),
    Punctuation(char),
    Keyword(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

const KEYWORDS: &[&str] = &[
    "var", "static", "fun", "native", "class", "is", "end", "if", "then", "elif", "else",
    "while", "for", "in", "do", "return", "break", "continue", "raise", "try", "except",
    "ensure", "with", "import", "as", "true", "false", "null", "this", "super", "and", "or",
    "not", "begin",
];

pub fn tokenize(file: &str, source: &str) -> Result<Vec<Token>, Diagnostic> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                line += 1;
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    while let Some(&ch) = chars.peek() {
                        if ch == '\n' {
                            break;
                        }
                        chars.next();
                    }
                } else if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Operator("/=".to_string()), line });
                } else {
                    tokens.push(Token { kind: TokenKind::Operator("/".to_string()), line });
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let start_line = line;
                let mut raw = String::new();
                let mut closed = false;
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                    }
                    raw.push(ch);
                    // Keep the escaped character raw, but do not let an
                    // escaped quote terminate the literal.
                    if ch == '\\' {
                        if let Some(&esc) = chars.peek() {
                            chars.next();
                            raw.push(esc);
                        }
                    }
                }
                if !closed {
                    return Err(Diagnostic::new(file, start_line, "unterminated string"));
                }
                tokens.push(Token { kind: TokenKind::Str(raw), line: start_line });
            }
            '0'..='9' => {
                let mut num = String::new();
                let mut seen_dot = false;
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        num.push(ch);
                        chars.next();
                    } else if ch == '.' && !seen_dot {
                        // A dot not followed by a digit is a field access.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if !matches!(ahead.peek(), Some(d) if d.is_ascii_digit()) {
                            break;
                        }
                        seen_dot = true;
                        num.push(ch);
                        chars.next();
                    } else if ch == 'e' || ch == 'E' {
                        let mut ahead = chars.clone();
                        ahead.next();
                        if matches!(ahead.peek(), Some('+') | Some('-')) {
                            ahead.next();
                        }
                        if !matches!(ahead.peek(), Some(d) if d.is_ascii_digit()) {
                            break;
                        }
                        num.push(ch);
                        chars.next();
                        if matches!(chars.peek(), Some('+') | Some('-')) {
                            num.push(*chars.peek().unwrap());
                            chars.next();
                        }
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num
                    .parse()
                    .map_err(|_| Diagnostic::new(file, line, format!("bad number literal '{}'", num)))?;
                tokens.push(Token { kind: TokenKind::Number(parsed), line });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };
                tokens.push(Token { kind, line });
            }
            '=' | '!' | '<' | '>' | '+' | '-' | '*' | '%' | '^' | '#' | '.' => {
                chars.next();
                let mut op = c.to_string();
                match (c, chars.peek()) {
                    ('=', Some('=')) | ('!', Some('=')) | ('<', Some('=')) | ('>', Some('='))
                    | ('+', Some('=')) | ('-', Some('=')) | ('*', Some('=')) | ('%', Some('='))
                    | ('#', Some('#')) => {
                        op.push(*chars.peek().unwrap());
                        chars.next();
                    }
                    ('.', Some('.')) => {
                        chars.next();
                        if chars.peek() == Some(&'.') {
                            chars.next();
                            op = "...".to_string();
                        } else {
                            return Err(Diagnostic::new(file, line, "unexpected '..'"));
                        }
                    }
                    _ => {}
                }
                tokens.push(Token { kind: TokenKind::Operator(op), line });
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | ':' | ';' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Punctuation(c), line });
            }
            other => {
                return Err(Diagnostic::new(
                    file,
                    line,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize("test.vsp", src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_declaration() {
        let toks = kinds("var x = 1.5");
        assert_eq!(
            toks,
            vec![
                TokenKind::Keyword("var".into()),
                TokenKind::Identifier("x".into()),
                TokenKind::Operator("=".into()),
                TokenKind::Number(1.5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_keeps_raw_escapes() {
        let toks = kinds(r#""a\nb""#);
        assert_eq!(toks[0], TokenKind::Str("a\\nb".to_string()));
    }

    #[test]
    fn escaped_quote_does_not_terminate() {
        let toks = kinds(r#""say \"hi\"""#);
        assert_eq!(toks[0], TokenKind::Str(r#"say \"hi\""#.to_string()));
    }

    #[test]
    fn number_dot_method_call_splits() {
        let toks = kinds("3.floor()");
        assert_eq!(toks[0], TokenKind::Number(3.0));
        assert_eq!(toks[1], TokenKind::Operator(".".into()));
    }

    #[test]
    fn len_and_stringify_operators() {
        let toks = kinds("#x ##x");
        assert_eq!(toks[0], TokenKind::Operator("#".into()));
        assert_eq!(toks[2], TokenKind::Operator("##".into()));
    }

    #[test]
    fn comments_are_skipped() {
        let toks = kinds("1 // comment\n2");
        assert_eq!(toks[0], TokenKind::Number(1.0));
        assert_eq!(toks[1], TokenKind::Number(2.0));
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(tokenize("t.vsp", "\"abc").is_err());
    }

    #[test]
    fn line_numbers_advance() {
        let toks = tokenize("t.vsp", "1\n2\n\n3").unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].line, 2);
        assert_eq!(toks[2].line, 4);
    }
}
