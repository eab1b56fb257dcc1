// File: src/vm.rs
//
// The Vesper virtual machine: a fetch-decode-execute loop over packed
// bytecode with call frames, inline-cache dispatch, closure upvalues and
// handler-stack exception unwinding. The VM owns the heap; collection is
// triggered only at allocation points, with the root set gathered from the
// stack, frames, open upvalues, modules and pinned values.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::code::{disassemble_instruction, Code, SymCache};
use crate::compiler::compile_module;
use crate::errors::{render_trace, Diagnostic, RuntimeError, TraceRecord, VesperError};
use crate::gc::Heap;
use crate::lexer::tokenize;
use crate::object::{
    FnProto, NativeFn, Obj, ObjBoundMethod, ObjClosure, ObjInstance, ObjModule, ObjStackTrace,
    ObjUpvalue,
};
use crate::opcode::Op;
use crate::parser::Parser;
use crate::table::TEntry;
use crate::value::{format_num, ObjRef, Value};

pub const MAX_STACK: usize = 100_000;
pub const MAX_FRAMES: usize = 1000;

static TRACE_EXEC: Lazy<bool> = Lazy::new(|| std::env::var("VESPER_TRACE_EXEC").is_ok());

/// Marker: an exception has been set on the VM and unwinding must run.
#[derive(Debug, Clone, Copy)]
pub struct Raised;

pub type RtResult<T = ()> = Result<T, Raised>;

struct Frame {
    closure: ObjRef,
    code: Rc<Code>,
    module: ObjRef,
    ip: usize,
    base: usize,
    handler_base: usize,
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    /// Recorded for introspection; ensure and except records unwind the
    /// same way (the compiled handler code differs instead).
    #[allow(dead_code)]
    is_ensure: bool,
    target: usize,
    depth: usize,
}

/// Handles to the core module and the builtin classes, filled in by the
/// bootstrap before the first user instruction runs.
#[derive(Debug, Clone, Copy)]
pub struct CoreHandles {
    pub module: ObjRef,
    pub class_class: ObjRef,
    pub number: ObjRef,
    pub boolean: ObjRef,
    pub null: ObjRef,
    pub string: ObjRef,
    pub function: ObjRef,
    pub module_class: ObjRef,
    pub list: ObjRef,
    pub tuple: ObjRef,
    pub table: ObjRef,
    pub stacktrace: ObjRef,
    pub exception: ObjRef,
}

impl Default for CoreHandles {
    fn default() -> Self {
        let nil = ObjRef(u32::MAX);
        Self {
            module: nil,
            class_class: nil,
            number: nil,
            boolean: nil,
            null: nil,
            string: nil,
            function: nil,
            module_class: nil,
            list: nil,
            tuple: nil,
            table: nil,
            stacktrace: nil,
            exception: nil,
        }
    }
}

enum OutSink {
    Stdout,
    Buffer(Vec<u8>),
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<Handler>,
    /// Open upvalues sorted by descending stack slot.
    open_upvalues: Vec<(usize, ObjRef)>,
    pub(crate) modules: AHashMap<String, ObjRef>,
    pub(crate) core: CoreHandles,
    /// The in-flight exception while unwinding.
    exception: Option<Value>,
    /// Compiler and embedder pins: kept alive across collections.
    pub(crate) pins: Vec<Value>,
    /// Base stack indices of the native calls currently running.
    pub(crate) native_bases: Vec<usize>,
    empty_tuple: ObjRef,
    natives: AHashMap<(String, String), (NativeFn, u8, bool, u8)>,
    interrupt: Arc<AtomicBool>,
    out: OutSink,
    search_paths: Vec<PathBuf>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            handlers: Vec::new(),
            open_upvalues: Vec::new(),
            modules: AHashMap::new(),
            core: CoreHandles::default(),
            exception: None,
            pins: Vec::new(),
            native_bases: Vec::new(),
            empty_tuple: ObjRef(u32::MAX),
            natives: AHashMap::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            out: OutSink::Stdout,
            search_paths: vec![PathBuf::from(".")],
        };
        // Collection stays off until every core class handle exists.
        vm.heap.paused = true;
        crate::core::install(&mut vm);
        vm.empty_tuple = vm.heap.alloc_raw(Obj::Tuple(Vec::new().into_boxed_slice()), Some(vm.core.tuple));
        vm.heap.paused = false;
        vm
    }

    // === Embedding surface ===

    /// Read-only view of the heap, for tooling such as the disassembler.
    pub fn heap_ref(&self) -> &Heap {
        &self.heap
    }

    /// Current operand stack depth. A fully executed top-level script
    /// leaves the stack empty.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Shared flag checked on back-branches; setting it raises
    /// ProgramInterrupt at the next loop edge.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Registers a native so `native fun` declarations (and NatMethod
    /// opcodes) in `module` can resolve it. Method natives use the key
    /// "Class.method".
    pub fn register_native(
        &mut self,
        module: &str,
        name: &str,
        arity: u8,
        vararg: bool,
        defaults: u8,
        func: NativeFn,
    ) {
        self.natives
            .insert((module.to_string(), name.to_string()), (func, arity, vararg, defaults));
    }

    /// Redirects `print` output into an internal buffer (used by tests and
    /// embedders).
    pub fn capture_output(&mut self) {
        self.out = OutSink::Buffer(Vec::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutSink::Buffer(buf) => String::from_utf8_lossy(&std::mem::take(buf)).into_owned(),
            OutSink::Stdout => String::new(),
        }
    }

    pub(crate) fn write_out(&mut self, s: &str) {
        match &mut self.out {
            OutSink::Stdout => {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(s.as_bytes());
                let _ = stdout.flush();
            }
            OutSink::Buffer(buf) => buf.extend_from_slice(s.as_bytes()),
        }
    }

    /// Compiles and runs `source` as the __main__ module.
    pub fn interpret(&mut self, path: &str, source: &str) -> Result<Value, VesperError> {
        let pin_base = self.pins.len();
        let result = self
            .compile_source(path, source, "__main__")
            .and_then(|function| self.run_function(function));
        self.pins.truncate(pin_base);
        result
    }

    /// Front half of [`Vm::interpret`]: returns the compiled top-level
    /// function without running it.
    pub fn compile_source(
        &mut self,
        path: &str,
        source: &str,
        module_name: &str,
    ) -> Result<ObjRef, VesperError> {
        let tokens = tokenize(path, source).map_err(|d| VesperError::Syntax(vec![d]))?;
        let stmts = Parser::new(path, tokens).parse().map_err(VesperError::Syntax)?;
        let module = self.new_module(module_name, path);
        let pin_base = self.pins.len();
        let result = compile_module(self, path, module, &stmts);
        match result {
            Ok(function) => {
                // Keep the compiled artifact pinned through its first use.
                self.pins.truncate(pin_base);
                self.pins.push(Value::Obj(function));
                Ok(function)
            }
            Err(diag) => {
                self.pins.truncate(pin_base);
                Err(VesperError::Compile(diag))
            }
        }
    }

    /// Runs a compiled top-level function to completion.
    pub fn run_function(&mut self, function: ObjRef) -> Result<Value, VesperError> {
        self.pins.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pins.pop();
        self.push(Value::Obj(closure));
        let outcome = match self.call_value(0) {
            Ok(_) => self.run_dispatch(0),
            Err(raised) => Err(raised),
        };
        match outcome {
            Ok(value) => {
                self.pop();
                Ok(value)
            }
            Err(Raised) => {
                let exc = self.exception.take().unwrap_or(Value::Null);
                let err = self.render_runtime_error(exc);
                // A failed script leaves no residue behind.
                self.stack.clear();
                self.frames.clear();
                self.handlers.clear();
                self.open_upvalues.clear();
                Err(VesperError::Runtime(err))
            }
        }
    }

    // === Allocation and GC ===

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        let class = self.class_for_kind(&obj);
        self.heap.alloc_raw(obj, class)
    }

    pub(crate) fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.alloc_raw(Obj::Instance(ObjInstance { slots: Vec::new() }), Some(class))
    }

    pub(crate) fn intern(&mut self, s: &str) -> ObjRef {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        let class = if self.heap.paused { None } else { Some(self.core.string) };
        self.heap.intern(s, class)
    }

    /// Interns and pins; used by the compiler, whose products must survive
    /// collections triggered by its own later allocations.
    pub(crate) fn intern_pinned(&mut self, s: &str) -> ObjRef {
        let r = self.intern(s);
        self.pins.push(Value::Obj(r));
        r
    }

    pub(crate) fn alloc_pinned(&mut self, obj: Obj) -> ObjRef {
        let r = self.alloc(obj);
        self.pins.push(Value::Obj(r));
        r
    }

    fn class_for_kind(&self, obj: &Obj) -> Option<ObjRef> {
        if self.heap.paused {
            return None;
        }
        let c = &self.core;
        Some(match obj {
            Obj::String(_) => c.string,
            Obj::Function(_) | Obj::Native(_) | Obj::Closure(_) | Obj::BoundMethod(_) => c.function,
            Obj::Upvalue(_) => return None,
            Obj::Class(_) => c.class_class,
            Obj::Instance(_) => return None, // set by alloc_instance
            Obj::Module(_) => c.module_class,
            Obj::List(_) => c.list,
            Obj::Tuple(_) => c.tuple,
            Obj::Table(_) => c.table,
            Obj::StackTrace(_) => c.stacktrace,
        })
    }

    pub(crate) fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + 64);
        roots.extend(self.stack.iter().copied());
        roots.extend(self.frames.iter().map(|f| Value::Obj(f.closure)));
        roots.extend(self.open_upvalues.iter().map(|&(_, u)| Value::Obj(u)));
        roots.extend(self.modules.values().map(|&m| Value::Obj(m)));
        roots.extend(self.pins.iter().copied());
        if let Some(exc) = self.exception {
            roots.push(exc);
        }
        if self.empty_tuple != ObjRef(u32::MAX) {
            roots.push(Value::Obj(self.empty_tuple));
        }
        let c = &self.core;
        for handle in [
            c.module, c.class_class, c.number, c.boolean, c.null, c.string, c.function,
            c.module_class, c.list, c.tuple, c.table, c.stacktrace, c.exception,
        ] {
            if handle != ObjRef(u32::MAX) {
                roots.push(Value::Obj(handle));
            }
        }
        self.heap.collect(&roots);
    }

    // === Stack ===

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    pub(crate) fn peek(&self, n: usize) -> Value {
        self.stack[self.stack.len() - 1 - n]
    }

    pub(crate) fn set_at_depth(&mut self, n: usize, v: Value) {
        let i = self.stack.len() - 1 - n;
        self.stack[i] = v;
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn stack_get(&self, i: usize) -> Value {
        self.stack[i]
    }

    pub(crate) fn stack_set(&mut self, i: usize, v: Value) {
        self.stack[i] = v;
    }

    fn frame(&self) -> &Frame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap()
    }

    fn cur_code(&self) -> Rc<Code> {
        Rc::clone(&self.frame().code)
    }

    fn fetch_byte(&mut self) -> u8 {
        let f = self.frames.last_mut().unwrap();
        let b = f.code.bytes[f.ip];
        f.ip += 1;
        b
    }

    fn fetch_u16(&mut self) -> u16 {
        ((self.fetch_byte() as u16) << 8) | self.fetch_byte() as u16
    }

    // === Exceptions ===

    /// Instantiates a core exception class and starts unwinding.
    pub(crate) fn raise(&mut self, class_name: &str, message: impl Into<String>) -> Raised {
        let message = message.into();
        let class = self
            .core_global(class_name)
            .and_then(Value::as_obj)
            .filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
            .unwrap_or(self.core.exception);
        let instance = self.alloc_instance(class);
        self.exception = Some(Value::Obj(instance)); // root it right away
        let msg = self.intern(&message);
        self.set_instance_field(instance, "_err", Value::Obj(msg));
        self.set_instance_field(instance, "_cause", Value::Null);
        self.set_instance_field(instance, "_stacktrace", Value::Null);
        self.attach_stack_trace(instance);
        Raised
    }

    /// Raises an arbitrary value; it must be an instance of the Exception
    /// family. Captures a stack trace only on the first raise.
    pub(crate) fn raise_value(&mut self, v: Value) -> Raised {
        let is_exception = self
            .class_of_value(v)
            .map(|c| self.class_extends(c, self.core.exception))
            .unwrap_or(false)
            && matches!(v, Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)));
        if !is_exception {
            let kind = self.kind_name(v);
            return self.raise("TypeException", format!("can only raise Exception instances, got {}", kind));
        }
        let inst = v.as_obj().unwrap();
        self.exception = Some(v);
        if self.get_instance_field(inst, "_stacktrace").unwrap_or(Value::Null).is_null() {
            self.attach_stack_trace(inst);
        }
        Raised
    }

    fn attach_stack_trace(&mut self, instance: ObjRef) {
        let records = self.capture_trace();
        let trace = self.alloc(Obj::StackTrace(ObjStackTrace { records }));
        self.set_instance_field(instance, "_stacktrace", Value::Obj(trace));
    }

    /// Walks the frame stack bottom-up so rendering reads most recent call
    /// last.
    fn capture_trace(&mut self) -> Vec<TraceRecord> {
        let mut records = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let function = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => continue,
            };
            let (name, module) = match self.heap.get(function) {
                Obj::Function(f) => (f.proto.name, f.proto.module),
                _ => continue,
            };
            let (module_name, path) = match self.heap.get(module) {
                Obj::Module(m) => {
                    (self.heap.str(m.name).to_string(), self.heap.str(m.path).to_string())
                }
                _ => (String::new(), String::new()),
            };
            let line = frame.code.line_at(frame.ip.saturating_sub(1));
            records.push(TraceRecord {
                module: module_name,
                function: self.heap.str(name).to_string(),
                line,
                path,
            });
        }
        records
    }

    /// Unwinds the frame and handler stacks toward the innermost handler.
    /// Err means the exception crossed `exit_depth` and stays pending.
    fn unwind(&mut self, exit_depth: usize) -> RtResult {
        loop {
            if let Some(frame) = self.frames.last() {
                if self.handlers.len() > frame.handler_base {
                    let h = self.handlers.pop().unwrap();
                    self.stack.truncate(h.depth);
                    let exc = self.exception.take().unwrap_or(Value::Null);
                    // The handler sees (exception, cause); the cause starts
                    // out as the exception itself.
                    self.stack.push(exc);
                    self.stack.push(exc);
                    self.frames.last_mut().unwrap().ip = h.target;
                    return Ok(());
                }
            } else {
                return Err(Raised);
            }
            let frame = self.frames.pop().unwrap();
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base);
            self.handlers.truncate(frame.handler_base);
            if self.frames.len() <= exit_depth {
                return Err(Raised);
            }
        }
    }

    fn render_runtime_error(&mut self, exc: Value) -> RuntimeError {
        let mut rendered = String::new();
        self.render_exception_chain(exc, &mut rendered, 0);
        let class = self
            .class_of_value(exc)
            .map(|c| self.class_name(c))
            .unwrap_or_else(|| "Exception".to_string());
        let message = match exc.as_obj().and_then(|r| self.get_instance_field(r, "_err")) {
            Some(Value::Obj(s)) => self.heap.str(s).to_string(),
            _ => String::new(),
        };
        RuntimeError { class, message, traceback: rendered }
    }

    fn render_exception_chain(&mut self, exc: Value, out: &mut String, depth: usize) {
        if depth > 8 {
            return;
        }
        let Some(inst) = exc.as_obj() else { return };
        // Causes print first, oldest deepest.
        if let Some(cause) = self.get_instance_field(inst, "_cause") {
            if !cause.is_null() {
                self.render_exception_chain(cause, out, depth + 1);
                out.push_str("Above Exception caused:\n");
            }
        }
        if let Some(Value::Obj(trace)) = self.get_instance_field(inst, "_stacktrace") {
            if let Obj::StackTrace(st) = self.heap.get(trace) {
                out.push_str(&render_trace(&st.records));
            }
        }
        let class = self
            .class_of_value(exc)
            .map(|c| self.class_name(c))
            .unwrap_or_else(|| "Exception".to_string());
        let message = match self.get_instance_field(inst, "_err") {
            Some(Value::Obj(s)) => self.heap.str(s).to_string(),
            _ => String::new(),
        };
        if message.is_empty() {
            out.push_str(&format!("{}\n", class));
        } else {
            out.push_str(&format!("{}: {}\n", class, message));
        }
    }

    // === Object helpers ===

    pub(crate) fn class_of_value(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Num(_) => Some(self.core.number),
            Value::Bool(_) => Some(self.core.boolean),
            Value::Null => Some(self.core.null),
            Value::Handle(_) => None,
            Value::Obj(r) => self.heap.class_of(r),
        }
    }

    pub(crate) fn class_name(&self, class: ObjRef) -> String {
        match self.heap.get(class) {
            Obj::Class(c) => self.heap.str(c.name).to_string(),
            _ => String::new(),
        }
    }

    pub(crate) fn kind_name(&self, v: Value) -> String {
        match self.class_of_value(v) {
            Some(c) => self.class_name(c),
            None => "Handle".to_string(),
        }
    }

    fn class_extends(&self, mut class: ObjRef, ancestor: ObjRef) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.heap.get(class) {
                Obj::Class(c) => match c.superclass {
                    Some(s) => class = s,
                    None => return false,
                },
                _ => return false,
            }
        }
    }

    pub(crate) fn find_method(&self, mut class: ObjRef, name: ObjRef) -> Option<Value> {
        let hash = self.heap.str_hash(name);
        loop {
            match self.heap.get(class) {
                Obj::Class(c) => {
                    if let Some(&m) = c.methods.get(name, hash) {
                        return Some(m);
                    }
                    match c.superclass {
                        Some(s) => class = s,
                        None => return None,
                    }
                }
                _ => return None,
            }
        }
    }

    /// Field access through the class field layout; `None` when the field
    /// was never assigned.
    pub(crate) fn get_instance_field(&self, instance: ObjRef, name: &str) -> Option<Value> {
        let class = self.heap.class_of(instance)?;
        let slot = match self.heap.get(class) {
            Obj::Class(c) => c
                .field_layout
                .iter()
                .find(|(k, _)| self.heap.str(*k) == name)
                .map(|(_, &s)| s)?,
            _ => return None,
        };
        match self.heap.get(instance) {
            Obj::Instance(i) => i.get_slot(slot),
            _ => None,
        }
    }

    pub(crate) fn set_instance_field(&mut self, instance: ObjRef, name: &str, v: Value) {
        let name_ref = self.intern(name);
        let Some(class) = self.heap.class_of(instance) else { return };
        let slot = self.field_slot(class, name_ref);
        if let Obj::Instance(i) = self.heap.get_mut(instance) {
            i.set_slot(slot, v);
        }
    }

    /// Looks up or assigns the layout slot for a field name on a class.
    fn field_slot(&mut self, class: ObjRef, name: ObjRef) -> u16 {
        let hash = self.heap.str_hash(name);
        if let Obj::Class(c) = self.heap.get(class) {
            if let Some(&slot) = c.field_layout.get(name, hash) {
                return slot;
            }
        }
        if let Obj::Class(c) = self.heap.get_mut(class) {
            let slot = c.field_layout.len() as u16;
            c.field_layout.insert(name, hash, slot);
            slot
        } else {
            0
        }
    }

    fn core_global(&self, name: &str) -> Option<Value> {
        let module = self.core.module;
        match self.heap.get(module) {
            Obj::Module(m) => m
                .names
                .iter()
                .find(|(k, _)| self.heap.str(*k) == name)
                .map(|(_, &slot)| m.globals[slot as usize]),
            _ => None,
        }
    }

    // === Modules ===

    /// Creates and registers a module; its globals start as a copy of the
    /// core module's, so the builtins resolve everywhere.
    pub fn new_module(&mut self, name: &str, path: &str) -> ObjRef {
        let name_ref = self.intern(name);
        self.pins.push(Value::Obj(name_ref));
        let path_ref = self.intern(path);
        self.pins.push(Value::Obj(path_ref));
        let module = self.alloc(Obj::Module(ObjModule {
            name: name_ref,
            path: path_ref,
            names: crate::table::StringMap::new(),
            globals: Vec::new(),
        }));
        self.pins.pop();
        self.pins.pop();
        self.modules.insert(name.to_string(), module);
        if self.core.module != ObjRef(u32::MAX) && module != self.core.module {
            let entries: Vec<(ObjRef, Value)> = match self.heap.get(self.core.module) {
                Obj::Module(m) => m
                    .names
                    .iter()
                    .map(|(k, &slot)| (k, m.globals[slot as usize]))
                    .collect(),
                _ => Vec::new(),
            };
            for (k, v) in entries {
                self.module_define(module, k, v);
            }
        }
        module
    }

    #[cfg(test)]
    pub(crate) fn new_module_for_test(&mut self, name: &str) -> ObjRef {
        self.new_module(name, &format!("{}.vsp", name))
    }

    pub(crate) fn module_define(&mut self, module: ObjRef, name: ObjRef, v: Value) -> u32 {
        let hash = self.heap.str_hash(name);
        if let Obj::Module(m) = self.heap.get_mut(module) {
            if let Some(&slot) = m.names.get(name, hash) {
                m.globals[slot as usize] = v;
                return slot;
            }
            let slot = m.globals.len() as u32;
            m.globals.push(v);
            m.names.insert(name, hash, slot);
            slot
        } else {
            0
        }
    }

    fn module_lookup(&self, module: ObjRef, name: ObjRef) -> Option<(u32, Value)> {
        let hash = self.heap.str_hash(name);
        match self.heap.get(module) {
            Obj::Module(m) => m
                .names
                .get(name, hash)
                .map(|&slot| (slot, m.globals[slot as usize])),
            _ => None,
        }
    }

    fn import_module(&mut self, name: &str) -> RtResult<ObjRef> {
        if let Some(&m) = self.modules.get(name) {
            return Ok(m);
        }
        for dir in self.search_paths.clone() {
            let src = dir.join(format!("{}.vsp", name));
            if src.exists() {
                return self.load_source_module(name, &src);
            }
            let bin = dir.join(format!("{}.vbc", name));
            if bin.exists() {
                return self.load_binary_module(name, &bin);
            }
        }
        Err(self.raise("ImportException", format!("cannot resolve module '{}'", name)))
    }

    fn load_source_module(&mut self, name: &str, path: &std::path::Path) -> RtResult<ObjRef> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            self.raise("ImportException", format!("cannot read module '{}': {}", name, e))
        })?;
        let path_str = path.display().to_string();
        let tokens = tokenize(&path_str, &source)
            .map_err(|d| self.raise("SyntaxException", d.to_string()))?;
        let stmts = Parser::new(&path_str, tokens)
            .parse()
            .map_err(|ds| self.raise("SyntaxException", render_diags(&ds)))?;
        // Registered before the body runs: circular imports observe the
        // partially initialized module instead of recursing forever.
        let module = self.new_module(name, &path_str);
        let pin_base = self.pins.len();
        let compiled = compile_module(self, &path_str, module, &stmts);
        let function = match compiled {
            Ok(f) => f,
            Err(d) => {
                self.pins.truncate(pin_base);
                self.modules.remove(name);
                return Err(self.raise("SyntaxException", d.to_string()));
            }
        };
        let result = self.run_module_body(function);
        self.pins.truncate(pin_base);
        result?;
        Ok(module)
    }

    fn load_binary_module(&mut self, name: &str, path: &std::path::Path) -> RtResult<ObjRef> {
        let bytes = std::fs::read(path).map_err(|e| {
            self.raise("ImportException", format!("cannot read module '{}': {}", name, e))
        })?;
        let path_str = path.display().to_string();
        let module = self.new_module(name, &path_str);
        let pin_base = self.pins.len();
        let function = match crate::serialize::read_module(self, module, &bytes) {
            Ok(f) => f,
            Err(e) => {
                self.pins.truncate(pin_base);
                self.modules.remove(name);
                return Err(self.raise("ImportException", e.to_string()));
            }
        };
        self.pins.push(Value::Obj(function));
        let result = self.run_module_body(function);
        self.pins.truncate(pin_base);
        result?;
        Ok(module)
    }

    fn run_module_body(&mut self, function: ObjRef) -> RtResult {
        self.pins.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pins.pop();
        self.push(Value::Obj(closure));
        let depth = self.frames.len();
        if self.call_value(0)? {
            self.run_dispatch(depth)?;
        }
        self.pop();
        Ok(())
    }

    // === Calls ===

    /// Calls the value sitting under `argc` arguments. Returns true when a
    /// bytecode frame was pushed (the dispatch loop continues into it), or
    /// false when the call completed eagerly (natives, field-less
    /// constructors).
    pub(crate) fn call_value(&mut self, argc: usize) -> RtResult<bool> {
        let callee = self.peek(argc);
        let Value::Obj(r) = callee else {
            let kind = self.kind_name(callee);
            return Err(self.raise("TypeException", format!("{} is not callable", kind)));
        };
        match self.heap.get(r) {
            Obj::Closure(_) | Obj::Native(_) => self.call_callable(callee, argc),
            Obj::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.set_at_depth(argc, receiver);
                self.call_callable(method, argc)
            }
            Obj::Class(_) => self.call_class(r, argc),
            _ => {
                let kind = self.kind_name(callee);
                Err(self.raise("TypeException", format!("{} is not callable", kind)))
            }
        }
    }

    /// Calls a closure or native with the receiver/callable already in
    /// stack slot 0 of the callee window.
    pub(crate) fn call_callable(&mut self, callee: Value, argc: usize) -> RtResult<bool> {
        let Value::Obj(r) = callee else {
            let kind = self.kind_name(callee);
            return Err(self.raise("TypeException", format!("{} is not callable", kind)));
        };
        match self.heap.get(r) {
            Obj::Closure(c) => {
                let function = c.function;
                let argc = self.fix_args_for(function, argc)?;
                self.push_frame(r, function, argc)
            }
            Obj::Native(_) => {
                let argc = self.fix_args_for(r, argc)?;
                self.run_native(r, argc)?;
                Ok(false)
            }
            _ => {
                let kind = self.kind_name(callee);
                Err(self.raise("TypeException", format!("{} is not callable", kind)))
            }
        }
    }

    fn proto_of(&self, callable: ObjRef) -> Option<&FnProto> {
        match self.heap.get(callable) {
            Obj::Function(f) => Some(&f.proto),
            Obj::Native(n) => Some(&n.proto),
            _ => None,
        }
    }

    /// Applies the arity law: missing arguments take declared defaults,
    /// excess arguments collect into a trailing tuple for varargs.
    fn fix_args_for(&mut self, callable: ObjRef, argc: usize) -> RtResult<usize> {
        let (arity, vararg, dflt_count, name) = match self.proto_of(callable) {
            Some(p) => (p.arity as usize, p.vararg, p.defaults.len(), p.name),
            None => return Ok(argc),
        };
        let mut argc = argc;
        if argc < arity {
            let missing = arity - argc;
            if missing > dflt_count {
                let name = self.heap.str(name).to_string();
                return Err(self.raise(
                    "TypeException",
                    format!("{}() takes at least {} arguments, {} supplied", name, arity - dflt_count, argc),
                ));
            }
            for i in (dflt_count - missing)..dflt_count {
                let d = match self.proto_of(callable) {
                    Some(p) => p.defaults[i],
                    None => Value::Null,
                };
                self.push(d);
            }
            argc = arity;
        }
        if argc > arity {
            if !vararg {
                let name = self.heap.str(name).to_string();
                return Err(self.raise(
                    "TypeException",
                    format!("{}() takes at most {} arguments, {} supplied", name, arity, argc),
                ));
            }
            let extra = argc - arity;
            let start = self.stack.len() - extra;
            let items: Vec<Value> = self.stack[start..].to_vec();
            // Allocate before truncating: the elements stay rooted on the
            // stack while the collector may run.
            let tuple = self.alloc(Obj::Tuple(items.into_boxed_slice()));
            self.stack.truncate(start);
            self.push(Value::Obj(tuple));
            argc = arity + 1;
        } else if vararg {
            self.push(Value::Obj(self.empty_tuple));
            argc = arity + 1;
        }
        Ok(argc)
    }

    fn push_frame(&mut self, closure: ObjRef, function: ObjRef, argc: usize) -> RtResult<bool> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.raise("StackOverflowException", "call stack limit reached"));
        }
        let (code, module, stack_usage) = match self.heap.get(function) {
            Obj::Function(f) => (Rc::clone(&f.code), f.proto.module, f.stack_usage as usize),
            _ => return Err(self.raise("TypeException", "not a function")),
        };
        if self.stack.len() + stack_usage + 16 > MAX_STACK {
            return Err(self.raise("StackOverflowException", "operand stack limit reached"));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(Frame {
            closure,
            code,
            module,
            ip: 0,
            base,
            handler_base: self.handlers.len(),
        });
        Ok(true)
    }

    fn run_native(&mut self, native: ObjRef, argc: usize) -> RtResult {
        let func = match self.heap.get(native) {
            Obj::Native(n) => n.func,
            _ => return Err(self.raise("TypeException", "not a native")),
        };
        let base = self.stack.len() - argc - 1;
        self.native_bases.push(base);
        let ok = func(self);
        self.native_bases.pop();
        if !ok {
            if self.exception.is_none() {
                // A native reported failure without raising; normalize.
                return Err(self.raise("Exception", "native function failed"));
            }
            return Err(Raised);
        }
        // The native's return value is the top of the stack.
        let ret = self.pop();
        self.stack.truncate(base);
        self.push(ret);
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, argc: usize) -> RtResult<bool> {
        let ctor_name = self.intern("new");
        let ctor = self.find_method(class, ctor_name);
        let builtin = matches!(self.heap.get(class), Obj::Class(c) if c.builtin);
        if builtin {
            let Some(ctor) = ctor else {
                let name = self.class_name(class);
                return Err(self.raise("TypeException", format!("cannot instantiate {}", name)));
            };
            return self.call_callable(ctor, argc);
        }
        let instance = self.alloc_instance(class);
        self.set_at_depth(argc, Value::Obj(instance));
        match ctor {
            Some(ctor) => self.call_callable(ctor, argc),
            None => {
                if argc != 0 {
                    let name = self.class_name(class);
                    return Err(self.raise(
                        "TypeException",
                        format!("{}() takes no arguments, {} supplied", name, argc),
                    ));
                }
                Ok(false)
            }
        }
    }

    /// Calls and, when a frame was pushed, drives the interpreter until
    /// that frame returns. Used by natives and fused opcodes re-entering
    /// the VM.
    pub(crate) fn call_and_run(&mut self, argc: usize) -> RtResult<Value> {
        let depth = self.frames.len();
        if self.call_value(argc)? {
            self.run_dispatch(depth)?;
        }
        Ok(self.pop())
    }

    /// Reentrant method invocation: pushes receiver and args are already on
    /// the stack below; resolves `name` on the receiver's class.
    pub(crate) fn invoke_and_run(&mut self, name: &str, argc: usize) -> RtResult<Value> {
        let receiver = self.peek(argc);
        let name_ref = self.intern(name);
        let method = self
            .class_of_value(receiver)
            .and_then(|c| self.find_method(c, name_ref));
        let Some(method) = method else {
            let kind = self.kind_name(receiver);
            return Err(self.raise("MethodException", format!("{} has no method {}()", kind, name)));
        };
        let depth = self.frames.len();
        if self.call_callable(method, argc)? {
            self.run_dispatch(depth)?;
        }
        Ok(self.pop())
    }

    // === Upvalues ===

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        // The list is sorted by descending slot; an open upvalue for a slot
        // exists at most once.
        for &(s, u) in &self.open_upvalues {
            if s == slot {
                return u;
            }
            if s < slot {
                break;
            }
        }
        let upvalue = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&(s, _)| s < slot)
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, (slot, upvalue));
        upvalue
    }

    /// Closes every open upvalue at or above `from_slot`, copying the live
    /// stack value into the upvalue's own cell.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&(slot, upvalue)) = self.open_upvalues.first() {
            if slot < from_slot {
                break;
            }
            let v = self.stack[slot];
            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                *u = ObjUpvalue::Closed(v);
            }
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match self.heap.get(upvalue) {
            Obj::Upvalue(ObjUpvalue::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(ObjUpvalue::Closed(v)) => *v,
            _ => Value::Null,
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, v: Value) {
        match self.heap.get(upvalue) {
            Obj::Upvalue(ObjUpvalue::Open(slot)) => {
                let slot = *slot;
                self.stack[slot] = v;
            }
            Obj::Upvalue(ObjUpvalue::Closed(_)) => {
                if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                    *u = ObjUpvalue::Closed(v);
                }
            }
            _ => {}
        }
    }

    // === Equality, hashing, display ===

    /// Deep equality: primitive compare, tuple recursion, `__eq__` for
    /// instances, identity otherwise.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> RtResult<bool> {
        if a.equals(b) {
            return Ok(true);
        }
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                match (self.heap.get(ra), self.heap.get(rb)) {
                    (Obj::Tuple(ta), Obj::Tuple(tb)) => {
                        if ta.len() != tb.len() {
                            return Ok(false);
                        }
                        let len = ta.len();
                        for i in 0..len {
                            let (xa, xb) = match (self.heap.get(ra), self.heap.get(rb)) {
                                (Obj::Tuple(ta), Obj::Tuple(tb)) => (ta[i], tb[i]),
                                _ => return Ok(false),
                            };
                            if !self.values_equal(xa, xb)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    (Obj::Instance(_), _) => self.instance_eq(a, b),
                    _ => Ok(false),
                }
            }
            (Value::Obj(ra), _) if matches!(self.heap.get(ra), Obj::Instance(_)) => {
                self.instance_eq(a, b)
            }
            _ => Ok(false),
        }
    }

    fn instance_eq(&mut self, a: Value, b: Value) -> RtResult<bool> {
        let eq_name = self.intern("__eq__");
        let method = self
            .class_of_value(a)
            .and_then(|c| self.find_method(c, eq_name));
        match method {
            Some(_) => {
                self.push(a);
                self.push(b);
                let result = self.invoke_and_run("__eq__", 1)?;
                Ok(result.is_truthy())
            }
            None => Ok(false), // identity already ruled out
        }
    }

    /// Hash for table keys. Delegates to `__hash__` for instances; null
    /// keys are rejected by the table operations before reaching here.
    pub(crate) fn value_hash(&mut self, v: Value) -> RtResult<u32> {
        match v {
            Value::Num(n) => {
                let n = if n == 0.0 { 0.0 } else { n };
                Ok(fold_u64(n.to_bits()))
            }
            Value::Bool(b) => Ok(if b { 1231 } else { 1237 }),
            Value::Null => Err(self.raise("TypeException", "Table keys cannot be null")),
            Value::Handle(h) => Ok(fold_u64(h as u64)),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => Ok(s.hash),
                Obj::Tuple(items) => {
                    let len = items.len();
                    let mut hash: u32 = 2166136261;
                    for i in 0..len {
                        let item = match self.heap.get(r) {
                            Obj::Tuple(items) => items[i],
                            _ => Value::Null,
                        };
                        let h = self.value_hash(item)?;
                        hash = (hash ^ h).wrapping_mul(16777619);
                    }
                    Ok(hash)
                }
                Obj::Instance(_) => {
                    self.push(v);
                    let result = self.invoke_and_run("__hash__", 0)?;
                    match result {
                        Value::Num(n) => Ok(fold_u64(n.to_bits())),
                        _ => Err(self.raise("TypeException", "__hash__() must return a Number")),
                    }
                }
                _ => {
                    let kind = self.kind_name(v);
                    Err(self.raise("TypeException", format!("{} is not hashable", kind)))
                }
            },
        }
    }

    /// Human-readable rendering; instances defer to their `__string__`.
    pub(crate) fn to_display(&mut self, v: Value) -> RtResult<String> {
        self.to_display_depth(v, 0)
    }

    fn to_display_depth(&mut self, v: Value, depth: usize) -> RtResult<String> {
        if depth > 16 {
            return Ok("...".to_string());
        }
        match v {
            Value::Null => Ok("null".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Num(n) => Ok(format_num(n)),
            Value::Handle(h) => Ok(format!("<handle {:#x}>", h)),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => Ok(s.s.clone()),
                Obj::List(items) => {
                    let len = items.len();
                    let mut out = String::from("[");
                    for i in 0..len {
                        let item = match self.heap.get(r) {
                            Obj::List(items) => items.get(i).copied().unwrap_or(Value::Null),
                            _ => Value::Null,
                        };
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.to_display_depth(item, depth + 1)?);
                    }
                    out.push(']');
                    Ok(out)
                }
                Obj::Tuple(items) => {
                    let len = items.len();
                    let mut out = String::from("(");
                    for i in 0..len {
                        let item = match self.heap.get(r) {
                            Obj::Tuple(items) => items[i],
                            _ => Value::Null,
                        };
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.to_display_depth(item, depth + 1)?);
                    }
                    if len == 1 {
                        out.push(',');
                    }
                    out.push(')');
                    Ok(out)
                }
                Obj::Table(t) => {
                    let pairs: Vec<(Value, Value)> = t.iter_live().collect();
                    let mut out = String::from("{");
                    for (i, (k, val)) in pairs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.to_display_depth(*k, depth + 1)?);
                        out.push_str(": ");
                        out.push_str(&self.to_display_depth(*val, depth + 1)?);
                    }
                    out.push('}');
                    Ok(out)
                }
                Obj::Class(c) => Ok(format!("<Class {}>", self.heap.str(c.name))),
                Obj::Module(m) => Ok(format!("<module {}>", self.heap.str(m.name))),
                Obj::Function(f) => Ok(format!("<fun {}>", self.heap.str(f.proto.name))),
                Obj::Native(n) => Ok(format!("<fun {}>", self.heap.str(n.proto.name))),
                Obj::Closure(c) => {
                    let name = match self.heap.get(c.function) {
                        Obj::Function(f) => self.heap.str(f.proto.name).to_string(),
                        _ => String::new(),
                    };
                    Ok(format!("<fun {}>", name))
                }
                Obj::BoundMethod(b) => {
                    let method = b.method;
                    let inner = self.to_display_depth(method, depth + 1)?;
                    Ok(format!("<bound {}>", inner.trim_start_matches('<').trim_end_matches('>')))
                }
                Obj::StackTrace(_) => Ok("<stacktrace>".to_string()),
                Obj::Upvalue(_) => Ok("<upvalue>".to_string()),
                Obj::Instance(_) => {
                    let string_name = self.intern("__string__");
                    let has_string = self
                        .class_of_value(v)
                        .and_then(|c| self.find_method(c, string_name))
                        .is_some();
                    if has_string {
                        self.push(v);
                        let result = self.invoke_and_run("__string__", 0)?;
                        match result {
                            Value::Obj(s) if matches!(self.heap.get(s), Obj::String(_)) => {
                                Ok(self.heap.str(s).to_string())
                            }
                            _ => Err(self
                                .raise("TypeException", "__string__() must return a String")),
                        }
                    } else {
                        Ok(format!("<{} object>", self.kind_name(v)))
                    }
                }
            },
        }
    }

    // === Tables ===

    pub(crate) fn table_get(&mut self, table: ObjRef, key: Value) -> RtResult<Option<Value>> {
        let hash = self.value_hash(key)?;
        'restart: loop {
            let cap = match self.heap.get(table) {
                Obj::Table(t) => t.capacity(),
                _ => 0,
            };
            if cap == 0 {
                return Ok(None);
            }
            let mask = cap - 1;
            let mut idx = hash as usize & mask;
            loop {
                let entry = match self.heap.get(table) {
                    Obj::Table(t) => {
                        if t.capacity() != cap {
                            continue 'restart; // user __eq__ resized the table
                        }
                        t.entry(idx)
                    }
                    _ => return Ok(None),
                };
                match entry {
                    TEntry::Empty => return Ok(None),
                    TEntry::Tombstone => {}
                    TEntry::Full { hash: h, key: k, value } => {
                        if h == hash && self.values_equal(k, key)? {
                            return Ok(Some(value));
                        }
                    }
                }
                idx = (idx + 1) & mask;
            }
        }
    }

    pub(crate) fn table_set(&mut self, table: ObjRef, key: Value, value: Value) -> RtResult {
        let hash = self.value_hash(key)?;
        if let Obj::Table(t) = self.heap.get_mut(table) {
            t.reserve_for_insert();
        }
        'restart: loop {
            let cap = match self.heap.get(table) {
                Obj::Table(t) => t.capacity(),
                _ => return Ok(()),
            };
            let mask = cap - 1;
            let mut idx = hash as usize & mask;
            let mut insert_at: Option<usize> = None;
            loop {
                let entry = match self.heap.get(table) {
                    Obj::Table(t) => {
                        if t.capacity() != cap {
                            continue 'restart;
                        }
                        t.entry(idx)
                    }
                    _ => return Ok(()),
                };
                match entry {
                    TEntry::Empty => {
                        let at = insert_at.unwrap_or(idx);
                        let grew = std::mem::size_of::<TEntry>();
                        if let Obj::Table(t) = self.heap.get_mut(table) {
                            t.place(at, hash, key, value);
                        }
                        self.heap.note_growth(grew);
                        return Ok(());
                    }
                    TEntry::Tombstone => {
                        if insert_at.is_none() {
                            insert_at = Some(idx);
                        }
                    }
                    TEntry::Full { hash: h, key: k, .. } => {
                        if h == hash && self.values_equal(k, key)? {
                            if let Obj::Table(t) = self.heap.get_mut(table) {
                                t.replace_value(idx, value);
                            }
                            return Ok(());
                        }
                    }
                }
                idx = (idx + 1) & mask;
            }
        }
    }

    pub(crate) fn table_delete(&mut self, table: ObjRef, key: Value) -> RtResult<Option<Value>> {
        let hash = self.value_hash(key)?;
        let cap = match self.heap.get(table) {
            Obj::Table(t) => t.capacity(),
            _ => 0,
        };
        if cap == 0 {
            return Ok(None);
        }
        let mask = cap - 1;
        let mut idx = hash as usize & mask;
        loop {
            let entry = match self.heap.get(table) {
                Obj::Table(t) => t.entry(idx),
                _ => return Ok(None),
            };
            match entry {
                TEntry::Empty => return Ok(None),
                TEntry::Tombstone => {}
                TEntry::Full { hash: h, key: k, .. } => {
                    if h == hash && self.values_equal(k, key)? {
                        let removed = match self.heap.get_mut(table) {
                            Obj::Table(t) => t.remove_at(idx),
                            _ => None,
                        };
                        return Ok(removed);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Fast path for interned-string keys (field access on tables): no
    /// user code can run, so plain probing suffices.
    fn table_get_str(&mut self, table: ObjRef, key: ObjRef) -> Option<Value> {
        let hash = self.heap.str_hash(key);
        let cap = match self.heap.get(table) {
            Obj::Table(t) => t.capacity(),
            _ => 0,
        };
        if cap == 0 {
            return None;
        }
        let mask = cap - 1;
        let mut idx = hash as usize & mask;
        loop {
            let entry = match self.heap.get(table) {
                Obj::Table(t) => t.entry(idx),
                _ => return None,
            };
            match entry {
                TEntry::Empty => return None,
                TEntry::Tombstone => {}
                TEntry::Full { hash: h, key: k, value } => {
                    if h == hash && k == Value::Obj(key) {
                        return Some(value);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }
}

fn fold_u64(v: u64) -> u32 {
    (v ^ (v >> 32)) as u32
}

fn render_diags(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// === Dispatch loop ===

/// Runs the fallible part of an opcode; on a raise, unwinds toward the
/// nearest handler (or propagates past `exit_depth`) and restarts the loop.
macro_rules! rt {
    ($self:expr, $depth:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(Raised) => {
                $self.unwind($depth)?;
                continue;
            }
        }
    };
}

impl Vm {
    /// The fetch-decode-execute loop. Runs until the frame at `exit_depth`
    /// returns; the return value is also left on the stack for the caller.
    fn run_dispatch(&mut self, exit_depth: usize) -> RtResult<Value> {
        loop {
            if *TRACE_EXEC {
                let f = self.frame();
                let code = Rc::clone(&f.code);
                let ip = f.ip;
                let (text, _) = disassemble_instruction(&code, &self.heap, ip);
                eprintln!("[exec] {:24} | stack {}", text, self.stack.len());
            }
            let byte = self.fetch_byte();
            let op = match Op::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    rt!(self, exit_depth, Err::<(), _>(self.raise(
                        "Exception",
                        format!("invalid opcode {:#04x}", byte),
                    )));
                    continue;
                }
            };
            match op {
                // === Arithmetic / logic ===
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow => {
                    rt!(self, exit_depth, self.op_arith(op));
                }
                Op::Neg => {
                    let a = self.peek(0);
                    match a {
                        Value::Num(n) => {
                            self.pop();
                            self.push(Value::Num(-n));
                        }
                        _ => {
                            rt!(self, exit_depth, self.op_unary_dunder("__neg__", a));
                        }
                    }
                }
                Op::Not => {
                    let a = self.pop();
                    self.push(Value::Bool(!a.is_truthy()));
                }
                Op::Eq => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let eq = rt!(self, exit_depth, self.values_equal(a, b));
                    self.pop();
                    self.pop();
                    self.push(Value::Bool(eq));
                }
                Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                    rt!(self, exit_depth, self.op_compare(op));
                }
                Op::Is => {
                    let b = self.pop();
                    let a = self.pop();
                    let class = match b.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                        _ => {
                            rt!(self, exit_depth, Err::<(), _>(self.raise(
                                "TypeException",
                                "right operand of 'is' must be a Class",
                            )));
                            continue;
                        }
                    };
                    let result = self
                        .class_of_value(a)
                        .map(|c| self.class_extends(c, class))
                        .unwrap_or(false);
                    self.push(Value::Bool(result));
                }

                // === Stack ===
                Op::Pop => {
                    self.pop();
                }
                Op::PopN => {
                    let n = self.fetch_byte() as usize;
                    let len = self.stack.len().saturating_sub(n);
                    self.stack.truncate(len);
                }
                Op::Dup => {
                    let v = self.peek(0);
                    self.push(v);
                }
                Op::PushNull => self.push(Value::Null),
                Op::GetConst => {
                    let k = self.fetch_u16();
                    let v = self.frame().code.consts[k as usize];
                    self.push(v);
                }

                // === Variables ===
                Op::GetLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                Op::SetLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frame().base;
                    let v = self.peek(0);
                    self.stack[base + slot] = v;
                }
                Op::GetUpvalue => {
                    let idx = self.fetch_byte() as usize;
                    let upvalue = self.cur_upvalue(idx);
                    let v = self.read_upvalue(upvalue);
                    self.push(v);
                }
                Op::SetUpvalue => {
                    let idx = self.fetch_byte() as usize;
                    let upvalue = self.cur_upvalue(idx);
                    let v = self.peek(0);
                    self.write_upvalue(upvalue, v);
                }
                Op::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Op::GetGlobal => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_get_global(sym));
                }
                Op::SetGlobal => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_set_global(sym));
                }
                Op::DefineGlobal => {
                    let sym = self.fetch_u16();
                    let name = self.symbol_name(sym);
                    let v = self.pop();
                    let module = self.frame().module;
                    self.module_define(module, name, v);
                }

                // === Fields / subscript ===
                Op::GetField => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_get_field(sym));
                }
                Op::SetField => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_set_field(sym));
                }
                Op::SubscrGet => {
                    rt!(self, exit_depth, self.op_subscr_get());
                }
                Op::SubscrSet => {
                    rt!(self, exit_depth, self.op_subscr_set());
                }

                // === Calls ===
                Op::Call => {
                    let argc = self.fetch_byte() as usize;
                    rt!(self, exit_depth, self.call_value(argc));
                }
                Op::Call0 | Op::Call1 | Op::Call2 | Op::Call3 | Op::Call4 | Op::Call5
                | Op::Call6 | Op::Call7 | Op::Call8 | Op::Call9 | Op::Call10 => {
                    let argc = op.inline_argc().unwrap_or(0) as usize;
                    rt!(self, exit_depth, self.call_value(argc));
                }
                Op::CallUnpack => {
                    let argc = self.fetch_byte() as usize;
                    let argc = rt!(self, exit_depth, self.spread_last_arg(argc));
                    rt!(self, exit_depth, self.call_value(argc));
                }
                Op::Invoke => {
                    let argc = self.fetch_byte() as usize;
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_invoke(sym, argc));
                }
                Op::Invoke0 | Op::Invoke1 | Op::Invoke2 | Op::Invoke3 | Op::Invoke4
                | Op::Invoke5 | Op::Invoke6 | Op::Invoke7 | Op::Invoke8 | Op::Invoke9
                | Op::Invoke10 => {
                    let argc = op.inline_argc().unwrap_or(0) as usize;
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_invoke(sym, argc));
                }
                Op::InvokeUnpack => {
                    let argc = self.fetch_byte() as usize;
                    let sym = self.fetch_u16();
                    let argc = rt!(self, exit_depth, self.spread_last_arg(argc));
                    rt!(self, exit_depth, self.op_invoke(sym, argc));
                }
                Op::Super => {
                    let argc = self.fetch_byte() as usize;
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_super(sym, argc));
                }
                Op::Super0 | Op::Super1 | Op::Super2 | Op::Super3 | Op::Super4 | Op::Super5
                | Op::Super6 | Op::Super7 | Op::Super8 | Op::Super9 | Op::Super10 => {
                    let argc = op.inline_argc().unwrap_or(0) as usize;
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_super(sym, argc));
                }
                Op::SuperUnpack => {
                    let argc = self.fetch_byte() as usize;
                    let sym = self.fetch_u16();
                    let superclass = self.pop();
                    let argc = rt!(self, exit_depth, self.spread_last_arg(argc));
                    self.push(superclass);
                    rt!(self, exit_depth, self.op_super(sym, argc));
                }
                Op::SuperBind => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_super_bind(sym));
                }
                Op::Return => {
                    let ret = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    self.handlers.truncate(frame.handler_base);
                    self.stack.truncate(frame.base);
                    self.push(ret);
                    if self.frames.len() == exit_depth {
                        return Ok(ret);
                    }
                }

                // === Closures / classes ===
                Op::Closure => {
                    let k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_closure(k));
                }
                Op::NewClass => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_new_class(sym, false));
                }
                Op::NewSubclass => {
                    let sym = self.fetch_u16();
                    rt!(self, exit_depth, self.op_new_class(sym, true));
                }
                Op::DefMethod => {
                    let sym = self.fetch_u16();
                    let name = self.symbol_name(sym);
                    let method = self.pop();
                    let class = self.peek(0);
                    if let Some(class) = class.as_obj() {
                        let hash = self.heap.str_hash(name);
                        if let Obj::Class(c) = self.heap.get_mut(class) {
                            c.methods.insert(name, hash, method);
                        }
                    }
                }
                Op::NatMethod => {
                    let sym = self.fetch_u16();
                    let k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_nat_method(sym, k));
                }
                Op::Native => {
                    let k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_native(k));
                }

                // === Control flow ===
                Op::Jump => {
                    let off = self.fetch_u16() as i16;
                    if off < 0 && self.interrupt.swap(false, Ordering::Relaxed) {
                        rt!(self, exit_depth, Err::<(), _>(
                            self.raise("ProgramInterrupt", "interrupted")
                        ));
                        continue;
                    }
                    self.jump(off);
                }
                Op::JumpIfTrue => {
                    let off = self.fetch_u16() as i16;
                    if self.pop().is_truthy() {
                        self.jump(off);
                    }
                }
                Op::JumpIfFalse => {
                    let off = self.fetch_u16() as i16;
                    if !self.pop().is_truthy() {
                        self.jump(off);
                    }
                }
                Op::ForIter => {
                    rt!(self, exit_depth, self.op_for_iter());
                }
                Op::ForNext => {
                    let off = self.fetch_u16() as i16;
                    rt!(self, exit_depth, self.op_for_next(off));
                }
                Op::End => {
                    // Placeholders are rewritten before execution; reaching
                    // one is a compiler bug surfaced as a plain exception.
                    let _ = self.fetch_u16();
                    rt!(self, exit_depth, Err::<(), _>(self.raise(
                        "Exception",
                        "unexpected end instruction",
                    )));
                }

                // === Exception handling ===
                Op::SetupExcept | Op::SetupEnsure => {
                    let off = self.fetch_u16() as i16;
                    let target = (self.frame().ip as i64 + off as i64) as usize;
                    self.handlers.push(Handler {
                        is_ensure: op == Op::SetupEnsure,
                        target,
                        depth: self.stack.len(),
                    });
                }
                Op::PopHandler => {
                    self.handlers.pop();
                }
                Op::EndHandler => {
                    let cause = self.pop();
                    let _exc = self.pop();
                    if cause.is_truthy() {
                        // The region ended with the exception unhandled:
                        // keep unwinding with the original trace.
                        rt!(self, exit_depth, Err::<(), _>(self.raise_value(cause)));
                    }
                }
                Op::Raise => {
                    let v = self.pop();
                    rt!(self, exit_depth, Err::<(), _>(self.raise_value(v)));
                }

                // === Collections ===
                Op::NewList => {
                    let list = self.alloc(Obj::List(Vec::new()));
                    self.push(Value::Obj(list));
                }
                Op::AppendList => {
                    let v = self.pop();
                    let list = self.peek(0);
                    if let Some(r) = list.as_obj() {
                        self.heap.note_growth(std::mem::size_of::<Value>());
                        if let Obj::List(items) = self.heap.get_mut(r) {
                            items.push(v);
                        }
                    }
                }
                Op::NewTuple => {
                    let n = self.fetch_byte() as usize;
                    let start = self.stack.len() - n;
                    let items: Vec<Value> = self.stack[start..].to_vec();
                    let tuple = if n == 0 {
                        self.empty_tuple
                    } else {
                        self.alloc(Obj::Tuple(items.into_boxed_slice()))
                    };
                    self.stack.truncate(start);
                    self.push(Value::Obj(tuple));
                }
                Op::NewTable => {
                    let table = self.alloc(Obj::Table(crate::table::ValueTable::new()));
                    self.push(Value::Obj(table));
                }
                Op::Unpack => {
                    let n = self.fetch_byte() as usize;
                    rt!(self, exit_depth, self.op_unpack(n));
                }

                // === Imports ===
                Op::Import => {
                    let k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_import(k, None, true));
                }
                Op::ImportFrom => {
                    let k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_import(k, None, false));
                }
                Op::ImportAs => {
                    let k = self.fetch_u16();
                    let alias = self.fetch_u16();
                    rt!(self, exit_depth, self.op_import(k, Some(alias), true));
                }
                Op::ImportName => {
                    let k = self.fetch_u16();
                    let name_k = self.fetch_u16();
                    rt!(self, exit_depth, self.op_import_name(k, name_k));
                }
            }
        }
    }

    fn jump(&mut self, off: i16) {
        let f = self.frames.last_mut().unwrap();
        f.ip = (f.ip as i64 + off as i64) as usize;
    }

    fn symbol_name(&self, sym: u16) -> ObjRef {
        let code = self.frame().code.clone();
        let k = code.symbol_constant(sym);
        match code.consts[k as usize] {
            Value::Obj(r) => r,
            _ => ObjRef(u32::MAX),
        }
    }

    fn cur_upvalue(&self, idx: usize) -> ObjRef {
        match self.heap.get(self.frame().closure) {
            Obj::Closure(c) => c.upvalues[idx],
            _ => ObjRef(u32::MAX),
        }
    }

    // === Operator implementations ===

    fn op_arith(&mut self, op: Op) -> RtResult {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let result = match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                Op::Mod => x % y,
                Op::Pow => x.powf(y),
                _ => 0.0,
            };
            self.pop();
            self.pop();
            self.push(Value::Num(result));
            return Ok(());
        }
        if op == Op::Add {
            if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                if matches!(self.heap.get(ra), Obj::String(_))
                    && matches!(self.heap.get(rb), Obj::String(_))
                {
                    let mut s = self.heap.str(ra).to_string();
                    s.push_str(self.heap.str(rb));
                    let r = self.intern(&s);
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(r));
                    return Ok(());
                }
            }
        }
        let dunder = match op {
            Op::Add => "__add__",
            Op::Sub => "__sub__",
            Op::Mul => "__mul__",
            Op::Div => "__div__",
            Op::Mod => "__mod__",
            Op::Pow => "__pow__",
            _ => "__add__",
        };
        self.op_binary_dunder(dunder, a, b, op)
    }

    fn op_compare(&mut self, op: Op) -> RtResult {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let result = match op {
                Op::Lt => x < y,
                Op::Le => x <= y,
                Op::Gt => x > y,
                Op::Ge => x >= y,
                _ => false,
            };
            self.pop();
            self.pop();
            self.push(Value::Bool(result));
            return Ok(());
        }
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            if matches!(self.heap.get(ra), Obj::String(_))
                && matches!(self.heap.get(rb), Obj::String(_))
            {
                let ord = self.heap.str(ra).as_bytes().cmp(self.heap.str(rb).as_bytes());
                let result = match op {
                    Op::Lt => ord.is_lt(),
                    Op::Le => ord.is_le(),
                    Op::Gt => ord.is_gt(),
                    Op::Ge => ord.is_ge(),
                    _ => false,
                };
                self.pop();
                self.pop();
                self.push(Value::Bool(result));
                return Ok(());
            }
        }
        let dunder = match op {
            Op::Lt => "__lt__",
            Op::Le => "__le__",
            Op::Gt => "__gt__",
            Op::Ge => "__ge__",
            _ => "__lt__",
        };
        self.op_binary_dunder(dunder, a, b, op)
    }

    /// Reshapes a failing binary operator into a method invocation on the
    /// left operand: the operands already sit in invoke position.
    fn op_binary_dunder(&mut self, name: &str, a: Value, b: Value, op: Op) -> RtResult {
        let name_ref = self.intern(name);
        let method = self
            .class_of_value(a)
            .and_then(|c| self.find_method(c, name_ref));
        match method {
            Some(method) => {
                // [a, b] is exactly [receiver, arg]; the call result
                // replaces both.
                self.call_callable(method, 1)?;
                Ok(())
            }
            None => {
                let ka = self.kind_name(a);
                let kb = self.kind_name(b);
                Err(self.raise(
                    "TypeException",
                    format!("unsupported operands for {:?}: {} and {}", op, ka, kb),
                ))
            }
        }
    }

    fn op_unary_dunder(&mut self, name: &str, a: Value) -> RtResult {
        let name_ref = self.intern(name);
        let method = self
            .class_of_value(a)
            .and_then(|c| self.find_method(c, name_ref));
        match method {
            Some(method) => {
                self.call_callable(method, 0)?;
                Ok(())
            }
            None => {
                let kind = self.kind_name(a);
                Err(self.raise("TypeException", format!("cannot negate {}", kind)))
            }
        }
    }

    // === Globals ===

    fn op_get_global(&mut self, sym: u16) -> RtResult {
        let code = self.cur_code();
        let module = self.frame().module;
        let cache = code.symbols[sym as usize].cache.get();
        if let SymCache::Global { module: m, slot } = cache {
            if m == module {
                let v = match self.heap.get(module) {
                    Obj::Module(mo) => mo.get_global(slot),
                    _ => Value::Null,
                };
                self.push(v);
                return Ok(());
            }
        }
        let name = self.symbol_name(sym);
        match self.module_lookup(module, name) {
            Some((slot, v)) => {
                code.symbols[sym as usize].cache.set(SymCache::Global { module, slot });
                self.push(v);
                Ok(())
            }
            None => {
                let name = self.heap.str(name).to_string();
                Err(self.raise("NameException", format!("name '{}' is not defined", name)))
            }
        }
    }

    fn op_set_global(&mut self, sym: u16) -> RtResult {
        let code = self.cur_code();
        let module = self.frame().module;
        let v = self.peek(0);
        let cache = code.symbols[sym as usize].cache.get();
        if let SymCache::Global { module: m, slot } = cache {
            if m == module {
                if let Obj::Module(mo) = self.heap.get_mut(module) {
                    mo.globals[slot as usize] = v;
                }
                return Ok(());
            }
        }
        let name = self.symbol_name(sym);
        match self.module_lookup(module, name) {
            Some((slot, _)) => {
                code.symbols[sym as usize].cache.set(SymCache::Global { module, slot });
                if let Obj::Module(mo) = self.heap.get_mut(module) {
                    mo.globals[slot as usize] = v;
                }
                Ok(())
            }
            None => {
                let name = self.heap.str(name).to_string();
                Err(self.raise("NameException", format!("name '{}' is not defined", name)))
            }
        }
    }

    // === Fields ===

    fn op_get_field(&mut self, sym: u16) -> RtResult {
        let code = self.cur_code();
        let receiver = self.peek(0);
        let cache = code.symbols[sym as usize].cache.get();
        match (cache, receiver) {
            (SymCache::Field { class, slot }, Value::Obj(r)) => {
                if self.heap.class_of(r) == Some(class) {
                    if let Obj::Instance(i) = self.heap.get(r) {
                        if let Some(v) = i.get_slot(slot) {
                            self.pop();
                            self.push(v);
                            return Ok(());
                        }
                        // Slot unset on this instance: fall through to the
                        // full lookup.
                    }
                }
            }
            (SymCache::BoundMethod { class, method }, _) => {
                if self.class_of_value(receiver) == Some(class) {
                    let bound =
                        self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
                    self.pop();
                    self.push(Value::Obj(bound));
                    return Ok(());
                }
            }
            _ => {}
        }

        let name = self.symbol_name(sym);
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(_) => {
                    let class = self.heap.class_of(r).unwrap();
                    let hash = self.heap.str_hash(name);
                    let slot = match self.heap.get(class) {
                        Obj::Class(c) => c.field_layout.get(name, hash).copied(),
                        _ => None,
                    };
                    if let Some(slot) = slot {
                        if let Obj::Instance(i) = self.heap.get(r) {
                            if let Some(v) = i.get_slot(slot) {
                                code.symbols[sym as usize]
                                    .cache
                                    .set(SymCache::Field { class, slot });
                                self.pop();
                                self.push(v);
                                return Ok(());
                            }
                        }
                    }
                    self.field_to_bound_method(code, sym, name, receiver, class)
                }
                Obj::Module(_) => {
                    match self.module_lookup(r, name) {
                        Some((slot, v)) => {
                            code.symbols[sym as usize]
                                .cache
                                .set(SymCache::Global { module: r, slot });
                            self.pop();
                            self.push(v);
                            Ok(())
                        }
                        None => {
                            let module_name = match self.heap.get(r) {
                                Obj::Module(m) => self.heap.str(m.name).to_string(),
                                _ => String::new(),
                            };
                            let name = self.heap.str(name).to_string();
                            Err(self.raise(
                                "NameException",
                                format!("module {} has no name '{}'", module_name, name),
                            ))
                        }
                    }
                }
                Obj::Table(_) => {
                    if let Some(v) = self.table_get_str(r, name) {
                        self.pop();
                        self.push(v);
                        return Ok(());
                    }
                    let class = self.core.table;
                    self.field_to_bound_method(code, sym, name, receiver, class)
                }
                _ => {
                    let class = self.class_of_value(receiver).unwrap_or(self.core.exception);
                    self.field_to_bound_method(code, sym, name, receiver, class)
                }
            },
            _ => {
                let class = match self.class_of_value(receiver) {
                    Some(c) => c,
                    None => {
                        let kind = self.kind_name(receiver);
                        return Err(self.raise(
                            "FieldException",
                            format!("{} has no fields", kind),
                        ));
                    }
                };
                self.field_to_bound_method(code, sym, name, receiver, class)
            }
        }
    }

    /// Field miss: fall back to the method chain and produce a bound
    /// method.
    fn field_to_bound_method(
        &mut self,
        code: Rc<Code>,
        sym: u16,
        name: ObjRef,
        receiver: Value,
        class: ObjRef,
    ) -> RtResult {
        match self.find_method(class, name) {
            Some(method) => {
                code.symbols[sym as usize].cache.set(SymCache::BoundMethod { class, method });
                let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => {
                let kind = self.kind_name(receiver);
                let name = self.heap.str(name).to_string();
                Err(self.raise(
                    "FieldException",
                    format!("{} has no field '{}'", kind, name),
                ))
            }
        }
    }

    fn op_set_field(&mut self, sym: u16) -> RtResult {
        let code = self.cur_code();
        let receiver = self.pop();
        let value = self.peek(0);
        let cache = code.symbols[sym as usize].cache.get();
        if let (SymCache::Field { class, slot }, Value::Obj(r)) = (cache, receiver) {
            if self.heap.class_of(r) == Some(class) {
                self.heap.note_growth(std::mem::size_of::<Value>());
                if let Obj::Instance(i) = self.heap.get_mut(r) {
                    i.set_slot(slot, value);
                    return Ok(());
                }
            }
        }
        let name = self.symbol_name(sym);
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(_) => {
                    let class = self.heap.class_of(r).unwrap();
                    let slot = self.field_slot(class, name);
                    code.symbols[sym as usize].cache.set(SymCache::Field { class, slot });
                    self.heap.note_growth(std::mem::size_of::<Value>());
                    if let Obj::Instance(i) = self.heap.get_mut(r) {
                        i.set_slot(slot, value);
                    }
                    Ok(())
                }
                Obj::Module(_) => {
                    self.module_define(r, name, value);
                    Ok(())
                }
                Obj::Table(_) => self.table_set(r, Value::Obj(name), value),
                _ => {
                    let kind = self.kind_name(receiver);
                    Err(self.raise(
                        "FieldException",
                        format!("cannot set fields on {}", kind),
                    ))
                }
            },
            _ => {
                let kind = self.kind_name(receiver);
                Err(self.raise("FieldException", format!("cannot set fields on {}", kind)))
            }
        }
    }

    // === Subscripts ===

    fn op_subscr_get(&mut self) -> RtResult {
        let index = self.peek(0);
        let object = self.peek(1);
        match object {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => {
                    let len = items.len();
                    let i = self.check_index(index, len)?;
                    let v = match self.heap.get(r) {
                        Obj::List(items) => items[i],
                        _ => Value::Null,
                    };
                    self.pop();
                    self.pop();
                    self.push(v);
                    Ok(())
                }
                Obj::Tuple(items) => {
                    let len = items.len();
                    let i = self.check_index(index, len)?;
                    let v = match self.heap.get(r) {
                        Obj::Tuple(items) => items[i],
                        _ => Value::Null,
                    };
                    self.pop();
                    self.pop();
                    self.push(v);
                    Ok(())
                }
                Obj::String(s) => {
                    let len = s.s.len();
                    let i = self.check_index(index, len)?;
                    let byte = self.heap.str(r).as_bytes()[i];
                    let one = String::from_utf8_lossy(&[byte]).into_owned();
                    let v = self.intern(&one);
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(v));
                    Ok(())
                }
                Obj::Table(_) => {
                    let v = self.table_get(r, index)?;
                    match v {
                        Some(v) => {
                            self.pop();
                            self.pop();
                            self.push(v);
                            Ok(())
                        }
                        None => {
                            let key = self.to_display(index)?;
                            Err(self.raise(
                                "FieldException",
                                format!("no such key: {}", key),
                            ))
                        }
                    }
                }
                Obj::Instance(_) => {
                    // [object, index] is invoke position for __get__.
                    let v = self.invoke_and_run("__get__", 1)?;
                    self.push(v);
                    Ok(())
                }
                _ => {
                    let kind = self.kind_name(object);
                    Err(self.raise("TypeException", format!("{} is not subscriptable", kind)))
                }
            },
            _ => {
                let kind = self.kind_name(object);
                Err(self.raise("TypeException", format!("{} is not subscriptable", kind)))
            }
        }
    }

    fn op_subscr_set(&mut self) -> RtResult {
        let index = self.pop();
        let object = self.pop();
        let value = self.peek(0);
        match object {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => {
                    let len = items.len();
                    let i = self.check_index(index, len)?;
                    if let Obj::List(items) = self.heap.get_mut(r) {
                        items[i] = value;
                    }
                    Ok(())
                }
                Obj::Table(_) => self.table_set(r, index, value),
                Obj::Instance(_) => {
                    let value = self.pop();
                    self.push(object);
                    self.push(index);
                    self.push(value);
                    let result = self.invoke_and_run("__set__", 2)?;
                    self.push(result);
                    Ok(())
                }
                Obj::Tuple(_) => {
                    Err(self.raise("TypeException", "Tuples are immutable"))
                }
                _ => {
                    let kind = self.kind_name(object);
                    Err(self.raise(
                        "TypeException",
                        format!("{} does not support subscript assignment", kind),
                    ))
                }
            },
            _ => {
                let kind = self.kind_name(object);
                Err(self.raise(
                    "TypeException",
                    format!("{} does not support subscript assignment", kind),
                ))
            }
        }
    }

    pub(crate) fn check_index(&mut self, index: Value, len: usize) -> RtResult<usize> {
        let Value::Num(n) = index else {
            let kind = self.kind_name(index);
            return Err(self.raise("TypeException", format!("index must be a Number, got {}", kind)));
        };
        if !index.is_int() {
            return Err(self.raise("TypeException", "index must be an integer"));
        }
        if n < 0.0 || n >= len as f64 {
            return Err(self.raise(
                "IndexOutOfBoundException",
                format!("index {} out of bounds for length {}", format_num(n), len),
            ));
        }
        Ok(n as usize)
    }

    // === Method dispatch ===

    fn op_invoke(&mut self, sym: u16, argc: usize) -> RtResult<bool> {
        let code = self.cur_code();
        let receiver = self.peek(argc);
        let cache = code.symbols[sym as usize].cache.get();
        if let SymCache::Method { class, method } = cache {
            if self.class_of_value(receiver) == Some(class) {
                return self.call_callable(method, argc);
            }
        }
        let name = self.symbol_name(sym);
        let class = match self.class_of_value(receiver) {
            Some(c) => c,
            None => {
                let name = self.heap.str(name).to_string();
                return Err(self.raise(
                    "MethodException",
                    format!("Handle has no method {}()", name),
                ));
            }
        };
        if let Some(method) = self.find_method(class, name) {
            code.symbols[sym as usize].cache.set(SymCache::Method { class, method });
            return self.call_callable(method, argc);
        }
        // Methods miss: callable instance fields, module members and table
        // entries still dispatch.
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(_) => {
                    let field = self.get_instance_field(r, self.heap.str(name).to_string().as_str());
                    if let Some(f) = field {
                        self.set_at_depth(argc, f);
                        return self.call_value(argc);
                    }
                    self.no_method(receiver, name)
                }
                Obj::Module(_) => match self.module_lookup(r, name) {
                    Some((_, v)) => {
                        self.set_at_depth(argc, v);
                        self.call_value(argc)
                    }
                    None => self.no_method(receiver, name),
                },
                Obj::Table(_) => {
                    if let Some(v) = self.table_get_str(r, name) {
                        self.set_at_depth(argc, v);
                        return self.call_value(argc);
                    }
                    self.no_method(receiver, name)
                }
                _ => self.no_method(receiver, name),
            },
            _ => self.no_method(receiver, name),
        }
    }

    fn no_method(&mut self, receiver: Value, name: ObjRef) -> RtResult<bool> {
        let kind = self.kind_name(receiver);
        let name = self.heap.str(name).to_string();
        Err(self.raise("MethodException", format!("{} has no method {}()", kind, name)))
    }

    fn op_super(&mut self, sym: u16, argc: usize) -> RtResult<bool> {
        let code = self.cur_code();
        let superclass = self.pop();
        let Some(class) = superclass.as_obj().filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
        else {
            return Err(self.raise("TypeException", "superclass must be a Class"));
        };
        let cache = code.symbols[sym as usize].cache.get();
        if let SymCache::Method { class: cached, method } = cache {
            if cached == class {
                return self.call_callable(method, argc);
            }
        }
        let name = self.symbol_name(sym);
        match self.find_method(class, name) {
            Some(method) => {
                code.symbols[sym as usize].cache.set(SymCache::Method { class, method });
                self.call_callable(method, argc)
            }
            None => {
                let class_name = self.class_name(class);
                let name = self.heap.str(name).to_string();
                Err(self.raise(
                    "MethodException",
                    format!("{} has no method {}()", class_name, name),
                ))
            }
        }
    }

    fn op_super_bind(&mut self, sym: u16) -> RtResult {
        let superclass = self.pop();
        let receiver = self.pop();
        let Some(class) = superclass.as_obj().filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
        else {
            return Err(self.raise("TypeException", "superclass must be a Class"));
        };
        let name = self.symbol_name(sym);
        match self.find_method(class, name) {
            Some(method) => {
                self.push(receiver);
                let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => {
                let class_name = self.class_name(class);
                let name = self.heap.str(name).to_string();
                Err(self.raise(
                    "MethodException",
                    format!("{} has no method {}()", class_name, name),
                ))
            }
        }
    }

    // === Closures, classes, natives ===

    fn op_closure(&mut self, k: u16) -> RtResult {
        let function = match self.frame().code.consts[k as usize] {
            Value::Obj(r) => r,
            _ => return Err(self.raise("TypeException", "closure constant must be a function")),
        };
        let count = match self.heap.get(function) {
            Obj::Function(f) => f.upvalue_count as usize,
            _ => return Err(self.raise("TypeException", "closure constant must be a function")),
        };
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let is_local = self.fetch_byte() == 1;
            let index = self.fetch_byte() as usize;
            if is_local {
                let base = self.frame().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                upvalues.push(self.cur_upvalue(index));
            }
        }
        let closure = self.alloc(Obj::Closure(ObjClosure { function, upvalues }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    fn op_new_class(&mut self, sym: u16, with_super: bool) -> RtResult {
        let name = self.symbol_name(sym);
        let superclass = if with_super {
            let sup = self.pop();
            let Some(r) = sup.as_obj().filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
            else {
                let kind = self.kind_name(sup);
                return Err(self.raise(
                    "TypeException",
                    format!("superclass must be a Class, got {}", kind),
                ));
            };
            Some(r)
        } else {
            None
        };
        let class = self.alloc(Obj::Class(crate::object::ObjClass {
            name,
            superclass,
            methods: crate::table::StringMap::new(),
            field_layout: crate::table::StringMap::new(),
            builtin: false,
        }));
        self.push(Value::Obj(class));
        Ok(())
    }

    fn op_nat_method(&mut self, sym: u16, k: u16) -> RtResult {
        let name = self.symbol_name(sym);
        let registry_key = match self.frame().code.consts[k as usize] {
            Value::Obj(r) => self.heap.str(r).to_string(),
            _ => String::new(),
        };
        let module_name = self.cur_module_name();
        let native = self.build_registered_native(&module_name, &registry_key)?;
        let class = self.peek(0);
        if let Some(class) = class.as_obj() {
            let hash = self.heap.str_hash(name);
            if let Obj::Class(c) = self.heap.get_mut(class) {
                c.methods.insert(name, hash, Value::Obj(native));
            }
        }
        Ok(())
    }

    fn op_native(&mut self, k: u16) -> RtResult {
        let name = match self.frame().code.consts[k as usize] {
            Value::Obj(r) => self.heap.str(r).to_string(),
            _ => String::new(),
        };
        let module_name = self.cur_module_name();
        let native = self.build_registered_native(&module_name, &name)?;
        self.push(Value::Obj(native));
        Ok(())
    }

    fn cur_module_name(&self) -> String {
        match self.heap.get(self.frame().module) {
            Obj::Module(m) => self.heap.str(m.name).to_string(),
            _ => String::new(),
        }
    }

    fn build_registered_native(&mut self, module_name: &str, name: &str) -> RtResult<ObjRef> {
        let Some(&(func, arity, vararg, defaults)) =
            self.natives.get(&(module_name.to_string(), name.to_string()))
        else {
            return Err(self.raise(
                "NameException",
                format!("no native registered for {}.{}", module_name, name),
            ));
        };
        let name_ref = self.intern(name);
        self.pins.push(Value::Obj(name_ref));
        let module = self.frame().module;
        let dflts = vec![Value::Null; defaults as usize];
        let native = self.alloc(Obj::Native(crate::object::ObjNative {
            proto: FnProto { name: name_ref, module, arity, vararg, defaults: dflts },
            func,
        }));
        self.pins.pop();
        Ok(native)
    }

    // === Iteration ===

    /// `.iter = .expr.__iter__(.iter)` over the two top stack slots.
    /// Builtin sequences step inline; instances re-enter the interpreter.
    fn op_for_iter(&mut self) -> RtResult {
        let iter = self.peek(0);
        let expr = self.peek(1);
        let next = match expr {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => seq_iter_step(iter, items.len()),
                Obj::Tuple(items) => seq_iter_step(iter, items.len()),
                Obj::String(s) => seq_iter_step(iter, s.s.len()),
                Obj::Table(_) => {
                    let start = match iter {
                        Value::Null => 0,
                        Value::Num(n) => n as usize + 1,
                        _ => 0,
                    };
                    let cap = match self.heap.get(r) {
                        Obj::Table(t) => t.capacity(),
                        _ => 0,
                    };
                    let mut found = Value::Bool(false);
                    for i in start..cap {
                        let full = match self.heap.get(r) {
                            Obj::Table(t) => matches!(t.entry(i), TEntry::Full { .. }),
                            _ => false,
                        };
                        if full {
                            found = Value::Num(i as f64);
                            break;
                        }
                    }
                    found
                }
                Obj::Instance(_) => {
                    self.push(expr);
                    self.push(iter);
                    self.invoke_and_run("__iter__", 1)?
                }
                _ => {
                    let kind = self.kind_name(expr);
                    return Err(self.raise(
                        "TypeException",
                        format!("{} is not iterable", kind),
                    ));
                }
            },
            _ => {
                let kind = self.kind_name(expr);
                return Err(self.raise("TypeException", format!("{} is not iterable", kind)));
            }
        };
        self.set_at_depth(0, next);
        Ok(())
    }

    /// If `.iter` is falsy jump out, else push `.expr.__next__(.iter)`.
    fn op_for_next(&mut self, off: i16) -> RtResult {
        let iter = self.peek(0);
        if !iter.is_truthy() {
            self.jump(off);
            return Ok(());
        }
        let expr = self.peek(1);
        let v = match expr {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => {
                    let i = iter.as_num().unwrap_or(0.0) as usize;
                    items.get(i).copied().unwrap_or(Value::Null)
                }
                Obj::Tuple(items) => {
                    let i = iter.as_num().unwrap_or(0.0) as usize;
                    items.get(i).copied().unwrap_or(Value::Null)
                }
                Obj::String(_) => {
                    let i = iter.as_num().unwrap_or(0.0) as usize;
                    let byte = self.heap.str(r).as_bytes().get(i).copied().unwrap_or(b' ');
                    let one = String::from_utf8_lossy(&[byte]).into_owned();
                    Value::Obj(self.intern(&one))
                }
                Obj::Table(_) => {
                    let i = iter.as_num().unwrap_or(0.0) as usize;
                    match self.heap.get(r) {
                        Obj::Table(t) if i < t.capacity() => match t.entry(i) {
                            TEntry::Full { key, .. } => key,
                            _ => Value::Null,
                        },
                        _ => Value::Null,
                    }
                }
                Obj::Instance(_) => {
                    self.push(expr);
                    self.push(iter);
                    self.invoke_and_run("__next__", 1)?
                }
                _ => Value::Null,
            },
            _ => Value::Null,
        };
        self.push(v);
        Ok(())
    }

    // === Unpack / spread ===

    fn op_unpack(&mut self, n: usize) -> RtResult {
        let v = self.pop();
        let items: Vec<Value> = match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => items.clone(),
                Obj::Tuple(items) => items.to_vec(),
                _ => {
                    self.push(v);
                    let kind = self.kind_name(v);
                    return Err(self.raise(
                        "TypeException",
                        format!("cannot unpack {}", kind),
                    ));
                }
            },
            _ => {
                self.push(v);
                let kind = self.kind_name(v);
                return Err(self.raise("TypeException", format!("cannot unpack {}", kind)));
            }
        };
        if items.len() != n {
            return Err(self.raise(
                "TypeException",
                format!("expected {} values to unpack, got {}", n, items.len()),
            ));
        }
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    /// Spreads the trailing list/tuple argument of a *_UNPACK call; returns
    /// the adjusted argument count.
    fn spread_last_arg(&mut self, argc: usize) -> RtResult<usize> {
        let v = self.pop();
        let items: Vec<Value> = match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::List(items) => items.clone(),
                Obj::Tuple(items) => items.to_vec(),
                _ => {
                    let kind = self.kind_name(v);
                    return Err(self.raise(
                        "TypeException",
                        format!("can only spread List or Tuple, got {}", kind),
                    ));
                }
            },
            _ => {
                let kind = self.kind_name(v);
                return Err(self.raise(
                    "TypeException",
                    format!("can only spread List or Tuple, got {}", kind),
                ));
            }
        };
        let spread = items.len();
        for item in items {
            self.push(item);
        }
        Ok(argc - 1 + spread)
    }

    // === Imports ===

    fn op_import(&mut self, k: u16, alias_k: Option<u16>, bind: bool) -> RtResult {
        let name = match self.frame().code.consts[k as usize] {
            Value::Obj(r) => self.heap.str(r).to_string(),
            _ => String::new(),
        };
        let module = self.import_module(&name)?;
        if bind {
            let bind_name = match alias_k {
                Some(ak) => match self.frame().code.consts[ak as usize] {
                    Value::Obj(r) => r,
                    _ => ObjRef(u32::MAX),
                },
                None => match self.frame().code.consts[k as usize] {
                    Value::Obj(r) => r,
                    _ => ObjRef(u32::MAX),
                },
            };
            let current = self.frame().module;
            self.module_define(current, bind_name, Value::Obj(module));
        }
        self.push(Value::Obj(module));
        Ok(())
    }

    fn op_import_name(&mut self, k: u16, name_k: u16) -> RtResult {
        let module = match self.peek(0) {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Module(_)) => r,
            other => {
                let kind = self.kind_name(other);
                return Err(self.raise("ImportException", format!("not a module: {}", kind)));
            }
        };
        let name = match self.frame().code.consts[name_k as usize] {
            Value::Obj(r) => r,
            _ => ObjRef(u32::MAX),
        };
        match self.module_lookup(module, name) {
            Some((_, v)) => {
                let current = self.frame().module;
                self.module_define(current, name, v);
                Ok(())
            }
            None => {
                let module_name = match self.frame().code.consts[k as usize] {
                    Value::Obj(r) => self.heap.str(r).to_string(),
                    _ => String::new(),
                };
                let name = self.heap.str(name).to_string();
                Err(self.raise(
                    "ImportException",
                    format!("module '{}' has no name '{}'", module_name, name),
                ))
            }
        }
    }
}

/// Iterator stepping for index-based sequences: null starts at 0, a number
/// advances by one, the end yields false.
pub(crate) fn seq_iter_step(iter: Value, len: usize) -> Value {
    match iter {
        Value::Null => {
            if len > 0 {
                Value::Num(0.0)
            } else {
                Value::Bool(false)
            }
        }
        Value::Num(n) => {
            let next = n as usize + 1;
            if next < len {
                Value::Num(next as f64)
            } else {
                Value::Bool(false)
            }
        }
        _ => Value::Bool(false),
    }
}
