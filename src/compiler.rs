// File: src/compiler.rs
//
// Single-pass bytecode compiler for Vesper.
// Walks the AST and emits code directly: lexical scopes with a 256-local
// table per function, upvalue resolution through the enclosing-function
// chain, jump patching, loop and try-handler stacks, and the desugarings
// for for-each, with-blocks and compound/unpacking assignment.

use std::rc::Rc;

use crate::ast::*;
use crate::code::Code;
use crate::errors::Diagnostic;
use crate::object::{FnProto, Obj, ObjFunction};
use crate::opcode::{Op, END_MARK_BREAK, END_MARK_CONTINUE};
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 255;
/// Nested try constructs per function.
pub const MAX_TRY_DEPTH: u8 = 8;

/// Compilation aborts at the first error; the diagnostic is stored on the
/// compiler and returned by the entry point.
type CResult<T = ()> = Result<T, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Ctor,
}

struct Local {
    name: String,
    depth: i32,
    initialized: bool,
    is_upvalue: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct UpvalDesc {
    is_local: bool,
    index: u8,
}

struct LoopState {
    /// Continue target for while/for-each; C-style for patches continue to
    /// the increment clause instead.
    start: usize,
    scope_depth: i32,
    try_depth: u8,
    /// Offsets of End placeholders (mark byte distinguishes break from
    /// continue), rewritten to Jump when the loop finishes.
    ends: Vec<usize>,
}

struct FuncState {
    code: Code,
    locals: Vec<Local>,
    upvalues: Vec<UpvalDesc>,
    scope_depth: i32,
    loops: Vec<LoopState>,
    try_depth: u8,
    kind: FnKind,
    name: String,
    method_name: Option<String>,
    has_superclass: bool,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    cur_stack: i32,
    max_stack: i32,
}

impl FuncState {
    fn new(kind: FnKind, name: String) -> Self {
        Self {
            code: Code::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            try_depth: 0,
            kind,
            name,
            method_name: None,
            has_superclass: false,
            arity: 0,
            vararg: false,
            defaults: Vec::new(),
            cur_stack: 0,
            max_stack: 0,
        }
    }
}

pub struct Compiler<'vm> {
    vm: &'vm mut Vm,
    file: String,
    module: ObjRef,
    states: Vec<FuncState>,
    /// Reused buffer for string escape decoding.
    scratch: String,
    error: Option<Diagnostic>,
}

/// Compiles a module body to its top-level function.
pub fn compile_module(
    vm: &mut Vm,
    file: &str,
    module: ObjRef,
    stmts: &[Stmt],
) -> Result<ObjRef, Diagnostic> {
    let mut compiler = Compiler {
        vm,
        file: file.to_string(),
        module,
        states: Vec::new(),
        scratch: String::new(),
        error: None,
    };
    compiler.states.push(FuncState::new(FnKind::Script, "<main>".to_string()));
    // Slot 0 belongs to the callable itself.
    compiler.state().locals.push(Local {
        name: String::new(),
        depth: 0,
        initialized: true,
        is_upvalue: false,
    });

    let result = compiler.compile_body(stmts);
    match result {
        Ok(()) => {
            let last_line = stmts.last().map(|s| s.line).unwrap_or(1);
            compiler.emit(Op::PushNull, last_line);
            compiler.emit(Op::Return, last_line);
            Ok(compiler.finish_function())
        }
        Err(()) => Err(compiler.error.take().unwrap_or_else(|| {
            Diagnostic::new(&compiler.file, 0, "compilation failed")
        })),
    }
}

impl<'vm> Compiler<'vm> {
    fn state(&mut self) -> &mut FuncState {
        self.states.last_mut().unwrap()
    }

    fn state_ref(&self) -> &FuncState {
        self.states.last().unwrap()
    }

    fn err<T>(&mut self, line: u32, message: impl Into<String>) -> CResult<T> {
        if self.error.is_none() {
            self.error = Some(Diagnostic::new(&self.file, line, message));
        }
        Err(())
    }

    // === Emission ===

    fn emit(&mut self, op: Op, line: u32) {
        let delta = fixed_stack_effect(op);
        self.state().code.write_op(op, line);
        self.track(delta);
    }

    fn emit_byte(&mut self, b: u8, line: u32) {
        self.state().code.write_byte(b, line);
    }

    fn emit_u16(&mut self, v: u16, line: u32) {
        self.state().code.write_u16(v, line);
    }

    fn track(&mut self, delta: i32) {
        let st = self.state();
        st.cur_stack = (st.cur_stack + delta).max(0);
        st.max_stack = st.max_stack.max(st.cur_stack);
    }

    fn offset(&self) -> usize {
        self.state_ref().code.bytes.len()
    }

    fn make_const(&mut self, v: Value, line: u32) -> CResult<u16> {
        match self.state().code.add_constant(v) {
            Some(k) => Ok(k),
            None => self.err(line, "too many constants in one function (max is 65535)"),
        }
    }

    fn string_const(&mut self, s: &str, line: u32) -> CResult<u16> {
        let r = self.vm.intern_pinned(s);
        self.make_const(Value::Obj(r), line)
    }

    fn make_symbol(&mut self, name: &str, line: u32) -> CResult<u16> {
        let k = self.string_const(name, line)?;
        match self.state().code.add_symbol(k) {
            Some(s) => Ok(s),
            None => self.err(line, "too many symbols in one function (max is 65535)"),
        }
    }

    fn emit_const(&mut self, v: Value, line: u32) -> CResult {
        let k = self.make_const(v, line)?;
        self.emit(Op::GetConst, line);
        self.emit_u16(k, line);
        Ok(())
    }

    /// Emits a forward jump; returns the offset of its operand for
    /// patching.
    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit(op, line);
        let at = self.offset();
        self.emit_u16(0xffff, line);
        at
    }

    fn patch_jump(&mut self, operand_at: usize, line: u32) -> CResult {
        // Offsets are relative to the byte after the operand.
        let target = self.offset() as i64 - (operand_at as i64 + 2);
        if target > i16::MAX as i64 {
            return self.err(line, "jump distance too large");
        }
        self.state().code.patch_u16(operand_at, target as i16 as u16);
        Ok(())
    }

    /// Backward jump to `start`.
    fn emit_loop(&mut self, start: usize, line: u32) -> CResult {
        self.emit(Op::Jump, line);
        let offset = start as i64 - (self.offset() as i64 + 2);
        if offset < i16::MIN as i64 {
            return self.err(line, "loop body too large");
        }
        self.emit_u16(offset as i16 as u16, line);
        Ok(())
    }

    // === Scope and variable management ===

    fn enter_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    /// Emits the pops/closes for locals deeper than `depth` without
    /// touching the local table (break/continue paths).
    fn discard_locals_to(&mut self, depth: i32, line: u32) {
        let mut pending = 0usize;
        let to_discard: Vec<bool> = self
            .state_ref()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .map(|l| l.is_upvalue)
            .collect();
        for is_upvalue in to_discard {
            if is_upvalue {
                self.flush_pops(pending, line);
                pending = 0;
                self.emit(Op::CloseUpvalue, line);
            } else {
                pending += 1;
            }
        }
        self.flush_pops(pending, line);
    }

    fn flush_pops(&mut self, count: usize, line: u32) {
        match count {
            0 => {}
            1 => self.emit(Op::Pop, line),
            n => {
                self.emit(Op::PopN, line);
                self.emit_byte(n as u8, line);
                self.track(-(n as i32) + 1); // PopN's fixed effect was -1
            }
        }
    }

    fn exit_scope(&mut self, line: u32) {
        let st = self.state();
        st.scope_depth -= 1;
        let depth = st.scope_depth;
        self.discard_locals_to(depth, line);
        let st = self.state();
        while st.locals.last().map(|l| l.depth > depth).unwrap_or(false) {
            st.locals.pop();
        }
    }

    fn add_local(&mut self, name: &str, line: u32) -> CResult<u8> {
        let st = self.state_ref();
        if st.locals.len() >= MAX_LOCALS {
            return self.err(line, "too many local variables in function (max is 256)");
        }
        let depth = st.scope_depth;
        let duplicate = st
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name);
        if duplicate && !name.starts_with('.') {
            return self.err(line, format!("variable '{}' already declared in this scope", name));
        }
        let st = self.state();
        st.locals.push(Local { name: name.to_string(), depth, initialized: false, is_upvalue: false });
        Ok((st.locals.len() - 1) as u8)
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.state().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn resolve_local(&self, state_idx: usize, name: &str) -> Option<(u8, bool)> {
        let st = &self.states[state_idx];
        for (i, local) in st.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i as u8, local.initialized));
            }
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool, line: u32) -> CResult<u8> {
        let desc = UpvalDesc { is_local, index };
        if let Some(i) = self.states[state_idx].upvalues.iter().position(|u| *u == desc) {
            return Ok(i as u8);
        }
        if self.states[state_idx].upvalues.len() >= MAX_UPVALUES {
            return self.err(line, "too many captured variables in function");
        }
        self.states[state_idx].upvalues.push(desc);
        Ok((self.states[state_idx].upvalues.len() - 1) as u8)
    }

    /// Walks outward through the enclosing compilers; the first enclosing
    /// local found is captured and intermediate functions get pass-through
    /// upvalues.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str, line: u32) -> CResult<Option<u8>> {
        if state_idx == 0 {
            return Ok(None);
        }
        let parent = state_idx - 1;
        if let Some((slot, initialized)) = self.resolve_local(parent, name) {
            if !initialized {
                return self.err(line, format!("cannot read '{}' in its own initializer", name));
            }
            self.states[parent].locals[slot as usize].is_upvalue = true;
            let up = self.add_upvalue(state_idx, slot, true, line)?;
            return Ok(Some(up));
        }
        if let Some(up) = self.resolve_upvalue(parent, name, line)? {
            let up = self.add_upvalue(state_idx, up, false, line)?;
            return Ok(Some(up));
        }
        Ok(None)
    }

    fn compile_var_read(&mut self, name: &str, line: u32) -> CResult {
        let state_idx = self.states.len() - 1;
        if let Some((slot, initialized)) = self.resolve_local(state_idx, name) {
            if !initialized {
                return self.err(line, format!("cannot read '{}' in its own initializer", name));
            }
            self.emit(Op::GetLocal, line);
            self.emit_byte(slot, line);
            return Ok(());
        }
        if let Some(up) = self.resolve_upvalue(state_idx, name, line)? {
            self.emit(Op::GetUpvalue, line);
            self.emit_byte(up, line);
            return Ok(());
        }
        let sym = self.make_symbol(name, line)?;
        self.emit(Op::GetGlobal, line);
        self.emit_u16(sym, line);
        Ok(())
    }

    /// Emits the store for a name; the assigned value stays on the stack.
    fn compile_var_write(&mut self, name: &str, line: u32) -> CResult {
        let state_idx = self.states.len() - 1;
        if let Some((slot, _)) = self.resolve_local(state_idx, name) {
            self.emit(Op::SetLocal, line);
            self.emit_byte(slot, line);
            return Ok(());
        }
        if let Some(up) = self.resolve_upvalue(state_idx, name, line)? {
            self.emit(Op::SetUpvalue, line);
            self.emit_byte(up, line);
            return Ok(());
        }
        let sym = self.make_symbol(name, line)?;
        self.emit(Op::SetGlobal, line);
        self.emit_u16(sym, line);
        Ok(())
    }

    /// True when declarations at the current position bind module globals.
    fn at_module_scope(&self) -> bool {
        self.states.len() == 1 && self.state_ref().scope_depth == 0
    }

    // === Statements ===

    fn compile_body(&mut self, stmts: &[Stmt]) -> CResult {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CResult {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.compile_expr(e)?;
                self.emit(Op::Pop, line);
                Ok(())
            }
            StmtKind::VarDecl { names, init, is_static } => {
                self.compile_var_decl(names, init.as_ref(), *is_static, line)
            }
            StmtKind::FunDecl { name, fun, is_static } => {
                if self.at_module_scope() && !is_static {
                    self.compile_function(fun, name.clone(), FnKind::Function, false)?;
                    let sym = self.make_symbol(name, line)?;
                    self.emit(Op::DefineGlobal, line);
                    self.emit_u16(sym, line);
                    Ok(())
                } else {
                    if *is_static && !self.at_module_scope() {
                        return self.err(line, "'static' is only allowed at module scope");
                    }
                    // Declare first so the function can call itself.
                    self.add_local(name, line)?;
                    self.mark_initialized();
                    self.compile_function(fun, name.clone(), FnKind::Function, false)
                }
            }
            StmtKind::NativeDecl { name, arity: _ } => {
                let k = self.string_const(name, line)?;
                self.emit(Op::Native, line);
                self.emit_u16(k, line);
                if self.at_module_scope() {
                    let sym = self.make_symbol(name, line)?;
                    self.emit(Op::DefineGlobal, line);
                    self.emit_u16(sym, line);
                } else {
                    self.add_local(name, line)?;
                    self.mark_initialized();
                }
                Ok(())
            }
            StmtKind::ClassDecl { name, superclass, methods, is_static } => {
                self.compile_class(name, superclass.as_ref(), methods, *is_static, line)
            }
            StmtKind::Block(stmts) => {
                self.enter_scope();
                self.compile_body(stmts)?;
                self.exit_scope(line);
                Ok(())
            }
            StmtKind::If { cond, then, orelse } => {
                self.compile_expr(cond)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse, line);
                self.enter_scope();
                self.compile_body(then)?;
                self.exit_scope(line);
                if orelse.is_empty() {
                    self.patch_jump(else_jump, line)?;
                } else {
                    let end_jump = self.emit_jump(Op::Jump, line);
                    self.patch_jump(else_jump, line)?;
                    self.enter_scope();
                    self.compile_body(orelse)?;
                    self.exit_scope(line);
                    self.patch_jump(end_jump, line)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let start = self.offset();
                let scope_depth = self.state_ref().scope_depth;
                let try_depth = self.state_ref().try_depth;
                self.state().loops.push(LoopState {
                    start,
                    scope_depth,
                    try_depth,
                    ends: Vec::new(),
                });
                self.compile_expr(cond)?;
                let exit_jump = self.emit_jump(Op::JumpIfFalse, line);
                self.enter_scope();
                self.compile_body(body)?;
                self.exit_scope(line);
                self.emit_loop(start, line)?;
                self.patch_jump(exit_jump, line)?;
                self.finish_loop(start, line)
            }
            StmtKind::For { init, cond, incr, body } => {
                self.enter_scope();
                if let Some(init) = init {
                    self.compile_stmt(init)?;
                }
                let start = self.offset();
                let scope_depth = self.state_ref().scope_depth;
                let try_depth = self.state_ref().try_depth;
                self.state().loops.push(LoopState {
                    start,
                    scope_depth,
                    try_depth,
                    ends: Vec::new(),
                });
                let exit_jump = match cond {
                    Some(cond) => {
                        self.compile_expr(cond)?;
                        Some(self.emit_jump(Op::JumpIfFalse, line))
                    }
                    None => None,
                };
                self.enter_scope();
                self.compile_body(body)?;
                self.exit_scope(line);
                let incr_pos = self.offset();
                if let Some(incr) = incr {
                    self.compile_stmt(incr)?;
                }
                self.emit_loop(start, line)?;
                if let Some(exit_jump) = exit_jump {
                    self.patch_jump(exit_jump, line)?;
                }
                self.finish_loop(incr_pos, line)?;
                self.exit_scope(line);
                Ok(())
            }
            StmtKind::ForEach { name, iterable, body } => {
                self.compile_foreach(name, iterable, body, line)
            }
            StmtKind::Return(value) => {
                match self.state_ref().kind {
                    FnKind::Script => return self.err(line, "cannot return from top-level code"),
                    FnKind::Ctor => {
                        return self.err(line, "cannot return from a constructor")
                    }
                    _ => {}
                }
                match value {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit(Op::PushNull, line),
                }
                self.emit(Op::Return, line);
                Ok(())
            }
            StmtKind::Break => self.compile_loop_exit(END_MARK_BREAK, line),
            StmtKind::Continue => self.compile_loop_exit(END_MARK_CONTINUE, line),
            StmtKind::Raise(e) => {
                self.compile_expr(e)?;
                self.emit(Op::Raise, line);
                Ok(())
            }
            StmtKind::Try { body, excepts, ensure } => {
                self.compile_try(body, excepts, ensure.as_deref(), line)
            }
            StmtKind::With { expr, var, body } => self.compile_with(expr, var, body, line),
            StmtKind::Import { module, names, alias } => {
                self.compile_import(module, names, alias.as_deref(), line)
            }
            StmtKind::Assign { targets, op, value } => {
                self.compile_assign(targets, *op, value, line)
            }
        }
    }

    fn compile_var_decl(
        &mut self,
        names: &[String],
        init: Option<&Expr>,
        is_static: bool,
        line: u32,
    ) -> CResult {
        if is_static && !self.at_module_scope() {
            return self.err(line, "'static' is only allowed at module scope");
        }
        // `static` forces a module-level local binding (file private).
        let as_global = self.at_module_scope() && !is_static;
        if names.len() == 1 {
            if as_global {
                match init {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit(Op::PushNull, line),
                }
                let sym = self.make_symbol(&names[0], line)?;
                self.emit(Op::DefineGlobal, line);
                self.emit_u16(sym, line);
            } else {
                // Declared but uninitialized until the initializer runs, so
                // `var x = x` is rejected.
                self.add_local(&names[0], line)?;
                match init {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit(Op::PushNull, line),
                }
                self.mark_initialized();
            }
            return Ok(());
        }

        // Unpacking declaration.
        let init = init.ok_or(())?;
        if !as_global {
            for name in names {
                self.add_local(name, line)?;
            }
        }
        self.compile_unpack_rvalue(init, names.len(), line)?;
        if as_global {
            // Elements were pushed left-to-right; define in reverse so each
            // name pops its own element.
            for name in names.iter().rev() {
                let sym = self.make_symbol(name, line)?;
                self.emit(Op::DefineGlobal, line);
                self.emit_u16(sym, line);
            }
        } else {
            // The pushed elements already occupy the reserved local slots.
            let st = self.state();
            let n = names.len();
            let len = st.locals.len();
            for local in &mut st.locals[len - n..] {
                local.initialized = true;
            }
        }
        Ok(())
    }

    /// Pushes exactly `n` values for an unpacking assignment. A literal
    /// tuple/list of matching size is compiled element by element (const
    /// unpack elision); anything else goes through Unpack.
    fn compile_unpack_rvalue(&mut self, value: &Expr, n: usize, line: u32) -> CResult {
        match &value.kind {
            ExprKind::TupleLit(items) | ExprKind::ListLit(items) if items.len() == n => {
                for item in items {
                    self.compile_expr(item)?;
                }
                Ok(())
            }
            _ => {
                self.compile_expr(value)?;
                self.emit(Op::Unpack, line);
                self.emit_byte(n as u8, line);
                self.track(n as i32 - 1);
                Ok(())
            }
        }
    }

    fn compile_assign(
        &mut self,
        targets: &[Expr],
        op: Option<BinOp>,
        value: &Expr,
        line: u32,
    ) -> CResult {
        if targets.len() > 1 {
            if targets.len() > u8::MAX as usize {
                return self.err(line, "too many assignment targets");
            }
            self.compile_unpack_rvalue(value, targets.len(), line)?;
            // Assign right-to-left so each target pops its own element.
            for target in targets.iter().rev() {
                self.compile_store(target)?;
                self.emit(Op::Pop, line);
            }
            return Ok(());
        }

        let target = &targets[0];
        match op {
            None => self.compile_expr(value)?,
            Some(op) => {
                // Compound assignment: lhs = lhs op rhs.
                self.compile_expr(target)?;
                self.compile_expr(value)?;
                self.emit_binop(op, line)?;
            }
        }
        self.compile_store(target)?;
        self.emit(Op::Pop, line);
        Ok(())
    }

    /// Emits the store for an lvalue; the stored value stays on top.
    fn compile_store(&mut self, target: &Expr) -> CResult {
        let line = target.line;
        match &target.kind {
            ExprKind::Var(name) => self.compile_var_write(name, line),
            ExprKind::Field { object, name } => {
                self.compile_expr(object)?;
                let sym = self.make_symbol(name, line)?;
                self.emit(Op::SetField, line);
                self.emit_u16(sym, line);
                Ok(())
            }
            ExprKind::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::SubscrSet, line);
                Ok(())
            }
            _ => self.err(line, "invalid assignment target"),
        }
    }

    fn compile_loop_exit(&mut self, mark: u8, line: u32) -> CResult {
        let st = self.state_ref();
        let Some(loop_state) = st.loops.last() else {
            let what = if mark == END_MARK_BREAK { "break" } else { "continue" };
            return self.err(line, format!("'{}' outside of a loop", what));
        };
        if st.try_depth > loop_state.try_depth {
            let what = if mark == END_MARK_BREAK { "break" } else { "continue" };
            return self.err(line, format!("cannot '{}' across a try block", what));
        }
        let depth = loop_state.scope_depth;
        self.discard_locals_to(depth, line);
        let at = self.offset();
        self.emit(Op::End, line);
        self.emit_byte(mark, line);
        self.emit_byte(0, line);
        self.state().loops.last_mut().unwrap().ends.push(at);
        Ok(())
    }

    /// Rewrites this loop's End placeholders: break jumps here (the loop
    /// exit), continue jumps to `continue_target`.
    fn finish_loop(&mut self, continue_target: usize, line: u32) -> CResult {
        let loop_state = self.state().loops.pop().unwrap();
        let break_target = self.offset();
        for at in loop_state.ends {
            let mark = self.state_ref().code.bytes[at + 1];
            let target = if mark == END_MARK_BREAK { break_target } else { continue_target };
            let offset = target as i64 - (at as i64 + 3);
            if offset > i16::MAX as i64 || offset < i16::MIN as i64 {
                return self.err(line, "loop body too large");
            }
            let st = self.state();
            st.code.patch_byte(at, Op::Jump.into());
            st.code.patch_u16(at + 1, offset as i16 as u16);
        }
        Ok(())
    }

    /// for var v in E: evaluate E into a hidden `.expr` slot, thread the
    /// iterator state through `.iter`, and step with ForIter/ForNext.
    fn compile_foreach(
        &mut self,
        name: &str,
        iterable: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> CResult {
        self.enter_scope();
        self.compile_expr(iterable)?;
        self.add_local(".expr", line)?;
        self.mark_initialized();
        self.emit(Op::PushNull, line);
        self.add_local(".iter", line)?;
        self.mark_initialized();

        let start = self.offset();
        let scope_depth = self.state_ref().scope_depth;
        let try_depth = self.state_ref().try_depth;
        self.state().loops.push(LoopState { start, scope_depth, try_depth, ends: Vec::new() });

        self.emit(Op::ForIter, line);
        let exit_jump = self.emit_jump(Op::ForNext, line);
        self.track(1); // ForNext pushes the element when it does not jump.

        self.enter_scope();
        self.add_local(name, line)?;
        self.mark_initialized();
        self.compile_body(body)?;
        self.exit_scope(line);
        self.emit_loop(start, line)?;
        self.patch_jump(exit_jump, line)?;
        self.finish_loop(start, line)?;
        self.exit_scope(line);
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        excepts: &[ExceptClause],
        ensure: Option<&[Stmt]>,
        line: u32,
    ) -> CResult {
        let setups = (ensure.is_some() as u8) + (!excepts.is_empty() as u8);
        if self.state_ref().try_depth + setups > MAX_TRY_DEPTH {
            return self.err(line, "too many nested try blocks");
        }
        self.state().try_depth += setups;

        let ensure_setup = if ensure.is_some() {
            Some(self.emit_jump(Op::SetupEnsure, line))
        } else {
            None
        };
        let except_setup = if !excepts.is_empty() {
            Some(self.emit_jump(Op::SetupExcept, line))
        } else {
            None
        };

        self.enter_scope();
        self.compile_body(body)?;
        self.exit_scope(line);

        // Normal completion: discard the handler records and merge into the
        // handler continuation with a (null exception, null cause) pair.
        if except_setup.is_some() {
            self.emit(Op::PopHandler, line);
        }
        if ensure_setup.is_some() {
            self.emit(Op::PopHandler, line);
        }
        self.emit(Op::PushNull, line);
        self.emit(Op::PushNull, line);
        let skip_chain = if ensure.is_some() && !excepts.is_empty() {
            Some(self.emit_jump(Op::Jump, line))
        } else {
            None
        };

        // The exception and its cause occupy two hidden slots, visible to
        // the except chain and the ensure body.
        self.add_local(".exc", line)?;
        self.mark_initialized();
        let exc_slot = (self.state_ref().locals.len() - 1) as u8;
        self.add_local(".cause", line)?;
        self.mark_initialized();
        let cause_slot = exc_slot + 1;

        if let Some(at) = except_setup {
            self.patch_jump(at, line)?;
            let mut clause_exits = Vec::new();
            for clause in excepts {
                let c_line = clause.line;
                self.emit(Op::GetLocal, c_line);
                self.emit_byte(exc_slot, c_line);
                self.compile_expr(&clause.class)?;
                self.emit(Op::Is, c_line);
                let next_clause = self.emit_jump(Op::JumpIfFalse, c_line);

                self.enter_scope();
                if let Some(var) = &clause.var {
                    self.emit(Op::GetLocal, c_line);
                    self.emit_byte(exc_slot, c_line);
                    self.add_local(var, c_line)?;
                    self.mark_initialized();
                }
                self.compile_body(&clause.body)?;
                self.exit_scope(c_line);

                // Handled: clear the cause slot.
                self.emit(Op::PushNull, c_line);
                self.emit(Op::SetLocal, c_line);
                self.emit_byte(cause_slot, c_line);
                self.emit(Op::Pop, c_line);
                clause_exits.push(self.emit_jump(Op::Jump, c_line));
                self.patch_jump(next_clause, c_line)?;
            }
            for at in clause_exits {
                self.patch_jump(at, line)?;
            }
            if ensure.is_some() {
                // Disarm the ensure record before running its body inline.
                self.emit(Op::PopHandler, line);
            }
        }

        if let Some(at) = skip_chain {
            self.patch_jump(at, line)?;
        }
        if let Some(at) = ensure_setup {
            self.patch_jump(at, line)?;
        }
        if let Some(ensure_body) = ensure {
            self.enter_scope();
            self.compile_body(ensure_body)?;
            self.exit_scope(line);
        }
        self.emit(Op::EndHandler, line);

        // EndHandler consumed the two hidden slots.
        let st = self.state();
        st.locals.pop();
        st.locals.pop();
        st.try_depth -= setups;
        Ok(())
    }

    /// with E v: bind the resource, run the body under an ensure that
    /// closes it.
    fn compile_with(&mut self, expr: &Expr, var: &str, body: &[Stmt], line: u32) -> CResult {
        if self.state_ref().try_depth + 1 > MAX_TRY_DEPTH {
            return self.err(line, "too many nested try blocks");
        }
        self.state().try_depth += 1;
        self.enter_scope();
        self.emit(Op::PushNull, line);
        self.add_local(var, line)?;
        self.mark_initialized();
        let var_slot = (self.state_ref().locals.len() - 1) as u8;

        let ensure_setup = self.emit_jump(Op::SetupEnsure, line);
        self.compile_expr(expr)?;
        self.emit(Op::SetLocal, line);
        self.emit_byte(var_slot, line);
        self.emit(Op::Pop, line);
        self.enter_scope();
        self.compile_body(body)?;
        self.exit_scope(line);
        self.emit(Op::PopHandler, line);
        self.emit(Op::PushNull, line);
        self.emit(Op::PushNull, line);

        // Ensure: if v then v.close() end
        self.patch_jump(ensure_setup, line)?;
        self.emit(Op::GetLocal, line);
        self.emit_byte(var_slot, line);
        let skip = self.emit_jump(Op::JumpIfFalse, line);
        self.emit(Op::GetLocal, line);
        self.emit_byte(var_slot, line);
        let sym = self.make_symbol("close", line)?;
        self.emit(Op::Invoke0, line);
        self.emit_u16(sym, line);
        self.emit(Op::Pop, line);
        self.patch_jump(skip, line)?;
        self.emit(Op::EndHandler, line);

        self.state().try_depth -= 1;
        self.exit_scope(line);
        Ok(())
    }

    fn compile_import(
        &mut self,
        module: &str,
        names: &[String],
        alias: Option<&str>,
        line: u32,
    ) -> CResult {
        let module_k = self.string_const(module, line)?;
        if let Some(alias) = alias {
            let alias_k = self.string_const(alias, line)?;
            self.emit(Op::ImportAs, line);
            self.emit_u16(module_k, line);
            self.emit_u16(alias_k, line);
        } else if names.is_empty() {
            self.emit(Op::Import, line);
            self.emit_u16(module_k, line);
        } else {
            self.emit(Op::ImportFrom, line);
            self.emit_u16(module_k, line);
            for name in names {
                let name_k = self.string_const(name, line)?;
                self.emit(Op::ImportName, line);
                self.emit_u16(module_k, line);
                self.emit_u16(name_k, line);
            }
        }
        self.emit(Op::Pop, line);
        Ok(())
    }

    // === Functions and classes ===

    /// Compiles a function body and emits the Closure instruction for it in
    /// the enclosing function.
    fn compile_function(
        &mut self,
        fun: &FunLit,
        name: String,
        kind: FnKind,
        has_superclass: bool,
    ) -> CResult {
        let line = fun.line;
        if fun.params.len() > u8::MAX as usize {
            return self.err(line, "too many parameters");
        }
        let qualified = {
            let parent = self.state_ref();
            if parent.kind == FnKind::Script {
                name.clone()
            } else {
                format!("{}.{}", parent.name, name)
            }
        };

        let mut state = FuncState::new(kind, qualified);
        state.arity = fun.params.len() as u8;
        state.vararg = fun.vararg.is_some();
        state.has_superclass = has_superclass;
        if matches!(kind, FnKind::Method | FnKind::Ctor) {
            state.method_name = Some(name);
        }
        self.states.push(state);

        // Slot 0: the callable, or `this` inside methods.
        let slot0 = if matches!(kind, FnKind::Method | FnKind::Ctor) { "this" } else { "" };
        self.state().locals.push(Local {
            name: slot0.to_string(),
            depth: 0,
            initialized: true,
            is_upvalue: false,
        });
        for param in &fun.params {
            self.add_local(param, line)?;
            self.mark_initialized();
        }
        if let Some(vararg) = &fun.vararg {
            self.add_local(vararg, line)?;
            self.mark_initialized();
        }

        // Defaults are constant literals, evaluated now.
        for dflt in &fun.defaults {
            let v = self.literal_value(dflt)?;
            self.state().defaults.push(v);
        }

        self.compile_body(&fun.body)?;
        let end_line = fun.body.last().map(|s| s.line).unwrap_or(line);
        if kind == FnKind::Ctor {
            // Constructors implicitly return this.
            self.emit(Op::GetLocal, end_line);
            self.emit_byte(0, end_line);
        } else {
            self.emit(Op::PushNull, end_line);
        }
        self.emit(Op::Return, end_line);

        let upvalues: Vec<UpvalDesc> = self.state_ref().upvalues.clone();
        let function = self.finish_function();
        let k = self.make_const(Value::Obj(function), line)?;
        self.emit(Op::Closure, line);
        self.emit_u16(k, line);
        for up in upvalues {
            self.emit_byte(up.is_local as u8, line);
            self.emit_byte(up.index, line);
        }
        Ok(())
    }

    /// Pops the current function state and allocates its ObjFunction.
    fn finish_function(&mut self) -> ObjRef {
        let state = self.states.pop().unwrap();
        let name = self.vm.intern_pinned(&state.name);
        let proto = FnProto {
            name,
            module: self.module,
            arity: state.arity,
            vararg: state.vararg,
            defaults: state.defaults,
        };
        let function = ObjFunction {
            proto,
            upvalue_count: state.upvalues.len() as u8,
            stack_usage: state.max_stack.min(u16::MAX as i32) as u16,
            code: Rc::new(state.code),
        };
        self.vm.alloc_pinned(Obj::Function(function))
    }

    fn literal_value(&mut self, e: &Expr) -> CResult<Value> {
        match &e.kind {
            ExprKind::Num(n) => Ok(Value::Num(*n)),
            ExprKind::True => Ok(Value::Bool(true)),
            ExprKind::False => Ok(Value::Bool(false)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Str(raw) => {
                let s = self.unescape(raw, e.line)?;
                Ok(Value::Obj(self.vm.intern_pinned(&s)))
            }
            _ => self.err(e.line, "default parameter values must be constant literals"),
        }
    }

    fn compile_class(
        &mut self,
        name: &str,
        superclass: Option<&Expr>,
        methods: &[MethodDecl],
        is_static: bool,
        line: u32,
    ) -> CResult {
        if is_static && !self.at_module_scope() {
            return self.err(line, "'static' is only allowed at module scope");
        }
        let as_global = self.at_module_scope() && !is_static;
        let placeholder_slot = if !as_global {
            self.emit(Op::PushNull, line);
            let slot = self.add_local(name, line)?;
            self.mark_initialized();
            Some(slot)
        } else {
            None
        };

        self.enter_scope();
        let has_superclass = superclass.is_some();
        if let Some(sup) = superclass {
            self.compile_expr(sup)?;
            self.add_local(".sup", line)?;
            self.mark_initialized();
            let sup_slot = (self.state_ref().locals.len() - 1) as u8;
            self.emit(Op::GetLocal, line);
            self.emit_byte(sup_slot, line);
            let sym = self.make_symbol(name, line)?;
            self.emit(Op::NewSubclass, line);
            self.emit_u16(sym, line);
        } else {
            let sym = self.make_symbol(name, line)?;
            self.emit(Op::NewClass, line);
            self.emit_u16(sym, line);
        }

        for method in methods {
            let m_line = method.line;
            match &method.fun {
                Some(fun) => {
                    let kind = if method.name == "new" { FnKind::Ctor } else { FnKind::Method };
                    self.compile_function(fun, method.name.clone(), kind, has_superclass)?;
                    let sym = self.make_symbol(&method.name, m_line)?;
                    self.emit(Op::DefMethod, m_line);
                    self.emit_u16(sym, m_line);
                }
                None => {
                    let sym = self.make_symbol(&method.name, m_line)?;
                    let registry_key = format!("{}.{}", name, method.name);
                    let k = self.string_const(&registry_key, m_line)?;
                    self.emit(Op::NatMethod, m_line);
                    self.emit_u16(sym, m_line);
                    self.emit_u16(k, m_line);
                }
            }
        }

        if let Some(slot) = placeholder_slot {
            self.emit(Op::SetLocal, line);
            self.emit_byte(slot, line);
            self.emit(Op::Pop, line);
        } else {
            let sym = self.make_symbol(name, line)?;
            self.emit(Op::DefineGlobal, line);
            self.emit_u16(sym, line);
        }
        self.exit_scope(line);
        Ok(())
    }

    // === Expressions ===

    fn compile_expr(&mut self, e: &Expr) -> CResult {
        let line = e.line;
        match &e.kind {
            ExprKind::Num(n) => self.emit_const(Value::Num(*n), line),
            ExprKind::True => self.emit_const(Value::Bool(true), line),
            ExprKind::False => self.emit_const(Value::Bool(false), line),
            ExprKind::Null => {
                self.emit(Op::PushNull, line);
                Ok(())
            }
            ExprKind::Str(raw) => {
                let s = self.unescape(raw, line)?;
                let r = self.vm.intern_pinned(&s);
                self.emit_const(Value::Obj(r), line)
            }
            ExprKind::Var(name) => self.compile_var_read(name, line),
            ExprKind::This => {
                if !matches!(self.state_ref().kind, FnKind::Method | FnKind::Ctor) {
                    return self.err(line, "cannot use 'this' outside of a method");
                }
                self.emit(Op::GetLocal, line);
                self.emit_byte(0, line);
                Ok(())
            }
            ExprKind::Unary(op, operand) => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emit(Op::Neg, line),
                    UnaryOp::Not => self.emit(Op::Not, line),
                    UnaryOp::Len => {
                        let sym = self.make_symbol("__len__", line)?;
                        self.emit(Op::Invoke0, line);
                        self.emit_u16(sym, line);
                    }
                    UnaryOp::Stringify => {
                        let sym = self.make_symbol("__string__", line)?;
                        self.emit(Op::Invoke0, line);
                        self.emit_u16(sym, line);
                    }
                }
                Ok(())
            }
            ExprKind::Binary(op, a, b) => {
                self.compile_expr(a)?;
                self.compile_expr(b)?;
                self.emit_binop(*op, line)
            }
            ExprKind::And(a, b) => {
                // Short-circuit with a duplicate-and-test: keep the left
                // value as the result when it decides.
                self.compile_expr(a)?;
                self.emit(Op::Dup, line);
                let skip = self.emit_jump(Op::JumpIfFalse, line);
                self.emit(Op::Pop, line);
                self.compile_expr(b)?;
                self.patch_jump(skip, line)?;
                Ok(())
            }
            ExprKind::Or(a, b) => {
                self.compile_expr(a)?;
                self.emit(Op::Dup, line);
                let skip = self.emit_jump(Op::JumpIfTrue, line);
                self.emit(Op::Pop, line);
                self.compile_expr(b)?;
                self.patch_jump(skip, line)?;
                Ok(())
            }
            ExprKind::Call { callee, args, unpack_last } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let argc = args.len();
                if *unpack_last {
                    self.emit(Op::CallUnpack, line);
                    self.emit_byte(argc as u8, line);
                    self.track(-(argc as i32));
                } else if let Some(op) = Op::call_op(argc) {
                    self.emit(op, line);
                    self.track(-(argc as i32));
                } else {
                    self.emit(Op::Call, line);
                    self.emit_byte(argc as u8, line);
                    self.track(-(argc as i32));
                }
                Ok(())
            }
            ExprKind::Invoke { object, name, args, unpack_last } => {
                self.compile_expr(object)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let sym = self.make_symbol(name, line)?;
                self.emit_invoke(sym, args.len(), *unpack_last, line);
                Ok(())
            }
            ExprKind::Super { name, args, unpack_last, call } => {
                self.compile_super(name.as_deref(), args, *unpack_last, *call, line)
            }
            ExprKind::Field { object, name } => {
                self.compile_expr(object)?;
                let sym = self.make_symbol(name, line)?;
                self.emit(Op::GetField, line);
                self.emit_u16(sym, line);
                Ok(())
            }
            ExprKind::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::SubscrGet, line);
                Ok(())
            }
            ExprKind::ListLit(items) => {
                self.emit(Op::NewList, line);
                for item in items {
                    self.compile_expr(item)?;
                    self.emit(Op::AppendList, line);
                }
                Ok(())
            }
            ExprKind::TupleLit(items) => {
                if items.len() > u8::MAX as usize {
                    return self.err(line, "too many tuple elements");
                }
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Op::NewTuple, line);
                self.emit_byte(items.len() as u8, line);
                self.track(-(items.len() as i32) + 1);
                Ok(())
            }
            ExprKind::TableLit(entries) => {
                self.emit(Op::NewTable, line);
                let sym = self.make_symbol("__set__", line)?;
                for (key, value) in entries {
                    self.emit(Op::Dup, line);
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                    self.emit(Op::Invoke2, line);
                    self.emit_u16(sym, line);
                    self.track(-2);
                    self.emit(Op::Pop, line);
                }
                Ok(())
            }
            ExprKind::Fun(fun) => {
                self.compile_function(fun, "<anonymous>".to_string(), FnKind::Function, false)
            }
        }
    }

    fn emit_invoke(&mut self, sym: u16, argc: usize, unpack: bool, line: u32) {
        if unpack {
            self.emit(Op::InvokeUnpack, line);
            self.emit_byte(argc as u8, line);
        } else if let Some(op) = Op::invoke_op(argc) {
            self.emit(op, line);
        } else {
            self.emit(Op::Invoke, line);
            self.emit_byte(argc as u8, line);
        }
        self.emit_u16(sym, line);
        self.track(-(argc as i32));
    }

    fn compile_super(
        &mut self,
        name: Option<&str>,
        args: &[Expr],
        unpack: bool,
        call: bool,
        line: u32,
    ) -> CResult {
        let (method_name, has_superclass) = {
            let st = self.state_ref();
            (st.method_name.clone(), st.has_superclass)
        };
        let Some(method_name) = method_name else {
            return self.err(line, "cannot use 'super' outside of a method");
        };
        if !has_superclass {
            return self.err(line, "cannot use 'super' in a class with no superclass");
        }
        let name = name.unwrap_or(&method_name).to_string();
        let sym = self.make_symbol(&name, line)?;

        // Receiver, args, then the defining class's parent on top.
        self.emit(Op::GetLocal, line);
        self.emit_byte(0, line);
        if !call {
            self.compile_var_read(".sup", line)?;
            self.emit(Op::SuperBind, line);
            self.emit_u16(sym, line);
            return Ok(());
        }
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.compile_var_read(".sup", line)?;
        let argc = args.len();
        if unpack {
            self.emit(Op::SuperUnpack, line);
            self.emit_byte(argc as u8, line);
        } else if let Some(op) = Op::super_op(argc) {
            self.emit(op, line);
        } else {
            self.emit(Op::Super, line);
            self.emit_byte(argc as u8, line);
        }
        self.emit_u16(sym, line);
        self.track(-(argc as i32) - 1);
        Ok(())
    }

    fn emit_binop(&mut self, op: BinOp, line: u32) -> CResult {
        match op {
            BinOp::Add => self.emit(Op::Add, line),
            BinOp::Sub => self.emit(Op::Sub, line),
            BinOp::Mul => self.emit(Op::Mul, line),
            BinOp::Div => self.emit(Op::Div, line),
            BinOp::Mod => self.emit(Op::Mod, line),
            BinOp::Pow => self.emit(Op::Pow, line),
            BinOp::Eq => self.emit(Op::Eq, line),
            BinOp::Neq => {
                self.emit(Op::Eq, line);
                self.emit(Op::Not, line);
            }
            BinOp::Lt => self.emit(Op::Lt, line),
            BinOp::Le => self.emit(Op::Le, line),
            BinOp::Gt => self.emit(Op::Gt, line),
            BinOp::Ge => self.emit(Op::Ge, line),
            BinOp::Is => self.emit(Op::Is, line),
        }
        Ok(())
    }

    /// Decodes escape sequences in a raw string literal, using the shared
    /// scratch buffer. Unknown escapes are compile errors.
    fn unescape(&mut self, raw: &str, line: u32) -> CResult<String> {
        self.scratch.clear();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                self.scratch.push(c);
                continue;
            }
            match chars.next() {
                Some('0') => self.scratch.push('\0'),
                Some('a') => self.scratch.push('\x07'),
                Some('b') => self.scratch.push('\x08'),
                Some('f') => self.scratch.push('\x0c'),
                Some('n') => self.scratch.push('\n'),
                Some('r') => self.scratch.push('\r'),
                Some('t') => self.scratch.push('\t'),
                Some('v') => self.scratch.push('\x0b'),
                Some('\\') => self.scratch.push('\\'),
                Some('"') => self.scratch.push('"'),
                Some('\'') => self.scratch.push('\''),
                Some(other) => {
                    return self.err(line, format!("invalid escape sequence '\\{}'", other))
                }
                None => return self.err(line, "trailing backslash in string"),
            }
        }
        Ok(self.scratch.clone())
    }
}

/// Net stack effect of opcodes whose effect does not depend on operands.
/// Variable-effect instructions are tracked at their emission sites.
fn fixed_stack_effect(op: Op) -> i32 {
    use Op::*;
    match op {
        Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le | Gt | Ge | Is | AppendList => -1,
        Pop | PopN | JumpIfTrue | JumpIfFalse | Raise | DefineGlobal | DefMethod
        | CloseUpvalue | SetField | Return | SubscrGet | SuperBind => -1,
        SubscrSet | EndHandler => -2,
        Dup | PushNull | GetConst | GetLocal | GetUpvalue | GetGlobal | Closure | NewList
        | NewTable | NewClass | Native | Import | ImportFrom | ImportAs => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile_src(src: &str) -> Result<ObjRef, Diagnostic> {
        let mut vm = Vm::new();
        let tokens = tokenize("test.vsp", src).unwrap();
        let stmts = Parser::new("test.vsp", tokens).parse().unwrap();
        let module = vm.new_module_for_test("test");
        compile_module(&mut vm, "test.vsp", module, &stmts)
    }

    fn compile_err(src: &str) -> String {
        compile_src(src).unwrap_err().message
    }

    #[test]
    fn compiles_simple_program() {
        assert!(compile_src("var x = 1 print(x + 2)").is_ok());
    }

    #[test]
    fn self_referential_initializer_is_rejected() {
        // At local scope the name exists but is not yet initialized.
        let msg = compile_err("begin var x = x end");
        assert!(msg.contains("its own initializer"), "{}", msg);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(compile_err("break").contains("outside of a loop"));
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        assert!(compile_err("continue").contains("outside of a loop"));
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        assert!(compile_err("return 1").contains("top-level"));
    }

    #[test]
    fn return_in_constructor_is_rejected() {
        let msg = compile_err("class A fun new() return 1 end end");
        assert!(msg.contains("constructor"), "{}", msg);
    }

    #[test]
    fn break_across_try_is_rejected() {
        let msg = compile_err("while true try break except Exception e end end");
        assert!(msg.contains("across a try block"), "{}", msg);
    }

    #[test]
    fn static_inside_function_is_rejected() {
        let msg = compile_err("fun f() static var x = 1 end");
        assert!(msg.contains("module scope"), "{}", msg);
    }

    #[test]
    fn this_outside_method_is_rejected() {
        assert!(compile_err("print(this)").contains("outside of a method"));
    }

    #[test]
    fn super_without_superclass_is_rejected() {
        let msg = compile_err("class A fun m() return super() end end");
        assert!(msg.contains("no superclass"), "{}", msg);
    }

    #[test]
    fn unknown_escape_is_rejected() {
        let msg = compile_err(r#"var s = "\q""#);
        assert!(msg.contains("invalid escape"), "{}", msg);
    }

    #[test]
    fn deep_try_nesting_is_rejected() {
        let mut src = String::new();
        for _ in 0..9 {
            src.push_str("try ");
        }
        src.push_str("print(1) ");
        for _ in 0..9 {
            src.push_str("ensure end ");
        }
        let msg = compile_err(&src);
        assert!(msg.contains("nested try"), "{}", msg);
    }

    #[test]
    fn too_many_locals_is_rejected() {
        let mut src = String::from("fun f() ");
        for i in 0..256 {
            src.push_str(&format!("var v{} = {} ", i, i));
        }
        src.push_str("end");
        let msg = compile_err(&src);
        assert!(msg.contains("too many local"), "{}", msg);
    }

    #[test]
    fn duplicate_local_is_rejected() {
        let msg = compile_err("begin var a = 1 var a = 2 end");
        assert!(msg.contains("already declared"), "{}", msg);
    }
}
