// File: src/opcode.rs
//
// Bytecode instruction set for the Vesper VM.
// One byte per opcode; operand bytes follow inline. Jump offsets are
// 16-bit signed, relative to the byte after the instruction's operands.
// k16 = constant pool index, s16 = symbol pool index (cached name lookup),
// u8 = small unsigned operand.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Bytecode operations, grouped the way the compiler emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    // === Arithmetic / logic ===
    /// Pop two values, push the sum. Concatenates strings; defers to
    /// `__add__` for instances.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Not,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    /// `a is B`: class-membership test along the superclass chain.
    Is,

    // === Stack ===
    Pop,
    /// Pop n values. `[n]`
    PopN,
    Dup,
    PushNull,
    /// Push a constant. `[k16]`
    GetConst,

    // === Variables ===
    /// `[slot]`
    GetLocal,
    /// `[slot]`
    SetLocal,
    /// `[s16]`
    GetGlobal,
    /// `[s16]`
    SetGlobal,
    /// `[s16]`
    DefineGlobal,
    /// `[slot]`
    GetUpvalue,
    /// `[slot]`
    SetUpvalue,
    /// Close the upvalue for the top stack slot, then pop it.
    CloseUpvalue,

    // === Fields / subscript ===
    /// `[s16]`
    GetField,
    /// `[s16]`
    SetField,
    SubscrGet,
    SubscrSet,

    // === Calls ===
    /// `[argc]`
    Call,
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    /// Call with the trailing argument spread from a list/tuple. `[argc]`
    CallUnpack,
    /// Method call: fused lookup + call. `[argc, s16]`
    Invoke,
    Invoke0,
    Invoke1,
    Invoke2,
    Invoke3,
    Invoke4,
    Invoke5,
    Invoke6,
    Invoke7,
    Invoke8,
    Invoke9,
    Invoke10,
    /// `[argc, s16]`
    InvokeUnpack,
    /// Superclass method call; the superclass sits on top of the args.
    /// `[argc, s16]`
    Super,
    Super0,
    Super1,
    Super2,
    Super3,
    Super4,
    Super5,
    Super6,
    Super7,
    Super8,
    Super9,
    Super10,
    /// `[argc, s16]`
    SuperUnpack,
    /// Bind `super.m` without calling it. `[s16]`
    SuperBind,
    Return,

    // === Closures / classes ===
    /// `[k16, (is_local, index) x upvalue_count]`
    Closure,
    /// `[s16]`
    NewClass,
    /// Pops the superclass. `[s16]`
    NewSubclass,
    /// Pops a closure, installs it as a method on the class below. `[s16]`
    DefMethod,
    /// Installs a registered native as a method. `[s16, k16]`
    NatMethod,
    /// Push a registered native function. `[k16]`
    Native,

    // === Control flow ===
    /// `[off16]`
    Jump,
    /// Pop; jump when truthy. `[off16]`
    JumpIfTrue,
    /// Pop; jump when falsy. `[off16]`
    JumpIfFalse,
    /// Advance the for-each iterator: `.iter = .expr.__iter__(.iter)` over
    /// the two top stack slots.
    ForIter,
    /// If `.iter` is falsy jump out, else push `.expr.__next__(.iter)`.
    /// `[off16]`
    ForNext,
    /// Placeholder for break/continue; rewritten to Jump when the loop
    /// body is finished. `[mark, 0]`
    End,

    // === Exception handling ===
    /// Push an except-handler record. `[off16]`
    SetupExcept,
    /// Push an ensure-handler record. `[off16]`
    SetupEnsure,
    /// Discard the innermost handler record.
    PopHandler,
    /// Ends a handler region: pops (exc, cause); re-raises cause when it
    /// is still non-null.
    EndHandler,
    Raise,

    // === Collections ===
    NewList,
    AppendList,
    /// `[n]`
    NewTuple,
    NewTable,
    /// Split a list/tuple into exactly n stack values. `[n]`
    Unpack,

    // === Imports ===
    /// Import module, bind it in the current module, push it. `[k16]`
    Import,
    /// Import module without binding; push it. `[k16]`
    ImportFrom,
    /// Import module, bind under an alias, push it. `[k16 module, k16 alias]`
    ImportAs,
    /// Bind one member of the module on top of the stack.
    /// `[k16 module, k16 name]`
    ImportName,
}

impl Op {
    /// Fixed operand byte count. `Closure` additionally carries two bytes
    /// per upvalue of the function constant it references.
    pub fn operand_len(self) -> usize {
        use Op::*;
        match self {
            PopN | GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | CallUnpack
            | NewTuple | Unpack => 1,
            GetConst | GetGlobal | SetGlobal | DefineGlobal | GetField | SetField | Jump
            | JumpIfTrue | JumpIfFalse | ForNext | SetupExcept | SetupEnsure | SuperBind
            | NewClass | NewSubclass | DefMethod | Native | Import | ImportFrom | Closure
            | End => 2,
            Invoke0 | Invoke1 | Invoke2 | Invoke3 | Invoke4 | Invoke5 | Invoke6 | Invoke7
            | Invoke8 | Invoke9 | Invoke10 => 2,
            Super0 | Super1 | Super2 | Super3 | Super4 | Super5 | Super6 | Super7 | Super8
            | Super9 | Super10 => 2,
            Invoke | InvokeUnpack | Super | SuperUnpack => 3,
            NatMethod | ImportAs | ImportName => 4,
            _ => 0,
        }
    }

    /// Inline-arg call forms: returns the encoded argument count.
    pub fn inline_argc(self) -> Option<u8> {
        let b: u8 = self.into();
        let call0: u8 = Op::Call0.into();
        let invoke0: u8 = Op::Invoke0.into();
        let super0: u8 = Op::Super0.into();
        if (call0..=call0 + 10).contains(&b) {
            Some(b - call0)
        } else if (invoke0..=invoke0 + 10).contains(&b) {
            Some(b - invoke0)
        } else if (super0..=super0 + 10).contains(&b) {
            Some(b - super0)
        } else {
            None
        }
    }

    pub fn call_op(argc: usize) -> Option<Op> {
        let call0: u8 = Op::Call0.into();
        if argc <= 10 {
            Op::try_from(call0 + argc as u8).ok()
        } else {
            None
        }
    }

    pub fn invoke_op(argc: usize) -> Option<Op> {
        let invoke0: u8 = Op::Invoke0.into();
        if argc <= 10 {
            Op::try_from(invoke0 + argc as u8).ok()
        } else {
            None
        }
    }

    pub fn super_op(argc: usize) -> Option<Op> {
        let super0: u8 = Op::Super0.into();
        if argc <= 10 {
            Op::try_from(super0 + argc as u8).ok()
        } else {
            None
        }
    }
}

/// Break/continue placeholder marks carried by `Op::End`.
pub const END_MARK_CONTINUE: u8 = 1;
pub const END_MARK_BREAK: u8 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for b in 0..=u8::MAX {
            if let Ok(op) = Op::try_from(b) {
                let back: u8 = op.into();
                assert_eq!(back, b);
            }
        }
    }

    #[test]
    fn inline_call_families() {
        assert_eq!(Op::call_op(0), Some(Op::Call0));
        assert_eq!(Op::call_op(10), Some(Op::Call10));
        assert_eq!(Op::call_op(11), None);
        assert_eq!(Op::Call7.inline_argc(), Some(7));
        assert_eq!(Op::Invoke3.inline_argc(), Some(3));
        assert_eq!(Op::Super10.inline_argc(), Some(10));
        assert_eq!(Op::Call.inline_argc(), None);
    }

    #[test]
    fn operand_lengths() {
        assert_eq!(Op::Add.operand_len(), 0);
        assert_eq!(Op::GetLocal.operand_len(), 1);
        assert_eq!(Op::Jump.operand_len(), 2);
        assert_eq!(Op::Invoke.operand_len(), 3);
        // Inline call forms encode argc in the opcode: calls have no
        // operands, invokes/supers still carry the symbol index.
        assert_eq!(Op::Call4.operand_len(), 0);
        assert_eq!(Op::Invoke4.operand_len(), 2);
        assert_eq!(Op::Super4.operand_len(), 2);
        assert_eq!(Op::NatMethod.operand_len(), 4);
    }
}
