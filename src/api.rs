// File: src/api.rs
//
// Slot-indexed embedding surface used by native functions.
// Slot 0 is the receiver or the callable itself, 1..N are the positional
// arguments; negative indices reach down from the top of the stack. A
// native leaves its return value on top and reports success; on failure it
// raises and reports false, which the VM treats exactly like a raised
// exception in interpreted code.

use crate::object::Obj;
use crate::value::{ObjRef, Value};
use crate::vm::{Raised, RtResult, Vm};

fn base(vm: &Vm) -> usize {
    vm.native_bases.last().copied().unwrap_or(0)
}

/// Absolute stack index for a native-relative slot.
fn slot_index(vm: &Vm, slot: i32) -> usize {
    if slot >= 0 {
        base(vm) + slot as usize
    } else {
        (vm.stack_len() as i64 + slot as i64) as usize
    }
}

pub fn get(vm: &Vm, slot: i32) -> Value {
    vm.stack_get(slot_index(vm, slot))
}

pub fn set(vm: &mut Vm, slot: i32, v: Value) {
    let idx = slot_index(vm, slot);
    vm.stack_set(idx, v);
}

pub fn push(vm: &mut Vm, v: Value) {
    vm.push(v);
}

pub fn push_null(vm: &mut Vm) {
    vm.push(Value::Null);
}

pub fn push_num(vm: &mut Vm, n: f64) {
    vm.push(Value::Num(n));
}

pub fn push_bool(vm: &mut Vm, b: bool) {
    vm.push(Value::Bool(b));
}

pub fn push_str(vm: &mut Vm, s: &str) {
    let r = vm.intern(s);
    vm.push(Value::Obj(r));
}

/// Keeps a value alive across allocating API calls. Pair with [`unpin`].
pub fn pin(vm: &mut Vm, v: Value) {
    vm.pins.push(v);
}

pub fn unpin(vm: &mut Vm) {
    vm.pins.pop();
}

pub fn raise(vm: &mut Vm, class: &str, message: impl Into<String>) -> Raised {
    vm.raise(class, message)
}

// === Checked accessors ===

pub fn check_num(vm: &mut Vm, slot: i32, what: &str) -> RtResult<f64> {
    match get(vm, slot) {
        Value::Num(n) => Ok(n),
        other => {
            let kind = vm.kind_name(other);
            Err(vm.raise("TypeException", format!("{} must be a Number, got {}", what, kind)))
        }
    }
}

pub fn check_int(vm: &mut Vm, slot: i32, what: &str) -> RtResult<i64> {
    let v = get(vm, slot);
    if !v.is_int() {
        let kind = vm.kind_name(v);
        return Err(vm.raise("TypeException", format!("{} must be an integer, got {}", what, kind)));
    }
    Ok(v.as_num().unwrap_or(0.0) as i64)
}

pub fn check_str(vm: &mut Vm, slot: i32, what: &str) -> RtResult<ObjRef> {
    match get(vm, slot) {
        Value::Obj(r) if matches!(vm.heap.get(r), Obj::String(_)) => Ok(r),
        other => {
            let kind = vm.kind_name(other);
            Err(vm.raise("TypeException", format!("{} must be a String, got {}", what, kind)))
        }
    }
}

pub fn check_obj_kind(
    vm: &mut Vm,
    slot: i32,
    what: &str,
    kind_name: &str,
    pred: fn(&Obj) -> bool,
) -> RtResult<ObjRef> {
    match get(vm, slot) {
        Value::Obj(r) if pred(vm.heap.get(r)) => Ok(r),
        other => {
            let got = vm.kind_name(other);
            Err(vm.raise("TypeException", format!("{} must be a {}, got {}", what, kind_name, got)))
        }
    }
}

/// The collected vararg tuple of the running native (its last slot).
pub fn vararg_items(vm: &Vm, slot: i32) -> Vec<Value> {
    match get(vm, slot) {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::Tuple(items) => items.to_vec(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

// === Re-entering the interpreter ===

/// Calls the callable under `argc` stack arguments and returns its result.
/// The callable and arguments must have been pushed by the caller.
pub fn call(vm: &mut Vm, argc: usize) -> RtResult<Value> {
    vm.call_and_run(argc)
}

/// Invokes `name` on the receiver under `argc` stack arguments.
pub fn call_method(vm: &mut Vm, name: &str, argc: usize) -> RtResult<Value> {
    vm.invoke_and_run(name, argc)
}

// === Field and subscript access ===

pub fn get_field(vm: &mut Vm, instance: ObjRef, name: &str) -> Option<Value> {
    vm.get_instance_field(instance, name)
}

pub fn set_field(vm: &mut Vm, instance: ObjRef, name: &str, v: Value) {
    vm.set_instance_field(instance, name, v)
}

pub fn table_get(vm: &mut Vm, table: ObjRef, key: Value) -> RtResult<Option<Value>> {
    vm.table_get(table, key)
}

pub fn table_set(vm: &mut Vm, table: ObjRef, key: Value, value: Value) -> RtResult<()> {
    vm.table_set(table, key, value)
}
