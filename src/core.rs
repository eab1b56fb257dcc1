// File: src/core.rs
//
// Core module bootstrap: the builtin classes, their native methods and the
// handful of global natives every module sees. Runs once at VM startup
// with collection paused; the patch passes at the end assign class
// pointers to every object allocated before its class existed.

use crate::api;
use crate::object::{FnProto, NativeFn, Obj, ObjClass};
use crate::table::{StringMap, TEntry};
use crate::value::{ObjRef, Value};
use crate::vm::{seq_iter_step, RtResult, Vm};

pub fn install(vm: &mut Vm) {
    let module = vm.new_module("__core__", "<builtin>");
    vm.core.module = module;

    // The universal metaclass: Class is its own class.
    let class_class = define_class(vm, "Class", None, true);
    vm.heap.set_class(class_class, class_class);
    vm.core.class_class = class_class;

    vm.core.number = define_class(vm, "Number", None, true);
    vm.core.boolean = define_class(vm, "Boolean", None, true);
    vm.core.null = define_class(vm, "Null", None, true);
    vm.core.string = define_class(vm, "String", None, true);
    vm.core.function = define_class(vm, "Function", None, true);
    vm.core.module_class = define_class(vm, "Module", None, true);
    vm.core.list = define_class(vm, "List", None, true);
    vm.core.tuple = define_class(vm, "Tuple", None, true);
    vm.core.table = define_class(vm, "Table", None, true);
    vm.core.stacktrace = define_class(vm, "StackTrace", None, true);

    // The exception family. All user-raisable errors descend from
    // Exception; these are ordinary instantiable classes.
    let exception = define_class(vm, "Exception", None, false);
    vm.core.exception = exception;
    for name in [
        "TypeException",
        "NameException",
        "FieldException",
        "MethodException",
        "ImportException",
        "StackOverflowException",
        "SyntaxException",
        "InvalidArgException",
        "IndexOutOfBoundException",
        "AssertException",
        "NotImplementedException",
        "ProgramInterrupt",
        "RegexException",
    ] {
        define_class(vm, name, Some(exception), false);
    }

    // Constructors.
    let empty = {
        let r = vm.intern("");
        Value::Obj(r)
    };
    add_method(vm, vm.core.string, "new", 1, false, vec![empty], nat_string_new);
    add_method(vm, vm.core.number, "new", 1, false, vec![], nat_number_new);
    add_method(vm, vm.core.list, "new", 1, false, vec![Value::Null], nat_list_new);
    add_method(vm, vm.core.tuple, "new", 1, false, vec![Value::Null], nat_tuple_new);
    add_method(vm, vm.core.table, "new", 0, false, vec![], nat_table_new);
    add_method(vm, exception, "new", 2, false, vec![empty, Value::Null], nat_exception_new);

    // __string__ for every builtin kind funnels through the display path.
    for class in [
        vm.core.number,
        vm.core.boolean,
        vm.core.null,
        vm.core.string,
        vm.core.function,
        vm.core.module_class,
        vm.core.list,
        vm.core.tuple,
        vm.core.table,
        vm.core.class_class,
    ] {
        add_method(vm, class, "__string__", 0, false, vec![], nat_generic_string);
    }

    add_method(vm, vm.core.number, "isInt", 0, false, vec![], nat_number_is_int);

    add_method(vm, vm.core.string, "__len__", 0, false, vec![], nat_generic_len);
    add_method(vm, vm.core.string, "__hash__", 0, false, vec![], nat_generic_hash);
    add_method(vm, vm.core.string, "escape", 0, false, vec![], nat_string_escape);

    add_method(vm, vm.core.list, "__len__", 0, false, vec![], nat_generic_len);
    add_method(vm, vm.core.list, "add", 1, false, vec![], nat_list_add);
    add_method(vm, vm.core.list, "pop", 0, false, vec![], nat_list_pop);

    add_method(vm, vm.core.tuple, "__len__", 0, false, vec![], nat_generic_len);
    add_method(vm, vm.core.tuple, "__hash__", 0, false, vec![], nat_generic_hash);

    // The iterator protocol for the index-based sequences.
    for class in [vm.core.list, vm.core.tuple, vm.core.string] {
        add_method(vm, class, "__iter__", 1, false, vec![], nat_seq_iter);
        add_method(vm, class, "__next__", 1, false, vec![], nat_seq_next);
    }

    add_method(vm, vm.core.table, "__len__", 0, false, vec![], nat_generic_len);
    add_method(vm, vm.core.table, "__get__", 1, false, vec![], nat_table_get);
    add_method(vm, vm.core.table, "__set__", 2, false, vec![], nat_table_set);
    add_method(vm, vm.core.table, "remove", 1, false, vec![], nat_table_remove);
    add_method(vm, vm.core.table, "contains", 1, false, vec![], nat_table_contains);
    add_method(vm, vm.core.table, "__iter__", 1, false, vec![], nat_table_iter);
    add_method(vm, vm.core.table, "__next__", 1, false, vec![], nat_table_next);

    // Global natives.
    define_global_native(vm, "print", 0, true, vec![], nat_print);
    let assert_msg = {
        let r = vm.intern("assertion failed");
        Value::Obj(r)
    };
    define_global_native(vm, "assert", 2, false, vec![assert_msg], nat_assert);
    define_global_native(vm, "type", 1, false, vec![], nat_type);

    // Second pass: objects created before their class existed get their
    // class pointers patched in.
    vm.heap.patch_classes(class_class, |o| matches!(o, Obj::Class(_)));
    let string = vm.core.string;
    vm.heap.patch_classes(string, |o| matches!(o, Obj::String(_)));
    let module_class = vm.core.module_class;
    vm.heap.patch_classes(module_class, |o| matches!(o, Obj::Module(_)));
    let function = vm.core.function;
    vm.heap
        .patch_classes(function, |o| matches!(o, Obj::Native(_) | Obj::Function(_) | Obj::Closure(_)));
}

fn define_class(vm: &mut Vm, name: &str, superclass: Option<ObjRef>, builtin: bool) -> ObjRef {
    let name_ref = vm.intern(name);
    let class = vm.alloc(Obj::Class(ObjClass {
        name: name_ref,
        superclass,
        methods: StringMap::new(),
        field_layout: StringMap::new(),
        builtin,
    }));
    let module = vm.core.module;
    vm.module_define(module, name_ref, Value::Obj(class));
    class
}

fn make_native(
    vm: &mut Vm,
    name: &str,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    func: NativeFn,
) -> ObjRef {
    let name_ref = vm.intern(name);
    let module = vm.core.module;
    vm.alloc(Obj::Native(crate::object::ObjNative {
        proto: FnProto { name: name_ref, module, arity, vararg, defaults },
        func,
    }))
}

fn add_method(
    vm: &mut Vm,
    class: ObjRef,
    name: &str,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    func: NativeFn,
) {
    let class_name = vm.class_name(class);
    let qualified = format!("{}.{}", class_name, name);
    let native = make_native(vm, &qualified, arity, vararg, defaults, func);
    let name_ref = vm.intern(name);
    let hash = vm.heap.str_hash(name_ref);
    if let Obj::Class(c) = vm.heap.get_mut(class) {
        c.methods.insert(name_ref, hash, Value::Obj(native));
    }
}

fn define_global_native(
    vm: &mut Vm,
    name: &str,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    func: NativeFn,
) {
    let native = make_native(vm, name, arity, vararg, defaults, func);
    let name_ref = vm.intern(name);
    let module = vm.core.module;
    vm.module_define(module, name_ref, Value::Obj(native));
}

// === Native implementations ===

macro_rules! native_fn {
    ($name:ident, $imp:ident) => {
        fn $name(vm: &mut Vm) -> bool {
            $imp(vm).is_ok()
        }
    };
}

native_fn!(nat_print, print_impl);
native_fn!(nat_assert, assert_impl);
native_fn!(nat_type, type_impl);
native_fn!(nat_string_new, string_new_impl);
native_fn!(nat_number_new, number_new_impl);
native_fn!(nat_list_new, list_new_impl);
native_fn!(nat_tuple_new, tuple_new_impl);
native_fn!(nat_table_new, table_new_impl);
native_fn!(nat_exception_new, exception_new_impl);
native_fn!(nat_generic_string, generic_string_impl);
native_fn!(nat_generic_len, generic_len_impl);
native_fn!(nat_generic_hash, generic_hash_impl);
native_fn!(nat_number_is_int, number_is_int_impl);
native_fn!(nat_string_escape, string_escape_impl);
native_fn!(nat_list_add, list_add_impl);
native_fn!(nat_list_pop, list_pop_impl);
native_fn!(nat_seq_iter, seq_iter_impl);
native_fn!(nat_seq_next, seq_next_impl);
native_fn!(nat_table_get, table_get_impl);
native_fn!(nat_table_set, table_set_impl);
native_fn!(nat_table_remove, table_remove_impl);
native_fn!(nat_table_contains, table_contains_impl);
native_fn!(nat_table_iter, table_iter_impl);
native_fn!(nat_table_next, table_next_impl);

/// print(...): arguments joined by a space, one trailing newline.
fn print_impl(vm: &mut Vm) -> RtResult<()> {
    let args = api::vararg_items(vm, 1);
    let mut out = String::new();
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&vm.to_display(arg)?);
    }
    out.push('\n');
    vm.write_out(&out);
    api::push_null(vm);
    Ok(())
}

fn assert_impl(vm: &mut Vm) -> RtResult<()> {
    let cond = api::get(vm, 1);
    if !cond.is_truthy() {
        let msg = vm.to_display(api::get(vm, 2))?;
        return Err(api::raise(vm, "AssertException", msg));
    }
    api::push_null(vm);
    Ok(())
}

fn type_impl(vm: &mut Vm) -> RtResult<()> {
    let v = api::get(vm, 1);
    match vm.class_of_value(v) {
        Some(class) => {
            api::push(vm, Value::Obj(class));
            Ok(())
        }
        None => Err(api::raise(vm, "TypeException", "value has no class")),
    }
}

fn string_new_impl(vm: &mut Vm) -> RtResult<()> {
    let v = api::get(vm, 1);
    let s = vm.to_display(v)?;
    api::push_str(vm, &s);
    Ok(())
}

fn number_new_impl(vm: &mut Vm) -> RtResult<()> {
    let v = api::get(vm, 1);
    match v {
        Value::Num(n) => {
            api::push_num(vm, n);
            Ok(())
        }
        Value::Obj(r) if matches!(vm.heap.get(r), Obj::String(_)) => {
            let text = vm.heap.str(r).trim().to_string();
            match text.parse::<f64>() {
                Ok(n) => {
                    api::push_num(vm, n);
                    Ok(())
                }
                Err(_) => Err(api::raise(
                    vm,
                    "InvalidArgException",
                    format!("'{}' is not a valid Number", text),
                )),
            }
        }
        other => {
            let kind = vm.kind_name(other);
            Err(api::raise(vm, "TypeException", format!("cannot convert {} to Number", kind)))
        }
    }
}

fn list_new_impl(vm: &mut Vm) -> RtResult<()> {
    let v = api::get(vm, 1);
    let items: Vec<Value> = match v {
        Value::Null => Vec::new(),
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(items) => items.clone(),
            Obj::Tuple(items) => items.to_vec(),
            _ => {
                let kind = vm.kind_name(v);
                return Err(api::raise(
                    vm,
                    "InvalidArgException",
                    format!("cannot build a List from {}", kind),
                ));
            }
        },
        _ => {
            let kind = vm.kind_name(v);
            return Err(api::raise(
                vm,
                "InvalidArgException",
                format!("cannot build a List from {}", kind),
            ));
        }
    };
    let list = vm.alloc(Obj::List(items));
    api::push(vm, Value::Obj(list));
    Ok(())
}

fn tuple_new_impl(vm: &mut Vm) -> RtResult<()> {
    let v = api::get(vm, 1);
    let items: Vec<Value> = match v {
        Value::Null => Vec::new(),
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(items) => items.clone(),
            Obj::Tuple(items) => items.to_vec(),
            _ => {
                let kind = vm.kind_name(v);
                return Err(api::raise(
                    vm,
                    "InvalidArgException",
                    format!("cannot build a Tuple from {}", kind),
                ));
            }
        },
        _ => {
            let kind = vm.kind_name(v);
            return Err(api::raise(
                vm,
                "InvalidArgException",
                format!("cannot build a Tuple from {}", kind),
            ));
        }
    };
    let tuple = vm.alloc(Obj::Tuple(items.into_boxed_slice()));
    api::push(vm, Value::Obj(tuple));
    Ok(())
}

fn table_new_impl(vm: &mut Vm) -> RtResult<()> {
    let table = vm.alloc(Obj::Table(crate::table::ValueTable::new()));
    api::push(vm, Value::Obj(table));
    Ok(())
}

/// Exception(new): stores the message, the optional cause and a null
/// stacktrace slot (filled at first raise). Inherited by every subclass.
fn exception_new_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let err = api::get(vm, 1);
    let cause = api::get(vm, 2);
    let Some(instance) = this.as_obj() else {
        return Err(api::raise(vm, "TypeException", "Exception constructor needs an instance"));
    };
    api::set_field(vm, instance, "_err", err);
    api::set_field(vm, instance, "_cause", cause);
    api::set_field(vm, instance, "_stacktrace", Value::Null);
    api::push(vm, this);
    Ok(())
}

fn generic_string_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let s = vm.to_display(this)?;
    api::push_str(vm, &s);
    Ok(())
}

fn generic_len_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let len = match this {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::String(s) => Some(s.s.len()),
            Obj::List(items) => Some(items.len()),
            Obj::Tuple(items) => Some(items.len()),
            Obj::Table(t) => Some(t.len()),
            _ => None,
        },
        _ => None,
    };
    match len {
        Some(len) => {
            api::push_num(vm, len as f64);
            Ok(())
        }
        None => {
            let kind = vm.kind_name(this);
            Err(api::raise(vm, "TypeException", format!("{} has no length", kind)))
        }
    }
}

fn generic_hash_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let hash = vm.value_hash(this)?;
    api::push_num(vm, hash as f64);
    Ok(())
}

fn number_is_int_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    api::push_bool(vm, this.is_int());
    Ok(())
}

/// The inverse of the compiler's escape decoding: produces a literal that
/// lexes back to the original bytes.
fn string_escape_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_str(vm, 0, "receiver")?;
    let mut out = String::new();
    for c in vm.heap.str(this).chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    api::push_str(vm, &out);
    Ok(())
}

fn list_add_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "List", |o| matches!(o, Obj::List(_)))?;
    let v = api::get(vm, 1);
    vm.heap.note_growth(std::mem::size_of::<Value>());
    if let Obj::List(items) = vm.heap.get_mut(this) {
        items.push(v);
    }
    api::push_null(vm);
    Ok(())
}

fn list_pop_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "List", |o| matches!(o, Obj::List(_)))?;
    let popped = match vm.heap.get_mut(this) {
        Obj::List(items) => items.pop(),
        _ => None,
    };
    match popped {
        Some(v) => {
            api::push(vm, v);
            Ok(())
        }
        None => Err(api::raise(vm, "IndexOutOfBoundException", "pop from an empty List")),
    }
}

fn seq_len(vm: &Vm, v: Value) -> Option<usize> {
    match v {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(items) => Some(items.len()),
            Obj::Tuple(items) => Some(items.len()),
            Obj::String(s) => Some(s.s.len()),
            _ => None,
        },
        _ => None,
    }
}

fn seq_iter_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let iter = api::get(vm, 1);
    let Some(len) = seq_len(vm, this) else {
        let kind = vm.kind_name(this);
        return Err(api::raise(vm, "TypeException", format!("{} is not iterable", kind)));
    };
    api::push(vm, seq_iter_step(iter, len));
    Ok(())
}

fn seq_next_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::get(vm, 0);
    let i = api::check_int(vm, 1, "iterator")? as usize;
    let v = match this {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(items) => items.get(i).copied(),
            Obj::Tuple(items) => items.get(i).copied(),
            Obj::String(_) => {
                let byte = vm.heap.str(r).as_bytes().get(i).copied();
                match byte {
                    Some(b) => {
                        let one = String::from_utf8_lossy(&[b]).into_owned();
                        let s = vm.intern(&one);
                        Some(Value::Obj(s))
                    }
                    None => None,
                }
            }
            _ => None,
        },
        _ => None,
    };
    match v {
        Some(v) => {
            api::push(vm, v);
            Ok(())
        }
        None => Err(api::raise(vm, "IndexOutOfBoundException", "iterator out of bounds")),
    }
}

fn table_get_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let key = api::get(vm, 1);
    match vm.table_get(this, key)? {
        Some(v) => {
            api::push(vm, v);
            Ok(())
        }
        None => {
            let key = vm.to_display(key)?;
            Err(api::raise(vm, "FieldException", format!("no such key: {}", key)))
        }
    }
}

fn table_set_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let key = api::get(vm, 1);
    let value = api::get(vm, 2);
    vm.table_set(this, key, value)?;
    api::push(vm, api::get(vm, 0));
    Ok(())
}

fn table_remove_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let key = api::get(vm, 1);
    let removed = vm.table_delete(this, key)?.unwrap_or(Value::Null);
    api::push(vm, removed);
    Ok(())
}

fn table_contains_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let key = api::get(vm, 1);
    let found = vm.table_get(this, key)?.is_some();
    api::push_bool(vm, found);
    Ok(())
}

/// Table iteration walks entry indices and yields keys.
fn table_iter_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let iter = api::get(vm, 1);
    let start = match iter {
        Value::Null => 0,
        Value::Num(n) => n as usize + 1,
        _ => 0,
    };
    let cap = match vm.heap.get(this) {
        Obj::Table(t) => t.capacity(),
        _ => 0,
    };
    let mut found = Value::Bool(false);
    for i in start..cap {
        let full = match vm.heap.get(this) {
            Obj::Table(t) => matches!(t.entry(i), TEntry::Full { .. }),
            _ => false,
        };
        if full {
            found = Value::Num(i as f64);
            break;
        }
    }
    api::push(vm, found);
    Ok(())
}

fn table_next_impl(vm: &mut Vm) -> RtResult<()> {
    let this = api::check_obj_kind(vm, 0, "receiver", "Table", |o| matches!(o, Obj::Table(_)))?;
    let i = api::check_int(vm, 1, "iterator")? as usize;
    let key = match vm.heap.get(this) {
        Obj::Table(t) if i < t.capacity() => match t.entry(i) {
            TEntry::Full { key, .. } => key,
            _ => Value::Null,
        },
        _ => Value::Null,
    };
    api::push(vm, key);
    Ok(())
}
