// File: src/serialize.rs
//
// Binary format for compiled modules: a magic header, a format version and
// a recursive dump of the top-level function prototype. All multi-byte
// values are big-endian; numbers are IEEE-754 bit reinterpretations.
// Line tables are not carried; loaded code reports line 0.

use std::cell::Cell;
use std::rc::Rc;

use crate::code::{Code, SymCache, Symbol};
use crate::errors::VesperError;
use crate::object::{FnProto, Obj, ObjFunction};
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

pub const MAGIC: [u8; 5] = [0xb5, b'J', b's', b'r', b'C'];
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

const TAG_NULL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_NUM: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_FUN: u8 = 5;

// === Writing ===

/// Serializes a compiled top-level function into a module file image.
pub fn write_module(vm: &Vm, function: ObjRef) -> Result<Vec<u8>, VesperError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    write_function(vm, function, &mut out)?;
    Ok(out)
}

fn write_function(vm: &Vm, function: ObjRef, out: &mut Vec<u8>) -> Result<(), VesperError> {
    let func = match vm.heap.get(function) {
        Obj::Function(f) => f,
        _ => return Err(VesperError::Deserialize("not a function".to_string())),
    };
    out.push(func.proto.arity);
    out.push(func.proto.vararg as u8);
    let name = vm.heap.str(func.proto.name);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());

    out.push(func.proto.defaults.len() as u8);
    for &d in &func.proto.defaults {
        write_value(vm, d, out)?;
    }

    out.push(func.upvalue_count);
    out.extend_from_slice(&func.stack_usage.to_be_bytes());

    out.extend_from_slice(&(func.code.bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(&func.code.bytes);

    out.extend_from_slice(&(func.code.consts.len() as u16).to_be_bytes());
    for &k in &func.code.consts {
        write_value(vm, k, out)?;
    }

    out.extend_from_slice(&(func.code.symbols.len() as u16).to_be_bytes());
    for sym in &func.code.symbols {
        out.extend_from_slice(&sym.constant.to_be_bytes());
    }
    Ok(())
}

fn write_value(vm: &Vm, v: Value, out: &mut Vec<u8>) -> Result<(), VesperError> {
    match v {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Num(n) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::String(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(&(s.s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.s.as_bytes());
            }
            Obj::Function(_) => {
                out.push(TAG_FUN);
                write_function(vm, r, out)?;
            }
            other => {
                return Err(VesperError::Deserialize(format!(
                    "{} constants cannot be serialized",
                    other.kind_name()
                )))
            }
        },
        Value::Handle(_) => {
            return Err(VesperError::Deserialize(
                "Handle constants cannot be serialized".to_string(),
            ))
        }
    }
    Ok(())
}

// === Reading ===

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VesperError> {
        if self.pos + n > self.bytes.len() {
            return Err(VesperError::Deserialize("unexpected end of file".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, VesperError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VesperError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, VesperError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, VesperError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn str(&mut self, len: usize) -> Result<String, VesperError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VesperError::Deserialize("malformed string".to_string()))
    }

    fn done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Deserializes a compiled module image; the resulting function is owned by
/// `module`. Every allocated object is pinned on the VM so the caller
/// controls the pin window.
pub fn read_module(vm: &mut Vm, module: ObjRef, bytes: &[u8]) -> Result<ObjRef, VesperError> {
    let mut r = Reader::new(bytes);
    let magic = r.take(MAGIC.len())?;
    if magic != MAGIC {
        return Err(VesperError::Deserialize("bad magic number".to_string()));
    }
    let major = r.u8()?;
    let minor = r.u8()?;
    if major != VERSION_MAJOR || minor > VERSION_MINOR {
        return Err(VesperError::VersionMismatch {
            found: (major, minor),
            expected: (VERSION_MAJOR, VERSION_MINOR),
        });
    }
    let function = read_function(vm, module, &mut r)?;
    if !r.done() {
        return Err(VesperError::Deserialize("trailing bytes after module".to_string()));
    }
    Ok(function)
}

fn read_function(vm: &mut Vm, module: ObjRef, r: &mut Reader) -> Result<ObjRef, VesperError> {
    let arity = r.u8()?;
    let vararg = r.u8()? != 0;
    let name_len = r.u16()? as usize;
    let name = r.str(name_len)?;
    let name_ref = vm.intern_pinned(&name);

    let dflt_count = r.u8()? as usize;
    let mut defaults = Vec::with_capacity(dflt_count);
    for _ in 0..dflt_count {
        defaults.push(read_value(vm, module, r)?);
    }

    let upvalue_count = r.u8()?;
    let stack_usage = r.u16()?;

    let code_len = r.u64()? as usize;
    let code_bytes = r.take(code_len)?.to_vec();

    let const_count = r.u16()? as usize;
    let mut consts = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        consts.push(read_value(vm, module, r)?);
    }

    let sym_count = r.u16()? as usize;
    let mut symbols = Vec::with_capacity(sym_count);
    for _ in 0..sym_count {
        let constant = r.u16()?;
        if constant as usize >= consts.len() {
            return Err(VesperError::Deserialize("symbol points past constant pool".to_string()));
        }
        symbols.push(Symbol { constant, cache: Cell::new(SymCache::Empty) });
    }

    let code = Code {
        lines: vec![0; code_bytes.len()],
        bytes: code_bytes,
        consts,
        symbols,
    };
    let function = ObjFunction {
        proto: FnProto { name: name_ref, module, arity, vararg, defaults },
        upvalue_count,
        stack_usage,
        code: Rc::new(code),
    };
    Ok(vm.alloc_pinned(Obj::Function(function)))
}

fn read_value(vm: &mut Vm, module: ObjRef, r: &mut Reader) -> Result<Value, VesperError> {
    match r.u8()? {
        TAG_NULL => Ok(Value::Null),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_NUM => Ok(Value::Num(f64::from_bits(r.u64()?))),
        TAG_STR => {
            let len = r.u32()? as usize;
            let s = r.str(len)?;
            Ok(Value::Obj(vm.intern_pinned(&s)))
        }
        TAG_FUN => Ok(Value::Obj(read_function(vm, module, r)?)),
        tag => Err(VesperError::Deserialize(format!("unknown constant tag {}", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(vm: &mut Vm, src: &str) -> ObjRef {
        vm.compile_source("test.vsp", src, "serialized").unwrap()
    }

    #[test]
    fn round_trip_preserves_code_and_constants() {
        let mut vm = Vm::new();
        let function = compile(&mut vm, "fun add(a, b=2) return a + b end print(add(1))");
        let image = write_module(&vm, function).unwrap();
        let module = vm.new_module("reload", "reload.vbc");
        let loaded = read_module(&mut vm, module, &image).unwrap();

        let (orig_bytes, orig_consts) = match vm.heap.get(function) {
            Obj::Function(f) => (f.code.bytes.clone(), f.code.consts.len()),
            _ => panic!("expected function"),
        };
        match vm.heap.get(loaded) {
            Obj::Function(f) => {
                assert_eq!(f.code.bytes, orig_bytes);
                assert_eq!(f.code.consts.len(), orig_consts);
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut vm = Vm::new();
        let module = vm.new_module("m", "m.vbc");
        let err = read_module(&mut vm, module, b"not a module").unwrap_err();
        assert!(matches!(err, VesperError::Deserialize(_)));
    }

    #[test]
    fn newer_major_version_is_rejected() {
        let mut vm = Vm::new();
        let function = compile(&mut vm, "print(1)");
        let mut image = write_module(&vm, function).unwrap();
        image[MAGIC.len()] = VERSION_MAJOR + 1;
        let module = vm.new_module("m2", "m2.vbc");
        let err = read_module(&mut vm, module, &image).unwrap_err();
        assert!(matches!(err, VesperError::VersionMismatch { .. }));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut vm = Vm::new();
        let function = compile(&mut vm, "print(1)");
        let image = write_module(&vm, function).unwrap();
        let module = vm.new_module("m3", "m3.vbc");
        let err = read_module(&mut vm, module, &image[..image.len() / 2]).unwrap_err();
        assert!(matches!(err, VesperError::Deserialize(_)));
    }
}
