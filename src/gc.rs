// File: src/gc.rs
//
// The garbage-collected object heap.
// Objects live in a slot arena with a free list; a single allocation choke
// point maintains the live-byte counter that schedules collection. Marking
// is tri-color with an explicit gray worklist; the interned-string pool is
// swept first (dead entries become tombstones) so interning keeps working
// across cycles.

use once_cell::sync::Lazy;

use crate::code::SymCache;
use crate::object::{hash_bytes, Obj, ObjString, ObjUpvalue};
use crate::value::{ObjRef, Value};

/// Collection starts once this many bytes are live, then re-arms at
/// `live * HEAP_GROW_FACTOR` after each cycle.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

static GC_STRESS: Lazy<bool> = Lazy::new(|| std::env::var("VESPER_GC_STRESS").is_ok());
static GC_TRACE: Lazy<bool> = Lazy::new(|| std::env::var("VESPER_GC_TRACE").is_ok());

/// A heap cell: the object payload plus the shared header every object
/// carries (class pointer and mark bit).
#[derive(Debug)]
pub struct Slot {
    pub obj: Obj,
    /// Patched in a second pass for objects born before their class.
    pub class: Option<ObjRef>,
    pub marked: bool,
}

/// Aggregated collection statistics.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    allocated: usize,
    next_gc: usize,
    /// Gray worklist, kept allocated across cycles.
    gray: Vec<ObjRef>,
    strings: InternPool,
    pub stats: GcStats,
    /// Bootstrap runs with collection off until the core classes exist.
    pub paused: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            strings: InternPool::new(),
            stats: GcStats::default(),
            paused: false,
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// True when the next allocation should run a collection first.
    pub fn wants_gc(&self) -> bool {
        !self.paused && (*GC_STRESS || self.allocated > self.next_gc)
    }

    /// The single allocation point. Callers that can reach the VM go
    /// through `Vm::alloc`, which collects first when [`Heap::wants_gc`].
    pub fn alloc_raw(&mut self, obj: Obj, class: Option<ObjRef>) -> ObjRef {
        self.allocated += obj.byte_size();
        let slot = Slot { obj, class, marked: false };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                ObjRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.slots[r.index()].as_ref().unwrap().obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slots[r.index()].as_mut().unwrap().obj
    }

    pub fn class_of(&self, r: ObjRef) -> Option<ObjRef> {
        self.slots[r.index()].as_ref().unwrap().class
    }

    pub fn set_class(&mut self, r: ObjRef, class: ObjRef) {
        self.slots[r.index()].as_mut().unwrap().class = Some(class);
    }

    /// The class-pointer patch pass: assigns `class` to every live object
    /// selected by `pick` that does not have one yet.
    pub fn patch_classes(&mut self, class: ObjRef, pick: impl Fn(&Obj) -> bool) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.class.is_none() && pick(&slot.obj) {
                slot.class = Some(class);
            }
        }
    }

    pub fn str(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::String(s) => &s.s,
            _ => "",
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::String(s) => s.hash,
            _ => 0,
        }
    }

    /// Interns a string: returns the existing object for equal contents,
    /// else allocates. Pointer equality of interned strings is semantic
    /// equality.
    pub fn intern(&mut self, s: &str, class: Option<ObjRef>) -> ObjRef {
        let hash = hash_bytes(s.as_bytes());
        if let Some(existing) = self.strings.find(s, hash, &self.slots) {
            return existing;
        }
        let r = self.alloc_raw(Obj::String(ObjString { s: s.to_string(), hash }), class);
        self.strings.insert(hash, r);
        r
    }

    // === Collection ===

    /// Runs a full mark-sweep cycle. `roots` is the flattened root set the
    /// VM gathered: stack slots, frame functions, open upvalues, modules,
    /// core class handles, compiler and API pins, the in-flight exception.
    pub fn collect(&mut self, roots: &[Value]) {
        let before = self.allocated;
        let mut gray = std::mem::take(&mut self.gray);
        gray.clear();

        for &v in roots {
            self.mark_value(v, &mut gray);
        }

        // Propagate: blacken until the worklist drains.
        let mut children: Vec<Value> = Vec::new();
        while let Some(r) = gray.pop() {
            children.clear();
            if let Some(class) = self.class_of(r) {
                children.push(Value::Obj(class));
            }
            self.gather_children(r, &mut children);
            for i in 0..children.len() {
                self.mark_value(children[i], &mut gray);
            }
        }

        // String pool first: entries for unreached strings become
        // tombstones so the pool stays probe-consistent.
        self.strings.sweep(&self.slots);

        // Sweep the arena; survivors turn white again.
        let mut freed = 0;
        for (idx, cell) in self.slots.iter_mut().enumerate() {
            match cell {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    freed += slot.obj.byte_size();
                    *cell = None;
                    self.free.push(idx as u32);
                }
                None => {}
            }
        }
        self.allocated -= freed;
        self.next_gc = (self.allocated * HEAP_GROW_FACTOR).max(FIRST_GC_THRESHOLD);
        self.gray = gray;

        self.stats.cycles += 1;
        self.stats.total_freed_bytes += freed;
        self.stats.last_freed_bytes = freed;
        self.stats.last_before_bytes = before;
        if *GC_TRACE {
            eprintln!(
                "[gc] cycle {}: {} -> {} bytes (freed {}), next at {}",
                self.stats.cycles, before, self.allocated, freed, self.next_gc
            );
        }
    }

    fn mark_value(&mut self, v: Value, gray: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = v {
            let slot = self.slots[r.index()].as_mut().unwrap();
            if !slot.marked {
                slot.marked = true;
                gray.push(r);
            }
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index()].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    fn gather_children(&self, r: ObjRef, out: &mut Vec<Value>) {
        match self.get(r) {
            Obj::String(_) | Obj::StackTrace(_) => {}
            Obj::Function(f) => {
                out.push(Value::Obj(f.proto.name));
                out.push(Value::Obj(f.proto.module));
                out.extend(f.proto.defaults.iter().copied());
                out.extend(f.code.consts.iter().copied());
                // Inline caches hold class keys and resolved methods; keep
                // them live so a recycled slot can never alias a cache key.
                for sym in &f.code.symbols {
                    match sym.cache.get() {
                        SymCache::Empty => {}
                        SymCache::Method { class, method }
                        | SymCache::BoundMethod { class, method } => {
                            out.push(Value::Obj(class));
                            out.push(method);
                        }
                        SymCache::Field { class, .. } => out.push(Value::Obj(class)),
                        SymCache::Global { module, .. } => out.push(Value::Obj(module)),
                    }
                }
            }
            Obj::Native(n) => {
                out.push(Value::Obj(n.proto.name));
                out.push(Value::Obj(n.proto.module));
                out.extend(n.proto.defaults.iter().copied());
            }
            Obj::Closure(c) => {
                out.push(Value::Obj(c.function));
                out.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            Obj::Upvalue(u) => {
                if let ObjUpvalue::Closed(v) = u {
                    out.push(*v);
                }
            }
            Obj::Class(c) => {
                out.push(Value::Obj(c.name));
                if let Some(s) = c.superclass {
                    out.push(Value::Obj(s));
                }
                for (k, v) in c.methods.iter() {
                    out.push(Value::Obj(k));
                    out.push(*v);
                }
                for (k, _) in c.field_layout.iter() {
                    out.push(Value::Obj(k));
                }
            }
            Obj::Instance(i) => {
                out.extend(i.slots.iter().copied().flatten());
            }
            Obj::Module(m) => {
                out.push(Value::Obj(m.name));
                out.push(Value::Obj(m.path));
                for (k, _) in m.names.iter() {
                    out.push(Value::Obj(k));
                }
                out.extend(m.globals.iter().copied());
            }
            Obj::List(items) => out.extend(items.iter().copied()),
            Obj::Tuple(items) => out.extend(items.iter().copied()),
            Obj::Table(t) => {
                for (k, v) in t.iter_live() {
                    out.push(k);
                    out.push(v);
                }
            }
            Obj::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(b.method);
            }
        }
    }

    /// Records growth of an already-allocated object's backing storage so
    /// collection scheduling tracks mutation (lists, tables, instances).
    pub fn note_growth(&mut self, bytes: usize) {
        self.allocated += bytes;
    }
}

/// Weak set of interned strings: open-addressed, keyed by (hash, bytes).
struct InternPool {
    entries: Vec<PEntry>,
    live: usize,
    used: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum PEntry {
    Empty,
    Tombstone,
    Full { hash: u32, r: ObjRef },
}

impl InternPool {
    fn new() -> Self {
        Self { entries: Vec::new(), live: 0, used: 0 }
    }

    fn find(&self, s: &str, hash: u32, slots: &[Option<Slot>]) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.entries[idx] {
                PEntry::Empty => return None,
                PEntry::Tombstone => {}
                PEntry::Full { hash: h, r } => {
                    if h == hash {
                        if let Some(slot) = slots[r.index()].as_ref() {
                            if let Obj::String(os) = &slot.obj {
                                if os.s == s {
                                    return Some(r);
                                }
                            }
                        }
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn insert(&mut self, hash: u32, r: ObjRef) {
        if self.entries.is_empty() || 4 * (self.used + 1) > 3 * self.entries.len() {
            self.grow();
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.entries[idx] {
                PEntry::Empty => {
                    self.entries[idx] = PEntry::Full { hash, r };
                    self.live += 1;
                    self.used += 1;
                    return;
                }
                PEntry::Tombstone => {
                    self.entries[idx] = PEntry::Full { hash, r };
                    self.live += 1;
                    return;
                }
                PEntry::Full { .. } => idx = (idx + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { 64 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![PEntry::Empty; new_cap]);
        self.live = 0;
        self.used = 0;
        for e in old {
            if let PEntry::Full { hash, r } = e {
                self.insert(hash, r);
            }
        }
    }

    /// Entries whose string was not reached this cycle become tombstones.
    fn sweep(&mut self, slots: &[Option<Slot>]) {
        for e in &mut self.entries {
            if let PEntry::Full { r, .. } = *e {
                let dead = slots[r.index()].as_ref().map(|s| !s.marked).unwrap_or(true);
                if dead {
                    *e = PEntry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_identical_handles() {
        let mut heap = Heap::new();
        let a = heap.intern("hello", None);
        let b = heap.intern("hello", None);
        let c = heap.intern("world", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_roots() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep", None);
        let _drop = heap.intern("drop", None);
        let before = heap.allocated();
        heap.collect(&[Value::Obj(keep)]);
        assert!(heap.allocated() < before);
        assert_eq!(heap.str(keep), "keep");
        // The pool entry for the dead string was tombstoned; re-interning
        // the same text works and yields a live object again.
        let drop2 = heap.intern("drop", None);
        assert_eq!(heap.str(drop2), "drop");
    }

    #[test]
    fn collect_traces_through_lists() {
        let mut heap = Heap::new();
        let s = heap.intern("element", None);
        let list = heap.alloc_raw(Obj::List(vec![Value::Obj(s)]), None);
        heap.collect(&[Value::Obj(list)]);
        assert_eq!(heap.str(s), "element");
        // Interning still finds it: the pool entry survived.
        let again = heap.intern("element", None);
        assert_eq!(s, again);
    }

    #[test]
    fn slots_are_reused_after_collection() {
        let mut heap = Heap::new();
        let dead = heap.intern("transient", None);
        heap.collect(&[]);
        let fresh = heap.intern("other", None);
        // The freed slot is recycled.
        assert_eq!(dead, fresh);
    }
}
