// File: src/heap.rs
//
// Object heap for the Moss runtime: slab allocation with byte accounting,
// string interning keyed by the cached FNV-1a hash, and the mark-sweep half
// of the collector. Root enumeration lives in the VM (it owns the stacks);
// the heap owns marking, tracing, and sweeping.

use std::collections::HashMap;
use std::mem;

use nohash_hasher::BuildNoHashHasher;

use crate::object::{Obj, ObjRef, ObjString};
use crate::value::{format_number, Value};

/// Heap threshold doubles after each collection.
const GC_HEAP_GROW_FACTOR: usize = 2;
/// Bytes of live data before the first collection fires.
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// FNV-1a, 32-bit. Cached on every interned string and used as the interning
/// table key.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in text.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    marked: Vec<bool>,
    free: Vec<u32>,
    /// Interning table: FNV-1a hash -> handles carrying that hash. Contents
    /// are compared on collision; at most one handle exists per byte
    /// sequence.
    strings: HashMap<u32, Vec<ObjRef>, BuildNoHashHasher<u32>>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    /// Report collection activity to stderr.
    pub log_gc: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            marked: Vec::new(),
            free: Vec::new(),
            strings: HashMap::default(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
            gray: Vec::new(),
            log_gc: false,
        }
    }

    /// Places an object in the heap and returns its handle. Never collects;
    /// the VM decides when to run a collection before allocating.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += object_size(&obj);
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                self.marked.push(false);
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Returns the handle for `text`, allocating and recording a new string
    /// only if no equal one exists.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        if let Some(bucket) = self.strings.get(&hash) {
            if let Some(&existing) =
                bucket.iter().find(|&&r| self.string(r).text.as_ref() == text)
            {
                return existing;
            }
        }
        let r = self.alloc(Obj::String(ObjString { text: text.into(), hash }));
        self.strings.entry(hash).or_default().push(r);
        r
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// True once live bytes have outgrown the collection threshold.
    pub fn wants_gc(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Number of distinct interned strings currently alive.
    pub fn interned_count(&self) -> usize {
        self.strings.values().map(Vec::len).sum()
    }

    // === Object access ===

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(obj) => obj,
            None => unreachable!("stale object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => unreachable!("stale object handle {:?}", r),
        }
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            other => unreachable!("expected string, found {other:?}"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::Function {
        match self.get(r) {
            Obj::Function(f) => f,
            other => unreachable!("expected function, found {other:?}"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => unreachable!("expected closure, found {other:?}"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::Closure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            other => unreachable!("expected closure, found {other:?}"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {other:?}"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {other:?}"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::Class {
        match self.get(r) {
            Obj::Class(c) => c,
            other => unreachable!("expected class, found {other:?}"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::Class {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            other => unreachable!("expected class, found {other:?}"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::Instance {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => unreachable!("expected instance, found {other:?}"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::Instance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            other => unreachable!("expected instance, found {other:?}"),
        }
    }

    // === Printing ===

    /// Renders a value the way `print` shows it.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::String(s) => s.text.to_string(),
            Obj::Function(f) => self.format_function(f.name),
            Obj::Closure(c) => {
                let name = self.function(c.function).name;
                self.format_function(name)
            }
            Obj::BoundMethod(b) => {
                let function = self.closure(b.method).function;
                self.format_function(self.function(function).name)
            }
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Class(c) => self.string(c.name).text.to_string(),
            Obj::Instance(i) => {
                let class = self.class(i.class);
                format!("{} instance", self.string(class.name).text)
            }
            Obj::Upvalue(_) => "upvalue".to_string(),
        }
    }

    fn format_function(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(name) => format!("<fn {}>", self.string(name).text),
            None => "<script>".to_string(),
        }
    }

    // === Collection ===

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if self.marked[r.index()] {
            return;
        }
        self.marked[r.index()] = true;
        self.gray.push(r);
    }

    /// Drains the gray worklist, blackening each object by marking its
    /// children. Call after every root has been marked.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let mut refs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                refs.extend(f.name);
                values.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                refs.push(c.function);
                refs.extend_from_slice(&c.upvalues);
            }
            Obj::Upvalue(u) => {
                if let crate::object::Upvalue::Closed(v) = u {
                    values.push(*v);
                }
            }
            Obj::Class(c) => {
                refs.push(c.name);
                for (&name, &method) in &c.methods {
                    refs.push(name);
                    refs.push(method);
                }
            }
            Obj::Instance(i) => {
                refs.push(i.class);
                for (&name, &value) in &i.fields {
                    refs.push(name);
                    values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                values.push(b.receiver);
                refs.push(b.method);
            }
        }
        for value in values {
            self.mark_value(value);
        }
        for child in refs {
            self.mark_object(child);
        }
    }

    /// Frees every unmarked object, clears the surviving marks, drops dead
    /// interning entries, and rebuilds the byte count from the survivors.
    pub fn sweep(&mut self) {
        for bucket in self.strings.values_mut() {
            bucket.retain(|r| self.marked[r.index()]);
        }
        self.strings.retain(|_, bucket| !bucket.is_empty());

        let mut live_bytes = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].is_none() {
                continue;
            }
            if self.marked[index] {
                self.marked[index] = false;
                live_bytes += object_size(self.slots[index].as_ref().unwrap());
            } else {
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = live_bytes * GC_HEAP_GROW_FACTOR;
    }
}

/// Approximate footprint of one object: the enum itself plus owned payload.
/// Recomputed at sweep time so the post-collection byte count reflects
/// containers that grew since allocation.
fn object_size(obj: &Obj) -> usize {
    let payload = match obj {
        Obj::String(s) => s.text.len(),
        Obj::Function(f) => {
            f.chunk.code.len()
                + f.chunk.constants.len() * mem::size_of::<Value>()
                + f.chunk.lines.len() * mem::size_of::<u32>()
        }
        Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.len() * 2 * mem::size_of::<ObjRef>(),
        Obj::Instance(i) => {
            i.fields.len() * (mem::size_of::<ObjRef>() + mem::size_of::<Value>())
        }
        Obj::Upvalue(_) | Obj::Native(_) | Obj::BoundMethod(_) => 0,
    };
    mem::size_of::<Obj>() + payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }

    #[test]
    fn interning_returns_the_same_handle_for_equal_contents() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a).text.as_ref(), "hello");
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn interned_strings_cache_their_hash() {
        let mut heap = Heap::new();
        let r = heap.intern("moss");
        assert_eq!(heap.string(r).hash, hash_str("moss"));
    }

    #[test]
    fn sweep_frees_unmarked_objects_and_reuses_slots() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop");
        assert_eq!(heap.interned_count(), 2);

        heap.mark_object(keep);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.interned_count(), 1);
        assert_eq!(heap.string(keep).text.as_ref(), "keep");
        // the freed slot is recycled
        let revived = heap.intern("drop");
        assert_eq!(revived.index(), 1);
    }

    #[test]
    fn sweep_recomputes_byte_accounting() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _garbage = heap.intern("garbage garbage garbage");
        let before = heap.bytes_allocated();

        heap.mark_object(keep);
        heap.trace_references();
        heap.sweep();

        let after = heap.bytes_allocated();
        assert!(after < before);
        assert_eq!(after, mem::size_of::<Obj>() + "keep".len());
        assert_eq!(heap.next_gc(), after * GC_HEAP_GROW_FACTOR);
    }
}
