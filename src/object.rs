// File: src/object.rs
//
// Heap object variants for the Moss runtime.
// Every reference-typed value (strings, functions, closures, upvalues,
// natives, classes, instances, bound methods) lives in the heap and is
// addressed through an ObjRef handle.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use nohash_hasher::BuildNoHashHasher;

use crate::bytecode::Chunk;
use crate::value::Value;

/// Handle to an object slot in the heap.
///
/// Handles compare and hash by identity. Since strings are interned,
/// identity equality is content equality for string handles, which is what
/// lets the globals, method, and field tables hash the raw index directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Hash for ObjRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0);
    }
}

impl nohash_hasher::IsEnabled for ObjRef {}

/// Hash table keyed by interned-string identity. Used for globals, class
/// method tables, and instance fields; the key's index is the hash.
pub type Table<V> = HashMap<ObjRef, V, BuildNoHashHasher<ObjRef>>;

/// One heap object.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Native(Native),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// Interned immutable string plus its cached FNV-1a hash. The heap holds at
/// most one of these per distinct byte sequence.
#[derive(Debug)]
pub struct ObjString {
    pub text: Box<str>,
    pub hash: u32,
}

/// A compiled function: parameter count, captured-variable count, and the
/// bytecode chunk produced for its body. `name` is None for the top-level
/// script.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: u16,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

impl Function {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

/// A function paired with the upvalues it captured. This is what user code
/// actually calls; bare functions only appear in constant pools.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open while the variable's storage is still a live
/// operand-stack slot; closed once the value has moved into the cell.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// Native call signature: arguments in, value out. `Err` aborts the program
/// with a runtime error carrying the message.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// Built-in function implemented in Rust.
#[derive(Debug)]
pub struct Native {
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    /// Method name -> closure handle.
    pub methods: Table<ObjRef>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table<Value>,
}

/// A method closure bound to the receiver it was accessed through, so the
/// receiver can be re-installed in slot zero when the method is called later.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
