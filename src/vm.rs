// File: src/vm.rs
//
// The Moss virtual machine.
// A register-free operand-stack machine: one dispatch loop decoding the
// byte stream, a fixed-depth call-frame stack, the open-upvalue list that
// backs closures, and the root enumeration that feeds the collector.

use std::io::{self, Write};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::bytecode::OpCode;
use crate::compiler;
use crate::errors::{RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::object::{
    BoundMethod, Class, Closure, Instance, Native, NativeFn, Obj, ObjRef, Table, Upvalue,
};
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of one `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// Process exit code for this outcome, sysexits-style.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the interpreter started, as a double.
fn native_clock(_args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(PROCESS_START.elapsed().as_secs_f64()))
}

/// One active call: the closure being run, the instruction cursor into its
/// chunk, and the first operand-stack slot that belongs to it (slot 0 is the
/// callee itself, then parameters, then locals).
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    globals: Table<Value>,
    /// Upvalues still pointing into the stack, ordered by slot (topmost
    /// last, so closing pops from the end).
    open_upvalues: Vec<ObjRef>,
    /// "init" interned once so instantiation never re-hashes it.
    init_string: ObjRef,
    out: Box<dyn Write>,
    /// Collect at every allocation site instead of waiting for the
    /// threshold.
    pub stress_gc: bool,
    /// Disassemble each compiled chunk to stderr.
    pub dump_bytecode: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` statement writes to `out`. Diagnostics
    /// always go to stderr.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap,
            globals: Table::default(),
            open_upvalues: Vec::new(),
            init_string,
            out,
            stress_gc: false,
            dump_bytecode: false,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    pub fn set_log_gc(&mut self, on: bool) {
        self.heap.log_gc = on;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Operand-stack depth; zero whenever no interpret call is running.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Call-frame depth; zero whenever no interpret call is running.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Compiles and runs one unit of source. Globals, interned strings, and
    /// heap objects survive across calls, which is what makes the REPL
    /// stateful.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compiler::compile(source, &mut self.heap, self.dump_bytecode) {
            Ok(function) => function,
            Err(_) => return InterpretResult::CompileError,
        };

        let function = self.heap.alloc(Obj::Function(function));
        self.stack.push(Value::Obj(function));
        let closure = self
            .heap
            .alloc(Obj::Closure(Closure { function, upvalues: Vec::new() }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));

        let outcome = self.call_closure(closure, 0).and_then(|_| self.run());
        match outcome {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                eprint!("{error}");
                self.reset_stack();
                InterpretResult::RuntimeError
            }
        }
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(Native { function }));
        self.globals.insert(name, Value::Obj(native));
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Builds a runtime error from the live frame stack, innermost first.
    fn runtime_error(&self, message: String) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            // ip already advanced past the failing byte; the per-byte line
            // table makes ip-1 land on the right line either way.
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = function
                .name
                .map(|n| self.heap.string(n).text.to_string());
            trace.push(TraceFrame { line, function: name });
        }
        RuntimeError { message, trace }
    }

    // === Stack primitives ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // === Instruction decoding ===

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        high << 8 | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    /// Reads a constant the compiler guarantees is an interned string.
    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            other => unreachable!("name constant was {other:?}"),
        }
    }

    // === Allocation under collection ===

    /// The only runtime allocation door: runs a collection first when the
    /// heap is past its threshold (or on every call under stress mode), so
    /// callers must keep every handle the new object depends on reachable
    /// from a root.
    fn gc_alloc(&mut self, obj: Obj) -> ObjRef {
        if self.stress_gc || self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    fn gc_intern(&mut self, text: &str) -> ObjRef {
        if self.stress_gc || self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    /// One full collection: mark every root, trace, then sweep.
    fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();
        if self.heap.log_gc {
            eprintln!("-- gc begin");
        }

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for (&name, &value) in &self.globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.sweep();

        if self.heap.log_gc {
            let after = self.heap.bytes_allocated();
            eprintln!(
                "-- gc end: freed {} bytes ({before} -> {after}), next at {}",
                before.saturating_sub(after),
                self.heap.next_gc()
            );
        }
    }

    // === Calls ===

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if argc != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {argc}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = callee {
            match self.heap.get(r) {
                Obj::Closure(_) => return self.call_closure(r, argc),
                Obj::Native(native) => {
                    let function = native.function;
                    let args_start = self.stack.len() - argc;
                    let result = function(&self.stack[args_start..]);
                    return match result {
                        Ok(value) => {
                            self.stack.truncate(args_start - 1);
                            self.push(value);
                            Ok(())
                        }
                        Err(message) => Err(self.runtime_error(message)),
                    };
                }
                Obj::Class(_) => return self.call_class(r, argc),
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, argc);
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes.".to_string()))
    }

    /// Calling a class builds the instance; `init`, when present, then runs
    /// in its place with the same arguments.
    fn call_class(&mut self, class: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let instance = self.gc_alloc(Obj::Instance(Instance {
            class,
            fields: Table::default(),
        }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);

        let initializer = self.heap.class(class).methods.get(&self.init_string).copied();
        match initializer {
            Some(initializer) => self.call_closure(initializer, argc),
            None if argc != 0 => {
                Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
            }
            None => Ok(()),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };

        // A field shadowing the method name wins; it just becomes a call.
        if let Some(&field) = self.heap.instance(instance).fields.get(&name) {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        match self.heap.class(class).methods.get(&name).copied() {
            Some(method) => self.call_closure(method, argc),
            None => {
                let name = self.heap.string(name).text.to_string();
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    /// Replaces the receiver on top of the stack with the named method bound
    /// to it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let Some(method) = self.heap.class(class).methods.get(&name).copied() else {
            let name = self.heap.string(name).text.to_string();
            return Err(self.runtime_error(format!("Undefined property '{name}'.")));
        };
        let receiver = self.peek(0);
        let bound = self.gc_alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Finds the open upvalue for a stack slot, or creates one, keeping the
    /// list ordered by slot. Two closures over the same variable share one
    /// cell.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = 0;
        for i in (0..self.open_upvalues.len()).rev() {
            let r = self.open_upvalues[i];
            match *self.heap.upvalue(r) {
                Upvalue::Open(s) if s == slot => return r,
                Upvalue::Open(s) if s < slot => {
                    insert_at = i + 1;
                    break;
                }
                _ => {}
            }
        }
        let upvalue = self.gc_alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from_slot`: the stack value
    /// moves into the cell and the cell leaves the open list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&r) = self.open_upvalues.last() {
            let slot = match *self.heap.upvalue(r) {
                Upvalue::Open(slot) => slot,
                Upvalue::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(r) = Upvalue::Closed(value);
            self.open_upvalues.pop();
        }
    }

    // === Dispatch ===

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => unreachable!("invalid opcode {byte}"),
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value),
                        None => {
                            let name = self.heap.string(name).text.to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{name}'."))
                            );
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.insert(name, value).is_none() {
                        self.globals.remove(&name);
                        let name = self.heap.string(name).text.to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[stack_slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        Upvalue::Closed(cell) => *cell = value,
                    }
                }

                OpCode::GetProperty => {
                    let instance = match self.peek(0).as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                        _ => {
                            return Err(self.runtime_error(
                                "Only instances have properties.".to_string(),
                            ))
                        }
                    };
                    let name = self.read_string();
                    if let Some(&value) = self.heap.instance(instance).fields.get(&name) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let instance = match self.peek(1).as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                        _ => {
                            return Err(
                                self.runtime_error("Only instances have fields.".to_string())
                            )
                        }
                    };
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.insert(name, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => unreachable!("superclass slot held {other:?}"),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    self.binary_number_op(|a, b| Value::Bool(a > b), "Operands must be numbers.")?;
                }
                OpCode::Less => {
                    self.binary_number_op(|a, b| Value::Bool(a < b), "Operands must be numbers.")?;
                }
                OpCode::Add => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::Obj(ar), Value::Obj(br))
                            if matches!(self.heap.get(ar), Obj::String(_))
                                && matches!(self.heap.get(br), Obj::String(_)) =>
                        {
                            self.concatenate(ar, br);
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Subtract => {
                    self.binary_number_op(
                        |a, b| Value::Number(a - b),
                        "Operands must be numbers.",
                    )?;
                }
                OpCode::Multiply => {
                    self.binary_number_op(
                        |a, b| Value::Number(a * b),
                        "Operands must be numbers.",
                    )?;
                }
                OpCode::Divide => {
                    self.binary_number_op(
                        |a, b| Value::Number(a / b),
                        "Operands must be numbers.",
                    )?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    match self.peek(0) {
                        Value::Number(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        _ => {
                            return Err(
                                self.runtime_error("Operand must be a number.".to_string())
                            )
                        }
                    }
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.out, "{text}");
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => unreachable!("superclass slot held {other:?}"),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        other => unreachable!("closure constant was {other:?}"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count as usize;
                    let closure = self.gc_alloc(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Rooted before the capture loop; capturing can allocate.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().slots_base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        self.pop(); // the script closure
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.gc_alloc(Obj::Class(Class {
                        name,
                        methods: Table::default(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1).as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                        _ => {
                            return Err(
                                self.runtime_error("Superclass must be a class.".to_string())
                            )
                        }
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        other => unreachable!("subclass slot held {other:?}"),
                    };
                    let methods: Vec<(ObjRef, ObjRef)> = self
                        .heap
                        .class(superclass)
                        .methods
                        .iter()
                        .map(|(&k, &v)| (k, v))
                        .collect();
                    self.heap.class_mut(subclass).methods.extend(methods);
                    self.pop(); // subclass
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = match self.peek(0) {
                        Value::Obj(r) => r,
                        other => unreachable!("method slot held {other:?}"),
                    };
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        other => unreachable!("class slot held {other:?}"),
                    };
                    self.heap.class_mut(class).methods.insert(name, method);
                    self.pop();
                }
            }
        }
    }

    fn binary_number_op(
        &mut self,
        op: fn(f64, f64) -> Value,
        message: &str,
    ) -> Result<(), RuntimeError> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(self.runtime_error(message.to_string()));
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    /// String concatenation for OpCode::Add. The operands stay on the stack
    /// while the result is interned so a collection can't reap them.
    fn concatenate(&mut self, a: ObjRef, b: ObjRef) {
        let text = format!("{}{}", self.heap.string(a).text, self.heap.string(b).text);
        let result = self.gc_intern(&text);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (InterpretResult, Vm) {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        let result = vm.interpret(source);
        (result, vm)
    }

    #[test]
    fn stacks_are_empty_after_interpret_returns() {
        let (result, vm) = run("var a = 1; { var b = a + 2; print b; }");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_depth(), 0);
    }

    #[test]
    fn stacks_are_reset_after_a_runtime_error() {
        let (result, vm) = run("fun f() { return missing; } f();");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_depth(), 0);
    }

    #[test]
    fn globals_survive_across_interpret_calls() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(vm.interpret("var counter = 41;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("counter = counter + 1;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print counter;"), InterpretResult::Ok);
    }

    #[test]
    fn stress_collection_keeps_reachable_objects_alive() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        vm.stress_gc = true;
        let result = vm.interpret(
            "var s = \"\";\n\
             for (var i = 0; i < 40; i = i + 1) { s = s + \"x\"; }\n\
             var keep = s + \"!\";\n\
             print keep;",
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn collection_reclaims_unreachable_strings() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(
            vm.interpret("var tmp = \"aaa\" + \"bbb\"; tmp = nil;"),
            InterpretResult::Ok
        );
        let interned_before = vm.heap().interned_count();
        vm.collect_garbage();
        // "aaabbb" is garbage now; the literal pieces stay pinned by the
        // chunk constants of the script closure... which is itself garbage
        // once the frame stack is empty, so at least the concatenation dies.
        assert!(vm.heap().interned_count() < interned_before);
    }

    #[test]
    fn byte_accounting_is_stable_across_idle_collections() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(vm.interpret("var x = \"keep me\";"), InterpretResult::Ok);
        vm.collect_garbage();
        let first = vm.heap().bytes_allocated();
        vm.collect_garbage();
        assert_eq!(vm.heap().bytes_allocated(), first);
    }

    #[test]
    fn open_upvalues_share_one_cell_per_slot() {
        let (result, vm) = run(
            "fun pair() {\n\
               var shared = 0;\n\
               fun inc() { shared = shared + 1; return shared; }\n\
               fun get() { return shared; }\n\
               inc();\n\
               if (get() != 1) { print missing; }\n\
               return get;\n\
             }\n\
             var g = pair();\n\
             if (g() != 1) { print missing; }",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn clock_native_returns_a_number() {
        let (result, _) = run("var t = clock(); if (t < 0) { print missing; }");
        assert_eq!(result, InterpretResult::Ok);
    }
}
