// File: src/vm.rs
//
// The single-threaded stack-based bytecode interpreter. Reads one chunk
// of compiled code at a time, via a call-frame stack mirroring the
// native call stack rather than recursing through Rust function calls.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::chunk::OpCode;
use crate::compiler;
use crate::gc::{Heap, RootSource};
use crate::native;
use crate::table::Table;
use crate::value::{
    fnv1a_hash, values_equal, ObjBoundMethod, ObjClosure, ObjHandle, ObjPayload, UpvalueState,
    Value,
};

const FRAMES_MAX: usize = 256;

pub enum InterpretError {
    Compile,
    Runtime(String),
}

struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    /// Index into `Vm::stack` where this frame's slot window begins.
    slot_base: usize,
}

/// The VM's operand stack. Slots are plain `Value`s by default; under the
/// `nan_boxing` feature they're packed into the 64-bit layout from spec
/// §3's alternate representation (`Value::to_bits`/`from_bits`) instead,
/// with identical observable behavior at every call site below. This is
/// the highest-volume value storage in the interpreter and the classic
/// motivation for NaN-boxing, so it's the one place the packed layout is
/// actually used for storage rather than just round-tripping in tests.
struct ValueStack {
    #[cfg(not(feature = "nan_boxing"))]
    slots: Vec<Value>,
    #[cfg(feature = "nan_boxing")]
    slots: Vec<u64>,
}

impl ValueStack {
    fn new() -> Self {
        ValueStack { slots: Vec::new() }
    }

    fn push(&mut self, value: Value) {
        #[cfg(not(feature = "nan_boxing"))]
        {
            self.slots.push(value);
        }
        #[cfg(feature = "nan_boxing")]
        {
            self.slots.push(value.to_bits());
        }
    }

    fn pop(&mut self) -> Value {
        let slot = self.slots.pop().expect("stack underflow");
        #[cfg(not(feature = "nan_boxing"))]
        {
            slot
        }
        #[cfg(feature = "nan_boxing")]
        {
            Value::from_bits(slot)
        }
    }

    fn get(&self, index: usize) -> Value {
        #[cfg(not(feature = "nan_boxing"))]
        {
            self.slots[index]
        }
        #[cfg(feature = "nan_boxing")]
        {
            Value::from_bits(self.slots[index])
        }
    }

    fn set(&mut self, index: usize, value: Value) {
        #[cfg(not(feature = "nan_boxing"))]
        {
            self.slots[index] = value;
        }
        #[cfg(feature = "nan_boxing")]
        {
            self.slots[index] = value.to_bits();
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn truncate(&mut self, len: usize) {
        self.slots.truncate(len)
    }

    fn clear(&mut self) {
        self.slots.clear()
    }

    fn iter_values(&self) -> impl Iterator<Item = Value> + '_ {
        #[cfg(not(feature = "nan_boxing"))]
        {
            self.slots.iter().copied()
        }
        #[cfg(feature = "nan_boxing")]
        {
            self.slots.iter().map(|&bits| Value::from_bits(bits))
        }
    }

    /// Copies out the top `n` slots, oldest first, without popping them.
    fn tail_values(&self, n: usize) -> Vec<Value> {
        let from = self.len() - n;
        (from..self.len()).map(|i| self.get(i)).collect()
    }
}

/// An `Rc<RefCell<Vec<u8>>>`-backed sink used by tests to capture what
/// `print` writes without redirecting the process's real stdout -- the
/// teacher's own integration suite has no `gag`-style output-capture
/// dependency, so this is the plain-`Write`-impl equivalent.
#[derive(Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        SharedOutput(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

pub struct Vm {
    pub heap: Heap,
    frames: Vec<CallFrame>,
    stack: ValueStack,
    globals: Table,
    /// Head of the open-upvalue list, sorted by descending stack slot, per
    /// the singly linked list the closing pass walks.
    open_upvalues: Option<ObjHandle>,
    init_string: ObjHandle,
    output: Box<dyn Write>,
}

/// Narrow view of everything reachable while the VM is the active root
/// source, borrowed field-by-field so it can coexist with a mutable
/// borrow of `Vm::heap` at the same call site -- the same trick
/// `compiler::CompilerRoots` uses for the compiler's own fields.
struct VmRoots<'b> {
    frames: &'b [CallFrame],
    stack: &'b ValueStack,
    globals: &'b Table,
    open_upvalues: Option<ObjHandle>,
    init_string: ObjHandle,
}

impl<'b> RootSource for VmRoots<'b> {
    fn mark_roots(&self, heap: &mut Heap) {
        for value in self.stack.iter_values() {
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        heap.mark_object(self.init_string);
        let mut upvalue = self.open_upvalues;
        while let Some(handle) = upvalue {
            heap.mark_object(handle);
            upvalue = match heap.get(handle) {
                ObjPayload::Upvalue(u) => u.next,
                _ => None,
            };
        }
        let globals: Vec<(ObjHandle, Value)> = self.globals.iter().collect();
        for (key, value) in globals {
            heap.mark_object(key);
            heap.mark_value(value);
        }
    }
}

struct NoRoots;
impl RootSource for NoRoots {
    fn mark_roots(&self, _heap: &mut Heap) {}
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Builds a VM that writes `print` output to `output` instead of
    /// stdout, for tests that need to assert on exactly what the
    /// interpreter printed rather than just whether it ran.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init", &NoRoots);

        let mut vm = Vm {
            heap,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: ValueStack::new(),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            output,
        };
        native::define_natives(&mut vm);
        vm
    }

    fn roots(&self) -> VmRoots<'_> {
        VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        }
    }

    pub fn set_stress_gc(&mut self, enabled: bool) {
        self.heap.stress_gc = enabled || cfg!(feature = "stress_gc");
    }

    pub fn define_native(&mut self, name: &str, arity: u8, function: crate::value::NativeFn) {
        let name_handle = self.heap.intern_string(name, &NoRoots);
        let native_handle = self.heap.new_native(
            crate::value::ObjNative { arity, function, name: name_handle },
            &NoRoots,
        );
        self.globals.set(name_handle, fnv1a_hash(name.as_bytes()), Value::Obj(native_handle));
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_handle = match compiler::compile(source, &mut self.heap) {
            Some(handle) => handle,
            None => return Err(InterpretError::Compile),
        };

        self.stack.push(Value::Obj(function_handle));
        let closure = ObjClosure { function: function_handle, upvalues: Vec::new() };
        let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
        let closure_handle = self.heap.new_closure(closure, &roots);
        self.stack.pop();
        self.stack.push(Value::Obj(closure_handle));

        self.call(closure_handle, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let closure = self.frame().closure;
        let ip = self.frame().ip;
        let byte = self.code_byte(closure, ip);
        self.frame_mut().ip += 1;
        byte
    }

    fn code_byte(&self, closure_handle: ObjHandle, ip: usize) -> u8 {
        let closure = self.as_closure(closure_handle);
        let function = self.as_function(closure.function);
        function.chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let closure = self.as_closure(self.frame().closure);
        let function = self.as_function(closure.function);
        function.chunk.constants[index]
    }

    fn as_closure(&self, handle: ObjHandle) -> &ObjClosure {
        match self.heap.get(handle) {
            ObjPayload::Closure(c) => c,
            _ => unreachable!("frame closure handle must name a closure"),
        }
    }

    fn as_function(&self, handle: ObjHandle) -> &crate::value::ObjFunction {
        match self.heap.get(handle) {
            ObjPayload::Function(f) => f,
            _ => unreachable!("closure function handle must name a function"),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack.get(self.stack.len() - 1 - distance)
    }

    fn runtime_error(&mut self, message: String) -> String {
        let mut lines = vec![message];
        for frame in self.frames.iter().rev() {
            let closure = self.as_closure(frame.closure);
            let function = self.as_function(closure.function);
            let line = function.chunk.line_of(frame.ip.saturating_sub(1));
            let name = function
                .name
                .map(|h| self.heap.as_str(h).to_string())
                .unwrap_or_else(|| "script".to_string());
            lines.push(format!("[line {}] in {}", line, name));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        lines.join("\n")
    }

    fn run(&mut self) -> Result<(), String> {
        loop {
            #[cfg(feature = "trace_execution")]
            self.trace_instruction();

            let instruction = OpCode::from_byte(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let b0 = self.read_byte() as usize;
                    let b1 = self.read_byte() as usize;
                    let b2 = self.read_byte() as usize;
                    let index = (b0 << 16) | (b1 << 8) | b2;
                    let closure = self.as_closure(self.frame().closure);
                    let function = self.as_function(closure.function);
                    self.push(function.chunk.constants[index]);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0);
                    self.push(v);
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.push(self.stack.get(base + slot));
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    let v = self.peek(0);
                    self.stack.set(base + slot, v);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant_string();
                    let hash = self.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.heap.as_str(name).to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{}'.", n)));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant_string();
                    let hash = self.string_hash(name);
                    let v = self.pop();
                    self.globals.set(name, hash, v);
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant_string();
                    let hash = self.string_hash(name);
                    let v = self.peek(0);
                    if self.globals.set(name, hash, v) {
                        self.globals.delete(name, hash);
                        let n = self.heap.as_str(name).to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", n)));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.as_closure(self.frame().closure);
                    let upvalue_handle = closure.upvalues[slot];
                    let value = self.upvalue_value(upvalue_handle);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.as_closure(self.frame().closure);
                    let upvalue_handle = closure.upvalues[slot];
                    let value = self.peek(0);
                    self.set_upvalue_value(upvalue_handle, value);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::GetProperty => {
                    let receiver = self.peek(0);
                    let instance_handle = match receiver {
                        Value::Obj(h) if matches!(self.heap.get(h), ObjPayload::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have properties.".to_string())),
                    };
                    let name = self.read_constant_string();
                    let hash = self.string_hash(name);
                    let field = match self.heap.get(instance_handle) {
                        ObjPayload::Instance(i) => i.fields.get(name, hash),
                        _ => unreachable!(),
                    };
                    if let Some(v) = field {
                        self.pop();
                        self.push(v);
                    } else {
                        let class_handle = match self.heap.get(instance_handle) {
                            ObjPayload::Instance(i) => i.class,
                            _ => unreachable!(),
                        };
                        self.bind_method(class_handle, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let instance_handle = match self.peek(1) {
                        Value::Obj(h) if matches!(self.heap.get(h), ObjPayload::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have fields.".to_string())),
                    };
                    let name = self.read_constant_string();
                    let hash = self.string_hash(name);
                    let value = self.pop();
                    match self.heap.get_mut(instance_handle) {
                        ObjPayload::Instance(i) => i.fields.set(name, hash, value),
                        _ => unreachable!(),
                    };
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_constant_string();
                    let superclass_handle = match self.pop() {
                        Value::Obj(h) => h,
                        _ => unreachable!("super is always a class"),
                    };
                    self.bind_method(superclass_handle, name)?;
                }
                OpCode::Invoke => {
                    let name = self.read_constant_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_constant_string();
                    let argc = self.read_byte() as usize;
                    let superclass_handle = match self.pop() {
                        Value::Obj(h) => h,
                        _ => unreachable!("super is always a class"),
                    };
                    self.invoke_from_class(superclass_handle, name, argc)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Modulo => self.binary_number_op(|a, b| Value::Number(a - b * (a / b).trunc()))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.".to_string())),
                    }
                }

                OpCode::Print => {
                    let v = self.pop();
                    let s = self.display_value(v);
                    writeln!(self.output, "{}", s).map_err(|e| e.to_string())?;
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_constant_string();
                    let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
                    let class_handle = self.heap.new_class(name, &roots);
                    self.push(Value::Obj(class_handle));
                }
                OpCode::Inherit => {
                    let superclass_handle = match self.peek(1) {
                        Value::Obj(h) if matches!(self.heap.get(h), ObjPayload::Class(_)) => h,
                        _ => return Err(self.runtime_error("Superclass must be a class.".to_string())),
                    };
                    let subclass_handle = match self.peek(0) {
                        Value::Obj(h) => h,
                        _ => unreachable!(),
                    };
                    let methods = match self.heap.get(superclass_handle) {
                        ObjPayload::Class(c) => c.methods.clone(),
                        _ => unreachable!(),
                    };
                    match self.heap.get_mut(subclass_handle) {
                        ObjPayload::Class(c) => c.methods.copy_from(&methods),
                        _ => unreachable!(),
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_constant_string();
                    self.define_method(name);
                }
                OpCode::Closure => {
                    let function_handle = match self.read_constant() {
                        Value::Obj(h) => h,
                        _ => unreachable!("OP_CLOSURE operand is always a function constant"),
                    };
                    let upvalue_count = self.as_function(function_handle).upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.as_closure(self.frame().closure);
                            upvalues.push(closure.upvalues[index]);
                        }
                    }
                    let closure = ObjClosure { function: function_handle, upvalues };
                    let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
                    let handle = self.heap.new_closure(closure, &roots);
                    self.push(Value::Obj(handle));
                }
            }
        }
    }

    fn read_constant_string(&mut self) -> ObjHandle {
        match self.read_constant() {
            Value::Obj(h) => h,
            _ => unreachable!("name constants are always strings"),
        }
    }

    fn string_hash(&self, handle: ObjHandle) -> u32 {
        match self.heap.get(handle) {
            ObjPayload::String(s) => s.hash,
            _ => unreachable!(),
        }
    }

    fn upvalue_value(&self, handle: ObjHandle) -> Value {
        match self.heap.get(handle) {
            ObjPayload::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => self.stack.get(slot),
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!(),
        }
    }

    fn set_upvalue_value(&mut self, handle: ObjHandle, value: Value) {
        let slot = match self.heap.get(handle) {
            ObjPayload::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!(),
        };
        match slot {
            Some(slot) => self.stack.set(slot, value),
            None => match self.heap.get_mut(handle) {
                ObjPayload::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            },
        }
    }

    /// Finds (or creates) the open upvalue for a stack slot, keeping the
    /// open list sorted by descending slot so `close_upvalues` can stop
    /// early.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut current = self.open_upvalues;
        let mut prev: Option<ObjHandle> = None;
        while let Some(handle) = current {
            let this_slot = match self.heap.get(handle) {
                ObjPayload::Upvalue(u) => match u.state {
                    UpvalueState::Open(s) => s,
                    UpvalueState::Closed(_) => unreachable!("open list holds only open upvalues"),
                },
                _ => unreachable!(),
            };
            if this_slot == slot {
                return handle;
            }
            if this_slot < slot {
                break;
            }
            prev = current;
            current = match self.heap.get(handle) {
                ObjPayload::Upvalue(u) => u.next,
                _ => unreachable!(),
            };
        }

        let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
        let created = self.heap.new_upvalue(slot, &roots);
        match self.heap.get_mut(created) {
            ObjPayload::Upvalue(u) => u.next = current,
            _ => unreachable!(),
        }
        match prev {
            Some(p) => match self.heap.get_mut(p) {
                ObjPayload::Upvalue(u) => u.next = Some(created),
                _ => unreachable!(),
            },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(handle) = self.open_upvalues {
            let slot = match self.heap.get(handle) {
                ObjPayload::Upvalue(u) => match u.state {
                    UpvalueState::Open(s) => s,
                    UpvalueState::Closed(_) => break,
                },
                _ => unreachable!(),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack.get(slot);
            let next = match self.heap.get_mut(handle) {
                ObjPayload::Upvalue(u) => {
                    u.state = UpvalueState::Closed(value);
                    u.next
                }
                _ => unreachable!(),
            };
            self.open_upvalues = next;
        }
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        match callee {
            Value::Obj(handle) => match self.heap.get(handle) {
                ObjPayload::Closure(_) => self.call(handle, argc),
                ObjPayload::Native(native) => {
                    let native = native.clone();
                    if argc as u8 != native.arity {
                        return Err(self.runtime_error(format!(
                            "Expected {} arguments but got {}.",
                            native.arity, argc
                        )));
                    }
                    let args: Vec<Value> = self.stack.tail_values(argc);
                    let result = (native.function)(&args).map_err(|msg| self.runtime_error(msg))?;
                    self.stack.truncate(self.stack.len() - argc - 1);
                    self.push(result);
                    Ok(())
                }
                ObjPayload::Class(_) => {
                    let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
                    let instance_handle = self.heap.new_instance(handle, &roots);
                    let stack_slot = self.stack.len() - argc - 1;
                    self.stack.set(stack_slot, Value::Obj(instance_handle));
                    let init = match self.heap.get(handle) {
                        ObjPayload::Class(c) => c.cached_init,
                        _ => unreachable!(),
                    };
                    if let Some(init_handle) = init {
                        self.call(init_handle, argc)
                    } else if argc != 0 {
                        Err(self.runtime_error(format!("Expected 0 arguments but got {}.", argc)))
                    } else {
                        Ok(())
                    }
                }
                ObjPayload::BoundMethod(bound) => {
                    let bound = bound.clone();
                    let stack_slot = self.stack.len() - argc - 1;
                    self.stack.set(stack_slot, bound.receiver);
                    self.call(bound.method, argc)
                }
                _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
            },
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call(&mut self, closure_handle: ObjHandle, argc: usize) -> Result<(), String> {
        let function_handle = self.as_closure(closure_handle).function;
        let arity = self.as_function(function_handle).arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {} arguments but got {}.", arity, argc)));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slot_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base });
        Ok(())
    }

    fn bind_method(&mut self, class_handle: ObjHandle, name: ObjHandle) -> Result<(), String> {
        let hash = self.string_hash(name);
        let method = match self.heap.get(class_handle) {
            ObjPayload::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        let method_handle: ObjHandle = match method {
            Some(Value::Obj(h)) => h,
            _ => {
                let n = self.heap.as_str(name).to_string();
                return Err(self.runtime_error(format!("Undefined property '{}'.", n)));
            }
        };
        let receiver = self.pop();
        let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
        let handle = self.heap.new_bound_method(receiver, method_handle, &roots);
        self.push(Value::Obj(handle));
        Ok(())
    }

    fn invoke(&mut self, name: ObjHandle, argc: usize) -> Result<(), String> {
        let receiver = self.peek(argc);
        let instance_handle = match receiver {
            Value::Obj(h) if matches!(self.heap.get(h), ObjPayload::Instance(_)) => h,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };
        let hash = self.string_hash(name);
        let field = match self.heap.get(instance_handle) {
            ObjPayload::Instance(i) => i.fields.get(name, hash),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack.set(slot, value);
            return self.call_value(value, argc);
        }
        let class_handle = match self.heap.get(instance_handle) {
            ObjPayload::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_handle, name, argc)
    }

    fn invoke_from_class(&mut self, class_handle: ObjHandle, name: ObjHandle, argc: usize) -> Result<(), String> {
        let hash = self.string_hash(name);
        let method = match self.heap.get(class_handle) {
            ObjPayload::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(h)) => self.call(h, argc),
            _ => {
                let n = self.heap.as_str(name).to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", n)))
            }
        }
    }

    fn define_method(&mut self, name: ObjHandle) {
        let method = self.pop();
        let method_handle = match method {
            Value::Obj(h) => h,
            _ => unreachable!("OP_METHOD always follows a closure"),
        };
        let class_handle = match self.peek(0) {
            Value::Obj(h) => h,
            _ => unreachable!(),
        };
        let hash = self.string_hash(name);
        let is_init = name == self.init_string;
        match self.heap.get_mut(class_handle) {
            ObjPayload::Class(c) => {
                c.methods.set(name, hash, method);
                if is_init {
                    c.cached_init = Some(method_handle);
                }
            }
            _ => unreachable!(),
        }
    }

    fn binary_number_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), String> {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.".to_string())),
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn add(&mut self) -> Result<(), String> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.get(a), ObjPayload::String(_))
                    && matches!(self.heap.get(b), ObjPayload::String(_)) =>
            {
                let mut concatenated = self.heap.as_str(a).to_string();
                concatenated.push_str(self.heap.as_str(b));
                self.pop();
                self.pop();
                let roots = VmRoots {
            frames: &self.frames,
            stack: &self.stack,
            globals: &self.globals,
            open_upvalues: self.open_upvalues,
            init_string: self.init_string,
        };
                let handle = self.heap.intern_string(&concatenated, &roots);
                self.push(Value::Obj(handle));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.".to_string())),
        }
    }

    /// Stringifies a value for `print`/the REPL result banner, resolving
    /// heap objects by handle rather than deriving `Display` on `Value`
    /// directly (which has no heap access).
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil | Value::Bool(_) | Value::Number(_) => value.to_string(),
            Value::Obj(handle) => match self.heap.get(handle) {
                ObjPayload::String(s) => s.chars.clone(),
                ObjPayload::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.heap.as_str(n)),
                    None => "<script>".to_string(),
                },
                ObjPayload::Native(n) => format!("<native fn {}>", self.heap.as_str(n.name)),
                ObjPayload::Closure(c) => self.display_value(Value::Obj(c.function)),
                ObjPayload::Upvalue(_) => "<upvalue>".to_string(),
                ObjPayload::Class(c) => self.heap.as_str(c.name).to_string(),
                ObjPayload::Instance(i) => {
                    let class_name = match self.heap.get(i.class) {
                        ObjPayload::Class(c) => self.heap.as_str(c.name),
                        _ => unreachable!(),
                    };
                    format!("{} instance", class_name)
                }
                ObjPayload::BoundMethod(b) => self.display_value(Value::Obj(b.method)),
            },
        }
    }

    #[cfg(feature = "trace_execution")]
    fn trace_instruction(&self) {
        print!("          ");
        for value in self.stack.iter_values() {
            print!("[ {} ]", self.display_value(value));
        }
        println!();
        let frame = self.frame();
        let closure = self.as_closure(frame.closure);
        let function = self.as_function(closure.function);
        crate::debug::disassemble_instruction(&function.chunk, frame.ip);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), String> {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Ok(()) => Ok(()),
            Err(InterpretError::Compile) => Err("compile error".to_string()),
            Err(InterpretError::Runtime(msg)) => Err(msg),
        }
    }

    /// Runs `source` against a fresh `Vm` whose `print` output is captured
    /// rather than sent to stdout, returning the interpreter result
    /// alongside everything printed.
    fn run_captured(source: &str) -> (Result<(), String>, String) {
        let output = SharedOutput::new();
        let mut vm = Vm::with_output(Box::new(output.clone()));
        let result = match vm.interpret(source) {
            Ok(()) => Ok(()),
            Err(InterpretError::Compile) => Err("compile error".to_string()),
            Err(InterpretError::Runtime(msg)) => Err(msg),
        };
        (result, output.contents())
    }

    #[test]
    fn arithmetic_and_print() {
        let (result, output) = run_captured("print 1 + 2 * 3;");
        assert!(result.is_ok());
        assert_eq!(output, "7\n");
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let source = r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            print counter();
            print counter();
        "#;
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "1\n2\n");
    }

    #[test]
    fn classes_and_inheritance() {
        let source = r#"
            class Animal {
                init(name) {
                    this.name = name;
                }
                speak() {
                    return this.name;
                }
            }
            class Dog < Animal {
                speak() {
                    return super.speak() + " says woof";
                }
            }
            var d = Dog("Rex");
            print d.speak();
        "#;
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "Rex says woof\n");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let err = run("print undefined_name;").unwrap_err();
        assert!(err.contains("Undefined variable 'undefined_name'"), "{}", err);
    }

    #[test]
    fn division_by_zero_yields_infinity_not_a_trap() {
        let (result, output) = run_captured("print 1 / 0;");
        assert!(result.is_ok());
        assert_eq!(output, "inf\n");
    }

    #[test]
    fn break_and_continue_in_loops() {
        let source = r#"
            var total = 0;
            for (var i = 0; i < 10; i = i + 1) {
                if (i == 5) { break; }
                if (i == 2) { continue; }
                total = total + i;
            }
            print total;
        "#;
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        // 0 + 1 + 3 + 4 = 8 (2 skipped by continue, loop stops at 5)
        assert_eq!(output, "8\n");
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let err = run("var x = 1; x();").unwrap_err();
        assert!(err.contains("Can only call functions and classes."), "{}", err);
    }

    #[test]
    fn recursive_fibonacci_computes_the_right_value() {
        let source = r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            print fib(10);
        "#;
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "55\n");
    }

    #[test]
    fn single_inheritance_passes_constructor_argument_through_super_init() {
        let source = r#"
            class A {
                init(n) {
                    this.n = n;
                }
            }
            class B < A {
                init(n) {
                    super.init(n);
                }
            }
            print B(7).n;
        "#;
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "7\n");
    }
}
