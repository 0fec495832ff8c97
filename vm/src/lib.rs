//! The bytecode interpreter. Owns the value stack, the call-frame stack,
//! globals, the open-upvalue list, and the heap; runs a compiled
//! `ObjFunction` to completion or unwinds on the first runtime error.

pub mod natives;

use compiler::chunk::value::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjUpvalue, Value,
};
use compiler::chunk::OpCode;
use compiler::error::{BacktraceFrame, CompileError, RuntimeError};
use compiler::heap::{GcRef, Heap};
use compiler::table::Table;

/// Value-stack capacity. Filled once at startup and never regrown; open
/// upvalues hold raw pointers into this buffer, so reallocating it would
/// dangle them.
const STACK_MAX: usize = 16 * 1024;
/// Call-frame capacity.
const FRAMES_MAX: usize = 64;

/// Either a batch of compile failures or a single runtime fault. The CLI
/// driver maps these to exit codes 65 and 70.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

struct CallFrame {
    closure: GcRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0: the callee/receiver,
    /// then arguments, then locals/temporaries.
    base: usize,
}

/// Global interpreter state. One `Vm` per program run; the REPL driver
/// keeps reusing the same instance across lines so globals and classes
/// persist between inputs.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Sorted by descending target slot: index 0 is the highest-address
    /// still-open upvalue.
    open_upvalues: Vec<GcRef>,
    /// Prints the top-level chunk's disassembly before running it, behind
    /// the `--debug-bytecode` CLI flag. Purely diagnostic; disassembly
    /// isn't part of the observable contract.
    debug_bytecode: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        natives::define_all(&mut heap, &mut globals);
        Self {
            heap,
            // Filled to capacity up front and indexed, never `push`ed past
            // this length, so its backing buffer never moves.
            stack: vec![Value::Nil; STACK_MAX],
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: Vec::new(),
            debug_bytecode: false,
        }
    }

    /// Forces a collection on every allocation ("stress" mode).
    pub fn set_stress_gc(&mut self, stress: bool) {
        self.heap.stress_gc = stress;
    }

    pub fn set_log_gc(&mut self, log: bool) {
        self.heap.log_gc = log;
    }

    pub fn set_debug_bytecode(&mut self, debug: bool) {
        self.debug_bytecode = debug;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    /// Compiles and runs one program. A compile error aborts before any
    /// bytecode runs; a runtime error unwinds every frame and resets the
    /// stack but leaves `self` reusable. This is what lets the REPL keep
    /// going after a bad line.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        if self.debug_bytecode {
            let f = function.as_function().expect("compile() always returns a Function");
            println!("{:?}", f.chunk);
        }
        let closure = self.heap.alloc_object(Obj::Closure(ObjClosure {
            function,
            upvalues: Box::new([]),
        }));
        self.stack[0] = Value::Object(closure);
        self.stack_top = 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });
        self.run().map_err(InterpretError::Runtime)
    }

    /// Looks up a global by name without running any bytecode. Useful for
    /// embedding and, here, for asserting on program results in tests that
    /// have no other way to observe what `PRINT` already wrote to stdout.
    pub fn global(&mut self, name: &str) -> Option<Value> {
        let key = self.heap.intern_string(name);
        self.globals.get(key)
    }

    // ---- stack plumbing -------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack_top >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    // ---- frame / bytecode plumbing -------------------------------------------------

    fn cur_ip(&self) -> usize {
        self.frames.last().expect("run() only called with an active frame").ip
    }

    fn set_ip(&mut self, ip: usize) {
        self.frames.last_mut().expect("active frame").ip = ip;
    }

    fn cur_base(&self) -> usize {
        self.frames.last().expect("active frame").base
    }

    fn cur_closure(&self) -> GcRef {
        self.frames.last().expect("active frame").closure
    }

    fn closure_function(closure: GcRef) -> GcRef {
        match &*closure.obj() {
            Obj::Closure(c) => c.function,
            _ => unreachable!("frame.closure always refers to an Obj::Closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let function_ref = Self::closure_function(self.cur_closure());
        let ip = self.cur_ip();
        let byte = function_ref
            .as_function()
            .expect("closure.function is Function")
            .chunk
            .byte_at(ip);
        self.set_ip(ip + 1);
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, idx: u8) -> Value {
        let function_ref = Self::closure_function(self.cur_closure());
        let function = function_ref.as_function().expect("closure.function is Function");
        function.chunk.constant(idx)
    }

    fn read_string(&mut self, idx: u8) -> GcRef {
        match self.read_constant(idx) {
            Value::Object(o) => o,
            _ => unreachable!("name constants are always interned strings"),
        }
    }

    // ---- upvalues -------------------------------------------------

    fn upvalue_target_slot(&self, uv: GcRef) -> Option<usize> {
        match &*uv.obj() {
            Obj::Upvalue(o) => o.stack_slot().map(|ptr| unsafe {
                ptr.as_ptr().offset_from(self.stack.as_ptr()) as usize
            }),
            _ => unreachable!("open_upvalues only ever holds Obj::Upvalue"),
        }
    }

    /// Finds or creates the upvalue that aliases `slot`, keeping
    /// `open_upvalues` sorted by descending target slot.
    fn capture_upvalue(&mut self, slot: usize) -> Result<GcRef, RuntimeError> {
        let mut insert_at = self.open_upvalues.len();
        for (i, uv) in self.open_upvalues.iter().enumerate() {
            let existing = self.upvalue_target_slot(*uv).expect("still open");
            if existing == slot {
                return Ok(*uv);
            }
            if existing < slot {
                insert_at = i;
                break;
            }
        }
        let ptr = unsafe { std::ptr::NonNull::new_unchecked(self.stack.as_mut_ptr().add(slot)) };
        let uv = self.heap.alloc_object(Obj::Upvalue(ObjUpvalue::Open(ptr)));
        self.open_upvalues.insert(insert_at, uv);
        self.maybe_collect();
        Ok(uv)
    }

    /// Closes every open upvalue targeting `limit` or above. Used both by
    /// `CLOSE_UPVALUE` and when a frame returns.
    fn close_upvalues(&mut self, limit: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = self.upvalue_target_slot(first).expect("still open");
            if slot < limit {
                break;
            }
            self.open_upvalues.remove(0);
            if let Obj::Upvalue(uv) = &mut *first.obj_mut() {
                uv.close();
            }
        }
    }

    // ---- GC orchestration -------------------------------------------------

    fn mark_roots(&mut self) {
        for i in 0..self.stack_top {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        for uv in self.open_upvalues.clone() {
            self.heap.mark_object(uv);
        }
        self.globals.mark(&mut self.heap);
    }

    fn collect_garbage(&mut self) {
        if self.heap.log_gc {
            eprintln!("-- gc begin, {} bytes allocated", self.heap.bytes_allocated());
        }
        self.mark_roots();
        self.heap.trace_references();
        self.heap.sweep_strings();
        self.heap.sweep();
        if self.heap.log_gc {
            eprintln!("-- gc end, {} bytes allocated", self.heap.bytes_allocated());
        }
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // ---- errors -------------------------------------------------

    /// Builds a runtime error carrying a full backtrace, innermost frame
    /// first, and resets the VM so the REPL can keep going afterward.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut backtrace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function_ref = Self::closure_function(frame.closure);
            let function = function_ref.as_function().expect("closure.function is Function");
            let line = function.chunk.line_at(frame.ip.saturating_sub(1).min(function.chunk.len() - 1));
            let name = match function.name {
                Some(n) => n.as_string().expect("name is String").chars.to_string(),
                None => "script".to_string(),
            };
            backtrace.push(BacktraceFrame { line, name });
        }
        self.reset_stack();
        RuntimeError {
            message: message.into(),
            backtrace,
        }
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---- calling -------------------------------------------------

    fn call_closure(&mut self, closure_ref: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let function_ref = Self::closure_function(closure_ref);
        let arity = function_ref.as_function().expect("Function").arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack_top - argc - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native_ref: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let (func, arity): (NativeFn, u8) = {
            let n = native_ref.as_native().expect("kind checked by caller");
            (n.function, n.arity)
        };
        if argc as u8 != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let args_start = self.stack_top - argc;
        let args: Vec<Value> = self.stack[args_start..self.stack_top].to_vec();
        let result = (func)(&args).map_err(|msg| self.runtime_error(msg))?;
        self.stack_top = args_start - 1;
        self.push(result)
    }

    fn call_class(&mut self, class_ref: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let instance = self.heap.alloc_object(Obj::Instance(ObjInstance::new(class_ref)));
        let base = self.stack_top - argc - 1;
        self.stack[base] = Value::Object(instance);
        self.maybe_collect();

        let init_name = self.heap.intern_string("init");
        let init = {
            let class = class_ref.as_class().expect("kind checked by caller");
            class.methods.get(init_name)
        };
        match init {
            Some(Value::Object(init_closure)) => self.call_closure(init_closure, argc),
            Some(_) => unreachable!("method tables only ever store closures"),
            None if argc == 0 => Ok(()),
            None => Err(self.runtime_error(format!("Expected 0 arguments but got {argc}."))),
        }
    }

    fn call_bound_method(&mut self, bound_ref: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let (receiver, method) = {
            let b = bound_ref.as_bound_method().expect("kind checked by caller");
            (b.receiver, b.method)
        };
        let base = self.stack_top - argc - 1;
        self.stack[base] = receiver;
        self.call_closure(method, argc)
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let obj = match callee {
            Value::Object(o) => o,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        enum Kind {
            Closure,
            Native,
            Class,
            BoundMethod,
            Other,
        }
        let kind = match &*obj.obj() {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(_) => Kind::Native,
            Obj::Class(_) => Kind::Class,
            Obj::BoundMethod(_) => Kind::BoundMethod,
            _ => Kind::Other,
        };
        match kind {
            Kind::Closure => self.call_closure(obj, argc),
            Kind::Native => self.call_native(obj, argc),
            Kind::Class => self.call_class(obj, argc),
            Kind::BoundMethod => self.call_bound_method(obj, argc),
            Kind::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// Shared tail of `INVOKE` and ordinary `GET_PROPERTY` + `CALL`: look a
    /// method up on `class`'s table and invoke it with the receiver already
    /// sitting at the call's base slot.
    fn invoke_from_class(&mut self, class_ref: GcRef, name: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let method = {
            let class = class_ref.as_class().expect("invoke_from_class always receives a Class");
            class.methods.get(name)
        };
        match method {
            Some(Value::Object(closure)) => self.call_closure(closure, argc),
            Some(_) => unreachable!("method tables only ever store closures"),
            None => {
                let prop = name.as_string().expect("name is String").chars.to_string();
                Err(self.runtime_error(format!("Undefined property '{prop}'.")))
            }
        }
    }

    fn invoke(&mut self, name: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance_ref = match receiver {
            Value::Object(o) if matches!(&*o.obj(), Obj::Instance(_)) => o,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let field = {
            let instance = instance_ref.as_instance().expect("just matched Instance");
            instance.fields.get(name)
        };
        if let Some(value) = field {
            let base = self.stack_top - argc - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class = { instance_ref.as_instance().expect("just matched Instance").class };
        self.invoke_from_class(class, name, argc)
    }

    // ---- the dispatch loop -------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.step()? {
                return Ok(());
            }
        }
    }

    /// Executes exactly one instruction. Returns `Ok(true)` when the
    /// outermost call frame (the top-level script) has just returned.
    fn step(&mut self) -> Result<bool, RuntimeError> {
        let op = OpCode::from_u8(self.read_byte());
        match op {
            OpCode::Constant => {
                let idx = self.read_byte();
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let v = self.stack[self.cur_base() + slot];
                self.push(v)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let v = self.peek(0);
                let base = self.cur_base();
                self.stack[base + slot] = v;
            }
            OpCode::GetGlobal => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                match self.globals.get(name) {
                    Some(v) => self.push(v)?,
                    None => {
                        let n = name.as_string().expect("name is String").chars.to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let v = self.pop();
                self.globals.set(name, v);
            }
            OpCode::SetGlobal => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                if self.globals.get(name).is_none() {
                    let n = name.as_string().expect("name is String").chars.to_string();
                    return Err(self.runtime_error(format!("Undefined variable '{n}'.")));
                }
                let v = self.peek(0);
                self.globals.set(name, v);
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure = self.cur_closure();
                let uv = match &*closure.obj() {
                    Obj::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let v = match &*uv.obj() {
                    Obj::Upvalue(o) => o.get(),
                    _ => unreachable!(),
                };
                self.push(v)?;
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure = self.cur_closure();
                let uv = match &*closure.obj() {
                    Obj::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let v = self.peek(0);
                if let Obj::Upvalue(o) = &mut *uv.obj_mut() {
                    o.set(v);
                }
            }
            OpCode::GetProperty => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let receiver = self.peek(0);
                let instance_ref = match receiver {
                    Value::Object(o) if matches!(&*o.obj(), Obj::Instance(_)) => o,
                    _ => return Err(self.runtime_error("Only instances have properties.")),
                };
                let field = {
                    let instance = instance_ref.as_instance().expect("just matched Instance");
                    instance.fields.get(name)
                };
                if let Some(value) = field {
                    self.pop();
                    self.push(value)?;
                } else {
                    let class = { instance_ref.as_instance().expect("just matched Instance").class };
                    let method = {
                        let class = class.as_class().expect("instance.class is a Class");
                        class.methods.get(name)
                    };
                    match method {
                        Some(Value::Object(closure)) => {
                            let bound = self.heap.alloc_object(Obj::BoundMethod(ObjBoundMethod {
                                receiver,
                                method: closure,
                            }));
                            self.pop();
                            self.push(Value::Object(bound))?;
                            self.maybe_collect();
                        }
                        Some(_) => unreachable!("method tables only ever store closures"),
                        None => {
                            let n = name.as_string().expect("name is String").chars.to_string();
                            return Err(self.runtime_error(format!("Undefined property '{n}'.")));
                        }
                    }
                }
            }
            OpCode::SetProperty => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let value = self.peek(0);
                let receiver = self.peek(1);
                let instance_ref = match receiver {
                    Value::Object(o) if matches!(&*o.obj(), Obj::Instance(_)) => o,
                    _ => return Err(self.runtime_error("Only instances have fields.")),
                };
                {
                    let mut instance = instance_ref.as_instance_mut().expect("just matched Instance");
                    instance.fields.set(name, value);
                }
                self.pop();
                self.pop();
                self.push(value)?;
            }
            OpCode::GetSuper => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let superclass = match self.pop() {
                    Value::Object(o) => o,
                    _ => unreachable!("compiler always pushes the superclass before GET_SUPER"),
                };
                let receiver = self.pop();
                let method = {
                    let class = superclass.as_class().expect("GET_SUPER operand is a Class");
                    class.methods.get(name)
                };
                match method {
                    Some(Value::Object(closure)) => {
                        let bound = self.heap.alloc_object(Obj::BoundMethod(ObjBoundMethod {
                            receiver,
                            method: closure,
                        }));
                        self.push(Value::Object(bound))?;
                        self.maybe_collect();
                    }
                    Some(_) => unreachable!("method tables only ever store closures"),
                    None => {
                        let n = name.as_string().expect("name is String").chars.to_string();
                        return Err(self.runtime_error(format!("Undefined property '{n}'.")));
                    }
                }
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(Value::values_equal(a, b)))?;
            }
            OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
            OpCode::Less => self.numeric_compare(|a, b| a < b)?,
            OpCode::Add => self.add()?,
            OpCode::Subtract => self.numeric_binop(|a, b| a - b)?,
            OpCode::Multiply => self.numeric_binop(|a, b| a * b)?,
            OpCode::Divide => self.numeric_binop(|a, b| a / b)?,
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()))?;
            }
            OpCode::Negate => {
                let v = self.peek(0);
                match v {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                }
            }
            OpCode::Print => {
                let v = self.pop();
                println!("{v}");
            }
            OpCode::Jump => {
                let offset = self.read_u16();
                self.set_ip(self.cur_ip() + offset as usize);
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsey() {
                    self.set_ip(self.cur_ip() + offset as usize);
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16();
                self.set_ip(self.cur_ip() - offset as usize);
            }
            OpCode::Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            OpCode::Invoke => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let argc = self.read_byte() as usize;
                self.invoke(name, argc)?;
            }
            OpCode::SuperInvoke => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let argc = self.read_byte() as usize;
                let superclass = match self.pop() {
                    Value::Object(o) => o,
                    _ => unreachable!("compiler always pushes the superclass before SUPER_INVOKE"),
                };
                self.invoke_from_class(superclass, name, argc)?;
            }
            OpCode::Closure => {
                let idx = self.read_byte();
                let function_ref = match self.read_constant(idx) {
                    Value::Object(o) => o,
                    _ => unreachable!("CLOSURE operand is always a Function constant"),
                };
                let upvalue_count = function_ref
                    .as_function()
                    .expect("Function")
                    .upvalue_count();
                let base = self.cur_base();
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    if is_local {
                        upvalues.push(self.capture_upvalue(base + index)?);
                    } else {
                        let enclosing = self.cur_closure();
                        let uv = match &*enclosing.obj() {
                            Obj::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(uv);
                    }
                }
                let closure = self.heap.alloc_object(Obj::Closure(ObjClosure {
                    function: function_ref,
                    upvalues: upvalues.into_boxed_slice(),
                }));
                self.push(Value::Object(closure))?;
                self.maybe_collect();
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack_top - 1);
                self.pop();
            }
            OpCode::Return => {
                let value = self.pop();
                let base = self.cur_base();
                self.close_upvalues(base);
                self.frames.pop();
                if self.frames.is_empty() {
                    self.stack_top = 0;
                    return Ok(true);
                }
                self.stack_top = base;
                self.push(value)?;
            }
            OpCode::Class => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let class = self.heap.alloc_object(Obj::Class(ObjClass::new(name)));
                self.push(Value::Object(class))?;
                self.maybe_collect();
            }
            OpCode::Inherit => {
                let subclass = match self.peek(0) {
                    Value::Object(o) => o,
                    _ => unreachable!("compiler always pushes the class before INHERIT"),
                };
                let superclass = match self.peek(1) {
                    Value::Object(o) if matches!(&*o.obj(), Obj::Class(_)) => o,
                    _ => return Err(self.runtime_error("Superclass must be a class.")),
                };
                {
                    let superclass = superclass.as_class().expect("just matched Class");
                    let mut subclass = subclass.as_class_mut().expect("compiler always pushes a Class");
                    subclass.methods.add_all(&superclass.methods);
                }
                self.pop();
            }
            OpCode::Method => {
                let idx = self.read_byte();
                let name = self.read_string(idx);
                let method = self.pop();
                let class = self.peek(0);
                if let Value::Object(class_ref) = class {
                    let mut class = class_ref.as_class_mut().expect("compiler always pushes a Class");
                    class.methods.set(name, method);
                }
            }
        }
        Ok(false)
    }

    fn numeric_binop(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)))
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)))
    }

    /// Numeric addition or string concatenation. Operands are only
    /// `peek`ed, not `pop`ed, until the concatenated string is interned;
    /// interning may allocate and so may collect, and both operands must
    /// stay reachable from the stack until then.
    fn add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b))
            }
            (Value::Object(a), Value::Object(b))
                if matches!(&*a.obj(), Obj::String(_)) && matches!(&*b.obj(), Obj::String(_)) =>
            {
                let concatenated = {
                    let a = a.as_string().expect("just matched String");
                    let b = b.as_string().expect("just matched String");
                    format!("{}{}", a.chars, b.chars)
                };
                let interned = self.heap.intern_string(&concatenated);
                self.pop();
                self.pop();
                self.push(Value::Object(interned))?;
                self.maybe_collect();
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(vm: &mut Vm, name: &str) -> f64 {
        match vm.global(name) {
            Some(Value::Number(n)) => n,
            other => panic!("expected a number global '{name}', got {other:?}"),
        }
    }

    fn string(vm: &mut Vm, name: &str) -> String {
        match vm.global(name) {
            Some(Value::Object(o)) => o.as_string().expect("a String object").chars.to_string(),
            other => panic!("expected a string global '{name}', got {other:?}"),
        }
    }

    fn boolean(vm: &mut Vm, name: &str) -> bool {
        match vm.global(name) {
            Some(Value::Bool(b)) => b,
            other => panic!("expected a boolean global '{name}', got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_follows_precedence() {
        let mut vm = Vm::new();
        vm.interpret("var result = 1 + 2 * 3;").expect("should run");
        assert_eq!(number(&mut vm, "result"), 7.0);
    }

    #[test]
    fn string_concatenation_reuses_the_interned_result() {
        let mut vm = Vm::new();
        vm.interpret(
            r#"
            var a = "foo" + "bar";
            var b = "foobar";
            var same = a == b;
            "#,
        )
        .expect("should run");
        assert!(boolean(&mut vm, "same"));
    }

    #[test]
    fn closures_share_a_captured_local_across_calls() {
        let mut vm = Vm::new();
        vm.interpret(
            r#"
            fun make_counter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = make_counter();
            counter();
            counter();
            var result = counter();
            "#,
        )
        .expect("should run");
        assert_eq!(number(&mut vm, "result"), 3.0);
    }

    #[test]
    fn super_reaches_the_parent_class_method() {
        let mut vm = Vm::new();
        vm.interpret(
            r#"
            class Animal {
                speak() { return "..."; }
            }
            class Dog < Animal {
                speak() { return super.speak() + " woof"; }
            }
            var result = Dog().speak();
            "#,
        )
        .expect("should run");
        assert_eq!(string(&mut vm, "result"), "... woof");
    }

    #[test]
    fn while_loop_accumulates() {
        let mut vm = Vm::new();
        vm.interpret(
            r#"
            var i = 0;
            var sum = 0;
            while (i < 5) {
                sum = sum + i;
                i = i + 1;
            }
            var result = sum;
            "#,
        )
        .expect("should run");
        assert_eq!(number(&mut vm, "result"), 10.0);
    }

    #[test]
    fn calling_with_the_wrong_arity_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("fun f(a, b) { return a + b; } f(1);");
        assert!(matches!(err, Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn init_with_the_wrong_arity_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret(
            r#"
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
            }
            Point(1);
            "#,
        );
        assert!(matches!(err, Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn instance_fields_and_methods_round_trip() {
        let mut vm = Vm::new();
        vm.interpret(
            r#"
            class Counter {
                init() { this.value = 0; }
                bump() { this.value = this.value + 1; return this.value; }
            }
            var c = Counter();
            c.bump();
            c.bump();
            var result = c.bump();
            "#,
        )
        .expect("should run");
        assert_eq!(number(&mut vm, "result"), 3.0);
    }

    #[test]
    fn a_runtime_error_leaves_the_vm_reusable() {
        let mut vm = Vm::new();
        assert!(vm.interpret("var x = 1 / nil;").is_err());
        vm.interpret("var result = 1 + 1;").expect("vm should still work after an error");
        assert_eq!(number(&mut vm, "result"), 2.0);
    }

    #[test]
    fn garbage_collection_under_stress_does_not_corrupt_live_state() {
        let mut vm = Vm::new();
        vm.set_stress_gc(true);
        vm.interpret(
            r#"
            class Node {
                init(value) { this.value = value; }
            }
            var a = Node(1);
            var b = Node(2);
            var result = a.value + b.value;
            "#,
        )
        .expect("should run under GC stress");
        assert_eq!(number(&mut vm, "result"), 3.0);
    }
}
