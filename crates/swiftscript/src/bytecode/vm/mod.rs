//! Stack virtual machine.
//!
//! Executes an assembly's active body (top-level code or one of the method
//! bodies) over a value stack with a separate call-frame stack. Reference
//! counting is centralized here: `push` retains, `pop` releases, and slot /
//! global / field stores release the old value and retain the new one.
//! Releases that drop a count to zero defer to the heap's queue; the queue
//! drains at instruction boundaries once the RC-operation threshold is
//! reached (`run_cleanup`), running `deinit`s and freeing objects.
//!
//! Call dispatch lives in `call.rs`; property access in `attr.rs`.

mod attr;
mod call;

use ahash::AHashMap;

use super::{
    assembly::{Assembly, Chunk},
    op::Opcode,
};
use crate::{
    error::RuntimeError,
    heap::{Heap, HeapId},
    io::{PrintWriter, ReadLineSource},
    native::NativeRegistry,
    object::{HeapData, ListObj, MapObj, TupleObj, UpvalueObj},
    value::{Value, format_float},
};

/// Runtime limits and cleanup pacing.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// RC operations between deferred-release drains.
    pub deferred_cleanup_threshold: u32,
    pub max_call_depth: usize,
    pub max_stack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            deferred_cleanup_threshold: Heap::DEFAULT_CLEANUP_THRESHOLD,
            max_call_depth: 256,
            max_stack: 16 * 1024,
        }
    }
}

/// Which chunk the instruction pointer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveBody {
    TopLevel,
    Body(u16),
}

/// One function activation record.
#[derive(Debug)]
pub(crate) struct CallFrame {
    /// Absolute stack index of the callee value; locals begin right after.
    pub callee_index: usize,
    pub stack_base: usize,
    pub return_ip: usize,
    pub return_body: ActiveBody,
    pub function_name: String,
    /// Closure providing upvalues, when the callee was one.
    pub closure: Option<HeapId>,
    pub is_initializer: bool,
    pub is_mutating: bool,
    /// Original receiver for mutating-method writeback on `self` rebinding.
    pub receiver_id: Option<HeapId>,
}

pub struct Vm<'a> {
    pub(crate) assembly: &'a Assembly,
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: AHashMap<String, Value>,
    pub(crate) active: ActiveBody,
    pub(crate) ip: usize,
    /// Open upvalue object ids, one per captured live stack slot.
    pub(crate) open_upvalues: Vec<HeapId>,
    pub(crate) print: &'a mut dyn PrintWriter,
    pub(crate) input: &'a mut dyn ReadLineSource,
    pub(crate) natives: &'a mut NativeRegistry,
    pub(crate) config: VmConfig,
}

type RunResult<T> = Result<T, RuntimeError>;

impl<'a> Vm<'a> {
    pub fn new(
        assembly: &'a Assembly,
        print: &'a mut dyn PrintWriter,
        input: &'a mut dyn ReadLineSource,
        natives: &'a mut NativeRegistry,
        config: VmConfig,
    ) -> Self {
        let mut heap = Heap::new();
        heap.set_cleanup_threshold(config.deferred_cleanup_threshold);
        Self {
            assembly,
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: AHashMap::new(),
            active: ActiveBody::TopLevel,
            ip: 0,
            open_upvalues: Vec::new(),
            print,
            input,
            natives,
            config,
        }
    }

    /// Runs the assembly to completion, tears the heap down, and returns
    /// the final value.
    pub fn execute(&mut self) -> RunResult<Value> {
        let result = self.run_program();
        self.shutdown();
        result
    }

    /// Runs the assembly's entry body without tearing down, leaving globals
    /// and the heap alive for follow-up calls ([`Self::call_host_global`]).
    pub fn run_program(&mut self) -> RunResult<Value> {
        self.active = match self.assembly.entry_body {
            Some(index) => ActiveBody::Body(index),
            None => ActiveBody::TopLevel,
        };
        self.ip = 0;
        self.run_loop(0)
    }

    /// Defines a global from a host value before or after execution.
    pub fn define_host_global(&mut self, name: &str, value: crate::native::HostValue) {
        let value = self.from_host_value(value);
        self.heap.retain_value(value);
        if let Some(old) = self.globals.insert(name.to_owned(), value) {
            self.heap.release_value(old);
        }
    }

    /// Reads a global back out as a host value.
    #[must_use]
    pub fn host_global(&self, name: &str) -> Option<crate::native::HostValue> {
        self.globals.get(name).map(|&v| self.to_host_value(v))
    }

    /// Wraps an opaque host pointer as a global. The registered type info
    /// (`NativeTypeInfo`) serves its property reads; its release callback
    /// fires when the last strong reference drops — as a destructor for
    /// VM-owned pointers, as a notification for engine-owned ones.
    pub fn define_native_global(
        &mut self,
        name: &str,
        type_name: &str,
        handle: u64,
        ownership: crate::native::NativeOwnership,
    ) {
        let id = self.heap.allocate(HeapData::Native(crate::object::NativeObj {
            type_name: type_name.to_owned(),
            handle,
            owned_by_vm: ownership == crate::native::NativeOwnership::VmOwned,
        }));
        let value = Value::obj(id);
        self.heap.retain_value(value);
        if let Some(old) = self.globals.insert(name.to_owned(), value) {
            self.heap.release_value(old);
        }
    }

    /// Invokes a named global function with host-value arguments and
    /// returns the converted result. The program must have run first so the
    /// global exists.
    pub fn call_host_global(
        &mut self,
        name: &str,
        args: &[crate::native::HostValue],
    ) -> RunResult<crate::native::HostValue> {
        let Some(&callee) = self.globals.get(name) else {
            return Err(self.error(format!("Undefined variable '{name}'")));
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.from_host_value(arg.clone());
            values.push(value);
        }
        let result = self.run_nested_call(callee, &values)?;
        Ok(self.to_host_value(result))
    }

    /// Dispatch loop. Returns when `HALT` executes with the frame stack at
    /// `frame_floor` (nested synchronous calls re-enter with a higher floor
    /// and return when their frame pops).
    fn run_loop(&mut self, frame_floor: usize) -> RunResult<Value> {
        loop {
            if self.ip >= self.current_chunk().code.len() {
                // Fell off a body without HALT/RETURN; treat as done.
                return Ok(Value::Nil);
            }
            let byte = self.read_byte();
            let Some(op) = Opcode::from_repr(byte) else {
                return Err(self.error(format!("corrupt bytecode: invalid opcode {byte:#04x}")));
            };
            match self.dispatch(op, frame_floor)? {
                Flow::Continue => {}
                Flow::Halt(value) => return Ok(value),
                Flow::NestedReturn(value) => return Ok(value),
            }
            if self.heap.cleanup_due() {
                self.run_cleanup();
            }
        }
    }

    fn dispatch(&mut self, op: Opcode, frame_floor: usize) -> RunResult<Flow> {
        match op {
            Opcode::Nil => self.push(Value::Nil)?,
            Opcode::True => self.push(Value::Bool(true))?,
            Opcode::False => self.push(Value::Bool(false))?,
            Opcode::Constant => {
                let index = self.read_u16() as usize;
                let value = *self
                    .assembly
                    .constants
                    .get(index)
                    .ok_or_else(|| self.error("corrupt bytecode: constant index out of range"))?;
                self.push(value)?;
            }
            Opcode::String => {
                let id = self.read_string_operand()?;
                let object = self.heap.allocate(HeapData::Str(id));
                self.push(Value::obj(object))?;
            }
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            Opcode::CopyValue => self.copy_value_top()?,

            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Modulo
            | Opcode::BitwiseAnd
            | Opcode::BitwiseOr
            | Opcode::BitwiseXor
            | Opcode::LeftShift
            | Opcode::RightShift
            | Opcode::Less
            | Opcode::Greater
            | Opcode::LessEqual
            | Opcode::GreaterEqual
            | Opcode::And
            | Opcode::Or => self.binary_op(op)?,
            Opcode::Equal => {
                let b = self.pop();
                let a = self.pop();
                if let Some(result) = self.try_operator_overload("==", a, b)? {
                    self.push(result)?;
                } else {
                    let eq = self.values_equal(a, b);
                    self.push(Value::Bool(eq))?;
                }
            }
            Opcode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                if let Some(result) = self.try_operator_overload("==", a, b)? {
                    self.push(Value::Bool(!result.is_truthy()))?;
                } else {
                    let eq = self.values_equal(a, b);
                    self.push(Value::Bool(!eq))?;
                }
            }
            Opcode::Negate => {
                let v = self.pop();
                let result = match v {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => return Err(self.error(format!("Cannot negate {}", self.type_name_of(other)))),
                };
                self.push(result)?;
            }
            Opcode::Not => {
                let v = self.pop();
                let truthy = v.is_truthy();
                self.push(Value::Bool(!truthy))?;
            }
            Opcode::BitwiseNot => {
                let v = self.pop();
                let Value::Int(i) = v else {
                    return Err(self.error(format!("Bitwise '~' requires Int, found {}", self.type_name_of(v))));
                };
                self.push(Value::Int(!i))?;
            }

            Opcode::GetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.stack_base();
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            Opcode::SetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.stack_base();
                let value = self.peek(0)?;
                self.heap.retain_value(value);
                let old = std::mem::replace(&mut self.stack[base + slot], value);
                self.heap.release_value(old);
            }
            Opcode::GetGlobal => {
                let name = self.read_string_operand()?;
                self.get_global(&name)?;
            }
            Opcode::SetGlobal => {
                let name = self.read_string_operand()?;
                if !self.globals.contains_key(&name) {
                    return Err(self.error(format!("Undefined variable '{name}'")));
                }
                let value = self.peek(0)?;
                self.heap.retain_value(value);
                let old = self.globals.insert(name, value);
                if let Some(old) = old {
                    self.heap.release_value(old);
                }
            }
            Opcode::DefineGlobal => {
                let name = self.read_string_operand()?;
                let value = self.peek(0)?;
                self.heap.retain_value(value);
                let old = self.globals.insert(name, value);
                if let Some(old) = old {
                    self.heap.release_value(old);
                }
                self.pop();
            }
            Opcode::GetUpvalue => {
                let index = self.read_u16() as usize;
                let value = self.read_upvalue(index)?;
                self.push(value)?;
            }
            Opcode::SetUpvalue => {
                let index = self.read_u16() as usize;
                let value = self.peek(0)?;
                self.write_upvalue(index, value)?;
            }
            Opcode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.pop();
            }

            Opcode::Jump => {
                let offset = self.read_u16() as usize;
                self.ip += offset;
            }
            Opcode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let condition = self.pop();
                if !condition.is_truthy() {
                    self.ip += offset;
                }
            }
            Opcode::JumpIfNil => {
                let offset = self.read_u16() as usize;
                if self.peek(0)?.is_nil() {
                    self.pop();
                    self.ip += offset;
                }
            }
            Opcode::Loop => {
                let offset = self.read_u16() as usize;
                self.ip -= offset;
            }
            Opcode::Return => {
                let value = self.do_return()?;
                if self.frames.len() < frame_floor {
                    return Ok(Flow::NestedReturn(value));
                }
            }
            Opcode::Halt => {
                let value = if self.stack.is_empty() { Value::Nil } else { self.pop() };
                return Ok(Flow::Halt(value));
            }

            Opcode::Call => {
                let argc = usize::from(self.read_u8());
                self.call_value(argc, &[])?;
            }
            Opcode::CallNamed => {
                let argc = usize::from(self.read_u8());
                let mut labels = Vec::with_capacity(argc);
                for _ in 0..argc {
                    let raw = self.read_u16();
                    if raw == u16::MAX {
                        labels.push(None);
                    } else {
                        labels.push(Some(self.string_at(raw)?));
                    }
                }
                self.call_value(argc, &labels)?;
            }

            Opcode::RangeInclusive | Opcode::RangeExclusive => {
                let end = self.pop();
                let start = self.pop();
                let (Value::Int(start), Value::Int(end)) = (start, end) else {
                    return Err(self.error("Range bounds must be Int"));
                };
                let last = if op == Opcode::RangeInclusive { end } else { end - 1 };
                if last.saturating_sub(start) > 1_000_000 {
                    return Err(self.error("Range too large to materialize"));
                }
                let mut elements = Vec::new();
                let mut current = start;
                while current <= last {
                    elements.push(Value::Int(current));
                    current += 1;
                }
                let id = self.heap.allocate(HeapData::List(ListObj { elements }));
                self.push(Value::obj(id))?;
            }
            Opcode::Array => {
                let count = self.read_u16() as usize;
                // Ownership transfers from the stack into the list.
                let elements = self.stack.split_off(self.stack.len() - count);
                let id = self.heap.allocate(HeapData::List(ListObj { elements }));
                self.push(Value::obj(id))?;
            }
            Opcode::Dict => {
                let count = self.read_u16() as usize;
                let mut pairs = self.stack.split_off(self.stack.len() - 2 * count);
                let mut entries = indexmap::IndexMap::new();
                for chunk in pairs.chunks(2) {
                    let key = self.display_string(chunk[0]);
                    let value = chunk[1];
                    if let Some(old) = entries.insert(key, value) {
                        self.heap.release_value(old);
                    }
                }
                // Keys were only read for their text.
                for pair in pairs.chunks(2) {
                    self.heap.release_value(pair[0]);
                }
                pairs.clear();
                let id = self.heap.allocate(HeapData::Map(MapObj { entries }));
                self.push(Value::obj(id))?;
            }
            Opcode::Tuple => {
                let count = self.read_u16() as usize;
                let mut labels = Vec::with_capacity(count);
                for _ in 0..count {
                    let raw = self.read_u16();
                    if raw == u16::MAX {
                        labels.push(None);
                    } else {
                        labels.push(Some(self.string_at(raw)?));
                    }
                }
                let elements = self.stack.split_off(self.stack.len() - count);
                let id = self.heap.allocate(HeapData::Tuple(TupleObj { labels, elements }));
                self.push(Value::obj(id))?;
            }
            Opcode::GetSubscript => self.get_subscript()?,
            Opcode::SetSubscript => self.set_subscript()?,
            Opcode::GetTupleIndex => {
                let index = self.read_u16() as usize;
                let tuple = self.pop();
                let element = match self.heap_data(tuple)? {
                    HeapData::Tuple(t) => t.elements.get(index).copied(),
                    _ => None,
                };
                let Some(element) = element else {
                    return Err(self.error(format!("Tuple has no element {index}")));
                };
                self.push(element)?;
            }
            Opcode::GetTupleLabel => {
                let label = self.read_string_operand()?;
                let tuple = self.pop();
                let element = match self.heap_data(tuple)? {
                    HeapData::Tuple(t) => t.label_index(&label).and_then(|i| t.elements.get(i).copied()),
                    _ => None,
                };
                let Some(element) = element else {
                    return Err(self.error(format!("Tuple has no element labeled '{label}'")));
                };
                self.push(element)?;
            }

            Opcode::Unwrap => {
                if self.peek(0)?.is_nil() {
                    return Err(self.error("Unexpectedly found nil while unwrapping an Optional value"));
                }
            }
            Opcode::OptionalChain => {
                let name = self.read_string_operand()?;
                let object = self.pop();
                if object.is_nil() {
                    self.push(Value::Nil)?;
                } else {
                    let value = self.get_property_value(object, &name)?;
                    self.push(value)?;
                }
            }
            Opcode::NilCoalesce => {
                let fallback = self.pop();
                let value = self.pop();
                self.push(if value.is_nil() { fallback } else { value })?;
            }

            Opcode::Class => self.op_class()?,
            Opcode::Inherit => self.op_inherit()?,
            Opcode::Struct => self.op_struct()?,
            Opcode::Enum => self.op_enum()?,
            Opcode::EnumCase => self.op_enum_case()?,
            Opcode::Protocol => self.op_protocol()?,
            Opcode::Function => {
                let proto = self.read_u16();
                let id = self.heap.allocate(HeapData::Function(crate::object::FunctionObj { proto }));
                self.push(Value::obj(id))?;
            }
            Opcode::Closure => self.op_closure()?,
            Opcode::Method => self.op_method()?,
            Opcode::StructMethod => self.op_struct_method()?,
            Opcode::DefineProperty => self.op_define_property(false)?,
            Opcode::DefinePropertyWithObservers => self.op_define_property(true)?,
            Opcode::DefineComputedProperty => self.op_define_computed_property()?,
            Opcode::GetProperty => {
                let name = self.read_string_operand()?;
                let object = self.pop();
                let value = self.get_property_value(object, &name)?;
                self.push(value)?;
            }
            Opcode::SetProperty => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                let object = self.pop();
                self.set_property_value(object, &name, value)?;
                self.push(value)?;
            }
            Opcode::Super => self.op_super()?,

            Opcode::MatchEnumCase => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                let matches = matches!(
                    self.heap_data_opt(value),
                    Some(HeapData::EnumCase(case)) if case.case_name == name
                );
                self.push(Value::Bool(matches))?;
            }
            Opcode::GetAssociated => {
                let index = self.read_u16() as usize;
                let value = self.pop();
                let element = match self.heap_data(value)? {
                    HeapData::EnumCase(case) => case.assoc_values.get(index).copied(),
                    _ => None,
                };
                let Some(element) = element else {
                    return Err(self.error(format!("Enum case has no associated value {index}")));
                };
                self.push(element)?;
            }
            Opcode::TypeCheck => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                let matches = self.matches_type(value, &name);
                self.push(Value::Bool(matches))?;
            }
            Opcode::TypeCast => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                let result = self.cast_value(value, &name)?;
                self.push(result)?;
            }
            Opcode::TypeCastOptional => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                if self.matches_type(value, &name) {
                    self.push(value)?;
                } else {
                    self.push(Value::Nil)?;
                }
            }
            Opcode::TypeCastForced => {
                let name = self.read_string_operand()?;
                let value = self.pop();
                if self.matches_type(value, &name) {
                    self.push(value)?;
                } else {
                    return Err(self.error(format!(
                        "Cannot cast {} to '{name}'",
                        self.type_name_of(value)
                    )));
                }
            }

            Opcode::Print => {
                let value = self.pop();
                let text = self.display_string(value);
                self.print.print_line(&text);
            }
            Opcode::ReadLine => {
                let line = self.input.read_line();
                match line {
                    Some(text) => {
                        let id = self.heap.allocate(HeapData::Str(text));
                        self.push(Value::obj(id))?;
                    }
                    None => self.push(Value::Nil)?,
                }
            }
            Opcode::Throw => {
                let value = self.pop();
                let text = self.display_string(value);
                return Err(self.error(format!("Uncaught error: {text}")));
            }
        }
        Ok(Flow::Continue)
    }

    // ---- Stack primitives ----

    pub(crate) fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= self.config.max_stack {
            return Err(self.error("stack overflow"));
        }
        self.heap.retain_value(value);
        self.stack.push(value);
        Ok(())
    }

    /// Pops and releases. The returned value is safe to use until the next
    /// cleanup point (cleanup only runs between instructions).
    pub(crate) fn pop(&mut self) -> Value {
        let value = self.stack.pop().unwrap_or(Value::Nil);
        self.heap.release_value(value);
        value
    }

    pub(crate) fn peek(&self, distance: usize) -> RunResult<Value> {
        self.stack
            .len()
            .checked_sub(1 + distance)
            .and_then(|i| self.stack.get(i).copied())
            .ok_or_else(|| self.error("stack underflow"))
    }

    pub(crate) fn stack_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    // ---- Operand reading ----

    fn current_chunk(&self) -> &Chunk {
        match self.active {
            ActiveBody::TopLevel => &self.assembly.code,
            ActiveBody::Body(index) => self.assembly.body(index),
        }
    }

    pub(crate) fn read_byte(&mut self) -> u8 {
        let byte = self.current_chunk().code[self.ip];
        self.ip += 1;
        byte
    }

    pub(crate) fn read_u8(&mut self) -> u8 {
        self.read_byte()
    }

    pub(crate) fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from_le_bytes([lo, hi])
    }

    pub(crate) fn string_at(&self, index: u16) -> RunResult<String> {
        self.assembly
            .strings
            .get_checked(crate::intern::StringId(index))
            .map(str::to_owned)
            .ok_or_else(|| self.error("corrupt bytecode: string index out of range"))
    }

    pub(crate) fn read_string_operand(&mut self) -> RunResult<String> {
        let index = self.read_u16();
        self.string_at(index)
    }

    // ---- Errors ----

    pub(crate) fn error(&self, message: impl Into<String>) -> RuntimeError {
        let mut error = RuntimeError::new(message);
        let offset = self.ip.saturating_sub(1);
        error.line = self.current_chunk().line_at(offset);
        error.call_stack = self.frames.iter().map(|f| f.function_name.clone()).collect();
        error
    }

    pub(crate) fn heap_data(&self, value: Value) -> RunResult<&HeapData> {
        match value {
            Value::Obj(r) => self
                .heap
                .get_if_live(r.id)
                .ok_or_else(|| self.error("access to an already-released object")),
            other => Err(self.error(format!("expected an object, found {}", self.type_name_of(other)))),
        }
    }

    pub(crate) fn heap_data_opt(&self, value: Value) -> Option<&HeapData> {
        value.as_obj().and_then(|r| self.heap.get_if_live(r.id))
    }

    // ---- Globals ----

    fn get_global(&mut self, name: &str) -> RunResult<()> {
        if let Some(&value) = self.globals.get(name) {
            return self.push(value);
        }
        // Host functions surface as callable builtin values.
        if self.natives.has_function(name) {
            let id = self.heap.allocate(HeapData::BuiltinMethod(crate::object::BuiltinMethodObj {
                receiver: Value::Nil,
                name: name.to_owned(),
            }));
            return self.push(Value::obj(id));
        }
        Err(self.error(format!("Undefined variable '{name}'")))
    }

    // ---- Upvalues ----

    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        for &id in &self.open_upvalues {
            if let Some(HeapData::Upvalue(UpvalueObj::Open(existing))) = self.heap.get_if_live(id) {
                if *existing == slot {
                    return id;
                }
            }
        }
        let id = self.heap.allocate(HeapData::Upvalue(UpvalueObj::Open(slot)));
        self.open_upvalues.push(id);
        id
    }

    /// Closes every open upvalue at or above `from_slot`, promoting the slot
    /// value to heap ownership.
    pub(crate) fn close_upvalues_from(&mut self, from_slot: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for id in std::mem::take(&mut self.open_upvalues) {
            let slot = match self.heap.get_if_live(id) {
                Some(HeapData::Upvalue(UpvalueObj::Open(slot))) => Some(*slot),
                _ => None,
            };
            match slot {
                Some(slot) if slot >= from_slot => {
                    let value = self.stack[slot];
                    self.heap.retain_value(value);
                    if let Some(HeapData::Upvalue(upvalue)) = self.heap.get_mut_if_live(id) {
                        *upvalue = UpvalueObj::Closed(value);
                    }
                }
                Some(_) => remaining.push(id),
                None => {}
            }
        }
        self.open_upvalues = remaining;
    }

    fn current_closure_upvalue(&self, index: usize) -> RunResult<HeapId> {
        let closure = self
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| self.error("upvalue access outside of a closure"))?;
        match self.heap.get_if_live(closure) {
            Some(HeapData::Closure(c)) => c
                .upvalues
                .get(index)
                .copied()
                .ok_or_else(|| self.error("corrupt bytecode: upvalue index out of range")),
            _ => Err(self.error("corrupt frame: closure is gone")),
        }
    }

    fn read_upvalue(&mut self, index: usize) -> RunResult<Value> {
        let id = self.current_closure_upvalue(index)?;
        match self.heap.get_if_live(id) {
            Some(HeapData::Upvalue(UpvalueObj::Open(slot))) => Ok(self.stack[*slot]),
            Some(HeapData::Upvalue(UpvalueObj::Closed(value))) => Ok(*value),
            _ => Err(self.error("corrupt upvalue")),
        }
    }

    fn write_upvalue(&mut self, index: usize, value: Value) -> RunResult<()> {
        let id = self.current_closure_upvalue(index)?;
        match self.heap.get_if_live(id) {
            Some(HeapData::Upvalue(UpvalueObj::Open(slot))) => {
                let slot = *slot;
                self.heap.retain_value(value);
                let old = std::mem::replace(&mut self.stack[slot], value);
                self.heap.release_value(old);
                Ok(())
            }
            Some(HeapData::Upvalue(UpvalueObj::Closed(old))) => {
                let old = *old;
                self.heap.retain_value(value);
                if let Some(HeapData::Upvalue(upvalue)) = self.heap.get_mut_if_live(id) {
                    *upvalue = UpvalueObj::Closed(value);
                }
                self.heap.release_value(old);
                Ok(())
            }
            _ => Err(self.error("corrupt upvalue")),
        }
    }

    // ---- Value semantics ----

    /// Replaces TOS with a value-semantic copy when it is a struct instance
    /// or a tuple; all other values pass through.
    fn copy_value_top(&mut self) -> RunResult<()> {
        let top = self.peek(0)?;
        let copied = self.copy_value(top);
        if copied != top {
            self.pop();
            self.push(copied)?;
        }
        Ok(())
    }

    /// Value-semantic copy: deep for struct instances, shallow (new spine,
    /// shared element references) for tuples.
    pub(crate) fn copy_value(&mut self, value: Value) -> Value {
        let Some(r) = value.as_obj() else {
            return value;
        };
        if !r.is_strong() {
            return value;
        }
        match self.heap.get_if_live(r.id) {
            Some(HeapData::StructInstance(_)) => Value::obj(self.deep_copy_struct(r.id)),
            Some(HeapData::Tuple(tuple)) => {
                let copy = tuple.clone();
                for &element in &copy.elements {
                    self.heap.retain_value(element);
                }
                Value::obj(self.heap.allocate(HeapData::Tuple(copy)))
            }
            _ => value,
        }
    }

    pub(crate) fn deep_copy_struct(&mut self, id: HeapId) -> HeapId {
        let (struct_type, fields) = match self.heap.get_if_live(id) {
            Some(HeapData::StructInstance(instance)) => (instance.struct_type, instance.fields.clone()),
            _ => return id,
        };
        let mut copied_fields = indexmap::IndexMap::with_capacity(fields.len());
        for (name, value) in fields {
            let copied = self.copy_value(value);
            self.heap.retain_value(copied);
            copied_fields.insert(name, copied);
        }
        self.heap.retain(struct_type);
        self.heap.allocate(HeapData::StructInstance(crate::object::StructInstanceObj {
            struct_type,
            fields: copied_fields,
        }))
    }

    // ---- Arithmetic and comparison ----

    fn binary_op(&mut self, op: Opcode) -> RunResult<()> {
        let b = self.pop();
        let a = self.pop();
        // A user type on the left resolves an operator method of the same
        // name through the ordinary dispatch path.
        if let Some(symbol) = operator_symbol(op) {
            if let Some(result) = self.try_operator_overload(symbol, a, b)? {
                return self.push(result);
            }
        }
        let result = match op {
            Opcode::Add => self.add_values(a, b)?,
            Opcode::Subtract => self.numeric_op(a, b, "-", |x, y| x.wrapping_sub(y), |x, y| x - y)?,
            Opcode::Multiply => self.numeric_op(a, b, "*", |x, y| x.wrapping_mul(y), |x, y| x * y)?,
            Opcode::Divide => match (a, b) {
                (Value::Int(_), Value::Int(0)) => return Err(self.error("Division by zero")),
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_div(y)),
                _ => self.float_op(a, b, "/", |x, y| x / y)?,
            },
            Opcode::Modulo => match (a, b) {
                (Value::Int(_), Value::Int(0)) => return Err(self.error("Division by zero")),
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_rem(y)),
                _ => self.float_op(a, b, "%", |x, y| x % y)?,
            },
            Opcode::BitwiseAnd => self.int_op(a, b, "&", |x, y| x & y)?,
            Opcode::BitwiseOr => self.int_op(a, b, "|", |x, y| x | y)?,
            Opcode::BitwiseXor => self.int_op(a, b, "^", |x, y| x ^ y)?,
            Opcode::LeftShift => self.int_op(a, b, "<<", |x, y| x.wrapping_shl(y as u32 & 63))?,
            Opcode::RightShift => self.int_op(a, b, ">>", |x, y| x.wrapping_shr(y as u32 & 63))?,
            Opcode::Less => self.compare_values(a, b, "<", |o| o == std::cmp::Ordering::Less)?,
            Opcode::Greater => self.compare_values(a, b, ">", |o| o == std::cmp::Ordering::Greater)?,
            Opcode::LessEqual => self.compare_values(a, b, "<=", |o| o != std::cmp::Ordering::Greater)?,
            Opcode::GreaterEqual => self.compare_values(a, b, ">=", |o| o != std::cmp::Ordering::Less)?,
            Opcode::And => Value::Bool(a.is_truthy() && b.is_truthy()),
            Opcode::Or => Value::Bool(a.is_truthy() || b.is_truthy()),
            _ => unreachable!("not a binary opcode"),
        };
        self.push(result)
    }

    /// Invokes `lhs.<symbol>(rhs)` when the left operand is a class or
    /// struct instance whose type declares an operator method. Struct
    /// receivers bind a value-semantic copy, like any non-mutating method.
    fn try_operator_overload(&mut self, symbol: &str, a: Value, b: Value) -> RunResult<Option<Value>> {
        let found = match self.heap_data_opt(a) {
            Some(HeapData::StructInstance(instance)) => match self.heap.get_if_live(instance.struct_type) {
                Some(HeapData::Struct(ty)) => ty.methods.get(symbol).copied().map(|m| (m, true)),
                _ => None,
            },
            Some(HeapData::Instance(instance)) => self.find_class_method(instance.class, symbol).map(|m| (m, false)),
            _ => None,
        };
        let Some((method, is_struct)) = found else {
            return Ok(None);
        };
        let receiver = if is_struct {
            Value::obj(self.deep_copy_struct(a.as_obj().expect("struct instance is an object").id))
        } else {
            a
        };
        let result = self.run_nested_call(method, &[receiver, b])?;
        Ok(Some(result))
    }

    fn add_values(&mut self, a: Value, b: Value) -> RunResult<Value> {
        // String on either side coerces the other via display conversion.
        let a_is_str = matches!(self.heap_data_opt(a), Some(HeapData::Str(_)));
        let b_is_str = matches!(self.heap_data_opt(b), Some(HeapData::Str(_)));
        if a_is_str || b_is_str {
            let mut text = self.display_string(a);
            text.push_str(&self.display_string(b));
            let id = self.heap.allocate(HeapData::Str(text));
            return Ok(Value::obj(id));
        }
        if let (Some(HeapData::List(left)), Some(HeapData::List(right))) = (self.heap_data_opt(a), self.heap_data_opt(b))
        {
            let mut elements = left.elements.clone();
            elements.extend(right.elements.iter().copied());
            for &element in &elements {
                self.heap.retain_value(element);
            }
            let id = self.heap.allocate(HeapData::List(ListObj { elements }));
            return Ok(Value::obj(id));
        }
        self.numeric_op(a, b, "+", i64::wrapping_add, |x, y| x + y)
    }

    fn numeric_op(
        &self,
        a: Value,
        b: Value,
        symbol: &str,
        int_op: impl Fn(i64, i64) -> i64,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(x, y))),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(float_op(x, y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(float_op(x as f64, y))),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(float_op(x, y as f64))),
            _ => Err(self.error(format!(
                "Invalid operands {} and {} for '{symbol}'",
                self.type_name_of(a),
                self.type_name_of(b)
            ))),
        }
    }

    fn float_op(&self, a: Value, b: Value, symbol: &str, op: impl Fn(f64, f64) -> f64) -> RunResult<Value> {
        let to_f = |v: Value| match v {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        };
        match (to_f(a), to_f(b)) {
            (Some(x), Some(y)) => Ok(Value::Float(op(x, y))),
            _ => Err(self.error(format!(
                "Invalid operands {} and {} for '{symbol}'",
                self.type_name_of(a),
                self.type_name_of(b)
            ))),
        }
    }

    fn int_op(&self, a: Value, b: Value, symbol: &str, op: impl Fn(i64, i64) -> i64) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(op(x, y))),
            _ => Err(self.error(format!(
                "Bitwise '{symbol}' requires Int operands, found {} and {}",
                self.type_name_of(a),
                self.type_name_of(b)
            ))),
        }
    }

    fn compare_values(
        &self,
        a: Value,
        b: Value,
        symbol: &str,
        test: impl Fn(std::cmp::Ordering) -> bool,
    ) -> RunResult<Value> {
        let ordering = match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.partial_cmp(&y),
            (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
            (Value::Int(x), Value::Float(y)) => (x as f64).partial_cmp(&y),
            (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(y as f64)),
            _ => match (self.heap_data_opt(a), self.heap_data_opt(b)) {
                (Some(HeapData::Str(x)), Some(HeapData::Str(y))) => x.partial_cmp(y),
                _ => None,
            },
        };
        match ordering {
            Some(ordering) => Ok(Value::Bool(test(ordering))),
            None => Err(self.error(format!(
                "Cannot compare {} and {} with '{symbol}'",
                self.type_name_of(a),
                self.type_name_of(b)
            ))),
        }
    }

    /// Content equality for strings, enum cases, tuples, and lists;
    /// identity for everything else heap-allocated.
    pub(crate) fn values_equal(&self, a: Value, b: Value) -> bool {
        if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
            if x.id == y.id {
                return true;
            }
            return match (self.heap.get_if_live(x.id), self.heap.get_if_live(y.id)) {
                (Some(HeapData::Str(s1)), Some(HeapData::Str(s2))) => s1 == s2,
                (Some(HeapData::EnumCase(c1)), Some(HeapData::EnumCase(c2))) => {
                    c1.enum_type == c2.enum_type
                        && c1.case_name == c2.case_name
                        && c1.assoc_values.len() == c2.assoc_values.len()
                        && c1
                            .assoc_values
                            .iter()
                            .zip(&c2.assoc_values)
                            .all(|(&v1, &v2)| self.values_equal(v1, v2))
                }
                (Some(HeapData::Tuple(t1)), Some(HeapData::Tuple(t2))) => {
                    t1.elements.len() == t2.elements.len()
                        && t1
                            .elements
                            .iter()
                            .zip(&t2.elements)
                            .all(|(&v1, &v2)| self.values_equal(v1, v2))
                }
                (Some(HeapData::List(l1)), Some(HeapData::List(l2))) => {
                    l1.elements.len() == l2.elements.len()
                        && l1
                            .elements
                            .iter()
                            .zip(&l2.elements)
                            .all(|(&v1, &v2)| self.values_equal(v1, v2))
                }
                _ => false,
            };
        }
        a.primitive_eq(b)
    }

    // ---- Subscripts ----

    fn get_subscript(&mut self) -> RunResult<()> {
        let index = self.pop();
        let object = self.pop();
        let result = match self.heap_data(object)? {
            HeapData::List(list) => {
                let Value::Int(i) = index else {
                    return Err(self.error("Array index must be Int"));
                };
                let len = list.elements.len();
                let i = usize::try_from(i).map_err(|_| self.error("Array index out of range"))?;
                if i >= len {
                    return Err(self.error("Array index out of range"));
                }
                list.elements[i]
            }
            HeapData::Map(map) => {
                let key = self.display_string(index);
                map.entries.get(&key).copied().unwrap_or(Value::Nil)
            }
            HeapData::Tuple(tuple) => {
                let Value::Int(i) = index else {
                    return Err(self.error("Tuple index must be Int"));
                };
                let i = usize::try_from(i).map_err(|_| self.error("Tuple index out of range"))?;
                *tuple
                    .elements
                    .get(i)
                    .ok_or_else(|| self.error("Tuple index out of range"))?
            }
            HeapData::Str(s) => {
                let Value::Int(i) = index else {
                    return Err(self.error("String index must be Int"));
                };
                let i = usize::try_from(i).map_err(|_| self.error("String index out of range"))?;
                let ch = s
                    .chars()
                    .nth(i)
                    .ok_or_else(|| self.error("String index out of range"))?;
                let id = self.heap.allocate(HeapData::Str(ch.to_string()));
                Value::obj(id)
            }
            other => {
                return Err(self.error(format!("Cannot subscript {}", other.variant_name())));
            }
        };
        self.push(result)
    }

    fn set_subscript(&mut self) -> RunResult<()> {
        let value = self.pop();
        let index = self.pop();
        let object = self.pop();
        let Some(r) = object.as_obj() else {
            return Err(self.error("Cannot subscript a non-object value"));
        };
        self.heap.retain_value(value);
        let key_for_map = match self.heap.get_if_live(r.id) {
            Some(HeapData::Map(_)) => Some(self.display_string(index)),
            _ => None,
        };
        let old = match self.heap.get_mut_if_live(r.id) {
            Some(HeapData::List(list)) => {
                let Value::Int(i) = index else {
                    return Err(self.error("Array index must be Int"));
                };
                let len = list.elements.len();
                let i = usize::try_from(i).ok().filter(|&i| i < len);
                let Some(i) = i else {
                    return Err(self.error("Array index out of range"));
                };
                Some(std::mem::replace(&mut list.elements[i], value))
            }
            Some(HeapData::Map(map)) => {
                let key = key_for_map.expect("map key prepared above");
                map.entries.insert(key, value)
            }
            Some(other) => {
                let message = format!("Cannot assign into {}", other.variant_name());
                return Err(self.error(message));
            }
            None => return Err(self.error("access to an already-released object")),
        };
        if let Some(old) = old {
            self.heap.release_value(old);
        }
        self.push(value)
    }

    // ---- Type operations ----

    /// Runtime type test: builtin names match by shape; classes walk the
    /// hierarchy; structs and enums match by type identity; protocols check
    /// the metadata interface lists.
    pub(crate) fn matches_type(&self, value: Value, name: &str) -> bool {
        match name {
            "Int" => return matches!(value, Value::Int(_)),
            "Float" => return matches!(value, Value::Float(_)),
            "Bool" => return matches!(value, Value::Bool(_)),
            "Void" => return value.is_nil(),
            "Any" => return !value.is_nil(),
            "String" => return matches!(self.heap_data_opt(value), Some(HeapData::Str(_))),
            "Array" => return matches!(self.heap_data_opt(value), Some(HeapData::List(_))),
            "Dictionary" => return matches!(self.heap_data_opt(value), Some(HeapData::Map(_))),
            _ => {}
        }
        match self.heap_data_opt(value) {
            Some(HeapData::Instance(instance)) => {
                // Walk the class hierarchy, then try protocol conformance.
                let mut current = Some(instance.class);
                while let Some(class_id) = current {
                    let Some(HeapData::Class(class)) = self.heap.get_if_live(class_id) else {
                        break;
                    };
                    if class.name == name {
                        return true;
                    }
                    if self.type_conforms(&class.name, name) {
                        return true;
                    }
                    current = class.superclass;
                }
                false
            }
            Some(HeapData::StructInstance(instance)) => {
                match self.heap.get_if_live(instance.struct_type) {
                    Some(HeapData::Struct(ty)) => ty.name == name || self.type_conforms(&ty.name, name),
                    _ => false,
                }
            }
            Some(HeapData::EnumCase(case)) => match self.heap.get_if_live(case.enum_type) {
                Some(HeapData::Enum(ty)) => ty.name == name || self.type_conforms(&ty.name, name),
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether the metadata records `type_name` conforming to the protocol
    /// `protocol_name`, directly or through protocol inheritance.
    fn type_conforms(&self, type_name: &str, protocol_name: &str) -> bool {
        let Some(type_def) = self.assembly.find_type_def(type_name) else {
            return false;
        };
        for &interface in &type_def.interfaces {
            let Some(interface_name) = self.assembly.strings.get_checked(interface) else {
                continue;
            };
            if interface_name == protocol_name {
                return true;
            }
            if self.protocol_inherits(interface_name, protocol_name) {
                return true;
            }
        }
        false
    }

    fn protocol_inherits(&self, child: &str, ancestor: &str) -> bool {
        let Some(protocol) = self.assembly.protocols.iter().find(|p| p.name == child) else {
            return false;
        };
        protocol
            .inherited
            .iter()
            .any(|parent| parent == ancestor || self.protocol_inherits(parent, ancestor))
    }

    fn cast_value(&self, value: Value, name: &str) -> RunResult<Value> {
        // Numeric conversions for `as` between Int and Float.
        match (value, name) {
            (Value::Int(i), "Float") => return Ok(Value::Float(i as f64)),
            (Value::Float(f), "Int") => return Ok(Value::Int(f as i64)),
            _ => {}
        }
        if self.matches_type(value, name) {
            Ok(value)
        } else {
            Err(self.error(format!("Cannot cast {} to '{name}'", self.type_name_of(value))))
        }
    }

    pub(crate) fn type_name_of(&self, value: Value) -> String {
        if let Some(name) = value.primitive_type_name() {
            if !matches!(value, Value::Obj(_)) {
                return name.to_owned();
            }
        }
        match self.heap_data_opt(value) {
            Some(HeapData::Instance(instance)) => match self.heap.get_if_live(instance.class) {
                Some(HeapData::Class(class)) => class.name.clone(),
                _ => "Instance".to_owned(),
            },
            Some(HeapData::StructInstance(instance)) => match self.heap.get_if_live(instance.struct_type) {
                Some(HeapData::Struct(ty)) => ty.name.clone(),
                _ => "StructInstance".to_owned(),
            },
            Some(HeapData::EnumCase(case)) => match self.heap.get_if_live(case.enum_type) {
                Some(HeapData::Enum(ty)) => ty.name.clone(),
                _ => "EnumCase".to_owned(),
            },
            Some(data) => data.builtin_type_name().to_owned(),
            None => "Void".to_owned(),
        }
    }

    // ---- Display ----

    pub(crate) fn display_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(f),
            Value::Obj(r) => match self.heap.get_if_live(r.id) {
                Some(HeapData::Str(s)) => s.clone(),
                Some(HeapData::List(list)) => {
                    let parts: Vec<String> = list.elements.iter().map(|&v| self.display_string(v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapData::Map(map)) => {
                    if map.entries.is_empty() {
                        return "[:]".to_owned();
                    }
                    let parts: Vec<String> = map
                        .entries
                        .iter()
                        .map(|(k, &v)| format!("{k}: {}", self.display_string(v)))
                        .collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapData::Tuple(tuple)) => {
                    let parts: Vec<String> = tuple
                        .labels
                        .iter()
                        .zip(&tuple.elements)
                        .map(|(label, &v)| match label {
                            Some(label) => format!("{label}: {}", self.display_string(v)),
                            None => self.display_string(v),
                        })
                        .collect();
                    format!("({})", parts.join(", "))
                }
                Some(HeapData::EnumCase(case)) => {
                    let enum_name = match self.heap.get_if_live(case.enum_type) {
                        Some(HeapData::Enum(ty)) => ty.name.clone(),
                        _ => String::new(),
                    };
                    if case.assoc_values.is_empty() {
                        format!("{enum_name}.{}", case.case_name)
                    } else {
                        let parts: Vec<String> = case
                            .assoc_labels
                            .iter()
                            .zip(&case.assoc_values)
                            .map(|(label, &v)| match label {
                                Some(label) => format!("{label}: {}", self.display_string(v)),
                                None => self.display_string(v),
                            })
                            .collect();
                        format!("{enum_name}.{}({})", case.case_name, parts.join(", "))
                    }
                }
                Some(HeapData::Function(f)) => {
                    format!("<function {}>", self.assembly.functions[usize::from(f.proto)].name)
                }
                Some(HeapData::Closure(c)) => {
                    format!("<function {}>", self.assembly.functions[usize::from(c.proto)].name)
                }
                Some(HeapData::BoundMethod(_)) => "<bound method>".to_owned(),
                Some(HeapData::BuiltinMethod(b)) => format!("<builtin {}>", b.name),
                Some(HeapData::Class(c)) => format!("<class {}>", c.name),
                Some(HeapData::Struct(s)) => format!("<struct {}>", s.name),
                Some(HeapData::Enum(e)) => format!("<enum {}>", e.name),
                Some(HeapData::Protocol(p)) => format!("<protocol {}>", p.name),
                Some(HeapData::Instance(instance)) => {
                    let class_name = match self.heap.get_if_live(instance.class) {
                        Some(HeapData::Class(class)) => class.name.clone(),
                        _ => "?".to_owned(),
                    };
                    format!("<{class_name} instance>")
                }
                Some(HeapData::StructInstance(instance)) => {
                    let type_name = match self.heap.get_if_live(instance.struct_type) {
                        Some(HeapData::Struct(ty)) => ty.name.clone(),
                        _ => "?".to_owned(),
                    };
                    let parts: Vec<String> = instance
                        .fields
                        .iter()
                        .map(|(k, &v)| format!("{k}: {}", self.display_string(v)))
                        .collect();
                    format!("{type_name}({})", parts.join(", "))
                }
                Some(HeapData::Upvalue(_)) => "<upvalue>".to_owned(),
                Some(HeapData::Native(n)) => format!("<native {}>", n.type_name),
                None => "nil".to_owned(),
            },
        }
    }

    // ---- Cleanup ----

    /// Drains the deferred-release queue: runs `deinit` for dying instances,
    /// native release callbacks for wrapped pointers, then frees. Guarded
    /// against reentrancy; releases triggered by destructors re-queue.
    pub fn run_cleanup(&mut self) {
        if self.heap.is_collecting || !self.heap.has_deferred() {
            return;
        }
        self.heap.is_collecting = true;
        while let Some(id) = self.heap.pop_deferred() {
            self.run_deinit_for(id);
            self.heap.destroy(id);
        }
        self.heap.is_collecting = false;
        self.heap.reset_rc_counter();
    }

    /// Runs the class-chain `deinit` for a dying instance, or the native
    /// release callback for a wrapped pointer. Failures are swallowed.
    fn run_deinit_for(&mut self, id: HeapId) {
        match self.heap.get_if_live(id) {
            Some(HeapData::Instance(instance)) => {
                let mut current = Some(instance.class);
                let mut deinit = None;
                while let Some(class_id) = current {
                    let Some(HeapData::Class(class)) = self.heap.get_if_live(class_id) else {
                        break;
                    };
                    if let Some(&method) = class.methods.get("deinit") {
                        deinit = Some(method);
                        break;
                    }
                    current = class.superclass;
                }
                if let Some(deinit) = deinit {
                    let _ = self.run_nested_call(deinit, &[Value::obj(id)]);
                }
            }
            Some(HeapData::Native(native)) => {
                let type_name = native.type_name.clone();
                let handle = native.handle;
                // The callback is a destructor for VM-owned pointers and a
                // notification for engine-owned ones.
                self.natives.release_native(&type_name, handle);
            }
            _ => {}
        }
    }

    /// Final teardown: releases the stack and globals, drains the queue,
    /// runs remaining `deinit`s for objects kept alive by cycles, frees all.
    pub(crate) fn shutdown(&mut self) {
        while !self.stack.is_empty() {
            self.pop();
        }
        let globals: Vec<Value> = self.globals.drain().map(|(_, v)| v).collect();
        for value in globals {
            self.heap.release_value(value);
        }
        self.run_cleanup();
        while self.heap.has_deferred() {
            self.run_cleanup();
        }

        // Whatever survives is cyclic garbage; run deinits, then free.
        let survivors = self.heap.live_ids();
        self.heap.is_collecting = true;
        for id in &survivors {
            if matches!(self.heap.get_if_live(*id), Some(HeapData::Instance(_) | HeapData::Native(_))) {
                self.run_deinit_for(*id);
            }
        }
        for id in self.heap.live_ids() {
            self.heap.destroy(id);
        }
        self.heap.is_collecting = false;
    }
}

/// Control-flow outcome of one dispatched instruction.
enum Flow {
    Continue,
    Halt(Value),
    NestedReturn(Value),
}

/// Source spelling of an overloadable binary opcode.
fn operator_symbol(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::Add => "+",
        Opcode::Subtract => "-",
        Opcode::Multiply => "*",
        Opcode::Divide => "/",
        Opcode::Modulo => "%",
        Opcode::Less => "<",
        Opcode::Greater => ">",
        Opcode::LessEqual => "<=",
        Opcode::GreaterEqual => ">=",
        _ => return None,
    })
}
