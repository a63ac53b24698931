//! Call dispatch and frame teardown.
//!
//! `CALL`/`CALL_NAMED` pop nothing up front: the callee and arguments stay on
//! the stack and become the new frame's locals. Dispatch forks on the callee
//! kind: compiled functions and closures push a frame; bound methods inject
//! their receiver; classes and structs allocate an instance and run `init`;
//! enum-case constructors build a payload-carrying case; builtin methods and
//! host functions complete inline.

use crate::{
    error::RuntimeError,
    heap::HeapId,
    native::HostValue,
    object::{EnumCaseObj, HeapData, InstanceObj, StructInstanceObj},
    value::Value,
};

use super::{ActiveBody, CallFrame, Vm};

type RunResult<T> = Result<T, RuntimeError>;

/// What `call_value` resolved the callee into.
enum CalleeKind {
    Function {
        proto: u16,
        closure: Option<HeapId>,
    },
    Bound {
        receiver: Value,
        method: Value,
        mutating: bool,
    },
    Class(HeapId),
    Struct(HeapId),
    EnumConstructor(HeapId),
    Builtin {
        receiver: Value,
        name: String,
    },
    NotCallable(String),
}

impl Vm<'_> {
    /// Calls the value sitting `argc` slots below the stack top. `labels`
    /// carries `CALL_NAMED` argument labels (`None` = positional), empty for
    /// plain `CALL`.
    pub(crate) fn call_value(&mut self, argc: usize, labels: &[Option<String>]) -> RunResult<()> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| self.error("stack underflow in call"))?;
        let callee = self.stack[callee_index];

        let kind = self.classify_callee(callee);
        match kind {
            CalleeKind::Function { proto, closure } => {
                self.call_prototype(callee_index, proto, closure, labels, false, false, None)
            }
            CalleeKind::Bound {
                receiver,
                method,
                mutating,
            } => {
                // Rewrite [bound, args...] into [method, receiver, args...].
                self.heap.retain_value(method);
                let old = std::mem::replace(&mut self.stack[callee_index], method);
                self.heap.release_value(old);
                self.heap.retain_value(receiver);
                self.stack.insert(callee_index + 1, receiver);

                let receiver_id = if mutating { receiver.as_obj().map(|r| r.id) } else { None };
                match self.classify_callee(method) {
                    CalleeKind::Function { proto, closure } => {
                        self.call_prototype(callee_index, proto, closure, labels, true, mutating, receiver_id)
                    }
                    _ => Err(self.error("bound method does not wrap a callable")),
                }
            }
            CalleeKind::Class(class_id) => self.construct_class(callee_index, class_id, argc, labels),
            CalleeKind::Struct(struct_id) => self.construct_struct(callee_index, struct_id, argc, labels),
            CalleeKind::EnumConstructor(case_id) => self.construct_enum_case(callee_index, case_id, argc, labels),
            CalleeKind::Builtin { receiver, name } => self.call_builtin(callee_index, receiver, &name, argc),
            CalleeKind::NotCallable(type_name) => {
                Err(self.error(format!("Can only call functions and classes, found {type_name}")))
            }
        }
    }

    fn classify_callee(&self, callee: Value) -> CalleeKind {
        let Some(r) = callee.as_obj() else {
            return CalleeKind::NotCallable(self.type_name_of(callee));
        };
        match self.heap.get_if_live(r.id) {
            Some(HeapData::Function(f)) => CalleeKind::Function {
                proto: f.proto,
                closure: None,
            },
            Some(HeapData::Closure(c)) => CalleeKind::Function {
                proto: c.proto,
                closure: Some(r.id),
            },
            Some(HeapData::BoundMethod(b)) => CalleeKind::Bound {
                receiver: b.receiver,
                method: b.method,
                mutating: b.mutating,
            },
            Some(HeapData::Class(_)) => CalleeKind::Class(r.id),
            Some(HeapData::Struct(_)) => CalleeKind::Struct(r.id),
            Some(HeapData::EnumCase(case)) if !case.assoc_labels.is_empty() && case.assoc_values.is_empty() => {
                CalleeKind::EnumConstructor(r.id)
            }
            Some(HeapData::BuiltinMethod(b)) => CalleeKind::Builtin {
                receiver: b.receiver,
                name: b.name.clone(),
            },
            _ => CalleeKind::NotCallable(self.type_name_of(callee)),
        }
    }

    /// Binds arguments (named reorder, default materialization) and pushes a
    /// frame for a compiled prototype.
    #[expect(clippy::too_many_arguments, reason = "binding carries the full call context")]
    fn call_prototype(
        &mut self,
        callee_index: usize,
        proto_index: u16,
        closure: Option<HeapId>,
        labels: &[Option<String>],
        receiver_injected: bool,
        is_mutating: bool,
        receiver_id: Option<HeapId>,
    ) -> RunResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(self.error("call depth exceeded"));
        }

        let proto = &self.assembly.functions[usize::from(proto_index)];
        let total_params = proto.param_names.len();
        // When the receiver was injected it occupies parameter 0 already;
        // an unbound call provides it as an ordinary positional argument.
        let receiver_offset = usize::from(receiver_injected);
        let declared = total_params - receiver_offset;
        let proto_name = proto.name.clone();
        let is_initializer = proto.is_initializer;
        let chunk = proto.chunk;
        let param_labels: Vec<Option<String>> = proto.param_labels[receiver_offset..].to_vec();
        let param_names: Vec<String> = proto.param_names[receiver_offset..].to_vec();
        let defaults = proto.defaults[receiver_offset..].to_vec();

        let arg_start = callee_index + 1 + receiver_offset;
        let provided: Vec<Value> = self.stack.split_off(arg_start);

        if !labels.is_empty() && labels.len() != provided.len() {
            return Err(self.error("corrupt bytecode: label count does not match arguments"));
        }

        // Slot the provided arguments into declared parameter positions.
        let mut slots: Vec<Option<Value>> = vec![None; declared];
        let mut positional_cursor = 0usize;
        for (index, value) in provided.into_iter().enumerate() {
            let label = labels.get(index).and_then(Clone::clone);
            match label {
                Some(label) => {
                    let Some(position) = param_labels.iter().position(|l| l.as_deref() == Some(label.as_str()))
                    else {
                        return Err(self.error(format!("No parameter named '{label}' in call to '{proto_name}'")));
                    };
                    if slots[position].is_some() {
                        return Err(self.error(format!("Duplicate argument '{label}' in call to '{proto_name}'")));
                    }
                    slots[position] = Some(value);
                }
                None => {
                    while positional_cursor < declared && slots[positional_cursor].is_some() {
                        positional_cursor += 1;
                    }
                    if positional_cursor >= declared {
                        return Err(self.error(format!("Incorrect argument count in call to '{proto_name}'")));
                    }
                    slots[positional_cursor] = Some(value);
                    positional_cursor += 1;
                }
            }
        }

        // Fill the gaps from defaults; missing required parameters fail.
        for (position, slot) in slots.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            match defaults.get(position).and_then(Clone::clone) {
                Some(default) => {
                    let value = self.materialize_default(&default);
                    self.heap.retain_value(value);
                    *slot = Some(value);
                }
                None => {
                    let name = param_names.get(position).cloned().unwrap_or_default();
                    return Err(self.error(format!(
                        "Incorrect argument count in call to '{proto_name}': missing '{name}'"
                    )));
                }
            }
        }

        for slot in slots {
            self.stack.push(slot.expect("all slots filled above"));
        }

        self.frames.push(CallFrame {
            callee_index,
            stack_base: callee_index + 1,
            return_ip: self.ip,
            return_body: self.active,
            function_name: proto_name,
            closure,
            is_initializer,
            is_mutating,
            receiver_id,
        });
        self.active = ActiveBody::Body(chunk);
        self.ip = 0;
        Ok(())
    }

    /// Copies a property default for a fresh instance. Beyond the usual
    /// value-semantic copy, lists and maps get a new spine so instances do
    /// not share mutable storage with the type's default.
    fn copy_default(&mut self, value: Value) -> Value {
        match self.heap_data_opt(value) {
            Some(HeapData::List(list)) => {
                let copy = list.clone();
                for &element in &copy.elements {
                    self.heap.retain_value(element);
                }
                Value::obj(self.heap.allocate(HeapData::List(copy)))
            }
            Some(HeapData::Map(map)) => {
                let copy = map.clone();
                for (_, &element) in &copy.entries {
                    self.heap.retain_value(element);
                }
                Value::obj(self.heap.allocate(HeapData::Map(copy)))
            }
            _ => self.copy_value(value),
        }
    }

    fn materialize_default(&mut self, default: &crate::bytecode::assembly::DefaultValue) -> Value {
        use crate::bytecode::assembly::DefaultValue;
        match default {
            DefaultValue::Nil => Value::Nil,
            DefaultValue::Bool(b) => Value::Bool(*b),
            DefaultValue::Int(i) => Value::Int(*i),
            DefaultValue::Float(f) => Value::Float(*f),
            DefaultValue::Str(s) => Value::obj(self.heap.allocate(HeapData::Str(s.clone()))),
        }
    }

    // ---- Construction ----

    fn construct_class(&mut self, callee_index: usize, class_id: HeapId, argc: usize, labels: &[Option<String>]) -> RunResult<()> {
        let defaults: Vec<(String, Value)> = match self.heap.get_if_live(class_id) {
            Some(HeapData::Class(class)) => class.property_defaults.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            _ => return Err(self.error("corrupt class object")),
        };
        let mut fields = indexmap::IndexMap::with_capacity(defaults.len());
        for (name, value) in defaults {
            let copied = self.copy_default(value);
            self.heap.retain_value(copied);
            fields.insert(name, copied);
        }
        self.heap.retain(class_id);
        let instance_id = self.heap.allocate(HeapData::Instance(InstanceObj {
            class: class_id,
            fields,
        }));

        match self.find_class_method(class_id, "init") {
            Some(init) => {
                self.heap.retain_value(init);
                let old = std::mem::replace(&mut self.stack[callee_index], init);
                self.heap.release_value(old);
                let instance = Value::obj(instance_id);
                self.heap.retain_value(instance);
                self.stack.insert(callee_index + 1, instance);
                match self.classify_callee(init) {
                    CalleeKind::Function { proto, closure } => {
                        self.call_prototype(callee_index, proto, closure, labels, true, false, None)
                    }
                    _ => Err(self.error("corrupt initializer")),
                }
            }
            None => {
                if argc != 0 {
                    return Err(self.error("Incorrect argument count: type has no 'init'"));
                }
                self.pop();
                self.push(Value::obj(instance_id))
            }
        }
    }

    fn construct_struct(&mut self, callee_index: usize, struct_id: HeapId, argc: usize, labels: &[Option<String>]) -> RunResult<()> {
        let defaults: Vec<(String, Value)> = match self.heap.get_if_live(struct_id) {
            Some(HeapData::Struct(ty)) => ty.property_defaults.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            _ => return Err(self.error("corrupt struct object")),
        };
        let mut fields = indexmap::IndexMap::with_capacity(defaults.len());
        for (name, value) in defaults {
            let copied = self.copy_default(value);
            self.heap.retain_value(copied);
            fields.insert(name, copied);
        }
        self.heap.retain(struct_id);
        let instance_id = self.heap.allocate(HeapData::StructInstance(StructInstanceObj {
            struct_type: struct_id,
            fields,
        }));

        let init = match self.heap.get_if_live(struct_id) {
            Some(HeapData::Struct(ty)) => ty.methods.get("init").copied(),
            _ => None,
        };
        match init {
            Some(init) => {
                self.heap.retain_value(init);
                let old = std::mem::replace(&mut self.stack[callee_index], init);
                self.heap.release_value(old);
                let instance = Value::obj(instance_id);
                self.heap.retain_value(instance);
                self.stack.insert(callee_index + 1, instance);
                match self.classify_callee(init) {
                    CalleeKind::Function { proto, closure } => {
                        // Struct `init` binds the instance directly and
                        // returns it on teardown.
                        self.call_prototype(callee_index, proto, closure, labels, true, true, Some(instance_id))
                    }
                    _ => Err(self.error("corrupt initializer")),
                }
            }
            None => {
                if argc != 0 {
                    return Err(self.error("Incorrect argument count: type has no 'init'"));
                }
                self.pop();
                self.push(Value::obj(instance_id))
            }
        }
    }

    /// Builds a payload-carrying enum case from a constructor case; named
    /// arguments are matched to the declared labels.
    fn construct_enum_case(
        &mut self,
        callee_index: usize,
        case_id: HeapId,
        argc: usize,
        labels: &[Option<String>],
    ) -> RunResult<()> {
        let (enum_type, case_name, declared_labels, raw) = match self.heap.get_if_live(case_id) {
            Some(HeapData::EnumCase(case)) => (
                case.enum_type,
                case.case_name.clone(),
                case.assoc_labels.clone(),
                case.raw,
            ),
            _ => return Err(self.error("corrupt enum case")),
        };
        if argc != declared_labels.len() {
            return Err(self.error(format!(
                "Case '.{case_name}' takes {} associated value(s), got {argc}",
                declared_labels.len()
            )));
        }

        let provided = self.stack.split_off(callee_index + 1);
        let mut slots: Vec<Option<Value>> = vec![None; declared_labels.len()];
        let mut positional_cursor = 0usize;
        for (index, value) in provided.into_iter().enumerate() {
            let label = labels.get(index).and_then(Clone::clone);
            match label {
                Some(label) => {
                    let Some(position) = declared_labels.iter().position(|l| l.as_deref() == Some(label.as_str()))
                    else {
                        return Err(self.error(format!("Case '.{case_name}' has no associated value '{label}'")));
                    };
                    if slots[position].is_some() {
                        return Err(self.error(format!("Duplicate associated value '{label}'")));
                    }
                    slots[position] = Some(value);
                }
                None => {
                    while positional_cursor < slots.len() && slots[positional_cursor].is_some() {
                        positional_cursor += 1;
                    }
                    slots[positional_cursor] = Some(value);
                    positional_cursor += 1;
                }
            }
        }
        let assoc_values: Vec<Value> = slots.into_iter().map(|s| s.expect("arity checked above")).collect();

        self.heap.retain(enum_type);
        if let Some(raw_id) = raw.strong_id() {
            self.heap.retain(raw_id);
        }
        let new_case = self.heap.allocate(HeapData::EnumCase(EnumCaseObj {
            enum_type,
            case_name,
            raw,
            assoc_labels: declared_labels,
            assoc_values,
        }));
        self.pop(); // constructor case
        self.push(Value::obj(new_case))
    }

    // ---- Builtins and host functions ----

    fn call_builtin(&mut self, callee_index: usize, receiver: Value, name: &str, argc: usize) -> RunResult<()> {
        // Host function: receiver-less builtin value.
        if receiver.is_nil() {
            let args: Vec<HostValue> = self.stack[callee_index + 1..]
                .iter()
                .map(|&v| self.to_host_value(v))
                .collect();
            let result = self.natives.call(name, &args)?;
            while self.stack.len() > callee_index {
                self.pop();
            }
            let value = self.from_host_value(result);
            return self.push(value);
        }

        match name {
            "append" => {
                if argc != 1 {
                    return Err(self.error("append takes exactly one argument"));
                }
                let element = self.stack[self.stack.len() - 1];
                let Some(r) = receiver.as_obj() else {
                    return Err(self.error("append receiver is not a list"));
                };
                self.heap.retain_value(element);
                match self.heap.get_mut_if_live(r.id) {
                    Some(HeapData::List(list)) => list.elements.push(element),
                    _ => {
                        self.heap.release_value(element);
                        return Err(self.error("append receiver is not a list"));
                    }
                }
                while self.stack.len() > callee_index {
                    self.pop();
                }
                self.push(Value::Nil)
            }
            other => Err(self.error(format!("Unknown builtin method '{other}'"))),
        }
    }

    pub(crate) fn to_host_value(&self, value: Value) -> HostValue {
        match value {
            Value::Nil => HostValue::Nil,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Int(i) => HostValue::Int(i),
            Value::Float(f) => HostValue::Float(f),
            Value::Obj(_) => HostValue::Str(self.display_string(value)),
        }
    }

    pub(crate) fn from_host_value(&mut self, value: HostValue) -> Value {
        match value {
            HostValue::Nil => Value::Nil,
            HostValue::Bool(b) => Value::Bool(b),
            HostValue::Int(i) => Value::Int(i),
            HostValue::Float(f) => Value::Float(f),
            HostValue::Str(s) => Value::obj(self.heap.allocate(HeapData::Str(s))),
        }
    }

    // ---- Return ----

    /// Frame teardown. Initializer frames return `self`; mutating struct
    /// frames write a rebound `self` back into the caller's receiver; open
    /// upvalues over the frame's slots close; locals drain.
    pub(crate) fn do_return(&mut self) -> RunResult<Value> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| self.error("'return' outside of a function"))?;

        let mut result = self.pop();
        if frame.is_initializer {
            result = self.stack[frame.stack_base];
        }

        if frame.is_mutating {
            if let Some(original) = frame.receiver_id {
                let current = self.stack[frame.stack_base];
                if let Some(current_ref) = current.as_obj() {
                    if current_ref.id != original {
                        self.write_back_struct_self(original, current_ref.id);
                    }
                }
            }
        }

        self.close_upvalues_from(frame.stack_base);
        while self.stack.len() > frame.callee_index {
            self.pop();
        }
        self.active = frame.return_body;
        self.ip = frame.return_ip;
        self.push(result)?;
        Ok(result)
    }

    /// Copies the fields of a rebound `self` into the caller's receiver so
    /// value semantics hold when a mutating method replaces `self` outright.
    fn write_back_struct_self(&mut self, receiver: HeapId, new_self: HeapId) {
        let new_fields = match self.heap.get_if_live(new_self) {
            Some(HeapData::StructInstance(instance)) => instance.fields.clone(),
            _ => return,
        };
        for (_, &value) in &new_fields {
            self.heap.retain_value(value);
        }
        let old_fields = match self.heap.get_mut_if_live(receiver) {
            Some(HeapData::StructInstance(instance)) => std::mem::replace(&mut instance.fields, new_fields),
            _ => return,
        };
        for (_, value) in old_fields {
            self.heap.release_value(value);
        }
    }

    /// Synchronously invokes a callable with the given arguments and returns
    /// its result. Used for computed accessors, observers, lazy thunks, and
    /// `deinit` bodies.
    pub(crate) fn run_nested_call(&mut self, callee: Value, args: &[Value]) -> RunResult<Value> {
        let floor = self.frames.len() + 1;
        self.push(callee)?;
        for &arg in args {
            self.push(arg)?;
        }
        self.call_value(args.len(), &[])?;
        if self.frames.len() < floor {
            // Completed inline (builtin/native); result already pushed.
            return Ok(self.pop());
        }
        let result = self.run_loop(floor)?;
        // `do_return` pushed the value for the caller; take it back off.
        self.pop();
        Ok(result)
    }
}
