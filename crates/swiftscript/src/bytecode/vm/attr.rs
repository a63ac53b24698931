//! Property access and object-model definition opcodes.
//!
//! `GET_PROPERTY` resolves by receiver kind, in the order: builtin members
//! on collections and strings, fields, methods (bound), computed properties
//! (getter invoked synchronously), then static surfaces on type objects.
//! `SET_PROPERTY` writes fields, honoring weak/unowned reference kinds,
//! `willSet`/`didSet` observers, and computed setters. The `CLASS` /
//! `STRUCT` / `ENUM` / `METHOD` / `DEFINE_*` opcodes build type objects as
//! the compiler replays a declaration body.

use crate::{
    error::RuntimeError,
    heap::HeapId,
    object::{
        BoundMethodObj, BuiltinMethodObj, ClassObj, ComputedProperty, EnumCaseDescriptor, EnumCaseObj, EnumTypeObj,
        FunctionObj, HeapData, PropertyFlags, PropertyObservers, ProtocolObj, StructTypeObj,
    },
    value::{ObjRef, RefKind, Value},
};

use super::Vm;

type RunResult<T> = Result<T, RuntimeError>;

impl Vm<'_> {
    // ---- Property reads ----

    pub(crate) fn get_property_value(&mut self, object: Value, name: &str) -> RunResult<Value> {
        match object {
            Value::Nil => Err(self.error(format!("Cannot access property '{name}' of nil"))),
            Value::Obj(r) => self.get_object_property(r, name),
            primitive => Err(self.error(format!(
                "Value of type {} has no property '{name}'",
                self.type_name_of(primitive)
            ))),
        }
    }

    fn get_object_property(&mut self, r: ObjRef, name: &str) -> RunResult<Value> {
        let Some(data) = self.heap.get_if_live(r.id) else {
            return Err(self.error(format!("Cannot access '{name}' of a released object")));
        };
        match data {
            HeapData::Str(s) => match name {
                "count" => Ok(Value::Int(s.chars().count() as i64)),
                "isEmpty" => Ok(Value::Bool(s.is_empty())),
                _ => Err(self.error(format!("String has no property '{name}'"))),
            },
            HeapData::List(list) => match name {
                "count" => Ok(Value::Int(list.elements.len() as i64)),
                "isEmpty" => Ok(Value::Bool(list.elements.is_empty())),
                "append" => {
                    let id = self.allocate_builtin_method(Value::Obj(r), "append");
                    Ok(Value::obj(id))
                }
                _ => Err(self.error(format!("Array has no property '{name}'"))),
            },
            HeapData::Map(map) => {
                if let Some(&value) = map.entries.get(name) {
                    return Ok(value);
                }
                match name {
                    "count" => Ok(Value::Int(map.entries.len() as i64)),
                    "isEmpty" => Ok(Value::Bool(map.entries.is_empty())),
                    _ => Ok(Value::Nil),
                }
            }
            HeapData::Tuple(tuple) => tuple
                .label_index(name)
                .and_then(|i| tuple.elements.get(i).copied())
                .ok_or_else(|| self.error(format!("Tuple has no element labeled '{name}'"))),
            HeapData::Instance(instance) => {
                let class_id = instance.class;
                let field = instance.fields.get(name).copied();
                if let Some(value) = field {
                    // Lazy fields materialize through their thunk on first
                    // read.
                    if value.is_nil() {
                        if let Some(thunk) = self.find_class_lazy(class_id, name) {
                            let result = self.run_nested_call(thunk, &[Value::Obj(r)])?;
                            self.store_instance_field_raw(r.id, name, result);
                            return Ok(result);
                        }
                    }
                    return Ok(value);
                }
                if let Some(method) = self.find_class_method(class_id, name) {
                    let id = self.allocate_bound_method(Value::Obj(r), method, false);
                    return Ok(Value::obj(id));
                }
                if let Some(computed) = self.find_class_computed(class_id, name) {
                    return self.run_nested_call(computed.getter, &[Value::Obj(r)]);
                }
                Ok(Value::Nil)
            }
            HeapData::Class(class) => {
                if let Some(&method) = class.static_methods.get(name) {
                    return Ok(method);
                }
                if let Some(&property) = class.static_properties.get(name) {
                    return Ok(property);
                }
                if let Some(&method) = class.methods.get(name) {
                    return Ok(method);
                }
                Err(self.error(format!("Class '{}' has no member '{name}'", class.name)))
            }
            HeapData::Struct(ty) => {
                if let Some(&method) = ty.static_methods.get(name) {
                    return Ok(method);
                }
                if let Some(&property) = ty.static_properties.get(name) {
                    return Ok(property);
                }
                if let Some(&method) = ty.methods.get(name) {
                    return Ok(method);
                }
                Err(self.error(format!("Struct '{}' has no member '{name}'", ty.name)))
            }
            HeapData::StructInstance(instance) => {
                let struct_type = instance.struct_type;
                if let Some(&value) = instance.fields.get(name) {
                    if value.is_nil() {
                        if let Some(thunk) = self.find_struct_lazy(struct_type, name) {
                            let result = self.run_nested_call(thunk, &[Value::Obj(r)])?;
                            self.store_struct_field_raw(r.id, name, result);
                            return Ok(result);
                        }
                    }
                    return Ok(value);
                }
                let (method, mutating) = match self.heap.get_if_live(struct_type) {
                    Some(HeapData::Struct(ty)) => match ty.methods.get(name) {
                        Some(&method) => (Some(method), ty.is_mutating(name)),
                        None => (None, false),
                    },
                    _ => (None, false),
                };
                if let Some(method) = method {
                    // Mutating methods bind the caller's storage; others a
                    // value-semantic copy.
                    let receiver = if mutating {
                        Value::Obj(r)
                    } else {
                        Value::obj(self.deep_copy_struct(r.id))
                    };
                    let id = self.allocate_bound_method(receiver, method, mutating);
                    return Ok(Value::obj(id));
                }
                let computed = match self.heap.get_if_live(struct_type) {
                    Some(HeapData::Struct(ty)) => ty.computed.get(name).copied(),
                    _ => None,
                };
                if let Some(computed) = computed {
                    return self.run_nested_call(computed.getter, &[Value::Obj(r)]);
                }
                Ok(Value::Nil)
            }
            HeapData::Enum(ty) => {
                if let Some(&case) = ty.case_values.get(name) {
                    return Ok(case);
                }
                if let Some(&method) = ty.static_methods.get(name) {
                    return Ok(method);
                }
                if let Some(&method) = ty.methods.get(name) {
                    return Ok(method);
                }
                Err(self.error(format!("Enum '{}' has no case or method named '{name}'", ty.name)))
            }
            HeapData::EnumCase(case) => {
                if name == "rawValue" {
                    return Ok(case.raw);
                }
                if let Some(position) = case.assoc_labels.iter().position(|l| l.as_deref() == Some(name)) {
                    if let Some(&value) = case.assoc_values.get(position) {
                        return Ok(value);
                    }
                }
                let enum_type = case.enum_type;
                let method = match self.heap.get_if_live(enum_type) {
                    Some(HeapData::Enum(ty)) => ty.methods.get(name).copied(),
                    _ => None,
                };
                if let Some(method) = method {
                    let id = self.allocate_bound_method(Value::Obj(r), method, false);
                    return Ok(Value::obj(id));
                }
                let computed = match self.heap.get_if_live(enum_type) {
                    Some(HeapData::Enum(ty)) => ty.computed.get(name).copied(),
                    _ => None,
                };
                if let Some(computed) = computed {
                    return self.run_nested_call(computed.getter, &[Value::Obj(r)]);
                }
                Err(self.error(format!("Enum case has no member '{name}'")))
            }
            HeapData::Native(native) => {
                let type_name = native.type_name.clone();
                let handle = native.handle;
                match self.natives.native_property(&type_name, handle, name) {
                    Some(host_value) => Ok(self.from_host_value(host_value)),
                    None => Err(self.error(format!("Native type '{type_name}' has no property '{name}'"))),
                }
            }
            HeapData::Protocol(p) => Err(self.error(format!("Protocol '{}' has no member '{name}'", p.name))),
            HeapData::Function(_) | HeapData::Closure(_) | HeapData::BoundMethod(_) | HeapData::BuiltinMethod(_) => {
                Err(self.error(format!("Function has no property '{name}'")))
            }
            HeapData::Upvalue(_) => Err(self.error("corrupt stack: upvalue escaped")),
        }
    }

    fn allocate_bound_method(&mut self, receiver: Value, method: Value, mutating: bool) -> HeapId {
        self.heap.retain_value(receiver);
        self.heap.retain_value(method);
        self.heap.allocate(HeapData::BoundMethod(BoundMethodObj {
            receiver,
            method,
            mutating,
        }))
    }

    fn allocate_builtin_method(&mut self, receiver: Value, name: &str) -> HeapId {
        self.heap.retain_value(receiver);
        self.heap.allocate(HeapData::BuiltinMethod(BuiltinMethodObj {
            receiver,
            name: name.to_owned(),
        }))
    }

    // ---- Class-chain lookups ----

    pub(crate) fn find_class_method(&self, class_id: HeapId, name: &str) -> Option<Value> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            match self.heap.get_if_live(id) {
                Some(HeapData::Class(class)) => {
                    if let Some(&method) = class.methods.get(name) {
                        return Some(method);
                    }
                    current = class.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn find_class_computed(&self, class_id: HeapId, name: &str) -> Option<ComputedProperty> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            match self.heap.get_if_live(id) {
                Some(HeapData::Class(class)) => {
                    if let Some(&computed) = class.computed.get(name) {
                        return Some(computed);
                    }
                    current = class.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn find_class_observers(&self, class_id: HeapId, name: &str) -> Option<PropertyObservers> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            match self.heap.get_if_live(id) {
                Some(HeapData::Class(class)) => {
                    if let Some(&observers) = class.observers.get(name) {
                        return Some(observers);
                    }
                    current = class.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn find_class_flags(&self, class_id: HeapId, name: &str) -> PropertyFlags {
        let mut current = Some(class_id);
        while let Some(id) = current {
            match self.heap.get_if_live(id) {
                Some(HeapData::Class(class)) => {
                    if let Some(&flags) = class.property_flags.get(name) {
                        return flags;
                    }
                    current = class.superclass;
                }
                _ => break,
            }
        }
        PropertyFlags::default()
    }

    fn find_class_lazy(&self, class_id: HeapId, name: &str) -> Option<Value> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            match self.heap.get_if_live(id) {
                Some(HeapData::Class(class)) => {
                    if let Some(&thunk) = class.lazy_initializers.get(name) {
                        return Some(thunk);
                    }
                    current = class.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn find_struct_lazy(&self, struct_id: HeapId, name: &str) -> Option<Value> {
        match self.heap.get_if_live(struct_id) {
            Some(HeapData::Struct(ty)) => ty.lazy_initializers.get(name).copied(),
            _ => None,
        }
    }

    /// Stores a field without observer/refkind processing (lazy fill-in).
    fn store_instance_field_raw(&mut self, instance: HeapId, name: &str, value: Value) {
        self.heap.retain_value(value);
        if let Some(HeapData::Instance(inst)) = self.heap.get_mut_if_live(instance) {
            if let Some(old) = inst.fields.insert(name.to_owned(), value) {
                self.heap.release_value(old);
            }
        }
    }

    fn store_struct_field_raw(&mut self, instance: HeapId, name: &str, value: Value) {
        self.heap.retain_value(value);
        if let Some(HeapData::StructInstance(inst)) = self.heap.get_mut_if_live(instance) {
            if let Some(old) = inst.fields.insert(name.to_owned(), value) {
                self.heap.release_value(old);
            }
        }
    }

    // ---- Property writes ----

    pub(crate) fn set_property_value(&mut self, object: Value, name: &str, value: Value) -> RunResult<()> {
        let Some(r) = object.as_obj() else {
            return Err(self.error(format!(
                "Cannot set property '{name}' on {}",
                self.type_name_of(object)
            )));
        };
        match self.heap.get_if_live(r.id) {
            Some(HeapData::Instance(instance)) => {
                let class_id = instance.class;
                // Computed property: the setter runs instead of a store.
                if let Some(computed) = self.find_class_computed(class_id, name) {
                    let Some(setter) = computed.setter else {
                        return Err(self.error(format!("Cannot assign to get-only property '{name}'")));
                    };
                    self.run_nested_call(setter, &[object, value])?;
                    return Ok(());
                }
                let observers = self.find_class_observers(class_id, name);
                let old = match self.heap.get_if_live(r.id) {
                    Some(HeapData::Instance(instance)) => instance.fields.get(name).copied().unwrap_or(Value::Nil),
                    _ => Value::Nil,
                };
                if let Some(will_set) = observers.as_ref().and_then(|o| o.will_set) {
                    let _ = self.run_nested_call(will_set, &[object, value])?;
                }
                let flags = self.find_class_flags(class_id, name);
                self.store_field_with_kind(r.id, name, value, flags.ref_kind, true)?;
                if let Some(did_set) = observers.as_ref().and_then(|o| o.did_set) {
                    let _ = self.run_nested_call(did_set, &[object, old])?;
                }
                Ok(())
            }
            Some(HeapData::StructInstance(instance)) => {
                let struct_type = instance.struct_type;
                let computed = match self.heap.get_if_live(struct_type) {
                    Some(HeapData::Struct(ty)) => ty.computed.get(name).copied(),
                    _ => None,
                };
                if let Some(computed) = computed {
                    let Some(setter) = computed.setter else {
                        return Err(self.error(format!("Cannot assign to get-only property '{name}'")));
                    };
                    self.run_nested_call(setter, &[object, value])?;
                    return Ok(());
                }
                self.store_field_with_kind(r.id, name, value, RefKind::Strong, false)?;
                Ok(())
            }
            Some(HeapData::Class(_)) => {
                self.heap.retain_value(value);
                if let Some(HeapData::Class(class)) = self.heap.get_mut_if_live(r.id) {
                    if let Some(old) = class.static_properties.insert(name.to_owned(), value) {
                        self.heap.release_value(old);
                    }
                }
                Ok(())
            }
            Some(HeapData::Struct(_)) => {
                self.heap.retain_value(value);
                if let Some(HeapData::Struct(ty)) = self.heap.get_mut_if_live(r.id) {
                    if let Some(old) = ty.static_properties.insert(name.to_owned(), value) {
                        self.heap.release_value(old);
                    }
                }
                Ok(())
            }
            Some(HeapData::Map(_)) => {
                self.heap.retain_value(value);
                if let Some(HeapData::Map(map)) = self.heap.get_mut_if_live(r.id) {
                    if let Some(old) = map.entries.insert(name.to_owned(), value) {
                        self.heap.release_value(old);
                    }
                }
                Ok(())
            }
            Some(other) => Err(self.error(format!("Cannot set property '{name}' on {}", other.variant_name()))),
            None => Err(self.error("Cannot set a property on a released object")),
        }
    }

    /// Stores a field honoring its declared reference kind: weak stores a
    /// weak-tagged uncounted ref and registers in the target's back-list;
    /// unowned stores an uncounted ref; strong retains.
    fn store_field_with_kind(
        &mut self,
        owner: HeapId,
        name: &str,
        value: Value,
        kind: RefKind,
        is_class_instance: bool,
    ) -> RunResult<()> {
        let stored = match (value, kind) {
            (Value::Obj(vr), RefKind::Weak) => {
                self.heap.register_weak_backref(vr.id, owner, name);
                Value::Obj(vr.with_kind(RefKind::Weak))
            }
            (Value::Obj(vr), RefKind::Unowned) => Value::Obj(vr.with_kind(RefKind::Unowned)),
            (other, _) => {
                self.heap.retain_value(other);
                other
            }
        };

        let old = {
            let fields = match self.heap.get_mut_if_live(owner) {
                Some(HeapData::Instance(instance)) if is_class_instance => &mut instance.fields,
                Some(HeapData::StructInstance(instance)) if !is_class_instance => &mut instance.fields,
                _ => return Err(self.error("Cannot set a property on a released object")),
            };
            fields.insert(name.to_owned(), stored)
        };

        if let Some(old) = old {
            match old {
                Value::Obj(old_ref) if old_ref.kind == RefKind::Weak => {
                    self.heap.unregister_weak_backref(old_ref.id, owner, name);
                }
                other => self.heap.release_value(other),
            }
        }
        Ok(())
    }

    // ---- Definition opcodes ----

    pub(crate) fn op_class(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let id = self.heap.allocate(HeapData::Class(ClassObj::new(name)));
        self.push(Value::obj(id))
    }

    /// Stack `[superclass, class]` → `[class]`, with the superclass linked
    /// and its members copied into the subclass where not overridden.
    pub(crate) fn op_inherit(&mut self) -> RunResult<()> {
        let class_v = self.pop();
        let super_v = self.pop();
        let (Some(class_ref), Some(super_ref)) = (class_v.as_obj(), super_v.as_obj()) else {
            return Err(self.error("superclass must be a class"));
        };
        let superclass = match self.heap.get_if_live(super_ref.id) {
            Some(HeapData::Class(class)) => class.clone(),
            _ => return Err(self.error("superclass must be a class")),
        };

        // Retain everything the subclass is about to reference.
        for (_, &v) in superclass
            .methods
            .iter()
            .chain(&superclass.property_defaults)
            .chain(&superclass.lazy_initializers)
        {
            self.heap.retain_value(v);
        }
        for (_, accessor) in &superclass.computed {
            self.heap.retain_value(accessor.getter);
            if let Some(setter) = accessor.setter {
                self.heap.retain_value(setter);
            }
        }
        for (_, observers) in &superclass.observers {
            if let Some(v) = observers.will_set {
                self.heap.retain_value(v);
            }
            if let Some(v) = observers.did_set {
                self.heap.retain_value(v);
            }
        }
        self.heap.retain(super_ref.id);

        match self.heap.get_mut_if_live(class_ref.id) {
            Some(HeapData::Class(class)) => {
                class.superclass = Some(super_ref.id);
                for (k, v) in superclass.methods {
                    class.methods.entry(k).or_insert(v);
                }
                for (k, v) in superclass.property_defaults {
                    class.property_defaults.entry(k).or_insert(v);
                }
                for (k, v) in superclass.lazy_initializers {
                    class.lazy_initializers.entry(k).or_insert(v);
                }
                for (k, v) in superclass.computed {
                    class.computed.entry(k).or_insert(v);
                }
                for (k, v) in superclass.observers {
                    class.observers.entry(k).or_insert(v);
                }
                for (k, v) in superclass.property_flags {
                    class.property_flags.entry(k).or_insert(v);
                }
            }
            _ => return Err(self.error("INHERIT target is not a class")),
        }
        self.push(class_v)
    }

    pub(crate) fn op_struct(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let id = self.heap.allocate(HeapData::Struct(StructTypeObj::new(name)));
        self.push(Value::obj(id))
    }

    pub(crate) fn op_enum(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let id = self.heap.allocate(HeapData::Enum(EnumTypeObj::new(name)));
        self.push(Value::obj(id))
    }

    /// Adds one case to the enum on top of the stack. The raw value was
    /// pushed just before; payload labels ride as operands.
    pub(crate) fn op_enum_case(&mut self) -> RunResult<()> {
        let case_name = self.read_string_operand()?;
        let assoc_count = usize::from(self.read_u8());
        let mut labels = Vec::with_capacity(assoc_count);
        for _ in 0..assoc_count {
            let raw = self.read_u16();
            if raw == u16::MAX {
                labels.push(None);
            } else {
                labels.push(Some(self.string_at(raw)?));
            }
        }
        let raw_value = self.pop();
        let enum_v = self.peek(0)?;
        let Some(enum_ref) = enum_v.as_obj() else {
            return Err(self.error("ENUM_CASE target is not an enum"));
        };

        // The case object holds the enum and its raw value.
        self.heap.retain(enum_ref.id);
        self.heap.retain_value(raw_value);
        let case_id = self.heap.allocate(HeapData::EnumCase(EnumCaseObj {
            enum_type: enum_ref.id,
            case_name: case_name.clone(),
            raw: raw_value,
            assoc_labels: labels.clone(),
            assoc_values: Vec::new(),
        }));
        self.heap.retain(case_id); // owned by the enum's case map
        self.heap.retain_value(raw_value); // and by the descriptor

        match self.heap.get_mut_if_live(enum_ref.id) {
            Some(HeapData::Enum(ty)) => {
                ty.cases.push(EnumCaseDescriptor {
                    name: case_name.clone(),
                    raw: raw_value,
                    assoc_labels: labels,
                });
                if let Some(old) = ty.case_values.insert(case_name, Value::obj(case_id)) {
                    self.heap.release_value(old);
                }
            }
            _ => return Err(self.error("ENUM_CASE target is not an enum")),
        }
        Ok(())
    }

    pub(crate) fn op_protocol(&mut self) -> RunResult<()> {
        let index = self.read_u16() as usize;
        let def = self
            .assembly
            .protocols
            .get(index)
            .ok_or_else(|| self.error("corrupt bytecode: protocol index out of range"))?;
        let object = ProtocolObj {
            name: def.name.clone(),
            method_requirements: def.method_requirements.clone(),
            property_requirements: def.property_requirements.clone(),
            inherited: def.inherited.clone(),
        };
        let id = self.heap.allocate(HeapData::Protocol(object));
        self.push(Value::obj(id))
    }

    /// `CLOSURE <fi>` followed by `{is_local u8, index u16}` per upvalue.
    pub(crate) fn op_closure(&mut self) -> RunResult<()> {
        let proto_index = self.read_u16();
        let descriptor_count = self.assembly.functions[usize::from(proto_index)].upvalues.len();
        let base = self.stack_base();
        let mut upvalues = Vec::with_capacity(descriptor_count);
        for _ in 0..descriptor_count {
            let is_local = self.read_u8() != 0;
            let index = usize::from(self.read_u16());
            let id = if is_local {
                self.capture_upvalue(base + index)
            } else {
                self.current_frame_closure_upvalue(index)?
            };
            self.heap.retain(id); // owned by the new closure
            upvalues.push(id);
        }
        let id = self.heap.allocate(HeapData::Closure(crate::object::ClosureObj {
            proto: proto_index,
            upvalues,
        }));
        self.push(Value::obj(id))
    }

    fn current_frame_closure_upvalue(&self, index: usize) -> RunResult<HeapId> {
        let closure = self
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| self.error("corrupt bytecode: upvalue capture outside a closure"))?;
        match self.heap.get_if_live(closure) {
            Some(HeapData::Closure(c)) => c
                .upvalues
                .get(index)
                .copied()
                .ok_or_else(|| self.error("corrupt bytecode: upvalue index out of range")),
            _ => Err(self.error("corrupt frame: closure is gone")),
        }
    }

    /// Pops a function and installs it on the type object at TOS. Classes
    /// and enums route through this opcode; the `is_static` operand selects
    /// the method table.
    pub(crate) fn op_method(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let is_static = self.read_u8() != 0;
        let method = self.pop();
        self.heap.retain_value(method);
        let target = self.peek(0)?;
        let Some(target_ref) = target.as_obj() else {
            return Err(self.error("METHOD target is not a type object"));
        };
        let old = match self.heap.get_mut_if_live(target_ref.id) {
            Some(HeapData::Class(class)) => {
                if is_static {
                    class.static_methods.insert(name, method)
                } else {
                    class.methods.insert(name, method)
                }
            }
            Some(HeapData::Enum(ty)) => {
                if is_static {
                    ty.static_methods.insert(name, method)
                } else {
                    ty.methods.insert(name, method)
                }
            }
            Some(HeapData::Struct(ty)) => {
                if is_static {
                    ty.static_methods.insert(name, method)
                } else {
                    ty.methods.insert(name, method)
                }
            }
            _ => return Err(self.error("METHOD target is not a type object")),
        };
        if let Some(old) = old {
            self.heap.release_value(old);
        }
        Ok(())
    }

    pub(crate) fn op_struct_method(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let is_mutating = self.read_u8() != 0;
        let method = self.pop();
        self.heap.retain_value(method);
        let target = self.peek(0)?;
        let Some(target_ref) = target.as_obj() else {
            return Err(self.error("STRUCT_METHOD target is not a struct"));
        };
        let old = match self.heap.get_mut_if_live(target_ref.id) {
            Some(HeapData::Struct(ty)) => {
                if is_mutating && !ty.mutating_methods.iter().any(|m| m == &name) {
                    ty.mutating_methods.push(name.clone());
                }
                ty.methods.insert(name, method)
            }
            _ => return Err(self.error("STRUCT_METHOD target is not a struct")),
        };
        if let Some(old) = old {
            self.heap.release_value(old);
        }
        Ok(())
    }

    /// Pops the initial value (or lazy thunk) and records the property on
    /// the type object at TOS.
    pub(crate) fn op_define_property(&mut self, with_observers: bool) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let flag_byte = self.read_u8();
        let (will_set, did_set) = if with_observers {
            let will = self.read_u16();
            let did = self.read_u16();
            (
                (will != u16::MAX).then(|| self.allocate_function_value(will)),
                (did != u16::MAX).then(|| self.allocate_function_value(did)),
            )
        } else {
            (None, None)
        };

        let value = self.pop();
        self.heap.retain_value(value);
        if let Some(v) = will_set {
            self.heap.retain_value(v);
        }
        if let Some(v) = did_set {
            self.heap.retain_value(v);
        }

        let is_let = flag_byte & 1 != 0;
        let is_static = flag_byte & (1 << 1) != 0;
        let is_lazy = flag_byte & (1 << 2) != 0;
        let ref_kind = if flag_byte & (1 << 3) != 0 {
            RefKind::Weak
        } else if flag_byte & (1 << 4) != 0 {
            RefKind::Unowned
        } else {
            RefKind::Strong
        };
        let flags = PropertyFlags {
            is_let,
            is_static,
            is_lazy,
            ref_kind,
        };

        let target = self.peek(0)?;
        let Some(target_ref) = target.as_obj() else {
            return Err(self.error("DEFINE_PROPERTY target is not a type object"));
        };
        let mut to_release: Vec<Value> = Vec::new();
        match self.heap.get_mut_if_live(target_ref.id) {
            Some(HeapData::Class(class)) => {
                class.property_flags.insert(name.clone(), flags);
                if is_static {
                    if let Some(old) = class.static_properties.insert(name.clone(), value) {
                        to_release.push(old);
                    }
                } else if is_lazy {
                    if let Some(old) = class.lazy_initializers.insert(name.clone(), value) {
                        to_release.push(old);
                    }
                    class.property_defaults.insert(name.clone(), Value::Nil);
                } else if let Some(old) = class.property_defaults.insert(name.clone(), value) {
                    to_release.push(old);
                }
                if will_set.is_some() || did_set.is_some() {
                    class.observers.insert(name, PropertyObservers { will_set, did_set });
                }
            }
            Some(HeapData::Struct(ty)) => {
                if will_set.is_some() || did_set.is_some() {
                    return Err(self.error("property observers are only supported on class properties"));
                }
                ty.property_flags.insert(name.clone(), flags);
                if is_static {
                    if let Some(old) = ty.static_properties.insert(name, value) {
                        to_release.push(old);
                    }
                } else if is_lazy {
                    if let Some(old) = ty.lazy_initializers.insert(name.clone(), value) {
                        to_release.push(old);
                    }
                    ty.property_defaults.insert(name.clone(), Value::Nil);
                } else if let Some(old) = ty.property_defaults.insert(name, value) {
                    to_release.push(old);
                }
            }
            _ => return Err(self.error("DEFINE_PROPERTY target is not a type object")),
        }
        for old in to_release {
            self.heap.release_value(old);
        }
        Ok(())
    }

    fn allocate_function_value(&mut self, proto: u16) -> Value {
        Value::obj(self.heap.allocate(HeapData::Function(FunctionObj { proto })))
    }

    pub(crate) fn op_define_computed_property(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let getter_proto = self.read_u16();
        let setter_proto = self.read_u16();
        let getter = self.allocate_function_value(getter_proto);
        self.heap.retain_value(getter);
        let setter = (setter_proto != u16::MAX).then(|| {
            let v = self.allocate_function_value(setter_proto);
            self.heap.retain_value(v);
            v
        });

        let target = self.peek(0)?;
        let Some(target_ref) = target.as_obj() else {
            return Err(self.error("DEFINE_COMPUTED_PROPERTY target is not a type object"));
        };
        let computed = ComputedProperty { getter, setter };
        match self.heap.get_mut_if_live(target_ref.id) {
            Some(HeapData::Class(class)) => {
                class.computed.insert(name, computed);
            }
            Some(HeapData::Struct(ty)) => {
                ty.computed.insert(name, computed);
            }
            Some(HeapData::Enum(ty)) => {
                ty.computed.insert(name, computed);
            }
            _ => return Err(self.error("DEFINE_COMPUTED_PROPERTY target is not a type object")),
        }
        Ok(())
    }

    /// `SUPER <method>`: pops `self`, resolves the method starting at the
    /// superclass of `self`'s class, pushes it bound to `self`.
    pub(crate) fn op_super(&mut self) -> RunResult<()> {
        let name = self.read_string_operand()?;
        let receiver = self.pop();
        let class_id = match self.heap_data_opt(receiver) {
            Some(HeapData::Instance(instance)) => instance.class,
            _ => return Err(self.error("'super' requires a class instance receiver")),
        };
        let superclass = match self.heap.get_if_live(class_id) {
            Some(HeapData::Class(class)) => class.superclass,
            _ => None,
        };
        let Some(superclass) = superclass else {
            return Err(self.error("'super' used in a class with no superclass"));
        };
        let Some(method) = self.find_class_method(superclass, &name) else {
            return Err(self.error(format!("Superclass has no method '{name}'")));
        };
        let id = self.allocate_bound_method(receiver, method, false);
        self.push(Value::obj(id))
    }
}
