//! Heap object variants.
//!
//! Every non-primitive runtime value is one of these variants, stored in the
//! heap arena (`heap.rs`) behind a [`crate::heap::HeapId`]. Field and method
//! maps are insertion-ordered so iteration and display are deterministic.

use indexmap::IndexMap;

use crate::{
    heap::HeapId,
    value::{RefKind, Value},
};

/// Getter/setter pair for a computed property. The values are Function or
/// Closure objects.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ComputedProperty {
    pub getter: Value,
    pub setter: Option<Value>,
}

/// `willSet` / `didSet` observer functions for a stored property.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct PropertyObservers {
    pub will_set: Option<Value>,
    pub did_set: Option<Value>,
}

/// Per-property declaration flags carried by class and struct type objects.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PropertyFlags {
    pub is_let: bool,
    pub is_static: bool,
    pub is_lazy: bool,
    pub ref_kind: RefKind,
}

impl Default for PropertyFlags {
    fn default() -> Self {
        Self {
            is_let: false,
            is_static: false,
            is_lazy: false,
            ref_kind: RefKind::Strong,
        }
    }
}

/// Ordered sequence of values.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ListObj {
    pub elements: Vec<Value>,
}

/// Insertion-ordered string-keyed mapping.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct MapObj {
    pub entries: IndexMap<String, Value>,
}

/// Fixed sequence with optional element labels.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TupleObj {
    pub labels: Vec<Option<String>>,
    pub elements: Vec<Value>,
}

impl TupleObj {
    /// Index of the element with the given label, if present.
    #[must_use]
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l.as_deref() == Some(label))
    }
}

/// A plain function value: an index into the assembly's prototype table.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct FunctionObj {
    pub proto: u16,
}

/// A function plus captured upvalue slots (heap ids of Upvalue objects).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClosureObj {
    pub proto: u16,
    pub upvalues: Vec<HeapId>,
}

/// Either points at a live stack slot or owns the closed-over value.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum UpvalueObj {
    /// Absolute index into the VM value stack.
    Open(usize),
    Closed(Value),
}

/// Receiver paired with a method value. `mutating` marks struct methods that
/// bind the receiver's own storage instead of a copy.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
    pub mutating: bool,
}

/// Receiver paired with an engine builtin (e.g. `list.append`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuiltinMethodObj {
    pub receiver: Value,
    pub name: String,
}

/// A class type object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassObj {
    pub name: String,
    pub superclass: Option<HeapId>,
    pub methods: IndexMap<String, Value>,
    pub static_methods: IndexMap<String, Value>,
    pub static_properties: IndexMap<String, Value>,
    pub computed: IndexMap<String, ComputedProperty>,
    pub observers: IndexMap<String, PropertyObservers>,
    /// Initial values instances start from, in declaration order.
    pub property_defaults: IndexMap<String, Value>,
    pub property_flags: IndexMap<String, PropertyFlags>,
    /// Thunks run on first access of a `lazy` property.
    pub lazy_initializers: IndexMap<String, Value>,
}

impl ClassObj {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            superclass: None,
            methods: IndexMap::new(),
            static_methods: IndexMap::new(),
            static_properties: IndexMap::new(),
            computed: IndexMap::new(),
            observers: IndexMap::new(),
            property_defaults: IndexMap::new(),
            property_flags: IndexMap::new(),
            lazy_initializers: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn flags_for(&self, property: &str) -> PropertyFlags {
        self.property_flags.get(property).copied().unwrap_or_default()
    }
}

/// A class instance: class pointer plus field map.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceObj {
    pub class: HeapId,
    pub fields: IndexMap<String, Value>,
}

/// A struct type descriptor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructTypeObj {
    pub name: String,
    pub methods: IndexMap<String, Value>,
    pub static_methods: IndexMap<String, Value>,
    pub static_properties: IndexMap<String, Value>,
    pub mutating_methods: Vec<String>,
    pub computed: IndexMap<String, ComputedProperty>,
    pub property_defaults: IndexMap<String, Value>,
    pub property_flags: IndexMap<String, PropertyFlags>,
    pub lazy_initializers: IndexMap<String, Value>,
}

impl StructTypeObj {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            methods: IndexMap::new(),
            static_methods: IndexMap::new(),
            static_properties: IndexMap::new(),
            mutating_methods: Vec::new(),
            computed: IndexMap::new(),
            property_defaults: IndexMap::new(),
            property_flags: IndexMap::new(),
            lazy_initializers: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn is_mutating(&self, method: &str) -> bool {
        self.mutating_methods.iter().any(|m| m == method)
    }
}

/// A struct instance. Copied (deeply for nested struct values) on assignment
/// and argument pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructInstanceObj {
    pub struct_type: HeapId,
    pub fields: IndexMap<String, Value>,
}

/// One declared enum case: its raw value and associated-value labels.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnumCaseDescriptor {
    pub name: String,
    pub raw: Value,
    /// Labels in declaration order; `None` for `_`.
    pub assoc_labels: Vec<Option<String>>,
}

/// An enum type object: ordered case descriptors plus methods.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnumTypeObj {
    pub name: String,
    pub cases: Vec<EnumCaseDescriptor>,
    /// Case-name → prebuilt EnumCase object (payload-less cases) or
    /// constructor case (cases with associated values, empty payload).
    pub case_values: IndexMap<String, Value>,
    pub methods: IndexMap<String, Value>,
    pub static_methods: IndexMap<String, Value>,
    pub computed: IndexMap<String, ComputedProperty>,
    pub raw_type: Option<String>,
}

impl EnumTypeObj {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            cases: Vec::new(),
            case_values: IndexMap::new(),
            methods: IndexMap::new(),
            static_methods: IndexMap::new(),
            computed: IndexMap::new(),
            raw_type: None,
        }
    }

    #[must_use]
    pub fn descriptor(&self, case: &str) -> Option<&EnumCaseDescriptor> {
        self.cases.iter().find(|c| c.name == case)
    }
}

/// A single enum case value, possibly carrying an associated payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnumCaseObj {
    pub enum_type: HeapId,
    pub case_name: String,
    pub raw: Value,
    pub assoc_labels: Vec<Option<String>>,
    pub assoc_values: Vec<Value>,
}

/// A protocol object: named requirement lists.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProtocolObj {
    pub name: String,
    pub method_requirements: Vec<String>,
    pub property_requirements: Vec<String>,
    pub inherited: Vec<String>,
}

/// A wrapped host pointer. The handle is opaque to the VM; the registered
/// type info (see `native.rs`) interprets it. `owned_by_vm` decides whether
/// the release callback destroys the pointee or merely notifies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NativeObj {
    pub type_name: String,
    pub handle: u64,
    pub owned_by_vm: bool,
}

/// Every object variant the heap can hold.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeapData {
    Str(String),
    List(ListObj),
    Map(MapObj),
    Tuple(TupleObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    BoundMethod(BoundMethodObj),
    Class(ClassObj),
    Instance(InstanceObj),
    Struct(StructTypeObj),
    StructInstance(StructInstanceObj),
    Enum(EnumTypeObj),
    EnumCase(EnumCaseObj),
    Protocol(ProtocolObj),
    Native(NativeObj),
    BuiltinMethod(BuiltinMethodObj),
}

impl HeapData {
    /// Stable human-readable variant name for stats and diagnostics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "String",
            Self::List(_) => "List",
            Self::Map(_) => "Map",
            Self::Tuple(_) => "Tuple",
            Self::Function(_) => "Function",
            Self::Closure(_) => "Closure",
            Self::Upvalue(_) => "Upvalue",
            Self::BoundMethod(_) => "BoundMethod",
            Self::Class(_) => "Class",
            Self::Instance(_) => "Instance",
            Self::Struct(_) => "Struct",
            Self::StructInstance(_) => "StructInstance",
            Self::Enum(_) => "Enum",
            Self::EnumCase(_) => "EnumCase",
            Self::Protocol(_) => "Protocol",
            Self::Native(_) => "Native",
            Self::BuiltinMethod(_) => "BuiltinMethod",
        }
    }

    /// Tracked byte size: the variant header plus owned payload bytes.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        let payload = match self {
            Self::Str(s) => s.len(),
            Self::List(l) => l.elements.len() * std::mem::size_of::<Value>(),
            Self::Map(m) => m
                .entries
                .iter()
                .map(|(k, _)| k.len() + std::mem::size_of::<Value>())
                .sum(),
            Self::Tuple(t) => t.elements.len() * std::mem::size_of::<Value>(),
            Self::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapId>(),
            Self::Class(c) => {
                (c.methods.len() + c.static_methods.len() + c.property_defaults.len()) * std::mem::size_of::<Value>()
                    + c.name.len()
            }
            Self::Instance(i) => i
                .fields
                .iter()
                .map(|(k, _)| k.len() + std::mem::size_of::<Value>())
                .sum(),
            Self::Struct(s) => {
                (s.methods.len() + s.static_methods.len() + s.property_defaults.len()) * std::mem::size_of::<Value>()
                    + s.name.len()
            }
            Self::StructInstance(i) => i
                .fields
                .iter()
                .map(|(k, _)| k.len() + std::mem::size_of::<Value>())
                .sum(),
            Self::Enum(e) => e.cases.len() * std::mem::size_of::<EnumCaseDescriptor>() + e.name.len(),
            Self::EnumCase(c) => c.assoc_values.len() * std::mem::size_of::<Value>() + c.case_name.len(),
            Self::Protocol(p) => p.name.len() + p.method_requirements.len() + p.property_requirements.len(),
            Self::Native(n) => n.type_name.len(),
            Self::BuiltinMethod(b) => b.name.len(),
            Self::Function(_) | Self::Upvalue(_) | Self::BoundMethod(_) => 0,
        };
        base + payload
    }

    /// Collects the heap ids this object holds *strong* references to.
    /// Weak and unowned refs are skipped: they carry no count.
    pub fn collect_child_ids(&self, out: &mut Vec<HeapId>) {
        fn push_value(v: Value, out: &mut Vec<HeapId>) {
            if let Some(id) = v.strong_id() {
                out.push(id);
            }
        }

        match self {
            Self::Str(_) | Self::Function(_) | Self::Protocol(_) | Self::Native(_) => {}
            Self::List(l) => {
                for &v in &l.elements {
                    push_value(v, out);
                }
            }
            Self::Map(m) => {
                for (_, &v) in &m.entries {
                    push_value(v, out);
                }
            }
            Self::Tuple(t) => {
                for &v in &t.elements {
                    push_value(v, out);
                }
            }
            Self::Closure(c) => out.extend(c.upvalues.iter().copied()),
            Self::Upvalue(u) => {
                if let UpvalueObj::Closed(v) = u {
                    push_value(*v, out);
                }
            }
            Self::BoundMethod(b) => {
                push_value(b.receiver, out);
                push_value(b.method, out);
            }
            Self::Class(c) => {
                if let Some(superclass) = c.superclass {
                    out.push(superclass);
                }
                for (_, &v) in c.methods.iter().chain(&c.static_methods).chain(&c.static_properties) {
                    push_value(v, out);
                }
                for (_, &v) in c.property_defaults.iter().chain(&c.lazy_initializers) {
                    push_value(v, out);
                }
                for (_, accessor) in &c.computed {
                    push_value(accessor.getter, out);
                    if let Some(setter) = accessor.setter {
                        push_value(setter, out);
                    }
                }
                for (_, observers) in &c.observers {
                    if let Some(v) = observers.will_set {
                        push_value(v, out);
                    }
                    if let Some(v) = observers.did_set {
                        push_value(v, out);
                    }
                }
            }
            Self::Instance(i) => {
                out.push(i.class);
                for (_, &v) in &i.fields {
                    push_value(v, out);
                }
            }
            Self::Struct(s) => {
                for (_, &v) in s.methods.iter().chain(&s.static_methods).chain(&s.static_properties) {
                    push_value(v, out);
                }
                for (_, &v) in s.property_defaults.iter().chain(&s.lazy_initializers) {
                    push_value(v, out);
                }
                for (_, accessor) in &s.computed {
                    push_value(accessor.getter, out);
                    if let Some(setter) = accessor.setter {
                        push_value(setter, out);
                    }
                }
            }
            Self::StructInstance(i) => {
                out.push(i.struct_type);
                for (_, &v) in &i.fields {
                    push_value(v, out);
                }
            }
            Self::Enum(e) => {
                for case in &e.cases {
                    push_value(case.raw, out);
                }
                for (_, &v) in e.case_values.iter().chain(&e.methods).chain(&e.static_methods) {
                    push_value(v, out);
                }
                for (_, accessor) in &e.computed {
                    push_value(accessor.getter, out);
                    if let Some(setter) = accessor.setter {
                        push_value(setter, out);
                    }
                }
            }
            Self::EnumCase(c) => {
                out.push(c.enum_type);
                push_value(c.raw, out);
                for &v in &c.assoc_values {
                    push_value(v, out);
                }
            }
            Self::BuiltinMethod(b) => push_value(b.receiver, out),
        }
    }

    /// Type name used by `is` / `as` checks and diagnostics. For instances
    /// the heap resolves the class/struct/enum name instead.
    #[must_use]
    pub fn builtin_type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "String",
            Self::List(_) => "Array",
            Self::Map(_) => "Dictionary",
            Self::Tuple(_) => "Tuple",
            Self::Function(_) | Self::Closure(_) | Self::BoundMethod(_) | Self::BuiltinMethod(_) => "Function",
            other => other.variant_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::ObjRef;

    #[test]
    fn child_ids_skip_weak_refs() {
        let strong = Value::Obj(ObjRef::strong(HeapId::from_index(1)));
        let weak = Value::Obj(ObjRef {
            id: HeapId::from_index(2),
            kind: RefKind::Weak,
        });
        let mut instance = InstanceObj {
            class: HeapId::from_index(0),
            fields: IndexMap::new(),
        };
        instance.fields.insert("a".to_owned(), strong);
        instance.fields.insert("b".to_owned(), weak);

        let mut out = Vec::new();
        HeapData::Instance(instance).collect_child_ids(&mut out);
        assert_eq!(out, vec![HeapId::from_index(0), HeapId::from_index(1)]);
    }

    #[test]
    fn tuple_label_lookup() {
        let tuple = TupleObj {
            labels: vec![Some("x".to_owned()), None],
            elements: vec![Value::Int(1), Value::Int(2)],
        };
        assert_eq!(tuple.label_index("x"), Some(0));
        assert_eq!(tuple.label_index("y"), None);
    }
}
