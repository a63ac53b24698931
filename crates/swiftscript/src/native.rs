//! Host-function registry and wrapped native pointers.
//!
//! Embedders register named functions callable from script and type
//! descriptors for opaque pointers they hand the VM. Host functions exchange
//! [`HostValue`]s — the owned primitive union of the embedding contract
//! (nil / bool / int / float / string) — so the host side never touches the
//! heap. Ownership of a wrapped pointer is explicit: `VmOwned` pointers have
//! their release callback run as a destructor on last release; `EngineOwned`
//! pointers only get a notification and are never freed by the VM.

use ahash::AHashMap;

use crate::error::RuntimeError;

/// Value union crossing the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HostValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "Void",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::Str(_) => "String",
        }
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// A host function: receives converted arguments, returns a value or a
/// runtime error that unwinds script execution.
pub type NativeFn = Box<dyn FnMut(&[HostValue]) -> Result<HostValue, RuntimeError>>;

/// Who owns the pointee of a wrapped native pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOwnership {
    /// The VM runs `release` as a destructor on last release.
    VmOwned,
    /// The engine keeps ownership; `release` is only a notification.
    EngineOwned,
}

/// Callbacks describing a native type to the VM.
pub struct NativeTypeInfo {
    pub type_name: String,
    /// Property getter: `(handle, property_name)` → value.
    pub get_property: Option<Box<dyn Fn(u64, &str) -> Option<HostValue>>>,
    /// Invoked when the last strong reference to a wrapped pointer drops.
    pub release: Option<Box<dyn FnMut(u64)>>,
}

impl std::fmt::Debug for NativeTypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTypeInfo")
            .field("type_name", &self.type_name)
            .field("has_get_property", &self.get_property.is_some())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Registry of host functions and native type descriptors. One per
/// [`crate::run::Script`]; registration happens outside execution.
#[derive(Default)]
pub struct NativeRegistry {
    functions: AHashMap<String, NativeFn>,
    types: AHashMap<String, NativeTypeInfo>,
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NativeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, name: impl Into<String>, function: NativeFn) {
        self.functions.insert(name.into(), function);
    }

    /// Removes a registered function; returns whether it existed.
    pub fn unregister_function(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&mut self, name: &str, args: &[HostValue]) -> Result<HostValue, RuntimeError> {
        match self.functions.get_mut(name) {
            Some(function) => function(args),
            None => Err(RuntimeError::new(format!("Unknown native function '{name}'"))),
        }
    }

    pub fn register_type(&mut self, info: NativeTypeInfo) {
        self.types.insert(info.type_name.clone(), info);
    }

    #[must_use]
    pub fn type_info(&self, type_name: &str) -> Option<&NativeTypeInfo> {
        self.types.get(type_name)
    }

    /// Runs the release callback for a dying wrapped pointer.
    pub fn release_native(&mut self, type_name: &str, handle: u64) {
        if let Some(info) = self.types.get_mut(type_name) {
            if let Some(release) = info.release.as_mut() {
                release(handle);
            }
        }
    }

    /// Reads a property off a wrapped pointer through its type info.
    #[must_use]
    pub fn native_property(&self, type_name: &str, handle: u64, property: &str) -> Option<HostValue> {
        self.types
            .get(type_name)
            .and_then(|info| info.get_property.as_ref())
            .and_then(|getter| getter(handle, property))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn registered_function_is_callable() {
        let mut registry = NativeRegistry::new();
        registry.register_function(
            "add_ints",
            Box::new(|args| match args {
                [HostValue::Int(a), HostValue::Int(b)] => Ok(HostValue::Int(a.wrapping_add(*b))),
                _ => Err(RuntimeError::new("add_ints requires two Ints")),
            }),
        );
        let result = registry
            .call("add_ints", &[HostValue::Int(2), HostValue::Int(3)])
            .unwrap();
        assert_eq!(result, HostValue::Int(5));
        assert!(registry.unregister_function("add_ints"));
        assert!(registry.call("add_ints", &[]).is_err());
    }

    #[test]
    fn release_callback_fires() {
        use std::{cell::RefCell, rc::Rc};
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        let mut registry = NativeRegistry::new();
        registry.register_type(NativeTypeInfo {
            type_name: "Widget".to_owned(),
            get_property: None,
            release: Some(Box::new(move |handle| sink.borrow_mut().push(handle))),
        });
        registry.release_native("Widget", 7);
        assert_eq!(*released.borrow(), vec![7]);
    }

    #[test]
    fn native_property_reads_through_type_info() {
        let mut registry = NativeRegistry::new();
        registry.register_type(NativeTypeInfo {
            type_name: "Counter".to_owned(),
            get_property: Some(Box::new(|handle, name| match name {
                "value" => Some(HostValue::Int(handle as i64)),
                _ => None,
            })),
            release: None,
        });
        assert_eq!(registry.native_property("Counter", 5, "value"), Some(HostValue::Int(5)));
        assert_eq!(registry.native_property("Counter", 5, "missing"), None);
    }
}
