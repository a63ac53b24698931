//! The compiled artifact.
//!
//! An [`Assembly`] is self-contained: top-level code, the constant and string
//! pools, function prototypes, protocol descriptors, the metadata tables that
//! drive reflection / `is` / `as` / static-property resolution, and the
//! method bodies. Produced by the compiler, read-only afterwards.
//!
//! The on-disk format is magic bytes + format version + a postcard-encoded
//! body; a magic or version mismatch is an [`AssemblyFormatError`].

use crate::{
    error::AssemblyFormatError,
    intern::{StringId, StringTable},
    value::Value,
};

/// Magic bytes opening a serialized assembly.
pub const ASSEMBLY_MAGIC: [u8; 4] = *b"SSBC";
/// Bumped on any layout change; no backwards compatibility is attempted.
pub const ASSEMBLY_VERSION: u16 = 1;

/// A contiguous block of bytecode with per-byte line info.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// Parallel to `code`: source line for each byte offset.
    pub line_info: Vec<u32>,
    pub max_stack_depth: u16,
}

impl Chunk {
    /// Source line for a byte offset, 0 when out of range.
    #[must_use]
    pub fn line_at(&self, offset: usize) -> u32 {
        self.line_info.get(offset).copied().unwrap_or(0)
    }
}

/// Descriptor for one captured upvalue: where the value lives at capture
/// time (enclosing local slot or enclosing upvalue index).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct UpvalueDescriptor {
    pub index: u16,
    pub is_local: bool,
}

/// A compile-time default value for a parameter: literal constants or their
/// unary negation, folded at compile time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DefaultValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A compiled function.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionPrototype {
    pub name: String,
    /// Internal parameter names, in order. Includes the implicit `self`
    /// receiver as parameter 0 when `has_receiver` is set.
    pub param_names: Vec<String>,
    /// External labels callers use; `None` marks positional-only.
    pub param_labels: Vec<Option<String>>,
    /// Per-parameter default descriptors, materialized at call time.
    pub defaults: Vec<Option<DefaultValue>>,
    pub has_receiver: bool,
    pub is_initializer: bool,
    pub is_override: bool,
    pub upvalues: Vec<UpvalueDescriptor>,
    /// Index into [`Assembly::method_bodies`].
    pub chunk: u16,
}

impl FunctionPrototype {
    /// Declared arity, excluding the implicit receiver.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.param_names.len() - usize::from(self.has_receiver)
    }
}

/// A protocol descriptor carried into the runtime for conformance queries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProtocolDef {
    pub name: String,
    pub method_requirements: Vec<String>,
    pub property_requirements: Vec<String>,
    pub inherited: Vec<String>,
}

/// Flags on [`TypeDef`].
pub mod type_flags {
    pub const CLASS: u32 = 1;
    pub const STRUCT: u32 = 1 << 1;
    pub const ENUM: u32 = 1 << 2;
    pub const INTERFACE: u32 = 1 << 3;
    pub const PUBLIC: u32 = 1 << 4;
    pub const PRIVATE: u32 = 1 << 5;
}

/// Flags on [`MethodDef`].
pub mod method_flags {
    pub const STATIC: u32 = 1;
    pub const VIRTUAL: u32 = 1 << 1;
    pub const MUTATING: u32 = 1 << 2;
    pub const OVERRIDE: u32 = 1 << 3;
    pub const INITIALIZER: u32 = 1 << 4;
}

/// Flags on [`FieldDef`] and [`PropertyDef`].
pub mod field_flags {
    pub const STATIC: u32 = 1;
    pub const LET: u32 = 1 << 1;
    pub const LAZY: u32 = 1 << 2;
    pub const WEAK: u32 = 1 << 3;
    pub const UNOWNED: u32 = 1 << 4;
    pub const PRIVATE: u32 = 1 << 5;
}

/// Sentinel for "no index" in `u16` metadata fields.
pub const NO_INDEX: u16 = u16::MAX;

/// Half-open range view into one of the definition tables.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct TableSlice {
    pub start: u32,
    pub end: u32,
}

impl TableSlice {
    #[must_use]
    pub fn range(self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Record for one declared type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TypeDef {
    pub name: StringId,
    pub flags: u32,
    /// Base type name, [`StringId::NONE`] when absent.
    pub base: StringId,
    pub interfaces: Vec<StringId>,
    pub fields: TableSlice,
    pub methods: TableSlice,
    pub properties: TableSlice,
}

/// Record for one method: packed signature offset plus body index.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MethodDef {
    pub name: StringId,
    pub flags: u32,
    /// Word offset into [`Assembly::signature_blob`].
    pub signature_offset: u32,
    /// Index into [`Assembly::method_bodies`], [`NO_INDEX`] for
    /// requirement-only entries.
    pub body_index: u16,
}

/// Record for one stored field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldDef {
    pub name: StringId,
    pub flags: u32,
    /// Index into [`Assembly::type_names`].
    pub type_id: u32,
}

/// Record for one computed property.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PropertyDef {
    pub name: StringId,
    pub flags: u32,
    pub type_id: u32,
    /// Method-definition indices, [`NO_INDEX`] when absent.
    pub getter: u16,
    pub setter: u16,
}

/// The compiled artifact. See the module docs for the serialized framing.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Assembly {
    /// Top-level instructions.
    pub code: Chunk,
    /// Numeric and boolean literal pool.
    pub constants: Vec<Value>,
    /// Deduplicated UTF-8 pool.
    pub strings: StringTable,
    pub functions: Vec<FunctionPrototype>,
    pub protocols: Vec<ProtocolDef>,
    pub type_definitions: Vec<TypeDef>,
    pub method_definitions: Vec<MethodDef>,
    pub field_definitions: Vec<FieldDef>,
    pub property_definitions: Vec<PropertyDef>,
    /// Packed signatures: `param_count, return_type_id, param_type_id...`
    /// per entry, addressed by word offset.
    pub signature_blob: Vec<u32>,
    /// Interned type names; `type_id` fields index this list.
    pub type_names: Vec<StringId>,
    /// One chunk per compiled function body.
    pub method_bodies: Vec<Chunk>,
    /// Metadata-named entry body; execution starts there when present,
    /// otherwise at the top-level code.
    pub entry_body: Option<u16>,
}

impl Assembly {
    /// Resolves a string id against the pool.
    #[must_use]
    pub fn string(&self, id: StringId) -> &str {
        self.strings.get(id)
    }

    /// The chunk a body index refers to.
    #[must_use]
    pub fn body(&self, index: u16) -> &Chunk {
        &self.method_bodies[usize::from(index)]
    }

    /// Reads one packed signature from the blob.
    #[must_use]
    pub fn signature_at(&self, offset: u32) -> Option<(u32, &[u32])> {
        let offset = offset as usize;
        let param_count = *self.signature_blob.get(offset)? as usize;
        let ret = *self.signature_blob.get(offset + 1)?;
        let params = self.signature_blob.get(offset + 2..offset + 2 + param_count)?;
        Some((ret, params))
    }

    /// Looks up a type definition by name.
    #[must_use]
    pub fn find_type_def(&self, name: &str) -> Option<&TypeDef> {
        self.type_definitions
            .iter()
            .find(|def| self.strings.get_checked(def.name) == Some(name))
    }

    /// Serializes to the on-disk format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = postcard::to_allocvec(self).expect("assembly serialization cannot fail");
        let mut out = Vec::with_capacity(body.len() + 6);
        out.extend_from_slice(&ASSEMBLY_MAGIC);
        out.extend_from_slice(&ASSEMBLY_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Deserializes from the on-disk format, validating magic and version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AssemblyFormatError> {
        if bytes.len() < 6 {
            return Err(AssemblyFormatError {
                message: "truncated assembly header".to_owned(),
            });
        }
        if bytes[..4] != ASSEMBLY_MAGIC {
            return Err(AssemblyFormatError {
                message: "bad magic bytes; not a SwiftScript assembly".to_owned(),
            });
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != ASSEMBLY_VERSION {
            return Err(AssemblyFormatError {
                message: format!("unsupported assembly version {version} (expected {ASSEMBLY_VERSION})"),
            });
        }
        let mut assembly: Self = postcard::from_bytes(&bytes[6..]).map_err(|err| AssemblyFormatError {
            message: format!("malformed assembly body: {err}"),
        })?;
        assembly.strings.rebuild_index();
        Ok(assembly)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip_serialization() {
        let mut assembly = Assembly::default();
        assembly.constants.push(Value::Int(42));
        let id = assembly.strings.intern("main").unwrap();
        assembly.code.code = vec![0, 1, 2];
        assembly.code.line_info = vec![1, 1, 1];
        assembly.type_names.push(id);

        let bytes = assembly.to_bytes();
        let restored = Assembly::from_bytes(&bytes).expect("round trip");
        assert_eq!(restored.constants, vec![Value::Int(42)]);
        assert_eq!(restored.code.code, vec![0, 1, 2]);
        assert_eq!(restored.strings.lookup("main"), Some(id));
    }

    #[test]
    fn bad_magic_is_io_error_class() {
        let err = Assembly::from_bytes(b"NOPE\x01\x00rest").expect_err("must fail");
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn version_mismatch_detected() {
        let assembly = Assembly::default();
        let mut bytes = assembly.to_bytes();
        bytes[4] = 0xFF;
        let err = Assembly::from_bytes(&bytes).expect_err("must fail");
        assert!(err.message.contains("version"));
    }

    #[test]
    fn signature_blob_addressing() {
        let mut assembly = Assembly::default();
        // (param_count=2, return=7, params=[3, 4])
        assembly.signature_blob = vec![2, 7, 3, 4];
        let (ret, params) = assembly.signature_at(0).expect("valid");
        assert_eq!(ret, 7);
        assert_eq!(params, &[3, 4]);
    }
}
