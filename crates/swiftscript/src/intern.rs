//! Deduplicated string pool for compiled assemblies.
//!
//! Bytecode operands reference strings by [`StringId`], a `u16` index into the
//! pool. The pool is append-only during compilation and read-only afterwards.

use ahash::AHashMap;

use crate::error::CompilerError;

/// Index into an assembly's string pool. Fits the `u16` operand space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StringId(pub u16);

impl StringId {
    /// Sentinel used in operand streams for "no string" (e.g. positional
    /// arguments in `CALL_NAMED`, `_` associated-value labels).
    pub const NONE: Self = Self(u16::MAX);

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == u16::MAX
    }
}

/// Append-only deduplicated UTF-8 pool.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct StringTable {
    strings: Vec<String>,
    #[serde(skip)]
    index: AHashMap<String, StringId>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its id. The id space is capped one below
    /// `u16::MAX` so [`StringId::NONE`] stays unambiguous.
    pub fn intern(&mut self, s: &str) -> Result<StringId, CompilerError> {
        if let Some(&id) = self.index.get(s) {
            return Ok(id);
        }
        let next = self.strings.len();
        if next >= usize::from(u16::MAX) {
            return Err(CompilerError::new("string pool exceeds 65534 entries", 0));
        }
        let id = StringId(next as u16);
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        Ok(id)
    }

    /// Looks up an already-interned string without inserting.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.index.get(s).copied()
    }

    /// # Panics
    /// Panics when the id is out of range, which indicates corrupt bytecode.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn get_checked(&self, id: StringId) -> Option<&str> {
        self.strings.get(id.index()).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Rebuilds the lookup index after deserialization (the index is not
    /// serialized; the string vector is authoritative).
    pub fn rebuild_index(&mut self) {
        self.index = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), StringId(i as u16)))
            .collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringId, &str)> {
        self.strings.iter().enumerate().map(|(i, s)| (StringId(i as u16), s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut table = StringTable::new();
        let a = table.intern("count").unwrap();
        let b = table.intern("append").unwrap();
        let c = table.intern("count").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), "count");
    }

    #[test]
    fn index_survives_rebuild() {
        let mut table = StringTable::new();
        let id = table.intern("main").unwrap();
        table.rebuild_index();
        assert_eq!(table.lookup("main"), Some(id));
    }
}
