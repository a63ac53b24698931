//! Import resolution.
//!
//! `import "path"` keys are deduplicated per compile and cycle-checked via an
//! in-progress set. Bytes come from an injected [`ModuleResolver`]; without
//! one, the key is a filesystem path relative to a base directory, with `.ss`
//! appended when absent.
//!
//! Each imported module is lexed and parsed independently; its statements are
//! spliced ahead of the importing module's statements so declaration
//! collection sees cross-module symbols. The compiler later synthesizes a
//! namespace map per imported unit (file-stem → public function exports).

use std::path::{Path, PathBuf};

use ahash::AHashSet;

use crate::{
    ast::Stmt,
    error::{RuntimeError, ScriptError},
    lexer::Lexer,
    parse,
};

/// Source provider for import keys.
pub trait ModuleResolver {
    /// Returns `(full_path, source_text)` for the key, or an error message.
    fn resolve_and_load(&mut self, key: &str) -> Result<(String, String), String>;
}

/// Default resolver: keys are paths relative to a base directory; `.ss` is
/// appended when the key has no extension.
#[derive(Debug, Clone)]
pub struct FileResolver {
    base_dir: PathBuf,
}

impl FileResolver {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl ModuleResolver for FileResolver {
    fn resolve_and_load(&mut self, key: &str) -> Result<(String, String), String> {
        let mut path = self.base_dir.join(key);
        if path.extension().is_none() {
            path.set_extension("ss");
        }
        let source = std::fs::read_to_string(&path).map_err(|err| format!("cannot read module '{key}': {err}"))?;
        Ok((path.to_string_lossy().into_owned(), source))
    }
}

/// In-memory resolver for tests and embedding.
#[derive(Debug, Default)]
pub struct MapResolver {
    modules: ahash::AHashMap<String, String>,
}

impl MapResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, source: impl Into<String>) {
        self.modules.insert(key.into(), source.into());
    }
}

impl ModuleResolver for MapResolver {
    fn resolve_and_load(&mut self, key: &str) -> Result<(String, String), String> {
        self.modules
            .get(key)
            .map(|source| (key.to_owned(), source.clone()))
            .ok_or_else(|| format!("module '{key}' not found"))
    }
}

/// One parsed compilation unit. `stem` is `None` for the root module.
#[derive(Debug)]
pub struct ModuleUnit {
    pub key: Option<String>,
    pub stem: Option<String>,
    pub statements: Vec<Stmt>,
}

/// Loads a program and its transitive imports into an ordered unit list:
/// dependencies first, the root module last.
pub struct ModuleLoader<'r> {
    resolver: &'r mut dyn ModuleResolver,
    loaded: AHashSet<String>,
    in_progress: AHashSet<String>,
}

impl<'r> ModuleLoader<'r> {
    pub fn new(resolver: &'r mut dyn ModuleResolver) -> Self {
        Self {
            resolver,
            loaded: AHashSet::new(),
            in_progress: AHashSet::new(),
        }
    }

    /// Expands the root program. Imports are removed from the statement
    /// lists; the returned units are in dependency-first order.
    pub fn expand(&mut self, root: Vec<Stmt>) -> Result<Vec<ModuleUnit>, ScriptError> {
        let mut units = Vec::new();
        let statements = self.expand_statements(root, &mut units)?;
        units.push(ModuleUnit {
            key: None,
            stem: None,
            statements,
        });
        Ok(units)
    }

    fn expand_statements(&mut self, statements: Vec<Stmt>, units: &mut Vec<ModuleUnit>) -> Result<Vec<Stmt>, ScriptError> {
        let mut remaining = Vec::with_capacity(statements.len());
        for stmt in statements {
            if let Stmt::Import { path, line } = &stmt {
                self.load_module(path, *line, units)?;
            } else {
                remaining.push(stmt);
            }
        }
        Ok(remaining)
    }

    fn load_module(&mut self, key: &str, line: u32, units: &mut Vec<ModuleUnit>) -> Result<(), ScriptError> {
        if self.loaded.contains(key) {
            return Ok(());
        }
        if self.in_progress.contains(key) {
            let mut error = RuntimeError::new(format!("Circular import detected: '{key}'"));
            error.line = line;
            return Err(ScriptError::Runtime(error));
        }
        self.in_progress.insert(key.to_owned());

        let (full_path, source) = self.resolver.resolve_and_load(key).map_err(|message| {
            let mut error = RuntimeError::new(message);
            error.line = line;
            ScriptError::Runtime(error)
        })?;

        let tokens = Lexer::new(&source).tokenize_all();
        let parsed = parse::parse(tokens)?;
        let statements = self.expand_statements(parsed, units)?;

        self.in_progress.remove(key);
        self.loaded.insert(key.to_owned());

        units.push(ModuleUnit {
            key: Some(key.to_owned()),
            stem: Some(file_stem(&full_path)),
            statements,
        });
        Ok(())
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map_or_else(|| path.to_owned(), |stem| stem.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_root(source: &str) -> Vec<Stmt> {
        parse::parse(Lexer::new(source).tokenize_all()).expect("parse failed")
    }

    #[test]
    fn imports_splice_before_root() {
        let mut resolver = MapResolver::new();
        resolver.insert("util", "func helper() -> Int { return 1 }");
        let root = parse_root("import \"util\"\nprint(helper())");
        let mut loader = ModuleLoader::new(&mut resolver);
        let units = loader.expand(root).expect("expansion succeeds");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].stem.as_deref(), Some("util"));
        assert!(units[1].stem.is_none());
    }

    #[test]
    fn duplicate_imports_load_once() {
        let mut resolver = MapResolver::new();
        resolver.insert("a", "func fa() -> Int { return 1 }");
        resolver.insert("b", "import \"a\"\nfunc fb() -> Int { return 2 }");
        let root = parse_root("import \"a\"\nimport \"b\"\nprint(1)");
        let mut loader = ModuleLoader::new(&mut resolver);
        let units = loader.expand(root).expect("expansion succeeds");
        // a, b, root — a only once.
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].stem.as_deref(), Some("a"));
        assert_eq!(units[1].stem.as_deref(), Some("b"));
    }

    #[test]
    fn cycles_are_detected() {
        let mut resolver = MapResolver::new();
        resolver.insert("x", "import \"y\"");
        resolver.insert("y", "import \"x\"");
        let root = parse_root("import \"x\"");
        let mut loader = ModuleLoader::new(&mut resolver);
        let err = loader.expand(root).expect_err("cycle must fail");
        assert!(err.to_string().contains("Circular import"));
    }

    #[test]
    fn missing_module_reports_key() {
        let mut resolver = MapResolver::new();
        let root = parse_root("import \"ghost\"");
        let mut loader = ModuleLoader::new(&mut resolver);
        let err = loader.expand(root).expect_err("missing module");
        assert!(err.to_string().contains("ghost"));
    }
}
