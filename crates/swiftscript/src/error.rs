//! Error families for the compile pipeline and the VM.
//!
//! Lex failures are reported as error tokens and surfaced by the parser as
//! [`ParseError`], so the taxonomy visible to embedders is: parse, type-check,
//! compiler, runtime, and assembly-format errors. [`ScriptError`] is the
//! umbrella the embedding API returns, with a stable [`ResultCode`] mapping.

use std::fmt;

/// A syntactic violation. Parsing stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError [{}:{}]: {}", self.line, self.column, self.message)
    }
}

/// Severity of a single analyzer diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// One analyzer finding, tagged with the source line it refers to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag} [line {}]: {}", self.line, self.message)
    }
}

/// Aggregated type-check failure: every error found across the whole program,
/// raised once after all statements have been checked.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeCheckError {
    pub diagnostics: Vec<Diagnostic>,
}

impl TypeCheckError {
    /// Line of the first error, for embedders that report a single location.
    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.diagnostics.first().map_or(0, |d| d.line)
    }
}

impl fmt::Display for TypeCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TypeCheckError: {} error(s)", self.diagnostics.len())?;
        for diag in &self.diagnostics {
            writeln!(f, "  {diag}")?;
        }
        Ok(())
    }
}

/// Structural failure while emitting bytecode: capacity overflow (u16 operand
/// space), a jump out of i16 range, or an AST shape the analyzer should have
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompilerError {
    pub message: String,
    pub line: u32,
}

impl CompilerError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompilerError [line {}]: {}", self.line, self.message)
    }
}

/// Execution failure. Unwinds the frame stack back to `execute()`, carrying
/// the source line of the faulting instruction and the call stack at the
/// point of failure (innermost last).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub call_stack: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            call_stack: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuntimeError [line {}]: {}", self.line, self.message)?;
        for frame in self.call_stack.iter().rev() {
            write!(f, "\n  in {frame}")?;
        }
        Ok(())
    }
}

/// A malformed or version-mismatched serialized assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyFormatError {
    pub message: String,
}

impl fmt::Display for AssemblyFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssemblyFormatError: {}", self.message)
    }
}

/// Result codes of the embedding contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    CompileError,
    RuntimeError,
    InvalidArg,
    NotFound,
    OutOfMemory,
    IoError,
    TypeCheckError,
}

/// Umbrella error for the embedding API ([`crate::run::Script`]).
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptError {
    Parse(ParseError),
    TypeCheck(TypeCheckError),
    Compile(CompilerError),
    Runtime(RuntimeError),
    Format(AssemblyFormatError),
    NotFound(String),
    InvalidArg(String),
}

impl ScriptError {
    /// Stable integer-result-code classification for binding layers.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Parse(_) | Self::Compile(_) => ResultCode::CompileError,
            Self::TypeCheck(_) => ResultCode::TypeCheckError,
            Self::Runtime(_) => ResultCode::RuntimeError,
            Self::Format(_) => ResultCode::IoError,
            Self::NotFound(_) => ResultCode::NotFound,
            Self::InvalidArg(_) => ResultCode::InvalidArg,
        }
    }

    /// Source line of the failure, when one is known.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::Parse(e) => Some(e.line),
            Self::TypeCheck(e) => Some(e.first_line()),
            Self::Compile(e) => Some(e.line),
            Self::Runtime(e) => Some(e.line),
            Self::Format(_) | Self::NotFound(_) | Self::InvalidArg(_) => None,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => e.fmt(f),
            Self::TypeCheck(e) => e.fmt(f),
            Self::Compile(e) => e.fmt(f),
            Self::Runtime(e) => e.fmt(f),
            Self::Format(e) => e.fmt(f),
            Self::NotFound(name) => write!(f, "not found: {name}"),
            Self::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<ParseError> for ScriptError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<TypeCheckError> for ScriptError {
    fn from(e: TypeCheckError) -> Self {
        Self::TypeCheck(e)
    }
}

impl From<CompilerError> for ScriptError {
    fn from(e: CompilerError) -> Self {
        Self::Compile(e)
    }
}

impl From<RuntimeError> for ScriptError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<AssemblyFormatError> for ScriptError {
    fn from(e: AssemblyFormatError) -> Self {
        Self::Format(e)
    }
}
