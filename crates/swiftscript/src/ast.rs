//! Abstract syntax tree.
//!
//! Produced by the parser, annotated in place by the analyzer (name mangling
//! for generic specializations happens on `TypeAnnotation.name`), consumed by
//! the compiler. Every node carries the source line it started on.

use crate::value::RefKind;

/// Access control level. Only the private / non-private distinction is
/// enforced; the remaining levels are recorded and treated as internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessLevel {
    Public,
    Internal,
    Fileprivate,
    Private,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Internal
    }
}

impl AccessLevel {
    #[must_use]
    pub fn is_private(self) -> bool {
        self == Self::Private
    }
}

/// A (possibly generic, possibly optional, possibly function-typed) type
/// reference as written in source. The analyzer rewrites `name` to the
/// mangled form for generic specializations (`Box<Int>` → `Box_Int`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypeAnnotation {
    pub name: String,
    pub generic_args: Vec<TypeAnnotation>,
    pub is_optional: bool,
    pub function: Option<FunctionTypeAnnotation>,
    pub line: u32,
}

impl TypeAnnotation {
    #[must_use]
    pub fn named(name: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            generic_args: Vec::new(),
            is_optional: false,
            function: None,
            line,
        }
    }
}

/// Parameter/return shape for function-typed annotations like
/// `(Int, String) -> Bool`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionTypeAnnotation {
    pub params: Vec<TypeAnnotation>,
    pub ret: Box<TypeAnnotation>,
}

/// Mangles a generic application to its specialized type name:
/// `Stack<Int>` → `Stack_Int`, `Pair<Int, Box<Bool>>` → `Pair_Int_Box_Bool`.
/// The analyzer and the compiler use the same scheme for lookup.
#[must_use]
pub fn mangle_generic(base: &str, args: &[TypeAnnotation]) -> String {
    let mut name = base.to_owned();
    for arg in args {
        name.push('_');
        if arg.generic_args.is_empty() {
            name.push_str(&arg.name);
        } else {
            name.push_str(&mangle_generic(&arg.name, &arg.generic_args));
        }
    }
    name
}

/// An attribute application preceding a declaration: `[Range(0, 100)]`.
/// Recorded by the parser, validated by the analyzer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AttributeUse {
    pub name: String,
    pub args: Vec<Expr>,
    pub line: u32,
}

// ---- Expressions ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    BitAnd,
    BitOr,
    BitXor,
    LeftShift,
    RightShift,
    NilCoalesce,
}

impl BinaryOp {
    /// Source spelling, used for operator-overload method lookup.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::LogicalAnd => "&&",
            Self::LogicalOr => "||",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::LeftShift => "<<",
            Self::RightShift => ">>",
            Self::NilCoalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CastKind {
    /// `as` — static coercion, checked by the analyzer.
    Plain,
    /// `as?` — yields an optional, nil on failure.
    Optional,
    /// `as!` — runtime error on failure.
    Forced,
}

/// One call argument, optionally labeled.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallArg {
    pub label: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    IntLiteral {
        value: i64,
        line: u32,
    },
    FloatLiteral {
        value: f64,
        line: u32,
    },
    /// Escapes already decoded.
    StringLiteral {
        value: String,
        line: u32,
    },
    BoolLiteral {
        value: bool,
        line: u32,
    },
    NilLiteral {
        line: u32,
    },
    Identifier {
        name: String,
        line: u32,
    },
    SelfExpr {
        line: u32,
    },
    SuperExpr {
        line: u32,
    },
    /// `.case` / `.case(args)` with the enum type inferred from context.
    ImplicitMember {
        name: String,
        line: u32,
    },
    /// `Name<T1, ...>` in expression position (constructor or static member
    /// access on a generic specialization). The analyzer instantiates the
    /// template and rewrites this to the mangled specialized name.
    GenericSpecialization {
        base: String,
        args: Vec<TypeAnnotation>,
        line: u32,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: u32,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        line: u32,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        line: u32,
    },
    CompoundAssign {
        op: BinaryOp,
        target: Box<Expr>,
        value: Box<Expr>,
        line: u32,
    },
    Ternary {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
        line: u32,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<CallArg>,
        line: u32,
    },
    Member {
        object: Box<Expr>,
        name: String,
        line: u32,
    },
    /// `object?.name`
    OptionalMember {
        object: Box<Expr>,
        name: String,
        line: u32,
    },
    /// `tuple.0`
    TupleIndex {
        object: Box<Expr>,
        index: u16,
        line: u32,
    },
    /// postfix `!`
    ForceUnwrap {
        operand: Box<Expr>,
        line: u32,
    },
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
        line: u32,
    },
    ArrayLiteral {
        elements: Vec<Expr>,
        line: u32,
    },
    DictLiteral {
        entries: Vec<(Expr, Expr)>,
        line: u32,
    },
    TupleLiteral {
        elements: Vec<(Option<String>, Expr)>,
        line: u32,
    },
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
        line: u32,
    },
    Closure {
        params: Vec<Param>,
        return_type: Option<TypeAnnotation>,
        body: Vec<Stmt>,
        line: u32,
    },
    /// `value is Type`
    TypeCheck {
        value: Box<Expr>,
        target: TypeAnnotation,
        line: u32,
    },
    /// `value as Type` / `as?` / `as!`
    TypeCast {
        value: Box<Expr>,
        target: TypeAnnotation,
        kind: CastKind,
        line: u32,
    },
    /// `readLine()` and other zero-argument engine builtins appear as plain
    /// calls; no dedicated node.
    Grouping {
        inner: Box<Expr>,
        line: u32,
    },
}

impl Expr {
    #[must_use]
    pub fn line(&self) -> u32 {
        match self {
            Self::IntLiteral { line, .. }
            | Self::FloatLiteral { line, .. }
            | Self::StringLiteral { line, .. }
            | Self::BoolLiteral { line, .. }
            | Self::NilLiteral { line }
            | Self::Identifier { line, .. }
            | Self::SelfExpr { line }
            | Self::SuperExpr { line }
            | Self::ImplicitMember { line, .. }
            | Self::GenericSpecialization { line, .. }
            | Self::Binary { line, .. }
            | Self::Unary { line, .. }
            | Self::Assign { line, .. }
            | Self::CompoundAssign { line, .. }
            | Self::Ternary { line, .. }
            | Self::Call { line, .. }
            | Self::Member { line, .. }
            | Self::OptionalMember { line, .. }
            | Self::TupleIndex { line, .. }
            | Self::ForceUnwrap { line, .. }
            | Self::Subscript { line, .. }
            | Self::ArrayLiteral { line, .. }
            | Self::DictLiteral { line, .. }
            | Self::TupleLiteral { line, .. }
            | Self::Range { line, .. }
            | Self::Closure { line, .. }
            | Self::TypeCheck { line, .. }
            | Self::TypeCast { line, .. }
            | Self::Grouping { line, .. } => *line,
        }
    }
}

// ---- Declarations ----

/// A function/method/initializer parameter. `label` is the external argument
/// label (`None` means same as `name`; `Some("_")` is parsed away to `None`
/// with `label_omitted` set).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub label: Option<String>,
    pub name: String,
    pub type_annotation: Option<TypeAnnotation>,
    pub default_value: Option<Expr>,
    pub label_omitted: bool,
}

impl Param {
    /// The label callers must use, or `None` when positional (`_`).
    #[must_use]
    pub fn external_label(&self) -> Option<&str> {
        if self.label_omitted {
            None
        } else {
            Some(self.label.as_deref().unwrap_or(&self.name))
        }
    }
}

/// `T: Protocol` constraint from a `where` clause or inline bound.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WhereClause {
    pub param: String,
    pub constraint: String,
    pub line: u32,
}

/// A `var` / `let` declaration, stored or computed, with observers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub is_let: bool,
    pub is_static: bool,
    pub is_lazy: bool,
    pub ref_kind: RefKind,
    pub access: AccessLevel,
    pub type_annotation: Option<TypeAnnotation>,
    pub initializer: Option<Expr>,
    /// Computed property accessors.
    pub getter: Option<Vec<Stmt>>,
    pub setter: Option<AccessorBody>,
    /// Property observers.
    pub will_set: Option<AccessorBody>,
    pub did_set: Option<AccessorBody>,
    pub attributes: Vec<AttributeUse>,
    pub line: u32,
}

impl VarDecl {
    #[must_use]
    pub fn is_computed(&self) -> bool {
        self.getter.is_some()
    }

    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.will_set.is_some() || self.did_set.is_some()
    }
}

/// A `set(name) { ... }` / `willSet(name) { ... }` body with its optional
/// custom parameter name (defaults: `newValue` / `oldValue`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AccessorBody {
    pub param: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeAnnotation>,
    pub body: Vec<Stmt>,
    pub is_static: bool,
    pub is_mutating: bool,
    pub is_override: bool,
    pub throws: bool,
    pub access: AccessLevel,
    pub generic_params: Vec<String>,
    pub where_clauses: Vec<WhereClause>,
    pub attributes: Vec<AttributeUse>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassDecl {
    pub name: String,
    /// Superclass and/or protocol names after `:`, in source order; the
    /// analyzer splits them.
    pub inheritance: Vec<String>,
    pub properties: Vec<VarDecl>,
    pub methods: Vec<FuncDecl>,
    pub initializers: Vec<FuncDecl>,
    pub deinitializer: Option<Vec<Stmt>>,
    pub access: AccessLevel,
    pub generic_params: Vec<String>,
    pub where_clauses: Vec<WhereClause>,
    pub attributes: Vec<AttributeUse>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub inheritance: Vec<String>,
    pub properties: Vec<VarDecl>,
    pub methods: Vec<FuncDecl>,
    pub initializers: Vec<FuncDecl>,
    pub access: AccessLevel,
    pub generic_params: Vec<String>,
    pub where_clauses: Vec<WhereClause>,
    pub attributes: Vec<AttributeUse>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EnumCaseDecl {
    pub name: String,
    pub raw_value: Option<Expr>,
    /// Associated values: label (None for `_`) and annotation.
    pub assoc: Vec<(Option<String>, Option<TypeAnnotation>)>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EnumDecl {
    pub name: String,
    /// Raw-value type and/or protocols after `:`.
    pub inheritance: Vec<String>,
    pub cases: Vec<EnumCaseDecl>,
    pub properties: Vec<VarDecl>,
    pub methods: Vec<FuncDecl>,
    pub access: AccessLevel,
    pub attributes: Vec<AttributeUse>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolMethodReq {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeAnnotation>,
    pub is_static: bool,
    pub is_mutating: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolPropertyReq {
    pub name: String,
    pub type_annotation: Option<TypeAnnotation>,
    pub has_getter: bool,
    pub has_setter: bool,
    pub is_static: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolDecl {
    pub name: String,
    pub inherited: Vec<String>,
    pub methods: Vec<ProtocolMethodReq>,
    pub properties: Vec<ProtocolPropertyReq>,
    pub access: AccessLevel,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExtensionDecl {
    pub extended_type: String,
    pub conformances: Vec<String>,
    pub properties: Vec<VarDecl>,
    pub methods: Vec<FuncDecl>,
    pub initializers: Vec<FuncDecl>,
    pub line: u32,
}

// ---- Statements ----

/// One binding inside an enum-case pattern: `let a`, or `_`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CaseBinding {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Pattern {
    /// `.name` / `.name(let a, let b)`
    EnumCase {
        name: String,
        bindings: Vec<CaseBinding>,
        line: u32,
    },
    /// A literal, identifier, or range expression compared for match.
    Expression { expr: Expr, line: u32 },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SwitchCase {
    pub patterns: Vec<Pattern>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Expression {
        expr: Expr,
        line: u32,
    },
    Print {
        expr: Expr,
        line: u32,
    },
    Var(Box<VarDecl>),
    /// `let (a, b) = expr`
    TupleDestructure {
        names: Vec<String>,
        is_let: bool,
        value: Expr,
        line: u32,
    },
    Func(Box<FuncDecl>),
    Class(Box<ClassDecl>),
    Struct(Box<StructDecl>),
    Enum(Box<EnumDecl>),
    Protocol(Box<ProtocolDecl>),
    Extension(Box<ExtensionDecl>),
    /// `attribute Name(param, ...)`
    AttributeDecl {
        name: String,
        params: Vec<String>,
        line: u32,
    },
    Import {
        path: String,
        line: u32,
    },
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
        line: u32,
    },
    IfLet {
        name: String,
        value: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
        line: u32,
    },
    GuardLet {
        name: String,
        value: Expr,
        else_branch: Vec<Stmt>,
        line: u32,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    RepeatWhile {
        body: Vec<Stmt>,
        condition: Expr,
        line: u32,
    },
    ForIn {
        variable: String,
        iterable: Expr,
        where_clause: Option<Expr>,
        body: Vec<Stmt>,
        line: u32,
    },
    Switch {
        value: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
        line: u32,
    },
    Break {
        line: u32,
    },
    Continue {
        line: u32,
    },
    Return {
        value: Option<Expr>,
        line: u32,
    },
    Throw {
        value: Expr,
        line: u32,
    },
    Block {
        statements: Vec<Stmt>,
        line: u32,
    },
}

impl Stmt {
    #[must_use]
    pub fn line(&self) -> u32 {
        match self {
            Self::Expression { line, .. }
            | Self::Print { line, .. }
            | Self::TupleDestructure { line, .. }
            | Self::AttributeDecl { line, .. }
            | Self::Import { line, .. }
            | Self::If { line, .. }
            | Self::IfLet { line, .. }
            | Self::GuardLet { line, .. }
            | Self::While { line, .. }
            | Self::RepeatWhile { line, .. }
            | Self::ForIn { line, .. }
            | Self::Switch { line, .. }
            | Self::Break { line }
            | Self::Continue { line }
            | Self::Return { line, .. }
            | Self::Throw { line, .. }
            | Self::Block { line, .. } => *line,
            Self::Var(decl) => decl.line,
            Self::Func(decl) => decl.line,
            Self::Class(decl) => decl.line,
            Self::Struct(decl) => decl.line,
            Self::Enum(decl) => decl.line,
            Self::Protocol(decl) => decl.line,
            Self::Extension(decl) => decl.line,
        }
    }
}
