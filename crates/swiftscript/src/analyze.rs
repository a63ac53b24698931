//! Semantic analyzer.
//!
//! Three ordered passes over the program (imports spliced first by the
//! loader):
//!
//! - **Pass A** collects every declared type into the registry: classes,
//!   structs, enums, protocols, generic struct templates, extensions merged
//!   into their target, protocol inheritance closed transitively.
//! - **Pass B** declares global symbols: type names and global functions,
//!   plus the engine-provided `readLine`.
//! - **Pass C** walks statements in order, checking assignment
//!   compatibility, operator typing, optional handling, `let` and access
//!   control enforcement, generic constraints, and control-flow invariants.
//!
//! Errors accumulate across the whole program and are raised once as a
//! single [`TypeCheckError`]; warnings are returned for the embedder to
//! print (the default pipeline sends them to stderr).

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    ast::{
        self, AccessLevel, BinaryOp, CastKind, ClassDecl, EnumDecl, Expr, ExtensionDecl, FuncDecl, Pattern,
        ProtocolDecl, Stmt, StructDecl, TypeAnnotation, UnaryOp, VarDecl,
    },
    error::{Diagnostic, Severity, TypeCheckError},
};

/// A type as the analyzer sees it: a name, an optionality flag, and (for
/// function types) parameter/return shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct SsType {
    pub name: String,
    pub optional: bool,
    pub params: Option<Vec<SsType>>,
    pub ret: Option<Box<SsType>>,
}

impl SsType {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            params: None,
            ret: None,
        }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self::named("Unknown")
    }

    #[must_use]
    pub fn void() -> Self {
        Self::named("Void")
    }

    #[must_use]
    pub fn function(params: Vec<SsType>, ret: SsType) -> Self {
        Self {
            name: "Function".to_owned(),
            optional: false,
            params: Some(params),
            ret: Some(Box::new(ret)),
        }
    }

    #[must_use]
    pub fn optional_of(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn non_optional(mut self) -> Self {
        self.optional = false;
        self
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.name == "Unknown"
    }

    #[must_use]
    pub fn is_any(&self) -> bool {
        self.name == "Any"
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.name == "Int" || self.name == "Float"
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.name == "Nil"
    }
}

impl std::fmt::Display for SsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if self.optional {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// Method signature recorded in the registry.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<SsType>,
    pub ret: SsType,
    pub is_static: bool,
    pub is_mutating: bool,
    pub access: AccessLevel,
}

/// Property signature recorded in the registry.
#[derive(Debug, Clone)]
pub struct PropertySig {
    pub name: String,
    pub ty: SsType,
    pub is_let: bool,
    pub is_static: bool,
    pub access: AccessLevel,
}

/// Enum case signature: labels and element types of the associated payload.
#[derive(Debug, Clone)]
pub struct EnumCaseSig {
    pub name: String,
    pub assoc: Vec<(Option<String>, SsType)>,
    pub has_raw: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Struct,
    Enum,
    Builtin,
}

/// One registered type.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub name: String,
    pub kind: TypeKind,
    pub superclass: Option<String>,
    pub conformances: Vec<String>,
    pub methods: Vec<MethodSig>,
    pub properties: Vec<PropertySig>,
    pub enum_cases: Vec<EnumCaseSig>,
    pub mutating_methods: AHashSet<String>,
    pub access: AccessLevel,
}

impl TypeEntry {
    fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            superclass: None,
            conformances: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            enum_cases: Vec::new(),
            mutating_methods: AHashSet::new(),
            access: AccessLevel::Internal,
        }
    }

    fn method(&self, name: &str) -> Option<&MethodSig> {
        self.methods.iter().find(|m| m.name == name)
    }

    fn property(&self, name: &str) -> Option<&PropertySig> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// One registered protocol.
#[derive(Debug, Clone)]
pub struct ProtocolEntry {
    pub name: String,
    pub inherited: Vec<String>,
    pub methods: Vec<String>,
    pub properties: Vec<String>,
    /// Transitive closure parent → descendants, computed after Pass A.
    pub descendants: Vec<String>,
}

/// Result of a successful analysis, consumed by the compiler.
#[derive(Debug, Default)]
pub struct Analysis {
    /// base template name → mangled specialized names, in first-use order.
    pub specializations: IndexMap<String, Vec<String>>,
    /// class name → superclass name, for the compiler's `INHERIT` emission.
    pub superclasses: AHashMap<String, String>,
    /// Warnings for the embedder to surface.
    pub warnings: Vec<Diagnostic>,
}

/// Lexical binding.
#[derive(Debug, Clone)]
struct Binding {
    ty: SsType,
    is_let: bool,
}

pub struct Analyzer {
    types: AHashMap<String, TypeEntry>,
    protocols: AHashMap<String, ProtocolEntry>,
    generic_templates: AHashMap<String, StructDecl>,
    declared_attributes: AHashSet<String>,
    scopes: Vec<AHashMap<String, Binding>>,
    /// Expected return types of enclosing functions, innermost last.
    function_stack: Vec<SsType>,
    generic_param_stack: Vec<Vec<String>>,
    current_type_context: Option<String>,
    in_initializer: bool,
    loop_depth: usize,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
    specializations: IndexMap<String, Vec<String>>,
}

/// Runs the analyzer over a complete program.
pub fn analyze(program: &[Stmt]) -> Result<Analysis, TypeCheckError> {
    analyze_with_globals(program, &[])
}

/// Like [`analyze`], with additional host-provided global names (injected
/// inputs, registered native functions) pre-declared with unknown types.
pub fn analyze_with_globals(program: &[Stmt], host_globals: &[String]) -> Result<Analysis, TypeCheckError> {
    let mut analyzer = Analyzer::new();
    analyzer.register_builtins();
    for name in host_globals {
        analyzer.declare_binding(name, SsType::unknown(), false);
    }
    analyzer.collect_types(program); // Pass A
    analyzer.declare_globals(program); // Pass B
    for stmt in program {
        analyzer.check_stmt(stmt); // Pass C
    }
    analyzer.finish()
}

impl Analyzer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: AHashMap::new(),
            protocols: AHashMap::new(),
            generic_templates: AHashMap::new(),
            declared_attributes: AHashSet::new(),
            scopes: vec![AHashMap::new()],
            function_stack: Vec::new(),
            generic_param_stack: Vec::new(),
            current_type_context: None,
            in_initializer: false,
            loop_depth: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            specializations: IndexMap::new(),
        }
    }

    fn finish(mut self) -> Result<Analysis, TypeCheckError> {
        if self.errors.is_empty() {
            let superclasses = self
                .types
                .iter()
                .filter_map(|(name, entry)| entry.superclass.clone().map(|s| (name.clone(), s)))
                .collect();
            Ok(Analysis {
                specializations: std::mem::take(&mut self.specializations),
                superclasses,
                warnings: std::mem::take(&mut self.warnings),
            })
        } else {
            Err(TypeCheckError {
                diagnostics: self.errors,
            })
        }
    }

    fn error(&mut self, message: impl Into<String>, line: u32) {
        self.errors.push(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            line,
        });
    }

    fn warn(&mut self, message: impl Into<String>, line: u32) {
        self.warnings.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            line,
        });
    }

    // ---- Builtins ----

    fn register_builtins(&mut self) {
        for name in ["Int", "Float", "Bool", "String", "Array", "Dictionary", "Void", "Any"] {
            let mut entry = TypeEntry::new(name, TypeKind::Builtin);
            match name {
                "Int" | "Float" => {
                    entry.conformances = vec![
                        "Equatable".to_owned(),
                        "Comparable".to_owned(),
                        "Hashable".to_owned(),
                        "Numeric".to_owned(),
                        "SignedNumeric".to_owned(),
                        "CustomStringConvertible".to_owned(),
                    ];
                }
                "Bool" => {
                    entry.conformances = vec![
                        "Equatable".to_owned(),
                        "Hashable".to_owned(),
                        "CustomStringConvertible".to_owned(),
                    ];
                }
                "String" => {
                    entry.conformances = vec![
                        "Equatable".to_owned(),
                        "Comparable".to_owned(),
                        "Hashable".to_owned(),
                        "CustomStringConvertible".to_owned(),
                    ];
                }
                "Array" => {
                    entry.properties.push(PropertySig {
                        name: "count".to_owned(),
                        ty: SsType::named("Int"),
                        is_let: true,
                        is_static: false,
                        access: AccessLevel::Public,
                    });
                    entry.properties.push(PropertySig {
                        name: "isEmpty".to_owned(),
                        ty: SsType::named("Bool"),
                        is_let: true,
                        is_static: false,
                        access: AccessLevel::Public,
                    });
                    entry.methods.push(MethodSig {
                        name: "append".to_owned(),
                        params: vec![SsType::named("Any")],
                        ret: SsType::void(),
                        is_static: false,
                        is_mutating: false,
                        access: AccessLevel::Public,
                    });
                }
                _ => {}
            }
            self.types.insert(name.to_owned(), entry);
        }

        // String shares the count/isEmpty surface.
        if let Some(entry) = self.types.get_mut("String") {
            entry.properties.push(PropertySig {
                name: "count".to_owned(),
                ty: SsType::named("Int"),
                is_let: true,
                is_static: false,
                access: AccessLevel::Public,
            });
            entry.properties.push(PropertySig {
                name: "isEmpty".to_owned(),
                ty: SsType::named("Bool"),
                is_let: true,
                is_static: false,
                access: AccessLevel::Public,
            });
        }
        if let Some(entry) = self.types.get_mut("Dictionary") {
            entry.properties.push(PropertySig {
                name: "count".to_owned(),
                ty: SsType::named("Int"),
                is_let: true,
                is_static: false,
                access: AccessLevel::Public,
            });
            entry.properties.push(PropertySig {
                name: "isEmpty".to_owned(),
                ty: SsType::named("Bool"),
                is_let: true,
                is_static: false,
                access: AccessLevel::Public,
            });
        }

        let standard_protocols: &[(&str, &[&str])] = &[
            ("Equatable", &[]),
            ("Comparable", &["Equatable"]),
            ("Hashable", &["Equatable"]),
            ("Numeric", &[]),
            ("SignedNumeric", &["Numeric"]),
            ("CustomStringConvertible", &[]),
        ];
        for (name, inherited) in standard_protocols {
            self.protocols.insert(
                (*name).to_owned(),
                ProtocolEntry {
                    name: (*name).to_owned(),
                    inherited: inherited.iter().map(|s| (*s).to_owned()).collect(),
                    methods: Vec::new(),
                    properties: Vec::new(),
                    descendants: Vec::new(),
                },
            );
        }

        for attribute in ["Range", "Obsolete", "Deprecated"] {
            self.declared_attributes.insert(attribute.to_owned());
        }
    }

    // ---- Pass A: type registry ----

    fn collect_types(&mut self, program: &[Stmt]) {
        // Pre-register names and kinds so forward references (a class whose
        // superclass is declared later) resolve during the fill pass.
        for stmt in program {
            match stmt {
                Stmt::Class(decl) => {
                    self.types
                        .insert(decl.name.clone(), TypeEntry::new(&decl.name, TypeKind::Class));
                }
                Stmt::Struct(decl) if decl.generic_params.is_empty() => {
                    self.types
                        .insert(decl.name.clone(), TypeEntry::new(&decl.name, TypeKind::Struct));
                }
                Stmt::Enum(decl) => {
                    self.types
                        .insert(decl.name.clone(), TypeEntry::new(&decl.name, TypeKind::Enum));
                }
                _ => {}
            }
        }
        for stmt in program {
            match stmt {
                Stmt::Class(decl) => self.collect_class(decl),
                Stmt::Struct(decl) => self.collect_struct(decl),
                Stmt::Enum(decl) => self.collect_enum(decl),
                Stmt::Protocol(decl) => self.collect_protocol(decl),
                Stmt::AttributeDecl { name, .. } => {
                    self.declared_attributes.insert(name.clone());
                }
                _ => {}
            }
        }
        // Extensions merge after all base types exist.
        for stmt in program {
            if let Stmt::Extension(decl) = stmt {
                self.collect_extension(decl);
            }
        }
        self.close_protocol_inheritance();
    }

    fn collect_class(&mut self, decl: &ClassDecl) {
        let mut entry = TypeEntry::new(&decl.name, TypeKind::Class);
        entry.access = decl.access;
        for name in &decl.inheritance {
            // The first class name is the superclass; protocol names are
            // conformances. Unknown names are assumed protocols until Pass C.
            if self.types.get(name).is_some_and(|t| t.kind == TypeKind::Class) && entry.superclass.is_none() {
                entry.superclass = Some(name.clone());
            } else {
                entry.conformances.push(name.clone());
            }
        }
        self.collect_members(&mut entry, &decl.properties, &decl.methods, &decl.initializers);
        self.types.insert(decl.name.clone(), entry);
    }

    fn collect_struct(&mut self, decl: &StructDecl) {
        if !decl.generic_params.is_empty() {
            self.generic_templates.insert(decl.name.clone(), decl.clone());
            return;
        }
        let mut entry = TypeEntry::new(&decl.name, TypeKind::Struct);
        entry.access = decl.access;
        entry.conformances = decl.inheritance.clone();
        self.collect_members(&mut entry, &decl.properties, &decl.methods, &decl.initializers);
        for method in &decl.methods {
            if method.is_mutating {
                entry.mutating_methods.insert(method.name.clone());
            }
        }
        self.types.insert(decl.name.clone(), entry);
    }

    fn collect_enum(&mut self, decl: &EnumDecl) {
        let mut entry = TypeEntry::new(&decl.name, TypeKind::Enum);
        entry.access = decl.access;
        entry.conformances = decl.inheritance.clone();
        for case in &decl.cases {
            entry.enum_cases.push(EnumCaseSig {
                name: case.name.clone(),
                assoc: case
                    .assoc
                    .iter()
                    .map(|(label, annotation)| {
                        let ty = annotation
                            .as_ref()
                            .map_or_else(SsType::unknown, |a| self.type_from_annotation_quiet(a));
                        (label.clone(), ty)
                    })
                    .collect(),
                has_raw: case.raw_value.is_some(),
            });
        }
        self.collect_members(&mut entry, &decl.properties, &decl.methods, &[]);
        self.types.insert(decl.name.clone(), entry);
    }

    fn collect_protocol(&mut self, decl: &ProtocolDecl) {
        self.protocols.insert(
            decl.name.clone(),
            ProtocolEntry {
                name: decl.name.clone(),
                inherited: decl.inherited.clone(),
                methods: decl.methods.iter().map(|m| m.name.clone()).collect(),
                properties: decl.properties.iter().map(|p| p.name.clone()).collect(),
                descendants: Vec::new(),
            },
        );
    }

    fn collect_extension(&mut self, decl: &ExtensionDecl) {
        let Some(entry) = self.types.get(&decl.extended_type) else {
            // Reported during Pass C with a line number.
            return;
        };
        let mut entry = entry.clone();
        entry.conformances.extend(decl.conformances.iter().cloned());
        self.collect_members(&mut entry, &decl.properties, &decl.methods, &decl.initializers);
        for method in &decl.methods {
            if method.is_mutating {
                entry.mutating_methods.insert(method.name.clone());
            }
        }
        self.types.insert(decl.extended_type.clone(), entry);
    }

    fn collect_members(
        &mut self,
        entry: &mut TypeEntry,
        properties: &[VarDecl],
        methods: &[FuncDecl],
        initializers: &[FuncDecl],
    ) {
        for property in properties {
            let ty = property
                .type_annotation
                .as_ref()
                .map_or_else(SsType::unknown, |a| self.type_from_annotation_quiet(a));
            entry.properties.push(PropertySig {
                name: property.name.clone(),
                ty,
                is_let: property.is_let,
                is_static: property.is_static,
                access: property.access,
            });
        }
        for method in methods.iter().chain(initializers) {
            let params = method
                .params
                .iter()
                .map(|p| {
                    p.type_annotation
                        .as_ref()
                        .map_or_else(SsType::unknown, |a| self.type_from_annotation_quiet(a))
                })
                .collect();
            let ret = method
                .return_type
                .as_ref()
                .map_or_else(SsType::void, |a| self.type_from_annotation_quiet(a));
            entry.methods.push(MethodSig {
                name: method.name.clone(),
                params,
                ret,
                is_static: method.is_static,
                is_mutating: method.is_mutating,
                access: method.access,
            });
        }
    }

    /// Computes parent → descendants over protocol inheritance.
    fn close_protocol_inheritance(&mut self) {
        let names: Vec<String> = self.protocols.keys().cloned().collect();
        for name in &names {
            let mut ancestors = Vec::new();
            self.collect_protocol_ancestors(name, &mut ancestors, &mut AHashSet::new());
            for ancestor in ancestors {
                if let Some(parent) = self.protocols.get_mut(&ancestor) {
                    if !parent.descendants.contains(name) {
                        parent.descendants.push(name.clone());
                    }
                }
            }
        }
    }

    fn collect_protocol_ancestors(&self, name: &str, out: &mut Vec<String>, seen: &mut AHashSet<String>) {
        if !seen.insert(name.to_owned()) {
            return;
        }
        if let Some(entry) = self.protocols.get(name) {
            for parent in &entry.inherited {
                out.push(parent.clone());
                self.collect_protocol_ancestors(parent, out, seen);
            }
        }
    }

    // ---- Pass B: global symbols ----

    fn declare_globals(&mut self, program: &[Stmt]) {
        self.declare_binding(
            "readLine",
            SsType::function(Vec::new(), SsType::named("String").optional_of()),
            false,
        );
        for stmt in program {
            match stmt {
                Stmt::Func(decl) => {
                    let params = decl
                        .params
                        .iter()
                        .map(|p| {
                            p.type_annotation
                                .as_ref()
                                .map_or_else(SsType::unknown, |a| self.type_from_annotation_quiet(a))
                        })
                        .collect();
                    let ret = decl
                        .return_type
                        .as_ref()
                        .map_or_else(SsType::void, |a| self.type_from_annotation_quiet(a));
                    self.declare_binding(&decl.name, SsType::function(params, ret), false);
                }
                Stmt::Class(decl) => self.declare_binding(&decl.name, SsType::named(&decl.name), false),
                Stmt::Struct(decl) => self.declare_binding(&decl.name, SsType::named(&decl.name), false),
                Stmt::Enum(decl) => self.declare_binding(&decl.name, SsType::named(&decl.name), false),
                _ => {}
            }
        }
    }

    // ---- Scopes ----

    fn begin_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    fn end_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare_binding(&mut self, name: &str, ty: SsType, is_let: bool) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_owned(), Binding { ty, is_let });
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    // ---- Conformance and assignability ----

    /// Whether `type_name` conforms to `protocol_name`, directly, through an
    /// inherited protocol, or via a class ancestor.
    #[must_use]
    pub fn protocol_conforms(&self, type_name: &str, protocol_name: &str) -> bool {
        let mut current = Some(type_name.to_owned());
        while let Some(name) = current {
            if let Some(entry) = self.types.get(&name) {
                for conformance in &entry.conformances {
                    if conformance == protocol_name {
                        return true;
                    }
                    let mut ancestors = Vec::new();
                    self.collect_protocol_ancestors(conformance, &mut ancestors, &mut AHashSet::new());
                    if ancestors.iter().any(|a| a == protocol_name) {
                        return true;
                    }
                }
                current = entry.superclass.clone();
            } else {
                return false;
            }
        }
        false
    }

    fn is_superclass_of(&self, expected: &str, actual: &str) -> bool {
        let mut current = self.types.get(actual).and_then(|t| t.superclass.clone());
        while let Some(name) = current {
            if name == expected {
                return true;
            }
            current = self.types.get(&name).and_then(|t| t.superclass.clone());
        }
        false
    }

    /// Assignment compatibility: unknown/Any on either side, optional
    /// acceptance, equality, superclass widening, protocol conformance, and
    /// pointwise function compatibility.
    #[must_use]
    pub fn assignable(&self, expected: &SsType, actual: &SsType) -> bool {
        if expected.is_unknown() || actual.is_unknown() || expected.is_any() || actual.is_any() {
            return true;
        }
        if expected.optional {
            if actual.is_nil() {
                return true;
            }
            let base = expected.clone().non_optional();
            let actual_base = actual.clone().non_optional();
            if self.assignable(&base, &actual_base) {
                return true;
            }
        }
        if actual.optional && !expected.optional {
            return false;
        }
        if expected.name == actual.name {
            if let (Some(expected_params), Some(actual_params)) = (&expected.params, &actual.params) {
                return expected_params.len() == actual_params.len()
                    && expected_params
                        .iter()
                        .zip(actual_params)
                        .all(|(e, a)| self.assignable(e, a))
                    && match (&expected.ret, &actual.ret) {
                        (Some(e), Some(a)) => self.assignable(e, a),
                        _ => true,
                    };
            }
            return true;
        }
        if self.is_superclass_of(&expected.name, &actual.name) {
            return true;
        }
        if self.protocols.contains_key(&expected.name) && self.protocol_conforms(&actual.name, &expected.name) {
            return true;
        }
        false
    }

    // ---- Type annotations and generics ----

    fn type_from_annotation_quiet(&mut self, annotation: &TypeAnnotation) -> SsType {
        self.type_from_annotation(annotation, false)
    }

    fn type_from_annotation(&mut self, annotation: &TypeAnnotation, report: bool) -> SsType {
        if let Some(function) = &annotation.function {
            let params = function
                .params
                .iter()
                .map(|p| self.type_from_annotation(p, report))
                .collect();
            let ret = self.type_from_annotation(&function.ret, report);
            let mut ty = SsType::function(params, ret);
            ty.optional = annotation.is_optional;
            return ty;
        }

        let name = if annotation.generic_args.is_empty() {
            annotation.name.clone()
        } else if annotation.name == "Array" || annotation.name == "Dictionary" {
            annotation.name.clone()
        } else {
            self.specialize_generic(&annotation.name, &annotation.generic_args, annotation.line);
            ast::mangle_generic(&annotation.name, &annotation.generic_args)
        };

        if report
            && !self.types.contains_key(&name)
            && !self.protocols.contains_key(&name)
            && !self.generic_param_in_scope(&name)
            && name != "Self"
        {
            self.error(format!("Unknown type '{name}'"), annotation.line);
        }

        let mut ty = SsType::named(name);
        ty.optional = annotation.is_optional;
        ty
    }

    fn generic_param_in_scope(&self, name: &str) -> bool {
        self.generic_param_stack.iter().any(|params| params.iter().any(|p| p == name))
    }

    /// Instantiates `base<args>` if not already specialized: validates
    /// where-clause constraints, substitutes type parameters through
    /// properties and methods, and registers the specialized entry under the
    /// mangled name.
    fn specialize_generic(&mut self, base: &str, args: &[TypeAnnotation], line: u32) {
        let Some(template) = self.generic_templates.get(base).cloned() else {
            return;
        };
        if template.generic_params.len() != args.len() {
            self.error(format!("Generic parameter count mismatch for {base}"), line);
            return;
        }

        for (param, arg) in template.generic_params.iter().zip(args) {
            for clause in &template.where_clauses {
                if &clause.param == param && !self.protocol_conforms(&arg.name, &clause.constraint) {
                    self.error(
                        format!(
                            "Type '{}' does not conform to protocol '{}' (required by generic constraint on '{}')",
                            arg.name, clause.constraint, param
                        ),
                        line,
                    );
                }
            }
        }

        let mangled = ast::mangle_generic(base, args);
        if self.types.contains_key(&mangled) {
            return;
        }

        let substitution: AHashMap<&str, &str> = template
            .generic_params
            .iter()
            .map(String::as_str)
            .zip(args.iter().map(|a| a.name.as_str()))
            .collect();
        let substitute = |ty: &SsType| -> SsType {
            let mut ty = ty.clone();
            if let Some(replacement) = substitution.get(ty.name.as_str()) {
                ty.name = (*replacement).to_owned();
            }
            ty
        };

        let mut entry = TypeEntry::new(&mangled, TypeKind::Struct);
        entry.access = template.access;
        let mut scratch = TypeEntry::new(&mangled, TypeKind::Struct);
        self.collect_members(&mut scratch, &template.properties, &template.methods, &template.initializers);
        entry.properties = scratch
            .properties
            .iter()
            .map(|p| PropertySig {
                ty: substitute(&p.ty),
                ..p.clone()
            })
            .collect();
        entry.methods = scratch
            .methods
            .iter()
            .map(|m| MethodSig {
                params: m.params.iter().map(&substitute).collect(),
                ret: substitute(&m.ret),
                ..m.clone()
            })
            .collect();
        for method in &template.methods {
            if method.is_mutating {
                entry.mutating_methods.insert(method.name.clone());
            }
        }
        self.types.insert(mangled.clone(), entry);
        self.declare_binding(&mangled, SsType::named(&mangled), false);
        self.specializations.entry(base.to_owned()).or_default().push(mangled);
    }

    // ---- Pass C: statements ----

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expression { expr, .. } | Stmt::Print { expr, .. } => {
                self.infer_expr(expr);
            }
            Stmt::Var(decl) => self.check_var_decl(decl, true),
            Stmt::TupleDestructure { names, value, is_let, line } => {
                let ty = self.infer_expr(value);
                if ty.name != "Tuple" && !ty.is_unknown() && !ty.is_any() {
                    self.error(format!("Cannot destructure non-tuple value of type '{ty}'"), *line);
                }
                for name in names {
                    self.declare_binding(name, SsType::unknown(), *is_let);
                }
            }
            Stmt::Func(decl) => self.check_func_decl(decl),
            Stmt::Class(decl) => self.check_class_decl(decl),
            Stmt::Struct(decl) => self.check_struct_decl(decl),
            Stmt::Enum(decl) => self.check_enum_decl(decl),
            Stmt::Protocol(_) | Stmt::AttributeDecl { .. } | Stmt::Import { .. } => {}
            Stmt::Extension(decl) => self.check_extension_decl(decl),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                let cond = self.infer_expr(condition);
                if cond.name != "Bool" && !cond.is_unknown() && !cond.is_any() {
                    self.error(format!("Condition must be 'Bool', found '{cond}'"), *line);
                }
                self.check_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_block(else_branch);
                }
            }
            Stmt::IfLet {
                name,
                value,
                then_branch,
                else_branch,
                line,
            } => {
                let ty = self.infer_expr(value);
                if !ty.optional && !ty.is_unknown() && !ty.is_any() && !ty.is_nil() {
                    self.warn(format!("'if let' value of non-optional type '{ty}'"), *line);
                }
                self.begin_scope();
                self.declare_binding(name, ty.non_optional(), true);
                for stmt in then_branch {
                    self.check_stmt(stmt);
                }
                self.end_scope();
                if let Some(else_branch) = else_branch {
                    self.check_block(else_branch);
                }
            }
            Stmt::GuardLet {
                name,
                value,
                else_branch,
                line,
            } => {
                let ty = self.infer_expr(value);
                self.check_block(else_branch);
                if !block_exits(else_branch) {
                    self.error("'guard' body must not fall through; add 'return' or 'throw'", *line);
                }
                // The binding lives in the enclosing scope after the guard.
                self.declare_binding(name, ty.non_optional(), true);
            }
            Stmt::While { condition, body, line } => {
                let cond = self.infer_expr(condition);
                if cond.name != "Bool" && !cond.is_unknown() && !cond.is_any() {
                    self.error(format!("Condition must be 'Bool', found '{cond}'"), *line);
                }
                self.loop_depth += 1;
                self.check_block(body);
                self.loop_depth -= 1;
            }
            Stmt::RepeatWhile { body, condition, line } => {
                self.loop_depth += 1;
                self.check_block(body);
                self.loop_depth -= 1;
                let cond = self.infer_expr(condition);
                if cond.name != "Bool" && !cond.is_unknown() && !cond.is_any() {
                    self.error(format!("Condition must be 'Bool', found '{cond}'"), *line);
                }
            }
            Stmt::ForIn {
                variable,
                iterable,
                where_clause,
                body,
                ..
            } => {
                let iterable_ty = self.infer_expr(iterable);
                let element_ty = match iterable_ty.name.as_str() {
                    "Range" => SsType::named("Int"),
                    "Array" | "String" | "Dictionary" => SsType::unknown(),
                    _ => SsType::unknown(),
                };
                self.begin_scope();
                self.declare_binding(variable, element_ty, true);
                if let Some(where_clause) = where_clause {
                    let cond = self.infer_expr(where_clause);
                    if cond.name != "Bool" && !cond.is_unknown() && !cond.is_any() {
                        self.error(format!("'where' clause must be 'Bool', found '{cond}'"), where_clause.line());
                    }
                }
                self.loop_depth += 1;
                for stmt in body {
                    self.check_stmt(stmt);
                }
                self.loop_depth -= 1;
                self.end_scope();
            }
            Stmt::Switch {
                value, cases, default, ..
            } => {
                let subject = self.infer_expr(value);
                for case in cases {
                    self.check_switch_case(case, &subject);
                }
                if let Some(default) = default {
                    self.check_block(default);
                }
            }
            Stmt::Break { line } | Stmt::Continue { line } => {
                if self.loop_depth == 0 {
                    self.error("'break' or 'continue' outside of a loop", *line);
                }
            }
            Stmt::Return { value, line } => {
                let Some(expected) = self.function_stack.last().cloned() else {
                    self.error("'return' outside of a function", *line);
                    if let Some(value) = value {
                        self.infer_expr(value);
                    }
                    return;
                };
                match value {
                    Some(value) => {
                        let actual = self.infer_expr(value);
                        if !self.assignable(&expected, &actual) {
                            self.error(format!("Cannot return '{actual}' from a function returning '{expected}'"), *line);
                        }
                    }
                    None => {
                        if expected.name != "Void" && !expected.is_unknown() && !expected.optional {
                            self.error(format!("Non-void function must return '{expected}'"), *line);
                        }
                    }
                }
            }
            Stmt::Throw { value, .. } => {
                self.infer_expr(value);
            }
            Stmt::Block { statements, .. } => self.check_block(statements),
        }
    }

    fn check_block(&mut self, statements: &[Stmt]) {
        self.begin_scope();
        for stmt in statements {
            self.check_stmt(stmt);
        }
        self.end_scope();
    }

    fn check_switch_case(&mut self, case: &ast::SwitchCase, subject: &SsType) {
        let captures = case
            .patterns
            .iter()
            .filter(|p| matches!(p, Pattern::EnumCase { bindings, .. } if bindings.iter().any(|b| b.name.is_some())))
            .count();
        if captures > 0 && case.patterns.len() > 1 {
            self.error(
                "Multiple patterns with value bindings in one 'case' are not supported",
                case.line,
            );
        }

        self.begin_scope();
        for pattern in &case.patterns {
            match pattern {
                Pattern::EnumCase { name, bindings, line } => {
                    let case_sig = self
                        .types
                        .get(&subject.name)
                        .filter(|t| t.kind == TypeKind::Enum)
                        .and_then(|t| t.enum_cases.iter().find(|c| &c.name == name))
                        .cloned();
                    match case_sig {
                        Some(sig) => {
                            if !bindings.is_empty() && bindings.len() != sig.assoc.len() {
                                self.error(
                                    format!(
                                        "Case '.{name}' has {} associated value(s), pattern binds {}",
                                        sig.assoc.len(),
                                        bindings.len()
                                    ),
                                    *line,
                                );
                            }
                            for (binding, (_, ty)) in bindings.iter().zip(&sig.assoc) {
                                if let Some(binding_name) = &binding.name {
                                    self.declare_binding(binding_name, ty.clone(), true);
                                }
                            }
                        }
                        None => {
                            if self.types.get(&subject.name).is_some_and(|t| t.kind == TypeKind::Enum) {
                                self.error(format!("Enum '{}' has no case '.{name}'", subject.name), *line);
                            } else {
                                for binding in bindings {
                                    if let Some(binding_name) = &binding.name {
                                        self.declare_binding(binding_name, SsType::unknown(), true);
                                    }
                                }
                            }
                        }
                    }
                }
                Pattern::Expression { expr, .. } => {
                    self.infer_expr(expr);
                }
            }
        }
        for stmt in &case.body {
            self.check_stmt(stmt);
        }
        self.end_scope();
    }

    fn check_var_decl(&mut self, decl: &VarDecl, declare: bool) {
        self.check_attributes(decl);

        let annotated = decl.type_annotation.as_ref().map(|a| self.type_from_annotation(a, true));

        if let Some(getter) = &decl.getter {
            let ret = annotated.clone().unwrap_or_else(SsType::unknown);
            self.function_stack.push(ret);
            self.check_block(getter);
            self.function_stack.pop();
            if let Some(setter) = &decl.setter {
                self.begin_scope();
                let param = setter.param.clone().unwrap_or_else(|| "newValue".to_owned());
                self.declare_binding(&param, annotated.clone().unwrap_or_else(SsType::unknown), true);
                self.function_stack.push(SsType::void());
                for stmt in &setter.body {
                    self.check_stmt(stmt);
                }
                self.function_stack.pop();
                self.end_scope();
            }
        }

        let initializer_ty = decl.initializer.as_ref().map(|init| self.infer_expr(init));

        if let (Some(expected), Some(actual)) = (&annotated, &initializer_ty) {
            if !self.assignable(expected, actual) {
                self.error(
                    format!("Cannot assign '{actual}' to variable of type '{expected}'"),
                    decl.line,
                );
            }
        }

        for observer in [&decl.will_set, &decl.did_set].into_iter().flatten() {
            self.begin_scope();
            let default_name = if decl.will_set.as_ref().is_some_and(|w| std::ptr::eq(w, observer)) {
                "newValue"
            } else {
                "oldValue"
            };
            let param = observer.param.clone().unwrap_or_else(|| default_name.to_owned());
            self.declare_binding(&param, annotated.clone().unwrap_or_else(SsType::unknown), true);
            self.function_stack.push(SsType::void());
            for stmt in &observer.body {
                self.check_stmt(stmt);
            }
            self.function_stack.pop();
            self.end_scope();
        }

        if declare {
            let ty = annotated
                .or(initializer_ty)
                .unwrap_or_else(SsType::unknown);
            self.declare_binding(&decl.name, ty, decl.is_let);
        }
    }

    fn check_attributes(&mut self, decl: &VarDecl) {
        for attribute in &decl.attributes {
            match attribute.name.as_str() {
                "Obsolete" => {
                    self.error(format!("'{}' is obsolete", decl.name), attribute.line);
                }
                "Deprecated" => {
                    self.warn(format!("'{}' is deprecated", decl.name), attribute.line);
                }
                "Range" => {
                    if let (
                        Some(Expr::IntLiteral { value: lo, .. }),
                        Some(Expr::IntLiteral { value: hi, .. }),
                        Some(Expr::IntLiteral { value, .. }),
                    ) = (attribute.args.first(), attribute.args.get(1), decl.initializer.as_ref())
                    {
                        if value < lo || value > hi {
                            self.error(
                                format!("Initial value {value} of '{}' is outside range {lo}...{hi}", decl.name),
                                attribute.line,
                            );
                        }
                    }
                }
                other => {
                    if !self.declared_attributes.contains(other) {
                        self.warn(format!("Unknown attribute '{other}'"), attribute.line);
                    }
                }
            }
        }
    }

    fn check_func_decl(&mut self, decl: &FuncDecl) {
        if !decl.generic_params.is_empty() {
            self.generic_param_stack.push(decl.generic_params.clone());
        }

        let ret = decl
            .return_type
            .as_ref()
            .map_or_else(SsType::void, |a| self.type_from_annotation(a, true));
        self.function_stack.push(ret);
        self.begin_scope();
        for param in &decl.params {
            let ty = param
                .type_annotation
                .as_ref()
                .map_or_else(SsType::unknown, |a| self.type_from_annotation(a, true));
            self.declare_binding(&param.name, ty, true);
            if let Some(default) = &param.default_value {
                if !is_constant_default(default) {
                    self.error(
                        format!("Default value for '{}' must be a literal constant", param.name),
                        decl.line,
                    );
                }
            }
        }
        for stmt in &decl.body {
            self.check_stmt(stmt);
        }
        self.end_scope();
        self.function_stack.pop();

        if !decl.generic_params.is_empty() {
            self.generic_param_stack.pop();
        }
    }

    fn check_method(&mut self, type_name: &str, decl: &FuncDecl, is_initializer: bool) {
        let saved_init = self.in_initializer;
        self.in_initializer = is_initializer;
        self.begin_scope();
        if !decl.is_static {
            self.declare_binding("self", SsType::named(type_name), !decl.is_mutating && !is_initializer);
        }
        // Properties resolve as implicit self members inside the body.
        let properties: Vec<PropertySig> = self
            .types
            .get(type_name)
            .map(|t| t.properties.clone())
            .unwrap_or_default();
        for property in &properties {
            if property.is_static == decl.is_static || !decl.is_static {
                self.declare_binding(&property.name, property.ty.clone(), false);
            }
        }
        self.check_func_decl(decl);
        self.end_scope();
        self.in_initializer = saved_init;
    }

    fn check_class_decl(&mut self, decl: &ClassDecl) {
        // Resolve inheritance now every type is known.
        let mut superclass_count = 0usize;
        for name in &decl.inheritance {
            match self.types.get(name).map(|t| t.kind) {
                Some(TypeKind::Class) => superclass_count += 1,
                Some(_) | None => {
                    if !self.protocols.contains_key(name) {
                        self.error(format!("Unknown type '{name}' in inheritance clause"), decl.line);
                    }
                }
            }
        }
        if superclass_count > 1 {
            self.error(
                format!("Class '{}' cannot inherit from multiple classes", decl.name),
                decl.line,
            );
        }

        self.check_conformances(&decl.name, decl.line);

        let saved = self.current_type_context.replace(decl.name.clone());
        self.check_type_properties(&decl.name, &decl.properties);
        for method in &decl.methods {
            if method.is_override && !self.override_target_exists(&decl.name, &method.name) {
                self.error(
                    format!("Method '{}' marked 'override' but no superclass declares it", method.name),
                    method.line,
                );
            }
            self.check_method(&decl.name, method, false);
        }
        for initializer in &decl.initializers {
            self.check_method(&decl.name, initializer, true);
        }
        if let Some(deinit_body) = &decl.deinitializer {
            self.begin_scope();
            self.declare_binding("self", SsType::named(&decl.name), true);
            let properties: Vec<PropertySig> = self
                .types
                .get(&decl.name)
                .map(|t| t.properties.clone())
                .unwrap_or_default();
            for property in &properties {
                self.declare_binding(&property.name, property.ty.clone(), false);
            }
            self.function_stack.push(SsType::void());
            for stmt in deinit_body {
                self.check_stmt(stmt);
            }
            self.function_stack.pop();
            self.end_scope();
        }
        self.current_type_context = saved;
    }

    fn override_target_exists(&self, class_name: &str, method_name: &str) -> bool {
        let mut current = self.types.get(class_name).and_then(|t| t.superclass.clone());
        while let Some(name) = current {
            if let Some(entry) = self.types.get(&name) {
                if entry.method(method_name).is_some() {
                    return true;
                }
                current = entry.superclass.clone();
            } else {
                return false;
            }
        }
        false
    }

    fn check_struct_decl(&mut self, decl: &StructDecl) {
        if !decl.generic_params.is_empty() {
            // Templates are checked at specialization time.
            return;
        }
        self.check_conformances(&decl.name, decl.line);
        let saved = self.current_type_context.replace(decl.name.clone());
        self.check_type_properties(&decl.name, &decl.properties);
        for method in &decl.methods {
            self.check_method(&decl.name, method, false);
        }
        for initializer in &decl.initializers {
            self.check_method(&decl.name, initializer, true);
        }
        self.current_type_context = saved;
    }

    /// Checks a type's property declarations with `self` and the sibling
    /// properties in scope, so computed accessors and observers resolve
    /// implicit member references.
    fn check_type_properties(&mut self, type_name: &str, properties: &[VarDecl]) {
        self.begin_scope();
        self.declare_binding("self", SsType::named(type_name), true);
        let sigs: Vec<PropertySig> = self
            .types
            .get(type_name)
            .map(|t| t.properties.clone())
            .unwrap_or_default();
        for sig in &sigs {
            self.declare_binding(&sig.name, sig.ty.clone(), false);
        }
        for property in properties {
            self.check_var_decl(property, false);
        }
        self.end_scope();
    }

    fn check_enum_decl(&mut self, decl: &EnumDecl) {
        let saved = self.current_type_context.replace(decl.name.clone());
        self.check_type_properties(&decl.name, &decl.properties);
        for method in &decl.methods {
            self.check_method(&decl.name, method, false);
        }
        self.current_type_context = saved;
    }

    fn check_extension_decl(&mut self, decl: &ExtensionDecl) {
        if !self.types.contains_key(&decl.extended_type) {
            self.error(format!("Cannot extend unknown type '{}'", decl.extended_type), decl.line);
            return;
        }
        let saved = self.current_type_context.replace(decl.extended_type.clone());
        self.check_type_properties(&decl.extended_type.clone(), &decl.properties);
        for method in &decl.methods {
            self.check_method(&decl.extended_type.clone(), method, false);
        }
        for initializer in &decl.initializers {
            self.check_method(&decl.extended_type.clone(), initializer, true);
        }
        self.current_type_context = saved;
    }

    /// Verifies each declared protocol conformance is satisfiable: every
    /// requirement of the protocol (and its ancestors) must be present.
    fn check_conformances(&mut self, type_name: &str, line: u32) {
        let Some(entry) = self.types.get(type_name).cloned() else {
            return;
        };
        for conformance in &entry.conformances {
            let mut protocol_names = vec![conformance.clone()];
            self.collect_protocol_ancestors(conformance, &mut protocol_names, &mut AHashSet::new());
            for protocol_name in protocol_names {
                let Some(protocol) = self.protocols.get(&protocol_name).cloned() else {
                    if !self.types.contains_key(conformance) {
                        self.error(format!("Unknown protocol '{conformance}'"), line);
                    }
                    continue;
                };
                for required in &protocol.methods {
                    if entry.method(required).is_none() && !is_standard_protocol(&protocol_name) {
                        self.error(
                            format!("Type '{type_name}' does not implement required method '{required}' of protocol '{protocol_name}'"),
                            line,
                        );
                    }
                }
                for required in &protocol.properties {
                    if entry.property(required).is_none() && !is_standard_protocol(&protocol_name) {
                        self.error(
                            format!("Type '{type_name}' does not implement required property '{required}' of protocol '{protocol_name}'"),
                            line,
                        );
                    }
                }
            }
        }
    }

    // ---- Pass C: expressions ----

    #[must_use]
    fn infer_expr(&mut self, expr: &Expr) -> SsType {
        match expr {
            Expr::IntLiteral { .. } => SsType::named("Int"),
            Expr::FloatLiteral { .. } => SsType::named("Float"),
            Expr::StringLiteral { .. } => SsType::named("String"),
            Expr::BoolLiteral { .. } => SsType::named("Bool"),
            Expr::NilLiteral { .. } => SsType::named("Nil"),
            Expr::Grouping { inner, .. } => self.infer_expr(inner),
            Expr::Identifier { name, line } => {
                if let Some(binding) = self.lookup(name) {
                    return binding.ty.clone();
                }
                if self.types.contains_key(name) || self.protocols.contains_key(name) {
                    return SsType::named(name.clone());
                }
                if self.generic_param_in_scope(name) {
                    return SsType::unknown();
                }
                self.error(format!("Undefined variable '{name}'"), *line);
                SsType::unknown()
            }
            Expr::SelfExpr { line } => {
                if let Some(context) = &self.current_type_context {
                    SsType::named(context.clone())
                } else {
                    self.error("'self' outside of a type context", *line);
                    SsType::unknown()
                }
            }
            Expr::SuperExpr { line } => {
                let context = self.current_type_context.clone();
                let superclass = context
                    .as_deref()
                    .and_then(|name| self.types.get(name))
                    .and_then(|t| t.superclass.clone());
                match superclass {
                    Some(name) => SsType::named(name),
                    None => {
                        self.error("'super' requires a superclass", *line);
                        SsType::unknown()
                    }
                }
            }
            Expr::ImplicitMember { .. } => SsType::unknown(),
            Expr::GenericSpecialization { base, args, line } => {
                self.specialize_generic(base, args, *line);
                SsType::named(ast::mangle_generic(base, args))
            }
            Expr::Binary { op, left, right, line } => self.infer_binary(*op, left, right, *line),
            Expr::Unary { op, operand, line } => {
                let ty = self.infer_expr(operand);
                match op {
                    UnaryOp::Neg => {
                        if !ty.is_numeric() && !ty.is_unknown() && !ty.is_any() {
                            self.error(format!("Unary '-' requires a numeric operand, found '{ty}'"), *line);
                        }
                        ty
                    }
                    UnaryOp::Not => {
                        if ty.name != "Bool" && !ty.is_unknown() && !ty.is_any() {
                            self.error(format!("Unary '!' requires a 'Bool' operand, found '{ty}'"), *line);
                        }
                        SsType::named("Bool")
                    }
                    UnaryOp::BitNot => {
                        if ty.name != "Int" && !ty.is_unknown() && !ty.is_any() {
                            self.error(format!("Unary '~' requires an 'Int' operand, found '{ty}'"), *line);
                        }
                        SsType::named("Int")
                    }
                }
            }
            Expr::Assign { target, value, line } => {
                self.check_assignment_target(target, *line);
                let target_ty = self.infer_expr(target);
                let value_ty = self.infer_expr(value);
                if !self.assignable(&target_ty, &value_ty) {
                    self.error(format!("Cannot assign '{value_ty}' to '{target_ty}'"), *line);
                }
                SsType::void()
            }
            Expr::CompoundAssign { op, target, value, line } => {
                self.check_assignment_target(target, *line);
                let result = self.infer_binary(*op, target, value, *line);
                let target_ty = self.infer_expr(target);
                if !self.assignable(&target_ty, &result) {
                    self.error(format!("Cannot assign '{result}' to '{target_ty}'"), *line);
                }
                SsType::void()
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                line,
            } => {
                let cond = self.infer_expr(condition);
                if cond.name != "Bool" && !cond.is_unknown() && !cond.is_any() {
                    self.error(format!("Ternary condition must be 'Bool', found '{cond}'"), *line);
                }
                let then_ty = self.infer_expr(then_value);
                let else_ty = self.infer_expr(else_value);
                if then_ty == else_ty { then_ty } else { SsType::unknown() }
            }
            Expr::Call { callee, args, line } => self.infer_call(callee, args, *line),
            Expr::Member { object, name, line } => self.infer_member(object, name, *line, false),
            Expr::OptionalMember { object, name, line } => {
                let base = self.infer_member(object, name, *line, true);
                base.optional_of()
            }
            Expr::TupleIndex { object, .. } => {
                self.infer_expr(object);
                SsType::unknown()
            }
            Expr::ForceUnwrap { operand, line } => {
                let ty = self.infer_expr(operand);
                if !ty.optional && !ty.is_unknown() && !ty.is_any() {
                    self.error(format!("Cannot force-unwrap non-optional type '{ty}'"), *line);
                }
                ty.non_optional()
            }
            Expr::Subscript { object, index, .. } => {
                let object_ty = self.infer_expr(object);
                let _ = self.infer_expr(index);
                match object_ty.name.as_str() {
                    "Array" | "Dictionary" | "String" => SsType::unknown(),
                    _ => SsType::unknown(),
                }
            }
            Expr::ArrayLiteral { elements, .. } => {
                for element in elements {
                    self.infer_expr(element);
                }
                SsType::named("Array")
            }
            Expr::DictLiteral { entries, .. } => {
                for (key, value) in entries {
                    self.infer_expr(key);
                    self.infer_expr(value);
                }
                SsType::named("Dictionary")
            }
            Expr::TupleLiteral { elements, .. } => {
                for (_, element) in elements {
                    self.infer_expr(element);
                }
                SsType::named("Tuple")
            }
            Expr::Range { start, end, line, .. } => {
                let start_ty = self.infer_expr(start);
                let end_ty = self.infer_expr(end);
                for ty in [&start_ty, &end_ty] {
                    if ty.name != "Int" && !ty.is_unknown() && !ty.is_any() {
                        self.error(format!("Range bounds must be 'Int', found '{ty}'"), *line);
                    }
                }
                SsType::named("Range")
            }
            Expr::Closure {
                params,
                return_type,
                body,
                ..
            } => {
                let param_types: Vec<SsType> = params
                    .iter()
                    .map(|p| {
                        p.type_annotation
                            .as_ref()
                            .map_or_else(SsType::unknown, |a| self.type_from_annotation(a, true))
                    })
                    .collect();
                let ret = return_type
                    .as_ref()
                    .map_or_else(SsType::unknown, |a| self.type_from_annotation(a, true));
                self.begin_scope();
                for (param, ty) in params.iter().zip(&param_types) {
                    self.declare_binding(&param.name, ty.clone(), true);
                }
                self.function_stack.push(ret.clone());
                for stmt in body {
                    self.check_stmt(stmt);
                }
                self.function_stack.pop();
                self.end_scope();
                SsType::function(param_types, ret)
            }
            Expr::TypeCheck { value, target, .. } => {
                self.infer_expr(value);
                let _ = self.type_from_annotation(target, true);
                SsType::named("Bool")
            }
            Expr::TypeCast { value, target, kind, .. } => {
                self.infer_expr(value);
                let target_ty = self.type_from_annotation(target, true);
                match kind {
                    CastKind::Optional => target_ty.optional_of(),
                    CastKind::Plain | CastKind::Forced => target_ty,
                }
            }
        }
    }

    fn infer_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, line: u32) -> SsType {
        let left_ty = self.infer_expr(left);
        let right_ty = self.infer_expr(right);

        if op == BinaryOp::NilCoalesce {
            if !left_ty.optional && !left_ty.is_unknown() && !left_ty.is_any() && !left_ty.is_nil() {
                self.error(format!("Left side of '??' must be optional, found '{left_ty}'"), line);
            }
            return if left_ty.is_nil() || left_ty.is_unknown() {
                right_ty
            } else {
                left_ty.non_optional()
            };
        }

        // Operator overload on a user type: the left operand's type declares
        // a method named after the operator whose sole parameter accepts the
        // right operand.
        if let Some(entry) = self.types.get(&left_ty.name) {
            if !matches!(entry.kind, TypeKind::Builtin) {
                if let Some(method) = entry.method(op.symbol()) {
                    if method.params.len() == 1 {
                        let sig = method.clone();
                        if !self.assignable(&sig.params[0], &right_ty) {
                            self.error(
                                format!(
                                    "Operator '{}' on '{}' expects '{}', found '{right_ty}'",
                                    op.symbol(),
                                    left_ty.name,
                                    sig.params[0]
                                ),
                                line,
                            );
                        }
                        return sig.ret;
                    }
                }
            }
        }

        let loose = left_ty.is_unknown() || left_ty.is_any() || right_ty.is_unknown() || right_ty.is_any();

        match op {
            BinaryOp::Add => {
                if left_ty.name == "String" || right_ty.name == "String" {
                    return SsType::named("String");
                }
                if left_ty.name == "Array" && right_ty.name == "Array" {
                    return SsType::named("Array");
                }
                if loose {
                    return SsType::unknown();
                }
                if left_ty.is_numeric() && right_ty.is_numeric() {
                    return numeric_result(&left_ty, &right_ty);
                }
                self.error(format!("Invalid operands '{left_ty}' and '{right_ty}' for '+'"), line);
                SsType::unknown()
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                if loose {
                    return SsType::unknown();
                }
                if left_ty.is_numeric() && right_ty.is_numeric() {
                    return numeric_result(&left_ty, &right_ty);
                }
                self.error(
                    format!("Invalid operands '{left_ty}' and '{right_ty}' for '{}'", op.symbol()),
                    line,
                );
                SsType::unknown()
            }
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
                if !loose && !(left_ty.is_numeric() && right_ty.is_numeric()) && left_ty.name != right_ty.name {
                    self.error(
                        format!("Cannot compare '{left_ty}' and '{right_ty}' with '{}'", op.symbol()),
                        line,
                    );
                }
                SsType::named("Bool")
            }
            BinaryOp::Equal | BinaryOp::NotEqual => SsType::named("Bool"),
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
                for ty in [&left_ty, &right_ty] {
                    if ty.name != "Bool" && !ty.is_unknown() && !ty.is_any() {
                        self.error(
                            format!("Logical '{}' requires 'Bool' operands, found '{ty}'", op.symbol()),
                            line,
                        );
                    }
                }
                SsType::named("Bool")
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::LeftShift | BinaryOp::RightShift => {
                for ty in [&left_ty, &right_ty] {
                    if ty.name != "Int" && !ty.is_unknown() && !ty.is_any() {
                        self.error(
                            format!("Bitwise '{}' requires 'Int' operands, found '{ty}'", op.symbol()),
                            line,
                        );
                    }
                }
                SsType::named("Int")
            }
            BinaryOp::NilCoalesce => unreachable!("handled above"),
        }
    }

    fn check_assignment_target(&mut self, target: &Expr, line: u32) {
        match target {
            Expr::Identifier { name, .. } => {
                if let Some(binding) = self.lookup(name) {
                    if binding.is_let {
                        self.error(format!("Cannot assign to value: '{name}' is a 'let' constant"), line);
                    }
                }
            }
            Expr::Member { object, name, .. } => {
                let object_ty = self.infer_expr(object);
                if let Some(entry) = self.types.get(&object_ty.name) {
                    if let Some(property) = entry.property(name) {
                        let is_self_target = matches!(&**object, Expr::SelfExpr { .. });
                        if property.is_let && !(self.in_initializer && is_self_target) {
                            self.error(format!("Cannot assign to property: '{name}' is a 'let' constant"), line);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn infer_call(&mut self, callee: &Expr, args: &[ast::CallArg], line: u32) -> SsType {
        for arg in args {
            let _ = self.infer_expr(&arg.value);
        }

        match callee {
            // Method call: let/mutating enforcement plus member typing.
            Expr::Member { object, name, .. } => {
                let object_ty = self.infer_expr(object);

                // Calling a mutating method on a `let` instance.
                if let Expr::Identifier { name: object_name, .. } = &**object {
                    let is_let = self.lookup(object_name).is_some_and(|b| b.is_let);
                    if is_let {
                        let is_mutating = self
                            .types
                            .get(&object_ty.name)
                            .is_some_and(|t| t.mutating_methods.contains(name));
                        if is_mutating {
                            self.error(
                                format!("Cannot call mutating method '{name}' on 'let' constant '{object_name}'"),
                                line,
                            );
                        }
                    }
                }

                let member_ty = self.infer_member(object, name, line, false);
                call_result(&member_ty)
            }
            Expr::OptionalMember { object, name, line } => {
                let member_ty = self.infer_member(object, name, *line, true);
                call_result(&member_ty).optional_of()
            }
            Expr::Identifier { name, .. } => {
                // Constructor call on a type name.
                if self.types.contains_key(name) {
                    return SsType::named(name.clone());
                }
                let callee_ty = self.infer_expr(callee);
                call_result(&callee_ty)
            }
            Expr::GenericSpecialization { base, args: type_args, line } => {
                self.specialize_generic(base, type_args, *line);
                SsType::named(ast::mangle_generic(base, type_args))
            }
            Expr::ImplicitMember { .. } => SsType::unknown(),
            _ => {
                let callee_ty = self.infer_expr(callee);
                call_result(&callee_ty)
            }
        }
    }

    /// Member access typing plus access-control and optional-safety checks.
    fn infer_member(&mut self, object: &Expr, name: &str, line: u32, through_chain: bool) -> SsType {
        let object_ty = self.infer_expr(object);

        if object_ty.optional && !through_chain {
            self.error(
                format!("Value of optional type '{object_ty}' must be unwrapped to access member '{name}'"),
                line,
            );
        }

        if object_ty.is_unknown() || object_ty.is_any() || object_ty.name == "Tuple" {
            return SsType::unknown();
        }

        let Some(entry) = self.types.get(&object_ty.name) else {
            if self.protocols.contains_key(&object_ty.name) {
                return SsType::unknown();
            }
            return SsType::unknown();
        };

        // Enum case reference `Direction.north`.
        if entry.kind == TypeKind::Enum {
            if let Some(case) = entry.enum_cases.iter().find(|c| c.name == name) {
                let _ = case;
                return SsType::named(&object_ty.name);
            }
            if name == "rawValue" {
                return SsType::unknown();
            }
        }

        if let Some(property) = entry.property(name) {
            let access = property.access;
            let ty = property.ty.clone();
            self.enforce_access(access, &object_ty.name, name, line);
            return ty;
        }
        if let Some(method) = entry.method(name) {
            let access = method.access;
            let ty = SsType::function(method.params.clone(), method.ret.clone());
            self.enforce_access(access, &object_ty.name, name, line);
            return ty;
        }

        // Walk the class hierarchy.
        let mut current = entry.superclass.clone();
        while let Some(super_name) = current {
            let Some(super_entry) = self.types.get(&super_name) else {
                break;
            };
            if let Some(property) = super_entry.property(name) {
                let access = property.access;
                let ty = property.ty.clone();
                self.enforce_access(access, &super_name, name, line);
                return ty;
            }
            if let Some(method) = super_entry.method(name) {
                let access = method.access;
                let ty = SsType::function(method.params.clone(), method.ret.clone());
                self.enforce_access(access, &super_name, name, line);
                return ty;
            }
            current = super_entry.superclass.clone();
        }

        SsType::unknown()
    }

    /// Only the private / non-private boundary is enforced; `public`,
    /// `internal`, and `fileprivate` all behave as internal.
    fn enforce_access(&mut self, access: AccessLevel, owner: &str, member: &str, line: u32) {
        if access.is_private() && self.current_type_context.as_deref() != Some(owner) {
            self.error(
                format!("'{member}' is inaccessible due to 'private' protection level"),
                line,
            );
        }
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn numeric_result(left: &SsType, right: &SsType) -> SsType {
    if left.name == "Float" || right.name == "Float" {
        SsType::named("Float")
    } else {
        SsType::named("Int")
    }
}

fn call_result(callee: &SsType) -> SsType {
    match &callee.ret {
        Some(ret) => (**ret).clone(),
        None => SsType::unknown(),
    }
}

fn is_standard_protocol(name: &str) -> bool {
    matches!(
        name,
        "Equatable" | "Comparable" | "Hashable" | "Numeric" | "SignedNumeric" | "CustomStringConvertible"
    )
}

fn is_constant_default(expr: &Expr) -> bool {
    match expr {
        Expr::IntLiteral { .. }
        | Expr::FloatLiteral { .. }
        | Expr::StringLiteral { .. }
        | Expr::BoolLiteral { .. }
        | Expr::NilLiteral { .. } => true,
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
            ..
        } => is_constant_default(operand),
        _ => false,
    }
}

/// Whether a statement list statically exits (for `guard` else validation):
/// ends in `return`/`throw`, a block that exits, or an `if` whose both
/// branches exit.
#[must_use]
pub fn block_exits(statements: &[Stmt]) -> bool {
    statements.last().is_some_and(stmt_exits)
}

fn stmt_exits(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return { .. } | Stmt::Throw { .. } => true,
        Stmt::Block { statements, .. } => block_exits(statements),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => block_exits(then_branch) && else_branch.as_ref().is_some_and(|b| block_exits(b)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{lexer::Lexer, parse::parse};

    fn analyze_source(source: &str) -> Result<Analysis, TypeCheckError> {
        let program = parse(Lexer::new(source).tokenize_all()).expect("parse failed");
        analyze(&program)
    }

    fn first_error(source: &str) -> String {
        analyze_source(source).expect_err("expected type error").diagnostics[0]
            .message
            .clone()
    }

    #[test]
    fn let_reassignment_is_rejected() {
        let message = first_error("let x = 10\nx = 20");
        assert!(message.contains("let"), "{message}");
        assert!(message.contains("constant"), "{message}");
    }

    #[test]
    fn var_reassignment_is_fine() {
        assert!(analyze_source("var x = 10\nx = 20").is_ok());
    }

    #[test]
    fn mutating_method_on_let_struct() {
        let source = "struct C { var n: Int = 0\n mutating func inc() { self.n = self.n + 1 } }\nlet c = C()\nc.inc()";
        let message = first_error(source);
        assert!(message.contains("mutating"), "{message}");
        assert!(message.contains("let"), "{message}");
    }

    #[test]
    fn private_member_access_is_rejected() {
        let source = "class P { private var ssn = \"X\"\n var name = \"John\" }\nvar p = P()\nprint(p.ssn)";
        let message = first_error(source);
        assert!(message.contains("private"), "{message}");
        assert!(message.contains("inaccessible"), "{message}");
    }

    #[test]
    fn private_member_inside_type_is_fine() {
        let source = "class P { private var ssn = \"X\"\n func show() -> String { return self.ssn } }";
        assert!(analyze_source(source).is_ok());
    }

    #[test]
    fn undefined_variable() {
        let message = first_error("print(zebra)");
        assert!(message.contains("Undefined variable"), "{message}");
    }

    #[test]
    fn arithmetic_type_errors() {
        let message = first_error("let a = true + 1");
        assert!(message.contains("+"), "{message}");
    }

    #[test]
    fn string_concatenation_is_fine() {
        assert!(analyze_source("let s = \"a\" + \"b\"").is_ok());
    }

    #[test]
    fn nil_coalesce_requires_optional() {
        let message = first_error("let a = 1 ?? 2");
        assert!(message.contains("??"), "{message}");
    }

    #[test]
    fn guard_else_must_exit() {
        let source = "func f(x: Int?) -> Int { guard let v = x else { print(1) } \n return v }";
        let message = first_error(source);
        assert!(message.contains("guard"), "{message}");
    }

    #[test]
    fn guard_with_return_is_fine() {
        let source = "func f(x: Int?) -> Int { guard let v = x else { return 0 } \n return v }";
        assert!(analyze_source(source).is_ok());
    }

    #[test]
    fn break_outside_loop() {
        let message = first_error("break");
        assert!(message.contains("loop"), "{message}");
    }

    #[test]
    fn generic_constraint_violation() {
        let source = "protocol Summable { func total() -> Int }\nstruct Box<T> where T: Summable { var value: T? = nil }\nclass Plain { }\nvar b = Box<Plain>()";
        let message = first_error(source);
        assert!(message.contains("conform"), "{message}");
    }

    #[test]
    fn generic_specialization_registers_mangled_type() {
        let source = "struct Box<T> { var value: T? = nil }\nvar b = Box<Int>()";
        let analysis = analyze_source(source).expect("analysis succeeds");
        assert_eq!(analysis.specializations.get("Box"), Some(&vec!["Box_Int".to_owned()]));
    }

    #[test]
    fn obsolete_attribute_errors_deprecated_warns() {
        let source = "attribute Legacy(reason)\n[Deprecated]\nvar old = 1\n[Obsolete]\nvar gone = 2";
        let result = analyze_source(source);
        let err = result.expect_err("obsolete is an error");
        assert!(err.diagnostics[0].message.contains("obsolete"));
    }

    #[test]
    fn errors_aggregate_across_statements() {
        let err = analyze_source("let a = 1\na = 2\na = 3").expect_err("two errors");
        assert_eq!(err.diagnostics.len(), 2);
    }

    #[test]
    fn return_type_mismatch() {
        let message = first_error("func f() -> Int { return \"no\" }");
        assert!(message.contains("return"), "{message}");
    }

    #[test]
    fn protocol_conformance_missing_method() {
        let source = "protocol Greet { func hello() -> String }\nclass C: Greet { }";
        let message = first_error(source);
        assert!(message.contains("hello"), "{message}");
    }

    #[test]
    fn protocol_inheritance_transitive_conformance() {
        let source = "protocol A { }\nprotocol B: A { }\nstruct S: B { }\nfunc f<T>(x: Int) { }";
        assert!(analyze_source(source).is_ok());
    }
}
