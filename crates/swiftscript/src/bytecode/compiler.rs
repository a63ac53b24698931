//! AST → bytecode compiler.
//!
//! A stack of function states mirrors lexical function nesting; free
//! identifiers resolve through enclosing states into upvalue descriptors.
//! The compiler assumes an analyzer-checked AST but keeps its own structural
//! checks (capacity limits, misplaced constructs) as [`CompilerError`]s.
//!
//! After the main walk, a metadata pass builds the type / method / field /
//! property tables and the packed signature blob that drive reflection,
//! `is` / `as`, and static-property resolution at runtime.

use ahash::AHashMap;
use indexmap::IndexMap;

use super::{
    assembly::{
        Assembly, DefaultValue, FieldDef, FunctionPrototype, MethodDef, NO_INDEX, PropertyDef, ProtocolDef,
        TableSlice, TypeDef, UpvalueDescriptor, field_flags, method_flags, type_flags,
    },
    builder::{ChunkBuilder, JumpLabel},
    op::Opcode,
};
use crate::{
    analyze::Analysis,
    ast::{
        self, AccessLevel, BinaryOp, CallArg, CastKind, ClassDecl, EnumDecl, Expr, ExtensionDecl, FuncDecl, Param,
        Pattern, ProtocolDecl, Stmt, StructDecl, SwitchCase, UnaryOp, VarDecl,
    },
    error::CompilerError,
    intern::StringId,
    modules::ModuleUnit,
    value::{RefKind, Value},
};

type CompileResult<T> = Result<T, CompilerError>;

const MAX_SLOTS: usize = u16::MAX as usize;

/// One compile-time local variable.
#[derive(Debug)]
struct Local {
    name: String,
    depth: u32,
    is_captured: bool,
}

/// Book-keeping for the loop currently being compiled.
#[derive(Debug, Default)]
struct LoopContext {
    start: usize,
    scope_depth: u32,
    break_jumps: Vec<JumpLabel>,
    continue_jumps: Vec<JumpLabel>,
}

/// Per-type context while compiling method bodies: drives implicit-self
/// property access and `super` resolution.
#[derive(Debug, Clone, Default)]
struct TypeContext {
    type_name: String,
    property_names: Vec<String>,
    static_property_names: Vec<String>,
    has_super: bool,
    is_struct: bool,
}

/// One function being compiled.
#[derive(Debug)]
struct FnState {
    builder: ChunkBuilder,
    locals: Vec<Local>,
    scope_depth: u32,
    upvalues: Vec<UpvalueDescriptor>,
    loops: Vec<LoopContext>,
    type_context: Option<TypeContext>,
    in_mutating_method: bool,
    is_initializer: bool,
    has_receiver: bool,
}

impl FnState {
    fn new(type_context: Option<TypeContext>) -> Self {
        Self {
            builder: ChunkBuilder::new(),
            locals: Vec::new(),
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            type_context,
            in_mutating_method: false,
            is_initializer: false,
            has_receiver: false,
        }
    }
}

/// Where an entry point was found.
#[derive(Debug, Clone)]
enum EntryPoint {
    GlobalMain,
    StaticMain { type_name: String },
}

/// Collected member info per type for the metadata pass.
#[derive(Debug, Default)]
struct TypeMetadata {
    flags: u32,
    base: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<(String, u32, String)>,
    /// (name, flags, params, return, body_key)
    methods: Vec<MethodMetadata>,
    /// (name, flags, type name, getter key, setter key)
    properties: Vec<(String, u32, String, Option<String>, Option<String>)>,
}

#[derive(Debug)]
struct MethodMetadata {
    name: String,
    flags: u32,
    param_types: Vec<String>,
    return_type: String,
    body_key: String,
}

pub struct Compiler<'a> {
    analysis: &'a Analysis,
    assembly: Assembly,
    states: Vec<FnState>,
    /// `Type::[static ]name` → compiled prototype index.
    method_keys: AHashMap<String, u16>,
    /// Per-type member info for the metadata pass, in declaration order.
    type_metadata: IndexMap<String, TypeMetadata>,
    type_name_ids: AHashMap<String, u32>,
    entry: Option<EntryPoint>,
}

/// Compiles analyzed module units into a self-contained assembly.
pub fn compile(units: &[ModuleUnit], analysis: &Analysis) -> CompileResult<Assembly> {
    let mut compiler = Compiler::new(analysis);
    compiler.run(units)
}

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(analysis: &'a Analysis) -> Self {
        Self {
            analysis,
            assembly: Assembly::default(),
            states: vec![FnState::new(None)],
            method_keys: AHashMap::new(),
            type_metadata: IndexMap::new(),
            type_name_ids: AHashMap::new(),
            entry: None,
        }
    }

    fn run(mut self, units: &[ModuleUnit]) -> CompileResult<Assembly> {
        for unit in units {
            for stmt in &unit.statements {
                self.compile_stmt(stmt)?;
            }
            if let Some(stem) = &unit.stem {
                self.emit_namespace_map(stem, &unit.statements)?;
            }
        }

        self.synthesize_entry_call()?;
        let state = self.states.pop().expect("top-level state");
        let mut builder = state.builder;
        builder.emit(Opcode::Nil);
        builder.emit(Opcode::Halt);
        self.assembly.code = builder.build();

        self.populate_metadata(units)?;
        Ok(self.assembly)
    }

    // ---- State helpers ----

    fn state(&mut self) -> &mut FnState {
        self.states.last_mut().expect("state stack is never empty")
    }

    fn builder(&mut self) -> &mut ChunkBuilder {
        &mut self.state().builder
    }

    fn is_global_context(&self) -> bool {
        self.states.len() == 1 && self.states[0].scope_depth == 0
    }

    fn intern(&mut self, s: &str) -> CompileResult<StringId> {
        self.assembly.strings.intern(s)
    }

    fn add_constant(&mut self, value: Value, line: u32) -> CompileResult<u16> {
        // Reuse identical constants; the pool is small and scanned linearly.
        if let Some(existing) = self.assembly.constants.iter().position(|c| *c == value) {
            return Ok(existing as u16);
        }
        let index = self.assembly.constants.len();
        if index >= MAX_SLOTS {
            return Err(CompilerError::new("constant pool exceeds 65535 entries", line));
        }
        self.assembly.constants.push(value);
        Ok(index as u16)
    }

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let state = self.state();
        state.scope_depth -= 1;
        let depth = state.scope_depth;
        while let Some(local) = state.locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            state.locals.pop();
            if captured {
                state.builder.emit(Opcode::CloseUpvalue);
            } else {
                state.builder.emit(Opcode::Pop);
            }
        }
    }

    /// Emits pops for locals deeper than `depth` without forgetting them;
    /// used by `break`/`continue` which jump out of nested scopes.
    fn discard_locals_deeper_than(&mut self, depth: u32) {
        let state = self.state();
        let ops: Vec<bool> = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for captured in ops {
            if captured {
                state.builder.emit(Opcode::CloseUpvalue);
            } else {
                state.builder.emit(Opcode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str, line: u32) -> CompileResult<u16> {
        let state = self.state();
        if state.locals.len() >= MAX_SLOTS {
            return Err(CompilerError::new("too many locals in one function", line));
        }
        let depth = state.scope_depth;
        state.locals.push(Local {
            name: name.to_owned(),
            depth,
            is_captured: false,
        });
        Ok((state.locals.len() - 1) as u16)
    }

    fn resolve_local_in(&self, state_index: usize, name: &str) -> Option<u16> {
        self.states[state_index]
            .locals
            .iter()
            .rposition(|local| local.name == name)
            .map(|i| i as u16)
    }

    fn resolve_local(&self, name: &str) -> Option<u16> {
        self.resolve_local_in(self.states.len() - 1, name)
    }

    fn resolve_upvalue(&mut self, state_index: usize, name: &str, line: u32) -> CompileResult<Option<u16>> {
        if state_index == 0 {
            return Ok(None);
        }
        let parent = state_index - 1;
        if let Some(local_index) = self.resolve_local_in(parent, name) {
            self.states[parent].locals[usize::from(local_index)].is_captured = true;
            return Ok(Some(self.add_upvalue(state_index, local_index, true, line)?));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(parent, name, line)? {
            return Ok(Some(self.add_upvalue(state_index, upvalue_index, false, line)?));
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, state_index: usize, index: u16, is_local: bool, line: u32) -> CompileResult<u16> {
        let upvalues = &mut self.states[state_index].upvalues;
        if let Some(existing) = upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return Ok(existing as u16);
        }
        if upvalues.len() >= MAX_SLOTS {
            return Err(CompilerError::new("too many captured variables in one closure", line));
        }
        upvalues.push(UpvalueDescriptor { index, is_local });
        Ok((upvalues.len() - 1) as u16)
    }

    // ---- Statements ----

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let line = stmt.line();
        self.builder().set_line(line);
        match stmt {
            Stmt::Expression { expr, .. } => {
                self.compile_expr(expr)?;
                self.builder().emit(Opcode::Pop);
            }
            Stmt::Print { expr, .. } => {
                self.compile_expr(expr)?;
                self.builder().emit(Opcode::Print);
            }
            Stmt::Var(decl) => self.compile_var_stmt(decl, line)?,
            Stmt::TupleDestructure { names, value, line, .. } => {
                self.compile_tuple_destructure(names, value, *line)?;
            }
            Stmt::Func(decl) => {
                if decl.name == "main" && decl.params.is_empty() && self.entry.is_none() && self.is_global_context() {
                    self.entry = Some(EntryPoint::GlobalMain);
                }
                let proto = self.compile_function(
                    &decl.name,
                    &decl.params,
                    &decl.body,
                    FunctionOptions {
                        has_receiver: false,
                        is_initializer: false,
                        is_override: decl.is_override,
                        is_mutating: false,
                        type_context: None,
                    },
                    decl.line,
                )?;
                self.emit_function_value(proto, decl.line)?;
                self.define_slot(&decl.name, decl.line)?;
            }
            Stmt::Class(decl) => self.compile_class(decl)?,
            Stmt::Struct(decl) => self.compile_struct_or_specializations(decl)?,
            Stmt::Enum(decl) => self.compile_enum(decl)?,
            Stmt::Protocol(decl) => self.compile_protocol(decl)?,
            Stmt::Extension(decl) => self.compile_extension(decl)?,
            Stmt::AttributeDecl { .. } => {}
            Stmt::Import { line, .. } => {
                return Err(CompilerError::new("imports must be expanded before compilation", *line));
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.begin_scope();
                for stmt in then_branch {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                let end_jump = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(else_jump, *line)?;
                if let Some(else_branch) = else_branch {
                    self.begin_scope();
                    for stmt in else_branch {
                        self.compile_stmt(stmt)?;
                    }
                    self.end_scope();
                }
                self.builder().patch_jump(end_jump, *line)?;
            }
            Stmt::IfLet {
                name,
                value,
                then_branch,
                else_branch,
                line,
            } => {
                self.compile_expr(value)?;
                let else_jump = self.builder().emit_jump(Opcode::JumpIfNil);
                // Non-nil: the unwrapped value on the stack becomes the binding.
                self.begin_scope();
                self.add_local(name, *line)?;
                for stmt in then_branch {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                let end_jump = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(else_jump, *line)?;
                self.builder().adjust_stack(-1); // JumpIfNil popped the value here
                if let Some(else_branch) = else_branch {
                    self.begin_scope();
                    for stmt in else_branch {
                        self.compile_stmt(stmt)?;
                    }
                    self.end_scope();
                }
                self.builder().patch_jump(end_jump, *line)?;
            }
            Stmt::GuardLet {
                name,
                value,
                else_branch,
                line,
            } => {
                self.compile_expr(value)?;
                let else_jump = self.builder().emit_jump(Opcode::JumpIfNil);
                // The else branch compiles before the binding is registered
                // so its slot indices are not shifted by a local that only
                // exists on the non-nil path.
                let bind_jump = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(else_jump, *line)?;
                self.builder().adjust_stack(-1);
                self.begin_scope();
                for stmt in else_branch {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                self.builder().patch_jump(bind_jump, *line)?;
                // Non-nil: the unwrapped value becomes a binding in the
                // *enclosing* scope and survives past the guard.
                if self.is_global_context() {
                    let name_id = self.intern(name)?;
                    self.builder().emit_u16(Opcode::DefineGlobal, name_id.0);
                } else {
                    self.add_local(name, *line)?;
                }
            }
            Stmt::While { condition, body, line } => {
                let loop_start = self.builder().current_offset();
                self.compile_expr(condition)?;
                let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.push_loop(loop_start);
                self.begin_scope();
                for stmt in body {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                let ctx = self.pop_loop();
                for jump in &ctx.continue_jumps {
                    self.builder().patch_jump(*jump, *line)?;
                }
                self.builder().emit_loop(loop_start, *line)?;
                self.builder().patch_jump(exit_jump, *line)?;
                for jump in &ctx.break_jumps {
                    self.builder().patch_jump(*jump, *line)?;
                }
            }
            Stmt::RepeatWhile { body, condition, line } => {
                let loop_start = self.builder().current_offset();
                self.push_loop(loop_start);
                self.begin_scope();
                for stmt in body {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                let ctx = self.pop_loop();
                for jump in &ctx.continue_jumps {
                    self.builder().patch_jump(*jump, *line)?;
                }
                self.compile_expr(condition)?;
                let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.builder().emit_loop(loop_start, *line)?;
                self.builder().patch_jump(exit_jump, *line)?;
                for jump in &ctx.break_jumps {
                    self.builder().patch_jump(*jump, *line)?;
                }
            }
            Stmt::ForIn {
                variable,
                iterable,
                where_clause,
                body,
                line,
            } => {
                self.compile_for_in(variable, iterable, where_clause.as_ref(), body, *line)?;
            }
            Stmt::Switch {
                value,
                cases,
                default,
                line,
            } => self.compile_switch(value, cases, default.as_deref(), *line)?,
            Stmt::Break { line } => {
                let Some(depth) = self.state().loops.last().map(|l| l.scope_depth) else {
                    return Err(CompilerError::new("'break' outside of a loop", *line));
                };
                self.discard_locals_deeper_than(depth);
                let jump = self.builder().emit_jump(Opcode::Jump);
                self.state().loops.last_mut().expect("loop exists").break_jumps.push(jump);
            }
            Stmt::Continue { line } => {
                let Some(depth) = self.state().loops.last().map(|l| l.scope_depth) else {
                    return Err(CompilerError::new("'continue' outside of a loop", *line));
                };
                self.discard_locals_deeper_than(depth);
                let jump = self.builder().emit_jump(Opcode::Jump);
                self.state()
                    .loops
                    .last_mut()
                    .expect("loop exists")
                    .continue_jumps
                    .push(jump);
            }
            Stmt::Return { value, line } => {
                if self.states.len() == 1 {
                    return Err(CompilerError::new("'return' outside of a function", *line));
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.builder().emit(Opcode::Nil),
                }
                self.builder().emit(Opcode::Return);
            }
            Stmt::Throw { value, .. } => {
                self.compile_expr(value)?;
                self.builder().emit(Opcode::Throw);
            }
            Stmt::Block { statements, .. } => {
                self.begin_scope();
                for stmt in statements {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
            }
        }
        Ok(())
    }

    fn push_loop(&mut self, start: usize) {
        let depth = self.state().scope_depth;
        self.state().loops.push(LoopContext {
            start,
            scope_depth: depth,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
    }

    fn pop_loop(&mut self) -> LoopContext {
        self.state().loops.pop().expect("loop context exists")
    }

    /// Defines the value on top of the stack under `name`: a global in
    /// global context, otherwise a new local slot.
    fn define_slot(&mut self, name: &str, line: u32) -> CompileResult<()> {
        if self.is_global_context() {
            let name_id = self.intern(name)?;
            self.builder().emit_u16(Opcode::DefineGlobal, name_id.0);
        } else {
            self.add_local(name, line)?;
        }
        Ok(())
    }

    fn compile_var_stmt(&mut self, decl: &VarDecl, line: u32) -> CompileResult<()> {
        if decl.is_computed() || decl.has_observers() {
            return Err(CompilerError::new(
                "computed properties and observers are only supported inside type declarations",
                line,
            ));
        }
        match &decl.initializer {
            Some(initializer) => {
                self.compile_expr(initializer)?;
                self.builder().emit(Opcode::CopyValue);
            }
            None => self.builder().emit(Opcode::Nil),
        }
        self.define_slot(&decl.name, line)
    }

    fn compile_tuple_destructure(&mut self, names: &[String], value: &Expr, line: u32) -> CompileResult<()> {
        self.compile_expr(value)?;
        if self.is_global_context() {
            for (index, name) in names.iter().enumerate() {
                self.builder().emit(Opcode::Dup);
                self.builder().emit_u16(Opcode::GetTupleIndex, index as u16);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::DefineGlobal, name_id.0);
            }
            self.builder().emit(Opcode::Pop);
        } else {
            let tuple_slot = self.add_local("$destructure", line)?;
            for (index, name) in names.iter().enumerate() {
                self.builder().emit_u16(Opcode::GetLocal, tuple_slot);
                self.builder().emit_u16(Opcode::GetTupleIndex, index as u16);
                self.add_local(name, line)?;
            }
        }
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        variable: &str,
        iterable: &Expr,
        where_clause: Option<&Expr>,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        if let Expr::Range {
            start,
            end,
            inclusive,
            ..
        } = iterable
        {
            return self.compile_for_range(variable, start, end, *inclusive, where_clause, body, line);
        }
        self.compile_for_sequence(variable, iterable, where_clause, body, line)
    }

    /// `for v in a...b` counts in place, no range object is built.
    #[expect(clippy::too_many_arguments, reason = "loop lowering carries the full clause set")]
    fn compile_for_range(
        &mut self,
        variable: &str,
        start: &Expr,
        end: &Expr,
        inclusive: bool,
        where_clause: Option<&Expr>,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        self.begin_scope();
        self.compile_expr(start)?;
        let var_slot = self.add_local(variable, line)?;
        self.compile_expr(end)?;
        self.add_local("$end", line)?;
        let end_slot = var_slot + 1;

        let loop_start = self.builder().current_offset();
        self.builder().emit_u16(Opcode::GetLocal, var_slot);
        self.builder().emit_u16(Opcode::GetLocal, end_slot);
        self.builder().emit(if inclusive { Opcode::LessEqual } else { Opcode::Less });
        let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);

        let mut where_skip = None;
        if let Some(clause) = where_clause {
            self.compile_expr(clause)?;
            where_skip = Some(self.builder().emit_jump(Opcode::JumpIfFalse));
        }

        self.push_loop(loop_start);
        self.begin_scope();
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.end_scope();
        let ctx = self.pop_loop();

        for jump in &ctx.continue_jumps {
            self.builder().patch_jump(*jump, line)?;
        }
        if let Some(skip) = where_skip {
            self.builder().patch_jump(skip, line)?;
        }
        // Increment and loop.
        self.builder().emit_u16(Opcode::GetLocal, var_slot);
        let one = self.add_constant(Value::Int(1), line)?;
        self.builder().emit_u16(Opcode::Constant, one);
        self.builder().emit(Opcode::Add);
        self.builder().emit_u16(Opcode::SetLocal, var_slot);
        self.builder().emit(Opcode::Pop);
        self.builder().emit_loop(loop_start, line)?;

        self.builder().patch_jump(exit_jump, line)?;
        for jump in &ctx.break_jumps {
            self.builder().patch_jump(*jump, line)?;
        }
        self.end_scope();
        Ok(())
    }

    /// `for v in seq` iterates by index over `seq.count`.
    fn compile_for_sequence(
        &mut self,
        variable: &str,
        iterable: &Expr,
        where_clause: Option<&Expr>,
        body: &[Stmt],
        line: u32,
    ) -> CompileResult<()> {
        self.begin_scope();
        self.compile_expr(iterable)?;
        let array_slot = self.add_local("$array", line)?;
        let zero = self.add_constant(Value::Int(0), line)?;
        self.builder().emit_u16(Opcode::Constant, zero);
        let index_slot = self.add_local("$index", line)?;
        self.builder().emit(Opcode::Nil);
        let var_slot = self.add_local(variable, line)?;

        let loop_start = self.builder().current_offset();
        self.builder().emit_u16(Opcode::GetLocal, index_slot);
        self.builder().emit_u16(Opcode::GetLocal, array_slot);
        let count_id = self.intern("count")?;
        self.builder().emit_u16(Opcode::GetProperty, count_id.0);
        self.builder().emit(Opcode::Less);
        let exit_jump = self.builder().emit_jump(Opcode::JumpIfFalse);

        self.builder().emit_u16(Opcode::GetLocal, array_slot);
        self.builder().emit_u16(Opcode::GetLocal, index_slot);
        self.builder().emit(Opcode::GetSubscript);
        self.builder().emit_u16(Opcode::SetLocal, var_slot);
        self.builder().emit(Opcode::Pop);

        let mut where_skip = None;
        if let Some(clause) = where_clause {
            self.compile_expr(clause)?;
            where_skip = Some(self.builder().emit_jump(Opcode::JumpIfFalse));
        }

        self.push_loop(loop_start);
        self.begin_scope();
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.end_scope();
        let ctx = self.pop_loop();

        for jump in &ctx.continue_jumps {
            self.builder().patch_jump(*jump, line)?;
        }
        if let Some(skip) = where_skip {
            self.builder().patch_jump(skip, line)?;
        }
        self.builder().emit_u16(Opcode::GetLocal, index_slot);
        let one = self.add_constant(Value::Int(1), line)?;
        self.builder().emit_u16(Opcode::Constant, one);
        self.builder().emit(Opcode::Add);
        self.builder().emit_u16(Opcode::SetLocal, index_slot);
        self.builder().emit(Opcode::Pop);
        self.builder().emit_loop(loop_start, line)?;

        self.builder().patch_jump(exit_jump, line)?;
        for jump in &ctx.break_jumps {
            self.builder().patch_jump(*jump, line)?;
        }
        self.end_scope();
        Ok(())
    }

    fn compile_switch(
        &mut self,
        value: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
        line: u32,
    ) -> CompileResult<()> {
        self.begin_scope();
        self.compile_expr(value)?;
        let subject_slot = self.add_local("$switch", line)?;

        let mut end_jumps = Vec::new();
        for case in cases {
            // Each pattern yields a Bool; multiple patterns OR together.
            for (index, pattern) in case.patterns.iter().enumerate() {
                self.compile_pattern_test(pattern, subject_slot)?;
                if index > 0 {
                    self.builder().emit(Opcode::Or);
                }
            }
            let next_case = self.builder().emit_jump(Opcode::JumpIfFalse);

            self.begin_scope();
            if let [Pattern::EnumCase { bindings, .. }] = case.patterns.as_slice() {
                for (index, binding) in bindings.iter().enumerate() {
                    if let Some(name) = &binding.name {
                        self.builder().emit_u16(Opcode::GetLocal, subject_slot);
                        self.builder().emit_u16(Opcode::GetAssociated, index as u16);
                        self.add_local(name, case.line)?;
                    }
                }
            }
            for stmt in &case.body {
                self.compile_stmt(stmt)?;
            }
            self.end_scope();
            end_jumps.push(self.builder().emit_jump(Opcode::Jump));
            self.builder().patch_jump(next_case, case.line)?;
        }

        if let Some(default) = default {
            self.begin_scope();
            for stmt in default {
                self.compile_stmt(stmt)?;
            }
            self.end_scope();
        }

        for jump in end_jumps {
            self.builder().patch_jump(jump, line)?;
        }
        self.end_scope();
        Ok(())
    }

    fn compile_pattern_test(&mut self, pattern: &Pattern, subject_slot: u16) -> CompileResult<()> {
        match pattern {
            Pattern::EnumCase { name, line, .. } => {
                self.builder().set_line(*line);
                self.builder().emit_u16(Opcode::GetLocal, subject_slot);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::MatchEnumCase, name_id.0);
            }
            Pattern::Expression { expr, line } => {
                self.builder().set_line(*line);
                if let Expr::Range {
                    start,
                    end,
                    inclusive,
                    ..
                } = expr
                {
                    // subject >= start && subject <(=) end
                    self.builder().emit_u16(Opcode::GetLocal, subject_slot);
                    self.compile_expr(start)?;
                    self.builder().emit(Opcode::GreaterEqual);
                    self.builder().emit_u16(Opcode::GetLocal, subject_slot);
                    self.compile_expr(end)?;
                    self.builder().emit(if *inclusive { Opcode::LessEqual } else { Opcode::Less });
                    self.builder().emit(Opcode::And);
                } else {
                    self.builder().emit_u16(Opcode::GetLocal, subject_slot);
                    self.compile_expr(expr)?;
                    self.builder().emit(Opcode::Equal);
                }
            }
        }
        Ok(())
    }

    // ---- Expressions ----

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        self.builder().set_line(expr.line());
        match expr {
            Expr::IntLiteral { value, line } => {
                let index = self.add_constant(Value::Int(*value), *line)?;
                self.builder().emit_u16(Opcode::Constant, index);
            }
            Expr::FloatLiteral { value, line } => {
                let index = self.add_constant(Value::Float(*value), *line)?;
                self.builder().emit_u16(Opcode::Constant, index);
            }
            Expr::BoolLiteral { value, .. } => {
                self.builder().emit(if *value { Opcode::True } else { Opcode::False });
            }
            Expr::NilLiteral { .. } => self.builder().emit(Opcode::Nil),
            Expr::StringLiteral { value, .. } => {
                let id = self.intern(value)?;
                self.builder().emit_u16(Opcode::String, id.0);
            }
            Expr::Grouping { inner, .. } => self.compile_expr(inner)?,
            Expr::Identifier { name, line } => self.compile_identifier_get(name, *line)?,
            Expr::SelfExpr { line } => {
                if self.state().has_receiver {
                    self.builder().emit_u16(Opcode::GetLocal, 0);
                } else {
                    return Err(CompilerError::new("'self' outside of a method", *line));
                }
            }
            Expr::SuperExpr { line } => {
                return Err(CompilerError::new("'super' must be followed by a member access", *line));
            }
            Expr::ImplicitMember { name, line } => {
                return Err(CompilerError::new(
                    format!("cannot infer the enum type for '.{name}'; spell it 'Type.{name}'"),
                    *line,
                ));
            }
            Expr::GenericSpecialization { base, args, line } => {
                let mangled = ast::mangle_generic(base, args);
                self.compile_identifier_get(&mangled, *line)?;
            }
            Expr::Binary { op, left, right, .. } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.builder().emit(binary_opcode(*op));
            }
            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand)?;
                self.builder().emit(match op {
                    UnaryOp::Neg => Opcode::Negate,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitwiseNot,
                });
            }
            Expr::Assign { target, value, line } => self.compile_assignment(target, value, *line)?,
            Expr::CompoundAssign { op, target, value, line } => {
                self.compile_compound_assignment(*op, target, value, *line)?;
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                line,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.compile_expr(then_value)?;
                let end_jump = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(else_jump, *line)?;
                self.builder().adjust_stack(-1); // both arms produce one value
                self.compile_expr(else_value)?;
                self.builder().patch_jump(end_jump, *line)?;
            }
            Expr::Call { callee, args, line } => self.compile_call(callee, args, *line)?,
            Expr::Member { object, name, line } => {
                if matches!(**object, Expr::SuperExpr { .. }) {
                    self.compile_super_access(name, *line)?;
                } else {
                    self.compile_expr(object)?;
                    let name_id = self.intern(name)?;
                    self.builder().emit_u16(Opcode::GetProperty, name_id.0);
                }
            }
            Expr::OptionalMember { object, name, .. } => {
                self.compile_expr(object)?;
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::OptionalChain, name_id.0);
            }
            Expr::TupleIndex { object, index, .. } => {
                self.compile_expr(object)?;
                self.builder().emit_u16(Opcode::GetTupleIndex, *index);
            }
            Expr::ForceUnwrap { operand, .. } => {
                self.compile_expr(operand)?;
                self.builder().emit(Opcode::Unwrap);
            }
            Expr::Subscript { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.builder().emit(Opcode::GetSubscript);
            }
            Expr::ArrayLiteral { elements, .. } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                let count = element_count(elements.len(), expr.line())?;
                self.builder().emit_u16(Opcode::Array, count);
                self.builder().adjust_stack(1 - elements.len() as i16);
            }
            Expr::DictLiteral { entries, .. } => {
                for (key, value) in entries {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                let count = element_count(entries.len(), expr.line())?;
                self.builder().emit_u16(Opcode::Dict, count);
                self.builder().adjust_stack(1 - 2 * entries.len() as i16);
            }
            Expr::TupleLiteral { elements, .. } => {
                for (_, element) in elements {
                    self.compile_expr(element)?;
                }
                let count = element_count(elements.len(), expr.line())?;
                let label_ids: Vec<u16> = elements
                    .iter()
                    .map(|(label, _)| match label {
                        Some(label) => self.intern(label).map(|id| id.0),
                        None => Ok(StringId::NONE.0),
                    })
                    .collect::<CompileResult<_>>()?;
                self.builder().emit_u16(Opcode::Tuple, count);
                for id in label_ids {
                    self.builder().push_operand_u16(id);
                }
                self.builder().adjust_stack(1 - elements.len() as i16);
            }
            Expr::Range {
                start,
                end,
                inclusive,
                ..
            } => {
                self.compile_expr(start)?;
                self.compile_expr(end)?;
                self.builder().emit(if *inclusive {
                    Opcode::RangeInclusive
                } else {
                    Opcode::RangeExclusive
                });
            }
            Expr::Closure {
                params, body, line, ..
            } => {
                let type_context = self.state().type_context.clone();
                let proto = self.compile_function(
                    "<closure>",
                    params,
                    body,
                    FunctionOptions {
                        has_receiver: false,
                        is_initializer: false,
                        is_override: false,
                        is_mutating: false,
                        type_context,
                    },
                    *line,
                )?;
                self.emit_function_value(proto, *line)?;
            }
            Expr::TypeCheck { value, target, .. } => {
                self.compile_expr(value)?;
                let name_id = self.intern(&annotation_runtime_name(target))?;
                self.builder().emit_u16(Opcode::TypeCheck, name_id.0);
            }
            Expr::TypeCast { value, target, kind, .. } => {
                self.compile_expr(value)?;
                let name_id = self.intern(&annotation_runtime_name(target))?;
                let op = match kind {
                    CastKind::Plain => Opcode::TypeCast,
                    CastKind::Optional => Opcode::TypeCastOptional,
                    CastKind::Forced => Opcode::TypeCastForced,
                };
                self.builder().emit_u16(op, name_id.0);
            }
        }
        Ok(())
    }

    /// Loads an identifier: local, then upvalue, then implicit self
    /// property, then global.
    fn compile_identifier_get(&mut self, name: &str, line: u32) -> CompileResult<()> {
        self.builder().set_line(line);
        if let Some(slot) = self.resolve_local(name) {
            self.builder().emit_u16(Opcode::GetLocal, slot);
            return Ok(());
        }
        let top = self.states.len() - 1;
        if let Some(upvalue) = self.resolve_upvalue(top, name, line)? {
            self.builder().emit_u16(Opcode::GetUpvalue, upvalue);
            return Ok(());
        }
        if self.is_implicit_property(name) {
            self.builder().emit_u16(Opcode::GetLocal, 0);
            let name_id = self.intern(name)?;
            self.builder().emit_u16(Opcode::GetProperty, name_id.0);
            return Ok(());
        }
        if self.is_implicit_static_property(name) {
            let context = self.state().type_context.clone().expect("static context");
            let type_id = self.intern(&context.type_name)?;
            self.builder().emit_u16(Opcode::GetGlobal, type_id.0);
            let name_id = self.intern(name)?;
            self.builder().emit_u16(Opcode::GetProperty, name_id.0);
            return Ok(());
        }
        let name_id = self.intern(name)?;
        self.builder().emit_u16(Opcode::GetGlobal, name_id.0);
        Ok(())
    }

    fn is_implicit_property(&self, name: &str) -> bool {
        let state = self.states.last().expect("state exists");
        state.has_receiver
            && state
                .type_context
                .as_ref()
                .is_some_and(|ctx| ctx.property_names.iter().any(|p| p == name))
    }

    fn is_implicit_static_property(&self, name: &str) -> bool {
        let state = self.states.last().expect("state exists");
        state
            .type_context
            .as_ref()
            .is_some_and(|ctx| ctx.static_property_names.iter().any(|p| p == name))
    }

    fn compile_assignment(&mut self, target: &Expr, value: &Expr, line: u32) -> CompileResult<()> {
        match target {
            Expr::Identifier { name, .. } => {
                if let Some(slot) = self.resolve_local(name) {
                    self.compile_expr(value)?;
                    self.builder().emit(Opcode::CopyValue);
                    self.builder().emit_u16(Opcode::SetLocal, slot);
                    return Ok(());
                }
                let top = self.states.len() - 1;
                if let Some(upvalue) = self.resolve_upvalue(top, name, line)? {
                    self.compile_expr(value)?;
                    self.builder().emit(Opcode::CopyValue);
                    self.builder().emit_u16(Opcode::SetUpvalue, upvalue);
                    return Ok(());
                }
                if self.is_implicit_property(name) {
                    self.builder().emit_u16(Opcode::GetLocal, 0);
                    self.compile_expr(value)?;
                    self.builder().emit(Opcode::CopyValue);
                    let name_id = self.intern(name)?;
                    self.builder().emit_u16(Opcode::SetProperty, name_id.0);
                    return Ok(());
                }
                self.compile_expr(value)?;
                self.builder().emit(Opcode::CopyValue);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::SetGlobal, name_id.0);
                Ok(())
            }
            Expr::SelfExpr { line } => {
                if !self.state().in_mutating_method && !self.state().is_initializer {
                    return Err(CompilerError::new(
                        "'self' can only be reassigned inside a mutating method",
                        *line,
                    ));
                }
                self.compile_expr(value)?;
                self.builder().emit(Opcode::CopyValue);
                self.builder().emit_u16(Opcode::SetLocal, 0);
                Ok(())
            }
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                self.builder().emit(Opcode::CopyValue);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::SetProperty, name_id.0);
                Ok(())
            }
            Expr::OptionalMember { object, name, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                self.builder().emit(Opcode::CopyValue);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::SetProperty, name_id.0);
                Ok(())
            }
            Expr::Subscript { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.builder().emit(Opcode::CopyValue);
                self.builder().emit(Opcode::SetSubscript);
                Ok(())
            }
            _ => Err(CompilerError::new("invalid assignment target", line)),
        }
    }

    /// `a op= b` desugars into get-op-set with the usual copy step.
    fn compile_compound_assignment(
        &mut self,
        op: BinaryOp,
        target: &Expr,
        value: &Expr,
        line: u32,
    ) -> CompileResult<()> {
        match target {
            Expr::Identifier { .. } | Expr::SelfExpr { .. } => {
                let desugared = Expr::Binary {
                    op,
                    left: Box::new(target.clone()),
                    right: Box::new(value.clone()),
                    line,
                };
                self.compile_assignment(target, &desugared, line)
            }
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                self.builder().emit(Opcode::Dup);
                let name_id = self.intern(name)?;
                self.builder().emit_u16(Opcode::GetProperty, name_id.0);
                self.compile_expr(value)?;
                self.builder().emit(binary_opcode(op));
                self.builder().emit(Opcode::CopyValue);
                self.builder().emit_u16(Opcode::SetProperty, name_id.0);
                Ok(())
            }
            Expr::Subscript { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.builder().emit(Opcode::GetSubscript);
                self.compile_expr(value)?;
                self.builder().emit(binary_opcode(op));
                self.builder().emit(Opcode::CopyValue);
                self.builder().emit(Opcode::SetSubscript);
                Ok(())
            }
            _ => Err(CompilerError::new("invalid compound assignment target", line)),
        }
    }

    fn compile_super_access(&mut self, method: &str, line: u32) -> CompileResult<()> {
        let has_super = self
            .state()
            .type_context
            .as_ref()
            .is_some_and(|ctx| ctx.has_super);
        if !has_super {
            return Err(CompilerError::new("'super' used in a class with no superclass", line));
        }
        self.builder().emit_u16(Opcode::GetLocal, 0);
        let name_id = self.intern(method)?;
        self.builder().emit_u16(Opcode::Super, name_id.0);
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[CallArg], line: u32) -> CompileResult<()> {
        // `readLine()` lowers to its own opcode.
        if let Expr::Identifier { name, .. } = callee {
            if name == "readLine" && args.is_empty() && self.resolve_local(name).is_none() {
                self.builder().emit(Opcode::ReadLine);
                return Ok(());
            }
        }

        self.compile_expr(callee)?;
        for arg in args {
            self.compile_expr(&arg.value)?;
        }

        let argc = u8::try_from(args.len()).map_err(|_| CompilerError::new("more than 255 call arguments", line))?;
        let has_labels = args.iter().any(|arg| arg.label.is_some());
        if has_labels {
            let label_ids: Vec<u16> = args
                .iter()
                .map(|arg| match &arg.label {
                    Some(label) => self.intern(label).map(|id| id.0),
                    None => Ok(StringId::NONE.0),
                })
                .collect::<CompileResult<_>>()?;
            self.builder().emit_u8(Opcode::CallNamed, argc);
            for id in label_ids {
                self.builder().push_operand_u16(id);
            }
        } else {
            self.builder().emit_u8(Opcode::Call, argc);
        }
        self.builder().adjust_stack(-(i16::from(argc)));
        Ok(())
    }

    // ---- Functions ----

    fn compile_function(
        &mut self,
        name: &str,
        params: &[Param],
        body: &[Stmt],
        options: FunctionOptions,
        line: u32,
    ) -> CompileResult<u16> {
        if self.assembly.functions.len() >= MAX_SLOTS {
            return Err(CompilerError::new("function table exceeds 65535 entries", line));
        }

        let mut state = FnState::new(options.type_context);
        state.has_receiver = options.has_receiver;
        state.is_initializer = options.is_initializer;
        state.in_mutating_method = options.is_mutating;
        self.states.push(state);

        let mut param_names = Vec::new();
        let mut param_labels = Vec::new();
        let mut defaults = Vec::new();

        if options.has_receiver {
            param_names.push("self".to_owned());
            param_labels.push(None);
            defaults.push(None);
            self.add_local("self", line)?;
        }
        for param in params {
            param_names.push(param.name.clone());
            param_labels.push(param.external_label().map(str::to_owned));
            defaults.push(match &param.default_value {
                Some(expr) => Some(default_value_from(expr, line)?),
                None => None,
            });
            self.add_local(&param.name, line)?;
        }

        self.builder().set_line(line);
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        // Synthetic tail: every body ends with `NIL; RETURN`.
        self.builder().emit(Opcode::Nil);
        self.builder().emit(Opcode::Return);

        let state = self.states.pop().expect("function state");
        let chunk = state.builder.build();
        let chunk_index = self.assembly.method_bodies.len();
        if chunk_index >= MAX_SLOTS {
            return Err(CompilerError::new("method body table exceeds 65535 entries", line));
        }
        self.assembly.method_bodies.push(chunk);

        let proto_index = self.assembly.functions.len() as u16;
        self.assembly.functions.push(FunctionPrototype {
            name: name.to_owned(),
            param_names,
            param_labels,
            defaults,
            has_receiver: options.has_receiver,
            is_initializer: options.is_initializer,
            is_override: options.is_override,
            upvalues: state.upvalues,
            chunk: chunk_index as u16,
        });
        Ok(proto_index)
    }

    /// Emits `FUNCTION` or, when the prototype captured upvalues, `CLOSURE`
    /// followed by the upvalue descriptor bytes.
    fn emit_function_value(&mut self, proto: u16, _line: u32) -> CompileResult<()> {
        let upvalues = self.assembly.functions[usize::from(proto)].upvalues.clone();
        if upvalues.is_empty() {
            self.builder().emit_u16(Opcode::Function, proto);
        } else {
            self.builder().emit_u16(Opcode::Closure, proto);
            for upvalue in upvalues {
                self.builder().push_operand_u8(u8::from(upvalue.is_local));
                self.builder().push_operand_u16(upvalue.index);
            }
        }
        Ok(())
    }

    // ---- Type declarations ----

    fn type_context_for(
        &self,
        type_name: &str,
        properties: &[VarDecl],
        has_super: bool,
        is_struct: bool,
    ) -> TypeContext {
        TypeContext {
            type_name: type_name.to_owned(),
            property_names: properties
                .iter()
                .filter(|p| !p.is_static)
                .map(|p| p.name.clone())
                .collect(),
            static_property_names: properties
                .iter()
                .filter(|p| p.is_static)
                .map(|p| p.name.clone())
                .collect(),
            has_super,
            is_struct,
        }
    }

    fn compile_class(&mut self, decl: &ClassDecl) -> CompileResult<()> {
        let line = decl.line;
        let superclass = self.analysis.superclasses.get(&decl.name).cloned();

        if let Some(superclass) = &superclass {
            self.compile_identifier_get(superclass, line)?;
        }
        let name_id = self.intern(&decl.name)?;
        self.builder().emit_u16(Opcode::Class, name_id.0);
        if superclass.is_some() {
            self.builder().emit(Opcode::Inherit);
        }

        let context = self.type_context_for(&decl.name, &decl.properties, superclass.is_some(), false);

        // Instance properties first, statics after.
        for property in decl.properties.iter().filter(|p| !p.is_static) {
            self.compile_property_definition(&decl.name, property, &context)?;
        }
        for property in decl.properties.iter().filter(|p| p.is_static) {
            self.compile_property_definition(&decl.name, property, &context)?;
        }

        for method in &decl.methods {
            self.compile_method(&decl.name, method, &context, false)?;
        }
        for initializer in &decl.initializers {
            self.compile_method(&decl.name, initializer, &context, true)?;
        }
        if let Some(deinit_body) = &decl.deinitializer {
            let proto = self.compile_function(
                "deinit",
                &[],
                deinit_body,
                FunctionOptions {
                    has_receiver: true,
                    is_initializer: false,
                    is_override: false,
                    is_mutating: false,
                    type_context: Some(context.clone()),
                },
                line,
            )?;
            self.emit_function_value(proto, line)?;
            let deinit_id = self.intern("deinit")?;
            self.builder().emit_u16(Opcode::Method, deinit_id.0);
            self.builder().push_operand_u8(0);
            self.record_method_key(&decl.name, "deinit", false, proto);
        }

        self.record_class_metadata(decl, superclass.as_deref());
        self.define_slot(&decl.name, line)?;

        if self.entry.is_none() && self.has_static_main(&decl.methods) {
            self.entry = Some(EntryPoint::StaticMain {
                type_name: decl.name.clone(),
            });
        }
        Ok(())
    }

    fn compile_struct_or_specializations(&mut self, decl: &StructDecl) -> CompileResult<()> {
        if decl.generic_params.is_empty() {
            return self.compile_struct(decl, &decl.name);
        }
        // Generic template: one definition per specialization the analyzer
        // recorded; the bodies are identical, only the name differs.
        let Some(specializations) = self.analysis.specializations.get(&decl.name) else {
            return Ok(());
        };
        for mangled in specializations.clone() {
            self.compile_struct(decl, &mangled)?;
        }
        Ok(())
    }

    fn compile_struct(&mut self, decl: &StructDecl, runtime_name: &str) -> CompileResult<()> {
        let line = decl.line;
        let name_id = self.intern(runtime_name)?;
        self.builder().emit_u16(Opcode::Struct, name_id.0);

        let context = self.type_context_for(runtime_name, &decl.properties, false, true);

        for property in decl.properties.iter().filter(|p| !p.is_static) {
            self.compile_property_definition(runtime_name, property, &context)?;
        }
        for property in decl.properties.iter().filter(|p| p.is_static) {
            self.compile_property_definition(runtime_name, property, &context)?;
        }

        for method in &decl.methods {
            self.compile_method(runtime_name, method, &context, false)?;
        }
        for initializer in &decl.initializers {
            self.compile_method(runtime_name, initializer, &context, true)?;
        }

        self.record_struct_metadata(decl, runtime_name);
        self.define_slot(runtime_name, line)?;

        if self.entry.is_none() && self.has_static_main(&decl.methods) {
            self.entry = Some(EntryPoint::StaticMain {
                type_name: runtime_name.to_owned(),
            });
        }
        Ok(())
    }

    fn has_static_main(&self, methods: &[FuncDecl]) -> bool {
        methods.iter().any(|m| m.is_static && m.name == "main" && m.params.is_empty())
    }

    /// Emits the initializer (or the lazy thunk) and the matching
    /// `DEFINE_PROPERTY*` / `DEFINE_COMPUTED_PROPERTY` instruction. The type
    /// object being defined is on top of the stack.
    fn compile_property_definition(
        &mut self,
        type_name: &str,
        property: &VarDecl,
        context: &TypeContext,
    ) -> CompileResult<()> {
        let line = property.line;
        self.builder().set_line(line);

        if property.is_computed() {
            let getter_body = property.getter.clone().expect("computed property has a getter");
            let getter_proto = self.compile_function(
                &format!("get:{}", property.name),
                &[],
                &getter_body,
                FunctionOptions {
                    has_receiver: true,
                    is_initializer: false,
                    is_override: false,
                    is_mutating: false,
                    type_context: Some(context.clone()),
                },
                line,
            )?;
            self.record_method_key(type_name, &format!("get:{}", property.name), property.is_static, getter_proto);
            let setter_proto = match &property.setter {
                Some(setter) => {
                    let param = Param {
                        label: None,
                        name: setter.param.clone().unwrap_or_else(|| "newValue".to_owned()),
                        type_annotation: property.type_annotation.clone(),
                        default_value: None,
                        label_omitted: true,
                    };
                    let proto = self.compile_function(
                        &format!("set:{}", property.name),
                        std::slice::from_ref(&param),
                        &setter.body,
                        FunctionOptions {
                            has_receiver: true,
                            is_initializer: false,
                            is_override: false,
                            is_mutating: context.is_struct,
                            type_context: Some(context.clone()),
                        },
                        line,
                    )?;
                    self.record_method_key(type_name, &format!("set:{}", property.name), property.is_static, proto);
                    Some(proto)
                }
                None => None,
            };
            let name_id = self.intern(&property.name)?;
            self.builder().emit_u16(Opcode::DefineComputedProperty, name_id.0);
            self.builder().push_operand_u16(getter_proto);
            self.builder().push_operand_u16(setter_proto.unwrap_or(NO_INDEX));
            return Ok(());
        }

        let flags = property_flag_byte(property);

        if property.is_lazy {
            // The initializer compiles into a thunk run on first access.
            let body = match &property.initializer {
                Some(initializer) => vec![Stmt::Return {
                    value: Some(initializer.clone()),
                    line,
                }],
                None => {
                    return Err(CompilerError::new(
                        format!("lazy property '{}' requires an initializer", property.name),
                        line,
                    ));
                }
            };
            let proto = self.compile_function(
                &format!("lazy:{}", property.name),
                &[],
                &body,
                FunctionOptions {
                    has_receiver: true,
                    is_initializer: false,
                    is_override: false,
                    is_mutating: false,
                    type_context: Some(context.clone()),
                },
                line,
            )?;
            self.emit_function_value(proto, line)?;
        } else {
            match &property.initializer {
                Some(initializer) => self.compile_expr(initializer)?,
                None => self.builder().emit(Opcode::Nil),
            }
        }

        if property.has_observers() {
            let observer_proto = |compiler: &mut Self, accessor: &Option<ast::AccessorBody>, kind: &str, default_param: &str| -> CompileResult<u16> {
                match accessor {
                    Some(accessor) => {
                        let param = Param {
                            label: None,
                            name: accessor.param.clone().unwrap_or_else(|| default_param.to_owned()),
                            type_annotation: property.type_annotation.clone(),
                            default_value: None,
                            label_omitted: true,
                        };
                        let proto = compiler.compile_function(
                            &format!("{}_{kind}", property.name),
                            std::slice::from_ref(&param),
                            &accessor.body,
                            FunctionOptions {
                                has_receiver: true,
                                is_initializer: false,
                                is_override: false,
                                is_mutating: false,
                                type_context: Some(context.clone()),
                            },
                            line,
                        )?;
                        compiler.record_method_key(type_name, &format!("{}_{kind}", property.name), false, proto);
                        Ok(proto)
                    }
                    None => Ok(NO_INDEX),
                }
            };
            let will_set = observer_proto(self, &property.will_set, "willSet", "newValue")?;
            let did_set = observer_proto(self, &property.did_set, "didSet", "oldValue")?;
            let name_id = self.intern(&property.name)?;
            self.builder().emit_u16(Opcode::DefinePropertyWithObservers, name_id.0);
            self.builder().push_operand_u8(flags);
            self.builder().push_operand_u16(will_set);
            self.builder().push_operand_u16(did_set);
        } else {
            let name_id = self.intern(&property.name)?;
            self.builder().emit_u16(Opcode::DefineProperty, name_id.0);
            self.builder().push_operand_u8(flags);
        }
        Ok(())
    }

    fn compile_method(
        &mut self,
        type_name: &str,
        method: &FuncDecl,
        context: &TypeContext,
        is_initializer: bool,
    ) -> CompileResult<()> {
        let line = method.line;
        // `init` on structs is mandatorily mutating.
        let is_mutating = method.is_mutating || (is_initializer && context.is_struct);
        let proto = self.compile_function(
            &method.name,
            &method.params,
            &method.body,
            FunctionOptions {
                has_receiver: !method.is_static,
                is_initializer,
                is_override: method.is_override,
                is_mutating,
                type_context: Some(context.clone()),
            },
            line,
        )?;
        self.emit_function_value(proto, line)?;
        let name_id = self.intern(&method.name)?;
        if context.is_struct && !method.is_static {
            self.builder().emit_u16(Opcode::StructMethod, name_id.0);
            self.builder().push_operand_u8(u8::from(is_mutating));
        } else {
            self.builder().emit_u16(Opcode::Method, name_id.0);
            self.builder().push_operand_u8(u8::from(method.is_static));
        }
        self.record_method_key(type_name, &method.name, method.is_static, proto);
        Ok(())
    }

    fn compile_enum(&mut self, decl: &EnumDecl) -> CompileResult<()> {
        let line = decl.line;
        let name_id = self.intern(&decl.name)?;
        self.builder().emit_u16(Opcode::Enum, name_id.0);

        for case in &decl.cases {
            // Raw value first, then the case descriptor.
            match &case.raw_value {
                Some(raw) => self.compile_expr(raw)?,
                None => self.builder().emit(Opcode::Nil),
            }
            let case_id = self.intern(&case.name)?;
            let assoc_count = u8::try_from(case.assoc.len())
                .map_err(|_| CompilerError::new("more than 255 associated values", case.line))?;
            let label_ids: Vec<u16> = case
                .assoc
                .iter()
                .map(|(label, _)| match label {
                    Some(label) => self.intern(label).map(|id| id.0),
                    None => Ok(StringId::NONE.0),
                })
                .collect::<CompileResult<_>>()?;
            self.builder().emit_u16(Opcode::EnumCase, case_id.0);
            self.builder().push_operand_u8(assoc_count);
            for id in label_ids {
                self.builder().push_operand_u16(id);
            }
        }

        let context = self.type_context_for(&decl.name, &decl.properties, false, false);
        for property in &decl.properties {
            if property.is_computed() {
                self.compile_property_definition(&decl.name, property, &context)?;
            } else {
                return Err(CompilerError::new(
                    "enums support only computed properties",
                    property.line,
                ));
            }
        }
        for method in &decl.methods {
            self.compile_method(&decl.name, method, &context, false)?;
        }

        self.record_enum_metadata(decl);
        self.define_slot(&decl.name, line)?;
        Ok(())
    }

    fn compile_protocol(&mut self, decl: &ProtocolDecl) -> CompileResult<()> {
        let line = decl.line;
        let index = self.assembly.protocols.len();
        if index >= MAX_SLOTS {
            return Err(CompilerError::new("protocol table exceeds 65535 entries", line));
        }
        self.assembly.protocols.push(ProtocolDef {
            name: decl.name.clone(),
            method_requirements: decl.methods.iter().map(|m| m.name.clone()).collect(),
            property_requirements: decl.properties.iter().map(|p| p.name.clone()).collect(),
            inherited: decl.inherited.clone(),
        });
        self.builder().emit_u16(Opcode::Protocol, index as u16);
        self.record_protocol_metadata(decl);
        self.define_slot(&decl.name, line)
    }

    fn compile_extension(&mut self, decl: &ExtensionDecl) -> CompileResult<()> {
        let line = decl.line;
        // Reopen the type object: load it, add members, pop it.
        self.compile_identifier_get(&decl.extended_type, line)?;

        let is_struct = self
            .type_metadata
            .get(&decl.extended_type)
            .is_some_and(|meta| meta.flags & type_flags::STRUCT != 0);
        let has_super = self.analysis.superclasses.contains_key(&decl.extended_type);
        let mut context = self.type_context_for(&decl.extended_type, &decl.properties, has_super, is_struct);
        if let Some(meta) = self.type_metadata.get(&decl.extended_type) {
            for (field_name, ..) in &meta.fields {
                context.property_names.push(field_name.clone());
            }
        }

        for property in &decl.properties {
            if !property.is_computed() {
                return Err(CompilerError::new(
                    "extensions may only add computed properties",
                    property.line,
                ));
            }
            self.compile_property_definition(&decl.extended_type, property, &context)?;
        }
        for method in &decl.methods {
            self.compile_method(&decl.extended_type, method, &context, false)?;
        }
        for initializer in &decl.initializers {
            self.compile_method(&decl.extended_type, initializer, &context, true)?;
        }
        self.builder().emit(Opcode::Pop);

        self.record_extension_metadata(decl);
        Ok(())
    }

    // ---- Imports and entry ----

    /// After an imported module's top-level code, bind a namespace map of
    /// its public function exports to the module's file stem.
    fn emit_namespace_map(&mut self, stem: &str, statements: &[Stmt]) -> CompileResult<()> {
        let mut exports = Vec::new();
        for stmt in statements {
            if let Stmt::Func(decl) = stmt {
                if decl.access != AccessLevel::Private {
                    exports.push(decl.name.clone());
                }
            }
        }
        for name in &exports {
            let name_id = self.intern(name)?;
            self.builder().emit_u16(Opcode::String, name_id.0);
            self.builder().emit_u16(Opcode::GetGlobal, name_id.0);
        }
        let count = element_count(exports.len(), 0)?;
        self.builder().emit_u16(Opcode::Dict, count);
        self.builder().adjust_stack(1 - 2 * exports.len() as i16);
        let stem_id = self.intern(stem)?;
        self.builder().emit_u16(Opcode::DefineGlobal, stem_id.0);
        Ok(())
    }

    fn synthesize_entry_call(&mut self) -> CompileResult<()> {
        match self.entry.clone() {
            Some(EntryPoint::GlobalMain) => {
                let main_id = self.intern("main")?;
                self.builder().emit_u16(Opcode::GetGlobal, main_id.0);
                self.builder().emit_u8(Opcode::Call, 0);
                self.builder().emit(Opcode::Pop);
            }
            Some(EntryPoint::StaticMain { type_name }) => {
                let type_id = self.intern(&type_name)?;
                self.builder().emit_u16(Opcode::GetGlobal, type_id.0);
                let main_id = self.intern("main")?;
                self.builder().emit_u16(Opcode::GetProperty, main_id.0);
                self.builder().emit_u8(Opcode::Call, 0);
                self.builder().emit(Opcode::Pop);
            }
            None => {}
        }
        Ok(())
    }

    // ---- Metadata ----

    fn record_method_key(&mut self, type_name: &str, method: &str, is_static: bool, proto: u16) {
        let key = method_key(type_name, method, is_static);
        self.method_keys.insert(key, proto);
    }

    fn record_class_metadata(&mut self, decl: &ClassDecl, superclass: Option<&str>) {
        let mut meta = TypeMetadata {
            flags: type_flags::CLASS | access_type_flags(decl.access),
            base: superclass.map(str::to_owned),
            interfaces: decl
                .inheritance
                .iter()
                .filter(|n| Some(n.as_str()) != superclass)
                .cloned()
                .collect(),
            ..TypeMetadata::default()
        };
        self.record_member_metadata(&mut meta, &decl.name, &decl.properties, &decl.methods, &decl.initializers);
        self.type_metadata.insert(decl.name.clone(), meta);
    }

    fn record_struct_metadata(&mut self, decl: &StructDecl, runtime_name: &str) {
        let mut meta = TypeMetadata {
            flags: type_flags::STRUCT | access_type_flags(decl.access),
            base: None,
            interfaces: decl.inheritance.clone(),
            ..TypeMetadata::default()
        };
        self.record_member_metadata(&mut meta, runtime_name, &decl.properties, &decl.methods, &decl.initializers);
        self.type_metadata.insert(runtime_name.to_owned(), meta);
    }

    fn record_enum_metadata(&mut self, decl: &EnumDecl) {
        let mut meta = TypeMetadata {
            flags: type_flags::ENUM | access_type_flags(decl.access),
            base: None,
            interfaces: decl.inheritance.clone(),
            ..TypeMetadata::default()
        };
        self.record_member_metadata(&mut meta, &decl.name, &decl.properties, &decl.methods, &[]);
        self.type_metadata.insert(decl.name.clone(), meta);
    }

    fn record_protocol_metadata(&mut self, decl: &ProtocolDecl) {
        let mut meta = TypeMetadata {
            flags: type_flags::INTERFACE | access_type_flags(decl.access),
            base: None,
            interfaces: decl.inherited.clone(),
            ..TypeMetadata::default()
        };
        for method in &decl.methods {
            meta.methods.push(MethodMetadata {
                name: method.name.clone(),
                flags: if method.is_static { method_flags::STATIC } else { method_flags::VIRTUAL },
                param_types: method
                    .params
                    .iter()
                    .map(|p| annotation_meta_name(p.type_annotation.as_ref()))
                    .collect(),
                return_type: annotation_meta_name(method.return_type.as_ref()),
                body_key: String::new(),
            });
        }
        self.type_metadata.insert(decl.name.clone(), meta);
    }

    fn record_extension_metadata(&mut self, decl: &ExtensionDecl) {
        let extended = decl.extended_type.clone();
        let mut scratch = TypeMetadata::default();
        self.record_member_metadata(&mut scratch, &extended, &decl.properties, &decl.methods, &decl.initializers);
        if let Some(meta) = self.type_metadata.get_mut(&extended) {
            meta.interfaces.extend(decl.conformances.iter().cloned());
            meta.fields.extend(scratch.fields);
            meta.methods.extend(scratch.methods);
            meta.properties.extend(scratch.properties);
        }
    }

    fn record_member_metadata(
        &mut self,
        meta: &mut TypeMetadata,
        type_name: &str,
        properties: &[VarDecl],
        methods: &[FuncDecl],
        initializers: &[FuncDecl],
    ) {
        for property in properties {
            let type_label = annotation_meta_name(property.type_annotation.as_ref());
            if property.is_computed() {
                let getter_key = Some(method_key(type_name, &format!("get:{}", property.name), property.is_static));
                let setter_key = property
                    .setter
                    .as_ref()
                    .map(|_| method_key(type_name, &format!("set:{}", property.name), property.is_static));
                meta.properties.push((
                    property.name.clone(),
                    property_meta_flags(property),
                    type_label,
                    getter_key,
                    setter_key,
                ));
            } else {
                meta.fields.push((property.name.clone(), property_meta_flags(property), type_label));
            }
        }
        for method in methods {
            meta.methods.push(MethodMetadata {
                name: method.name.clone(),
                flags: method_meta_flags(method, false),
                param_types: method
                    .params
                    .iter()
                    .map(|p| annotation_meta_name(p.type_annotation.as_ref()))
                    .collect(),
                return_type: annotation_meta_name(method.return_type.as_ref()),
                body_key: method_key(type_name, &method.name, method.is_static),
            });
        }
        for initializer in initializers {
            meta.methods.push(MethodMetadata {
                name: initializer.name.clone(),
                flags: method_meta_flags(initializer, true),
                param_types: initializer
                    .params
                    .iter()
                    .map(|p| annotation_meta_name(p.type_annotation.as_ref()))
                    .collect(),
                return_type: type_name.to_owned(),
                body_key: method_key(type_name, &initializer.name, false),
            });
        }
    }

    fn type_name_id(&mut self, name: &str) -> CompileResult<u32> {
        if let Some(&id) = self.type_name_ids.get(name) {
            return Ok(id);
        }
        let string_id = self.intern(name)?;
        let id = self.assembly.type_names.len() as u32;
        self.assembly.type_names.push(string_id);
        self.type_name_ids.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Builds the type / method / field / property tables and the packed
    /// signature blob from the member info recorded during compilation.
    fn populate_metadata(&mut self, _units: &[ModuleUnit]) -> CompileResult<()> {
        let type_metadata = std::mem::take(&mut self.type_metadata);
        for (type_name, meta) in &type_metadata {
            let name_id = self.intern(type_name)?;
            let base = match &meta.base {
                Some(base) => self.intern(base)?,
                None => StringId::NONE,
            };
            let interfaces = meta
                .interfaces
                .iter()
                .map(|i| self.intern(i))
                .collect::<CompileResult<Vec<_>>>()?;

            let field_start = self.assembly.field_definitions.len() as u32;
            for (field_name, flags, type_label) in &meta.fields {
                let field_name_id = self.intern(field_name)?;
                let type_id = self.type_name_id(type_label)?;
                self.assembly.field_definitions.push(FieldDef {
                    name: field_name_id,
                    flags: *flags,
                    type_id,
                });
            }
            let field_end = self.assembly.field_definitions.len() as u32;

            let method_start = self.assembly.method_definitions.len() as u32;
            let mut accessor_indices: AHashMap<String, u16> = AHashMap::new();
            for method in &meta.methods {
                let method_name_id = self.intern(&method.name)?;
                let signature_offset = self.pack_signature(&method.param_types, &method.return_type)?;
                let body_index = self
                    .method_keys
                    .get(&method.body_key)
                    .map_or(NO_INDEX, |&proto| self.assembly.functions[usize::from(proto)].chunk);
                let index = self.assembly.method_definitions.len() as u16;
                accessor_indices.insert(method.body_key.clone(), index);
                self.assembly.method_definitions.push(MethodDef {
                    name: method_name_id,
                    flags: method.flags,
                    signature_offset,
                    body_index,
                });
            }
            // Accessor bodies for computed properties are registered as
            // method definitions too, so property getter/setter ids resolve.
            for (_, _, type_label, getter_key, setter_key) in &meta.properties {
                for key in [getter_key, setter_key].into_iter().flatten() {
                    if accessor_indices.contains_key(key) {
                        continue;
                    }
                    if let Some(&proto) = self.method_keys.get(key) {
                        let accessor_name = self.assembly.functions[usize::from(proto)].name.clone();
                        let accessor_name_id = self.intern(&accessor_name)?;
                        let signature_offset = self.pack_signature(&[], type_label)?;
                        let index = self.assembly.method_definitions.len() as u16;
                        accessor_indices.insert(key.clone(), index);
                        self.assembly.method_definitions.push(MethodDef {
                            name: accessor_name_id,
                            flags: method_flags::VIRTUAL,
                            signature_offset,
                            body_index: self.assembly.functions[usize::from(proto)].chunk,
                        });
                    }
                }
            }
            let method_end = self.assembly.method_definitions.len() as u32;

            let property_start = self.assembly.property_definitions.len() as u32;
            for (property_name, flags, type_label, getter_key, setter_key) in &meta.properties {
                let property_name_id = self.intern(property_name)?;
                let type_id = self.type_name_id(type_label)?;
                let getter = getter_key
                    .as_ref()
                    .and_then(|k| accessor_indices.get(k).copied())
                    .unwrap_or(NO_INDEX);
                let setter = setter_key
                    .as_ref()
                    .and_then(|k| accessor_indices.get(k).copied())
                    .unwrap_or(NO_INDEX);
                self.assembly.property_definitions.push(PropertyDef {
                    name: property_name_id,
                    flags: *flags,
                    type_id,
                    getter,
                    setter,
                });
            }
            let property_end = self.assembly.property_definitions.len() as u32;

            self.assembly.type_definitions.push(TypeDef {
                name: name_id,
                flags: meta.flags,
                base,
                interfaces,
                fields: TableSlice {
                    start: field_start,
                    end: field_end,
                },
                methods: TableSlice {
                    start: method_start,
                    end: method_end,
                },
                properties: TableSlice {
                    start: property_start,
                    end: property_end,
                },
            });
        }
        Ok(())
    }

    fn pack_signature(&mut self, param_types: &[String], return_type: &str) -> CompileResult<u32> {
        let offset = self.assembly.signature_blob.len() as u32;
        self.assembly.signature_blob.push(param_types.len() as u32);
        let return_id = self.type_name_id(return_type)?;
        self.assembly.signature_blob.push(return_id);
        for param in param_types {
            let param_id = self.type_name_id(param)?;
            self.assembly.signature_blob.push(param_id);
        }
        Ok(offset)
    }
}

#[derive(Debug, Clone)]
struct FunctionOptions {
    has_receiver: bool,
    is_initializer: bool,
    is_override: bool,
    is_mutating: bool,
    type_context: Option<TypeContext>,
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Subtract,
        BinaryOp::Mul => Opcode::Multiply,
        BinaryOp::Div => Opcode::Divide,
        BinaryOp::Mod => Opcode::Modulo,
        BinaryOp::Equal => Opcode::Equal,
        BinaryOp::NotEqual => Opcode::NotEqual,
        BinaryOp::Less => Opcode::Less,
        BinaryOp::LessEqual => Opcode::LessEqual,
        BinaryOp::Greater => Opcode::Greater,
        BinaryOp::GreaterEqual => Opcode::GreaterEqual,
        BinaryOp::LogicalAnd => Opcode::And,
        BinaryOp::LogicalOr => Opcode::Or,
        BinaryOp::BitAnd => Opcode::BitwiseAnd,
        BinaryOp::BitOr => Opcode::BitwiseOr,
        BinaryOp::BitXor => Opcode::BitwiseXor,
        BinaryOp::LeftShift => Opcode::LeftShift,
        BinaryOp::RightShift => Opcode::RightShift,
        BinaryOp::NilCoalesce => Opcode::NilCoalesce,
    }
}

fn element_count(len: usize, line: u32) -> CompileResult<u16> {
    u16::try_from(len).map_err(|_| CompilerError::new("more than 65535 elements in one literal", line))
}

/// Default parameter values are restricted to literal constants or their
/// unary negation.
fn default_value_from(expr: &Expr, line: u32) -> CompileResult<DefaultValue> {
    match expr {
        Expr::IntLiteral { value, .. } => Ok(DefaultValue::Int(*value)),
        Expr::FloatLiteral { value, .. } => Ok(DefaultValue::Float(*value)),
        Expr::BoolLiteral { value, .. } => Ok(DefaultValue::Bool(*value)),
        Expr::StringLiteral { value, .. } => Ok(DefaultValue::Str(value.clone())),
        Expr::NilLiteral { .. } => Ok(DefaultValue::Nil),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
            ..
        } => match default_value_from(operand, line)? {
            DefaultValue::Int(v) => Ok(DefaultValue::Int(v.wrapping_neg())),
            DefaultValue::Float(v) => Ok(DefaultValue::Float(-v)),
            _ => Err(CompilerError::new("default value must be a literal constant", line)),
        },
        _ => Err(CompilerError::new("default value must be a literal constant", line)),
    }
}

fn property_flag_byte(property: &VarDecl) -> u8 {
    let mut flags = 0u8;
    if property.is_let {
        flags |= 1;
    }
    if property.is_static {
        flags |= 1 << 1;
    }
    if property.is_lazy {
        flags |= 1 << 2;
    }
    match property.ref_kind {
        RefKind::Weak => flags |= 1 << 3,
        RefKind::Unowned => flags |= 1 << 4,
        RefKind::Strong => {}
    }
    flags
}

fn access_type_flags(access: AccessLevel) -> u32 {
    if access.is_private() {
        type_flags::PRIVATE
    } else {
        type_flags::PUBLIC
    }
}

fn property_meta_flags(property: &VarDecl) -> u32 {
    let mut flags = 0u32;
    if property.is_static {
        flags |= field_flags::STATIC;
    }
    if property.is_let {
        flags |= field_flags::LET;
    }
    if property.is_lazy {
        flags |= field_flags::LAZY;
    }
    match property.ref_kind {
        RefKind::Weak => flags |= field_flags::WEAK,
        RefKind::Unowned => flags |= field_flags::UNOWNED,
        RefKind::Strong => {}
    }
    if property.access.is_private() {
        flags |= field_flags::PRIVATE;
    }
    flags
}

fn method_meta_flags(method: &FuncDecl, is_initializer: bool) -> u32 {
    let mut flags = 0u32;
    if method.is_static {
        flags |= method_flags::STATIC;
    } else {
        flags |= method_flags::VIRTUAL;
    }
    if method.is_mutating {
        flags |= method_flags::MUTATING;
    }
    if method.is_override {
        flags |= method_flags::OVERRIDE;
    }
    if is_initializer {
        flags |= method_flags::INITIALIZER | method_flags::MUTATING;
    }
    flags
}

/// `TypeName::[static ]method` body-lookup key.
fn method_key(type_name: &str, method: &str, is_static: bool) -> String {
    if is_static {
        format!("{type_name}::static {method}")
    } else {
        format!("{type_name}::{method}")
    }
}

/// Runtime type name for `is` / `as` operands: the mangled specialization
/// for generic applications, the plain name otherwise.
fn annotation_runtime_name(annotation: &ast::TypeAnnotation) -> String {
    if annotation.generic_args.is_empty() || annotation.name == "Array" || annotation.name == "Dictionary" {
        annotation.name.clone()
    } else {
        ast::mangle_generic(&annotation.name, &annotation.generic_args)
    }
}

fn annotation_meta_name(annotation: Option<&ast::TypeAnnotation>) -> String {
    match annotation {
        Some(annotation) => {
            let mut name = annotation_runtime_name(annotation);
            if annotation.is_optional {
                name.push('?');
            }
            name
        }
        None => "Any".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{analyze::analyze, lexer::Lexer, parse::parse as parse_tokens};

    fn compile_source(source: &str) -> Assembly {
        let program = parse_tokens(Lexer::new(source).tokenize_all()).expect("parse failed");
        let analysis = analyze(&program).expect("analysis failed");
        let units = vec![ModuleUnit {
            key: None,
            stem: None,
            statements: program,
        }];
        compile(&units, &analysis).expect("compile failed")
    }

    #[test]
    fn top_level_ends_with_halt() {
        let assembly = compile_source("print(1)");
        let code = &assembly.code.code;
        assert_eq!(code[code.len() - 1], Opcode::Halt as u8);
        assert_eq!(code[code.len() - 2], Opcode::Nil as u8);
    }

    #[test]
    fn let_defines_global_with_copy() {
        let assembly = compile_source("let x = 10");
        let code = &assembly.code.code;
        assert_eq!(code[0], Opcode::Constant as u8);
        assert_eq!(code[3], Opcode::CopyValue as u8);
        assert_eq!(code[4], Opcode::DefineGlobal as u8);
    }

    #[test]
    fn function_bodies_end_with_nil_return() {
        let assembly = compile_source("func f() { print(1) }");
        assert_eq!(assembly.functions.len(), 1);
        let chunk = assembly.body(assembly.functions[0].chunk);
        let code = &chunk.code;
        assert_eq!(code[code.len() - 1], Opcode::Return as u8);
        assert_eq!(code[code.len() - 2], Opcode::Nil as u8);
    }

    #[test]
    fn closure_captures_emit_upvalue_descriptors() {
        let source = "func outer() -> Int { var n = 0\n let inc = { n = n + 1\n return n }\n return inc() }";
        let assembly = compile_source(source);
        let closure = assembly
            .functions
            .iter()
            .find(|f| f.name == "<closure>")
            .expect("closure prototype exists");
        assert_eq!(closure.upvalues.len(), 1);
        assert!(closure.upvalues[0].is_local);
    }

    #[test]
    fn main_entry_is_synthesized() {
        let assembly = compile_source("func main() { print(1) }");
        let code = &assembly.code.code;
        // ... GET_GLOBAL main; CALL 0; POP; NIL; HALT
        let tail = &code[code.len() - 7..];
        assert_eq!(tail[0], Opcode::GetGlobal as u8);
        assert_eq!(tail[3], Opcode::Call as u8);
        assert_eq!(tail[4], 0);
        assert_eq!(tail[5], Opcode::Pop as u8);
    }

    #[test]
    fn struct_specializations_compile_per_instantiation() {
        let source = "struct Box<T> { var value: T? = nil }\nvar a = Box<Int>()\nvar b = Box<Bool>()";
        let assembly = compile_source(source);
        let strings: Vec<&str> = assembly.strings.iter().map(|(_, s)| s).collect();
        assert!(strings.contains(&"Box_Int"));
        assert!(strings.contains(&"Box_Bool"));
        assert!(assembly.find_type_def("Box_Int").is_some());
        assert!(assembly.find_type_def("Box_Bool").is_some());
    }

    #[test]
    fn metadata_records_private_field() {
        let source = "class P { private var ssn = \"X\"\n var name = \"J\"\n func show() -> String { return self.name } }\nvar p = P()";
        let assembly = compile_source(source);
        let type_def = assembly.find_type_def("P").expect("P recorded");
        assert!(type_def.flags & type_flags::CLASS != 0);
        let fields: Vec<_> = assembly.field_definitions[type_def.fields.range()].to_vec();
        assert_eq!(fields.len(), 2);
        assert!(fields[0].flags & field_flags::PRIVATE != 0);
        assert_eq!(assembly.string(fields[0].name), "ssn");
    }

    #[test]
    fn method_signature_blob_round_trips() {
        let source = "class A { func add(x: Int, y: Int) -> Int { return x + y } }\nvar a = A()";
        let assembly = compile_source(source);
        let type_def = assembly.find_type_def("A").expect("A recorded");
        let methods = &assembly.method_definitions[type_def.methods.range()];
        let add = methods
            .iter()
            .find(|m| assembly.string(m.name) == "add")
            .expect("add recorded");
        let (ret, params) = assembly.signature_at(add.signature_offset).expect("signature");
        assert_eq!(params.len(), 2);
        let ret_name = assembly.string(assembly.type_names[ret as usize]);
        assert_eq!(ret_name, "Int");
        assert!(add.body_index != NO_INDEX);
    }

    #[test]
    fn enum_cases_carry_labels() {
        let source = "enum R { case ok(v: Int)\n case err(e: Int) }\nvar r = R.ok(v: 1)";
        let assembly = compile_source(source);
        let strings: Vec<&str> = assembly.strings.iter().map(|(_, s)| s).collect();
        assert!(strings.contains(&"ok"));
        assert!(strings.contains(&"v"));
    }

    #[test]
    fn break_outside_loop_is_a_compiler_error() {
        let program = parse_tokens(Lexer::new("while true { break }").tokenize_all()).expect("parse");
        let analysis = analyze(&program).expect("analysis");
        let units = vec![ModuleUnit {
            key: None,
            stem: None,
            statements: program,
        }];
        assert!(compile(&units, &analysis).is_ok());
    }

    #[test]
    fn named_call_emits_label_operands() {
        let assembly = compile_source("func f(x: Int) -> Int { return x }\nprint(f(x: 3))");
        let code = &assembly.code.code;
        assert!(code.contains(&(Opcode::CallNamed as u8)));
    }
}
