//! Embedding interface.
//!
//! [`Script`] wires the full pipeline: lex → parse → import expansion →
//! analysis → compilation, holding the resulting [`Assembly`] plus the
//! host-function registry. Execution spins up a fresh VM per run; results
//! and globals cross the boundary as [`HostValue`]s, so nothing heap-bound
//! escapes the VM's lifetime. Analyzer warnings are printed to stderr by
//! `compile`/`compile_with_resolver` and also kept for inspection.

use crate::{
    analyze,
    bytecode::{self, Assembly, Vm, VmConfig},
    error::{Diagnostic, ScriptError},
    io::{PrintWriter, ReadLineSource, StdPrint, StdReadLine},
    lexer::Lexer,
    modules::{ModuleLoader, ModuleResolver},
    native::{HostValue, NativeFn, NativeRegistry, NativeTypeInfo},
    parse,
};

/// A compiled program plus its host bindings.
#[derive(Debug)]
pub struct Script {
    assembly: Assembly,
    natives: NativeRegistry,
    warnings: Vec<Diagnostic>,
    config: VmConfig,
    /// Globals injected into every run before execution.
    preset_globals: Vec<(String, HostValue)>,
    /// Wrapped native pointers injected into every run.
    preset_natives: Vec<(String, String, u64, crate::native::NativeOwnership)>,
}

impl Script {
    /// Compiles source with no module resolver: `import` keys resolve as
    /// filesystem paths relative to the current directory.
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let mut resolver = crate::modules::FileResolver::new(".");
        Self::compile_full(source, &mut resolver, &[])
    }

    /// Compiles source, resolving imports through the given resolver.
    pub fn compile_with_resolver(source: &str, resolver: &mut dyn ModuleResolver) -> Result<Self, ScriptError> {
        Self::compile_full(source, resolver, &[])
    }

    /// Compiles source that references host-provided names: preset globals
    /// and registered native functions must be declared here so the
    /// analyzer accepts them.
    pub fn compile_with_hosts(source: &str, host_names: &[&str]) -> Result<Self, ScriptError> {
        let mut resolver = crate::modules::FileResolver::new(".");
        Self::compile_full(source, &mut resolver, host_names)
    }

    pub fn compile_full(
        source: &str,
        resolver: &mut dyn ModuleResolver,
        host_names: &[&str],
    ) -> Result<Self, ScriptError> {
        let tokens = Lexer::new(source).tokenize_all();
        let program = parse::parse(tokens)?;

        let mut loader = ModuleLoader::new(resolver);
        let units = loader.expand(program)?;

        let combined: Vec<_> = units.iter().flat_map(|u| u.statements.iter().cloned()).collect();
        let host_globals: Vec<String> = host_names.iter().map(|s| (*s).to_owned()).collect();
        let analysis = analyze::analyze_with_globals(&combined, &host_globals)?;
        for warning in &analysis.warnings {
            eprintln!("{warning}");
        }

        let assembly = bytecode::compile(&units, &analysis)?;
        Ok(Self {
            assembly,
            natives: NativeRegistry::new(),
            warnings: analysis.warnings,
            config: VmConfig::default(),
            preset_globals: Vec::new(),
            preset_natives: Vec::new(),
        })
    }

    /// Loads a pre-serialized assembly (see the on-disk format in `assembly`).
    pub fn from_assembly_bytes(bytes: &[u8]) -> Result<Self, ScriptError> {
        let assembly = Assembly::from_bytes(bytes)?;
        Ok(Self {
            assembly,
            natives: NativeRegistry::new(),
            warnings: Vec::new(),
            config: VmConfig::default(),
            preset_globals: Vec::new(),
            preset_natives: Vec::new(),
        })
    }

    /// Serializes the compiled assembly.
    #[must_use]
    pub fn to_assembly_bytes(&self) -> Vec<u8> {
        self.assembly.to_bytes()
    }

    #[must_use]
    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    #[must_use]
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn set_config(&mut self, config: VmConfig) {
        self.config = config;
    }

    // ---- Host bindings ----

    pub fn register_native(&mut self, name: impl Into<String>, function: NativeFn) {
        self.natives.register_function(name, function);
    }

    pub fn unregister_native(&mut self, name: &str) -> bool {
        self.natives.unregister_function(name)
    }

    pub fn register_native_type(&mut self, info: NativeTypeInfo) {
        self.natives.register_type(info);
    }

    /// Presets a global for every subsequent run.
    pub fn set_global(&mut self, name: impl Into<String>, value: HostValue) {
        self.preset_globals.push((name.into(), value));
    }

    /// Presets a wrapped native pointer as a global for every subsequent
    /// run. Pair with [`Self::register_native_type`] so property reads and
    /// the release callback resolve.
    pub fn set_native_global(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        handle: u64,
        ownership: crate::native::NativeOwnership,
    ) {
        self.preset_natives.push((name.into(), type_name.into(), handle, ownership));
    }

    // ---- Execution ----

    /// Runs to completion against process stdio.
    pub fn execute(&mut self) -> Result<HostValue, ScriptError> {
        let mut print = StdPrint;
        let mut input = StdReadLine;
        self.execute_with(&mut print, &mut input)
    }

    /// Runs to completion with injected IO.
    pub fn execute_with(
        &mut self,
        print: &mut dyn PrintWriter,
        input: &mut dyn ReadLineSource,
    ) -> Result<HostValue, ScriptError> {
        let mut vm = Vm::new(&self.assembly, print, input, &mut self.natives, self.config.clone());
        for (name, value) in &self.preset_globals {
            vm.define_host_global(name, value.clone());
        }
        for (name, type_name, handle, ownership) in &self.preset_natives {
            vm.define_native_global(name, type_name, *handle, *ownership);
        }
        let result = vm.run_program();
        let converted = result.map(|v| vm.to_host_value(v));
        vm.shutdown();
        converted.map_err(ScriptError::from)
    }

    /// Runs the program, then invokes a named global function with the
    /// given arguments and returns its result.
    pub fn call_global(&mut self, name: &str, args: &[HostValue]) -> Result<HostValue, ScriptError> {
        let mut print = StdPrint;
        let mut input = StdReadLine;
        self.call_global_with(name, args, &mut print, &mut input)
    }

    pub fn call_global_with(
        &mut self,
        name: &str,
        args: &[HostValue],
        print: &mut dyn PrintWriter,
        input: &mut dyn ReadLineSource,
    ) -> Result<HostValue, ScriptError> {
        let mut vm = Vm::new(&self.assembly, print, input, &mut self.natives, self.config.clone());
        for (preset_name, value) in &self.preset_globals {
            vm.define_host_global(preset_name, value.clone());
        }
        for (preset_name, type_name, handle, ownership) in &self.preset_natives {
            vm.define_native_global(preset_name, type_name, *handle, *ownership);
        }
        let outcome = vm
            .run_program()
            .and_then(|_| vm.call_host_global(name, args));
        vm.shutdown();
        outcome.map_err(ScriptError::from)
    }

    /// Runs the program and reads a global back out.
    pub fn get_global(&mut self, name: &str) -> Result<Option<HostValue>, ScriptError> {
        let mut print = StdPrint;
        let mut input = StdReadLine;
        let mut vm = Vm::new(&self.assembly, &mut print, &mut input, &mut self.natives, self.config.clone());
        for (preset_name, value) in &self.preset_globals {
            vm.define_host_global(preset_name, value.clone());
        }
        for (preset_name, type_name, handle, ownership) in &self.preset_natives {
            vm.define_native_global(preset_name, type_name, *handle, *ownership);
        }
        let outcome = vm.run_program().map(|_| vm.host_global(name));
        vm.shutdown();
        outcome.map_err(ScriptError::from)
    }
}

/// Convenience: compile and run a source string, collecting printed lines.
pub fn run_source_collecting(source: &str) -> Result<(HostValue, Vec<String>), ScriptError> {
    let mut script = Script::compile(source)?;
    let mut print = crate::io::CollectStringPrint::new();
    let mut input = StdReadLine;
    let result = script.execute_with(&mut print, &mut input)?;
    Ok((result, print.lines().to_vec()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ResultCode;

    #[test]
    fn executes_a_trivial_program() {
        let (_, lines) = run_source_collecting("print(1 + 2)").expect("runs");
        assert_eq!(lines, vec!["3"]);
    }

    #[test]
    fn type_errors_map_to_result_code() {
        let err = Script::compile("let x = 1\nx = 2").expect_err("type error");
        assert_eq!(err.result_code(), ResultCode::TypeCheckError);
    }

    #[test]
    fn parse_errors_map_to_compile_code() {
        let err = Script::compile("let = ").expect_err("parse error");
        assert_eq!(err.result_code(), ResultCode::CompileError);
    }

    #[test]
    fn assembly_round_trip_executes() {
        let script = Script::compile("print(40 + 2)").expect("compiles");
        let bytes = script.to_assembly_bytes();
        let mut restored = Script::from_assembly_bytes(&bytes).expect("loads");
        let mut print = crate::io::CollectStringPrint::new();
        let mut input = StdReadLine;
        restored.execute_with(&mut print, &mut input).expect("runs");
        assert_eq!(print.lines(), ["42"]);
    }

    #[test]
    fn call_global_invokes_function() {
        let mut script = Script::compile("func double(x: Int) -> Int { return x * 2 }").expect("compiles");
        let result = script.call_global("double", &[HostValue::Int(21)]).expect("calls");
        assert_eq!(result, HostValue::Int(42));
    }

    #[test]
    fn preset_globals_are_visible() {
        let mut script = Script::compile_with_hosts("print(greeting)", &["greeting"]).expect("compiles");
        script.set_global("greeting", HostValue::Str("hello".to_owned()));
        let mut print = crate::io::CollectStringPrint::new();
        let mut input = StdReadLine;
        script.execute_with(&mut print, &mut input).expect("runs");
        assert_eq!(print.lines(), ["hello"]);
    }

    #[test]
    fn native_pointer_properties_and_release() {
        use std::{cell::RefCell, rc::Rc};

        use crate::native::{NativeOwnership, NativeTypeInfo};

        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        let mut script = Script::compile_with_hosts("print(widget.size)", &["widget"]).expect("compiles");
        script.register_native_type(NativeTypeInfo {
            type_name: "Widget".to_owned(),
            get_property: Some(Box::new(|handle, name| match name {
                "size" => Some(HostValue::Int(handle as i64 * 2)),
                _ => None,
            })),
            release: Some(Box::new(move |handle| sink.borrow_mut().push(handle))),
        });
        script.set_native_global("widget", "Widget", 21, NativeOwnership::VmOwned);
        let mut print = crate::io::CollectStringPrint::new();
        let mut input = StdReadLine;
        script.execute_with(&mut print, &mut input).expect("runs");
        assert_eq!(print.lines(), ["42"]);
        assert_eq!(*released.borrow(), vec![21]);
    }

    #[test]
    fn native_function_bridges() {
        let mut script = Script::compile_with_hosts("print(add_ints(40, 2))", &["add_ints"]).expect("compiles");
        script.register_native(
            "add_ints",
            Box::new(|args| match args {
                [HostValue::Int(a), HostValue::Int(b)] => Ok(HostValue::Int(a + b)),
                _ => Err(crate::error::RuntimeError::new("add_ints requires two Ints")),
            }),
        );
        let mut print = crate::io::CollectStringPrint::new();
        let mut input = StdReadLine;
        script.execute_with(&mut print, &mut input).expect("runs");
        assert_eq!(print.lines(), ["42"]);
    }
}
