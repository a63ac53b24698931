use std::{env, fs, path::Path, process::ExitCode, time::Instant};

use swiftscript::{FileResolver, ResultCode, Script, ScriptError};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: swiftscript <file.ss>");
        return ExitCode::FAILURE;
    };

    let source = match fs::read_to_string(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read '{file_path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    // Imports resolve relative to the script's directory.
    let base_dir = Path::new(file_path).parent().unwrap_or_else(|| Path::new("."));
    let mut resolver = FileResolver::new(base_dir);

    let start = Instant::now();
    let mut script = match Script::compile_with_resolver(&source, &mut resolver) {
        Ok(script) => script,
        Err(err) => return report(&err),
    };
    eprintln!("compiled in {:?}", start.elapsed());

    let start = Instant::now();
    match script.execute() {
        Ok(_) => {
            eprintln!("finished in {:?}", start.elapsed());
            ExitCode::SUCCESS
        }
        Err(err) => report(&err),
    }
}

fn report(err: &ScriptError) -> ExitCode {
    eprintln!("{err}");
    let code = match err.result_code() {
        ResultCode::Ok => 0,
        ResultCode::CompileError => 2,
        ResultCode::TypeCheckError => 3,
        ResultCode::RuntimeError => 4,
        ResultCode::InvalidArg => 5,
        ResultCode::NotFound => 6,
        ResultCode::OutOfMemory => 7,
        ResultCode::IoError => 8,
    };
    ExitCode::from(code)
}
