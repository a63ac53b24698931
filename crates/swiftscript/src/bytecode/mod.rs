//! Bytecode layer: opcodes, chunk builder, the compiled assembly artifact,
//! the AST → bytecode compiler, and the stack VM that executes it.

pub use assembly::{Assembly, Chunk, FunctionPrototype};
pub use compiler::compile;
pub use op::Opcode;
pub use vm::{Vm, VmConfig};

pub mod assembly;
mod builder;
pub mod compiler;
pub mod op;
pub mod vm;
