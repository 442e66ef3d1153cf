//! phpvm: a bytecode compiler and virtual machine core for PHP 8.5.
//!
//! The crate covers the execution core: lowering a parsed program to a
//! stack-based bytecode, executing it on a register-free VM with inline
//! caches for property and method dispatch, a reference-counted heap with
//! a trial-deletion cycle collector, and exception-table unwinding. The
//! lexer and parser live outside; they hand us an [`ast::Program`].

pub mod ast;
pub mod errors;
pub mod heap;
pub mod runtime;
pub mod vm;

pub use errors::{CompileError, EngineError, FatalError};
pub use runtime::Value;
pub use vm::compiler::{compile, CompilationUnit};
pub use vm::{Vm, VmOptions};

use std::sync::Arc;

/// Compile and execute a program, returning everything it wrote to the
/// output stream.
pub fn run(program: &ast::Program) -> Result<String, EngineError> {
    run_with_options(program, VmOptions::default())
}

pub fn run_with_options(
    program: &ast::Program,
    options: VmOptions,
) -> Result<String, EngineError> {
    let unit = Arc::new(compile(program)?);
    let mut vm = Vm::with_options(Vec::new(), options);
    vm.execute(&unit)?;
    Ok(String::from_utf8_lossy(&vm.into_output()).into_owned())
}
