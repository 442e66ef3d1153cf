//! Engine-level error types.
//!
//! Runtime errors inside executing PHP code are ordinary PHP exception
//! objects carried as values and unwound through the exception table; the
//! types here cover everything else: compilation failures, unrecoverable
//! engine conditions, and the terminal uncaught-exception report.

use crate::runtime::Value;
use thiserror::Error;

/// Errors raised while lowering the AST to bytecode.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("'break' outside of loop or switch")]
    BreakOutsideLoop,
    #[error("'continue' outside of loop")]
    ContinueOutsideLoop,
    #[error("break/continue depth {0} exceeds nesting level")]
    BadBreakDepth(u32),
    #[error("too many constants in one function")]
    TooManyConstants,
    #[error("function body exceeds the 16-bit jump range")]
    FunctionTooLarge,
    #[error("too many local variables in one function")]
    TooManyLocals,
    #[error("cannot redeclare {0}")]
    DuplicateDeclaration(String),
    #[error("cannot use $this outside of a class method")]
    ThisOutsideMethod,
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("[] append is only valid as an assignment target")]
    AppendOutsideAssignment,
    #[error("default parameter value must be a literal")]
    NonLiteralDefault,
    #[error("class constant value must be a literal")]
    NonLiteralConstant,
    #[error("enum case value must be a literal")]
    NonLiteralEnumCase,
}

/// Unrecoverable engine conditions. These terminate the VM and are reported
/// to the host; PHP code cannot catch them.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("maximum call depth of {0} exceeded")]
    StackOverflow(usize),
    #[error("corrupted bytecode: {0}")]
    CorruptedBytecode(String),
    #[error("failed writing to output: {0}")]
    Output(#[from] std::io::Error),
}

/// Error type returned by the public execution entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("Uncaught {class}: {message}\nStack trace:\n{trace}")]
    Uncaught {
        class: String,
        message: String,
        trace: String,
    },
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Internal result error for opcode handlers: either a PHP value in flight
/// (caught by the exception table) or a fatal condition.
#[derive(Debug)]
pub enum VmError {
    /// A thrown PHP exception object, unwinding toward a handler.
    Throw(Value),
    Fatal(FatalError),
}

impl From<FatalError> for VmError {
    fn from(e: FatalError) -> Self {
        VmError::Fatal(e)
    }
}
