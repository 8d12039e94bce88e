use thiserror::Error;

use javelin_bytecode::BytecodeOpcode;

pub mod address;
pub mod codegen;
pub mod regalloc;
pub mod value;

pub use codegen::BinaryOp;

/// Reasons a single method cannot be compiled. All of these abort
/// compilation of the current method only; the caller marks the method
/// not-compilable and execution falls back to the interpreter. None of
/// them ever damages already-compiled code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("no free register and no legalization path")]
    OutOfRegisters,

    #[error("immediate operand cannot be encoded")]
    UnencodableImmediate,

    #[error("literal pool displacement out of range")]
    LiteralPoolOverflow,

    #[error("switch with more than {0} cases")]
    SwitchTooLarge(usize),

    #[error("bytecode {0:?} is not compiled")]
    UnsupportedBytecode(BytecodeOpcode),

    #[error("operand stack shape not supported: {0}")]
    UnsupportedStackShape(&'static str),

    #[error("method takes too many argument words")]
    TooManyArguments,

    #[error("compiled-method object does not fit the code space")]
    OutOfMemory,

    #[error("method is marked not compilable")]
    NotCompilable,
}
