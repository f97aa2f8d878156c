use fluxpilot_derive::Error;

use crate::types::words::{ProgramWord, StackWord};

/// Errors raised by program-image validation or by the interpreter.
///
/// Image validation errors (`InvalidProgramVersion`,
/// `GlobalsBufferTooSmall`, `MemoryBufferTooSmall`) are returned from program
/// construction and never activate a program. Everything else aborts the
/// current run; the host discards the run's result and may start another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineError {
    /// The image header carries an unknown version word.
    #[error("the program image version {0} is not supported")]
    InvalidProgramVersion(ProgramWord),
    /// Unknown opcode encountered in a function body.
    #[error("the value {0} is an invalid opcode")]
    InvalidOp(ProgramWord),
    /// DIV or MOD executed with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,
    /// A read past the end of the program image.
    #[error("the index {0} is out of range of the program image")]
    OutOfBoundsStaticRead(usize),
    /// A globals access outside the globals partition.
    #[error("the index {0} is out of the globals bounds")]
    OutOfBoundsGlobalsAccess(usize),
    /// POP executed on an empty stack.
    #[error("the pop op code was executed on an empty stack")]
    PopOnEmptyStack,
    /// An operation needed more stack values than were present.
    #[error("attempted operation would underflow the stack")]
    StackUnderflow,
    /// An operation would grow the stack past the memory buffer.
    #[error("attempted operation would overflow the stack")]
    StackOverflow,
    /// A call's arg_count exceeds the values on the stack.
    #[error("there are not enough arguments to call the function")]
    TooFewArguments,
    /// The memory buffer cannot hold the image's declared globals.
    #[error("globals buffer too small for the declared size {0}")]
    GlobalsBufferTooSmall(ProgramWord),
    /// The memory buffer leaves less than the minimum stack region.
    #[error("memory buffer too small to hold globals and a working stack")]
    MemoryBufferTooSmall,
    /// A machine index past the instance table.
    #[error("the index {0} is out of range for machine index")]
    MachineIndexOutOfRange(ProgramWord),
    /// A function index past the type's function table.
    #[error("the index {0} is out of range for function index")]
    FunctionIndexOutOfRange(StackWord),
    /// A shared function index past the shared function table.
    #[error("the index {0} is out of range for shared function index")]
    SharedFunctionIndexOutOfRange(StackWord),
    /// A stack value used where a program word is required does not fit.
    #[error("the stack value {0} does not fit in a program word")]
    StackValueTooLargeForProgramWord(StackWord),
    /// A stack value used as an index does not fit in usize.
    #[error("the stack value {0} does not fit in a usize")]
    StackValueTooLargeForUsize(StackWord),
    /// A color channel returned by get_color exceeds 255.
    #[error("the value {0} is out of range of a color channel")]
    ColorOutOfRange(StackWord),
    /// The per-run instruction cap was reached.
    #[error("instruction budget exhausted before the run completed")]
    FuelExhausted,
    /// A call that must leave the stack empty left values behind.
    #[error("{0} values left on the stack after exit")]
    ResidualStackValues(usize),
}
