//! Runtime error types for the strand interpreter.

use std::fmt;

/// Evaluation error — runtime traps and protocol violations. These are
/// machine faults, not thrown exception values; user handlers never see
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// Division by zero and friends
    ArithmeticTrap(String),
    /// Null used as a receiver or array
    NullAccess(String),
    /// Array index outside its bounds
    IndexOutOfBounds(String),
    /// Operand of the wrong kind for an instruction
    TypeMismatch(String),
    /// Operand stack popped while empty
    StackUnderflow(String),
    /// Jump or exception range names a label with no position
    UnknownLabel(String),
    /// No unit registered under this name
    UnknownUnit(String),
    /// No routine of this name on the unit or its ancestors
    UnknownRoutine(String),
    /// Continuation-stack instruction executed with no active stack,
    /// i.e. outside a coroutine run
    NoActiveStack(String),
    /// Direct call to the suspend primitive in un-rewritten code
    NotInstrumented(String),
    /// Execution ran past the end of a routine body
    FellOffEnd(String),
    /// An exception left the entry routine uncaught
    UncaughtException(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArithmeticTrap(msg) => write!(f, "arithmetic trap: {msg}"),
            Self::NullAccess(msg) => write!(f, "null access: {msg}"),
            Self::IndexOutOfBounds(msg) => write!(f, "index out of bounds: {msg}"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            Self::StackUnderflow(msg) => write!(f, "operand stack underflow: {msg}"),
            Self::UnknownLabel(msg) => write!(f, "unknown label: {msg}"),
            Self::UnknownUnit(name) => write!(f, "unknown unit: {name}"),
            Self::UnknownRoutine(name) => write!(f, "unknown routine: {name}"),
            Self::NoActiveStack(msg) => write!(f, "no active continuation stack: {msg}"),
            Self::NotInstrumented(msg) => write!(f, "not instrumented: {msg}"),
            Self::FellOffEnd(msg) => write!(f, "fell off the end of: {msg}"),
            Self::UncaughtException(msg) => write!(f, "uncaught exception: {msg}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Result alias for interpreter operations.
pub type EvalResult<T> = Result<T, EvalError>;
