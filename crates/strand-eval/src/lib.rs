//! Reference interpreter for the strand instruction set.
//!
//! Runs routine bodies directly, including everything the instrumenter
//! emits, so rewritten units can be executed end to end against the real
//! continuation-stack protocol. [`EntryPoint`] plugs an interpreted routine
//! into the coroutine driver.

mod entry;
mod error;
mod machine;
mod value;

pub use entry::EntryPoint;
pub use error::{EvalError, EvalResult};
pub use machine::{Machine, Outcome, Unwind, LIST_UNIT, MATH_UNIT};
pub use value::{Obj, ObjRef, Value};
