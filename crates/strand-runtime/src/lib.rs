//! Runtime support for rewritten routines: the continuation stack that
//! holds saved activation state across suspensions, and the coroutine
//! driver that owns one such stack and steps the computation through its
//! lifecycle.

mod driver;
mod stack;

pub use driver::{ActiveStack, CoRunnable, Coroutine, CoroutineError, Signal, SnapshotError, State};
pub use stack::ContinuationStack;
