//! Rewrites already-compiled routines into resumable state machines.
//!
//! Any routine that (transitively) calls a suspendable routine is
//! regenerated so it can pause mid-execution and later resume with all
//! live state restored from the continuation stack: the registry answers
//! which calls can suspend, the analyzer reports what is live at each of
//! them, and the rewriter emits the dispatch prologue, the save/restore
//! brackets, and the frame-popping epilogues.

mod batch;
mod error;
mod rewrite;
mod split;

pub use batch::{instrument_unit, Batch};
pub use error::{InstrumentError, Result, RewriteError};
pub use rewrite::rewrite_routine;
pub use split::{SplitPoint, SlotAssignment};
