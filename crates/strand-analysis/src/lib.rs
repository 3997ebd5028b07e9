//! Abstract interpretation of routine bodies.
//!
//! Runs a worklist dataflow over the instruction sequence and produces,
//! per instruction, the types of every operand stack entry and local slot.
//! The instrumenter uses these frames to decide what live state a
//! suspension point must save.

mod analyze;
mod error;
mod types;

pub use analyze::analyze;
pub use error::{AnalysisError, Result};
pub use types::{merge, SlotType, TypeFrame};
