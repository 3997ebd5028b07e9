//! Shared types for the strand instrumenter.
//!
//! This crate defines the code-unit model, the stack-machine instruction
//! set, type descriptors, failure reports, and the well-known unit names
//! shared across all instrumentation stages.

pub mod inst;
pub mod names;
mod report;
mod unit;

pub use inst::{BinOp, CallKind, Cond, Const, Inst, LabelId, PrimKind, SlotKind, TypeDesc};
pub use report::FailureReport;
pub use unit::{CodeUnit, ExceptionRange, Routine};
