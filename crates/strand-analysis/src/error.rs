//! Analysis failures. All of them are hard: the routine they occur in
//! cannot be instrumented, but the batch continues with the next routine.

use strand_ir::LabelId;
use thiserror::Error;

use crate::types::SlotType;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("cannot merge {left} with {right}")]
    Merge { left: SlotType, right: SlotType },

    #[error("operand stack depth differs between joined paths at instruction {at}")]
    DepthMismatch { at: usize },

    #[error("operand stack underflow at instruction {at}")]
    Underflow { at: usize },

    #[error("instruction {at} expects {expected}, found {found}")]
    Operand {
        at: usize,
        expected: &'static str,
        found: SlotType,
    },

    #[error("unknown label {label}")]
    UnknownLabel { label: LabelId },

    #[error("local slot {slot} out of range at instruction {at}")]
    LocalRange { slot: u16, at: usize },

    #[error("instruction {at} may only be emitted by the instrumenter")]
    GeneratedInst { at: usize },

    #[error("control falls off the end of the body at instruction {at}")]
    FallsOffEnd { at: usize },
}
