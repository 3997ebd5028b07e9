//! Instrumentation failures.

use strand_analysis::AnalysisError;
use strand_ir::FailureReport;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Why one routine cannot be rewritten.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("synchronisation")]
    Synchronized,

    #[error("suspendable construction routine")]
    SpecialRoutine,

    #[error("catch for the suspend signal")]
    CatchesSuspend,

    #[error("invalid call to yield")]
    InvalidYield,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// A rewrite failure with its location. One failing routine fails its whole
/// unit; the batch keeps the unit untouched and moves on.
#[derive(Debug, Error)]
#[error("unable to instrument {unit}::{routine} because of {cause}")]
pub struct InstrumentError {
    pub unit: String,
    pub routine: String,
    #[source]
    pub cause: RewriteError,
}

impl InstrumentError {
    pub fn new(unit: impl Into<String>, routine: impl Into<String>, cause: RewriteError) -> Self {
        Self {
            unit: unit.into(),
            routine: routine.into(),
            cause,
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport::new(self.cause.to_string(), &self.unit, &self.routine)
    }
}
