//! Structured failure reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a unit or routine could not be rewritten.
///
/// Collected per batch; a report never stops processing of other units.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("unable to instrument {unit}::{routine} because of {reason}")]
pub struct FailureReport {
    pub reason: String,
    pub unit: String,
    pub routine: String,
}

impl FailureReport {
    pub fn new(
        reason: impl Into<String>,
        unit: impl Into<String>,
        routine: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            unit: unit.into(),
            routine: routine.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let r = FailureReport::new("synchronisation", "app/Worker", "step");
        assert_eq!(
            r.to_string(),
            "unable to instrument app/Worker::step because of synchronisation"
        );
    }

    #[test]
    fn json_round_trip() {
        let r = FailureReport::new("special routine", "app/A", "<init>");
        let json = serde_json::to_string(&r).unwrap();
        let back: FailureReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
