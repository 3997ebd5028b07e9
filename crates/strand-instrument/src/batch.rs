//! Per-unit driving and the batch surface.

use strand_ir::names::is_special;
use strand_ir::{CodeUnit, FailureReport};
use strand_registry::UnitDatabase;
use tracing::{debug, info, warn};

use crate::error::{InstrumentError, Result, RewriteError};
use crate::rewrite::rewrite_routine;

/// Rewrite every suspendable routine of `unit`. A unit that already
/// carries the marker is returned unchanged; re-instrumentation is a
/// no-op. One failing routine fails the whole unit.
pub fn instrument_unit(db: &UnitDatabase, unit: &CodeUnit) -> Result<CodeUnit> {
    if unit.instrumented {
        debug!(unit = %unit.name, "already instrumented, skipping");
        return Ok(unit.clone());
    }

    let mut out = unit.clone();
    for routine in &mut out.routines {
        if !routine.declares_suspend {
            continue;
        }
        if is_special(&routine.name) {
            return Err(InstrumentError::new(
                &unit.name,
                &routine.name,
                RewriteError::SpecialRoutine,
            ));
        }
        match rewrite_routine(db, &unit.name, routine) {
            Ok(Some(rewritten)) => *routine = rewritten,
            Ok(None) => {}
            Err(cause) => {
                return Err(InstrumentError::new(&unit.name, &routine.name, cause));
            }
        }
    }
    out.instrumented = true;
    Ok(out)
}

/// Processes a working set of units against one registry. Individual
/// failures are collected as reports; they never stop the batch.
pub struct Batch<'a> {
    db: &'a UnitDatabase,
    reports: Vec<FailureReport>,
}

impl<'a> Batch<'a> {
    pub fn new(db: &'a UnitDatabase) -> Self {
        Self {
            db,
            reports: Vec::new(),
        }
    }

    /// Register every unit's suspendability record, then rewrite them all.
    /// Registration runs as a separate first pass so calls between units
    /// of the working set resolve without the conservative default.
    pub fn process(&mut self, units: &[CodeUnit]) -> Vec<CodeUnit> {
        for unit in units {
            self.db.register(unit);
        }

        units
            .iter()
            .map(|unit| match instrument_unit(self.db, unit) {
                Ok(done) => {
                    if self.db.options().verbose {
                        info!(unit = %unit.name, "instrumented");
                    }
                    done
                }
                Err(e) => {
                    warn!(%e, "unit left untouched");
                    self.reports.push(e.report());
                    unit.clone()
                }
            })
            .collect()
    }

    pub fn reports(&self) -> &[FailureReport] {
        &self.reports
    }
}
