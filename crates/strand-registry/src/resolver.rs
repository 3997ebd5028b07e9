//! The external ancestry resolver interface.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strand_ir::CodeUnit;

/// The suspendability record of one unit: its parent and the names of its
/// routines known to suspend. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub parent: String,
    pub suspendable: BTreeSet<String>,
}

impl UnitRecord {
    pub fn new(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            suspendable: BTreeSet::new(),
        }
    }

    pub fn with_suspendable(mut self, routine: impl Into<String>) -> Self {
        self.suspendable.insert(routine.into());
        self
    }

    /// Scan a working-set unit: every routine declared able to suspend
    /// enters the record.
    pub fn from_unit(unit: &CodeUnit) -> Self {
        Self {
            parent: unit.parent.clone(),
            suspendable: unit
                .routines
                .iter()
                .filter(|r| r.declares_suspend)
                .map(|r| r.name.clone())
                .collect(),
        }
    }
}

/// Answers parent/suspendability queries for units outside the working
/// set. Implementations return `None` for unknown units rather than
/// failing; the registry treats not-found as the conservative default.
pub trait AncestryResolver {
    /// The suspendability record of a unit, or `None` if unknown.
    fn record(&self, unit: &str) -> Option<UnitRecord>;

    /// The direct parent of a unit, or `None` if unknown.
    fn parent(&self, unit: &str) -> Option<String>;
}

/// A resolver that knows nothing.
pub struct NoResolver;

impl AncestryResolver for NoResolver {
    fn record(&self, _unit: &str) -> Option<UnitRecord> {
        None
    }

    fn parent(&self, _unit: &str) -> Option<String> {
        None
    }
}

/// A table-backed resolver, for tests and in-memory universes.
#[derive(Default)]
pub struct MapResolver {
    records: BTreeMap<String, UnitRecord>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, unit: impl Into<String>, record: UnitRecord) -> Self {
        self.records.insert(unit.into(), record);
        self
    }
}

impl AncestryResolver for MapResolver {
    fn record(&self, unit: &str) -> Option<UnitRecord> {
        self.records.get(unit).cloned()
    }

    fn parent(&self, unit: &str) -> Option<String> {
        self.records.get(unit).map(|r| r.parent.clone())
    }
}
