//! The cached unit database.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strand_ir::names::{
    is_platform, is_special, BASE_EXCEPTION, COROUTINE_UNIT, OBJECT_ROOT, YIELD_ROUTINE,
};
use strand_ir::CodeUnit;
use tracing::{debug, warn};

use crate::resolver::{AncestryResolver, UnitRecord};

/// Recognized batch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Tolerate lock-acquire/release across suspension points with a
    /// warning instead of failing.
    pub allow_locks: bool,
    /// Report each processed unit name.
    pub verbose: bool,
    /// Emit the detailed per-instruction analysis trace.
    pub debug: bool,
}

/// Collects suspendability records and ancestry for code units.
///
/// Lookups consult the cache first, then the injected resolver. A unit
/// that cannot be resolved anywhere is assumed suspendable: silently
/// producing an un-instrumented call would break resumption, so the
/// registry over-instruments instead and logs the degradation.
pub struct UnitDatabase {
    resolver: Box<dyn AncestryResolver>,
    records: RefCell<HashMap<String, UnitRecord>>,
    parents: RefCell<HashMap<String, String>>,
    options: Options,
}

impl UnitDatabase {
    pub fn new(resolver: Box<dyn AncestryResolver>) -> Self {
        Self::with_options(resolver, Options::default())
    }

    pub fn with_options(resolver: Box<dyn AncestryResolver>, options: Options) -> Self {
        let db = Self {
            resolver,
            records: RefCell::new(HashMap::new()),
            parents: RefCell::new(HashMap::new()),
            options,
        };
        // The suspend primitive is always known.
        db.register_record(
            COROUTINE_UNIT,
            UnitRecord::new(OBJECT_ROOT).with_suspendable(YIELD_ROUTINE),
        );
        db
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Add a working-set unit's suspendability record.
    pub fn register(&self, unit: &CodeUnit) {
        self.register_record(unit.name.clone(), UnitRecord::from_unit(unit));
    }

    /// Add a record directly (for units without bodies in the working set).
    pub fn register_record(&self, unit: impl Into<String>, record: UnitRecord) {
        self.records.borrow_mut().insert(unit.into(), record);
    }

    /// Is `routine`, called on `unit`, able to suspend?
    ///
    /// Construction/initialization routines are never suspendable. The
    /// parent chain is walked until the record answers, a platform unit is
    /// reached (not suspendable), or resolution fails (conservatively
    /// suspendable).
    pub fn is_suspendable(&self, unit: &str, routine: &str) -> bool {
        if is_special(routine) {
            return false;
        }

        let mut current = unit.to_string();
        loop {
            if is_platform(&current) {
                return false;
            }
            let record = match self.record_of(&current) {
                Some(record) => record,
                None => {
                    warn!(unit = %current, routine, "unit not found, assuming suspendable");
                    return true;
                }
            };
            if record.suspendable.contains(routine) {
                return true;
            }
            current = record.parent;
        }
    }

    /// Nearest common ancestor of two units, or `None` if either chain is
    /// unavailable or the chains share no element.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let chain_a = self.chain(a)?;
        let chain_b = self.chain(b)?;

        let mut idx = 0;
        let num = chain_a.len().min(chain_b.len());
        while idx < num && chain_a[idx] == chain_b[idx] {
            idx += 1;
        }
        if idx > 0 {
            Some(chain_a[idx - 1].clone())
        } else {
            None
        }
    }

    /// True iff the parent walk reaches the base exception type before the
    /// object root.
    pub fn is_exception_type(&self, unit: &str) -> bool {
        let mut current = unit.to_string();
        loop {
            if current == BASE_EXCEPTION {
                return true;
            }
            if current == OBJECT_ROOT {
                return false;
            }
            match self.direct_parent(&current) {
                Some(parent) => current = parent,
                None => {
                    debug!(unit = %current, "cannot determine parent");
                    return false;
                }
            }
        }
    }

    /// Full ancestry chain, root first, self last. `None` if any link is
    /// unresolvable.
    fn chain(&self, unit: &str) -> Option<Vec<String>> {
        let mut result = Vec::new();
        let mut current = unit.to_string();
        loop {
            result.insert(0, current.clone());
            if current == OBJECT_ROOT {
                return Some(result);
            }
            match self.direct_parent(&current) {
                Some(parent) => current = parent,
                None => {
                    debug!(unit = %current, "cannot determine parent");
                    return None;
                }
            }
        }
    }

    fn record_of(&self, unit: &str) -> Option<UnitRecord> {
        if let Some(record) = self.records.borrow().get(unit) {
            return Some(record.clone());
        }
        let record = self.resolver.record(unit)?;
        self.records
            .borrow_mut()
            .insert(unit.to_string(), record.clone());
        Some(record)
    }

    fn direct_parent(&self, unit: &str) -> Option<String> {
        if let Some(record) = self.records.borrow().get(unit) {
            return Some(record.parent.clone());
        }
        if let Some(parent) = self.parents.borrow().get(unit) {
            return Some(parent.clone());
        }
        let parent = self.resolver.parent(unit)?;
        self.parents
            .borrow_mut()
            .insert(unit.to_string(), parent.clone());
        Some(parent)
    }
}
