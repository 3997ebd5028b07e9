//! Code units and routines.

use serde::{Deserialize, Serialize};

use crate::inst::{Inst, LabelId, TypeDesc};

/// One exception-protected region of a routine body.
///
/// Instructions in `[start, end)` (label positions, end exclusive) are
/// covered; a raised exception whose type matches `catch_type` transfers
/// control to `handler` with the exception reference as the sole stack
/// value. `catch_type` of `None` catches everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRange {
    pub start: LabelId,
    pub end: LabelId,
    pub handler: LabelId,
    pub catch_type: Option<String>,
}

/// An addressable routine: name, signature, body, exception table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    /// Static routines have no receiver in local slot 0.
    pub is_static: bool,
    /// Lock-synchronized routines cannot be instrumented.
    pub is_synchronized: bool,
    /// Declared able to suspend. Only these routines are candidates for
    /// rewriting, and only these names enter the suspendability record.
    pub declares_suspend: bool,
    pub params: Vec<TypeDesc>,
    pub ret: Option<TypeDesc>,
    /// Number of local slots the body uses (receiver and parameters
    /// included).
    pub max_locals: u16,
    pub body: Vec<Inst>,
    pub exception_ranges: Vec<ExceptionRange>,
}

impl Routine {
    /// Create an empty static routine with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_static: true,
            is_synchronized: false,
            declares_suspend: false,
            params: Vec::new(),
            ret: None,
            max_locals: 0,
            body: Vec::new(),
            exception_ranges: Vec::new(),
        }
    }

    /// Give the routine a receiver (local slot 0).
    pub fn with_receiver(mut self) -> Self {
        self.is_static = false;
        self
    }

    /// Mark the routine as declared-suspendable.
    pub fn suspendable(mut self) -> Self {
        self.declares_suspend = true;
        self
    }

    /// Mark the routine as lock-synchronized.
    pub fn synchronized(mut self) -> Self {
        self.is_synchronized = true;
        self
    }

    pub fn with_params(mut self, params: Vec<TypeDesc>) -> Self {
        self.params = params;
        self
    }

    pub fn with_ret(mut self, ret: TypeDesc) -> Self {
        self.ret = Some(ret);
        self
    }

    pub fn with_locals(mut self, max_locals: u16) -> Self {
        self.max_locals = max_locals;
        self
    }

    pub fn with_body(mut self, body: Vec<Inst>) -> Self {
        self.body = body;
        self
    }

    pub fn protect(mut self, range: ExceptionRange) -> Self {
        self.exception_ranges.push(range);
        self
    }

    /// Index of the first local slot above the receiver/parameter region.
    /// Saved state starts here; the region below it is re-established by
    /// the re-executed call on resume.
    pub fn first_saved_local(&self) -> u16 {
        let receiver = if self.is_static { 0 } else { 1 };
        receiver + self.params.len() as u16
    }

    /// Highest label id used anywhere in the routine, or `None`.
    pub fn max_label(&self) -> Option<LabelId> {
        let body_max = self
            .body
            .iter()
            .filter_map(|inst| match inst {
                Inst::Label(l) => Some(*l),
                Inst::Jump(l) => Some(*l),
                Inst::Branch { target, .. } => Some(*target),
                Inst::BranchNull { target, .. } => Some(*target),
                Inst::TableSwitch { targets, default } => {
                    targets.iter().copied().chain([*default]).max()
                }
                _ => None,
            })
            .max();
        let range_max = self
            .exception_ranges
            .iter()
            .flat_map(|r| [r.start, r.end, r.handler])
            .max();
        body_max.into_iter().chain(range_max).max()
    }
}

/// A routine container: name, parent reference, routines, and the
/// idempotency marker set after a successful rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub parent: String,
    pub routines: Vec<Routine>,
    /// Set once the unit has been rewritten; re-processing is a no-op.
    pub instrumented: bool,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
            routines: Vec::new(),
            instrumented: false,
        }
    }

    pub fn with_routine(mut self, routine: Routine) -> Self {
        self.routines.push(routine);
        self
    }

    pub fn routine(&self, name: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::Cond;

    #[test]
    fn first_saved_local_counts_receiver_and_params() {
        let r = Routine::new("f")
            .with_receiver()
            .with_params(vec![TypeDesc::Int, TypeDesc::Long]);
        assert_eq!(r.first_saved_local(), 3);

        let s = Routine::new("g").with_params(vec![TypeDesc::Int]);
        assert_eq!(s.first_saved_local(), 1);
    }

    #[test]
    fn max_label_scans_body_and_ranges() {
        let r = Routine::new("f")
            .with_body(vec![
                Inst::Label(3),
                Inst::Branch {
                    cond: Cond::Eq,
                    target: 7,
                },
            ])
            .protect(ExceptionRange {
                start: 3,
                end: 9,
                handler: 5,
                catch_type: None,
            });
        assert_eq!(r.max_label(), Some(9));
        assert_eq!(Routine::new("empty").max_label(), None);
    }
}
