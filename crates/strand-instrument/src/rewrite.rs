//! The per-routine rewrite.
//!
//! A routine with at least one suspendable call is regenerated as a
//! dispatch-on-resume state machine: a prologue reads the active frame's
//! resume index and branches to the matching code block; every suspendable
//! call is bracketed by a state save before it and a restore at its resume
//! label; every return pops the continuation frame; a catch-all wrapper
//! pops the frame on any escaping exception and re-raises. The suspension
//! sentinel is not an exception and bypasses all handlers by construction.

use std::collections::HashMap;

use strand_analysis::{analyze, TypeFrame};
use strand_ir::inst::{CallKind, Const, Inst, LabelId};
use strand_ir::names::{COROUTINE_UNIT, SUSPEND_SIGNAL, YIELD_ROUTINE};
use strand_ir::{ExceptionRange, Routine};
use strand_registry::UnitDatabase;
use tracing::{debug, warn};

use crate::error::RewriteError;
use crate::split::SplitPoint;

/// Rewrite one routine of `unit`. Returns `None` when the routine has no
/// suspendable call and needs no transformation.
pub fn rewrite_routine(
    db: &UnitDatabase,
    unit: &str,
    routine: &Routine,
) -> Result<Option<Routine>, RewriteError> {
    if routine.is_synchronized {
        return Err(RewriteError::Synchronized);
    }

    let frames = analyze(db, unit, routine)?;
    let mut rewriter = Rewriter::new(db, unit, routine, frames);
    if !rewriter.collect_splits() {
        return Ok(None);
    }

    for range in &routine.exception_ranges {
        if range.catch_type.as_deref() == Some(SUSPEND_SIGNAL) {
            return Err(RewriteError::CatchesSuspend);
        }
    }

    rewriter.split_ranges()?;
    let (body, ranges) = rewriter.emit()?;

    let mut out = routine.clone();
    out.body = body;
    out.exception_ranges = ranges;
    Ok(Some(out))
}

struct Rewriter<'a> {
    db: &'a UnitDatabase,
    unit: &'a str,
    routine: &'a Routine,
    frames: Vec<Option<TypeFrame>>,
    splits: Vec<SplitPoint>,
    ranges: Vec<ExceptionRange>,
    /// Position of every original label.
    labels: HashMap<LabelId, usize>,
    /// Virtual position of every synthetic before/after label.
    synth: HashMap<LabelId, usize>,
    next_label: LabelId,
    max_slots: u32,
    max_ref_slots: u32,
    warned_locks: bool,
}

impl<'a> Rewriter<'a> {
    fn new(
        db: &'a UnitDatabase,
        unit: &'a str,
        routine: &'a Routine,
        frames: Vec<Option<TypeFrame>>,
    ) -> Self {
        let labels = routine
            .body
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| match inst {
                Inst::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect();
        Self {
            db,
            unit,
            routine,
            frames,
            splits: Vec::new(),
            ranges: routine.exception_ranges.clone(),
            labels,
            synth: HashMap::new(),
            next_label: routine.max_label().map_or(0, |m| m + 1),
            max_slots: 0,
            max_ref_slots: 0,
            warned_locks: false,
        }
    }

    /// Locate every suspendable call. Returns `false` when the routine has
    /// fewer than two split points (fresh entry only) and stays untouched.
    fn collect_splits(&mut self) -> bool {
        self.splits.push(SplitPoint::first());
        let first_saved = self.routine.first_saved_local();

        for (at, inst) in self.routine.body.iter().enumerate() {
            let Some(frame) = &self.frames[at] else {
                continue;
            };
            if let Inst::Call { unit, routine, .. } = inst {
                if self.db.is_suspendable(unit, routine) {
                    if self.db.options().debug {
                        debug!(at, callee = %format!("{unit}::{routine}"), "suspendable call");
                    }
                    let resume = self.splits.len() as u32;
                    let sp = SplitPoint::assign(at, resume, frame, first_saved);
                    self.max_slots = self.max_slots.max(sp.slots());
                    self.max_ref_slots = self.max_ref_slots.max(sp.ref_count);
                    self.splits.push(sp);
                }
            }
        }
        self.splits.len() > 1
    }

    fn alloc_label(&mut self) -> LabelId {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn before_label(&mut self, split: usize) -> LabelId {
        if let Some(label) = self.splits[split].before {
            return label;
        }
        let label = self.alloc_label();
        self.synth.insert(label, self.splits[split].position);
        self.splits[split].before = Some(label);
        label
    }

    fn after_label(&mut self, split: usize) -> LabelId {
        if let Some(label) = self.splits[split].after {
            return label;
        }
        let label = self.alloc_label();
        self.synth.insert(label, self.splits[split].position);
        self.splits[split].after = Some(label);
        label
    }

    /// Position of the first real instruction at or after `label`.
    fn real_position(&self, label: LabelId) -> Result<usize, RewriteError> {
        if let Some(pos) = self.synth.get(&label) {
            return Ok(*pos);
        }
        let mut pos = *self
            .labels
            .get(&label)
            .ok_or(RewriteError::Analysis(strand_analysis::AnalysisError::UnknownLabel { label }))?;
        while pos < self.routine.body.len() && matches!(self.routine.body[pos], Inst::Label(_)) {
            pos += 1;
        }
        Ok(pos)
    }

    /// Divide every exception range that straddles a split point, so no
    /// handler spans a suspend/resume boundary.
    fn split_ranges(&mut self) -> Result<(), RewriteError> {
        for split in 1..self.splits.len() {
            let pos = self.splits[split].position;
            let mut i = 0;
            while i < self.ranges.len() {
                let start = self.real_position(self.ranges[i].start)?;
                let end = self.real_position(self.ranges[i].end)?;
                if start <= pos && end >= pos {
                    if start == pos {
                        self.ranges[i].start = self.after_label(split);
                    } else {
                        if end > pos {
                            let after = self.after_label(split);
                            let tail = ExceptionRange {
                                start: after,
                                end: self.ranges[i].end,
                                handler: self.ranges[i].handler,
                                catch_type: self.ranges[i].catch_type.clone(),
                            };
                            self.ranges.insert(i + 1, tail);
                        }
                        self.ranges[i].end = self.before_label(split);
                    }
                }
                i += 1;
            }
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<(Vec<Inst>, Vec<ExceptionRange>), RewriteError> {
        let l_start = self.alloc_label();
        let l_end = self.alloc_label();
        let l_catch_all = self.alloc_label();
        let resume_labels: Vec<LabelId> =
            (1..self.splits.len()).map(|_| self.alloc_label()).collect();

        let mut out = vec![
            Inst::NextEntry,
            Inst::TableSwitch {
                targets: resume_labels.clone(),
                default: l_start,
            },
            Inst::Label(l_start),
        ];

        self.emit_block(&mut out, 0, 0)?;

        for split in 1..self.splits.len() {
            let call = &self.routine.body[self.splits[split].position];
            if is_yield_call(call) {
                if !matches!(call, Inst::Call { kind: CallKind::Static, .. }) {
                    return Err(RewriteError::InvalidYield);
                }
                // pause here: save, raise the sentinel, resume after it
                self.emit_store(&mut out, split);
                out.push(Inst::RaiseSuspend);
                out.push(Inst::Label(resume_labels[split - 1]));
                self.emit_restore(&mut out, split);
                self.emit_block(&mut out, split, 1)?;
            } else {
                // resume re-executes the call itself
                self.emit_store(&mut out, split);
                out.push(Inst::Label(resume_labels[split - 1]));
                self.emit_restore(&mut out, split);
                self.emit_block(&mut out, split, 0)?;
            }
        }

        out.push(Inst::Label(l_end));
        out.push(Inst::Label(l_catch_all));
        out.push(Inst::PopFrame {
            ref_slots: self.max_ref_slots,
        });
        out.push(Inst::Raise);

        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.push(ExceptionRange {
            start: l_start,
            end: l_end,
            handler: l_catch_all,
            catch_type: None,
        });
        Ok((out, ranges))
    }

    /// Copy block `split`'s original instructions, prefixing every return
    /// with a frame pop. `skip` drops the leading call for the yield case.
    fn emit_block(
        &mut self,
        out: &mut Vec<Inst>,
        split: usize,
        skip: usize,
    ) -> Result<(), RewriteError> {
        let start = self.splits[split].position + skip;
        let end = self
            .splits
            .get(split + 1)
            .map_or(self.routine.body.len(), |s| s.position);

        for inst in &self.routine.body[start..end] {
            match inst {
                Inst::Return => out.push(Inst::PopFrame {
                    ref_slots: self.max_ref_slots,
                }),
                Inst::MonitorEnter | Inst::MonitorExit => {
                    if !self.db.options().allow_locks {
                        return Err(RewriteError::Synchronized);
                    }
                    if !self.warned_locks {
                        self.warned_locks = true;
                        warn!(
                            unit = %self.unit,
                            routine = %self.routine.name,
                            "routine holds locks across suspension points"
                        );
                    }
                }
                _ => {}
            }
            out.push(inst.clone());
        }
        Ok(())
    }

    /// Push (or re-tag) the frame and store every live value: stack values
    /// top-down, then locals above the receiver/parameter region.
    fn emit_store(&mut self, out: &mut Vec<Inst>, split: usize) {
        let sp = &self.splits[split];
        if let Some(label) = sp.before {
            out.push(Inst::Label(label));
        }
        out.push(Inst::PushFrame {
            resume: sp.resume,
            slots: self.max_slots,
        });
        for assignment in sp.stack_slots.iter().rev() {
            match assignment {
                Some((kind, slot)) => out.push(Inst::FramePut {
                    kind: *kind,
                    slot: *slot,
                }),
                // null or uninitialized: dropped, re-materialized at resume
                None => out.push(Inst::Pop),
            }
        }
        for (local, assignment) in sp.local_slots.iter().enumerate() {
            if let Some((kind, slot)) = assignment {
                out.push(Inst::Load(local as u16));
                out.push(Inst::FramePut {
                    kind: *kind,
                    slot: *slot,
                });
            }
        }
    }

    /// Restore locals forward, then rebuild the operand stack bottom-up.
    fn emit_restore(&mut self, out: &mut Vec<Inst>, split: usize) {
        let sp = &self.splits[split];
        for (local, assignment) in sp.local_slots.iter().enumerate() {
            if let Some((kind, slot)) = assignment {
                out.push(Inst::FrameGet {
                    kind: *kind,
                    slot: *slot,
                });
                out.push(Inst::Store(local as u16));
            }
        }
        for local in &sp.null_locals {
            out.push(Inst::Const(Const::Null));
            out.push(Inst::Store(*local));
        }
        for assignment in &sp.stack_slots {
            match assignment {
                Some((kind, slot)) => out.push(Inst::FrameGet {
                    kind: *kind,
                    slot: *slot,
                }),
                None => out.push(Inst::Const(Const::Null)),
            }
        }
        if let Some(label) = sp.after {
            out.push(Inst::Label(label));
        }
    }
}

fn is_yield_call(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::Call { unit, routine, .. } if unit == COROUTINE_UNIT && routine == YIELD_ROUTINE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_ir::inst::TypeDesc;
    use strand_ir::names::OBJECT_ROOT;
    use strand_registry::{MapResolver, Options, UnitRecord};

    fn db() -> UnitDatabase {
        let resolver = MapResolver::new().insert(
            "app/Io",
            UnitRecord::new(OBJECT_ROOT).with_suspendable("read"),
        );
        UnitDatabase::new(Box::new(resolver))
    }

    fn read_call() -> Inst {
        Inst::call_static("app/Io", "read", vec![], Some(TypeDesc::Int))
    }

    #[test]
    fn routine_without_suspendable_calls_is_untouched() {
        let routine = Routine::new("plain").suspendable().with_body(vec![
            Inst::Const(Const::I32(1)),
            Inst::Pop,
            Inst::Return,
        ]);
        assert!(rewrite_routine(&db(), "app/A", &routine).unwrap().is_none());
    }

    #[test]
    fn prologue_dispatches_on_the_resume_index() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![read_call(), Inst::Pop, read_call(), Inst::Pop, Inst::Return]);

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        assert_eq!(out.body[0], Inst::NextEntry);
        match &out.body[1] {
            Inst::TableSwitch { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("expected dispatch switch, got {other:?}"),
        }
    }

    #[test]
    fn every_return_pops_the_frame() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![read_call(), Inst::Pop, Inst::Return]);

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        let returns: Vec<usize> = out
            .body
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Inst::Return))
            .map(|(i, _)| i)
            .collect();
        assert!(!returns.is_empty());
        for at in returns {
            assert!(
                matches!(out.body[at - 1], Inst::PopFrame { .. }),
                "return at {at} not preceded by a frame pop"
            );
        }
    }

    #[test]
    fn yield_becomes_a_sentinel_raise_and_is_not_reexecuted() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![Inst::call_yield(), Inst::Return]);

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        assert!(out.body.iter().any(|i| matches!(i, Inst::RaiseSuspend)));
        assert!(
            !out.body.iter().any(is_yield_call),
            "the raw yield call must not survive the rewrite"
        );
        // the resume label lands after the raise
        let raise = out
            .body
            .iter()
            .position(|i| matches!(i, Inst::RaiseSuspend))
            .unwrap();
        assert!(matches!(out.body[raise + 1], Inst::Label(_)));
    }

    #[test]
    fn save_is_stack_top_down_and_restore_is_locals_then_stack() {
        // one long local and two stack values live across the call
        let routine = Routine::new("f")
            .suspendable()
            .with_locals(1)
            .with_body(vec![
                Inst::Const(Const::I64(9)),
                Inst::Store(0),
                Inst::Const(Const::F64(1.5)),
                Inst::Const(Const::Str("x".into())),
                read_call(),
                Inst::Pop,
                Inst::Pop,
                Inst::Pop,
                Inst::Return,
            ]);

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        let push = out
            .body
            .iter()
            .position(|i| matches!(i, Inst::PushFrame { .. }))
            .unwrap();
        use strand_ir::inst::SlotKind;
        // stack is [double, string-ref]; the lanes assign bottom-up, the
        // save runs top-down, so the ref (ref lane 0) is stored first
        assert_eq!(
            out.body[push + 1],
            Inst::FramePut {
                kind: SlotKind::Ref,
                slot: 0
            }
        );
        assert_eq!(
            out.body[push + 2],
            Inst::FramePut {
                kind: SlotKind::Double,
                slot: 0
            }
        );
        // then the long local, next in the primitive lane
        assert_eq!(out.body[push + 3], Inst::Load(0));
        assert_eq!(
            out.body[push + 4],
            Inst::FramePut {
                kind: SlotKind::Long,
                slot: 1
            }
        );
        // resume label, then locals forward, then stack bottom-up
        assert!(matches!(out.body[push + 5], Inst::Label(_)));
        assert_eq!(
            out.body[push + 6],
            Inst::FrameGet {
                kind: SlotKind::Long,
                slot: 1
            }
        );
        assert_eq!(out.body[push + 7], Inst::Store(0));
        assert_eq!(
            out.body[push + 8],
            Inst::FrameGet {
                kind: SlotKind::Double,
                slot: 0
            }
        );
        assert_eq!(
            out.body[push + 9],
            Inst::FrameGet {
                kind: SlotKind::Ref,
                slot: 0
            }
        );
    }

    #[test]
    fn straddling_exception_range_is_divided_at_the_split() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![
                Inst::Label(0),
                Inst::Const(Const::I32(1)),
                Inst::Pop,
                read_call(),
                Inst::Pop,
                Inst::Label(1),
                Inst::Return,
                Inst::Label(2),
                Inst::Pop,
                Inst::Return,
            ])
            .protect(ExceptionRange {
                start: 0,
                end: 1,
                handler: 2,
                catch_type: Some("app/Error".into()),
            });

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        let user_ranges: Vec<_> = out
            .exception_ranges
            .iter()
            .filter(|r| r.catch_type.is_some())
            .collect();
        assert_eq!(user_ranges.len(), 2, "range must be split in two");
        assert_eq!(user_ranges[0].start, 0);
        assert_ne!(user_ranges[0].end, 1);
        assert_eq!(user_ranges[1].end, 1);
        assert_eq!(user_ranges[0].handler, 2);
        assert_eq!(user_ranges[1].handler, 2);
    }

    #[test]
    fn wrapper_range_is_last_and_catches_everything() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![read_call(), Inst::Pop, Inst::Return]);

        let out = rewrite_routine(&db(), "app/A", &routine).unwrap().unwrap();
        let wrapper = out.exception_ranges.last().unwrap();
        assert_eq!(wrapper.catch_type, None);
        // its handler pops the frame and re-raises
        let handler_pos = out
            .body
            .iter()
            .position(|i| matches!(i, Inst::Label(l) if *l == wrapper.handler))
            .unwrap();
        assert!(matches!(out.body[handler_pos + 1], Inst::PopFrame { .. }));
        assert!(matches!(out.body[handler_pos + 2], Inst::Raise));
    }

    #[test]
    fn synchronized_routine_is_rejected() {
        let routine = Routine::new("f")
            .suspendable()
            .synchronized()
            .with_body(vec![read_call(), Inst::Pop, Inst::Return]);
        assert!(matches!(
            rewrite_routine(&db(), "app/A", &routine),
            Err(RewriteError::Synchronized)
        ));
    }

    #[test]
    fn catching_the_suspend_signal_is_rejected() {
        let routine = Routine::new("f")
            .suspendable()
            .with_body(vec![
                Inst::Label(0),
                read_call(),
                Inst::Pop,
                Inst::Label(1),
                Inst::Return,
                Inst::Label(2),
                Inst::Pop,
                Inst::Return,
            ])
            .protect(ExceptionRange {
                start: 0,
                end: 1,
                handler: 2,
                catch_type: Some(SUSPEND_SIGNAL.into()),
            });
        assert!(matches!(
            rewrite_routine(&db(), "app/A", &routine),
            Err(RewriteError::CatchesSuspend)
        ));
    }

    #[test]
    fn monitors_fail_without_the_lock_escape_hatch() {
        let body = vec![
            Inst::Const(Const::Str("lock".into())),
            Inst::MonitorEnter,
            read_call(),
            Inst::Pop,
            Inst::Const(Const::Str("lock".into())),
            Inst::MonitorExit,
            Inst::Return,
        ];
        let routine = Routine::new("f").suspendable().with_body(body.clone());

        assert!(matches!(
            rewrite_routine(&db(), "app/A", &routine),
            Err(RewriteError::Synchronized)
        ));

        let resolver = MapResolver::new().insert(
            "app/Io",
            UnitRecord::new(OBJECT_ROOT).with_suspendable("read"),
        );
        let lenient = UnitDatabase::with_options(
            Box::new(resolver),
            Options {
                allow_locks: true,
                ..Options::default()
            },
        );
        assert!(rewrite_routine(&lenient, "app/A", &routine).unwrap().is_some());
    }

    #[test]
    fn call_to_unknown_unit_is_conservatively_suspendable() {
        let routine = Routine::new("f").suspendable().with_body(vec![
            Inst::call_static("app/Mystery", "step", vec![], None),
            Inst::Return,
        ]);
        // unknown callee: over-instrument rather than break resumption
        assert!(rewrite_routine(&db(), "app/A", &routine).unwrap().is_some());
    }
}
