//! Worklist dataflow over a routine body.
//!
//! Produces, per instruction, the abstract frame holding before it
//! executes (`None` for unreachable instructions). Exception edges are
//! modeled precisely: every instruction inside a protected range feeds the
//! handler its locals plus a one-deep stack holding the catch type.

use std::collections::HashMap;

use strand_ir::inst::{CallKind, Const, Inst, LabelId};
use strand_ir::names::{element_type, is_array, BASE_EXCEPTION};
use strand_ir::Routine;
use strand_registry::UnitDatabase;
use tracing::debug;

use crate::error::{AnalysisError, Result};
use crate::types::{SlotType, TypeFrame};

/// Compute the type frame before every instruction of `routine`, declared
/// in the unit named `unit` (the receiver type of non-static routines).
pub fn analyze(
    db: &UnitDatabase,
    unit: &str,
    routine: &Routine,
) -> Result<Vec<Option<TypeFrame>>> {
    let body = &routine.body;
    let mut frames: Vec<Option<TypeFrame>> = vec![None; body.len()];
    if body.is_empty() {
        return Ok(frames);
    }

    let labels = label_positions(body);
    let handlers = handler_edges(routine, &labels)?;

    frames[0] = Some(entry_frame(unit, routine));
    let mut work = vec![0usize];

    while let Some(at) = work.pop() {
        let Some(frame) = frames[at].clone() else {
            continue;
        };

        if db.options().debug {
            debug!(at, inst = ?body[at], stack = frame.stack.len(), "analyzing");
        }

        // exception edges fire from the state before the instruction
        for (handler, catch_type) in handlers.get(&at).into_iter().flatten() {
            let thrown = TypeFrame {
                locals: frame.locals.clone(),
                stack: vec![SlotType::Ref(catch_type.clone())],
            };
            flow_into(db, &mut frames, &mut work, *handler, thrown)?;
        }

        for (next, out) in step(&frame, body, at, routine, &labels)? {
            flow_into(db, &mut frames, &mut work, next, out)?;
        }
    }

    Ok(frames)
}

fn flow_into(
    db: &UnitDatabase,
    frames: &mut [Option<TypeFrame>],
    work: &mut Vec<usize>,
    at: usize,
    incoming: TypeFrame,
) -> Result<()> {
    match &mut frames[at] {
        Some(existing) => {
            if existing.merge_from(db, &incoming, at)? {
                work.push(at);
            }
        }
        slot @ None => {
            *slot = Some(incoming);
            work.push(at);
        }
    }
    Ok(())
}

fn entry_frame(unit: &str, routine: &Routine) -> TypeFrame {
    let mut locals = Vec::new();
    if !routine.is_static {
        locals.push(SlotType::Ref(unit.to_string()));
    }
    for param in &routine.params {
        locals.push(SlotType::from_desc(param));
    }
    while locals.len() < routine.max_locals as usize {
        locals.push(SlotType::Uninit);
    }
    TypeFrame {
        locals,
        stack: Vec::new(),
    }
}

fn label_positions(body: &[Inst]) -> HashMap<LabelId, usize> {
    body.iter()
        .enumerate()
        .filter_map(|(i, inst)| match inst {
            Inst::Label(l) => Some((*l, i)),
            _ => None,
        })
        .collect()
}

fn resolve(labels: &HashMap<LabelId, usize>, label: LabelId) -> Result<usize> {
    labels
        .get(&label)
        .copied()
        .ok_or(AnalysisError::UnknownLabel { label })
}

/// Per-position exception edges: `(handler position, catch type)`.
fn handler_edges(
    routine: &Routine,
    labels: &HashMap<LabelId, usize>,
) -> Result<HashMap<usize, Vec<(usize, String)>>> {
    let mut edges: HashMap<usize, Vec<(usize, String)>> = HashMap::new();
    for range in &routine.exception_ranges {
        let start = resolve(labels, range.start)?;
        let end = resolve(labels, range.end)?;
        let handler = resolve(labels, range.handler)?;
        let catch_type = range
            .catch_type
            .clone()
            .unwrap_or_else(|| BASE_EXCEPTION.to_string());
        for at in start..end {
            edges
                .entry(at)
                .or_default()
                .push((handler, catch_type.clone()));
        }
    }
    Ok(edges)
}

fn pop(stack: &mut Vec<SlotType>, at: usize) -> Result<SlotType> {
    stack.pop().ok_or(AnalysisError::Underflow { at })
}

fn pop_expect(stack: &mut Vec<SlotType>, at: usize, expected: SlotType) -> Result<()> {
    let found = pop(stack, at)?;
    if found != expected {
        return Err(AnalysisError::Operand {
            at,
            expected: match expected {
                SlotType::Int => "int",
                SlotType::Long => "long",
                SlotType::Float => "float",
                SlotType::Double => "double",
                _ => "value",
            },
            found,
        });
    }
    Ok(())
}

fn pop_reference(stack: &mut Vec<SlotType>, at: usize) -> Result<SlotType> {
    let found = pop(stack, at)?;
    if !found.is_reference() {
        return Err(AnalysisError::Operand {
            at,
            expected: "reference",
            found,
        });
    }
    Ok(found)
}

/// Execute one instruction abstractly; return the successor positions with
/// their out-frames.
fn step(
    frame: &TypeFrame,
    body: &[Inst],
    at: usize,
    routine: &Routine,
    labels: &HashMap<LabelId, usize>,
) -> Result<Vec<(usize, TypeFrame)>> {
    let mut out = frame.clone();
    let inst = &body[at];
    let mut targets: Vec<usize> = Vec::new();
    let mut falls_through = true;

    match inst {
        Inst::Label(_) => {}
        Inst::Const(c) => out.stack.push(match c {
            Const::I32(_) => SlotType::Int,
            Const::I64(_) => SlotType::Long,
            Const::F32(_) => SlotType::Float,
            Const::F64(_) => SlotType::Double,
            Const::Null => SlotType::Null,
            Const::Str(_) => SlotType::string(),
        }),
        Inst::Load(slot) => {
            let value = out
                .locals
                .get(*slot as usize)
                .cloned()
                .ok_or(AnalysisError::LocalRange { slot: *slot, at })?;
            out.stack.push(value);
        }
        Inst::Store(slot) => {
            let value = pop(&mut out.stack, at)?;
            let slot_idx = *slot as usize;
            if slot_idx >= out.locals.len() {
                return Err(AnalysisError::LocalRange { slot: *slot, at });
            }
            out.locals[slot_idx] = value;
        }
        Inst::Pop => {
            pop(&mut out.stack, at)?;
        }
        Inst::Dup => {
            let top = out
                .stack
                .last()
                .cloned()
                .ok_or(AnalysisError::Underflow { at })?;
            out.stack.push(top);
        }
        Inst::Bin(_, kind) => {
            pop_expect(&mut out.stack, at, SlotType::prim(*kind))?;
            pop_expect(&mut out.stack, at, SlotType::prim(*kind))?;
            out.stack.push(SlotType::prim(*kind));
        }
        Inst::Jump(target) => {
            targets.push(resolve(labels, *target)?);
            falls_through = false;
        }
        Inst::Branch { target, .. } => {
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            targets.push(resolve(labels, *target)?);
        }
        Inst::BranchNull { target, .. } => {
            pop_reference(&mut out.stack, at)?;
            targets.push(resolve(labels, *target)?);
        }
        Inst::TableSwitch {
            targets: switch_targets,
            default,
        } => {
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            for t in switch_targets {
                targets.push(resolve(labels, *t)?);
            }
            targets.push(resolve(labels, *default)?);
            falls_through = false;
        }
        Inst::New(name) => out.stack.push(SlotType::Ref(name.clone())),
        Inst::GetField { ty, .. } => {
            pop_reference(&mut out.stack, at)?;
            out.stack.push(SlotType::from_desc(ty));
        }
        Inst::PutField { .. } => {
            pop(&mut out.stack, at)?;
            pop_reference(&mut out.stack, at)?;
        }
        Inst::NewArray { elem } => {
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            out.stack.push(SlotType::Ref(format!("{elem}[]")));
        }
        Inst::ArrayLoad => {
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            let array = pop_reference(&mut out.stack, at)?;
            let element = match &array {
                SlotType::Ref(name) if is_array(name) => match element_type(name) {
                    Some("int") => SlotType::Int,
                    Some("long") => SlotType::Long,
                    Some("float") => SlotType::Float,
                    Some("double") => SlotType::Double,
                    Some(elem) => SlotType::Ref(elem.to_string()),
                    None => unreachable!(),
                },
                _ => {
                    return Err(AnalysisError::Operand {
                        at,
                        expected: "array reference",
                        found: array,
                    })
                }
            };
            out.stack.push(element);
        }
        Inst::ArrayStore => {
            pop(&mut out.stack, at)?;
            pop_expect(&mut out.stack, at, SlotType::Int)?;
            pop_reference(&mut out.stack, at)?;
        }
        Inst::Call {
            kind, args, ret, ..
        } => {
            for _ in args {
                pop(&mut out.stack, at)?;
            }
            if *kind == CallKind::Virtual {
                pop_reference(&mut out.stack, at)?;
            }
            if let Some(ret) = ret {
                out.stack.push(SlotType::from_desc(ret));
            }
        }
        Inst::Return => {
            if routine.ret.is_some() {
                pop(&mut out.stack, at)?;
            }
            falls_through = false;
        }
        Inst::Raise => {
            pop_reference(&mut out.stack, at)?;
            falls_through = false;
        }
        Inst::MonitorEnter | Inst::MonitorExit => {
            pop_reference(&mut out.stack, at)?;
        }
        Inst::NextEntry
        | Inst::PushFrame { .. }
        | Inst::PopFrame { .. }
        | Inst::FramePut { .. }
        | Inst::FrameGet { .. }
        | Inst::RaiseSuspend => {
            return Err(AnalysisError::GeneratedInst { at });
        }
    }

    let mut successors = Vec::with_capacity(targets.len() + 1);
    if falls_through {
        if at + 1 >= body.len() {
            return Err(AnalysisError::FallsOffEnd { at });
        }
        successors.push((at + 1, out.clone()));
    }
    for target in targets {
        successors.push((target, out.clone()));
    }
    Ok(successors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_ir::inst::{BinOp, Cond, PrimKind, TypeDesc};
    use strand_ir::names::OBJECT_ROOT;
    use strand_ir::{ExceptionRange, Routine};
    use strand_registry::{MapResolver, UnitDatabase, UnitRecord};

    fn db() -> UnitDatabase {
        let resolver = MapResolver::new()
            .insert("app/Base", UnitRecord::new(OBJECT_ROOT))
            .insert("app/A", UnitRecord::new("app/Base"))
            .insert("app/B", UnitRecord::new("app/Base"));
        UnitDatabase::new(Box::new(resolver))
    }

    #[test]
    fn straight_line_frames() {
        let routine = Routine::new("f")
            .with_locals(1)
            .with_body(vec![
                Inst::Const(Const::F64(1.5)),
                Inst::Const(Const::F64(2.0)),
                Inst::Bin(BinOp::Mul, PrimKind::Double),
                Inst::Pop,
                Inst::Return,
            ]);

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        assert_eq!(
            frames[2].as_ref().unwrap().stack,
            vec![SlotType::Double, SlotType::Double]
        );
        assert_eq!(frames[4].as_ref().unwrap().stack, Vec::<SlotType>::new());
    }

    #[test]
    fn receiver_and_params_seed_the_locals() {
        let routine = Routine::new("f")
            .with_receiver()
            .with_params(vec![TypeDesc::Int])
            .with_locals(3)
            .with_body(vec![Inst::Return]);

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        assert_eq!(
            frames[0].as_ref().unwrap().locals,
            vec![
                SlotType::Ref("app/A".into()),
                SlotType::Int,
                SlotType::Uninit
            ]
        );
    }

    #[test]
    fn branch_join_merges_sibling_references() {
        // local 1 becomes app/A on one path and app/B on the other
        let routine = Routine::new("f")
            .with_params(vec![TypeDesc::Int])
            .with_locals(2)
            .with_body(vec![
                Inst::Load(0),
                Inst::Const(Const::I32(0)),
                Inst::Branch {
                    cond: Cond::Eq,
                    target: 1,
                },
                Inst::New("app/A".into()),
                Inst::Store(1),
                Inst::Jump(2),
                Inst::Label(1),
                Inst::New("app/B".into()),
                Inst::Store(1),
                Inst::Label(2),
                Inst::Return,
            ]);

        let frames = analyze(&db(), "app/X", &routine).unwrap();
        let join = frames[9].as_ref().unwrap();
        assert_eq!(join.locals[1], SlotType::Ref("app/Base".into()));
    }

    #[test]
    fn null_on_one_path_keeps_the_concrete_type() {
        let routine = Routine::new("f")
            .with_params(vec![TypeDesc::Int])
            .with_locals(2)
            .with_body(vec![
                Inst::Load(0),
                Inst::Const(Const::I32(0)),
                Inst::Branch {
                    cond: Cond::Eq,
                    target: 1,
                },
                Inst::New("app/A".into()),
                Inst::Store(1),
                Inst::Jump(2),
                Inst::Label(1),
                Inst::Const(Const::Null),
                Inst::Store(1),
                Inst::Label(2),
                Inst::Return,
            ]);

        let frames = analyze(&db(), "app/X", &routine).unwrap();
        assert_eq!(
            frames[9].as_ref().unwrap().locals[1],
            SlotType::Ref("app/A".into())
        );
    }

    #[test]
    fn unreachable_instructions_have_no_frame() {
        let routine = Routine::new("f").with_body(vec![
            Inst::Return,
            Inst::Const(Const::I32(1)),
            Inst::Return,
        ]);

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        assert!(frames[0].is_some());
        assert!(frames[1].is_none());
        assert!(frames[2].is_none());
    }

    #[test]
    fn handler_sees_locals_and_a_one_deep_stack() {
        let routine = Routine::new("f")
            .with_params(vec![TypeDesc::Int])
            .with_locals(1)
            .with_body(vec![
                Inst::Label(0),
                Inst::Const(Const::Str("inside".into())),
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
                catch_type: Some("app/IoError".into()),
            });

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        let handler = frames[5].as_ref().unwrap();
        assert_eq!(handler.stack, vec![SlotType::Ref("app/IoError".into())]);
        assert_eq!(handler.locals, vec![SlotType::Int]);
    }

    #[test]
    fn catch_all_uses_the_base_exception() {
        let routine = Routine::new("f")
            .with_body(vec![
                Inst::Label(0),
                Inst::Const(Const::I32(1)),
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
                catch_type: None,
            });

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        assert_eq!(
            frames[5].as_ref().unwrap().stack,
            vec![SlotType::Ref(BASE_EXCEPTION.into())]
        );
    }

    #[test]
    fn array_load_strips_one_dimension() {
        let routine = Routine::new("f").with_locals(0).with_body(vec![
            Inst::Const(Const::I32(4)),
            Inst::NewArray {
                elem: "core/String".into(),
            },
            Inst::Const(Const::I32(0)),
            Inst::ArrayLoad,
            Inst::Pop,
            Inst::Return,
        ]);

        let frames = analyze(&db(), "app/A", &routine).unwrap();
        assert_eq!(
            frames[2].as_ref().unwrap().stack,
            vec![SlotType::Ref("core/String[]".into())]
        );
        assert_eq!(
            frames[4].as_ref().unwrap().stack,
            vec![SlotType::Ref("core/String".into())]
        );
    }

    #[test]
    fn incompatible_join_is_a_hard_failure() {
        let routine = Routine::new("f")
            .with_params(vec![TypeDesc::Int])
            .with_locals(2)
            .with_body(vec![
                Inst::Load(0),
                Inst::Const(Const::I32(0)),
                Inst::Branch {
                    cond: Cond::Eq,
                    target: 1,
                },
                Inst::Const(Const::I32(7)),
                Inst::Jump(2),
                Inst::Label(1),
                Inst::Const(Const::I64(7)),
                Inst::Label(2),
                Inst::Pop,
                Inst::Return,
            ]);

        assert!(matches!(
            analyze(&db(), "app/A", &routine),
            Err(AnalysisError::Merge { .. })
        ));
    }

    #[test]
    fn generated_instructions_are_rejected_in_input() {
        let routine = Routine::new("f").with_body(vec![Inst::NextEntry, Inst::Return]);
        assert_eq!(
            analyze(&db(), "app/A", &routine),
            Err(AnalysisError::GeneratedInst { at: 0 })
        );
    }
}
