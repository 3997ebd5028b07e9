//! Split points and their slot assignments.

use strand_analysis::{SlotType, TypeFrame};
use strand_ir::inst::SlotKind;
use strand_ir::LabelId;

/// Lane and frame-relative index assigned to one saved value.
pub type SlotAssignment = Option<(SlotKind, u32)>;

/// One suspension point of a routine: the position of the suspendable
/// call, the resume index rewritten dispatch branches on, and the slot
/// assignment for every live value at that point. Values typed null or
/// uninitialized get no slot; they are re-materialized on restore.
#[derive(Debug)]
pub struct SplitPoint {
    pub position: usize,
    pub resume: u32,
    pub stack_slots: Vec<SlotAssignment>,
    pub local_slots: Vec<SlotAssignment>,
    pub prim_count: u32,
    pub ref_count: u32,
    /// Locals typed null here. They get no slot; restore re-materializes
    /// the null constant instead.
    pub null_locals: Vec<u16>,
    /// Synthetic label ending an exception range just before the saved
    /// state is written. Allocated on demand by range splitting.
    pub before: Option<LabelId>,
    /// Synthetic label starting an exception range just after the restore.
    pub after: Option<LabelId>,
}

impl SplitPoint {
    /// Assign lane slots to every live value of `frame`, the analyzed
    /// state at `position`. References count up one lane, primitives the
    /// other; `first_saved_local` is where the saved local region starts.
    pub fn assign(position: usize, resume: u32, frame: &TypeFrame, first_saved_local: u16) -> Self {
        let mut prim_count = 0u32;
        let mut ref_count = 0u32;
        let mut assign = |ty: &SlotType| -> SlotAssignment {
            if !ty.needs_save() {
                return None;
            }
            let (kind, idx) = match ty {
                SlotType::Int => (SlotKind::Int, &mut prim_count),
                SlotType::Long => (SlotKind::Long, &mut prim_count),
                SlotType::Float => (SlotKind::Float, &mut prim_count),
                SlotType::Double => (SlotKind::Double, &mut prim_count),
                SlotType::Ref(_) => (SlotKind::Ref, &mut ref_count),
                SlotType::Uninit | SlotType::Null => unreachable!(),
            };
            let slot = *idx;
            *idx += 1;
            Some((kind, slot))
        };

        let stack_slots = frame.stack.iter().map(&mut assign).collect();
        let local_slots: Vec<SlotAssignment> = frame
            .locals
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                if i < first_saved_local as usize {
                    None
                } else {
                    assign(ty)
                }
            })
            .collect();
        let null_locals = frame
            .locals
            .iter()
            .enumerate()
            .skip(first_saved_local as usize)
            .filter(|(_, ty)| **ty == SlotType::Null)
            .map(|(i, _)| i as u16)
            .collect();

        Self {
            position,
            resume,
            stack_slots,
            local_slots,
            prim_count,
            ref_count,
            null_locals,
            before: None,
            after: None,
        }
    }

    /// The synthetic "fresh entry" split at position 0, resume index 0.
    pub fn first() -> Self {
        Self {
            position: 0,
            resume: 0,
            stack_slots: Vec::new(),
            local_slots: Vec::new(),
            prim_count: 0,
            ref_count: 0,
            null_locals: Vec::new(),
            before: None,
            after: None,
        }
    }

    /// Wider of the two lane counts; the frame reservation must cover both.
    pub fn slots(&self) -> u32 {
        self.prim_count.max(self.ref_count)
    }
}
