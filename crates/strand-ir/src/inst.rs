//! The stack-machine instruction set.
//!
//! Routines are ordered instruction sequences over an operand stack and a
//! set of numbered local slots. The first group of variants is what user
//! code is written in; the variants after the divider are only ever emitted
//! by the instrumenter and drive the runtime continuation stack.

use serde::{Deserialize, Serialize};

/// Identifies a jump target. Labels appear inline in the body as
/// [`Inst::Label`] and are referenced by branches and exception ranges.
pub type LabelId = u32;

/// The four primitive value kinds. All of them travel through the 64-bit
/// primitive lane of the continuation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimKind {
    Int,
    Long,
    Float,
    Double,
}

/// Static type descriptor for parameters, returns, fields and calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDesc {
    Int,
    Long,
    Float,
    Double,
    /// A reference type, named by its unit. Array types carry a `[]` suffix.
    Ref(String),
}

impl TypeDesc {
    /// Shorthand for a reference descriptor.
    pub fn reference(unit: impl Into<String>) -> Self {
        TypeDesc::Ref(unit.into())
    }
}

/// Constant operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Null,
    Str(String),
}

/// Binary arithmetic, typed by operand kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison condition for [`Inst::Branch`] (two `Int` operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Call dispatch kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// No receiver; resolved against the named unit.
    Static,
    /// First argument is the receiver; resolved against its runtime unit.
    Virtual,
}

/// Which continuation-stack lane (and read width) a saved slot uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

/// One instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    /// Marks a jump target. No runtime effect.
    Label(LabelId),
    /// Push a constant.
    Const(Const),
    /// Push local slot `n`.
    Load(u16),
    /// Pop into local slot `n`.
    Store(u16),
    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Pop two operands of `kind`, push the result.
    Bin(BinOp, PrimKind),
    /// Unconditional jump.
    Jump(LabelId),
    /// Pop two `Int` operands `a`, `b` (pushed in that order); jump if
    /// `a cond b` holds.
    Branch { cond: Cond, target: LabelId },
    /// Pop a reference; jump if it is null (`when_null`) or non-null.
    BranchNull { when_null: bool, target: LabelId },
    /// Pop an `Int` selector `v`; jump to `targets[v - 1]` when
    /// `1 <= v <= targets.len()`, otherwise to `default`.
    TableSwitch { targets: Vec<LabelId>, default: LabelId },
    /// Push a fresh instance of the named unit.
    New(String),
    /// Pop a receiver reference, push the named field.
    GetField { field: String, ty: TypeDesc },
    /// Pop a value then a receiver reference, store the field.
    PutField { field: String },
    /// Pop an `Int` length, push a fresh array of the named element type.
    NewArray { elem: String },
    /// Pop an index then an array reference, push the element.
    ArrayLoad,
    /// Pop a value, an index, and an array reference; store the element.
    ArrayStore,
    /// Call a routine. Arguments (receiver first for virtual calls) are
    /// popped from the stack; the result, if any, is pushed.
    Call {
        unit: String,
        routine: String,
        kind: CallKind,
        args: Vec<TypeDesc>,
        ret: Option<TypeDesc>,
    },
    /// Return from the routine, popping the result if it declares one.
    Return,
    /// Pop an exception reference and unwind to the nearest matching
    /// exception range.
    Raise,
    /// Pop a reference and acquire its lock.
    MonitorEnter,
    /// Pop a reference and release its lock.
    MonitorExit,

    // ── Emitted by the instrumenter only ─────────────────────────────
    /// Advance the continuation stack's frame cursor and push the frame's
    /// resume index (0 on fresh entry).
    NextEntry,
    /// Reserve a continuation frame tagged with `resume`, `slots` wide in
    /// both lanes.
    PushFrame { resume: u32, slots: u32 },
    /// Drop the current continuation frame, clearing `ref_slots` entries
    /// of its reference lane.
    PopFrame { ref_slots: u32 },
    /// Pop a value into frame-relative slot `slot` of the given lane.
    FramePut { kind: SlotKind, slot: u32 },
    /// Push the value stored in frame-relative slot `slot`.
    FrameGet { kind: SlotKind, slot: u32 },
    /// Raise the sentinel suspension signal.
    RaiseSuspend,
}

impl Inst {
    /// Static call shorthand, used heavily by tests and fixtures.
    pub fn call_static(
        unit: impl Into<String>,
        routine: impl Into<String>,
        args: Vec<TypeDesc>,
        ret: Option<TypeDesc>,
    ) -> Self {
        Inst::Call {
            unit: unit.into(),
            routine: routine.into(),
            kind: CallKind::Static,
            args,
            ret,
        }
    }

    /// Virtual call shorthand. `args` excludes the receiver.
    pub fn call_virtual(
        unit: impl Into<String>,
        routine: impl Into<String>,
        args: Vec<TypeDesc>,
        ret: Option<TypeDesc>,
    ) -> Self {
        Inst::Call {
            unit: unit.into(),
            routine: routine.into(),
            kind: CallKind::Virtual,
            args,
            ret,
        }
    }

    /// The explicit "pause here" suspension point.
    pub fn call_yield() -> Self {
        Inst::call_static(
            crate::names::COROUTINE_UNIT,
            crate::names::YIELD_ROUTINE,
            vec![],
            None,
        )
    }

    /// Returns `true` for instructions that transfer control away
    /// unconditionally (no fall-through successor).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Inst::Jump(_)
                | Inst::TableSwitch { .. }
                | Inst::Return
                | Inst::Raise
                | Inst::RaiseSuspend
        )
    }
}
