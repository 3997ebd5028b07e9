//! The analysis value lattice and per-instruction frames.

use std::fmt;

use serde::{Deserialize, Serialize};
use strand_ir::inst::{PrimKind, TypeDesc};
use strand_ir::names::STRING_UNIT;
use strand_registry::UnitDatabase;
use tracing::debug;

use crate::error::{AnalysisError, Result};

/// Static type of one stack or local slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotType {
    /// Never written on this path.
    Uninit,
    Int,
    Long,
    Float,
    Double,
    /// The null constant, coercible to any reference type.
    Null,
    Ref(String),
}

impl SlotType {
    pub fn from_desc(desc: &TypeDesc) -> Self {
        match desc {
            TypeDesc::Int => SlotType::Int,
            TypeDesc::Long => SlotType::Long,
            TypeDesc::Float => SlotType::Float,
            TypeDesc::Double => SlotType::Double,
            TypeDesc::Ref(name) => SlotType::Ref(name.clone()),
        }
    }

    pub fn prim(kind: PrimKind) -> Self {
        match kind {
            PrimKind::Int => SlotType::Int,
            PrimKind::Long => SlotType::Long,
            PrimKind::Float => SlotType::Float,
            PrimKind::Double => SlotType::Double,
        }
    }

    pub fn string() -> Self {
        SlotType::Ref(STRING_UNIT.to_string())
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, SlotType::Null | SlotType::Ref(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            SlotType::Int | SlotType::Long | SlotType::Float | SlotType::Double
        )
    }

    /// Whether a value of this type carries state worth saving. `Uninit`
    /// and `Null` are re-materialized as placeholders at resume instead.
    pub fn needs_save(&self) -> bool {
        !matches!(self, SlotType::Uninit | SlotType::Null)
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Uninit => f.write_str("uninitialized"),
            SlotType::Int => f.write_str("int"),
            SlotType::Long => f.write_str("long"),
            SlotType::Float => f.write_str("float"),
            SlotType::Double => f.write_str("double"),
            SlotType::Null => f.write_str("null"),
            SlotType::Ref(name) => f.write_str(name),
        }
    }
}

/// Join two slot types at a control-flow merge.
///
/// Unequal concrete reference types resolve to their common ancestor; when
/// the registry cannot produce one, an exception-typed side wins (this is
/// the shape of implicit exception-table joins). Everything else that is
/// not covered by a rule is a hard failure.
pub fn merge(db: &UnitDatabase, left: &SlotType, right: &SlotType) -> Result<SlotType> {
    if left == right {
        return Ok(left.clone());
    }

    match (left, right) {
        (SlotType::Uninit, other) | (other, SlotType::Uninit) => Ok(other.clone()),
        (SlotType::Null, other @ SlotType::Ref(_)) | (other @ SlotType::Ref(_), SlotType::Null) => {
            Ok(other.clone())
        }
        (SlotType::Ref(a), SlotType::Ref(b)) => {
            if let Some(ancestor) = db.common_ancestor(a, b) {
                debug!(%a, %b, %ancestor, "merged to common ancestor");
                return Ok(SlotType::Ref(ancestor));
            }
            if db.is_exception_type(b) {
                debug!(%a, %b, "no common ancestor, preferring exception type {b}");
                return Ok(right.clone());
            }
            if db.is_exception_type(a) {
                debug!(%a, %b, "no common ancestor, preferring exception type {a}");
                return Ok(left.clone());
            }
            Err(AnalysisError::Merge {
                left: left.clone(),
                right: right.clone(),
            })
        }
        _ => Err(AnalysisError::Merge {
            left: left.clone(),
            right: right.clone(),
        }),
    }
}

/// The full abstract state before one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeFrame {
    pub locals: Vec<SlotType>,
    pub stack: Vec<SlotType>,
}

impl TypeFrame {
    /// Merge `incoming` into `self`, reporting whether anything widened.
    /// Joined paths must agree on operand stack depth.
    pub fn merge_from(&mut self, db: &UnitDatabase, incoming: &TypeFrame, at: usize) -> Result<bool> {
        if self.stack.len() != incoming.stack.len() {
            return Err(AnalysisError::DepthMismatch { at });
        }

        let mut changed = false;
        for (mine, theirs) in self
            .locals
            .iter_mut()
            .zip(&incoming.locals)
            .chain(self.stack.iter_mut().zip(&incoming.stack))
        {
            let merged = merge(db, mine, theirs)?;
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }
        Ok(changed)
    }
}
