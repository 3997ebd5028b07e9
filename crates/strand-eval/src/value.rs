//! Runtime values.
//!
//! References are `Rc<RefCell<..>>` so that aliased instances observe each
//! other's field writes, same as saved references on the continuation stack
//! alias the live ones.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use strand_ir::names::STRING_UNIT;
use strand_ir::TypeDesc;

use crate::error::{EvalError, EvalResult};
use crate::machine::LIST_UNIT;

/// A heap object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Obj {
    Instance {
        unit: String,
        fields: BTreeMap<String, Value>,
    },
    List(Vec<Value>),
    Str(String),
}

impl Obj {
    /// The unit name this object dispatches and catch-matches under.
    pub fn unit_name(&self) -> &str {
        match self {
            Obj::Instance { unit, .. } => unit,
            Obj::List(_) => LIST_UNIT,
            Obj::Str(_) => STRING_UNIT,
        }
    }
}

pub type ObjRef = Rc<RefCell<Obj>>;

/// One operand-stack or local-slot value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(ObjRef),
}

impl Value {
    pub fn instance(unit: impl Into<String>) -> Self {
        Value::Ref(Rc::new(RefCell::new(Obj::Instance {
            unit: unit.into(),
            fields: BTreeMap::new(),
        })))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::Ref(Rc::new(RefCell::new(Obj::List(items))))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Ref(Rc::new(RefCell::new(Obj::Str(s.into()))))
    }

    /// Zero/null default for a declared type, what an unwritten field reads
    /// as.
    pub fn default_of(ty: &TypeDesc) -> Self {
        match ty {
            TypeDesc::Int => Value::I32(0),
            TypeDesc::Long => Value::I64(0),
            TypeDesc::Float => Value::F32(0.0),
            TypeDesc::Double => Value::F64(0.0),
            TypeDesc::Ref(_) => Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I32(_) => "int",
            Value::I64(_) => "long",
            Value::F32(_) => "float",
            Value::F64(_) => "double",
            Value::Ref(_) => "ref",
        }
    }

    pub fn as_i32(&self, what: &str) -> EvalResult<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(mismatch(what, "int", other)),
        }
    }

    pub fn as_i64(&self, what: &str) -> EvalResult<i64> {
        match self {
            Value::I64(v) => Ok(*v),
            other => Err(mismatch(what, "long", other)),
        }
    }

    pub fn as_f32(&self, what: &str) -> EvalResult<f32> {
        match self {
            Value::F32(v) => Ok(*v),
            other => Err(mismatch(what, "float", other)),
        }
    }

    pub fn as_f64(&self, what: &str) -> EvalResult<f64> {
        match self {
            Value::F64(v) => Ok(*v),
            other => Err(mismatch(what, "double", other)),
        }
    }

    /// The object behind a reference; null is the caller's error to name.
    pub fn as_obj(&self, what: &str) -> EvalResult<ObjRef> {
        match self {
            Value::Ref(obj) => Ok(Rc::clone(obj)),
            Value::Null => Err(EvalError::NullAccess(what.to_string())),
            other => Err(mismatch(what, "ref", other)),
        }
    }
}

fn mismatch(what: &str, expected: &str, found: &Value) -> EvalError {
    EvalError::TypeMismatch(format!(
        "{what}: expected {expected}, found {}",
        found.kind_name()
    ))
}
