//! Adapter running an interpreted routine as a coroutine entry point.

use strand_runtime::{ActiveStack, CoRunnable, Signal};

use crate::error::EvalError;
use crate::machine::{Machine, Unwind};
use crate::value::Value;

/// Binds a [`Machine`] routine to the driver protocol. Every `run` calls
/// the routine from the top with the same arguments; a resumed call
/// re-dispatches through the active stack's frame records.
pub struct EntryPoint<'m> {
    machine: &'m Machine,
    unit: String,
    routine: String,
    args: Vec<Value>,
    result: Option<Value>,
}

impl<'m> EntryPoint<'m> {
    pub fn new(
        machine: &'m Machine,
        unit: impl Into<String>,
        routine: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            machine,
            unit: unit.into(),
            routine: routine.into(),
            args,
            result: None,
        }
    }

    /// Return value of the completed entry routine, if it declared one.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }
}

impl CoRunnable<Value> for EntryPoint<'_> {
    type Error = EvalError;

    fn co_execute(&mut self, active: &mut ActiveStack<Value>) -> Result<(), Signal<EvalError>> {
        match self
            .machine
            .call_static(&self.unit, &self.routine, self.args.clone(), active)
        {
            Ok(value) => {
                self.result = value;
                Ok(())
            }
            Err(Unwind::Suspend) => Err(Signal::Suspend),
            Err(Unwind::Thrown(exc)) => {
                let name = match &exc {
                    Value::Ref(obj) => obj.borrow().unit_name().to_string(),
                    other => other.kind_name().to_string(),
                };
                Err(Signal::Fault(EvalError::UncaughtException(name)))
            }
            Err(Unwind::Fault(e)) => Err(Signal::Fault(e)),
        }
    }
}
