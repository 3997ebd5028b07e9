//! The stack-machine interpreter.
//!
//! Executes routine bodies directly, including the continuation-stack
//! instructions the instrumenter emits, so rewritten units run against the
//! real runtime protocol. One [`Machine`] holds a working set of units;
//! execution is single-context, locks are uncontended no-ops.

use std::collections::HashMap;

use strand_ir::inst::{BinOp, CallKind, Cond, Const, Inst, LabelId, PrimKind, SlotKind};
use strand_ir::names::{COROUTINE_UNIT, OBJECT_ROOT, YIELD_ROUTINE};
use strand_ir::{CodeUnit, Routine};
use strand_runtime::{ActiveStack, ContinuationStack};

use crate::error::{EvalError, EvalResult};
use crate::value::{Obj, Value};

/// Built-in list unit. `new` is static; `push`, `len` and `get` dispatch
/// virtually on the receiver.
pub const LIST_UNIT: &str = "core/List";

/// Built-in math unit, static routines only.
pub const MATH_UNIT: &str = "core/Math";

/// Non-local exits of one activation.
#[derive(Debug)]
pub enum Unwind {
    /// The suspension sentinel. Never matched against exception ranges; it
    /// crosses every activation untouched until the driver catches it.
    Suspend,
    /// A raised exception value, matched against the exception ranges of
    /// each activation on the way out.
    Thrown(Value),
    /// A machine fault. Not catchable.
    Fault(EvalError),
}

impl From<EvalError> for Unwind {
    fn from(e: EvalError) -> Self {
        Unwind::Fault(e)
    }
}

pub type Outcome<T> = Result<T, Unwind>;

/// Where control goes after one instruction.
enum Flow {
    Next,
    Goto(usize),
    Return(Option<Value>),
}

/// One routine activation: operand stack, locals, label positions.
struct Activation<'r> {
    routine: &'r Routine,
    labels: HashMap<LabelId, usize>,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

impl<'r> Activation<'r> {
    fn new(routine: &'r Routine, locals: Vec<Value>) -> Self {
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
            routine,
            labels,
            stack: Vec::new(),
            locals,
        }
    }

    fn pop(&mut self) -> EvalResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::StackUnderflow(self.routine.name.clone()))
    }

    fn target(&self, label: LabelId) -> EvalResult<usize> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| EvalError::UnknownLabel(format!("{label} in {}", self.routine.name)))
    }

    fn local(&self, slot: u16) -> EvalResult<Value> {
        self.locals
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| local_range(slot, &self.routine.name))
    }

    fn set_local(&mut self, slot: u16, value: Value) -> EvalResult<()> {
        match self.locals.get_mut(slot as usize) {
            Some(entry) => {
                *entry = value;
                Ok(())
            }
            None => Err(local_range(slot, &self.routine.name)),
        }
    }
}

fn local_range(slot: u16, routine: &str) -> EvalError {
    EvalError::IndexOutOfBounds(format!("local slot {slot} in {routine}"))
}

/// A working set of units plus the ancestry needed to dispatch and to match
/// raised exceptions against catch types.
#[derive(Default)]
pub struct Machine {
    units: HashMap<String, CodeUnit>,
    /// Ancestry of units that have no body in the working set, exception
    /// types declared elsewhere mostly.
    extra_parents: HashMap<String, String>,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&mut self, unit: CodeUnit) {
        self.units.insert(unit.name.clone(), unit);
    }

    /// Declare ancestry for a unit with no body in the working set.
    pub fn declare_parent(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        self.extra_parents.insert(child.into(), parent.into());
    }

    /// Call a routine by unit and name, no receiver dispatch. This is the
    /// entry surface; nested calls go through [`Inst::Call`].
    pub fn call_static(
        &self,
        unit: &str,
        routine: &str,
        args: Vec<Value>,
        active: &mut ActiveStack<Value>,
    ) -> Outcome<Option<Value>> {
        let cu = self
            .units
            .get(unit)
            .ok_or_else(|| EvalError::UnknownUnit(unit.to_string()))?;
        let r = cu
            .routine(routine)
            .ok_or_else(|| EvalError::UnknownRoutine(format!("{unit}::{routine}")))?;
        self.exec(r, frame_locals(r, args), active)
    }

    // ══════════════════════════════════════════════════════════════════
    // Execution loop
    // ══════════════════════════════════════════════════════════════════

    fn exec(
        &self,
        routine: &Routine,
        locals: Vec<Value>,
        active: &mut ActiveStack<Value>,
    ) -> Outcome<Option<Value>> {
        let mut act = Activation::new(routine, locals);
        let mut pc = 0usize;

        loop {
            let Some(inst) = routine.body.get(pc) else {
                return Err(EvalError::FellOffEnd(routine.name.clone()).into());
            };
            match self.step(inst, &mut act, active) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Goto(pos)) => pc = pos,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(Unwind::Thrown(exc)) => match self.find_handler(&act, pc, &exc)? {
                    Some(handler) => {
                        act.stack.clear();
                        act.stack.push(exc);
                        pc = handler;
                    }
                    None => return Err(Unwind::Thrown(exc)),
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn step(
        &self,
        inst: &Inst,
        act: &mut Activation<'_>,
        active: &mut ActiveStack<Value>,
    ) -> Outcome<Flow> {
        let flow = match inst {
            Inst::Label(_) => Flow::Next,
            Inst::Const(c) => {
                act.stack.push(const_value(c));
                Flow::Next
            }
            Inst::Load(slot) => {
                let v = act.local(*slot)?;
                act.stack.push(v);
                Flow::Next
            }
            Inst::Store(slot) => {
                let v = act.pop()?;
                act.set_local(*slot, v)?;
                Flow::Next
            }
            Inst::Pop => {
                act.pop()?;
                Flow::Next
            }
            Inst::Dup => {
                let v = act.pop()?;
                act.stack.push(v.clone());
                act.stack.push(v);
                Flow::Next
            }
            Inst::Bin(op, kind) => {
                let b = act.pop()?;
                let a = act.pop()?;
                act.stack.push(bin(*op, *kind, a, b, &act.routine.name)?);
                Flow::Next
            }
            Inst::Jump(label) => Flow::Goto(act.target(*label)?),
            Inst::Branch { cond, target } => {
                let b = act.pop()?.as_i32("branch operand")?;
                let a = act.pop()?.as_i32("branch operand")?;
                if holds(*cond, a, b) {
                    Flow::Goto(act.target(*target)?)
                } else {
                    Flow::Next
                }
            }
            Inst::BranchNull { when_null, target } => {
                let v = act.pop()?;
                if !matches!(v, Value::Null | Value::Ref(_)) {
                    return Err(EvalError::TypeMismatch(format!(
                        "null branch: expected ref, found {}",
                        v.kind_name()
                    ))
                    .into());
                }
                if v.is_null() == *when_null {
                    Flow::Goto(act.target(*target)?)
                } else {
                    Flow::Next
                }
            }
            Inst::TableSwitch { targets, default } => {
                let v = act.pop()?.as_i32("switch selector")?;
                let label = if v >= 1 && (v as usize) <= targets.len() {
                    targets[v as usize - 1]
                } else {
                    *default
                };
                Flow::Goto(act.target(label)?)
            }
            Inst::New(unit) => {
                act.stack.push(Value::instance(unit.clone()));
                Flow::Next
            }
            Inst::GetField { field, ty } => {
                let receiver = act.pop()?;
                let obj = receiver.as_obj(&format!("read of field {field}"))?;
                let value = match &*obj.borrow() {
                    Obj::Instance { fields, .. } => fields
                        .get(field)
                        .cloned()
                        .unwrap_or_else(|| Value::default_of(ty)),
                    other => {
                        return Err(EvalError::TypeMismatch(format!(
                            "field {field} on a {}",
                            kind_of(other)
                        ))
                        .into())
                    }
                };
                act.stack.push(value);
                Flow::Next
            }
            Inst::PutField { field } => {
                let value = act.pop()?;
                let receiver = act.pop()?;
                let obj = receiver.as_obj(&format!("write of field {field}"))?;
                match &mut *obj.borrow_mut() {
                    Obj::Instance { fields, .. } => {
                        fields.insert(field.clone(), value);
                    }
                    other => {
                        return Err(EvalError::TypeMismatch(format!(
                            "field {field} on a {}",
                            kind_of(other)
                        ))
                        .into())
                    }
                }
                Flow::Next
            }
            Inst::NewArray { elem } => {
                let len = act.pop()?.as_i32("array length")?;
                if len < 0 {
                    return Err(
                        EvalError::IndexOutOfBounds(format!("array length {len}")).into()
                    );
                }
                act.stack
                    .push(Value::list(vec![array_fill(elem); len as usize]));
                Flow::Next
            }
            Inst::ArrayLoad => {
                let idx = act.pop()?.as_i32("array index")?;
                let arr = act.pop()?.as_obj("array load")?;
                let value = match &*arr.borrow() {
                    Obj::List(items) => items
                        .get(idx as usize)
                        .cloned()
                        .ok_or_else(|| index_error(idx, items.len()))?,
                    other => {
                        return Err(EvalError::TypeMismatch(format!(
                            "array load on a {}",
                            kind_of(other)
                        ))
                        .into())
                    }
                };
                act.stack.push(value);
                Flow::Next
            }
            Inst::ArrayStore => {
                let value = act.pop()?;
                let idx = act.pop()?.as_i32("array index")?;
                let arr = act.pop()?.as_obj("array store")?;
                match &mut *arr.borrow_mut() {
                    Obj::List(items) => {
                        let len = items.len();
                        match items.get_mut(idx as usize) {
                            Some(entry) => *entry = value,
                            None => return Err(index_error(idx, len).into()),
                        }
                    }
                    other => {
                        return Err(EvalError::TypeMismatch(format!(
                            "array store on a {}",
                            kind_of(other)
                        ))
                        .into())
                    }
                }
                Flow::Next
            }
            Inst::Call {
                unit,
                routine: callee,
                kind,
                args,
                ret,
            } => {
                let result = self.do_call(unit, callee, *kind, args.len(), act, active)?;
                match (ret, result) {
                    (Some(_), Some(v)) => act.stack.push(v),
                    (None, None) => {}
                    (declared, returned) => {
                        return Err(EvalError::TypeMismatch(format!(
                            "{unit}::{callee} declared ret {} but returned {}",
                            if declared.is_some() { "a value" } else { "nothing" },
                            if returned.is_some() { "a value" } else { "nothing" },
                        ))
                        .into())
                    }
                }
                Flow::Next
            }
            Inst::Return => {
                let value = if act.routine.ret.is_some() {
                    Some(act.pop()?)
                } else {
                    None
                };
                Flow::Return(value)
            }
            Inst::Raise => {
                let exc = act.pop()?;
                exc.as_obj("raise")?;
                return Err(Unwind::Thrown(exc));
            }
            Inst::MonitorEnter | Inst::MonitorExit => {
                // single-context execution: validate the receiver, hold
                // nothing
                act.pop()?.as_obj("monitor")?;
                Flow::Next
            }

            // ── Continuation-stack protocol ───────────────────────────
            Inst::NextEntry => {
                let resume = frame_stack(active, &act.routine.name)?.next_entry();
                act.stack.push(Value::I32(resume as i32));
                Flow::Next
            }
            Inst::PushFrame { resume, slots } => {
                frame_stack(active, &act.routine.name)?.push_frame(*resume, *slots);
                Flow::Next
            }
            Inst::PopFrame { ref_slots } => {
                frame_stack(active, &act.routine.name)?.pop_frame(*ref_slots);
                Flow::Next
            }
            Inst::FramePut { kind, slot } => {
                let value = act.pop()?;
                let cs = frame_stack(active, &act.routine.name)?;
                // a slot typed null on one path may be a dead primitive on
                // another; the placeholder bits are never read there
                match kind {
                    SlotKind::Int => {
                        let v = if value.is_null() { 0 } else { value.as_i32("frame slot")? };
                        cs.put_int(*slot, v);
                    }
                    SlotKind::Long => {
                        let v = if value.is_null() { 0 } else { value.as_i64("frame slot")? };
                        cs.put_long(*slot, v);
                    }
                    SlotKind::Float => {
                        let v = if value.is_null() { 0.0 } else { value.as_f32("frame slot")? };
                        cs.put_float(*slot, v);
                    }
                    SlotKind::Double => {
                        let v = if value.is_null() { 0.0 } else { value.as_f64("frame slot")? };
                        cs.put_double(*slot, v);
                    }
                    SlotKind::Ref => {
                        if !matches!(value, Value::Null | Value::Ref(_)) {
                            return Err(EvalError::TypeMismatch(format!(
                                "frame slot: expected ref, found {}",
                                value.kind_name()
                            ))
                            .into());
                        }
                        cs.put_ref(*slot, value);
                    }
                }
                Flow::Next
            }
            Inst::FrameGet { kind, slot } => {
                let cs = frame_stack(active, &act.routine.name)?;
                let value = match kind {
                    SlotKind::Int => Value::I32(cs.get_int(*slot)),
                    SlotKind::Long => Value::I64(cs.get_long(*slot)),
                    SlotKind::Float => Value::F32(cs.get_float(*slot)),
                    SlotKind::Double => Value::F64(cs.get_double(*slot)),
                    SlotKind::Ref => cs.get_ref(*slot),
                };
                act.stack.push(value);
                Flow::Next
            }
            Inst::RaiseSuspend => return Err(Unwind::Suspend),
        };
        Ok(flow)
    }

    // ══════════════════════════════════════════════════════════════════
    // Calls and dispatch
    // ══════════════════════════════════════════════════════════════════

    fn do_call(
        &self,
        unit: &str,
        callee: &str,
        kind: CallKind,
        argc: usize,
        act: &mut Activation<'_>,
        active: &mut ActiveStack<Value>,
    ) -> Outcome<Option<Value>> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(act.pop()?);
        }
        args.reverse();

        match kind {
            CallKind::Static => {
                if unit == COROUTINE_UNIT && callee == YIELD_ROUTINE {
                    return Err(EvalError::NotInstrumented(format!(
                        "direct call to {COROUTINE_UNIT}::{YIELD_ROUTINE} in {}",
                        act.routine.name
                    ))
                    .into());
                }
                if unit == MATH_UNIT {
                    return Ok(math_builtin(callee, &args)?);
                }
                if unit == LIST_UNIT && callee == "new" {
                    return Ok(Some(Value::list(Vec::new())));
                }
                let cu = self
                    .units
                    .get(unit)
                    .ok_or_else(|| EvalError::UnknownUnit(unit.to_string()))?;
                let r = cu
                    .routine(callee)
                    .ok_or_else(|| EvalError::UnknownRoutine(format!("{unit}::{callee}")))?;
                self.exec(r, frame_locals(r, args), active)
            }
            CallKind::Virtual => {
                let receiver = act.pop()?;
                let obj = receiver.as_obj(&format!("receiver of {callee}"))?;
                let type_name = obj.borrow().unit_name().to_string();
                if type_name == LIST_UNIT {
                    return Ok(list_builtin(callee, &obj, args)?);
                }
                let r = self.resolve_virtual(&type_name, callee)?;
                let mut locals = Vec::with_capacity(argc + 1);
                locals.push(receiver);
                locals.extend(args);
                self.exec(r, frame_locals(r, locals), active)
            }
        }
    }

    /// Walk the ancestry from the receiver's runtime unit to the routine.
    fn resolve_virtual(&self, runtime_unit: &str, callee: &str) -> EvalResult<&Routine> {
        let mut cur = runtime_unit;
        loop {
            if let Some(r) = self.units.get(cur).and_then(|u| u.routine(callee)) {
                return Ok(r);
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => {
                    return Err(EvalError::UnknownRoutine(format!(
                        "{runtime_unit}::{callee}"
                    )))
                }
            }
        }
    }

    fn parent_of(&self, unit: &str) -> Option<&str> {
        if unit == OBJECT_ROOT {
            return None;
        }
        self.units
            .get(unit)
            .map(|u| u.parent.as_str())
            .or_else(|| self.extra_parents.get(unit).map(String::as_str))
    }

    fn is_subtype(&self, unit: &str, ancestor: &str) -> bool {
        let mut cur = unit;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    /// First exception range covering `pc` whose catch type matches, in
    /// table order.
    fn find_handler(
        &self,
        act: &Activation<'_>,
        pc: usize,
        exc: &Value,
    ) -> Outcome<Option<usize>> {
        let obj = exc.as_obj("raised exception")?;
        let thrown_type = obj.borrow().unit_name().to_string();

        for range in &act.routine.exception_ranges {
            let start = act.target(range.start)?;
            let end = act.target(range.end)?;
            if pc < start || pc >= end {
                continue;
            }
            let matches = match &range.catch_type {
                None => true,
                Some(t) => self.is_subtype(&thrown_type, t),
            };
            if matches {
                return Ok(Some(act.target(range.handler)?));
            }
        }
        Ok(None)
    }
}

// ══════════════════════════════════════════════════════════════════════
// Instruction helpers
// ══════════════════════════════════════════════════════════════════════

fn frame_stack<'a>(
    active: &'a mut ActiveStack<Value>,
    routine: &str,
) -> EvalResult<&'a mut ContinuationStack<Value>> {
    active
        .current()
        .ok_or_else(|| EvalError::NoActiveStack(routine.to_string()))
}

fn frame_locals(routine: &Routine, mut locals: Vec<Value>) -> Vec<Value> {
    if locals.len() < routine.max_locals as usize {
        locals.resize(routine.max_locals as usize, Value::Null);
    }
    locals
}

fn const_value(c: &Const) -> Value {
    match c {
        Const::I32(v) => Value::I32(*v),
        Const::I64(v) => Value::I64(*v),
        Const::F32(v) => Value::F32(*v),
        Const::F64(v) => Value::F64(*v),
        Const::Null => Value::Null,
        Const::Str(s) => Value::string(s.clone()),
    }
}

fn bin(op: BinOp, kind: PrimKind, a: Value, b: Value, routine: &str) -> EvalResult<Value> {
    match kind {
        PrimKind::Int => {
            let (x, y) = (a.as_i32(routine)?, b.as_i32(routine)?);
            if op == BinOp::Div && y == 0 {
                return Err(EvalError::ArithmeticTrap(format!("division by zero in {routine}")));
            }
            Ok(Value::I32(match op {
                BinOp::Add => x.wrapping_add(y),
                BinOp::Sub => x.wrapping_sub(y),
                BinOp::Mul => x.wrapping_mul(y),
                BinOp::Div => x.wrapping_div(y),
            }))
        }
        PrimKind::Long => {
            let (x, y) = (a.as_i64(routine)?, b.as_i64(routine)?);
            if op == BinOp::Div && y == 0 {
                return Err(EvalError::ArithmeticTrap(format!("division by zero in {routine}")));
            }
            Ok(Value::I64(match op {
                BinOp::Add => x.wrapping_add(y),
                BinOp::Sub => x.wrapping_sub(y),
                BinOp::Mul => x.wrapping_mul(y),
                BinOp::Div => x.wrapping_div(y),
            }))
        }
        PrimKind::Float => {
            let (x, y) = (a.as_f32(routine)?, b.as_f32(routine)?);
            Ok(Value::F32(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
            }))
        }
        PrimKind::Double => {
            let (x, y) = (a.as_f64(routine)?, b.as_f64(routine)?);
            Ok(Value::F64(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
            }))
        }
    }
}

fn holds(cond: Cond, a: i32, b: i32) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Lt => a < b,
        Cond::Le => a <= b,
        Cond::Gt => a > b,
        Cond::Ge => a >= b,
    }
}

fn array_fill(elem: &str) -> Value {
    match elem {
        "int" => Value::I32(0),
        "long" => Value::I64(0),
        "float" => Value::F32(0.0),
        "double" => Value::F64(0.0),
        _ => Value::Null,
    }
}

fn index_error(idx: i32, len: usize) -> EvalError {
    EvalError::IndexOutOfBounds(format!("index {idx} of length {len}"))
}

fn kind_of(obj: &Obj) -> &'static str {
    match obj {
        Obj::Instance { .. } => "instance",
        Obj::List(_) => "list",
        Obj::Str(_) => "string",
    }
}

fn math_builtin(callee: &str, args: &[Value]) -> EvalResult<Option<Value>> {
    let arg = |i: usize| -> EvalResult<&Value> {
        args.get(i)
            .ok_or_else(|| EvalError::TypeMismatch(format!("{MATH_UNIT}::{callee}: missing argument {i}")))
    };
    match callee {
        "cos" => Ok(Some(Value::F64(arg(0)?.as_f64("cos argument")?.cos()))),
        "sqrt" => Ok(Some(Value::F64(arg(0)?.as_f64("sqrt argument")?.sqrt()))),
        _ => Err(EvalError::UnknownRoutine(format!("{MATH_UNIT}::{callee}"))),
    }
}

fn list_builtin(
    callee: &str,
    obj: &crate::value::ObjRef,
    args: Vec<Value>,
) -> EvalResult<Option<Value>> {
    let mut borrowed = obj.borrow_mut();
    let Obj::List(items) = &mut *borrowed else {
        return Err(EvalError::TypeMismatch(format!("{LIST_UNIT}::{callee} on a non-list")));
    };
    match callee {
        "push" => {
            let value = args.into_iter().next().ok_or_else(|| {
                EvalError::TypeMismatch(format!("{LIST_UNIT}::push: missing argument"))
            })?;
            items.push(value);
            Ok(None)
        }
        "len" => Ok(Some(Value::I32(items.len() as i32))),
        "get" => {
            let idx = args
                .first()
                .ok_or_else(|| EvalError::TypeMismatch(format!("{LIST_UNIT}::get: missing argument")))?
                .as_i32("list index")?;
            let value = items
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| index_error(idx, items.len()))?;
            Ok(Some(value))
        }
        _ => Err(EvalError::UnknownRoutine(format!("{LIST_UNIT}::{callee}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_ir::inst::TypeDesc;
    use strand_ir::names::{BASE_EXCEPTION, OBJECT_ROOT};
    use strand_ir::ExceptionRange;

    fn run(machine: &Machine, unit: &str, routine: &str, args: Vec<Value>) -> Outcome<Option<Value>> {
        let mut active = ActiveStack::new();
        machine.call_static(unit, routine, args, &mut active)
    }

    fn single(routine: Routine) -> Machine {
        let mut m = Machine::new();
        m.add_unit(CodeUnit::new("app/T", OBJECT_ROOT).with_routine(routine));
        m
    }

    #[test]
    fn loop_sums_with_branch_and_locals() {
        // sum = 0; i = 1; while i <= 3 { sum += i; i += 1 }; return sum
        let r = Routine::new("sum")
            .with_ret(TypeDesc::Int)
            .with_locals(2)
            .with_body(vec![
                Inst::Const(Const::I32(0)),
                Inst::Store(0),
                Inst::Const(Const::I32(1)),
                Inst::Store(1),
                Inst::Label(0),
                Inst::Load(1),
                Inst::Const(Const::I32(3)),
                Inst::Branch { cond: Cond::Gt, target: 1 },
                Inst::Load(0),
                Inst::Load(1),
                Inst::Bin(BinOp::Add, PrimKind::Int),
                Inst::Store(0),
                Inst::Load(1),
                Inst::Const(Const::I32(1)),
                Inst::Bin(BinOp::Add, PrimKind::Int),
                Inst::Store(1),
                Inst::Jump(0),
                Inst::Label(1),
                Inst::Load(0),
                Inst::Return,
            ]);
        let m = single(r);
        let out = run(&m, "app/T", "sum", vec![]).unwrap();
        assert_eq!(out, Some(Value::I32(6)));
    }

    #[test]
    fn fields_read_back_and_default_to_zero() {
        let r = Routine::new("f")
            .with_ret(TypeDesc::Int)
            .with_locals(1)
            .with_body(vec![
                Inst::New("app/Box".into()),
                Inst::Store(0),
                Inst::Load(0),
                Inst::Const(Const::I32(5)),
                Inst::PutField { field: "n".into() },
                Inst::Load(0),
                Inst::GetField { field: "n".into(), ty: TypeDesc::Int },
                Inst::Load(0),
                Inst::GetField { field: "unset".into(), ty: TypeDesc::Int },
                Inst::Bin(BinOp::Add, PrimKind::Int),
                Inst::Return,
            ]);
        let m = single(r);
        assert_eq!(run(&m, "app/T", "f", vec![]).unwrap(), Some(Value::I32(5)));
    }

    #[test]
    fn virtual_call_resolves_through_the_parent() {
        let mut m = Machine::new();
        m.add_unit(
            CodeUnit::new("app/Base", OBJECT_ROOT).with_routine(
                Routine::new("answer")
                    .with_receiver()
                    .with_ret(TypeDesc::Int)
                    .with_locals(1)
                    .with_body(vec![Inst::Const(Const::I32(42)), Inst::Return]),
            ),
        );
        m.add_unit(CodeUnit::new("app/Derived", "app/Base"));
        m.add_unit(
            CodeUnit::new("app/T", OBJECT_ROOT).with_routine(
                Routine::new("f").with_ret(TypeDesc::Int).with_body(vec![
                    Inst::New("app/Derived".into()),
                    Inst::call_virtual("app/Base", "answer", vec![], Some(TypeDesc::Int)),
                    Inst::Return,
                ]),
            ),
        );
        assert_eq!(run(&m, "app/T", "f", vec![]).unwrap(), Some(Value::I32(42)));
    }

    #[test]
    fn raised_exception_reaches_a_subtype_handler() {
        let r = Routine::new("f")
            .with_ret(TypeDesc::Int)
            .with_body(vec![
                Inst::Label(0),
                Inst::New("app/MyError".into()),
                Inst::Raise,
                Inst::Label(1),
                Inst::Label(2),
                Inst::Pop,
                Inst::Const(Const::I32(1)),
                Inst::Return,
            ])
            .protect(ExceptionRange {
                start: 0,
                end: 1,
                handler: 2,
                catch_type: Some(BASE_EXCEPTION.into()),
            });
        let mut m = single(r);
        m.declare_parent("app/MyError", BASE_EXCEPTION);
        assert_eq!(run(&m, "app/T", "f", vec![]).unwrap(), Some(Value::I32(1)));
    }

    #[test]
    fn unmatched_exception_unwinds_out() {
        let r = Routine::new("f")
            .with_body(vec![Inst::New("app/Plain".into()), Inst::Raise, Inst::Return]);
        let mut m = single(r);
        m.declare_parent("app/Plain", OBJECT_ROOT);
        match run(&m, "app/T", "f", vec![]) {
            Err(Unwind::Thrown(Value::Ref(obj))) => {
                assert_eq!(obj.borrow().unit_name(), "app/Plain");
            }
            other => panic!("expected thrown value, got {other:?}"),
        }
    }

    #[test]
    fn raw_yield_call_is_a_fault() {
        let r = Routine::new("f").with_body(vec![Inst::call_yield(), Inst::Return]);
        let m = single(r);
        match run(&m, "app/T", "f", vec![]) {
            Err(Unwind::Fault(EvalError::NotInstrumented(_))) => {}
            other => panic!("expected not-instrumented fault, got {other:?}"),
        }
    }

    #[test]
    fn frame_instruction_without_active_stack_is_a_fault() {
        let r = Routine::new("f").with_body(vec![Inst::NextEntry, Inst::Pop, Inst::Return]);
        let m = single(r);
        match run(&m, "app/T", "f", vec![]) {
            Err(Unwind::Fault(EvalError::NoActiveStack(name))) => assert_eq!(name, "f"),
            other => panic!("expected no-active-stack fault, got {other:?}"),
        }
    }

    #[test]
    fn list_builtins_and_array_elements() {
        let r = Routine::new("f")
            .with_ret(TypeDesc::Int)
            .with_locals(2)
            .with_body(vec![
                Inst::call_static(LIST_UNIT, "new", vec![], Some(TypeDesc::reference(LIST_UNIT))),
                Inst::Store(0),
                Inst::Load(0),
                Inst::Const(Const::I32(9)),
                Inst::call_virtual(LIST_UNIT, "push", vec![TypeDesc::Int], None),
                Inst::Const(Const::I32(2)),
                Inst::NewArray { elem: "int".into() },
                Inst::Store(1),
                Inst::Load(1),
                Inst::Const(Const::I32(1)),
                Inst::Load(0),
                Inst::Const(Const::I32(0)),
                Inst::call_virtual(LIST_UNIT, "get", vec![TypeDesc::Int], Some(TypeDesc::Int)),
                Inst::ArrayStore,
                Inst::Load(1),
                Inst::Const(Const::I32(1)),
                Inst::ArrayLoad,
                Inst::Return,
            ]);
        let m = single(r);
        assert_eq!(run(&m, "app/T", "f", vec![]).unwrap(), Some(Value::I32(9)));
    }

    #[test]
    fn table_switch_selects_one_based() {
        let body = |v: i32| {
            Routine::new("f").with_ret(TypeDesc::Int).with_body(vec![
                Inst::Const(Const::I32(v)),
                Inst::TableSwitch { targets: vec![1, 2], default: 0 },
                Inst::Label(0),
                Inst::Const(Const::I32(-1)),
                Inst::Return,
                Inst::Label(1),
                Inst::Const(Const::I32(10)),
                Inst::Return,
                Inst::Label(2),
                Inst::Const(Const::I32(20)),
                Inst::Return,
            ])
        };
        for (v, want) in [(0, -1), (1, 10), (2, 20), (3, -1)] {
            let m = single(body(v));
            assert_eq!(
                run(&m, "app/T", "f", vec![]).unwrap(),
                Some(Value::I32(want)),
                "selector {v}"
            );
        }
    }

    #[test]
    fn division_by_zero_traps() {
        let r = Routine::new("f").with_ret(TypeDesc::Int).with_body(vec![
            Inst::Const(Const::I32(1)),
            Inst::Const(Const::I32(0)),
            Inst::Bin(BinOp::Div, PrimKind::Int),
            Inst::Return,
        ]);
        let m = single(r);
        match run(&m, "app/T", "f", vec![]) {
            Err(Unwind::Fault(EvalError::ArithmeticTrap(_))) => {}
            other => panic!("expected arithmetic trap, got {other:?}"),
        }
    }
}
