//! The coroutine driver.
//!
//! A [`Coroutine`] owns one [`ContinuationStack`] for its whole lifetime and
//! drives a rewritten entry routine through the NEW → RUNNING →
//! {SUSPENDED, FINISHED} lifecycle. The suspension sentinel is not an
//! exception the routine could catch: it travels as [`Signal::Suspend`]
//! through every `Result` on the way out, so only the driver observes it.

use std::fmt;
use std::mem;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stack::ContinuationStack;

/// Lifecycle state of a [`Coroutine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Not yet executed.
    New,
    /// Currently executing.
    Running,
    /// Paused at a suspension point; `run` resumes it.
    Suspended,
    /// The entry routine returned (or failed). Terminal.
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::New => "new",
            State::Running => "running",
            State::Suspended => "suspended",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// The non-local unwind outcomes of a rewritten routine. `Suspend` is the
/// sentinel: it must pass through every caller untouched, frames left in
/// place, until the driver catches it.
#[derive(Debug, PartialEq)]
pub enum Signal<E> {
    Suspend,
    Fault(E),
}

/// The calling context's single "active continuation stack" slot.
///
/// Exactly one stack is active per context at a time. The driver installs
/// its own stack for the duration of `run` and restores the previous one on
/// every exit path, so nested coroutine invocations stack strictly.
#[derive(Debug, Default)]
pub struct ActiveStack<R> {
    current: Option<ContinuationStack<R>>,
}

impl<R> ActiveStack<R> {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// The stack of the innermost running coroutine, if any. Rewritten code
    /// treats `None` as a programming error at the call site.
    pub fn current(&mut self) -> Option<&mut ContinuationStack<R>> {
        self.current.as_mut()
    }
}

/// An entry routine prepared for suspension.
pub trait CoRunnable<R> {
    type Error;

    /// Execute until return, suspension, or failure. Called once per `run`;
    /// a resumed call dispatches through the active stack's frame records.
    fn co_execute(&mut self, active: &mut ActiveStack<R>) -> Result<(), Signal<Self::Error>>;
}

/// Driver failures. `Fault` carries the entry routine's own error out of
/// the final `run`.
#[derive(Debug, Error)]
pub enum CoroutineError<E: fmt::Display> {
    #[error("coroutine is {0}, expected new or suspended")]
    InvalidState(State),
    #[error("entry routine failed: {0}")]
    Fault(E),
}

/// Snapshot failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot snapshot a running coroutine")]
    Running,
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A pausable computation: an entry routine plus its continuation stack.
#[derive(Debug, Serialize, Deserialize)]
pub struct Coroutine<R, P> {
    proto: P,
    stack: ContinuationStack<R>,
    state: State,
}

impl<R, P> Coroutine<R, P>
where
    R: Default + Clone,
    P: CoRunnable<R>,
    P::Error: fmt::Display,
{
    pub fn new(proto: P) -> Self {
        Self {
            proto,
            stack: ContinuationStack::new(),
            state: State::New,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn proto(&self) -> &P {
        &self.proto
    }

    /// Run until the entry routine finishes or suspends. Valid only in the
    /// NEW and SUSPENDED states; anything else fails immediately.
    ///
    /// The instance's stack is installed as the context's active stack for
    /// the duration of the call and the previous one is restored on every
    /// exit path, including failure.
    pub fn run(&mut self, ctx: &mut ActiveStack<R>) -> Result<State, CoroutineError<P::Error>> {
        match self.state {
            State::New | State::Suspended => {}
            other => return Err(CoroutineError::InvalidState(other)),
        }

        self.state = State::Running;
        let saved = mem::replace(&mut ctx.current, Some(mem::take(&mut self.stack)));
        let outcome = self.proto.co_execute(ctx);
        self.stack = mem::replace(&mut ctx.current, saved).unwrap_or_default();

        match outcome {
            Ok(()) => {
                self.state = State::Finished;
                Ok(State::Finished)
            }
            Err(Signal::Suspend) => {
                self.stack.rewind();
                self.state = State::Suspended;
                Ok(State::Suspended)
            }
            Err(Signal::Fault(e)) => {
                self.state = State::Finished;
                Err(CoroutineError::Fault(e))
            }
        }
    }
}

impl<R, P> Coroutine<R, P>
where
    R: Default + Clone + Serialize,
    P: Serialize,
{
    /// Serialize a paused (or unstarted, or finished) coroutine. A running
    /// one has live transient state and cannot be snapshotted.
    pub fn snapshot(&self) -> Result<String, SnapshotError> {
        if self.state == State::Running {
            return Err(SnapshotError::Running);
        }
        Ok(serde_json::to_string(self)?)
    }
}

impl<R, P> Coroutine<R, P>
where
    R: Default + Clone + DeserializeOwned,
    P: DeserializeOwned,
{
    /// Rebuild a coroutine from [`Self::snapshot`] output.
    pub fn restore(snapshot: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(snapshot)?)
    }
}
