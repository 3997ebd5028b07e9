//! The continuation stack.
//!
//! Rewritten routines keep their live state here across a suspension: two
//! parallel lanes (64-bit-packed primitives and references) plus one frame
//! record per activation. The access protocol is fixed by the code
//! generator and must stay in sync with it:
//!
//! - every activation calls [`next_entry`] exactly once, at its start;
//! - [`push_frame`] re-tags the current activation's frame at every
//!   suspension point, before the values are stored;
//! - every return is preceded by one [`pop_frame`].
//!
//! Addressing is always relative to the current frame's base; only the top
//! of the LIFO is ever addressed.
//!
//! [`next_entry`]: ContinuationStack::next_entry
//! [`push_frame`]: ContinuationStack::push_frame
//! [`pop_frame`]: ContinuationStack::pop_frame

use serde::{Deserialize, Serialize};

const INITIAL_LANE_SLOTS: usize = 32;

/// One activation's record: the resume index to dispatch on and the lane
/// offset one past its reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Frame {
    resume: u32,
    top: usize,
}

/// The saved-state store of one coroutine instance.
///
/// `R` is the reference type of the executing environment. Growth doubles
/// a lane until it fits; existing slots keep their indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationStack<R> {
    prims: Vec<u64>,
    refs: Vec<R>,
    frames: Vec<Frame>,
    /// Frames entered since the last rewind. Transient: always 0 when the
    /// coroutine is not running.
    #[serde(skip)]
    cursor: usize,
    /// Base offset of the current frame. Transient.
    #[serde(skip)]
    base: usize,
}

impl<R: Default + Clone> Default for ContinuationStack<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Default + Clone> ContinuationStack<R> {
    pub fn new() -> Self {
        Self {
            prims: vec![0; INITIAL_LANE_SLOTS],
            refs: vec![R::default(); INITIAL_LANE_SLOTS],
            frames: Vec::new(),
            cursor: 0,
            base: 0,
        }
    }

    /// Enter the next activation: advance the frame cursor and return the
    /// frame's resume index, 0 on fresh entry. Sets the frame base for the
    /// accessors.
    pub fn next_entry(&mut self) -> u32 {
        self.base = match self.cursor.checked_sub(1).and_then(|i| self.frames.get(i)) {
            Some(parent) => parent.top,
            None => 0,
        };
        let resume = self.frames.get(self.cursor).map_or(0, |f| f.resume);
        self.cursor += 1;
        resume
    }

    /// Reserve (or re-tag) the current activation's frame: `slots` entries
    /// in both lanes above the enclosing frame's top, tagged with `resume`.
    /// The activation must have entered via [`Self::next_entry`].
    pub fn push_frame(&mut self, resume: u32, slots: u32) {
        debug_assert!(self.cursor > 0, "push_frame before next_entry");
        let idx = self.cursor - 1;
        let base = if idx == 0 { 0 } else { self.frames[idx - 1].top };
        let top = base + slots as usize;

        self.ensure_lanes(top);
        while self.frames.len() < idx {
            let filler_top = self.frames.last().map_or(0, |f| f.top);
            self.frames.push(Frame {
                resume: 0,
                top: filler_top,
            });
        }
        let frame = Frame { resume, top };
        if idx < self.frames.len() {
            self.frames[idx] = frame;
        } else {
            self.frames.push(frame);
        }
        self.base = base;
    }

    /// Drop the current activation's frame, clearing `ref_slots` entries of
    /// its reference lane so no reference outlives the frame.
    pub fn pop_frame(&mut self, ref_slots: u32) {
        debug_assert!(self.cursor > 0, "pop_frame before next_entry");
        let idx = self.cursor - 1;
        let base = if idx == 0 { 0 } else { self.frames[idx - 1].top };

        let end = (base + ref_slots as usize).min(self.refs.len());
        for slot in &mut self.refs[base..end] {
            *slot = R::default();
        }
        self.frames.truncate(idx);
        self.cursor = idx;
        self.base = base;
    }

    /// Reset the frame cursor so the next run descends from the outermost
    /// frame again. Called once per suspension; the frames stay in place.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.base = 0;
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    // ── Typed slot accessors, frame-relative ─────────────────────────

    pub fn put_int(&mut self, slot: u32, value: i32) {
        self.prims[self.base + slot as usize] = value as i64 as u64;
    }

    pub fn get_int(&self, slot: u32) -> i32 {
        self.prims[self.base + slot as usize] as i32
    }

    pub fn put_long(&mut self, slot: u32, value: i64) {
        self.prims[self.base + slot as usize] = value as u64;
    }

    pub fn get_long(&self, slot: u32) -> i64 {
        self.prims[self.base + slot as usize] as i64
    }

    pub fn put_float(&mut self, slot: u32, value: f32) {
        self.prims[self.base + slot as usize] = value.to_bits() as u64;
    }

    pub fn get_float(&self, slot: u32) -> f32 {
        f32::from_bits(self.prims[self.base + slot as usize] as u32)
    }

    pub fn put_double(&mut self, slot: u32, value: f64) {
        self.prims[self.base + slot as usize] = value.to_bits();
    }

    pub fn get_double(&self, slot: u32) -> f64 {
        f64::from_bits(self.prims[self.base + slot as usize])
    }

    pub fn put_ref(&mut self, slot: u32, value: R) {
        self.refs[self.base + slot as usize] = value;
    }

    pub fn get_ref(&self, slot: u32) -> R {
        self.refs[self.base + slot as usize].clone()
    }

    fn ensure_lanes(&mut self, required: usize) {
        if required <= self.prims.len() {
            return;
        }
        let mut size = self.prims.len().max(1);
        while size < required {
            size *= 2;
        }
        self.prims.resize(size, 0);
        self.refs.resize(size, R::default());
    }
}
