//! Tomb - one slot of the graveyard
//!
//! Each tomb carries a single atomic state advanced only by compare-exchange.
//!
//! # Transitions
//!
//! ```text
//! populate claim    Empty     -> Claimed
//! populate publish  Claimed   -> Populated     (counted)
//!                   Doomed    -> Destroyed
//! populate abandon  Claimed   -> Destroyed
//!                   Doomed    -> Destroyed
//! vacate            Empty     -> Deleted
//!                   Claimed   -> Doomed
//!                   Populated -> Destroyed     (uncounted)
//! force close       Populated -> Destroyed     (uncounted)
//! ```
//!
//! Every other (state, operation) pair is a no-op. `Deleted` and `Destroyed`
//! are terminal, so no slot is ever reused.

use crate::strings::{raw_of, StrRef};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Observable state of a tomb
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TombState {
    /// Nobody has claimed the slot
    Empty = 0,
    /// A populate won the claim and is writing fields
    Claimed = 1,
    /// Vacated while a populate was still writing
    Doomed = 2,
    /// Fields are published; counted and dumped
    Populated = 3,
    /// Vacated before any populate; populate is refused
    Deleted = 4,
    /// Counting obligation closed
    Destroyed = 5,
}

impl TombState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Empty,
            1 => Self::Claimed,
            2 => Self::Doomed,
            3 => Self::Populated,
            4 => Self::Deleted,
            _ => Self::Destroyed,
        }
    }
}

/// Result of a transition that may change the live count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The tomb became populated; count it
    Counted,
    /// The tomb stopped being populated; uncount it
    Uncounted,
    /// State changed without touching the count, or nothing happened
    Unchanged,
}

/// Field values written by the claim winner
#[derive(Clone, Copy, Debug)]
pub(crate) struct TombFields {
    pub file: Option<StrRef>,
    pub scope: Option<StrRef>,
    pub function: StrRef,
    pub line_start: u32,
    pub line_end: u32,
}

/// A single slot, laid out in shared memory
///
/// Fields are atomics written `Relaxed` by the one thread that won the claim,
/// then published by a `Release` transition to `Populated`. Any reader that
/// loads `Populated` with `Acquire` sees them fully written.
#[repr(C)]
pub(crate) struct Tomb {
    state: AtomicU8,
    file: AtomicU32,
    scope: AtomicU32,
    function: AtomicU32,
    line_start: AtomicU32,
    line_end: AtomicU32,
}

impl Tomb {
    #[inline]
    pub fn state(&self) -> TombState {
        TombState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn transition(&self, from: TombState, to: TombState) -> Result<(), TombState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TombState::from_u8)
    }

    /// Try to become the single writer of this tomb
    #[inline]
    pub fn claim(&self) -> bool {
        self.transition(TombState::Empty, TombState::Claimed).is_ok()
    }

    /// Write fields and publish them; only valid after a won [`claim`](Self::claim)
    pub fn publish(&self, fields: &TombFields) -> Outcome {
        self.file.store(raw_of(fields.file), Ordering::Relaxed);
        self.scope.store(raw_of(fields.scope), Ordering::Relaxed);
        self.function
            .store(fields.function.into_raw(), Ordering::Relaxed);
        self.line_start.store(fields.line_start, Ordering::Relaxed);
        self.line_end.store(fields.line_end, Ordering::Relaxed);

        match self.transition(TombState::Claimed, TombState::Populated) {
            Ok(()) => Outcome::Counted,
            Err(_) => {
                // A vacate doomed us mid-write
                self.abandon();
                Outcome::Unchanged
            }
        }
    }

    /// Give up a won claim without ever publishing
    pub fn abandon(&self) {
        if self
            .transition(TombState::Claimed, TombState::Destroyed)
            .is_err()
        {
            let _ = self.transition(TombState::Doomed, TombState::Destroyed);
        }
    }

    /// Mark the tomb's occupant as removed
    pub fn vacate(&self) -> Outcome {
        let mut current = self.state();
        loop {
            let next = match current {
                TombState::Empty => TombState::Deleted,
                TombState::Claimed => TombState::Doomed,
                TombState::Populated => TombState::Destroyed,
                TombState::Doomed | TombState::Deleted | TombState::Destroyed => {
                    return Outcome::Unchanged
                }
            };

            match self.transition(current, next) {
                Ok(()) if current == TombState::Populated => return Outcome::Uncounted,
                Ok(()) => return Outcome::Unchanged,
                Err(actual) => current = actual,
            }
        }
    }

    /// Close a populated tomb regardless of how it was vacated
    #[inline]
    pub fn force_close(&self) -> Outcome {
        match self.transition(TombState::Populated, TombState::Destroyed) {
            Ok(()) => Outcome::Uncounted,
            Err(_) => Outcome::Unchanged,
        }
    }

    /// Read published fields, if the tomb is currently populated
    pub fn fields(&self) -> Option<TombFields> {
        if self.state() != TombState::Populated {
            return None;
        }

        Some(TombFields {
            file: StrRef::from_raw(self.file.load(Ordering::Relaxed)),
            scope: StrRef::from_raw(self.scope.load(Ordering::Relaxed)),
            function: StrRef::from_raw(self.function.load(Ordering::Relaxed))?,
            line_start: self.line_start.load(Ordering::Relaxed),
            line_end: self.line_end.load(Ordering::Relaxed),
        })
    }
}
