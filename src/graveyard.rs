//! The graveyard: a fixed array of tombs in shared memory
//!
//! # Layout
//!
//! ```text
//! +------------------+--------+--------+-----+------------+
//! | Header (slots,   | Tomb 0 | Tomb 1 | ... | Tomb N - 1 |
//! |  used)           |        |        |     |            |
//! +------------------+--------+--------+-----+------------+
//! ```
//!
//! Slot indices are handed out by the host, not by the graveyard. Every
//! operation is a bounded sequence of atomic instructions; none of them
//! blocks or retries on behalf of the caller.

use crate::config::TombsConfig;
use crate::error::{Result, TombsError};
use crate::shm::SharedRegion;
use crate::strings::StringStore;
use crate::tomb::{Outcome, Tomb, TombFields, TombState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Graveyard header stored at the beginning of shared memory
#[repr(C, align(64))]
struct GraveyardHeader {
    slots: usize,
    /// Number of tombs currently counted as populated
    used: AtomicUsize,
}

/// A declared function, as reported by the host when it populates a slot
#[derive(Clone, Copy, Debug, Default)]
pub struct Declaration<'a> {
    pub file: Option<&'a str>,
    pub scope: Option<&'a str>,
    pub function: &'a str,
    pub line_start: u32,
    pub line_end: u32,
}

/// Shared registry of tombs
///
/// All methods take `&self` and are safe to call from any number of threads,
/// or from processes forked after [`startup`](Self::startup).
pub struct Graveyard {
    region: SharedRegion,
    strings: Arc<StringStore>,
    slots: usize,
}

impl Graveyard {
    /// Map a graveyard with room for `slots` tombs
    ///
    /// Names are interned into `strings`, which may be shared with other
    /// graveyards.
    pub fn startup(slots: usize, strings: Arc<StringStore>) -> Result<Self> {
        let size = Self::size_for_slots(slots).ok_or(TombsError::InvalidCapacity {
            what: "slot count",
            got: slots,
        })?;

        let region = SharedRegion::anonymous(size).map_err(|e| {
            warn!(slots, size, error = %e, "Failed to allocate shared memory for graveyard");
            e
        })?;

        unsafe {
            let header = region.as_ptr() as *mut GraveyardHeader;
            (*header).slots = slots;
            (*header).used = AtomicUsize::new(0);
        }

        debug!(slots, size, "graveyard started");

        Ok(Self {
            region,
            strings,
            slots,
        })
    }

    /// Map a graveyard and its string store as described by `config`
    pub fn from_config(config: &TombsConfig) -> Result<Self> {
        config.validate()?;
        let strings = StringStore::new(config.strings_size, config.strings_buckets)
            .inspect_err(|e| warn!(error = %e, "Failed to allocate shared memory for strings"))?;
        Self::startup(config.slots, Arc::new(strings))
    }

    /// Size in bytes of a graveyard with `slots` tombs
    pub fn size_for_slots(slots: usize) -> Option<usize> {
        if slots == 0 {
            return None;
        }
        slots
            .checked_mul(std::mem::size_of::<Tomb>())?
            .checked_add(std::mem::size_of::<GraveyardHeader>())
    }

    #[inline(always)]
    fn header(&self) -> &GraveyardHeader {
        unsafe { &*(self.region.as_ptr() as *const GraveyardHeader) }
    }

    #[inline(always)]
    pub(crate) fn tombs(&self) -> &[Tomb] {
        // SAFETY: the region holds `slots` zero-initialized tombs after the
        // header, and an all-zero tomb is a valid empty one
        unsafe {
            std::slice::from_raw_parts(
                self.region
                    .as_ptr()
                    .add(std::mem::size_of::<GraveyardHeader>())
                    .cast::<Tomb>(),
                self.slots,
            )
        }
    }

    #[inline]
    fn tomb(&self, slot: usize) -> Option<&Tomb> {
        debug_assert!(slot < self.slots, "slot {slot} out of range 0..{}", self.slots);
        self.tombs().get(slot)
    }

    /// Claim `slot` and record `declaration` in it
    ///
    /// Only the first populate of a slot has any effect; later or concurrent
    /// calls return without touching it. A slot that was already vacated is
    /// never populated.
    pub fn populate(&self, slot: usize, declaration: &Declaration<'_>) {
        let Some(tomb) = self.tomb(slot) else {
            return;
        };

        if !tomb.claim() {
            return;
        }

        let Some(fields) = self.resolve(declaration) else {
            warn!(slot, function = declaration.function, "Failed to intern tomb strings");
            tomb.abandon();
            return;
        };

        // Count before publishing so `used` never dips below zero when a
        // vacate closes the tomb right after it becomes visible
        let used = &self.header().used;
        used.fetch_add(1, Ordering::SeqCst);
        if tomb.publish(&fields) != Outcome::Counted {
            used.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn resolve(&self, declaration: &Declaration<'_>) -> Option<TombFields> {
        let file = match declaration.file {
            Some(file) => Some(self.strings.intern(file)?),
            None => None,
        };
        let scope = match declaration.scope {
            Some(scope) => Some(self.strings.intern(scope)?),
            None => None,
        };

        Some(TombFields {
            file,
            scope,
            function: self.strings.intern(declaration.function)?,
            line_start: declaration.line_start,
            line_end: declaration.line_end,
        })
    }

    /// Mark the occupant of `slot` as used, removing it from the count
    ///
    /// Only the first vacate of a slot has any effect.
    pub fn vacate(&self, slot: usize) {
        let Some(tomb) = self.tomb(slot) else {
            return;
        };

        if tomb.vacate() == Outcome::Uncounted {
            self.header().used.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of tombs currently populated
    #[inline]
    pub fn used(&self) -> usize {
        self.header().used.load(Ordering::SeqCst)
    }

    /// Capacity, fixed at startup
    #[inline]
    pub fn slots(&self) -> usize {
        self.header().slots
    }

    /// Current state of `slot`, or `None` when out of range
    pub fn state(&self, slot: usize) -> Option<TombState> {
        self.tombs().get(slot).map(Tomb::state)
    }

    /// The store that owns every name recorded here
    #[inline]
    pub fn strings(&self) -> &StringStore {
        &self.strings
    }

    /// Force-close every populated tomb, returning how many were closed
    fn close_all(&self) -> usize {
        let used = &self.header().used;
        let mut closed = 0;
        for tomb in self.tombs() {
            if tomb.force_close() == Outcome::Uncounted {
                used.fetch_sub(1, Ordering::SeqCst);
                closed += 1;
            }
        }
        closed
    }

    /// Close every outstanding tomb and release the shared memory
    ///
    /// Must only be called once all populate and vacate callers have stopped.
    /// Returns the number of tombs that were still populated.
    pub fn shutdown(self) -> usize {
        let closed = self.close_all();
        debug!(
            slots = self.slots,
            closed,
            used = self.used(),
            "graveyard shutdown"
        );
        closed
    }
}
