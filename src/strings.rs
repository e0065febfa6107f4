//! Interned string store in shared memory
//!
//! Names and paths recorded in tombs are interned once and referenced by a
//! small offset handle, so a tomb never holds a pointer that would mean
//! something different in another process.
//!
//! # Layout
//!
//! ```text
//! +--------+------------------------------+-----------------------------+
//! | Header | Buckets ([AtomicU32; N])     |  Entry arena (append-only)  |
//! +--------+------------------------------+-----------------------------+
//! ```
//!
//! An entry is a little-endian `u32` length followed by the bytes, padded to
//! four bytes. Buckets hold the arena offset of an entry, or zero when empty.
//!
//! # Thread / Process Safety
//!
//! Interning is lock-free: the arena cursor is advanced with a CAS loop, the
//! entry is written by the thread that reserved it, and only then published
//! into a bucket with a release CAS. Readers acquire the bucket before
//! touching the entry. Entries are never freed or rewritten.

use crate::error::{Result, TombsError};
use crate::shm::SharedRegion;
use std::hash::{DefaultHasher, Hasher};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Entries are aligned to this many bytes
const ENTRY_ALIGN: usize = 4;

/// Size of the length prefix of an entry
const LEN_PREFIX: usize = 4;

/// Largest bucket count; bucket indices must fit in a `u32`
pub const MAX_BUCKETS: usize = 1 << 31;

/// Store header, on its own cache line
#[repr(C, align(64))]
struct StringsHeader {
    /// Next free byte in the arena
    cursor: AtomicU32,
    /// Number of distinct strings published
    count: AtomicU32,
}

/// Handle to an interned string
///
/// The handle is an offset into the store's arena, valid in every process
/// sharing the mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StrRef(NonZeroU32);

impl StrRef {
    /// Rebuild a handle from its raw form; zero means "no string"
    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw form suitable for storing in an atomic
    #[inline]
    pub(crate) fn into_raw(self) -> u32 {
        self.0.get()
    }
}

/// Raw form of an optional handle
#[inline]
pub(crate) fn raw_of(r: Option<StrRef>) -> u32 {
    r.map_or(0, StrRef::into_raw)
}

/// Append-only, deduplicating string store backed by shared memory
pub struct StringStore {
    region: SharedRegion,
    buckets: usize,
    arena_len: u32,
}

impl StringStore {
    /// Map a store with an arena of `arena_bytes` and `buckets` hash buckets
    ///
    /// `buckets` must be a power of two no larger than [`MAX_BUCKETS`];
    /// `arena_bytes` must fit in a `u32`.
    pub fn new(arena_bytes: usize, buckets: usize) -> Result<Self> {
        Self::check_sizes(arena_bytes, buckets)?;
        let size = Self::region_size(arena_bytes, buckets).ok_or(TombsError::InvalidCapacity {
            what: "string bucket count",
            got: buckets,
        })?;

        let region = SharedRegion::anonymous(size)?;
        let store = Self {
            region,
            buckets,
            arena_len: arena_bytes as u32,
        };

        // Offset zero is reserved so an empty bucket reads as 0
        store
            .header()
            .cursor
            .store(ENTRY_ALIGN as u32, Ordering::Release);

        Ok(store)
    }

    /// Reject sizes a store cannot be built with
    pub fn check_sizes(arena_bytes: usize, buckets: usize) -> Result<()> {
        if buckets == 0 || !buckets.is_power_of_two() || buckets > MAX_BUCKETS {
            return Err(TombsError::InvalidCapacity {
                what: "string bucket count",
                got: buckets,
            });
        }
        if arena_bytes <= ENTRY_ALIGN || u32::try_from(arena_bytes).is_err() {
            return Err(TombsError::InvalidCapacity {
                what: "string arena size",
                got: arena_bytes,
            });
        }
        Ok(())
    }

    fn region_size(arena_bytes: usize, buckets: usize) -> Option<usize> {
        buckets
            .checked_mul(std::mem::size_of::<AtomicU32>())?
            .checked_add(std::mem::size_of::<StringsHeader>())?
            .checked_add(arena_bytes)
    }

    /// Only called on a store whose sizes passed `region_size`
    #[inline(always)]
    const fn arena_offset(buckets: usize) -> usize {
        std::mem::size_of::<StringsHeader>() + buckets * std::mem::size_of::<AtomicU32>()
    }

    #[inline(always)]
    fn header(&self) -> &StringsHeader {
        unsafe { &*(self.region.as_ptr() as *const StringsHeader) }
    }

    #[inline(always)]
    fn bucket(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < self.buckets);
        unsafe {
            &*(self
                .region
                .as_ptr()
                .add(std::mem::size_of::<StringsHeader>())
                .cast::<AtomicU32>()
                .add(index))
        }
    }

    #[inline(always)]
    fn arena(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(Self::arena_offset(self.buckets)) }
    }

    /// Intern `s`, returning the handle shared by every equal string
    ///
    /// Returns `None` when the arena or the bucket table is exhausted.
    pub fn intern(&self, s: &str) -> Option<StrRef> {
        let bytes = s.as_bytes();
        let mask = self.buckets - 1;
        let start = (hash(bytes) as usize) & mask;

        // Reserved lazily; wasted if another thread publishes the same string
        let mut pending: Option<StrRef> = None;

        for probe in 0..self.buckets {
            let bucket = self.bucket((start + probe) & mask);
            let mut current = bucket.load(Ordering::Acquire);

            if current == 0 {
                let entry = match pending {
                    Some(entry) => entry,
                    None => {
                        let entry = self.alloc(bytes)?;
                        pending = Some(entry);
                        entry
                    }
                };

                match bucket.compare_exchange(
                    0,
                    entry.into_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.header().count.fetch_add(1, Ordering::Relaxed);
                        return Some(entry);
                    }
                    Err(winner) => current = winner,
                }
            }

            let existing = StrRef::from_raw(current)?;
            if self.bytes(existing) == bytes {
                return Some(existing);
            }
        }

        warn!(buckets = self.buckets, "string table is full");
        None
    }

    /// Reserve and fill an entry for `bytes`
    fn alloc(&self, bytes: &[u8]) -> Option<StrRef> {
        let len = u32::try_from(bytes.len()).ok()?;
        let size = (LEN_PREFIX + bytes.len()).next_multiple_of(ENTRY_ALIGN);
        let size = u32::try_from(size).ok()?;
        let arena_len = self.arena_len;

        let offset = self
            .header()
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                cursor.checked_add(size).filter(|end| *end <= arena_len)
            });

        let offset = match offset {
            Ok(offset) => offset,
            Err(_) => {
                warn!(
                    arena_len,
                    requested = size,
                    "string arena exhausted"
                );
                return None;
            }
        };

        // SAFETY: [offset, offset + size) was reserved exclusively above
        unsafe {
            let entry = self.arena().add(offset as usize);
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), entry, LEN_PREFIX);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), entry.add(LEN_PREFIX), bytes.len());
        }

        StrRef::from_raw(offset)
    }

    fn bytes(&self, r: StrRef) -> &[u8] {
        let offset = r.into_raw() as usize;
        debug_assert!(offset + LEN_PREFIX <= self.arena_len as usize);

        // SAFETY: handles only come from published entries, whose bytes were
        // written before the release that made the handle observable
        unsafe {
            let entry = self.arena().add(offset);
            let mut len = [0u8; LEN_PREFIX];
            std::ptr::copy_nonoverlapping(entry, len.as_mut_ptr(), LEN_PREFIX);
            let len = u32::from_le_bytes(len) as usize;
            std::slice::from_raw_parts(entry.add(LEN_PREFIX), len)
        }
    }

    /// Resolve a handle back to its string
    pub fn get(&self, r: StrRef) -> &str {
        // Only `intern(&str)` writes entries
        std::str::from_utf8(self.bytes(r)).unwrap_or_default()
    }

    /// Number of distinct strings interned
    pub fn len(&self) -> usize {
        self.header().count.load(Ordering::Acquire) as usize
    }

    /// Check if nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of the arena consumed so far, including the reserved prefix
    pub fn bytes_used(&self) -> usize {
        self.header().cursor.load(Ordering::Acquire) as usize
    }
}

fn hash(bytes: &[u8]) -> u64 {
    // Fixed keys, so every process agrees on bucket placement
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_intern_dedup() {
        let store = StringStore::new(4096, 64).unwrap();
        assert!(store.is_empty());

        let a = store.intern("Foo::bar").unwrap();
        let b = store.intern("/srv/app/index.php").unwrap();
        let c = store.intern("Foo::bar").unwrap();

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(store.get(a), "Foo::bar");
        assert_eq!(store.get(b), "/srv/app/index.php");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_string() {
        let store = StringStore::new(256, 8).unwrap();
        let r = store.intern("").unwrap();
        assert_eq!(store.get(r), "");
        assert_eq!(store.intern(""), Some(r));
    }

    #[test]
    fn test_arena_exhausted() {
        let store = StringStore::new(32, 8).unwrap();
        assert!(store.intern("0123456789").is_some());
        assert!(store.intern("abcdefghijklmnopqrstuvwxyz").is_none());
        assert!(store.bytes_used() <= 32);
    }

    #[test]
    fn test_table_full() {
        let store = StringStore::new(4096, 2).unwrap();
        assert!(store.intern("a").is_some());
        assert!(store.intern("b").is_some());
        assert!(store.intern("c").is_none());
        // Already present strings still resolve
        assert!(store.intern("a").is_some());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(StringStore::new(4096, 3).is_err());
        assert!(StringStore::new(4096, 0).is_err());
        assert!(StringStore::new(0, 8).is_err());
        assert!(StringStore::new(4, 8).is_err());
    }

    #[test]
    fn test_oversized_bucket_count() {
        assert!(StringStore::new(4096, 1 << 62).is_err());
        assert!(StringStore::new(4096, MAX_BUCKETS * 2).is_err());
        assert!(StringStore::new(usize::MAX - 8, 8).is_err());
    }

    #[test]
    fn test_concurrent_intern_same_string() {
        let threads = 8;
        let store = StringStore::new(64 * 1024, 256).unwrap();
        let barrier = Barrier::new(threads);

        let refs: Vec<StrRef> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.intern("Graveyard::populate").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(refs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(refs[0]), "Graveyard::populate");
    }
}
