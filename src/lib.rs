//! Tombs - shared memory registry of functions that were declared but never called
//!
//! The host runtime assigns every declared function a slot. When the function
//! is compiled the slot is populated with its name and source location; when
//! it is first invoked the slot is vacated. Whatever is still populated at the
//! end of the process is dead code, and can be dumped as JSON lines.
//!
//! # Architecture
//!
//! - **Graveyard**: fixed array of tombs in one `MAP_SHARED` mapping, plus a
//!   live count. Shared by every thread and every forked process.
//! - **Tomb**: one slot, with a single atomic state advanced by
//!   compare-exchange. No locks anywhere.
//! - **String store**: lock-free interning of names and paths into a second
//!   shared mapping, referenced from tombs by offset.

pub mod error;
pub mod config;
pub mod shm;
pub mod strings;
pub mod tomb;
pub mod graveyard;
pub mod dump;
pub mod bindings;

pub use error::{TombsError, Result};
pub use config::TombsConfig;
pub use graveyard::{Declaration, Graveyard};
pub use dump::{Records, TombRecord};
pub use strings::{StrRef, StringStore};
pub use tomb::TombState;
