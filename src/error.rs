//! Error types for Tombs

use std::io;
use thiserror::Error;

/// Result type for Tombs operations
pub type Result<T> = std::result::Result<T, TombsError>;

/// Errors that can occur while setting up a graveyard
///
/// Losing a populate or vacate race is not an error and never shows up here.
#[derive(Debug, Error)]
pub enum TombsError {
    /// Failed to map shared memory
    #[error("Failed to map {size} bytes of shared memory: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// A size or count that must be positive (or bounded) was not
    #[error("Invalid {what}: {got}")]
    InvalidCapacity { what: &'static str, got: usize },

    /// A configuration value could not be parsed
    #[error("Invalid value for {key}: {value:?}")]
    Config { key: &'static str, value: String },
}
