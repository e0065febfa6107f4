//! Graveyard configuration

use crate::error::{Result, TombsError};
use crate::strings::StringStore;
use std::env;

/// Default number of tomb slots
const DEFAULT_SLOTS: usize = 10_000;

/// Default string arena size (32MB)
const DEFAULT_STRINGS_SIZE: usize = 32 * 1024 * 1024;

/// Default number of string hash buckets
const DEFAULT_STRINGS_BUCKETS: usize = 64 * 1024;

pub const ENV_SLOTS: &str = "TOMBS_SLOTS";
pub const ENV_STRINGS: &str = "TOMBS_STRINGS";
pub const ENV_STRINGS_BUCKETS: &str = "TOMBS_STRINGS_BUCKETS";

/// Graveyard configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TombsConfig {
    /// Number of tomb slots, one per declared function
    pub slots: usize,
    /// Size of the interned string arena in bytes
    pub strings_size: usize,
    /// Number of string hash buckets (power of two)
    pub strings_buckets: usize,
}

impl Default for TombsConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            strings_size: DEFAULT_STRINGS_SIZE,
            strings_buckets: DEFAULT_STRINGS_BUCKETS,
        }
    }
}

impl TombsConfig {
    /// Read overrides from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset or blank keys keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &'static str, default: usize| -> Result<usize> {
            match lookup(key).map(|v| v.trim().to_string()) {
                Some(value) if !value.is_empty() => value
                    .parse()
                    .map_err(|_| TombsError::Config { key, value }),
                _ => Ok(default),
            }
        };

        let defaults = Self::default();
        let config = Self {
            slots: parse(ENV_SLOTS, defaults.slots)?,
            strings_size: parse(ENV_STRINGS, defaults.strings_size)?,
            strings_buckets: parse(ENV_STRINGS_BUCKETS, defaults.strings_buckets)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes the graveyard cannot be built with
    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(TombsError::InvalidCapacity {
                what: "slot count",
                got: self.slots,
            });
        }
        StringStore::check_sizes(self.strings_size, self.strings_buckets)
    }
}
