//! Error taxonomy for the marshaling engine
//!
//! Configuration errors are programming mistakes found before any native
//! call runs, so they are never retried. A layout that simply cannot be
//! computed yet is *not* an error; see [`crate::layout::Resolution`].

use thiserror::Error;

/// Builds an [`Error::Configuration`] from a format string.
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Configuration {
            message: format!($($arg)*),
        }
    };
}

pub(crate) use config_error;

/// The error type for every fallible operation in this crate.
///
/// # Error Categories
///
/// - [`Error::Configuration`] - unsupported types, too many arguments,
///   non-contiguous structure arrays, uninitialized array fields
/// - [`Error::NativeLinkage`] - a library or symbol could not be resolved
/// - [`Error::OutOfBounds`], [`Error::RegionReleased`], [`Error::NullPointer`] -
///   memory accesses rejected at the region boundary
/// - [`Error::Encoding`] - a string could not be converted
/// - [`Error::Callback`] - a trampoline could not be synthesized
#[derive(Debug, Error)]
pub enum Error {
    /// A mistake in how types, fields or arguments were declared.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A native library or one of its symbols is missing.
    #[error("cannot resolve '{symbol}' in '{library}': {reason}")]
    NativeLinkage {
        library: String,
        symbol: String,
        reason: String,
    },

    /// An access falls outside a bounded memory region.
    #[error("access of {size} bytes at offset {offset} exceeds region of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    /// A shared view outlived the region that owns its memory.
    #[error("memory region was released by its owner")]
    RegionReleased,

    /// A null native address where memory was required.
    #[error("null pointer")]
    NullPointer,

    /// A string could not be encoded for native code.
    #[error("string encoding error: {0}")]
    Encoding(String),

    /// A callback signature could not be bound to a trampoline.
    #[error("callback error: {0}")]
    Callback(String),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file is not valid TOML for [`crate::config::BridgeConfig`].
    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error reflects a declaration mistake rather than a runtime fault.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Callback(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
