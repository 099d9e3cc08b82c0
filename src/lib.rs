//! native-bridge - calling C from dynamically typed hosts, and being called back
//!
//! This crate marshals managed values to and from native memory without
//! per-function glue code:
//!
//! - [`layout`] computes C struct and union layouts for a target platform
//! - [`structure`] keeps instances synchronized with their native memory
//! - [`invoke`] converts arguments and results around a native call
//! - [`callback`] turns host closures into C function pointers
//! - [`pool`] recycles the scratch memory calls need
//!
//! ```ignore
//! use native_bridge::{NativeLibrary, SemanticType, Value, CallingConvention};
//!
//! let libc = NativeLibrary::process();
//! let strlen = unsafe { libc.function("strlen", CallingConvention::C)? };
//! let n = strlen.invoke(&SemanticType::Int64, &[Value::from("hello")])?;
//! ```

pub mod abi;
pub mod callback;
pub mod codec;
pub mod config;
pub mod error;
pub mod invoke;
pub mod layout;
pub mod library;
pub mod logging;
pub mod marshal;
pub mod memory;
pub mod pool;
pub mod structure;
pub mod value;

// Re-export commonly used items
pub use abi::CallingConvention;
pub use callback::{callback_fn, Callback, CallbackRegistry, CallbackSignature};
pub use codec::{Codec, CodecContext, CodecRegistry, TypeKey};
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use invoke::{Function, InvokeOptions, RawInvoker, MAX_NARGS};
pub use layout::{AlignmentMode, CompositeKind, Passing, Platform, SemanticType, StructureLayout};
pub use library::{NativeLibrary, SymbolResolver};
pub use memory::{MemoryRegion, Pointer};
pub use structure::{StructDef, StructRef};
pub use value::{ArrayValue, ByReference, StringBuffer, Value};

/// Install `config` (or the environment's) and start logging
///
/// Returns `false` when a configuration was already installed; logging is
/// initialized either way.
pub fn init(config: Option<BridgeConfig>) -> bool {
    logging::init();
    config::install(config.unwrap_or_else(BridgeConfig::from_env))
}
