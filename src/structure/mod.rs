//! Structure/union engine - managed snapshots synchronized with native memory
//!
//! Design: a [`StructDef`] is the per-type descriptor (fields, alignment mode,
//! memoized layout). A [`StructRef`] is a shared handle to one instance: the
//! mirrored field values plus the native region they are written to and read
//! from. Synchronization is explicit (`write()` / `read()`); nothing is
//! automatic.
//!
//! Nested by-value instances are rebound to a view of their parent's memory
//! on every read and write. By-reference instances own (or borrow) their own
//! memory and only their address is stored in the parent.

mod def;
mod guard;
mod instance;

#[cfg(test)]
mod tests;

pub use def::{StructDef, StructDefBuilder};
pub use instance::StructRef;
