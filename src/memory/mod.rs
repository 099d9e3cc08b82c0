//! Native memory - owned blocks, shared views and foreign addresses
//!
//! Design: Three access levels behind one bounds-checked region type:
//! 1. `NativeBlock` - a zeroed heap block, freed on drop
//! 2. `MemoryRegion` - owned, shared (weak view) or foreign memory
//! 3. `Pointer` - a bare native address for values crossing the ABI
//!
//! A shared view never keeps its owner alive; use after release is an error,
//! not undefined behaviour.

mod block;
mod native_string;
mod pointer;
mod region;

#[cfg(test)]
mod tests;

pub use block::{align_up, NativeBlock};
pub use native_string::NativeString;
pub use pointer::Pointer;
pub use region::MemoryRegion;
