//! Bare native addresses

use std::ffi::{c_char, c_void, CStr};
use std::fmt;

use widestring::{WideCStr, WideChar};

/// A native address as seen by C code
///
/// Stored as an integer so values holding pointers stay `Send + Sync`.
/// Dereferencing goes through the `unsafe` readers below or a
/// [`MemoryRegion`](super::MemoryRegion).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pointer(usize);

impl Pointer {
    pub const NULL: Pointer = Pointer(0);

    #[inline]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    #[inline]
    pub fn from_raw<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn address(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    #[inline]
    pub fn as_void(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    /// Address `bytes` past this one
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Storage of the address, for argument slots that pass it by reference
    #[inline]
    pub(crate) fn as_slot(&self) -> &usize {
        &self.0
    }

    /// Bytes of the NUL-terminated string at this address
    ///
    /// # Safety
    /// The address must point to a readable NUL-terminated byte string.
    pub unsafe fn read_c_bytes(self) -> Vec<u8> {
        CStr::from_ptr(self.0 as *const c_char).to_bytes().to_vec()
    }

    /// The NUL-terminated `wchar_t` string at this address
    ///
    /// # Safety
    /// The address must point to a readable NUL-terminated `wchar_t` string.
    pub unsafe fn read_wide_string(self) -> String {
        WideCStr::from_ptr_str(self.0 as *const WideChar).to_string_lossy()
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native@0x{:x}", self.0)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
