//! NUL-terminated strings allocated for native code

use std::mem::size_of;

use widestring::{WideCString, WideChar};

use super::{MemoryRegion, Pointer};
use crate::codec::StringEncoding;
use crate::error::{Error, Result};

/// A transient native copy of a string, freed on drop
pub struct NativeString {
    region: MemoryRegion,
    address: Pointer,
    wide: bool,
}

impl NativeString {
    /// Encode `value` as a NUL-terminated narrow string
    pub fn narrow(value: &str, encoding: &dyn StringEncoding) -> Result<Self> {
        let mut bytes = encoding.encode(value)?;
        bytes.push(0);
        Self::from_bytes(&bytes, false)
    }

    /// Encode `value` as a NUL-terminated `wchar_t` string
    pub fn wide(value: &str) -> Result<Self> {
        Self::from_bytes(&wide_bytes(value)?, true)
    }

    fn from_bytes(bytes: &[u8], wide: bool) -> Result<Self> {
        let region = MemoryRegion::allocate(bytes.len())?;
        region.write_bytes(0, bytes)?;
        let address = region.address()?;
        Ok(Self { region, address, wide })
    }

    #[inline]
    pub fn pointer(&self) -> Pointer {
        self.address
    }

    #[inline]
    pub fn is_wide(&self) -> bool {
        self.wide
    }

    /// Allocated size including the terminator
    pub fn byte_len(&self) -> usize {
        self.region.len().unwrap_or(0)
    }
}

impl std::fmt::Debug for NativeString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeString({:?}, wide={})", self.address, self.wide)
    }
}

/// `value` as native-endian `wchar_t` units with a terminator
pub(crate) fn wide_bytes(value: &str) -> Result<Vec<u8>> {
    let wide = WideCString::from_str(value)
        .map_err(|_| Error::Encoding("string contains an interior NUL".to_string()))?;
    let units: &[WideChar] = wide.as_slice_with_nul();
    let mut bytes = Vec::with_capacity(units.len() * size_of::<WideChar>());
    for unit in units {
        bytes.extend_from_slice(&unit.to_ne_bytes());
    }
    Ok(bytes)
}
