//! Bounds-checked memory regions
//!
//! Design: a region is a base (owned block, weak view of a block, or foreign
//! address) plus an offset and an optional length. Every typed access checks
//! the length first and, for shared views, that the owner is still alive for
//! the duration of the access.

use std::mem::size_of;
use std::sync::{Arc, Weak};

use super::{NativeBlock, Pointer};
use crate::error::{config_error, Error, Result};

enum Backing {
    Owned(Arc<NativeBlock>),
    Shared(Weak<NativeBlock>),
    Foreign(Pointer),
}

/// A span of native memory
///
/// `Owned` regions free their block on drop. `Shared` regions are views into
/// another region's block and report [`Error::RegionReleased`] once that block
/// is gone. `Foreign` regions wrap memory managed by native code.
pub struct MemoryRegion {
    backing: Backing,
    offset: usize,
    len: Option<usize>,
}

macro_rules! scalar_accessors {
    ($($get:ident / $set:ident : $ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $get(&self, offset: usize) -> Result<$ty> {
                // SAFETY: `access` checked bounds and liveness for this width
                self.access(offset, size_of::<$ty>(), |p| unsafe { (p as *const $ty).read_unaligned() })
            }

            #[inline]
            pub fn $set(&self, offset: usize, value: $ty) -> Result<()> {
                // SAFETY: `access` checked bounds and liveness for this width
                self.access(offset, size_of::<$ty>(), |p| unsafe { (p as *mut $ty).write_unaligned(value) })
            }
        )*
    };
}

impl MemoryRegion {
    /// Allocate an owned, zeroed region
    pub fn allocate(size: usize) -> Result<Self> {
        let block = NativeBlock::zeroed(size)?;
        Ok(Self {
            backing: Backing::Owned(Arc::new(block)),
            offset: 0,
            len: Some(size),
        })
    }

    /// Wrap memory owned by native code
    ///
    /// # Safety
    /// `address` must stay valid for reads and writes of `len` bytes (or of
    /// every access made, when `len` is `None`) while the region is used.
    pub unsafe fn foreign(address: Pointer, len: Option<usize>) -> Result<Self> {
        if address.is_null() {
            return Err(Error::NullPointer);
        }
        Ok(Self {
            backing: Backing::Foreign(address),
            offset: 0,
            len,
        })
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self.backing, Backing::Owned(_))
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    #[inline]
    pub fn is_foreign(&self) -> bool {
        matches!(self.backing, Backing::Foreign(_))
    }

    /// Length in bytes, `None` for unbounded foreign memory
    #[inline]
    pub fn len(&self) -> Option<usize> {
        self.len
    }

    /// Whether a shared view's owner is gone
    pub fn is_released(&self) -> bool {
        match &self.backing {
            Backing::Shared(weak) => weak.strong_count() == 0,
            _ => false,
        }
    }

    /// Start address of the region
    pub fn address(&self) -> Result<Pointer> {
        self.with_base(|base| base.offset(self.offset))
    }

    fn with_base<R>(&self, f: impl FnOnce(Pointer) -> R) -> Result<R> {
        match &self.backing {
            Backing::Owned(block) => Ok(f(block.pointer())),
            Backing::Shared(weak) => {
                // Held across `f` so the block cannot be freed mid-access
                let block = weak.upgrade().ok_or(Error::RegionReleased)?;
                Ok(f(block.pointer()))
            }
            Backing::Foreign(address) => Ok(f(*address)),
        }
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        if let Some(len) = self.len {
            let fits = offset.checked_add(size).is_some_and(|end| end <= len);
            if !fits {
                return Err(Error::OutOfBounds { offset, size, len });
            }
        }
        Ok(())
    }

    fn access<R>(&self, offset: usize, size: usize, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        self.check(offset, size)?;
        self.with_base(|base| f(base.offset(self.offset + offset).as_ptr()))
    }

    /// A non-owning view of `len` bytes starting at `offset`
    pub fn share(&self, offset: usize, len: usize) -> Result<MemoryRegion> {
        self.check(offset, len)?;
        let backing = match &self.backing {
            Backing::Owned(block) => Backing::Shared(Arc::downgrade(block)),
            Backing::Shared(weak) => {
                if weak.strong_count() == 0 {
                    return Err(Error::RegionReleased);
                }
                Backing::Shared(weak.clone())
            }
            Backing::Foreign(address) => Backing::Foreign(*address),
        };
        Ok(MemoryRegion {
            backing,
            offset: self.offset + offset,
            len: Some(len),
        })
    }

    /// A non-owning view of the whole region
    pub fn view(&self) -> Result<MemoryRegion> {
        match self.len {
            Some(len) => self.share(0, len),
            None => Ok(MemoryRegion {
                backing: match &self.backing {
                    Backing::Foreign(address) => Backing::Foreign(*address),
                    Backing::Owned(block) => Backing::Shared(Arc::downgrade(block)),
                    Backing::Shared(weak) => Backing::Shared(weak.clone()),
                },
                offset: self.offset,
                len: None,
            }),
        }
    }

    scalar_accessors! {
        get_i8 / set_i8: i8,
        get_i16 / set_i16: i16,
        get_i32 / set_i32: i32,
        get_i64 / set_i64: i64,
        get_f32 / set_f32: f32,
        get_f64 / set_f64: f64,
    }

    /// Read a pointer-width address
    pub fn get_pointer(&self, offset: usize) -> Result<Pointer> {
        // SAFETY: `access` checked bounds and liveness for a pointer width
        self.access(offset, size_of::<usize>(), |p| unsafe {
            Pointer::new((p as *const usize).read_unaligned())
        })
    }

    /// Write a pointer-width address
    pub fn set_pointer(&self, offset: usize, value: Pointer) -> Result<()> {
        // SAFETY: `access` checked bounds and liveness for a pointer width
        self.access(offset, size_of::<usize>(), |p| unsafe {
            (p as *mut usize).write_unaligned(value.address())
        })
    }

    /// Read a C `long` of `long_size` bytes
    pub fn get_native_long(&self, offset: usize, long_size: usize) -> Result<i64> {
        match long_size {
            4 => self.get_i32(offset).map(i64::from),
            8 => self.get_i64(offset),
            other => Err(config_error!("unsupported native long size {other}")),
        }
    }

    /// Write a C `long` of `long_size` bytes
    pub fn set_native_long(&self, offset: usize, long_size: usize, value: i64) -> Result<()> {
        match long_size {
            4 => {
                let narrow = i32::try_from(value)
                    .map_err(|_| config_error!("value {value} does not fit a 4-byte native long"))?;
                self.set_i32(offset, narrow)
            }
            8 => self.set_i64(offset, value),
            other => Err(config_error!("unsupported native long size {other}")),
        }
    }

    /// Copy `len` bytes out of the region
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.access(offset, len, |p| {
            let mut out = vec![0u8; len];
            // SAFETY: `access` checked `len` readable bytes at `p`
            unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
            out
        })
    }

    /// Copy `bytes` into the region
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.access(offset, bytes.len(), |p| {
            // SAFETY: `access` checked `bytes.len()` writable bytes at `p`
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
        })
    }

    /// Set `len` bytes at `offset` to `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.access(offset, len, |p| {
            // SAFETY: `access` checked `len` writable bytes at `p`
            unsafe { std::ptr::write_bytes(p, byte, len) };
        })
    }

    /// Zero the whole region
    pub fn clear(&self) -> Result<()> {
        let len = self
            .len
            .ok_or_else(|| config_error!("cannot clear a region of unknown length"))?;
        self.fill(0, len, 0)
    }

    /// Bytes of a NUL-terminated string stored inline at `offset`
    ///
    /// Bounded regions stop at their end when no terminator is found.
    pub fn read_c_bytes(&self, offset: usize) -> Result<Vec<u8>> {
        match self.len {
            Some(len) => {
                let available = len.saturating_sub(offset);
                let bytes = self.read_bytes(offset, available)?;
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Ok(bytes[..end].to_vec())
            }
            // SAFETY: an unbounded foreign region was declared readable for every access
            None => self.with_base(|base| unsafe { base.offset(self.offset + offset).read_c_bytes() }),
        }
    }

    /// Grow an owned region, preserving its content
    ///
    /// Shared views of the previous block are released.
    pub fn grow_preserving(&mut self, new_len: usize) -> Result<()> {
        let Backing::Owned(old) = &self.backing else {
            return Err(config_error!("only owned regions can grow"));
        };
        let old_len = self.len.unwrap_or(0);
        if new_len <= old_len {
            return Ok(());
        }
        let block = NativeBlock::zeroed(new_len)?;
        // SAFETY: both blocks are live, distinct and at least `old_len` long
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), block.as_ptr(), old_len) };
        self.backing = Backing::Owned(Arc::new(block));
        self.offset = 0;
        self.len = Some(new_len);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Owned(_) => "owned",
            Backing::Shared(_) => "shared",
            Backing::Foreign(_) => "foreign",
        };
        match self.address() {
            Ok(address) => write!(f, "MemoryRegion({kind}, {address:?}, {:?} bytes)", self.len),
            Err(_) => write!(f, "MemoryRegion({kind}, released)"),
        }
    }
}
