//! ABI (Application Binary Interface) handling
//!
//! Two conventions are distinguished: the platform C convention and the
//! alternate `stdcall` convention of 32-bit Windows. Everywhere else the
//! alternate convention is the C convention under another name, but
//! callbacks are still cached per convention.

use libffi::raw::{ffi_abi, ffi_abi_FFI_DEFAULT_ABI};

/// Native calling convention of a function or callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CallingConvention {
    /// C calling convention (platform default)
    #[default]
    C,
    /// Callee-cleanup convention of the Win32 API
    StdCall,
}

impl CallingConvention {
    /// Whether this is the alternate (non-C) convention
    #[inline]
    pub const fn is_alternate(self) -> bool {
        matches!(self, Self::StdCall)
    }

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::StdCall => "stdcall",
        }
    }

    /// libffi ABI constant for this convention on the build target
    #[inline]
    pub(crate) fn ffi_abi(self) -> ffi_abi {
        match self {
            #[cfg(all(target_arch = "x86", windows))]
            Self::StdCall => libffi::raw::ffi_abi_FFI_STDCALL,
            _ => ffi_abi_FFI_DEFAULT_ABI,
        }
    }
}

impl std::fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_c() {
        assert_eq!(CallingConvention::default(), CallingConvention::C);
        assert!(!CallingConvention::C.is_alternate());
        assert!(CallingConvention::StdCall.is_alternate());
    }

    #[cfg(not(all(target_arch = "x86", windows)))]
    #[test]
    fn stdcall_is_c_abi_off_win32() {
        assert_eq!(
            CallingConvention::StdCall.ffi_abi(),
            CallingConvention::C.ffi_abi()
        );
    }
}
