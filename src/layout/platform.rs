//! Target platform descriptors used by layout rules

use std::ffi::c_long;
use std::mem::size_of;

use super::AlignmentMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
    Arm,
    PowerPc,
    Sparc,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// Type sizes and ABI quirks of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub arch: Arch,
    pub os: Os,
    pub pointer_size: usize,
    pub long_size: usize,
    pub wchar_size: usize,
}

impl Platform {
    pub const LINUX_X86_64: Platform = Platform {
        arch: Arch::X86_64,
        os: Os::Linux,
        pointer_size: 8,
        long_size: 8,
        wchar_size: 4,
    };

    pub const LINUX_X86: Platform = Platform {
        arch: Arch::X86,
        os: Os::Linux,
        pointer_size: 4,
        long_size: 4,
        wchar_size: 4,
    };

    pub const WINDOWS_X86_64: Platform = Platform {
        arch: Arch::X86_64,
        os: Os::Windows,
        pointer_size: 8,
        long_size: 4,
        wchar_size: 2,
    };

    pub const WINDOWS_X86: Platform = Platform {
        arch: Arch::X86,
        os: Os::Windows,
        pointer_size: 4,
        long_size: 4,
        wchar_size: 2,
    };

    pub const MACOS_PPC: Platform = Platform {
        arch: Arch::PowerPc,
        os: Os::MacOs,
        pointer_size: 4,
        long_size: 4,
        wchar_size: 4,
    };

    pub const SOLARIS_SPARC: Platform = Platform {
        arch: Arch::Sparc,
        os: Os::Other,
        pointer_size: 4,
        long_size: 4,
        wchar_size: 4,
    };

    /// The build target
    pub fn current() -> Self {
        let arch = if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "arm") {
            Arch::Arm
        } else if cfg!(any(target_arch = "powerpc", target_arch = "powerpc64")) {
            Arch::PowerPc
        } else if cfg!(any(target_arch = "sparc", target_arch = "sparc64")) {
            Arch::Sparc
        } else {
            Arch::Other
        };
        let os = if cfg!(target_os = "linux") {
            Os::Linux
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else if cfg!(windows) {
            Os::Windows
        } else {
            Os::Other
        };
        Self {
            arch,
            os,
            pointer_size: size_of::<usize>(),
            long_size: size_of::<c_long>(),
            wchar_size: size_of::<libc::wchar_t>(),
        }
    }

    #[inline]
    pub fn is_windows(&self) -> bool {
        self.os == Os::Windows
    }

    /// Largest alignment GCC gives a scalar field
    #[inline]
    pub fn max_gnuc_alignment(&self) -> usize {
        if self.arch == Arch::Sparc {
            8
        } else {
            self.long_size
        }
    }

    /// Replace `PlatformDefault` with this platform's concrete mode
    pub fn resolve_mode(&self, mode: AlignmentMode) -> AlignmentMode {
        match mode {
            AlignmentMode::PlatformDefault if self.is_windows() => AlignmentMode::MsvcLike,
            AlignmentMode::PlatformDefault => AlignmentMode::GnuLike,
            other => other,
        }
    }

    /// Cap a natural alignment according to `mode`
    pub fn cap_alignment(&self, mode: AlignmentMode, natural: usize, first_field: bool) -> usize {
        match self.resolve_mode(mode) {
            AlignmentMode::None => 1,
            AlignmentMode::MsvcLike => natural.min(8),
            AlignmentMode::GnuLike if first_field && self.arch == Arch::PowerPc => natural,
            _ => natural.min(self.max_gnuc_alignment()),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}
