//! Native library loading and symbol resolution
//!
//! Thin adapter over `libloading`. The engine itself only needs a
//! [`SymbolResolver`]; `NativeLibrary` is the one it ships with.

use std::ffi::c_void;
use std::fmt;

use libloading::Library;

use crate::abi::CallingConvention;
use crate::error::{Error, Result};
use crate::invoke::Function;
use crate::memory::{MemoryRegion, Pointer};

/// Resolves exported symbols to native addresses
pub trait SymbolResolver: Send + Sync {
    /// Address of `symbol`; fails with [`Error::NativeLinkage`]
    fn resolve(&self, symbol: &str) -> Result<Pointer>;

    /// Name used in diagnostics
    fn name(&self) -> &str;
}

/// A loaded shared library
pub struct NativeLibrary {
    name: String,
    library: Library,
}

impl NativeLibrary {
    /// Load a library by path, or by base name (`"m"` finds `libm.so`)
    ///
    /// # Safety
    /// Loading runs the library's initializers, which may do anything.
    pub unsafe fn open(name: &str) -> Result<Self> {
        let mapped = platform_lib_name(name);
        let library = match Library::new(name) {
            Ok(library) => library,
            Err(first) if mapped != name => Library::new(&mapped).map_err(|e| Error::NativeLinkage {
                library: name.to_string(),
                symbol: String::new(),
                reason: format!("{first}; tried '{mapped}': {e}"),
            })?,
            Err(e) => {
                return Err(Error::NativeLinkage {
                    library: name.to_string(),
                    symbol: String::new(),
                    reason: e.to_string(),
                })
            }
        };
        Ok(Self {
            name: name.to_string(),
            library,
        })
    }

    /// The running process and the libraries it already loaded
    #[cfg(unix)]
    pub fn process() -> Self {
        Self {
            name: "<process>".to_string(),
            library: libloading::os::unix::Library::this().into(),
        }
    }

    /// A function exported by this library
    ///
    /// # Safety
    /// Every call through the returned handle must describe the symbol's
    /// real signature, and the library must outlive the handle.
    pub unsafe fn function(&self, symbol: &str, convention: CallingConvention) -> Result<Function> {
        let address = self.resolve(symbol)?;
        Ok(Function::from_address(symbol, address, convention))
    }

    /// The global variable `symbol`, `size` bytes long
    ///
    /// # Safety
    /// `symbol` must name data of at least `size` bytes, and the library
    /// must outlive the region.
    pub unsafe fn global(&self, symbol: &str, size: usize) -> Result<MemoryRegion> {
        let address = self.resolve(symbol)?;
        MemoryRegion::foreign(address, Some(size))
    }

    fn linkage_error(&self, symbol: &str, reason: impl fmt::Display) -> Error {
        Error::NativeLinkage {
            library: self.name.clone(),
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl SymbolResolver for NativeLibrary {
    fn resolve(&self, symbol: &str) -> Result<Pointer> {
        // SAFETY: the address is only read as an integer here
        let found = unsafe { self.library.get::<*const c_void>(symbol.as_bytes()) };
        let address = found.map_err(|e| self.linkage_error(symbol, e))?;
        let pointer = Pointer::from_raw(*address);
        if pointer.is_null() {
            return Err(self.linkage_error(symbol, "symbol resolves to NULL"));
        }
        Ok(pointer)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary").field("name", &self.name).finish()
    }
}

/// Platform file name of a library given by base name; paths pass through
fn platform_lib_name(name: &str) -> String {
    if name.contains('/') || name.contains('\\') || name.contains('.') {
        return name.to_string();
    }
    if cfg!(windows) {
        format!("{name}.dll")
    } else if cfg!(target_os = "macos") {
        format!("lib{name}.dylib")
    } else {
        format!("lib{name}.so")
    }
}
