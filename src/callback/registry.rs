//! Process-wide map from callbacks to their trampolines

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::{identity_of, Callback, CallbackBinding};
use crate::abi::CallingConvention;
use crate::codec::CodecRegistry;
use crate::config;
use crate::error::Result;
use crate::memory::Pointer;

const CONVENTIONS: [CallingConvention; 2] = [CallingConvention::C, CallingConvention::StdCall];

static GLOBAL_CALLBACKS: Lazy<Arc<CallbackRegistry>> =
    Lazy::new(|| Arc::new(CallbackRegistry::new(CodecRegistry::global().clone())));

/// One binding per (callback, calling convention)
///
/// Each convention has its own map so a lookup never contends with bindings
/// of the other convention.
pub struct CallbackRegistry {
    maps: [Mutex<HashMap<usize, Arc<CallbackBinding>>>; 2],
    codecs: CodecRegistry,
    purge_on_lookup: bool,
}

impl CallbackRegistry {
    pub fn new(codecs: CodecRegistry) -> Self {
        Self {
            maps: [Mutex::new(HashMap::new()), Mutex::new(HashMap::new())],
            codecs,
            purge_on_lookup: config::current().callbacks.purge_on_lookup,
        }
    }

    /// The registry used by structure fields and function calls
    pub fn global() -> &'static Arc<CallbackRegistry> {
        &GLOBAL_CALLBACKS
    }

    #[inline]
    fn map(&self, convention: CallingConvention) -> &Mutex<HashMap<usize, Arc<CallbackBinding>>> {
        &self.maps[convention as usize]
    }

    /// The binding for `callback`, creating its trampoline on first use
    ///
    /// Repeated calls with the same callback and convention return the same
    /// trampoline address.
    pub fn get_or_create(
        &self,
        callback: &Arc<dyn Callback>,
        convention: CallingConvention,
    ) -> Result<Arc<CallbackBinding>> {
        let identity = identity_of(callback);
        let mut map = self.map(convention).lock();
        if self.purge_on_lookup {
            map.retain(|_, binding| binding.is_alive());
        }
        if let Some(binding) = map.get(&identity) {
            // A dead binding at this identity belongs to an earlier allocation
            if binding.is_alive() {
                return Ok(binding.clone());
            }
        }
        let binding = Arc::new(CallbackBinding::new(callback, convention, &self.codecs)?);
        map.insert(identity, binding.clone());
        Ok(binding)
    }

    /// Trampoline address for `callback`
    pub fn trampoline(&self, callback: &Arc<dyn Callback>, convention: CallingConvention) -> Result<Pointer> {
        Ok(self.get_or_create(callback, convention)?.trampoline())
    }

    /// Existing binding for `callback`, without creating one
    pub fn lookup(
        &self,
        callback: &Arc<dyn Callback>,
        convention: CallingConvention,
    ) -> Option<Arc<CallbackBinding>> {
        self.map(convention)
            .lock()
            .get(&identity_of(callback))
            .filter(|binding| binding.is_alive())
            .cloned()
    }

    /// Drop every binding of `callback`; returns whether any existed
    ///
    /// Native code holding one of its trampolines must not call it afterwards.
    pub fn release(&self, callback: &Arc<dyn Callback>) -> bool {
        let identity = identity_of(callback);
        let mut removed = false;
        for convention in CONVENTIONS {
            let binding = self.map(convention).lock().remove(&identity);
            removed |= binding.is_some();
        }
        removed
    }

    /// Drop bindings whose callback is gone; returns how many were dropped
    pub fn purge(&self) -> usize {
        let mut dead = Vec::new();
        for map in &self.maps {
            let mut map = map.lock();
            let before = map.len();
            map.retain(|_, binding| binding.is_alive());
            dead.push(before - map.len());
        }
        dead.into_iter().sum()
    }

    /// Live and dead bindings currently held
    pub fn len(&self) -> usize {
        self.maps.iter().map(|map| map.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("bindings", &self.len())
            .field("purge_on_lookup", &self.purge_on_lookup)
            .finish()
    }
}
