//! Callback trampolines - native code calling back into host logic
//!
//! Design: each (callback, calling convention) pair gets one libffi closure
//! whose code pointer is handed to native code. The closure converts its raw
//! arguments into `Value`s, runs the callback, and converts the result back.
//!
//! Bindings hold callbacks weakly. The registry evicts bindings whose
//! callback is gone (on every lookup, or on `purge()`), and `release()`
//! removes one explicitly. A trampoline invoked after its callback dropped
//! returns zero and logs a warning.

mod registry;
mod trampoline;

#[cfg(test)]
mod tests;

pub use registry::CallbackRegistry;
pub use trampoline::CallbackBinding;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::layout::SemanticType;
use crate::value::Value;

/// Parameter and return types of a callback as native code sees them
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackSignature {
    params: Vec<SemanticType>,
    ret: SemanticType,
}

impl CallbackSignature {
    pub fn new(params: Vec<SemanticType>, ret: SemanticType) -> Self {
        Self { params, ret }
    }

    #[inline]
    pub fn params(&self) -> &[SemanticType] {
        &self.params
    }

    #[inline]
    pub fn ret(&self) -> &SemanticType {
        &self.ret
    }
}

/// Host logic callable from native code
pub trait Callback: Send + Sync {
    fn signature(&self) -> &CallbackSignature;

    /// Run the callback; arguments follow `signature().params()`
    fn invoke(&self, args: &[Value]) -> Result<Value>;
}

/// A [`Callback`] backed by a closure
pub struct FnCallback<F> {
    signature: CallbackSignature,
    f: F,
}

impl<F> FnCallback<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    pub fn new(signature: CallbackSignature, f: F) -> Self {
        Self { signature, f }
    }
}

impl<F> Callback for FnCallback<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn signature(&self) -> &CallbackSignature {
        &self.signature
    }

    fn invoke(&self, args: &[Value]) -> Result<Value> {
        (self.f)(args)
    }
}

impl<F> fmt::Debug for FnCallback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCallback")
            .field("signature", &self.signature)
            .finish()
    }
}

/// Shorthand for a shared closure callback
pub fn callback_fn<F>(signature: CallbackSignature, f: F) -> Arc<dyn Callback>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnCallback::new(signature, f))
}

/// Registry key of a callback: its allocation address
#[inline]
pub(crate) fn identity_of(callback: &Arc<dyn Callback>) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}
