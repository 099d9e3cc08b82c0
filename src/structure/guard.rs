//! Read-cycle tracking - instances currently being read from native memory
//!
//! A structure graph may reference itself through by-reference fields.
//! Reading an instance that is already being read is a no-op, which both
//! terminates cycles and avoids relocking an instance held further up the
//! stack.

use dashmap::DashSet;
use once_cell::sync::Lazy;

/// Global set of instance identities under `read()` (lock-free concurrent set)
static READING: Lazy<DashSet<usize>> = Lazy::new(|| DashSet::with_capacity(64));

/// RAII marker for an instance under `read()`
///
/// Usage:
/// ```ignore
/// let Some(_guard) = ReadGuard::enter(identity) else {
///     return Ok(()); // already being read further up the stack
/// };
/// ```
pub(crate) struct ReadGuard {
    identity: usize,
}

impl ReadGuard {
    /// Mark `identity` as being read, or `None` if it already is
    #[inline]
    pub(crate) fn enter(identity: usize) -> Option<Self> {
        READING.insert(identity).then_some(Self { identity })
    }
}

impl Drop for ReadGuard {
    #[inline]
    fn drop(&mut self) {
        READING.remove(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_exclusive_until_dropped() {
        let id = 0xdead_0001;
        let guard = ReadGuard::enter(id).expect("first entry");
        assert!(READING.contains(&id));
        assert!(ReadGuard::enter(id).is_none());
        drop(guard);
        assert!(!READING.contains(&id));
        assert!(ReadGuard::enter(id).is_some());
    }
}
