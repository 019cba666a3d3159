//! Mutex-guarded exclusive resources.

use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::DebugLiteral;

/// A resource which is only reachable through its lock.
///
/// There is no way to borrow the inner value without holding the guard, so every
/// use of it is serialized.
pub(crate) struct Exclusive<T>(Mutex<T>);

impl<T> Exclusive<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    /// Block until the resource is free, then lock it.
    pub(crate) fn lock(&self) -> ExclusiveGuard<'_, T> {
        ExclusiveGuard(self.0.lock())
    }
}

impl<T> fmt::Debug for Exclusive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.is_locked() {
            DebugLiteral("<locked>")
        } else {
            DebugLiteral("<unlocked>")
        };
        f.debug_tuple("Exclusive").field(&state).finish()
    }
}

/// Guard for an [`Exclusive`] resource; the lock is released on drop.
pub(crate) struct ExclusiveGuard<'a, T>(MutexGuard<'a, T>);

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
