//! Lock helpers.
//!
//! A panic on one engine's simulation thread must not wedge the render thread
//! or sibling engines, so poisoned locks are recovered rather than propagated.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub trait MutexExt<T> {
    /// Lock, taking the inner guard if a previous holder panicked.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_recovers_poisoned_lock() {
        let value = Arc::new(Mutex::new(5));
        let poisoner = Arc::clone(&value);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(value.is_poisoned());
        assert_eq!(*value.lock_or_recover(), 5);
    }
}
