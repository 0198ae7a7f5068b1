//! RCU-published optional pointer
//!
//! Holds at most one `Arc<T>`. Readers borrow the current value inside a
//! read-side critical section with plain atomic loads; writers swap it and
//! the replaced value is dropped after a grace period.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::sync::{Rcu, RcuReadGuard};

/// Raw strong reference travelling to a deferred drop
struct DeferredArc<T>(*const T);

// SAFETY: the pointer came from `Arc::into_raw`, and `Arc<T>` is `Send`
// when `T: Send + Sync`
unsafe impl<T: Send + Sync> Send for DeferredArc<T> {}

impl<T> DeferredArc<T> {
    /// # Safety
    ///
    /// Must be called once, after no reader can observe the pointer.
    unsafe fn release(self) {
        drop(Arc::from_raw(self.0));
    }
}

/// Optional `Arc<T>` protected by RCU
pub struct RcuOption<T> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<Arc<T>>,
}

impl<T> RcuOption<T> {
    /// Create an empty cell
    pub const fn new_none() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Create a cell holding `value`
    pub fn new(value: Option<Arc<T>>) -> Self {
        let raw = value.map_or(ptr::null_mut(), |v| Arc::into_raw(v) as *mut T);
        Self {
            ptr: AtomicPtr::new(raw),
            _marker: PhantomData,
        }
    }

    /// Check if the cell is empty
    pub fn is_none(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Borrow the current value for the lifetime of `guard`
    pub fn read_with<'a>(&'a self, _guard: &'a RcuReadGuard<'_>) -> Option<&'a T> {
        let raw = self.ptr.load(Ordering::Acquire);
        // SAFETY: a value unpublished after this load is dropped only once
        // the grace period covering `_guard` has elapsed
        unsafe { raw.as_ref() }
    }

    /// Clone the current value outside a read-side critical section
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the value cannot be replaced
    /// concurrently.
    pub unsafe fn get_unprotected(&self) -> Option<Arc<T>> {
        let raw = self.ptr.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        Arc::increment_strong_count(raw);
        Some(Arc::from_raw(raw))
    }

    /// Publish `value` if the cell is empty, handing it back otherwise
    pub fn publish(&self, value: Arc<T>) -> Result<(), Arc<T>> {
        let raw = Arc::into_raw(value) as *mut T;
        match self
            .ptr
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: `raw` was never published
            Err(_) => Err(unsafe { Arc::from_raw(raw) }),
        }
    }
}

impl<T: Send + Sync + 'static> RcuOption<T> {
    /// Replace the current value
    ///
    /// The old value is dropped after a grace period of `rcu`.
    pub fn update(&self, value: Option<Arc<T>>, rcu: &Rcu) {
        let raw = value.map_or(ptr::null_mut(), |v| Arc::into_raw(v) as *mut T);
        let old = self.ptr.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            let deferred = DeferredArc(old as *const T);
            // SAFETY: the cell no longer publishes `old`
            rcu.call_rcu(move || unsafe { deferred.release() });
        }
    }
}

impl<T> Drop for RcuOption<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        if !raw.is_null() {
            // SAFETY: exclusive access; no reader can borrow from a dropped cell
            drop(unsafe { Arc::from_raw(raw as *const T) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_read() {
        let rcu = Rcu::new(1);
        let cell = RcuOption::<u32>::new_none();
        assert!(cell.is_none());

        assert!(cell.publish(Arc::new(5)).is_ok());
        assert_eq!(cell.publish(Arc::new(6)).map_err(|v| *v), Err(6));

        let guard = rcu.read_lock(0);
        assert_eq!(cell.read_with(&guard), Some(&5));
    }

    #[test]
    fn test_update_defers_old_value() {
        let rcu = Rcu::new(2);
        let old = Arc::new(1u32);
        let cell = RcuOption::new(Some(old.clone()));

        let guard = rcu.read_lock(1);
        let seen = cell.read_with(&guard).copied();
        cell.update(Some(Arc::new(2)), &rcu);
        // The reader may still be looking at the old value
        assert_eq!(Arc::strong_count(&old), 2);
        assert_eq!(seen, Some(1));
        drop(guard);

        rcu.poll();
        assert_eq!(Arc::strong_count(&old), 1);
        assert_eq!(unsafe { cell.get_unprotected() }.as_deref(), Some(&2));

        cell.update(None, &rcu);
        assert!(cell.is_none());
    }

    #[test]
    fn test_drop_releases_value() {
        let value = Arc::new(3u32);
        let cell = RcuOption::new(Some(value.clone()));
        drop(cell);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
