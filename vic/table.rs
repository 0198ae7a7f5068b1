//! Routing tables
//!
//! A table maps a key (a VIRQ number, or a VCPU attachment index) to a weak
//! reference to its current occupant. Lookups are lock-free and must run
//! inside an RCU read-side critical section. Claims and releases are
//! per-slot compare-and-swap operations, so at most one occupant can win a
//! slot; the weak reference of a released occupant is dropped only after a
//! grace period, which keeps it valid for readers that loaded it just
//! before the release.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::sync::{Rcu, RcuReadGuard};
use crate::vic::SourceCore;
use crate::{Error, Result};

/// Raw weak reference travelling to a deferred reclamation callback
struct DeferredWeak<T>(*const T);

// SAFETY: the pointer came from `Weak::into_raw`, and `Weak<T>` is `Send`
// when `T: Send + Sync`
unsafe impl<T: Send + Sync> Send for DeferredWeak<T> {}

impl<T> DeferredWeak<T> {
    /// Drop the weak reference
    ///
    /// # Safety
    ///
    /// Must be called once, after no reader can observe the pointer.
    unsafe fn release(self) {
        drop(Weak::from_raw(self.0));
    }
}

/// VIRQ number to bound source
pub type RoutingTable = WeakTable<SourceCore>;

/// Table of weak references keyed by a dense integer range
pub struct WeakTable<T> {
    base: u32,
    slots: Box<[AtomicPtr<T>]>,
    _marker: PhantomData<Weak<T>>,
}

impl<T> WeakTable<T> {
    /// Create an empty table covering `range`
    pub fn new(range: Range<u32>) -> Self {
        let len = range.end.saturating_sub(range.start) as usize;
        Self {
            base: range.start,
            slots: (0..len)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            _marker: PhantomData,
        }
    }

    /// Key range covered by this table
    pub fn range(&self) -> Range<u32> {
        self.base..self.base + self.slots.len() as u32
    }

    /// Check if `key` falls inside this table
    pub fn contains(&self, key: u32) -> bool {
        self.range().contains(&key)
    }

    fn slot(&self, key: u32) -> Option<&AtomicPtr<T>> {
        let index = key.checked_sub(self.base)? as usize;
        self.slots.get(index)
    }

    /// Check if `key` currently has an occupant
    pub fn is_claimed(&self, key: u32) -> bool {
        self.slot(key)
            .map_or(false, |slot| !slot.load(Ordering::Acquire).is_null())
    }

    /// Exclusively claim `key` for `occupant`
    ///
    /// Fails with `ArgumentInvalid` if `key` is outside the table and with
    /// `Busy` if another occupant holds the slot.
    pub fn claim(&self, key: u32, occupant: &Arc<T>) -> Result<()> {
        let slot = self.slot(key).ok_or(Error::ArgumentInvalid)?;
        let raw = Weak::into_raw(Arc::downgrade(occupant)) as *mut T;

        match slot.compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `raw` was never published
                drop(unsafe { Weak::from_raw(raw) });
                Err(Error::Busy)
            }
        }
    }

    /// Look up the occupant of `key`
    pub fn lookup(&self, key: u32, _guard: &RcuReadGuard<'_>) -> Option<Arc<T>> {
        // SAFETY: the read-side critical section keeps any reference we load
        // alive until the guard is dropped
        unsafe { self.lookup_unprotected(key) }
    }

    /// Look up the occupant of `key` without a read-side critical section
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the slot cannot be released
    /// concurrently, e.g. by holding the lock that serializes releases.
    pub unsafe fn lookup_unprotected(&self, key: u32) -> Option<Arc<T>> {
        let raw = self.slot(key)?.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // Borrow the table's weak reference without consuming it
        let weak = ManuallyDrop::new(Weak::from_raw(raw as *const T));
        weak.upgrade()
    }
}

impl<T: Send + Sync + 'static> WeakTable<T> {
    /// Release `key`, which must be held by `occupant`
    ///
    /// New lookups stop finding the occupant immediately; the table's weak
    /// reference is dropped after a grace period of `rcu`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is held by anything else: the claim bookkeeping
    /// has been corrupted and continuing could misroute interrupts.
    pub fn release(&self, key: u32, occupant: &Arc<T>, rcu: &Rcu) {
        let expected = Arc::as_ptr(occupant) as *mut T;
        let released = self.slot(key).map(|slot| {
            slot.compare_exchange(expected, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
        });

        match released {
            Some(Ok(raw)) => Self::defer_release(raw, rcu),
            _ => panic!("table slot {} not held by releasing occupant", key),
        }
    }

    /// Remove whatever occupies `key`, returning it if still alive
    pub fn take(&self, key: u32, rcu: &Rcu) -> Option<Arc<T>> {
        let raw = self.slot(key)?.swap(ptr::null_mut(), Ordering::SeqCst);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the reference stays owned by the table until the deferred
        // release below runs
        let occupant = unsafe { ManuallyDrop::new(Weak::from_raw(raw as *const T)) }.upgrade();
        Self::defer_release(raw, rcu);
        occupant
    }

    fn defer_release(raw: *mut T, rcu: &Rcu) {
        let deferred = DeferredWeak(raw as *const T);
        // SAFETY: the slot no longer publishes `raw`; after the grace period
        // no reader can still hold it
        rcu.call_rcu(move || unsafe { deferred.release() });
    }
}

impl<T> Drop for WeakTable<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let raw = *slot.get_mut();
            if !raw.is_null() {
                // SAFETY: exclusive access; nothing can look up a dropped table
                drop(unsafe { Weak::from_raw(raw as *const T) });
            }
        }
    }
}
