//! Epoch-based read-copy-update domain
//!
//! Readers announce that they are observing shared pointers by entering a
//! read-side critical section on their physical CPU. Writers that unpublish
//! a pointer either wait for a grace period with [`Rcu::synchronize`] or
//! defer the reclamation with [`Rcu::call_rcu`].
//!
//! Every CPU record holds a nesting count and the global epoch it observed
//! when its outermost critical section began. A grace period for epoch `E`
//! has elapsed once no CPU is inside a critical section that started before
//! `E` was published.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crate::sync::SpinLock;
use crate::CpuIndex;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Per-CPU reader state
struct CpuRecord {
    /// Number of nested read-side critical sections
    nesting: AtomicUsize,
    /// Epoch observed by the outermost critical section
    epoch: AtomicU64,
}

impl CpuRecord {
    fn new() -> Self {
        Self {
            nesting: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Epoch of the critical section this CPU is in, if any
    fn active_epoch(&self) -> Option<u64> {
        if self.nesting.load(Ordering::SeqCst) == 0 {
            None
        } else {
            Some(self.epoch.load(Ordering::SeqCst))
        }
    }
}

/// A reclamation callback waiting for its grace period
struct Deferred {
    /// Readers that observed an epoch older than this may still hold a reference
    epoch: u64,
    callback: Callback,
}

/// RCU domain
pub struct Rcu {
    epoch: AtomicU64,
    cpus: Box<[CpuRecord]>,
    deferred: SpinLock<VecDeque<Deferred>>,
}

impl Rcu {
    /// Create a new domain covering `max_cpus` physical CPUs
    pub fn new(max_cpus: usize) -> Self {
        Self {
            epoch: AtomicU64::new(1),
            cpus: (0..max_cpus).map(|_| CpuRecord::new()).collect::<Vec<_>>().into_boxed_slice(),
            deferred: SpinLock::new(VecDeque::new()),
        }
    }

    /// Number of physical CPUs covered
    pub fn max_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Enter a read-side critical section on `pcpu`
    ///
    /// Critical sections nest. The caller must own `pcpu` for the lifetime
    /// of the guard, i.e. no other context may enter on the same CPU
    /// concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `pcpu` is not covered by this domain.
    pub fn read_lock(&self, pcpu: CpuIndex) -> RcuReadGuard<'_> {
        let record = &self.cpus[pcpu];
        if record.nesting.load(Ordering::Relaxed) == 0 {
            // The epoch must be visible before the nesting count that validates it
            record.epoch.store(self.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        record.nesting.fetch_add(1, Ordering::SeqCst);

        RcuReadGuard {
            rcu: self,
            pcpu,
            _not_send: PhantomData,
        }
    }

    /// Enter a read-side critical section on `pcpu`, if it is covered
    pub fn try_read_lock(&self, pcpu: CpuIndex) -> Option<RcuReadGuard<'_>> {
        (pcpu < self.cpus.len()).then(|| self.read_lock(pcpu))
    }

    /// Check if `pcpu` is inside a read-side critical section
    pub fn is_reading(&self, pcpu: CpuIndex) -> bool {
        self.cpus
            .get(pcpu)
            .map_or(false, |r| r.nesting.load(Ordering::SeqCst) != 0)
    }

    /// Wait for a full grace period
    ///
    /// Returns once every critical section that was active when this call
    /// began has ended. Due deferred callbacks are run before returning.
    /// Must not be called from inside a read-side critical section.
    pub fn synchronize(&self) {
        // Order the caller's unpublish before the epoch advance
        fence(Ordering::SeqCst);
        let target = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        for record in self.cpus.iter() {
            while let Some(epoch) = record.active_epoch() {
                if epoch >= target {
                    break;
                }
                core::hint::spin_loop();
            }
        }

        log::trace!("rcu: grace period {} complete", target);
        self.poll();
    }

    /// Defer `callback` until a grace period has elapsed
    pub fn call_rcu<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        fence(Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.deferred.lock().push_back(Deferred {
            epoch,
            callback: Box::new(callback),
        });
        self.poll();
    }

    /// Run every deferred callback whose grace period has elapsed
    ///
    /// Never blocks on readers. Returns the number of callbacks run.
    pub fn poll(&self) -> usize {
        let due: Vec<Callback> = {
            let mut deferred = self.deferred.lock();
            // Scanned under the queue lock so that no entry queued after
            // the scan can be judged against it
            let horizon = self.oldest_active_epoch();
            let mut due = Vec::new();
            // Callbacks are queued in epoch order
            while deferred.front().map_or(false, |d| d.epoch <= horizon) {
                if let Some(d) = deferred.pop_front() {
                    due.push(d.callback);
                }
            }
            due
        };

        let count = due.len();
        for callback in due {
            callback();
        }
        count
    }

    /// Number of callbacks still waiting for their grace period
    pub fn pending_callbacks(&self) -> usize {
        self.deferred.lock().len()
    }

    fn oldest_active_epoch(&self) -> u64 {
        self.cpus
            .iter()
            .filter_map(CpuRecord::active_epoch)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn read_unlock(&self, pcpu: CpuIndex) {
        let previous = self.cpus[pcpu].nesting.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            panic!("rcu: unbalanced read_unlock on CPU {}", pcpu);
        }
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        // No guard can outlive the domain, so everything is due
        let deferred = core::mem::take(self.deferred.get_mut());
        for d in deferred {
            (d.callback)();
        }
    }
}

/// Read-side critical section guard
///
/// Pins the physical CPU it was created on; it cannot be sent to another
/// thread.
pub struct RcuReadGuard<'a> {
    rcu: &'a Rcu,
    pcpu: CpuIndex,
    _not_send: PhantomData<*const ()>,
}

impl RcuReadGuard<'_> {
    /// Physical CPU this critical section runs on
    pub fn pcpu(&self) -> CpuIndex {
        self.pcpu
    }
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.rcu.read_unlock(self.pcpu);
    }
}
