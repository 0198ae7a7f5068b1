//! VIRQ sources
//!
//! A source is owned by the object that raises the interrupt, never by the
//! controller. The controller and VCPU tables only hold weak references to
//! the source's shared core, and the core only holds weak references to its
//! target, so neither side extends the other's lifetime.

use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::sync::{Rcu, RcuOption, RcuReadGuard};
use crate::vic::route::VcpuMask;
use crate::vic::{bind, Vic, VirqManager, VirqNumber, VirqTrigger};
use crate::vmm::Vcpu;
use crate::{Error, Result};

const STATE_UNBOUND: u8 = 0;
const STATE_BOUND: u8 = 1;
const STATE_UNBINDING: u8 = 2;
/// Bind in progress; reported as unbound
const STATE_CLAIMING: u8 = 3;
/// Unbind releasing its table slot; reported as unbinding
const STATE_RELEASING: u8 = 4;
/// Waiting out a grace period; reported as unbinding
const STATE_SYNCING: u8 = 5;

/// No shared route selected
pub(crate) const NO_ROUTE: usize = usize::MAX;

const NO_VIRQ: u32 = u32::MAX;

/// Source binding states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// No claim held; the source may be bound
    Unbound,
    /// Claim held; assert and clear are permitted
    Bound,
    /// Claim released but remote delivery may still be in flight
    Unbinding,
}

/// Outcome of trying to start the synchronous part of an unbind
pub(crate) enum SyncClaim {
    /// Nothing to wait for
    Unbound,
    /// Still bound; unbind first
    Bound,
    /// A plain unbind is releasing the slot
    Releasing,
    /// Another caller is waiting out the grace period
    Syncing,
    /// The caller now owns the teardown
    Owned,
}

/// Where a bound source delivers
pub(crate) enum Target {
    /// Routed by the controller's policy at assertion time
    Shared { vic: Weak<Vic> },
    /// Fixed VCPU
    Private { vcpu: Weak<Vcpu> },
}

/// Everything recorded by a successful bind
pub(crate) struct Binding {
    pub virq: VirqNumber,
    pub trigger: VirqTrigger,
    pub target: Target,
}

/// Shared part of a VIRQ source, referenced by the routing tables
pub struct SourceCore {
    /// Object that raises this interrupt
    owner: Weak<dyn Any + Send + Sync>,
    /// Interrupt services of the first bind, `Arc::into_raw`; set once
    manager: AtomicPtr<VirqManager>,
    state: AtomicU8,
    pending: AtomicBool,
    /// Routing affinity, [`VcpuMask`] bits
    affinity: AtomicU64,
    /// Attachment index the shared VIRQ is currently routed to
    route: AtomicUsize,
    virq: AtomicU32,
    trigger: AtomicU16,
    /// Changes only while claiming or syncing
    binding: RcuOption<Binding>,
}

impl SourceCore {
    fn new(owner: Weak<dyn Any + Send + Sync>) -> Self {
        Self {
            owner,
            manager: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(STATE_UNBOUND),
            pending: AtomicBool::new(false),
            affinity: AtomicU64::new(0),
            route: AtomicUsize::new(NO_ROUTE),
            virq: AtomicU32::new(NO_VIRQ),
            trigger: AtomicU16::new(0),
            binding: RcuOption::new_none(),
        }
    }

    /// Create a source core with no owner
    pub fn detached() -> Self {
        let owner: Weak<dyn Any + Send + Sync> = Weak::<()>::new();
        Self::new(owner)
    }

    /// Get the binding state
    pub fn state(&self) -> SourceState {
        match self.state.load(Ordering::SeqCst) {
            STATE_BOUND => SourceState::Bound,
            STATE_UNBINDING | STATE_RELEASING | STATE_SYNCING => SourceState::Unbinding,
            _ => SourceState::Unbound,
        }
    }

    /// Check if the source holds a claim
    pub fn is_bound(&self) -> bool {
        self.state() == SourceState::Bound
    }

    /// VIRQ number of the current binding, kept until the source is reusable
    pub fn virq(&self) -> Option<VirqNumber> {
        match self.virq.load(Ordering::Acquire) {
            NO_VIRQ => None,
            virq => Some(virq),
        }
    }

    /// Trigger kind of the current binding
    pub fn trigger(&self) -> Option<VirqTrigger> {
        self.virq()?;
        Some(VirqTrigger::new(self.trigger.load(Ordering::Acquire)))
    }

    /// Check if the source is asserted
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Set the routing affinity for shared delivery
    pub fn set_affinity(&self, mask: VcpuMask) {
        self.affinity.store(mask.bits(), Ordering::Relaxed);
    }

    /// Get the routing affinity
    pub fn affinity(&self) -> VcpuMask {
        VcpuMask::from_bits(self.affinity.load(Ordering::Relaxed))
    }

    /// Attachment index the shared VIRQ was last routed to
    pub fn route(&self) -> Option<usize> {
        match self.route.load(Ordering::SeqCst) {
            NO_ROUTE => None,
            index => Some(index),
        }
    }

    /// Get the owning object, if it is still alive and of type `T`
    pub fn owner<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.owner.upgrade()?.downcast::<T>().ok()
    }

    /// Interrupt services this source has been bound through
    pub(crate) fn manager(&self) -> Option<&VirqManager> {
        let raw = self.manager.load(Ordering::Acquire);
        // SAFETY: set once from `Arc::into_raw` and released only on drop
        unsafe { raw.as_ref() }
    }

    /// Tie the source to `manager`
    ///
    /// A source serves one set of interrupt services for its whole life.
    /// Called while claiming.
    pub(crate) fn adopt_manager(&self, manager: &Arc<VirqManager>) -> Result<()> {
        match self.manager() {
            Some(current) if ptr::eq(current, Arc::as_ptr(manager)) => Ok(()),
            Some(_) => {
                log::warn!("vic: source rebound across interrupt managers");
                Err(Error::ArgumentInvalid)
            }
            None => {
                let raw = Arc::into_raw(manager.clone()) as *mut VirqManager;
                self.manager.store(raw, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Binding visible to a read-side critical section
    pub(crate) fn binding<'a>(&'a self, guard: &'a RcuReadGuard<'_>) -> Option<&'a Binding> {
        self.binding.read_with(guard)
    }

    /// Binding seen by the unbinding side
    ///
    /// # Safety
    ///
    /// The source must be releasing, or syncing on behalf of the caller.
    pub(crate) unsafe fn binding_unprotected(&self) -> Option<Arc<Binding>> {
        self.binding.get_unprotected()
    }

    /// Start a bind; fails unless the source is unbound
    pub(crate) fn begin_claim(&self) -> bool {
        self.state
            .compare_exchange(STATE_UNBOUND, STATE_CLAIMING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Finish a bind started with [`SourceCore::begin_claim`]
    ///
    /// On success the binding is published before the bound state.
    pub(crate) fn finish_claim(&self, binding: Option<Binding>) {
        match binding {
            Some(binding) => {
                self.virq.store(binding.virq, Ordering::Release);
                self.trigger.store(binding.trigger.raw(), Ordering::Release);
                if self.binding.publish(Arc::new(binding)).is_err() {
                    panic!("vic: binding published on a source that was never reset");
                }
                self.state.store(STATE_BOUND, Ordering::SeqCst);
            }
            None => self.state.store(STATE_UNBOUND, Ordering::SeqCst),
        }
    }

    /// Move a bound source to releasing; false if it was not bound
    pub(crate) fn begin_unbind(&self) -> bool {
        self.state
            .compare_exchange(STATE_BOUND, STATE_RELEASING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Finish a plain unbind once the slot is released
    pub(crate) fn finish_unbind(&self) {
        self.pending.store(false, Ordering::SeqCst);
        self.state.store(STATE_UNBINDING, Ordering::SeqCst);
    }

    /// Try to take ownership of the synchronous teardown
    pub(crate) fn begin_sync(&self) -> SyncClaim {
        match self.state.compare_exchange(
            STATE_UNBINDING,
            STATE_SYNCING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => SyncClaim::Owned,
            Err(STATE_BOUND) => SyncClaim::Bound,
            Err(STATE_RELEASING) => SyncClaim::Releasing,
            Err(STATE_SYNCING) => SyncClaim::Syncing,
            Err(_) => SyncClaim::Unbound,
        }
    }

    /// Wait for another caller's teardown to finish
    pub(crate) fn wait_sync(&self) {
        while self.state.load(Ordering::SeqCst) == STATE_SYNCING {
            core::hint::spin_loop();
        }
    }

    /// Make the source reusable once no delivery can be in flight
    pub(crate) fn finish_sync(&self, rcu: &Rcu) {
        self.binding.update(None, rcu);
        self.pending.store(false, Ordering::SeqCst);
        self.route.store(NO_ROUTE, Ordering::SeqCst);
        self.virq.store(NO_VIRQ, Ordering::Release);
        self.state.store(STATE_UNBOUND, Ordering::SeqCst);
    }

    pub(crate) fn pending_flag(&self) -> &AtomicBool {
        &self.pending
    }

    pub(crate) fn route_slot(&self) -> &AtomicUsize {
        &self.route
    }
}

impl Drop for SourceCore {
    fn drop(&mut self) {
        let raw = *self.manager.get_mut();
        if !raw.is_null() {
            // SAFETY: taken from `Arc::into_raw` in `adopt_manager`
            drop(unsafe { Arc::from_raw(raw as *const VirqManager) });
        }
    }
}

impl core::fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SourceCore")
            .field("state", &self.state())
            .field("virq", &self.virq())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Caller-owned VIRQ source handle
///
/// Dropping a bound source unbinds it. The caller must still let a grace
/// period elapse before tearing down anything the source's owner shares
/// with a `check_pending` handler, or use [`bind::unbind_sync`] first.
pub struct VirqSource {
    core: Arc<SourceCore>,
}

impl VirqSource {
    /// Create an unbound source owned by `owner`
    pub fn new(owner: Weak<dyn Any + Send + Sync>) -> Self {
        Self {
            core: Arc::new(SourceCore::new(owner)),
        }
    }

    /// Create an unbound source with no owner
    pub fn detached() -> Self {
        Self {
            core: Arc::new(SourceCore::detached()),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SourceCore> {
        &self.core
    }
}

impl Deref for VirqSource {
    type Target = SourceCore;

    fn deref(&self) -> &SourceCore {
        &self.core
    }
}

impl Drop for VirqSource {
    fn drop(&mut self) {
        bind::unbind(self);
    }
}

impl core::fmt::Debug for VirqSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.core.fmt(f)
    }
}
