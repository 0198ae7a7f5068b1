//! Virtual interrupt controller
//!
//! A controller owns the shared VIRQ table of one virtual machine and the
//! ordered set of VCPU attachments that shared VIRQs are routed across.

use alloc::sync::Arc;

use crate::sync::{RcuOption, RcuReadGuard, SpinLock};
use crate::vic::route::{AffinityPolicy, RoutePolicy};
use crate::vic::table::{RoutingTable, WeakTable};
use crate::vic::VirqManager;
use crate::vmm::Vcpu;
use crate::{Error, Result};

/// Virtual interrupt controller
pub struct Vic {
    manager: Arc<VirqManager>,
    /// Shared VIRQ table
    pub(crate) shared: RoutingTable,
    /// Attachment index to VCPU
    attachments: WeakTable<Vcpu>,
    /// Serializes attachment changes against bind-time resolution
    attach_lock: SpinLock<()>,
    policy: RcuOption<Arc<dyn RoutePolicy>>,
}

impl Vic {
    /// Create a controller with the default affinity policy
    pub fn new(manager: &Arc<VirqManager>) -> Arc<Self> {
        Self::with_policy(manager, Arc::new(AffinityPolicy))
    }

    /// Create a controller with a custom routing policy
    pub fn with_policy(manager: &Arc<VirqManager>, policy: Arc<dyn RoutePolicy>) -> Arc<Self> {
        let config = manager.config();
        Arc::new(Self {
            manager: manager.clone(),
            shared: RoutingTable::new(config.shared_range()),
            attachments: WeakTable::new(0..config.max_vcpus as u32),
            attach_lock: SpinLock::new(()),
            policy: RcuOption::new(Some(Arc::new(policy))),
        })
    }

    /// Interrupt services this controller belongs to
    pub fn manager(&self) -> &Arc<VirqManager> {
        &self.manager
    }

    /// Number of attachment indices
    pub fn max_vcpus(&self) -> usize {
        self.manager.config().max_vcpus
    }

    /// Replace the routing policy for shared VIRQs
    ///
    /// Assertions already past target selection keep the old decision.
    pub fn set_route_policy(&self, policy: Arc<dyn RoutePolicy>) {
        self.policy.update(Some(Arc::new(policy)), self.manager.rcu());
    }

    pub(crate) fn route_policy<'a>(&'a self, guard: &'a RcuReadGuard<'_>) -> Option<&'a dyn RoutePolicy> {
        self.policy.read_with(guard).map(|policy| &**policy)
    }

    /// Attach `vcpu` at `index`
    pub fn attach_vcpu(self: &Arc<Self>, index: usize, vcpu: &Arc<Vcpu>) -> Result<()> {
        if index >= self.max_vcpus() || !Arc::ptr_eq(vcpu.manager(), &self.manager) {
            return Err(Error::ArgumentInvalid);
        }

        let _guard = self.attach_lock.lock();
        if !vcpu.set_attachment(self, index) {
            log::warn!("vic: VCPU {} already attached", vcpu.id());
            return Err(Error::ObjectConfig);
        }
        if let Err(e) = self.attachments.claim(index as u32, vcpu) {
            vcpu.clear_attachment(self.manager.rcu());
            return Err(e);
        }

        log::debug!("vic: VCPU {} attached at index {}", vcpu.id(), index);
        Ok(())
    }

    /// Detach the VCPU at `index`, returning it if it is still alive
    ///
    /// Shared VIRQs routed to it are re-routed on their next assertion.
    pub fn detach_vcpu(&self, index: usize) -> Option<Arc<Vcpu>> {
        let _guard = self.attach_lock.lock();
        let vcpu = self.attachments.take(index as u32, self.manager.rcu())?;
        vcpu.clear_attachment(self.manager.rcu());
        log::debug!("vic: VCPU {} detached from index {}", vcpu.id(), index);
        Some(vcpu)
    }

    /// VCPU attached at `index`
    pub fn attached_vcpu(&self, index: usize, guard: &RcuReadGuard<'_>) -> Option<Arc<Vcpu>> {
        self.attachments.lookup(index as u32, guard)
    }

    /// Run `f` on the VCPU attached at `index` with attachments frozen
    ///
    /// `f` must not attach or detach VCPUs on this controller.
    pub(crate) fn with_attached<R>(&self, index: usize, f: impl FnOnce(Option<Arc<Vcpu>>) -> R) -> R {
        let _guard = self.attach_lock.lock();
        // SAFETY: releases of attachment slots take `attach_lock`
        let vcpu = unsafe { self.attachments.lookup_unprotected(index as u32) };
        f(vcpu)
    }
}

impl Drop for Vic {
    fn drop(&mut self) {
        for index in 0..self.max_vcpus() {
            // SAFETY: exclusive access during drop
            if let Some(vcpu) = unsafe { self.attachments.lookup_unprotected(index as u32) } {
                vcpu.clear_attachment(self.manager.rcu());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;
    use crate::vic::route::{FixedPolicy, RouteRequest, VcpuMask};
    use test_case::test_case;

    #[test]
    fn test_attach_and_lookup() {
        let fx = Fixture::new(2);
        let guard = fx.manager.rcu().read_lock(0);
        assert_eq!(fx.vic.attached_vcpu(1, &guard).map(|v| v.id()), Some(1));
        assert!(fx.vic.attached_vcpu(2, &guard).is_none());
    }

    #[test_case(8; "index out of range")]
    #[test_case(100; "far out of range")]
    fn test_attach_invalid_index(index: usize) {
        let fx = Fixture::new(0);
        let vcpu = fx.new_vcpu(0);
        assert_eq!(fx.vic.attach_vcpu(index, &vcpu), Err(Error::ArgumentInvalid));
        assert!(vcpu.attachment(&fx.manager.rcu().read_lock(0)).is_none());
    }

    #[test]
    fn test_attach_conflicts() {
        let fx = Fixture::new(1);
        let other = fx.new_vcpu(5);

        // Slot taken
        assert_eq!(fx.vic.attach_vcpu(0, &other), Err(Error::Busy));
        assert!(other.attachment(&fx.manager.rcu().read_lock(0)).is_none());

        // VCPU already attached elsewhere
        assert_eq!(fx.vic.attach_vcpu(3, &fx.vcpus[0]), Err(Error::ObjectConfig));
    }

    #[test]
    fn test_detach_and_reattach() {
        let fx = Fixture::new(2);
        let vcpu = fx.vic.detach_vcpu(0).unwrap();
        assert!(fx.vic.detach_vcpu(0).is_none());
        {
            let guard = fx.manager.rcu().read_lock(0);
            assert!(fx.vic.attached_vcpu(0, &guard).is_none());
        }

        assert_eq!(fx.vic.attach_vcpu(4, &vcpu), Ok(()));
        let guard = fx.manager.rcu().read_lock(0);
        assert_eq!(vcpu.attachment(&guard).map(|(_, i)| i), Some(4));
    }

    #[test]
    fn test_drop_clears_attachment() {
        let fx = Fixture::new(0);
        let vcpu = fx.new_vcpu(0);
        let vic = Vic::new(&fx.manager);
        vic.attach_vcpu(0, &vcpu).unwrap();
        drop(vic);

        assert!(vcpu.attachment(&fx.manager.rcu().read_lock(0)).is_none());
        assert_eq!(fx.vic.attach_vcpu(0, &vcpu), Ok(()));
    }

    #[test]
    fn test_route_policy_replaced() {
        let fx = Fixture::new(2);
        fx.vic.set_route_policy(Arc::new(FixedPolicy(1)));

        let guard = fx.manager.rcu().read_lock(0);
        let request = RouteRequest {
            virq: 70,
            pcpu: 0,
            affinity: VcpuMask::new(),
            previous: None,
        };
        let policy = fx.vic.route_policy(&guard).unwrap();
        assert_eq!(policy.select(&fx.vic, &request, &guard), Some(1));
    }
}
