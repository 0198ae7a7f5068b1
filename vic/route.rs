//! Shared VIRQ routing policy
//!
//! When a shared VIRQ is asserted, a [`RoutePolicy`] picks the attachment
//! index of the VCPU that will receive it. The choice is not observable by
//! the guest beyond "some attached VCPU gets the interrupt", so policies
//! are free to trade stickiness against latency.

use crate::sync::RcuReadGuard;
use crate::vic::{Vic, VirqNumber};
use crate::CpuIndex;

/// Attachment index mask for routing affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VcpuMask {
    bits: u64,
}

impl VcpuMask {
    /// Create an empty mask
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Create a mask from a bit pattern
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Create a mask for a single attachment index
    pub fn from_index(index: usize) -> Self {
        let mut mask = Self::new();
        mask.set(index);
        mask
    }

    /// Get the underlying bits
    pub const fn bits(&self) -> u64 {
        self.bits
    }

    /// Check if an index is set in the mask
    pub fn contains(&self, index: usize) -> bool {
        index < 64 && (self.bits & (1u64 << index)) != 0
    }

    /// Set an index in the mask
    pub fn set(&mut self, index: usize) {
        if index < 64 {
            self.bits |= 1u64 << index;
        }
    }

    /// Clear an index in the mask
    pub fn clear(&mut self, index: usize) {
        if index < 64 {
            self.bits &= !(1u64 << index);
        }
    }

    /// Check if the mask is empty
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Count the number of indices in the mask
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Iterate over indices in the mask
    pub fn iter(&self) -> VcpuMaskIter {
        VcpuMaskIter { bits: self.bits }
    }
}

/// Iterator over indices in a [`VcpuMask`]
pub struct VcpuMaskIter {
    bits: u64,
}

impl Iterator for VcpuMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bits == 0 {
            None
        } else {
            let index = self.bits.trailing_zeros() as usize;
            self.bits &= self.bits - 1; // Clear the lowest set bit
            Some(index)
        }
    }
}

/// Inputs to a routing decision
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest {
    /// VIRQ being asserted
    pub virq: VirqNumber,
    /// Physical CPU the assertion runs on
    pub pcpu: CpuIndex,
    /// Source's affinity hint; empty means any attachment
    pub affinity: VcpuMask,
    /// Attachment index that received this VIRQ last time
    pub previous: Option<usize>,
}

/// Target selection strategy for shared VIRQs
pub trait RoutePolicy: Send + Sync {
    /// Pick the attachment index to deliver to, or `None` if no attached
    /// VCPU can take the interrupt
    fn select(&self, vic: &Vic, request: &RouteRequest, guard: &RcuReadGuard<'_>) -> Option<usize>;
}

/// Affinity-driven policy
///
/// Among the attached VCPUs inside the affinity mask, prefer the previous
/// target if it can run, then the VCPU the asserting CPU is hosting, then
/// the first runnable one, then the first attached one.
#[derive(Debug, Default)]
pub struct AffinityPolicy;

impl AffinityPolicy {
    fn candidates(vic: &Vic, request: &RouteRequest) -> impl Iterator<Item = usize> {
        let affinity = request.affinity;
        (0..vic.max_vcpus()).filter(move |&i| affinity.is_empty() || affinity.contains(i))
    }
}

impl RoutePolicy for AffinityPolicy {
    fn select(&self, vic: &Vic, request: &RouteRequest, guard: &RcuReadGuard<'_>) -> Option<usize> {
        let eligible = |index: usize| request.affinity.is_empty() || request.affinity.contains(index);

        if let Some(previous) = request.previous.filter(|&i| eligible(i)) {
            if vic.attached_vcpu(previous, guard).map_or(false, |v| v.is_runnable()) {
                return Some(previous);
            }
        }

        if let Some(local) = vic.manager().scheduler().resolve_target_vcpu(request.pcpu) {
            if let Some(index) = local.attached_index(vic, guard).filter(|&i| eligible(i)) {
                return Some(index);
            }
        }

        let mut first_attached = None;
        for index in Self::candidates(vic, request) {
            if let Some(vcpu) = vic.attached_vcpu(index, guard) {
                if vcpu.is_runnable() {
                    return Some(index);
                }
                first_attached.get_or_insert(index);
            }
        }
        first_attached
    }
}

/// Always route to one attachment index
#[derive(Debug)]
pub struct FixedPolicy(pub usize);

impl RoutePolicy for FixedPolicy {
    fn select(&self, vic: &Vic, _request: &RouteRequest, guard: &RcuReadGuard<'_>) -> Option<usize> {
        vic.attached_vcpu(self.0, guard).map(|_| self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;
    use test_case::test_case;

    fn request(affinity: VcpuMask, previous: Option<usize>) -> RouteRequest {
        RouteRequest {
            virq: 70,
            pcpu: 0,
            affinity,
            previous,
        }
    }

    #[test]
    fn test_mask_ops() {
        let mut mask = VcpuMask::from_index(3);
        mask.set(5);
        mask.set(64);
        assert_eq!(mask.count(), 2);
        assert!(mask.contains(3));
        assert!(!mask.contains(64));
        mask.clear(3);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![5]);
        assert!(VcpuMask::new().is_empty());
    }

    #[test_case(VcpuMask::new(), None, Some(0); "any vcpu")]
    #[test_case(VcpuMask::from_bits(0b110), None, Some(1); "first in affinity")]
    #[test_case(VcpuMask::new(), Some(2), Some(2); "sticky previous target")]
    #[test_case(VcpuMask::from_index(1), Some(2), Some(1); "previous outside affinity")]
    #[test_case(VcpuMask::from_index(6), None, None; "affinity has no attachment")]
    fn test_affinity_policy(affinity: VcpuMask, previous: Option<usize>, expected: Option<usize>) {
        let fx = Fixture::new(3);
        let guard = fx.manager.rcu().read_lock(0);
        assert_eq!(AffinityPolicy.select(&fx.vic, &request(affinity, previous), &guard), expected);
    }

    #[test]
    fn test_affinity_prefers_local_then_runnable() {
        let fx = Fixture::new(3);
        fx.sched.set_current(0, Some(&fx.vcpus[2]));
        {
            let guard = fx.manager.rcu().read_lock(0);
            assert_eq!(AffinityPolicy.select(&fx.vic, &request(VcpuMask::new(), None), &guard), Some(2));
        }

        fx.sched.set_current(0, None);
        fx.vcpus[0].set_blocked();
        fx.vcpus[2].set_blocked();
        let guard = fx.manager.rcu().read_lock(0);
        // Blocked previous target loses to a runnable one
        assert_eq!(AffinityPolicy.select(&fx.vic, &request(VcpuMask::new(), Some(2)), &guard), Some(1));

        fx.vcpus[1].set_blocked();
        assert_eq!(AffinityPolicy.select(&fx.vic, &request(VcpuMask::new(), None), &guard), Some(0));
    }

    #[test]
    fn test_fixed_policy() {
        let fx = Fixture::new(2);
        let guard = fx.manager.rcu().read_lock(0);
        let req = request(VcpuMask::new(), None);
        assert_eq!(FixedPolicy(1).select(&fx.vic, &req, &guard), Some(1));
        assert_eq!(FixedPolicy(5).select(&fx.vic, &req, &guard), None);
    }
}
