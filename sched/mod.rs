//! Scheduler bridge
//!
//! The interrupt subsystem does not own the VCPU run queues. It only needs
//! to know which VCPU a physical CPU is currently hosting and to kick a VCPU
//! when an interrupt becomes pending for it.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::sync::SpinLock;
use crate::vmm::{Vcpu, VcpuId, VcpuRunState};
use crate::CpuIndex;

/// Scheduler services consumed by routing and cross-CPU cancellation
///
/// Both methods are called from `assert`, which may run in interrupt
/// context on the asserting CPU.
pub trait SchedulerBridge: Send + Sync {
    /// Primary VCPU currently hosted by `pcpu`, if any
    fn resolve_target_vcpu(&self, pcpu: CpuIndex) -> Option<Arc<Vcpu>>;

    /// Wake `vcpu`, or kick it back into the hypervisor if it is running
    fn wake(&self, vcpu: &Arc<Vcpu>);
}

/// Minimal scheduler bridge
///
/// Tracks one primary VCPU per physical CPU and counts wakeups. A wakeup
/// makes a blocked VCPU runnable; a running VCPU is left on its CPU.
/// State sits behind spinlocks, so it must not be driven from an interrupt
/// that can preempt one of its own calls.
pub struct SimpleScheduler {
    /// Primary VCPU for each physical CPU
    current: SpinLock<Vec<Option<Weak<Vcpu>>>>,
    /// Wakeups per VCPU
    wakes: SpinLock<BTreeMap<VcpuId, usize>>,
}

impl SimpleScheduler {
    /// Create a new scheduler bridge for `max_cpus` physical CPUs
    pub fn new(max_cpus: usize) -> Self {
        Self {
            current: SpinLock::new((0..max_cpus).map(|_| None).collect()),
            wakes: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Load `vcpu` on `pcpu`, or leave `pcpu` idle
    ///
    /// The VCPU previously loaded on `pcpu` goes back to runnable.
    pub fn set_current(&self, pcpu: CpuIndex, vcpu: Option<&Arc<Vcpu>>) {
        let previous = {
            let mut current = self.current.lock();
            let Some(slot) = current.get_mut(pcpu) else {
                log::warn!("sched: pCPU {} out of range", pcpu);
                return;
            };
            core::mem::replace(slot, vcpu.map(Arc::downgrade))
        };

        if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
            if previous.run_state() == VcpuRunState::Running(pcpu) {
                previous.set_runnable();
            }
        }
        if let Some(vcpu) = vcpu {
            vcpu.set_running(pcpu);
            log::debug!("sched: VCPU {} loaded on pCPU {}", vcpu.id(), pcpu);
        }
    }

    /// Number of wakeups delivered to `id`
    pub fn wake_count(&self, id: VcpuId) -> usize {
        self.wakes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of wakeups delivered to all VCPUs
    pub fn total_wakes(&self) -> usize {
        self.wakes.lock().values().sum()
    }
}

impl SchedulerBridge for SimpleScheduler {
    fn resolve_target_vcpu(&self, pcpu: CpuIndex) -> Option<Arc<Vcpu>> {
        self.current
            .lock()
            .get(pcpu)
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade)
    }

    fn wake(&self, vcpu: &Arc<Vcpu>) {
        *self.wakes.lock().entry(vcpu.id()).or_insert(0) += 1;

        match vcpu.run_state() {
            VcpuRunState::Blocked => vcpu.set_runnable(),
            VcpuRunState::Running(pcpu) => {
                log::trace!("sched: kick VCPU {} on pCPU {}", vcpu.id(), pcpu)
            }
            VcpuRunState::Runnable => {}
        }
    }
}
