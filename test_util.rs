//! Shared test fixtures

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::VicConfig;
use crate::sched::SimpleScheduler;
use crate::vic::{SourceCore, TriggerTable, Vic, VirqManager, VirqTrigger};
use crate::vmm::{Vcpu, VcpuId};

/// One controller with `n` VCPUs attached at indices `0..n`
///
/// VCPU ids match their attachment index. Every VCPU starts runnable and
/// no physical CPU has a current VCPU.
pub(crate) struct Fixture {
    pub manager: Arc<VirqManager>,
    pub sched: Arc<SimpleScheduler>,
    pub vic: Arc<Vic>,
    pub vcpus: Vec<Arc<Vcpu>>,
}

impl Fixture {
    pub fn new(vcpus: usize) -> Self {
        Self::build(VicConfig::default(), TriggerTable::new(), vcpus)
    }

    pub fn with_config(config: VicConfig, vcpus: usize) -> Self {
        Self::build(config, TriggerTable::new(), vcpus)
    }

    pub fn with_trigger<F>(vcpus: usize, trigger: VirqTrigger, handler: F) -> Self
    where
        F: Fn(&SourceCore) -> bool + Send + Sync + 'static,
    {
        let mut triggers = TriggerTable::new();
        triggers.register(trigger, Arc::new(handler)).unwrap();
        Self::build(VicConfig::default(), triggers, vcpus)
    }

    fn build(config: VicConfig, triggers: TriggerTable, vcpus: usize) -> Self {
        let sched = Arc::new(SimpleScheduler::new(config.max_cpus));
        let manager = VirqManager::new(config, sched.clone(), triggers).unwrap();
        let vic = Vic::new(&manager);
        let vcpus = (0..vcpus)
            .map(|i| {
                let vcpu = Vcpu::new(&manager, i as VcpuId);
                vic.attach_vcpu(i, &vcpu).unwrap();
                vcpu
            })
            .collect();

        Self {
            manager,
            sched,
            vic,
            vcpus,
        }
    }

    /// Create a VCPU that is not attached anywhere
    pub fn new_vcpu(&self, id: VcpuId) -> Arc<Vcpu> {
        Vcpu::new(&self.manager, id)
    }
}
