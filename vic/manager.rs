//! Hypervisor-wide interrupt services
//!
//! One [`VirqManager`] is shared by every controller and VCPU of the
//! hypervisor. It is immutable once built: handlers are registered into a
//! [`TriggerTable`] before construction.

use alloc::sync::Arc;

use crate::config::VicConfig;
use crate::sched::SchedulerBridge;
use crate::sync::Rcu;
use crate::vic::trigger::TriggerTable;
use crate::Result;

/// Interrupt services shared by controllers and VCPUs
pub struct VirqManager {
    config: VicConfig,
    rcu: Rcu,
    scheduler: Arc<dyn SchedulerBridge>,
    triggers: TriggerTable,
}

impl VirqManager {
    /// Create the interrupt services
    pub fn new(
        config: VicConfig,
        scheduler: Arc<dyn SchedulerBridge>,
        triggers: TriggerTable,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        log::info!(
            "vic: private VIRQs {:?}, shared VIRQs {:?}, {} pCPUs",
            config.private_range(),
            config.shared_range(),
            config.max_cpus
        );

        Ok(Arc::new(Self {
            rcu: Rcu::new(config.max_cpus),
            config,
            scheduler,
            triggers,
        }))
    }

    /// Get the configuration
    pub fn config(&self) -> &VicConfig {
        &self.config
    }

    /// Grace-period domain covering all physical CPUs
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Scheduler bridge
    pub fn scheduler(&self) -> &Arc<dyn SchedulerBridge> {
        &self.scheduler
    }

    /// `check_pending` handlers
    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }
}
