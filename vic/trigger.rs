//! Trigger kinds and the `check_pending` registration table
//!
//! A source records its trigger kind at bind time. When the target VCPU
//! samples its interrupts, the handler registered for that kind re-validates
//! whether the source is still asserted. Kinds without a handler behave as
//! edge-triggered: the pending flag is consumed on delivery.

use alloc::sync::Arc;

use heapless::FnvIndexMap;

use crate::vic::SourceCore;
use crate::{Error, Result};

/// Maximum number of registered `check_pending` handlers
pub const MAX_TRIGGER_HANDLERS: usize = 16;

/// Caller-defined trigger kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirqTrigger(u16);

impl VirqTrigger {
    /// Edge-sensitive: pending is consumed by delivery
    pub const EDGE: Self = Self(0);
    /// Level-sensitive: pending until the source deasserts
    pub const LEVEL: Self = Self(1);

    /// Create a trigger kind from its raw tag
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw tag
    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// Resample handler for one trigger kind
pub trait CheckPending: Send + Sync {
    /// Report whether `source` is still asserted
    fn check_pending(&self, source: &SourceCore) -> bool;
}

impl<F> CheckPending for F
where
    F: Fn(&SourceCore) -> bool + Send + Sync,
{
    fn check_pending(&self, source: &SourceCore) -> bool {
        self(source)
    }
}

/// Trigger kind to handler map
pub struct TriggerTable {
    handlers: FnvIndexMap<VirqTrigger, Arc<dyn CheckPending>, MAX_TRIGGER_HANDLERS>,
}

impl TriggerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            handlers: FnvIndexMap::new(),
        }
    }

    /// Register `handler` for `trigger`
    pub fn register(&mut self, trigger: VirqTrigger, handler: Arc<dyn CheckPending>) -> Result<()> {
        if self.handlers.contains_key(&trigger) {
            return Err(Error::Busy);
        }
        self.handlers
            .insert(trigger, handler)
            .map_err(|_| Error::ResourceFull)?;
        log::debug!("vic: check_pending handler registered for trigger {}", trigger.raw());
        Ok(())
    }

    /// Remove the handler for `trigger`
    pub fn unregister(&mut self, trigger: VirqTrigger) -> Result<()> {
        self.handlers
            .remove(&trigger)
            .map(|_| ())
            .ok_or(Error::NoHandler)
    }

    /// Check if a handler is registered for `trigger`
    pub fn is_registered(&self, trigger: VirqTrigger) -> bool {
        self.handlers.contains_key(&trigger)
    }

    /// Fire the `check_pending` event for `source`
    pub fn dispatch(&self, trigger: VirqTrigger, source: &SourceCore) -> Result<bool> {
        let handler = self.handlers.get(&trigger).ok_or(Error::NoHandler)?;
        Ok(handler.check_pending(source))
    }
}

impl Default for TriggerTable {
    fn default() -> Self {
        Self::new()
    }
}
