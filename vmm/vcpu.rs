//! Virtual CPU (VCPU) interrupt state
//!
//! A VCPU owns its private VIRQ table and two bitmaps of VIRQ numbers that
//! may be pending for it, one per table. Bits are hints only: the authoritative
//! pending state lives in the bound source, and stale hints are dropped when
//! the VCPU samples its interrupts.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MAX_VIRQS;
use crate::emulator::vetm::TraceContext;
use crate::sync::{Rcu, RcuOption, RcuReadGuard};
use crate::utils::AtomicBitmap;
use crate::vic::pending::{self, VirqVec};
use crate::vic::table::RoutingTable;
use crate::vic::{Vic, VirqManager};
use crate::vmm::VcpuId;
use crate::{CpuIndex, Result};

const STATE_BLOCKED: usize = 0;
const STATE_RUNNABLE: usize = 1;
const STATE_RUNNING_BASE: usize = 2;

/// VCPU run states as seen by interrupt routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRunState {
    /// Waiting for an event
    Blocked,
    /// Ready but not loaded on any CPU
    Runnable,
    /// Loaded on the given physical CPU
    Running(CpuIndex),
}

impl VcpuRunState {
    fn encode(self) -> usize {
        match self {
            VcpuRunState::Blocked => STATE_BLOCKED,
            VcpuRunState::Runnable => STATE_RUNNABLE,
            VcpuRunState::Running(pcpu) => STATE_RUNNING_BASE + pcpu,
        }
    }

    fn decode(raw: usize) -> Self {
        match raw {
            STATE_BLOCKED => VcpuRunState::Blocked,
            STATE_RUNNABLE => VcpuRunState::Runnable,
            n => VcpuRunState::Running(n - STATE_RUNNING_BASE),
        }
    }
}

/// Controller attachment of a VCPU
struct Attachment {
    vic: Weak<Vic>,
    index: usize,
}

/// VCPU structure
pub struct Vcpu {
    /// VCPU ID
    id: VcpuId,
    /// Hypervisor-wide interrupt services
    manager: Arc<VirqManager>,
    /// Encoded [`VcpuRunState`]
    run_state: AtomicUsize,
    /// Private VIRQ table
    pub(crate) private: RoutingTable,
    /// Private VIRQ numbers that may be pending
    pub(crate) private_hints: AtomicBitmap,
    /// Shared VIRQ numbers that may be pending
    pub(crate) shared_hints: AtomicBitmap,
    /// Published under the controller's attach lock
    attachment: RcuOption<Attachment>,
    /// Trace unit state saved for this VCPU
    trace: TraceContext,
}

impl Vcpu {
    /// Create a new VCPU
    pub fn new(manager: &Arc<VirqManager>, id: VcpuId) -> Arc<Self> {
        Arc::new(Self {
            id,
            manager: manager.clone(),
            run_state: AtomicUsize::new(STATE_RUNNABLE),
            private: RoutingTable::new(manager.config().private_range()),
            private_hints: AtomicBitmap::new(MAX_VIRQS as usize),
            shared_hints: AtomicBitmap::new(MAX_VIRQS as usize),
            attachment: RcuOption::new_none(),
            trace: TraceContext::new(),
        })
    }

    /// Get VCPU ID
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Interrupt services this VCPU belongs to
    pub fn manager(&self) -> &Arc<VirqManager> {
        &self.manager
    }

    /// Get the current run state
    pub fn run_state(&self) -> VcpuRunState {
        VcpuRunState::decode(self.run_state.load(Ordering::Acquire))
    }

    /// Mark the VCPU as loaded on `pcpu`
    pub fn set_running(&self, pcpu: CpuIndex) {
        self.run_state
            .store(VcpuRunState::Running(pcpu).encode(), Ordering::Release);
    }

    /// Mark the VCPU as runnable
    pub fn set_runnable(&self) {
        self.run_state.store(STATE_RUNNABLE, Ordering::Release);
    }

    /// Mark the VCPU as blocked
    pub fn set_blocked(&self) {
        self.run_state.store(STATE_BLOCKED, Ordering::Release);
    }

    /// Check if the VCPU can run (runnable or running)
    pub fn is_runnable(&self) -> bool {
        self.run_state() != VcpuRunState::Blocked
    }

    /// Physical CPU this VCPU is loaded on
    pub fn running_on(&self) -> Option<CpuIndex> {
        match self.run_state() {
            VcpuRunState::Running(pcpu) => Some(pcpu),
            _ => None,
        }
    }

    /// Check if any VIRQ may be pending
    ///
    /// May report stale hints; [`Vcpu::take_pending`] is authoritative.
    pub fn has_pending(&self) -> bool {
        self.private_hints.any() || self.shared_hints.any()
    }

    /// Collect the VIRQs to inject into this VCPU
    ///
    /// Must be called on `pcpu`. Fails with `ArgumentInvalid` if `pcpu` is
    /// not a known CPU.
    pub fn take_pending(self: &Arc<Self>, pcpu: CpuIndex) -> Result<VirqVec> {
        pending::sample_pending(self, pcpu)
    }

    /// Controller this VCPU is attached to, with its attachment index
    pub fn attachment(&self, guard: &RcuReadGuard<'_>) -> Option<(Arc<Vic>, usize)> {
        let attachment = self.attachment.read_with(guard)?;
        Some((attachment.vic.upgrade()?, attachment.index))
    }

    /// Attachment index of this VCPU on `vic`
    pub(crate) fn attached_index(&self, vic: &Vic, guard: &RcuReadGuard<'_>) -> Option<usize> {
        self.attachment
            .read_with(guard)
            .filter(|a| core::ptr::eq(a.vic.as_ptr(), vic))
            .map(|a| a.index)
    }

    /// Record an attachment; fails if one is already present
    pub(crate) fn set_attachment(&self, vic: &Arc<Vic>, index: usize) -> bool {
        let attachment = Arc::new(Attachment {
            vic: Arc::downgrade(vic),
            index,
        });
        self.attachment.publish(attachment).is_ok()
    }

    pub(crate) fn clear_attachment(&self, rcu: &Rcu) {
        self.attachment.update(None, rcu);
    }

    /// Trace unit state saved for this VCPU
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("run_state", &self.run_state())
            .finish()
    }
}
