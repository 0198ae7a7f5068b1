//! Virtual ETM (Embedded Trace Macrocell) trap device
//!
//! Each physical CPU has its own trace unit, mapped into the primary VM at
//! `etm_base + pcpu * etm_stride`. Guest accesses trap to EL2 and are
//! forwarded to the hardware unit of the executing CPU, with two
//! restrictions: only the primary VCPU of a CPU may touch that CPU's block,
//! and writes to the ViewInst control register cannot enable tracing of the
//! hypervisor or of the secure world.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::config::VicConfig;
use crate::sched::SchedulerBridge;
use crate::sync::SpinLock;
use crate::vic::VirqManager;
use crate::vmm::Vcpu;
use crate::CpuIndex;

/// Programming control register offset
pub const TRCPRGCTLR: usize = 0x004;

/// ViewInst main control register offset
pub const TRCVICTLR: usize = 0x080;

register_bitfields! [
    u32,
    /// Programming control register
    pub TRCPRGCTLR_REG [
        /// Trace unit enable
        EN OFFSET(0) NUMBITS(1) []
    ],
    /// ViewInst main control register
    pub TRCVICTLR_REG [
        /// Resource selector for the ViewInst event
        EVENT OFFSET(0) NUMBITS(8) [],
        /// Start/stop logic state
        SSSTATUS OFFSET(9) NUMBITS(1) [],
        /// Trace reset events
        TRCRESET OFFSET(10) NUMBITS(1) [],
        /// Trace system errors
        TRCERR OFFSET(11) NUMBITS(1) [],
        /// Secure exception levels excluded from tracing
        EXLEVEL_S OFFSET(16) NUMBITS(4) [],
        /// Non-secure exception levels excluded from tracing
        EXLEVEL_NS OFFSET(20) NUMBITS(4) []
    ]
];

bitflags! {
    /// Exception level bits of the EXLEVEL fields
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExLevels: u32 {
        const EL0 = 1 << 0;
        const EL1 = 1 << 1;
        const EL2 = 1 << 2;
        const EL3 = 1 << 3;
    }
}

type Trcvictlr = LocalRegisterCopy<u32, TRCVICTLR_REG::Register>;

/// Reset value of TRCVICTLR
pub const TRCVICTLR_DEFAULT: u32 = 0;

/// Strip hypervisor and secure world tracing from a guest TRCVICTLR value
pub fn protect_trcvictlr(raw: u32) -> u32 {
    let mut reg = Trcvictlr::new(raw);

    let exlevel_ns = ExLevels::from_bits_truncate(reg.read(TRCVICTLR_REG::EXLEVEL_NS));
    if exlevel_ns.contains(ExLevels::EL2) {
        reg.modify(TRCVICTLR_REG::EXLEVEL_NS.val((exlevel_ns - ExLevels::EL2).bits()));
    }
    reg.modify(TRCVICTLR_REG::EXLEVEL_S.val(ExLevels::all().bits()));

    reg.get()
}

/// Per-CPU trace unit register access
pub trait EtmBackend: Send + Sync {
    /// Read `width` bytes at `offset` of `pcpu`'s trace unit
    fn read_reg(&self, pcpu: CpuIndex, offset: usize, width: usize) -> u64;

    /// Write `width` bytes at `offset` of `pcpu`'s trace unit
    fn write_reg(&self, pcpu: CpuIndex, offset: usize, value: u64, width: usize);
}

/// In-memory trace unit registers
#[derive(Default)]
pub struct ShadowEtm {
    regs: SpinLock<BTreeMap<(CpuIndex, usize), u64>>,
}

impl ShadowEtm {
    /// Create zeroed shadow registers
    pub fn new() -> Self {
        Self::default()
    }
}

fn width_mask(width: usize) -> u64 {
    match width {
        8 => u64::MAX,
        w => (1u64 << (w * 8)) - 1,
    }
}

impl EtmBackend for ShadowEtm {
    fn read_reg(&self, pcpu: CpuIndex, offset: usize, width: usize) -> u64 {
        self.regs.lock().get(&(pcpu, offset)).copied().unwrap_or(0) & width_mask(width)
    }

    fn write_reg(&self, pcpu: CpuIndex, offset: usize, value: u64, width: usize) {
        self.regs.lock().insert((pcpu, offset), value & width_mask(width));
    }
}

/// Trace state saved in each VCPU
#[derive(Debug)]
pub struct TraceContext {
    enabled: AtomicBool,
    trcvictlr: AtomicU32,
}

impl TraceContext {
    /// Create a context with tracing disabled
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            trcvictlr: AtomicU32::new(TRCVICTLR_DEFAULT),
        }
    }

    /// Check if the guest enabled its trace unit
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Sanitised TRCVICTLR last written by the guest
    pub fn trcvictlr(&self) -> u32 {
        self.trcvictlr.load(Ordering::Relaxed)
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual trace unit device
pub struct VirtualEtm {
    base: u64,
    stride: u64,
    size_percpu: u64,
    /// End of the last per-CPU window
    end: u64,
    scheduler: Arc<dyn SchedulerBridge>,
    backend: Arc<dyn EtmBackend>,
}

impl VirtualEtm {
    /// Create the device for the CPUs described by `manager`'s configuration
    pub fn new(manager: &VirqManager, backend: Arc<dyn EtmBackend>) -> Self {
        let config: &VicConfig = manager.config();

        Self {
            base: config.etm_base,
            stride: config.etm_stride,
            size_percpu: config.etm_size_percpu,
            // Validated configurations never overflow; anything else traps nothing
            end: config.etm_end().unwrap_or(config.etm_base),
            scheduler: manager.scheduler().clone(),
            backend,
        }
    }

    fn is_primary(&self, vcpu: &Arc<Vcpu>, pcpu: CpuIndex) -> bool {
        self.scheduler
            .resolve_target_vcpu(pcpu)
            .map_or(false, |primary| Arc::ptr_eq(&primary, vcpu))
    }

    fn access_allowed(&self, size: usize, offset: u64) -> bool {
        let size = size as u64;
        (size == 4 || size == 8)
            && offset % size == 0
            && self.size_percpu.checked_sub(size).map_or(false, |last| offset <= last)
    }

    /// Offset inside `pcpu`'s register window, if `ipa` falls inside it
    fn window_offset(&self, ipa: u64, pcpu: CpuIndex) -> Option<u64> {
        if !(self.base..self.end).contains(&ipa) {
            return None;
        }

        let base_offset = ipa - self.base;
        if base_offset / self.stride != pcpu as u64 {
            return None;
        }
        Some(base_offset - pcpu as u64 * self.stride)
    }

    /// Emulate a trapped access by `vcpu` running on `pcpu`
    ///
    /// Returns false if the access is rejected and must be left to the
    /// generic fault path.
    pub fn handle_access(
        &self,
        vcpu: &Arc<Vcpu>,
        pcpu: CpuIndex,
        ipa: u64,
        size: usize,
        value: &mut u64,
        is_write: bool,
    ) -> bool {
        if !self.is_primary(vcpu, pcpu) {
            log::debug!("vetm: VCPU {} is not primary on pCPU {}", vcpu.id(), pcpu);
            return false;
        }

        let offset = match self.window_offset(ipa, pcpu) {
            Some(offset) if self.access_allowed(size, offset) => offset as usize,
            _ => {
                log::debug!("vetm: rejected {}-byte access at {:#x} from pCPU {}", size, ipa, pcpu);
                return false;
            }
        };

        if is_write {
            self.write(vcpu, pcpu, offset, *value, size);
        } else {
            *value = self.backend.read_reg(pcpu, offset, size);
        }
        true
    }

    fn write(&self, vcpu: &Vcpu, pcpu: CpuIndex, offset: usize, value: u64, size: usize) {
        let trace = vcpu.trace();
        let mut value = value;

        match offset {
            TRCPRGCTLR => {
                let reg = LocalRegisterCopy::<u32, TRCPRGCTLR_REG::Register>::new(value as u32);
                trace.enabled.store(reg.is_set(TRCPRGCTLR_REG::EN), Ordering::Relaxed);
            }
            TRCVICTLR => {
                let protected = protect_trcvictlr(value as u32);
                trace.trcvictlr.store(protected, Ordering::Relaxed);
                value = protected as u64;
            }
            _ => {}
        }

        self.backend.write_reg(pcpu, offset, value, size);
    }

    /// Restore the saved TRCVICTLR when `vcpu` is loaded on `pcpu`
    pub fn load_state(&self, vcpu: &Arc<Vcpu>, pcpu: CpuIndex) {
        if self.is_primary(vcpu, pcpu) {
            self.backend
                .write_reg(pcpu, TRCVICTLR, vcpu.trace().trcvictlr() as u64, 4);
        }
    }

    /// Reset TRCVICTLR before `vcpu` is switched out of `pcpu`
    pub fn context_switch_pre(&self, vcpu: &Arc<Vcpu>, pcpu: CpuIndex) {
        if self.is_primary(vcpu, pcpu) {
            self.backend
                .write_reg(pcpu, TRCVICTLR, TRCVICTLR_DEFAULT as u64, 4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;
    use test_case::test_case;

    const BASE: u64 = 0x2204_0000;
    const STRIDE: u64 = 0x1000;

    struct Setup {
        fx: Fixture,
        shadow: Arc<ShadowEtm>,
        etm: VirtualEtm,
    }

    fn setup() -> Setup {
        let fx = Fixture::new(2);
        let shadow = Arc::new(ShadowEtm::new());
        let etm = VirtualEtm::new(&fx.manager, shadow.clone());
        fx.sched.set_current(1, Some(&fx.vcpus[0]));
        Setup { fx, shadow, etm }
    }

    #[test_case(0x0030_0000, 0x0030_0000; "no hypervisor bits")]
    #[test_case(0x0040_0000, 0x000F_0000; "el2 removed")]
    #[test_case(0x00F0_0000 | 0x0040_0000 | 0x0000_0201, 0x00BF_0201; "keeps other fields")]
    fn test_protect_trcvictlr(raw: u32, expected: u32) {
        let mut expected = expected;
        // Secure levels are always excluded
        expected |= 0x000F_0000;
        assert_eq!(protect_trcvictlr(raw), expected);
    }

    #[test]
    fn test_read_write_own_block() {
        let s = setup();
        let vcpu = &s.fx.vcpus[0];
        let ipa = BASE + STRIDE + 0x10;

        let mut value = 0xDEAD_BEEF;
        assert!(s.etm.handle_access(vcpu, 1, ipa, 4, &mut value, true));
        assert_eq!(s.shadow.read_reg(1, 0x10, 4), 0xDEAD_BEEF);

        let mut value = 0;
        assert!(s.etm.handle_access(vcpu, 1, ipa, 4, &mut value, false));
        assert_eq!(value, 0xDEAD_BEEF);
    }

    #[test_case(BASE + 0x10, 4; "other cpu block")]
    #[test_case(BASE + STRIDE + 0x12, 4; "misaligned")]
    #[test_case(BASE + STRIDE + 0x10, 2; "bad width")]
    #[test_case(BASE + STRIDE + 0xFFC, 8; "straddles window end")]
    #[test_case(BASE - 4, 4; "below base")]
    #[test_case(BASE + STRIDE * 8, 4; "past last cpu")]
    fn test_rejected_access(ipa: u64, size: usize) {
        let s = setup();
        let mut value = 1;
        assert!(!s.etm.handle_access(&s.fx.vcpus[0], 1, ipa, size, &mut value, true));
        assert_eq!(value, 1);
    }

    #[test]
    fn test_non_primary_rejected() {
        let s = setup();
        let mut value = 0;
        let ipa = BASE + STRIDE;
        assert!(!s.etm.handle_access(&s.fx.vcpus[1], 1, ipa, 4, &mut value, false));
        // Nothing is loaded on pCPU 0
        assert!(!s.etm.handle_access(&s.fx.vcpus[0], 0, BASE, 4, &mut value, false));
    }

    #[test]
    fn test_control_writes_update_context() {
        let s = setup();
        let vcpu = &s.fx.vcpus[0];

        let mut value = 1;
        assert!(s.etm.handle_access(vcpu, 1, BASE + STRIDE + TRCPRGCTLR as u64, 4, &mut value, true));
        assert!(vcpu.trace().is_enabled());

        let mut value = 0x0040_0000;
        assert!(s.etm.handle_access(vcpu, 1, BASE + STRIDE + TRCVICTLR as u64, 4, &mut value, true));
        assert_eq!(vcpu.trace().trcvictlr(), 0x000F_0000);
        assert_eq!(s.shadow.read_reg(1, TRCVICTLR, 4), 0x000F_0000);
    }

    #[test]
    fn test_context_switch_hooks() {
        let s = setup();
        let vcpu = &s.fx.vcpus[0];
        let mut value = 0x0010_0000;
        assert!(s.etm.handle_access(vcpu, 1, BASE + STRIDE + TRCVICTLR as u64, 4, &mut value, true));

        s.etm.context_switch_pre(vcpu, 1);
        assert_eq!(s.shadow.read_reg(1, TRCVICTLR, 4), TRCVICTLR_DEFAULT as u64);

        s.etm.load_state(vcpu, 1);
        assert_eq!(s.shadow.read_reg(1, TRCVICTLR, 4), 0x001F_0000);

        // Hooks ignore VCPUs that are not primary on the CPU
        s.etm.context_switch_pre(&s.fx.vcpus[1], 1);
        assert_eq!(s.shadow.read_reg(1, TRCVICTLR, 4), 0x001F_0000);
    }
}
