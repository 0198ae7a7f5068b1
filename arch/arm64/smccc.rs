//! SMCCC (SMC Calling Convention) call dispatch for ARM64
//!
//! Guest SMC and HVC instructions trapped to EL2 are decoded here and handed
//! to whichever hypervisor service registered for the call.
//! Reference: ARM DEN 0028 - SMC Calling Convention
//!
//! Function ID layout:
//! - bit 31: fast call (otherwise yielding)
//! - bit 30: SMC64 calling convention (otherwise SMC32)
//! - bits 29:24: owning entity (service interface)
//! - bits 15:0: function number

use alloc::sync::Arc;

use bitflags::bitflags;
use heapless::FnvIndexMap;

use crate::{Error, Result};

/// Maximum number of registered call handlers
pub const MAX_SMCCC_HANDLERS: usize = 64;

/// SMCCC function ID interface mask (bits 29:24)
pub const SMCCC_INTERFACE_MASK: u32 = 0x3F00_0000;

/// SMCCC function ID interface shift
pub const SMCCC_INTERFACE_SHIFT: u32 = 24;

/// SMCCC function number mask
pub const SMCCC_FUNC_NUM_MASK: u32 = 0xFFFF;

bitflags! {
    /// Call-type bits of an SMCCC function ID
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SmcccIdFlags: u32 {
        /// Fast (atomic) call
        const FAST = 1 << 31;
        /// 64-bit calling convention
        const SMC64 = 1 << 30;
    }
}

/// SMCCC call class: {fast, yielding} x {32-bit, 64-bit}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmcccCallClass {
    /// Fast call, W registers
    Fast32,
    /// Fast call, X registers
    Fast64,
    /// Yielding call, W registers
    Yielding32,
    /// Yielding call, X registers
    Yielding64,
}

impl SmcccCallClass {
    /// Check if fast call
    pub fn is_fast(self) -> bool {
        matches!(self, Self::Fast32 | Self::Fast64)
    }

    /// Check if 64-bit
    pub fn is_64bit(self) -> bool {
        matches!(self, Self::Fast64 | Self::Yielding64)
    }
}

/// SMCCC owning entity numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmcccService {
    /// Arm Architecture calls
    Arch = 0x00,
    /// CPU service calls
    CpuService = 0x01,
    /// SiP service calls
    SipService = 0x02,
    /// OEM service calls
    OemService = 0x03,
    /// Standard secure service calls (PSCI)
    StdService = 0x04,
    /// Standard hypervisor service calls
    StdHypervisor = 0x05,
    /// Vendor specific hypervisor service calls
    VendorHypervisor = 0x06,
}

impl SmcccService {
    /// Get the interface id
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// SMCCC function ID decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmcccFunctionId {
    pub raw: u32,
}

impl SmcccFunctionId {
    /// Create from raw function ID
    pub const fn new(raw: u32) -> Self {
        Self { raw }
    }

    /// Build a function ID
    pub fn build(class: SmcccCallClass, interface: u8, function: u16) -> Self {
        let mut flags = SmcccIdFlags::empty();
        flags.set(SmcccIdFlags::FAST, class.is_fast());
        flags.set(SmcccIdFlags::SMC64, class.is_64bit());
        let interface = ((interface as u32) << SMCCC_INTERFACE_SHIFT) & SMCCC_INTERFACE_MASK;
        Self::new(flags.bits() | interface | function as u32)
    }

    fn flags(&self) -> SmcccIdFlags {
        SmcccIdFlags::from_bits_truncate(self.raw)
    }

    /// Check if fast call
    pub fn is_fast(&self) -> bool {
        self.flags().contains(SmcccIdFlags::FAST)
    }

    /// Check if SMC64 calling convention
    pub fn is_smc64(&self) -> bool {
        self.flags().contains(SmcccIdFlags::SMC64)
    }

    /// Get the call class
    pub fn class(&self) -> SmcccCallClass {
        match (self.is_fast(), self.is_smc64()) {
            (true, true) => SmcccCallClass::Fast64,
            (true, false) => SmcccCallClass::Fast32,
            (false, true) => SmcccCallClass::Yielding64,
            (false, false) => SmcccCallClass::Yielding32,
        }
    }

    /// Get the owning entity (interface) id
    pub fn interface(&self) -> u8 {
        ((self.raw & SMCCC_INTERFACE_MASK) >> SMCCC_INTERFACE_SHIFT) as u8
    }

    /// Get function number
    pub fn function_number(&self) -> u16 {
        (self.raw & SMCCC_FUNC_NUM_MASK) as u16
    }
}

/// SMCCC client ID (x7, low 32 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmcccClientId {
    pub raw: u32,
}

impl SmcccClientId {
    /// Create from raw value
    pub const fn new(raw: u32) -> Self {
        Self { raw }
    }

    /// Client (VM) id, bits 15:0
    pub const fn client(&self) -> u16 {
        self.raw as u16
    }

    /// Secure OS session id, bits 31:16
    pub const fn session(&self) -> u16 {
        (self.raw >> 16) as u16
    }
}

/// Guest general purpose registers involved in a call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmcccRegs {
    /// Function ID in, result 0 out
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    /// Client ID
    pub x7: u64,
}

impl SmcccRegs {
    /// Create with function ID and up to six arguments
    pub fn with_args(function_id: u32, args: &[u64]) -> Self {
        let mut regs = Self {
            x0: function_id as u64,
            ..Self::default()
        };
        let slots = [
            &mut regs.x1,
            &mut regs.x2,
            &mut regs.x3,
            &mut regs.x4,
            &mut regs.x5,
            &mut regs.x6,
        ];
        for (slot, arg) in slots.into_iter().zip(args) {
            *slot = *arg;
        }
        regs
    }

    /// Get decoded function ID
    pub fn function_id(&self) -> SmcccFunctionId {
        SmcccFunctionId::new(self.x0 as u32)
    }
}

/// A decoded call as seen by a handler
#[derive(Debug, Clone, Copy)]
pub struct SmcccCall {
    pub class: SmcccCallClass,
    pub interface: u8,
    pub function: u16,
    /// Trapped from HVC rather than SMC
    pub is_hvc: bool,
    /// x1..x6, truncated to 32 bits for 32-bit calls
    pub args: [u64; 6],
    pub client: SmcccClientId,
}

/// Hypervisor service behind one (class, interface, function) triple
pub trait SmcccHandler: Send + Sync {
    /// Handle the call, returning x0..x3, or `None` to leave it unclaimed
    fn handle(&self, call: &SmcccCall) -> Option<[u64; 4]>;
}

impl<F> SmcccHandler for F
where
    F: Fn(&SmcccCall) -> Option<[u64; 4]> + Send + Sync,
{
    fn handle(&self, call: &SmcccCall) -> Option<[u64; 4]> {
        self(call)
    }
}

type HandlerKey = (SmcccCallClass, u8, u16);

/// SMCCC call dispatcher
pub struct SmcccDispatcher {
    handlers: FnvIndexMap<HandlerKey, Arc<dyn SmcccHandler>, MAX_SMCCC_HANDLERS>,
}

impl SmcccDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self {
            handlers: FnvIndexMap::new(),
        }
    }

    /// Register `handler` for one call
    pub fn register(
        &mut self,
        class: SmcccCallClass,
        interface: u8,
        function: u16,
        handler: Arc<dyn SmcccHandler>,
    ) -> Result<()> {
        let key = (class, interface, function);
        if self.handlers.contains_key(&key) {
            return Err(Error::Busy);
        }
        self.handlers
            .insert(key, handler)
            .map_err(|_| Error::ResourceFull)?;
        Ok(())
    }

    /// Remove the handler for one call
    pub fn unregister(&mut self, class: SmcccCallClass, interface: u8, function: u16) -> Result<()> {
        self.handlers
            .remove(&(class, interface, function))
            .map(|_| ())
            .ok_or(Error::NoHandler)
    }

    /// Dispatch the call in `regs`, writing x0..x3 back
    ///
    /// Registers of an unclaimed 64-bit call are left unchanged; those of
    /// an unclaimed 32-bit call are zero-extended from their low word.
    pub fn handle_call(&self, regs: &mut SmcccRegs, is_hvc: bool) -> bool {
        let id = regs.function_id();
        let class = id.class();
        let narrow = |v: u64| if class.is_64bit() { v } else { v & 0xFFFF_FFFF };

        let call = SmcccCall {
            class,
            interface: id.interface(),
            function: id.function_number(),
            is_hvc,
            args: [regs.x1, regs.x2, regs.x3, regs.x4, regs.x5, regs.x6].map(narrow),
            client: SmcccClientId::new(regs.x7 as u32),
        };

        let result = self
            .handlers
            .get(&(class, call.interface, call.function))
            .and_then(|handler| handler.handle(&call));
        let handled = result.is_some();
        let ret = result.unwrap_or([regs.x0, regs.x1, regs.x2, regs.x3]).map(narrow);

        if !handled {
            log::debug!(
                "smccc: unhandled {:?} call {:#x}:{:#x}",
                class,
                call.interface,
                call.function
            );
        }

        regs.x0 = ret[0];
        regs.x1 = ret[1];
        regs.x2 = ret[2];
        regs.x3 = ret[3];
        handled
    }

    /// Handle a trapped SMC; only `smc #0` is dispatched
    pub fn handle_vcpu_trap_smc64(&self, regs: &mut SmcccRegs, imm16: u16) -> bool {
        imm16 == 0 && self.handle_call(regs, false)
    }

    /// Handle a trapped HVC; only `hvc #0` is dispatched
    pub fn handle_vcpu_trap_hvc64(&self, regs: &mut SmcccRegs, imm16: u16) -> bool {
        imm16 == 0 && self.handle_call(regs, true)
    }
}

impl Default for SmcccDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
