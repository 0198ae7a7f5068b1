//! Ferrovic - virtual interrupt controller core for Ferrovisor
//!
//! This crate delivers virtual interrupts (VIRQs) from kernel-resident
//! sources such as emulated devices, timers and doorbells to virtual CPUs.
//! It provides:
//! - exclusive binding of VIRQ numbers to caller-owned sources
//! - private (per-VCPU) and shared (policy-routed) delivery
//! - an RCU-style grace-period domain so that unbinding never races a
//!   remote physical CPU that is in the middle of a delivery
//!
//! The hypercall dispatcher and the trace-unit trap device that sit at the
//! edge of the interrupt subsystem live in [`arch`] and [`emulator`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod emulator;
pub mod sched;
pub mod sync;
pub mod utils;
pub mod vic;
pub mod vmm;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export key types for convenience
pub use config::VicConfig;
pub use sched::{SchedulerBridge, SimpleScheduler};
pub use vic::{
    assert, bind_private_index, bind_private_vcpu, bind_shared, check_pending, clear, unbind,
    unbind_sync, SourceCore, SourceState, Vic, VirqManager, VirqNumber, VirqSource, VirqTrigger,
};
pub use vmm::{Vcpu, VcpuId};

/// Ferrovic version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Physical CPU index
///
/// The current physical CPU is always passed explicitly; nothing in this
/// crate reads it from ambient per-CPU state.
pub type CpuIndex = usize;

/// Initialize the interrupt subsystem
///
/// Installs the compile-time log level. Installing a logger is left to the
/// embedding hypervisor.
pub fn init() -> Result<()> {
    log::set_max_level(config::DEFAULT_LOG_LEVEL);
    log::info!("Ferrovic v{} initialized", VERSION);
    Ok(())
}

/// Common error type for Ferrovic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Source is already bound and has not been released with `unbind_sync`
    VirqBound,
    /// Source has no live claim on a VIRQ
    VirqNotBound,
    /// VIRQ number already claimed by another source
    Busy,
    /// Argument out of range
    ArgumentInvalid,
    /// Target VCPU attachment missing or concurrently broken
    ObjectConfig,
    /// No handler registered for the requested event
    NoHandler,
    /// Bounded registration table is full
    ResourceFull,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::VirqBound => "virq source already bound",
            Error::VirqNotBound => "virq source not bound",
            Error::Busy => "virq already claimed",
            Error::ArgumentInvalid => "invalid argument",
            Error::ObjectConfig => "vcpu attachment missing",
            Error::NoHandler => "no handler registered",
            Error::ResourceFull => "registration table full",
        };
        f.write_str(msg)
    }
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;
