//! Configuration management
//!
//! This module holds the configuration-time knowledge of the interrupt
//! subsystem: VIRQ number ranges, attachment and CPU limits, and the
//! placement of the emulated trace unit.

use core::ops::Range;

use crate::vic::VirqNumber;
use crate::{Error, Result};

/// Upper bound (exclusive) on any VIRQ number, shared or private
pub const MAX_VIRQS: u32 = 1024;

/// Maximum number of VCPU attachments per controller
pub const MAX_ATTACHMENTS: usize = 64;

/// Maximum number of physical CPUs
pub const MAX_CPUS: usize = 64;

cfg_if::cfg_if! {
    if #[cfg(feature = "verbose")] {
        /// Default log level
        pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Trace;
    } else if #[cfg(feature = "debug")] {
        /// Default log level
        pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Debug;
    } else {
        /// Default log level
        pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
    }
}

/// Interrupt subsystem configuration
#[derive(Debug, Clone)]
pub struct VicConfig {
    /// First private VIRQ number
    pub private_base: VirqNumber,
    /// Number of private VIRQs per VCPU
    pub private_count: u32,
    /// First shared VIRQ number
    pub shared_base: VirqNumber,
    /// Number of shared VIRQs per controller
    pub shared_count: u32,
    /// Maximum VCPU attachments per controller
    pub max_vcpus: usize,
    /// Number of physical CPUs
    pub max_cpus: usize,
    /// Guest physical base of the emulated trace units
    pub etm_base: u64,
    /// Distance between two per-CPU trace unit blocks
    pub etm_stride: u64,
    /// Size of the register window inside one per-CPU block
    pub etm_size_percpu: u64,
}

impl Default for VicConfig {
    fn default() -> Self {
        Self {
            private_base: 0,
            private_count: 32,
            shared_base: 32,
            shared_count: 988, // 32..1020
            max_vcpus: 8,
            max_cpus: 8,
            etm_base: 0x2204_0000,
            etm_stride: 0x1000,
            etm_size_percpu: 0x1000,
        }
    }
}

impl VicConfig {
    /// Private VIRQ range
    pub fn private_range(&self) -> Range<VirqNumber> {
        self.private_base..self.private_base + self.private_count
    }

    /// Shared VIRQ range
    pub fn shared_range(&self) -> Range<VirqNumber> {
        self.shared_base..self.shared_base + self.shared_count
    }

    /// Check if a VIRQ number may be bound privately
    pub fn is_private(&self, virq: VirqNumber) -> bool {
        self.private_range().contains(&virq)
    }

    /// Check if a VIRQ number may be bound as shared
    pub fn is_shared(&self, virq: VirqNumber) -> bool {
        self.shared_range().contains(&virq)
    }

    /// End of the trace unit windows, if it fits in the address space
    pub fn etm_end(&self) -> Option<u64> {
        self.etm_stride
            .checked_mul(self.max_cpus as u64)?
            .checked_add(self.etm_base)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (base, count) in [
            (self.private_base, self.private_count),
            (self.shared_base, self.shared_count),
        ] {
            let end = base.checked_add(count).ok_or(Error::ArgumentInvalid)?;
            if count == 0 || end > MAX_VIRQS {
                log::warn!("VIRQ range {}..{} invalid", base, end);
                return Err(Error::ArgumentInvalid);
            }
        }

        if self.max_vcpus == 0 || self.max_vcpus > MAX_ATTACHMENTS {
            return Err(Error::ArgumentInvalid);
        }
        if self.max_cpus == 0 || self.max_cpus > MAX_CPUS {
            return Err(Error::ArgumentInvalid);
        }

        // Per-CPU trace unit windows must not overlap
        if self.etm_size_percpu == 0 || self.etm_size_percpu > self.etm_stride {
            return Err(Error::ArgumentInvalid);
        }
        if self.etm_end().is_none() {
            log::warn!("trace unit windows overflow the address space");
            return Err(Error::ArgumentInvalid);
        }

        Ok(())
    }
}
