//! Virtual machine objects
//!
//! Only the parts of a VCPU the interrupt subsystem interacts with live
//! here: its run state, its private routing table and pending hints, and
//! its attachment to a controller.

pub mod vcpu;

pub use vcpu::{Vcpu, VcpuRunState};

/// VCPU identifier
pub type VcpuId = u32;
