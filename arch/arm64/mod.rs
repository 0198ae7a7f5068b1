//! ARM64 (AArch64) architecture support
//!
//! Guest calls trapped to EL2 through `smc #0` and `hvc #0` are routed to
//! hypervisor services by the SMCCC dispatcher.
//!
//! ## References
//! - [SMC Calling Convention](https://developer.arm.com/documentation/den0028/latest)

pub mod smccc;

pub use smccc::{SmcccCall, SmcccCallClass, SmcccDispatcher, SmcccHandler, SmcccRegs};
