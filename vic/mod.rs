//! Virtual interrupt controller core
//!
//! Sources claim VIRQ numbers in routing tables, assert and clear their
//! pending state from any physical CPU, and release their claims through a
//! grace-period protected unbind:
//!
//! ```text
//!   Unbound --bind_*--> Bound --unbind--> Unbinding --unbind_sync--> Unbound
//! ```
//!
//! Shared VIRQs live in the controller's table and are routed to one of the
//! attached VCPUs by a [`route::RoutePolicy`] each time they are asserted.
//! Private VIRQs live in a VCPU's own table and always target that VCPU.

pub mod bind;
pub mod controller;
pub mod manager;
pub mod pending;
pub mod route;
pub mod source;
pub mod table;
pub mod trigger;

pub use bind::{bind_private_index, bind_private_vcpu, bind_shared, unbind, unbind_sync};
pub use controller::Vic;
pub use manager::VirqManager;
pub use pending::{assert, check_pending, clear};
pub use route::{AffinityPolicy, FixedPolicy, RoutePolicy, RouteRequest, VcpuMask};
pub use source::{SourceCore, SourceState, VirqSource};
pub use trigger::{CheckPending, TriggerTable, VirqTrigger};

/// Virtual interrupt number
pub type VirqNumber = u32;
