//! Device emulators at the edge of the interrupt subsystem

pub mod vetm;

pub use vetm::{EtmBackend, ShadowEtm, TraceContext, VirtualEtm};
