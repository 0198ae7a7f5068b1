//! Architecture support
//!
//! Only the architecture glue at the edge of the interrupt subsystem lives
//! here. It is plain decoding logic and builds on any host.

pub mod arm64;
