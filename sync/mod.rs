//! Synchronization primitives
//!
//! This module provides the synchronization primitives the interrupt
//! subsystem relies on: a spinlock for bind-time exclusion and an RCU
//! domain for lock-free lookups with deferred reclamation.

pub mod rcu;
pub mod rcu_option;
pub mod spinlock;

// Re-export for convenience
pub use rcu::{Rcu, RcuReadGuard};
pub use rcu_option::RcuOption;
pub use spinlock::{SpinLock, SpinLockGuard};
