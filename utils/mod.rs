//! Utility data structures
//!
//! This module contains helper code used throughout the interrupt
//! subsystem.

pub mod bitmap;

// Re-export commonly used utilities
pub use self::bitmap::AtomicBitmap;
