//! Atomic bitmap implementation
//!
//! This module provides a fixed-size bitmap whose bits can be set and
//! cleared concurrently from any CPU without locking. It is used to hint
//! which VIRQ numbers may be pending on a VCPU.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Lock-free bitmap structure
pub struct AtomicBitmap {
    /// Bitmap data
    words: Box<[AtomicU64]>,
    /// Number of bits
    bits: usize,
}

impl AtomicBitmap {
    /// Create a new, cleared bitmap
    pub fn new(bits: usize) -> Self {
        let words = (bits + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice(),
            bits,
        }
    }

    /// Get the number of bits
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Test if a bit is set
    pub fn test(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        let value = self.words[index / 64].load(Ordering::Acquire);
        (value >> (index % 64)) & 1 == 1
    }

    /// Set a bit, returning its previous value
    pub fn set(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    /// Clear a bit, returning its previous value
    pub fn clear(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    /// Clear all bits
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::SeqCst);
        }
    }

    /// Check if any bit is set
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }

    /// Count the set bits
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Iterate over set bits
    ///
    /// Each word is sampled once when the iterator reaches it; bits set or
    /// cleared concurrently may or may not be observed.
    pub fn iter(&self) -> SetBits<'_> {
        SetBits {
            bitmap: self,
            word: 0,
            current: 0,
            loaded: false,
        }
    }
}

/// Iterator over the set bits of an [`AtomicBitmap`]
pub struct SetBits<'a> {
    bitmap: &'a AtomicBitmap,
    word: usize,
    current: u64,
    loaded: bool,
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.word >= self.bitmap.words.len() {
                return None;
            }
            if !self.loaded {
                self.current = self.bitmap.words[self.word].load(Ordering::Acquire);
                self.loaded = true;
            }
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1; // Clear the lowest set bit
                return Some(self.word * 64 + bit);
            }
            self.word += 1;
            self.loaded = false;
        }
    }
}
