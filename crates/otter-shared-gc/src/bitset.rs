//! Per-region address bitmaps
//!
//! One bit per heap word of a region. Used for marked objects and for the
//! two remembered sets (local-to-share and cross-region slots). Words are
//! atomic so inserts from one thread and draining from another never race.
//! Draining scans each word with `trailing_zeros()`, so addresses come out
//! in ascending order.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::{Address, WORD_SIZE};

const BITS_PER_WORD: usize = 64;

/// Address bitmap covering `[base, base + bits * WORD_SIZE)`.
pub struct RegionBitSet {
    words: Box<[AtomicU64]>,
}

impl RegionBitSet {
    /// Create an empty bitmap for a region of `region_size` bytes
    pub fn new(region_size: usize) -> Self {
        let bits = region_size / WORD_SIZE;
        let words = (0..bits.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words }
    }

    #[inline]
    fn locate(offset: usize) -> (usize, u64) {
        let bit = offset / WORD_SIZE;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    /// Set the bit for the word at byte `offset`. Returns true if newly set.
    #[inline]
    pub fn insert(&self, offset: usize) -> bool {
        let (idx, mask) = Self::locate(offset);
        self.words[idx].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    /// Check the bit for byte `offset`
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        let (idx, mask) = Self::locate(offset);
        self.words[idx].load(Ordering::Relaxed) & mask != 0
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Check if no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Clear every bit
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Iterate the recorded addresses in ascending order, clearing each
    /// bitmap word as it is reached.
    pub fn drain(&self, base: Address) -> Drain<'_> {
        Drain {
            words: &self.words,
            base,
            index: 0,
            current: 0,
        }
    }
}

impl std::fmt::Debug for RegionBitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBitSet")
            .field("count", &self.count())
            .finish()
    }
}

/// Consuming iterator returned by [`RegionBitSet::drain`]
pub struct Drain<'a> {
    words: &'a [AtomicU64],
    base: Address,
    /// Index of the next word to take
    index: usize,
    /// Remaining bits of word `index - 1`
    current: u64,
}

impl Iterator for Drain<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        while self.current == 0 {
            let word = self.words.get(self.index)?;
            self.current = word.swap(0, Ordering::Relaxed);
            self.index += 1;
        }
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        let word_index = (self.index - 1) * BITS_PER_WORD + bit;
        Some(self.base.offset(word_index * WORD_SIZE))
    }
}
