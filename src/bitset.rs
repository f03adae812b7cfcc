//! Fixed-capacity bitmap used to hand out and reclaim small integer ids.
//!
//! Bits live in `u64` words; scans walk the words in index order so the
//! lowest free (or set) id always wins. There is no internal locking: the
//! owner serializes mutation.

use crate::error::{Error, Result};

/// Bits per backing word.
pub const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-capacity bitmap. Bit `i` set means id `i` is allocated.
#[derive(Clone, PartialEq, Eq)]
pub struct BitAllocator {
    words: Box<[u64]>,
}

impl BitAllocator {
    /// Create an all-clear bitmap of `bits` bits.
    ///
    /// `bits` must be a nonzero multiple of [`WORD_BITS`].
    pub fn new(bits: usize) -> Result<Self> {
        if bits == 0 || bits % WORD_BITS != 0 {
            return Err(Error::InvalidArgument(
                "bit count must be a nonzero multiple of 64",
            ));
        }
        Ok(Self {
            words: vec![0u64; bits / WORD_BITS].into_boxed_slice(),
        })
    }

    /// Create an all-clear bitmap of at least `bits` bits, rounded up to a
    /// whole number of words (minimum one word).
    pub fn with_capacity_rounded(bits: usize) -> Self {
        let words = bits.div_ceil(WORD_BITS).max(1);
        Self {
            words: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Total number of bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    #[inline]
    fn locate(index: usize) -> (usize, u64) {
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    /// Returns whether bit `index` is set. Panics if `index >= len()`.
    #[inline]
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        self.words[word] |= mask;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        self.words[word] &= !mask;
    }

    /// Lowest clear bit, or `len()` when every bit is set.
    pub fn find_first_unset(&self) -> usize {
        self.words
            .iter()
            .position(|&w| w != u64::MAX)
            .map(|i| i * WORD_BITS + (!self.words[i]).trailing_zeros() as usize)
            .unwrap_or_else(|| self.len())
    }

    /// Lowest set bit, or `len()` when no bit is set.
    pub fn find_first_set(&self) -> usize {
        self.words
            .iter()
            .position(|&w| w != 0)
            .map(|i| i * WORD_BITS + self.words[i].trailing_zeros() as usize)
            .unwrap_or_else(|| self.len())
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn test_all(&self) -> bool {
        self.words.iter().all(|&w| w == u64::MAX)
    }

    pub fn test_any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn test_none(&self) -> bool {
        !self.test_any()
    }

    pub fn set_all(&mut self) {
        self.words.fill(u64::MAX);
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

impl core::fmt::Debug for BitAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitAllocator")
            .field("len", &self.len())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(matches!(BitAllocator::new(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(BitAllocator::new(100), Err(Error::InvalidArgument(_))));
        assert_eq!(BitAllocator::new(128).unwrap().len(), 128);
    }

    #[test]
    fn test_rounded_capacity() {
        assert_eq!(BitAllocator::with_capacity_rounded(0).len(), 64);
        assert_eq!(BitAllocator::with_capacity_rounded(2).len(), 64);
        assert_eq!(BitAllocator::with_capacity_rounded(65).len(), 128);
    }

    #[test]
    fn test_set_clear_round_trip() {
        let mut bits = BitAllocator::new(256).unwrap();
        for i in 0..256 {
            bits.set(i);
            assert!(bits.test(i));
            bits.clear(i);
            assert!(!bits.test(i));
        }
        assert!(bits.test_none());
    }

    #[test]
    fn test_find_first_unset_prefix() {
        let mut bits = BitAllocator::new(192).unwrap();
        for k in 0..192 {
            assert_eq!(bits.find_first_unset(), k);
            bits.set(k);
        }
        assert_eq!(bits.find_first_unset(), 192);
        assert!(bits.test_all());

        bits.clear_all();
        assert_eq!(bits.find_first_unset(), 0);
    }

    #[test]
    fn test_find_first_set_crosses_words() {
        let mut bits = BitAllocator::new(128).unwrap();
        assert_eq!(bits.find_first_set(), 128);
        bits.set(127);
        assert_eq!(bits.find_first_set(), 127);
        bits.set(64);
        assert_eq!(bits.find_first_set(), 64);
        bits.set(3);
        assert_eq!(bits.find_first_set(), 3);
    }

    #[test]
    fn test_hole_in_full_word_is_found() {
        let mut bits = BitAllocator::new(128).unwrap();
        bits.set_all();
        assert_eq!(bits.find_first_unset(), 128);
        bits.clear(70);
        assert_eq!(bits.find_first_unset(), 70);
        bits.clear(3);
        assert_eq!(bits.find_first_unset(), 3);
    }

    #[test]
    fn test_bulk_queries() {
        let mut bits = BitAllocator::new(64).unwrap();
        assert!(bits.test_none());
        assert!(!bits.test_any());
        assert!(!bits.test_all());
        assert_eq!(bits.count(), 0);

        bits.set(0);
        bits.set(63);
        assert!(bits.test_any());
        assert_eq!(bits.count(), 2);

        bits.set_all();
        assert!(bits.test_all());
        assert_eq!(bits.count(), 64);
    }

    proptest! {
        #[test]
        fn prop_matches_bool_model(ops in prop::collection::vec((any::<bool>(), 0usize..256), 0..200)) {
            let mut bits = BitAllocator::new(256).unwrap();
            let mut model = [false; 256];
            for (set, i) in ops {
                if set { bits.set(i) } else { bits.clear(i) }
                model[i] = set;
            }
            let first_unset = model.iter().position(|b| !b).unwrap_or(256);
            let first_set = model.iter().position(|b| *b).unwrap_or(256);
            prop_assert_eq!(bits.find_first_unset(), first_unset);
            prop_assert_eq!(bits.find_first_set(), first_set);
            prop_assert_eq!(bits.count(), model.iter().filter(|b| **b).count());
        }
    }
}
