//! A fixed-capacity bit vector for dense set operations.
//!
//! Dominator and liveness computation both iterate set equations to a fixed
//! point over sets of small integer ids (block ids, register ids). This module
//! provides the packed representation those loops run on: 64 elements per word,
//! with in-place union/intersection/difference that report whether the receiver
//! changed, which is exactly the convergence signal the fixed-point drivers need.
//!
//! # Example
//!
//! ```rust,ignore
//! use bytepress::utils::BitSet;
//!
//! let mut live = BitSet::new(16);
//! live.insert(3);
//! live.insert(7);
//!
//! let mut kill = BitSet::new(16);
//! kill.insert(7);
//!
//! assert!(live.difference_with(&kill));
//! assert_eq!(live.iter().collect::<Vec<_>>(), vec![3]);
//! ```

const WORD_BITS: usize = 64;

/// A fixed-capacity set of small integers, packed 64 per word.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitSet {
    words: Vec<u64>,
    capacity: usize,
}

impl BitSet {
    /// Creates an empty set able to hold values in `0..capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
        }
    }

    /// Creates a set with every value in `0..capacity` present.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        set.fill();
        set
    }

    /// Returns the capacity this set was created with.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if no value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Adds `value` to the set.
    ///
    /// # Panics
    ///
    /// Panics if `value >= self.capacity()`.
    pub fn insert(&mut self, value: usize) {
        assert!(value < self.capacity, "value out of range");
        self.words[value / WORD_BITS] |= 1u64 << (value % WORD_BITS);
    }

    /// Removes `value` from the set.
    ///
    /// # Panics
    ///
    /// Panics if `value >= self.capacity()`.
    pub fn remove(&mut self, value: usize) {
        assert!(value < self.capacity, "value out of range");
        self.words[value / WORD_BITS] &= !(1u64 << (value % WORD_BITS));
    }

    /// Returns `true` if `value` is present.
    ///
    /// # Panics
    ///
    /// Panics if `value >= self.capacity()`.
    #[must_use]
    pub fn contains(&self, value: usize) -> bool {
        assert!(value < self.capacity, "value out of range");
        self.words[value / WORD_BITS] & (1u64 << (value % WORD_BITS)) != 0
    }

    /// Returns the number of values present.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Inserts every value in `0..capacity`.
    pub fn fill(&mut self) {
        self.words.fill(u64::MAX);
        self.mask_tail();
    }

    /// In-place union. Returns `true` if `self` gained any value.
    ///
    /// # Panics
    ///
    /// Panics if the two sets have different capacities.
    pub fn union_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.capacity, other.capacity, "capacity mismatch");
        let mut changed = false;
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            let merged = *dst | *src;
            changed |= merged != *dst;
            *dst = merged;
        }
        changed
    }

    /// In-place intersection. Returns `true` if `self` lost any value.
    ///
    /// # Panics
    ///
    /// Panics if the two sets have different capacities.
    pub fn intersect_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.capacity, other.capacity, "capacity mismatch");
        let mut changed = false;
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            let kept = *dst & *src;
            changed |= kept != *dst;
            *dst = kept;
        }
        changed
    }

    /// In-place difference: removes every value present in `other`.
    /// Returns `true` if `self` lost any value.
    ///
    /// # Panics
    ///
    /// Panics if the two sets have different capacities.
    pub fn difference_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.capacity, other.capacity, "capacity mismatch");
        let mut changed = false;
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            let kept = *dst & !*src;
            changed |= kept != *dst;
            *dst = kept;
        }
        changed
    }

    /// Returns an iterator over the values present, in ascending order.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: &self.words,
            current: self.words.first().copied().unwrap_or(0),
            word_idx: 0,
        }
    }

    /// Clears the unused high bits of the last word.
    fn mask_tail(&mut self) {
        let tail = self.capacity % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over the values present in a [`BitSet`], ascending.
pub struct BitSetIter<'a> {
    words: &'a [u64],
    current: u64,
    word_idx: usize,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current == 0 {
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_idx];
        }

        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.word_idx * WORD_BITS + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let mut set = BitSet::new(130);
        assert!(set.is_empty());

        set.insert(0);
        set.insert(64);
        set.insert(129);

        assert!(set.contains(0));
        assert!(set.contains(64));
        assert!(set.contains(129));
        assert!(!set.contains(1));
        assert_eq!(set.count(), 3);

        set.remove(64);
        assert!(!set.contains(64));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn full_masks_tail_bits() {
        let set = BitSet::full(70);
        assert_eq!(set.count(), 70);
        assert_eq!(set.iter().last(), Some(69));
    }

    #[test]
    fn union_reports_change() {
        let mut a = BitSet::new(32);
        let mut b = BitSet::new(32);
        a.insert(1);
        b.insert(1);
        b.insert(2);

        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn intersect_reports_change() {
        let mut a = BitSet::new(32);
        let mut b = BitSet::new(32);
        a.insert(1);
        a.insert(2);
        b.insert(2);

        assert!(a.intersect_with(&b));
        assert!(!a.contains(1));
        assert!(a.contains(2));
        assert!(!a.intersect_with(&b));
    }

    #[test]
    fn difference_reports_change() {
        let mut a = BitSet::full(16);
        let b = BitSet::full(16);

        assert!(a.difference_with(&b));
        assert!(a.is_empty());
        assert!(!a.difference_with(&b));
    }

    #[test]
    fn iter_crosses_word_boundaries() {
        let mut set = BitSet::new(200);
        for v in [0, 63, 64, 127, 128, 199] {
            set.insert(v);
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 127, 128, 199]);
    }

    #[test]
    fn clear_and_fill() {
        let mut set = BitSet::new(48);
        set.insert(10);
        set.clear();
        assert!(set.is_empty());

        set.fill();
        assert_eq!(set.count(), 48);
    }
}
