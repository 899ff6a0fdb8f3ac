//! Shared utility types used across the analysis passes.

mod bitset;

pub use bitset::{BitSet, BitSetIter};
