//! # bytepress Prelude
//!
//! A curated selection of the types needed for the common
//! open-decode-optimize-write workflow, for convenient glob imports.

/// The main error type for all bytepress operations
pub use crate::Error;

/// The result type used throughout bytepress
pub use crate::Result;

/// The serialized program container
pub use crate::Snapshot;

/// The per-function bytecode unit the passes mutate in place
pub use crate::bytecode::Function;

/// Opcode lookup tables injected into the decoder
pub use crate::bytecode::{ops, OpcodeTable};

/// Instruction model essentials
pub use crate::bytecode::{InstFlags, Instruction, Literal, LiteralType};

/// Function header structures
pub use crate::bytecode::{FunctionFlags, LiteralBoundaries, LiteralPool};

/// The pass manager and the built-in passes
pub use crate::optimizer::{
    CfgPass, DominatorPass, LivenessPass, Optimizer, Pass, PassKind, RegAllocPass,
};

/// The basic-block graph
pub use crate::analysis::cfg::{BasicBlock, BlockArena, BlockId, BlockKind};

/// Live intervals consumed by the allocator
pub use crate::analysis::liveness::LiveInterval;
