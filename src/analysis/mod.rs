//! The analysis passes of the optimization pipeline.
//!
//! Each submodule is one pass over a decoded
//! [`Function`](crate::bytecode::Function), in dependency order:
//! [`cfg`] reconstructs the basic-block graph from the flat instruction
//! stream, [`dominators`] and [`liveness`] fill the per-block scratch sets,
//! and [`regalloc`] consumes the live intervals to compact the register
//! file. Sequencing is enforced by the pass manager in
//! [`optimizer`](crate::optimizer), not re-checked here beyond debug
//! assertions.

pub mod cfg;
pub mod dominators;
pub mod liveness;
pub mod regalloc;
