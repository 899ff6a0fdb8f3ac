//! Instruction model, opcode tables and the stream codec.
//!
//! This module turns a function's flat code buffer into typed [`Instruction`]
//! records and back. It is the bottom of the pipeline: everything above it
//! (CFG construction, dominance, liveness, allocation) consumes the decoded
//! stream and the register read/write facts discovered here.
//!
//! # Key Components
//!
//! - [`OpcodeTable`] - Immutable opcode lookup tables, injected into the decoder
//! - [`Instruction`] - One decoded operation with flags, operands and register facts
//! - [`decode_function`] - Decodes a full code region into an instruction list
//! - [`encode_function`] - Re-serializes a (possibly rewritten) instruction list
//! - [`Function`] - The per-function container the passes mutate in place

mod decoder;
mod encode;
mod function;
mod instruction;
mod opcode;

pub use decoder::{decode_function, Decoder};
pub use encode::encode_function;
pub use function::{Function, FunctionFlags, LiteralBoundaries, LiteralPool};
pub use instruction::{InstFlags, Instruction, Literal, LiteralType, Operands};
pub use opcode::{ops, OpcodeData, OpcodeFlags, OpcodeTable, OperandShape, EXT_OPCODE_BASE};
