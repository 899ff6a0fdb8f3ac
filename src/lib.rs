// Copyright 2025 bytepress contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'snapshot.rs' uses mmap to map a container file into memory

//! # bytepress
//!
//! [![Crates.io](https://img.shields.io/crates/v/bytepress.svg)](https://crates.io/crates/bytepress)
//! [![Documentation](https://docs.rs/bytepress/badge.svg)](https://docs.rs/bytepress)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/bytepress/bytepress/blob/main/LICENSE)
//!
//! A bytecode-level optimizer for compact stack-machine bytecode. `bytepress`
//! reconstructs control-flow structure from a function's flat instruction
//! stream, computes dominance and liveness facts, and reassigns virtual
//! registers through linear-scan allocation, producing a semantically
//! equivalent stream with a smaller register file.
//!
//! ## Features
//!
//! - **Table-driven decoding** - Escape opcodes, variable-length branch
//!   offsets and literal indices, driven by an injected [`bytecode::OpcodeTable`]
//! - **Structural CFG recovery** - Conditionals, loops with break/continue,
//!   try/catch/finally regions and for-in/for-of iteration contexts
//! - **Dataflow analyses** - Iterative dominators, kill/upward-exposed sets
//!   and a backward live-out fixed point over packed bit sets
//! - **Register compaction** - Linear-scan allocation over live intervals,
//!   with instruction rewrite and literal-pool compaction
//! - **Container round trip** - Memory-mapped snapshot parsing and re-emission
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytepress::prelude::*;
//!
//! let mut snapshot = Snapshot::open("program.snapshot")?;
//! let table = OpcodeTable::default_set();
//!
//! for func in snapshot.functions_mut() {
//!     func.decode(&table)?;
//! }
//! Optimizer::new().run(snapshot.functions_mut())?;
//!
//! snapshot.write("program.opt.snapshot", &table)?;
//! # Ok::<(), bytepress::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The pipeline runs fixed passes per function, in dependency order:
//!
//! 1. [`bytecode`] - instruction model, opcode tables and the stream codec
//! 2. [`analysis::cfg`] - basic-block construction and edge wiring
//! 3. [`analysis::dominators`] - dominator sets and immediate dominators
//! 4. [`analysis::liveness`] - kill/ue sets, live-out fixed point, live intervals
//! 5. [`analysis::regalloc`] - linear-scan allocation and the rewrite
//!
//! [`optimizer::Optimizer`] sequences the passes; functions are independent
//! units, so the list can also be processed in parallel with
//! [`optimizer::Optimizer::run_parallel`].
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, Error>`](Result). Damaged
//! input is a recoverable [`Error`]; violated pipeline contracts (a jump
//! target off an instruction boundary, passes run out of order) abort via
//! assertion, because they indicate a bug in the producing compiler or in
//! pass sequencing rather than a runtime condition.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// ```rust,no_run
/// use bytepress::prelude::*;
///
/// let snapshot = Snapshot::open("program.snapshot")?;
/// println!("{} functions", snapshot.functions().len());
/// # Ok::<(), bytepress::Error>(())
/// ```
pub mod prelude;

pub mod analysis;
pub mod bytecode;
pub mod optimizer;
pub mod utils;

mod snapshot;

/// The result type used throughout `bytepress`.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;
pub use snapshot::Snapshot;
