//! The pass manager driving the pipeline over function units.
//!
//! Passes are stateless across functions: all per-function scratch state
//! lives inside the [`Function`] being processed, so the function list can
//! be optimized sequentially or in parallel with identical results.
//! Ordering within one function is a hard contract: every pass declares the
//! passes it requires, and running out of order is a programming error that
//! aborts, never a runtime condition.

use bitflags::bitflags;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    analysis::{
        cfg::build_cfg,
        dominators::compute_dominators,
        liveness::compute_liveness,
        regalloc::allocate_registers,
    },
    bytecode::Function,
    Result,
};

bitflags! {
    /// Identity of a pipeline pass, doubling as the completion record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassKind: u8 {
        /// CFG construction.
        const CFG = 1 << 0;
        /// Dominator analysis.
        const DOMINATORS = 1 << 1;
        /// Liveness analysis.
        const LIVENESS = 1 << 2;
        /// Linear-scan register allocation.
        const REG_ALLOC = 1 << 3;
    }
}

/// One pipeline pass over a single function unit.
pub trait Pass: Send + Sync {
    /// Human-readable pass name for diagnostics.
    fn name(&self) -> &'static str;

    /// The identity this pass records on completion.
    fn kind(&self) -> PassKind;

    /// Passes that must have completed on the unit before this one runs.
    fn requires(&self) -> PassKind {
        PassKind::empty()
    }

    /// Runs the pass. Returns `true` if the function was modified.
    ///
    /// # Errors
    ///
    /// Pass-specific; see the individual pass functions.
    fn run(&self, func: &mut Function) -> Result<bool>;
}

/// CFG construction as a pipeline pass.
pub struct CfgPass;

impl Pass for CfgPass {
    fn name(&self) -> &'static str {
        "cfg"
    }

    fn kind(&self) -> PassKind {
        PassKind::CFG
    }

    fn run(&self, func: &mut Function) -> Result<bool> {
        build_cfg(func);
        Ok(true)
    }
}

/// Dominator analysis as a pipeline pass.
pub struct DominatorPass;

impl Pass for DominatorPass {
    fn name(&self) -> &'static str {
        "dominators"
    }

    fn kind(&self) -> PassKind {
        PassKind::DOMINATORS
    }

    fn requires(&self) -> PassKind {
        PassKind::CFG
    }

    fn run(&self, func: &mut Function) -> Result<bool> {
        compute_dominators(&mut func.blocks);
        Ok(false)
    }
}

/// Liveness analysis as a pipeline pass.
pub struct LivenessPass;

impl Pass for LivenessPass {
    fn name(&self) -> &'static str {
        "liveness"
    }

    fn kind(&self) -> PassKind {
        PassKind::LIVENESS
    }

    fn requires(&self) -> PassKind {
        PassKind::CFG.union(PassKind::DOMINATORS)
    }

    fn run(&self, func: &mut Function) -> Result<bool> {
        compute_liveness(func);
        Ok(false)
    }
}

/// Register allocation as a pipeline pass.
pub struct RegAllocPass;

impl Pass for RegAllocPass {
    fn name(&self) -> &'static str {
        "regalloc"
    }

    fn kind(&self) -> PassKind {
        PassKind::REG_ALLOC
    }

    fn requires(&self) -> PassKind {
        PassKind::CFG
            .union(PassKind::DOMINATORS)
            .union(PassKind::LIVENESS)
    }

    fn run(&self, func: &mut Function) -> Result<bool> {
        let old = func.bounds().register_end;
        let new = allocate_registers(func)?;
        Ok(new < old)
    }
}

/// The ordered pass sequence applied to every function unit.
pub struct Optimizer {
    passes: Vec<Box<dyn Pass>>,
}

impl Optimizer {
    /// The full built-in pipeline: CFG, dominators, liveness, allocation.
    #[must_use]
    pub fn new() -> Self {
        let mut optimizer = Self::empty();
        optimizer.add_pass(Box::new(CfgPass));
        optimizer.add_pass(Box::new(DominatorPass));
        optimizer.add_pass(Box::new(LivenessPass));
        optimizer.add_pass(Box::new(RegAllocPass));
        optimizer
    }

    /// An optimizer with no passes registered.
    #[must_use]
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    /// Appends a pass to the sequence.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs the pass sequence over every function, in order.
    ///
    /// # Errors
    ///
    /// Returns the first pass error; remaining functions are not processed.
    pub fn run(&self, functions: &mut [Function]) -> Result<()> {
        functions.iter_mut().try_for_each(|func| self.run_one(func))
    }

    /// Runs the pass sequence over the functions in parallel. Functions are
    /// independent units, so the result is identical to [`Optimizer::run`].
    ///
    /// # Errors
    ///
    /// Returns one of the pass errors if any function fails.
    pub fn run_parallel(&self, functions: &mut [Function]) -> Result<()> {
        functions
            .par_iter_mut()
            .try_for_each(|func| self.run_one(func))
    }

    /// Runs the full sequence on one unit, tracking completion.
    ///
    /// # Panics
    ///
    /// Panics if a pass is sequenced before one it requires.
    fn run_one(&self, func: &mut Function) -> Result<()> {
        let mut completed = PassKind::empty();

        for pass in &self.passes {
            assert!(
                completed.contains(pass.requires()),
                "pass {} run out of order",
                pass.name()
            );

            let changed = pass.run(func)?;
            completed.insert(pass.kind());
            debug!(pass = pass.name(), changed, "pass complete");
        }

        Ok(())
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}
