//! Basic blocks and the control flow graph.
//!
//! Blocks live in a [`BlockArena`]: a flat vector owned by the function unit,
//! indexed by stable [`BlockId`]s. Predecessor and successor lists store ids,
//! not references, so the cyclic graph a loop produces needs no ownership
//! tricks and blocks can be unlinked without invalidating anything else.
//!
//! Construction itself lives in [`builder`]; this module holds the graph
//! representation and the edge/cleanup operations every pass shares.

mod builder;

pub use builder::build_cfg;

use strum::Display;

use crate::utils::BitSet;

/// Stable index of a block within its arena.
///
/// Id 0 is the synthetic entry sentinel; the exit sentinel takes the highest
/// id once construction completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// The arena slot this id names.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Rebuilds an id from an arena slot index, as stored in block bit sets.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Structural role a block was created for.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    /// Plain straight-line code.
    #[default]
    None,
    /// Synthetic entry sentinel.
    Start,
    /// Synthetic exit sentinel.
    End,
    /// Loop condition test.
    LoopTest,
    /// Loop body entry.
    LoopBody,
    /// Synthesized continue target at a loop body's tail.
    LoopUpdate,
    /// Fall-through case of a conditional branch.
    CondCase1,
    /// Taken case of a two-armed conditional branch.
    CondCase2,
    /// Protected region of a try.
    Try,
    /// Catch handler entry.
    Catch,
    /// Finally handler entry.
    Finally,
}

/// A maximal straight-line run of instructions.
///
/// Instructions are referenced by their index in the owning function's
/// instruction list; the arena never stores instruction data itself.
#[derive(Debug)]
pub struct BasicBlock {
    id: BlockId,
    /// Structural role tag.
    pub kind: BlockKind,
    /// Indices into the function's instruction list, in stream order.
    pub insts: Vec<usize>,
    /// Predecessor block ids.
    pub preds: Vec<BlockId>,
    /// Successor block ids.
    pub succs: Vec<BlockId>,
    removed: bool,

    /// Dominator set over block ids, filled by dominator analysis.
    pub doms: Option<BitSet>,
    /// Immediate dominator, absent for the entry sentinel.
    pub idom: Option<BlockId>,
    /// Registers written in this block, filled by liveness.
    pub kill: Option<BitSet>,
    /// Registers read before any local write, filled by liveness.
    pub ue: Option<BitSet>,
    /// Registers live on exit, filled by liveness.
    pub live_out: Option<BitSet>,
}

impl BasicBlock {
    fn new(id: BlockId, kind: BlockKind) -> Self {
        Self {
            id,
            kind,
            insts: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            removed: false,
            doms: None,
            idom: None,
            kill: None,
            ue: None,
            live_out: None,
        }
    }

    /// This block's id.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Returns `true` once the block has been unlinked from the graph.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.removed
    }

    /// Returns `true` for the entry and exit sentinels.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, BlockKind::Start | BlockKind::End)
    }

    /// Index of this block's first instruction, if it has any.
    #[must_use]
    pub fn first_inst(&self) -> Option<usize> {
        self.insts.first().copied()
    }

    /// Index of this block's last instruction, if it has any.
    #[must_use]
    pub fn last_inst(&self) -> Option<usize> {
        self.insts.last().copied()
    }
}

/// The function-owned collection of basic blocks.
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<BasicBlock>,
}

impl BlockArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Allocates a fresh block and returns its id.
    pub fn alloc(&mut self, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, kind));
        id
    }

    /// Number of arena slots, removed blocks included. Dominator sets size
    /// their universe from this.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if no block was ever allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Borrows a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Mutably borrows a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Iterates the blocks still part of the graph.
    pub fn live_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(|b| !b.removed)
    }

    /// Ids of the blocks still part of the graph.
    pub fn live_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.live_blocks().map(BasicBlock::id)
    }

    /// The entry sentinel.
    ///
    /// # Panics
    ///
    /// Panics if the arena holds no blocks.
    #[must_use]
    pub fn start(&self) -> BlockId {
        assert!(!self.blocks.is_empty(), "arena has no entry sentinel");
        debug_assert_eq!(self.blocks[0].kind, BlockKind::Start);
        BlockId(0)
    }

    /// The exit sentinel, once construction has allocated it.
    #[must_use]
    pub fn end(&self) -> Option<BlockId> {
        self.blocks
            .iter()
            .rev()
            .find(|b| b.kind == BlockKind::End && !b.removed)
            .map(BasicBlock::id)
    }

    /// Adds the edge `from -> to`, keeping both directions symmetric.
    /// Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if self.blocks[from.index()].succs.contains(&to) {
            debug_assert!(self.blocks[to.index()].preds.contains(&from));
            return;
        }
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
    }

    /// Removes the edge `from -> to` from both sides, if present.
    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].succs.retain(|&s| s != to);
        self.blocks[to.index()].preds.retain(|&p| p != from);
    }

    /// Moves the instruction entries from position `at` onward into a fresh
    /// block, transfers the successor edges to it and links the two halves.
    pub fn split_block(&mut self, id: BlockId, at: usize, kind: BlockKind) -> BlockId {
        let new_id = self.alloc(kind);

        let tail: Vec<usize> = self.blocks[id.index()].insts.split_off(at);
        let succs: Vec<BlockId> = std::mem::take(&mut self.blocks[id.index()].succs);

        for succ in succs {
            self.blocks[succ.index()].preds.retain(|&p| p != id);
            self.add_edge(new_id, succ);
        }

        self.blocks[new_id.index()].insts = tail;
        self.add_edge(id, new_id);
        new_id
    }

    /// Unlinks a block from the graph without touching its instruction list.
    fn unlink(&mut self, id: BlockId) {
        let preds: Vec<BlockId> = self.blocks[id.index()].preds.clone();
        let succs: Vec<BlockId> = self.blocks[id.index()].succs.clone();
        for p in preds {
            self.remove_edge(p, id);
        }
        for s in succs {
            self.remove_edge(id, s);
        }
        self.blocks[id.index()].removed = true;
    }

    /// Removes every empty non-sentinel block, rewiring its predecessors
    /// directly to its successors.
    pub fn remove_empty(&mut self) {
        let empties: Vec<BlockId> = self
            .live_blocks()
            .filter(|b| !b.is_sentinel() && b.insts.is_empty())
            .map(BasicBlock::id)
            .collect();

        for id in empties {
            let preds = self.blocks[id.index()].preds.clone();
            let succs = self.blocks[id.index()].succs.clone();
            for &p in &preds {
                for &s in &succs {
                    if p != id && s != id {
                        self.add_edge(p, s);
                    }
                }
            }
            self.unlink(id);
        }
    }

    /// Removes blocks unreachable from the entry sentinel: any non-sentinel
    /// block left without predecessors, cascading until stable.
    pub fn prune_unreachable(&mut self) {
        loop {
            let dead: Vec<BlockId> = self
                .live_blocks()
                .filter(|b| !b.is_sentinel() && b.preds.is_empty())
                .map(BasicBlock::id)
                .collect();

            if dead.is_empty() {
                return;
            }
            for id in dead {
                self.unlink(id);
            }
        }
    }
}
