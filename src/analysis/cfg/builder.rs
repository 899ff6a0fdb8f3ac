//! Structural control flow graph construction.
//!
//! The builder walks the decoded instruction stream once, front to back,
//! recovering the structured shapes the jump encoding flattened: conditional
//! arms and their merge points, loop test/body/update regions, try/catch/
//! finally regions and the for-in/for-of iteration protocol.
//!
//! Instead of recursing, the builder runs an explicit stack of [`Frame`]s.
//! A frame covers one byte range being filled into blocks; entering a nested
//! shape pushes a child frame, and the parent records in a [`Cont`] what to
//! do with the child's entry and exit blocks once it completes. Pending
//! `break`/`continue` edges accumulate in a [`LoopScope`] stack and are
//! backpatched when the owning loop's exit block finally exists.
//!
//! Jump targets that do not land on an instruction boundary are contract
//! violations of the producing front end and panic; they are never runtime
//! errors.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    analysis::cfg::{BlockArena, BlockId, BlockKind},
    bytecode::{Function, InstFlags, Instruction},
};

/// Structural mode of a frame's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOpt {
    /// Plain range.
    None,
    /// Loop test range: stop and return at the first backward jump.
    Direct,
    /// Fall-through arm of a conditional; a trailing out-of-range jump is
    /// the arm's own exit, resolved by the parent.
    CondCase1,
    /// Loop body range; out-of-range jumps are breaks or continues.
    LoopBody,
}

/// What the parent does once a child frame's range is fully built.
#[derive(Debug, Clone, Copy)]
enum Cont {
    /// Outermost frame: wire the exit to the end sentinel.
    Root,
    /// Region jumped over by an in-range forward jump.
    Skip { src: BlockId, target: u32 },
    /// Fall-through arm of a conditional branch.
    CondCase1 { cond: BlockId, branch_target: u32 },
    /// Taken arm of a two-armed conditional.
    CondCase2 { case1_exit: BlockId, merge_at: u32 },
    /// Loop test built ahead of its body.
    LoopTest {
        entry: BlockId,
        body_start: u32,
        body_end: u32,
    },
    /// Loop body; wires the back edge and resolves breaks/continues.
    LoopBody {
        test_entry: BlockId,
        test_exit: BlockId,
        test_conditional: bool,
        next_at: u32,
    },
    /// Protected try region.
    Try { catch_at: u32 },
    /// Catch handler region.
    Catch { try_exit: BlockId, finally_at: u32 },
    /// Finally handler region.
    Finally { try_exit: BlockId, merge_at: u32 },
    /// Iteration-context init expression before the get-next marker.
    CtxInitExpr { ctx_end: u32, get_next_at: u32 },
    /// Iteration-context body; the has-next test is re-homed into `test`.
    CtxBody {
        pred: BlockId,
        test: BlockId,
        has_next_idx: usize,
        ctx_end: u32,
    },
}

/// One byte range being partitioned into blocks.
struct Frame {
    end: u32,
    opt: RangeOpt,
    entry: BlockId,
    current: BlockId,
    cursor: u32,
    cont: Cont,
    /// The current tail already routed its control flow (break, continue,
    /// or a pending offset edge); no fall-through edge must be wired.
    diverted: bool,
    /// Trailing out-of-range jump target, reported to the parent.
    breaks_out: Option<u32>,
    finished: bool,
}

/// Completion summary handed to the parent's continuation.
struct Done {
    entry: BlockId,
    exit: BlockId,
    cursor: u32,
    breaks_out: Option<u32>,
    diverted: bool,
}

/// Pending `break`/`continue` edges of one loop under construction.
struct LoopScope {
    test_entry: BlockId,
    /// Classification boundary: targets at or past this offset are breaks.
    test_end: u32,
    /// Natural end of the body range; continues targeting it go straight
    /// to the test block.
    body_end: u32,
    breaks: Vec<BlockId>,
    continues: Vec<(BlockId, u32)>,
}

struct Builder<'a> {
    insts: &'a [Instruction],
    offsets: &'a HashMap<u32, usize>,
    code_end: u32,
    arena: BlockArena,
    frames: Vec<Frame>,
    loops: Vec<LoopScope>,
    /// Edges to blocks that do not exist yet, keyed by target offset.
    pending: Vec<(BlockId, u32)>,
}

/// Builds the basic-block graph for a decoded function, replacing any prior
/// content of its block arena, and flags instructions left outside every
/// reachable block as [`InstFlags::DEAD`].
///
/// # Panics
///
/// Panics if a jump target is not an instruction boundary or a structural
/// marker is malformed; the input is produced by a trusted front end.
pub fn build_cfg(func: &mut Function) {
    let mut builder = Builder {
        insts: &func.instructions,
        offsets: &func.offset_map,
        code_end: func.instructions.last().map_or(0, Instruction::next_offset),
        arena: BlockArena::new(),
        frames: Vec::new(),
        loops: Vec::new(),
        pending: Vec::new(),
    };
    builder.run();

    let arena = builder.arena;

    let mut in_block = vec![false; func.instructions.len()];
    for block in arena.live_blocks() {
        for &idx in &block.insts {
            in_block[idx] = true;
        }
    }
    for (idx, inst) in func.instructions.iter_mut().enumerate() {
        if !in_block[idx] {
            inst.add_flag(InstFlags::DEAD);
        }
    }

    debug!(
        blocks = arena.live_blocks().count(),
        dead = in_block.iter().filter(|&&v| !v).count(),
        "constructed control flow graph"
    );
    func.blocks = arena;
}

impl Builder<'_> {
    fn run(&mut self) {
        let start = self.arena.alloc(BlockKind::Start);

        if self.insts.is_empty() {
            let end = self.arena.alloc(BlockKind::End);
            self.arena.add_edge(start, end);
            return;
        }

        let entry = self.arena.alloc(BlockKind::None);
        self.arena.add_edge(start, entry);
        self.frames.push(Frame {
            end: self.code_end,
            opt: RangeOpt::None,
            entry,
            current: entry,
            cursor: 0,
            cont: Cont::Root,
            diverted: false,
            breaks_out: None,
            finished: false,
        });

        while !self.frames.is_empty() {
            if let Some(done) = self.step() {
                let frame = self.frames.pop().unwrap();
                self.apply(frame.cont, done);
            }
        }

        self.resolve_pending();
        self.arena.remove_empty();
        self.arena.prune_unreachable();
    }

    /// Advances the top frame by one instruction or shape. Returns the
    /// completion summary once the frame's range is exhausted.
    fn step(&mut self) -> Option<Done> {
        let fi = self.frames.len() - 1;

        if self.frames[fi].finished || self.frames[fi].cursor >= self.frames[fi].end {
            let f = &self.frames[fi];
            return Some(Done {
                entry: f.entry,
                exit: f.current,
                cursor: f.cursor,
                breaks_out: f.breaks_out,
                diverted: f.diverted,
            });
        }

        let cursor = self.frames[fi].cursor;
        let idx = self.index(cursor);
        let insts = self.insts;
        let inst = &insts[idx];

        if !inst.is_jump() {
            let current = self.frames[fi].current;
            self.arena.block_mut(current).insts.push(idx);
            self.frames[fi].cursor = inst.next_offset();
            return None;
        }

        let target = inst.jump_target();

        if inst.has(InstFlags::TRY_START) {
            self.enter_try(fi, idx);
        } else if inst.has(InstFlags::CTX_INIT) {
            self.enter_ctx(fi, idx);
        } else if target <= inst.offset {
            if self.frames[fi].opt == RangeOpt::Direct {
                let current = self.frames[fi].current;
                self.arena.block_mut(current).insts.push(idx);
                self.frames[fi].cursor = inst.next_offset();
                self.frames[fi].finished = true;
            } else {
                self.enter_backjump(fi, idx);
            }
        } else if inst.is_conditional_jump() {
            self.enter_cond(fi, idx);
        } else if target >= self.frames[fi].end {
            self.leave_range(fi, idx);
        } else {
            self.enter_forward(fi, idx);
        }

        None
    }

    /// Conditional forward branch: either an in-range two-arm shape or a
    /// conditional exit out of the enclosing construct.
    fn enter_cond(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let target = inst.jump_target();
        let next = inst.next_offset();
        let cond = self.frames[fi].current;
        self.arena.block_mut(cond).insts.push(idx);

        if target > self.frames[fi].end {
            // Conditional break/continue: the taken edge leaves the range,
            // the fall-through stays in this frame.
            if !self.record_loop_exit(cond, target) {
                self.pending.push((cond, target));
            }
            let fall = self.arena.alloc(BlockKind::None);
            self.arena.add_edge(cond, fall);
            self.frames[fi].current = fall;
            self.frames[fi].cursor = next;
            return;
        }

        let arm = self.arena.alloc(BlockKind::CondCase1);
        self.frames.push(Frame {
            end: target,
            opt: RangeOpt::CondCase1,
            entry: arm,
            current: arm,
            cursor: next,
            cont: Cont::CondCase1 {
                cond,
                branch_target: target,
            },
            diverted: false,
            breaks_out: None,
            finished: false,
        });
    }

    /// Unconditional forward jump staying inside the range: a loop entry
    /// jump when the jumped-to region ends with a matching back edge, a
    /// plain skip otherwise.
    fn enter_forward(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let target = inst.jump_target();
        let current = self.frames[fi].current;
        self.arena.block_mut(current).insts.push(idx);

        if self.is_loop_entry(idx) {
            let test = self.arena.alloc(BlockKind::LoopTest);
            self.frames.push(Frame {
                end: self.frames[fi].end,
                opt: RangeOpt::Direct,
                entry: test,
                current: test,
                cursor: target,
                cont: Cont::LoopTest {
                    entry: current,
                    body_start: inst.next_offset(),
                    body_end: target,
                },
                diverted: false,
                breaks_out: None,
                finished: false,
            });
            return;
        }

        // Plain skip: build the jumped-over region anyway. If nothing else
        // reaches it, pruning removes it and the dead sweep flags it.
        let region = self.arena.alloc(BlockKind::None);
        self.frames.push(Frame {
            end: target,
            opt: RangeOpt::CondCase1,
            entry: region,
            current: region,
            cursor: inst.next_offset(),
            cont: Cont::Skip {
                src: current,
                target,
            },
            diverted: false,
            breaks_out: None,
            finished: false,
        });
    }

    /// Does the region this jump skips end with a backward branch into it?
    fn is_loop_entry(&self, jump_idx: usize) -> bool {
        let jump = &self.insts[jump_idx];
        let target = jump.jump_target();
        let frame_end = self.frames.last().map_or(self.code_end, |f| f.end);

        let mut idx = self.index(target);
        while idx < self.insts.len() && self.insts[idx].offset < frame_end {
            let inst = &self.insts[idx];
            if inst.is_jump() {
                if inst.jump_target() > inst.offset {
                    return false;
                }
                let back = inst.jump_target();
                return back >= jump.next_offset() && back < target;
            }
            idx += 1;
        }
        false
    }

    /// Unconditional forward jump leaving the range: a conditional arm's
    /// exit jump when trailing under `CondCase1`, otherwise a break,
    /// continue, or jump to the range's own continuation.
    fn leave_range(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let target = inst.jump_target();
        let next = inst.next_offset();
        let end = self.frames[fi].end;
        let current = self.frames[fi].current;
        self.arena.block_mut(current).insts.push(idx);

        if self.frames[fi].opt == RangeOpt::CondCase1 && next >= end {
            self.frames[fi].breaks_out = Some(target);
            self.frames[fi].diverted = true;
            self.frames[fi].cursor = end;
            return;
        }

        // The target block may not exist yet, and `skip_dead` can replace
        // `current` as the frame's exit when the dead tail holds another
        // jump, so the edge is always deferred to `resolve_pending`.
        if !self.record_loop_exit(current, target) {
            self.pending.push((current, target));
        }
        self.frames[fi].diverted = true;
        self.frames[fi].cursor = next;
        self.skip_dead(fi);
    }

    /// Classifies an out-of-range jump against the innermost loop.
    /// Returns `false` when no loop encloses the jump.
    fn record_loop_exit(&mut self, src: BlockId, target: u32) -> bool {
        let Some(scope) = self.loops.last_mut() else {
            return false;
        };
        if target >= scope.test_end {
            scope.breaks.push(src);
        } else {
            scope.continues.push((src, target));
        }
        true
    }

    /// Consumes unreachable instructions after a diverting jump without
    /// placing them in any block, up to the next leader.
    fn skip_dead(&mut self, fi: usize) {
        loop {
            let cursor = self.frames[fi].cursor;
            let end = self.frames[fi].end;
            if cursor >= end {
                return;
            }

            if self.frames[fi].opt == RangeOpt::LoopBody {
                let is_continue_target = self
                    .loops
                    .last()
                    .is_some_and(|s| s.continues.iter().any(|&(_, t)| t == cursor));
                if is_continue_target {
                    let update = self.arena.alloc(BlockKind::LoopUpdate);
                    self.frames[fi].current = update;
                    self.frames[fi].diverted = false;
                    return;
                }
            }

            let idx = self.index(cursor);
            if self.insts[idx].is_jump() {
                let block = self.arena.alloc(BlockKind::None);
                self.frames[fi].current = block;
                self.frames[fi].diverted = false;
                return;
            }
            self.frames[fi].cursor = self.insts[idx].next_offset();
        }
    }

    /// Backward jump met in plain scanning: a bottom-tested loop. The
    /// target block (or the split tail holding it) becomes the loop head.
    fn enter_backjump(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let target = inst.jump_target();
        let conditional = inst.is_conditional_jump();
        let next = inst.next_offset();
        let current = self.frames[fi].current;
        self.arena.block_mut(current).insts.push(idx);

        let head = self.block_at(self.index(target), BlockKind::LoopBody);
        let src = if self.arena.block(head).insts.contains(&idx) {
            head
        } else {
            current
        };
        self.arena.add_edge(src, head);

        let after = self.arena.alloc(BlockKind::None);
        if conditional {
            self.arena.add_edge(src, after);
        }
        self.frames[fi].current = after;
        self.frames[fi].cursor = next;
        self.frames[fi].diverted = false;
    }

    fn enter_try(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let catch_at = inst.jump_target();
        let current = self.frames[fi].current;
        self.arena.block_mut(current).insts.push(idx);

        let body = self.arena.alloc(BlockKind::Try);
        self.arena.add_edge(current, body);
        self.frames.push(Frame {
            end: catch_at,
            opt: RangeOpt::CondCase1,
            entry: body,
            current: body,
            cursor: inst.next_offset(),
            cont: Cont::Try { catch_at },
            diverted: false,
            breaks_out: None,
            finished: false,
        });
    }

    fn enter_ctx(&mut self, fi: usize, idx: usize) {
        let insts = self.insts;
        let inst = &insts[idx];
        let ctx_end = inst.jump_target();
        let next = inst.next_offset();
        let current = self.frames[fi].current;
        self.arena.block_mut(current).insts.push(idx);

        let get_next_at = self
            .find_marker(next, ctx_end, InstFlags::CTX_GET_NEXT)
            .unwrap_or_else(|| panic!("iteration context at {:#x} has no get-next", inst.offset));

        if get_next_at > next {
            let expr = self.arena.alloc(BlockKind::None);
            self.arena.add_edge(current, expr);
            self.frames.push(Frame {
                end: get_next_at,
                opt: RangeOpt::CondCase1,
                entry: expr,
                current: expr,
                cursor: next,
                cont: Cont::CtxInitExpr {
                    ctx_end,
                    get_next_at,
                },
                diverted: false,
                breaks_out: None,
                finished: false,
            });
        } else {
            self.start_ctx_body(current, get_next_at, ctx_end);
        }
    }

    /// Sets up the body frame of an iteration context, synthesizing the
    /// loop-test block the trailing has-next instruction will move into.
    fn start_ctx_body(&mut self, pred: BlockId, get_next_at: u32, ctx_end: u32) {
        let has_next_at = self
            .find_marker(get_next_at, ctx_end, InstFlags::CTX_HAS_NEXT)
            .unwrap_or_else(|| {
                panic!("iteration context body at {get_next_at:#x} has no has-next")
            });
        let has_next_idx = self.index(has_next_at);
        debug_assert_eq!(self.insts[has_next_idx].jump_target(), get_next_at);

        let test = self.arena.alloc(BlockKind::LoopTest);
        self.loops.push(LoopScope {
            test_entry: test,
            test_end: ctx_end,
            body_end: has_next_at,
            breaks: Vec::new(),
            continues: Vec::new(),
        });

        let body = self.arena.alloc(BlockKind::LoopBody);
        self.frames.push(Frame {
            end: has_next_at,
            opt: RangeOpt::LoopBody,
            entry: body,
            current: body,
            cursor: get_next_at,
            cont: Cont::CtxBody {
                pred,
                test,
                has_next_idx,
                ctx_end,
            },
            diverted: false,
            breaks_out: None,
            finished: false,
        });
    }

    fn find_marker(&self, from: u32, to: u32, flag: InstFlags) -> Option<u32> {
        let mut idx = self.index(from);
        while idx < self.insts.len() && self.insts[idx].offset < to {
            if self.insts[idx].has(flag) {
                return Some(self.insts[idx].offset);
            }
            idx += 1;
        }
        None
    }

    fn apply(&mut self, cont: Cont, done: Done) {
        match cont {
            Cont::Root => {
                let end = self.arena.alloc(BlockKind::End);
                self.wire_exit(&done, end, self.code_end);
            }
            Cont::Skip { src, target } => {
                let merge = self.arena.alloc(BlockKind::None);
                self.arena.add_edge(src, merge);
                self.wire_exit(&done, merge, target);
                self.resume(merge, target);
            }
            Cont::CondCase1 {
                cond,
                branch_target,
            } => {
                self.arena.add_edge(cond, done.entry);
                match done.breaks_out {
                    Some(exit_target)
                        if exit_target <= self.frames.last().map_or(self.code_end, |f| f.end) =>
                    {
                        // If/else: the arm's exit jump marks the merge; the
                        // branch target starts the second arm.
                        let arm2 = self.arena.alloc(BlockKind::CondCase2);
                        self.arena.add_edge(cond, arm2);
                        self.frames.push(Frame {
                            end: exit_target,
                            opt: RangeOpt::CondCase1,
                            entry: arm2,
                            current: arm2,
                            cursor: branch_target,
                            cont: Cont::CondCase2 {
                                case1_exit: done.exit,
                                merge_at: exit_target,
                            },
                            diverted: false,
                            breaks_out: None,
                            finished: false,
                        });
                    }
                    _ => {
                        // If without else (or an arm diverted into a loop
                        // exit): the branch target is the merge point.
                        let merge = self.arena.alloc(BlockKind::None);
                        self.arena.add_edge(cond, merge);
                        self.wire_exit(&done, merge, branch_target);
                        self.resume(merge, branch_target);
                    }
                }
            }
            Cont::CondCase2 {
                case1_exit,
                merge_at,
            } => {
                let merge = self.arena.alloc(BlockKind::None);
                self.arena.add_edge(case1_exit, merge);
                self.wire_exit(&done, merge, merge_at);
                self.resume(merge, merge_at);
            }
            Cont::LoopTest {
                entry,
                body_start,
                body_end,
            } => {
                let test_exit = done.exit;
                let back_idx = self
                    .arena
                    .block(test_exit)
                    .last_inst()
                    .expect("loop test range produced no instructions");
                let back = &self.insts[back_idx];
                assert!(
                    back.is_jump() && back.jump_target() <= back.offset,
                    "loop test at {body_end:#x} does not end in a back edge"
                );
                let conditional = back.is_conditional_jump();
                debug_assert_eq!(back.jump_target(), body_start);

                self.arena.add_edge(entry, done.entry);
                self.loops.push(LoopScope {
                    test_entry: done.entry,
                    test_end: done.cursor,
                    body_end,
                    breaks: Vec::new(),
                    continues: Vec::new(),
                });

                let body = self.arena.alloc(BlockKind::LoopBody);
                self.frames.push(Frame {
                    end: body_end,
                    opt: RangeOpt::LoopBody,
                    entry: body,
                    current: body,
                    cursor: body_start,
                    cont: Cont::LoopBody {
                        test_entry: done.entry,
                        test_exit,
                        test_conditional: conditional,
                        next_at: done.cursor,
                    },
                    diverted: false,
                    breaks_out: None,
                    finished: false,
                });
            }
            Cont::LoopBody {
                test_entry,
                test_exit,
                test_conditional,
                next_at,
            } => {
                self.arena.add_edge(test_exit, done.entry);
                if !done.diverted {
                    self.arena.add_edge(done.exit, test_entry);
                }

                let next = self.arena.alloc(BlockKind::None);
                if test_conditional {
                    self.arena.add_edge(test_exit, next);
                }
                self.resolve_loop(next);
                self.resume(next, next_at);
            }
            Cont::Try { catch_at } => {
                let insts = self.insts;
                let catch_idx = self.index(catch_at);
                let catch_inst = &insts[catch_idx];
                assert!(
                    catch_inst.has(InstFlags::TRY_CATCH),
                    "try region at {catch_at:#x} is not followed by a catch marker"
                );
                let finally_at = catch_inst.jump_target();

                let handler = self.arena.alloc(BlockKind::Catch);
                self.arena.block_mut(handler).insts.push(catch_idx);
                // Exceptional edge out of the protected region.
                self.arena.add_edge(done.exit, handler);

                self.frames.push(Frame {
                    end: finally_at,
                    opt: RangeOpt::CondCase1,
                    entry: handler,
                    current: handler,
                    cursor: catch_inst.next_offset(),
                    cont: Cont::Catch {
                        try_exit: done.exit,
                        finally_at,
                    },
                    diverted: false,
                    breaks_out: None,
                    finished: false,
                });
            }
            Cont::Catch {
                try_exit,
                finally_at,
            } => {
                let insts = self.insts;
                let finally_idx = self.offsets.get(&finally_at).copied();
                let finally_inst = finally_idx.map(|i| &insts[i]);

                if let (Some(fin_idx), Some(fin)) = (finally_idx, finally_inst) {
                    if fin.has(InstFlags::TRY_FINALLY) {
                        let merge_at = fin.jump_target();
                        let cleanup = self.arena.alloc(BlockKind::Finally);
                        self.arena.block_mut(cleanup).insts.push(fin_idx);
                        self.wire_exit(&done, cleanup, finally_at);

                        self.frames.push(Frame {
                            end: merge_at,
                            opt: RangeOpt::CondCase1,
                            entry: cleanup,
                            current: cleanup,
                            cursor: fin.next_offset(),
                            cont: Cont::Finally { try_exit, merge_at },
                            diverted: false,
                            breaks_out: None,
                            finished: false,
                        });
                        return;
                    }
                }

                let merge = self.arena.alloc(BlockKind::None);
                self.arena.add_edge(try_exit, merge);
                self.wire_exit(&done, merge, finally_at);
                self.resume(merge, finally_at);
            }
            Cont::Finally { try_exit, merge_at } => {
                let merge = self.arena.alloc(BlockKind::None);
                self.arena.add_edge(try_exit, merge);
                self.wire_exit(&done, merge, merge_at);
                self.resume(merge, merge_at);
            }
            Cont::CtxInitExpr {
                ctx_end,
                get_next_at,
            } => {
                self.start_ctx_body(done.exit, get_next_at, ctx_end);
            }
            Cont::CtxBody {
                pred,
                test,
                has_next_idx,
                ctx_end,
            } => {
                self.arena.block_mut(test).insts.push(has_next_idx);
                self.arena.add_edge(pred, test);
                self.arena.add_edge(test, done.entry);
                if !done.diverted {
                    self.arena.add_edge(done.exit, test);
                }

                let next = self.arena.alloc(BlockKind::None);
                self.arena.add_edge(test, next);
                self.resolve_loop(next);
                self.resume(next, ctx_end);
            }
        }
    }

    /// Points the (new top) parent frame at a freshly created merge block.
    fn resume(&mut self, block: BlockId, at: u32) {
        let fi = self.frames.len() - 1;
        self.frames[fi].current = block;
        self.frames[fi].cursor = at;
        self.frames[fi].diverted = false;
    }

    /// Wires a completed child's exit into its merge block, or routes a
    /// diverted tail through the loop scopes / pending list instead.
    fn wire_exit(&mut self, done: &Done, merge: BlockId, merge_at: u32) {
        match done.breaks_out {
            Some(target) if target != merge_at => {
                if !self.record_loop_exit(done.exit, target) {
                    self.pending.push((done.exit, target));
                }
            }
            Some(_) => self.arena.add_edge(done.exit, merge),
            None if !done.diverted => self.arena.add_edge(done.exit, merge),
            None => {}
        }
    }

    /// Pops the innermost loop scope and backpatches its break and continue
    /// edges now that the exit block exists.
    fn resolve_loop(&mut self, exit: BlockId) {
        let scope = self.loops.pop().expect("loop completion without a scope");

        for src in scope.breaks {
            self.arena.add_edge(src, exit);
        }
        for (src, target) in scope.continues {
            if target == scope.body_end {
                self.arena.add_edge(src, scope.test_entry);
            } else {
                let update = self.block_at(self.index(target), BlockKind::LoopUpdate);
                self.arena.add_edge(src, update);
            }
        }
    }

    /// The block beginning at instruction `idx`, splitting the containing
    /// block when `idx` sits mid-block.
    fn block_at(&mut self, idx: usize, kind: BlockKind) -> BlockId {
        let located = self.arena.live_blocks().find_map(|b| {
            b.insts
                .iter()
                .position(|&i| i == idx)
                .map(|pos| (b.id(), pos))
        });

        match located {
            Some((id, 0)) => id,
            Some((id, pos)) => self.arena.split_block(id, pos, kind),
            None => panic!(
                "offset {:#x} is not inside any constructed block",
                self.insts[idx].offset
            ),
        }
    }

    fn resolve_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (src, target) in pending {
            let to = if target >= self.code_end {
                self.arena.end().expect("end sentinel not yet allocated")
            } else {
                let idx = self.index(target);
                self.block_at(idx, BlockKind::None)
            };
            self.arena.add_edge(src, to);
        }
    }

    fn index(&self, offset: u32) -> usize {
        match self.offsets.get(&offset) {
            Some(&idx) => idx,
            None => panic!("offset {offset:#x} is not an instruction boundary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{
        ops, Function, FunctionFlags, LiteralBoundaries, LiteralPool, OpcodeTable,
    };

    fn function(code: &[u8]) -> Function {
        let bounds = LiteralBoundaries::new(FunctionFlags::empty(), 1, 4, 8, 12, 320, 8).unwrap();
        let mut func = Function::new(
            FunctionFlags::empty(),
            bounds,
            LiteralPool::new(vec![0; 320]),
            code.to_vec(),
        );
        func.decode(&OpcodeTable::default_set()).unwrap();
        build_cfg(&mut func);
        func
    }

    fn block_of(func: &Function, inst_idx: usize) -> BlockId {
        func.blocks
            .live_blocks()
            .find(|b| b.insts.contains(&inst_idx))
            .unwrap_or_else(|| panic!("instruction {inst_idx} not in any live block"))
            .id()
    }

    fn has_edge(func: &Function, from: BlockId, to: BlockId) -> bool {
        func.blocks.block(from).succs.contains(&to)
    }

    #[test]
    fn straight_line_is_one_block() {
        let func = function(&[
            ops::PUSH_LITERAL as u8,
            5,
            ops::STORE as u8,
            1,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let live: Vec<_> = func.blocks.live_blocks().collect();
        assert_eq!(live.len(), 3);

        let body = block_of(&func, 0);
        assert_eq!(func.blocks.block(body).insts, vec![0, 1, 2]);
        assert!(has_edge(&func, func.blocks.start(), body));
        assert!(has_edge(&func, body, func.blocks.end().unwrap()));
    }

    #[test]
    fn if_else_forms_a_diamond() {
        let func = function(&[
            ops::PUSH_THIS_PROPERTY as u8,
            5,
            ops::BRANCH_IF_FALSE_FORWARD as u8,
            8,
            ops::PUSH_LITERAL as u8,
            9,
            ops::STORE as u8,
            1,
            ops::JUMP_FORWARD as u8,
            6,
            ops::PUSH_LITERAL as u8,
            10,
            ops::STORE as u8,
            1,
            ops::PUSH_LITERAL as u8,
            1,
            ops::POP as u8,
            ops::END_FUNCTION as u8,
        ]);

        let cond = block_of(&func, 1);
        let arm1 = block_of(&func, 2);
        let arm2 = block_of(&func, 5);
        let merge = block_of(&func, 7);

        assert_ne!(arm1, arm2);
        assert!(has_edge(&func, cond, arm1));
        assert!(has_edge(&func, cond, arm2));
        assert!(has_edge(&func, arm1, merge));
        assert!(has_edge(&func, arm2, merge));
        assert_eq!(func.blocks.block(arm1).kind, BlockKind::CondCase1);
        assert_eq!(func.blocks.block(arm2).kind, BlockKind::CondCase2);
    }

    #[test]
    fn if_without_else_merges_at_branch_target() {
        let func = function(&[
            ops::PUSH_THIS_PROPERTY as u8,
            5,
            ops::BRANCH_IF_FALSE_FORWARD as u8,
            4,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let cond = block_of(&func, 1);
        let arm = block_of(&func, 2);
        let merge = block_of(&func, 4);

        assert!(has_edge(&func, cond, arm));
        assert!(has_edge(&func, cond, merge));
        assert!(has_edge(&func, arm, merge));
    }

    #[test]
    fn while_loop_with_break() {
        // while (c) { if (b) break; <pad>; }
        let func = function(&[
            ops::JUMP_FORWARD as u8,
            10,
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::BRANCH_IF_FALSE_FORWARD as u8,
            4,
            ops::JUMP_FORWARD as u8,
            8,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::PUSH_THIS_PROPERTY as u8,
            7,
            ops::BRANCH_IF_TRUE_BACKWARD as u8,
            10,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let entry = block_of(&func, 0);
        let body = block_of(&func, 1);
        let brk = block_of(&func, 3);
        let rest = block_of(&func, 4);
        let test = block_of(&func, 6);
        let exit = block_of(&func, 8);

        assert_eq!(func.blocks.block(test).kind, BlockKind::LoopTest);
        assert_eq!(func.blocks.block(body).kind, BlockKind::LoopBody);

        assert!(has_edge(&func, entry, test));
        assert!(has_edge(&func, test, body));
        assert!(has_edge(&func, test, exit));
        assert!(has_edge(&func, body, brk));
        assert!(has_edge(&func, body, rest));
        assert!(has_edge(&func, rest, test));

        // The break wires to the exit exactly once and never to the test.
        assert_eq!(func.blocks.block(brk).succs, vec![exit]);
        assert_eq!(
            func.blocks
                .block(exit)
                .preds
                .iter()
                .filter(|&&p| p == brk)
                .count(),
            1
        );
    }

    #[test]
    fn while_loop_with_continue_flags_dead_tail() {
        // while (c) { a; continue; <unreachable>; }
        let func = function(&[
            ops::JUMP_FORWARD as u8,
            8,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::JUMP_FORWARD as u8,
            4,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::BRANCH_IF_TRUE_BACKWARD as u8,
            8,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let body = block_of(&func, 1);
        let test = block_of(&func, 6);

        // Continue goes straight to the test; no fall-through duplicate.
        assert_eq!(func.blocks.block(body).succs, vec![test]);

        // The instructions after the continue never made it into a block.
        assert!(func.instructions[4].has(InstFlags::DEAD));
        assert!(func.instructions[5].has(InstFlags::DEAD));
        assert!(!func.instructions[1].has(InstFlags::DEAD));
    }

    #[test]
    fn jump_to_stream_end_keeps_its_exit_edge_over_a_dead_tail() {
        // The jump at offset 1 leaves for the stream end; the dead tail
        // behind it contains another jump. The exit edge must survive the
        // scratch blocks that tail produces.
        let func = function(&[
            ops::PUSH_UNDEFINED as u8,
            ops::JUMP_FORWARD as u8,
            5,
            ops::JUMP_FORWARD as u8,
            2,
            ops::PUSH_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let body = block_of(&func, 0);
        let end = func.blocks.end().unwrap();

        assert_eq!(func.blocks.block(body).insts, vec![0, 1]);
        assert_eq!(func.blocks.block(body).succs, vec![end]);
        assert!(func.blocks.block(end).preds.contains(&body));

        assert!(func.instructions[2].has(InstFlags::DEAD));
        assert!(func.instructions[3].has(InstFlags::DEAD));

        for block in func.blocks.live_blocks() {
            if block.kind != BlockKind::End {
                assert!(!block.succs.is_empty(), "{} has no successor", block.id());
            }
        }
    }

    #[test]
    fn for_in_init_expression_gets_its_own_block() {
        // Instructions sit between the context open and the get-next
        // marker; they form an init-expression block feeding the test.
        let func = function(&[
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_INIT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            0x00,
            0x0E,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_GET_NEXT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            ops::STORE as u8,
            1,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_HAS_NEXT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            0x00,
            0x04,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let init = block_of(&func, 1);
        let expr = block_of(&func, 2);
        let body = block_of(&func, 4);
        let test = block_of(&func, 6);
        let exit = block_of(&func, 7);

        assert_eq!(func.blocks.block(expr).insts, vec![2, 3]);
        assert_eq!(func.blocks.block(body).insts, vec![4, 5]);
        assert_eq!(func.blocks.block(test).kind, BlockKind::LoopTest);
        assert_eq!(func.blocks.block(test).insts, vec![6]);

        assert!(has_edge(&func, init, expr));
        assert!(has_edge(&func, expr, test));
        assert!(has_edge(&func, test, body));
        assert!(has_edge(&func, body, test));
        assert!(has_edge(&func, test, exit));
    }

    #[test]
    fn for_in_rehomes_has_next_into_test_block() {
        let func = function(&[
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_INIT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            0x00,
            0x0C,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_GET_NEXT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            ops::STORE as u8,
            1,
            ops::EXT_ESCAPE,
            (ops::FOR_IN_HAS_NEXT - crate::bytecode::EXT_OPCODE_BASE) as u8,
            0x00,
            0x04,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let init = block_of(&func, 1);
        let body = block_of(&func, 2);
        let test = block_of(&func, 4);
        let exit = block_of(&func, 5);

        assert_eq!(func.blocks.block(test).kind, BlockKind::LoopTest);
        assert_eq!(func.blocks.block(test).insts, vec![4]);
        assert_eq!(func.blocks.block(body).insts, vec![2, 3]);

        assert!(has_edge(&func, init, test));
        assert!(has_edge(&func, test, body));
        assert!(has_edge(&func, body, test));
        assert!(has_edge(&func, test, exit));
    }

    #[test]
    fn try_catch_wiring() {
        let func = function(&[
            ops::TRY_CREATE as u8,
            0x00,
            0x06,
            ops::PUSH_UNDEFINED as u8,
            ops::JUMP_FORWARD as u8,
            7,
            ops::CATCH as u8,
            0x00,
            0x05,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let entry = block_of(&func, 0);
        let body = block_of(&func, 1);
        let handler = block_of(&func, 3);
        let merge = block_of(&func, 6);

        assert_eq!(func.blocks.block(body).kind, BlockKind::Try);
        assert_eq!(func.blocks.block(handler).kind, BlockKind::Catch);

        assert!(has_edge(&func, entry, body));
        assert!(has_edge(&func, body, handler));
        assert!(has_edge(&func, body, merge));
        assert!(has_edge(&func, handler, merge));
    }

    #[test]
    fn try_catch_finally_wiring() {
        let func = function(&[
            ops::TRY_CREATE as u8,
            0x00,
            0x06,
            ops::PUSH_UNDEFINED as u8,
            ops::JUMP_FORWARD as u8,
            10,
            ops::CATCH as u8,
            0x00,
            0x04,
            ops::POP as u8,
            ops::FINALLY as u8,
            0x00,
            0x04,
            ops::PUSH_UNDEFINED as u8,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let body = block_of(&func, 1);
        let handler = block_of(&func, 3);
        let cleanup = block_of(&func, 5);
        let merge = block_of(&func, 7);

        assert_eq!(func.blocks.block(cleanup).kind, BlockKind::Finally);
        assert!(has_edge(&func, body, handler));
        assert!(has_edge(&func, handler, cleanup));
        assert!(has_edge(&func, cleanup, merge));
        assert!(has_edge(&func, body, merge));
    }

    #[test]
    fn skipped_region_is_pruned_and_dead() {
        let func = function(&[
            ops::JUMP_FORWARD as u8,
            4,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        assert!(func.instructions[1].has(InstFlags::DEAD));
        assert!(func.instructions[2].has(InstFlags::DEAD));

        let entry = block_of(&func, 0);
        let tail = block_of(&func, 3);
        assert!(has_edge(&func, entry, tail));
    }

    #[test]
    fn bottom_tested_loop_gets_back_edge() {
        let func = function(&[
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::BRANCH_IF_TRUE_BACKWARD as u8,
            4,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        let head = block_of(&func, 0);
        let after = block_of(&func, 4);

        assert!(has_edge(&func, head, head));
        assert!(has_edge(&func, head, after));
    }

    #[test]
    fn every_live_edge_is_symmetric() {
        let func = function(&[
            ops::JUMP_FORWARD as u8,
            10,
            ops::PUSH_THIS_PROPERTY as u8,
            6,
            ops::BRANCH_IF_FALSE_FORWARD as u8,
            4,
            ops::JUMP_FORWARD as u8,
            8,
            ops::PUSH_UNDEFINED as u8,
            ops::POP as u8,
            ops::PUSH_THIS_PROPERTY as u8,
            7,
            ops::BRANCH_IF_TRUE_BACKWARD as u8,
            10,
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ]);

        for block in func.blocks.live_blocks() {
            for &succ in &block.succs {
                assert!(func.blocks.block(succ).preds.contains(&block.id()));
            }
            for &pred in &block.preds {
                assert!(func.blocks.block(pred).succs.contains(&block.id()));
            }
        }
    }
}
