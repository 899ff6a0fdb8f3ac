//! End-to-end pipeline tests over the public API.
//!
//! Each test drives a small hand-assembled function through the full pass
//! sequence (decode, CFG, dominators, liveness, allocation) and checks the
//! combined outcome: graph shape, dominance, liveness facts and the
//! rewritten register file.

use bytepress::{analysis::regalloc::allocate_with_budget, prelude::*};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Boundaries used throughout: index 0 is the argument, 1-3 are registers,
/// 4-7 identifiers, 8-11 constants.
fn decoded(code: &[u8]) -> Function {
    let flags = FunctionFlags::empty();
    let bounds = LiteralBoundaries::new(flags, 1, 4, 8, 12, 320, 8).unwrap();
    let mut func = Function::new(flags, bounds, LiteralPool::new(vec![0; 320]), code.to_vec());
    func.decode(&OpcodeTable::default_set()).unwrap();
    func
}

fn optimized(code: &[u8]) -> Function {
    trace_init();
    let mut funcs = vec![decoded(code)];
    Optimizer::new().run(&mut funcs).unwrap();
    funcs.pop().unwrap()
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

// move r1, [8]; push r1; store r2; push r2; return; end -- two registers
// with disjoint lifetimes.
const CHAIN: &[u8] = &[0x06, 1, 8, 0x02, 1, 0x07, 2, 0x02, 2, 0x0C, 0x00];

#[test]
fn straight_line_function() {
    let func = optimized(CHAIN);

    // start -> B0 -> end, with B0 holding every instruction.
    let live: Vec<_> = func.blocks.live_blocks().collect();
    assert_eq!(live.len(), 3);

    let body = block_of(&func, 0);
    assert_eq!(func.blocks.block(body).insts, vec![0, 1, 2, 3, 4]);
    assert!(has_edge(&func, func.blocks.start(), body));
    assert!(has_edge(&func, body, func.blocks.end().unwrap()));

    // dom(B0) = {start, B0}.
    let doms = func.blocks.block(body).doms.as_ref().unwrap();
    assert_eq!(doms.count(), 2);
    assert!(doms.contains(func.blocks.start().index()));
    assert!(doms.contains(body.index()));

    // No cross-block register use, so every live-out set is empty.
    for block in func.blocks.live_blocks() {
        assert!(block.live_out.as_ref().unwrap().is_empty());
    }
}

#[test]
fn if_else_diamond() {
    // push [8]; brfalse +7; move r1, [8]; jump +5; move r1, [9];
    // push r1; return; end
    let func = optimized(&[
        0x02, 8, 0x16, 7, 0x06, 1, 8, 0x10, 5, 0x06, 1, 9, 0x02, 1, 0x0C, 0x00,
    ]);

    let cond = block_of(&func, 1);
    let case1 = block_of(&func, 2);
    let case2 = block_of(&func, 4);
    let merge = block_of(&func, 5);

    assert!(has_edge(&func, cond, case1));
    assert!(has_edge(&func, cond, case2));
    assert!(has_edge(&func, case1, merge));
    assert!(has_edge(&func, case2, merge));

    assert_eq!(func.blocks.block(merge).idom, Some(cond));

    // The register written by both arms is live into the merge.
    for arm in [case1, case2] {
        let out = func.blocks.block(arm).live_out.as_ref().unwrap();
        assert!(out.contains(1));
        assert_eq!(out.count(), 1);
    }
}

#[test]
fn while_loop_with_break() {
    // while (c) { if (b) break; <pad>; }
    let func = optimized(&[
        0x10, 10, // 0: enter the test
        0x0B, 6, // 2: body: push a property
        0x16, 4, // 4: if false, skip the break
        0x10, 8, // 6: break
        0x04, // 8: pad
        0x05, // 9: pad
        0x0B, 7, // 10: test
        0x19, 10, // 12: branch back to the body
        0x0D, // 14: exit
        0x00,
    ]);

    let body = block_of(&func, 1);
    let brk = block_of(&func, 3);
    let rest = block_of(&func, 4);
    let test = block_of(&func, 6);
    let exit = block_of(&func, 8);

    assert_eq!(func.blocks.block(test).kind, BlockKind::LoopTest);
    assert_eq!(func.blocks.block(body).kind, BlockKind::LoopBody);

    // The break wires to the loop exit exactly once and never to the test.
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
    assert!(!has_edge(&func, brk, test));
    assert!(has_edge(&func, rest, test));
}

#[test]
fn disjoint_ranges_collapse_to_one_register() {
    let func = optimized(CHAIN);

    // r1 dies as r2 is born; both land in one slot.
    assert_eq!(func.bounds().register_end, 2);
    assert_eq!(func.instructions[2].write_reg, Some(1));
    assert_eq!(func.instructions[4].read_regs, vec![1]);

    // The freed slots moved everything behind them down.
    assert_eq!(func.instructions[0].operands.literals[1].index, 6);
    assert_eq!(func.bounds().ident_end, 6);

    for inst in &func.instructions {
        for &reg in &inst.read_regs {
            assert!(reg < func.bounds().register_end);
        }
        if let Some(reg) = inst.write_reg {
            assert!(reg < func.bounds().register_end);
        }
    }
}

#[test]
fn overlapping_ranges_exceeding_the_budget_signal_pressure() {
    trace_init();

    let mut func = decoded(&[]);
    func.live_ranges.insert(1, vec![LiveInterval { start: 0, end: 10 }]);
    func.live_ranges.insert(2, vec![LiveInterval { start: 2, end: 12 }]);
    func.live_ranges.insert(3, vec![LiveInterval { start: 4, end: 8 }]);

    let err = allocate_with_budget(&mut func, 2).unwrap_err();
    assert!(matches!(
        err,
        Error::RegisterPressure {
            needed: 3,
            available: 2
        }
    ));

    // With the full budget the same ranges allocate, each to its own slot.
    assert_eq!(allocate_with_budget(&mut func, 3).unwrap(), 4);
}

#[test]
fn snapshot_optimize_round_trip() {
    trace_init();
    let table = OpcodeTable::default_set();

    // One CHAIN function with narrow-width boundaries and a 16-entry pool.
    let mut container = Vec::new();
    container.extend_from_slice(b"BPRS");
    container.extend_from_slice(&1u16.to_le_bytes());
    container.extend_from_slice(&1u32.to_le_bytes());
    container.extend_from_slice(&0u16.to_le_bytes());
    container.extend_from_slice(&[1, 4, 8, 12, 16, 8]);
    for value in 0..16u64 {
        container.extend_from_slice(&value.to_le_bytes());
    }
    container.extend_from_slice(&(CHAIN.len() as u32).to_le_bytes());
    container.extend_from_slice(CHAIN);

    let path = std::env::temp_dir().join("bytepress_pipeline_roundtrip.snapshot");
    std::fs::write(&path, &container).unwrap();

    let mut snapshot = Snapshot::open(&path).unwrap();
    for func in snapshot.functions_mut() {
        func.decode(&table).unwrap();
    }
    Optimizer::new()
        .run_parallel(snapshot.functions_mut())
        .unwrap();
    snapshot.write(&path, &table).unwrap();

    let reread = Snapshot::open(&path).unwrap();
    let func = &reread.functions()[0];
    assert_eq!(func.bounds().register_end, 2);
    assert_eq!(func.pool().len(), 14);

    std::fs::remove_file(&path).ok();
}
