//! Full-pipeline benchmarks.
//!
//! Measures decode + CFG + dominators + liveness + allocation over
//! synthetic functions: a long straight-line register chain and a
//! loop-heavy shape with break/continue control flow.

use std::hint::black_box;

use bytepress::prelude::*;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

/// `count` repetitions of `move r1, [8]; push r1; store r2; push r2; pop`.
fn chain_code(count: usize) -> Vec<u8> {
    let mut code = Vec::with_capacity(count * 10 + 2);
    for _ in 0..count {
        code.extend_from_slice(&[0x06, 1, 8, 0x02, 1, 0x07, 2, 0x02, 2, 0x05]);
    }
    code.extend_from_slice(&[0x0D, 0x00]);
    code
}

/// `while (c) { if (b) break; <pad>; }`
const LOOP: &[u8] = &[
    0x10, 10, 0x0B, 6, 0x16, 4, 0x10, 8, 0x04, 0x05, 0x0B, 7, 0x19, 10, 0x0D, 0x00,
];

fn decoded(code: &[u8]) -> Function {
    let flags = FunctionFlags::empty();
    let bounds = LiteralBoundaries::new(flags, 1, 4, 8, 12, 320, 8).unwrap();
    let mut func = Function::new(flags, bounds, LiteralPool::new(vec![0; 320]), code.to_vec());
    func.decode(&OpcodeTable::default_set()).unwrap();
    func
}

fn bench_pipeline(c: &mut Criterion) {
    let chain = chain_code(256);

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Bytes(chain.len() as u64));
    group.bench_function("straight_line_256", |b| {
        b.iter(|| {
            let mut funcs = vec![decoded(black_box(&chain))];
            Optimizer::new().run(&mut funcs).unwrap();
            black_box(funcs)
        });
    });
    group.finish();

    let mut group = c.benchmark_group("pipeline_loop");
    group.throughput(Throughput::Bytes(LOOP.len() as u64));
    group.bench_function("while_with_break", |b| {
        b.iter(|| {
            let mut funcs = vec![decoded(black_box(LOOP))];
            Optimizer::new().run(&mut funcs).unwrap();
            black_box(funcs)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
