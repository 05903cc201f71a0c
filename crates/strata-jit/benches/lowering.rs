//! Lowering throughput.
//!
//! Measures the capability check plus lowering of straight-line int32
//! arithmetic chains and a counted loop, and the Cranelift backend on top.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use strata_ir::{
    ArithMode, Edge, FlushFormat, FrozenValue, Graph, GraphBuilder, NodeResult, Op, Operand,
    StackAccessData, UseKind,
};
use strata_jit::{DefaultObjectLayout, JitCompiler, LoweringOptions, prepare};

/// `a + 1 + 2 + ... + length`, each step checked and hinted into local 0.
fn chain(length: usize) -> Graph {
    let mut b = GraphBuilder::new(format!("chain_{length}"), 2, 1);
    let entry = b.entry();
    let mut acc = b.add(
        entry,
        Op::GetStack(StackAccessData {
            local: Operand::Argument(1),
            machine_local: Operand::Argument(1),
            format: FlushFormat::JsValue,
        }),
        [],
        NodeResult::JsValue,
    );
    for i in 0..length {
        let origin = i as u32 + 1;
        b.set_origin(origin);
        match i {
            0 => b.live_at(origin, [Operand::Argument(1)]),
            _ => b.live_at(origin, [Operand::Local(0)]),
        }
        let step = b.add(entry, Op::JsConstant(FrozenValue::Int32(i as i32 + 1)), [], NodeResult::JsValue);
        acc = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(acc, UseKind::Int32), Edge::new(step, UseKind::Int32)],
            NodeResult::Int32,
        );
        b.add(entry, Op::MovHint(Operand::Local(0)), [Edge::untyped(acc)], NodeResult::None);
    }
    let boxed = b.add(entry, Op::ValueRep, [Edge::new(acc, UseKind::Int32)], NodeResult::JsValue);
    b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
    b.build().expect("valid graph")
}

fn bench_lowering(c: &mut Criterion) {
    let options = LoweringOptions::default();
    let mut group = c.benchmark_group("lower");
    for length in [16, 128, 1024] {
        let graph = chain(length);
        group.bench_with_input(BenchmarkId::new("int32_chain", length), &graph, |b, graph| {
            b.iter(|| {
                let lowered = prepare(black_box(graph), &options, &DefaultObjectLayout)
                    .expect("lowering should succeed");
                black_box(lowered.lir.inst_count())
            })
        });
    }
    group.finish();
}

fn bench_backend(c: &mut Criterion) {
    let options = LoweringOptions::default();
    let graph = chain(128);
    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    c.bench_function("compile/int32_chain_128", |b| {
        b.iter(|| {
            let compiled = jit
                .compile(black_box(&graph), &options, &DefaultObjectLayout)
                .expect("compilation should succeed");
            black_box(compiled.code_ptr)
        })
    });
}

criterion_group!(benches, bench_lowering, bench_backend);
criterion_main!(benches);
