//! Graph fixtures and an evaluator harness shared by the integration tests.

#![allow(dead_code)]

use strata_ir::{
    BlockIndex, Edge, FlushFormat, FrozenValue, Graph, GraphBuilder, NodeId, NodeResult, Op,
    Operand, StackAccessData, UseKind,
};
use strata_jit::helpers::HelperKind;
use strata_jit::ic::SiteId;
use strata_jit::lir::LirFunction;
use strata_jit::lir::eval::{EvalOutcome, EvalRuntime, Evaluator, SparseMemory};
use strata_jit::{DefaultObjectLayout, LoweredFunction, LoweringOptions, abi};

pub const CTX: u64 = 0x1000;
pub const FRAME: u64 = 0x10_0000;

/// Runtime for code that never leaves through a helper or a site.
pub struct NoRuntime;

impl EvalRuntime for NoRuntime {
    fn call_helper(&mut self, helper: HelperKind, _: &[u64], _: &mut SparseMemory) -> u64 {
        panic!("unexpected helper call {helper:?}");
    }

    fn patchpoint(&mut self, site: SiteId, _: &[u64], _: &mut SparseMemory) -> u64 {
        panic!("unexpected patchpoint {site:?}");
    }
}

pub fn get_argument(b: &mut GraphBuilder, block: BlockIndex, index: u32) -> NodeId {
    b.add(
        block,
        Op::GetStack(StackAccessData {
            local: Operand::Argument(index),
            machine_local: Operand::Argument(index),
            format: FlushFormat::JsValue,
        }),
        [],
        NodeResult::JsValue,
    )
}

pub fn int32(b: &mut GraphBuilder, block: BlockIndex, value: i32) -> NodeId {
    b.add(block, Op::JsConstant(FrozenValue::Int32(value)), [], NodeResult::JsValue)
}

pub fn checked_add(b: &mut GraphBuilder, block: BlockIndex, x: NodeId, y: NodeId) -> NodeId {
    b.add(
        block,
        Op::ArithAdd(strata_ir::ArithMode::CheckOverflow),
        [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
        NodeResult::Int32,
    )
}

pub fn return_int32(b: &mut GraphBuilder, block: BlockIndex, value: NodeId) {
    let boxed = b.add(block, Op::ValueRep, [Edge::new(value, UseKind::Int32)], NodeResult::JsValue);
    b.add(block, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
}

/// `function (n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; }`
pub fn sum_below() -> Graph {
    let mut b = GraphBuilder::new("sum_below", 2, 0);
    let entry = b.entry();
    let header = b.block();
    let body = b.block();
    let done = b.block();

    let i = b.add(header, Op::Phi, [], NodeResult::Int32);
    let s = b.add(header, Op::Phi, [], NodeResult::Int32);

    let n = get_argument(&mut b, entry, 1);
    let zero = int32(&mut b, entry, 0);
    b.add(entry, Op::Upsilon(i), [Edge::new(zero, UseKind::Int32)], NodeResult::None);
    b.add(entry, Op::Upsilon(s), [Edge::new(zero, UseKind::Int32)], NodeResult::None);
    b.add(entry, Op::Jump(header), [], NodeResult::None);

    b.set_origin(1);
    let less = b.add(
        header,
        Op::CompareLess,
        [Edge::new(i, UseKind::Int32), Edge::new(n, UseKind::Int32)],
        NodeResult::Boolean,
    );
    b.add(
        header,
        Op::Branch(strata_ir::BranchData {
            taken: body,
            not_taken: done,
        }),
        [Edge::new(less, UseKind::Boolean)],
        NodeResult::None,
    );

    b.set_origin(2);
    let one = int32(&mut b, body, 1);
    let next_s = checked_add(&mut b, body, s, i);
    let next_i = checked_add(&mut b, body, i, one);
    b.add(body, Op::Upsilon(i), [Edge::new(next_i, UseKind::Int32)], NodeResult::None);
    b.add(body, Op::Upsilon(s), [Edge::new(next_s, UseKind::Int32)], NodeResult::None);
    b.add(body, Op::Jump(header), [], NodeResult::None);

    b.set_origin(3);
    return_int32(&mut b, done, s);
    b.build().expect("valid graph")
}

/// Install a subscriber honoring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn lower(graph: &Graph, options: &LoweringOptions) -> LoweredFunction {
    init_tracing();
    strata_jit::prepare(graph, options, &DefaultObjectLayout).expect("graph should compile")
}

/// Memory holding a frame with `arguments` after `this`.
pub fn frame_memory(arguments: &[u64]) -> SparseMemory {
    let mut memory = SparseMemory::new();
    let slot = |s: i32| FRAME.wrapping_add_signed(8 * s as i64);
    memory.write_u32(slot(abi::FRAME_ARGUMENT_COUNT), arguments.len() as u32 + 1);
    memory.write_u64(slot(abi::FRAME_HEADER_SLOTS), strata_jit::value::VALUE_UNDEFINED);
    for (i, &value) in arguments.iter().enumerate() {
        memory.write_u64(slot(abi::FRAME_HEADER_SLOTS + 1 + i as i32), value);
    }
    memory
}

pub fn run(lir: &LirFunction, arguments: &[u64]) -> EvalOutcome {
    let mut memory = frame_memory(arguments);
    Evaluator::new(lir, CTX, FRAME)
        .with_step_limit(50_000_000)
        .run(&mut memory, &mut NoRuntime)
        .expect("evaluation should finish")
}
