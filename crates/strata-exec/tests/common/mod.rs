//! Fixtures shared by the exec integration tests.

#![allow(dead_code)]

use strata_ir::{
    ArithMode, BlockIndex, Edge, FlushFormat, FrozenValue, Graph, GraphBuilder, NodeId,
    NodeResult, Op, Operand, Operands, StackAccessData, UseKind,
};
use strata_jit::helpers::HelperKind;
use strata_jit::ic::SiteId;
use strata_jit::lir::eval::{EvalOutcome, EvalRuntime, Evaluator, SparseMemory};
use strata_jit::value::VALUE_UNDEFINED;
use strata_jit::{DefaultObjectLayout, ExitId, LoweredFunction, LoweringOptions, abi};

const CTX: u64 = 0x1000;
const FRAME: u64 = 0x10_0000;

struct NoRuntime;

impl EvalRuntime for NoRuntime {
    fn call_helper(&mut self, helper: HelperKind, _: &[u64], _: &mut SparseMemory) -> u64 {
        panic!("unexpected helper call {helper:?}");
    }

    fn patchpoint(&mut self, site: SiteId, _: &[u64], _: &mut SparseMemory) -> u64 {
        panic!("unexpected patchpoint {site:?}");
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn get_argument(b: &mut GraphBuilder, block: BlockIndex, index: u32) -> NodeId {
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

fn add(b: &mut GraphBuilder, block: BlockIndex, mode: ArithMode, x: NodeId, y: NodeId) -> NodeId {
    b.add(
        block,
        Op::ArithAdd(mode),
        [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
        NodeResult::Int32,
    )
}

/// `loc0 = a + b` at bytecode 0, then `loc0 + MAX` at bytecode 1. With
/// `exit_only`, `loc0` is never read and bytecode 1 computes `a + b` again.
pub fn hinted_sum(exit_only: bool) -> Graph {
    let mut b = GraphBuilder::new("hinted_sum", 3, 1);
    b.live_at(0, [Operand::Argument(1), Operand::Argument(2)]);
    b.live_at(1, [Operand::Local(0)]);
    let entry = b.entry();
    let x = get_argument(&mut b, entry, 1);
    let y = get_argument(&mut b, entry, 2);
    let mode = if exit_only {
        ArithMode::Unchecked
    } else {
        ArithMode::CheckOverflow
    };
    let sum = add(&mut b, entry, mode, x, y);
    b.add(entry, Op::MovHint(Operand::Local(0)), [Edge::untyped(sum)], NodeResult::None);

    b.set_origin(1);
    let total = if exit_only {
        add(&mut b, entry, ArithMode::CheckOverflow, x, y)
    } else {
        let max = b.add(entry, Op::JsConstant(FrozenValue::Int32(i32::MAX)), [], NodeResult::JsValue);
        add(&mut b, entry, ArithMode::CheckOverflow, sum, max)
    };
    let boxed = b.add(entry, Op::ValueRep, [Edge::new(total, UseKind::Int32)], NodeResult::JsValue);
    b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
    b.build().expect("valid graph")
}

pub fn lower(graph: &Graph) -> LoweredFunction {
    init_tracing();
    strata_jit::prepare(graph, &LoweringOptions::default(), &DefaultObjectLayout)
        .expect("graph should compile")
}

/// Frame slots as the resolver sees them: `this`, the arguments, then
/// `num_locals` zeroed locals.
pub fn frame(arguments: &[u64], num_locals: usize) -> Operands<u64> {
    let mut slots = vec![VALUE_UNDEFINED];
    slots.extend_from_slice(arguments);
    Operands::from_parts(slots, vec![0; num_locals])
}

/// Run `lowered` in the evaluator and return the exit it takes.
pub fn run_to_exit(lowered: &LoweredFunction, arguments: &[u64]) -> (ExitId, Vec<u64>) {
    let mut memory = SparseMemory::new();
    let slot = |s: i32| FRAME.wrapping_add_signed(8 * s as i64);
    memory.write_u32(slot(abi::FRAME_ARGUMENT_COUNT), arguments.len() as u32 + 1);
    memory.write_u64(slot(abi::FRAME_HEADER_SLOTS), VALUE_UNDEFINED);
    for (i, &value) in arguments.iter().enumerate() {
        memory.write_u64(slot(abi::FRAME_HEADER_SLOTS + 1 + i as i32), value);
    }
    match Evaluator::new(&lowered.lir, CTX, FRAME)
        .run(&mut memory, &mut NoRuntime)
        .expect("evaluation should finish")
    {
        EvalOutcome::Exited { exit, values } => (exit, values),
        other => panic!("expected an exit, got {other:?}"),
    }
}

/// `a | b` with an untyped right operand, which the capability check rejects.
pub fn untyped_bit_or() -> Graph {
    let mut b = GraphBuilder::new("untyped_bit_or", 3, 0);
    let entry = b.entry();
    let x = get_argument(&mut b, entry, 1);
    let y = get_argument(&mut b, entry, 2);
    let or = b.add(
        entry,
        Op::BitOr,
        [Edge::new(x, UseKind::Int32), Edge::untyped(y)],
        NodeResult::Int32,
    );
    let boxed = b.add(entry, Op::ValueRep, [Edge::new(or, UseKind::Int32)], NodeResult::JsValue);
    b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
    b.build().expect("valid graph")
}
