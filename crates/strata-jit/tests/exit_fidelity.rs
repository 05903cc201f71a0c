//! Exit fidelity: when a speculation fails, the exit record must rebuild
//! every live operand of the unoptimized tier from the stackmap.

mod common;

use common::*;
use strata_ir::{ArithMode, CodeOrigin, Edge, Graph, GraphBuilder, NodeResult, Op, Operand, UseKind};
use strata_jit::exit::{ExitValue, RecoveryOp, ValueFormat};
use strata_jit::lir::eval::EvalOutcome;
use strata_jit::value::{box_double, box_int32, unbox_int32};
use strata_jit::{ExitKind, ExitLivenessMode, ExitTable, LoweringOptions};

/// `loc0 = a + b` at bytecode 0, then `loc0 + MAX` at bytecode 1. The
/// exit-only variant computes `a + b` again at bytecode 1 instead.
fn hinted_sum(exit_only: bool) -> Graph {
    let mut b = GraphBuilder::new("hinted_sum", 3, 1);
    b.live_at(0, [Operand::Argument(1), Operand::Argument(2)]);
    b.live_at(1, [Operand::Local(0)]);
    let entry = b.entry();
    let x = get_argument(&mut b, entry, 1);
    let y = get_argument(&mut b, entry, 2);
    let sum = if exit_only {
        b.add(
            entry,
            Op::ArithAdd(ArithMode::Unchecked),
            [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
            NodeResult::Int32,
        )
    } else {
        checked_add(&mut b, entry, x, y)
    };
    b.add(entry, Op::MovHint(Operand::Local(0)), [Edge::untyped(sum)], NodeResult::None);

    b.set_origin(1);
    // The exit-only variant never reads the sum outside of exits.
    let total = if exit_only {
        checked_add(&mut b, entry, x, y)
    } else {
        let max = int32(&mut b, entry, i32::MAX);
        checked_add(&mut b, entry, sum, max)
    };
    return_int32(&mut b, entry, total);
    b.build().expect("valid graph")
}

fn exited(outcome: EvalOutcome) -> (strata_jit::ExitId, Vec<u64>) {
    match outcome {
        EvalOutcome::Exited { exit, values } => (exit, values),
        other => panic!("expected an exit, got {other:?}"),
    }
}

#[test]
fn fast_path_returns_without_exiting() {
    let lowered = lower(&hinted_sum(false), &LoweringOptions::default());
    let outcome = run(&lowered.lir, &[box_int32(-5), box_int32(2)]);
    assert_eq!(outcome, EvalOutcome::Returned(box_int32(i32::MAX - 3)));
}

#[test]
fn overflow_exit_rebuilds_the_hinted_local() {
    let lowered = lower(&hinted_sum(false), &LoweringOptions::default());
    let (id, values) = exited(run(&lowered.lir, &[box_int32(2), box_int32(3)]));

    let exit = lowered.exits.exit(id).expect("exit record");
    assert_eq!(exit.kind, ExitKind::Overflow);
    assert_eq!(exit.origin, CodeOrigin::new(1));
    match exit.value(Operand::Local(0)) {
        ExitValue::Argument {
            index,
            format: ValueFormat::Int32,
        } => assert_eq!(values[*index as usize] as u32 as i32, 5),
        other => panic!("local 0 rebuilt as {other}"),
    }
    // Dead at bytecode 1.
    assert!(exit.value(Operand::Argument(1)).is_dead());
}

#[test]
fn type_exit_reports_the_checked_value() {
    let lowered = lower(&hinted_sum(false), &LoweringOptions::default());
    let (id, values) = exited(run(&lowered.lir, &[box_int32(2), box_double(0.5)]));

    let exit = lowered.exits.exit(id).expect("exit record");
    assert_eq!(exit.kind, ExitKind::BadType);
    assert_eq!(exit.origin, CodeOrigin::new(0));
    let profiled = exit.profile_value.expect("checked value is profiled");
    assert_eq!(values[profiled as usize], box_double(0.5));
    // Arguments still sit in the frame.
    assert!(matches!(
        exit.value(Operand::Argument(2)),
        ExitValue::InJsStack { .. }
    ));
}

#[test]
fn exit_only_addition_is_recovered_from_its_operands() {
    let lowered = lower(&hinted_sum(true), &LoweringOptions::default());
    let (id, values) = exited(run(&lowered.lir, &[box_int32(i32::MAX), box_int32(1)]));

    let exit = lowered.exits.exit(id).expect("exit record");
    assert_eq!(exit.kind, ExitKind::Overflow);
    match exit.value(Operand::Local(0)) {
        ExitValue::Recovery {
            op: RecoveryOp::Add,
            left,
            right,
            format: ValueFormat::Int32,
        } => {
            let left = values[*left as usize] as u32 as i32;
            let right = values[*right as usize] as u32 as i32;
            assert_eq!(left.wrapping_add(right), i32::MIN);
        }
        other => panic!("local 0 rebuilt as {other}"),
    }
}

#[test]
fn conservative_liveness_keeps_dead_operands() {
    let options = LoweringOptions {
        exit_liveness: ExitLivenessMode::Conservative,
        ..LoweringOptions::default()
    };
    let lowered = lower(&hinted_sum(false), &options);
    let (id, _) = exited(run(&lowered.lir, &[box_int32(2), box_int32(3)]));
    let exit = lowered.exits.exit(id).expect("exit record");
    assert!(!exit.value(Operand::Argument(1)).is_dead());
}

#[test]
fn loop_exit_carries_the_induction_state() {
    let lowered = lower(&sum_below(), &LoweringOptions::default());
    assert_eq!(
        run(&lowered.lir, &[box_int32(10)]),
        EvalOutcome::Returned(box_int32(45))
    );

    let (id, _) = exited(run(&lowered.lir, &[box_double(2.5)]));
    let exit = lowered.exits.exit(id).expect("exit record");
    assert_eq!(exit.kind, ExitKind::BadType);
    assert_eq!(exit.origin, CodeOrigin::new(1));
}

#[test]
fn exit_tables_survive_json() {
    let lowered = lower(&hinted_sum(true), &LoweringOptions::default());
    let json = lowered.exits.to_json().expect("serialize");
    let back = ExitTable::from_json(&json).expect("deserialize");
    assert_eq!(back, lowered.exits);
}

#[test]
fn returned_values_are_boxed_int32() {
    let lowered = lower(&sum_below(), &LoweringOptions::default());
    match run(&lowered.lir, &[box_int32(4)]) {
        EvalOutcome::Returned(bits) => assert_eq!(unbox_int32(bits), 6),
        other => panic!("expected a return, got {other:?}"),
    }
}
