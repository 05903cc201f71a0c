//! The Cranelift backend and the reference evaluator agree on returns and
//! on which exit fires with which stackmap.

mod common;

use common::*;
use strata_jit::abi::{EXIT_SENTINEL, ExecutionContext};
use strata_jit::lir::eval::EvalOutcome;
use strata_jit::value::{VALUE_UNDEFINED, box_double, box_int32};
use strata_jit::{CompiledFunction, DefaultObjectLayout, JitCompiler, LoweringOptions};

fn run_native(compiled: &CompiledFunction, arguments: &[u64]) -> EvalOutcome {
    let stackmap = (0..compiled.exits.len() as u32)
        .filter_map(|id| compiled.exits.stackmap_len(strata_jit::ExitId(id)))
        .max()
        .unwrap_or(0);
    let mut buffer = vec![0u64; stackmap.max(1)];
    let mut ctx = ExecutionContext::new(buffer.as_mut_ptr(), std::ptr::null());

    let mut frame = vec![0, 0, arguments.len() as u64 + 1, VALUE_UNDEFINED];
    frame.extend_from_slice(arguments);
    let result = unsafe { compiled.call(ctx.as_ptr(), frame.as_mut_ptr()) };
    if result != EXIT_SENTINEL {
        return EvalOutcome::Returned(result);
    }
    let exit = strata_jit::ExitId(ctx.exit_index);
    let len = compiled.exits.stackmap_len(exit).expect("exit record");
    buffer.truncate(len);
    EvalOutcome::Exited {
        exit,
        values: buffer,
    }
}

#[test]
fn loop_agrees_with_the_evaluator() {
    let graph = sum_below();
    let options = LoweringOptions::default();
    let lowered = lower(&graph, &options);

    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    let compiled = jit
        .compile(&graph, &options, &DefaultObjectLayout)
        .expect("compilation should succeed");

    for n in [0, 1, 10, 1000] {
        let native = run_native(&compiled, &[box_int32(n)]);
        let reference = run(&lowered.lir, &[box_int32(n)]);
        assert_eq!(native, reference, "n = {n}");
    }
}

#[test]
fn exits_agree_with_the_evaluator() {
    let graph = sum_below();
    let options = LoweringOptions::default();
    let lowered = lower(&graph, &options);

    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    let compiled = jit
        .compile(&graph, &options, &DefaultObjectLayout)
        .expect("compilation should succeed");

    for argument in [box_double(3.5), VALUE_UNDEFINED, box_int32(70_000)] {
        let reference = run(&lowered.lir, &[argument]);
        assert!(matches!(reference, EvalOutcome::Exited { .. }));
        assert_eq!(run_native(&compiled, &[argument]), reference);
    }
}

#[test]
fn sum_overflow_exits_natively() {
    let graph = sum_below();
    let options = LoweringOptions::default();
    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    let compiled = jit
        .compile(&graph, &options, &DefaultObjectLayout)
        .expect("compilation should succeed");

    // 0 + 1 + ... + 70000 exceeds i32::MAX.
    let EvalOutcome::Exited { exit, .. } = run_native(&compiled, &[box_int32(70_000)]) else {
        panic!("sum should overflow");
    };
    let record = compiled.exits.exit(exit).expect("exit record");
    assert_eq!(record.kind, strata_jit::ExitKind::Overflow);
}
