//! Background worklists: plans lower on workers and finalize on the owner.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use strata_exec::{
    CompilationKey, CompilationState, OwnerId, Plan, Worklist, WorklistConfig, Worklists,
};
use strata_ir::Graph;
use strata_jit::{DefaultObjectLayout, JitCompiler, JitError, LoweringOptions};

fn background(name: &str, threads: usize) -> Worklist {
    init_tracing();
    let config = WorklistConfig {
        name: name.to_string(),
        threads,
        background: true,
    };
    Worklist::new(config, Arc::new(DefaultObjectLayout)).expect("worklist should start")
}

fn plan(owner: u64, function: u64, graph: &Arc<Graph>) -> Plan {
    Plan::new(
        CompilationKey::new(OwnerId(owner), function),
        Arc::clone(graph),
        LoweringOptions::default(),
    )
}

#[test]
fn plans_finalize_on_the_owner_thread() {
    let worklist = background("finalize", 3);
    let graph = Arc::new(hinted_sum(false));
    for function in 0..16 {
        worklist.enqueue(plan(1, function, &graph)).expect("enqueue");
    }
    for function in 0..4 {
        worklist.enqueue(plan(2, function, &graph)).expect("enqueue");
    }

    worklist.wait_until_all_plans_for_owner_are_done(OwnerId(1));
    for function in 0..16 {
        let key = CompilationKey::new(OwnerId(1), function);
        assert_eq!(worklist.compilation_state(key), CompilationState::Ready);
    }

    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    let owner = thread::current().id();
    let mut finalized = Vec::new();
    let count = worklist.complete_all_ready_plans_for_owner(OwnerId(1), |done| {
        assert_eq!(thread::current().id(), owner);
        let lowered = done.result.expect("plan should lower");
        let compiled = jit.finalize(lowered).expect("plan should finalize");
        assert!(!compiled.code_ptr.is_null());
        finalized.push(done.key.function);
    });
    assert_eq!(count, 16);
    finalized.sort_unstable();
    assert_eq!(finalized, (0..16).collect::<Vec<_>>());

    // Owner 2 is untouched.
    worklist.wait_until_all_plans_for_owner_are_done(OwnerId(2));
    assert_eq!(worklist.complete_all_plans_for_owner(OwnerId(2), |_| {}), 4);
    assert_eq!(worklist.stats().compiled, 20);
    assert_eq!(worklist.stats().completed, 20);
}

#[test]
fn rejected_graphs_complete_with_an_error() {
    let worklist = background("rejected", 1);
    let graph = Arc::new(untyped_bit_or());
    worklist.enqueue(plan(1, 0, &graph)).expect("enqueue");

    let mut results = Vec::new();
    worklist.complete_all_plans_for_owner(OwnerId(1), |done| results.push(done.result));
    assert!(matches!(
        results.as_slice(),
        [Err(JitError::UnsupportedUseKind { .. })]
    ));
    assert_eq!(worklist.stats().failed, 1);
}

#[test]
fn suspended_workers_do_not_lower() {
    let worklist = background("suspend", 2);
    let graph = Arc::new(hinted_sum(false));
    let key = CompilationKey::new(OwnerId(1), 0);

    let guard = worklist.suspend_all_threads();
    worklist.enqueue(plan(1, 0, &graph)).expect("enqueue");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(worklist.compilation_state(key), CompilationState::Compiling);
    drop(guard);

    worklist.wait_until_all_plans_for_owner_are_done(OwnerId(1));
    assert_eq!(worklist.compilation_state(key), CompilationState::Ready);
}

#[test]
fn abandoned_plans_on_a_worker_are_discarded() {
    let worklist = background("abandon", 2);
    let graph = Arc::new(hinted_sum(false));
    let key = CompilationKey::new(OwnerId(1), 0);

    let guard = worklist.suspend_all_threads();
    worklist.enqueue(plan(1, 0, &graph)).expect("enqueue");
    thread::sleep(Duration::from_millis(50));
    assert!(worklist.abandon(key));
    assert_eq!(worklist.compilation_state(key), CompilationState::NotKnown);

    // The key may be enqueued again while the abandoned plan is still held.
    worklist.enqueue(plan(1, 0, &graph)).expect("re-enqueue");
    drop(guard);

    let count = worklist.complete_all_plans_for_owner(OwnerId(1), |done| {
        assert_eq!(done.key, key);
        assert!(done.result.is_ok());
    });
    assert_eq!(count, 1);
    assert_eq!(worklist.stats().abandoned, 1);
}

#[test]
fn owners_can_drop_all_their_plans() {
    let worklist = background("drop-owner", 1);
    let graph = Arc::new(hinted_sum(false));
    let guard = worklist.suspend_all_threads();
    for function in 0..5 {
        worklist.enqueue(plan(7, function, &graph)).expect("enqueue");
    }
    assert_eq!(worklist.abandon_all_plans_for_owner(OwnerId(7)), 5);
    drop(guard);

    worklist.wait_until_all_plans_for_owner_are_done(OwnerId(7));
    assert_eq!(worklist.complete_all_ready_plans_for_owner(OwnerId(7), |_| {}), 0);
    assert_eq!(worklist.queue_length(), 0);
}

#[test]
fn both_named_worklists_serve_the_same_owner() {
    init_tracing();
    let config = |name: &str| WorklistConfig {
        name: name.to_string(),
        threads: 1,
        background: true,
    };
    let worklists = Worklists::new(config("baseline"), config("high-tier"), Arc::new(DefaultObjectLayout))
        .expect("worklists should start");
    let graph = Arc::new(hinted_sum(true));
    worklists.baseline_tier_up.enqueue(plan(1, 0, &graph)).expect("enqueue");
    worklists.high_tier_entry.enqueue(plan(1, 1, &graph)).expect("enqueue");

    let guards = worklists.suspend_all_threads();
    drop(guards);

    worklists.wait_until_all_plans_for_owner_are_done(OwnerId(1));
    assert_eq!(
        worklists.compilation_state(CompilationKey::new(OwnerId(1), 1)),
        CompilationState::Ready
    );
    assert_eq!(worklists.complete_all_ready_plans_for_owner(OwnerId(1), |_| {}), 2);

    worklists.shutdown();
    assert!(worklists.baseline_tier_up.enqueue(plan(1, 2, &graph)).is_err());
}
