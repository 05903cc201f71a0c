//! Compile worklists.
//!
//! A [`Worklist`] owns a fixed pool of worker threads that lower whole
//! functions. Plans are keyed by [`CompilationKey`]; a key is in the
//! worklist from `enqueue` until its owner completes or abandons it.
//!
//! Workers only run [`prepare`](strata_jit::prepare). Turning a lowered
//! function into native code touches the owner's JIT module, so ready plans
//! are handed to a caller-supplied sink on the owner's thread by
//! [`Worklist::complete_all_ready_plans_for_owner`].
//!
//! Lowering embeds raw pointers to heap metadata. A collector must call
//! [`Worklist::suspend_all_threads`] and keep the guard for as long as it
//! may move or free structures.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use strata_ir::Graph;
use strata_jit::{JitError, LoweredFunction, LoweringOptions, ObjectLayout, prepare};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::WorklistConfig;

/// Whoever finalizes a plan, typically one VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// Identity of a compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompilationKey {
    /// Owner that will finalize the plan.
    pub owner: OwnerId,
    /// Function being compiled, in the owner's numbering.
    pub function: u64,
}

impl CompilationKey {
    /// Key of `function` for `owner`.
    pub const fn new(owner: OwnerId, function: u64) -> Self {
        Self { owner, function }
    }
}

impl fmt::Display for CompilationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner.0, self.function)
    }
}

/// Where a key stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    /// Never enqueued, already completed, or abandoned.
    NotKnown,
    /// Queued or being lowered.
    Compiling,
    /// Lowered and waiting for its owner.
    Ready,
}

/// Errors returned by a worklist.
#[derive(Debug, Error)]
pub enum WorklistError {
    /// The worklist no longer accepts plans.
    #[error("worklist {0} is shut down")]
    ShutDown(String),

    /// A plan with the same key is already in the worklist.
    #[error("compilation {0} is already in the worklist")]
    Duplicate(CompilationKey),

    /// A worker thread could not be started.
    #[error("failed to spawn worklist thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One function to compile.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Identity.
    pub key: CompilationKey,
    /// Graph to lower.
    pub graph: Arc<Graph>,
    /// Lowering knobs.
    pub options: LoweringOptions,
}

impl Plan {
    /// Plan lowering `graph` with `options`.
    pub fn new(key: CompilationKey, graph: impl Into<Arc<Graph>>, options: LoweringOptions) -> Self {
        Self {
            key,
            graph: graph.into(),
            options,
        }
    }
}

/// A plan handed back to its owner.
#[derive(Debug)]
pub struct CompletedPlan {
    /// Identity.
    pub key: CompilationKey,
    /// Lowered function, or why the capability check rejected it.
    pub result: Result<LoweredFunction, JitError>,
    /// Time spent lowering on the worker.
    pub compile_time: Duration,
}

/// Counters of a worklist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorklistStats {
    /// Plans accepted by `enqueue`.
    pub enqueued: u64,
    /// Plans lowered successfully.
    pub compiled: u64,
    /// Plans the capability check rejected.
    pub failed: u64,
    /// Plans abandoned before their owner completed them.
    pub abandoned: u64,
    /// Plans handed to an owner's sink.
    pub completed: u64,
}

enum Stage {
    Queued,
    Compiling,
    Ready {
        result: Result<LoweredFunction, JitError>,
        compile_time: Duration,
    },
}

struct Entry {
    /// Distinguishes a re-enqueued key from an abandoned plan still on a worker.
    ticket: u64,
    plan: Plan,
    stage: Stage,
}

#[derive(Default)]
struct State {
    queue: VecDeque<CompilationKey>,
    plans: FxHashMap<CompilationKey, Entry>,
    ready: VecDeque<CompilationKey>,
    next_ticket: u64,
    shutdown: bool,
    stats: WorklistStats,
}

impl State {
    fn has_unfinished_plans_for(&self, owner: OwnerId) -> bool {
        self.plans
            .iter()
            .any(|(key, entry)| key.owner == owner && !matches!(entry.stage, Stage::Ready { .. }))
    }

    /// Store a worker's result. Returns false when the plan was abandoned
    /// while it was being lowered.
    fn finish(
        &mut self,
        key: CompilationKey,
        ticket: u64,
        result: Result<LoweredFunction, JitError>,
        compile_time: Duration,
    ) -> bool {
        let Some(entry) = self.plans.get_mut(&key).filter(|entry| entry.ticket == ticket) else {
            trace!(target: "strata::worklist", %key, "dropping abandoned plan");
            return false;
        };
        match &result {
            Ok(_) => self.stats.compiled += 1,
            Err(error) => {
                self.stats.failed += 1;
                debug!(target: "strata::worklist", %key, %error, "plan failed");
            }
        }
        entry.stage = Stage::Ready {
            result,
            compile_time,
        };
        self.ready.push_back(key);
        true
    }
}

struct Shared {
    name: String,
    layout: Arc<dyn ObjectLayout>,
    state: Mutex<State>,
    plan_enqueued: Condvar,
    plan_completed: Condvar,
    /// One per worker; a worker holds its lock while lowering.
    right_to_run: Vec<Mutex<()>>,
}

impl Shared {
    fn compile(&self, plan: &Plan) -> (Result<LoweredFunction, JitError>, Duration) {
        let started = Instant::now();
        let result = prepare(&plan.graph, &plan.options, self.layout.as_ref());
        (result, started.elapsed())
    }

    fn run_worker(&self, index: usize) {
        trace!(target: "strata::worklist", worklist = %self.name, index, "worker started");
        loop {
            let (key, ticket, plan) = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        trace!(target: "strata::worklist", worklist = %self.name, index, "worker stopped");
                        return;
                    }
                    if let Some(key) = state.queue.pop_front() {
                        if let Some(entry) = state.plans.get_mut(&key) {
                            entry.stage = Stage::Compiling;
                            break (key, entry.ticket, entry.plan.clone());
                        }
                        continue;
                    }
                    self.plan_enqueued.wait(&mut state);
                }
            };

            let (result, compile_time) = {
                let _running = self.right_to_run[index].lock();
                self.compile(&plan)
            };
            trace!(
                target: "strata::worklist",
                worklist = %self.name,
                %key,
                micros = compile_time.as_micros() as u64,
                "plan lowered"
            );

            self.state.lock().finish(key, ticket, result, compile_time);
            self.plan_completed.notify_all();
        }
    }
}

/// Holds every worker's right to run; no lowering makes progress while it
/// is alive.
#[must_use = "workers resume as soon as the guard is dropped"]
pub struct SuspendedWorklist<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

/// A pool of compile workers.
pub struct Worklist {
    shared: Arc<Shared>,
    background: bool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Worklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worklist")
            .field("name", &self.shared.name)
            .field("background", &self.background)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Worklist {
    /// Start a worklist; `layout` is used by every plan it lowers.
    pub fn new(config: WorklistConfig, layout: Arc<dyn ObjectLayout>) -> Result<Self, WorklistError> {
        let workers = config.worker_count();
        let shared = Arc::new(Shared {
            name: config.name,
            layout,
            state: Mutex::new(State::default()),
            plan_enqueued: Condvar::new(),
            plan_completed: Condvar::new(),
            right_to_run: (0..workers).map(|_| Mutex::new(())).collect(),
        });
        let worklist = Self {
            shared,
            background: config.background,
            threads: Mutex::new(Vec::new()),
        };
        if worklist.background {
            for index in 0..workers {
                let shared = Arc::clone(&worklist.shared);
                let handle = thread::Builder::new()
                    .name(format!("{}-{index}", worklist.shared.name))
                    .spawn(move || shared.run_worker(index))?;
                worklist.threads.lock().push(handle);
            }
        }
        debug!(
            target: "strata::worklist",
            worklist = %worklist.shared.name,
            workers,
            background = worklist.background,
            "worklist started"
        );
        Ok(worklist)
    }

    /// Name given in the config.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add a plan.
    ///
    /// Without background compilation the plan is lowered before this returns
    /// and is immediately [`CompilationState::Ready`].
    pub fn enqueue(&self, plan: Plan) -> Result<(), WorklistError> {
        let key = plan.key;
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(WorklistError::ShutDown(self.shared.name.clone()));
        }
        if state.plans.contains_key(&key) {
            return Err(WorklistError::Duplicate(key));
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.stats.enqueued += 1;
        trace!(target: "strata::worklist", worklist = %self.shared.name, %key, "enqueued");

        if !self.background {
            state.plans.insert(
                key,
                Entry {
                    ticket,
                    plan: plan.clone(),
                    stage: Stage::Compiling,
                },
            );
            drop(state);
            let (result, compile_time) = {
                let _running = self.shared.right_to_run[0].lock();
                self.shared.compile(&plan)
            };
            self.shared.state.lock().finish(key, ticket, result, compile_time);
            self.shared.plan_completed.notify_all();
            return Ok(());
        }

        state.plans.insert(
            key,
            Entry {
                ticket,
                plan,
                stage: Stage::Queued,
            },
        );
        state.queue.push_back(key);
        drop(state);
        self.shared.plan_enqueued.notify_one();
        Ok(())
    }

    /// Where `key` stands.
    pub fn compilation_state(&self, key: CompilationKey) -> CompilationState {
        let state = self.shared.state.lock();
        match state.plans.get(&key).map(|entry| &entry.stage) {
            None => CompilationState::NotKnown,
            Some(Stage::Ready { .. }) => CompilationState::Ready,
            Some(Stage::Queued | Stage::Compiling) => CompilationState::Compiling,
        }
    }

    /// Plans queued but not yet picked up by a worker.
    pub fn queue_length(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Block until no plan of `owner` is queued or being lowered.
    pub fn wait_until_all_plans_for_owner_are_done(&self, owner: OwnerId) {
        let mut state = self.shared.state.lock();
        while state.has_unfinished_plans_for(owner) {
            self.shared.plan_completed.wait(&mut state);
        }
    }

    /// Hand every ready plan of `owner` to `sink`, in the order they became
    /// ready. Returns how many were handed over.
    ///
    /// The sink runs without the worklist lock held, so it may enqueue.
    pub fn complete_all_ready_plans_for_owner(
        &self,
        owner: OwnerId,
        mut sink: impl FnMut(CompletedPlan),
    ) -> usize {
        let completed: Vec<CompletedPlan> = {
            let mut state = self.shared.state.lock();
            let keys: Vec<CompilationKey> =
                state.ready.iter().copied().filter(|key| key.owner == owner).collect();
            state.ready.retain(|key| key.owner != owner);
            let completed: Vec<CompletedPlan> = keys
                .into_iter()
                .filter_map(|key| match state.plans.remove(&key)?.stage {
                    Stage::Ready {
                        result,
                        compile_time,
                    } => Some(CompletedPlan {
                        key,
                        result,
                        compile_time,
                    }),
                    Stage::Queued | Stage::Compiling => None,
                })
                .collect();
            state.stats.completed += completed.len() as u64;
            completed
        };

        let count = completed.len();
        if count > 0 {
            debug!(
                target: "strata::worklist",
                worklist = %self.shared.name,
                owner = owner.0,
                count,
                "completing ready plans"
            );
        }
        for plan in completed {
            sink(plan);
        }
        count
    }

    /// Wait for every plan of `owner`, then complete them all.
    pub fn complete_all_plans_for_owner(
        &self,
        owner: OwnerId,
        sink: impl FnMut(CompletedPlan),
    ) -> usize {
        self.wait_until_all_plans_for_owner_are_done(owner);
        self.complete_all_ready_plans_for_owner(owner, sink)
    }

    /// Drop the plan for `key`. A plan already on a worker finishes lowering
    /// and its result is discarded. Returns false if the key was not known.
    pub fn abandon(&self, key: CompilationKey) -> bool {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.plans.remove(&key) else {
            return false;
        };
        match entry.stage {
            Stage::Queued => state.queue.retain(|queued| *queued != key),
            Stage::Ready { .. } => state.ready.retain(|ready| *ready != key),
            Stage::Compiling => {}
        }
        state.stats.abandoned += 1;
        drop(state);
        trace!(target: "strata::worklist", worklist = %self.shared.name, %key, "abandoned");
        self.shared.plan_completed.notify_all();
        true
    }

    /// Abandon every plan of `owner`. Returns how many were dropped.
    pub fn abandon_all_plans_for_owner(&self, owner: OwnerId) -> usize {
        let keys: Vec<CompilationKey> = {
            let state = self.shared.state.lock();
            state.plans.keys().copied().filter(|key| key.owner == owner).collect()
        };
        keys.into_iter().filter(|key| self.abandon(*key)).count()
    }

    /// Stop every worker at its next plan boundary.
    ///
    /// Returns once no worker is lowering. Dropping the guard lets them
    /// continue. Enqueuing a plan without background compilation while the
    /// guard is held deadlocks.
    pub fn suspend_all_threads(&self) -> SuspendedWorklist<'_> {
        let guards = self.shared.right_to_run.iter().map(|lock| lock.lock()).collect();
        trace!(target: "strata::worklist", worklist = %self.shared.name, "threads suspended");
        SuspendedWorklist { _guards: guards }
    }

    /// Counters so far.
    pub fn stats(&self) -> WorklistStats {
        self.shared.state.lock().stats
    }

    /// Stop accepting plans, drop queued ones and join the workers. Plans
    /// being lowered finish first. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                let queued: Vec<CompilationKey> = state.queue.drain(..).collect();
                for key in &queued {
                    state.plans.remove(key);
                }
                state.stats.abandoned += queued.len() as u64;
                debug!(
                    target: "strata::worklist",
                    worklist = %self.shared.name,
                    dropped = queued.len(),
                    "shutting down"
                );
            }
        }
        self.shared.plan_enqueued.notify_all();
        self.shared.plan_completed.notify_all();

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!(target: "strata::worklist", worklist = %self.shared.name, "worker panicked");
            }
        }
    }
}

impl Drop for Worklist {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The two worklists of a VM.
#[derive(Debug)]
pub struct Worklists {
    /// Functions tiering up from the baseline tier.
    pub baseline_tier_up: Worklist,
    /// Functions entering the high tier directly, e.g. through OSR entry.
    pub high_tier_entry: Worklist,
}

impl Worklists {
    /// Start both worklists.
    pub fn new(
        baseline_tier_up: WorklistConfig,
        high_tier_entry: WorklistConfig,
        layout: Arc<dyn ObjectLayout>,
    ) -> Result<Self, WorklistError> {
        Ok(Self {
            baseline_tier_up: Worklist::new(baseline_tier_up, Arc::clone(&layout))?,
            high_tier_entry: Worklist::new(high_tier_entry, layout)?,
        })
    }

    /// Start both worklists sized from the environment.
    pub fn from_env(layout: Arc<dyn ObjectLayout>) -> Result<Self, WorklistError> {
        Self::new(
            WorklistConfig::baseline_tier_up(),
            WorklistConfig::high_tier_entry(),
            layout,
        )
    }

    fn each(&self) -> [&Worklist; 2] {
        [&self.baseline_tier_up, &self.high_tier_entry]
    }

    /// Suspend the workers of both worklists.
    pub fn suspend_all_threads(&self) -> [SuspendedWorklist<'_>; 2] {
        self.each().map(Worklist::suspend_all_threads)
    }

    /// Where `key` stands in either worklist.
    pub fn compilation_state(&self, key: CompilationKey) -> CompilationState {
        self.each()
            .into_iter()
            .map(|worklist| worklist.compilation_state(key))
            .find(|state| *state != CompilationState::NotKnown)
            .unwrap_or(CompilationState::NotKnown)
    }

    /// Block until no plan of `owner` is pending in either worklist.
    pub fn wait_until_all_plans_for_owner_are_done(&self, owner: OwnerId) {
        for worklist in self.each() {
            worklist.wait_until_all_plans_for_owner_are_done(owner);
        }
    }

    /// Complete ready plans of `owner` from both worklists.
    pub fn complete_all_ready_plans_for_owner(
        &self,
        owner: OwnerId,
        mut sink: impl FnMut(CompletedPlan),
    ) -> usize {
        self.each()
            .into_iter()
            .map(|worklist| worklist.complete_all_ready_plans_for_owner(owner, &mut sink))
            .sum()
    }

    /// Shut down both worklists.
    pub fn shutdown(&self) {
        for worklist in self.each() {
            worklist.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::{Edge, FlushFormat, GraphBuilder, NodeResult, Op, Operand, StackAccessData};
    use strata_jit::DefaultObjectLayout;

    fn identity() -> Graph {
        let mut b = GraphBuilder::new("identity", 2, 0);
        let entry = b.entry();
        let x = b.add(
            entry,
            Op::GetStack(StackAccessData {
                local: Operand::Argument(1),
                machine_local: Operand::Argument(1),
                format: FlushFormat::JsValue,
            }),
            [],
            NodeResult::JsValue,
        );
        b.add(entry, Op::Return, [Edge::untyped(x)], NodeResult::None);
        b.build().expect("valid graph")
    }

    fn worklist(background: bool) -> Worklist {
        let config = WorklistConfig {
            name: "test".to_string(),
            threads: 2,
            background,
        };
        Worklist::new(config, Arc::new(DefaultObjectLayout)).expect("worklist should start")
    }

    fn plan(owner: u64, function: u64) -> Plan {
        Plan::new(
            CompilationKey::new(OwnerId(owner), function),
            identity(),
            LoweringOptions::default(),
        )
    }

    #[test]
    fn synchronous_plans_are_ready_immediately() {
        let worklist = worklist(false);
        let key = CompilationKey::new(OwnerId(1), 7);
        worklist.enqueue(plan(1, 7)).expect("enqueue");
        assert_eq!(worklist.compilation_state(key), CompilationState::Ready);

        let mut seen = Vec::new();
        let count = worklist.complete_all_ready_plans_for_owner(OwnerId(1), |done| {
            assert!(done.result.is_ok());
            seen.push(done.key);
        });
        assert_eq!(count, 1);
        assert_eq!(seen, vec![key]);
        assert_eq!(worklist.compilation_state(key), CompilationState::NotKnown);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let worklist = worklist(false);
        worklist.enqueue(plan(1, 1)).expect("enqueue");
        assert!(matches!(
            worklist.enqueue(plan(1, 1)),
            Err(WorklistError::Duplicate(_))
        ));
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let worklist = worklist(true);
        worklist.shutdown();
        worklist.shutdown();
        assert!(matches!(
            worklist.enqueue(plan(1, 1)),
            Err(WorklistError::ShutDown(_))
        ));
    }

    #[test]
    fn abandoned_ready_plans_are_forgotten() {
        let worklist = worklist(false);
        let key = CompilationKey::new(OwnerId(3), 1);
        worklist.enqueue(plan(3, 1)).expect("enqueue");
        assert!(worklist.abandon(key));
        assert!(!worklist.abandon(key));
        assert_eq!(worklist.compilation_state(key), CompilationState::NotKnown);
        assert_eq!(worklist.complete_all_ready_plans_for_owner(OwnerId(3), |_| {}), 0);
        assert_eq!(worklist.stats().abandoned, 1);
    }
}
