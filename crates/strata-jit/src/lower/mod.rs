//! Lowering of a speculative [`Graph`] to LIR.
//!
//! Blocks are lowered in dominator pre-order, so every value a block uses
//! was lowered before it. Each node is dispatched to a free function taking
//! the lowering context; after it, the abstract state and availability are
//! advanced past the node.
//!
//! A node that would need a value in a representation nobody produced, or an
//! edge of a kind its routine does not handle, is an internal error: the pass
//! logs and crashes rather than emitting code that might be wrong.

mod arith;
mod arrays;
mod calls;
mod compare;
mod objects;
mod switch;
mod values;

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use strata_ir::{
    BlockIndex, CodeOrigin, Dominators, Edge, FlushFormat, Graph, Node, NodeId, NodeResult, Op,
    UseKind,
};
use tracing::{debug, error, trace};

use crate::abi;
use crate::abstract_state::AbstractState;
use crate::availability::{self, AvailabilityMap};
use crate::config::LoweringOptions;
use crate::exit::{ExitKind, ExitTable};
use crate::helpers::HelperKind;
use crate::ic::{self, InlineCacheTable};
use crate::lir::{BlockId, BranchWeight, IntCC, LirBuilder, LirFunction, MemWidth, Terminator, Type, Value};
use crate::object_layout::ObjectLayout;

pub use values::{LoweredValues, Repr};

/// Counters describing one lowering pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweringStats {
    /// Nodes dispatched to a lowering routine.
    pub nodes_lowered: usize,
    /// Speculation checks emitted.
    pub checks_emitted: usize,
    /// Speculation checks proven redundant by the abstract state.
    pub checks_elided: usize,
    /// Exits recorded.
    pub exits: usize,
    /// Blocks ended early by an unconditional exit.
    pub terminated_blocks: usize,
    /// Blocks lowered as unreachable.
    pub unreachable_blocks: usize,
}

/// Output of lowering one function.
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    /// Low-level code.
    pub lir: LirFunction,
    /// Exit and materialization records.
    pub exits: ExitTable,
    /// Inline cache site descriptors.
    pub ics: InlineCacheTable,
    /// Counters.
    pub stats: LoweringStats,
}

/// Lower `graph` completely.
pub fn lower(graph: &Graph, options: &LoweringOptions, layout: &dyn ObjectLayout) -> LoweredFunction {
    let mut cx = LowerCx::new(graph, options, layout);
    cx.lower_all();
    cx.finish()
}

/// State of one lowering pass.
pub struct LowerCx<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) options: &'a LoweringOptions,
    pub(crate) layout: &'a dyn ObjectLayout,
    pub(crate) dominators: Dominators,
    pub(crate) state: AbstractState<'a>,
    pub(crate) availability: AvailabilityMap,
    availability_heads: Vec<Option<AvailabilityMap>>,
    pub(crate) b: LirBuilder,
    pub(crate) values: LoweredValues,
    pub(crate) exits: ExitTable,
    pub(crate) ics: InlineCacheTable,
    pub(crate) stats: LoweringStats,
    block_map: Vec<BlockId>,
    phi_params: FxHashMap<NodeId, Value>,
    pending_upsilons: FxHashMap<NodeId, Value>,
    pub(crate) exit_only: FxHashSet<NodeId>,
    pub(crate) block: BlockIndex,
    pub(crate) node: Option<NodeId>,
    pub(crate) origin: CodeOrigin,
    pub(crate) ctx: Value,
    pub(crate) frame: Value,
    /// Non-zero while emitting inside a conditional arm; values produced
    /// there do not dominate the rest of the block and are not cached.
    pub(crate) arm_depth: u32,
}

impl fmt::Debug for LowerCx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerCx")
            .field("function", &self.graph.name)
            .field("block", &self.block)
            .field("node", &self.node)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'a> LowerCx<'a> {
    /// Prepare to lower `graph`: run the abstract interpreter and the
    /// availability analysis, and create one LIR block per graph block.
    pub fn new(graph: &'a Graph, options: &'a LoweringOptions, layout: &'a dyn ObjectLayout) -> Self {
        let dominators = Dominators::compute(graph);
        let mut state = AbstractState::new(graph, options.max_structure_set_size);
        state.run_fixpoint(&dominators);
        let availability_heads = availability::compute_block_heads(graph, &dominators);

        let mut b = LirBuilder::new(graph.name.clone());
        let ctx = b.context();
        let frame = b.frame();

        let mut block_map = Vec::with_capacity(graph.blocks.len());
        let mut phi_params = FxHashMap::default();
        for index in graph.block_indices() {
            let lir_block = b.create_block();
            for phi in graph.phis(index) {
                let ty = repr_type(graph.node(phi).result);
                phi_params.insert(phi, b.append_block_param(lir_block, ty));
            }
            block_map.push(lir_block);
        }
        if let Some(&entry) = block_map.first() {
            b.jump(entry, Vec::new());
        }

        let mut ics = InlineCacheTable::new();
        ics.varargs_outgoing_slots = ic::varargs_outgoing_slots(graph);

        Self {
            graph,
            options,
            layout,
            dominators,
            state,
            availability: AvailabilityMap::new(graph.num_arguments, graph.num_locals),
            availability_heads,
            b,
            values: LoweredValues::default(),
            exits: ExitTable::new(),
            ics,
            stats: LoweringStats::default(),
            block_map,
            phi_params,
            pending_upsilons: FxHashMap::default(),
            exit_only: exit_only_nodes(graph),
            block: BlockIndex(0),
            node: None,
            origin: CodeOrigin::default(),
            ctx,
            frame,
            arm_depth: 0,
        }
    }

    /// Lower every reachable block.
    pub fn lower_all(&mut self) {
        debug!(
            target: "strata::lower",
            function = %self.graph.name,
            blocks = self.graph.blocks.len(),
            nodes = self.graph.nodes.len(),
            "lowering function"
        );
        for block in self.dominators.blocks_in_pre_order() {
            self.lower_block(block);
        }
    }

    /// Lower one block. Lowering a block a second time emits nothing.
    pub fn lower_block(&mut self, block: BlockIndex) {
        let Some(&target) = self.block_map.get(block.index()) else {
            self.crash(format_args!("lowering missing block {block}"));
        };
        self.b.switch_to(target);
        if self.b.is_terminated() {
            return;
        }
        self.block = block;
        self.node = None;
        self.pending_upsilons.clear();

        if !self.state.cfa_has_visited(block) || self.state.needs_reverification(block) {
            trace!(target: "strata::lower", block = %block, "block is unreachable");
            self.stats.unreachable_blocks += 1;
            self.b.unreachable();
            return;
        }

        self.state.begin_block(block);
        self.availability = availability::head_or_empty(&self.availability_heads, self.graph, block);
        debug!(target: "strata::lower", block = %block, "lowering block");

        let graph = self.graph;
        for &id in &graph.block(block).nodes {
            if !self.state.is_valid() {
                break;
            }
            self.lower_node(id);
        }

        if !self.b.is_terminated() {
            if self.state.is_valid() {
                self.crash("block fell through without a terminal");
            }
            self.end_unreachable();
        }
    }

    fn lower_node(&mut self, id: NodeId) {
        let graph = self.graph;
        let node = graph.node(id);
        self.node = Some(id);
        self.origin = node.origin;
        trace!(target: "strata::lower", node = %id, op = node.op.name(), "lowering node");

        dispatch(self, id, node);
        self.stats.nodes_lowered += 1;

        if self.state.is_valid() && !self.b.is_terminated() {
            if !self.state.execute(id) {
                // Nothing after this node can run; the checks just emitted
                // always fail.
                self.end_unreachable();
            }
        } else if !self.b.is_terminated() {
            self.end_unreachable();
        }
        self.availability.execute(graph, id);
    }

    /// Finish and hand out the results.
    pub fn finish(self) -> LoweredFunction {
        debug!(
            target: "strata::lower",
            function = %self.graph.name,
            checks = self.stats.checks_emitted,
            elided = self.stats.checks_elided,
            exits = self.stats.exits,
            "lowered function"
        );
        LoweredFunction {
            lir: self.b.finish(),
            exits: self.exits,
            ics: self.ics,
            stats: self.stats,
        }
    }

    /// Instructions emitted so far.
    pub fn inst_count(&self) -> usize {
        self.b.inst_count()
    }

    /// Counters so far.
    pub fn stats(&self) -> LoweringStats {
        self.stats
    }

    /// Abort the process: lowering reached a state that would miscompile.
    pub(crate) fn crash(&self, message: impl fmt::Display) -> ! {
        let op = self.node.map(|id| self.graph.node(id).op.name()).unwrap_or("-");
        error!(
            target: "strata::lower",
            function = %self.graph.name,
            block = %self.block,
            node = ?self.node,
            op,
            "{message}"
        );
        panic!(
            "strata lowering crash in {} at {} {:?} ({op}): {message}",
            self.graph.name, self.block, self.node
        );
    }

    // ---- control plumbing ----

    /// End the current block as unreachable and treat every block it
    /// dominates as unreachable too.
    pub(crate) fn end_unreachable(&mut self) {
        self.b.unreachable();
        self.state.invalidate();
        self.invalidate_dominated();
    }

    pub(crate) fn invalidate_dominated(&mut self) {
        let current = self.block;
        for block in self.graph.block_indices() {
            if self.dominators.strictly_dominates(current, block) {
                self.state.mark_for_reverification(block);
            }
        }
    }

    /// LIR block a branch to `target` should use. Targets with phis get an
    /// edge block passing the pending upsilon values.
    pub(crate) fn successor_block(&mut self, target: BlockIndex) -> BlockId {
        let args = self.phi_arguments(target);
        let block = self.block_map[target.index()];
        if args.is_empty() {
            return block;
        }
        let here = self.b.current();
        let edge = self.b.create_block();
        self.b.switch_to(edge);
        self.b.jump(block, args);
        self.b.switch_to(here);
        edge
    }

    fn phi_arguments(&self, target: BlockIndex) -> Vec<Value> {
        self.graph
            .phis(target)
            .map(|phi| match self.pending_upsilons.get(&phi) {
                Some(&value) => value,
                None => self.crash(format_args!("no upsilon for {phi} on edge to {target}")),
            })
            .collect()
    }

    /// Emit a diamond computing a value of type `ty`.
    pub(crate) fn diamond(
        &mut self,
        ty: Type,
        cond: Value,
        weight: BranchWeight,
        then_arm: impl FnOnce(&mut Self) -> Value,
        else_arm: impl FnOnce(&mut Self) -> Value,
    ) -> Value {
        let then_block = self.b.create_block();
        let else_block = self.b.create_block();
        let join = self.b.create_block();
        let result = self.b.append_block_param(join, ty);
        self.b.branch(cond, then_block, else_block, weight);

        self.arm_depth += 1;
        self.b.switch_to(then_block);
        let value = then_arm(self);
        self.b.jump(join, vec![value]);
        self.b.switch_to(else_block);
        let value = else_arm(self);
        self.b.jump(join, vec![value]);
        self.arm_depth -= 1;

        self.b.switch_to(join);
        result
    }

    /// Run `arm` only when `cond` holds.
    pub(crate) fn when(&mut self, cond: Value, weight: BranchWeight, arm: impl FnOnce(&mut Self)) {
        let then_block = self.b.create_block();
        let join = self.b.create_block();
        self.b.branch(cond, then_block, join, weight);
        self.arm_depth += 1;
        self.b.switch_to(then_block);
        arm(self);
        if !self.b.is_terminated() {
            self.b.jump(join, Vec::new());
        }
        self.arm_depth -= 1;
        self.b.switch_to(join);
    }

    // ---- result bookkeeping ----

    /// Record the result of the current node in its natural representation.
    pub(crate) fn set_result(&mut self, id: NodeId, value: Value) {
        let repr = match self.graph.node(id).result {
            NodeResult::Int32 => Repr::Int32,
            NodeResult::Int52 => Repr::StrictInt52,
            NodeResult::Double => Repr::Double,
            NodeResult::Boolean => Repr::Boolean,
            NodeResult::Cell | NodeResult::JsValue => Repr::JsValue,
            NodeResult::Storage => Repr::Storage,
            NodeResult::None => self.crash(format_args!("{id} has no result")),
        };
        self.set_value(id, repr, value);
    }

    /// Record `value` as `id` in `repr`.
    pub(crate) fn set_value(&mut self, id: NodeId, repr: Repr, value: Value) {
        if self.arm_depth == 0 {
            self.values.insert(id, repr, value, self.block);
        }
    }

    /// Cached value of `id` in `repr`, if one dominates the current block.
    pub(crate) fn cached(&self, id: NodeId, repr: Repr) -> Option<Value> {
        self.values.get(id, repr, self.block, &self.dominators)
    }

    /// Call a helper; the backend passes the context first.
    pub(crate) fn call_helper(&mut self, helper: HelperKind, args: &[Value]) -> Value {
        if args.len() != helper.param_count() {
            self.crash(format_args!(
                "{helper:?} takes {} arguments, got {}",
                helper.param_count(),
                args.len()
            ));
        }
        self.b.call(helper, args.to_vec())
    }

    /// Emit the barrier for a pointer store into `cell`.
    pub(crate) fn write_barrier(&mut self, cell: Value) {
        let mark = self
            .b
            .load8(cell, self.layout.field_offset(crate::object_layout::FieldKind::GcMark));
        let marked = self.b.icmp_imm(IntCC::Ne, mark, 0);
        self.when(marked, BranchWeight::TakenRare, |cx| {
            cx.call_helper(HelperKind::WriteBarrier, &[cell]);
        });
    }
}

/// Nodes whose only uses are exit hints: unchecked int32 additions and
/// subtractions of int32 values. They are not computed; an exit needing one
/// recovers it from the operands.
fn exit_only_nodes(graph: &Graph) -> FxHashSet<NodeId> {
    let mut real_uses: FxHashSet<NodeId> = FxHashSet::default();
    for node in &graph.nodes {
        if matches!(node.op, Op::MovHint(_) | Op::PutHint(_) | Op::Phantom | Op::Check) {
            continue;
        }
        for edge in &node.children {
            real_uses.insert(edge.node);
        }
    }
    graph
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| {
            let id = NodeId(index as u32);
            let candidate = matches!(
                node.op,
                Op::ArithAdd(strata_ir::ArithMode::Unchecked | strata_ir::ArithMode::DoOverflow)
                    | Op::ArithSub(strata_ir::ArithMode::Unchecked | strata_ir::ArithMode::DoOverflow)
            ) && node.result == NodeResult::Int32
                && node
                    .children
                    .iter()
                    .all(|edge| matches!(edge.use_kind, UseKind::Int32 | UseKind::KnownInt32));
            (candidate && !real_uses.contains(&id)).then_some(id)
        })
        .collect()
}

/// LIR type holding a node result.
pub(crate) fn repr_type(result: NodeResult) -> Type {
    match result {
        NodeResult::Int32 | NodeResult::Boolean => Type::I32,
        NodeResult::Double => Type::F64,
        _ => Type::I64,
    }
}

fn dispatch(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    match &node.op {
        // constants and plumbing
        Op::JsConstant(_) | Op::DoubleConstant(_) | Op::Int52Constant(_) => {}
        Op::Identity => values::identity(cx, id, node),
        Op::Phantom | Op::Check => values::discharge_edges(cx, node),
        Op::BottomValue => cx.end_unreachable(),

        // frame and SSA
        Op::GetStack(data) => get_stack(cx, id, data.machine_local, data.format),
        Op::PutStack(data) => put_stack(cx, node, data.machine_local, data.format),
        Op::KillStack(_)
        | Op::MovHint(_)
        | Op::ZombieHint(_)
        | Op::SetArgument(_)
        | Op::LoopHint
        | Op::PutHint(_) => {}
        Op::Phi => {
            let Some(&param) = cx.phi_params.get(&id) else {
                cx.crash("phi without a block parameter");
            };
            cx.set_result(id, param);
        }
        Op::Upsilon(phi) => upsilon(cx, node, *phi),
        Op::GetCallee => {
            let callee = cx.b.load64(cx.frame, 8 * abi::FRAME_CALLEE);
            cx.set_result(id, callee);
        }
        Op::GetArgumentCount => {
            let count = cx.b.load32(cx.frame, 8 * abi::FRAME_ARGUMENT_COUNT);
            cx.set_result(id, count);
        }
        Op::InvalidationPoint => {
            let flag = cx.b.load32(cx.ctx, abi::CTX_INVALIDATED);
            let invalidated = cx.b.icmp_imm(IntCC::Ne, flag, 0);
            cx.speculate(ExitKind::UncountableInvalidation, None, invalidated);
        }
        Op::CountExecution(address) => {
            let counter = cx.b.i64(*address as i64);
            let count = cx.b.load64(counter, 0);
            let next = cx.b.add_imm(count, 1);
            cx.b.store64(next, counter, 0);
        }

        // representations
        Op::DoubleRep => values::double_rep(cx, id, node),
        Op::ValueRep => values::value_rep(cx, id, node),
        Op::Int52Rep => values::int52_rep(cx, id, node),
        Op::BooleanToNumber => values::boolean_to_number(cx, id, node),
        Op::DoubleAsInt32(mode) => values::double_as_int32(cx, id, node, *mode),
        Op::ValueToInt32 => values::value_to_int32(cx, id, node),
        Op::UInt32ToNumber(mode) => values::uint32_to_number(cx, id, node, *mode),

        // arithmetic
        Op::ArithAdd(mode) => arith::add_or_sub(cx, id, node, *mode, false),
        Op::ArithSub(mode) => arith::add_or_sub(cx, id, node, *mode, true),
        Op::ArithMul(mode) => arith::mul(cx, id, node, *mode),
        Op::ArithDiv(mode) => arith::div(cx, id, node, *mode),
        Op::ArithMod(mode) => arith::modulo(cx, id, node, *mode),
        Op::ArithNegate(mode) => arith::negate(cx, id, node, *mode),
        Op::ArithAbs(mode) => arith::abs(cx, id, node, *mode),
        Op::ArithMin => arith::min_max(cx, id, node, false),
        Op::ArithMax => arith::min_max(cx, id, node, true),
        Op::ArithSqrt | Op::ArithSin | Op::ArithCos | Op::ArithLog | Op::ArithFRound => {
            arith::unary_math(cx, id, node)
        }
        Op::ArithPow => arith::pow(cx, id, node),
        Op::ArithRound(mode) => arith::round(cx, id, node, *mode),
        Op::ArithClz32 => arith::clz32(cx, id, node),
        Op::ValueAdd => arith::value_add(cx, id, node),
        Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitLShift | Op::BitRShift | Op::BitURShift => {
            arith::bitop(cx, id, node)
        }

        // comparisons and type queries
        Op::CompareLess | Op::CompareLessEq | Op::CompareGreater | Op::CompareGreaterEq => {
            compare::relational(cx, id, node)
        }
        Op::CompareEq | Op::CompareStrictEq => compare::equality(cx, id, node),
        Op::CompareEqConstant => compare::eq_null(cx, id, node),
        Op::LogicalNot => compare::logical_not(cx, id, node),
        Op::IsUndefined
        | Op::IsBoolean
        | Op::IsNumber
        | Op::IsString
        | Op::IsObject
        | Op::IsObjectOrNull
        | Op::IsFunction
        | Op::IsArrayObject => compare::type_query(cx, id, node),
        Op::TypeOf => compare::type_of(cx, id, node),

        // checks
        Op::CheckStructure(set) => objects::check_structure(cx, node, set),
        Op::CheckCell(value) => objects::check_cell(cx, node, value),
        Op::CheckBadCell => cx.terminate(ExitKind::BadCell),
        Op::CheckNotEmpty => objects::check_not_empty(cx, node),
        Op::CheckInBounds => arrays::check_in_bounds(cx, node),
        Op::CheckArray(mode) => arrays::check_array(cx, node, *mode),
        Op::CheckHasInstance => objects::check_has_instance(cx, node),
        Op::ForceOsrExit => cx.terminate(ExitKind::InadequateCoverage),

        // object model
        Op::GetButterfly => objects::get_butterfly(cx, id, node),
        Op::AllocatePropertyStorage(transition) => {
            objects::allocate_property_storage(cx, id, node, *transition)
        }
        Op::ReallocatePropertyStorage(transition) => {
            objects::reallocate_property_storage(cx, id, node, *transition)
        }
        Op::GetByOffset(data) => objects::get_by_offset(cx, id, node, data.offset),
        Op::PutByOffset(data) => objects::put_by_offset(cx, node, data.offset),
        Op::MultiGetByOffset(cases) => objects::multi_get_by_offset(cx, id, node, cases),
        Op::MultiPutByOffset(variants) => objects::multi_put_by_offset(cx, node, variants),
        Op::PutStructure(transition) => objects::put_structure(cx, node, *transition),
        Op::NewObject(structure) => objects::new_object(cx, id, *structure),
        Op::StoreBarrier => {
            let cell = cx.lower_js_value(node.child1());
            cx.write_barrier(cell);
        }
        Op::GetGlobalVar(address) => objects::get_global_var(cx, id, *address),
        Op::PutGlobalVar(address) => objects::put_global_var(cx, node, *address),
        Op::GetScope | Op::SkipScope | Op::GetExecutable => objects::load_link(cx, id, node),
        Op::GetClosureVar(index) => objects::get_closure_var(cx, id, node, *index),
        Op::PutClosureVar(index) => objects::put_closure_var(cx, node, *index),
        Op::NewFunction => objects::new_function(cx, id, node),
        Op::CreateActivation(structure) => objects::create_activation(cx, id, node, *structure),
        Op::CreateDirectArguments | Op::CreateScopedArguments | Op::CreateClonedArguments => {
            objects::create_arguments(cx, id, node)
        }
        Op::GetFromArguments(index) => objects::get_from_arguments(cx, id, node, *index),
        Op::PutToArguments(index) => objects::put_to_arguments(cx, node, *index),
        Op::GetMyArgumentByVal => arrays::get_my_argument_by_val(cx, id, node),
        Op::PhantomNewObject
        | Op::PhantomNewFunction
        | Op::PhantomCreateActivation
        | Op::PhantomDirectArguments
        | Op::PhantomClonedArguments => {}
        Op::MaterializeNewObject(data) => objects::materialize_new_object(cx, id, node, data),
        Op::MaterializeCreateActivation(data) => {
            objects::materialize_create_activation(cx, id, node, data)
        }

        // indexed access
        Op::GetArrayLength(mode) => arrays::get_array_length(cx, id, node, *mode),
        Op::GetByVal(mode) => arrays::get_by_val(cx, id, node, *mode),
        Op::PutByVal(mode) => arrays::put_by_val(cx, node, *mode),
        Op::ArrayPush(mode) => arrays::array_push(cx, id, node, *mode),
        Op::ArrayPop(mode) => arrays::array_pop(cx, id, node, *mode),
        Op::HasIndexedProperty(mode) => arrays::has_indexed_property(cx, id, node, *mode),
        Op::GetIndexedPropertyStorage(mode) => arrays::get_indexed_property_storage(cx, id, node, *mode),
        Op::GetTypedArrayByteOffset => {
            let view = cx.lower_js_value(node.child1());
            let offset = cx.call_helper(HelperKind::TypedArrayByteOffset, &[view]);
            let offset = cx.b.trunc(offset);
            cx.set_result(id, offset);
        }
        Op::StringCharAt(mode) => arrays::string_char_at(cx, id, node, *mode),
        Op::StringCharCodeAt(mode) => arrays::string_char_code_at(cx, id, node, *mode),
        Op::NewArray(data) => arrays::new_array(cx, id, node, *data),
        Op::NewArrayWithSize(data) => arrays::new_array_with_size(cx, id, node, *data),
        Op::NewArrayBuffer(data, elements) => arrays::new_array_buffer(cx, id, *data, elements),

        // inline caches and calls
        Op::GetById(identifier) => calls::get_by_id(cx, id, node, *identifier),
        Op::PutById(identifier) => calls::put_by_id(cx, node, *identifier, false),
        Op::PutByIdDirect(identifier) => calls::put_by_id(cx, node, *identifier, true),
        Op::In => calls::in_(cx, id, node),
        Op::Call | Op::Construct => calls::call(cx, id, node),
        Op::CallVarargs(data) | Op::ConstructVarargs(data) => {
            calls::call_varargs(cx, id, node, *data)
        }
        Op::CallForwardVarargs(data) => calls::call_forward_varargs(cx, id, node, *data),
        Op::LoadVarargs(data) => calls::load_varargs(cx, node, *data),
        Op::ForwardVarargs(data) => calls::forward_varargs(cx, *data),

        // conversions
        Op::ToThis => objects::to_this(cx, id, node),
        Op::ToPrimitive => objects::to_primitive(cx, id, node),
        Op::ToString => objects::to_string(cx, id, node),
        Op::MakeRope => objects::make_rope(cx, id, node),
        Op::InstanceOf => objects::instance_of(cx, id, node),
        Op::Throw => {
            let value = cx.lower_js_value(node.child1());
            let marker = cx.call_helper(HelperKind::Throw, &[value]);
            cx.b.ret(marker);
        }
        Op::ThrowReferenceError(identifier) => {
            let identifier = cx.b.i64(identifier.0 as i64);
            let marker = cx.call_helper(HelperKind::ThrowReferenceError, &[identifier]);
            cx.b.ret(marker);
        }

        // control
        Op::Jump(target) => {
            let args = cx.phi_arguments(*target);
            let block = cx.block_map[target.index()];
            cx.b.jump(block, args);
        }
        Op::Branch(data) => branch(cx, node, data.taken, data.not_taken),
        Op::Switch(data) => switch::lower_switch(cx, node, data),
        Op::Return => {
            let value = cx.lower_js_value(node.child1());
            cx.b.ret(value);
        }
        Op::Unreachable => cx.b.unreachable(),
    }
}

fn get_stack(cx: &mut LowerCx<'_>, id: NodeId, slot: strata_ir::Operand, format: FlushFormat) {
    let offset = abi::frame_offset(slot);
    let frame = cx.frame;
    let (repr, value) = match format {
        FlushFormat::Int32 => (Repr::Int32, cx.b.load32(frame, offset)),
        FlushFormat::Boolean => (Repr::Boolean, cx.b.load32(frame, offset)),
        FlushFormat::Int52 => (Repr::Int52, cx.b.load64(frame, offset)),
        FlushFormat::Double => (
            Repr::Double,
            cx.b.load(Type::F64, MemWidth::F64, false, frame, offset),
        ),
        FlushFormat::Cell | FlushFormat::JsValue => (Repr::JsValue, cx.b.load64(frame, offset)),
        FlushFormat::Dead | FlushFormat::Conflicting => {
            cx.crash(format_args!("GetStack of a {format:?} slot"))
        }
    };
    cx.set_value(id, repr, value);
}

fn put_stack(cx: &mut LowerCx<'_>, node: &Node, slot: strata_ir::Operand, format: FlushFormat) {
    let offset = abi::frame_offset(slot);
    let edge = node.child1();
    match format {
        FlushFormat::Int32 => {
            let value = cx.lower_int32(edge);
            cx.b.store(MemWidth::W32, value, cx.frame, offset);
        }
        FlushFormat::Boolean => {
            let value = cx.lower_boolean(edge);
            cx.b.store(MemWidth::W32, value, cx.frame, offset);
        }
        FlushFormat::Int52 => {
            let value = cx.lower_int52(edge);
            cx.b.store64(value, cx.frame, offset);
        }
        FlushFormat::Double => {
            let value = cx.lower_double(edge);
            cx.b.store(MemWidth::F64, value, cx.frame, offset);
        }
        FlushFormat::Cell | FlushFormat::JsValue => {
            let value = cx.lower_js_value(edge);
            cx.b.store64(value, cx.frame, offset);
        }
        FlushFormat::Dead | FlushFormat::Conflicting => {
            cx.crash(format_args!("PutStack of a {format:?} slot"))
        }
    }
}

fn upsilon(cx: &mut LowerCx<'_>, node: &Node, phi: NodeId) {
    let edge = node.child1();
    let value = match cx.graph.node(phi).result {
        NodeResult::Int32 => cx.lower_int32(edge),
        NodeResult::Int52 => cx.lower_strict_int52(edge),
        NodeResult::Double => cx.lower_double(edge),
        NodeResult::Boolean => cx.lower_boolean(edge),
        NodeResult::Cell | NodeResult::JsValue => cx.lower_js_value(edge),
        other => cx.crash(format_args!("phi {phi} with {other:?} result")),
    };
    cx.pending_upsilons.insert(phi, value);
}

fn branch(cx: &mut LowerCx<'_>, node: &Node, taken: BlockIndex, not_taken: BlockIndex) {
    if let Some(direction) = cx.state.branch_direction(node) {
        let target = if direction { taken } else { not_taken };
        trace!(target: "strata::lower", direction, target = %target, "branch folded");
        let args = cx.phi_arguments(target);
        let block = cx.block_map[target.index()];
        cx.b.jump(block, args);
        return;
    }
    let cond = compare::truthiness(cx, node.child1());
    let taken_args = cx.phi_arguments(taken);
    let not_taken_args = cx.phi_arguments(not_taken);
    let taken = cx.block_map[taken.index()];
    let not_taken = cx.block_map[not_taken.index()];
    cx.b.terminate(Terminator::Branch {
        cond,
        taken,
        taken_args,
        not_taken,
        not_taken_args,
        weight: BranchWeight::Normal,
    });
}

/// Children of `node` as edges, for routines taking a variable count.
pub(crate) fn edges(node: &Node) -> impl Iterator<Item = Edge> + '_ {
    node.children.iter().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_layout::DefaultObjectLayout;
    use crate::testing;
    use strata_ir::GraphBuilder;

    fn always_exits() -> Graph {
        let mut b = GraphBuilder::new("always_exits", 2, 0);
        let entry = b.entry();
        let x = testing::get_argument(&mut b, entry, 1);
        b.add(entry, Op::ForceOsrExit, [], NodeResult::None);
        b.add(entry, Op::Return, [Edge::untyped(x)], NodeResult::None);
        b.build().expect("valid graph")
    }

    #[test]
    fn ending_an_ended_block_emits_nothing() {
        let graph = always_exits();
        let options = LoweringOptions::default();
        let mut cx = LowerCx::new(&graph, &options, &DefaultObjectLayout);
        cx.lower_block(BlockIndex(0));
        let stats = cx.stats();
        let insts = cx.inst_count();
        let exits = cx.exits.exits.len();
        assert_eq!(stats.terminated_blocks, 1);
        assert_eq!(stats.exits, 1);

        cx.lower_block(BlockIndex(0));
        cx.terminate(ExitKind::BadType);
        cx.terminate(ExitKind::InadequateCoverage);
        assert_eq!(cx.stats(), stats);
        assert_eq!(cx.inst_count(), insts);
        assert_eq!(cx.exits.exits.len(), exits);

        let lowered = cx.finish();
        assert!(matches!(
            testing::run(&lowered, &[crate::value::box_int32(1)]),
            crate::lir::eval::EvalOutcome::Exited { .. }
        ));
    }
}
