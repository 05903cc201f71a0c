//! Forward abstract interpreter over a [`Graph`].
//!
//! [`AbstractState::run_fixpoint`] computes, for every block, the facts that
//! hold at its head. Lowering then replays each block from its head with
//! [`AbstractState::begin_block`] and [`AbstractState::execute`], so that
//! every check sees exactly the facts established by the nodes before it.
//!
//! A node's facts are stored under its [`NodeId`]. A node absent from the
//! current map has not executed on any path reaching this point.

use rustc_hash::FxHashMap;
use strata_ir::{
    ArrayMode, ArrayType, BlockIndex, CellType, Dominators, FlushFormat, FrozenValue, Graph,
    Node, NodeId, NodeResult, Op, RoundingMode, SpeculatedType, StructureSet, UseKind,
};
use tracing::{debug, trace};

use crate::abstract_value::{AbstractValue, StructureAbstractValue};

/// Per-block results of the fixpoint.
#[derive(Debug, Clone, Default)]
struct BlockFacts {
    head: FxHashMap<NodeId, AbstractValue>,
    tail: FxHashMap<NodeId, AbstractValue>,
    cfa_has_visited: bool,
    should_reverify: bool,
}

/// Abstract interpreter state.
#[derive(Debug)]
pub struct AbstractState<'g> {
    graph: &'g Graph,
    structure_limit: usize,
    blocks: Vec<BlockFacts>,
    current: FxHashMap<NodeId, AbstractValue>,
    block: Option<BlockIndex>,
    valid: bool,
}

impl<'g> AbstractState<'g> {
    /// State for `graph`; nothing is reached until the fixpoint runs.
    pub fn new(graph: &'g Graph, structure_limit: usize) -> Self {
        Self {
            graph,
            structure_limit,
            blocks: vec![BlockFacts::default(); graph.blocks.len()],
            current: FxHashMap::default(),
            block: None,
            valid: false,
        }
    }

    /// Propagate facts from the entry until no block head changes.
    pub fn run_fixpoint(&mut self, dominators: &Dominators) {
        let graph = self.graph;
        let order = strata_ir::dominators::reverse_postorder(graph);
        if let Some(entry) = self.blocks.first_mut() {
            entry.cfa_has_visited = true;
        }
        let mut dirty = vec![false; self.blocks.len()];
        if let Some(first) = dirty.first_mut() {
            *first = true;
        }

        let mut iterations = 0u32;
        loop {
            let mut changed = false;
            for &block in &order {
                if !dirty[block.index()] || !dominators.is_reachable(block) {
                    continue;
                }
                dirty[block.index()] = false;
                self.begin_block(block);
                for &id in &graph.block(block).nodes {
                    if !self.execute(id) {
                        break;
                    }
                }
                let tail = std::mem::take(&mut self.current);
                let successors = if self.valid {
                    self.flowing_successors(block, &tail)
                } else {
                    Vec::new()
                };
                for succ in successors {
                    if self.merge_into(succ, &tail) {
                        dirty[succ.index()] = true;
                        changed = true;
                    }
                }
                self.blocks[block.index()].tail = tail;
                self.block = None;
            }
            iterations += 1;
            if !changed {
                break;
            }
        }
        debug!(
            target: "strata::abstract",
            function = %self.graph.name,
            iterations,
            "abstract fixpoint converged"
        );
    }

    fn flowing_successors(
        &self,
        block: BlockIndex,
        tail: &FxHashMap<NodeId, AbstractValue>,
    ) -> Vec<BlockIndex> {
        let Some(terminal) = self.graph.terminal(block) else {
            return Vec::new();
        };
        let node = self.graph.node(terminal);
        match &node.op {
            Op::Branch(data) => {
                let direction = tail
                    .get(&node.child1().node)
                    .and_then(|value| branch_truthiness(value, node.child1().use_kind));
                match direction {
                    Some(true) => vec![data.taken],
                    Some(false) => vec![data.not_taken],
                    None => vec![data.taken, data.not_taken],
                }
            }
            op => op.successors().into_vec(),
        }
    }

    fn merge_into(&mut self, block: BlockIndex, tail: &FxHashMap<NodeId, AbstractValue>) -> bool {
        let limit = self.structure_limit;
        let facts = &mut self.blocks[block.index()];
        let mut changed = !facts.cfa_has_visited;
        facts.cfa_has_visited = true;
        for (id, value) in tail {
            match facts.head.get_mut(id) {
                Some(existing) => changed |= existing.merge(value, limit),
                None => {
                    if !value.is_bottom() {
                        facts.head.insert(*id, value.clone());
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// The fixpoint reached `block`.
    pub fn cfa_has_visited(&self, block: BlockIndex) -> bool {
        self.blocks[block.index()].cfa_has_visited
    }

    /// Restart `block` with no facts about any node except their result bounds.
    ///
    /// Used for blocks dominated by code that was terminated during lowering:
    /// the facts the fixpoint computed for them may rely on paths lowering
    /// did not emit.
    pub fn mark_for_reverification(&mut self, block: BlockIndex) {
        let graph = self.graph;
        let facts = &mut self.blocks[block.index()];
        if facts.should_reverify {
            return;
        }
        facts.should_reverify = true;
        for (id, value) in facts.head.iter_mut() {
            *value = AbstractValue::from_type(graph.node(*id).result.type_bound());
        }
    }

    /// `block` was marked for reverification.
    pub fn needs_reverification(&self, block: BlockIndex) -> bool {
        self.blocks[block.index()].should_reverify
    }

    /// Load the head facts of `block`.
    pub fn begin_block(&mut self, block: BlockIndex) {
        let facts = &self.blocks[block.index()];
        self.current = facts.head.clone();
        self.valid = facts.cfa_has_visited;
        self.block = Some(block);
        trace!(target: "strata::abstract", block = %block, valid = self.valid, "begin block");
    }

    /// Block being interpreted.
    pub fn block(&self) -> Option<BlockIndex> {
        self.block
    }

    /// No contradiction has been found in the current block.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Record that control cannot reach the current point.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Facts about `node` at the current point.
    pub fn for_node(&self, node: NodeId) -> AbstractValue {
        match self.current.get(&node) {
            Some(value) => value.clone(),
            None => AbstractValue::from_type(self.graph.node(node).result.type_bound()),
        }
    }

    /// Type of `node` at the current point.
    pub fn type_of(&self, node: NodeId) -> SpeculatedType {
        match self.current.get(&node) {
            Some(value) => value.ty,
            None => self.graph.node(node).result.type_bound(),
        }
    }

    fn slot(&mut self, node: NodeId) -> &mut AbstractValue {
        let bound = self.graph.node(node).result.type_bound();
        self.current
            .entry(node)
            .or_insert_with(|| AbstractValue::from_type(bound))
    }

    fn set(&mut self, node: NodeId, value: AbstractValue) {
        self.current.insert(node, value);
    }

    /// Narrow `node` to `mask`; invalidates the state on contradiction.
    pub fn filter(&mut self, node: NodeId, mask: SpeculatedType) -> bool {
        let ok = self.slot(node).filter(mask);
        if !ok {
            self.valid = false;
        }
        ok
    }

    /// Narrow `node` to `set`; invalidates the state on contradiction.
    pub fn filter_structures(&mut self, node: NodeId, set: &StructureSet) -> bool {
        let ok = self.slot(node).filter_structures(set);
        if !ok {
            self.valid = false;
        }
        ok
    }

    /// Narrow `node` to exactly `value`; invalidates the state on contradiction.
    pub fn filter_value(&mut self, node: NodeId, value: &FrozenValue) -> bool {
        let graph = self.graph;
        let registry = &graph.structures;
        let ok = match self.current.get_mut(&node) {
            Some(existing) => existing.filter_value(value, registry),
            None => {
                let mut fresh = AbstractValue::from_type(graph.node(node).result.type_bound());
                let ok = fresh.filter_value(value, registry);
                self.current.insert(node, fresh);
                ok
            }
        };
        if !ok {
            self.valid = false;
        }
        ok
    }

    /// Direction a `Branch` on `node` is proven to take.
    pub fn branch_direction(&self, node: &Node) -> Option<bool> {
        let edge = node.child1();
        branch_truthiness(&self.for_node(edge.node), edge.use_kind)
    }

    /// Execute `id` assuming it does not exit. Returns whether the state is
    /// still valid afterwards.
    pub fn execute(&mut self, id: NodeId) -> bool {
        if !self.valid {
            return false;
        }
        let graph = self.graph;
        let node = graph.node(id);

        for edge in &node.children {
            if edge.use_kind != UseKind::Untyped && !self.filter(edge.node, edge.use_kind.type_filter())
            {
                trace!(
                    target: "strata::abstract",
                    node = %id,
                    op = node.op.name(),
                    "edge filter contradiction"
                );
                return false;
            }
        }

        self.transfer(id, node);

        if self.valid && node.op.clobbers_world() {
            for value in self.current.values_mut() {
                value.clobber_structures();
            }
        }
        self.valid
    }

    fn transfer(&mut self, id: NodeId, node: &'g Node) {
        let graph = self.graph;
        let registry = &graph.structures;
        match &node.op {
            Op::JsConstant(value) => {
                self.set(id, AbstractValue::constant(value.clone(), registry));
            }
            Op::DoubleConstant(bits) => {
                let mut value = AbstractValue::from_type(SpeculatedType::from_double(f64::from_bits(*bits)));
                value.value = Some(FrozenValue::Double(*bits));
                self.set(id, value);
            }
            Op::Int52Constant(v) => {
                let value = match i32::try_from(*v) {
                    Ok(small) => AbstractValue::constant(FrozenValue::Int32(small), registry),
                    Err(_) => {
                        let mut value = AbstractValue::from_type(SpeculatedType::INT52);
                        value.value = Some(FrozenValue::double(*v as f64));
                        value
                    }
                };
                self.set(id, value);
            }
            Op::Identity => {
                let value = self.for_node(node.child1().node);
                self.set(id, value);
            }
            Op::BottomValue => self.set(id, AbstractValue::bottom()),
            Op::GetStack(data) => {
                let ty = match data.format {
                    FlushFormat::Int32 => SpeculatedType::INT32,
                    FlushFormat::Int52 => SpeculatedType::MACHINE_INT,
                    FlushFormat::Double => SpeculatedType::FULL_DOUBLE,
                    FlushFormat::Boolean => SpeculatedType::BOOLEAN,
                    FlushFormat::Cell => SpeculatedType::CELL,
                    FlushFormat::JsValue | FlushFormat::Dead | FlushFormat::Conflicting => {
                        SpeculatedType::BYTECODE_TOP
                    }
                };
                self.set(id, AbstractValue::from_type(ty));
            }
            Op::Phi => {
                if !self.current.contains_key(&id) {
                    self.set(id, AbstractValue::from_type(node.result.type_bound()));
                }
            }
            Op::Upsilon(phi) => {
                let value = self.for_node(node.child1().node);
                self.set(*phi, value);
            }
            Op::GetCallee => self.set(id, AbstractValue::from_type(SpeculatedType::FUNCTION)),
            Op::GetArgumentCount => self.set(id, AbstractValue::from_type(SpeculatedType::INT32)),

            Op::DoubleRep => {
                let child = self.for_node(node.child1().node);
                let mut value = AbstractValue::from_type(double_rep_type(child.ty));
                value.value = child
                    .value
                    .as_ref()
                    .and_then(FrozenValue::as_number)
                    .map(FrozenValue::double);
                self.set(id, value);
            }
            Op::ValueRep => {
                let child = self.for_node(node.child1().node);
                let mut ty = child.ty;
                if ty.could_be_impure_nan() {
                    ty = ty.without(SpeculatedType::DOUBLE_IMPURE_NAN) | SpeculatedType::DOUBLE_PURE_NAN;
                }
                let mut value = AbstractValue::from_type(ty);
                value.value = child.value;
                value.structures = child.structures;
                self.set(id, value);
            }
            Op::Int52Rep => {
                let child = self.type_of(node.child1().node);
                let ty = if child.is_int32() {
                    child
                } else {
                    SpeculatedType::MACHINE_INT
                };
                self.set(id, AbstractValue::from_type(ty));
            }
            Op::BooleanToNumber => {
                let child = self.for_node(node.child1().node);
                let mut ty = child.ty.without(SpeculatedType::BOOLEAN);
                if child.ty.overlaps(SpeculatedType::BOOLEAN) {
                    ty |= SpeculatedType::BOOL_INT32;
                }
                let mut value = AbstractValue::from_type(ty);
                value.value = match child.value {
                    Some(FrozenValue::Boolean(b)) => Some(FrozenValue::Int32(b as i32)),
                    other => other,
                };
                self.set(id, value);
            }

            Op::ArithAdd(_) | Op::ArithSub(_) | Op::ArithMul(_) => {
                let folded = self.fold_int32(node, |a, b| match &node.op {
                    Op::ArithAdd(_) => a.checked_add(b),
                    Op::ArithSub(_) => a.checked_sub(b),
                    _ => a.checked_mul(b).filter(|r| *r != 0 || (a >= 0 && b >= 0)),
                });
                let value = folded.unwrap_or_else(|| self.numeric_result(node));
                self.set(id, value);
            }
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitLShift | Op::BitRShift | Op::BitURShift => {
                let folded = self.fold_int32(node, |a, b| match &node.op {
                    Op::BitAnd => Some(a & b),
                    Op::BitOr => Some(a | b),
                    Op::BitXor => Some(a ^ b),
                    Op::BitLShift => Some(a.wrapping_shl(b as u32)),
                    Op::BitRShift => Some(a.wrapping_shr(b as u32)),
                    _ => {
                        let r = (a as u32).wrapping_shr(b as u32);
                        i32::try_from(r).ok()
                    }
                });
                let fallback = if matches!(node.op, Op::BitURShift) && node.result != NodeResult::Int32 {
                    AbstractValue::from_type(node.result.type_bound())
                } else {
                    AbstractValue::from_type(SpeculatedType::INT32)
                };
                self.set(id, folded.unwrap_or(fallback));
            }
            Op::ArithDiv(_)
            | Op::ArithMod(_)
            | Op::ArithNegate(_)
            | Op::ArithAbs(_)
            | Op::ArithMin
            | Op::ArithMax
            | Op::ArithSqrt
            | Op::ArithSin
            | Op::ArithCos
            | Op::ArithLog
            | Op::ArithPow
            | Op::ArithFRound => {
                let value = self.numeric_result(node);
                self.set(id, value);
            }
            Op::ArithRound(mode) => {
                let ty = match mode {
                    RoundingMode::Double => SpeculatedType::BYTECODE_DOUBLE,
                    _ => SpeculatedType::INT32,
                };
                self.set(id, AbstractValue::from_type(ty));
            }
            Op::DoubleAsInt32(_) | Op::ValueToInt32 | Op::ArithClz32 | Op::GetTypedArrayByteOffset => {
                self.set(id, AbstractValue::from_type(SpeculatedType::INT32));
            }
            Op::UInt32ToNumber(_) => {
                let ty = match node.result {
                    NodeResult::Int32 => SpeculatedType::INT32,
                    NodeResult::Int52 => SpeculatedType::MACHINE_INT,
                    _ => SpeculatedType::INT32 | SpeculatedType::INT52_AS_DOUBLE,
                };
                self.set(id, AbstractValue::from_type(ty));
            }
            Op::ValueAdd => self.set(
                id,
                AbstractValue::from_type(SpeculatedType::STRING | SpeculatedType::BYTECODE_NUMBER),
            ),

            Op::CompareEq
            | Op::CompareStrictEq
            | Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEqConstant
            | Op::IsArrayObject
            | Op::InstanceOf
            | Op::In
            | Op::HasIndexedProperty(_) => {
                self.set(id, AbstractValue::from_type(SpeculatedType::BOOLEAN));
            }
            Op::LogicalNot => {
                let edge = node.child1();
                let truth = branch_truthiness(&self.for_node(edge.node), edge.use_kind);
                self.set(id, boolean_result(truth.map(|t| !t), registry));
            }
            Op::IsUndefined
            | Op::IsBoolean
            | Op::IsNumber
            | Op::IsString
            | Op::IsObject
            | Op::IsObjectOrNull
            | Op::IsFunction => {
                let child = self.type_of(node.child1().node);
                self.set(id, boolean_result(type_query(&node.op, child), registry));
            }
            Op::TypeOf | Op::ToString | Op::MakeRope | Op::StringCharAt(_) => {
                self.set(id, AbstractValue::from_type(SpeculatedType::STRING));
            }
            Op::ToPrimitive => {
                let child = self.for_node(node.child1().node);
                let value = if child.is_not_type(SpeculatedType::OBJECT) {
                    child
                } else {
                    AbstractValue::from_type(SpeculatedType::HEAP_TOP.without(SpeculatedType::OBJECT))
                };
                self.set(id, value);
            }
            Op::ToThis => {
                let child = self.for_node(node.child1().node);
                let value = if child.is_type(SpeculatedType::OBJECT) {
                    child
                } else {
                    AbstractValue::from_type(SpeculatedType::HEAP_TOP)
                };
                self.set(id, value);
            }

            Op::CheckStructure(set) => {
                self.filter_structures(node.child1().node, set);
            }
            Op::CheckCell(value) => {
                self.filter_value(node.child1().node, value);
            }
            Op::CheckNotEmpty => {
                self.filter(node.child1().node, !SpeculatedType::EMPTY);
            }
            Op::CheckArray(mode) => match array_mode_type(*mode) {
                Some(ty) => {
                    self.filter(node.child1().node, ty);
                }
                None => self.invalidate(),
            },
            Op::CheckBadCell | Op::ForceOsrExit | Op::Throw | Op::ThrowReferenceError(_) => {
                self.invalidate();
            }

            Op::NewObject(structure) => {
                let ty = self.structure_type(*structure);
                self.set(id, AbstractValue::with_structure(ty, *structure));
            }
            Op::NewArray(data) | Op::NewArrayWithSize(data) | Op::NewArrayBuffer(data, _) => {
                self.set(
                    id,
                    AbstractValue::with_structure(SpeculatedType::ARRAY, data.structure),
                );
            }
            Op::CreateActivation(structure) => {
                self.set(
                    id,
                    AbstractValue::with_structure(SpeculatedType::OBJECT_OTHER, *structure),
                );
            }
            Op::MaterializeNewObject(data) => {
                let ty = data
                    .structures
                    .iter()
                    .fold(SpeculatedType::NONE, |acc, s| acc | self.structure_type(s));
                let mut value = AbstractValue::from_type(ty);
                value.structures = StructureAbstractValue::Known(data.structures.clone());
                self.set(id, value);
            }
            Op::MaterializeCreateActivation(data) => {
                let mut value = AbstractValue::from_type(SpeculatedType::OBJECT_OTHER);
                value.structures = StructureAbstractValue::Known(data.structures.clone());
                self.set(id, value);
            }
            Op::NewFunction => self.set(id, AbstractValue::from_type(SpeculatedType::FUNCTION)),
            Op::CreateDirectArguments => {
                self.set(id, AbstractValue::from_type(SpeculatedType::DIRECT_ARGUMENTS));
            }
            Op::CreateScopedArguments => {
                self.set(id, AbstractValue::from_type(SpeculatedType::SCOPED_ARGUMENTS));
            }
            Op::CreateClonedArguments | Op::GetScope | Op::SkipScope => {
                self.set(id, AbstractValue::from_type(SpeculatedType::OBJECT_OTHER));
            }
            Op::GetExecutable => self.set(id, AbstractValue::from_type(SpeculatedType::CELL_OTHER)),
            Op::PutStructure(transition) => {
                let target = node.child1().node;
                let slot = self.slot(target);
                slot.structures = StructureAbstractValue::singleton(transition.next);
            }
            Op::MultiPutByOffset(variants) => {
                let mut after = StructureSet::new();
                for variant in variants {
                    match variant.new_structure {
                        Some(next) => {
                            after.insert(next);
                        }
                        None => {
                            after.merge(&variant.old_structures);
                        }
                    }
                }
                let slot = self.slot(node.child1().node);
                slot.structures = StructureAbstractValue::Known(after);
            }
            Op::MultiGetByOffset(cases) => {
                let mut constant: Option<&FrozenValue> = None;
                let mut all_constant = !cases.is_empty();
                for case in cases {
                    match &case.method {
                        strata_ir::GetByOffsetMethod::Constant(value)
                            if constant.is_none() || constant == Some(value) =>
                        {
                            constant = Some(value);
                        }
                        _ => all_constant = false,
                    }
                }
                let value = match constant {
                    Some(value) if all_constant => AbstractValue::constant(value.clone(), registry),
                    _ => AbstractValue::from_type(SpeculatedType::HEAP_TOP),
                };
                self.set(id, value);
            }
            Op::GetByOffset(_)
            | Op::GetById(_)
            | Op::GetByVal(_)
            | Op::GetFromArguments(_)
            | Op::GetMyArgumentByVal
            | Op::ArrayPop(_)
            | Op::Call
            | Op::Construct
            | Op::CallVarargs(_)
            | Op::ConstructVarargs(_)
            | Op::CallForwardVarargs(_) => {
                let ty = match node.result {
                    NodeResult::JsValue => SpeculatedType::HEAP_TOP,
                    other => other.type_bound(),
                };
                self.set(id, AbstractValue::from_type(ty));
            }
            Op::GetArrayLength(_) | Op::StringCharCodeAt(_) => {
                self.set(id, AbstractValue::from_type(SpeculatedType::INT32));
            }
            Op::ArrayPush(_) => {
                self.set(id, AbstractValue::from_type(SpeculatedType::BYTECODE_NUMBER));
            }

            Op::Branch(_)
            | Op::Jump(_)
            | Op::Switch(_)
            | Op::Return
            | Op::Unreachable
            | Op::Phantom
            | Op::Check
            | Op::PutStack(_)
            | Op::KillStack(_)
            | Op::MovHint(_)
            | Op::ZombieHint(_)
            | Op::SetArgument(_)
            | Op::LoopHint
            | Op::InvalidationPoint
            | Op::CountExecution(_)
            | Op::CheckInBounds
            | Op::CheckHasInstance
            | Op::PutByOffset(_)
            | Op::PutById(_)
            | Op::PutByIdDirect(_)
            | Op::PutByVal(_)
            | Op::PutGlobalVar(_)
            | Op::PutClosureVar(_)
            | Op::PutToArguments(_)
            | Op::StoreBarrier
            | Op::PutHint(_)
            | Op::LoadVarargs(_)
            | Op::ForwardVarargs(_) => {}

            _ => {
                if node.has_result() {
                    self.set(id, AbstractValue::from_type(default_type(node.result)));
                }
            }
        }
    }

    fn fold_int32(&self, node: &Node, f: impl Fn(i32, i32) -> Option<i32>) -> Option<AbstractValue> {
        if node.result != NodeResult::Int32 {
            return None;
        }
        let a = self.for_node(node.child1().node).as_int32()?;
        let b = self.for_node(node.child2().node).as_int32()?;
        let result = f(a, b)?;
        Some(AbstractValue::constant(
            FrozenValue::Int32(result),
            &self.graph.structures,
        ))
    }

    fn numeric_result(&self, node: &Node) -> AbstractValue {
        let ty = match node.result {
            NodeResult::Int32 => SpeculatedType::INT32,
            NodeResult::Int52 => SpeculatedType::MACHINE_INT,
            NodeResult::Double => {
                let impure = node
                    .children
                    .iter()
                    .any(|edge| self.type_of(edge.node).could_be_impure_nan());
                if impure {
                    SpeculatedType::FULL_DOUBLE
                } else {
                    SpeculatedType::BYTECODE_DOUBLE
                }
            }
            other => default_type(other),
        };
        AbstractValue::from_type(ty)
    }

    fn structure_type(&self, structure: strata_ir::StructureId) -> SpeculatedType {
        self.graph
            .structures
            .get(structure)
            .map(|s| SpeculatedType::from_cell_type(s.cell_type))
            .unwrap_or(SpeculatedType::OBJECT)
    }
}

fn default_type(result: NodeResult) -> SpeculatedType {
    match result {
        NodeResult::JsValue => SpeculatedType::BYTECODE_TOP,
        other => other.type_bound(),
    }
}

fn boolean_result(known: Option<bool>, registry: &strata_ir::StructureRegistry) -> AbstractValue {
    match known {
        Some(b) => AbstractValue::constant(FrozenValue::Boolean(b), registry),
        None => AbstractValue::from_type(SpeculatedType::BOOLEAN),
    }
}

fn double_rep_type(child: SpeculatedType) -> SpeculatedType {
    let mut ty = child & SpeculatedType::FULL_DOUBLE;
    if child.overlaps(SpeculatedType::MACHINE_INT) {
        ty |= SpeculatedType::INT52_AS_DOUBLE;
    }
    if child.overlaps(SpeculatedType::BOOLEAN) {
        ty |= SpeculatedType::INT52_AS_DOUBLE;
    }
    if child.overlaps(SpeculatedType::OTHER) {
        ty |= SpeculatedType::INT52_AS_DOUBLE | SpeculatedType::DOUBLE_PURE_NAN;
    }
    ty
}

/// Truthiness of a value used as a branch condition, if proven.
fn branch_truthiness(value: &AbstractValue, use_kind: UseKind) -> Option<bool> {
    if let Some(known) = value.as_truthiness() {
        return Some(known);
    }
    if matches!(use_kind, UseKind::Untyped | UseKind::ObjectOrOther)
        && value.is_type(SpeculatedType::OBJECT)
        && !value.is_bottom()
    {
        // Objects are truthy unless they masquerade as undefined, which only
        // host objects of kind ObjectOther can do.
        if value.is_not_type(SpeculatedType::OBJECT_OTHER) {
            return Some(true);
        }
    }
    None
}

fn type_query(op: &Op, ty: SpeculatedType) -> Option<bool> {
    if ty.is_empty() {
        return None;
    }
    let (yes, no) = match op {
        // null and undefined share a type leaf, so only the negative answer
        // can be proven from the type alone.
        Op::IsUndefined => (
            false,
            !ty.overlaps(SpeculatedType::OTHER | SpeculatedType::OBJECT_OTHER),
        ),
        Op::IsBoolean => (ty.is_boolean(), !ty.overlaps(SpeculatedType::BOOLEAN)),
        Op::IsNumber => (
            ty.is_subset_of(SpeculatedType::FULL_NUMBER),
            !ty.overlaps(SpeculatedType::FULL_NUMBER),
        ),
        Op::IsString => (ty.is_string(), !ty.overlaps(SpeculatedType::STRING)),
        Op::IsFunction => (
            ty.is_subset_of(SpeculatedType::FUNCTION),
            !ty.overlaps(SpeculatedType::FUNCTION | SpeculatedType::OBJECT_OTHER),
        ),
        Op::IsObject => (
            ty.is_subset_of(SpeculatedType::OBJECT.without(SpeculatedType::FUNCTION | SpeculatedType::OBJECT_OTHER)),
            !ty.overlaps(SpeculatedType::OBJECT),
        ),
        Op::IsObjectOrNull => (false, !ty.overlaps(SpeculatedType::OBJECT | SpeculatedType::OTHER)),
        _ => (false, false),
    };
    if yes {
        Some(true)
    } else if no {
        Some(false)
    } else {
        None
    }
}

/// Type a `CheckArray` of `mode` proves, or `None` when it always fails.
pub fn array_mode_type(mode: ArrayMode) -> Option<SpeculatedType> {
    let ty = match mode.array_type {
        ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous => {
            if mode.is_array {
                SpeculatedType::ARRAY
            } else {
                SpeculatedType::OBJECT
            }
        }
        ArrayType::String => SpeculatedType::STRING,
        ArrayType::DirectArguments => SpeculatedType::DIRECT_ARGUMENTS,
        ArrayType::ScopedArguments => SpeculatedType::SCOPED_ARGUMENTS,
        ArrayType::TypedArray(kind) => SpeculatedType::from_typed_array(kind),
        ArrayType::Generic => SpeculatedType::FULL_TOP,
        ArrayType::ForceExit => return None,
    };
    Some(ty)
}

/// Cell type whose tag a `CheckArray` of `mode` compares against.
pub fn array_mode_cell_type(mode: ArrayMode) -> Option<CellType> {
    match mode.array_type {
        ArrayType::DirectArguments => Some(CellType::DirectArguments),
        ArrayType::ScopedArguments => Some(CellType::ScopedArguments),
        ArrayType::TypedArray(kind) => Some(CellType::TypedArray(kind)),
        ArrayType::String => Some(CellType::String),
        ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous if mode.is_array => {
            Some(CellType::Array)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::{
        ArithMode, BranchData, Edge, GraphBuilder, Operand, StackAccessData, Structure,
        StructureId,
    };

    fn get_arg(b: &mut GraphBuilder, block: BlockIndex, index: u32) -> NodeId {
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

    #[test]
    fn checks_narrow_later_uses() {
        let mut b = GraphBuilder::new("narrow", 2, 0);
        let entry = b.entry();
        let x = get_arg(&mut b, entry, 1);
        let one = b.add(entry, Op::JsConstant(FrozenValue::Int32(1)), [], NodeResult::JsValue);
        let sum = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(x, UseKind::Int32), Edge::new(one, UseKind::Int32)],
            NodeResult::Int32,
        );
        b.add(entry, Op::Return, [Edge::untyped(sum)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        state.begin_block(entry);
        assert!(state.execute(x));
        assert!(!state.type_of(x).is_int32());
        assert!(state.execute(one));
        assert!(state.execute(sum));
        assert!(state.type_of(x).is_int32());
    }

    #[test]
    fn unsigned_int52_satisfies_int52_uses() {
        let mut b = GraphBuilder::new("unsigned", 2, 0);
        let entry = b.entry();
        let x = get_arg(&mut b, entry, 1);
        let unsigned = b.add(
            entry,
            Op::UInt32ToNumber(ArithMode::CheckOverflow),
            [Edge::new(x, UseKind::Int32)],
            NodeResult::Int52,
        );
        let one = b.add(entry, Op::Int52Constant(1), [], NodeResult::Int52);
        let sum = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(unsigned, UseKind::Int52Rep), Edge::new(one, UseKind::Int52Rep)],
            NodeResult::Int52,
        );
        b.add(entry, Op::Return, [Edge::untyped(sum)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        state.begin_block(entry);
        for node in [x, unsigned, one] {
            assert!(state.execute(node));
        }
        assert!(state.type_of(unsigned).is_subset_of(SpeculatedType::MACHINE_INT));
        assert!(state.execute(sum));
        assert!(state.is_valid());
    }

    #[test]
    fn constant_branch_skips_untaken_side() {
        let mut b = GraphBuilder::new("branch", 1, 0);
        let entry = b.entry();
        let taken = b.block();
        let not_taken = b.block();
        let t = b.add(entry, Op::JsConstant(FrozenValue::Boolean(true)), [], NodeResult::JsValue);
        b.add(
            entry,
            Op::Branch(BranchData { taken, not_taken }),
            [Edge::new(t, UseKind::Boolean)],
            NodeResult::None,
        );
        b.add(taken, Op::Return, [Edge::untyped(t)], NodeResult::None);
        b.add(not_taken, Op::Return, [Edge::untyped(t)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        assert!(state.cfa_has_visited(taken));
        assert!(!state.cfa_has_visited(not_taken));
    }

    #[test]
    fn contradictory_check_invalidates() {
        let mut b = GraphBuilder::new("contradiction", 1, 0);
        let entry = b.entry();
        let c = b.add(entry, Op::JsConstant(FrozenValue::Int32(3)), [], NodeResult::JsValue);
        let check = b.add(entry, Op::Check, [Edge::new(c, UseKind::Cell)], NodeResult::None);
        b.add(entry, Op::Return, [Edge::untyped(c)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        state.begin_block(entry);
        assert!(state.execute(c));
        assert!(!state.execute(check));
        assert!(!state.is_valid());
    }

    #[test]
    fn calls_clobber_structures() {
        let mut b = GraphBuilder::new("clobber", 2, 0);
        b.structure(Structure::new(StructureId(1), CellType::FinalObject));
        let entry = b.entry();
        let o = get_arg(&mut b, entry, 1);
        let check = b.add(
            entry,
            Op::CheckStructure(StructureSet::singleton(StructureId(1))),
            [Edge::new(o, UseKind::Cell)],
            NodeResult::None,
        );
        let call = b.add(
            entry,
            Op::Call,
            [Edge::untyped(o), Edge::untyped(o)],
            NodeResult::JsValue,
        );
        b.add(entry, Op::Return, [Edge::untyped(call)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        state.begin_block(entry);
        state.execute(o);
        state.execute(check);
        assert_eq!(state.for_node(o).structures.only(), Some(StructureId(1)));
        state.execute(call);
        assert!(state.for_node(o).structures.is_top());
    }

    #[test]
    fn loop_phis_reach_a_fixpoint() {
        let mut b = GraphBuilder::new("loop", 1, 0);
        let entry = b.entry();
        let header = b.block();
        let exit = b.block();
        let zero = b.add(entry, Op::JsConstant(FrozenValue::Int32(0)), [], NodeResult::JsValue);
        // Upsilons reference the phi created in the header.
        let phi_id = NodeId(3);
        b.add(entry, Op::Upsilon(phi_id), [Edge::untyped(zero)], NodeResult::None);
        b.add(entry, Op::Jump(header), [], NodeResult::None);
        let phi = b.add(header, Op::Phi, [], NodeResult::Int32);
        assert_eq!(phi, phi_id);
        let one = b.add(header, Op::JsConstant(FrozenValue::Int32(1)), [], NodeResult::JsValue);
        let next = b.add(
            header,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(phi, UseKind::Int32), Edge::new(one, UseKind::Int32)],
            NodeResult::Int32,
        );
        let less = b.add(
            header,
            Op::CompareLess,
            [Edge::new(next, UseKind::Int32), Edge::new(one, UseKind::Int32)],
            NodeResult::Boolean,
        );
        b.add(header, Op::Upsilon(phi_id), [Edge::untyped(next)], NodeResult::None);
        b.add(
            header,
            Op::Branch(BranchData {
                taken: header,
                not_taken: exit,
            }),
            [Edge::new(less, UseKind::Boolean)],
            NodeResult::None,
        );
        b.add(exit, Op::Return, [Edge::untyped(next)], NodeResult::None);
        let graph = b.build().expect("valid");
        let dominators = Dominators::compute(&graph);

        let mut state = AbstractState::new(&graph, 8);
        state.run_fixpoint(&dominators);
        state.begin_block(header);
        let phi_value = state.for_node(phi);
        assert!(phi_value.is_type(SpeculatedType::INT32));
        assert_eq!(phi_value.value, None);
        assert!(state.cfa_has_visited(exit));
    }
}
