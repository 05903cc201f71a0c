//! SSA graph: blocks of nodes plus the frozen heap metadata they reference

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{IrError, Result};
use crate::liveness::BytecodeLiveness;
use crate::node::{Edge, Node, NodeResult, Op};
use crate::operand::{BlockIndex, CodeOrigin, IdentifierIndex, NodeId, Operand};
use crate::speculated_type::SpeculatedType;
use crate::structure::{Structure, StructureRegistry};

/// A basic block: a straight-line node list ending in a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Index of this block.
    pub index: BlockIndex,
    /// Nodes in execution order.
    pub nodes: Vec<NodeId>,
    /// Blocks that branch here; recomputed by [`Graph::compute_predecessors`].
    #[serde(default)]
    pub predecessors: Vec<BlockIndex>,
}

impl BasicBlock {
    /// Create an empty block.
    pub fn new(index: BlockIndex) -> Self {
        Self {
            index,
            nodes: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

/// A function in SSA form, ready to be lowered.
///
/// Block 0 is the entry. Arguments are counted including `this`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Function name, for diagnostics.
    pub name: String,
    /// Node storage; [`NodeId`]s index into this.
    pub nodes: Vec<Node>,
    /// Blocks; [`BlockIndex`]es index into this.
    pub blocks: Vec<BasicBlock>,
    /// Number of argument slots including `this`.
    pub num_arguments: u32,
    /// Number of local slots.
    pub num_locals: u32,
    /// Property names referenced by index.
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Structures referenced by checks and constants.
    #[serde(default)]
    pub structures: StructureRegistry,
    /// Liveness of the unoptimized tier, used to prune exit state.
    #[serde(default)]
    pub liveness: BytecodeLiveness,
}

impl Graph {
    /// Node by id.
    ///
    /// # Panics
    /// If `id` is out of range; validated graphs never contain such ids.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Block by index.
    ///
    /// # Panics
    /// If `index` is out of range.
    #[inline]
    pub fn block(&self, index: BlockIndex) -> &BasicBlock {
        &self.blocks[index.index()]
    }

    /// Iterate block indices.
    pub fn block_indices(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        (0..self.blocks.len() as u32).map(BlockIndex)
    }

    /// Last node of a block when it is a terminal.
    pub fn terminal(&self, block: BlockIndex) -> Option<NodeId> {
        let last = *self.block(block).nodes.last()?;
        self.node(last).op.is_terminal().then_some(last)
    }

    /// Successors of a block.
    pub fn successors(&self, block: BlockIndex) -> SmallVec<[BlockIndex; 2]> {
        match self.terminal(block) {
            Some(terminal) => self.node(terminal).op.successors(),
            None => SmallVec::new(),
        }
    }

    /// `Phi` nodes of a block.
    pub fn phis(&self, block: BlockIndex) -> impl Iterator<Item = NodeId> + '_ {
        self.block(block)
            .nodes
            .iter()
            .copied()
            .filter(move |&id| matches!(self.node(id).op, Op::Phi))
    }

    /// Property name.
    pub fn identifier(&self, index: IdentifierIndex) -> &str {
        self.identifiers
            .get(index.index())
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    /// `operand` is live in the unoptimized tier at `origin`.
    pub fn is_live_in_bytecode(&self, operand: Operand, origin: CodeOrigin) -> bool {
        self.liveness.is_live(origin, operand)
    }

    /// Recompute every block's predecessor list from the terminals.
    pub fn compute_predecessors(&mut self) {
        for block in &mut self.blocks {
            block.predecessors.clear();
        }
        for index in 0..self.blocks.len() {
            let from = BlockIndex(index as u32);
            for to in self.successors(from) {
                if let Some(target) = self.blocks.get_mut(to.index()) {
                    if !target.predecessors.contains(&from) {
                        target.predecessors.push(from);
                    }
                }
            }
        }
    }

    /// Check structural well-formedness.
    pub fn validate(&self) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(IrError::EmptyGraph);
        }
        for block in &self.blocks {
            let Some((&last, body)) = block.nodes.split_last() else {
                return Err(IrError::MissingTerminal(block.index));
            };
            for &id in block.nodes.iter() {
                let node = self
                    .nodes
                    .get(id.index())
                    .ok_or(IrError::DanglingNode { user: id, node: id })?;
                for edge in &node.children {
                    if edge.node.index() >= self.nodes.len() {
                        return Err(IrError::DanglingNode {
                            user: id,
                            node: edge.node,
                        });
                    }
                }
                if let Op::Upsilon(phi) = node.op {
                    if phi.index() >= self.nodes.len() {
                        return Err(IrError::DanglingNode { user: id, node: phi });
                    }
                }
                let expected = min_children(&node.op);
                if node.children.len() < expected {
                    return Err(IrError::MissingChildren {
                        node: id,
                        op: node.op.name(),
                        expected,
                        actual: node.children.len(),
                    });
                }
            }
            for &id in body {
                if self.node(id).op.is_terminal() {
                    return Err(IrError::TerminalNotLast {
                        block: block.index,
                        node: id,
                    });
                }
            }
            let terminal = self.node(last);
            if !terminal.op.is_terminal() {
                return Err(IrError::MissingTerminal(block.index));
            }
            for target in terminal.op.successors() {
                if target.index() >= self.blocks.len() {
                    return Err(IrError::InvalidBlockTarget {
                        block: block.index,
                        target,
                    });
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load from JSON, recompute predecessors and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut graph: Graph = serde_json::from_str(json)?;
        graph.compute_predecessors();
        graph.validate()?;
        Ok(graph)
    }
}

/// Smallest child count an opcode is lowered with.
fn min_children(op: &Op) -> usize {
    match op {
        Op::JsConstant(_)
        | Op::DoubleConstant(_)
        | Op::Int52Constant(_)
        | Op::BottomValue
        | Op::GetStack(_)
        | Op::KillStack(_)
        | Op::ZombieHint(_)
        | Op::Phi
        | Op::SetArgument(_)
        | Op::GetCallee
        | Op::GetArgumentCount
        | Op::LoopHint
        | Op::InvalidationPoint
        | Op::CountExecution(_)
        | Op::Phantom
        | Op::Check
        | Op::CheckBadCell
        | Op::ForceOsrExit
        | Op::NewObject(_)
        | Op::NewArray(_)
        | Op::NewArrayBuffer(..)
        | Op::GetGlobalVar(_)
        | Op::CreateDirectArguments
        | Op::CreateClonedArguments
        | Op::PhantomNewObject
        | Op::PhantomDirectArguments
        | Op::PhantomClonedArguments
        | Op::ForwardVarargs(_)
        | Op::ThrowReferenceError(_)
        | Op::Jump(_)
        | Op::Unreachable => 0,
        Op::ArithAdd(_)
        | Op::ArithSub(_)
        | Op::ArithMul(_)
        | Op::ArithDiv(_)
        | Op::ArithMod(_)
        | Op::ArithMin
        | Op::ArithMax
        | Op::ArithPow
        | Op::ValueAdd
        | Op::BitAnd
        | Op::BitOr
        | Op::BitXor
        | Op::BitLShift
        | Op::BitRShift
        | Op::BitURShift
        | Op::CompareEq
        | Op::CompareStrictEq
        | Op::CompareLess
        | Op::CompareLessEq
        | Op::CompareGreater
        | Op::CompareGreaterEq
        | Op::CompareEqConstant
        | Op::CheckInBounds
        | Op::PutByOffset(_)
        | Op::MultiPutByOffset(_)
        | Op::GetByVal(_)
        | Op::ArrayPush(_)
        | Op::HasIndexedProperty(_)
        | Op::StringCharAt(_)
        | Op::StringCharCodeAt(_)
        | Op::PutById(_)
        | Op::PutByIdDirect(_)
        | Op::In
        | Op::Call
        | Op::Construct
        | Op::PutClosureVar(_)
        | Op::PutToArguments(_)
        | Op::PutHint(_)
        | Op::MakeRope
        | Op::InstanceOf
        | Op::NewFunction => 2,
        Op::PutByVal(_) => 3,
        Op::PutStructure(_) => 1,
        _ => 1,
    }
}

/// Incremental graph construction.
///
/// ```
/// use strata_ir::{GraphBuilder, Edge, NodeResult, Op, UseKind, FrozenValue};
///
/// let mut b = GraphBuilder::new("answer", 1, 0);
/// let entry = b.entry();
/// let c = b.add(entry, Op::JsConstant(FrozenValue::Int32(42)), [], NodeResult::JsValue);
/// b.add(entry, Op::Return, [Edge::untyped(c)], NodeResult::None);
/// let graph = b.build().unwrap();
/// assert_eq!(graph.nodes.len(), 2);
/// ```
#[derive(Debug)]
pub struct GraphBuilder {
    graph: Graph,
    origin: CodeOrigin,
    prediction: SpeculatedType,
}

impl GraphBuilder {
    /// Start a graph with an entry block.
    pub fn new(name: impl Into<String>, num_arguments: u32, num_locals: u32) -> Self {
        Self {
            graph: Graph {
                name: name.into(),
                nodes: Vec::new(),
                blocks: vec![BasicBlock::new(BlockIndex(0))],
                num_arguments,
                num_locals,
                identifiers: Vec::new(),
                structures: StructureRegistry::new(),
                liveness: BytecodeLiveness::new(),
            },
            origin: CodeOrigin::default(),
            prediction: SpeculatedType::HEAP_TOP,
        }
    }

    /// The entry block.
    pub fn entry(&self) -> BlockIndex {
        BlockIndex(0)
    }

    /// Append a new empty block.
    pub fn block(&mut self) -> BlockIndex {
        let index = BlockIndex(self.graph.blocks.len() as u32);
        self.graph.blocks.push(BasicBlock::new(index));
        index
    }

    /// Origin given to subsequently added nodes.
    pub fn set_origin(&mut self, bytecode_index: u32) {
        self.origin = CodeOrigin::new(bytecode_index);
    }

    /// Prediction given to subsequently added nodes.
    pub fn set_prediction(&mut self, prediction: SpeculatedType) {
        self.prediction = prediction;
    }

    /// Append a node to `block`.
    pub fn add(
        &mut self,
        block: BlockIndex,
        op: Op,
        children: impl IntoIterator<Item = Edge>,
        result: NodeResult,
    ) -> NodeId {
        let id = NodeId(self.graph.nodes.len() as u32);
        let mut node = Node::new(op, children, result);
        node.origin = self.origin;
        node.prediction = self.prediction;
        self.graph.nodes.push(node);
        self.graph.blocks[block.index()].nodes.push(id);
        id
    }

    /// Intern a property name.
    pub fn identifier(&mut self, name: &str) -> IdentifierIndex {
        if let Some(i) = self.graph.identifiers.iter().position(|n| n == name) {
            return IdentifierIndex(i as u32);
        }
        self.graph.identifiers.push(name.to_string());
        IdentifierIndex((self.graph.identifiers.len() - 1) as u32)
    }

    /// Register a structure.
    pub fn structure(&mut self, structure: Structure) {
        self.graph.structures.insert(structure);
    }

    /// Record liveness of the unoptimized tier at a bytecode index.
    pub fn live_at(&mut self, bytecode_index: u32, operands: impl IntoIterator<Item = Operand>) {
        self.graph.liveness.set_live(bytecode_index, operands);
    }

    /// Finish: compute predecessors and validate.
    pub fn build(mut self) -> Result<Graph> {
        self.graph.compute_predecessors();
        self.graph.validate()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::FrozenValue;
    use crate::node::ArithMode;
    use crate::use_kind::UseKind;

    fn add_one() -> Graph {
        let mut b = GraphBuilder::new("add_one", 2, 1);
        let entry = b.entry();
        let x = b.add(
            entry,
            Op::GetStack(crate::node::StackAccessData {
                local: Operand::Argument(1),
                machine_local: Operand::Argument(1),
                format: crate::operand::FlushFormat::JsValue,
            }),
            [],
            NodeResult::JsValue,
        );
        let one = b.add(entry, Op::JsConstant(FrozenValue::Int32(1)), [], NodeResult::JsValue);
        let sum = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(x, UseKind::Int32), Edge::new(one, UseKind::Int32)],
            NodeResult::Int32,
        );
        b.add(entry, Op::Return, [Edge::untyped(sum)], NodeResult::None);
        b.build().expect("graph should validate")
    }

    #[test]
    fn json_round_trip_preserves_graph() {
        let graph = add_one();
        let json = graph.to_json().expect("serialize");
        let back = Graph::from_json(&json).expect("deserialize");
        assert_eq!(back.nodes, graph.nodes);
        assert_eq!(back.blocks, graph.blocks);
    }

    #[test]
    fn missing_terminal_is_rejected() {
        let mut b = GraphBuilder::new("bad", 1, 0);
        let entry = b.entry();
        b.add(entry, Op::JsConstant(FrozenValue::Undefined), [], NodeResult::JsValue);
        assert!(matches!(b.build(), Err(IrError::MissingTerminal(_))));
    }

    #[test]
    fn missing_children_are_rejected() {
        let mut b = GraphBuilder::new("bad", 1, 0);
        let entry = b.entry();
        let c = b.add(entry, Op::JsConstant(FrozenValue::Int32(1)), [], NodeResult::JsValue);
        b.add(
            entry,
            Op::ArithAdd(ArithMode::Unchecked),
            [Edge::new(c, UseKind::Int32)],
            NodeResult::Int32,
        );
        b.add(entry, Op::Return, [Edge::untyped(c)], NodeResult::None);
        assert!(matches!(b.build(), Err(IrError::MissingChildren { .. })));
    }

    #[test]
    fn predecessors_follow_terminals() {
        let mut b = GraphBuilder::new("loop", 1, 0);
        let entry = b.entry();
        let header = b.block();
        b.add(entry, Op::Jump(header), [], NodeResult::None);
        b.add(header, Op::Jump(header), [], NodeResult::None);
        let graph = b.build().expect("graph should validate");
        assert_eq!(graph.block(header).predecessors, vec![entry, header]);
    }

    #[test]
    fn identifiers_are_interned() {
        let mut b = GraphBuilder::new("ids", 1, 0);
        let a = b.identifier("x");
        let c = b.identifier("y");
        assert_eq!(b.identifier("x"), a);
        assert_ne!(a, c);
    }
}
