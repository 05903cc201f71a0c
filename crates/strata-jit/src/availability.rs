//! Where the value of every source-level operand can be found.
//!
//! An operand is available when it is flushed to a frame slot in some
//! format, when some node computed its current value, or both. Phantom
//! allocations additionally have their fields tracked by promoted location
//! so that an exit can rebuild them.
//!
//! [`compute_block_heads`] runs a forward dataflow over the graph; lowering
//! then replays each block from its head with [`AvailabilityMap::execute`].

use std::collections::BTreeMap;

use strata_ir::{
    BlockIndex, Dominators, FlushFormat, Graph, NodeId, Op, Operand, Operands, PromotedLocation,
};
use tracing::debug;

/// Frame slot holding an operand's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlushedAt {
    /// Slot.
    pub slot: Operand,
    /// Format of the slot's contents.
    pub format: FlushFormat,
}

/// Where one value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Availability {
    /// Frame slot, when flushed.
    pub flushed: Option<FlushedAt>,
    /// Node that computed the value.
    pub node: Option<NodeId>,
    /// Predecessors disagreed on the flushed location.
    pub conflicting: bool,
}

impl Availability {
    /// Nothing known.
    pub const fn unavailable() -> Self {
        Self {
            flushed: None,
            node: None,
            conflicting: false,
        }
    }

    /// Computed by `node`, not flushed.
    pub const fn from_node(node: NodeId) -> Self {
        Self {
            flushed: None,
            node: Some(node),
            conflicting: false,
        }
    }

    /// Flushed to `slot`.
    pub const fn flushed(slot: Operand, format: FlushFormat, node: Option<NodeId>) -> Self {
        Self {
            flushed: Some(FlushedAt { slot, format }),
            node,
            conflicting: false,
        }
    }

    /// A readable flushed slot.
    pub fn live_flush(&self) -> Option<FlushedAt> {
        self.flushed.filter(|flush| flush.format.is_live())
    }

    /// Explicitly killed: the unoptimized tier no longer needs the value.
    pub fn is_dead(&self) -> bool {
        self.node.is_none() && matches!(self.flushed, Some(flush) if flush.format == FlushFormat::Dead)
    }

    /// Nothing usable is known.
    pub fn is_unavailable(&self) -> bool {
        self.live_flush().is_none() && self.node.is_none()
    }

    /// Merge with a predecessor's availability.
    pub fn merge(self, other: Self) -> Self {
        let (flushed, flush_conflict) = if self.flushed == other.flushed {
            (self.flushed, false)
        } else {
            (None, true)
        };
        Self {
            flushed,
            node: if self.node == other.node { self.node } else { None },
            conflicting: self.conflicting || other.conflicting || flush_conflict,
        }
    }
}

/// Availability of every operand plus every field of every phantom
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityMap {
    /// Operands.
    pub locals: Operands<Availability>,
    /// Phantom allocation fields.
    pub heap: BTreeMap<(NodeId, PromotedLocation), Availability>,
}

impl AvailabilityMap {
    /// Nothing available.
    pub fn new(num_arguments: u32, num_locals: u32) -> Self {
        Self {
            locals: Operands::new(
                num_arguments as usize,
                num_locals as usize,
                Availability::unavailable(),
            ),
            heap: BTreeMap::new(),
        }
    }

    /// State on entry to the function: arguments are boxed in their slots.
    pub fn at_entry(graph: &Graph) -> Self {
        let mut map = Self::new(graph.num_arguments, graph.num_locals);
        for index in 0..graph.num_arguments {
            let operand = Operand::Argument(index);
            map.locals
                .set(operand, Availability::flushed(operand, FlushFormat::JsValue, None));
        }
        map
    }

    /// Availability of an operand.
    pub fn get(&self, operand: Operand) -> Availability {
        self.locals.get(operand).copied().unwrap_or_default()
    }

    /// Fields recorded for a phantom allocation, in location order.
    pub fn fields_of(
        &self,
        allocation: NodeId,
    ) -> impl Iterator<Item = (PromotedLocation, Availability)> + '_ {
        self.heap
            .range((allocation, PromotedLocation::Structure)..)
            .take_while(move |((node, _), _)| *node == allocation)
            .map(|((_, location), availability)| (*location, *availability))
    }

    /// Apply the effect of `id`.
    pub fn execute(&mut self, graph: &Graph, id: NodeId) {
        let node = graph.node(id);
        match &node.op {
            Op::SetArgument(operand) => {
                self.locals.set(
                    *operand,
                    Availability::flushed(*operand, FlushFormat::JsValue, None),
                );
            }
            Op::MovHint(operand) => {
                self.locals
                    .set(*operand, Availability::from_node(node.child1().node));
            }
            Op::ZombieHint(operand) => {
                self.locals
                    .set(*operand, Availability::flushed(*operand, FlushFormat::Dead, None));
            }
            Op::PutStack(data) => {
                self.locals.set(
                    data.local,
                    Availability::flushed(data.machine_local, data.format, Some(node.child1().node)),
                );
            }
            Op::KillStack(operand) => {
                if let Some(slot) = self.locals.get_mut(*operand) {
                    slot.flushed = None;
                }
            }
            Op::PutHint(location) => {
                self.heap.insert(
                    (node.child1().node, *location),
                    Availability::from_node(node.child2().node),
                );
            }
            Op::LoadVarargs(data) | Op::ForwardVarargs(data) => {
                self.locals.set(
                    data.count,
                    Availability::flushed(data.count, FlushFormat::Int32, None),
                );
                if let Operand::Local(first) = data.start {
                    for i in 0..data.limit {
                        let operand = Operand::Local(first + i);
                        self.locals
                            .set(operand, Availability::flushed(operand, FlushFormat::JsValue, None));
                    }
                }
            }
            op if op.is_phantom_allocation() => {
                self.heap.retain(|(allocation, _), _| *allocation != id);
            }
            _ => {}
        }
    }

    /// Merge a predecessor's tail into this head. Returns whether it changed.
    fn merge_from(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (operand, slot) in self.locals.iter_mut() {
            let merged = slot.merge(other.get(operand));
            if merged != *slot {
                *slot = merged;
                changed = true;
            }
        }
        let keys: Vec<_> = self.heap.keys().copied().collect();
        for key in keys {
            match other.heap.get(&key) {
                Some(theirs) => {
                    if let Some(mine) = self.heap.get_mut(&key) {
                        let merged = mine.merge(*theirs);
                        if merged != *mine {
                            *mine = merged;
                            changed = true;
                        }
                    }
                }
                None => {
                    self.heap.remove(&key);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Availability at the head of every reachable block.
pub fn compute_block_heads(graph: &Graph, dominators: &Dominators) -> Vec<Option<AvailabilityMap>> {
    let order = strata_ir::dominators::reverse_postorder(graph);
    let mut heads: Vec<Option<AvailabilityMap>> = vec![None; graph.blocks.len()];
    if let Some(entry) = heads.first_mut() {
        *entry = Some(AvailabilityMap::at_entry(graph));
    }

    let mut rounds = 0u32;
    loop {
        let mut changed = false;
        for &block in &order {
            if !dominators.is_reachable(block) {
                continue;
            }
            let Some(mut state) = heads[block.index()].clone() else {
                continue;
            };
            for &id in &graph.block(block).nodes {
                state.execute(graph, id);
            }
            for succ in graph.successors(block) {
                match &mut heads[succ.index()] {
                    Some(head) => changed |= head.merge_from(&state),
                    slot @ None => {
                        *slot = Some(state.clone());
                        changed = true;
                    }
                }
            }
        }
        rounds += 1;
        if !changed {
            break;
        }
    }
    debug!(
        target: "strata::exit",
        function = %graph.name,
        rounds,
        "availability converged"
    );
    heads
}

/// Availability at the head of `block`, or nothing when unreachable.
pub fn head_or_empty(
    heads: &[Option<AvailabilityMap>],
    graph: &Graph,
    block: BlockIndex,
) -> AvailabilityMap {
    heads
        .get(block.index())
        .cloned()
        .flatten()
        .unwrap_or_else(|| AvailabilityMap::new(graph.num_arguments, graph.num_locals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::{BranchData, Edge, FrozenValue, GraphBuilder, NodeResult, StackAccessData};

    #[test]
    fn flushes_and_hints_are_tracked() {
        let mut b = GraphBuilder::new("hints", 1, 2);
        let entry = b.entry();
        let c = b.add(entry, Op::JsConstant(FrozenValue::Int32(7)), [], NodeResult::JsValue);
        let hint = b.add(entry, Op::MovHint(Operand::Local(0)), [Edge::untyped(c)], NodeResult::None);
        let put = b.add(
            entry,
            Op::PutStack(StackAccessData {
                local: Operand::Local(1),
                machine_local: Operand::Local(1),
                format: FlushFormat::Int32,
            }),
            [Edge::untyped(c)],
            NodeResult::None,
        );
        b.add(entry, Op::Return, [Edge::untyped(c)], NodeResult::None);
        let graph = b.build().expect("valid");

        let mut map = AvailabilityMap::at_entry(&graph);
        map.execute(&graph, hint);
        map.execute(&graph, put);
        assert_eq!(map.get(Operand::Local(0)), Availability::from_node(c));
        assert_eq!(
            map.get(Operand::Local(1)).live_flush(),
            Some(FlushedAt {
                slot: Operand::Local(1),
                format: FlushFormat::Int32
            })
        );
        assert!(map.get(Operand::Argument(0)).live_flush().is_some());
    }

    #[test]
    fn disagreeing_predecessors_lose_the_node() {
        let mut b = GraphBuilder::new("merge", 1, 1);
        let entry = b.entry();
        let left = b.block();
        let right = b.block();
        let join = b.block();
        let cond = b.add(entry, Op::JsConstant(FrozenValue::Boolean(true)), [], NodeResult::JsValue);
        b.add(
            entry,
            Op::Branch(BranchData {
                taken: left,
                not_taken: right,
            }),
            [Edge::untyped(cond)],
            NodeResult::None,
        );
        let one = b.add(left, Op::JsConstant(FrozenValue::Int32(1)), [], NodeResult::JsValue);
        b.add(left, Op::MovHint(Operand::Local(0)), [Edge::untyped(one)], NodeResult::None);
        b.add(left, Op::Jump(join), [], NodeResult::None);
        let two = b.add(right, Op::JsConstant(FrozenValue::Int32(2)), [], NodeResult::JsValue);
        b.add(right, Op::MovHint(Operand::Local(0)), [Edge::untyped(two)], NodeResult::None);
        b.add(right, Op::Jump(join), [], NodeResult::None);
        b.add(join, Op::Return, [Edge::untyped(cond)], NodeResult::None);
        let graph = b.build().expect("valid");

        let heads = compute_block_heads(&graph, &Dominators::compute(&graph));
        let head = head_or_empty(&heads, &graph, join);
        assert!(head.get(Operand::Local(0)).is_unavailable());
        assert!(head.get(Operand::Argument(0)).live_flush().is_some());
    }

    #[test]
    fn put_hints_record_phantom_fields() {
        let mut b = GraphBuilder::new("phantom", 1, 1);
        let entry = b.entry();
        let object = b.add(entry, Op::PhantomNewObject, [], NodeResult::None);
        let value = b.add(entry, Op::JsConstant(FrozenValue::Int32(3)), [], NodeResult::JsValue);
        let hint = b.add(
            entry,
            Op::PutHint(PromotedLocation::NamedProperty(strata_ir::IdentifierIndex(0))),
            [Edge::untyped(object), Edge::untyped(value)],
            NodeResult::None,
        );
        b.add(entry, Op::Return, [Edge::untyped(value)], NodeResult::None);
        let graph = b.build().expect("valid");

        let mut map = AvailabilityMap::at_entry(&graph);
        map.execute(&graph, object);
        map.execute(&graph, hint);
        let fields: Vec<_> = map.fields_of(object).collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].1.node, Some(value));
    }
}
