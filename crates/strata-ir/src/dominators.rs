//! Dominator tree (Cooper, Harvey, Kennedy: "A Simple, Fast Dominance Algorithm")

use crate::graph::Graph;
use crate::operand::BlockIndex;

/// Immediate dominators of every block reachable from the entry.
#[derive(Debug, Clone)]
pub struct Dominators {
    /// Immediate dominator per block; the entry maps to itself, unreachable
    /// blocks to `None`.
    idom: Vec<Option<BlockIndex>>,
    /// Reverse-postorder number per block.
    rpo_number: Vec<u32>,
    /// Dominator-tree children per block, sorted by block index.
    children: Vec<Vec<BlockIndex>>,
}

impl Dominators {
    /// Compute dominators for `graph`, with block 0 as entry.
    pub fn compute(graph: &Graph) -> Self {
        let n = graph.blocks.len();
        let rpo = reverse_postorder(graph);

        let mut rpo_number = vec![u32::MAX; n];
        for (i, block) in rpo.iter().enumerate() {
            rpo_number[block.index()] = i as u32;
        }

        let mut idom: Vec<Option<BlockIndex>> = vec![None; n];
        if n == 0 {
            return Self {
                idom,
                rpo_number,
                children: Vec::new(),
            };
        }
        let entry = BlockIndex(0);
        idom[0] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockIndex> = None;
                for &pred in &graph.block(block).predecessors {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_number, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); n];
        for (i, dom) in idom.iter().enumerate() {
            if let Some(dom) = dom {
                if dom.index() != i {
                    children[dom.index()].push(BlockIndex(i as u32));
                }
            }
        }

        Self {
            idom,
            rpo_number,
            children,
        }
    }

    /// Block is reachable from the entry.
    pub fn is_reachable(&self, block: BlockIndex) -> bool {
        self.idom.get(block.index()).is_some_and(Option::is_some)
    }

    /// Immediate dominator, `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockIndex) -> Option<BlockIndex> {
        match self.idom.get(block.index()).copied().flatten() {
            Some(dom) if dom != block => Some(dom),
            _ => None,
        }
    }

    /// `a` dominates `b` (reflexive). Unreachable blocks dominate nothing and
    /// are dominated by nothing.
    pub fn dominates(&self, a: BlockIndex, b: BlockIndex) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(dom) => current = dom,
                None => return false,
            }
        }
    }

    /// `a` dominates `b` and `a != b`.
    pub fn strictly_dominates(&self, a: BlockIndex, b: BlockIndex) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Dominator-tree children of `block`.
    pub fn children(&self, block: BlockIndex) -> &[BlockIndex] {
        self.children
            .get(block.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Reachable blocks in dominator-tree pre-order: every block comes after
    /// all of its dominators.
    pub fn blocks_in_pre_order(&self) -> Vec<BlockIndex> {
        let mut order = Vec::new();
        if self.idom.is_empty() {
            return order;
        }
        let mut stack = vec![BlockIndex(0)];
        while let Some(block) = stack.pop() {
            order.push(block);
            for &child in self.children(block).iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Reverse-postorder number of a reachable block.
    pub fn rpo_number(&self, block: BlockIndex) -> Option<u32> {
        self.rpo_number
            .get(block.index())
            .copied()
            .filter(|&n| n != u32::MAX)
    }
}

fn intersect(
    idom: &[Option<BlockIndex>],
    rpo_number: &[u32],
    mut a: BlockIndex,
    mut b: BlockIndex,
) -> BlockIndex {
    while a != b {
        while rpo_number[a.index()] > rpo_number[b.index()] {
            a = idom[a.index()].unwrap_or(a);
        }
        while rpo_number[b.index()] > rpo_number[a.index()] {
            b = idom[b.index()].unwrap_or(b);
        }
    }
    a
}

/// Reachable blocks in reverse postorder from the entry.
pub fn reverse_postorder(graph: &Graph) -> Vec<BlockIndex> {
    let n = graph.blocks.len();
    let mut order = Vec::with_capacity(n);
    if n == 0 {
        return order;
    }
    let mut visited = vec![false; n];
    // (block, next successor to visit)
    let mut stack: Vec<(BlockIndex, usize)> = vec![(BlockIndex(0), 0)];
    visited[0] = true;
    while let Some((block, next)) = stack.pop() {
        let successors = graph.successors(block);
        if let Some(&succ) = successors.get(next) {
            stack.push((block, next + 1));
            if succ.index() < n && !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(block);
        }
    }
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::node::{BranchData, Edge, NodeResult, Op};
    use crate::constant::FrozenValue;

    /// ```text
    ///     0
    ///    / \
    ///   1   2
    ///    \ /
    ///     3     4 (unreachable)
    /// ```
    fn diamond() -> Graph {
        let mut b = GraphBuilder::new("diamond", 1, 0);
        let entry = b.entry();
        let left = b.block();
        let right = b.block();
        let join = b.block();
        let dead = b.block();
        let c = b.add(entry, Op::JsConstant(FrozenValue::Boolean(true)), [], NodeResult::JsValue);
        b.add(
            entry,
            Op::Branch(BranchData { taken: left, not_taken: right }),
            [Edge::untyped(c)],
            NodeResult::None,
        );
        b.add(left, Op::Jump(join), [], NodeResult::None);
        b.add(right, Op::Jump(join), [], NodeResult::None);
        b.add(join, Op::Return, [Edge::untyped(c)], NodeResult::None);
        b.add(dead, Op::Jump(join), [], NodeResult::None);
        b.build().expect("diamond should validate")
    }

    #[test]
    fn diamond_dominators() {
        let graph = diamond();
        let dom = Dominators::compute(&graph);
        assert_eq!(dom.idom(BlockIndex(3)), Some(BlockIndex(0)));
        assert!(dom.dominates(BlockIndex(0), BlockIndex(3)));
        assert!(!dom.dominates(BlockIndex(1), BlockIndex(3)));
        assert!(!dom.is_reachable(BlockIndex(4)));
        assert!(!dom.dominates(BlockIndex(4), BlockIndex(3)));
    }

    #[test]
    fn pre_order_visits_dominators_first() {
        let graph = diamond();
        let dom = Dominators::compute(&graph);
        let order = dom.blocks_in_pre_order();
        assert_eq!(order.len(), 4);
        for (i, &block) in order.iter().enumerate() {
            if let Some(parent) = dom.idom(block) {
                assert!(order[..i].contains(&parent));
            }
        }
    }
}
