//! Graph indices, source-level operands and frame formats

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node in [`Graph::nodes`](crate::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a node id
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    /// Create a block index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index into the graph's identifier table (property names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct IdentifierIndex(pub u32);

impl IdentifierIndex {
    /// Create an identifier index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Source-level variable: an argument (with `this` at 0) or a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// Argument slot; 0 is `this`.
    Argument(u32),
    /// Local slot.
    Local(u32),
}

impl Operand {
    /// Argument index, if this is an argument.
    pub const fn argument_index(self) -> Option<u32> {
        match self {
            Self::Argument(index) => Some(index),
            Self::Local(_) => None,
        }
    }

    /// Local index, if this is a local.
    pub const fn local_index(self) -> Option<u32> {
        match self {
            Self::Argument(_) => None,
            Self::Local(index) => Some(index),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(index) => write!(f, "arg{index}"),
            Self::Local(index) => write!(f, "loc{index}"),
        }
    }
}

/// Dense map from every [`Operand`] of a frame to a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operands<T> {
    arguments: Vec<T>,
    locals: Vec<T>,
}

impl<T: Clone> Operands<T> {
    /// Create a map with every entry set to `initial`.
    pub fn new(num_arguments: usize, num_locals: usize, initial: T) -> Self {
        Self {
            arguments: vec![initial.clone(); num_arguments],
            locals: vec![initial; num_locals],
        }
    }

    /// Set every entry to `value`.
    pub fn fill(&mut self, value: T) {
        for slot in self.arguments.iter_mut().chain(self.locals.iter_mut()) {
            *slot = value.clone();
        }
    }
}

impl<T> Operands<T> {
    /// Build from explicit argument and local vectors.
    pub fn from_parts(arguments: Vec<T>, locals: Vec<T>) -> Self {
        Self { arguments, locals }
    }

    /// Number of argument entries.
    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    /// Number of local entries.
    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.arguments.len() + self.locals.len()
    }

    /// No entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `operand`, if in range.
    pub fn get(&self, operand: Operand) -> Option<&T> {
        match operand {
            Operand::Argument(index) => self.arguments.get(index as usize),
            Operand::Local(index) => self.locals.get(index as usize),
        }
    }

    /// Mutable entry for `operand`, if in range.
    pub fn get_mut(&mut self, operand: Operand) -> Option<&mut T> {
        match operand {
            Operand::Argument(index) => self.arguments.get_mut(index as usize),
            Operand::Local(index) => self.locals.get_mut(index as usize),
        }
    }

    /// Replace the entry for `operand`; out-of-range operands are ignored.
    pub fn set(&mut self, operand: Operand, value: T) {
        if let Some(slot) = self.get_mut(operand) {
            *slot = value;
        }
    }

    /// Operand of the n-th entry in iteration order.
    pub fn operand_for_index(&self, index: usize) -> Operand {
        if index < self.arguments.len() {
            Operand::Argument(index as u32)
        } else {
            Operand::Local((index - self.arguments.len()) as u32)
        }
    }

    /// Iterate arguments then locals.
    pub fn iter(&self) -> impl Iterator<Item = (Operand, &T)> {
        let arguments = self
            .arguments
            .iter()
            .enumerate()
            .map(|(i, v)| (Operand::Argument(i as u32), v));
        let locals = self
            .locals
            .iter()
            .enumerate()
            .map(|(i, v)| (Operand::Local(i as u32), v));
        arguments.chain(locals)
    }

    /// Iterate mutably, arguments then locals.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Operand, &mut T)> {
        let arguments = self
            .arguments
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Operand::Argument(i as u32), v));
        let locals = self
            .locals
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Operand::Local(i as u32), v));
        arguments.chain(locals)
    }

    /// Apply `f` to every entry, producing a new map.
    pub fn map<U>(&self, mut f: impl FnMut(Operand, &T) -> U) -> Operands<U> {
        let arguments = self
            .arguments
            .iter()
            .enumerate()
            .map(|(i, v)| f(Operand::Argument(i as u32), v))
            .collect();
        let locals = self
            .locals
            .iter()
            .enumerate()
            .map(|(i, v)| f(Operand::Local(i as u32), v))
            .collect();
        Operands { arguments, locals }
    }
}

/// Format of a value flushed to its frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushFormat {
    /// Nothing useful is in the slot.
    Dead,
    /// Raw int32 in the low half of the slot.
    Int32,
    /// Int52 shifted left by the int52 shift amount.
    Int52,
    /// Raw double bits.
    Double,
    /// Raw 0/1.
    Boolean,
    /// Cell pointer.
    Cell,
    /// Boxed value.
    JsValue,
    /// Predecessors disagree on what the slot holds.
    Conflicting,
}

impl FlushFormat {
    /// Slot holds a value that can be read back.
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Dead | Self::Conflicting)
    }
}

/// Source position a node was generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CodeOrigin {
    /// Bytecode offset in the unoptimized tier.
    pub bytecode_index: u32,
}

impl CodeOrigin {
    /// Create an origin at `bytecode_index`.
    pub const fn new(bytecode_index: u32) -> Self {
        Self { bytecode_index }
    }
}

impl fmt::Display for CodeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bc#{}", self.bytecode_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_iterate_arguments_first() {
        let mut operands = Operands::new(2, 3, 0u32);
        operands.set(Operand::Local(1), 7);
        operands.set(Operand::Argument(1), 3);
        let collected: Vec<_> = operands.iter().map(|(op, v)| (op, *v)).collect();
        assert_eq!(collected[1], (Operand::Argument(1), 3));
        assert_eq!(collected[3], (Operand::Local(1), 7));
        assert_eq!(operands.operand_for_index(4), Operand::Local(2));
    }

    #[test]
    fn out_of_range_set_is_ignored() {
        let mut operands = Operands::new(1, 1, false);
        operands.set(Operand::Local(5), true);
        assert_eq!(operands.get(Operand::Local(5)), None);
    }
}
