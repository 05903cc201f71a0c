//! Graph errors

use thiserror::Error;

use crate::operand::{BlockIndex, NodeId};

/// Errors that can occur while building, validating or loading a graph
#[derive(Debug, Error)]
pub enum IrError {
    /// Graph has no blocks
    #[error("Graph has no blocks")]
    EmptyGraph,

    /// A node refers to a node that does not exist
    #[error("Node {user} refers to missing node {node}")]
    DanglingNode {
        /// Referring node
        user: NodeId,
        /// Missing node
        node: NodeId,
    },

    /// A terminal refers to a block that does not exist
    #[error("Block {block} branches to missing block {target}")]
    InvalidBlockTarget {
        /// Branching block
        block: BlockIndex,
        /// Missing target
        target: BlockIndex,
    },

    /// A block does not end in a terminal
    #[error("Block {0} has no terminal")]
    MissingTerminal(BlockIndex),

    /// A terminal appears before the end of its block
    #[error("Terminal {node} is not last in block {block}")]
    TerminalNotLast {
        /// Block
        block: BlockIndex,
        /// Misplaced terminal
        node: NodeId,
    },

    /// A node has fewer children than its opcode needs
    #[error("Node {node} ({op}) needs {expected} children, has {actual}")]
    MissingChildren {
        /// Node
        node: NodeId,
        /// Opcode name
        op: &'static str,
        /// Required count
        expected: usize,
        /// Actual count
        actual: usize,
    },

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, IrError>;
