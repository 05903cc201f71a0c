//! # Strata IR
//!
//! This crate defines the speculative SSA graph consumed by the Strata
//! optimizing tier.
//!
//! ## Design Principles
//!
//! - **Typed edges**: every input carries a [`UseKind`] stating what the consumer requires
//! - **Explicit representations**: nodes produce int32, int52, double, boolean or boxed results
//! - **Frozen heap**: structures and constants are snapshotted into the graph
//! - **Serializable**: graphs round-trip through JSON for tooling and tests

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod dominators;
pub mod error;
pub mod graph;
pub mod liveness;
pub mod node;
pub mod operand;
pub mod speculated_type;
pub mod structure;
pub mod use_kind;

pub use constant::{CellConstant, FrozenValue, StringConstant, PURE_NAN_BITS};
pub use dominators::Dominators;
pub use error::{IrError, Result};
pub use graph::{BasicBlock, Graph, GraphBuilder};
pub use liveness::BytecodeLiveness;
pub use node::{
    ArithMode, ArrayMode, ArraySpeculation, ArrayType, BranchData, Edge, GetByOffsetMethod,
    LoadVarargsData, MaterializeData, MultiGetByOffsetCase, NewArrayData, Node, NodeResult, Op,
    PromotedLocation, PutByOffsetVariant, RoundingMode, StackAccessData, StorageAccessData,
    SwitchCase, SwitchData, SwitchKind, SwitchValue, Transition, VarargsData,
};
pub use operand::{
    BlockIndex, CodeOrigin, FlushFormat, IdentifierIndex, NodeId, Operand, Operands,
};
pub use speculated_type::SpeculatedType;
pub use structure::{
    CellType, IndexingType, PropertyEntry, PropertyOffset, Structure, StructureId,
    StructureRegistry, StructureSet, TypeInfoFlags, TypedArrayType,
};
pub use use_kind::{Representation, UseKind};
