//! # Strata JIT
//!
//! Speculative lowering of the optimizing tier: mid-level IR graphs become a
//! low-level IR with type checks, inline cache sites and OSR exits, which the
//! Cranelift backend turns into native code.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod abi;
pub mod abstract_state;
pub mod abstract_value;
pub mod availability;
pub mod capabilities;
pub mod compiler;
pub mod config;
pub mod exit;
mod exit_builder;
pub mod helpers;
pub mod ic;
pub mod lir;
pub mod lower;
pub mod object_layout;
mod speculate;
#[cfg(test)]
mod testing;
mod translator;
pub mod value;

pub use capabilities::can_compile;
pub use compiler::{CompiledFunction, JitCompiler, JitError, prepare};
pub use config::{ExitLivenessMode, LoweringOptions};
pub use exit::{ExitId, ExitKind, ExitTable, ExitValue, OsrExit};
pub use helpers::{HelperKind, RuntimeHelpers};
pub use ic::{InlineCacheKind, InlineCacheSite, InlineCacheTable, SiteId};
pub use lower::{LoweredFunction, LoweringStats, lower};
pub use object_layout::{DefaultObjectLayout, ObjectLayout};
