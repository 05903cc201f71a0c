//! # Strata Exec
//!
//! Execution-tier coordination around the lowering core:
//! - compile worklists with owner-thread finalization
//! - exit resolution and phantom-object materialization
//! - exit profiling and reoptimization accounting

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod deopt;
pub mod profile;
pub mod worklist;

pub use config::WorklistConfig;
pub use deopt::{DeoptError, ExitResolver, MaterializedFields, Materializer, ResolvedFrame};
pub use profile::{ExitProfile, REOPTIMIZATION_THRESHOLD, SiteProfile, ValueProfile};
pub use worklist::{
    CompilationKey, CompilationState, CompletedPlan, OwnerId, Plan, SuspendedWorklist, Worklist,
    WorklistError, WorklistStats, Worklists,
};
