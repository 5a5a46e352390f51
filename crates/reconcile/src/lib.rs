//! # Reconcile
//!
//! A generic engine that makes a remote store match local declarations.
//!
//! For one resource kind at a time, the engine works out which declared
//! resources must be created, updated, replaced or deleted, checks that the
//! principal may do so, orders the work along the dependencies between
//! resources and carries it out with bounded parallelism.
//!
//! ## Core Concepts
//!
//! - **ResourceKind**: how one kind is identified, compared, ordered and
//!   read/written remotely
//! - **Scope**: the set of resources a grant covers, with union and
//!   intersection
//! - **DependencyGraph**: deterministic topological sort with cycle reports
//! - **ReconciliationPlan**: the four-way partition of declarations
//! - **Reconciler**: drives a kind from loading to execution
//! - **KindRegistry**: kind name → descriptor table, for multi-kind runs
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{KindRegistry, NoProgress, Reconciler, RunOptions, Unrestricted};
//!
//! let mut registry = KindRegistry::new();
//! registry.register(Spaces::new(store.clone()))?;
//! registry.register(Containers::new(store.clone()))?;
//!
//! let reconciler = Reconciler::new(RunOptions::default(), &Unrestricted, &NoProgress)?;
//! let summary = registry.deploy_all(&reconciler, declarations)?;
//! println!("{summary}");
//! ```
//!
//! ## Provider Traits
//!
//! - [`GrantProvider`]: the principal's current grants
//! - [`ProgressCallback`]: receives phase and item progress
//!
//! Neither ties the crate to a credential source or a terminal UI.

pub mod access;
pub mod context;
pub mod diff;
pub mod diffview;
pub mod error;
pub mod executor;
pub mod graph;
pub mod normalize;
pub mod orchestrator;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod scope;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use access::{Capability, MissingCapability, RequiredCapability, verify_access};
pub use context::{
    GrantProvider, LookupCache, NoProgress, ProgressCallback, RunContext, Unrestricted,
};
pub use diff::{Change, DiffOptions, ReconciliationPlan, compute_plan};
pub use error::{Error, ErrorCategory, MissingIdentifier, Result, Transient};
pub use graph::{CycleReport, DependencyGraph};
pub use orchestrator::{Reconciler, RunInput, run_simple};
pub use registry::{DeploymentSummary, DynKind, KindRegistry, KindRun, KindStatus};
pub use resource::{Classification, Dependency, LocalDeclaration, ResourceKind};
pub use retry::RetryConfig;
pub use scope::Scope;
pub use types::{
    ExternalRef, ItemDiff, ItemOutcome, Phase, PlannedAction, ReconciliationReport,
    ReportSummary, RunOptions, Stage,
};
