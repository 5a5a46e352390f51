//! Core types for reconciliation runs

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Upper bound on the worker pool size
pub const MAX_CONCURRENCY: usize = 32;

/// Default chunk size for batched remote calls
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Phase of a single-kind run.
///
/// Runs move forward through `Loading → AccessCheck → Retrieving → Diffing
/// → Ordering → Executing → Done`; `Failed` is reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Loading,
    AccessCheck,
    Retrieving,
    Diffing,
    Ordering,
    Executing,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::AccessCheck => "access check",
            Self::Retrieving => "retrieving",
            Self::Diffing => "diffing",
            Self::Ordering => "ordering",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The collaborator call an error or outcome belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Access,
    Retrieve,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Access => "access lookup",
            Self::Retrieve => "retrieve",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// What a dry run would have done with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannedAction {
    Create,
    Update,
    /// Delete followed by create of the same identifier
    Replace,
    Delete,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Final classification of one identifier that entered a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
    /// Deleted then created again (kinds without partial update)
    Replaced,
    Deleted,
    Unchanged,
    /// Dry run: the action that would have been taken
    Planned { action: PlannedAction },
    Skipped { reason: String },
    Failed { stage: Stage, error: String },
}

impl ItemOutcome {
    /// Check if the outcome represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Check if the outcome represents a change made to the remote store
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }

    /// Failed or skipped items block whatever depends on them
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Skipped { .. })
    }
}

/// Options for a reconciliation run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Compute the plan (including the access check) but never execute
    pub dry_run: bool,
    /// Route matched-and-equal items to update/replace instead of unchanged
    pub force_update: bool,
    /// Emit a masked structural diff for every changed item
    pub verbose_diff: bool,
    /// Delete remote resources that have no local declaration
    pub prune: bool,
    /// Stop dispatching new calls after the first failure
    pub fail_fast: bool,
    /// Worker pool size for retrieval and execution
    pub concurrency: usize,
    /// Maximum number of items per remote call
    pub batch_size: usize,
    /// Run-level deadline, measured from the start of the run
    pub deadline: Option<Duration>,
    /// Backoff policy for transient collaborator errors
    pub retry: RetryConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force_update: false,
            verbose_diff: false,
            prune: false,
            fail_fast: false,
            concurrency: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            deadline: None,
            retry: RetryConfig::default(),
        }
    }
}

impl RunOptions {
    /// Worker pool size, clamped to `1..=MAX_CONCURRENCY`
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Batch size, never zero
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

/// Masked structural diff of one changed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDiff {
    pub id: String,
    pub diff: String,
}

/// A reference from a declaration to a resource of another kind
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Identifier of the referencing item
    pub from: String,
    pub kind: String,
    pub id: String,
}

/// Everything that happened to the identifiers of one kind in one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub kind: String,
    pub dry_run: bool,
    /// One entry per identifier, in the order identifiers were classified
    pub outcomes: Vec<(String, ItemOutcome)>,
    /// Identifiers declared more than once (later occurrences were dropped)
    pub duplicates: Vec<String>,
    /// References to other kinds, for the composing layer to verify
    pub external_dependencies: Vec<ExternalRef>,
    /// Verbose diffs, only populated when requested
    pub diffs: Vec<ItemDiff>,
    /// Set when the deadline stopped dispatch before the plan was finished
    pub deadline_exceeded: bool,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ReconciliationReport {
    pub fn new(kind: impl Into<String>, dry_run: bool) -> Self {
        Self {
            kind: kind.into(),
            dry_run,
            ..Default::default()
        }
    }

    /// Record (or overwrite) the outcome of an identifier
    pub fn record(&mut self, id: impl Into<String>, outcome: ItemOutcome) {
        let id = id.into();
        match self.index.get(&id) {
            Some(&pos) => self.outcomes[pos].1 = outcome,
            None => {
                self.index.insert(id.clone(), self.outcomes.len());
                self.outcomes.push((id, outcome));
            }
        }
    }

    /// Outcome recorded for an identifier
    pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
        match self.index.get(id) {
            Some(&pos) => Some(&self.outcomes[pos].1),
            // deserialized reports carry no index
            None => self
                .outcomes
                .iter()
                .find(|(existing, _)| existing == id)
                .map(|(_, outcome)| outcome),
        }
    }

    /// Identifiers whose outcome matches a predicate
    pub fn ids_where(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Failed identifiers with their stage and cause
    pub fn failures(&self) -> Vec<(&str, Stage, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                ItemOutcome::Failed { stage, error } => Some((id.as_str(), *stage, error.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Count outcomes by category
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for (_, outcome) in &self.outcomes {
            summary.add_outcome(outcome);
        }
        summary.duplicates = self.duplicates.len();
        summary
    }

    /// Check if no item failed
    pub fn is_success(&self) -> bool {
        !self.outcomes.iter().any(|(_, outcome)| outcome.is_failure())
    }

    /// Turn per-item failures into a [`crate::Error::PartialExecution`]
    pub fn ensure_success(&self) -> crate::Result<()> {
        let summary = self.summary();
        if summary.failed == 0 {
            return Ok(());
        }
        Err(crate::Error::PartialExecution {
            kind: self.kind.clone(),
            failed: summary.failed,
            attempted: summary.total_changes() + summary.failed,
        })
    }
}

/// Outcome counts of one or more reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Created items, replaced items included
    pub created: usize,
    pub updated: usize,
    /// Deleted items, replaced items included
    pub deleted: usize,
    pub unchanged: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl ReportSummary {
    /// Total number of identifiers changed in the remote store
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ReportSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.planned += other.planned;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.created += 1,
            ItemOutcome::Updated => self.updated += 1,
            ItemOutcome::Replaced => {
                self.created += 1;
                self.deleted += 1;
            }
            ItemOutcome::Deleted => self.deleted += 1,
            ItemOutcome::Unchanged => self.unchanged += 1,
            ItemOutcome::Planned { .. } => self.planned += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged",
            self.created, self.updated, self.deleted, self.unchanged
        )?;
        if self.planned > 0 {
            write!(f, ", {} planned", self.planned)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_overwrites_existing_outcome() {
        let mut report = ReconciliationReport::new("views", false);
        report.record("a", ItemOutcome::Deleted);
        report.record("b", ItemOutcome::Created);
        report.record("a", ItemOutcome::Replaced);

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcome("a"), Some(&ItemOutcome::Replaced));
        assert_eq!(report.outcomes[0].0, "a");
    }

    #[test]
    fn test_replaced_counts_as_create_and_delete() {
        let mut report = ReconciliationReport::new("views", false);
        report.record("a", ItemOutcome::Replaced);
        report.record("b", ItemOutcome::Unchanged);

        let summary = report.summary();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.total_changes(), 2);
    }

    #[test]
    fn test_ensure_success_reports_partial_execution() {
        let mut report = ReconciliationReport::new("spaces", false);
        report.record("a", ItemOutcome::Created);
        report.record(
            "b",
            ItemOutcome::Failed {
                stage: Stage::Create,
                error: "boom".into(),
            },
        );

        match report.ensure_success() {
            Err(crate::Error::PartialExecution {
                failed, attempted, ..
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(attempted, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(report.failures(), vec![("b", Stage::Create, "boom")]);
    }

    #[test]
    fn test_summary_display() {
        let summary = ReportSummary {
            created: 2,
            skipped: 1,
            ..Default::default()
        };
        assert_eq!(
            summary.to_string(),
            "2 created, 0 updated, 0 deleted, 0 unchanged, 1 skipped"
        );
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let mut opts = RunOptions {
            concurrency: 0,
            ..Default::default()
        };
        assert_eq!(opts.effective_concurrency(), 1);
        opts.concurrency = 500;
        assert_eq!(opts.effective_concurrency(), MAX_CONCURRENCY);
    }
}
