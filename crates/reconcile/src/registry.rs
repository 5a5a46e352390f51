//! Kind registry - name → descriptor table and multi-kind deployment
//!
//! Every [`ResourceKind`] with a deserializable write model is usable as a
//! [`DynKind`], so callers can hold kinds with different identifier and
//! model types in one table and route raw declarations to them.

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::orchestrator::{Reconciler, RunInput};
use crate::resource::{Classification, LocalDeclaration, ResourceKind};
use crate::types::{ItemOutcome, ReconciliationReport, ReportSummary};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Type-erased resource kind
pub trait DynKind: Send + Sync {
    fn kind(&self) -> &'static str;
    fn folder(&self) -> &'static str;
    fn depends_on_kinds(&self) -> &'static [&'static str];
    fn classify(&self, raw: &Value) -> Classification;

    /// Deploy raw declarations; `blocked` lists `(kind, id)` references
    /// that did not complete earlier in the deployment
    fn run(
        &self,
        reconciler: &Reconciler<'_>,
        raw: Vec<Value>,
        blocked: BTreeSet<(String, String)>,
    ) -> Result<ReconciliationReport>;

    /// Delete the resources raw declarations name
    fn clean(&self, reconciler: &Reconciler<'_>, raw: Vec<Value>) -> Result<ReconciliationReport>;
}

impl<K> DynKind for K
where
    K: ResourceKind,
    K::Write: DeserializeOwned,
{
    fn kind(&self) -> &'static str {
        ResourceKind::kind(self)
    }

    fn folder(&self) -> &'static str {
        ResourceKind::folder(self)
    }

    fn depends_on_kinds(&self) -> &'static [&'static str] {
        ResourceKind::depends_on_kinds(self)
    }

    fn classify(&self, raw: &Value) -> Classification {
        ResourceKind::classify(self, raw)
    }

    fn run(
        &self,
        reconciler: &Reconciler<'_>,
        raw: Vec<Value>,
        blocked: BTreeSet<(String, String)>,
    ) -> Result<ReconciliationReport> {
        let input = RunInput {
            declarations: raw.into_iter().map(|r| parse(self, r)).collect(),
            blocked,
        };
        reconciler.run_input(self, input)
    }

    fn clean(&self, reconciler: &Reconciler<'_>, raw: Vec<Value>) -> Result<ReconciliationReport> {
        let input = RunInput {
            declarations: raw.into_iter().map(|r| parse(self, r)).collect(),
            blocked: BTreeSet::new(),
        };
        reconciler.clean_input(self, input)
    }
}

/// Parse a raw mapping into a declaration of `kind`
pub fn parse<K>(kind: &K, raw: Value) -> Result<LocalDeclaration<K::Write>>
where
    K: ResourceKind,
    K::Write: DeserializeOwned,
{
    let canonical = kind.normalize_local(&raw);
    serde_json::from_value(raw)
        .map(|item| LocalDeclaration::new(canonical, item))
        .map_err(|e| Error::Load {
            kind: ResourceKind::kind(kind).to_string(),
            reason: e.to_string(),
        })
}

/// What happened to one kind during a multi-kind deployment
#[derive(Debug)]
pub enum KindStatus {
    Completed(ReconciliationReport),
    /// The run aborted before any mutation
    Failed(Error),
    /// Not run because a kind it depends on did not complete
    Skipped(String),
}

#[derive(Debug)]
pub struct KindRun {
    pub kind: &'static str,
    pub status: KindStatus,
}

impl KindRun {
    pub fn report(&self) -> Option<&ReconciliationReport> {
        match &self.status {
            KindStatus::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// Completed with no failed item
    pub fn is_success(&self) -> bool {
        self.report().is_some_and(ReconciliationReport::is_success)
    }
}

/// Reports of a multi-kind deployment, in execution order
#[derive(Debug, Default)]
pub struct DeploymentSummary {
    pub runs: Vec<KindRun>,
}

impl DeploymentSummary {
    pub fn get(&self, kind: &str) -> Option<&KindRun> {
        self.runs.iter().find(|run| run.kind == kind)
    }

    pub fn reports(&self) -> impl Iterator<Item = &ReconciliationReport> {
        self.runs.iter().filter_map(KindRun::report)
    }

    /// Outcome counts over every completed kind
    pub fn totals(&self) -> ReportSummary {
        let mut totals = ReportSummary::default();
        for report in self.reports() {
            totals.merge(&report.summary());
        }
        totals
    }

    pub fn is_success(&self) -> bool {
        self.runs.iter().all(KindRun::is_success)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.reports().any(|r| r.deadline_exceeded)
    }
}

impl fmt::Display for DeploymentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for run in &self.runs {
            match &run.status {
                KindStatus::Completed(report) => writeln!(f, "{}: {}", run.kind, report.summary())?,
                KindStatus::Failed(e) => writeln!(f, "{}: failed: {e}", run.kind)?,
                KindStatus::Skipped(reason) => writeln!(f, "{}: skipped: {reason}", run.kind)?,
            }
        }
        write!(f, "total: {}", self.totals())
    }
}

/// Registered resource kinds
#[derive(Default)]
pub struct KindRegistry {
    kinds: Vec<Box<dyn DynKind>>,
    index: HashMap<&'static str, usize>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind; names must be unique
    pub fn register(&mut self, kind: impl DynKind + 'static) -> Result<()> {
        let name = kind.kind();
        if self.index.contains_key(name) {
            return Err(Error::Config(format!("resource kind {name} registered twice")));
        }
        self.index.insert(name, self.kinds.len());
        self.kinds.push(Box::new(kind));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn DynKind> {
        self.index
            .get(name)
            .map(|&i| self.kinds[i].as_ref())
            .ok_or_else(|| Error::UnknownKind(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Kinds in registration order
    pub fn kinds(&self) -> impl Iterator<Item = &dyn DynKind> {
        self.kinds.iter().map(AsRef::as_ref)
    }

    /// Distinct folders, in registration order
    pub fn folders(&self) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        self.kinds()
            .map(DynKind::folder)
            .filter(|folder| seen.insert(*folder))
            .collect()
    }

    /// First kind in `folder` that claims `raw`
    pub fn route(&self, folder: &str, raw: &Value) -> Option<&dyn DynKind> {
        self.kinds()
            .filter(|kind| kind.folder() == folder)
            .find(|kind| kind.classify(raw) == Classification::Matched)
    }

    /// Kinds sorted so that every kind comes after the kinds it depends on.
    ///
    /// Dependencies on unregistered kinds are ignored.
    pub fn deployment_order(&self) -> Result<Vec<&dyn DynKind>> {
        let graph = DependencyGraph::build(self.kinds().map(DynKind::kind), |name| {
            self.get(name)
                .map(|kind| kind.depends_on_kinds().to_vec())
                .unwrap_or_default()
        });
        graph
            .topological_sort()
            .map_err(Error::CycleDetected)?
            .into_iter()
            .map(|name| self.get(name))
            .collect()
    }

    /// Deploy declarations grouped by kind name, in deployment order.
    ///
    /// A kind that aborts makes every kind depending on it skip; item
    /// failures only hold back the items that reference them.
    pub fn deploy_all(
        &self,
        reconciler: &Reconciler<'_>,
        mut declarations: BTreeMap<String, Vec<Value>>,
    ) -> Result<DeploymentSummary> {
        let order = self.deployment_order()?;
        let mut summary = DeploymentSummary::default();
        let mut blocked: BTreeSet<(String, String)> = BTreeSet::new();
        let mut aborted: HashSet<&'static str> = HashSet::new();

        for kind in order {
            let name = kind.kind();
            let raw = declarations.remove(name).unwrap_or_default();

            if let Some(dep) = kind.depends_on_kinds().iter().find(|d| aborted.contains(*d)) {
                log::warn!("{name}: skipped, {dep} did not complete");
                aborted.insert(name);
                summary.runs.push(KindRun {
                    kind: name,
                    status: KindStatus::Skipped(format!("{dep} did not complete")),
                });
                continue;
            }

            let status = match kind.run(reconciler, raw, blocked.clone()) {
                Ok(report) => {
                    blocked.extend(
                        report
                            .ids_where(ItemOutcome::blocks_dependents)
                            .into_iter()
                            .map(|id| (name.to_string(), id.to_string())),
                    );
                    KindStatus::Completed(report)
                }
                Err(e) => {
                    aborted.insert(name);
                    KindStatus::Failed(e)
                }
            };
            summary.runs.push(KindRun { kind: name, status });
        }

        for name in declarations.keys() {
            log::warn!("no resource kind named {name}, its declarations were ignored");
        }
        Ok(summary)
    }

    /// Delete declared resources of every kind, dependents first.
    ///
    /// A kind is left alone when a kind depending on it did not clean up
    /// completely.
    pub fn clean_all(
        &self,
        reconciler: &Reconciler<'_>,
        mut declarations: BTreeMap<String, Vec<Value>>,
    ) -> Result<DeploymentSummary> {
        let mut order = self.deployment_order()?;
        order.reverse();
        let mut summary = DeploymentSummary::default();
        let mut incomplete: Vec<&dyn DynKind> = Vec::new();

        for kind in order {
            let name = kind.kind();
            let raw = declarations.remove(name).unwrap_or_default();

            if let Some(dependent) = incomplete
                .iter()
                .find(|other| other.depends_on_kinds().contains(&name))
            {
                let reason = format!("{} was not fully cleaned", dependent.kind());
                log::warn!("{name}: skipped, {reason}");
                incomplete.push(kind);
                summary.runs.push(KindRun {
                    kind: name,
                    status: KindStatus::Skipped(reason),
                });
                continue;
            }

            let status = match kind.clean(reconciler, raw) {
                Ok(report) => KindStatus::Completed(report),
                Err(e) => KindStatus::Failed(e),
            };
            let run = KindRun { kind: name, status };
            if !run.is_success() {
                incomplete.push(kind);
            }
            summary.runs.push(run);
        }
        Ok(summary)
    }
}
