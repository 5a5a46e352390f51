//! Reconciliation orchestrator - drives one kind through a full run
//!
//! A run moves through `Loading → AccessCheck → Retrieving → Diffing →
//! Ordering → Executing → Done`, ending in `Failed` instead when a stage
//! aborts. Only retrieval and execution talk to the remote store, and
//! nothing is mutated before the access check and the ordering have both
//! succeeded.

use crate::access::{merge_requirements, verify_access};
use crate::context::{GrantProvider, NoProgress, ProgressCallback, RunContext, Unrestricted};
use crate::diff::{self, DiffOptions, ReconciliationPlan};
use crate::diffview;
use crate::error::{Error, Result};
use crate::executor::{ExecutionOrder, Executor, PhaseOrder};
use crate::graph::DependencyGraph;
use crate::resource::{
    Dependency, LocalDeclaration, ResourceKind, same_kind_dependencies,
    same_kind_read_dependencies,
};
use crate::retry::with_retry;
use crate::types::{
    ExternalRef, ItemDiff, ItemOutcome, Phase, PlannedAction, ReconciliationReport, RunOptions,
    Stage,
};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

/// Input of one run: declarations in discovery order, some of which may
/// have failed to load, and references that must not be deployed against.
pub struct RunInput<W> {
    pub declarations: Vec<Result<LocalDeclaration<W>>>,
    /// `(kind, id)` pairs of other kinds that did not complete
    pub blocked: BTreeSet<(String, String)>,
}

impl<W> RunInput<W> {
    pub fn new(declarations: Vec<LocalDeclaration<W>>) -> Self {
        Self {
            declarations: declarations.into_iter().map(Ok).collect(),
            blocked: BTreeSet::new(),
        }
    }
}

/// Runs resource kinds against their remote store
pub struct Reconciler<'a> {
    options: RunOptions,
    grants: &'a dyn GrantProvider,
    progress: &'a dyn ProgressCallback,
    pool: rayon::ThreadPool,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        options: RunOptions,
        grants: &'a dyn GrantProvider,
        progress: &'a dyn ProgressCallback,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.effective_concurrency())
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to create worker pool: {e}")))?;
        Ok(Self {
            options,
            grants,
            progress,
            pool,
        })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Reconcile `declarations` of one kind with the remote store
    pub fn run<K: ResourceKind>(
        &self,
        kind: &K,
        declarations: Vec<LocalDeclaration<K::Write>>,
    ) -> Result<ReconciliationReport> {
        self.run_input(kind, RunInput::new(declarations))
    }

    /// Like [`Self::run`], with load failures and blocked references
    pub fn run_input<K: ResourceKind>(
        &self,
        kind: &K,
        input: RunInput<K::Write>,
    ) -> Result<ReconciliationReport> {
        self.guarded(kind, |run| run.deploy(input))
    }

    /// Delete every declared identifier that exists remotely
    pub fn clean<K: ResourceKind>(
        &self,
        kind: &K,
        declarations: Vec<LocalDeclaration<K::Write>>,
    ) -> Result<ReconciliationReport> {
        self.clean_input(kind, RunInput::new(declarations))
    }

    /// Like [`Self::clean`], with load failures
    pub fn clean_input<K: ResourceKind>(
        &self,
        kind: &K,
        input: RunInput<K::Write>,
    ) -> Result<ReconciliationReport> {
        self.guarded(kind, |run| run.clean(input))
    }

    fn guarded<K, F>(&self, kind: &K, body: F) -> Result<ReconciliationReport>
    where
        K: ResourceKind,
        F: FnOnce(&mut Run<'_, K>) -> Result<()>,
    {
        let mut run = Run {
            reconciler: self,
            kind,
            ctx: RunContext::new(kind.kind(), self.options.dry_run),
            report: ReconciliationReport::new(kind.kind(), self.options.dry_run),
            deadline: self.options.deadline.map(|d| Instant::now() + d),
        };
        match body(&mut run) {
            Ok(()) => {
                run.enter(Phase::Done);
                let summary = run.report.summary();
                log::info!("{}: {summary}", kind.kind());
                Ok(run.report)
            }
            Err(e) => {
                run.enter(Phase::Failed);
                log::error!("{e}");
                Err(e)
            }
        }
    }
}

/// Run a single kind with default options and no access check
pub fn run_simple<K: ResourceKind>(
    kind: &K,
    declarations: Vec<LocalDeclaration<K::Write>>,
) -> Result<ReconciliationReport> {
    Reconciler::new(RunOptions::default(), &Unrestricted, &NoProgress)?.run(kind, declarations)
}

/// State of one run
struct Run<'r, K: ResourceKind> {
    reconciler: &'r Reconciler<'r>,
    kind: &'r K,
    ctx: RunContext,
    report: ReconciliationReport,
    deadline: Option<Instant>,
}

type Identified<K> = Vec<(
    <K as ResourceKind>::Id,
    LocalDeclaration<<K as ResourceKind>::Write>,
)>;

impl<K: ResourceKind> Run<'_, K> {
    fn options(&self) -> &RunOptions {
        &self.reconciler.options
    }

    fn enter(&self, phase: Phase) {
        log::debug!("{}: {phase}", self.kind.kind());
        self.reconciler.progress.on_phase(self.kind.kind(), phase);
    }

    fn record(&mut self, id: impl Into<String>, outcome: ItemOutcome) {
        let id = id.into();
        self.reconciler
            .progress
            .on_item_complete(self.kind.kind(), &id, &outcome);
        self.report.record(id, outcome);
    }

    fn deploy(&mut self, input: RunInput<K::Write>) -> Result<()> {
        let blocked = input.blocked.clone();
        let declarations = self.load(input);

        self.check_access(&declarations, self.options().dry_run)?;

        let remote = self.retrieve(&declarations)?;
        let declarations: Identified<K> = declarations
            .into_iter()
            .filter(|(id, _)| self.report.outcome(&id.to_string()).is_none())
            .collect();

        self.enter(Phase::Diffing);
        let options = self.options();
        let mut plan = diff::partition(
            self.kind,
            declarations,
            &remote,
            DiffOptions {
                force_update: options.force_update,
                prune: options.prune,
            },
        );
        log::info!(
            "{}: {} to create, {} to update, {} to delete, {} unchanged",
            self.kind.kind(),
            plan.to_create.len(),
            plan.to_update.len(),
            plan.to_delete.len(),
            plan.unchanged.len()
        );
        if self.options().verbose_diff {
            self.render_diffs(&plan);
        }
        for id in std::mem::take(&mut plan.unchanged) {
            self.record(id.to_string(), ItemOutcome::Unchanged);
        }

        self.enter(Phase::Ordering);
        let order = self.order(&plan, &remote, &blocked)?;

        self.execute(&plan, &order);
        Ok(())
    }

    fn clean(&mut self, input: RunInput<K::Write>) -> Result<()> {
        let declarations = self.load(input);
        self.check_access(&declarations, false)?;
        let remote = self.retrieve(&declarations)?;

        let existing: HashSet<K::Id> = remote
            .iter()
            .filter_map(|item| self.kind.read_id(item).ok())
            .collect();

        let mut plan = ReconciliationPlan::default();
        let mut items = HashMap::new();
        for (id, decl) in declarations {
            if self.report.outcome(&id.to_string()).is_some() {
                continue;
            }
            if existing.contains(&id) {
                plan.to_delete.push(id.clone());
                items.insert(id, decl.item);
            } else {
                self.record(id.to_string(), ItemOutcome::Unchanged);
            }
        }

        self.enter(Phase::Ordering);
        let deps = self.delete_dependencies(&plan.to_delete, &remote, &items);
        let deletes = self.delete_order(&plan.to_delete, &deps)?;
        let order = ExecutionOrder {
            deletes,
            applies: PhaseOrder::default(),
            held: HashMap::new(),
        };
        self.execute(&plan, &order);
        Ok(())
    }

    /// Identify and deduplicate declarations, reporting those set aside
    fn load(&mut self, input: RunInput<K::Write>) -> Identified<K> {
        self.enter(Phase::Loading);
        let kind = self.kind.kind();

        let mut positions = Vec::with_capacity(input.declarations.len());
        let mut loaded = Vec::with_capacity(input.declarations.len());
        for (position, declaration) in input.declarations.into_iter().enumerate() {
            match declaration {
                Ok(decl) => {
                    positions.push(position);
                    loaded.push(decl);
                }
                Err(err) => {
                    log::warn!("skipping declaration #{}: {err}", position + 1);
                    self.record(
                        unidentified(position),
                        ItemOutcome::Skipped {
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }

        let (identified, missing) = diff::identify(self.kind, loaded);
        for (index, err) in missing {
            let position = positions[index];
            log::warn!("{kind}: skipping declaration #{}: {err}", position + 1);
            self.record(
                unidentified(position),
                ItemOutcome::Skipped {
                    reason: err.to_string(),
                },
            );
        }

        let (kept, duplicates) = diff::dedupe(identified);
        for id in &duplicates {
            log::warn!("{kind}: duplicate identifier {id}, keeping the first declaration");
        }
        self.report.duplicates = duplicates.iter().map(ToString::to_string).collect();

        for (id, decl) in &kept {
            for dep in self.kind.dependencies(&decl.item) {
                if let Dependency::Other { kind: other, id: target } = dep {
                    self.report.external_dependencies.push(ExternalRef {
                        from: id.to_string(),
                        kind: other,
                        id: target,
                    });
                }
            }
        }
        kept
    }

    fn check_access(&self, declarations: &Identified<K>, read_only: bool) -> Result<()> {
        self.enter(Phase::AccessCheck);
        let grants = self.reconciler.grants;
        if grants.is_unrestricted() || declarations.is_empty() {
            return Ok(());
        }

        let items: Vec<K::Write> = declarations.iter().map(|(_, d)| d.item.clone()).collect();
        let required = merge_requirements(self.kind.required_capabilities(&items, read_only));
        if required.is_empty() {
            return Ok(());
        }

        let granted = grants.grants().map_err(|source| Error::Collaborator {
            kind: self.kind.kind().to_string(),
            stage: Stage::Access,
            source,
        })?;
        verify_access(self.kind.kind(), &granted, &required)
    }

    /// Fetch remote resources for the declared identifiers, plus every
    /// remote resource when pruning.
    ///
    /// Identifiers whose lookup failed are recorded as failed and must not
    /// be diffed.
    fn retrieve(&mut self, declarations: &Identified<K>) -> Result<Vec<K::Read>> {
        self.enter(Phase::Retrieving);
        let reconciler = self.reconciler;
        let options = &reconciler.options;
        let kind = self.kind;
        let ids: Vec<K::Id> = declarations.iter().map(|(id, _)| id.clone()).collect();
        let label = format!("{} retrieve", kind.kind());

        let chunks: Vec<&[K::Id]> = ids.chunks(options.effective_batch_size()).collect();
        let results: Vec<anyhow::Result<Vec<K::Read>>> = {
            let ctx = &self.ctx;
            reconciler.pool.install(|| {
                chunks
                    .par_iter()
                    .map(|chunk| with_retry(&options.retry, &label, || kind.retrieve(ctx, chunk)))
                    .collect()
            })
        };

        let listed = if options.prune {
            let declared: HashSet<&K::Id> = ids.iter().collect();
            let listed = with_retry(&options.retry, &format!("{} list", kind.kind()), || {
                kind.list(&self.ctx)
            })
            .map_err(|source| Error::Collaborator {
                kind: kind.kind().to_string(),
                stage: Stage::List,
                source,
            })?;
            listed
                .into_iter()
                .filter(|item| kind.read_id(item).is_ok_and(|id| !declared.contains(&id)))
                .collect()
        } else {
            Vec::new()
        };

        let mut remote = Vec::new();
        for (chunk, result) in chunks.iter().zip(results) {
            match result {
                Ok(found) => remote.extend(found),
                Err(e) => {
                    log::error!("{label} failed for {} item(s): {e:#}", chunk.len());
                    for id in *chunk {
                        self.record(
                            id.to_string(),
                            ItemOutcome::Failed {
                                stage: Stage::Retrieve,
                                error: format!("{e:#}"),
                            },
                        );
                    }
                }
            }
        }
        remote.extend(listed);
        Ok(remote)
    }

    fn render_diffs(&mut self, plan: &ReconciliationPlan<K::Id, K::Write>) {
        let sensitive = self.kind.sensitive_fields();
        for change in &plan.changes {
            let text = diffview::render(&change.local, &change.remote, sensitive);
            log::info!("{} {}:\n{text}", self.kind.kind(), change.id);
            self.report.diffs.push(ItemDiff {
                id: change.id.to_string(),
                diff: text,
            });
        }
    }

    fn order(
        &self,
        plan: &ReconciliationPlan<K::Id, K::Write>,
        remote: &[K::Read],
        blocked: &BTreeSet<(String, String)>,
    ) -> Result<ExecutionOrder<K::Id>> {
        let items: HashMap<&K::Id, &K::Write> = plan
            .to_create
            .iter()
            .chain(&plan.to_update)
            .map(|(id, decl)| (id, &decl.item))
            .collect();

        let apply_ids = plan.create_ids().into_iter().chain(plan.update_ids()).cloned();
        let graph = DependencyGraph::build(apply_ids, |id| {
            items
                .get(id)
                .map(|item| same_kind_dependencies(self.kind, item))
                .unwrap_or_default()
        });
        let waves = graph.levels().map_err(Error::CycleDetected)?;
        let blockers = graph
            .nodes()
            .map(|id| {
                let deps = graph.dependencies_of(id).into_iter().cloned().collect();
                (id.clone(), deps)
            })
            .collect();

        let mut held = HashMap::new();
        for (&id, &item) in &items {
            if let Some(reason) = self.hold_reason(item, blocked) {
                held.insert(id.clone(), reason);
            }
        }

        let declared: HashMap<K::Id, K::Write> = items
            .iter()
            .map(|(&id, &item)| (id.clone(), item.clone()))
            .collect();
        let deps = self.delete_dependencies(&plan.to_delete, remote, &declared);
        let deletes = self.delete_order(&plan.to_delete, &deps)?;

        Ok(ExecutionOrder {
            deletes,
            applies: PhaseOrder { waves, blockers },
            held,
        })
    }

    /// Why an item cannot be deployed in this run, if anything
    fn hold_reason(&self, item: &K::Write, blocked: &BTreeSet<(String, String)>) -> Option<String> {
        self.kind.dependencies(item).into_iter().find_map(|dep| match dep {
            Dependency::Other { kind, id } if blocked.contains(&(kind.clone(), id.clone())) => {
                Some(format!("{kind} {id} did not complete"))
            }
            Dependency::SameKind(id) => {
                let rendered = id.to_string();
                self.report
                    .outcome(&rendered)
                    .is_some_and(ItemOutcome::blocks_dependents)
                    .then(|| format!("{rendered} did not complete"))
            }
            Dependency::Other { .. } => None,
        })
    }

    /// Same-kind references of each item being deleted.
    ///
    /// The remote resource is what gets deleted, so its references win;
    /// the declaration only stands in for items the store did not return.
    fn delete_dependencies(
        &self,
        ids: &[K::Id],
        remote: &[K::Read],
        declared: &HashMap<K::Id, K::Write>,
    ) -> HashMap<K::Id, Vec<K::Id>> {
        if !self.kind.strict_delete_order() {
            return HashMap::new();
        }
        let deleting: HashSet<&K::Id> = ids.iter().collect();
        let mut deps: HashMap<K::Id, Vec<K::Id>> = HashMap::new();
        for item in remote {
            if let Ok(id) = self.kind.read_id(item)
                && deleting.contains(&id)
            {
                deps.insert(id, same_kind_read_dependencies(self.kind, item));
            }
        }
        for (id, item) in declared {
            if deleting.contains(id) && !deps.contains_key(id) {
                deps.insert(id.clone(), same_kind_dependencies(self.kind, item));
            }
        }
        deps
    }

    /// Deletes in one flat wave, or dependents before their dependencies
    /// when the kind asks for strict ordering
    fn delete_order(
        &self,
        ids: &[K::Id],
        deps: &HashMap<K::Id, Vec<K::Id>>,
    ) -> Result<PhaseOrder<K::Id>> {
        if !self.kind.strict_delete_order() {
            return Ok(PhaseOrder::flat(ids.to_vec()));
        }

        let graph = DependencyGraph::build(ids.iter().cloned(), |id| {
            deps.get(id).cloned().unwrap_or_default()
        });
        let mut waves = graph.levels().map_err(Error::CycleDetected)?;
        waves.reverse();

        // A dependency waits for every dependent being deleted
        let mut blockers: HashMap<K::Id, Vec<K::Id>> = HashMap::new();
        for dependent in graph.nodes() {
            for dependency in graph.dependencies_of(dependent) {
                blockers
                    .entry(dependency.clone())
                    .or_default()
                    .push(dependent.clone());
            }
        }
        Ok(PhaseOrder { waves, blockers })
    }

    fn execute(
        &mut self,
        plan: &ReconciliationPlan<K::Id, K::Write>,
        order: &ExecutionOrder<K::Id>,
    ) {
        self.enter(Phase::Executing);

        if self.options().dry_run {
            let replaced: HashSet<&K::Id> = plan.replaced().into_iter().collect();
            for id in order.deletes.sequence() {
                if !replaced.contains(id) {
                    self.plan_item(id, PlannedAction::Delete);
                }
            }
            for id in order.applies.sequence() {
                if let Some(reason) = order.held.get(id) {
                    self.record(id.to_string(), ItemOutcome::Skipped { reason: reason.clone() });
                } else if replaced.contains(id) {
                    self.plan_item(id, PlannedAction::Replace);
                } else if plan.to_update.iter().any(|(u, _)| u == id) {
                    self.plan_item(id, PlannedAction::Update);
                } else {
                    self.plan_item(id, PlannedAction::Create);
                }
            }
            return;
        }

        let reconciler = self.reconciler;
        let executor = Executor::new(
            self.kind,
            &self.ctx,
            &reconciler.options,
            reconciler.progress,
            &reconciler.pool,
            self.deadline,
        );
        let outcome = executor.execute(plan, order);
        for (id, item) in outcome.outcomes {
            self.report.record(id.to_string(), item);
        }
        if outcome.deadline_exceeded {
            log::warn!(
                "{}: deadline exceeded, remaining items were not dispatched",
                self.kind.kind()
            );
            self.report.deadline_exceeded = true;
        }
    }

    fn plan_item(&mut self, id: &K::Id, action: PlannedAction) {
        self.record(id.to_string(), ItemOutcome::Planned { action });
    }
}

/// Report key of a declaration that never got an identifier
fn unidentified(position: usize) -> String {
    format!("<declaration #{}>", position + 1)
}
