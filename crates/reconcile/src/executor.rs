//! Execution engine - dispatches a plan wave by wave on a bounded pool
//!
//! Deletes run first (so a replaced identifier is gone before it is
//! created again), then creates and updates. Within a phase, waves come
//! from the dependency graph: every item of a wave is independent of the
//! others, so a wave's batches run in parallel while waves run in order.

use crate::context::{ProgressCallback, RunContext};
use crate::diff::ReconciliationPlan;
use crate::resource::ResourceKind;
use crate::retry::with_retry;
use crate::types::{ItemOutcome, PlannedAction, RunOptions, Stage};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Waves of one execution phase plus, per item, the items whose failure
/// blocks it
#[derive(Debug, Clone)]
pub struct PhaseOrder<I> {
    pub waves: Vec<Vec<I>>,
    pub blockers: HashMap<I, Vec<I>>,
}

impl<I> Default for PhaseOrder<I> {
    fn default() -> Self {
        Self {
            waves: Vec::new(),
            blockers: HashMap::new(),
        }
    }
}

impl<I: Clone + Eq + Hash> PhaseOrder<I> {
    /// A single wave with no blocking relations
    pub fn flat(ids: Vec<I>) -> Self {
        if ids.is_empty() {
            return Self::default();
        }
        Self {
            waves: vec![ids],
            blockers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattened order
    pub fn sequence(&self) -> Vec<&I> {
        self.waves.iter().flatten().collect()
    }
}

/// Deployment order of a plan
#[derive(Debug, Clone)]
pub struct ExecutionOrder<I> {
    pub deletes: PhaseOrder<I>,
    /// Creates and updates
    pub applies: PhaseOrder<I>,
    /// Items held back before execution, with the reason
    pub held: HashMap<I, String>,
}

/// What happened during execution
#[derive(Debug)]
pub struct ExecutionOutcome<I> {
    pub outcomes: Vec<(I, ItemOutcome)>,
    pub deadline_exceeded: bool,
}

struct Batch<I, W> {
    action: PlannedAction,
    ids: Vec<I>,
    items: Vec<W>,
}

/// Outcome table that remembers first-recorded order
struct Outcomes<I> {
    order: Vec<I>,
    by_id: HashMap<I, ItemOutcome>,
}

impl<I: Clone + Eq + Hash> Outcomes<I> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    fn record(&mut self, id: I, outcome: ItemOutcome) {
        if !self.by_id.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.by_id.insert(id, outcome);
    }

    fn get(&self, id: &I) -> Option<&ItemOutcome> {
        self.by_id.get(id)
    }

    fn into_vec(mut self) -> Vec<(I, ItemOutcome)> {
        self.order
            .into_iter()
            .filter_map(|id| self.by_id.remove(&id).map(|outcome| (id, outcome)))
            .collect()
    }
}

pub(crate) struct Executor<'a, K: ResourceKind> {
    kind: &'a K,
    ctx: &'a RunContext,
    options: &'a RunOptions,
    progress: &'a dyn ProgressCallback,
    pool: &'a rayon::ThreadPool,
    deadline: Option<Instant>,
    stop: AtomicBool,
    deadline_hit: AtomicBool,
}

impl<'a, K: ResourceKind> Executor<'a, K> {
    pub(crate) fn new(
        kind: &'a K,
        ctx: &'a RunContext,
        options: &'a RunOptions,
        progress: &'a dyn ProgressCallback,
        pool: &'a rayon::ThreadPool,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            kind,
            ctx,
            options,
            progress,
            pool,
            deadline,
            stop: AtomicBool::new(false),
            deadline_hit: AtomicBool::new(false),
        }
    }

    /// Execute the plan in the given order
    pub(crate) fn execute(
        &self,
        plan: &ReconciliationPlan<K::Id, K::Write>,
        order: &ExecutionOrder<K::Id>,
    ) -> ExecutionOutcome<K::Id> {
        let mut outcomes = Outcomes::new();

        let creates: HashMap<&K::Id, &K::Write> = plan
            .to_create
            .iter()
            .map(|(id, decl)| (id, &decl.item))
            .collect();
        let updates: HashMap<&K::Id, &K::Write> = plan
            .to_update
            .iter()
            .map(|(id, decl)| (id, &decl.item))
            .collect();
        let replaced: HashSet<&K::Id> = plan
            .to_delete
            .iter()
            .filter(|id| creates.contains_key(id))
            .collect();

        for wave in &order.deletes.waves {
            let ready = self.unblocked(wave, &order.deletes.blockers, &mut outcomes);
            let batches =
                self.batches(PlannedAction::Delete, ready.into_iter().map(|id| (id, None)));
            self.run_wave(batches, &replaced, &mut outcomes);
        }

        for wave in &order.applies.waves {
            // A replaced item whose delete did not go through keeps that outcome
            let wave: Vec<K::Id> = wave
                .iter()
                .filter(|id| {
                    !replaced.contains(id)
                        || matches!(outcomes.get(id), Some(ItemOutcome::Deleted))
                })
                .cloned()
                .collect();
            let wave: Vec<K::Id> = wave
                .into_iter()
                .filter(|id| match order.held.get(id) {
                    Some(reason) => {
                        self.skip(id, reason.clone(), &mut outcomes);
                        false
                    }
                    None => true,
                })
                .collect();
            let ready = self.unblocked(&wave, &order.applies.blockers, &mut outcomes);

            let mut to_create = Vec::new();
            let mut to_update = Vec::new();
            for id in ready {
                if let Some(item) = creates.get(&id) {
                    to_create.push((id, Some((*item).clone())));
                } else if let Some(item) = updates.get(&id) {
                    to_update.push((id, Some((*item).clone())));
                }
            }

            let mut batches = self.batches(PlannedAction::Create, to_create);
            batches.extend(self.batches(PlannedAction::Update, to_update));
            self.run_wave(batches, &replaced, &mut outcomes);
        }

        ExecutionOutcome {
            outcomes: outcomes.into_vec(),
            deadline_exceeded: self.deadline_hit.load(Ordering::SeqCst),
        }
    }

    /// Items of a wave whose blockers all completed; the rest are skipped
    fn unblocked(
        &self,
        wave: &[K::Id],
        blockers: &HashMap<K::Id, Vec<K::Id>>,
        outcomes: &mut Outcomes<K::Id>,
    ) -> Vec<K::Id> {
        let mut ready = Vec::with_capacity(wave.len());
        for id in wave {
            let blocked_by = blockers.get(id).and_then(|deps| {
                deps.iter()
                    .find(|dep| outcomes.get(dep).is_some_and(ItemOutcome::blocks_dependents))
            });
            match blocked_by {
                Some(dep) => self.skip(id, format!("{dep} did not complete"), outcomes),
                None => ready.push(id.clone()),
            }
        }
        ready
    }

    fn skip(&self, id: &K::Id, reason: String, outcomes: &mut Outcomes<K::Id>) {
        log::warn!("{}: skipping {id}: {reason}", self.kind.kind());
        let outcome = ItemOutcome::Skipped { reason };
        self.progress
            .on_item_complete(self.kind.kind(), &id.to_string(), &outcome);
        outcomes.record(id.clone(), outcome);
    }

    fn batches(
        &self,
        action: PlannedAction,
        items: impl IntoIterator<Item = (K::Id, Option<K::Write>)>,
    ) -> Vec<Batch<K::Id, K::Write>> {
        let size = self.options.effective_batch_size();
        let mut batches: Vec<Batch<K::Id, K::Write>> = Vec::new();
        for (id, item) in items {
            if batches.last().is_none_or(|b| b.ids.len() >= size) {
                batches.push(Batch {
                    action,
                    ids: Vec::new(),
                    items: Vec::new(),
                });
            }
            if let Some(batch) = batches.last_mut() {
                batch.ids.push(id);
                batch.items.extend(item);
            }
        }
        batches
    }

    fn run_wave(
        &self,
        batches: Vec<Batch<K::Id, K::Write>>,
        replaced: &HashSet<&K::Id>,
        outcomes: &mut Outcomes<K::Id>,
    ) {
        if batches.is_empty() {
            return;
        }
        let results: Vec<Vec<(K::Id, ItemOutcome)>> = self.pool.install(|| {
            batches
                .par_iter()
                .map(|batch| self.dispatch(batch, replaced))
                .collect()
        });
        for (id, outcome) in results.into_iter().flatten() {
            outcomes.record(id, outcome);
        }
    }

    fn dispatch(
        &self,
        batch: &Batch<K::Id, K::Write>,
        replaced: &HashSet<&K::Id>,
    ) -> Vec<(K::Id, ItemOutcome)> {
        let kind = self.kind.kind();

        if let Some(reason) = self.refusal() {
            return batch
                .ids
                .iter()
                .map(|id| {
                    let outcome = ItemOutcome::Skipped {
                        reason: reason.to_string(),
                    };
                    self.progress.on_item_complete(kind, &id.to_string(), &outcome);
                    (id.clone(), outcome)
                })
                .collect();
        }

        for id in &batch.ids {
            self.progress.on_item_start(kind, &id.to_string(), batch.action);
        }

        let label = format!("{kind} {}", batch.action);
        let result = match batch.action {
            PlannedAction::Delete => with_retry(&self.options.retry, &label, || {
                self.kind.delete(self.ctx, &batch.ids)
            })
            .map(|count| {
                if count < batch.ids.len() {
                    log::debug!("{label}: {count} of {} existed", batch.ids.len());
                }
            }),
            PlannedAction::Update => with_retry(&self.options.retry, &label, || {
                self.kind.update(self.ctx, &batch.items)
            })
            .map(drop),
            PlannedAction::Create | PlannedAction::Replace => {
                with_retry(&self.options.retry, &label, || {
                    self.kind.create(self.ctx, &batch.items)
                })
                .map(drop)
            }
        };

        let outcome_for = |id: &K::Id| match (&result, batch.action) {
            (Ok(()), PlannedAction::Delete) => ItemOutcome::Deleted,
            (Ok(()), PlannedAction::Update) => ItemOutcome::Updated,
            (Ok(()), _) if replaced.contains(id) => ItemOutcome::Replaced,
            (Ok(()), _) => ItemOutcome::Created,
            (Err(e), action) => ItemOutcome::Failed {
                stage: stage_of(action),
                error: format!("{e:#}"),
            },
        };

        if let Err(e) = &result {
            log::error!("{label} failed for {} item(s): {e:#}", batch.ids.len());
            if self.options.fail_fast {
                self.stop.store(true, Ordering::SeqCst);
            }
        }

        batch
            .ids
            .iter()
            .map(|id| {
                let outcome = outcome_for(id);
                self.progress.on_item_complete(kind, &id.to_string(), &outcome);
                (id.clone(), outcome)
            })
            .collect()
    }

    /// Why no new call may be dispatched, if any
    fn refusal(&self) -> Option<&'static str> {
        if self.stop.load(Ordering::SeqCst) {
            return Some("not dispatched: an earlier call failed (fail-fast)");
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.deadline_hit.store(true, Ordering::SeqCst);
            return Some("not dispatched: deadline exceeded");
        }
        None
    }
}

fn stage_of(action: PlannedAction) -> Stage {
    match action {
        PlannedAction::Create | PlannedAction::Replace => Stage::Create,
        PlannedAction::Update => Stage::Update,
        PlannedAction::Delete => Stage::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::diff::{DiffOptions, compute_plan};
    use crate::retry::RetryConfig;
    use crate::testing::{MockKind, decl, record};
    use serde_json::json;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn test_flat_order() {
        let order = PhaseOrder::flat(vec!["a", "b"]);
        assert_eq!(order.len(), 2);
        assert_eq!(order.sequence(), vec![&"a", &"b"]);
        assert!(PhaseOrder::<&str>::flat(Vec::new()).waves.is_empty());
    }

    #[test]
    fn test_outcomes_keep_first_recorded_position() {
        let mut outcomes = Outcomes::new();
        outcomes.record("x", ItemOutcome::Deleted);
        outcomes.record("y", ItemOutcome::Created);
        outcomes.record("x", ItemOutcome::Replaced);

        assert_eq!(
            outcomes.into_vec(),
            vec![("x", ItemOutcome::Replaced), ("y", ItemOutcome::Created)]
        );
    }

    #[test]
    fn test_failed_delete_cancels_replacement() {
        let kind = MockKind::new()
            .without_partial_update()
            .fail_on(Stage::Delete, "X");
        kind.seed(json!({"id": "X", "value": 1}));

        let local = vec![(
            "X".to_string(),
            decl(&kind, json!({"id": "X", "value": 2})),
        )];
        let remote = vec![record(kind.stored("X").unwrap())];
        let plan = compute_plan(&kind, local, &remote, DiffOptions::default());
        let order = ExecutionOrder {
            deletes: PhaseOrder::flat(plan.to_delete.clone()),
            applies: PhaseOrder::flat(vec!["X".to_string()]),
            held: HashMap::new(),
        };

        let ctx = RunContext::new("mock", false);
        let options = RunOptions {
            retry: RetryConfig::no_retry(),
            ..Default::default()
        };
        let pool = pool();
        let executor = Executor::new(&kind, &ctx, &options, &NoProgress, &pool, None);
        let outcome = executor.execute(&plan, &order);

        assert_eq!(outcome.outcomes.len(), 1);
        assert!(matches!(
            outcome.outcomes[0].1,
            ItemOutcome::Failed {
                stage: Stage::Delete,
                ..
            }
        ));
        assert_eq!(kind.writes().len(), 1);
        assert_eq!(kind.stored("X").unwrap()["value"], json!(1));
    }

    #[test]
    fn test_items_are_chunked_by_batch_size() {
        let kind = MockKind::new();
        let local = (0..5)
            .map(|i| {
                let id = format!("item-{i}");
                (id.clone(), decl(&kind, json!({"id": id})))
            })
            .collect();
        let plan = compute_plan(&kind, local, &[], DiffOptions::default());
        let order = ExecutionOrder {
            deletes: PhaseOrder::default(),
            applies: PhaseOrder::flat(plan.create_ids().into_iter().cloned().collect()),
            held: HashMap::new(),
        };

        let ctx = RunContext::new("mock", false);
        let options = RunOptions {
            batch_size: 2,
            retry: RetryConfig::no_retry(),
            ..Default::default()
        };
        let pool = pool();
        let outcome =
            Executor::new(&kind, &ctx, &options, &NoProgress, &pool, None).execute(&plan, &order);

        let sizes: Vec<usize> = kind.writes().iter().map(|c| c.ids.len()).collect();
        let mut sorted = sizes.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 2]);
        assert_eq!(
            outcome.outcomes.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["item-0", "item-1", "item-2", "item-3", "item-4"]
        );
    }
}
