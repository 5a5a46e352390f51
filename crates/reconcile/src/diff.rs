//! Diff computation: local declarations against remote resources
//!
//! Everything here is pure. Remote resources are handed in already
//! fetched, so a plan can be computed (and tested) without a store.

use crate::error::MissingIdentifier;
use crate::resource::{LocalDeclaration, ResourceKind};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Flags that change how matched items are classified
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Treat matched-and-equal items as changed
    pub force_update: bool,
    /// Delete remote resources without a local declaration
    pub prune: bool,
}

/// Normalized local and remote forms of one changed item
#[derive(Debug, Clone, PartialEq)]
pub struct Change<I> {
    pub id: I,
    pub local: Value,
    pub remote: Value,
}

/// Four-way partition of one kind's declarations
#[derive(Debug, Clone)]
pub struct ReconciliationPlan<I, W> {
    pub to_create: Vec<(I, LocalDeclaration<W>)>,
    pub to_update: Vec<(I, LocalDeclaration<W>)>,
    pub to_delete: Vec<I>,
    pub unchanged: Vec<I>,
    /// Later occurrences of an already declared identifier
    pub duplicates: Vec<I>,
    /// Items whose normalized forms differ
    pub changes: Vec<Change<I>>,
}

impl<I, W> Default for ReconciliationPlan<I, W> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            unchanged: Vec::new(),
            duplicates: Vec::new(),
            changes: Vec::new(),
        }
    }
}

impl<I: Eq + Hash, W> ReconciliationPlan<I, W> {
    pub fn create_ids(&self) -> Vec<&I> {
        self.to_create.iter().map(|(id, _)| id).collect()
    }

    pub fn update_ids(&self) -> Vec<&I> {
        self.to_update.iter().map(|(id, _)| id).collect()
    }

    /// Identifiers both deleted and created (replace pattern)
    pub fn replaced(&self) -> Vec<&I> {
        let deleted: HashSet<&I> = self.to_delete.iter().collect();
        self.to_create
            .iter()
            .map(|(id, _)| id)
            .filter(|id| deleted.contains(id))
            .collect()
    }

    pub fn is_replace(&self, id: &I) -> bool {
        self.to_delete.contains(id) && self.to_create.iter().any(|(c, _)| c == id)
    }

    /// Check if applying the plan would change anything
    pub fn has_changes(&self) -> bool {
        !(self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty())
    }
}

/// Compute identifiers, setting aside declarations without one.
///
/// Returns the identified declarations in input order and, for the rest,
/// their input position with the reason.
#[allow(clippy::type_complexity)]
pub fn identify<K: ResourceKind>(
    kind: &K,
    declarations: Vec<LocalDeclaration<K::Write>>,
) -> (
    Vec<(K::Id, LocalDeclaration<K::Write>)>,
    Vec<(usize, MissingIdentifier)>,
) {
    let mut identified = Vec::with_capacity(declarations.len());
    let mut missing = Vec::new();
    for (position, decl) in declarations.into_iter().enumerate() {
        match kind.write_id(&decl.item) {
            Ok(id) => identified.push((id, decl)),
            Err(e) => missing.push((position, e)),
        }
    }
    (identified, missing)
}

/// Keep the first occurrence of every identifier.
///
/// Returns the survivors in input order and the identifiers of the
/// dropped later occurrences.
#[allow(clippy::type_complexity)]
pub fn dedupe<I: Clone + Eq + Hash, W>(
    declarations: Vec<(I, LocalDeclaration<W>)>,
) -> (Vec<(I, LocalDeclaration<W>)>, Vec<I>) {
    let mut seen = HashSet::with_capacity(declarations.len());
    let mut kept = Vec::with_capacity(declarations.len());
    let mut duplicates = Vec::new();
    for (id, decl) in declarations {
        if seen.insert(id.clone()) {
            kept.push((id, decl));
        } else {
            duplicates.push(id);
        }
    }
    (kept, duplicates)
}

/// Partition deduplicated declarations against remote resources.
pub fn partition<K: ResourceKind>(
    kind: &K,
    declarations: Vec<(K::Id, LocalDeclaration<K::Write>)>,
    remote: &[K::Read],
    options: DiffOptions,
) -> ReconciliationPlan<K::Id, K::Write> {
    let mut remote_by_id: HashMap<K::Id, Value> = HashMap::with_capacity(remote.len());
    let mut remote_order: Vec<K::Id> = Vec::with_capacity(remote.len());
    for item in remote {
        match kind.read_id(item) {
            Ok(id) => {
                if !remote_by_id.contains_key(&id) {
                    remote_order.push(id.clone());
                    remote_by_id.insert(id, kind.normalize(item));
                }
            }
            Err(e) => log::warn!("{}: skipping remote resource: {e}", kind.kind()),
        }
    }

    let mut plan = ReconciliationPlan::default();
    let local_ids: HashSet<K::Id> = declarations.iter().map(|(id, _)| id.clone()).collect();

    for (id, decl) in declarations {
        let Some(remote_form) = remote_by_id.get(&id) else {
            plan.to_create.push((id, decl));
            continue;
        };

        let equal = decl.raw == *remote_form;
        if equal && !options.force_update {
            plan.unchanged.push(id);
            continue;
        }

        if !equal {
            plan.changes.push(Change {
                id: id.clone(),
                local: decl.raw.clone(),
                remote: remote_form.clone(),
            });
        }

        if kind.supports_partial_update() {
            plan.to_update.push((id, decl));
        } else {
            plan.to_delete.push(id.clone());
            plan.to_create.push((id, decl));
        }
    }

    if options.prune {
        plan.to_delete
            .extend(remote_order.into_iter().filter(|id| !local_ids.contains(id)));
    }

    plan
}

/// Deduplicate, then partition.
pub fn compute_plan<K: ResourceKind>(
    kind: &K,
    declarations: Vec<(K::Id, LocalDeclaration<K::Write>)>,
    remote: &[K::Read],
    options: DiffOptions,
) -> ReconciliationPlan<K::Id, K::Write> {
    let (kept, duplicates) = dedupe(declarations);
    let mut plan = partition(kind, kept, remote, options);
    plan.duplicates = duplicates;
    plan
}
