//! Run context and provider traits
//!
//! These traits allow the reconcile crate to be used without depending on
//! a specific credential source or progress UI.

use crate::access::Capability;
use crate::types::{ItemOutcome, Phase, PlannedAction};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Source of the principal's current grants
pub trait GrantProvider: Send + Sync {
    /// Grants currently held by the principal
    fn grants(&self) -> Result<Vec<Capability>>;

    /// Skip the access check entirely
    fn is_unrestricted(&self) -> bool {
        false
    }
}

/// Provider for principals that are not subject to access checks
pub struct Unrestricted;

impl GrantProvider for Unrestricted {
    fn grants(&self) -> Result<Vec<Capability>> {
        Ok(Vec::new())
    }

    fn is_unrestricted(&self) -> bool {
        true
    }
}

impl GrantProvider for Vec<Capability> {
    fn grants(&self) -> Result<Vec<Capability>> {
        Ok(self.clone())
    }
}

/// Progress callback for reconciliation runs
///
/// Called from worker threads during execution, so implementations must
/// be `Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Called when a run of `kind` enters a new phase
    fn on_phase(&self, kind: &str, phase: Phase);

    /// Called when a collaborator call for an item is dispatched
    fn on_item_start(&self, kind: &str, id: &str, action: PlannedAction);

    /// Called when an item reaches its final outcome
    fn on_item_complete(&self, kind: &str, id: &str, outcome: &ItemOutcome);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase(&self, _kind: &str, _phase: Phase) {}
    fn on_item_start(&self, _kind: &str, _id: &str, _action: PlannedAction) {}
    fn on_item_complete(&self, _kind: &str, _id: &str, _outcome: &ItemOutcome) {}
}

/// Name ↔ id translations gathered during one run.
///
/// Keys are namespaced (e.g. `"dataSet"`, `"container"`) so collaborators
/// of different kinds can share one cache without collisions.
#[derive(Debug, Default)]
pub struct LookupCache {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert(&self, namespace: &str, key: &str, value: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), key.to_string()), value.into());
    }

    /// Cached value, or the result of `lookup` stored for next time.
    ///
    /// Failed lookups are not cached.
    pub fn get_or_try_insert_with<F>(&self, namespace: &str, key: &str, lookup: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        if let Some(hit) = self.get(namespace, key) {
            return Ok(hit);
        }
        // Not holding the lock across the lookup; a concurrent miss may
        // look up the same key twice, which is harmless.
        let value = lookup()?;
        self.insert(namespace, key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Context passed to every collaborator call of one run.
///
/// Created when a run starts and dropped when it ends, so nothing cached
/// here leaks into the next run.
#[derive(Debug)]
pub struct RunContext {
    kind: String,
    dry_run: bool,
    cache: LookupCache,
}

impl RunContext {
    pub fn new(kind: impl Into<String>, dry_run: bool) -> Self {
        Self {
            kind: kind.into(),
            dry_run,
            cache: LookupCache::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cache_hits_skip_lookup() {
        let cache = LookupCache::new();
        let lookups = Cell::new(0);
        let lookup = || {
            lookups.set(lookups.get() + 1);
            Ok("42".to_string())
        };

        assert_eq!(cache.get_or_try_insert_with("dataSet", "ds_a", lookup).unwrap(), "42");
        assert_eq!(
            cache
                .get_or_try_insert_with("dataSet", "ds_a", || anyhow::bail!("not called"))
                .unwrap(),
            "42"
        );
        assert_eq!(lookups.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_lookups_are_not_cached() {
        let cache = LookupCache::new();
        assert!(
            cache
                .get_or_try_insert_with("dataSet", "missing", || anyhow::bail!("unknown"))
                .is_err()
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_namespaces_are_separate() {
        let cache = LookupCache::new();
        cache.insert("dataSet", "x", "1");
        cache.insert("container", "x", "present");
        assert_eq!(cache.get("dataSet", "x").as_deref(), Some("1"));
        assert_eq!(cache.get("container", "x").as_deref(), Some("present"));
    }

    #[test]
    fn test_each_context_has_its_own_cache() {
        let first = RunContext::new("views", false);
        first.cache().insert("container", "sp:pump", "present");
        let second = RunContext::new("views", false);
        assert!(second.cache().is_empty());
    }
}
