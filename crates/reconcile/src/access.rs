//! Access resolution
//!
//! Before anything is mutated, the required capabilities of a batch are
//! checked against the principal's current grants. For each required
//! action the scopes of every grant carrying that action are unioned; the
//! per-action unions are then intersected. The result is the scope under
//! which every required action is already permitted.

use crate::error::{Error, Result};
use crate::scope::{self, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A grant held by the principal: some actions on one ACL, within a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub acl: String,
    pub actions: BTreeSet<String>,
    pub scope: Scope,
}

impl Capability {
    pub fn new<A: Into<String>>(
        acl: impl Into<String>,
        actions: impl IntoIterator<Item = A>,
        scope: Scope,
    ) -> Self {
        Self {
            acl: acl.into(),
            actions: actions.into_iter().map(Into::into).collect(),
            scope,
        }
    }
}

/// What a batch of write operations needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCapability {
    pub acl: String,
    pub actions: Vec<String>,
    pub scope: Scope,
}

impl RequiredCapability {
    pub fn new<A: Into<String>>(
        acl: impl Into<String>,
        actions: impl IntoIterator<Item = A>,
        scope: Scope,
    ) -> Self {
        let mut actions: Vec<String> = actions.into_iter().map(Into::into).collect();
        actions.sort();
        actions.dedup();
        Self {
            acl: acl.into(),
            actions,
            scope,
        }
    }
}

/// A requirement the current grants do not cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingCapability {
    pub acl: String,
    pub actions: Vec<String>,
    pub required: Scope,
    /// Common scope the grants do allow, if any
    pub granted: Option<Scope>,
}

impl fmt::Display for MissingCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} on {}",
            self.acl,
            self.actions.join("+"),
            self.required
        )?;
        if let Some(granted) = &self.granted {
            write!(f, " (granted only {granted})")?;
        }
        Ok(())
    }
}

/// Scope under which every one of `actions` is permitted on `acl`.
pub fn effective_scope(grants: &[Capability], acl: &str, actions: &[String]) -> Option<Scope> {
    let per_action: Vec<Option<Scope>> = actions
        .iter()
        .map(|action| {
            scope::union_all(
                grants
                    .iter()
                    .filter(|grant| grant.acl == acl && grant.actions.contains(action))
                    .map(|grant| &grant.scope),
            )
        })
        .collect();

    if per_action.is_empty() {
        return None;
    }
    scope::intersection_all(per_action.iter().map(Option::as_ref))
}

/// Collapse requirements on the same ACL and actions into one.
///
/// Requirements whose scopes cannot be unioned stay separate.
pub fn merge_requirements(required: Vec<RequiredCapability>) -> Vec<RequiredCapability> {
    let mut merged: Vec<RequiredCapability> = Vec::new();
    for req in required {
        let target = merged.iter_mut().find(|existing| {
            existing.acl == req.acl
                && existing.actions == req.actions
                && scope::union(Some(&existing.scope), Some(&req.scope)).is_some()
        });
        match target {
            Some(existing) => {
                if let Some(scope) = scope::union(Some(&existing.scope), Some(&req.scope)) {
                    existing.scope = scope;
                }
            }
            None => merged.push(req),
        }
    }
    merged
}

/// Requirements the grants do not cover
pub fn missing_capabilities(
    grants: &[Capability],
    required: &[RequiredCapability],
) -> Vec<MissingCapability> {
    required
        .iter()
        .filter_map(|req| {
            let granted = effective_scope(grants, &req.acl, &req.actions);
            let covered = granted
                .as_ref()
                .is_some_and(|scope| scope.covers(&req.scope));
            (!covered).then(|| MissingCapability {
                acl: req.acl.clone(),
                actions: req.actions.clone(),
                required: req.scope.clone(),
                granted,
            })
        })
        .collect()
}

/// Fail with [`Error::AccessDenied`] unless every requirement is covered
pub fn verify_access(
    kind: &str,
    grants: &[Capability],
    required: &[RequiredCapability],
) -> Result<()> {
    let missing = missing_capabilities(grants, required);
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::AccessDenied {
        kind: kind.to_string(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_effective_scope_unions_per_action_then_intersects() {
        let grants = vec![
            Capability::new("dataModelsAcl", ["READ", "WRITE"], Scope::spaces(["a"])),
            Capability::new("dataModelsAcl", ["READ"], Scope::spaces(["b", "c"])),
            Capability::new("dataModelsAcl", ["WRITE"], Scope::spaces(["b"])),
            Capability::new("groupsAcl", ["WRITE"], Scope::All),
        ];

        let scope = effective_scope(&grants, "dataModelsAcl", &actions(&["READ", "WRITE"]));
        assert_eq!(scope, Some(Scope::spaces(["a", "b"])));

        let read_only = effective_scope(&grants, "dataModelsAcl", &actions(&["READ"]));
        assert_eq!(read_only, Some(Scope::spaces(["a", "b", "c"])));
    }

    #[test]
    fn test_effective_scope_missing_action_is_none() {
        let grants = vec![Capability::new("groupsAcl", ["READ"], Scope::All)];
        assert_eq!(
            effective_scope(&grants, "groupsAcl", &actions(&["READ", "DELETE"])),
            None
        );
    }

    #[test]
    fn test_all_scope_covers_everything() {
        let grants = vec![Capability::new("spacesAcl", ["READ", "WRITE"], Scope::All)];
        let required = vec![RequiredCapability::new(
            "spacesAcl",
            ["WRITE"],
            Scope::spaces(["x"]),
        )];
        assert!(missing_capabilities(&grants, &required).is_empty());
        assert!(verify_access("spaces", &grants, &required).is_ok());
    }

    #[test]
    fn test_verify_access_names_missing_capability() {
        let grants = vec![Capability::new(
            "dataModelsAcl",
            ["READ", "WRITE"],
            Scope::spaces(["a"]),
        )];
        let required = vec![RequiredCapability::new(
            "dataModelsAcl",
            ["WRITE", "READ"],
            Scope::spaces(["a", "b"]),
        )];

        let err = verify_access("views", &grants, &required).unwrap_err();
        assert_eq!(
            err.to_string(),
            "access denied for views: missing dataModelsAcl:READ+WRITE on space[a, b] \
             (granted only space[a])"
        );
    }

    #[test]
    fn test_merge_requirements() {
        let merged = merge_requirements(vec![
            RequiredCapability::new("dataModelsAcl", ["WRITE"], Scope::spaces(["a"])),
            RequiredCapability::new("dataModelsAcl", ["WRITE"], Scope::spaces(["b"])),
            RequiredCapability::new("dataModelsAcl", ["WRITE"], Scope::data_sets([1])),
            RequiredCapability::new("dataModelsAcl", ["READ"], Scope::spaces(["a"])),
        ]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].scope, Scope::spaces(["a", "b"]));
        assert_eq!(merged[1].scope, Scope::data_sets([1]));
    }
}
