//! Resource kind trait for reconciliation
//!
//! A resource kind tells the generic engine how to identify, compare and
//! order its declarations, and how to read and write them in the remote
//! store. The engine never looks at kind-specific business fields.

use crate::access::RequiredCapability;
use crate::context::RunContext;
use crate::error::MissingIdentifier;
use crate::normalize;
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::hash::Hash;

/// A reference from one declaration to another resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency<I> {
    /// Another resource of the same kind
    SameKind(I),
    /// A resource of a different kind, by its rendered identifier
    Other { kind: String, id: String },
}

impl<I> Dependency<I> {
    pub fn other(kind: impl Into<String>, id: impl fmt::Display) -> Self {
        Self::Other {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// Whether a kind handles a raw declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched,
    NotApplicable,
}

/// A locally declared resource: its canonical raw mapping, used for
/// comparison, and its parsed write model, used for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDeclaration<W> {
    pub raw: Value,
    pub item: W,
}

impl<W> LocalDeclaration<W> {
    /// Pair a raw mapping with its parsed model; `raw` must already be
    /// canonical (see [`ResourceKind::normalize_local`]).
    pub fn new(raw: Value, item: W) -> Self {
        Self { raw, item }
    }
}

/// Core trait for a reconcilable resource kind
///
/// Identity, comparison and ordering are pure; the remote operations take
/// a [`RunContext`] that lives for one run.
///
/// # Example
///
/// ```ignore
/// impl ResourceKind for Spaces {
///     type Id = String;
///     type Write = SpaceWrite;
///     type Read = SpaceRead;
///
///     fn kind(&self) -> &'static str { "spaces" }
///
///     fn write_id(&self, item: &SpaceWrite) -> Result<String, MissingIdentifier> {
///         non_empty(&item.space, "space")
///     }
///     // ...
/// }
/// ```
pub trait ResourceKind: Send + Sync {
    /// Identifier, unique within the kind
    type Id: Clone + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync;
    /// Model sent to the remote store
    type Write: Clone + fmt::Debug + Send + Sync;
    /// Model returned by the remote store
    type Read: fmt::Debug + Send + Sync;

    /// Kind name, e.g. "views"
    fn kind(&self) -> &'static str;

    /// Directory declarations of this kind live in
    fn folder(&self) -> &'static str {
        self.kind()
    }

    /// Kinds that must be deployed before this one
    fn depends_on_kinds(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether a raw declaration in this kind's folder belongs to this kind
    ///
    /// Override when several kinds share one folder.
    fn classify(&self, _raw: &Value) -> Classification {
        Classification::Matched
    }

    /// Identifier of a local declaration
    fn write_id(&self, item: &Self::Write) -> Result<Self::Id, MissingIdentifier>;

    /// Identifier of a remote resource
    fn read_id(&self, item: &Self::Read) -> Result<Self::Id, MissingIdentifier>;

    /// Server-assigned fields left out of comparisons
    fn server_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Fields masked in verbose diffs
    fn sensitive_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Canonical comparable form of a remote resource.
    ///
    /// Must be deterministic and must leave out [`Self::server_fields`].
    fn normalize(&self, item: &Self::Read) -> Value;

    /// Canonical comparable form of a raw local mapping
    fn normalize_local(&self, raw: &Value) -> Value {
        normalize::canonical(raw, self.server_fields())
    }

    /// Resources a declaration refers to; absent references yield nothing
    fn dependencies(&self, _item: &Self::Write) -> Vec<Dependency<Self::Id>> {
        Vec::new()
    }

    /// Resources an existing remote resource refers to.
    ///
    /// Orders deletes of resources that have no local declaration.
    fn read_dependencies(&self, _item: &Self::Read) -> Vec<Dependency<Self::Id>> {
        Vec::new()
    }

    /// Changed items are updated in place when true, replaced otherwise
    fn supports_partial_update(&self) -> bool {
        true
    }

    /// Delete dependents before their dependencies
    fn strict_delete_order(&self) -> bool {
        false
    }

    /// Capabilities needed to deploy `items` (or only read them)
    fn required_capabilities(
        &self,
        _items: &[Self::Write],
        _read_only: bool,
    ) -> Vec<RequiredCapability> {
        Vec::new()
    }

    /// Fetch the resources that exist among `ids`; unknown ids are ignored
    fn retrieve(&self, ctx: &RunContext, ids: &[Self::Id]) -> Result<Vec<Self::Read>>;

    /// Fetch every resource of this kind
    fn list(&self, _ctx: &RunContext) -> Result<Vec<Self::Read>> {
        anyhow::bail!("{} does not support listing", self.kind())
    }

    fn create(&self, ctx: &RunContext, items: &[Self::Write]) -> Result<Vec<Self::Read>>;

    fn update(&self, _ctx: &RunContext, _items: &[Self::Write]) -> Result<Vec<Self::Read>> {
        anyhow::bail!("{} does not support in-place update", self.kind())
    }

    /// Delete `ids`, returning how many were deleted
    fn delete(&self, ctx: &RunContext, ids: &[Self::Id]) -> Result<usize>;
}

/// Same-kind dependencies of a declaration
pub fn same_kind_dependencies<K: ResourceKind>(kind: &K, item: &K::Write) -> Vec<K::Id> {
    same_kind(kind.dependencies(item))
}

/// Same-kind dependencies of a remote resource
pub fn same_kind_read_dependencies<K: ResourceKind>(kind: &K, item: &K::Read) -> Vec<K::Id> {
    same_kind(kind.read_dependencies(item))
}

fn same_kind<I>(deps: Vec<Dependency<I>>) -> Vec<I> {
    deps.into_iter()
        .filter_map(|dep| match dep {
            Dependency::SameKind(id) => Some(id),
            Dependency::Other { .. } => None,
        })
        .collect()
}
