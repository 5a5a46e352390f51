//! Scope algebra
//!
//! A [`Scope`] describes which resources a permission grant covers. The
//! free functions [`union`] and [`intersection`] merge two optional scopes
//! (`None` standing for "no grant at all"). Both are commutative and
//! associative over operands of the same concrete type; operands of
//! different concrete types cannot be expressed as one grant and merge to
//! `None`.
//!
//! Table scopes map a database name to a set of table names, where an
//! empty set means every table in that database.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Access grant scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    /// Universal grant, absorbing under union
    All,
    /// Only resources owned by the calling principal
    CurrentUser,
    DataSet(BTreeSet<i64>),
    Id(BTreeSet<i64>),
    Space(BTreeSet<String>),
    ExtractionPipeline(BTreeSet<i64>),
    Partition(BTreeSet<i64>),
    /// Database name to table names; an empty table set covers the whole database
    Table(BTreeMap<String, BTreeSet<String>>),
}

impl Scope {
    pub fn data_sets(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::DataSet(ids.into_iter().collect())
    }

    pub fn spaces<S: Into<String>>(spaces: impl IntoIterator<Item = S>) -> Self {
        Self::Space(spaces.into_iter().map(Into::into).collect())
    }

    pub fn tables<D, T, I>(dbs: impl IntoIterator<Item = (D, I)>) -> Self
    where
        D: Into<String>,
        T: Into<String>,
        I: IntoIterator<Item = T>,
    {
        Self::Table(
            dbs.into_iter()
                .map(|(db, tables)| (db.into(), tables.into_iter().map(Into::into).collect()))
                .collect(),
        )
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Name of the concrete scope type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::CurrentUser => "currentUser",
            Self::DataSet(_) => "dataSet",
            Self::Id(_) => "id",
            Self::Space(_) => "space",
            Self::ExtractionPipeline(_) => "extractionPipeline",
            Self::Partition(_) => "partition",
            Self::Table(_) => "table",
        }
    }

    /// Whether a grant with this scope permits everything `required` asks for
    pub fn covers(&self, required: &Scope) -> bool {
        intersection(Some(self), Some(required)).as_ref() == Some(required)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(items: &BTreeSet<T>) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }

        match self {
            Self::All | Self::CurrentUser => f.write_str(self.type_name()),
            Self::DataSet(ids)
            | Self::Id(ids)
            | Self::ExtractionPipeline(ids)
            | Self::Partition(ids) => write!(f, "{}[{}]", self.type_name(), list(ids)),
            Self::Space(spaces) => write!(f, "space[{}]", list(spaces)),
            Self::Table(dbs) => {
                let parts: Vec<String> = dbs
                    .iter()
                    .map(|(db, tables)| {
                        if tables.is_empty() {
                            format!("{db}.*")
                        } else {
                            format!("{db}.{{{}}}", list(tables))
                        }
                    })
                    .collect();
                write!(f, "table[{}]", parts.join(", "))
            }
        }
    }
}

/// Union of two optional scopes.
///
/// `All` absorbs everything, `None` is the identity, same-type collections
/// merge element-wise, and incompatible types yield `None`.
pub fn union(a: Option<&Scope>, b: Option<&Scope>) -> Option<Scope> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(Scope::All), _) | (_, Some(Scope::All)) => Some(Scope::All),
        (Some(x), Some(y)) => union_same_type(x, y),
    }
}

/// Intersection of two optional scopes.
///
/// `None` absorbs everything, `All` is the identity, same-type collections
/// intersect element-wise, and an empty result or incompatible types yield
/// `None`.
pub fn intersection(a: Option<&Scope>, b: Option<&Scope>) -> Option<Scope> {
    match (a, b) {
        (None, _) | (_, None) => None,
        (Some(Scope::All), Some(other)) | (Some(other), Some(Scope::All)) => Some(other.clone()),
        (Some(x), Some(y)) => intersect_same_type(x, y),
    }
}

/// Union of any number of scopes; `None` for an empty input.
pub fn union_all<'a>(scopes: impl IntoIterator<Item = &'a Scope>) -> Option<Scope> {
    let mut iter = scopes.into_iter();
    let first = iter.next()?.clone();
    iter.try_fold(first, |acc, next| union(Some(&acc), Some(next)))
}

/// Left fold of [`intersection`] that stops at the first empty result.
pub fn intersection_all<'a>(scopes: impl IntoIterator<Item = Option<&'a Scope>>) -> Option<Scope> {
    let mut iter = scopes.into_iter();
    let first = iter.next()??.clone();
    iter.try_fold(first, |acc, next| intersection(Some(&acc), next))
}

fn union_same_type(a: &Scope, b: &Scope) -> Option<Scope> {
    use Scope::*;

    match (a, b) {
        (CurrentUser, CurrentUser) => Some(CurrentUser),
        (DataSet(x), DataSet(y)) => Some(DataSet(x | y)),
        (Id(x), Id(y)) => Some(Id(x | y)),
        (Space(x), Space(y)) => Some(Space(x | y)),
        (ExtractionPipeline(x), ExtractionPipeline(y)) => Some(ExtractionPipeline(x | y)),
        (Partition(x), Partition(y)) => Some(Partition(x | y)),
        (Table(x), Table(y)) => {
            let mut merged = x.clone();
            for (db, tables) in y {
                merged
                    .entry(db.clone())
                    .and_modify(|existing| {
                        if existing.is_empty() || tables.is_empty() {
                            existing.clear();
                        } else {
                            existing.extend(tables.iter().cloned());
                        }
                    })
                    .or_insert_with(|| tables.clone());
            }
            Some(Table(merged))
        }
        _ => None,
    }
}

fn intersect_same_type(a: &Scope, b: &Scope) -> Option<Scope> {
    use Scope::*;

    fn non_empty<T: Ord>(set: BTreeSet<T>, wrap: fn(BTreeSet<T>) -> Scope) -> Option<Scope> {
        (!set.is_empty()).then(|| wrap(set))
    }

    match (a, b) {
        (CurrentUser, CurrentUser) => Some(CurrentUser),
        (DataSet(x), DataSet(y)) => non_empty(x & y, DataSet),
        (Id(x), Id(y)) => non_empty(x & y, Id),
        (Space(x), Space(y)) => non_empty(x & y, Space),
        (ExtractionPipeline(x), ExtractionPipeline(y)) => non_empty(x & y, ExtractionPipeline),
        (Partition(x), Partition(y)) => non_empty(x & y, Partition),
        (Table(x), Table(y)) => {
            let mut out = BTreeMap::new();
            for (db, left) in x {
                let Some(right) = y.get(db) else {
                    continue;
                };
                let tables = match (left.is_empty(), right.is_empty()) {
                    (true, _) => right.clone(),
                    (_, true) => left.clone(),
                    _ => {
                        let common: BTreeSet<String> = left & right;
                        if common.is_empty() {
                            continue;
                        }
                        common
                    }
                };
                out.insert(db.clone(), tables);
            }
            (!out.is_empty()).then_some(Table(out))
        }
        _ => None,
    }
}
