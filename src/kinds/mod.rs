//! Built-in resource kinds backed by the file store

mod containers;
mod groups;
mod spaces;
mod views;

pub use containers::Containers;
pub use groups::Groups;
pub use spaces::Spaces;
pub use views::Views;

use crate::store::FileStore;
use anyhow::Result;
use reconcile::{KindRegistry, MissingIdentifier, normalize};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Registry with every built-in kind
pub fn registry(store: &Arc<FileStore>) -> Result<KindRegistry> {
    let mut registry = KindRegistry::new();
    registry.register(Spaces::new(Arc::clone(store)))?;
    registry.register(Containers::new(Arc::clone(store)))?;
    registry.register(Views::new(Arc::clone(store)))?;
    registry.register(Groups::all_scoped(Arc::clone(store)))?;
    registry.register(Groups::resource_scoped(Arc::clone(store)))?;
    Ok(registry)
}

/// Canonical form of a raw mapping as the kind's write model sees it.
///
/// Going through the model fills in defaults the same way the stored
/// form does; a mapping that does not parse falls back to the raw form.
fn canonical_write<W>(raw: &Value, omit: &[&str]) -> Value
where
    W: Serialize + DeserializeOwned,
{
    match serde_json::from_value::<W>(raw.clone()) {
        Ok(item) => normalize::canonical_of(&item, omit),
        Err(_) => normalize::canonical(raw, omit),
    }
}

fn required(value: &str, field: &str) -> Result<String, MissingIdentifier> {
    if value.trim().is_empty() {
        Err(MissingIdentifier::new(format!("{field} is required")))
    } else {
        Ok(value.to_string())
    }
}

/// Actions a batch needs on an ACL
fn actions(read_only: bool) -> &'static [&'static str] {
    if read_only { &["READ"] } else { &["READ", "WRITE"] }
}
