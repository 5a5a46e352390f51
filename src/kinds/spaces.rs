use super::{actions, canonical_write, required};
use crate::store::{FileStore, SERVER_FIELDS, Stored};
use anyhow::Result;
use reconcile::{MissingIdentifier, RequiredCapability, ResourceKind, RunContext, Scope, normalize};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};

static SPACE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,41}[a-zA-Z0-9]?$").expect("Invalid space id regex")
});

/// Space names reserved by the store
const RESERVED: &[&str] = &["space", "cdf", "dms", "pg3", "shared", "system", "node", "edge"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpaceWrite {
    pub space: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub struct Spaces {
    store: Arc<FileStore>,
}

impl Spaces {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    fn keyed<'a>(&self, items: &'a [SpaceWrite]) -> Vec<(String, &'a SpaceWrite)> {
        items.iter().map(|item| (item.space.clone(), item)).collect()
    }
}

fn space_id(space: &str) -> Result<String, MissingIdentifier> {
    let id = required(space, "space")?;
    if !SPACE_ID.is_match(&id) || RESERVED.contains(&id.as_str()) {
        return Err(MissingIdentifier::new(format!("{id:?} is not a valid space identifier")));
    }
    Ok(id)
}

impl ResourceKind for Spaces {
    type Id = String;
    type Write = SpaceWrite;
    type Read = Stored<SpaceWrite>;

    fn kind(&self) -> &'static str {
        "spaces"
    }

    fn folder(&self) -> &'static str {
        "data_models"
    }

    fn classify(&self, raw: &Value) -> reconcile::Classification {
        // Spaces share their folder with containers and views
        if raw.get("space").is_some() && raw.get("externalId").is_none() {
            reconcile::Classification::Matched
        } else {
            reconcile::Classification::NotApplicable
        }
    }

    fn write_id(&self, item: &SpaceWrite) -> Result<String, MissingIdentifier> {
        space_id(&item.space)
    }

    fn read_id(&self, item: &Stored<SpaceWrite>) -> Result<String, MissingIdentifier> {
        required(&item.item.space, "space")
    }

    fn server_fields(&self) -> &'static [&'static str] {
        SERVER_FIELDS
    }

    fn normalize(&self, item: &Stored<SpaceWrite>) -> Value {
        normalize::canonical_of(&item.item, SERVER_FIELDS)
    }

    fn normalize_local(&self, raw: &Value) -> Value {
        canonical_write::<SpaceWrite>(raw, SERVER_FIELDS)
    }

    fn required_capabilities(
        &self,
        items: &[SpaceWrite],
        read_only: bool,
    ) -> Vec<RequiredCapability> {
        vec![RequiredCapability::new(
            "dataModelsAcl",
            actions(read_only).iter().copied(),
            Scope::spaces(items.iter().map(|item| item.space.clone())),
        )]
    }

    fn retrieve(&self, _ctx: &RunContext, ids: &[String]) -> Result<Vec<Stored<SpaceWrite>>> {
        self.store.retrieve(self.kind(), ids)
    }

    fn list(&self, _ctx: &RunContext) -> Result<Vec<Stored<SpaceWrite>>> {
        self.store.list(self.kind())
    }

    fn create(&self, _ctx: &RunContext, items: &[SpaceWrite]) -> Result<Vec<Stored<SpaceWrite>>> {
        self.store.create(self.kind(), &self.keyed(items))
    }

    fn update(&self, _ctx: &RunContext, items: &[SpaceWrite]) -> Result<Vec<Stored<SpaceWrite>>> {
        self.store.update(self.kind(), &self.keyed(items))
    }

    fn delete(&self, _ctx: &RunContext, ids: &[String]) -> Result<usize> {
        self.store.delete(self.kind(), ids)
    }
}
