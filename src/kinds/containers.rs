use super::{actions, canonical_write, required};
use crate::store::{FileStore, SERVER_FIELDS, Stored};
use anyhow::Result;
use reconcile::{
    Classification, Dependency, MissingIdentifier, RequiredCapability, ResourceKind, RunContext,
    Scope, normalize,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// `space:externalId`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId {
    pub space: String,
    pub external_id: String,
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.external_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerProperty {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerWrite {
    pub space: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, ContainerProperty>,
}

impl ContainerWrite {
    fn id(&self) -> Result<ContainerId, MissingIdentifier> {
        Ok(ContainerId {
            space: required(&self.space, "space")?,
            external_id: required(&self.external_id, "externalId")?,
        })
    }
}

pub struct Containers {
    store: Arc<FileStore>,
}

impl Containers {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    fn keyed<'a>(&self, items: &'a [ContainerWrite]) -> Vec<(String, &'a ContainerWrite)> {
        items
            .iter()
            .map(|item| (format!("{}:{}", item.space, item.external_id), item))
            .collect()
    }
}

impl ResourceKind for Containers {
    type Id = ContainerId;
    type Write = ContainerWrite;
    type Read = Stored<ContainerWrite>;

    fn kind(&self) -> &'static str {
        "containers"
    }

    fn folder(&self) -> &'static str {
        "data_models"
    }

    fn depends_on_kinds(&self) -> &'static [&'static str] {
        &["spaces"]
    }

    fn classify(&self, raw: &Value) -> Classification {
        if raw.get("externalId").is_some() && raw.get("version").is_none() {
            Classification::Matched
        } else {
            Classification::NotApplicable
        }
    }

    fn write_id(&self, item: &ContainerWrite) -> Result<ContainerId, MissingIdentifier> {
        item.id()
    }

    fn read_id(&self, item: &Stored<ContainerWrite>) -> Result<ContainerId, MissingIdentifier> {
        item.item.id()
    }

    fn server_fields(&self) -> &'static [&'static str] {
        SERVER_FIELDS
    }

    fn normalize(&self, item: &Stored<ContainerWrite>) -> Value {
        normalize::canonical_of(&item.item, SERVER_FIELDS)
    }

    fn normalize_local(&self, raw: &Value) -> Value {
        canonical_write::<ContainerWrite>(raw, SERVER_FIELDS)
    }

    fn dependencies(&self, item: &ContainerWrite) -> Vec<Dependency<ContainerId>> {
        vec![Dependency::other("spaces", &item.space)]
    }

    fn required_capabilities(
        &self,
        items: &[ContainerWrite],
        read_only: bool,
    ) -> Vec<RequiredCapability> {
        vec![RequiredCapability::new(
            "dataModelsAcl",
            actions(read_only).iter().copied(),
            Scope::spaces(items.iter().map(|item| item.space.clone())),
        )]
    }

    fn retrieve(&self, _ctx: &RunContext, ids: &[ContainerId]) -> Result<Vec<Self::Read>> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.store.retrieve(self.kind(), &keys)
    }

    fn list(&self, _ctx: &RunContext) -> Result<Vec<Self::Read>> {
        self.store.list(self.kind())
    }

    fn create(&self, _ctx: &RunContext, items: &[ContainerWrite]) -> Result<Vec<Self::Read>> {
        self.store.create(self.kind(), &self.keyed(items))
    }

    fn update(&self, _ctx: &RunContext, items: &[ContainerWrite]) -> Result<Vec<Self::Read>> {
        self.store.update(self.kind(), &self.keyed(items))
    }

    fn delete(&self, _ctx: &RunContext, ids: &[ContainerId]) -> Result<usize> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.store.delete(self.kind(), &keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn containers() -> (TempDir, Containers) {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(&temp.path().join("store.json")).unwrap();
        (temp, Containers::new(Arc::new(store)))
    }

    #[test]
    fn test_identifier_joins_space_and_external_id() {
        let (_temp, kind) = containers();
        let item: ContainerWrite =
            serde_json::from_value(json!({"space": "sp", "externalId": "pump"})).unwrap();
        assert_eq!(kind.write_id(&item).unwrap().to_string(), "sp:pump");
        assert_eq!(
            kind.dependencies(&item),
            vec![Dependency::Other {
                kind: "spaces".to_string(),
                id: "sp".to_string()
            }]
        );
    }

    #[test]
    fn test_defaults_do_not_count_as_changes() {
        let (_temp, kind) = containers();
        let ctx = RunContext::new("containers", false);
        let raw = json!({
            "space": "sp",
            "externalId": "pump",
            "properties": {"pressure": {"type": "float64"}}
        });
        let item: ContainerWrite = serde_json::from_value(raw.clone()).unwrap();
        let stored = kind.create(&ctx, &[item]).unwrap();

        assert_eq!(kind.normalize_local(&raw), kind.normalize(&stored[0]));
        assert_eq!(kind.normalize(&stored[0])["properties"]["pressure"]["nullable"], json!(true));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed = serde_json::from_value::<ContainerWrite>(
            json!({"space": "sp", "externalId": "pump", "colour": "red"}),
        );
        assert!(parsed.is_err());
    }
}
