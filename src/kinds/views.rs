use super::{actions, canonical_write, required};
use crate::store::{FileStore, SERVER_FIELDS, Stored};
use anyhow::{Result, bail};
use reconcile::{
    Classification, Dependency, MissingIdentifier, RequiredCapability, ResourceKind, RunContext,
    Scope, normalize,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// `space:externalId:version`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId {
    pub space: String,
    pub external_id: String,
    pub version: String,
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.space, self.external_id, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ViewReference {
    pub space: String,
    pub external_id: String,
    pub version: String,
}

impl ViewReference {
    fn id(&self) -> ViewId {
        ViewId {
            space: self.space.clone(),
            external_id: self.external_id.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerReference {
    pub space: String,
    pub external_id: String,
}

impl ContainerReference {
    fn key(&self) -> String {
        format!("{}:{}", self.space, self.external_id)
    }
}

/// A view property mapped onto a container property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MappedProperty {
    pub container: ContainerReference,
    pub container_property_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ViewWrite {
    pub space: String,
    pub external_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implements: Vec<ViewReference>,
    #[serde(default)]
    pub properties: BTreeMap<String, MappedProperty>,
}

impl ViewWrite {
    fn id(&self) -> Result<ViewId, MissingIdentifier> {
        Ok(ViewId {
            space: required(&self.space, "space")?,
            external_id: required(&self.external_id, "externalId")?,
            version: required(&self.version, "version")?,
        })
    }

    fn containers(&self) -> BTreeSet<&ContainerReference> {
        self.properties.values().map(|p| &p.container).collect()
    }
}

/// Views are immutable once created: a changed view is deleted and created
/// again, and views implementing other views are deleted first.
pub struct Views {
    store: Arc<FileStore>,
}

impl Views {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    fn keyed<'a>(&self, items: &'a [ViewWrite]) -> Vec<(String, &'a ViewWrite)> {
        items
            .iter()
            .map(|item| {
                let key = format!("{}:{}:{}", item.space, item.external_id, item.version);
                (key, item)
            })
            .collect()
    }

    /// Fail when a mapped container does not exist
    fn check_containers(&self, ctx: &RunContext, items: &[ViewWrite]) -> Result<()> {
        for item in items {
            for container in item.containers() {
                let key = container.key();
                ctx.cache().get_or_try_insert_with("container", &key, || {
                    if self.store.contains("containers", &key) {
                        Ok("present".to_string())
                    } else {
                        bail!(
                            "view {}:{} maps unknown container {key}",
                            item.space,
                            item.external_id
                        )
                    }
                })?;
            }
        }
        Ok(())
    }
}

impl ResourceKind for Views {
    type Id = ViewId;
    type Write = ViewWrite;
    type Read = Stored<ViewWrite>;

    fn kind(&self) -> &'static str {
        "views"
    }

    fn folder(&self) -> &'static str {
        "data_models"
    }

    fn depends_on_kinds(&self) -> &'static [&'static str] {
        &["spaces", "containers"]
    }

    fn classify(&self, raw: &Value) -> Classification {
        if raw.get("version").is_some() {
            Classification::Matched
        } else {
            Classification::NotApplicable
        }
    }

    fn write_id(&self, item: &ViewWrite) -> Result<ViewId, MissingIdentifier> {
        item.id()
    }

    fn read_id(&self, item: &Stored<ViewWrite>) -> Result<ViewId, MissingIdentifier> {
        item.item.id()
    }

    fn server_fields(&self) -> &'static [&'static str] {
        SERVER_FIELDS
    }

    fn normalize(&self, item: &Stored<ViewWrite>) -> Value {
        normalize::canonical_of(&item.item, SERVER_FIELDS)
    }

    fn normalize_local(&self, raw: &Value) -> Value {
        canonical_write::<ViewWrite>(raw, SERVER_FIELDS)
    }

    fn dependencies(&self, item: &ViewWrite) -> Vec<Dependency<ViewId>> {
        let mut deps = vec![Dependency::other("spaces", &item.space)];
        deps.extend(
            item.containers()
                .into_iter()
                .map(|container| Dependency::other("containers", container.key())),
        );
        deps.extend(
            item.implements
                .iter()
                .map(|parent| Dependency::SameKind(parent.id())),
        );
        deps
    }

    fn read_dependencies(&self, item: &Stored<ViewWrite>) -> Vec<Dependency<ViewId>> {
        item.item
            .implements
            .iter()
            .map(|parent| Dependency::SameKind(parent.id()))
            .collect()
    }

    fn supports_partial_update(&self) -> bool {
        false
    }

    fn strict_delete_order(&self) -> bool {
        true
    }

    fn required_capabilities(
        &self,
        items: &[ViewWrite],
        read_only: bool,
    ) -> Vec<RequiredCapability> {
        vec![RequiredCapability::new(
            "dataModelsAcl",
            actions(read_only).iter().copied(),
            Scope::spaces(items.iter().map(|item| item.space.clone())),
        )]
    }

    fn retrieve(&self, _ctx: &RunContext, ids: &[ViewId]) -> Result<Vec<Self::Read>> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.store.retrieve(self.kind(), &keys)
    }

    fn list(&self, _ctx: &RunContext) -> Result<Vec<Self::Read>> {
        self.store.list(self.kind())
    }

    fn create(&self, ctx: &RunContext, items: &[ViewWrite]) -> Result<Vec<Self::Read>> {
        self.check_containers(ctx, items)?;
        self.store.create(self.kind(), &self.keyed(items))
    }

    fn delete(&self, _ctx: &RunContext, ids: &[ViewId]) -> Result<usize> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.store.delete(self.kind(), &keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn views() -> (TempDir, Arc<FileStore>, Views) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(&temp.path().join("store.json")).unwrap());
        let kind = Views::new(Arc::clone(&store));
        (temp, store, kind)
    }

    fn pump_view() -> ViewWrite {
        serde_json::from_value(json!({
            "space": "sp",
            "externalId": "Pump",
            "version": "v1",
            "implements": [{"space": "sp", "externalId": "Asset", "version": "v1"}],
            "properties": {
                "pressure": {
                    "container": {"space": "sp", "externalId": "pump"},
                    "containerPropertyIdentifier": "pressure"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_dependencies_cover_space_containers_and_parents() {
        let (_temp, _store, kind) = views();
        let deps = kind.dependencies(&pump_view());

        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&Dependency::other("spaces", "sp")));
        assert!(deps.contains(&Dependency::other("containers", "sp:pump")));
        assert!(deps.contains(&Dependency::SameKind(ViewId {
            space: "sp".to_string(),
            external_id: "Asset".to_string(),
            version: "v1".to_string(),
        })));
    }

    #[test]
    fn test_stored_views_report_their_parents() {
        let (_temp, store, kind) = views();
        let container = json!({"space": "sp", "externalId": "pump"});
        store
            .create("containers", &[("sp:pump".to_string(), &container)])
            .unwrap();
        let ctx = RunContext::new("views", false);
        let created = kind.create(&ctx, &[pump_view()]).unwrap();

        let parent = ViewId {
            space: "sp".to_string(),
            external_id: "Asset".to_string(),
            version: "v1".to_string(),
        };
        assert_eq!(
            kind.read_dependencies(&created[0]),
            vec![Dependency::SameKind(parent)]
        );
    }

    #[test]
    fn test_create_requires_mapped_containers() {
        let (_temp, store, kind) = views();
        let ctx = RunContext::new("views", false);
        assert!(kind.create(&ctx, &[pump_view()]).is_err());
        assert!(ctx.cache().is_empty());

        let container = json!({"space": "sp", "externalId": "pump"});
        store
            .create("containers", &[("sp:pump".to_string(), &container)])
            .unwrap();
        let created = kind.create(&ctx, &[pump_view()]).unwrap();
        assert_eq!(kind.read_id(&created[0]).unwrap().to_string(), "sp:Pump:v1");
        assert_eq!(ctx.cache().get("container", "sp:pump").as_deref(), Some("present"));
    }

    #[test]
    fn test_views_are_replaced_not_updated() {
        let (_temp, _store, kind) = views();
        let ctx = RunContext::new("views", false);
        assert!(!kind.supports_partial_update());
        assert!(kind.strict_delete_order());
        assert!(kind.update(&ctx, &[pump_view()]).is_err());
    }

    #[test]
    fn test_only_versioned_mappings_are_views() {
        let (_temp, _store, kind) = views();
        assert_eq!(
            kind.classify(&json!({"space": "sp", "externalId": "Pump", "version": "v1"})),
            Classification::Matched
        );
        assert_eq!(
            kind.classify(&json!({"space": "sp", "externalId": "pump"})),
            Classification::NotApplicable
        );
    }
}
