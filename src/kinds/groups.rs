use super::{canonical_write, required};
use crate::store::{FileStore, SERVER_FIELDS, Stored};
use anyhow::Result;
use reconcile::{
    Capability, Classification, Dependency, MissingIdentifier, RequiredCapability, ResourceKind,
    RunContext, Scope, normalize,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupWrite {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<BTreeSet<String>>,
}

impl GroupWrite {
    fn is_all_scoped(&self) -> bool {
        self.capabilities.iter().all(|cap| cap.scope.is_all())
    }

    fn spaces(&self) -> BTreeSet<&str> {
        self.capabilities
            .iter()
            .filter_map(|cap| match &cap.scope {
                Scope::Space(spaces) => Some(spaces),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Access groups, split in two kinds sharing the `auth` folder.
///
/// Groups whose capabilities are all unscoped deploy first. Groups scoped
/// to spaces must wait for those spaces to exist.
pub struct Groups {
    store: Arc<FileStore>,
    resource_scoped: bool,
}

impl Groups {
    pub fn all_scoped(store: Arc<FileStore>) -> Self {
        Self {
            store,
            resource_scoped: false,
        }
    }

    pub fn resource_scoped(store: Arc<FileStore>) -> Self {
        Self {
            store,
            resource_scoped: true,
        }
    }

    fn keyed<'a>(&self, items: &'a [GroupWrite]) -> Vec<(String, &'a GroupWrite)> {
        items.iter().map(|item| (item.name.clone(), item)).collect()
    }
}

impl ResourceKind for Groups {
    type Id = String;
    type Write = GroupWrite;
    type Read = Stored<GroupWrite>;

    fn kind(&self) -> &'static str {
        if self.resource_scoped { "groups_resource_scoped" } else { "groups" }
    }

    fn folder(&self) -> &'static str {
        "auth"
    }

    fn depends_on_kinds(&self) -> &'static [&'static str] {
        if self.resource_scoped { &["spaces"] } else { &[] }
    }

    fn classify(&self, raw: &Value) -> Classification {
        let all_scoped = match serde_json::from_value::<GroupWrite>(raw.clone()) {
            Ok(group) => group.is_all_scoped(),
            // Unparseable groups go to the unscoped kind, which reports them
            Err(_) => true,
        };
        if all_scoped == self.resource_scoped {
            Classification::NotApplicable
        } else {
            Classification::Matched
        }
    }

    fn write_id(&self, item: &GroupWrite) -> Result<String, MissingIdentifier> {
        required(&item.name, "name")
    }

    fn read_id(&self, item: &Stored<GroupWrite>) -> Result<String, MissingIdentifier> {
        required(&item.item.name, "name")
    }

    fn server_fields(&self) -> &'static [&'static str] {
        SERVER_FIELDS
    }

    fn sensitive_fields(&self) -> &'static [&'static str] {
        &["sourceId"]
    }

    fn normalize(&self, item: &Stored<GroupWrite>) -> Value {
        normalize::canonical_of(&item.item, SERVER_FIELDS)
    }

    fn normalize_local(&self, raw: &Value) -> Value {
        canonical_write::<GroupWrite>(raw, SERVER_FIELDS)
    }

    fn dependencies(&self, item: &GroupWrite) -> Vec<Dependency<String>> {
        item.spaces()
            .into_iter()
            .map(|space| Dependency::other("spaces", space))
            .collect()
    }

    fn required_capabilities(
        &self,
        _items: &[GroupWrite],
        read_only: bool,
    ) -> Vec<RequiredCapability> {
        let actions = if read_only {
            &["LIST"][..]
        } else {
            &["LIST", "CREATE", "DELETE"][..]
        };
        vec![RequiredCapability::new("groupsAcl", actions.iter().copied(), Scope::All)]
    }

    fn retrieve(&self, _ctx: &RunContext, ids: &[String]) -> Result<Vec<Self::Read>> {
        self.store.retrieve(self.kind(), ids)
    }

    fn list(&self, _ctx: &RunContext) -> Result<Vec<Self::Read>> {
        self.store.list(self.kind())
    }

    fn create(&self, _ctx: &RunContext, items: &[GroupWrite]) -> Result<Vec<Self::Read>> {
        self.store.create(self.kind(), &self.keyed(items))
    }

    fn update(&self, _ctx: &RunContext, items: &[GroupWrite]) -> Result<Vec<Self::Read>> {
        self.store.update(self.kind(), &self.keyed(items))
    }

    fn delete(&self, _ctx: &RunContext, ids: &[String]) -> Result<usize> {
        self.store.delete(self.kind(), ids)
    }
}
