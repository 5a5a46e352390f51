//! JSON-file-backed remote store for the built-in kinds
//!
//! Resources live under `resources.<kind>.<id>` and carry server-assigned
//! `createdTime`/`lastUpdatedTime` stamps in milliseconds. The optional
//! `principal` section lists the grants of the deploying principal; when
//! it is absent the principal is unrestricted.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use reconcile::{Capability, GrantProvider};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const CREATED: &str = "createdTime";
const UPDATED: &str = "lastUpdatedTime";

/// Server-assigned fields every stored resource carries
pub const SERVER_FIELDS: &[&str] = &[CREATED, UPDATED];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    principal: Option<Vec<Capability>>,
    #[serde(default)]
    resources: BTreeMap<String, BTreeMap<String, Value>>,
}

/// A stored resource: the written model plus server stamps
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<W> {
    pub item: W,
    pub created_time: i64,
    pub last_updated_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Update,
}

pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Open a store file; a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid store file {}", path.display()))?
        } else {
            log::debug!("store {} does not exist yet", path.display());
            StoreData::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to a copy of the data, keeping it only once it is on disk
    fn commit<T>(&self, change: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.lock();
        let mut next = data.clone();
        let result = change(&mut next)?;
        self.persist(&next)?;
        *data = next;
        Ok(result)
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Could not write {}", self.path.display()))
    }

    /// Stored resources among `ids`, in request order; unknown ids are skipped
    pub fn retrieve<W: DeserializeOwned>(
        &self,
        kind: &str,
        ids: &[String],
    ) -> Result<Vec<Stored<W>>> {
        let data = self.lock();
        let Some(table) = data.resources.get(kind) else {
            return Ok(Vec::new());
        };
        ids.iter()
            .filter_map(|id| table.get(id))
            .map(|value| split(value.clone()))
            .collect()
    }

    /// Every stored resource of a kind
    pub fn list<W: DeserializeOwned>(&self, kind: &str) -> Result<Vec<Stored<W>>> {
        let data = self.lock();
        data.resources
            .get(kind)
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(|value| split(value.clone()))
            .collect()
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.lock()
            .resources
            .get(kind)
            .is_some_and(|table| table.contains_key(id))
    }

    pub fn create<W>(&self, kind: &str, items: &[(String, &W)]) -> Result<Vec<Stored<W>>>
    where
        W: Serialize + DeserializeOwned,
    {
        self.write(kind, WriteMode::Create, items)
    }

    pub fn update<W>(&self, kind: &str, items: &[(String, &W)]) -> Result<Vec<Stored<W>>>
    where
        W: Serialize + DeserializeOwned,
    {
        self.write(kind, WriteMode::Update, items)
    }

    /// Delete `ids`, returning how many existed
    pub fn delete(&self, kind: &str, ids: &[String]) -> Result<usize> {
        if !self.lock().resources.contains_key(kind) {
            return Ok(0);
        }
        self.commit(|data| {
            let table = data.resources.entry(kind.to_string()).or_default();
            Ok(ids.iter().filter(|id| table.remove(*id).is_some()).count())
        })
    }

    /// Write a batch; nothing is written when any item is rejected
    fn write<W>(
        &self,
        kind: &str,
        mode: WriteMode,
        items: &[(String, &W)],
    ) -> Result<Vec<Stored<W>>>
    where
        W: Serialize + DeserializeOwned,
    {
        self.commit(|data| {
            let table = data.resources.entry(kind.to_string()).or_default();
            stamp(table, kind, mode, items)
        })
    }
}

/// Write `items` into one kind's table, refusing the whole batch on conflict
fn stamp<W>(
    table: &mut BTreeMap<String, Value>,
    kind: &str,
    mode: WriteMode,
    items: &[(String, &W)],
) -> Result<Vec<Stored<W>>>
where
    W: Serialize + DeserializeOwned,
{
    for (id, _) in items {
        match (mode, table.contains_key(id)) {
            (WriteMode::Create, true) => bail!("{kind} {id} already exists"),
            (WriteMode::Update, false) => bail!("{kind} {id} does not exist"),
            _ => {}
        }
    }

    let now = Utc::now().timestamp_millis();
    let mut written = Vec::with_capacity(items.len());
    for (id, item) in items {
        let mut value = serde_json::to_value(item)?;
        let created = table
            .get(id)
            .and_then(|old| old.get(CREATED).cloned())
            .unwrap_or_else(|| Value::from(now));
        let Value::Object(map) = &mut value else {
            bail!("{kind} {id} is not a mapping");
        };
        map.insert(CREATED.to_string(), created);
        map.insert(UPDATED.to_string(), Value::from(now));
        table.insert(id.clone(), value.clone());
        written.push(split(value)?);
    }
    Ok(written)
}

/// Separate server stamps from the written model
fn split<W: DeserializeOwned>(mut value: Value) -> Result<Stored<W>> {
    let Value::Object(map) = &mut value else {
        bail!("stored resource is not a mapping");
    };
    let created_time = map.remove(CREATED).and_then(|v| v.as_i64()).unwrap_or_default();
    let last_updated_time = map.remove(UPDATED).and_then(|v| v.as_i64()).unwrap_or_default();
    let item = serde_json::from_value(value).context("stored resource does not match its kind")?;
    Ok(Stored {
        item,
        created_time,
        last_updated_time,
    })
}

impl GrantProvider for FileStore {
    fn grants(&self) -> Result<Vec<Capability>> {
        Ok(self.lock().principal.clone().unwrap_or_default())
    }

    fn is_unrestricted(&self) -> bool {
        self.lock().principal.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::Scope;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Thing {
        id: String,
        value: i64,
    }

    fn thing(id: &str, value: i64) -> Thing {
        Thing {
            id: id.to_string(),
            value,
        }
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(&temp.path().join("store.json")).unwrap();
        assert!(store.list::<Thing>("things").unwrap().is_empty());
        assert!(store.is_unrestricted());
    }

    #[test]
    fn test_create_stamps_and_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("store.json");
        let store = FileStore::open(&path).unwrap();

        let a = thing("a", 1);
        let written = store.create("things", &[("a".to_string(), &a)]).unwrap();
        assert_eq!(written[0].item, a);
        assert!(written[0].created_time > 0);

        let reopened = FileStore::open(&path).unwrap();
        let found = reopened
            .retrieve::<Thing>("things", &["a".to_string(), "zz".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].created_time, written[0].created_time);
    }

    #[test]
    fn test_create_rejects_existing_and_update_rejects_missing() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(&temp.path().join("store.json")).unwrap();
        let a = thing("a", 1);
        store.create("things", &[("a".to_string(), &a)]).unwrap();

        let b = thing("b", 1);
        assert!(
            store
                .create("things", &[("b".to_string(), &b), ("a".to_string(), &a)])
                .is_err()
        );
        assert!(!store.contains("things", "b"), "rejected batch writes nothing");
        assert!(store.update("things", &[("b".to_string(), &b)]).is_err());
    }

    #[test]
    fn test_update_keeps_created_time() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(&temp.path().join("store.json")).unwrap();
        let created = store.create("things", &[("a".to_string(), &thing("a", 1))]).unwrap();
        let updated = store.update("things", &[("a".to_string(), &thing("a", 2))]).unwrap();

        assert_eq!(updated[0].created_time, created[0].created_time);
        assert_eq!(updated[0].item.value, 2);
    }

    #[test]
    fn test_delete_counts_existing() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(&temp.path().join("store.json")).unwrap();
        store.create("things", &[("a".to_string(), &thing("a", 1))]).unwrap();

        let deleted = store
            .delete("things", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.delete("others", &["a".to_string()]).unwrap(), 0);
    }

    #[test]
    fn test_failed_persist_leaves_store_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let store = FileStore::open(&path).unwrap();
        store.create("things", &[("a".to_string(), &thing("a", 1))]).unwrap();

        // A directory in place of the file makes every write fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let b = thing("b", 1);
        assert!(store.create("things", &[("b".to_string(), &b)]).is_err());
        assert!(!store.contains("things", "b"));

        assert!(store.update("things", &[("a".to_string(), &thing("a", 2))]).is_err());
        let kept = store.retrieve::<Thing>("things", &["a".to_string()]).unwrap();
        assert_eq!(kept[0].item.value, 1);

        assert!(store.delete("things", &["a".to_string()]).is_err());
        assert!(store.contains("things", "a"));
    }

    #[test]
    fn test_principal_section_restricts_grants() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        fs::write(
            &path,
            json!({
                "principal": [{
                    "acl": "dataModelsAcl",
                    "actions": ["READ"],
                    "scope": {"space": ["sp"]}
                }]
            })
            .to_string(),
        )
        .unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(!store.is_unrestricted());
        let grants = store.grants().unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].scope, Scope::spaces(["sp"]));
    }
}
