//! In-memory resource kind for tests

use crate::access::RequiredCapability;
use crate::context::RunContext;
use crate::error::{MissingIdentifier, Transient};
use crate::normalize;
use crate::resource::{Classification, Dependency, LocalDeclaration, ResourceKind};
use crate::types::Stage;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Write model: the raw mapping itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(pub Value);

/// Read model: a stored mapping with server fields
#[derive(Debug, Clone, PartialEq)]
pub struct Record(pub Value);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub stage: Stage,
    pub ids: Vec<String>,
}

const SERVER_FIELDS: &[&str] = &["createdTime", "lastUpdatedTime"];

pub struct MockKind {
    name: &'static str,
    kinds_before: &'static [&'static str],
    partial_update: bool,
    strict_delete: bool,
    claim_key: Option<&'static str>,
    store: Mutex<BTreeMap<String, Value>>,
    failing: Mutex<Vec<(Stage, String)>>,
    transient_left: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    required: Vec<RequiredCapability>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    clock: AtomicUsize,
}

impl MockKind {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            kinds_before: &[],
            partial_update: true,
            strict_delete: false,
            claim_key: None,
            store: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(Vec::new()),
            transient_left: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            required: Vec::new(),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            clock: AtomicUsize::new(0),
        }
    }

    pub fn without_partial_update(mut self) -> Self {
        self.partial_update = false;
        self
    }

    pub fn with_strict_delete_order(mut self) -> Self {
        self.strict_delete = true;
        self
    }

    pub fn after(mut self, kinds: &'static [&'static str]) -> Self {
        self.kinds_before = kinds;
        self
    }

    /// Only claim declarations that carry `key`
    pub fn claiming(mut self, key: &'static str) -> Self {
        self.claim_key = Some(key);
        self
    }

    pub fn requiring(mut self, required: RequiredCapability) -> Self {
        self.required.push(required);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every call of `stage` that touches `id` fail
    pub fn fail_on(self, stage: Stage, id: &str) -> Self {
        self.failing.lock().unwrap().push((stage, id.to_string()));
        self
    }

    /// Make the next `count` write calls fail with a transient error
    pub fn flaky(self, count: usize) -> Self {
        self.transient_left.store(count, Ordering::SeqCst);
        self
    }

    /// Seed the store with a remote resource
    pub fn seed(&self, raw: Value) {
        let id = raw["id"].as_str().unwrap().to_string();
        let mut stamped = raw;
        stamped["createdTime"] = Value::from(1);
        stamped["lastUpdatedTime"] = Value::from(1);
        self.store.lock().unwrap().insert(id, stamped);
    }

    pub fn stored(&self, id: &str) -> Option<Value> {
        self.store.lock().unwrap().get(id).cloned()
    }

    pub fn stored_ids(&self) -> Vec<String> {
        self.store.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.stage, Stage::Create | Stage::Update | Stage::Delete))
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, stage: Stage, ids: Vec<String>) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            stage,
            ids: ids.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some((_, id)) = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .find(|(s, id)| *s == stage && ids.contains(id))
        {
            bail!("{stage} rejected {id}");
        }
        if matches!(stage, Stage::Create | Stage::Update | Stage::Delete)
            && self
                .transient_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Transient::new("service unavailable").into());
        }
        Ok(())
    }

    fn write(&self, stage: Stage, items: &[Item]) -> Result<Vec<Record>> {
        let ids: Vec<String> = items.iter().filter_map(|i| raw_id(&i.0)).collect();
        self.enter(stage, ids)?;

        let mut store = self.store.lock().unwrap();
        let mut written = Vec::with_capacity(items.len());
        for item in items {
            let Some(id) = raw_id(&item.0) else {
                bail!("item without id");
            };
            let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 2;
            let exists = store.contains_key(&id);
            match stage {
                Stage::Create if exists => bail!("{id} already exists"),
                Stage::Update if !exists => bail!("{id} does not exist"),
                _ => {}
            }
            let mut stamped = item.0.clone();
            let created = store
                .get(&id)
                .map_or(Value::from(tick), |old| old["createdTime"].clone());
            stamped["createdTime"] = created;
            stamped["lastUpdatedTime"] = Value::from(tick);
            store.insert(id, stamped.clone());
            written.push(Record(stamped));
        }
        Ok(written)
    }
}

fn raw_dependencies(raw: &Value) -> Vec<Dependency<String>> {
    let mut deps: Vec<Dependency<String>> = raw["deps"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|d| Dependency::SameKind(d.to_string()))
        .collect();
    if let Some(space) = raw["space"].as_str() {
        deps.push(Dependency::other("spaces", space));
    }
    deps
}

fn raw_id(raw: &Value) -> Option<String> {
    raw.get("id").and_then(Value::as_str).map(str::to_string)
}

impl ResourceKind for MockKind {
    type Id = String;
    type Write = Item;
    type Read = Record;

    fn kind(&self) -> &'static str {
        self.name
    }

    fn depends_on_kinds(&self) -> &'static [&'static str] {
        self.kinds_before
    }

    fn classify(&self, raw: &Value) -> Classification {
        match self.claim_key {
            Some(key) if raw.get(key).is_none() => Classification::NotApplicable,
            _ => Classification::Matched,
        }
    }

    fn write_id(&self, item: &Item) -> Result<String, MissingIdentifier> {
        raw_id(&item.0).ok_or_else(|| MissingIdentifier::new("id is required"))
    }

    fn read_id(&self, item: &Record) -> Result<String, MissingIdentifier> {
        raw_id(&item.0).ok_or_else(|| MissingIdentifier::new("id is required"))
    }

    fn server_fields(&self) -> &'static [&'static str] {
        SERVER_FIELDS
    }

    fn sensitive_fields(&self) -> &'static [&'static str] {
        &["secret"]
    }

    fn normalize(&self, item: &Record) -> Value {
        normalize::canonical(&item.0, SERVER_FIELDS)
    }

    fn dependencies(&self, item: &Item) -> Vec<Dependency<String>> {
        raw_dependencies(&item.0)
    }

    fn read_dependencies(&self, item: &Record) -> Vec<Dependency<String>> {
        raw_dependencies(&item.0)
    }

    fn supports_partial_update(&self) -> bool {
        self.partial_update
    }

    fn strict_delete_order(&self) -> bool {
        self.strict_delete
    }

    fn required_capabilities(&self, _items: &[Item], _read_only: bool) -> Vec<RequiredCapability> {
        self.required.clone()
    }

    fn retrieve(&self, _ctx: &RunContext, ids: &[String]) -> Result<Vec<Record>> {
        self.enter(Stage::Retrieve, ids.to_vec())?;
        let store = self.store.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| store.get(id).cloned().map(Record))
            .collect())
    }

    fn list(&self, _ctx: &RunContext) -> Result<Vec<Record>> {
        self.enter(Stage::List, Vec::new())?;
        Ok(self
            .store
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(Record)
            .collect())
    }

    fn create(&self, _ctx: &RunContext, items: &[Item]) -> Result<Vec<Record>> {
        self.write(Stage::Create, items)
    }

    fn update(&self, _ctx: &RunContext, items: &[Item]) -> Result<Vec<Record>> {
        self.write(Stage::Update, items)
    }

    fn delete(&self, _ctx: &RunContext, ids: &[String]) -> Result<usize> {
        self.enter(Stage::Delete, ids.to_vec())?;
        let mut store = self.store.lock().unwrap();
        Ok(ids.iter().filter(|id| store.remove(*id).is_some()).count())
    }
}

/// Local declaration of `raw`, canonicalized the way the engine does it
pub fn decl(kind: &MockKind, raw: Value) -> LocalDeclaration<Item> {
    LocalDeclaration::new(kind.normalize_local(&raw), Item(raw))
}

pub fn record(raw: Value) -> Record {
    Record(raw)
}
