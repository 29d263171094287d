//! File-backed JSON collection store with recipe lookup.
//!
//! One store owns one JSON document: a top-level object mapping collection
//! names to ordered record arrays. Two names are reserved: `_` holds store
//! metadata (write-debounce delay, read-only flag, format), `recipes` holds
//! the recipe records driving [`Store::query`] and [`Store::modify`].
//!
//! Mutations mark the store dirty; a single writer task debounces bursts
//! into one persist. A file watcher reloads the tree after external edits,
//! inhibited around the store's own writes.

pub mod query;
pub mod recipe;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use query::QueryError;
pub use recipe::{apply_filter, Recipe};

/// Quiet window after an external change before reloading.
const WATCH_QUIET_MS: u64 = 500;
/// Events this close to our own write are echoes of it.
const WATCH_ECHO_MS: i64 = 1000;

/// Store failures. Per-entry modify problems are reported in the op list,
/// not here.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("store file must hold a top-level object")]
    NotAnObject,

    #[error("store is read-only")]
    ReadOnly,

    #[error("no recipe named `{0}`")]
    UnknownRecipe(String),

    #[error("recipe `{0}` has no collection; it cannot modify")]
    NotModify(String),
}

impl From<StoreError> for haven_common::HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ReadOnly => Self::Forbidden("store is read-only".into()),
            StoreError::UnknownRecipe(name) => Self::NotImplemented(format!("no recipe `{name}`")),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Metadata from the reserved `_` collection.
#[derive(Debug, Clone, Deserialize)]
struct StoreCfg {
    /// Write-debounce delay in milliseconds.
    #[serde(default = "default_delay")]
    delay: u64,
    #[serde(default)]
    readonly: bool,
}

fn default_delay() -> u64 {
    1000
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            delay: default_delay(),
            readonly: false,
        }
    }
}

/// One entry of a modify batch: `{ref, record}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModifyEntry {
    #[serde(default, rename = "ref")]
    pub reference: Option<Value>,
    #[serde(default)]
    pub record: Option<Value>,
}

/// In-memory JSON document collections with debounced file persistence.
pub struct Store {
    path: PathBuf,
    tree: RwLock<Value>,
    cfg: RwLock<StoreCfg>,
    /// Advances on every mutation; watcher and persist consult it.
    version: AtomicU64,
    dirty: tokio::sync::Notify,
    inhibit: AtomicBool,
    last_persist_ms: AtomicI64,
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Store {
    /// Load a store from file without background tasks. Used directly in
    /// tests; services use [`Store::open`].
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path,
            tree: RwLock::new(Value::Object(Map::new())),
            cfg: RwLock::new(StoreCfg::default()),
            version: AtomicU64::new(0),
            dirty: tokio::sync::Notify::new(),
            inhibit: AtomicBool::new(false),
            last_persist_ms: AtomicI64::new(0),
            _watcher: Mutex::new(None),
        };
        store.load()?;
        Ok(store)
    }

    /// Load a store and start its persist and watch tasks. A load failure
    /// here is fatal to the owning site.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let store = Arc::new(Self::load_from(path)?);
        store.spawn_persist();
        if let Err(e) = store.spawn_watch() {
            warn!(path = %store.path.display(), error = %e, "store watch unavailable");
        }
        Ok(store)
    }

    /// Read the file and replace the in-memory tree atomically.
    pub fn load(&self) -> Result<(), StoreError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let tree: Value = serde_json::from_str(&raw)?;
        if !tree.is_object() {
            return Err(StoreError::NotAnObject);
        }
        let cfg = tree
            .get("_")
            .and_then(|meta| serde_json::from_value::<StoreCfg>(meta.clone()).ok())
            .unwrap_or_default();
        *self.cfg.write() = cfg;
        *self.tree.write() = tree;
        debug!(path = %self.path.display(), "store loaded");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deep copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.tree.read().clone()
    }

    /// First record in `collection` whose `field` equals `value`, with its
    /// index. The record is a deep copy.
    pub fn find(&self, collection: &str, field: &str, value: &Value) -> Option<(usize, Value)> {
        let tree = self.tree.read();
        let items = tree.get(collection)?.as_array()?;
        items
            .iter()
            .enumerate()
            .find(|(_, r)| r.get(field) == Some(value))
            .map(|(i, r)| (i, r.clone()))
    }

    /// Find a recipe by name in the reserved `recipes` collection.
    pub fn lookup(&self, name: &str) -> Option<Recipe> {
        let tree = self.tree.read();
        let recipes = tree.get("recipes")?.as_array()?;
        let hit = recipes
            .iter()
            .find(|r| r.get("name").and_then(Value::as_str) == Some(name))?;
        serde_json::from_value(hit.clone()).ok()
    }

    /// Run a query recipe. Failures and empty results fall back to the
    /// recipe's defaults; results are deep copies the caller may keep.
    pub fn query(&self, recipe: &Recipe, bindings: &Map<String, Value>) -> Value {
        let Some(expr) = &recipe.expression else {
            debug!(recipe = %recipe.name, "query recipe without expression");
            return recipe.defaults_or_empty();
        };
        let tree = self.tree.read();
        let mut value = match query::eval(expr, &tree, bindings) {
            Ok(v) => v,
            Err(e) => {
                debug!(recipe = %recipe.name, error = %e, "query failed, using defaults");
                return recipe.defaults_or_empty();
            }
        };
        drop(tree);

        if value.is_null() {
            return recipe.defaults_or_empty();
        }
        if let (Value::Array(items), Some(_), None) = (&value, &recipe.defaults, &recipe.header) {
            // A single-record query that matched nothing.
            if items.is_empty() {
                return recipe.defaults_or_empty();
            }
        }

        if let Some(limit) = recipe.limit {
            if let Value::Array(items) = &mut value {
                let keep = limit.unsigned_abs() as usize;
                if limit >= 0 {
                    items.truncate(keep);
                } else if items.len() > keep {
                    items.drain(..items.len() - keep);
                }
            }
        }
        if let Some(header) = &recipe.header {
            if let Value::Array(items) = &mut value {
                items.insert(0, header.clone());
            }
        }
        value
    }

    /// Apply a batch of `{ref, record}` entries through a modify recipe.
    /// Returns one `[op, ref, idx]` triple per entry, in input order.
    pub fn modify(
        &self,
        recipe: &Recipe,
        entries: &[ModifyEntry],
    ) -> Result<Vec<Value>, StoreError> {
        if self.cfg.read().readonly {
            return Err(StoreError::ReadOnly);
        }
        let collection_name = recipe
            .collection
            .clone()
            .ok_or_else(|| StoreError::NotModify(recipe.name.clone()))?;

        let mut tree = self.tree.write();
        let mut ops = Vec::with_capacity(entries.len());
        let mut mutated = false;

        for entry in entries {
            let op = self.apply_entry(&mut tree, recipe, &collection_name, entry, &mut mutated);
            ops.push(op);
        }

        drop(tree);
        if mutated {
            self.mark_dirty();
        }
        Ok(ops)
    }

    fn apply_entry(
        &self,
        tree: &mut Value,
        recipe: &Recipe,
        collection_name: &str,
        entry: &ModifyEntry,
        mutated: &mut bool,
    ) -> Value {
        let reference = entry.reference.clone().unwrap_or(Value::Null);
        if entry.reference.is_none() && entry.record.is_none() {
            return json!(["bad", null, null]);
        }

        // Resolve {index, record} through the recipe's reference expression.
        let existing = match &recipe.reference {
            Some(expr) => {
                let mut bindings = Map::new();
                bindings.insert("ref".into(), reference.clone());
                match query::locate(expr, tree, &bindings) {
                    Ok(hit) => hit,
                    Err(e) => {
                        warn!(recipe = %recipe.name, error = %e, "reference resolution failed");
                        return json!(["bad", reference, null]);
                    }
                }
            }
            None => None,
        };

        let Some(incoming) = &entry.record else {
            // Delete.
            return match existing {
                Some((idx, _)) => {
                    if let Some(items) = tree
                        .get_mut(collection_name)
                        .and_then(Value::as_array_mut)
                    {
                        items.remove(idx);
                        *mutated = true;
                        json!(["delete", reference, idx])
                    } else {
                        json!(["nop", reference, null])
                    }
                }
                None => json!(["nop", reference, null]),
            };
        };

        if !incoming.is_object() {
            return json!(["bad", reference, null]);
        }
        let defaults = recipe.defaults_or_empty();
        let base = existing
            .as_ref()
            .map(|(_, rec)| rec.clone())
            .unwrap_or_else(|| defaults.clone());
        let mut record = haven_common::merge_layers(&[&defaults, &base, incoming]);

        match existing {
            Some((idx, _)) => {
                if let Some(items) = tree
                    .get_mut(collection_name)
                    .and_then(Value::as_array_mut)
                {
                    if idx < items.len() {
                        items[idx] = record;
                        *mutated = true;
                        return json!(["change", reference, idx]);
                    }
                }
                json!(["bad", reference, null])
            }
            None => {
                // Insert: assign the primary key first if the recipe has one.
                let mut key_value = Value::Null;
                if let Some(unique_expr) = &recipe.unique {
                    let mut bindings = Map::new();
                    bindings.insert("record".into(), record.clone());
                    match query::eval(unique_expr, tree, &bindings) {
                        Ok(unique) => {
                            let key = unique.get("key").and_then(Value::as_str).map(String::from);
                            let value = unique.get("value").cloned().unwrap_or(Value::Null);
                            if let Some(key) = key {
                                let collides = tree
                                    .get(collection_name)
                                    .and_then(Value::as_array)
                                    .map(|items| items.iter().any(|r| r.get(&key) == Some(&value)))
                                    .unwrap_or(false);
                                if collides {
                                    warn!(
                                        recipe = %recipe.name,
                                        key,
                                        "unique collision, insert refused"
                                    );
                                    return json!(["bad", reference, null]);
                                }
                                record[&key] = value.clone();
                                key_value = value;
                            }
                        }
                        Err(e) => {
                            warn!(recipe = %recipe.name, error = %e, "unique expression failed");
                            return json!(["bad", reference, null]);
                        }
                    }
                }

                let tree_obj = tree.as_object_mut().expect("store tree is an object");
                let items = tree_obj
                    .entry(collection_name.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Some(items) = items.as_array_mut() else {
                    return json!(["bad", reference, null]);
                };
                items.push(record);
                *mutated = true;
                json!(["add", key_value, items.len() - 1])
            }
        }
    }

    /// Serialize the tree to the store file immediately.
    pub async fn persist_now(&self) -> Result<(), StoreError> {
        self.inhibit.store(true, Ordering::SeqCst);
        let raw = serde_json::to_string_pretty(&*self.tree.read())?;
        let result = tokio::fs::write(&self.path, raw).await;
        self.last_persist_ms.store(now_ms(), Ordering::SeqCst);
        self.inhibit.store(false, Ordering::SeqCst);
        result?;
        debug!(path = %self.path.display(), "store persisted");
        Ok(())
    }

    fn mark_dirty(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.dirty.notify_one();
    }

    fn watch_inhibited(&self) -> bool {
        self.inhibit.load(Ordering::SeqCst)
            || now_ms() - self.last_persist_ms.load(Ordering::SeqCst) < WATCH_ECHO_MS
    }

    /// Single writer: waits for dirtiness, then sleeps until mutations go
    /// quiet, then writes. Failures are logged and retried on the next
    /// mutation.
    fn spawn_persist(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.dirty.notified().await;
                loop {
                    let seen = store.version.load(Ordering::SeqCst);
                    let delay = store.cfg.read().delay;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if store.version.load(Ordering::SeqCst) == seen {
                        break;
                    }
                }
                if let Err(e) = store.persist_now().await {
                    error!(path = %store.path.display(), error = %e, "store persist failed");
                }
            }
        });
    }

    /// Watch the store file for external edits and reload after a quiet
    /// window, unless the change is our own write or local mutations are
    /// pending.
    fn spawn_watch(self: &Arc<Self>) -> notify::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        *self._watcher.lock() = Some(watcher);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(_event) = rx.recv().await {
                let version = store.version.load(Ordering::SeqCst);
                // Quiet window: drain follow-up events.
                while let Ok(Some(_)) = tokio::time::timeout(
                    Duration::from_millis(WATCH_QUIET_MS),
                    rx.recv(),
                )
                .await
                {}
                if store.watch_inhibited() {
                    continue;
                }
                if store.version.load(Ordering::SeqCst) != version {
                    debug!("external change ignored, local mutations pending");
                    continue;
                }
                match store.load() {
                    Ok(()) => info!(path = %store.path.display(), "store reloaded after external change"),
                    Err(e) => warn!(path = %store.path.display(), error = %e, "store reload failed"),
                }
            }
        });
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_store(dir: &tempfile::TempDir, tree: &Value) -> PathBuf {
        let path = dir.path().join("data.json");
        std::fs::write(&path, serde_json::to_string_pretty(tree).unwrap()).unwrap();
        path
    }

    fn sample() -> Value {
        json!({
            "_": {"delay": 50},
            "recipes": [
                {
                    "name": "userList",
                    "auth": ["admin"],
                    "expression": "$.users[?username==$0]",
                    "defaults": {"status": "PENDING"}
                },
                {
                    "name": "userChange",
                    "collection": "users",
                    "reference": "$.users[?username==$ref]",
                    "defaults": {"status": "PENDING", "member": []}
                },
                {
                    "name": "noteChange",
                    "collection": "notes",
                    "reference": "$.notes[?id==$ref]",
                    "unique": "serial($.notes, id)"
                }
            ],
            "users": [
                {"username": "alice", "status": "ACTIVE", "member": ["users"]},
                {"username": "bob", "status": "ACTIVE", "member": ["admin"]}
            ],
            "notes": [
                {"id": 1, "text": "first"}
            ]
        })
    }

    #[test]
    fn lookup_finds_recipes_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        assert_eq!(store.lookup("userList").unwrap().name, "userList");
        assert!(store.lookup("nothing").is_none());
    }

    #[test]
    fn query_results_are_deep_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("userList").unwrap();
        let mut bindings = Map::new();
        bindings.insert("0".into(), json!("alice"));

        let mut first = store.query(&recipe, &bindings);
        first[0]["username"] = json!("mutated");
        let second = store.query(&recipe, &bindings);
        assert_eq!(second[0]["username"], "alice");
    }

    #[test]
    fn query_errors_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("userList").unwrap();
        // No binding for $0: evaluation fails, defaults come back.
        let out = store.query(&recipe, &Map::new());
        assert_eq!(out, json!({"status": "PENDING"}));
    }

    #[test]
    fn modify_updates_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("userChange").unwrap();

        let ops = store
            .modify(
                &recipe,
                &[ModifyEntry {
                    reference: Some(json!("alice")),
                    record: Some(json!({"email": "alice@example.net"})),
                }],
            )
            .unwrap();
        assert_eq!(ops, vec![json!(["change", "alice", 0])]);

        let snap = store.snapshot();
        assert_eq!(snap["users"][0]["email"], "alice@example.net");
        // Untouched fields survive the merge.
        assert_eq!(snap["users"][0]["status"], "ACTIVE");
    }

    #[test]
    fn modify_inserts_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("userChange").unwrap();

        let ops = store
            .modify(
                &recipe,
                &[ModifyEntry {
                    reference: Some(json!("carol")),
                    record: Some(json!({"username": "carol"})),
                }],
            )
            .unwrap();
        assert_eq!(ops, vec![json!(["add", null, 2])]);

        let snap = store.snapshot();
        assert_eq!(snap["users"][2]["username"], "carol");
        assert_eq!(snap["users"][2]["status"], "PENDING");
    }

    #[test]
    fn modify_assigns_serial_primary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("noteChange").unwrap();

        let ops = store
            .modify(
                &recipe,
                &[ModifyEntry {
                    reference: None,
                    record: Some(json!({"text": "second"})),
                }],
            )
            .unwrap();
        assert_eq!(ops, vec![json!(["add", 2, 1])]);
        assert_eq!(store.snapshot()["notes"][1]["id"], 2);
    }

    #[test]
    fn modify_deletes_and_reports_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store.lookup("userChange").unwrap();

        let ops = store
            .modify(
                &recipe,
                &[
                    ModifyEntry {
                        reference: Some(json!("bob")),
                        record: None,
                    },
                    ModifyEntry {
                        reference: Some(json!("ghost")),
                        record: None,
                    },
                    ModifyEntry {
                        reference: None,
                        record: None,
                    },
                ],
            )
            .unwrap();
        assert_eq!(
            ops,
            vec![
                json!(["delete", "bob", 1]),
                json!(["nop", "ghost", null]),
                json!(["bad", null, null]),
            ]
        );
        assert_eq!(store.snapshot()["users"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn modify_is_deterministic_across_equal_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = Store::load_from(write_store(&dir, &sample())).unwrap();
        let store_b = Store::load_from(write_store(&dir, &sample())).unwrap();
        let recipe = store_a.lookup("userChange").unwrap();

        let entries = [
            ModifyEntry {
                reference: Some(json!("alice")),
                record: Some(json!({"phone": "+1555"})),
            },
            ModifyEntry {
                reference: Some(json!("dave")),
                record: Some(json!({"username": "dave"})),
            },
        ];
        let ops_a = store_a.modify(&recipe, &entries).unwrap();
        let ops_b = store_b.modify(&recipe, &entries).unwrap();
        assert_eq!(ops_a, ops_b);
        assert_eq!(store_a.snapshot(), store_b.snapshot());
    }

    #[test]
    fn readonly_stores_refuse_modify() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = sample();
        tree["_"]["readonly"] = json!(true);
        let store = Store::load_from(write_store(&dir, &tree)).unwrap();
        let recipe = store.lookup("userChange").unwrap();
        assert!(matches!(
            store.modify(&recipe, &[]),
            Err(StoreError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn persist_roundtrips_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(&dir, &sample());
        let store = Store::load_from(&path).unwrap();
        let recipe = store.lookup("userChange").unwrap();
        store
            .modify(
                &recipe,
                &[ModifyEntry {
                    reference: Some(json!("erin")),
                    record: Some(json!({"username": "erin"})),
                }],
            )
            .unwrap();
        store.persist_now().await.unwrap();

        let reloaded = Store::load_from(&path).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[tokio::test]
    async fn debounce_collapses_mutation_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(&dir, &sample());
        let store = Store::open(&path).unwrap();
        let recipe = store.lookup("noteChange").unwrap();

        for i in 0..5 {
            store
                .modify(
                    &recipe,
                    &[ModifyEntry {
                        reference: None,
                        record: Some(json!({"text": format!("note {i}")})),
                    }],
                )
                .unwrap();
        }
        // Delay is 50 ms; give the writer room to fire once.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let reloaded = Store::load_from(&path).unwrap();
        assert_eq!(reloaded.snapshot()["notes"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn load_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Store::load_from(dir.path().join("missing.json")).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"[1, 2, 3]").unwrap();
        assert!(matches!(
            Store::load_from(&bad),
            Err(StoreError::NotAnObject)
        ));
    }
}
