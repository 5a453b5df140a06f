//! Replicated document store seam.
//!
//! Peers only ever talk to the store through [`DocumentStore`]: keyed JSON
//! documents grouped in collections, point and full-scan reads, whole-document
//! upserts, partial updates at a sub-path, subscriptions that keep a collection
//! synchronized, and a level-triggered local observer per collection.
//!
//! [`MemoryStore`] is the in-process implementation. Every handle returned by
//! [`MemoryStore::replica`] sees the same document space, so a write through one
//! replica is immediately visible (and observed) through all others.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace};

pub type DocumentId = String;

/// Latest contents of one collection, ordered by document id. Documents a write
/// did not touch are shared with the previous snapshot.
pub type Snapshot = Arc<BTreeMap<DocumentId, Arc<Value>>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: DocumentId },
    #[error("invalid update path {0:?}")]
    InvalidPath(String),
    #[error("identity rejected: {0}")]
    Identity(String),
    #[error("sync requires an identity")]
    NotAuthorized,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Where this replica listens and which remote replicas it dials.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub connect: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct Identity {
    pub app_id: String,
    pub license: String,
}

/// Keeps a collection synchronized from remote replicas while alive.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub trait DocumentStore: Send + Sync {
    fn set_transport_config(&self, config: TransportConfig);
    fn transport_config(&self) -> Option<TransportConfig>;
    fn set_identity(&self, identity: &Identity) -> Result<(), StoreError>;
    fn start_sync(&self) -> Result<(), StoreError>;
    fn stop_sync(&self);
    fn subscribe(&self, collection: &str) -> Subscription;
    fn observe(&self, collection: &str) -> watch::Receiver<Snapshot>;
    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;
    fn find_all(&self, collection: &str) -> Result<Vec<(DocumentId, Value)>, StoreError>;
    /// Insert or replace the whole document.
    fn upsert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;
    /// Set `value` at `path` inside the document, creating intermediate objects
    /// (and the document itself) as needed.
    fn update(&self, collection: &str, id: &str, path: &[&str], value: Value)
        -> Result<(), StoreError>;
}

/// Inspect the current snapshot and every later one until `check` yields a value.
/// Returns `Ok(None)` if the store side of the observer goes away first.
pub async fn observe_until<T, E>(
    rx: &mut watch::Receiver<Snapshot>,
    mut check: impl FnMut(&Snapshot) -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(found) = check(&snapshot)? {
            return Ok(Some(found));
        }
        if rx.changed().await.is_err() {
            return Ok(None);
        }
    }
}

pub fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, StoreError> {
    Ok(T::deserialize(value)?)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn set_at_path(doc: &mut Value, path: &[&str], value: Value) -> Result<(), StoreError> {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut cursor = doc;
    for key in parents {
        let obj = cursor
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidPath(path.join(".")))?;
        cursor = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    cursor
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidPath(path.join(".")))?
        .insert(last.to_string(), value);
    Ok(())
}

struct CollectionState {
    docs: BTreeMap<DocumentId, Arc<Value>>,
    revisions: HashMap<DocumentId, u64>,
    tx: watch::Sender<Snapshot>,
}

impl CollectionState {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self {
            docs: BTreeMap::new(),
            revisions: HashMap::new(),
            tx,
        }
    }

    fn publish(&mut self, id: &str) {
        *self.revisions.entry(id.to_string()).or_default() += 1;
        self.tx.send_replace(Arc::new(self.docs.clone()));
    }
}

#[derive(Default)]
struct Space {
    collections: Mutex<HashMap<String, CollectionState>>,
    subscriptions: Arc<Mutex<HashMap<u64, String>>>,
    next_subscription: AtomicU64,
}

#[derive(Default)]
struct ReplicaState {
    transport: Option<TransportConfig>,
    identity: Option<Identity>,
    syncing: bool,
}

/// In-process replica of a shared document space.
pub struct MemoryStore {
    space: Arc<Space>,
    local: Mutex<ReplicaState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            space: Arc::new(Space::default()),
            local: Mutex::new(ReplicaState::default()),
        }
    }

    /// Another replica over the same documents, with its own transport, identity
    /// and sync state.
    pub fn replica(&self) -> Self {
        Self {
            space: self.space.clone(),
            local: Mutex::new(ReplicaState::default()),
        }
    }

    /// Number of writes applied to a document so far.
    pub fn revision(&self, collection: &str, id: &str) -> u64 {
        self.collections()
            .get(collection)
            .and_then(|c| c.revisions.get(id).copied())
            .unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.space.subscriptions).len()
    }

    pub fn is_syncing(&self) -> bool {
        lock(&self.local).syncing
    }

    fn collections(&self) -> MutexGuard<'_, HashMap<String, CollectionState>> {
        lock(&self.space.collections)
    }
}

// A poisoned lock only means another writer panicked mid-update; the maps are
// still structurally valid.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DocumentStore for MemoryStore {
    fn set_transport_config(&self, config: TransportConfig) {
        debug!(
            listen = %format!("{}:{}", config.listen_addr, config.listen_port),
            connect = config.connect.len(),
            "set transport config"
        );
        lock(&self.local).transport = Some(config);
    }

    fn transport_config(&self) -> Option<TransportConfig> {
        lock(&self.local).transport.clone()
    }

    fn set_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        if identity.app_id.trim().is_empty() {
            return Err(StoreError::Identity("empty app id".into()));
        }
        if identity.license.trim().is_empty() {
            return Err(StoreError::Identity("empty license".into()));
        }
        lock(&self.local).identity = Some(identity.clone());
        Ok(())
    }

    fn start_sync(&self) -> Result<(), StoreError> {
        let mut local = lock(&self.local);
        if local.identity.is_none() {
            return Err(StoreError::NotAuthorized);
        }
        local.syncing = true;
        Ok(())
    }

    fn stop_sync(&self) {
        lock(&self.local).syncing = false;
    }

    fn subscribe(&self, collection: &str) -> Subscription {
        let id = self.space.next_subscription.fetch_add(1, Ordering::Relaxed);
        let registry = self.space.subscriptions.clone();
        lock(&registry).insert(id, collection.to_string());
        trace!(collection, id, "subscribed");
        Subscription::new(move || {
            lock(&registry).remove(&id);
        })
    }

    fn observe(&self, collection: &str) -> watch::Receiver<Snapshot> {
        self.collections()
            .entry(collection.to_string())
            .or_insert_with(CollectionState::new)
            .tx
            .subscribe()
    }

    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections()
            .get(collection)
            .and_then(|c| c.docs.get(id).map(|doc| Value::clone(doc))))
    }

    fn find_all(&self, collection: &str) -> Result<Vec<(DocumentId, Value)>, StoreError> {
        Ok(self
            .collections()
            .get(collection)
            .map(|c| {
                c.docs
                    .iter()
                    .map(|(id, doc)| (id.clone(), Value::clone(doc)))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let mut collections = self.collections();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(CollectionState::new);
        coll.docs.insert(id.to_string(), Arc::new(doc));
        coll.publish(id);
        Ok(())
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        path: &[&str],
        value: Value,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(CollectionState::new);
        let doc = coll
            .docs
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Value::Object(Map::new())));
        // copies only this document when an observer still holds the old one
        set_at_path(Arc::make_mut(doc), path, value)?;
        coll.publish(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity {
            app_id: "app".into(),
            license: "token".into(),
        }
    }

    #[test]
    fn test_update_creates_intermediate_objects() {
        let store = MemoryStore::new();
        store
            .update("peers", "doc", &["logs", "a", "log", "0"], json!({"timestamp": 5}))
            .unwrap();
        store
            .update("peers", "doc", &["logs", "b", "log", "3"], json!({"timestamp": 9}))
            .unwrap();
        let doc = store.find_by_id("peers", "doc").unwrap().unwrap();
        assert_eq!(doc["logs"]["a"]["log"]["0"]["timestamp"], 5);
        assert_eq!(doc["logs"]["b"]["log"]["3"]["timestamp"], 9);
        assert_eq!(store.revision("peers", "doc"), 2);
    }

    #[test]
    fn test_update_through_scalar_is_rejected() {
        let store = MemoryStore::new();
        store.upsert("c", "d", json!({"x": 1})).unwrap();
        let err = store.update("c", "d", &["x", "y"], json!(2)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
    }

    #[test]
    fn test_replicas_share_documents() {
        let a = MemoryStore::new();
        let b = a.replica();
        a.upsert("coord", "info", json!({"k": "v"})).unwrap();
        let all = b.find_all("coord").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "info");
        assert!(b.find_by_id("coord", "missing").unwrap().is_none());
        assert!(b.find_all("empty").unwrap().is_empty());
    }

    #[test]
    fn test_sync_requires_identity() {
        let store = MemoryStore::new();
        assert!(matches!(store.start_sync(), Err(StoreError::NotAuthorized)));
        let bad = Identity {
            license: " ".into(),
            ..identity()
        };
        assert!(store.set_identity(&bad).is_err());
        store.set_identity(&identity()).unwrap();
        store.start_sync().unwrap();
        assert!(store.is_syncing());
        store.stop_sync();
        assert!(!store.is_syncing());
    }

    #[test]
    fn test_subscription_guard() {
        let store = MemoryStore::new();
        let replica = store.replica();
        let s1 = store.subscribe("a");
        let s2 = replica.subscribe("b");
        assert_eq!(store.active_subscriptions(), 2);
        drop(s1);
        assert_eq!(store.active_subscriptions(), 1);
        s2.cancel();
        assert_eq!(replica.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_observer_sees_writes_from_other_replica() {
        let a = MemoryStore::new();
        let b = a.replica();
        let mut rx = b.observe("coord");
        assert!(rx.borrow_and_update().is_empty());
        a.update("coord", "info", &["execution_plan"], json!(null))
            .unwrap();
        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone();
        assert!(snap.contains_key("info"));
    }

    #[test]
    fn test_write_shares_untouched_documents() {
        let store = MemoryStore::new();
        let rx = store.observe("peers");
        store.upsert("peers", "a", json!({"logs": {}})).unwrap();
        store.upsert("peers", "b", json!({"logs": {}})).unwrap();
        let before = rx.borrow().clone();

        store
            .update("peers", "b", &["logs", "p", "log", "0"], json!({"timestamp": 1}))
            .unwrap();
        let after = rx.borrow().clone();
        assert!(Arc::ptr_eq(&before["a"], &after["a"]));
        assert!(!Arc::ptr_eq(&before["b"], &after["b"]));
        assert_eq!(before["b"]["logs"], json!({}));
        assert_eq!(after["b"]["logs"]["p"]["log"]["0"]["timestamp"], 1);
    }
}
