// database.rs - Document Database Client Interface
//
//! Consumed interface to the cluster's document database, plus an in-memory
//! reference backend.
//!
//! The database uses optimistic concurrency: every `save` must present the
//! revision it read, and a mismatch fails with `Conflict`. A conflict on an
//! agent's own descriptor means another instance owns the agent.
//!
//! Change notifications carry an `own_change` flag telling the listener
//! whether the revision was produced by its own connection.

use std::collections::HashSet;
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::common::{ConnectionTracker, ConnectivityCallback};

/// Database errors
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Revision conflict saving document: {0}")]
    Conflict(String),

    #[error("Document has no revision: {0}")]
    MissingRevision(String),

    #[error("Database not connected")]
    NotConnected,

    #[error("Unknown view: {0}")]
    UnknownView(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A persisted document with its opaque revision token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identifier
    pub id: String,

    /// Opaque revision token; `None` before the first save
    pub rev: Option<String>,

    /// Document type tag used for factory lookups
    pub document_type: String,

    /// Type-specific content
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, document_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            document_type: document_type.into(),
            body,
        }
    }
}

/// One change observed on the change feed.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub doc_id: String,
    pub rev: String,
    pub deleted: bool,
    /// True when the revision was produced by the listening connection.
    pub own_change: bool,
}

/// Change feed callback. Handlers must not block; long reactions go through
/// the scheduler.
pub type ChangeCallback = Arc<dyn Fn(DocumentChange) + Send + Sync>;

/// Options for `query_view`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict the view to rows with this key.
    pub key: Option<String>,
}

/// One database connection.
#[async_trait]
pub trait Database: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, doc_id: &str) -> Result<Document, DatabaseError>;

    /// Save a document; fails with `Conflict` when the presented revision is
    /// not the current one.
    async fn save(&self, doc: Document) -> Result<Document, DatabaseError>;

    /// Re-read the latest revision of a document.
    async fn reload(&self, doc: &Document) -> Result<Document, DatabaseError>;

    /// Delete a document at its current revision.
    async fn delete(&self, doc: &Document) -> Result<(), DatabaseError>;

    /// Query a named view.
    async fn query_view(
        &self,
        view: &str,
        options: QueryOptions,
    ) -> Result<Vec<Document>, DatabaseError>;

    /// Subscribe to changes of the given document ids.
    fn changes_listener(&self, doc_ids: &[String], callback: ChangeCallback);

    /// Cancel the subscription registered for exactly these document ids.
    fn cancel_listener(&self, doc_ids: &[String]);

    fn is_connected(&self) -> bool;

    /// Release this connection and its listeners.
    async fn disconnect(&self);
}

/// Factory handing out connections, shared by an agency.
#[async_trait]
pub trait DatabaseFactory: Send + Sync {
    async fn connection(&self) -> Result<Arc<dyn Database>, DatabaseError>;

    /// Suspend until the backend reports connected.
    async fn wait_connected(&self);

    fn is_connected(&self) -> bool;

    fn add_disconnected_callback(&self, cb: ConnectivityCallback);

    fn add_reconnected_callback(&self, cb: ConnectivityCallback);

    async fn disconnect(&self);
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct StoredDocument {
    seq: u64,
    doc: Document,
}

struct ListenerEntry {
    session: Uuid,
    filter: HashSet<String>,
    callback: ChangeCallback,
}

struct Store {
    docs: DashMap<String, StoredDocument>,
    listeners: Mutex<Vec<ListenerEntry>>,
    connected: watch::Sender<bool>,
    tracker: ConnectionTracker,
}

impl Store {
    fn notify(&self, session: Uuid, doc_id: &str, rev: &str, deleted: bool) {
        let callbacks: Vec<(Uuid, ChangeCallback)> = self
            .listeners
            .lock()
            .iter()
            .filter(|entry| entry.filter.contains(doc_id))
            .map(|entry| (entry.session, entry.callback.clone()))
            .collect();
        for (listener_session, callback) in callbacks {
            callback(DocumentChange {
                doc_id: doc_id.to_string(),
                rev: rev.to_string(),
                deleted,
                own_change: listener_session == session,
            });
        }
    }
}

/// In-memory database used by tests and the demo node.
#[derive(Clone)]
pub struct MemoryDatabase {
    store: Arc<Store>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        let store = Arc::new(Store {
            docs: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            connected,
            tracker: ConnectionTracker::new(),
        });
        store.tracker.on_connected();
        Self { store }
    }

    /// Force the simulated connectivity state; used by tests.
    pub fn set_connected(&self, connected: bool) {
        let _ = self.store.connected.send(connected);
        if connected {
            self.store.tracker.on_connected();
        } else {
            self.store.tracker.on_disconnected();
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.store.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.docs.is_empty()
    }

    /// Direct lookup bypassing connections; used by tests.
    pub fn peek(&self, doc_id: &str) -> Option<Document> {
        self.store.docs.get(doc_id).map(|entry| entry.doc.clone())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseFactory for MemoryDatabase {
    async fn connection(&self) -> Result<Arc<dyn Database>, DatabaseError> {
        Ok(Arc::new(MemoryConnection {
            session: Uuid::new_v4(),
            store: self.store.clone(),
        }))
    }

    async fn wait_connected(&self) {
        let mut rx = self.store.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    fn is_connected(&self) -> bool {
        *self.store.connected.borrow()
    }

    fn add_disconnected_callback(&self, cb: ConnectivityCallback) {
        self.store.tracker.add_disconnected_callback(cb);
    }

    fn add_reconnected_callback(&self, cb: ConnectivityCallback) {
        self.store.tracker.add_connected_callback(cb);
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }
}

struct MemoryConnection {
    session: Uuid,
    store: Arc<Store>,
}

impl MemoryConnection {
    fn ensure_connected(&self) -> Result<(), DatabaseError> {
        if *self.store.connected.borrow() {
            Ok(())
        } else {
            Err(DatabaseError::NotConnected)
        }
    }
}

#[async_trait]
impl Database for MemoryConnection {
    async fn get(&self, doc_id: &str) -> Result<Document, DatabaseError> {
        self.ensure_connected()?;
        self.store
            .docs
            .get(doc_id)
            .map(|entry| entry.doc.clone())
            .ok_or_else(|| DatabaseError::NotFound(doc_id.to_string()))
    }

    async fn save(&self, mut doc: Document) -> Result<Document, DatabaseError> {
        self.ensure_connected()?;
        use dashmap::mapref::entry::Entry;

        let seq;
        match self.store.docs.entry(doc.id.clone()) {
            Entry::Occupied(mut occupied) => {
                if doc.rev != occupied.get().doc.rev {
                    return Err(DatabaseError::Conflict(doc.id));
                }
                seq = occupied.get().seq + 1;
                doc.rev = Some(format!("{}-{}", seq, Uuid::new_v4().simple()));
                occupied.insert(StoredDocument {
                    seq,
                    doc: doc.clone(),
                });
            }
            Entry::Vacant(vacant) => {
                if doc.rev.is_some() {
                    return Err(DatabaseError::Conflict(doc.id));
                }
                seq = 1;
                doc.rev = Some(format!("{}-{}", seq, Uuid::new_v4().simple()));
                vacant.insert(StoredDocument {
                    seq,
                    doc: doc.clone(),
                });
            }
        }

        debug!(doc_id = %doc.id, rev = ?doc.rev, "saved document");
        let rev = doc.rev.clone().unwrap_or_default();
        self.store.notify(self.session, &doc.id, &rev, false);
        Ok(doc)
    }

    async fn reload(&self, doc: &Document) -> Result<Document, DatabaseError> {
        self.get(&doc.id).await
    }

    async fn delete(&self, doc: &Document) -> Result<(), DatabaseError> {
        self.ensure_connected()?;
        let Some(rev) = doc.rev.as_ref() else {
            return Err(DatabaseError::MissingRevision(doc.id.clone()));
        };

        let removed = match self.store.docs.get(&doc.id) {
            Some(stored) if stored.doc.rev.as_ref() == Some(rev) => {
                let seq = stored.seq + 1;
                drop(stored);
                self.store.docs.remove(&doc.id);
                Some(seq)
            }
            Some(_) => return Err(DatabaseError::Conflict(doc.id.clone())),
            None => return Err(DatabaseError::NotFound(doc.id.clone())),
        };

        if let Some(seq) = removed {
            let rev = format!("{}-deleted", seq);
            self.store.notify(self.session, &doc.id, &rev, true);
        }
        Ok(())
    }

    async fn query_view(
        &self,
        view: &str,
        options: QueryOptions,
    ) -> Result<Vec<Document>, DatabaseError> {
        self.ensure_connected()?;
        match view {
            "by_document_type" => {
                let mut rows: Vec<Document> = self
                    .store
                    .docs
                    .iter()
                    .filter(|entry| match options.key.as_deref() {
                        Some(key) => entry.doc.document_type == key,
                        None => true,
                    })
                    .map(|entry| entry.doc.clone())
                    .collect();
                rows.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(rows)
            }
            other => Err(DatabaseError::UnknownView(other.to_string())),
        }
    }

    fn changes_listener(&self, doc_ids: &[String], callback: ChangeCallback) {
        self.store.listeners.lock().push(ListenerEntry {
            session: self.session,
            filter: doc_ids.iter().cloned().collect(),
            callback,
        });
    }

    fn cancel_listener(&self, doc_ids: &[String]) {
        let filter: HashSet<String> = doc_ids.iter().cloned().collect();
        self.store
            .listeners
            .lock()
            .retain(|entry| !(entry.session == self.session && entry.filter == filter));
    }

    fn is_connected(&self) -> bool {
        *self.store.connected.borrow()
    }

    async fn disconnect(&self) {
        self.store
            .listeners
            .lock()
            .retain(|entry| entry.session != self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_assigns_revisions_and_detects_conflicts() {
        let db = MemoryDatabase::new();
        let conn = db.connection().await.unwrap();

        let doc = Document::new("doc-1", "dummy", json!({"value": 1}));
        let saved = conn.save(doc).await.unwrap();
        assert!(saved.rev.is_some());

        // Saving a stale revision conflicts.
        let mut stale = saved.clone();
        conn.save(saved.clone()).await.unwrap();
        stale.body = json!({"value": 2});
        let err = conn.save(stale).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_missing_document_is_not_found() {
        let db = MemoryDatabase::new();
        let conn = db.connection().await.unwrap();
        let err = conn.get("no-such-doc").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn change_feed_reports_own_change_flag() {
        let db = MemoryDatabase::new();
        let ours = db.connection().await.unwrap();
        let theirs = db.connection().await.unwrap();

        let changes: Arc<Mutex<Vec<DocumentChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        ours.changes_listener(
            &["doc-1".to_string()],
            Arc::new(move |change| sink.lock().push(change)),
        );

        let doc = Document::new("doc-1", "dummy", json!({}));
        let saved = ours.save(doc).await.unwrap();
        theirs.save(saved).await.unwrap();

        let seen = changes.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].own_change);
        assert!(!seen[1].own_change);
        assert!(!seen[1].deleted);
    }

    #[tokio::test]
    async fn delete_notifies_with_deleted_flag() {
        let db = MemoryDatabase::new();
        let conn = db.connection().await.unwrap();

        let changes: Arc<Mutex<Vec<DocumentChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        conn.changes_listener(
            &["doc-1".to_string()],
            Arc::new(move |change| sink.lock().push(change)),
        );

        let saved = conn
            .save(Document::new("doc-1", "dummy", json!({})))
            .await
            .unwrap();
        conn.delete(&saved).await.unwrap();

        let seen = changes.lock().clone();
        assert!(seen.last().unwrap().deleted);
        assert!(db.peek("doc-1").is_none());
    }

    #[tokio::test]
    async fn query_view_filters_by_type() {
        let db = MemoryDatabase::new();
        let conn = db.connection().await.unwrap();
        conn.save(Document::new("a", "host_agent", json!({})))
            .await
            .unwrap();
        conn.save(Document::new("b", "worker", json!({})))
            .await
            .unwrap();

        let rows = conn
            .query_view(
                "by_document_type",
                QueryOptions {
                    key: Some("worker".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b");
    }

    #[tokio::test]
    async fn document_round_trips_through_json() {
        let doc = Document {
            id: "doc-1".into(),
            rev: Some("3-abc".into()),
            document_type: "dummy".into(),
            body: json!({"shard": "lobby", "n": 42}),
        };
        let bytes = serde_json::to_vec(&doc).unwrap();
        let restored: Document = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc, restored);
    }
}
