//! Document store contract and an in-memory implementation.
//!
//! The store is the only shared state between workers. Every task transition
//! is a [`DocumentStore::conditional_update`]: the filter restates the state
//! the caller observed, and the update applies only if the document still
//! matches it.
//!
//! A persistent [`MemoryDocumentStore`] belongs to one process: it holds an
//! exclusive lock on `<path>.lock` for as long as it is open, and a second
//! open of the same path fails with [`TaskError::StoreLocked`]. Workers that
//! must share a queue across processes share one store instance instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::document::{Document, EmbeddingPayload, TaskStatus};
use crate::error::{Result, TaskError};

/// Predicate over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Id(String),
    IdIn(Vec<String>),
    /// Id sorts strictly after the given one.
    IdAfter(String),
    Status(TaskStatus),
    LockOwner(String),
    /// Lock taken strictly before the given time.
    LockAcquiredBefore(DateTime<Utc>),
    AttemptsBelow(u32),
    AttemptsEqual(u32),
    AttemptsAtLeast(u32),
    /// No `retry_after`, or `retry_after <= now`.
    RetryDue(DateTime<Utc>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Conjunction of `self` and `other`.
    pub fn and(self, other: Filter) -> Filter {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            Filter::All => other,
            this => Filter::And(vec![this, other]),
        }
    }

    /// Disjunction of `self` and `other`.
    pub fn or(self, other: Filter) -> Filter {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            this => Filter::Or(vec![this, other]),
        }
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let task = &doc.embedding;
        match self {
            Filter::All => true,
            Filter::Id(id) => doc.id == *id,
            Filter::IdIn(ids) => ids.contains(&doc.id),
            Filter::IdAfter(id) => doc.id > *id,
            Filter::Status(status) => task.status == *status,
            Filter::LockOwner(owner) => task.lock_owner.as_deref() == Some(owner.as_str()),
            Filter::LockAcquiredBefore(cutoff) => {
                task.lock_acquired_at.is_some_and(|at| at < *cutoff)
            }
            Filter::AttemptsBelow(n) => task.claim_attempts < *n,
            Filter::AttemptsEqual(n) => task.claim_attempts == *n,
            Filter::AttemptsAtLeast(n) => task.claim_attempts >= *n,
            Filter::RetryDue(now) => task.retry_after.is_none_or(|at| at <= *now),
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
        }
    }
}

/// A single field change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Status(TaskStatus),
    Lock { owner: String, at: DateTime<Utc> },
    ClearLock,
    IncrementAttempts,
    Attempts(u32),
    RetryAfter(Option<DateTime<Utc>>),
    Payload(EmbeddingPayload),
    ClearResult,
    LastError(Option<String>),
    Field { name: String, value: Value },
    Touch(DateTime<Utc>),
}

/// An ordered list of mutations applied together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    mutations: Vec<Mutation>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.mutations.push(Mutation::Status(status));
        self
    }

    pub fn lock(mut self, owner: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.mutations.push(Mutation::Lock {
            owner: owner.into(),
            at,
        });
        self
    }

    pub fn clear_lock(mut self) -> Self {
        self.mutations.push(Mutation::ClearLock);
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.mutations.push(Mutation::IncrementAttempts);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.mutations.push(Mutation::Attempts(attempts));
        self
    }

    pub fn retry_after(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.mutations.push(Mutation::RetryAfter(at));
        self
    }

    pub fn payload(mut self, payload: EmbeddingPayload) -> Self {
        self.mutations.push(Mutation::Payload(payload));
        self
    }

    pub fn clear_result(mut self) -> Self {
        self.mutations.push(Mutation::ClearResult);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.mutations.push(Mutation::LastError(error));
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.mutations.push(Mutation::Field {
            name: name.into(),
            value,
        });
        self
    }

    /// Set `updated_at`.
    pub fn touch(mut self, now: DateTime<Utc>) -> Self {
        self.mutations.push(Mutation::Touch(now));
        self
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Apply every mutation to `doc` in order.
    pub fn apply(&self, doc: &mut Document) {
        let task = &mut doc.embedding;
        for mutation in &self.mutations {
            match mutation {
                Mutation::Status(status) => task.status = *status,
                Mutation::Lock { owner, at } => {
                    task.lock_owner = Some(owner.clone());
                    task.lock_acquired_at = Some(*at);
                }
                Mutation::ClearLock => task.clear_lock(),
                Mutation::IncrementAttempts => {
                    task.claim_attempts = task.claim_attempts.saturating_add(1);
                }
                Mutation::Attempts(n) => task.claim_attempts = *n,
                Mutation::RetryAfter(at) => task.retry_after = *at,
                Mutation::Payload(payload) => {
                    task.dimensions = Some(payload.vector.len());
                    task.vector = Some(payload.vector.clone());
                    task.model_id = Some(payload.model_id.clone());
                    task.generated_at = Some(payload.generated_at);
                }
                Mutation::ClearResult => task.clear_result(),
                Mutation::LastError(error) => task.last_error = error.clone(),
                Mutation::Field { name, value } => {
                    doc.fields.insert(name.clone(), value.clone());
                }
                Mutation::Touch(now) => doc.updated_at = *now,
            }
        }
    }
}

/// Which parts of a document to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub include_vector: bool,
    pub include_fields: bool,
}

impl Projection {
    /// Everything.
    pub fn full() -> Self {
        Self {
            include_vector: true,
            include_fields: true,
        }
    }

    /// Fields and task state without the vector.
    pub fn without_vector() -> Self {
        Self {
            include_vector: false,
            include_fields: true,
        }
    }

    /// Task state only.
    pub fn status_only() -> Self {
        Self {
            include_vector: false,
            include_fields: false,
        }
    }

    fn apply(self, mut doc: Document) -> Document {
        if !self.include_vector {
            doc.embedding.vector = None;
        }
        if !self.include_fields {
            doc.fields.clear();
        }
        doc
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self::full()
    }
}

/// Persistence backend for documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Up to `limit` documents matching `filter`, ordered by id.
    async fn find_many(
        &self,
        filter: &Filter,
        projection: Projection,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// Apply `update` to every document matching `filter`, atomically per
    /// document. Returns how many documents changed.
    async fn conditional_update(&self, filter: &Filter, update: &Update) -> Result<u64>;

    /// Independent conditional updates. One result per item, in input order.
    async fn bulk_conditional_update(&self, ops: &[(Filter, Update)]) -> Vec<Result<u64>> {
        let mut results = Vec::with_capacity(ops.len());
        for (filter, update) in ops {
            results.push(self.conditional_update(filter, update).await);
        }
        results
    }

    /// Number of documents matching `filter`.
    async fn count(&self, filter: &Filter) -> Result<u64>;

    /// Fetch one document.
    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Add a new document. Fails if the id exists.
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Add or replace a document.
    async fn upsert(&self, doc: Document) -> Result<()>;
}

/// Document store held in memory, optionally mirrored to a JSON file.
///
/// With a file, every write is saved before it becomes visible: a write whose
/// save fails leaves the store as it was.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<BTreeMap<String, Document>>,
    path: Option<PathBuf>,
    _lock: Option<StoreLock>,
}

impl MemoryDocumentStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if present.
    ///
    /// Fails with [`TaskError::StoreLocked`] while another open store holds
    /// the same path.
    pub async fn with_persistence(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let lock = StoreLock::acquire(&sibling(&path, "lock")).await?;

        let mut documents = BTreeMap::new();
        if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let loaded: Vec<Document> = serde_json::from_str(&content)?;
            for doc in loaded {
                documents.insert(doc.id.clone(), doc);
            }
            info!("Loaded {} documents from {}", documents.len(), path.display());
        }

        Ok(Self {
            documents: RwLock::new(documents),
            path: Some(path),
            _lock: Some(lock),
        })
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Write `documents` with `staged` replacing or adding entries. Callers
    /// hold the write lock, so saves never interleave.
    async fn persist(
        &self,
        documents: &BTreeMap<String, Document>,
        staged: &BTreeMap<String, Document>,
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot: Vec<&Document> = documents
            .iter()
            .filter(|(id, _)| !staged.contains_key(*id))
            .chain(staged.iter())
            .map(|(_, doc)| doc)
            .collect();
        let content = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = sibling(path, "tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| TaskError::Store(format!("{}: {e}", temp_path.display())))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| TaskError::Store(format!("{}: {e}", path.display())))?;

        debug!("Persisted documents to {}", path.display());
        Ok(())
    }

    /// Save `staged`, then make it visible.
    async fn commit(
        &self,
        documents: &mut BTreeMap<String, Document>,
        staged: BTreeMap<String, Document>,
    ) -> Result<()> {
        if let Err(e) = self.persist(documents, &staged).await {
            warn!("Failed to persist document store: {e}");
            return Err(e);
        }
        documents.extend(staged);
        Ok(())
    }
}

/// `path` with `.suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive advisory lock on a file, released when dropped.
struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    async fn acquire(path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await
            .map_err(|e| TaskError::Store(format!("{}: {e}", path.display())))?
            .into_std()
            .await;
        lock_exclusive(&file, path)?;
        debug!("Locked {}", path.display());
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File, path: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and open for this call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(TaskError::StoreLocked(path.display().to_string()));
    }
    Err(TaskError::Store(format!("{}: {err}", path.display())))
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File, path: &Path) -> Result<()> {
    warn!(
        "File locking is unavailable here; {} is not guarded against other processes",
        path.display()
    );
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_many(
        &self,
        filter: &Filter,
        projection: Projection,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|doc| filter.matches(doc))
            .take(limit.unwrap_or(usize::MAX))
            .map(|doc| projection.apply(doc.clone()))
            .collect())
    }

    async fn conditional_update(&self, filter: &Filter, update: &Update) -> Result<u64> {
        let mut documents = self.documents.write().await;
        let staged: BTreeMap<String, Document> = documents
            .values()
            .filter(|doc| filter.matches(doc))
            .map(|doc| {
                let mut next = doc.clone();
                update.apply(&mut next);
                (next.id.clone(), next)
            })
            .collect();

        let applied = staged.len() as u64;
        if applied > 0 {
            self.commit(&mut documents, staged).await?;
        }
        Ok(applied)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let documents = self.documents.read().await;
        Ok(documents.values().filter(|doc| filter.matches(doc)).count() as u64)
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&doc.id) {
            return Err(TaskError::AlreadyExists(doc.id));
        }
        let staged = BTreeMap::from([(doc.id.clone(), doc)]);
        self.commit(&mut documents, staged).await
    }

    async fn upsert(&self, doc: Document) -> Result<()> {
        let mut documents = self.documents.write().await;
        let staged = BTreeMap::from([(doc.id.clone(), doc)]);
        self.commit(&mut documents, staged).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn seeded() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            store
                .insert(Document::from_value(id, json!({"title": id}), now))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_filter_combinators() {
        let now = Utc::now();
        let mut doc = Document::from_value("d", json!({}), now);
        doc.embedding.status = TaskStatus::InProgress;
        doc.embedding.lock_owner = Some("w1".to_string());
        doc.embedding.lock_acquired_at = Some(now - TimeDelta::minutes(10));
        doc.embedding.claim_attempts = 2;

        let stale = Filter::Status(TaskStatus::InProgress)
            .and(Filter::LockAcquiredBefore(now - TimeDelta::minutes(5)))
            .and(Filter::AttemptsBelow(3));
        assert!(stale.matches(&doc));

        let fresh = Filter::LockAcquiredBefore(now - TimeDelta::minutes(15));
        assert!(!fresh.matches(&doc));

        let either = Filter::Status(TaskStatus::Queued).or(Filter::LockOwner("w1".to_string()));
        assert!(either.matches(&doc));
        assert!(Filter::All.and(Filter::Id("d".to_string())).matches(&doc));
    }

    #[test]
    fn test_retry_due() {
        let now = Utc::now();
        let mut doc = Document::from_value("d", json!({}), now);
        assert!(Filter::RetryDue(now).matches(&doc));

        doc.embedding.retry_after = Some(now + TimeDelta::seconds(30));
        assert!(!Filter::RetryDue(now).matches(&doc));
        assert!(Filter::RetryDue(now + TimeDelta::seconds(30)).matches(&doc));
    }

    #[tokio::test]
    async fn test_conditional_update_applies_only_on_match() {
        let store = seeded().await;
        let now = Utc::now();
        let claim = Update::new()
            .status(TaskStatus::InProgress)
            .lock("w1", now)
            .increment_attempts();
        let filter = Filter::Id("a".to_string()).and(Filter::Status(TaskStatus::Queued));

        assert_eq!(store.conditional_update(&filter, &claim).await.unwrap(), 1);
        assert_eq!(store.conditional_update(&filter, &claim).await.unwrap(), 0);

        let doc = store.get("a").await.unwrap().unwrap();
        assert_eq!(doc.embedding.claim_attempts, 1);
        assert_eq!(doc.embedding.lock_owner.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_bulk_updates_are_independent() {
        let store = seeded().await;
        let update = Update::new().status(TaskStatus::Error);
        let ops = vec![
            (Filter::Id("a".to_string()), update.clone()),
            (Filter::Id("missing".to_string()), update.clone()),
            (Filter::Id("c".to_string()), update),
        ];

        let results: Vec<u64> = store
            .bulk_conditional_update(&ops)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![1, 0, 1]);
        assert_eq!(store.count(&Filter::Status(TaskStatus::Error)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_projection_and_limit() {
        let store = seeded().await;
        let payload = EmbeddingPayload {
            vector: vec![1.0, 0.0],
            model_id: "m".to_string(),
            generated_at: Utc::now(),
        };
        store
            .conditional_update(
                &Filter::Id("b".to_string()),
                &Update::new().status(TaskStatus::Ready).payload(payload),
            )
            .await
            .unwrap();

        let slim = store
            .find_many(&Filter::All, Projection::status_only(), Some(2))
            .await
            .unwrap();
        assert_eq!(slim.len(), 2);
        assert!(slim.iter().all(|d| d.fields.is_empty()));
        assert_eq!(slim[1].embedding.vector, None);
        assert_eq!(slim[1].embedding.dimensions, Some(2));

        let full = store
            .find_many(&Filter::Id("b".to_string()), Projection::full(), None)
            .await
            .unwrap();
        assert_eq!(full[0].vector(), Some(&vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = seeded().await;
        let err = store
            .insert(Document::from_value("a", json!({}), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::AlreadyExists(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("documents.json");

        {
            let store = MemoryDocumentStore::with_persistence(&path).await.unwrap();
            store
                .insert(Document::from_value("x", json!({"title": "t"}), Utc::now()))
                .await
                .unwrap();
            store
                .conditional_update(
                    &Filter::Id("x".to_string()),
                    &Update::new().status(TaskStatus::Error).last_error(Some("boom".to_string())),
                )
                .await
                .unwrap();
        }

        let reopened = MemoryDocumentStore::with_persistence(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(dir.path().join("store").join("documents.json.lock").exists());
        let doc = reopened.get("x").await.unwrap().unwrap();
        assert_eq!(doc.embedding.status, TaskStatus::Error);
        assert_eq!(doc.embedding.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_documents_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        let store = MemoryDocumentStore::with_persistence(&path).await.unwrap();
        store
            .insert(Document::from_value("a", json!({"title": "t"}), Utc::now()))
            .await
            .unwrap();

        // A directory where the temporary file goes makes every save fail.
        std::fs::create_dir(dir.path().join("documents.json.tmp")).unwrap();

        let claim = Update::new().status(TaskStatus::InProgress).lock("w1", Utc::now());
        let result = store
            .conditional_update(&Filter::Id("a".to_string()), &claim)
            .await;
        assert!(matches!(result, Err(TaskError::Store(_))));

        let doc = store.get("a").await.unwrap().unwrap();
        assert_eq!(doc.embedding.status, TaskStatus::Queued);
        assert_eq!(doc.embedding.lock_owner, None);

        let insert = store
            .insert(Document::from_value("b", json!({}), Utc::now()))
            .await;
        assert!(insert.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_second_open_of_a_store_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");

        let first = MemoryDocumentStore::with_persistence(&path).await.unwrap();
        let second = MemoryDocumentStore::with_persistence(&path).await;
        assert!(matches!(second, Err(TaskError::StoreLocked(_))));

        drop(first);
        assert!(MemoryDocumentStore::with_persistence(&path).await.is_ok());
    }

    #[test]
    fn test_id_after_pages_in_id_order() {
        let doc = Document::from_value("b", json!({}), Utc::now());
        assert!(Filter::IdAfter("a".to_string()).matches(&doc));
        assert!(!Filter::IdAfter("b".to_string()).matches(&doc));
    }
}
