//! Documents and the embedding task state stored on them.

use chrono::{DateTime, Utc};
use embedq_embeddings::Embedding;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a document's embedding.
///
/// `queued -> in_progress -> {ready | queued (retry later) | error}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    #[default]
    Queued,
    /// Claimed by a worker.
    InProgress,
    /// Embedding generated.
    Ready,
    /// Gave up. Needs a manual re-queue.
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Queued, Self::InProgress, Self::Ready, Self::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding task state, stored on the document itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingTask {
    pub status: TaskStatus,

    /// Worker holding the claim. Only set while `in_progress`.
    pub lock_owner: Option<String>,

    /// When the current or last claim was taken.
    pub lock_acquired_at: Option<DateTime<Utc>>,

    /// Number of claims so far. Only grows, except on a resetting re-queue.
    pub claim_attempts: u32,

    /// A queued task is not claimable before this time.
    pub retry_after: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Embedding>,

    pub model_id: Option<String>,

    pub dimensions: Option<usize>,

    pub generated_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

impl EmbeddingTask {
    /// Whether a claim is held.
    pub fn is_locked(&self) -> bool {
        self.status == TaskStatus::InProgress && self.lock_owner.is_some()
    }

    /// Drop the lock fields.
    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_acquired_at = None;
    }

    /// Drop the result payload.
    pub fn clear_result(&mut self) {
        self.vector = None;
        self.model_id = None;
        self.dimensions = None;
        self.generated_at = None;
    }
}

/// A successful embedding result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPayload {
    pub vector: Embedding,
    pub model_id: String,
    pub generated_at: DateTime<Utc>,
}

/// A stored document with its embedding state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier.
    pub id: String,

    /// Document content.
    #[serde(default)]
    pub fields: Map<String, Value>,

    /// Embedding state.
    #[serde(default)]
    pub embedding: EmbeddingTask,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a queued document.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            fields,
            embedding: EmbeddingTask::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a queued document from a JSON object. Anything else gives an
    /// empty field map.
    pub fn from_value(id: impl Into<String>, value: Value, now: DateTime<Utc>) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields, now)
    }

    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// A field as a trimmed non-empty string.
    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The embedding vector, if ready.
    pub fn vector(&self) -> Option<&Embedding> {
        match self.embedding.status {
            TaskStatus::Ready => self.embedding.vector.as_ref(),
            _ => None,
        }
    }
}
