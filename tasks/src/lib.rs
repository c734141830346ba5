//! # Embedding Tasks
//!
//! Turns a document store into a distributed work queue for embedding
//! generation, without a dedicated broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embedding Tasks                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  BackfillOrchestrator ──► WorkerPool ──► ProviderAdapter        │
//! │                              │                                  │
//! │                              ▼                                  │
//! │                       TaskCoordinator                           │
//! │                              │ conditional updates              │
//! │                              ▼                                  │
//! │                        DocumentStore                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All coordination state lives on the documents; workers can run in any
//! number of processes against the same store.

pub mod backfill;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod pool;
pub mod store;
pub mod text;
pub mod throttle;

pub use backfill::{BackfillOrchestrator, BackfillReport, StopReason};
pub use config::{AttemptResetPolicy, BackfillConfig, ClaimConfig, WorkerConfig};
pub use coordinator::{Claim, FinalizeResult, QueueDepth, TaskCoordinator, TaskOutcome};
pub use document::{Document, EmbeddingPayload, EmbeddingTask, TaskStatus};
pub use error::{Result, TaskError};
pub use pool::{CycleSummary, WorkerPool};
pub use store::{DocumentStore, Filter, MemoryDocumentStore, Projection, Update};
pub use text::{
    CandidateProfileTemplate, FieldTemplate, JobListingTemplate, TemplateConfig, TextTemplate,
    touches_embedding_fields,
};
pub use throttle::Throttle;
