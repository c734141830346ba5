//! Command-line front end for embedding backfill and search.
//!
//! Usage:
//!   embedq import docs.json          Load documents into the store
//!   embedq backfill --limit 500      Generate missing embeddings
//!   embedq status                    Task counts by status
//!   embedq requeue <id>...           Retry failed tasks
//!   embedq search "query text"       Semantic search over ready documents

pub mod cli;
pub mod config;
pub mod context;
pub mod handlers;
pub mod output;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use context::AppContext;
