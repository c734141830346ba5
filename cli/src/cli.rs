//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// embedq - embedding backfill and semantic search over a document store
#[derive(Debug, Parser)]
#[command(name = "embedq", version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/embedq/config.toml)
    #[arg(long, env = "EMBEDQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Document store file (default: <data dir>/embedq/documents.json)
    #[arg(long, env = "EMBEDQ_STORE", global = true)]
    pub store: Option<PathBuf>,

    /// Use the deterministic offline provider instead of the embeddings API
    #[arg(long, global = true)]
    pub offline: bool,

    /// Print JSON instead of a human-readable summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load documents from a JSON array of objects with an "id" field
    Import {
        /// JSON file to read
        file: PathBuf,
        /// Update documents that already exist, re-queueing their embedding
        /// when an embedded field changed
        #[arg(long)]
        update: bool,
    },

    /// Generate missing embeddings until nothing is left to claim
    Backfill {
        /// Maximum number of tasks to claim overall
        #[arg(long)]
        limit: Option<usize>,
        /// Tasks claimed per cycle
        #[arg(long)]
        batch_size: Option<usize>,
        /// Provider calls in flight at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<usize>,
        /// Only list what would be claimed
        #[arg(long)]
        dry_run: bool,
    },

    /// Show task counts by status
    Status,

    /// Put failed (or finished) tasks back in the queue
    Requeue {
        /// Document ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Discard a document's embedding so it is generated again
    Invalidate {
        /// Document id
        id: String,
        /// Fields that changed; nothing happens unless one of them is embedded
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },

    /// Semantic search over ready documents
    Search {
        /// Query text
        text: String,
        /// 0-based page number
        #[arg(long, default_value = "0")]
        page: usize,
        /// Results per page
        #[arg(long)]
        page_size: Option<usize>,
        /// Attribute to match against the configured attribute field (repeatable)
        #[arg(long = "attribute")]
        attributes: Vec<String>,
        /// Metadata constraint as key=value (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Rank only these document ids (repeatable)
        #[arg(long)]
        within: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from([
            "embedq",
            "--offline",
            "search",
            "rust engineer",
            "--attribute",
            "rust",
            "--attribute",
            "tokio",
            "--filter",
            "team=core",
            "--page-size",
            "5",
        ])
        .unwrap();

        assert!(cli.offline);
        match cli.command {
            Commands::Search {
                text,
                page,
                page_size,
                attributes,
                filters,
                within,
            } => {
                assert_eq!(text, "rust engineer");
                assert_eq!(page, 0);
                assert_eq!(page_size, Some(5));
                assert_eq!(attributes, vec!["rust", "tokio"]);
                assert_eq!(filters, vec!["team=core"]);
                assert!(within.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_requeue_needs_ids() {
        assert!(Cli::try_parse_from(["embedq", "requeue"]).is_err());
    }

    #[test]
    fn test_invalidate_fields() {
        let cli = Cli::try_parse_from(["embedq", "invalidate", "d1", "--fields", "skills,email"])
            .unwrap();
        match cli.command {
            Commands::Invalidate { id, fields } => {
                assert_eq!(id, "d1");
                assert_eq!(fields, vec!["skills", "email"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
