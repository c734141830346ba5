//! Shared state for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use embedq_embeddings::{
    EmbeddingCache, EmbeddingProvider, HashProvider, OpenAIProvider, ProviderAdapter,
};
use embedq_tasks::{MemoryDocumentStore, TaskCoordinator, TextTemplate};
use tracing::{debug, info};

use crate::cli::Cli;
use crate::config::Config;

/// Everything a command needs: configuration, the document store and the
/// coordinator over it.
pub struct AppContext {
    pub config: Config,
    pub store_path: PathBuf,
    pub store: Arc<MemoryDocumentStore>,
    pub coordinator: Arc<TaskCoordinator>,
    pub template: Arc<dyn TextTemplate>,
    pub offline: bool,
}

impl AppContext {
    /// Load configuration as directed by the command line and open the store.
    pub async fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = Config::load(cli.config.as_deref())?;
        config.apply_env()?;
        let store_path = config.store_path(cli.store.as_deref());
        Self::new(config, store_path, cli.offline).await
    }

    /// Validate `config` and open the store at `store_path`.
    pub async fn new(config: Config, store_path: PathBuf, offline: bool) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        if let Some(dir) = store_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }

        let store = Arc::new(
            MemoryDocumentStore::with_persistence(&store_path)
                .await
                .with_context(|| format!("failed to open store {}", store_path.display()))?,
        );
        let coordinator = Arc::new(TaskCoordinator::new(store.clone(), config.claim.clone()));
        let template = config.template.build();
        debug!("Opened store {}", store_path.display());

        Ok(Self {
            config,
            store_path,
            store,
            coordinator,
            template,
            offline,
        })
    }

    /// Provider wrapped in the retrying adapter.
    pub fn adapter(&self) -> Result<Arc<ProviderAdapter>> {
        if self.offline {
            return Ok(self.offline_adapter());
        }

        let provider = OpenAIProvider::from_config(&self.config.provider)?;
        if !provider.is_available() {
            bail!("no API key configured; set OPENAI_API_KEY or pass --offline");
        }
        Ok(self.wrap(Arc::new(provider)))
    }

    /// Deterministic local provider producing vectors of the configured
    /// dimension.
    pub fn offline_adapter(&self) -> Arc<ProviderAdapter> {
        info!("Using offline hash provider");
        let provider = &self.config.provider;
        self.wrap(Arc::new(HashProvider::new(
            provider.model.clone(),
            provider.dimension,
        )))
    }

    fn wrap(&self, provider: Arc<dyn EmbeddingProvider>) -> Arc<ProviderAdapter> {
        Arc::new(ProviderAdapter::new(provider, self.config.provider.retry))
    }

    /// Query cache, persisted next to the store unless configured otherwise.
    pub async fn cache(&self, adapter: Arc<ProviderAdapter>) -> Result<EmbeddingCache> {
        let mut cache_config = self.config.cache.clone();
        cache_config.path = Some(self.config.cache_path(&self.store_path));

        let cache = EmbeddingCache::from_config(&cache_config, adapter)
            .await
            .context("failed to open embedding cache")?;
        Ok(cache.with_expected_dimension(self.config.provider.dimension))
    }
}
