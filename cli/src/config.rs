//! `embedq` configuration file.
//!
//! Every section is optional; missing values fall back to each crate's
//! defaults. A handful of settings can be overridden from the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use embedq_embeddings::{CacheConfig, ProviderConfig};
use embedq_search::SearchConfig;
use embedq_tasks::{BackfillConfig, ClaimConfig, TemplateConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ENV_MODEL: &str = "EMBEDQ_MODEL";
pub const ENV_DIMENSION: &str = "EMBEDQ_DIMENSION";
pub const ENV_BASE_URL: &str = "EMBEDQ_BASE_URL";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store file. Defaults to the platform data directory.
    pub store_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub claim: ClaimConfig,
    pub worker: WorkerConfig,
    pub backfill: BackfillConfig,
    pub search: SearchConfig,
    pub template: TemplateConfig,
}

impl Config {
    /// `<config dir>/embedq/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("embedq").join("config.toml"))
    }

    /// `<data dir>/embedq`.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir().unwrap_or_default().join("embedq")
    }

    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.exists()),
        };

        let Some(path) = path else {
            debug!("No config file, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(model) = var(ENV_MODEL) {
            self.provider.model = model;
        }
        if let Some(dimension) = var(ENV_DIMENSION) {
            self.provider.dimension = dimension
                .parse()
                .with_context(|| format!("{ENV_DIMENSION} must be an integer, got {dimension:?}"))?;
        }
        if let Some(base_url) = var(ENV_BASE_URL) {
            self.provider.base_url = base_url;
        }
        if let Some(api_key) = var(ENV_API_KEY) {
            self.provider.api_key = Some(api_key);
        }
        Ok(())
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.provider.model.trim().is_empty() {
            bail!("provider.model must not be empty");
        }
        if self.provider.dimension == 0 {
            bail!("provider.dimension must be positive");
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be positive");
        }
        self.claim.validate()?;
        self.worker.validate()?;
        self.search.validate()?;
        Ok(())
    }

    /// Store file, with `override_path` taking precedence.
    pub fn store_path(&self, override_path: Option<&Path>) -> PathBuf {
        override_path
            .map(Path::to_path_buf)
            .or_else(|| self.store_path.clone())
            .unwrap_or_else(|| Self::data_dir().join("documents.json"))
    }

    /// Cache file; next to the store when not configured.
    pub fn cache_path(&self, store_path: &Path) -> PathBuf {
        self.cache.path.clone().unwrap_or_else(|| {
            store_path
                .parent()
                .map(|dir| dir.join("embedding-cache.json"))
                .unwrap_or_else(|| PathBuf::from("embedding-cache.json"))
        })
    }
}
