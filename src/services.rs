//! Shared state handed to every command and periodic task.

use anyhow::{Context, Result};
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::cache::ExpiringCache;
use crate::catalog::CatalogConnector;
use crate::config::{Config, RecommendConfig};
use crate::error_model::ErrorModelLoader;
use crate::model_cache::{FileModelStore, ModelCache};
use crate::models::AcceptanceWindow;
use crate::queue::TrainQueue;
use crate::supply::{CandidateSupply, SupplySettings};
use crate::token::TokenSigner;
use crate::traits::LibraryConnector;

/// Recommendation tunables, resolved from `[recommend]`.
#[derive(Debug, Clone)]
pub struct RecommendSettings {
    pub max_candidates: usize,
    pub min_accuracy: f64,
    pub history_limit: usize,
    pub stats_ttl: chrono::Duration,
    pub link_base: String,
}

impl From<&RecommendConfig> for RecommendSettings {
    fn from(config: &RecommendConfig) -> Self {
        Self {
            max_candidates: config.max_candidates,
            min_accuracy: config.min_accuracy,
            history_limit: config.history_limit,
            stats_ttl: chrono::Duration::seconds(config.stats_ttl_secs),
            link_base: config.link_base.clone(),
        }
    }
}

impl Default for RecommendSettings {
    fn default() -> Self {
        Self::from(&RecommendConfig::default())
    }
}

pub struct Services {
    /// Source of per-invocation library handles.
    pub libraries: Arc<dyn LibraryConnector>,
    pub supply: CandidateSupply,
    pub models: ModelCache,
    /// Acceptance windows keyed by user.
    pub stats: ExpiringCache<String, AcceptanceWindow>,
    pub tokens: TokenSigner,
    /// Absent when the service runs without a queue database.
    pub queue: Option<TrainQueue>,
    pub settings: RecommendSettings,
    /// Where users upload replays, quoted in the "no model" reply.
    pub upload_url: String,
}

impl Services {
    /// The candidate supply gets its own library handle, separate from
    /// the ones commands obtain.
    pub fn new(
        libraries: Arc<dyn LibraryConnector>,
        models: ModelCache,
        tokens: TokenSigner,
        settings: RecommendSettings,
        supply: SupplySettings,
        upload_url: impl Into<String>,
    ) -> Result<Self> {
        let supply = CandidateSupply::new(libraries.connect()?, supply);
        Ok(Self {
            libraries,
            supply,
            models,
            stats: ExpiringCache::new(),
            tokens,
            queue: None,
            settings,
            upload_url: upload_url.into(),
        })
    }

    pub fn with_queue(mut self, queue: TrainQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Wire the reference collaborators and open the queue database.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let libraries = Arc::new(CatalogConnector::open(&config.library.catalog)?);

        let store = FileModelStore::new(config.models.dir.clone(), Arc::new(ErrorModelLoader));
        let capacity = NonZeroUsize::new(config.models.cache_size)
            .context("models.cache_size must be > 0")?;
        let models = ModelCache::new(Box::new(store), capacity);

        let tokens = TokenSigner::from_file(
            &config.token.secret_path,
            chrono::Duration::hours(config.token.ttl_hours),
        )
        .context("Run `combine init` to create the token secret")?;

        let queue = TrainQueue::open(config).await?;

        let services = Self::new(
            libraries,
            models,
            tokens,
            RecommendSettings::from(&config.recommend),
            SupplySettings::from(&config.supply),
            config.upload.url.clone(),
        )?;
        Ok(services.with_queue(queue))
    }
}
