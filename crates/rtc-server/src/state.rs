use std::path::Path;
use std::sync::Arc;

use rtc_core::config::Config;
use rtc_core::dispatch::HttpDispatcher;
use rtc_core::engine::{Engine, EngineConfig};
use rtc_core::store::{AttemptStore, MemoryStore, RedbStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Arc<Config>,
    /// Client the simulated job service uses to call back.
    pub http: reqwest::Client,
    /// Mount `POST /api/job`.
    pub simulator: bool,
}

impl AppState {
    pub fn new(engine: Engine, config: Config) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            http: reqwest::Client::new(),
            simulator: false,
        }
    }

    pub fn with_simulator(mut self, enabled: bool) -> Self {
        self.simulator = enabled;
        self
    }

    /// Wire the production engine for `root`: redb store (or an in-memory
    /// one when `ephemeral`) plus the HTTP dispatcher.
    pub fn open(root: &Path, config: Config, ephemeral: bool) -> rtc_core::Result<Self> {
        let engine_config = EngineConfig::from_config(&config)?;
        let store: Arc<dyn AttemptStore> = if ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedbStore::open(&config.store_path(root))?)
        };
        let dispatcher = Arc::new(HttpDispatcher::from_config(&config));
        let engine = Engine::new(store, dispatcher, engine_config)?;
        Ok(Self::new(engine, config))
    }

    /// `public_base_url` without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.config.server.public_base_url.trim_end_matches('/')
    }
}
