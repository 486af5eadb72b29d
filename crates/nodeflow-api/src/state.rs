//! Application state wiring the engine to its SQLite repositories.
//!
//! AppState holds the concrete engine used by both CLI commands and REST API
//! handlers. The engine is generic over its repositories; AppState pins it
//! to the infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use nodeflow_core::Engine;
use nodeflow_core::callback::StepRegistry;
use nodeflow_core::execution::ObserverRegistry;
use nodeflow_infra::config::{load_engine_config, resolve_database_url};
use nodeflow_infra::sqlite::callback::SqliteCallbackRepository;
use nodeflow_infra::sqlite::node_execution::SqliteNodeExecutionRepository;
use nodeflow_infra::sqlite::pool::{DatabasePool, default_data_dir};
use nodeflow_types::config::EngineConfig;

/// Engine pinned to the SQLite repositories.
pub type ConcreteEngine = Engine<SqliteNodeExecutionRepository, SqliteCallbackRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database and
    /// assemble the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let database_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&database_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        Ok(Self::from_parts(db_pool, config, data_dir))
    }

    /// Assemble the engine over an already-open pool.
    ///
    /// No step handlers are registered here: results delivered for an
    /// unregistered step type are folded with the default aggregation.
    pub fn from_parts(db_pool: DatabasePool, config: EngineConfig, data_dir: PathBuf) -> Self {
        let engine = Engine::new(
            SqliteNodeExecutionRepository::new(db_pool.clone()),
            SqliteCallbackRepository::new(db_pool.clone()),
            ObserverRegistry::new(),
            StepRegistry::new(),
            &config,
        );
        Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            data_dir,
            db_pool,
        }
    }
}
