//! Application state for query service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::config::AppConfig;
use query_service::{
    PgConnectionStateSource, PgSearchPathManager, RetryCoordinator, TracingStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub pool: PgPool,
    pub coordinator: Arc<RetryCoordinator<PgConnection>>,
    pub state_source: Arc<PgConnectionStateSource>,
    pub search_path: Arc<PgSearchPathManager>,
    /// Cancelled on shutdown; every request runs under a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Connects the backend pool and wires the retry coordinator.
    pub async fn new(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .context("failed to connect to backend database")?;

        let state_source = Arc::new(PgConnectionStateSource::new(config.state.clone()));
        let search_path = Arc::new(PgSearchPathManager::new(
            config.search_path.clone(),
            &config.state.table,
        ));
        let coordinator = Arc::new(RetryCoordinator::new(
            config.retry,
            state_source.clone(),
            search_path.clone(),
            Arc::new(TracingStatus),
        ));

        Ok(Self {
            config,
            pool,
            coordinator,
            state_source,
            search_path,
            shutdown,
        })
    }
}
