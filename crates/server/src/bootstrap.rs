use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use wardflow_core::config::{AppConfig, ConfigError, LoadOptions};
use wardflow_core::escalation::EscalationSweeper;
use wardflow_core::workflow::ApprovalEngine;
use wardflow_db::{connect_with_settings, migrations, DbPool, SqlAuditSink, SqlRequestStore};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub sweeper: Arc<EscalationSweeper<SqlRequestStore, SqlAuditSink>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let engine = ApprovalEngine::new(config.approval_chain()?, config.role_map()?);
    let sweep_stages = config.sweep_stages()?;
    let sweeper = Arc::new(
        EscalationSweeper::new(
            Arc::new(SqlRequestStore::new(db_pool.clone())),
            engine,
            Arc::new(SqlAuditSink::new(db_pool.clone())),
        )
        .with_stages(sweep_stages),
    );

    Ok(Application { config, db_pool, sweeper })
}
