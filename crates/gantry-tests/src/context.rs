//! Test context providing access to the database and scheduler services.

use crate::containers::PostgresContainer;
use gantry_db::Database;
use gantry_scheduler::{
    CommitStatusReporter, JobEmitter, MatrixParser, RunService, SchedulerConfig, TaskDispatcher,
    TracingSink,
};
use std::sync::Arc;

/// PostgreSQL with migrations applied.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
    pub config: SchedulerConfig,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(SchedulerConfig::default()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = postgres.database(10).await?;

        Ok(Self {
            postgres,
            db,
            config,
        })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.url()
    }

    fn reporter(&self) -> Arc<CommitStatusReporter> {
        Arc::new(CommitStatusReporter::new(
            Arc::new(TracingSink),
            self.config.status_cache_size,
        ))
    }

    pub fn runs(&self) -> RunService {
        RunService::new(
            Arc::new(self.db.clone()),
            Arc::new(MatrixParser::new()),
            self.reporter(),
        )
    }

    pub fn dispatcher(&self) -> TaskDispatcher {
        TaskDispatcher::new(
            Arc::new(self.db.clone()),
            self.reporter(),
            self.config.clone(),
        )
    }

    pub fn emitter(&self) -> JobEmitter {
        JobEmitter::new(
            Arc::new(self.db.clone()),
            Arc::new(MatrixParser::new()),
            self.reporter(),
            self.config.clone(),
        )
    }
}
