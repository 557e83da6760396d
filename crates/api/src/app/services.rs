use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use jobforge_core::RetryPolicy;
use jobforge_queue::{
    HandlerRegistry, InMemoryJobLogger, InMemoryJobStore, JobLogger, JobRunner, JobStore,
    PostgresJobLogger, PostgresJobStore, RetryManager, Scheduler,
};

use crate::config::AppConfig;

/// Shared application services, wired once at startup.
pub struct AppServices {
    store: Arc<dyn JobStore>,
    logger: Arc<dyn JobLogger>,
    runner: JobRunner,
    scheduler: Scheduler,
}

impl AppServices {
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn logger(&self) -> &Arc<dyn JobLogger> {
        &self.logger
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

pub async fn build_services(
    config: &AppConfig,
    registry: HandlerRegistry,
) -> anyhow::Result<AppServices> {
    let (store, logger): (Arc<dyn JobStore>, Arc<dyn JobLogger>) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresJobStore::new(pool.clone());
            store.migrate().await?;
            info!("job store: postgres");
            (Arc::new(store), Arc::new(PostgresJobLogger::new(pool)))
        }
        None => {
            info!("job store: in-memory");
            (
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryJobLogger::new()),
            )
        }
    };

    info!(
        handler_types = registry.types().len(),
        "handler registry wired"
    );

    let runner = JobRunner::new(
        store.clone(),
        logger.clone(),
        RetryManager::new(RetryPolicy::default()),
        registry,
    );
    let scheduler = Scheduler::new(store.clone(), chrono::Duration::days(config.retention_days));

    Ok(AppServices {
        store,
        logger,
        runner,
        scheduler,
    })
}
