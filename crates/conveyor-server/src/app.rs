//! Application wiring.

use crate::startup::print_startup_info;
use conveyor_config::{AppConfig, StoreBackend, StoreConfig};
use conveyor_core::ConveyorResult;
use conveyor_jobs::{
    create_pool, EmailProcessor, InMemoryJobStore, JobStore, JobSystem, LoggingEmailTransport,
    LoggingPushGateway, PushProcessor, RedisJobStore, TemplateCatalog,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connects the configured job store.
///
/// A Redis store that cannot be reached is an error; callers treat it as fatal.
pub async fn connect_store(config: &StoreConfig) -> ConveyorResult<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory job store, queued jobs are lost on restart");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
        StoreBackend::Redis => {
            let pool = create_pool(config).await?;
            info!(key_prefix = %config.key_prefix, "Connected to Redis job store");
            Ok(Arc::new(RedisJobStore::new(pool, &config.key_prefix)))
        }
    }
}

/// Registers the built-in processors with their logging transports.
pub fn register_default_processors(system: &JobSystem) {
    system.register_processor(Arc::new(EmailProcessor::new(
        TemplateCatalog::with_defaults(),
        Arc::new(LoggingEmailTransport),
    )));
    system.register_processor(Arc::new(PushProcessor::new(Arc::new(LoggingPushGateway))));
}

/// The running worker process.
pub struct App {
    config: AppConfig,
    system: Arc<JobSystem>,
}

impl App {
    /// Connects the store and builds the job system.
    pub async fn build(config: AppConfig) -> ConveyorResult<Self> {
        let store = connect_store(&config.store).await?;
        let system = JobSystem::new(config.clone(), store);
        register_default_processors(&system);

        Ok(Self {
            config,
            system: Arc::new(system),
        })
    }

    pub fn system(&self) -> &Arc<JobSystem> {
        &self.system
    }

    /// Starts every enabled queue, runs until `shutdown` resolves, then drains.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ConveyorResult<()> {
        let queues = self.system.initialize().await?;
        print_startup_info(&self.config, queues);

        let reporter = tokio::spawn(report_gauges(
            Arc::clone(&self.system),
            self.config.metrics.report_interval(),
        ));

        shutdown.await;

        reporter.abort();
        self.system.shutdown(self.config.worker.shutdown_grace()).await;

        if let Ok(summary) = self.system.get_metrics_summary().await {
            match serde_json::to_string(&summary) {
                Ok(json) => info!(summary = %json, "Final job metrics"),
                Err(e) => debug!(error = %e, "Could not serialize metrics summary"),
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

/// Refreshes the store-derived gauges that no worker event updates.
async fn report_gauges(system: Arc<JobSystem>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = system.get_queue_metrics().await {
            warn!(error = %e, "Failed to read queue depths");
        }
        system.get_circuit_breaker_metrics();
        if let Err(e) = system.get_dead_letter_stats().await {
            warn!(error = %e, "Failed to read dead letter stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_jobs::{EmailPayload, EnqueueOptions, EventType};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.worker.poll_interval_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_memory_store_selected_by_default() {
        let store = connect_store(&StoreConfig::default()).await.unwrap();
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_app_processes_email_until_shutdown() {
        let app = App::build(test_config()).await.unwrap();
        let system = Arc::clone(app.system());

        let id = system
            .add_email_job(
                EmailPayload {
                    to: "ada@example.com".into(),
                    template: "notification".into(),
                    variables: BTreeMap::from([
                        ("title".to_string(), "Hello".to_string()),
                        ("message".to_string(), "World".to_string()),
                    ]),
                    subject: None,
                },
                EnqueueOptions::new(),
            )
            .await
            .unwrap();

        let watcher = Arc::clone(&system);
        let watched = id.clone();
        let shutdown = async move {
            for _ in 0..200 {
                let done = watcher
                    .events()
                    .entries_for(&watched)
                    .iter()
                    .any(|e| e.event_type == EventType::Completed);
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        app.run(shutdown).await.unwrap();

        let types: Vec<EventType> = system.events().entries_for(&id).iter().map(|e| e.event_type).collect();
        assert_eq!(types.last(), Some(&EventType::Completed));
        assert!(!system.is_accepting());
    }
}
