//! Pipeline startup and shutdown.

use super::{
    DetectionStage, EnrichmentSettings, EnrichmentStage, FailureConsumer, InferenceWorker,
    StatusConsumer,
};
use crate::broker::{ConsumerOptions, Handler, run_consumer, subscribe};
use crate::config::Config;
use crate::constants::INFERENCE_QUEUE_DEPTH;
use crate::error::{Error, Result};
use crate::health::{Health, StageStats};
use crate::retry::{Backoff, CallPolicy, with_retry};
use crate::services::Services;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Running consumer loops for every stage.
///
/// The loops stop when the broker is closed; [`Pipeline::join`] then waits
/// for in-flight messages to settle.
#[derive(Debug)]
pub struct Pipeline {
    consumers: Vec<(&'static str, JoinHandle<Result<()>>)>,
    worker: JoinHandle<()>,
    health: Arc<Health>,
}

async fn spawn_consumer<H: Handler>(
    services: &Services,
    queue: &str,
    handler: H,
    options: ConsumerOptions,
    stats: &Arc<StageStats>,
) -> Result<(&'static str, JoinHandle<Result<()>>)> {
    let stage = handler.stage();
    // Subscribed here so a close right after start cannot race the task.
    let subscription = subscribe(&*services.broker, queue, options.prefetch).await?;
    let handle = tokio::spawn(run_consumer(
        Arc::clone(&services.broker),
        queue.to_string(),
        subscription,
        Arc::new(handler),
        options,
        Arc::clone(stats),
    ));
    Ok((stage, handle))
}

impl Pipeline {
    /// Warm the detector up, mark the pipeline ready and start consuming.
    ///
    /// # Errors
    ///
    /// Fails when warmup does not succeed within the retry budget; no
    /// consumer is started in that case.
    pub async fn start(services: &Services, config: &Config, health: Arc<Health>) -> Result<Self> {
        let backoff = Backoff::from(&config.retry);
        let warmup = CallPolicy {
            attempts: config.retry.call_attempts,
            timeout: config.timeouts.detect(),
            backoff,
        };
        with_retry("warmup", warmup, || services.detector.warmup()).await?;
        health.set_ready();
        info!("detector ready");

        let (worker, worker_handle) = InferenceWorker::spawn(
            Arc::clone(&services.detector),
            INFERENCE_QUEUE_DEPTH,
            config.timeouts.detect(),
        );

        let queues = &config.queues;
        let options = ConsumerOptions {
            prefetch: queues.prefetch,
            max_attempts: config.retry.message_max_attempts,
            backoff,
        };

        let detection = DetectionStage::new(
            Arc::clone(&services.broker),
            Arc::clone(&services.source),
            worker,
            config.dedup.into(),
            &queues.detection_results,
            &queues.failures,
            CallPolicy {
                attempts: config.retry.call_attempts,
                timeout: config.timeouts.download(),
                backoff,
            },
        );
        let enrichment = EnrichmentStage::new(
            Arc::clone(&services.broker),
            Arc::clone(&services.source),
            Arc::clone(&services.describer),
            Arc::clone(&services.store),
            EnrichmentSettings::from_config(config),
            &queues.descriptions,
            &queues.failures,
        );
        let status = StatusConsumer::new(Arc::clone(&services.repository));
        let failures = FailureConsumer::new(Arc::clone(&services.repository));

        let consumers = vec![
            spawn_consumer(services, &queues.tasks, detection, options, &health.detection).await?,
            spawn_consumer(
                services,
                &queues.detection_results,
                enrichment,
                options,
                &health.enrichment,
            )
            .await?,
            spawn_consumer(services, &queues.descriptions, status, options, &health.status)
                .await?,
            spawn_consumer(services, &queues.failures, failures, options, &health.failures)
                .await?,
        ];

        Ok(Self {
            consumers,
            worker: worker_handle,
            health,
        })
    }

    /// Shared health state.
    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    /// Wait for every consumer to stop.
    ///
    /// Returns the first consumer error, after all of them have finished.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (stage, handle) in self.consumers {
            let outcome = handle.await.map_err(|e| Error::Internal {
                message: format!("{stage} consumer panicked: {e}"),
            });
            if let Err(e) = outcome.and_then(|r| r) {
                error!(stage, "consumer failed: {e}");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.worker.await {
            error!("inference worker panicked: {e}");
        }

        first_error.map_or(Ok(()), Err)
    }
}
