//! Detection stage: task → detector → dedup → detection result.

use super::{crop, notify_failure};
use crate::broker::{Broker, Handler, publish_json};
use crate::dedup::{DedupParams, dedup_candidates};
use crate::error::{Error, Result};
use crate::messages::{DetectedObject, DetectionResult, Task};
use crate::retry::{CallPolicy, with_retry};
use crate::services::{Detections, Detector, ImageSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct InferenceJob {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Detections>>,
}

/// Runs detector calls on a dedicated task, one at a time.
///
/// Consumer loops only enqueue jobs; a full channel blocks the sender.
#[derive(Debug, Clone)]
pub struct InferenceWorker {
    jobs: mpsc::Sender<InferenceJob>,
}

impl InferenceWorker {
    /// Start the worker. It stops once every handle has been dropped.
    pub fn spawn(
        detector: Arc<dyn Detector>,
        queue_depth: usize,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (jobs, mut rx) = mpsc::channel::<InferenceJob>(queue_depth.max(1));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match tokio::time::timeout(timeout, detector.detect(&job.image)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: "detect".to_string(),
                        timeout,
                    }),
                };
                if job.reply.send(result).is_err() {
                    debug!("detection requester went away");
                }
            }
            debug!("inference worker stopped");
        });

        (Self { jobs }, handle)
    }

    /// Queue `image` for detection and wait for the result.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Detections> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(InferenceJob { image, reply })
            .await
            .map_err(|_| Error::DetectorNotReady)?;
        rx.await.map_err(|_| Error::Internal {
            message: "inference worker dropped a job".to_string(),
        })?
    }
}

/// Consumes [`Task`] messages and publishes [`DetectionResult`] messages.
pub struct DetectionStage {
    broker: Arc<dyn Broker>,
    source: Arc<dyn ImageSource>,
    worker: InferenceWorker,
    dedup: DedupParams,
    results_queue: String,
    failures_queue: String,
    download: CallPolicy,
}

impl DetectionStage {
    /// Create the stage.
    pub fn new(
        broker: Arc<dyn Broker>,
        source: Arc<dyn ImageSource>,
        worker: InferenceWorker,
        dedup: DedupParams,
        results_queue: impl Into<String>,
        failures_queue: impl Into<String>,
        download: CallPolicy,
    ) -> Self {
        Self {
            broker,
            source,
            worker,
            dedup,
            results_queue: results_queue.into(),
            failures_queue: failures_queue.into(),
            download,
        }
    }
}

#[async_trait]
impl Handler for DetectionStage {
    type Message = Task;

    fn stage(&self) -> &'static str {
        "detection"
    }

    async fn handle(&self, task: &Task) -> Result<()> {
        let image_id = task.image_id;
        debug!(image_id, image_ref = %task.image_ref, "detecting");

        let bytes = with_retry("download", self.download, || {
            self.source.fetch(&task.image_ref)
        })
        .await?;
        let (width, height) = crop::dimensions(&bytes)?;

        let candidates = self.worker.detect(bytes).await?.into_candidates()?;
        let raw = candidates.len();
        let kept = dedup_candidates(&candidates, &self.dedup)?;

        let result = DetectionResult {
            image_id,
            image_ref: task.image_ref.clone(),
            image_width: width,
            image_height: height,
            run: task.run,
            objects: kept.into_iter().map(DetectedObject::from).collect(),
        };
        publish_json(&*self.broker, &self.results_queue, &result).await?;

        info!(
            image_id,
            raw,
            kept = result.objects.len(),
            "detections published"
        );
        Ok(())
    }

    async fn abandon(&self, task: &Task, error: &Error) {
        warn!(image_id = task.image_id, "detection failed: {error}");
        notify_failure(
            &*self.broker,
            &self.failures_queue,
            task.image_id,
            task.run,
            self.stage(),
            error,
        )
        .await;
    }
}
