//! Queue-driven processing stages.
//!
//! `tasks → detection → detection results → enrichment → descriptions →
//! status`. Each stage is a [`Handler`](crate::broker::Handler) run by its own
//! consumer loop; no stage calls another directly.

mod coordinator;
pub mod crop;
mod detection;
mod enrichment;
pub mod gate;
mod runner;
mod status;
mod submit;

pub use coordinator::{
    IngestOptions, collect_input_files, ingest_image, is_image_file, output_dir_for,
    report_path_for, should_process,
};
pub use detection::{DetectionStage, InferenceWorker};
pub use enrichment::{EnrichmentSettings, EnrichmentStage};
pub use runner::Pipeline;
pub use status::{FailureConsumer, StatusConsumer};
pub use submit::TaskPublisher;

use crate::broker::{Broker, publish_json};
use crate::error::Error;
use crate::messages::{FailureNotice, ImageId, RunId};
use tracing::error;

/// Tell the status consumer that `stage` gave up on `image_id`.
///
/// Publish errors are logged; the original message is dead-lettered either
/// way.
pub(crate) async fn notify_failure(
    broker: &dyn Broker,
    queue: &str,
    image_id: ImageId,
    run: RunId,
    stage: &str,
    cause: &Error,
) {
    let notice = FailureNotice {
        image_id,
        run,
        stage: stage.to_string(),
        reason: cause.to_string(),
    };
    if let Err(e) = publish_json(broker, queue, &notice).await {
        error!(image_id, stage, "failed to publish failure notice: {e}");
    }
}
