//! Application-wide constants.
//!
//! All magic numbers and strings are defined here to ensure consistency
//! and make changes easy to track.

/// Application name used for config directories and user-facing messages.
pub const APP_NAME: &str = "canopy";

/// Dedup engine defaults.
///
/// The thresholds were tuned against field photographs of urban trees, where
/// trunks nest inside crowns and GroundingDINO-style detectors emit several
/// near-identical boxes per object.
pub mod dedup {
    /// Per-label IoU threshold above which the lower-scoring box is removed.
    pub const DEFAULT_IOU_THRESHOLD: f32 = 0.85;

    /// Containment ratio at or above which a nested box is removed.
    pub const DEFAULT_CONTAINMENT_BETA: f32 = 0.95;

    /// Cross-label IoU threshold.
    pub const DEFAULT_CROSS_CLASS_ALPHA: f32 = 0.74;

    /// Added to every denominator so degenerate boxes never divide by zero.
    pub const EPSILON: f32 = 1e-9;
}

/// Queue names and broker defaults.
pub mod queues {
    /// Image task queue consumed by the detection stage.
    pub const TASKS: &str = "image_tasks";

    /// Detection results consumed by the enrichment stage.
    pub const DETECTION_RESULTS: &str = "image_results";

    /// Final descriptions consumed by the status consumer.
    pub const DESCRIPTIONS: &str = "image_descriptions";

    /// Failure notices consumed by the status consumer.
    pub const FAILURES: &str = "image_failures";

    /// Suffix appended to a queue name to form its dead-letter queue.
    pub const DEAD_LETTER_SUFFIX: &str = ".dead";

    /// Maximum unacknowledged deliveries per consumer.
    pub const DEFAULT_PREFETCH: usize = 10;
}

/// Enrichment stage defaults.
pub mod enrichment {
    /// Maximum concurrent fragment tasks per message.
    ///
    /// Matches the size of the shared outbound connection pool.
    pub const DEFAULT_MAX_CONCURRENCY: usize = 20;

    /// Fragments at or below this `overall_confidence` are dropped.
    pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 20.0;

    /// Prompt identifier sent with every description call.
    pub const DEFAULT_PROMPT_ID: &str = "tree-health-v1";

    /// Storage folder for fragment crops.
    pub const FRAGMENT_FOLDER: &str = "fragments";

    /// JPEG quality for encoded crops.
    pub const JPEG_QUALITY: u8 = 95;

    /// Label of the synthetic fragment covering the whole image.
    pub const WHOLE_IMAGE_LABEL: &str = "whole_image";

    /// Content type of encoded crops.
    pub const CROP_CONTENT_TYPE: &str = "image/jpeg";
}

/// Timeouts for external calls, in seconds.
pub mod timeouts {
    /// Source image download.
    pub const DOWNLOAD_SECS: u64 = 60;

    /// Single description call.
    pub const DESCRIBE_SECS: u64 = 120;

    /// Single storage write.
    pub const STORAGE_SECS: u64 = 30;

    /// Single detection call.
    pub const DETECT_SECS: u64 = 300;

    /// HTTP connect timeout shared by all clients.
    pub const CONNECT_SECS: u64 = 30;
}

/// Retry policy defaults.
pub mod retry {
    /// Attempts per external call inside a unit of work.
    pub const DEFAULT_CALL_ATTEMPTS: u32 = 3;

    /// Deliveries per message before it is dead-lettered.
    pub const DEFAULT_MESSAGE_ATTEMPTS: u32 = 3;

    /// First backoff delay in milliseconds.
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;

    /// Backoff ceiling in milliseconds.
    pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;
}

/// Image ingestion limits.
pub mod ingest {
    /// Maximum accepted file size in bytes (50 MiB).
    pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

    /// Storage folder for uploaded source images.
    pub const IMAGE_FOLDER: &str = "images";

    /// Supported image file extensions.
    pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];
}

/// Confidence bounds for description payloads.
pub mod confidence {
    /// Minimum valid `overall_confidence`.
    pub const MIN: f64 = 0.0;
    /// Maximum valid `overall_confidence`.
    pub const MAX: f64 = 100.0;
}

/// Signed URL lifetime in seconds.
pub const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 3_600;

/// Bounded queue depth in front of the inference worker.
pub const INFERENCE_QUEUE_DEPTH: usize = 4;

/// Suffix for per-image JSON reports written by `canopy process`.
pub const REPORT_EXTENSION: &str = ".canopy.json";
