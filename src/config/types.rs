//! Configuration type definitions.

use crate::constants::{dedup, enrichment, ingest, queues, retry, timeouts};
use crate::dedup::DedupParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Duplicate suppression thresholds.
    pub dedup: DedupConfig,

    /// Queue names and consumer settings.
    pub queues: QueueConfig,

    /// Enrichment stage settings.
    pub enrichment: EnrichmentConfig,

    /// Deadlines for external calls.
    pub timeouts: TimeoutConfig,

    /// Retry and dead-letter policy.
    pub retry: RetryConfig,

    /// Detection service settings.
    pub detector: DetectorConfig,

    /// Description service settings.
    pub describer: DescriberConfig,

    /// Object storage settings.
    pub storage: StorageConfig,
}

/// Duplicate suppression thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    /// Per-label IoU threshold.
    pub iou_threshold: f32,

    /// Containment ratio threshold; negative disables the rule.
    pub containment_beta: f32,

    /// Cross-label IoU threshold; outside `[0, 1)` disables stage two.
    pub cross_class_alpha: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            iou_threshold: dedup::DEFAULT_IOU_THRESHOLD,
            containment_beta: dedup::DEFAULT_CONTAINMENT_BETA,
            cross_class_alpha: dedup::DEFAULT_CROSS_CLASS_ALPHA,
        }
    }
}

impl From<DedupConfig> for DedupParams {
    fn from(config: DedupConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            beta: config.containment_beta,
            alpha_all_classes: config.cross_class_alpha,
        }
    }
}

/// Queue names and consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Task queue.
    pub tasks: String,
    /// Detection result queue.
    pub detection_results: String,
    /// Final description queue.
    pub descriptions: String,
    /// Failure notice queue.
    pub failures: String,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tasks: queues::TASKS.to_string(),
            detection_results: queues::DETECTION_RESULTS.to_string(),
            descriptions: queues::DESCRIPTIONS.to_string(),
            failures: queues::FAILURES.to_string(),
            prefetch: queues::DEFAULT_PREFETCH,
        }
    }
}

/// Enrichment stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Maximum concurrent fragment tasks per message.
    pub max_concurrency: usize,
    /// Fragments at or below this confidence (0-100) are dropped.
    pub confidence_threshold: f64,
    /// Prompt identifier passed to the describer.
    pub prompt_id: String,
    /// Storage folder for fragment crops.
    pub fragment_folder: String,
    /// JPEG quality for crops (1-100).
    pub jpeg_quality: u8,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_concurrency: enrichment::DEFAULT_MAX_CONCURRENCY,
            confidence_threshold: enrichment::DEFAULT_CONFIDENCE_THRESHOLD,
            prompt_id: enrichment::DEFAULT_PROMPT_ID.to_string(),
            fragment_folder: enrichment::FRAGMENT_FOLDER.to_string(),
            jpeg_quality: enrichment::JPEG_QUALITY,
        }
    }
}

/// Deadlines for external calls, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Source image download.
    pub download_secs: u64,
    /// Single description call.
    pub describe_secs: u64,
    /// Single storage write.
    pub storage_secs: u64,
    /// Single detection call.
    pub detect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_secs: timeouts::DOWNLOAD_SECS,
            describe_secs: timeouts::DESCRIBE_SECS,
            storage_secs: timeouts::STORAGE_SECS,
            detect_secs: timeouts::DETECT_SECS,
        }
    }
}

impl TimeoutConfig {
    /// Download deadline.
    pub const fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    /// Describe deadline.
    pub const fn describe(&self) -> Duration {
        Duration::from_secs(self.describe_secs)
    }

    /// Storage deadline.
    pub const fn storage(&self) -> Duration {
        Duration::from_secs(self.storage_secs)
    }

    /// Detection deadline.
    pub const fn detect(&self) -> Duration {
        Duration::from_secs(self.detect_secs)
    }
}

/// Retry and dead-letter policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per external call inside a unit of work.
    pub call_attempts: u32,
    /// Deliveries per message before dead-lettering.
    pub message_max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            call_attempts: retry::DEFAULT_CALL_ATTEMPTS,
            message_max_attempts: retry::DEFAULT_MESSAGE_ATTEMPTS,
            initial_backoff_ms: retry::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: retry::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

/// Detection service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Detection endpoint accepting raw image bytes.
    pub endpoint: Option<String>,
    /// Extra query parameters forwarded to the endpoint (e.g. `box_threshold`).
    pub params: HashMap<String, String>,
}

/// Description service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriberConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    /// Vision-language model name.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Maximum tokens in a response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Prompt text by prompt identifier.
    pub prompts: HashMap<String, String>,
}

impl Default for DescriberConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://integrate.api.nvidia.com/v1/chat/completions".to_string(),
            model: "meta/llama-3.2-90b-vision-instruct".to_string(),
            api_key_env: "CANOPY_DESCRIBER_API_KEY".to_string(),
            max_tokens: 512,
            temperature: 1.0,
            prompts: HashMap::new(),
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the local object store (None = platform data dir).
    pub root: Option<PathBuf>,
    /// Lifetime of signed URLs in seconds.
    pub signed_url_ttl_secs: u64,
    /// Maximum accepted source image size in bytes.
    pub max_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            signed_url_ttl_secs: crate::constants::DEFAULT_SIGNED_URL_TTL_SECS,
            max_file_size: ingest::MAX_FILE_SIZE,
        }
    }
}
