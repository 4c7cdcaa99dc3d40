//! Error types for canopy.

use std::time::Duration;

/// Result type alias for canopy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for canopy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration directory could not be determined.
    #[error("could not determine configuration directory for this platform")]
    ConfigDirNotFound,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}'")]
    ConfigRead {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("failed to parse config file '{path}'")]
    ConfigParse {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// Failed to write configuration file.
    #[error("failed to write config file '{path}'")]
    ConfigWrite {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize configuration.
    #[error("failed to serialize config")]
    ConfigSerialize {
        /// Underlying serialization error.
        #[source]
        source: toml::ser::Error,
    },

    /// No supported image files were found in the inputs.
    #[error("no valid image files found in the provided paths")]
    NoValidImageFiles,

    /// Image file is larger than the configured limit.
    #[error("image '{path}' is {size} bytes, limit is {limit} bytes")]
    ImageTooLarge {
        /// Path to the image file.
        path: std::path::PathBuf,
        /// Actual size in bytes.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// Dedup inputs have inconsistent lengths.
    #[error("dedup input mismatch: {boxes} boxes, {scores} scores, {labels} labels")]
    DedupInput {
        /// Number of boxes.
        boxes: usize,
        /// Number of scores.
        scores: usize,
        /// Number of labels.
        labels: usize,
    },

    /// A queue message could not be decoded.
    #[error("malformed message on queue '{queue}': {source}")]
    MalformedMessage {
        /// Queue the message arrived on.
        queue: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to encode a message or payload as JSON.
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker refused or lost a publish.
    #[error("failed to publish to queue '{queue}': {reason}")]
    Publish {
        /// Destination queue.
        queue: String,
        /// Description of the failure.
        reason: String,
    },

    /// The broker has been shut down.
    #[error("broker is closed")]
    BrokerClosed,

    /// Failed to fetch the source image.
    #[error("failed to fetch image '{reference}'")]
    Fetch {
        /// URL or path of the image.
        reference: String,
        /// Whether a retry may succeed.
        transient: bool,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// HTTP request to a collaborator failed.
    #[error("HTTP request to '{url}' failed")]
    Http {
        /// Request URL.
        url: String,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Collaborator returned a non-success HTTP status.
    #[error("'{url}' returned HTTP {status}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// Failed to decode image bytes.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// Bounding box is empty after clamping to the image.
    #[error("bbox {bbox:?} is empty inside a {width}x{height} image")]
    EmptyCrop {
        /// Requested box.
        bbox: [f32; 4],
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },

    /// Detection collaborator failed.
    #[error("detection failed: {reason}")]
    Detection {
        /// Description of the failure.
        reason: String,
    },

    /// Detection collaborator is not ready yet.
    #[error("detector is not warmed up")]
    DetectorNotReady,

    /// Description collaborator failed or returned an unusable response.
    #[error("description failed: {reason}")]
    Description {
        /// Description of the failure.
        reason: String,
    },

    /// Object storage operation failed.
    #[error("storage operation on '{key}' failed")]
    Storage {
        /// Object key.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// External call exceeded its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the timed-out operation.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Image record does not exist.
    #[error("image {id} not found")]
    ImageNotFound {
        /// Image identifier.
        id: u64,
    },

    /// Lifecycle transition is not allowed.
    #[error("image {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Image identifier.
        id: u64,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Persistence collaborator failed.
    #[error("persistence failed: {reason}")]
    Persistence {
        /// Description of the failure.
        reason: String,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the error.
        message: String,
    },
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Timeouts, connection failures, 5xx/429 responses and storage I/O are
    /// transient. Malformed input, decode failures and lifecycle violations
    /// are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Storage { .. } => true,
            Self::Fetch { transient, .. } => *transient,
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Publish { .. } | Self::DetectorNotReady => true,
            _ => false,
        }
    }
}
