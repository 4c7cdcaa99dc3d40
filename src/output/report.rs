//! Per-image JSON report written by `canopy process`.

use crate::error::Result;
use crate::services::{FragmentRecord, ImageRecord, ImageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Report file structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageReport {
    /// Source file name.
    pub source_file: String,
    /// Report timestamp.
    pub generated_at: DateTime<Utc>,
    /// Final image record.
    pub image: ImageRecord,
    /// Fragments created for the image.
    pub fragments: Vec<FragmentRecord>,
    /// Summary statistics.
    pub summary: ReportSummary,
}

/// Summary statistics.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Final lifecycle state.
    pub status: ImageStatus,
    /// Number of fragments kept.
    pub total_fragments: usize,
    /// Number of distinct labels among the fragments.
    pub unique_labels: usize,
}

impl ImageReport {
    /// Build a report for `image`.
    pub fn new(source_file: &str, image: ImageRecord, fragments: Vec<FragmentRecord>) -> Self {
        let mut labels: Vec<&str> = fragments.iter().map(|f| f.label.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();

        let summary = ReportSummary {
            status: image.status,
            total_fragments: fragments.len(),
            unique_labels: labels.len(),
        };

        Self {
            source_file: source_file.to_string(),
            generated_at: Utc::now(),
            image,
            fragments,
            summary,
        }
    }

    /// Write the report as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image() -> ImageRecord {
        let now = Utc::now();
        ImageRecord {
            id: 1,
            file_name: "oak.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            file_size: 3,
            storage_key: "images/x.jpg".to_string(),
            image_ref: "file:///x.jpg".to_string(),
            width: 10,
            height: 10,
            status: ImageStatus::Completed,
            run: 0,
            detected_objects: None,
            description_text: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn fragment(id: u64, label: &str) -> FragmentRecord {
        FragmentRecord {
            id,
            image_id: 1,
            storage_ref: "fragments/1/a.jpg".to_string(),
            label: label.to_string(),
            confidence: 0.5,
            position_x: 0.0,
            position_y: 0.0,
            width: 1.0,
            height: 1.0,
            description: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_counts_labels() {
        let report = ImageReport::new(
            "oak.jpg",
            image(),
            vec![fragment(1, "tree"), fragment(2, "tree"), fragment(3, "bush")],
        );
        assert_eq!(report.summary.total_fragments, 3);
        assert_eq!(report.summary.unique_labels, 2);
        assert_eq!(report.summary.status, ImageStatus::Completed);
    }

    #[test]
    fn test_write_round_trips_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oak.canopy.json");
        ImageReport::new("oak.jpg", image(), Vec::new())
            .write(&path)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["status"], "completed");
        assert_eq!(json["image"]["file_name"], "oak.jpg");
    }
}
