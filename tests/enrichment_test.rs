//! Integration tests for the enrichment stage with fake collaborators.

#![allow(clippy::unwrap_used)]

mod common;

use canopy::broker::Handler;
use canopy::dedup::BBox;
use canopy::messages::{DetectedObject, DetectionResult, FinalDescription};
use canopy::pipeline::{EnrichmentSettings, EnrichmentStage};
use canopy::retry::{Backoff, CallPolicy};
use canopy::services::{LocalStore, ObjectStore};
use canopy::{Error, broker::MemoryBroker};
use common::{ScriptedDescriber, StaticSource, png};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn policy(timeout: Duration) -> CallPolicy {
    CallPolicy {
        attempts: 1,
        timeout,
        backoff: Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(1),
        },
    }
}

fn settings() -> EnrichmentSettings {
    EnrichmentSettings {
        max_concurrency: 4,
        confidence_threshold: 20.0,
        prompt_id: "tree_health".to_string(),
        fragment_folder: "fragments".to_string(),
        jpeg_quality: 90,
        download: policy(Duration::from_secs(5)),
        describe: policy(Duration::from_millis(200)),
        storage: policy(Duration::from_secs(5)),
    }
}

fn stage(describer: Arc<ScriptedDescriber>, store: Arc<LocalStore>) -> EnrichmentStage {
    stage_on(&MemoryBroker::new(), describer, store)
}

fn stage_on(
    broker: &MemoryBroker,
    describer: Arc<ScriptedDescriber>,
    store: Arc<LocalStore>,
) -> EnrichmentStage {
    EnrichmentStage::new(
        Arc::new(broker.clone()),
        Arc::new(StaticSource {
            bytes: png(200, 100),
        }),
        describer,
        store,
        settings(),
        "descriptions",
        "failures",
    )
}

fn object(x1: f32, x2: f32, label: &str, confidence: f32) -> DetectedObject {
    DetectedObject {
        bbox: BBox::new(x1, 0.0, x2, 50.0),
        label: label.to_string(),
        confidence,
    }
}

fn result(objects: Vec<DetectedObject>) -> DetectionResult {
    DetectionResult {
        image_id: 7,
        image_ref: "file:///images/park.png".to_string(),
        image_width: 200,
        image_height: 100,
        run: 0,
        objects,
    }
}

#[tokio::test]
async fn test_timed_out_fragment_is_dropped_and_siblings_survive() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    // Crop widths identify fragments: 10, 20 and 30 pixels.
    let describer = Arc::new(ScriptedDescriber {
        hang_widths: vec![20],
        ..ScriptedDescriber::confident()
    });
    let stage = stage(Arc::clone(&describer), Arc::clone(&store));

    let description = stage
        .enrich(&result(vec![
            object(0.0, 10.0, "tree", 0.9),
            object(50.0, 70.0, "tree", 0.8),
            object(100.0, 130.0, "bush", 0.7),
        ]))
        .await
        .unwrap();

    assert_eq!(description.image_id, 7);
    let labels: Vec<(&str, f32)> = description
        .objects
        .iter()
        .map(|o| (o.label.as_str(), o.confidence))
        .collect();
    assert_eq!(labels, vec![("tree", 0.9), ("bush", 0.7)]);
    assert_eq!(describer.calls.load(Ordering::SeqCst), 3);

    for outcome in &description.objects {
        assert!(outcome.fragment_ref.starts_with("fragments/7/"));
        assert!(store.path_for(&outcome.fragment_ref).unwrap().exists());
    }
}

#[tokio::test]
async fn test_partial_failure_still_publishes_one_description() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let describer = Arc::new(ScriptedDescriber {
        hang_widths: vec![20],
        ..ScriptedDescriber::confident()
    });
    let broker = MemoryBroker::new();
    let stage = stage_on(&broker, Arc::clone(&describer), store);

    stage
        .handle(&result(vec![
            object(0.0, 10.0, "tree", 0.9),
            object(50.0, 70.0, "tree", 0.8),
            object(100.0, 130.0, "bush", 0.7),
        ]))
        .await
        .unwrap();

    let published = broker.drain("descriptions");
    assert_eq!(published.len(), 1);
    let description: FinalDescription = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(description.image_id, 7);
    assert_eq!(description.objects.len(), 2);
    assert!(broker.drain("failures").is_empty());
}

#[tokio::test]
async fn test_empty_detection_describes_whole_image() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let describer = Arc::new(ScriptedDescriber::confident());
    let stage = stage(Arc::clone(&describer), store);

    let description = stage.enrich(&result(Vec::new())).await.unwrap();

    assert_eq!(description.objects.len(), 1);
    let whole = &description.objects[0];
    assert_eq!(whole.bbox, BBox::new(0.0, 0.0, 200.0, 100.0));
    assert!((whole.confidence - 1.0).abs() < f32::EPSILON);
    assert!(whole.description.contains("overall_confidence"));
}

#[tokio::test]
async fn test_low_confidence_fragment_is_gated_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let mut describer = ScriptedDescriber::confident();
    describer.confidence_by_width.insert(10, 20.0);
    let stage = stage(Arc::new(describer), Arc::clone(&store));

    let description = stage
        .enrich(&result(vec![
            object(0.0, 10.0, "tree", 0.9),
            object(50.0, 80.0, "tree", 0.6),
        ]))
        .await
        .unwrap();

    // A confidence equal to the threshold is dropped.
    assert_eq!(description.objects.len(), 1);
    assert!((description.objects[0].confidence - 0.6).abs() < f32::EPSILON);

    // Only the kept crop was stored.
    let stored = std::fs::read_dir(dir.path().join("fragments").join("7"))
        .unwrap()
        .count();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn test_unparseable_description_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let describer = Arc::new(ScriptedDescriber {
        default_confidence: f64::NAN,
        ..ScriptedDescriber::default()
    });
    let stage = stage(describer, store);

    // NaN renders as invalid JSON, so the gate cannot read a confidence.
    let description = stage
        .enrich(&result(vec![object(0.0, 40.0, "tree", 0.9)]))
        .await
        .unwrap();
    assert_eq!(description.objects.len(), 1);
}

#[tokio::test]
async fn test_unfetchable_source_fails_the_message() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let describer = Arc::new(ScriptedDescriber::confident());
    let stage = stage(Arc::clone(&describer), store);

    let mut missing = result(vec![object(0.0, 10.0, "tree", 0.9)]);
    missing.image_ref = "missing".to_string();

    let err = stage.enrich(&missing).await.unwrap_err();
    assert!(matches!(err, Error::Fetch { transient: false, .. }));
    assert_eq!(describer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_redelivery_overwrites_fragment_objects() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()));
    let stage = stage(Arc::new(ScriptedDescriber::confident()), Arc::clone(&store));
    let message = result(vec![object(0.0, 40.0, "tree", 0.9)]);

    let first = stage.enrich(&message).await.unwrap();
    let second = stage.enrich(&message).await.unwrap();

    assert_eq!(first.objects[0].fragment_ref, second.objects[0].fragment_ref);
    assert!(store.delete(&first.objects[0].fragment_ref).await.unwrap());
}
