//! Configuration validation.

use crate::config::Config;
use crate::constants::confidence;
use crate::error::{Error, Result};

/// Validate the entire configuration.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_dedup(config)?;
    validate_queues(config)?;
    validate_enrichment(config)?;
    validate_retry(config)?;
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::ConfigValidation { message }
}

/// Validate dedup thresholds.
fn validate_dedup(config: &Config) -> Result<()> {
    let dedup = &config.dedup;

    if !(0.0..=1.0).contains(&dedup.iou_threshold) {
        return Err(invalid(format!(
            "dedup.iou_threshold must be between 0 and 1, got {}",
            dedup.iou_threshold
        )));
    }

    // Negative beta disables containment; anything above 1 can never fire.
    if dedup.containment_beta > 1.0 {
        return Err(invalid(format!(
            "dedup.containment_beta must be at most 1 (negative disables), got {}",
            dedup.containment_beta
        )));
    }

    if dedup.cross_class_alpha.is_nan() || dedup.iou_threshold.is_nan() {
        return Err(invalid("dedup thresholds must be numbers".to_string()));
    }

    Ok(())
}

fn validate_queues(config: &Config) -> Result<()> {
    let queues = &config.queues;

    if queues.prefetch == 0 {
        return Err(invalid("queues.prefetch must be at least 1".to_string()));
    }

    let names = [
        &queues.tasks,
        &queues.detection_results,
        &queues.descriptions,
        &queues.failures,
    ];
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(invalid("queue names must not be empty".to_string()));
        }
        if names[..i].contains(name) {
            return Err(invalid(format!("queue '{name}' is configured twice")));
        }
    }

    Ok(())
}

fn validate_enrichment(config: &Config) -> Result<()> {
    let enrichment = &config.enrichment;

    if enrichment.max_concurrency == 0 {
        return Err(invalid(
            "enrichment.max_concurrency must be at least 1".to_string(),
        ));
    }

    if !(confidence::MIN..=confidence::MAX).contains(&enrichment.confidence_threshold) {
        return Err(invalid(format!(
            "enrichment.confidence_threshold must be between {} and {}, got {}",
            confidence::MIN,
            confidence::MAX,
            enrichment.confidence_threshold
        )));
    }

    if !(1..=100).contains(&enrichment.jpeg_quality) {
        return Err(invalid(format!(
            "enrichment.jpeg_quality must be between 1 and 100, got {}",
            enrichment.jpeg_quality
        )));
    }

    Ok(())
}

fn validate_retry(config: &Config) -> Result<()> {
    let retry = &config.retry;

    if retry.call_attempts == 0 || retry.message_max_attempts == 0 {
        return Err(invalid("retry attempts must be at least 1".to_string()));
    }

    if retry.initial_backoff_ms > retry.max_backoff_ms {
        return Err(invalid(format!(
            "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
            retry.initial_backoff_ms, retry.max_backoff_ms
        )));
    }

    Ok(())
}
