//! Canopy - queue-orchestrated tree detection and enrichment.
//!
//! Photographs of trees and bushes flow through durable queues: a detection
//! stage finds and deduplicates objects, an enrichment stage describes each
//! one with a vision-language model, and a status consumer records the
//! result.

#![warn(missing_docs)]

pub mod broker;
pub mod cli;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod health;
pub mod messages;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod services;

use broker::MemoryBroker;
use clap::Parser;
use cli::{Cli, Command, ConfigAction, DedupArgs, ProcessArgs};
use config::{Config, config_file_path, load_config_file, save_config, validate_config};
use dedup::{BBox, DedupParams, DetectionCandidate, dedup};
use health::Health;
use messages::ImageId;
use pipeline::{
    IngestOptions, Pipeline, TaskPublisher, collect_input_files, ingest_image, output_dir_for,
    report_path_for, should_process,
};
use serde::Deserialize;
use services::{ImageRepository, ImageStatus, build_services};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub use error::{Error, Result};

/// Set by the Ctrl+C handler; a running pipeline drains and stops.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Main entry point for the canopy CLI.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet);

    // First Ctrl+C drains the pipeline, a second one exits immediately.
    if let Err(e) = ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) {
            std::process::exit(130); // 128 + SIGINT(2)
        }
        eprintln!("Shutting down, press Ctrl+C again to abort");
    }) {
        warn!("Failed to install Ctrl+C handler: {e}");
    }

    let config_path = match &cli.global.config {
        Some(path) => path.clone(),
        None => config_file_path()?,
    };
    let config = load_config_file(&config_path)?;

    handle_command(cli.command, config, &config_path, cli.global.quiet)
}

fn init_logging(verbose: u8, quiet: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    // reqwest/hyper are chatty at debug; keep them at warn unless -vv.
    let filter_str = if quiet {
        "warn".to_string()
    } else {
        match verbose {
            0 => "info".to_string(),
            1 => "debug,hyper=warn,reqwest=warn".to_string(),
            _ => "trace".to_string(),
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn handle_command(command: Command, config: Config, config_path: &Path, quiet: bool) -> Result<()> {
    match command {
        Command::Process(args) => {
            let config = apply_process_overrides(config, &args);
            validate_config(&config)?;
            process_files(&args, &config, quiet)
        }
        Command::Dedup(args) => {
            validate_config(&config)?;
            run_dedup(&args, &config)
        }
        Command::Config { action } => handle_config_command(action, &config, config_path),
    }
}

fn apply_process_overrides(mut config: Config, args: &ProcessArgs) -> Config {
    if let Some(endpoint) = &args.detector_endpoint {
        config.detector.endpoint = Some(endpoint.clone());
    }
    if let Some(endpoint) = &args.describer_endpoint {
        config.describer.endpoint.clone_from(endpoint);
    }
    if let Some(root) = &args.storage_root {
        config.storage.root = Some(root.clone());
    }
    if let Some(n) = args.max_concurrency {
        config.enrichment.max_concurrency = n;
    }
    if let Some(threshold) = args.confidence_threshold {
        config.enrichment.confidence_threshold = threshold;
    }
    if let Some(prefetch) = args.prefetch {
        config.queues.prefetch = prefetch;
    }
    config
}

fn handle_config_command(action: ConfigAction, config: &Config, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => {
            if path.exists() {
                println!("Configuration file already exists: {}", path.display());
            } else {
                save_config(&Config::default(), path)?;
                println!("Created configuration file: {}", path.display());
                println!("\nNext steps:");
                println!("  set detector.endpoint, then run: canopy process <images>");
            }
            Ok(())
        }
        ConfigAction::Show => {
            let rendered =
                toml::to_string_pretty(config).map_err(|e| Error::ConfigSerialize { source: e })?;
            println!("{rendered}");
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Input accepted by `canopy dedup`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DedupInput {
    Candidates(Vec<DetectionCandidate>),
    Arrays {
        boxes: Vec<[f32; 4]>,
        scores: Vec<f32>,
        labels: Vec<String>,
    },
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut contents = String::new();
        std::io::stdin().read_to_string(&mut contents)?;
        Ok(contents)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

fn run_dedup(args: &DedupArgs, config: &Config) -> Result<()> {
    let mut params = DedupParams::from(config.dedup);
    if let Some(iou) = args.iou_threshold {
        params.iou_threshold = iou;
    }
    if let Some(beta) = args.beta {
        params.beta = beta;
    }
    if let Some(alpha) = args.alpha {
        params.alpha_all_classes = alpha;
    }

    let input: DedupInput = serde_json::from_str(&read_input(&args.input)?)?;
    let (boxes, scores, labels): (Vec<BBox>, Vec<f32>, Vec<String>) = match input {
        DedupInput::Candidates(candidates) => (
            candidates.iter().map(|c| c.bbox).collect(),
            candidates.iter().map(|c| c.score).collect(),
            candidates.into_iter().map(|c| c.label).collect(),
        ),
        DedupInput::Arrays {
            boxes,
            scores,
            labels,
        } => (boxes.into_iter().map(BBox::from).collect(), scores, labels),
    };

    let kept = dedup(&boxes, &scores, &labels, &params)?;
    info!(input = boxes.len(), kept = kept.len(), "dedup complete");

    let output = if args.indices {
        serde_json::to_string(&kept)?
    } else {
        let survivors: Vec<DetectionCandidate> = kept
            .iter()
            .map(|&i| DetectionCandidate {
                bbox: boxes[i],
                label: labels[i].clone(),
                score: scores[i],
            })
            .collect();
        serde_json::to_string_pretty(&survivors)?
    };
    println!("{output}");
    Ok(())
}

/// Process input images end to end with an in-process broker.
fn process_files(args: &ProcessArgs, config: &Config, quiet: bool) -> Result<()> {
    let files = collect_input_files(&args.inputs)?;
    if files.is_empty() {
        return Err(Error::NoValidImageFiles);
    }

    let mut skipped = 0;
    let files: Vec<(PathBuf, PathBuf)> = files
        .into_iter()
        .filter_map(|file| {
            let output_dir = output_dir_for(&file, args.output_dir.as_deref());
            if should_process(&file, &output_dir, args.force) {
                Some((file, output_dir))
            } else {
                info!("Skipping (report exists): {}", file.display());
                skipped += 1;
                None
            }
        })
        .collect();

    if files.is_empty() {
        info!("Nothing to do: {skipped} image(s) already processed");
        return Ok(());
    }
    info!("Found {} image(s) to process", files.len());

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal {
        message: format!("Failed to create async runtime: {e}"),
    })?;
    let progress_enabled = !quiet && !args.no_progress;
    runtime.block_on(run_local(files, config, progress_enabled))
}

async fn run_local(
    files: Vec<(PathBuf, PathBuf)>,
    config: &Config,
    progress_enabled: bool,
) -> Result<()> {
    use crate::output::{ImageReport, progress};

    let started = Instant::now();
    let broker = MemoryBroker::new();
    let services = build_services(config, Arc::new(broker.clone()))?;
    let repository = Arc::clone(&services.repository);

    let health = Arc::new(Health::default());
    let pipeline = Pipeline::start(&services, config, Arc::clone(&health)).await?;
    let publisher = TaskPublisher::new(
        Arc::clone(&services.broker),
        Arc::clone(&repository),
        &config.queues.tasks,
    );

    let ingest = IngestOptions {
        max_file_size: config.storage.max_file_size,
    };
    let mut submitted: BTreeMap<ImageId, (PathBuf, PathBuf)> = BTreeMap::new();
    let mut errors = 0;

    for (file, output_dir) in files {
        let outcome = async {
            let image = ingest_image(&file, &*services.store, &*repository, ingest).await?;
            publisher.submit(image.id).await?;
            Ok::<_, Error>(image.id)
        }
        .await;

        match outcome {
            Ok(id) => {
                submitted.insert(id, (file, output_dir));
            }
            Err(e) => {
                error!("Failed to submit {}: {e}", file.display());
                errors += 1;
            }
        }
    }

    let bar = progress::create_image_progress(submitted.len(), progress_enabled);
    let ids: Vec<ImageId> = submitted.keys().copied().collect();
    let interrupted = wait_for_images(&*repository, &ids, bar.as_ref()).await?;
    progress::finish_progress(bar, if interrupted { "Interrupted" } else { "Complete" });

    broker.close();
    pipeline.join().await?;

    let mut completed = 0;
    let mut failed = 0;
    for (id, (file, output_dir)) in &submitted {
        let Some(image) = repository.get_image(*id).await? else {
            continue;
        };
        match image.status {
            ImageStatus::Completed => completed += 1,
            ImageStatus::Failed => failed += 1,
            _ => continue,
        }

        let fragments = repository.list_fragments(*id).await?;
        std::fs::create_dir_all(output_dir)?;
        let report_path = report_path_for(file, output_dir);
        let source = file.file_name().map_or_else(
            || file.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        );
        ImageReport::new(&source, image, fragments).write(&report_path)?;
    }

    let report = health.report();
    info!(
        "Stage counters: {}",
        serde_json::to_string(&report).unwrap_or_default()
    );
    info!(
        "Complete: {} completed, {} failed, {} not submitted in {:.2}s",
        completed,
        failed,
        errors,
        started.elapsed().as_secs_f64()
    );
    if failed > 0 || errors > 0 {
        warn!("{} image(s) had errors", failed + errors);
    }

    Ok(())
}

/// Poll until every image is terminal or shutdown is requested.
///
/// Returns `true` when interrupted.
async fn wait_for_images(
    repository: &dyn ImageRepository,
    ids: &[ImageId],
    bar: Option<&indicatif::ProgressBar>,
) -> Result<bool> {
    loop {
        let mut finished = 0;
        for id in ids {
            if repository
                .get_image(*id)
                .await?
                .is_some_and(|image| image.status.is_terminal())
            {
                finished += 1;
            }
        }
        output::progress::set_progress(bar, finished);

        if finished == ids.len() {
            return Ok(false);
        }
        if SHUTDOWN.load(Ordering::SeqCst) {
            warn!("Interrupted with {} image(s) unfinished", ids.len() - finished);
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
