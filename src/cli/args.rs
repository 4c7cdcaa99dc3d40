//! CLI argument definitions.

use super::validators::{parse_confidence_threshold, parse_iou_threshold};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tree and bush detection with per-object health descriptions.
#[derive(Debug, Parser)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Options shared by every command.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every command.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Configuration file (default: platform config directory).
    #[arg(long, global = true, env = "CANOPY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Suppress progress output and informational logs.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run images through the full pipeline and write a report per image.
    Process(ProcessArgs),
    /// Deduplicate detections from a JSON file.
    Dedup(DedupArgs),
    /// Manage configuration.
    Config {
        /// Configuration action to perform.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommand actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Create default configuration file.
    Init,
    /// Display current configuration.
    Show,
    /// Print configuration file path.
    Path,
}

/// Arguments for the process command.
#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Input images or directories.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output directory for reports (default: next to each image).
    #[arg(short, long, env = "CANOPY_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Detection service endpoint (overrides config).
    #[arg(long, env = "CANOPY_DETECTOR_ENDPOINT")]
    pub detector_endpoint: Option<String>,

    /// Description service endpoint (overrides config).
    #[arg(long, env = "CANOPY_DESCRIBER_ENDPOINT")]
    pub describer_endpoint: Option<String>,

    /// Directory of the local object store (overrides config).
    #[arg(long, env = "CANOPY_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// Concurrent fragment tasks per image.
    #[arg(long, env = "CANOPY_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Drop fragments at or below this description confidence (0-100).
    #[arg(long, value_parser = parse_confidence_threshold, env = "CANOPY_CONFIDENCE_THRESHOLD")]
    pub confidence_threshold: Option<f64>,

    /// Maximum unacknowledged messages per stage.
    #[arg(long, env = "CANOPY_PREFETCH")]
    pub prefetch: Option<usize>,

    /// Reprocess images even if a report exists.
    #[arg(long)]
    pub force: bool,

    /// Disable the progress bar.
    #[arg(long)]
    pub no_progress: bool,
}

/// Arguments for the dedup command.
#[derive(Debug, Args)]
pub struct DedupArgs {
    /// JSON file with candidates (`[{bbox, label, score}]` or
    /// `{boxes, labels, scores}`); `-` reads stdin.
    pub input: PathBuf,

    /// Per-label IoU threshold (0.0-1.0).
    #[arg(long, value_parser = parse_iou_threshold)]
    pub iou_threshold: Option<f32>,

    /// Containment threshold; negative disables the rule.
    #[arg(long, allow_hyphen_values = true)]
    pub beta: Option<f32>,

    /// Cross-label IoU threshold; outside [0, 1) disables stage two.
    #[arg(long, allow_hyphen_values = true)]
    pub alpha: Option<f32>,

    /// Print kept indices instead of candidates.
    #[arg(long)]
    pub indices: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_process() {
        let cli = Cli::try_parse_from(["canopy", "process", "oak.jpg", "park/", "-q"]).unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        assert_eq!(args.inputs.len(), 2);
        assert!(cli.global.quiet);
    }

    #[test]
    fn test_cli_parse_process_requires_inputs() {
        assert!(Cli::try_parse_from(["canopy", "process"]).is_err());
    }

    #[test]
    fn test_cli_parse_process_overrides() {
        let cli = Cli::try_parse_from([
            "canopy",
            "process",
            "oak.jpg",
            "--confidence-threshold",
            "35",
            "--max-concurrency",
            "4",
            "--detector-endpoint",
            "http://localhost:9000/detect",
        ])
        .unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        assert_eq!(args.confidence_threshold, Some(35.0));
        assert_eq!(args.max_concurrency, Some(4));
        assert_eq!(
            args.detector_endpoint.as_deref(),
            Some("http://localhost:9000/detect")
        );
    }

    #[test]
    fn test_cli_rejects_out_of_range_threshold() {
        assert!(
            Cli::try_parse_from(["canopy", "process", "a.jpg", "--confidence-threshold", "120"])
                .is_err()
        );
    }

    #[test]
    fn test_cli_parse_dedup_with_negative_beta() {
        let cli = Cli::try_parse_from([
            "canopy",
            "dedup",
            "boxes.json",
            "--beta",
            "-1",
            "--alpha",
            "1.0",
        ])
        .unwrap();
        let Command::Dedup(args) = cli.command else {
            panic!("expected dedup command");
        };
        assert_eq!(args.beta, Some(-1.0));
        assert_eq!(args.alpha, Some(1.0));
    }

    #[test]
    fn test_cli_parse_config_subcommand() {
        let cli = Cli::try_parse_from(["canopy", "-v", "config", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::Show
            }
        ));
        assert_eq!(cli.global.verbose, 1);
    }
}
