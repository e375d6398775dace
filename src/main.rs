use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dcm_export::anonymize::PersistOutcome;
use dcm_export::{BatchError, BatchSummary, ImageFormat, RunArgs, RunConfig};

const CONFIG_ERROR: u8 = 1;
const PARTIAL_FAILURE: u8 = 2;

#[derive(Parser)]
#[command(name = "dcm-export")]
#[command(about = "Export images and anonymized metadata from ophthalmic DICOM folders")]
#[command(version)]
struct Cli {
    /// Input directory containing DICOM folders
    #[arg(value_name = "INPUT_DIR")]
    input_dir: PathBuf,

    /// Image format for the extracted frames
    #[arg(short = 'f', long = "image_format", value_enum, default_value_t = ImageFormat::Png)]
    image_format: ImageFormat,

    /// Output directory
    #[arg(short = 'o', long = "output_dir", default_value = "exported_data")]
    output_dir: PathBuf,

    /// Group instances by acquisition time
    #[arg(short = 'g', long)]
    group: bool,

    /// Grouping tolerance in seconds (requires --group, default 2)
    #[arg(short = 't', long = "tol", allow_hyphen_values = true)]
    tol: Option<f64>,

    /// Number of folders processed in parallel
    #[arg(short = 'j', long = "n_jobs", default_value_t = 1)]
    n_jobs: usize,

    /// CSV with patient_id,study_id rows
    #[arg(short = 'm', long)]
    mapping: Option<PathBuf>,

    /// Fields kept as is: p (patient key), n (names), d (date of birth),
    /// D (year of birth), g (gender)
    #[arg(short = 'k', long, default_value = "")]
    keep: String,

    /// Re-export folders whose output already exists
    #[arg(short = 'w', long)]
    overwrite: bool,

    /// Empty the output directory before processing
    #[arg(short = 'r', long)]
    reset: bool,

    /// Only log warnings and errors, no progress bar
    #[arg(short = 'q', long)]
    quiet: bool,

    /// JSON file with extra modality rules, checked before the built-in ones
    #[arg(long)]
    rules: Option<PathBuf>,
}

impl From<Cli> for RunArgs {
    fn from(cli: Cli) -> Self {
        RunArgs {
            input_dir: cli.input_dir,
            output_dir: cli.output_dir,
            image_format: cli.image_format,
            group: cli.group,
            tolerance: cli.tol,
            n_jobs: cli.n_jobs,
            mapping: cli.mapping,
            keep: cli.keep,
            overwrite: cli.overwrite,
            reset: cli.reset,
            quiet: cli.quiet,
            rules: cli.rules,
        }
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_summary(summary: &BatchSummary, config: &RunConfig) {
    println!("\nProcessing Summary:");
    println!("   DICOM folders: {}", summary.total);
    println!("   Processed: {}", summary.processed);
    println!("   Skipped: {}", summary.skipped);
    println!("   Failed: {}", summary.failed);
    for failure in &summary.failures {
        println!("     - {}: {}", failure.folder.display(), failure.error);
    }
    match &summary.mapping {
        Some(PersistOutcome::Replaced { backup }) => println!(
            "   Patient mapping: {} (previous kept as {})",
            config.reserved_csv().display(),
            backup.display()
        ),
        Some(_) => println!("   Patient mapping: {}", config.reserved_csv().display()),
        None => {}
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let quiet = cli.quiet;
    let config = match RunConfig::from_args(cli.into()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::from(CONFIG_ERROR));
        }
    };
    let summary = dcm_export::run(&config)
        .with_context(|| format!("processing {}", config.input_dir.display()))?;
    if !quiet {
        print_summary(&summary, &config);
    }

    match summary.into_result() {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e @ BatchError::PartialFailure { .. }) => {
            error!("{e}");
            Ok(ExitCode::from(PARTIAL_FAILURE))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(PARTIAL_FAILURE)
        }
    }
}
