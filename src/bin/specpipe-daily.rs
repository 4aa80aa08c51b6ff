//! # specpipe-daily
//!
//! The nightly operations entry point: watch for new exposures, classify
//! and route them, submit processing and joint-calibration jobs, and keep
//! the exposure/processing tables persisted. The exit code is the number
//! of failed joint-fit submissions, so wrapping scripts can detect a
//! partially-degraded night.

use clap::Parser;
use specpipe_core::camword::parse_cameras;
use specpipe_core::config::PipelineConfig;
use specpipe_core::constants::scheduling;
use specpipe_core::error::SpecpipeError;
use specpipe_core::manager::{DailyManagerOptions, DailyProcessingManager};
use std::collections::BTreeSet;
use std::process;

#[derive(Parser)]
#[command(name = "specpipe-daily")]
#[command(about = "Daily processing manager for the spectrograph reduction pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// 8-digit night to run on instead of the current night
    #[arg(short, long)]
    night: Option<i64>,

    /// Camword restricting the cameras to process, e.g. a0123456789
    #[arg(long)]
    camword: Option<String>,

    /// Camword of cameras to exclude from processing
    #[arg(long)]
    badcamword: Option<String>,

    /// Comma separated list of bad amplifiers, e.g. b7D,z8A
    #[arg(long)]
    badamps: Option<String>,

    /// Exposure ids that should not be processed
    #[arg(long, value_delimiter = ',')]
    ignore_expids: Vec<i64>,

    /// Redshift group types to submit with science tiles
    #[arg(long, value_delimiter = ',')]
    z_submit_types: Vec<String>,

    /// Do not submit redshifts
    #[arg(long)]
    no_redshifts: bool,

    /// 0 live, 1 simulate submission, 2 simulate without script generation
    #[arg(long, default_value_t = 0)]
    dry_run_level: u8,

    /// Keep looping for new data on an override night (debug)
    #[arg(long)]
    continue_looping_debug: bool,

    /// Do not check for existing outputs before submitting
    #[arg(long)]
    dont_check_job_outputs: bool,

    /// Do not prune partially-complete jobs to their missing cameras
    #[arg(long)]
    dont_resubmit_partial_jobs: bool,

    /// Seconds between scans for new data
    #[arg(long)]
    data_cadence: Option<u64>,

    /// Seconds between batch-queue reconciliation passes
    #[arg(long)]
    queue_cadence: Option<u64>,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    specpipe_core::logging::init_logging(None);

    let code = match run(cli).await {
        Ok(joint_failures) => joint_failures.min(i32::MAX as u32) as i32,
        Err(e) => {
            tracing::error!(error = %e, "specpipe-daily failed");
            match e {
                SpecpipeError::ConfigurationError(_) | SpecpipeError::CamwordError(_) => {
                    scheduling::EXIT_BAD_CONFIG
                }
                _ => 1,
            }
        }
    };
    process::exit(code);
}

async fn run(cli: Cli) -> specpipe_core::Result<u32> {
    let config = PipelineConfig::load(cli.config.as_deref())?;

    let camword = cli.camword.as_deref().map(parse_cameras).transpose()?;
    let badcamword = cli.badcamword.as_deref().map(parse_cameras).transpose()?;

    let options = DailyManagerOptions {
        override_night: cli.night,
        camword,
        badcamword,
        badamps: cli.badamps,
        exps_to_ignore: cli.ignore_expids.into_iter().collect::<BTreeSet<_>>(),
        exp_obstypes: None,
        proc_obstypes: None,
        z_submit_types: if cli.z_submit_types.is_empty() {
            None
        } else {
            Some(cli.z_submit_types)
        },
        no_redshifts: cli.no_redshifts,
        dry_run_level: cli.dry_run_level,
        continue_looping_debug: cli.continue_looping_debug,
        dont_check_job_outputs: cli.dont_check_job_outputs,
        dont_resubmit_partial_jobs: cli.dont_resubmit_partial_jobs,
        data_cadence_secs: cli.data_cadence,
        queue_cadence_secs: cli.queue_cadence,
    };

    let mut manager = DailyProcessingManager::new(config, options)?;
    manager.run().await
}
