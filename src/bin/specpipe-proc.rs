//! # specpipe-proc
//!
//! One-stop processing of a single exposure: run the obstype-conditioned
//! stage sequence in place, or generate and submit a batch script that
//! does. Joint calibration products (psfnight, nightlyflat, stdstarfit)
//! are produced with `--joint` over the member exposure ids.

use clap::Parser;
use specpipe_core::batch::{batch_config, create_batch_script, determine_resources, SlurmQueue, BatchQueue};
use specpipe_core::camword::parse_cameras;
use specpipe_core::config::PipelineConfig;
use specpipe_core::constants::{scheduling, ObsType};
use specpipe_core::error::SpecpipeError;
use specpipe_core::exec::{CommandRunner, DryRunRunner, ProcessRunner};
use specpipe_core::models::processing::{JobDesc, ProcessingRow};
use specpipe_core::models::exposure::NO_TILEID;
use specpipe_core::proc::{ExposurePipeline, ProcOptions};
use specpipe_core::state_machine::TaskState;
use specpipe_core::tasks::{TaskContext, TaskProps, TaskRegistry, TaskValue};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "specpipe-proc")]
#[command(about = "Process one spectrograph exposure through the reduction chain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// YEARMMDD night
    #[arg(short, long)]
    night: i64,

    /// Exposure ID
    #[arg(short, long)]
    expid: Option<i64>,

    /// science, arc, flat, dark, zero, ...
    #[arg(long)]
    obstype: Option<String>,

    /// Cameras to reduce: camword or comma-separated list
    #[arg(long, default_value = "a0123456789")]
    cameras: String,

    /// Comma separated list of {camera}{spectrograph}{amp}, e.g. b7D,z8A
    #[arg(long)]
    badamps: Option<String>,

    /// Joint product to compute: psfnight, nightlyflat, or stdstarfit
    #[arg(long)]
    joint: Option<String>,

    /// Member exposure ids for a joint product
    #[arg(long, value_delimiter = ',')]
    expids: Vec<i64>,

    /// Worker count for camera-striped stages
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Do not do science reductions prior to standard-star fitting
    #[arg(long)]
    no_prestdstar: bool,

    /// Do not fit standard stars
    #[arg(long)]
    no_stdstarfit: bool,

    /// Do not flux calibrate
    #[arg(long)]
    no_fluxcalib: bool,

    /// Do not subtract sky; also skips stdstar fit and flux calibration
    #[arg(long)]
    no_skysub: bool,

    /// Do not apply a fiberflat
    #[arg(long)]
    no_fiberflat: bool,

    /// Also write the non-sky-subtracted fframe file
    #[arg(long)]
    fframe: bool,

    /// Use this night's nightly calibrations instead of the data night's
    #[arg(long)]
    calibnight: Option<i64>,

    /// Use this input PSF for every camera
    #[arg(long)]
    psf: Option<PathBuf>,

    /// Use this fiberflat for every camera
    #[arg(long)]
    fiberflat: Option<PathBuf>,

    /// Search past nights for calibrations before using defaults
    #[arg(long)]
    most_recent_calib: bool,

    /// Save per-stage runtime info to this JSON file
    #[arg(long)]
    timingfile: Option<PathBuf>,

    /// Continue with placeholder data when fibermap inputs are missing
    #[arg(long)]
    force: bool,

    /// Write a batch script and submit it instead of processing in place
    #[arg(long)]
    batch: bool,

    /// With --batch, write the script but do not submit it
    #[arg(long)]
    nosubmit: bool,

    /// Simulate without executing external programs
    #[arg(long)]
    dry_run: bool,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    specpipe_core::logging::init_logging(None);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "specpipe-proc failed");
            match e {
                SpecpipeError::ConfigurationError(_) | SpecpipeError::CamwordError(_) => {
                    scheduling::EXIT_BAD_CONFIG
                }
                SpecpipeError::MissingDependency(_) => scheduling::EXIT_BAD_FIBERMAP,
                _ => 1,
            }
        }
    };
    process::exit(code);
}

async fn run(cli: Cli) -> specpipe_core::Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref())?;
    let cameras = parse_cameras(&cli.cameras)?;

    if let Some(joint) = &cli.joint {
        return run_joint(&cli, &config, joint).await;
    }

    let expid = cli.expid.ok_or_else(|| {
        SpecpipeError::ConfigurationError("Must specify --expid (or --joint)".to_string())
    })?;
    let obstype: ObsType = cli
        .obstype
        .as_deref()
        .ok_or_else(|| SpecpipeError::ConfigurationError("Must specify --obstype".to_string()))?
        .parse()
        .map_err(SpecpipeError::ConfigurationError)?;

    let options = ProcOptions {
        night: cli.night,
        expid,
        obstype,
        cameras,
        badamps: cli.badamps.clone(),
        workers: cli.workers,
        no_prestdstar: cli.no_prestdstar,
        no_stdstarfit: cli.no_stdstarfit,
        no_fluxcalib: cli.no_fluxcalib,
        no_skysub: cli.no_skysub,
        no_fiberflat: cli.no_fiberflat,
        fframe: cli.fframe,
        calibnight: cli.calibnight,
        psf_override: cli.psf.clone(),
        fiberflat_override: cli.fiberflat.clone(),
        most_recent_calib: cli.most_recent_calib,
        timingfile: cli.timingfile.clone(),
        force: cli.force,
        ..ProcOptions::default()
    };

    if cli.batch {
        return submit_batch(&cli, &config, &options).await;
    }

    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        Arc::new(DryRunRunner)
    } else {
        Arc::new(ProcessRunner)
    };
    let pipeline = ExposurePipeline::new(&config, options, runner)?;
    pipeline.run().await?;
    Ok(())
}

/// Generate the batch script for this invocation and submit it.
async fn submit_batch(
    cli: &Cli,
    config: &PipelineConfig,
    options: &ProcOptions,
) -> specpipe_core::Result<()> {
    let jobdesc = match options.obstype {
        ObsType::Science => {
            if options.no_prestdstar && options.no_stdstarfit && !options.no_fluxcalib {
                JobDesc::Poststdstar
            } else if !options.no_prestdstar && options.no_stdstarfit && options.no_fluxcalib {
                JobDesc::Prestdstar
            } else {
                JobDesc::Science
            }
        }
        other => JobDesc::from(other),
    };
    let prow = ProcessingRow {
        expids: vec![options.expid],
        night: options.night,
        obstype: options.obstype,
        tileid: NO_TILEID,
        proccamword: options.cameras.clone(),
        intid: 0,
        jobdesc,
        int_dep_ids: Vec::new(),
        latest_qid: 0,
        status: TaskState::Waiting,
        scriptname: String::new(),
        laststep: specpipe_core::LastStep::All,
        badamps: options.badamps.clone().unwrap_or_default(),
    };
    let system = batch_config(&config.batch_system)?;
    let resources =
        determine_resources(prow.proccamword.len(), jobdesc, 1, None, system)?;
    let mut command = format!(
        "specpipe-proc --night {} --expid {} --obstype {} --cameras {}",
        options.night, options.expid, options.obstype, options.cameras
    );
    if let Some(badamps) = &options.badamps {
        command.push_str(&format!(" --badamps {badamps}"));
    }
    let paths = specpipe_core::paths::ProdPaths::new(config);
    let script =
        create_batch_script(&paths, &prow, &resources, &config.queue, system, &command)?;
    if !cli.nosubmit {
        let qid = SlurmQueue.submit(&script).await?;
        tracing::info!(qid, "Submitted batch job");
    }
    Ok(())
}

/// Produce a joint calibration product over the accumulated exposures.
async fn run_joint(cli: &Cli, config: &PipelineConfig, joint: &str) -> specpipe_core::Result<()> {
    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        Arc::new(DryRunRunner)
    } else {
        Arc::new(ProcessRunner)
    };
    let cameras = parse_cameras(&cli.cameras)?;
    let paths = specpipe_core::paths::ProdPaths::new(config);
    let ctx = TaskContext::new(paths, runner.clone());
    let registry = TaskRegistry::standard();

    match joint {
        "psfnight" | "nightlyflat" => {
            let tag = if joint == "psfnight" {
                "psfnight"
            } else {
                "fiberflatnight"
            };
            let task = registry.get(tag).expect("standard registry holds the tag");
            let mut failed = 0u32;
            for camera in cameras.decode() {
                let mut props = TaskProps::new();
                props.insert("night".to_string(), TaskValue::Int(cli.night));
                props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
                let name = task.name_join(&props)?;
                failed += task.run(&name, &serde_json::json!({}), &ctx).await;
            }
            if failed > 0 {
                return Err(SpecpipeError::PipelineError(format!(
                    "{failed} cameras failed the {joint} joint fit"
                )));
            }
            Ok(())
        }
        "stdstarfit" => {
            let expid = cli.expids.first().copied().or(cli.expid).ok_or_else(|| {
                SpecpipeError::ConfigurationError(
                    "stdstarfit requires --expids".to_string(),
                )
            })?;
            let options = ProcOptions {
                night: cli.night,
                expid,
                obstype: ObsType::Science,
                cameras,
                badamps: cli.badamps.clone(),
                workers: cli.workers,
                no_prestdstar: true,
                no_fluxcalib: true,
                ..ProcOptions::default()
            };
            let pipeline = ExposurePipeline::new(config, options, runner)?;
            pipeline.run().await?;
            Ok(())
        }
        other => Err(SpecpipeError::ConfigurationError(format!(
            "Unknown joint product: {other}"
        ))),
    }
}
