//! # Single-Exposure Stage Pipeline
//!
//! Runs one exposure through its obstype-conditioned stage sequence:
//! preprocessing, trace shifts, PSF fitting, extraction, fiberflat, sky
//! subtraction, standard-star fitting, flux calibration, and the final
//! calibrated-frame write. Every stage checks its declared outputs before
//! doing anything; this is the central idempotence mechanism that makes
//! resumption and partial resubmission safe. A barrier separates each
//! stage from the next so later stages never observe partially-written
//! earlier outputs.

pub mod stages;

use crate::camword::{validate_badamps, Camera, Camword};
use crate::config::PipelineConfig;
use crate::constants::{scheduling, ObsType};
use crate::error::{Result, SpecpipeError};
use crate::exec::{runcmd, CommandRunner, StageCommand, WorkerGroup};
use crate::fibermap::Fibermap;
use crate::paths::ProdPaths;
use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Options controlling one exposure's processing.
#[derive(Debug, Clone)]
pub struct ProcOptions {
    pub night: i64,
    pub expid: i64,
    pub obstype: ObsType,
    pub cameras: Camword,
    pub badamps: Option<String>,
    /// Worker count for camera-striped stages.
    pub workers: usize,
    /// Workers per sub-group for the PSF fit (one fiber bundle each).
    pub psf_group_size: usize,
    /// Workers per sub-group for extraction.
    pub extract_group_size: usize,
    pub no_prestdstar: bool,
    pub no_stdstarfit: bool,
    pub no_fluxcalib: bool,
    pub no_skysub: bool,
    pub no_fiberflat: bool,
    /// Fit trace shifts; when off the input PSF is linked through unchanged.
    pub traceshift: bool,
    /// Also write the flatfielded-but-not-sky-subtracted fframe file.
    pub fframe: bool,
    /// Take nightly calibrations from this night instead of the data night.
    pub calibnight: Option<i64>,
    pub psf_override: Option<PathBuf>,
    pub fiberflat_override: Option<PathBuf>,
    /// Search past nights for calibrations before falling back to defaults.
    pub most_recent_calib: bool,
    pub timingfile: Option<PathBuf>,
    /// Continue with placeholder data when fibermap inputs are missing.
    pub force: bool,
}

impl Default for ProcOptions {
    fn default() -> Self {
        Self {
            night: 0,
            expid: 0,
            obstype: ObsType::Science,
            cameras: Camword::full(),
            badamps: None,
            workers: 1,
            psf_group_size: 20,
            extract_group_size: 20,
            no_prestdstar: false,
            no_stdstarfit: false,
            no_fluxcalib: false,
            no_skysub: false,
            no_fiberflat: false,
            traceshift: true,
            fframe: false,
            calibnight: None,
            psf_override: None,
            fiberflat_override: None,
            most_recent_calib: false,
            timingfile: None,
            force: false,
        }
    }
}

/// Wall-clock record for one executed stage.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageTiming {
    pub name: String,
    pub seconds: f64,
}

/// What the pipeline did for one exposure.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub stages: Vec<StageTiming>,
}

impl PipelineSummary {
    fn record(&mut self, name: &str, started: Instant) {
        self.stages.push(StageTiming {
            name: name.to_string(),
            seconds: started.elapsed().as_secs_f64(),
        });
    }
}

/// One exposure's worth of orchestration.
pub struct ExposurePipeline {
    options: ProcOptions,
    paths: ProdPaths,
    runner: Arc<dyn CommandRunner>,
    group: WorkerGroup,
    stdstar_templates: String,
}

impl ExposurePipeline {
    pub fn new(
        config: &PipelineConfig,
        mut options: ProcOptions,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        if let Some(badamps) = &options.badamps {
            options.badamps = Some(validate_badamps(badamps)?);
        }
        if options.cameras.is_empty() {
            return Err(SpecpipeError::ConfigurationError(
                "No cameras selected for processing".to_string(),
            ));
        }
        let group = WorkerGroup::new(options.workers);
        Ok(Self {
            options,
            paths: ProdPaths::new(config),
            runner,
            group,
            stdstar_templates: config.stdstar_templates.clone(),
        })
    }

    pub fn paths(&self) -> &ProdPaths {
        &self.paths
    }

    fn cameras(&self) -> Vec<Camera> {
        self.options.cameras.decode()
    }

    /// Run one stage striped per camera: each job is a short command
    /// sequence for one camera, stopping at that camera's first failure.
    /// The await is the stage barrier.
    async fn run_camera_stage(&self, name: &str, jobs: Vec<Vec<StageCommand>>) -> u32 {
        let started = Instant::now();
        let runner = self.runner.clone();
        let stage = name.to_string();
        let failed = self
            .group
            .run_striped(jobs, move |commands: Vec<StageCommand>| {
                let runner = runner.clone();
                let stage = stage.clone();
                async move {
                    for command in &commands {
                        if let Err(e) = runcmd(runner.as_ref(), command).await {
                            tracing::error!(stage = %stage, error = %e, "FAILED");
                            return 1u32;
                        }
                    }
                    0u32
                }
            })
            .await;
        tracing::info!(
            stage = name,
            seconds = started.elapsed().as_secs_f64(),
            failed,
            "Stage complete"
        );
        failed
    }

    /// Run one stage in sub-groups: sub-group `g` handles commands
    /// `g, g + num_groups, ...` sequentially while the external tool uses
    /// the sub-group's workers internally. Waits for every sub-group.
    async fn run_grouped_stage(
        &self,
        name: &str,
        commands: Vec<StageCommand>,
        group_size: usize,
    ) -> u32 {
        let subs = self.group.split(group_size);
        tracing::info!(
            stage = name,
            groups = subs.len(),
            group_size,
            "Running with sub-groups"
        );
        let futures = subs.iter().map(|sub| {
            let assigned: Vec<StageCommand> = sub
                .assigned(commands.len())
                .into_iter()
                .map(|i| commands[i].clone())
                .collect();
            let runner = self.runner.clone();
            let stage = name.to_string();
            let group_index = sub.index;
            async move {
                let mut failed = 0u32;
                for command in &assigned {
                    if let Err(e) = runcmd(runner.as_ref(), command).await {
                        tracing::error!(
                            stage = %stage,
                            group = group_index,
                            error = %e,
                            "FAILED"
                        );
                        failed += 1;
                    }
                }
                failed
            }
        });
        join_all(futures).await.into_iter().sum()
    }

    /// Resolve the input PSF for one camera: explicit override, then the
    /// calibration night's product, then tonight's product, then (when
    /// allowed) the most recent past night, then the default calibration.
    fn find_input_psf(&self, camera: Camera) -> Result<PathBuf> {
        if let Some(psf) = &self.options.psf_override {
            return Ok(psf.clone());
        }
        if let Some(calibnight) = self.options.calibnight {
            let nightfile = self.paths.psfnight(calibnight, camera);
            if !nightfile.exists() {
                return Err(SpecpipeError::MissingDependency(format!(
                    "No {}",
                    nightfile.display()
                )));
            }
            return Ok(nightfile);
        }
        let nightfile = self.paths.psfnight(self.options.night, camera);
        if nightfile.exists() {
            return Ok(nightfile);
        }
        if self.options.most_recent_calib {
            if let Some(found) =
                self.find_most_recent(|night| self.paths.psfnight(night, camera))
            {
                return Ok(found);
            }
        }
        Ok(self.paths.default_calib_psf(camera))
    }

    /// Same resolution ladder for the input fiberflat.
    fn find_input_fiberflat(&self, camera: Camera) -> Result<PathBuf> {
        if let Some(flat) = &self.options.fiberflat_override {
            return Ok(flat.clone());
        }
        if let Some(calibnight) = self.options.calibnight {
            let nightfile = self.paths.fiberflatnight(calibnight, camera);
            if !nightfile.exists() {
                return Err(SpecpipeError::MissingDependency(format!(
                    "No {}",
                    nightfile.display()
                )));
            }
            return Ok(nightfile);
        }
        let nightfile = self.paths.fiberflatnight(self.options.night, camera);
        if nightfile.exists() {
            return Ok(nightfile);
        }
        if self.options.most_recent_calib {
            if let Some(found) =
                self.find_most_recent(|night| self.paths.fiberflatnight(night, camera))
            {
                return Ok(found);
            }
        }
        Ok(self.paths.default_calib_fiberflat(camera))
    }

    /// Walk back up to 30 nights looking for an existing nightly product.
    fn find_most_recent(&self, product: impl Fn(i64) -> PathBuf) -> Option<PathBuf> {
        let mut date = night_to_date(self.options.night)?;
        for _ in 0..30 {
            date -= Duration::days(1);
            let night = date_to_night(date);
            let candidate = product(night);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Assemble the fibermap for a science exposure. Missing positioner
    /// inputs are fatal unless the night predates the coordinates-file
    /// epoch or --force is set, in which case assembly is retried with
    /// placeholder data.
    async fn assemble_fibermap(&self) -> Result<PathBuf> {
        let night = self.options.night;
        let expid = self.options.expid;
        let fibermap = self.paths.fibermap(night, expid);
        if fibermap.exists() {
            tracing::info!(fibermap = %fibermap.display(), "Fibermap exists");
            return Ok(fibermap);
        }
        tracing::info!(fibermap = %fibermap.display(), "Creating fibermap");
        let mut command = StageCommand::new("specpipe_assemble_fibermap")
            .arg("-n")
            .arg(night.to_string())
            .arg("-e")
            .arg(format!("{expid:08}"))
            .arg("-o")
            .arg(fibermap.display().to_string())
            .output(fibermap.clone());
        if let Some(badamps) = &self.options.badamps {
            command = command.arg(format!("--badamps={badamps}"));
        }
        match runcmd(self.runner.as_ref(), &command).await {
            Ok(_) => Ok(fibermap),
            Err(e) if self.options.force || night < scheduling::COORDS_EPOCH_NIGHT => {
                tracing::error!(error = %e, "Fibermap assembly failed; retrying with --force");
                let forced = command.clone().arg("--force");
                runcmd(self.runner.as_ref(), &forced).await.map_err(|e| {
                    SpecpipeError::MissingDependency(format!(
                        "Fibermap assembly failed even with --force: {e}"
                    ))
                })?;
                Ok(fibermap)
            }
            Err(e) => Err(SpecpipeError::MissingDependency(format!(
                "Fibermap assembly failed for science exposure: {e}"
            ))),
        }
    }

    /// Process the exposure. Returns per-stage timings; a nonzero failure
    /// count in the PSF-fit or extraction stage aborts the exposure, since
    /// downstream stages need complete camera sets.
    pub async fn run(&self) -> Result<PipelineSummary> {
        let opts = &self.options;
        let mut summary = PipelineSummary::default();
        tracing::info!("----------");
        tracing::info!(night = opts.night, expid = opts.expid, "Processing exposure");
        tracing::info!(obstype = %opts.obstype, cameras = %opts.cameras, "----------");

        let cameras = self.cameras();

        // Fibermap assembly gates everything for science exposures.
        let mut fibermap: Option<PathBuf> = None;
        if opts.obstype == ObsType::Science {
            let started = Instant::now();
            fibermap = Some(self.assemble_fibermap().await?);
            summary.record("fibermap", started);
        }

        if stages::runs_preproc(opts) {
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| vec![self.preproc_command(camera, fibermap.as_ref())])
                .collect();
            self.run_camera_stage("preproc", jobs).await;
            summary.record("preproc", started);
        }

        // Input PSFs resolve once; used by both traceshift flavors.
        let mut input_psf: BTreeMap<Camera, PathBuf> = BTreeMap::new();
        if stages::runs_traceshift(opts) || stages::runs_psf_fit(opts) {
            for &camera in &cameras {
                input_psf.insert(camera, self.find_input_psf(camera)?);
            }
        }

        if stages::runs_traceshift(opts) {
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| vec![self.traceshift_command(camera, &input_psf[&camera])])
                .collect();
            self.run_camera_stage("traceshift", jobs).await;
            summary.record("traceshift", started);
        }

        if stages::runs_psf_fit(opts) {
            // Shift the input PSF onto tonight's traces, then fit, in
            // bundle-sized sub-groups. Failures here are fatal.
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| vec![self.arc_traceshift_command(camera, &input_psf[&camera])])
                .collect();
            let shift_failed = self.run_camera_stage("arc_traceshift", jobs).await;

            let commands = cameras
                .iter()
                .map(|&camera| self.psf_fit_command(camera))
                .collect();
            let fit_failed = self
                .run_grouped_stage("psf", commands, opts.psf_group_size)
                .await;
            summary.record("psf", started);
            let failed = shift_failed + fit_failed;
            if failed > 0 {
                return Err(SpecpipeError::PipelineError(format!(
                    "{failed} cameras failed PSF fitting; aborting exposure"
                )));
            }
        }

        if stages::runs_extraction(opts) {
            let started = Instant::now();
            let commands = cameras
                .iter()
                .map(|&camera| self.extract_command(camera))
                .collect();
            let failed = self
                .run_grouped_stage("extract", commands, opts.extract_group_size)
                .await;
            summary.record("extract", started);
            if failed > 0 {
                return Err(SpecpipeError::PipelineError(format!(
                    "{failed} cameras failed extraction; aborting exposure"
                )));
            }
        }

        if stages::runs_fiberflat(opts) {
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| vec![self.fiberflat_command(camera)])
                .collect();
            self.run_camera_stage("fiberflat", jobs).await;
            summary.record("fiberflat", started);
        }

        let mut input_fiberflat: BTreeMap<Camera, PathBuf> = BTreeMap::new();
        let needs_fiberflat = matches!(opts.obstype, ObsType::Science | ObsType::Sky)
            && !opts.no_fiberflat;
        if needs_fiberflat {
            for &camera in &cameras {
                input_fiberflat.insert(camera, self.find_input_fiberflat(camera)?);
            }
        }

        if needs_fiberflat && opts.fframe && !opts.no_prestdstar {
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| vec![self.fframe_command(camera, &input_fiberflat[&camera])])
                .collect();
            self.run_camera_stage("apply_fiberflat", jobs).await;
            summary.record("apply_fiberflat", started);
        }

        if stages::runs_sky_stages(opts) {
            // Sky-fiber selection is skipped when the fibermap already
            // marks sky fibers.
            let already_marked = fibermap
                .as_ref()
                .and_then(|path| std::fs::read(path).ok())
                .and_then(|bytes| serde_json::from_slice::<Fibermap>(&bytes).ok())
                .map(|fm| fm.has_sky_fibers())
                .unwrap_or(false);
            if already_marked {
                tracing::info!("Sky fibers already set; skipping selection");
            } else {
                let started = Instant::now();
                let jobs = cameras
                    .iter()
                    .map(|&camera| {
                        vec![self.picksky_command(camera, input_fiberflat.get(&camera))]
                    })
                    .collect();
                self.run_camera_stage("picksky", jobs).await;
                summary.record("picksky", started);
            }

            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| {
                    self.skysub_commands(camera, input_fiberflat.get(&camera))
                })
                .collect();
            self.run_camera_stage("skysub", jobs).await;
            summary.record("skysub", started);
        }

        if stages::runs_stdstar_fit(opts) {
            let started = Instant::now();
            let jobs = self
                .options
                .cameras
                .spectrographs()
                .into_iter()
                .map(|sp| vec![self.stdstar_command(sp, &input_fiberflat)])
                .collect();
            self.run_camera_stage("stdstarfit", jobs).await;
            summary.record("stdstarfit", started);
        }

        if stages::runs_fluxcalib(opts) {
            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| {
                    vec![self.fluxcalib_command(camera, input_fiberflat.get(&camera))]
                })
                .collect();
            self.run_camera_stage("fluxcalib", jobs).await;
            summary.record("fluxcalib", started);

            let started = Instant::now();
            let jobs = cameras
                .iter()
                .map(|&camera| {
                    vec![self.applycalib_command(camera, input_fiberflat.get(&camera))]
                })
                .collect();
            self.run_camera_stage("applycalib", jobs).await;
            summary.record("applycalib", started);
        }

        self.write_timing_summary(&summary)?;
        tracing::info!("All done");
        Ok(summary)
    }

    /// Log the stage timings and augment the timing file if configured;
    /// pre-existing entries are kept, not overwritten.
    fn write_timing_summary(&self, summary: &PipelineSummary) -> Result<()> {
        let mut stats = serde_json::Map::new();
        for stage in &summary.stages {
            stats.insert(stage.name.clone(), serde_json::json!(stage.seconds));
        }
        tracing::info!(
            timing = %serde_json::Value::Object(stats.clone()),
            "Timing summary statistics"
        );
        if let Some(timingfile) = &self.options.timingfile {
            if timingfile.exists() {
                let previous: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_slice(&std::fs::read(timingfile)?)?;
                for (name, value) in previous {
                    stats.entry(name).or_insert(value);
                }
            }
            if let Some(parent) = timingfile.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = timingfile.with_extension("tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&stats)?)?;
            std::fs::rename(&tmp, timingfile)?;
        }
        Ok(())
    }

    // -- per-stage command builders ---------------------------------------

    fn preproc_command(&self, camera: Camera, fibermap: Option<&PathBuf>) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let raw = self.paths.raw(night, expid);
        let out = self.paths.preproc(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_preproc")
            .arg("--infile")
            .arg(raw.display().to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .arg("--camera")
            .arg(camera.to_string());
        if let Some(fibermap) = fibermap {
            cmd = cmd.arg("--fibermap").arg(fibermap.display().to_string());
        }
        // never model variance for arcs
        if !self.options.obstype.is_arc_like() {
            cmd = cmd.arg("--model-variance");
        }
        cmd.input(raw).output(out)
    }

    fn traceshift_command(&self, camera: Camera, input_psf: &PathBuf) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let preproc = self.paths.preproc(night, expid, camera);
        let outpsf = self.paths.psf(night, expid, camera);
        if !self.options.traceshift {
            return StageCommand::new("ln")
                .arg("-s")
                .arg(input_psf.display().to_string())
                .arg(outpsf.display().to_string())
                .input(input_psf.clone())
                .output(outpsf);
        }
        let mut cmd = StageCommand::new("specpipe_compute_trace_shifts")
            .arg("-i")
            .arg(preproc.display().to_string())
            .arg("--psf")
            .arg(input_psf.display().to_string())
            .arg("--outpsf")
            .arg(outpsf.display().to_string())
            .args(["--degxx", "2", "--degxy", "0"]);
        if matches!(
            self.options.obstype,
            ObsType::Flat | ObsType::TestFlat | ObsType::Twilight
        ) {
            cmd = cmd.arg("--continuum");
        } else {
            cmd = cmd.args(["--degyx", "2", "--degyy", "0"]);
        }
        if matches!(self.options.obstype, ObsType::Science | ObsType::Sky) {
            cmd = cmd.arg("--sky");
        }
        cmd.input(preproc).input(input_psf.clone()).output(outpsf)
    }

    fn arc_traceshift_command(&self, camera: Camera, input_psf: &PathBuf) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let preproc = self.paths.preproc(night, expid, camera);
        let outpsf = self.paths.shifted_input_psf(night, expid, camera);
        StageCommand::new("specpipe_compute_trace_shifts")
            .arg("-i")
            .arg(preproc.display().to_string())
            .arg("--psf")
            .arg(input_psf.display().to_string())
            .arg("--outpsf")
            .arg(outpsf.display().to_string())
            .args(["--degxx", "0", "--degxy", "0", "--degyx", "0", "--degyy", "0"])
            .arg("--arc-lamps")
            .input(preproc)
            .input(input_psf.clone())
            .output(outpsf)
    }

    fn psf_fit_command(&self, camera: Camera) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let preproc = self.paths.preproc(night, expid, camera);
        let inpsf = self.paths.shifted_input_psf(night, expid, camera);
        let outpsf = self.paths.fit_psf(night, expid, camera);
        StageCommand::new("specpipe_compute_psf")
            .arg("--input-image")
            .arg(preproc.display().to_string())
            .arg("--input-psf")
            .arg(inpsf.display().to_string())
            .arg("--output-psf")
            .arg(outpsf.display().to_string())
            .input(preproc)
            .input(inpsf)
            .output(outpsf)
    }

    fn extract_command(&self, camera: Camera) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let preproc = self.paths.preproc(night, expid, camera);
        let psf = self.paths.psf(night, expid, camera);
        let frame = self.paths.frame(night, expid, camera);
        let wavelengths = match camera.band {
            crate::camword::Band::B => "3600.0,5800.0,0.8",
            crate::camword::Band::R => "5760.0,7620.0,0.8",
            crate::camword::Band::Z => "7520.0,9824.0,0.8",
        };
        let mut cmd = StageCommand::new("specpipe_extract_spectra")
            .arg("-w")
            .arg(wavelengths)
            .arg("-i")
            .arg(preproc.display().to_string())
            .arg("-p")
            .arg(psf.display().to_string())
            .arg("-o")
            .arg(frame.display().to_string())
            .args(["--psferr", "0.1"]);
        if matches!(self.options.obstype, ObsType::Science | ObsType::Sky) {
            cmd = cmd.arg("--barycentric-correction");
        }
        cmd.input(preproc).input(psf).output(frame)
    }

    fn fiberflat_command(&self, camera: Camera) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let out = self.paths.fiberflat(night, expid, camera);
        StageCommand::new("specpipe_compute_fiberflat")
            .arg("-i")
            .arg(frame.display().to_string())
            .arg("-o")
            .arg(out.display().to_string())
            .input(frame)
            .output(out)
    }

    fn fframe_command(&self, camera: Camera, fiberflat: &PathBuf) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let out = self.paths.fframe(night, expid, camera);
        StageCommand::new("specpipe_apply_fiberflat")
            .arg("--infile")
            .arg(frame.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .input(frame)
            .input(fiberflat.clone())
            .output(out)
    }

    fn picksky_command(&self, camera: Camera, fiberflat: Option<&PathBuf>) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let selection = self.paths.skyfibers(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_pick_sky_fibers")
            .arg("--frame")
            .arg(frame.display().to_string())
            .arg("--outfile")
            .arg(selection.display().to_string());
        if let Some(fiberflat) = fiberflat {
            cmd = cmd
                .arg("--fiberflat")
                .arg(fiberflat.display().to_string());
        }
        cmd.input(frame).output(selection)
    }

    fn skysub_commands(&self, camera: Camera, fiberflat: Option<&PathBuf>) -> Vec<StageCommand> {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let sky = self.paths.sky(night, expid, camera);
        let sframe = self.paths.sframe(night, expid, camera);
        let fiberflat = fiberflat
            .cloned()
            .unwrap_or_else(|| self.paths.default_calib_fiberflat(camera));
        let compute = StageCommand::new("specpipe_compute_sky")
            .arg("-i")
            .arg(frame.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("-o")
            .arg(sky.display().to_string())
            .arg("--adjust-wavelength")
            .arg("--adjust-lsf")
            .input(frame.clone())
            .input(fiberflat.clone())
            .output(sky.clone());
        let subtract = StageCommand::new("specpipe_apply_sky")
            .arg("--infile")
            .arg(frame.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("--sky")
            .arg(sky.display().to_string())
            .arg("--outfile")
            .arg(sframe.display().to_string())
            .input(frame)
            .input(sky)
            .output(sframe);
        vec![compute, subtract]
    }

    fn stdstar_command(
        &self,
        spectrograph: u8,
        input_fiberflat: &BTreeMap<Camera, PathBuf>,
    ) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let spec_cameras: Vec<Camera> = self
            .cameras()
            .into_iter()
            .filter(|c| c.spectrograph == spectrograph)
            .collect();
        let out = self.paths.stdstars(night, expid, spectrograph);
        let mut cmd = StageCommand::new("specpipe_fit_stdstars").arg("--frames");
        let mut inputs = Vec::new();
        for &camera in &spec_cameras {
            let frame = self.paths.frame(night, expid, camera);
            cmd = cmd.arg(frame.display().to_string());
            inputs.push(frame);
        }
        cmd = cmd.arg("--skymodels");
        for &camera in &spec_cameras {
            let sky = self.paths.sky(night, expid, camera);
            cmd = cmd.arg(sky.display().to_string());
            inputs.push(sky);
        }
        cmd = cmd.arg("--fiberflats");
        for &camera in &spec_cameras {
            let flat = input_fiberflat
                .get(&camera)
                .cloned()
                .unwrap_or_else(|| self.paths.default_calib_fiberflat(camera));
            cmd = cmd.arg(flat.display().to_string());
        }
        cmd = cmd
            .arg("--starmodels")
            .arg(self.stdstar_templates.clone())
            .arg("--outfile")
            .arg(out.display().to_string())
            .args(["--delta-color", "0.1"]);
        for input in inputs {
            cmd = cmd.input(input);
        }
        cmd.output(out)
    }

    fn fluxcalib_command(&self, camera: Camera, fiberflat: Option<&PathBuf>) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let sky = self.paths.sky(night, expid, camera);
        let stdstars = self.paths.stdstars(night, expid, camera.spectrograph);
        let out = self.paths.fluxcalib(night, expid, camera);
        let fiberflat = fiberflat
            .cloned()
            .unwrap_or_else(|| self.paths.default_calib_fiberflat(camera));
        StageCommand::new("specpipe_compute_fluxcalibration")
            .arg("--infile")
            .arg(frame.display().to_string())
            .arg("--sky")
            .arg(sky.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("--models")
            .arg(stdstars.display().to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .args(["--delta-color-cut", "0.1"])
            .input(frame)
            .input(sky)
            .input(stdstars)
            .output(out)
    }

    fn applycalib_command(&self, camera: Camera, fiberflat: Option<&PathBuf>) -> StageCommand {
        let night = self.options.night;
        let expid = self.options.expid;
        let frame = self.paths.frame(night, expid, camera);
        let sky = self.paths.sky(night, expid, camera);
        let calib = self.paths.fluxcalib(night, expid, camera);
        let out = self.paths.cframe(night, expid, camera);
        let fiberflat = fiberflat
            .cloned()
            .unwrap_or_else(|| self.paths.default_calib_fiberflat(camera));
        StageCommand::new("specpipe_process_exposure")
            .arg("--infile")
            .arg(frame.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("--sky")
            .arg(sky.display().to_string())
            .arg("--calib")
            .arg(calib.display().to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .args(["--cosmics-nsig", "6"])
            .input(frame)
            .input(sky)
            .input(calib)
            .output(out)
    }
}

fn night_to_date(night: i64) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        (night / 10000) as i32,
        ((night / 100) % 100) as u32,
        (night % 100) as u32,
    )
}

fn date_to_night(date: NaiveDate) -> i64 {
    date.format("%Y%m%d")
        .to_string()
        .parse()
        .unwrap_or_default()
}
