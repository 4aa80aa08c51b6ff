//! # Concrete Task Types
//!
//! One implementation of [`PipelineTask`] per unit of the standard
//! reduction chain. Per-camera types are keyed by (night, expid, camera),
//! the nightly joint products by (night, camera), and the standard-star fit
//! by (night, expid, spectrograph) since it consumes all three bands of one
//! spectrograph at once.

use crate::camword::Camera;
use crate::error::{Result, SpecpipeError};
use crate::exec::{runcmd, StageCommand};
use crate::paths::ProdPaths;
use crate::tasks::schema::{TaskProps, TaskValue};
use crate::tasks::{NameField, PipelineTask, TaskContext};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

const PER_CAMERA_FIELDS: [NameField; 3] = [
    NameField::int("night", 8),
    NameField::int("expid", 8),
    NameField::text("camera"),
];

const NIGHTLY_FIELDS: [NameField; 2] = [NameField::int("night", 8), NameField::text("camera")];

const PER_SPECTROGRAPH_FIELDS: [NameField; 3] = [
    NameField::int("night", 8),
    NameField::int("expid", 8),
    NameField::int("spectrograph", 1),
];

fn get_int(props: &TaskProps, key: &str) -> Result<i64> {
    props
        .get(key)
        .and_then(TaskValue::as_int)
        .ok_or_else(|| SpecpipeError::TaskError(format!("Missing integer property '{key}'")))
}

fn get_camera(props: &TaskProps) -> Result<Camera> {
    props
        .get("camera")
        .and_then(TaskValue::as_text)
        .ok_or_else(|| SpecpipeError::TaskError("Missing property 'camera'".to_string()))?
        .parse()
}

fn night_expid_camera(props: &TaskProps) -> Result<(i64, i64, Camera)> {
    Ok((
        get_int(props, "night")?,
        get_int(props, "expid")?,
        get_camera(props)?,
    ))
}

fn opt_path(opts: &serde_json::Value, key: &str) -> Option<PathBuf> {
    opts.get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
}

async fn run_stage(ctx: &TaskContext, command: &StageCommand) -> Result<()> {
    runcmd(ctx.runner.as_ref(), command).await.map(|_| ())
}

/// Wavelength range argument for the extraction, chosen by band.
fn extraction_wavelengths(camera: Camera) -> &'static str {
    match camera.band {
        crate::camword::Band::B => "3600.0,5800.0,0.8",
        crate::camword::Band::R => "5760.0,7620.0,0.8",
        crate::camword::Band::Z => "7520.0,9824.0,0.8",
    }
}

// ---------------------------------------------------------------------------
// preproc

pub struct PreprocTask;

impl PreprocTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let raw = paths.raw(night, expid);
        let out = paths.preproc(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_preproc")
            .arg("--infile")
            .arg(raw.display().to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .arg("--camera")
            .arg(camera.to_string());
        if opts
            .get("model_variance")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            cmd = cmd.arg("--model-variance");
        }
        if opts
            .get("scattered_light")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            cmd = cmd.arg("--scattered-light");
        }
        Ok(cmd.input(raw).output(out))
    }
}

#[async_trait]
impl PipelineTask for PreprocTask {
    fn type_tag(&self) -> &'static str {
        "preproc"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.preproc(night, expid, camera)])
    }

    fn deps(&self, _props: &TaskProps) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(10)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"model_variance": true, "scattered_light": false}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// traceshift

pub struct TraceShiftTask;

impl TraceShiftTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let preproc = paths.preproc(night, expid, camera);
        let inpsf =
            opt_path(opts, "input_psf").unwrap_or_else(|| paths.default_calib_psf(camera));
        let outpsf = paths.psf(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_compute_trace_shifts")
            .arg("-i")
            .arg(preproc.display().to_string())
            .arg("--psf")
            .arg(inpsf.display().to_string())
            .arg("--outpsf")
            .arg(outpsf.display().to_string())
            .arg("--degxx")
            .arg("2")
            .arg("--degxy")
            .arg("0");
        if opts
            .get("continuum")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            cmd = cmd.arg("--continuum");
        } else {
            cmd = cmd.args(["--degyx", "2", "--degyy", "0"]);
        }
        if opts.get("sky").and_then(|v| v.as_bool()).unwrap_or(false) {
            cmd = cmd.arg("--sky");
        }
        Ok(cmd.input(preproc).input(inpsf).output(outpsf))
    }
}

#[async_trait]
impl PipelineTask for TraceShiftTask {
    fn type_tag(&self) -> &'static str {
        "traceshift"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.psf(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![PreprocTask.name_join(props)?])
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(5)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"continuum": false, "sky": false}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// psf (single-arc fit)

pub struct PsfTask;

impl PsfTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let preproc = paths.preproc(night, expid, camera);
        let inpsf = paths.shifted_input_psf(night, expid, camera);
        let outpsf = paths.fit_psf(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_compute_psf")
            .arg("--input-image")
            .arg(preproc.display().to_string())
            .arg("--input-psf")
            .arg(inpsf.display().to_string())
            .arg("--output-psf")
            .arg(outpsf.display().to_string());
        if let Some(broken) = opts.get("broken_fibers").and_then(|v| v.as_str()) {
            if !broken.is_empty() {
                cmd = cmd.arg("--broken-fibers").arg(broken);
            }
        }
        Ok(cmd.input(preproc).input(inpsf).output(outpsf))
    }
}

#[async_trait]
impl PipelineTask for PsfTask {
    fn type_tag(&self) -> &'static str {
        "psf"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.fit_psf(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![PreprocTask.name_join(props)?])
    }

    fn run_max_procs(&self, procs_per_node: usize) -> Result<usize> {
        // one fiber bundle per worker
        Ok(procs_per_node.min(20))
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(20)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"broken_fibers": ""}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// psfnight (joint nightly PSF)

pub struct PsfNightTask;

impl PsfNightTask {
    fn command(&self, props: &TaskProps, paths: &ProdPaths) -> Result<StageCommand> {
        let night = get_int(props, "night")?;
        let camera = get_camera(props)?;
        let out = paths.psfnight(night, camera);
        Ok(StageCommand::new("specpipe_average_psf")
            .arg("--night")
            .arg(night.to_string())
            .arg("--camera")
            .arg(camera.to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .output(out))
    }
}

#[async_trait]
impl PipelineTask for PsfNightTask {
    fn type_tag(&self) -> &'static str {
        "psfnight"
    }

    fn name_fields(&self) -> &[NameField] {
        &NIGHTLY_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let night = get_int(props, "night")?;
        let camera = get_camera(props)?;
        Ok(vec![paths.psfnight(night, camera)])
    }

    fn deps(&self, _props: &TaskProps) -> Result<Vec<String>> {
        // Membership in the arc sequence is tracked through the processing
        // table, not derivable from the name alone.
        Ok(Vec::new())
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(5)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// extract

pub struct ExtractTask;

impl ExtractTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let preproc = paths.preproc(night, expid, camera);
        let psf = paths.psf(night, expid, camera);
        let frame = paths.frame(night, expid, camera);
        let psferr = opts
            .get("psferr")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.1);
        let mut cmd = StageCommand::new("specpipe_extract_spectra")
            .arg("-w")
            .arg(extraction_wavelengths(camera))
            .arg("-i")
            .arg(preproc.display().to_string())
            .arg("-p")
            .arg(psf.display().to_string())
            .arg("-o")
            .arg(frame.display().to_string())
            .arg("--psferr")
            .arg(psferr.to_string());
        if opts
            .get("barycentric_correction")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            cmd = cmd.arg("--barycentric-correction");
        }
        Ok(cmd.input(preproc).input(psf).output(frame))
    }
}

#[async_trait]
impl PipelineTask for ExtractTask {
    fn type_tag(&self) -> &'static str {
        "extract"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.frame(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![
            PreprocTask.name_join(props)?,
            TraceShiftTask.name_join(props)?,
        ])
    }

    fn run_max_procs(&self, procs_per_node: usize) -> Result<usize> {
        Ok(procs_per_node.min(20))
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(15)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"psferr": 0.1, "barycentric_correction": false}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// fiberflat

pub struct FiberflatTask;

impl FiberflatTask {
    fn command(&self, props: &TaskProps, paths: &ProdPaths) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let frame = paths.frame(night, expid, camera);
        let out = paths.fiberflat(night, expid, camera);
        Ok(StageCommand::new("specpipe_compute_fiberflat")
            .arg("-i")
            .arg(frame.display().to_string())
            .arg("-o")
            .arg(out.display().to_string())
            .input(frame)
            .output(out))
    }
}

#[async_trait]
impl PipelineTask for FiberflatTask {
    fn type_tag(&self) -> &'static str {
        "fiberflat"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.fiberflat(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![ExtractTask.name_join(props)?])
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(5)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// fiberflatnight (joint nightly fiberflat)

pub struct FiberflatNightTask;

impl FiberflatNightTask {
    fn command(&self, props: &TaskProps, paths: &ProdPaths) -> Result<StageCommand> {
        let night = get_int(props, "night")?;
        let camera = get_camera(props)?;
        let out = paths.fiberflatnight(night, camera);
        Ok(StageCommand::new("specpipe_average_fiberflat")
            .arg("--night")
            .arg(night.to_string())
            .arg("--camera")
            .arg(camera.to_string())
            .arg("--outfile")
            .arg(out.display().to_string())
            .output(out))
    }
}

#[async_trait]
impl PipelineTask for FiberflatNightTask {
    fn type_tag(&self) -> &'static str {
        "fiberflatnight"
    }

    fn name_fields(&self) -> &[NameField] {
        &NIGHTLY_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let night = get_int(props, "night")?;
        let camera = get_camera(props)?;
        Ok(vec![paths.fiberflatnight(night, camera)])
    }

    fn deps(&self, _props: &TaskProps) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(5)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        _opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// sky

pub struct SkyTask;

impl SkyTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let frame = paths.frame(night, expid, camera);
        let fiberflat = opt_path(opts, "fiberflat")
            .unwrap_or_else(|| paths.default_calib_fiberflat(camera));
        let out = paths.sky(night, expid, camera);
        let mut cmd = StageCommand::new("specpipe_compute_sky")
            .arg("-i")
            .arg(frame.display().to_string())
            .arg("--fiberflat")
            .arg(fiberflat.display().to_string())
            .arg("-o")
            .arg(out.display().to_string());
        if opts
            .get("adjust_wavelength")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            cmd = cmd.arg("--adjust-wavelength");
        }
        if opts
            .get("adjust_lsf")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            cmd = cmd.arg("--adjust-lsf");
        }
        Ok(cmd.input(frame).input(fiberflat).output(out))
    }
}

#[async_trait]
impl PipelineTask for SkyTask {
    fn type_tag(&self) -> &'static str {
        "sky"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.sky(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![ExtractTask.name_join(props)?])
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(10)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"adjust_wavelength": true, "adjust_lsf": true}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// starfit (per-spectrograph standard-star fit)

pub struct StarFitTask;

impl StarFitTask {
    fn spectrograph_cameras(props: &TaskProps) -> Result<Vec<Camera>> {
        let sp = get_int(props, "spectrograph")? as u8;
        crate::camword::Band::ALL
            .iter()
            .map(|&band| Camera::new(band, sp))
            .collect()
    }

    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let night = get_int(props, "night")?;
        let expid = get_int(props, "expid")?;
        let sp = get_int(props, "spectrograph")? as u8;
        let cameras = Self::spectrograph_cameras(props)?;
        let frames: Vec<PathBuf> = cameras
            .iter()
            .map(|&c| paths.frame(night, expid, c))
            .collect();
        let skys: Vec<PathBuf> = cameras
            .iter()
            .map(|&c| paths.sky(night, expid, c))
            .collect();
        let flats: Vec<PathBuf> = cameras
            .iter()
            .map(|&c| {
                opt_path(opts, &format!("fiberflat_{c}"))
                    .unwrap_or_else(|| paths.default_calib_fiberflat(c))
            })
            .collect();
        let starmodels = opts
            .get("starmodels")
            .and_then(|v| v.as_str())
            .unwrap_or("stdstar_templates.fits")
            .to_string();
        let out = paths.stdstars(night, expid, sp);
        let delta_color = opts
            .get("delta_color")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.1);

        let mut cmd = StageCommand::new("specpipe_fit_stdstars").arg("--frames");
        for f in &frames {
            cmd = cmd.arg(f.display().to_string());
        }
        cmd = cmd.arg("--skymodels");
        for s in &skys {
            cmd = cmd.arg(s.display().to_string());
        }
        cmd = cmd.arg("--fiberflats");
        for f in &flats {
            cmd = cmd.arg(f.display().to_string());
        }
        cmd = cmd
            .arg("--starmodels")
            .arg(starmodels)
            .arg("--outfile")
            .arg(out.display().to_string())
            .arg("--delta-color")
            .arg(delta_color.to_string());
        if let Some(maxstd) = opts.get("maxstdstars").and_then(|v| v.as_i64()) {
            cmd = cmd.arg("--maxstdstars").arg(maxstd.to_string());
        }
        for input in frames.into_iter().chain(skys) {
            cmd = cmd.input(input);
        }
        Ok(cmd.output(out))
    }
}

#[async_trait]
impl PipelineTask for StarFitTask {
    fn type_tag(&self) -> &'static str {
        "starfit"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_SPECTROGRAPH_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let night = get_int(props, "night")?;
        let expid = get_int(props, "expid")?;
        let sp = get_int(props, "spectrograph")? as u8;
        Ok(vec![paths.stdstars(night, expid, sp)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        let mut deps = Vec::new();
        for camera in Self::spectrograph_cameras(props)? {
            let mut cam_props = props.clone();
            cam_props.remove("spectrograph");
            cam_props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
            deps.push(ExtractTask.name_join(&cam_props)?);
            deps.push(SkyTask.name_join(&cam_props)?);
        }
        Ok(deps)
    }

    fn run_max_procs(&self, procs_per_node: usize) -> Result<usize> {
        Ok(procs_per_node.min(20))
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(10)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"delta_color": 0.1, "maxstdstars": 30}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// fluxcalib

pub struct FluxCalibTask;

impl FluxCalibTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let frame = paths.frame(night, expid, camera);
        let sky = paths.sky(night, expid, camera);
        let stdstars = paths.stdstars(night, expid, camera.spectrograph);
        let fiberflat = opt_path(opts, "fiberflat")
            .unwrap_or_else(|| paths.default_calib_fiberflat(camera));
        let out = paths.fluxcalib(night, expid, camera);
        let delta = opts
            .get("delta_color_cut")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.1);
        Ok(StageCommand::new("specpipe_compute_fluxcalibration")
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
            .arg("--delta-color-cut")
            .arg(delta.to_string())
            .input(frame)
            .input(sky)
            .input(stdstars)
            .output(out))
    }

    fn starfit_name(props: &TaskProps, camera: Camera) -> Result<String> {
        let mut sp_props = props.clone();
        sp_props.remove("camera");
        sp_props.insert(
            "spectrograph".to_string(),
            TaskValue::Int(i64::from(camera.spectrograph)),
        );
        StarFitTask.name_join(&sp_props)
    }
}

#[async_trait]
impl PipelineTask for FluxCalibTask {
    fn type_tag(&self) -> &'static str {
        "fluxcalib"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.fluxcalib(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        let camera = get_camera(props)?;
        Ok(vec![
            ExtractTask.name_join(props)?,
            SkyTask.name_join(props)?,
            Self::starfit_name(props, camera)?,
        ])
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(10)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"delta_color_cut": 0.1}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

// ---------------------------------------------------------------------------
// cframe (final calibrated frame)

pub struct CFrameTask;

impl CFrameTask {
    fn command(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<StageCommand> {
        let (night, expid, camera) = night_expid_camera(props)?;
        let frame = paths.frame(night, expid, camera);
        let sky = paths.sky(night, expid, camera);
        let calib = paths.fluxcalib(night, expid, camera);
        let fiberflat = opt_path(opts, "fiberflat")
            .unwrap_or_else(|| paths.default_calib_fiberflat(camera));
        let out = paths.cframe(night, expid, camera);
        let nsig = opts
            .get("cosmics_nsig")
            .and_then(|v| v.as_i64())
            .unwrap_or(6);
        let mut cmd = StageCommand::new("specpipe_process_exposure")
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
            .arg("--cosmics-nsig")
            .arg(nsig.to_string());
        if opts
            .get("no_xtalk")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            cmd = cmd.arg("--no-xtalk");
        }
        Ok(cmd.input(frame).input(sky).input(calib).output(out))
    }
}

#[async_trait]
impl PipelineTask for CFrameTask {
    fn type_tag(&self) -> &'static str {
        "cframe"
    }

    fn name_fields(&self) -> &[NameField] {
        &PER_CAMERA_FIELDS
    }

    fn paths(&self, props: &TaskProps, paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        let (night, expid, camera) = night_expid_camera(props)?;
        Ok(vec![paths.cframe(night, expid, camera)])
    }

    fn deps(&self, props: &TaskProps) -> Result<Vec<String>> {
        Ok(vec![
            ExtractTask.name_join(props)?,
            SkyTask.name_join(props)?,
            FluxCalibTask.name_join(props)?,
        ])
    }

    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Ok(1)
    }

    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Ok(5)
    }

    fn run_defaults(&self) -> Result<serde_json::Value> {
        Ok(json!({"cosmics_nsig": 6, "no_xtalk": false}))
    }

    fn run_cli(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
    ) -> Result<String> {
        Ok(self.command(props, opts, paths)?.render())
    }

    async fn execute(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<()> {
        run_stage(ctx, &self.command(props, opts, &ctx.paths)?).await
    }
}

/// Every task type of the standard reduction chain, in dependency order.
pub fn standard_task_types() -> Vec<Arc<dyn PipelineTask>> {
    vec![
        Arc::new(PreprocTask),
        Arc::new(TraceShiftTask),
        Arc::new(PsfTask),
        Arc::new(PsfNightTask),
        Arc::new(ExtractTask),
        Arc::new(FiberflatTask),
        Arc::new(FiberflatNightTask),
        Arc::new(SkyTask),
        Arc::new(StarFitTask),
        Arc::new(FluxCalibTask),
        Arc::new(CFrameTask),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_props(night: i64, expid: i64, camera: &str) -> TaskProps {
        let mut props = TaskProps::new();
        props.insert("night".to_string(), TaskValue::Int(night));
        props.insert("expid".to_string(), TaskValue::Int(expid));
        props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
        props
    }

    #[test]
    fn test_per_camera_name_round_trip() {
        let props = camera_props(20210115, 42, "b0");
        let name = ExtractTask.name_join(&props).unwrap();
        assert_eq!(name, "extract_20210115_00000042_b0");
        assert_eq!(ExtractTask.name_split(&name).unwrap(), props);
    }

    #[test]
    fn test_name_split_rejects_wrong_type() {
        let name = "extract_20210115_00000042_b0";
        assert!(SkyTask.name_split(name).is_err());
        assert!(ExtractTask.name_split("extract_20210115").is_err());
    }

    #[test]
    fn test_starfit_deps_cover_all_bands() {
        let mut props = TaskProps::new();
        props.insert("night".to_string(), TaskValue::Int(20210115));
        props.insert("expid".to_string(), TaskValue::Int(42));
        props.insert("spectrograph".to_string(), TaskValue::Int(3));
        let deps = StarFitTask.deps(&props).unwrap();
        assert_eq!(deps.len(), 6);
        assert!(deps.contains(&"extract_20210115_00000042_b3".to_string()));
        assert!(deps.contains(&"sky_20210115_00000042_z3".to_string()));
    }

    #[test]
    fn test_fluxcalib_deps_reference_spectrograph_starfit() {
        let props = camera_props(20210115, 42, "r7");
        let deps = FluxCalibTask.deps(&props).unwrap();
        assert!(deps.contains(&"starfit_20210115_00000042_7".to_string()));
    }

    #[test]
    fn test_resource_estimates_are_declared() {
        let props = camera_props(20210115, 42, "b0");
        assert_eq!(PsfTask.run_max_procs(32).unwrap(), 20);
        assert_eq!(PreprocTask.run_max_procs(32).unwrap(), 1);
        assert!(PsfTask.run_time_minutes(&props).unwrap() > 0);
        assert!(ExtractTask.run_defaults().unwrap().get("psferr").is_some());
    }

    #[test]
    fn test_extraction_wavelengths_by_band() {
        let b0: Camera = "b0".parse().unwrap();
        let z9: Camera = "z9".parse().unwrap();
        assert!(extraction_wavelengths(b0).starts_with("3600.0"));
        assert!(extraction_wavelengths(z9).starts_with("7520.0"));
    }
}
