//! Stage-pipeline idempotence: a second pass over an exposure whose
//! outputs all exist must not invoke a single external routine, at any
//! worker count.

mod common;

use common::TestProduction;
use specpipe_core::camword::Camword;
use specpipe_core::constants::ObsType;
use specpipe_core::exec::RecordingRunner;
use specpipe_core::proc::{ExposurePipeline, ProcOptions};
use std::path::Path;
use std::sync::Arc;

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// Seed the raw file and the default calibration products the stages use
/// as inputs.
fn seed_inputs(prod: &TestProduction, night: i64, expid: i64, cameras: &Camword) {
    touch(&prod.paths.raw(night, expid));
    for camera in cameras.decode() {
        touch(&prod.paths.default_calib_psf(camera));
        touch(&prod.paths.default_calib_fiberflat(camera));
    }
}

fn flat_options(night: i64, expid: i64, cameras: &str, workers: usize) -> ProcOptions {
    ProcOptions {
        night,
        expid,
        obstype: ObsType::Flat,
        cameras: cameras.parse().unwrap(),
        workers,
        ..ProcOptions::default()
    }
}

#[tokio::test]
async fn test_flat_pipeline_runs_then_skips() {
    let prod = TestProduction::new();
    let cameras: Camword = "a0".parse().unwrap();
    seed_inputs(&prod, 20210115, 42, &cameras);

    let runner = Arc::new(RecordingRunner::new());
    let pipeline = ExposurePipeline::new(
        &prod.config,
        flat_options(20210115, 42, "a0", 2),
        runner.clone(),
    )
    .unwrap();
    pipeline.run().await.unwrap();

    // preproc + traceshift + extract + fiberflat over three cameras
    let first_run = runner.invocation_count();
    assert_eq!(first_run, 4 * 3);

    // all products exist for the declared outputs
    for camera in cameras.decode() {
        assert!(prod.paths.preproc(20210115, 42, camera).exists());
        assert!(prod.paths.frame(20210115, 42, camera).exists());
        assert!(prod.paths.fiberflat(20210115, 42, camera).exists());
    }

    // Second pass: everything skips, regardless of parallelism.
    for workers in [1, 3, 8] {
        let runner = Arc::new(RecordingRunner::new());
        let pipeline = ExposurePipeline::new(
            &prod.config,
            flat_options(20210115, 42, "a0", workers),
            runner.clone(),
        )
        .unwrap();
        pipeline.run().await.unwrap();
        assert_eq!(
            runner.invocation_count(),
            0,
            "re-run with {workers} workers must not re-execute anything"
        );
    }
}

#[tokio::test]
async fn test_arc_pipeline_produces_fit_psfs() {
    let prod = TestProduction::new();
    let cameras: Camword = "b0r0".parse().unwrap();
    seed_inputs(&prod, 20210115, 50, &cameras);

    let runner = Arc::new(RecordingRunner::new());
    let options = ProcOptions {
        night: 20210115,
        expid: 50,
        obstype: ObsType::Arc,
        cameras: cameras.clone(),
        workers: 2,
        ..ProcOptions::default()
    };
    let pipeline = ExposurePipeline::new(&prod.config, options.clone(), runner.clone()).unwrap();
    pipeline.run().await.unwrap();

    for camera in cameras.decode() {
        assert!(prod.paths.fit_psf(20210115, 50, camera).exists());
    }
    // preproc + arc traceshift + psf fit per camera
    assert_eq!(runner.invocation_count(), 3 * 2);

    let runner = Arc::new(RecordingRunner::new());
    let pipeline = ExposurePipeline::new(&prod.config, options, runner.clone()).unwrap();
    pipeline.run().await.unwrap();
    assert_eq!(runner.invocation_count(), 0);
}

#[tokio::test]
async fn test_partial_outputs_rerun_only_missing_cameras() {
    let prod = TestProduction::new();
    let cameras: Camword = "a1".parse().unwrap();
    seed_inputs(&prod, 20210115, 60, &cameras);

    let runner = Arc::new(RecordingRunner::new());
    let pipeline = ExposurePipeline::new(
        &prod.config,
        flat_options(20210115, 60, "a1", 2),
        runner.clone(),
    )
    .unwrap();
    pipeline.run().await.unwrap();

    // Lose one camera's frame: only the extraction for that camera should
    // re-run (plus nothing else).
    let lost: specpipe_core::camword::Camera = "r1".parse().unwrap();
    std::fs::remove_file(prod.paths.frame(20210115, 60, lost)).unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let pipeline = ExposurePipeline::new(
        &prod.config,
        flat_options(20210115, 60, "a1", 2),
        runner.clone(),
    )
    .unwrap();
    pipeline.run().await.unwrap();
    assert_eq!(runner.invocation_count(), 1);
    assert!(prod.paths.frame(20210115, 60, lost).exists());
}

#[tokio::test]
async fn test_science_pipeline_full_chain() {
    let prod = TestProduction::new();
    let cameras: Camword = "a0".parse().unwrap();
    seed_inputs(&prod, 20210115, 70, &cameras);

    let runner = Arc::new(RecordingRunner::new());
    let options = ProcOptions {
        night: 20210115,
        expid: 70,
        obstype: ObsType::Science,
        cameras: cameras.clone(),
        workers: 3,
        ..ProcOptions::default()
    };
    let pipeline = ExposurePipeline::new(&prod.config, options.clone(), runner.clone()).unwrap();
    let summary = pipeline.run().await.unwrap();

    for camera in cameras.decode() {
        assert!(prod.paths.sframe(20210115, 70, camera).exists());
        assert!(prod.paths.cframe(20210115, 70, camera).exists());
    }
    assert!(prod.paths.stdstars(20210115, 70, 0).exists());
    let stage_names: Vec<&str> = summary.stages.iter().map(|s| s.name.as_str()).collect();
    assert!(stage_names.contains(&"fibermap"));
    assert!(stage_names.contains(&"skysub"));
    assert!(stage_names.contains(&"stdstarfit"));

    // full rerun skips every numerical routine (the fibermap also exists)
    let runner = Arc::new(RecordingRunner::new());
    let pipeline = ExposurePipeline::new(&prod.config, options, runner.clone()).unwrap();
    pipeline.run().await.unwrap();
    assert_eq!(runner.invocation_count(), 0);
}

#[tokio::test]
async fn test_psf_failure_aborts_exposure() {
    // Without the raw file the preproc contract fails per camera; the PSF
    // stage then cannot find its inputs and the exposure is aborted.
    let prod = TestProduction::new();
    let cameras: Camword = "b0".parse().unwrap();
    for camera in cameras.decode() {
        touch(&prod.paths.default_calib_psf(camera));
    }

    let runner = Arc::new(RecordingRunner::new());
    let options = ProcOptions {
        night: 20210115,
        expid: 80,
        obstype: ObsType::Arc,
        cameras,
        ..ProcOptions::default()
    };
    let pipeline = ExposurePipeline::new(&prod.config, options, runner).unwrap();
    assert!(pipeline.run().await.is_err());
}
