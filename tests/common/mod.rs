//! Shared fixtures for integration tests: a temporary production tree and
//! raw-data writers that mimic the instrument control system's output.
#![allow(dead_code)] // not every test crate uses every fixture

use specpipe_core::config::PipelineConfig;
use specpipe_core::paths::ProdPaths;
use std::path::Path;
use tempfile::TempDir;

pub struct TestProduction {
    pub dir: TempDir,
    pub config: PipelineConfig,
    pub paths: ProdPaths,
}

impl TestProduction {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = PipelineConfig {
            raw_data_dir: dir.path().join("raw").display().to_string(),
            redux_dir: dir.path().join("redux").display().to_string(),
            specprod: "testprod".to_string(),
            ..PipelineConfig::default()
        };
        let paths = ProdPaths::new(&config);
        Self { dir, config, paths }
    }
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// Write the raw-side files for one exposure: request metadata, raw data,
/// and the completion marker the manager scans for.
pub fn write_exposure(prod: &TestProduction, night: i64, expid: i64, request_json: &str) {
    let request = prod.paths.request(night, expid);
    std::fs::create_dir_all(request.parent().unwrap()).unwrap();
    std::fs::write(&request, request_json).unwrap();
    touch(&prod.paths.raw(night, expid));
    touch(&prod.paths.checksum(night, expid));
}

/// Request body for a calibration or science exposure.
pub fn request_body(obstype: &str, exptime: f64, tileid: Option<i64>) -> String {
    match tileid {
        Some(tile) => format!(
            r#"{{"obstype": "{obstype}", "exptime": {exptime}, "tileid": {tile}}}"#
        ),
        None => format!(r#"{{"obstype": "{obstype}", "exptime": {exptime}}}"#),
    }
}

/// Request body carrying an end-of-sequence program marker.
pub fn marker_body(marker: &str) -> String {
    format!(r#"{{"obstype": "ZERO", "exptime": 0.0, "program": "{marker}"}}"#)
}
