//! # Pipeline Configuration
//!
//! Layered configuration for the processing core: built-in defaults, an
//! optional TOML file, and `SPECPIPE_*` environment overrides, in that
//! order. The same struct feeds the daily manager, the per-exposure
//! pipeline, and the batch planner so path conventions never diverge.

use crate::error::{Result, SpecpipeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the raw data tree; night directories live directly below.
    pub raw_data_dir: String,
    /// Root of the reduction tree; productions live directly below.
    pub redux_dir: String,
    /// Name of the current production.
    pub specprod: String,
    /// File extension (without dot) for the exposure/processing tables.
    pub tab_filetype: String,
    /// Batch system profile name used by the resource planner.
    pub batch_system: String,
    /// Batch queue jobs are submitted to.
    pub queue: String,
    /// Standard-star template library passed to the joint fit.
    pub stdstar_templates: String,
    /// Seconds between scans for new raw data.
    pub data_cadence_secs: u64,
    /// Seconds between batch-queue reconciliation passes.
    pub queue_cadence_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: "/data/spectro/raw".to_string(),
            redux_dir: "/data/spectro/redux".to_string(),
            specprod: "daily".to_string(),
            tab_filetype: "csv".to_string(),
            batch_system: "cori-haswell".to_string(),
            queue: "realtime".to_string(),
            stdstar_templates: "/data/spectro/templates/stdstar_templates_v2.2.fits".to_string(),
            data_cadence_secs: crate::constants::scheduling::DEFAULT_DATA_CADENCE_SECS,
            queue_cadence_secs: crate::constants::scheduling::DEFAULT_QUEUE_CADENCE_SECS,
        }
    }
}

impl PipelineConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `SPECPIPE_*` environment variables.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let mut builder = config::Config::builder()
            .set_default("raw_data_dir", defaults.raw_data_dir.clone())
            .and_then(|b| b.set_default("redux_dir", defaults.redux_dir.clone()))
            .and_then(|b| b.set_default("specprod", defaults.specprod.clone()))
            .and_then(|b| b.set_default("tab_filetype", defaults.tab_filetype.clone()))
            .and_then(|b| b.set_default("batch_system", defaults.batch_system.clone()))
            .and_then(|b| b.set_default("queue", defaults.queue.clone()))
            .and_then(|b| b.set_default("stdstar_templates", defaults.stdstar_templates.clone()))
            .and_then(|b| b.set_default("data_cadence_secs", defaults.data_cadence_secs))
            .and_then(|b| b.set_default("queue_cadence_secs", defaults.queue_cadence_secs))
            .map_err(|e| SpecpipeError::ConfigurationError(e.to_string()))?;

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("SPECPIPE"));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SpecpipeError::ConfigurationError(e.to_string()))
    }

    /// Root directory of the current production.
    pub fn specprod_root(&self) -> PathBuf {
        PathBuf::from(&self.redux_dir).join(&self.specprod)
    }

    /// Night directory in the raw data tree.
    pub fn raw_night_dir(&self, night: i64) -> PathBuf {
        PathBuf::from(&self.raw_data_dir).join(night.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.tab_filetype, "csv");
        assert!(cfg.specprod_root().ends_with("daily"));
        assert_eq!(cfg.data_cadence_secs, 300);
    }

    #[test]
    fn test_load_without_file_matches_defaults() {
        let cfg = PipelineConfig::load(None).unwrap();
        assert_eq!(cfg.queue, PipelineConfig::default().queue);
    }

    #[test]
    fn test_raw_night_dir() {
        let cfg = PipelineConfig::default();
        assert!(cfg
            .raw_night_dir(20210115)
            .to_string_lossy()
            .ends_with("raw/20210115"));
    }
}
