//! # Production File Locations
//!
//! Deterministic path naming for every per-exposure and per-night data
//! product. Stage idempotence depends entirely on these names being
//! deterministic and collision-free: a stage is skipped exactly when the
//! files named here already exist.

use crate::camword::Camera;
use crate::config::PipelineConfig;
use std::path::PathBuf;

/// Path naming for one production, derived from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct ProdPaths {
    raw_root: PathBuf,
    prod_root: PathBuf,
}

impl ProdPaths {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            raw_root: PathBuf::from(&config.raw_data_dir),
            prod_root: config.specprod_root(),
        }
    }

    /// Raw exposure directory: `<raw>/<night>/<expid>`.
    pub fn raw_exposure_dir(&self, night: i64, expid: i64) -> PathBuf {
        self.raw_root
            .join(night.to_string())
            .join(format!("{expid:08}"))
    }

    /// Raw detector data for one exposure.
    pub fn raw(&self, night: i64, expid: i64) -> PathBuf {
        self.raw_exposure_dir(night, expid)
            .join(format!("raw-{expid:08}.fits.fz"))
    }

    /// Observation request metadata written by the instrument control system.
    pub fn request(&self, night: i64, expid: i64) -> PathBuf {
        self.raw_exposure_dir(night, expid)
            .join(format!("request-{expid:08}.json"))
    }

    /// Completion marker; its appearance means the exposure is fully on disk.
    pub fn checksum(&self, night: i64, expid: i64) -> PathBuf {
        self.raw_exposure_dir(night, expid)
            .join(format!("checksum-{expid:08}.sha256"))
    }

    fn preproc_dir(&self, night: i64, expid: i64) -> PathBuf {
        self.prod_root
            .join("preproc")
            .join(night.to_string())
            .join(format!("{expid:08}"))
    }

    fn exposure_dir(&self, night: i64, expid: i64) -> PathBuf {
        self.prod_root
            .join("exposures")
            .join(night.to_string())
            .join(format!("{expid:08}"))
    }

    fn calibnight_dir(&self, night: i64) -> PathBuf {
        self.prod_root.join("calibnight").join(night.to_string())
    }

    pub fn fibermap(&self, night: i64, expid: i64) -> PathBuf {
        self.preproc_dir(night, expid)
            .join(format!("fibermap-{expid:08}.fits"))
    }

    pub fn preproc(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.preproc_dir(night, expid)
            .join(format!("preproc-{camera}-{expid:08}.fits"))
    }

    /// Trace-shifted PSF for one camera of one exposure.
    pub fn psf(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("psf-{camera}-{expid:08}.fits"))
    }

    /// Shifted input PSF, the starting point of the arc PSF fit.
    pub fn shifted_input_psf(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("shifted-input-psf-{camera}-{expid:08}.fits"))
    }

    /// Fitted PSF produced from a single arc exposure.
    pub fn fit_psf(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("fit-psf-{camera}-{expid:08}.fits"))
    }

    /// Nightly PSF jointly fit from the arc sequence.
    pub fn psfnight(&self, night: i64, camera: Camera) -> PathBuf {
        self.calibnight_dir(night)
            .join(format!("psfnight-{camera}-{night}.fits"))
    }

    pub fn frame(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("frame-{camera}-{expid:08}.fits"))
    }

    /// Fiberflat-fielded (but not sky-subtracted) frame.
    pub fn fframe(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("fframe-{camera}-{expid:08}.fits"))
    }

    pub fn fiberflat(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("fiberflat-{camera}-{expid:08}.fits"))
    }

    /// Nightly fiberflat jointly computed from the flat sequence.
    pub fn fiberflatnight(&self, night: i64, camera: Camera) -> PathBuf {
        self.calibnight_dir(night)
            .join(format!("fiberflatnight-{camera}-{night}.fits"))
    }

    /// Record of which fibers the sky-selection step chose for one camera.
    pub fn skyfibers(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("skyfibers-{camera}-{expid:08}.json"))
    }

    pub fn sky(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("sky-{camera}-{expid:08}.fits"))
    }

    /// Sky-subtracted, flatfielded frame (not yet flux calibrated).
    pub fn sframe(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("sframe-{camera}-{expid:08}.fits"))
    }

    /// Standard-star models, fit per spectrograph rather than per camera.
    pub fn stdstars(&self, night: i64, expid: i64, spectrograph: u8) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("stdstars-{spectrograph}-{expid:08}.fits"))
    }

    pub fn fluxcalib(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("fluxcalib-{camera}-{expid:08}.fits"))
    }

    /// Final calibrated frame.
    pub fn cframe(&self, night: i64, expid: i64, camera: Camera) -> PathBuf {
        self.exposure_dir(night, expid)
            .join(format!("cframe-{camera}-{expid:08}.fits"))
    }

    /// Default calibration PSF used when no nightly product exists yet.
    pub fn default_calib_psf(&self, camera: Camera) -> PathBuf {
        self.prod_root
            .join("calib")
            .join(format!("psf-{camera}.fits"))
    }

    /// Default calibration fiberflat used when no nightly product exists.
    pub fn default_calib_fiberflat(&self, camera: Camera) -> PathBuf {
        self.prod_root
            .join("calib")
            .join(format!("fiberflat-{camera}.fits"))
    }

    /// Directory for generated batch scripts of one night.
    pub fn batch_script_dir(&self, night: i64) -> PathBuf {
        self.prod_root
            .join("run")
            .join("scripts")
            .join("night")
            .join(night.to_string())
    }

    /// Directory holding the exposure tables, grouped by month.
    pub fn exposure_table_dir(&self, night: i64) -> PathBuf {
        let month = night / 100;
        self.prod_root
            .join("exposure_tables")
            .join(month.to_string())
    }

    /// Directory holding the processing tables.
    pub fn processing_table_dir(&self) -> PathBuf {
        self.prod_root.join("processing_tables")
    }

    /// Per-night task bookkeeping database.
    pub fn task_db(&self, night: i64) -> PathBuf {
        self.prod_root
            .join("run")
            .join(format!("tasks-{night}.sqlite"))
    }

    pub fn exposure_table(&self, night: i64, extension: &str) -> PathBuf {
        self.exposure_table_dir(night)
            .join(format!("exposure_table_{night}.{extension}"))
    }

    pub fn processing_table(&self, night: i64, extension: &str) -> PathBuf {
        self.processing_table_dir()
            .join(format!("processing_table_{night}.{extension}"))
    }

    pub fn unprocessed_table(&self, night: i64, extension: &str) -> PathBuf {
        self.processing_table_dir()
            .join(format!("unprocessed_table_{night}.{extension}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camword::{Band, Camera};

    fn paths() -> ProdPaths {
        ProdPaths::new(&PipelineConfig::default())
    }

    #[test]
    fn test_frame_naming_is_deterministic() {
        let cam = Camera::new(Band::B, 0).unwrap();
        let a = paths().frame(20210115, 73, cam);
        let b = paths().frame(20210115, 73, cam);
        assert_eq!(a, b);
        assert!(a.to_string_lossy().ends_with("frame-b0-00000073.fits"));
    }

    #[test]
    fn test_per_camera_products_do_not_collide() {
        let b0 = Camera::new(Band::B, 0).unwrap();
        let r0 = Camera::new(Band::R, 0).unwrap();
        assert_ne!(paths().frame(20210115, 73, b0), paths().frame(20210115, 73, r0));
        assert_ne!(
            paths().frame(20210115, 73, b0),
            paths().frame(20210115, 74, b0)
        );
    }

    #[test]
    fn test_nightly_products_live_in_calibnight() {
        let cam = Camera::new(Band::Z, 5).unwrap();
        let p = paths().psfnight(20210115, cam);
        assert!(p.to_string_lossy().contains("calibnight/20210115"));
    }

    #[test]
    fn test_exposure_table_is_grouped_by_month() {
        let p = paths().exposure_table(20210115, "csv");
        assert!(p.to_string_lossy().contains("exposure_tables/202101"));
    }
}
