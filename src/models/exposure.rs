//! # Exposure Table Rows
//!
//! One row per raw exposure observed on disk. Rows are created when an
//! exposure first appears, mutated only by the daily manager and explicit
//! edit operations, and never deleted; unwanted exposures are routed to
//! the unprocessed table instead.

use crate::camword::Camword;
use crate::constants::{LastStep, ObsType};
use serde::{Deserialize, Serialize};

/// Sentinel tile id for exposures that are not science tiles.
pub const NO_TILEID: i64 = -99;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureRow {
    #[serde(rename = "EXPID")]
    pub expid: i64,
    #[serde(rename = "NIGHT")]
    pub night: i64,
    #[serde(rename = "OBSTYPE")]
    pub obstype: ObsType,
    #[serde(rename = "TILEID")]
    pub tileid: i64,
    #[serde(rename = "EXPTIME")]
    pub exptime: f64,
    /// Position of this exposure within its observing sequence (1-based).
    #[serde(rename = "SEQNUM")]
    pub seqnum: i64,
    /// Total exposures in the observing sequence.
    #[serde(rename = "SEQTOT")]
    pub seqtot: i64,
    /// Cameras with data in the raw file.
    #[serde(rename = "CAMWORD")]
    pub camword: Camword,
    /// Cameras to exclude from processing, e.g. known-bad hardware.
    #[serde(rename = "BADCAMWORD")]
    pub badcamword: Camword,
    /// Flagged amplifiers, `[brz][0-9][ABCD]` comma separated.
    #[serde(rename = "BADAMPS")]
    pub badamps: String,
    #[serde(rename = "LASTSTEP")]
    pub laststep: LastStep,
    /// Pipe-separated quality annotations, e.g. `aborted|short`.
    #[serde(rename = "EXPFLAG")]
    pub expflag: String,
    /// Pipe-separated header-error annotations.
    #[serde(rename = "HEADERERR")]
    pub headererr: String,
    #[serde(rename = "COMMENTS")]
    pub comments: String,
}

impl ExposureRow {
    /// A minimally-populated row for an exposure of the given type; the
    /// classifier fills in the rest from the request metadata.
    pub fn new(night: i64, expid: i64, obstype: ObsType) -> Self {
        Self {
            expid,
            night,
            obstype,
            tileid: NO_TILEID,
            exptime: 0.0,
            seqnum: 1,
            seqtot: 1,
            camword: Camword::full(),
            badcamword: Camword::empty(),
            badamps: String::new(),
            laststep: LastStep::All,
            expflag: String::new(),
            headererr: String::new(),
            comments: String::new(),
        }
    }

    /// Cameras that should actually be processed for this exposure.
    pub fn proc_camword(&self) -> Camword {
        self.camword.difference(&self.badcamword)
    }

    /// Append a quality annotation, keeping the pipe-separated encoding.
    pub fn add_expflag(&mut self, flag: &str) {
        if self.expflag.is_empty() {
            self.expflag = flag.to_string();
        } else {
            self.expflag = format!("{}|{}", self.expflag, flag);
        }
    }
}
