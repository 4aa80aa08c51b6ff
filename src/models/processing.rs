//! # Processing Table Rows
//!
//! One row per scheduled unit of work. Rows are created when an exposure or
//! joint-fit unit is ready to be scheduled and mutated by state-transition
//! updates; terminal states are `done` and `fail`, with failures eligible
//! for resubmission rather than deletion.

use crate::camword::Camword;
use crate::constants::{LastStep, ObsType};
use crate::models::exposure::ExposureRow;
use crate::state_machine::TaskState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of batch job a processing row represents. Science exposures split
/// into a pre-standard-star phase and a post-standard-star phase, with the
/// joint standard-star fit between them; calibration types map one-to-one
/// from their obstype, plus the two nightly joint products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobDesc {
    Science,
    Prestdstar,
    Poststdstar,
    Stdstarfit,
    Arc,
    Flat,
    Psfnight,
    Nightlyflat,
    Dark,
    Zero,
    Sky,
    Twilight,
    Testarc,
    Testflat,
}

impl JobDesc {
    /// True for jobs computed jointly from several member rows.
    pub fn is_joint(&self) -> bool {
        matches!(
            self,
            JobDesc::Psfnight | JobDesc::Nightlyflat | JobDesc::Stdstarfit
        )
    }
}

impl From<ObsType> for JobDesc {
    fn from(obstype: ObsType) -> Self {
        match obstype {
            ObsType::Science => JobDesc::Science,
            ObsType::Arc => JobDesc::Arc,
            ObsType::Flat => JobDesc::Flat,
            ObsType::Dark => JobDesc::Dark,
            ObsType::Zero => JobDesc::Zero,
            ObsType::Sky => JobDesc::Sky,
            ObsType::Twilight => JobDesc::Twilight,
            ObsType::TestArc => JobDesc::Testarc,
            ObsType::TestFlat => JobDesc::Testflat,
            ObsType::PixFlat | ObsType::Other => JobDesc::Science,
        }
    }
}

impl fmt::Display for JobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobDesc::Science => "science",
            JobDesc::Prestdstar => "prestdstar",
            JobDesc::Poststdstar => "poststdstar",
            JobDesc::Stdstarfit => "stdstarfit",
            JobDesc::Arc => "arc",
            JobDesc::Flat => "flat",
            JobDesc::Psfnight => "psfnight",
            JobDesc::Nightlyflat => "nightlyflat",
            JobDesc::Dark => "dark",
            JobDesc::Zero => "zero",
            JobDesc::Sky => "sky",
            JobDesc::Twilight => "twilight",
            JobDesc::Testarc => "testarc",
            JobDesc::Testflat => "testflat",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobDesc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "science" => Ok(JobDesc::Science),
            "prestdstar" => Ok(JobDesc::Prestdstar),
            "poststdstar" => Ok(JobDesc::Poststdstar),
            "stdstarfit" => Ok(JobDesc::Stdstarfit),
            "arc" => Ok(JobDesc::Arc),
            "flat" => Ok(JobDesc::Flat),
            "psfnight" => Ok(JobDesc::Psfnight),
            "nightlyflat" => Ok(JobDesc::Nightlyflat),
            "dark" => Ok(JobDesc::Dark),
            "zero" => Ok(JobDesc::Zero),
            "sky" => Ok(JobDesc::Sky),
            "twilight" => Ok(JobDesc::Twilight),
            "testarc" => Ok(JobDesc::Testarc),
            "testflat" => Ok(JobDesc::Testflat),
            other => Err(format!("Unknown jobdesc: {other}")),
        }
    }
}

/// Pipe-joined integer lists for CSV persistence, e.g. `101|102|103`.
pub mod pipe_ints {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ids: &[i64],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let joined = ids
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("|");
        serializer.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<i64>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        s.split('|')
            .map(|tok| {
                tok.trim()
                    .parse::<i64>()
                    .map_err(|e| serde::de::Error::custom(format!("bad id '{tok}': {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRow {
    /// Member exposure ids; joint jobs reference several.
    #[serde(rename = "EXPID", with = "pipe_ints")]
    pub expids: Vec<i64>,
    #[serde(rename = "NIGHT")]
    pub night: i64,
    #[serde(rename = "OBSTYPE")]
    pub obstype: ObsType,
    #[serde(rename = "TILEID")]
    pub tileid: i64,
    /// Cameras actually processed; may shrink via partial-completion pruning.
    #[serde(rename = "PROCCAMWORD")]
    pub proccamword: Camword,
    /// Internal sequential id, unique within the production.
    #[serde(rename = "INTID")]
    pub intid: i64,
    #[serde(rename = "JOBDESC")]
    pub jobdesc: JobDesc,
    /// Internal ids of upstream rows this job depends on.
    #[serde(rename = "INT_DEP_IDS", with = "pipe_ints")]
    pub int_dep_ids: Vec<i64>,
    /// Most recent batch-queue job id, 0 before first submission.
    #[serde(rename = "LATEST_QID")]
    pub latest_qid: i64,
    #[serde(rename = "STATUS")]
    pub status: TaskState,
    #[serde(rename = "SCRIPTNAME")]
    pub scriptname: String,
    #[serde(rename = "LASTSTEP")]
    pub laststep: LastStep,
    #[serde(rename = "BADAMPS")]
    pub badamps: String,
}

impl ProcessingRow {
    /// First member exposure id; every row has at least one.
    pub fn first_expid(&self) -> i64 {
        self.expids.first().copied().unwrap_or(0)
    }
}

/// Derive a processing row from an exposure row. The processed camword is
/// the exposure's camword minus its bad cameras, the job description maps
/// from the obstype, and the lifecycle starts at `waiting`. The internal id
/// is assigned by the caller, which owns the id sequence.
pub fn erow_to_prow(erow: &ExposureRow, intid: i64) -> ProcessingRow {
    ProcessingRow {
        expids: vec![erow.expid],
        night: erow.night,
        obstype: erow.obstype,
        tileid: erow.tileid,
        proccamword: erow.proc_camword(),
        intid,
        jobdesc: JobDesc::from(erow.obstype),
        int_dep_ids: Vec::new(),
        latest_qid: 0,
        status: TaskState::Waiting,
        scriptname: String::new(),
        laststep: erow.laststep,
        badamps: erow.badamps.clone(),
    }
}
