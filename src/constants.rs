//! # System Constants
//!
//! Core constants and enumerations that define the operational boundaries of
//! the spectrograph processing pipeline: observation types, processing flags,
//! instrument geometry, and scheduling thresholds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Observation type recorded in the raw exposure header.
///
/// The obstype governs which reduction stages apply to an exposure and how
/// the daily manager routes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObsType {
    Science,
    Arc,
    Flat,
    Zero,
    Dark,
    TestArc,
    TestFlat,
    PixFlat,
    Sky,
    Twilight,
    Other,
}

impl ObsType {
    /// Obstypes recorded in the exposure table by default.
    pub fn default_for_exptable() -> Vec<ObsType> {
        vec![
            ObsType::Arc,
            ObsType::Flat,
            ObsType::Twilight,
            ObsType::Science,
            ObsType::Sky,
            ObsType::Zero,
            ObsType::Dark,
        ]
    }

    /// Obstypes eligible for processing-table rows by default.
    pub fn default_for_proctable() -> Vec<ObsType> {
        vec![ObsType::Arc, ObsType::Flat, ObsType::Science]
    }

    /// Calibration lamp exposures that feed the nightly PSF fit.
    pub fn is_arc_like(&self) -> bool {
        matches!(self, ObsType::Arc | ObsType::TestArc)
    }

    /// Continuum lamp exposures that feed the nightly fiberflat.
    pub fn is_flat_like(&self) -> bool {
        matches!(self, ObsType::Flat | ObsType::TestFlat)
    }
}

impl fmt::Display for ObsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObsType::Science => "science",
            ObsType::Arc => "arc",
            ObsType::Flat => "flat",
            ObsType::Zero => "zero",
            ObsType::Dark => "dark",
            ObsType::TestArc => "testarc",
            ObsType::TestFlat => "testflat",
            ObsType::PixFlat => "pixflat",
            ObsType::Sky => "sky",
            ObsType::Twilight => "twilight",
            ObsType::Other => "other",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ObsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "science" => Ok(ObsType::Science),
            "arc" => Ok(ObsType::Arc),
            "flat" => Ok(ObsType::Flat),
            "zero" => Ok(ObsType::Zero),
            "dark" => Ok(ObsType::Dark),
            "testarc" => Ok(ObsType::TestArc),
            "testflat" => Ok(ObsType::TestFlat),
            "pixflat" => Ok(ObsType::PixFlat),
            "sky" => Ok(ObsType::Sky),
            "twilight" => Ok(ObsType::Twilight),
            "other" => Ok(ObsType::Other),
            other => Err(format!("Unknown obstype: {other}")),
        }
    }
}

/// Last reduction step requested for an exposure.
///
/// `Ignore` removes the exposure from processing entirely; `SkySub` stops
/// after sky subtraction (no standard-star or flux-calibration steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastStep {
    All,
    SkySub,
    FluxCalib,
    Ignore,
}

impl Default for LastStep {
    fn default() -> Self {
        LastStep::All
    }
}

impl fmt::Display for LastStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LastStep::All => "all",
            LastStep::SkySub => "skysub",
            LastStep::FluxCalib => "fluxcalib",
            LastStep::Ignore => "ignore",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LastStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" | "" => Ok(LastStep::All),
            "skysub" => Ok(LastStep::SkySub),
            "fluxcalib" => Ok(LastStep::FluxCalib),
            "ignore" => Ok(LastStep::Ignore),
            other => Err(format!("Unknown laststep: {other}")),
        }
    }
}

/// Redshift grouping types that may be submitted alongside science tiles.
pub const KNOWN_ZSUBMIT_TYPES: &[&str] = &["cumulative", "pernight-v0", "pernight", "perexp"];

/// Instrument geometry.
pub mod instrument {
    /// Number of spectrographs (petals) in the instrument.
    pub const NUM_SPECTROGRAPHS: u8 = 10;

    /// Fibers routed to each spectrograph.
    pub const FIBERS_PER_SPECTROGRAPH: u32 = 500;

    /// Fibers read out through a single CCD amplifier.
    pub const FIBERS_PER_AMP: u32 = 250;

    /// Camword covering every camera of every spectrograph.
    pub const FULL_CAMWORD: &str = "a0123456789";
}

/// Scheduling thresholds used by the daily manager.
pub mod scheduling {
    /// Arc exposures longer than this are lamp warm-up frames, not
    /// calibration data, and are routed to the unprocessed table.
    pub const MAX_ARC_EXPTIME_SECS: f64 = 8.0;

    /// Flat sequences with SEQTOT at or above this are short calibration-lamp
    /// programs excluded from the nightly fiberflat.
    pub const MAX_FLAT_SEQTOT_FOR_NIGHTLY: i64 = 5;

    /// Default wait between scans for new raw data, in seconds.
    pub const DEFAULT_DATA_CADENCE_SECS: u64 = 300;

    /// Default wait between batch-queue reconciliation passes, in seconds.
    pub const DEFAULT_QUEUE_CADENCE_SECS: u64 = 1800;

    /// Sentinel exit code for unrecoverable configuration errors.
    pub const EXIT_BAD_CONFIG: i32 = 12;

    /// Sentinel exit code for a failed fibermap assembly on a science frame.
    pub const EXIT_BAD_FIBERMAP: i32 = 13;

    /// Nights before this date may lack positioner coordinates files, so
    /// fibermap assembly is retried with --force instead of failing.
    pub const COORDS_EPOCH_NIGHT: i64 = 20200310;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obstype_round_trip() {
        for ot in [
            ObsType::Science,
            ObsType::Arc,
            ObsType::TestFlat,
            ObsType::Twilight,
        ] {
            assert_eq!(ot.to_string().parse::<ObsType>().unwrap(), ot);
        }
        assert_eq!("SCIENCE".parse::<ObsType>().unwrap(), ObsType::Science);
        assert!("spectra".parse::<ObsType>().is_err());
    }

    #[test]
    fn test_laststep_defaults() {
        assert_eq!(LastStep::default(), LastStep::All);
        assert_eq!("".parse::<LastStep>().unwrap(), LastStep::All);
        assert_eq!("SKYSUB".parse::<LastStep>().unwrap(), LastStep::SkySub);
    }

    #[test]
    fn test_proctable_types_subset_of_exptable_types() {
        let exp = ObsType::default_for_exptable();
        for ot in ObsType::default_for_proctable() {
            assert!(exp.contains(&ot));
        }
    }
}
