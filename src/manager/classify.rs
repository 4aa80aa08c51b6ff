//! # Exposure Classifier
//!
//! Inspects a newly-arrived exposure's request metadata and produces either
//! an exposure-table row, an end-of-sequence marker, or a skip decision.
//! The request file is written by the instrument control system alongside
//! the raw data; the heavyweight raw-header inspection lives in the
//! external FITS layer.

use crate::camword::Camword;
use crate::constants::{LastStep, ObsType};
use crate::error::{Result, SpecpipeError};
use crate::models::exposure::{ExposureRow, NO_TILEID};
use crate::paths::ProdPaths;
use serde::Deserialize;

/// Observation request metadata for one exposure.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFile {
    pub obstype: String,
    #[serde(default)]
    pub exptime: f64,
    #[serde(default)]
    pub tileid: Option<i64>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub seqnum: Option<i64>,
    #[serde(default)]
    pub seqtot: Option<i64>,
    #[serde(default)]
    pub camword: Option<String>,
    #[serde(default)]
    pub laststep: Option<String>,
    #[serde(default)]
    pub headererr: Option<String>,
}

/// What the classifier made of one exposure.
#[derive(Debug, Clone)]
pub enum ExposureSummary {
    Row(Box<ExposureRow>),
    /// The arc calibration sequence has ended; fit the nightly PSF.
    EndOfArcs,
    /// The long flat sequence has ended; fit the nightly flat.
    EndOfFlats,
    /// A short flat program ended; its flats do not feed the nightly flat.
    EndOfShortFlats,
    /// Not something the exposure table records.
    Skip(String),
}

/// Classify one exposure from its request file.
pub fn summarize_exposure(
    paths: &ProdPaths,
    night: i64,
    expid: i64,
    expobstypes: &[ObsType],
) -> Result<ExposureSummary> {
    let request_path = paths.request(night, expid);
    if !request_path.exists() {
        return Ok(ExposureSummary::Skip(format!(
            "No request file for exposure {expid}"
        )));
    }
    let request: RequestFile = serde_json::from_slice(&std::fs::read(&request_path)?)
        .map_err(|e| {
            SpecpipeError::ClassificationError(format!(
                "Malformed request file {}: {e}",
                request_path.display()
            ))
        })?;

    // Sequence-end markers arrive as program annotations on otherwise
    // dataless exposures.
    if let Some(program) = &request.program {
        let normalized: String = program
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if normalized.contains("endofshortflats") {
            return Ok(ExposureSummary::EndOfShortFlats);
        }
        if normalized.contains("endofarcs") {
            return Ok(ExposureSummary::EndOfArcs);
        }
        if normalized.contains("endofflats") {
            return Ok(ExposureSummary::EndOfFlats);
        }
    }

    let obstype: ObsType = match request.obstype.parse() {
        Ok(obstype) => obstype,
        Err(e) => return Ok(ExposureSummary::Skip(e)),
    };
    if !expobstypes.contains(&obstype) {
        return Ok(ExposureSummary::Skip(format!(
            "Obstype {obstype} not in exposure-table types"
        )));
    }

    let mut row = ExposureRow::new(night, expid, obstype);
    row.exptime = request.exptime;
    row.tileid = request.tileid.unwrap_or(NO_TILEID);
    row.seqnum = request.seqnum.unwrap_or(1);
    row.seqtot = request.seqtot.unwrap_or(1);
    if let Some(camword) = &request.camword {
        row.camword = camword.parse::<Camword>()?;
    }
    if let Some(laststep) = &request.laststep {
        row.laststep = laststep
            .parse::<LastStep>()
            .map_err(SpecpipeError::ClassificationError)?;
    }
    if let Some(headererr) = &request.headererr {
        row.headererr = headererr.clone();
    }
    Ok(ExposureSummary::Row(Box::new(row)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use tempfile::tempdir;

    fn write_request(paths: &ProdPaths, night: i64, expid: i64, body: &str) {
        let path = paths.request(night, expid);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn setup() -> (tempfile::TempDir, ProdPaths) {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.raw_data_dir = dir.path().join("raw").display().to_string();
        config.redux_dir = dir.path().join("redux").display().to_string();
        let paths = ProdPaths::new(&config);
        (dir, paths)
    }

    #[test]
    fn test_science_row_from_request() {
        let (_dir, paths) = setup();
        write_request(
            &paths,
            20210115,
            42,
            r#"{"obstype": "SCIENCE", "exptime": 900.0, "tileid": 80605, "camword": "a012"}"#,
        );
        let summary =
            summarize_exposure(&paths, 20210115, 42, &ObsType::default_for_exptable()).unwrap();
        let ExposureSummary::Row(row) = summary else {
            panic!("expected a row");
        };
        assert_eq!(row.obstype, ObsType::Science);
        assert_eq!(row.tileid, 80605);
        assert_eq!(row.camword, "a012".parse().unwrap());
    }

    #[test]
    fn test_end_of_sequence_markers() {
        let (_dir, paths) = setup();
        write_request(
            &paths,
            20210115,
            50,
            r#"{"obstype": "ZERO", "program": "calibration End Of Arcs done"}"#,
        );
        assert!(matches!(
            summarize_exposure(&paths, 20210115, 50, &ObsType::default_for_exptable()).unwrap(),
            ExposureSummary::EndOfArcs
        ));

        write_request(
            &paths,
            20210115,
            51,
            r#"{"obstype": "ZERO", "program": "end of short flats"}"#,
        );
        assert!(matches!(
            summarize_exposure(&paths, 20210115, 51, &ObsType::default_for_exptable()).unwrap(),
            ExposureSummary::EndOfShortFlats
        ));
    }

    #[test]
    fn test_missing_request_is_a_skip() {
        let (_dir, paths) = setup();
        assert!(matches!(
            summarize_exposure(&paths, 20210115, 99, &ObsType::default_for_exptable()).unwrap(),
            ExposureSummary::Skip(_)
        ));
    }

    #[test]
    fn test_unlisted_obstype_is_a_skip() {
        let (_dir, paths) = setup();
        write_request(&paths, 20210115, 60, r#"{"obstype": "TWILIGHT"}"#);
        let only_science = [ObsType::Science];
        assert!(matches!(
            summarize_exposure(&paths, 20210115, 60, &only_science).unwrap(),
            ExposureSummary::Skip(_)
        ));
    }

    #[test]
    fn test_malformed_request_is_an_error() {
        let (_dir, paths) = setup();
        write_request(&paths, 20210115, 61, "not json at all");
        assert!(summarize_exposure(&paths, 20210115, 61, &ObsType::default_for_exptable()).is_err());
    }
}
