//! # Resumption State
//!
//! The manager may be killed and restarted at any point; the persisted
//! exposure and processing tables are the sole source of truth. The
//! reconstruction here must leave the in-memory accumulators exactly as an
//! uninterrupted run over the same exposures would have left them.

use crate::constants::ObsType;
use crate::models::processing::{JobDesc, ProcessingRow};

/// In-memory scheduling state of one night.
#[derive(Debug, Default, Clone)]
pub struct NightAccumulators {
    pub arcs: Vec<ProcessingRow>,
    pub flats: Vec<ProcessingRow>,
    pub sciences: Vec<ProcessingRow>,
    pub arcjob: Option<ProcessingRow>,
    pub flatjob: Option<ProcessingRow>,
    pub lasttype: Option<ObsType>,
    pub lasttile: Option<i64>,
    pub internal_id: i64,
}

/// Internal ids are seeded from the night so that two nights can never
/// collide and resumption reproduces the id sequence exactly.
pub fn starting_internal_id(night: i64) -> i64 {
    (night % 1_000_000) * 1000
}

/// Rebuild the accumulators from a previously persisted processing table.
pub fn parse_previous_tables(ptable: &[ProcessingRow], night: i64) -> NightAccumulators {
    let mut state = NightAccumulators {
        internal_id: starting_internal_id(night),
        ..NightAccumulators::default()
    };

    if ptable.is_empty() {
        return state;
    }

    state.internal_id = ptable.iter().map(|r| r.intid).max().unwrap_or(0) + 1;

    for row in ptable {
        match row.jobdesc {
            JobDesc::Psfnight => state.arcjob = Some(row.clone()),
            JobDesc::Nightlyflat => state.flatjob = Some(row.clone()),
            JobDesc::Arc => state.arcs.push(row.clone()),
            JobDesc::Flat => state.flats.push(row.clone()),
            _ => {}
        }
    }

    // Last processed exposure (joint fits and chained poststdstar rows do
    // not advance the sequence-boundary detector).
    if let Some(last) = ptable
        .iter()
        .filter(|r| !r.jobdesc.is_joint() && r.jobdesc != JobDesc::Poststdstar)
        .last()
    {
        state.lasttype = Some(last.obstype);
        state.lasttile = Some(last.tileid);
    }

    // Pending sciences: rows of the current tile newer than the last joint
    // standard-star fit, minus sky-only exposures.
    let last_stdstar_intid = ptable
        .iter()
        .filter(|r| r.jobdesc == JobDesc::Stdstarfit)
        .map(|r| r.intid)
        .max();
    if let Some(lasttile) = state.lasttile {
        state.sciences = ptable
            .iter()
            .filter(|r| {
                r.jobdesc == JobDesc::Science
                    && r.tileid == lasttile
                    && r.laststep != crate::constants::LastStep::SkySub
                    && last_stdstar_intid.map_or(true, |cut| r.intid > cut)
            })
            .cloned()
            .collect();
    }

    state
}
