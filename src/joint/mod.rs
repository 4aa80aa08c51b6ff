//! # Joint-Fit Coordinator
//!
//! Joint calibration products are computed from runs of same-type
//! exposures: the nightly PSF from the arc sequence, the nightly fiberflat
//! from the flat sequence, and the shared standard-star fit from the
//! science exposures of one tile. Triggering is strictly ordered by
//! sequence-boundary detection, so a joint fit never starts until its
//! defining sequence has logically ended, and each kind fires at most
//! once per night.

use crate::batch::submit::JobSubmitter;
use crate::camword::Camword;
use crate::constants::ObsType;
use crate::error::Result;
use crate::models::exposure::ExposureRow;
use crate::models::processing::{JobDesc, ProcessingRow};
use crate::state_machine::TaskState;

/// The (obstype, tile) pair whose change marks a sequence boundary.
pub fn get_type_and_tile(erow: &ExposureRow) -> (ObsType, i64) {
    (erow.obstype, erow.tileid)
}

/// Wire a freshly created processing row to its upstream calibration jobs:
/// science exposures prefer the nightly flat and fall back to the nightly
/// PSF; flats depend on the nightly PSF.
pub fn define_and_assign_dependency(
    prow: &mut ProcessingRow,
    arcjob: Option<&ProcessingRow>,
    flatjob: Option<&ProcessingRow>,
) {
    let dep = match prow.obstype {
        ObsType::Science | ObsType::Sky | ObsType::Twilight => flatjob.or(arcjob),
        ObsType::Flat | ObsType::TestFlat => arcjob,
        _ => None,
    };
    if let Some(dep) = dep {
        prow.int_dep_ids = vec![dep.intid];
    }
}

/// Build the joint row from its member rows: every member exposure id,
/// the union of their camwords, and dependency links to every member.
fn make_joint_prow(members: &[ProcessingRow], jobdesc: JobDesc, intid: i64) -> ProcessingRow {
    let first = &members[0];
    let mut expids = Vec::new();
    let mut camword = Camword::empty();
    let mut dep_ids = Vec::new();
    for member in members {
        expids.extend(member.expids.iter().copied());
        camword = camword.union(&member.proccamword);
        dep_ids.push(member.intid);
    }
    ProcessingRow {
        expids,
        night: first.night,
        obstype: first.obstype,
        tileid: first.tileid,
        proccamword: camword,
        intid,
        jobdesc,
        int_dep_ids: dep_ids,
        latest_qid: 0,
        status: TaskState::Waiting,
        scriptname: String::new(),
        laststep: first.laststep,
        badamps: first.badamps.clone(),
    }
}

/// Submit the nightly PSF joint fit over the accumulated arc rows.
/// Returns the joint row, which the caller records as the night's arc job.
pub async fn arc_joint_fit(
    ptable: &mut Vec<ProcessingRow>,
    arcs: &[ProcessingRow],
    internal_id: &mut i64,
    submitter: &JobSubmitter,
) -> Result<Option<ProcessingRow>> {
    joint_fit(ptable, arcs, JobDesc::Psfnight, internal_id, submitter).await
}

/// Submit the nightly fiberflat joint fit over the accumulated flat rows.
pub async fn flat_joint_fit(
    ptable: &mut Vec<ProcessingRow>,
    flats: &[ProcessingRow],
    internal_id: &mut i64,
    submitter: &JobSubmitter,
) -> Result<Option<ProcessingRow>> {
    joint_fit(ptable, flats, JobDesc::Nightlyflat, internal_id, submitter).await
}

async fn joint_fit(
    ptable: &mut Vec<ProcessingRow>,
    members: &[ProcessingRow],
    jobdesc: JobDesc,
    internal_id: &mut i64,
    submitter: &JobSubmitter,
) -> Result<Option<ProcessingRow>> {
    if members.is_empty() {
        tracing::info!(jobdesc = %jobdesc, "No accumulated exposures; skipping joint fit");
        return Ok(None);
    }
    let mut joint = make_joint_prow(members, jobdesc, *internal_id);
    *internal_id += 1;
    tracing::info!(
        jobdesc = %jobdesc,
        members = members.len(),
        intid = joint.intid,
        "Submitting joint fit"
    );
    submitter.create_and_submit(&mut joint).await?;
    ptable.push(joint.clone());
    Ok(Some(joint))
}

/// Submit the shared standard-star fit over the accumulated science rows
/// of one tile, then chain a post-standard-star job for every member
/// exposure. Redshift grouping types, when configured, are logged for the
/// downstream fitter.
pub async fn science_joint_fit(
    ptable: &mut Vec<ProcessingRow>,
    sciences: &[ProcessingRow],
    internal_id: &mut i64,
    submitter: &JobSubmitter,
    z_submit_types: Option<&[String]>,
) -> Result<Option<ProcessingRow>> {
    if sciences.is_empty() {
        return Ok(None);
    }
    let mut stdstar = make_joint_prow(sciences, JobDesc::Stdstarfit, *internal_id);
    *internal_id += 1;
    tracing::info!(
        tileid = stdstar.tileid,
        members = sciences.len(),
        intid = stdstar.intid,
        "Submitting joint standard-star fit"
    );
    submitter.create_and_submit(&mut stdstar).await?;
    ptable.push(stdstar.clone());

    for member in sciences {
        let mut post = member.clone();
        post.intid = *internal_id;
        *internal_id += 1;
        post.jobdesc = JobDesc::Poststdstar;
        post.int_dep_ids = vec![stdstar.intid, member.intid];
        post.latest_qid = 0;
        post.status = TaskState::Waiting;
        post.scriptname = String::new();
        submitter.create_and_submit(&mut post).await?;
        ptable.push(post);
    }

    if let Some(ztypes) = z_submit_types {
        for ztype in ztypes {
            tracing::info!(
                tileid = stdstar.tileid,
                ztype = %ztype,
                "Queueing redshift grouping for downstream fitter"
            );
        }
    }
    Ok(Some(stdstar))
}

/// Outcome of a sequence-boundary flush.
pub struct JointFlushOutcome {
    pub arcjob: Option<ProcessingRow>,
    pub flatjob: Option<ProcessingRow>,
    /// Joint-fit submissions that failed; surfaced in the manager exit code.
    pub failures: u32,
}

/// Flush whichever accumulator the just-ended sequence was filling.
///
/// At-most-once is enforced here: an existing arc/flat joint job
/// short-circuits its trigger. The science accumulator is cleared after
/// its joint fit; arcs and flats are kept (their joint job handle is what
/// blocks re-triggering).
#[allow(clippy::too_many_arguments)]
pub async fn check_for_and_submit_joint_job(
    ptable: &mut Vec<ProcessingRow>,
    arcs: &[ProcessingRow],
    flats: &[ProcessingRow],
    sciences: &mut Vec<ProcessingRow>,
    arcjob: Option<ProcessingRow>,
    flatjob: Option<ProcessingRow>,
    lasttype: Option<ObsType>,
    internal_id: &mut i64,
    submitter: &JobSubmitter,
    z_submit_types: Option<&[String]>,
) -> Result<JointFlushOutcome> {
    let mut outcome = JointFlushOutcome {
        arcjob,
        flatjob,
        failures: 0,
    };
    let Some(lasttype) = lasttype else {
        return Ok(outcome);
    };

    if lasttype.is_arc_like() && outcome.arcjob.is_none() {
        match arc_joint_fit(ptable, arcs, internal_id, submitter).await {
            Ok(job) => outcome.arcjob = job,
            Err(e) => {
                tracing::error!(error = %e, "psfnight joint fit submission failed");
                outcome.failures += 1;
            }
        }
    } else if lasttype.is_flat_like() && outcome.flatjob.is_none() {
        match flat_joint_fit(ptable, flats, internal_id, submitter).await {
            Ok(job) => outcome.flatjob = job,
            Err(e) => {
                tracing::error!(error = %e, "nightlyflat joint fit submission failed");
                outcome.failures += 1;
            }
        }
    } else if lasttype == ObsType::Science && !sciences.is_empty() {
        match science_joint_fit(ptable, sciences, internal_id, submitter, z_submit_types).await {
            Ok(_) => sciences.clear(),
            Err(e) => {
                tracing::error!(error = %e, "stdstarfit joint fit submission failed");
                outcome.failures += 1;
                sciences.clear();
            }
        }
    }
    Ok(outcome)
}
