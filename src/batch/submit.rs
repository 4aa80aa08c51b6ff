//! # Job Submitter
//!
//! Turns a processing row into a batch submission: prune cameras whose
//! final products already exist, size the allocation, render the script,
//! and hand it to the queue. Rows that turn out to be fully complete are
//! recorded `done` without ever touching the batch system.

use crate::batch::queue::BatchQueue;
use crate::batch::resources::{batch_config, determine_resources};
use crate::batch::script::{batch_job_name, create_batch_script};
use crate::camword::{Camera, Camword};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::models::{JobDesc, ProcessingRow};
use crate::paths::ProdPaths;
use crate::state_machine::TaskState;
use std::path::PathBuf;
use std::sync::Arc;

/// Dry-run levels: 0 runs live, 1 generates scripts but simulates the
/// submission, 2 simulates without generating anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DryRunLevel {
    Live,
    SimulateSubmit,
    SimulateAll,
}

impl DryRunLevel {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Live,
            1 => Self::SimulateSubmit,
            _ => Self::SimulateAll,
        }
    }

    pub fn is_dry(&self) -> bool {
        !matches!(self, Self::Live)
    }
}

pub struct JobSubmitter {
    config: PipelineConfig,
    paths: ProdPaths,
    queue: Arc<dyn BatchQueue>,
    dry_run: DryRunLevel,
    /// When set, cameras whose final products exist are pruned before
    /// submission, and fully-complete rows are recorded done unsubmitted.
    check_for_outputs: bool,
    /// When set together with `check_for_outputs`, partially-complete rows
    /// are resubmitted with only their missing cameras.
    resubmit_partial_complete: bool,
}

impl JobSubmitter {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn BatchQueue>,
        dry_run: DryRunLevel,
        check_for_outputs: bool,
        resubmit_partial_complete: bool,
    ) -> Self {
        let paths = ProdPaths::new(&config);
        Self {
            config,
            paths,
            queue,
            dry_run,
            check_for_outputs,
            resubmit_partial_complete,
        }
    }

    pub fn paths(&self) -> &ProdPaths {
        &self.paths
    }

    /// Final products of one camera for the given job kind. Output
    /// existence per-file, not per-task, is what makes selective
    /// resubmission of a partial camera subset possible.
    fn camera_outputs(&self, prow: &ProcessingRow, camera: Camera) -> Vec<PathBuf> {
        let night = prow.night;
        let expid = prow.first_expid();
        match prow.jobdesc {
            JobDesc::Arc | JobDesc::Testarc => vec![self.paths.fit_psf(night, expid, camera)],
            JobDesc::Flat | JobDesc::Testflat => {
                vec![self.paths.fiberflat(night, expid, camera)]
            }
            JobDesc::Science | JobDesc::Prestdstar => {
                vec![self.paths.sframe(night, expid, camera)]
            }
            JobDesc::Poststdstar => vec![self.paths.cframe(night, expid, camera)],
            JobDesc::Psfnight => vec![self.paths.psfnight(night, camera)],
            JobDesc::Nightlyflat => vec![self.paths.fiberflatnight(night, camera)],
            JobDesc::Stdstarfit => {
                vec![self
                    .paths
                    .stdstars(night, expid, camera.spectrograph)]
            }
            JobDesc::Sky | JobDesc::Twilight => vec![self.paths.frame(night, expid, camera)],
            JobDesc::Dark | JobDesc::Zero => vec![self.paths.preproc(night, expid, camera)],
        }
    }

    /// Cameras of the row whose final products are not all on disk.
    fn missing_cameras(&self, prow: &ProcessingRow) -> Camword {
        let missing = prow.proccamword.decode().into_iter().filter(|&camera| {
            self.camera_outputs(prow, camera)
                .iter()
                .any(|path| !path.exists())
        });
        Camword::from_cameras(missing)
    }

    /// Prune, plan, script, and submit one processing row, updating its
    /// status, script name and queue id in place.
    pub async fn create_and_submit(&self, prow: &mut ProcessingRow) -> Result<()> {
        if self.check_for_outputs {
            let missing = self.missing_cameras(prow);
            if missing.is_empty() {
                tracing::info!(
                    intid = prow.intid,
                    jobdesc = %prow.jobdesc,
                    "All final outputs exist; recording done without submission"
                );
                prow.status = TaskState::Done;
                return Ok(());
            }
            if self.resubmit_partial_complete && missing.len() < prow.proccamword.len() {
                tracing::info!(
                    intid = prow.intid,
                    full = %prow.proccamword,
                    pruned = %missing,
                    "Pruning camword to cameras with missing outputs"
                );
                prow.proccamword = missing;
            }
        }

        let system = batch_config(&self.config.batch_system)?;
        let nexps = prow.expids.len().max(1);
        let resources = determine_resources(
            prow.proccamword.len(),
            prow.jobdesc,
            nexps,
            None,
            system,
        )?;

        let jobname = batch_job_name(prow.jobdesc, prow.night, &prow.expids, &prow.proccamword);
        if self.dry_run < DryRunLevel::SimulateAll {
            let command = self.proc_command(prow);
            let script = create_batch_script(
                &self.paths,
                prow,
                &resources,
                &self.config.queue,
                system,
                &command,
            )?;
            prow.scriptname = script.display().to_string();
            prow.latest_qid = self.queue.submit(&script).await?;
        } else {
            tracing::info!(job = %jobname, "DRY RUN level 2, no script generated");
            prow.scriptname = format!("{jobname}.slurm");
            prow.latest_qid = self
                .queue
                .submit(std::path::Path::new(&prow.scriptname))
                .await?;
        }
        prow.status = TaskState::Submitted;
        tracing::info!(
            intid = prow.intid,
            jobdesc = %prow.jobdesc,
            qid = prow.latest_qid,
            "Submitted"
        );
        Ok(())
    }

    /// Command line the batch script will launch for this row.
    fn proc_command(&self, prow: &ProcessingRow) -> String {
        let mut command = format!(
            "specpipe-proc --night {} --cameras {}",
            prow.night, prow.proccamword
        );
        match prow.jobdesc {
            JobDesc::Psfnight | JobDesc::Nightlyflat | JobDesc::Stdstarfit => {
                let expids = prow
                    .expids
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                command.push_str(&format!(" --joint {} --expids {expids}", prow.jobdesc));
            }
            _ => {
                command.push_str(&format!(
                    " --expid {} --obstype {}",
                    prow.first_expid(),
                    prow.obstype
                ));
            }
        }
        if !prow.badamps.is_empty() {
            command.push_str(&format!(" --badamps {}", prow.badamps));
        }
        match prow.jobdesc {
            JobDesc::Prestdstar => command.push_str(" --no-stdstarfit --no-fluxcalib"),
            JobDesc::Poststdstar => command.push_str(" --no-prestdstar --no-stdstarfit"),
            _ => {}
        }
        command
    }
}
