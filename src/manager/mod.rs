//! # Daily Processing Manager
//!
//! The top-level control loop: watch for new exposures arriving on disk,
//! classify and route each one, submit single-exposure and joint jobs, and
//! persist the exposure/processing/unprocessed tables after every
//! mutation. The loop is single-writer by construction (no other process
//! may mutate a night's tables while a manager is running) and tolerates
//! being killed and restarted at any point.

pub mod classify;
pub mod resume;

pub use classify::{summarize_exposure, ExposureSummary};
pub use resume::{parse_previous_tables, starting_internal_id, NightAccumulators};

use crate::batch::queue::{update_from_queue, BatchQueue, DryRunQueue, SlurmQueue};
use crate::batch::submit::{DryRunLevel, JobSubmitter};
use crate::camword::{validate_badamps, Camword};
use crate::config::PipelineConfig;
use crate::constants::{scheduling, LastStep, ObsType, KNOWN_ZSUBMIT_TYPES};
use crate::error::{Result, SpecpipeError};
use crate::joint;
use crate::logging::exposure_banner;
use crate::models::exposure::ExposureRow;
use crate::models::processing::{erow_to_prow, ProcessingRow};
use crate::models::tableio::{load_table, write_table};
use crate::paths::ProdPaths;
use crate::state_machine::TaskState;
use crate::timing;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Caller-facing knobs of the daily manager.
#[derive(Debug, Clone, Default)]
pub struct DailyManagerOptions {
    /// Run for this night instead of the current one.
    pub override_night: Option<i64>,
    /// Restrict processing to these cameras.
    pub camword: Option<Camword>,
    /// Cameras to exclude from processing.
    pub badcamword: Option<Camword>,
    /// Flagged amplifiers, `[brz][0-9][ABCD]` comma separated.
    pub badamps: Option<String>,
    /// Exposure ids that must not be processed.
    pub exps_to_ignore: BTreeSet<i64>,
    /// Obstypes recorded in the exposure table (defaulted when None).
    pub exp_obstypes: Option<Vec<ObsType>>,
    /// Obstypes eligible for processing rows (defaulted when None).
    pub proc_obstypes: Option<Vec<ObsType>>,
    /// Redshift grouping types submitted with science tiles.
    pub z_submit_types: Option<Vec<String>>,
    pub no_redshifts: bool,
    /// 0 live, 1 simulate submission, 2 simulate without script generation.
    pub dry_run_level: u8,
    /// Keep looping for new data even on an override night.
    pub continue_looping_debug: bool,
    pub dont_check_job_outputs: bool,
    pub dont_resubmit_partial_jobs: bool,
    /// Override the configured data-polling cadence (0 means no waiting,
    /// for simulations).
    pub data_cadence_secs: Option<u64>,
    pub queue_cadence_secs: Option<u64>,
}

/// The long-running nightly operations loop.
pub struct DailyProcessingManager {
    config: PipelineConfig,
    options: DailyManagerOptions,
    paths: ProdPaths,
    submitter: JobSubmitter,
    queue: Arc<dyn BatchQueue>,
    badcamword: Camword,
    badamps: String,
    exp_obstypes: Vec<ObsType>,
    proc_obstypes: Vec<ObsType>,
    z_submit_types: Option<Vec<String>>,
    dry_run: bool,
}

impl DailyProcessingManager {
    /// Validate options and wire up the submitter. Configuration errors
    /// fail here, before any I/O.
    pub fn new(config: PipelineConfig, options: DailyManagerOptions) -> Result<Self> {
        let dry_run_level = DryRunLevel::from_level(options.dry_run_level);
        let dry_run = dry_run_level.is_dry();

        // Redshift grouping validation happens up front.
        let z_submit_types = if options.no_redshifts {
            None
        } else {
            let ztypes = options.z_submit_types.clone().unwrap_or_else(|| {
                vec!["cumulative".to_string(), "pernight-v0".to_string()]
            });
            for ztype in &ztypes {
                if !KNOWN_ZSUBMIT_TYPES.contains(&ztype.as_str()) {
                    return Err(SpecpipeError::ConfigurationError(format!(
                        "Couldn't understand ztype={ztype}"
                    )));
                }
            }
            Some(ztypes)
        };
        match &z_submit_types {
            Some(ztypes) => {
                tracing::info!(ztypes = ?ztypes, "Redshift fitting with redshift group types")
            }
            None => tracing::info!("Not submitting scripts for redshift fitting"),
        }

        // Reconcile the camera selection into a single bad camword.
        let full = Camword::full();
        let badcamword = match (&options.camword, &options.badcamword) {
            (Some(camword), None) => full.difference(camword),
            (Some(camword), Some(bad)) => full.difference(&camword.difference(bad)),
            (None, Some(bad)) => bad.clone(),
            (None, None) => Camword::empty(),
        };
        if !badcamword.is_empty() {
            tracing::info!(
                badcamword = %badcamword,
                camword = %full.difference(&badcamword),
                "Modifying camword of data to be processed"
            );
        }

        let badamps = match &options.badamps {
            Some(badamps) => validate_badamps(badamps)?,
            None => String::new(),
        };

        let exp_obstypes = options
            .exp_obstypes
            .clone()
            .unwrap_or_else(ObsType::default_for_exptable);
        let proc_obstypes = options
            .proc_obstypes
            .clone()
            .unwrap_or_else(ObsType::default_for_proctable);
        // expobstypes must contain all the types used in processing
        let mut exp_obstypes = exp_obstypes;
        for obstype in &proc_obstypes {
            if !exp_obstypes.contains(obstype) {
                exp_obstypes.push(*obstype);
            }
        }

        let queue: Arc<dyn BatchQueue> = if dry_run {
            Arc::new(DryRunQueue::new())
        } else {
            Arc::new(SlurmQueue)
        };
        let submitter = JobSubmitter::new(
            config.clone(),
            queue.clone(),
            dry_run_level,
            !options.dont_check_job_outputs,
            !options.dont_resubmit_partial_jobs,
        );
        let paths = ProdPaths::new(&config);

        Ok(Self {
            config,
            options,
            paths,
            submitter,
            queue,
            badcamword,
            badamps,
            exp_obstypes,
            proc_obstypes,
            z_submit_types,
            dry_run,
        })
    }

    /// Exposure ids whose completion markers are on disk for this night.
    fn located_expids(&self, night: i64) -> BTreeSet<i64> {
        let mut located = BTreeSet::new();
        let night_dir = self.config.raw_night_dir(night);
        let Ok(entries) = std::fs::read_dir(&night_dir) else {
            return located;
        };
        for entry in entries.flatten() {
            let Ok(expid) = entry.file_name().to_string_lossy().parse::<i64>() else {
                continue;
            };
            if self.paths.checksum(night, expid).exists() {
                located.insert(expid);
            }
        }
        located
    }

    fn persist(
        &self,
        night: i64,
        etable: &[ExposureRow],
        ptable: &[ProcessingRow],
        unproc: &[ExposureRow],
    ) -> Result<()> {
        let ext = &self.config.tab_filetype;
        write_table(&self.paths.exposure_table(night, ext), etable)?;
        write_table(&self.paths.processing_table(night, ext), ptable)?;
        write_table(&self.paths.unprocessed_table(night, ext), unproc)?;
        Ok(())
    }

    /// Run the nightly loop. Returns the number of failed joint-fit
    /// submissions, which callers surface as the process exit code.
    pub async fn run(&mut self) -> Result<u32> {
        // Outside the observing window with nothing overridden there is
        // nothing to do.
        if !timing::during_operating_hours(self.dry_run) && self.options.override_night.is_none() {
            tracing::info!(
                "Not during operating hours, and not asked to perform a dry run or run on \
                 historic data. Exiting."
            );
            return Ok(0);
        }

        let true_night = timing::what_night_is_it();
        let night = match self.options.override_night {
            Some(night) => {
                tracing::info!(true_night, night, "True night differs from override");
                night
            }
            None => true_night,
        };

        if self.options.continue_looping_debug {
            tracing::info!(
                "continue_looping_debug is set; will keep looking for new data until terminated"
            );
        }

        // Fast-forward knob for simulations: zero data cadence drops every
        // sleep in the loop.
        let data_cadence = self
            .options
            .data_cadence_secs
            .unwrap_or(self.config.data_cadence_secs);
        let queue_cadence = self
            .options
            .queue_cadence_secs
            .unwrap_or(self.config.queue_cadence_secs);
        let speed_modifier = if data_cadence == 0 {
            0.0
        } else if self.dry_run {
            0.1
        } else {
            1.0
        };
        let reconcile_every = (queue_cadence / data_cadence.max(1)).max(1);
        let window = (
            timing::queue_window_start(true_night),
            timing::queue_window_end(true_night),
        );

        // INIT: load the persisted tables and rebuild the accumulators.
        let ext = self.config.tab_filetype.clone();
        let mut etable: Vec<ExposureRow> = load_table(&self.paths.exposure_table(night, &ext))?;
        let mut ptable: Vec<ProcessingRow> =
            load_table(&self.paths.processing_table(night, &ext))?;
        let mut unproc_table: Vec<ExposureRow> =
            load_table(&self.paths.unprocessed_table(night, &ext))?;

        let mut all_exps: BTreeSet<i64> = etable.iter().map(|row| row.expid).collect();
        let mut state = parse_previous_tables(&ptable, night);
        let mut joint_failures = 0u32;
        let mut cycle = 0u64;

        while (night == timing::what_night_is_it()
            && timing::during_operating_hours(self.dry_run))
            || self.options.override_night.is_some()
        {
            cycle += 1;
            tracing::info!(known = all_exps.len(), "Previously known exposures");
            let located = self.located_expids(night);
            let new_exps: Vec<i64> = located.difference(&all_exps).copied().collect();
            all_exps = located;
            tracing::info!(new = new_exps.len(), "New exposures");

            if self.options.override_night.is_some()
                && !self.options.continue_looping_debug
                && new_exps.is_empty()
            {
                tracing::info!(
                    "No new exposures on an override night; terminating the search"
                );
                break;
            }

            for expid in new_exps {
                tracing::info!("{}", exposure_banner(expid));

                let summary =
                    match summarize_exposure(&self.paths, night, expid, &self.exp_obstypes) {
                        Ok(summary) => summary,
                        Err(e) => {
                            tracing::error!(expid, error = %e, "Classification failed; skipping");
                            continue;
                        }
                    };

                let mut erow = match summary {
                    ExposureSummary::Skip(reason) => {
                        tracing::info!(expid, reason = %reason, "Not recording");
                        continue;
                    }
                    ExposureSummary::EndOfArcs => {
                        if self.options.exps_to_ignore.contains(&expid) {
                            tracing::info!(
                                expid,
                                "End-of-arcs flag on an ignored exposure; ignoring"
                            );
                        } else if state.arcjob.is_none()
                            && self.proc_obstypes.contains(&ObsType::Arc)
                        {
                            tracing::info!(
                                "Located end of arc calibration sequence flag. Processing psfnight."
                            );
                            match joint::arc_joint_fit(
                                &mut ptable,
                                &state.arcs,
                                &mut state.internal_id,
                                &self.submitter,
                            )
                            .await
                            {
                                Ok(job) => state.arcjob = job,
                                Err(e) => {
                                    tracing::error!(error = %e, "psfnight submission failed");
                                    joint_failures += 1;
                                }
                            }
                            self.persist(night, &etable, &ptable, &unproc_table)?;
                        }
                        continue;
                    }
                    ExposureSummary::EndOfFlats => {
                        if self.options.exps_to_ignore.contains(&expid) {
                            tracing::info!(
                                expid,
                                "End-of-flats flag on an ignored exposure; ignoring"
                            );
                        } else if state.flatjob.is_none()
                            && self.proc_obstypes.contains(&ObsType::Flat)
                        {
                            tracing::info!(
                                "Located end of long flat calibration sequence flag. Processing nightlyflat."
                            );
                            match joint::flat_joint_fit(
                                &mut ptable,
                                &state.flats,
                                &mut state.internal_id,
                                &self.submitter,
                            )
                            .await
                            {
                                Ok(job) => state.flatjob = job,
                                Err(e) => {
                                    tracing::error!(error = %e, "nightlyflat submission failed");
                                    joint_failures += 1;
                                }
                            }
                            self.persist(night, &etable, &ptable, &unproc_table)?;
                        }
                        continue;
                    }
                    ExposureSummary::EndOfShortFlats => {
                        if state.flatjob.is_none() {
                            tracing::info!(
                                "Located end of short flat calibration flag. Removing flats from nightlyflat list."
                            );
                            state.flats.clear();
                        }
                        continue;
                    }
                    ExposureSummary::Row(row) => *row,
                };

                erow.badcamword = self.badcamword.clone();
                erow.badamps = self.badamps.clone();

                // ROUTE: decide ignore vs. process.
                let mut unprocessed = false;
                if self.options.exps_to_ignore.contains(&expid) {
                    tracing::info!(expid, "Exposure id listed to ignore. Not processing.");
                    erow.laststep = LastStep::Ignore;
                    unprocessed = true;
                } else if erow.laststep == LastStep::Ignore {
                    tracing::info!(expid, "Identified by the pipeline as ignore. Not processing.");
                    unprocessed = true;
                } else if !self.proc_obstypes.contains(&erow.obstype) {
                    tracing::info!(
                        obstype = %erow.obstype,
                        "Obstype not in types to process. Not processing."
                    );
                    unprocessed = true;
                } else if erow.obstype == ObsType::Arc
                    && erow.exptime > scheduling::MAX_ARC_EXPTIME_SECS
                {
                    tracing::info!(
                        exptime = erow.exptime,
                        "Arc exposure with EXPTIME greater than 8s. Not processing."
                    );
                    unprocessed = true;
                }

                tracing::info!(expid, obstype = %erow.obstype, tileid = erow.tileid, "Found");
                etable.push(erow.clone());
                if unprocessed {
                    unproc_table.push(erow);
                    self.persist(night, &etable, &ptable, &unproc_table)?;
                    continue;
                }

                let (curtype, curtile) = joint::get_type_and_tile(&erow);

                // A (type, tile) change is the sole joint-fit trigger.
                if let Some(lasttype) = state.lasttype {
                    if curtype != lasttype || Some(curtile) != state.lasttile {
                        let outcome = joint::check_for_and_submit_joint_job(
                            &mut ptable,
                            &state.arcs,
                            &state.flats,
                            &mut state.sciences,
                            state.arcjob.take(),
                            state.flatjob.take(),
                            Some(lasttype),
                            &mut state.internal_id,
                            &self.submitter,
                            self.z_submit_types.as_deref(),
                        )
                        .await?;
                        state.arcjob = outcome.arcjob;
                        state.flatjob = outcome.flatjob;
                        joint_failures += outcome.failures;
                    }
                }

                let mut prow = erow_to_prow(&erow, state.internal_id);
                state.internal_id += 1;
                joint::define_and_assign_dependency(
                    &mut prow,
                    state.arcjob.as_ref(),
                    state.flatjob.as_ref(),
                );
                tracing::info!(intid = prow.intid, jobdesc = %prow.jobdesc, "Processing");
                if let Err(e) = self.submitter.create_and_submit(&mut prow).await {
                    // One exposure's submission failure must not kill the
                    // polling loop; the row is recorded failed and eligible
                    // for later resubmission.
                    tracing::error!(intid = prow.intid, error = %e, "Submission failed");
                    prow.status = TaskState::Fail;
                }
                ptable.push(prow.clone());

                match curtype {
                    ObsType::Flat
                        if state.flatjob.is_none()
                            && erow.seqtot < scheduling::MAX_FLAT_SEQTOT_FOR_NIGHTLY =>
                    {
                        state.flats.push(prow)
                    }
                    ObsType::Arc if state.arcjob.is_none() => state.arcs.push(prow),
                    ObsType::Science if prow.laststep != LastStep::SkySub => {
                        state.sciences.push(prow)
                    }
                    _ => {}
                }

                state.lasttype = Some(curtype);
                state.lasttile = Some(curtile);

                sleep_scaled(10.0, speed_modifier).await;
                self.persist(night, &etable, &ptable, &unproc_table)?;
            }

            tracing::info!("Reached the end of current iteration of new exposures.");
            sleep_scaled(data_cadence as f64, speed_modifier).await;

            if !ptable.is_empty() && cycle % reconcile_every == 0 {
                update_from_queue(&mut ptable, self.queue.as_ref(), window).await?;
                write_table(
                    &self.paths.processing_table(night, &self.config.tab_filetype),
                    &ptable,
                )?;
                sleep_scaled(30.0, speed_modifier).await;
            }
        }

        // No more data coming in; flush any still-accumulated sequence so
        // the night's last joint fit is not silently dropped.
        let outcome = joint::check_for_and_submit_joint_job(
            &mut ptable,
            &state.arcs,
            &state.flats,
            &mut state.sciences,
            state.arcjob.take(),
            state.flatjob.take(),
            state.lasttype,
            &mut state.internal_id,
            &self.submitter,
            self.z_submit_types.as_deref(),
        )
        .await?;
        state.arcjob = outcome.arcjob;
        state.flatjob = outcome.flatjob;
        joint_failures += outcome.failures;

        update_from_queue(&mut ptable, self.queue.as_ref(), window).await?;
        self.persist(night, &etable, &ptable, &unproc_table)?;

        tracing::info!(night, "Completed submission of exposures for night.");
        Ok(joint_failures)
    }
}

async fn sleep_scaled(seconds: f64, modifier: f64) {
    let scaled = seconds * modifier;
    if scaled > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(scaled)).await;
    }
}
