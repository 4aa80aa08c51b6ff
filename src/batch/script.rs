//! # Batch Script Generation
//!
//! Renders a slurm submission script for one processing row. Script names
//! are deterministic (`{jobdesc}-{night}-{expid}-{camword}.slurm`), so a
//! resubmitted job overwrites its predecessor's script rather than
//! accumulating variants.

use crate::batch::resources::{BatchSystemConfig, Resources};
use crate::camword::Camword;
use crate::error::Result;
use crate::models::{JobDesc, ProcessingRow};
use crate::paths::ProdPaths;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// Deterministic job name for a processing row.
pub fn batch_job_name(jobdesc: JobDesc, night: i64, expids: &[i64], camword: &Camword) -> String {
    let expstr = format!("{:08}", expids.first().copied().unwrap_or(0));
    format!("{jobdesc}-{night}-{expstr}-{camword}")
}

/// Write the batch script for a processing row and return its path.
pub fn create_batch_script(
    paths: &ProdPaths,
    prow: &ProcessingRow,
    resources: &Resources,
    queue: &str,
    system: &BatchSystemConfig,
    command: &str,
) -> Result<PathBuf> {
    let batchdir = paths.batch_script_dir(prow.night);
    fs::create_dir_all(&batchdir)?;

    let jobname = batch_job_name(prow.jobdesc, prow.night, &prow.expids, &prow.proccamword);
    let scriptfile = batchdir.join(format!("{jobname}.slurm"));

    let runtime_hh = resources.runtime_minutes / 60;
    let runtime_mm = resources.runtime_minutes % 60;
    let threads_per_core = system.threads_per_core;

    let mut script = String::new();
    writeln!(script, "#!/bin/bash -l").unwrap();
    writeln!(script).unwrap();
    writeln!(script, "#SBATCH -N {}", resources.nodes).unwrap();
    writeln!(script, "#SBATCH --qos {queue}").unwrap();
    for opt in system.batch_opts {
        writeln!(script, "#SBATCH {opt}").unwrap();
    }
    writeln!(script, "#SBATCH --account spectro").unwrap();
    writeln!(script, "#SBATCH --job-name {jobname}").unwrap();
    writeln!(
        script,
        "#SBATCH --output {}/{jobname}-%j.log",
        batchdir.display()
    )
    .unwrap();
    writeln!(script, "#SBATCH --time={runtime_hh:02}:{runtime_mm:02}:00").unwrap();
    writeln!(script, "#SBATCH --exclusive").unwrap();
    writeln!(script).unwrap();
    writeln!(
        script,
        "# {} exposure with {} cameras",
        prow.jobdesc,
        prow.proccamword.len()
    )
    .unwrap();
    writeln!(
        script,
        "# using {} cores on {} nodes",
        resources.cores, resources.nodes
    )
    .unwrap();
    writeln!(script).unwrap();
    writeln!(script, "echo Starting at $(date)").unwrap();
    if matches!(prow.jobdesc, JobDesc::Arc | JobDesc::Testarc) {
        writeln!(script, "export OMP_NUM_THREADS={threads_per_core}").unwrap();
    } else {
        writeln!(script, "export OMP_NUM_THREADS=1").unwrap();
    }
    writeln!(script).unwrap();

    let two_phase = matches!(
        prow.jobdesc,
        JobDesc::Science | JobDesc::Prestdstar | JobDesc::Stdstarfit | JobDesc::Poststdstar
    );
    if !two_phase {
        writeln!(script, "# Do steps at full parallelism").unwrap();
        let srun = format!(
            "srun -N {} -n {} -c {threads_per_core} {command}",
            resources.nodes, resources.cores
        );
        writeln!(script, "echo Running {srun}").unwrap();
        writeln!(script, "{srun}").unwrap();
    } else {
        if matches!(prow.jobdesc, JobDesc::Science | JobDesc::Prestdstar) {
            writeln!(script, "# Do steps through skysub at full parallelism").unwrap();
            let srun = format!(
                "srun -N {} -n {} -c {threads_per_core} --cpu-bind=cores {command} --no-fluxcalib",
                resources.nodes, resources.cores
            );
            writeln!(script, "echo Running {srun}").unwrap();
            writeln!(script, "{srun}").unwrap();
        }
        if matches!(
            prow.jobdesc,
            JobDesc::Science | JobDesc::Stdstarfit | JobDesc::Poststdstar
        ) {
            let ncameras = prow.proccamword.len();
            let ntasks = if resources.nodes * 4 > ncameras {
                ncameras.max(1)
            } else {
                resources.nodes * 4
            };
            let tot_threads =
                resources.nodes * system.cores_per_node * system.threads_per_core;
            let threads_per_task = (tot_threads / ntasks).max(1);
            writeln!(script).unwrap();
            writeln!(script, "# Use less parallelism for the fanout steps").unwrap();
            writeln!(script, "# This should quickly skip over the steps already done").unwrap();
            let srun = format!(
                "srun -N {} -n {ntasks} -c {threads_per_task} --cpu-bind=none {command}",
                resources.nodes
            );
            writeln!(script, "if [ $? -eq 0 ]; then").unwrap();
            writeln!(script, "  echo Running {srun}").unwrap();
            writeln!(script, "  {srun}").unwrap();
            writeln!(script, "else").unwrap();
            writeln!(script, "  echo FAILED: done at $(date)").unwrap();
            writeln!(script, "  exit 1").unwrap();
            writeln!(script, "fi").unwrap();
        }
    }

    writeln!(script).unwrap();
    writeln!(script, "if [ $? -eq 0 ]; then").unwrap();
    writeln!(script, "  echo SUCCESS: done at $(date)").unwrap();
    writeln!(script, "else").unwrap();
    writeln!(script, "  echo FAILED: done at $(date)").unwrap();
    writeln!(script, "  exit 1").unwrap();
    writeln!(script, "fi").unwrap();

    fs::write(&scriptfile, script)?;
    tracing::info!(script = %scriptfile.display(), "Wrote batch script");
    Ok(scriptfile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::resources::{batch_config, determine_resources};
    use crate::config::PipelineConfig;
    use crate::constants::ObsType;
    use crate::models::exposure::ExposureRow;
    use crate::models::processing::erow_to_prow;
    use tempfile::tempdir;

    fn prow_for(obstype: ObsType) -> ProcessingRow {
        erow_to_prow(&ExposureRow::new(20210115, 42, obstype), 115000)
    }

    #[test]
    fn test_job_name_is_deterministic() {
        let prow = prow_for(ObsType::Arc);
        let a = batch_job_name(prow.jobdesc, prow.night, &prow.expids, &prow.proccamword);
        assert_eq!(a, "arc-20210115-00000042-a0123456789");
    }

    #[test]
    fn test_script_contains_sbatch_headers() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.redux_dir = dir.path().display().to_string();
        let paths = ProdPaths::new(&config);
        let system = batch_config("cori-haswell").unwrap();
        let prow = prow_for(ObsType::Flat);
        let resources =
            determine_resources(prow.proccamword.len(), prow.jobdesc, 1, None, system).unwrap();
        let script =
            create_batch_script(&paths, &prow, &resources, "realtime", system, "specpipe-proc")
                .unwrap();
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.contains("#SBATCH --qos realtime"));
        assert!(text.contains("#SBATCH -N 5"));
        assert!(text.contains("srun"));
        assert!(script.to_string_lossy().ends_with(".slurm"));
    }

    #[test]
    fn test_science_script_has_two_phases() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.redux_dir = dir.path().display().to_string();
        let paths = ProdPaths::new(&config);
        let system = batch_config("cori-haswell").unwrap();
        let prow = prow_for(ObsType::Science);
        let resources =
            determine_resources(prow.proccamword.len(), prow.jobdesc, 1, None, system).unwrap();
        let script =
            create_batch_script(&paths, &prow, &resources, "realtime", system, "specpipe-proc")
                .unwrap();
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.contains("--no-fluxcalib"));
        assert!(text.contains("--cpu-bind=none"));
    }
}
