//! # Resource Planner
//!
//! Given a job type and camera count, compute the process count, node
//! count and wall-clock budget for its batch submission. The per-type
//! numbers come from operational experience with the reduction codes and
//! are scaled by the batch system's time factor.

use crate::error::{Result, SpecpipeError};
use crate::models::JobDesc;

/// Static description of one batch system profile.
#[derive(Debug, Clone)]
pub struct BatchSystemConfig {
    pub name: &'static str,
    pub cores_per_node: usize,
    pub threads_per_core: usize,
    pub memory_gb: f64,
    /// Runtime multiplier relative to the reference system.
    pub timefactor: f64,
    pub batch_opts: &'static [&'static str],
}

const KNOWN_SYSTEMS: &[BatchSystemConfig] = &[
    BatchSystemConfig {
        name: "cori-haswell",
        cores_per_node: 32,
        threads_per_core: 2,
        memory_gb: 125.0,
        timefactor: 1.0,
        batch_opts: &["-C haswell"],
    },
    BatchSystemConfig {
        name: "cori-knl",
        cores_per_node: 68,
        threads_per_core: 4,
        memory_gb: 93.0,
        timefactor: 3.0,
        batch_opts: &["-C knl,quad,cache"],
    },
    BatchSystemConfig {
        name: "perlmutter-cpu",
        cores_per_node: 128,
        threads_per_core: 2,
        memory_gb: 512.0,
        timefactor: 1.0,
        batch_opts: &["-C cpu"],
    },
];

/// Look up a batch system profile by name.
pub fn batch_config(system_name: &str) -> Result<&'static BatchSystemConfig> {
    KNOWN_SYSTEMS
        .iter()
        .find(|s| s.name == system_name)
        .ok_or_else(|| {
            SpecpipeError::ConfigurationError(format!("Unknown batch system: {system_name}"))
        })
}

/// Planned allocation for one batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cores: usize,
    pub nodes: usize,
    pub runtime_minutes: u32,
}

/// Compute the allocation for a job. Arcs get one core per fiber bundle
/// plus a scheduler core and may spread over more realtime nodes than
/// other types; science exposures are throttled so two can share the
/// realtime queue.
pub fn determine_resources(
    ncameras: usize,
    jobdesc: JobDesc,
    nexps: usize,
    forced_runtime: Option<u32>,
    system: &BatchSystemConfig,
) -> Result<Resources> {
    let nspectro = (ncameras.max(1) - 1) / 3 + 1;
    let (mut cores, mut runtime): (usize, u32) = match jobdesc {
        JobDesc::Arc | JobDesc::Testarc => (10 * ncameras + 1, 45),
        JobDesc::Flat | JobDesc::Testflat => (20 * nspectro, 25),
        JobDesc::Science
        | JobDesc::Prestdstar
        | JobDesc::Poststdstar
        | JobDesc::Sky
        | JobDesc::Twilight => (20 * nspectro, 30),
        JobDesc::Dark => (8, 10),
        JobDesc::Zero => (2, 5),
        JobDesc::Psfnight | JobDesc::Nightlyflat => (ncameras.max(1), 5),
        JobDesc::Stdstarfit => (20 * ncameras, 6 + 2 * nexps as u32),
    };

    if let Some(forced) = forced_runtime {
        runtime = forced;
    }

    let mut nodes = (cores - 1) / system.cores_per_node + 1;

    // Arcs make good use of full nodes; everything else is throttled so two
    // jobs fit the ten-node realtime allocation together.
    let max_nodes = if matches!(jobdesc, JobDesc::Arc | JobDesc::Testarc) {
        10
    } else {
        5
    };
    if nodes > max_nodes {
        nodes = max_nodes;
        cores = system.cores_per_node * nodes;
        if matches!(jobdesc, JobDesc::Arc | JobDesc::Testarc) {
            // keep a whole number of 20-rank bundles plus the scheduler core
            cores = ((cores - 1) / 20) * 20 + 1;
        }
    }

    // Slower systems get proportionally more time, except arcs whose
    // runtime is already dominated by a long serial tail.
    if !matches!(jobdesc, JobDesc::Arc | JobDesc::Testarc) {
        runtime = ((runtime as f64) * system.timefactor).ceil() as u32;
    }

    Ok(Resources {
        cores,
        nodes,
        runtime_minutes: runtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn haswell() -> &'static BatchSystemConfig {
        batch_config("cori-haswell").unwrap()
    }

    #[test]
    fn test_unknown_system_rejected() {
        assert!(batch_config("summit").is_err());
    }

    #[test]
    fn test_arc_resources() {
        let r = determine_resources(30, JobDesc::Arc, 1, None, haswell()).unwrap();
        assert_eq!(r.runtime_minutes, 45);
        // 301 cores requested, capped to 10 nodes of 32, bundle-aligned
        assert_eq!(r.nodes, 10);
        assert_eq!(r.cores % 20, 1);
    }

    #[test]
    fn test_flat_resources_scale_with_spectrographs() {
        let r = determine_resources(30, JobDesc::Flat, 1, None, haswell()).unwrap();
        assert_eq!(r.runtime_minutes, 25);
        assert_eq!(r.nodes, 5);
    }

    #[test]
    fn test_science_nodes_are_throttled() {
        let r = determine_resources(30, JobDesc::Prestdstar, 1, None, haswell()).unwrap();
        assert!(r.nodes <= 5);
    }

    #[test]
    fn test_stdstarfit_runtime_scales_with_exposures() {
        let one = determine_resources(3, JobDesc::Stdstarfit, 1, None, haswell()).unwrap();
        let four = determine_resources(3, JobDesc::Stdstarfit, 4, None, haswell()).unwrap();
        assert_eq!(one.runtime_minutes, 8);
        assert_eq!(four.runtime_minutes, 14);
    }

    #[test]
    fn test_forced_runtime_wins() {
        let r = determine_resources(30, JobDesc::Flat, 1, Some(99), haswell()).unwrap();
        assert_eq!(r.runtime_minutes, 99);
    }

    #[test]
    fn test_timefactor_scales_runtime_but_not_arcs() {
        let knl = batch_config("cori-knl").unwrap();
        let flat = determine_resources(30, JobDesc::Flat, 1, None, knl).unwrap();
        assert_eq!(flat.runtime_minutes, 75);
        let arc = determine_resources(30, JobDesc::Arc, 1, None, knl).unwrap();
        assert_eq!(arc.runtime_minutes, 45);
    }
}
