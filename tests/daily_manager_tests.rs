//! End-to-end daily manager behavior over a synthetic night: joint-fit
//! ordering at sequence boundaries, unprocessed-exposure routing, and the
//! trailing flush.

mod common;

use common::{marker_body, request_body, write_exposure, TestProduction};
use specpipe_core::manager::{DailyManagerOptions, DailyProcessingManager};
use specpipe_core::models::processing::JobDesc;
use specpipe_core::models::tableio::load_table;
use specpipe_core::models::{ExposureRow, ProcessingRow};

const NIGHT: i64 = 20210115;

fn manager_options() -> DailyManagerOptions {
    DailyManagerOptions {
        override_night: Some(NIGHT),
        dry_run_level: 1,
        data_cadence_secs: Some(0),
        ..DailyManagerOptions::default()
    }
}

async fn run_manager(prod: &TestProduction, options: DailyManagerOptions) -> u32 {
    let mut manager = DailyProcessingManager::new(prod.config.clone(), options).unwrap();
    manager.run().await.unwrap()
}

fn load_ptable(prod: &TestProduction) -> Vec<ProcessingRow> {
    load_table(&prod.paths.processing_table(NIGHT, "csv")).unwrap()
}

#[tokio::test]
async fn test_psfnight_triggers_once_after_end_of_arcs() {
    let prod = TestProduction::new();
    // Three arcs, the end-of-arcs marker, two flats, one science.
    for expid in 1..=3 {
        write_exposure(&prod, NIGHT, expid, &request_body("ARC", 5.0, None));
    }
    write_exposure(&prod, NIGHT, 4, &marker_body("end of arcs"));
    for expid in 5..=6 {
        write_exposure(&prod, NIGHT, expid, &request_body("FLAT", 120.0, None));
    }
    write_exposure(&prod, NIGHT, 7, &request_body("SCIENCE", 900.0, Some(80605)));

    let failures = run_manager(&prod, manager_options()).await;
    assert_eq!(failures, 0);

    let ptable = load_ptable(&prod);
    let psfnights: Vec<&ProcessingRow> = ptable
        .iter()
        .filter(|r| r.jobdesc == JobDesc::Psfnight)
        .collect();
    assert_eq!(psfnights.len(), 1, "psfnight must be created exactly once");
    let psfnight = psfnights[0];
    assert_eq!(psfnight.expids, vec![1, 2, 3]);
    assert_eq!(psfnight.int_dep_ids.len(), 3);

    // Ordering: the psfnight row precedes the first flat row.
    let psfnight_pos = ptable
        .iter()
        .position(|r| r.jobdesc == JobDesc::Psfnight)
        .unwrap();
    let first_flat_pos = ptable
        .iter()
        .position(|r| r.jobdesc == JobDesc::Flat)
        .unwrap();
    assert!(
        psfnight_pos < first_flat_pos,
        "psfnight must be submitted before the first flat is processed"
    );

    // Flats depend on the psfnight job.
    for flat in ptable.iter().filter(|r| r.jobdesc == JobDesc::Flat) {
        assert_eq!(flat.int_dep_ids, vec![psfnight.intid]);
    }

    // End-of-flats never arrived, so the trailing flush owes us the
    // nightlyflat; the science boundary already flushed it when the
    // science exposure arrived.
    let nightlyflats: Vec<&ProcessingRow> = ptable
        .iter()
        .filter(|r| r.jobdesc == JobDesc::Nightlyflat)
        .collect();
    assert_eq!(nightlyflats.len(), 1);
    assert_eq!(nightlyflats[0].expids, vec![5, 6]);

    // The trailing flush also produced the science joint standard-star fit.
    let stdstars: Vec<&ProcessingRow> = ptable
        .iter()
        .filter(|r| r.jobdesc == JobDesc::Stdstarfit)
        .collect();
    assert_eq!(stdstars.len(), 1);
    assert_eq!(stdstars[0].expids, vec![7]);
    assert!(ptable.iter().any(|r| r.jobdesc == JobDesc::Poststdstar));
}

#[tokio::test]
async fn test_long_arc_routed_to_unprocessed() {
    let prod = TestProduction::new();
    // 10s arc exceeds the 8s calibration threshold.
    write_exposure(&prod, NIGHT, 11, &request_body("arc", 10.0, None));
    write_exposure(&prod, NIGHT, 12, &request_body("arc", 5.0, None));

    run_manager(&prod, manager_options()).await;

    let etable: Vec<ExposureRow> = load_table(&prod.paths.exposure_table(NIGHT, "csv")).unwrap();
    let unproc: Vec<ExposureRow> = load_table(&prod.paths.unprocessed_table(NIGHT, "csv")).unwrap();
    let ptable = load_ptable(&prod);

    // both recorded in the exposure table, only the long one in unproc
    assert_eq!(etable.len(), 2);
    assert_eq!(unproc.len(), 1);
    assert_eq!(unproc[0].expid, 11);

    // no processing row for the long arc
    assert!(ptable.iter().all(|r| !r.expids.contains(&11)));
    assert!(ptable
        .iter()
        .any(|r| r.jobdesc == JobDesc::Arc && r.expids == vec![12]));
}

#[tokio::test]
async fn test_ignored_expids_are_not_processed() {
    let prod = TestProduction::new();
    write_exposure(&prod, NIGHT, 21, &request_body("FLAT", 120.0, None));
    write_exposure(&prod, NIGHT, 22, &request_body("FLAT", 120.0, None));

    let mut options = manager_options();
    options.exps_to_ignore = [21].into_iter().collect();
    run_manager(&prod, options).await;

    let ptable = load_ptable(&prod);
    assert!(ptable.iter().all(|r| !r.expids.contains(&21)));
    let unproc: Vec<ExposureRow> = load_table(&prod.paths.unprocessed_table(NIGHT, "csv")).unwrap();
    assert_eq!(unproc.len(), 1);
    assert_eq!(unproc[0].expid, 21);
    assert_eq!(unproc[0].laststep, specpipe_core::LastStep::Ignore);
}

#[tokio::test]
async fn test_short_flat_marker_clears_accumulator() {
    let prod = TestProduction::new();
    write_exposure(&prod, NIGHT, 31, &request_body("FLAT", 120.0, None));
    write_exposure(&prod, NIGHT, 32, &request_body("FLAT", 120.0, None));
    write_exposure(&prod, NIGHT, 33, &marker_body("end of short flats"));

    run_manager(&prod, manager_options()).await;

    let ptable = load_ptable(&prod);
    // flats processed individually, but no nightlyflat from a short program
    assert_eq!(
        ptable.iter().filter(|r| r.jobdesc == JobDesc::Flat).count(),
        2
    );
    assert!(ptable.iter().all(|r| r.jobdesc != JobDesc::Nightlyflat));
}

#[tokio::test]
async fn test_bad_ztype_is_a_configuration_error() {
    let prod = TestProduction::new();
    let mut options = manager_options();
    options.z_submit_types = Some(vec!["weekly".to_string()]);
    assert!(DailyProcessingManager::new(prod.config.clone(), options).is_err());
}

#[tokio::test]
async fn test_badcamword_applied_to_rows() {
    let prod = TestProduction::new();
    write_exposure(&prod, NIGHT, 41, &request_body("FLAT", 120.0, None));

    let mut options = manager_options();
    options.badcamword = Some("z9".parse().unwrap());
    run_manager(&prod, options).await;

    let ptable = load_ptable(&prod);
    let flat = ptable.iter().find(|r| r.jobdesc == JobDesc::Flat).unwrap();
    assert_eq!(flat.proccamword.len(), 29);
    assert!(!flat.proccamword.contains("z9".parse().unwrap()));
}
