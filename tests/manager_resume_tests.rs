//! Idempotent resumption: a manager stopped and restarted mid-night must
//! schedule exactly the same set of jobs, with the same internal ids and
//! dependencies, as one uninterrupted run over the same exposures.

mod common;

use common::{marker_body, request_body, write_exposure, TestProduction};
use specpipe_core::manager::{DailyManagerOptions, DailyProcessingManager};
use specpipe_core::models::tableio::load_table;
use specpipe_core::models::ProcessingRow;

const NIGHT: i64 = 20210115;

fn manager_options() -> DailyManagerOptions {
    DailyManagerOptions {
        override_night: Some(NIGHT),
        dry_run_level: 1,
        data_cadence_secs: Some(0),
        ..DailyManagerOptions::default()
    }
}

async fn run_manager(prod: &TestProduction) {
    let mut manager =
        DailyProcessingManager::new(prod.config.clone(), manager_options()).unwrap();
    manager.run().await.unwrap();
}

fn write_first_half(prod: &TestProduction) {
    for expid in 1..=3 {
        write_exposure(prod, NIGHT, expid, &request_body("ARC", 5.0, None));
    }
    write_exposure(prod, NIGHT, 4, &marker_body("end of arcs"));
}

fn write_second_half(prod: &TestProduction) {
    for expid in 5..=6 {
        write_exposure(prod, NIGHT, expid, &request_body("FLAT", 120.0, None));
    }
    write_exposure(prod, NIGHT, 7, &marker_body("end of flats"));
    for expid in 8..=9 {
        write_exposure(prod, NIGHT, expid, &request_body("SCIENCE", 900.0, Some(80605)));
    }
}

/// Schedule signature: everything that identifies what was submitted.
fn schedule(ptable: &[ProcessingRow]) -> Vec<(String, Vec<i64>, i64, Vec<i64>)> {
    ptable
        .iter()
        .map(|row| {
            (
                row.jobdesc.to_string(),
                row.expids.clone(),
                row.intid,
                row.int_dep_ids.clone(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_interrupted_run_schedules_identically() {
    // Interrupted production: the manager runs over the first half of the
    // night, exits, and is restarted after the rest arrives.
    let interrupted = TestProduction::new();
    write_first_half(&interrupted);
    run_manager(&interrupted).await;
    write_second_half(&interrupted);
    run_manager(&interrupted).await;

    // Reference production: one uninterrupted pass over the whole night.
    let reference = TestProduction::new();
    write_first_half(&reference);
    write_second_half(&reference);
    run_manager(&reference).await;

    let resumed: Vec<ProcessingRow> =
        load_table(&interrupted.paths.processing_table(NIGHT, "csv")).unwrap();
    let uninterrupted: Vec<ProcessingRow> =
        load_table(&reference.paths.processing_table(NIGHT, "csv")).unwrap();

    assert_eq!(
        schedule(&resumed),
        schedule(&uninterrupted),
        "resumed schedule must exactly reproduce the uninterrupted one"
    );
}

#[tokio::test]
async fn test_rerun_on_complete_night_adds_nothing() {
    let prod = TestProduction::new();
    write_first_half(&prod);
    write_second_half(&prod);
    run_manager(&prod).await;
    let first: Vec<ProcessingRow> =
        load_table(&prod.paths.processing_table(NIGHT, "csv")).unwrap();

    run_manager(&prod).await;
    let second: Vec<ProcessingRow> =
        load_table(&prod.paths.processing_table(NIGHT, "csv")).unwrap();

    assert_eq!(schedule(&first), schedule(&second));
}

#[tokio::test]
async fn test_internal_ids_are_night_seeded_and_sequential() {
    let prod = TestProduction::new();
    write_first_half(&prod);
    run_manager(&prod).await;

    let ptable: Vec<ProcessingRow> =
        load_table(&prod.paths.processing_table(NIGHT, "csv")).unwrap();
    let base = specpipe_core::manager::starting_internal_id(NIGHT);
    let intids: Vec<i64> = ptable.iter().map(|r| r.intid).collect();
    let expected: Vec<i64> = (0..intids.len() as i64).map(|i| base + i).collect();
    assert_eq!(intids, expected);
}
