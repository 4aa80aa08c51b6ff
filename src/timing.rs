//! # Observing-Night Arithmetic
//!
//! The night label is the date of local sunset: everything observed between
//! one noon and the next belongs to the earlier date. The daily manager uses
//! these helpers to decide which night it is operating on and whether the
//! observatory is inside its operating window.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Timelike, Utc};

/// Nightly operations window: scanning starts mid-afternoon and continues
/// through morning calibrations.
const OPERATING_START_HOUR: u32 = 14;
const OPERATING_END_HOUR: u32 = 10;

/// The YYYYMMDD night label for a given local timestamp. Before noon the
/// label still refers to the previous date.
pub fn night_for(now: DateTime<Local>) -> i64 {
    let shifted = now - Duration::hours(12);
    let date = shifted.date_naive();
    let formatted = date.format("%Y%m%d").to_string();
    formatted.parse().unwrap_or(0)
}

/// The night label right now.
pub fn what_night_is_it() -> i64 {
    night_for(Local::now())
}

/// True when the given local time falls inside the nightly operations
/// window. Dry runs are always "during operating hours" so simulations can
/// run at any time of day.
pub fn during_operating_hours_at(now: DateTime<Local>, dry_run: bool) -> bool {
    if dry_run {
        return true;
    }
    let hour = now.hour();
    hour >= OPERATING_START_HOUR || hour < OPERATING_END_HOUR
}

/// True when operations are currently inside the nightly window.
pub fn during_operating_hours(dry_run: bool) -> bool {
    during_operating_hours_at(Local::now(), dry_run)
}

/// UTC timestamp of the start of the queue window for a night, used to
/// bound batch-queue status queries.
pub fn queue_window_start(night: i64) -> DateTime<Utc> {
    night_to_datetime(night, NaiveTime::from_hms_opt(OPERATING_START_HOUR, 0, 0).unwrap())
}

/// UTC timestamp of the end of the queue window: the morning after.
pub fn queue_window_end(night: i64) -> DateTime<Utc> {
    night_to_datetime(night, NaiveTime::from_hms_opt(OPERATING_END_HOUR, 0, 0).unwrap())
        + Duration::days(1)
}

fn night_to_datetime(night: i64, time: NaiveTime) -> DateTime<Utc> {
    let year = (night / 10000) as i32;
    let month = ((night / 100) % 100) as u32;
    let day = (night % 100) as u32;
    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
    Utc.from_utc_datetime(&date.and_time(time))
}
