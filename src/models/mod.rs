//! # Bookkeeping Data Layer
//!
//! Row types for the exposure and processing tables plus the whole-table
//! CSV persistence they share. These tables are the sole source of truth
//! for resumption: everything the daily manager holds in memory must be
//! reconstructible from them.

pub mod exposure;
pub mod processing;
pub mod tableio;

pub use exposure::ExposureRow;
pub use processing::{erow_to_prow, JobDesc, ProcessingRow};
