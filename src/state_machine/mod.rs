//! Task and processing-row lifecycle state management.

pub mod states;

pub use states::TaskState;
