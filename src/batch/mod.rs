//! # Batch Planning and Submission
//!
//! Resource sizing per job type, batch-script generation, the opaque
//! queue interface (submit → poll → status), and the submitter that ties
//! them together with output-existence pruning.

pub mod queue;
pub mod resources;
pub mod script;
pub mod submit;

pub use queue::{any_jobs_not_complete, update_from_queue, BatchQueue, DryRunQueue, QueueJobState, SlurmQueue};
pub use resources::{batch_config, determine_resources, BatchSystemConfig, Resources};
pub use script::{batch_job_name, create_batch_script};
pub use submit::{DryRunLevel, JobSubmitter};
