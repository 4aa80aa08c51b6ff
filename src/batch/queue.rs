//! # Batch Queue Interface
//!
//! The batch scheduler is an opaque external system: submit a script, get a
//! job id, poll for status later. The slurm implementation shells out to
//! `sbatch`/`sacct`; the dry-run implementation hands out fake job ids and
//! reports everything complete so simulations drain cleanly.

use crate::error::{Result, SpecpipeError};
use crate::models::ProcessingRow;
use crate::state_machine::TaskState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::process::Command;

/// Queue-side state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueJobState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    OutOfMemory,
    Unknown,
}

impl FromStr for QueueJobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // sacct may append a trailing reason, e.g. "CANCELLED by 1234"
        let head = s.split_whitespace().next().unwrap_or("");
        match head.to_uppercase().as_str() {
            "PENDING" | "REQUEUED" => Ok(Self::Pending),
            "RUNNING" | "COMPLETING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" | "NODE_FAIL" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            "OUT_OF_MEMORY" => Ok(Self::OutOfMemory),
            "" => Err("empty queue state".to_string()),
            _ => Ok(Self::Unknown),
        }
    }
}

impl QueueJobState {
    /// Map the queue-side state onto the processing-row lifecycle.
    pub fn to_task_state(self) -> TaskState {
        match self {
            Self::Pending => TaskState::Submitted,
            Self::Running => TaskState::Running,
            Self::Completed => TaskState::Done,
            Self::Failed | Self::Timeout | Self::Cancelled | Self::OutOfMemory => TaskState::Fail,
            Self::Unknown => TaskState::Submitted,
        }
    }
}

#[async_trait]
pub trait BatchQueue: Send + Sync {
    /// Submit a script, returning the queue's job id.
    async fn submit(&self, script: &Path) -> Result<i64>;

    /// Status of the given job ids inside the query window.
    async fn status(
        &self,
        job_ids: &[i64],
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<HashMap<i64, QueueJobState>>;
}

/// Real slurm-backed queue.
pub struct SlurmQueue;

#[async_trait]
impl BatchQueue for SlurmQueue {
    async fn submit(&self, script: &Path) -> Result<i64> {
        let output = Command::new("sbatch")
            .arg("--parsable")
            .arg(script)
            .output()
            .await
            .map_err(|e| SpecpipeError::QueueError(format!("Failed to run sbatch: {e}")))?;
        if !output.status.success() {
            return Err(SpecpipeError::QueueError(format!(
                "sbatch failed for {}: {}",
                script.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .split(';')
            .next()
            .and_then(|tok| tok.parse::<i64>().ok())
            .ok_or_else(|| {
                SpecpipeError::QueueError(format!("Unparseable sbatch output: {stdout}"))
            })
    }

    async fn status(
        &self,
        job_ids: &[i64],
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<HashMap<i64, QueueJobState>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joblist = job_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = Command::new("sacct")
            .arg("-X")
            .arg("--parsable2")
            .arg("--noheader")
            .arg("--format=JobID,State")
            .arg(format!("--jobs={joblist}"))
            .arg(format!("--starttime={}", window.0.format("%Y-%m-%dT%H:%M:%S")))
            .arg(format!("--endtime={}", window.1.format("%Y-%m-%dT%H:%M:%S")))
            .output()
            .await
            .map_err(|e| SpecpipeError::QueueError(format!("Failed to run sacct: {e}")))?;
        if !output.status.success() {
            return Err(SpecpipeError::QueueError(format!(
                "sacct failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let mut states = HashMap::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut fields = line.split('|');
            let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
                continue;
            };
            if let (Ok(id), Ok(state)) = (id.trim().parse::<i64>(), state.parse()) {
                states.insert(id, state);
            }
        }
        Ok(states)
    }
}

/// Simulated queue for dry runs: sequential fake job ids, instant success.
pub struct DryRunQueue {
    next_id: AtomicI64,
}

impl DryRunQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
        }
    }
}

impl Default for DryRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchQueue for DryRunQueue {
    async fn submit(&self, script: &Path) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::info!(script = %script.display(), qid = id, "DRY RUN, simulated submission");
        Ok(id)
    }

    async fn status(
        &self,
        job_ids: &[i64],
        _window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<HashMap<i64, QueueJobState>> {
        Ok(job_ids
            .iter()
            .map(|&id| (id, QueueJobState::Completed))
            .collect())
    }
}

/// Reconcile submitted-row state against the batch queue. Only rows with a
/// queue id and a non-terminal status are queried; done/fail rows keep
/// their recorded outcome.
pub async fn update_from_queue(
    ptable: &mut [ProcessingRow],
    queue: &dyn BatchQueue,
    window: (DateTime<Utc>, DateTime<Utc>),
) -> Result<()> {
    let job_ids: Vec<i64> = ptable
        .iter()
        .filter(|row| row.latest_qid != 0 && !row.status.is_terminal())
        .map(|row| row.latest_qid)
        .collect();
    if job_ids.is_empty() {
        return Ok(());
    }
    let states = queue.status(&job_ids, window).await?;
    for row in ptable.iter_mut() {
        if row.status.is_terminal() {
            continue;
        }
        if let Some(state) = states.get(&row.latest_qid) {
            let new_status = state.to_task_state();
            if new_status != row.status {
                tracing::info!(
                    intid = row.intid,
                    qid = row.latest_qid,
                    from = %row.status,
                    to = %new_status,
                    "Queue reconciliation"
                );
                row.status = new_status;
            }
        }
    }
    Ok(())
}

/// True while any row could still change state on its own.
pub fn any_jobs_not_complete(ptable: &[ProcessingRow]) -> bool {
    ptable.iter().any(|row| !row.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ObsType;
    use crate::models::exposure::ExposureRow;
    use crate::models::processing::erow_to_prow;
    use crate::timing;

    #[test]
    fn test_queue_state_parsing() {
        assert_eq!("COMPLETED".parse::<QueueJobState>().unwrap(), QueueJobState::Completed);
        assert_eq!(
            "CANCELLED by 1234".parse::<QueueJobState>().unwrap(),
            QueueJobState::Cancelled
        );
        assert_eq!("weird".parse::<QueueJobState>().unwrap(), QueueJobState::Unknown);
    }

    #[test]
    fn test_queue_state_to_task_state() {
        assert_eq!(QueueJobState::Completed.to_task_state(), TaskState::Done);
        assert_eq!(QueueJobState::Timeout.to_task_state(), TaskState::Fail);
        assert_eq!(QueueJobState::Pending.to_task_state(), TaskState::Submitted);
    }

    #[tokio::test]
    async fn test_dry_run_queue_hands_out_sequential_ids() {
        let queue = DryRunQueue::new();
        let a = queue.submit(Path::new("/tmp/a.slurm")).await.unwrap();
        let b = queue.submit(Path::new("/tmp/b.slurm")).await.unwrap();
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn test_update_from_queue_preserves_terminal_rows() {
        let queue = DryRunQueue::new();
        let window = (
            timing::queue_window_start(20210115),
            timing::queue_window_end(20210115),
        );
        let erow = ExposureRow::new(20210115, 1, ObsType::Arc);
        let mut submitted = erow_to_prow(&erow, 115000);
        submitted.latest_qid = 100;
        submitted.status = TaskState::Submitted;
        let mut failed = erow_to_prow(&erow, 115001);
        failed.latest_qid = 101;
        failed.status = TaskState::Fail;

        let mut ptable = vec![submitted, failed];
        update_from_queue(&mut ptable, &queue, window).await.unwrap();
        assert_eq!(ptable[0].status, TaskState::Done);
        // failed row was terminal and is not resurrected by the queue
        assert_eq!(ptable[1].status, TaskState::Fail);
    }
}
