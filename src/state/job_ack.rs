use tokio::time::Instant;
use tracing::{debug, info};

use super::helpers::now_epoch_ms;
use super::{State, StateError, StateTxn};
use crate::deadline::DeadlineKind;
use crate::job::{Job, JobError, JobIndex, JobState};

impl State {
    /// Acknowledge an assigned job. `ack = true` starts it (WAITING -> RUNNING);
    /// `ack = false` hands it back to the queue.
    pub async fn job_ack(&self, id: &str, ack: bool) -> Result<Job, StateError> {
        let mut txn = self.txn().await;
        let mut job = txn.job_get_indexed(id).await?;
        if job.state != JobState::Waiting {
            return Err(StateError::FailedPrecondition(format!(
                "job {} can't be acked from state {}",
                id, job.state
            )));
        }

        if ack {
            job.state = JobState::Running;
            job.ack_time_ms = Some(now_epoch_ms());
            txn.job_put(&job, Some(JobState::Waiting))?;
            info!(job_id = %id, runner_id = ?job.assigned_runner, "job acked");
        } else {
            nack_in(&mut txn, &mut job)?;
            info!(job_id = %id, "job nacked");
        }
        txn.commit().await?;
        Ok(job)
    }

    /// Extend a running job's heartbeat deadline. A no-op for jobs in any other state,
    /// including finished jobs already pruned from memory.
    pub async fn job_heartbeat(&self, id: &str) -> Result<(), StateError> {
        let indexed = self
            .mem
            .view(|snap| snap.get::<JobIndex>(id).map(|j| j.state));
        let state = match indexed {
            Some(state) => state,
            None => self
                .job_by_id_durable(id)
                .await?
                .map(|j| j.state)
                .ok_or_else(|| StateError::NotFound(format!("job {}", id)))?,
        };
        if state == JobState::Running {
            let at = Instant::now() + self.cfg.heartbeat_timeout();
            self.deadlines.arm(id, DeadlineKind::Heartbeat, at);
        } else {
            debug!(job_id = %id, state = %state, "heartbeat for job that is not running");
        }
        Ok(())
    }
}

/// Return a WAITING job to the queue. A job whose cancellation was requested while
/// it waited goes to ERROR instead.
pub(crate) fn nack_in(txn: &mut StateTxn<'_>, job: &mut Job) -> Result<(), StateError> {
    let prev = job.state;
    if job.is_cancelled() {
        job.state = JobState::Error;
        job.error = Some(JobError::canceled());
        job.complete_time_ms = Some(now_epoch_ms());
    } else {
        job.state = JobState::Queued;
        job.assigned_runner = None;
        job.assign_time_ms = None;
    }
    txn.job_put(job, Some(prev))
}
