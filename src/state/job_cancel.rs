use tracing::{debug, info};

use super::helpers::now_epoch_ms;
use super::{State, StateError, StateTxn};
use crate::job::{Job, JobError, JobState};

impl State {
    /// Request cancellation of a job.
    ///
    /// QUEUED jobs fail immediately. WAITING and RUNNING jobs are flagged and left to
    /// their runner unless `force` is set, which fails them right away and releases
    /// the project/app/workspace they hold. Finished jobs are left alone.
    pub async fn job_cancel(&self, id: &str, force: bool) -> Result<Job, StateError> {
        let mut txn = self.txn().await;
        let mut job = txn.job_get_indexed(id).await?;
        cancel_in(&mut txn, &mut job, force, JobError::canceled())?;
        txn.commit().await?;
        Ok(job)
    }

    /// Cancel a QUEUED or WAITING job whose expiry has passed. Returns false when the
    /// job is gone, already started, or not yet expired.
    pub async fn job_expire(&self, id: &str) -> Result<bool, StateError> {
        let mut txn = self.txn().await;
        let Some(mut job) = txn.job_get(id).await? else {
            return Ok(false);
        };
        let expired = job.expire_time_ms.is_some_and(|t| t <= now_epoch_ms());
        if !expired || !matches!(job.state, JobState::Queued | JobState::Waiting) {
            debug!(job_id = %id, state = %job.state, "expiry no longer applies");
            return Ok(false);
        }
        cancel_in(
            &mut txn,
            &mut job,
            false,
            JobError::new("expired", "job expired before it started"),
        )?;
        txn.commit().await?;
        info!(job_id = %id, "job expired");
        Ok(true)
    }

    /// Set or clear the expiry of a job that has not started yet.
    pub async fn job_update_expiry(
        &self,
        id: &str,
        expire_time_ms: Option<i64>,
    ) -> Result<Job, StateError> {
        let mut txn = self.txn().await;
        let mut job = txn.job_get_indexed(id).await?;
        if !matches!(job.state, JobState::Queued | JobState::Waiting) {
            return Err(StateError::FailedPrecondition(format!(
                "job {} has already started",
                id
            )));
        }
        job.expire_time_ms = expire_time_ms;
        let prev = job.state;
        txn.job_put(&job, Some(prev))?;
        txn.commit().await?;
        Ok(job)
    }
}

/// Cancellation shared by the API, heartbeat expiry and job expiry.
pub(crate) fn cancel_in(
    txn: &mut StateTxn<'_>,
    job: &mut Job,
    force: bool,
    error: JobError,
) -> Result<(), StateError> {
    let prev = job.state;
    let now = now_epoch_ms();
    match prev {
        JobState::Success | JobState::Error => {
            debug!(job_id = %job.id, state = %prev, "cancel of finished job ignored");
            return Ok(());
        }
        JobState::Queued => {
            job.state = JobState::Error;
        }
        JobState::Waiting | JobState::Running => {
            if force {
                job.state = JobState::Error;
            }
        }
    }
    if job.cancel_time_ms.is_none() {
        job.cancel_time_ms = Some(now);
    }
    if job.state == JobState::Error {
        job.error = Some(error);
        job.complete_time_ms = Some(now);
    }
    info!(job_id = %job.id, from = %prev, to = %job.state, force, "job cancel requested");
    txn.job_put(job, Some(prev))
}
