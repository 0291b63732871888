use tracing::info;

use super::helpers::now_epoch_ms;
use super::{State, StateError};
use crate::job::{Job, JobError, JobState};

impl State {
    /// Finish a running job with its result or error.
    pub async fn job_complete(
        &self,
        id: &str,
        outcome: Result<Option<Vec<u8>>, JobError>,
    ) -> Result<Job, StateError> {
        let mut txn = self.txn().await;
        let mut job = txn.job_get_indexed(id).await?;
        if job.state != JobState::Running {
            return Err(StateError::FailedPrecondition(format!(
                "job {} can't be completed from state {}",
                id, job.state
            )));
        }

        job.complete_time_ms = Some(now_epoch_ms());
        match outcome {
            Ok(result) => {
                job.state = JobState::Success;
                job.result = result;
            }
            Err(error) => {
                job.state = JobState::Error;
                job.error = Some(error);
            }
        }
        txn.job_put(&job, Some(JobState::Running))?;
        txn.commit().await?;
        info!(job_id = %id, state = %job.state, "job completed");
        Ok(job)
    }
}
