use tracing::info;

use super::helpers::now_epoch_ms;
use super::{StateError, StateTxn};
use crate::job::{JobError, JobIndex, JobState, IDX_DEPENDS_ON};
use crate::key;

impl StateTxn<'_> {
    /// Fail every QUEUED dependent of a job that entered ERROR in this transaction,
    /// recursively, unless the dependent allows that dependency to fail.
    ///
    /// Runs as the first step of `commit`, so the cascade lands in the same durable
    /// batch as the write that triggered it.
    pub(crate) async fn cascade_errors(&mut self) -> Result<(), StateError> {
        while let Some(failed) = self.errored.pop_front() {
            let dependents = self
                .mem
                .prefix::<JobIndex>(IDX_DEPENDS_ON, &key![failed.as_str()]);
            for dependent in dependents {
                if dependent.state != JobState::Queued
                    || dependent.depends_on_allow_failure.contains(&failed)
                {
                    continue;
                }
                let Some(mut job) = self.job_get(&dependent.id).await? else {
                    continue;
                };
                let prev = job.state;
                job.state = JobState::Error;
                job.error = Some(JobError::dependency_errored(&failed));
                job.complete_time_ms = Some(now_epoch_ms());
                self.job_put(&job, Some(prev))?;
                self.cascaded += 1;
                info!(
                    job_id = %job.id,
                    dependency = %failed,
                    "dependency errored, failing queued dependent"
                );
            }
        }
        Ok(())
    }
}
