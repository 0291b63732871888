use crate::job::{JobAssignment, JobIndex, JobState};
use crate::memdb::{MemTxn, Snapshot};

/// Read access to the job index, from a snapshot or from inside a write transaction.
pub(crate) trait JobLookup {
    fn job_state(&self, id: &str) -> Option<JobState>;

    /// Id of the serializing job holding a project/app/workspace key.
    fn app_holder(&self, key: &str) -> Option<String>;
}

impl JobLookup for Snapshot<'_> {
    fn job_state(&self, id: &str) -> Option<JobState> {
        self.get::<JobIndex>(id).map(|j| j.state)
    }

    fn app_holder(&self, key: &str) -> Option<String> {
        self.get::<JobAssignment>(key).map(|a| a.job_id.clone())
    }
}

impl JobLookup for MemTxn {
    fn job_state(&self, id: &str) -> Option<JobState> {
        self.get::<JobIndex>(id).map(|j| j.state)
    }

    fn app_holder(&self, key: &str) -> Option<String> {
        self.get::<JobAssignment>(key).map(|a| a.job_id)
    }
}

/// A job is blocked while any dependency is unfinished, or while another
/// serializing job holds its project/app/workspace.
///
/// A dependency missing from the index was pruned, which only happens to terminal
/// jobs, so it counts as finished.
pub(crate) fn job_is_blocked(view: &impl JobLookup, job: &JobIndex) -> bool {
    let waiting_on_dep = job
        .depends_on
        .iter()
        .any(|dep| view.job_state(dep).is_some_and(|s| !s.is_completed()));
    if waiting_on_dep {
        return true;
    }
    if job.operation.is_serializing() {
        if let Some(holder) = view.app_holder(&job.app_workspace_key()) {
            return holder != job.id;
        }
    }
    false
}
