use std::sync::{Arc, PoisonError};

use super::{State, StateError};
use crate::job::{ApplicationRef, Job, JobIndex, JobState, TargetRunner, IDX_QUEUE};
use crate::keys::Bucket;
use crate::memdb::WatchSet;
use crate::output::OutputBuffer;
use crate::runner::Runner;

/// Filters for `job_list`. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub application: Option<ApplicationRef>,
    pub workspace: Option<String>,
    pub target: Option<TargetRunner>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, job: &JobIndex) -> bool {
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if let Some(app) = &self.application {
            if app.key() != job.application.key() {
                return false;
            }
        }
        if let Some(ws) = &self.workspace {
            if !ws.eq_ignore_ascii_case(&job.workspace) {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if *target != job.target {
                return false;
            }
        }
        true
    }
}

impl State {
    /// A job that is still in the memory index. With a watch set, the caller can wait
    /// for the next change to the jobs table afterwards.
    pub async fn job_by_id(&self, id: &str, ws: Option<&mut WatchSet>) -> Result<Job, StateError> {
        let indexed = self.mem.view(|snap| {
            if let Some(ws) = ws {
                snap.watch::<JobIndex>(ws);
            }
            snap.get::<JobIndex>(id).is_some()
        });
        if !indexed {
            return Err(StateError::NotFound(format!("job {}", id)));
        }
        self.job_by_id_durable(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("job {}", id)))
    }

    /// The durable job document, available even after the job was pruned from memory.
    pub async fn job_by_id_durable(&self, id: &str) -> Result<Option<Job>, StateError> {
        self.get_durable::<Job>(Bucket::Jobs, id).await
    }

    /// Indexed jobs matching `filter`, newest first.
    pub async fn job_list(&self, filter: &JobFilter) -> Result<Vec<Job>, StateError> {
        let ids: Vec<String> = self.mem.view(|snap| {
            snap.prefix_rev::<JobIndex>(IDX_QUEUE, &[])
                .filter(|j| filter.matches(j))
                .take(filter.limit.unwrap_or(usize::MAX))
                .map(|j| j.id.clone())
                .collect()
        });
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.job_by_id_durable(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Whether any known runner that is online and not rejected could take the job.
    pub fn job_is_assignable(&self, job: &Job) -> bool {
        self.mem.view(|snap| {
            snap.all::<Runner>()
                .any(|r| r.is_eligible() && job.target_runner.matches(r))
        })
    }

    /// Output buffer of a job that has started running.
    pub fn job_output(&self, id: &str) -> Option<Arc<OutputBuffer>> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
