//! Pipelines and their runs. A run's state is derived from the jobs of its steps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::codec::Versioned;
use crate::job::{Job, JobState};
use crate::observer::JobObserver;
use crate::state::{State, StateError};

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Pipeline {
    pub id: String,
    pub project: String,
    pub name: String,
    pub steps: Vec<String>,
}

impl Versioned for Pipeline {
    const VERSION: u8 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum PipelineRunState {
    Pending,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    /// Last seen state of each step job, keyed by job id.
    pub jobs: BTreeMap<String, JobState>,
    pub state: PipelineRunState,
}

impl Versioned for PipelineRun {
    const VERSION: u8 = 1;
}

impl PipelineRun {
    pub fn new(id: impl Into<String>, pipeline_id: impl Into<String>, jobs: &[&str]) -> Self {
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
            jobs: jobs
                .iter()
                .map(|j| (j.to_string(), JobState::Queued))
                .collect(),
            state: PipelineRunState::Pending,
        }
    }

    /// Record a step job's state and recompute the run state. Returns true if
    /// anything changed. Finished runs are left alone.
    pub fn observe(&mut self, job_id: &str, job_state: JobState) -> bool {
        if matches!(self.state, PipelineRunState::Success | PipelineRunState::Error) {
            return false;
        }
        let Some(slot) = self.jobs.get_mut(job_id) else {
            return false;
        };
        let before = (*slot, self.state);
        *slot = job_state;

        self.state = if self.jobs.values().any(|s| *s == JobState::Error) {
            PipelineRunState::Error
        } else if self.jobs.values().all(|s| *s == JobState::Success) {
            PipelineRunState::Success
        } else if self.jobs.values().any(|s| *s != JobState::Queued) {
            PipelineRunState::Running
        } else {
            PipelineRunState::Pending
        };
        before != (job_state, self.state)
    }
}

/// Keeps pipeline runs in step with their jobs.
pub struct PipelineRunObserver;

#[async_trait]
impl JobObserver for PipelineRunObserver {
    fn name(&self) -> &'static str {
        "pipeline_run"
    }

    async fn job_transitioned(&self, state: &State, job: &Job) -> Result<(), StateError> {
        let Some(step) = &job.pipeline else {
            return Ok(());
        };
        state
            .pipeline_run_observe(&step.run_id, &job.id, job.state)
            .await?;
        Ok(())
    }
}
