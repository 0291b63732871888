//! On-demand runner tasks: a start job launches a runner, the task job runs on it and
//! a stop job tears it down. The task's state follows its three jobs.

use async_trait::async_trait;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::codec::Versioned;
use crate::job::{Job, JobState};
use crate::observer::JobObserver;
use crate::state::{State, StateError};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub enum TaskState {
    Pending,
    Starting,
    Started,
    Running,
    Stopping,
    Completed,
    Error,
}

impl TaskState {
    pub fn is_final(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Task {
    pub id: String,
    pub start_job: String,
    pub task_job: String,
    pub stop_job: String,
    pub state: TaskState,
}

impl Versioned for Task {
    const VERSION: u8 = 1;
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        start_job: impl Into<String>,
        task_job: impl Into<String>,
        stop_job: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            start_job: start_job.into(),
            task_job: task_job.into(),
            stop_job: stop_job.into(),
            state: TaskState::Pending,
        }
    }

    /// The state a constituent job's transition moves the task to, if it moves
    /// forward. Final states never change.
    pub fn advance(&self, job_id: &str, job_state: JobState) -> Option<TaskState> {
        if self.state.is_final() {
            return None;
        }
        let next = if job_state == JobState::Error {
            TaskState::Error
        } else if job_id == self.start_job {
            match job_state {
                JobState::Running => TaskState::Starting,
                JobState::Success => TaskState::Started,
                _ => return None,
            }
        } else if job_id == self.task_job {
            match job_state {
                JobState::Running => TaskState::Running,
                _ => return None,
            }
        } else if job_id == self.stop_job {
            match job_state {
                JobState::Running => TaskState::Stopping,
                JobState::Success => TaskState::Completed,
                _ => return None,
            }
        } else {
            return None;
        };
        (next > self.state).then_some(next)
    }
}

/// Moves the owning task along as its jobs change state.
pub struct TaskObserver;

#[async_trait]
impl JobObserver for TaskObserver {
    fn name(&self) -> &'static str {
        "task"
    }

    async fn job_transitioned(&self, state: &State, job: &Job) -> Result<(), StateError> {
        let Some(task_id) = &job.task else {
            return Ok(());
        };
        state.task_advance(task_id, &job.id, job.state).await?;
        Ok(())
    }
}
