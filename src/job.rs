use std::collections::BTreeMap;
use std::fmt;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::codec::Versioned;
use crate::key;
use crate::memdb::{IndexKey, Record};
use crate::runner::Runner;

/// Lifecycle state of a job. Ordering follows the lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub enum JobState {
    Queued,
    Waiting,
    Running,
    Success,
    Error,
}

impl JobState {
    /// SUCCESS or ERROR.
    pub fn is_completed(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Error => "error",
        }
    }

    pub(crate) fn as_i64(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub enum OperationKind {
    Noop,
    Build,
    Push,
    Deploy,
    Destroy,
    Release,
    Validate,
    Auth,
    Docs,
    ConfigSync,
    Exec,
    Logs,
    QueueProject,
    PollApplication,
    StatusReport,
    StartTask,
    StopTask,
    WatchTask,
    Init,
    PipelineStep,
}

impl OperationKind {
    /// Kinds that must not run concurrently for the same project, app and workspace.
    pub fn is_serializing(&self) -> bool {
        matches!(
            self,
            OperationKind::Deploy | OperationKind::Destroy | OperationKind::Release
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Noop => "noop",
            OperationKind::Build => "build",
            OperationKind::Push => "push",
            OperationKind::Deploy => "deploy",
            OperationKind::Destroy => "destroy",
            OperationKind::Release => "release",
            OperationKind::Validate => "validate",
            OperationKind::Auth => "auth",
            OperationKind::Docs => "docs",
            OperationKind::ConfigSync => "config_sync",
            OperationKind::Exec => "exec",
            OperationKind::Logs => "logs",
            OperationKind::QueueProject => "queue_project",
            OperationKind::PollApplication => "poll_application",
            OperationKind::StatusReport => "status_report",
            OperationKind::StartTask => "start_task",
            OperationKind::StopTask => "stop_task",
            OperationKind::WatchTask => "watch_task",
            OperationKind::Init => "init",
            OperationKind::PipelineStep => "pipeline_step",
        }
    }
}

/// What a job does. The payload is opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Operation {
    pub kind: OperationKind,
    pub payload: Vec<u8>,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ApplicationRef {
    pub project: String,
    pub application: String,
}

impl ApplicationRef {
    pub fn new(project: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            application: application.into(),
        }
    }

    /// Case-insensitive identity of the app, used for counters and lookups.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.project.to_lowercase(),
            self.application.to_lowercase()
        )
    }
}

/// Which runners may take a job.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum TargetRunner {
    Any,
    Id(String),
    /// Runner labels must be a superset of these.
    Labels(BTreeMap<String, String>),
}

impl TargetRunner {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            TargetRunner::Any => "any",
            TargetRunner::Id(_) => "id",
            TargetRunner::Labels(_) => "labels",
        }
    }

    pub fn matches(&self, runner: &Runner) -> bool {
        match self {
            TargetRunner::Any => !runner.by_id_only,
            TargetRunner::Id(id) => *id == runner.id,
            TargetRunner::Labels(labels) => labels
                .iter()
                .all(|(k, v)| runner.labels.get(k) == Some(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub(crate) fn canceled() -> Self {
        Self::new("canceled", "canceled")
    }

    pub(crate) fn dependency_errored(dep: &str) -> Self {
        Self::new("dependency", format!("dependency {:?} errored", dep))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct PipelineStepRef {
    pub run_id: String,
    pub step: String,
}

/// A unit of schedulable work. Stored durably under `jobs/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Job {
    pub id: String,
    pub operation: Operation,
    pub application: ApplicationRef,
    pub workspace: String,
    pub target_runner: TargetRunner,
    pub depends_on: Vec<String>,
    pub depends_on_allow_failure: Vec<String>,
    pub singleton_id: Option<String>,
    pub state: JobState,
    pub assigned_runner: Option<String>,
    pub queue_time_ms: i64,
    pub queue_seq: u64,
    pub assign_time_ms: Option<i64>,
    pub ack_time_ms: Option<i64>,
    pub complete_time_ms: Option<i64>,
    /// Set when cancellation was requested; executors watch for it.
    pub cancel_time_ms: Option<i64>,
    pub expire_time_ms: Option<i64>,
    pub result: Option<Vec<u8>>,
    pub error: Option<JobError>,
    /// On-demand runner task this job belongs to.
    pub task: Option<String>,
    pub pipeline: Option<PipelineStepRef>,
}

impl Versioned for Job {
    const VERSION: u8 = 1;
}

impl Job {
    /// A new job document as submitted by a client; state and timestamps are filled in
    /// by `State::job_create`.
    pub fn new(
        id: impl Into<String>,
        operation: Operation,
        application: ApplicationRef,
        workspace: impl Into<String>,
        target_runner: TargetRunner,
    ) -> Self {
        Self {
            id: id.into(),
            operation,
            application,
            workspace: workspace.into(),
            target_runner,
            depends_on: Vec::new(),
            depends_on_allow_failure: Vec::new(),
            singleton_id: None,
            state: JobState::Queued,
            assigned_runner: None,
            queue_time_ms: 0,
            queue_seq: 0,
            assign_time_ms: None,
            ack_time_ms: None,
            complete_time_ms: None,
            cancel_time_ms: None,
            expire_time_ms: None,
            result: None,
            error: None,
            task: None,
            pipeline: None,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_singleton(mut self, singleton_id: impl Into<String>) -> Self {
        self.singleton_id = Some(singleton_id.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_time_ms.is_some()
    }

    /// Key of the blocked-by-app assignment index.
    pub fn app_workspace_key(&self) -> String {
        app_workspace_key(&self.application, &self.workspace)
    }
}

pub(crate) fn app_workspace_key(app: &ApplicationRef, workspace: &str) -> String {
    format!("{}/{}", app.key(), workspace.to_lowercase())
}

/// Memory-index projection of a job: only what assignment, blocking, cascade and
/// listing need. The full document stays in the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIndex {
    pub id: String,
    pub state: JobState,
    pub operation: OperationKind,
    pub application: ApplicationRef,
    pub workspace: String,
    pub target: TargetRunner,
    pub depends_on: Vec<String>,
    pub depends_on_allow_failure: Vec<String>,
    pub singleton_id: Option<String>,
    pub queue_time_ms: i64,
    pub queue_seq: u64,
    pub assigned_runner: Option<String>,
    pub assign_time_ms: Option<i64>,
    pub expire_time_ms: Option<i64>,
    pub cancelled: bool,
}

impl From<&Job> for JobIndex {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            operation: job.operation.kind,
            application: job.application.clone(),
            workspace: job.workspace.clone(),
            target: job.target_runner.clone(),
            depends_on: job.depends_on.clone(),
            depends_on_allow_failure: job.depends_on_allow_failure.clone(),
            singleton_id: job.singleton_id.clone(),
            queue_time_ms: job.queue_time_ms,
            queue_seq: job.queue_seq,
            assigned_runner: job.assigned_runner.clone(),
            assign_time_ms: job.assign_time_ms,
            expire_time_ms: job.expire_time_ms,
            cancelled: job.is_cancelled(),
        }
    }
}

impl JobIndex {
    pub fn app_workspace_key(&self) -> String {
        app_workspace_key(&self.application, &self.workspace)
    }
}

pub(crate) const IDX_TARGET: &str = "target";
pub(crate) const IDX_SINGLETON: &str = "singleton";
pub(crate) const IDX_DEPENDS_ON: &str = "depends_on";
pub(crate) const IDX_COMPLETED: &str = "completed";
pub(crate) const IDX_QUEUE: &str = "queue";

impl Record for JobIndex {
    const TABLE: &'static str = "jobs";

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
        let qt = self.queue_time_ms;
        let seq = self.queue_seq;
        let target_id = match &self.target {
            TargetRunner::Id(id) => id.as_str(),
            _ => "",
        };
        let mut keys = vec![
            (
                IDX_TARGET,
                key![self.state.as_i64(), self.target.tag(), target_id, qt, seq],
            ),
            (IDX_COMPLETED, key![self.state.is_completed(), qt, seq]),
            (IDX_QUEUE, key![qt, seq]),
        ];
        if let Some(sid) = &self.singleton_id {
            keys.push((IDX_SINGLETON, key![sid.as_str(), self.state.as_i64()]));
        }
        for dep in &self.depends_on {
            keys.push((IDX_DEPENDS_ON, key![dep.as_str()]));
        }
        keys
    }
}

/// Blocked-by-app index: which serializing job currently holds a project/app/workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    pub key: String,
    pub job_id: String,
}

impl Record for JobAssignment {
    const TABLE: &'static str = "job_assigned";

    fn id(&self) -> &str {
        &self.key
    }

    fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
        Vec::new()
    }
}
