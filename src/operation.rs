//! Operation records: persisted outcomes of builds, pushes, deploys, releases and
//! status reports. They share one storage pattern (`state::app_operation`), reached
//! through the [`OperationRecord`] capability trait.

use std::fmt;
use std::marker::PhantomData;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::codec::{Stored, Versioned};
use crate::job::ApplicationRef;
use crate::key;
use crate::keys::Bucket;
use crate::memdb::{IndexKey, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum StatusState {
    Unknown,
    Running,
    Success,
    Error,
}

impl StatusState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusState::Success | StatusState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Status {
    pub state: StatusState,
    pub details: String,
    pub start_time_ms: i64,
    pub complete_time_ms: Option<i64>,
}

impl Status {
    pub fn running(start_time_ms: i64) -> Self {
        Self {
            state: StatusState::Running,
            details: String::new(),
            start_time_ms,
            complete_time_ms: None,
        }
    }

    pub fn finished(state: StatusState, start_time_ms: i64, complete_time_ms: i64) -> Self {
        Self {
            state,
            details: String::new(),
            start_time_ms,
            complete_time_ms: Some(complete_time_ms),
        }
    }

    /// The later of start and completion time.
    pub fn last_active_ms(&self) -> i64 {
        self.complete_time_ms
            .map_or(self.start_time_ms, |c| c.max(self.start_time_ms))
    }
}

/// Lineage shared by successive records of the same logical unit.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Generation {
    pub id: String,
    /// Sequence of the first record of this generation.
    pub initial_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum PhysicalState {
    Unknown,
    Pending,
    Created,
    Destroyed,
}

/// Capabilities the generic operation store needs from a record type.
pub trait OperationRecord: Stored + Clone + fmt::Debug + Send + Sync + 'static {
    const BUCKET: Bucket;
    /// Memory table holding this type's index rows.
    const TABLE: &'static str;
    /// Records carry a `Generation` that is created or inherited on insert.
    const HAS_GENERATION: bool = false;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn application(&self) -> &ApplicationRef;
    fn workspace(&self) -> &str;
    fn status(&self) -> &Status;
    fn sequence(&self) -> u64;
    fn set_sequence(&mut self, sequence: u64);

    fn generation(&self) -> Option<&Generation> {
        None
    }

    fn set_generation(&mut self, _generation: Option<Generation>) {}

    fn physical_state(&self) -> Option<PhysicalState> {
        None
    }
}

macro_rules! common_accessors {
    () => {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }

        fn application(&self) -> &ApplicationRef {
            &self.application
        }

        fn workspace(&self) -> &str {
            &self.workspace
        }

        fn status(&self) -> &Status {
            &self.status
        }

        fn sequence(&self) -> u64 {
            self.sequence
        }

        fn set_sequence(&mut self, sequence: u64) {
            self.sequence = sequence;
        }
    };
}

macro_rules! generation_accessors {
    () => {
        fn generation(&self) -> Option<&Generation> {
            self.generation.as_ref()
        }

        fn set_generation(&mut self, generation: Option<Generation>) {
            self.generation = generation;
        }

        fn physical_state(&self) -> Option<PhysicalState> {
            Some(self.state)
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Build {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub sequence: u64,
    pub status: Status,
    pub component: String,
    pub job_id: String,
}

impl Versioned for Build {
    const VERSION: u8 = 1;
}

impl OperationRecord for Build {
    const BUCKET: Bucket = Bucket::Builds;
    const TABLE: &'static str = "builds";
    common_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct PushedArtifact {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub sequence: u64,
    pub status: Status,
    pub build_id: String,
    pub component: String,
}

impl Versioned for PushedArtifact {
    const VERSION: u8 = 1;
}

impl OperationRecord for PushedArtifact {
    const BUCKET: Bucket = Bucket::Artifacts;
    const TABLE: &'static str = "artifacts";
    common_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Deployment {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub sequence: u64,
    pub status: Status,
    pub generation: Option<Generation>,
    pub state: PhysicalState,
    pub artifact_id: String,
    pub component: String,
    pub url: String,
}

impl Versioned for Deployment {
    const VERSION: u8 = 1;
}

impl OperationRecord for Deployment {
    const BUCKET: Bucket = Bucket::Deployments;
    const TABLE: &'static str = "deployments";
    const HAS_GENERATION: bool = true;
    common_accessors!();
    generation_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Release {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub sequence: u64,
    pub status: Status,
    pub generation: Option<Generation>,
    pub state: PhysicalState,
    pub deployment_id: String,
    pub url: String,
}

impl Versioned for Release {
    const VERSION: u8 = 1;
}

impl OperationRecord for Release {
    const BUCKET: Bucket = Bucket::Releases;
    const TABLE: &'static str = "releases";
    const HAS_GENERATION: bool = true;
    common_accessors!();
    generation_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct StatusReport {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub sequence: u64,
    pub status: Status,
    /// Deployment or release the report is about.
    pub target_id: String,
    pub health: String,
}

impl Versioned for StatusReport {
    const VERSION: u8 = 1;
}

impl OperationRecord for StatusReport {
    const BUCKET: Bucket = Bucket::StatusReports;
    const TABLE: &'static str = "status_reports";
    common_accessors!();
}

pub(crate) const IDX_SEQ: &str = "seq";
pub(crate) const IDX_START: &str = "start";
pub(crate) const IDX_COMPLETE: &str = "complete";
pub(crate) const IDX_GENERATION: &str = "generation";
pub(crate) const IDX_PRUNE: &str = "prune";

/// Memory-index projection of an operation record.
#[derive(Debug)]
pub struct OperationIndex<R> {
    pub id: String,
    pub app_key: String,
    pub workspace: String,
    pub sequence: u64,
    pub state: StatusState,
    pub start_time_ms: i64,
    pub complete_time_ms: Option<i64>,
    pub physical_state: Option<PhysicalState>,
    pub generation_id: Option<String>,
    _record: PhantomData<fn() -> R>,
}

// Manual impl: a derive would require `R: Clone` on the marker.
impl<R> Clone for OperationIndex<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            app_key: self.app_key.clone(),
            workspace: self.workspace.clone(),
            sequence: self.sequence,
            state: self.state,
            start_time_ms: self.start_time_ms,
            complete_time_ms: self.complete_time_ms,
            physical_state: self.physical_state,
            generation_id: self.generation_id.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: OperationRecord> OperationIndex<R> {
    pub fn from_record(r: &R) -> Self {
        let status = r.status();
        Self {
            id: r.id().to_string(),
            app_key: r.application().key(),
            workspace: r.workspace().to_lowercase(),
            sequence: r.sequence(),
            state: status.state,
            start_time_ms: status.start_time_ms,
            complete_time_ms: status.complete_time_ms,
            physical_state: r.physical_state(),
            generation_id: r.generation().map(|g| g.id.clone()),
            _record: PhantomData,
        }
    }
}

impl<R: OperationRecord> Record for OperationIndex<R> {
    const TABLE: &'static str = R::TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
        let app = self.app_key.as_str();
        let seq = self.sequence;
        let mut keys = vec![
            (IDX_SEQ, key![app, seq]),
            (IDX_START, key![app, self.start_time_ms, seq]),
            (
                IDX_COMPLETE,
                key![app, self.complete_time_ms.unwrap_or(0), seq],
            ),
            (
                IDX_PRUNE,
                key![self.state.is_terminal(), self.start_time_ms, app, seq],
            ),
        ];
        if let Some(gen) = &self.generation_id {
            keys.push((IDX_GENERATION, key![gen.as_str(), seq]));
        }
        keys
    }
}

/// Per-app sequence counter for one operation table. Memory only; restored from the
/// highest stored sequence at startup.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    pub key: String,
    pub value: u64,
}

impl SequenceCounter {
    pub fn key_for(table: &str, app: &ApplicationRef) -> String {
        format!("{}/{}", table, app.key())
    }
}

impl Record for SequenceCounter {
    const TABLE: &'static str = "sequences";

    fn id(&self) -> &str {
        &self.key
    }

    fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
        Vec::new()
    }
}
