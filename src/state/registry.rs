//! Which durable buckets have memory indexes, and how one stored entry is indexed.
//!
//! The same functions run at startup (replaying every bucket) and on the write path,
//! so the memory index after a restart matches the one built incrementally.

use super::StateError;
use crate::codec::Stored;
use crate::job::{Job, JobAssignment, JobIndex, JobState};
use crate::keys::Bucket;
use crate::memdb::MemTxn;
use crate::operation::{
    Build, Deployment, OperationIndex, OperationRecord, PushedArtifact, Release, SequenceCounter,
    StatusReport,
};
use crate::runner::Runner;

/// Index one durable value (already stripped of its bucket prefix) into `mem`.
pub type IndexFn = fn(&mut MemTxn, &[u8]) -> Result<(), StateError>;

#[derive(Clone, Copy)]
pub struct RegistryEntry {
    pub bucket: Bucket,
    pub index: IndexFn,
}

/// Ordered list of indexed buckets, built once and handed to `State::open_with`.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, bucket: Bucket, index: IndexFn) -> Self {
        self.entries.push(RegistryEntry { bucket, index });
        self
    }

    /// Jobs, runners and the five operation record types.
    pub fn standard() -> Self {
        Self::new()
            .register(Bucket::Jobs, index_job)
            .register(Bucket::Runners, index_runner)
            .register(Build::BUCKET, index_operation::<Build>)
            .register(PushedArtifact::BUCKET, index_operation::<PushedArtifact>)
            .register(Deployment::BUCKET, index_operation::<Deployment>)
            .register(Release::BUCKET, index_operation::<Release>)
            .register(StatusReport::BUCKET, index_operation::<StatusReport>)
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        self.entries.iter().map(|e| e.bucket)
    }
}

fn index_job(mem: &mut MemTxn, bytes: &[u8]) -> Result<(), StateError> {
    let job = Job::from_stored(bytes)?;
    insert_job_index(mem, &job);
    Ok(())
}

fn index_runner(mem: &mut MemTxn, bytes: &[u8]) -> Result<(), StateError> {
    mem.insert(Runner::from_stored(bytes)?);
    Ok(())
}

fn index_operation<R: OperationRecord>(mem: &mut MemTxn, bytes: &[u8]) -> Result<(), StateError> {
    let record = R::from_stored(bytes)?;
    insert_operation_index(mem, &record);
    Ok(())
}

/// Index a job and keep the blocked-by-app entry of serializing jobs in step with
/// its state.
pub(crate) fn insert_job_index(mem: &mut MemTxn, job: &Job) {
    mem.insert(JobIndex::from(job));
    if !job.operation.kind.is_serializing() {
        return;
    }
    let key = job.app_workspace_key();
    match job.state {
        JobState::Waiting | JobState::Running => mem.insert(JobAssignment {
            key,
            job_id: job.id.clone(),
        }),
        _ => {
            let held = mem
                .get::<JobAssignment>(&key)
                .is_some_and(|a| a.job_id == job.id);
            if held {
                mem.delete::<JobAssignment>(&key);
            }
        }
    }
}

/// Index an operation record and raise its app's sequence counter to cover it.
pub(crate) fn insert_operation_index<R: OperationRecord>(mem: &mut MemTxn, record: &R) {
    mem.insert(OperationIndex::<R>::from_record(record));
    let key = SequenceCounter::key_for(R::TABLE, record.application());
    let current = mem.get::<SequenceCounter>(&key).map_or(0, |c| c.value);
    if record.sequence() > current {
        mem.insert(SequenceCounter {
            key,
            value: record.sequence(),
        });
    }
}
