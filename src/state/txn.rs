use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError};

use slatedb::WriteBatch;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::debug;

use super::{State, StateError, Transition};
use crate::codec::Stored;
use crate::deadline::DeadlineKind;
use crate::job::{Job, JobState};
use crate::keys::{bucket_key, Bucket};
use crate::memdb::MemTxn;
use crate::output::OutputBuffer;

enum DeadlineOp {
    Arm(String, DeadlineKind, Instant),
    Disarm(String, DeadlineKind),
    DisarmAll(String),
}

enum OutputOp {
    Open(String),
    Close(String),
    Drop(String),
}

/// One write transaction over both backends.
///
/// Durable writes accumulate in a slatedb `WriteBatch` (with a local overlay so the
/// transaction reads its own writes) and index writes in a memdb overlay. Deadline
/// and output-buffer changes are queued and only applied once both commits went
/// through. Dropping the transaction without `commit` discards everything.
pub struct StateTxn<'a> {
    pub(crate) state: &'a State,
    writer: MutexGuard<'a, ()>,
    batch: WriteBatch,
    writes: usize,
    durable: HashMap<String, Option<Vec<u8>>>,
    pub(crate) mem: MemTxn,
    deadline_ops: Vec<DeadlineOp>,
    output_ops: Vec<OutputOp>,
    transitions: Vec<Transition>,
    transition_pos: HashMap<String, usize>,
    pub(crate) errored: VecDeque<String>,
    pub(crate) cascaded: u64,
}

impl<'a> StateTxn<'a> {
    pub(super) fn new(state: &'a State, writer: MutexGuard<'a, ()>) -> Self {
        Self {
            state,
            writer,
            batch: WriteBatch::new(),
            writes: 0,
            durable: HashMap::new(),
            mem: state.mem.txn(),
            deadline_ops: Vec::new(),
            output_ops: Vec::new(),
            transitions: Vec::new(),
            transition_pos: HashMap::new(),
            errored: VecDeque::new(),
            cascaded: 0,
        }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(staged) = self.durable.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.state.db.get(key.as_bytes()).await?.map(|b| b.to_vec()))
    }

    pub fn put_raw(&mut self, key: String, value: Vec<u8>) {
        self.batch.put(key.as_bytes(), &value);
        self.durable.insert(key, Some(value));
        self.writes += 1;
    }

    pub fn delete_raw(&mut self, key: String) {
        self.batch.delete(key.as_bytes());
        self.durable.insert(key, None);
        self.writes += 1;
    }

    /// Durable record by bucket and id, including writes staged in this transaction.
    pub async fn get<T: Stored>(&self, bucket: Bucket, id: &str) -> Result<Option<T>, StateError> {
        match self.get_raw(&bucket_key(bucket, id)).await? {
            Some(bytes) => Ok(Some(T::from_stored(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Stored>(&mut self, bucket: Bucket, id: &str, value: &T) -> Result<(), StateError> {
        let bytes = value.to_stored()?;
        self.put_raw(bucket_key(bucket, id), bytes);
        Ok(())
    }

    pub fn delete(&mut self, bucket: Bucket, id: &str) {
        self.delete_raw(bucket_key(bucket, id));
    }

    pub fn mem(&mut self) -> &mut MemTxn {
        &mut self.mem
    }

    pub(crate) fn arm(&mut self, job_id: &str, kind: DeadlineKind, at: Instant) {
        self.deadline_ops
            .push(DeadlineOp::Arm(job_id.to_string(), kind, at));
    }

    pub(crate) fn disarm(&mut self, job_id: &str, kind: DeadlineKind) {
        self.deadline_ops
            .push(DeadlineOp::Disarm(job_id.to_string(), kind));
    }

    pub(crate) fn disarm_all(&mut self, job_id: &str) {
        self.deadline_ops
            .push(DeadlineOp::DisarmAll(job_id.to_string()));
    }

    pub(crate) fn open_output(&mut self, job_id: &str) {
        self.output_ops.push(OutputOp::Open(job_id.to_string()));
    }

    pub(crate) fn close_output(&mut self, job_id: &str) {
        self.output_ops.push(OutputOp::Close(job_id.to_string()));
    }

    pub(crate) fn drop_output(&mut self, job_id: &str) {
        self.output_ops.push(OutputOp::Drop(job_id.to_string()));
    }

    /// Remember a job write for the post-commit observers. Several writes of the same
    /// job collapse into one transition from its first previous state.
    pub(crate) fn record_transition(&mut self, job: &Job, prev: Option<JobState>) {
        match self.transition_pos.get(&job.id) {
            Some(&pos) => self.transitions[pos].job = job.clone(),
            None => {
                self.transition_pos
                    .insert(job.id.clone(), self.transitions.len());
                self.transitions.push(Transition {
                    job: job.clone(),
                    prev,
                });
            }
        }
    }

    /// Commit: cascade errors to dependents, write slatedb, then apply the memory index,
    /// deadlines and output buffers. Observers run after the writer lock is released.
    pub async fn commit(mut self) -> Result<(), StateError> {
        self.cascade_errors().await?;

        let StateTxn {
            state,
            writer,
            batch,
            writes,
            mem,
            deadline_ops,
            output_ops,
            transitions,
            cascaded,
            ..
        } = self;

        if writes > 0 {
            state.db.write(batch).await?;
        }
        let touched = mem.commit();
        debug!(writes, tables = ?touched, "state txn committed");

        for op in deadline_ops {
            match op {
                DeadlineOp::Arm(id, kind, at) => state.deadlines.arm(&id, kind, at),
                DeadlineOp::Disarm(id, kind) => state.deadlines.disarm(&id, kind),
                DeadlineOp::DisarmAll(id) => state.deadlines.disarm_all(&id),
            }
        }

        if !output_ops.is_empty() {
            let mut outputs = state
                .outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for op in output_ops {
                match op {
                    OutputOp::Open(id) => {
                        outputs.insert(
                            id,
                            Arc::new(OutputBuffer::new(state.cfg.output_buffer_lines)),
                        );
                    }
                    OutputOp::Close(id) => {
                        if let Some(buf) = outputs.get(&id) {
                            buf.close();
                        }
                    }
                    OutputOp::Drop(id) => {
                        if let Some(buf) = outputs.remove(&id) {
                            buf.close();
                        }
                    }
                }
            }
        }

        drop(writer);

        let changed: Vec<Transition> = transitions
            .into_iter()
            .filter(|t| t.prev != Some(t.job.state))
            .collect();
        if !changed.is_empty() || cascaded > 0 {
            state.after_commit(changed, cascaded).await;
        }
        Ok(())
    }
}
