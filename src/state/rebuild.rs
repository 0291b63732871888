use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use slatedb::WriteBatch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::helpers::instant_at_ms;
use super::{State, StateError};
use crate::deadline::DeadlineKind;
use crate::job::{JobIndex, JobState};
use crate::keys::{bucket_key, bucket_prefix, Bucket};
use crate::output::OutputBuffer;

impl State {
    /// Rebuild every memory index from slatedb and restore what lives only in memory:
    /// counters, deadlines and output buffers of running jobs. Tasks and pipeline runs are
    /// caught up with the durable state of their jobs.
    pub(super) async fn rebuild(&self) -> Result<(), StateError> {
        self.migrate_legacy_config().await?;

        let mut mem = self.mem.txn();
        for entry in self.registry.entries() {
            let rows = self.scan_bucket_raw(entry.bucket).await?;
            for (_, bytes) in &rows {
                (entry.index)(&mut mem, bytes)?;
            }
            debug!(bucket = entry.bucket.as_str(), count = rows.len(), "bucket indexed");
        }
        mem.commit();

        let jobs: Vec<JobIndex> = self.mem.view(|snap| snap.all::<JobIndex>().cloned().collect());
        let next_seq = jobs.iter().map(|j| j.queue_seq + 1).max().unwrap_or(0);
        self.queue_seq.store(next_seq, Ordering::SeqCst);

        let waiting_ms = self.cfg.waiting_timeout_ms as i64;
        let mut rearmed = 0usize;
        for job in &jobs {
            match job.state {
                JobState::Waiting => {
                    let assigned = job.assign_time_ms.unwrap_or(job.queue_time_ms);
                    self.deadlines.arm(
                        &job.id,
                        DeadlineKind::AckTimeout,
                        instant_at_ms(assigned.saturating_add(waiting_ms)),
                    );
                    rearmed += 1;
                }
                JobState::Running => {
                    // last heartbeat is not persisted; restart grants a full window
                    self.deadlines.arm(
                        &job.id,
                        DeadlineKind::Heartbeat,
                        Instant::now() + self.cfg.heartbeat_timeout(),
                    );
                    self.outputs
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(
                            job.id.clone(),
                            Arc::new(OutputBuffer::new(self.cfg.output_buffer_lines)),
                        );
                    rearmed += 1;
                }
                _ => {}
            }
            if matches!(job.state, JobState::Queued | JobState::Waiting) {
                if let Some(at) = job.expire_time_ms {
                    self.deadlines.arm(&job.id, DeadlineKind::Expire, instant_at_ms(at));
                }
            }
        }

        let tasks = self.tasks_reconcile().await?;
        let runs = self.pipeline_runs_reconcile().await?;

        info!(
            jobs = jobs.len(),
            rearmed,
            next_queue_seq = next_seq,
            tasks_reconciled = tasks,
            runs_reconciled = runs,
            "memory index rebuilt"
        );
        self.prune_indexes().await
    }

    /// Move entries of the pre-versioned `config` bucket into `config_v2` and delete
    /// the originals, all in one batch.
    async fn migrate_legacy_config(&self) -> Result<(), StateError> {
        let legacy = self.scan_bucket_raw(Bucket::LegacyConfig).await?;
        if legacy.is_empty() {
            return Ok(());
        }
        let legacy_prefix = bucket_prefix(Bucket::LegacyConfig);
        let mut batch = WriteBatch::new();
        for (id, value) in &legacy {
            batch.put(bucket_key(Bucket::Config, id).as_bytes(), value);
            batch.delete(format!("{}{}", legacy_prefix, id).as_bytes());
        }
        self.db.write(batch).await?;
        info!(count = legacy.len(), "migrated legacy config bucket");
        Ok(())
    }
}
