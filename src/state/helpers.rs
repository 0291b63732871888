use std::time::{Duration, SystemTime, UNIX_EPOCH};

use slatedb::DbIterator;
use tokio::time::Instant;
use tracing::debug;

use super::registry::insert_job_index;
use super::{State, StateError, StateTxn};
use crate::codec::Stored;
use crate::deadline::DeadlineKind;
use crate::job::{Job, JobIndex, JobState};
use crate::keys::{bucket_key, bucket_prefix, end_bound, id_from_key, Bucket};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The monotonic instant corresponding to a wall-clock time; past times map to now.
pub(crate) fn instant_at_ms(epoch_ms: i64) -> Instant {
    let delta = epoch_ms.saturating_sub(now_epoch_ms()).max(0) as u64;
    Instant::now() + Duration::from_millis(delta)
}

impl State {
    /// Read one durable record outside of a transaction.
    pub(crate) async fn get_durable<T: Stored>(
        &self,
        bucket: Bucket,
        id: &str,
    ) -> Result<Option<T>, StateError> {
        match self.db.get(bucket_key(bucket, id).as_bytes()).await? {
            Some(bytes) => Ok(Some(T::from_stored(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every raw entry of a bucket in key order, as `(id, value)`.
    pub(crate) async fn scan_bucket_raw(
        &self,
        bucket: Bucket,
    ) -> Result<Vec<(String, Vec<u8>)>, StateError> {
        let prefix = bucket_prefix(bucket);
        let start = prefix.as_bytes().to_vec();
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..end).await?;
        let mut out = Vec::new();
        while let Some(kv) = iter.next().await? {
            if let Some(id) = id_from_key(bucket, &kv.key) {
                out.push((id, kv.value.to_vec()));
            }
        }
        Ok(out)
    }

    /// Every record of a bucket in key order.
    pub(crate) async fn scan_bucket<T: Stored>(
        &self,
        bucket: Bucket,
    ) -> Result<Vec<(String, T)>, StateError> {
        self.scan_bucket_raw(bucket)
            .await?
            .into_iter()
            .map(|(id, bytes)| Ok((id, T::from_stored(&bytes)?)))
            .collect()
    }
}

impl StateTxn<'_> {
    /// The durable job document.
    pub(crate) async fn job_get(&self, id: &str) -> Result<Option<Job>, StateError> {
        self.get::<Job>(Bucket::Jobs, id).await
    }

    /// A job that is present in the memory index, loaded from the durable store.
    pub(crate) async fn job_get_indexed(&self, id: &str) -> Result<Job, StateError> {
        if self.mem.get::<JobIndex>(id).is_none() {
            return Err(StateError::NotFound(format!("job {}", id)));
        }
        self.job_get(id)
            .await?
            .ok_or_else(|| StateError::Internal(format!("job {} indexed but not stored", id)))
    }

    /// Write a job to both backends and queue the side effects of its state:
    /// blocked-by-app entry, deadlines, output buffer, observer transition and cascade.
    ///
    /// `prev` is the state the job had before this transaction touched it, `None` for
    /// a new job.
    pub(crate) fn job_put(&mut self, job: &Job, prev: Option<JobState>) -> Result<(), StateError> {
        self.put(Bucket::Jobs, &job.id, job)?;
        insert_job_index(&mut self.mem, job);

        let changed = prev != Some(job.state);
        match job.state {
            JobState::Queued => {
                if changed {
                    self.disarm(&job.id, DeadlineKind::AckTimeout);
                    self.disarm(&job.id, DeadlineKind::Heartbeat);
                }
                self.arm_expiry(job);
            }
            JobState::Waiting => {
                if changed {
                    let at = Instant::now() + self.state.cfg.waiting_timeout();
                    self.arm(&job.id, DeadlineKind::AckTimeout, at);
                }
                self.arm_expiry(job);
            }
            JobState::Running => {
                if changed {
                    self.disarm(&job.id, DeadlineKind::AckTimeout);
                    self.disarm(&job.id, DeadlineKind::Expire);
                    let at = Instant::now() + self.state.cfg.heartbeat_timeout();
                    self.arm(&job.id, DeadlineKind::Heartbeat, at);
                    self.open_output(&job.id);
                }
            }
            JobState::Success | JobState::Error => {
                if changed {
                    self.disarm_all(&job.id);
                    self.close_output(&job.id);
                }
            }
        }

        if changed {
            debug!(
                job_id = %job.id,
                from = prev.map(|s| s.as_str()).unwrap_or("none"),
                to = %job.state,
                "job state written"
            );
            if job.state == JobState::Error {
                self.errored.push_back(job.id.clone());
            }
        }
        self.record_transition(job, prev);
        Ok(())
    }

    fn arm_expiry(&mut self, job: &Job) {
        match job.expire_time_ms {
            Some(ms) => self.arm(&job.id, DeadlineKind::Expire, instant_at_ms(ms)),
            None => self.disarm(&job.id, DeadlineKind::Expire),
        }
    }
}
