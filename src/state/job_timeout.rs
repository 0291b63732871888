use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::job_ack::nack_in;
use super::job_cancel::cancel_in;
use super::{State, StateError};
use crate::deadline::DeadlineKind;
use crate::job::{JobError, JobState};

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Background task that fires due deadlines and periodically prunes the memory
/// indexes. Holds only a weak reference so it never keeps the state alive.
pub(super) fn spawn_reaper(state: &Arc<State>) -> JoinHandle<()> {
    let weak = Arc::downgrade(state);
    let deadlines = state.deadlines.clone();
    let shutdown = state.shutdown.clone();
    let prune_every = state.cfg.prune_interval();

    tokio::spawn(async move {
        let mut prune_tick = tokio::time::interval_at(Instant::now() + prune_every, prune_every);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = deadlines.next_deadline();
            let armed = deadlines.notified();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = armed => continue,
                _ = prune_tick.tick() => {
                    let Some(state) = weak.upgrade() else { break };
                    if let Err(e) = state.prune_indexes().await {
                        warn!(error = %e, "background prune failed");
                    }
                    continue;
                }
                _ = sleep_until(next) => {}
            }

            let due = deadlines.pop_due(Instant::now());
            if due.is_empty() {
                continue;
            }
            let Some(state) = weak.upgrade() else { break };
            for (job_id, kind) in due {
                if let Err(e) = state.fire_deadline(&job_id, kind).await {
                    warn!(job_id = %job_id, kind = %kind, error = %e, "deadline handling failed");
                }
            }
        }
        debug!("deadline reaper stopped");
    })
}

impl State {
    /// Apply the transition a deadline stands for, if the job is still in the state
    /// the deadline was armed for.
    pub(crate) async fn fire_deadline(&self, id: &str, kind: DeadlineKind) -> Result<(), StateError> {
        let fired = match kind {
            DeadlineKind::AckTimeout => {
                let mut txn = self.txn().await;
                let Some(mut job) = txn.job_get(id).await? else {
                    return Ok(());
                };
                if job.state != JobState::Waiting {
                    debug!(job_id = %id, state = %job.state, "ack timeout for job no longer waiting");
                    return Ok(());
                }
                nack_in(&mut txn, &mut job)?;
                txn.commit().await?;
                info!(job_id = %id, runner_id = ?job.assigned_runner, "job not acked in time, returned to queue");
                true
            }
            DeadlineKind::Heartbeat => {
                let mut txn = self.txn().await;
                let Some(mut job) = txn.job_get(id).await? else {
                    return Ok(());
                };
                if job.state != JobState::Running {
                    debug!(job_id = %id, state = %job.state, "heartbeat timeout for job no longer running");
                    return Ok(());
                }
                cancel_in(
                    &mut txn,
                    &mut job,
                    true,
                    JobError::new("heartbeat", "heartbeat timed out"),
                )?;
                txn.commit().await?;
                info!(job_id = %id, "job missed its heartbeat, marked errored");
                true
            }
            DeadlineKind::Expire => self.job_expire(id).await?,
        };
        if fired {
            if let Some(m) = &self.metrics {
                m.record_timeout(kind.as_str());
            }
        }
        Ok(())
    }
}
