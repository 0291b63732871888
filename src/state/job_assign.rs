use std::time::Instant as StdInstant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::helpers::now_epoch_ms;
use super::job_blocked::job_is_blocked;
use super::{State, StateError};
use crate::job::{Job, JobIndex, JobState, IDX_TARGET};
use crate::key;
use crate::memdb::{Snapshot, WatchSet};
use crate::runner::{AdoptionState, Runner};

/// Unblocked candidates gathered per strategy in one snapshot.
const CANDIDATES_PER_STRATEGY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ById,
    ByLabels,
    Any,
}

impl Strategy {
    fn as_str(&self) -> &'static str {
        match self {
            Strategy::ById => "id",
            Strategy::ByLabels => "labels",
            Strategy::Any => "any",
        }
    }
}

/// Queued, unblocked jobs this runner could take, in strategy order and queue order
/// within a strategy.
fn candidates(snap: &Snapshot<'_>, runner: &Runner) -> Vec<(Strategy, String)> {
    let queued = JobState::Queued.as_i64();
    let mut out = Vec::new();

    out.extend(
        snap.prefix::<JobIndex>(IDX_TARGET, &key![queued, "id", runner.id.as_str()])
            .filter(|j| !job_is_blocked(snap, j))
            .take(CANDIDATES_PER_STRATEGY)
            .map(|j| (Strategy::ById, j.id.clone())),
    );
    out.extend(
        snap.prefix::<JobIndex>(IDX_TARGET, &key![queued, "labels"])
            .filter(|j| j.target.matches(runner) && !job_is_blocked(snap, j))
            .take(CANDIDATES_PER_STRATEGY)
            .map(|j| (Strategy::ByLabels, j.id.clone())),
    );
    if !runner.by_id_only {
        out.extend(
            snap.prefix::<JobIndex>(IDX_TARGET, &key![queued, "any"])
                .filter(|j| !job_is_blocked(snap, j))
                .take(CANDIDATES_PER_STRATEGY)
                .map(|j| (Strategy::Any, j.id.clone())),
        );
    }
    out
}

impl State {
    /// Assign the next matching job to `runner`, moving it QUEUED -> WAITING.
    ///
    /// Blocks until a job is available or `cancel` fires, which yields
    /// `StateError::Canceled`.
    pub async fn job_assign_for_runner(
        &self,
        runner: &Runner,
        cancel: &CancellationToken,
    ) -> Result<Job, StateError> {
        if runner.adoption_state == AdoptionState::Rejected {
            return Err(StateError::PermissionDenied(format!(
                "runner {} is rejected",
                runner.id
            )));
        }
        let started = StdInstant::now();
        loop {
            if cancel.is_cancelled() {
                self.record_assign_wait("canceled", started);
                return Err(StateError::Canceled("job assignment canceled".to_string()));
            }

            let mut ws = WatchSet::new();
            let found = self.mem.view(|snap| {
                snap.watch::<JobIndex>(&mut ws);
                candidates(snap, runner)
            });

            for (strategy, job_id) in &found {
                if let Some(job) = self.try_assign(runner, job_id).await? {
                    if let Some(m) = &self.metrics {
                        m.record_assigned(strategy.as_str());
                    }
                    self.record_assign_wait("assigned", started);
                    info!(
                        job_id = %job.id,
                        runner_id = %runner.id,
                        strategy = strategy.as_str(),
                        "job assigned"
                    );
                    return Ok(job);
                }
            }
            if !found.is_empty() {
                // every candidate was taken by another runner; rescan right away
                continue;
            }

            if !ws.wait_cancellable(cancel).await {
                self.record_assign_wait("canceled", started);
                return Err(StateError::Canceled("job assignment canceled".to_string()));
            }
        }
    }

    /// The job `job_assign_for_runner` would assign right now, without assigning it.
    pub async fn job_peek_for_runner(&self, runner: &Runner) -> Result<Option<Job>, StateError> {
        if runner.adoption_state == AdoptionState::Rejected {
            return Err(StateError::PermissionDenied(format!(
                "runner {} is rejected",
                runner.id
            )));
        }
        let first = self
            .mem
            .view(|snap| candidates(snap, runner).into_iter().next());
        match first {
            Some((_, job_id)) => self.job_by_id_durable(&job_id).await,
            None => Ok(None),
        }
    }

    /// Re-check a candidate under the writer lock and assign it. `None` if the job
    /// was taken, blocked or changed since the snapshot.
    async fn try_assign(&self, runner: &Runner, job_id: &str) -> Result<Option<Job>, StateError> {
        let mut txn = self.txn().await;
        let Some(indexed) = txn.mem.get::<JobIndex>(job_id) else {
            return Ok(None);
        };
        if indexed.state != JobState::Queued
            || !indexed.target.matches(runner)
            || job_is_blocked(&txn.mem, &indexed)
        {
            debug!(job_id, runner_id = %runner.id, "lost assignment race");
            return Ok(None);
        }
        let Some(mut job) = txn.job_get(job_id).await? else {
            return Ok(None);
        };
        job.state = JobState::Waiting;
        job.assigned_runner = Some(runner.id.clone());
        job.assign_time_ms = Some(now_epoch_ms());
        txn.job_put(&job, Some(JobState::Queued))?;
        txn.commit().await?;
        Ok(Some(job))
    }

    fn record_assign_wait(&self, outcome: &str, started: StdInstant) {
        if let Some(m) = &self.metrics {
            m.record_assign_wait(outcome, started.elapsed().as_secs_f64());
        }
    }
}
