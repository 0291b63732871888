use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use tracing::info;

use super::helpers::now_epoch_ms;
use super::{State, StateError, StateTxn};
use crate::graph::Graph;
use crate::job::{Job, JobError, JobIndex, JobState, IDX_SINGLETON};
use crate::key;

impl State {
    /// Queue a batch of jobs atomically.
    ///
    /// Dependencies inside the batch are allowed in any submission order: the batch is
    /// checked for cycles and created in topological order. Every other dependency must
    /// already exist. Returns the created jobs in submission order.
    pub async fn job_create(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StateError> {
        let mut jobs = jobs;
        let mut seen = HashSet::new();
        for job in &mut jobs {
            if job.id.is_empty() {
                job.id = uuid::Uuid::new_v4().to_string();
            }
            if !seen.insert(job.id.clone()) {
                return Err(StateError::FailedPrecondition(format!(
                    "job {} appears more than once in the batch",
                    job.id
                )));
            }
            if job.depends_on.iter().any(|d| d.is_empty()) {
                return Err(StateError::FailedPrecondition(format!(
                    "job {} has an empty dependency id",
                    job.id
                )));
            }
            if let Some(extra) = job
                .depends_on_allow_failure
                .iter()
                .find(|d| !job.depends_on.contains(d))
            {
                return Err(StateError::FailedPrecondition(format!(
                    "job {} allows failure of {}, which it does not depend on",
                    job.id, extra
                )));
            }
        }

        let order = creation_order(&jobs)?;
        let submitted: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let mut by_id: HashMap<String, Job> = jobs.into_iter().map(|j| (j.id.clone(), j)).collect();

        let mut txn = self.txn().await;
        let mut created = HashMap::new();
        for id in order {
            let Some(job) = by_id.remove(&id) else {
                continue;
            };
            let job = self.create_one(&mut txn, job).await?;
            created.insert(id, job);
        }
        txn.commit().await?;

        Ok(submitted
            .into_iter()
            .filter_map(|id| created.remove(&id))
            .collect())
    }

    async fn create_one(&self, txn: &mut StateTxn<'_>, mut job: Job) -> Result<Job, StateError> {
        if txn.job_get(&job.id).await?.is_some() {
            return Err(StateError::FailedPrecondition(format!(
                "job {} already exists",
                job.id
            )));
        }

        let mut errored_dep = None;
        for dep in &job.depends_on {
            let dep_state = match txn.mem.get::<JobIndex>(dep) {
                Some(indexed) => indexed.state,
                None => match txn.job_get(dep).await? {
                    Some(stored) => stored.state,
                    None => return Err(StateError::NotFound(format!("dependency job {}", dep))),
                },
            };
            if dep_state == JobState::Error
                && !job.depends_on_allow_failure.contains(dep)
                && errored_dep.is_none()
            {
                errored_dep = Some(dep.clone());
            }
        }

        let now = now_epoch_ms();
        job.queue_time_ms = now;
        job.queue_seq = self.queue_seq.fetch_add(1, Ordering::SeqCst);
        job.assigned_runner = None;
        job.assign_time_ms = None;
        job.ack_time_ms = None;
        job.complete_time_ms = None;
        job.cancel_time_ms = None;
        job.result = None;
        job.error = None;
        job.state = JobState::Queued;

        if let Some(sid) = job.singleton_id.clone() {
            let replaced = txn.mem.prefix::<JobIndex>(
                IDX_SINGLETON,
                &key![sid.as_str(), JobState::Queued.as_i64()],
            );
            for (i, old) in replaced.into_iter().enumerate() {
                let Some(mut old_job) = txn.job_get(&old.id).await? else {
                    continue;
                };
                if i == 0 {
                    job.queue_time_ms = old_job.queue_time_ms;
                    job.queue_seq = old_job.queue_seq;
                }
                old_job.state = JobState::Error;
                old_job.error = Some(JobError::new("replaced", "replaced by a newer singleton job"));
                old_job.complete_time_ms = Some(now);
                txn.job_put(&old_job, Some(JobState::Queued))?;
                info!(job_id = %old_job.id, replaced_by = %job.id, singleton_id = %sid, "singleton job replaced");
            }
        }

        if let Some(dep) = errored_dep {
            job.state = JobState::Error;
            job.error = Some(JobError::dependency_errored(&dep));
            job.complete_time_ms = Some(now);
        }

        txn.job_put(&job, None)?;
        info!(
            job_id = %job.id,
            operation = job.operation.kind.as_str(),
            state = %job.state,
            "job queued"
        );
        Ok(job)
    }
}

/// Order a batch so every job comes after the batch members it depends on. Jobs with no
/// ordering constraint between them keep their submission order.
fn creation_order(jobs: &[Job]) -> Result<Vec<String>, StateError> {
    let position: HashMap<&str, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| (job.id.as_str(), i))
        .collect();
    let mut graph: Graph<(usize, String)> = Graph::new();
    for (i, job) in jobs.iter().enumerate() {
        graph.add((i, job.id.clone()));
    }
    for (i, job) in jobs.iter().enumerate() {
        for dep in &job.depends_on {
            if let Some(&d) = position.get(dep.as_str()) {
                graph.add_edge(&(d, dep.clone()), &(i, job.id.clone()));
            }
        }
    }
    let cycles = graph.cycles();
    if let Some(cycle) = cycles.first() {
        let mut ids: Vec<&str> = cycle.iter().map(|(_, id)| id.as_str()).collect();
        ids.sort();
        return Err(StateError::FailedPrecondition(format!(
            "dependency cycle between jobs: {}",
            ids.join(", ")
        )));
    }
    Ok(graph.kahn_sort().into_iter().map(|(_, id)| id).collect())
}
