use tracing::info;

use super::{State, StateError};
use crate::job::JobState;
use crate::keys::Bucket;
use crate::pipeline::{Pipeline, PipelineRun, PipelineRunState};

impl State {
    pub async fn pipeline_put(&self, pipeline: &Pipeline) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(Bucket::Pipelines, &pipeline.id, pipeline)?;
        txn.commit().await
    }

    pub async fn pipeline_get(&self, id: &str) -> Result<Pipeline, StateError> {
        self.get_durable::<Pipeline>(Bucket::Pipelines, id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("pipeline {}", id)))
    }

    pub async fn pipeline_run_put(&self, run: &PipelineRun) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(Bucket::PipelineRuns, &run.id, run)?;
        txn.commit().await
    }

    pub async fn pipeline_run_get(&self, id: &str) -> Result<PipelineRun, StateError> {
        self.get_durable::<PipelineRun>(Bucket::PipelineRuns, id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("pipeline run {}", id)))
    }

    /// Fold a step job's new state into its run.
    pub(crate) async fn pipeline_run_observe(
        &self,
        run_id: &str,
        job_id: &str,
        job_state: JobState,
    ) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        let Some(mut run) = txn.get::<PipelineRun>(Bucket::PipelineRuns, run_id).await? else {
            return Err(StateError::NotFound(format!("pipeline run {}", run_id)));
        };
        let before = run.state;
        if !run.observe(job_id, job_state) {
            return Ok(());
        }
        txn.put(Bucket::PipelineRuns, run_id, &run)?;
        txn.commit().await?;
        if run.state != before {
            info!(run_id, job_id, from = ?before, to = ?run.state, "pipeline run advanced");
        }
        Ok(())
    }

    /// Fold the durable state of each step job into every unfinished run.
    pub(crate) async fn pipeline_runs_reconcile(&self) -> Result<usize, StateError> {
        let runs = self.scan_bucket::<PipelineRun>(Bucket::PipelineRuns).await?;
        let mut txn = self.txn().await;
        let mut changed = 0;
        for (run_id, mut run) in runs {
            if matches!(run.state, PipelineRunState::Success | PipelineRunState::Error) {
                continue;
            }
            let before = run.state;
            let job_ids: Vec<String> = run.jobs.keys().cloned().collect();
            let mut touched = false;
            for job_id in &job_ids {
                let Some(job) = txn.job_get(job_id).await? else {
                    continue;
                };
                touched |= run.observe(job_id, job.state);
            }
            if touched {
                txn.put(Bucket::PipelineRuns, &run_id, &run)?;
                info!(run_id = %run_id, from = ?before, to = ?run.state, "pipeline run reconciled");
                changed += 1;
            }
        }
        txn.commit().await?;
        Ok(changed)
    }
}
