use tracing::info;

use super::{State, StateError};
use crate::job::JobState;
use crate::keys::Bucket;
use crate::task::Task;

impl State {
    pub async fn task_put(&self, task: &Task) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(Bucket::Tasks, &task.id, task)?;
        txn.commit().await
    }

    pub async fn task_get(&self, id: &str) -> Result<Task, StateError> {
        self.get_durable::<Task>(Bucket::Tasks, id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("task {}", id)))
    }

    pub async fn task_list(&self) -> Result<Vec<Task>, StateError> {
        Ok(self
            .scan_bucket::<Task>(Bucket::Tasks)
            .await?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    pub async fn task_delete(&self, id: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.delete(Bucket::Tasks, id);
        txn.commit().await
    }

    /// Apply a constituent job's new state to its task.
    pub(crate) async fn task_advance(
        &self,
        task_id: &str,
        job_id: &str,
        job_state: JobState,
    ) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        let Some(mut task) = txn.get::<Task>(Bucket::Tasks, task_id).await? else {
            return Err(StateError::NotFound(format!("task {}", task_id)));
        };
        let Some(next) = task.advance(job_id, job_state) else {
            return Ok(());
        };
        let prev = task.state;
        task.state = next;
        txn.put(Bucket::Tasks, task_id, &task)?;
        txn.commit().await?;
        info!(task_id, job_id, from = ?prev, to = ?next, "task advanced");
        Ok(())
    }

    /// Replay the durable states of every unfinished task's jobs. Catches up tasks whose
    /// update was lost between a job commit and the observer's own commit.
    pub(crate) async fn tasks_reconcile(&self) -> Result<usize, StateError> {
        let tasks = self.task_list().await?;
        let mut txn = self.txn().await;
        let mut changed = 0;
        for mut task in tasks.into_iter().filter(|t| !t.state.is_final()) {
            let before = task.state;
            let jobs = [
                task.start_job.clone(),
                task.task_job.clone(),
                task.stop_job.clone(),
            ];
            for job_id in &jobs {
                let Some(job) = txn.job_get(job_id).await? else {
                    continue;
                };
                if let Some(next) = task.advance(job_id, job.state) {
                    task.state = next;
                }
            }
            if task.state != before {
                txn.put(Bucket::Tasks, &task.id, &task)?;
                info!(task_id = %task.id, from = ?before, to = ?task.state, "task reconciled");
                changed += 1;
            }
        }
        txn.commit().await?;
        Ok(changed)
    }
}
