use tracing::info;

use super::{State, StateError};
use crate::job::{JobIndex, IDX_COMPLETED};
use crate::key;
use crate::operation::{Build, Deployment, PushedArtifact, Release, StatusReport};

impl State {
    /// Drop the oldest finished jobs from the memory index until at most `max` jobs
    /// remain indexed. Unfinished jobs are never dropped, and the durable documents
    /// stay where they are. Returns how many were dropped.
    pub async fn job_prune(&self, max: usize) -> Result<usize, StateError> {
        let mut txn = self.txn().await;
        let total = txn.mem.len::<JobIndex>();
        if total <= max {
            return Ok(0);
        }
        let victims: Vec<String> = txn
            .mem
            .prefix::<JobIndex>(IDX_COMPLETED, &key![true])
            .into_iter()
            .take(total - max)
            .map(|j| j.id)
            .collect();
        for id in &victims {
            txn.mem.delete::<JobIndex>(id);
            txn.drop_output(id);
        }
        txn.commit().await?;

        let pruned = victims.len();
        if pruned > 0 {
            if let Some(m) = &self.metrics {
                m.record_pruned("jobs", pruned as u64);
            }
            info!(pruned, max, "pruned finished jobs from memory index");
        }
        Ok(pruned)
    }

    /// Prune every memory index to its configured cap.
    pub async fn prune_indexes(&self) -> Result<(), StateError> {
        self.job_prune(self.cfg.job_index_max).await?;
        let max = self.cfg.operation_index_max;
        self.operation_prune::<Build>(max).await?;
        self.operation_prune::<PushedArtifact>(max).await?;
        self.operation_prune::<Deployment>(max).await?;
        self.operation_prune::<Release>(max).await?;
        self.operation_prune::<StatusReport>(max).await?;
        Ok(())
    }
}
