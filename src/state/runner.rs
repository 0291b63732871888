use tracing::info;

use super::helpers::now_epoch_ms;
use super::{State, StateError};
use crate::keys::Bucket;
use crate::runner::{AdoptionState, Runner, RunnerKind};

impl State {
    /// Register or refresh a runner on check-in.
    ///
    /// A known runner keeps its first-seen time and adoption state, except that an
    /// adopted runner whose labels changed goes back to pending. Rejected stays rejected.
    pub async fn runner_create(&self, runner: Runner) -> Result<Runner, StateError> {
        let mut runner = runner;
        let now = now_epoch_ms();
        let mut txn = self.txn().await;
        match txn.get::<Runner>(Bucket::Runners, &runner.id).await? {
            Some(existing) => {
                runner.first_seen_ms = existing.first_seen_ms;
                runner.adoption_state = match existing.adoption_state {
                    AdoptionState::Adopted | AdoptionState::Preadopted
                        if existing.labels != runner.labels =>
                    {
                        info!(runner_id = %runner.id, "runner labels changed, adoption reset");
                        AdoptionState::Pending
                    }
                    other => other,
                };
            }
            None => {
                runner.first_seen_ms = now;
                info!(runner_id = %runner.id, kind = ?runner.kind, "runner registered");
            }
        }
        runner.online = true;
        runner.last_seen_ms = now;
        txn.put(Bucket::Runners, &runner.id, &runner)?;
        txn.mem.insert(runner.clone());
        txn.commit().await?;
        Ok(runner)
    }

    pub fn runner_get(&self, id: &str) -> Result<Runner, StateError> {
        self.mem
            .view(|snap| snap.get::<Runner>(id).cloned())
            .ok_or_else(|| StateError::NotFound(format!("runner {}", id)))
    }

    pub fn runner_list(&self) -> Vec<Runner> {
        self.mem
            .view(|snap| snap.all::<Runner>().cloned().collect())
    }

    /// Adopt (`true`) or reject (`false`) a runner.
    pub async fn runner_adopt(&self, id: &str, adopt: bool) -> Result<Runner, StateError> {
        let mut txn = self.txn().await;
        let mut runner = txn
            .get::<Runner>(Bucket::Runners, id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("runner {}", id)))?;
        runner.adoption_state = if adopt {
            AdoptionState::Adopted
        } else {
            AdoptionState::Rejected
        };
        txn.put(Bucket::Runners, id, &runner)?;
        txn.mem.insert(runner.clone());
        txn.commit().await?;
        info!(runner_id = %id, adopt, "runner adoption decided");
        Ok(runner)
    }

    /// Handle a runner disconnecting. Local and on-demand runners are forgotten, as
    /// are remote runners never adopted; other remote runners are kept offline.
    pub async fn runner_offline(&self, id: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        let Some(mut runner) = txn.get::<Runner>(Bucket::Runners, id).await? else {
            return Ok(());
        };
        let forget = match runner.kind {
            RunnerKind::Local | RunnerKind::OnDemand => true,
            RunnerKind::Remote => runner.adoption_state == AdoptionState::Pending,
        };
        if forget {
            txn.delete(Bucket::Runners, id);
            txn.mem.delete::<Runner>(id);
        } else {
            runner.online = false;
            txn.put(Bucket::Runners, id, &runner)?;
            txn.mem.insert(runner);
        }
        txn.commit().await?;
        info!(runner_id = %id, forgotten = forget, "runner offline");
        Ok(())
    }

    pub async fn runner_delete(&self, id: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.delete(Bucket::Runners, id);
        txn.mem.delete::<Runner>(id);
        txn.commit().await
    }
}
