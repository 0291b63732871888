//! Generic storage for operation records (builds, artifacts, deployments, releases,
//! status reports).
//!
//! Full records live in slatedb under their type's bucket; an [`OperationIndex`] row
//! per record in the memory index serves sequence lookups, ordered listing and
//! "latest successful" queries. Per-app sequence numbers come from a memory-only
//! counter that the startup rebuild restores from the highest stored sequence.

use tracing::{debug, info};

use super::registry::insert_operation_index;
use super::{State, StateError, StateTxn};
use crate::job::ApplicationRef;
use crate::key;
use crate::memdb::WatchSet;
use crate::operation::{
    Generation, OperationIndex, OperationRecord, PhysicalState, SequenceCounter, StatusState,
    IDX_COMPLETE, IDX_GENERATION, IDX_PRUNE, IDX_SEQ, IDX_START,
};

/// How to find a single operation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRef {
    Id(String),
    /// The `number`th record of an application.
    Sequence {
        application: ApplicationRef,
        number: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrder {
    #[default]
    StartTime,
    CompleteTime,
}

/// Options for `operation_list`. Results are always newest first.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub order: ListOrder,
    pub workspace: Option<String>,
    /// Keep only records in one of these states; empty keeps all.
    pub status: Vec<StatusState>,
    pub physical_state: Option<PhysicalState>,
    pub limit: Option<usize>,
}

impl ListOptions {
    fn matches<R>(&self, row: &OperationIndex<R>) -> bool {
        if let Some(ws) = &self.workspace {
            if ws.to_lowercase() != row.workspace {
                return false;
            }
        }
        if !self.status.is_empty() && !self.status.contains(&row.state) {
            return false;
        }
        if let Some(ps) = self.physical_state {
            if row.physical_state != Some(ps) {
                return false;
            }
        }
        true
    }
}

impl State {
    /// Insert (`update = false`) or update (`update = true`) an operation record.
    ///
    /// Inserts get a fresh id when none is set, the next sequence number of their
    /// application, and, for generation-carrying types, a new or inherited generation.
    /// Updates keep the stored sequence and generation and may not change them.
    pub async fn operation_put<R: OperationRecord>(
        &self,
        update: bool,
        value: R,
    ) -> Result<R, StateError> {
        let mut value = value;
        let mut txn = self.txn().await;
        if update {
            prepare_update(&txn, &mut value).await?;
        } else {
            prepare_insert(&txn, &mut value).await?;
        }

        txn.put(R::BUCKET, value.id(), &value)?;
        insert_operation_index(&mut txn.mem, &value);
        txn.touch_workspace(
            value.workspace(),
            value.application(),
            value.status().last_active_ms(),
        )
        .await?;
        txn.commit().await?;

        debug!(
            table = R::TABLE,
            id = value.id(),
            sequence = value.sequence(),
            update,
            "operation record stored"
        );
        Ok(value)
    }

    pub async fn operation_get<R: OperationRecord>(
        &self,
        r: &OperationRef,
    ) -> Result<R, StateError> {
        let id = match r {
            OperationRef::Id(id) => id.clone(),
            OperationRef::Sequence {
                application,
                number,
            } => self
                .mem
                .view(|snap| {
                    snap.first::<OperationIndex<R>>(IDX_SEQ, &key![application.key(), *number])
                        .map(|row| row.id.clone())
                })
                .ok_or_else(|| {
                    StateError::NotFound(format!(
                        "{} #{} of {}",
                        R::TABLE,
                        number,
                        application.key()
                    ))
                })?,
        };
        self.get_durable::<R>(R::BUCKET, &id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("{} {}", R::TABLE, id)))
    }

    /// Records of an application, newest first by start or completion time. With a
    /// watch set, the caller can wait for the next change to this record type.
    pub async fn operation_list<R: OperationRecord>(
        &self,
        application: &ApplicationRef,
        opts: &ListOptions,
        ws: Option<&mut WatchSet>,
    ) -> Result<Vec<R>, StateError> {
        let index = match opts.order {
            ListOrder::StartTime => IDX_START,
            ListOrder::CompleteTime => IDX_COMPLETE,
        };
        let ids: Vec<String> = self.mem.view(|snap| {
            if let Some(ws) = ws {
                snap.watch::<OperationIndex<R>>(ws);
            }
            snap.prefix_rev::<OperationIndex<R>>(index, &key![application.key()])
                .filter(|row| opts.matches(row))
                .take(opts.limit.unwrap_or(usize::MAX))
                .map(|row| row.id.clone())
                .collect()
        });
        self.load_operations(ids).await
    }

    /// The most recently completed successful record.
    pub async fn operation_latest<R: OperationRecord>(
        &self,
        application: &ApplicationRef,
        workspace: Option<&str>,
    ) -> Result<R, StateError> {
        self.operation_latest_filter(application, workspace, |_: &R| true)
            .await
    }

    /// The most recently completed successful record accepted by `filter`.
    pub async fn operation_latest_filter<R, F>(
        &self,
        application: &ApplicationRef,
        workspace: Option<&str>,
        filter: F,
    ) -> Result<R, StateError>
    where
        R: OperationRecord,
        F: Fn(&R) -> bool,
    {
        let opts = ListOptions {
            order: ListOrder::CompleteTime,
            workspace: workspace.map(str::to_string),
            status: vec![StatusState::Success],
            ..Default::default()
        };
        let ids: Vec<String> = self.mem.view(|snap| {
            snap.prefix_rev::<OperationIndex<R>>(IDX_COMPLETE, &key![application.key()])
                .filter(|row| opts.matches(row))
                .map(|row| row.id.clone())
                .collect()
        });
        for id in ids {
            if let Some(record) = self.get_durable::<R>(R::BUCKET, &id).await? {
                if filter(&record) {
                    return Ok(record);
                }
            }
        }
        Err(StateError::NotFound(format!(
            "no successful {} for {}",
            R::TABLE,
            application.key()
        )))
    }

    pub async fn operation_delete<R: OperationRecord>(&self, id: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        if txn.get::<R>(R::BUCKET, id).await?.is_none() {
            return Err(StateError::NotFound(format!("{} {}", R::TABLE, id)));
        }
        txn.delete(R::BUCKET, id);
        txn.mem.delete::<OperationIndex<R>>(id);
        txn.commit().await?;
        info!(table = R::TABLE, id, "operation record deleted");
        Ok(())
    }

    /// Drop the oldest finished records of type `R` from the memory index beyond `max`.
    /// Durable copies are kept. Returns how many index rows were dropped.
    pub async fn operation_prune<R: OperationRecord>(&self, max: usize) -> Result<usize, StateError> {
        let mut txn = self.txn().await;
        let total = txn.mem.len::<OperationIndex<R>>();
        if total <= max {
            return Ok(0);
        }
        let victims: Vec<String> = txn
            .mem
            .prefix::<OperationIndex<R>>(IDX_PRUNE, &key![true])
            .into_iter()
            .take(total - max)
            .map(|row| row.id)
            .collect();
        for id in &victims {
            txn.mem.delete::<OperationIndex<R>>(id);
        }
        txn.commit().await?;

        let pruned = victims.len();
        if pruned > 0 {
            if let Some(m) = &self.metrics {
                m.record_pruned(R::TABLE, pruned as u64);
            }
            info!(table = R::TABLE, pruned, max, "pruned operation index");
        }
        Ok(pruned)
    }

    async fn load_operations<R: OperationRecord>(&self, ids: Vec<String>) -> Result<Vec<R>, StateError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_durable::<R>(R::BUCKET, &id).await? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

async fn prepare_insert<R: OperationRecord>(
    txn: &StateTxn<'_>,
    value: &mut R,
) -> Result<(), StateError> {
    if value.id().is_empty() {
        value.set_id(uuid::Uuid::new_v4().to_string());
    }
    if txn.get::<R>(R::BUCKET, value.id()).await?.is_some() {
        return Err(StateError::FailedPrecondition(format!(
            "{} {} already exists",
            R::TABLE,
            value.id()
        )));
    }

    let counter_key = SequenceCounter::key_for(R::TABLE, value.application());
    let sequence = txn
        .mem
        .get::<SequenceCounter>(&counter_key)
        .map_or(0, |c| c.value)
        + 1;
    value.set_sequence(sequence);

    if R::HAS_GENERATION {
        let generation = match value.generation() {
            None => Generation {
                id: uuid::Uuid::new_v4().to_string(),
                initial_sequence: sequence,
            },
            Some(given) => {
                let id = given.id.clone();
                let first = txn
                    .mem
                    .first::<OperationIndex<R>>(IDX_GENERATION, &key![id.as_str()]);
                let initial_sequence = match first {
                    Some(row) => match txn.get::<R>(R::BUCKET, &row.id).await? {
                        Some(earliest) => earliest
                            .generation()
                            .map_or(earliest.sequence(), |g| g.initial_sequence),
                        None => row.sequence,
                    },
                    None => sequence,
                };
                Generation {
                    id,
                    initial_sequence,
                }
            }
        };
        value.set_generation(Some(generation));
    }
    Ok(())
}

async fn prepare_update<R: OperationRecord>(
    txn: &StateTxn<'_>,
    value: &mut R,
) -> Result<(), StateError> {
    let existing = txn
        .get::<R>(R::BUCKET, value.id())
        .await?
        .ok_or_else(|| StateError::NotFound(format!("{} {}", R::TABLE, value.id())))?;

    if value.sequence() != 0 && value.sequence() != existing.sequence() {
        return Err(StateError::FailedPrecondition(format!(
            "{} {}: sequence can't be changed",
            R::TABLE,
            value.id()
        )));
    }
    if value.generation().is_some() && value.generation() != existing.generation() {
        return Err(StateError::FailedPrecondition(format!(
            "{} {}: generation can't be changed",
            R::TABLE,
            value.id()
        )));
    }
    if value.application().key() != existing.application().key() {
        return Err(StateError::FailedPrecondition(format!(
            "{} {}: application can't be changed",
            R::TABLE,
            value.id()
        )));
    }
    value.set_sequence(existing.sequence());
    value.set_generation(existing.generation().cloned());
    Ok(())
}
