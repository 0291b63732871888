//! The state store: slatedb is the source of truth, the memdb index serves queries
//! and blocking watches.
//!
//! Every mutation runs in a [`StateTxn`]: one durable `WriteBatch` plus one memdb
//! overlay, committed in that order. The memory side is applied only after the
//! durable write succeeded, and is rebuilt from slatedb on every open, so a crash
//! between the two commits loses nothing.
//!
//! The submodules split the operations by concern:
//!
//! - `job_*`: the job scheduler (create, assign, ack, complete, cancel, cascade, prune,
//!   timeouts)
//! - `app_operation`: generic storage for [`OperationRecord`](crate::operation::OperationRecord)s
//! - `runner`, `workspace`, `config`, `task`, `pipeline`: record CRUD
//! - `registry`, `rebuild`: startup index rebuild

mod app_operation;
mod config;
mod helpers;
mod job_ack;
mod job_assign;
mod job_blocked;
mod job_cancel;
mod job_cascade;
mod job_complete;
mod job_create;
mod job_prune;
mod job_query;
mod job_timeout;
mod pipeline;
mod rebuild;
pub mod registry;
mod runner;
mod task;
mod txn;
mod workspace;

pub use app_operation::{ListOptions, ListOrder, OperationRef};
pub use config::{ConfigScope, ConfigVar, ServerConfig};
pub use helpers::now_epoch_ms;
pub use job_query::JobFilter;
pub use registry::Registry;
pub use txn::StateTxn;
pub use workspace::{Workspace, WorkspaceApplication, WorkspaceProject};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};

use slatedb::Db;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::CodecError;
use crate::deadline::DeadlineQueue;
use crate::job::{Job, JobState};
use crate::memdb::MemDb;
use crate::metrics::Metrics;
use crate::observer::JobObserver;
use crate::output::OutputBuffer;
use crate::pipeline::PipelineRunObserver;
use crate::settings::{AppConfig, SchedulerConfig};
use crate::storage::{DbLocation, StorageError};
use crate::task::TaskObserver;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("canceled: {0}")]
    Canceled(String),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Status codes the RPC layer maps errors onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    Aborted,
    Internal,
    PermissionDenied,
    Canceled,
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::NotFound(_) => ErrorCode::NotFound,
            StateError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            StateError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            StateError::Internal(_) | StateError::Codec(_) => ErrorCode::Internal,
            StateError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            StateError::Canceled(_) => ErrorCode::Canceled,
            StateError::Slate(_) | StateError::Storage(_) => ErrorCode::Aborted,
        }
    }
}

/// Observers registered by `State::open`.
pub fn default_observers() -> Vec<Arc<dyn JobObserver>> {
    vec![Arc::new(TaskObserver), Arc::new(PipelineRunObserver)]
}

/// A job and the state it had before the transaction, if it existed.
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    pub(crate) job: Job,
    pub(crate) prev: Option<JobState>,
}

/// Owns the slatedb instance and the memory index built from it.
pub struct State {
    pub(crate) db: Arc<Db>,
    pub(crate) mem: MemDb,
    /// Serializes writers; held for the whole life of a `StateTxn`.
    writer: tokio::sync::Mutex<()>,
    registry: Registry,
    pub(crate) cfg: SchedulerConfig,
    pub(crate) deadlines: Arc<DeadlineQueue>,
    observers: Vec<Arc<dyn JobObserver>>,
    pub(crate) metrics: Option<Metrics>,
    pub(crate) outputs: Mutex<HashMap<String, Arc<OutputBuffer>>>,
    pub(crate) queue_seq: AtomicU64,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl State {
    /// Open with the standard registry and observers and no metrics.
    pub async fn open(cfg: &AppConfig) -> Result<Arc<Self>, StateError> {
        Self::open_with(cfg, Registry::standard(), default_observers(), None).await
    }

    pub async fn open_with(
        cfg: &AppConfig,
        registry: Registry,
        observers: Vec<Arc<dyn JobObserver>>,
        metrics: Option<Metrics>,
    ) -> Result<Arc<Self>, StateError> {
        let location = DbLocation::resolve(&cfg.database)?;
        let mut db_builder = slatedb::DbBuilder::new(location.path.as_str(), location.store);
        if let Some(flush_ms) = cfg.database.flush_interval_ms {
            let settings = slatedb::config::Settings {
                flush_interval: Some(std::time::Duration::from_millis(flush_ms)),
                ..Default::default()
            };
            db_builder = db_builder.with_settings(settings);
        }
        let db = Arc::new(db_builder.build().await?);

        let state = Arc::new(Self {
            db,
            mem: MemDb::new(),
            writer: tokio::sync::Mutex::new(()),
            registry,
            cfg: cfg.scheduler.clone(),
            deadlines: Arc::new(DeadlineQueue::new()),
            observers,
            metrics,
            outputs: Mutex::new(HashMap::new()),
            queue_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        });

        state.rebuild().await?;
        let handle = job_timeout::spawn_reaper(&state);
        *state.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(path = %location.path, "state store opened");
        Ok(state)
    }

    /// Stop the reaper and close slatedb. In-flight waits on watch sets are not
    /// interrupted; cancel them with their own tokens.
    pub async fn close(&self) -> Result<(), StateError> {
        self.shutdown.cancel();
        let handle = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "deadline reaper task failed");
            }
        }
        self.db.close().await?;
        info!("state store closed");
        Ok(())
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn mem(&self) -> &MemDb {
        &self.mem
    }

    pub fn deadlines(&self) -> &DeadlineQueue {
        &self.deadlines
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    pub async fn txn(&self) -> StateTxn<'_> {
        let guard = self.writer.lock().await;
        StateTxn::new(self, guard)
    }

    /// Post-commit effects: metrics and observers. Runs without the writer lock.
    pub(crate) async fn after_commit(&self, transitions: Vec<Transition>, cascaded: u64) {
        if let Some(m) = &self.metrics {
            for t in &transitions {
                match t.job.state {
                    JobState::Queued if t.prev.is_none() => {
                        m.record_queued(t.job.operation.kind.as_str())
                    }
                    JobState::Success | JobState::Error => {
                        m.record_completion(t.job.state.as_str())
                    }
                    _ => {}
                }
            }
            if cascaded > 0 {
                m.record_cascaded(cascaded);
            }
            for (table, size) in self.mem.sizes() {
                m.set_index_size(table, size as u64);
            }
        }

        for t in &transitions {
            for observer in &self.observers {
                if let Err(e) = observer.job_transitioned(self, &t.job).await {
                    warn!(
                        observer = observer.name(),
                        job_id = %t.job.id,
                        state = %t.job.state,
                        error = %e,
                        "job observer failed"
                    );
                }
            }
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
