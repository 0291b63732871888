//! Hook for state machines layered on top of jobs (tasks, pipeline runs).
//!
//! Observers run after a transaction commits, once per job whose persisted state
//! changed in it, in registration order. The scheduler itself knows nothing about
//! what they do.

use async_trait::async_trait;

use crate::job::Job;
use crate::state::{State, StateError};

#[async_trait]
pub trait JobObserver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called with the job as committed. Errors are logged and do not undo the
    /// transition.
    async fn job_transitioned(&self, state: &State, job: &Job) -> Result<(), StateError>;
}
