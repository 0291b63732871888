use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::codec::Versioned;
use crate::key;
use crate::memdb::{IndexKey, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RunnerKind {
    /// Runs inside a CLI invocation; forgotten as soon as it disconnects.
    Local,
    /// Long-lived runner registered with the server.
    Remote,
    /// Launched for a single task.
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum AdoptionState {
    Pending,
    Adopted,
    /// Adopted out of band with a pre-issued token.
    Preadopted,
    Rejected,
}

/// A worker process identity. Upserted on every check-in.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Runner {
    pub id: String,
    pub kind: RunnerKind,
    pub labels: BTreeMap<String, String>,
    pub by_id_only: bool,
    pub adoption_state: AdoptionState,
    pub online: bool,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

impl Versioned for Runner {
    const VERSION: u8 = 1;
}

impl Runner {
    pub fn new(id: impl Into<String>, kind: RunnerKind) -> Self {
        Self {
            id: id.into(),
            kind,
            labels: BTreeMap::new(),
            by_id_only: false,
            adoption_state: AdoptionState::Pending,
            online: true,
            first_seen_ms: 0,
            last_seen_ms: 0,
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    /// May take jobs: online and not rejected.
    pub fn is_eligible(&self) -> bool {
        self.online && self.adoption_state != AdoptionState::Rejected
    }
}

impl Record for Runner {
    const TABLE: &'static str = "runners";

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
        vec![("online", key![self.online])]
    }
}
