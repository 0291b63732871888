//! Per-job deadlines kept in one min-heap and drained by a single reaper task.
//!
//! Re-arming a deadline does not search the heap: it issues a new token and the old
//! entry is skipped when it surfaces. The heap is rebuilt from the live set once stale
//! entries dominate it.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadlineKind {
    /// Assigned job not acked in time; nack it back to the queue.
    AckTimeout,
    /// Running job missed its heartbeat; force it to error.
    Heartbeat,
    /// Queued or waiting job passed its expiry; cancel it.
    Expire,
}

impl DeadlineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineKind::AckTimeout => "ack_timeout",
            DeadlineKind::Heartbeat => "heartbeat",
            DeadlineKind::Expire => "expire",
        }
    }
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    at: Instant,
    token: u64,
    job_id: String,
    kind: DeadlineKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.token).cmp(&(other.at, other.token))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    armed: HashMap<(String, DeadlineKind), (u64, Instant)>,
    next_token: u64,
}

impl Inner {
    fn is_live(&self, e: &Entry) -> bool {
        self.armed
            .get(&(e.job_id.clone(), e.kind))
            .is_some_and(|(token, _)| *token == e.token)
    }

    fn drop_stale_top(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.armed.len() + 64 {
            return;
        }
        self.heap = self
            .armed
            .iter()
            .map(|((job_id, kind), (token, at))| {
                Reverse(Entry {
                    at: *at,
                    token: *token,
                    job_id: job_id.clone(),
                    kind: *kind,
                })
            })
            .collect();
    }
}

#[derive(Default)]
pub struct DeadlineQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm (or re-arm) the `kind` deadline of a job.
    pub fn arm(&self, job_id: &str, kind: DeadlineKind, at: Instant) {
        {
            let mut inner = self.lock();
            let token = inner.next_token;
            inner.next_token += 1;
            inner
                .armed
                .insert((job_id.to_string(), kind), (token, at));
            inner.heap.push(Reverse(Entry {
                at,
                token,
                job_id: job_id.to_string(),
                kind,
            }));
            inner.compact();
        }
        self.notify.notify_one();
    }

    pub fn disarm(&self, job_id: &str, kind: DeadlineKind) {
        self.lock().armed.remove(&(job_id.to_string(), kind));
    }

    pub fn disarm_all(&self, job_id: &str) {
        let mut inner = self.lock();
        for kind in [
            DeadlineKind::AckTimeout,
            DeadlineKind::Heartbeat,
            DeadlineKind::Expire,
        ] {
            inner.armed.remove(&(job_id.to_string(), kind));
        }
    }

    /// When the `kind` deadline of a job fires, if armed.
    pub fn armed_at(&self, job_id: &str, kind: DeadlineKind) -> Option<Instant> {
        self.lock()
            .armed
            .get(&(job_id.to_string(), kind))
            .map(|(_, at)| *at)
    }

    pub fn len(&self) -> usize {
        self.lock().armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest live deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.lock();
        inner.drop_stale_top();
        inner.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Remove and return every live deadline at or before `now`, earliest first.
    pub fn pop_due(&self, now: Instant) -> Vec<(String, DeadlineKind)> {
        let mut inner = self.lock();
        let mut due = Vec::new();
        loop {
            inner.drop_stale_top();
            let Some(Reverse(top)) = inner.heap.peek() else {
                break;
            };
            if top.at > now {
                break;
            }
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            inner.armed.remove(&(entry.job_id.clone(), entry.kind));
            due.push((entry.job_id, entry.kind));
        }
        due
    }

    /// Resolves after the next `arm` call (or immediately if one happened since the
    /// last wake-up).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
