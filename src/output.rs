//! Bounded terminal output kept in memory for running jobs.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Monotonic position of the line within the job's output.
    pub index: u64,
    pub timestamp_ms: i64,
    pub line: String,
}

struct Lines {
    lines: VecDeque<OutputLine>,
    next_index: u64,
    closed: bool,
}

/// Ring buffer of output lines; once `capacity` is reached the oldest lines are dropped.
pub struct OutputBuffer {
    capacity: usize,
    inner: Mutex<Lines>,
    notify: Notify,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Lines {
                lines: VecDeque::new(),
                next_index: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn append(&self, timestamp_ms: i64, line: impl Into<String>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return;
            }
            let index = inner.next_index;
            inner.next_index += 1;
            inner.lines.push_back(OutputLine {
                index,
                timestamp_ms,
                line: line.into(),
            });
            while inner.lines.len() > self.capacity {
                inner.lines.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    /// Lines with index >= `from` that are still buffered.
    pub fn read_from(&self, from: u64) -> Vec<OutputLine> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .lines
            .iter()
            .filter(|l| l.index >= from)
            .cloned()
            .collect()
    }

    /// Stop accepting lines; readers waiting in `wait_for_more` are released.
    pub fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Wait until a line with index >= `from` exists or the buffer is closed.
    pub async fn wait_for_more(&self, from: u64) {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if inner.closed || inner.next_index > from {
                    return;
                }
            }
            notified.await;
        }
    }
}
