//! Per-stage scheduled queues.
//!
//! Each pipeline stage owns one queue. Dispatch is priority-ordered
//! (ascending, then enqueue order), gated on the item's readiness token and
//! on the queue's credit budget when one is configured.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::task::TensorTask;
use crate::types::{Key, QueueKind};

pub struct ScheduledQueue {
    kind: QueueKind,
    inner: Mutex<Inner>,
}

struct Inner {
    tasks: Vec<(u64, Arc<TensorTask>)>,
    next_seq: u64,
    /// Remaining credit in bytes; `None` disables throttling.
    credits: Option<usize>,
    credit_limit: Option<usize>,
    finished_bytes: u64,
}

impl ScheduledQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self::with_credits(kind, None)
    }

    /// A queue that stops dispatching once `credit_bytes` of work is in
    /// flight; `report_finish` returns credit.
    pub fn with_credits(kind: QueueKind, credit_bytes: Option<usize>) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                tasks: Vec::new(),
                next_seq: 0,
                credits: credit_bytes,
                credit_limit: credit_bytes,
                finished_bytes: 0,
            }),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn add_task(&self, task: Arc<TensorTask>) {
        let mut inner = self.inner.lock().expect("queue lock");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        trace!(queue = %self.kind, name = %task.name, key = task.key, "queued");
        inner.tasks.push((seq, task));
    }

    /// Non-blocking: the lowest-(priority, enqueue order) item that is ready
    /// and affordable, or `None`.
    pub fn get_task(&self) -> Option<Arc<TensorTask>> {
        let mut inner = self.inner.lock().expect("queue lock");
        let idx = inner
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, (_, t))| t.is_ready() && inner.affordable(t.len))
            .min_by_key(|(_, (seq, t))| (t.priority, *seq))
            .map(|(i, _)| i)?;
        let (_, task) = inner.tasks.remove(idx);
        inner.charge(task.len);
        Some(task)
    }

    /// Non-blocking keyed dequeue, used by stages that follow a signal
    /// naming a specific partition. Takes the oldest ready item with that
    /// key.
    pub fn get_task_by_key(&self, key: Key) -> Option<Arc<TensorTask>> {
        let mut inner = self.inner.lock().expect("queue lock");
        let idx = inner
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, (_, t))| t.key == key && t.is_ready())
            .min_by_key(|(_, (seq, _))| *seq)
            .map(|(i, _)| i)?;
        let (_, task) = inner.tasks.remove(idx);
        inner.charge(task.len);
        Some(task)
    }

    /// Return credit for a completed item and account the bytes moved.
    pub fn report_finish(&self, bytes: usize) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let (Some(credits), Some(limit)) = (inner.credits, inner.credit_limit) {
            inner.credits = Some((credits + bytes).min(limit));
        }
        inner.finished_bytes += bytes as u64;
        trace!(
            queue = %self.kind,
            bytes,
            total = inner.finished_bytes,
            "finished"
        );
    }

    /// Number of items currently parked on this queue.
    pub fn pending(&self) -> usize {
        self.inner.lock().expect("queue lock").tasks.len()
    }

    /// Total bytes reported finished over the queue's lifetime.
    pub fn finished_bytes(&self) -> u64 {
        self.inner.lock().expect("queue lock").finished_bytes
    }
}

impl Inner {
    fn affordable(&self, len: usize) -> bool {
        self.credits.is_none_or(|c| c >= len)
    }

    fn charge(&mut self, len: usize) {
        if let Some(c) = self.credits {
            self.credits = Some(c.saturating_sub(len));
        }
    }
}
