//! Work items: the per-partition descriptors that travel through the
//! pipeline, and the per-tensor context they are carved from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};
use crate::tensor::{ReadyEvent, Tensor};
use crate::types::{DeviceId, Key, QueueKind};

/// One-shot completion sink for an enqueued tensor.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Holds the user callback shared by every partition of one enqueue and
/// guarantees it fires at most once.
pub struct CallbackCell {
    inner: Mutex<Option<StatusCallback>>,
}

impl CallbackCell {
    pub fn new(cb: StatusCallback) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(cb)),
        })
    }

    /// Invoke the callback if it has not fired yet.
    pub fn fire(&self, status: Result<()>) {
        let cb = self.inner.lock().expect("callback lock").take();
        if let Some(cb) = cb {
            cb(status);
        }
    }
}

/// A partition's traversal descriptor. Immutable after enqueue, except for
/// the stage cursor advanced by the pipeline.
pub struct TensorTask {
    pub name: String,
    pub key: Key,
    pub device: DeviceId,
    pub priority: i32,
    pub version: u64,

    /// Input buffer. `None` only for operations that write without reading.
    pub tensor: Option<Arc<dyn Tensor>>,
    /// Output buffer; may be the same handle as `tensor`.
    pub output: Option<Arc<dyn Tensor>>,

    /// Byte window into tensor/output/cpubuff covered by this partition.
    pub offset: usize,
    pub len: usize,

    /// Base pointer of the context's pinned host staging buffer (0 = none).
    pub cpubuff: u64,

    pub ready_event: Option<Arc<dyn ReadyEvent>>,

    pub(crate) stages: Arc<[QueueKind]>,
    pub(crate) cursor: AtomicUsize,

    /// Shared completion counter; the callback fires when it reaches
    /// `total_parts`.
    pub counter: Arc<AtomicUsize>,
    pub total_parts: usize,
    pub callback: Arc<CallbackCell>,
}

impl TensorTask {
    /// The stage this partition is currently queued on, if any remain.
    pub fn current_stage(&self) -> Option<QueueKind> {
        self.stages.get(self.cursor.load(Ordering::Acquire)).copied()
    }

    /// Advance past the current stage, returning it. The next stage (if any)
    /// becomes current.
    pub(crate) fn pop_stage(&self) -> Result<QueueKind> {
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel);
        self.stages
            .get(idx)
            .copied()
            .ok_or_else(|| EngineError::Collective(format!("{}: stage list exhausted", self.name)))
    }

    /// Number of stages not yet completed (including the current one).
    pub fn remaining_stages(&self) -> usize {
        self.stages
            .len()
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    /// True once the attached readiness token (if any) has fired.
    pub fn is_ready(&self) -> bool {
        self.ready_event.as_ref().is_none_or(|ev| ev.ready())
    }

    /// Byte stride of one element, derived from whichever buffer is present.
    pub fn unit_len(&self) -> usize {
        let t = self
            .tensor
            .as_deref()
            .or(self.output.as_deref())
            .expect("task carries no buffer");
        t.size() / t.num_elements()
    }

    /// Number of elements in this partition's window.
    pub fn element_count(&self) -> usize {
        self.len / self.unit_len()
    }
}

/// Split a whole-tensor work item into bound-length partitions sharing its
/// counter and callback. Keys are assigned by the caller afterwards.
pub(crate) fn partition_task(whole: &TensorTask, bound: usize) -> Vec<TensorTask> {
    let size = whole
        .tensor
        .as_deref()
        .or(whole.output.as_deref())
        .map(Tensor::size)
        .unwrap_or(0);

    let mut parts = Vec::with_capacity(size.div_ceil(bound.max(1)));
    let mut accumulated = 0;
    let mut i = 0;
    while accumulated < size {
        let len = (size - accumulated).min(bound);
        parts.push(TensorTask {
            name: format!("{}_{}", whole.name, i),
            key: whole.key,
            device: whole.device,
            priority: whole.priority,
            version: whole.version,
            tensor: whole.tensor.clone(),
            output: whole.output.clone(),
            offset: accumulated,
            len,
            cpubuff: whole.cpubuff,
            ready_event: whole.ready_event.clone(),
            stages: Arc::clone(&whole.stages),
            cursor: AtomicUsize::new(0),
            counter: Arc::clone(&whole.counter),
            total_parts: whole.total_parts,
            callback: Arc::clone(&whole.callback),
        });
        accumulated += len;
        i += 1;
    }
    parts
}

/// Per-tensor persistent metadata, created on first declaration and kept for
/// the engine's lifetime.
pub struct TensorContext {
    pub name: String,
    /// Full tensor size in bytes.
    pub buff_len: usize,
    /// Partition keys, in window order. `len == ceil(buff_len / bound)`.
    pub key_list: Vec<Key>,
    state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    cpubuff: u64,
    reuse_buff: bool,
    initialized: bool,
}

impl TensorContext {
    pub(crate) fn new(name: String, buff_len: usize, key_list: Vec<Key>) -> Arc<Self> {
        Arc::new(Self {
            name,
            buff_len,
            key_list,
            state: Mutex::new(ContextState::default()),
        })
    }

    pub fn initialized(&self) -> bool {
        self.state.lock().expect("context lock").initialized
    }

    /// Base pointer of the pinned host staging buffer (0 before init, and on
    /// non-root ranks, which never stage through host memory).
    pub fn cpubuff(&self) -> u64 {
        self.state.lock().expect("context lock").cpubuff
    }

    /// True if the host buffer was supplied by the caller rather than
    /// allocated by the engine.
    pub fn reuses_buffer(&self) -> bool {
        self.state.lock().expect("context lock").reuse_buff
    }

    pub(crate) fn mark_initialized(&self, cpubuff: u64, reuse_buff: bool) {
        let mut s = self.state.lock().expect("context lock");
        s.cpubuff = cpubuff;
        s.reuse_buff = reuse_buff;
        s.initialized = true;
    }
}
