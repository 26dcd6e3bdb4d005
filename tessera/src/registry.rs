//! Process-wide engine state: queues, streams, external-interface handles,
//! the tensor-context table, and the root's coordination bookkeeping.
//!
//! Written at init and shutdown, read concurrently by the stage loops in
//! between. Everything mutable in steady state sits behind its own lock or
//! is lock-free.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use indexmap::IndexMap;
use tracing::trace;

use crate::collective::CollectiveComm;
use crate::config::EngineConfig;
use crate::device::{AcceleratorRuntime, EventHandle, StreamHandle};
use crate::error::{EngineError, Result};
use crate::ps::{PsClient, PsKv};
use crate::queue::ScheduledQueue;
use crate::signal::{SignalBus, SignalKind};
use crate::task::{TensorContext, TensorTask};
use crate::transform::GradientTransform;
use crate::types::{DeviceId, Key, QueueKind};

/// A batch of partitions whose collective calls were issued under one
/// group-start/group-end pair, paired with the event recorded after group
/// end. Consumed by the sync stage.
pub struct GroupEntry {
    pub tasks: Vec<Arc<TensorTask>>,
    /// Originating queue of each task, for credit accounting. Left empty by
    /// follower ranks, which do not account collective credit.
    pub queues: Vec<QueueKind>,
    pub event: EventHandle,
}

pub(crate) struct Streams {
    pub d2h: StreamHandle,
    pub h2d: StreamHandle,
    pub collective: StreamHandle,
}

/// Root-side readiness bookkeeping: which keys every follower has announced
/// and in what order they became dispatchable. Announcements are counted per
/// follower so back-to-back rounds of one key from a fast follower cannot
/// satisfy the gate on behalf of a slow one.
#[derive(Default)]
struct CoordState {
    announced: HashMap<(QueueKind, Key), HashMap<u32, u32>>,
    dispatchable_reduce: VecDeque<Key>,
    dispatchable_bcast: VecDeque<Key>,
}

impl CoordState {
    fn lane(&mut self, op: QueueKind) -> &mut VecDeque<Key> {
        match op {
            QueueKind::Reduce => &mut self.dispatchable_reduce,
            _ => &mut self.dispatchable_bcast,
        }
    }
}

pub struct Registry {
    pub(crate) config: EngineConfig,
    queues: Vec<Arc<ScheduledQueue>>,
    pub(crate) bus: Arc<dyn SignalBus>,
    pub(crate) runtime: Arc<dyn AcceleratorRuntime>,
    pub(crate) collective: Arc<dyn CollectiveComm>,
    ps: Option<Arc<dyn PsClient>>,
    pub(crate) transform: Arc<dyn GradientTransform>,
    pub(crate) streams: Streams,
    group_entries: SegQueue<GroupEntry>,
    shutdown: AtomicBool,
    contexts: Mutex<IndexMap<String, Arc<TensorContext>>>,
    next_key: AtomicU64,
    pskv_cache: Mutex<HashMap<Key, PsKv>>,
    coord: Mutex<CoordState>,
}

impl Registry {
    pub(crate) fn new(
        config: EngineConfig,
        bus: Arc<dyn SignalBus>,
        runtime: Arc<dyn AcceleratorRuntime>,
        collective: Arc<dyn CollectiveComm>,
        ps: Option<Arc<dyn PsClient>>,
        transform: Arc<dyn GradientTransform>,
    ) -> Result<Arc<Self>> {
        let device = config.local_rank as DeviceId;
        let streams = Streams {
            d2h: runtime.create_stream(device)?,
            h2d: runtime.create_stream(device)?,
            collective: runtime.create_stream(device)?,
        };

        let queues: Vec<Arc<ScheduledQueue>> = [
            QueueKind::CoordinateReduce,
            QueueKind::Reduce,
            QueueKind::CoordinateBroadcast,
            QueueKind::Broadcast,
            QueueKind::CopyD2H,
            QueueKind::Push,
            QueueKind::Pull,
            QueueKind::CopyH2D,
        ]
        .into_iter()
        .map(|kind| {
            let credits = match kind {
                QueueKind::Push => config.push_credit_bytes,
                _ => None,
            };
            Arc::new(ScheduledQueue::with_credits(kind, credits))
        })
        .collect();

        Ok(Arc::new(Self {
            config,
            queues,
            bus,
            runtime,
            collective,
            ps,
            transform,
            streams,
            group_entries: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            contexts: Mutex::new(IndexMap::new()),
            next_key: AtomicU64::new(0),
            pskv_cache: Mutex::new(HashMap::new()),
            coord: Mutex::new(CoordState::default()),
        }))
    }

    pub(crate) fn queue(&self, kind: QueueKind) -> &Arc<ScheduledQueue> {
        &self.queues[kind as usize]
    }

    pub(crate) fn all_queues(&self) -> &[Arc<ScheduledQueue>] {
        &self.queues
    }

    pub(crate) fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn ps(&self) -> Result<&Arc<dyn PsClient>> {
        self.ps.as_ref().ok_or(EngineError::NotInitialized)
    }

    pub(crate) fn enqueue_group(&self, entry: GroupEntry) {
        self.group_entries.push(entry);
    }

    pub(crate) fn dequeue_group(&self) -> Option<GroupEntry> {
        self.group_entries.pop()
    }

    /// Root only: absorb queued readiness announcements from followers.
    pub(crate) fn drain_signals(&self) -> Result<()> {
        while let Some(msg) = self.bus.try_recv(self.config.local_rank)? {
            let op = match msg.kind {
                SignalKind::ReduceReady => QueueKind::Reduce,
                SignalKind::BcastReady => QueueKind::Broadcast,
                other => {
                    return Err(EngineError::Signal(format!(
                        "root received unexpected {other:?} from rank {}",
                        msg.src
                    )));
                }
            };
            let mut coord = self.coord.lock().expect("coord lock");
            // Dispatchable once every follower has an outstanding
            // announcement; consume one from each.
            let dispatchable = {
                let by_rank = coord.announced.entry((op, msg.key)).or_default();
                *by_rank.entry(msg.src).or_insert(0) += 1;
                trace!(
                    key = msg.key,
                    op = %op,
                    src = msg.src,
                    ranks = by_rank.len(),
                    "ready announced"
                );
                if by_rank.len() as u32 == self.config.local_size - 1 {
                    by_rank.retain(|_, count| {
                        *count -= 1;
                        *count > 0
                    });
                    Some(by_rank.is_empty())
                } else {
                    None
                }
            };
            if let Some(drained) = dispatchable {
                if drained {
                    coord.announced.remove(&(op, msg.key));
                }
                coord.lane(op).push_back(msg.key);
            }
        }
        Ok(())
    }

    /// Root only: the oldest fully-announced key whose own partition is
    /// already parked on the stage queue. Keys whose local copy has not
    /// arrived yet stay dispatchable for a later iteration.
    pub(crate) fn pop_ready_task(&self, op: QueueKind) -> Option<Arc<TensorTask>> {
        let mut coord = self.coord.lock().expect("coord lock");
        let lane = coord.lane(op);
        for idx in 0..lane.len() {
            let key = lane[idx];
            if let Some(task) = self.queue(op).get_task_by_key(key) {
                lane.remove(idx);
                return Some(task);
            }
        }
        None
    }

    /// Get or create the per-tensor context, allocating one key per
    /// partition window. Contexts must be declared in the same order on
    /// every rank — key assignment is positional.
    pub(crate) fn context(&self, name: &str, size: usize) -> Result<Arc<TensorContext>> {
        let mut contexts = self.contexts.lock().expect("context table lock");
        if let Some(existing) = contexts.get(name) {
            if existing.buff_len != size {
                return Err(EngineError::Config(format!(
                    "tensor {name} re-declared with size {size}, was {}",
                    existing.buff_len
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let parts = size.div_ceil(self.config.partition_bytes).max(1) as u64;
        let base = self.next_key.fetch_add(parts, Ordering::Relaxed);
        let key_list: Vec<Key> = (base..base + parts).collect();
        let ctx = TensorContext::new(name.to_string(), size, key_list);
        contexts.insert(name.to_string(), Arc::clone(&ctx));
        Ok(ctx)
    }

    pub(crate) fn lookup_context(&self, name: &str) -> Option<Arc<TensorContext>> {
        self.contexts.lock().expect("context table lock").get(name).cloned()
    }

    pub(crate) fn contexts_snapshot(&self) -> Vec<Arc<TensorContext>> {
        self.contexts
            .lock()
            .expect("context table lock")
            .values()
            .cloned()
            .collect()
    }

    /// Encode a partition key into its server shard addressing, cached per
    /// key.
    pub(crate) fn encode_key(&self, key: Key, len: usize) -> PsKv {
        let mut cache = self.pskv_cache.lock().expect("pskv cache lock");
        cache
            .entry(key)
            .or_insert_with(|| {
                let shard = key % self.config.ps_shards.max(1) as u64;
                PsKv {
                    keys: vec![(shard << 48) | key],
                    lens: vec![len],
                }
            })
            .clone()
    }
}
