//! In-process parameter server.
//!
//! Serves single-machine multi-worker runs and the test suite. Semantics
//! follow the bulk-synchronous training contract: the first-ever push of a
//! key stores it verbatim (initialization); afterwards each worker pushes
//! once per round, the round's element-wise sum becomes the stored value
//! once every worker has pushed, pulls park until the round is complete, and
//! the round resets once every worker has pulled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::ps::{PsCallback, PsClient, PsHandle, PsKv};
use crate::reduce::reduce_slice;
use crate::types::{DataType, Key, command_dtype};

/// Tracks one multi-shard push/pull until every shard has completed.
struct PendingOp {
    handle: PsHandle,
    remaining: Mutex<usize>,
    cb: Mutex<Option<PsCallback>>,
}

impl PendingOp {
    fn new(handle: PsHandle, shards: usize, cb: Option<PsCallback>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            remaining: Mutex::new(shards),
            cb: Mutex::new(cb),
        })
    }

    fn finish_shard(&self, server: &LocalPsServer) {
        let done = {
            let mut remaining = self.remaining.lock().expect("pending op lock");
            *remaining -= 1;
            *remaining == 0
        };
        if done {
            server.mark_complete(self.handle);
            if let Some(cb) = self.cb.lock().expect("pending op lock").take() {
                cb();
            }
        }
    }
}

/// A parked pull waiting for its round to complete.
struct ParkedPull {
    worker: u32,
    dst: u64,
    len: usize,
    op: Arc<PendingOp>,
}

// SAFETY: the raw destination pointer stays valid until the continuation
// runs; that is the zpull caller's contract.
unsafe impl Send for ParkedPull {}

#[derive(Default)]
struct Slot {
    stored: Vec<u8>,
    initialized: bool,
    acc: Vec<u8>,
    pushed: HashSet<u32>,
    pulled: HashSet<u32>,
    round_ready: bool,
    parked: Vec<ParkedPull>,
}

struct BarrierState {
    waiting: u32,
    generation: u64,
}

pub struct LocalPsServer {
    num_workers: u32,
    slots: Mutex<HashMap<Key, Slot>>,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
    completed: Mutex<HashSet<PsHandle>>,
    completed_cv: Condvar,
    next_handle: AtomicU64,
}

impl LocalPsServer {
    pub fn new(num_workers: u32) -> Arc<Self> {
        Arc::new(Self {
            num_workers,
            slots: Mutex::new(HashMap::new()),
            barrier: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            barrier_cv: Condvar::new(),
            completed: Mutex::new(HashSet::new()),
            completed_cv: Condvar::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    /// A client bound to one worker identity.
    pub fn client(self: &Arc<Self>, worker_id: u32) -> Arc<LocalPsClient> {
        Arc::new(LocalPsClient {
            server: Arc::clone(self),
            worker_id,
        })
    }

    fn new_handle(&self) -> PsHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn mark_complete(&self, handle: PsHandle) {
        self.completed.lock().expect("completion lock").insert(handle);
        self.completed_cv.notify_all();
    }

    fn wait_handle(&self, handle: PsHandle) -> Result<()> {
        let mut completed = self.completed.lock().expect("completion lock");
        while !completed.remove(&handle) {
            completed = self.completed_cv.wait(completed).expect("completion lock");
        }
        Ok(())
    }

    /// Returns the pulls released by this push, to be completed outside the
    /// slot lock.
    fn push(&self, worker: u32, key: Key, data: &[u8], dtype: DataType) -> Result<Vec<ParkedPull>> {
        let mut slots = self.slots.lock().expect("slot lock");
        let slot = slots.entry(key).or_default();

        if !slot.initialized {
            slot.stored = data.to_vec();
            slot.initialized = true;
            trace!(key, len = data.len(), "key initialized");
            return Ok(Vec::new());
        }

        if !slot.pushed.insert(worker) {
            return Err(EngineError::Ps(format!(
                "worker {worker} pushed key {key} twice in one round"
            )));
        }
        if slot.acc.is_empty() {
            slot.acc = vec![0u8; data.len()];
        }
        let count = data.len() / dtype.size_in_bytes();
        reduce_slice(&mut slot.acc, data, count, dtype, crate::types::ReduceOp::Sum)?;

        if slot.pushed.len() as u32 == self.num_workers {
            slot.stored = std::mem::take(&mut slot.acc);
            slot.pushed.clear();
            slot.round_ready = true;
            trace!(key, "round complete");
            return Ok(std::mem::take(&mut slot.parked));
        }
        Ok(Vec::new())
    }

    /// Serve a completed round into `dst` and account the puller. Must be
    /// called with the slot round-ready.
    fn serve(slot: &mut Slot, worker: u32, dst: u64, len: usize) {
        let n = len.min(slot.stored.len());
        unsafe {
            std::ptr::copy_nonoverlapping(slot.stored.as_ptr(), dst as *mut u8, n);
        }
        slot.pulled.insert(worker);
    }

    fn finish_round_if_drained(&self, slot: &mut Slot) {
        if slot.pulled.len() as u32 == self.num_workers {
            slot.pulled.clear();
            slot.round_ready = false;
        }
    }

    /// Returns true if the pull was served inline, false if parked.
    fn pull(&self, worker: u32, key: Key, dst: u64, len: usize, op: Arc<PendingOp>) -> Result<bool> {
        let mut slots = self.slots.lock().expect("slot lock");
        let slot = slots.entry(key).or_default();
        if slot.round_ready {
            Self::serve(slot, worker, dst, len);
            self.finish_round_if_drained(slot);
            Ok(true)
        } else {
            slot.parked.push(ParkedPull {
                worker,
                dst,
                len,
                op,
            });
            Ok(false)
        }
    }

    fn arrive_barrier(&self) -> Result<()> {
        let mut state = self.barrier.lock().expect("barrier lock");
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == self.num_workers {
            state.waiting = 0;
            state.generation += 1;
            self.barrier_cv.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            state = self.barrier_cv.wait(state).expect("barrier lock");
        }
        Ok(())
    }
}

/// One worker's handle onto the in-process server.
pub struct LocalPsClient {
    server: Arc<LocalPsServer>,
    worker_id: u32,
}

impl PsClient for LocalPsClient {
    unsafe fn zpush(
        &self,
        kv: &PsKv,
        src: u64,
        len: usize,
        cmd: i32,
        cb: Option<PsCallback>,
    ) -> Result<PsHandle> {
        let dtype = command_dtype(cmd)
            .ok_or_else(|| EngineError::Ps(format!("bad command word {cmd:#x}")))?;
        debug_assert_eq!(kv.lens.iter().sum::<usize>(), len);

        let handle = self.server.new_handle();
        let op = PendingOp::new(handle, kv.keys.len(), cb);

        let mut offset = 0usize;
        for (&key, &shard_len) in kv.keys.iter().zip(kv.lens.iter()) {
            let data =
                unsafe { std::slice::from_raw_parts((src + offset as u64) as *const u8, shard_len) };
            let released = self.server.push(self.worker_id, key, data, dtype)?;
            op.finish_shard(&self.server);
            // Pulls released by a completed round: serve them now, then run
            // their continuations.
            for parked in released {
                {
                    let mut slots = self.server.slots.lock().expect("slot lock");
                    let slot = slots.get_mut(&key).expect("slot exists");
                    LocalPsServer::serve(slot, parked.worker, parked.dst, parked.len);
                    self.server.finish_round_if_drained(slot);
                }
                parked.op.finish_shard(&self.server);
            }
            offset += shard_len;
        }
        Ok(handle)
    }

    unsafe fn zpull(
        &self,
        kv: &PsKv,
        dst: u64,
        len: usize,
        cmd: i32,
        cb: Option<PsCallback>,
    ) -> Result<PsHandle> {
        command_dtype(cmd).ok_or_else(|| EngineError::Ps(format!("bad command word {cmd:#x}")))?;
        debug_assert_eq!(kv.lens.iter().sum::<usize>(), len);

        let handle = self.server.new_handle();
        let op = PendingOp::new(handle, kv.keys.len(), cb);

        let mut offset = 0usize;
        for (&key, &shard_len) in kv.keys.iter().zip(kv.lens.iter()) {
            let served = self.server.pull(
                self.worker_id,
                key,
                dst + offset as u64,
                shard_len,
                Arc::clone(&op),
            )?;
            if served {
                op.finish_shard(&self.server);
            }
            offset += shard_len;
        }
        Ok(handle)
    }

    fn wait(&self, handle: PsHandle) -> Result<()> {
        self.server.wait_handle(handle)
    }

    fn barrier(&self, _group: u32) -> Result<()> {
        self.server.arrive_barrier()
    }
}
