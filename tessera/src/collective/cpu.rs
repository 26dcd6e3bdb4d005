//! Shared-memory reference implementation of the collective library.
//!
//! All local ranks are threads of one process, so "device" buffers are
//! plainly addressable. Each rank batches its calls between group markers;
//! `group_end` submits the batch to a node-shared coordinator and opens a
//! work ticket on the rank's collective stream. Batches are matched across
//! ranks by arrival sequence — legal because every rank issues the same
//! groups in the same order. The last rank to deliver a batch checks the op
//! sequences agree, applies the math, and closes every participant's ticket,
//! which is what fires the events the sync stage waits on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::collective::CollectiveComm;
use crate::device::{CpuRuntime, StreamHandle};
use crate::error::{EngineError, Result};
use crate::reduce::reduce_slice;
use crate::types::{DataType, LocalRank, ReduceOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Reduce,
    Broadcast,
}

#[derive(Clone, Copy)]
struct PendingOp {
    kind: OpKind,
    src: u64,
    dst: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    root: LocalRank,
}

struct Batch {
    ops: Vec<PendingOp>,
    runtime: Arc<CpuRuntime>,
    stream: StreamHandle,
}

/// Node-wide coordinator shared by every local rank's [`CpuCollective`].
pub struct CpuCollectiveNode {
    local_size: u32,
    ranks: Mutex<Vec<VecDeque<Batch>>>,
}

impl CpuCollectiveNode {
    pub fn new(local_size: u32) -> Arc<Self> {
        Arc::new(Self {
            local_size,
            ranks: Mutex::new((0..local_size).map(|_| VecDeque::new()).collect()),
        })
    }

    fn submit(&self, rank: LocalRank, batch: Batch) -> Result<()> {
        if rank >= self.local_size {
            return Err(EngineError::Collective(format!(
                "rank {rank} out of range for local size {}",
                self.local_size
            )));
        }
        let mut ranks = self.ranks.lock().expect("collective node lock");
        ranks[rank as usize].push_back(batch);

        // Apply every batch for which all ranks have arrived.
        while ranks.iter().all(|q| !q.is_empty()) {
            let round: Vec<Batch> = ranks.iter_mut().map(|q| q.pop_front().expect("nonempty")).collect();
            Self::verify(&round)?;
            debug!(ops = round[0].ops.len(), "applying collective group");
            unsafe { Self::apply(&round) }?;
            for b in &round {
                b.runtime.complete_ticket(b.stream)?;
            }
        }
        Ok(())
    }

    /// Every rank must have issued the same op sequence within the group.
    fn verify(round: &[Batch]) -> Result<()> {
        let first = &round[0];
        for batch in &round[1..] {
            if batch.ops.len() != first.ops.len() {
                return Err(EngineError::Collective(format!(
                    "group size mismatch across ranks: {} vs {}",
                    first.ops.len(),
                    batch.ops.len()
                )));
            }
            for (i, (a, b)) in first.ops.iter().zip(batch.ops.iter()).enumerate() {
                if a.kind != b.kind
                    || a.count != b.count
                    || a.dtype != b.dtype
                    || a.op != b.op
                    || a.root != b.root
                {
                    return Err(EngineError::Collective(format!(
                        "op {i} diverges across ranks ({:?}/{} vs {:?}/{})",
                        a.kind, a.count, b.kind, b.count
                    )));
                }
            }
        }
        Ok(())
    }

    unsafe fn apply(round: &[Batch]) -> Result<()> {
        let n_ops = round[0].ops.len();
        for i in 0..n_ops {
            let proto = round[0].ops[i];
            let root = proto.root as usize;
            let bytes = proto.count * proto.dtype.size_in_bytes();
            match proto.kind {
                OpKind::Reduce => {
                    let root_op = round[root].ops[i];
                    let dst =
                        unsafe { std::slice::from_raw_parts_mut(root_op.dst as *mut u8, bytes) };
                    if root_op.dst != root_op.src {
                        let src =
                            unsafe { std::slice::from_raw_parts(root_op.src as *const u8, bytes) };
                        dst.copy_from_slice(src);
                    }
                    for (r, b) in round.iter().enumerate() {
                        if r == root {
                            continue;
                        }
                        let src =
                            unsafe { std::slice::from_raw_parts(b.ops[i].src as *const u8, bytes) };
                        reduce_slice(dst, src, proto.count, proto.dtype, proto.op)?;
                    }
                }
                OpKind::Broadcast => {
                    let root_src = round[root].ops[i].src;
                    let src = unsafe { std::slice::from_raw_parts(root_src as *const u8, bytes) };
                    for (r, b) in round.iter().enumerate() {
                        let dst_ptr = b.ops[i].dst;
                        if r == root && dst_ptr == root_src {
                            continue;
                        }
                        let dst =
                            unsafe { std::slice::from_raw_parts_mut(dst_ptr as *mut u8, bytes) };
                        dst.copy_from_slice(src);
                    }
                }
            }
        }
        Ok(())
    }
}

/// One rank's handle onto the node coordinator.
pub struct CpuCollective {
    node: Arc<CpuCollectiveNode>,
    runtime: Arc<CpuRuntime>,
    local_rank: LocalRank,
    group: Mutex<Group>,
}

#[derive(Default)]
struct Group {
    open: bool,
    ops: Vec<PendingOp>,
    stream: Option<StreamHandle>,
}

impl CpuCollective {
    pub fn new(
        node: Arc<CpuCollectiveNode>,
        runtime: Arc<CpuRuntime>,
        local_rank: LocalRank,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            runtime,
            local_rank,
            group: Mutex::new(Group::default()),
        })
    }

    fn push_op(&self, op: PendingOp, stream: StreamHandle) -> Result<()> {
        let mut group = self.group.lock().expect("group lock");
        if !group.open {
            return Err(EngineError::Collective(
                "collective call outside a group".into(),
            ));
        }
        if let Some(existing) = group.stream
            && existing != stream
        {
            return Err(EngineError::Collective(
                "one group must stay on one stream".into(),
            ));
        }
        group.stream = Some(stream);
        group.ops.push(op);
        Ok(())
    }
}

impl CollectiveComm for CpuCollective {
    fn group_start(&self) -> Result<()> {
        let mut group = self.group.lock().expect("group lock");
        if group.open {
            return Err(EngineError::Collective("group already open".into()));
        }
        group.open = true;
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        let (ops, stream) = {
            let mut group = self.group.lock().expect("group lock");
            if !group.open {
                return Err(EngineError::Collective("group not open".into()));
            }
            group.open = false;
            (std::mem::take(&mut group.ops), group.stream.take())
        };
        if ops.is_empty() {
            return Ok(());
        }
        let stream = stream.expect("nonempty group always has a stream");
        self.runtime.submit_ticket(stream)?;
        self.node.submit(
            self.local_rank,
            Batch {
                ops,
                runtime: Arc::clone(&self.runtime),
                stream,
            },
        )
    }

    unsafe fn reduce(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: LocalRank,
        stream: StreamHandle,
    ) -> Result<()> {
        self.push_op(
            PendingOp {
                kind: OpKind::Reduce,
                src,
                dst,
                count,
                dtype,
                op,
                root,
            },
            stream,
        )
    }

    unsafe fn broadcast(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
        root: LocalRank,
        stream: StreamHandle,
    ) -> Result<()> {
        self.push_op(
            PendingOp {
                kind: OpKind::Broadcast,
                src,
                dst,
                count,
                dtype,
                op: ReduceOp::Sum,
                root,
            },
            stream,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AcceleratorRuntime;

    struct Rank {
        comm: Arc<CpuCollective>,
        runtime: Arc<CpuRuntime>,
        stream: StreamHandle,
    }

    fn two_ranks() -> Vec<Rank> {
        let node = CpuCollectiveNode::new(2);
        (0..2u32)
            .map(|r| {
                let runtime = CpuRuntime::new();
                let stream = runtime.create_stream(0).unwrap();
                Rank {
                    comm: CpuCollective::new(Arc::clone(&node), Arc::clone(&runtime), r),
                    runtime,
                    stream,
                }
            })
            .collect()
    }

    #[test]
    fn test_reduce_sums_to_root() {
        let ranks = two_ranks();
        let mut bufs = [vec![1.0f32, 2.0, 3.0, 4.0], vec![1.0f32, 2.0, 3.0, 4.0]];
        let ptrs: Vec<u64> = bufs.iter_mut().map(|b| b.as_mut_ptr() as u64).collect();

        let handles: Vec<_> = ranks
            .iter()
            .enumerate()
            .map(|(r, rank)| {
                let comm = Arc::clone(&rank.comm);
                let stream = rank.stream;
                let ptr = ptrs[r];
                std::thread::spawn(move || {
                    comm.group_start().unwrap();
                    unsafe {
                        comm.reduce(ptr, ptr, 4, DataType::F32, ReduceOp::Sum, 0, stream)
                            .unwrap();
                    }
                    comm.group_end().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for rank in &ranks {
            rank.runtime.stream_synchronize(rank.stream).unwrap();
        }
        assert_eq!(bufs[0], vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_broadcast_copies_from_root() {
        let ranks = two_ranks();
        let mut bufs = [vec![7.0f32, 8.0], vec![0.0f32, 0.0]];
        let ptrs: Vec<u64> = bufs.iter_mut().map(|b| b.as_mut_ptr() as u64).collect();

        let handles: Vec<_> = ranks
            .iter()
            .enumerate()
            .map(|(r, rank)| {
                let comm = Arc::clone(&rank.comm);
                let stream = rank.stream;
                let ptr = ptrs[r];
                std::thread::spawn(move || {
                    comm.group_start().unwrap();
                    unsafe {
                        comm.broadcast(ptr, ptr, 2, DataType::F32, 0, stream).unwrap();
                    }
                    comm.group_end().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bufs[1], vec![7.0, 8.0]);
    }

    #[test]
    fn test_empty_group_completes_without_peers() {
        let ranks = two_ranks();
        // Only rank 0 opens and closes; an empty group needs no rendezvous.
        ranks[0].comm.group_start().unwrap();
        ranks[0].comm.group_end().unwrap();
        ranks[0].runtime.stream_synchronize(ranks[0].stream).unwrap();
    }

    #[test]
    fn test_call_outside_group_fails() {
        let ranks = two_ranks();
        let r = unsafe {
            ranks[0]
                .comm
                .reduce(0, 0, 1, DataType::F32, ReduceOp::Sum, 0, ranks[0].stream)
        };
        assert!(r.is_err());
    }

    #[test]
    fn test_diverging_op_sequences_rejected() {
        let ranks = two_ranks();
        let mut bufs = [vec![1.0f32], vec![2.0f32]];
        let ptrs: Vec<u64> = bufs.iter_mut().map(|b| b.as_mut_ptr() as u64).collect();

        ranks[0].comm.group_start().unwrap();
        unsafe {
            ranks[0]
                .comm
                .reduce(ptrs[0], ptrs[0], 1, DataType::F32, ReduceOp::Sum, 0, ranks[0].stream)
                .unwrap();
        }
        ranks[0].comm.group_end().unwrap();

        // Rank 1 issues a broadcast where rank 0 issued a reduce.
        ranks[1].comm.group_start().unwrap();
        unsafe {
            ranks[1]
                .comm
                .broadcast(ptrs[1], ptrs[1], 1, DataType::F32, 0, ranks[1].stream)
                .unwrap();
        }
        assert!(ranks[1].comm.group_end().is_err());
    }

    #[test]
    fn test_event_fires_after_group_applies() {
        let ranks = two_ranks();
        let mut bufs = [vec![1.0f32], vec![2.0f32]];
        let ptrs: Vec<u64> = bufs.iter_mut().map(|b| b.as_mut_ptr() as u64).collect();

        // Rank 0 submits and records an event; the event must not fire until
        // rank 1 delivers its half of the group.
        ranks[0].comm.group_start().unwrap();
        unsafe {
            ranks[0]
                .comm
                .reduce(ptrs[0], ptrs[0], 1, DataType::F32, ReduceOp::Sum, 0, ranks[0].stream)
                .unwrap();
        }
        ranks[0].comm.group_end().unwrap();
        let ev = ranks[0].runtime.create_event().unwrap();
        ranks[0].runtime.record_event(ev, ranks[0].stream).unwrap();

        let rt = Arc::clone(&ranks[0].runtime);
        let waiter = std::thread::spawn(move || rt.event_synchronize(ev));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        ranks[1].comm.group_start().unwrap();
        unsafe {
            ranks[1]
                .comm
                .reduce(ptrs[1], ptrs[1], 1, DataType::F32, ReduceOp::Sum, 0, ranks[1].stream)
                .unwrap();
        }
        ranks[1].comm.group_end().unwrap();

        waiter.join().unwrap().unwrap();
        assert_eq!(bufs[0], vec![3.0]);
    }
}
