//! The intra-node collective library interface.
//!
//! Calls between `group_start` and `group_end` form one fused batch; the
//! batch's completion is observed through an event recorded on the
//! collective stream after `group_end`. Every local rank must issue the same
//! op sequence within a group — the engine's root enforces this by signaling
//! each op before issuing it.

mod cpu;

pub use cpu::{CpuCollective, CpuCollectiveNode};

use crate::device::StreamHandle;
use crate::error::Result;
use crate::types::{DataType, LocalRank, ReduceOp};

pub trait CollectiveComm: Send + Sync {
    fn group_start(&self) -> Result<()>;

    fn group_end(&self) -> Result<()>;

    /// Reduce `count` elements to `root`'s `dst`. In-place when
    /// `src == dst`.
    ///
    /// # Safety
    /// `src` and `dst` must be valid device pointers for
    /// `count * dtype.size_in_bytes()` bytes, valid until the group's event
    /// fires.
    unsafe fn reduce(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: LocalRank,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Broadcast `count` elements from `root`.
    ///
    /// # Safety
    /// Same contract as [`CollectiveComm::reduce`].
    unsafe fn broadcast(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
        root: LocalRank,
        stream: StreamHandle,
    ) -> Result<()>;
}
