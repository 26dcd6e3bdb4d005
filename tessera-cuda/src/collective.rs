//! NCCL implementation of the collective interface.
//!
//! Uses cudarc's `result` layer directly (raw pointers) because the engine
//! manages device memory as `u64` pointers.

use std::ffi::c_void;
use std::mem::MaybeUninit;

use cudarc::nccl::{result as nccl, safe::Id, sys};
use tessera::{CollectiveComm, DataType, EngineError, LocalRank, ReduceOp, StreamHandle};
use tracing::info;

use crate::error::Result;
use crate::types::{to_nccl_dtype, to_nccl_op};

fn nccl_err(e: nccl::NcclError) -> EngineError {
    EngineError::Collective(format!("NCCL call failed: {e:?}"))
}

/// One rank's intra-node NCCL communicator.
pub struct NcclCollective {
    comm: sys::ncclComm_t,
    local_rank: LocalRank,
    local_size: u32,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization.
unsafe impl Send for NcclCollective {}
unsafe impl Sync for NcclCollective {}

impl NcclCollective {
    /// Initialize a communicator from a pre-shared unique id. Every local
    /// rank must call this with the same `id` and `local_size` but its own
    /// `local_rank`.
    pub fn init(local_rank: LocalRank, local_size: u32, id: Id) -> Result<Self> {
        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                local_size as i32,
                id_to_sys(&id),
                local_rank as i32,
            )?;
        }
        info!(local_rank, local_size, "NCCL communicator ready");
        Ok(Self {
            comm: unsafe { comm.assume_init() },
            local_rank,
            local_size,
        })
    }

    pub fn local_rank(&self) -> LocalRank {
        self.local_rank
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }
}

impl CollectiveComm for NcclCollective {
    fn group_start(&self) -> tessera::Result<()> {
        nccl::group_start().map_err(nccl_err)?;
        Ok(())
    }

    fn group_end(&self) -> tessera::Result<()> {
        nccl::group_end().map_err(nccl_err)?;
        Ok(())
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
    ) -> tessera::Result<()> {
        unsafe {
            nccl::reduce(
                src as *const c_void,
                dst as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                to_nccl_op(op),
                root as i32,
                self.comm,
                stream.0 as sys::cudaStream_t,
            )
        }
        .map_err(nccl_err)?;
        Ok(())
    }

    unsafe fn broadcast(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
        root: LocalRank,
        stream: StreamHandle,
    ) -> tessera::Result<()> {
        unsafe {
            nccl::broadcast(
                src as *const c_void,
                dst as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                root as i32,
                self.comm,
                stream.0 as sys::cudaStream_t,
            )
        }
        .map_err(nccl_err)?;
        Ok(())
    }
}

impl Drop for NcclCollective {
    fn drop(&mut self) {
        // Destroying a communicator waits for every queued collective;
        // aborting does not, which is what teardown of a half-shut-down
        // pipeline needs.
        unsafe {
            let _ = nccl::comm_abort(self.comm);
        }
    }
}

/// Rebuild the sys-level `ncclUniqueId` from the safe wrapper. The wrapper
/// only exposes the 128-byte opaque payload, which is also the struct's only
/// field.
fn id_to_sys(id: &Id) -> sys::ncclUniqueId {
    sys::ncclUniqueId {
        internal: *id.internal(),
    }
}

/// Length in bytes of a serialized NCCL unique id.
pub const NCCL_ID_BYTES: usize = 128;

/// Serialize an NCCL unique id for out-of-band rendezvous.
pub fn id_to_bytes(id: &Id) -> [u8; NCCL_ID_BYTES] {
    let mut out = [0u8; NCCL_ID_BYTES];
    for (dst, &src) in out.iter_mut().zip(id.internal()) {
        *dst = src as u8;
    }
    out
}

/// Deserialize an NCCL unique id received from the rendezvous channel.
/// Short input is zero-padded, excess input ignored.
pub fn id_from_bytes(bytes: &[u8]) -> Id {
    let mut internal = [0; NCCL_ID_BYTES];
    for (dst, &src) in internal.iter_mut().zip(bytes) {
        *dst = src as std::ffi::c_char;
    }
    Id::uninit(internal)
}
