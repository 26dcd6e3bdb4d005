//! CUDA/NCCL backends for the tessera engine.
//!
//! `CudaRuntime` implements the accelerator runtime interface over the CUDA
//! driver API and `NcclCollective` implements the collective interface over
//! NCCL, both via `cudarc`. Rendezvous of the NCCL unique id across ranks is
//! the deployment's job; helpers for serializing it are provided.

pub mod collective;
pub mod error;
pub mod runtime;
pub mod types;

pub use collective::{NCCL_ID_BYTES, NcclCollective, id_from_bytes, id_to_bytes};
pub use error::{CudaBackendError, Result};
pub use runtime::CudaRuntime;
pub use types::{to_nccl_dtype, to_nccl_op};
