//! tessera — a pipelined gradient-synchronization engine for data-parallel
//! training.
//!
//! Worker processes enqueue dense tensors; the engine partitions them,
//! reduces each partition across the node's devices, pushes/pulls the result
//! through a parameter server when the job spans nodes, broadcasts it back,
//! and fires a completion callback once every partition has finished. Each
//! pipeline stage runs on its own OS thread joined to its neighbors by
//! priority queues; the node's root device drives the collectives and all
//! inter-node traffic, followers obey its signals.

pub mod collective;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod ffi;
mod loops;
pub mod ps;
pub mod queue;
mod reduce;
pub mod registry;
pub mod signal;
pub mod task;
pub mod tensor;
pub mod transform;
pub mod types;

pub use collective::{CollectiveComm, CpuCollective, CpuCollectiveNode};
pub use config::EngineConfig;
pub use device::{AcceleratorRuntime, CpuRuntime, EventHandle, StreamHandle};
pub use engine::{Engine, EngineDeps};
pub use error::{EngineError, Result};
pub use ps::{LocalPsClient, LocalPsServer, PsClient, PsKv};
pub use queue::ScheduledQueue;
pub use registry::GroupEntry;
pub use signal::{LocalSignalBus, SignalBus, SignalKind, SignalMsg};
pub use task::{CallbackCell, StatusCallback, TensorContext, TensorTask};
pub use tensor::{DenseTensor, ManualReadyEvent, ReadyEvent, Tensor};
pub use transform::{GradientTransform, IdentityTransform, MomentumTransform};
pub use types::{DataType, DeviceId, Key, LocalRank, QueueKind, Rank, ReduceOp};
