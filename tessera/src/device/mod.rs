//! The accelerator runtime interface: streams, events, device↔host copies,
//! and pinned host memory.
//!
//! Handles are plain `u64`s so backends can store raw driver pointers in
//! them; the CPU reference backend stores table indices instead.

mod cpu;

pub use cpu::CpuRuntime;

use crate::error::Result;
use crate::types::DeviceId;

/// An asynchronous work queue on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// A completion marker recordable on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Narrow view of the accelerator runtime consumed by the pipeline.
pub trait AcceleratorRuntime: Send + Sync {
    /// Bind the calling thread to a device. Stage threads that issue device
    /// work call this once at startup.
    fn set_device(&self, device: DeviceId) -> Result<()>;

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle>;

    /// Allocate page-locked host memory; returns the base pointer.
    fn alloc_pinned(&self, bytes: usize) -> Result<u64>;

    fn free_pinned(&self, ptr: u64) -> Result<()>;

    /// Asynchronous device→host byte copy on `stream`.
    ///
    /// # Safety
    /// `src` must be a valid device pointer and `dst` a valid host pointer,
    /// each for `bytes` bytes, staying valid until the stream synchronizes.
    unsafe fn copy_d2h(&self, dst: u64, src: u64, bytes: usize, stream: StreamHandle)
    -> Result<()>;

    /// Asynchronous host→device byte copy on `stream`.
    ///
    /// # Safety
    /// Same contract as [`AcceleratorRuntime::copy_d2h`] with directions
    /// swapped.
    unsafe fn copy_h2d(&self, dst: u64, src: u64, bytes: usize, stream: StreamHandle)
    -> Result<()>;

    /// Block until all work submitted to `stream` has completed.
    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Create an event with blocking synchronization semantics.
    fn create_event(&self) -> Result<EventHandle>;

    /// Capture "all work submitted to `stream` so far" into `event`.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;

    /// Block until the captured work has completed. An event that was never
    /// recorded is already complete.
    fn event_synchronize(&self, event: EventHandle) -> Result<()>;

    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    /// Release any threads blocked in event or stream waits with a shutdown
    /// error. Backends whose waits always terminate on their own may keep
    /// the default no-op.
    fn shutdown(&self) {}
}
