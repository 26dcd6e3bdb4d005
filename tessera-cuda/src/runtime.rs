//! CUDA driver implementation of the accelerator runtime interface.
//!
//! Stream and event handles carry the raw driver pointers, so the engine's
//! `u64` handle model maps straight onto `CUstream`/`CUevent`.

use cudarc::driver::sys;
use tessera::{AcceleratorRuntime, DeviceId, EngineError, EventHandle, StreamHandle};
use tracing::info;

/// Map a driver error into the engine's runtime error class.
fn driver(e: cudarc::driver::result::DriverError) -> EngineError {
    EngineError::runtime_with_source("CUDA driver call failed", e)
}

/// Accelerator runtime backed by the CUDA driver API.
///
/// Construction initializes the driver and binds the primary context of
/// `device`; stage threads re-bind with `set_device` at startup.
pub struct CudaRuntime;

impl CudaRuntime {
    pub fn new(device: DeviceId) -> tessera::Result<std::sync::Arc<Self>> {
        cudarc::driver::result::init().map_err(driver)?;
        let rt = std::sync::Arc::new(Self);
        rt.set_device(device)?;
        info!(device, "CUDA driver bound");
        Ok(rt)
    }
}

impl AcceleratorRuntime for CudaRuntime {
    fn set_device(&self, device: DeviceId) -> tessera::Result<()> {
        if device < 0 {
            return Err(EngineError::InvalidDevice { device });
        }
        let dev = cudarc::driver::result::device::get(device).map_err(driver)?;
        let ctx =
            unsafe { cudarc::driver::result::primary_ctx::retain(dev) }.map_err(driver)?;
        unsafe { cudarc::driver::result::ctx::set_current(ctx) }.map_err(driver)?;
        Ok(())
    }

    fn create_stream(&self, _device: DeviceId) -> tessera::Result<StreamHandle> {
        let stream = cudarc::driver::result::stream::create(
            cudarc::driver::result::stream::StreamKind::NonBlocking,
        )
        .map_err(driver)?;
        Ok(StreamHandle(stream as u64))
    }

    fn alloc_pinned(&self, bytes: usize) -> tessera::Result<u64> {
        let ptr = unsafe {
            cudarc::driver::result::malloc_host(bytes, sys::CU_MEMHOSTALLOC_DEVICEMAP)
        }
        .map_err(driver)?;
        Ok(ptr as u64)
    }

    fn free_pinned(&self, ptr: u64) -> tessera::Result<()> {
        unsafe { cudarc::driver::result::free_host(ptr as *mut std::ffi::c_void) }
            .map_err(driver)
    }

    unsafe fn copy_d2h(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> tessera::Result<()> {
        let dst = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, bytes) };
        unsafe {
            cudarc::driver::result::memcpy_dtoh_async(
                dst,
                src as sys::CUdeviceptr,
                stream.0 as sys::CUstream,
            )
        }
        .map_err(driver)
    }

    unsafe fn copy_h2d(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> tessera::Result<()> {
        let src = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };
        unsafe {
            cudarc::driver::result::memcpy_htod_async(
                dst as sys::CUdeviceptr,
                src,
                stream.0 as sys::CUstream,
            )
        }
        .map_err(driver)
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> tessera::Result<()> {
        unsafe { cudarc::driver::result::stream::synchronize(stream.0 as sys::CUstream) }
            .map_err(driver)
    }

    fn create_event(&self) -> tessera::Result<EventHandle> {
        // Blocking sync keeps the sync stage off the CPU while it waits.
        let event =
            cudarc::driver::result::event::create(sys::CUevent_flags::CU_EVENT_BLOCKING_SYNC)
                .map_err(driver)?;
        Ok(EventHandle(event as u64))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> tessera::Result<()> {
        unsafe {
            cudarc::driver::result::event::record(
                event.0 as sys::CUevent,
                stream.0 as sys::CUstream,
            )
        }
        .map_err(driver)
    }

    fn event_synchronize(&self, event: EventHandle) -> tessera::Result<()> {
        unsafe { cudarc::driver::result::event::synchronize(event.0 as sys::CUevent) }
            .map_err(driver)
    }

    fn destroy_event(&self, event: EventHandle) -> tessera::Result<()> {
        unsafe { cudarc::driver::result::event::destroy(event.0 as sys::CUevent) }.map_err(driver)
    }
}
