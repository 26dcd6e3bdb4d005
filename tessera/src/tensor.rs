//! Tensor buffer handles consumed by the engine.
//!
//! tessera operates on raw `u64` pointers + byte counts. Front-ends keep
//! ownership of the actual buffers; the engine only ever sees this narrow
//! view of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::DataType;

/// A dense tensor buffer as the engine sees it.
///
/// `size()` must be a multiple of `num_elements()`; the quotient is the
/// element stride used to convert byte windows into element counts for
/// collective calls.
pub trait Tensor: Send + Sync {
    /// Base byte pointer of the buffer (device or host, per the work item's
    /// device id).
    fn data(&self) -> u64;

    /// Total size in bytes.
    fn size(&self) -> usize;

    /// Number of elements.
    fn num_elements(&self) -> usize;

    /// Element data type.
    fn dtype(&self) -> DataType;
}

/// Readiness token the front-end may attach to an enqueue.
///
/// Queue dispatch polls this before the engine touches the tensor; a fired
/// event stays fired.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

/// A `ReadyEvent` toggled by the front-end, for host-side producers.
#[derive(Default)]
pub struct ManualReadyEvent {
    fired: AtomicBool,
}

impl ManualReadyEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }
}

impl ReadyEvent for ManualReadyEvent {
    fn ready(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// An owned, 8-byte-aligned buffer implementing [`Tensor`].
///
/// Used by tests and single-process deployments where the "device" memory is
/// ordinary host memory. The engine writes through the raw pointer returned
/// by `data()` while readers hold a shared handle; lifecycle is: producers
/// fill the buffer, the engine reduces it, the completion callback fires,
/// then readers inspect it.
pub struct DenseTensor {
    // u64 words so every supported dtype is alignment-correct.
    storage: Vec<u64>,
    bytes: usize,
    elements: usize,
    dtype: DataType,
}

// SAFETY: the pipeline hands each byte window of the buffer to exactly one
// stage at a time (queue-list ordering is the synchronization), matching how
// device buffers are shared with an accelerator runtime.
unsafe impl Send for DenseTensor {}
unsafe impl Sync for DenseTensor {}

impl DenseTensor {
    /// Allocate a zeroed tensor of `elements` elements of `dtype`.
    pub fn zeros(elements: usize, dtype: DataType) -> Arc<Self> {
        let bytes = elements * dtype.size_in_bytes();
        Arc::new(Self {
            storage: vec![0u64; bytes.div_ceil(8)],
            bytes,
            elements,
            dtype,
        })
    }

    /// Build an f32 tensor from a slice.
    pub fn from_f32(values: &[f32]) -> Arc<Self> {
        let t = Self::zeros(values.len(), DataType::F32);
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), t.data() as *mut f32, values.len());
        }
        t
    }

    /// Build a u8 tensor from a slice.
    pub fn from_u8(values: &[u8]) -> Arc<Self> {
        let t = Self::zeros(values.len(), DataType::U8);
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), t.data() as *mut u8, values.len());
        }
        t
    }

    /// Snapshot the buffer as f32 values.
    pub fn to_f32(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DataType::F32);
        let mut out = vec![0f32; self.elements];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data() as *const f32, out.as_mut_ptr(), self.elements);
        }
        out
    }
}

impl Tensor for DenseTensor {
    fn data(&self) -> u64 {
        self.storage.as_ptr() as u64
    }

    fn size(&self) -> usize {
        self.bytes
    }

    fn num_elements(&self) -> usize {
        self.elements
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_tensor_round_trip() {
        let t = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.size(), 16);
        assert_eq!(t.num_elements(), 4);
        assert_eq!(t.dtype(), DataType::F32);
        assert_eq!(t.to_f32(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dense_tensor_alignment() {
        let t = DenseTensor::zeros(3, DataType::F64);
        assert_eq!(t.data() % 8, 0);
        assert_eq!(t.size(), 24);
    }

    #[test]
    fn test_manual_ready_event() {
        let ev = ManualReadyEvent::new();
        assert!(!ev.ready());
        ev.fire();
        assert!(ev.ready());
        assert!(ev.ready());
    }
}
