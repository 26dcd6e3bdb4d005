//! Host-memory reference implementation of the accelerator runtime.
//!
//! "Device" memory is ordinary host memory and copies run synchronously, but
//! streams and events keep their real semantics: a stream is a ledger of
//! submitted/completed work tickets, and an event captures the submitted
//! count at record time and fires once the completed count catches up. The
//! CPU collective backend submits one ticket per group batch, which is what
//! makes the sync stage's event wait meaningful without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::device::{AcceleratorRuntime, EventHandle, StreamHandle};
use crate::error::{EngineError, Result};
use crate::types::DeviceId;

pub(crate) struct StreamLedger {
    counts: Mutex<LedgerCounts>,
    done: Condvar,
}

#[derive(Default)]
struct LedgerCounts {
    submitted: u64,
    completed: u64,
}

impl StreamLedger {
    fn wait_for(&self, target: u64, closed: &AtomicBool) -> Result<()> {
        let mut counts = self.counts.lock().expect("stream ledger lock");
        loop {
            if counts.completed >= target {
                return Ok(());
            }
            if closed.load(Ordering::Acquire) {
                return Err(EngineError::Shutdown);
            }
            counts = self.done.wait(counts).expect("stream ledger lock");
        }
    }
}

struct EventRecord {
    /// Ledger and submitted-count snapshot captured at record time.
    captured: Option<(Arc<StreamLedger>, u64)>,
}

pub struct CpuRuntime {
    streams: Mutex<HashMap<u64, Arc<StreamLedger>>>,
    events: Mutex<HashMap<u64, EventRecord>>,
    pinned: Mutex<HashMap<u64, Vec<u64>>>,
    next_handle: AtomicU64,
    closed: AtomicBool,
}

impl CpuRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn ledger(&self, stream: StreamHandle) -> Result<Arc<StreamLedger>> {
        self.streams
            .lock()
            .expect("stream table lock")
            .get(&stream.0)
            .cloned()
            .ok_or_else(|| EngineError::runtime(format!("unknown stream {}", stream.0)))
    }

    /// Open a work ticket on `stream`. Paired with
    /// [`CpuRuntime::complete_ticket`] by the party that finishes the work.
    pub(crate) fn submit_ticket(&self, stream: StreamHandle) -> Result<()> {
        let ledger = self.ledger(stream)?;
        ledger.counts.lock().expect("stream ledger lock").submitted += 1;
        Ok(())
    }

    /// Close one work ticket on `stream`, waking waiters.
    pub(crate) fn complete_ticket(&self, stream: StreamHandle) -> Result<()> {
        let ledger = self.ledger(stream)?;
        ledger.counts.lock().expect("stream ledger lock").completed += 1;
        ledger.done.notify_all();
        Ok(())
    }
}

impl AcceleratorRuntime for CpuRuntime {
    fn set_device(&self, _device: DeviceId) -> Result<()> {
        Ok(())
    }

    fn create_stream(&self, _device: DeviceId) -> Result<StreamHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().expect("stream table lock").insert(
            id,
            Arc::new(StreamLedger {
                counts: Mutex::new(LedgerCounts::default()),
                done: Condvar::new(),
            }),
        );
        Ok(StreamHandle(id))
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<u64> {
        // u64 words keep every element dtype alignment-correct.
        let buf = vec![0u64; bytes.div_ceil(8).max(1)];
        let ptr = buf.as_ptr() as u64;
        self.pinned.lock().expect("pinned table lock").insert(ptr, buf);
        Ok(ptr)
    }

    fn free_pinned(&self, ptr: u64) -> Result<()> {
        self.pinned
            .lock()
            .expect("pinned table lock")
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| EngineError::runtime(format!("unknown pinned buffer 0x{ptr:x}")))
    }

    unsafe fn copy_d2h(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        _stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    unsafe fn copy_h2d(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        _stream: StreamHandle,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()> {
        let ledger = self.ledger(stream)?;
        let target = ledger.counts.lock().expect("stream ledger lock").submitted;
        ledger.wait_for(target, &self.closed)
    }

    fn create_event(&self) -> Result<EventHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.events
            .lock()
            .expect("event table lock")
            .insert(id, EventRecord { captured: None });
        Ok(EventHandle(id))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        let ledger = self.ledger(stream)?;
        let submitted = ledger.counts.lock().expect("stream ledger lock").submitted;
        let mut events = self.events.lock().expect("event table lock");
        let record = events
            .get_mut(&event.0)
            .ok_or_else(|| EngineError::runtime(format!("unknown event {}", event.0)))?;
        record.captured = Some((ledger, submitted));
        Ok(())
    }

    fn event_synchronize(&self, event: EventHandle) -> Result<()> {
        let captured = {
            let events = self.events.lock().expect("event table lock");
            let record = events
                .get(&event.0)
                .ok_or_else(|| EngineError::runtime(format!("unknown event {}", event.0)))?;
            record.captured.clone()
        };
        match captured {
            // Never recorded: already complete.
            None => Ok(()),
            Some((ledger, target)) => ledger.wait_for(target, &self.closed),
        }
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.events
            .lock()
            .expect("event table lock")
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| EngineError::runtime(format!("unknown event {}", event.0)))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for ledger in self.streams.lock().expect("stream table lock").values() {
            ledger.done.notify_all();
        }
    }
}
