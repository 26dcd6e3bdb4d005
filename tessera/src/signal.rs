//! Intra-node control-signal channel between the root device and its
//! followers.
//!
//! The channel is deliberately tiny: fixed-size messages, reliable and
//! in-order per source. When all local ranks are threads of one process the
//! in-process bus below is the whole transport; multi-process nodes can plug
//! in a shared-memory or socket implementation of the same trait.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{EngineError, Result};
use crate::types::{Key, LocalRank};

/// Control-message kinds exchanged inside one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Non-root → root: partition is parked on my reduce queue.
    ReduceReady,
    /// Non-root → root: partition is parked on my broadcast queue.
    BcastReady,
    /// Root → all: issue the reduce for this key now.
    DoReduce,
    /// Root → all: issue the broadcast for this key now.
    DoBroadcast,
    /// Root → all: close the current collective group.
    DoGroup,
}

/// A control message: source local rank, kind, and the partition key it
/// refers to (0 for group boundaries).
#[derive(Debug, Clone, Copy)]
pub struct SignalMsg {
    pub src: LocalRank,
    pub kind: SignalKind,
    pub key: Key,
}

/// Point-to-point and broadcast signaling between local ranks.
pub trait SignalBus: Send + Sync {
    /// Reliable, in-order delivery to one destination.
    fn send(&self, dst: LocalRank, msg: SignalMsg) -> Result<()>;

    /// Deliver to every local rank except `src`, preserving source order.
    fn broadcast(&self, src: LocalRank, msg: SignalMsg) -> Result<()>;

    /// Block until the next message for `rank` arrives. Returns
    /// [`EngineError::Shutdown`] once the rank's mailbox is closed.
    fn recv(&self, rank: LocalRank) -> Result<SignalMsg>;

    /// Non-blocking variant of `recv`.
    fn try_recv(&self, rank: LocalRank) -> Result<Option<SignalMsg>>;

    /// Close one rank's mailbox, waking a blocked `recv`.
    fn close(&self, rank: LocalRank);
}

struct Mailbox {
    queue: Mutex<MailboxState>,
    ready: Condvar,
}

struct MailboxState {
    messages: std::collections::VecDeque<SignalMsg>,
    closed: bool,
}

/// In-process [`SignalBus`] for nodes whose local ranks share one address
/// space: one mailbox per rank, mutex + condvar.
pub struct LocalSignalBus {
    boxes: Vec<Mailbox>,
}

impl LocalSignalBus {
    pub fn new(local_size: u32) -> Arc<Self> {
        Arc::new(Self {
            boxes: (0..local_size)
                .map(|_| Mailbox {
                    queue: Mutex::new(MailboxState {
                        messages: std::collections::VecDeque::new(),
                        closed: false,
                    }),
                    ready: Condvar::new(),
                })
                .collect(),
        })
    }

    fn mailbox(&self, rank: LocalRank) -> Result<&Mailbox> {
        self.boxes
            .get(rank as usize)
            .ok_or_else(|| EngineError::Signal(format!("no mailbox for local rank {rank}")))
    }
}

impl SignalBus for LocalSignalBus {
    fn send(&self, dst: LocalRank, msg: SignalMsg) -> Result<()> {
        let mb = self.mailbox(dst)?;
        let mut state = mb.queue.lock().expect("mailbox lock");
        if state.closed {
            return Err(EngineError::Shutdown);
        }
        state.messages.push_back(msg);
        mb.ready.notify_one();
        Ok(())
    }

    fn broadcast(&self, src: LocalRank, msg: SignalMsg) -> Result<()> {
        for dst in 0..self.boxes.len() as u32 {
            if dst == src {
                continue;
            }
            // A closed peer mailbox just means that rank is already gone.
            match self.send(dst, msg) {
                Ok(()) | Err(EngineError::Shutdown) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn recv(&self, rank: LocalRank) -> Result<SignalMsg> {
        let mb = self.mailbox(rank)?;
        let mut state = mb.queue.lock().expect("mailbox lock");
        loop {
            if let Some(msg) = state.messages.pop_front() {
                return Ok(msg);
            }
            if state.closed {
                return Err(EngineError::Shutdown);
            }
            state = mb.ready.wait(state).expect("mailbox lock");
        }
    }

    fn try_recv(&self, rank: LocalRank) -> Result<Option<SignalMsg>> {
        let mb = self.mailbox(rank)?;
        let mut state = mb.queue.lock().expect("mailbox lock");
        if let Some(msg) = state.messages.pop_front() {
            return Ok(Some(msg));
        }
        if state.closed {
            return Err(EngineError::Shutdown);
        }
        Ok(None)
    }

    fn close(&self, rank: LocalRank) {
        if let Ok(mb) = self.mailbox(rank) {
            let mut state = mb.queue.lock().expect("mailbox lock");
            state.closed = true;
            mb.ready.notify_all();
        }
    }
}
