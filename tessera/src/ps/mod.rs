//! The parameter-server client interface.
//!
//! Push/pull are asynchronous: they return a wait handle and invoke an
//! optional continuation on completion. The pipeline only ever uses the
//! continuation form; the blocking `wait` exists for tensor initialization.

mod local;

pub use local::{LocalPsClient, LocalPsServer};

use crate::error::Result;
use crate::types::Key;

/// Server-addressable key/length shards for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsKv {
    pub keys: Vec<Key>,
    pub lens: Vec<usize>,
}

/// Handle returned by asynchronous push/pull, consumable by `wait`.
pub type PsHandle = u64;

/// Completion continuation for asynchronous push/pull.
pub type PsCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait PsClient: Send + Sync {
    /// Asynchronously push `len` bytes at `src` under the given shards.
    ///
    /// # Safety
    /// `src` must stay valid for `len` bytes until the operation completes
    /// (continuation invoked or `wait` returns).
    unsafe fn zpush(
        &self,
        kv: &PsKv,
        src: u64,
        len: usize,
        cmd: i32,
        cb: Option<PsCallback>,
    ) -> Result<PsHandle>;

    /// Asynchronously pull the aggregated value into `len` bytes at `dst`.
    ///
    /// # Safety
    /// `dst` must stay valid and exclusively writable for `len` bytes until
    /// the operation completes.
    unsafe fn zpull(
        &self,
        kv: &PsKv,
        dst: u64,
        len: usize,
        cmd: i32,
        cb: Option<PsCallback>,
    ) -> Result<PsHandle>;

    /// Block until the operation behind `handle` completes. Used only during
    /// tensor initialization.
    fn wait(&self, handle: PsHandle) -> Result<()>;

    /// Synchronize all workers in `group`. Used only during tensor
    /// initialization.
    fn barrier(&self, group: u32) -> Result<()>;
}
