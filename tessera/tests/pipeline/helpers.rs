use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tessera::{DenseTensor, Engine, StatusCallback, Tensor, TensorContext};

/// Observable completion state for one enqueue.
pub struct Completion {
    state: Mutex<Option<tessera::Result<()>>>,
    fired: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            fired: Condvar::new(),
        })
    }

    pub fn callback(self: &Arc<Self>) -> StatusCallback {
        let me = Arc::clone(self);
        Box::new(move |status| {
            *me.state.lock().unwrap() = Some(status);
            me.fired.notify_all();
        })
    }

    /// Wait up to `timeout` for the callback; panics on timeout.
    pub fn wait(&self, timeout: Duration) -> tessera::Result<()> {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while state.is_none() {
            let left = deadline
                .checked_duration_since(std::time::Instant::now())
                .expect("enqueue did not complete in time");
            let (s, _) = self.fired.wait_timeout(state, left).unwrap();
            state = s;
        }
        state.take().expect("completion state present")
    }

    pub fn has_fired(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

/// Enqueue an in-place (input aliases output) f32 tensor on the engine's
/// default stage list and return the completion handle.
pub fn enqueue_inplace(
    engine: &Arc<Engine>,
    ctx: &Arc<TensorContext>,
    tensor: &Arc<DenseTensor>,
) -> Arc<Completion> {
    let done = Completion::new();
    engine
        .enqueue_tensor(
            ctx,
            Some(Arc::clone(tensor) as Arc<dyn Tensor>),
            Some(Arc::clone(tensor) as Arc<dyn Tensor>),
            None,
            engine.local_rank() as i32,
            0,
            0,
            done.callback(),
            engine.default_queue_list(),
        )
        .unwrap();
    done
}

pub const WAIT: Duration = Duration::from_secs(10);
