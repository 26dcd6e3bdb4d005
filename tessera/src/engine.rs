//! Engine lifecycle and public entry points: init/shutdown, tensor
//! declaration and initialization, and the enqueue path that carves a tensor
//! into pipelined partitions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, trace, warn};

use crate::collective::{CollectiveComm, CpuCollective, CpuCollectiveNode};
use crate::config::EngineConfig;
use crate::device::{AcceleratorRuntime, CpuRuntime};
use crate::error::{EngineError, Result};
use crate::loops::{
    fatal, run_coordinate_once, run_copy_d2h_once, run_copy_h2d_once,
    run_follower_collective_once, run_pull_once, run_push_once, run_root_collective_once,
    run_sync_collective_once,
};
use crate::ps::{LocalPsServer, PsClient};
use crate::registry::Registry;
use crate::signal::{LocalSignalBus, SignalBus};
use crate::task::{CallbackCell, StatusCallback, TensorContext, TensorTask, partition_task};
use crate::tensor::{ReadyEvent, Tensor};
use crate::transform::{GradientTransform, IdentityTransform};
use crate::types::{DataType, DeviceId, QueueKind, Rank, RequestType, command};

/// The external collaborators an engine is wired to.
pub struct EngineDeps {
    pub runtime: Arc<dyn AcceleratorRuntime>,
    pub collective: Arc<dyn CollectiveComm>,
    pub bus: Arc<dyn SignalBus>,
    pub ps: Option<Arc<dyn PsClient>>,
    pub transform: Arc<dyn GradientTransform>,
}

impl EngineDeps {
    pub fn new(
        runtime: Arc<dyn AcceleratorRuntime>,
        collective: Arc<dyn CollectiveComm>,
        bus: Arc<dyn SignalBus>,
    ) -> Self {
        Self {
            runtime,
            collective,
            bus,
            ps: None,
            transform: Arc::new(IdentityTransform),
        }
    }

    pub fn with_ps(mut self, ps: Arc<dyn PsClient>) -> Self {
        self.ps = Some(ps);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn GradientTransform>) -> Self {
        self.transform = transform;
        self
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Build the registry and start the role-appropriate stage loops.
    pub fn init(config: EngineConfig, deps: EngineDeps) -> Result<Arc<Self>> {
        config.validate()?;
        if config.distributed && deps.ps.is_none() {
            return Err(EngineError::Config(
                "distributed deployment needs a parameter-server client".into(),
            ));
        }

        let registry = Registry::new(
            config,
            deps.bus,
            deps.runtime,
            deps.collective,
            deps.ps,
            deps.transform,
        )?;
        let engine = Arc::new(Self {
            registry,
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        engine.start()?;

        let cfg = &engine.registry.config;
        info!(
            rank = cfg.rank,
            local_rank = cfg.local_rank,
            local_size = cfg.local_size,
            root = cfg.is_root(),
            distributed = cfg.distributed,
            "engine started"
        );
        Ok(engine)
    }

    fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock().expect("thread table lock");
        let cfg = &self.registry.config;

        if cfg.is_root() {
            threads.push(self.spawn_loop("root_collective", true, run_root_collective_once)?);
            threads.push(self.spawn_loop("sync_collective", true, run_sync_collective_once)?);
            if cfg.distributed {
                threads.push(self.spawn_loop("copy_d2h", true, run_copy_d2h_once)?);
                threads.push(self.spawn_loop("push", false, run_push_once)?);
                threads.push(self.spawn_loop("pull", false, run_pull_once)?);
                threads.push(self.spawn_loop("copy_h2d", true, run_copy_h2d_once)?);
            }
        } else {
            threads.push(self.spawn_loop("coordinate_reduce", false, |reg| {
                run_coordinate_once(reg, QueueKind::CoordinateReduce)
            })?);
            threads.push(self.spawn_loop("follower_collective", true, run_follower_collective_once)?);
            threads.push(self.spawn_loop("sync_collective", true, run_sync_collective_once)?);
            threads.push(self.spawn_loop("coordinate_broadcast", false, |reg| {
                run_coordinate_once(reg, QueueKind::CoordinateBroadcast)
            })?);
        }
        Ok(())
    }

    fn spawn_loop<F>(&self, name: &str, bind_device: bool, f: F) -> Result<JoinHandle<()>>
    where
        F: Fn(&Arc<Registry>) -> Result<()> + Send + 'static,
    {
        let reg = Arc::clone(&self.registry);
        std::thread::Builder::new()
            .name(format!("tessera-{name}"))
            .spawn(move || {
                if bind_device
                    && let Err(e) = reg.runtime.set_device(reg.config.local_rank as DeviceId)
                {
                    fatal(&e);
                }
                while !reg.should_shutdown() {
                    match f(&reg) {
                        Ok(()) => {}
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => fatal(&e),
                    }
                }
            })
            .map_err(|e| EngineError::runtime_with_source("failed to spawn stage thread", e))
    }

    /// Flip the shutdown flag, wake every blocked stage, join all stage
    /// threads, then release engine-owned pinned buffers.
    ///
    /// In-flight partitions are abandoned: their callbacks never fire.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let reg = &self.registry;

        let in_flight: usize = reg.all_queues().iter().map(|q| q.pending()).sum();
        if in_flight > 0 {
            warn!(in_flight, "abandoning in-flight partitions at shutdown");
        }

        reg.request_shutdown();
        reg.bus.close(reg.config.local_rank);
        reg.runtime.shutdown();

        let threads = std::mem::take(&mut *self.threads.lock().expect("thread table lock"));
        for t in threads {
            let _ = t.join();
        }

        for ctx in reg.contexts_snapshot() {
            let ptr = ctx.cpubuff();
            if ptr != 0 && !ctx.reuses_buffer() {
                let _ = reg.runtime.free_pinned(ptr);
            }
        }
        info!(rank = reg.config.rank, "engine shut down");
    }

    // ── Registry reads ───────────────────────────────────────────────

    pub fn rank(&self) -> Rank {
        self.registry.config.rank
    }

    pub fn local_rank(&self) -> u32 {
        self.registry.config.local_rank
    }

    pub fn size(&self) -> u32 {
        self.registry.config.size
    }

    pub fn local_size(&self) -> u32 {
        self.registry.config.local_size
    }

    pub fn is_root(&self) -> bool {
        self.registry.config.is_root()
    }

    pub fn is_distributed(&self) -> bool {
        self.registry.config.distributed
    }

    /// The stage list a reduce-broadcast round traverses for this rank's
    /// role and deployment mode.
    pub fn default_queue_list(&self) -> Vec<QueueKind> {
        let cfg = &self.registry.config;
        if cfg.is_root() {
            if cfg.distributed {
                vec![
                    QueueKind::Reduce,
                    QueueKind::CopyD2H,
                    QueueKind::Push,
                    QueueKind::Pull,
                    QueueKind::CopyH2D,
                    QueueKind::Broadcast,
                ]
            } else {
                vec![QueueKind::Reduce, QueueKind::Broadcast]
            }
        } else {
            vec![
                QueueKind::CoordinateReduce,
                QueueKind::Reduce,
                QueueKind::CoordinateBroadcast,
                QueueKind::Broadcast,
            ]
        }
    }

    // ── Tensor lifecycle ─────────────────────────────────────────────

    /// Declare (or re-fetch) a tensor's context. Declaration order must be
    /// identical on every rank: partition keys are assigned positionally.
    pub fn declare_tensor(&self, name: &str, size: usize) -> Result<Arc<TensorContext>> {
        self.registry.context(name, size)
    }

    /// Initialize a declared tensor: allocate (or adopt) the pinned host
    /// staging buffer on the root, seed the parameter server from worker 0,
    /// and synchronize all workers once per partition.
    pub fn init_tensor(
        &self,
        name: &str,
        size: usize,
        dtype: DataType,
        host_buffer: Option<u64>,
    ) -> Result<Arc<TensorContext>> {
        let ctx = self.registry.context(name, size)?;
        if ctx.initialized() {
            return Ok(ctx);
        }
        let cfg = &self.registry.config;

        let (cpubuff, reuse) = if cfg.is_root() {
            match host_buffer {
                Some(ptr) => (ptr, true),
                None => (self.registry.runtime.alloc_pinned(size)?, false),
            }
        } else {
            (0, false)
        };

        if cfg.distributed && cfg.is_root() {
            let ps = self.registry.ps()?;
            let bound = cfg.partition_bytes;
            let mut accumulated = 0usize;
            let mut i = 0usize;
            while accumulated < size {
                let key = ctx.key_list[i];
                let len = (size - accumulated).min(bound);

                // Only worker 0 seeds the server; everyone synchronizes.
                if cfg.worker_id == 0 {
                    let pskv = self.registry.encode_key(key, len);
                    let cmd = command(RequestType::DefaultPushPull, dtype);
                    let handle = unsafe {
                        ps.zpush(&pskv, cpubuff + accumulated as u64, len, cmd, None)?
                    };
                    ps.wait(handle)?;
                }
                ps.barrier(0)?;

                accumulated += len;
                i += 1;
            }
        }

        ctx.mark_initialized(cpubuff, reuse);
        trace!(name, size, parts = ctx.key_list.len(), "tensor initialized");
        Ok(ctx)
    }

    pub fn is_tensor_initialized(&self, name: &str, size: usize) -> bool {
        self.registry
            .lookup_context(name)
            .is_some_and(|ctx| ctx.buff_len == size && ctx.initialized())
    }

    // ── Enqueue ──────────────────────────────────────────────────────

    /// Carve `input`/`output` into partitions and start them down
    /// `queue_list`. Completion (success or user error) is reported through
    /// `callback`, exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_tensor(
        &self,
        ctx: &Arc<TensorContext>,
        input: Option<Arc<dyn Tensor>>,
        output: Option<Arc<dyn Tensor>>,
        ready_event: Option<Arc<dyn ReadyEvent>>,
        device: DeviceId,
        priority: i32,
        version: u64,
        callback: StatusCallback,
        queue_list: Vec<QueueKind>,
    ) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        let cell = CallbackCell::new(callback);

        // User errors: report through the callback, leave the engine
        // untouched.
        if let Err(e) = Self::validate_enqueue(ctx, input.as_deref(), output.as_deref()) {
            cell.fire(Err(e));
            return Ok(());
        }

        let size = input
            .as_deref()
            .or(output.as_deref())
            .map(Tensor::size)
            .unwrap_or(0);

        let whole = TensorTask {
            name: ctx.name.clone(),
            key: 0,
            device,
            priority,
            version,
            tensor: input,
            output,
            offset: 0,
            len: size,
            cpubuff: ctx.cpubuff(),
            ready_event,
            stages: queue_list.clone().into(),
            cursor: AtomicUsize::new(0),
            counter: Arc::new(AtomicUsize::new(0)),
            total_parts: ctx.key_list.len(),
            callback: Arc::clone(&cell),
        };

        let mut partitions = partition_task(&whole, self.registry.config.partition_bytes);
        if partitions.len() != ctx.key_list.len() {
            cell.fire(Err(EngineError::PartitionCountMismatch {
                name: ctx.name.clone(),
                parts: partitions.len(),
                keys: ctx.key_list.len(),
            }));
            return Ok(());
        }

        if queue_list.is_empty() {
            trace!(name = %ctx.name, "empty stage list, completing immediately");
            cell.fire(Ok(()));
            return Ok(());
        }

        let head = queue_list[0];
        for (i, mut task) in partitions.drain(..).enumerate() {
            task.key = ctx.key_list[i];
            trace!(
                rank = self.registry.config.rank,
                name = %task.name,
                key = task.key,
                offset = task.offset,
                len = task.len,
                "enqueued partition"
            );
            self.registry.queue(head).add_task(Arc::new(task));
        }
        Ok(())
    }

    fn validate_enqueue(
        ctx: &TensorContext,
        input: Option<&dyn Tensor>,
        output: Option<&dyn Tensor>,
    ) -> Result<()> {
        if let (Some(i), Some(o)) = (input, output)
            && i.size() != o.size()
        {
            return Err(EngineError::SizeMismatch {
                name: ctx.name.clone(),
                input: i.size(),
                output: o.size(),
            });
        }
        let buffer = input.or(output).ok_or_else(|| EngineError::Config(format!(
            "tensor {}: enqueue carries neither input nor output",
            ctx.name
        )))?;
        if buffer.num_elements() == 0 || buffer.size() % buffer.num_elements() != 0 {
            return Err(EngineError::RaggedElementSize {
                name: ctx.name.clone(),
                size: buffer.size(),
                elements: buffer.num_elements(),
            });
        }
        if !ctx.initialized() {
            return Err(EngineError::UninitializedTensor {
                name: ctx.name.clone(),
            });
        }
        Ok(())
    }

    // ── In-process cluster constructors ──────────────────────────────

    /// One node with `local_size` device ranks as threads of this process:
    /// shared signal bus, shared collective coordinator, no parameter
    /// server. Rank 0 is the root.
    pub fn bootstrap_local(local_size: u32) -> Result<Vec<Arc<Engine>>> {
        Self::bootstrap_local_with(local_size, EngineConfig::default())
    }

    /// `bootstrap_local` with tuning fields (partition bound, group size,
    /// credits) taken from `base`; topology fields are overwritten.
    pub fn bootstrap_local_with(local_size: u32, base: EngineConfig) -> Result<Vec<Arc<Engine>>> {
        let bus = LocalSignalBus::new(local_size);
        let node = CpuCollectiveNode::new(local_size);

        (0..local_size)
            .map(|r| {
                let runtime = CpuRuntime::new();
                let collective =
                    CpuCollective::new(Arc::clone(&node), Arc::clone(&runtime), r);
                let config = EngineConfig {
                    rank: r,
                    size: local_size,
                    local_rank: r,
                    local_size,
                    root_rank: 0,
                    worker_id: 0,
                    num_workers: 1,
                    distributed: false,
                    ..base.clone()
                };
                Engine::init(
                    config,
                    EngineDeps::new(runtime, collective, Arc::clone(&bus) as Arc<dyn SignalBus>),
                )
            })
            .collect()
    }

    /// `num_workers` single-device workers joined through an in-process
    /// parameter server. Every worker is its own root.
    pub fn bootstrap_distributed(num_workers: u32) -> Result<Vec<Arc<Engine>>> {
        Self::bootstrap_distributed_with(num_workers, EngineConfig::default())
    }

    pub fn bootstrap_distributed_with(
        num_workers: u32,
        base: EngineConfig,
    ) -> Result<Vec<Arc<Engine>>> {
        let server = LocalPsServer::new(num_workers);

        (0..num_workers)
            .map(|w| {
                let runtime = CpuRuntime::new();
                let node = CpuCollectiveNode::new(1);
                let collective = CpuCollective::new(node, Arc::clone(&runtime), 0);
                let config = EngineConfig {
                    rank: w,
                    size: num_workers,
                    local_rank: 0,
                    local_size: 1,
                    root_rank: 0,
                    worker_id: w,
                    num_workers,
                    distributed: true,
                    ..base.clone()
                };
                Engine::init(
                    config,
                    EngineDeps::new(
                        runtime,
                        collective,
                        LocalSignalBus::new(1) as Arc<dyn SignalBus>,
                    )
                    .with_ps(server.client(w)),
                )
            })
            .collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DenseTensor;
    use std::sync::atomic::AtomicUsize;

    fn single() -> Arc<Engine> {
        Engine::bootstrap_local(1).unwrap().remove(0)
    }

    #[test]
    fn test_default_queue_lists_per_role() {
        let engine = single();
        assert_eq!(
            engine.default_queue_list(),
            vec![QueueKind::Reduce, QueueKind::Broadcast]
        );

        let cluster = Engine::bootstrap_local(2).unwrap();
        assert_eq!(
            cluster[1].default_queue_list(),
            vec![
                QueueKind::CoordinateReduce,
                QueueKind::Reduce,
                QueueKind::CoordinateBroadcast,
                QueueKind::Broadcast,
            ]
        );
        for e in &cluster {
            e.shutdown();
        }
    }

    #[test]
    fn test_distributed_root_queue_list() {
        let workers = Engine::bootstrap_distributed(1).unwrap();
        assert_eq!(
            workers[0].default_queue_list(),
            vec![
                QueueKind::Reduce,
                QueueKind::CopyD2H,
                QueueKind::Push,
                QueueKind::Pull,
                QueueKind::CopyH2D,
                QueueKind::Broadcast,
            ]
        );
        workers[0].shutdown();
    }

    #[test]
    fn test_empty_queue_list_completes_synchronously() {
        let engine = single();
        let ctx = engine.init_tensor("t", 16, DataType::F32, None).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let tensor = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        engine
            .enqueue_tensor(
                &ctx,
                Some(tensor.clone() as Arc<dyn Tensor>),
                Some(tensor as Arc<dyn Tensor>),
                None,
                0,
                0,
                0,
                Box::new(move |s| {
                    assert!(s.is_ok());
                    f.fetch_add(1, Ordering::SeqCst);
                }),
                vec![],
            )
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        engine.shutdown();
    }

    #[test]
    fn test_size_mismatch_fails_through_callback() {
        let engine = single();
        let ctx = engine.init_tensor("t", 16, DataType::F32, None).unwrap();

        let status: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&status);
        let input = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let output = DenseTensor::zeros(8, DataType::F32);
        engine
            .enqueue_tensor(
                &ctx,
                Some(input as Arc<dyn Tensor>),
                Some(output as Arc<dyn Tensor>),
                None,
                0,
                0,
                0,
                Box::new(move |st| {
                    *s.lock().unwrap() = Some(st);
                }),
                engine.default_queue_list(),
            )
            .unwrap();

        let status = status.lock().unwrap().take().expect("callback fired");
        assert!(matches!(status, Err(EngineError::SizeMismatch { .. })));
        // Nothing entered the pipeline.
        for q in engine.registry.all_queues() {
            assert_eq!(q.pending(), 0);
        }
        engine.shutdown();
    }

    #[test]
    fn test_uninitialized_tensor_rejected() {
        let engine = single();
        let ctx = engine.declare_tensor("cold", 16).unwrap();
        let status: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&status);
        let tensor = DenseTensor::from_f32(&[0.0; 4]);
        engine
            .enqueue_tensor(
                &ctx,
                Some(tensor.clone() as Arc<dyn Tensor>),
                Some(tensor as Arc<dyn Tensor>),
                None,
                0,
                0,
                0,
                Box::new(move |st| {
                    *s.lock().unwrap() = Some(st);
                }),
                engine.default_queue_list(),
            )
            .unwrap();
        assert!(matches!(
            status.lock().unwrap().take(),
            Some(Err(EngineError::UninitializedTensor { .. }))
        ));
        engine.shutdown();
    }

    #[test]
    fn test_is_tensor_initialized_checks_size() {
        let engine = single();
        assert!(!engine.is_tensor_initialized("t", 16));
        engine.init_tensor("t", 16, DataType::F32, None).unwrap();
        assert!(engine.is_tensor_initialized("t", 16));
        assert!(!engine.is_tensor_initialized("t", 32));
        engine.shutdown();
    }
}
