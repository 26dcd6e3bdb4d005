//! C ABI for front-ends in other languages.
//!
//! Wraps one process-global engine configured from `TESSERA_*` environment
//! variables, backed by the in-process CPU implementations of the external
//! interfaces. Deployments that embed accelerator backends use the library
//! API directly.

use std::sync::{Arc, OnceLock};

use tracing::error;

use crate::collective::{CpuCollective, CpuCollectiveNode};
use crate::config::EngineConfig;
use crate::device::CpuRuntime;
use crate::engine::{Engine, EngineDeps};
use crate::ps::LocalPsServer;
use crate::signal::{LocalSignalBus, SignalBus};

static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();

fn global() -> Option<&'static Arc<Engine>> {
    GLOBAL.get()
}

/// Initialize the process-global engine from the environment.
/// Returns 0 on success, -1 on failure or repeated initialization.
#[unsafe(no_mangle)]
pub extern "C" fn tessera_init() -> i32 {
    if GLOBAL.get().is_some() {
        error!("tessera_init called twice");
        return -1;
    }
    let config = EngineConfig::from_env();

    // One OS process hosts exactly one rank here; in-process signaling and
    // collectives cannot span processes.
    if config.local_size != 1 {
        error!(
            local_size = config.local_size,
            "the C entry point only hosts single-device nodes"
        );
        return -1;
    }

    let runtime = CpuRuntime::new();
    let node = CpuCollectiveNode::new(1);
    let collective = CpuCollective::new(node, Arc::clone(&runtime), config.local_rank);
    let mut deps = EngineDeps::new(
        runtime,
        collective,
        LocalSignalBus::new(1) as Arc<dyn SignalBus>,
    );
    if config.distributed {
        if config.num_workers != 1 {
            error!(
                num_workers = config.num_workers,
                "the C entry point cannot reach out-of-process workers"
            );
            return -1;
        }
        deps = deps.with_ps(LocalPsServer::new(1).client(config.worker_id));
    }

    match Engine::init(config, deps) {
        Ok(engine) => {
            let _ = GLOBAL.set(engine);
            0
        }
        Err(e) => {
            error!(error = %e, "engine init failed");
            -1
        }
    }
}

/// Shut the process-global engine down. Returns 0, or -1 if never
/// initialized.
#[unsafe(no_mangle)]
pub extern "C" fn tessera_shutdown() -> i32 {
    match global() {
        Some(engine) => {
            engine.shutdown();
            0
        }
        None => -1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tessera_rank() -> i32 {
    global().map_or(-1, |e| e.rank() as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn tessera_local_rank() -> i32 {
    global().map_or(-1, |e| e.local_rank() as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn tessera_size() -> i32 {
    global().map_or(-1, |e| e.size() as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn tessera_local_size() -> i32 {
    global().map_or(-1, |e| e.local_size() as i32)
}
