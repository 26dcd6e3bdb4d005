//! Runtime configuration for the engine.
//!
//! All values have defaults suitable for a single-device, single-node run.
//! Override via environment variables (prefixed `TESSERA_`) or by
//! constructing an `EngineConfig` directly.

use crate::error::{EngineError, Result};
use crate::types::{LocalRank, Rank};

/// Deployment topology and tuning parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global rank of this device across the whole job.
    pub rank: Rank,

    /// Total number of devices across the whole job.
    pub size: u32,

    /// Rank of this device within its node.
    pub local_rank: LocalRank,

    /// Number of devices on this node.
    pub local_size: u32,

    /// The local rank elected to drive collectives and inter-node traffic.
    pub root_rank: LocalRank,

    /// Index of this worker (node) among all workers.
    pub worker_id: u32,

    /// Number of workers (nodes) in the job.
    pub num_workers: u32,

    /// Whether this deployment spans multiple workers through a parameter
    /// server. A single-node run never touches the push/pull stages.
    pub distributed: bool,

    /// Maximum partition length in bytes.
    pub partition_bytes: usize,

    /// Maximum number of partitions batched under one collective group.
    pub nccl_group_size: usize,

    /// Number of parameter-server shards keys are spread over.
    pub ps_shards: u32,

    /// Optional credit budget for the push queue, in bytes. `None` disables
    /// push backpressure.
    pub push_credit_bytes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            size: 1,
            local_rank: 0,
            local_size: 1,
            root_rank: 0,
            worker_id: 0,
            num_workers: 1,
            distributed: false,
            partition_bytes: 4 * 1024 * 1024, // 4 MiB
            nccl_group_size: 4,
            ps_shards: 1,
            push_credit_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TESSERA_RANK`, `TESSERA_SIZE`
    /// - `TESSERA_LOCAL_RANK`, `TESSERA_LOCAL_SIZE`, `TESSERA_ROOT_RANK`
    /// - `TESSERA_WORKER_ID`, `TESSERA_NUM_WORKERS`
    /// - `TESSERA_DISTRIBUTED` (0/1)
    /// - `TESSERA_PARTITION_BYTES`
    /// - `TESSERA_NCCL_GROUP_SIZE`
    /// - `TESSERA_PS_SHARDS`
    /// - `TESSERA_PUSH_CREDIT_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        fn read<T: std::str::FromStr>(var: &str, into: &mut T) {
            if let Ok(v) = std::env::var(var)
                && let Ok(parsed) = v.parse::<T>()
            {
                *into = parsed;
            }
        }

        read("TESSERA_RANK", &mut cfg.rank);
        read("TESSERA_SIZE", &mut cfg.size);
        read("TESSERA_LOCAL_RANK", &mut cfg.local_rank);
        read("TESSERA_LOCAL_SIZE", &mut cfg.local_size);
        read("TESSERA_ROOT_RANK", &mut cfg.root_rank);
        read("TESSERA_WORKER_ID", &mut cfg.worker_id);
        read("TESSERA_NUM_WORKERS", &mut cfg.num_workers);
        read("TESSERA_PARTITION_BYTES", &mut cfg.partition_bytes);
        read("TESSERA_NCCL_GROUP_SIZE", &mut cfg.nccl_group_size);
        read("TESSERA_PS_SHARDS", &mut cfg.ps_shards);

        if let Ok(v) = std::env::var("TESSERA_DISTRIBUTED") {
            cfg.distributed = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("TESSERA_PUSH_CREDIT_BYTES")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.push_credit_bytes = Some(n);
        }

        cfg
    }

    /// True if this device drives collectives and inter-node traffic.
    pub fn is_root(&self) -> bool {
        self.local_rank == self.root_rank
    }

    /// Reject topologies the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 || self.size == 0 {
            return Err(EngineError::Config("world size must be nonzero".into()));
        }
        if self.local_rank >= self.local_size {
            return Err(EngineError::Config(format!(
                "local rank {} out of range for local size {}",
                self.local_rank, self.local_size
            )));
        }
        if self.root_rank >= self.local_size {
            return Err(EngineError::Config(format!(
                "root rank {} out of range for local size {}",
                self.root_rank, self.local_size
            )));
        }
        if self.partition_bytes == 0 {
            return Err(EngineError::Config("partition bound must be nonzero".into()));
        }
        if self.nccl_group_size == 0 {
            return Err(EngineError::Config("group size must be nonzero".into()));
        }
        if self.distributed && self.num_workers == 0 {
            return Err(EngineError::Config("worker count must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_single_device() {
        let cfg = EngineConfig::default();
        assert!(cfg.is_root());
        assert!(!cfg.distributed);
        assert_eq!(cfg.local_size, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_root_detection() {
        let cfg = EngineConfig {
            local_rank: 2,
            local_size: 4,
            root_rank: 2,
            ..Default::default()
        };
        assert!(cfg.is_root());

        let cfg = EngineConfig {
            local_rank: 1,
            local_size: 4,
            root_rank: 2,
            ..Default::default()
        };
        assert!(!cfg.is_root());
    }

    #[test]
    fn test_validate_rejects_bad_topology() {
        let cfg = EngineConfig {
            local_rank: 4,
            local_size: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            partition_bytes: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            nccl_group_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
