use cudarc::nccl::result::NcclError;

pub type Result<T> = std::result::Result<T, CudaBackendError>;

#[derive(Debug, thiserror::Error)]
pub enum CudaBackendError {
    #[error("NCCL error: {0:?}")]
    Nccl(NcclError),

    #[error("CUDA driver error: {0}")]
    CudaDriver(#[from] cudarc::driver::result::DriverError),

    #[error("engine error: {0}")]
    Engine(#[from] tessera::EngineError),

    #[error("communicator bootstrap failed: {reason}")]
    Bootstrap { reason: String },
}

impl From<NcclError> for CudaBackendError {
    fn from(e: NcclError) -> Self {
        CudaBackendError::Nccl(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_display() {
        let e = CudaBackendError::Bootstrap {
            reason: "id exchange timed out".into(),
        };
        assert!(e.to_string().contains("id exchange timed out"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let e: CudaBackendError = tessera::EngineError::Shutdown.into();
        assert!(e.to_string().contains("shutting down"));
    }
}
