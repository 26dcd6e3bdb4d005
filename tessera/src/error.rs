use crate::types::{DataType, DeviceId, Key, QueueKind};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is shutting down")]
    Shutdown,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("tensor {name}: input size {input} does not match output size {output}")]
    SizeMismatch {
        name: String,
        input: usize,
        output: usize,
    },

    #[error("tensor {name} has not been initialized")]
    UninitializedTensor { name: String },

    #[error(
        "tensor {name}: {parts} partitions do not match the {keys} keys allocated at declaration"
    )]
    PartitionCountMismatch {
        name: String,
        parts: usize,
        keys: usize,
    },

    #[error("tensor {name}: byte size {size} is not a multiple of element count {elements}")]
    RaggedElementSize {
        name: String,
        size: usize,
        elements: usize,
    },

    #[error("key {key} not found on {queue} queue")]
    KeyNotFound { key: Key, queue: QueueKind },

    #[error("signal channel error: {0}")]
    Signal(String),

    #[error("unexpected signal from local rank {src}, expected root {root}")]
    SignalNotFromRoot { src: u32, root: u32 },

    #[error("collective error: {0}")]
    Collective(String),

    #[error("accelerator runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("parameter server error: {0}")]
    Ps(String),

    #[error("unsupported data type {dtype:?} for {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("invalid device id {device}")]
    InvalidDevice { device: DeviceId },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl EngineError {
    /// Create a `Runtime` error with just a message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Runtime` error with a message and a source error.
    pub fn runtime_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Runtime {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for errors that mean "stop the loop", not "the process is broken".
    pub fn is_shutdown(&self) -> bool {
        matches!(self, EngineError::Shutdown)
    }
}
