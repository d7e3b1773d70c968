use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, FlagcxError>;

#[derive(Debug, thiserror::Error)]
pub enum FlagcxError {
    #[error("invalid group configuration: {reason}")]
    GroupConfig { reason: String },

    #[error("channel to rank {rank} could not be established: {reason}")]
    Connect { rank: Rank, reason: String },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} transfer with rank {peer} failed: {reason}")]
    Transfer {
        operation: &'static str,
        peer: Rank,
        reason: String,
    },

    #[error("process group '{group}' has been destroyed")]
    GroupDestroyed { group: String },

    #[error("process group '{group}' is unusable after an earlier failure: {reason}")]
    GroupUnusable { group: String, reason: String },

    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error(
        "count {count} is not evenly divisible by group size {size} (required by {operation})"
    )]
    IndivisibleCount {
        count: usize,
        size: usize,
        operation: &'static str,
    },

    #[error("store operation on key '{key}' failed: {reason}")]
    Store { key: String, reason: String },

    #[error("store key '{key}' not available after {timeout_ms}ms")]
    StoreTimeout { key: String, timeout_ms: u64 },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlagcxError {
    /// Create a `GroupConfig` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::GroupConfig {
            reason: reason.into(),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transfer` error.
    pub fn transfer(operation: &'static str, peer: Rank, reason: impl Into<String>) -> Self {
        Self::Transfer {
            operation,
            peer,
            reason: reason.into(),
        }
    }

    /// Create a `Connect` error.
    pub fn connect(rank: Rank, reason: impl Into<String>) -> Self {
        Self::Connect {
            rank,
            reason: reason.into(),
        }
    }

    /// Whether this error leaves the owning group unusable.
    ///
    /// Argument errors are raised before anything touches the wire, so the
    /// group stays healthy. Everything on the data path poisons it.
    pub fn is_fatal_to_group(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Device { .. }
                | Self::Transfer { .. }
                | Self::DecodeFailed(_)
                | Self::Io(_)
        )
    }
}
