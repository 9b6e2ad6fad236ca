//! Error types for task-vector operations.

use thiserror::Error;

/// Errors that can occur while loading, diffing, applying or saving checkpoints.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A model identifier could not be resolved or read.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// A key expected in one mapping is absent from another.
    #[error("{key} missing from {mapping} checkpoint")]
    MissingKey {
        /// Parameter key.
        key: String,
        /// Which mapping lacks the key ("base" or "diff").
        mapping: &'static str,
    },

    /// Shape mismatch between tensors sharing a key.
    #[error("Shape mismatch at {name}: {expected:?} vs {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Shape of the tensor being updated (or subtracted from).
        expected: Vec<usize>,
        /// Shape of the other operand.
        actual: Vec<usize>,
    },

    /// Tensor stored with a dtype that cannot be realized as f32.
    #[error("Unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDtype {
        /// Tensor name.
        name: String,
        /// Stored dtype.
        dtype: String,
    },

    /// Requested compute device is unavailable.
    #[error("Device {device} unavailable: {source}")]
    Device {
        /// Requested device.
        device: taskdiff_core::Device,
        /// Backend error.
        source: candle_core::Error,
    },

    /// Realizing a tensor on the device failed, typically out of memory.
    #[error("Could not place tensor {name} on {device} (out of memory?): {source}")]
    Placement {
        /// Tensor name.
        name: String,
        /// Target device location.
        device: String,
        /// Backend error.
        source: candle_core::Error,
    },

    /// Arithmetic on a named tensor failed.
    #[error("Tensor operation failed for {name}: {source}")]
    Tensor {
        /// Tensor name.
        name: String,
        /// Backend error.
        source: candle_core::Error,
    },

    /// Tokenizer assets could not be copied.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Invalid run configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle backend error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error from the shared core or Hub crates.
    #[error(transparent)]
    Core(#[from] taskdiff_core::CoreError),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
