use rfcn_ops::KernelError;
use thiserror::Error;

/// The error type for layer operations.
///
/// Covers invalid layer configurations, blob shapes that do not fit a layer,
/// unsupported backward paths, and failures reported by the underlying kernels.
#[derive(Error, Debug)]
pub enum LayerError {
    /// Error for when a layer configuration is logically inconsistent.
    #[error("Invalid layer configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when an input blob has a shape the layer cannot handle.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected shape.
        expected: String,
        /// The actual shape.
        actual: String,
    },

    /// Error for when a layer is called with the wrong number of blobs.
    #[error("{layer} takes exactly {expected} {role} blob(s), got {actual}")]
    WrongBlobCount {
        /// The layer type.
        layer: &'static str,
        /// Either `"bottom"` or `"top"`.
        role: &'static str,
        /// The exact number of blobs the layer takes.
        expected: usize,
        /// The number of blobs supplied.
        actual: usize,
    },

    /// Error for when a backward path the layer does not provide is requested.
    #[error("Not implemented: {operation}")]
    NotImplemented {
        /// A description of the unsupported operation.
        operation: String,
    },

    /// Error raised by a sampling or pooling kernel.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// A specialized `Result` type for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    pub(crate) fn shape(expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::InvalidTensorShape {
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
