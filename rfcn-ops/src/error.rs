use thiserror::Error;

/// The error type for kernel-level operations.
///
/// Kernels assume their geometry has already been validated by the caller;
/// these variants cover the data-dependent failures that can only be detected
/// while reading the inputs.
#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    /// An ROI record refers to a batch entry that does not exist.
    #[error("Invalid ROI batch index {value} for batch of size {batch}")]
    InvalidBatchIndex {
        /// The raw batch index stored in the ROI record.
        value: f32,
        /// The number of images in the feature batch.
        batch: usize,
    },

    /// A buffer handed to a kernel does not have the length its geometry implies.
    #[error("Buffer `{name}` has length {actual}, expected {expected}")]
    BufferLength {
        /// The logical name of the buffer.
        name: &'static str,
        /// The expected element count.
        expected: usize,
        /// The actual element count.
        actual: usize,
    },

    /// Tensor dimensions do not agree with the geometry they are used with.
    #[error("Invalid geometry: {reason}")]
    InvalidGeometry {
        /// Description of the mismatch.
        reason: String,
    },

    /// Converting between a Burn tensor and a host blob failed.
    #[error("Tensor conversion failed: {reason}")]
    TensorConversion {
        /// The reason for the failure.
        reason: String,
    },
}

/// A specialized `Result` type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Checks that a buffer of length `actual` holds exactly `expected` elements.
pub(crate) fn check_len(
    name: &'static str,
    actual: usize,
    expected: usize,
) -> KernelResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(KernelError::BufferLength {
            name,
            expected,
            actual,
        })
    }
}
