//! Errors reported by the ROI pooling operator.
//!
//! Only caller-supplied data can fail: a malformed regions tensor, buffers of
//! the wrong shape, or a backward call with nothing to route. Every failing
//! call returns before touching its output buffers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoiPoolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoiPoolError {
    /// Pooled size or spatial scale is out of range.
    #[error("invalid ROI pooling config: {0}")]
    InvalidConfig(String),

    /// A region refers to a sample that isn't in the batch.
    #[error("region {roi} has batch index {batch_index}, but the batch has {batch_size} samples")]
    BatchIndexOutOfRange {
        roi: usize,
        batch_index: f32,
        batch_size: usize,
    },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Rows that can't be viewed as frames without copying.
    #[error("{what} must be contiguous in standard (row-major) layout")]
    NotContiguous { what: &'static str },

    #[error("backward called without a matching forward pass")]
    NoForwardPass,
}

impl RoiPoolError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        RoiPoolError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
