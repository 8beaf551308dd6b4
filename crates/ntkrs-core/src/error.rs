//! Error types shared by every ntkrs crate
//!
//! All validation failures surface synchronously as an [`NtkError`]; nothing
//! is retried and no partial kernel is ever returned.
//!
//! # Examples
//!
//! ```
//! use ntkrs_core::error::{NtkError, NtkResult};
//!
//! fn check_rank(rank: usize, axis: usize) -> NtkResult<()> {
//!     if axis >= rank {
//!         return Err(NtkError::invalid_axes(format!(
//!             "axis {} out of range for rank {}",
//!             axis, rank
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_rank(2, 1).is_ok());
//! assert!(check_rank(2, 2).is_err());
//! ```

use thiserror::Error;

/// Top-level error type for kernel construction and evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NtkError {
    /// Two structured values with different nesting patterns were combined
    #[error("Structure mismatch: {0}")]
    StructureMismatch(String),

    /// Axis indices out of range, overlapping, or inconsistent between batches
    #[error("Invalid axes: {0}")]
    InvalidAxes(String),

    /// Parameter or input shapes disagree with what the network declared
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The requested strategy cannot run on this network
    #[error("Implementation unavailable: {0}")]
    ImplementationUnavailable(String),

    /// A scalar conversion failed
    #[error("Numerical error: {0}")]
    Numerical(String),
}

impl NtkError {
    /// Create a structure mismatch error
    pub fn structure_mismatch(msg: impl Into<String>) -> Self {
        Self::StructureMismatch(msg.into())
    }

    /// Create an invalid axes error
    pub fn invalid_axes(msg: impl Into<String>) -> Self {
        Self::InvalidAxes(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create an implementation unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ImplementationUnavailable(msg.into())
    }

    /// Create a numerical error
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    /// Shape mismatch between two concrete shapes
    pub fn shapes_differ(context: &str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch(format!(
            "{}: expected {:?}, got {:?}",
            context, expected, got
        ))
    }
}

/// Result alias used throughout ntkrs
pub type NtkResult<T> = Result<T, NtkError>;
