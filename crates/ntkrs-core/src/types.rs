//! Scalar bound and small shared aliases

use crate::error::{NtkError, NtkResult};
use ndarray::{LinalgScalar, ScalarOperand};
use num_traits::{Float, FromPrimitive, NumAssign};
use std::fmt::{Debug, Display};

/// Axis index type
pub type Axis = usize;

/// Signed axis index as supplied by callers (negative values wrap)
pub type SignedAxis = isize;

/// Tensor shape
pub type Shape = Vec<usize>;

/// Floating-point element type every ntkrs computation is generic over
///
/// Implemented for `f32` and `f64`.
pub trait Scalar:
    Float
    + FromPrimitive
    + NumAssign
    + ScalarOperand
    + LinalgScalar
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
}

impl<T> Scalar for T where
    T: Float
        + FromPrimitive
        + NumAssign
        + ScalarOperand
        + LinalgScalar
        + Default
        + Debug
        + Display
        + Send
        + Sync
        + 'static
{
}

/// Convert an `f64` constant into `T`
pub fn cast<T: Scalar>(value: f64) -> NtkResult<T> {
    T::from_f64(value)
        .ok_or_else(|| NtkError::numerical(format!("cannot represent {} as scalar", value)))
}

/// Number of elements of a shape
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
