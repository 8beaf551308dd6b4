//! Function transforms over networks
//!
//! - [`vjp_params`] / [`jvp_params`]: parameter-space derivatives of the
//!   network at a fixed input
//! - [`split_batch`] / [`vmap`]: split a structured batch into
//!   single-example units along per-leaf batch axes and map over them
//! - [`map_indexed`]: the same vectorization for index loops (basis vectors)
//!
//! With the `parallel` feature the maps run on the rayon thread pool;
//! results always come back in index order.

use crate::layer::{Network, PrimitiveTap, Tree};
use ntkrs_core::{NtTree, NtkError, NtkResult, Scalar};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Cotangent of the parameters for output cotangent `cotangent`
///
/// Every affine primitive reports to `tap` along the way.
pub fn vjp_params<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    cotangent: &Tree<T>,
    tap: &mut dyn PrimitiveTap<T>,
) -> NtkResult<Tree<T>> {
    let (param_ct, _) = network.layer().vjp(params, input, cotangent, tap)?;
    Ok(param_ct)
}

/// Output and output tangent along a parameter direction; the input is held fixed
pub fn jvp_params<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    params_dot: &Tree<T>,
) -> NtkResult<(Tree<T>, Tree<T>)> {
    network
        .layer()
        .jvp(params, input, params_dot, &input.zeros_like())
}

/// Gradient of `⟨f(params, input), cotangent⟩` flattened to one vector
pub fn grad_projection<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    cotangent: &Tree<T>,
    tap: &mut dyn PrimitiveTap<T>,
) -> NtkResult<ndarray::Array1<T>> {
    Ok(vjp_params(network, params, input, cotangent, tap)?.ravel().0)
}

/// Common size of the batched leaves; `None` when no leaf is batched
///
/// Fails with [`NtkError::ShapeMismatch`] when batched leaves disagree.
pub fn batch_size<T: Scalar>(
    value: &Tree<T>,
    axes: &NtTree<Option<usize>>,
) -> NtkResult<Option<usize>> {
    let sizes = value.zip_with(axes, |leaf, axis| match axis {
        Some(a) => leaf.shape().get(*a).copied().map(Some).ok_or_else(|| {
            NtkError::invalid_axes(format!(
                "batch axis {} out of range for shape {:?}",
                a,
                leaf.shape()
            ))
        }),
        None => Ok(None),
    })?;
    let mut found: Option<usize> = None;
    for size in sizes.leaves().into_iter().flatten() {
        match found {
            Some(n) if n != *size => {
                return Err(NtkError::shape_mismatch(format!(
                    "batched leaves disagree on the batch size: {} vs {}",
                    n, size
                )))
            }
            _ => found = Some(*size),
        }
    }
    Ok(found)
}

/// Split `value` into single-example units
///
/// Batched leaves keep their batch axis with size 1; unbatched leaves are
/// shared unchanged by every unit. With no batched leaf the whole value is
/// one unit.
pub fn split_batch<T: Scalar>(
    value: &Tree<T>,
    axes: &NtTree<Option<usize>>,
) -> NtkResult<Vec<Tree<T>>> {
    match batch_size(value, axes)? {
        None => Ok(vec![value.clone()]),
        Some(n) => (0..n)
            .map(|i| {
                value.zip_with(axes, |leaf, axis| match axis {
                    Some(a) => leaf.select_example(*a, i),
                    None => Ok(leaf.clone()),
                })
            })
            .collect(),
    }
}

/// Map `f` over the single-example units of `value`
pub fn vmap<T, R, F>(value: &Tree<T>, axes: &NtTree<Option<usize>>, f: F) -> NtkResult<Vec<R>>
where
    T: Scalar,
    R: Send,
    F: Fn(&Tree<T>) -> NtkResult<R> + Send + Sync,
{
    let units = split_batch(value, axes)?;
    map_indexed(units.len(), |i| f(&units[i]))
}

/// Evaluate `f(0), …, f(n - 1)`, in parallel when the feature is enabled
pub fn map_indexed<R, F>(n: usize, f: F) -> NtkResult<Vec<R>>
where
    R: Send,
    F: Fn(usize) -> NtkResult<R> + Send + Sync,
{
    #[cfg(feature = "parallel")]
    {
        (0..n).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..n).map(f).collect()
    }
}
