//! NTK-vector products
//!
//! Never holds a Jacobian. For every example `i` of `x1` and every kernel
//! row `k` of a leaf, one reverse pass gives `g = J1ᵀ e_k`; one forward
//! pass per example `j` of `x2` then gives `J2 g`, which is column `k` of
//! the `(i, j)` block before tracing. The `(i, k)` loop is vectorized.

use crate::kernel::{leaf_rows, KernelPlan, KernelStrategy, Side};
use ndarray::Array4;
use ntkrs_ad::transforms::{jvp_params, map_indexed, vjp_params};
use ntkrs_ad::{Network, NoTap};
use ntkrs_core::{NtkResult, Scalar, StructuredValue};
use ntkrs_planner::NtkImplementation;

/// NTK-vector-product strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct NtkVectorProducts;

impl<T: Scalar> KernelStrategy<T> for NtkVectorProducts {
    fn implementation(&self) -> NtkImplementation {
        NtkImplementation::NtkVectorProducts
    }

    fn compute(
        &self,
        network: &Network<T>,
        params: &StructuredValue<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Vec<Array4<T>>> {
        let mut blocks = plan.empty_blocks();
        for (l, leaf) in plan.leaves.iter().enumerate() {
            let rows = leaf.rows1();
            let (tr, f2) = (leaf.trace, leaf.features2());
            // columns[(i, k)][j][f2]
            let columns = map_indexed(plan.n1() * rows, |idx| {
                let (i, k) = (idx / rows, idx % rows);
                let basis = plan.basis(Side::First, l, k)?;
                let g = vjp_params(network, params, &plan.units1[i], &basis, &mut NoTap)?;
                let t = k % tr;
                plan.units2
                    .iter()
                    .map(|unit| {
                        let (_, tangent) = jvp_params(network, params, unit, &g)?;
                        let col = leaf_rows(&tangent, l, &leaf.order2)?;
                        Ok((0..f2).map(|b| col[b * tr + t]).collect::<Vec<T>>())
                    })
                    .collect::<NtkResult<Vec<_>>>()
            })?;

            let store = &mut blocks[l];
            for (idx, per_j) in columns.iter().enumerate() {
                let (i, k) = (idx / rows, idx % rows);
                let a = k / tr;
                for (j, col) in per_j.iter().enumerate() {
                    for (b, v) in col.iter().enumerate() {
                        store[[i, j, a, b]] += *v;
                    }
                }
            }
        }
        Ok(blocks)
    }
}
