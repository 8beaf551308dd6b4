//! Jacobian contraction
//!
//! The baseline strategy: materialize, per example and output leaf, the
//! Jacobian `J` of shape `(rows, params)` from one-hot VJPs, then contract
//! `J1 · J2ᵀ` and sum the trace entries. Memory grows with
//! `n · rows · params`, the largest of any strategy.

use crate::kernel::{add_block, KernelPlan, KernelStrategy, Side};
use ndarray::{Array2, Array4};
use ntkrs_ad::transforms::{grad_projection, map_indexed};
use ntkrs_ad::{Network, NoTap};
use ntkrs_core::{NtkResult, Scalar, StructuredValue};
use ntkrs_planner::NtkImplementation;

/// Jacobian-contraction strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct JacobianContraction;

impl<T: Scalar> KernelStrategy<T> for JacobianContraction {
    fn implementation(&self) -> NtkImplementation {
        NtkImplementation::JacobianContraction
    }

    fn compute(
        &self,
        network: &Network<T>,
        params: &StructuredValue<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Vec<Array4<T>>> {
        let (n1, n2) = (plan.n1(), plan.n2());
        let mut blocks = plan.empty_blocks();
        for (l, leaf) in plan.leaves.iter().enumerate() {
            let j1 = jacobians(network, params, plan, Side::First, l)?;
            let j2 = jacobians(network, params, plan, Side::Second, l)?;
            let pairs = map_indexed(n1 * n2, |idx| {
                let (i, j) = (idx / n2, idx % n2);
                Ok(leaf.trace_block(&j1[i].dot(&j2[j].t())))
            })?;
            for (idx, block) in pairs.iter().enumerate() {
                add_block(&mut blocks[l], idx / n2, idx % n2, block);
            }
        }
        Ok(blocks)
    }
}

/// Per-unit Jacobians of output leaf `leaf`, rows in kernel order
pub fn jacobians<T: Scalar>(
    network: &Network<T>,
    params: &StructuredValue<T>,
    plan: &KernelPlan<T>,
    side: Side,
    leaf: usize,
) -> NtkResult<Vec<Array2<T>>> {
    let (units, rows) = match side {
        Side::First => (&plan.units1, plan.leaves[leaf].rows1()),
        Side::Second => (&plan.units2, plan.leaves[leaf].rows2()),
    };
    let size = params.size();
    let gradients = map_indexed(units.len() * rows, |idx| {
        let (u, k) = (idx / rows, idx % rows);
        let basis = plan.basis(side, leaf, k)?;
        grad_projection(network, params, &units[u], &basis, &mut NoTap)
    })?;

    let mut out = vec![Array2::zeros((rows, size)); units.len()];
    for (idx, g) in gradients.into_iter().enumerate() {
        out[idx / rows].row_mut(idx % rows).assign(&g);
    }
    Ok(out)
}
