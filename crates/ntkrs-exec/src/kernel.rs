//! Per-call kernel plan
//!
//! A [`KernelPlan`] holds everything the strategies share for one call:
//! the single-example units of both batches, the canonical axis roles of
//! every output leaf, and for each side the map from kernel row order to
//! the natural (row-major) element order of a unit's output leaf.
//!
//! Kernel rows of a leaf are ordered `k = f·T + t`, with `f` the flat index
//! over feature axes and `t` the flat index over trace axes. Every strategy
//! produces, per leaf, a block store of shape `(n1, n2, F1, F2)`;
//! [`KernelPlan::finish`] turns those into the public layout.

use ndarray::{Array2, Array4, Axis as NdAxis};
use ntkrs_ad::transforms::{batch_size, split_batch};
use ntkrs_ad::{Network, Tree};
use ntkrs_core::{
    normalize_output_axes, BatchAxes, DenseND, LeafAxes, NtTree, NtkError, NtkResult, Scalar,
    Shapes, StructuredValue, TraceAxes, TreeDef, VmapAxes,
};
use ntkrs_planner::{NetworkStats, NtkImplementation, OutputStats, ProblemStats};

/// Axis roles and element orders of one output leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPlan {
    /// Canonical axes of the unit output leaf
    pub axes: LeafAxes,
    /// Unit output shape for the first batch
    pub shape1: Vec<usize>,
    /// Unit output shape for the second batch
    pub shape2: Vec<usize>,
    /// Natural element index of kernel row `k`, first batch
    pub order1: Vec<usize>,
    /// Natural element index of kernel row `k`, second batch
    pub order2: Vec<usize>,
    /// Product of trace axis sizes
    pub trace: usize,
}

impl LeafPlan {
    fn new(axes: LeafAxes, shape1: Vec<usize>, shape2: Vec<usize>) -> NtkResult<Self> {
        let trace_dims = |shape: &[usize]| -> Vec<usize> {
            axes.trace.iter().map(|&a| shape[a]).collect()
        };
        if trace_dims(&shape1) != trace_dims(&shape2) {
            return Err(NtkError::shape_mismatch(format!(
                "trace axes {:?} differ in size between batches: {:?} vs {:?}",
                axes.trace, shape1, shape2
            )));
        }
        if let Some(b) = axes.batch {
            if shape1[b] != 1 || shape2[b] != 1 {
                return Err(NtkError::invalid_axes(format!(
                    "output batch axis {} does not carry the example dimension ({:?}, {:?})",
                    b, shape1, shape2
                )));
            }
        }
        let trace = trace_dims(&shape1).iter().product();
        let order1 = row_order(&axes, &shape1)?;
        let order2 = row_order(&axes, &shape2)?;
        Ok(Self {
            axes,
            shape1,
            shape2,
            order1,
            order2,
            trace,
        })
    }

    /// Feature dimensions of the first batch
    pub fn dims1(&self) -> Vec<usize> {
        self.axes.features.iter().map(|&a| self.shape1[a]).collect()
    }

    /// Feature dimensions of the second batch
    pub fn dims2(&self) -> Vec<usize> {
        self.axes.features.iter().map(|&a| self.shape2[a]).collect()
    }

    /// Feature elements per example, first batch
    pub fn features1(&self) -> usize {
        self.dims1().iter().product()
    }

    /// Feature elements per example, second batch
    pub fn features2(&self) -> usize {
        self.dims2().iter().product()
    }

    /// Kernel rows per example, first batch
    pub fn rows1(&self) -> usize {
        self.order1.len()
    }

    /// Kernel rows per example, second batch
    pub fn rows2(&self) -> usize {
        self.order2.len()
    }

    /// Sum the diagonal trace entries of a row-by-row block
    ///
    /// `c` is `(F1·T, F2·T)`; the result is `(F1, F2)` with
    /// `out[f1, f2] = Σ_t c[f1·T + t, f2·T + t]`.
    pub fn trace_block<T: Scalar>(&self, c: &Array2<T>) -> Array2<T> {
        let tr = self.trace;
        let (f1, f2) = (self.features1(), self.features2());
        let mut out = Array2::zeros((f1, f2));
        for a in 0..f1 {
            for b in 0..f2 {
                let mut acc = T::zero();
                for t in 0..tr {
                    acc += c[[a * tr + t, b * tr + t]];
                }
                out[[a, b]] = acc;
            }
        }
        out
    }
}

/// Natural element index of every kernel row of a leaf
///
/// Built by permuting an index grid to `[batch, features…, trace…]` and
/// reading it in row-major order.
fn row_order(axes: &LeafAxes, shape: &[usize]) -> NtkResult<Vec<usize>> {
    let n: usize = shape.iter().product();
    let grid = DenseND::<usize>::from_vec((0..n).collect(), shape)?;
    let perm: Vec<usize> = axes
        .batch
        .iter()
        .chain(&axes.features)
        .chain(&axes.trace)
        .copied()
        .collect();
    Ok(grid.permute(&perm)?.to_vec())
}

/// Everything one kernel call needs, validated
#[derive(Debug, Clone)]
pub struct KernelPlan<T: Scalar> {
    /// Single-example units of the first batch
    pub units1: Vec<Tree<T>>,
    /// Single-example units of the second batch
    pub units2: Vec<Tree<T>>,
    /// Whether the inputs are vectorized over an example axis
    pub batched: bool,
    /// Input shapes of one unit of the first batch
    pub example_shape1: Shapes,
    /// Input shapes of one unit of the second batch
    pub example_shape2: Shapes,
    /// Output shapes of one unit of the first batch
    pub output_shape1: Shapes,
    /// Output shapes of one unit of the second batch
    pub output_shape2: Shapes,
    /// Output tree structure
    pub output_def: TreeDef,
    /// One entry per output leaf
    pub leaves: Vec<LeafPlan>,
}

impl<T: Scalar> KernelPlan<T> {
    /// Validate the call and split both batches into units
    pub fn new(
        network: &Network<T>,
        trace_axes: &TraceAxes,
        vmap_axes: &VmapAxes,
        x1: &StructuredValue<T>,
        x2: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<Self> {
        if !x1.same_structure(x2) {
            return Err(NtkError::structure_mismatch(format!(
                "input batches have different structures: {:?} vs {:?}",
                x1.structure(),
                x2.structure()
            )));
        }
        let (shapes1, shapes2) = (x1.shapes(), x2.shapes());
        shapes1.zip_with(&shapes2, |a, b| {
            if a.len() == b.len() {
                Ok(())
            } else {
                Err(NtkError::invalid_axes(format!(
                    "input leaves of rank {} and {} cannot share a batch axis",
                    a.len(),
                    b.len()
                )))
            }
        })?;

        let in_axes1 = vmap_axes.input.resolve(&shapes1)?;
        let in_axes2 = vmap_axes.input.resolve(&shapes2)?;
        let n1 = batch_size(x1, &in_axes1)?;
        let n2 = batch_size(x2, &in_axes2)?;
        if n1.is_some() != n2.is_some() {
            return Err(NtkError::invalid_axes(
                "only one of the input batches has a batch axis",
            ));
        }
        let batched = n1.is_some();

        let units1 = split_batch(x1, &in_axes1)?;
        let units2 = split_batch(x2, &in_axes2)?;
        let example_shape1 = example_shapes(&shapes1, &in_axes1)?;
        let example_shape2 = example_shapes(&shapes2, &in_axes2)?;

        network.check_params(params, &example_shape1)?;
        if example_shape2 != example_shape1 {
            network.check_params(params, &example_shape2)?;
        }
        let output_shape1 = network.output_shape(&example_shape1)?;
        let output_shape2 = network.output_shape(&example_shape2)?;
        if !output_shape1.same_structure(&output_shape2) {
            return Err(NtkError::structure_mismatch(
                "network outputs for the two batches differ in structure",
            ));
        }

        let output_batch = Self::output_batch_axes(&vmap_axes.output, &output_shape1, batched)?;
        let axes = normalize_output_axes(trace_axes, &output_batch, &output_shape1)?;
        let leaves = axes
            .zip_with(&output_shape1, |a, s| Ok((a.clone(), s.clone())))?
            .zip_with(&output_shape2, |(a, s1), s2| {
                if s1.len() != s2.len() {
                    return Err(NtkError::shape_mismatch(format!(
                        "output leaves of rank {} and {} cannot be paired",
                        s1.len(),
                        s2.len()
                    )));
                }
                LeafPlan::new(a.clone(), s1.clone(), s2.clone())
            })?
            .flatten()
            .0;

        log::debug!(
            "kernel plan: n1={} n2={} batched={} leaves={}",
            units1.len(),
            units2.len(),
            batched,
            leaves.len()
        );

        Ok(Self {
            units1,
            units2,
            batched,
            example_shape1,
            example_shape2,
            output_def: output_shape1.structure(),
            output_shape1,
            output_shape2,
            leaves,
        })
    }

    /// Output batch axes, checked against whether the inputs are batched
    fn output_batch_axes(
        output: &BatchAxes,
        output_shape: &Shapes,
        batched: bool,
    ) -> NtkResult<BatchAxes> {
        let resolved = output.resolve(output_shape)?;
        let leaves = resolved.leaves();
        if batched && leaves.iter().any(|a| a.is_none()) {
            return Err(NtkError::invalid_axes(
                "inputs are vectorized but an output leaf has no batch axis",
            ));
        }
        if !batched && leaves.iter().any(|a| a.is_some()) {
            return Err(NtkError::invalid_axes(
                "inputs are not vectorized but an output batch axis is given",
            ));
        }
        Ok(output.clone())
    }

    /// Examples in the first batch
    pub fn n1(&self) -> usize {
        self.units1.len()
    }

    /// Examples in the second batch
    pub fn n2(&self) -> usize {
        self.units2.len()
    }

    /// Cost-model inputs for this call
    pub fn problem_stats(&self, network: &Network<T>) -> NtkResult<ProblemStats> {
        let stats: NetworkStats = network.profile(&self.example_shape1)?;
        let problem = self.leaves.iter().fold(
            ProblemStats::new(self.n1(), self.n2(), stats),
            |p, leaf| {
                p.with_output(OutputStats {
                    features1: leaf.features1(),
                    features2: leaf.features2(),
                    trace: leaf.trace,
                })
            },
        );
        Ok(problem.with_element_bytes(std::mem::size_of::<T>()))
    }

    /// Zero block stores, one `(n1, n2, F1, F2)` array per leaf
    pub fn empty_blocks(&self) -> Vec<Array4<T>> {
        self.leaves
            .iter()
            .map(|l| Array4::zeros((self.n1(), self.n2(), l.features1(), l.features2())))
            .collect()
    }

    /// Output cotangent of side 1 or 2 that is one at kernel row `k` of `leaf`
    pub fn basis(&self, side: Side, leaf: usize, k: usize) -> NtkResult<StructuredValue<T>> {
        let (shapes, order) = match side {
            Side::First => (&self.output_shape1, &self.leaves[leaf].order1),
            Side::Second => (&self.output_shape2, &self.leaves[leaf].order2),
        };
        let natural = order[k];
        let (leaf_shapes, def) = shapes.clone().flatten();
        let tensors = leaf_shapes
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if i == leaf {
                    DenseND::one_hot(s, natural)
                } else {
                    Ok(DenseND::zeros(s))
                }
            })
            .collect::<NtkResult<Vec<_>>>()?;
        def.unflatten(tensors)
    }

    /// Assemble block stores into the kernel
    ///
    /// Each leaf becomes `(n1, n2, d1, d1', d2, d2', …)` with the feature
    /// axes of both batches zipped pairwise; without vectorization the
    /// leading `(n1, n2)` pair is dropped.
    pub fn finish(&self, blocks: Vec<Array4<T>>) -> NtkResult<StructuredValue<T>> {
        if blocks.len() != self.leaves.len() {
            return Err(NtkError::structure_mismatch(format!(
                "{} kernel blocks for {} output leaves",
                blocks.len(),
                self.leaves.len()
            )));
        }
        let kernels = blocks
            .into_iter()
            .zip(&self.leaves)
            .map(|(block, leaf)| {
                let (d1, d2) = (leaf.dims1(), leaf.dims2());
                let m = d1.len();
                let mut shape = vec![self.n1(), self.n2()];
                shape.extend(&d1);
                shape.extend(&d2);
                let full = DenseND::from_vec(block.iter().copied().collect(), &shape)?;
                let mut perm = vec![0, 1];
                for a in 0..m {
                    perm.push(2 + a);
                    perm.push(2 + m + a);
                }
                let zipped = full.permute(&perm)?;
                if self.batched {
                    Ok(zipped)
                } else {
                    zipped.index_axis(0, 0)?.index_axis(0, 0)
                }
            })
            .collect::<NtkResult<Vec<_>>>()?;
        self.output_def.unflatten(kernels)
    }
}

/// Shapes of one unit: batched leaves keep their batch axis with size 1
fn example_shapes(shapes: &Shapes, axes: &NtTree<Option<usize>>) -> NtkResult<Shapes> {
    shapes.zip_with(axes, |shape, axis| {
        let mut shape = shape.clone();
        if let Some(a) = *axis {
            if let Some(size) = shape.get_mut(a) {
                *size = 1;
            }
        }
        Ok(shape)
    })
}

/// One way of filling the per-leaf block stores of a [`KernelPlan`]
pub trait KernelStrategy<T: Scalar>: std::fmt::Debug + Send + Sync {
    /// Tag of this strategy
    fn implementation(&self) -> NtkImplementation;

    /// Compute one `(n1, n2, F1, F2)` block store per output leaf
    fn compute(
        &self,
        network: &Network<T>,
        params: &StructuredValue<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Vec<Array4<T>>>;
}

/// Which input batch a quantity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// `x1`
    First,
    /// `x2`
    Second,
}

/// Add `value` into the `(i, j)` block of a leaf store
pub(crate) fn add_block<T: Scalar>(store: &mut Array4<T>, i: usize, j: usize, value: &Array2<T>) {
    let mut slot = store.index_axis_mut(NdAxis(0), i);
    let mut slot = slot.index_axis_mut(NdAxis(0), j);
    slot += value;
}

/// Rows of a leaf of `tree` in kernel order
pub(crate) fn leaf_rows<T: Scalar>(
    tree: &StructuredValue<T>,
    leaf: usize,
    order: &[usize],
) -> NtkResult<Vec<T>> {
    let leaves = tree.leaves();
    let values = leaves
        .get(leaf)
        .ok_or_else(|| NtkError::structure_mismatch(format!("output has no leaf {}", leaf)))?
        .to_vec();
    order
        .iter()
        .map(|&i| {
            values.get(i).copied().ok_or_else(|| {
                NtkError::shape_mismatch(format!("output leaf {} is too small", leaf))
            })
        })
        .collect()
}
