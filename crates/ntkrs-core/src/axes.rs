//! Trace and batch axis specifications
//!
//! Callers describe which output axes are summed away when forming a kernel
//! (trace axes) and which axis indexes examples (batch, or vmap, axes). Both
//! can be given once for every leaf or as a tree mirroring the output.
//! [`normalize_output_axes`] validates the specification against concrete
//! leaf ranks and produces one [`LeafAxes`] per output leaf.
//!
//! Negative indices count from the end, as in NumPy.

use crate::error::{NtkError, NtkResult};
use crate::tree::{NtTree, Shapes};
use crate::types::SignedAxis;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Output axes summed over when forming the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TraceAxes {
    /// Same axes for every output leaf
    Uniform(Vec<SignedAxis>),
    /// One axis list per output leaf
    PerLeaf(NtTree<Vec<SignedAxis>>),
}

impl Default for TraceAxes {
    fn default() -> Self {
        TraceAxes::Uniform(vec![-1])
    }
}

impl TraceAxes {
    /// No trace axes: keep the full output-by-output kernel
    pub fn none() -> Self {
        TraceAxes::Uniform(Vec::new())
    }
}

impl From<Vec<SignedAxis>> for TraceAxes {
    fn from(axes: Vec<SignedAxis>) -> Self {
        TraceAxes::Uniform(axes)
    }
}

impl From<&[SignedAxis]> for TraceAxes {
    fn from(axes: &[SignedAxis]) -> Self {
        TraceAxes::Uniform(axes.to_vec())
    }
}

impl<const N: usize> From<[SignedAxis; N]> for TraceAxes {
    fn from(axes: [SignedAxis; N]) -> Self {
        TraceAxes::Uniform(axes.to_vec())
    }
}

impl From<SignedAxis> for TraceAxes {
    fn from(axis: SignedAxis) -> Self {
        TraceAxes::Uniform(vec![axis])
    }
}

impl From<NtTree<Vec<SignedAxis>>> for TraceAxes {
    fn from(tree: NtTree<Vec<SignedAxis>>) -> Self {
        TraceAxes::PerLeaf(tree)
    }
}

/// Example-index axis of each leaf; `None` means the leaf is not batched
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BatchAxes {
    /// Same axis for every leaf
    Uniform(Option<SignedAxis>),
    /// One axis per leaf
    PerLeaf(NtTree<Option<SignedAxis>>),
}

impl Default for BatchAxes {
    fn default() -> Self {
        BatchAxes::Uniform(Some(0))
    }
}

impl From<SignedAxis> for BatchAxes {
    fn from(axis: SignedAxis) -> Self {
        BatchAxes::Uniform(Some(axis))
    }
}

impl From<Option<SignedAxis>> for BatchAxes {
    fn from(axis: Option<SignedAxis>) -> Self {
        BatchAxes::Uniform(axis)
    }
}

impl From<NtTree<Option<SignedAxis>>> for BatchAxes {
    fn from(tree: NtTree<Option<SignedAxis>>) -> Self {
        BatchAxes::PerLeaf(tree)
    }
}

impl BatchAxes {
    /// Resolve against a tree of leaf shapes
    ///
    /// Returns, per leaf, the canonical batch axis.
    pub fn resolve(&self, shapes: &Shapes) -> NtkResult<NtTree<Option<usize>>> {
        let per_leaf = match self {
            BatchAxes::Uniform(axis) => shapes.structure().fill(*axis),
            BatchAxes::PerLeaf(tree) => {
                if !tree.same_structure(shapes) {
                    return Err(NtkError::structure_mismatch(format!(
                        "batch axes {:?} do not mirror value structure {:?}",
                        tree.structure(),
                        shapes.structure()
                    )));
                }
                tree.clone()
            }
        };
        per_leaf.zip_with(shapes, |axis, shape| match axis {
            Some(a) => canonicalize_axis(*a, shape.len()).map(Some),
            None => Ok(None),
        })
    }
}

/// Vectorization axes for network inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VmapAxes {
    /// Batch axes of the inputs
    pub input: BatchAxes,
    /// Batch axes of the outputs
    pub output: BatchAxes,
}

impl VmapAxes {
    /// Separate input and output axes
    pub fn new(input: impl Into<BatchAxes>, output: impl Into<BatchAxes>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// True when neither side is vectorized
    pub fn is_unbatched(&self) -> bool {
        matches!(
            (&self.input, &self.output),
            (BatchAxes::Uniform(None), BatchAxes::Uniform(None))
        )
    }
}

impl From<BatchAxes> for VmapAxes {
    fn from(axes: BatchAxes) -> Self {
        Self {
            input: axes.clone(),
            output: axes,
        }
    }
}

impl From<SignedAxis> for VmapAxes {
    fn from(axis: SignedAxis) -> Self {
        BatchAxes::from(axis).into()
    }
}

impl From<Option<SignedAxis>> for VmapAxes {
    fn from(axis: Option<SignedAxis>) -> Self {
        BatchAxes::from(axis).into()
    }
}

/// Map a possibly negative axis onto `0..rank`
///
/// # Examples
///
/// ```
/// use ntkrs_core::axes::canonicalize_axis;
///
/// assert_eq!(canonicalize_axis(-1, 4).unwrap(), 3);
/// assert_eq!(canonicalize_axis(2, 4).unwrap(), 2);
/// assert!(canonicalize_axis(4, 4).is_err());
/// assert!(canonicalize_axis(-5, 4).is_err());
/// ```
pub fn canonicalize_axis(axis: SignedAxis, rank: usize) -> NtkResult<usize> {
    let r = rank as isize;
    let canonical = if axis < 0 { axis + r } else { axis };
    if canonical < 0 || canonical >= r {
        return Err(NtkError::invalid_axes(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(canonical as usize)
}

/// Canonical axis roles for one output leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafAxes {
    /// Rank of the full (batched) leaf
    pub rank: usize,
    /// Example axis, if any
    pub batch: Option<usize>,
    /// Summed axes, ascending
    pub trace: Vec<usize>,
    /// Remaining axes, ascending; these become the kernel's trailing dimensions
    pub features: Vec<usize>,
}

impl LeafAxes {
    /// Validate and classify the axes of a rank-`rank` leaf
    ///
    /// Fails with [`NtkError::InvalidAxes`] when an index is out of range, a
    /// trace axis repeats, or the batch axis is also a trace axis.
    pub fn new(rank: usize, trace: &[SignedAxis], batch: Option<SignedAxis>) -> NtkResult<Self> {
        let batch = batch.map(|b| canonicalize_axis(b, rank)).transpose()?;
        let mut canonical = trace
            .iter()
            .map(|&a| canonicalize_axis(a, rank))
            .collect::<NtkResult<Vec<_>>>()?;
        canonical.sort_unstable();
        if canonical.windows(2).any(|w| w[0] == w[1]) {
            return Err(NtkError::invalid_axes(format!(
                "trace axes {:?} overlap for rank {}",
                trace, rank
            )));
        }
        if let Some(b) = batch {
            if canonical.contains(&b) {
                return Err(NtkError::invalid_axes(format!(
                    "batch axis {} is also a trace axis",
                    b
                )));
            }
        }
        let features = (0..rank)
            .filter(|a| Some(*a) != batch && !canonical.contains(a))
            .collect();
        Ok(Self {
            rank,
            batch,
            trace: canonical,
            features,
        })
    }

    /// Map a full-leaf axis to its index once the batch axis is removed
    pub fn example_axis(&self, axis: usize) -> usize {
        match self.batch {
            Some(b) if axis > b => axis - 1,
            _ => axis,
        }
    }

    /// Trace axes in per-example coordinates
    pub fn example_trace(&self) -> Vec<usize> {
        self.trace.iter().map(|&a| self.example_axis(a)).collect()
    }

    /// Feature axes in per-example coordinates
    pub fn example_features(&self) -> Vec<usize> {
        self.features.iter().map(|&a| self.example_axis(a)).collect()
    }
}

/// Reject axis specs that can never be valid, independent of leaf ranks
///
/// Catches a uniform batch axis listed among uniform trace axes and
/// repeated trace axes given with the same sign.
pub fn check_static(trace: &TraceAxes, batch: &BatchAxes) -> NtkResult<()> {
    let check_one = |axes: &[SignedAxis], b: Option<SignedAxis>| -> NtkResult<()> {
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(NtkError::invalid_axes(format!(
                "trace axes {:?} contain duplicates",
                axes
            )));
        }
        if let Some(b) = b {
            if axes.contains(&b) {
                return Err(NtkError::invalid_axes(format!(
                    "batch axis {} is also a trace axis",
                    b
                )));
            }
        }
        Ok(())
    };
    match (trace, batch) {
        (TraceAxes::Uniform(t), BatchAxes::Uniform(b)) => check_one(t, *b),
        (TraceAxes::Uniform(t), BatchAxes::PerLeaf(tree)) => tree
            .leaves()
            .into_iter()
            .try_for_each(|b| check_one(t, *b)),
        (TraceAxes::PerLeaf(tree), BatchAxes::Uniform(b)) => tree
            .leaves()
            .into_iter()
            .try_for_each(|t| check_one(t, *b)),
        (TraceAxes::PerLeaf(t), BatchAxes::PerLeaf(b)) => t
            .zip_with(b, |t, b| check_one(t, *b))
            .map(|_| ()),
    }
}

/// Normalize trace and batch axes against the output leaf shapes
pub fn normalize_output_axes(
    trace: &TraceAxes,
    batch: &BatchAxes,
    output_shapes: &Shapes,
) -> NtkResult<NtTree<LeafAxes>> {
    let def = output_shapes.structure();
    let trace_tree = match trace {
        TraceAxes::Uniform(axes) => def.fill(axes.clone()),
        TraceAxes::PerLeaf(tree) => {
            if !tree.same_structure(output_shapes) {
                return Err(NtkError::structure_mismatch(format!(
                    "trace axes {:?} do not mirror output structure {:?}",
                    tree.structure(),
                    def
                )));
            }
            tree.clone()
        }
    };
    let batch_tree = match batch {
        BatchAxes::Uniform(axis) => def.fill(*axis),
        BatchAxes::PerLeaf(tree) => {
            if !tree.same_structure(output_shapes) {
                return Err(NtkError::structure_mismatch(format!(
                    "batch axes {:?} do not mirror output structure {:?}",
                    tree.structure(),
                    def
                )));
            }
            tree.clone()
        }
    };
    let paired = trace_tree.zip_with(&batch_tree, |t, b| Ok((t.clone(), *b)))?;
    paired.zip_with(output_shapes, |(t, b), shape| {
        LeafAxes::new(shape.len(), t, *b)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_axes_classification() {
        let axes = LeafAxes::new(4, &[-1], Some(0)).unwrap();
        assert_eq!(axes.batch, Some(0));
        assert_eq!(axes.trace, vec![3]);
        assert_eq!(axes.features, vec![1, 2]);
        assert_eq!(axes.example_trace(), vec![2]);
        assert_eq!(axes.example_features(), vec![0, 1]);
    }

    #[test]
    fn test_batch_in_the_middle() {
        let axes = LeafAxes::new(3, &[0], Some(1)).unwrap();
        assert_eq!(axes.features, vec![2]);
        assert_eq!(axes.example_trace(), vec![0]);
        assert_eq!(axes.example_features(), vec![1]);
    }

    #[test]
    fn test_invalid_axes() {
        assert!(matches!(
            LeafAxes::new(2, &[2], Some(0)),
            Err(NtkError::InvalidAxes(_))
        ));
        // -1 and 1 name the same axis of a rank-2 leaf
        assert!(matches!(
            LeafAxes::new(2, &[-1, 1], Some(0)),
            Err(NtkError::InvalidAxes(_))
        ));
        assert!(matches!(
            LeafAxes::new(2, &[-1], Some(1)),
            Err(NtkError::InvalidAxes(_))
        ));
        assert!(matches!(
            LeafAxes::new(2, &[], Some(-3)),
            Err(NtkError::InvalidAxes(_))
        ));
    }

    #[test]
    fn test_static_check() {
        assert!(check_static(&TraceAxes::from(vec![0isize]), &BatchAxes::from(0isize)).is_err());
        assert!(check_static(&TraceAxes::from(vec![1isize, 1]), &BatchAxes::from(0isize)).is_err());
        assert!(check_static(&TraceAxes::from(vec![-1isize]), &BatchAxes::from(0isize)).is_ok());
        assert!(check_static(&TraceAxes::none(), &BatchAxes::Uniform(None)).is_ok());
    }

    #[test]
    fn test_normalize_per_leaf() {
        let shapes: Shapes = NtTree::list(vec![
            NtTree::leaf(vec![5, 10]),
            NtTree::leaf(vec![5, 4, 4, 8]),
        ]);
        let trace = TraceAxes::PerLeaf(NtTree::list(vec![
            NtTree::leaf(vec![]),
            NtTree::leaf(vec![-1isize]),
        ]));
        let axes = normalize_output_axes(&trace, &BatchAxes::default(), &shapes).unwrap();
        let leaves = axes.leaves();
        assert_eq!(leaves[0].features, vec![1]);
        assert_eq!(leaves[1].features, vec![1, 2]);
        assert_eq!(leaves[1].trace, vec![3]);

        let bad = TraceAxes::PerLeaf(NtTree::leaf(Vec::new()));
        assert!(matches!(
            normalize_output_axes(&bad, &BatchAxes::default(), &shapes),
            Err(NtkError::StructureMismatch(_))
        ));
    }

    #[test]
    fn test_resolve_batch_axes() {
        let shapes: Shapes = NtTree::tuple(vec![NtTree::leaf(vec![3, 2]), NtTree::leaf(vec![4, 3])]);
        let resolved = BatchAxes::from(-1isize).resolve(&shapes).unwrap();
        assert_eq!(resolved.leaves(), vec![&Some(1), &Some(1)]);
        let per_leaf = BatchAxes::PerLeaf(NtTree::tuple(vec![
            NtTree::leaf(Some(0isize)),
            NtTree::leaf(None),
        ]));
        let resolved = per_leaf.resolve(&shapes).unwrap();
        assert_eq!(resolved.leaves(), vec![&Some(0), &None]);
    }

    #[test]
    fn test_vmap_axes_conversions() {
        let axes = VmapAxes::from(0isize);
        assert_eq!(axes.input, BatchAxes::Uniform(Some(0)));
        assert_eq!(axes.output, BatchAxes::Uniform(Some(0)));
        assert!(VmapAxes::from(None::<isize>).is_unbatched());
        assert!(!VmapAxes::new(0isize, None::<isize>).is_unbatched());
    }
}
