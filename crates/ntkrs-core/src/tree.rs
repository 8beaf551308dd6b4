//! Tree containers for structured values
//!
//! Network inputs, outputs, parameters and kernels are all [`NtTree`]s:
//! nested lists and tuples whose leaves are tensors (or, for shape and axis
//! bookkeeping, any other leaf type). A tree can be flattened into its
//! leaves plus a [`TreeDef`] describing the nesting, and rebuilt from a new
//! leaf sequence of the same length.
//!
//! # Examples
//!
//! ```
//! use ntkrs_core::tree::NtTree;
//!
//! let tree = NtTree::tuple(vec![NtTree::leaf(1), NtTree::list(vec![NtTree::leaf(2), NtTree::leaf(3)])]);
//! let (leaves, def) = tree.clone().flatten();
//! assert_eq!(leaves, vec![1, 2, 3]);
//!
//! let doubled = def.unflatten(leaves.iter().map(|x| x * 2).collect()).unwrap();
//! assert_eq!(doubled.leaves(), vec![&2, &4, &6]);
//! assert!(doubled.same_structure(&tree));
//! ```

use crate::dense::DenseND;
use crate::error::{NtkError, NtkResult};
use crate::types::Scalar;
use ndarray::Array1;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Recursive container: a leaf, an ordered list, or a fixed-length tuple
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NtTree<L> {
    /// Single leaf value
    Leaf(L),
    /// List-like node
    List(Vec<NtTree<L>>),
    /// Tuple-like node
    Tuple(Vec<NtTree<L>>),
}

/// Nesting pattern of an [`NtTree`], with leaves erased
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TreeDef {
    /// A leaf slot
    Leaf,
    /// List node with child definitions
    List(Vec<TreeDef>),
    /// Tuple node with child definitions
    Tuple(Vec<TreeDef>),
}

/// Structured value with tensor leaves
pub type StructuredValue<T> = NtTree<DenseND<T>>;

/// Tree of leaf shapes
pub type Shapes = NtTree<Vec<usize>>;

impl TreeDef {
    /// Number of leaf slots
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::List(children) | TreeDef::Tuple(children) => {
                children.iter().map(TreeDef::num_leaves).sum()
            }
        }
    }

    /// Rebuild a tree from leaves in flattening order
    pub fn unflatten<L>(&self, leaves: Vec<L>) -> NtkResult<NtTree<L>> {
        if leaves.len() != self.num_leaves() {
            return Err(NtkError::structure_mismatch(format!(
                "tree expects {} leaves, got {}",
                self.num_leaves(),
                leaves.len()
            )));
        }
        let mut iter = leaves.into_iter();
        self.build(&mut iter)
            .ok_or_else(|| NtkError::structure_mismatch("ran out of leaves while unflattening"))
    }

    /// Tree of this structure with every leaf set to `value`
    pub fn fill<L: Clone>(&self, value: L) -> NtTree<L> {
        match self {
            TreeDef::Leaf => NtTree::Leaf(value),
            TreeDef::List(c) => NtTree::List(c.iter().map(|d| d.fill(value.clone())).collect()),
            TreeDef::Tuple(c) => NtTree::Tuple(c.iter().map(|d| d.fill(value.clone())).collect()),
        }
    }

    fn build<L, I: Iterator<Item = L>>(&self, iter: &mut I) -> Option<NtTree<L>> {
        Some(match self {
            TreeDef::Leaf => NtTree::Leaf(iter.next()?),
            TreeDef::List(children) => NtTree::List(
                children
                    .iter()
                    .map(|c| c.build(iter))
                    .collect::<Option<Vec<_>>>()?,
            ),
            TreeDef::Tuple(children) => NtTree::Tuple(
                children
                    .iter()
                    .map(|c| c.build(iter))
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }
}

impl<L> NtTree<L> {
    /// Leaf constructor
    pub fn leaf(value: L) -> Self {
        NtTree::Leaf(value)
    }

    /// List constructor
    pub fn list(children: Vec<NtTree<L>>) -> Self {
        NtTree::List(children)
    }

    /// Tuple constructor
    pub fn tuple(children: Vec<NtTree<L>>) -> Self {
        NtTree::Tuple(children)
    }

    /// Empty tuple, used for parameter-free layers
    pub fn empty() -> Self {
        NtTree::Tuple(Vec::new())
    }

    /// True for a leaf node
    pub fn is_leaf(&self) -> bool {
        matches!(self, NtTree::Leaf(_))
    }

    /// The leaf value, if this is a leaf
    pub fn as_leaf(&self) -> Option<&L> {
        match self {
            NtTree::Leaf(l) => Some(l),
            _ => None,
        }
    }

    /// Children of a list or tuple node
    pub fn children(&self) -> Option<&[NtTree<L>]> {
        match self {
            NtTree::Leaf(_) => None,
            NtTree::List(c) | NtTree::Tuple(c) => Some(c),
        }
    }

    /// Nesting pattern with leaves erased
    pub fn structure(&self) -> TreeDef {
        match self {
            NtTree::Leaf(_) => TreeDef::Leaf,
            NtTree::List(c) => TreeDef::List(c.iter().map(NtTree::structure).collect()),
            NtTree::Tuple(c) => TreeDef::Tuple(c.iter().map(NtTree::structure).collect()),
        }
    }

    /// Number of leaves
    pub fn num_leaves(&self) -> usize {
        match self {
            NtTree::Leaf(_) => 1,
            NtTree::List(c) | NtTree::Tuple(c) => c.iter().map(NtTree::num_leaves).sum(),
        }
    }

    /// Leaves in depth-first order together with the tree definition
    pub fn flatten(self) -> (Vec<L>, TreeDef) {
        let mut leaves = Vec::new();
        let def = self.flatten_into(&mut leaves);
        (leaves, def)
    }

    fn flatten_into(self, out: &mut Vec<L>) -> TreeDef {
        match self {
            NtTree::Leaf(l) => {
                out.push(l);
                TreeDef::Leaf
            }
            NtTree::List(c) => TreeDef::List(c.into_iter().map(|t| t.flatten_into(out)).collect()),
            NtTree::Tuple(c) => {
                TreeDef::Tuple(c.into_iter().map(|t| t.flatten_into(out)).collect())
            }
        }
    }

    /// Borrowed leaves in depth-first order
    pub fn leaves(&self) -> Vec<&L> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a L>) {
        match self {
            NtTree::Leaf(l) => out.push(l),
            NtTree::List(c) | NtTree::Tuple(c) => c.iter().for_each(|t| t.collect_leaves(out)),
        }
    }

    /// Recursive equality of nesting pattern, ignoring leaf values
    pub fn same_structure<M>(&self, other: &NtTree<M>) -> bool {
        match (self, other) {
            (NtTree::Leaf(_), NtTree::Leaf(_)) => true,
            (NtTree::List(a), NtTree::List(b)) | (NtTree::Tuple(a), NtTree::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            _ => false,
        }
    }

    /// Apply `f` to every leaf
    pub fn map<R>(&self, mut f: impl FnMut(&L) -> R) -> NtTree<R> {
        self.map_inner(&mut f)
    }

    fn map_inner<R>(&self, f: &mut impl FnMut(&L) -> R) -> NtTree<R> {
        match self {
            NtTree::Leaf(l) => NtTree::Leaf(f(l)),
            NtTree::List(c) => NtTree::List(c.iter().map(|t| t.map_inner(f)).collect()),
            NtTree::Tuple(c) => NtTree::Tuple(c.iter().map(|t| t.map_inner(f)).collect()),
        }
    }

    /// Apply a fallible `f` to every leaf, stopping at the first error
    pub fn try_map<R, E>(&self, mut f: impl FnMut(&L) -> Result<R, E>) -> Result<NtTree<R>, E> {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<R, E>(
        &self,
        f: &mut impl FnMut(&L) -> Result<R, E>,
    ) -> Result<NtTree<R>, E> {
        Ok(match self {
            NtTree::Leaf(l) => NtTree::Leaf(f(l)?),
            NtTree::List(c) => NtTree::List(
                c.iter()
                    .map(|t| t.try_map_inner(f))
                    .collect::<Result<_, _>>()?,
            ),
            NtTree::Tuple(c) => NtTree::Tuple(
                c.iter()
                    .map(|t| t.try_map_inner(f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Combine two structurally identical trees leaf by leaf
    ///
    /// Raises [`NtkError::StructureMismatch`] when the nesting differs.
    pub fn zip_with<M, R>(
        &self,
        other: &NtTree<M>,
        mut f: impl FnMut(&L, &M) -> NtkResult<R>,
    ) -> NtkResult<NtTree<R>> {
        self.zip_inner(other, &mut f)
    }

    fn zip_inner<M, R>(
        &self,
        other: &NtTree<M>,
        f: &mut impl FnMut(&L, &M) -> NtkResult<R>,
    ) -> NtkResult<NtTree<R>> {
        match (self, other) {
            (NtTree::Leaf(a), NtTree::Leaf(b)) => Ok(NtTree::Leaf(f(a, b)?)),
            (NtTree::List(a), NtTree::List(b)) if a.len() == b.len() => Ok(NtTree::List(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.zip_inner(y, f))
                    .collect::<NtkResult<_>>()?,
            )),
            (NtTree::Tuple(a), NtTree::Tuple(b)) if a.len() == b.len() => Ok(NtTree::Tuple(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.zip_inner(y, f))
                    .collect::<NtkResult<_>>()?,
            )),
            _ => Err(NtkError::structure_mismatch(format!(
                "{:?} vs {:?}",
                self.structure(),
                other.structure()
            ))),
        }
    }
}

impl<T: Scalar> StructuredValue<T> {
    /// Shapes of every leaf
    pub fn shapes(&self) -> Shapes {
        self.map(|t| t.shape().to_vec())
    }

    /// Zero tree with the same structure and shapes
    pub fn zeros_like(&self) -> Self {
        self.map(DenseND::zeros_like)
    }

    /// Leafwise `self - other`
    pub fn sub(&self, other: &Self) -> NtkResult<Self> {
        self.zip_with(other, |a, b| a.sub(b))
    }

    /// Leafwise `self + other`
    pub fn add(&self, other: &Self) -> NtkResult<Self> {
        self.zip_with(other, |a, b| a.add(b))
    }

    /// Multiply every leaf by `factor`
    pub fn scale(&self, factor: T) -> Self {
        self.map(|t| t.scale(factor))
    }

    /// Sum over leaves of elementwise products
    pub fn dot(&self, other: &Self) -> NtkResult<T> {
        let per_leaf = self.zip_with(other, |a, b| a.dot(b))?;
        Ok(per_leaf
            .leaves()
            .into_iter()
            .fold(T::zero(), |acc, &v| acc + v))
    }

    /// Largest absolute elementwise difference across all leaves
    pub fn max_abs_diff(&self, other: &Self) -> NtkResult<T> {
        let per_leaf = self.zip_with(other, |a, b| a.max_abs_diff(b))?;
        Ok(per_leaf
            .leaves()
            .into_iter()
            .fold(T::zero(), |acc, &v| acc.max(v)))
    }

    /// Total number of scalar elements
    pub fn size(&self) -> usize {
        self.leaves().iter().map(|t| t.len()).sum()
    }

    /// Concatenate all leaves into one vector, remembering how to split it back
    ///
    /// # Examples
    ///
    /// ```
    /// use ntkrs_core::dense::DenseND;
    /// use ntkrs_core::tree::NtTree;
    ///
    /// let params = NtTree::tuple(vec![
    ///     NtTree::leaf(DenseND::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap()),
    ///     NtTree::leaf(DenseND::from_vec(vec![5.0], &[1]).unwrap()),
    /// ]);
    /// let (flat, layout) = params.ravel();
    /// assert_eq!(flat.len(), 5);
    /// assert_eq!(layout.unravel(flat.view()).unwrap(), params);
    /// ```
    pub fn ravel(&self) -> (Array1<T>, RavelLayout) {
        let leaves = self.leaves();
        let mut flat = Vec::with_capacity(self.size());
        let mut shapes = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            flat.extend(leaf.as_array().iter().copied());
            shapes.push(leaf.shape().to_vec());
        }
        (
            Array1::from(flat),
            RavelLayout {
                def: self.structure(),
                shapes,
            },
        )
    }
}

/// Recipe for splitting a raveled vector back into a structured value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RavelLayout {
    def: TreeDef,
    shapes: Vec<Vec<usize>>,
}

impl RavelLayout {
    /// Length of the raveled vector
    pub fn size(&self) -> usize {
        self.shapes.iter().map(|s| s.iter().product::<usize>()).sum()
    }

    /// Split `flat` back into leaves
    pub fn unravel<T: Scalar>(
        &self,
        flat: ndarray::ArrayView1<'_, T>,
    ) -> NtkResult<StructuredValue<T>> {
        if flat.len() != self.size() {
            return Err(NtkError::shape_mismatch(format!(
                "raveled vector has {} elements, layout needs {}",
                flat.len(),
                self.size()
            )));
        }
        let mut offset = 0;
        let mut leaves = Vec::with_capacity(self.shapes.len());
        for shape in &self.shapes {
            let n: usize = shape.iter().product();
            let chunk = flat.slice(ndarray::s![offset..offset + n]).to_vec();
            leaves.push(DenseND::from_vec(chunk, shape)?);
            offset += n;
        }
        self.def.unflatten(leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NtTree<i32> {
        NtTree::list(vec![
            NtTree::leaf(1),
            NtTree::tuple(vec![NtTree::leaf(2), NtTree::leaf(3)]),
            NtTree::empty(),
        ])
    }

    #[test]
    fn test_flatten_unflatten() {
        let tree = sample();
        let (leaves, def) = tree.clone().flatten();
        assert_eq!(leaves, vec![1, 2, 3]);
        assert_eq!(def.num_leaves(), 3);
        assert_eq!(def.unflatten(leaves).unwrap(), tree);
    }

    #[test]
    fn test_unflatten_wrong_count() {
        let (_, def) = sample().flatten();
        let err = def.unflatten(vec![1, 2]).unwrap_err();
        assert!(matches!(err, NtkError::StructureMismatch(_)));
    }

    #[test]
    fn test_zip_with_structure_mismatch() {
        let a = sample();
        let b = NtTree::list(vec![NtTree::leaf(1), NtTree::leaf(2)]);
        let err = a.zip_with(&b, |x, y| Ok(x + y)).unwrap_err();
        assert!(matches!(err, NtkError::StructureMismatch(_)));

        // A list and a tuple of the same length are different structures
        let c = NtTree::tuple(vec![NtTree::leaf(1), NtTree::leaf(2)]);
        assert!(!b.same_structure(&c));
    }

    #[test]
    fn test_zip_with_sum() {
        let a = sample();
        let summed = a.zip_with(&a, |x, y| Ok(x + y)).unwrap();
        assert_eq!(summed.leaves(), vec![&2, &4, &6]);
    }

    #[test]
    fn test_tree_arithmetic() {
        let a: StructuredValue<f64> = NtTree::tuple(vec![
            NtTree::leaf(DenseND::from_vec(vec![1.0, 2.0], &[2]).unwrap()),
            NtTree::leaf(DenseND::from_vec(vec![3.0], &[1]).unwrap()),
        ]);
        let b = a.scale(2.0);
        assert_eq!(a.dot(&b).unwrap(), 28.0);
        assert_eq!(b.sub(&a).unwrap(), a);
        assert_eq!(a.max_abs_diff(&b).unwrap(), 3.0);
        assert_eq!(a.size(), 3);
        assert_eq!(a.shapes(), NtTree::tuple(vec![NtTree::leaf(vec![2]), NtTree::leaf(vec![1])]));
    }

    #[test]
    fn test_unravel_rejects_wrong_length() {
        let a: StructuredValue<f64> =
            NtTree::leaf(DenseND::from_vec(vec![1.0, 2.0], &[2]).unwrap());
        let (_, layout) = a.ravel();
        let short = Array1::from(vec![1.0]);
        assert!(layout.unravel(short.view()).is_err());
    }

    #[test]
    fn test_axis_trees_compare_as_eq() {
        fn same<E: Eq>(a: &E, b: &E) -> bool {
            a == b
        }
        let t = NtTree::tuple(vec![NtTree::leaf(vec![-1isize]), NtTree::leaf(vec![])]);
        assert!(same(&t, &t.clone()));
        assert!(same(
            &crate::TraceAxes::from(t.clone()),
            &crate::TraceAxes::from(t)
        ));
        assert!(same(&crate::BatchAxes::from(0isize), &crate::BatchAxes::from(0isize)));
    }

    #[test]
    fn test_field_values_debug_print() {
        let value = crate::FieldValue::Data(NtTree::leaf(DenseND::<f32>::zeros(&[2, 1])));
        let text = format!("{:?}", value);
        assert!(text.contains("DenseND"));
        assert!(text.contains("[2, 1]"));
    }
}
