//! Dense tensor storage
//!
//! `DenseND<T>` is the leaf type of every structured value handled by ntkrs:
//! network inputs, outputs, parameters and kernels. It wraps an `ndarray`
//! dynamic-rank array in row-major layout and adds the handful of
//! operations the differentiation substrate and the kernel strategies need.

use crate::error::{NtkError, NtkResult};
use crate::types::{cast, Scalar};
use ndarray::{Array, ArrayView, ArrayViewMut, Axis as NdAxis, IxDyn};
use num_traits::Num;
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt;

/// Dense N-dimensional tensor
///
/// # Examples
///
/// ```
/// use ntkrs_core::dense::DenseND;
///
/// let tensor = DenseND::<f64>::zeros(&[2, 3, 4]);
/// assert_eq!(tensor.shape(), &[2, 3, 4]);
/// assert_eq!(tensor.rank(), 3);
/// ```
#[derive(Clone, PartialEq)]
pub struct DenseND<T> {
    pub(crate) data: Array<T, IxDyn>,
}

impl<T> DenseND<T>
where
    T: Clone + Num,
{
    /// Create a tensor from an existing ndarray
    pub fn from_array(array: Array<T, IxDyn>) -> Self {
        Self { data: array }
    }

    /// Create a tensor from row-major data
    ///
    /// # Examples
    ///
    /// ```
    /// use ntkrs_core::dense::DenseND;
    ///
    /// let t = DenseND::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    /// assert_eq!(t.get(&[1, 0]), Some(&3.0));
    /// assert!(DenseND::from_vec(vec![1.0, 2.0], &[3]).is_err());
    /// ```
    pub fn from_vec(vec: Vec<T>, shape: &[usize]) -> NtkResult<Self> {
        let len = vec.len();
        let data = Array::from_shape_vec(IxDyn(shape), vec).map_err(|_| {
            NtkError::shape_mismatch(format!(
                "{} elements cannot fill shape {:?}",
                len, shape
            ))
        })?;
        Ok(Self { data })
    }

    /// Tensor filled with a single value
    pub fn from_elem(shape: &[usize], value: T) -> Self {
        Self {
            data: Array::from_elem(IxDyn(shape), value),
        }
    }

    /// Tensor of zeros
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: Array::zeros(IxDyn(shape)),
        }
    }

    /// Tensor of ones
    pub fn ones(shape: &[usize]) -> Self {
        Self {
            data: Array::ones(IxDyn(shape)),
        }
    }

    /// Zero tensor with the shape of `self`
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape())
    }

    /// Number of axes
    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    /// Shape as a slice
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the underlying array
    pub fn as_array(&self) -> &Array<T, IxDyn> {
        &self.data
    }

    /// Mutably borrow the underlying array
    pub fn as_array_mut(&mut self) -> &mut Array<T, IxDyn> {
        &mut self.data
    }

    /// Take the underlying array
    pub fn into_array(self) -> Array<T, IxDyn> {
        self.data
    }

    /// Read-only view
    pub fn view(&self) -> ArrayView<'_, T, IxDyn> {
        self.data.view()
    }

    /// Mutable view
    pub fn view_mut(&mut self) -> ArrayViewMut<'_, T, IxDyn> {
        self.data.view_mut()
    }

    /// Element at a multi-index
    pub fn get(&self, index: &[usize]) -> Option<&T> {
        self.data.get(IxDyn(index))
    }

    /// Mutable element at a multi-index
    pub fn get_mut(&mut self, index: &[usize]) -> Option<&mut T> {
        self.data.get_mut(IxDyn(index))
    }

    /// Elements in row-major order
    pub fn to_vec(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }

    /// Reshape, reading elements in row-major order
    pub fn reshape(&self, new_shape: &[usize]) -> NtkResult<Self> {
        let new_len: usize = new_shape.iter().product();
        if new_len != self.len() {
            return Err(NtkError::shape_mismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape(),
                new_shape
            )));
        }
        Self::from_vec(self.to_vec(), new_shape)
    }

    /// Reorder axes; `axes[i]` is the source axis placed at position `i`
    pub fn permute(&self, axes: &[usize]) -> NtkResult<Self> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if axes.len() != rank {
            return Err(NtkError::invalid_axes(format!(
                "permutation {:?} has wrong length for rank {}",
                axes, rank
            )));
        }
        for &a in axes {
            if a >= rank || seen[a] {
                return Err(NtkError::invalid_axes(format!(
                    "{:?} is not a permutation of 0..{}",
                    axes, rank
                )));
            }
            seen[a] = true;
        }
        let permuted = self.data.clone().permuted_axes(IxDyn(axes));
        Ok(Self {
            data: permuted.as_standard_layout().to_owned(),
        })
    }

    /// Example `index` along `axis`, keeping the axis with size 1
    ///
    /// # Examples
    ///
    /// ```
    /// use ntkrs_core::dense::DenseND;
    ///
    /// let t = DenseND::from_vec((0..6).map(|v| v as f64).collect(), &[3, 2]).unwrap();
    /// let row = t.select_example(0, 2).unwrap();
    /// assert_eq!(row.shape(), &[1, 2]);
    /// assert_eq!(row.to_vec(), vec![4.0, 5.0]);
    /// ```
    pub fn select_example(&self, axis: usize, index: usize) -> NtkResult<Self> {
        self.check_axis(axis)?;
        if index >= self.shape()[axis] {
            return Err(NtkError::shape_mismatch(format!(
                "index {} out of bounds for axis {} of size {}",
                index,
                axis,
                self.shape()[axis]
            )));
        }
        let slice = self
            .data
            .index_axis(NdAxis(axis), index)
            .insert_axis(NdAxis(axis))
            .to_owned();
        Ok(Self { data: slice })
    }

    /// Remove `index` along `axis` entirely
    pub fn index_axis(&self, axis: usize, index: usize) -> NtkResult<Self> {
        self.check_axis(axis)?;
        if index >= self.shape()[axis] {
            return Err(NtkError::shape_mismatch(format!(
                "index {} out of bounds for axis {} of size {}",
                index,
                axis,
                self.shape()[axis]
            )));
        }
        Ok(Self {
            data: self.data.index_axis(NdAxis(axis), index).to_owned(),
        })
    }

    /// Insert a new axis of size 1
    pub fn insert_axis(&self, axis: usize) -> NtkResult<Self> {
        if axis > self.rank() {
            return Err(NtkError::invalid_axes(format!(
                "cannot insert axis {} into rank {}",
                axis,
                self.rank()
            )));
        }
        Ok(Self {
            data: self.data.clone().insert_axis(NdAxis(axis)),
        })
    }

    /// Concatenate along an existing axis
    pub fn concatenate(tensors: &[Self], axis: usize) -> NtkResult<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| NtkError::shape_mismatch("cannot concatenate an empty list"))?;
        first.check_axis(axis)?;
        for t in tensors.iter().skip(1) {
            let compatible = t.rank() == first.rank()
                && t
                    .shape()
                    .iter()
                    .zip(first.shape())
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !compatible {
                return Err(NtkError::shapes_differ(
                    "concatenate",
                    first.shape(),
                    t.shape(),
                ));
            }
        }
        let views: Vec<_> = tensors.iter().map(|t| t.data.view()).collect();
        let data = ndarray::concatenate(NdAxis(axis), &views)
            .map_err(|e| NtkError::shape_mismatch(e.to_string()))?;
        Ok(Self { data })
    }

    fn check_axis(&self, axis: usize) -> NtkResult<()> {
        if axis >= self.rank() {
            return Err(NtkError::invalid_axes(format!(
                "axis {} out of range for rank {}",
                axis,
                self.rank()
            )));
        }
        Ok(())
    }
}

impl<T: Scalar> DenseND<T> {
    /// Tensor with i.i.d. `N(mean, std^2)` entries drawn from `rng`
    pub fn random_normal<R: Rng + ?Sized>(
        shape: &[usize],
        mean: f64,
        std: f64,
        rng: &mut R,
    ) -> NtkResult<Self> {
        let n: usize = shape.iter().product();
        let values = (0..n)
            .map(|_| {
                let z: f64 = rng.sample(StandardNormal);
                cast(mean + std * z)
            })
            .collect::<NtkResult<Vec<T>>>()?;
        Self::from_vec(values, shape)
    }

    /// One-hot tensor: zero everywhere except `1` at row-major position `flat`
    pub fn one_hot(shape: &[usize], flat: usize) -> NtkResult<Self> {
        let mut t = Self::zeros(shape);
        let slot = t
            .data
            .as_slice_mut()
            .and_then(|s| s.get_mut(flat))
            .ok_or_else(|| {
                NtkError::shape_mismatch(format!(
                    "one-hot position {} out of range for shape {:?}",
                    flat, shape
                ))
            })?;
        *slot = T::one();
        Ok(t)
    }

    /// Elementwise `self + other`
    pub fn add(&self, other: &Self) -> NtkResult<Self> {
        self.check_same_shape(other, "add")?;
        Ok(Self {
            data: &self.data + &other.data,
        })
    }

    /// Elementwise `self - other`
    pub fn sub(&self, other: &Self) -> NtkResult<Self> {
        self.check_same_shape(other, "sub")?;
        Ok(Self {
            data: &self.data - &other.data,
        })
    }

    /// Elementwise product
    pub fn mul(&self, other: &Self) -> NtkResult<Self> {
        self.check_same_shape(other, "mul")?;
        Ok(Self {
            data: &self.data * &other.data,
        })
    }

    /// In-place `self += other`
    pub fn add_assign(&mut self, other: &Self) -> NtkResult<()> {
        self.check_same_shape(other, "add_assign")?;
        self.data += &other.data;
        Ok(())
    }

    /// Multiply every element by `factor`
    pub fn scale(&self, factor: T) -> Self {
        Self {
            data: &self.data * factor,
        }
    }

    /// Apply `f` elementwise
    pub fn map(&self, f: impl Fn(T) -> T) -> Self {
        Self {
            data: self.data.mapv(f),
        }
    }

    /// Sum of elementwise products
    pub fn dot(&self, other: &Self) -> NtkResult<T> {
        self.check_same_shape(other, "dot")?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .fold(T::zero(), |acc, (&a, &b)| acc + a * b))
    }

    /// Sum of all elements
    pub fn sum(&self) -> T {
        self.data.sum()
    }

    /// Frobenius norm
    pub fn frobenius_norm(&self) -> T {
        self.data
            .iter()
            .fold(T::zero(), |acc, &x| acc + x * x)
            .sqrt()
    }

    /// Largest absolute elementwise difference
    ///
    /// # Examples
    ///
    /// ```
    /// use ntkrs_core::dense::DenseND;
    ///
    /// let a = DenseND::from_vec(vec![1.0, 2.0], &[2]).unwrap();
    /// let b = DenseND::from_vec(vec![1.5, 1.0], &[2]).unwrap();
    /// assert_eq!(a.max_abs_diff(&b).unwrap(), 1.0);
    /// ```
    pub fn max_abs_diff(&self, other: &Self) -> NtkResult<T> {
        self.check_same_shape(other, "max_abs_diff")?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .fold(T::zero(), |acc, (&a, &b)| acc.max((a - b).abs())))
    }

    fn check_same_shape(&self, other: &Self, op: &str) -> NtkResult<()> {
        if self.shape() != other.shape() {
            return Err(NtkError::shapes_differ(op, self.shape(), other.shape()));
        }
        Ok(())
    }
}

impl<T> std::ops::Index<&[usize]> for DenseND<T> {
    type Output = T;
    fn index(&self, index: &[usize]) -> &Self::Output {
        &self.data[IxDyn(index)]
    }
}

impl<T: fmt::Debug> fmt::Debug for DenseND<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenseND")
            .field("shape", &self.data.shape())
            .field("data", &self.data)
            .finish()
    }
}
