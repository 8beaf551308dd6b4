//! 2D convolution in NHWC / HWIO layout
//!
//! The convolution is lowered to the shared affine primitive through an
//! im2col patch matrix: one row per output position `(n, oy, ox)`, one
//! column per patch entry `(ky, kx, c_in)`. The HWIO kernel reshapes to the
//! `(kh·kw·c_in, c_out)` weight matrix without any transposition.
//!
//! Padding follows the usual `VALID` / `SAME` rules: `SAME` keeps
//! `ceil(size / stride)` output positions and places the extra padding
//! element, if any, after the input.

use crate::affine::{self, AffineMatrices, AffineParams};
use crate::dense::DEFAULT_BIAS_STD;
use crate::layer::{
    expect_leaf, expect_leaf_shape, from_matrix, Layer, PrimitiveTap, Tree,
};
use ndarray::Array2;
use ntkrs_core::{DenseND, NtTree, NtkError, NtkResult, Scalar, Shapes};
use ntkrs_planner::{NetworkStats, SiteKind, SiteStats};
use rand::rngs::StdRng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Spatial padding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Padding {
    /// No padding; windows must fit inside the input
    #[default]
    Valid,
    /// Zero padding so that `out = ceil(in / stride)`
    Same,
}

/// Resolved geometry of one convolution call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl ConvGeometry {
    /// Rows of the patch matrix
    pub fn positions(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    /// Columns of the patch matrix
    pub fn patch_len(&self) -> usize {
        self.kernel_h * self.kernel_w * self.in_c
    }

    // Input coordinate for output position `o` and kernel offset `k`, if inside
    fn source(o: usize, k: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
        (o * stride + k).checked_sub(pad).filter(|&i| i < size)
    }

    /// Gather the patch matrix from an NHWC tensor
    pub fn im2col<T: Scalar>(&self, x: &DenseND<T>) -> Array2<T> {
        let src = x.as_array();
        let mut cols = Array2::zeros((self.positions(), self.patch_len()));
        for n in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    let row = (n * self.out_h + oy) * self.out_w + ox;
                    for ky in 0..self.kernel_h {
                        let Some(iy) =
                            Self::source(oy, ky, self.stride_h, self.pad_top, self.in_h)
                        else {
                            continue;
                        };
                        for kx in 0..self.kernel_w {
                            let Some(ix) =
                                Self::source(ox, kx, self.stride_w, self.pad_left, self.in_w)
                            else {
                                continue;
                            };
                            let base = (ky * self.kernel_w + kx) * self.in_c;
                            for c in 0..self.in_c {
                                cols[[row, base + c]] = src[&[n, iy, ix, c][..]];
                            }
                        }
                    }
                }
            }
        }
        cols
    }

    /// Scatter-add a patch-matrix cotangent back onto an NHWC tensor
    pub fn col2im<T: Scalar>(&self, cols: &Array2<T>) -> DenseND<T> {
        let mut out = DenseND::zeros(&[self.batch, self.in_h, self.in_w, self.in_c]);
        let dst = out.as_array_mut();
        for n in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    let row = (n * self.out_h + oy) * self.out_w + ox;
                    for ky in 0..self.kernel_h {
                        let Some(iy) =
                            Self::source(oy, ky, self.stride_h, self.pad_top, self.in_h)
                        else {
                            continue;
                        };
                        for kx in 0..self.kernel_w {
                            let Some(ix) =
                                Self::source(ox, kx, self.stride_w, self.pad_left, self.in_w)
                            else {
                                continue;
                            };
                            let base = (ky * self.kernel_w + kx) * self.in_c;
                            for c in 0..self.in_c {
                                dst[&[n, iy, ix, c][..]] += cols[[row, base + c]];
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// 2D convolution layer
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    /// Output channels
    pub out_chan: usize,
    /// Kernel size `(kh, kw)`
    pub filter: (usize, usize),
    /// Strides `(sh, sw)`
    pub strides: (usize, usize),
    /// Padding mode
    pub padding: Padding,
    /// Whether to add a bias
    pub use_bias: bool,
    /// Bias initialization standard deviation
    pub bias_std: f64,
}

impl Conv {
    /// Unit-stride, `VALID`-padded convolution with bias
    pub fn new(out_chan: usize, filter: (usize, usize)) -> Self {
        Self {
            out_chan,
            filter,
            strides: (1, 1),
            padding: Padding::Valid,
            use_bias: true,
            bias_std: DEFAULT_BIAS_STD,
        }
    }

    /// Set the strides
    pub fn with_strides(mut self, strides: (usize, usize)) -> Self {
        self.strides = strides;
        self
    }

    /// Set the padding mode
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Drop the bias term
    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }

    /// Resolve output size and padding for an NHWC input shape
    pub fn geometry(&self, in_shape: &[usize]) -> NtkResult<ConvGeometry> {
        let &[batch, in_h, in_w, in_c] = in_shape else {
            return Err(NtkError::shape_mismatch(format!(
                "conv expects an NHWC input of rank 4, got {:?}",
                in_shape
            )));
        };
        let (kh, kw) = self.filter;
        let (sh, sw) = self.strides;
        if kh == 0 || kw == 0 || sh == 0 || sw == 0 {
            return Err(NtkError::shape_mismatch(format!(
                "conv filter {:?} and strides {:?} must be positive",
                self.filter, self.strides
            )));
        }
        let resolve = |size: usize, k: usize, s: usize| -> NtkResult<(usize, usize)> {
            match self.padding {
                Padding::Valid => {
                    if size < k {
                        return Err(NtkError::shape_mismatch(format!(
                            "VALID conv window {} exceeds input size {}",
                            k, size
                        )));
                    }
                    Ok(((size - k) / s + 1, 0))
                }
                Padding::Same => {
                    let out = size.div_ceil(s);
                    let total = (out.saturating_sub(1) * s + k).saturating_sub(size);
                    Ok((out, total / 2))
                }
            }
        };
        let (out_h, pad_top) = resolve(in_h, kh, sh)?;
        let (out_w, pad_left) = resolve(in_w, kw, sw)?;
        Ok(ConvGeometry {
            batch,
            in_h,
            in_w,
            in_c,
            out_h,
            out_w,
            kernel_h: kh,
            kernel_w: kw,
            stride_h: sh,
            stride_w: sw,
            pad_top,
            pad_left,
        })
    }

    fn out_shape(&self, g: &ConvGeometry) -> Vec<usize> {
        vec![g.batch, g.out_h, g.out_w, self.out_chan]
    }

    fn kernel_shape(&self, in_c: usize) -> [usize; 4] {
        [self.filter.0, self.filter.1, in_c, self.out_chan]
    }

    fn unpack<T: Scalar>(
        &self,
        params: &Tree<T>,
        g: &ConvGeometry,
    ) -> NtkResult<(AffineParams<T>, AffineMatrices<T>)> {
        let p = AffineParams::from_tree(params, self.use_bias)?;
        let expected = self.kernel_shape(g.in_c);
        if p.weight.shape() != expected {
            return Err(NtkError::shapes_differ("conv kernel", &expected, p.weight.shape()));
        }
        let m = AffineMatrices::from_params(&p, g.patch_len(), self.out_chan)?;
        Ok((p, m))
    }
}

impl<T: Scalar> Layer<T> for Conv {
    fn name(&self) -> String {
        format!(
            "Conv({}, {:?}, {:?}, {:?})",
            self.out_chan, self.filter, self.strides, self.padding
        )
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        let g = self.geometry(expect_leaf_shape(input_shape, "conv")?)?;
        Ok(NtTree::leaf(self.out_shape(&g)))
    }

    fn init(&self, rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        let g = self.geometry(expect_leaf_shape(input_shape, "conv")?)?;
        let receptive = self.filter.0 * self.filter.1;
        let fan_in = receptive * g.in_c;
        let fan_out = receptive * self.out_chan;
        let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
        let weight = DenseND::random_normal(&self.kernel_shape(g.in_c), 0.0, std, rng)?;
        let bias = if self.use_bias {
            Some(DenseND::random_normal(&[self.out_chan], 0.0, self.bias_std, rng)?)
        } else {
            None
        };
        Ok((
            NtTree::leaf(self.out_shape(&g)),
            AffineParams { weight, bias }.to_tree(),
        ))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        let g = self.geometry(expect_leaf_shape(input_shape, "conv")?)?;
        Ok((
            NtTree::leaf(self.out_shape(&g)),
            affine::param_shapes(
                &self.kernel_shape(g.in_c),
                self.use_bias.then_some(self.out_chan),
            ),
        ))
    }

    fn apply(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let x = expect_leaf(input, "conv")?;
        let g = self.geometry(x.shape())?;
        let (_, m) = self.unpack(params, &g)?;
        let z = affine::forward(&g.im2col(x), &m);
        Ok(NtTree::leaf(from_matrix(&z, &self.out_shape(&g))?))
    }

    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let x = expect_leaf(input, "conv")?;
        let x_dot = expect_leaf(input_dot, "conv")?;
        if x_dot.shape() != x.shape() {
            return Err(NtkError::shapes_differ("conv tangent", x.shape(), x_dot.shape()));
        }
        let g = self.geometry(x.shape())?;
        let (_, m) = self.unpack(params, &g)?;
        let (_, m_dot) = self.unpack(params_dot, &g)?;
        let p = g.im2col(x);
        let p_dot = g.im2col(x_dot);
        let out_shape = self.out_shape(&g);
        Ok((
            NtTree::leaf(from_matrix(&affine::forward(&p, &m), &out_shape)?),
            NtTree::leaf(from_matrix(
                &affine::tangent(&p, &p_dot, &m, &m_dot),
                &out_shape,
            )?),
        ))
    }

    fn vjp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let x = expect_leaf(input, "conv")?;
        let ct = expect_leaf(cotangent, "conv cotangent")?;
        let g = self.geometry(x.shape())?;
        let (p, m) = self.unpack(params, &g)?;
        let patches = g.im2col(x);
        let ct = crate::layer::to_matrix(ct, g.positions(), self.out_chan)?;
        let out = affine::cotangent(SiteKind::Conv, &patches, &m, &ct, tap)?;
        Ok((
            affine::param_cotangent_tree(&p, &out)?,
            NtTree::leaf(g.col2im(&out.patches)),
        ))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let g = self.geometry(expect_leaf_shape(input_shape, "conv")?)?;
        stats.add_site(SiteStats {
            kind: SiteKind::Conv,
            positions: g.positions(),
            fan_in: g.patch_len(),
            fan_out: self.out_chan,
            has_bias: self.use_bias,
        });
        Ok(NtTree::leaf(self.out_shape(&g)))
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::NoTap;
    use rand::SeedableRng;

    #[test]
    fn test_geometry_valid_and_same() {
        let conv = Conv::new(4, (3, 3));
        let g = conv.geometry(&[2, 8, 8, 3]).unwrap();
        assert_eq!((g.out_h, g.out_w), (6, 6));
        assert_eq!(g.patch_len(), 27);

        let same = conv.clone().with_padding(Padding::Same).with_strides((2, 2));
        let g = same.geometry(&[1, 7, 8, 3]).unwrap();
        assert_eq!((g.out_h, g.out_w), (4, 4));
        // (4-1)*2 + 3 - 7 = 2 rows of padding, one on top
        assert_eq!(g.pad_top, 1);
        // (4-1)*2 + 3 - 8 = 1 column of padding, none on the left
        assert_eq!(g.pad_left, 0);

        assert!(matches!(
            conv.geometry(&[1, 2, 8, 3]),
            Err(NtkError::ShapeMismatch(_))
        ));
        assert!(conv.geometry(&[8, 8, 3]).is_err());
    }

    #[test]
    fn test_identity_kernel() {
        // 1x1 conv with an identity kernel copies channels
        let conv = Conv::new(2, (1, 1)).without_bias();
        let params = AffineParams {
            weight: DenseND::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]).unwrap(),
            bias: None,
        }
        .to_tree();
        let x = DenseND::from_vec((0..18).map(f64::from).collect(), &[1, 3, 3, 2]).unwrap();
        let y = conv.apply(&params, &NtTree::leaf(x.clone())).unwrap();
        assert_eq!(y.as_leaf().unwrap(), &x);
    }

    #[test]
    fn test_box_filter_sums_window() {
        let conv = Conv::new(1, (2, 2)).without_bias();
        let params = AffineParams {
            weight: DenseND::ones(&[2, 2, 1, 1]),
            bias: None,
        }
        .to_tree();
        let x = DenseND::from_vec((1..=9).map(f64::from).collect(), &[1, 3, 3, 1]).unwrap();
        let y = conv.apply(&params, &NtTree::leaf(x)).unwrap();
        let y = y.as_leaf().unwrap();
        assert_eq!(y.shape(), &[1, 2, 2, 1]);
        assert_eq!(y.to_vec(), vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_col2im_is_adjoint_of_im2col() {
        let conv = Conv::new(1, (3, 2))
            .with_padding(Padding::Same)
            .with_strides((2, 1));
        let g = conv.geometry(&[2, 5, 4, 2]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let x = DenseND::<f64>::random_normal(&[2, 5, 4, 2], 0.0, 1.0, &mut rng).unwrap();
        let c = DenseND::<f64>::random_normal(&[g.positions(), g.patch_len()], 0.0, 1.0, &mut rng)
            .unwrap();
        let c = crate::layer::to_matrix(&c, g.positions(), g.patch_len()).unwrap();
        // <im2col(x), c> == <x, col2im(c)>
        let lhs: f64 = (&g.im2col(&x) * &c).sum();
        let rhs = x.dot(&g.col2im(&c)).unwrap();
        assert!((lhs - rhs).abs() < 1e-10);
    }

    #[test]
    fn test_vjp_shapes() {
        let conv = Conv::new(3, (2, 2)).with_padding(Padding::Same);
        let shape = NtTree::leaf(vec![1, 4, 4, 2]);
        let (out, params): (Shapes, Tree<f64>) =
            conv.init(&mut StdRng::seed_from_u64(1), &shape).unwrap();
        assert_eq!(out, NtTree::leaf(vec![1, 4, 4, 3]));
        let x = NtTree::leaf(DenseND::ones(&[1, 4, 4, 2]));
        let ct = NtTree::leaf(DenseND::ones(&[1, 4, 4, 3]));
        let (dp, dx) = conv.vjp(&params, &x, &ct, &mut NoTap).unwrap();
        assert_eq!(dp.shapes(), params.shapes());
        assert_eq!(dx.as_leaf().unwrap().shape(), &[1, 4, 4, 2]);
    }
}
