//! Fully connected layer over the last axis

use crate::affine::{self, AffineMatrices, AffineParams};
use crate::layer::{expect_leaf, expect_leaf_shape, to_matrix, from_matrix, Layer, PrimitiveTap, Tree};
use ntkrs_core::{DenseND, NtTree, NtkError, NtkResult, Scalar, Shapes};
use ntkrs_planner::{NetworkStats, SiteKind, SiteStats};
use rand::rngs::StdRng;

/// Default standard deviation of bias initialization
pub const DEFAULT_BIAS_STD: f64 = 1e-6;

/// `y = x·W + b` applied over the last axis of a single tensor
///
/// Weights are Glorot-normal initialized, biases `N(0, 1e-6)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    /// Output features
    pub out_dim: usize,
    /// Whether to add a bias
    pub use_bias: bool,
    /// Bias initialization standard deviation
    pub bias_std: f64,
}

impl Dense {
    /// Dense layer with bias
    pub fn new(out_dim: usize) -> Self {
        Self {
            out_dim,
            use_bias: true,
            bias_std: DEFAULT_BIAS_STD,
        }
    }

    /// Drop the bias term
    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }

    /// Set the bias initialization scale
    pub fn with_bias_std(mut self, std: f64) -> Self {
        self.bias_std = std;
        self
    }

    fn out_shape(&self, in_shape: &[usize]) -> NtkResult<Vec<usize>> {
        if in_shape.is_empty() {
            return Err(NtkError::shape_mismatch("dense needs an input of rank >= 1"));
        }
        let mut out = in_shape.to_vec();
        if let Some(last) = out.last_mut() {
            *last = self.out_dim;
        }
        Ok(out)
    }

    // (positions, fan_in)
    fn rows(in_shape: &[usize]) -> (usize, usize) {
        let fan_in = in_shape.last().copied().unwrap_or(1);
        let positions = in_shape[..in_shape.len().saturating_sub(1)].iter().product();
        (positions, fan_in)
    }

    fn unpack<T: Scalar>(
        &self,
        params: &Tree<T>,
        fan_in: usize,
    ) -> NtkResult<(AffineParams<T>, AffineMatrices<T>)> {
        let p = AffineParams::from_tree(params, self.use_bias)?;
        if p.weight.shape() != [fan_in, self.out_dim] {
            return Err(NtkError::shapes_differ(
                "dense weight",
                &[fan_in, self.out_dim],
                p.weight.shape(),
            ));
        }
        let m = AffineMatrices::from_params(&p, fan_in, self.out_dim)?;
        Ok((p, m))
    }
}

impl<T: Scalar> Layer<T> for Dense {
    fn name(&self) -> String {
        format!("Dense({})", self.out_dim)
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(NtTree::leaf(
            self.out_shape(expect_leaf_shape(input_shape, "dense")?)?,
        ))
    }

    fn init(&self, rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        let in_shape = expect_leaf_shape(input_shape, "dense")?;
        let out_shape = self.out_shape(in_shape)?;
        let (_, fan_in) = Self::rows(in_shape);
        let std = (2.0 / (fan_in + self.out_dim) as f64).sqrt();
        let weight = DenseND::random_normal(&[fan_in, self.out_dim], 0.0, std, rng)?;
        let bias = if self.use_bias {
            Some(DenseND::random_normal(&[self.out_dim], 0.0, self.bias_std, rng)?)
        } else {
            None
        };
        Ok((NtTree::leaf(out_shape), AffineParams { weight, bias }.to_tree()))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        let in_shape = expect_leaf_shape(input_shape, "dense")?;
        let (_, fan_in) = Self::rows(in_shape);
        Ok((
            NtTree::leaf(self.out_shape(in_shape)?),
            affine::param_shapes(&[fan_in, self.out_dim], self.use_bias.then_some(self.out_dim)),
        ))
    }

    fn apply(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let x = expect_leaf(input, "dense")?;
        let out_shape = self.out_shape(x.shape())?;
        let (rows, fan_in) = Self::rows(x.shape());
        let (_, m) = self.unpack(params, fan_in)?;
        let z = affine::forward(&to_matrix(x, rows, fan_in)?, &m);
        Ok(NtTree::leaf(from_matrix(&z, &out_shape)?))
    }

    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let x = expect_leaf(input, "dense")?;
        let x_dot = expect_leaf(input_dot, "dense")?;
        let out_shape = self.out_shape(x.shape())?;
        let (rows, fan_in) = Self::rows(x.shape());
        let (_, m) = self.unpack(params, fan_in)?;
        let (_, m_dot) = self.unpack(params_dot, fan_in)?;
        let p = to_matrix(x, rows, fan_in)?;
        let p_dot = to_matrix(x_dot, rows, fan_in)?;
        let z = affine::forward(&p, &m);
        let z_dot = affine::tangent(&p, &p_dot, &m, &m_dot);
        Ok((
            NtTree::leaf(from_matrix(&z, &out_shape)?),
            NtTree::leaf(from_matrix(&z_dot, &out_shape)?),
        ))
    }

    fn vjp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let x = expect_leaf(input, "dense")?;
        let g = expect_leaf(cotangent, "dense cotangent")?;
        let (rows, fan_in) = Self::rows(x.shape());
        let (p, m) = self.unpack(params, fan_in)?;
        let patches = to_matrix(x, rows, fan_in)?;
        let g = to_matrix(g, rows, self.out_dim)?;
        let ct = affine::cotangent(SiteKind::Dense, &patches, &m, &g, tap)?;
        Ok((
            affine::param_cotangent_tree(&p, &ct)?,
            NtTree::leaf(from_matrix(&ct.patches, x.shape())?),
        ))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let in_shape = expect_leaf_shape(input_shape, "dense")?;
        let (positions, fan_in) = Self::rows(in_shape);
        stats.add_site(SiteStats {
            kind: SiteKind::Dense,
            positions,
            fan_in,
            fan_out: self.out_dim,
            has_bias: self.use_bias,
        });
        <Self as Layer<T>>::output_shape(self, input_shape)
    }

    fn is_traceable(&self) -> bool {
        true
    }
}
