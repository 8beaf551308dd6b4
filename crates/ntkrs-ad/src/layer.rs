//! Differentiable layers and the network wrapper
//!
//! A [`Layer`] is an (init, apply) pair with hand-written forward-mode
//! ([`Layer::jvp`]) and reverse-mode ([`Layer::vjp`]) rules. Layers compose
//! through the combinators in [`crate::combinators`]; a [`Network`] wraps the
//! root layer and exposes the `init_fn` / `apply_fn` pair.
//!
//! During a reverse pass every weight-shared affine primitive reports its
//! patch matrix and output cotangent to a [`PrimitiveTap`]. That hook is what
//! lets the structured-derivatives strategy decompose the Jacobian layer by
//! layer without ever forming it.

use ndarray::Array2;
use ntkrs_core::{numel, DenseND, NtTree, NtkError, NtkResult, Scalar, Shapes, StructuredValue};
use ntkrs_planner::{NetworkStats, SiteKind};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;

/// Structured value alias used throughout the substrate
pub type Tree<T> = StructuredValue<T>;

/// One affine primitive as seen during a reverse pass
///
/// The primitive computed `z[s, v] = Σ_u patches[s, u] · W[u, v] + b[v]`;
/// `cotangent[s, v]` is `∂L/∂z[s, v]`.
#[derive(Debug)]
pub struct AffineSite<'a, T> {
    /// Primitive kind
    pub kind: SiteKind,
    /// Patch matrix `(positions, fan_in)`
    pub patches: &'a Array2<T>,
    /// Output cotangent `(positions, fan_out)`
    pub cotangent: &'a Array2<T>,
    /// Whether the primitive has a bias vector
    pub has_bias: bool,
}

impl<T> AffineSite<'_, T> {
    /// Parameters owned by the primitive
    pub fn param_count(&self) -> usize {
        let (u, v) = (self.patches.ncols(), self.cotangent.ncols());
        u * v + if self.has_bias { v } else { 0 }
    }
}

/// Interception hook invoked by affine primitives during [`Layer::vjp`]
///
/// Sites are reported in reverse-pass order, which is deterministic for a
/// given network.
pub trait PrimitiveTap<T: Scalar> {
    /// Called once per affine primitive per reverse pass
    fn on_affine(&mut self, site: &AffineSite<'_, T>) -> NtkResult<()>;

    /// Whether the reverse pass must produce parameter cotangents
    ///
    /// Taps that only record sites return `false`; layers then return zero
    /// parameter cotangents and skip the weight-gradient products.
    fn wants_param_cotangents(&self) -> bool {
        true
    }
}

/// Tap that ignores every site
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTap;

impl<T: Scalar> PrimitiveTap<T> for NoTap {
    fn on_affine(&mut self, _site: &AffineSite<'_, T>) -> NtkResult<()> {
        Ok(())
    }
}

/// A differentiable layer
pub trait Layer<T: Scalar>: fmt::Debug + Send + Sync {
    /// Short human-readable name
    fn name(&self) -> String;

    /// Output shapes for the given input shapes
    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes>;

    /// Initialize parameters; returns the output shapes and the parameters
    fn init(&self, rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)>;

    /// Output shapes and the parameter shapes `init` would produce
    ///
    /// The default samples a throwaway initialization; built-in layers
    /// derive the shapes directly.
    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        let (out, params) = self.init(&mut StdRng::seed_from_u64(0), input_shape)?;
        Ok((out, params.shapes()))
    }

    /// Forward pass
    fn apply(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>>;

    /// Forward-mode derivative; returns `(output, output tangent)`
    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)>;

    /// Reverse-mode derivative; returns `(parameter cotangent, input cotangent)`
    fn vjp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)>;

    /// Accumulate per-example cost statistics; returns the output shapes
    ///
    /// The default treats the layer as opaque: its parameters are counted
    /// but not attributed to any primitive, which marks the network as not
    /// traceable.
    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let (out, params) = self.param_shapes(input_shape)?;
        let count: usize = params.leaves().into_iter().map(|s| numel(s)).sum();
        stats.add_untraced_params(count, 2.0 * count as f64);
        Ok(out)
    }

    /// Whether every parameter of this layer is owned by a reporting primitive
    fn is_traceable(&self) -> bool {
        false
    }
}

/// A network: the root layer behind shared ownership
#[derive(Debug, Clone)]
pub struct Network<T: Scalar> {
    layer: Arc<dyn Layer<T>>,
}

impl<T: Scalar> Network<T> {
    /// Wrap a layer
    pub fn new(layer: impl Layer<T> + 'static) -> Self {
        Self {
            layer: Arc::new(layer),
        }
    }

    /// Wrap a boxed layer
    pub fn from_boxed(layer: Box<dyn Layer<T>>) -> Self {
        Self {
            layer: Arc::from(layer),
        }
    }

    /// Root layer
    pub fn layer(&self) -> &dyn Layer<T> {
        self.layer.as_ref()
    }

    /// Initialize parameters deterministically from `seed`
    pub fn init_fn(&self, seed: u64, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.layer.init(&mut rng, input_shape)
    }

    /// Evaluate the network
    pub fn apply_fn(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        self.layer.apply(params, input)
    }

    /// Output shapes for the given input shapes
    pub fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        self.layer.output_shape(input_shape)
    }

    /// Parameter shapes the initializer declares for these input shapes
    pub fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(self.layer.param_shapes(input_shape)?.1)
    }

    /// Fail with [`NtkError::ShapeMismatch`] unless `params` matches the initializer
    pub fn check_params(&self, params: &Tree<T>, input_shape: &Shapes) -> NtkResult<()> {
        let expected = self.param_shapes(input_shape)?;
        let got = params.shapes();
        if expected != got {
            return Err(NtkError::shape_mismatch(format!(
                "parameters {:?} do not match the shapes declared by {} ({:?})",
                got,
                self.layer.name(),
                expected
            )));
        }
        Ok(())
    }

    /// Per-example cost statistics
    pub fn profile(&self, example_shape: &Shapes) -> NtkResult<NetworkStats> {
        let mut stats = NetworkStats::new();
        self.layer.profile(example_shape, &mut stats)?;
        stats.traceable &= self.layer.is_traceable();
        Ok(stats)
    }

    /// Whether the structured-derivatives strategy can run
    pub fn is_traceable(&self) -> bool {
        self.layer.is_traceable()
    }
}

/// Borrow the single tensor of a leaf
pub fn expect_leaf<'a, T>(tree: &'a NtTree<T>, who: &str) -> NtkResult<&'a T> {
    tree.as_leaf()
        .ok_or_else(|| NtkError::structure_mismatch(format!("{} expects a single tensor", who)))
}

/// Borrow the shape of a leaf
pub fn expect_leaf_shape<'a>(shapes: &'a Shapes, who: &str) -> NtkResult<&'a [usize]> {
    Ok(expect_leaf(shapes, who)?.as_slice())
}

/// Borrow exactly `n` parameter groups
pub fn param_groups<'a, T>(
    params: &'a NtTree<T>,
    n: usize,
    who: &str,
) -> NtkResult<&'a [NtTree<T>]> {
    match params.children() {
        Some(groups) if groups.len() == n => Ok(groups),
        _ => Err(NtkError::structure_mismatch(format!(
            "{} expects a tuple of {} parameter groups",
            who, n
        ))),
    }
}

/// Constructor of the container kind (list or tuple) a value arrived in
pub type Rebuild<T> = fn(Vec<NtTree<T>>) -> NtTree<T>;

/// Borrow the children of a list or tuple input along with its constructor
pub fn branches<'a, T>(tree: &'a NtTree<T>, who: &str) -> NtkResult<(&'a [NtTree<T>], Rebuild<T>)> {
    match tree {
        NtTree::List(c) => Ok((c.as_slice(), NtTree::List as Rebuild<T>)),
        NtTree::Tuple(c) => Ok((c.as_slice(), NtTree::Tuple as Rebuild<T>)),
        NtTree::Leaf(_) => Err(NtkError::structure_mismatch(format!(
            "{} expects a list or tuple input",
            who
        ))),
    }
}

/// Copy a tensor into a matrix of the given shape
pub(crate) fn to_matrix<T: Scalar>(
    t: &DenseND<T>,
    rows: usize,
    cols: usize,
) -> NtkResult<Array2<T>> {
    Array2::from_shape_vec((rows, cols), t.to_vec()).map_err(|_| {
        NtkError::shape_mismatch(format!(
            "cannot view {:?} as a {}x{} matrix",
            t.shape(),
            rows,
            cols
        ))
    })
}

/// Copy a matrix into a tensor of the given shape
pub(crate) fn from_matrix<T: Scalar>(m: &Array2<T>, shape: &[usize]) -> NtkResult<DenseND<T>> {
    DenseND::from_vec(m.iter().copied().collect(), shape)
}
