//! Weight-shared affine primitive
//!
//! Dense and convolutional layers both reduce to `Z = P·W + b` over a patch
//! matrix `P` (rows are positions, columns are patch entries). This module
//! holds the parameter record and the forward, tangent and cotangent rules
//! shared by both.

use crate::layer::{AffineSite, PrimitiveTap};
use ndarray::{Array1, Array2, Axis as NdAxis};
use ntkrs_core::record::{self, FieldSpec, FieldValue, MetaValue, Record};
use ntkrs_core::{DenseND, NtTree, NtkError, NtkResult, Scalar, Shapes, StructuredValue};
use ntkrs_planner::SiteKind;

/// Parameters of an affine primitive
///
/// Registered as a record: `weight` and `bias` are data fields, `has_bias`
/// is metadata. A bias-free primitive stores an empty tuple in `bias`.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineParams<T> {
    /// Weight tensor; its trailing axis is the output channel axis
    pub weight: DenseND<T>,
    /// Bias vector
    pub bias: Option<DenseND<T>>,
}

impl<T: Scalar> Record<T> for AffineParams<T> {
    const TYPE_NAME: &'static str = "AffineParams";

    fn fields() -> &'static [FieldSpec] {
        const FIELDS: [FieldSpec; 3] = [
            FieldSpec::data("weight"),
            FieldSpec::data("bias"),
            FieldSpec::meta("has_bias"),
        ];
        &FIELDS
    }

    fn to_fields(&self) -> Vec<FieldValue<T>> {
        vec![
            FieldValue::Data(NtTree::leaf(self.weight.clone())),
            FieldValue::Data(match &self.bias {
                Some(b) => NtTree::leaf(b.clone()),
                None => NtTree::empty(),
            }),
            FieldValue::Meta(MetaValue::Bool(self.bias.is_some())),
        ]
    }

    fn from_fields(fields: Vec<FieldValue<T>>) -> NtkResult<Self> {
        let mut it = fields.into_iter();
        let weight = record::take_leaf(it.next(), "weight")?;
        let bias_tree = record::take_tree(it.next(), "bias")?;
        let has_bias = record::take_bool(it.next(), "has_bias")?;
        let bias = match (has_bias, bias_tree) {
            (true, NtTree::Leaf(b)) => Some(b),
            (false, t) if t.num_leaves() == 0 => None,
            _ => {
                return Err(NtkError::structure_mismatch(
                    "bias field disagrees with has_bias",
                ))
            }
        };
        Ok(Self { weight, bias })
    }
}

impl<T: Scalar> AffineParams<T> {
    /// Parameter tree for a layer
    pub fn to_tree(&self) -> StructuredValue<T> {
        record::to_data_tree(self)
    }

    /// Read back a parameter tree produced by [`AffineParams::to_tree`]
    pub fn from_tree(tree: &StructuredValue<T>, has_bias: bool) -> NtkResult<Self> {
        record::from_data_tree(tree, vec![MetaValue::Bool(has_bias)])
    }
}

/// Shapes of the tree [`AffineParams::to_tree`] builds
pub fn param_shapes(weight: &[usize], bias: Option<usize>) -> Shapes {
    NtTree::tuple(vec![
        NtTree::leaf(weight.to_vec()),
        bias.map_or_else(NtTree::empty, |b| NtTree::leaf(vec![b])),
    ])
}

/// Parameters as matrices: `W` is `(fan_in, fan_out)`
pub(crate) struct AffineMatrices<T> {
    pub weight: Array2<T>,
    pub bias: Option<Array1<T>>,
}

impl<T: Scalar> AffineMatrices<T> {
    pub fn from_params(p: &AffineParams<T>, fan_in: usize, fan_out: usize) -> NtkResult<Self> {
        let weight = crate::layer::to_matrix(&p.weight, fan_in, fan_out)?;
        let bias = match &p.bias {
            Some(b) if b.len() == fan_out => Some(Array1::from(b.to_vec())),
            Some(b) => return Err(NtkError::shapes_differ("bias", &[fan_out], b.shape())),
            None => None,
        };
        Ok(Self { weight, bias })
    }
}

/// `P·W + b`
pub(crate) fn forward<T: Scalar>(patches: &Array2<T>, m: &AffineMatrices<T>) -> Array2<T> {
    let mut z = patches.dot(&m.weight);
    if let Some(b) = &m.bias {
        z += b;
    }
    z
}

/// `P·Ẇ + ḃ + Ṗ·W`
pub(crate) fn tangent<T: Scalar>(
    patches: &Array2<T>,
    patches_dot: &Array2<T>,
    m: &AffineMatrices<T>,
    m_dot: &AffineMatrices<T>,
) -> Array2<T> {
    let mut z_dot = patches.dot(&m_dot.weight) + patches_dot.dot(&m.weight);
    if let Some(b) = &m_dot.bias {
        z_dot += b;
    }
    z_dot
}

/// Cotangents of one affine primitive
pub(crate) struct AffineCotangents<T> {
    pub weight: Array2<T>,
    pub bias: Option<Array1<T>>,
    pub patches: Array2<T>,
}

/// Reverse rule; reports the site to `tap` first
pub(crate) fn cotangent<T: Scalar>(
    kind: SiteKind,
    patches: &Array2<T>,
    m: &AffineMatrices<T>,
    g: &Array2<T>,
    tap: &mut dyn PrimitiveTap<T>,
) -> NtkResult<AffineCotangents<T>> {
    tap.on_affine(&AffineSite {
        kind,
        patches,
        cotangent: g,
        has_bias: m.bias.is_some(),
    })?;
    let (weight, bias) = if tap.wants_param_cotangents() {
        (
            patches.t().dot(g),
            m.bias.as_ref().map(|_| g.sum_axis(NdAxis(0))),
        )
    } else {
        (
            Array2::zeros(m.weight.raw_dim()),
            m.bias.as_ref().map(|b| Array1::zeros(b.len())),
        )
    };
    Ok(AffineCotangents {
        weight,
        bias,
        patches: g.dot(&m.weight.t()),
    })
}

/// Parameter cotangent tree shaped like `params`
pub(crate) fn param_cotangent_tree<T: Scalar>(
    params: &AffineParams<T>,
    ct: &AffineCotangents<T>,
) -> NtkResult<StructuredValue<T>> {
    let weight = DenseND::from_vec(ct.weight.iter().copied().collect(), params.weight.shape())?;
    let bias = match &ct.bias {
        Some(b) => Some(DenseND::from_vec(b.to_vec(), &[b.len()])?),
        None => None,
    };
    Ok(AffineParams { weight, bias }.to_tree())
}
