//! End-to-end tests for ntkrs
//!
//! Covers the minimal CNN scenario, kernel symmetry and positive
//! semi-definiteness, idempotence, axis validation, and networks containing
//! a custom layer that the structured strategy cannot trace.

use anyhow::Result;
use ntkrs::ad::gradcheck::{check_input_vjp, check_jvp, check_vjp, GradCheckConfig};
use ntkrs::ad::{PrimitiveTap, Tree};
use ntkrs::core::record::{self, FieldSpec, FieldValue, MetaValue};
use ntkrs::core::{Shapes, TreeRegistry};
use ntkrs::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn random(shape: &[usize], seed: u64) -> Result<StructuredValue<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(NtTree::leaf(DenseND::random_normal(shape, 0.0, 1.0, &mut rng)?))
}

fn cnn() -> Network<f64> {
    Network::from_boxed(stax::serial(vec![
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::flatten(),
        stax::dense(10),
    ]))
}

const ALL: [NtkImplementation; 4] = [
    NtkImplementation::JacobianContraction,
    NtkImplementation::NtkVectorProducts,
    NtkImplementation::StructuredDerivatives,
    NtkImplementation::Auto,
];

#[test]
fn test_minimal_cnn_scenario() -> Result<()> {
    let x1 = random(&[6, 8, 8, 3], 1)?;
    let x2 = random(&[3, 8, 8, 3], 2)?;
    let net = cnn();
    let (_, params) = net.init_fn(3, &NtTree::leaf(vec![6, 8, 8, 3]))?;

    let mut kernels = Vec::new();
    for implementation in ALL {
        let kernel_fn = build_kernel_fn(net.clone(), TraceAxes::none(), 0isize, implementation)?;
        let k = kernel_fn.call(&x2, &x1, &params)?;
        assert_eq!(
            k.as_leaf().map(|l| l.shape().to_vec()),
            Some(vec![6, 3, 10, 10]),
            "{}",
            implementation
        );
        kernels.push(k);
    }
    for a in &kernels {
        for b in &kernels {
            assert!(a.max_abs_diff(b)? < 1e-4);
        }
    }
    Ok(())
}

#[test]
fn test_minimal_cnn_scenario_f32() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let x1 = NtTree::leaf(DenseND::<f32>::random_normal(&[6, 8, 8, 3], 0.0, 1.0, &mut rng)?);
    let x2 = NtTree::leaf(DenseND::<f32>::random_normal(&[3, 8, 8, 3], 0.0, 1.0, &mut rng)?);
    let net: Network<f32> = Network::from_boxed(stax::serial(vec![
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::relu(),
        stax::conv(32, (3, 3)),
        stax::flatten(),
        stax::dense(10),
    ]));
    let (_, params) = net.init_fn(3, &NtTree::leaf(vec![6, 8, 8, 3]))?;

    let kernels = ALL
        .iter()
        .map(|&implementation| {
            build_kernel_fn(net.clone(), TraceAxes::none(), 0isize, implementation)?
                .call(&x2, &x1, &params)
        })
        .collect::<NtkResult<Vec<_>>>()?;
    for k in &kernels {
        assert_eq!(
            k.as_leaf().map(|l| l.shape().to_vec()),
            Some(vec![6, 3, 10, 10])
        );
    }
    for a in &kernels {
        for b in &kernels {
            assert!(a.max_abs_diff(b)? < 1e-4);
        }
    }
    Ok(())
}

/// `(n, n, F, F)` kernel as an `(n·F, n·F)` matrix
fn as_matrix(k: &DenseND<f64>) -> Result<ndarray::Array2<f64>> {
    let (n, f) = (k.shape()[0], k.shape()[2]);
    let m = k.permute(&[0, 2, 1, 3])?.reshape(&[n * f, n * f])?;
    Ok(m.into_array().into_dimensionality()?)
}

#[test]
fn test_self_kernel_is_symmetric_psd() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::conv_with(4, (3, 3), (1, 1), Padding::Same),
        stax::tanh(),
        stax::flatten(),
        stax::dense(3),
    ]));
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 4, 4, 2]))?;
    let x = random(&[5, 4, 4, 2], 4)?;

    for implementation in ALL {
        let kernel_fn = build_kernel_fn(net.clone(), TraceAxes::none(), 0isize, implementation)?;
        let k = kernel_fn.call_single(&x, &params)?;
        let m = as_matrix(k.as_leaf().ok_or_else(|| anyhow::anyhow!("leaf"))?)?;
        let asym = (&m - &m.t()).mapv(f64::abs).fold(0.0_f64, |a, v| a.max(*v));
        assert!(asym < 1e-9, "{}: asymmetry {}", implementation, asym);

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            let v = DenseND::<f64>::random_normal(&[m.nrows()], 0.0, 1.0, &mut rng)?
                .into_array()
                .into_dimensionality::<ndarray::Ix1>()?;
            let q = v.dot(&m.dot(&v));
            assert!(q >= -1e-9 * m.diag().sum(), "{}: vᵀKv = {}", implementation, q);
        }
    }
    Ok(())
}

#[test]
fn test_calls_are_idempotent() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::dense(8),
        stax::relu(),
        stax::dense(2),
    ]));
    let (_, params) = net.init_fn(1, &NtTree::leaf(vec![1, 5]))?;
    let x1 = random(&[4, 5], 6)?;
    let x2 = random(&[3, 5], 7)?;
    for implementation in ALL {
        let kernel_fn = build_kernel_fn(net.clone(), TraceAxes::none(), 0isize, implementation)?;
        let first = kernel_fn.call(&x2, &x1, &params)?;
        let second = kernel_fn.call(&x2, &x1, &params)?;
        assert_eq!(first, second);
    }
    Ok(())
}

#[test]
fn test_batch_axis_in_trace_axes_is_rejected() -> Result<()> {
    let net = cnn();
    for implementation in ALL {
        let err = build_kernel_fn(net.clone(), [0isize, -1], 0isize, implementation)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(matches!(err, NtkError::InvalidAxes(_)));
    }

    // the same axis written relative to the end only aliases the batch axis
    // once the output rank is known
    let kernel_fn = build_kernel_fn(net.clone(), [-2isize], 0isize, NtkImplementation::Auto)?;
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 8, 8, 3]))?;
    let x = random(&[2, 8, 8, 3], 8)?;
    assert!(matches!(
        kernel_fn.call(&x, &x, &params),
        Err(NtkError::InvalidAxes(_))
    ));
    Ok(())
}

#[test]
fn test_parameter_shapes_are_checked() -> Result<()> {
    let net = cnn();
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 8, 8, 3]))?;
    let kernel_fn = build_kernel_fn(net, TraceAxes::none(), 0isize, NtkImplementation::Auto)?;

    // one more input channel than the parameters were built for
    let x = random(&[2, 8, 8, 4], 9)?;
    assert!(matches!(
        kernel_fn.call(&x, &x, &params),
        Err(NtkError::ShapeMismatch(_))
    ));
    Ok(())
}

/// Parameters of [`Gain`]: a learned scale per feature
#[derive(Debug, Clone, PartialEq)]
struct GainParams {
    scale: DenseND<f64>,
    normalized: bool,
}

impl Record<f64> for GainParams {
    const TYPE_NAME: &'static str = "GainParams";

    fn fields() -> &'static [FieldSpec] {
        static FIELDS: [FieldSpec; 2] = [FieldSpec::data("scale"), FieldSpec::meta("normalized")];
        &FIELDS
    }

    fn to_fields(&self) -> Vec<FieldValue<f64>> {
        vec![
            FieldValue::Data(NtTree::leaf(self.scale.clone())),
            FieldValue::Meta(MetaValue::Bool(self.normalized)),
        ]
    }

    fn from_fields(fields: Vec<FieldValue<f64>>) -> NtkResult<Self> {
        let mut it = fields.into_iter();
        let scale = record::take_leaf(it.next(), "scale")?;
        let normalized = record::take_bool(it.next(), "normalized")?;
        Ok(Self { scale, normalized })
    }
}

/// `y[…, d] = c · scale[d] · x[…, d]`, with `c = 1/√D` when normalized
///
/// Does not report to the primitive tap.
#[derive(Debug)]
struct Gain {
    normalized: bool,
}

impl Gain {
    fn unpack(&self, params: &Tree<f64>) -> NtkResult<(ndarray::ArrayD<f64>, f64)> {
        let p: GainParams =
            record::from_data_tree(params, vec![MetaValue::Bool(self.normalized)])?;
        let d = p.scale.len() as f64;
        let c = if p.normalized { 1.0 / d.sqrt() } else { 1.0 };
        Ok((p.scale.into_array(), c))
    }

    fn leaf<'a>(value: &'a Tree<f64>) -> NtkResult<&'a DenseND<f64>> {
        value
            .as_leaf()
            .ok_or_else(|| NtkError::structure_mismatch("gain expects one tensor"))
    }
}

impl Layer<f64> for Gain {
    fn name(&self) -> String {
        "Gain".into()
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(input_shape.clone())
    }

    fn init(&self, _rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<f64>)> {
        let shape = input_shape
            .as_leaf()
            .ok_or_else(|| NtkError::structure_mismatch("gain expects one tensor"))?;
        let d = shape.last().copied().unwrap_or(1);
        let p = GainParams {
            scale: DenseND::ones(&[d]),
            normalized: self.normalized,
        };
        Ok((input_shape.clone(), record::to_data_tree(&p)))
    }

    fn apply(&self, params: &Tree<f64>, input: &Tree<f64>) -> NtkResult<Tree<f64>> {
        let (scale, c) = self.unpack(params)?;
        let x = Self::leaf(input)?.as_array();
        Ok(NtTree::leaf(DenseND::from_array(x * &scale * c)))
    }

    fn jvp(
        &self,
        params: &Tree<f64>,
        input: &Tree<f64>,
        params_dot: &Tree<f64>,
        input_dot: &Tree<f64>,
    ) -> NtkResult<(Tree<f64>, Tree<f64>)> {
        let (scale, c) = self.unpack(params)?;
        let (scale_dot, _) = self.unpack(params_dot)?;
        let x = Self::leaf(input)?.as_array();
        let x_dot = Self::leaf(input_dot)?.as_array();
        let y = x * &scale * c;
        let y_dot = (x_dot * &scale + x * &scale_dot) * c;
        Ok((
            NtTree::leaf(DenseND::from_array(y)),
            NtTree::leaf(DenseND::from_array(y_dot)),
        ))
    }

    fn vjp(
        &self,
        params: &Tree<f64>,
        input: &Tree<f64>,
        cotangent: &Tree<f64>,
        _tap: &mut dyn PrimitiveTap<f64>,
    ) -> NtkResult<(Tree<f64>, Tree<f64>)> {
        let (scale, c) = self.unpack(params)?;
        let x = Self::leaf(input)?;
        let g = Self::leaf(cotangent)?;
        let d = scale.len();
        let rows = x.len() / d.max(1);
        let prod = x.mul(g)?.reshape(&[rows, d])?.into_array();
        let scale_ct = prod.sum_axis(ndarray::Axis(0)) * c;
        let p = GainParams {
            scale: DenseND::from_array(scale_ct),
            normalized: self.normalized,
        };
        let input_ct = g.as_array() * &scale * c;
        Ok((
            record::to_data_tree(&p),
            NtTree::leaf(DenseND::from_array(input_ct)),
        ))
    }
}

fn gain_net() -> Network<f64> {
    Network::from_boxed(stax::serial(vec![
        stax::dense(4),
        stax::tanh(),
        Box::new(Gain { normalized: true }),
        stax::dense(2),
    ]))
}

#[test]
fn test_gain_layer_derivatives() -> Result<()> {
    let net = gain_net();
    let shape = NtTree::leaf(vec![2, 3]);
    let (_, params) = net.init_fn(0, &shape)?;
    let (_, direction) = net.init_fn(1, &shape)?;
    let x = random(&[2, 3], 10)?;
    let ct = random(&[2, 2], 11)?;
    let config = GradCheckConfig::default();
    assert!(check_vjp(&net, &params, &x, &ct, &config)?.passed);
    assert!(check_input_vjp(&net, &params, &x, &ct, &config)?.passed);
    assert!(check_jvp(&net, &params, &x, &direction, &config)?.passed);
    Ok(())
}

#[test]
fn test_untraceable_layer_structured_unavailable_auto_works() -> Result<()> {
    let net = gain_net();
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 3]))?;
    let x1 = random(&[3, 3], 12)?;
    let x2 = random(&[2, 3], 13)?;
    assert!(!net.is_traceable());

    let structured = build_kernel_fn(
        net.clone(),
        TraceAxes::none(),
        0isize,
        NtkImplementation::StructuredDerivatives,
    )?;
    assert!(matches!(
        structured.call(&x2, &x1, &params),
        Err(NtkError::ImplementationUnavailable(_))
    ));

    let auto = build_kernel_fn(net.clone(), TraceAxes::none(), 0isize, NtkImplementation::Auto)?;
    let selection = auto.select(&x2, &x1, &params)?;
    assert!(selection
        .cost_of(NtkImplementation::StructuredDerivatives)
        .is_none());
    assert_ne!(selection.chosen, NtkImplementation::StructuredDerivatives);

    let reference = build_kernel_fn(
        net,
        TraceAxes::none(),
        0isize,
        NtkImplementation::JacobianContraction,
    )?
    .call(&x2, &x1, &params)?;
    assert!(auto.call(&x2, &x1, &params)?.max_abs_diff(&reference)? < 1e-9);
    Ok(())
}

#[test]
fn test_gain_params_through_registry() -> Result<()> {
    let mut registry = TreeRegistry::<f64>::new();
    registry.register::<GainParams>();
    assert!(registry.contains(<GainParams as Record<f64>>::TYPE_NAME));

    let p = GainParams {
        scale: DenseND::from_vec(vec![1.0, 2.0], &[2])?,
        normalized: false,
    };
    let (leaves, def) = registry.flatten(<GainParams as Record<f64>>::TYPE_NAME, &p)?;
    assert_eq!(leaves.len(), 1);
    let back = registry.unflatten(&def, leaves)?;
    assert_eq!(back.downcast_ref::<GainParams>(), Some(&p));

    let doubled = record::replace(
        &p,
        vec![("scale", FieldValue::Data(NtTree::leaf(p.scale.scale(2.0))))],
    )?;
    assert_eq!(doubled.scale.to_vec(), vec![2.0, 4.0]);
    assert!(!doubled.normalized);
    Ok(())
}
