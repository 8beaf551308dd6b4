//! Integration tests for ntkrs-ad
//!
//! Every layer's hand-written JVP/VJP is checked against finite differences,
//! and the primitive tap is checked to see every affine site.

use anyhow::Result;
use ntkrs_ad::gradcheck::{check_input_vjp, check_jvp, check_vjp, GradCheckConfig};
use ntkrs_ad::{stax, AffineSite, Network, Padding, PrimitiveTap};
use ntkrs_core::{DenseND, NtTree, NtkResult, StructuredValue};
use ntkrs_planner::SiteKind;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn random_input(shape: &[usize], seed: u64) -> Result<StructuredValue<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(NtTree::leaf(DenseND::random_normal(shape, 0.0, 1.0, &mut rng)?))
}

/// Run all three checks on `net` at a random point
fn check_all(net: &Network<f64>, input_shape: &[usize]) -> Result<()> {
    let shape = NtTree::leaf(input_shape.to_vec());
    let (out_shape, params) = net.init_fn(0, &shape)?;
    let (_, direction) = net.init_fn(1, &shape)?;
    let x = random_input(input_shape, 2)?;
    let out = out_shape
        .as_leaf()
        .ok_or_else(|| anyhow::anyhow!("expected a single output"))?;
    let ct = random_input(out, 3)?;

    let config = GradCheckConfig::default();
    let vjp = check_vjp(net, &params, &x, &ct, &config)?;
    assert!(vjp.passed, "parameter vjp failed: {:?}", vjp);
    let input_vjp = check_input_vjp(net, &params, &x, &ct, &config)?;
    assert!(input_vjp.passed, "input vjp failed: {:?}", input_vjp);
    let jvp = check_jvp(net, &params, &x, &direction, &config)?;
    assert!(jvp.passed, "jvp failed: {:?}", jvp);
    Ok(())
}

#[test]
fn test_dense_tanh_gradcheck() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::dense(5),
        stax::tanh(),
        stax::dense(3),
    ]));
    check_all(&net, &[2, 4])
}

#[test]
fn test_conv_valid_relu_gradcheck() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::conv(3, (3, 3)),
        stax::relu(),
        stax::flatten(),
        stax::dense(2),
    ]));
    check_all(&net, &[1, 5, 5, 2])
}

#[test]
fn test_conv_same_strided_gradcheck() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::conv_with(3, (2, 3), (2, 1), Padding::Same),
        stax::sigmoid(),
        stax::conv_with(2, (2, 2), (1, 2), Padding::Same),
        stax::flatten(),
    ]));
    check_all(&net, &[1, 5, 4, 2])
}

#[test]
fn test_branching_gradcheck() -> Result<()> {
    let net = Network::from_boxed(stax::serial(vec![
        stax::fan_out(2),
        stax::parallel(vec![
            stax::serial(vec![stax::dense(3), stax::tanh()]),
            stax::dense(3),
        ]),
        stax::fan_in_sum(),
        stax::fan_out(2),
        stax::parallel(vec![stax::dense(2), stax::identity()]),
        stax::fan_in_concat(-1),
        stax::dense(1),
    ]));
    check_all(&net, &[3, 4])
}

#[derive(Default)]
struct SiteLog {
    sites: Vec<(SiteKind, [usize; 2], [usize; 2], usize)>,
}

impl PrimitiveTap<f64> for SiteLog {
    fn on_affine(&mut self, site: &AffineSite<'_, f64>) -> NtkResult<()> {
        self.sites.push((
            site.kind,
            [site.patches.nrows(), site.patches.ncols()],
            [site.cotangent.nrows(), site.cotangent.ncols()],
            site.param_count(),
        ));
        Ok(())
    }
}

#[test]
fn test_tap_sees_every_site_in_reverse_order() -> Result<()> {
    let net: Network<f64> = Network::from_boxed(stax::serial(vec![
        stax::conv(4, (3, 3)),
        stax::relu(),
        stax::flatten(),
        stax::dense(10),
    ]));
    let shape = NtTree::leaf(vec![1, 6, 6, 2]);
    let (_, params) = net.init_fn(0, &shape)?;
    let x = random_input(&[1, 6, 6, 2], 1)?;
    let ct = random_input(&[1, 10], 2)?;

    let mut log = SiteLog::default();
    net.layer().vjp(&params, &x, &ct, &mut log)?;

    assert_eq!(
        log.sites,
        vec![
            (SiteKind::Dense, [1, 64], [1, 10], 650),
            (SiteKind::Conv, [16, 18], [16, 4], 76),
        ]
    );
    let covered: usize = log.sites.iter().map(|s| s.3).sum();
    assert_eq!(covered, params.size());
    Ok(())
}

/// Records sites without asking for parameter cotangents
struct RecordOnly(usize);

impl PrimitiveTap<f64> for RecordOnly {
    fn on_affine(&mut self, _site: &AffineSite<'_, f64>) -> NtkResult<()> {
        self.0 += 1;
        Ok(())
    }

    fn wants_param_cotangents(&self) -> bool {
        false
    }
}

#[test]
fn test_record_only_tap_skips_weight_gradients() -> Result<()> {
    let net: Network<f64> =
        Network::from_boxed(stax::serial(vec![stax::dense(3), stax::tanh(), stax::dense(2)]));
    let shape = NtTree::leaf(vec![1, 4]);
    let (_, params) = net.init_fn(0, &shape)?;
    let x = random_input(&[1, 4], 1)?;
    let ct = random_input(&[1, 2], 2)?;

    let mut tap = RecordOnly(0);
    let (param_ct, input_ct) = net.layer().vjp(&params, &x, &ct, &mut tap)?;
    assert_eq!(tap.0, 2);
    assert_eq!(param_ct.shapes(), params.shapes());
    assert!(param_ct.leaves().iter().all(|t| t.sum() == 0.0));

    // the input cotangent does not depend on the tap
    let (_, reference) = net.layer().vjp(&params, &x, &ct, &mut ntkrs_ad::NoTap)?;
    assert_eq!(input_ct, reference);
    Ok(())
}
