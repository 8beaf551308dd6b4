//! Property-based tests for the differentiation substrate
//!
//! Uses proptest to check linearity and the VJP/JVP adjoint identity on
//! randomly sized networks.

use ntkrs_ad::transforms::{jvp_params, vjp_params, split_batch};
use ntkrs_ad::{stax, Network, NoTap};
use ntkrs_core::{DenseND, NtTree, StructuredValue};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn mlp(hidden: usize, out: usize) -> Network<f64> {
    Network::from_boxed(stax::serial(vec![
        stax::dense(hidden),
        stax::tanh(),
        stax::dense(out),
    ]))
}

fn random(shape: &[usize], seed: u64) -> StructuredValue<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    NtTree::leaf(DenseND::random_normal(shape, 0.0, 1.0, &mut rng).unwrap())
}

proptest! {
    /// <vjp(g), t> = <g, jvp(t)> for any cotangent g and parameter tangent t
    #[test]
    fn test_vjp_jvp_adjoint(
        batch in 1usize..4,
        fan_in in 1usize..6,
        hidden in 1usize..6,
        out in 1usize..4,
        seed in 0u64..1000,
    ) {
        let net = mlp(hidden, out);
        let shape = NtTree::leaf(vec![batch, fan_in]);
        let (_, params) = net.init_fn(seed, &shape).unwrap();
        let (_, tangent) = net.init_fn(seed + 1, &shape).unwrap();
        let x = random(&[batch, fan_in], seed + 2);
        let g = random(&[batch, out], seed + 3);

        let ct = vjp_params(&net, &params, &x, &g, &mut NoTap).unwrap();
        let (_, y_dot) = jvp_params(&net, &params, &x, &tangent).unwrap();
        let lhs = ct.dot(&tangent).unwrap();
        let rhs = g.dot(&y_dot).unwrap();
        prop_assert!((lhs - rhs).abs() <= 1e-9 * (1.0 + lhs.abs()),
            "adjoint identity violated: {} vs {}", lhs, rhs);
    }

    /// vjp(a·g1 + b·g2) = a·vjp(g1) + b·vjp(g2)
    #[test]
    fn test_vjp_linear_in_cotangent(
        a in -3.0f64..3.0,
        b in -3.0f64..3.0,
        seed in 0u64..1000,
    ) {
        let net = mlp(4, 3);
        let shape = NtTree::leaf(vec![2, 5]);
        let (_, params) = net.init_fn(seed, &shape).unwrap();
        let x = random(&[2, 5], seed + 1);
        let g1 = random(&[2, 3], seed + 2);
        let g2 = random(&[2, 3], seed + 3);
        let combo = g1.scale(a).add(&g2.scale(b)).unwrap();

        let v1 = vjp_params(&net, &params, &x, &g1, &mut NoTap).unwrap();
        let v2 = vjp_params(&net, &params, &x, &g2, &mut NoTap).unwrap();
        let v = vjp_params(&net, &params, &x, &combo, &mut NoTap).unwrap();
        let expected = v1.scale(a).add(&v2.scale(b)).unwrap();
        prop_assert!(v.max_abs_diff(&expected).unwrap() < 1e-9);
    }

    /// Applying a row-wise network per example equals applying it to the batch
    #[test]
    fn test_per_example_apply_matches_batch(
        batch in 1usize..5,
        seed in 0u64..1000,
    ) {
        let net = mlp(3, 2);
        let shape = NtTree::leaf(vec![batch, 4]);
        let (_, params) = net.init_fn(seed, &shape).unwrap();
        let x = random(&[batch, 4], seed + 1);
        let full = net.apply_fn(&params, &x).unwrap();

        let units = split_batch(&x, &NtTree::leaf(Some(0))).unwrap();
        prop_assert_eq!(units.len(), batch);
        for (i, unit) in units.iter().enumerate() {
            let y = net.apply_fn(&params, unit).unwrap();
            let row = full.as_leaf().unwrap().select_example(0, i).unwrap();
            prop_assert!(y.as_leaf().unwrap().max_abs_diff(&row).unwrap() < 1e-12);
        }
    }
}
