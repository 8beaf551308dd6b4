//! Gradient checking utilities
//!
//! Verifies the hand-written derivative rules of a [`Network`] against
//! finite differences in parameter (or input) space. Essential when adding
//! a new [`Layer`](crate::Layer).
//!
//! # Finite Difference Methods
//!
//! - **Central difference**: `f'(x) ≈ [f(x+h) - f(x-h)] / (2h)` (more accurate)
//! - **Forward difference**: `f'(x) ≈ [f(x+h) - f(x)] / h` (faster)
//!
//! # Example
//!
//! ```
//! use ntkrs_ad::{gradcheck::{check_vjp, GradCheckConfig}, stax, Network};
//! use ntkrs_core::{DenseND, NtTree};
//!
//! let net: Network<f64> = Network::from_boxed(stax::serial(vec![
//!     stax::dense(3),
//!     stax::tanh(),
//!     stax::dense(2),
//! ]));
//! let shape = NtTree::leaf(vec![1, 4]);
//! let (_, params) = net.init_fn(0, &shape).unwrap();
//! let x = NtTree::leaf(DenseND::from_vec(vec![0.1, 0.2, -0.3, 0.4], &[1, 4]).unwrap());
//! let ct = NtTree::leaf(DenseND::ones(&[1, 2]));
//!
//! let result = check_vjp(&net, &params, &x, &ct, &GradCheckConfig::default()).unwrap();
//! assert!(result.passed);
//! ```

use crate::layer::{Network, NoTap, Tree};
use crate::transforms::{jvp_params, vjp_params};
use ndarray::Array1;
use ntkrs_core::{cast, NtkError, NtkResult, RavelLayout, Scalar};

/// Gradient checking configuration
#[derive(Debug, Clone)]
pub struct GradCheckConfig {
    /// Step size for finite differences (default: 1e-5)
    pub epsilon: f64,

    /// Relative tolerance for gradient comparison (default: 1e-3)
    pub rtol: f64,

    /// Absolute tolerance for gradient comparison (default: 1e-5)
    pub atol: f64,

    /// Use central difference (more accurate but 2x slower)
    pub use_central_diff: bool,

    /// Log every mismatching element at `debug` level
    pub verbose: bool,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            rtol: 1e-3,
            atol: 1e-5,
            use_central_diff: true,
            verbose: false,
        }
    }
}

/// Result of gradient checking
#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckResult {
    /// Maximum absolute difference between analytical and numerical values
    pub max_abs_diff: f64,

    /// Maximum relative difference
    pub max_rel_diff: f64,

    /// Whether every element is within tolerance
    pub passed: bool,

    /// Number of elements checked
    pub num_elements: usize,

    /// Number of elements outside tolerance
    pub num_failures: usize,
}

/// Finite-difference derivative of `g` at `0`, where `g(h)` is a scalar
fn difference<T, G>(g: G, config: &GradCheckConfig) -> NtkResult<T>
where
    T: Scalar,
    G: Fn(T) -> NtkResult<T>,
{
    let eps: T = cast(config.epsilon)?;
    if config.use_central_diff {
        Ok((g(eps)? - g(-eps)?) / (eps + eps))
    } else {
        Ok((g(eps)? - g(T::zero())?) / eps)
    }
}

/// `flat + h·e_i`, unraveled
fn perturb<T: Scalar>(
    flat: &Array1<T>,
    layout: &RavelLayout,
    i: usize,
    h: T,
) -> NtkResult<Tree<T>> {
    let mut moved = flat.clone();
    moved[i] += h;
    layout.unravel(moved.view())
}

/// Check the parameter VJP of `network` at `(params, input)`
///
/// Compares `vjp(cotangent)` with the finite-difference gradient of
/// `⟨apply(params, input), cotangent⟩`.
pub fn check_vjp<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    cotangent: &Tree<T>,
    config: &GradCheckConfig,
) -> NtkResult<GradCheckResult> {
    let analytical = vjp_params(network, params, input, cotangent, &mut NoTap)?.ravel().0;
    let (flat, layout) = params.ravel();
    let numerical = (0..flat.len())
        .map(|i| {
            difference(
                |h| {
                    let p = perturb(&flat, &layout, i, h)?;
                    network.apply_fn(&p, input)?.dot(cotangent)
                },
                config,
            )
        })
        .collect::<NtkResult<Array1<T>>>()?;
    compare(&analytical, &numerical, config, "parameter vjp")
}

/// Check the input VJP of `network` at `(params, input)`
pub fn check_input_vjp<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    cotangent: &Tree<T>,
    config: &GradCheckConfig,
) -> NtkResult<GradCheckResult> {
    let (_, input_ct) = network.layer().vjp(params, input, cotangent, &mut NoTap)?;
    let analytical = input_ct.ravel().0;
    let (flat, layout) = input.ravel();
    let numerical = (0..flat.len())
        .map(|i| {
            difference(
                |h| {
                    let x = perturb(&flat, &layout, i, h)?;
                    network.apply_fn(params, &x)?.dot(cotangent)
                },
                config,
            )
        })
        .collect::<NtkResult<Array1<T>>>()?;
    compare(&analytical, &numerical, config, "input vjp")
}

/// Check the parameter JVP of `network` along `direction`
pub fn check_jvp<T: Scalar>(
    network: &Network<T>,
    params: &Tree<T>,
    input: &Tree<T>,
    direction: &Tree<T>,
    config: &GradCheckConfig,
) -> NtkResult<GradCheckResult> {
    let (_, tangent) = jvp_params(network, params, input, direction)?;
    let analytical = tangent.ravel().0;
    let eps: T = cast(config.epsilon)?;
    let shifted = |h: T| -> NtkResult<Array1<T>> {
        let p = params.add(&direction.scale(h))?;
        Ok(network.apply_fn(&p, input)?.ravel().0)
    };
    let numerical = if config.use_central_diff {
        (shifted(eps)? - shifted(-eps)?) / (eps + eps)
    } else {
        (shifted(eps)? - network.apply_fn(params, input)?.ravel().0) / eps
    };
    compare(&analytical, &numerical, config, "parameter jvp")
}

fn compare<T: Scalar>(
    analytical: &Array1<T>,
    numerical: &Array1<T>,
    config: &GradCheckConfig,
    what: &str,
) -> NtkResult<GradCheckResult> {
    if analytical.len() != numerical.len() {
        return Err(NtkError::shapes_differ(
            what,
            &[numerical.len()],
            &[analytical.len()],
        ));
    }
    let mut max_abs_diff = 0.0_f64;
    let mut max_rel_diff = 0.0_f64;
    let mut num_failures = 0;

    for (idx, (a, n)) in analytical.iter().zip(numerical.iter()).enumerate() {
        let a = a.to_f64().unwrap_or(f64::NAN);
        let n = n.to_f64().unwrap_or(f64::NAN);
        let abs_diff = (a - n).abs();
        let rel_diff = if n.abs() > f64::EPSILON {
            abs_diff / n.abs()
        } else {
            abs_diff
        };
        max_abs_diff = max_abs_diff.max(abs_diff);
        max_rel_diff = max_rel_diff.max(rel_diff);

        if !(abs_diff <= config.atol || rel_diff <= config.rtol) {
            num_failures += 1;
            if config.verbose {
                log::debug!(
                    "{} mismatch at {}: analytical={}, numerical={}, abs_diff={:.2e}, rel_diff={:.2e}",
                    what,
                    idx,
                    a,
                    n,
                    abs_diff,
                    rel_diff
                );
            }
        }
    }

    let passed = num_failures == 0;
    if config.verbose {
        log::debug!(
            "{} check {}: {}/{} failures, max abs {:.2e}, max rel {:.2e}",
            what,
            if passed { "passed" } else { "failed" },
            num_failures,
            analytical.len(),
            max_abs_diff,
            max_rel_diff
        );
    }

    Ok(GradCheckResult {
        max_abs_diff,
        max_rel_diff,
        passed,
        num_elements: analytical.len(),
        num_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stax;
    use ntkrs_core::{DenseND, NtTree};

    #[test]
    fn test_detects_wrong_cotangent_rule() {
        let analytical = Array1::from(vec![1.0, 2.0, 3.0]);
        let numerical = Array1::from(vec![1.0, 2.0, 3.5]);
        let result = compare(&analytical, &numerical, &GradCheckConfig::default(), "t").unwrap();
        assert!(!result.passed);
        assert_eq!(result.num_failures, 1);
        assert!((result.max_abs_diff - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sigmoid_mlp_passes() {
        let net: Network<f64> = Network::from_boxed(stax::serial(vec![
            stax::dense(4),
            stax::sigmoid(),
            stax::dense(2),
        ]));
        let shape = NtTree::leaf(vec![2, 3]);
        let (_, params) = net.init_fn(1, &shape).unwrap();
        let x = NtTree::leaf(
            DenseND::from_vec(vec![0.3, -0.1, 0.7, -0.4, 0.2, 0.9], &[2, 3]).unwrap(),
        );
        let ct = NtTree::leaf(DenseND::from_vec(vec![1.0, -2.0, 0.5, 0.25], &[2, 2]).unwrap());
        let config = GradCheckConfig::default();
        assert!(check_vjp(&net, &params, &x, &ct, &config).unwrap().passed);
        assert!(check_input_vjp(&net, &params, &x, &ct, &config).unwrap().passed);
        let (_, direction) = net.init_fn(2, &shape).unwrap();
        assert!(check_jvp(&net, &params, &x, &direction, &config).unwrap().passed);
    }
}
