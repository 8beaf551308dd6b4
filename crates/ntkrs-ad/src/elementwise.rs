//! Parameter-free elementwise nonlinearities

use crate::layer::{Layer, PrimitiveTap, Tree};
use ntkrs_core::{NtTree, NtkResult, Scalar, Shapes};
use ntkrs_planner::NetworkStats;
use rand::rngs::StdRng;

/// Supported nonlinearities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(x, 0)`; the derivative at `0` is taken as `0`
    Relu,
    /// Hyperbolic tangent
    Tanh,
    /// Logistic sigmoid
    Sigmoid,
}

impl Activation {
    fn value<T: Scalar>(self, x: T) -> T {
        match self {
            Activation::Relu => {
                if x > T::zero() {
                    x
                } else {
                    T::zero()
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => T::one() / (T::one() + (-x).exp()),
        }
    }

    fn derivative<T: Scalar>(self, x: T) -> T {
        match self {
            Activation::Relu => {
                if x > T::zero() {
                    T::one()
                } else {
                    T::zero()
                }
            }
            Activation::Tanh => {
                let t = x.tanh();
                T::one() - t * t
            }
            Activation::Sigmoid => {
                let s = self.value(x);
                s * (T::one() - s)
            }
        }
    }

    // Rough per-element cost used by the planner
    fn flops(self) -> f64 {
        match self {
            Activation::Relu => 1.0,
            Activation::Tanh | Activation::Sigmoid => 4.0,
        }
    }
}

/// Elementwise layer applied to every leaf of its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elementwise {
    pub activation: Activation,
}

impl Elementwise {
    pub fn new(activation: Activation) -> Self {
        Self { activation }
    }
}

impl<T: Scalar> Layer<T> for Elementwise {
    fn name(&self) -> String {
        format!("{:?}", self.activation)
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(input_shape.clone())
    }

    fn init(&self, _rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        Ok((input_shape.clone(), NtTree::empty()))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        Ok((
            <Self as Layer<T>>::output_shape(self, input_shape)?,
            NtTree::empty(),
        ))
    }

    fn apply(&self, _params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let act = self.activation;
        Ok(input.map(|x| x.map(|v| act.value(v))))
    }

    fn jvp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        _params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let act = self.activation;
        let tangent = input.zip_with(input_dot, |x, dx| {
            x.map(|v| act.derivative(v)).mul(dx)
        })?;
        Ok((input.map(|x| x.map(|v| act.value(v))), tangent))
    }

    fn vjp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        _tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let act = self.activation;
        let input_ct = input.zip_with(cotangent, |x, g| {
            x.map(|v| act.derivative(v)).mul(g)
        })?;
        Ok((NtTree::empty(), input_ct))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let elements: usize = input_shape.leaves().iter().map(|s| s.iter().product::<usize>()).sum();
        stats.add_flops(self.activation.flops() * elements as f64);
        Ok(input_shape.clone())
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::NoTap;
    use ntkrs_core::{cast, DenseND};

    fn at<T: Scalar>(act: Activation, x: f64) -> (T, T) {
        let x: T = cast(x).unwrap();
        (act.value(x), act.derivative(x))
    }

    #[test]
    fn test_relu_kink_derivative_is_zero() {
        let (v, d) = at::<f64>(Activation::Relu, 0.0);
        assert_eq!(v, 0.0);
        assert_eq!(d, 0.0);
        assert_eq!(at::<f64>(Activation::Relu, 2.0), (2.0, 1.0));
    }

    #[test]
    fn test_sigmoid_and_tanh_values() {
        let (s, ds) = at::<f64>(Activation::Sigmoid, 0.0);
        assert!((s - 0.5).abs() < 1e-12);
        assert!((ds - 0.25).abs() < 1e-12);
        let (t, dt) = at::<f64>(Activation::Tanh, 0.0);
        assert_eq!(t, 0.0);
        assert!((dt - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_applies_to_every_leaf() {
        let layer = Elementwise::new(Activation::Relu);
        let input = NtTree::tuple(vec![
            NtTree::leaf(DenseND::from_vec(vec![-1.0, 2.0], &[1, 2]).unwrap()),
            NtTree::leaf(DenseND::from_vec(vec![3.0, -4.0], &[1, 2]).unwrap()),
        ]);
        let out = layer.apply(&NtTree::empty(), &input).unwrap();
        let leaves = out.leaves();
        assert_eq!(leaves[0].to_vec(), vec![0.0, 2.0]);
        assert_eq!(leaves[1].to_vec(), vec![3.0, 0.0]);

        let ct = input.map(|x| DenseND::ones(x.shape()));
        let (dp, dx) = layer.vjp(&NtTree::empty(), &input, &ct, &mut NoTap).unwrap();
        assert_eq!(dp.num_leaves(), 0);
        assert_eq!(dx.leaves()[0].to_vec(), vec![0.0, 1.0]);
    }
}
