//! Boxed layer constructors
//!
//! Short names for building networks, in the style of `stax`:
//!
//! ```
//! use ntkrs_ad::{stax, Network};
//! use ntkrs_core::NtTree;
//!
//! let net: Network<f64> = Network::from_boxed(stax::serial(vec![
//!     stax::conv(8, (3, 3)),
//!     stax::relu(),
//!     stax::flatten(),
//!     stax::dense(10),
//! ]));
//! let (out, _params) = net.init_fn(0, &NtTree::leaf(vec![1, 8, 8, 3])).unwrap();
//! assert_eq!(out, NtTree::leaf(vec![1, 10]));
//! ```

use crate::combinators::{FanInConcat, FanInSum, FanOut, Parallel, Serial};
use crate::conv::{Conv, Padding};
use crate::dense::Dense;
use crate::elementwise::{Activation, Elementwise};
use crate::layer::Layer;
use crate::shape_ops::{Flatten, Identity};
use ntkrs_core::{Scalar, SignedAxis};

pub fn serial<T: Scalar>(layers: Vec<Box<dyn Layer<T>>>) -> Box<dyn Layer<T>> {
    Box::new(Serial::new(layers))
}

pub fn parallel<T: Scalar>(layers: Vec<Box<dyn Layer<T>>>) -> Box<dyn Layer<T>> {
    Box::new(Parallel::new(layers))
}

pub fn dense<T: Scalar>(out_dim: usize) -> Box<dyn Layer<T>> {
    Box::new(Dense::new(out_dim))
}

/// Unit-stride `VALID` convolution
pub fn conv<T: Scalar>(out_chan: usize, filter: (usize, usize)) -> Box<dyn Layer<T>> {
    Box::new(Conv::new(out_chan, filter))
}

pub fn conv_with<T: Scalar>(
    out_chan: usize,
    filter: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Box<dyn Layer<T>> {
    Box::new(
        Conv::new(out_chan, filter)
            .with_strides(strides)
            .with_padding(padding),
    )
}

pub fn relu<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(Elementwise::new(Activation::Relu))
}

pub fn tanh<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(Elementwise::new(Activation::Tanh))
}

pub fn sigmoid<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(Elementwise::new(Activation::Sigmoid))
}

pub fn flatten<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(Flatten)
}

pub fn identity<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(Identity)
}

pub fn fan_out<T: Scalar>(num: usize) -> Box<dyn Layer<T>> {
    Box::new(FanOut { num })
}

pub fn fan_in_sum<T: Scalar>() -> Box<dyn Layer<T>> {
    Box::new(FanInSum)
}

pub fn fan_in_concat<T: Scalar>(axis: SignedAxis) -> Box<dyn Layer<T>> {
    Box::new(FanInConcat { axis })
}
