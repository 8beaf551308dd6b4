//! # ntkrs-ad
//!
//! Differentiation substrate for ntkrs.
//!
//! This crate provides:
//! - The [`Layer`] trait: init/apply pairs with hand-written forward-mode
//!   (`jvp`) and reverse-mode (`vjp`) rules, and [`Network`], the
//!   `(init_fn, apply_fn)` pair built from a root layer
//! - A stax-style layer library ([`stax`]): dense, convolution,
//!   elementwise nonlinearities, flatten and branching combinators
//! - [`PrimitiveTap`], the interception hook through which affine
//!   primitives report their patch matrices and output cotangents
//! - Function transforms ([`transforms`]): parameter-space VJP/JVP and a
//!   vectorizing map over examples
//! - Finite-difference gradient checking ([`gradcheck`])
//!
//! ## Quick Start
//!
//! ```
//! use ntkrs_ad::{stax, transforms, Network, NoTap};
//! use ntkrs_core::{DenseND, NtTree};
//!
//! let net: Network<f64> = Network::from_boxed(stax::serial(vec![
//!     stax::dense(16),
//!     stax::relu(),
//!     stax::dense(1),
//! ]));
//! let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 8])).unwrap();
//!
//! let x = NtTree::leaf(DenseND::ones(&[1, 8]));
//! let y = net.apply_fn(&params, &x).unwrap();
//!
//! // Gradient of the scalar output with respect to every parameter
//! let grad = transforms::vjp_params(&net, &params, &x, &y.map(|t| DenseND::ones(t.shape())), &mut NoTap)
//!     .unwrap();
//! assert!(grad.same_structure(&params));
//! ```

pub mod affine;
pub mod combinators;
pub mod conv;
pub mod dense;
pub mod elementwise;
pub mod gradcheck;
pub mod layer;
pub mod shape_ops;
pub mod stax;
pub mod transforms;

pub use affine::AffineParams;
pub use combinators::{FanInConcat, FanInSum, FanOut, Parallel, Serial};
pub use conv::{Conv, ConvGeometry, Padding};
pub use dense::Dense;
pub use elementwise::{Activation, Elementwise};
pub use gradcheck::{GradCheckConfig, GradCheckResult};
pub use layer::{AffineSite, Layer, Network, NoTap, PrimitiveTap, Tree};
pub use shape_ops::{Flatten, Identity};
