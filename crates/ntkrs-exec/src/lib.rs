//! # ntkrs-exec
//!
//! Empirical Neural Tangent Kernel computation.
//!
//! This crate provides:
//! - [`build_kernel_fn`], binding a network, trace/batch axes and a strategy
//!   into a [`KernelFn`]
//! - Three interchangeable strategies behind [`KernelStrategy`]:
//!   [`JacobianContraction`], [`NtkVectorProducts`] and
//!   [`StructuredDerivatives`]
//! - [`Auto`], which estimates the three for each call's shapes and runs
//!   the cheapest
//!
//! All strategies compute the same quantity,
//! `K[i, j] = Σ_θ ∂f(x1_i)/∂θ · ∂f(x2_j)/∂θ` with trace axes summed, and
//! agree up to floating-point summation order.
//!
//! ## Quick Start
//!
//! ```
//! use ntkrs_ad::{stax, Network};
//! use ntkrs_core::{DenseND, NtTree};
//! use ntkrs_exec::build_kernel_fn;
//! use ntkrs_planner::NtkImplementation;
//!
//! let net: Network<f64> = Network::from_boxed(stax::serial(vec![
//!     stax::conv(4, (3, 3)),
//!     stax::relu(),
//!     stax::flatten(),
//!     stax::dense(2),
//! ]));
//! let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 5, 5, 1])).unwrap();
//! let x1 = NtTree::leaf(DenseND::ones(&[3, 5, 5, 1]));
//! let x2 = NtTree::leaf(DenseND::zeros(&[2, 5, 5, 1]));
//!
//! let kernel_fn = build_kernel_fn(net, Vec::<isize>::new(), 0isize, NtkImplementation::Auto).unwrap();
//! let k = kernel_fn.call(&x2, &x1, &params).unwrap();
//! assert_eq!(k.as_leaf().unwrap().shape(), &[3, 2, 2, 2]);
//! ```

pub mod auto;
pub mod empirical;
pub mod jacobian;
pub mod kernel;
pub mod ntk_vp;
pub mod structured;

pub use auto::{concrete_strategy, strategy_for, Auto};
pub use empirical::{build_kernel_fn, build_kernel_fn_with_config, KernelFn, NtkConfig};
pub use jacobian::JacobianContraction;
pub use kernel::{KernelPlan, KernelStrategy, LeafPlan, Side};
pub use ntk_vp::NtkVectorProducts;
pub use structured::StructuredDerivatives;
