//! # ntkrs - Empirical Neural Tangent Kernels
//!
//! Computes the empirical NTK `K(x1, x2) = Σ_θ ∂f(x1)/∂θ · ∂f(x2)/∂θ` of a
//! finite network at a fixed parameter point, with three interchangeable
//! strategies and a cost-based selector.
//!
//! This is the **meta crate** that re-exports every ntkrs component.
//!
//! ## Quick Start
//!
//! ```
//! use ntkrs::prelude::*;
//!
//! let net: Network<f64> = Network::from_boxed(stax::serial(vec![
//!     stax::conv(8, (3, 3)),
//!     stax::relu(),
//!     stax::flatten(),
//!     stax::dense(10),
//! ]));
//! let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 6, 6, 3]))?;
//!
//! let x_train = NtTree::leaf(DenseND::ones(&[4, 6, 6, 3]));
//! let x_test = NtTree::leaf(DenseND::zeros(&[2, 6, 6, 3]));
//!
//! let kernel_fn = build_kernel_fn(net, TraceAxes::none(), 0isize, NtkImplementation::Auto)?;
//! let k = kernel_fn.call(&x_test, &x_train, &params)?;
//! assert_eq!(k.as_leaf().unwrap().shape(), &[4, 2, 10, 10]);
//! # Ok::<(), ntkrs::core::NtkError>(())
//! ```
//!
//! ## Components
//!
//! ### Structured values and axes ([`core`])
//!
//! `DenseND` tensors, the `NtTree` container used for inputs, outputs,
//! parameters and kernels, record registration, and trace/batch axis
//! specifications.
//!
//! ```
//! use ntkrs::core::{DenseND, NtTree};
//!
//! let x = NtTree::tuple(vec![
//!     NtTree::leaf(DenseND::<f64>::ones(&[2, 3])),
//!     NtTree::leaf(DenseND::<f64>::zeros(&[2])),
//! ]);
//! let (leaves, def) = x.clone().flatten();
//! assert_eq!(leaves.len(), 2);
//! assert_eq!(def.unflatten(leaves).unwrap(), x);
//! ```
//!
//! ### Networks and differentiation ([`ad`])
//!
//! stax-style layers with hand-written JVP/VJP rules, the primitive tap
//! used by structured derivatives, `vmap`, and gradient checking.
//!
//! ### Cost model ([`planner`])
//!
//! Proxy FLOP and memory estimates per strategy and the AUTO selector.
//! The estimates are static and may misrank strategies on some hardware;
//! request a strategy explicitly when it must not change.
//!
//! ### Kernel computation ([`exec`])
//!
//! `build_kernel_fn`, `KernelFn` and the strategies.
//!
//! ## Features
//!
//! - `parallel` (default): vectorize per-example and per-basis loops on rayon
//! - `serde`: `Serialize`/`Deserialize` for configuration types

pub use ntkrs_ad as ad;
pub use ntkrs_core as core;
pub use ntkrs_exec as exec;
pub use ntkrs_planner as planner;

pub mod prelude {
    //! Prelude module for convenient imports
    //!
    //! # Example
    //!
    //! ```
    //! use ntkrs::prelude::*;
    //!
    //! let net: Network<f32> = Network::from_boxed(stax::dense(3));
    //! let kernel_fn = build_kernel_fn(net, TraceAxes::default(), 0isize, NtkImplementation::default());
    //! assert!(kernel_fn.is_ok());
    //! ```

    // Structured values
    pub use crate::core::{
        BatchAxes, DenseND, NtTree, NtkError, NtkResult, Record, StructuredValue, TraceAxes,
        VmapAxes,
    };

    // Networks
    pub use crate::ad::{stax, Layer, Network, Padding};

    // Strategy selection
    pub use crate::planner::{NtkImplementation, Selection, SelectionConfig};

    // Kernels
    pub use crate::exec::{build_kernel_fn, build_kernel_fn_with_config, KernelFn, NtkConfig};
}
