//! # ntkrs-planner
//!
//! Cost estimation and strategy selection for empirical NTK computation.
//!
//! The empirical NTK of a network `f(θ, x)` is `K = J1 · J2ᵀ` with `Ji` the
//! per-example Jacobians with respect to `θ`. Three strategies compute it
//! with very different resource profiles; this crate predicts their cost
//! for concrete shapes and picks one.
//!
//! ## Quick Start
//!
//! ```
//! use ntkrs_planner::{
//!     select_implementation, NetworkStats, OutputStats, ProblemStats, SelectionConfig,
//!     SiteKind, SiteStats,
//! };
//!
//! let mut net = NetworkStats::new();
//! net.add_site(SiteStats { kind: SiteKind::Dense, positions: 1, fan_in: 784, fan_out: 512, has_bias: true });
//! net.add_flops(512.0);
//! net.add_site(SiteStats { kind: SiteKind::Dense, positions: 1, fan_in: 512, fan_out: 10, has_bias: true });
//!
//! let problem = ProblemStats::new(32, 32, net)
//!     .with_output(OutputStats { features1: 10, features2: 10, trace: 1 });
//!
//! let selection = select_implementation(&problem, &SelectionConfig::default()).unwrap();
//! println!("AUTO picks {}", selection.chosen);
//! ```
//!
//! ## Cost Model
//!
//! - **Jacobian contraction**: `(n1·R1 + n2·R2)` reverse passes plus a
//!   `2·n1·n2·F1·F2·T·P` contraction; memory holds both Jacobians.
//! - **NTK-vector products**: `n1·R1` basis vectors, each one reverse pass
//!   at `x1` and one forward-mode pass over all of `x2`.
//! - **Structured derivatives**: the same reverse passes as Jacobian
//!   contraction, plus per-primitive contractions that never touch the full
//!   parameter dimension.
//!
//! Here `R = F·T` is the number of output elements per example, `F` the
//! feature elements, `T` the trace size and `P` the parameter count.
//!
//! The estimates are static proxies and may misrank strategies on some
//! hardware; see [`select`] for the caveat.

pub mod cost;
pub mod select;

pub use cost::*;
pub use select::*;
