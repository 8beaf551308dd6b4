//! # ntkrs-core
//!
//! Core data model for empirical Neural Tangent Kernel computation.
//!
//! This crate provides the building blocks every other ntkrs crate works on:
//!
//! - **Dense tensors** ([`DenseND`]) backed by `ndarray`, row-major
//! - **Tree containers** ([`NtTree`], [`StructuredValue`]) for nested inputs,
//!   outputs, parameters and kernels, with flatten/unflatten through [`TreeDef`]
//! - **Record registration** ([`record`]) letting custom aggregate types
//!   declare data and metadata fields
//! - **Axis specifications** ([`TraceAxes`], [`BatchAxes`], [`VmapAxes`]) and
//!   their per-leaf normal form [`LeafAxes`]
//! - **Errors** ([`NtkError`]) shared by the whole stack
//!
//! ## Quick Start
//!
//! ```
//! use ntkrs_core::{DenseND, NtTree, StructuredValue};
//!
//! let x: StructuredValue<f64> = NtTree::list(vec![
//!     NtTree::leaf(DenseND::zeros(&[4, 8])),
//!     NtTree::leaf(DenseND::ones(&[4, 3])),
//! ]);
//! assert_eq!(x.num_leaves(), 2);
//!
//! let y = x.scale(2.0);
//! assert_eq!(y.max_abs_diff(&x).unwrap(), 1.0);
//! ```
//!
//! ## Axis Specifications
//!
//! ```
//! use ntkrs_core::{LeafAxes, NtkError};
//!
//! // Rank-4 NHWC output, examples on axis 0, channels traced
//! let axes = LeafAxes::new(4, &[-1], Some(0)).unwrap();
//! assert_eq!(axes.features, vec![1, 2]);
//!
//! // A batch axis that is also a trace axis is rejected
//! let err = LeafAxes::new(4, &[0], Some(0)).unwrap_err();
//! assert!(matches!(err, NtkError::InvalidAxes(_)));
//! ```

pub mod axes;
pub mod dense;
pub mod error;
pub mod record;
pub mod tree;
pub mod types;


pub use axes::{
    canonicalize_axis, check_static, normalize_output_axes, BatchAxes, LeafAxes, TraceAxes,
    VmapAxes,
};
pub use dense::DenseND;
pub use error::{NtkError, NtkResult};
pub use record::{FieldSpec, FieldValue, MetaValue, Record, RecordDef, TreeRegistry};
pub use tree::{NtTree, RavelLayout, Shapes, StructuredValue, TreeDef};
pub use types::{cast, numel, Axis, Scalar, Shape, SignedAxis};
