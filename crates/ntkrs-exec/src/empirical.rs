//! Public entry point: `build_kernel_fn` and [`KernelFn`]
//!
//! A [`KernelFn`] binds a network, its axis specification and a strategy.
//! Every call validates the concrete shapes, builds a [`KernelPlan`] and
//! dispatches to the bound strategy (AUTO re-selects per call, since shapes
//! may change between calls). Calls share no mutable state.

use crate::auto::{strategy_for, Auto};
use crate::kernel::{KernelPlan, KernelStrategy};
use ntkrs_ad::Network;
use ntkrs_core::{check_static, NtkResult, Scalar, StructuredValue, TraceAxes, VmapAxes};
use ntkrs_planner::{NtkImplementation, Selection, SelectionConfig};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration of a kernel function
///
/// # Examples
///
/// ```
/// use ntkrs_exec::NtkConfig;
/// use ntkrs_planner::NtkImplementation;
///
/// let config = NtkConfig::new()
///     .with_trace_axes(Vec::<isize>::new())
///     .with_vmap_axes(0isize)
///     .with_implementation(NtkImplementation::Auto)
///     .with_tie_tolerance(0.1);
/// assert_eq!(config.implementation, NtkImplementation::Auto);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NtkConfig {
    /// Output axes summed away (default: the last axis)
    pub trace_axes: TraceAxes,
    /// Example axes of inputs and outputs (default: axis 0)
    pub vmap_axes: VmapAxes,
    /// Strategy (default: Jacobian contraction)
    pub implementation: NtkImplementation,
    /// AUTO tie-breaking
    pub selection: SelectionConfig,
}

impl NtkConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Output axes summed away
    pub fn with_trace_axes(mut self, trace_axes: impl Into<TraceAxes>) -> Self {
        self.trace_axes = trace_axes.into();
        self
    }

    /// Example axes of inputs and outputs
    pub fn with_vmap_axes(mut self, vmap_axes: impl Into<VmapAxes>) -> Self {
        self.vmap_axes = vmap_axes.into();
        self
    }

    /// Strategy to bind
    pub fn with_implementation(mut self, implementation: NtkImplementation) -> Self {
        self.implementation = implementation;
        self
    }

    /// Relative AUTO tie band
    pub fn with_tie_tolerance(mut self, tolerance: f64) -> Self {
        self.selection = self.selection.with_tie_tolerance(tolerance);
        self
    }

    /// Reject axis specifications that no output could satisfy
    pub fn validate(&self) -> NtkResult<()> {
        check_static(&self.trace_axes, &self.vmap_axes.output)
    }
}

/// Bind a network, axis specification and strategy into a kernel function
///
/// `batch_axes` is either one axis for inputs and outputs or a full
/// [`VmapAxes`]. Fails with
/// [`InvalidAxes`](ntkrs_core::NtkError::InvalidAxes) when a batch axis is
/// also a trace axis, before anything is computed.
///
/// # Examples
///
/// ```
/// use ntkrs_ad::{stax, Network};
/// use ntkrs_core::{DenseND, NtTree};
/// use ntkrs_exec::build_kernel_fn;
/// use ntkrs_planner::NtkImplementation;
///
/// let net: Network<f64> = Network::from_boxed(stax::serial(vec![
///     stax::dense(16),
///     stax::relu(),
///     stax::dense(3),
/// ]));
/// let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 4])).unwrap();
///
/// let kernel_fn = build_kernel_fn(
///     net,
///     Vec::<isize>::new(),
///     0isize,
///     NtkImplementation::NtkVectorProducts,
/// )
/// .unwrap();
/// let x_train = NtTree::leaf(DenseND::ones(&[5, 4]));
/// let x_test = NtTree::leaf(DenseND::zeros(&[2, 4]));
///
/// // test batch first; the result is indexed [train, test, out, out]
/// let k = kernel_fn.call(&x_test, &x_train, &params).unwrap();
/// assert_eq!(k.as_leaf().unwrap().shape(), &[5, 2, 3, 3]);
/// ```
pub fn build_kernel_fn<T: Scalar>(
    network: Network<T>,
    trace_axes: impl Into<TraceAxes>,
    batch_axes: impl Into<VmapAxes>,
    implementation: NtkImplementation,
) -> NtkResult<KernelFn<T>> {
    let config = NtkConfig::new()
        .with_trace_axes(trace_axes)
        .with_vmap_axes(batch_axes)
        .with_implementation(implementation);
    build_kernel_fn_with_config(network, config)
}

/// [`build_kernel_fn`] from a full [`NtkConfig`]
pub fn build_kernel_fn_with_config<T: Scalar>(
    network: Network<T>,
    config: NtkConfig,
) -> NtkResult<KernelFn<T>> {
    config.validate()?;
    let strategy = strategy_for(config.implementation, &config.selection);
    log::debug!(
        "kernel fn: {} over {} (trace {:?}, vmap {:?})",
        config.implementation,
        network.layer().name(),
        config.trace_axes,
        config.vmap_axes
    );
    Ok(KernelFn {
        network,
        config,
        strategy,
    })
}

/// A bound empirical-NTK function
#[derive(Debug)]
pub struct KernelFn<T: Scalar> {
    network: Network<T>,
    config: NtkConfig,
    strategy: Box<dyn KernelStrategy<T>>,
}

impl<T: Scalar> KernelFn<T> {
    /// Kernel between `x1` and `x2`
    ///
    /// The second batch comes first in the argument list; the result is
    /// indexed `[x1 example, x2 example, …]`. Each output leaf contributes a
    /// kernel of shape `(n1, n2, d_a, d_a, d_b, d_b, …)` over its feature
    /// axes, without the leading pair when inputs are not vectorized. An
    /// empty batch gives an empty kernel without running the strategy.
    pub fn call(
        &self,
        x2: &StructuredValue<T>,
        x1: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<StructuredValue<T>> {
        let plan = self.plan(x2, x1, params)?;
        log::debug!(
            "{}: n1={} n2={} leaves={:?}",
            self.strategy.implementation(),
            plan.n1(),
            plan.n2(),
            plan.leaves
                .iter()
                .map(|l| (l.features1(), l.features2(), l.trace))
                .collect::<Vec<_>>()
        );
        let blocks = if plan.n1() == 0 || plan.n2() == 0 {
            plan.empty_blocks()
        } else {
            self.strategy.compute(&self.network, params, &plan)?
        };
        plan.finish(blocks)
    }

    /// Kernel of a batch with itself
    pub fn call_single(
        &self,
        x: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<StructuredValue<T>> {
        self.call(x, x, params)
    }

    /// Validated plan for a call, without computing anything
    pub fn plan(
        &self,
        x2: &StructuredValue<T>,
        x1: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<KernelPlan<T>> {
        KernelPlan::new(
            &self.network,
            &self.config.trace_axes,
            &self.config.vmap_axes,
            x1,
            x2,
            params,
        )
    }

    /// Estimated cost of every strategy for this call
    ///
    /// `chosen` is the strategy a call would run: the bound one, or the
    /// selector's pick under AUTO.
    pub fn select(
        &self,
        x2: &StructuredValue<T>,
        x1: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<Selection> {
        let plan = self.plan(x2, x1, params)?;
        let mut selection = Auto::new(self.config.selection.clone()).select(&self.network, &plan)?;
        if self.config.implementation.is_concrete() {
            selection.chosen = self.config.implementation;
        }
        Ok(selection)
    }

    /// Fail with [`ShapeMismatch`](ntkrs_core::NtkError::ShapeMismatch)
    /// unless `params` fits the network for inputs shaped like `x`
    pub fn check_params(
        &self,
        x: &StructuredValue<T>,
        params: &StructuredValue<T>,
    ) -> NtkResult<()> {
        self.plan(x, x, params).map(|_| ())
    }

    /// Bound strategy tag
    pub fn implementation(&self) -> NtkImplementation {
        self.config.implementation
    }

    /// Configuration this function was built with
    pub fn config(&self) -> &NtkConfig {
        &self.config
    }

    /// Network the kernel is taken of
    pub fn network(&self) -> &Network<T> {
        &self.network
    }
}
