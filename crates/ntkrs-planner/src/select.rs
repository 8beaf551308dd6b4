//! Strategy selection
//!
//! The AUTO strategy evaluates the cost model for every concrete strategy
//! that can run on the network and picks the cheapest one. Near-ties are
//! broken towards the strategy with the lowest typical peak memory:
//! structured derivatives, then NTK-vector products, then Jacobian
//! contraction.
//!
//! # Caveat
//!
//! The cost model is a static FLOP proxy. It ignores memory bandwidth, cache
//! behavior and how well each strategy maps onto a particular accelerator,
//! so AUTO can pick a strategy that is not the fastest in practice. Callers
//! who need a guaranteed strategy should request it explicitly.

use crate::cost::{
    estimate_jacobian_contraction, estimate_ntk_vector_products, estimate_structured_derivatives,
    ProblemStats, StrategyCost,
};
use ntkrs_core::{NtkError, NtkResult};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Empirical NTK strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NtkImplementation {
    /// Materialize per-example Jacobians and contract them
    #[default]
    JacobianContraction,
    /// One reverse and one forward pass per output basis vector
    NtkVectorProducts,
    /// Layer-by-layer contraction of recorded activations and cotangents
    StructuredDerivatives,
    /// Pick the cheapest of the three by estimated cost, per call
    Auto,
}

impl NtkImplementation {
    /// Concrete strategies in tie-break preference order
    pub const CONCRETE: [NtkImplementation; 3] = [
        NtkImplementation::StructuredDerivatives,
        NtkImplementation::NtkVectorProducts,
        NtkImplementation::JacobianContraction,
    ];

    /// Position in the tie-break order (lower wins); `Auto` sorts last
    pub fn preference(self) -> usize {
        Self::CONCRETE
            .iter()
            .position(|&i| i == self)
            .unwrap_or(Self::CONCRETE.len())
    }

    /// Whether this names a concrete strategy rather than `Auto`
    pub fn is_concrete(self) -> bool {
        self != NtkImplementation::Auto
    }

    /// Snake-case name
    pub fn name(self) -> &'static str {
        match self {
            NtkImplementation::JacobianContraction => "jacobian_contraction",
            NtkImplementation::NtkVectorProducts => "ntk_vector_products",
            NtkImplementation::StructuredDerivatives => "structured_derivatives",
            NtkImplementation::Auto => "auto",
        }
    }
}

impl fmt::Display for NtkImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NtkImplementation {
    type Err = NtkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jacobian_contraction" | "jc" => Ok(NtkImplementation::JacobianContraction),
            "ntk_vector_products" | "vp" => Ok(NtkImplementation::NtkVectorProducts),
            "structured_derivatives" | "sd" => Ok(NtkImplementation::StructuredDerivatives),
            "auto" => Ok(NtkImplementation::Auto),
            other => Err(NtkError::unavailable(format!(
                "unknown implementation '{}'",
                other
            ))),
        }
    }
}

/// Configuration for strategy selection
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectionConfig {
    /// Relative cost band treated as a tie (default: 0.05)
    ///
    /// A candidate whose cost is within `(1 + tie_tolerance)` of the minimum
    /// competes on preference order instead of raw cost.
    pub tie_tolerance: f64,
}

/// Default hysteresis band for AUTO tie-breaking
pub const DEFAULT_TIE_TOLERANCE: f64 = 0.05;

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            tie_tolerance: DEFAULT_TIE_TOLERANCE,
        }
    }
}

impl SelectionConfig {
    /// Set the tie tolerance
    pub fn with_tie_tolerance(mut self, tolerance: f64) -> Self {
        self.tie_tolerance = tolerance.max(0.0);
        self
    }
}

/// Outcome of a selection, with the full cost table
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Chosen strategy
    pub chosen: NtkImplementation,
    /// Every strategy that was considered
    pub candidates: Vec<StrategyCost>,
}

impl Selection {
    /// Cost entry of one strategy, if it was considered
    pub fn cost_of(&self, implementation: NtkImplementation) -> Option<&StrategyCost> {
        self.candidates
            .iter()
            .find(|c| c.implementation == implementation)
    }
}

/// Pick a strategy from precomputed costs
///
/// # Algorithm
///
/// 1. Find the minimum estimated FLOPs among the candidates
/// 2. Keep candidates within `(1 + tie_tolerance)` of that minimum
/// 3. Among those, return the earliest in [`NtkImplementation::CONCRETE`]
pub fn pick_cheapest(
    candidates: &[StrategyCost],
    tie_tolerance: f64,
) -> NtkResult<NtkImplementation> {
    let best = candidates
        .iter()
        .map(|c| c.flops)
        .fold(f64::INFINITY, f64::min);
    candidates
        .iter()
        .filter(|c| c.flops <= best * (1.0 + tie_tolerance))
        .min_by_key(|c| c.implementation.preference())
        .map(|c| c.implementation)
        .ok_or_else(|| NtkError::unavailable("no strategy candidates to choose from"))
}

/// Estimate every runnable strategy and pick one
///
/// Structured derivatives are left out of the table when the network is
/// not traceable.
pub fn select_implementation(
    problem: &ProblemStats,
    config: &SelectionConfig,
) -> NtkResult<Selection> {
    let mut candidates = Vec::with_capacity(3);
    match estimate_structured_derivatives(problem) {
        Some(cost) => candidates.push(cost),
        None => log::warn!(
            "network is not traceable into primitive layers; auto selection skips structured derivatives"
        ),
    }
    candidates.push(estimate_ntk_vector_products(problem));
    candidates.push(estimate_jacobian_contraction(problem));

    let chosen = pick_cheapest(&candidates, config.tie_tolerance)?;
    for c in &candidates {
        log::debug!(
            "auto: {:<24} {:>12.3e} flops {:>12} bytes{}",
            c.implementation.name(),
            c.flops,
            c.peak_memory,
            if c.implementation == chosen { "  <- chosen" } else { "" }
        );
    }
    Ok(Selection { chosen, candidates })
}
