//! Cost models for empirical NTK strategies
//!
//! Estimates floating-point operation counts and peak memory for the three
//! concrete strategies from a handful of statistics: batch sizes, output
//! feature and trace sizes, forward FLOPs of one example, parameter count,
//! and (for structured derivatives) the shape of every weight-shared affine
//! primitive in the network.
//!
//! All counts are per call and use the convention of 2 FLOPs per
//! multiply-add. They are proxies for ranking strategies, not predictions of
//! wall-clock time.

use crate::select::NtkImplementation;

/// Cost of one reverse pass relative to a forward pass, including the
/// forward recomputation the pass needs
pub const VJP_COST_FACTOR: f64 = 3.0;

/// Cost of one forward-mode pass relative to a forward pass
pub const JVP_COST_FACTOR: f64 = 3.0;

/// Kind of parameterized primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// Fully connected layer over the last axis
    Dense,
    /// 2D convolution
    Conv,
}

/// Shape statistics of one weight-shared affine primitive
///
/// The primitive computes `z[s, v] = Σ_u P[s, u] W[u, v] + b[v]` for
/// `positions` rows `s` of a patch matrix `P`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStats {
    /// Primitive kind
    pub kind: SiteKind,
    /// Weight-sharing positions per example (1 for a dense layer on vectors)
    pub positions: usize,
    /// Patch length (input features per position)
    pub fan_in: usize,
    /// Output channels
    pub fan_out: usize,
    /// Whether the primitive has a bias vector
    pub has_bias: bool,
}

impl SiteStats {
    /// Number of weight entries
    pub fn weight_count(&self) -> usize {
        self.fan_in * self.fan_out
    }

    /// Number of parameters, bias included
    pub fn param_count(&self) -> usize {
        self.weight_count() + if self.has_bias { self.fan_out } else { 0 }
    }

    /// Forward FLOPs for one example
    pub fn forward_flops(&self) -> f64 {
        let mac = 2.0 * (self.positions * self.fan_in * self.fan_out) as f64;
        let bias = if self.has_bias {
            (self.positions * self.fan_out) as f64
        } else {
            0.0
        };
        mac + bias
    }
}

/// Per-example statistics of a whole network
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStats {
    /// Forward FLOPs for one example
    pub forward_flops: f64,
    /// Total parameter count
    pub param_count: usize,
    /// Affine primitives in forward order
    pub sites: Vec<SiteStats>,
    /// Whether every layer reports its primitives
    pub traceable: bool,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStats {
    /// Empty, traceable statistics
    pub fn new() -> Self {
        Self {
            forward_flops: 0.0,
            param_count: 0,
            sites: Vec::new(),
            traceable: true,
        }
    }

    /// Account for parameter-free work
    pub fn add_flops(&mut self, flops: f64) {
        self.forward_flops += flops;
    }

    /// Account for an affine primitive
    pub fn add_site(&mut self, site: SiteStats) {
        self.forward_flops += site.forward_flops();
        self.param_count += site.param_count();
        self.sites.push(site);
    }

    /// Account for parameters no primitive reports
    pub fn add_untraced_params(&mut self, count: usize, flops: f64) {
        self.param_count += count;
        self.forward_flops += flops;
        self.traceable = false;
    }

    /// Parameters covered by reported primitives
    pub fn covered_params(&self) -> usize {
        self.sites.iter().map(SiteStats::param_count).sum()
    }
}

/// Sizes of one output leaf as seen by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStats {
    /// Feature elements per example of the first batch
    pub features1: usize,
    /// Feature elements per example of the second batch
    pub features2: usize,
    /// Product of trace axis sizes
    pub trace: usize,
}

impl OutputStats {
    /// Output elements per example of the first batch
    pub fn rows1(&self) -> usize {
        self.features1 * self.trace
    }

    /// Output elements per example of the second batch
    pub fn rows2(&self) -> usize {
        self.features2 * self.trace
    }
}

/// Everything the cost model needs about one kernel call
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemStats {
    /// Examples in the first batch
    pub n1: usize,
    /// Examples in the second batch
    pub n2: usize,
    /// One entry per output leaf
    pub outputs: Vec<OutputStats>,
    /// Network statistics
    pub network: NetworkStats,
    /// Bytes per scalar
    pub element_bytes: usize,
}

impl ProblemStats {
    /// Statistics for `n1` by `n2` examples
    pub fn new(n1: usize, n2: usize, network: NetworkStats) -> Self {
        Self {
            n1,
            n2,
            outputs: Vec::new(),
            network,
            element_bytes: std::mem::size_of::<f64>(),
        }
    }

    /// Add an output leaf
    pub fn with_output(mut self, output: OutputStats) -> Self {
        self.outputs.push(output);
        self
    }

    /// Set the scalar width
    pub fn with_element_bytes(mut self, bytes: usize) -> Self {
        self.element_bytes = bytes;
        self
    }

    /// Output elements per example of the first batch, all leaves
    pub fn rows1(&self) -> usize {
        self.outputs.iter().map(OutputStats::rows1).sum()
    }

    /// Output elements per example of the second batch, all leaves
    pub fn rows2(&self) -> usize {
        self.outputs.iter().map(OutputStats::rows2).sum()
    }

    fn bytes(&self, elements: f64) -> usize {
        (elements * self.element_bytes as f64) as usize
    }

    fn kernel_elements(&self) -> f64 {
        self.outputs
            .iter()
            .map(|o| (self.n1 * self.n2 * o.features1 * o.features2) as f64)
            .sum()
    }
}

/// Estimated cost of one strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyCost {
    /// Strategy
    pub implementation: NtkImplementation,
    /// Floating-point operations
    pub flops: f64,
    /// Peak bytes of intermediates
    pub peak_memory: usize,
}

/// How the structured strategy contracts one primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteForm {
    /// Contract through the Gram matrix of the two patch matrices
    Gram,
    /// Materialize the per-layer weight Jacobian `Pᵀ G` and contract it
    Materialized,
}

/// FLOPs of both contraction forms for one primitive and one output leaf
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteContractionCost {
    /// Gram form
    pub gram: f64,
    /// Materialized form
    pub materialized: f64,
}

impl SiteContractionCost {
    /// Cheaper form and its cost
    pub fn best(&self) -> (SiteForm, f64) {
        if self.gram < self.materialized {
            (SiteForm::Gram, self.gram)
        } else {
            (SiteForm::Materialized, self.materialized)
        }
    }
}

/// Weight-contraction FLOPs of one primitive
///
/// With `S` positions, patch length `U`, `V` output channels and `r1`, `r2`
/// output rows per example:
///
/// * Gram: per example pair `2·S²·U` for `P1·P2ᵀ`, `r2·2·S²·V` for
///   `A·G2[o]`, and `r1·r2·2·S·V` for the final inner products.
/// * Materialized: `2·S·U·V` per row and unit to form `Pᵀ G[o]`, then
///   `r1·r2·2·U·V` per example pair.
///
/// # Examples
///
/// ```
/// use ntkrs_planner::{site_contraction_cost, SiteForm, SiteKind, SiteStats};
///
/// // Dense layer on vectors: one position, so the Gram form is cheap
/// let dense = SiteStats { kind: SiteKind::Dense, positions: 1, fan_in: 512, fan_out: 512, has_bias: true };
/// let cost = site_contraction_cost(&dense, 4, 4, 10, 10);
/// assert_eq!(cost.best().0, SiteForm::Gram);
///
/// // Early convolution with few channels and many positions
/// let conv = SiteStats { kind: SiteKind::Conv, positions: 1024, fan_in: 27, fan_out: 16, has_bias: true };
/// let cost = site_contraction_cost(&conv, 4, 4, 10, 10);
/// assert_eq!(cost.best().0, SiteForm::Materialized);
/// ```
pub fn site_contraction_cost(
    site: &SiteStats,
    n1: usize,
    n2: usize,
    rows1: usize,
    rows2: usize,
) -> SiteContractionCost {
    let s = site.positions as f64;
    let u = site.fan_in as f64;
    let v = site.fan_out as f64;
    let (r1, r2) = (rows1 as f64, rows2 as f64);
    let pairs = (n1 * n2) as f64;

    let gram_pair = 2.0 * s * s * u + r2 * 2.0 * s * s * v + r1 * r2 * 2.0 * s * v;
    let materialize = (n1 as f64 * r1 + n2 as f64 * r2) * 2.0 * s * u * v;
    let mat_pair = r1 * r2 * 2.0 * u * v;

    SiteContractionCost {
        gram: pairs * gram_pair,
        materialized: materialize + pairs * mat_pair,
    }
}

/// Materialize both per-example Jacobians and contract them
///
/// FLOPs: one reverse pass per output element of every example, plus
/// `2·n1·n2·F1·F2·T·P` per leaf for the contraction. Memory: both Jacobians.
pub fn estimate_jacobian_contraction(problem: &ProblemStats) -> StrategyCost {
    let fp = problem.network.forward_flops;
    let p = problem.network.param_count as f64;
    let rows = (problem.n1 * problem.rows1() + problem.n2 * problem.rows2()) as f64;

    let jacobians = rows * VJP_COST_FACTOR * fp;
    let contraction: f64 = problem
        .outputs
        .iter()
        .map(|o| 2.0 * (problem.n1 * problem.n2 * o.features1 * o.features2 * o.trace) as f64 * p)
        .sum();

    StrategyCost {
        implementation: NtkImplementation::JacobianContraction,
        flops: jacobians + contraction,
        peak_memory: problem.bytes(rows * p + problem.kernel_elements()),
    }
}

/// One VJP at the first batch and one JVP over the second batch per basis vector
///
/// FLOPs: `n1·R1·(VJP·FP + n2·JVP·FP)`. Memory: one parameter-space
/// cotangent, one batch of tangent outputs and the kernel.
pub fn estimate_ntk_vector_products(problem: &ProblemStats) -> StrategyCost {
    let fp = problem.network.forward_flops;
    let p = problem.network.param_count as f64;
    let basis = (problem.n1 * problem.rows1()) as f64;
    let per_basis = VJP_COST_FACTOR * fp + problem.n2 as f64 * JVP_COST_FACTOR * fp;

    StrategyCost {
        implementation: NtkImplementation::NtkVectorProducts,
        flops: basis * per_basis,
        peak_memory: problem.bytes(
            p + (problem.n2 * problem.rows2()) as f64 + problem.kernel_elements(),
        ),
    }
}

/// Layer-by-layer contraction of recorded activations and cotangents
///
/// Returns `None` when the network is not traceable. FLOPs: the same reverse
/// passes as Jacobian contraction, plus for every primitive the cheaper of
/// the two forms from [`site_contraction_cost`] and the bias contraction.
pub fn estimate_structured_derivatives(problem: &ProblemStats) -> Option<StrategyCost> {
    if !problem.network.traceable {
        return None;
    }
    let fp = problem.network.forward_flops;
    let units_rows = (problem.n1 * problem.rows1() + problem.n2 * problem.rows2()) as f64;
    let cotangents = units_rows * VJP_COST_FACTOR * fp;

    let mut contraction = 0.0;
    let mut stored = 0.0;
    for o in &problem.outputs {
        let pairs = (problem.n1 * problem.n2) as f64;
        for site in &problem.network.sites {
            let (_, weight) =
                site_contraction_cost(site, problem.n1, problem.n2, o.rows1(), o.rows2()).best();
            contraction += weight;
            if site.has_bias {
                contraction += pairs * (o.rows1() * o.rows2() * 2 * site.fan_out) as f64;
            }
            let rows = (problem.n1 * o.rows1() + problem.n2 * o.rows2()) as f64;
            stored += rows * (site.positions * site.fan_out) as f64;
            stored += ((problem.n1 + problem.n2) * site.positions * site.fan_in) as f64;
        }
    }

    Some(StrategyCost {
        implementation: NtkImplementation::StructuredDerivatives,
        flops: cotangents + contraction,
        peak_memory: problem.bytes(stored + problem.kernel_elements()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp_stats() -> NetworkStats {
        let mut net = NetworkStats::new();
        net.add_site(SiteStats {
            kind: SiteKind::Dense,
            positions: 1,
            fan_in: 8,
            fan_out: 16,
            has_bias: true,
        });
        net.add_flops(16.0);
        net.add_site(SiteStats {
            kind: SiteKind::Dense,
            positions: 1,
            fan_in: 16,
            fan_out: 4,
            has_bias: true,
        });
        net
    }

    #[test]
    fn test_site_stats() {
        let site = SiteStats {
            kind: SiteKind::Conv,
            positions: 36,
            fan_in: 27,
            fan_out: 32,
            has_bias: true,
        };
        assert_eq!(site.param_count(), 27 * 32 + 32);
        // 2 * 36 * 27 * 32 + 36 * 32
        assert_eq!(site.forward_flops(), 62208.0 + 1152.0);
    }

    #[test]
    fn test_network_stats_accumulate() {
        let net = mlp_stats();
        assert_eq!(net.param_count, 8 * 16 + 16 + 16 * 4 + 4);
        assert_eq!(net.covered_params(), net.param_count);
        // 2*8*16 + 16 + 16 + 2*16*4 + 4
        assert_eq!(net.forward_flops, 256.0 + 16.0 + 16.0 + 128.0 + 4.0);
        assert!(net.traceable);
    }

    #[test]
    fn test_jacobian_contraction_cost() {
        let problem = ProblemStats::new(2, 3, mlp_stats()).with_output(OutputStats {
            features1: 4,
            features2: 4,
            trace: 1,
        });
        let cost = estimate_jacobian_contraction(&problem);
        let fp = problem.network.forward_flops;
        let p = problem.network.param_count as f64;
        // (2*4 + 3*4) reverse passes plus 2 * 2*3*4*4 * P
        let expected = 20.0 * 3.0 * fp + 2.0 * 96.0 * p;
        assert!((cost.flops - expected).abs() < 1e-9);
        assert_eq!(cost.implementation, NtkImplementation::JacobianContraction);
    }

    #[test]
    fn test_untraceable_has_no_structured_cost() {
        let mut net = mlp_stats();
        net.add_untraced_params(10, 20.0);
        assert!(!net.traceable);
        let problem = ProblemStats::new(1, 1, net).with_output(OutputStats {
            features1: 1,
            features2: 1,
            trace: 1,
        });
        assert!(estimate_structured_derivatives(&problem).is_none());
    }

    #[test]
    fn test_vector_products_grow_with_outputs() {
        let small = ProblemStats::new(4, 4, mlp_stats()).with_output(OutputStats {
            features1: 1,
            features2: 1,
            trace: 1,
        });
        let large = ProblemStats::new(4, 4, mlp_stats()).with_output(OutputStats {
            features1: 100,
            features2: 100,
            trace: 1,
        });
        let a = estimate_ntk_vector_products(&small).flops;
        let b = estimate_ntk_vector_products(&large).flops;
        assert!((b / a - 100.0).abs() < 1e-9);
    }
}
