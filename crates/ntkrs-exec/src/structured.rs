//! Structured derivatives
//!
//! Every parameterized primitive computes `z = P W + b` over a patch matrix
//! `P`, so the weight block of a Jacobian row is `Pᵀ G` for that row's output
//! cotangent `G`. This strategy records `(P, G)` at every primitive through a
//! [`PrimitiveTap`] and contracts site by site:
//!
//! ```text
//! K[r1, r2] = Σ_sites  ⟨P1ᵀ G1[r1], P2ᵀ G2[r2]⟩ + ⟨1ᵀ G1[r1], 1ᵀ G2[r2]⟩
//! ```
//!
//! Each site uses whichever of two forms is cheaper for its shapes: the
//! Gram form `Σ G1 ⊙ (P1 P2ᵀ G2)`, which never builds a weight-sized
//! tensor, or the materialized form that builds the per-layer `Pᵀ G` rows.
//! The flattened full-parameter Jacobian is never formed.

use crate::kernel::{add_block, KernelPlan, KernelStrategy, LeafPlan, Side};
use ndarray::{Array2, Array4, Axis as NdAxis};
use ntkrs_ad::transforms::{map_indexed, vjp_params};
use ntkrs_ad::{AffineSite, Network, PrimitiveTap};
use ntkrs_core::{NtkError, NtkResult, Scalar, StructuredValue};
use ntkrs_planner::{site_contraction_cost, NtkImplementation, SiteForm, SiteKind, SiteStats};

/// Structured-derivatives strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredDerivatives;

/// One primitive call seen by [`RecordingTap`]
#[derive(Debug, Clone)]
struct RecordedSite<T> {
    kind: SiteKind,
    has_bias: bool,
    patches: Option<Array2<T>>,
    cotangent: Array2<T>,
}

/// Tap that copies every site and skips the weight-gradient products
#[derive(Debug)]
struct RecordingTap<T> {
    keep_patches: bool,
    sites: Vec<RecordedSite<T>>,
}

impl<T: Scalar> PrimitiveTap<T> for RecordingTap<T> {
    fn on_affine(&mut self, site: &AffineSite<'_, T>) -> NtkResult<()> {
        self.sites.push(RecordedSite {
            kind: site.kind,
            has_bias: site.has_bias,
            patches: self.keep_patches.then(|| site.patches.clone()),
            cotangent: site.cotangent.clone(),
        });
        Ok(())
    }

    fn wants_param_cotangents(&self) -> bool {
        false
    }
}

/// All rows of one primitive for one example
#[derive(Debug, Clone)]
struct SiteTrace<T> {
    kind: SiteKind,
    has_bias: bool,
    /// `(positions, fan_in)`
    patches: Array2<T>,
    /// One `(positions, fan_out)` cotangent per kernel row
    cotangents: Vec<Array2<T>>,
}

impl<T: Scalar> SiteTrace<T> {
    fn positions(&self) -> usize {
        self.patches.nrows()
    }

    fn fan_in(&self) -> usize {
        self.patches.ncols()
    }

    fn fan_out(&self) -> usize {
        self.cotangents.first().map_or(0, |g| g.ncols())
    }

    fn param_count(&self) -> usize {
        self.fan_in() * self.fan_out() + if self.has_bias { self.fan_out() } else { 0 }
    }

    fn stats(&self) -> SiteStats {
        SiteStats {
            kind: self.kind,
            positions: self.positions(),
            fan_in: self.fan_in(),
            fan_out: self.fan_out(),
            has_bias: self.has_bias,
        }
    }

    /// Rows `vec(Pᵀ G[r])`, `(rows, fan_in · fan_out)`
    fn weight_rows(&self) -> NtkResult<Array2<T>> {
        let width = self.fan_in() * self.fan_out();
        let mut out = Array2::zeros((self.cotangents.len(), width));
        for (r, g) in self.cotangents.iter().enumerate() {
            let w = self.patches.t().dot(g);
            let flat = w
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(width)
                .map_err(|e| NtkError::shape_mismatch(e.to_string()))?;
            out.row_mut(r).assign(&flat);
        }
        Ok(out)
    }

    /// Rows `1ᵀ G[r]`, `(rows, fan_out)`
    fn bias_rows(&self) -> Array2<T> {
        let mut out = Array2::zeros((self.cotangents.len(), self.fan_out()));
        for (r, g) in self.cotangents.iter().enumerate() {
            out.row_mut(r).assign(&g.sum_axis(NdAxis(0)));
        }
        out
    }
}

/// Per-example site traces plus whatever the chosen forms precompute
#[derive(Debug)]
struct UnitTrace<T> {
    sites: Vec<SiteTrace<T>>,
    /// Materialized weight rows, for sites using that form
    weights: Vec<Option<Array2<T>>>,
    /// Bias rows, for sites with a bias
    biases: Vec<Option<Array2<T>>>,
}

impl<T: Scalar> KernelStrategy<T> for StructuredDerivatives {
    fn implementation(&self) -> NtkImplementation {
        NtkImplementation::StructuredDerivatives
    }

    fn compute(
        &self,
        network: &Network<T>,
        params: &StructuredValue<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Vec<Array4<T>>> {
        if !network.is_traceable() {
            return Err(NtkError::unavailable(format!(
                "network '{}' contains layers that do not report their primitives",
                network.layer().name()
            )));
        }
        let (n1, n2) = (plan.n1(), plan.n2());
        let mut blocks = plan.empty_blocks();
        for (l, leaf) in plan.leaves.iter().enumerate() {
            if leaf.rows1() == 0 || leaf.rows2() == 0 {
                continue;
            }
            let raw1 = record(network, params, plan, Side::First, l)?;
            let raw2 = record(network, params, plan, Side::Second, l)?;
            check_coverage(&raw1[0], params.size())?;
            let forms = site_forms(&raw1[0], &raw2[0], n1, n2, leaf)?;
            let traces1 = prepare(raw1, &forms)?;
            let traces2 = prepare(raw2, &forms)?;

            let pairs = map_indexed(n1 * n2, |idx| {
                let (i, j) = (idx / n2, idx % n2);
                contract(&traces1[i], &traces2[j], &forms, leaf)
            })?;
            for (idx, block) in pairs.iter().enumerate() {
                add_block(&mut blocks[l], idx / n2, idx % n2, block);
            }
        }
        Ok(blocks)
    }
}

/// Reverse passes for every row of every unit of one side, grouped by site
fn record<T: Scalar>(
    network: &Network<T>,
    params: &StructuredValue<T>,
    plan: &KernelPlan<T>,
    side: Side,
    leaf: usize,
) -> NtkResult<Vec<Vec<SiteTrace<T>>>> {
    let (units, rows) = match side {
        Side::First => (&plan.units1, plan.leaves[leaf].rows1()),
        Side::Second => (&plan.units2, plan.leaves[leaf].rows2()),
    };
    let passes = map_indexed(units.len() * rows, |idx| {
        let (u, k) = (idx / rows, idx % rows);
        let basis = plan.basis(side, leaf, k)?;
        let mut tap = RecordingTap {
            keep_patches: k == 0,
            sites: Vec::new(),
        };
        vjp_params(network, params, &units[u], &basis, &mut tap)?;
        Ok(tap.sites)
    })?;

    let mut traces: Vec<Vec<SiteTrace<T>>> = Vec::with_capacity(units.len());
    for (idx, sites) in passes.into_iter().enumerate() {
        if idx % rows == 0 {
            let first = sites
                .into_iter()
                .map(|s| {
                    let patches = s.patches.ok_or_else(|| {
                        NtkError::unavailable("primitive reported no patch matrix")
                    })?;
                    Ok(SiteTrace {
                        kind: s.kind,
                        has_bias: s.has_bias,
                        patches,
                        cotangents: vec![s.cotangent],
                    })
                })
                .collect::<NtkResult<Vec<_>>>()?;
            traces.push(first);
            continue;
        }
        let unit = traces
            .last_mut()
            .ok_or_else(|| NtkError::unavailable("site trace out of order"))?;
        if unit.len() != sites.len() {
            return Err(NtkError::unavailable(
                "primitive sequence changed between reverse passes",
            ));
        }
        for (trace, s) in unit.iter_mut().zip(sites) {
            trace.cotangents.push(s.cotangent);
        }
    }
    Ok(traces)
}

/// Reported primitives must own every parameter
fn check_coverage<T: Scalar>(sites: &[SiteTrace<T>], param_count: usize) -> NtkResult<()> {
    let covered: usize = sites.iter().map(SiteTrace::param_count).sum();
    if covered != param_count {
        return Err(NtkError::unavailable(format!(
            "traced primitives cover {} of {} parameters",
            covered, param_count
        )));
    }
    Ok(())
}

/// Pick a contraction form per site and check the two sides line up
fn site_forms<T: Scalar>(
    sites1: &[SiteTrace<T>],
    sites2: &[SiteTrace<T>],
    n1: usize,
    n2: usize,
    leaf: &LeafPlan,
) -> NtkResult<Vec<SiteForm>> {
    if sites1.len() != sites2.len() {
        return Err(NtkError::unavailable(format!(
            "batches traced to {} and {} primitives",
            sites1.len(),
            sites2.len()
        )));
    }
    sites1
        .iter()
        .zip(sites2)
        .map(|(a, b)| {
            if a.kind != b.kind || a.fan_in() != b.fan_in() || a.fan_out() != b.fan_out() {
                return Err(NtkError::shape_mismatch(format!(
                    "primitive {:?} ({}x{}) does not match {:?} ({}x{})",
                    a.kind,
                    a.fan_in(),
                    a.fan_out(),
                    b.kind,
                    b.fan_in(),
                    b.fan_out()
                )));
            }
            let mut stats = a.stats();
            stats.positions = a.positions().max(b.positions());
            let (form, _) =
                site_contraction_cost(&stats, n1, n2, leaf.rows1(), leaf.rows2()).best();
            Ok(form)
        })
        .collect()
}

fn prepare<T: Scalar>(
    raw: Vec<Vec<SiteTrace<T>>>,
    forms: &[SiteForm],
) -> NtkResult<Vec<UnitTrace<T>>> {
    raw.into_iter()
        .map(|sites| {
            let weights = sites
                .iter()
                .zip(forms)
                .map(|(s, form)| match form {
                    SiteForm::Materialized => s.weight_rows().map(Some),
                    SiteForm::Gram => Ok(None),
                })
                .collect::<NtkResult<Vec<_>>>()?;
            let biases = sites
                .iter()
                .map(|s| s.has_bias.then(|| s.bias_rows()))
                .collect();
            Ok(UnitTrace {
                sites,
                weights,
                biases,
            })
        })
        .collect()
}

/// Traced `(F1, F2)` block of one example pair
fn contract<T: Scalar>(
    a: &UnitTrace<T>,
    b: &UnitTrace<T>,
    forms: &[SiteForm],
    leaf: &LeafPlan,
) -> NtkResult<Array2<T>> {
    let (r1, r2) = (leaf.rows1(), leaf.rows2());
    let mut c = Array2::<T>::zeros((r1, r2));
    for (s, form) in forms.iter().enumerate() {
        let (sa, sb) = (&a.sites[s], &b.sites[s]);
        match (form, &a.weights[s], &b.weights[s]) {
            (SiteForm::Materialized, Some(wa), Some(wb)) => {
                c += &wa.dot(&wb.t());
            }
            _ => {
                let gram = sa.patches.dot(&sb.patches.t());
                for (q, gb) in sb.cotangents.iter().enumerate() {
                    let m = gram.dot(gb);
                    for (p, ga) in sa.cotangents.iter().enumerate() {
                        c[[p, q]] += (ga * &m).sum();
                    }
                }
            }
        }
        if let (Some(ba), Some(bb)) = (&a.biases[s], &b.biases[s]) {
            c += &ba.dot(&bb.t());
        }
    }
    Ok(leaf.trace_block(&c))
}
