//! Cost-based dispatch
//!
//! [`Auto`] estimates every runnable strategy for the shapes of the current
//! call and runs the cheapest. It is a dispatcher, not an algorithm: its
//! result is exactly the chosen strategy's.

use crate::jacobian::JacobianContraction;
use crate::kernel::{KernelPlan, KernelStrategy};
use crate::ntk_vp::NtkVectorProducts;
use crate::structured::StructuredDerivatives;
use ndarray::Array4;
use ntkrs_ad::Network;
use ntkrs_core::{NtkError, NtkResult, Scalar, StructuredValue};
use ntkrs_planner::{select_implementation, NtkImplementation, Selection, SelectionConfig};

/// AUTO strategy
#[derive(Debug, Clone, Default)]
pub struct Auto {
    /// Tie-break configuration
    pub config: SelectionConfig,
}

impl Auto {
    /// Selector with the given tie-breaking
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Cost table and choice for one call
    pub fn select<T: Scalar>(
        &self,
        network: &Network<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Selection> {
        let problem = plan.problem_stats(network)?;
        select_implementation(&problem, &self.config)
    }
}

impl<T: Scalar> KernelStrategy<T> for Auto {
    fn implementation(&self) -> NtkImplementation {
        NtkImplementation::Auto
    }

    fn compute(
        &self,
        network: &Network<T>,
        params: &StructuredValue<T>,
        plan: &KernelPlan<T>,
    ) -> NtkResult<Vec<Array4<T>>> {
        let selection = self.select(network, plan)?;
        log::debug!("auto dispatching to {}", selection.chosen);
        concrete_strategy::<T>(selection.chosen)?.compute(network, params, plan)
    }
}

/// Strategy object for a concrete tag
///
/// `Auto` is not concrete; asking for it here is an
/// [`NtkError::ImplementationUnavailable`] error.
pub fn concrete_strategy<T: Scalar>(
    implementation: NtkImplementation,
) -> NtkResult<Box<dyn KernelStrategy<T>>> {
    match implementation {
        NtkImplementation::JacobianContraction => Ok(Box::new(JacobianContraction)),
        NtkImplementation::NtkVectorProducts => Ok(Box::new(NtkVectorProducts)),
        NtkImplementation::StructuredDerivatives => Ok(Box::new(StructuredDerivatives)),
        NtkImplementation::Auto => Err(NtkError::unavailable(
            "auto selection must resolve to a concrete strategy",
        )),
    }
}

/// Strategy object for any tag, `Auto` included
pub fn strategy_for<T: Scalar>(
    implementation: NtkImplementation,
    selection: &SelectionConfig,
) -> Box<dyn KernelStrategy<T>> {
    match concrete_strategy(implementation) {
        Ok(strategy) => strategy,
        Err(_) => Box::new(Auto::new(selection.clone())),
    }
}
