//! Parameter-free reshaping layers

use crate::layer::{expect_leaf, expect_leaf_shape, Layer, PrimitiveTap, Tree};
use ntkrs_core::{NtTree, NtkError, NtkResult, Scalar, Shapes};
use ntkrs_planner::NetworkStats;
use rand::rngs::StdRng;

/// Collapse every axis but the leading one: `(N, a, b, …) -> (N, a·b·…)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flatten;

impl Flatten {
    fn flat_shape(shape: &[usize]) -> NtkResult<Vec<usize>> {
        match shape.split_first() {
            Some((&n, rest)) => Ok(vec![n, rest.iter().product()]),
            None => Err(NtkError::shape_mismatch("flatten needs an input of rank >= 1")),
        }
    }
}

impl<T: Scalar> Layer<T> for Flatten {
    fn name(&self) -> String {
        "Flatten".to_string()
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(NtTree::leaf(Self::flat_shape(expect_leaf_shape(
            input_shape,
            "flatten",
        )?)?))
    }

    fn init(&self, _rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        Ok((
            <Self as Layer<T>>::output_shape(self, input_shape)?,
            NtTree::empty(),
        ))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        Ok((
            <Self as Layer<T>>::output_shape(self, input_shape)?,
            NtTree::empty(),
        ))
    }

    fn apply(&self, _params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let x = expect_leaf(input, "flatten")?;
        Ok(NtTree::leaf(x.reshape(&Self::flat_shape(x.shape())?)?))
    }

    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        _params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        Ok((self.apply(params, input)?, self.apply(params, input_dot)?))
    }

    fn vjp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        _tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let x = expect_leaf(input, "flatten")?;
        let g = expect_leaf(cotangent, "flatten cotangent")?;
        Ok((NtTree::empty(), NtTree::leaf(g.reshape(x.shape())?)))
    }

    fn profile(&self, input_shape: &Shapes, _stats: &mut NetworkStats) -> NtkResult<Shapes> {
        <Self as Layer<T>>::output_shape(self, input_shape)
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

/// Pass the input through unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity;

impl<T: Scalar> Layer<T> for Identity {
    fn name(&self) -> String {
        "Identity".to_string()
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(input_shape.clone())
    }

    fn init(&self, _rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        Ok((input_shape.clone(), NtTree::empty()))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        Ok((
            <Self as Layer<T>>::output_shape(self, input_shape)?,
            NtTree::empty(),
        ))
    }

    fn apply(&self, _params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        Ok(input.clone())
    }

    fn jvp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        _params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        Ok((input.clone(), input_dot.clone()))
    }

    fn vjp(
        &self,
        _params: &Tree<T>,
        _input: &Tree<T>,
        cotangent: &Tree<T>,
        _tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        Ok((NtTree::empty(), cotangent.clone()))
    }

    fn profile(&self, input_shape: &Shapes, _stats: &mut NetworkStats) -> NtkResult<Shapes> {
        Ok(input_shape.clone())
    }

    fn is_traceable(&self) -> bool {
        true
    }
}
