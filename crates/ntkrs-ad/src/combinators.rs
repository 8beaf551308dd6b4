//! Layer combinators
//!
//! Parameters of a combinator are a tuple with one group per child layer,
//! in child order. Branching inputs (for [`Parallel`] and the fan-in layers)
//! are lists or tuples; the container kind is preserved on output.

use crate::layer::{branches, param_groups, Layer, PrimitiveTap, Tree};
use ndarray::{Axis as NdAxis, Slice};
use ntkrs_core::{canonicalize_axis, DenseND, NtTree, NtkError, NtkResult, Scalar, Shapes, SignedAxis};
use ntkrs_planner::NetworkStats;
use rand::rngs::StdRng;

/// Apply layers one after another
#[derive(Debug)]
pub struct Serial<T: Scalar> {
    layers: Vec<Box<dyn Layer<T>>>,
}

impl<T: Scalar> Serial<T> {
    pub fn new(layers: Vec<Box<dyn Layer<T>>>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Box<dyn Layer<T>>] {
        &self.layers
    }
}

impl<T: Scalar> Layer<T> for Serial<T> {
    fn name(&self) -> String {
        let names: Vec<String> = self.layers.iter().map(|l| l.name()).collect();
        format!("Serial[{}]", names.join(", "))
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        self.layers
            .iter()
            .try_fold(input_shape.clone(), |shape, l| l.output_shape(&shape))
    }

    fn init(&self, rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        let mut shape = input_shape.clone();
        let mut groups = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, params) = layer.init(rng, &shape)?;
            groups.push(params);
            shape = out;
        }
        Ok((shape, NtTree::tuple(groups)))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        let mut shape = input_shape.clone();
        let mut groups = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, params) = layer.param_shapes(&shape)?;
            groups.push(params);
            shape = out;
        }
        Ok((shape, NtTree::tuple(groups)))
    }

    fn apply(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let groups = param_groups(params, self.layers.len(), "serial")?;
        let mut x = input.clone();
        for (layer, p) in self.layers.iter().zip(groups) {
            x = layer.apply(p, &x)?;
        }
        Ok(x)
    }

    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let n = self.layers.len();
        let groups = param_groups(params, n, "serial")?;
        let dot_groups = param_groups(params_dot, n, "serial tangent")?;
        let mut x = input.clone();
        let mut dx = input_dot.clone();
        for ((layer, p), dp) in self.layers.iter().zip(groups).zip(dot_groups) {
            (x, dx) = layer.jvp(p, &x, dp, &dx)?;
        }
        Ok((x, dx))
    }

    fn vjp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let groups = param_groups(params, self.layers.len(), "serial")?;
        // Forward, keeping every layer's input
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut x = input.clone();
        for (layer, p) in self.layers.iter().zip(groups) {
            let next = layer.apply(p, &x)?;
            inputs.push(x);
            x = next;
        }
        let mut g = cotangent.clone();
        let mut param_cts = Vec::with_capacity(self.layers.len());
        for ((layer, p), x) in self.layers.iter().zip(groups).zip(&inputs).rev() {
            let (dp, dx) = layer.vjp(p, x, &g, tap)?;
            param_cts.push(dp);
            g = dx;
        }
        param_cts.reverse();
        Ok((NtTree::tuple(param_cts), g))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        self.layers
            .iter()
            .try_fold(input_shape.clone(), |shape, l| l.profile(&shape, stats))
    }

    fn is_traceable(&self) -> bool {
        self.layers.iter().all(|l| l.is_traceable())
    }
}

/// Apply one layer per branch of a list or tuple input
#[derive(Debug)]
pub struct Parallel<T: Scalar> {
    layers: Vec<Box<dyn Layer<T>>>,
}

impl<T: Scalar> Parallel<T> {
    pub fn new(layers: Vec<Box<dyn Layer<T>>>) -> Self {
        Self { layers }
    }

    fn check_arity<L>(&self, children: &[NtTree<L>]) -> NtkResult<()> {
        if children.len() != self.layers.len() {
            return Err(NtkError::structure_mismatch(format!(
                "parallel has {} layers but received {} branches",
                self.layers.len(),
                children.len()
            )));
        }
        Ok(())
    }
}

impl<T: Scalar> Layer<T> for Parallel<T> {
    fn name(&self) -> String {
        let names: Vec<String> = self.layers.iter().map(|l| l.name()).collect();
        format!("Parallel[{}]", names.join(", "))
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        let (children, rebuild) = branches(input_shape, "parallel")?;
        self.check_arity(children)?;
        let outs = self
            .layers
            .iter()
            .zip(children)
            .map(|(l, s)| l.output_shape(s))
            .collect::<NtkResult<Vec<_>>>()?;
        Ok(rebuild(outs))
    }

    fn init(&self, rng: &mut StdRng, input_shape: &Shapes) -> NtkResult<(Shapes, Tree<T>)> {
        let (children, rebuild) = branches(input_shape, "parallel")?;
        self.check_arity(children)?;
        let mut shapes = Vec::with_capacity(children.len());
        let mut groups = Vec::with_capacity(children.len());
        for (layer, s) in self.layers.iter().zip(children) {
            let (out, p) = layer.init(rng, s)?;
            shapes.push(out);
            groups.push(p);
        }
        Ok((rebuild(shapes), NtTree::tuple(groups)))
    }

    fn param_shapes(&self, input_shape: &Shapes) -> NtkResult<(Shapes, Shapes)> {
        let (children, rebuild) = branches(input_shape, "parallel")?;
        self.check_arity(children)?;
        let (shapes, groups): (Vec<Shapes>, Vec<Shapes>) = self
            .layers
            .iter()
            .zip(children)
            .map(|(l, s)| l.param_shapes(s))
            .collect::<NtkResult<Vec<_>>>()?
            .into_iter()
            .unzip();
        Ok((rebuild(shapes), NtTree::tuple(groups)))
    }

    fn apply(&self, params: &Tree<T>, input: &Tree<T>) -> NtkResult<Tree<T>> {
        let groups = param_groups(params, self.layers.len(), "parallel")?;
        let (children, rebuild) = branches(input, "parallel")?;
        self.check_arity(children)?;
        let outs = self
            .layers
            .iter()
            .zip(groups)
            .zip(children)
            .map(|((l, p), x)| l.apply(p, x))
            .collect::<NtkResult<Vec<_>>>()?;
        Ok(rebuild(outs))
    }

    fn jvp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let n = self.layers.len();
        let groups = param_groups(params, n, "parallel")?;
        let dot_groups = param_groups(params_dot, n, "parallel tangent")?;
        let (children, rebuild) = branches(input, "parallel")?;
        let (dot_children, _) = branches(input_dot, "parallel tangent")?;
        self.check_arity(children)?;
        self.check_arity(dot_children)?;
        let mut outs = Vec::with_capacity(n);
        let mut dots = Vec::with_capacity(n);
        for i in 0..n {
            let (y, dy) =
                self.layers[i].jvp(&groups[i], &children[i], &dot_groups[i], &dot_children[i])?;
            outs.push(y);
            dots.push(dy);
        }
        Ok((rebuild(outs), rebuild(dots)))
    }

    fn vjp(
        &self,
        params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let n = self.layers.len();
        let groups = param_groups(params, n, "parallel")?;
        let (children, rebuild) = branches(input, "parallel")?;
        let (ct_children, _) = branches(cotangent, "parallel cotangent")?;
        self.check_arity(children)?;
        self.check_arity(ct_children)?;
        let mut param_cts = Vec::with_capacity(n);
        let mut input_cts = Vec::with_capacity(n);
        for i in 0..n {
            let (dp, dx) = self.layers[i].vjp(&groups[i], &children[i], &ct_children[i], tap)?;
            param_cts.push(dp);
            input_cts.push(dx);
        }
        Ok((NtTree::tuple(param_cts), rebuild(input_cts)))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let (children, rebuild) = branches(input_shape, "parallel")?;
        self.check_arity(children)?;
        let outs = self
            .layers
            .iter()
            .zip(children)
            .map(|(l, s)| l.profile(s, stats))
            .collect::<NtkResult<Vec<_>>>()?;
        Ok(rebuild(outs))
    }

    fn is_traceable(&self) -> bool {
        self.layers.iter().all(|l| l.is_traceable())
    }
}

/// Duplicate the input into a list of `n` branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub num: usize,
}

impl<T: Scalar> Layer<T> for FanOut {
    fn name(&self) -> String {
        format!("FanOut({})", self.num)
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        Ok(NtTree::list(vec![input_shape.clone(); self.num]))
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
        Ok(NtTree::list(vec![input.clone(); self.num]))
    }

    fn jvp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        _params_dot: &Tree<T>,
        input_dot: &Tree<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        Ok((
            NtTree::list(vec![input.clone(); self.num]),
            NtTree::list(vec![input_dot.clone(); self.num]),
        ))
    }

    fn vjp(
        &self,
        _params: &Tree<T>,
        input: &Tree<T>,
        cotangent: &Tree<T>,
        _tap: &mut dyn PrimitiveTap<T>,
    ) -> NtkResult<(Tree<T>, Tree<T>)> {
        let (children, _) = branches(cotangent, "fan-out cotangent")?;
        if children.len() != self.num {
            return Err(NtkError::structure_mismatch(format!(
                "fan-out of {} received {} cotangent branches",
                self.num,
                children.len()
            )));
        }
        let total = children
            .iter()
            .try_fold(input.zeros_like(), |acc, c| acc.add(c))?;
        Ok((NtTree::empty(), total))
    }

    fn profile(&self, input_shape: &Shapes, _stats: &mut NetworkStats) -> NtkResult<Shapes> {
        <Self as Layer<T>>::output_shape(self, input_shape)
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

/// Sum a list of identically shaped branches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanInSum;

impl<T: Scalar> Layer<T> for FanInSum {
    fn name(&self) -> String {
        "FanInSum".to_string()
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        let (children, _) = branches(input_shape, "fan-in sum")?;
        let first = children
            .first()
            .ok_or_else(|| NtkError::structure_mismatch("fan-in sum of zero branches"))?;
        if let Some(other) = children.iter().find(|c| *c != first) {
            return Err(NtkError::shape_mismatch(format!(
                "fan-in sum branches differ: {:?} vs {:?}",
                first, other
            )));
        }
        Ok(first.clone())
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
        let (children, _) = branches(input, "fan-in sum")?;
        let (first, rest) = children
            .split_first()
            .ok_or_else(|| NtkError::structure_mismatch("fan-in sum of zero branches"))?;
        rest.iter().try_fold(first.clone(), |acc, c| acc.add(c))
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
        let (children, rebuild) = branches(input, "fan-in sum")?;
        Ok((NtTree::empty(), rebuild(vec![cotangent.clone(); children.len()])))
    }

    fn profile(&self, input_shape: &Shapes, stats: &mut NetworkStats) -> NtkResult<Shapes> {
        let out = <Self as Layer<T>>::output_shape(self, input_shape)?;
        let (children, _) = branches(input_shape, "fan-in sum")?;
        let elements: usize = out.leaves().iter().map(|s| s.iter().product::<usize>()).sum();
        stats.add_flops((children.len().saturating_sub(1) * elements) as f64);
        Ok(out)
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

/// Concatenate a list of single-tensor branches along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanInConcat {
    pub axis: SignedAxis,
}

impl FanInConcat {
    fn leaf_shapes<'a>(&self, input_shape: &'a Shapes) -> NtkResult<Vec<&'a Vec<usize>>> {
        let (children, _) = branches(input_shape, "fan-in concat")?;
        children
            .iter()
            .map(|c| {
                c.as_leaf().ok_or_else(|| {
                    NtkError::structure_mismatch("fan-in concat branches must be single tensors")
                })
            })
            .collect()
    }

    fn concat_shape(&self, shapes: &[&Vec<usize>]) -> NtkResult<(usize, Vec<usize>)> {
        let first = shapes
            .first()
            .ok_or_else(|| NtkError::structure_mismatch("fan-in concat of zero branches"))?;
        let axis = canonicalize_axis(self.axis, first.len())?;
        let mut out = (*first).clone();
        out[axis] = 0;
        for s in shapes {
            let compatible = s.len() == first.len()
                && s.iter()
                    .zip(first.iter())
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !compatible {
                return Err(NtkError::shape_mismatch(format!(
                    "cannot concatenate {:?} with {:?} along axis {}",
                    s, first, axis
                )));
            }
            out[axis] += s[axis];
        }
        Ok((axis, out))
    }
}

impl<T: Scalar> Layer<T> for FanInConcat {
    fn name(&self) -> String {
        format!("FanInConcat({})", self.axis)
    }

    fn output_shape(&self, input_shape: &Shapes) -> NtkResult<Shapes> {
        let shapes = self.leaf_shapes(input_shape)?;
        Ok(NtTree::leaf(self.concat_shape(&shapes)?.1))
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
        let shapes = input.shapes();
        let (axis, _) = self.concat_shape(&self.leaf_shapes(&shapes)?)?;
        let (children, _) = branches(input, "fan-in concat")?;
        let tensors: Vec<DenseND<T>> = children
            .iter()
            .filter_map(|c| c.as_leaf().cloned())
            .collect();
        Ok(NtTree::leaf(DenseND::concatenate(&tensors, axis)?))
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
        let shapes = input.shapes();
        let leaf_shapes = self.leaf_shapes(&shapes)?;
        let (axis, out_shape) = self.concat_shape(&leaf_shapes)?;
        let g = crate::layer::expect_leaf(cotangent, "fan-in concat cotangent")?;
        if g.shape() != out_shape.as_slice() {
            return Err(NtkError::shapes_differ("fan-in concat cotangent", &out_shape, g.shape()));
        }
        let (_, rebuild) = branches(input, "fan-in concat")?;
        let mut start = 0;
        let mut pieces = Vec::with_capacity(leaf_shapes.len());
        for s in &leaf_shapes {
            let end = start + s[axis];
            let piece = g
                .as_array()
                .slice_axis(NdAxis(axis), Slice::from(start..end))
                .to_owned();
            pieces.push(NtTree::leaf(DenseND::from_array(piece)));
            start = end;
        }
        Ok((NtTree::empty(), rebuild(pieces)))
    }

    fn profile(&self, input_shape: &Shapes, _stats: &mut NetworkStats) -> NtkResult<Shapes> {
        <Self as Layer<T>>::output_shape(self, input_shape)
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::NoTap;
    use crate::stax;
    use rand::SeedableRng;

    fn leaf(values: Vec<f64>, shape: &[usize]) -> Tree<f64> {
        NtTree::leaf(DenseND::from_vec(values, shape).unwrap())
    }

    #[test]
    fn test_serial_params_are_grouped() {
        let net: Box<dyn Layer<f64>> =
            stax::serial(vec![stax::dense(3), stax::relu(), stax::dense(2)]);
        let (out, params) = net
            .init(&mut StdRng::seed_from_u64(0), &NtTree::leaf(vec![1, 4]))
            .unwrap();
        assert_eq!(out, NtTree::leaf(vec![1, 2]));
        let groups = params.children().unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].num_leaves(), 2);
        assert_eq!(groups[1].num_leaves(), 0);
    }

    #[test]
    fn test_fan_out_fan_in_sum_doubles() {
        let net: Box<dyn Layer<f64>> = stax::serial(vec![
            stax::fan_out(2),
            stax::parallel(vec![stax::identity(), stax::identity()]),
            stax::fan_in_sum(),
        ]);
        let params = NtTree::tuple(vec![
            NtTree::empty(),
            NtTree::tuple(vec![NtTree::empty(), NtTree::empty()]),
            NtTree::empty(),
        ]);
        let x = leaf(vec![1.0, -2.0], &[1, 2]);
        let y = net.apply(&params, &x).unwrap();
        assert_eq!(y.as_leaf().unwrap().to_vec(), vec![2.0, -4.0]);

        let (_, dx) = net.vjp(&params, &x, &leaf(vec![1.0, 1.0], &[1, 2]), &mut NoTap).unwrap();
        assert_eq!(dx.as_leaf().unwrap().to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_concat_splits_cotangent() {
        let layer = FanInConcat { axis: -1 };
        let x = NtTree::list(vec![
            leaf(vec![1.0, 2.0], &[1, 2]),
            leaf(vec![3.0, 4.0, 5.0], &[1, 3]),
        ]);
        let y = layer.apply(&NtTree::empty(), &x).unwrap();
        assert_eq!(y.as_leaf().unwrap().to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let (_, dx) = layer.vjp(&NtTree::empty(), &x, &y, &mut NoTap).unwrap();
        assert_eq!(dx, x);
    }

    #[test]
    fn test_parallel_preserves_container_kind() {
        let layer = Parallel::new(vec![stax::relu::<f64>(), stax::tanh()]);
        let x = NtTree::tuple(vec![leaf(vec![-1.0], &[1, 1]), leaf(vec![0.0], &[1, 1])]);
        let params = NtTree::tuple(vec![NtTree::empty(), NtTree::empty()]);
        let y = layer.apply(&params, &x).unwrap();
        assert!(matches!(y, NtTree::Tuple(_)));
        let bad = NtTree::tuple(vec![leaf(vec![1.0], &[1, 1])]);
        assert!(matches!(
            layer.apply(&params, &bad),
            Err(NtkError::StructureMismatch(_))
        ));
    }
}
