//! Tape evaluation: numeric, derivative, dependency, and symbolic sweeps
use crate::{
    compiler::{Tape, TapeOp},
    context::{Context, Node},
    Error,
};

/// Options controlling tape compilation and evaluation
#[derive(Clone, Debug)]
pub struct Options {
    /// Reuse work-vector slots once their value is dead.
    ///
    /// Disabling this gives every node a private slot, which makes tapes much
    /// larger but can help when debugging a tape by hand.
    pub live_variables: bool,
    /// Recursion depth for the structural-equality check used by the
    /// symbolic-evaluation fast path
    pub checking_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            live_variables: true,
            checking_depth: 2,
        }
    }
}

/// Derivative sweep results from [`Function::eval_ad`]
#[derive(Clone, Debug)]
pub struct AdResult {
    /// Function outputs, indexed as `[output][element]`
    pub outputs: Vec<Vec<f64>>,
    /// Forward sensitivities, indexed as `[direction][output][element]`
    pub fwd_sens: Vec<Vec<Vec<f64>>>,
    /// Adjoint sensitivities, indexed as `[direction][input][element]`
    pub adj_sens: Vec<Vec<Vec<f64>>>,
}

/// Partial derivatives of one instruction, recorded during the taping sweep
#[derive(Copy, Clone, Debug, Default)]
struct TapeEl {
    d: [f64; 2],
}

/// A compiled function: a [`Tape`] plus its work vector and the graph nodes
/// it was built from.
///
/// Evaluation reuses the work vector across calls, so `eval` and friends take
/// `&mut self` but do not allocate per call beyond their output buffers.
pub struct Function {
    tape: Tape,
    work: Vec<f64>,
    inputs: Vec<Vec<Node>>,
    outputs: Vec<Vec<Node>>,
    free_nodes: Vec<Node>,
    checking_depth: usize,
}

impl Function {
    /// Compiles a function with default [`Options`]
    pub fn new(
        ctx: &Context,
        name: &str,
        inputs: &[Vec<Node>],
        outputs: &[Vec<Node>],
    ) -> Result<Self, Error> {
        Self::new_with(ctx, name, inputs, outputs, &Options::default())
    }

    /// Compiles a function with the given [`Options`]
    pub fn new_with(
        ctx: &Context,
        name: &str,
        inputs: &[Vec<Node>],
        outputs: &[Vec<Node>],
        options: &Options,
    ) -> Result<Self, Error> {
        let (tape, free_nodes) =
            Tape::build(ctx, name, inputs, outputs, options)?;
        let work = vec![f64::NAN; tape.worksize()];
        Ok(Self {
            tape,
            work,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            free_nodes,
            checking_depth: options.checking_depth,
        })
    }

    /// The compiled tape
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Name given to the function at construction
    pub fn name(&self) -> &str {
        self.tape.name()
    }

    /// True if every operation in the tape is differentiable everywhere
    pub fn is_smooth(&self) -> bool {
        self.tape.iter().all(|op| match op {
            TapeOp::Unary { op, .. } => op.is_smooth(),
            TapeOp::Binary { op, .. } => op.is_smooth(),
            _ => true,
        })
    }

    fn check_free(&self) -> Result<(), Error> {
        if self.tape.free_vars().is_empty() {
            Ok(())
        } else {
            Err(Error::FreeVariables {
                function: self.tape.name().to_owned(),
                vars: self.tape.free_vars().to_vec(),
            })
        }
    }

    fn check_inputs(&self, inputs: &[&[f64]]) -> Result<(), Error> {
        let sizes = self.tape.input_sizes();
        if inputs.len() != sizes.len() {
            return Err(Error::BadSlice(inputs.len(), sizes.len()));
        }
        for (given, &expected) in inputs.iter().zip(sizes) {
            if given.len() != expected {
                return Err(Error::BadSlice(given.len(), expected));
            }
        }
        Ok(())
    }

    fn new_outputs(&self) -> Vec<Vec<f64>> {
        self.tape
            .output_sizes()
            .iter()
            .map(|&n| vec![0.0; n])
            .collect()
    }

    /// Evaluates the function numerically.
    ///
    /// `inputs` must match the declared input shapes; the result is indexed
    /// as `[output][element]`.
    pub fn eval(
        &mut self,
        inputs: &[&[f64]],
    ) -> Result<Vec<Vec<f64>>, Error> {
        self.check_free()?;
        self.check_inputs(inputs)?;
        let mut outputs = self.new_outputs();
        run_forward(self.tape.ops(), &mut self.work, inputs, &mut outputs);
        Ok(outputs)
    }

    /// Evaluates the function along with forward and adjoint derivative
    /// sweeps.
    ///
    /// One taping sweep records the local partials of every instruction; each
    /// forward direction then costs one pass over the tape and each adjoint
    /// direction one reverse pass.  Seeds are indexed `[direction][argument]
    /// [element]`, forward seeds over inputs and adjoint seeds over outputs.
    pub fn eval_ad(
        &mut self,
        inputs: &[&[f64]],
        fwd_seeds: &[Vec<Vec<f64>>],
        adj_seeds: &[Vec<Vec<f64>>],
    ) -> Result<AdResult, Error> {
        self.check_free()?;
        self.check_inputs(inputs)?;
        for dir in fwd_seeds {
            self.check_seed(dir, self.tape.input_sizes())?;
        }
        for dir in adj_seeds {
            self.check_seed(dir, self.tape.output_sizes())?;
        }

        let mut outputs = self.new_outputs();
        let mut partials = vec![TapeEl::default(); self.tape.len()];

        // Taping sweep: numeric forward pass, recording local partials
        // before each in-place overwrite
        for (op, el) in self.tape.iter().zip(partials.iter_mut()) {
            match op {
                TapeOp::Input { dst, arg, offset } => {
                    self.work[*dst] = inputs[*arg][*offset]
                }
                TapeOp::Output { out, offset, src } => {
                    outputs[*out][*offset] = self.work[*src]
                }
                TapeOp::Const { dst, value } => self.work[*dst] = *value,
                TapeOp::Param { dst, .. } => self.work[*dst] = f64::NAN,
                TapeOp::Unary { dst, op, arg } => {
                    let a = self.work[*arg];
                    let f = op.eval(a);
                    el.d = [op.derivative(a, f), 0.0];
                    self.work[*dst] = f;
                }
                TapeOp::Binary { dst, op, lhs, rhs } => {
                    let a = self.work[*lhs];
                    let b = self.work[*rhs];
                    let f = op.eval(a, b);
                    el.d = op.derivatives(a, b, f);
                    self.work[*dst] = f;
                }
            }
        }

        let mut fwd_sens = vec![];
        let mut dwork = vec![0.0; self.tape.worksize()];
        for seed in fwd_seeds {
            let mut sens: Vec<Vec<f64>> = self
                .tape
                .output_sizes()
                .iter()
                .map(|&n| vec![0.0; n])
                .collect();
            for (op, el) in self.tape.iter().zip(partials.iter()) {
                match op {
                    TapeOp::Input { dst, arg, offset } => {
                        dwork[*dst] = seed[*arg][*offset]
                    }
                    TapeOp::Output { out, offset, src } => {
                        sens[*out][*offset] = dwork[*src]
                    }
                    TapeOp::Const { dst, .. }
                    | TapeOp::Param { dst, .. } => dwork[*dst] = 0.0,
                    TapeOp::Unary { dst, arg, .. } => {
                        dwork[*dst] = el.d[0] * dwork[*arg]
                    }
                    TapeOp::Binary { dst, lhs, rhs, .. } => {
                        let v = el.d[0] * dwork[*lhs]
                            + el.d[1] * dwork[*rhs];
                        dwork[*dst] = v;
                    }
                }
            }
            fwd_sens.push(sens);
        }

        let mut adj_sens = vec![];
        let mut bwork = vec![0.0; self.tape.worksize()];
        for seed in adj_seeds {
            let mut sens: Vec<Vec<f64>> = self
                .tape
                .input_sizes()
                .iter()
                .map(|&n| vec![0.0; n])
                .collect();
            // Slots are reused, so each instruction consumes and zeroes the
            // adjoint of its destination before propagating to its arguments
            for (op, el) in
                self.tape.iter().zip(partials.iter()).rev()
            {
                match op {
                    TapeOp::Output { out, offset, src } => {
                        bwork[*src] += seed[*out][*offset]
                    }
                    TapeOp::Input { dst, arg, offset } => {
                        sens[*arg][*offset] += bwork[*dst];
                        bwork[*dst] = 0.0;
                    }
                    TapeOp::Const { dst, .. }
                    | TapeOp::Param { dst, .. } => bwork[*dst] = 0.0,
                    TapeOp::Unary { dst, arg, .. } => {
                        let s = bwork[*dst];
                        bwork[*dst] = 0.0;
                        bwork[*arg] += el.d[0] * s;
                    }
                    TapeOp::Binary { dst, lhs, rhs, .. } => {
                        let s = bwork[*dst];
                        bwork[*dst] = 0.0;
                        bwork[*lhs] += el.d[0] * s;
                        bwork[*rhs] += el.d[1] * s;
                    }
                }
            }
            adj_sens.push(sens);
        }

        Ok(AdResult {
            outputs,
            fwd_sens,
            adj_sens,
        })
    }

    fn check_seed(
        &self,
        seed: &[Vec<f64>],
        sizes: &[usize],
    ) -> Result<(), Error> {
        if seed.len() != sizes.len() {
            return Err(Error::BadSeed(seed.len(), sizes.len()));
        }
        for (given, &expected) in seed.iter().zip(sizes) {
            if given.len() != expected {
                return Err(Error::BadSeed(given.len(), expected));
            }
        }
        Ok(())
    }

    /// Jacobian-vector product: directional derivative of every output along
    /// the input perturbation `seeds`
    pub fn jvp(
        &mut self,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
    ) -> Result<Vec<Vec<f64>>, Error> {
        let seed = vec![seeds.iter().map(|s| s.to_vec()).collect()];
        let mut r = self.eval_ad(inputs, &seed, &[])?;
        Ok(r.fwd_sens.pop().unwrap_or_default())
    }

    /// Vector-Jacobian product: gradient of the scalar `seedsᵀ · f(x)` with
    /// respect to every input
    pub fn vjp(
        &mut self,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
    ) -> Result<Vec<Vec<f64>>, Error> {
        let seed = vec![seeds.iter().map(|s| s.to_vec()).collect()];
        let mut r = self.eval_ad(inputs, &[], &seed)?;
        Ok(r.adj_sens.pop().unwrap_or_default())
    }

    /// Propagates dependency bitmasks forward through the tape.
    ///
    /// Each `u64` carries 64 independent seed columns.  The result is a
    /// superset of the true numeric dependency: no numeric cancellation is
    /// modeled.
    pub fn sparsity_fwd(
        &self,
        seeds: &[Vec<u64>],
    ) -> Result<Vec<Vec<u64>>, Error> {
        let sizes = self.tape.input_sizes();
        if seeds.len() != sizes.len() {
            return Err(Error::BadSeed(seeds.len(), sizes.len()));
        }
        for (given, &expected) in seeds.iter().zip(sizes) {
            if given.len() != expected {
                return Err(Error::BadSeed(given.len(), expected));
            }
        }
        let mut work = vec![0u64; self.tape.worksize()];
        let mut out: Vec<Vec<u64>> = self
            .tape
            .output_sizes()
            .iter()
            .map(|&n| vec![0; n])
            .collect();
        for op in self.tape.iter() {
            match op {
                TapeOp::Input { dst, arg, offset } => {
                    work[*dst] = seeds[*arg][*offset]
                }
                TapeOp::Output { out: o, offset, src } => {
                    out[*o][*offset] = work[*src]
                }
                TapeOp::Const { dst, .. } | TapeOp::Param { dst, .. } => {
                    work[*dst] = 0
                }
                TapeOp::Unary { dst, arg, .. } => work[*dst] = work[*arg],
                TapeOp::Binary { dst, lhs, rhs, .. } => {
                    let v = work[*lhs] | work[*rhs];
                    work[*dst] = v;
                }
            }
        }
        Ok(out)
    }

    /// Propagates dependency bitmasks backward through the tape
    pub fn sparsity_rev(
        &self,
        seeds: &[Vec<u64>],
    ) -> Result<Vec<Vec<u64>>, Error> {
        let sizes = self.tape.output_sizes();
        if seeds.len() != sizes.len() {
            return Err(Error::BadSeed(seeds.len(), sizes.len()));
        }
        for (given, &expected) in seeds.iter().zip(sizes) {
            if given.len() != expected {
                return Err(Error::BadSeed(given.len(), expected));
            }
        }
        let mut work = vec![0u64; self.tape.worksize()];
        let mut out: Vec<Vec<u64>> = self
            .tape
            .input_sizes()
            .iter()
            .map(|&n| vec![0; n])
            .collect();
        for op in self.tape.iter().rev() {
            match op {
                TapeOp::Output { out: o, offset, src } => {
                    work[*src] |= seeds[*o][*offset]
                }
                TapeOp::Input { dst, arg, offset } => {
                    out[*arg][*offset] |= work[*dst];
                    work[*dst] = 0;
                }
                TapeOp::Const { dst, .. } | TapeOp::Param { dst, .. } => {
                    work[*dst] = 0
                }
                TapeOp::Unary { dst, arg, .. } => {
                    let s = work[*dst];
                    work[*dst] = 0;
                    work[*arg] |= s;
                }
                TapeOp::Binary { dst, lhs, rhs, .. } => {
                    let s = work[*dst];
                    work[*dst] = 0;
                    work[*lhs] |= s;
                    work[*rhs] |= s;
                }
            }
        }
        Ok(out)
    }

    /// Re-evaluates the tape over symbolic arguments, building new graph
    /// nodes in `ctx`.
    ///
    /// `ctx` must be the context the function was compiled from.  If every
    /// argument is structurally equal to the corresponding declared input
    /// (up to the configured checking depth), the stored output nodes are
    /// returned without touching the tape.
    pub fn eval_symbolic(
        &self,
        ctx: &mut Context,
        args: &[Vec<Node>],
    ) -> Result<Vec<Vec<Node>>, Error> {
        let sizes = self.tape.input_sizes();
        if args.len() != sizes.len() {
            return Err(Error::BadSlice(args.len(), sizes.len()));
        }
        for (given, &expected) in args.iter().zip(sizes) {
            if given.len() != expected {
                return Err(Error::BadSlice(given.len(), expected));
            }
        }

        let identical = self.inputs.iter().zip(args).all(|(decl, given)| {
            decl.iter().zip(given).all(|(&a, &b)| {
                ctx.eq_bounded(a, b, self.checking_depth)
            })
        });
        if identical {
            return Ok(self.outputs.clone());
        }

        let mut work: Vec<Option<Node>> =
            vec![None; self.tape.worksize()];
        let mut out: Vec<Vec<Option<Node>>> = self
            .tape
            .output_sizes()
            .iter()
            .map(|&n| vec![None; n])
            .collect();
        let mut free = self.free_nodes.iter();
        for op in self.tape.iter() {
            match op {
                TapeOp::Input { dst, arg, offset } => {
                    work[*dst] = Some(args[*arg][*offset])
                }
                TapeOp::Output { out: o, offset, src } => {
                    out[*o][*offset] = work[*src]
                }
                TapeOp::Const { dst, value } => {
                    work[*dst] = Some(ctx.constant(*value))
                }
                TapeOp::Param { dst, .. } => {
                    work[*dst] = free.next().copied()
                }
                TapeOp::Unary { dst, op, arg } => {
                    let a = work[*arg].ok_or(Error::BadNode)?;
                    work[*dst] = Some(ctx.unary(*op, a)?);
                }
                TapeOp::Binary { dst, op, lhs, rhs } => {
                    let a = work[*lhs].ok_or(Error::BadNode)?;
                    let b = work[*rhs].ok_or(Error::BadNode)?;
                    work[*dst] = Some(ctx.binary(*op, a, b)?);
                }
            }
        }
        out.into_iter()
            .map(|v| {
                v.into_iter()
                    .map(|n| n.ok_or(Error::BadNode))
                    .collect()
            })
            .collect()
    }

}

/// Single forward interpreter sweep, shared by [`Function::eval`] and the
/// interpreter backend
pub(crate) fn run_forward(
    ops: &[TapeOp],
    work: &mut [f64],
    inputs: &[&[f64]],
    outputs: &mut [Vec<f64>],
) {
    for op in ops {
        match op {
            TapeOp::Input { dst, arg, offset } => {
                work[*dst] = inputs[*arg][*offset]
            }
            TapeOp::Output { out, offset, src } => {
                outputs[*out][*offset] = work[*src]
            }
            TapeOp::Const { dst, value } => work[*dst] = *value,
            TapeOp::Param { dst, .. } => work[*dst] = f64::NAN,
            TapeOp::Unary { dst, op, arg } => {
                work[*dst] = op.eval(work[*arg])
            }
            TapeOp::Binary { dst, op, lhs, rhs } => {
                work[*dst] = op.eval(work[*lhs], work[*rhs])
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn build_xy_sin() -> (Context, Function) {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();
        let f =
            Function::new(&ctx, "f", &[vec![x], vec![y]], &[vec![z]])
                .unwrap();
        (ctx, f)
    }

    #[test]
    fn eval_mul_plus_sin() {
        let (_, mut f) = build_xy_sin();
        let out = f.eval(&[&[2.0], &[3.0]]).unwrap();
        assert_relative_eq!(
            out[0][0],
            6.0 + 2.0_f64.sin(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn zero_size_outputs_are_preserved() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let z = ctx.square(x).unwrap();
        let mut f = Function::new(
            &ctx,
            "f",
            &[vec![x]],
            &[vec![], vec![z], vec![]],
        )
        .unwrap();
        let out = f.eval(&[&[3.0]]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_empty());
        assert_eq!(out[1], [9.0]);
        assert!(out[2].is_empty());
    }

    #[test]
    fn jvp_and_vjp_match_hand_derivatives() {
        let (_, mut f) = build_xy_sin();
        // dz/dx = y + cos(x), dz/dy = x
        let dx = f.jvp(&[&[2.0], &[3.0]], &[&[1.0], &[0.0]]).unwrap();
        assert_relative_eq!(
            dx[0][0],
            3.0 + 2.0_f64.cos(),
            epsilon = 1e-12
        );
        let dy = f.jvp(&[&[2.0], &[3.0]], &[&[0.0], &[1.0]]).unwrap();
        assert_relative_eq!(dy[0][0], 2.0, epsilon = 1e-12);

        let grad = f.vjp(&[&[2.0], &[3.0]], &[&[1.0]]).unwrap();
        assert_relative_eq!(
            grad[0][0],
            3.0 + 2.0_f64.cos(),
            epsilon = 1e-12
        );
        assert_relative_eq!(grad[1][0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn live_variables_do_not_change_results() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let mut acc = ctx.constant(0.0);
        for i in 1..8 {
            let p = ctx.pow(x, i as f64).unwrap();
            let t = ctx.div(p, y).unwrap();
            let s = ctx.sin(t).unwrap();
            acc = ctx.add(acc, s).unwrap();
        }
        let inputs = [vec![x], vec![y]];
        let outputs = [vec![acc]];
        let mut live =
            Function::new(&ctx, "f", &inputs, &outputs).unwrap();
        let mut fat = Function::new_with(
            &ctx,
            "f",
            &inputs,
            &outputs,
            &Options {
                live_variables: false,
                ..Options::default()
            },
        )
        .unwrap();
        assert!(live.tape().worksize() < fat.tape().worksize());

        let a = live.eval(&[&[1.3], &[2.7]]).unwrap();
        let b = fat.eval(&[&[1.3], &[2.7]]).unwrap();
        // Same operations in the same order, so bitwise identical
        assert_eq!(a, b);
    }

    #[test]
    fn unary_chain_uses_tiny_work_vector() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let mut n = x;
        for _ in 0..100 {
            n = ctx.sin(n).unwrap();
        }
        let f = Function::new(&ctx, "chain", &[vec![x]], &[vec![n]])
            .unwrap();
        assert!(f.tape().worksize() <= 3);
    }

    #[test]
    fn free_variable_evaluation_fails() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let z = ctx.mul(x, y).unwrap();
        let mut f =
            Function::new(&ctx, "f", &[vec![x]], &[vec![z]]).unwrap();
        let err = f.eval(&[&[1.0]]).unwrap_err();
        match err {
            Error::FreeVariables { vars, .. } => {
                assert_eq!(vars, ["y"])
            }
            e => panic!("wrong error: {e}"),
        }
    }

    #[test]
    fn forward_adjoint_duality() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(xy).unwrap();
        let e = ctx.exp(x).unwrap();
        let q = ctx.div(s, y).unwrap();
        let o1 = ctx.add(q, e).unwrap();
        let o2 = ctx.mul(s, e).unwrap();
        let mut f = Function::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![o1, o2]],
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..16 {
            let xv = rng.gen_range(0.5..2.0);
            let yv = rng.gen_range(0.5..2.0);
            let u = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
            let w = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
            let r = f
                .eval_ad(
                    &[&[xv], &[yv]],
                    &[vec![vec![u[0]], vec![u[1]]]],
                    &[vec![vec![w[0], w[1]]]],
                )
                .unwrap();
            // wᵀ(Ju) == (Jᵀw)ᵀu
            let lhs = w[0] * r.fwd_sens[0][0][0]
                + w[1] * r.fwd_sens[0][0][1];
            let rhs = u[0] * r.adj_sens[0][0][0]
                + u[1] * r.adj_sens[0][1][0];
            assert_relative_eq!(lhs, rhs, epsilon = 1e-10);
        }
    }

    #[test]
    fn sparsity_is_a_superset_of_numeric_dependence() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let z = ctx.var("z");
        let a = ctx.mul(x, y).unwrap();
        let b = ctx.sin(z).unwrap();
        let o1 = ctx.add(a, 1.0).unwrap();
        let o2 = ctx.sub(b, z).unwrap();
        let mut f = Function::new(
            &ctx,
            "f",
            &[vec![x, y, z]],
            &[vec![o1, o2]],
        )
        .unwrap();

        // Seed column i with bit i
        let masks =
            f.sparsity_fwd(&[vec![1 << 0, 1 << 1, 1 << 2]]).unwrap();
        // o1 depends on x and y, o2 on z only
        assert_eq!(masks[0][0], 0b011);
        assert_eq!(masks[0][1], 0b100);

        // Every numerically nonzero partial has its bit set
        let mut rng = StdRng::seed_from_u64(7);
        let pt = [
            rng.gen_range(0.5..1.5),
            rng.gen_range(0.5..1.5),
            rng.gen_range(0.5..1.5),
        ];
        for i in 0..3 {
            let mut seed = [0.0; 3];
            seed[i] = 1.0;
            let d = f.jvp(&[&pt], &[&seed]).unwrap();
            for k in 0..2 {
                if d[0][k] != 0.0 {
                    assert_ne!(masks[0][k] & (1 << i), 0);
                }
            }
        }

        let rev = f.sparsity_rev(&[vec![1 << 0, 1 << 1]]).unwrap();
        assert_eq!(rev[0][0], 0b01); // x feeds o1 only
        assert_eq!(rev[0][1], 0b01);
        assert_eq!(rev[0][2], 0b10);
    }

    #[test]
    fn symbolic_fast_path_returns_stored_outputs() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();
        let f = Function::new(&ctx, "f", &[vec![x], vec![y]], &[vec![z]])
            .unwrap();
        let before = ctx.len();
        let out = f
            .eval_symbolic(&mut ctx, &[vec![x], vec![y]])
            .unwrap();
        assert_eq!(out[0][0], z);
        assert_eq!(ctx.len(), before);
    }

    #[test]
    fn symbolic_substitution() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let sq = ctx.square(x).unwrap();
        let z = ctx.add(sq, 1.0).unwrap();
        let f =
            Function::new(&ctx, "f", &[vec![x]], &[vec![z]]).unwrap();

        let t = ctx.var("t");
        let arg = ctx.sin(t).unwrap();
        let out = f.eval_symbolic(&mut ctx, &[vec![arg]]).unwrap();

        // Deduplication makes the substituted result identical to
        // building sin(t)^2 + 1 by hand
        let sq2 = ctx.square(arg).unwrap();
        let expected = ctx.add(sq2, 1.0).unwrap();
        assert_eq!(out[0][0], expected);
    }

    #[test]
    fn symbolic_evaluation_substitutes_constants() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let z = ctx.mul(x, 3.0).unwrap();
        let f =
            Function::new(&ctx, "f", &[vec![x]], &[vec![z]]).unwrap();
        let two = ctx.constant(2.0);
        let out = f.eval_symbolic(&mut ctx, &[vec![two]]).unwrap();
        assert_eq!(ctx.const_value(out[0][0]).unwrap(), Some(6.0));
    }

    #[test]
    fn smoothness_flag() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let s = ctx.sin(x).unwrap();
        let f =
            Function::new(&ctx, "f", &[vec![x]], &[vec![s]]).unwrap();
        assert!(f.is_smooth());
        let a = ctx.abs(x).unwrap();
        let g =
            Function::new(&ctx, "g", &[vec![x]], &[vec![a]]).unwrap();
        assert!(!g.is_smooth());
    }
}
