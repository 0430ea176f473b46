//! Evaluation of matrix tapes
use super::{Graph, MId, MOp, MTape, MTapeOp, Matrix, Sparsity};
use crate::{eval::Options, Error};

/// Derivative sweep results from [`MFunction::eval_ad`]
#[derive(Clone, Debug)]
pub struct MAdResult {
    /// Function outputs, one matrix per declared output
    pub outputs: Vec<Matrix>,
    /// Forward sensitivities, indexed as `[direction][output]`
    pub fwd_sens: Vec<Vec<Matrix>>,
    /// Adjoint sensitivities, indexed as `[direction][input]`
    pub adj_sens: Vec<Vec<Matrix>>,
}

/// A compiled matrix function: an [`MTape`] plus its work vector
///
/// Work slots are whole matrices with fixed sparsity, allocated once at
/// construction and reused across calls.
pub struct MFunction {
    tape: MTape,
    work: Vec<Matrix>,
}

impl MFunction {
    /// Compiles a matrix function with default [`Options`]
    pub fn new(
        graph: &Graph,
        name: &str,
        inputs: &[MId],
        outputs: &[MId],
    ) -> Result<Self, Error> {
        Self::new_with(graph, name, inputs, outputs, &Options::default())
    }

    /// Compiles a matrix function with the given [`Options`]
    pub fn new_with(
        graph: &Graph,
        name: &str,
        inputs: &[MId],
        outputs: &[MId],
        options: &Options,
    ) -> Result<Self, Error> {
        let tape = MTape::new(graph, name, inputs, outputs, options)?;
        let work = tape
            .work_sparsity()
            .iter()
            .map(|sp| Matrix::zeros(sp.clone()))
            .collect();
        Ok(Self { tape, work })
    }

    /// The compiled tape
    pub fn tape(&self) -> &MTape {
        &self.tape
    }

    pub fn name(&self) -> &str {
        self.tape.name()
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

    fn check_inputs(&self, inputs: &[&Matrix]) -> Result<(), Error> {
        let sps = self.tape.input_sparsity();
        if inputs.len() != sps.len() {
            return Err(Error::BadSlice(inputs.len(), sps.len()));
        }
        for (given, expected) in inputs.iter().zip(sps) {
            if given.sparsity() != expected {
                return Err(Error::SparsityMismatch);
            }
        }
        Ok(())
    }

    fn check_dirs(
        seeds: &[Vec<Matrix>],
        sps: &[Sparsity],
    ) -> Result<(), Error> {
        for dir in seeds {
            if dir.len() != sps.len() {
                return Err(Error::BadSeed(dir.len(), sps.len()));
            }
            for (given, expected) in dir.iter().zip(sps) {
                if given.sparsity() != expected {
                    return Err(Error::SparsityMismatch);
                }
            }
        }
        Ok(())
    }

    /// Evaluates the function numerically.
    ///
    /// Inputs must match the declared sparsity patterns exactly.
    pub fn eval(
        &mut self,
        inputs: &[&Matrix],
    ) -> Result<Vec<Matrix>, Error> {
        self.check_free()?;
        self.check_inputs(inputs)?;
        let mut outputs =
            vec![Matrix::default(); self.tape.output_sparsity().len()];
        for op in self.tape.ops() {
            match op {
                MTapeOp::Input { dst, arg } => {
                    self.work[*dst] = inputs[*arg].clone()
                }
                MTapeOp::Param { .. } => (),
                MTapeOp::Output { out, src } => {
                    outputs[*out] = self.work[*src].clone()
                }
                MTapeOp::Op { op, args, res } => {
                    let argv: Vec<&Matrix> =
                        args.iter().map(|&a| &self.work[a]).collect();
                    let outs = op.eval(&argv);
                    for (slot, value) in res.iter().zip(outs) {
                        if let Some(slot) = slot {
                            self.work[*slot] = value;
                        }
                    }
                }
            }
        }
        Ok(outputs)
    }

    /// Evaluates the function along with forward and adjoint derivative
    /// sweeps.
    ///
    /// Work slots are reused, so values that the reverse sweep still needs
    /// are saved before each overwrite on the way forward and restored on
    /// the way back.
    pub fn eval_ad(
        &mut self,
        inputs: &[&Matrix],
        fwd_seeds: &[Vec<Matrix>],
        adj_seeds: &[Vec<Matrix>],
    ) -> Result<MAdResult, Error> {
        self.check_free()?;
        self.check_inputs(inputs)?;
        Self::check_dirs(fwd_seeds, self.tape.input_sparsity())?;
        Self::check_dirs(adj_seeds, self.tape.output_sparsity())?;

        let n_fwd = fwd_seeds.len();
        let zero_work = |sps: &[Sparsity]| -> Vec<Matrix> {
            sps.iter().map(|sp| Matrix::zeros(sp.clone())).collect()
        };
        let mut dwork: Vec<Vec<Matrix>> = (0..n_fwd)
            .map(|_| zero_work(self.tape.work_sparsity()))
            .collect();
        let mut outputs =
            vec![Matrix::default(); self.tape.output_sparsity().len()];
        let mut fwd_sens: Vec<Vec<Matrix>> = (0..n_fwd)
            .map(|_| {
                vec![
                    Matrix::default();
                    self.tape.output_sparsity().len()
                ]
            })
            .collect();

        // Forward: values plus all forward directions in one pass, saving
        // each value that is about to be overwritten
        let spills = self.tape.spills().to_vec();
        let mut spill_buf: Vec<Matrix> = vec![];
        let mut spill_idx = 0;
        for (t, op) in self.tape.ops().iter().enumerate() {
            while spill_idx < spills.len() && spills[spill_idx].0 == t {
                spill_buf.push(self.work[spills[spill_idx].1].clone());
                spill_idx += 1;
            }
            match op {
                MTapeOp::Input { dst, arg } => {
                    self.work[*dst] = inputs[*arg].clone();
                    for (dir, seed) in fwd_seeds.iter().enumerate() {
                        dwork[dir][*dst] = seed[*arg].clone();
                    }
                }
                MTapeOp::Param { .. } => (),
                MTapeOp::Output { out, src } => {
                    outputs[*out] = self.work[*src].clone();
                    for (dir, sens) in fwd_sens.iter_mut().enumerate() {
                        sens[*out] = dwork[dir][*src].clone();
                    }
                }
                MTapeOp::Op { op, args, res } => {
                    for dw in dwork.iter_mut() {
                        let argv: Vec<&Matrix> = args
                            .iter()
                            .map(|&a| &self.work[a])
                            .collect();
                        let dargv: Vec<&Matrix> =
                            args.iter().map(|&a| &dw[a]).collect();
                        let douts = op.eval_fwd(&argv, &dargv);
                        for (slot, value) in res.iter().zip(douts) {
                            if let Some(slot) = slot {
                                dw[*slot] = value;
                            }
                        }
                    }
                    let argv: Vec<&Matrix> =
                        args.iter().map(|&a| &self.work[a]).collect();
                    let outs = op.eval(&argv);
                    for (slot, value) in res.iter().zip(outs) {
                        if let Some(slot) = slot {
                            self.work[*slot] = value;
                        }
                    }
                }
            }
        }

        // Adjoint: one reverse pass per direction would have to replay the
        // spills, so all directions share a single reverse pass
        let mut adj_sens: Vec<Vec<Matrix>> = (0..adj_seeds.len())
            .map(|_| zero_work(self.tape.input_sparsity()))
            .collect();
        let mut bwork: Vec<Vec<Matrix>> = (0..adj_seeds.len())
            .map(|_| zero_work(self.tape.work_sparsity()))
            .collect();
        let mut spill_rev = spills.len();
        for (t, op) in self.tape.ops().iter().enumerate().rev() {
            match op {
                MTapeOp::Output { out, src } => {
                    for (dir, seed) in adj_seeds.iter().enumerate() {
                        acc(&mut bwork[dir][*src], &seed[*out]);
                    }
                }
                MTapeOp::Input { dst, arg } => {
                    for (dir, sens) in adj_sens.iter_mut().enumerate() {
                        let b = std::mem::replace(
                            &mut bwork[dir][*dst],
                            Matrix::zeros(
                                self.tape.work_sparsity()[*dst]
                                    .clone(),
                            ),
                        );
                        acc(&mut sens[*arg], &b);
                    }
                }
                MTapeOp::Param { dst, .. } => {
                    for bw in bwork.iter_mut() {
                        bw[*dst] = Matrix::zeros(
                            self.tape.work_sparsity()[*dst].clone(),
                        );
                    }
                }
                MTapeOp::Op { op, args, res } => {
                    for bw in bwork.iter_mut() {
                        // Consume and zero the result adjoints before
                        // touching the arguments; result slots may be
                        // reused by unrelated earlier values
                        let rbar: Vec<Matrix> = res
                            .iter()
                            .enumerate()
                            .map(|(i, slot)| match slot {
                                Some(slot) => std::mem::replace(
                                    &mut bw[*slot],
                                    Matrix::zeros(
                                        self.tape.work_sparsity()
                                            [*slot]
                                            .clone(),
                                    ),
                                ),
                                None => Matrix::zeros(
                                    unused_output_sparsity(
                                        op,
                                        &self.tape.work_sparsity()
                                            [args[0]],
                                        i,
                                    ),
                                ),
                            })
                            .collect();
                        let rbar_refs: Vec<&Matrix> =
                            rbar.iter().collect();
                        let argv: Vec<&Matrix> = args
                            .iter()
                            .map(|&a| &self.work[a])
                            .collect();
                        let mut abar: Vec<Matrix> = args
                            .iter()
                            .map(|&a| {
                                Matrix::zeros(
                                    self.tape.work_sparsity()[a]
                                        .clone(),
                                )
                            })
                            .collect();
                        op.eval_adj(&argv, &rbar_refs, &mut abar);
                        for (&slot, delta) in args.iter().zip(&abar) {
                            acc(&mut bw[slot], delta);
                        }
                    }
                }
            }
            // Roll the work vector back to its state before instruction `t`
            while spill_rev > 0 && spills[spill_rev - 1].0 == t {
                spill_rev -= 1;
                if let Some(saved) = spill_buf.pop() {
                    self.work[spills[spill_rev].1] = saved;
                }
            }
        }

        Ok(MAdResult {
            outputs,
            fwd_sens,
            adj_sens,
        })
    }

    /// Propagates dependency bitmasks forward over matrix nonzeros
    pub fn sparsity_fwd(
        &self,
        seeds: &[Vec<u64>],
    ) -> Result<Vec<Vec<u64>>, Error> {
        let sps = self.tape.input_sparsity();
        if seeds.len() != sps.len() {
            return Err(Error::BadSeed(seeds.len(), sps.len()));
        }
        for (given, sp) in seeds.iter().zip(sps) {
            if given.len() != sp.nnz() {
                return Err(Error::BadSeed(given.len(), sp.nnz()));
            }
        }
        let mut swork: Vec<Vec<u64>> = self
            .tape
            .work_sparsity()
            .iter()
            .map(|sp| vec![0; sp.nnz()])
            .collect();
        let mut out: Vec<Vec<u64>> = self
            .tape
            .output_sparsity()
            .iter()
            .map(|sp| vec![0; sp.nnz()])
            .collect();
        for op in self.tape.ops() {
            match op {
                MTapeOp::Input { dst, arg } => {
                    swork[*dst] = seeds[*arg].clone()
                }
                MTapeOp::Param { dst, .. } => {
                    swork[*dst].iter_mut().for_each(|m| *m = 0)
                }
                MTapeOp::Output { out: o, src } => {
                    out[*o] = swork[*src].clone()
                }
                MTapeOp::Op { op, args, res } => {
                    let argv: Vec<(&Sparsity, &[u64])> = args
                        .iter()
                        .map(|&a| {
                            (
                                &self.tape.work_sparsity()[a],
                                swork[a].as_slice(),
                            )
                        })
                        .collect();
                    let outs = op.sp_fwd(&argv);
                    for (slot, mask) in res.iter().zip(outs) {
                        if let Some(slot) = slot {
                            swork[*slot] = mask;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Propagates dependency bitmasks backward over matrix nonzeros
    pub fn sparsity_rev(
        &self,
        seeds: &[Vec<u64>],
    ) -> Result<Vec<Vec<u64>>, Error> {
        let sps = self.tape.output_sparsity();
        if seeds.len() != sps.len() {
            return Err(Error::BadSeed(seeds.len(), sps.len()));
        }
        for (given, sp) in seeds.iter().zip(sps) {
            if given.len() != sp.nnz() {
                return Err(Error::BadSeed(given.len(), sp.nnz()));
            }
        }
        let mut swork: Vec<Vec<u64>> = self
            .tape
            .work_sparsity()
            .iter()
            .map(|sp| vec![0; sp.nnz()])
            .collect();
        let mut out: Vec<Vec<u64>> = self
            .tape
            .input_sparsity()
            .iter()
            .map(|sp| vec![0; sp.nnz()])
            .collect();
        for op in self.tape.ops().iter().rev() {
            match op {
                MTapeOp::Output { out: o, src } => {
                    for (m, s) in
                        swork[*src].iter_mut().zip(&seeds[*o])
                    {
                        *m |= s;
                    }
                }
                MTapeOp::Input { dst, arg } => {
                    for (o, m) in
                        out[*arg].iter_mut().zip(&swork[*dst])
                    {
                        *o |= m;
                    }
                    swork[*dst].iter_mut().for_each(|m| *m = 0);
                }
                MTapeOp::Param { dst, .. } => {
                    swork[*dst].iter_mut().for_each(|m| *m = 0)
                }
                MTapeOp::Op { op, args, res } => {
                    // Deltas are computed from a snapshot so that
                    // arguments sharing a slot accumulate correctly
                    let rbar: Vec<(Sparsity, Vec<u64>)> = res
                        .iter()
                        .enumerate()
                        .map(|(i, slot)| match slot {
                            Some(slot) => {
                                let sp = self.tape.work_sparsity()
                                    [*slot]
                                    .clone();
                                let mask = std::mem::take(
                                    &mut swork[*slot],
                                );
                                swork[*slot] =
                                    vec![0; sp.nnz()];
                                (sp, mask)
                            }
                            None => {
                                let sp = unused_output_sparsity(
                                    op,
                                    &self.tape.work_sparsity()
                                        [args[0]],
                                    i,
                                );
                                let n = sp.nnz();
                                (sp, vec![0; n])
                            }
                        })
                        .collect();
                    let rbar_refs: Vec<(&Sparsity, &[u64])> = rbar
                        .iter()
                        .map(|(sp, m)| (sp, m.as_slice()))
                        .collect();
                    let arg_sp: Vec<&Sparsity> = args
                        .iter()
                        .map(|&a| &self.tape.work_sparsity()[a])
                        .collect();
                    let deltas = op.sp_rev(&arg_sp, &rbar_refs);
                    for (&slot, delta) in args.iter().zip(&deltas) {
                        for (m, d) in
                            swork[slot].iter_mut().zip(delta)
                        {
                            *m |= d;
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// `dst += src` over matching sparsity
fn acc(dst: &mut Matrix, src: &Matrix) {
    for (d, &s) in dst.nonzeros_mut().iter_mut().zip(src.nonzeros()) {
        *d += s;
    }
}

/// Sparsity of an operation output that was never assigned a slot.
///
/// Only multiple-output operations can have unused outputs.
fn unused_output_sparsity(
    op: &MOp,
    arg0: &Sparsity,
    i: usize,
) -> Sparsity {
    match op {
        MOp::VSplit { offsets } => Sparsity::dense(
            offsets[i + 1] - offsets[i],
            arg0.ncols(),
        ),
        _ => arg0.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn m22(vals: [f64; 4]) -> Matrix {
        Matrix::from_dense(2, 2, vals.to_vec()).unwrap()
    }

    fn dot(a: &Matrix, b: &Matrix) -> f64 {
        a.nonzeros()
            .iter()
            .zip(b.nonzeros())
            .map(|(x, y)| x * y)
            .sum()
    }

    #[test]
    fn matmul_chain_evaluation() {
        let mut g = Graph::new();
        let a = g.sym("A", Sparsity::dense(2, 2));
        let b = g.sym("B", Sparsity::dense(2, 2));
        let ab = g.matmul(a, b).unwrap();
        let abt = g.transpose(ab).unwrap();
        let mut f = MFunction::new(&g, "f", &[a, b], &[abt]).unwrap();

        let av = m22([1.0, 2.0, 3.0, 4.0]);
        let bv = m22([5.0, 6.0, 7.0, 8.0]);
        let out = f.eval(&[&av, &bv]).unwrap();
        // (A·B)ᵀ with A·B = [23 31; 34 46]
        assert_eq!(out[0].nonzeros(), &[23.0, 31.0, 34.0, 46.0]);
    }

    #[test]
    fn sparsity_pattern_must_match_exactly() {
        let mut g = Graph::new();
        let a = g.sym("A", Sparsity::dense(2, 2));
        let n = g.neg(a).unwrap();
        let mut f = MFunction::new(&g, "f", &[a], &[n]).unwrap();
        let wrong = Matrix::from_dense(2, 3, vec![0.0; 6]).unwrap();
        assert!(matches!(
            f.eval(&[&wrong]),
            Err(Error::SparsityMismatch)
        ));
    }

    #[test]
    fn split_and_concat_round_trip() {
        let mut g = Graph::new();
        let a = g.sym("a", Sparsity::dense(4, 1));
        let parts = g.vsplit(a, &[0, 2, 4]).unwrap();
        let swapped = g.vertcat(&[parts[1], parts[0]]).unwrap();
        let mut f = MFunction::new(&g, "swap", &[a], &[swapped]).unwrap();
        let v =
            Matrix::from_dense(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = f.eval(&[&v]).unwrap();
        assert_eq!(out[0].nonzeros(), &[3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn free_matrix_variable_fails() {
        let mut g = Graph::new();
        let a = g.sym("a", Sparsity::dense(2, 2));
        let b = g.sym("b", Sparsity::dense(2, 2));
        let s = g.add(a, b).unwrap();
        let mut f = MFunction::new(&g, "f", &[a], &[s]).unwrap();
        let v = m22([0.0; 4]);
        assert!(matches!(
            f.eval(&[&v]),
            Err(Error::FreeVariables { .. })
        ));
    }

    #[test]
    fn chain_adjoint_duality_with_slot_reuse() {
        // Long power chain forces slot reuse and therefore spilling
        let mut g = Graph::new();
        let a = g.sym("A", Sparsity::dense(2, 2));
        let mut n = a;
        for _ in 0..6 {
            n = g.matmul(n, a).unwrap();
        }
        let mut f = MFunction::new(&g, "pow", &[a], &[n]).unwrap();
        assert!(!f.tape().spills().is_empty());

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            let av = m22([
                rng.gen_range(-0.9..0.9),
                rng.gen_range(-0.9..0.9),
                rng.gen_range(-0.9..0.9),
                rng.gen_range(-0.9..0.9),
            ]);
            let u = m22([
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ]);
            let w = m22([
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ]);
            let r = f
                .eval_ad(
                    &[&av],
                    &[vec![u.clone()]],
                    &[vec![w.clone()]],
                )
                .unwrap();
            let lhs = dot(&w, &r.fwd_sens[0][0]);
            let rhs = dot(&u, &r.adj_sens[0][0]);
            assert_relative_eq!(lhs, rhs, epsilon = 1e-9);
        }
    }

    #[test]
    fn adjoint_matches_finite_difference() {
        let mut g = Graph::new();
        let a = g.sym("A", Sparsity::dense(2, 2));
        let b = g.constant(m22([0.5, -0.25, 1.0, 0.75]));
        let ab = g.matmul(a, b).unwrap();
        let h = g.mul(ab, ab).unwrap();
        let mut f = MFunction::new(&g, "f", &[a], &[h]).unwrap();

        let av = m22([1.0, 2.0, -1.0, 0.5]);
        let w = m22([1.0, 1.0, 1.0, 1.0]);
        let r = f.eval_ad(&[&av], &[], &[vec![w.clone()]]).unwrap();

        let eps = 1e-6;
        let base = f.eval(&[&av]).unwrap().remove(0);
        for k in 0..4 {
            let mut ap = av.clone();
            ap.nonzeros_mut()[k] += eps;
            let pert = f.eval(&[&ap]).unwrap().remove(0);
            let fd = pert
                .nonzeros()
                .iter()
                .zip(base.nonzeros())
                .map(|(p, b)| (p - b) / eps)
                .sum::<f64>();
            assert_relative_eq!(
                r.adj_sens[0][0].nonzeros()[k],
                fd,
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn forward_seed_flows_through_split() {
        let mut g = Graph::new();
        let a = g.sym("a", Sparsity::dense(4, 1));
        let parts = g.vsplit(a, &[0, 2, 4]).unwrap();
        let s = g.sub(parts[0], parts[1]).unwrap();
        let mut f = MFunction::new(&g, "f", &[a], &[s]).unwrap();

        let v =
            Matrix::from_dense(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let da =
            Matrix::from_dense(4, 1, vec![1.0, 0.0, 0.0, 2.0]).unwrap();
        let r = f.eval_ad(&[&v], &[vec![da]], &[]).unwrap();
        assert_eq!(r.outputs[0].nonzeros(), &[-2.0, -2.0]);
        assert_eq!(r.fwd_sens[0][0].nonzeros(), &[1.0, -2.0]);
    }

    #[test]
    fn dependency_masks_through_matmul() {
        let mut g = Graph::new();
        let a = g.sym("A", Sparsity::dense(2, 2));
        let b = g.sym("B", Sparsity::dense(2, 2));
        let ab = g.matmul(a, b).unwrap();
        let f = MFunction::new(&g, "f", &[a, b], &[ab]).unwrap();

        // Seed only A[0,0]
        let out = f
            .sparsity_fwd(&[vec![1, 0, 0, 0], vec![0; 4]])
            .unwrap();
        assert_eq!(out[0], vec![1, 0, 1, 0]);

        // Which inputs feed C[0,0]?
        let rev = f.sparsity_rev(&[vec![1, 0, 0, 0]]).unwrap();
        // Row 0 of A and column 0 of B
        assert_eq!(rev[0], vec![1, 0, 1, 0]);
        assert_eq!(rev[1], vec![1, 1, 0, 0]);
    }
}
