//! The closed catalog of matrix operations
//!
//! Each operation knows how to evaluate itself, push forward and pull back
//! derivative seeds, and propagate dependency bitmasks over nonzeros.  All
//! matrices are column-major; structure operations require dense operands.
use super::{Matrix, Sparsity};

/// A matrix-valued operation
#[derive(Clone, Debug, PartialEq)]
pub enum MOp {
    /// A named symbolic leaf
    Sym(String),
    /// A constant matrix
    Const(Matrix),
    Neg,
    /// Elementwise sum of two matrices with identical sparsity
    Add,
    Sub,
    /// Elementwise (Hadamard) product
    Mul,
    /// Multiplication by a scalar constant
    Scale(f64),
    /// Dense matrix product
    MatMul,
    /// Dense transpose
    Transpose,
    /// Vertical concatenation of dense matrices
    VertCat,
    /// Horizontal split of a dense matrix at the given row offsets; the only
    /// multiple-output operation
    VSplit { offsets: Vec<usize> },
    /// Selects one output of a multiple-output node
    GetOutput(usize),
}

impl MOp {
    /// Number of outputs produced by this operation
    pub fn n_outputs(&self) -> usize {
        match self {
            MOp::VSplit { offsets } => offsets.len() - 1,
            _ => 1,
        }
    }

    /// Name used when printing tapes
    pub fn name(&self) -> &'static str {
        match self {
            MOp::Sym(..) => "sym",
            MOp::Const(..) => "const",
            MOp::Neg => "neg",
            MOp::Add => "add",
            MOp::Sub => "sub",
            MOp::Mul => "mul",
            MOp::Scale(..) => "scale",
            MOp::MatMul => "matmul",
            MOp::Transpose => "transpose",
            MOp::VertCat => "vertcat",
            MOp::VSplit { .. } => "vsplit",
            MOp::GetOutput(..) => "output",
        }
    }

    /// Numeric evaluation
    pub(crate) fn eval(&self, args: &[&Matrix]) -> Vec<Matrix> {
        match self {
            MOp::Sym(..) => vec![],
            MOp::Const(m) => vec![m.clone()],
            MOp::Neg => vec![map1(args[0], |v| -v)],
            MOp::Add => vec![zip2(args[0], args[1], |a, b| a + b)],
            MOp::Sub => vec![zip2(args[0], args[1], |a, b| a - b)],
            MOp::Mul => vec![zip2(args[0], args[1], |a, b| a * b)],
            MOp::Scale(f) => vec![map1(args[0], |v| f * v)],
            MOp::MatMul => vec![matmul(args[0], args[1])],
            MOp::Transpose => vec![transpose(args[0])],
            MOp::VertCat => vec![vertcat(args)],
            MOp::VSplit { offsets } => vsplit(args[0], offsets),
            MOp::GetOutput(..) => vec![args[0].clone()],
        }
    }

    /// Forward derivative sweep for one seed direction.
    ///
    /// Every operation here is linear or bilinear, so this mirrors [`eval`]
    /// with the product rule applied to `Mul` and `MatMul`.
    ///
    /// [`eval`]: MOp::eval
    pub(crate) fn eval_fwd(
        &self,
        args: &[&Matrix],
        dargs: &[&Matrix],
    ) -> Vec<Matrix> {
        match self {
            MOp::Sym(..) => vec![],
            MOp::Const(m) => vec![Matrix::zeros(m.sparsity().clone())],
            MOp::Mul => {
                let mut out = zip2(dargs[0], args[1], |a, b| a * b);
                let other = zip2(args[0], dargs[1], |a, b| a * b);
                acc(&mut out, &other, 1.0);
                vec![out]
            }
            MOp::MatMul => {
                let mut out = matmul(dargs[0], args[1]);
                let other = matmul(args[0], dargs[1]);
                acc(&mut out, &other, 1.0);
                vec![out]
            }
            _ => self.eval(dargs),
        }
    }

    /// Adjoint derivative sweep for one seed direction.
    ///
    /// `rbar` holds one seed per output; contributions are accumulated into
    /// `abar`, one zero-initialized matrix per argument.
    pub(crate) fn eval_adj(
        &self,
        args: &[&Matrix],
        rbar: &[&Matrix],
        abar: &mut [Matrix],
    ) {
        match self {
            MOp::Sym(..) | MOp::Const(..) => (),
            MOp::Neg => acc(&mut abar[0], rbar[0], -1.0),
            MOp::Add => {
                acc(&mut abar[0], rbar[0], 1.0);
                acc(&mut abar[1], rbar[0], 1.0);
            }
            MOp::Sub => {
                acc(&mut abar[0], rbar[0], 1.0);
                acc(&mut abar[1], rbar[0], -1.0);
            }
            MOp::Mul => {
                let da = zip2(rbar[0], args[1], |r, b| r * b);
                let db = zip2(rbar[0], args[0], |r, a| r * a);
                acc(&mut abar[0], &da, 1.0);
                acc(&mut abar[1], &db, 1.0);
            }
            MOp::Scale(f) => acc(&mut abar[0], rbar[0], *f),
            MOp::MatMul => {
                // Ā += R·Bᵀ and B̄ += Aᵀ·R
                let (m, n) = shape(args[0]);
                let p = args[1].sparsity().ncols();
                let r = rbar[0].nonzeros();
                let a = args[0].nonzeros();
                let b = args[1].nonzeros();
                let da = abar[0].nonzeros_mut();
                for k in 0..n {
                    for j in 0..p {
                        for i in 0..m {
                            da[i + k * m] +=
                                r[i + j * m] * b[k + j * n];
                        }
                    }
                }
                let db = abar[1].nonzeros_mut();
                for j in 0..p {
                    for k in 0..n {
                        for i in 0..m {
                            db[k + j * n] +=
                                a[i + k * m] * r[i + j * m];
                        }
                    }
                }
            }
            MOp::Transpose => {
                let (m, n) = shape(args[0]);
                let r = rbar[0].nonzeros();
                let da = abar[0].nonzeros_mut();
                for j in 0..n {
                    for i in 0..m {
                        da[i + j * m] += r[j + i * n];
                    }
                }
            }
            MOp::VertCat => {
                let total = rbar[0].sparsity().nrows();
                let ncols = rbar[0].sparsity().ncols();
                let r = rbar[0].nonzeros();
                let mut roff = 0;
                for dst in abar.iter_mut() {
                    let h = dst.sparsity().nrows();
                    let d = dst.nonzeros_mut();
                    for j in 0..ncols {
                        for i in 0..h {
                            d[i + j * h] += r[roff + i + j * total];
                        }
                    }
                    roff += h;
                }
            }
            MOp::VSplit { offsets } => {
                let (m, n) = shape_sp(abar[0].sparsity());
                for (k, r) in rbar.iter().enumerate() {
                    let h = offsets[k + 1] - offsets[k];
                    let rv = r.nonzeros();
                    let da = abar[0].nonzeros_mut();
                    for j in 0..n {
                        for i in 0..h {
                            da[offsets[k] + i + j * m] +=
                                rv[i + j * h];
                        }
                    }
                }
            }
            MOp::GetOutput(..) => acc(&mut abar[0], rbar[0], 1.0),
        }
    }

    /// Forward dependency propagation over nonzero bitmasks
    pub(crate) fn sp_fwd(
        &self,
        args: &[(&Sparsity, &[u64])],
    ) -> Vec<Vec<u64>> {
        match self {
            MOp::Sym(..) => vec![],
            MOp::Const(m) => vec![vec![0; m.sparsity().nnz()]],
            MOp::Neg | MOp::Scale(..) => vec![args[0].1.to_vec()],
            MOp::Add | MOp::Sub | MOp::Mul => vec![args[0]
                .1
                .iter()
                .zip(args[1].1)
                .map(|(a, b)| a | b)
                .collect()],
            MOp::MatMul => {
                let (m, n) = shape_sp(args[0].0);
                let p = args[1].0.ncols();
                let a = args[0].1;
                let b = args[1].1;
                let mut out = vec![0u64; m * p];
                for j in 0..p {
                    for k in 0..n {
                        for i in 0..m {
                            out[i + j * m] |=
                                a[i + k * m] | b[k + j * n];
                        }
                    }
                }
                vec![out]
            }
            MOp::Transpose => {
                let (m, n) = shape_sp(args[0].0);
                let a = args[0].1;
                let mut out = vec![0u64; m * n];
                for j in 0..n {
                    for i in 0..m {
                        out[j + i * n] = a[i + j * m];
                    }
                }
                vec![out]
            }
            MOp::VertCat => {
                let total: usize =
                    args.iter().map(|(sp, _)| sp.nrows()).sum();
                let ncols = args[0].0.ncols();
                let mut out = vec![0u64; total * ncols];
                let mut roff = 0;
                for (sp, mask) in args {
                    let h = sp.nrows();
                    for j in 0..ncols {
                        for i in 0..h {
                            out[roff + i + j * total] =
                                mask[i + j * h];
                        }
                    }
                    roff += h;
                }
                vec![out]
            }
            MOp::VSplit { offsets } => {
                let (m, n) = shape_sp(args[0].0);
                let a = args[0].1;
                offsets
                    .windows(2)
                    .map(|w| {
                        let h = w[1] - w[0];
                        let mut out = vec![0u64; h * n];
                        for j in 0..n {
                            for i in 0..h {
                                out[i + j * h] =
                                    a[w[0] + i + j * m];
                            }
                        }
                        out
                    })
                    .collect()
            }
            MOp::GetOutput(..) => vec![args[0].1.to_vec()],
        }
    }

    /// Reverse dependency propagation: returns per-argument mask deltas.
    ///
    /// Deltas are returned rather than written in place so the caller can
    /// handle instructions whose arguments alias the same work slot.
    pub(crate) fn sp_rev(
        &self,
        args: &[&Sparsity],
        rbar: &[(&Sparsity, &[u64])],
    ) -> Vec<Vec<u64>> {
        match self {
            MOp::Sym(..) | MOp::Const(..) => vec![],
            MOp::Neg | MOp::Scale(..) | MOp::GetOutput(..) => {
                vec![rbar[0].1.to_vec()]
            }
            MOp::Add | MOp::Sub | MOp::Mul => {
                vec![rbar[0].1.to_vec(), rbar[0].1.to_vec()]
            }
            MOp::MatMul => {
                let (m, n) = shape_sp(args[0]);
                let p = args[1].ncols();
                let r = rbar[0].1;
                let mut da = vec![0u64; m * n];
                let mut db = vec![0u64; n * p];
                for j in 0..p {
                    for k in 0..n {
                        for i in 0..m {
                            da[i + k * m] |= r[i + j * m];
                            db[k + j * n] |= r[i + j * m];
                        }
                    }
                }
                vec![da, db]
            }
            MOp::Transpose => {
                let (m, n) = shape_sp(args[0]);
                let r = rbar[0].1;
                let mut da = vec![0u64; m * n];
                for j in 0..n {
                    for i in 0..m {
                        da[i + j * m] = r[j + i * n];
                    }
                }
                vec![da]
            }
            MOp::VertCat => {
                let total = rbar[0].0.nrows();
                let ncols = rbar[0].0.ncols();
                let r = rbar[0].1;
                let mut out = vec![];
                let mut roff = 0;
                for sp in args {
                    let h = sp.nrows();
                    let mut da = vec![0u64; h * ncols];
                    for j in 0..ncols {
                        for i in 0..h {
                            da[i + j * h] = r[roff + i + j * total];
                        }
                    }
                    roff += h;
                    out.push(da);
                }
                out
            }
            MOp::VSplit { offsets } => {
                let (m, n) = shape_sp(args[0]);
                let mut da = vec![0u64; m * n];
                for (k, (sp, r)) in rbar.iter().enumerate() {
                    let h = sp.nrows();
                    for j in 0..n {
                        for i in 0..h {
                            da[offsets[k] + i + j * m] |=
                                r[i + j * h];
                        }
                    }
                }
                vec![da]
            }
        }
    }
}

fn shape(m: &Matrix) -> (usize, usize) {
    (m.sparsity().nrows(), m.sparsity().ncols())
}

fn shape_sp(sp: &Sparsity) -> (usize, usize) {
    (sp.nrows(), sp.ncols())
}

fn map1(a: &Matrix, f: impl Fn(f64) -> f64) -> Matrix {
    let mut out = a.clone();
    for v in out.nonzeros_mut() {
        *v = f(*v);
    }
    out
}

fn zip2(a: &Matrix, b: &Matrix, f: impl Fn(f64, f64) -> f64) -> Matrix {
    let mut out = a.clone();
    for (v, &bv) in out.nonzeros_mut().iter_mut().zip(b.nonzeros()) {
        *v = f(*v, bv);
    }
    out
}

/// `dst += factor * src` over matching sparsity
fn acc(dst: &mut Matrix, src: &Matrix, factor: f64) {
    for (d, &s) in dst.nonzeros_mut().iter_mut().zip(src.nonzeros()) {
        *d += factor * s;
    }
}

fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let (m, n) = shape(a);
    let p = b.sparsity().ncols();
    let mut out = Matrix::zeros(Sparsity::dense(m, p));
    let av = a.nonzeros();
    let bv = b.nonzeros();
    let ov = out.nonzeros_mut();
    for j in 0..p {
        for k in 0..n {
            let bkj = bv[k + j * n];
            for i in 0..m {
                ov[i + j * m] += av[i + k * m] * bkj;
            }
        }
    }
    out
}

fn transpose(a: &Matrix) -> Matrix {
    let (m, n) = shape(a);
    let mut out = Matrix::zeros(Sparsity::dense(n, m));
    let av = a.nonzeros();
    let ov = out.nonzeros_mut();
    for j in 0..n {
        for i in 0..m {
            ov[j + i * n] = av[i + j * m];
        }
    }
    out
}

fn vertcat(args: &[&Matrix]) -> Matrix {
    let total: usize = args.iter().map(|a| a.sparsity().nrows()).sum();
    let ncols = args[0].sparsity().ncols();
    let mut out = Matrix::zeros(Sparsity::dense(total, ncols));
    let ov = out.nonzeros_mut();
    let mut roff = 0;
    for a in args {
        let h = a.sparsity().nrows();
        let av = a.nonzeros();
        for j in 0..ncols {
            for i in 0..h {
                ov[roff + i + j * total] = av[i + j * h];
            }
        }
        roff += h;
    }
    out
}

fn vsplit(a: &Matrix, offsets: &[usize]) -> Vec<Matrix> {
    let (m, n) = shape(a);
    let av = a.nonzeros();
    offsets
        .windows(2)
        .map(|w| {
            let h = w[1] - w[0];
            let mut out = Matrix::zeros(Sparsity::dense(h, n));
            let ov = out.nonzeros_mut();
            for j in 0..n {
                for i in 0..h {
                    ov[i + j * h] = av[w[0] + i + j * m];
                }
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn m22(vals: [f64; 4]) -> Matrix {
        Matrix::from_dense(2, 2, vals.to_vec()).unwrap()
    }

    #[test]
    fn matmul_column_major() {
        // A = [1 3; 2 4], B = [5 7; 6 8]
        let a = m22([1.0, 2.0, 3.0, 4.0]);
        let b = m22([5.0, 6.0, 7.0, 8.0]);
        let c = MOp::MatMul.eval(&[&a, &b]).remove(0);
        // C = [23 31; 34 46]
        assert_eq!(c.nonzeros(), &[23.0, 34.0, 31.0, 46.0]);
    }

    #[test]
    fn transpose_and_split_round() {
        let a = Matrix::from_dense(3, 2, (1..=6).map(f64::from).collect())
            .unwrap();
        let t = MOp::Transpose.eval(&[&a]).remove(0);
        assert_eq!(t.sparsity().nrows(), 2);
        assert_eq!(t.nonzeros(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let parts = MOp::VSplit {
            offsets: vec![0, 1, 3],
        }
        .eval(&[&a]);
        assert_eq!(parts[0].nonzeros(), &[1.0, 4.0]);
        assert_eq!(parts[1].nonzeros(), &[2.0, 3.0, 5.0, 6.0]);
        let back = MOp::VertCat.eval(&[&parts[0], &parts[1]]).remove(0);
        assert_eq!(back.nonzeros(), a.nonzeros());
    }

    #[test]
    fn matmul_adjoint_matches_finite_difference() {
        let a = m22([1.0, 2.0, 3.0, 4.0]);
        let b = m22([5.0, 6.0, 7.0, 8.0]);
        let rbar = m22([0.1, 0.2, 0.3, 0.4]);
        let mut abar = [
            Matrix::zeros(a.sparsity().clone()),
            Matrix::zeros(b.sparsity().clone()),
        ];
        MOp::MatMul.eval_adj(&[&a, &b], &[&rbar], &mut abar);

        let h = 1e-6;
        let base = MOp::MatMul.eval(&[&a, &b]).remove(0);
        for k in 0..4 {
            let mut ap = a.clone();
            ap.nonzeros_mut()[k] += h;
            let pert = MOp::MatMul.eval(&[&ap, &b]).remove(0);
            let mut fd = 0.0;
            for i in 0..4 {
                fd += rbar.nonzeros()[i]
                    * (pert.nonzeros()[i] - base.nonzeros()[i])
                    / h;
            }
            assert_relative_eq!(
                abar[0].nonzeros()[k],
                fd,
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn hadamard_forward_product_rule() {
        let a = m22([1.0, 2.0, 3.0, 4.0]);
        let b = m22([5.0, 6.0, 7.0, 8.0]);
        let da = m22([1.0, 0.0, 0.0, 0.0]);
        let db = m22([0.0, 0.0, 0.0, 1.0]);
        let d = MOp::Mul.eval_fwd(&[&a, &b], &[&da, &db]).remove(0);
        assert_eq!(d.nonzeros(), &[5.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn matmul_dependency_masks() {
        let sa = Sparsity::dense(2, 2);
        let a = vec![1u64, 0, 0, 0]; // only A[0,0] seeded
        let b = vec![0u64; 4];
        let out =
            MOp::MatMul.sp_fwd(&[(&sa, &a), (&sa, &b)]).remove(0);
        // A[0,0] feeds row 0 of the product, both columns
        assert_eq!(out, vec![1, 0, 1, 0]);
    }
}
