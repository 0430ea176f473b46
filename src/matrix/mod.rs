//! Matrix-valued expression graphs
//!
//! Where the scalar layer flattens every element into its own instruction,
//! this layer keeps whole sparse matrices as graph values, so a handful of
//! instructions can move a lot of data.  Structure is carried by shared
//! [`Sparsity`] patterns in compressed-column form.
mod eval;
mod op;
mod tape;

pub use eval::{MAdResult, MFunction};
pub use op::MOp;
pub use tape::{MTape, MTapeOp};

use crate::context::indexed::define_index;
use crate::Error;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

define_index!(MId, "An index of a node in a matrix [`Graph`]");

#[derive(Debug, Eq, PartialEq, Hash)]
struct SparsityData {
    nrows: usize,
    ncols: usize,
    /// `colind[j]..colind[j + 1]` indexes the nonzeros of column `j`
    colind: Vec<usize>,
    /// Row of each nonzero, in column-major order
    row: Vec<usize>,
}

/// A compressed-column sparsity pattern, shared by reference.
///
/// Patterns are immutable and reference-counted; equality takes a pointer
/// fast path before falling back to a structural comparison, so matrices
/// built from the same pattern compare cheaply.
#[derive(Clone, Debug)]
pub struct Sparsity(Arc<SparsityData>);

impl PartialEq for Sparsity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}
impl Eq for Sparsity {}
impl Hash for Sparsity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Sparsity {
    /// Builds a fully dense pattern
    pub fn dense(nrows: usize, ncols: usize) -> Self {
        let colind = (0..=ncols).map(|j| j * nrows).collect();
        let row = (0..ncols).flat_map(|_| 0..nrows).collect();
        Self(Arc::new(SparsityData {
            nrows,
            ncols,
            colind,
            row,
        }))
    }

    /// Builds a pattern from compressed-column data.
    ///
    /// `colind` must have `ncols + 1` monotone entries and `row` must hold
    /// in-range rows, strictly increasing within each column.
    pub fn new(
        nrows: usize,
        ncols: usize,
        colind: Vec<usize>,
        row: Vec<usize>,
    ) -> Result<Self, Error> {
        if colind.len() != ncols + 1
            || colind.first() != Some(&0)
            || colind.last() != Some(&row.len())
        {
            return Err(Error::SparsityMismatch);
        }
        for j in 0..ncols {
            if colind[j] > colind[j + 1] {
                return Err(Error::SparsityMismatch);
            }
            let col = &row[colind[j]..colind[j + 1]];
            for (k, &r) in col.iter().enumerate() {
                if r >= nrows || (k > 0 && col[k - 1] >= r) {
                    return Err(Error::SparsityMismatch);
                }
            }
        }
        Ok(Self(Arc::new(SparsityData {
            nrows,
            ncols,
            colind,
            row,
        })))
    }

    pub fn nrows(&self) -> usize {
        self.0.nrows
    }
    pub fn ncols(&self) -> usize {
        self.0.ncols
    }
    /// Number of structural nonzeros
    pub fn nnz(&self) -> usize {
        self.0.row.len()
    }
    pub fn colind(&self) -> &[usize] {
        &self.0.colind
    }
    pub fn row(&self) -> &[usize] {
        &self.0.row
    }
    pub fn is_dense(&self) -> bool {
        self.nnz() == self.0.nrows * self.0.ncols
    }
}

/// A sparse matrix: a [`Sparsity`] pattern plus one value per nonzero,
/// stored in column-major order of the pattern
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    sparsity: Sparsity,
    nonzeros: Vec<f64>,
}

impl Matrix {
    /// Builds a matrix from a pattern and its nonzero values
    pub fn new(sparsity: Sparsity, nonzeros: Vec<f64>) -> Result<Self, Error> {
        if nonzeros.len() != sparsity.nnz() {
            return Err(Error::BadSlice(nonzeros.len(), sparsity.nnz()));
        }
        Ok(Self { sparsity, nonzeros })
    }

    /// Builds an all-zero matrix with the given pattern
    pub fn zeros(sparsity: Sparsity) -> Self {
        let n = sparsity.nnz();
        Self {
            sparsity,
            nonzeros: vec![0.0; n],
        }
    }

    /// Builds a dense matrix from column-major values
    pub fn from_dense(
        nrows: usize,
        ncols: usize,
        values: Vec<f64>,
    ) -> Result<Self, Error> {
        Self::new(Sparsity::dense(nrows, ncols), values)
    }

    /// Builds a 1x1 matrix
    pub fn scalar(v: f64) -> Self {
        Self {
            sparsity: Sparsity::dense(1, 1),
            nonzeros: vec![v],
        }
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }
    pub fn nonzeros(&self) -> &[f64] {
        &self.nonzeros
    }
    pub fn nonzeros_mut(&mut self) -> &mut [f64] {
        &mut self.nonzeros
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::zeros(Sparsity::dense(0, 0))
    }
}

/// One node of a matrix graph: an operation, its dependencies, and the
/// sparsity of each of its outputs
#[derive(Debug)]
pub(crate) struct MNode {
    pub op: MOp,
    pub deps: Vec<MId>,
    pub sparsity: Vec<Sparsity>,
}

/// An arena of matrix-valued expression nodes.
///
/// Unlike the scalar [`Context`](crate::Context), nodes are not deduplicated:
/// matrix operations are few and coarse, so sharing is expressed explicitly
/// by reusing handles.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<MNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: MNode) -> MId {
        use crate::context::indexed::Index;
        let id = MId::new(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub(crate) fn node(&self, id: MId) -> Result<&MNode, Error> {
        use crate::context::indexed::Index;
        self.nodes.get(id.get()).ok_or(Error::BadNode)
    }

    /// Sparsity of the (first) output of a node
    pub fn sparsity(&self, id: MId) -> Result<&Sparsity, Error> {
        Ok(&self.node(id)?.sparsity[0])
    }

    /// A named symbolic matrix leaf
    pub fn sym(&mut self, name: &str, sparsity: Sparsity) -> MId {
        self.push(MNode {
            op: MOp::Sym(name.to_owned()),
            deps: vec![],
            sparsity: vec![sparsity],
        })
    }

    /// A constant matrix
    pub fn constant(&mut self, m: Matrix) -> MId {
        let sp = m.sparsity().clone();
        self.push(MNode {
            op: MOp::Const(m),
            deps: vec![],
            sparsity: vec![sp],
        })
    }

    fn elementwise(
        &mut self,
        op: MOp,
        a: MId,
        b: MId,
    ) -> Result<MId, Error> {
        let sa = self.sparsity(a)?.clone();
        let sb = self.sparsity(b)?;
        if sa != *sb {
            return Err(Error::SparsityMismatch);
        }
        Ok(self.push(MNode {
            op,
            deps: vec![a, b],
            sparsity: vec![sa],
        }))
    }

    /// Elementwise sum; both operands must share a sparsity pattern
    pub fn add(&mut self, a: MId, b: MId) -> Result<MId, Error> {
        self.elementwise(MOp::Add, a, b)
    }

    /// Elementwise difference
    pub fn sub(&mut self, a: MId, b: MId) -> Result<MId, Error> {
        self.elementwise(MOp::Sub, a, b)
    }

    /// Elementwise (Hadamard) product
    pub fn mul(&mut self, a: MId, b: MId) -> Result<MId, Error> {
        self.elementwise(MOp::Mul, a, b)
    }

    /// Elementwise negation
    pub fn neg(&mut self, a: MId) -> Result<MId, Error> {
        let sa = self.sparsity(a)?.clone();
        Ok(self.push(MNode {
            op: MOp::Neg,
            deps: vec![a],
            sparsity: vec![sa],
        }))
    }

    /// Multiplication by a scalar constant
    pub fn scale(&mut self, a: MId, factor: f64) -> Result<MId, Error> {
        let sa = self.sparsity(a)?.clone();
        Ok(self.push(MNode {
            op: MOp::Scale(factor),
            deps: vec![a],
            sparsity: vec![sa],
        }))
    }

    /// Dense matrix product
    pub fn matmul(&mut self, a: MId, b: MId) -> Result<MId, Error> {
        let sa = self.sparsity(a)?.clone();
        let sb = self.sparsity(b)?.clone();
        if !sa.is_dense() || !sb.is_dense() {
            return Err(Error::NotDense("matmul"));
        }
        if sa.ncols() != sb.nrows() {
            return Err(Error::DimensionMismatch(
                sa.nrows(),
                sa.ncols(),
                sb.nrows(),
                sb.ncols(),
            ));
        }
        let sp = Sparsity::dense(sa.nrows(), sb.ncols());
        Ok(self.push(MNode {
            op: MOp::MatMul,
            deps: vec![a, b],
            sparsity: vec![sp],
        }))
    }

    /// Dense transpose
    pub fn transpose(&mut self, a: MId) -> Result<MId, Error> {
        let sa = self.sparsity(a)?.clone();
        if !sa.is_dense() {
            return Err(Error::NotDense("transpose"));
        }
        let sp = Sparsity::dense(sa.ncols(), sa.nrows());
        Ok(self.push(MNode {
            op: MOp::Transpose,
            deps: vec![a],
            sparsity: vec![sp],
        }))
    }

    /// Stacks dense matrices with equal column counts on top of each other
    pub fn vertcat(&mut self, parts: &[MId]) -> Result<MId, Error> {
        let first = self.sparsity(*parts.first().ok_or(Error::BadNode)?)?;
        let ncols = first.ncols();
        let mut nrows = 0;
        for &p in parts {
            let sp = self.sparsity(p)?;
            if !sp.is_dense() {
                return Err(Error::NotDense("vertcat"));
            }
            if sp.ncols() != ncols {
                return Err(Error::DimensionMismatch(
                    sp.nrows(),
                    sp.ncols(),
                    nrows,
                    ncols,
                ));
            }
            nrows += sp.nrows();
        }
        let sp = Sparsity::dense(nrows, ncols);
        Ok(self.push(MNode {
            op: MOp::VertCat,
            deps: parts.to_vec(),
            sparsity: vec![sp],
        }))
    }

    /// Splits a dense matrix horizontally at the given row offsets.
    ///
    /// `offsets` must start at 0, end at the row count, and be monotone; one
    /// handle per slice is returned.
    pub fn vsplit(
        &mut self,
        a: MId,
        offsets: &[usize],
    ) -> Result<Vec<MId>, Error> {
        let sa = self.sparsity(a)?.clone();
        if !sa.is_dense() {
            return Err(Error::NotDense("vsplit"));
        }
        if offsets.first() != Some(&0)
            || offsets.last() != Some(&sa.nrows())
            || offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(Error::BadSlice(offsets.len(), sa.nrows()));
        }
        let out_sp: Vec<Sparsity> = offsets
            .windows(2)
            .map(|w| Sparsity::dense(w[1] - w[0], sa.ncols()))
            .collect();
        let split = self.push(MNode {
            op: MOp::VSplit {
                offsets: offsets.to_vec(),
            },
            deps: vec![a],
            sparsity: out_sp.clone(),
        });
        Ok(out_sp
            .into_iter()
            .enumerate()
            .map(|(i, sp)| {
                self.push(MNode {
                    op: MOp::GetOutput(i),
                    deps: vec![split],
                    sparsity: vec![sp],
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sparsity_validation() {
        let sp = Sparsity::new(3, 2, vec![0, 2, 3], vec![0, 2, 1]).unwrap();
        assert_eq!(sp.nnz(), 3);
        assert!(!sp.is_dense());
        // row out of range
        assert!(Sparsity::new(2, 1, vec![0, 1], vec![5]).is_err());
        // rows not increasing within a column
        assert!(Sparsity::new(3, 1, vec![0, 2], vec![2, 1]).is_err());
        // colind does not cover row
        assert!(Sparsity::new(2, 2, vec![0, 1, 1], vec![0, 1]).is_err());
    }

    #[test]
    fn dense_pattern() {
        let sp = Sparsity::dense(2, 3);
        assert_eq!(sp.nnz(), 6);
        assert!(sp.is_dense());
        assert_eq!(sp.colind(), &[0, 2, 4, 6]);
        assert_eq!(sp.row(), &[0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn pattern_equality_is_structural() {
        let a = Sparsity::dense(2, 2);
        let b = Sparsity::dense(2, 2);
        assert_eq!(a, b);
        assert_ne!(a, Sparsity::dense(2, 3));
    }

    #[test]
    fn graph_shape_checks() {
        let mut g = Graph::new();
        let a = g.sym("a", Sparsity::dense(2, 3));
        let b = g.sym("b", Sparsity::dense(3, 2));
        assert!(g.matmul(a, b).is_ok());
        assert!(matches!(
            g.matmul(b, b),
            Err(Error::DimensionMismatch(..))
        ));
        assert!(matches!(g.add(a, b), Err(Error::SparsityMismatch)));

        let sp = Sparsity::new(2, 3, vec![0, 1, 1, 2], vec![0, 1]).unwrap();
        let c = g.sym("c", sp);
        assert!(matches!(g.matmul(c, b), Err(Error::NotDense("matmul"))));
    }

    #[test]
    fn vsplit_creates_one_handle_per_slice() {
        let mut g = Graph::new();
        let a = g.sym("a", Sparsity::dense(4, 2));
        let parts = g.vsplit(a, &[0, 1, 4]).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(g.sparsity(parts[0]).unwrap().nrows(), 1);
        assert_eq!(g.sparsity(parts[1]).unwrap().nrows(), 3);
        assert!(g.vsplit(a, &[0, 5]).is_err());
        assert!(g.vsplit(a, &[1, 4]).is_err());
    }
}
