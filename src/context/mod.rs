//! Infrastructure for representing math expressions as graphs
pub(crate) mod indexed;
mod op;

use indexed::{define_index, IndexMap};
pub use op::{BinaryOpcode, Op, UnaryOpcode};

use crate::Error;
use ordered_float::OrderedFloat;

define_index!(Node, "An index in the `Context::ops` map");
define_index!(VarNode, "An index in the `Context::vars` map");

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.  Structurally identical expressions map
/// to identical [`Node`] handles, and operations on constants are folded at
/// construction time.
#[derive(Debug, Default)]
pub struct Context {
    ops: IndexMap<Op, Node>,
    vars: IndexMap<String, VarNode>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the context
    ///
    /// All [`Node`] and [`VarNode`] handles from this context are invalidated.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.vars.clear();
    }

    /// Returns the number of [`Op`] nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Checks whether the given [`Node`] is valid in this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).ok_or(Error::BadNode).map(|_| ())
    }

    /// Looks up the constant associated with the given node.
    ///
    /// If the node is invalid for this context, returns an error; if the node
    /// is not a constant, returns `Ok(None)`.
    pub fn const_value(&self, n: Node) -> Result<Option<f64>, Error> {
        match self.get_op(n) {
            Some(Op::Const(c)) => Ok(Some(c.0)),
            Some(_) => Ok(None),
            _ => Err(Error::BadNode),
        }
    }

    /// Looks up the variable name associated with the given node.
    ///
    /// If the node is invalid for this context, returns an error; if the node
    /// is not an `Op::Var`, returns `Ok(None)`.
    pub fn var_name(&self, n: Node) -> Result<Option<&str>, Error> {
        match self.get_op(n) {
            Some(Op::Var(v)) => self.get_var_by_index(*v).map(Some),
            Some(_) => Ok(None),
            _ => Err(Error::BadNode),
        }
    }

    /// Looks up the variable name associated with the given `VarNode`
    pub fn get_var_by_index(&self, n: VarNode) -> Result<&str, Error> {
        match self.vars.get_by_index(n) {
            Some(c) => Ok(c.as_str()),
            None => Err(Error::BadNode),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Primitives

    /// Returns a symbolic variable with the provided name.
    ///
    /// If a variable already exists with this name, then it is returned.
    /// ```
    /// # let mut ctx = gradtape::Context::new();
    /// let x1 = ctx.var("x");
    /// let x2 = ctx.var("x");
    /// assert_eq!(x1, x2);
    /// ```
    pub fn var(&mut self, name: &str) -> Node {
        let v = self.vars.insert(String::from(name));
        self.ops.insert(Op::Var(v))
    }

    /// Returns a node representing the given constant value.
    pub fn constant(&mut self, f: f64) -> Node {
        self.ops.insert(Op::Const(OrderedFloat(f)))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Generic construction with constant folding

    /// Find or create a [`Node`] for the given unary operation, with constant
    /// folding.
    pub fn unary(&mut self, op: UnaryOpcode, a: Node) -> Result<Node, Error> {
        match self.const_value(a)? {
            Some(c) => Ok(self.constant(op.eval(c))),
            None => Ok(self.ops.insert(Op::Unary(op, a))),
        }
    }

    /// Find or create a [`Node`] for the given binary operation, with constant
    /// folding and a few identity simplifications.
    pub fn binary(
        &mut self,
        op: BinaryOpcode,
        a: Node,
        b: Node,
    ) -> Result<Node, Error> {
        let ca = self.const_value(a)?;
        let cb = self.const_value(b)?;
        if let (Some(ca), Some(cb)) = (ca, cb) {
            return Ok(self.constant(op.eval(ca, cb)));
        }
        match op {
            BinaryOpcode::Add => match (ca, cb) {
                (Some(zero), _) if zero == 0.0 => return Ok(b),
                (_, Some(zero)) if zero == 0.0 => return Ok(a),
                _ => (),
            },
            BinaryOpcode::Sub => match (ca, cb) {
                (Some(zero), _) if zero == 0.0 => {
                    return self.unary(UnaryOpcode::Neg, b)
                }
                (_, Some(zero)) if zero == 0.0 => return Ok(a),
                _ => (),
            },
            BinaryOpcode::Mul => match (ca, cb) {
                (Some(one), _) if one == 1.0 => return Ok(b),
                (_, Some(one)) if one == 1.0 => return Ok(a),
                _ => (),
            },
            BinaryOpcode::Div | BinaryOpcode::Pow => {
                if cb == Some(1.0) {
                    return Ok(a);
                }
            }
            BinaryOpcode::Min | BinaryOpcode::Max => {
                if a == b {
                    return Ok(a);
                }
            }
        }
        // Deduplication of commutative operations is encouraged by sorting
        // the operands
        let (a, b) = match op {
            BinaryOpcode::Add | BinaryOpcode::Mul => (a.min(b), a.max(b)),
            _ => (a, b),
        };
        Ok(self.ops.insert(Op::Binary(op, a, b)))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Named helpers

    /// Builds an addition node
    /// ```
    /// # let mut ctx = gradtape::Context::new();
    /// let x = ctx.var("x");
    /// let sum = ctx.add(x, 1.0)?;
    /// # Ok::<(), gradtape::Error>(())
    /// ```
    pub fn add<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Add, a, b)
    }

    /// Builds a subtraction node
    pub fn sub<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Sub, a, b)
    }

    /// Builds a multiplication node
    pub fn mul<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Mul, a, b)
    }

    /// Builds a division node
    pub fn div<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Div, a, b)
    }

    /// Builds a power node, `a^b`
    pub fn pow<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Pow, a, b)
    }

    /// Builds a `min` node
    pub fn min<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Min, a, b)
    }

    /// Builds a `max` node
    pub fn max<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.binary(BinaryOpcode::Max, a, b)
    }

    /// Builds a unary negation node
    pub fn neg<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Neg, a)
    }

    /// Builds an absolute-value node
    pub fn abs<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Abs, a)
    }

    /// Builds a sign node (-1, 0, or 1)
    pub fn sign<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Sign, a)
    }

    /// Builds a square-root node
    pub fn sqrt<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Sqrt, a)
    }

    /// Builds a node which squares its input
    pub fn square<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Square, a)
    }

    /// Builds a sine node
    pub fn sin<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Sin, a)
    }

    /// Builds a cosine node
    pub fn cos<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Cos, a)
    }

    /// Builds a tangent node
    pub fn tan<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Tan, a)
    }

    /// Builds an exponential node
    pub fn exp<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Exp, a)
    }

    /// Builds a natural-logarithm node
    pub fn ln<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.unary(UnaryOpcode::Ln, a)
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Structural equality up to a bounded comparison depth.
    ///
    /// At depth 0 only handle identity counts.  Because the arena
    /// deduplicates, structurally identical expressions in the same context
    /// share a handle, so the depth bound rarely matters in practice; it is
    /// kept configurable to match the recording-evaluation fast path.
    pub fn eq_bounded(&self, a: Node, b: Node, depth: usize) -> bool {
        if a == b {
            return true;
        }
        if depth == 0 {
            return false;
        }
        match (self.get_op(a), self.get_op(b)) {
            (Some(Op::Unary(oa, x)), Some(Op::Unary(ob, y))) => {
                oa == ob && self.eq_bounded(*x, *y, depth - 1)
            }
            (
                Some(Op::Binary(oa, x1, x2)),
                Some(Op::Binary(ob, y1, y2)),
            ) => {
                oa == ob
                    && self.eq_bounded(*x1, *y1, depth - 1)
                    && self.eq_bounded(*x2, *y2, depth - 1)
            }
            (Some(opa), Some(opb)) => opa == opb,
            _ => false,
        }
    }

    /// Looks up an operation by [`Node`] handle
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get_by_index(node)
    }

    /// Iterates over every node handle in the context
    pub fn nodes(&self) -> impl Iterator<Item = Node> {
        self.ops.keys()
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Helper trait for things that can be converted into a [`Node`] given a
/// [`Context`].
///
/// This trait allows you to write
/// ```
/// # let mut ctx = gradtape::Context::new();
/// let x = ctx.var("x");
/// let sum = ctx.add(x, 1.0).unwrap();
/// ```
/// instead of the more verbose
/// ```
/// # let mut ctx = gradtape::Context::new();
/// let x = ctx.var("x");
/// let num = ctx.constant(1.0);
/// let sum = ctx.add(x, num).unwrap();
/// ```
pub trait IntoNode {
    /// Converts the given value into a node
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for f64 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self))
    }
}

////////////////////////////////////////////////////////////////////////////////
