//! The closed catalog of scalar operations
//!
//! Every operation exposes its numeric evaluation rule, its partial-derivative
//! rule, and the textual template used by both the tape printer and the code
//! generator.  The interpreter dispatches generically over this catalog; it
//! special-cases nothing beyond the CONST / INPUT / OUTPUT / PARAM opcodes.
use crate::context::{Node, VarNode};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// A one-argument operation
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UnaryOpcode {
    Neg,
    Abs,
    Sign,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
}

/// A two-argument operation
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

/// An operation in a [`Context`](crate::context::Context)
///
/// `Op`s should be constructed by calling construction functions on the
/// context; they are deduplicated by the arena, so equal ops are equal
/// handles.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Op {
    Const(OrderedFloat<f64>),
    Var(VarNode),
    Unary(UnaryOpcode, Node),
    Binary(BinaryOpcode, Node, Node),
}

impl Op {
    /// Iterates over the children (dependencies) of this operation, in order
    pub fn iter_children(&self) -> impl Iterator<Item = Node> {
        let out = match self {
            Op::Binary(_, a, b) => [Some(*a), Some(*b)],
            Op::Unary(_, a) => [Some(*a), None],
            Op::Var(..) | Op::Const(..) => [None, None],
        };
        out.into_iter().flatten()
    }
}

impl UnaryOpcode {
    /// Numeric evaluation rule
    pub fn eval(&self, a: f64) -> f64 {
        match self {
            UnaryOpcode::Neg => -a,
            UnaryOpcode::Abs => a.abs(),
            UnaryOpcode::Sign => {
                if a > 0.0 {
                    1.0
                } else if a < 0.0 {
                    -1.0
                } else {
                    a // preserves signed zero and NaN
                }
            }
            UnaryOpcode::Sqrt => a.sqrt(),
            UnaryOpcode::Square => a * a,
            UnaryOpcode::Sin => a.sin(),
            UnaryOpcode::Cos => a.cos(),
            UnaryOpcode::Tan => a.tan(),
            UnaryOpcode::Exp => a.exp(),
            UnaryOpcode::Ln => a.ln(),
        }
    }

    /// Partial derivative with respect to the argument
    ///
    /// `f` is the already-computed result of the operation, which lets several
    /// rules (`Sqrt`, `Exp`, `Tan`) avoid recomputing transcendentals.
    pub fn derivative(&self, a: f64, f: f64) -> f64 {
        match self {
            UnaryOpcode::Neg => -1.0,
            UnaryOpcode::Abs => {
                if a < 0.0 {
                    -1.0
                } else {
                    1.0
                }
            }
            UnaryOpcode::Sign => 0.0,
            UnaryOpcode::Sqrt => 0.5 / f,
            UnaryOpcode::Square => 2.0 * a,
            UnaryOpcode::Sin => a.cos(),
            UnaryOpcode::Cos => -a.sin(),
            UnaryOpcode::Tan => 1.0 + f * f,
            UnaryOpcode::Exp => f,
            UnaryOpcode::Ln => 1.0 / a,
        }
    }

    /// True if the operation is differentiable everywhere
    pub fn is_smooth(&self) -> bool {
        !matches!(self, UnaryOpcode::Abs | UnaryOpcode::Sign)
    }

    /// Textual template: prefix and suffix around the argument
    ///
    /// Shared by the tape printer and the C code generator, so the tokens are
    /// C expressions.
    pub fn tokens(&self) -> (&'static str, &'static str) {
        match self {
            UnaryOpcode::Neg => ("(-", ")"),
            UnaryOpcode::Abs => ("fabs(", ")"),
            UnaryOpcode::Sign => ("sign(", ")"),
            UnaryOpcode::Sqrt => ("sqrt(", ")"),
            UnaryOpcode::Square => ("sq(", ")"),
            UnaryOpcode::Sin => ("sin(", ")"),
            UnaryOpcode::Cos => ("cos(", ")"),
            UnaryOpcode::Tan => ("tan(", ")"),
            UnaryOpcode::Exp => ("exp(", ")"),
            UnaryOpcode::Ln => ("log(", ")"),
        }
    }
}

impl BinaryOpcode {
    /// Numeric evaluation rule
    pub fn eval(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOpcode::Add => a + b,
            BinaryOpcode::Sub => a - b,
            BinaryOpcode::Mul => a * b,
            BinaryOpcode::Div => a / b,
            BinaryOpcode::Pow => a.powf(b),
            BinaryOpcode::Min => a.min(b),
            BinaryOpcode::Max => a.max(b),
        }
    }

    /// Partial derivatives with respect to both arguments
    ///
    /// `f` is the already-computed result of the operation.
    pub fn derivatives(&self, a: f64, b: f64, f: f64) -> [f64; 2] {
        match self {
            BinaryOpcode::Add => [1.0, 1.0],
            BinaryOpcode::Sub => [1.0, -1.0],
            BinaryOpcode::Mul => [b, a],
            BinaryOpcode::Div => [1.0 / b, -f / b],
            BinaryOpcode::Pow => [b * a.powf(b - 1.0), f * a.ln()],
            BinaryOpcode::Min => {
                if a <= b {
                    [1.0, 0.0]
                } else {
                    [0.0, 1.0]
                }
            }
            BinaryOpcode::Max => {
                if a >= b {
                    [1.0, 0.0]
                } else {
                    [0.0, 1.0]
                }
            }
        }
    }

    /// True if the operation is differentiable everywhere
    pub fn is_smooth(&self) -> bool {
        !matches!(self, BinaryOpcode::Min | BinaryOpcode::Max)
    }

    /// Textual template: prefix, separator, and suffix around the arguments
    pub fn tokens(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            BinaryOpcode::Add => ("(", "+", ")"),
            BinaryOpcode::Sub => ("(", "-", ")"),
            BinaryOpcode::Mul => ("(", "*", ")"),
            BinaryOpcode::Div => ("(", "/", ")"),
            BinaryOpcode::Pow => ("pow(", ", ", ")"),
            BinaryOpcode::Min => ("fmin(", ", ", ")"),
            BinaryOpcode::Max => ("fmax(", ", ", ")"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivative_uses_result() {
        let a: f64 = 2.0;
        let f = UnaryOpcode::Exp.eval(a);
        assert_eq!(UnaryOpcode::Exp.derivative(a, f), a.exp());

        let f = UnaryOpcode::Sqrt.eval(a);
        assert_eq!(UnaryOpcode::Sqrt.derivative(a, f), 0.5 / a.sqrt());
    }

    #[test]
    fn min_max_partials_are_selectors() {
        assert_eq!(BinaryOpcode::Min.derivatives(1.0, 2.0, 1.0), [1.0, 0.0]);
        assert_eq!(BinaryOpcode::Min.derivatives(3.0, 2.0, 2.0), [0.0, 1.0]);
        assert_eq!(BinaryOpcode::Max.derivatives(1.0, 2.0, 2.0), [0.0, 1.0]);
    }

    #[test]
    fn sign_is_odd_and_flat() {
        assert_eq!(UnaryOpcode::Sign.eval(-3.5), -1.0);
        assert_eq!(UnaryOpcode::Sign.eval(0.0), 0.0);
        assert_eq!(UnaryOpcode::Sign.derivative(5.0, 1.0), 0.0);
    }
}
