//! Compilation and evaluation of algorithmic-differentiation expression
//! graphs.
//!
//! Expressions are built in an arena [`Context`], which deduplicates nodes
//! and folds constants as they are constructed.  A [`Function`] flattens the
//! graph reachable from its outputs into a [`Tape`](compiler::Tape):
//! straight-line code over a compact work vector, with slots reused once
//! their value is dead.  The same tape drives every evaluation mode:
//!
//! * numeric forward evaluation ([`Function::eval`]),
//! * forward and adjoint derivative sweeps ([`Function::eval_ad`], with
//!   [`Function::jvp`] and [`Function::vjp`] as one-direction shorthands),
//! * bit-parallel dependency propagation ([`Function::sparsity_fwd`] and
//!   [`Function::sparsity_rev`], 64 seed columns per pass),
//! * symbolic re-evaluation against new graph nodes
//!   ([`Function::eval_symbolic`]),
//! * lowering to portable C ([`codegen::CodeGenerator`]).
//!
//! ```
//! use gradtape::{Context, Function};
//!
//! let mut ctx = Context::new();
//! let x = ctx.var("x");
//! let y = ctx.var("y");
//! let xy = ctx.mul(x, y)?;
//! let s = ctx.sin(x)?;
//! let z = ctx.add(xy, s)?;
//!
//! let mut f = Function::new(&ctx, "f", &[vec![x], vec![y]], &[vec![z]])?;
//! let out = f.eval(&[&[2.0], &[3.0]])?;
//! assert!((out[0][0] - (6.0 + 2.0_f64.sin())).abs() < 1e-12);
//!
//! // dz/dx = y + cos(x), dz/dy = x
//! let grad = f.vjp(&[&[2.0], &[3.0]], &[&[1.0]])?;
//! assert!((grad[0][0] - (3.0 + 2.0_f64.cos())).abs() < 1e-12);
//! assert!((grad[1][0] - 2.0).abs() < 1e-12);
//! # Ok::<(), gradtape::Error>(())
//! ```
//!
//! The [`matrix`] module provides the same pipeline one level up: graphs
//! whose values are whole sparse matrices, compiled to tapes over
//! matrix-valued work slots.
pub mod backend;
pub mod codegen;
pub mod compiler;
pub mod context;
mod error;
pub mod eval;
pub mod matrix;

pub use context::{BinaryOpcode, Context, IntoNode, Node, UnaryOpcode};
pub use error::Error;
pub use eval::{AdResult, Function, Options};
