//! Module containing the crate's universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Node is not present in this `Context`
    #[error("node is not present in this `Context`")]
    BadNode,

    /// A function must have at least one output
    #[error("function `{0}` has no outputs")]
    EmptyFunction(String),

    /// Two declared inputs alias the same underlying variable
    #[error(
        "input {index} of function `{function}` aliases an earlier input \
         (variable `{name}`)"
    )]
    DuplicateInput {
        /// Name of the function being constructed
        function: String,
        /// Index of the offending declared input
        index: usize,
        /// Name of the aliased variable
        name: String,
    },

    /// A declared input is not a symbolic variable
    #[error("input {index} of function `{function}` is not a symbolic variable")]
    NonSymbolicInput {
        /// Name of the function being constructed
        function: String,
        /// Index of the offending declared input
        index: usize,
    },

    /// The tape references symbolic leaves that are not bound to any input
    #[error("cannot use function `{function}` since variables {vars:?} are free")]
    FreeVariables {
        /// Name of the offending function
        function: String,
        /// Names of the unbound variables
        vars: Vec<String>,
    },

    /// Slice length does not match the declared input or output size
    #[error("slice length ({0}) does not match expected count ({1})")]
    BadSlice(usize, usize),

    /// Seed direction count does not match the expected shape
    #[error("seed shape is wrong: got {0} entries, expected {1}")]
    BadSeed(usize, usize),

    /// Requested execution backend is not compiled into this build
    #[error("execution backend `{0}` is not available in this build")]
    BackendUnavailable(String),

    /// The backend has not compiled a tape yet
    #[error("backend has no compiled tape")]
    BackendNotReady,

    /// Sparsity patterns of two values do not match
    #[error("sparsity patterns do not match")]
    SparsityMismatch,

    /// Matrix dimensions are incompatible for the requested operation
    #[error("incompatible dimensions: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(usize, usize, usize, usize),

    /// Operation requires dense operands
    #[error("operation `{0}` requires dense operands")]
    NotDense(&'static str),
}
