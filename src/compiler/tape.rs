//! Flat instruction tapes
use super::{alloc::allocate, sort::sort_graph};
use crate::{
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode},
    eval::Options,
    Error,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single instruction in a [`Tape`]
///
/// Operand fields refer to slots of the work vector; `arg` / `out` refer to
/// declared function inputs and outputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TapeOp {
    /// Load element `offset` of input `arg` into slot `dst`
    Input { dst: usize, arg: usize, offset: usize },
    /// Store slot `src` into element `offset` of output `out`
    Output { out: usize, offset: usize, src: usize },
    /// Load a literal into slot `dst`
    Const { dst: usize, value: f64 },
    /// A symbolic leaf that is not bound to any declared input
    Param { dst: usize, name: String },
    /// Apply a unary operation
    Unary {
        dst: usize,
        op: UnaryOpcode,
        arg: usize,
    },
    /// Apply a binary operation
    Binary {
        dst: usize,
        op: BinaryOpcode,
        lhs: usize,
        rhs: usize,
    },
}

/// An expression graph flattened into straight-line code over a work vector
///
/// A `Tape` is position-independent: it refers to its context only through
/// declared input/output indices and free-variable names, so it can be
/// serialized, printed, interpreted, or lowered to C without the [`Context`]
/// that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tape {
    name: String,
    ops: Vec<TapeOp>,
    worksize: usize,
    input_sizes: Vec<usize>,
    output_sizes: Vec<usize>,
    free_vars: Vec<String>,
}

impl Tape {
    /// Flattens the subgraph reachable from `outputs` into a tape.
    ///
    /// Unbound symbolic leaves are recorded as free variables rather than
    /// rejected; numeric evaluation of a tape with free variables fails, but
    /// printing, code generation, and symbolic re-evaluation still work.
    pub fn new(
        ctx: &Context,
        name: &str,
        inputs: &[Vec<Node>],
        outputs: &[Vec<Node>],
        options: &Options,
    ) -> Result<Self, Error> {
        Self::build(ctx, name, inputs, outputs, options).map(|(t, _)| t)
    }

    pub(crate) fn build(
        ctx: &Context,
        name: &str,
        inputs: &[Vec<Node>],
        outputs: &[Vec<Node>],
        options: &Options,
    ) -> Result<(Self, Vec<Node>), Error> {
        if outputs.iter().map(|o| o.len()).sum::<usize>() == 0 {
            return Err(Error::EmptyFunction(name.to_owned()));
        }
        let mut seen_inputs: HashSet<Node> = HashSet::new();
        for (index, input) in inputs.iter().enumerate() {
            for &n in input {
                match ctx.get_op(n) {
                    Some(Op::Var(..)) => (),
                    Some(_) => {
                        return Err(Error::NonSymbolicInput {
                            function: name.to_owned(),
                            index,
                        })
                    }
                    None => return Err(Error::BadNode),
                }
                if !seen_inputs.insert(n) {
                    let var = ctx.var_name(n)?.unwrap_or_default();
                    return Err(Error::DuplicateInput {
                        function: name.to_owned(),
                        index,
                        name: var.to_owned(),
                    });
                }
            }
        }

        let sorted = sort_graph(ctx, inputs, outputs)?;
        let node_count = sorted.position.len();

        // Output elements in declaration order, one per sort marker
        let out_elems: Vec<(usize, usize, Node)> = outputs
            .iter()
            .enumerate()
            .flat_map(|(o, v)| {
                v.iter().enumerate().map(move |(k, &n)| (o, k, n))
            })
            .collect();

        let mut ops: Vec<TapeOp> = Vec::with_capacity(sorted.nodes.len());
        let mut instr_at = vec![usize::MAX; node_count];
        let mut params: Vec<(usize, Node)> = vec![];
        let mut marker = 0;
        for entry in &sorted.nodes {
            match entry {
                None => {
                    let (out, offset, n) = out_elems[marker];
                    marker += 1;
                    ops.push(TapeOp::Output {
                        out,
                        offset,
                        src: sorted.position[&n],
                    });
                }
                Some(n) => {
                    let pos = sorted.position[n];
                    instr_at[pos] = ops.len();
                    match *ctx.get_op(*n).ok_or(Error::BadNode)? {
                        Op::Const(c) => ops.push(TapeOp::Const {
                            dst: pos,
                            value: c.0,
                        }),
                        Op::Var(v) => {
                            params.push((pos, *n));
                            ops.push(TapeOp::Param {
                                dst: pos,
                                name: ctx
                                    .get_var_by_index(v)?
                                    .to_owned(),
                            });
                        }
                        Op::Unary(op, a) => ops.push(TapeOp::Unary {
                            dst: pos,
                            op,
                            arg: sorted.position[&a],
                        }),
                        Op::Binary(op, a, b) => ops.push(TapeOp::Binary {
                            dst: pos,
                            op,
                            lhs: sorted.position[&a],
                            rhs: sorted.position[&b],
                        }),
                    }
                }
            }
        }

        // Bind declared inputs: their placeholder loads become input loads
        let mut bound: HashSet<usize> = HashSet::new();
        for (arg, input) in inputs.iter().enumerate() {
            for (offset, &n) in input.iter().enumerate() {
                let pos = sorted.position[&n];
                ops[instr_at[pos]] = TapeOp::Input { dst: pos, arg, offset };
                bound.insert(pos);
            }
        }
        let mut free_vars = vec![];
        let mut free_nodes = vec![];
        for (pos, n) in params {
            if !bound.contains(&pos) {
                if let Some(v) = ctx.var_name(n)? {
                    free_vars.push(v.to_owned());
                }
                free_nodes.push(n);
            }
        }

        let worksize =
            allocate(&mut ops, node_count, options.live_variables);

        log::debug!(
            "compiled `{}`: {} instructions, work vector of {} (live \
             variables {})",
            name,
            ops.len(),
            worksize,
            if options.live_variables { "on" } else { "off" },
        );
        if !free_vars.is_empty() {
            log::warn!(
                "function `{}` has free variables {:?}",
                name,
                free_vars
            );
        }

        let tape = Tape {
            name: name.to_owned(),
            ops,
            worksize,
            input_sizes: inputs.iter().map(|i| i.len()).collect(),
            output_sizes: outputs.iter().map(|o| o.len()).collect(),
            free_vars,
        };
        Ok((tape, free_nodes))
    }

    /// Name given to the function at construction
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of instructions in the tape
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the tape is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Size of the work vector required to run the tape
    pub fn worksize(&self) -> usize {
        self.worksize
    }

    /// Element count of each declared input
    pub fn input_sizes(&self) -> &[usize] {
        &self.input_sizes
    }

    /// Element count of each declared output
    pub fn output_sizes(&self) -> &[usize] {
        &self.output_sizes
    }

    /// Names of symbolic leaves not bound to any declared input
    pub fn free_vars(&self) -> &[String] {
        &self.free_vars
    }

    /// Iterates over instructions in execution order
    pub fn iter(&self) -> std::slice::Iter<'_, TapeOp> {
        self.ops.iter()
    }

    pub(crate) fn ops(&self) -> &[TapeOp] {
        &self.ops
    }
}

impl std::fmt::Display for Tape {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for op in &self.ops {
            match op {
                TapeOp::Input { dst, arg, offset } => {
                    writeln!(f, "@{dst} = input[{arg}][{offset}]")?
                }
                TapeOp::Output { out, offset, src } => {
                    writeln!(f, "output[{out}][{offset}] = @{src}")?
                }
                TapeOp::Const { dst, value } => {
                    writeln!(f, "@{dst} = {value}")?
                }
                TapeOp::Param { dst, name } => {
                    writeln!(f, "@{dst} = {name}")?
                }
                TapeOp::Unary { dst, op, arg } => {
                    let (pre, post) = op.tokens();
                    writeln!(f, "@{dst} = {pre}@{arg}{post}")?
                }
                TapeOp::Binary { dst, op, lhs, rhs } => {
                    let (pre, sep, post) = op.tokens();
                    writeln!(f, "@{dst} = {pre}@{lhs}{sep}@{rhs}{post}")?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn xy_sin() -> (Context, Node, Node, Node) {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();
        (ctx, x, y, z)
    }

    #[test]
    fn instruction_counts() {
        let (ctx, x, y, z) = xy_sin();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        let inputs = tape
            .iter()
            .filter(|op| matches!(op, TapeOp::Input { .. }))
            .count();
        let outputs = tape
            .iter()
            .filter(|op| matches!(op, TapeOp::Output { .. }))
            .count();
        assert_eq!(inputs, 2);
        assert_eq!(outputs, 1);
        assert!(tape.free_vars().is_empty());
        assert!(tape.worksize() <= 4);
    }

    #[test]
    fn zero_size_outputs_advance_the_cursor() {
        let (ctx, x, y, z) = xy_sin();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![], vec![z], vec![]],
            &Options::default(),
        )
        .unwrap();
        assert_eq!(tape.output_sizes(), [0, 1, 0]);
        let stores: Vec<_> = tape
            .iter()
            .filter(|op| matches!(op, TapeOp::Output { .. }))
            .collect();
        assert_eq!(stores.len(), 1);
        assert!(matches!(
            stores[0],
            TapeOp::Output { out: 1, offset: 0, .. }
        ));
    }

    #[test]
    fn operand_slots_are_written_before_use() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();
        let w = ctx.div(s, y).unwrap();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![z, w]],
            &Options::default(),
        )
        .unwrap();
        let mut written = vec![false; tape.worksize()];
        for op in tape.iter() {
            match *op {
                TapeOp::Input { dst, .. }
                | TapeOp::Const { dst, .. }
                | TapeOp::Param { dst, .. } => written[dst] = true,
                TapeOp::Unary { dst, arg, .. } => {
                    assert!(written[arg]);
                    written[dst] = true;
                }
                TapeOp::Binary { dst, lhs, rhs, .. } => {
                    assert!(written[lhs]);
                    assert!(written[rhs]);
                    written[dst] = true;
                }
                TapeOp::Output { src, .. } => assert!(written[src]),
            }
        }
    }

    #[test]
    fn deterministic_compilation() {
        let (ctx, x, y, z) = xy_sin();
        let a = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        let b = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_input_is_rejected() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let z = ctx.square(x).unwrap();
        let err = Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![x]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateInput { index: 1, .. }
        ));
    }

    #[test]
    fn non_symbolic_input_is_rejected() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let c = ctx.constant(2.0);
        let z = ctx.add(x, c).unwrap();
        let err = Tape::new(
            &ctx,
            "f",
            &[vec![c]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NonSymbolicInput { index: 0, .. }));
    }

    #[test]
    fn empty_function_is_rejected() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let err = Tape::new(&ctx, "f", &[vec![x]], &[], &Options::default())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyFunction(..)));
    }

    #[test]
    fn unbound_leaves_become_free_vars() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let z = ctx.mul(x, y).unwrap();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        assert_eq!(tape.free_vars(), ["y"]);
    }

    #[test]
    fn display_grammar() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let z = ctx.sin(x).unwrap();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        let text = tape.to_string();
        assert_eq!(
            text,
            "@0 = input[0][0]\n@0 = sin(@0)\noutput[0][0] = @0\n"
        );
    }
}
