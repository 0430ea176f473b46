//! Instruction tapes over matrix-valued work slots
use super::{Graph, MId, MOp, Sparsity};
use crate::{eval::Options, Error};
use std::collections::{HashMap, HashSet};

/// A single instruction in an [`MTape`]
///
/// Operands refer to slots of a work vector of matrices; each slot has a
/// fixed sparsity pattern for the lifetime of the tape.
#[derive(Clone, Debug)]
pub enum MTapeOp {
    /// Copy declared input `arg` into slot `dst`
    Input { dst: usize, arg: usize },
    /// Publish slot `src` as declared output `out`
    Output { out: usize, src: usize },
    /// A symbolic leaf not bound to any declared input
    Param { dst: usize, name: String },
    /// Apply a matrix operation; `res` holds one entry per operation output,
    /// `None` where that output is never used
    Op {
        op: MOp,
        args: Vec<usize>,
        res: Vec<Option<usize>>,
    },
}

/// A matrix graph flattened into straight-line code.
///
/// Slots are partitioned by sparsity pattern: a freed slot is only ever
/// reused by a value with the identical pattern, so each slot's buffer can be
/// allocated once and kept.
#[derive(Debug)]
pub struct MTape {
    name: String,
    ops: Vec<MTapeOp>,
    /// Sparsity pattern of each work slot
    work_sp: Vec<Sparsity>,
    input_sparsity: Vec<Sparsity>,
    output_sparsity: Vec<Sparsity>,
    free_vars: Vec<String>,
    /// Slot overwrites as `(instruction, slot)`, in execution order; the
    /// adjoint sweep saves these values on the way forward and restores them
    /// on the way back
    spills: Vec<(usize, usize)>,
}

impl MTape {
    /// Flattens the subgraph reachable from `outputs` into a tape
    pub fn new(
        graph: &Graph,
        name: &str,
        inputs: &[MId],
        outputs: &[MId],
        options: &Options,
    ) -> Result<Self, Error> {
        if outputs.is_empty() {
            return Err(Error::EmptyFunction(name.to_owned()));
        }
        let mut seen_inputs = HashSet::new();
        for (index, &inp) in inputs.iter().enumerate() {
            let node = graph.node(inp)?;
            let var = match &node.op {
                MOp::Sym(s) => s.clone(),
                _ => {
                    return Err(Error::NonSymbolicInput {
                        function: name.to_owned(),
                        index,
                    })
                }
            };
            if !seen_inputs.insert(inp) {
                return Err(Error::DuplicateInput {
                    function: name.to_owned(),
                    index,
                    name: var,
                });
            }
        }

        let order = sort(graph, inputs, outputs)?;

        // Which outputs of multiple-output nodes are actually selected
        let mut used: HashSet<(MId, usize)> = HashSet::new();
        for id in order.iter().flatten() {
            let node = graph.node(*id)?;
            if let MOp::GetOutput(i) = node.op {
                used.insert((node.deps[0], i));
            }
        }

        // Emit instructions over virtual positions.  A `GetOutput` node
        // emits nothing; it aliases its parent's result position, which also
        // deduplicates repeated selections of the same output.
        let mut posmap: HashMap<(MId, usize), usize> = HashMap::new();
        let mut pos_sp: Vec<Sparsity> = vec![];
        let mut ops: Vec<MTapeOp> = vec![];
        let mut params: Vec<(MId, usize)> = vec![];
        let mut marker = 0;
        for entry in &order {
            let id = match entry {
                None => {
                    let root = outputs[marker];
                    ops.push(MTapeOp::Output {
                        out: marker,
                        src: posmap[&(root, 0)],
                    });
                    marker += 1;
                    continue;
                }
                Some(id) => *id,
            };
            let node = graph.node(id)?;
            match &node.op {
                MOp::Sym(sym) => {
                    let p = pos_sp.len();
                    pos_sp.push(node.sparsity[0].clone());
                    posmap.insert((id, 0), p);
                    params.push((id, ops.len()));
                    ops.push(MTapeOp::Param {
                        dst: p,
                        name: sym.clone(),
                    });
                }
                MOp::GetOutput(i) => {
                    let p = posmap[&(node.deps[0], *i)];
                    posmap.insert((id, 0), p);
                }
                op => {
                    let args: Vec<usize> = node
                        .deps
                        .iter()
                        .map(|d| posmap[&(*d, 0)])
                        .collect();
                    let res: Vec<Option<usize>> = (0..op.n_outputs())
                        .map(|i| {
                            if op.n_outputs() > 1
                                && !used.contains(&(id, i))
                            {
                                return None;
                            }
                            let p = pos_sp.len();
                            pos_sp.push(node.sparsity[i].clone());
                            posmap.insert((id, i), p);
                            Some(p)
                        })
                        .collect();
                    ops.push(MTapeOp::Op {
                        op: op.clone(),
                        args,
                        res,
                    });
                }
            }
        }

        // Bind declared inputs; leftover leaves stay free
        let mut bound = HashSet::new();
        for (arg, &inp) in inputs.iter().enumerate() {
            for &(id, instr) in &params {
                if id == inp {
                    if let MTapeOp::Param { dst, .. } = ops[instr] {
                        ops[instr] = MTapeOp::Input { dst, arg };
                    }
                    bound.insert(id);
                }
            }
        }
        let mut free_vars = vec![];
        for &(id, instr) in &params {
            if !bound.contains(&id) {
                if let MTapeOp::Param { name, .. } = &ops[instr] {
                    free_vars.push(name.clone());
                }
            }
        }

        let work_sp =
            allocate(&mut ops, &pos_sp, options.live_variables);
        let spills = find_spills(&ops, work_sp.len());

        log::debug!(
            "compiled matrix function `{}`: {} instructions, {} work \
             slots, {} spills",
            name,
            ops.len(),
            work_sp.len(),
            spills.len(),
        );

        let input_sparsity = inputs
            .iter()
            .map(|&i| graph.sparsity(i).cloned())
            .collect::<Result<_, _>>()?;
        let output_sparsity = outputs
            .iter()
            .map(|&o| graph.sparsity(o).cloned())
            .collect::<Result<_, _>>()?;
        Ok(MTape {
            name: name.to_owned(),
            ops,
            work_sp,
            input_sparsity,
            output_sparsity,
            free_vars,
            spills,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn len(&self) -> usize {
        self.ops.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    /// Number of matrix-valued work slots
    pub fn worksize(&self) -> usize {
        self.work_sp.len()
    }
    /// Sparsity pattern of each work slot
    pub fn work_sparsity(&self) -> &[Sparsity] {
        &self.work_sp
    }
    pub fn input_sparsity(&self) -> &[Sparsity] {
        &self.input_sparsity
    }
    pub fn output_sparsity(&self) -> &[Sparsity] {
        &self.output_sparsity
    }
    pub fn free_vars(&self) -> &[String] {
        &self.free_vars
    }
    pub(crate) fn spills(&self) -> &[(usize, usize)] {
        &self.spills
    }
    pub fn iter(&self) -> std::slice::Iter<'_, MTapeOp> {
        self.ops.iter()
    }
    pub(crate) fn ops(&self) -> &[MTapeOp] {
        &self.ops
    }
}

/// Topological order with a `None` marker after each output root
fn sort(
    graph: &Graph,
    inputs: &[MId],
    outputs: &[MId],
) -> Result<Vec<Option<MId>>, Error> {
    enum Phase {
        Down(MId),
        Up(MId),
    }
    let mut order = vec![];
    let mut visited = HashSet::new();
    let mut stack = vec![];
    for &root in outputs {
        graph.node(root)?;
        stack.push(Phase::Down(root));
        while let Some(phase) = stack.pop() {
            match phase {
                Phase::Down(id) => {
                    if !visited.insert(id) {
                        continue;
                    }
                    stack.push(Phase::Up(id));
                    let node = graph.node(id)?;
                    for &dep in node.deps.iter().rev() {
                        if !visited.contains(&dep) {
                            stack.push(Phase::Down(dep));
                        }
                    }
                }
                Phase::Up(id) => order.push(Some(id)),
            }
        }
        order.push(None);
    }
    for &inp in inputs {
        graph.node(inp)?;
        if visited.insert(inp) {
            order.push(Some(inp));
        }
    }
    Ok(order)
}

/// Rewrites virtual positions to work slots, reusing freed slots only
/// within their own sparsity pattern.
///
/// Results are claimed before arguments are released, so an instruction's
/// results never alias its still-live arguments; the adjoint sweep depends
/// on that.
fn allocate(
    ops: &mut [MTapeOp],
    pos_sp: &[Sparsity],
    live_variables: bool,
) -> Vec<Sparsity> {
    let mut refcount = vec![0usize; pos_sp.len()];
    for op in ops.iter() {
        match op {
            MTapeOp::Op { args, .. } => {
                for &a in args {
                    refcount[a] += 1;
                }
            }
            MTapeOp::Output { src, .. } => refcount[*src] += 1,
            MTapeOp::Input { .. } | MTapeOp::Param { .. } => (),
        }
    }

    let mut place = vec![usize::MAX; pos_sp.len()];
    let mut work_sp: Vec<Sparsity> = vec![];
    let mut free: HashMap<Sparsity, Vec<usize>> = HashMap::new();
    for op in ops.iter_mut() {
        match op {
            MTapeOp::Input { dst, .. } | MTapeOp::Param { dst, .. } => {
                let slot = alloc_slot(
                    &pos_sp[*dst],
                    &mut free,
                    &mut work_sp,
                    live_variables,
                );
                place[*dst] = slot;
                *dst = slot;
            }
            MTapeOp::Op { args, res, .. } => {
                for r in res.iter_mut().flatten() {
                    let slot = alloc_slot(
                        &pos_sp[*r],
                        &mut free,
                        &mut work_sp,
                        live_variables,
                    );
                    place[*r] = slot;
                    *r = slot;
                }
                for a in args.iter_mut().rev() {
                    let pos = *a;
                    refcount[pos] -= 1;
                    if refcount[pos] == 0 && live_variables {
                        free.entry(pos_sp[pos].clone())
                            .or_default()
                            .push(place[pos]);
                    }
                    *a = place[pos];
                }
            }
            MTapeOp::Output { src, .. } => {
                let pos = *src;
                refcount[pos] -= 1;
                if refcount[pos] == 0 && live_variables {
                    free.entry(pos_sp[pos].clone())
                        .or_default()
                        .push(place[pos]);
                }
                *src = place[pos];
            }
        }
    }
    work_sp
}

fn alloc_slot(
    sp: &Sparsity,
    free: &mut HashMap<Sparsity, Vec<usize>>,
    work_sp: &mut Vec<Sparsity>,
    live_variables: bool,
) -> usize {
    if live_variables {
        if let Some(slot) = free.get_mut(sp).and_then(|v| v.pop()) {
            return slot;
        }
    }
    work_sp.push(sp.clone());
    work_sp.len() - 1
}

/// Lists every overwrite of an already-written slot
fn find_spills(
    ops: &[MTapeOp],
    worksize: usize,
) -> Vec<(usize, usize)> {
    let mut written = vec![false; worksize];
    let mut spills = vec![];
    for (t, op) in ops.iter().enumerate() {
        let mut mark = |slot: usize| {
            if written[slot] {
                spills.push((t, slot));
            } else {
                written[slot] = true;
            }
        };
        match op {
            MTapeOp::Input { dst, .. } | MTapeOp::Param { dst, .. } => {
                mark(*dst)
            }
            MTapeOp::Op { res, .. } => {
                for &r in res.iter().flatten() {
                    mark(r);
                }
            }
            MTapeOp::Output { .. } => (),
        }
    }
    spills
}

impl std::fmt::Display for MTape {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for op in &self.ops {
            match op {
                MTapeOp::Input { dst, arg } => {
                    writeln!(f, "@{dst} = input[{arg}]")?
                }
                MTapeOp::Output { out, src } => {
                    writeln!(f, "output[{out}] = @{src}")?
                }
                MTapeOp::Param { dst, name } => {
                    writeln!(f, "@{dst} = {name}")?
                }
                MTapeOp::Op { op, args, res } => {
                    let lhs = if res.len() == 1 {
                        match res[0] {
                            Some(r) => format!("@{r}"),
                            None => "NULL".to_owned(),
                        }
                    } else {
                        let parts: Vec<String> = res
                            .iter()
                            .map(|r| match r {
                                Some(r) => format!("@{r}"),
                                None => "NULL".to_owned(),
                            })
                            .collect();
                        format!("{{{}}}", parts.join(", "))
                    };
                    let rhs = match op {
                        MOp::Const(m) => format!(
                            "const<{}x{}>",
                            m.sparsity().nrows(),
                            m.sparsity().ncols()
                        ),
                        MOp::Scale(factor) => {
                            format!("scale(@{}, {factor})", args[0])
                        }
                        _ => {
                            let parts: Vec<String> = args
                                .iter()
                                .map(|a| format!("@{a}"))
                                .collect();
                            format!(
                                "{}({})",
                                op.name(),
                                parts.join(", ")
                            )
                        }
                    };
                    writeln!(f, "{lhs} = {rhs}")?
                }
            }
        }
        Ok(())
    }
}
