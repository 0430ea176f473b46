//! Depth-first topological ordering of an expression graph
use crate::{
    context::{Context, Node},
    Error,
};
use std::collections::{HashMap, HashSet};

/// Result of sorting a graph rooted at a function's outputs.
///
/// `nodes` lists every reachable node in dependency order, with a `None`
/// marker after each output element; the marker is where the tape builder
/// emits the store for that element.  Declared inputs that no output depends
/// on are appended at the end, so every input still owns a slot.
pub(crate) struct SortedGraph {
    pub nodes: Vec<Option<Node>>,
    /// Map from node to its index among the `Some` entries of `nodes`
    pub position: HashMap<Node, usize>,
}

/// Sorts the subgraph reachable from `outputs`.
///
/// Uses an explicit two-phase stack rather than recursion, so deeply nested
/// expressions cannot overflow the call stack.
pub(crate) fn sort_graph(
    ctx: &Context,
    inputs: &[Vec<Node>],
    outputs: &[Vec<Node>],
) -> Result<SortedGraph, Error> {
    enum Phase {
        Down(Node),
        Up(Node),
    }

    let mut nodes: Vec<Option<Node>> = vec![];
    let mut position: HashMap<Node, usize> = HashMap::new();
    let mut visited: HashSet<Node> = HashSet::new();
    let mut stack: Vec<Phase> = vec![];

    for out in outputs {
        for &root in out {
            ctx.get_op(root).ok_or(Error::BadNode)?;
            stack.push(Phase::Down(root));
            while let Some(phase) = stack.pop() {
                match phase {
                    Phase::Down(n) => {
                        if !visited.insert(n) {
                            continue;
                        }
                        let op = ctx.get_op(n).ok_or(Error::BadNode)?;
                        stack.push(Phase::Up(n));
                        // Reversed so that the first child is processed first
                        let children: Vec<Node> =
                            op.iter_children().collect();
                        for &child in children.iter().rev() {
                            if !visited.contains(&child) {
                                stack.push(Phase::Down(child));
                            }
                        }
                    }
                    Phase::Up(n) => {
                        position.insert(n, position.len());
                        nodes.push(Some(n));
                    }
                }
            }
            // Marks the store of this output element
            nodes.push(None);
        }
    }

    // Inputs must be live even when unused, so that binding by position
    // stays well-defined
    for input in inputs {
        for &n in input {
            ctx.get_op(n).ok_or(Error::BadNode)?;
            if visited.insert(n) {
                position.insert(n, position.len());
                nodes.push(Some(n));
            }
        }
    }

    Ok(SortedGraph { nodes, position })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parents_follow_children() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();

        let sorted =
            sort_graph(&ctx, &[vec![x], vec![y]], &[vec![z]]).unwrap();
        for n in sorted.nodes.iter().flatten() {
            let p = sorted.position[n];
            for child in ctx.get_op(*n).unwrap().iter_children() {
                assert!(sorted.position[&child] < p);
            }
        }
    }

    #[test]
    fn output_markers_and_shared_subgraphs() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let sq = ctx.square(x).unwrap();
        let a = ctx.add(sq, 1.0).unwrap();
        let b = ctx.mul(sq, 2.0).unwrap();

        let sorted =
            sort_graph(&ctx, &[vec![x]], &[vec![a, b]]).unwrap();
        let markers =
            sorted.nodes.iter().filter(|n| n.is_none()).count();
        assert_eq!(markers, 2);
        // The shared square appears exactly once
        let squares = sorted
            .nodes
            .iter()
            .flatten()
            .filter(|&&n| n == sq)
            .count();
        assert_eq!(squares, 1);
    }

    #[test]
    fn unused_inputs_are_appended() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let z = ctx.sin(x).unwrap();

        let sorted =
            sort_graph(&ctx, &[vec![x], vec![y]], &[vec![z]]).unwrap();
        assert!(sorted.position.contains_key(&y));
        assert_eq!(sorted.nodes.last(), Some(&Some(y)));
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let mut n = x;
        for _ in 0..100_000 {
            n = ctx.add(n, 1.0).unwrap();
        }
        let sorted = sort_graph(&ctx, &[vec![x]], &[vec![n]]).unwrap();
        // x, the shared constant 1.0, and one node per addition
        assert_eq!(sorted.position.len(), 100_002);
    }
}
