//! Work-vector slot assignment for instruction tapes
use super::tape::TapeOp;

/// Assigns work-vector slots to a tape whose operands are still node
/// positions, rewriting the tape in place and returning the work vector size.
///
/// With `live_variables` enabled, a slot is returned to a free stack at the
/// last use of its value and may be reused by later instructions.  Arguments
/// are released in reverse order so that the first argument's slot ends up on
/// top of the stack, which makes unary chains and accumulations run in place.
/// With `live_variables` disabled every node keeps a private slot.
pub(crate) fn allocate(
    ops: &mut [TapeOp],
    node_count: usize,
    live_variables: bool,
) -> usize {
    let mut refcount = vec![0usize; node_count];
    for op in ops.iter() {
        match op {
            TapeOp::Unary { arg, .. } => refcount[*arg] += 1,
            TapeOp::Binary { lhs, rhs, .. } => {
                refcount[*lhs] += 1;
                refcount[*rhs] += 1;
            }
            TapeOp::Output { src, .. } => refcount[*src] += 1,
            TapeOp::Input { .. }
            | TapeOp::Const { .. }
            | TapeOp::Param { .. } => (),
        }
    }

    let mut place = vec![usize::MAX; node_count];
    let mut unused: Vec<usize> = vec![];
    let mut worksize = 0usize;

    let release = |pos: usize,
                   refcount: &mut Vec<usize>,
                   unused: &mut Vec<usize>,
                   place: &[usize]| {
        refcount[pos] -= 1;
        if refcount[pos] == 0 && live_variables {
            unused.push(place[pos]);
        }
    };
    let mut alloc_slot = |unused: &mut Vec<usize>| -> usize {
        if live_variables {
            if let Some(slot) = unused.pop() {
                return slot;
            }
        }
        let slot = worksize;
        worksize += 1;
        slot
    };

    for op in ops.iter_mut() {
        match op {
            TapeOp::Input { dst, .. }
            | TapeOp::Const { dst, .. }
            | TapeOp::Param { dst, .. } => {
                place[*dst] = alloc_slot(&mut unused);
                *dst = place[*dst];
            }
            TapeOp::Unary { dst, arg, .. } => {
                let a = *arg;
                release(a, &mut refcount, &mut unused, &place);
                place[*dst] = alloc_slot(&mut unused);
                let d = place[*dst];
                *dst = d;
                *arg = place[a];
            }
            TapeOp::Binary { dst, lhs, rhs, .. } => {
                let (a, b) = (*lhs, *rhs);
                release(b, &mut refcount, &mut unused, &place);
                release(a, &mut refcount, &mut unused, &place);
                place[*dst] = alloc_slot(&mut unused);
                let d = place[*dst];
                *dst = d;
                *lhs = place[a];
                *rhs = place[b];
            }
            TapeOp::Output { src, .. } => {
                let s = *src;
                release(s, &mut refcount, &mut unused, &place);
                *src = place[s];
            }
        }
    }
    worksize
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::UnaryOpcode;

    fn sin_chain(n: usize) -> Vec<TapeOp> {
        let mut ops = vec![TapeOp::Input {
            dst: 0,
            arg: 0,
            offset: 0,
        }];
        for i in 1..=n {
            ops.push(TapeOp::Unary {
                dst: i,
                op: UnaryOpcode::Sin,
                arg: i - 1,
            });
        }
        ops.push(TapeOp::Output {
            out: 0,
            offset: 0,
            src: n,
        });
        ops
    }

    #[test]
    fn chain_runs_in_place() {
        let mut ops = sin_chain(100);
        let worksize = allocate(&mut ops, 101, true);
        assert_eq!(worksize, 1);
        for op in &ops {
            match op {
                TapeOp::Unary { dst, arg, .. } => {
                    assert_eq!(*dst, 0);
                    assert_eq!(*arg, 0);
                }
                TapeOp::Input { dst, .. } => assert_eq!(*dst, 0),
                TapeOp::Output { src, .. } => assert_eq!(*src, 0),
                _ => panic!("unexpected op"),
            }
        }
    }

    #[test]
    fn chain_without_reuse() {
        let mut ops = sin_chain(100);
        let worksize = allocate(&mut ops, 101, false);
        assert_eq!(worksize, 101);
    }

    #[test]
    fn binary_reuses_first_argument() {
        use crate::context::BinaryOpcode;
        let mut ops = vec![
            TapeOp::Input {
                dst: 0,
                arg: 0,
                offset: 0,
            },
            TapeOp::Input {
                dst: 1,
                arg: 1,
                offset: 0,
            },
            TapeOp::Binary {
                dst: 2,
                op: BinaryOpcode::Mul,
                lhs: 0,
                rhs: 1,
            },
            TapeOp::Output {
                out: 0,
                offset: 0,
                src: 2,
            },
        ];
        let worksize = allocate(&mut ops, 3, true);
        assert_eq!(worksize, 2);
        match ops[2] {
            TapeOp::Binary { dst, lhs, .. } => assert_eq!(dst, lhs),
            _ => panic!("expected binary op"),
        }
    }
}
