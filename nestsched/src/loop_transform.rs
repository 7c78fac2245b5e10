// loop_transform.rs — split, fuse, reorder
//
// Preconditions: ids are live loop srefs.
// Postconditions: the iteration order of every block instance is preserved;
//                 loops named by the caller survive with their srefs except
//                 where the transform replaces them (split, fuse).
// Failure modes: `ScheduleError` S02xx naming the first violated condition.
// Side effects: one `replace` per successful call.

use std::collections::HashSet;
use std::sync::Arc;

use crate::arith::{self, VarMap};
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::printer;
use crate::state::{map_blocks, ScheduleState};

// ── Shared checks ───────────────────────────────────────────────────────────

/// A serial loop starting at 0 with no annotations.
pub(crate) fn check_plain_loop(l: &Loop, primitive: &'static str) -> ScheduleResult<()> {
    if l.min != Expr::Int(0) {
        return Err(ScheduleError::new(
            codes::S0203,
            primitive,
            format!(
                "loop `{}` starts at {}, not 0",
                l.loop_var.name,
                printer::expr_script(&l.min)
            ),
        ));
    }
    if l.kind != ForKind::Serial || !l.annotations.is_empty() {
        return Err(ScheduleError::new(
            codes::S0202,
            primitive,
            format!(
                "loop `{}` is {} or carries annotations",
                l.loop_var.name,
                l.kind.name()
            ),
        )
        .with_hint("transform loops before binding or annotating them"));
    }
    Ok(())
}

pub(crate) fn check_distinct(ids: &[SRefId], primitive: &'static str) -> ScheduleResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(*id) {
            return Err(ScheduleError::new(
                codes::S0207,
                primitive,
                "the same loop is given more than once",
            ));
        }
    }
    Ok(())
}

// ── split ───────────────────────────────────────────────────────────────────

/// Split a loop into one nested loop per factor, outer to inner. At most one
/// factor may be `None`; it is inferred as `ceil(extent / product(others))`.
pub fn split(
    state: &mut ScheduleState,
    loop_sref: SRefId,
    factors: &[Option<Expr>],
) -> ScheduleResult<Vec<SRefId>> {
    const NAME: &str = "split";
    let l = state.loop_(loop_sref).clone();
    check_plain_loop(&l, NAME)?;
    if factors.is_empty() {
        return Err(ScheduleError::new(codes::S0201, NAME, "no factors given"));
    }
    if factors.iter().filter(|f| f.is_none()).count() > 1 {
        return Err(ScheduleError::new(
            codes::S0201,
            NAME,
            "at most one factor may be None",
        ));
    }
    for f in factors.iter().flatten() {
        if let Some(v) = f.as_int() {
            if v <= 0 {
                return Err(ScheduleError::new(
                    codes::S0201,
                    NAME,
                    format!("factors must be positive, got {}", v),
                ));
            }
        }
    }

    factors
        .iter()
        .flatten()
        .filter_map(Expr::as_int)
        .try_fold(1i64, |acc, v| acc.checked_mul(v))
        .ok_or_else(|| ScheduleError::new(codes::S0201, NAME, "factors multiply past the 64-bit range"))?;
    let constants: Option<Vec<i64>> = factors.iter().map(|f| f.as_ref().and_then(Expr::as_int)).collect();
    if let (Some(cs), Some(e)) = (constants, l.extent.as_int()) {
        // Inner factors are bounded by the checked product above.
        let inner: i64 = cs[1..].iter().product();
        let needed = (e - 1) / inner + 1;
        if cs[0] > needed {
            return Err(ScheduleError::new(
                codes::S0201,
                NAME,
                format!(
                    "outermost factor {} exceeds the {} iterations the extent {} needs",
                    cs[0], needed, e
                ),
            ));
        }
    }

    let given = arith::product(factors.iter().flatten().cloned());
    let resolved: Vec<Expr> = factors
        .iter()
        .map(|f| match f {
            Some(e) => e.clone(),
            None => arith::ceildiv(l.extent.clone(), given.clone()),
        })
        .collect();
    let total = arith::product(resolved.iter().cloned());
    let needs_guard = match (total.as_int(), l.extent.as_int()) {
        (Some(t), Some(e)) if t < e => {
            return Err(ScheduleError::new(
                codes::S0201,
                NAME,
                format!("factors multiply to {}, less than the extent {}", t, e),
            ))
        }
        (Some(t), Some(e)) => t != e,
        _ => total != l.extent,
    };

    let n = resolved.len();
    let new_vars: Vec<Var> = (0..n)
        .map(|k| Var::new(format!("{}_{}", l.loop_var.name, k)))
        .collect();
    let mut fused = Expr::Int(0);
    let mut stride = Expr::Int(1);
    for k in (0..n).rev() {
        fused = arith::add(arith::mul(Expr::var(&new_vars[k]), stride.clone()), fused);
        stride = arith::mul(stride, resolved[k].clone());
    }

    let map: VarMap = [(l.loop_var.clone(), fused.clone())].into_iter().collect();
    let mut body = arith::substitute_stmt(&l.body, &map);
    if needs_guard {
        let guard = arith::lt(fused, l.extent.clone());
        body = map_blocks(&body, &mut |_, br| {
            Some(BlockRealize {
                predicate: arith::and(br.predicate.clone(), guard.clone()),
                ..br.clone()
            })
        });
    }

    let mut loops: Vec<Arc<Stmt>> = Vec::with_capacity(n);
    let mut cur = body;
    for k in (0..n).rev() {
        cur = Arc::new(Stmt::Loop(Loop::serial(
            new_vars[k].clone(),
            resolved[k].clone(),
            cur,
        )));
        loops.push(cur.clone());
    }
    loops.reverse();
    state.replace(loop_sref, cur);
    Ok(loops.iter().map(|s| state.sref_of(s)).collect())
}

// ── fuse ────────────────────────────────────────────────────────────────────

/// Fuse a single-child chain of loops, outer to inner, into one loop.
pub fn fuse(state: &mut ScheduleState, loop_srefs: &[SRefId]) -> ScheduleResult<SRefId> {
    const NAME: &str = "fuse";
    if loop_srefs.is_empty() {
        return Err(ScheduleError::new(codes::S0204, NAME, "no loops given"));
    }
    check_distinct(loop_srefs, NAME)?;
    let loops: Vec<Loop> = loop_srefs.iter().map(|&id| state.loop_(id).clone()).collect();
    for l in &loops {
        check_plain_loop(l, NAME)?;
    }
    for k in 1..loops.len() {
        let chained = state.parent(loop_srefs[k]) == Some(loop_srefs[k - 1])
            && Arc::ptr_eq(&loops[k - 1].body, &state.stmt(loop_srefs[k]));
        if !chained {
            return Err(ScheduleError::new(
                codes::S0204,
                NAME,
                format!(
                    "`{}` is not the only child of `{}`",
                    loops[k].loop_var.name,
                    loops[k - 1].loop_var.name
                ),
            )
            .with_hint("loops must be given outer to inner and form a single-child chain"));
        }
    }
    for (k, l) in loops.iter().enumerate() {
        for (j, other) in loops.iter().enumerate() {
            if j != k && (l.extent.uses_var(&other.loop_var) || l.min.uses_var(&other.loop_var)) {
                return Err(ScheduleError::new(
                    codes::S0205,
                    NAME,
                    format!(
                        "the extent of `{}` depends on `{}`",
                        l.loop_var.name, other.loop_var.name
                    ),
                ));
            }
        }
    }

    let names: Vec<&str> = loops.iter().map(|l| &*l.loop_var.name).collect();
    let fused = Var::new(format!("{}_fused", names.join("_")));
    let extents: Vec<Expr> = loops.iter().map(|l| l.extent.clone()).collect();
    let mut map = VarMap::new();
    for (k, l) in loops.iter().enumerate() {
        let inner = arith::product(extents[k + 1..].iter().cloned());
        let mut e = arith::floordiv(Expr::var(&fused), inner);
        if k > 0 {
            e = arith::floormod(e, extents[k].clone());
        }
        map.insert(l.loop_var.clone(), e);
    }
    let innermost = &loops[loops.len() - 1];
    let body = arith::substitute_stmt(&innermost.body, &map);
    let new_loop = Arc::new(Stmt::Loop(Loop::serial(
        fused,
        arith::product(extents),
        body,
    )));
    state.replace(loop_srefs[0], new_loop.clone());
    Ok(state.sref_of(&new_loop))
}

// ── reorder ─────────────────────────────────────────────────────────────────

/// Reorder loops of one single-child chain into the given order. Loops of the
/// chain that are not named keep their positions.
pub fn reorder(state: &mut ScheduleState, order: &[SRefId]) -> ScheduleResult<()> {
    const NAME: &str = "reorder";
    check_distinct(order, NAME)?;
    if order.len() < 2 {
        return Ok(());
    }
    let mut by_depth = order.to_vec();
    by_depth.sort_by_key(|&id| state.tree().ancestors(id).len());
    for w in by_depth.windows(2) {
        if !state.is_ancestor(w[0], w[1]) {
            return Err(ScheduleError::new(
                codes::S0206,
                NAME,
                "the loops are not on one ancestor chain",
            ));
        }
    }
    let top = by_depth[0];
    let bottom = by_depth[by_depth.len() - 1];

    let mut chain = vec![bottom];
    let mut cur = bottom;
    while cur != top {
        let Some(p) = state.parent(cur) else {
            break;
        };
        let single_child = match state.stmt(p).as_ref() {
            Stmt::Loop(l) => Arc::ptr_eq(&l.body, &state.stmt(cur)),
            _ => false,
        };
        if !single_child {
            return Err(ScheduleError::new(
                codes::S0206,
                NAME,
                "the loops are not connected through single-child loops",
            ));
        }
        chain.push(p);
        cur = p;
    }
    chain.reverse();

    if let Some(scope) = state.scope_root(top) {
        let info = state.scope_info(scope);
        for b in state.child_blocks(bottom) {
            let br = state.block(b);
            let opaque = br.block.iter_vars.iter().any(|iv| iv.kind == IterKind::Opaque);
            if !info.is_affine(b) || opaque {
                return Err(ScheduleError::new(
                    codes::S0208,
                    NAME,
                    format!(
                        "block `{}` has non-affine bindings or opaque iterators",
                        br.block.name
                    ),
                ));
            }
        }
    }

    let mut new_chain = chain.clone();
    let mut slot = 0;
    for (pos, id) in chain.iter().enumerate() {
        if order.contains(id) {
            new_chain[pos] = order[slot];
            slot += 1;
        }
    }

    for (i, &outer) in new_chain.iter().enumerate() {
        let ol = state.loop_(outer);
        for &inner in &new_chain[i + 1..] {
            let var = &state.loop_(inner).loop_var;
            if ol.extent.uses_var(var) || ol.min.uses_var(var) {
                return Err(ScheduleError::new(
                    codes::S0205,
                    NAME,
                    format!(
                        "the extent of `{}` would depend on the inner loop `{}`",
                        ol.loop_var.name, var.name
                    ),
                ));
            }
        }
    }

    let mut stmt = state.loop_(bottom).body.clone();
    for &id in new_chain.iter().rev() {
        stmt = Arc::new(Stmt::Loop(state.loop_(id).with_body(stmt)));
    }
    state.replace(top, stmt);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DebugMask;
    use crate::workload;

    fn loops_of(state: &ScheduleState, block: &str) -> Vec<SRefId> {
        let b = crate::lookup::get_block(state, block).unwrap();
        state.loops_above(b)
    }

    #[test]
    fn split_exact_has_no_guard() {
        let p = workload::scale_1d(128);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let i = loops_of(&state, "B")[0];
        let out = split(&mut state, i, &[Some(Expr::Int(2)), Some(Expr::Int(64))]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(state.loop_(out[0]).extent, Expr::Int(2));
        assert_eq!(state.loop_(out[1]).extent, Expr::Int(64));
        assert!(!state.tree().is_live(i));
        let b = crate::lookup::get_block(&state, "B").unwrap();
        assert!(state.block(b).predicate.is_true());
    }

    #[test]
    fn split_infers_factor_and_guards() {
        let p = workload::scale_1d(10);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let i = loops_of(&state, "B")[0];
        let out = split(&mut state, i, &[None, Some(Expr::Int(4))]).unwrap();
        assert_eq!(state.loop_(out[0]).extent, Expr::Int(3));
        let b = crate::lookup::get_block(&state, "B").unwrap();
        assert!(!state.block(b).predicate.is_true());
    }

    #[test]
    fn split_rejects_bad_factors() {
        let p = workload::scale_1d(16);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let i = loops_of(&state, "B")[0];
        let e = split(&mut state, i, &[None, None]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        let e = split(&mut state, i, &[Some(Expr::Int(0)), None]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        let e = split(&mut state, i, &[Some(Expr::Int(2)), Some(Expr::Int(4))]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        assert!(state.tree().is_live(i));
    }

    #[test]
    fn split_rejects_oversized_factors() {
        let p = workload::scale_1d(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let i = loops_of(&state, "B")[0];
        let huge = Some(Expr::Int(1 << 62));
        let e = split(&mut state, i, &[huge.clone(), Some(Expr::Int(4))]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        let e = split(&mut state, i, &[None, huge, Some(Expr::Int(4))]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        let e = split(&mut state, i, &[Some(Expr::Int(3)), Some(Expr::Int(4))]).unwrap_err();
        assert_eq!(e.code, codes::S0201);
        assert!(state.tree().is_live(i));
        // A guarded split whose outer loop is fully used is still accepted.
        let out = split(&mut state, i, &[Some(Expr::Int(2)), Some(Expr::Int(5))]).unwrap();
        assert_eq!(state.loop_(out[0]).extent, Expr::Int(2));
    }

    #[test]
    fn fuse_requires_chain_order() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let ls = loops_of(&state, "B");
        let e = fuse(&mut state, &[ls[1], ls[0]]).unwrap_err();
        assert_eq!(e.code, codes::S0204);
        let f = fuse(&mut state, &ls).unwrap();
        assert_eq!(state.loop_(f).extent, Expr::Int(64));
        assert_eq!(&*state.loop_(f).loop_var.name, "i_j_fused");
    }

    #[test]
    fn reorder_swaps_and_keeps_srefs() {
        let p = workload::matmul(4, 4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let ls = loops_of(&state, "C");
        reorder(&mut state, &[ls[2], ls[0]]).unwrap();
        let now = loops_of(&state, "C");
        assert_eq!(now, vec![ls[2], ls[1], ls[0]]);
        let e = reorder(&mut state, &[ls[0], ls[0]]).unwrap_err();
        assert_eq!(e.code, codes::S0207);
    }
}
