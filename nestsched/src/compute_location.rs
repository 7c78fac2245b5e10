// compute_location.rs — compute_at, reverse_compute_at
//
// Moves a block's loop nest under a loop of another nest. The new nest
// covers exactly the region its consumers (resp. producers) touch per
// iteration of the target loop, found by relaxing every loop between the
// target loop and the dependent blocks.
//
// Preconditions: `block` is a live block sref, `loop_sref` a live loop sref.
// Postconditions: the block keeps its sref; its old loops are retired.
// Failure modes: S0501-S0507 naming the first violated condition.
// Side effects: one `replace` of the scope root.

use std::collections::HashMap;
use std::sync::Arc;

use crate::arith::{self, IndexBound};
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::{splice, ScheduleState};

/// Per-dimension requirement accumulated across accesses.
#[derive(Debug, Clone)]
pub(crate) enum Need {
    Unset,
    Known(IndexBound),
    Full,
}

impl Need {
    fn merge(self, b: Option<IndexBound>) -> Need {
        match (self, b) {
            (Need::Full, _) | (_, None) => Need::Full,
            (Need::Unset, Some(b)) => Need::Known(b),
            (Need::Known(a), Some(b)) => a.union(&b).map(Need::Known).unwrap_or(Need::Full),
        }
    }
}

/// Inclusive ranges of the loops strictly between `top` and `id`. `None` if
/// one of them has a symbolic domain.
pub(crate) fn loops_between(state: &ScheduleState, id: SRefId, top: SRefId) -> Option<HashMap<Var, (i64, i64)>> {
    let mut out = HashMap::new();
    for a in state.tree().ancestors(id) {
        if a == top {
            break;
        }
        if let Stmt::Loop(l) = state.stmt(a).as_ref() {
            let lo = l.min.as_int()?;
            let ext = l.extent.as_int()?;
            out.insert(l.loop_var.clone(), (lo, lo + ext - 1));
        }
    }
    Some(out)
}

/// Region of `buffers` touched by `others` per iteration of `loop_sref`:
/// read regions when `reads` is set, write regions otherwise.
pub(crate) fn required_region(
    state: &ScheduleState,
    loop_sref: SRefId,
    others: &[SRefId],
    buffers: &[Buffer],
    reads: bool,
) -> HashMap<Buffer, Vec<Need>> {
    let mut out: HashMap<Buffer, Vec<Need>> = HashMap::new();
    for &o in others {
        let br = state.block(o);
        let relaxed = loops_between(state, o, loop_sref);
        let bindings: arith::VarMap = br
            .block
            .iter_vars
            .iter()
            .zip(&br.iter_values)
            .map(|(iv, v)| (iv.var.clone(), v.clone()))
            .collect();
        let regions = if reads { &br.block.reads } else { &br.block.writes };
        for r in regions.iter().filter(|r| buffers.contains(&r.buffer)) {
            let dims = out
                .entry(r.buffer.clone())
                .or_insert_with(|| vec![Need::Unset; r.region.len()]);
            for (d, rg) in r.region.iter().enumerate() {
                let bound = relaxed.as_ref().and_then(|rx| {
                    let ext = rg.extent.as_int()?;
                    let min = arith::substitute(&rg.min, &bindings);
                    let mut b = arith::bound_index(&min, rx)?;
                    b.extent += ext - 1;
                    Some(b)
                });
                let prev = std::mem::replace(&mut dims[d], Need::Unset);
                dims[d] = prev.merge(bound);
            }
        }
    }
    out
}

fn buffers_of(regions: &[BufferRegion]) -> Vec<Buffer> {
    let mut out: Vec<Buffer> = Vec::new();
    for r in regions {
        if !out.contains(&r.buffer) {
            out.push(r.buffer.clone());
        }
    }
    out
}

/// Inclusive ranges of `loop_sref` and every loop above it in `scope`.
pub(crate) fn enclosing_ranges(
    state: &ScheduleState,
    loop_sref: SRefId,
    scope: SRefId,
) -> HashMap<Var, (i64, i64)> {
    let mut out = loops_between(state, loop_sref, scope).unwrap_or_default();
    let l = state.loop_(loop_sref);
    if let (Some(lo), Some(ext)) = (l.min.as_int(), l.extent.as_int()) {
        out.insert(l.loop_var.clone(), (lo, lo + ext - 1));
    }
    out
}

/// Bounds of the block iterators implied by the required region, read off
/// the block's own accesses, which must index with plain iterators.
fn iter_bounds(
    block: &Block,
    own: &[BufferRegion],
    need: &HashMap<Buffer, Vec<Need>>,
    primitive: &'static str,
) -> ScheduleResult<HashMap<Var, IndexBound>> {
    let mut out = HashMap::new();
    for r in own {
        let Some(dims) = need.get(&r.buffer) else {
            continue;
        };
        for (d, rg) in r.region.iter().enumerate() {
            let iv = rg
                .min
                .as_var()
                .filter(|v| block.iter_kind_of(v).is_some() && rg.extent == Expr::Int(1));
            let Some(iv) = iv else {
                return Err(ScheduleError::new(
                    codes::S0507,
                    primitive,
                    format!(
                        "block `{}` does not index `{}` with plain iterators",
                        block.name, r.buffer.name
                    ),
                ));
            };
            if let Some(Need::Known(b)) = dims.get(d) {
                out.entry(iv.clone()).or_insert_with(|| b.clone());
            }
        }
    }
    Ok(out)
}

/// Guard keeping `value` inside `dom`, given the range it can reach.
pub(crate) fn domain_guard(value: &Expr, dom: &Range, reach: Option<(i64, i64)>) -> Expr {
    let (Some(dmin), Some(dext)) = (dom.min.as_int(), dom.extent.as_int()) else {
        return Expr::Int(1);
    };
    let (need_lo, need_hi) = match reach {
        Some((lo, hi)) => (lo < dmin, hi >= dmin + dext),
        None => (true, true),
    };
    let mut guard = Expr::Int(1);
    if need_lo {
        guard = arith::and(guard, Expr::binary(BinOp::Le, Expr::Int(dmin), value.clone()));
    }
    if need_hi {
        guard = arith::and(guard, arith::lt(value.clone(), Expr::Int(dmin + dext)));
    }
    guard
}

fn compute_at_impl(
    state: &mut ScheduleState,
    block: SRefId,
    loop_sref: SRefId,
    preserve_unit_loops: bool,
    reverse: bool,
) -> ScheduleResult<()> {
    let primitive: &'static str = if reverse { "reverse_compute_at" } else { "compute_at" };
    let scope = match state.scope_root(block) {
        Some(s) if state.scope_root(loop_sref) == Some(s) => s,
        _ => {
            return Err(ScheduleError::new(
                codes::S0501,
                primitive,
                "the block and the loop are not in the same scope",
            ))
        }
    };
    if state.is_ancestor(loop_sref, block) {
        return Err(ScheduleError::new(
            codes::S0502,
            primitive,
            "the loop is an ancestor of the block",
        ));
    }
    let info = state.scope_info(scope);
    if !info.compact_dataflow {
        return Err(ScheduleError::new(
            codes::S0503,
            primitive,
            "the scope is not dataflow-compact",
        )
        .with_hint("every block in the scope must be complete or a reduction"));
    }
    if info.child_blocks.len() == 1 {
        return Err(ScheduleError::new(
            codes::S0504,
            primitive,
            "the block is the only leaf of its scope",
        ));
    }
    let name = state.block(block).block.name.clone();
    if !reverse && state.is_output_block(block) {
        return Err(ScheduleError::new(
            codes::S0505,
            primitive,
            format!("block `{}` writes a program output", name),
        ));
    }
    let deps = if reverse { info.producers(block) } else { info.consumers(block) };
    let role = if reverse { "producer" } else { "consumer" };
    if deps.is_empty() {
        return Err(ScheduleError::new(
            codes::S0506,
            primitive,
            format!("block `{}` has no {}s", name, role),
        ));
    }
    for &d in &deps {
        if !state.is_ancestor(loop_sref, d) {
            return Err(ScheduleError::new(
                codes::S0506,
                primitive,
                format!(
                    "{} `{}` is not under the target loop",
                    role,
                    state.block(d).block.name
                ),
            ));
        }
    }
    let removal = state.nest_root(block);
    if removal == loop_sref || state.is_ancestor(removal, loop_sref) {
        return Err(ScheduleError::new(
            codes::S0502,
            primitive,
            "the loop lies inside the nest being moved",
        ));
    }

    // Region the dependents touch per iteration of the loop.
    let br = state.block(block).clone();
    let (shared, own) = if reverse {
        let produced: Vec<Buffer> = deps
            .iter()
            .flat_map(|&d| buffers_of(&state.block(d).block.writes))
            .collect();
        let read: Vec<Buffer> = buffers_of(&br.block.reads)
            .into_iter()
            .filter(|b| produced.contains(b))
            .collect();
        let own: Vec<BufferRegion> = br
            .block
            .reads
            .iter()
            .filter(|r| read.contains(&r.buffer))
            .cloned()
            .collect();
        (read, own)
    } else {
        (buffers_of(&br.block.writes), br.block.writes.clone())
    };
    let need = required_region(state, loop_sref, &deps, &shared, !reverse);
    let bounds = iter_bounds(&br.block, &own, &need, primitive)?;

    // Ranges of the loop and everything above it, for the domain guard.
    let outer = enclosing_ranges(state, loop_sref, scope);

    // New nest.
    let mut loop_vars: Vec<(Var, i64)> = Vec::new();
    let mut values = Vec::with_capacity(br.block.iter_vars.len());
    let mut predicate = Expr::Int(1);
    for (k, iv) in br.block.iter_vars.iter().enumerate() {
        let (min, extent, guarded) = match bounds.get(&iv.var) {
            Some(b) => (b.min_expr(), b.extent, true),
            None => match iv.dom.extent.as_int() {
                Some(e) => (iv.dom.min.clone(), e, false),
                None => {
                    return Err(ScheduleError::new(
                        codes::S0507,
                        primitive,
                        format!("iterator `{}` has a symbolic domain", iv.var.name),
                    ))
                }
            },
        };
        let value = if extent == 1 && !preserve_unit_loops {
            min.clone()
        } else {
            let v = Var::new(format!("ax{}", k));
            let value = arith::add(Expr::var(&v), min.clone());
            loop_vars.push((v, extent));
            value
        };
        if guarded {
            let reach = arith::bound_index(&min, &outer)
                .filter(|b| b.base.terms.is_empty())
                .map(|b| (b.lo, b.lo + b.extent - 1 + extent - 1));
            predicate = arith::and(predicate, domain_guard(&value, &iv.dom, reach));
        }
        values.push(value);
    }
    let mut nest = Arc::new(Stmt::Block(BlockRealize {
        iter_values: values,
        predicate,
        block: br.block.clone(),
    }));
    for (v, extent) in loop_vars.into_iter().rev() {
        nest = Arc::new(Stmt::Loop(Loop::serial(v, extent, nest)));
    }

    // Splice out the old nest, then place the new one under the loop.
    let loop_stmt = state.stmt(loop_sref);
    let l = state.loop_(loop_sref).clone();
    let mut items = seq_items(&l.body);
    if reverse {
        items.push(nest);
    } else {
        items.insert(0, nest);
    }
    let new_loop = Arc::new(Stmt::Loop(l.with_body(seq(items))));
    let scope_stmt = state.stmt(scope);
    let removed = splice(&scope_stmt, &state.stmt(removal), None);
    let new_scope = splice(&removed, &loop_stmt, Some(new_loop));
    state.replace(scope, new_scope);
    Ok(())
}

/// Move a producer block under `loop_sref`, computing only what the
/// consumers below the loop read in one iteration. Placed first in the loop.
pub fn compute_at(
    state: &mut ScheduleState,
    block: SRefId,
    loop_sref: SRefId,
    preserve_unit_loops: bool,
) -> ScheduleResult<()> {
    compute_at_impl(state, block, loop_sref, preserve_unit_loops, false)
}

/// Move a consumer block under `loop_sref`, consuming what the producers
/// below the loop write in one iteration. Placed last in the loop.
pub fn reverse_compute_at(
    state: &mut ScheduleState,
    block: SRefId,
    loop_sref: SRefId,
    preserve_unit_loops: bool,
) -> ScheduleResult<()> {
    compute_at_impl(state, block, loop_sref, preserve_unit_loops, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{get_block, get_loops};
    use crate::state::DebugMask;
    use crate::workload;

    #[test]
    fn compute_at_inner_loop_drops_unit_loops() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        let c_loops = get_loops(&state, c);
        compute_at(&mut state, b, c_loops[1], false).unwrap();
        assert!(state.tree().is_live(b));
        assert_eq!(get_loops(&state, b), c_loops);
        assert!(state.block(b).predicate.is_true());
    }

    #[test]
    fn compute_at_outer_loop_keeps_inner_axis() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        let c_loops = get_loops(&state, c);
        compute_at(&mut state, b, c_loops[0], false).unwrap();
        let b_loops = get_loops(&state, b);
        assert_eq!(b_loops.len(), 2);
        assert_eq!(b_loops[0], c_loops[0]);
        assert_eq!(state.loop_(b_loops[1]).extent, Expr::Int(8));
    }

    #[test]
    fn preconditions() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        let b_loops = get_loops(&state, b);
        let c_loops = get_loops(&state, c);
        assert_eq!(compute_at(&mut state, b, b_loops[0], false).unwrap_err().code, codes::S0502);
        assert_eq!(compute_at(&mut state, c, b_loops[0], false).unwrap_err().code, codes::S0505);
        assert_eq!(reverse_compute_at(&mut state, b, c_loops[0], false).unwrap_err().code, codes::S0506);
    }

    #[test]
    fn reverse_compute_at_places_consumer_last() {
        let p = workload::norm_chain(4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        let d = get_block(&state, "D").unwrap();
        let i = get_loops(&state, c)[0];
        reverse_compute_at(&mut state, d, i, false).unwrap();
        assert_eq!(get_loops(&state, d), vec![i]);
        let children = state.children(i);
        assert_eq!(children.last(), Some(&d));
    }
}
