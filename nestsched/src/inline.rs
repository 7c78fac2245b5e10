// inline.rs — compute_inline, reverse_compute_inline
//
// Preconditions: `block` is a live block sref below some scope.
// Postconditions: the inlined block, its loops and its buffer allocation are
//                 gone; their srefs are retired.
// Failure modes: S0601-S0604, S0504.
// Side effects: one `replace` of the scope root.

use std::collections::HashSet;
use std::sync::Arc;

use crate::arith::{self, VarMap};
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::{map_scope_blocks, splice, with_alloc, ScheduleState};

// ── Shape checks ────────────────────────────────────────────────────────────

/// The body store of a block made of one store and nothing else.
fn single_store(block: &Block) -> Option<&BufferStore> {
    if block.init.is_some() || block.writes.len() != 1 {
        return None;
    }
    match block.body.as_ref() {
        Stmt::Store(st) => Some(st),
        _ => None,
    }
}

/// `indices` as pairwise-distinct iterators of `block`.
fn iter_indices(block: &Block, indices: &[Expr]) -> Option<Vec<Var>> {
    let mut out: Vec<Var> = Vec::with_capacity(indices.len());
    for idx in indices {
        let v = idx.as_var()?;
        block.iter_kind_of(v)?;
        if out.contains(v) {
            return None;
        }
        out.push(v.clone());
    }
    Some(out)
}

fn iter_dom<'a>(block: &'a Block, var: &Var) -> Option<&'a Range> {
    block.iter_vars.iter().find(|iv| &iv.var == var).map(|iv| &iv.dom)
}

fn store_vars(st: &BufferStore) -> HashSet<Var> {
    let mut vars = HashSet::new();
    for idx in &st.indices {
        vars.extend(idx.free_vars());
    }
    vars.extend(st.value.free_vars());
    vars
}

/// Replace every load of `buffer` in `e` with `value`, where `params` are
/// the store indices `value` is written over.
fn inline_loads(e: &Expr, buffer: &Buffer, params: &[Var], value: &Expr) -> Expr {
    e.rewrite(&mut |node| match node {
        Expr::Load(load) if &load.buffer == buffer => {
            let map: VarMap = params.iter().cloned().zip(load.indices).collect();
            arith::substitute(value, &map)
        }
        other => other,
    })
}

/// Rewrite loads of `buffer` throughout a subtree, re-inferring regions of
/// every leaf block that changed.
fn inline_stmt(stmt: &Arc<Stmt>, buffer: &Buffer, params: &[Var], value: &Expr) -> Arc<Stmt> {
    Arc::new(match stmt.as_ref() {
        Stmt::Loop(l) => Stmt::Loop(l.with_body(inline_stmt(&l.body, buffer, params, value))),
        Stmt::Block(br) => {
            let block = Block {
                init: br
                    .block
                    .init
                    .as_ref()
                    .map(|s| inline_stmt(s, buffer, params, value)),
                body: inline_stmt(&br.block.body, buffer, params, value),
                ..br.block.clone()
            };
            Stmt::Block(br.with_block(arith::with_inferred_regions(block)))
        }
        Stmt::Seq(items) => Stmt::Seq(
            items
                .iter()
                .map(|s| inline_stmt(s, buffer, params, value))
                .collect(),
        ),
        Stmt::Store(st) => Stmt::Store(BufferStore {
            buffer: st.buffer.clone(),
            indices: st
                .indices
                .iter()
                .map(|i| inline_loads(i, buffer, params, value))
                .collect(),
            value: inline_loads(&st.value, buffer, params, value),
        }),
    })
}

fn reads_buffer(br: &BlockRealize, buffer: &Buffer) -> bool {
    br.block.reads.iter().any(|r| &r.buffer == buffer)
}

fn scope_of(state: &ScheduleState, block: SRefId, primitive: &'static str) -> ScheduleResult<SRefId> {
    state.scope_root(block).ok_or_else(|| {
        ScheduleError::new(codes::S0601, primitive, "the root block cannot be inlined")
    })
}

// ── compute_inline ──────────────────────────────────────────────────────────

/// Substitute the producer's value into every load of its buffer and drop
/// the producer.
pub fn compute_inline(state: &mut ScheduleState, block: SRefId) -> ScheduleResult<()> {
    const NAME: &str = "compute_inline";
    let scope = scope_of(state, block, NAME)?;
    let br = state.block(block).clone();
    let shape_err = || {
        ScheduleError::new(
            codes::S0601,
            NAME,
            format!(
                "block `{}` is not a single store indexed by distinct iterators",
                br.block.name
            ),
        )
    };
    let st = single_store(&br.block).ok_or_else(shape_err)?;
    let params = iter_indices(&br.block, &st.indices).ok_or_else(shape_err)?;
    if !st.value.free_vars().iter().all(|v| params.contains(v)) {
        return Err(shape_err()
            .with_hint("the stored value may only use the iterators that index the store"));
    }
    let info = state.scope_info(scope);
    if info.child_blocks.len() == 1 {
        return Err(ScheduleError::new(
            codes::S0504,
            NAME,
            "the block is the only leaf of its scope",
        ));
    }
    if !info.is_complete(block) {
        return Err(ScheduleError::new(
            codes::S0602,
            NAME,
            format!("block `{}` is not complete", br.block.name),
        ));
    }
    if !state.is_internal_buffer(&st.buffer) {
        return Err(ScheduleError::new(
            codes::S0604,
            NAME,
            format!("buffer `{}` is not an internal allocation", st.buffer.name),
        ));
    }

    let buffer = st.buffer.clone();
    let value = st.value.clone();
    let scope_stmt = state.stmt(scope);
    let removed = splice(&scope_stmt, &state.stmt(state.nest_root(block)), None);
    let rewritten = map_scope_blocks(&removed, &mut |s, b| {
        if reads_buffer(b, &buffer) {
            inline_stmt(s, &buffer, &params, &value).as_block().cloned()
        } else {
            None
        }
    });
    let new_scope = with_alloc(&rewritten, &buffer, false);
    state.replace(scope, new_scope);
    Ok(())
}

// ── reverse_compute_inline ──────────────────────────────────────────────────

/// Fold a consumer into its unique producer: the producer writes the
/// consumer's output directly and the consumer disappears.
pub fn reverse_compute_inline(state: &mut ScheduleState, block: SRefId) -> ScheduleResult<()> {
    const NAME: &str = "reverse_compute_inline";
    let scope = scope_of(state, block, NAME)?;
    let consumer = state.block(block).clone();
    let info = state.scope_info(scope);
    if info.child_blocks.len() == 1 {
        return Err(ScheduleError::new(
            codes::S0504,
            NAME,
            "the block is the only leaf of its scope",
        ));
    }
    let producers = info.producers(block);
    let [producer] = producers.as_slice() else {
        return Err(ScheduleError::new(
            codes::S0603,
            NAME,
            format!(
                "block `{}` has {} producers, expected exactly one",
                consumer.block.name,
                producers.len()
            ),
        ));
    };
    let producer = *producer;
    let pr = state.block(producer).clone();
    let producer_err = |why: &str| {
        ScheduleError::new(
            codes::S0603,
            NAME,
            format!("producer `{}` {}", pr.block.name, why),
        )
    };
    if !info.is_complete(producer) {
        return Err(producer_err("is not complete"));
    }
    let p_store = single_store(&pr.block).ok_or_else(|| producer_err("is not a single store"))?;
    let p_vars = iter_indices(&pr.block, &p_store.indices)
        .ok_or_else(|| producer_err("does not index its store with distinct iterators"))?;
    let inlined = p_store.buffer.clone();
    for &other in &info.child_blocks {
        if other != block && reads_buffer(state.block(other), &inlined) {
            return Err(producer_err("has readers other than this block"));
        }
    }

    let shape_err = || {
        ScheduleError::new(
            codes::S0601,
            NAME,
            format!(
                "block `{}` must load `{}` at the iterators it stores to",
                consumer.block.name, inlined.name
            ),
        )
    };
    let c_store = single_store(&consumer.block).ok_or_else(shape_err)?;
    let mut load_vars: Option<Vec<Var>> = None;
    let mut consistent = true;
    c_store.value.visit(&mut |e| {
        if let Expr::Load(load) = e {
            if load.buffer == inlined {
                let vs = iter_indices(&consumer.block, &load.indices);
                if vs.is_none() || (load_vars.is_some() && load_vars != vs) {
                    consistent = false;
                } else if load_vars.is_none() {
                    load_vars = vs;
                }
            }
        }
    });
    let load_vars = match load_vars {
        Some(vs) if consistent => vs,
        _ => return Err(shape_err()),
    };
    if !store_vars(c_store).iter().all(|v| load_vars.contains(v)) {
        return Err(shape_err());
    }
    // The producer runs over its whole domain, so the consumer must cover
    // exactly that domain in every dimension.
    for (cv, pv) in load_vars.iter().zip(&p_vars) {
        if iter_dom(&consumer.block, cv) != iter_dom(&pr.block, pv) {
            return Err(ScheduleError::new(
                codes::S0601,
                NAME,
                format!(
                    "block `{}` iterates `{}` over a different domain than producer `{}` iterates `{}`",
                    consumer.block.name, cv.name, pr.block.name, pv.name
                ),
            )
            .with_hint("the consumer must read every element the producer writes"));
        }
    }
    if !state.is_internal_buffer(&inlined) {
        return Err(ScheduleError::new(
            codes::S0604,
            NAME,
            format!("buffer `{}` is not an internal allocation", inlined.name),
        ));
    }

    // Consumer iterators become producer iterators, dimension by dimension.
    let rename: VarMap = load_vars
        .iter()
        .cloned()
        .zip(p_vars.iter().map(Expr::var))
        .collect();
    let folded = inline_loads(&c_store.value, &inlined, &p_vars, &p_store.value);
    let new_store = BufferStore {
        buffer: c_store.buffer.clone(),
        indices: c_store
            .indices
            .iter()
            .map(|i| arith::substitute(i, &rename))
            .collect(),
        value: arith::substitute(&folded, &rename),
    };
    let new_producer = Arc::new(Stmt::Block(pr.with_block(arith::with_inferred_regions(Block {
        body: Arc::new(Stmt::Store(new_store)),
        ..pr.block.clone()
    }))));

    let scope_stmt = state.stmt(scope);
    let swapped = splice(&scope_stmt, &state.stmt(producer), Some(new_producer));
    let removed = splice(&swapped, &state.stmt(state.nest_root(block)), None);
    let new_scope = with_alloc(&removed, &inlined, false);
    state.replace(scope, new_scope);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::get_block;
    use crate::printer;
    use crate::state::DebugMask;
    use crate::workload;

    #[test]
    fn compute_inline_folds_producer() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        compute_inline(&mut state, b).unwrap();
        assert!(!state.tree().is_live(b));
        assert_eq!(get_block(&state, "B").unwrap_err().code, codes::S0004);
        let c = get_block(&state, "C").unwrap();
        let body = printer::stmt_script(&state.block(c).block.body);
        assert_eq!(body, "C[vi, vj] = (A[vi, vj] * 2.0) + 1.0\n");
        assert!(state.program().root_block().alloc_buffers.is_empty());
    }

    #[test]
    fn compute_inline_rejects_outputs_and_reductions() {
        let p = workload::norm_chain(4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        assert_eq!(compute_inline(&mut state, c).unwrap_err().code, codes::S0601);
        let d = get_block(&state, "D").unwrap();
        assert_eq!(compute_inline(&mut state, d).unwrap_err().code, codes::S0604);
    }

    #[test]
    fn reverse_compute_inline_folds_consumer() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        reverse_compute_inline(&mut state, c).unwrap();
        assert!(!state.tree().is_live(c));
        assert!(state.tree().is_live(b));
        assert_eq!(state.block(b).block.writes[0].buffer.name, "C");
    }

    /// `B[i] = A[i] * 2` for `i < 8`, then `C[i] = B[i] + 1` for `i < 4`.
    fn partial_consumer() -> Program {
        let a = Buffer::new("A", vec![8], DType::Float32);
        let b = Buffer::new("B", vec![8], DType::Float32);
        let c = Buffer::new("C", vec![4], DType::Float32);
        let stage_b = workload::grid_block("B", &[("i", 8, IterKind::DataPar)], |v| {
            let idx = v.to_vec();
            (None, workload::store(&b, idx.clone(), Expr::load(&a, idx) * Expr::Float(2.0)))
        });
        let stage_c = workload::grid_block("C", &[("i", 4, IterKind::DataPar)], |v| {
            let idx = v.to_vec();
            (None, workload::store(&c, idx.clone(), Expr::load(&b, idx) + Expr::Float(1.0)))
        });
        Program::new("partial_consumer", vec![a, c], vec![b], seq(vec![stage_b, stage_c]))
    }

    #[test]
    fn reverse_compute_inline_rejects_partial_consumer() {
        let p = partial_consumer();
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        let err = reverse_compute_inline(&mut state, c).unwrap_err();
        assert_eq!(err.code, codes::S0601);
        assert!(state.tree().is_live(c));
        assert_eq!(printer::script(state.program()), printer::script(&p));
    }

    #[test]
    fn sole_leaf_rejected() {
        let p = workload::scale_1d(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        assert_eq!(compute_inline(&mut state, b).unwrap_err().code, codes::S0504);
    }
}
