// reduction.rs — decompose_reduction, rfactor, reducer registry
//
// Preconditions: ids are live srefs of the kinds named by each primitive.
// Postconditions: program outputs are unchanged. decompose_reduction returns
//                 the new init block; rfactor returns the new rf block, and
//                 the original block's sref now names the write-back block.
// Failure modes: S0701-S0706.
// Side effects: one `replace` per successful call.

use std::collections::HashSet;
use std::sync::Arc;

use crate::arith::{self, VarMap};
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::{splice, with_alloc, ScheduleState};

// ── Reducers ────────────────────────────────────────────────────────────────

/// A commutative reducer: `acc = op(acc, x)` starting from `identity`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommReducer {
    pub name: String,
    pub op: BinOp,
    pub identity: f64,
}

impl CommReducer {
    pub fn new(name: impl Into<String>, op: BinOp, identity: f64) -> Self {
        Self {
            name: name.into(),
            op,
            identity,
        }
    }
}

/// sum, product, min, max.
pub fn default_reducers() -> Vec<CommReducer> {
    vec![
        CommReducer::new("sum", BinOp::Add, 0.0),
        CommReducer::new("product", BinOp::Mul, 1.0),
        CommReducer::new("min", BinOp::Min, f64::INFINITY),
        CommReducer::new("max", BinOp::Max, f64::NEG_INFINITY),
    ]
}

fn as_number(e: &Expr) -> Option<f64> {
    match e {
        Expr::Float(v) => Some(*v),
        Expr::Int(v) => Some(*v as f64),
        _ => None,
    }
}

fn loads_buffer(e: &Expr, buffer: &Buffer) -> bool {
    let mut found = false;
    e.visit(&mut |node| {
        if let Expr::Load(load) = node {
            if &load.buffer == buffer {
                found = true;
            }
        }
    });
    found
}

/// A reduction body `B[idx] = op(B[idx], rhs)` with init `B[idx] = identity`,
/// matched against the registry.
struct ReductionForm {
    reducer: CommReducer,
    buffer: Buffer,
    indices: Vec<Expr>,
    rhs: Expr,
}

fn match_reduction(block: &Block, reducers: &[CommReducer]) -> Option<ReductionForm> {
    let Stmt::Store(body) = block.body.as_ref() else {
        return None;
    };
    let Stmt::Store(init) = block.init.as_ref()?.as_ref() else {
        return None;
    };
    if init.buffer != body.buffer || init.indices != body.indices {
        return None;
    }
    let Expr::Binary(op, a, b) = &body.value else {
        return None;
    };
    let acc = Expr::load(&body.buffer, body.indices.clone());
    let rhs = if **a == acc && !loads_buffer(b, &body.buffer) {
        (**b).clone()
    } else if **b == acc && !loads_buffer(a, &body.buffer) {
        (**a).clone()
    } else {
        return None;
    };
    let identity = as_number(&init.value)?;
    let reducer = reducers
        .iter()
        .find(|r| r.op == *op && r.identity == identity)?
        .clone();
    Some(ReductionForm {
        reducer,
        buffer: body.buffer.clone(),
        indices: body.indices.clone(),
        rhs,
    })
}

/// Conjuncts of `pred` that mention none of `dropped`.
fn restrict_predicate(pred: &Expr, dropped: &HashSet<Var>) -> Expr {
    match pred {
        Expr::Binary(BinOp::And, a, b) => {
            arith::and(restrict_predicate(a, dropped), restrict_predicate(b, dropped))
        }
        _ if pred.free_vars().iter().any(|v| dropped.contains(v)) => Expr::Int(1),
        _ => pred.clone(),
    }
}

// ── decompose_reduction ─────────────────────────────────────────────────────

/// Hoist the init of a reduction block into its own block placed before
/// `loop_sref`, looping only over the data-parallel loops at or below it.
pub fn decompose_reduction(
    state: &mut ScheduleState,
    block: SRefId,
    loop_sref: SRefId,
) -> ScheduleResult<SRefId> {
    const NAME: &str = "decompose_reduction";
    let br = state.block(block).clone();
    let Some(init) = br.block.init.clone() else {
        return Err(ScheduleError::new(
            codes::S0701,
            NAME,
            format!("block `{}` has no init", br.block.name),
        ));
    };
    let scope = state.scope_root(block);
    let is_reduction = match scope {
        Some(s) => state.scope_info(s).is_reduction(block),
        None => false,
    };
    if !is_reduction {
        return Err(ScheduleError::new(
            codes::S0701,
            NAME,
            format!("block `{}` is not a reduction", br.block.name),
        ));
    }
    let loops = state.loops_above(block);
    let Some(pos) = loops.iter().position(|&l| l == loop_sref) else {
        return Err(ScheduleError::new(
            codes::S0702,
            NAME,
            "the loop is not an ancestor of the block within its scope",
        ));
    };
    let pairs: Vec<(&IterVar, &Expr)> = br.block.iter_vars.iter().zip(&br.iter_values).collect();
    for &l in &loops[..pos] {
        let var = &state.loop_(l).loop_var;
        let bad = pairs
            .iter()
            .any(|(iv, v)| iv.kind == IterKind::CommReduce && v.uses_var(var));
        if bad {
            return Err(ScheduleError::new(
                codes::S0703,
                NAME,
                format!("loop `{}` drives a reduction iterator", var.name),
            )
            .with_hint("decompose at the outermost reduction loop or above it"));
        }
    }

    // Loops at or below `loop_sref` that drive data-parallel iterators.
    let mut var_map = VarMap::new();
    let mut cloned: Vec<Loop> = Vec::new();
    let mut dropped = HashSet::new();
    for &l in &loops[pos..] {
        let lp = state.loop_(l);
        let data_par = pairs
            .iter()
            .any(|(iv, v)| iv.kind == IterKind::DataPar && v.uses_var(&lp.loop_var));
        if data_par {
            let fresh = lp.loop_var.fresh();
            var_map.insert(lp.loop_var.clone(), Expr::var(&fresh));
            cloned.push(Loop {
                loop_var: fresh,
                ..lp.clone()
            });
        } else {
            dropped.insert(lp.loop_var.clone());
        }
    }

    let mut iter_map = VarMap::new();
    let mut iter_vars = Vec::new();
    let mut values = Vec::new();
    for (iv, v) in &pairs {
        if iv.kind != IterKind::DataPar {
            continue;
        }
        let fresh = iv.var.fresh();
        iter_map.insert(iv.var.clone(), Expr::var(&fresh));
        iter_vars.push(IterVar {
            var: fresh,
            dom: iv.dom.clone(),
            kind: IterKind::DataPar,
        });
        values.push(arith::substitute(v, &var_map));
    }
    let init_name = state
        .program()
        .unique_block_name(&format!("{}_init", br.block.name));
    let init_block = arith::with_inferred_regions(Block {
        name: init_name.clone(),
        iter_vars,
        reads: Vec::new(),
        writes: Vec::new(),
        alloc_buffers: Vec::new(),
        init: None,
        body: arith::substitute_stmt(&init, &iter_map),
        annotations: Annotations::new(),
    });
    let predicate = arith::substitute(&restrict_predicate(&br.predicate, &dropped), &var_map);
    let mut init_nest = Arc::new(Stmt::Block(BlockRealize {
        iter_values: values,
        predicate,
        block: init_block,
    }));
    for l in cloned.into_iter().rev() {
        let extent = arith::substitute(&l.extent, &var_map);
        let min = arith::substitute(&l.min, &var_map);
        init_nest = Arc::new(Stmt::Loop(Loop {
            min,
            extent,
            body: init_nest,
            ..l
        }));
    }

    let update = Arc::new(Stmt::Block(br.with_block(Block {
        init: None,
        ..br.block.clone()
    })));
    let loop_stmt = state.stmt(loop_sref);
    let new_loop = splice(&loop_stmt, &state.stmt(block), Some(update));
    let Some(parent) = state.parent(loop_sref) else {
        return Err(ScheduleError::new(
            codes::S0702,
            NAME,
            "the loop has no parent",
        ));
    };
    let parent_stmt = state.stmt(parent);
    let new_parent = splice(&parent_stmt, &loop_stmt, Some(seq(vec![init_nest, new_loop])));
    state.replace(parent, new_parent);
    crate::lookup::get_block(state, &init_name)
}

// ── rfactor ─────────────────────────────────────────────────────────────────

/// Factor the reduction over `loop_sref` into an intermediate buffer with
/// one partial result per iteration of the loop, followed by a write-back
/// block that reduces the partials.
pub fn rfactor(
    state: &mut ScheduleState,
    loop_sref: SRefId,
    factor_axis: i64,
    reducers: &[CommReducer],
) -> ScheduleResult<SRefId> {
    const NAME: &str = "rfactor";
    let shape_err = |msg: String| ScheduleError::new(codes::S0704, NAME, msg);

    let blocks = state.child_blocks(loop_sref);
    let [block] = blocks.as_slice() else {
        return Err(shape_err(format!(
            "the loop must contain exactly one block, found {}",
            blocks.len()
        )));
    };
    let block = *block;
    let br = state.block(block).clone();
    let Some(scope) = state.scope_root(block) else {
        return Err(shape_err("the root block cannot be factored".to_string()));
    };
    if !state.scope_info(scope).is_reduction(block) {
        return Err(ScheduleError::new(
            codes::S0701,
            NAME,
            format!("block `{}` is not a reduction", br.block.name),
        ));
    }
    let rl = state.loop_(loop_sref).clone();
    if rl.kind != ForKind::Serial {
        return Err(shape_err(format!("loop `{}` is not serial", rl.loop_var.name)));
    }
    let (Some(0), Some(rf_extent)) = (rl.min.as_int(), rl.extent.as_int()) else {
        return Err(shape_err(format!(
            "loop `{}` must start at 0 and have a constant extent",
            rl.loop_var.name
        )));
    };

    let pairs: Vec<(IterVar, Expr)> = br
        .block
        .iter_vars
        .iter()
        .cloned()
        .zip(br.iter_values.iter().cloned())
        .collect();
    let drives = |var: &Var, kind: IterKind| {
        pairs
            .iter()
            .any(|(iv, v)| iv.kind == kind && v.uses_var(var))
    };
    if drives(&rl.loop_var, IterKind::DataPar) || drives(&rl.loop_var, IterKind::Opaque) {
        return Err(shape_err(format!(
            "loop `{}` drives a non-reduction iterator",
            rl.loop_var.name
        )));
    }
    if !drives(&rl.loop_var, IterKind::CommReduce) {
        return Err(shape_err(format!(
            "loop `{}` drives no reduction iterator",
            rl.loop_var.name
        )));
    }
    let loops: Vec<Loop> = state
        .loops_above(block)
        .iter()
        .map(|&l| state.loop_(l).clone())
        .collect();
    for l in &loops {
        if drives(&l.loop_var, IterKind::DataPar) && drives(&l.loop_var, IterKind::CommReduce) {
            return Err(shape_err(format!(
                "loop `{}` drives both data-parallel and reduction iterators",
                l.loop_var.name
            )));
        }
    }
    let top = state.loops_above(block)[0];
    if state.child_blocks(top) != vec![block] {
        return Err(shape_err(
            "the outermost loop of the nest contains other blocks".to_string(),
        ));
    }

    let Some(form) = match_reduction(&br.block, reducers) else {
        return Err(ScheduleError::new(
            codes::S0705,
            NAME,
            format!("block `{}` does not match a registered reducer", br.block.name),
        )
        .with_hint("expected `B[i] = op(B[i], x)` with init `B[i] = identity`"));
    };
    let ndim = form.buffer.ndim() as i64;
    if factor_axis < -ndim - 1 || factor_axis > ndim {
        return Err(ScheduleError::new(
            codes::S0706,
            NAME,
            format!(
                "factor_axis {} is out of range [{}, {}]",
                factor_axis,
                -ndim - 1,
                ndim
            ),
        ));
    }
    let axis = (if factor_axis < 0 { factor_axis + ndim + 1 } else { factor_axis }) as usize;

    let mut rf_shape = form.buffer.shape.clone();
    rf_shape.insert(axis, rf_extent);
    let rf_buf = Buffer::with_scope(
        format!("{}_rf", form.buffer.name),
        rf_shape,
        form.buffer.dtype,
        form.buffer.scope.clone(),
    );
    let op = form.reducer.op;
    let identity = Expr::Float(form.reducer.identity);

    // ── rf block: same loops, reduction loops become explicit iterators ──
    let mut rf_map = VarMap::new();
    let mut rf_vars = Vec::new();
    let mut rf_values = Vec::new();
    for (iv, v) in &pairs {
        if iv.kind == IterKind::DataPar {
            let fresh = iv.var.fresh();
            rf_map.insert(iv.var.clone(), Expr::var(&fresh));
            rf_vars.push(IterVar {
                var: fresh,
                dom: iv.dom.clone(),
                kind: IterKind::DataPar,
            });
            rf_values.push(v.clone());
        }
    }
    let mut loop_iter = VarMap::new();
    let mut rf_index: Option<Expr> = None;
    for l in loops.iter().filter(|l| drives(&l.loop_var, IterKind::CommReduce)) {
        let (Some(0), Some(extent)) = (l.min.as_int(), l.extent.as_int()) else {
            return Err(shape_err(format!(
                "reduction loop `{}` must start at 0 and have a constant extent",
                l.loop_var.name
            )));
        };
        let v = Var::new(format!("v{}", l.loop_var.name));
        let kind = if l.loop_var == rl.loop_var {
            rf_index = Some(Expr::var(&v));
            IterKind::DataPar
        } else {
            IterKind::CommReduce
        };
        loop_iter.insert(l.loop_var.clone(), Expr::var(&v));
        rf_vars.push(IterVar {
            var: v,
            dom: Range::from_extent(Expr::Int(extent)),
            kind,
        });
        rf_values.push(Expr::var(&l.loop_var));
    }
    let Some(rf_index) = rf_index else {
        return Err(shape_err("the loop is not above the block".to_string()));
    };
    for (iv, v) in &pairs {
        if iv.kind == IterKind::CommReduce {
            rf_map.insert(iv.var.clone(), arith::substitute(v, &loop_iter));
        }
    }
    let rf_indices = {
        let mut idx: Vec<Expr> = form.indices.iter().map(|e| arith::substitute(e, &rf_map)).collect();
        idx.insert(axis, rf_index);
        idx
    };
    let rf_acc = Expr::load(&rf_buf, rf_indices.clone());
    let rf_name = state
        .program()
        .unique_block_name(&format!("{}_rf", br.block.name));
    let rf_block = arith::with_inferred_regions(Block {
        name: rf_name.clone(),
        iter_vars: rf_vars,
        reads: Vec::new(),
        writes: Vec::new(),
        alloc_buffers: Vec::new(),
        init: Some(Arc::new(Stmt::Store(BufferStore {
            buffer: rf_buf.clone(),
            indices: rf_indices.clone(),
            value: identity.clone(),
        }))),
        body: Arc::new(Stmt::Store(BufferStore {
            buffer: rf_buf.clone(),
            indices: rf_indices,
            value: Expr::binary(op, rf_acc, arith::substitute(&form.rhs, &rf_map)),
        })),
        annotations: Annotations::new(),
    });
    let rf_stmt = Arc::new(Stmt::Block(BlockRealize {
        iter_values: rf_values,
        predicate: br.predicate.clone(),
        block: rf_block,
    }));

    // ── write-back block: data-parallel loops plus the factored loop ──
    let mut wb_loop_map = VarMap::new();
    let mut wb_loops: Vec<Loop> = Vec::new();
    let mut dropped = HashSet::new();
    for l in &loops {
        if drives(&l.loop_var, IterKind::DataPar) {
            let fresh = l.loop_var.fresh();
            wb_loop_map.insert(l.loop_var.clone(), Expr::var(&fresh));
            wb_loops.push(Loop {
                loop_var: fresh,
                min: arith::substitute(&l.min, &wb_loop_map),
                extent: arith::substitute(&l.extent, &wb_loop_map),
                ..l.clone()
            });
        } else {
            dropped.insert(l.loop_var.clone());
        }
    }
    let wb_r = rl.loop_var.fresh();
    let mut wb_map = VarMap::new();
    let mut wb_vars = Vec::new();
    let mut wb_values = Vec::new();
    for (iv, v) in &pairs {
        if iv.kind == IterKind::DataPar {
            let fresh = iv.var.fresh();
            wb_map.insert(iv.var.clone(), Expr::var(&fresh));
            wb_vars.push(IterVar {
                var: fresh,
                dom: iv.dom.clone(),
                kind: IterKind::DataPar,
            });
            wb_values.push(arith::substitute(v, &wb_loop_map));
        }
    }
    let wb_iter = Var::new(format!("v{}", rl.loop_var.name));
    wb_vars.push(IterVar {
        var: wb_iter.clone(),
        dom: Range::from_extent(Expr::Int(rf_extent)),
        kind: IterKind::CommReduce,
    });
    wb_values.push(Expr::var(&wb_r));
    let wb_indices: Vec<Expr> = form.indices.iter().map(|e| arith::substitute(e, &wb_map)).collect();
    let mut partial_indices = wb_indices.clone();
    partial_indices.insert(axis, Expr::var(&wb_iter));
    let wb_block = arith::with_inferred_regions(Block {
        name: br.block.name.clone(),
        iter_vars: wb_vars,
        reads: Vec::new(),
        writes: Vec::new(),
        alloc_buffers: Vec::new(),
        init: Some(Arc::new(Stmt::Store(BufferStore {
            buffer: form.buffer.clone(),
            indices: wb_indices.clone(),
            value: identity,
        }))),
        body: Arc::new(Stmt::Store(BufferStore {
            buffer: form.buffer.clone(),
            indices: wb_indices.clone(),
            value: Expr::binary(
                op,
                Expr::load(&form.buffer, wb_indices),
                Expr::load(&rf_buf, partial_indices),
            ),
        })),
        annotations: Annotations::new(),
    });
    let wb_predicate = arith::substitute(&restrict_predicate(&br.predicate, &dropped), &wb_loop_map);
    let mut wb_nest = Arc::new(Stmt::Block(BlockRealize {
        iter_values: wb_values,
        predicate: wb_predicate,
        block: wb_block,
    }));
    wb_nest = Arc::new(Stmt::Loop(Loop::serial(wb_r, rf_extent, wb_nest)));
    for l in wb_loops.into_iter().rev() {
        wb_nest = Arc::new(Stmt::Loop(Loop { body: wb_nest, ..l }));
    }

    let top_stmt = state.stmt(top);
    let rf_nest = splice(&top_stmt, &state.stmt(block), Some(rf_stmt));
    let scope_stmt = state.stmt(scope);
    let new_scope = splice(&scope_stmt, &top_stmt, Some(seq(vec![rf_nest, wb_nest])));
    let new_scope = with_alloc(&new_scope, &rf_buf, true);
    state.replace(scope, new_scope);
    crate::lookup::get_block(state, &rf_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{get_block, get_loops};
    use crate::state::DebugMask;
    use crate::workload;

    #[test]
    fn decompose_at_outer_loop() {
        let p = workload::matmul(4, 4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        let ls = get_loops(&state, c);
        let init = decompose_reduction(&mut state, c, ls[0]).unwrap();
        assert_eq!(state.block(init).block.name, "C_init");
        assert_eq!(get_loops(&state, init).len(), 2);
        assert!(state.block(c).block.init.is_none());
        assert_eq!(get_loops(&state, c), ls);
    }

    #[test]
    fn decompose_at_the_reduction_loop() {
        let p = workload::matmul(4, 4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        let ls = get_loops(&state, c);
        let init = decompose_reduction(&mut state, c, ls[2]).unwrap();
        // The init sits inside `j`, before `k`, with no loops of its own.
        assert!(get_loops(&state, init).is_empty());
        assert_eq!(state.parent(init), Some(ls[1]));
        assert_eq!(get_loops(&state, c), ls);
    }

    #[test]
    fn decompose_under_reduction_loop_rejected() {
        let p = workload::matmul(4, 4, 8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let c = get_block(&state, "C").unwrap();
        let k = get_loops(&state, c)[2];
        let parts = crate::loop_transform::split(&mut state, k, &[None, Some(Expr::Int(4))]).unwrap();
        assert_eq!(
            decompose_reduction(&mut state, c, parts[1]).unwrap_err().code,
            codes::S0703
        );
    }

    #[test]
    fn rfactor_splits_into_partials() {
        let p = workload::reduce_sum(4, 4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let ls = get_loops(&state, b);
        let rf = rfactor(&mut state, ls[1], 0, &default_reducers()).unwrap();
        let rf_block = &state.block(rf).block;
        assert_eq!(rf_block.name, "B_rf");
        assert_eq!(rf_block.writes[0].buffer.shape, vec![4, 4]);
        let wb = get_block(&state, "B").unwrap();
        assert_eq!(wb, b);
        assert_eq!(get_loops(&state, wb).len(), 2);
    }

    #[test]
    fn rfactor_checks() {
        let p = workload::reduce_sum(4, 4, 4);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let ls = get_loops(&state, b);
        assert_eq!(rfactor(&mut state, ls[0], 0, &default_reducers()).unwrap_err().code, codes::S0704);
        assert_eq!(rfactor(&mut state, ls[1], 3, &default_reducers()).unwrap_err().code, codes::S0706);
        assert_eq!(rfactor(&mut state, ls[1], 0, &[]).unwrap_err().code, codes::S0705);
    }

    #[test]
    fn reducer_matches_max() {
        let p = workload::reduce_max(4, 4);
        let b = p.find_block("B").unwrap();
        let form = match_reduction(&b.as_block().unwrap().block, &default_reducers()).unwrap();
        assert_eq!(form.reducer.name, "max");
        assert!(match_reduction(&b.as_block().unwrap().block, &default_reducers()[..2]).is_none());
    }
}
