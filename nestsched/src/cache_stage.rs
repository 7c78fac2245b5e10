// cache_stage.rs — cache_read, cache_write
//
// Both primitives stage a buffer through a fresh buffer tagged with a storage
// scope and allocated at the scope root. The copy block goes right after the
// writer, inside the deepest loop the writer shares with the blocks that
// observe the copy, and covers what those blocks touch per iteration of that
// loop. When they share no loop the copy is a full-buffer stage at the top
// level of the scope.
//
// Preconditions: `block` is a live block sref below some scope.
// Postconditions: program outputs are unchanged; the returned sref is the
//                 copy block.
// Failure modes: S0401 (index), S0301 (stage pipeline), S0402 (writers),
//                S0403 (a reader shares the writer's statement).
// Side effects: one `replace` of the scope root.

use std::sync::Arc;

use crate::arith;
use crate::compute_location::{domain_guard, enclosing_ranges, required_region, Need};
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::{map_scope_blocks, splice, with_alloc, ScheduleState};

fn region_buffer(
    regions: &[BufferRegion],
    index: usize,
    primitive: &'static str,
    what: &str,
) -> ScheduleResult<Buffer> {
    regions
        .get(index)
        .map(|r| r.buffer.clone())
        .ok_or_else(|| {
            ScheduleError::new(
                codes::S0401,
                primitive,
                format!(
                    "{} buffer index {} is out of range (block has {})",
                    what,
                    index,
                    regions.len()
                ),
            )
        })
}

fn scope_of(state: &ScheduleState, block: SRefId, primitive: &'static str) -> ScheduleResult<SRefId> {
    state.scope_root(block).ok_or_else(|| {
        ScheduleError::new(codes::S0401, primitive, "the root block has no buffers to cache")
    })
}

fn cache_buffer(buf: &Buffer, storage_scope: &str) -> Buffer {
    Buffer::with_scope(
        format!("{}_{}", buf.name, storage_scope),
        buf.shape.clone(),
        buf.dtype,
        storage_scope,
    )
}

// ── Placement ───────────────────────────────────────────────────────────────

/// Where a copy stage goes.
#[derive(Debug, Clone, Copy)]
struct Placement {
    /// Deepest loop enclosing the writer and every observer; `None` places
    /// the stage at the top level of the scope.
    within: Option<SRefId>,
    /// Body position right after the writer's statement.
    pos: usize,
}

/// Position, within the body of `lp`, of the statement that contains `id`.
fn body_position(state: &ScheduleState, lp: SRefId, id: SRefId) -> usize {
    let mut top = id;
    while let Some(p) = state.parent(top) {
        if p == lp {
            break;
        }
        top = p;
    }
    let stmt = state.stmt(top);
    match seq_items(&state.loop_(lp).body)
        .iter()
        .position(|s| Arc::ptr_eq(s, &stmt))
    {
        Some(pos) => pos,
        None => panic!("internal error: statement missing from its parent loop body"),
    }
}

/// Place a stage after `writer` so that every block in `observers` runs
/// after it.
fn place_after(
    state: &ScheduleState,
    scope: SRefId,
    writer: SRefId,
    observers: &[SRefId],
    primitive: &'static str,
) -> ScheduleResult<Placement> {
    let chain = state.loops_above(writer);
    let mut common = if observers.is_empty() { 0 } else { chain.len() };
    for &o in observers {
        let other = state.loops_above(o);
        let shared = chain.iter().zip(&other).take_while(|(a, b)| a == b).count();
        common = common.min(shared);
    }
    if common == 0 {
        let pos = state
            .top_level_position(scope, writer)
            .map(|p| p + 1)
            .unwrap_or(0);
        return Ok(Placement { within: None, pos });
    }
    let lp = chain[common - 1];
    let writer_pos = body_position(state, lp, writer);
    for &o in observers {
        if body_position(state, lp, o) <= writer_pos {
            return Err(ScheduleError::new(
                codes::S0403,
                primitive,
                format!(
                    "block `{}` shares a statement with writer `{}` under loop `{}`",
                    state.block(o).block.name,
                    state.block(writer).block.name,
                    state.loop_(lp).loop_var.name
                ),
            )
            .with_hint("move the blocks apart with compute_at or reverse_compute_at first"));
        }
    }
    Ok(Placement {
        within: Some(lp),
        pos: writer_pos + 1,
    })
}

/// Scope block with `stage` inserted at `place`.
fn insert_stage(state: &ScheduleState, scope: SRefId, place: Placement, stage: Arc<Stmt>) -> Arc<Stmt> {
    let scope_stmt = state.stmt(scope);
    match place.within {
        None => match scope_stmt.as_ref() {
            Stmt::Block(br) => {
                let mut items = seq_items(&br.block.body);
                items.retain(|s| !matches!(s.as_ref(), Stmt::Seq(v) if v.is_empty()));
                items.insert(place.pos.min(items.len()), stage);
                Arc::new(Stmt::Block(br.with_block(Block {
                    body: seq(items),
                    ..br.block.clone()
                })))
            }
            _ => panic!("internal error: scope root is not a block"),
        },
        Some(lp) => {
            let loop_stmt = state.stmt(lp);
            let l = state.loop_(lp);
            let mut items = seq_items(&l.body);
            items.insert(place.pos.min(items.len()), stage);
            let new_loop = Arc::new(Stmt::Loop(l.with_body(seq(items))));
            splice(&scope_stmt, &loop_stmt, Some(new_loop))
        }
    }
}

// ── Copy stage ──────────────────────────────────────────────────────────────

/// One copied dimension: `[min, min + extent)`, guarded against the buffer
/// bounds when `reach` (the inclusive range the index can take) is not known
/// to fit.
struct CopyDim {
    min: Expr,
    extent: i64,
    guarded: bool,
    reach: Option<(i64, i64)>,
}

/// Dimensions a stage at `place` must copy: the whole buffer at the top
/// level, otherwise what `blocks` touch in `buf` per iteration of the loop.
fn stage_dims(
    state: &ScheduleState,
    scope: SRefId,
    place: Placement,
    blocks: &[SRefId],
    buf: &Buffer,
    reads: bool,
) -> Vec<CopyDim> {
    let full = |d: usize| CopyDim {
        min: Expr::Int(0),
        extent: buf.shape[d],
        guarded: false,
        reach: None,
    };
    let Some(lp) = place.within else {
        return (0..buf.ndim()).map(full).collect();
    };
    let need = required_region(state, lp, blocks, std::slice::from_ref(buf), reads);
    let outer = enclosing_ranges(state, lp, scope);
    (0..buf.ndim())
        .map(|d| match need.get(buf).and_then(|dims| dims.get(d)) {
            Some(Need::Known(b)) if b.extent < buf.shape[d] => {
                let min = b.min_expr();
                let reach = arith::bound_index(&min, &outer)
                    .filter(|r| r.base.terms.is_empty())
                    .map(|r| (r.lo, r.lo + r.extent - 1 + b.extent - 1));
                CopyDim {
                    min,
                    extent: b.extent,
                    guarded: true,
                    reach,
                }
            }
            _ => full(d),
        })
        .collect()
}

/// Copy nest `dst[v] = src[v]` over `dims`.
fn copy_nest(name: &str, src: &Buffer, dst: &Buffer, dims: &[CopyDim]) -> Arc<Stmt> {
    let mut loop_vars = Vec::with_capacity(dims.len());
    let mut iter_vars = Vec::with_capacity(dims.len());
    let mut values = Vec::with_capacity(dims.len());
    let mut predicate = Expr::Int(1);
    for (d, dim) in dims.iter().enumerate() {
        let lv = Var::new(format!("ax{}", d));
        let iv = IterVar {
            var: Var::new(format!("vax{}", d)),
            dom: Range::from_extent(Expr::Int(src.shape[d])),
            kind: IterKind::DataPar,
        };
        let value = arith::add(Expr::var(&lv), dim.min.clone());
        if dim.guarded {
            predicate = arith::and(predicate, domain_guard(&value, &iv.dom, dim.reach));
        }
        loop_vars.push((lv, dim.extent));
        iter_vars.push(iv);
        values.push(value);
    }
    let index: Vec<Expr> = iter_vars.iter().map(|iv| Expr::var(&iv.var)).collect();
    let block = arith::with_inferred_regions(Block {
        name: name.to_string(),
        iter_vars,
        reads: Vec::new(),
        writes: Vec::new(),
        alloc_buffers: Vec::new(),
        init: None,
        body: Arc::new(Stmt::Store(BufferStore {
            buffer: dst.clone(),
            indices: index.clone(),
            value: Expr::load(src, index),
        })),
        annotations: Annotations::new(),
    });
    let mut nest = Arc::new(Stmt::Block(BlockRealize {
        iter_values: values,
        predicate,
        block,
    }));
    for (lv, extent) in loop_vars.into_iter().rev() {
        nest = Arc::new(Stmt::Loop(Loop::serial(lv, extent, nest)));
    }
    nest
}

fn rewired(stmt: &Arc<Stmt>, from: &Buffer, to: &Buffer) -> Option<BlockRealize> {
    arith::replace_buffer(stmt, from, to).as_block().cloned()
}

/// Child blocks of the scope that read `buf`, other than `except`.
fn readers_of(state: &mut ScheduleState, scope: SRefId, buf: &Buffer, except: &[SRefId]) -> Vec<SRefId> {
    let info = state.scope_info(scope);
    info.child_blocks
        .iter()
        .copied()
        .filter(|id| !except.contains(id))
        .filter(|&id| state.block(id).block.reads.iter().any(|r| &r.buffer == buf))
        .collect()
}

// ── cache_read ──────────────────────────────────────────────────────────────

/// Stage the `read_index`-th read buffer of `block` through a cache buffer
/// in `storage_scope`. Every reader in the scope other than the writer is
/// rewired to the cache.
pub fn cache_read(
    state: &mut ScheduleState,
    block: SRefId,
    read_index: usize,
    storage_scope: &str,
) -> ScheduleResult<SRefId> {
    const NAME: &str = "cache_read";
    let buf = region_buffer(&state.block(block).block.reads, read_index, NAME, "read")?;
    let scope = scope_of(state, block, NAME)?;
    let info = state.scope_info(scope);
    if !info.stage_pipeline {
        return Err(ScheduleError::new(
            codes::S0301,
            NAME,
            "the enclosing scope is not a stage pipeline",
        ));
    }
    let writers = info.writers_of(&buf).to_vec();
    if writers.len() > 1 {
        return Err(ScheduleError::new(
            codes::S0402,
            NAME,
            format!("buffer `{}` has {} writers in the scope", buf.name, writers.len()),
        ));
    }
    let readers = readers_of(state, scope, &buf, &writers);

    let cache = cache_buffer(&buf, storage_scope);
    let name = state.program().unique_block_name(&cache.name);
    let (place, dims) = match writers.first() {
        Some(&w) => {
            let place = place_after(state, scope, w, &readers, NAME)?;
            (place, stage_dims(state, scope, place, &readers, &buf, true))
        }
        None => {
            let place = Placement { within: None, pos: 0 };
            (place, stage_dims(state, scope, place, &readers, &buf, true))
        }
    };
    let copy = copy_nest(&name, &buf, &cache, &dims);
    let writer_stmts: Vec<Arc<Stmt>> = writers.iter().map(|&w| state.stmt(w)).collect();

    let staged = insert_stage(state, scope, place, copy);
    let new_scope = map_scope_blocks(&staged, &mut |s, br| {
        let reads_buf = br.block.reads.iter().any(|r| r.buffer == buf);
        let is_writer = writer_stmts.iter().any(|w| Arc::ptr_eq(w, s));
        if reads_buf && !is_writer && br.block.name != name {
            rewired(s, &buf, &cache)
        } else {
            None
        }
    });
    let new_scope = with_alloc(&new_scope, &cache, true);
    state.replace(scope, new_scope);
    crate::lookup::get_block(state, &name)
}

// ── cache_write ─────────────────────────────────────────────────────────────

/// Redirect the `write_index`-th write buffer of `block` to a cache buffer
/// in `storage_scope`, then copy the cache back right after the producer.
pub fn cache_write(
    state: &mut ScheduleState,
    block: SRefId,
    write_index: usize,
    storage_scope: &str,
) -> ScheduleResult<SRefId> {
    const NAME: &str = "cache_write";
    let buf = region_buffer(&state.block(block).block.writes, write_index, NAME, "write")?;
    let scope = scope_of(state, block, NAME)?;
    let info = state.scope_info(scope);
    if !info.stage_pipeline {
        return Err(ScheduleError::new(
            codes::S0301,
            NAME,
            "the enclosing scope is not a stage pipeline",
        ));
    }
    let writers = info.writers_of(&buf);
    if writers.len() != 1 || writers[0] != block {
        return Err(ScheduleError::new(
            codes::S0402,
            NAME,
            format!(
                "buffer `{}` must be written by this block alone ({} writers)",
                buf.name,
                writers.len()
            ),
        ));
    }
    let readers = readers_of(state, scope, &buf, &[block]);

    let cache = cache_buffer(&buf, storage_scope);
    let name = state.program().unique_block_name(&cache.name);
    let place = place_after(state, scope, block, &readers, NAME)?;
    let dims = stage_dims(state, scope, place, &[block], &buf, false);
    let copy = copy_nest(&name, &cache, &buf, &dims);
    let producer = state.stmt(block);

    let staged = insert_stage(state, scope, place, copy);
    let new_scope = map_scope_blocks(&staged, &mut |s, _| {
        if Arc::ptr_eq(s, &producer) {
            rewired(s, &buf, &cache)
        } else {
            None
        }
    });
    let new_scope = with_alloc(&new_scope, &cache, true);
    state.replace(scope, new_scope);
    crate::lookup::get_block(state, &name)
}
