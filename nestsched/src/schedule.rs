// schedule.rs — Schedule façade: handles, primitives, sampling, trace
//
// The caller-facing surface. Resolves handles through the random-variable
// table, runs a primitive against the schedule state, hands out handles for
// its results, and appends a trace record for every successful call.
//
// Preconditions: handles passed in were produced by this schedule (or by the
//                schedule it was copied from).
// Postconditions: a failing call leaves program, handles and trace
//                 untouched.
// Failure modes: every precondition violation surfaces as `ScheduleError`,
//                rendered at the configured level.
// Side effects: primitives commit through `ScheduleState::replace`; sampling
//               advances the generator.

use std::sync::Arc;

use log::debug;

use crate::diag::{codes, ErrorRenderLevel, ScheduleError, ScheduleResult};
use crate::id::{AnyRV, BlockRV, ExprRV, LoopRV, SRefId};
use crate::instruction::InstKind;
use crate::ir::{Expr, Program, Stmt, Var};
use crate::reduction::{default_reducers, CommReducer};
use crate::rv::RvTable;
use crate::sampler::{check_tile_decision, Sampler};
use crate::state::{DebugMask, ScheduleState};
use crate::trace::{Arg, Attr, Decision, Trace, TraceRecord};
use crate::{
    annotate, cache_stage, compute_location, for_kind, inline, lookup, loop_transform, printer,
    reduction,
};

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// `None` seeds from the operating system.
    pub seed: Option<u64>,
    pub debug_mask: DebugMask,
    pub error_render_level: ErrorRenderLevel,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            seed: None,
            debug_mask: DebugMask::NONE,
            error_render_level: ErrorRenderLevel::Detail,
        }
    }
}

/// One split factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Int(i64),
    Rv(ExprRV),
    /// Inferred from the extent and the other factors.
    Infer,
}

/// What a handle currently resolves to.
#[derive(Debug, Clone)]
pub enum RvRef {
    Stmt(Arc<Stmt>),
    Value(Expr),
}

// ── Schedule ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Schedule {
    state: ScheduleState,
    rvs: RvTable,
    sampler: Sampler,
    trace: Trace,
    reducers: Vec<CommReducer>,
    render: ErrorRenderLevel,
}

impl Schedule {
    /// Start scheduling a deep copy of `program`.
    pub fn new(program: &Program, config: ScheduleConfig) -> Self {
        Self {
            state: ScheduleState::new(program, config.debug_mask),
            rvs: RvTable::new(),
            sampler: Sampler::new(config.seed),
            trace: Trace::new(),
            reducers: default_reducers(),
            render: config.error_render_level,
        }
    }

    pub fn program(&self) -> &Program {
        self.state.program()
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn render_level(&self) -> ErrorRenderLevel {
        self.render
    }

    /// Independent schedule over a deep copy. Every handle valid here is
    /// valid in the copy and names the corresponding statement. The copy
    /// draws from a seed forked off this schedule's generator.
    pub fn copy(&mut self) -> Schedule {
        let seed = self.sampler.fork_seed();
        Schedule {
            state: self.state.copy(),
            rvs: self.rvs.pruned(self.state.tree()),
            sampler: Sampler::new(Some(seed)),
            trace: self.trace.clone(),
            reducers: self.reducers.clone(),
            render: self.render,
        }
    }

    pub fn seed(&mut self, seed: u64) {
        self.sampler.reseed(seed);
    }

    pub fn fork_seed(&mut self) -> u64 {
        self.sampler.fork_seed()
    }

    /// Make `reducer` available to `rfactor`. Later registrations are tried
    /// first.
    pub fn register_reducer(&mut self, reducer: CommReducer) {
        self.reducers.insert(0, reducer);
    }

    // ── Error rendering ──

    fn render_error(&self, e: ScheduleError) -> ScheduleError {
        let e = if self.render == ErrorRenderLevel::Detail && e.ir.is_none() {
            e.with_ir(printer::script(self.state.program()))
        } else {
            e
        };
        e.rendered_at(self.render)
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> ScheduleResult<T>) -> ScheduleResult<T> {
        let result = f(self);
        result.map_err(|e| {
            debug!("{} rejected: {}", e.primitive, e.message);
            self.render_error(e)
        })
    }

    fn record(
        &mut self,
        kind: InstKind,
        inputs: Vec<Arg>,
        attrs: Vec<Attr>,
        outputs: Vec<AnyRV>,
        decision: Option<Decision>,
    ) {
        log::trace!("record #{}: {:?}", self.trace.len(), kind);
        self.trace.push(TraceRecord {
            kind,
            inputs,
            attrs,
            outputs,
            decision,
        });
    }

    // ── Handles ──

    fn loop_sref(&self, rv: LoopRV) -> ScheduleResult<SRefId> {
        self.rvs.resolve_loop(rv, self.state.tree())
    }

    fn block_sref(&self, rv: BlockRV) -> ScheduleResult<SRefId> {
        self.rvs.resolve_block(rv, self.state.tree())
    }

    fn new_loops(&mut self, srefs: Vec<SRefId>) -> Vec<LoopRV> {
        srefs.into_iter().map(|s| self.rvs.add_loop(s)).collect()
    }

    fn new_blocks(&mut self, srefs: Vec<SRefId>) -> Vec<BlockRV> {
        srefs.into_iter().map(|s| self.rvs.add_block(s)).collect()
    }

    /// Current statement or value behind `rv`.
    pub fn get(&self, rv: impl Into<AnyRV>) -> ScheduleResult<RvRef> {
        let rv = rv.into();
        let resolved = match rv {
            AnyRV::Expr(e) => self.rvs.resolve_expr(e).map(RvRef::Value),
            _ => self
                .rvs
                .resolve_sref(rv, self.state.tree())
                .map(|id| RvRef::Stmt(self.state.stmt(id))),
        };
        resolved.map_err(|e| self.render_error(e))
    }

    /// Sref behind a loop or block handle.
    pub fn get_sref(&self, rv: impl Into<AnyRV>) -> ScheduleResult<SRefId> {
        self.rvs
            .resolve_sref(rv.into(), self.state.tree())
            .map_err(|e| self.render_error(e))
    }

    /// Sref of a statement of the current program, if it is indexed.
    pub fn get_sref_of(&self, stmt: &Arc<Stmt>) -> ScheduleResult<SRefId> {
        self.state.get_sref(stmt).ok_or_else(|| {
            self.render_error(ScheduleError::new(
                codes::S0005,
                "get_sref",
                "statement is not part of the scheduled program",
            ))
        })
    }

    pub fn get_value(&self, rv: ExprRV) -> ScheduleResult<Expr> {
        self.rvs.resolve_expr(rv).map_err(|e| self.render_error(e))
    }

    /// Printed form of whatever `rv` resolves to.
    pub fn show(&self, rv: impl Into<AnyRV>) -> ScheduleResult<String> {
        Ok(match self.get(rv)? {
            RvRef::Stmt(s) => printer::stmt_script(&s),
            RvRef::Value(e) => printer::expr_script(&e),
        })
    }

    pub fn remove_rv(&mut self, rv: impl Into<AnyRV>) -> ScheduleResult<()> {
        let rv = rv.into();
        self.guarded(|s| s.rvs.remove(rv))
    }

    /// Whether `rv` is bound and, for loops and blocks, still live.
    pub fn is_valid(&self, rv: impl Into<AnyRV>) -> bool {
        match rv.into() {
            AnyRV::Expr(e) => self.rvs.resolve_expr(e).is_ok(),
            other => self.rvs.resolve_sref(other, self.state.tree()).is_ok(),
        }
    }

    // ── Lookup ──

    pub fn get_block(&mut self, name: &str) -> ScheduleResult<BlockRV> {
        self.guarded(|s| {
            let id = lookup::get_block(&s.state, name)?;
            let rv = s.rvs.add_block(id);
            s.record(
                InstKind::GetBlock,
                Vec::new(),
                vec![Attr::Str(name.to_string())],
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    pub fn get_loops(&mut self, block: BlockRV) -> ScheduleResult<Vec<LoopRV>> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            let loops = lookup::get_loops(&s.state, id);
            let rvs = s.new_loops(loops);
            s.record(
                InstKind::GetLoops,
                vec![Arg::Rv(block.into())],
                Vec::new(),
                rvs.iter().map(|&l| l.into()).collect(),
                None,
            );
            Ok(rvs)
        })
    }

    /// Leaf blocks under a block or loop.
    pub fn get_child_blocks(&mut self, parent: impl Into<AnyRV>) -> ScheduleResult<Vec<BlockRV>> {
        let parent = parent.into();
        self.guarded(|s| {
            let id = s.rvs.resolve_sref(parent, s.state.tree())?;
            let blocks = lookup::get_child_blocks(&s.state, id);
            let rvs = s.new_blocks(blocks);
            s.record(
                InstKind::GetChildBlocks,
                vec![Arg::Rv(parent)],
                Vec::new(),
                rvs.iter().map(|&b| b.into()).collect(),
                None,
            );
            Ok(rvs)
        })
    }

    pub fn get_producers(&mut self, block: BlockRV) -> ScheduleResult<Vec<BlockRV>> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            let blocks = lookup::get_producers(&mut s.state, id);
            let rvs = s.new_blocks(blocks);
            s.record(
                InstKind::GetProducers,
                vec![Arg::Rv(block.into())],
                Vec::new(),
                rvs.iter().map(|&b| b.into()).collect(),
                None,
            );
            Ok(rvs)
        })
    }

    pub fn get_consumers(&mut self, block: BlockRV) -> ScheduleResult<Vec<BlockRV>> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            let blocks = lookup::get_consumers(&mut s.state, id);
            let rvs = s.new_blocks(blocks);
            s.record(
                InstKind::GetConsumers,
                vec![Arg::Rv(block.into())],
                Vec::new(),
                rvs.iter().map(|&b| b.into()).collect(),
                None,
            );
            Ok(rvs)
        })
    }

    // ── Loop transforms ──

    pub fn split(&mut self, loop_rv: LoopRV, factors: &[Factor]) -> ScheduleResult<Vec<LoopRV>> {
        self.guarded(|s| {
            let id = s.loop_sref(loop_rv)?;
            let mut exprs = Vec::with_capacity(factors.len());
            let mut args = vec![Arg::Rv(loop_rv.into())];
            for f in factors {
                match f {
                    Factor::Int(v) => {
                        exprs.push(Some(Expr::Int(*v)));
                        args.push(Arg::Int(*v));
                    }
                    Factor::Rv(rv) => {
                        exprs.push(Some(s.rvs.resolve_expr(*rv)?));
                        args.push(Arg::Rv((*rv).into()));
                    }
                    Factor::Infer => {
                        exprs.push(None);
                        args.push(Arg::None);
                    }
                }
            }
            let loops = loop_transform::split(&mut s.state, id, &exprs)?;
            let rvs = s.new_loops(loops);
            s.record(
                InstKind::Split,
                args,
                Vec::new(),
                rvs.iter().map(|&l| l.into()).collect(),
                None,
            );
            Ok(rvs)
        })
    }

    pub fn fuse(&mut self, loops: &[LoopRV]) -> ScheduleResult<LoopRV> {
        self.guarded(|s| {
            let ids = loops
                .iter()
                .map(|&l| s.loop_sref(l))
                .collect::<ScheduleResult<Vec<_>>>()?;
            let fused = loop_transform::fuse(&mut s.state, &ids)?;
            let rv = s.rvs.add_loop(fused);
            s.record(
                InstKind::Fuse,
                loops.iter().map(|&l| Arg::Rv(l.into())).collect(),
                Vec::new(),
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    pub fn reorder(&mut self, loops: &[LoopRV]) -> ScheduleResult<()> {
        self.guarded(|s| {
            let ids = loops
                .iter()
                .map(|&l| s.loop_sref(l))
                .collect::<ScheduleResult<Vec<_>>>()?;
            loop_transform::reorder(&mut s.state, &ids)?;
            s.record(
                InstKind::Reorder,
                loops.iter().map(|&l| Arg::Rv(l.into())).collect(),
                Vec::new(),
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    // ── Loop kinds ──

    pub fn parallel(&mut self, loop_rv: LoopRV) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.loop_sref(loop_rv)?;
            for_kind::parallel(&mut s.state, id)?;
            s.record(InstKind::Parallel, vec![Arg::Rv(loop_rv.into())], Vec::new(), Vec::new(), None);
            Ok(())
        })
    }

    pub fn vectorize(&mut self, loop_rv: LoopRV) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.loop_sref(loop_rv)?;
            for_kind::vectorize(&mut s.state, id)?;
            s.record(InstKind::Vectorize, vec![Arg::Rv(loop_rv.into())], Vec::new(), Vec::new(), None);
            Ok(())
        })
    }

    pub fn bind(&mut self, loop_rv: LoopRV, thread_axis: &str) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.loop_sref(loop_rv)?;
            for_kind::bind(&mut s.state, id, thread_axis)?;
            s.record(
                InstKind::Bind,
                vec![Arg::Rv(loop_rv.into())],
                vec![Attr::Str(thread_axis.to_string())],
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    pub fn unroll(&mut self, loop_rv: LoopRV) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.loop_sref(loop_rv)?;
            for_kind::unroll(&mut s.state, id)?;
            s.record(InstKind::Unroll, vec![Arg::Rv(loop_rv.into())], Vec::new(), Vec::new(), None);
            Ok(())
        })
    }

    // ── Cache stages ──

    pub fn cache_read(
        &mut self,
        block: BlockRV,
        read_buffer_index: usize,
        storage_scope: &str,
    ) -> ScheduleResult<BlockRV> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            let new = cache_stage::cache_read(&mut s.state, id, read_buffer_index, storage_scope)?;
            let rv = s.rvs.add_block(new);
            s.record(
                InstKind::CacheRead,
                vec![Arg::Rv(block.into())],
                vec![
                    Attr::Int(read_buffer_index as i64),
                    Attr::Str(storage_scope.to_string()),
                ],
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    pub fn cache_write(
        &mut self,
        block: BlockRV,
        write_buffer_index: usize,
        storage_scope: &str,
    ) -> ScheduleResult<BlockRV> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            let new = cache_stage::cache_write(&mut s.state, id, write_buffer_index, storage_scope)?;
            let rv = s.rvs.add_block(new);
            s.record(
                InstKind::CacheWrite,
                vec![Arg::Rv(block.into())],
                vec![
                    Attr::Int(write_buffer_index as i64),
                    Attr::Str(storage_scope.to_string()),
                ],
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    // ── Compute location ──

    pub fn compute_at(
        &mut self,
        block: BlockRV,
        loop_rv: LoopRV,
        preserve_unit_loops: bool,
    ) -> ScheduleResult<()> {
        self.guarded(|s| {
            let b = s.block_sref(block)?;
            let l = s.loop_sref(loop_rv)?;
            compute_location::compute_at(&mut s.state, b, l, preserve_unit_loops)?;
            s.record(
                InstKind::ComputeAt,
                vec![Arg::Rv(block.into()), Arg::Rv(loop_rv.into())],
                vec![Attr::Bool(preserve_unit_loops)],
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    pub fn reverse_compute_at(
        &mut self,
        block: BlockRV,
        loop_rv: LoopRV,
        preserve_unit_loops: bool,
    ) -> ScheduleResult<()> {
        self.guarded(|s| {
            let b = s.block_sref(block)?;
            let l = s.loop_sref(loop_rv)?;
            compute_location::reverse_compute_at(&mut s.state, b, l, preserve_unit_loops)?;
            s.record(
                InstKind::ReverseComputeAt,
                vec![Arg::Rv(block.into()), Arg::Rv(loop_rv.into())],
                vec![Attr::Bool(preserve_unit_loops)],
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    pub fn compute_inline(&mut self, block: BlockRV) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            inline::compute_inline(&mut s.state, id)?;
            s.record(InstKind::ComputeInline, vec![Arg::Rv(block.into())], Vec::new(), Vec::new(), None);
            Ok(())
        })
    }

    pub fn reverse_compute_inline(&mut self, block: BlockRV) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            inline::reverse_compute_inline(&mut s.state, id)?;
            s.record(
                InstKind::ReverseComputeInline,
                vec![Arg::Rv(block.into())],
                Vec::new(),
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    // ── Reductions ──

    pub fn decompose_reduction(&mut self, block: BlockRV, loop_rv: LoopRV) -> ScheduleResult<BlockRV> {
        self.guarded(|s| {
            let b = s.block_sref(block)?;
            let l = s.loop_sref(loop_rv)?;
            let init = reduction::decompose_reduction(&mut s.state, b, l)?;
            let rv = s.rvs.add_block(init);
            s.record(
                InstKind::DecomposeReduction,
                vec![Arg::Rv(block.into()), Arg::Rv(loop_rv.into())],
                Vec::new(),
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    pub fn rfactor(&mut self, loop_rv: LoopRV, factor_axis: i64) -> ScheduleResult<BlockRV> {
        self.guarded(|s| {
            let l = s.loop_sref(loop_rv)?;
            let rf = reduction::rfactor(&mut s.state, l, factor_axis, &s.reducers)?;
            let rv = s.rvs.add_block(rf);
            s.record(
                InstKind::RFactor,
                vec![Arg::Rv(loop_rv.into())],
                vec![Attr::Int(factor_axis)],
                vec![rv.into()],
                None,
            );
            Ok(rv)
        })
    }

    // ── Annotations ──

    pub fn storage_align(
        &mut self,
        block: BlockRV,
        buffer_index: usize,
        axis: i64,
        factor: i64,
        offset: i64,
    ) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            annotate::storage_align(&mut s.state, id, buffer_index, axis, factor, offset)?;
            s.record(
                InstKind::StorageAlign,
                vec![Arg::Rv(block.into())],
                vec![
                    Attr::Int(buffer_index as i64),
                    Attr::Int(axis),
                    Attr::Int(factor),
                    Attr::Int(offset),
                ],
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    pub fn set_scope(
        &mut self,
        block: BlockRV,
        buffer_index: usize,
        storage_scope: &str,
    ) -> ScheduleResult<()> {
        self.guarded(|s| {
            let id = s.block_sref(block)?;
            annotate::set_scope(&mut s.state, id, buffer_index, storage_scope)?;
            s.record(
                InstKind::SetScope,
                vec![Arg::Rv(block.into())],
                vec![
                    Attr::Int(buffer_index as i64),
                    Attr::Str(storage_scope.to_string()),
                ],
                Vec::new(),
                None,
            );
            Ok(())
        })
    }

    // ── Sampling ──

    /// One of `candidates`, drawn with weights `probs` unless `decision`
    /// fixes it.
    pub fn sample_categorical(
        &mut self,
        candidates: &[i64],
        probs: &[f64],
        decision: Option<i64>,
    ) -> ScheduleResult<ExprRV> {
        const NAME: &str = "sample_categorical";
        self.guarded(|s| {
            if candidates.len() != probs.len() {
                return Err(ScheduleError::new(
                    codes::S0101,
                    NAME,
                    format!(
                        "{} candidates but {} probabilities",
                        candidates.len(),
                        probs.len()
                    ),
                ));
            }
            let value = match decision {
                Some(d) if candidates.contains(&d) => d,
                Some(d) => {
                    return Err(ScheduleError::new(
                        codes::S0102,
                        NAME,
                        format!("decision {} is not among the candidates {:?}", d, candidates),
                    ))
                }
                None => candidates[s.sampler.categorical(probs)?],
            };
            let rv = s.rvs.add_expr(Expr::Int(value));
            s.record(
                InstKind::SampleCategorical,
                Vec::new(),
                vec![Attr::Ints(candidates.to_vec()), Attr::Floats(probs.to_vec())],
                vec![rv.into()],
                Some(Decision::Candidate(value)),
            );
            Ok(rv)
        })
    }

    /// `n` factors whose product is the loop's extent, innermost at most
    /// `max_innermost_factor`. A symbolic extent yields fresh variables for
    /// the outer factors and `1` innermost, with no decision recorded.
    pub fn sample_perfect_tile(
        &mut self,
        loop_rv: LoopRV,
        n: usize,
        max_innermost_factor: i64,
        decision: Option<&[i64]>,
    ) -> ScheduleResult<Vec<ExprRV>> {
        const NAME: &str = "sample_perfect_tile";
        self.guarded(|s| {
            if n == 0 || max_innermost_factor < 1 {
                return Err(ScheduleError::new(
                    codes::S0103,
                    NAME,
                    format!(
                        "need n >= 1 and max_innermost_factor >= 1, got {} and {}",
                        n, max_innermost_factor
                    ),
                ));
            }
            let id = s.loop_sref(loop_rv)?;
            let l = s.state.loop_(id).clone();
            let extent = l.extent.as_int();
            let (values, recorded) = match (decision, extent) {
                (Some(d), _) => {
                    check_tile_decision(extent, n, max_innermost_factor, d)?;
                    let values: Vec<Expr> = d.iter().map(|&f| Expr::Int(f)).collect();
                    (values, Some(Decision::Tiles(d.to_vec())))
                }
                (None, Some(extent)) => {
                    let tiles = s.sampler.perfect_tile(extent, n, max_innermost_factor)?;
                    let values: Vec<Expr> = tiles.iter().map(|&f| Expr::Int(f)).collect();
                    (values, Some(Decision::Tiles(tiles)))
                }
                (None, None) => {
                    let mut values: Vec<Expr> = (0..n - 1)
                        .map(|k| Expr::var(&Var::new(format!("{}_t{}", l.loop_var.name, k))))
                        .collect();
                    values.push(Expr::Int(1));
                    (values, None)
                }
            };
            let rvs: Vec<ExprRV> = values.into_iter().map(|v| s.rvs.add_expr(v)).collect();
            s.record(
                InstKind::SamplePerfectTile,
                vec![Arg::Rv(loop_rv.into())],
                vec![Attr::Int(n as i64), Attr::Int(max_innermost_factor)],
                rvs.iter().map(|&e| e.into()).collect(),
                recorded,
            );
            Ok(rvs)
        })
    }

    /// Marks where post-processing starts in the trace.
    pub fn enter_postproc(&mut self) {
        self.record(InstKind::EnterPostproc, Vec::new(), Vec::new(), Vec::new(), None);
    }
}
