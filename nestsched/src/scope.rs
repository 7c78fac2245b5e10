// scope.rs — Per-scope dependency analysis and its generation-checked cache
//
// A scope is a block sref. Its analysis covers the nearest blocks below it
// (not descending into nested blocks): their classification (complete /
// reduction / affine), the producer-consumer graph among them, and the three
// scope flags primitives check.
//
// Preconditions: the structural index is consistent with the program.
// Postconditions: a returned `ScopeInfo` was computed at the scope's current
//                 generation.
// Failure modes: none (analysis is total).
// Side effects: `ScopeCache::get` may recompute and store an entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::arith;
use crate::id::SRefId;
use crate::ir::*;
use crate::sref::SRefTree;

// ── Dependencies ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// Read after write: `dst` reads what `src` wrote.
    Raw,
    /// Write after write.
    Waw,
    /// Write after read: `dst` overwrites what `src` read.
    War,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub src: SRefId,
    pub dst: SRefId,
    pub kind: DepKind,
}

// ── ScopeInfo ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScopeInfo {
    /// Scope generation this entry was computed at.
    pub generation: u64,
    /// Child blocks in program order.
    pub child_blocks: Vec<SRefId>,
    /// Every child block binds its iterators quasi-affinely.
    pub affine_bindings: bool,
    /// No write-after-read hazards and at most one writer per buffer.
    pub stage_pipeline: bool,
    /// Every child block is complete or reduction.
    pub compact_dataflow: bool,
    pub deps: Vec<Dependency>,
    pub buffer_writers: HashMap<Buffer, Vec<SRefId>>,
    pub complete: HashSet<SRefId>,
    pub reduction: HashSet<SRefId>,
    pub affine: HashSet<SRefId>,
}

impl ScopeInfo {
    /// Blocks whose output `block` reads.
    pub fn producers(&self, block: SRefId) -> Vec<SRefId> {
        let mut out = Vec::new();
        for d in &self.deps {
            if d.kind == DepKind::Raw && d.dst == block && !out.contains(&d.src) {
                out.push(d.src);
            }
        }
        out
    }

    /// Blocks that read the output of `block`.
    pub fn consumers(&self, block: SRefId) -> Vec<SRefId> {
        let mut out = Vec::new();
        for d in &self.deps {
            if d.kind == DepKind::Raw && d.src == block && !out.contains(&d.dst) {
                out.push(d.dst);
            }
        }
        out
    }

    pub fn writers_of(&self, buffer: &Buffer) -> &[SRefId] {
        self.buffer_writers
            .get(buffer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_complete(&self, block: SRefId) -> bool {
        self.complete.contains(&block)
    }

    pub fn is_reduction(&self, block: SRefId) -> bool {
        self.reduction.contains(&block)
    }

    pub fn is_affine(&self, block: SRefId) -> bool {
        self.affine.contains(&block)
    }

    /// Flag-level equality, used by cache verification.
    pub fn same_flags(&self, other: &ScopeInfo) -> bool {
        self.child_blocks == other.child_blocks
            && self.affine_bindings == other.affine_bindings
            && self.stage_pipeline == other.stage_pipeline
            && self.compact_dataflow == other.compact_dataflow
            && self.complete == other.complete
            && self.reduction == other.reduction
            && self.deps == other.deps
    }
}

/// Nearest block statements strictly below `stmt`, in program order.
pub fn child_block_stmts(stmt: &Arc<Stmt>) -> Vec<Arc<Stmt>> {
    let mut out = Vec::new();
    for child in stmt.structural_children() {
        collect_blocks(&child, &mut out);
    }
    out
}

fn collect_blocks(stmt: &Arc<Stmt>, out: &mut Vec<Arc<Stmt>>) {
    match stmt.as_ref() {
        Stmt::Block(_) => out.push(stmt.clone()),
        _ => {
            for child in stmt.structural_children() {
                collect_blocks(&child, out);
            }
        }
    }
}

/// Loop variables between `block` and its scope root `scope`.
fn loop_vars_above(tree: &SRefTree, block: SRefId, scope: SRefId) -> HashSet<Var> {
    let mut vars = HashSet::new();
    for a in tree.ancestors(block) {
        if a == scope {
            break;
        }
        if let Stmt::Loop(l) = tree.node(a).stmt.as_ref() {
            vars.insert(l.loop_var.clone());
        }
    }
    vars
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

/// Analyze the scope rooted at `scope`.
pub fn analyze_scope(tree: &SRefTree, scope: SRefId, generation: u64) -> ScopeInfo {
    let scope_stmt = tree.node(scope).stmt.clone();
    let mut child_blocks = Vec::new();
    for s in child_block_stmts(&scope_stmt) {
        match tree.find(&s) {
            Some(id) => child_blocks.push(id),
            None => panic!("internal error: child block missing from structural index"),
        }
    }

    let mut buffer_writers: HashMap<Buffer, Vec<SRefId>> = HashMap::new();
    for &id in &child_blocks {
        if let Some(br) = tree.node(id).stmt.as_block() {
            for buf in buffers_of(&br.block.writes) {
                buffer_writers.entry(buf).or_default().push(id);
            }
        }
    }

    let mut affine = HashSet::new();
    let mut complete = HashSet::new();
    let mut reduction = HashSet::new();
    for &id in &child_blocks {
        let node = tree.node(id);
        let Some(br) = node.stmt.as_block() else {
            continue;
        };
        let vars = loop_vars_above(tree, id, scope);
        if br
            .iter_values
            .iter()
            .all(|v| arith::is_quasi_affine(v, &vars))
        {
            affine.insert(id);
        }
        let block = &br.block;
        let written = buffers_of(&block.writes);
        let read = buffers_of(&block.reads);
        let sole_writer = written
            .iter()
            .all(|b| buffer_writers.get(b).map(|w| w.len() == 1).unwrap_or(false));
        let all_data_par = block.iter_vars.iter().all(|iv| iv.kind == IterKind::DataPar);
        if all_data_par && sole_writer && written.iter().all(|b| !read.contains(b)) {
            complete.insert(id);
        }
        if is_reduction_shape(block) && sole_writer {
            reduction.insert(id);
        }
    }

    let mut deps = Vec::new();
    for (i, &src) in child_blocks.iter().enumerate() {
        let Some(src_br) = tree.node(src).stmt.as_block() else {
            continue;
        };
        let src_writes = buffers_of(&src_br.block.writes);
        let src_reads = buffers_of(&src_br.block.reads);
        for &dst in &child_blocks[i + 1..] {
            let Some(dst_br) = tree.node(dst).stmt.as_block() else {
                continue;
            };
            let dst_writes = buffers_of(&dst_br.block.writes);
            let dst_reads = buffers_of(&dst_br.block.reads);
            if src_writes.iter().any(|b| dst_reads.contains(b)) {
                deps.push(Dependency { src, dst, kind: DepKind::Raw });
            }
            if src_writes.iter().any(|b| dst_writes.contains(b)) {
                deps.push(Dependency { src, dst, kind: DepKind::Waw });
            }
            if src_reads.iter().any(|b| dst_writes.contains(b)) {
                deps.push(Dependency { src, dst, kind: DepKind::War });
            }
        }
    }

    let affine_bindings = child_blocks.iter().all(|id| affine.contains(id));
    let stage_pipeline = !deps.iter().any(|d| d.kind != DepKind::Raw);
    let compact_dataflow = child_blocks
        .iter()
        .all(|id| complete.contains(id) || reduction.contains(id));

    ScopeInfo {
        generation,
        child_blocks,
        affine_bindings,
        stage_pipeline,
        compact_dataflow,
        deps,
        buffer_writers,
        complete,
        reduction,
        affine,
    }
}

/// An init, only data-parallel/reduction iterators, and write indices free of
/// reduction iterators.
fn is_reduction_shape(block: &Block) -> bool {
    if block.init.is_none() {
        return false;
    }
    if block
        .iter_vars
        .iter()
        .any(|iv| iv.kind == IterKind::Opaque)
    {
        return false;
    }
    let reduce_vars: Vec<&Var> = block
        .iter_vars
        .iter()
        .filter(|iv| iv.kind == IterKind::CommReduce)
        .map(|iv| &iv.var)
        .collect();
    block.writes.iter().all(|w| {
        w.region.iter().all(|r| {
            reduce_vars
                .iter()
                .all(|v| !r.min.uses_var(v) && !r.extent.uses_var(v))
        })
    })
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// Memoized `ScopeInfo` per scope sref, each guarded by the scope's
/// generation counter.
#[derive(Debug, Clone, Default)]
pub struct ScopeCache {
    entries: HashMap<SRefId, Arc<ScopeInfo>>,
    generations: HashMap<SRefId, u64>,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, scope: SRefId) -> u64 {
        self.generations.get(&scope).copied().unwrap_or(0)
    }

    /// Mark the scope's analysis stale.
    pub fn invalidate(&mut self, scope: SRefId) {
        *self.generations.entry(scope).or_insert(0) += 1;
    }

    /// Drop everything known about a retired scope.
    pub fn forget(&mut self, scope: SRefId) {
        self.entries.remove(&scope);
        self.generations.remove(&scope);
    }

    /// Fresh analysis of `scope`, recomputed if the stored entry is behind.
    pub fn get(&mut self, tree: &SRefTree, scope: SRefId) -> Arc<ScopeInfo> {
        let current = self.generation(scope);
        if let Some(info) = self.entries.get(&scope) {
            if info.generation == current {
                return info.clone();
            }
        }
        log::trace!("scope {:?}: recomputing analysis at generation {}", scope, current);
        let info = Arc::new(analyze_scope(tree, scope, current));
        self.entries.insert(scope, info.clone());
        info
    }

    /// Entries currently considered fresh.
    pub fn fresh_entries(&self) -> Vec<(SRefId, Arc<ScopeInfo>)> {
        self.entries
            .iter()
            .filter(|(id, info)| info.generation == self.generation(**id))
            .map(|(id, info)| (*id, info.clone()))
            .collect()
    }
}
