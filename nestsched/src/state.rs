// state.rs — Schedule state: program, structural index, analysis cache, Replace
//
// `ScheduleState` exclusively owns the program being scheduled. The only way
// to change it is `replace`, which splices a rebuilt subtree into the program
// (copy-on-write up the ancestor chain), repairs the structural index in
// place so surviving statements keep their sref ids, and invalidates the
// analysis cache for the touched scopes.
//
// Preconditions: `replace` receives a fully built loop/block statement.
// Postconditions: after `replace`, srefs and loops/blocks are in bijection and
//                 every fresh cache entry matches a recomputation.
// Failure modes: none recoverable. Index/program mismatches are engine
//                defects and panic (verification is opt-in per DebugMask).
// Side effects: `log::debug!` per committed replace.

use std::collections::{HashMap, HashSet};
use std::ops::BitOr;
use std::sync::Arc;

use crate::id::SRefId;
use crate::instruction::StageCert;
use crate::ir::*;
use crate::scope::{analyze_scope, ScopeCache, ScopeInfo};
use crate::sref::{SRefTree, StmtPtr};

// ── Debug mask ──────────────────────────────────────────────────────────────

/// Verification to run after every `replace`. Bits combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugMask(u32);

impl DebugMask {
    pub const NONE: DebugMask = DebugMask(0);
    pub const VERIFY_SREF_TREE: DebugMask = DebugMask(1);
    pub const VERIFY_CACHED_FLAGS: DebugMask = DebugMask(2);
    pub const ALL: DebugMask = DebugMask(3);

    pub fn contains(self, other: DebugMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for DebugMask {
    type Output = DebugMask;

    fn bitor(self, rhs: DebugMask) -> DebugMask {
        DebugMask(self.0 | rhs.0)
    }
}

// ── Verification certificate ────────────────────────────────────────────────

/// Consistency obligations between the program, the structural index and
/// the analysis cache.
#[derive(Debug, Clone)]
pub struct StateCert {
    /// Every loop/block has exactly one sref and every live sref is bound to
    /// a statement of the program.
    pub v1_sref_bijection: bool,
    /// Every sref's parent link names the sref of its enclosing loop/block.
    pub v2_parent_links: bool,
    /// Every sref's position matches its index among the parent's children.
    pub v3_seq_positions: bool,
    /// Every cache entry trusted as fresh matches a recomputation.
    pub v4_cached_flags: bool,
}

impl StageCert for StateCert {
    fn all_pass(&self) -> bool {
        self.v1_sref_bijection && self.v2_parent_links && self.v3_seq_positions && self.v4_cached_flags
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("V1_sref_bijection", self.v1_sref_bijection),
            ("V2_parent_links", self.v2_parent_links),
            ("V3_seq_positions", self.v3_seq_positions),
            ("V4_cached_flags", self.v4_cached_flags),
        ]
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ScheduleState {
    program: Program,
    tree: SRefTree,
    root: SRefId,
    cache: ScopeCache,
    debug_mask: DebugMask,
    /// Number of committed replaces.
    generation: u64,
}

impl ScheduleState {
    /// Take ownership of a deep copy of `program`.
    pub fn new(program: &Program, debug_mask: DebugMask) -> Self {
        let program = Program {
            name: program.name.clone(),
            params: program.params.clone(),
            root: deep_copy(&program.root),
        };
        let (tree, root) = SRefTree::build(&program.root);
        Self {
            program,
            tree,
            root,
            cache: ScopeCache::new(),
            debug_mask,
            generation: 0,
        }
    }

    /// Independent state over a deep copy of the program. Every sref id that
    /// is live here names the corresponding statement in the copy.
    pub fn copy(&self) -> Self {
        let root_stmt = deep_copy(&self.program.root);
        let tree = self.tree.rebound_copy(self.root, &root_stmt);
        Self {
            program: Program {
                name: self.program.name.clone(),
                params: self.program.params.clone(),
                root: root_stmt,
            },
            tree,
            root: self.root,
            cache: self.cache.clone(),
            debug_mask: self.debug_mask,
            generation: self.generation,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn tree(&self) -> &SRefTree {
        &self.tree
    }

    pub fn root(&self) -> SRefId {
        self.root
    }

    pub fn debug_mask(&self) -> DebugMask {
        self.debug_mask
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn stmt(&self, id: SRefId) -> Arc<Stmt> {
        self.tree.node(id).stmt.clone()
    }

    pub fn get_sref(&self, stmt: &Arc<Stmt>) -> Option<SRefId> {
        self.tree.find(stmt)
    }

    /// Sref of a statement the engine just committed.
    pub fn sref_of(&self, stmt: &Arc<Stmt>) -> SRefId {
        match self.tree.find(stmt) {
            Some(id) => id,
            None => panic!("internal error: committed statement missing from structural index"),
        }
    }

    /// Block realize behind a block sref.
    pub fn block(&self, id: SRefId) -> &BlockRealize {
        match self.tree.node(id).stmt.as_ref() {
            Stmt::Block(br) => br,
            _ => panic!("internal error: sref {:?} is not a block", id),
        }
    }

    /// Loop behind a loop sref.
    pub fn loop_(&self, id: SRefId) -> &Loop {
        match self.tree.node(id).stmt.as_ref() {
            Stmt::Loop(l) => l,
            _ => panic!("internal error: sref {:?} is not a loop", id),
        }
    }

    pub fn parent(&self, id: SRefId) -> Option<SRefId> {
        self.tree.node(id).parent
    }

    /// Nearest strict ancestor that defines a scope.
    pub fn scope_root(&self, id: SRefId) -> Option<SRefId> {
        self.tree
            .ancestors(id)
            .into_iter()
            .find(|&a| self.tree.node(a).defines_scope())
    }

    /// Loops between `id` and its scope root, outermost first.
    pub fn loops_above(&self, id: SRefId) -> Vec<SRefId> {
        let mut out = Vec::new();
        for a in self.tree.ancestors(id) {
            if self.tree.node(a).defines_scope() {
                break;
            }
            out.push(a);
        }
        out.reverse();
        out
    }

    /// Nearest blocks strictly below `id`, in program order.
    pub fn child_blocks(&self, id: SRefId) -> Vec<SRefId> {
        crate::scope::child_block_stmts(&self.tree.node(id).stmt)
            .iter()
            .filter_map(|s| self.tree.find(s))
            .collect()
    }

    /// Direct structural children (loops/blocks) of `id`.
    pub fn children(&self, id: SRefId) -> Vec<SRefId> {
        self.tree
            .node(id)
            .stmt
            .structural_children()
            .iter()
            .filter_map(|s| self.tree.find(s))
            .collect()
    }

    pub fn is_ancestor(&self, a: SRefId, b: SRefId) -> bool {
        self.tree.is_ancestor(a, b)
    }

    /// Fresh analysis of the scope rooted at `scope`.
    pub fn scope_info(&mut self, scope: SRefId) -> Arc<ScopeInfo> {
        self.cache.get(&self.tree, scope)
    }

    /// True if the block writes a parameter buffer.
    pub fn is_output_block(&self, block: SRefId) -> bool {
        self.block(block)
            .block
            .writes
            .iter()
            .any(|w| self.program.is_param(&w.buffer))
    }

    /// True if `buffer` is allocated by some block of the program.
    pub fn is_internal_buffer(&self, buffer: &Buffer) -> bool {
        let mut found = false;
        self.program.root.visit_blocks(&mut |s| {
            if let Stmt::Block(br) = s.as_ref() {
                if br.block.alloc_buffers.contains(buffer) {
                    found = true;
                }
            }
        });
        found
    }

    // ── Replace ─────────────────────────────────────────────────────────────

    /// Commit `new_stmt` in place of the statement bound to `target`.
    ///
    /// Srefs in the replaced subtree are reused for statements that persist:
    /// a pointer-identical statement first, then a loop with the same loop
    /// variable, then a block with the same name. Everything else in the old
    /// subtree is retired and new statements get new srefs.
    pub fn replace(&mut self, target: SRefId, new_stmt: Arc<Stmt>) {
        assert!(
            new_stmt.is_structural(),
            "internal error: replace expects a loop or block statement"
        );
        let old_stmt = self.stmt(target);
        let target_parent = self.tree.node(target).parent;
        let target_pos = self.tree.node(target).seq_index;

        // Candidates for reuse.
        let old_ids = self.subtree_ids(target);
        let mut by_ptr: HashMap<StmtPtr, SRefId> = HashMap::new();
        let mut by_var: HashMap<u64, SRefId> = HashMap::new();
        let mut by_name: HashMap<String, SRefId> = HashMap::new();
        for &id in &old_ids {
            let stmt = &self.tree.node(id).stmt;
            by_ptr.insert(StmtPtr::of(stmt), id);
            match stmt.as_ref() {
                Stmt::Loop(l) => {
                    by_var.insert(l.loop_var.id, id);
                }
                Stmt::Block(br) => {
                    by_name.insert(br.block.name.clone(), id);
                }
                _ => {}
            }
        }

        // Rebuild ancestors.
        let mut rebuilt: Vec<(SRefId, Arc<Stmt>)> = Vec::new();
        let mut cur_old = old_stmt.clone();
        let mut cur_new = new_stmt.clone();
        for a in self.tree.ancestors(target) {
            let parent_stmt = self.stmt(a);
            let next = replace_child(&parent_stmt, &cur_old, &cur_new);
            rebuilt.push((a, next.clone()));
            cur_old = parent_stmt;
            cur_new = next;
        }
        self.program.root = cur_new;

        // Reindex the new subtree.
        let mut reindex = Reindex {
            by_ptr,
            by_var,
            by_name,
            used: HashSet::new(),
            refreshed_blocks: Vec::new(),
        };
        self.assign(&mut reindex, &new_stmt, target_parent, target_pos);
        let new_root_id = self.tree.find(&new_stmt);

        for &id in &old_ids {
            if !reindex.used.contains(&id) {
                if self.tree.node(id).is_block() {
                    self.cache.forget(id);
                }
                self.tree.retire(id);
            }
        }
        for (a, stmt) in rebuilt {
            self.tree.rebind(a, stmt);
        }
        if target == self.root {
            if let Some(id) = new_root_id {
                self.root = id;
            }
        }

        // Invalidate the nearest enclosing scope and every rebuilt block.
        if let Some(id) = new_root_id {
            if let Some(scope) = self.scope_root(id) {
                self.cache.invalidate(scope);
            }
        }
        for id in reindex.refreshed_blocks {
            self.cache.invalidate(id);
        }

        self.generation += 1;
        log::debug!(
            "replace #{}: {:?} -> {:?} ({} srefs live)",
            self.generation,
            target,
            new_root_id,
            self.tree.len()
        );

        if self.debug_mask != DebugMask::NONE {
            let cert = self.verify_with(self.debug_mask);
            if !cert.all_pass() {
                panic!(
                    "internal error: schedule state inconsistent after replace: {:?}",
                    cert.obligations()
                );
            }
        }
    }

    /// Every sref in the subtree rooted at `id`, pre-order.
    fn subtree_ids(&self, id: SRefId) -> Vec<SRefId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            let cur = out[i];
            out.extend(self.children(cur));
            i += 1;
        }
        out
    }

    fn assign(
        &mut self,
        rx: &mut Reindex,
        stmt: &Arc<Stmt>,
        parent: Option<SRefId>,
        seq_index: usize,
    ) {
        let reused = rx
            .by_ptr
            .get(&StmtPtr::of(stmt))
            .copied()
            .filter(|id| !rx.used.contains(id))
            .map(|id| (id, true))
            .or_else(|| {
                let by_key = match stmt.as_ref() {
                    Stmt::Loop(l) => rx.by_var.get(&l.loop_var.id).copied(),
                    Stmt::Block(br) => rx.by_name.get(&br.block.name).copied(),
                    _ => None,
                };
                by_key.filter(|id| !rx.used.contains(id)).map(|id| (id, false))
            });
        let id = match reused {
            Some((id, identical)) => {
                rx.used.insert(id);
                self.tree.rebind(id, stmt.clone());
                self.tree.relink(id, parent, seq_index);
                if !identical && self.tree.node(id).is_block() {
                    rx.refreshed_blocks.push(id);
                }
                id
            }
            None => {
                let id = self.tree.alloc(stmt.clone(), parent, seq_index);
                if self.tree.node(id).is_block() {
                    rx.refreshed_blocks.push(id);
                }
                id
            }
        };
        for (i, child) in stmt.structural_children().iter().enumerate() {
            self.assign(rx, child, Some(id), i);
        }
    }

    // ── Verification ────────────────────────────────────────────────────────

    /// Run every consistency check.
    pub fn verify(&self) -> StateCert {
        self.verify_with(DebugMask::ALL)
    }

    fn verify_with(&self, mask: DebugMask) -> StateCert {
        let mut cert = StateCert {
            v1_sref_bijection: true,
            v2_parent_links: true,
            v3_seq_positions: true,
            v4_cached_flags: true,
        };
        if mask.contains(DebugMask::VERIFY_SREF_TREE) {
            let mut seen = 0usize;
            self.verify_node(&self.program.root, None, 0, &mut seen, &mut cert);
            if seen != self.tree.len() || self.tree.live_ids().len() != seen {
                cert.v1_sref_bijection = false;
            }
        }
        if mask.contains(DebugMask::VERIFY_CACHED_FLAGS) {
            for (scope, info) in self.cache.fresh_entries() {
                let live = self.tree.get(scope).map(|n| n.is_block()).unwrap_or(false);
                if !live {
                    cert.v4_cached_flags = false;
                    continue;
                }
                let recomputed = analyze_scope(&self.tree, scope, info.generation);
                if !recomputed.same_flags(&info) {
                    cert.v4_cached_flags = false;
                }
            }
        }
        cert
    }

    fn verify_node(
        &self,
        stmt: &Arc<Stmt>,
        parent: Option<SRefId>,
        pos: usize,
        seen: &mut usize,
        cert: &mut StateCert,
    ) {
        let Some(id) = self.tree.find(stmt) else {
            cert.v1_sref_bijection = false;
            return;
        };
        *seen += 1;
        match self.tree.get(id) {
            Some(node) => {
                if !Arc::ptr_eq(&node.stmt, stmt) {
                    cert.v1_sref_bijection = false;
                }
                if node.parent != parent {
                    cert.v2_parent_links = false;
                }
                if parent.is_some() && node.seq_index != pos {
                    cert.v3_seq_positions = false;
                }
            }
            None => cert.v1_sref_bijection = false,
        }
        for (i, child) in stmt.structural_children().iter().enumerate() {
            self.verify_node(child, Some(id), i, seen, cert);
        }
    }
}

struct Reindex {
    by_ptr: HashMap<StmtPtr, SRefId>,
    by_var: HashMap<u64, SRefId>,
    by_name: HashMap<String, SRefId>,
    used: HashSet<SRefId>,
    refreshed_blocks: Vec<SRefId>,
}

// ── Tree surgery ────────────────────────────────────────────────────────────

/// Rebuild `parent` with its structural child `old` (by pointer) swapped for
/// `new`. Looks through sequences.
pub fn replace_child(parent: &Arc<Stmt>, old: &Arc<Stmt>, new: &Arc<Stmt>) -> Arc<Stmt> {
    match parent.as_ref() {
        Stmt::Loop(l) => Arc::new(Stmt::Loop(l.with_body(swap_in(&l.body, old, new)))),
        Stmt::Block(br) => {
            let block = Block {
                body: swap_in(&br.block.body, old, new),
                ..br.block.clone()
            };
            Arc::new(Stmt::Block(br.with_block(block)))
        }
        _ => swap_in(parent, old, new),
    }
}

fn swap_in(body: &Arc<Stmt>, old: &Arc<Stmt>, new: &Arc<Stmt>) -> Arc<Stmt> {
    if Arc::ptr_eq(body, old) {
        return new.clone();
    }
    match body.as_ref() {
        Stmt::Seq(items) => Arc::new(Stmt::Seq(
            items.iter().map(|s| swap_in(s, old, new)).collect(),
        )),
        _ => body.clone(),
    }
}

/// Rebuild `root` with the statement `target` (by pointer) replaced by
/// `replacement`, or removed when `replacement` is `None`. Sequences are
/// flattened; untouched siblings are shared.
pub fn splice(root: &Arc<Stmt>, target: &Arc<Stmt>, replacement: Option<Arc<Stmt>>) -> Arc<Stmt> {
    match splice_stmt(root, target, &replacement) {
        Some(s) => s,
        None => panic!("internal error: splice target is not under the given root"),
    }
}

fn splice_stmt(stmt: &Arc<Stmt>, target: &Arc<Stmt>, repl: &Option<Arc<Stmt>>) -> Option<Arc<Stmt>> {
    match stmt.as_ref() {
        Stmt::Loop(l) => {
            let body = splice_body(&l.body, target, repl)?;
            Some(Arc::new(Stmt::Loop(l.with_body(body))))
        }
        Stmt::Block(br) => {
            let body = splice_body(&br.block.body, target, repl)?;
            Some(Arc::new(Stmt::Block(br.with_block(Block {
                body,
                ..br.block.clone()
            }))))
        }
        _ => splice_body(stmt, target, repl),
    }
}

fn splice_body(body: &Arc<Stmt>, target: &Arc<Stmt>, repl: &Option<Arc<Stmt>>) -> Option<Arc<Stmt>> {
    if Arc::ptr_eq(body, target) {
        return Some(match repl {
            Some(r) => r.clone(),
            None => Arc::new(Stmt::Seq(Vec::new())),
        });
    }
    match body.as_ref() {
        Stmt::Seq(items) => {
            for (i, item) in items.iter().enumerate() {
                if Arc::ptr_eq(item, target) {
                    let mut out: Vec<Arc<Stmt>> = items[..i].to_vec();
                    if let Some(r) = repl {
                        out.push(r.clone());
                    }
                    out.extend(items[i + 1..].iter().cloned());
                    return Some(seq(out));
                }
                if let Some(rebuilt) = splice_stmt(item, target, repl) {
                    let mut out = items.clone();
                    out[i] = rebuilt;
                    return Some(Arc::new(Stmt::Seq(out)));
                }
            }
            None
        }
        Stmt::Loop(_) | Stmt::Block(_) => splice_stmt(body, target, repl),
        Stmt::Store(_) => None,
    }
}

/// Rebuild a subtree, replacing each nearest block for which `f` returns a
/// new realize. Blocks `f` declines are kept (and not descended into).
/// Unchanged subtrees are shared.
pub fn map_blocks(
    stmt: &Arc<Stmt>,
    f: &mut impl FnMut(&Arc<Stmt>, &BlockRealize) -> Option<BlockRealize>,
) -> Arc<Stmt> {
    match stmt.as_ref() {
        Stmt::Block(br) => match f(stmt, br) {
            Some(new) => Arc::new(Stmt::Block(new)),
            None => stmt.clone(),
        },
        Stmt::Loop(l) => {
            let body = map_blocks(&l.body, f);
            if Arc::ptr_eq(&body, &l.body) {
                stmt.clone()
            } else {
                Arc::new(Stmt::Loop(l.with_body(body)))
            }
        }
        Stmt::Seq(items) => {
            let new_items: Vec<Arc<Stmt>> = items.iter().map(|s| map_blocks(s, f)).collect();
            if new_items.iter().zip(items.iter()).all(|(a, b)| Arc::ptr_eq(a, b)) {
                stmt.clone()
            } else {
                Arc::new(Stmt::Seq(new_items))
            }
        }
        Stmt::Store(_) => stmt.clone(),
    }
}

/// Apply `map_blocks` to the body of a scope block.
pub fn map_scope_blocks(
    scope: &Arc<Stmt>,
    f: &mut impl FnMut(&Arc<Stmt>, &BlockRealize) -> Option<BlockRealize>,
) -> Arc<Stmt> {
    match scope.as_ref() {
        Stmt::Block(br) => {
            let body = map_blocks(&br.block.body, f);
            Arc::new(Stmt::Block(br.with_block(Block {
                body,
                ..br.block.clone()
            })))
        }
        _ => map_blocks(scope, f),
    }
}

/// A scope block with `buffer` added to (or removed from) its allocations.
pub fn with_alloc(scope: &Arc<Stmt>, buffer: &Buffer, present: bool) -> Arc<Stmt> {
    match scope.as_ref() {
        Stmt::Block(br) => {
            let mut block = br.block.clone();
            block.alloc_buffers.retain(|b| b != buffer);
            if present {
                block.alloc_buffers.push(buffer.clone());
            }
            Arc::new(Stmt::Block(br.with_block(block)))
        }
        _ => panic!("internal error: allocation target is not a block"),
    }
}

impl ScheduleState {
    /// Outermost statement between `block` and its scope root that contains
    /// nothing but `block`: the nest that moves or disappears with it.
    pub fn nest_root(&self, block: SRefId) -> SRefId {
        let mut cur = block;
        while let Some(parent) = self.parent(cur) {
            let node = self.tree.node(parent);
            if node.defines_scope() {
                break;
            }
            let Stmt::Loop(l) = node.stmt.as_ref() else {
                break;
            };
            if !Arc::ptr_eq(&l.body, &self.tree.node(cur).stmt) {
                break;
            }
            cur = parent;
        }
        cur
    }

    /// Index of the top-level statement of the scope body that contains
    /// `id`, together with the scope body items.
    pub fn top_level_position(&self, scope: SRefId, id: SRefId) -> Option<usize> {
        let br = self.block(scope);
        let items = seq_items(&br.block.body);
        let mut top = id;
        while let Some(p) = self.parent(top) {
            if p == scope {
                break;
            }
            top = p;
        }
        let top_stmt = self.tree.node(top).stmt.clone();
        items.iter().position(|s| Arc::ptr_eq(s, &top_stmt))
    }
}

/// Rebuild every statement node of a subtree with fresh allocations.
/// Variables and buffers are shared.
pub fn deep_copy(stmt: &Arc<Stmt>) -> Arc<Stmt> {
    Arc::new(match stmt.as_ref() {
        Stmt::Loop(l) => Stmt::Loop(l.with_body(deep_copy(&l.body))),
        Stmt::Block(br) => Stmt::Block(br.with_block(Block {
            init: br.block.init.as_ref().map(deep_copy),
            body: deep_copy(&br.block.body),
            ..br.block.clone()
        })),
        Stmt::Seq(items) => Stmt::Seq(items.iter().map(deep_copy).collect()),
        Stmt::Store(s) => Stmt::Store(s.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    fn first_loop(state: &ScheduleState) -> SRefId {
        state.children(state.root())[0]
    }

    #[test]
    fn fresh_state_verifies() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let info = state.scope_info(state.root());
        assert_eq!(info.child_blocks.len(), 2);
        let cert = state.verify();
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn replace_with_same_loop_var_keeps_sref() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let outer = first_loop(&state);
        let inner = state.children(outer)[0];
        let l = state.loop_(outer).clone();
        let mut annotated = l.clone();
        annotated.annotations.insert("pragma".into(), AnnValue::Int(1));
        state.replace(outer, Arc::new(Stmt::Loop(annotated)));
        assert!(state.tree().is_live(outer));
        // The inner loop is pointer-identical and keeps its sref.
        assert!(state.tree().is_live(inner));
        assert_eq!(state.loop_(outer).annotations.len(), 1);
        assert!(state.verify().all_pass());
    }

    #[test]
    fn replace_retires_dropped_statements() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let outer = first_loop(&state);
        let inner = state.children(outer)[0];
        let block = state.children(inner)[0];
        let l = state.loop_(outer).clone();
        // Collapse the inner loop: bind the block directly under `outer`,
        // with a fresh loop variable on the outer loop as well.
        let br = state.block(block).clone();
        let new_outer = Loop::serial(l.loop_var.fresh(), l.extent.clone(), Arc::new(Stmt::Block(br)));
        state.replace(outer, Arc::new(Stmt::Loop(new_outer)));
        assert!(!state.tree().is_live(outer));
        assert!(!state.tree().is_live(inner));
        assert!(state.tree().is_live(block));
        assert!(state.verify().all_pass());
    }

    #[test]
    fn copy_keeps_ids_and_is_independent() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let outer = first_loop(&state);
        let mut copy = state.copy();
        assert!(copy.tree().is_live(outer));
        assert!(!Arc::ptr_eq(&copy.stmt(outer), &state.stmt(outer)));
        let l = copy.loop_(outer).clone();
        let mut k = l.clone();
        k.kind = ForKind::Unrolled;
        copy.replace(outer, Arc::new(Stmt::Loop(k)));
        assert_eq!(state.loop_(outer).kind, ForKind::Serial);
        assert!(state.verify().all_pass());
        assert!(copy.verify().all_pass());
    }
}
