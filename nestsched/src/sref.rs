// sref.rs — Structural index: stable-identity nodes for every loop and block
//
// An arena of nodes, one per loop/block statement in the program. A node
// holds the statement it is currently bound to, an index-only link to its
// parent, and its position among the parent's structural children. Rewrites
// rebind a node to a new statement instead of relocating it, so ids stay
// valid across edits. Retiring a node bumps its slot generation, which turns
// every outstanding id for it into a detectable stale id.
//
// Preconditions: statements handed to `build` / `bind` are loops or blocks.
// Postconditions: `stmt2ref` is the exact inverse of the live nodes' stmts.
// Failure modes: lookups of stale ids return `None`; `node()` on a stale id
//                is an engine defect and panics.
// Side effects: none.

use std::collections::HashMap;
use std::sync::Arc;

use crate::id::SRefId;
use crate::ir::Stmt;

/// Address of a shared statement, used as its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtPtr(usize);

impl StmtPtr {
    pub fn of(stmt: &Arc<Stmt>) -> Self {
        StmtPtr(Arc::as_ptr(stmt) as usize)
    }
}

/// One node of the structural index.
#[derive(Debug, Clone)]
pub struct SRefNode {
    pub stmt: Arc<Stmt>,
    pub parent: Option<SRefId>,
    /// Position among the parent's structural children.
    pub seq_index: usize,
}

impl SRefNode {
    pub fn is_block(&self) -> bool {
        matches!(self.stmt.as_ref(), Stmt::Block(_))
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.stmt.as_ref(), Stmt::Loop(_))
    }

    /// Every block introduces its own dependency scope.
    pub fn defines_scope(&self) -> bool {
        self.is_block()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<SRefNode>,
}

/// Arena of structural-index nodes.
#[derive(Debug, Clone, Default)]
pub struct SRefTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stmt2ref: HashMap<StmtPtr, SRefId>,
}

impl SRefTree {
    /// Index every loop and block under (and including) `root`.
    pub fn build(root: &Arc<Stmt>) -> (Self, SRefId) {
        let mut tree = SRefTree::default();
        let root_id = tree.alloc(root.clone(), None, 0);
        tree.build_children(root, root_id);
        (tree, root_id)
    }

    fn build_children(&mut self, stmt: &Arc<Stmt>, parent: SRefId) {
        for (i, child) in stmt.structural_children().into_iter().enumerate() {
            let id = self.alloc(child.clone(), Some(parent), i);
            self.build_children(&child, id);
        }
    }

    /// Create a node for `stmt`. Recycles a retired slot when one exists.
    pub fn alloc(&mut self, stmt: Arc<Stmt>, parent: Option<SRefId>, seq_index: usize) -> SRefId {
        let ptr = StmtPtr::of(&stmt);
        let node = SRefNode {
            stmt,
            parent,
            seq_index,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                SRefId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                SRefId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.stmt2ref.insert(ptr, id);
        id
    }

    /// Retire a node: its id (and every copy of it) becomes stale.
    pub fn retire(&mut self, id: SRefId) {
        let slot = &mut self.slots[id.index as usize];
        if slot.generation != id.generation {
            return;
        }
        if let Some(node) = slot.node.take() {
            let ptr = StmtPtr::of(&node.stmt);
            if self.stmt2ref.get(&ptr) == Some(&id) {
                self.stmt2ref.remove(&ptr);
            }
        }
        slot.generation += 1;
        self.free.push(id.index);
    }

    /// Rebind a live node to a new statement.
    pub fn rebind(&mut self, id: SRefId, stmt: Arc<Stmt>) {
        let ptr = StmtPtr::of(&stmt);
        let old_ptr = StmtPtr::of(&self.node(id).stmt);
        if self.stmt2ref.get(&old_ptr) == Some(&id) {
            self.stmt2ref.remove(&old_ptr);
        }
        self.node_mut(id).stmt = stmt;
        self.stmt2ref.insert(ptr, id);
    }

    pub fn relink(&mut self, id: SRefId, parent: Option<SRefId>, seq_index: usize) {
        let node = self.node_mut(id);
        node.parent = parent;
        node.seq_index = seq_index;
    }

    pub fn get(&self, id: SRefId) -> Option<&SRefNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn is_live(&self, id: SRefId) -> bool {
        self.get(id).is_some()
    }

    /// Node access for ids the engine itself holds. A stale id here is an
    /// engine defect.
    pub fn node(&self, id: SRefId) -> &SRefNode {
        match self.get(id) {
            Some(node) => node,
            None => panic!("internal error: stale sref {:?} used inside the engine", id),
        }
    }

    fn node_mut(&mut self, id: SRefId) -> &mut SRefNode {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(
            slot.generation, id.generation,
            "internal error: stale sref {:?} used inside the engine",
            id
        );
        match slot.node.as_mut() {
            Some(node) => node,
            None => panic!("internal error: retired sref {:?} used inside the engine", id),
        }
    }

    pub fn find(&self, stmt: &Arc<Stmt>) -> Option<SRefId> {
        self.stmt2ref.get(&StmtPtr::of(stmt)).copied()
    }

    pub fn find_ptr(&self, ptr: StmtPtr) -> Option<SRefId> {
        self.stmt2ref.get(&ptr).copied()
    }

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, id: SRefId) -> Vec<SRefId> {
        let mut out = Vec::new();
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.node(p).parent;
        }
        out
    }

    /// True if `a` is a strict ancestor of `b`.
    pub fn is_ancestor(&self, a: SRefId, b: SRefId) -> bool {
        self.ancestors(b).contains(&a)
    }

    /// Ids of every live node, in slot order.
    pub fn live_ids(&self) -> Vec<SRefId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| SRefId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stmt2ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmt2ref.is_empty()
    }

    /// A copy bound to `new_root`, a deep copy of the current program whose
    /// loops/blocks correspond one-to-one in structural position. Every node
    /// keeps its slot, so ids held against `self` are valid in the copy.
    pub fn rebound_copy(&self, root_id: SRefId, new_root: &Arc<Stmt>) -> SRefTree {
        let mut copy = self.clone();
        copy.stmt2ref.clear();
        copy.rebind_parallel(self, root_id, new_root);
        copy
    }

    fn rebind_parallel(&mut self, original: &SRefTree, id: SRefId, new_stmt: &Arc<Stmt>) {
        let old_stmt = original.node(id).stmt.clone();
        self.node_mut(id).stmt = new_stmt.clone();
        self.stmt2ref.insert(StmtPtr::of(new_stmt), id);
        let old_children = old_stmt.structural_children();
        let new_children = new_stmt.structural_children();
        assert_eq!(
            old_children.len(),
            new_children.len(),
            "internal error: deep copy changed program structure"
        );
        for (old_child, new_child) in old_children.iter().zip(new_children.iter()) {
            let child_id = match original.find(old_child) {
                Some(c) => c,
                None => panic!("internal error: statement missing from structural index"),
            };
            self.rebind_parallel(original, child_id, new_child);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    #[test]
    fn build_indexes_every_loop_and_block() {
        let program = workload::elementwise_chain(16);
        let (tree, root) = SRefTree::build(&program.root);
        // root + (2 loops + block) * 2 stages
        assert_eq!(tree.len(), 7);
        assert!(tree.node(root).parent.is_none());
        for id in tree.live_ids() {
            if id != root {
                assert!(tree.is_ancestor(root, id));
            }
        }
    }

    #[test]
    fn retired_ids_are_stale_after_slot_reuse() {
        let program = workload::elementwise_chain(8);
        let (mut tree, root) = SRefTree::build(&program.root);
        let victim = tree.live_ids()[1];
        let stmt = tree.node(victim).stmt.clone();
        tree.retire(victim);
        assert!(tree.get(victim).is_none());
        let reborn = tree.alloc(stmt, Some(root), 0);
        assert_eq!(reborn.index, victim.index);
        assert_ne!(reborn.generation, victim.generation);
        assert!(tree.get(victim).is_none());
        assert!(tree.get(reborn).is_some());
    }
}
