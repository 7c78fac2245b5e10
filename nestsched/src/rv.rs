// rv.rs — Random-variable table
//
// Maps opaque handles to structural-index nodes (loops, blocks) or to
// expression values. Handle ids are never reused. Resolving a handle whose
// sref has been retired fails: sref ids carry a slot generation, so a
// recycled slot never resolves for an old handle. `pruned` drops such
// entries; an issued id that was neither removed nor kept still reports as
// retired.
//
// Preconditions: none.
// Postconditions: `resolve_*` returns only live srefs of the requested kind.
// Failure modes: unknown, removed, retired, or wrong-kind handles return
//                `ScheduleError` (S0001-S0003).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::{AnyRV, BlockRV, ExprRV, LoopRV, RvAllocator, SRefId};
use crate::ir::Expr;
use crate::sref::SRefTree;

#[derive(Debug, Clone, PartialEq)]
pub enum RvValue {
    Sref(SRefId),
    Expr(Expr),
}

#[derive(Debug, Clone, Default)]
pub struct RvTable {
    alloc: RvAllocator,
    entries: BTreeMap<u32, RvValue>,
    removed: BTreeSet<u32>,
}

impl RvTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_loop(&mut self, sref: SRefId) -> LoopRV {
        let rv = self.alloc.alloc_loop();
        self.entries.insert(rv.0, RvValue::Sref(sref));
        rv
    }

    pub fn add_block(&mut self, sref: SRefId) -> BlockRV {
        let rv = self.alloc.alloc_block();
        self.entries.insert(rv.0, RvValue::Sref(sref));
        rv
    }

    pub fn add_expr(&mut self, value: Expr) -> ExprRV {
        let rv = self.alloc.alloc_expr();
        self.entries.insert(rv.0, RvValue::Expr(value));
        rv
    }

    /// Raw binding of a handle, without liveness checks.
    pub fn lookup(&self, rv: AnyRV) -> ScheduleResult<&RvValue> {
        if let Some(v) = self.entries.get(&rv.raw()) {
            return Ok(v);
        }
        if self.alloc.issued(rv.raw()) && !self.removed.contains(&rv.raw()) {
            return Err(retired(rv));
        }
        Err(ScheduleError::new(
            codes::S0001,
            "get",
            format!("unknown random variable {}", display_rv(rv)),
        ))
    }

    pub fn remove(&mut self, rv: AnyRV) -> ScheduleResult<()> {
        match self.entries.remove(&rv.raw()) {
            Some(_) => {
                self.removed.insert(rv.raw());
                Ok(())
            }
            None => Err(ScheduleError::new(
                codes::S0001,
                "remove_rv",
                format!("unknown random variable {}", display_rv(rv)),
            )),
        }
    }

    /// Live sref behind a loop or block handle.
    pub fn resolve_sref(&self, rv: AnyRV, tree: &SRefTree) -> ScheduleResult<SRefId> {
        let id = match self.lookup(rv)? {
            RvValue::Sref(id) => *id,
            RvValue::Expr(_) => {
                return Err(ScheduleError::new(
                    codes::S0003,
                    "get",
                    format!("{} is an expression, not a loop or block", display_rv(rv)),
                ))
            }
        };
        let Some(node) = tree.get(id) else {
            return Err(retired(rv));
        };
        let kind_ok = match rv {
            AnyRV::Loop(_) => node.is_loop(),
            AnyRV::Block(_) => node.is_block(),
            AnyRV::Expr(_) => false,
        };
        if !kind_ok {
            return Err(ScheduleError::new(
                codes::S0003,
                "get",
                format!("{} does not refer to a statement of its kind", display_rv(rv)),
            ));
        }
        Ok(id)
    }

    pub fn resolve_loop(&self, rv: LoopRV, tree: &SRefTree) -> ScheduleResult<SRefId> {
        self.resolve_sref(rv.into(), tree)
    }

    pub fn resolve_block(&self, rv: BlockRV, tree: &SRefTree) -> ScheduleResult<SRefId> {
        self.resolve_sref(rv.into(), tree)
    }

    pub fn resolve_expr(&self, rv: ExprRV) -> ScheduleResult<Expr> {
        match self.lookup(rv.into())? {
            RvValue::Expr(e) => Ok(e.clone()),
            RvValue::Sref(_) => Err(ScheduleError::new(
                codes::S0003,
                "get",
                format!("{} is not an expression", display_rv(rv.into())),
            )),
        }
    }

    /// Copy of the table without entries whose sref is no longer in `tree`.
    pub fn pruned(&self, tree: &SRefTree) -> RvTable {
        RvTable {
            alloc: self.alloc.clone(),
            entries: self
                .entries
                .iter()
                .filter(|(_, v)| match v {
                    RvValue::Sref(id) => tree.is_live(*id),
                    RvValue::Expr(_) => true,
                })
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            removed: self.removed.clone(),
        }
    }
}

fn retired(rv: AnyRV) -> ScheduleError {
    ScheduleError::new(
        codes::S0002,
        "get",
        format!("{} refers to a statement that no longer exists", display_rv(rv)),
    )
    .with_hint("the statement was removed by an earlier primitive")
}

/// `l3`, `b0`, `v5`: kind letter plus id.
pub fn display_rv(rv: AnyRV) -> String {
    match rv {
        AnyRV::Loop(LoopRV(id)) => format!("l{}", id),
        AnyRV::Block(BlockRV(id)) => format!("b{}", id),
        AnyRV::Expr(ExprRV(id)) => format!("v{}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    #[test]
    fn resolve_checks_kind_and_liveness() {
        let p = workload::scale_1d(8);
        let (mut tree, root) = SRefTree::build(&p.root);
        let loop_id = tree.live_ids()[1];
        let mut table = RvTable::new();
        let b = table.add_block(root);
        let l = table.add_loop(loop_id);
        assert_eq!(table.resolve_block(b, &tree).unwrap(), root);
        let wrong = table.resolve_sref(AnyRV::Block(BlockRV(l.0)), &tree).unwrap_err();
        assert_eq!(wrong.code, codes::S0003);
        tree.retire(loop_id);
        assert_eq!(table.resolve_loop(l, &tree).unwrap_err().code, codes::S0002);
    }

    #[test]
    fn pruned_copy_drops_retired_srefs() {
        let p = workload::scale_1d(8);
        let (mut tree, root) = SRefTree::build(&p.root);
        let loop_id = tree.live_ids()[1];
        let mut table = RvTable::new();
        let b = table.add_block(root);
        let l = table.add_loop(loop_id);
        let v = table.add_expr(Expr::Int(2));
        let gone = table.add_expr(Expr::Int(3));
        table.remove(gone.into()).unwrap();
        tree.retire(loop_id);

        let pruned = table.pruned(&tree);
        assert_eq!(table.len(), 3);
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned.resolve_block(b, &tree).unwrap(), root);
        assert_eq!(pruned.resolve_expr(v).unwrap(), Expr::Int(2));
        assert_eq!(pruned.resolve_loop(l, &tree).unwrap_err().code, codes::S0002);
        assert_eq!(pruned.resolve_expr(gone).unwrap_err().code, codes::S0001);
        let never = AnyRV::Loop(LoopRV(99));
        assert_eq!(pruned.lookup(never).unwrap_err().code, codes::S0001);
    }

    #[test]
    fn remove_unknown_fails() {
        let mut table = RvTable::new();
        let e = table.add_expr(Expr::Int(4));
        assert_eq!(table.resolve_expr(e).unwrap(), Expr::Int(4));
        table.remove(e.into()).unwrap();
        assert_eq!(table.remove(e.into()).unwrap_err().code, codes::S0001);
        assert_eq!(table.resolve_expr(e).unwrap_err().code, codes::S0001);
    }
}
