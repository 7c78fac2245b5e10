// id.rs — Stable identifiers for structural-index nodes and random variables
//
// Sref ids are arena slots plus a generation: a slot may be recycled after
// its statement is deleted, and the bumped generation makes every stale id
// detectable. Random-variable ids are never recycled; they are allocated in
// creation order, which keeps trace records deterministic.

use serde::{Deserialize, Serialize};

/// Identifier of a node in the structural index (sref arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SRefId {
    pub index: u32,
    pub generation: u32,
}

/// Handle to a loop tracked by a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopRV(pub u32);

/// Handle to a block tracked by a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRV(pub u32);

/// Handle to an integer/expression value tracked by a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprRV(pub u32);

/// Any random-variable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnyRV {
    Loop(LoopRV),
    Block(BlockRV),
    Expr(ExprRV),
}

impl AnyRV {
    pub fn raw(self) -> u32 {
        match self {
            AnyRV::Loop(LoopRV(id)) | AnyRV::Block(BlockRV(id)) | AnyRV::Expr(ExprRV(id)) => id,
        }
    }
}

impl From<LoopRV> for AnyRV {
    fn from(rv: LoopRV) -> Self {
        AnyRV::Loop(rv)
    }
}

impl From<BlockRV> for AnyRV {
    fn from(rv: BlockRV) -> Self {
        AnyRV::Block(rv)
    }
}

impl From<ExprRV> for AnyRV {
    fn from(rv: ExprRV) -> Self {
        AnyRV::Expr(rv)
    }
}

/// Allocator for random-variable ids. Produces monotonically increasing ids
/// shared across all three handle kinds.
#[derive(Debug, Default, Clone)]
pub struct RvAllocator {
    next: u32,
}

impl RvAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `raw` has been handed out.
    pub fn issued(&self, raw: u32) -> bool {
        raw < self.next
    }

    fn bump(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn alloc_loop(&mut self) -> LoopRV {
        LoopRV(self.bump())
    }

    pub fn alloc_block(&mut self) -> BlockRV {
        BlockRV(self.bump())
    }

    pub fn alloc_expr(&mut self) -> ExprRV {
        ExprRV(self.bump())
    }
}
