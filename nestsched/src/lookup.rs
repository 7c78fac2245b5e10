// lookup.rs — Read-only queries: blocks by name, loops, children, dataflow
//
// Preconditions: ids are live srefs of the state.
// Postconditions: results are live srefs, in program order.
// Failure modes: missing or ambiguous block names return S0004.
// Side effects: may populate the scope cache.

use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::state::ScheduleState;

/// The unique block named `name`.
pub fn get_block(state: &ScheduleState, name: &str) -> ScheduleResult<SRefId> {
    let found: Vec<SRefId> = state
        .tree()
        .live_ids()
        .into_iter()
        .filter(|&id| {
            state
                .tree()
                .node(id)
                .stmt
                .as_block()
                .map(|br| br.block.name == name)
                .unwrap_or(false)
        })
        .collect();
    match found.as_slice() {
        [id] => Ok(*id),
        [] => Err(ScheduleError::new(
            codes::S0004,
            "get_block",
            format!("no block named `{}`", name),
        )),
        _ => Err(ScheduleError::new(
            codes::S0004,
            "get_block",
            format!("{} blocks are named `{}`", found.len(), name),
        )),
    }
}

/// Loops above `block` within its scope, outermost first.
pub fn get_loops(state: &ScheduleState, block: SRefId) -> Vec<SRefId> {
    state.loops_above(block)
}

/// Nearest blocks below a loop or block.
pub fn get_child_blocks(state: &ScheduleState, id: SRefId) -> Vec<SRefId> {
    state.child_blocks(id)
}

pub fn get_producers(state: &mut ScheduleState, block: SRefId) -> Vec<SRefId> {
    match state.scope_root(block) {
        Some(scope) => state.scope_info(scope).producers(block),
        None => Vec::new(),
    }
}

pub fn get_consumers(state: &mut ScheduleState, block: SRefId) -> Vec<SRefId> {
    match state.scope_root(block) {
        Some(scope) => state.scope_info(scope).consumers(block),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DebugMask;
    use crate::workload;

    #[test]
    fn lookups_on_chain() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        assert_eq!(get_loops(&state, b).len(), 2);
        assert_eq!(get_consumers(&mut state, b), vec![c]);
        assert_eq!(get_producers(&mut state, c), vec![b]);
        assert_eq!(get_child_blocks(&state, state.root()), vec![b, c]);
        let err = get_block(&state, "D").unwrap_err();
        assert_eq!(err.code, codes::S0004);
    }
}
