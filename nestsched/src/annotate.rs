// annotate.rs — storage_align, set_scope
//
// Tags consumed by code generation. Neither primitive changes what the
// program computes.
//
// Preconditions: `block` is a live block sref.
// Postconditions: storage_align keeps at most one entry per
//                 (buffer_index, axis); set_scope renames the buffer's scope
//                 at every reference.
// Failure modes: S0401, S0604, S0801.
// Side effects: one `replace` per call that changes something.

use std::sync::Arc;

use crate::arith;
use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::ScheduleState;

/// Block annotation key holding `[buffer_index, axis, factor, offset]` rows.
pub const BUFFER_DIM_ALIGN: &str = "buffer_dim_align";

fn written_internal(
    state: &ScheduleState,
    block: SRefId,
    buffer_index: usize,
    primitive: &'static str,
) -> ScheduleResult<Buffer> {
    let writes = &state.block(block).block.writes;
    let Some(region) = writes.get(buffer_index) else {
        return Err(ScheduleError::new(
            codes::S0401,
            primitive,
            format!(
                "write buffer index {} is out of range (block has {})",
                buffer_index,
                writes.len()
            ),
        ));
    };
    if !state.is_internal_buffer(&region.buffer) {
        return Err(ScheduleError::new(
            codes::S0604,
            primitive,
            format!("buffer `{}` is not an internal allocation", region.buffer.name),
        ));
    }
    Ok(region.buffer.clone())
}

/// Request that `axis` of the written buffer be padded so its stride is
/// `factor * k + offset`.
pub fn storage_align(
    state: &mut ScheduleState,
    block: SRefId,
    buffer_index: usize,
    axis: i64,
    factor: i64,
    offset: i64,
) -> ScheduleResult<()> {
    const NAME: &str = "storage_align";
    let buffer = written_internal(state, block, buffer_index, NAME)?;
    let ndim = buffer.ndim() as i64;
    let norm = if axis < 0 { axis + ndim } else { axis };
    if !(0..ndim).contains(&norm) {
        return Err(ScheduleError::new(
            codes::S0801,
            NAME,
            format!("axis {} is out of range for a {}-d buffer", axis, ndim),
        ));
    }
    if factor <= 0 {
        return Err(ScheduleError::new(
            codes::S0801,
            NAME,
            format!("factor must be positive, got {}", factor),
        ));
    }

    let br = state.block(block).clone();
    let mut block_ann = br.block.annotations.clone();
    let mut rows = match block_ann.get(BUFFER_DIM_ALIGN) {
        Some(AnnValue::Tuples(rows)) => rows.clone(),
        _ => Vec::new(),
    };
    let key = [buffer_index as i64, norm];
    rows.retain(|r| r.get(..2) != Some(&key[..]));
    rows.push(vec![buffer_index as i64, norm, factor, offset]);
    block_ann.insert(BUFFER_DIM_ALIGN.to_string(), AnnValue::Tuples(rows));
    let new_block = Arc::new(Stmt::Block(br.with_block(Block {
        annotations: block_ann,
        ..br.block.clone()
    })));
    state.replace(block, new_block);
    Ok(())
}

/// Move the written buffer to `storage_scope`.
pub fn set_scope(
    state: &mut ScheduleState,
    block: SRefId,
    buffer_index: usize,
    storage_scope: &str,
) -> ScheduleResult<()> {
    const NAME: &str = "set_scope";
    let buffer = written_internal(state, block, buffer_index, NAME)?;
    if buffer.scope == storage_scope {
        return Ok(());
    }
    let rescoped = buffer.rescoped(storage_scope);
    let root = state.root();
    let new_root = arith::replace_buffer(&state.stmt(root), &buffer, &rescoped);
    state.replace(root, new_root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::get_block;
    use crate::state::DebugMask;
    use crate::workload;

    #[test]
    fn storage_align_replaces_same_axis() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        storage_align(&mut state, b, 0, 0, 32, 8).unwrap();
        storage_align(&mut state, b, 0, -2, 16, 1).unwrap();
        storage_align(&mut state, b, 0, 1, 4, 0).unwrap();
        let ann = state.block(b).block.annotations.get(BUFFER_DIM_ALIGN).cloned();
        assert_eq!(
            ann,
            Some(AnnValue::Tuples(vec![vec![0, 0, 16, 1], vec![0, 1, 4, 0]]))
        );
        assert_eq!(storage_align(&mut state, b, 0, 2, 4, 0).unwrap_err().code, codes::S0801);
        assert_eq!(storage_align(&mut state, b, 0, 0, 0, 0).unwrap_err().code, codes::S0801);
        let c = get_block(&state, "C").unwrap();
        assert_eq!(storage_align(&mut state, c, 0, 0, 4, 0).unwrap_err().code, codes::S0604);
    }

    #[test]
    fn set_scope_rewrites_every_reference() {
        let p = workload::elementwise_chain(8);
        let mut state = ScheduleState::new(&p, DebugMask::ALL);
        let b = get_block(&state, "B").unwrap();
        let c = get_block(&state, "C").unwrap();
        set_scope(&mut state, b, 0, "shared").unwrap();
        assert_eq!(state.block(b).block.writes[0].buffer.scope, "shared");
        assert_eq!(state.block(c).block.reads[0].buffer.scope, "shared");
        assert_eq!(state.program().root_block().alloc_buffers[0].scope, "shared");
        assert!(state.tree().is_live(b) && state.tree().is_live(c));
    }
}
