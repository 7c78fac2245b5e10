// for_kind.rs — parallel, vectorize, bind, unroll
//
// Preconditions: `loop_sref` is a live loop sref.
// Postconditions: only the loop's kind tag changes; srefs are preserved.
// Failure modes: S0301-S0304 and S0208 for parallel/vectorize/bind.
//                unroll has no preconditions.
// Side effects: one `replace` per successful call.

use std::sync::Arc;

use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::SRefId;
use crate::ir::*;
use crate::state::ScheduleState;

/// Thread axes accepted by `bind`.
pub const THREAD_AXES: &[&str] = &[
    "blockIdx.x",
    "blockIdx.y",
    "blockIdx.z",
    "threadIdx.x",
    "threadIdx.y",
    "threadIdx.z",
    "vthread.x",
    "vthread.y",
    "vthread.z",
    "vthread",
];

pub fn is_thread_axis(axis: &str) -> bool {
    THREAD_AXES.contains(&axis)
}

fn check_parallelizable(
    state: &mut ScheduleState,
    loop_sref: SRefId,
    kind: &ForKind,
    primitive: &'static str,
) -> ScheduleResult<()> {
    let Some(scope) = state.scope_root(loop_sref) else {
        return Ok(());
    };
    let info = state.scope_info(scope);
    if !info.stage_pipeline {
        return Err(ScheduleError::new(
            codes::S0301,
            primitive,
            "the enclosing scope is not a stage pipeline",
        )
        .with_hint("a buffer has more than one writer or a write-after-read hazard"));
    }
    let var = state.loop_(loop_sref).loop_var.clone();
    let allow_reduce = matches!(kind, ForKind::ThreadBinding(axis) if axis.starts_with("threadIdx"));
    for b in state.child_blocks(loop_sref) {
        let br = state.block(b);
        let name = &br.block.name;
        if !info.is_complete(b) && !info.is_reduction(b) {
            return Err(ScheduleError::new(
                codes::S0302,
                primitive,
                format!("block `{}` is neither complete nor a reduction", name),
            ));
        }
        if !info.is_affine(b) {
            return Err(ScheduleError::new(
                codes::S0208,
                primitive,
                format!("block `{}` has non-affine bindings", name),
            ));
        }
        for (iv, value) in br.block.iter_vars.iter().zip(&br.iter_values) {
            if !value.uses_var(&var) {
                continue;
            }
            let ok = match iv.kind {
                IterKind::DataPar => true,
                IterKind::CommReduce => allow_reduce,
                IterKind::Opaque => false,
            };
            if !ok {
                return Err(ScheduleError::new(
                    codes::S0303,
                    primitive,
                    format!(
                        "loop `{}` binds iterator `{}` of block `{}`, which is not data-parallel",
                        var.name, iv.var.name, name
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn set_kind(state: &mut ScheduleState, loop_sref: SRefId, kind: ForKind) {
    let l = Loop {
        kind,
        ..state.loop_(loop_sref).clone()
    };
    state.replace(loop_sref, Arc::new(Stmt::Loop(l)));
}

pub fn parallel(state: &mut ScheduleState, loop_sref: SRefId) -> ScheduleResult<()> {
    check_parallelizable(state, loop_sref, &ForKind::Parallel, "parallel")?;
    set_kind(state, loop_sref, ForKind::Parallel);
    Ok(())
}

pub fn vectorize(state: &mut ScheduleState, loop_sref: SRefId) -> ScheduleResult<()> {
    check_parallelizable(state, loop_sref, &ForKind::Vectorized, "vectorize")?;
    set_kind(state, loop_sref, ForKind::Vectorized);
    Ok(())
}

pub fn bind(state: &mut ScheduleState, loop_sref: SRefId, axis: &str) -> ScheduleResult<()> {
    if !is_thread_axis(axis) {
        return Err(ScheduleError::new(
            codes::S0304,
            "bind",
            format!("unknown thread axis `{}`", axis),
        )
        .with_hint("expected blockIdx.*, threadIdx.* or vthread.*"));
    }
    let kind = ForKind::ThreadBinding(axis.to_string());
    check_parallelizable(state, loop_sref, &kind, "bind")?;
    set_kind(state, loop_sref, kind);
    Ok(())
}

pub fn unroll(state: &mut ScheduleState, loop_sref: SRefId) -> ScheduleResult<()> {
    set_kind(state, loop_sref, ForKind::Unrolled);
    Ok(())
}
