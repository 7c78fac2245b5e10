// Integration tests: every accepted primitive preserves program outputs.
//
// Each test schedules a built-in workload through the public façade and
// compares the result against the unscheduled program with the reference
// interpreter on random inputs. Structural expectations (loop extents, block
// names, retired handles) are checked alongside.

use nestsched::eval::{self, Buffers};
use nestsched::ir::{Expr, ForKind, Program, Stmt};
use nestsched::schedule::RvRef;
use nestsched::{
    diag::codes, workload, DebugMask, ErrorRenderLevel, Factor, LoopRV, SRefId, Schedule,
    ScheduleConfig,
};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn schedule(p: &Program) -> Schedule {
    Schedule::new(
        p,
        ScheduleConfig {
            seed: Some(1234),
            debug_mask: DebugMask::ALL,
            error_render_level: ErrorRenderLevel::Fast,
        },
    )
}

fn assert_equivalent(original: &Program, sch: &Schedule) {
    for seed in [1, 2, 3] {
        assert!(
            eval::equivalent(original, sch.program(), seed).unwrap(),
            "outputs differ for seed {}:\n{}",
            seed,
            nestsched::printer::script(sch.program())
        );
    }
}

/// Srefs behind loop handles; fresh handles to the same loops compare equal.
fn srefs(sch: &Schedule, loops: &[LoopRV]) -> Vec<SRefId> {
    loops.iter().map(|&l| sch.get_sref(l).unwrap()).collect()
}

fn extent(sch: &Schedule, l: LoopRV) -> Expr {
    match sch.get(l).unwrap() {
        RvRef::Stmt(s) => match s.as_ref() {
            Stmt::Loop(lp) => lp.extent.clone(),
            _ => panic!("loop handle resolved to a non-loop"),
        },
        RvRef::Value(_) => panic!("loop handle resolved to a value"),
    }
}

// ── Loop transforms ─────────────────────────────────────────────────────────

#[test]
fn split_exact_preserves_order() {
    let p = workload::scale_1d(128);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    let parts = sch.split(i, &[Factor::Int(2), Factor::Int(64)]).unwrap();
    assert_eq!(extent(&sch, parts[0]), Expr::Int(2));
    assert_eq!(extent(&sch, parts[1]), Expr::Int(64));
    assert_equivalent(&p, &sch);
}

#[test]
fn split_with_guard_preserves_outputs() {
    let p = workload::scale_1d(10);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    let parts = sch.split(i, &[Factor::Infer, Factor::Int(4)]).unwrap();
    assert_eq!(extent(&sch, parts[0]), Expr::Int(3));
    assert_equivalent(&p, &sch);
}

#[test]
fn split_rejects_overflowing_factors() {
    let p = workload::scale_1d(8);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    let recorded = sch.trace().len();
    let err = sch.split(i, &[Factor::Int(1 << 62), Factor::Int(4)]).unwrap_err();
    assert_eq!(err.code, codes::S0201);
    assert!(sch.is_valid(i));
    assert_eq!(sch.trace().len(), recorded);
    assert_equivalent(&p, &sch);
}

#[test]
fn split_three_ways_on_reduction_axis() {
    let p = workload::matmul(8, 8, 12);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let k = sch.get_loops(c).unwrap()[2];
    sch.split(k, &[Factor::Int(2), Factor::Infer, Factor::Int(3)]).unwrap();
    assert_eq!(sch.get_loops(c).unwrap().len(), 5);
    assert_equivalent(&p, &sch);
}

#[test]
fn fuse_then_split_round_trips() {
    let p = workload::elementwise_chain(6);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let ls = sch.get_loops(b).unwrap();
    let fused = sch.fuse(&ls).unwrap();
    assert_eq!(extent(&sch, fused), Expr::Int(36));
    assert_equivalent(&p, &sch);
    sch.split(fused, &[Factor::Int(6), Factor::Int(6)]).unwrap();
    assert_eq!(sch.get_loops(b).unwrap().len(), 2);
    assert_equivalent(&p, &sch);
}

#[test]
fn reorder_reduction_outermost() {
    let p = workload::matmul(4, 5, 6);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    sch.reorder(&[ls[2], ls[0]]).unwrap();
    let now = sch.get_loops(c).unwrap();
    assert_eq!(srefs(&sch, &now), srefs(&sch, &[ls[2], ls[1], ls[0]]));
    assert_equivalent(&p, &sch);
}

#[test]
fn tile_matmul() {
    let p = workload::matmul(16, 16, 16);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let i = sch.split(ls[0], &[Factor::Infer, Factor::Int(4)]).unwrap();
    let j = sch.split(ls[1], &[Factor::Infer, Factor::Int(4)]).unwrap();
    sch.reorder(&[i[0], j[0], i[1], j[1]]).unwrap();
    let now = sch.get_loops(c).unwrap();
    assert_eq!(
        srefs(&sch, &now),
        srefs(&sch, &[i[0], j[0], i[1], j[1], ls[2]])
    );
    assert_equivalent(&p, &sch);
}

// ── Loop kinds ──────────────────────────────────────────────────────────────

#[test]
fn loop_kinds_do_not_change_outputs() {
    let p = workload::matmul(8, 8, 8);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    sch.parallel(ls[0]).unwrap();
    sch.vectorize(ls[1]).unwrap();
    sch.bind(ls[2], "threadIdx.x").unwrap();
    assert_equivalent(&p, &sch);
    match sch.get(ls[2]).unwrap() {
        RvRef::Stmt(s) => assert_eq!(
            s.as_loop().unwrap().kind,
            ForKind::ThreadBinding("threadIdx.x".into())
        ),
        RvRef::Value(_) => panic!("loop handle resolved to a value"),
    }
}

#[test]
fn parallel_rejects_reduction_loop() {
    let p = workload::reduce_sum(4, 4, 4);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let ls = sch.get_loops(b).unwrap();
    assert_eq!(sch.parallel(ls[1]).unwrap_err().code, codes::S0303);
    sch.unroll(ls[1]).unwrap();
    assert_equivalent(&p, &sch);
}

// ── Cache stages ────────────────────────────────────────────────────────────

#[test]
fn cache_read_of_parameter() {
    let p = workload::matmul(4, 4, 4);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let a_cache = sch.cache_read(c, 1, "shared").unwrap();
    assert!(sch.show(a_cache).unwrap().starts_with("block A_shared:"));
    assert_equivalent(&p, &sch);
}

#[test]
fn cache_read_of_intermediate() {
    let p = workload::elementwise_chain(8);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    sch.cache_read(c, 0, "local").unwrap();
    assert_equivalent(&p, &sch);
}

#[test]
fn cache_write_of_reduction() {
    let p = workload::matmul(4, 4, 4);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    sch.cache_write(c, 0, "local").unwrap();
    assert_equivalent(&p, &sch);
}

#[test]
fn cache_read_after_compute_at() {
    for level in [0, 1] {
        let p = workload::elementwise_chain(8);
        let mut sch = schedule(&p);
        let b = sch.get_block("B").unwrap();
        let c = sch.get_block("C").unwrap();
        let ls = sch.get_loops(c).unwrap();
        sch.compute_at(b, ls[level], false).unwrap();
        let copy = sch.cache_read(c, 0, "shared").unwrap();
        let copy_loops = sch.get_loops(copy).unwrap();
        assert_eq!(srefs(&sch, &copy_loops[..=level]), srefs(&sch, &ls[..=level]));
        assert_equivalent(&p, &sch);
    }
}

#[test]
fn cache_write_after_reverse_compute_at() {
    for level in [0, 1] {
        let p = workload::elementwise_chain(8);
        let mut sch = schedule(&p);
        let b = sch.get_block("B").unwrap();
        let c = sch.get_block("C").unwrap();
        let ls = sch.get_loops(b).unwrap();
        sch.reverse_compute_at(c, ls[level], false).unwrap();
        let copy = sch.cache_write(b, 0, "local").unwrap();
        let copy_loops = sch.get_loops(copy).unwrap();
        assert_eq!(srefs(&sch, &copy_loops[..=level]), srefs(&sch, &ls[..=level]));
        assert_equivalent(&p, &sch);
    }
}

#[test]
fn cache_write_after_compute_at_into_split_loop() {
    let p = workload::norm_chain(8, 4);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let parts = sch.split(ls[0], &[Factor::Infer, Factor::Int(4)]).unwrap();
    sch.compute_at(b, parts[0], false).unwrap();
    let copy = sch.cache_write(b, 0, "local").unwrap();
    let copy_loops = sch.get_loops(copy).unwrap();
    assert_eq!(srefs(&sch, &copy_loops[..1]), srefs(&sch, &parts[..1]));
    assert_equivalent(&p, &sch);
}

// ── Compute location ────────────────────────────────────────────────────────

#[test]
fn compute_at_inner_and_outer() {
    for level in [0, 1] {
        let p = workload::elementwise_chain(8);
        let mut sch = schedule(&p);
        let b = sch.get_block("B").unwrap();
        let c = sch.get_block("C").unwrap();
        let ls = sch.get_loops(c).unwrap();
        sch.compute_at(b, ls[level], false).unwrap();
        assert_equivalent(&p, &sch);
    }
}

#[test]
fn compute_at_after_split() {
    let p = workload::elementwise_chain(8);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let parts = sch.split(ls[0], &[Factor::Int(2), Factor::Int(4)]).unwrap();
    sch.compute_at(b, parts[0], true).unwrap();
    assert_equivalent(&p, &sch);
}

#[test]
fn reverse_compute_at_epilogue() {
    let p = workload::norm_chain(4, 6);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    let d = sch.get_block("D").unwrap();
    let i = sch.get_loops(c).unwrap()[0];
    sch.reverse_compute_at(d, i, false).unwrap();
    let now = sch.get_loops(d).unwrap();
    assert_eq!(srefs(&sch, &now), srefs(&sch, &[i]));
    assert_equivalent(&p, &sch);
}

#[test]
fn compute_at_rejects_output_block() {
    let p = workload::elementwise_chain(8);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(b).unwrap();
    let err = sch.compute_at(c, ls[0], false).unwrap_err();
    assert_eq!(err.code, codes::S0505);
    assert!(err.ir.is_none());
}

// ── Inlining ────────────────────────────────────────────────────────────────

#[test]
fn compute_inline_removes_producer() {
    let p = workload::elementwise_chain(4);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let b_loops = sch.get_loops(b).unwrap();
    sch.compute_inline(b).unwrap();
    assert_eq!(sch.get(b).unwrap_err().code, codes::S0002);
    assert_eq!(sch.get(b_loops[0]).unwrap_err().code, codes::S0002);
    assert_eq!(sch.get_block("B").unwrap_err().code, codes::S0004);
    assert_equivalent(&p, &sch);
}

#[test]
fn reverse_compute_inline_folds_epilogue() {
    let p = workload::elementwise_chain(4);
    let mut sch = schedule(&p);
    let c = sch.get_block("C").unwrap();
    sch.reverse_compute_inline(c).unwrap();
    assert!(!sch.is_valid(c));
    assert_equivalent(&p, &sch);
}

#[test]
fn reverse_compute_inline_rejects_partial_consumer() {
    use nestsched::ir::{seq, Buffer, DType, IterKind};
    let a = Buffer::new("A", vec![8], DType::Float32);
    let b = Buffer::new("B", vec![8], DType::Float32);
    let c = Buffer::new("C", vec![4], DType::Float32);
    let stage_b = workload::grid_block("B", &[("i", 8, IterKind::DataPar)], |v| {
        let idx = v.to_vec();
        (None, workload::store(&b, idx.clone(), Expr::load(&a, idx) * Expr::Float(2.0)))
    });
    let stage_c = workload::grid_block("C", &[("i", 4, IterKind::DataPar)], |v| {
        let idx = v.to_vec();
        (None, workload::store(&c, idx.clone(), Expr::load(&b, idx) + Expr::Float(1.0)))
    });
    let p = Program::new("head", vec![a, c], vec![b], seq(vec![stage_b, stage_c]));
    let mut sch = schedule(&p);
    let consumer = sch.get_block("C").unwrap();
    let err = sch.reverse_compute_inline(consumer).unwrap_err();
    assert_eq!(err.code, codes::S0601);
    assert!(sch.is_valid(consumer));
    assert_equivalent(&p, &sch);
}

#[test]
fn inline_the_norm_producer() {
    let p = workload::norm_chain(3, 5);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    sch.compute_inline(b).unwrap();
    let c = sch.get_block("C").unwrap();
    assert_eq!(sch.compute_inline(c).unwrap_err().code, codes::S0601);
    assert_equivalent(&p, &sch);
}

// ── Reductions ──────────────────────────────────────────────────────────────

#[test]
fn decompose_reduction_at_each_loop_down_to_the_reduction() {
    for level in [0, 1, 2] {
        let p = workload::matmul(4, 4, 4);
        let mut sch = schedule(&p);
        let c = sch.get_block("C").unwrap();
        let ls = sch.get_loops(c).unwrap();
        let init = sch.decompose_reduction(c, ls[level]).unwrap();
        assert!(sch.show(init).unwrap().starts_with("block C_init:"));
        assert_equivalent(&p, &sch);
    }
}

#[test]
fn rfactor_sum_and_max() {
    let p = workload::reduce_sum(3, 4, 5);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let ls = sch.get_loops(b).unwrap();
    let rf = sch.rfactor(ls[1], 0).unwrap();
    assert!(sch.show(rf).unwrap().starts_with("block B_rf:"));
    assert_equivalent(&p, &sch);

    let p = workload::reduce_max(3, 8);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let ls = sch.get_loops(b).unwrap();
    let parts = sch.split(ls[1], &[Factor::Int(2), Factor::Int(4)]).unwrap();
    sch.rfactor(parts[1], -1).unwrap();
    assert_equivalent(&p, &sch);
}

#[test]
fn rfactor_bad_axis_leaves_trace_untouched() {
    let p = workload::reduce_max(2, 4);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    let k = sch.get_loops(b).unwrap()[1];
    let before = sch.trace().len();
    assert!(sch.rfactor(k, 5).is_err());
    assert_eq!(sch.trace().len(), before);
    sch.rfactor(k, 1).unwrap();
    assert_equivalent(&p, &sch);
}

// ── Annotations ─────────────────────────────────────────────────────────────

#[test]
fn annotations_keep_outputs() {
    let p = workload::elementwise_chain(8);
    let mut sch = schedule(&p);
    let b = sch.get_block("B").unwrap();
    sch.storage_align(b, 0, 0, 16, 1).unwrap();
    sch.set_scope(b, 0, "shared").unwrap();
    assert!(sch.show(b).unwrap().contains("attr buffer_dim_align=[[0, 0, 16, 1]]"));
    assert_equivalent(&p, &sch);
}

// ── Interpreter sanity ──────────────────────────────────────────────────────

#[test]
fn interpreter_matches_hand_computation() {
    let p = workload::norm_chain(2, 3);
    let mut inputs = Buffers::new();
    inputs.insert("A".into(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let out = eval::run(&p, &inputs).unwrap();
    // D[i] = sum_k 2 * A[i, k] + 1
    assert_eq!(out["D"], vec![13.0, 31.0]);
}
