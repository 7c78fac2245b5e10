// Integration tests: handle lifetime across rewrites, and schedule copies.
//
// Handles keep resolving to the statement they named as long as its sref is
// reused by `replace`; retired statements make their handles fail explicitly.
// A copy shares no mutable state with its source.

use nestsched::ir::ForKind;
use nestsched::printer;
use nestsched::schedule::RvRef;
use nestsched::{diag::codes, workload, DebugMask, Factor, Schedule, ScheduleConfig};

fn schedule(p: &nestsched::ir::Program, seed: u64) -> Schedule {
    Schedule::new(
        p,
        ScheduleConfig {
            seed: Some(seed),
            debug_mask: DebugMask::ALL,
            ..ScheduleConfig::default()
        },
    )
}

#[test]
fn block_handle_survives_loop_rewrites() {
    let mut sch = schedule(&workload::matmul(8, 8, 8), 0);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let before = sch.get_sref(c).unwrap();
    sch.split(ls[0], &[Factor::Int(2), Factor::Int(4)]).unwrap();
    sch.reorder(&[ls[2], ls[1]]).unwrap();
    assert_eq!(sch.get_sref(c).unwrap(), before);
    assert!(sch.show(c).unwrap().starts_with("block C:"));
}

#[test]
fn untouched_loops_keep_their_handles() {
    let mut sch = schedule(&workload::matmul(8, 8, 8), 0);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    sch.split(ls[0], &[Factor::Int(2), Factor::Int(4)]).unwrap();
    assert!(!sch.is_valid(ls[0]));
    assert!(sch.is_valid(ls[1]));
    assert!(sch.is_valid(ls[2]));
    assert_eq!(sch.get(ls[0]).unwrap_err().code, codes::S0002);
}

#[test]
fn stale_handle_error_carries_hint() {
    let mut sch = schedule(&workload::elementwise_chain(4), 0);
    let b = sch.get_block("B").unwrap();
    sch.compute_inline(b).unwrap();
    let err = sch.compute_inline(b).unwrap_err();
    assert_eq!(err.code, codes::S0002);
    assert!(err.hint.is_some());
}

#[test]
fn expression_handles_are_not_statements() {
    let mut sch = schedule(&workload::scale_1d(16), 0);
    let v = sch.sample_categorical(&[4, 8], &[1.0, 0.0], None).unwrap();
    assert_eq!(sch.show(v).unwrap(), "4");
    assert_eq!(sch.get_sref(v).unwrap_err().code, codes::S0003);
    match sch.get(v).unwrap() {
        RvRef::Value(e) => assert_eq!(e.as_int(), Some(4)),
        RvRef::Stmt(_) => panic!("expression handle resolved to a statement"),
    }
}

#[test]
fn sampled_factor_feeds_split() {
    let mut sch = schedule(&workload::scale_1d(64), 9);
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    let f = sch.sample_categorical(&[2, 4, 8], &[0.2, 0.3, 0.5], None).unwrap();
    let parts = sch.split(i, &[Factor::Infer, Factor::Rv(f)]).unwrap();
    let inner = match sch.get(parts[1]).unwrap() {
        RvRef::Stmt(s) => s.as_loop().unwrap().extent.as_int().unwrap(),
        RvRef::Value(_) => panic!("loop handle resolved to a value"),
    };
    assert_eq!(Some(inner), sch.get_value(f).unwrap().as_int());
}

#[test]
fn copy_then_mutate_leaves_source_untouched() {
    let p = workload::norm_chain(4, 8);
    let mut sch = schedule(&p, 5);
    let b = sch.get_block("B").unwrap();
    let c = sch.get_block("C").unwrap();
    let c_loops = sch.get_loops(c).unwrap();
    let before = printer::script(sch.program());

    let mut fork = sch.copy();
    fork.compute_inline(b).unwrap();
    fork.parallel(c_loops[0]).unwrap();

    assert!(!fork.is_valid(b));
    assert_eq!(printer::script(sch.program()), before);
    assert!(sch.is_valid(b));
    assert!(sch.is_valid(c_loops[0]));
    match sch.get(c_loops[0]).unwrap() {
        RvRef::Stmt(s) => assert_eq!(s.as_loop().unwrap().kind, ForKind::Serial),
        RvRef::Value(_) => panic!("loop handle resolved to a value"),
    }
    // The source can keep scheduling independently.
    sch.compute_inline(b).unwrap();
    assert!(!sch.is_valid(b));
    assert!(fork.is_valid(c_loops[0]));
}

#[test]
fn copy_maps_handles_to_corresponding_statements() {
    let mut sch = schedule(&workload::matmul(8, 8, 8), 5);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let fork = sch.copy();
    for &l in &ls {
        assert_eq!(fork.show(l).unwrap(), sch.show(l).unwrap());
        assert_eq!(fork.get_sref(l).unwrap(), sch.get_sref(l).unwrap());
    }
    assert_eq!(fork.trace(), sch.trace());
    assert!(printer::structural_equal(fork.program(), sch.program()));
}

#[test]
fn copy_keeps_retired_handles_retired() {
    let mut sch = schedule(&workload::matmul(8, 8, 8), 3);
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let parts = sch.split(ls[0], &[Factor::Int(2), Factor::Int(4)]).unwrap();
    sch.remove_rv(ls[1]).unwrap();
    let fork = sch.copy();
    let err = fork.get(ls[0]).unwrap_err();
    assert_eq!(err.code, codes::S0002);
    assert!(err.hint.is_some());
    assert_eq!(fork.get(ls[1]).unwrap_err().code, codes::S0001);
    assert_eq!(fork.get_sref(parts[1]).unwrap(), sch.get_sref(parts[1]).unwrap());
    assert_eq!(fork.get_sref(c).unwrap(), sch.get_sref(c).unwrap());
}

#[test]
fn copies_draw_from_forked_seeds() {
    let p = workload::matmul(64, 64, 64);
    let mut a = schedule(&p, 77);
    let mut b = schedule(&p, 77);
    let mut fa = a.copy();
    let mut fb = b.copy();
    let ca = fa.get_block("C").unwrap();
    let cb = fb.get_block("C").unwrap();
    let la = fa.get_loops(ca).unwrap()[0];
    let lb = fb.get_loops(cb).unwrap()[0];
    let ta = fa.sample_perfect_tile(la, 3, 64, None).unwrap();
    let tb = fb.sample_perfect_tile(lb, 3, 64, None).unwrap();
    let va: Vec<_> = ta.iter().map(|&t| fa.get_value(t).unwrap()).collect();
    let vb: Vec<_> = tb.iter().map(|&t| fb.get_value(t).unwrap()).collect();
    assert_eq!(va, vb);
}

#[test]
fn removed_handles_stay_removed() {
    let mut sch = schedule(&workload::scale_1d(8), 0);
    let b = sch.get_block("B").unwrap();
    let b2 = sch.get_block("B").unwrap();
    sch.remove_rv(b).unwrap();
    assert!(!sch.is_valid(b));
    assert!(sch.is_valid(b2));
    assert_eq!(sch.get_loops(b).unwrap_err().code, codes::S0001);
}
