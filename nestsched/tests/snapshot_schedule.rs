// Snapshot tests: lock the printed IR after common primitives, and the trace
// listing, to detect unintended structural changes.
//
// Snapshots are managed by `insta` and stored under `nestsched/tests/snapshots/`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use nestsched::{printer, workload, DebugMask, Factor, Schedule, ScheduleConfig};

fn schedule(p: &nestsched::ir::Program) -> Schedule {
    Schedule::new(
        p,
        ScheduleConfig {
            seed: Some(0),
            debug_mask: DebugMask::ALL,
            ..ScheduleConfig::default()
        },
    )
}

#[test]
fn snapshot_split_exact() {
    let mut sch = schedule(&workload::scale_1d(16));
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    sch.split(i, &[Factor::Infer, Factor::Int(4)]).unwrap();
    insta::assert_snapshot!("split_exact", printer::script(sch.program()));
}

#[test]
fn snapshot_split_guarded() {
    let mut sch = schedule(&workload::scale_1d(10));
    let b = sch.get_block("B").unwrap();
    let i = sch.get_loops(b).unwrap()[0];
    sch.split(i, &[Factor::Infer, Factor::Int(4)]).unwrap();
    insta::assert_snapshot!("split_guarded", printer::script(sch.program()));
}

#[test]
fn snapshot_fuse_matmul() {
    let mut sch = schedule(&workload::matmul(4, 4, 4));
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    sch.fuse(&ls[..2]).unwrap();
    insta::assert_snapshot!("fuse_matmul", printer::script(sch.program()));
}

#[test]
fn snapshot_compute_inline() {
    let mut sch = schedule(&workload::elementwise_chain(4));
    let b = sch.get_block("B").unwrap();
    sch.compute_inline(b).unwrap();
    insta::assert_snapshot!("compute_inline", printer::script(sch.program()));
}

#[test]
fn snapshot_trace_listing() {
    let mut sch = schedule(&workload::matmul(16, 16, 16));
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let t = sch
        .sample_perfect_tile(ls[0], 2, 8, Some(&[2, 8]))
        .unwrap();
    let i = sch.split(ls[0], &[Factor::Rv(t[0]), Factor::Rv(t[1])]).unwrap();
    sch.reorder(&[i[0], ls[1], i[1]]).unwrap();
    sch.parallel(i[0]).unwrap();
    sch.decompose_reduction(c, ls[1]).unwrap();
    insta::assert_snapshot!("trace_listing", sch.trace().to_string());
}
