use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use nestsched::ir::Program;
use nestsched::*;

// Benchmark scenarios: representative schedules over the built-in workloads.
// Every scenario is valid for the sizes used below.

fn tile_matmul(sch: &mut Schedule) {
    let c = sch.get_block("C").unwrap();
    let ls = sch.get_loops(c).unwrap();
    let i = sch.split(ls[0], &[Factor::Infer, Factor::Int(8)]).unwrap();
    let j = sch.split(ls[1], &[Factor::Infer, Factor::Int(8)]).unwrap();
    sch.reorder(&[i[0], j[0], i[1], j[1]]).unwrap();
    sch.parallel(i[0]).unwrap();
    sch.decompose_reduction(c, j[0]).unwrap();
}

fn compute_at_chain(sch: &mut Schedule) {
    let b = sch.get_block("B").unwrap();
    let c = sch.get_block("C").unwrap();
    let cl = sch.get_loops(c).unwrap();
    let parts = sch.split(cl[0], &[Factor::Infer, Factor::Int(8)]).unwrap();
    sch.compute_at(b, parts[0], false).unwrap();
    sch.vectorize(cl[1]).unwrap();
}

fn inline_norm(sch: &mut Schedule) {
    let b = sch.get_block("B").unwrap();
    sch.compute_inline(b).unwrap();
    let c = sch.get_block("C").unwrap();
    let cl = sch.get_loops(c).unwrap();
    let k = sch.split(cl[1], &[Factor::Int(4), Factor::Int(4)]).unwrap();
    sch.rfactor(k[1], 0).unwrap();
}

fn matmul() -> Program {
    workload::matmul(64, 64, 64)
}

fn chain() -> Program {
    workload::elementwise_chain(64)
}

fn norm() -> Program {
    workload::norm_chain(32, 16)
}

type Scenario = (&'static str, fn() -> Program, fn(&mut Schedule));

fn scenarios() -> [Scenario; 3] {
    [
        ("tile_matmul", matmul, tile_matmul),
        ("compute_at_chain", chain, compute_at_chain),
        ("inline_norm", norm, inline_norm),
    ]
}

fn config(debug_mask: DebugMask) -> ScheduleConfig {
    ScheduleConfig {
        seed: Some(0),
        debug_mask,
        error_render_level: ErrorRenderLevel::Fast,
    }
}

// Primitive latency with and without post-rewrite verification.
fn bench_schedule_latency(c: &mut Criterion) {
    for (label, mask) in [("verified", DebugMask::ALL), ("unverified", DebugMask::NONE)] {
        let mut group = c.benchmark_group(format!("schedule/{}", label));
        for (name, program, apply) in scenarios() {
            let p = program();
            group.bench_with_input(BenchmarkId::from_parameter(name), &p, |b, p| {
                b.iter_batched(
                    || Schedule::new(p, config(mask)),
                    |mut sch| {
                        apply(&mut sch);
                        black_box(sch.program().root.clone());
                    },
                    BatchSize::SmallInput,
                );
            });
        }
        group.finish();
    }
}

// Replaying a recorded trace against a fresh schedule.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace/replay");
    for (name, program, apply) in scenarios() {
        let p = program();
        let mut sch = Schedule::new(&p, config(DebugMask::NONE));
        apply(&mut sch);
        let trace = sch.trace().clone();
        group.bench_with_input(BenchmarkId::from_parameter(name), &p, |b, p| {
            b.iter(|| {
                let replayed = trace.replay(black_box(p), config(DebugMask::NONE)).unwrap();
                black_box(replayed.trace().len());
            });
        });
    }
    group.finish();
}

// Structural fingerprint of the scheduled program.
fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("printer/fingerprint");
    for (name, program, apply) in scenarios() {
        let p = program();
        let mut sch = Schedule::new(&p, config(DebugMask::NONE));
        apply(&mut sch);
        group.bench_function(name, |b| {
            b.iter(|| black_box(printer::fingerprint(black_box(sch.program()))));
        });
    }
    group.finish();
}

// Copy-on-write forks of a scheduled program.
fn bench_copy(c: &mut Criterion) {
    let p = matmul();
    let mut sch = Schedule::new(&p, config(DebugMask::NONE));
    tile_matmul(&mut sch);
    c.bench_function("schedule/copy", |b| {
        b.iter(|| black_box(sch.copy().trace().len()));
    });
}

criterion_group!(
    benches,
    bench_schedule_latency,
    bench_replay,
    bench_fingerprint,
    bench_copy,
);
criterion_main!(benches);
