// workload.rs — Built-in programs and construction helpers
//
// Programs are normally produced by an external front-end; this module gives
// the CLI, tests and benchmarks a small library of canonical workloads built
// directly in the IR, plus the grid-block helper they share.
//
// Preconditions: extents are positive.
// Postconditions: every block has inferred read/write regions and unique names.
// Failure modes: none.
// Side effects: none.

use std::sync::Arc;

use crate::arith;
use crate::ir::*;

// ── Construction helpers ────────────────────────────────────────────────────

/// One grid axis: loop name, extent, iterator kind.
pub type Axis<'a> = (&'a str, i64, IterKind);

/// Build `for a0, a1, ...: block name(v_a0 = a0, ...)` where `build` receives
/// the block iteration variables and returns `(init, body)` stores.
pub fn grid_block(
    name: &str,
    axes: &[Axis<'_>],
    build: impl FnOnce(&[Expr]) -> (Option<BufferStore>, BufferStore),
) -> Arc<Stmt> {
    let loop_vars: Vec<Var> = axes.iter().map(|(n, _, _)| Var::new(n)).collect();
    let iter_vars: Vec<IterVar> = axes
        .iter()
        .map(|(n, extent, kind)| IterVar {
            var: Var::new(format!("v{}", n)),
            dom: Range::from_extent(Expr::Int(*extent)),
            kind: *kind,
        })
        .collect();
    let ivs: Vec<Expr> = iter_vars.iter().map(|iv| Expr::var(&iv.var)).collect();
    let (init, body) = build(&ivs);
    let block = arith::with_inferred_regions(Block {
        name: name.to_string(),
        iter_vars,
        reads: Vec::new(),
        writes: Vec::new(),
        alloc_buffers: Vec::new(),
        init: init.map(|s| Arc::new(Stmt::Store(s))),
        body: Arc::new(Stmt::Store(body)),
        annotations: Annotations::new(),
    });
    let mut stmt = Arc::new(Stmt::Block(BlockRealize {
        iter_values: loop_vars.iter().map(Expr::var).collect(),
        predicate: Expr::Int(1),
        block,
    }));
    for ((_, extent, _), var) in axes.iter().zip(loop_vars.iter()).rev() {
        stmt = Arc::new(Stmt::Loop(Loop::serial(var.clone(), *extent, stmt)));
    }
    stmt
}

pub fn store(buffer: &Buffer, indices: Vec<Expr>, value: Expr) -> BufferStore {
    BufferStore {
        buffer: buffer.clone(),
        indices,
        value,
    }
}

use crate::ir::IterKind::{CommReduce as R, DataPar as S};

// ── Workloads ───────────────────────────────────────────────────────────────

/// `B = A * 2; C = B + 1` over an `n x n` grid. `B` is an internal buffer.
pub fn elementwise_chain(n: i64) -> Program {
    let a = Buffer::new("A", vec![n, n], DType::Float32);
    let b = Buffer::new("B", vec![n, n], DType::Float32);
    let c = Buffer::new("C", vec![n, n], DType::Float32);
    let stage_b = grid_block("B", &[("i", n, S), ("j", n, S)], |v| {
        let idx = v.to_vec();
        (None, store(&b, idx.clone(), Expr::load(&a, idx) * Expr::Float(2.0)))
    });
    let stage_c = grid_block("C", &[("i", n, S), ("j", n, S)], |v| {
        let idx = v.to_vec();
        (None, store(&c, idx.clone(), Expr::load(&b, idx) + Expr::Float(1.0)))
    });
    Program::new(
        "elementwise_chain",
        vec![a, c],
        vec![b],
        seq(vec![stage_b, stage_c]),
    )
}

/// `B[i] = A[i] * 2` over a 1-D loop of `n`.
pub fn scale_1d(n: i64) -> Program {
    let a = Buffer::new("A", vec![n], DType::Float32);
    let b = Buffer::new("B", vec![n], DType::Float32);
    let stage = grid_block("B", &[("i", n, S)], |v| {
        (None, store(&b, vec![v[0].clone()], Expr::load(&a, vec![v[0].clone()]) * Expr::Float(2.0)))
    });
    Program::new("scale_1d", vec![a, b], Vec::new(), stage)
}

/// `C[i, j] = sum_k A[i, k] * B[j, k]`.
pub fn matmul(n: i64, m: i64, k: i64) -> Program {
    let a = Buffer::new("A", vec![n, k], DType::Float32);
    let b = Buffer::new("B", vec![m, k], DType::Float32);
    let c = Buffer::new("C", vec![n, m], DType::Float32);
    let stage = grid_block("C", &[("i", n, S), ("j", m, S), ("k", k, R)], |v| {
        let (vi, vj, vk) = (v[0].clone(), v[1].clone(), v[2].clone());
        let out = vec![vi.clone(), vj.clone()];
        (
            Some(store(&c, out.clone(), Expr::Float(0.0))),
            store(
                &c,
                out.clone(),
                Expr::load(&c, out)
                    + Expr::load(&a, vec![vi, vk.clone()]) * Expr::load(&b, vec![vj, vk]),
            ),
        )
    });
    Program::new("matmul", vec![a, b, c], Vec::new(), stage)
}

/// `B[ii] = sum_{i, j} A[ii, i, j]`.
pub fn reduce_sum(n: i64, m: i64, k: i64) -> Program {
    let a = Buffer::new("A", vec![n, m, k], DType::Float32);
    let b = Buffer::new("B", vec![n], DType::Float32);
    let stage = grid_block("B", &[("ii", n, S), ("i", m, R), ("j", k, R)], |v| {
        let out = vec![v[0].clone()];
        (
            Some(store(&b, out.clone(), Expr::Float(0.0))),
            store(
                &b,
                out.clone(),
                Expr::load(&b, out) + Expr::load(&a, vec![v[0].clone(), v[1].clone(), v[2].clone()]),
            ),
        )
    });
    Program::new("reduce_sum", vec![a, b], Vec::new(), stage)
}

/// `B[i] = max_k A[i, k]`.
pub fn reduce_max(n: i64, k: i64) -> Program {
    let a = Buffer::new("A", vec![n, k], DType::Float32);
    let b = Buffer::new("B", vec![n], DType::Float32);
    let stage = grid_block("B", &[("i", n, S), ("k", k, R)], |v| {
        let out = vec![v[0].clone()];
        (
            Some(store(&b, out.clone(), Expr::Float(f64::NEG_INFINITY))),
            store(
                &b,
                out.clone(),
                Expr::binary(
                    BinOp::Max,
                    Expr::load(&b, out),
                    Expr::load(&a, vec![v[0].clone(), v[1].clone()]),
                ),
            ),
        )
    });
    Program::new("reduce_max", vec![a, b], Vec::new(), stage)
}

/// `B = A * 2; C = sum_k B[i, k]; D = C + 1`: elementwise producer, a
/// reduction, and an elementwise epilogue.
pub fn norm_chain(n: i64, k: i64) -> Program {
    let a = Buffer::new("A", vec![n, k], DType::Float32);
    let b = Buffer::new("B", vec![n, k], DType::Float32);
    let c = Buffer::new("C", vec![n], DType::Float32);
    let d = Buffer::new("D", vec![n], DType::Float32);
    let stage_b = grid_block("B", &[("i", n, S), ("k", k, S)], |v| {
        let idx = v.to_vec();
        (None, store(&b, idx.clone(), Expr::load(&a, idx) * Expr::Float(2.0)))
    });
    let stage_c = grid_block("C", &[("i", n, S), ("k", k, R)], |v| {
        let out = vec![v[0].clone()];
        (
            Some(store(&c, out.clone(), Expr::Float(0.0))),
            store(
                &c,
                out.clone(),
                Expr::load(&c, out) + Expr::load(&b, vec![v[0].clone(), v[1].clone()]),
            ),
        )
    });
    let stage_d = grid_block("D", &[("i", n, S)], |v| {
        let idx = vec![v[0].clone()];
        (None, store(&d, idx.clone(), Expr::load(&c, idx) + Expr::Float(1.0)))
    });
    Program::new(
        "norm_chain",
        vec![a, d],
        vec![b, c],
        seq(vec![stage_b, stage_c, stage_d]),
    )
}

/// Names accepted by `by_name`, with their default sizes.
pub const BUILTIN: &[&str] = &[
    "elementwise_chain",
    "scale_1d",
    "matmul",
    "reduce_sum",
    "reduce_max",
    "norm_chain",
];

/// Look up a built-in workload at its default size.
pub fn by_name(name: &str) -> Option<Program> {
    match name {
        "elementwise_chain" => Some(elementwise_chain(128)),
        "scale_1d" => Some(scale_1d(128)),
        "matmul" => Some(matmul(64, 64, 64)),
        "reduce_sum" => Some(reduce_sum(16, 16, 16)),
        "reduce_max" => Some(reduce_max(32, 32)),
        "norm_chain" => Some(norm_chain(32, 16)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for name in BUILTIN {
            let p = by_name(name).unwrap();
            assert_eq!(&p.name, name);
        }
        assert!(by_name("conv2d").is_none());
    }

    #[test]
    fn matmul_block_regions() {
        let p = matmul(8, 8, 8);
        let stmt = p.find_block("C").unwrap();
        let br = stmt.as_block().unwrap();
        assert_eq!(br.block.reads.len(), 3);
        assert_eq!(br.block.writes.len(), 1);
        assert!(br.block.init.is_some());
        assert_eq!(br.block.iter_vars[2].kind, IterKind::CommReduce);
    }
}
