// eval.rs — Reference interpreter for programs
//
// Executes a program sequentially over `f64` buffers, ignoring loop kinds
// and storage scopes. Used to check that a scheduled program computes the
// same outputs as the original.
//
// Preconditions: parameter inputs, when given, match the parameter shapes.
// Postconditions: returns the final contents of every parameter buffer.
// Failure modes: `EvalError` for shape mismatches, out-of-bounds accesses
//                and unbound variables.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ir::*;

/// Errors raised while interpreting a program.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    ShapeMismatch {
        buffer: String,
        expected: usize,
        got: usize,
    },
    OutOfBounds {
        buffer: String,
        index: Vec<i64>,
    },
    UnboundVar(String),
    UnknownBuffer(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::ShapeMismatch {
                buffer,
                expected,
                got,
            } => write!(
                f,
                "input '{}' has {} elements, expected {}",
                buffer, got, expected
            ),
            EvalError::OutOfBounds { buffer, index } => {
                write!(f, "access {}{:?} is out of bounds", buffer, index)
            }
            EvalError::UnboundVar(name) => write!(f, "variable '{}' is unbound", name),
            EvalError::UnknownBuffer(name) => {
                write!(f, "buffer '{}' is neither a parameter nor allocated", name)
            }
        }
    }
}

impl std::error::Error for EvalError {}

pub type Buffers = HashMap<String, Vec<f64>>;

struct Storage {
    shape: Vec<i64>,
    data: Vec<f64>,
}

struct Machine {
    buffers: HashMap<u64, Storage>,
    env: HashMap<u64, f64>,
}

fn element_count(shape: &[i64]) -> usize {
    shape.iter().product::<i64>().max(0) as usize
}

impl Machine {
    fn offset(&self, buffer: &Buffer, index: &[i64]) -> Result<usize, EvalError> {
        let storage = self
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| EvalError::UnknownBuffer(buffer.name.clone()))?;
        let in_bounds = index.len() == storage.shape.len()
            && index.iter().zip(&storage.shape).all(|(&i, &n)| i >= 0 && i < n);
        if !in_bounds {
            return Err(EvalError::OutOfBounds {
                buffer: buffer.name.clone(),
                index: index.to_vec(),
            });
        }
        let mut off = 0i64;
        for (&i, &n) in index.iter().zip(&storage.shape) {
            off = off * n + i;
        }
        Ok(off as usize)
    }

    fn indices(&self, exprs: &[Expr]) -> Result<Vec<i64>, EvalError> {
        exprs.iter().map(|e| Ok(self.eval(e)?.round() as i64)).collect()
    }

    fn eval(&self, e: &Expr) -> Result<f64, EvalError> {
        Ok(match e {
            Expr::Int(v) => *v as f64,
            Expr::Float(v) => *v,
            Expr::Var(v) => *self
                .env
                .get(&v.id)
                .ok_or_else(|| EvalError::UnboundVar(v.name.to_string()))?,
            Expr::Load(load) => {
                let index = self.indices(&load.indices)?;
                let off = self.offset(&load.buffer, &index)?;
                self.buffers[&load.buffer.id].data[off]
            }
            Expr::Binary(op, a, b) => {
                let a = self.eval(a)?;
                let b = self.eval(b)?;
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::FloorDiv => (a / b).floor(),
                    BinOp::FloorMod => a - b * (a / b).floor(),
                    BinOp::Min => a.min(b),
                    BinOp::Max => a.max(b),
                    BinOp::Lt => (a < b) as i64 as f64,
                    BinOp::Le => (a <= b) as i64 as f64,
                    BinOp::Eq => (a == b) as i64 as f64,
                    BinOp::And => (a != 0.0 && b != 0.0) as i64 as f64,
                }
            }
            Expr::Select(c, t, f) => {
                if self.eval(c)? != 0.0 {
                    self.eval(t)?
                } else {
                    self.eval(f)?
                }
            }
        })
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        match stmt {
            Stmt::Seq(items) => {
                for item in items {
                    self.exec(item)?;
                }
            }
            Stmt::Store(st) => {
                let index = self.indices(&st.indices)?;
                let value = self.eval(&st.value)?;
                let off = self.offset(&st.buffer, &index)?;
                if let Some(storage) = self.buffers.get_mut(&st.buffer.id) {
                    storage.data[off] = value;
                }
            }
            Stmt::Loop(l) => {
                let lo = self.eval(&l.min)?.round() as i64;
                let extent = self.eval(&l.extent)?.round() as i64;
                for i in lo..lo + extent {
                    self.env.insert(l.loop_var.id, i as f64);
                    self.exec(&l.body)?;
                }
                self.env.remove(&l.loop_var.id);
            }
            Stmt::Block(br) => self.exec_block(br)?,
        }
        Ok(())
    }

    fn exec_block(&mut self, br: &BlockRealize) -> Result<(), EvalError> {
        let values: Vec<f64> = br
            .iter_values
            .iter()
            .map(|v| self.eval(v))
            .collect::<Result<_, _>>()?;
        if self.eval(&br.predicate)? == 0.0 {
            return Ok(());
        }
        let block = &br.block;
        for buf in &block.alloc_buffers {
            self.buffers.insert(
                buf.id,
                Storage {
                    shape: buf.shape.clone(),
                    data: vec![0.0; element_count(&buf.shape)],
                },
            );
        }
        for (iv, v) in block.iter_vars.iter().zip(&values) {
            self.env.insert(iv.var.id, *v);
        }
        if let Some(init) = &block.init {
            let mut first = true;
            for (iv, v) in block.iter_vars.iter().zip(&values) {
                if iv.kind == IterKind::CommReduce && *v != self.eval(&iv.dom.min)? {
                    first = false;
                }
            }
            if first {
                self.exec(init)?;
            }
        }
        self.exec(&block.body)?;
        for iv in &block.iter_vars {
            self.env.remove(&iv.var.id);
        }
        Ok(())
    }
}

/// Run `program` on `inputs` (by parameter name). Parameters without an
/// input start zeroed. Returns every parameter's final contents.
pub fn run(program: &Program, inputs: &Buffers) -> Result<Buffers, EvalError> {
    let mut m = Machine {
        buffers: HashMap::new(),
        env: HashMap::new(),
    };
    for p in &program.params {
        let expected = element_count(&p.shape);
        let data = match inputs.get(&p.name) {
            Some(d) if d.len() != expected => {
                return Err(EvalError::ShapeMismatch {
                    buffer: p.name.clone(),
                    expected,
                    got: d.len(),
                })
            }
            Some(d) => d.clone(),
            None => vec![0.0; expected],
        };
        m.buffers.insert(
            p.id,
            Storage {
                shape: p.shape.clone(),
                data,
            },
        );
    }
    m.exec(&program.root)?;
    let mut out = Buffers::new();
    for p in &program.params {
        if let Some(storage) = m.buffers.remove(&p.id) {
            out.insert(p.name.clone(), storage.data);
        }
    }
    Ok(out)
}

/// Uniform random contents in `[-1, 1)` for every parameter.
pub fn random_inputs(program: &Program, seed: u64) -> Buffers {
    let mut rng = StdRng::seed_from_u64(seed);
    program
        .params
        .iter()
        .map(|p| {
            let data = (0..element_count(&p.shape))
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect();
            (p.name.clone(), data)
        })
        .collect()
}

/// Element-wise comparison with a relative tolerance.
pub fn outputs_match(a: &Buffers, b: &Buffers, tol: f64) -> bool {
    a.len() == b.len()
        && a.iter().all(|(name, xs)| match b.get(name) {
            Some(ys) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| x == y || (x - y).abs() <= tol * (1.0 + x.abs()))
            }
            None => false,
        })
}

/// Run both programs on the same random inputs and compare their outputs.
pub fn equivalent(original: &Program, scheduled: &Program, seed: u64) -> Result<bool, EvalError> {
    let inputs = random_inputs(original, seed);
    let expected = run(original, &inputs)?;
    let got = run(scheduled, &inputs)?;
    Ok(outputs_match(&expected, &got, 1e-5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    #[test]
    fn elementwise_chain_values() {
        let p = workload::elementwise_chain(2);
        let mut inputs = Buffers::new();
        inputs.insert("A".into(), vec![1.0, 2.0, 3.0, 4.0]);
        let out = run(&p, &inputs).unwrap();
        assert_eq!(out["C"], vec![3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn matmul_values() {
        let p = workload::matmul(2, 2, 2);
        let mut inputs = Buffers::new();
        inputs.insert("A".into(), vec![1.0, 2.0, 3.0, 4.0]);
        inputs.insert("B".into(), vec![1.0, 0.0, 0.0, 1.0]);
        inputs.insert("C".into(), vec![9.0; 4]);
        let out = run(&p, &inputs).unwrap();
        // C[i, j] = sum_k A[i, k] * B[j, k]
        assert_eq!(out["C"], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn reduce_max_starts_from_identity() {
        let p = workload::reduce_max(1, 3);
        let mut inputs = Buffers::new();
        inputs.insert("A".into(), vec![-5.0, -2.0, -7.0]);
        let out = run(&p, &inputs).unwrap();
        assert_eq!(out["B"], vec![-2.0]);
    }

    #[test]
    fn shape_mismatch_reported() {
        let p = workload::scale_1d(4);
        let mut inputs = Buffers::new();
        inputs.insert("A".into(), vec![1.0]);
        assert!(matches!(run(&p, &inputs), Err(EvalError::ShapeMismatch { .. })));
    }

    #[test]
    fn program_equivalent_to_itself() {
        let p = workload::norm_chain(3, 5);
        assert!(equivalent(&p, &p, 11).unwrap());
    }
}
