// arith.rs — Expression arithmetic for schedule primitives
//
// Constant-folding constructors, variable substitution over expressions and
// statements, linear forms, quasi-affine detection, interval bounds used by
// region inference, and block read/write region inference.
//
// Preconditions: none.
// Postconditions: folding and substitution preserve expression values.
// Failure modes: analyses return `None` when an expression is outside the
//                linear/quasi-affine fragment they understand.
// Side effects: none.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ir::*;

// ── Folding constructors ────────────────────────────────────────────────────

pub fn add(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) => match x.checked_add(*y) {
            Some(v) => Expr::Int(v),
            None => Expr::binary(BinOp::Add, a, b),
        },
        (_, Expr::Int(0)) => a,
        (Expr::Int(0), _) => b,
        _ => Expr::binary(BinOp::Add, a, b),
    }
}

pub fn sub(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) => match x.checked_sub(*y) {
            Some(v) => Expr::Int(v),
            None => Expr::binary(BinOp::Sub, a, b),
        },
        (_, Expr::Int(0)) => a,
        _ => Expr::binary(BinOp::Sub, a, b),
    }
}

pub fn mul(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) => match x.checked_mul(*y) {
            Some(v) => Expr::Int(v),
            None => Expr::binary(BinOp::Mul, a, b),
        },
        (_, Expr::Int(1)) => a,
        (Expr::Int(1), _) => b,
        (_, Expr::Int(0)) | (Expr::Int(0), _) => Expr::Int(0),
        _ => Expr::binary(BinOp::Mul, a, b),
    }
}

pub fn floordiv(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) if x.checked_div_euclid(*y).is_some() => Expr::Int(x.div_euclid(*y)),
        (_, Expr::Int(1)) => a,
        _ => Expr::binary(BinOp::FloorDiv, a, b),
    }
}

pub fn floormod(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) if x.checked_rem_euclid(*y).is_some() => Expr::Int(x.rem_euclid(*y)),
        (_, Expr::Int(1)) => Expr::Int(0),
        _ => Expr::binary(BinOp::FloorMod, a, b),
    }
}

pub fn ceildiv(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) if *y > 0 && x.checked_add(y - 1).is_some() => {
            Expr::Int((x + y - 1).div_euclid(*y))
        }
        _ => floordiv(add(a, sub(b.clone(), Expr::Int(1))), b),
    }
}

pub fn lt(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(x), Expr::Int(y)) => Expr::Int((x < y) as i64),
        _ => Expr::binary(BinOp::Lt, a, b),
    }
}

pub fn and(a: Expr, b: Expr) -> Expr {
    match (&a, &b) {
        (Expr::Int(1), _) => b,
        (_, Expr::Int(1)) => a,
        (Expr::Int(0), _) | (_, Expr::Int(0)) => Expr::Int(0),
        _ => Expr::binary(BinOp::And, a, b),
    }
}

/// Product of extents, folding constants.
pub fn product(items: impl IntoIterator<Item = Expr>) -> Expr {
    items.into_iter().fold(Expr::Int(1), mul)
}

/// Bottom-up constant folding and identity elimination.
pub fn simplify(e: &Expr) -> Expr {
    e.rewrite(&mut |node| match node {
        Expr::Binary(op, a, b) => match op {
            BinOp::Add => add(*a, *b),
            BinOp::Sub => sub(*a, *b),
            BinOp::Mul => mul(*a, *b),
            BinOp::FloorDiv => floordiv(*a, *b),
            BinOp::FloorMod => floormod(*a, *b),
            BinOp::Lt => lt(*a, *b),
            BinOp::And => and(*a, *b),
            _ => Expr::Binary(op, a, b),
        },
        other => other,
    })
}

// ── Substitution ────────────────────────────────────────────────────────────

pub type VarMap = HashMap<Var, Expr>;

pub fn substitute(e: &Expr, map: &VarMap) -> Expr {
    if map.is_empty() {
        return e.clone();
    }
    let out = e.rewrite(&mut |node| match node {
        Expr::Var(v) => match map.get(&v) {
            Some(replacement) => replacement.clone(),
            None => Expr::Var(v),
        },
        other => other,
    });
    simplify(&out)
}

fn substitute_region(r: &BufferRegion, map: &VarMap) -> BufferRegion {
    BufferRegion {
        buffer: r.buffer.clone(),
        region: r
            .region
            .iter()
            .map(|rg| Range::new(substitute(&rg.min, map), substitute(&rg.extent, map)))
            .collect(),
    }
}

/// Substitute free variables throughout a statement subtree. Block iteration
/// variables are binders and are never keys of `map`.
pub fn substitute_stmt(stmt: &Arc<Stmt>, map: &VarMap) -> Arc<Stmt> {
    if map.is_empty() {
        return stmt.clone();
    }
    Arc::new(match stmt.as_ref() {
        Stmt::Loop(l) => Stmt::Loop(Loop {
            loop_var: l.loop_var.clone(),
            min: substitute(&l.min, map),
            extent: substitute(&l.extent, map),
            kind: l.kind.clone(),
            annotations: l.annotations.clone(),
            body: substitute_stmt(&l.body, map),
        }),
        Stmt::Block(br) => Stmt::Block(BlockRealize {
            iter_values: br.iter_values.iter().map(|v| substitute(v, map)).collect(),
            predicate: substitute(&br.predicate, map),
            block: Block {
                reads: br.block.reads.iter().map(|r| substitute_region(r, map)).collect(),
                writes: br.block.writes.iter().map(|r| substitute_region(r, map)).collect(),
                init: br.block.init.as_ref().map(|s| substitute_stmt(s, map)),
                body: substitute_stmt(&br.block.body, map),
                ..br.block.clone()
            },
        }),
        Stmt::Seq(items) => Stmt::Seq(items.iter().map(|s| substitute_stmt(s, map)).collect()),
        Stmt::Store(st) => Stmt::Store(BufferStore {
            buffer: st.buffer.clone(),
            indices: st.indices.iter().map(|i| substitute(i, map)).collect(),
            value: substitute(&st.value, map),
        }),
    })
}

/// Replace every reference to buffer `from` (loads, stores, regions and
/// allocations) with `to` in a subtree.
pub fn replace_buffer(stmt: &Arc<Stmt>, from: &Buffer, to: &Buffer) -> Arc<Stmt> {
    let swap = |b: &Buffer| if b == from { to.clone() } else { b.clone() };
    let rewrite_expr = |e: &Expr| {
        e.rewrite(&mut |node| match node {
            Expr::Load(load) if &load.buffer == from => Expr::Load(BufferLoad {
                buffer: to.clone(),
                indices: load.indices,
            }),
            other => other,
        })
    };
    let swap_region = |r: &BufferRegion| BufferRegion {
        buffer: swap(&r.buffer),
        region: r.region.clone(),
    };
    Arc::new(match stmt.as_ref() {
        Stmt::Loop(l) => Stmt::Loop(l.with_body(replace_buffer(&l.body, from, to))),
        Stmt::Block(br) => Stmt::Block(br.with_block(Block {
            reads: br.block.reads.iter().map(swap_region).collect(),
            writes: br.block.writes.iter().map(swap_region).collect(),
            alloc_buffers: br.block.alloc_buffers.iter().map(swap).collect(),
            init: br.block.init.as_ref().map(|s| replace_buffer(s, from, to)),
            body: replace_buffer(&br.block.body, from, to),
            ..br.block.clone()
        })),
        Stmt::Seq(items) => {
            Stmt::Seq(items.iter().map(|s| replace_buffer(s, from, to)).collect())
        }
        Stmt::Store(st) => Stmt::Store(BufferStore {
            buffer: swap(&st.buffer),
            indices: st.indices.iter().map(rewrite_expr).collect(),
            value: rewrite_expr(&st.value),
        }),
    })
}

// ── Linear forms ────────────────────────────────────────────────────────────

/// `sum(coeff * var) + constant`, terms kept in first-occurrence order with
/// non-zero coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearForm {
    pub terms: Vec<(Var, i64)>,
    pub constant: i64,
}

impl LinearForm {
    fn constant(c: i64) -> Self {
        Self {
            terms: Vec::new(),
            constant: c,
        }
    }

    fn scale(mut self, k: i64) -> Self {
        for (_, c) in &mut self.terms {
            *c *= k;
        }
        self.constant *= k;
        self.terms.retain(|(_, c)| *c != 0);
        self
    }

    fn plus(mut self, other: LinearForm) -> Self {
        for (v, c) in other.terms {
            match self.terms.iter_mut().find(|(w, _)| *w == v) {
                Some((_, acc)) => *acc += c,
                None => self.terms.push((v, c)),
            }
        }
        self.constant += other.constant;
        self.terms.retain(|(_, c)| *c != 0);
        self
    }

    pub fn coeff(&self, var: &Var) -> i64 {
        self.terms
            .iter()
            .find(|(v, _)| v == var)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    /// Rebuild an expression, folding constants.
    pub fn to_expr(&self) -> Expr {
        let mut acc: Option<Expr> = None;
        for (v, c) in &self.terms {
            let term = mul(Expr::var(v), Expr::Int(*c));
            acc = Some(match acc {
                Some(a) => add(a, term),
                None => term,
            });
        }
        match acc {
            Some(a) => add(a, Expr::Int(self.constant)),
            None => Expr::Int(self.constant),
        }
    }

    /// The form with the terms for `vars` removed.
    fn without(&self, vars: &HashMap<Var, (i64, i64)>) -> LinearForm {
        LinearForm {
            terms: self
                .terms
                .iter()
                .filter(|(v, _)| !vars.contains_key(v))
                .cloned()
                .collect(),
            constant: self.constant,
        }
    }
}

/// Decompose an integer expression into a linear form, if it is one.
pub fn linear_form(e: &Expr) -> Option<LinearForm> {
    match e {
        Expr::Int(c) => Some(LinearForm::constant(*c)),
        Expr::Var(v) => Some(LinearForm {
            terms: vec![(v.clone(), 1)],
            constant: 0,
        }),
        Expr::Binary(BinOp::Add, a, b) => Some(linear_form(a)?.plus(linear_form(b)?)),
        Expr::Binary(BinOp::Sub, a, b) => Some(linear_form(a)?.plus(linear_form(b)?.scale(-1))),
        Expr::Binary(BinOp::Mul, a, b) => {
            let la = linear_form(a)?;
            let lb = linear_form(b)?;
            if la.terms.is_empty() {
                Some(lb.scale(la.constant))
            } else if lb.terms.is_empty() {
                Some(la.scale(lb.constant))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Quasi-affine in `loop_vars`: built from those variables and integer
/// constants with `+`, `-`, multiplication by a constant, and floordiv /
/// floormod by a positive constant.
pub fn is_quasi_affine(e: &Expr, loop_vars: &HashSet<Var>) -> bool {
    match e {
        Expr::Int(_) => true,
        Expr::Var(v) => loop_vars.contains(v),
        Expr::Binary(BinOp::Add | BinOp::Sub, a, b) => {
            is_quasi_affine(a, loop_vars) && is_quasi_affine(b, loop_vars)
        }
        Expr::Binary(BinOp::Mul, a, b) => match (a.as_int(), b.as_int()) {
            (Some(_), _) => is_quasi_affine(b, loop_vars),
            (_, Some(_)) => is_quasi_affine(a, loop_vars),
            _ => false,
        },
        Expr::Binary(BinOp::FloorDiv | BinOp::FloorMod, a, b) => {
            matches!(b.as_int(), Some(k) if k > 0) && is_quasi_affine(a, loop_vars)
        }
        _ => false,
    }
}

// ── Interval bounds ─────────────────────────────────────────────────────────

/// Bound of an index expression: `[min, min + extent)` where `min` keeps the
/// non-relaxed variables symbolic.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBound {
    pub base: LinearForm,
    pub lo: i64,
    pub extent: i64,
}

impl IndexBound {
    pub fn min_expr(&self) -> Expr {
        let mut f = self.base.clone();
        f.constant += self.lo;
        f.to_expr()
    }

    /// Union of two bounds with the same symbolic base.
    pub fn union(&self, other: &IndexBound) -> Option<IndexBound> {
        if self.base != other.base {
            return None;
        }
        let lo = self.lo.min(other.lo);
        let hi = (self.lo + self.extent).max(other.lo + other.extent);
        Some(IndexBound {
            base: self.base.clone(),
            lo,
            extent: hi - lo,
        })
    }
}

/// Bound `e` when each variable in `relaxed` ranges over `[lo, hi]`
/// (inclusive). Other variables stay symbolic.
pub fn bound_index(e: &Expr, relaxed: &HashMap<Var, (i64, i64)>) -> Option<IndexBound> {
    let form = linear_form(&simplify(e))?;
    let mut lo = 0;
    let mut hi = 0;
    for (v, c) in &form.terms {
        if let Some(&(vlo, vhi)) = relaxed.get(v) {
            if *c >= 0 {
                lo += c * vlo;
                hi += c * vhi;
            } else {
                lo += c * vhi;
                hi += c * vlo;
            }
        }
    }
    let mut base = form.without(relaxed);
    let c = base.constant;
    base.constant = 0;
    Some(IndexBound {
        base,
        lo: lo + c,
        extent: hi - lo + 1,
    })
}

// ── Region inference ────────────────────────────────────────────────────────

struct Access<'a> {
    buffer: &'a Buffer,
    indices: &'a [Expr],
}

fn collect_accesses<'a>(stmt: &'a Stmt, reads: &mut Vec<Access<'a>>, writes: &mut Vec<Access<'a>>) {
    match stmt {
        Stmt::Store(st) => {
            for idx in &st.indices {
                collect_loads(idx, reads);
            }
            collect_loads(&st.value, reads);
            writes.push(Access {
                buffer: &st.buffer,
                indices: &st.indices,
            });
        }
        Stmt::Seq(items) => {
            for item in items {
                collect_accesses(item, reads, writes);
            }
        }
        Stmt::Loop(l) => collect_accesses(&l.body, reads, writes),
        Stmt::Block(_) => {}
    }
}

fn collect_loads<'a>(e: &'a Expr, out: &mut Vec<Access<'a>>) {
    e.visit(&mut |node| {
        if let Expr::Load(load) = node {
            out.push(Access {
                buffer: &load.buffer,
                indices: &load.indices,
            });
        }
    });
}

fn summarize(accesses: &[Access<'_>]) -> Vec<BufferRegion> {
    let mut order: Vec<&Buffer> = Vec::new();
    for a in accesses {
        if !order.contains(&a.buffer) {
            order.push(a.buffer);
        }
    }
    order
        .into_iter()
        .map(|buffer| {
            let same: Vec<&Access<'_>> = accesses.iter().filter(|a| a.buffer == buffer).collect();
            BufferRegion {
                buffer: buffer.clone(),
                region: (0..buffer.ndim())
                    .map(|d| summarize_dim(buffer, &same, d))
                    .collect(),
            }
        })
        .collect()
}

fn summarize_dim(buffer: &Buffer, accesses: &[&Access<'_>], d: usize) -> Range {
    let full = Range::from_extent(Expr::Int(buffer.shape[d]));
    let first = &accesses[0].indices[d];
    if accesses.iter().all(|a| &a.indices[d] == first) {
        return Range::point(first.clone());
    }
    let no_relax = HashMap::new();
    let mut acc: Option<IndexBound> = None;
    for a in accesses {
        let Some(b) = bound_index(&a.indices[d], &no_relax) else {
            return full;
        };
        acc = match acc {
            None => Some(b),
            Some(prev) => match prev.union(&b) {
                Some(u) => Some(u),
                None => return full,
            },
        };
    }
    match acc {
        Some(b) => Range::new(b.min_expr(), Expr::Int(b.extent)),
        None => full,
    }
}

/// Infer read and write regions of a leaf block from its init and body.
/// Regions are expressed in the block's iteration variables.
pub fn infer_regions(block: &Block) -> (Vec<BufferRegion>, Vec<BufferRegion>) {
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    if let Some(init) = &block.init {
        collect_accesses(init, &mut reads, &mut writes);
    }
    collect_accesses(&block.body, &mut reads, &mut writes);
    (summarize(&reads), summarize(&writes))
}

/// Recompute the regions of a leaf block in place.
pub fn with_inferred_regions(mut block: Block) -> Block {
    if block.body.contains_block() {
        return block;
    }
    let (reads, writes) = infer_regions(&block);
    block.reads = reads;
    block.writes = writes;
    block
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_constructors() {
        let i = Var::new("i");
        assert_eq!(add(Expr::Int(2), Expr::Int(3)), Expr::Int(5));
        assert_eq!(mul(Expr::var(&i), Expr::Int(1)), Expr::var(&i));
        assert_eq!(mul(Expr::var(&i), Expr::Int(0)), Expr::Int(0));
        assert_eq!(ceildiv(Expr::Int(10), Expr::Int(3)), Expr::Int(4));
        assert_eq!(floormod(Expr::var(&i), Expr::Int(1)), Expr::Int(0));
        assert_eq!(floordiv(Expr::Int(-1), Expr::Int(4)), Expr::Int(-1));
    }

    #[test]
    fn folding_keeps_overflowing_constants_symbolic() {
        let big = Expr::Int(1 << 62);
        assert_eq!(
            mul(big.clone(), Expr::Int(4)),
            Expr::binary(BinOp::Mul, big.clone(), Expr::Int(4))
        );
        assert!(add(Expr::Int(i64::MAX), Expr::Int(1)).as_int().is_none());
        assert!(sub(Expr::Int(i64::MIN), Expr::Int(1)).as_int().is_none());
        assert!(floordiv(Expr::Int(i64::MIN), Expr::Int(-1)).as_int().is_none());
        assert!(ceildiv(Expr::Int(i64::MAX), Expr::Int(4)).as_int().is_none());
        assert!(product([big, Expr::Int(2)]).as_int().is_none());
    }

    #[test]
    fn linear_form_of_split_binding() {
        let i0 = Var::new("i0");
        let i1 = Var::new("i1");
        let e = Expr::var(&i0) * Expr::Int(64) + Expr::var(&i1) + Expr::Int(3);
        let f = linear_form(&e).unwrap();
        assert_eq!(f.coeff(&i0), 64);
        assert_eq!(f.coeff(&i1), 1);
        assert_eq!(f.constant, 3);
    }

    #[test]
    fn non_linear_is_rejected() {
        let i = Var::new("i");
        let j = Var::new("j");
        assert!(linear_form(&(Expr::var(&i) * Expr::var(&j))).is_none());
        assert!(linear_form(&floordiv(Expr::var(&i), Expr::Int(4))).is_none());
    }

    #[test]
    fn quasi_affine_accepts_fused_bindings() {
        let f = Var::new("f");
        let vars: HashSet<Var> = [f.clone()].into_iter().collect();
        assert!(is_quasi_affine(&floordiv(Expr::var(&f), Expr::Int(16)), &vars));
        assert!(is_quasi_affine(&floormod(Expr::var(&f), Expr::Int(16)), &vars));
        let other = Var::new("n");
        assert!(!is_quasi_affine(&(Expr::var(&f) * Expr::var(&other)), &vars));
    }

    #[test]
    fn bound_relaxes_inner_vars() {
        let io = Var::new("io");
        let ii = Var::new("ii");
        let e = Expr::var(&io) * Expr::Int(8) + Expr::var(&ii);
        let relaxed: HashMap<Var, (i64, i64)> = [(ii.clone(), (0, 7))].into_iter().collect();
        let b = bound_index(&e, &relaxed).unwrap();
        assert_eq!(b.extent, 8);
        assert_eq!(b.lo, 0);
        assert_eq!(b.base.coeff(&io), 8);
    }

    #[test]
    fn substitution_folds() {
        let i = Var::new("i");
        let e = Expr::var(&i) * Expr::Int(2) + Expr::Int(1);
        let map: VarMap = [(i.clone(), Expr::Int(3))].into_iter().collect();
        assert_eq!(substitute(&e, &map), Expr::Int(7));
    }

    #[test]
    fn regions_of_reduction_block() {
        let a = Buffer::new("A", vec![16, 16], DType::Float32);
        let c = Buffer::new("C", vec![16], DType::Float32);
        let vi = Var::new("vi");
        let vk = Var::new("vk");
        let body = Arc::new(Stmt::Store(BufferStore {
            buffer: c.clone(),
            indices: vec![Expr::var(&vi)],
            value: Expr::load(&c, vec![Expr::var(&vi)])
                + Expr::load(&a, vec![Expr::var(&vi), Expr::var(&vk)]),
        }));
        let block = Block {
            name: "C".into(),
            iter_vars: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            alloc_buffers: Vec::new(),
            init: None,
            body,
            annotations: Annotations::new(),
        };
        let (reads, writes) = infer_regions(&block);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].buffer, c);
        assert_eq!(reads[1].buffer, a);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].region[0], Range::point(Expr::var(&vi)));
    }
}
