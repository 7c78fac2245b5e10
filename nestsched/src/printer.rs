// printer.rs — Program text rendering and structural fingerprints
//
// Two renderings share one printer:
//   - display: variables and buffers under their own names (error dumps,
//     `--emit ir`, `show`);
//   - canonical: variables renamed `v0, v1, ...` in binding order and buffers
//     renamed `name#k` in first-appearance order, so two programs that differ
//     only in variable/buffer identities print identically.
//
// Structural equality is equality of canonical text; the fingerprint is the
// SHA-256 of that text, hex-encoded.
//
// Preconditions: none.
// Postconditions: canonical text is invariant under consistent renaming of
//                 variables and buffers.
// Failure modes: none.
// Side effects: none.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::arith;
use crate::ir::*;

const INDENT: &str = "  ";

struct Printer {
    canonical: bool,
    vars: HashMap<u64, String>,
    buffers: HashMap<u64, String>,
    out: String,
}

impl Printer {
    fn new(canonical: bool) -> Self {
        Self {
            canonical,
            vars: HashMap::new(),
            buffers: HashMap::new(),
            out: String::new(),
        }
    }

    // ── Names ───────────────────────────────────────────────────────────────

    fn bind_var(&mut self, v: &Var) -> String {
        if !self.canonical {
            return v.name.to_string();
        }
        let next = format!("v{}", self.vars.len());
        self.vars.entry(v.id).or_insert(next).clone()
    }

    fn var_name(&mut self, v: &Var) -> String {
        // Free variables get bound on first sight.
        self.bind_var(v)
    }

    fn buffer_name(&mut self, b: &Buffer) -> String {
        if !self.canonical {
            return b.name.clone();
        }
        let next = format!("{}#{}", b.name, self.buffers.len());
        self.buffers.entry(b.id).or_insert(next).clone()
    }

    fn buffer_decl(&mut self, b: &Buffer) -> String {
        let dims: Vec<String> = b.shape.iter().map(|d| d.to_string()).collect();
        let mut s = format!("{}: {}[{}]", self.buffer_name(b), b.dtype.as_str(), dims.join(", "));
        if b.scope != "global" {
            let _ = write!(s, " @{}", b.scope);
        }
        s
    }

    // ── Expressions ─────────────────────────────────────────────────────────

    fn expr(&mut self, e: &Expr) -> String {
        match e {
            Expr::Int(v) => v.to_string(),
            Expr::Float(v) => format!("{:?}", v),
            Expr::Var(v) => self.var_name(v),
            Expr::Load(load) => {
                let name = self.buffer_name(&load.buffer);
                let idx = self.expr_list(&load.indices);
                format!("{}[{}]", name, idx)
            }
            Expr::Binary(op, a, b) if op.is_call_style() => {
                let a = self.expr(a);
                let b = self.expr(b);
                format!("{}({}, {})", op.symbol(), a, b)
            }
            Expr::Binary(op, a, b) => {
                let a = self.operand(a);
                let b = self.operand(b);
                format!("{} {} {}", a, op.symbol(), b)
            }
            Expr::Select(c, t, f) => {
                let c = self.expr(c);
                let t = self.expr(t);
                let f = self.expr(f);
                format!("select({}, {}, {})", c, t, f)
            }
        }
    }

    fn operand(&mut self, e: &Expr) -> String {
        match e {
            Expr::Binary(op, _, _) if !op.is_call_style() => format!("({})", self.expr(e)),
            _ => self.expr(e),
        }
    }

    fn expr_list(&mut self, items: &[Expr]) -> String {
        let parts: Vec<String> = items.iter().map(|e| self.expr(e)).collect();
        parts.join(", ")
    }

    fn region(&mut self, r: &BufferRegion) -> String {
        let name = self.buffer_name(&r.buffer);
        let dims: Vec<String> = r
            .region
            .iter()
            .map(|rg| {
                if rg.extent == Expr::Int(1) {
                    self.expr(&rg.min)
                } else {
                    let lo = self.expr(&rg.min);
                    let hi = self.expr(&arith::add(rg.min.clone(), rg.extent.clone()));
                    format!("{}:{}", lo, hi)
                }
            })
            .collect();
        format!("{}[{}]", name, dims.join(", "))
    }

    fn annotation(&self, v: &AnnValue) -> String {
        match v {
            AnnValue::Int(i) => i.to_string(),
            AnnValue::Str(s) => format!("{:?}", s),
            AnnValue::Tuples(rows) => {
                let rows: Vec<String> = rows
                    .iter()
                    .map(|r| {
                        let items: Vec<String> = r.iter().map(|x| x.to_string()).collect();
                        format!("[{}]", items.join(", "))
                    })
                    .collect();
                format!("[{}]", rows.join(", "))
            }
        }
    }

    // ── Statements ──────────────────────────────────────────────────────────

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn stmt(&mut self, s: &Stmt, depth: usize) {
        match s {
            Stmt::Seq(items) => {
                for item in items {
                    self.stmt(item, depth);
                }
            }
            Stmt::Store(st) => {
                let name = self.buffer_name(&st.buffer);
                let idx = self.expr_list(&st.indices);
                let value = self.expr(&st.value);
                self.line(depth, &format!("{}[{}] = {}", name, idx, value));
            }
            Stmt::Loop(l) => {
                let var = self.bind_var(&l.loop_var);
                let range = if l.min == Expr::Int(0) {
                    self.expr(&l.extent)
                } else {
                    let lo = self.expr(&l.min);
                    let hi = self.expr(&arith::add(l.min.clone(), l.extent.clone()));
                    format!("{}, {}", lo, hi)
                };
                let head = match &l.kind {
                    ForKind::Serial => format!("for {} in range({}):", var, range),
                    ForKind::ThreadBinding(axis) => {
                        format!("for {} in thread_binding({}, {:?}):", var, range, axis)
                    }
                    kind => format!("for {} in {}({}):", var, kind.name(), range),
                };
                self.line(depth, &head);
                for (k, v) in &l.annotations {
                    let v = self.annotation(v);
                    self.line(depth + 1, &format!("attr {}={}", k, v));
                }
                self.stmt(&l.body, depth + 1);
            }
            Stmt::Block(br) => self.block(br, depth),
        }
    }

    fn block(&mut self, br: &BlockRealize, depth: usize) {
        let b = &br.block;
        self.line(depth, &format!("block {}:", b.name));
        let inner = depth + 1;
        for (iv, value) in b.iter_vars.iter().zip(br.iter_values.iter()) {
            // The binding value lives in the enclosing scope; print it first
            // so canonical numbering follows program order.
            let value = self.expr(value);
            let name = self.bind_var(&iv.var);
            let lo = self.expr(&iv.dom.min);
            let hi = self.expr(&arith::add(iv.dom.min.clone(), iv.dom.extent.clone()));
            self.line(
                inner,
                &format!("bind {}: {}[{}:{}] = {}", name, iv.kind.code(), lo, hi, value),
            );
        }
        if !br.predicate.is_true() {
            let pred = self.expr(&br.predicate);
            self.line(inner, &format!("where {}", pred));
        }
        if !b.reads.is_empty() {
            let parts: Vec<String> = b.reads.iter().map(|r| self.region(r)).collect();
            self.line(inner, &format!("reads {}", parts.join(", ")));
        }
        if !b.writes.is_empty() {
            let parts: Vec<String> = b.writes.iter().map(|r| self.region(r)).collect();
            self.line(inner, &format!("writes {}", parts.join(", ")));
        }
        for buf in &b.alloc_buffers {
            let decl = self.buffer_decl(buf);
            self.line(inner, &format!("alloc {}", decl));
        }
        for (k, v) in &b.annotations {
            let v = self.annotation(v);
            self.line(inner, &format!("attr {}={}", k, v));
        }
        if let Some(init) = &b.init {
            self.line(inner, "init:");
            self.stmt(init, inner + 1);
        }
        self.stmt(&b.body, inner);
    }

    fn program(&mut self, p: &Program) {
        let params: Vec<String> = p.params.iter().map(|b| self.buffer_decl(b)).collect();
        let head = format!("def {}({}):", p.name, params.join(", "));
        self.line(0, &head);
        self.stmt(&p.root, 1);
    }
}

// ── Public API ──────────────────────────────────────────────────────────────

/// Program text under its own names.
pub fn script(p: &Program) -> String {
    let mut pr = Printer::new(false);
    pr.program(p);
    pr.out
}

/// Text of one statement subtree under its own names.
pub fn stmt_script(s: &Arc<Stmt>) -> String {
    let mut pr = Printer::new(false);
    pr.stmt(s, 0);
    pr.out
}

pub fn expr_script(e: &Expr) -> String {
    Printer::new(false).expr(e)
}

/// Identity-independent program text.
pub fn canonical(p: &Program) -> String {
    let mut pr = Printer::new(true);
    pr.program(p);
    pr.out
}

pub fn structural_equal(a: &Program, b: &Program) -> bool {
    canonical(a) == canonical(b)
}

/// SHA-256 of the canonical text, lowercase hex.
pub fn fingerprint(p: &Program) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(p).as_bytes());
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    bytes_to_hex(&digest)
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
