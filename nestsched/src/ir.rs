// ir.rs — Block/loop program representation
//
// A program is a set of parameter buffers plus a root block whose body is a
// tree of loops, blocks, sequences and buffer stores. Statements are shared
// through `Arc` so a rewrite can rebuild one path and reuse every untouched
// sibling (copy-on-write splicing).
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: `Var::new` / `Buffer::new` draw from process-wide id counters.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

// ── Variables ───────────────────────────────────────────────────────────────

/// A scalar variable. Identity is the id; the name is only for display.
#[derive(Debug, Clone)]
pub struct Var {
    pub id: u64,
    pub name: Arc<str>,
}

impl Var {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_ref()),
        }
    }

    /// A fresh variable carrying the same display name.
    pub fn fresh(&self) -> Self {
        Var::new(&*self.name)
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Int32,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
        }
    }
}

#[derive(Debug)]
pub struct BufferNode {
    pub id: u64,
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: DType,
    /// Storage scope tag (`global`, `shared`, `local`, ...).
    pub scope: String,
}

/// A multi-dimensional buffer. Cloning shares the node; equality is by id.
#[derive(Debug, Clone)]
pub struct Buffer(Arc<BufferNode>);

impl Buffer {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, dtype: DType) -> Self {
        Self::with_scope(name, shape, dtype, "global")
    }

    pub fn with_scope(
        name: impl Into<String>,
        shape: Vec<i64>,
        dtype: DType,
        scope: impl Into<String>,
    ) -> Self {
        Buffer(Arc::new(BufferNode {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            shape,
            dtype,
            scope: scope.into(),
        }))
    }

    /// A new buffer (fresh id) identical to this one except for its scope.
    pub fn rescoped(&self, scope: impl Into<String>) -> Self {
        Buffer::with_scope(self.name.clone(), self.shape.clone(), self.dtype, scope)
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Full region of the buffer, `[0, shape[d])` per dimension.
    pub fn full_region(&self) -> Vec<Range> {
        self.shape
            .iter()
            .map(|&n| Range::from_extent(Expr::Int(n)))
            .collect()
    }
}

impl Deref for Buffer {
    type Target = BufferNode;

    fn deref(&self) -> &BufferNode {
        &self.0
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Real division (float operands).
    Div,
    FloorDiv,
    FloorMod,
    Min,
    Max,
    Lt,
    Le,
    Eq,
    And,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::FloorMod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Eq => "==",
            BinOp::And => "and",
        }
    }

    pub fn is_call_style(self) -> bool {
        matches!(self, BinOp::Min | BinOp::Max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferLoad {
    pub buffer: Buffer,
    pub indices: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Var(Var),
    Load(BufferLoad),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn var(v: &Var) -> Self {
        Expr::Var(v.clone())
    }

    pub fn load(buffer: &Buffer, indices: Vec<Expr>) -> Self {
        Expr::Load(BufferLoad {
            buffer: buffer.clone(),
            indices,
        })
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Self {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Select(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Expr::Int(1))
    }

    /// Pre-order walk over this expression and all sub-expressions.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Int(_) | Expr::Float(_) | Expr::Var(_) => {}
            Expr::Load(load) => {
                for idx in &load.indices {
                    idx.visit(f);
                }
            }
            Expr::Binary(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Expr::Select(c, t, e) => {
                c.visit(f);
                t.visit(f);
                e.visit(f);
            }
        }
    }

    /// Bottom-up rewrite: children are rewritten first, then `f` may replace
    /// the rebuilt node.
    pub fn rewrite(&self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Int(_) | Expr::Float(_) | Expr::Var(_) => self.clone(),
            Expr::Load(load) => Expr::Load(BufferLoad {
                buffer: load.buffer.clone(),
                indices: load.indices.iter().map(|i| i.rewrite(f)).collect(),
            }),
            Expr::Binary(op, a, b) => Expr::binary(*op, a.rewrite(f), b.rewrite(f)),
            Expr::Select(c, t, e) => Expr::select(c.rewrite(f), t.rewrite(f), e.rewrite(f)),
        };
        f(rebuilt)
    }

    pub fn uses_var(&self, var: &Var) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if v == var {
                    found = true;
                }
            }
        });
        found
    }

    /// Distinct variables in first-occurrence order.
    pub fn free_vars(&self) -> Vec<Var> {
        let mut out: Vec<Var> = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        });
        out
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Float(v)
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Expr::Var(v.clone())
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Div, self, rhs)
    }
}

/// Half-open range `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: Expr, extent: Expr) -> Self {
        Self { min, extent }
    }

    pub fn from_extent(extent: Expr) -> Self {
        Self {
            min: Expr::Int(0),
            extent,
        }
    }

    pub fn point(at: Expr) -> Self {
        Self {
            min: at,
            extent: Expr::Int(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferRegion {
    pub buffer: Buffer,
    pub region: Vec<Range>,
}

// ── Statements ──────────────────────────────────────────────────────────────

/// Role of a block iteration variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterKind {
    DataPar,
    CommReduce,
    Opaque,
}

impl IterKind {
    pub fn code(self) -> char {
        match self {
            IterKind::DataPar => 'S',
            IterKind::CommReduce => 'R',
            IterKind::Opaque => 'O',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterVar {
    pub var: Var,
    pub dom: Range,
    pub kind: IterKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    ThreadBinding(String),
}

impl ForKind {
    pub fn name(&self) -> &str {
        match self {
            ForKind::Serial => "serial",
            ForKind::Parallel => "parallel",
            ForKind::Vectorized => "vectorized",
            ForKind::Unrolled => "unroll",
            ForKind::ThreadBinding(axis) => axis.as_str(),
        }
    }
}

/// Annotation payload on loops and blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnValue {
    Int(i64),
    Str(String),
    Tuples(Vec<Vec<i64>>),
}

pub type Annotations = BTreeMap<String, AnnValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub loop_var: Var,
    pub min: Expr,
    pub extent: Expr,
    pub kind: ForKind,
    pub annotations: Annotations,
    pub body: Arc<Stmt>,
}

impl Loop {
    pub fn serial(loop_var: Var, extent: impl Into<Expr>, body: Arc<Stmt>) -> Self {
        Self {
            loop_var,
            min: Expr::Int(0),
            extent: extent.into(),
            kind: ForKind::Serial,
            annotations: Annotations::new(),
            body,
        }
    }

    pub fn with_body(&self, body: Arc<Stmt>) -> Self {
        Loop {
            body,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub iter_vars: Vec<IterVar>,
    pub reads: Vec<BufferRegion>,
    pub writes: Vec<BufferRegion>,
    pub alloc_buffers: Vec<Buffer>,
    pub init: Option<Arc<Stmt>>,
    pub body: Arc<Stmt>,
    pub annotations: Annotations,
}

impl Block {
    pub fn is_reduction_candidate(&self) -> bool {
        self.init.is_some()
    }

    pub fn iter_kind_of(&self, var: &Var) -> Option<IterKind> {
        self.iter_vars.iter().find(|iv| &iv.var == var).map(|iv| iv.kind)
    }
}

/// A block instance: iterator bindings, a guard predicate, and the block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRealize {
    pub iter_values: Vec<Expr>,
    pub predicate: Expr,
    pub block: Block,
}

impl BlockRealize {
    pub fn with_block(&self, block: Block) -> Self {
        BlockRealize {
            iter_values: self.iter_values.clone(),
            predicate: self.predicate.clone(),
            block,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferStore {
    pub buffer: Buffer,
    pub indices: Vec<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Loop(Loop),
    Block(BlockRealize),
    Seq(Vec<Arc<Stmt>>),
    Store(BufferStore),
}

impl Stmt {
    pub fn as_loop(&self) -> Option<&Loop> {
        match self {
            Stmt::Loop(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockRealize> {
        match self {
            Stmt::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, Stmt::Loop(_) | Stmt::Block(_))
    }

    /// The nearest loop/block statements below this one, in program order.
    /// Does not look past a loop or block.
    pub fn structural_children(self: &Arc<Self>) -> Vec<Arc<Stmt>> {
        let mut out = Vec::new();
        match self.as_ref() {
            Stmt::Loop(l) => collect_structural(&l.body, &mut out),
            Stmt::Block(br) => collect_structural(&br.block.body, &mut out),
            Stmt::Seq(items) => {
                for item in items {
                    collect_structural(item, &mut out);
                }
            }
            Stmt::Store(_) => {}
        }
        out
    }

    /// Visit every expression held directly or transitively by this statement.
    pub fn visit_exprs<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match self {
            Stmt::Loop(l) => {
                l.min.visit(f);
                l.extent.visit(f);
                l.body.visit_exprs(f);
            }
            Stmt::Block(br) => {
                for v in &br.iter_values {
                    v.visit(f);
                }
                br.predicate.visit(f);
                if let Some(init) = &br.block.init {
                    init.visit_exprs(f);
                }
                br.block.body.visit_exprs(f);
            }
            Stmt::Seq(items) => {
                for item in items {
                    item.visit_exprs(f);
                }
            }
            Stmt::Store(store) => {
                for idx in &store.indices {
                    idx.visit(f);
                }
                store.value.visit(f);
            }
        }
    }

    /// Visit every block realize in this subtree, pre-order.
    pub fn visit_blocks<'a>(self: &'a Arc<Self>, f: &mut impl FnMut(&'a Arc<Stmt>)) {
        match self.as_ref() {
            Stmt::Loop(l) => l.body.visit_blocks(f),
            Stmt::Block(br) => {
                f(self);
                br.block.body.visit_blocks(f);
            }
            Stmt::Seq(items) => {
                for item in items {
                    item.visit_blocks(f);
                }
            }
            Stmt::Store(_) => {}
        }
    }

    pub fn contains_block(&self) -> bool {
        match self {
            Stmt::Loop(l) => l.body.contains_block(),
            Stmt::Block(_) => true,
            Stmt::Seq(items) => items.iter().any(|s| s.contains_block()),
            Stmt::Store(_) => false,
        }
    }
}

fn collect_structural(stmt: &Arc<Stmt>, out: &mut Vec<Arc<Stmt>>) {
    match stmt.as_ref() {
        Stmt::Loop(_) | Stmt::Block(_) => out.push(stmt.clone()),
        Stmt::Seq(items) => {
            for item in items {
                collect_structural(item, out);
            }
        }
        Stmt::Store(_) => {}
    }
}

/// Build a sequence, flattening nested sequences and unwrapping singletons.
pub fn seq(items: Vec<Arc<Stmt>>) -> Arc<Stmt> {
    let mut flat = Vec::with_capacity(items.len());
    for item in items {
        match item.as_ref() {
            Stmt::Seq(inner) => flat.extend(inner.iter().cloned()),
            _ => flat.push(item),
        }
    }
    if flat.len() == 1 {
        return flat.remove(0);
    }
    Arc::new(Stmt::Seq(flat))
}

/// The statements of a body in order (a non-sequence body is one item).
pub fn seq_items(body: &Arc<Stmt>) -> Vec<Arc<Stmt>> {
    match body.as_ref() {
        Stmt::Seq(items) => items.clone(),
        _ => vec![body.clone()],
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

pub const ROOT_BLOCK_NAME: &str = "root";

/// A schedulable function: parameter buffers and a root block.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub params: Vec<Buffer>,
    pub root: Arc<Stmt>,
}

impl Program {
    /// Wrap `body` in a root block that allocates `allocs`.
    pub fn new(
        name: impl Into<String>,
        params: Vec<Buffer>,
        allocs: Vec<Buffer>,
        body: Arc<Stmt>,
    ) -> Self {
        let root = Block {
            name: ROOT_BLOCK_NAME.to_string(),
            iter_vars: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            alloc_buffers: allocs,
            init: None,
            body,
            annotations: Annotations::new(),
        };
        Self {
            name: name.into(),
            params,
            root: Arc::new(Stmt::Block(BlockRealize {
                iter_values: Vec::new(),
                predicate: Expr::Int(1),
                block: root,
            })),
        }
    }

    pub fn root_block(&self) -> &Block {
        match self.root.as_ref() {
            Stmt::Block(br) => &br.block,
            _ => panic!("internal error: program root is not a block"),
        }
    }

    pub fn is_param(&self, buffer: &Buffer) -> bool {
        self.params.contains(buffer)
    }

    /// Find a block realize by name anywhere in the program.
    pub fn find_block(&self, name: &str) -> Option<Arc<Stmt>> {
        let mut found = None;
        self.root.visit_blocks(&mut |s| {
            if found.is_none() {
                if let Stmt::Block(br) = s.as_ref() {
                    if br.block.name == name {
                        found = Some(s.clone());
                    }
                }
            }
        });
        found
    }

    /// Every block name currently in the program.
    pub fn block_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.root.visit_blocks(&mut |s| {
            if let Stmt::Block(br) = s.as_ref() {
                names.push(br.block.name.clone());
            }
        });
        names
    }

    /// `base` if no block uses it yet, otherwise `base_1`, `base_2`, ...
    pub fn unique_block_name(&self, base: &str) -> String {
        let names = self.block_names();
        if !names.iter().any(|n| n == base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", base, i))
            .find(|cand| !names.iter().any(|n| n == cand))
            .unwrap_or_else(|| base.to_string())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
