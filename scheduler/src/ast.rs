// ast.rs — Program representation for nested-loop procedures
//
// A procedure is a parameter list plus a block of statements. Statements
// are loops, conditionals, buffer allocations, element stores (`=`, `+=`),
// instruction calls, and `pass`. Every statement carries a `NodeId`; the
// expression language is integer arithmetic over loop variables and size
// parameters plus buffer reads.
//
// Preconditions: produced by the parser or by an edit from a valid tree.
// Postconditions: none (data-only module plus small structural helpers).
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::id::NodeId;
use crate::memory::Memory;

// ── Procedure ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ParamKind {
    /// Symbolic integer size (`n: size`).
    Size,
    Buffer(BufferDecl),
}

/// Element type, extents and memory of a buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferDecl {
    pub ty: ScalarType,
    pub shape: Vec<Expr>,
    pub mem: Memory,
}

impl BufferDecl {
    /// Product of the extents when all of them are literals and it fits
    /// in an `i64`.
    pub fn element_count(&self) -> Option<i64> {
        self.shape
            .iter()
            .try_fold(1i64, |acc, e| acc.checked_mul(e.as_int()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ScalarType {
    I8,
    I32,
    F32,
    F64,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::I8 => "i8",
            ScalarType::I32 => "i32",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }

    pub fn c_name(self) -> &'static str {
        match self {
            ScalarType::I8 => "int8_t",
            ScalarType::I32 => "int32_t",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "i8" => Some(ScalarType::I8),
            "i32" => Some(ScalarType::I32),
            "f32" => Some(ScalarType::F32),
            "f64" => Some(ScalarType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Statements ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stmt {
    pub id: NodeId,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StmtKind {
    For(ForLoop),
    If(IfStmt),
    Alloc(Alloc),
    Assign(Store),
    Reduce(Store),
    Call(Call),
    Pass,
}

/// `for var in seq(lo, hi) { body }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForLoop {
    pub var: String,
    pub lo: Expr,
    pub hi: Expr,
    pub body: Vec<Stmt>,
}

impl ForLoop {
    /// `hi - lo` when both bounds are literals.
    pub fn trip_count(&self) -> Option<i64> {
        self.hi.as_int()?.checked_sub(self.lo.as_int()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfStmt {
    pub cond: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

/// `name: ty[shape] @ mem`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alloc {
    pub name: String,
    pub decl: BufferDecl,
}

/// `lhs = rhs` or `lhs += rhs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Store {
    pub lhs: Access,
    pub rhs: Expr,
}

/// Instruction call; arguments are windows or scalar expressions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub instr: String,
    pub args: Vec<Expr>,
}

/// Which statement list of a compound statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Branch {
    Body,
    OrElse,
}

impl Stmt {
    pub fn new(id: NodeId, kind: StmtKind) -> Self {
        Self { id, kind }
    }

    pub fn as_loop(&self) -> Option<&ForLoop> {
        match &self.kind {
            StmtKind::For(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_alloc(&self) -> Option<&Alloc> {
        match &self.kind {
            StmtKind::Alloc(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, StmtKind::For(_))
    }

    /// The nested statement list selected by `branch`, if this statement has one.
    pub fn block(&self, branch: Branch) -> Option<&Vec<Stmt>> {
        match (&self.kind, branch) {
            (StmtKind::For(l), Branch::Body) => Some(&l.body),
            (StmtKind::If(i), Branch::Body) => Some(&i.body),
            (StmtKind::If(i), Branch::OrElse) => Some(&i.orelse),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, branch: Branch) -> Option<&mut Vec<Stmt>> {
        match (&mut self.kind, branch) {
            (StmtKind::For(l), Branch::Body) => Some(&mut l.body),
            (StmtKind::If(i), Branch::Body) => Some(&mut i.body),
            (StmtKind::If(i), Branch::OrElse) => Some(&mut i.orelse),
            _ => None,
        }
    }

    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            StmtKind::For(l) => format!("loop over `{}`", l.var),
            StmtKind::If(_) => "conditional".to_string(),
            StmtKind::Alloc(a) => format!("allocation of `{}`", a.name),
            StmtKind::Assign(s) => format!("store to `{}`", s.lhs.buf),
            StmtKind::Reduce(s) => format!("reduction into `{}`", s.lhs.buf),
            StmtKind::Call(c) => format!("call to `{}`", c.instr),
            StmtKind::Pass => "pass".to_string(),
        }
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

/// Buffer element access; a zero-dimensional buffer has an empty index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Access {
    pub buf: String,
    pub idx: Vec<Expr>,
}

/// Rectangular sub-region of a buffer, one entry per buffer dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Window {
    pub buf: String,
    pub dims: Vec<WindowDim>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WindowDim {
    Point(Expr),
    /// Half-open `lo:hi`.
    Interval(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Int(i64),
    /// Loop variable or size parameter.
    Var(String),
    Read(Access),
    Window(Window),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
        }
    }
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Bin(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn read(buf: impl Into<String>, idx: Vec<Expr>) -> Self {
        Expr::Read(Access {
            buf: buf.into(),
            idx,
        })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Loop variables and size parameters mentioned anywhere in the expression.
    pub fn free_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Int(_) => {}
            Expr::Var(v) => {
                out.insert(v.clone());
            }
            Expr::Read(a) => a.idx.iter().for_each(|e| e.free_vars(out)),
            Expr::Window(w) => {
                for d in &w.dims {
                    match d {
                        WindowDim::Point(e) => e.free_vars(out),
                        WindowDim::Interval(lo, hi) => {
                            lo.free_vars(out);
                            hi.free_vars(out);
                        }
                    }
                }
            }
            Expr::Bin(_, l, r) => {
                l.free_vars(out);
                r.free_vars(out);
            }
            Expr::Neg(e) => e.free_vars(out),
        }
    }

    pub fn mentions(&self, var: &str) -> bool {
        let mut vars = BTreeSet::new();
        self.free_vars(&mut vars);
        vars.contains(var)
    }

    /// Replace every occurrence of variable `var` with `with`.
    pub fn substitute(&self, var: &str, with: &Expr) -> Expr {
        match self {
            Expr::Var(v) if v == var => with.clone(),
            Expr::Int(_) | Expr::Var(_) => self.clone(),
            Expr::Read(a) => Expr::Read(Access {
                buf: a.buf.clone(),
                idx: a.idx.iter().map(|e| e.substitute(var, with)).collect(),
            }),
            Expr::Window(w) => Expr::Window(Window {
                buf: w.buf.clone(),
                dims: w
                    .dims
                    .iter()
                    .map(|d| match d {
                        WindowDim::Point(e) => WindowDim::Point(e.substitute(var, with)),
                        WindowDim::Interval(lo, hi) => {
                            WindowDim::Interval(lo.substitute(var, with), hi.substitute(var, with))
                        }
                    })
                    .collect(),
            }),
            Expr::Bin(op, l, r) => Expr::bin(*op, l.substitute(var, with), r.substitute(var, with)),
            Expr::Neg(e) => Expr::Neg(Box::new(e.substitute(var, with))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_count_requires_literal_bounds() {
        let lit = ForLoop {
            var: "i".into(),
            lo: Expr::Int(2),
            hi: Expr::Int(10),
            body: vec![],
        };
        assert_eq!(lit.trip_count(), Some(8));
        let sym = ForLoop {
            hi: Expr::var("n"),
            ..lit
        };
        assert_eq!(sym.trip_count(), None);
    }

    #[test]
    fn substitute_reaches_indices() {
        let e = Expr::bin(
            BinOp::Add,
            Expr::read("a", vec![Expr::var("i")]),
            Expr::var("i"),
        );
        let out = e.substitute("i", &Expr::Int(3));
        assert_eq!(
            out,
            Expr::bin(BinOp::Add, Expr::read("a", vec![Expr::Int(3)]), Expr::Int(3))
        );
    }

    #[test]
    fn free_vars_skip_buffer_names() {
        let e = Expr::read("a", vec![Expr::var("i"), Expr::var("n")]);
        let mut vars = BTreeSet::new();
        e.free_vars(&mut vars);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["i", "n"]);
    }

    #[test]
    fn element_count() {
        let decl = BufferDecl {
            ty: ScalarType::I32,
            shape: vec![Expr::Int(4), Expr::Int(16)],
            mem: Memory::Dram,
        };
        assert_eq!(decl.element_count(), Some(64));
        let scalar = BufferDecl {
            shape: vec![],
            ..decl
        };
        assert_eq!(scalar.element_count(), Some(1));
        let huge = BufferDecl {
            shape: vec![Expr::Int(4_000_000_000), Expr::Int(4_000_000_000)],
            ..scalar
        };
        assert_eq!(huge.element_count(), None);
    }
}
