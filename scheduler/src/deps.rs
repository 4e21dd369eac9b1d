// deps.rs — Conservative dependence tests
//
// Legality checks for the reordering edits. Every test answers "provably
// safe" or "not shown safe"; the edits report the latter as NotApplicable.
//
// The facts used:
//   - reductions (`+=`) into a buffer commute with each other;
//   - accesses with identical index tuples, where some dimension strides
//     over the loop variable by more than the inner loops can span, touch
//     disjoint elements in different iterations of that loop;
//   - a statement list that does not depend on the loop variable, does not
//     reduce, and never reads what it writes computes the same thing on
//     every iteration (idempotent and invariant).
// Buffers allocated inside the analysed statements are private to them and
// ignored. Instruction calls are opaque: every window argument is read and
// written.

use std::collections::{BTreeMap, BTreeSet};

use crate::affine::Affine;
use crate::ast::*;
use crate::walk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Reduce,
}

/// One access to a non-local buffer. `idx` is `None` for whole-buffer or
/// window uses.
#[derive(Debug, Clone)]
pub struct Touch {
    pub buf: String,
    pub idx: Option<Vec<Expr>>,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default)]
pub struct Effects {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
    pub reduces: BTreeSet<String>,
    pub opaque: bool,
    pub touches: Vec<Touch>,
    /// Trip counts of loops inside the statements, `None` when symbolic.
    pub loops: BTreeMap<String, Option<i64>>,
    pub locals: BTreeSet<String>,
}

impl Effects {
    pub fn of(stmts: &[Stmt]) -> Self {
        let mut fx = Effects::default();
        walk::visit_stmts(stmts, &mut |s| match &s.kind {
            StmtKind::Alloc(a) => {
                fx.locals.insert(a.name.clone());
            }
            StmtKind::For(l) => {
                fx.loops.insert(l.var.clone(), l.trip_count());
            }
            _ => {}
        });

        walk::visit_stmts(stmts, &mut |s| {
            match &s.kind {
                StmtKind::Assign(st) => fx.touch(&st.lhs.buf, Some(&st.lhs.idx), Mode::Write),
                StmtKind::Reduce(st) => fx.touch(&st.lhs.buf, Some(&st.lhs.idx), Mode::Reduce),
                StmtKind::Call(c) => {
                    fx.opaque = true;
                    for arg in &c.args {
                        if let Expr::Window(w) = arg {
                            fx.touch(&w.buf, None, Mode::Read);
                            fx.touch(&w.buf, None, Mode::Write);
                        }
                    }
                }
                _ => {}
            }
            for e in walk::stmt_exprs(s) {
                walk::walk_expr(e, &mut |sub| {
                    if let Expr::Read(a) = sub {
                        fx.touch(&a.buf, Some(&a.idx), Mode::Read);
                    }
                });
            }
        });
        fx
    }

    fn touch(&mut self, buf: &str, idx: Option<&Vec<Expr>>, mode: Mode) {
        if self.locals.contains(buf) {
            return;
        }
        match mode {
            Mode::Read => self.reads.insert(buf.to_string()),
            Mode::Write => self.writes.insert(buf.to_string()),
            Mode::Reduce => self.reduces.insert(buf.to_string()),
        };
        self.touches.push(Touch {
            buf: buf.to_string(),
            idx: idx.cloned(),
            mode,
        });
    }

    pub fn uses(&self, buf: &str) -> bool {
        self.reads.contains(buf) || self.writes.contains(buf) || self.reduces.contains(buf)
    }

    /// Buffers written or reduced into.
    pub fn mutated(&self) -> BTreeSet<String> {
        self.writes.union(&self.reduces).cloned().collect()
    }

    /// Only `+=` touches `buf`.
    pub fn reduce_only(&self, buf: &str) -> bool {
        !self.reads.contains(buf) && !self.writes.contains(buf)
    }
}

/// Top-level allocations of `stmts` that `other` refers to.
fn escaping_allocs(stmts: &[Stmt], other: &[Stmt]) -> Option<String> {
    let used = walk::buffers_used(other);
    stmts
        .iter()
        .filter_map(Stmt::as_alloc)
        .find(|a| used.contains(&a.name))
        .map(|a| a.name.clone())
}

/// Whether `a` and then `b` may be swapped into `b` then `a`.
pub fn commutes(a: &[Stmt], b: &[Stmt]) -> Result<(), String> {
    if let Some(name) = escaping_allocs(a, b).or_else(|| escaping_allocs(b, a)) {
        return Err(format!("allocation of `{name}` is used by the other statement"));
    }
    let (fa, fb) = (Effects::of(a), Effects::of(b));
    if fa.opaque && fb.opaque {
        let shared: Vec<_> = fa.mutated().intersection(&fb.mutated()).cloned().collect();
        if let Some(buf) = shared.first() {
            return Err(format!("both statements pass `{buf}` to an instruction"));
        }
    }
    for buf in fa.mutated().union(&fb.mutated()) {
        if !(fa.uses(buf) && fb.uses(buf)) {
            continue;
        }
        if !(fa.reduce_only(buf) && fb.reduce_only(buf)) {
            return Err(format!("both statements touch `{buf}` and one writes it"));
        }
    }
    Ok(())
}

/// Whether `for var { prefix; suffix }` may become
/// `for var { prefix } for var { suffix }`.
pub fn fission_legal(var: &str, prefix: &[Stmt], suffix: &[Stmt]) -> Result<(), String> {
    if let Some(name) = escaping_allocs(prefix, suffix) {
        return Err(format!("allocation of `{name}` is used after the split point"));
    }
    let (fp, fs) = (Effects::of(prefix), Effects::of(suffix));
    if invariant_prefix(var, prefix, &fp, &fs) {
        return Ok(());
    }
    let mut inner = fp.loops.clone();
    inner.extend(fs.loops.clone());
    for buf in fp.mutated().union(&fs.mutated()) {
        if !(fp.uses(buf) && fs.uses(buf)) {
            continue;
        }
        if fp.reduce_only(buf) && fs.reduce_only(buf) {
            continue;
        }
        let touches = fp.touches.iter().chain(&fs.touches).filter(|t| &t.buf == buf);
        if !disjoint_across(var, touches, &inner) {
            return Err(format!(
                "iterations of `{var}` may share elements of `{buf}` across the split"
            ));
        }
    }
    Ok(())
}

/// Whether `if cond { prefix; suffix }` may become
/// `if cond { prefix } if cond { suffix }`.
pub fn guard_split_legal(cond: &Expr, prefix: &[Stmt], suffix: &[Stmt]) -> Result<(), String> {
    if let Some(name) = escaping_allocs(prefix, suffix) {
        return Err(format!("allocation of `{name}` is used after the split point"));
    }
    guard_stable(cond, prefix)
}

/// Whether running `stmts` leaves every buffer `cond` reads unchanged.
pub fn guard_stable(cond: &Expr, stmts: &[Stmt]) -> Result<(), String> {
    let mutated = Effects::of(stmts).mutated();
    let mut clash = None;
    walk::walk_expr(cond, &mut |e| {
        if let Expr::Read(a) = e {
            if clash.is_none() && mutated.contains(&a.buf) {
                clash = Some(a.buf.clone());
            }
        }
    });
    match clash {
        Some(buf) => Err(format!("condition reads `{buf}`, which the body writes")),
        None => Ok(()),
    }
}

fn invariant_prefix(var: &str, prefix: &[Stmt], fp: &Effects, fs: &Effects) -> bool {
    if walk::free_vars(prefix).contains(var) || fp.opaque || !fp.reduces.is_empty() {
        return false;
    }
    let suffix_mut = fs.mutated();
    fp.writes.is_disjoint(&fp.reads)
        && fp.writes.is_disjoint(&suffix_mut)
        && fp.reads.is_disjoint(&suffix_mut)
}

/// Whether the perfectly nested `outer { inner { body } }` may be
/// interchanged.
pub fn interchange_legal(outer: &ForLoop, inner: &ForLoop) -> Result<(), String> {
    if inner.lo.mentions(&outer.var) || inner.hi.mentions(&outer.var) {
        return Err(format!(
            "bounds of `{}` depend on `{}`",
            inner.var, outer.var
        ));
    }
    let fx = Effects::of(&inner.body);
    let mut with_inner = fx.loops.clone();
    with_inner.insert(inner.var.clone(), inner.trip_count());
    for buf in fx.mutated() {
        if fx.reduce_only(&buf) {
            continue;
        }
        let touches: Vec<&Touch> = fx.touches.iter().filter(|t| t.buf == buf).collect();
        if !disjoint_across(&outer.var, touches.iter().copied(), &with_inner)
            || !disjoint_across(&inner.var, touches.iter().copied(), &fx.loops)
        {
            return Err(format!(
                "iterations of `{}` and `{}` may share elements of `{buf}`",
                outer.var, inner.var
            ));
        }
    }
    Ok(())
}

/// Whether `body` does the same thing on every iteration of `var`, so one
/// execution is equivalent to many.
pub fn idempotent_invariant(var: &str, body: &[Stmt]) -> Result<(), String> {
    if walk::free_vars(body).contains(var) {
        return Err(format!("body depends on `{var}`"));
    }
    let fx = Effects::of(body);
    if fx.opaque {
        return Err("body calls an instruction".to_string());
    }
    if let Some(buf) = fx.reduces.first() {
        return Err(format!("body accumulates into `{buf}`"));
    }
    if let Some(buf) = fx.writes.intersection(&fx.reads).next() {
        return Err(format!("body reads `{buf}`, which it also writes"));
    }
    Ok(())
}

/// All touches share one index tuple, and some dimension of it separates
/// different iterations of `var` given the spans of the `inner` loops.
fn disjoint_across<'a>(
    var: &str,
    mut touches: impl Iterator<Item = &'a Touch>,
    inner: &BTreeMap<String, Option<i64>>,
) -> bool {
    let Some(first) = touches.next() else {
        return true;
    };
    let Some(tuple) = normalized(first) else {
        return false;
    };
    for t in touches {
        if normalized(t).as_ref() != Some(&tuple) {
            return false;
        }
    }
    tuple.iter().any(|dim| separates(var, dim, inner))
}

fn normalized(t: &Touch) -> Option<Vec<Affine>> {
    t.idx.as_ref()?.iter().map(Affine::from_expr).collect()
}

fn separates(var: &str, dim: &Affine, inner: &BTreeMap<String, Option<i64>>) -> bool {
    let stride = dim.coef(var).abs();
    if stride == 0 {
        return false;
    }
    let mut span: i64 = 0;
    for (w, trip) in inner {
        let coef = dim.coef(w).abs();
        if w == var || coef == 0 {
            continue;
        }
        match trip {
            Some(t) if *t >= 1 => span += coef * (t - 1),
            Some(_) => {}
            None => return false,
        }
    }
    stride > span
}
