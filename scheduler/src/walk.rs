// walk.rs — Traversals over statement trees
//
// Pre-order statement visitors, expression visitors, and the bulk rewrites
// edits are built from (substitution, buffer renaming, access rewriting,
// fresh renumbering of copied subtrees).

use std::collections::BTreeSet;

use crate::ast::*;
use crate::id::NodeIdAllocator;

// ── Statements ──────────────────────────────────────────────────────────────

/// Visit every statement in pre-order.
pub fn visit_stmts<'a>(stmts: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
    for s in stmts {
        f(s);
        for branch in [Branch::Body, Branch::OrElse] {
            if let Some(block) = s.block(branch) {
                visit_stmts(block, f);
            }
        }
    }
}

pub fn visit_stmts_mut(stmts: &mut [Stmt], f: &mut impl FnMut(&mut Stmt)) {
    for s in stmts {
        f(s);
        for branch in [Branch::Body, Branch::OrElse] {
            if let Some(block) = s.block_mut(branch) {
                visit_stmts_mut(block, f);
            }
        }
    }
}

/// Expression slots owned directly by one statement (not its children).
pub fn stmt_exprs(s: &Stmt) -> Vec<&Expr> {
    match &s.kind {
        StmtKind::For(l) => vec![&l.lo, &l.hi],
        StmtKind::If(i) => vec![&i.cond],
        StmtKind::Alloc(a) => a.decl.shape.iter().collect(),
        StmtKind::Assign(st) | StmtKind::Reduce(st) => {
            st.lhs.idx.iter().chain(std::iter::once(&st.rhs)).collect()
        }
        StmtKind::Call(c) => c.args.iter().collect(),
        StmtKind::Pass => vec![],
    }
}

pub fn stmt_exprs_mut(s: &mut Stmt) -> Vec<&mut Expr> {
    match &mut s.kind {
        StmtKind::For(l) => vec![&mut l.lo, &mut l.hi],
        StmtKind::If(i) => vec![&mut i.cond],
        StmtKind::Alloc(a) => a.decl.shape.iter_mut().collect(),
        StmtKind::Assign(st) | StmtKind::Reduce(st) => st
            .lhs
            .idx
            .iter_mut()
            .chain(std::iter::once(&mut st.rhs))
            .collect(),
        StmtKind::Call(c) => c.args.iter_mut().collect(),
        StmtKind::Pass => vec![],
    }
}

/// Apply `f` to every expression slot of every statement in `stmts`.
pub fn for_each_expr_mut(stmts: &mut [Stmt], f: &mut impl FnMut(&mut Expr)) {
    visit_stmts_mut(stmts, &mut |s| {
        for e in stmt_exprs_mut(s) {
            f(e);
        }
    });
}

// ── Expressions ─────────────────────────────────────────────────────────────

/// Pre-order visit of an expression and its subexpressions.
pub fn walk_expr<'a>(e: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(e);
    match e {
        Expr::Int(_) | Expr::Var(_) => {}
        Expr::Read(a) => a.idx.iter().for_each(|i| walk_expr(i, f)),
        Expr::Window(w) => {
            for d in &w.dims {
                match d {
                    WindowDim::Point(p) => walk_expr(p, f),
                    WindowDim::Interval(lo, hi) => {
                        walk_expr(lo, f);
                        walk_expr(hi, f);
                    }
                }
            }
        }
        Expr::Bin(_, l, r) => {
            walk_expr(l, f);
            walk_expr(r, f);
        }
        Expr::Neg(inner) => walk_expr(inner, f),
    }
}

/// Post-order rewrite: children first, then the node itself.
pub fn walk_expr_mut(e: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match e {
        Expr::Int(_) | Expr::Var(_) => {}
        Expr::Read(a) => a.idx.iter_mut().for_each(|i| walk_expr_mut(i, f)),
        Expr::Window(w) => {
            for d in &mut w.dims {
                match d {
                    WindowDim::Point(p) => walk_expr_mut(p, f),
                    WindowDim::Interval(lo, hi) => {
                        walk_expr_mut(lo, f);
                        walk_expr_mut(hi, f);
                    }
                }
            }
        }
        Expr::Bin(_, l, r) => {
            walk_expr_mut(l, f);
            walk_expr_mut(r, f);
        }
        Expr::Neg(inner) => walk_expr_mut(inner, f),
    }
    f(e);
}

// ── Variables ───────────────────────────────────────────────────────────────

/// Variables used by `stmts` and not bound by a loop inside them.
pub fn free_vars(stmts: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_free_vars(stmts, &BTreeSet::new(), &mut out);
    out
}

fn collect_free_vars(stmts: &[Stmt], bound: &BTreeSet<String>, out: &mut BTreeSet<String>) {
    for s in stmts {
        let mut used = BTreeSet::new();
        for e in stmt_exprs(s) {
            e.free_vars(&mut used);
        }
        out.extend(used.into_iter().filter(|v| !bound.contains(v)));
        match &s.kind {
            StmtKind::For(l) => {
                let mut inner = bound.clone();
                inner.insert(l.var.clone());
                collect_free_vars(&l.body, &inner, out);
            }
            StmtKind::If(i) => {
                collect_free_vars(&i.body, bound, out);
                collect_free_vars(&i.orelse, bound, out);
            }
            _ => {}
        }
    }
}

/// Every loop variable bound anywhere inside `stmts`, with its loop.
pub fn bound_loops(stmts: &[Stmt]) -> Vec<&ForLoop> {
    let mut out = Vec::new();
    visit_stmts(stmts, &mut |s| {
        if let StmtKind::For(l) = &s.kind {
            out.push(l);
        }
    });
    out
}

/// Replace free occurrences of `var` in `stmts`; stops at loops rebinding it.
pub fn substitute(stmts: &mut [Stmt], var: &str, with: &Expr) {
    for s in stmts {
        for e in stmt_exprs_mut(s) {
            *e = e.substitute(var, with);
        }
        match &mut s.kind {
            StmtKind::For(l) if l.var == var => {}
            StmtKind::For(l) => substitute(&mut l.body, var, with),
            StmtKind::If(i) => {
                substitute(&mut i.body, var, with);
                substitute(&mut i.orelse, var, with);
            }
            _ => {}
        }
    }
}

/// Rename loop variable `from` to `to` in the loop headers and uses.
pub fn rename_var(stmts: &mut [Stmt], from: &str, to: &str) {
    let with = Expr::var(to);
    substitute(stmts, from, &with);
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Mutable view of one indexed use of a buffer.
pub enum AccessMut<'a> {
    /// Element read or store target.
    Index(&'a mut Vec<Expr>),
    /// Call argument window.
    Window(&'a mut Vec<WindowDim>),
}

/// Apply `f` to every access of buffer `buf` in `stmts`.
pub fn for_each_access_mut(stmts: &mut [Stmt], buf: &str, f: &mut impl FnMut(AccessMut<'_>)) {
    visit_stmts_mut(stmts, &mut |s| {
        if let StmtKind::Assign(st) | StmtKind::Reduce(st) = &mut s.kind {
            if st.lhs.buf == buf {
                f(AccessMut::Index(&mut st.lhs.idx));
            }
        }
        for e in stmt_exprs_mut(s) {
            walk_expr_mut(e, &mut |sub| match sub {
                Expr::Read(a) if a.buf == buf => f(AccessMut::Index(&mut a.idx)),
                Expr::Window(w) if w.buf == buf => f(AccessMut::Window(&mut w.dims)),
                _ => {}
            });
        }
    });
}

/// Rename buffer `from` to `to` in allocations, stores, reads, and windows.
pub fn rename_buffer(stmts: &mut [Stmt], from: &str, to: &str) {
    visit_stmts_mut(stmts, &mut |s| {
        match &mut s.kind {
            StmtKind::Alloc(a) if a.name == from => a.name = to.to_string(),
            StmtKind::Assign(st) | StmtKind::Reduce(st) if st.lhs.buf == from => {
                st.lhs.buf = to.to_string();
            }
            _ => {}
        }
        for e in stmt_exprs_mut(s) {
            walk_expr_mut(e, &mut |sub| match sub {
                Expr::Read(a) if a.buf == from => a.buf = to.to_string(),
                Expr::Window(w) if w.buf == from => w.buf = to.to_string(),
                _ => {}
            });
        }
    });
}

/// Names of every buffer read, written, or passed in `stmts`.
pub fn buffers_used(stmts: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    visit_stmts(stmts, &mut |s| {
        if let StmtKind::Assign(st) | StmtKind::Reduce(st) = &s.kind {
            out.insert(st.lhs.buf.clone());
        }
        for e in stmt_exprs(s) {
            walk_expr(e, &mut |sub| match sub {
                Expr::Read(a) => {
                    out.insert(a.buf.clone());
                }
                Expr::Window(w) => {
                    out.insert(w.buf.clone());
                }
                _ => {}
            });
        }
    });
    out
}

pub fn uses_buffer(stmts: &[Stmt], buf: &str) -> bool {
    buffers_used(stmts).contains(buf)
}

/// Every name a procedure body binds: loop variables and allocations.
pub fn bound_names(stmts: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    visit_stmts(stmts, &mut |s| match &s.kind {
        StmtKind::For(l) => {
            out.insert(l.var.clone());
        }
        StmtKind::Alloc(a) => {
            out.insert(a.name.clone());
        }
        _ => {}
    });
    out
}

// ── Ids ─────────────────────────────────────────────────────────────────────

/// Give every statement in `stmts` a fresh id. Used for copies.
pub fn renumber(stmts: &mut [Stmt], ids: &mut NodeIdAllocator) {
    visit_stmts_mut(stmts, &mut |s| s.id = ids.alloc());
}
