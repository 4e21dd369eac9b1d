// alloc.rs — Allocation edits
//
// Reshape, relocate, retarget, and merge buffer allocations. The scope of
// an allocation is the rest of its block, and every rewrite here touches
// only that scope.
//
// Preconditions: allocation names are unique within a procedure.
// Failure modes: `NotApplicable` when a use would become unbound, a name
//                would clash, or an index is not a literal where one is
//                needed.

use std::collections::BTreeSet;

use tracing::debug;

use crate::ast::*;
use crate::cursor::Cursor;
use crate::edit::node_at;
use crate::error::{EditError, EditResult};
use crate::memory::Memory;
use crate::proc::{Proc, Step};
use crate::walk::{self, AccessMut};

fn alloc_at<'a>(
    p: &'a Proc,
    c: &Cursor,
    op: &'static str,
) -> EditResult<(&'a Stmt, &'a Alloc, &'a [Step])> {
    let (stmt, path) = node_at(p, c, op)?;
    match &stmt.kind {
        StmtKind::Alloc(a) => Ok((stmt, a, path)),
        _ => Err(EditError::mismatch(
            op,
            format!("expected an allocation, found {}", stmt.describe()),
        )),
    }
}

fn index_of(path: &[Step]) -> usize {
    path[path.len() - 1].index
}

fn siblings<'a>(p: &'a Proc, path: &[Step], op: &'static str) -> EditResult<&'a [Stmt]> {
    p.block_containing(path)
        .map(Vec::as_slice)
        .ok_or_else(|| EditError::mismatch(op, "cursor does not resolve"))
}

/// Loop variables of the loops enclosing the statement at `path`.
fn enclosing_vars(p: &Proc, path: &[Step]) -> BTreeSet<String> {
    (1..path.len())
        .filter_map(|k| p.stmt_at(&path[..k]))
        .filter_map(Stmt::as_loop)
        .map(|l| l.var.clone())
        .collect()
}

fn size_params(def: &ProcDef) -> BTreeSet<String> {
    def.params
        .iter()
        .filter(|q| matches!(q.kind, ParamKind::Size))
        .map(|q| q.name.clone())
        .collect()
}

/// `s` itself (not its nested statements) refers to `buf`.
fn refers_to(s: &Stmt, buf: &str) -> bool {
    if let StmtKind::Assign(st) | StmtKind::Reduce(st) = &s.kind {
        if st.lhs.buf == buf {
            return true;
        }
    }
    let mut found = false;
    for e in walk::stmt_exprs(s) {
        walk::walk_expr(e, &mut |sub| match sub {
            Expr::Read(a) if a.buf == buf => found = true,
            Expr::Window(w) if w.buf == buf => found = true,
            _ => {}
        });
    }
    found
}

/// First variable of `need` that is not bound at some use of `buf`.
fn unbound_at_use(
    stmts: &[Stmt],
    buf: &str,
    need: &BTreeSet<String>,
    bound: &mut Vec<String>,
) -> Option<String> {
    for s in stmts {
        if refers_to(s, buf) {
            if let Some(v) = need.iter().find(|v| !bound.contains(v)) {
                return Some(v.clone());
            }
        }
        let missing = match &s.kind {
            StmtKind::For(l) => {
                bound.push(l.var.clone());
                let r = unbound_at_use(&l.body, buf, need, bound);
                bound.pop();
                r
            }
            StmtKind::If(i) => unbound_at_use(&i.body, buf, need, bound)
                .or_else(|| unbound_at_use(&i.orelse, buf, need, bound)),
            _ => None,
        };
        if missing.is_some() {
            return missing;
        }
    }
    None
}

// ── Reshaping ───────────────────────────────────────────────────────────────

/// Give an allocation a new leading dimension of size `extent`, indexed by
/// `index` at every use.
pub fn expand_dim(p: &Proc, alloc: &Cursor, extent: Expr, index: Expr) -> EditResult<Proc> {
    const OP: &str = "expand_dim";
    let (_, a, path) = alloc_at(p, alloc, OP)?;
    let sizes = size_params(p.def());
    let mut extent_vars = BTreeSet::new();
    extent.free_vars(&mut extent_vars);
    if let Some(v) = extent_vars.iter().find(|v| !sizes.contains(*v)) {
        return Err(EditError::not_applicable(
            OP,
            format!("extent refers to `{v}`, which is not a size parameter"),
        ));
    }
    let mut need = BTreeSet::new();
    index.free_vars(&mut need);
    let outer = enclosing_vars(p, path);
    need.retain(|v| !sizes.contains(v) && !outer.contains(v));
    let at = index_of(path);
    let scope = &siblings(p, path, OP)?[at + 1..];
    if let Some(v) = unbound_at_use(scope, &a.name, &need, &mut Vec::new()) {
        return Err(EditError::not_applicable(
            OP,
            format!("`{v}` is not bound at every use of `{}`", a.name),
        ));
    }

    let name = a.name.clone();
    let old_shape = a.decl.shape.clone();
    let mut ed = p.editor();
    let block = ed.block_mut(path)?;
    if let StmtKind::Alloc(a) = &mut block[at].kind {
        a.decl.shape.insert(0, extent.clone());
    }
    walk::for_each_access_mut(&mut block[at + 1..], &name, &mut |acc| match acc {
        AccessMut::Index(idx) => idx.insert(0, index.clone()),
        AccessMut::Window(dims) => {
            if dims.is_empty() {
                dims.extend(
                    old_shape
                        .iter()
                        .map(|e| WindowDim::Interval(Expr::Int(0), e.clone())),
                );
            }
            dims.insert(0, WindowDim::Point(index.clone()));
        }
    });
    debug!(op = OP, buf = %name, %extent, %index, "expanded allocation");
    Ok(ed.finish())
}

/// Move an allocation out of its enclosing statement, to just before it.
pub fn lift_alloc(p: &Proc, alloc: &Cursor) -> EditResult<Proc> {
    const OP: &str = "lift_alloc";
    let (_, a, path) = alloc_at(p, alloc, OP)?;
    if path.len() == 1 {
        return Err(EditError::not_applicable(OP, "allocation is already at the top level"));
    }
    let outer_path = &path[..path.len() - 1];
    let parent = p
        .stmt_at(outer_path)
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    if let StmtKind::For(l) = &parent.kind {
        if a.decl.shape.iter().any(|e| e.mentions(&l.var)) {
            return Err(EditError::not_applicable(
                OP,
                format!("shape of `{}` depends on `{}`", a.name, l.var),
            ));
        }
    }
    let outer_block = siblings(p, outer_path, OP)?;
    let at = index_of(outer_path);
    let clash = outer_block.iter().filter_map(Stmt::as_alloc).any(|b| b.name == a.name)
        || walk::uses_buffer(&outer_block[at + 1..], &a.name);
    if clash {
        return Err(EditError::not_applicable(
            OP,
            format!("`{}` is already in use in the enclosing block", a.name),
        ));
    }

    let mut ed = p.editor();
    let moved = ed.block_mut(path)?.remove(index_of(path));
    ed.block_mut(outer_path)?.insert(at, moved);
    debug!(op = OP, buf = %a.name, "lifted allocation");
    Ok(ed.finish())
}

pub fn set_memory(p: &Proc, alloc: &Cursor, mem: Memory) -> EditResult<Proc> {
    const OP: &str = "set_memory";
    let (_, _, path) = alloc_at(p, alloc, OP)?;
    let mut ed = p.editor();
    if let StmtKind::Alloc(a) = &mut ed.stmt_mut(path)?.kind {
        a.decl.mem = mem;
    }
    Ok(ed.finish())
}

// ── Splitting and merging ───────────────────────────────────────────────────

/// Split an allocation along dimension `dim` into one allocation per index,
/// named `<name>_<k>`. Every use must index that dimension with a literal.
pub fn unroll_buffer(p: &Proc, alloc: &Cursor, dim: usize) -> EditResult<Proc> {
    const OP: &str = "unroll_buffer";
    let (stmt, a, path) = alloc_at(p, alloc, OP)?;
    let extent = a
        .decl
        .shape
        .get(dim)
        .and_then(Expr::as_int)
        .ok_or_else(|| EditError::not_applicable(OP, format!("dimension {dim} is not a literal")))?;
    let taken = walk::bound_names(&p.def().body);
    let names: Vec<String> = (0..extent).map(|k| format!("{}_{k}", a.name)).collect();
    if let Some(n) = names
        .iter()
        .find(|n| taken.contains(*n) || p.def().params.iter().any(|q| &q.name == *n))
    {
        return Err(EditError::not_applicable(OP, format!("name `{n}` is already in use")));
    }

    let at = index_of(path);
    let mut ed = p.editor();
    let block = ed.block_mut(path)?;
    let mut bad = None;
    retarget(&mut block[at + 1..], &a.name, dim, extent, &mut bad);
    if let Some(reason) = bad {
        return Err(EditError::not_applicable(OP, reason));
    }
    let mut decl = a.decl.clone();
    decl.shape.remove(dim);
    let mut allocs = Vec::with_capacity(names.len());
    for (k, name) in names.into_iter().enumerate() {
        let id = if k == 0 { stmt.id } else { ed.fresh_id() };
        allocs.push(Stmt::new(
            id,
            StmtKind::Alloc(Alloc {
                name,
                decl: decl.clone(),
            }),
        ));
    }
    ed.block_mut(path)?.splice(at..=at, allocs);
    debug!(op = OP, buf = %a.name, dim, extent, "unrolled buffer");
    Ok(ed.finish())
}

/// Point every use of `name` at `<name>_<k>`, where `k` is its literal
/// index in dimension `dim`, and drop that dimension.
fn retarget(stmts: &mut [Stmt], name: &str, dim: usize, extent: i64, bad: &mut Option<String>) {
    let mut split = |buf: &mut String, k: Option<i64>| match k {
        Some(k) if (0..extent).contains(&k) => {
            *buf = format!("{name}_{k}");
            true
        }
        _ => {
            bad.get_or_insert_with(|| {
                format!("`{name}` is indexed by a non-literal in dimension {dim}")
            });
            false
        }
    };
    walk::visit_stmts_mut(stmts, &mut |s| {
        if let StmtKind::Assign(st) | StmtKind::Reduce(st) = &mut s.kind {
            if st.lhs.buf == name {
                let k = st.lhs.idx.get(dim).and_then(Expr::as_int);
                if split(&mut st.lhs.buf, k) {
                    st.lhs.idx.remove(dim);
                }
            }
        }
        for e in walk::stmt_exprs_mut(s) {
            walk::walk_expr_mut(e, &mut |sub| match sub {
                Expr::Read(a) if a.buf == name => {
                    let k = a.idx.get(dim).and_then(Expr::as_int);
                    if split(&mut a.buf, k) {
                        a.idx.remove(dim);
                    }
                }
                Expr::Window(w) if w.buf == name => {
                    let k = match w.dims.get(dim) {
                        Some(WindowDim::Point(e)) => e.as_int(),
                        _ => None,
                    };
                    if split(&mut w.buf, k) {
                        w.dims.remove(dim);
                    }
                }
                _ => {}
            });
        }
    });
}

/// Let `drop` share `keep`'s storage: both allocations live in the same
/// block with identical declarations, and `keep` is dead by the time `drop`
/// is first used. `drop`'s allocation is removed and its uses renamed.
pub fn reuse_buffer(p: &Proc, keep: &Cursor, drop: &Cursor) -> EditResult<Proc> {
    const OP: &str = "reuse_buffer";
    let (_, ka, kpath) = alloc_at(p, keep, OP)?;
    let (_, da, dpath) = alloc_at(p, drop, OP)?;
    let same_block = kpath.len() == dpath.len()
        && kpath[..kpath.len() - 1] == dpath[..dpath.len() - 1]
        && kpath[kpath.len() - 1].branch == dpath[dpath.len() - 1].branch;
    if !same_block || index_of(kpath) >= index_of(dpath) {
        return Err(EditError::not_applicable(
            OP,
            format!("`{}` must be allocated before `{}` in the same block", ka.name, da.name),
        ));
    }
    if ka.decl != da.decl {
        return Err(EditError::not_applicable(
            OP,
            format!("`{}` and `{}` have different declarations", ka.name, da.name),
        ));
    }
    let at = index_of(dpath);
    let after = &siblings(p, dpath, OP)?[at + 1..];
    let first_use = after
        .iter()
        .position(|s| walk::uses_buffer(std::slice::from_ref(s), &da.name));
    if let Some(f) = first_use {
        if walk::uses_buffer(&after[f..], &ka.name) {
            return Err(EditError::not_applicable(
                OP,
                format!("`{}` is still live where `{}` is first used", ka.name, da.name),
            ));
        }
    }

    let mut ed = p.editor();
    let block = ed.block_mut(dpath)?;
    walk::rename_buffer(&mut block[at + 1..], &da.name, &ka.name);
    block.remove(at);
    debug!(op = OP, keep = %ka.name, drop = %da.name, "merged buffers");
    Ok(ed.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(src: &str) -> Proc {
        Proc::parse(src).unwrap()
    }

    #[test]
    fn expand_scalar_and_lift() {
        let p = proc(
            "proc f(o: i32[4] @ DRAM) {
                for j in seq(0, 4) { t: i32 @ DRAM; t = 1; o[j] = t; }
            }",
        );
        let t = p.find_alloc("t").unwrap();
        let q = expand_dim(&p, &t, Expr::Int(4), Expr::var("j")).unwrap();
        let q = lift_alloc(&q, &q.forward(&t).unwrap()).unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f(o: i32[4] @ DRAM) {
            t: i32[4] @ DRAM;
            for j in seq(0, 4) {
                t[j] = 1;
                o[j] = t[j];
            }
        }
        ");
    }

    #[test]
    fn expand_rejects_unbound_index() {
        let p = proc(
            "proc f(o: i32[4] @ DRAM) {
                t: i32 @ DRAM;
                for j in seq(0, 4) { t = 1; o[j] = t; }
            }",
        );
        let t = p.find_alloc("t").unwrap();
        assert!(expand_dim(&p, &t, Expr::Int(4), Expr::var("j")).is_ok());
        let q = proc(
            "proc f(o: i32[4] @ DRAM) {
                t: i32 @ DRAM;
                t = 0;
                for j in seq(0, 4) { o[j] = t; }
            }",
        );
        let t = q.find_alloc("t").unwrap();
        assert!(expand_dim(&q, &t, Expr::Int(4), Expr::var("j"))
            .unwrap_err()
            .is_not_applicable());
    }

    #[test]
    fn lift_alloc_respects_shape_and_top_level() {
        let p = proc(
            "proc f(n: size) {
                for i in seq(0, n) { t: i32[i] @ DRAM; pass; }
                u: i32 @ DRAM;
            }",
        );
        let t = p.find_alloc("t").unwrap();
        assert!(lift_alloc(&p, &t).unwrap_err().is_not_applicable());
        let u = p.find_alloc("u").unwrap();
        assert!(lift_alloc(&p, &u).unwrap_err().is_not_applicable());
    }

    #[test]
    fn set_memory_rejects_non_allocations() {
        let p = proc("proc f() { t: i32 @ DRAM; pass; }");
        let q = set_memory(&p, &p.find_alloc("t").unwrap(), Memory::RvmTile).unwrap();
        assert!(q.to_string().contains("t: i32 @ RVM_TILE;"));
        assert!(matches!(
            set_memory(&p, &p.body()[1], Memory::Dram),
            Err(EditError::StructuralMismatch { .. })
        ));
    }

    #[test]
    fn unroll_buffer_by_literal_index() {
        let p = proc(
            "proc f(o: i32[2] @ DRAM) {
                t: i32[2, 4] @ DRAM;
                t[0, 1] = 5;
                t[1, 1] = 6;
                o[0] = t[0, 1] + t[1, 1];
            }",
        );
        let t = p.find_alloc("t").unwrap();
        let q = unroll_buffer(&p, &t, 0).unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f(o: i32[2] @ DRAM) {
            t_0: i32[4] @ DRAM;
            t_1: i32[4] @ DRAM;
            t_0[1] = 5;
            t_1[1] = 6;
            o[0] = t_0[1] + t_1[1];
        }
        ");
        assert_eq!(q.forward(&t).unwrap(), q.find_alloc("t_0").unwrap());
    }

    #[test]
    fn unroll_buffer_needs_literal_indices() {
        let p = proc(
            "proc f() {
                t: i32[2] @ DRAM;
                for i in seq(0, 2) { t[i] = 0; }
            }",
        );
        let t = p.find_alloc("t").unwrap();
        assert!(unroll_buffer(&p, &t, 0).unwrap_err().is_not_applicable());
    }

    #[test]
    fn reuse_dead_buffer() {
        let p = proc(
            "proc f(o: i32 @ DRAM) {
                a: i32 @ DRAM;
                b: i32 @ DRAM;
                a = 1;
                o = a;
                b = 2;
                o = b;
            }",
        );
        let (a, b) = (p.find_alloc("a").unwrap(), p.find_alloc("b").unwrap());
        let q = reuse_buffer(&p, &a, &b).unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f(o: i32 @ DRAM) {
            a: i32 @ DRAM;
            a = 1;
            o = a;
            a = 2;
            o = a;
        }
        ");
    }

    #[test]
    fn reuse_rejects_live_buffer() {
        let p = proc(
            "proc f(o: i32 @ DRAM) {
                a: i32 @ DRAM;
                b: i32 @ DRAM;
                a = 1;
                b = 2;
                o = a + b;
            }",
        );
        let (a, b) = (p.find_alloc("a").unwrap(), p.find_alloc("b").unwrap());
        assert!(reuse_buffer(&p, &a, &b).unwrap_err().is_not_applicable());
    }
}
