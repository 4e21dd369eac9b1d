// stage.rs — Staging a buffer region through a local buffer
//
// `stage_mem` finds the rectangular region of a buffer that a block of
// statements touches, allocates a buffer of that shape right before the
// block, copies the region in (when the block reads it) and back out (when
// the block writes it), and points the block's accesses at the new buffer.
//
// Preconditions: every index of the staged buffer in the block is affine,
//                with the part that does not depend on loops inside the
//                block identical across accesses.
// Postconditions: order is alloc, load nest, block, store nest. Dimensions
//                 the block touches at a single point are dropped from the
//                 new buffer.
// Failure modes: `NotApplicable` for non-affine or misaligned accesses,
//                symbolic inner loop bounds, window arguments, and name
//                clashes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::affine::Affine;
use crate::ast::*;
use crate::cursor::Cursor;
use crate::error::{EditError, EditResult};
use crate::memory::Memory;
use crate::proc::Proc;
use crate::simplify::simplify_expr;
use crate::walk::{self, AccessMut};

const OP: &str = "stage_mem";

/// Cursors into the version produced by `stage_mem`.
#[derive(Debug, Clone)]
pub struct StageCursors {
    pub alloc: Cursor,
    pub load: Option<Cursor>,
    /// The staged statements, with the same shape as the input cursor.
    pub block: Cursor,
    pub store: Option<Cursor>,
}

/// Extent of the staged region along one buffer dimension.
#[derive(Debug, Clone)]
struct DimWindow {
    /// Index part that does not depend on loops inside the block.
    outer: Affine,
    min: i64,
    max: i64,
}

impl DimWindow {
    fn extent(&self) -> i64 {
        self.max - self.min + 1
    }

    fn base(&self) -> Affine {
        self.outer.add(&Affine::constant(self.min))
    }
}

pub fn stage_mem(
    p: &Proc,
    block: &Cursor,
    buf: &str,
    new_name: &str,
) -> EditResult<(Proc, StageCursors)> {
    p.check(block)?;
    let Some((siblings, lo, hi)) = block.block_range() else {
        return Err(EditError::mismatch(OP, "expected a statement or block cursor"));
    };
    let stmts = &siblings[lo..=hi];
    let decl = buffer_decl(p.def(), buf)
        .ok_or_else(|| EditError::mismatch(OP, format!("unknown buffer `{buf}`")))?;
    let taken = names_in_use(p.def());
    if taken.contains(new_name) {
        return Err(EditError::not_applicable(OP, format!("name `{new_name}` is already in use")));
    }

    let ranges = inner_ranges(stmts);
    let windows = region(stmts, buf, decl.shape.len(), &ranges)?;
    let kept: Vec<usize> = (0..windows.len())
        .filter(|&d| windows[d].extent() > 1)
        .collect();

    let fx = modes(stmts, buf);
    let first_assigns = matches!(
        &stmts[0].kind,
        StmtKind::Assign(st) if st.lhs.buf == buf
    );
    let needs_load = (fx.read || fx.reduced) && !(first_assigns && kept.is_empty());
    let needs_store = fx.written || fx.reduced;

    let vars = fresh_vars(&taken, kept.len());
    let tile_idx: Vec<Expr> = vars.iter().map(|v| Expr::var(v.as_str())).collect();
    let src_idx: Vec<Expr> = windows
        .iter()
        .enumerate()
        .map(|(d, w)| {
            let mut a = w.base();
            if let Some(k) = kept.iter().position(|&kd| kd == d) {
                a = a.add(&Affine::var(&vars[k]));
            }
            simplify_expr(&a.to_expr())
        })
        .collect();
    let extents: Vec<i64> = kept.iter().map(|&d| windows[d].extent()).collect();

    let anchor = p
        .path(block.loc().anchor())
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    let mut ed = p.editor();

    let alloc = Stmt::new(
        ed.fresh_id(),
        StmtKind::Alloc(Alloc {
            name: new_name.to_string(),
            decl: BufferDecl {
                ty: decl.ty,
                shape: extents.iter().map(|&e| Expr::Int(e)).collect(),
                mem: Memory::Dram,
            },
        }),
    );
    let load = needs_load.then(|| {
        let copy = Store {
            lhs: Access {
                buf: new_name.to_string(),
                idx: tile_idx.clone(),
            },
            rhs: Expr::read(buf, src_idx.clone()),
        };
        copy_nest(&mut ed, &vars, &extents, copy)
    });
    let store = needs_store.then(|| {
        let copy = Store {
            lhs: Access {
                buf: buf.to_string(),
                idx: src_idx.clone(),
            },
            rhs: Expr::read(new_name, tile_idx.clone()),
        };
        copy_nest(&mut ed, &vars, &extents, copy)
    });
    let (alloc_id, load_id, store_id) = (alloc.id, load.as_ref().map(|s| s.id), store.as_ref().map(|s| s.id));

    let block_stmts = ed.block_mut(anchor)?;
    let staged = &mut block_stmts[lo..=hi];
    walk::for_each_access_mut(staged, buf, &mut |acc| {
        if let AccessMut::Index(idx) = acc {
            *idx = kept
                .iter()
                .map(|&d| {
                    let w = &windows[d];
                    match Affine::from_expr(&idx[d]) {
                        Some(a) => a.add(&w.outer.scale(-1)).add(&Affine::constant(-w.min)).to_expr(),
                        None => idx[d].clone(),
                    }
                })
                .collect();
        }
    });
    walk::rename_buffer(staged, buf, new_name);
    if let Some(s) = store {
        block_stmts.insert(hi + 1, s);
    }
    if let Some(s) = load {
        block_stmts.insert(lo, s);
    }
    block_stmts.insert(lo, alloc);

    let q = ed.finish();
    debug!(
        op = OP,
        buf,
        new_name,
        shape = ?extents,
        load = needs_load,
        store = needs_store,
        "staged buffer"
    );
    let cursors = StageCursors {
        alloc: q.cursor(crate::cursor::Loc::Node(alloc_id)),
        load: load_id.map(|id| q.cursor(crate::cursor::Loc::Node(id))),
        block: q.cursor(*block.loc()),
        store: store_id.map(|id| q.cursor(crate::cursor::Loc::Node(id))),
    };
    Ok((q, cursors))
}

/// Declaration of a parameter or allocated buffer called `name`.
fn buffer_decl<'a>(def: &'a ProcDef, name: &str) -> Option<&'a BufferDecl> {
    let param = def.params.iter().find_map(|q| match &q.kind {
        ParamKind::Buffer(d) if q.name == name => Some(d),
        _ => None,
    });
    param.or_else(|| {
        let mut found = None;
        walk::visit_stmts(&def.body, &mut |s| {
            if let StmtKind::Alloc(a) = &s.kind {
                if found.is_none() && a.name == name {
                    found = Some(&a.decl);
                }
            }
        });
        found
    })
}

fn names_in_use(def: &ProcDef) -> BTreeSet<String> {
    let mut names = walk::bound_names(&def.body);
    names.extend(walk::free_vars(&def.body));
    names.extend(def.params.iter().map(|q| q.name.clone()));
    names
}

/// `i0`, `i1`, ... skipping names already in use.
fn fresh_vars(taken: &BTreeSet<String>, count: usize) -> Vec<String> {
    (0..)
        .map(|k| format!("i{k}"))
        .filter(|n| !taken.contains(n))
        .take(count)
        .collect()
}

/// Literal `[lo, hi)` of every loop variable bound inside `stmts`; `None`
/// for symbolic bounds. Rebound names take the union of their ranges.
fn inner_ranges(stmts: &[Stmt]) -> BTreeMap<String, Option<(i64, i64)>> {
    let mut out: BTreeMap<String, Option<(i64, i64)>> = BTreeMap::new();
    for l in walk::bound_loops(stmts) {
        let range = l.lo.as_int().zip(l.hi.as_int());
        let merged = match (out.get(&l.var), range) {
            (None, r) => r,
            (Some(Some((a, b))), Some((c, d))) => Some(((*a).min(c), (*b).max(d))),
            _ => None,
        };
        out.insert(l.var.clone(), merged);
    }
    out
}

/// Per-dimension window of `buf` touched by `stmts`.
fn region(
    stmts: &[Stmt],
    buf: &str,
    rank: usize,
    ranges: &BTreeMap<String, Option<(i64, i64)>>,
) -> EditResult<Vec<DimWindow>> {
    let mut accesses: Vec<Vec<Expr>> = Vec::new();
    let mut windowed = false;
    walk::visit_stmts(stmts, &mut |s| {
        if let StmtKind::Assign(st) | StmtKind::Reduce(st) = &s.kind {
            if st.lhs.buf == buf {
                accesses.push(st.lhs.idx.clone());
            }
        }
        for e in walk::stmt_exprs(s) {
            walk::walk_expr(e, &mut |sub| match sub {
                Expr::Read(a) if a.buf == buf => accesses.push(a.idx.clone()),
                Expr::Window(w) if w.buf == buf => windowed = true,
                _ => {}
            });
        }
    });
    if windowed {
        return Err(EditError::not_applicable(
            OP,
            format!("`{buf}` is passed to an instruction inside the block"),
        ));
    }
    if accesses.is_empty() {
        return Err(EditError::not_applicable(OP, format!("block does not use `{buf}`")));
    }

    let mut windows: Vec<Option<DimWindow>> = vec![None; rank];
    for idx in &accesses {
        if idx.len() != rank {
            return Err(EditError::mismatch(
                OP,
                format!("`{buf}` indexed with {} of {rank} dimensions", idx.len()),
            ));
        }
        for (d, e) in idx.iter().enumerate() {
            let a = Affine::from_expr(e).ok_or_else(|| {
                EditError::not_applicable(OP, format!("index `{e}` of `{buf}` is not affine"))
            })?;
            let (inner, outer) = a.split(|v| ranges.contains_key(v));
            let (mut min, mut max) = (0, 0);
            for (v, c) in &inner.terms {
                let Some(Some((lo, hi))) = ranges.get(v) else {
                    return Err(EditError::not_applicable(
                        OP,
                        format!("loop `{v}` has symbolic bounds"),
                    ));
                };
                let (x, y) = (c * lo, c * (hi - 1));
                min += x.min(y);
                max += x.max(y);
            }
            windows[d] = Some(match windows[d].take() {
                None => DimWindow { outer, min, max },
                Some(w) if w.outer == outer => DimWindow {
                    outer,
                    min: w.min.min(min),
                    max: w.max.max(max),
                },
                Some(_) => {
                    return Err(EditError::not_applicable(
                        OP,
                        format!("accesses to `{buf}` are not aligned in dimension {d}"),
                    ))
                }
            });
        }
    }
    Ok(windows.into_iter().flatten().collect())
}

#[derive(Default)]
struct Modes {
    read: bool,
    written: bool,
    reduced: bool,
}

fn modes(stmts: &[Stmt], buf: &str) -> Modes {
    let mut m = Modes::default();
    walk::visit_stmts(stmts, &mut |s| {
        match &s.kind {
            StmtKind::Assign(st) if st.lhs.buf == buf => m.written = true,
            StmtKind::Reduce(st) if st.lhs.buf == buf => m.reduced = true,
            _ => {}
        }
        for e in walk::stmt_exprs(s) {
            walk::walk_expr(e, &mut |sub| {
                if matches!(sub, Expr::Read(a) if a.buf == buf) {
                    m.read = true;
                }
            });
        }
    });
    m
}

/// `for v0 { for v1 { ... copy } }` with fresh ids, outermost first.
fn copy_nest(
    ed: &mut crate::proc::Editor<'_>,
    vars: &[String],
    extents: &[i64],
    copy: Store,
) -> Stmt {
    let mut stmt = Stmt::new(ed.fresh_id(), StmtKind::Assign(copy));
    for (v, &e) in vars.iter().zip(extents).rev() {
        stmt = Stmt::new(
            ed.fresh_id(),
            StmtKind::For(ForLoop {
                var: v.clone(),
                lo: Expr::Int(0),
                hi: Expr::Int(e),
                body: vec![stmt],
            }),
        );
    }
    stmt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_read_only_window() {
        let p = Proc::parse(
            "proc f(a: i32[8, 8] @ DRAM, o: i32[8] @ DRAM) {
                for i in seq(0, 2) {
                    for j in seq(0, 4) { o[j + 4 * i] += a[i, j + 4 * i]; }
                }
            }",
        )
        .unwrap();
        let j = p.find_loop("j").unwrap();
        let (q, cur) = stage_mem(&p, &j, "a", "a_tile").unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f(a: i32[8, 8] @ DRAM, o: i32[8] @ DRAM) {
            for i in seq(0, 2) {
                a_tile: i32[4] @ DRAM;
                for i0 in seq(0, 4) {
                    a_tile[i0] = a[i, i0 + 4 * i];
                }
                for j in seq(0, 4) {
                    o[j + 4 * i] += a_tile[j];
                }
            }
        }
        ");
        assert!(cur.load.is_some());
        assert!(cur.store.is_none());
        assert_eq!(cur.block, q.forward(&j).unwrap());
        assert_eq!(cur.alloc, q.find_alloc("a_tile").unwrap());
    }

    #[test]
    fn stage_accumulator_to_scalar() {
        let p = Proc::parse(
            "proc f(o: i32[4] @ DRAM, d: i32[4] @ DRAM) {
                for i in seq(0, 4) {
                    o[i] = 0;
                    for k in seq(0, 4) { o[i] += d[k]; }
                }
            }",
        )
        .unwrap();
        let block = p.find_loop("k").unwrap().expand(1, 0).unwrap();
        let (q, cur) = stage_mem(&p, &block, "o", "acc").unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f(o: i32[4] @ DRAM, d: i32[4] @ DRAM) {
            for i in seq(0, 4) {
                acc: i32 @ DRAM;
                acc = 0;
                for k in seq(0, 4) {
                    acc += d[k];
                }
                o[i] = acc;
            }
        }
        ");
        assert!(cur.load.is_none());
        assert_eq!(cur.block.stmts().len(), 2);
        assert_eq!(cur.store.unwrap().stmt().unwrap().describe(), "store to `o`");
    }

    #[test]
    fn stage_rejects_misaligned_accesses() {
        let p = Proc::parse(
            "proc f(o: i32[8] @ DRAM) {
                for i in seq(0, 4) { o[i] = o[2 * i]; }
            }",
        )
        .unwrap();
        let i = p.find_loop("i").unwrap();
        let body = &i.body()[0];
        assert!(stage_mem(&p, body, "o", "t").unwrap_err().is_not_applicable());
        assert!(stage_mem(&p, &i, "o", "o").unwrap_err().is_not_applicable());
    }
}
