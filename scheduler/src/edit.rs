// edit.rs — Primitive statement edits
//
// Each edit takes a version and cursors captured in exactly that version
// and returns the successor version. A precondition that does not hold is
// reported as `NotApplicable` and leaves nothing behind; a cursor to the
// wrong kind of node is a `StructuralMismatch`.
//
// Id policy: a statement that is moved or rewritten in place keeps its id;
// a header duplicated by a split or copy gets a fresh id on the copy, so
// forwarding a cursor to the original lands on the first half.

use tracing::debug;

use crate::ast::*;
use crate::cursor::{Cursor, Loc, Side};
use crate::deps;
use crate::error::{EditError, EditResult};
use crate::proc::{Proc, Step};
use crate::simplify::simplify_stmts;
use crate::walk;

// ── Resolution helpers ──────────────────────────────────────────────────────

/// Statement under a node cursor, with its path.
pub(crate) fn node_at<'a>(
    p: &'a Proc,
    c: &Cursor,
    op: &'static str,
) -> EditResult<(&'a Stmt, &'a [Step])> {
    p.check(c)?;
    let Loc::Node(id) = *c.loc() else {
        return Err(EditError::mismatch(op, "expected a statement cursor"));
    };
    let path = p
        .path(id)
        .ok_or_else(|| EditError::mismatch(op, "cursor does not resolve"))?;
    let stmt = p
        .stmt_at(path)
        .ok_or_else(|| EditError::mismatch(op, "cursor does not resolve"))?;
    Ok((stmt, path))
}

pub(crate) fn loop_at<'a>(
    p: &'a Proc,
    c: &Cursor,
    op: &'static str,
) -> EditResult<(&'a Stmt, &'a ForLoop, &'a [Step])> {
    let (stmt, path) = node_at(p, c, op)?;
    match &stmt.kind {
        StmtKind::For(l) => Ok((stmt, l, path)),
        _ => Err(EditError::mismatch(
            op,
            format!("expected a loop, found {}", stmt.describe()),
        )),
    }
}

fn index_of(path: &[Step]) -> usize {
    path[path.len() - 1].index
}

fn parent_path(path: &[Step]) -> &[Step] {
    &path[..path.len() - 1]
}

// ── Fusion ──────────────────────────────────────────────────────────────────

/// Append the body of `second` to `first`, under `first`'s variable.
/// The loops must be adjacent siblings with identical bounds.
pub fn fuse(p: &Proc, first: &Cursor, second: &Cursor) -> EditResult<Proc> {
    const OP: &str = "fuse";
    let (_, a, a_path) = loop_at(p, first, OP)?;
    let (_, b, b_path) = loop_at(p, second, OP)?;
    let adjacent = a_path.len() == b_path.len()
        && parent_path(a_path) == parent_path(b_path)
        && a_path[a_path.len() - 1].branch == b_path[b_path.len() - 1].branch
        && index_of(b_path) == index_of(a_path) + 1;
    if !adjacent {
        return Err(EditError::not_applicable(OP, "loops are not adjacent siblings"));
    }
    if a.lo != b.lo || a.hi != b.hi {
        return Err(EditError::not_applicable(
            OP,
            format!(
                "bounds differ: seq({}, {}) vs seq({}, {})",
                a.lo, a.hi, b.lo, b.hi
            ),
        ));
    }
    let mut tail = b.body.clone();
    if a.var != b.var {
        if walk::free_vars(&b.body).contains(&a.var) || walk::bound_names(&b.body).contains(&a.var)
        {
            return Err(EditError::not_applicable(
                OP,
                format!("`{}` is already used in the second loop", a.var),
            ));
        }
        walk::rename_var(&mut tail, &b.var, &a.var);
    }
    deps::fission_legal(&a.var, &a.body, &tail).map_err(|r| EditError::not_applicable(OP, r))?;

    let var = a.var.clone();
    let mut ed = p.editor();
    let block = ed.block_mut(a_path)?;
    block.remove(index_of(b_path));
    if let StmtKind::For(l) = &mut block[index_of(a_path)].kind {
        l.body.extend(tail);
    }
    debug!(op = OP, var = %var, "fused loops");
    Ok(ed.finish())
}

// ── Reordering ──────────────────────────────────────────────────────────────

/// Move the first statement of a block cursor after the rest of the block.
/// On a two-statement block this swaps the pair.
pub fn reorder_stmts(p: &Proc, block: &Cursor) -> EditResult<Proc> {
    const OP: &str = "reorder_stmts";
    p.check(block)?;
    let Some((siblings, lo, hi)) = block.block_range() else {
        return Err(EditError::mismatch(OP, "expected a statement block"));
    };
    if hi == lo {
        return Err(EditError::mismatch(OP, "block must hold at least two statements"));
    }
    deps::commutes(&siblings[lo..=lo], &siblings[lo + 1..=hi])
        .map_err(|r| EditError::not_applicable(OP, r))?;
    let anchor = p
        .path(block.loc().anchor())
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    let mut ed = p.editor();
    let stmts = ed.block_mut(anchor)?;
    let moved = stmts.remove(lo);
    stmts.insert(hi, moved);
    debug!(op = OP, from = lo, to = hi, "reordered statements");
    Ok(ed.finish())
}

// ── Fission ─────────────────────────────────────────────────────────────────

/// Split the loop or `if` enclosing a gap into two copies, one holding the
/// statements before the gap and one holding those after it.
pub fn fission(p: &Proc, gap: &Cursor) -> EditResult<Proc> {
    const OP: &str = "fission";
    p.check(gap)?;
    let Loc::Gap(id, side) = *gap.loc() else {
        return Err(EditError::mismatch(OP, "expected a gap cursor"));
    };
    let path = p
        .path(id)
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    if path.len() == 1 {
        return Err(EditError::not_applicable(OP, "gap is at the top level"));
    }
    if path[path.len() - 1].branch == Branch::OrElse {
        return Err(EditError::not_applicable(OP, "cannot split an else branch"));
    }
    let outer_path = parent_path(path);
    let parent = p
        .stmt_at(outer_path)
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    let split = index_of(path) + usize::from(side == Side::After);
    let body = parent.block(Branch::Body).map(Vec::as_slice).unwrap_or_default();
    if split == 0 || split >= body.len() {
        return Err(EditError::not_applicable(OP, "nothing on one side of the gap"));
    }
    let (prefix, suffix) = body.split_at(split);
    match &parent.kind {
        StmtKind::For(l) => deps::fission_legal(&l.var, prefix, suffix),
        StmtKind::If(i) if i.orelse.is_empty() => deps::guard_split_legal(&i.cond, prefix, suffix),
        StmtKind::If(_) => Err("conditional has an else branch".to_string()),
        _ => Err(format!("cannot split a {}", parent.describe())),
    }
    .map_err(|r| EditError::not_applicable(OP, r))?;

    let mut ed = p.editor();
    let fresh = ed.fresh_id();
    let first = ed.stmt_mut(outer_path)?;
    let tail = match first.block_mut(Branch::Body) {
        Some(b) => b.split_off(split),
        None => return Err(EditError::mismatch(OP, "parent has no body")),
    };
    let second_kind = match &first.kind {
        StmtKind::For(l) => StmtKind::For(ForLoop {
            var: l.var.clone(),
            lo: l.lo.clone(),
            hi: l.hi.clone(),
            body: tail,
        }),
        StmtKind::If(i) => StmtKind::If(IfStmt {
            cond: i.cond.clone(),
            body: tail,
            orelse: Vec::new(),
        }),
        _ => return Err(EditError::mismatch(OP, "parent is not a loop or conditional")),
    };
    let at = index_of(outer_path) + 1;
    ed.block_mut(outer_path)?
        .insert(at, Stmt::new(fresh, second_kind));
    debug!(op = OP, at = split, "split block");
    Ok(ed.finish())
}

// ── Scope lifting ───────────────────────────────────────────────────────────

/// Swap a statement with its enclosing loop or `if`. The statement must be
/// the only one in its parent's body; it keeps its id and becomes the outer
/// node.
pub fn lift_scope(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    const OP: &str = "lift_scope";
    let (stmt, path) = node_at(p, c, OP)?;
    if path.len() == 1 {
        return Err(EditError::not_applicable(OP, "statement is already at the top level"));
    }
    if path[path.len() - 1].branch == Branch::OrElse {
        return Err(EditError::not_applicable(OP, "cannot lift out of an else branch"));
    }
    let outer_path = parent_path(path);
    let parent = p
        .stmt_at(outer_path)
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    if parent.block(Branch::Body).map_or(0, Vec::len) != 1 {
        return Err(EditError::not_applicable(
            OP,
            "statement shares its block with other statements",
        ));
    }
    let na = |r: String| EditError::not_applicable(OP, r);

    let mut ed = p.editor();
    let lifted = match (&parent.kind, &stmt.kind) {
        (StmtKind::For(outer), StmtKind::For(inner)) => {
            deps::interchange_legal(outer, inner).map_err(na)?;
            let moved = Stmt::new(
                parent.id,
                StmtKind::For(ForLoop {
                    body: inner.body.clone(),
                    ..outer.clone()
                }),
            );
            Stmt::new(
                stmt.id,
                StmtKind::For(ForLoop {
                    var: inner.var.clone(),
                    lo: inner.lo.clone(),
                    hi: inner.hi.clone(),
                    body: vec![moved],
                }),
            )
        }
        (StmtKind::For(outer), StmtKind::If(iff)) => {
            if iff.cond.mentions(&outer.var) {
                return Err(na(format!("condition depends on `{}`", outer.var)));
            }
            deps::guard_stable(&iff.cond, &outer.body).map_err(na)?;
            let then_loop = Stmt::new(
                parent.id,
                StmtKind::For(ForLoop {
                    body: iff.body.clone(),
                    ..outer.clone()
                }),
            );
            let orelse = if iff.orelse.is_empty() {
                Vec::new()
            } else {
                vec![Stmt::new(
                    ed.fresh_id(),
                    StmtKind::For(ForLoop {
                        body: iff.orelse.clone(),
                        ..outer.clone()
                    }),
                )]
            };
            Stmt::new(
                stmt.id,
                StmtKind::If(IfStmt {
                    cond: iff.cond.clone(),
                    body: vec![then_loop],
                    orelse,
                }),
            )
        }
        (StmtKind::If(guard), _) if !guard.orelse.is_empty() => {
            return Err(na("enclosing conditional has an else branch".to_string()));
        }
        (StmtKind::If(guard), StmtKind::For(inner)) => {
            if guard.cond.mentions(&inner.var) {
                return Err(na(format!("condition refers to an outer `{}`", inner.var)));
            }
            deps::guard_stable(&guard.cond, &inner.body).map_err(na)?;
            let moved = Stmt::new(
                parent.id,
                StmtKind::If(IfStmt {
                    cond: guard.cond.clone(),
                    body: inner.body.clone(),
                    orelse: Vec::new(),
                }),
            );
            Stmt::new(
                stmt.id,
                StmtKind::For(ForLoop {
                    body: vec![moved],
                    ..inner.clone()
                }),
            )
        }
        (StmtKind::If(guard), StmtKind::If(iff)) => {
            let then_guard = Stmt::new(
                parent.id,
                StmtKind::If(IfStmt {
                    cond: guard.cond.clone(),
                    body: iff.body.clone(),
                    orelse: Vec::new(),
                }),
            );
            let orelse = if iff.orelse.is_empty() {
                Vec::new()
            } else {
                vec![Stmt::new(
                    ed.fresh_id(),
                    StmtKind::If(IfStmt {
                        cond: guard.cond.clone(),
                        body: iff.orelse.clone(),
                        orelse: Vec::new(),
                    }),
                )]
            };
            Stmt::new(
                stmt.id,
                StmtKind::If(IfStmt {
                    cond: iff.cond.clone(),
                    body: vec![then_guard],
                    orelse,
                }),
            )
        }
        _ => {
            return Err(na(format!(
                "cannot lift a {} out of a {}",
                stmt.describe(),
                parent.describe()
            )))
        }
    };
    *ed.stmt_mut(outer_path)? = lifted;
    debug!(op = OP, stmt = %stmt.describe(), "lifted scope");
    Ok(ed.finish())
}

/// Interchange a loop with the single loop nested directly inside it.
pub fn reorder_loops(p: &Proc, outer: &Cursor) -> EditResult<Proc> {
    const OP: &str = "reorder_loops";
    let (_, l, _) = loop_at(p, outer, OP)?;
    let inner = outer.body();
    match (l.body.len(), inner.first()) {
        (1, Some(c)) if c.is_loop() => lift_scope(p, c),
        _ => Err(EditError::not_applicable(
            OP,
            format!("`{}` is not a perfect two-loop nest", l.var),
        )),
    }
}

// ── Loop removal ────────────────────────────────────────────────────────────

/// Replace a loop whose body is invariant in the loop variable and
/// idempotent by a single copy of that body. A loop with symbolic bounds
/// keeps a guard so the body still runs only when the loop would.
pub fn remove_loop(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    const OP: &str = "remove_loop";
    let (stmt, l, path) = loop_at(p, c, OP)?;
    deps::idempotent_invariant(&l.var, &l.body).map_err(|r| EditError::not_applicable(OP, r))?;
    let siblings = p
        .block_containing(path)
        .ok_or_else(|| EditError::mismatch(OP, "cursor does not resolve"))?;
    for a in l.body.iter().filter_map(Stmt::as_alloc) {
        if siblings.iter().filter_map(Stmt::as_alloc).any(|s| s.name == a.name) {
            return Err(EditError::not_applicable(
                OP,
                format!("`{}` is already allocated in the enclosing block", a.name),
            ));
        }
    }

    let mut ed = p.editor();
    let replacement = match l.trip_count() {
        Some(t) if t >= 1 => l.body.clone(),
        Some(_) => return Err(EditError::not_applicable(OP, "loop never runs")),
        None => vec![Stmt::new(
            ed.fresh_id(),
            StmtKind::If(IfStmt {
                cond: Expr::bin(BinOp::Lt, l.lo.clone(), l.hi.clone()),
                body: l.body.clone(),
                orelse: Vec::new(),
            }),
        )],
    };
    let at = index_of(path);
    ed.block_mut(path)?.splice(at..=at, replacement);
    debug!(op = OP, var = %l.var, id = stmt.id.0, "removed loop");
    Ok(ed.finish())
}

// ── Splitting and tiling ────────────────────────────────────────────────────

/// Split `for i in seq(0, hi)` into `outer`/`inner` loops with
/// `i = factor * outer + inner`. With `perfect`, `hi` must be a literal
/// multiple of `factor`; otherwise a guard handles the remainder.
pub fn divide_loop(
    p: &Proc,
    c: &Cursor,
    factor: i64,
    names: (&str, &str),
    perfect: bool,
) -> EditResult<Proc> {
    const OP: &str = "divide_loop";
    let (stmt, l, path) = loop_at(p, c, OP)?;
    let (outer, inner) = names;
    if factor <= 0 {
        return Err(EditError::not_applicable(OP, "factor must be positive"));
    }
    if l.lo != Expr::Int(0) {
        return Err(EditError::not_applicable(OP, "loop must start at 0"));
    }
    let taken = walk::bound_names(&p.def().body);
    for name in [outer, inner] {
        let clash = taken.contains(name)
            || p.def().params.iter().any(|q| q.name == name)
            || walk::free_vars(&l.body).contains(name);
        if clash {
            return Err(EditError::not_applicable(OP, format!("name `{name}` is already in use")));
        }
    }
    let (outer_hi, guarded) = match l.hi.as_int() {
        Some(n) if n % factor == 0 => (Expr::Int(n / factor), false),
        Some(_) if perfect => {
            return Err(EditError::not_applicable(
                OP,
                format!("{} is not a multiple of {factor}", l.hi),
            ))
        }
        Some(n) => (Expr::Int((n + factor - 1) / factor), true),
        None if perfect => {
            return Err(EditError::not_applicable(
                OP,
                format!("cannot show `{}` is a multiple of {factor}", l.hi),
            ))
        }
        None => (
            crate::simplify::simplify_expr(&Expr::bin(
                BinOp::Div,
                Expr::bin(BinOp::Add, l.hi.clone(), Expr::Int(factor - 1)),
                Expr::Int(factor),
            )),
            true,
        ),
    };

    let index = Expr::bin(
        BinOp::Add,
        Expr::bin(BinOp::Mul, Expr::Int(factor), Expr::var(outer)),
        Expr::var(inner),
    );
    let mut body = l.body.clone();
    walk::substitute(&mut body, &l.var, &index);
    simplify_stmts(&mut body);

    let mut ed = p.editor();
    if guarded {
        body = vec![Stmt::new(
            ed.fresh_id(),
            StmtKind::If(IfStmt {
                cond: crate::simplify::simplify_expr(&Expr::bin(BinOp::Lt, index, l.hi.clone())),
                body,
                orelse: Vec::new(),
            }),
        )];
    }
    let inner_loop = Stmt::new(
        ed.fresh_id(),
        StmtKind::For(ForLoop {
            var: inner.to_string(),
            lo: Expr::Int(0),
            hi: Expr::Int(factor),
            body,
        }),
    );
    let divided = Stmt::new(
        stmt.id,
        StmtKind::For(ForLoop {
            var: outer.to_string(),
            lo: Expr::Int(0),
            hi: outer_hi,
            body: vec![inner_loop],
        }),
    );
    *ed.stmt_mut(path)? = divided;
    debug!(op = OP, var = %l.var, factor, outer, inner, "divided loop");
    Ok(ed.finish())
}

/// Tile a perfect nest: each `(loop, factor)` is divided into `<var>o` and
/// `<var>i`, then the outer loops are lifted above all inner ones. The
/// loops must be given outermost first, each the only statement of the
/// previous one.
pub fn tile_loops(p: &Proc, loops: &[(Cursor, i64)], perfect: bool) -> EditResult<Proc> {
    const OP: &str = "tile_loops";
    for pair in loops.windows(2) {
        let (outer, inner) = (&pair[0].0, &pair[1].0);
        let (_, l, _) = loop_at(p, outer, OP)?;
        loop_at(p, inner, OP)?;
        let body = outer.body();
        if l.body.len() != 1 || body.first() != Some(inner) {
            return Err(EditError::not_applicable(OP, "loops are not perfectly nested"));
        }
    }
    let mut p = p.clone();
    for (c, factor) in loops {
        let c = p.forward(c)?;
        let var = c
            .loop_var()
            .ok_or_else(|| EditError::mismatch(OP, "expected a loop"))?
            .to_string();
        p = divide_loop(
            &p,
            &c,
            *factor,
            (&format!("{var}o"), &format!("{var}i")),
            perfect,
        )?;
    }
    for (k, (c, _)) in loops.iter().enumerate().skip(1) {
        for _ in 0..k {
            let c = p.forward(c)?;
            p = lift_scope(&p, &c)?;
        }
    }
    Ok(p)
}

// ── Unrolling ───────────────────────────────────────────────────────────────

/// Replace a loop with literal bounds by one copy of its body per
/// iteration. The first copy keeps the original statement ids.
pub fn unroll_loop(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    const OP: &str = "unroll_loop";
    let (_, l, path) = loop_at(p, c, OP)?;
    let (Some(lo), Some(hi)) = (l.lo.as_int(), l.hi.as_int()) else {
        return Err(EditError::not_applicable(OP, "bounds are not literals"));
    };
    if hi - lo > 1 && l.body.iter().any(|s| s.as_alloc().is_some()) {
        return Err(EditError::not_applicable(
            OP,
            "body allocates; copies would collide",
        ));
    }
    let mut ed = p.editor();
    let mut copies = Vec::new();
    for k in lo..hi {
        let mut body = l.body.clone();
        walk::substitute(&mut body, &l.var, &Expr::Int(k));
        simplify_stmts(&mut body);
        if k > lo {
            walk::renumber(&mut body, ed.ids());
        }
        copies.extend(body);
    }
    let at = index_of(path);
    ed.block_mut(path)?.splice(at..=at, copies);
    debug!(op = OP, var = %l.var, trips = hi - lo, "unrolled loop");
    Ok(ed.finish())
}

/// Rename the procedure.
pub fn rename(p: &Proc, name: &str) -> Proc {
    let mut ed = p.editor();
    ed.def_mut().name = name.to_string();
    ed.finish()
}
