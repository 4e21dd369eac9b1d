// recipes.rs — Rewrite recipes composed from primitive edits
//
// Every recipe takes a version and cursors captured in it or in an
// ancestor, forwards them before each primitive, and returns the version
// reached. `NotApplicable` from a primitive is how a recipe knows it has
// reached its fixpoint; any other error propagates unchanged.
//
// Preconditions: cursors belong to the lineage of `p`.
// Postconditions: the result descends from `p`; a recipe that makes no
//                 change returns `p` itself.
// Failure modes: forwarding failures and structural mismatches.
// Side effects: tracing spans and debug events only.

use std::collections::BTreeSet;

use tracing::debug;

use crate::alloc::{expand_dim, lift_alloc};
use crate::ast::{BinOp, Expr, Stmt};
use crate::cursor::Cursor;
use crate::edit::{fission, fuse, lift_scope, remove_loop, reorder_stmts};
use crate::error::{EditError, EditResult};
use crate::id::NodeId;
use crate::proc::Proc;
use crate::simplify::simplify_expr;

// ── Fusion ──────────────────────────────────────────────────────────────────

/// Fuse the loop at `c` with the loop that follows it.
///
/// If the successor has the same variable and upper bound the two are
/// fused directly. Otherwise the first loop nested inside the successor
/// (pre-order) that uses `c`'s variable is lifted up to the successor's
/// level and fused instead. Returns `None` when nothing applies; a failed
/// attempt leaves no partial edit behind.
pub fn fuse_two_loops(p: &Proc, c: &Cursor) -> EditResult<Option<Proc>> {
    let c = p.forward(c)?;
    let Some(next) = c.next() else {
        return Ok(None);
    };
    let (Some(a), Some(b)) = (
        c.stmt().and_then(Stmt::as_loop),
        next.stmt().and_then(Stmt::as_loop),
    ) else {
        return Ok(None);
    };

    let attempt = if a.var == b.var && a.hi == b.hi {
        fuse(p, &c, &next)
    } else {
        match find_child_loop(&next, &a.var) {
            Some((target, depth)) => lift_scope_n(p, &target, depth).and_then(|q| {
                let (first, second) = (q.forward(&c)?, q.forward(&target)?);
                fuse(&q, &first, &second)
            }),
            None => return Ok(None),
        }
    };
    match attempt {
        Ok(q) => {
            debug!(var = %a.var, "fused loop with successor");
            Ok(Some(q))
        }
        Err(e) if e.is_not_applicable() => Ok(None),
        Err(e) => Err(e),
    }
}

/// First loop over `var` nested inside `root` in pre-order, with the
/// number of enclosing statements between it and `root`'s level.
fn find_child_loop(root: &Cursor, var: &str) -> Option<(Cursor, usize)> {
    fn search(c: &Cursor, var: &str, depth: usize) -> Option<(Cursor, usize)> {
        for child in c.body() {
            if child.loop_var() == Some(var) {
                return Some((child, depth));
            }
            if let Some(hit) = search(&child, var, depth + 1) {
                return Some(hit);
            }
        }
        None
    }
    search(root, var, 1)
}

/// Fuse adjacent loops everywhere from `c` onward, innermost first.
#[tracing::instrument(skip_all, fields(proc = p.name()))]
pub fn fuse_all_loops(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    let mut p = p.clone();
    let mut cur = p.forward(c)?;
    loop {
        if cur.is_loop() {
            if let Some(first) = cur.body().into_iter().next() {
                p = fuse_all_loops(&p, &first)?;
            }
        }
        match fuse_two_loops(&p, &cur)? {
            Some(q) => {
                p = q;
                cur = p.forward(&cur)?;
            }
            None => match p.forward(&cur)?.next() {
                Some(next) => cur = next,
                None => break,
            },
        }
    }
    Ok(p)
}

// ── Allocation lifting ──────────────────────────────────────────────────────

/// Options for [`autolift_alloc`].
#[derive(Debug, Clone)]
pub struct AutoLift {
    /// Loops whose variables may index the new dimensions; `None` allows all.
    pub dep_set: Option<BTreeSet<String>>,
    /// Largest element count the allocation may grow to.
    pub max_size: i64,
    /// Move the allocation outside each loop it gains a dimension for.
    pub lift: bool,
}

impl AutoLift {
    pub fn new(max_size: i64) -> Self {
        Self {
            dep_set: None,
            max_size,
            lift: true,
        }
    }

    pub fn deps<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dep_set = Some(vars.into_iter().map(Into::into).collect());
        self
    }

    pub fn lift(mut self, lift: bool) -> Self {
        self.lift = lift;
        self
    }
}

/// Give an allocation one leading dimension per enclosing loop, walking
/// outward, while its element count stays within budget.
///
/// Loops outside `dep_set` are passed over. A symbolic trip count or an
/// exceeded budget ends the walk.
#[tracing::instrument(skip_all, fields(proc = p.name(), max_size = opts.max_size))]
pub fn autolift_alloc(p: &Proc, alloc: &Cursor, opts: &AutoLift) -> EditResult<Proc> {
    let mut p = p.clone();
    let start = p.forward(alloc)?;
    let Some(decl) = start
        .stmt()
        .and_then(Stmt::as_alloc)
        .map(|a| a.decl.clone())
    else {
        return Err(EditError::mismatch("autolift_alloc", "expected an allocation"));
    };
    let Some(mut accum) = decl.element_count() else {
        return Ok(p);
    };
    let mut next = start.parent();

    while let Some(lc) = next {
        let lc = p.forward(&lc)?;
        let Some(l) = lc.stmt().and_then(Stmt::as_loop).cloned() else {
            break;
        };
        next = lc.parent();
        if opts.dep_set.as_ref().is_some_and(|d| !d.contains(&l.var)) {
            continue;
        }
        // Empty or reversed loops stop the walk like symbolic ones.
        let Some((trip, grown)) = l
            .trip_count()
            .filter(|t| *t > 0)
            .and_then(|t| Some((t, accum.checked_mul(t)?)))
            .filter(|(_, grown)| *grown <= opts.max_size)
        else {
            break;
        };
        let index = match l.lo.as_int() {
            Some(0) => Expr::var(l.var.as_str()),
            _ => simplify_expr(&Expr::bin(BinOp::Sub, Expr::var(l.var.as_str()), l.lo.clone())),
        };
        let a = p.forward(alloc)?;
        p = match expand_dim(&p, &a, Expr::Int(trip), index) {
            Ok(q) => q,
            Err(e) if e.is_not_applicable() => break,
            Err(e) => return Err(e),
        };
        accum = grown;
        debug!(var = %l.var, trip, accum, "expanded allocation");
        if opts.lift {
            let loop_id = lc.id().ok_or_else(|| {
                EditError::mismatch("autolift_alloc", "enclosing loop has no id")
            })?;
            p = match lift_out_of(&p, alloc, loop_id) {
                Ok(q) => q,
                Err(e) if e.is_not_applicable() => break,
                Err(e) => return Err(e),
            };
        }
    }
    Ok(p)
}

/// Lift an allocation until `loop_id` no longer encloses it.
fn lift_out_of(p: &Proc, alloc: &Cursor, loop_id: NodeId) -> EditResult<Proc> {
    let mut p = p.clone();
    loop {
        let a = p.forward(alloc)?;
        let Some(id) = a.id() else {
            return Ok(p);
        };
        if !encloses(&p, loop_id, id) {
            return Ok(p);
        }
        p = lift_alloc(&p, &a)?;
    }
}

fn encloses(p: &Proc, outer: NodeId, mut inner: NodeId) -> bool {
    while let Some(parent) = p.parent_of(inner) {
        if parent == outer {
            return true;
        }
        inner = parent;
    }
    false
}

// ── Scope and order ─────────────────────────────────────────────────────────

/// Apply `lift_scope` to `c` exactly `n` times.
pub fn lift_scope_n(p: &Proc, c: &Cursor, n: usize) -> EditResult<Proc> {
    let mut p = p.clone();
    for _ in 0..n {
        let cur = p.forward(c)?;
        p = lift_scope(&p, &cur)?;
    }
    Ok(p)
}

/// Move `c` ahead of its preceding siblings for as long as it commutes
/// with them.
pub fn reorder_top(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    let mut p = p.clone();
    let mut cur = p.forward(c)?;
    while let Some(block) = cur.expand(1, 0) {
        match reorder_stmts(&p, &block) {
            Ok(q) => {
                p = q;
                cur = p.forward(&cur)?;
            }
            Err(e) if e.is_not_applicable() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(p)
}

/// Hoist `c` to the top of its block, then split every enclosing loop or
/// `if` right after it, climbing outward until a split is refused.
#[tracing::instrument(skip_all, fields(proc = p.name()))]
pub fn fission_as_much_as_possible(p: &Proc, c: &Cursor) -> EditResult<Proc> {
    let mut p = reorder_top(p, c)?;
    let mut gap = p
        .forward(c)?
        .after()
        .ok_or_else(|| EditError::mismatch("fission_as_much_as_possible", "cursor has no gap after it"))?;
    let mut splits = 0usize;
    loop {
        match fission(&p, &gap) {
            Ok(q) => {
                p = q;
                splits += 1;
            }
            Err(e) if e.is_not_applicable() => break,
            Err(e) => return Err(e),
        }
        match p.forward(&gap)?.parent().and_then(|s| s.after()) {
            Some(next) => gap = next,
            None => break,
        }
    }
    debug!(splits, "fissioned");
    Ok(p)
}

// ── Loop removal ────────────────────────────────────────────────────────────

/// Remove up to `num` enclosing loops of `c` that `remove_loop` accepts,
/// innermost first. Returns the new version and how many were removed.
#[tracing::instrument(skip_all, fields(proc = p.name(), num))]
pub fn remove_redundant_loops(p: &Proc, c: &Cursor, num: usize) -> EditResult<(Proc, usize)> {
    let mut p = p.clone();
    let mut removed = 0;
    let mut next = p.forward(c)?.parent();
    while let Some(anc) = next {
        if removed >= num {
            break;
        }
        let anc = p.forward(&anc)?;
        if !anc.is_loop() {
            break;
        }
        next = anc.parent();
        match remove_loop(&p, &anc) {
            Ok(q) => {
                p = q;
                removed += 1;
            }
            Err(e) if e.is_not_applicable() => {
                debug!(reason = %e, "kept loop");
            }
            Err(e) => return Err(e),
        }
    }
    Ok((p, removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(src: &str) -> Proc {
        Proc::parse(src).unwrap()
    }

    fn same(actual: &Proc, expected: &str) {
        assert_eq!(actual.to_string(), proc(expected).to_string());
    }

    #[test]
    fn fuse_two_loops_fast_path() {
        let p = proc(
            "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM) {
                for i in seq(0, 4) { a[i] = 0; }
                for i in seq(0, 4) { b[i] = a[i]; }
            }",
        );
        let q = fuse_two_loops(&p, &p.body()[0]).unwrap().unwrap();
        same(
            &q,
            "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM) {
                for i in seq(0, 4) { a[i] = 0; b[i] = a[i]; }
            }",
        );
    }

    #[test]
    fn fuse_two_loops_lifts_nested_partner() {
        let p = proc(
            "proc f(a: i32[4] @ DRAM, b: i32[2, 4] @ DRAM) {
                for i in seq(0, 4) { a[i] = 0; }
                for k in seq(0, 2) {
                    for i in seq(0, 4) { b[k, i] = a[i]; }
                }
            }",
        );
        let q = fuse_two_loops(&p, &p.body()[0]).unwrap().unwrap();
        same(
            &q,
            "proc f(a: i32[4] @ DRAM, b: i32[2, 4] @ DRAM) {
                for i in seq(0, 4) {
                    a[i] = 0;
                    for k in seq(0, 2) { b[k, i] = a[i]; }
                }
            }",
        );
    }

    #[test]
    fn fuse_two_loops_noops() {
        let p = proc(
            "proc f(a: i32[4] @ DRAM, b: i32[2, 4] @ DRAM) {
                for i in seq(0, 4) { a[i] = 0; }
                for k in seq(0, 2) {
                    b[k, 0] = 1;
                    for i in seq(0, 4) { b[k, i] = a[i]; }
                }
                pass;
            }",
        );
        let top = p.body();
        // The partner shares its block, so it cannot be lifted.
        assert!(fuse_two_loops(&p, &top[0]).unwrap().is_none());
        // Successor is not a loop.
        assert!(fuse_two_loops(&p, &top[1]).unwrap().is_none());
        // No successor.
        assert!(fuse_two_loops(&p, &top[2]).unwrap().is_none());
    }

    #[test]
    fn fuse_all_loops_innermost_first() {
        let p = proc(
            "proc f(a: i32[4, 4] @ DRAM, b: i32[4] @ DRAM) {
                for i in seq(0, 4) {
                    for j in seq(0, 4) { a[i, j] = 0; }
                    for j in seq(0, 4) { a[i, j] += 1; }
                }
                for i in seq(0, 4) { b[i] = 2; }
            }",
        );
        let q = fuse_all_loops(&p, &p.body()[0]).unwrap();
        same(
            &q,
            "proc f(a: i32[4, 4] @ DRAM, b: i32[4] @ DRAM) {
                for i in seq(0, 4) {
                    for j in seq(0, 4) { a[i, j] = 0; a[i, j] += 1; }
                    b[i] = 2;
                }
            }",
        );
    }

    const LIFT_SRC: &str = "proc f(o: i32[4, 8] @ DRAM) {
        for i in seq(0, 4) {
            for j in seq(0, 8) {
                t: i32 @ DRAM;
                t = o[i, j];
                o[i, j] = t;
            }
        }
    }";

    fn alloc_t(p: &Proc) -> Cursor {
        p.find_alloc("t").unwrap()
    }

    #[test]
    fn autolift_expands_outward_within_budget() {
        let p = proc(LIFT_SRC);
        let q = autolift_alloc(&p, &alloc_t(&p), &AutoLift::new(64)).unwrap();
        same(
            &q,
            "proc f(o: i32[4, 8] @ DRAM) {
                t: i32[4, 8] @ DRAM;
                for i in seq(0, 4) {
                    for j in seq(0, 8) {
                        t[i, j] = o[i, j];
                        o[i, j] = t[i, j];
                    }
                }
            }",
        );
    }

    #[test]
    fn autolift_stops_at_budget() {
        let p = proc(LIFT_SRC);
        let q = autolift_alloc(&p, &alloc_t(&p), &AutoLift::new(16)).unwrap();
        same(
            &q,
            "proc f(o: i32[4, 8] @ DRAM) {
                for i in seq(0, 4) {
                    t: i32[8] @ DRAM;
                    for j in seq(0, 8) {
                        t[j] = o[i, j];
                        o[i, j] = t[j];
                    }
                }
            }",
        );
        let r = autolift_alloc(&p, &alloc_t(&p), &AutoLift::new(0)).unwrap();
        assert_eq!(r.to_string(), p.to_string());
    }

    #[test]
    fn autolift_skips_loops_outside_dep_set() {
        let p = proc(LIFT_SRC);
        let q = autolift_alloc(&p, &alloc_t(&p), &AutoLift::new(64).deps(["i"])).unwrap();
        same(
            &q,
            "proc f(o: i32[4, 8] @ DRAM) {
                t: i32[4] @ DRAM;
                for i in seq(0, 4) {
                    for j in seq(0, 8) {
                        t[i] = o[i, j];
                        o[i, j] = t[i];
                    }
                }
            }",
        );
        let r = autolift_alloc(&p, &alloc_t(&p), &AutoLift::new(64).lift(false)).unwrap();
        assert_eq!(r.find_alloc("t").unwrap().parent(), Some(r.find_loop("j").unwrap()));
        assert!(r.to_string().contains("t: i32[4, 8] @ DRAM;"));
    }

    #[test]
    fn lift_scope_n_lifts_repeatedly() {
        let p = proc(
            "proc f(a: i32[2, 3, 4] @ DRAM) {
                for i in seq(0, 2) {
                    for j in seq(0, 3) {
                        for k in seq(0, 4) { a[i, j, k] = 0; }
                    }
                }
            }",
        );
        let k = p.find_loop("k").unwrap();
        let q = lift_scope_n(&p, &k, 2).unwrap();
        same(
            &q,
            "proc f(a: i32[2, 3, 4] @ DRAM) {
                for k in seq(0, 4) {
                    for i in seq(0, 2) {
                        for j in seq(0, 3) { a[i, j, k] = 0; }
                    }
                }
            }",
        );
        let err = lift_scope_n(&p, &k, 3).unwrap_err();
        assert!(err.is_not_applicable());
    }

    #[test]
    fn reorder_top_stops_at_dependence() {
        let p = proc(
            "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM, c: i32[4] @ DRAM) {
                for i in seq(0, 4) { a[i] = 0; b[i] = a[i]; c[i] = 2; }
            }",
        );
        let body = p.find_loop("i").unwrap().body();
        let q = reorder_top(&p, &body[2]).unwrap();
        same(
            &q,
            "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM, c: i32[4] @ DRAM) {
                for i in seq(0, 4) { c[i] = 2; a[i] = 0; b[i] = a[i]; }
            }",
        );
        let again = reorder_top(&q, &body[2]).unwrap();
        assert!(again.same_version(&q));
        let blocked = reorder_top(&p, &body[1]).unwrap();
        assert!(blocked.same_version(&p));
    }

    #[test]
    fn fission_climbs_every_level() {
        let p = proc(
            "proc f(a: i32[4, 4] @ DRAM, b: i32[4, 4] @ DRAM, c: i32[4, 4] @ DRAM) {
                for i in seq(0, 4) {
                    for j in seq(0, 4) { a[i, j] = 0; b[i, j] = 1; c[i, j] = 2; }
                }
            }",
        );
        let target = p.find_loop("j").unwrap().body()[1].clone();
        let q = fission_as_much_as_possible(&p, &target).unwrap();
        same(
            &q,
            "proc f(a: i32[4, 4] @ DRAM, b: i32[4, 4] @ DRAM, c: i32[4, 4] @ DRAM) {
                for i in seq(0, 4) {
                    for j in seq(0, 4) { b[i, j] = 1; }
                }
                for i in seq(0, 4) {
                    for j in seq(0, 4) { a[i, j] = 0; c[i, j] = 2; }
                }
            }",
        );
        // The target stays reachable in the first copy.
        let moved = q.forward(&target).unwrap();
        assert_eq!(moved.parent().unwrap().parent().unwrap().parent(), None);
    }

    #[test]
    fn remove_redundant_loops_skips_dependent_loops() {
        let src = "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM) {
            for i in seq(0, 4) {
                for j in seq(0, 4) {
                    for k in seq(0, 4) { a[k] = b[k]; }
                }
            }
        }";
        let p = proc(src);
        let stmt = p.find_loop("k").unwrap().body()[0].clone();
        let (q, n) = remove_redundant_loops(&p, &stmt, 2).unwrap();
        assert_eq!(n, 2);
        same(
            &q,
            "proc f(a: i32[4] @ DRAM, b: i32[4] @ DRAM) {
                for k in seq(0, 4) { a[k] = b[k]; }
            }",
        );
        let (q, n) = remove_redundant_loops(&p, &stmt, 1).unwrap();
        assert_eq!(n, 1);
        assert!(q.find_loop("i").is_ok());
        assert!(q.find_loop("j").is_err());
        let (q, n) = remove_redundant_loops(&p, &stmt, 0).unwrap();
        assert_eq!(n, 0);
        assert!(q.same_version(&p));
    }
}
