// simplify.rs — Expression normalization
//
// Rewrites every affine subexpression into its canonical form and folds
// integer arithmetic. Statement structure and ids are untouched.

use crate::affine::Affine;
use crate::ast::{BinOp, Expr, Stmt, Window, WindowDim};
use crate::proc::Proc;
use crate::walk;

/// Simplify every expression of `p`. Always succeeds; ids are preserved.
#[tracing::instrument(skip_all, fields(proc = p.name()))]
pub fn simplify(p: &Proc) -> Proc {
    let mut ed = p.editor();
    simplify_stmts(&mut ed.def_mut().body);
    ed.finish()
}

pub fn simplify_stmts(stmts: &mut [Stmt]) {
    walk::for_each_expr_mut(stmts, &mut |e| *e = simplify_expr(e));
}

pub fn simplify_expr(e: &Expr) -> Expr {
    if let Some(a) = Affine::from_expr(e) {
        return a.to_expr();
    }
    match e {
        Expr::Int(_) | Expr::Var(_) => e.clone(),
        Expr::Read(a) => Expr::read(a.buf.clone(), a.idx.iter().map(simplify_expr).collect()),
        Expr::Window(w) => Expr::Window(Window {
            buf: w.buf.clone(),
            dims: w
                .dims
                .iter()
                .map(|d| match d {
                    WindowDim::Point(p) => WindowDim::Point(simplify_expr(p)),
                    WindowDim::Interval(lo, hi) => {
                        WindowDim::Interval(simplify_expr(lo), simplify_expr(hi))
                    }
                })
                .collect(),
        }),
        Expr::Neg(inner) => match simplify_expr(inner) {
            Expr::Int(n) => Expr::Int(-n),
            Expr::Neg(x) => *x,
            other => Expr::Neg(Box::new(other)),
        },
        Expr::Bin(op, l, r) => {
            let (l, r) = (simplify_expr(l), simplify_expr(r));
            match (op, l.as_int(), r.as_int()) {
                (BinOp::Mul, Some(1), _) => r,
                (BinOp::Mul | BinOp::Div, _, Some(1)) => l,
                (BinOp::Add, Some(0), _) => r,
                (BinOp::Add | BinOp::Sub, _, Some(0)) => l,
                _ => Expr::bin(*op, l, r),
            }
        }
    }
}
