// printer.rs — Textual form of procedures
//
// `Display` for procedures, statements, and expressions in the same brace
// syntax the parser reads. Printing is canonical: parsing the output and
// printing again yields the same text. Binary operators are parenthesized
// only where precedence or associativity requires it.

use std::fmt::{self, Write as _};

use crate::ast::*;

const INDENT: &str = "    ";

impl fmt::Display for ProcDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match &p.kind {
                ParamKind::Size => write!(f, "{}: size", p.name)?,
                ParamKind::Buffer(decl) => write!(f, "{}: {}", p.name, decl)?,
            }
        }
        f.write_str(") {\n")?;
        let mut out = String::new();
        write_block(&mut out, &self.body, 1)?;
        f.write_str(&out)?;
        f.write_str("}\n")
    }
}

impl fmt::Display for BufferDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if !self.shape.is_empty() {
            f.write_str("[")?;
            write_list(f, &self.shape)?;
            f.write_str("]")?;
        }
        write!(f, " @ {}", self.mem)
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_stmt(&mut out, self, 0)?;
        f.write_str(&out)
    }
}

/// Print a statement list at `depth` levels of indentation.
pub fn write_block(out: &mut String, stmts: &[Stmt], depth: usize) -> fmt::Result {
    for s in stmts {
        write_stmt(out, s, depth)?;
    }
    Ok(())
}

fn write_stmt(out: &mut String, s: &Stmt, depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    match &s.kind {
        StmtKind::For(l) => {
            writeln!(out, "{pad}for {} in seq({}, {}) {{", l.var, l.lo, l.hi)?;
            write_block(out, &l.body, depth + 1)?;
            writeln!(out, "{pad}}}")
        }
        StmtKind::If(i) => {
            writeln!(out, "{pad}if {} {{", i.cond)?;
            write_block(out, &i.body, depth + 1)?;
            if i.orelse.is_empty() {
                writeln!(out, "{pad}}}")
            } else {
                writeln!(out, "{pad}}} else {{")?;
                write_block(out, &i.orelse, depth + 1)?;
                writeln!(out, "{pad}}}")
            }
        }
        StmtKind::Alloc(a) => writeln!(out, "{pad}{}: {};", a.name, a.decl),
        StmtKind::Assign(st) => writeln!(out, "{pad}{} = {};", st.lhs, st.rhs),
        StmtKind::Reduce(st) => writeln!(out, "{pad}{} += {};", st.lhs, st.rhs),
        StmtKind::Call(c) => {
            write!(out, "{pad}{}(", c.instr)?;
            let mut args = String::new();
            for (i, a) in c.args.iter().enumerate() {
                if i > 0 {
                    args.push_str(", ");
                }
                write!(args, "{a}")?;
            }
            writeln!(out, "{args});")
        }
        StmtKind::Pass => writeln!(out, "{pad}pass;"),
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)?;
        if !self.idx.is_empty() {
            f.write_str("[")?;
            write_list(f, &self.idx)?;
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)?;
        if self.dims.is_empty() {
            return Ok(());
        }
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match d {
                WindowDim::Point(p) => write!(f, "{p}")?,
                WindowDim::Interval(lo, hi) => write!(f, "{lo}:{hi}")?,
            }
        }
        f.write_str("]")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Var(v) => f.write_str(v),
            Expr::Read(a) => write!(f, "{a}"),
            Expr::Window(w) => write!(f, "{w}"),
            Expr::Neg(inner) => match inner.as_ref() {
                Expr::Bin(..) | Expr::Neg(_) | Expr::Int(_) => write!(f, "-({inner})"),
                _ => write!(f, "-{inner}"),
            },
            Expr::Bin(op, lhs, rhs) => {
                let prec = op.precedence();
                write_operand(f, lhs, |p| p < prec)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, rhs, |p| p <= prec)
            }
        }
    }
}

fn write_operand(
    f: &mut fmt::Formatter<'_>,
    e: &Expr,
    needs_parens: impl Fn(u8) -> bool,
) -> fmt::Result {
    match e {
        Expr::Bin(op, ..) if needs_parens(op.precedence()) => write!(f, "({e})"),
        _ => write!(f, "{e}"),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_proc;

    fn reprint(src: &str) -> String {
        parse_proc(src).unwrap().to_string()
    }

    #[test]
    fn canonical_layout() {
        insta::assert_snapshot!(
            reprint("proc f(n: size, a: i32[n] @ DRAM) { for i in seq(0, n) { if i < 4 { a[i] = 0; } else { a[i] += a[i - 1] * 2; } } }"),
            @r"
        proc f(n: size, a: i32[n] @ DRAM) {
            for i in seq(0, n) {
                if i < 4 {
                    a[i] = 0;
                } else {
                    a[i] += a[i - 1] * 2;
                }
            }
        }
        "
        );
    }

    #[test]
    fn allocations_always_name_memory() {
        insta::assert_snapshot!(
            reprint("proc f() { y: i32; t: i8[4, 4] @ RVM_TILE; rvm_mzero(t[0:4, 0:4]); }"),
            @r"
        proc f() {
            y: i32 @ DRAM;
            t: i8[4, 4] @ RVM_TILE;
            rvm_mzero(t[0:4, 0:4]);
        }
        "
        );
    }

    #[test]
    fn parentheses_only_where_needed() {
        let src = "proc f() { x = (a - (b - c)) * (d + e) + -(f + g) + (h * k) % 2; }";
        let printed = reprint(src);
        assert!(printed.contains("x = (a - (b - c)) * (d + e) + -(f + g) + h * k % 2;"));
        assert_eq!(reprint(&printed), printed);
    }
}
