// instr.rs — Accelerator instructions and loop-nest replacement
//
// An instruction is a procedure whose body states what it computes plus a
// C template the code generator fills in. `replace` matches a program loop
// nest against an instruction body and, when they agree up to renaming of
// loop variables and buffer windows, turns the nest into a call.
//
// Matching rules:
//   - loop nests have the same depth and identical literal bounds;
//   - the innermost statements have the same kind and the same expression
//     structure;
//   - each dimension of a program access is either a point (independent of
//     the nest) or strides by exactly one nest variable with coefficient 1,
//     and those variables appear in the order the instruction indexes;
//   - the innermost dimension is never a point, and the buffer's memory is
//     accepted by the parameter.

use std::collections::BTreeMap;

use tracing::debug;

use crate::affine::Affine;
use crate::ast::*;
use crate::cursor::Cursor;
use crate::edit::loop_at;
use crate::error::{EditError, EditResult, LoadError};
use crate::memory::Memory;
use crate::proc::Proc;
use crate::simplify::simplify_expr;
use crate::walk;

const RVM_SOURCE: &str = r#"
proc rvm_mld(dst: i32[4, 4] @ RVM_TILE, src: i32[4, 4] @ DRAM) {
    for i in seq(0, 4) {
        for j in seq(0, 4) {
            dst[i, j] = src[i, j];
        }
    }
}

proc rvm_mzero(dst: i32[4, 4] @ RVM_TILE) {
    for i in seq(0, 4) {
        for j in seq(0, 4) {
            dst[i, j] = 0;
        }
    }
}

proc rvm_mst(src: i32[4, 4] @ RVM_TILE, dst: i32[4, 4] @ DRAM) {
    for i in seq(0, 4) {
        for j in seq(0, 4) {
            dst[i, j] = src[i, j];
        }
    }
}

proc rvm_mmasa(md: i32[4, 4] @ RVM_TILE, ms1: i32[4, 4] @ RVM_TILE, ms2: i32[4, 4] @ RVM_TILE) {
    for i in seq(0, 4) {
        for j in seq(0, 4) {
            for k in seq(0, 4) {
                md[i, j] += ms2[i, k] * ms1[j, k];
            }
        }
    }
}
"#;

const RVM_TEMPLATES: &[(&str, &str)] = &[
    (
        "rvm_mld",
        r#"asm volatile("mld.w "{dst_int}", (%1), %0" :: "r"(4*({src}.strides[0])), "r"(&{src_data}));"#,
    ),
    ("rvm_mzero", r#"asm volatile("mzero "{dst_int});"#),
    (
        "rvm_mst",
        r#"asm volatile("mst.w "{src_int}", (%1), %0" :: "r"(4*({dst}.strides[0])), "r"(&{dst_data}));"#,
    ),
    (
        "rvm_mmasa",
        r#"asm volatile("mmasa.w "{md_int}", "{ms1_int}", "{ms2_int});"#,
    ),
];

#[derive(Debug, Clone)]
pub struct Instr {
    pub def: ProcDef,
    /// C text with `{param}`, `{param_data}` and `{param_int}` holes.
    pub template: String,
}

impl Instr {
    pub fn name(&self) -> &str {
        &self.def.name
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstrLibrary {
    instrs: Vec<Instr>,
}

impl InstrLibrary {
    /// The matrix accelerator's load, zero, store and multiply-accumulate.
    pub fn rvm() -> Result<Self, LoadError> {
        let defs = crate::parser::parse_procs(RVM_SOURCE)?;
        let instrs = defs
            .into_iter()
            .map(|def| {
                let template = RVM_TEMPLATES
                    .iter()
                    .find(|(name, _)| *name == def.name)
                    .map(|(_, t)| t.to_string())
                    .ok_or_else(|| LoadError::MissingProc {
                        name: def.name.clone(),
                    })?;
                Ok(Instr { def, template })
            })
            .collect::<Result<Vec<_>, LoadError>>()?;
        Ok(Self { instrs })
    }

    pub fn get(&self, name: &str) -> Option<&Instr> {
        self.instrs.iter().find(|i| i.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter()
    }
}

// ── Replacement ─────────────────────────────────────────────────────────────

/// Replace the loop nest at `c` by a call to `instr`. The call keeps the
/// loop's id.
pub fn replace(p: &Proc, c: &Cursor, instr: &Instr) -> EditResult<Proc> {
    const OP: &str = "replace";
    let (stmt, _, path) = loop_at(p, c, OP)?;
    let args = unify(p.def(), stmt, &instr.def).map_err(|r| EditError::not_applicable(OP, r))?;
    let mut ed = p.editor();
    *ed.stmt_mut(path)? = Stmt::new(
        stmt.id,
        StmtKind::Call(Call {
            instr: instr.name().to_string(),
            args,
        }),
    );
    debug!(op = OP, instr = instr.name(), "replaced loop nest");
    Ok(ed.finish())
}

/// For each named instruction in turn, replace every loop nest it matches,
/// first match in pre-order each time.
#[tracing::instrument(skip_all, fields(proc = p.name()))]
pub fn replace_all(p: &Proc, names: &[&str], lib: &InstrLibrary) -> EditResult<Proc> {
    let mut p = p.clone();
    for name in names {
        let instr = lib
            .get(name)
            .ok_or_else(|| EditError::mismatch("replace_all", format!("unknown instruction `{name}`")))?;
        while let Some(c) = first_match(&p, instr) {
            p = replace(&p, &c, instr)?;
        }
    }
    Ok(p)
}

fn first_match(p: &Proc, instr: &Instr) -> Option<Cursor> {
    let mut found = None;
    walk::visit_stmts(&p.def().body, &mut |s| {
        if found.is_none() && s.is_loop() && unify(p.def(), s, &instr.def).is_ok() {
            found = Some(s.id);
        }
    });
    found.map(|id| p.cursor(crate::cursor::Loc::Node(id)))
}

/// Call arguments binding `instr`'s parameters for the nest rooted at `stmt`.
fn unify(def: &ProcDef, stmt: &Stmt, instr: &ProcDef) -> Result<Vec<Expr>, String> {
    let mut u = Unifier {
        def,
        instr,
        nest: BTreeMap::new(),
        trips: BTreeMap::new(),
        bound: BTreeMap::new(),
    };
    let (mut is, mut ps): (&[Stmt], &[Stmt]) = (&instr.body, std::slice::from_ref(stmt));
    loop {
        let ([i], [s]) = (is, ps) else {
            return Err("loop nests have different shapes".to_string());
        };
        match (&i.kind, &s.kind) {
            (StmtKind::For(il), StmtKind::For(pl)) => {
                if il.lo != pl.lo || il.hi != pl.hi || pl.hi.as_int().is_none() {
                    return Err(format!("bounds of `{}` do not match", pl.var));
                }
                u.nest.insert(pl.var.clone(), il.var.clone());
                u.trips.insert(pl.var.clone(), pl.trip_count().unwrap_or(0));
                is = &il.body;
                ps = &pl.body;
            }
            (StmtKind::Assign(ist), StmtKind::Assign(pst))
            | (StmtKind::Reduce(ist), StmtKind::Reduce(pst)) => {
                u.access(&ist.lhs, &pst.lhs)?;
                u.expr(&ist.rhs, &pst.rhs)?;
                break;
            }
            _ => return Err("statements differ".to_string()),
        }
    }
    instr
        .params
        .iter()
        .map(|q| {
            u.bound
                .remove(&q.name)
                .ok_or_else(|| format!("parameter `{}` is not used", q.name))
        })
        .collect()
}

struct Unifier<'a> {
    def: &'a ProcDef,
    instr: &'a ProcDef,
    /// Program loop variable to instruction loop variable.
    nest: BTreeMap<String, String>,
    trips: BTreeMap<String, i64>,
    /// Instruction parameter to program window.
    bound: BTreeMap<String, Expr>,
}

impl Unifier<'_> {
    fn expr(&mut self, ie: &Expr, pe: &Expr) -> Result<(), String> {
        match (ie, pe) {
            (Expr::Int(a), Expr::Int(b)) if a == b => Ok(()),
            (Expr::Var(iv), Expr::Var(pv)) if self.nest.get(pv) == Some(iv) => Ok(()),
            (Expr::Read(ia), Expr::Read(pa)) => self.access(ia, pa),
            (Expr::Neg(a), Expr::Neg(b)) => self.expr(a, b),
            (Expr::Bin(o1, l1, r1), Expr::Bin(o2, l2, r2)) if o1 == o2 => {
                self.expr(l1, l2)?;
                self.expr(r1, r2)
            }
            _ => Err(format!("`{pe}` does not match `{ie}`")),
        }
    }

    fn access(&mut self, ia: &Access, pa: &Access) -> Result<(), String> {
        let param = self
            .instr
            .params
            .iter()
            .find_map(|q| match &q.kind {
                ParamKind::Buffer(d) if q.name == ia.buf => Some(d),
                _ => None,
            })
            .ok_or_else(|| format!("`{}` is not an instruction parameter", ia.buf))?;
        let mem = buffer_mem(self.def, &pa.buf)
            .ok_or_else(|| format!("unknown buffer `{}`", pa.buf))?;
        if !param.mem.accepts(mem) {
            return Err(format!(
                "`{}` lives in {mem}, `{}` expects {}",
                pa.buf, ia.buf, param.mem
            ));
        }

        let mut dims = Vec::with_capacity(pa.idx.len());
        let mut order = Vec::new();
        for e in &pa.idx {
            let a = Affine::from_expr(e).ok_or_else(|| format!("index `{e}` is not affine"))?;
            let (inner, outer) = a.split(|v| self.nest.contains_key(v));
            match inner.terms.len() {
                0 => dims.push(WindowDim::Point(simplify_expr(e))),
                1 => {
                    let (v, c) = inner.terms.iter().next().map(|(v, c)| (v.clone(), *c)).unwrap_or_default();
                    if c != 1 {
                        return Err(format!("`{v}` strides by {c} in `{e}`"));
                    }
                    let trip = self.trips.get(&v).copied().unwrap_or(0);
                    dims.push(WindowDim::Interval(
                        outer.to_expr(),
                        outer.add(&Affine::constant(trip)).to_expr(),
                    ));
                    if let Some(iv) = self.nest.get(&v) {
                        order.push(iv.clone());
                    }
                }
                _ => return Err(format!("index `{e}` mixes several loop variables")),
            }
        }
        let expected: Vec<String> = ia
            .idx
            .iter()
            .map(|e| match e {
                Expr::Var(v) => Ok(v.clone()),
                other => Err(format!("instruction index `{other}` is not a variable")),
            })
            .collect::<Result<_, _>>()?;
        if order != expected {
            return Err(format!("loop order does not match `{}`", ia.buf));
        }
        if !matches!(dims.last(), Some(WindowDim::Interval(..))) {
            return Err(format!("innermost dimension of `{}` is not contiguous", pa.buf));
        }
        let window = Expr::Window(Window {
            buf: pa.buf.clone(),
            dims,
        });
        match self.bound.get(&ia.buf) {
            Some(prev) if *prev != window => {
                Err(format!("`{}` is bound to two different windows", ia.buf))
            }
            _ => {
                self.bound.insert(ia.buf.clone(), window);
                Ok(())
            }
        }
    }
}

/// Memory of a parameter or allocated buffer.
pub fn buffer_mem(def: &ProcDef, name: &str) -> Option<Memory> {
    let param = def.params.iter().find_map(|q| match &q.kind {
        ParamKind::Buffer(d) if q.name == name => Some(d.mem),
        _ => None,
    });
    param.or_else(|| {
        let mut found = None;
        walk::visit_stmts(&def.body, &mut |s| {
            if let Some(a) = s.as_alloc() {
                if found.is_none() && a.name == name {
                    found = Some(a.decl.mem);
                }
            }
        });
        found
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib() -> InstrLibrary {
        InstrLibrary::rvm().unwrap()
    }

    #[test]
    fn library_has_four_instructions() {
        let lib = lib();
        let names: Vec<&str> = lib.iter().map(Instr::name).collect();
        assert_eq!(names, ["rvm_mld", "rvm_mzero", "rvm_mst", "rvm_mmasa"]);
        assert!(lib.get("rvm_mzero").unwrap().template.contains("mzero"));
    }

    #[test]
    fn zero_nest_becomes_call() {
        let p = Proc::parse(
            "proc f() {
                t: i32[4, 4, 4] @ RVM_TILE;
                for k in seq(0, 4) {
                    for a in seq(0, 4) {
                        for b in seq(0, 4) { t[k, a, b] = 0; }
                    }
                }
            }",
        )
        .unwrap();
        let q = replace_all(&p, &["rvm_mzero"], &lib()).unwrap();
        insta::assert_snapshot!(q.to_string(), @r"
        proc f() {
            t: i32[4, 4, 4] @ RVM_TILE;
            for k in seq(0, 4) {
                rvm_mzero(t[k, 0:4, 0:4]);
            }
        }
        ");
    }

    #[test]
    fn load_window_with_offset() {
        let p = Proc::parse(
            "proc f(src: i32[16, 8] @ DRAM, t: i32[4, 4] @ RVM_TILE) {
                for io in seq(0, 4) {
                    for a in seq(0, 4) {
                        for b in seq(0, 4) { t[a, b] = src[a + 4 * io, b]; }
                    }
                }
            }",
        )
        .unwrap();
        let a = p.find_loop("a").unwrap();
        let q = replace(&p, &a, lib().get("rvm_mld").unwrap()).unwrap();
        let call = q.find_stmt("call", |s| matches!(s.kind, StmtKind::Call(_))).unwrap();
        assert_eq!(
            call.stmt().unwrap().to_string().trim(),
            "rvm_mld(t[0:4, 0:4], src[4 * io:4 + 4 * io, 0:4]);"
        );
        assert_eq!(call.id(), a.id());
    }

    #[test]
    fn memory_and_order_must_match() {
        let p = Proc::parse(
            "proc f(src: i32[4, 4] @ DRAM, t: i32[4, 4] @ RVM_TILE) {
                for a in seq(0, 4) {
                    for b in seq(0, 4) { src[a, b] = t[a, b]; }
                }
                for a in seq(0, 4) {
                    for b in seq(0, 4) { t[b, a] = src[b, a]; }
                }
            }",
        )
        .unwrap();
        let lib = lib();
        let top = p.body();
        // A store nest is not a load.
        assert!(replace(&p, &top[0], lib.get("rvm_mld").unwrap())
            .unwrap_err()
            .is_not_applicable());
        assert!(replace(&p, &top[0], lib.get("rvm_mst").unwrap()).is_ok());
        // Transposed indices do not match.
        assert!(replace(&p, &top[1], lib.get("rvm_mld").unwrap())
            .unwrap_err()
            .is_not_applicable());
    }
}
