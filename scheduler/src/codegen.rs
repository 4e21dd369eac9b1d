// codegen.rs — C code generation for scheduled procedures
//
// Lowers one procedure version to a C function. Loops become counted `for`
// loops, buffers are flattened row-major, and instruction calls expand
// their C templates with window arguments.
//
// Memory lowering:
//   DRAM         heap via malloc/free, or a plain local for scalars
//   DRAM_STATIC  `static` arrays
//   RVM_TILE     `#define`d tile registers from a fresh `TileAllocator`,
//                released in reverse order at the end of their block
//
// Preconditions: every called instruction is in the library.
// Postconditions: `GeneratedCode.c_source` is a self-contained translation
//                 unit; `peak_tiles` is the most tiles live at once.
// Failure modes: unknown instructions or buffers, element access to tile
//                memory, and tile pool errors produce `CodegenError`.
// Side effects: none.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use derive_more::{Display, Error, From};

use crate::ast::*;
use crate::instr::InstrLibrary;
use crate::memory::{MemGenError, Memory, TileAllocator};
use crate::proc::Proc;
use crate::simplify::simplify_expr;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Display, Error, From)]
pub enum CodegenError {
    #[display("unknown instruction `{name}`")]
    UnknownInstr { name: String },
    #[display("unknown buffer `{name}`")]
    UnknownBuffer { name: String },
    #[display("`{name}` lives in {mem} and cannot be accessed element-wise")]
    TileAccess { name: String, mem: Memory },
    #[display("window of `{name}` used outside an instruction call")]
    StrayWindow { name: String },
    #[display("{_0}")]
    #[from]
    Mem(MemGenError),
}

#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub c_source: String,
    pub peak_tiles: usize,
}

// ── Public entry point ──────────────────────────────────────────────────────

#[tracing::instrument(skip_all, fields(proc = p.name()))]
pub fn emit_c(p: &Proc, lib: &InstrLibrary) -> Result<GeneratedCode, CodegenError> {
    let mut ctx = CodegenCtx::new(p.def(), lib);
    ctx.emit_function()?;
    let generated = ctx.build_result();
    tracing::debug!(
        bytes = generated.c_source.len(),
        peak_tiles = generated.peak_tiles,
        "generated C"
    );
    Ok(generated)
}

// ── Internal context ────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    def: &'a ProcDef,
    lib: &'a InstrLibrary,
    out: String,
    tiles: TileAllocator,
    peak_tiles: usize,
    buffers: HashMap<String, Buffer>,
    /// Window struct types used by calls: (element type, rank).
    windows: BTreeSet<(ScalarType, usize)>,
}

#[derive(Debug, Clone)]
struct Buffer {
    decl: BufferDecl,
    /// Zero-dimensional DRAM local held in a plain C variable.
    plain: bool,
}

enum Release {
    Heap(String),
    Tile(String),
}

impl<'a> CodegenCtx<'a> {
    fn new(def: &'a ProcDef, lib: &'a InstrLibrary) -> Self {
        let buffers = def
            .params
            .iter()
            .filter_map(|q| match &q.kind {
                ParamKind::Buffer(d) => Some((
                    q.name.clone(),
                    Buffer {
                        decl: d.clone(),
                        plain: false,
                    },
                )),
                ParamKind::Size => None,
            })
            .collect();
        Self {
            def,
            lib,
            out: String::new(),
            tiles: TileAllocator::new(),
            peak_tiles: 0,
            buffers,
            windows: BTreeSet::new(),
        }
    }

    fn build_result(self) -> GeneratedCode {
        let mut src = String::new();
        let _ = writeln!(src, "#include <stdint.h>");
        let _ = writeln!(src, "#include <stdlib.h>");
        let _ = writeln!(src);
        for (ty, rank) in &self.windows {
            let _ = writeln!(src, "struct {} {{", window_struct(*ty, *rank));
            let _ = writeln!(src, "    {} * const data;", ty.c_name());
            let _ = writeln!(src, "    const int_fast32_t strides[{rank}];");
            let _ = writeln!(src, "}};");
            let _ = writeln!(src);
        }
        src.push_str(&self.out);
        GeneratedCode {
            c_source: src,
            peak_tiles: self.peak_tiles,
        }
    }

    fn emit_function(&mut self) -> Result<(), CodegenError> {
        let params: Vec<String> = self
            .def
            .params
            .iter()
            .map(|q| match &q.kind {
                ParamKind::Size => format!("int_fast32_t {}", q.name),
                ParamKind::Buffer(d) => format!("{}* {}", d.ty.c_name(), q.name),
            })
            .collect();
        let _ = writeln!(self.out, "void {}({}) {{", self.def.name, params.join(", "));
        self.emit_block(&self.def.body, 1)?;
        let _ = writeln!(self.out, "}}");
        Ok(())
    }

    fn emit_block(&mut self, stmts: &[Stmt], depth: usize) -> Result<(), CodegenError> {
        let mut releases = Vec::new();
        for s in stmts {
            self.emit_stmt(s, depth, &mut releases)?;
        }
        let pad = indent(depth);
        for r in releases.into_iter().rev() {
            match r {
                Release::Heap(name) => {
                    let _ = writeln!(self.out, "{pad}free({name});");
                }
                Release::Tile(name) => {
                    let line = self.tiles.free(&name)?;
                    let _ = writeln!(self.out, "{line}");
                }
            }
        }
        Ok(())
    }

    fn emit_stmt(
        &mut self,
        s: &Stmt,
        depth: usize,
        releases: &mut Vec<Release>,
    ) -> Result<(), CodegenError> {
        let pad = indent(depth);
        match &s.kind {
            StmtKind::For(l) => {
                let (lo, hi) = (self.c_expr(&l.lo)?, self.c_expr(&l.hi)?);
                let v = &l.var;
                let _ = writeln!(
                    self.out,
                    "{pad}for (int_fast32_t {v} = {lo}; {v} < {hi}; {v}++) {{"
                );
                self.emit_block(&l.body, depth + 1)?;
                let _ = writeln!(self.out, "{pad}}}");
            }
            StmtKind::If(i) => {
                let cond = self.c_expr(&i.cond)?;
                let _ = writeln!(self.out, "{pad}if ({cond}) {{");
                self.emit_block(&i.body, depth + 1)?;
                if !i.orelse.is_empty() {
                    let _ = writeln!(self.out, "{pad}}} else {{");
                    self.emit_block(&i.orelse, depth + 1)?;
                }
                let _ = writeln!(self.out, "{pad}}}");
            }
            StmtKind::Alloc(a) => self.emit_alloc(a, &pad, releases)?,
            StmtKind::Assign(st) | StmtKind::Reduce(st) => {
                let op = if matches!(s.kind, StmtKind::Assign(_)) { "=" } else { "+=" };
                let lhs = self.c_access(&st.lhs)?;
                let rhs = self.c_expr(&st.rhs)?;
                let _ = writeln!(self.out, "{pad}{lhs} {op} {rhs};");
            }
            StmtKind::Call(c) => {
                let line = self.c_call(c)?;
                let _ = writeln!(self.out, "{pad}{line}");
            }
            StmtKind::Pass => {
                let _ = writeln!(self.out, "{pad};");
            }
        }
        Ok(())
    }

    fn emit_alloc(
        &mut self,
        a: &Alloc,
        pad: &str,
        releases: &mut Vec<Release>,
    ) -> Result<(), CodegenError> {
        let ty = a.decl.ty.c_name();
        let name = &a.name;
        let count = product(&a.decl.shape);
        let plain = a.decl.mem == Memory::Dram && a.decl.shape.is_empty();
        match a.decl.mem {
            Memory::Dram if plain => {
                let _ = writeln!(self.out, "{pad}{ty} {name};");
            }
            Memory::Dram => {
                let count = self.c_expr(&count)?;
                let _ = writeln!(
                    self.out,
                    "{pad}{ty} *{name} = ({ty}*) malloc({count} * sizeof(*{name}));"
                );
                releases.push(Release::Heap(name.clone()));
            }
            Memory::DramStatic => {
                let count = self.c_expr(&count)?;
                let _ = writeln!(self.out, "{pad}static {ty} {name}[{count}];");
            }
            Memory::RvmTile => {
                let line = self.tiles.alloc(name, &a.decl.shape)?;
                self.peak_tiles = self.peak_tiles.max(self.tiles.in_use());
                let _ = writeln!(self.out, "{line}");
                releases.push(Release::Tile(name.clone()));
            }
        }
        self.buffers.insert(
            name.clone(),
            Buffer {
                decl: a.decl.clone(),
                plain,
            },
        );
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────────────────

    fn buffer(&self, name: &str) -> Result<&Buffer, CodegenError> {
        self.buffers
            .get(name)
            .ok_or_else(|| CodegenError::UnknownBuffer {
                name: name.to_string(),
            })
    }

    fn c_access(&self, a: &Access) -> Result<String, CodegenError> {
        let b = self.buffer(&a.buf)?;
        if !b.decl.mem.can_index() {
            return Err(CodegenError::TileAccess {
                name: a.buf.clone(),
                mem: b.decl.mem,
            });
        }
        if b.plain {
            return Ok(a.buf.clone());
        }
        let flat = flatten(&a.idx, &b.decl.shape);
        Ok(format!("{}[{}]", a.buf, self.c_expr(&flat)?))
    }

    fn c_expr(&self, e: &Expr) -> Result<String, CodegenError> {
        Ok(match e {
            Expr::Int(n) => n.to_string(),
            Expr::Var(v) => v.clone(),
            Expr::Read(a) => self.c_access(a)?,
            Expr::Window(w) => {
                return Err(CodegenError::StrayWindow {
                    name: w.buf.clone(),
                })
            }
            Expr::Neg(inner) => format!("-({})", self.c_expr(inner)?),
            Expr::Bin(op, l, r) => {
                let prec = op.precedence();
                let mut ls = self.c_expr(l)?;
                let mut rs = self.c_expr(r)?;
                if matches!(l.as_ref(), Expr::Bin(lop, ..) if lop.precedence() < prec) {
                    ls = format!("({ls})");
                }
                if matches!(r.as_ref(), Expr::Bin(rop, ..) if rop.precedence() <= prec) {
                    rs = format!("({rs})");
                }
                format!("{ls} {} {rs}", op.symbol())
            }
        })
    }

    // ── Instruction calls ───────────────────────────────────────────────────

    fn c_call(&mut self, c: &Call) -> Result<String, CodegenError> {
        let instr = self
            .lib
            .get(&c.instr)
            .ok_or_else(|| CodegenError::UnknownInstr {
                name: c.instr.clone(),
            })?;
        let mut text = instr.template.clone();
        for (q, arg) in instr.def.params.iter().zip(&c.args) {
            let hole = |suffix: &str| format!("{{{}{}}}", q.name, suffix);
            let Expr::Window(w) = arg else {
                text = text.replace(&hole(""), &self.c_expr(arg)?);
                continue;
            };
            let b = self.buffer(&w.buf)?.clone();
            if text.contains(&hole("_int")) {
                text = text.replace(&hole("_int"), &w.buf);
            }
            let dims = full_dims(w, &b.decl.shape);
            let origin: Vec<Expr> = dims
                .iter()
                .map(|d| match d {
                    WindowDim::Point(e) | WindowDim::Interval(e, _) => e.clone(),
                })
                .collect();
            if text.contains(&hole("_data")) {
                let data = self.c_access(&Access {
                    buf: w.buf.clone(),
                    idx: origin.clone(),
                })?;
                text = text.replace(&hole("_data"), &data);
            }
            if text.contains(&hole("")) {
                let strides = strides(&b.decl.shape);
                let kept: Vec<String> = dims
                    .iter()
                    .zip(&strides)
                    .filter(|(d, _)| matches!(d, WindowDim::Interval(..)))
                    .map(|(_, s)| self.c_expr(&simplify_expr(s)))
                    .collect::<Result<_, _>>()?;
                self.windows.insert((b.decl.ty, kept.len()));
                let data = self.c_access(&Access {
                    buf: w.buf.clone(),
                    idx: origin,
                })?;
                let lit = format!(
                    "(struct {}){{ &{data}, {{ {} }} }}",
                    window_struct(b.decl.ty, kept.len()),
                    kept.join(", ")
                );
                text = text.replace(&hole(""), &lit);
            }
        }
        Ok(text)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn window_struct(ty: ScalarType, rank: usize) -> String {
    format!("win_{rank}{}", ty.name())
}

fn product(shape: &[Expr]) -> Expr {
    let total = shape
        .iter()
        .cloned()
        .reduce(|acc, e| Expr::bin(BinOp::Mul, acc, e))
        .unwrap_or(Expr::Int(1));
    simplify_expr(&total)
}

/// Row-major strides of `shape`, innermost 1.
fn strides(shape: &[Expr]) -> Vec<Expr> {
    let mut out = vec![Expr::Int(1); shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        out[k] = Expr::bin(BinOp::Mul, out[k + 1].clone(), shape[k + 1].clone());
    }
    out
}

fn flatten(idx: &[Expr], shape: &[Expr]) -> Expr {
    let flat = idx
        .iter()
        .zip(strides(shape))
        .map(|(i, s)| Expr::bin(BinOp::Mul, i.clone(), s))
        .reduce(|acc, t| Expr::bin(BinOp::Add, acc, t))
        .unwrap_or(Expr::Int(0));
    simplify_expr(&flat)
}

/// A bare buffer argument covers the whole buffer.
fn full_dims(w: &Window, shape: &[Expr]) -> Vec<WindowDim> {
    if w.dims.is_empty() {
        shape
            .iter()
            .map(|e| WindowDim::Interval(Expr::Int(0), e.clone()))
            .collect()
    } else {
        w.dims.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib() -> InstrLibrary {
        InstrLibrary::rvm().unwrap()
    }

    #[test]
    fn loops_and_flat_indexing() {
        let p = Proc::parse(
            "proc f(n: size, a: i32[n, 4] @ DRAM) {
                for i in seq(0, n) {
                    for j in seq(0, 4) {
                        if i < 2 { a[i, j] = 0; } else { a[i, j] += a[i - 1, j]; }
                    }
                }
            }",
        )
        .unwrap();
        let code = emit_c(&p, &lib()).unwrap();
        insta::assert_snapshot!(code.c_source, @r"
        #include <stdint.h>
        #include <stdlib.h>

        void f(int_fast32_t n, int32_t* a) {
            for (int_fast32_t i = 0; i < n; i++) {
                for (int_fast32_t j = 0; j < 4; j++) {
                    if (i < 2) {
                        a[j + 4 * i] = 0;
                    } else {
                        a[j + 4 * i] += a[-4 + j + 4 * i];
                    }
                }
            }
        }
        ");
        assert_eq!(code.peak_tiles, 0);
    }

    #[test]
    fn memories_lower_differently() {
        let p = Proc::parse(
            "proc f(o: i32 @ DRAM) {
                s: i32 @ DRAM;
                h: i32[8] @ DRAM;
                st: i32[2, 2] @ DRAM_STATIC;
                t: i32[4, 4] @ RVM_TILE;
                s = 1;
                h[3] = s;
                st[1, 1] = h[3];
                rvm_mzero(t);
                o = st[1, 1];
            }",
        )
        .unwrap();
        let code = emit_c(&p, &lib()).unwrap().c_source;
        assert!(code.contains("    int32_t s;\n"));
        assert!(code.contains("int32_t *h = (int32_t*) malloc(8 * sizeof(*h));"));
        assert!(code.contains("static int32_t st[4];"));
        assert!(code.contains("#define t \"m7\""));
        assert!(code.contains("asm volatile(\"mzero \"t);"));
        assert!(code.contains("st[3] = h[3];"));
        assert!(code.contains("o[0] = st[3];"));
        let undef = code.find("#undef t").unwrap();
        let free = code.find("free(h);").unwrap();
        assert!(undef < free);
    }

    #[test]
    fn windows_fill_templates() {
        let p = Proc::parse(
            "proc f(src: i32[8, 4] @ DRAM) {
                t: i32[4, 4] @ RVM_TILE;
                rvm_mld(t[0:4, 0:4], src[4:8, 0:4]);
            }",
        )
        .unwrap();
        let code = emit_c(&p, &lib()).unwrap().c_source;
        assert!(code.contains("struct win_2i32 {"));
        assert!(code.contains(
            "asm volatile(\"mld.w \"t\", (%1), %0\" :: \
             \"r\"(4*((struct win_2i32){ &src[16], { 4, 1 } }.strides[0])), \"r\"(&src[16]));"
        ));
    }

    #[test]
    fn tile_reads_are_rejected() {
        let p = Proc::parse(
            "proc f(o: i32 @ DRAM) {
                t: i32[4, 4] @ RVM_TILE;
                o = t[0, 0];
            }",
        )
        .unwrap();
        assert!(matches!(
            emit_c(&p, &lib()),
            Err(CodegenError::TileAccess { .. })
        ));
    }

    #[test]
    fn tile_pool_exhaustion() {
        let decls: String = (0..9).map(|k| format!("t{k}: i32[4, 4] @ RVM_TILE; ")).collect();
        let p = Proc::parse(&format!("proc f() {{ {decls} }}")).unwrap();
        assert!(matches!(
            emit_c(&p, &lib()),
            Err(CodegenError::Mem(MemGenError::Exhausted { .. }))
        ));
    }
}
