// schedule.rs — Fixed recipe pipelines with a per-step trace
//
// `Conv1dSchedule` turns the generic 1-D convolution into a version that
// runs on the matrix accelerator: tile, stage the output, input window and
// kernels into tiles, swap inner nests for instructions, then unroll so
// every tile has a name of its own. `fuse_all` is the generic alternative
// that only fuses loops.
//
// Preconditions: the input version has the loop and buffer names each
//                pipeline looks up (`i`, `j`, `c`, `y`, ...).
// Postconditions: returns the final version plus one `StepRecord` per step.
// Failure modes: the first failing step's `EditError`, unchanged.
// Side effects: tracing events per step.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::alloc::{expand_dim, lift_alloc, reuse_buffer, set_memory, unroll_buffer};
use crate::ast::{Expr, StmtKind};
use crate::cursor::Cursor;
use crate::edit::{rename, reorder_loops, tile_loops, unroll_loop};
use crate::error::{EditError, EditResult};
use crate::instr::{replace_all, InstrLibrary};
use crate::memory::Memory;
use crate::proc::Proc;
use crate::recipes::{
    autolift_alloc, fission_as_much_as_possible, fuse_all_loops, lift_scope_n,
    remove_redundant_loops, AutoLift,
};
use crate::simplify::simplify;
use crate::stage::stage_mem;

/// Accelerator tile edge.
pub const TILE: i64 = 4;

// ── Trace ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub version: u32,
    pub fingerprint: String,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Trace {
    pub records: Vec<StepRecord>,
}

impl Trace {
    fn run<T>(
        &mut self,
        step: &str,
        f: impl FnOnce() -> EditResult<(Proc, T)>,
    ) -> EditResult<(Proc, T)> {
        let start = Instant::now();
        let (p, extra) = f().inspect_err(|e| warn!(step, error = %e, "step failed"))?;
        let elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        debug!(step, version = p.version(), elapsed_us, "step done");
        self.records.push(StepRecord {
            step: step.to_string(),
            version: p.version(),
            fingerprint: p.fingerprint(),
            elapsed_us,
        });
        Ok((p, extra))
    }

    fn step(&mut self, step: &str, f: impl FnOnce() -> EditResult<Proc>) -> EditResult<Proc> {
        self.run(step, || f().map(|p| (p, ()))).map(|(p, ())| p)
    }
}

// ── Pipelines ───────────────────────────────────────────────────────────────

/// Fuse every fusible loop pair of `p`.
pub fn fuse_all(p: &Proc) -> EditResult<(Proc, Trace)> {
    let mut trace = Trace::default();
    let Some(first) = p.body().into_iter().next() else {
        return Ok((p.clone(), trace));
    };
    let q = trace.step("fuse_all_loops", || fuse_all_loops(p, &first))?;
    Ok((q, trace))
}

/// Accelerator schedule for the 1-D convolution.
#[derive(Debug, Clone)]
pub struct Conv1dSchedule {
    pub lib: InstrLibrary,
    /// Name given to the scheduled procedure.
    pub name: String,
}

/// Cursors captured in the unscheduled procedure.
struct Anchors {
    i_loop: Cursor,
    j_loop: Cursor,
    c_loop: Cursor,
    y_alloc: Cursor,
    y_assign: Cursor,
}

impl Anchors {
    fn capture(p: &Proc) -> EditResult<Self> {
        Ok(Self {
            i_loop: p.find_loop("i")?,
            j_loop: p.find_loop("j")?,
            c_loop: p.find_loop("c")?,
            y_alloc: p.find_alloc("y")?,
            y_assign: p.find_stmt("load of `y`", |s| {
                matches!(&s.kind, StmtKind::Assign(st)
                    if st.lhs.buf == "y" && matches!(st.rhs, Expr::Read(_)))
            })?,
        })
    }
}

fn parent(c: &Cursor, what: &str) -> EditResult<Cursor> {
    c.parent()
        .ok_or_else(|| EditError::mismatch("conv1d", format!("{what} has no parent")))
}

impl Conv1dSchedule {
    pub fn new(lib: InstrLibrary) -> Self {
        Self {
            lib,
            name: "conv1d_tile_lt_kw".to_string(),
        }
    }

    #[tracing::instrument(skip_all, fields(proc = p.name()))]
    pub fn run(&self, p: &Proc) -> EditResult<(Proc, Trace)> {
        let mut t = Trace::default();
        let at = Anchors::capture(p)?;
        let mut p = t.step("rename", || Ok(rename(p, &self.name)))?;

        // ── Tiling ──
        p = t.step("tile_i_j", || {
            tile_loops(&p, &[(at.i_loop.clone(), TILE), (at.j_loop.clone(), TILE)], true)
        })?;
        p = t.step("tile_io", || tile_loops(&p, &[(at.i_loop.clone(), TILE)], true))?;
        p = t.step("reorder_ioi", || reorder_loops(&p, &p.find_loop("ioi")?))?;

        // ── Output tile ──
        let (q, out) = t.run("stage_out", || {
            let c = p.forward(&at.c_loop)?;
            let block = c.expand(1, 0).ok_or_else(|| {
                EditError::mismatch("conv1d", "loop `c` has no preceding initialization")
            })?;
            stage_mem(&p, &block, "out", "out_tile")
        })?;
        p = q;
        p = t.step("autolift_out", || {
            autolift_alloc(&p, &out.alloc, &AutoLift::new(TILE * TILE * TILE).deps(["ioi", "ii", "ji"]))
        })?;
        p = t.step("fission_out", || fission_as_much_as_possible(&p, &out.block))?;
        p = t.step("fission_init", || {
            let init = out.block.nodes().into_iter().next().ok_or_else(|| {
                EditError::mismatch("conv1d", "staged block is empty")
            })?;
            fission_as_much_as_possible(&p, &init)
        })?;
        p = t.step("lift_c", || lift_scope_n(&p, &at.c_loop, 3))?;

        // ── Input window ──
        p = t.step("autolift_y", || {
            autolift_alloc(&p, &at.y_alloc, &AutoLift::new(TILE * TILE).deps(["r", "ji"]))
        })?;
        p = t.step("lift_y", || {
            let q = lift_alloc(&p, &p.forward(&at.y_alloc)?)?;
            lift_alloc(&q, &q.forward(&at.y_alloc)?)
        })?;
        p = t.step("fission_y", || {
            let guard = parent(&p.forward(&at.y_assign)?, "load of `y`")?;
            fission_as_much_as_possible(&p, &guard)
        })?;
        p = t.step("remove_redundant", || {
            let guard = parent(&p.forward(&at.y_assign)?, "load of `y`")?;
            let (q, removed) = remove_redundant_loops(&p, &guard, 2)?;
            debug!(removed, "removed redundant loops");
            Ok(q)
        })?;

        // ── Kernel and data tiles ──
        let ii_loop = p
            .forward(&at.c_loop)?
            .body()
            .get(2)
            .and_then(|n| n.body().into_iter().next())
            .ok_or_else(|| EditError::mismatch("conv1d", "loop `c` lacks the compute nest"))?;
        let (q, kernel) = t.run("stage_kernels", || stage_mem(&p, &ii_loop, "kernels", "kernel_tile"))?;
        p = q;
        p = t.step("expand_kernels", || {
            let var = parent(&p.forward(&ii_loop)?, "loop `ii`")?
                .loop_var()
                .map(Expr::var)
                .ok_or_else(|| EditError::mismatch("conv1d", "loop `ii` is not nested in a loop"))?;
            let q = expand_dim(&p, &p.forward(&kernel.alloc)?, Expr::Int(TILE), var)?;
            let q = simplify(&q);
            lift_alloc(&q, &q.forward(&kernel.alloc)?)
        })?;
        let (q, data) = t.run("stage_data", || {
            let block = parent(&p.forward(&ii_loop)?, "loop `ii`")?;
            stage_mem(&p, &block, "y", "data_tile")
        })?;
        p = q;

        // ── Memories and instructions ──
        p = t.step("set_memory", || {
            let mut q = set_memory(&p, &p.forward(&at.y_alloc)?, Memory::DramStatic)?;
            for alloc in [&out.alloc, &kernel.alloc, &data.alloc] {
                q = set_memory(&q, &q.forward(alloc)?, Memory::RvmTile)?;
            }
            Ok(q)
        })?;
        p = t.step("replace_all", || {
            replace_all(&p, &["rvm_mzero", "rvm_mst", "rvm_mld", "rvm_mmasa"], &self.lib)
        })?;

        // ── Clean-up ──
        p = t.step("unroll_ioi", || {
            let mut q = p.clone();
            for _ in 0..3 {
                q = unroll_loop(&q, &q.find_loop("ioi")?)?;
            }
            Ok(simplify(&q))
        })?;
        p = t.step("unroll_kernel_tile", || unroll_buffer(&p, &p.forward(&kernel.alloc)?, 0))?;
        p = t.step("reuse_kernel_tile", || {
            reuse_buffer(&p, &p.find_alloc("kernel_tile_0")?, &p.find_alloc("kernel_tile_3")?)
        })?;
        p = t.step("unroll_out_tile", || unroll_buffer(&p, &p.find_alloc("out_tile")?, 0))?;

        Ok((p, t))
    }
}
