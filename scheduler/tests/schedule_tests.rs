// End-to-end tests for the conv1d schedule and the `lsc` binary.
//
// Uses programs/conv1d.lp, the unscheduled 1-D convolution, and checks the
// intermediate output tile, the final instruction-level version, the
// generated C, and the CLI surfaces (ir, json, trace, c).

use std::path::{Path, PathBuf};
use std::process::Command;

use lsc::codegen::emit_c;
use lsc::edit::{reorder_loops, tile_loops};
use lsc::instr::InstrLibrary;
use lsc::proc::Proc;
use lsc::recipes::{autolift_alloc, fission_as_much_as_possible, AutoLift};
use lsc::schedule::{fuse_all, Conv1dSchedule};
use lsc::stage::stage_mem;

// ── Test helpers ────────────────────────────────────────────────────────────

fn lsc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_lsc"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn conv1d_path() -> PathBuf {
    project_root().join("programs").join("conv1d.lp")
}

fn conv1d() -> Proc {
    let src = std::fs::read_to_string(conv1d_path()).expect("read conv1d.lp");
    Proc::parse(&src).expect("conv1d.lp must parse")
}

fn scheduled() -> Proc {
    let lib = InstrLibrary::rvm().unwrap();
    Conv1dSchedule::new(lib).run(&conv1d()).unwrap().0
}

fn run_lsc(args: &[&str]) -> std::process::Output {
    Command::new(lsc_binary())
        .args(args)
        .output()
        .expect("failed to run lsc")
}

// ── Library pipeline ────────────────────────────────────────────────────────

#[test]
fn output_tile_is_lifted_above_compute_loops() {
    let p = conv1d();
    let (i, j, c) = (
        p.find_loop("i").unwrap(),
        p.find_loop("j").unwrap(),
        p.find_loop("c").unwrap(),
    );
    let p = tile_loops(&p, &[(i.clone(), 4), (j, 4)], true).unwrap();
    let p = tile_loops(&p, &[(i, 4)], true).unwrap();
    let p = reorder_loops(&p, &p.find_loop("ioi").unwrap()).unwrap();

    let block = p.forward(&c).unwrap().expand(1, 0).unwrap();
    let (p, out) = stage_mem(&p, &block, "out", "out_tile").unwrap();
    assert!(out.load.is_none());
    assert!(out.store.is_some());
    let opts = AutoLift::new(64).deps(["ioi", "ii", "ji"]);
    let p = autolift_alloc(&p, &out.alloc, &opts).unwrap();
    let p = fission_as_much_as_possible(&p, &out.block).unwrap();
    let init = out.block.nodes()[0].clone();
    let p = fission_as_much_as_possible(&p, &init).unwrap();

    let alloc = p.forward(&out.alloc).unwrap();
    let decl = &alloc.stmt().unwrap().as_alloc().unwrap().decl;
    assert_eq!(decl.element_count(), Some(64));
    assert!(p.to_string().contains("out_tile: i32[4, 4, 4] @ DRAM;"));

    let jo = p.find_loop("jo").unwrap();
    let body = jo.body();
    assert_eq!(alloc.parent(), Some(jo.clone()));
    assert_eq!(body[0], alloc);
    assert_eq!(body.len(), 4, "{p}");
    assert!(body[1..].iter().all(|n| n.loop_var() == Some("ioi")));
}

#[test]
fn conv1d_schedule_ends_on_instructions() {
    let p = scheduled();
    let ir = p.to_string();
    assert_eq!(p.name(), "conv1d_tile_lt_kw");
    assert!(!ir.contains("for ioi"), "{ir}");
    assert!(!ir.contains("kernel_tile_3"), "{ir}");
    for alloc in [
        "out_tile_0: i32[4, 4] @ RVM_TILE;",
        "out_tile_3: i32[4, 4] @ RVM_TILE;",
        "kernel_tile_0: i32[4, 4] @ RVM_TILE;",
        "kernel_tile_2: i32[4, 4] @ RVM_TILE;",
        "data_tile: i32[4, 4] @ RVM_TILE;",
        "y: i32[4, 4] @ DRAM_STATIC;",
    ] {
        assert!(ir.contains(alloc), "missing `{alloc}` in\n{ir}");
    }
    assert!(ir.contains("rvm_mzero(out_tile_0[0:4, 0:4]);"), "{ir}");
    assert!(
        ir.contains("rvm_mmasa(out_tile_3[0:4, 0:4], data_tile[0:4, 0:4], kernel_tile_0[0:4, 0:4]);"),
        "{ir}"
    );
    assert_eq!(ir.matches("rvm_mmasa(").count(), 4);
    assert_eq!(ir.matches("rvm_mst(").count(), 4);
}

#[test]
fn conv1d_trace_is_monotonic_and_reproducible() {
    let lib = InstrLibrary::rvm().unwrap();
    let sched = Conv1dSchedule::new(lib);
    let (p1, t1) = sched.run(&conv1d()).unwrap();
    let (p2, t2) = sched.run(&conv1d()).unwrap();

    assert_eq!(t1.records.len(), 22);
    assert_eq!(t1.records[0].step, "rename");
    assert_eq!(t1.records.last().unwrap().step, "unroll_out_tile");
    for pair in t1.records.windows(2) {
        assert!(pair[0].version < pair[1].version, "{pair:?}");
        assert_ne!(pair[0].fingerprint, pair[1].fingerprint);
    }
    assert_eq!(t1.records.last().unwrap().version, p1.version());

    let f1: Vec<_> = t1.records.iter().map(|r| &r.fingerprint).collect();
    let f2: Vec<_> = t2.records.iter().map(|r| &r.fingerprint).collect();
    assert_eq!(f1, f2);
    assert_eq!(p1.fingerprint(), p2.fingerprint());
}

#[test]
fn conv1d_c_uses_every_tile() {
    let lib = InstrLibrary::rvm().unwrap();
    let code = emit_c(&scheduled(), &lib).unwrap();
    assert_eq!(code.peak_tiles, 8);
    let c = &code.c_source;
    assert!(c.contains("void conv1d_tile_lt_kw(int32_t* data, int32_t* kernels, int32_t* out) {"));
    assert!(c.contains("#define out_tile_0 \"m7\""), "{c}");
    assert!(c.contains("static int32_t y[16];"), "{c}");
    assert!(c.contains(
        "asm volatile(\"mmasa.w \"out_tile_0\", \"data_tile\", \"kernel_tile_0);"
    ), "{c}");
    assert_eq!(c.matches("#define").count(), c.matches("#undef").count());
}

#[test]
fn fuse_all_leaves_conv1d_unchanged() {
    let p = conv1d();
    let (q, trace) = fuse_all(&p).unwrap();
    assert!(q.same_version(&p));
    assert_eq!(trace.records.len(), 1);
}

// ── CLI ─────────────────────────────────────────────────────────────────────

#[test]
fn cli_prints_ir_by_default() {
    let path = conv1d_path();
    let out = run_lsc(&[path.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert_eq!(stdout, conv1d().to_string());
}

#[test]
fn cli_emits_trace_json() {
    let path = conv1d_path();
    let out = run_lsc(&["--schedule", "conv1d", "--emit", "trace", path.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let records = json["records"].as_array().unwrap();
    assert_eq!(records.len(), 22);
    assert_eq!(records[0]["step"], "rename");
    assert_eq!(records[0]["fingerprint"].as_str().unwrap().len(), 64);
}

#[test]
fn cli_emits_c_to_file() {
    let path = conv1d_path();
    let dest = std::env::temp_dir().join(format!("lsc_conv1d_{}.c", std::process::id()));
    let out = run_lsc(&[
        "--schedule",
        "conv1d",
        "--emit",
        "c",
        "-o",
        dest.to_str().unwrap(),
        path.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let c = std::fs::read_to_string(&dest).unwrap();
    let _ = std::fs::remove_file(&dest);
    assert!(c.starts_with("#include <stdint.h>"));
    assert!(c.contains("asm volatile(\"mld.w "));
}

#[test]
fn cli_json_is_the_procedure() {
    let path = conv1d_path();
    let out = run_lsc(&["--emit", "json", path.to_str().unwrap()]);
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["name"], "generic_conv1d");
    assert_eq!(json["params"].as_array().unwrap().len(), 3);
}

#[test]
fn cli_exit_codes() {
    let missing = run_lsc(&["/nonexistent/conv1d.lp"]);
    assert_eq!(missing.status.code(), Some(2));

    let bad = std::env::temp_dir().join(format!("lsc_bad_{}.lp", std::process::id()));
    std::fs::write(&bad, "proc broken( {").unwrap();
    let parse = run_lsc(&[bad.to_str().unwrap()]);
    let _ = std::fs::remove_file(&bad);
    assert_eq!(parse.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&parse.stderr).contains("parse error"));

    let plain = std::env::temp_dir().join(format!("lsc_plain_{}.lp", std::process::id()));
    std::fs::write(&plain, "proc f(a: i32[4] @ DRAM) { for i in seq(0, 4) { a[i] = 0; } }")
        .unwrap();
    let sched = run_lsc(&["--schedule", "conv1d", plain.to_str().unwrap()]);
    let _ = std::fs::remove_file(&plain);
    assert_eq!(sched.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&sched.stderr).contains("schedule error"));
}
