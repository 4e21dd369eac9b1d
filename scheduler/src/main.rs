use clap::Parser;
use std::path::PathBuf;

use lsc::codegen::emit_c;
use lsc::instr::InstrLibrary;
use lsc::proc::Proc;
use lsc::schedule::{fuse_all, Conv1dSchedule, Trace};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ScheduleKind {
    None,
    FuseAll,
    Conv1d,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Ir,
    Json,
    Trace,
    C,
}

#[derive(Parser, Debug)]
#[command(
    name = "lsc",
    version,
    about = "Loop Schedule Composer — applies rewrite recipes to nested-loop procedures"
)]
struct Cli {
    /// Input procedure source file
    source: PathBuf,

    /// Recipe pipeline to apply
    #[arg(long, value_enum, default_value_t = ScheduleKind::None)]
    schedule: ScheduleKind,

    /// Output form
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log every recipe step
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    // ── Read and parse source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lsc: error: {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };
    let proc = match Proc::parse(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("lsc: parse error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!(proc = proc.name(), "parsed");

    let lib = match InstrLibrary::rvm() {
        Ok(lib) => lib,
        Err(e) => {
            eprintln!("lsc: error: instruction library: {}", e);
            std::process::exit(1);
        }
    };

    // ── Schedule ──
    let scheduled = match cli.schedule {
        ScheduleKind::None => Ok((proc, Trace::default())),
        ScheduleKind::FuseAll => fuse_all(&proc),
        ScheduleKind::Conv1d => Conv1dSchedule::new(lib.clone()).run(&proc),
    };
    let (proc, trace) = match scheduled {
        Ok(r) => r,
        Err(e) => {
            eprintln!("lsc: schedule error: {}", e);
            std::process::exit(1);
        }
    };

    // ── Emit ──
    let text = match cli.emit {
        EmitStage::Ir => proc.to_string(),
        EmitStage::Json => to_json(proc.def()),
        EmitStage::Trace => to_json(&trace),
        EmitStage::C => match emit_c(&proc, &lib) {
            Ok(code) => code.c_source,
            Err(e) => {
                eprintln!("lsc: codegen error: {}", e);
                std::process::exit(1);
            }
        },
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &text) {
                eprintln!("lsc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(s) => s + "\n",
        Err(e) => {
            eprintln!("lsc: error: serialization: {}", e);
            std::process::exit(1);
        }
    }
}
