use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;

use nestsched::diag::ErrorRenderLevel;
use nestsched::state::DebugMask;
use nestsched::{eval, printer, workload, Schedule, ScheduleConfig, Trace};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Ir,
    Trace,
    Fingerprint,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum MaskArg {
    All,
    None,
    Sref,
    Flags,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum RenderArg {
    Detail,
    Fast,
    None,
}

#[derive(Parser, Debug)]
#[command(
    name = "nestsched",
    version,
    about = "Loop-nest scheduling engine: replays schedule traces over built-in workloads"
)]
struct Cli {
    /// Built-in workload (elementwise_chain, scale_1d, matmul, reduce_sum,
    /// reduce_max, norm_chain)
    workload: String,

    /// JSON trace to replay
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Sampler seed
    #[arg(long)]
    seed: Option<u64>,

    /// Verification after every rewrite
    #[arg(long, value_enum, default_value_t = MaskArg::All)]
    debug_mask: MaskArg,

    /// Error verbosity
    #[arg(long, value_enum, default_value_t = RenderArg::Detail)]
    error_render: RenderArg,

    /// What to print
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Compare outputs with the unscheduled program on random inputs
    #[arg(long)]
    check: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn config_of(cli: &Cli) -> ScheduleConfig {
    let debug_mask = match cli.debug_mask {
        MaskArg::All => DebugMask::ALL,
        MaskArg::None => DebugMask::NONE,
        MaskArg::Sref => DebugMask::VERIFY_SREF_TREE,
        MaskArg::Flags => DebugMask::VERIFY_CACHED_FLAGS,
    };
    let error_render_level = match cli.error_render {
        RenderArg::Detail => ErrorRenderLevel::Detail,
        RenderArg::Fast => ErrorRenderLevel::Fast,
        RenderArg::None => ErrorRenderLevel::None,
    };
    ScheduleConfig {
        seed: cli.seed,
        debug_mask,
        error_render_level,
    }
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    // ── Load workload ──
    let Some(program) = workload::by_name(&cli.workload) else {
        eprintln!(
            "nestsched: error: unknown workload '{}' (expected one of {})",
            cli.workload,
            workload::BUILTIN.join(", ")
        );
        std::process::exit(2);
    };
    info!("workload {}", program.name);

    // ── Read trace ──
    let trace = match &cli.trace {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("nestsched: error: {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            };
            match Trace::from_json(&text) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("nestsched: error: {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            }
        }
        None => Trace::new(),
    };
    debug!("{} trace records", trace.len());

    // ── Replay ──
    let mut sch = Schedule::new(&program, config_of(&cli));
    if let Err(e) = trace.apply_to(&mut sch) {
        eprintln!("nestsched: error: {}", e);
        std::process::exit(1);
    }

    // ── Check ──
    if cli.check {
        match eval::equivalent(&program, sch.program(), cli.seed.unwrap_or(0)) {
            Ok(true) => info!("outputs match the unscheduled program"),
            Ok(false) => {
                eprintln!("nestsched: error: scheduled program computes different outputs");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("nestsched: error: evaluation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    // ── Emit ──
    match cli.emit {
        EmitStage::Ir => print!("{}", printer::script(sch.program())),
        EmitStage::Trace => print!("{}", sch.trace()),
        EmitStage::Fingerprint => println!("{}", printer::fingerprint(sch.program())),
    }
}
