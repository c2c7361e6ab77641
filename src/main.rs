use clap::{Parser, Subcommand, ValueEnum};
use kiln::jit::{AArch64, Arm32, Backend, Budget, CompileStatus, JitCompiler, TaskQuota, Unlimited};
use kiln::{CompiledCode, JitConfig, Program, UnitId};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum BackendArg {
    #[default]
    Arm32,
    Aarch64,
}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Incremental JIT compiler for stack bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one unit of a program and print the code
    Compile {
        /// The program file (TOML)
        file: PathBuf,

        /// Unit to compile (defaults to the first unit)
        #[arg(long)]
        unit: Option<String>,

        /// Target instruction set
        #[arg(long, value_enum, default_value = "arm32")]
        backend: BackendArg,

        /// Compiler config file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Suspend after every N task steps and resume until done
        #[arg(long, value_name = "N")]
        slice: Option<u32>,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,

        /// Trace compiler events on stderr
        #[arg(long)]
        trace: bool,
    },
    /// Parse a program and print its units
    Check {
        /// The program file (TOML)
        file: PathBuf,
    },
}

fn init_tracing(trace: bool) {
    let default = if trace { "kiln=trace" } else { "kiln=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_program(path: &Path) -> Result<Program, String> {
    let source =
        fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    kiln::parse_program(&source).map_err(|e| format!("{}: {}", path.display(), e))
}

fn select_unit(program: &Program, name: Option<&str>) -> Result<UnitId, String> {
    match name {
        Some(name) => program
            .by_name(name)
            .map(|unit| unit.id())
            .ok_or_else(|| format!("no unit named '{}'", name)),
        None => program
            .units()
            .first()
            .map(|unit| unit.id())
            .ok_or_else(|| "program has no units".to_string()),
    }
}

/// Compile `unit`, resuming after every suspension. Returns the code and
/// the number of suspensions.
fn compile_unit<B: Backend>(
    backend: B,
    config: JitConfig,
    program: &Program,
    unit: UnitId,
    slice: Option<u32>,
) -> Result<(CompiledCode, u32), String> {
    let mut jit = JitCompiler::new(backend, config).map_err(|e| e.to_string())?;
    let mut suspensions = 0;
    loop {
        let mut quota;
        let mut unlimited = Unlimited;
        let budget: &mut dyn Budget = match slice {
            Some(steps) => {
                quota = TaskQuota::new(steps);
                &mut quota
            }
            None => &mut unlimited,
        };
        match jit.compile_with(program, unit, budget) {
            Ok(CompileStatus::Compiled(code)) => return Ok((code, suspensions)),
            Ok(CompileStatus::Suspended) => suspensions += 1,
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn run_compile(
    file: &Path,
    unit: Option<&str>,
    backend: BackendArg,
    config: JitConfig,
    slice: Option<u32>,
    json: bool,
) -> Result<(), String> {
    let program = load_program(file)?;
    let unit = select_unit(&program, unit)?;
    let (code, suspensions) = match backend {
        BackendArg::Arm32 => compile_unit(Arm32, config, &program, unit, slice)?,
        BackendArg::Aarch64 => compile_unit(AArch64, config, &program, unit, slice)?,
    };

    if json {
        let listing = serde_json::to_string_pretty(&code.listing()).map_err(|e| e.to_string())?;
        println!("{}", listing);
    } else {
        print!("{}", code);
        let stats = code.stats();
        println!(
            "tasks: {}, suspensions: {}, literal flushes: {}, inlined calls: {}",
            stats.tasks_completed, suspensions, stats.literal_flushes, stats.inlined_calls
        );
    }
    Ok(())
}

fn run_check(file: &Path) -> Result<(), String> {
    let program = load_program(file)?;
    for unit in program.units() {
        println!(
            "{} {}: {} bytes, {} locals, {} blocks{}{}",
            unit.id(),
            unit.name(),
            unit.code_len(),
            unit.max_locals(),
            unit.branch_targets().len() + 1,
            if unit.has_loops() { ", loops" } else { "" },
            if unit.can_throw() { ", throws" } else { "" },
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            file,
            unit,
            backend,
            config,
            slice,
            json,
            trace,
        } => {
            let config = match config {
                Some(path) => match JitConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => JitConfig::default(),
            };
            init_tracing(trace || config.trace);
            run_compile(&file, unit.as_deref(), backend, config, slice, json)
        }
        Commands::Check { file } => {
            init_tracing(false);
            run_check(&file)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
