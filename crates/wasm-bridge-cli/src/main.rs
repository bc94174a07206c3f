//! Command-line runner for the embedded WASM host bridge.
//!
//! This CLI provides tools for:
//! - Running a single exported function inside the bridge's memory budget
//! - Benchmarking call overhead
//! - Inspecting a module's imports and exports against the native import table
//!
//! Modules may be given as binary `.wasm` or text `.wat`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use wasm_host_bridge::{
    BoardHostFunctions, CallBenchmark, ImportKind, ModuleInstance, Runtime, RuntimeConfig, SimulatedBoard, Value,
    ValueKind,
};

#[derive(Parser)]
#[command(name = "wasm-bridge")]
#[command(author, version, about = "Embedded WASM host bridge runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Runtime sizing shared by every subcommand.
#[derive(Args)]
struct RuntimeArgs {
    /// JSON runtime configuration (flags below override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Heap arena size in bytes
    #[arg(long, global = true)]
    heap: Option<usize>,

    /// Guest execution stack in bytes
    #[arg(long, global = true)]
    stack: Option<usize>,

    /// Linear memory bound in bytes
    #[arg(long, global = true)]
    memory: Option<usize>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Fuel granted to each call
    #[arg(long, global = true)]
    fuel: Option<u64>,

    /// Register the simulated board imports (GPIO, timing, print)
    #[arg(long, global = true)]
    board: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and call one exported function
    Run {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Exported function to call
        function: String,

        /// Arguments, parsed against the function's parameter types
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,

        /// Print call statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call one exported function repeatedly and report timing
    Bench {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Exported function to call
        function: String,

        /// Arguments (32-bit parameters only)
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,

        /// Number of calls
        #[arg(short = 'n', long, default_value = "1000")]
        iterations: usize,
    },

    /// List a module's imports and exports without instantiating it
    Inspect {
        /// Module file (.wasm or .wat)
        module: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            module,
            function,
            args,
            json,
        } => cmd_run(&cli.runtime, module, function, args, json),

        Commands::Bench {
            module,
            function,
            args,
            iterations,
        } => cmd_bench(&cli.runtime, module, function, args, iterations),

        Commands::Inspect { module } => cmd_inspect(&cli.runtime, module),
    }
}

fn cmd_run(opts: &RuntimeArgs, module: PathBuf, function: String, args: Vec<String>, json: bool) -> Result<()> {
    let bytecode = read_module(&module)?;
    let (runtime, board) = build_runtime(opts)?;

    let mut instance = ModuleInstance::load_with_defaults(&runtime, &bytecode)
        .with_context(|| format!("Failed to load {}", module.display()))?;

    let values = parse_args(&instance, &function, &args)?;
    let stats = instance
        .invoke(&function, &values)
        .with_context(|| format!("Call to '{}' failed", function))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    match stats.result {
        Some(value) => println!("{} = {}", function, value),
        None => println!("{} returned", function),
    }
    println!("Time: {} us", stats.execution_time_us);
    if let Some(fuel) = stats.fuel_consumed {
        println!("Fuel: {}", fuel);
    }

    print_board_output(board.as_ref());
    println!("{}", runtime.memory_usage());
    Ok(())
}

fn cmd_bench(opts: &RuntimeArgs, module: PathBuf, function: String, args: Vec<String>, iterations: usize) -> Result<()> {
    if iterations == 0 {
        bail!("Iterations must be at least 1");
    }

    let bytecode = read_module(&module)?;
    let (runtime, board) = build_runtime(opts)?;

    let mut instance = ModuleInstance::load_with_defaults(&runtime, &bytecode)
        .with_context(|| format!("Failed to load {}", module.display()))?;

    let words = parse_args(&instance, &function, &args)?
        .into_iter()
        .map(|value| {
            value
                .to_word()
                .with_context(|| format!("Argument {} does not fit a 32-bit word", value))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(function = %function, iterations, "benchmarking");
    let bench = CallBenchmark::measure(&mut instance, &function, &words, iterations)
        .with_context(|| format!("Benchmark of '{}' failed", function))?;

    println!("Benchmark: {} x{}", function, iterations);
    println!("  {}", bench.summary());

    if let Some(board) = board {
        // Output from thousands of calls is noise; just report its size
        let captured = lock_board(&board).take_output();
        if !captured.is_empty() {
            println!("  guest printed {} bytes", captured.len());
        }
    }
    println!("{}", runtime.memory_usage());
    Ok(())
}

fn cmd_inspect(opts: &RuntimeArgs, module: PathBuf) -> Result<()> {
    let bytecode = read_module(&module)?;
    let (runtime, _board) = build_runtime(opts)?;

    let info = runtime
        .inspect(&bytecode)
        .with_context(|| format!("Failed to decode {}", module.display()))?;

    println!("Module: {}", module.display());
    println!("  Size: {} bytes", bytecode.len());
    match info.memory {
        Some(memory) => match memory.max_bytes {
            Some(max) => println!("  Memory: {} bytes (max {})", memory.min_bytes, max),
            None => println!("  Memory: {} bytes (no max)", memory.min_bytes),
        },
        None => println!("  Memory: none"),
    }

    println!("\nImports ({}):", info.imports.len());
    let mut unresolved = 0;
    for import in &info.imports {
        let kind = match &import.kind {
            ImportKind::Function(sig) => sig.to_string(),
            ImportKind::Memory => "memory".to_string(),
            ImportKind::Other => "other".to_string(),
        };
        let status = match runtime.check_import(import) {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                unresolved += 1;
                e.to_string()
            }
        };
        println!("  {}.{}: {} [{}]", import.module, import.name, kind, status);
    }

    println!("\nExports ({}):", info.exports.len());
    for export in &info.exports {
        println!("  {}: {}", export.name, export.signature);
    }

    if unresolved > 0 {
        warn!(unresolved, "module will not link against the current import table");
    }
    Ok(())
}

/// Build the runtime from `--config` plus overriding flags.
fn build_runtime(opts: &RuntimeArgs) -> Result<(Runtime, Option<Arc<Mutex<SimulatedBoard>>>)> {
    let mut config = match &opts.config {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(heap) = opts.heap {
        config = config.heap_size(heap);
    }
    if let Some(stack) = opts.stack {
        config = config.stack_size(stack);
    }
    if let Some(memory) = opts.memory {
        config = config.memory_size(memory);
    }
    if let Some(ms) = opts.timeout_ms {
        config = config.call_timeout_ms(ms);
    }
    if let Some(fuel) = opts.fuel {
        config = config.fuel_limit(fuel);
    }

    let runtime = Runtime::initialize(config).context("Failed to initialize runtime")?;

    let board = if opts.board {
        let board = SimulatedBoard::default().shared();
        BoardHostFunctions::register(&runtime, Arc::clone(&board)).context("Failed to register board imports")?;
        Some(board)
    } else {
        None
    };

    Ok((runtime, board))
}

fn read_module(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "wat") {
        return wat::parse_bytes(&bytes)
            .map(|wasm| wasm.into_owned())
            .with_context(|| format!("Failed to assemble {}", path.display()));
    }
    Ok(bytes)
}

/// Parse command-line arguments against the export's parameter types.
fn parse_args(instance: &ModuleInstance<'_>, function: &str, args: &[String]) -> Result<Vec<Value>> {
    let export = instance
        .exported_function(function)
        .with_context(|| format!("Module does not export '{}'", function))?;
    let params = &export.signature().params;

    if params.len() != args.len() {
        bail!(
            "'{}' takes {} argument(s) {}, got {}",
            function,
            params.len(),
            export.signature(),
            args.len()
        );
    }

    params
        .iter()
        .zip(args)
        .map(|(kind, text)| parse_value(*kind, text))
        .collect()
}

fn parse_value(kind: ValueKind, text: &str) -> Result<Value> {
    let value = match kind {
        ValueKind::I32 => match text.parse::<i32>() {
            Ok(v) => Value::I32(v),
            // Accept the unsigned range too
            Err(_) => Value::from_u32(text.parse::<u32>().with_context(|| format!("Invalid i32: {}", text))?),
        },
        ValueKind::I64 => Value::I64(text.parse().with_context(|| format!("Invalid i64: {}", text))?),
        ValueKind::F32 => Value::F32(text.parse().with_context(|| format!("Invalid f32: {}", text))?),
        ValueKind::F64 => Value::F64(text.parse().with_context(|| format!("Invalid f64: {}", text))?),
        other => bail!("Cannot pass a {} argument from the command line", other),
    };
    Ok(value)
}

fn lock_board(board: &Mutex<SimulatedBoard>) -> std::sync::MutexGuard<'_, SimulatedBoard> {
    board.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn print_board_output(board: Option<&Arc<Mutex<SimulatedBoard>>>) {
    let Some(board) = board else {
        return;
    };
    let output = lock_board(board).take_output();
    if !output.is_empty() {
        println!("--- board output ---");
        print!("{}", output);
        if !output.ends_with('\n') {
            println!();
        }
        println!("--------------------");
    }
}
