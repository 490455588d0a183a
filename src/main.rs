//! Kernrun - run compute kernels on the CPU
//!
//! # Usage
//!
//! ```bash
//! # Fill a buffer on 4 workers over a 16x1x1 grid
//! kernrun run --kernel fill --workers 4 --groups 16,1,1
//!
//! # Time 100 iterations of the barrier kernel
//! kernrun run --kernel sum --groups 256,1,1 --iterations 100
//!
//! # Show runtime constants, builtin kernels and exported C entry points
//! kernrun info
//! ```

mod logging;

use std::process;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use kernrun_runtime::abi::{
    MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT, REQUIRED_MEMORY_ALIGNMENT, SIMD_WIDTH,
};
use kernrun_runtime::config::{QUEUE_DEPTH_ENV, WORKERS_ENV};
use kernrun_runtime::kernels::{ClearImageKernel, FillKernel, WorkgroupSumKernel};
use kernrun_runtime::plugin_impl;
use kernrun_runtime::{allocate_buffer, allocate_image_rgba, PoolConfig, Program, WorkerPool};

#[derive(Parser)]
#[command(name = "kernrun")]
#[command(version = "0.1.0")]
#[command(about = "Kernrun - CPU compute kernel runtime", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a builtin kernel through the worker pool and verify its output
    Run {
        /// Kernel to run
        #[arg(long, value_enum, default_value = "fill")]
        kernel: KernelKind,

        /// Worker threads (defaults to KERNRUN_WORKERS or the CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Workgroup grid as X,Y,Z
        #[arg(long, default_value = "16,1,1", value_parser = parse_groups)]
        groups: [u32; 3],

        /// Number of timed dispatches
        #[arg(short, long, default_value = "1")]
        iterations: u32,
    },

    /// Show runtime constants, builtin kernels and exported C entry points
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KernelKind {
    /// Write a constant into every word of a buffer
    Fill,
    /// Per-workgroup sums using control barriers
    Sum,
    /// Clear an RGBA8 image, one 8x8 tile per workgroup
    Clear,
}

impl KernelKind {
    fn name(self) -> &'static str {
        match self {
            KernelKind::Fill => "fill",
            KernelKind::Sum => "sum",
            KernelKind::Clear => "clear",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_level(logging::level_for_verbosity(cli.verbose));

    let result = match cli.command {
        Commands::Run {
            kernel,
            workers,
            groups,
            iterations,
        } => run_kernel(kernel, workers, groups, iterations),
        Commands::Info => show_info(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn parse_groups(s: &str) -> Result<[u32; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected X,Y,Z, got '{}'", s));
    }
    let mut groups = [0u32; 3];
    for (slot, part) in groups.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| format!("'{}' is not a workgroup count", part))?;
    }
    Ok(groups)
}

fn run_kernel(
    kernel: KernelKind,
    workers: Option<usize>,
    groups: [u32; 3],
    iterations: u32,
) -> Result<(), String> {
    let mut config = PoolConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(workers) = workers {
        config = config.with_workers(workers);
    }
    let pool = WorkerPool::new(config).map_err(|e| e.to_string())?;
    let iterations = iterations.max(1);
    let ngroups = groups.iter().map(|&n| n as usize).product::<usize>();

    log::info!(
        "running '{}' over {:?} on {} worker(s)",
        kernel.name(),
        groups,
        pool.workers()
    );

    let elapsed = match kernel {
        KernelKind::Fill => {
            let words = ngroups * FillKernel::WORKGROUP_SIZE as usize;
            let buffer = allocate_buffer(words * 4);
            let set = FillKernel::descriptor_set(&buffer.descriptor(), 0xC0FFEE);
            let program = FillKernel::program();
            // `buffer` outlives every dispatch; each one is waited on.
            let elapsed = unsafe { time_dispatches(&pool, &program, &set, groups, iterations) }?;
            if let Some(i) = buffer.to_u32_vec().iter().position(|&w| w != 0xC0FFEE) {
                return Err(format!("fill: word {} was not written", i));
            }
            elapsed
        }
        KernelKind::Sum => {
            let words = ngroups * WorkgroupSumKernel::WORKGROUP_SIZE as usize;
            let mut input = allocate_buffer(words * 4);
            let values: Vec<u32> = (0..words as u32).collect();
            input.write_u32s(&values);
            let output = allocate_buffer(ngroups * 4);
            let set = WorkgroupSumKernel::descriptor_set(&input.descriptor(), &output.descriptor());
            let program = WorkgroupSumKernel::program();
            let elapsed = unsafe { time_dispatches(&pool, &program, &set, groups, iterations) }?;
            if output.to_u32_vec() != WorkgroupSumKernel::reference(&values) {
                return Err("sum: workgroup totals do not match the reference".to_string());
            }
            elapsed
        }
        KernelKind::Clear => {
            if groups[2] != 1 {
                log::warn!("clear: ignoring Z dimension {}", groups[2]);
            }
            let groups = [groups[0], groups[1], 1];
            let image = allocate_image_rgba(
                groups[0] * ClearImageKernel::TILE,
                groups[1] * ClearImageKernel::TILE,
            );
            let rgba = 0xFF20_4080;
            let set = ClearImageKernel::descriptor_set(&image.descriptor(), rgba);
            let program = ClearImageKernel::program();
            let elapsed = unsafe { time_dispatches(&pool, &program, &set, groups, iterations) }?;
            for y in 0..image.height() {
                for x in 0..image.width() {
                    if image.texel(x, y) != Some(rgba) {
                        return Err(format!("clear: texel ({}, {}) was not written", x, y));
                    }
                }
            }
            elapsed
        }
    };

    let total_ms = elapsed.as_secs_f64() * 1000.0;
    println!(
        "[{}] kernel={} workers={} groups={}x{}x{} iterations={} total={:.3}ms mean={:.3}ms ok",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        kernel.name(),
        pool.workers(),
        groups[0],
        groups[1],
        groups[2],
        iterations,
        total_ms,
        total_ms / iterations as f64
    );
    Ok(())
}

/// Run `iterations` dispatches, each followed by a full wait.
///
/// # Safety
/// See [`WorkerPool::dispatch`]; the bindings only need to outlive this call.
unsafe fn time_dispatches(
    pool: &WorkerPool,
    program: &Program,
    descriptor_set: &[u8],
    groups: [u32; 3],
    iterations: u32,
) -> Result<Duration, String> {
    let start = Instant::now();
    for _ in 0..iterations {
        pool.dispatch(program, descriptor_set, groups)
            .map_err(|e| e.to_string())?;
        pool.wait().map_err(|e| e.to_string())?;
    }
    Ok(start.elapsed())
}

fn show_info() -> Result<(), String> {
    println!("Kernrun v0.1.0");
    println!("CPU compute kernel runtime\n");

    println!("Runtime:");
    println!("  Subgroup width           {} lanes", SIMD_WIDTH);
    println!("  Buffer alignment         {} bytes", MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT);
    println!("  Memory alignment         {} bytes", REQUIRED_MEMORY_ALIGNMENT);
    println!();

    println!("Builtin kernels:");
    println!("  fill   workgroup {}x1x1", FillKernel::WORKGROUP_SIZE);
    println!("  sum    workgroup {}x1x1, control barriers", WorkgroupSumKernel::WORKGROUP_SIZE);
    println!("  clear  workgroup {}x{}x1", ClearImageKernel::TILE, ClearImageKernel::TILE);
    println!();

    println!("C entry points:");
    for line in entry_point_lines()? {
        println!("  {}", line);
    }
    println!();

    println!("Environment:");
    println!("  {}          worker thread count", WORKERS_ENV);
    println!("  {}      pending dispatch limit", QUEUE_DEPTH_ENV);
    println!("  RUST_LOG                 log filter");
    Ok(())
}

/// One line per exported symbol, resolved through the plugin registry.
fn entry_point_lines() -> Result<Vec<String>, String> {
    let registry = plugin_impl::registry().map_err(|e| e.to_string())?;
    let lines = registry
        .symbols()
        .map(|symbol| {
            let owner = registry.owner(symbol.name).unwrap_or("?");
            format!("{:<32} {:p}  ({})", symbol.name, symbol.addr, owner)
        })
        .collect();
    Ok(lines)
}
