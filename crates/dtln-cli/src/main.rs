//! DTLN bridge command-line interface
//!
//! This CLI provides tools for:
//! - Denoising mono WAV or raw f32 PCM files through a denoiser module
//! - Benchmarking per-block latency against the real-time budget
//! - Inspecting a module's exports against the bridge ABI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dtln_bridge::runtime::{build_engine, inspect_module};
use dtln_bridge::{
    BridgeConfig, DeferredProcessor, DenoiseBridge, ImmediateProcessor, LatencyReport,
    LatencyStats, ShimReport, BLOCK_SIZE,
};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

mod audio;

#[derive(Parser)]
#[command(name = "dtln")]
#[command(author, version, about = "DTLN denoise bridge CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Denoise a mono WAV file, or raw little-endian f32 PCM for other extensions
    Denoise {
        /// Denoiser module (.wasm or .wat)
        #[arg(short, long)]
        module: PathBuf,

        /// Input file (.wav, or raw f32)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (.wav is written as 32-bit float, anything else as raw f32)
        #[arg(short, long)]
        output: PathBuf,

        /// JSON bridge config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use the real-time preset (substitute shims)
        #[arg(long)]
        realtime: bool,

        /// Process on a worker thread with one block of latency
        #[arg(long)]
        deferred: bool,
    },

    /// Measure per-block latency on random input
    Bench {
        /// Denoiser module (.wasm or .wat)
        #[arg(short, long)]
        module: PathBuf,

        /// Blocks to process
        #[arg(short, long, default_value = "1000")]
        blocks: usize,

        /// Stop after this many seconds (0 = no limit)
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// JSON bridge config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use the real-time preset (substitute shims)
        #[arg(long)]
        realtime: bool,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// List a module's exports and check the ABI
    Info {
        /// Denoiser module (.wasm or .wat)
        #[arg(short, long)]
        module: PathBuf,
    },
}

fn load_config(path: Option<&Path>, realtime: bool) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None if realtime => Ok(BridgeConfig::realtime()),
        None => Ok(BridgeConfig::default()),
    }
}

fn read_module(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read module {}", path.display()))
}

fn spawn_bridge(module: &Path, config: BridgeConfig) -> Result<DenoiseBridge> {
    let bytes = read_module(module)?;
    let mut bridge = DenoiseBridge::spawn(config, bytes)?;
    bridge.wait_ready().context("Module failed to load")?;
    info!(context = ?bridge.context(), "module ready");
    Ok(bridge)
}

fn denoise_deferred(bridge: DenoiseBridge, samples: &[f32]) -> Result<Vec<f32>> {
    let mut processor = DeferredProcessor::spawn(bridge)?;
    let mut output = Vec::with_capacity(samples.len() + BLOCK_SIZE);
    let mut starved = 0usize;

    // The lag is exactly one block, so one extra silent block flushes the
    // last real block out of the worker. Starved blocks come back as silence.
    let blocks = samples.len().div_ceil(BLOCK_SIZE) + 1;
    let mut block = [0.0f32; BLOCK_SIZE];
    for index in 0..blocks {
        let start = (index * BLOCK_SIZE).min(samples.len());
        let end = (start + BLOCK_SIZE).min(samples.len());
        block.fill(0.0);
        block[..end - start].copy_from_slice(&samples[start..end]);

        let result = processor.denoise(&block)?;
        if result.processor_starved {
            starved += 1;
        }
        if index > 0 {
            output.extend_from_slice(&result.samples);
        }
    }

    if starved > 0 {
        warn!(starved, "deferred processor missed block deadlines");
    }
    processor.stop();

    output.truncate(samples.len());
    Ok(output)
}

fn cmd_denoise(
    module: PathBuf,
    input: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    realtime: bool,
    deferred: bool,
) -> Result<()> {
    let config = load_config(config.as_deref(), realtime)?;
    let audio::Samples {
        data: samples,
        sample_rate,
    } = audio::read_samples(&input)?;
    info!(samples = samples.len(), ?sample_rate, "read input");

    let sample_rate = match sample_rate {
        Some(rate) if rate != config.sample_rate => {
            warn!(
                file = rate,
                model = config.sample_rate,
                "input sample rate differs from the model rate"
            );
            rate
        }
        Some(rate) => rate,
        None => config.sample_rate,
    };

    let bridge = spawn_bridge(&module, config)?;
    let start = Instant::now();
    let denoised = if deferred {
        denoise_deferred(bridge, &samples)?
    } else {
        let mut processor = ImmediateProcessor::new(bridge)?;
        processor.denoise(&samples)?
    };
    let elapsed = start.elapsed();

    audio::write_samples(&denoised, &output, sample_rate)?;

    println!(
        "Denoised {} samples ({} blocks) in {:.1} ms -> {}",
        samples.len(),
        samples.len().div_ceil(BLOCK_SIZE),
        elapsed.as_secs_f64() * 1000.0,
        output.display()
    );
    Ok(())
}

/// Most latency samples preallocated up front; larger runs grow the buffer.
const MAX_PREALLOCATED_BLOCKS: usize = 1 << 20;

fn stats_capacity(blocks: usize) -> usize {
    blocks.min(MAX_PREALLOCATED_BLOCKS)
}

#[derive(Serialize)]
struct BenchReport {
    module: String,
    sample_rate: u32,
    shims: Option<ShimReport>,
    latency: LatencyReport,
}

fn cmd_bench(
    module: PathBuf,
    blocks: usize,
    duration: u64,
    config: Option<PathBuf>,
    realtime: bool,
    format: String,
) -> Result<()> {
    if format != "text" && format != "json" {
        bail!("Invalid format: {}. Use text or json", format);
    }

    let config = load_config(config.as_deref(), realtime)?;
    let sample_rate = config.sample_rate;
    let budget = config.block_budget();
    let mut bridge = spawn_bridge(&module, config)?;

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let run_duration = (duration > 0).then(|| Duration::from_secs(duration));

    let mut rng = rand::thread_rng();
    let mut input = [0.0f32; BLOCK_SIZE];
    let mut output = [0.0f32; BLOCK_SIZE];
    let mut stats = LatencyStats::with_capacity(budget, stats_capacity(blocks));

    let handle = bridge.create()?;
    let start_time = Instant::now();
    for _ in 0..blocks {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if run_duration.is_some_and(|max| start_time.elapsed() >= max) {
            break;
        }

        for sample in input.iter_mut() {
            *sample = rng.gen_range(-0.5..0.5);
        }

        let start = Instant::now();
        let result = bridge.process(&handle, &input, &mut output);
        stats.record(start.elapsed());
        if let Err(e) = result {
            bridge.destroy(handle);
            return Err(e).context("Block processing failed");
        }
    }
    let shims = bridge.shim_report();
    bridge.destroy(handle);

    match format.as_str() {
        "json" => {
            let report = BenchReport {
                module: module.display().to_string(),
                sample_rate,
                shims,
                latency: stats.report(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("DTLN Block Benchmark");
            println!("====================");
            println!("Module:       {}", module.display());
            println!("Sample Rate:  {} Hz", sample_rate);
            println!("Budget:       {} us/block", budget.as_micros());
            if let Some(shims) = shims {
                println!(
                    "Shims:        {:?} (entropy {:?}, clock {:?})",
                    shims.context, shims.entropy, shims.clock
                );
            }
            println!();
            println!("{}", stats.summary());
        }
    }

    Ok(())
}

fn cmd_info(module: PathBuf) -> Result<()> {
    let config = BridgeConfig::default();
    let engine = build_engine(&config)?;
    let bytes = read_module(&module)?;
    let info = inspect_module(&engine, &bytes, &config.abi)?;

    println!("=== Module: {} ===\n", module.display());
    println!("Exported functions:");
    for name in &info.functions {
        println!("  {}", name);
    }
    println!();
    println!("Memory export:  {}", if info.has_memory { "yes" } else { "no" });
    println!(
        "Startup export: {}",
        if info.has_initialize { "yes" } else { "no" }
    );

    if !info.is_complete() {
        if !info.missing.is_empty() {
            println!("Missing:        {}", info.missing.join(", "));
        }
        bail!("module does not implement the denoiser ABI");
    }
    println!("ABI:            complete");
    Ok(())
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
        Commands::Denoise {
            module,
            input,
            output,
            config,
            realtime,
            deferred,
        } => cmd_denoise(module, input, output, config, realtime, deferred),

        Commands::Bench {
            module,
            blocks,
            duration,
            config,
            realtime,
            format,
        } => cmd_bench(module, blocks, duration, config, realtime, format),

        Commands::Info { module } => cmd_info(module),
    }
}
