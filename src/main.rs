use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use armjit::config::JitConfig;
use armjit::jit::JitCache;
use armjit::workload::{Workload, WorkloadReport, WorkloadSettings};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "armjit")]
#[command(about = "Block cache for a GBA dynamic recompiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the cache with a synthetic guest workload and print statistics
    Simulate {
        /// Cache configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Number of guest events to generate
        #[arg(long, default_value = "100000")]
        steps: u64,

        /// Workload RNG seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Override the number of cache slots
        #[arg(long)]
        capacity: Option<usize>,

        /// Override the executable buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Fraction of events that are guest stores
        #[arg(long, default_value = "0.2")]
        write_ratio: f64,

        /// Number of distinct code sites
        #[arg(long, default_value = "8192")]
        code_sites: usize,

        /// Output format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormatArg,

        /// Trace every slot free and entry event
        #[arg(long)]
        trace_jit: bool,
    },
    /// Validate a cache configuration file
    CheckConfig {
        /// The configuration file to check
        file: PathBuf,
    },
}

fn init_tracing(trace_jit: bool) {
    let default = if trace_jit { "armjit=trace" } else { "armjit=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            steps,
            seed,
            capacity,
            buffer_size,
            write_ratio,
            code_sites,
            format,
            trace_jit,
        } => {
            let mut jit_config = match config {
                Some(path) => match JitConfig::load(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => JitConfig::default(),
            };
            jit_config.enabled = true;
            jit_config.trace |= trace_jit;
            if let Some(capacity) = capacity {
                jit_config.capacity = capacity;
            }
            if let Some(buffer_size) = buffer_size {
                jit_config.buffer_size = buffer_size;
            }
            init_tracing(jit_config.trace);

            let settings = WorkloadSettings {
                steps,
                seed,
                write_ratio,
                code_sites,
                ..Default::default()
            };

            match simulate(jit_config, settings) {
                Ok((report, secs)) => print_report(&report, secs, format),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::CheckConfig { file } => match JitConfig::load(&file) {
            Ok(config) => {
                println!(
                    "{}: ok ({} slots x {} bytes, sweep frees {})",
                    file.display(),
                    config.capacity,
                    config.buffer_size,
                    config.eviction_batch()
                );
            }
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}

fn simulate(
    config: JitConfig,
    settings: WorkloadSettings,
) -> Result<(WorkloadReport, f64), armjit::JitError> {
    let mut cache = JitCache::new(config)?;
    cache.reset()?;

    let start = Instant::now();
    let report = Workload::new(settings).run(&mut cache)?;
    Ok((report, start.elapsed().as_secs_f64()))
}

fn print_report(report: &WorkloadReport, secs: f64, format: OutputFormatArg) {
    match format {
        OutputFormatArg::Json => {
            let value = serde_json::json!({
                "report": report,
                "elapsed_secs": secs,
            });
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("error: {}", e),
            }
        }
        OutputFormatArg::Human => {
            let stats = &report.stats;
            println!("steps          {}", report.steps);
            println!("fetches        {}", report.fetches);
            println!("stores         {}", report.stores);
            println!("translations   {}", report.translations);
            println!("live blocks    {}", report.live_blocks);
            println!("hits / misses  {} / {}", stats.hits, stats.misses);
            println!("sweeps         {} ({} evicted)", stats.sweeps, stats.evicted);
            println!(
                "invalidations  {} ({} fast-path skips, {} scans, {} blocks freed)",
                stats.invalidations, stats.fast_path_skips, stats.full_scans, stats.invalidated_blocks
            );
            println!("self-modified  {}", report.self_modified);
            println!("elapsed        {:.3}s", secs);
        }
    }
}
