//! shardmem - Command Line Interface
//!
//! ## Commands
//!
//! - `plan` - Print the partition plan for a region
//! - `devices` - Show host capabilities and accelerator device count
//! - `reshard` - Run one rank of a collective load/store over record files

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use shardmem::{
    determine_partition_plan, device_count, format_bytes, init_production_logging,
    init_simple_logging, parse_memory_string, Context, HostCapabilities, MemoryLocation,
    MemoryType, RendezvousToken, ShardMemConfig,
};
use tracing::{error, info};

/// Collectively managed, rank-sharded memory
#[derive(Parser, Debug)]
#[command(name = "shardmem")]
#[command(about = "Rank-sharded distributed memory with sharded file load/store", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.shardmem/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the partition plan for a region
    Plan {
        /// Total size (e.g. "1GiB", "1000", "64MB")
        #[arg(short, long)]
        total: String,

        /// Partition unit size
        #[arg(short, long)]
        granularity: String,

        /// Number of ranks
        #[arg(short, long)]
        world_size: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show host capabilities and accelerator device count
    Devices,

    /// Run one rank of a collective load followed by a store
    Reshard {
        /// Rank of this process
        #[arg(short, long)]
        rank: usize,

        /// Number of ranks
        #[arg(short, long)]
        world_size: usize,

        /// Rendezvous token; rank 0 generates and prints one when omitted
        #[arg(short, long)]
        token: Option<String>,

        /// Record size in the input files
        #[arg(short, long)]
        entry_size: String,

        /// Record window in memory (defaults to the input record size)
        #[arg(long)]
        memory_entry_size: Option<String>,

        /// Record size written to the output (defaults to the memory window)
        #[arg(long)]
        output_entry_size: Option<String>,

        /// Input record files, read in order as one sequence
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<PathBuf>,

        /// Output file shared by all ranks
        #[arg(short, long)]
        output: PathBuf,

        /// Memory type (continuous, chunked, distributed)
        #[arg(short, long, default_value = "chunked")]
        memory_type: String,

        /// Log level (trace, debug, info, warn, error); defaults to the
        /// configured `logging.level`
        #[arg(short, long)]
        log_level: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            total,
            granularity,
            world_size,
            json,
        } => {
            // No logging for plan (pure display)
            cmd_plan(&total, &granularity, world_size, json)?;
        }

        Commands::Devices => {
            init_simple_logging("warn")?;
            cmd_devices()?;
        }

        Commands::Reshard {
            rank,
            world_size,
            token,
            entry_size,
            memory_entry_size,
            output_entry_size,
            files,
            output,
            memory_type,
            log_level,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let level = resolve_log_level(log_level, &config);
            init_production_logging(&level, config.logging.log_dir.clone())?;

            let file_entry_size = parse_memory_string(&entry_size)?;
            let memory_entry_size = match memory_entry_size {
                Some(s) => parse_memory_string(&s)?,
                None => file_entry_size,
            };
            let output_entry_size = match output_entry_size {
                Some(s) => parse_memory_string(&s)?,
                None => memory_entry_size,
            };

            let job = ReshardJob {
                rank,
                world_size,
                token,
                file_entry_size,
                memory_entry_size,
                output_entry_size,
                files,
                output,
                memory_type: memory_type.parse()?,
            };
            if let Err(e) = cmd_reshard(config, job) {
                error!(error = %e, "Reshard failed");
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Explicit config file, else the default file when present, else defaults
/// with `SHARDMEM_*` overrides.
/// The command line flag wins over the configured level
fn resolve_log_level(flag: Option<String>, config: &ShardMemConfig) -> String {
    flag.unwrap_or_else(|| config.logging.level.clone())
}

fn load_config(path: Option<&Path>) -> Result<ShardMemConfig> {
    if let Some(path) = path {
        return ShardMemConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    let default_path = ShardMemConfig::default_path()?;
    if default_path.exists() {
        return ShardMemConfig::load(&default_path).context("Failed to load default config");
    }

    Ok(ShardMemConfig::from_env()?)
}

fn cmd_plan(total: &str, granularity: &str, world_size: usize, json: bool) -> Result<()> {
    let total = parse_memory_string(total)?;
    let granularity = parse_memory_string(granularity)?;
    let plan = determine_partition_plan(total, granularity, world_size)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("\n{}", "Partition Plan".bold().cyan());
    println!("{}", "==============".cyan());
    println!("  Total:        {} ({} bytes)", format_bytes(total), total);
    println!("  Granularity:  {} bytes", granularity);
    println!("  World size:   {}", world_size);
    println!(
        "  Uniform:      {}",
        if plan.is_uniform() {
            "yes".green()
        } else {
            "no".yellow()
        }
    );

    println!("\n{}", "Ranks:".bold());
    for (rank, entry) in plan.entries().iter().enumerate() {
        println!(
            "  {:>4}  offset {:>14}  size {:>14}  ({})",
            rank,
            entry.offset,
            entry.size,
            format_bytes(entry.size)
        );
    }
    println!();

    Ok(())
}

fn cmd_devices() -> Result<()> {
    let caps = HostCapabilities::detect();

    println!("\n{}", "Host Capabilities".bold().cyan());
    println!("{}", "=================".cyan());
    println!("  Host:         {}", caps.host_name);
    println!("  OS / Arch:    {} / {}", caps.os, caps.arch);
    println!("  CPU Cores:    {}", caps.cpu_cores);
    println!("  RAM:          {}", format_bytes(caps.ram_bytes));

    match device_count() {
        Ok(count) => println!("  Devices:      {}", count.to_string().green()),
        Err(e) => println!("  Devices:      {} ({})", "query failed".red(), e),
    }
    println!();

    Ok(())
}

struct ReshardJob {
    rank: usize,
    world_size: usize,
    token: Option<String>,
    file_entry_size: u64,
    memory_entry_size: u64,
    output_entry_size: u64,
    files: Vec<PathBuf>,
    output: PathBuf,
    memory_type: MemoryType,
}

fn cmd_reshard(config: ShardMemConfig, job: ReshardJob) -> Result<()> {
    let ctx = Context::new(config)?;

    let token: RendezvousToken = match (&job.token, job.rank) {
        (Some(text), _) => text.parse()?,
        (None, 0) => {
            let token = ctx.create_unique_id()?;
            println!("🔑 Rendezvous token (pass to every other rank with --token):");
            println!("   {}", token.to_string().bold());
            token
        }
        (None, _) => bail!("Ranks other than 0 need --token"),
    };

    println!(
        "🤝 Joining communicator as rank {}/{}...",
        job.rank, job.world_size
    );
    let comm = ctx
        .create_communicator(&token, job.rank, job.world_size)
        .context("Rendezvous failed")?;

    let mut records = 0u64;
    for path in &job.files {
        let len = std::fs::metadata(path)
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len();
        records += len / job.file_entry_size;
    }
    let Some(total) = records.checked_mul(job.memory_entry_size) else {
        bail!("{} records of {} bytes overflow the address space", records, job.memory_entry_size);
    };
    info!(records, total, "Sized allocation from input files");

    let handle = ctx.malloc(
        total,
        comm,
        job.memory_type,
        MemoryLocation::Host,
        job.memory_entry_size,
    )?;

    ctx.load_from_file(
        handle,
        0,
        job.memory_entry_size,
        job.file_entry_size,
        &job.files,
    )?;
    let local = ctx.get_local_memory(handle)?;
    println!(
        "📥 Loaded {} records, local shard {} at offset {}",
        records,
        format_bytes(local.size),
        local.offset
    );

    ctx.barrier(comm)?;
    ctx.store_to_file(
        handle,
        0,
        job.memory_entry_size,
        job.output_entry_size,
        &job.output,
    )?;
    println!("📤 Stored into {}", job.output.display());

    ctx.free(handle)?;
    ctx.destroy_communicator(comm)?;

    println!("\n✅ Rank {} finished", job.rank);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn reshard_args(extra: &[&str]) -> Vec<String> {
        let base = [
            "shardmem", "reshard", "-r", "0", "-w", "2", "-e", "8", "-f", "in.bin", "-o",
            "out.bin",
        ];
        base.iter().chain(extra).map(|s| s.to_string()).collect()
    }

    fn parsed_level(cli: Cli) -> Option<String> {
        match cli.command {
            Commands::Reshard { log_level, .. } => log_level,
            other => panic!("expected reshard, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_level_falls_back_to_config() {
        let mut config = ShardMemConfig::default();
        config.logging.level = "debug".to_string();

        let cli = Cli::try_parse_from(reshard_args(&[])).unwrap();
        let flag = parsed_level(cli);
        assert_eq!(flag, None);
        assert_eq!(resolve_log_level(flag, &config), "debug");

        let cli = Cli::try_parse_from(reshard_args(&["-l", "trace"])).unwrap();
        assert_eq!(resolve_log_level(parsed_level(cli), &config), "trace");
    }
}
