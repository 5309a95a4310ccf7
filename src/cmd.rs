//! CLI entrypoint and command dispatcher.
//!
//! Geometry options are global so they apply to every subcommand, and each one maps to an
//! optional field of [`PartialConfig`]. An option left off the command line leaves the value to
//! the environment or the config file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_cargo::style::CLAP_STYLING;
use lib_blockbuf::ProxyStats;

use crate::config::{self, AppConfig, PartialConfig};
use crate::transfer::{self, CopyOptions, DumpOptions};

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let app_config = config::load(build_partial_config(&cli)).context("loading config")?;

    match &cli.command {
        Command::Copy(cmd) => run_copy_command(&app_config, cmd),
        Command::Dump(cmd) => run_dump_command(&app_config, cmd),
    }
}

#[derive(Parser)]
#[command(about, version, styles = CLAP_STYLING, arg_required_else_help = true)]
struct Cli {
    #[arg(short, long, global = true, help = "Path to TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Device block size in bytes")]
    block_size: Option<usize>,

    #[arg(long, global = true, help = "Window size in bytes (a multiple of the block size)")]
    buffer_size: Option<usize>,

    #[arg(long, global = true, help = "Alignment of device locations in bytes (power of two)")]
    sector_align: Option<usize>,

    #[arg(long, global = true, help = "Alignment of memory buffers in bytes (power of two)")]
    buffer_align: Option<usize>,

    #[arg(long, global = true, help = "Always go through the window, even for large transfers")]
    no_direct_io: bool,

    #[arg(long, global = true, help = "Never load device data into the window")]
    no_fills: bool,

    #[arg(long, global = true, help = "Open files with O_DIRECT (Linux only)")]
    o_direct: bool,

    #[arg(long, global = true, help = "Bytes moved per read/write call")]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Copy bytes between files through the block buffer")]
    Copy(CopyCmd),

    #[command(about = "Hex dump a byte range of a file")]
    Dump(DumpCmd),
}

#[derive(Parser)]
struct CopyCmd {
    #[arg(help = "File to read from")]
    input: PathBuf,

    #[arg(help = "File to write to (created if missing)")]
    output: PathBuf,

    #[arg(long, default_value_t = 0, help = "Bytes to skip at the start of the input")]
    skip: u64,

    #[arg(long, default_value_t = 0, help = "Bytes to skip at the start of the output")]
    seek: u64,

    #[arg(long, help = "Bytes to copy [default: rest of the input]")]
    count: Option<u64>,
}

#[derive(Parser)]
struct DumpCmd {
    #[arg(help = "File to dump")]
    file: PathBuf,

    #[arg(long, default_value_t = 0, help = "First byte to dump")]
    offset: u64,

    #[arg(long, default_value_t = 256, help = "Bytes to dump")]
    length: u64,
}

fn build_partial_config(cli: &Cli) -> PartialConfig {
    // Flags map to None when absent so they never override the lower layers.
    PartialConfig {
        config_file: cli.config.clone(),
        block_size: cli.block_size,
        buffer_size: cli.buffer_size,
        sector_align: cli.sector_align,
        buffer_align: cli.buffer_align,
        direct_io: if cli.no_direct_io { Some(false) } else { None },
        fills: if cli.no_fills { Some(false) } else { None },
        o_direct: if cli.o_direct { Some(true) } else { None },
        chunk_size: cli.chunk_size,
    }
}

fn print_stats(label: &str, stats: &ProxyStats) {
    eprintln!("  {label}:");
    eprintln!(
        "    Fills: {}, flushes: {} ({} failed)",
        stats.fills, stats.flushes, stats.failed_flushes
    );
    eprintln!("    Direct reads: {}, direct writes: {}", stats.direct_reads, stats.direct_writes);
    eprintln!(
        "    Blocks read: {}, blocks written: {}, device seeks: {}",
        stats.blocks_read, stats.blocks_written, stats.device_seeks
    );
}

fn run_copy_command(config: &AppConfig, cmd: &CopyCmd) -> Result<ExitCode> {
    let options = CopyOptions {
        input: cmd.input.clone(),
        output: cmd.output.clone(),
        skip: cmd.skip,
        seek: cmd.seek,
        count: cmd.count,
    };

    let report = transfer::run_copy(config, &options).context("copy failed")?;

    eprintln!("Copied {} bytes", report.bytes);
    print_stats("Input", &report.input);
    print_stats("Output", &report.output);

    if let Some(count) = cmd.count
        && report.bytes < count
    {
        eprintln!("  WARNING: input ended {} bytes short of --count", count - report.bytes);
    }

    Ok(ExitCode::SUCCESS)
}

fn run_dump_command(config: &AppConfig, cmd: &DumpCmd) -> Result<ExitCode> {
    let options = DumpOptions { file: cmd.file.clone(), offset: cmd.offset, length: cmd.length };
    transfer::run_dump(config, &options).context("dump failed")?;
    Ok(ExitCode::SUCCESS)
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}
