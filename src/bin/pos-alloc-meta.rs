//! Offline inspection of allocator metadata files.
//!
//! Opens the metadata files named by a config without any live I/O path
//! attached, so nothing is allocated or flushed.

use clap::{Parser, Subcommand};
use pos_allocator::{
    Allocator, AllocatorConfig, FileStore, MemMapper, MetaFile, MetaSection, RecordingFlusher,
    logging,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "pos-alloc-meta")]
#[command(about = "Inspect and patch allocator metadata files")]
struct Cli {
    /// Allocator config file (uses defaults if not specified)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the metadata directory from the config
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print bitmaps, tails, cursors, segment table and rebuild targets
    Info,

    /// Print the section layout of the main metadata file
    Layout,

    /// Dump one section to a file
    Dump {
        /// Section name (header, wb_lsid_bitmap, segment_bitmap,
        /// active_stripe_tail, current_ssd_lsid, segment_info,
        /// segment_invalid_count)
        section: String,

        /// Output file
        output: PathBuf,
    },

    /// Restore one section from a dump and store the result
    Restore {
        /// Section name
        section: String,

        /// Dump file written by `dump`
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => AllocatorConfig::load(path)?,
        None => AllocatorConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.meta.dir = dir;
    }
    logging::init(&config.logging)?;

    let allocator = open_existing(config)?;

    match cli.command {
        Commands::Info => {
            print!("{}", allocator.instant_meta_info());
            let metrics = allocator.metrics();
            println!(
                "segment utilization: {:.1}% ({} free, gc {:?})",
                metrics.segment_utilization(),
                metrics.free_segments,
                metrics.gc_mode
            );
            println!("write buffer utilization: {:.1}%", metrics.wb_utilization());
        }
        Commands::Layout => print!("{}", allocator.bitmap_layout()),
        Commands::Dump { section, output } => {
            let section = parse_section(&section)?;
            let file = dump_file(&output)?;
            allocator.get_meta(section, &file)?;
            info!(section = section.name(), path = %output.display(), "section dumped");
        }
        Commands::Restore { section, input } => {
            let section = parse_section(&section)?;
            let file = dump_file(&input)?;
            if !file.exists() {
                return Err(format!("{} does not exist", input.display()).into());
            }
            allocator.set_meta(section, &file)?;
            allocator.close()?;
            info!(section = section.name(), path = %input.display(), "section restored");
        }
    }

    Ok(())
}

/// Open the allocator without creating metadata files that are missing.
fn open_existing(config: AllocatorConfig) -> Result<Allocator, Box<dyn Error>> {
    let meta_file = FileStore::new(&config.meta.dir, &config.meta.file_name);
    if !meta_file.exists() {
        return Err(format!("{} does not exist", meta_file.path().display()).into());
    }
    let blks_per_stripe = config.geometry.blocks_per_stripe;
    let rebuild_file = FileStore::new(&config.meta.dir, &config.meta.rebuild_file_name);
    let allocator = Allocator::new(
        config,
        Arc::new(meta_file),
        Arc::new(rebuild_file),
        Arc::new(MemMapper::new(blks_per_stripe)),
        Arc::new(RecordingFlusher::new()),
    )?;
    Ok(allocator)
}

fn parse_section(name: &str) -> Result<MetaSection, Box<dyn Error>> {
    MetaSection::from_name(name).ok_or_else(|| format!("unknown section: {name}").into())
}

fn dump_file(path: &Path) -> Result<FileStore, Box<dyn Error>> {
    let name = path
        .file_name()
        .ok_or_else(|| format!("{} is not a file path", path.display()))?
        .to_string_lossy()
        .into_owned();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(FileStore::new(dir, name))
}
