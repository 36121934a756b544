//! bunchsync: pack script trees into a bunched bundle and unpack them again.

use anyhow::{Context, Result};
use bunchsync::config::Config;
use bunchsync::sources::collect_bundle;
use bunchsync::streaming::{pack_sources, receive_bundle, send_bundle, DirStore, MemoryStore};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, BufReader, BufWriter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bunchsync", version, about = "Compressed, out-of-order tolerant bundle transfer")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML config file
    #[arg(long, global = true, env = "BUNCHSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack built-in and mod client scripts into a bundle
    Pack {
        /// Built-in script tree, shipped under the `*builtin*` owner
        #[arg(long)]
        builtin: Option<PathBuf>,

        /// Mods directory; every `<mod>/client/` tree is shipped under the mod name
        #[arg(long)]
        mods: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compressed bytes per bunch
        #[arg(long)]
        bunch_size: Option<usize>,

        /// zstd compression level
        #[arg(long)]
        level: Option<i32>,

        /// Write bunches last-to-first
        #[arg(long)]
        reverse: bool,
    },

    /// Unpack a bundle into a destination directory
    Unpack {
        bundle: PathBuf,
        dest: PathBuf,

        /// Content byte quota for this transfer
        #[arg(long)]
        quota: Option<u64>,
    },

    /// List the records in a bundle without writing them anywhere
    Inspect {
        bundle: PathBuf,

        /// Print a JSON report
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectReport {
    bunches: u32,
    records: u64,
    content_bytes: u64,
    duplicates: u32,
    entries: Vec<InspectEntry>,
}

#[derive(Debug, Serialize)]
struct InspectEntry {
    key: String,
    len: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("bunchsync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bunchsync=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Pack {
            builtin,
            mods,
            output,
            bunch_size,
            level,
            reverse,
        } => {
            if let Some(bunch_size) = bunch_size {
                config.pack.bunch_size = bunch_size;
            }
            if let Some(level) = level {
                config.pack.level = level;
            }
            config.validate()?;
            if builtin.is_none() && mods.is_none() {
                anyhow::bail!("Nothing to pack: pass --builtin and/or --mods");
            }
            pack(&config, builtin.as_deref(), mods.as_deref(), output.as_deref(), reverse).await
        }
        Command::Unpack {
            bundle,
            dest,
            quota,
        } => {
            if let Some(quota) = quota {
                config.unpack.quota = quota;
            }
            unpack(&config, &bundle, &dest).await
        }
        Command::Inspect { bundle, json } => inspect(&config, &bundle, json).await,
    }
}

async fn pack(
    config: &Config,
    builtin: Option<&Path>,
    mods: Option<&Path>,
    output: Option<&Path>,
    reverse: bool,
) -> Result<()> {
    let sources = collect_bundle(builtin, mods)?;
    tracing::info!("Collected {} files", sources.len());

    let (mut bunches, stats) = pack_sources(&sources, config.packer_config())?;
    if reverse {
        bunches.reverse();
    }

    match output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_bundle(BufWriter::new(file), &bunches, &stats).await
        }
        None => write_bundle(BufWriter::new(tokio::io::stdout()), &bunches, &stats).await,
    }
}

async fn write_bundle<W: AsyncWrite + Unpin>(
    mut writer: W,
    bunches: &[bunchsync::Bunch],
    stats: &bunchsync::PackStats,
) -> Result<()> {
    send_bundle(&mut writer, bunches, stats).await
}

async fn open_bundle(path: &Path) -> Result<BufReader<tokio::fs::File>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

async fn unpack(config: &Config, bundle: &Path, dest: &Path) -> Result<()> {
    let mut reader = open_bundle(bundle).await?;
    let store = DirStore::new(dest)?;
    let unpacker = receive_bundle(&mut reader, store, config.unpack.quota).await?;

    let store = unpacker.into_store();
    for path in store.written() {
        tracing::debug!("Wrote {}", path.display());
    }
    tracing::info!(
        "Unpacked {} files into {}",
        store.written().len(),
        store.root().display()
    );
    Ok(())
}

async fn inspect(config: &Config, bundle: &Path, json: bool) -> Result<()> {
    let mut reader = open_bundle(bundle).await?;
    let unpacker = receive_bundle(&mut reader, MemoryStore::new(), config.unpack.quota).await?;

    let stats = unpacker.stats().clone();
    let store = unpacker.into_store();
    let entries = store
        .keys()
        .into_iter()
        .map(|key| InspectEntry {
            key: key.to_string(),
            len: store.get_key(key).map(<[u8]>::len).unwrap_or(0),
        })
        .collect();
    let report = InspectReport {
        bunches: stats.bunches,
        records: stats.records,
        content_bytes: stats.content_bytes,
        duplicates: stats.duplicates,
        entries,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &report.entries {
            println!("{:>10}  {}", entry.len, entry.key);
        }
        println!(
            "{} records, {} bytes, {} bunches",
            report.records, report.content_bytes, report.bunches
        );
    }
    Ok(())
}
