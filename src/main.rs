//! Worldloom: command-line access to the feedback engine's standalone pieces
//!
//! Usage:
//!   worldloom apply-diff --base scene.txt --instructions edits.json
//!   worldloom memory export --store ~/.worldloom
//!   worldloom memory import backup.json --store ~/.worldloom
//!   worldloom memory reset --store ~/.worldloom
//!   worldloom config dump

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worldloom_core::{apply_diff, parse_instructions};
use worldloom_feedback::{FeedbackConfig, FileSlot, KvSlot, MemorySnapshot};

#[derive(Parser)]
#[command(name = "worldloom", about = "Worldloom feedback memory tools", version)]
struct Cli {
    /// Path to config file (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply find/replace instructions to a text file and print the result
    ApplyDiff {
        /// Text to patch
        #[arg(long)]
        base: PathBuf,
        /// JSON file with one instruction or an array of them
        #[arg(long)]
        instructions: PathBuf,
    },
    /// Inspect or replace persisted feedback memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print the stored memory as JSON
    Export {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Replace the stored memory with a JSON export
    Import {
        /// Exported memory file
        file: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Restore default documents and clear the call ledger
    Reset {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Directory holding the memory slot files
    #[arg(long, default_value = "~/.worldloom")]
    store: String,
    /// Slot key (default: memory.storage_key from config)
    #[arg(long)]
    key: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config as TOML
    Dump,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worldloom=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => FeedbackConfig::load(&expand_tilde(path)),
        None => FeedbackConfig::default(),
    };

    match cli.command {
        Command::ApplyDiff { base, instructions } => {
            let text = std::fs::read_to_string(&base)
                .with_context(|| format!("reading {}", base.display()))?;
            let raw = std::fs::read_to_string(&instructions)
                .with_context(|| format!("reading {}", instructions.display()))?;
            let steps = parse_instructions(&raw)
                .with_context(|| format!("parsing {}", instructions.display()))?;
            tracing::debug!("Applying {} instruction(s) to {}", steps.len(), base.display());
            print!("{}", apply_diff(&text, &steps));
        }
        Command::Memory { action } => run_memory(action, &config)?,
        Command::Config { action: ConfigAction::Dump } => {
            println!("{}", config.to_toml());
        }
    }
    Ok(())
}

fn run_memory(action: MemoryAction, config: &FeedbackConfig) -> anyhow::Result<()> {
    let store = match &action {
        MemoryAction::Export { store } | MemoryAction::Import { store, .. } | MemoryAction::Reset { store } => store,
    };
    let dir = expand_tilde(&store.store);
    let key = store.key.clone().unwrap_or_else(|| config.memory.storage_key.clone());
    let slot = FileSlot::new(&dir);

    match &action {
        MemoryAction::Export { .. } => {
            let snapshot = match slot.get(&key)? {
                Some(blob) => MemorySnapshot::from_blob(&blob),
                None => MemorySnapshot::default(),
            };
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        MemoryAction::Import { file, .. } => {
            let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
            let snapshot = MemorySnapshot::from_json_strict(&raw)
                .with_context(|| format!("{} is not a memory export", file.display()))?;
            slot.set(&key, &snapshot.to_blob()?)?;
            tracing::info!(
                "Imported {} ledger record(s) into {}",
                snapshot.calls.len(),
                slot.dir().display()
            );
        }
        MemoryAction::Reset { .. } => {
            slot.set(&key, &MemorySnapshot::default().to_blob()?)?;
            tracing::info!("Reset feedback memory '{}' in {}", key, slot.dir().display());
        }
    }
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}
