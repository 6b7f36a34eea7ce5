//! rollfs: Checkpointed, rollback-capable state tracking for a directory tree
//!
//! Operator CLI over a state root:
//! - Copy-on-write changesets recording every pre-image block
//! - BLAKE3 hash tree with O(1) incremental directory hashes
//! - Bounded checkpoint ring with whole-changeset rollback

mod debug_log;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::info;

use rollfs_core::{
    BlockHashMap, HashTreeBuilder, StateConfig, StateRoot, create_checkpoint, rollback, summarize,
    verify_tree,
};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "rollfs")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Checkpointed, rollback-capable state tracking for a directory tree")]
#[command(long_about = r#"
rollfs tracks a data directory with copy-on-write changesets and a
content-addressed hash tree.

Layout under a state root:
  0/data      the mutable data tree
  0/bhmaps    per-file block hash maps
  0/htree     dir.hash files + root-hash hard links
  0/delta     the in-progress changeset
  -1/, -2/    frozen checkpoint changesets

Examples:
  rollfs init ./state                 Create an empty state root
  rollfs status ./state               Summarize the live changeset
  rollfs hashtree ./state             Update the hash tree incrementally
  rollfs checkpoint ./state           Freeze the changeset into history
  rollfs rollback ./state             Restore the pre-session state
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write a trace log to /tmp instead of logging to the console
    #[arg(long, global = true)]
    debug_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the live slot layout under a state root
    Init {
        /// State root directory
        root: PathBuf,
    },

    /// Summarize the live changeset and the checkpoint ring
    Status {
        /// State root directory
        root: PathBuf,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Update the hash tree from the data tree
    Hashtree {
        /// State root directory
        root: PathBuf,

        /// Rebuild everything, ignoring changeset hints
        #[arg(long)]
        full: bool,
    },

    /// Freeze the live changeset into history slot -1
    Checkpoint {
        /// State root directory
        root: PathBuf,
    },

    /// Replay the live changeset in reverse and cycle the checkpoint ring
    Rollback {
        /// State root directory
        root: PathBuf,
    },

    /// Recompute all hashes and compare against the stored hash tree
    Verify {
        /// State root directory
        root: PathBuf,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Print the hashes stored in one .bhmap file
    Inspect {
        /// Path to a .bhmap file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Setup logging
    let _debug_guard = if cli.debug_log {
        let session = debug_log::init();
        eprintln!("Trace log: {}", session.log_path.display());
        Some(session.guard)
    } else {
        let filter = if cli.verbose { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        None
    };

    match cli.command {
        Commands::Init { root } => init_command(&root),
        Commands::Status { root, format } => status_command(&root, &format),
        Commands::Hashtree { root, full } => hashtree_command(&root, full),
        Commands::Checkpoint { root } => checkpoint_command(&root),
        Commands::Rollback { root } => rollback_command(&root),
        Commands::Verify { root, format } => verify_command(&root, &format),
        Commands::Inspect { path } => inspect_command(&path),
    }
}

fn init_command(root: &PathBuf) -> Result<()> {
    let root = StateRoot::new(root);
    root.init()?;
    info!("state root ready at {}", root.path().display());
    Ok(())
}

fn status_command(root: &PathBuf, format: &str) -> Result<()> {
    let root = StateRoot::new(root);
    let summary = summarize(&root)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&summary)?;
            println!("{json}");
        }
        _ => {
            println!("New files:     {}", summary.new_files.len());
            println!("Touched files: {}", summary.touched_files.len());
            println!("Cached bytes:  {}", summary.cached_bytes);
            println!("Checkpoints:   {}", summary.history_slots.len());

            for path in &summary.new_files {
                println!("  new      {path}");
            }
            for touched in &summary.touched_files {
                println!(
                    "  touched  {} ({} bytes, {} blocks cached)",
                    touched.path, touched.original_length, touched.cached_blocks
                );
            }
        }
    }

    Ok(())
}

fn hashtree_command(root: &PathBuf, full: bool) -> Result<()> {
    let root = StateRoot::new(root);
    let config = StateConfig::load(&root)?;
    let mut builder = HashTreeBuilder::new(root.live(), &config);
    if full {
        builder.generate_full()?;
    } else {
        builder.generate()?;
    }
    info!("hash tree updated");
    Ok(())
}

fn checkpoint_command(root: &PathBuf) -> Result<()> {
    let root = StateRoot::new(root);
    create_checkpoint(&root)?;
    Ok(())
}

fn rollback_command(root: &PathBuf) -> Result<()> {
    let root = StateRoot::new(root);
    let config = StateConfig::load(&root)?;
    rollback(&root, &config)?;
    Ok(())
}

fn verify_command(root: &PathBuf, format: &str) -> Result<()> {
    let root = StateRoot::new(root);
    let report = verify_tree(&root.live())?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&report)?;
            println!("{json}");
        }
        _ => {
            println!("Files checked: {}", report.files_checked);
            println!("Dirs checked:  {}", report.dirs_checked);
            for path in &report.mismatched_files {
                println!("  content mismatch  {path}");
            }
            for path in &report.missing_maps {
                println!("  missing map       {path}");
            }
            for path in &report.orphaned_maps {
                println!("  orphaned map      {path}");
            }
            for path in &report.broken_links {
                println!("  broken link       {path}");
            }
            for path in &report.mismatched_dirs {
                println!("  dir hash mismatch {path}");
            }
        }
    }

    if report.is_clean() {
        info!("hash tree verified");
        Ok(())
    } else {
        Err(eyre!("verification failed"))
    }
}

fn inspect_command(path: &PathBuf) -> Result<()> {
    let map = BlockHashMap::load(path)?
        .ok_or_else(|| eyre!("no block hash map at {}", path.display()))?;

    println!("root   {}", map.root.to_hex());
    for (blockno, hash) in map.blocks.iter().enumerate() {
        println!("{blockno:<6} {}", hash.to_hex());
    }

    Ok(())
}
