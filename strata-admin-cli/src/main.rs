//! Strata Administration CLI

mod dump;
mod load;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{names, CanonicalStore, Name, SledPersistenceManager, StrataConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-admin")]
#[command(author = "Strata Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Strata item store administration and system view tool")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new item store
    Init { path: PathBuf },

    /// Import a system view document
    Load {
        #[arg(short, long)]
        file: String,
        #[arg(short, long)]
        repo: PathBuf,
        /// Parent node id (defaults to the root node)
        #[arg(short, long)]
        parent: Option<String>,
        /// Keep the identifiers carried by the document
        #[arg(long)]
        keep_ids: bool,
        /// Drop dangling references instead of failing
        #[arg(long)]
        drop_unresolved: bool,
        /// Merge properties directly into node state
        #[arg(long)]
        state_mode: bool,
    },

    /// Export a subtree as a system view document
    Dump {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long, default_value = "-")]
        output: String,
        /// Subtree root node id (defaults to the root node)
        #[arg(short, long)]
        node: Option<String>,
        /// Export the node type tree instead of stored content
        #[arg(long)]
        node_types: bool,
    },

    /// Check stored states for dangling links and references
    Verify {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show store statistics
    Stat {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

/// An opened item store
pub struct Store {
    pub config: StrataConfig,
    pub persistence: Arc<SledPersistenceManager>,
    pub canonical: Arc<CanonicalStore>,
}

impl Store {
    pub async fn open(repo: &Path) -> Result<Self> {
        let config = StrataConfig::load(repo).with_context(|| format!("loading config of {}", repo.display()))?;
        let dir = config.storage_dir(repo);
        let persistence = Arc::new(
            SledPersistenceManager::open(&dir).with_context(|| format!("opening {}", dir.display()))?,
        );
        let canonical = Arc::new(CanonicalStore::open(persistence.clone(), &config).await?);
        Ok(Self {
            config,
            persistence,
            canonical,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { path } => {
            println!("Initializing item store at {}", path.display());
            std::fs::create_dir_all(&path)?;
            let config = StrataConfig::load(&path)?;
            config.save(&path)?;
            let store = Store::open(&path).await?;
            if store.canonical.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await? {
                println!("Item store initialized successfully");
            } else {
                println!("Item store already initialized");
            }
        }

        Commands::Load {
            file,
            repo,
            parent,
            keep_ids,
            drop_unresolved,
            state_mode,
        } => {
            let store = Store::open(&repo).await?;
            let options = load::LoadOptions {
                parent,
                keep_ids,
                drop_unresolved,
                state_mode,
            };
            let xml = if file == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?
            };
            let report = load::load_system_view(&store, &xml, &options).await?;
            println!(
                "Imported {} nodes, {} properties ({} protected skipped)",
                report.nodes, report.properties, report.skipped
            );
            if let Some(root) = report.root {
                println!("Subtree root: {}", root);
            }
            for dropped in &report.dropped_references {
                println!("  dropped dangling reference in {}", dropped);
            }
        }

        Commands::Dump {
            repo,
            output,
            node,
            node_types,
        } => {
            let store = Store::open(&repo).await?;
            let xml = if node_types {
                dump::dump_node_types(&store).await?
            } else {
                dump::dump_subtree(&store, node.as_deref()).await?
            };
            if output == "-" {
                println!("{}", xml);
            } else {
                std::fs::write(&output, xml).with_context(|| format!("writing {}", output))?;
            }
        }

        Commands::Verify { repo, quiet } => {
            let store = Store::open(&repo).await?;
            let report = verify::verify_store(&store, quiet)?;
            if !report.is_clean() {
                anyhow::bail!("verification found {} errors", report.errors.len());
            }
        }

        Commands::Stat { repo, json } => {
            let store = Store::open(&repo).await?;
            let stats = store.canonical.stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Records:          {}", store.persistence.record_count());
                println!("Sequence:         {}", stats.sequence);
                println!("Cached items:     {}/{}", stats.cached_items, stats.cache_capacity);
                println!("Cache hits/miss:  {}/{}", stats.hits, stats.misses);
                println!("Applied batches:  {}", stats.applied_batches);
            }
        }
    }

    Ok(())
}
