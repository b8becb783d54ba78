pub mod audit;
pub mod config;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod model;
pub mod search;
pub mod storage;

pub use error::{ListingError, ListingResult};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;

use audit::ConsistencyAuditor;
use config::{Config, ConfigOverrides, EmbedderKind};
use indexer::InsertionCoordinator;
use model::types::{ListingInput, ListingPredicate};
use search::embedder::EmbeddingClient;
use search::hybrid::{HybridSearchEngine, SearchStrategy};
use search::vector_index::VectorIndex;
use storage::sqlite::MetadataStore;

/// Exit code for `audit` when the stores have drifted.
pub const EXIT_DRIFT: u8 = 2;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "listings",
    version,
    about = "Hybrid structured + semantic search over housing listings"
)]
pub struct Cli {
    /// Data directory (db, vector snapshot, listings.toml)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database (defaults to <data-dir>/listings.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Embedding backend
    #[arg(long, value_enum, global = true)]
    pub embedder: Option<EmbedderKind>,

    /// Base URL of the embedding service
    #[arg(long, global = true)]
    pub embed_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Insert a single listing
    Insert {
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "")]
        owner_id: String,
        #[arg(long, default_value = "")]
        owner_name: String,
    },
    /// Import JSON lines of {text, owner_id?, owner_name?}
    Import {
        path: PathBuf,
        /// Listings per all-or-nothing batch
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
    },
    /// Search listings by meaning, filtered by structured fields
    Search {
        query: String,
        #[arg(long)]
        max_price: Option<f64>,
        #[arg(long)]
        min_price: Option<f64>,
        #[arg(long)]
        min_beds: Option<i64>,
        #[arg(long)]
        min_baths: Option<f64>,
        #[arg(long)]
        location: Option<String>,
        /// Number of results (defaults to the configured k)
        #[arg(short = 'k', long)]
        k: Option<usize>,
        #[arg(long, value_enum, default_value_t = StrategyArg::Pre)]
        strategy: StrategyArg,
        /// Neighbour multiplier for the post-filter strategy
        #[arg(long)]
        oversample: Option<usize>,
    },
    /// Compare the metadata store with the vector index (exit 2 on drift)
    Audit {
        /// Audit a snapshot file instead of the live index
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Store statistics
    Stats,
    /// Show one listing as seen by both stores
    Show { id: i64 },
    /// Listings with identical text
    Duplicates {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Exact: rank every listing matching the filters
    Pre,
    /// Approximate: filter the nearest neighbours of the whole index
    Post,
}

/// Opened stores and the embedder they were built for.
pub struct Services {
    pub config: Config,
    pub store: Arc<MetadataStore>,
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn EmbeddingClient>,
}

impl Services {
    pub fn open(config: Config) -> ListingResult<Self> {
        let embedder = config.build_embedder()?;
        let store = Arc::new(MetadataStore::open(&config.db_path())?);
        let index = Arc::new(VectorIndex::open(
            &config.snapshot_path(),
            embedder.dimension(),
            embedder.id(),
        )?);
        Ok(Self {
            config,
            store,
            index,
            embedder,
        })
    }

    pub fn coordinator(&self) -> ListingResult<InsertionCoordinator> {
        InsertionCoordinator::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
        )
    }

    pub fn search_engine(&self) -> ListingResult<HybridSearchEngine> {
        HybridSearchEngine::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
        )
    }

    pub fn auditor(&self) -> ConsistencyAuditor {
        ConsistencyAuditor::new(self.store.clone(), self.index.clone())
    }
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    run_with(cli)
}

pub fn run_with(cli: Cli) -> Result<ExitCode> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "listings", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let overrides = ConfigOverrides {
        data_dir: cli.data_dir,
        db_path: cli.db,
        embedder: cli.embedder,
        embed_url: cli.embed_url,
    };
    let config = Config::load(&overrides).context("loading configuration")?;
    let services = Services::open(config).context("opening listing stores")?;

    match cli.command {
        Commands::Insert {
            text,
            owner_id,
            owner_name,
        } => {
            let id = services
                .coordinator()?
                .insert(&text, &owner_id, &owner_name)?;
            print_json(&json!({ "id": id }))?;
        }
        Commands::Import { path, batch_size } => {
            let ids = import_jsonl(&services, &path, batch_size)?;
            print_json(&json!({ "ids": ids }))?;
        }
        Commands::Search {
            query,
            max_price,
            min_price,
            min_beds,
            min_baths,
            location,
            k,
            strategy,
            oversample,
        } => {
            let predicate = ListingPredicate {
                max_price,
                min_price,
                min_beds,
                min_baths,
                location,
            };
            let strategy = match strategy {
                StrategyArg::Pre => SearchStrategy::PreFilter,
                StrategyArg::Post => SearchStrategy::post_filter(
                    oversample.unwrap_or(services.config.oversample_factor),
                ),
            };
            let k = k.unwrap_or(services.config.default_k);
            let hits = services
                .search_engine()?
                .search(&query, &predicate, k, strategy)?;
            print_json(&json!({ "strategy": strategy, "k": k, "hits": hits }))?;
        }
        Commands::Audit { snapshot } => {
            let auditor = services.auditor();
            let report = match snapshot {
                Some(path) => auditor.audit_snapshot(&path)?,
                None => auditor.audit()?,
            };
            print_json(&report)?;
            if !report.consistent {
                return Ok(ExitCode::from(EXIT_DRIFT));
            }
        }
        Commands::Stats => {
            let stats = services.store.stats()?;
            print_json(&json!({
                "metadata": stats,
                "index": {
                    "size": services.index.size(),
                    "dimension": services.index.dimension(),
                    "embedder_id": services.index.embedder_id(),
                    "snapshot": services.config.snapshot_path(),
                },
            }))?;
        }
        Commands::Show { id } => {
            print_json(&services.auditor().inspect(id)?)?;
        }
        Commands::Duplicates { limit } => {
            print_json(&services.store.find_text_duplicates(limit)?)?;
        }
        // Generated above, before any store is opened.
        Commands::Completions { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}

/// Each chunk of `batch_size` lines is one all-or-nothing batch.
fn import_jsonl(services: &Services, path: &Path, batch_size: usize) -> Result<Vec<i64>> {
    if batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut items = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let item: ListingInput = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid listing", path.display(), lineno + 1))?;
        items.push(item);
    }

    let coordinator = services.coordinator()?;
    let mut ids = Vec::with_capacity(items.len());
    for (n, chunk) in items.chunks(batch_size).enumerate() {
        let committed = coordinator.batch_insert(chunk).with_context(|| {
            format!(
                "batch {} failed; {} listing(s) from earlier batches were committed",
                n + 1,
                ids.len()
            )
        })?;
        ids.extend(committed);
    }
    Ok(ids)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
