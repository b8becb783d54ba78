//! Layered configuration: defaults, then `listings.toml` in the data dir, then
//! `LISTINGS_*` environment variables (a `.env` file is honoured), then CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ListingError, ListingResult};
use crate::search::embedder::EmbeddingClient;
use crate::search::hash_embedder::HashEmbedder;
use crate::search::http_embedder::{HttpEmbedder, HttpEmbedderConfig};
use crate::search::hybrid::DEFAULT_OVERSAMPLE_FACTOR;
use crate::search::vector_index;
use crate::storage::sqlite::DEFAULT_DB_FILE;

pub const CONFIG_FILE: &str = "listings.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Remote sentence-embedding service.
    Http,
    /// Offline feature hashing.
    Hash,
}

impl FromStr for EmbedderKind {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(EmbedderKind::Http),
            "hash" => Ok(EmbedderKind::Hash),
            other => Err(ListingError::Validation(format!(
                "unknown embedder '{other}' (expected http or hash)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub embedder: EmbedderKind,
    pub embed_url: String,
    pub embed_model: String,
    pub embed_timeout: Duration,
    pub embed_dimension: usize,
    pub oversample_factor: usize,
    pub default_k: usize,
}

/// Values set on the command line; `None` leaves the lower layers in charge.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub embedder: Option<EmbedderKind>,
    pub embed_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db: Option<PathBuf>,
    snapshot: Option<PathBuf>,
    embedder: Option<EmbedderKind>,
    embed_url: Option<String>,
    embed_model: Option<String>,
    embed_timeout_ms: Option<u64>,
    embed_dimension: Option<usize>,
    oversample_factor: Option<usize>,
    default_k: Option<usize>,
}

impl Config {
    pub fn defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            db_path: None,
            snapshot_path: None,
            embedder: EmbedderKind::Http,
            embed_url: "http://localhost:5000".to_string(),
            embed_model: "all-MiniLM-L6-v2".to_string(),
            embed_timeout: Duration::from_secs(10),
            embed_dimension: 384,
            oversample_factor: DEFAULT_OVERSAMPLE_FACTOR,
            default_k: 5,
        }
    }

    /// Resolve every layer, lowest precedence first.
    pub fn load(overrides: &ConfigOverrides) -> ListingResult<Self> {
        let data_dir = match &overrides.data_dir {
            Some(dir) => dir.clone(),
            None => dotenvy::var("LISTINGS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_dir()),
        };
        let mut cfg = Self::defaults(data_dir);
        let file = cfg.data_dir.join(CONFIG_FILE);
        cfg.apply_file(&file)?;
        cfg.apply_env()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        debug!(config = ?cfg, "configuration resolved");
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> ListingResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            ListingError::Validation(format!("reading {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&raw)
            .map_err(|e| ListingError::Validation(format!("parsing {}: {e}", path.display())))?;

        if let Some(db) = file.db {
            self.db_path = Some(self.relative_to_data_dir(db));
        }
        if let Some(snapshot) = file.snapshot {
            self.snapshot_path = Some(self.relative_to_data_dir(snapshot));
        }
        if let Some(kind) = file.embedder {
            self.embedder = kind;
        }
        if let Some(url) = file.embed_url {
            self.embed_url = url;
        }
        if let Some(model) = file.embed_model {
            self.embed_model = model;
        }
        if let Some(ms) = file.embed_timeout_ms {
            self.embed_timeout = Duration::from_millis(ms);
        }
        if let Some(dim) = file.embed_dimension {
            self.embed_dimension = dim;
        }
        if let Some(f) = file.oversample_factor {
            self.oversample_factor = f;
        }
        if let Some(k) = file.default_k {
            self.default_k = k;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> ListingResult<()> {
        if let Ok(path) = dotenvy::var("LISTINGS_DB") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = dotenvy::var("LISTINGS_SNAPSHOT") {
            self.snapshot_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = dotenvy::var("LISTINGS_EMBED_URL") {
            self.embed_url = url;
        }
        if let Ok(val) = dotenvy::var("LISTINGS_EMBEDDER") {
            self.embedder = val.parse()?;
        }
        if let Some(ms) = parse_env::<u64>("LISTINGS_EMBED_TIMEOUT_MS")? {
            self.embed_timeout = Duration::from_millis(ms);
        }
        if let Some(dim) = parse_env::<usize>("LISTINGS_EMBED_DIM")? {
            self.embed_dimension = dim;
        }
        if let Some(f) = parse_env::<usize>("LISTINGS_OVERSAMPLE")? {
            self.oversample_factor = f;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(db) = &overrides.db_path {
            self.db_path = Some(db.clone());
        }
        if let Some(kind) = overrides.embedder {
            self.embedder = kind;
        }
        if let Some(url) = &overrides.embed_url {
            self.embed_url = url.clone();
        }
    }

    pub fn validate(&self) -> ListingResult<()> {
        if self.embed_dimension == 0 {
            return Err(ListingError::Validation(
                "embedding dimension must be non-zero".into(),
            ));
        }
        if self.embed_timeout.is_zero() {
            return Err(ListingError::Validation(
                "embedding timeout must be non-zero".into(),
            ));
        }
        if self.oversample_factor < 1 {
            return Err(ListingError::Validation(
                "oversample factor must be at least 1".into(),
            ));
        }
        if self.default_k < 1 {
            return Err(ListingError::Validation("default k must be at least 1".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_DB_FILE))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| vector_index::snapshot_path(&self.data_dir))
    }

    pub fn build_embedder(&self) -> ListingResult<Arc<dyn EmbeddingClient>> {
        let embedder: Arc<dyn EmbeddingClient> = match self.embedder {
            EmbedderKind::Http => Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
                base_url: self.embed_url.clone(),
                timeout: self.embed_timeout,
                dimension: self.embed_dimension,
                model_id: self.embed_model.clone(),
            })?),
            EmbedderKind::Hash => Arc::new(HashEmbedder::new(self.embed_dimension)?),
        };
        Ok(embedder)
    }

    fn relative_to_data_dir(&self, path: PathBuf) -> PathBuf {
        if path.is_relative() {
            self.data_dir.join(path)
        } else {
            path
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> ListingResult<Option<T>> {
    match dotenvy::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ListingError::Validation(format!("{key}: invalid value '{val}'"))),
        Err(_) => Ok(None),
    }
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "listing-search", "listing-search").map_or_else(
        || PathBuf::from(".listing-search"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
