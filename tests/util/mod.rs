use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use listing_search::indexer::InsertionCoordinator;
use listing_search::model::types::ListingInput;
use listing_search::search::embedder::{EmbedderError, EmbedderResult, EmbeddingClient};
use listing_search::search::hash_embedder::HashEmbedder;
use listing_search::search::hybrid::HybridSearchEngine;
use listing_search::search::vector_index::{VectorIndex, snapshot_path};
use listing_search::storage::sqlite::{DEFAULT_DB_FILE, MetadataStore};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Both stores in a temp dir, wired to one embedder.
#[allow(dead_code)]
pub struct Stores {
    pub dir: TempDir,
    pub store: Arc<MetadataStore>,
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn EmbeddingClient>,
}

#[allow(dead_code)]
impl Stores {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MetadataStore::open(&dir.path().join(DEFAULT_DB_FILE)).expect("store"));
        let index = Arc::new(
            VectorIndex::with_snapshot(
                snapshot_path(dir.path()),
                embedder.dimension(),
                embedder.id(),
            )
            .expect("index"),
        );
        Self {
            dir,
            store,
            index,
            embedder,
        }
    }

    pub fn with_hash(dimension: usize) -> Self {
        Self::new(Arc::new(HashEmbedder::new(dimension).expect("hash embedder")))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn coordinator(&self) -> InsertionCoordinator {
        InsertionCoordinator::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
        )
        .expect("coordinator")
    }

    pub fn engine(&self) -> HybridSearchEngine {
        HybridSearchEngine::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
        )
        .expect("engine")
    }
}

/// Wraps an embedder and drops the last vector of every batch.
#[allow(dead_code)]
pub struct ShortEmbedder<E>(pub E);

impl<E: EmbeddingClient> EmbeddingClient for ShortEmbedder<E> {
    fn id(&self) -> &str {
        "short"
    }

    fn dimension(&self) -> usize {
        self.0.dimension()
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        let mut out = self.0.embed_batch(texts)?;
        out.pop();
        Ok(out)
    }
}

/// Returns the vector registered for each exact text.
#[allow(dead_code)]
pub struct LookupEmbedder {
    dimension: usize,
    table: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl LookupEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            table: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), self.dimension);
        self.table.insert(text.into(), vector);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingClient for LookupEmbedder {
    fn id(&self) -> &str {
        "lookup"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|t| {
                self.table
                    .get(*t)
                    .cloned()
                    .ok_or_else(|| EmbedderError::InvalidInput(format!("no vector for {t:?}")))
            })
            .collect()
    }
}

/// `n` distinct sublease posts tagged with `tag`.
#[allow(dead_code)]
pub fn sample_listings(tag: &str, n: usize) -> Vec<ListingInput> {
    (0..n)
        .map(|i| {
            ListingInput::new(
                format!(
                    "{tag} listing {i}: {} bed {} bath near campus for ${}",
                    1 + i % 4,
                    1 + i % 2,
                    500 + 25 * i
                ),
                format!("{tag}-owner-{}", i % 7),
                format!("{tag} owner {}", i % 7),
            )
        })
        .collect()
}
