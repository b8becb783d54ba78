//! Predicate filtering combined with nearest-neighbour ranking.
//!
//! Two strategies, always chosen explicitly by the caller:
//!
//! - [`SearchStrategy::PreFilter`] asks the metadata store for every matching
//!   id and ranks exactly that candidate set. Results are the true top-k.
//! - [`SearchStrategy::PostFilter`] takes the `k * oversample_factor` nearest
//!   neighbours from the whole index and drops those failing the predicate.
//!   Cheaper on selective indexes, but returns fewer than `k` hits whenever
//!   matches are rarer than `1 / oversample_factor` near the query.
//!
//! Only listings present in both stores are returned.

use std::sync::Arc;
use std::time::Instant;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ListingError, ListingResult};
use crate::model::types::{ListingPredicate, SearchHit};
use crate::search::embedder::EmbeddingClient;
use crate::search::vector_index::{Neighbor, VectorIndex, l2_distance_squared, top_k_closest};
use crate::storage::sqlite::MetadataStore;

pub const DEFAULT_OVERSAMPLE_FACTOR: usize = 5;

/// Candidates reconstructed per read of the index.
const PREFILTER_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SearchStrategy {
    #[default]
    PreFilter,
    PostFilter { oversample_factor: usize },
}

impl SearchStrategy {
    pub fn post_filter(oversample_factor: usize) -> Self {
        SearchStrategy::PostFilter { oversample_factor }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchStrategy::PreFilter => "pre_filter",
            SearchStrategy::PostFilter { .. } => "post_filter",
        }
    }

    fn validate(&self) -> ListingResult<()> {
        if let SearchStrategy::PostFilter { oversample_factor } = self
            && *oversample_factor < 1
        {
            return Err(ListingError::Validation(
                "oversample factor must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub struct HybridSearchEngine {
    store: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<MetadataStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> ListingResult<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(ListingError::Validation(format!(
                "embedder '{}' produces dimension {}, index expects {}",
                embedder.id(),
                embedder.dimension(),
                index.dimension()
            )));
        }
        Ok(Self {
            store,
            index,
            embedder,
        })
    }

    /// Embed `query` and rank matching listings, closest first.
    pub fn search(
        &self,
        query: &str,
        predicate: &ListingPredicate,
        k: usize,
        strategy: SearchStrategy,
    ) -> ListingResult<Vec<SearchHit>> {
        strategy.validate()?;
        if query.trim().is_empty() {
            return Err(ListingError::Validation("search query is empty".into()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query)?;
        self.search_with_vector(&vector, predicate, k, strategy)
    }

    pub fn search_with_vector(
        &self,
        vector: &[f32],
        predicate: &ListingPredicate,
        k: usize,
        strategy: SearchStrategy,
    ) -> ListingResult<Vec<SearchHit>> {
        strategy.validate()?;
        if vector.len() != self.index.dimension() {
            return Err(ListingError::Validation(format!(
                "query vector has dimension {}, index expects {}",
                vector.len(),
                self.index.dimension()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let hits = match strategy {
            SearchStrategy::PreFilter => self.pre_filter(vector, predicate, k)?,
            SearchStrategy::PostFilter { oversample_factor } => {
                self.post_filter(vector, predicate, k, oversample_factor)?
            }
        };
        debug!(
            strategy = strategy.name(),
            k,
            returned = hits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hybrid search"
        );
        Ok(hits)
    }

    fn pre_filter(
        &self,
        vector: &[f32],
        predicate: &ListingPredicate,
        k: usize,
    ) -> ListingResult<Vec<SearchHit>> {
        let candidates = self.store.query_by_predicate(predicate)?;
        let mut scored = Vec::with_capacity(candidates.len());
        let mut without_vector = 0usize;
        for chunk in candidates.chunks(PREFILTER_CHUNK) {
            for (id, stored) in chunk.iter().zip(self.index.reconstruct_many(chunk)) {
                match stored {
                    Some(v) => scored.push(Neighbor {
                        id: *id,
                        distance: l2_distance_squared(&v, vector),
                    }),
                    None => without_vector += 1,
                }
            }
        }
        if without_vector > 0 {
            debug!(
                without_vector,
                "skipped candidates with no vector (in-flight or drifted)"
            );
        }
        debug!(
            candidates = candidates.len(),
            filtered = !predicate.is_unconstrained(),
            "pre-filter candidate set"
        );
        let top = top_k_closest(scored, k);
        self.hydrate(&top, |_| true)
    }

    fn post_filter(
        &self,
        vector: &[f32],
        predicate: &ListingPredicate,
        k: usize,
        oversample_factor: usize,
    ) -> ListingResult<Vec<SearchHit>> {
        let fetch = k.saturating_mul(oversample_factor);
        let neighbors = self.index.search(vector, fetch)?;
        let fetched = neighbors.len();
        let mut hits = self.hydrate(&neighbors, |hit| predicate.matches(&hit.record))?;
        hits.truncate(k);
        debug!(fetched, kept = hits.len(), "post-filter");
        Ok(hits)
    }

    /// Attach committed records to `neighbors`, keeping order.
    fn hydrate<F>(&self, neighbors: &[Neighbor], keep: F) -> ListingResult<Vec<SearchHit>>
    where
        F: Fn(&SearchHit) -> bool,
    {
        let ids: Vec<i64> = neighbors.iter().map(|n| n.id).collect();
        let mut records: FxHashMap<i64, _> = self
            .store
            .get_many(&ids)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let mut hits = Vec::with_capacity(neighbors.len());
        for n in neighbors {
            let Some(record) = records.remove(&n.id) else {
                debug!(id = n.id, "neighbour has no committed metadata; skipped");
                continue;
            };
            let hit = SearchHit {
                distance: n.distance,
                record,
            };
            if keep(&hit) {
                hits.push(hit);
            }
        }
        Ok(hits)
    }
}
