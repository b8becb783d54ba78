use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use listing_search::indexer::InsertionCoordinator;
use listing_search::model::types::{ListingInput, ListingPredicate};
use listing_search::search::embedder::EmbeddingClient;
use listing_search::search::hash_embedder::HashEmbedder;
use listing_search::search::hybrid::{HybridSearchEngine, SearchStrategy};
use listing_search::search::vector_index::{VectorIndex, l2_distance_squared};
use listing_search::storage::sqlite::{DEFAULT_DB_FILE, MetadataStore};
use tempfile::TempDir;

fn synthetic_vector(seed: usize, dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|j| (((seed * 31 + j * 17) % 97) as f32 / 97.0) - 0.5)
        .collect()
}

fn build_index(count: usize, dimension: usize) -> VectorIndex {
    let index = VectorIndex::new(dimension, "bench").expect("index");
    let ids: Vec<i64> = (1..=count as i64).collect();
    let vectors: Vec<Vec<f32>> = (0..count).map(|i| synthetic_vector(i, dimension)).collect();
    index.add_with_ids(&vectors, &ids).expect("add");
    index
}

fn bench_l2_kernel(c: &mut Criterion) {
    let a = synthetic_vector(1, 384);
    let b = synthetic_vector(2, 384);
    c.bench_function("l2_distance_squared_384", |bench| {
        bench.iter(|| black_box(l2_distance_squared(black_box(&a), black_box(&b))))
    });
}

/// Exhaustive top-k over the whole index, below and above the parallel threshold.
fn bench_vector_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_index_search");
    for count in [1_000usize, 50_000] {
        let index = build_index(count, 384);
        let query = synthetic_vector(count + 7, 384);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(index.search(&query, 10).expect("search")))
        });
    }
    group.finish();
}

/// Pre-filter versus post-filter over a populated store.
fn bench_hybrid_strategies(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbedder::new(384).expect("embedder"));
    let store = Arc::new(MetadataStore::open(&dir.path().join(DEFAULT_DB_FILE)).expect("store"));
    let index = Arc::new(VectorIndex::new(384, embedder.id()).expect("index"));
    let coordinator =
        InsertionCoordinator::new(store.clone(), index.clone(), embedder.clone()).expect("coord");

    let items: Vec<ListingInput> = (0..5_000)
        .map(|i| {
            ListingInput::new(
                format!(
                    "sublease {i}: {} bed {} bath near downtown for ${}",
                    1 + i % 4,
                    1 + i % 2,
                    450 + (i % 40) * 25
                ),
                format!("owner-{}", i % 50),
                "",
            )
        })
        .collect();
    for chunk in items.chunks(500) {
        coordinator.batch_insert(chunk).expect("insert");
    }

    let engine = HybridSearchEngine::new(store, index, embedder).expect("engine");
    let predicate = ListingPredicate::default()
        .with_max_price(900.0)
        .with_min_beds(3);

    let mut group = c.benchmark_group("hybrid_search");
    for strategy in [SearchStrategy::PreFilter, SearchStrategy::post_filter(5)] {
        group.bench_function(strategy.name(), |b| {
            b.iter(|| {
                black_box(
                    engine
                        .search("3 bed near downtown", &predicate, 10, strategy)
                        .expect("search"),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_l2_kernel,
    bench_vector_search,
    bench_hybrid_strategies
);
criterion_main!(benches);
