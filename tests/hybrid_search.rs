mod util;

use std::sync::Arc;

use anyhow::Result;
use listing_search::model::types::{ListingInput, ListingPredicate};
use listing_search::search::hybrid::SearchStrategy;

use util::{LookupEmbedder, Stores, sample_listings};

#[test]
fn pre_filter_results_are_sorted_and_satisfy_the_filter() -> Result<()> {
    let stores = Stores::with_hash(64);
    stores
        .coordinator()
        .batch_insert(&sample_listings("campus", 40))?;
    let engine = stores.engine();

    let predicate = ListingPredicate::default()
        .with_max_price(1_000.0)
        .with_min_beds(2);
    let hits = engine.search(
        "2 bed near campus",
        &predicate,
        5,
        SearchStrategy::PreFilter,
    )?;

    assert!(!hits.is_empty() && hits.len() <= 5);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    for hit in &hits {
        assert!(predicate.matches(&hit.record), "{:?}", hit.record);
        assert!(hit.record.beds.unwrap() >= 2);
        assert!(hit.record.price_min.unwrap() <= 1_000.0);
    }
    Ok(())
}

#[test]
fn unmatched_filter_yields_empty_result() -> Result<()> {
    let stores = Stores::with_hash(16);
    stores.coordinator().batch_insert(&sample_listings("x", 5))?;
    let hits = stores.engine().search(
        "anything",
        &ListingPredicate::default().with_min_beds(99),
        5,
        SearchStrategy::PreFilter,
    )?;
    assert!(hits.is_empty());
    Ok(())
}

/// 99 one-bed listings sit right next to the query; the only four-bed listing
/// is the farthest point in the index.
fn adversarial_stores() -> Result<Stores> {
    let mut embedder = LookupEmbedder::new(2).with("where can I live", vec![0.0, 0.0]);
    let mut items = Vec::new();
    for i in 0..99 {
        let text = format!("unit {i}: 1 bed for $500");
        embedder = embedder.with(text.clone(), vec![(i + 1) as f32, 0.0]);
        items.push(ListingInput::new(text, "u", "U"));
    }
    let penthouse = "penthouse with 4 bed for $900".to_string();
    embedder = embedder.with(penthouse.clone(), vec![1_000.0, 0.0]);
    items.push(ListingInput::new(penthouse, "u", "U"));

    let stores = Stores::new(Arc::new(embedder));
    stores.coordinator().batch_insert(&items)?;
    Ok(stores)
}

#[test]
fn pre_filter_finds_the_single_far_match() -> Result<()> {
    let stores = adversarial_stores()?;
    let predicate = ListingPredicate::default().with_min_beds(4);

    let hits = stores.engine().search(
        "where can I live",
        &predicate,
        1,
        SearchStrategy::PreFilter,
    )?;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].record.raw_text.starts_with("penthouse"));
    assert_eq!(hits[0].distance, 1_000_000.0);
    assert_eq!(
        stores.index.reconstruct(hits[0].record.id)?,
        vec![1_000.0, 0.0]
    );
    Ok(())
}

#[test]
fn post_filter_misses_the_single_far_match() -> Result<()> {
    let stores = adversarial_stores()?;
    let predicate = ListingPredicate::default().with_min_beds(4);

    let hits = stores.engine().search(
        "where can I live",
        &predicate,
        1,
        SearchStrategy::post_filter(5),
    )?;
    assert!(hits.is_empty());

    // Oversampling past the whole index recovers it.
    let hits = stores.engine().search(
        "where can I live",
        &predicate,
        1,
        SearchStrategy::post_filter(100),
    )?;
    assert_eq!(hits.len(), 1);
    Ok(())
}

#[test]
fn orphaned_vectors_never_surface_in_results() -> Result<()> {
    let stores = Stores::with_hash(16);
    let ids = stores
        .coordinator()
        .batch_insert(&sample_listings("orph", 6))?;
    stores.store.delete_by_id(ids[0])?;

    let query = stores.index.reconstruct(ids[0])?;
    let engine = stores.engine();
    for strategy in [SearchStrategy::PreFilter, SearchStrategy::post_filter(5)] {
        let hits =
            engine.search_with_vector(&query, &ListingPredicate::default(), 6, strategy)?;
        assert_eq!(hits.len(), 5, "{strategy:?}");
        assert!(hits.iter().all(|h| h.record.id != ids[0]));
    }
    Ok(())
}

#[test]
fn very_large_k_returns_every_match() -> Result<()> {
    let stores = Stores::with_hash(8);
    stores.coordinator().batch_insert(&sample_listings("big", 3))?;
    let engine = stores.engine();
    for strategy in [SearchStrategy::PreFilter, SearchStrategy::post_filter(5)] {
        let hits = engine.search("room", &ListingPredicate::default(), 1 << 40, strategy)?;
        assert_eq!(hits.len(), 3, "{strategy:?}");
    }
    let hits = engine.search(
        "room",
        &ListingPredicate::default(),
        usize::MAX,
        SearchStrategy::post_filter(usize::MAX),
    )?;
    assert_eq!(hits.len(), 3);
    Ok(())
}
