mod util;

use std::io::Write;

use anyhow::Result;
use listing_search::ListingError;
use listing_search::audit::ConsistencyAuditor;
use listing_search::model::types::{ExtractedFields, ListingInput, NewListing};
use listing_search::search::vector_index::{LvixHeader, vector_slab_offset_bytes};

use util::{Stores, sample_listings};

fn auditor(stores: &Stores) -> ConsistencyAuditor {
    ConsistencyAuditor::new(stores.store.clone(), stores.index.clone())
}

#[test]
fn fresh_ingest_is_consistent() -> Result<()> {
    let stores = Stores::with_hash(16);
    stores.coordinator().batch_insert(&sample_listings("ok", 8))?;
    let report = auditor(&stores).audit()?;
    assert!(report.consistent);
    assert_eq!(report.metadata_count, 8);
    assert_eq!(report.index_count, 8);
    assert!(report.clone().into_result().is_ok());
    Ok(())
}

#[test]
fn out_of_band_metadata_delete_shows_as_orphan() -> Result<()> {
    let stores = Stores::with_hash(16);
    let ids = stores
        .coordinator()
        .batch_insert(&sample_listings("orphan", 4))?;
    stores.store.delete_by_id(ids[2])?;

    let report = auditor(&stores).audit()?;
    assert!(!report.consistent);
    assert_eq!(report.orphans_in_index, vec![ids[2]]);
    assert!(report.missing_in_index.is_empty());
    assert!(matches!(
        report.into_result(),
        Err(ListingError::Consistency {
            orphans_in_index: 1,
            ..
        })
    ));

    // Auditing is read-only: a second run sees the same drift.
    assert_eq!(auditor(&stores).audit()?.orphans_in_index, vec![ids[2]]);
    Ok(())
}

#[test]
fn row_without_vector_shows_as_missing() -> Result<()> {
    let stores = Stores::with_hash(16);
    stores.coordinator().batch_insert(&sample_listings("m", 2))?;
    let stray = stores.store.insert(&NewListing::from_input(
        &ListingInput::new("written around the coordinator", "", ""),
        ExtractedFields::default(),
    ))?;

    let report = auditor(&stores).audit()?;
    assert_eq!(report.missing_in_index, vec![stray]);
    assert!(report.orphans_in_index.is_empty());
    Ok(())
}

#[test]
fn snapshot_audit_reports_duplicate_ids() -> Result<()> {
    let stores = Stores::with_hash(2);
    let ids = stores.coordinator().batch_insert(&sample_listings("d", 2))?;

    // Hand-written snapshot that stores ids[0] twice.
    let rows = [ids[0], ids[1], ids[0]];
    let header = LvixHeader::new("fnv1a-2", 2, rows.len() as u32)?;
    let mut bytes = Vec::new();
    header.write_to(&mut bytes)?;
    let mut body = Vec::new();
    for id in rows {
        body.extend_from_slice(&id.to_le_bytes());
    }
    let offset = vector_slab_offset_bytes(header.header_len_bytes()?, header.count)?;
    let padding = offset - bytes.len() - body.len();
    let mut slab = Vec::new();
    for v in [1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0] {
        slab.extend_from_slice(&v.to_le_bytes());
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    hasher.update(&slab);

    let path = stores.path().join("dup.lvix");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(&bytes)?;
    file.write_all(&body)?;
    file.write_all(&vec![0u8; padding])?;
    file.write_all(&slab)?;
    file.write_all(&hasher.finalize().to_le_bytes())?;
    drop(file);

    let report = auditor(&stores).audit_snapshot(&path)?;
    assert_eq!(report.duplicate_ids_in_index, vec![ids[0]]);
    assert_eq!(report.index_count, 3);
    assert!(report.orphans_in_index.is_empty());
    assert!(!report.consistent);
    assert!(report.index_source.ends_with("dup.lvix"));
    Ok(())
}

#[test]
fn inspect_reports_both_sides() -> Result<()> {
    let stores = Stores::with_hash(32);
    let ids = stores.coordinator().batch_insert(&sample_listings("i", 2))?;
    let auditor = auditor(&stores);

    let view = auditor.inspect(ids[0])?;
    assert!(view.in_index);
    assert!(view.record.is_some());
    assert_eq!(view.vector_preview.len(), 10);
    assert!((view.vector_norm.unwrap() - 1.0).abs() < 1e-4);

    stores.store.delete_by_id(ids[1])?;
    let orphan = auditor.inspect(ids[1])?;
    assert!(orphan.record.is_none() && orphan.in_index);

    assert!(matches!(
        auditor.inspect(424_242),
        Err(ListingError::NotFound(_))
    ));
    Ok(())
}
