//! Read-only reconciliation between the metadata store and the vector index.
//!
//! The auditor reports drift; it never repairs it. A report taken while a
//! batch is in flight may show a transient mismatch for that batch's ids.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ListingError, ListingResult};
use crate::model::types::ListingRecord;
use crate::search::vector_index::{VectorIndex, read_snapshot};
use crate::storage::sqlite::MetadataStore;

const VECTOR_PREVIEW_DIMS: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    /// `live` or the snapshot path that was audited.
    pub index_source: String,
    pub metadata_count: usize,
    pub index_count: usize,
    pub missing_in_index: Vec<i64>,
    pub orphans_in_index: Vec<i64>,
    pub duplicate_ids_in_index: Vec<i64>,
    pub consistent: bool,
}

impl ConsistencyReport {
    fn build(index_source: String, metadata_ids: &[i64], index_ids: &[i64]) -> Self {
        let metadata: BTreeSet<i64> = metadata_ids.iter().copied().collect();
        let mut index = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for id in index_ids {
            if !index.insert(*id) {
                duplicates.insert(*id);
            }
        }
        let missing_in_index: Vec<i64> = metadata.difference(&index).copied().collect();
        let orphans_in_index: Vec<i64> = index.difference(&metadata).copied().collect();
        let duplicate_ids_in_index: Vec<i64> = duplicates.into_iter().collect();
        let consistent = missing_in_index.is_empty()
            && orphans_in_index.is_empty()
            && duplicate_ids_in_index.is_empty();
        Self {
            checked_at: Utc::now(),
            index_source,
            metadata_count: metadata_ids.len(),
            index_count: index_ids.len(),
            missing_in_index,
            orphans_in_index,
            duplicate_ids_in_index,
            consistent,
        }
    }

    /// Turn detected drift into a `Consistency` error.
    pub fn into_result(self) -> ListingResult<Self> {
        if self.consistent {
            Ok(self)
        } else {
            Err(ListingError::Consistency {
                missing_in_index: self.missing_in_index.len(),
                orphans_in_index: self.orphans_in_index.len(),
                duplicates_in_index: self.duplicate_ids_in_index.len(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct IdPresence {
    pub id: i64,
    pub in_metadata: bool,
    pub in_index: bool,
}

/// One listing as seen by both stores.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingInspection {
    pub id: i64,
    pub record: Option<ListingRecord>,
    pub in_index: bool,
    pub vector_norm: Option<f32>,
    pub vector_preview: Vec<f32>,
}

pub struct ConsistencyAuditor {
    store: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
}

impl ConsistencyAuditor {
    pub fn new(store: Arc<MetadataStore>, index: Arc<VectorIndex>) -> Self {
        Self { store, index }
    }

    /// Compare the metadata store against the live index.
    pub fn audit(&self) -> ListingResult<ConsistencyReport> {
        let metadata_ids = self.store.all_ids()?;
        let index_ids = self.index.ids();
        let report = ConsistencyReport::build("live".to_string(), &metadata_ids, &index_ids);
        log_report(&report);
        Ok(report)
    }

    /// Compare the metadata store against a snapshot file, duplicates included.
    pub fn audit_snapshot(&self, path: &Path) -> ListingResult<ConsistencyReport> {
        let snapshot = read_snapshot(path).map_err(ListingError::persistence)?;
        let metadata_ids = self.store.all_ids()?;
        let report = ConsistencyReport::build(
            path.display().to_string(),
            &metadata_ids,
            &snapshot.ids,
        );
        log_report(&report);
        Ok(report)
    }

    pub fn verify_ids(&self, ids: &[i64]) -> ListingResult<Vec<IdPresence>> {
        verify_ids(&self.store, &self.index, ids)
    }

    pub fn inspect(&self, id: i64) -> ListingResult<ListingInspection> {
        let record = self.store.get_by_id(id)?;
        let vector = match self.index.reconstruct(id) {
            Ok(v) => Some(v),
            Err(ListingError::NotFound(_)) => None,
            Err(other) => return Err(other),
        };
        if record.is_none() && vector.is_none() {
            return Err(ListingError::NotFound(format!(
                "listing {id} is in neither store"
            )));
        }
        Ok(ListingInspection {
            id,
            record,
            in_index: vector.is_some(),
            vector_norm: vector
                .as_ref()
                .map(|v| v.iter().map(|x| x * x).sum::<f32>().sqrt()),
            vector_preview: vector
                .map(|v| v.into_iter().take(VECTOR_PREVIEW_DIMS).collect())
                .unwrap_or_default(),
        })
    }
}

pub(crate) fn verify_ids(
    store: &MetadataStore,
    index: &VectorIndex,
    ids: &[i64],
) -> ListingResult<Vec<IdPresence>> {
    let in_metadata: HashSet<i64> = store.get_many(ids)?.into_iter().map(|r| r.id).collect();
    Ok(ids
        .iter()
        .map(|id| IdPresence {
            id: *id,
            in_metadata: in_metadata.contains(id),
            in_index: index.contains(*id),
        })
        .collect())
}

fn log_report(report: &ConsistencyReport) {
    if report.consistent {
        info!(
            source = %report.index_source,
            metadata = report.metadata_count,
            index = report.index_count,
            "stores consistent"
        );
    } else {
        warn!(
            source = %report.index_source,
            missing = report.missing_in_index.len(),
            orphans = report.orphans_in_index.len(),
            duplicates = report.duplicate_ids_in_index.len(),
            "consistency drift detected"
        );
    }
}
