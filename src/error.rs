//! Error taxonomy shared by the stores, the insertion protocol and search.

use thiserror::Error;

use crate::search::embedder::EmbedderError;

pub type ListingResult<T> = std::result::Result<T, ListingError>;

#[derive(Debug, Error)]
pub enum ListingError {
    /// Malformed input (empty text, inverted price range, bad parameters).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Embedding service unreachable, timed out, or returned a misaligned batch.
    #[error("embedding service error: {0}")]
    EmbeddingService(#[from] EmbedderError),

    /// Duplicate id, dimension mismatch or misaligned id/vector arrays.
    #[error("index mutation rejected: {0}")]
    IndexMutation(String),

    /// Snapshot write or read failure.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Drift between the metadata store and the vector index.
    #[error(
        "consistency drift: {missing_in_index} id(s) missing in index, {orphans_in_index} orphan(s) in index, {duplicates_in_index} duplicate(s)"
    )]
    Consistency {
        missing_in_index: usize,
        orphans_in_index: usize,
        duplicates_in_index: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata store unavailable or failing.
    #[error("metadata store error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A rollback could not be completed; ingestion refuses further work.
    #[error("ingestion halted pending manual repair: {0}")]
    IngestionHalted(String),

    #[error("batch cancelled during {0}")]
    Cancelled(String),
}

impl ListingError {
    /// Errors that leave the stores in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ListingError::IngestionHalted(_))
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        ListingError::Persistence(format!("{err:#}"))
    }
}
