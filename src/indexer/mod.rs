//! Two-store insertion protocol.
//!
//! A batch moves through an explicit state machine:
//!
//! ```text
//! Pending -> MetadataInserted -> Embedded -> Staged -> Indexed -> Persisted
//!     \______________\_______________\__________\_________\_____-> RolledBack
//! ```
//!
//! Metadata rows are written inside one open transaction, so their ids exist
//! before the embeddings do but nobody can read them yet. Embeddings are
//! validated into a [`PendingBatch`] while the live index is untouched. Only
//! then does metadata commit, the pending batch merge into the index, and the
//! snapshot persist, all while the index mutation lock is held.
//!
//! Before the commit, rollback is a plain transaction rollback. After it, the
//! merged ids are removed from the index exactly (no other writer can have run
//! in between) and the committed rows are deleted. A rollback that itself fails
//! halts ingestion until [`InsertionCoordinator::clear_halt`] is called.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{self, IdPresence};
use crate::error::{ListingError, ListingResult};
use crate::extract::{FieldExtractor, RegexExtractor};
use crate::model::types::{ListingInput, NewListing};
use crate::search::embedder::{EmbeddingClient, validate_embeddings};
use crate::search::vector_index::{IndexWriter, PendingBatch, VectorIndex, read_snapshot};
use crate::storage::sqlite::{MetadataBatch, MetadataStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    MetadataInserted,
    Embedded,
    Staged,
    Indexed,
    Persisted,
    RolledBack,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::MetadataInserted => "metadata_inserted",
            BatchState::Embedded => "embedded",
            BatchState::Staged => "staged",
            BatchState::Indexed => "indexed",
            BatchState::Persisted => "persisted",
            BatchState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Persisted | BatchState::RolledBack)
    }
}

/// Cooperative cancellation shared between a caller and an in-flight batch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct BatchRun<'a> {
    state: BatchState,
    size: usize,
    cancel: &'a CancelFlag,
}

impl<'a> BatchRun<'a> {
    fn new(size: usize, cancel: &'a CancelFlag) -> Self {
        Self {
            state: BatchState::Pending,
            size,
            cancel,
        }
    }

    /// Cancellation counts as a failure of the step in progress.
    fn check_cancel(&self) -> ListingResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ListingError::Cancelled(self.state.as_str().to_string()));
        }
        Ok(())
    }

    fn advance(&mut self, next: BatchState) -> ListingResult<()> {
        if !next.is_terminal() {
            self.check_cancel()?;
        }
        debug!(
            from = self.state.as_str(),
            to = next.as_str(),
            batch_size = self.size,
            "batch transition"
        );
        self.state = next;
        Ok(())
    }
}

pub struct InsertionCoordinator {
    store: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Arc<dyn FieldExtractor>,
    halted: Mutex<Option<String>>,
}

impl InsertionCoordinator {
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
            extractor: Arc::new(RegexExtractor),
            halted: Mutex::new(None),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FieldExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn insert(&self, text: &str, owner_id: &str, owner_name: &str) -> ListingResult<i64> {
        let ids = self.batch_insert(&[ListingInput::new(text, owner_id, owner_name)])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| ListingError::IndexMutation("single insert produced no id".into()))
    }

    /// Insert `items` as one unit; ids come back in input order.
    pub fn batch_insert(&self, items: &[ListingInput]) -> ListingResult<Vec<i64>> {
        self.batch_insert_with_cancel(items, &CancelFlag::new())
    }

    pub fn batch_insert_with_cancel(
        &self,
        items: &[ListingInput],
        cancel: &CancelFlag,
    ) -> ListingResult<Vec<i64>> {
        self.ensure_running()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let mut run = BatchRun::new(items.len(), cancel);
        run.check_cancel()?;

        let mut batch = self.store.begin_batch()?;
        let pending = match self.prepare(&mut run, &mut batch, items) {
            Ok(pending) => pending,
            Err(err) => return Err(self.rollback_uncommitted(&mut run, batch, err)),
        };

        // A failed COMMIT rolls the transaction back when the batch drops.
        let ids = match batch.commit() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(batch_size = run.size, error = %err, "metadata commit failed; batch rolled back");
                run.state = BatchState::RolledBack;
                return Err(err);
            }
        };

        let mut writer = self.index.writer();
        if let Err(err) = writer.merge(pending) {
            return Err(self.rollback_committed(&mut run, &mut writer, &ids, false, err));
        }
        if let Err(err) = run
            .advance(BatchState::Indexed)
            .and_then(|()| writer.persist())
        {
            return Err(self.rollback_committed(&mut run, &mut writer, &ids, true, err));
        }
        run.advance(BatchState::Persisted)?;
        drop(writer);

        info!(
            batch_size = ids.len(),
            first_id = ids.first().copied(),
            last_id = ids.last().copied(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );
        Ok(ids)
    }

    /// Everything up to the metadata commit. Nothing here is visible to readers.
    fn prepare(
        &self,
        run: &mut BatchRun<'_>,
        batch: &mut MetadataBatch<'_>,
        items: &[ListingInput],
    ) -> ListingResult<PendingBatch> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let listing = NewListing::from_input(item, self.extractor.extract(&item.text));
            ids.push(batch.insert(&listing)?);
        }
        run.advance(BatchState::MetadataInserted)?;

        let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        run.advance(BatchState::Embedded)?;

        validate_embeddings(&embeddings, ids.len(), self.index.dimension())?;
        // Position i of `embeddings` belongs to `ids[i]`; never reorder either.
        let pending = self.index.stage(ids, embeddings)?;
        run.advance(BatchState::Staged)?;
        Ok(pending)
    }

    fn rollback_uncommitted(
        &self,
        run: &mut BatchRun<'_>,
        batch: MetadataBatch<'_>,
        cause: ListingError,
    ) -> ListingError {
        let ids = batch.ids().to_vec();
        warn!(
            state = run.state.as_str(),
            batch_size = run.size,
            ids = ?ids,
            error = %cause,
            "rolling back uncommitted batch"
        );
        match batch.rollback() {
            Ok(()) => {
                run.state = BatchState::RolledBack;
                cause
            }
            Err(rb) => self.halt(format!(
                "metadata rollback for ids {ids:?} failed ({rb}) after: {cause}"
            )),
        }
    }

    fn rollback_committed(
        &self,
        run: &mut BatchRun<'_>,
        writer: &mut IndexWriter<'_>,
        ids: &[i64],
        merged: bool,
        cause: ListingError,
    ) -> ListingError {
        warn!(
            state = run.state.as_str(),
            batch_size = run.size,
            ids = ?ids,
            merged,
            error = %cause,
            "rolling back committed batch"
        );
        if merged {
            let removed = writer.remove_ids(ids);
            if removed != ids.len() {
                warn!(
                    expected = ids.len(),
                    removed, "exact discard incomplete; reloading vector snapshot"
                );
                if let Err(reload) = writer.reload_from_snapshot() {
                    return self.halt(format!(
                        "vector index reload failed ({reload}) after: {cause}"
                    ));
                }
                writer.remove_ids(ids);
            }
            if let Err(scrub) = self.scrub_snapshot(writer, ids) {
                return self.halt(format!(
                    "rewriting vector snapshot without ids {ids:?} failed ({scrub}) after: {cause}"
                ));
            }
        }
        if let Err(del) = self.store.delete_many(ids) {
            return self.halt(format!(
                "deleting metadata rows {ids:?} failed ({del}) after: {cause}"
            ));
        }
        run.state = BatchState::RolledBack;
        cause
    }

    /// Rewrite the snapshot if a persist that reported failure still landed the batch.
    fn scrub_snapshot(&self, writer: &mut IndexWriter<'_>, ids: &[i64]) -> ListingResult<()> {
        let Some(path) = self.index.snapshot_path() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let on_disk = read_snapshot(path).map_err(ListingError::persistence)?;
        let batch: HashSet<i64> = ids.iter().copied().collect();
        let stale = on_disk.ids.iter().filter(|id| batch.contains(id)).count();
        if stale > 0 {
            warn!(path = %path.display(), stale, "snapshot holds rolled-back ids; rewriting");
            writer.persist()?;
        }
        Ok(())
    }

    pub(crate) fn halt(&self, reason: String) -> ListingError {
        error!(reason = %reason, "ingestion halted; manual repair required");
        *self.halted.lock() = Some(reason.clone());
        ListingError::IngestionHalted(reason)
    }

    fn ensure_running(&self) -> ListingResult<()> {
        match self.halted.lock().as_ref() {
            Some(reason) => Err(ListingError::IngestionHalted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    /// Resume ingestion after the stores were repaired by hand.
    pub fn clear_halt(&self) {
        if let Some(reason) = self.halted.lock().take() {
            info!(previous = %reason, "ingestion halt cleared");
        }
    }

    /// Report, per id, whether each store holds it.
    pub fn verify_ids(&self, ids: &[i64]) -> ListingResult<Vec<IdPresence>> {
        audit::verify_ids(&self.store, &self.index, ids)
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }
}
