//! Pushes mapped records into a [`Store`].
//!
//! Both entry points consume their record sequence by value: the sequence is a
//! single pass over the extract and is drained exactly once.

use crate::error::{ExtractError, SyncError};
use crate::models::{Amenity, OsmId};
use crate::store::Store;
use indicatif::ProgressBar;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Commit points reached (batches or update checkpoints).
    pub checkpoints: u64,
    pub written: u64,
    /// Updates whose target id no longer exists in the store.
    pub missing: u64,
}

pub struct BatchWriter {
    progress: ProgressBar,
}

impl BatchWriter {
    pub fn new(progress: ProgressBar) -> Self {
        Self { progress }
    }

    /// One `insert_many` call per chunk of `batch_size` records, each followed by
    /// a flush. Stops at the first empty chunk.
    pub fn create_batched<I>(
        &self,
        store: &mut dyn Store,
        records: I,
        batch_size: usize,
    ) -> Result<WriteSummary, SyncError>
    where
        I: Iterator<Item = Result<Amenity, ExtractError>>,
    {
        let batch_size = batch_size.max(1);
        let mut records = records;
        let mut summary = WriteSummary::default();

        loop {
            let batch = records
                .by_ref()
                .take(batch_size)
                .collect::<Result<Vec<_>, _>>()?;
            if batch.is_empty() {
                break;
            }

            let size = batch.len() as u64;
            store
                .insert_many(batch)
                .map_err(SyncError::write("creating records"))?;
            store.flush().map_err(SyncError::write("creating records"))?;

            summary.checkpoints += 1;
            summary.written += size;
            self.progress.set_message(format!("created {}", summary.written));
            self.progress.tick();
            debug!(batch = summary.checkpoints, created = summary.written, "Batch committed");
        }

        Ok(summary)
    }

    /// One `update` call per record; flushes every `checkpoint_every` records and at the end.
    pub fn update_streamed<I>(
        &self,
        store: &mut dyn Store,
        records: I,
        checkpoint_every: u64,
    ) -> Result<WriteSummary, SyncError>
    where
        I: Iterator<Item = Result<Amenity, ExtractError>>,
    {
        let checkpoint_every = checkpoint_every.max(1);
        let mut summary = WriteSummary::default();
        let mut seen = 0u64;

        for record in records {
            let record = record?;
            let osm_id = record.osm_id;
            seen += 1;

            if store
                .update(record)
                .map_err(SyncError::write("updating records"))?
            {
                summary.written += 1;
            } else {
                warn!(osm_id, "Update target vanished from the store");
                summary.missing += 1;
            }

            if seen % checkpoint_every == 0 {
                self.checkpoint(store, &mut summary, "updating records")?;
            }
        }

        if seen % checkpoint_every != 0 {
            self.checkpoint(store, &mut summary, "updating records")?;
        }
        Ok(summary)
    }

    /// Deletes `ids` in chunks of `batch_size`, flushing after each chunk.
    pub fn delete_batched(
        &self,
        store: &mut dyn Store,
        ids: &[OsmId],
        batch_size: usize,
    ) -> Result<WriteSummary, SyncError> {
        let mut summary = WriteSummary::default();
        for chunk in ids.chunks(batch_size.max(1)) {
            let removed = store
                .delete_ids(chunk)
                .map_err(SyncError::write("deleting records"))?;
            summary.written += removed as u64;
            self.checkpoint(store, &mut summary, "deleting records")?;
        }
        Ok(summary)
    }

    fn checkpoint(
        &self,
        store: &mut dyn Store,
        summary: &mut WriteSummary,
        step: &'static str,
    ) -> Result<(), SyncError> {
        store.flush().map_err(SyncError::write(step))?;
        summary.checkpoints += 1;
        self.progress.set_message(format!("{step}: {}", summary.written));
        self.progress.tick();
        debug!(step, checkpoint = summary.checkpoints, written = summary.written, "Checkpoint");
        Ok(())
    }
}
