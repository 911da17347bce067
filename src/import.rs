//! Initial bulk ingestion of an extract, without reconciliation.
//!
//! Only nodes carrying an `amenity` or `shop` tag are imported, at version 0,
//! so the first reconciliation run after an import starts at generation 1.

use crate::config::{CHECKPOINT_INTERVAL, CREATE_BATCH_SIZE, IMPORT_BATCH_SIZE};
use crate::error::SyncError;
use crate::mapping::AmenityMapper;
use crate::parser::{open_nodes, ExtractSource, NodeFilter};
use crate::store::Store;
use crate::writer::BatchWriter;
use clap::ValueEnum;
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, info};

const IMPORT_VERSION: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImportMode {
    /// Create every record in batches, without existence checks
    Insert,
    /// Create records one by one, skipping ids already stored
    Update,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub mode: ImportMode,
    /// Number of `IMPORT_BATCH_SIZE` blocks of node elements to skip.
    pub skip_batches: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: u64,
    pub existing: u64,
    pub checkpoints: u64,
}

pub fn run_import<S>(
    source: &S,
    store: &mut dyn Store,
    mapper: &AmenityMapper,
    options: &ImportOptions,
    progress: &ProgressBar,
) -> Result<ImportSummary, SyncError>
where
    S: ExtractSource + ?Sized,
{
    let skip = options.skip_batches * IMPORT_BATCH_SIZE as u64;
    info!(mode = ?options.mode, skip, "Starting import");

    let nodes = open_nodes(source, NodeFilter::all().relevant())?
        .skip_nodes(skip)
        .with_progress(progress.clone());
    let records = nodes.map(|node| node.map(|n| mapper.map(n, IMPORT_VERSION)));

    let summary = match options.mode {
        ImportMode::Insert => {
            let written = BatchWriter::new(progress.clone()).create_batched(
                store,
                records,
                CREATE_BATCH_SIZE,
            )?;
            ImportSummary {
                created: written.written,
                existing: 0,
                checkpoints: written.checkpoints,
            }
        }
        ImportMode::Update => {
            let mut summary = ImportSummary::default();
            for (i, record) in records.enumerate() {
                let record = record?;
                if store
                    .contains(record.osm_id)
                    .map_err(SyncError::StoreRead)?
                {
                    summary.existing += 1;
                } else {
                    store
                        .insert_many(vec![record])
                        .map_err(SyncError::write("importing records"))?;
                    summary.created += 1;
                }

                if (i as u64 + 1) % CHECKPOINT_INTERVAL == 0 {
                    store.flush().map_err(SyncError::write("importing records"))?;
                    summary.checkpoints += 1;
                    progress.set_message(format!("imported {}", i + 1));
                    debug!(processed = i + 1, created = summary.created, "Checkpoint");
                }
            }
            store.flush().map_err(SyncError::write("importing records"))?;
            summary
        }
    };

    progress.finish_and_clear();
    info!(
        created = summary.created,
        existing = summary.existing,
        "Import complete"
    );
    Ok(summary)
}
