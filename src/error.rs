//! Error types for extract reading, persistence and reconciliation.

use crate::models::OsmId;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading an extract. Every variant aborts the pass it occurs in.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to open extract: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed XML structure.
    #[error("malformed extract at byte {position}: {source}")]
    Parse {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    /// The stream ended inside a `node` element.
    #[error("extract ends inside node {id} at byte {position}")]
    Truncated { id: OsmId, position: usize },

    #[error("unparseable timestamp {value:?} at byte {position}: {source}")]
    Format {
        value: String,
        position: usize,
        #[source]
        source: chrono::ParseError,
    },

    /// A node is missing a required attribute or carries one that does not parse.
    #[error("node at byte {position} has invalid `{attribute}`: {reason}")]
    MalformedRecord {
        attribute: &'static str,
        position: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode store {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("store file {} has format version {found}, expected {expected}", path.display())]
    FormatVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("record {0} already exists")]
    Duplicate(OsmId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Errors that abort a reconciliation step or the whole run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("store read failed: {0}")]
    StoreRead(#[source] StoreError),

    /// Batches committed before the failure stay committed.
    #[error("store write failed while {step}: {source}")]
    StoreWrite {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("consultant {name} failed: {source}")]
    Consultant {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    pub(crate) fn write(step: &'static str) -> impl FnOnce(StoreError) -> SyncError {
        move |source| SyncError::StoreWrite { step, source }
    }
}
