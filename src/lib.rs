//! amenity-sync: keeps a store of amenity records in step with an OSM node extract
//!
//! The extract is an OSM XML file (optionally `.bz2`-compressed) that is streamed
//! several times per run; the store is never reloaded wholesale. A run works in
//! one direction only, from the extract into the store:
//!
//! 1. **Id passes** -- Collect every node id in the extract, then the ids changed
//!    since a cutoff date
//! 2. **Delete** (optional) -- Remove stored records that disappeared from the extract,
//!    unless a registered consultant still uses them
//! 3. **Create** -- Map and insert nodes that are not stored yet, in batches
//! 4. **Update** -- Rewrite changed records with the new generation number; records
//!    in use are only rewritten when a consultant approves
//!
//! # Key Modules
//!
//! - [`parser`] -- Streaming node reader with id, time and relevance filters
//! - [`mapping`] -- Node to record mapping, category and topic classification
//! - [`store`] -- Store trait with in-memory and bincode file backends
//! - [`writer`] -- Batched creates and deletes, checkpointed updates
//! - [`registry`] -- Usage consultants that protect referenced records
//! - [`sync`] -- The reconciliation run and topic re-application
//! - [`import`] -- Initial bulk import without reconciliation
//! - [`export`] -- CSV export of the store
//! - [`config`] -- Constants and the JSON run configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Seed an empty store from a regional extract
//! amenity-sync import insert -i berlin.osm.bz2 --store amenities.bin
//!
//! # Later: apply everything changed since the first of March
//! amenity-sync reconcile -i berlin.osm.bz2 --store amenities.bin --since 2024-03-01 --delete
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod mapping;
pub mod models;
pub mod parser;
pub mod registry;
pub mod store;
pub mod sync;
pub mod writer;
