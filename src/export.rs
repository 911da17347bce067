use crate::parser::TIMESTAMP_FORMAT;
use crate::store::Store;
use anyhow::{Context, Result};
use csv::Writer;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

pub const EXPORT_HEADER: [&str; 14] = [
    "osm_id",
    "name",
    "amenity",
    "category",
    "topics",
    "street",
    "housenumber",
    "postcode",
    "city",
    "country",
    "lon",
    "lat",
    "version",
    "last_update",
];

/// Writes every stored record as CSV in id order. Returns the number of rows.
pub fn export_csv<W: Write>(store: &dyn Store, out: W) -> Result<u64> {
    let mut writer = Writer::from_writer(out);
    writer.write_record(EXPORT_HEADER)?;

    let mut rows = 0u64;
    for amenity in store.records().context("Failed to read store")? {
        let topics = amenity
            .topics
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        let osm_id = amenity.osm_id.to_string();
        let lon = amenity.geo.lon.to_string();
        let lat = amenity.geo.lat.to_string();
        let version = amenity.version.to_string();
        let last_update = amenity.last_update.format(TIMESTAMP_FORMAT).to_string();
        writer.write_record([
            osm_id.as_str(),
            amenity.name.as_str(),
            amenity.amenity.as_str(),
            amenity.category.as_str(),
            topics.as_str(),
            amenity.street.as_str(),
            amenity.housenumber.as_str(),
            amenity.postcode.as_str(),
            amenity.city.as_str(),
            amenity.country.as_str(),
            lon.as_str(),
            lat.as_str(),
            version.as_str(),
            last_update.as_str(),
        ])?;
        rows += 1;
    }

    writer.flush()?;
    Ok(rows)
}

pub fn export_to_path(store: &dyn Store, path: &Path) -> Result<u64> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create export file: {}", path.display()))?;
    let rows = export_csv(store, BufWriter::with_capacity(128 * 1024, file))
        .with_context(|| format!("Failed to write export file: {}", path.display()))?;
    info!(rows, path = %path.display(), "Export complete");
    Ok(rows)
}
