use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node id as it appears in the extract.
pub type OsmId = i64;

pub type IdSet = FxHashSet<OsmId>;

/// Modification time of each node seen by a pass.
pub type Timestamps = FxHashMap<OsmId, DateTime<Utc>>;

/// Raw `k`/`v` pairs of a node, in key order.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

/// One `node` element as read from the extract.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: OsmId,
    pub geo: GeoPoint,
    pub timestamp: DateTime<Utc>,
    /// Empty when the pass was opened without tags.
    pub tags: Tags,
}

/// A point of interest as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amenity {
    pub osm_id: OsmId,
    pub name: String,
    pub geo: GeoPoint,
    pub country: String,
    pub street: String,
    pub housenumber: String,
    pub postcode: String,
    pub city: String,
    /// The `amenity` tag, or `shop` when no `amenity` tag is present.
    pub amenity: String,
    pub category: String,
    pub topics: BTreeSet<String>,
    /// Every raw tag not captured by a dedicated field.
    pub tags: Tags,
    /// Generation of the reconciliation run that last wrote this record.
    pub version: u32,
    pub last_update: DateTime<Utc>,
}

impl Amenity {
    pub fn address(&self) -> String {
        [
            format!("{} {}", self.street, self.housenumber),
            format!("{} {}", self.postcode, self.city),
        ]
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn amenity(street: &str, housenumber: &str, postcode: &str, city: &str) -> Amenity {
        Amenity {
            osm_id: 1,
            name: "Cafe".to_string(),
            geo: GeoPoint { lon: 13.4, lat: 52.5 },
            country: "DE".to_string(),
            street: street.to_string(),
            housenumber: housenumber.to_string(),
            postcode: postcode.to_string(),
            city: city.to_string(),
            amenity: "cafe".to_string(),
            category: "cafe".to_string(),
            topics: BTreeSet::new(),
            tags: Tags::new(),
            version: 1,
            last_update: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn address_joins_both_lines() {
        let a = amenity("Hauptstr.", "12a", "10115", "Berlin");
        assert_eq!(a.address(), "Hauptstr. 12a\n10115 Berlin");
    }

    #[test]
    fn address_skips_empty_lines() {
        let a = amenity("", "", "10115", "Berlin");
        assert_eq!(a.address(), "10115 Berlin");
        assert_eq!(amenity("", "", "", "").address(), "");
    }

    #[test]
    fn address_trims_partial_lines() {
        let a = amenity("Hauptstr.", "", "", "Berlin");
        assert_eq!(a.address(), "Hauptstr.\nBerlin");
    }
}
