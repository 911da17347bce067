use crate::mapping::{AmenityMapper, PriorityCategory, TopicRules};
use crate::models::OsmId;
use crate::registry::{ProtectedIds, UsageRegistry};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

/// Records per bulk-create call
pub const CREATE_BATCH_SIZE: usize = 1000;

/// Ids per delete call
pub const DELETE_BATCH_SIZE: usize = 100;

/// Streamed updates between progress checkpoints (and store flushes)
pub const CHECKPOINT_INTERVAL: u64 = 1000;

/// Unit of the `--skip` argument, in node elements
pub const IMPORT_BATCH_SIZE: usize = 1000;

/// Progress update interval (tick every N nodes)
pub const PROGRESS_INTERVAL: u64 = 1000;

/// Bumped whenever the persisted store layout changes
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Read buffer for extract files
pub const EXTRACT_BUFFER_SIZE: usize = 256 * 1024;

/// Optional JSON configuration shared by the `import`, `reconcile` and `retopic` commands.
///
/// ```json
/// {
///   "topics": { "food": [["amenity", "restaurant"], ["shop", "*"]] },
///   "category_keys": ["amenity", "shop", "tourism"],
///   "delete_obsolete": false,
///   "protected_ids": [4711]
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub topics: Option<TopicRules>,
    pub category_keys: Option<Vec<String>>,
    pub delete_obsolete: bool,
    pub protected_ids: Vec<OsmId>,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let config: SyncConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(
            topics = config.topics.as_ref().map_or(0, TopicRules::len),
            protected = config.protected_ids.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn mapper(&self) -> AmenityMapper {
        let classifier = match &self.category_keys {
            Some(keys) => PriorityCategory::new(keys.clone()),
            None => PriorityCategory::default(),
        };
        AmenityMapper::new(Box::new(classifier), self.topics.clone())
    }

    /// Registry holding the consultants this configuration declares.
    pub fn registry(&self) -> UsageRegistry {
        let mut registry = UsageRegistry::new();
        if !self.protected_ids.is_empty() {
            registry.register(Box::new(ProtectedIds::new(
                self.protected_ids.iter().copied(),
            )));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tags;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(json.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn missing_path_yields_defaults() {
        let config = SyncConfig::load_or_default(None).unwrap();
        assert!(config.topics.is_none());
        assert!(config.category_keys.is_none());
        assert!(!config.delete_obsolete);
        assert!(config.registry().is_empty());
    }

    #[test]
    fn loads_all_fields() {
        let tmp = write_config(
            r#"{
                "topics": {"food": [["amenity", "cafe"]]},
                "category_keys": ["tourism"],
                "delete_obsolete": true,
                "protected_ids": [7, 8]
            }"#,
        );
        let config = SyncConfig::load(tmp.path()).unwrap();
        assert!(config.delete_obsolete);
        assert_eq!(config.protected_ids, vec![7, 8]);
        assert_eq!(config.registry().len(), 1);

        let tags: Tags = [("tourism", "museum"), ("amenity", "cafe")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mapper = config.mapper();
        assert_eq!(mapper.category(&tags), "museum");
        assert!(mapper.topics(&tags).contains("food"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let tmp = write_config(r#"{"categoryFunc": "custom"}"#);
        assert!(SyncConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn rejects_malformed_rules() {
        let tmp = write_config(r#"{"topics": {"food": ["amenity"]}}"#);
        assert!(SyncConfig::load(tmp.path()).is_err());
    }
}
