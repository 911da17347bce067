use crate::models::{Amenity, RawNode, Tags};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

static NUM_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+").unwrap());

/// Tags captured by dedicated fields; everything else stays in `Amenity::tags`.
pub const BASIC_KEYS: &[&str] = &[
    "name",
    "addr:country",
    "addr:street",
    "addr:housenumber",
    "addr:postcode",
    "addr:city",
];

/// Default category priority: the first key present wins.
pub const CATEGORY_KEYS: &[&str] = &["amenity", "shop", "tourism", "government"];

/// Rule value matching any value of the rule key.
pub const WILDCARD: &str = "*";

const HOUSENUMBER_MAX_CHARS: usize = 10;
const COUNTRY_MAX_CHARS: usize = 2;

/// Derives the single category string of a node from its raw tags.
pub trait CategoryClassifier {
    fn classify(&self, tags: &Tags) -> String;
}

impl<F> CategoryClassifier for F
where
    F: Fn(&Tags) -> String,
{
    fn classify(&self, tags: &Tags) -> String {
        self(tags)
    }
}

/// Picks the value of the first key in `keys` the node carries.
#[derive(Debug, Clone)]
pub struct PriorityCategory {
    keys: Vec<String>,
}

impl PriorityCategory {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

impl Default for PriorityCategory {
    fn default() -> Self {
        Self::new(CATEGORY_KEYS.iter().map(|k| k.to_string()).collect())
    }
}

impl CategoryClassifier for PriorityCategory {
    fn classify(&self, tags: &Tags) -> String {
        self.keys
            .iter()
            .find_map(|key| tags.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// Topic name to `(key, value)` rules. A topic applies when any rule's key is
/// present and its value matches, or the rule value is [`WILDCARD`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TopicRules(BTreeMap<String, Vec<(String, String)>>);

impl TopicRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic<K, V>(mut self, topic: &str, rules: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(
            topic.to_string(),
            rules.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn topics_for(&self, tags: &Tags) -> BTreeSet<String> {
        self.0
            .iter()
            .filter(|(_, rules)| matches_any(tags, rules))
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

fn matches_any(tags: &Tags, rules: &[(String, String)]) -> bool {
    rules.iter().any(|(key, expected)| match tags.get(key) {
        Some(value) => value == expected || expected == WILDCARD,
        None => false,
    })
}

/// Clears housenumbers that do not start with a digit, truncates the rest.
pub fn clean_housenumber(raw: &str) -> String {
    if !raw.is_empty() && !NUM_START.is_match(raw) {
        return String::new();
    }
    raw.chars().take(HOUSENUMBER_MAX_CHARS).collect()
}

pub fn clean_country(raw: &str) -> String {
    raw.chars().take(COUNTRY_MAX_CHARS).collect()
}

/// Turns raw nodes into records, applying the data-quality rules and the
/// configured classification strategies.
pub struct AmenityMapper {
    classifier: Box<dyn CategoryClassifier>,
    topics: Option<TopicRules>,
}

impl Default for AmenityMapper {
    fn default() -> Self {
        Self::new(Box::new(PriorityCategory::default()), None)
    }
}

impl AmenityMapper {
    pub fn new(classifier: Box<dyn CategoryClassifier>, topics: Option<TopicRules>) -> Self {
        Self { classifier, topics }
    }

    pub fn category(&self, tags: &Tags) -> String {
        self.classifier.classify(tags)
    }

    pub fn topics(&self, tags: &Tags) -> BTreeSet<String> {
        self.topics
            .as_ref()
            .map(|rules| rules.topics_for(tags))
            .unwrap_or_default()
    }

    pub fn map(&self, node: RawNode, version: u32) -> Amenity {
        let category = self.category(&node.tags);
        let topics = self.topics(&node.tags);

        let basic = |key: &str| node.tags.get(key).cloned().unwrap_or_default();
        let amenity = node
            .tags
            .get("amenity")
            .or_else(|| node.tags.get("shop"))
            .cloned()
            .unwrap_or_default();
        let name = basic("name");
        let country = clean_country(&basic("addr:country"));
        let street = basic("addr:street");
        let housenumber = clean_housenumber(&basic("addr:housenumber"));
        let postcode = basic("addr:postcode");
        let city = basic("addr:city");

        let tags = node
            .tags
            .into_iter()
            .filter(|(key, _)| !BASIC_KEYS.contains(&key.as_str()))
            .collect();

        Amenity {
            osm_id: node.id,
            name,
            geo: node.geo,
            country,
            street,
            housenumber,
            postcode,
            city,
            amenity,
            category,
            topics,
            tags,
            version,
            last_update: node.timestamp,
        }
    }
}
