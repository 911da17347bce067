//! Streaming reader over OSM XML node extracts.
//!
//! A [`NodeReader`] is a single forward pass: it yields nodes lazily, keeps one
//! node resident at a time, and cannot be rewound. Every further pass over the
//! same extract goes through [`ExtractSource::open`] again and pays a full
//! traversal of the file.

use crate::config::{EXTRACT_BUFFER_SIZE, PROGRESS_INTERVAL};
use crate::error::ExtractError;
use crate::models::{GeoPoint, IdSet, OsmId, RawNode, Tags, Timestamps};
use bzip2::read::BzDecoder;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use indicatif::ProgressBar;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
pub const CUTOFF_FORMAT: &str = "%Y-%m-%d";

/// Keys that make a node worth importing when no id set narrows the pass.
pub const RELEVANT_KEYS: &[&str] = &["amenity", "shop"];

/// A byte source that can be reopened from the start for every pass.
pub trait ExtractSource {
    fn open(&self) -> io::Result<Box<dyn BufRead + '_>>;
}

/// An extract on disk; `.bz2` files are decompressed on the fly.
#[derive(Debug, Clone)]
pub struct ExtractFile {
    path: PathBuf,
}

impl ExtractFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_compressed(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bz2"))
    }
}

impl ExtractSource for ExtractFile {
    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        let file = File::open(&self.path)?;
        debug!(path = ?self.path, compressed = self.is_compressed(), "Opening extract");
        if self.is_compressed() {
            Ok(Box::new(BufReader::with_capacity(
                EXTRACT_BUFFER_SIZE,
                BzDecoder::new(file),
            )))
        } else {
            Ok(Box::new(BufReader::with_capacity(EXTRACT_BUFFER_SIZE, file)))
        }
    }
}

impl ExtractSource for [u8] {
    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(self))
    }
}

impl ExtractSource for str {
    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(self.as_bytes()))
    }
}

/// Filters applied while a pass streams; all of them are optional and combine with AND.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    ids: Option<IdSet>,
    since: Option<DateTime<Utc>>,
    relevant_only: bool,
    with_tags: bool,
}

impl NodeFilter {
    /// Every node, tags included.
    pub fn all() -> Self {
        Self {
            with_tags: true,
            ..Self::default()
        }
    }

    /// Every node; child `tag` elements are skipped without being decoded.
    pub fn ids_only() -> Self {
        Self::default()
    }

    /// Only nodes whose id is in `ids`.
    pub fn with_ids(mut self, ids: IdSet) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Only nodes modified at or after `cutoff`.
    pub fn since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.since = Some(cutoff);
        self
    }

    /// Only nodes carrying one of [`RELEVANT_KEYS`]. Forces tag decoding.
    pub fn relevant(mut self) -> Self {
        self.relevant_only = true;
        self.with_tags = true;
        self
    }

    fn accepts(&self, id: OsmId, timestamp: &DateTime<Utc>) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return false;
            }
        }
        match &self.since {
            Some(cutoff) => timestamp >= cutoff,
            None => true,
        }
    }
}

pub fn is_relevant(tags: &Tags) -> bool {
    RELEVANT_KEYS.iter().any(|key| tags.contains_key(*key))
}

pub struct NodeReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    skip_buf: Vec<u8>,
    filter: NodeFilter,
    skip: u64,
    seen: u64,
    progress: Option<ProgressBar>,
    done: bool,
}

impl<R: BufRead> NodeReader<R> {
    pub fn new(input: R, filter: NodeFilter) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            skip_buf: Vec::with_capacity(1024),
            filter,
            skip: 0,
            seen: 0,
            progress: None,
            done: false,
        }
    }

    /// Skip the first `count` node elements, counted before any filter.
    pub fn skip_nodes(mut self, count: u64) -> Self {
        self.skip = count;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Node elements encountered so far, filtered or not.
    pub fn nodes_seen(&self) -> u64 {
        self.seen
    }

    fn next_node(&mut self) -> Result<Option<RawNode>, ExtractError> {
        loop {
            self.buf.clear();
            let position = self.reader.buffer_position();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(source) => return Err(ExtractError::Parse { position, source }),
            };

            let (node, has_children) = match event {
                Event::Start(e) if e.name().as_ref() == b"node" => {
                    (parse_node_header(&e, position)?, true)
                }
                Event::Empty(e) if e.name().as_ref() == b"node" => {
                    (parse_node_header(&e, position)?, false)
                }
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                _ => continue,
            };

            self.seen += 1;
            if self.seen % PROGRESS_INTERVAL == 0 {
                if let Some(pb) = &self.progress {
                    pb.set_position(self.seen);
                }
            }

            if self.seen <= self.skip || !self.filter.accepts(node.id, &node.timestamp) {
                if has_children {
                    self.skip_children(position)?;
                }
                continue;
            }

            let node = if has_children {
                if self.filter.with_tags {
                    let tags = self.read_tags(node.id)?;
                    RawNode { tags, ..node }
                } else {
                    self.skip_children(position)?;
                    node
                }
            } else {
                node
            };

            if self.filter.relevant_only && !is_relevant(&node.tags) {
                continue;
            }
            return Ok(Some(node));
        }
    }

    fn skip_children(&mut self, position: usize) -> Result<(), ExtractError> {
        self.skip_buf.clear();
        self.reader
            .read_to_end_into(QName(b"node"), &mut self.skip_buf)
            .map_err(|source| ExtractError::Parse { position, source })?;
        Ok(())
    }

    fn read_tags(&mut self, id: OsmId) -> Result<Tags, ExtractError> {
        let mut tags = Tags::new();
        loop {
            self.buf.clear();
            let position = self.reader.buffer_position();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(source) => return Err(ExtractError::Parse { position, source }),
            };
            match event {
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"tag" => {
                    let (key, value) = parse_tag(&e, position)?;
                    tags.insert(key, value);
                }
                Event::End(e) if e.name().as_ref() == b"node" => return Ok(tags),
                Event::Eof => return Err(ExtractError::Truncated { id, position }),
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for NodeReader<R> {
    type Item = Result<RawNode, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_node() {
            Ok(node) => node.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead> FusedIterator for NodeReader<R> {}

/// Opens a fresh pass over `source`.
pub fn open_nodes<'s, S>(
    source: &'s S,
    filter: NodeFilter,
) -> Result<NodeReader<Box<dyn BufRead + 's>>, ExtractError>
where
    S: ExtractSource + ?Sized,
{
    Ok(NodeReader::new(source.open()?, filter))
}

/// Runs a full pass and collects the ids that pass `filter`. Tags are never decoded
/// unless the filter needs them.
pub fn collect_ids<S>(
    source: &S,
    filter: NodeFilter,
    progress: &ProgressBar,
) -> Result<IdSet, ExtractError>
where
    S: ExtractSource + ?Sized,
{
    let mut reader = open_nodes(source, filter)?.with_progress(progress.clone());
    let mut ids = IdSet::default();
    for node in reader.by_ref() {
        ids.insert(node?.id);
    }

    info!(
        nodes = reader.nodes_seen(),
        matched = ids.len(),
        "Id pass complete"
    );
    Ok(ids)
}

/// Like [`collect_ids`], keeping each node's modification time.
pub fn collect_timestamps<S>(
    source: &S,
    filter: NodeFilter,
    progress: &ProgressBar,
) -> Result<Timestamps, ExtractError>
where
    S: ExtractSource + ?Sized,
{
    let mut reader = open_nodes(source, filter)?.with_progress(progress.clone());
    let mut stamps = Timestamps::default();
    for node in reader.by_ref() {
        let node = node?;
        stamps.insert(node.id, node.timestamp);
    }

    info!(
        nodes = reader.nodes_seen(),
        matched = stamps.len(),
        "Timestamp pass complete"
    );
    Ok(stamps)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parses a `YYYY-MM-DD` cutoff as midnight UTC.
pub fn parse_cutoff(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDate::parse_from_str(value, CUTOFF_FORMAT)
        .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

fn parse_node_header(e: &BytesStart, position: usize) -> Result<RawNode, ExtractError> {
    let mut id = None;
    let mut lat = None;
    let mut lon = None;
    let mut timestamp = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|err| ExtractError::Parse {
            position,
            source: quick_xml::Error::InvalidAttr(err),
        })?;
        let slot = match attr.key.as_ref() {
            b"id" => &mut id,
            b"lat" => &mut lat,
            b"lon" => &mut lon,
            b"timestamp" => &mut timestamp,
            _ => continue,
        };
        let value = attr
            .unescape_value()
            .map_err(|source| ExtractError::Parse { position, source })?;
        *slot = Some(value.into_owned());
    }

    let id: OsmId = parse_attribute("id", id, position)?;
    let lat: f64 = parse_attribute("lat", lat, position)?;
    let lon: f64 = parse_attribute("lon", lon, position)?;
    let timestamp = timestamp.ok_or_else(|| missing("timestamp", position))?;
    let timestamp = parse_timestamp(&timestamp).map_err(|source| ExtractError::Format {
        value: timestamp.clone(),
        position,
        source,
    })?;

    Ok(RawNode {
        id,
        geo: GeoPoint { lon, lat },
        timestamp,
        tags: Tags::new(),
    })
}

fn parse_tag(e: &BytesStart, position: usize) -> Result<(String, String), ExtractError> {
    let mut key = None;
    let mut value = None;
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ExtractError::Parse {
            position,
            source: quick_xml::Error::InvalidAttr(err),
        })?;
        let slot = match attr.key.as_ref() {
            b"k" => &mut key,
            b"v" => &mut value,
            _ => continue,
        };
        let decoded = attr
            .unescape_value()
            .map_err(|source| ExtractError::Parse { position, source })?;
        *slot = Some(decoded.into_owned());
    }
    Ok((
        key.ok_or_else(|| missing("k", position))?,
        value.ok_or_else(|| missing("v", position))?,
    ))
}

fn parse_attribute<T>(
    attribute: &'static str,
    value: Option<String>,
    position: usize,
) -> Result<T, ExtractError>
where
    T: FromStr,
    T::Err: Display,
{
    let value = value.ok_or_else(|| missing(attribute, position))?;
    value.parse().map_err(|err| ExtractError::MalformedRecord {
        attribute,
        position,
        reason: format!("{value:?}: {err}"),
    })
}

fn missing(attribute: &'static str, position: usize) -> ExtractError {
    ExtractError::MalformedRecord {
        attribute,
        position,
        reason: "missing".to_string(),
    }
}
