//! Feed parsers.
//!
//! A parser is a pure transform from downloaded bytes plus type-specific
//! options to a [`ParsedFeed`], which the database layer applies in a single
//! transaction. Parsers are looked up by the feed's `type` string so new
//! parsers can be added without a config or protocol break.

pub mod gtfs_realtime;
pub mod gtfs_static;
pub mod nyct_csv;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

pub use self::gtfs_realtime::GtfsRealtimeData;
pub use self::gtfs_static::GtfsStaticData;
pub use self::nyct_csv::NyctStationRow;

pub const GTFS_STATIC: &str = "GTFS_STATIC";
pub const GTFS_REALTIME: &str = "GTFS_REALTIME";
pub const NYCT_SUBWAY_CSV: &str = "NYCT_SUBWAY_CSV";

/// Feed types that are polled sub-minute by default.
pub fn is_realtime(feed_type: &str) -> bool {
    feed_type == GTFS_REALTIME
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The parser options are malformed for this parser. The admin install
    /// validates options, so hitting this at update time indicates a bug.
    #[error("Invalid parser options: {0}")]
    InvalidOptions(String),
    #[error("Malformed feed: {0}")]
    Malformed(String),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The result of parsing one feed download. Opaque to the scheduler; the
/// database layer knows how to apply each variant.
#[derive(Debug, Clone)]
pub enum ParsedFeed {
    GtfsStatic(GtfsStaticData),
    GtfsRealtime(GtfsRealtimeData),
    NyctStations(Vec<NyctStationRow>),
}

pub trait FeedParser: Send + Sync {
    fn feed_type(&self) -> &'static str;

    /// Check the options shape without a payload. Run at install time so a
    /// bad options object fails the install instead of every update.
    fn validate_options(&self, options: &serde_json::Value) -> Result<(), ParseError> {
        let _ = options;
        Ok(())
    }

    fn parse(&self, bytes: &[u8], options: &serde_json::Value) -> Result<ParsedFeed, ParseError>;
}

/// Deserialize parser options from the opaque config value. Null and missing
/// options mean "all defaults"; anything else must match the parser's
/// options shape exactly.
pub(crate) fn parse_options<T: serde::de::DeserializeOwned + Default>(
    value: &serde_json::Value,
) -> Result<T, ParseError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ParseError::InvalidOptions(e.to_string()))
}

/// Registry of parsers keyed by `type` string.
pub struct ParserRegistry {
    parsers: HashMap<&'static str, Arc<dyn FeedParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the three built-in parsers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(self::gtfs_static::GtfsStaticParser));
        registry.register(Arc::new(self::gtfs_realtime::GtfsRealtimeParser));
        registry.register(Arc::new(self::nyct_csv::NyctSubwayCsvParser));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn FeedParser>) {
        self.parsers.insert(parser.feed_type(), parser);
    }

    pub fn get(&self, feed_type: &str) -> Option<Arc<dyn FeedParser>> {
        self.parsers.get(feed_type).cloned()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
