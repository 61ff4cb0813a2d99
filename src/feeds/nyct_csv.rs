//! NYCT subway stations CSV parser.
//!
//! The MTA publishes a stations CSV (one row per platform group) that links
//! GTFS stop IDs to station complexes, boroughs, and daytime route sets.
//! Parsed rows are merged onto existing stops as metadata.

use serde::Deserialize;
use tracing::debug;

use super::{FeedParser, ParseError, ParsedFeed};

#[derive(Debug, Clone, Deserialize)]
pub struct NyctStationRow {
    #[serde(rename = "GTFS Stop ID")]
    pub gtfs_stop_id: String,
    #[serde(rename = "Complex ID")]
    pub complex_id: String,
    #[serde(rename = "Stop Name")]
    pub stop_name: Option<String>,
    #[serde(rename = "Borough")]
    pub borough: Option<String>,
    #[serde(rename = "Daytime Routes")]
    pub daytime_routes: Option<String>,
    #[serde(rename = "GTFS Latitude")]
    pub lat: Option<f64>,
    #[serde(rename = "GTFS Longitude")]
    pub lon: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NyctCsvOptions {}

pub struct NyctSubwayCsvParser;

impl FeedParser for NyctSubwayCsvParser {
    fn feed_type(&self) -> &'static str {
        super::NYCT_SUBWAY_CSV
    }

    fn validate_options(&self, options: &serde_json::Value) -> Result<(), ParseError> {
        super::parse_options::<NyctCsvOptions>(options).map(|_| ())
    }

    fn parse(&self, bytes: &[u8], options: &serde_json::Value) -> Result<ParsedFeed, ParseError> {
        let _options: NyctCsvOptions = super::parse_options(options)?;

        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes);
        let mut rows: Vec<NyctStationRow> = Vec::new();
        for result in rdr.deserialize() {
            let row: NyctStationRow = result?;
            if row.gtfs_stop_id.is_empty() {
                continue;
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(ParseError::Malformed(
                "stations CSV has no usable rows".into(),
            ));
        }

        debug!(stations = rows.len(), "Parsed NYCT stations CSV");
        Ok(ParsedFeed::NyctStations(rows))
    }
}
