//! GTFS Static parser: a zip archive of CSV files describing the schedule.

use std::io::{Cursor, Read};

use serde::Deserialize;
use tracing::debug;

use super::{FeedParser, ParseError, ParsedFeed};

/// Cap on the decompressed size of any single file in the archive.
const MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct StaticAgency {
    #[serde(default)]
    pub agency_id: Option<String>,
    pub agency_name: String,
    #[serde(default)]
    pub agency_url: Option<String>,
    #[serde(default)]
    pub agency_timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticRoute {
    pub route_id: String,
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    #[serde(default)]
    pub route_long_name: Option<String>,
    #[serde(default)]
    pub route_type: Option<i32>,
    #[serde(default)]
    pub route_color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticStop {
    pub stop_id: String,
    #[serde(default)]
    pub stop_name: Option<String>,
    #[serde(default)]
    pub stop_lat: Option<f64>,
    #[serde(default)]
    pub stop_lon: Option<f64>,
    #[serde(default)]
    pub parent_station: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticTrip {
    pub trip_id: String,
    pub route_id: String,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub trip_headsign: Option<String>,
    #[serde(default)]
    pub direction_id: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct StaticStopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: i32,
    /// Seconds since midnight; can exceed 86400 for trips crossing midnight.
    pub arrival_secs: Option<i32>,
    pub departure_secs: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct GtfsStaticData {
    pub agencies: Vec<StaticAgency>,
    pub routes: Vec<StaticRoute>,
    pub stops: Vec<StaticStop>,
    pub trips: Vec<StaticTrip>,
    pub stop_times: Vec<StaticStopTime>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GtfsStaticOptions {}

pub struct GtfsStaticParser;

impl FeedParser for GtfsStaticParser {
    fn feed_type(&self) -> &'static str {
        super::GTFS_STATIC
    }

    fn validate_options(&self, options: &serde_json::Value) -> Result<(), ParseError> {
        super::parse_options::<GtfsStaticOptions>(options).map(|_| ())
    }

    fn parse(&self, bytes: &[u8], options: &serde_json::Value) -> Result<ParsedFeed, ParseError> {
        let _options: GtfsStaticOptions = super::parse_options(options)?;
        let data = parse_archive(bytes)?;
        Ok(ParsedFeed::GtfsStatic(data))
    }
}

fn parse_archive(bytes: &[u8]) -> Result<GtfsStaticData, ParseError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    let agencies: Vec<StaticAgency> = read_csv(&mut archive, "agency.txt", true)?;
    let routes: Vec<StaticRoute> = read_csv(&mut archive, "routes.txt", true)?;
    let stops: Vec<StaticStop> = read_csv(&mut archive, "stops.txt", true)?;
    let trips: Vec<StaticTrip> = read_csv(&mut archive, "trips.txt", true)?;

    #[derive(Deserialize)]
    struct RawStopTime {
        trip_id: String,
        stop_id: String,
        stop_sequence: i32,
        #[serde(default)]
        arrival_time: Option<String>,
        #[serde(default)]
        departure_time: Option<String>,
    }

    let raw_stop_times: Vec<RawStopTime> = read_csv(&mut archive, "stop_times.txt", true)?;
    let mut stop_times = Vec::with_capacity(raw_stop_times.len());
    for raw in raw_stop_times {
        stop_times.push(StaticStopTime {
            arrival_secs: raw.arrival_time.as_deref().and_then(parse_gtfs_time),
            departure_secs: raw.departure_time.as_deref().and_then(parse_gtfs_time),
            trip_id: raw.trip_id,
            stop_id: raw.stop_id,
            stop_sequence: raw.stop_sequence,
        });
    }

    debug!(
        agencies = agencies.len(),
        routes = routes.len(),
        stops = stops.len(),
        trips = trips.len(),
        stop_times = stop_times.len(),
        "Parsed GTFS static archive"
    );

    Ok(GtfsStaticData {
        agencies,
        routes,
        stops,
        trips,
        stop_times,
    })
}

/// Read and deserialize one CSV file from the archive. Files may live at the
/// root or inside a single top-level directory.
fn read_csv<T: serde::de::DeserializeOwned>(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    file_name: &str,
    required: bool,
) -> Result<Vec<T>, ParseError> {
    let entry_name = archive
        .file_names()
        .find(|name| {
            *name == file_name || name.ends_with(&format!("/{}", file_name))
        })
        .map(|s| s.to_string());

    let Some(entry_name) = entry_name else {
        if required {
            return Err(ParseError::Malformed(format!(
                "archive is missing {}",
                file_name
            )));
        }
        return Ok(Vec::new());
    };

    let file = archive.by_name(&entry_name)?;
    if file.size() > MAX_FILE_SIZE {
        return Err(ParseError::Malformed(format!(
            "{} is too large: {} bytes",
            file_name,
            file.size()
        )));
    }

    let mut rdr = csv::Reader::from_reader(file.take(MAX_FILE_SIZE));
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

/// Parse a GTFS "HH:MM:SS" time into seconds since midnight. Hours may
/// exceed 23 for trips crossing midnight. Returns None for empty or
/// malformed values so one bad row does not fail the whole feed.
pub fn parse_gtfs_time(value: &str) -> Option<i32> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let mut parts = value.split(':');
    let hours: i32 = parts.next()?.trim().parse().ok()?;
    let minutes: i32 = parts.next()?.trim().parse().ok()?;
    let seconds: i32 = parts.next().unwrap_or("0").trim().parse().ok()?;
    if !(0..60).contains(&minutes) || !(0..60).contains(&seconds) || hours < 0 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build a minimal GTFS zip in memory.
    pub(crate) fn make_gtfs_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, content) in files {
                writer
                    .start_file(name.to_string(), SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    pub(crate) fn minimal_feed_files() -> Vec<(&'static str, &'static str)> {
        vec![
            (
                "agency.txt",
                "agency_id,agency_name,agency_url,agency_timezone\n\
                 mta,Metropolitan Transportation Authority,https://mta.info,America/New_York\n",
            ),
            (
                "routes.txt",
                "route_id,agency_id,route_short_name,route_long_name,route_type,route_color\n\
                 A,mta,A,8 Avenue Express,1,2850AD\n",
            ),
            (
                "stops.txt",
                "stop_id,stop_name,stop_lat,stop_lon,parent_station\n\
                 A01,Inwood-207 St,40.868072,-73.919899,\n\
                 A01N,Inwood-207 St,40.868072,-73.919899,A01\n",
            ),
            (
                "trips.txt",
                "trip_id,route_id,service_id,trip_headsign,direction_id\n\
                 t1,A,weekday,Far Rockaway,1\n",
            ),
            (
                "stop_times.txt",
                "trip_id,stop_id,stop_sequence,arrival_time,departure_time\n\
                 t1,A01N,1,08:00:00,08:00:30\n\
                 t1,A01,2,25:15:00,\n",
            ),
        ]
    }

    #[test]
    fn parse_minimal_archive() {
        let bytes = make_gtfs_zip(&minimal_feed_files());
        let parser = GtfsStaticParser;
        let parsed = parser.parse(&bytes, &serde_json::Value::Null).unwrap();
        let ParsedFeed::GtfsStatic(data) = parsed else {
            panic!("expected static data");
        };
        assert_eq!(data.agencies.len(), 1);
        assert_eq!(data.agencies[0].agency_timezone.as_deref(), Some("America/New_York"));
        assert_eq!(data.routes.len(), 1);
        assert_eq!(data.stops.len(), 2);
        assert_eq!(data.stops[1].parent_station.as_deref(), Some("A01"));
        assert_eq!(data.trips.len(), 1);
        assert_eq!(data.stop_times.len(), 2);
        assert_eq!(data.stop_times[0].departure_secs, Some(8 * 3600 + 30));
        // Past-midnight time and empty departure
        assert_eq!(data.stop_times[1].arrival_secs, Some(25 * 3600 + 15 * 60));
        assert_eq!(data.stop_times[1].departure_secs, None);
    }

    #[test]
    fn parse_archive_with_directory_prefix() {
        let files = minimal_feed_files();
        let prefixed: Vec<(String, &str)> = files
            .iter()
            .map(|(name, content)| (format!("gtfs/{}", name), *content))
            .collect();
        let refs: Vec<(&str, &str)> = prefixed
            .iter()
            .map(|(n, c)| (n.as_str(), *c))
            .collect();
        let bytes = make_gtfs_zip(&refs);
        let parser = GtfsStaticParser;
        assert!(parser.parse(&bytes, &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn missing_required_file_is_malformed() {
        let bytes = make_gtfs_zip(&[(
            "agency.txt",
            "agency_id,agency_name\nmta,MTA\n",
        )]);
        let parser = GtfsStaticParser;
        let err = parser.parse(&bytes, &serde_json::Value::Null).unwrap_err();
        assert!(err.to_string().contains("missing routes.txt"));
    }

    #[test]
    fn not_a_zip_is_an_error() {
        let parser = GtfsStaticParser;
        let err = parser
            .parse(b"definitely not a zip", &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, ParseError::Zip(_)));
    }

    #[test]
    fn unknown_options_are_rejected() {
        let bytes = make_gtfs_zip(&minimal_feed_files());
        let parser = GtfsStaticParser;
        let err = parser
            .parse(&bytes, &serde_json::json!({"frobnicate": true}))
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidOptions(_)));
    }

    #[test]
    fn gtfs_time_parsing() {
        assert_eq!(parse_gtfs_time("08:30:15"), Some(30615));
        assert_eq!(parse_gtfs_time("25:00:00"), Some(90000));
        assert_eq!(parse_gtfs_time(" 7:05:00"), Some(25500));
        assert_eq!(parse_gtfs_time(""), None);
        assert_eq!(parse_gtfs_time("8:99:00"), None);
        assert_eq!(parse_gtfs_time("not a time"), None);
    }
}
