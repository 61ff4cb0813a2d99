//! GTFS Realtime parser: a protobuf FeedMessage of trip updates and alerts.

use prost::Message;
use serde::Deserialize;
use tracing::debug;

use super::{FeedParser, ParseError, ParsedFeed};

/// Cap on the protobuf payload size.
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealtimeExtension {
    #[default]
    None,
    /// NYCT subway feeds: empty route IDs are recovered from the trip ID
    /// ("123450_A..N03R" runs on route "A").
    NyctTrips,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GtfsRealtimeOptions {
    #[serde(default)]
    pub extension: RealtimeExtension,
    /// Skip trip updates whose descriptor has no trip ID instead of failing
    /// the whole feed.
    #[serde(default = "GtfsRealtimeOptions::default_skip_incomplete")]
    pub skip_incomplete_entities: bool,
}

impl GtfsRealtimeOptions {
    fn default_skip_incomplete() -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct TripUpdateRow {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub start_date: Option<String>,
    pub delay_secs: Option<i32>,
    pub vehicle_id: Option<String>,
    pub stop_time_updates: Vec<StopTimeUpdateRow>,
}

#[derive(Debug, Clone)]
pub struct StopTimeUpdateRow {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<i32>,
    pub arrival_time: Option<i64>,
    pub arrival_delay_secs: Option<i32>,
    pub departure_time: Option<i64>,
    pub departure_delay_secs: Option<i32>,
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct AlertRow {
    pub alert_id: String,
    pub cause: Option<String>,
    pub effect: Option<String>,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub active_from: Option<i64>,
    pub active_until: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct GtfsRealtimeData {
    /// Feed header timestamp, seconds since epoch.
    pub feed_timestamp: Option<u64>,
    pub trip_updates: Vec<TripUpdateRow>,
    pub alerts: Vec<AlertRow>,
}

pub struct GtfsRealtimeParser;

impl FeedParser for GtfsRealtimeParser {
    fn feed_type(&self) -> &'static str {
        super::GTFS_REALTIME
    }

    fn validate_options(&self, options: &serde_json::Value) -> Result<(), ParseError> {
        super::parse_options::<GtfsRealtimeOptions>(options).map(|_| ())
    }

    fn parse(&self, bytes: &[u8], options: &serde_json::Value) -> Result<ParsedFeed, ParseError> {
        let options: GtfsRealtimeOptions = super::parse_options(options)?;

        if bytes.len() > MAX_PROTOBUF_SIZE {
            return Err(ParseError::Malformed(format!(
                "protobuf payload too large: {} bytes (max {})",
                bytes.len(),
                MAX_PROTOBUF_SIZE
            )));
        }

        let feed = gtfs_realtime::FeedMessage::decode(bytes)?;
        let data = extract(&feed, &options)?;
        Ok(ParsedFeed::GtfsRealtime(data))
    }
}

fn extract(
    feed: &gtfs_realtime::FeedMessage,
    options: &GtfsRealtimeOptions,
) -> Result<GtfsRealtimeData, ParseError> {
    let mut trip_updates = Vec::new();
    let mut alerts = Vec::new();

    for entity in &feed.entity {
        if let Some(trip_update) = &entity.trip_update {
            let Some(trip_id) = trip_update.trip.trip_id.clone().filter(|id| !id.is_empty())
            else {
                if options.skip_incomplete_entities {
                    continue;
                }
                return Err(ParseError::Malformed(format!(
                    "trip update entity '{}' has no trip_id",
                    entity.id
                )));
            };

            let mut route_id = trip_update.trip.route_id.clone().filter(|id| !id.is_empty());
            if route_id.is_none() && options.extension == RealtimeExtension::NyctTrips {
                route_id = nyct_route_from_trip_id(&trip_id);
            }

            let stop_time_updates = trip_update
                .stop_time_update
                .iter()
                .map(|stu| StopTimeUpdateRow {
                    stop_id: stu.stop_id.clone(),
                    stop_sequence: stu.stop_sequence.map(|s| s as i32),
                    arrival_time: stu.arrival.as_ref().and_then(|e| e.time),
                    arrival_delay_secs: stu.arrival.as_ref().and_then(|e| e.delay),
                    departure_time: stu.departure.as_ref().and_then(|e| e.time),
                    departure_delay_secs: stu.departure.as_ref().and_then(|e| e.delay),
                    // 1 = SKIPPED in the StopTimeUpdate schedule relationship
                    skipped: stu.schedule_relationship == Some(1),
                })
                .collect();

            trip_updates.push(TripUpdateRow {
                trip_id,
                route_id,
                start_date: trip_update.trip.start_date.clone(),
                delay_secs: trip_update.delay,
                vehicle_id: trip_update
                    .vehicle
                    .as_ref()
                    .and_then(|v| v.id.clone())
                    .filter(|id| !id.is_empty()),
                stop_time_updates,
            });
        }

        if let Some(alert) = &entity.alert {
            let (active_from, active_until) = alert
                .active_period
                .first()
                .map(|p| (p.start.map(|s| s as i64), p.end.map(|e| e as i64)))
                .unwrap_or((None, None));

            alerts.push(AlertRow {
                alert_id: entity.id.clone(),
                cause: alert.cause.map(cause_label),
                effect: alert.effect.map(effect_label),
                header_text: first_translation(alert.header_text.as_ref()),
                description_text: first_translation(alert.description_text.as_ref()),
                active_from,
                active_until,
            });
        }
    }

    debug!(
        entities = feed.entity.len(),
        trip_updates = trip_updates.len(),
        alerts = alerts.len(),
        "Extracted GTFS-RT feed"
    );

    Ok(GtfsRealtimeData {
        feed_timestamp: feed.header.timestamp,
        trip_updates,
        alerts,
    })
}

fn first_translation(text: Option<&gtfs_realtime::TranslatedString>) -> Option<String> {
    text.and_then(|t| t.translation.first())
        .map(|t| t.text.clone())
}

/// NYCT trip IDs encode the route between the origin-time prefix and the
/// direction suffix: "123450_A..N03R" -> "A".
fn nyct_route_from_trip_id(trip_id: &str) -> Option<String> {
    let after_underscore = trip_id.split_once('_')?.1;
    let route = after_underscore.split("..").next()?;
    if route.is_empty() {
        None
    } else {
        Some(route.to_string())
    }
}

fn cause_label(value: i32) -> String {
    match value {
        1 => "UNKNOWN_CAUSE",
        2 => "OTHER_CAUSE",
        3 => "TECHNICAL_PROBLEM",
        4 => "STRIKE",
        5 => "DEMONSTRATION",
        6 => "ACCIDENT",
        7 => "HOLIDAY",
        8 => "WEATHER",
        9 => "MAINTENANCE",
        10 => "CONSTRUCTION",
        11 => "POLICE_ACTIVITY",
        12 => "MEDICAL_EMERGENCY",
        _ => return format!("CAUSE_{}", value),
    }
    .to_string()
}

fn effect_label(value: i32) -> String {
    match value {
        1 => "NO_SERVICE",
        2 => "REDUCED_SERVICE",
        3 => "SIGNIFICANT_DELAYS",
        4 => "DETOUR",
        5 => "ADDITIONAL_SERVICE",
        6 => "MODIFIED_SERVICE",
        7 => "OTHER_EFFECT",
        8 => "UNKNOWN_EFFECT",
        9 => "STOP_MOVED",
        10 => "NO_EFFECT",
        11 => "ACCESSIBILITY_ISSUE",
        _ => return format!("EFFECT_{}", value),
    }
    .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_feed_message(
        entities: Vec<gtfs_realtime::FeedEntity>,
    ) -> gtfs_realtime::FeedMessage {
        gtfs_realtime::FeedMessage {
            header: gtfs_realtime::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: Some(0),
                timestamp: Some(1_700_000_000),
                feed_version: None,
            },
            entity: entities,
        }
    }

    pub(crate) fn make_trip_update_entity(
        entity_id: &str,
        trip_id: Option<&str>,
        route_id: Option<&str>,
        stop_time_updates: Vec<gtfs_realtime::trip_update::StopTimeUpdate>,
    ) -> gtfs_realtime::FeedEntity {
        gtfs_realtime::FeedEntity {
            id: entity_id.to_string(),
            is_deleted: None,
            trip_update: Some(gtfs_realtime::TripUpdate {
                trip: gtfs_realtime::TripDescriptor {
                    trip_id: trip_id.map(|s| s.to_string()),
                    route_id: route_id.map(|s| s.to_string()),
                    direction_id: None,
                    start_time: None,
                    start_date: Some("20260201".to_string()),
                    schedule_relationship: None,
                    modified_trip: None,
                },
                vehicle: None,
                stop_time_update: stop_time_updates,
                timestamp: None,
                delay: Some(60),
                trip_properties: None,
            }),
            vehicle: None,
            alert: None,
            shape: None,
            stop: None,
            trip_modifications: None,
        }
    }

    fn make_stop_time_update(
        stop_id: &str,
        departure_delay: i32,
    ) -> gtfs_realtime::trip_update::StopTimeUpdate {
        gtfs_realtime::trip_update::StopTimeUpdate {
            stop_sequence: Some(1),
            stop_id: Some(stop_id.to_string()),
            arrival: None,
            departure: Some(gtfs_realtime::trip_update::StopTimeEvent {
                delay: Some(departure_delay),
                time: None,
                uncertainty: None,
                scheduled_time: None,
            }),
            departure_occupancy_status: None,
            schedule_relationship: None,
            stop_time_properties: None,
        }
    }

    pub(crate) fn encode(feed: &gtfs_realtime::FeedMessage) -> Vec<u8> {
        let mut buf = Vec::new();
        feed.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn parse_trip_updates() {
        let entity = make_trip_update_entity(
            "e1",
            Some("t1"),
            Some("A"),
            vec![make_stop_time_update("A01N", 120)],
        );
        let bytes = encode(&make_feed_message(vec![entity]));

        let parser = GtfsRealtimeParser;
        let ParsedFeed::GtfsRealtime(data) =
            parser.parse(&bytes, &serde_json::Value::Null).unwrap()
        else {
            panic!("expected realtime data");
        };

        assert_eq!(data.feed_timestamp, Some(1_700_000_000));
        assert_eq!(data.trip_updates.len(), 1);
        let tu = &data.trip_updates[0];
        assert_eq!(tu.trip_id, "t1");
        assert_eq!(tu.route_id.as_deref(), Some("A"));
        assert_eq!(tu.delay_secs, Some(60));
        assert_eq!(tu.stop_time_updates.len(), 1);
        assert_eq!(tu.stop_time_updates[0].departure_delay_secs, Some(120));
        assert!(!tu.stop_time_updates[0].skipped);
    }

    #[test]
    fn incomplete_entity_skipped_by_default() {
        let entity = make_trip_update_entity("e1", None, Some("A"), vec![]);
        let bytes = encode(&make_feed_message(vec![entity]));
        let parser = GtfsRealtimeParser;
        let ParsedFeed::GtfsRealtime(data) =
            parser.parse(&bytes, &serde_json::Value::Null).unwrap()
        else {
            panic!("expected realtime data");
        };
        assert!(data.trip_updates.is_empty());
    }

    #[test]
    fn incomplete_entity_fails_when_configured() {
        let entity = make_trip_update_entity("e1", None, Some("A"), vec![]);
        let bytes = encode(&make_feed_message(vec![entity]));
        let parser = GtfsRealtimeParser;
        let options = serde_json::json!({"skip_incomplete_entities": false});
        let err = parser.parse(&bytes, &options).unwrap_err();
        assert!(err.to_string().contains("has no trip_id"));
    }

    #[test]
    fn nyct_extension_recovers_route_from_trip_id() {
        let entity = make_trip_update_entity("e1", Some("123450_A..N03R"), None, vec![]);
        let bytes = encode(&make_feed_message(vec![entity]));
        let parser = GtfsRealtimeParser;
        let options = serde_json::json!({"extension": "NYCT_TRIPS"});
        let ParsedFeed::GtfsRealtime(data) = parser.parse(&bytes, &options).unwrap() else {
            panic!("expected realtime data");
        };
        assert_eq!(data.trip_updates[0].route_id.as_deref(), Some("A"));
    }

    #[test]
    fn alerts_extracted() {
        let alert_entity = gtfs_realtime::FeedEntity {
            id: "alert-1".to_string(),
            is_deleted: None,
            trip_update: None,
            vehicle: None,
            alert: Some(gtfs_realtime::Alert {
                active_period: vec![gtfs_realtime::TimeRange {
                    start: Some(1_700_000_000),
                    end: Some(1_700_003_600),
                }],
                informed_entity: vec![],
                cause: Some(9),
                effect: Some(3),
                url: None,
                header_text: Some(gtfs_realtime::TranslatedString {
                    translation: vec![gtfs_realtime::translated_string::Translation {
                        text: "Delays on the A line".to_string(),
                        language: Some("en".to_string()),
                    }],
                }),
                description_text: None,
                tts_header_text: None,
                tts_description_text: None,
                severity_level: None,
                image: None,
                image_alternative_text: None,
                cause_detail: None,
                effect_detail: None,
            }),
            shape: None,
            stop: None,
            trip_modifications: None,
        };
        let bytes = encode(&make_feed_message(vec![alert_entity]));
        let parser = GtfsRealtimeParser;
        let ParsedFeed::GtfsRealtime(data) =
            parser.parse(&bytes, &serde_json::Value::Null).unwrap()
        else {
            panic!("expected realtime data");
        };
        assert_eq!(data.alerts.len(), 1);
        let alert = &data.alerts[0];
        assert_eq!(alert.cause.as_deref(), Some("MAINTENANCE"));
        assert_eq!(alert.effect.as_deref(), Some("SIGNIFICANT_DELAYS"));
        assert_eq!(alert.header_text.as_deref(), Some("Delays on the A line"));
        assert_eq!(alert.active_from, Some(1_700_000_000));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let parser = GtfsRealtimeParser;
        let bad: &[u8] = &[0xFF; 16];
        let err = parser.parse(bad, &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, ParseError::Protobuf(_)));
    }

    #[test]
    fn nyct_trip_id_parsing() {
        assert_eq!(nyct_route_from_trip_id("123450_A..N03R").as_deref(), Some("A"));
        assert_eq!(nyct_route_from_trip_id("054150_GS..S01R").as_deref(), Some("GS"));
        assert_eq!(nyct_route_from_trip_id("no-underscore"), None);
        assert_eq!(nyct_route_from_trip_id("123450_"), None);
    }
}
