use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scheduling policy for a feed.
///
/// `Default` resolves at scheduling time: realtime feeds become `Periodic`,
/// everything else becomes `Daily`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingPolicy {
    #[default]
    Default,
    Periodic,
    Daily,
    None,
}

/// Configuration for a single feed within a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FeedConfig {
    /// Feed ID, unique within the system.
    pub id: String,
    /// Parser name, e.g. "GTFS_STATIC", "GTFS_REALTIME", "NYCT_SUBWAY_CSV".
    /// Free-form so build-time plug-in parsers need no config change.
    #[serde(rename = "type")]
    pub feed_type: String,
    pub url: String,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    /// HTTP request timeout for downloading the feed.
    #[serde(default = "FeedConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub scheduling_policy: SchedulingPolicy,
    /// Period between updates when the policy is PERIODIC. Defaults to 5000ms.
    #[serde(default)]
    pub update_period_ms: Option<u64>,
    /// Wall-clock time "HH:MM" for DAILY updates. When unset, the k-th feed
    /// in install order defaults to 03:00 + 10*k minutes.
    #[serde(default)]
    pub daily_update_time: Option<String>,
    /// IANA timezone for DAILY updates. When unset, resolved from the
    /// system's agencies, falling back to UTC.
    #[serde(default)]
    pub daily_update_timezone: Option<String>,
    /// Parser-specific options, passed through opaquely.
    #[serde(default)]
    pub parser_options: serde_json::Value,
    /// When true, the initial update of this feed must succeed for the
    /// system install to succeed.
    #[serde(default)]
    pub required_for_install: bool,
}

impl FeedConfig {
    pub fn default_request_timeout_ms() -> u64 {
        5000
    }

    pub const DEFAULT_UPDATE_PERIOD_MS: u64 = 5000;

    /// Period for PERIODIC scheduling, clamped to at least 1ms.
    pub fn periodic_period_ms(&self) -> u64 {
        self.update_period_ms
            .unwrap_or(Self::DEFAULT_UPDATE_PERIOD_MS)
            .max(1)
    }
}

/// Configuration for a transit system, as supplied at install time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SystemConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

impl SystemConfig {
    /// Parse a raw YAML document into a SystemConfig, expanding `{{ key }}`
    /// template markers first when the document sets `is_template: true`.
    pub fn from_yaml(raw: &str, template_args: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let expanded = if is_template_document(raw)? {
            expand_template(raw, template_args)?
        } else {
            raw.to_string()
        };
        let config: SystemConfig =
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Synchronous validation run before any state change.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for feed in &self.feeds {
            if feed.id.is_empty() {
                return Err(ConfigError::Invalid("feed id must not be empty".into()));
            }
            if !seen.insert(feed.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate feed id '{}'",
                    feed.id
                )));
            }
            if feed.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "feed '{}' has no URL",
                    feed.id
                )));
            }
            if let Some(period) = feed.update_period_ms {
                if period == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "feed '{}': update_period_ms must be at least 1",
                        feed.id
                    )));
                }
            }
            if let Some(time) = &feed.daily_update_time {
                NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| {
                    ConfigError::Invalid(format!(
                        "feed '{}': daily_update_time '{}' is not HH:MM",
                        feed.id, time
                    ))
                })?;
            }
            if let Some(tz) = &feed.daily_update_timezone {
                tz.parse::<chrono_tz::Tz>().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "feed '{}': '{}' is not a valid IANA timezone",
                        feed.id, tz
                    ))
                })?;
            }
            if feed.scheduling_policy == SchedulingPolicy::None && feed.required_for_install {
                warn!(
                    feed_id = %feed.id,
                    "feed has scheduling_policy NONE but required_for_install; it will only update once"
                );
            }
        }
        Ok(())
    }
}

/// Check whether a raw YAML document declares `is_template: true` without
/// fully parsing it (a template body is not valid SystemConfig YAML until
/// expanded, but the top-level marker always is).
fn is_template_document(raw: &str) -> Result<bool, ConfigError> {
    #[derive(Deserialize)]
    struct Marker {
        #[serde(default)]
        is_template: bool,
    }
    // Deserializing only the marker field tolerates template syntax in
    // other values, which remain strings at this point.
    match serde_yaml::from_str::<Marker>(raw) {
        Ok(marker) => Ok(marker.is_template),
        // If the document does not even scan as YAML, surface that from the
        // real parse below instead of here.
        Err(_) => Ok(raw.contains("is_template: true")),
    }
}

/// Expand `{{ key }}` markers with the provided arguments. Unknown keys are
/// an error so a typo in an install request fails loudly instead of
/// producing a half-substituted URL.
fn expand_template(raw: &str, args: &HashMap<String, String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| ConfigError::Invalid("unterminated '{{' in template".into()))?;
        let key = after[..close].trim();
        let value = args
            .get(key)
            .ok_or_else(|| ConfigError::Invalid(format!("missing template argument '{}'", key)))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    // Strip the marker line so the expanded document deserializes cleanly.
    Ok(out.replace("is_template: true", "is_template: false"))
}

/// Server-level configuration (`config.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_http_addr")]
    pub http_addr: String,
    #[serde(default = "ServerConfig::default_database_path")]
    pub database_path: String,
    /// Cap on the parse phase of a feed update (seconds).
    #[serde(default = "ServerConfig::default_parse_timeout_secs")]
    pub parse_timeout_secs: u64,
    /// Cap on the database phase of a feed update (seconds).
    #[serde(default = "ServerConfig::default_database_timeout_secs")]
    pub database_timeout_secs: u64,
    /// Cap on a whole feed update, so a wedged runner cannot block
    /// ticker shutdown indefinitely (seconds).
    #[serde(default = "ServerConfig::default_update_timeout_secs")]
    pub update_timeout_secs: u64,
    /// How long shutdown waits for in-flight updates before abandoning
    /// them (seconds).
    #[serde(default = "ServerConfig::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: Self::default_http_addr(),
            database_path: Self::default_database_path(),
            parse_timeout_secs: Self::default_parse_timeout_secs(),
            database_timeout_secs: Self::default_database_timeout_secs(),
            update_timeout_secs: Self::default_update_timeout_secs(),
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn default_http_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
    fn default_database_path() -> String {
        "./data/headway.db".to_string()
    }
    fn default_parse_timeout_secs() -> u64 {
        60
    }
    fn default_database_timeout_secs() -> u64 {
        60
    }
    fn default_update_timeout_secs() -> u64 {
        300
    }
    fn default_shutdown_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
