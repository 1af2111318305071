//! Configuration loading and typed config structures for QuakeWatch.
//!
//! The canonical configuration lives in `quakewatch.yaml` next to the
//! service binary. Every field has a default, so an empty or missing file
//! yields a working setup against the public GeoNet endpoints. Deployment
//! environment variables override the YAML values afterwards.

use std::path::Path;

use chrono::Duration;
use quakewatch_types::ClientConfig;
use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value was present but unusable.
    #[error("invalid config value for {name}: {reason}")]
    InvalidValue {
        /// The YAML path or environment variable that was rejected.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level service configuration.
///
/// Mirrors the structure of `quakewatch.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceConfig {
    /// Upstream feed endpoints and search filters.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Cache retention and polling windows.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Refresh timer settings.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Subscriber session settings.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Storage and listener settings.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
}

impl ServiceConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::InvalidValue`] if an override or value is unusable.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::InvalidValue`] if an override or value is unusable.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from a variable lookup (normally the process
    /// environment).
    ///
    /// Recognised variables: `MIN_MAGNITUDE`, `MAX_DEPTH_KM`,
    /// `QUAKE_CACHE_TTL_DAYS`, `FULL_REFRESH_INTERVAL_MINUTES`,
    /// `QUAKE_SEARCH_TIME_MINUTES`, `RECENT_QUAKE_POLL_TIME_MINUTES`,
    /// `REFRESH_INTERVAL_SECONDS`, `DRAGONFLY_URL`, `OBSERVER_PORT`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a numeric variable does not
    /// parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "MIN_MAGNITUDE", &mut self.feed.min_magnitude)?;
        override_parsed(&lookup, "MAX_DEPTH_KM", &mut self.feed.max_depth_km)?;
        override_parsed(&lookup, "QUAKE_CACHE_TTL_DAYS", &mut self.cache.ttl_days)?;
        override_parsed(
            &lookup,
            "FULL_REFRESH_INTERVAL_MINUTES",
            &mut self.cache.full_refresh_interval_minutes,
        )?;
        override_parsed(
            &lookup,
            "QUAKE_SEARCH_TIME_MINUTES",
            &mut self.cache.search_lookback_minutes,
        )?;
        override_parsed(
            &lookup,
            "RECENT_QUAKE_POLL_TIME_MINUTES",
            &mut self.cache.recent_poll_minutes,
        )?;
        override_parsed(
            &lookup,
            "REFRESH_INTERVAL_SECONDS",
            &mut self.refresh.interval_seconds,
        )?;
        override_parsed(
            &lookup,
            "OBSERVER_PORT",
            &mut self.infrastructure.observer_port,
        )?;
        if let Some(url) = lookup("DRAGONFLY_URL") {
            self.infrastructure.dragonfly_url = (!url.trim().is_empty()).then_some(url);
        }
        Ok(())
    }

    /// Reject settings that would stall or spin the refresh cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("cache.ttl_days", self.cache.ttl_days),
            (
                "cache.full_refresh_interval_minutes",
                self.cache.full_refresh_interval_minutes,
            ),
            ("cache.recent_poll_minutes", self.cache.recent_poll_minutes),
            ("refresh.interval_seconds", self.refresh.interval_seconds),
            ("feed.request_timeout_ms", self.feed.request_timeout_ms),
            ("sessions.idle_threshold_ms", self.sessions.idle_threshold_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(invalid(name, "must be at least 1"));
            }
        }
        if self.refresh.max_concurrent_fetches == 0 {
            return Err(invalid("refresh.max_concurrent_fetches", "must be at least 1"));
        }
        if !self.feed.min_magnitude.is_finite() || !self.feed.max_depth_km.is_finite() {
            return Err(invalid("feed", "search filters must be finite"));
        }
        Ok(())
    }

    /// The settings reported to clients in the `config` message.
    pub const fn client_config(&self) -> ClientConfig {
        ClientConfig {
            min_magnitude: self.feed.min_magnitude,
            max_depth_km: self.feed.max_depth_km,
            highlight_quakes_within: self.cache.recent_poll_minutes,
            search_within: self.cache.ttl_days,
        }
    }
}

/// Upstream feed configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    /// Bulk GeoJSON search endpoint.
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Single-event endpoint; the event id is appended.
    #[serde(default = "default_quake_url")]
    pub quake_url: String,

    /// Public event page prefix used for permalinks.
    #[serde(default = "default_page_url")]
    pub page_url: String,

    /// Smallest magnitude to search for (0 = no filter).
    #[serde(default = "default_min_magnitude")]
    pub min_magnitude: f64,

    /// Deepest event to search for, in kilometres (0 = no filter).
    #[serde(default)]
    pub max_depth_km: f64,

    /// Per-request timeout for upstream calls.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            quake_url: default_quake_url(),
            page_url: default_page_url(),
            min_magnitude: default_min_magnitude(),
            max_depth_km: 0.0,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Cache retention and polling windows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Days an event stays cached before it expires.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,

    /// Minutes between full resyncs of the whole retention window.
    #[serde(default = "default_full_refresh_interval_minutes")]
    pub full_refresh_interval_minutes: u64,

    /// Minutes an incremental search reaches back before the last query,
    /// to absorb provider reporting lag.
    #[serde(default = "default_search_lookback_minutes")]
    pub search_lookback_minutes: u64,

    /// Minutes an event counts as recent (highlighting and per-event polling).
    #[serde(default = "default_recent_poll_minutes")]
    pub recent_poll_minutes: u64,
}

impl CacheConfig {
    /// The retention window.
    pub fn ttl(&self) -> Duration {
        days(self.ttl_days)
    }

    /// The full resync interval.
    pub fn full_refresh_interval(&self) -> Duration {
        minutes(self.full_refresh_interval_minutes)
    }

    /// The incremental search lookback.
    pub fn search_lookback(&self) -> Duration {
        minutes(self.search_lookback_minutes)
    }

    /// The recency window.
    pub fn recent_window(&self) -> Duration {
        minutes(self.recent_poll_minutes)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            full_refresh_interval_minutes: default_full_refresh_interval_minutes(),
            search_lookback_minutes: default_search_lookback_minutes(),
            recent_poll_minutes: default_recent_poll_minutes(),
        }
    }
}

/// Refresh timer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between refresh ticks.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Upper bound on concurrent single-event fetches within one cycle.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

/// Subscriber session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which the liveness sweep probes a session.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
}

impl SessionConfig {
    /// The idle threshold.
    pub fn idle_threshold(&self) -> Duration {
        Duration::try_milliseconds(i64::try_from(self.idle_threshold_ms).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
        }
    }
}

/// Storage and listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// Dragonfly (Redis-compatible) URL; in-memory storage when absent.
    #[serde(default)]
    pub dragonfly_url: Option<String>,

    /// Prefix for every persisted key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Address the observer API binds to.
    #[serde(default = "default_observer_host")]
    pub observer_host: String,

    /// Port the observer API listens on.
    #[serde(default = "default_observer_port")]
    pub observer_port: u16,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            dragonfly_url: None,
            key_prefix: default_key_prefix(),
            observer_host: default_observer_host(),
            observer_port: default_observer_port(),
        }
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &e.to_string()))?;
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}

fn days(n: u64) -> Duration {
    Duration::try_days(i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

fn minutes(n: u64) -> Duration {
    Duration::try_minutes(i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

// ---------------------------------------------------------------------------
// Default value functions for serde
// ---------------------------------------------------------------------------

fn default_search_url() -> String {
    "https://quakesearch.geonet.org.nz/geojson".to_owned()
}

fn default_quake_url() -> String {
    "https://api.geonet.org.nz/quake/".to_owned()
}

fn default_page_url() -> String {
    "https://www.geonet.org.nz/earthquake/".to_owned()
}

const fn default_min_magnitude() -> f64 {
    3.0
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

const fn default_ttl_days() -> u64 {
    7
}

const fn default_full_refresh_interval_minutes() -> u64 {
    60
}

const fn default_search_lookback_minutes() -> u64 {
    10
}

const fn default_recent_poll_minutes() -> u64 {
    60
}

const fn default_interval_seconds() -> u64 {
    60
}

const fn default_max_concurrent_fetches() -> usize {
    8
}

const fn default_idle_threshold_ms() -> u64 {
    600_000
}

fn default_key_prefix() -> String {
    "quakewatch".to_owned()
}

fn default_observer_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_observer_port() -> u16 {
    8080
}
