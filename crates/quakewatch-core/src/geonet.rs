//! HTTP client for the GeoNet earthquake APIs.
//!
//! Two endpoints are used:
//!
//! - the quake search service (`quakesearch.geonet.org.nz/geojson`), which
//!   answers bulk queries by start date, minimum magnitude and maximum
//!   depth;
//! - the quake API (`api.geonet.org.nz/quake/{id}`), which returns the
//!   current state of a single event including its review quality.
//!
//! Both answer `GeoJSON` feature collections with `[longitude, latitude]`
//! point geometry.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use quakewatch_types::{Quality, QuakeId, QuakeRecord};
use serde_json::Value;

use crate::config::FeedConfig;
use crate::feed::{FeedError, SearchQuery};

/// Client for the GeoNet search and single-event endpoints.
#[derive(Debug, Clone)]
pub struct GeoNetClient {
    client: reqwest::Client,
    search_url: String,
    quake_url: String,
    page_url: String,
}

impl GeoNetClient {
    /// Build a client from the feed configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::UpstreamUnavailable`] if the HTTP client cannot
    /// be constructed.
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| FeedError::UpstreamUnavailable(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            client,
            search_url: config.search_url.clone(),
            quake_url: config.quake_url.trim_end_matches('/').to_owned(),
            page_url: config.page_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Run a bulk search.
    pub(crate) async fn search(&self, query: &SearchQuery) -> Result<Vec<QuakeRecord>, FeedError> {
        let mut params = vec![(
            "startdate",
            query.from.to_rfc3339_opts(SecondsFormat::Millis, true),
        )];
        if query.min_magnitude > 0.0 {
            params.push(("minmag", query.min_magnitude.to_string()));
        }
        if query.max_depth_km > 0.0 {
            params.push(("maxdepth", query.max_depth_km.to_string()));
        }

        let response = self
            .client
            .get(&self.search_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| FeedError::UpstreamUnavailable(format!("quake search failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::UpstreamUnavailable(format!(
                "quake search returned {status}"
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| FeedError::MalformedPayload(format!("quake search body: {e}")))?;

        parse_search(&json, &self.page_url)
    }

    /// Fetch one event. A 404 means the provider no longer knows it.
    pub(crate) async fn fetch_one(
        &self,
        id: &QuakeId,
        hint: Option<&QuakeRecord>,
    ) -> Result<Option<QuakeRecord>, FeedError> {
        let url = format!("{}/{id}", self.quake_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::UpstreamUnavailable(format!("quake {id} fetch failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FeedError::UpstreamUnavailable(format!(
                "quake {id} returned {status}"
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| FeedError::MalformedPayload(format!("quake {id} body: {e}")))?;

        parse_single(&json, id, hint, &self.page_url)
    }
}

/// Public page for an event.
pub(crate) fn permalink(page_url: &str, id: &QuakeId) -> String {
    format!("{page_url}/{id}")
}

/// Decode a quake search feature collection.
///
/// Features without a `publicid` are skipped.
pub(crate) fn parse_search(json: &Value, page_url: &str) -> Result<Vec<QuakeRecord>, FeedError> {
    let features = features(json)?;
    let records = features
        .iter()
        .filter_map(|feature| {
            let props = feature.get("properties")?;
            let Some(id) = props.get("publicid").and_then(Value::as_str) else {
                tracing::warn!("skipping search feature without publicid");
                return None;
            };
            let id = QuakeId::from(id);
            let mut record = QuakeRecord::new(id.clone()).with_url(permalink(page_url, &id));
            if let Some((lat, long)) = coordinates(feature) {
                record = record.with_location(lat, long);
            }
            if let Some(mag) = props.get("magnitude").and_then(Value::as_f64) {
                record = record.with_magnitude(mag);
            }
            if let Some(depth) = props.get("depth").and_then(Value::as_f64) {
                record = record.with_depth(depth);
            }
            if let Some(time) = time_field(props, "origintime") {
                record = record.with_time(time);
            }
            if let Some(modified) = time_field(props, "modificationtime") {
                record = record.with_modified(modified);
            }
            Some(record)
        })
        .collect();
    Ok(records)
}

/// Decode a single-event response, layering it over `hint`.
///
/// Returns `Ok(None)` for an empty feature collection.
pub(crate) fn parse_single(
    json: &Value,
    id: &QuakeId,
    hint: Option<&QuakeRecord>,
    page_url: &str,
) -> Result<Option<QuakeRecord>, FeedError> {
    let Some(feature) = features(json)?.first() else {
        return Ok(None);
    };
    let props = feature
        .get("properties")
        .ok_or_else(|| FeedError::MalformedPayload(format!("quake {id} has no properties")))?;

    let mut observed = QuakeRecord::new(id.clone()).with_url(permalink(page_url, id));
    if let Some((lat, long)) = coordinates(feature) {
        observed = observed.with_location(lat, long);
    }
    if let Some(mag) = props.get("magnitude").and_then(Value::as_f64) {
        observed = observed.with_magnitude(mag);
    }
    if let Some(depth) = props.get("depth").and_then(Value::as_f64) {
        observed = observed.with_depth(depth);
    }
    if let Some(time) = time_field(props, "time") {
        observed = observed.with_time(time);
    }
    if let Some(quality) = props.get("quality").and_then(Value::as_str) {
        observed = observed.with_quality(Quality::parse(quality));
    }

    let mut record = hint
        .cloned()
        .unwrap_or_else(|| QuakeRecord::new(id.clone()));
    record.update(&observed);
    Ok(Some(record))
}

fn features(json: &Value) -> Result<&Vec<Value>, FeedError> {
    json.get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::MalformedPayload("response has no features array".to_owned()))
}

/// `(latitude, longitude)` from a point geometry.
fn coordinates(feature: &Value) -> Option<(f64, f64)> {
    let coords = feature
        .get("geometry")?
        .get("coordinates")?
        .as_array()?;
    let long = coords.first()?.as_f64()?;
    let lat = coords.get(1)?.as_f64()?;
    Some((lat, long))
}

fn time_field(props: &Value, name: &str) -> Option<DateTime<Utc>> {
    let raw = props.get(name)?.as_str()?;
    let parsed = parse_time(raw);
    if parsed.is_none() {
        tracing::warn!(field = name, value = raw, "unparseable timestamp");
    }
    parsed
}

/// Parse an RFC 3339 timestamp, or a zone-less one taken as UTC.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = "https://www.geonet.org.nz/earthquake";

    #[test]
    fn search_features_become_records() {
        let body = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [176.25, -38.5]},
                    "properties": {
                        "publicid": "2024p160001",
                        "origintime": "2024-03-01T10:00:00.123Z",
                        "modificationtime": "2024-03-01T10:05:00.000Z",
                        "magnitude": 4.2,
                        "depth": 12.5
                    }
                },
                {"type": "Feature", "properties": {"magnitude": 3.0}}
            ]
        });
        let records = parse_search(&body, PAGE).unwrap();
        assert_eq!(records.len(), 1);
        let quake = &records[0];
        assert_eq!(quake.id().as_str(), "2024p160001");
        assert_eq!(quake.latitude(), Some(-38.5));
        assert_eq!(quake.longitude(), Some(176.25));
        assert_eq!(quake.magnitude(), Some(4.2));
        assert_eq!(quake.depth(), Some(12.5));
        assert_eq!(quake.time().unwrap().timestamp_millis(), 1_709_287_200_123);
        assert!(quake.modified().is_some());
        assert_eq!(
            quake.url(),
            Some("https://www.geonet.org.nz/earthquake/2024p160001")
        );
        assert_eq!(quake.quality(), None);
    }

    #[test]
    fn missing_features_is_malformed() {
        let result = parse_search(&json!({"type": "nope"}), PAGE);
        assert!(matches!(result, Err(FeedError::MalformedPayload(_))));
    }

    #[test]
    fn single_event_layers_over_hint() {
        let id = QuakeId::from("2024p160001");
        let hint = QuakeRecord::new(id.clone())
            .with_magnitude(4.2)
            .with_modified(parse_time("2024-03-01T10:05:00Z").unwrap());
        let body = json!({
            "features": [{
                "geometry": {"coordinates": [176.25, -38.5]},
                "properties": {
                    "publicID": "2024p160001",
                    "time": "2024-03-01T10:00:00.123Z",
                    "magnitude": 4.4,
                    "depth": 11.0,
                    "quality": "best"
                }
            }]
        });
        let record = parse_single(&body, &id, Some(&hint), PAGE).unwrap().unwrap();
        assert_eq!(record.magnitude(), Some(4.4));
        assert_eq!(record.quality(), Some(Quality::Best));
        assert_eq!(record.modified(), hint.modified());
        // the hint itself is left alone
        assert_eq!(hint.magnitude(), Some(4.2));
    }

    #[test]
    fn empty_single_event_is_none() {
        let id = QuakeId::from("gone");
        let record = parse_single(&json!({"features": []}), &id, None, PAGE).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn unknown_quality_is_kept_as_unknown() {
        let id = QuakeId::from("q");
        let body = json!({"features": [{"properties": {"quality": "reviewed-ish"}}]});
        let record = parse_single(&body, &id, None, PAGE).unwrap().unwrap();
        assert_eq!(record.quality(), Some(Quality::Unknown));
    }

    #[test]
    fn zoneless_timestamps_are_utc() {
        let parsed = parse_time("2024-03-01T10:00:00.5").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_709_287_200_500);
        assert!(parse_time("yesterday").is_none());
    }
}
