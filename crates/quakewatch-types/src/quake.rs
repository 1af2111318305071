//! The earthquake event record and its review quality.
//!
//! A [`QuakeRecord`] is created the first time an event is observed and is
//! afterwards only changed through [`QuakeRecord::update`], a partial merge
//! that copies every non-null field of a newer observation. Times are held
//! as [`DateTime<Utc>`] so comparisons are by instant, never by text.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ts_rs::TS;

use crate::ids::QuakeId;

/// Provider-assigned review state of an event.
///
/// `best` and `deleted` are terminal: once an event reaches either, it is
/// no longer polled individually. Values the provider adds later decode
/// to [`Quality::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Reviewed by an analyst; the authoritative solution.
    Best,
    /// Partially reviewed.
    Preliminary,
    /// Automatic solution, not yet reviewed.
    Automatic,
    /// The event was retracted by the provider.
    Deleted,
    /// Any value this crate does not recognise.
    Unknown,
}

impl Quality {
    /// Decode a provider quality string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "best" => Self::Best,
            "preliminary" => Self::Preliminary,
            "automatic" => Self::Automatic,
            "deleted" => Self::Deleted,
            _ => Self::Unknown,
        }
    }

    /// The wire form of this quality.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Preliminary => "preliminary",
            Self::Automatic => "automatic",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        }
    }

    /// Whether no further per-record polling is needed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Best | Self::Deleted)
    }
}

impl core::fmt::Display for Quality {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// One seismic event as tracked by the cache.
///
/// Every mutable field is optional: `None` means the observation did not
/// carry a value, and such fields are ignored by [`matches`](Self::matches)
/// and [`update`](Self::update). The JSON field names follow the browser
/// client (`long`, `lat`, `mag`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct QuakeRecord {
    id: QuakeId,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "long")]
    longitude: Option<f64>,
    #[serde(default, rename = "lat")]
    latitude: Option<f64>,
    #[serde(default, rename = "mag")]
    magnitude: Option<f64>,
    #[serde(default)]
    depth: Option<f64>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    modified: Option<DateTime<Utc>>,
    #[serde(default)]
    #[ts(type = "string | null")]
    quality: Option<Quality>,
}

impl QuakeRecord {
    /// Create a record with the given identity and no observed fields.
    pub fn new(id: impl Into<QuakeId>) -> Self {
        Self {
            id: id.into(),
            url: None,
            longitude: None,
            latitude: None,
            magnitude: None,
            depth: None,
            time: None,
            modified: None,
            quality: None,
        }
    }

    /// Set the epicentre.
    #[must_use]
    pub const fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Set the magnitude.
    #[must_use]
    pub const fn with_magnitude(mut self, magnitude: f64) -> Self {
        self.magnitude = Some(magnitude);
        self
    }

    /// Set the depth in kilometres.
    #[must_use]
    pub const fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Set the origin time.
    #[must_use]
    pub const fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the provider's last-modified time.
    #[must_use]
    pub const fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Set the review quality.
    #[must_use]
    pub const fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Set the permalink.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The provider identity.
    pub const fn id(&self) -> &QuakeId {
        &self.id
    }

    /// Permalink to the provider's event page.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Epicentre latitude in degrees.
    pub const fn latitude(&self) -> Option<f64> {
        self.latitude
    }

    /// Epicentre longitude in degrees.
    pub const fn longitude(&self) -> Option<f64> {
        self.longitude
    }

    /// Magnitude.
    pub const fn magnitude(&self) -> Option<f64> {
        self.magnitude
    }

    /// Depth in kilometres.
    pub const fn depth(&self) -> Option<f64> {
        self.depth
    }

    /// Origin time.
    pub const fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    /// Provider's last-modified time.
    pub const fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// Review quality.
    pub const fn quality(&self) -> Option<Quality> {
        self.quality
    }

    /// Whether the event happened within `window` of `now`.
    pub fn is_recent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let cutoff = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.time.is_some_and(|time| time > cutoff)
    }

    /// Whether `other` carries no news for this record.
    ///
    /// True when identities are equal and every field `other` has a value
    /// for equals ours. Fields `other` leaves empty are not compared.
    pub fn matches(&self, other: &Self) -> bool {
        self.id == other.id
            && field_matches(self.longitude.as_ref(), other.longitude.as_ref())
            && field_matches(self.latitude.as_ref(), other.latitude.as_ref())
            && field_matches(self.magnitude.as_ref(), other.magnitude.as_ref())
            && field_matches(self.depth.as_ref(), other.depth.as_ref())
            && field_matches(self.time.as_ref(), other.time.as_ref())
            && field_matches(self.modified.as_ref(), other.modified.as_ref())
            && field_matches(self.quality.as_ref(), other.quality.as_ref())
            && field_matches(self.url.as_ref(), other.url.as_ref())
    }

    /// Merge every non-empty field of `other` that differs from ours.
    ///
    /// Returns whether anything changed. The identity is never touched;
    /// callers only merge observations of the same event.
    pub fn update(&mut self, other: &Self) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.longitude, other.longitude.as_ref());
        changed |= merge_field(&mut self.latitude, other.latitude.as_ref());
        changed |= merge_field(&mut self.magnitude, other.magnitude.as_ref());
        changed |= merge_field(&mut self.depth, other.depth.as_ref());
        changed |= merge_field(&mut self.time, other.time.as_ref());
        changed |= merge_field(&mut self.modified, other.modified.as_ref());
        changed |= merge_field(&mut self.quality, other.quality.as_ref());
        changed |= merge_field(&mut self.url, other.url.as_ref());
        changed
    }
}

fn field_matches<T: PartialEq>(ours: Option<&T>, theirs: Option<&T>) -> bool {
    theirs.is_none_or(|value| ours == Some(value))
}

fn merge_field<T: PartialEq + Clone>(ours: &mut Option<T>, theirs: Option<&T>) -> bool {
    match theirs {
        Some(value) if ours.as_ref() != Some(value) => {
            *ours = Some(value.clone());
            true
        }
        _ => false,
    }
}
