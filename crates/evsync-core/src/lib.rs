//! Core domain model for the metro events sync engine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod geo;
pub mod metro;
pub mod taxonomy;

pub use geo::{bounding_deltas, haversine_m, validate_coordinates, GeoError};
pub use metro::{resolve, resolve_for, Metro, MetroSet, ResolveError, SourceParams};
pub use taxonomy::Taxonomy;

pub const CRATE_NAME: &str = "evsync-core";

/// Which sync flow a source feeds. The two flows share machinery but never sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flow {
    EventSync,
    VenueDiscovery,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::EventSync => "event-sync",
            Flow::VenueDiscovery => "venue-discovery",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Ticketmaster,
    Seatgeek,
    SocialPage,
    VenueWebsite,
    GooglePlaces,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Ticketmaster,
        SourceKind::Seatgeek,
        SourceKind::SocialPage,
        SourceKind::VenueWebsite,
        SourceKind::GooglePlaces,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Ticketmaster => "ticketmaster",
            SourceKind::Seatgeek => "seatgeek",
            SourceKind::SocialPage => "social-page",
            SourceKind::VenueWebsite => "venue-website",
            SourceKind::GooglePlaces => "google-places",
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            SourceKind::GooglePlaces => Flow::VenueDiscovery,
            _ => Flow::EventSync,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ResolveError::UnknownSource(s.to_string()))
    }
}

/// Source name + source-native id. The strongest matching signal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    pub source: String,
    pub id: String,
}

impl ExternalRef {
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }
}

/// Opaque payload fetched by an adapter. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: SourceKind,
    /// Configured source name, e.g. `ticketmaster` or `ticketing-a`.
    pub source: String,
    pub payload: JsonValue,
    /// Social page the record was scraped from, if any.
    pub page_id: Option<Uuid>,
    /// Venue the originating page or site is linked to, if any.
    pub venue_id: Option<Uuid>,
}

impl RawRecord {
    pub fn new(kind: SourceKind, source: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind,
            source: source.into(),
            payload,
            page_id: None,
            venue_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVenue {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub capacity: Option<u32>,
    pub website: Option<String>,
    pub social_page_id: Option<Uuid>,
    pub external: Option<ExternalRef>,
}

/// Where a canonical event is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VenueRef {
    /// Already-stored venue, e.g. the venue a social page is linked to.
    Linked(Uuid),
    /// Venue described by the source; resolved through the matcher.
    Candidate(CanonicalVenue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub doors_at: Option<DateTime<Utc>>,
    pub venue: VenueRef,
    /// Always a taxonomy category; `other` when nothing could be inferred.
    pub category: String,
    pub image_url: Option<String>,
    pub is_free: bool,
    pub tags: BTreeSet<String>,
    pub external: Option<ExternalRef>,
    pub external_url: Option<String>,
    pub social_page_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CanonicalRecord {
    Event(CanonicalEvent),
    Venue(CanonicalVenue),
}

/// Persisted venue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub capacity: Option<u32>,
    pub website: Option<String>,
    pub social_page_id: Option<Uuid>,
    pub external: Option<ExternalRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted event row. Location is copied from the venue at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub doors_at: Option<DateTime<Utc>>,
    pub venue_id: Uuid,
    pub category: String,
    pub image_url: Option<String>,
    pub is_free: bool,
    pub tags: Vec<String>,
    pub external: Option<ExternalRef>,
    pub external_url: Option<String>,
    pub social_page_id: Option<Uuid>,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    PendingReview,
    Active,
    Paused,
    Failed,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::PendingReview => "pending_review",
            PageStatus::Active => "active",
            PageStatus::Paused => "paused",
            PageStatus::Failed => "failed",
        }
    }

    /// Pages in these states are scraped during event sync.
    pub fn is_scrapable(&self) -> bool {
        matches!(self, PageStatus::PendingReview | PageStatus::Active)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(PageStatus::PendingReview),
            "active" => Ok(PageStatus::Active),
            "paused" => Ok(PageStatus::Paused),
            "failed" => Ok(PageStatus::Failed),
            other => Err(format!("unknown page status {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPageSource {
    pub id: Uuid,
    pub url: String,
    /// Resolved lazily on first successful scrape.
    pub external_page_id: Option<String>,
    pub display_name: String,
    /// Metro whose event sync scrapes this page.
    pub metro_slug: String,
    pub venue_id: Option<Uuid>,
    pub status: PageStatus,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    /// Collapses per-source (or per-metro) outcomes: all ok, all failed, or a mix.
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 && total > 0 {
            RunStatus::Success
        } else if failed >= total {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other}")),
        }
    }
}

/// Append-only audit record of one run. Written once, at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunLog {
    pub id: Uuid,
    pub source_name: String,
    pub metro_slug: String,
    pub status: RunStatus,
    pub events_created: u32,
    pub events_updated: u32,
    pub venues_created: u32,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Lower-case, strip non-word characters, collapse whitespace/underscores/hyphens
/// into single hyphens and trim hyphens from both ends.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for ch in input.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch);
        } else if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_hyphen = true;
        }
    }
    out
}

/// Comparison key for names and titles: lower-case alphanumerics separated by single spaces.
pub fn normalize_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
