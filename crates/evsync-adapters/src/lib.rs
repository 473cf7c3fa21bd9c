//! Source adapter contract, the five source adapters and their tagged dispatch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use evsync_core::{Metro, RawRecord, SourceKind, SourceParams};
use evsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod jsonld;
pub mod places;
pub mod seatgeek;
pub mod social;
pub mod ticketmaster;
pub mod venue_site;

pub const CRATE_NAME: &str = "evsync-adapters";

/// A source failed as a whole: unreachable, auth rejected, or an unusable response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name}: {message}")]
pub struct AdapterError {
    pub source_name: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Collapse a transport error into a message; auth rejections are named as such.
    pub fn from_fetch(source_name: &str, err: &FetchError) -> Self {
        let message = match err.status() {
            Some(401) | Some(403) => format!("authentication rejected ({err})"),
            _ => err.to_string(),
        };
        Self::new(source_name, message)
    }
}

/// Social page handed to the scraper for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTarget {
    pub id: Uuid,
    pub url: String,
    pub external_page_id: Option<String>,
    pub venue_id: Option<Uuid>,
}

/// Venue website listing page configured for a metro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTarget {
    pub url: String,
    #[serde(default)]
    pub venue_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub metro: Metro,
    pub params: SourceParams,
    pub pages: Vec<PageTarget>,
    pub sites: Vec<SiteTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub message: String,
    /// The page is gone (404/410) rather than temporarily unreachable.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    pub page_id: Uuid,
    pub result: Result<usize, PageFailure>,
    pub resolved_page_id: Option<String>,
}

/// Everything one adapter call produced, in adapter order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub page_outcomes: Vec<PageOutcome>,
    /// Per-target problems that did not fail the source.
    pub warnings: Vec<String>,
}

impl SourceBatch {
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Pages were attempted and every one of them failed.
    pub fn all_pages_failed(&self) -> bool {
        !self.page_outcomes.is_empty() && self.page_outcomes.iter().all(|o| o.result.is_err())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LinkStatus {
    Valid,
    Broken,
    Error(String),
}

/// 2xx/3xx is valid, 4xx broken, anything else an error worth retrying later.
pub fn link_status_for(status: u16) -> LinkStatus {
    match status {
        200..=399 => LinkStatus::Valid,
        400..=499 => LinkStatus::Broken,
        other => LinkStatus::Error(format!("http status {other}")),
    }
}

/// Probe `url` once and classify the answer.
pub async fn probe_link(http: &HttpFetcher, source_name: &str, url: &str) -> LinkStatus {
    match http.probe(source_name, url).await {
        Ok(status) => link_status_for(status.as_u16()),
        Err(err) => LinkStatus::Error(err.to_string()),
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;
    /// Configured source name; used in external ids and run logs.
    fn name(&self) -> &str;

    async fn fetch_events(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError>;

    async fn fetch_venues(
        &self,
        _http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        Err(AdapterError::new(
            self.name(),
            "venue discovery is not supported by this source",
        ))
    }

    fn supports_link_check(&self) -> bool {
        false
    }

    async fn check_link(&self, http: &HttpFetcher, url: &str) -> LinkStatus {
        probe_link(http, self.name(), url).await
    }
}

/// Resolved per-source settings. Secrets are already read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub name: String,
    pub kind: SourceKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub page_limit: usize,
    /// Venue-website listing pages keyed by metro slug.
    pub sites: BTreeMap<String, Vec<SiteTarget>>,
    /// Place-discovery text queries; the adapter's defaults when empty.
    pub queries: Vec<String>,
}

impl AdapterSettings {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            api_key: None,
            base_url: None,
            page_limit: 5,
            sites: BTreeMap::new(),
            queries: Vec::new(),
        }
    }

    fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    fn require_api_key(&self) -> Result<&str, AdapterError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AdapterError::new(&self.name, "missing API key"))
    }
}

pub fn adapter_for_source(settings: AdapterSettings) -> Box<dyn SourceAdapter> {
    match settings.kind {
        SourceKind::Ticketmaster => Box::new(ticketmaster::TicketmasterAdapter::new(settings)),
        SourceKind::Seatgeek => Box::new(seatgeek::SeatgeekAdapter::new(settings)),
        SourceKind::SocialPage => Box::new(social::SocialPageAdapter::new(settings)),
        SourceKind::VenueWebsite => Box::new(venue_site::VenueWebsiteAdapter::new(settings)),
        SourceKind::GooglePlaces => Box::new(places::GooglePlacesAdapter::new(settings)),
    }
}

/// Mismatched params are a wiring bug, reported against the source rather than panicking.
pub(crate) fn wrong_params(source_name: &str, params: &SourceParams) -> AdapterError {
    AdapterError::new(
        source_name,
        format!("unexpected metro parameters {params:?}"),
    )
}

pub(crate) fn parse_json(source_name: &str, body: &str) -> Result<serde_json::Value, AdapterError> {
    serde_json::from_str(body)
        .map_err(|e| AdapterError::new(source_name, format!("invalid JSON response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_named_in_the_message() {
        let err = AdapterError::from_fetch(
            "ticketing-a",
            &FetchError::HttpStatus {
                status: 401,
                url: "https://api.example.test/events".into(),
            },
        );
        assert_eq!(err.source_name, "ticketing-a");
        assert!(err.message.starts_with("authentication rejected"));
        assert!(err.to_string().starts_with("ticketing-a: "));
    }

    #[test]
    fn dispatch_follows_the_source_kind_tag() {
        for kind in SourceKind::ALL {
            let adapter = adapter_for_source(AdapterSettings::new(format!("{kind}-x"), kind));
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.name(), format!("{kind}-x"));
        }
    }

    #[test]
    fn only_scrapers_check_links() {
        let checks: Vec<SourceKind> = SourceKind::ALL
            .into_iter()
            .filter(|k| adapter_for_source(AdapterSettings::new("s", *k)).supports_link_check())
            .collect();
        assert_eq!(checks, vec![SourceKind::SocialPage, SourceKind::VenueWebsite]);
    }

    #[test]
    fn link_statuses_split_on_status_class() {
        assert_eq!(link_status_for(200), LinkStatus::Valid);
        assert_eq!(link_status_for(301), LinkStatus::Valid);
        assert_eq!(link_status_for(404), LinkStatus::Broken);
        assert_eq!(link_status_for(410), LinkStatus::Broken);
        assert!(matches!(link_status_for(503), LinkStatus::Error(_)));
    }

    #[test]
    fn missing_api_key_is_an_adapter_error() {
        let settings = AdapterSettings::new("ticketing-a", SourceKind::Ticketmaster);
        assert_eq!(
            settings.require_api_key().unwrap_err().message,
            "missing API key"
        );
    }

    #[test]
    fn batch_reports_all_pages_failed_only_when_every_page_failed() {
        let failed = PageOutcome {
            page_id: Uuid::new_v4(),
            result: Err(PageFailure {
                message: "gone".into(),
                terminal: true,
            }),
            resolved_page_id: None,
        };
        let ok = PageOutcome {
            page_id: Uuid::new_v4(),
            result: Ok(2),
            resolved_page_id: None,
        };
        assert!(!SourceBatch::default().all_pages_failed());
        let mut batch = SourceBatch {
            page_outcomes: vec![failed.clone()],
            ..SourceBatch::default()
        };
        assert!(batch.all_pages_failed());
        batch.page_outcomes.push(ok);
        assert!(!batch.all_pages_failed());
    }
}
