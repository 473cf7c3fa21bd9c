//! Place-discovery API: text search around the metro center, token-paginated.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use evsync_core::{RawRecord, SourceKind, SourceParams};
use evsync_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    parse_json, wrong_params, AdapterError, AdapterSettings, FetchContext, SourceAdapter,
    SourceBatch,
};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_QUERIES: &[&str] = &["live music venue", "concert hall", "theater", "comedy club"];
/// The API never returns more than three pages per query.
const MAX_PAGES: usize = 3;
/// A fresh `next_page_token` is rejected until it propagates.
const PAGE_TOKEN_DELAY: Duration = Duration::from_secs(2);

pub struct GooglePlacesAdapter {
    settings: AdapterSettings,
}

impl GooglePlacesAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn queries(&self) -> Vec<String> {
        if self.settings.queries.is_empty() {
            DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect()
        } else {
            self.settings.queries.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacesPage {
    pub results: Vec<JsonValue>,
    pub next_page_token: Option<String>,
}

/// Interpret a text-search response. `ZERO_RESULTS` is an empty page; other
/// non-OK statuses fail the source.
pub fn parse_search_page(body: &JsonValue) -> Result<PlacesPage, String> {
    let status = body.get("status").and_then(JsonValue::as_str).unwrap_or("OK");
    match status {
        "OK" => Ok(PlacesPage {
            results: body
                .get("results")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
            next_page_token: body
                .get("next_page_token")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        }),
        "ZERO_RESULTS" => Ok(PlacesPage {
            results: Vec::new(),
            next_page_token: None,
        }),
        other => {
            let detail = body
                .get("error_message")
                .and_then(JsonValue::as_str)
                .unwrap_or("no detail");
            Err(format!("{other}: {detail}"))
        }
    }
}

#[async_trait]
impl SourceAdapter for GooglePlacesAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::GooglePlaces
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_events(
        &self,
        _http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        Err(AdapterError::new(
            self.name(),
            "place discovery sources do not provide events",
        ))
    }

    async fn fetch_venues(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        let SourceParams::RegionRadius {
            region,
            latitude,
            longitude,
            radius_meters,
        } = &ctx.params
        else {
            return Err(wrong_params(self.name(), &ctx.params));
        };
        let api_key = self.settings.require_api_key()?;
        let url = format!("{}/textsearch/json", self.settings.base_url_or(DEFAULT_BASE_URL));

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for query in self.queries() {
            let mut token: Option<String> = None;
            for page in 0..MAX_PAGES.min(self.settings.page_limit.max(1)) {
                let mut request = HttpRequest::get(self.name(), &url).query("key", api_key);
                request = match &token {
                    Some(t) => {
                        tokio::time::sleep(PAGE_TOKEN_DELAY).await;
                        request.query("pagetoken", t)
                    }
                    None => request
                        .query("query", format!("{query} in {region}"))
                        .query("location", format!("{latitude},{longitude}"))
                        .query("radius", radius_meters),
                };
                let response = http
                    .fetch(&request)
                    .await
                    .map_err(|e| AdapterError::from_fetch(self.name(), &e))?;
                let body = parse_json(self.name(), &response.text())?;
                let parsed =
                    parse_search_page(&body).map_err(|m| AdapterError::new(self.name(), m))?;
                debug!(source = self.name(), query = %query, page, count = parsed.results.len(), "fetched places");

                for place in parsed.results {
                    let place_id = place
                        .get("place_id")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string);
                    // Overlapping queries return the same place; keep the first.
                    if let Some(id) = place_id {
                        if !seen.insert(id) {
                            continue;
                        }
                    }
                    records.push(RawRecord::new(SourceKind::GooglePlaces, self.name(), place));
                }
                match parsed.next_page_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }
        Ok(SourceBatch::from_records(records))
    }
}
