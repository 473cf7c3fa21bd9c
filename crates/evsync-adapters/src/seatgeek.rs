//! Ticketing API #2: lat/lon + range queries, page-numbered results.

use async_trait::async_trait;
use evsync_core::{RawRecord, SourceKind, SourceParams};
use evsync_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    parse_json, wrong_params, AdapterError, AdapterSettings, FetchContext, SourceAdapter,
    SourceBatch,
};

const DEFAULT_BASE_URL: &str = "https://api.seatgeek.com/2";
const PER_PAGE: u64 = 100;

pub struct SeatgeekAdapter {
    settings: AdapterSettings,
}

impl SeatgeekAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

/// Events on this page and whether `meta.total` promises another one.
pub fn parse_events_page(body: &JsonValue) -> (Vec<JsonValue>, bool) {
    let events = body
        .get("events")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let total = body.pointer("/meta/total").and_then(JsonValue::as_u64).unwrap_or(0);
    let page = body.pointer("/meta/page").and_then(JsonValue::as_u64).unwrap_or(1);
    let per_page = body
        .pointer("/meta/per_page")
        .and_then(JsonValue::as_u64)
        .unwrap_or(PER_PAGE)
        .max(1);
    let has_more = !events.is_empty() && page * per_page < total;
    (events, has_more)
}

#[async_trait]
impl SourceAdapter for SeatgeekAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Seatgeek
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_events(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        let SourceParams::LatLonRange {
            latitude,
            longitude,
            range,
        } = &ctx.params
        else {
            return Err(wrong_params(self.name(), &ctx.params));
        };
        let client_id = self.settings.require_api_key()?;
        let url = format!("{}/events", self.settings.base_url_or(DEFAULT_BASE_URL));

        let mut records = Vec::new();
        for page in 1..=self.settings.page_limit.max(1) {
            let request = HttpRequest::get(self.name(), &url)
                .query("client_id", client_id)
                .query("lat", latitude)
                .query("lon", longitude)
                .query("range", range)
                .query("per_page", PER_PAGE)
                .query("page", page)
                .query("sort", "datetime_utc.asc");
            let response = http
                .fetch(&request)
                .await
                .map_err(|e| AdapterError::from_fetch(self.name(), &e))?;
            let body = parse_json(self.name(), &response.text())?;
            if let Some(message) = body.get("message").and_then(JsonValue::as_str) {
                if body.get("events").is_none() {
                    return Err(AdapterError::new(self.name(), message));
                }
            }

            let (events, has_more) = parse_events_page(&body);
            debug!(source = self.name(), page, count = events.len(), "fetched page");
            records.extend(
                events
                    .into_iter()
                    .map(|e| RawRecord::new(SourceKind::Seatgeek, self.name(), e)),
            );
            if !has_more {
                break;
            }
        }
        Ok(SourceBatch::from_records(records))
    }
}
