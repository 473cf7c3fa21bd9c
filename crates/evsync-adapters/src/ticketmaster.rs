//! Ticketing API #1: city/state queries against a Discovery-style events endpoint.

use async_trait::async_trait;
use evsync_core::{RawRecord, SourceKind, SourceParams};
use evsync_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    parse_json, wrong_params, AdapterError, AdapterSettings, FetchContext, SourceAdapter,
    SourceBatch,
};

const DEFAULT_BASE_URL: &str = "https://app.ticketmaster.com/discovery/v2";
const PAGE_SIZE: usize = 100;

pub struct TicketmasterAdapter {
    settings: AdapterSettings,
}

/// One page of results plus whether another page exists.
#[derive(Debug, Clone, PartialEq)]
pub struct EventsPage {
    pub events: Vec<JsonValue>,
    pub has_more: bool,
}

/// Parse a Discovery events response. A missing `_embedded` block means zero results.
pub fn parse_events_page(body: &JsonValue) -> EventsPage {
    let events = body
        .pointer("/_embedded/events")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let number = body.pointer("/page/number").and_then(JsonValue::as_u64).unwrap_or(0);
    let total_pages = body
        .pointer("/page/totalPages")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    EventsPage {
        has_more: !events.is_empty() && number + 1 < total_pages,
        events,
    }
}

fn api_fault(body: &JsonValue) -> Option<String> {
    body.pointer("/fault/faultstring")
        .or_else(|| body.pointer("/errors/0/detail"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

impl TicketmasterAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceAdapter for TicketmasterAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ticketmaster
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_events(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        let SourceParams::CityState { city, state_code } = &ctx.params else {
            return Err(wrong_params(self.name(), &ctx.params));
        };
        let api_key = self.settings.require_api_key()?;
        let url = format!("{}/events.json", self.settings.base_url_or(DEFAULT_BASE_URL));

        let mut records = Vec::new();
        for page in 0..self.settings.page_limit.max(1) {
            let request = HttpRequest::get(self.name(), &url)
                .query("apikey", api_key)
                .query("city", city)
                .query("stateCode", state_code)
                .query("size", PAGE_SIZE)
                .query("page", page)
                .query("sort", "date,asc");
            let response = http
                .fetch(&request)
                .await
                .map_err(|e| AdapterError::from_fetch(self.name(), &e))?;
            let body = parse_json(self.name(), &response.text())?;
            if let Some(fault) = api_fault(&body) {
                return Err(AdapterError::new(self.name(), fault));
            }

            let parsed = parse_events_page(&body);
            debug!(source = self.name(), page, count = parsed.events.len(), "fetched page");
            records.extend(
                parsed
                    .events
                    .into_iter()
                    .map(|e| RawRecord::new(SourceKind::Ticketmaster, self.name(), e)),
            );
            if !parsed.has_more {
                break;
            }
        }
        Ok(SourceBatch::from_records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_result_pages_are_not_errors() {
        let parsed = parse_events_page(&json!({
            "page": {"size": 100, "totalElements": 0, "totalPages": 0, "number": 0}
        }));
        assert!(parsed.events.is_empty());
        assert!(!parsed.has_more);
    }

    #[test]
    fn reports_more_pages_until_the_last() {
        let body = json!({
            "_embedded": {"events": [{"id": "G5v"}, {"id": "G5w"}]},
            "page": {"size": 2, "totalElements": 5, "totalPages": 3, "number": 1}
        });
        let parsed = parse_events_page(&body);
        assert_eq!(parsed.events.len(), 2);
        assert!(parsed.has_more);

        let last = json!({
            "_embedded": {"events": [{"id": "G5x"}]},
            "page": {"totalPages": 3, "number": 2}
        });
        assert!(!parse_events_page(&last).has_more);
    }

    #[test]
    fn surfaces_api_faults() {
        let body = json!({"fault": {"faultstring": "Invalid ApiKey"}});
        assert_eq!(api_fault(&body).as_deref(), Some("Invalid ApiKey"));
        assert_eq!(api_fault(&json!({"page": {}})), None);
    }
}
