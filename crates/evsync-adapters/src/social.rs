//! Social-page scraper. Each registered page is fetched on its own; one page
//! failing never hides the others.

use async_trait::async_trait;
use evsync_core::{RawRecord, SourceKind};
use evsync_storage::{FetchError, HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::jsonld::{extract_jsonld_events, extract_microdata_events, meta_content};
use crate::{
    AdapterError, AdapterSettings, FetchContext, PageFailure, PageOutcome, PageTarget,
    SourceAdapter, SourceBatch,
};

const PAGE_ID_META: &str = "fb:page_id";

pub struct SocialPageAdapter {
    settings: AdapterSettings,
}

impl SocialPageAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

/// Events published on one page, plus the page's native id when the page exposes it.
pub fn parse_page(html: &str) -> (Vec<JsonValue>, Option<String>) {
    let mut events = extract_jsonld_events(html);
    if events.is_empty() {
        events = extract_microdata_events(html);
    }
    (events, meta_content(html, PAGE_ID_META))
}

/// Gone pages are terminal; everything else may recover by the next run.
pub fn page_failure(err: &FetchError) -> PageFailure {
    PageFailure {
        message: err.to_string(),
        terminal: matches!(err.status(), Some(404) | Some(410)),
    }
}

impl SocialPageAdapter {
    fn records_for(&self, page: &PageTarget, events: Vec<JsonValue>) -> Vec<RawRecord> {
        events
            .into_iter()
            .map(|payload| RawRecord {
                page_id: Some(page.id),
                venue_id: page.venue_id,
                ..RawRecord::new(SourceKind::SocialPage, self.name(), payload)
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for SocialPageAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::SocialPage
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_events(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch::default();
        for page in &ctx.pages {
            let request = HttpRequest::get(self.name(), &page.url);
            match http.fetch(&request).await {
                Ok(response) => {
                    let (events, native_id) = parse_page(&response.text());
                    debug!(source = self.name(), page = %page.id, count = events.len(), "scraped page");
                    let count = events.len();
                    batch.records.extend(self.records_for(page, events));
                    batch.page_outcomes.push(PageOutcome {
                        page_id: page.id,
                        result: Ok(count),
                        resolved_page_id: native_id.filter(|_| page.external_page_id.is_none()),
                    });
                }
                Err(err) => {
                    let failure = page_failure(&err);
                    warn!(source = self.name(), page = %page.id, terminal = failure.terminal, error = %err, "page scrape failed");
                    batch.warnings.push(format!("{}: {}", page.url, failure.message));
                    batch.page_outcomes.push(PageOutcome {
                        page_id: page.id,
                        result: Err(failure),
                        resolved_page_id: None,
                    });
                }
            }
        }
        Ok(batch)
    }

    fn supports_link_check(&self) -> bool {
        true
    }
}
