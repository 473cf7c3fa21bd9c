//! Venue-website scraper over listing pages configured per metro.

use async_trait::async_trait;
use evsync_core::{RawRecord, SourceKind};
use evsync_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::jsonld::{extract_jsonld_events, extract_microdata_events};
use crate::{AdapterError, AdapterSettings, FetchContext, SiteTarget, SourceAdapter, SourceBatch};

pub struct VenueWebsiteAdapter {
    settings: AdapterSettings,
}

impl VenueWebsiteAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn targets<'a>(&'a self, ctx: &'a FetchContext) -> &'a [SiteTarget] {
        if ctx.sites.is_empty() {
            self.settings
                .sites
                .get(&ctx.metro.slug)
                .map(Vec::as_slice)
                .unwrap_or_default()
        } else {
            &ctx.sites
        }
    }
}

/// JSON-LD and microdata events on one listing page. Both are kept; a site that
/// publishes the same event twice is collapsed later by matching.
pub fn parse_listing(html: &str) -> Vec<JsonValue> {
    let mut events = extract_jsonld_events(html);
    events.extend(extract_microdata_events(html));
    events
}

#[async_trait]
impl SourceAdapter for VenueWebsiteAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::VenueWebsite
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_events(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, AdapterError> {
        let targets = self.targets(ctx);
        let mut batch = SourceBatch::default();
        let mut failures = 0usize;

        for target in targets {
            let request = HttpRequest::get(self.name(), &target.url);
            match http.fetch(&request).await {
                Ok(response) => {
                    let events = parse_listing(&response.text());
                    debug!(source = self.name(), url = %target.url, count = events.len(), "scraped site");
                    batch.records.extend(events.into_iter().map(|payload| RawRecord {
                        venue_id: target.venue_id,
                        ..RawRecord::new(SourceKind::VenueWebsite, self.name(), payload)
                    }));
                }
                Err(err) => {
                    warn!(source = self.name(), url = %target.url, error = %err, "site scrape failed");
                    failures += 1;
                    batch.warnings.push(format!("{}: {err}", target.url));
                }
            }
        }

        if failures > 0 && failures == targets.len() {
            return Err(AdapterError::new(
                self.name(),
                format!("all {failures} sites failed: {}", batch.warnings.join("; ")),
            ));
        }
        Ok(batch)
    }

    fn supports_link_check(&self) -> bool {
        true
    }
}
