//! On-demand link health check over externally-sourced events and social pages.

use std::sync::Arc;

use evsync_adapters::{probe_link, LinkStatus, SourceAdapter};
use evsync_storage::StoreError;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::SyncEngine;

/// Probes in flight at once; the fetcher's own limits still apply underneath.
const PROBE_CONCURRENCY: usize = 4;
const PAGE_PROBE_SOURCE: &str = "social-pages";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLink {
    pub id: Uuid,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHealthReport {
    pub total: usize,
    pub valid: usize,
    pub broken: usize,
    pub errors: usize,
    pub broken_links: Vec<BrokenLink>,
}

struct LinkCandidate {
    id: Uuid,
    title: String,
    url: String,
    /// `None` for social pages, which are probed directly.
    adapter: Option<Arc<dyn SourceAdapter>>,
}

impl SyncEngine {
    fn link_adapter(&self, source: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.name() == source && a.supports_link_check())
            .cloned()
    }

    /// Probe at most `link_check_limit` stored links whose source supports checking.
    pub async fn check_links(&self) -> Result<LinkHealthReport, StoreError> {
        let limit = self.config.link_check_limit;
        let mut candidates: Vec<LinkCandidate> = Vec::new();

        let checkable: Vec<String> = self
            .adapters
            .iter()
            .filter(|a| a.supports_link_check())
            .map(|a| a.name().to_string())
            .collect();
        for event in self.store.events_with_external_url(&checkable, limit).await? {
            let adapter = event
                .external
                .as_ref()
                .and_then(|ext| self.link_adapter(&ext.source));
            if let (Some(adapter), Some(url)) = (adapter, event.external_url) {
                candidates.push(LinkCandidate {
                    id: event.id,
                    title: event.title,
                    url,
                    adapter: Some(adapter),
                });
            }
        }
        for page in self.store.list_pages(None).await? {
            if candidates.len() >= limit {
                break;
            }
            candidates.push(LinkCandidate {
                id: page.id,
                title: page.display_name,
                url: page.url,
                adapter: None,
            });
        }
        candidates.truncate(limit);

        let http = self.http.as_ref();
        let probes: Vec<_> = candidates
            .into_iter()
            .map(|candidate| async move {
                let status = match &candidate.adapter {
                    Some(adapter) => adapter.check_link(http, &candidate.url).await,
                    None => probe_link(http, PAGE_PROBE_SOURCE, &candidate.url).await,
                };
                (candidate, status)
            })
            .collect();
        let probed: Vec<(LinkCandidate, LinkStatus)> = stream::iter(probes)
            .buffered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut report = LinkHealthReport {
            total: probed.len(),
            ..LinkHealthReport::default()
        };
        for (candidate, status) in probed {
            match status {
                LinkStatus::Valid => report.valid += 1,
                LinkStatus::Broken => {
                    report.broken += 1;
                    report.broken_links.push(BrokenLink {
                        id: candidate.id,
                        title: candidate.title,
                        url: candidate.url,
                    });
                }
                LinkStatus::Error(_) => report.errors += 1,
            }
        }
        info!(
            total = report.total,
            valid = report.valid,
            broken = report.broken,
            errors = report.errors,
            "link check finished"
        );
        Ok(report)
    }
}
