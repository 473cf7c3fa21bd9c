//! Run orchestration for the event-sync and venue-discovery flows.
//!
//! A trigger call selects metros and sources, takes a lease on every selected
//! metro, then walks the metros one by one. Within a metro, sources run with
//! bounded concurrency and each source's records are applied strictly in order
//! under a single write lock. A source that errors or runs past the deadline is
//! recorded and never aborts its siblings. Each metro produces one run log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use evsync_adapters::{PageOutcome, PageTarget, SourceAdapter, SourceBatch};
use evsync_core::{
    resolve, CanonicalRecord, Flow, Metro, MetroSet, PageStatus, RawRecord, RunStatus, SourceKind,
    SyncRunLog, Taxonomy, VenueRef,
};
use evsync_storage::{HttpFetcher, Store};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::matcher::Matcher;
use crate::normalize::Normalizer;
use crate::writer::{UpsertWriter, WriteAction};
use crate::{RecordError, SyncError};

/// Tunables; every field is overridable in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub proximity_threshold_m: f64,
    /// Consecutive scrape failures that demote an active social page.
    pub failure_threshold: u32,
    pub source_concurrency: usize,
    /// Wall-clock budget for a whole trigger call; `None` disables it.
    pub run_budget: Option<Duration>,
    pub link_check_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: 150.0,
            failure_threshold: 3,
            source_concurrency: 3,
            run_budget: Some(Duration::from_secs(900)),
            link_check_limit: 200,
        }
    }
}

/// Optional overrides carried by a trigger. Empty lists mean "the defaults".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunRequest {
    pub metros: Vec<String>,
    pub sources: Vec<String>,
}

impl RunRequest {
    pub fn for_metros<I, S>(metros: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metros: metros.into_iter().map(Into::into).collect(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub records_fetched: u32,
    /// Records that reached the store, including no-op refreshes.
    pub records_applied: u32,
    pub events_created: u32,
    pub events_updated: u32,
    pub events_unchanged: u32,
    pub venues_created: u32,
    pub venues_updated: u32,
    pub venues_unchanged: u32,
    pub records_rejected: u32,
    pub errors: Vec<String>,
}

impl SourceReport {
    fn merge(&mut self, other: &SourceReport) {
        self.records_fetched += other.records_fetched;
        self.records_applied += other.records_applied;
        self.events_created += other.events_created;
        self.events_updated += other.events_updated;
        self.events_unchanged += other.events_unchanged;
        self.venues_created += other.venues_created;
        self.venues_updated += other.venues_updated;
        self.venues_unchanged += other.venues_unchanged;
        self.records_rejected += other.records_rejected;
        self.errors.extend(other.errors.iter().cloned());
    }

    fn count(&mut self, applied: Applied) {
        self.records_applied += 1;
        match applied {
            Applied::Event { event, venue } => {
                match event {
                    WriteAction::Created => self.events_created += 1,
                    WriteAction::Updated => self.events_updated += 1,
                    WriteAction::Unchanged => self.events_unchanged += 1,
                }
                match venue {
                    Some(WriteAction::Created) => self.venues_created += 1,
                    Some(WriteAction::Updated) => self.venues_updated += 1,
                    Some(WriteAction::Unchanged) | None => {}
                }
            }
            Applied::Venue(action) => match action {
                WriteAction::Created => self.venues_created += 1,
                WriteAction::Updated => self.venues_updated += 1,
                WriteAction::Unchanged => self.venues_unchanged += 1,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTotals {
    pub events_created: u32,
    pub events_updated: u32,
    pub events_unchanged: u32,
    pub venues_created: u32,
    pub venues_updated: u32,
    pub records_rejected: u32,
}

impl SyncTotals {
    fn from_reports<'a>(reports: impl IntoIterator<Item = &'a SourceReport>) -> Self {
        reports.into_iter().fold(Self::default(), |mut acc, r| {
            acc.events_created += r.events_created;
            acc.events_updated += r.events_updated;
            acc.events_unchanged += r.events_unchanged;
            acc.venues_created += r.venues_created;
            acc.venues_updated += r.venues_updated;
            acc.records_rejected += r.records_rejected;
            acc
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSyncReport {
    pub duration_ms: u64,
    pub status: RunStatus,
    pub per_source: BTreeMap<String, SourceReport>,
    pub totals: SyncTotals,
    pub errors: Vec<String>,
    /// One log per metro, in processing order.
    pub runs: Vec<SyncRunLog>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueDiscoveryReport {
    pub duration_ms: u64,
    pub status: RunStatus,
    pub venues_discovered: u32,
    pub venues_updated: u32,
    pub venues_new: u32,
    pub errors: Vec<String>,
    pub runs: Vec<SyncRunLog>,
}

#[derive(Debug, Clone, Copy)]
enum Applied {
    Event {
        event: WriteAction,
        venue: Option<WriteAction>,
    },
    Venue(WriteAction),
}

struct SourceOutcome {
    name: String,
    report: SourceReport,
    failed: bool,
}

struct FlowRun {
    status: RunStatus,
    per_source: BTreeMap<String, SourceReport>,
    errors: Vec<String>,
    runs: Vec<SyncRunLog>,
    duration_ms: u64,
}

/// Metros with a run in flight. Acquisition is all-or-nothing.
#[derive(Debug, Default)]
struct MetroLeases {
    held: StdMutex<BTreeSet<String>>,
}

struct LeaseGuard<'a> {
    leases: &'a MetroLeases,
    slugs: Vec<String>,
}

impl MetroLeases {
    fn acquire(&self, slugs: Vec<String>) -> Result<LeaseGuard<'_>, SyncError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = slugs.iter().find(|slug| held.contains(*slug)) {
            return Err(SyncError::RunInProgress {
                metro: busy.clone(),
            });
        }
        held.extend(slugs.iter().cloned());
        Ok(LeaseGuard {
            leases: self,
            slugs,
        })
    }

    fn is_held(&self, slug: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(slug)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.leases.held.lock().unwrap_or_else(PoisonError::into_inner);
        for slug in &self.slugs {
            held.remove(slug);
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn overall_status(statuses: &[RunStatus]) -> RunStatus {
    if statuses.iter().all(|s| *s == RunStatus::Success) {
        RunStatus::Success
    } else if statuses.iter().all(|s| *s == RunStatus::Failed) {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

pub struct SyncEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) http: Arc<HttpFetcher>,
    pub(crate) adapters: Vec<Arc<dyn SourceAdapter>>,
    normalizer: Normalizer,
    matcher: Matcher,
    writer: UpsertWriter,
    lifecycle: LifecycleManager,
    leases: MetroLeases,
    /// Serializes match+write so two sources never race on the same candidate.
    write_lock: Mutex<()>,
    pub(crate) config: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        http: Arc<HttpFetcher>,
        adapters: Vec<Box<dyn SourceAdapter>>,
        taxonomy: Taxonomy,
        config: EngineConfig,
    ) -> Self {
        Self {
            lifecycle: LifecycleManager::new(store.clone(), config.failure_threshold),
            matcher: Matcher::new(config.proximity_threshold_m),
            normalizer: Normalizer::new(taxonomy),
            writer: UpsertWriter::new(),
            adapters: adapters.into_iter().map(Arc::from).collect(),
            leases: MetroLeases::default(),
            write_lock: Mutex::new(()),
            store,
            http,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Whether a run currently holds the lease for `metro`.
    pub fn is_running(&self, metro: &str) -> bool {
        self.leases.is_held(metro)
    }

    pub async fn run_event_sync(
        &self,
        metros: &MetroSet,
        request: &RunRequest,
    ) -> Result<EventSyncReport, SyncError> {
        let run = self.run_flow(Flow::EventSync, metros, request).await?;
        let totals = SyncTotals::from_reports(run.per_source.values());
        info!(
            status = run.status.as_str(),
            events_created = totals.events_created,
            events_updated = totals.events_updated,
            errors = run.errors.len(),
            "event sync finished"
        );
        Ok(EventSyncReport {
            duration_ms: run.duration_ms,
            status: run.status,
            totals,
            per_source: run.per_source,
            errors: run.errors,
            runs: run.runs,
        })
    }

    pub async fn run_venue_discovery(
        &self,
        metros: &MetroSet,
        request: &RunRequest,
    ) -> Result<VenueDiscoveryReport, SyncError> {
        let run = self.run_flow(Flow::VenueDiscovery, metros, request).await?;
        let totals = run
            .per_source
            .values()
            .fold(SourceReport::default(), |mut acc, r| {
                acc.merge(r);
                acc
            });
        info!(
            status = run.status.as_str(),
            venues_new = totals.venues_created,
            venues_updated = totals.venues_updated,
            errors = run.errors.len(),
            "venue discovery finished"
        );
        Ok(VenueDiscoveryReport {
            duration_ms: run.duration_ms,
            status: run.status,
            venues_discovered: totals.records_fetched,
            venues_updated: totals.venues_updated,
            venues_new: totals.venues_created,
            errors: run.errors,
            runs: run.runs,
        })
    }

    fn run_label(flow: Flow, request: &RunRequest) -> String {
        match request.sources.as_slice() {
            [single] => single.clone(),
            _ => flow.as_str().to_string(),
        }
    }

    fn select(
        &self,
        flow: Flow,
        metros: &MetroSet,
        request: &RunRequest,
    ) -> Result<(Vec<Metro>, Vec<Arc<dyn SourceAdapter>>), String> {
        let selected = if request.metros.is_empty() {
            metros.active()
        } else {
            metros.select(&request.metros).map_err(|e| e.to_string())?
        };
        if selected.is_empty() {
            return Err("no active metros configured".to_string());
        }

        let mut chosen: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        if request.sources.is_empty() {
            chosen.extend(self.adapters.iter().filter(|a| a.kind().flow() == flow).cloned());
        } else {
            for name in &request.sources {
                let adapter = self
                    .adapters
                    .iter()
                    .find(|a| a.name() == name)
                    .ok_or_else(|| format!("unknown source {name}"))?;
                if adapter.kind().flow() != flow {
                    return Err(format!(
                        "source {name} feeds {} and cannot run in {flow}",
                        adapter.kind().flow()
                    ));
                }
                if !chosen.iter().any(|a| a.name() == name) {
                    chosen.push(adapter.clone());
                }
            }
        }
        if chosen.is_empty() {
            return Err(format!("no enabled {flow} sources configured"));
        }
        Ok((selected, chosen))
    }

    async fn run_flow(
        &self,
        flow: Flow,
        metros: &MetroSet,
        request: &RunRequest,
    ) -> Result<FlowRun, SyncError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let label = Self::run_label(flow, request);

        let (selected, adapters) = match self.select(flow, metros, request) {
            Ok(selection) => selection,
            Err(message) => {
                warn!(flow = flow.as_str(), error = %message, "run could not start");
                let metro_slug = if request.metros.is_empty() {
                    "*".to_string()
                } else {
                    request.metros.join(",")
                };
                let log = SyncRunLog {
                    id: Uuid::new_v4(),
                    source_name: label,
                    metro_slug,
                    status: RunStatus::Failed,
                    events_created: 0,
                    events_updated: 0,
                    venues_created: 0,
                    errors: vec![message.clone()],
                    duration_ms: elapsed_ms(started),
                    started_at,
                    completed_at: Utc::now(),
                };
                self.persist_log(&log).await;
                return Err(SyncError::Initialization(message));
            }
        };

        let _lease = self
            .leases
            .acquire(selected.iter().map(|m| m.slug.clone()).collect())?;
        let deadline = self.config.run_budget.map(|budget| started + budget);

        let mut per_source: BTreeMap<String, SourceReport> = BTreeMap::new();
        let mut errors = Vec::new();
        let mut runs = Vec::with_capacity(selected.len());
        for metro in &selected {
            let run_id = Uuid::new_v4();
            let span = info_span!("sync_run", %run_id, flow = flow.as_str(), metro = %metro.slug);
            let (log, outcomes) = self
                .run_metro(flow, run_id, metro, &adapters, &label, deadline)
                .instrument(span)
                .await;
            for outcome in outcomes {
                errors.extend(outcome.report.errors.iter().cloned());
                per_source.entry(outcome.name).or_default().merge(&outcome.report);
            }
            runs.push(log);
        }

        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        Ok(FlowRun {
            status: overall_status(&statuses),
            per_source,
            errors,
            runs,
            duration_ms: elapsed_ms(started),
        })
    }

    async fn run_metro(
        &self,
        flow: Flow,
        run_id: Uuid,
        metro: &Metro,
        adapters: &[Arc<dyn SourceAdapter>],
        label: &str,
        deadline: Option<Instant>,
    ) -> (SyncRunLog, Vec<SourceOutcome>) {
        let started = Instant::now();
        let started_at = Utc::now();
        info!(sources = adapters.len(), "run started");

        let runs: Vec<_> = adapters
            .iter()
            .map(|adapter| self.run_source(flow, run_id, metro, adapter.clone(), deadline))
            .collect();
        let mut outcomes: Vec<SourceOutcome> = stream::iter(runs)
            .buffer_unordered(self.config.source_concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));

        let failed = outcomes.iter().filter(|o| o.failed).count();
        let applied: u32 = outcomes.iter().map(|o| o.report.records_applied).sum();
        let status = match RunStatus::from_counts(outcomes.len(), failed) {
            RunStatus::Partial if applied == 0 => RunStatus::Failed,
            status => status,
        };
        let totals = SyncTotals::from_reports(outcomes.iter().map(|o| &o.report));
        let log = SyncRunLog {
            id: run_id,
            source_name: label.to_string(),
            metro_slug: metro.slug.clone(),
            status,
            events_created: totals.events_created,
            events_updated: totals.events_updated,
            venues_created: totals.venues_created,
            errors: outcomes
                .iter()
                .flat_map(|o| o.report.errors.iter().cloned())
                .collect(),
            duration_ms: elapsed_ms(started),
            started_at,
            completed_at: Utc::now(),
        };
        self.persist_log(&log).await;
        info!(
            status = status.as_str(),
            failed_sources = failed,
            events_created = log.events_created,
            events_updated = log.events_updated,
            venues_created = log.venues_created,
            "run finalized"
        );
        (log, outcomes)
    }

    async fn persist_log(&self, log: &SyncRunLog) {
        if let Err(err) = self.store.append_run_log(log).await {
            warn!(run_id = %log.id, error = %err, "failed to persist run log");
        }
    }

    async fn run_source(
        &self,
        flow: Flow,
        run_id: Uuid,
        metro: &Metro,
        adapter: Arc<dyn SourceAdapter>,
        deadline: Option<Instant>,
    ) -> SourceOutcome {
        let name = adapter.name().to_string();
        let tally = Mutex::new(SourceReport::default());
        let work = self
            .process_source(flow, run_id, metro, adapter.as_ref(), &tally)
            .instrument(info_span!("source", source = %name));
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .unwrap_or_else(|_| Err(format!("{name}: timed out after run budget"))),
            None => work.await,
        };

        let mut report = tally.into_inner();
        let failed = match result {
            Ok(()) => false,
            Err(message) => {
                warn!(source = %name, error = %message, "source failed");
                report.errors.push(message);
                true
            }
        };
        SourceOutcome {
            name,
            report,
            failed,
        }
    }

    /// Fetch and apply one source. `Err` marks the whole source as failed;
    /// per-record problems are tallied instead.
    async fn process_source(
        &self,
        flow: Flow,
        run_id: Uuid,
        metro: &Metro,
        adapter: &dyn SourceAdapter,
        tally: &Mutex<SourceReport>,
    ) -> Result<(), String> {
        let name = adapter.name();
        let pages = if adapter.kind() == SourceKind::SocialPage {
            self.page_targets(&metro.slug)
                .await
                .map_err(|e| format!("{name}: listing social pages: {e}"))?
        } else {
            Vec::new()
        };
        let ctx = evsync_adapters::FetchContext {
            run_id,
            metro: metro.clone(),
            params: resolve(metro, adapter.kind()),
            pages,
            sites: Vec::new(),
        };
        let fetched = match flow {
            Flow::EventSync => adapter.fetch_events(&self.http, &ctx).await,
            Flow::VenueDiscovery => adapter.fetch_venues(&self.http, &ctx).await,
        };
        let batch = fetched.map_err(|e| e.to_string())?;

        self.apply_page_outcomes(name, &batch, tally).await;
        {
            let mut report = tally.lock().await;
            report.records_fetched += u32::try_from(batch.records.len()).unwrap_or(u32::MAX);
            report
                .errors
                .extend(batch.warnings.iter().map(|w| format!("{name}: {w}")));
        }

        let offset = metro.offset();
        for raw in &batch.records {
            match self.apply_record(raw, offset).await {
                Ok(applied) => tally.lock().await.count(applied),
                Err(err) => {
                    warn!(source = name, error = %err, "record rejected");
                    let mut report = tally.lock().await;
                    report.records_rejected += 1;
                    report.errors.push(format!("{name}: {err}"));
                }
            }
        }

        if batch.all_pages_failed() {
            return Err(format!(
                "{name}: all {} social pages failed",
                batch.page_outcomes.len()
            ));
        }
        Ok(())
    }

    async fn page_targets(&self, metro_slug: &str) -> Result<Vec<PageTarget>, LifecycleError> {
        Ok(self
            .lifecycle
            .list_pages(None)
            .await?
            .into_iter()
            .filter(|p| p.metro_slug == metro_slug && p.status.is_scrapable())
            .map(|p| PageTarget {
                id: p.id,
                url: p.url,
                external_page_id: p.external_page_id,
                venue_id: p.venue_id,
            })
            .collect())
    }

    async fn apply_page_outcomes(&self, name: &str, batch: &SourceBatch, tally: &Mutex<SourceReport>) {
        for outcome in &batch.page_outcomes {
            if let Err(err) = self.apply_page_outcome(outcome).await {
                warn!(source = name, page = %outcome.page_id, error = %err, "page status update failed");
                tally
                    .lock()
                    .await
                    .errors
                    .push(format!("{name}: page {}: {err}", outcome.page_id));
            }
        }
    }

    async fn apply_page_outcome(&self, outcome: &PageOutcome) -> Result<(), LifecycleError> {
        match &outcome.result {
            Ok(_) => {
                if let Some(external_id) = &outcome.resolved_page_id {
                    self.lifecycle
                        .resolve_page_id(outcome.page_id, external_id)
                        .await?;
                }
                self.lifecycle.record_scrape_success(outcome.page_id).await?;
            }
            Err(failure) => {
                let page = self
                    .lifecycle
                    .record_scrape_failure(outcome.page_id, failure.terminal)
                    .await?;
                if page.status == PageStatus::Failed {
                    info!(page = %page.id, reason = %failure.message, "social page marked failed");
                }
            }
        }
        Ok(())
    }

    async fn apply_record(&self, raw: &RawRecord, offset: FixedOffset) -> Result<Applied, RecordError> {
        let canonical = self.normalizer.normalize(raw, offset)?;
        let _write = self.write_lock.lock().await;
        let store = self.store.as_ref();

        match canonical {
            CanonicalRecord::Venue(venue) => {
                let decision = self.matcher.match_venue(store, &venue).await?;
                let outcome = self.writer.write_venue(store, &venue, decision).await?;
                Ok(Applied::Venue(outcome.action))
            }
            CanonicalRecord::Event(event) => {
                let (venue_id, venue_action) = match &event.venue {
                    VenueRef::Linked(id) => {
                        if store.venue(*id).await?.is_none() {
                            return Err(RecordError::Validation(format!(
                                "linked venue {id} does not exist"
                            )));
                        }
                        (*id, None)
                    }
                    VenueRef::Candidate(venue) => {
                        let decision = self.matcher.match_venue(store, venue).await?;
                        let outcome = self.writer.write_venue(store, venue, decision).await?;
                        (outcome.id, Some(outcome.action))
                    }
                };
                let decision = self.matcher.match_event(store, &event, venue_id, offset).await?;
                let outcome = self
                    .writer
                    .write_event(store, &event, venue_id, decision, offset)
                    .await?;
                Ok(Applied::Event {
                    event: outcome.action,
                    venue: venue_action,
                })
            }
        }
    }
}
