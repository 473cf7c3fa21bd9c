//! Cron triggers for the two sync flows.

use std::sync::Arc;

use anyhow::{Context, Result};
use evsync_core::MetroSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{RunRequest, SyncEngine};
use crate::{SyncConfig, SyncError};

fn log_trigger_error(flow: &str, err: &SyncError) {
    match err {
        SyncError::RunInProgress { metro } => {
            info!(flow, metro = %metro, "skipping scheduled run; previous run still active")
        }
        SyncError::Initialization(message) => {
            warn!(flow, error = %message, "scheduled run could not start")
        }
    }
}

/// Returns `None` when scheduling is disabled. The caller starts the scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<SyncEngine>,
    metros: MetroSet,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let (event_engine, event_metros) = (engine.clone(), metros.clone());
    let cron = &config.event_sync_cron;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let engine = event_engine.clone();
        let metros = event_metros.clone();
        Box::pin(async move {
            match engine.run_event_sync(&metros, &RunRequest::default()).await {
                Ok(report) => info!(
                    status = report.status.as_str(),
                    events_created = report.totals.events_created,
                    "scheduled event sync done"
                ),
                Err(err) => log_trigger_error("event-sync", &err),
            }
        })
    })
    .with_context(|| format!("creating event sync job for cron {cron}"))?;
    sched.add(job).await.context("adding event sync job")?;

    let cron = &config.venue_discovery_cron;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let engine = engine.clone();
        let metros = metros.clone();
        Box::pin(async move {
            match engine.run_venue_discovery(&metros, &RunRequest::default()).await {
                Ok(report) => info!(
                    status = report.status.as_str(),
                    venues_new = report.venues_new,
                    "scheduled venue discovery done"
                ),
                Err(err) => log_trigger_error("venue-discovery", &err),
            }
        })
    })
    .with_context(|| format!("creating venue discovery job for cron {cron}"))?;
    sched.add(job).await.context("adding venue discovery job")?;

    Ok(Some(sched))
}
