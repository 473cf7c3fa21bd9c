//! Record store interface, its in-memory and Postgres implementations, and the
//! rate-limited HTTP fetcher shared by source adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::{Event, ExternalRef, PageStatus, SocialPageSource, SyncRunLog, Venue};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    retryable_status, retryable_transport, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, HttpRequest, RequestBudget, RequestBudgetConfig, RetryPolicy,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "evsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict on {entity}: {detail}")]
    Conflict { entity: &'static str, detail: String },
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Conflict {
                    entity: "row",
                    detail: db.message().to_string(),
                };
            }
        }
        StoreError::Backend(err.to_string())
    }
}

/// The only verbs the engine uses against persistent state.
///
/// Every write is all-or-nothing: a row is either fully stored or the call fails.
#[async_trait]
pub trait Store: Send + Sync {
    async fn venue(&self, id: Uuid) -> Result<Option<Venue>, StoreError>;
    async fn venue_by_external_id(&self, external: &ExternalRef) -> Result<Option<Venue>, StoreError>;
    /// Venues whose normalized name equals `name_key` within `radius_m` meters of the point.
    async fn venues_by_name_near(
        &self,
        name_key: &str,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    ) -> Result<Vec<Venue>, StoreError>;
    async fn insert_venue(&self, venue: &Venue) -> Result<(), StoreError>;
    async fn update_venue(&self, venue: &Venue) -> Result<(), StoreError>;

    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError>;
    async fn event_by_external_id(&self, external: &ExternalRef) -> Result<Option<Event>, StoreError>;
    /// Events held at `venue_id` starting in `[from, to)`.
    async fn events_at_venue_between(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError>;
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError>;
    async fn update_event(&self, event: &Event) -> Result<(), StoreError>;
    /// Events from any of `sources` that carry a URL, oldest-updated first.
    /// The source filter applies before `limit`.
    async fn events_with_external_url(
        &self,
        sources: &[String],
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    async fn append_run_log(&self, log: &SyncRunLog) -> Result<(), StoreError>;
    /// Newest first.
    async fn list_run_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>, StoreError>;

    async fn insert_page(&self, page: &SocialPageSource) -> Result<(), StoreError>;
    async fn page(&self, id: Uuid) -> Result<Option<SocialPageSource>, StoreError>;
    async fn list_pages(&self, status: Option<PageStatus>) -> Result<Vec<SocialPageSource>, StoreError>;
    async fn update_page(&self, page: &SocialPageSource) -> Result<(), StoreError>;
    /// Returns whether a page was removed. Events keep their (now dangling) page id.
    async fn delete_page(&self, id: Uuid) -> Result<bool, StoreError>;
}
