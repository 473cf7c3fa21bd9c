//! Social page registration and status transitions.
//!
//! ```text
//! pending_review --first successful scrape / activate--> active
//! active --pause--> paused --activate--> active
//! active --terminal error / N consecutive failures / mark_failed--> failed
//! failed --activate--> active
//! ```
//!
//! Requesting the state a page is already in is a no-op and leaves `updated_at` alone.

use std::sync::Arc;

use chrono::Utc;
use evsync_core::{PageStatus, SocialPageSource};
use evsync_storage::{Store, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("social page {0} not found")]
    NotFound(Uuid),
    #[error("cannot {action} a page in state {from}")]
    InvalidTransition {
        from: PageStatus,
        action: &'static str,
    },
    #[error("invalid page: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operator input for a new page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPage {
    pub url: String,
    pub display_name: String,
    pub metro_slug: String,
    pub venue_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn Store>,
    failure_threshold: u32,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn Store>, failure_threshold: u32) -> Self {
        Self {
            store,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub async fn register_page(&self, new: NewPage) -> Result<SocialPageSource, LifecycleError> {
        let url = new.url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(LifecycleError::Invalid(format!("page url {url:?} is not http(s)")));
        }
        if new.metro_slug.trim().is_empty() {
            return Err(LifecycleError::Invalid("page needs a metro".to_string()));
        }
        if let Some(venue_id) = new.venue_id {
            if self.store.venue(venue_id).await?.is_none() {
                return Err(LifecycleError::Invalid(format!("venue {venue_id} does not exist")));
            }
        }
        let now = Utc::now();
        let display_name = match new.display_name.trim() {
            "" => url.to_string(),
            name => name.to_string(),
        };
        let page = SocialPageSource {
            id: Uuid::new_v4(),
            url: url.to_string(),
            external_page_id: None,
            display_name,
            metro_slug: new.metro_slug.trim().to_string(),
            venue_id: new.venue_id,
            status: PageStatus::PendingReview,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_page(&page).await?;
        info!(page = %page.id, url = %page.url, "registered social page");
        Ok(page)
    }

    pub async fn page(&self, id: Uuid) -> Result<SocialPageSource, LifecycleError> {
        self.store.page(id).await?.ok_or(LifecycleError::NotFound(id))
    }

    pub async fn list_pages(
        &self,
        status: Option<PageStatus>,
    ) -> Result<Vec<SocialPageSource>, LifecycleError> {
        Ok(self.store.list_pages(status).await?)
    }

    async fn save(&self, mut page: SocialPageSource) -> Result<SocialPageSource, LifecycleError> {
        page.updated_at = Utc::now();
        self.store.update_page(&page).await?;
        Ok(page)
    }

    pub async fn activate(&self, id: Uuid) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        if page.status == PageStatus::Active {
            return Ok(page);
        }
        page.status = PageStatus::Active;
        page.consecutive_failures = 0;
        self.save(page).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        match page.status {
            PageStatus::Paused => Ok(page),
            PageStatus::Active => {
                page.status = PageStatus::Paused;
                self.save(page).await
            }
            from => Err(LifecycleError::InvalidTransition {
                from,
                action: "pause",
            }),
        }
    }

    pub async fn mark_failed(&self, id: Uuid) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        match page.status {
            PageStatus::Failed => Ok(page),
            PageStatus::Active => {
                page.status = PageStatus::Failed;
                self.save(page).await
            }
            from => Err(LifecycleError::InvalidTransition {
                from,
                action: "mark failed",
            }),
        }
    }

    /// A scrape produced a usable result: promote pending pages and clear the failure streak.
    pub async fn record_scrape_success(&self, id: Uuid) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        let promoted = page.status == PageStatus::PendingReview;
        if !promoted && page.consecutive_failures == 0 {
            return Ok(page);
        }
        if promoted {
            page.status = PageStatus::Active;
            info!(page = %page.id, "social page promoted to active");
        }
        page.consecutive_failures = 0;
        self.save(page).await
    }

    /// Count a failed scrape. Active pages are demoted once the failure is
    /// terminal or the streak reaches the threshold; pending pages only accumulate.
    pub async fn record_scrape_failure(
        &self,
        id: Uuid,
        terminal: bool,
    ) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        page.consecutive_failures = page.consecutive_failures.saturating_add(1);
        if page.status == PageStatus::Active
            && (terminal || page.consecutive_failures >= self.failure_threshold)
        {
            page.status = PageStatus::Failed;
            warn!(
                page = %page.id,
                failures = page.consecutive_failures,
                terminal,
                "social page demoted to failed"
            );
        }
        self.save(page).await
    }

    /// Store the platform page id the first time a scrape discovers it.
    pub async fn resolve_page_id(
        &self,
        id: Uuid,
        external_page_id: &str,
    ) -> Result<SocialPageSource, LifecycleError> {
        let mut page = self.page(id).await?;
        if page.external_page_id.as_deref() == Some(external_page_id) {
            return Ok(page);
        }
        page.external_page_id = Some(external_page_id.to_string());
        self.save(page).await
    }

    /// Events keep the page id they were scraped under; nothing cascades.
    pub async fn delete_page(&self, id: Uuid) -> Result<(), LifecycleError> {
        if self.store.delete_page(id).await? {
            info!(page = %id, "deleted social page");
            Ok(())
        } else {
            Err(LifecycleError::NotFound(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsync_storage::MemoryStore;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Arc::new(MemoryStore::new()), 3)
    }

    fn new_page(url: &str) -> NewPage {
        NewPage {
            url: url.into(),
            display_name: "The Crocodile".into(),
            metro_slug: "seattle".into(),
            venue_id: None,
        }
    }

    #[tokio::test]
    async fn pages_start_pending_and_promote_on_first_success() {
        let lifecycle = manager();
        let page = lifecycle
            .register_page(new_page("https://social.example/thecrocodile"))
            .await
            .unwrap();
        assert_eq!(page.status, PageStatus::PendingReview);

        let page = lifecycle.record_scrape_success(page.id).await.unwrap();
        assert_eq!(page.status, PageStatus::Active);
        assert_eq!(page.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn pausing_a_paused_page_is_a_noop() {
        let lifecycle = manager();
        let page = lifecycle.register_page(new_page("https://social.example/a")).await.unwrap();
        lifecycle.activate(page.id).await.unwrap();
        let paused = lifecycle.pause(page.id).await.unwrap();
        assert_eq!(paused.status, PageStatus::Paused);

        let again = lifecycle.pause(page.id).await.unwrap();
        assert_eq!(again.status, PageStatus::Paused);
        assert_eq!(again.updated_at, paused.updated_at);
    }

    #[tokio::test]
    async fn pausing_a_pending_page_is_rejected() {
        let lifecycle = manager();
        let page = lifecycle.register_page(new_page("https://social.example/b")).await.unwrap();
        let err = lifecycle.pause(page.id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: PageStatus::PendingReview,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn active_pages_fail_after_threshold_or_terminal_error() {
        let lifecycle = manager();
        let page = lifecycle.register_page(new_page("https://social.example/c")).await.unwrap();
        lifecycle.activate(page.id).await.unwrap();
        lifecycle.record_scrape_failure(page.id, false).await.unwrap();
        let page2 = lifecycle.record_scrape_failure(page.id, false).await.unwrap();
        assert_eq!(page2.status, PageStatus::Active);
        let page3 = lifecycle.record_scrape_failure(page.id, false).await.unwrap();
        assert_eq!(page3.status, PageStatus::Failed);
        assert_eq!(page3.consecutive_failures, 3);

        let other = lifecycle.register_page(new_page("https://social.example/d")).await.unwrap();
        lifecycle.activate(other.id).await.unwrap();
        let gone = lifecycle.record_scrape_failure(other.id, true).await.unwrap();
        assert_eq!(gone.status, PageStatus::Failed);

        let revived = lifecycle.activate(other.id).await.unwrap();
        assert_eq!(revived.status, PageStatus::Active);
        assert_eq!(revived.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn pending_pages_accumulate_failures_without_demotion() {
        let lifecycle = manager();
        let page = lifecycle.register_page(new_page("https://social.example/e")).await.unwrap();
        for _ in 0..5 {
            lifecycle.record_scrape_failure(page.id, true).await.unwrap();
        }
        let page = lifecycle.page(page.id).await.unwrap();
        assert_eq!(page.status, PageStatus::PendingReview);
        assert_eq!(page.consecutive_failures, 5);
    }

    #[tokio::test]
    async fn registration_validates_input() {
        let lifecycle = manager();
        assert!(matches!(
            lifecycle.register_page(new_page("ftp://social.example/x")).await,
            Err(LifecycleError::Invalid(_))
        ));
        let with_missing_venue = NewPage {
            venue_id: Some(Uuid::new_v4()),
            ..new_page("https://social.example/y")
        };
        assert!(matches!(
            lifecycle.register_page(with_missing_venue).await,
            Err(LifecycleError::Invalid(_))
        ));
        lifecycle.register_page(new_page("https://social.example/z")).await.unwrap();
        assert!(matches!(
            lifecycle.register_page(new_page("https://social.example/z")).await,
            Err(LifecycleError::Store(StoreError::Conflict { .. }))
        ));
    }

    #[tokio::test]
    async fn delete_and_lookup_missing_pages() {
        let lifecycle = manager();
        let page = lifecycle.register_page(new_page("https://social.example/f")).await.unwrap();
        lifecycle.resolve_page_id(page.id, "1234567").await.unwrap();
        assert_eq!(
            lifecycle.page(page.id).await.unwrap().external_page_id.as_deref(),
            Some("1234567")
        );
        lifecycle.delete_page(page.id).await.unwrap();
        assert!(matches!(
            lifecycle.delete_page(page.id).await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(matches!(lifecycle.activate(page.id).await, Err(LifecycleError::NotFound(_))));
    }
}
