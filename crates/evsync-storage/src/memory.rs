//! In-process store used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::{
    haversine_m, normalize_key, Event, ExternalRef, PageStatus, SocialPageSource, SyncRunLog,
    Venue,
};
use uuid::Uuid;

use crate::{Store, StoreError};

type WriteFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    venues: BTreeMap<Uuid, Venue>,
    events: BTreeMap<Uuid, Event>,
    pages: BTreeMap<Uuid, SocialPageSource>,
    run_logs: Vec<SyncRunLog>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reject_slugs: Option<WriteFilter>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject event/venue inserts whose slug matches, to exercise write failures.
    pub fn rejecting_slugs(filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::default(),
            reject_slugs: Some(Box::new(filter)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn check_slug(&self, slug: &str) -> Result<(), StoreError> {
        match &self.reject_slugs {
            Some(filter) if filter(slug) => Err(StoreError::Rejected(format!("slug {slug}"))),
            _ => Ok(()),
        }
    }

    pub fn venues(&self) -> Vec<Venue> {
        self.lock()
            .map(|s| s.venues.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock()
            .map(|s| s.events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn run_logs(&self) -> Vec<SyncRunLog> {
        self.lock().map(|s| s.run_logs.clone()).unwrap_or_default()
    }
}

fn external_taken<'a, I>(rows: I, id: Uuid, external: Option<&ExternalRef>) -> bool
where
    I: Iterator<Item = (Uuid, Option<&'a ExternalRef>)>,
{
    let Some(external) = external else {
        return false;
    };
    rows.filter(|(row_id, _)| *row_id != id)
        .any(|(_, row_ext)| row_ext == Some(external))
}

#[async_trait]
impl Store for MemoryStore {
    async fn venue(&self, id: Uuid) -> Result<Option<Venue>, StoreError> {
        Ok(self.lock()?.venues.get(&id).cloned())
    }

    async fn venue_by_external_id(&self, external: &ExternalRef) -> Result<Option<Venue>, StoreError> {
        Ok(self
            .lock()?
            .venues
            .values()
            .find(|v| v.external.as_ref() == Some(external))
            .cloned())
    }

    async fn venues_by_name_near(
        &self,
        name_key: &str,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    ) -> Result<Vec<Venue>, StoreError> {
        Ok(self
            .lock()?
            .venues
            .values()
            .filter(|v| normalize_key(&v.name) == name_key)
            .filter(|v| haversine_m(latitude, longitude, v.latitude, v.longitude) <= radius_m)
            .cloned()
            .collect())
    }

    async fn insert_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        self.check_slug(&venue.slug)?;
        let mut state = self.lock()?;
        if state.venues.contains_key(&venue.id) {
            return Err(StoreError::Conflict {
                entity: "venue",
                detail: format!("id {}", venue.id),
            });
        }
        if state.venues.values().any(|v| v.slug == venue.slug) {
            return Err(StoreError::Conflict {
                entity: "venue",
                detail: format!("slug {}", venue.slug),
            });
        }
        let rows = state.venues.values().map(|v| (v.id, v.external.as_ref()));
        if external_taken(rows, venue.id, venue.external.as_ref()) {
            return Err(StoreError::Conflict {
                entity: "venue",
                detail: "external id already stored".to_string(),
            });
        }
        state.venues.insert(venue.id, venue.clone());
        Ok(())
    }

    async fn update_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let rows = state.venues.values().map(|v| (v.id, v.external.as_ref()));
        if external_taken(rows, venue.id, venue.external.as_ref()) {
            return Err(StoreError::Conflict {
                entity: "venue",
                detail: "external id already stored".to_string(),
            });
        }
        match state.venues.get_mut(&venue.id) {
            Some(slot) => {
                *slot = venue.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "venue",
                id: venue.id,
            }),
        }
    }

    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.lock()?.events.get(&id).cloned())
    }

    async fn event_by_external_id(&self, external: &ExternalRef) -> Result<Option<Event>, StoreError> {
        Ok(self
            .lock()?
            .events
            .values()
            .find(|e| e.external.as_ref() == Some(external))
            .cloned())
    }

    async fn events_at_venue_between(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .lock()?
            .events
            .values()
            .filter(|e| e.venue_id == venue_id && e.start_at >= from && e.start_at < to)
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.check_slug(&event.slug)?;
        let mut state = self.lock()?;
        if !state.venues.contains_key(&event.venue_id) {
            return Err(StoreError::Rejected(format!(
                "event {} references missing venue {}",
                event.slug, event.venue_id
            )));
        }
        if state.events.contains_key(&event.id) || state.events.values().any(|e| e.slug == event.slug) {
            return Err(StoreError::Conflict {
                entity: "event",
                detail: format!("slug {}", event.slug),
            });
        }
        let rows = state.events.values().map(|e| (e.id, e.external.as_ref()));
        if external_taken(rows, event.id, event.external.as_ref()) {
            return Err(StoreError::Conflict {
                entity: "event",
                detail: "external id already stored".to_string(),
            });
        }
        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn update_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.venues.contains_key(&event.venue_id) {
            return Err(StoreError::Rejected(format!(
                "event {} references missing venue {}",
                event.slug, event.venue_id
            )));
        }
        match state.events.get_mut(&event.id) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "event",
                id: event.id,
            }),
        }
    }

    async fn events_with_external_url(
        &self,
        sources: &[String],
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = self
            .lock()?
            .events
            .values()
            .filter(|e| e.external_url.is_some())
            .filter(|e| e.external.as_ref().is_some_and(|ext| sources.contains(&ext.source)))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn append_run_log(&self, log: &SyncRunLog) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.run_logs.iter().any(|l| l.id == log.id) {
            return Err(StoreError::Conflict {
                entity: "sync_run",
                detail: format!("run {} already logged", log.id),
            });
        }
        state.run_logs.push(log.clone());
        Ok(())
    }

    async fn list_run_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>, StoreError> {
        let state = self.lock()?;
        Ok(state.run_logs.iter().rev().take(limit).cloned().collect())
    }

    async fn insert_page(&self, page: &SocialPageSource) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.pages.values().any(|p| p.id == page.id || p.url == page.url) {
            return Err(StoreError::Conflict {
                entity: "social_page",
                detail: format!("url {}", page.url),
            });
        }
        state.pages.insert(page.id, page.clone());
        Ok(())
    }

    async fn page(&self, id: Uuid) -> Result<Option<SocialPageSource>, StoreError> {
        Ok(self.lock()?.pages.get(&id).cloned())
    }

    async fn list_pages(&self, status: Option<PageStatus>) -> Result<Vec<SocialPageSource>, StoreError> {
        let mut pages: Vec<SocialPageSource> = self
            .lock()?
            .pages
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        pages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pages)
    }

    async fn update_page(&self, page: &SocialPageSource) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.pages.get_mut(&page.id) {
            Some(slot) => {
                *slot = page.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "social_page",
                id: page.id,
            }),
        }
    }

    async fn delete_page(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.pages.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(name: &str, latitude: f64, longitude: f64) -> Venue {
        let now = Utc::now();
        Venue {
            id: Uuid::new_v4(),
            slug: evsync_core::slugify(name),
            name: name.to_string(),
            address: None,
            city: Some("Seattle".into()),
            state: Some("WA".into()),
            zip: None,
            country: None,
            latitude,
            longitude,
            capacity: None,
            website: None,
            social_page_id: None,
            external: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn name_proximity_lookup_respects_radius() {
        let store = MemoryStore::new();
        store
            .insert_venue(&venue("The Crocodile", 47.6139, -122.3444))
            .await
            .unwrap();

        let near = store
            .venues_by_name_near("the crocodile", 47.6140, -122.3445, 150.0)
            .await
            .unwrap();
        assert_eq!(near.len(), 1);

        let far = store
            .venues_by_name_near("the crocodile", 30.2672, -97.7431, 150.0)
            .await
            .unwrap();
        assert!(far.is_empty());
    }

    #[tokio::test]
    async fn duplicate_slug_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_venue(&venue("Neumos", 47.61, -122.32)).await.unwrap();
        let err = store
            .insert_venue(&venue("Neumos", 45.0, -100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn run_logs_are_listed_newest_first() {
        let store = MemoryStore::new();
        for metro in ["seattle", "austin"] {
            let now = Utc::now();
            store
                .append_run_log(&SyncRunLog {
                    id: Uuid::new_v4(),
                    source_name: "event-sync".into(),
                    metro_slug: metro.into(),
                    status: evsync_core::RunStatus::Success,
                    events_created: 0,
                    events_updated: 0,
                    venues_created: 0,
                    errors: vec![],
                    duration_ms: 1,
                    started_at: now,
                    completed_at: now,
                })
                .await
                .unwrap();
        }
        let logs = store.list_run_logs(10).await.unwrap();
        assert_eq!(logs[0].metro_slug, "austin");
        assert_eq!(logs[1].metro_slug, "seattle");
    }

    fn event(venue: &Venue, source: &str, external_id: &str) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            slug: format!("{source}-{external_id}"),
            title: external_id.to_string(),
            description: None,
            start_at: now,
            end_at: None,
            doors_at: None,
            venue_id: venue.id,
            category: "music".into(),
            image_url: None,
            is_free: false,
            tags: vec![],
            external: Some(ExternalRef::new(source, external_id)),
            external_url: Some(format!("https://{source}.example/{external_id}")),
            social_page_id: None,
            latitude: venue.latitude,
            longitude: venue.longitude,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn link_candidates_filter_by_source_before_the_limit() {
        let store = MemoryStore::new();
        let croc = venue("The Crocodile", 47.6139, -122.3444);
        store.insert_venue(&croc).await.unwrap();
        for id in ["E1", "E2"] {
            store.insert_event(&event(&croc, "tm", id)).await.unwrap();
        }
        store.insert_event(&event(&croc, "social", "S1")).await.unwrap();

        let checkable = vec!["social".to_string()];
        let events = store.events_with_external_url(&checkable, 2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "S1");
        assert!(store.events_with_external_url(&[], 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejecting_store_refuses_matching_slugs() {
        let store = MemoryStore::rejecting_slugs(|slug| slug.starts_with("bad"));
        let err = store
            .insert_venue(&venue("Bad Venue", 47.0, -122.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.venues().is_empty());
    }
}
