//! Fill-or-refresh upserts of canonical records.
//!
//! Creates mint the id and slug. Updates refresh from the incoming record but
//! never blank a stored optional field, and rows whose content did not change are
//! left untouched (no write, no `updated_at` bump).

use chrono::{FixedOffset, Utc};
use evsync_core::taxonomy::FALLBACK_CATEGORY;
use evsync_core::{slugify, validate_coordinates, CanonicalEvent, CanonicalVenue, Event, Venue};
use evsync_storage::{Store, StoreError};
use tracing::debug;
use uuid::Uuid;

use crate::matcher::MatchDecision;
use crate::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub id: Uuid,
    pub action: WriteAction,
}

impl WriteOutcome {
    fn new(id: Uuid, action: WriteAction) -> Self {
        Self { id, action }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertWriter;

fn refresh<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        slot.clone_from(incoming);
    }
}

fn venue_slug(venue: &CanonicalVenue) -> String {
    let name = slugify(&venue.name);
    match venue.city.as_deref().map(slugify).filter(|c| !c.is_empty()) {
        Some(city) => format!("{name}-{city}"),
        None => name,
    }
}

fn event_slug(event: &CanonicalEvent, offset: FixedOffset) -> String {
    let date = event.start_at.with_timezone(&offset).date_naive();
    format!("{}-{}", slugify(&event.title), date.format("%Y-%m-%d"))
}

fn id_suffix(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn geo_error(err: evsync_core::GeoError) -> RecordError {
    RecordError::Validation(err.to_string())
}

impl UpsertWriter {
    pub fn new() -> Self {
        Self
    }

    pub async fn write_venue(
        &self,
        store: &dyn Store,
        venue: &CanonicalVenue,
        decision: MatchDecision,
    ) -> Result<WriteOutcome, RecordError> {
        validate_coordinates(venue.latitude, venue.longitude).map_err(geo_error)?;
        if venue.name.trim().is_empty() {
            return Err(RecordError::Validation("venue has no name".to_string()));
        }
        match decision {
            MatchDecision::New => self.create_venue(store, venue).await,
            MatchDecision::Existing(id) => self.update_venue(store, id, venue).await,
        }
    }

    async fn create_venue(
        &self,
        store: &dyn Store,
        venue: &CanonicalVenue,
    ) -> Result<WriteOutcome, RecordError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut row = Venue {
            id,
            slug: venue_slug(venue),
            name: venue.name.trim().to_string(),
            address: venue.address.clone(),
            city: venue.city.clone(),
            state: venue.state.clone(),
            zip: venue.zip.clone(),
            country: venue.country.clone(),
            latitude: venue.latitude,
            longitude: venue.longitude,
            capacity: venue.capacity,
            website: venue.website.clone(),
            social_page_id: venue.social_page_id,
            external: venue.external.clone(),
            created_at: now,
            updated_at: now,
        };
        match store.insert_venue(&row).await {
            Ok(()) => {}
            // Same name in the same city but a different building: disambiguate.
            Err(StoreError::Conflict { detail, .. }) if detail.contains("slug") => {
                row.slug = format!("{}-{}", row.slug, id_suffix(id));
                store.insert_venue(&row).await?;
            }
            Err(err) => return Err(err.into()),
        }
        debug!(venue = %row.slug, "created venue");
        Ok(WriteOutcome::new(id, WriteAction::Created))
    }

    async fn update_venue(
        &self,
        store: &dyn Store,
        id: Uuid,
        venue: &CanonicalVenue,
    ) -> Result<WriteOutcome, RecordError> {
        let stored = store
            .venue(id)
            .await?
            .ok_or(StoreError::NotFound { entity: "venue", id })?;
        let mut row = stored.clone();
        row.name = venue.name.trim().to_string();
        row.latitude = venue.latitude;
        row.longitude = venue.longitude;
        refresh(&mut row.address, &venue.address);
        refresh(&mut row.city, &venue.city);
        refresh(&mut row.state, &venue.state);
        refresh(&mut row.zip, &venue.zip);
        refresh(&mut row.country, &venue.country);
        refresh(&mut row.capacity, &venue.capacity);
        refresh(&mut row.website, &venue.website);
        refresh(&mut row.social_page_id, &venue.social_page_id);
        if row.external.is_none() {
            row.external.clone_from(&venue.external);
        }

        if row == stored {
            return Ok(WriteOutcome::new(id, WriteAction::Unchanged));
        }
        row.updated_at = Utc::now();
        store.update_venue(&row).await?;
        Ok(WriteOutcome::new(id, WriteAction::Updated))
    }

    pub async fn write_event(
        &self,
        store: &dyn Store,
        event: &CanonicalEvent,
        venue_id: Uuid,
        decision: MatchDecision,
        offset: FixedOffset,
    ) -> Result<WriteOutcome, RecordError> {
        if event.title.trim().is_empty() {
            return Err(RecordError::Validation("event has no title".to_string()));
        }
        let venue = store
            .venue(venue_id)
            .await?
            .ok_or_else(|| RecordError::Validation(format!("venue {venue_id} does not exist")))?;
        validate_coordinates(venue.latitude, venue.longitude).map_err(geo_error)?;

        match decision {
            MatchDecision::New => self.create_event(store, event, &venue, offset).await,
            MatchDecision::Existing(id) => self.update_event(store, id, event, &venue).await,
        }
    }

    async fn create_event(
        &self,
        store: &dyn Store,
        event: &CanonicalEvent,
        venue: &Venue,
        offset: FixedOffset,
    ) -> Result<WriteOutcome, RecordError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut row = Event {
            id,
            slug: event_slug(event, offset),
            title: event.title.trim().to_string(),
            description: event.description.clone(),
            start_at: event.start_at,
            end_at: event.end_at,
            doors_at: event.doors_at,
            venue_id: venue.id,
            category: event.category.clone(),
            image_url: event.image_url.clone(),
            is_free: event.is_free,
            tags: event.tags.iter().cloned().collect(),
            external: event.external.clone(),
            external_url: event.external_url.clone(),
            social_page_id: event.social_page_id,
            latitude: venue.latitude,
            longitude: venue.longitude,
            created_at: now,
            updated_at: now,
        };
        match store.insert_event(&row).await {
            Ok(()) => {}
            // Same title on the same day at another venue.
            Err(StoreError::Conflict { detail, .. }) if detail.contains("slug") => {
                row.slug = format!("{}-{}", row.slug, id_suffix(id));
                store.insert_event(&row).await?;
            }
            Err(err) => return Err(err.into()),
        }
        debug!(event = %row.slug, "created event");
        Ok(WriteOutcome::new(id, WriteAction::Created))
    }

    async fn update_event(
        &self,
        store: &dyn Store,
        id: Uuid,
        event: &CanonicalEvent,
        venue: &Venue,
    ) -> Result<WriteOutcome, RecordError> {
        let stored = store
            .event(id)
            .await?
            .ok_or(StoreError::NotFound { entity: "event", id })?;
        let mut row = stored.clone();
        row.title = event.title.trim().to_string();
        row.start_at = event.start_at;
        row.venue_id = venue.id;
        row.latitude = venue.latitude;
        row.longitude = venue.longitude;
        row.is_free = event.is_free;
        refresh(&mut row.description, &event.description);
        refresh(&mut row.end_at, &event.end_at);
        refresh(&mut row.doors_at, &event.doors_at);
        refresh(&mut row.image_url, &event.image_url);
        refresh(&mut row.external_url, &event.external_url);
        refresh(&mut row.social_page_id, &event.social_page_id);
        // Tags were normalized against the incoming category, so they move with it.
        let keeps_stored_category =
            event.category == FALLBACK_CATEGORY && stored.category != FALLBACK_CATEGORY;
        if !keeps_stored_category {
            let recategorized = row.category != event.category;
            row.category.clone_from(&event.category);
            if recategorized || !event.tags.is_empty() {
                row.tags = event.tags.iter().cloned().collect();
            }
        }
        if row.external.is_none() {
            row.external.clone_from(&event.external);
        }

        if row == stored {
            return Ok(WriteOutcome::new(id, WriteAction::Unchanged));
        }
        row.updated_at = Utc::now();
        store.update_event(&row).await?;
        Ok(WriteOutcome::new(id, WriteAction::Updated))
    }
}
