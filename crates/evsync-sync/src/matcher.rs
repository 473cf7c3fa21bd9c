//! Match decisions for canonical records against stored rows.
//!
//! Rules, strongest first: same external ref; for venues the same normalized
//! name within the proximity threshold; for events the same venue, normalized
//! title and local calendar day. Candidates are ordered by id so the decision
//! never depends on store iteration order.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use evsync_core::{normalize_key, CanonicalEvent, CanonicalVenue, ExternalRef};
use evsync_storage::Store;
use uuid::Uuid;

use crate::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    Existing(Uuid),
    New,
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    proximity_threshold_m: f64,
}

/// A candidate from the same source under a different native id is a different entity.
fn conflicting_external(record: Option<&ExternalRef>, candidate: Option<&ExternalRef>) -> bool {
    matches!((record, candidate), (Some(r), Some(c)) if r.source == c.source && r.id != c.id)
}

fn decide(what: &str, mut ids: Vec<Uuid>) -> Result<MatchDecision, RecordError> {
    ids.sort();
    ids.dedup();
    match ids.as_slice() {
        [] => Ok(MatchDecision::New),
        [id] => Ok(MatchDecision::Existing(*id)),
        many => Err(RecordError::MatchAmbiguity(format!(
            "{what} matches {} stored rows ({})",
            many.len(),
            many.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// UTC bounds `[start, end)` of the local calendar day containing `at`.
pub fn local_day_bounds(at: DateTime<Utc>, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = at.with_timezone(&offset).date_naive();
    let start = local_date
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(at);
    (start, start + Duration::days(1))
}

impl Matcher {
    pub fn new(proximity_threshold_m: f64) -> Self {
        Self {
            proximity_threshold_m,
        }
    }

    pub fn proximity_threshold_m(&self) -> f64 {
        self.proximity_threshold_m
    }

    pub async fn match_venue(
        &self,
        store: &dyn Store,
        venue: &CanonicalVenue,
    ) -> Result<MatchDecision, RecordError> {
        if let Some(external) = &venue.external {
            if let Some(hit) = store.venue_by_external_id(external).await? {
                return Ok(MatchDecision::Existing(hit.id));
            }
        }

        let candidates = store
            .venues_by_name_near(
                &normalize_key(&venue.name),
                venue.latitude,
                venue.longitude,
                self.proximity_threshold_m,
            )
            .await?;
        let ids = candidates
            .iter()
            .filter(|c| !conflicting_external(venue.external.as_ref(), c.external.as_ref()))
            .map(|c| c.id)
            .collect();
        decide(&format!("venue {:?}", venue.name), ids)
    }

    pub async fn match_event(
        &self,
        store: &dyn Store,
        event: &CanonicalEvent,
        venue_id: Uuid,
        offset: FixedOffset,
    ) -> Result<MatchDecision, RecordError> {
        if let Some(external) = &event.external {
            if let Some(hit) = store.event_by_external_id(external).await? {
                return Ok(MatchDecision::Existing(hit.id));
            }
        }

        let (from, to) = local_day_bounds(event.start_at, offset);
        let title_key = normalize_key(&event.title);
        let candidates = store.events_at_venue_between(venue_id, from, to).await?;
        let ids = candidates
            .iter()
            .filter(|c| normalize_key(&c.title) == title_key)
            .filter(|c| !conflicting_external(event.external.as_ref(), c.external.as_ref()))
            .map(|c| c.id)
            .collect();
        decide(&format!("event {:?}", event.title), ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsync_core::{Event, Venue};
    use evsync_storage::MemoryStore;

    fn stored_venue(name: &str, latitude: f64, longitude: f64, external: Option<ExternalRef>) -> Venue {
        let now = Utc::now();
        Venue {
            id: Uuid::new_v4(),
            slug: format!("{}-{}", evsync_core::slugify(name), Uuid::new_v4().simple()),
            name: name.into(),
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
            external,
            created_at: now,
            updated_at: now,
        }
    }

    fn candidate(name: &str, latitude: f64, longitude: f64, external: Option<ExternalRef>) -> CanonicalVenue {
        CanonicalVenue {
            name: name.into(),
            address: None,
            city: None,
            state: None,
            zip: None,
            country: None,
            latitude,
            longitude,
            capacity: None,
            website: None,
            social_page_id: None,
            external,
        }
    }

    fn pacific() -> FixedOffset {
        FixedOffset::west_opt(8 * 3600).unwrap()
    }

    #[tokio::test]
    async fn same_name_nearby_matches_but_far_away_does_not() {
        let store = MemoryStore::new();
        let croc = stored_venue("The Crocodile", 47.6139, -122.3444, None);
        store.insert_venue(&croc).await.unwrap();
        let matcher = Matcher::new(150.0);

        let near = candidate("the crocodile", 47.6140, -122.3445, None);
        assert_eq!(
            matcher.match_venue(&store, &near).await.unwrap(),
            MatchDecision::Existing(croc.id)
        );

        let chain_elsewhere = candidate("The Crocodile", 30.2672, -97.7431, None);
        assert_eq!(
            matcher.match_venue(&store, &chain_elsewhere).await.unwrap(),
            MatchDecision::New
        );
    }

    #[tokio::test]
    async fn external_ref_wins_over_name_and_distance() {
        let store = MemoryStore::new();
        let ext = ExternalRef::new("ticketing-a", "KovZ");
        let stored = stored_venue("Old Name", 47.0, -122.0, Some(ext.clone()));
        store.insert_venue(&stored).await.unwrap();

        let renamed = candidate("New Name", 47.5, -122.5, Some(ext));
        assert_eq!(
            Matcher::new(150.0).match_venue(&store, &renamed).await.unwrap(),
            MatchDecision::Existing(stored.id)
        );
    }

    #[tokio::test]
    async fn same_source_different_id_is_not_a_match() {
        let store = MemoryStore::new();
        let stored = stored_venue(
            "Neumos",
            47.6142,
            -122.3197,
            Some(ExternalRef::new("ticketing-a", "A1")),
        );
        store.insert_venue(&stored).await.unwrap();

        let other = candidate("Neumos", 47.6142, -122.3197, Some(ExternalRef::new("ticketing-a", "B2")));
        assert_eq!(
            Matcher::new(150.0).match_venue(&store, &other).await.unwrap(),
            MatchDecision::New
        );
        let other_source = candidate("Neumos", 47.6142, -122.3197, Some(ExternalRef::new("ticketing-b", "9")));
        assert_eq!(
            Matcher::new(150.0).match_venue(&store, &other_source).await.unwrap(),
            MatchDecision::Existing(stored.id)
        );
    }

    #[tokio::test]
    async fn two_equal_candidates_are_ambiguous() {
        let store = MemoryStore::new();
        store.insert_venue(&stored_venue("Twin", 47.6, -122.3, None)).await.unwrap();
        store.insert_venue(&stored_venue("Twin", 47.6001, -122.3, None)).await.unwrap();
        let err = Matcher::new(150.0)
            .match_venue(&store, &candidate("Twin", 47.60005, -122.3, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::MatchAmbiguity(_)));
    }

    #[tokio::test]
    async fn events_match_on_venue_title_and_local_day() {
        let store = MemoryStore::new();
        let venue = stored_venue("The Crocodile", 47.6139, -122.3444, None);
        store.insert_venue(&venue).await.unwrap();
        // 2026-05-01 20:00 local (-08:00)
        let start = Utc.with_ymd_and_hms(2026, 5, 2, 4, 0, 0).unwrap();
        let now = Utc::now();
        let stored = Event {
            id: Uuid::new_v4(),
            slug: "night-shift-2026-05-01".into(),
            title: "Night Shift!".into(),
            description: None,
            start_at: start,
            end_at: None,
            doors_at: None,
            venue_id: venue.id,
            category: "music".into(),
            image_url: None,
            is_free: false,
            tags: vec![],
            external: None,
            external_url: None,
            social_page_id: None,
            latitude: venue.latitude,
            longitude: venue.longitude,
            created_at: now,
            updated_at: now,
        };
        store.insert_event(&stored).await.unwrap();

        let mut incoming = CanonicalEvent {
            title: "night shift".into(),
            description: None,
            // Same local evening, later hour: still the same calendar day.
            start_at: start + Duration::hours(2),
            end_at: None,
            doors_at: None,
            venue: evsync_core::VenueRef::Linked(venue.id),
            category: "music".into(),
            image_url: None,
            is_free: false,
            tags: Default::default(),
            external: None,
            external_url: None,
            social_page_id: None,
        };
        let matcher = Matcher::new(150.0);
        assert_eq!(
            matcher.match_event(&store, &incoming, venue.id, pacific()).await.unwrap(),
            MatchDecision::Existing(stored.id)
        );

        incoming.start_at = start + Duration::days(1);
        assert_eq!(
            matcher.match_event(&store, &incoming, venue.id, pacific()).await.unwrap(),
            MatchDecision::New
        );
    }

    #[test]
    fn day_bounds_follow_the_local_calendar() {
        let at = Utc.with_ymd_and_hms(2026, 5, 2, 4, 0, 0).unwrap();
        let (from, to) = local_day_bounds(at, pacific());
        assert_eq!(from, Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2026, 5, 2, 8, 0, 0).unwrap());
    }
}
