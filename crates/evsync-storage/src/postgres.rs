//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::{
    bounding_deltas, haversine_m, normalize_key, Event, ExternalRef, PageStatus,
    SocialPageSource, SyncRunLog, Venue,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::{Store, StoreError};

const VENUE_COLUMNS: &str = "id, slug, name, address, city, state, zip, country, latitude, longitude, \
     capacity, website, social_page_id, external_source, external_id, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, slug, title, description, start_at, end_at, doors_at, venue_id, \
     category, image_url, is_free, tags, external_source, external_id, external_url, social_page_id, \
     latitude, longitude, created_at, updated_at";

const PAGE_COLUMNS: &str = "id, url, external_page_id, display_name, metro_slug, venue_id, status, \
     consecutive_failures, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("running migrations: {e}")))
    }
}

fn external_from_row(row: &PgRow) -> Result<Option<ExternalRef>, sqlx::Error> {
    let source: Option<String> = row.try_get("external_source")?;
    let id: Option<String> = row.try_get("external_id")?;
    Ok(source.zip(id).map(|(source, id)| ExternalRef { source, id }))
}

fn venue_from_row(row: &PgRow) -> Result<Venue, sqlx::Error> {
    let capacity: Option<i32> = row.try_get("capacity")?;
    Ok(Venue {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zip: row.try_get("zip")?,
        country: row.try_get("country")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        capacity: capacity.and_then(|c| u32::try_from(c).ok()),
        website: row.try_get("website")?,
        social_page_id: row.try_get("social_page_id")?,
        external: external_from_row(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        doors_at: row.try_get("doors_at")?,
        venue_id: row.try_get("venue_id")?,
        category: row.try_get("category")?,
        image_url: row.try_get("image_url")?,
        is_free: row.try_get("is_free")?,
        tags: row.try_get("tags")?,
        external: external_from_row(row)?,
        external_url: row.try_get("external_url")?,
        social_page_id: row.try_get("social_page_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn page_from_row(row: &PgRow) -> Result<SocialPageSource, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let failures: i32 = row.try_get("consecutive_failures")?;
    Ok(SocialPageSource {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        external_page_id: row.try_get("external_page_id")?,
        display_name: row.try_get("display_name")?,
        metro_slug: row.try_get("metro_slug")?,
        venue_id: row.try_get("venue_id")?,
        status: status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        consecutive_failures: u32::try_from(failures).unwrap_or(0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_log_from_row(row: &PgRow) -> Result<SyncRunLog, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let errors: serde_json::Value = row.try_get("errors")?;
    let count = |name: &str| -> Result<u32, sqlx::Error> {
        let v: i32 = row.try_get(name)?;
        Ok(u32::try_from(v).unwrap_or(0))
    };
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(SyncRunLog {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        metro_slug: row.try_get("metro_slug")?,
        status: status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        events_created: count("events_created")?,
        events_updated: count("events_updated")?,
        venues_created: count("venues_created")?,
        errors: serde_json::from_value(errors).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn as_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for PgStore {
    async fn venue(&self, id: Uuid) -> Result<Option<Venue>, StoreError> {
        let row = sqlx::query(&format!("SELECT {VENUE_COLUMNS} FROM venues WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(venue_from_row).transpose()?)
    }

    async fn venue_by_external_id(&self, external: &ExternalRef) -> Result<Option<Venue>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VENUE_COLUMNS} FROM venues WHERE external_source = $1 AND external_id = $2"
        ))
        .bind(&external.source)
        .bind(&external.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(venue_from_row).transpose()?)
    }

    async fn venues_by_name_near(
        &self,
        name_key: &str,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    ) -> Result<Vec<Venue>, StoreError> {
        let (d_lat, d_lon) = bounding_deltas(latitude, radius_m);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {VENUE_COLUMNS}
              FROM venues
             WHERE name_key = $1
               AND latitude BETWEEN $2 AND $3
               AND longitude BETWEEN $4 AND $5
             ORDER BY created_at, id
            "#
        ))
        .bind(name_key)
        .bind(latitude - d_lat)
        .bind(latitude + d_lat)
        .bind(longitude - d_lon)
        .bind(longitude + d_lon)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let venue = venue_from_row(row)?;
            if haversine_m(latitude, longitude, venue.latitude, venue.longitude) <= radius_m {
                out.push(venue);
            }
        }
        Ok(out)
    }

    async fn insert_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO venues (id, slug, name, name_key, address, city, state, zip, country,
                                latitude, longitude, capacity, website, social_page_id,
                                external_source, external_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(venue.id)
        .bind(&venue.slug)
        .bind(&venue.name)
        .bind(normalize_key(&venue.name))
        .bind(&venue.address)
        .bind(&venue.city)
        .bind(&venue.state)
        .bind(&venue.zip)
        .bind(&venue.country)
        .bind(venue.latitude)
        .bind(venue.longitude)
        .bind(venue.capacity.map(as_i32))
        .bind(&venue.website)
        .bind(venue.social_page_id)
        .bind(venue.external.as_ref().map(|e| e.source.as_str()))
        .bind(venue.external.as_ref().map(|e| e.id.as_str()))
        .bind(venue.created_at)
        .bind(venue.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE venues
               SET name = $2, name_key = $3, address = $4, city = $5, state = $6, zip = $7,
                   country = $8, latitude = $9, longitude = $10, capacity = $11, website = $12,
                   social_page_id = $13, external_source = $14, external_id = $15, updated_at = $16
             WHERE id = $1
            "#,
        )
        .bind(venue.id)
        .bind(&venue.name)
        .bind(normalize_key(&venue.name))
        .bind(&venue.address)
        .bind(&venue.city)
        .bind(&venue.state)
        .bind(&venue.zip)
        .bind(&venue.country)
        .bind(venue.latitude)
        .bind(venue.longitude)
        .bind(venue.capacity.map(as_i32))
        .bind(&venue.website)
        .bind(venue.social_page_id)
        .bind(venue.external.as_ref().map(|e| e.source.as_str()))
        .bind(venue.external.as_ref().map(|e| e.id.as_str()))
        .bind(venue.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "venue",
                id: venue.id,
            });
        }
        Ok(())
    }

    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(event_from_row).transpose()?)
    }

    async fn event_by_external_id(&self, external: &ExternalRef) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE external_source = $1 AND external_id = $2"
        ))
        .bind(&external.source)
        .bind(&external.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(event_from_row).transpose()?)
    }

    async fn events_at_venue_between(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM events
             WHERE venue_id = $1 AND start_at >= $2 AND start_at < $3
             ORDER BY start_at, id
            "#
        ))
        .bind(venue_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events (id, slug, title, description, start_at, end_at, doors_at, venue_id,
                                category, image_url, is_free, tags, external_source, external_id,
                                external_url, social_page_id, latitude, longitude, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(event.id)
        .bind(&event.slug)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.doors_at)
        .bind(event.venue_id)
        .bind(&event.category)
        .bind(&event.image_url)
        .bind(event.is_free)
        .bind(&event.tags)
        .bind(event.external.as_ref().map(|e| e.source.as_str()))
        .bind(event.external.as_ref().map(|e| e.id.as_str()))
        .bind(&event.external_url)
        .bind(event.social_page_id)
        .bind(event.latitude)
        .bind(event.longitude)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_event(&self, event: &Event) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
               SET title = $2, description = $3, start_at = $4, end_at = $5, doors_at = $6,
                   venue_id = $7, category = $8, image_url = $9, is_free = $10, tags = $11,
                   external_source = $12, external_id = $13, external_url = $14,
                   social_page_id = $15, latitude = $16, longitude = $17, updated_at = $18
             WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.doors_at)
        .bind(event.venue_id)
        .bind(&event.category)
        .bind(&event.image_url)
        .bind(event.is_free)
        .bind(&event.tags)
        .bind(event.external.as_ref().map(|e| e.source.as_str()))
        .bind(event.external.as_ref().map(|e| e.id.as_str()))
        .bind(&event.external_url)
        .bind(event.social_page_id)
        .bind(event.latitude)
        .bind(event.longitude)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "event",
                id: event.id,
            });
        }
        Ok(())
    }

    async fn events_with_external_url(
        &self,
        sources: &[String],
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM events
             WHERE external_id IS NOT NULL AND external_url IS NOT NULL
               AND external_source = ANY($1)
             ORDER BY updated_at, id
             LIMIT $2
            "#
        ))
        .bind(sources)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    async fn append_run_log(&self, log: &SyncRunLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, source_name, metro_slug, status, events_created,
                                   events_updated, venues_created, errors, duration_ms,
                                   started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(log.id)
        .bind(&log.source_name)
        .bind(&log.metro_slug)
        .bind(log.status.as_str())
        .bind(as_i32(log.events_created))
        .bind(as_i32(log.events_updated))
        .bind(as_i32(log.venues_created))
        .bind(serde_json::json!(log.errors))
        .bind(i64::try_from(log.duration_ms).unwrap_or(i64::MAX))
        .bind(log.started_at)
        .bind(log.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_run_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_name, metro_slug, status, events_created, events_updated,
                   venues_created, errors, duration_ms, started_at, completed_at
              FROM sync_runs
             ORDER BY completed_at DESC, id
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(run_log_from_row).collect::<Result<_, _>>()?)
    }

    async fn insert_page(&self, page: &SocialPageSource) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO social_pages (id, url, external_page_id, display_name, metro_slug, venue_id,
                                      status, consecutive_failures, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(page.id)
        .bind(&page.url)
        .bind(&page.external_page_id)
        .bind(&page.display_name)
        .bind(&page.metro_slug)
        .bind(page.venue_id)
        .bind(page.status.as_str())
        .bind(as_i32(page.consecutive_failures))
        .bind(page.created_at)
        .bind(page.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn page(&self, id: Uuid) -> Result<Option<SocialPageSource>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAGE_COLUMNS} FROM social_pages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    async fn list_pages(&self, status: Option<PageStatus>) -> Result<Vec<SocialPageSource>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PAGE_COLUMNS}
              FROM social_pages
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at, id
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(page_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_page(&self, page: &SocialPageSource) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE social_pages
               SET external_page_id = $2, display_name = $3, metro_slug = $4, venue_id = $5,
                   status = $6, consecutive_failures = $7, updated_at = $8
             WHERE id = $1
            "#,
        )
        .bind(page.id)
        .bind(&page.external_page_id)
        .bind(&page.display_name)
        .bind(&page.metro_slug)
        .bind(page.venue_id)
        .bind(page.status.as_str())
        .bind(as_i32(page.consecutive_failures))
        .bind(page.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "social_page",
                id: page.id,
            });
        }
        Ok(())
    }

    async fn delete_page(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM social_pages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
