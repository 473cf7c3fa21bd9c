//! Raw source payloads into canonical events and venues.
//!
//! Every function here is pure: the same record and metro offset always produce
//! the same canonical record or the same rejection.

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use evsync_core::{
    validate_coordinates, CanonicalEvent, CanonicalRecord, CanonicalVenue, ExternalRef,
    RawRecord, SourceKind, Taxonomy, VenueRef,
};
use serde_json::Value as JsonValue;

use crate::RecordError;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub struct Normalizer {
    taxonomy: Taxonomy,
}

fn invalid(msg: impl Into<String>) -> RecordError {
    RecordError::Validation(msg.into())
}

/// Instants with an offset are taken as-is; naive local times are read in `offset`.
/// A bare date means local midnight.
pub fn parse_datetime(input: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn text(value: Option<&JsonValue>) -> Option<String> {
    let s = match value? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn ptr_text(value: &JsonValue, pointer: &str) -> Option<String> {
    text(value.pointer(pointer))
}

/// Coordinates arrive as numbers or numeric strings depending on the source.
fn number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Positive whole counts only; fractional, negative or oversized values are dropped.
fn whole_count(value: Option<&JsonValue>) -> Option<u32> {
    let n = number(value)?;
    if n <= 0.0 || n.fract() != 0.0 {
        return None;
    }
    u32::try_from(n as u64).ok()
}

fn required_title(value: Option<String>) -> Result<String, RecordError> {
    value.ok_or_else(|| invalid("missing title"))
}

fn checked_point(latitude: Option<f64>, longitude: Option<f64>, what: &str) -> Result<(f64, f64), RecordError> {
    let (Some(lat), Some(lon)) = (latitude, longitude) else {
        return Err(invalid(format!("{what} has no coordinates")));
    };
    validate_coordinates(lat, lon).map_err(|e| invalid(format!("{what}: {e}")))?;
    Ok((lat, lon))
}

/// Split "street, city, ST 98101, country" into its parts, best effort.
fn split_address(formatted: &str) -> (Option<String>, Option<String>, Option<String>, Option<String>, Option<String>) {
    let parts: Vec<&str> = formatted.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    let owned = |s: &str| Some(s.to_string());
    match parts.len() {
        0 => (None, None, None, None, None),
        1 | 2 => (owned(formatted.trim()), None, None, None, None),
        n => {
            let (street, rest) = if n >= 4 {
                (parts[..n - 3].join(", "), &parts[n - 3..])
            } else {
                (parts[0].to_string(), &parts[1..])
            };
            let mut region = rest[1].split_whitespace();
            let state = region.next().map(str::to_string);
            let zip = region.next().map(str::to_string);
            let country = rest.get(2).map(|c| c.to_string());
            (Some(street), owned(rest[0]), state, zip, country)
        }
    }
}

/// Labels split on the separators sources use inside one label ("Hip-Hop/Rap", "Arts & Theatre").
fn label_parts(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .flat_map(|l| {
            std::iter::once(l.clone()).chain(
                l.split(['/', '&', ','])
                    .map(str::trim)
                    .filter(|p| !p.is_empty() && *p != l.as_str())
                    .map(str::to_string),
            )
        })
        .collect()
}

fn mentions_free(labels: &[String]) -> bool {
    labels
        .iter()
        .any(|l| evsync_core::normalize_key(l).split(' ').any(|w| w == "free"))
}

impl Normalizer {
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self { taxonomy }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn normalize(&self, raw: &RawRecord, offset: FixedOffset) -> Result<CanonicalRecord, RecordError> {
        match raw.kind {
            SourceKind::Ticketmaster => self.ticketmaster_event(raw, offset).map(CanonicalRecord::Event),
            SourceKind::Seatgeek => self.seatgeek_event(raw, offset).map(CanonicalRecord::Event),
            SourceKind::SocialPage | SourceKind::VenueWebsite => {
                self.schema_org_event(raw, offset).map(CanonicalRecord::Event)
            }
            SourceKind::GooglePlaces => place_venue(raw).map(CanonicalRecord::Venue),
        }
    }

    /// Category from the most specific label first, then tags of that category only.
    fn classify(&self, labels: &[String], extra_tags: &[String]) -> (String, BTreeSet<String>) {
        let category = self.taxonomy.infer_category(labels.iter().map(String::as_str));
        let candidates = label_parts(labels)
            .into_iter()
            .chain(label_parts(extra_tags))
            .collect::<Vec<_>>();
        let tags = self
            .taxonomy
            .normalize_tags(&category, candidates.iter().map(String::as_str));
        (category, tags)
    }

    fn ticketmaster_event(&self, raw: &RawRecord, offset: FixedOffset) -> Result<CanonicalEvent, RecordError> {
        let p = &raw.payload;
        let title = required_title(ptr_text(p, "/name"))?;
        let start_at = ptr_text(p, "/dates/start/dateTime")
            .and_then(|s| parse_datetime(&s, offset))
            .or_else(|| {
                let date = ptr_text(p, "/dates/start/localDate")?;
                let local = match ptr_text(p, "/dates/start/localTime") {
                    Some(time) => format!("{date}T{time}"),
                    None => date,
                };
                parse_datetime(&local, offset)
            })
            .ok_or_else(|| invalid(format!("{title}: missing start time")))?;

        // Most specific first: sub-genre, genre, segment.
        let classification = p.pointer("/classifications/0");
        let labels: Vec<String> = ["/subGenre/name", "/genre/name", "/segment/name"]
            .iter()
            .filter_map(|ptr| classification.and_then(|c| ptr_text(c, ptr)))
            .filter(|l| !l.eq_ignore_ascii_case("undefined"))
            .collect();
        let (category, tags) = self.classify(&labels, &[]);

        let image_url = p
            .get("images")
            .and_then(JsonValue::as_array)
            .and_then(|images| {
                images
                    .iter()
                    .max_by_key(|i| i.get("width").and_then(JsonValue::as_u64).unwrap_or(0))
            })
            .and_then(|i| ptr_text(i, "/url"));
        let min_price = p
            .get("priceRanges")
            .and_then(JsonValue::as_array)
            .and_then(|ranges| {
                ranges
                    .iter()
                    .filter_map(|r| number(r.get("min")))
                    .reduce(f64::min)
            });

        let venue = match raw.venue_id {
            Some(id) => VenueRef::Linked(id),
            None => {
                let v = p
                    .pointer("/_embedded/venues/0")
                    .ok_or_else(|| invalid(format!("{title}: missing venue")))?;
                let name = ptr_text(v, "/name").ok_or_else(|| invalid(format!("{title}: venue has no name")))?;
                let (latitude, longitude) = checked_point(
                    number(v.pointer("/location/latitude")),
                    number(v.pointer("/location/longitude")),
                    &format!("venue {name}"),
                )?;
                VenueRef::Candidate(CanonicalVenue {
                    address: ptr_text(v, "/address/line1"),
                    city: ptr_text(v, "/city/name"),
                    state: ptr_text(v, "/state/stateCode"),
                    zip: ptr_text(v, "/postalCode"),
                    country: ptr_text(v, "/country/countryCode"),
                    latitude,
                    longitude,
                    capacity: None,
                    website: ptr_text(v, "/url"),
                    social_page_id: None,
                    external: ptr_text(v, "/id").map(|id| ExternalRef::new(&raw.source, id)),
                    name,
                })
            }
        };

        Ok(CanonicalEvent {
            description: ptr_text(p, "/description")
                .or_else(|| ptr_text(p, "/info"))
                .or_else(|| ptr_text(p, "/pleaseNote")),
            start_at,
            end_at: ptr_text(p, "/dates/end/dateTime").and_then(|s| parse_datetime(&s, offset)),
            doors_at: ptr_text(p, "/doorsTimes/dateTime").and_then(|s| parse_datetime(&s, offset)),
            venue,
            category,
            image_url,
            is_free: min_price == Some(0.0) || mentions_free(&labels),
            tags,
            external: ptr_text(p, "/id").map(|id| ExternalRef::new(&raw.source, id)),
            external_url: ptr_text(p, "/url"),
            social_page_id: raw.page_id,
            title,
        })
    }

    fn seatgeek_event(&self, raw: &RawRecord, offset: FixedOffset) -> Result<CanonicalEvent, RecordError> {
        let p = &raw.payload;
        let title = required_title(ptr_text(p, "/title").or_else(|| ptr_text(p, "/short_title")))?;
        let start_at = ptr_text(p, "/datetime_utc")
            .and_then(|s| parse_datetime(&s, Utc.fix()))
            .or_else(|| ptr_text(p, "/datetime_local").and_then(|s| parse_datetime(&s, offset)))
            .ok_or_else(|| invalid(format!("{title}: missing start time")))?;

        let mut labels: Vec<String> = p
            .get("taxonomies")
            .and_then(JsonValue::as_array)
            .map(|ts| ts.iter().rev().filter_map(|t| ptr_text(t, "/name")).collect())
            .unwrap_or_default();
        labels.extend(ptr_text(p, "/type"));
        let genres: Vec<String> = p
            .get("performers")
            .and_then(JsonValue::as_array)
            .map(|ps| {
                ps.iter()
                    .flat_map(|perf| perf.get("genres").and_then(JsonValue::as_array).cloned().unwrap_or_default())
                    .filter_map(|g| ptr_text(&g, "/name"))
                    .collect()
            })
            .unwrap_or_default();
        let (category, tags) = self.classify(&labels, &genres);

        let venue = match raw.venue_id {
            Some(id) => VenueRef::Linked(id),
            None => {
                let v = p.get("venue").ok_or_else(|| invalid(format!("{title}: missing venue")))?;
                let name = ptr_text(v, "/name").ok_or_else(|| invalid(format!("{title}: venue has no name")))?;
                let (latitude, longitude) = checked_point(
                    number(v.pointer("/location/lat")),
                    number(v.pointer("/location/lon")),
                    &format!("venue {name}"),
                )?;
                VenueRef::Candidate(CanonicalVenue {
                    address: ptr_text(v, "/address"),
                    city: ptr_text(v, "/city"),
                    state: ptr_text(v, "/state"),
                    zip: ptr_text(v, "/postal_code"),
                    country: ptr_text(v, "/country"),
                    latitude,
                    longitude,
                    capacity: v
                        .get("capacity")
                        .and_then(JsonValue::as_u64)
                        .filter(|c| *c > 0)
                        .and_then(|c| u32::try_from(c).ok()),
                    website: None,
                    social_page_id: None,
                    external: ptr_text(v, "/id").map(|id| ExternalRef::new(&raw.source, id)),
                    name,
                })
            }
        };

        Ok(CanonicalEvent {
            description: ptr_text(p, "/description"),
            start_at,
            end_at: None,
            doors_at: None,
            venue,
            category,
            image_url: ptr_text(p, "/performers/0/image"),
            is_free: number(p.pointer("/stats/lowest_price")) == Some(0.0) || mentions_free(&labels),
            tags,
            external: ptr_text(p, "/id").map(|id| ExternalRef::new(&raw.source, id)),
            external_url: ptr_text(p, "/url"),
            social_page_id: raw.page_id,
            title,
        })
    }

    fn schema_org_event(&self, raw: &RawRecord, offset: FixedOffset) -> Result<CanonicalEvent, RecordError> {
        let p = &raw.payload;
        let title = required_title(ptr_text(p, "/name"))?;
        let start_at = ptr_text(p, "/startDate")
            .and_then(|s| parse_datetime(&s, offset))
            .ok_or_else(|| invalid(format!("{title}: missing start time")))?;

        let mut labels: Vec<String> = match p.get("@type") {
            Some(JsonValue::Array(types)) => types.iter().filter_map(|t| text(Some(t))).collect(),
            other => text(other).into_iter().collect(),
        };
        let keywords: Vec<String> = match p.get("keywords") {
            Some(JsonValue::Array(ks)) => ks.iter().filter_map(|k| text(Some(k))).collect(),
            Some(JsonValue::String(s)) => s.split(',').map(str::trim).filter(|k| !k.is_empty()).map(str::to_string).collect(),
            _ => Vec::new(),
        };
        // A bare `Event` type says nothing; keywords then drive the category.
        labels.retain(|l| l != "Event");
        labels.extend(keywords.iter().cloned());
        let (category, tags) = self.classify(&labels, &keywords);

        let image_url = match p.get("image") {
            Some(JsonValue::Array(images)) => images.first().and_then(|i| text(Some(i)).or_else(|| ptr_text(i, "/url"))),
            Some(JsonValue::Object(_)) => ptr_text(p, "/image/url"),
            other => text(other),
        };
        let offers: Vec<&JsonValue> = match p.get("offers") {
            Some(JsonValue::Array(items)) => items.iter().collect(),
            Some(o @ JsonValue::Object(_)) => vec![o],
            _ => Vec::new(),
        };
        let zero_price = offers
            .iter()
            .any(|o| number(o.get("price")).or_else(|| number(o.get("lowPrice"))) == Some(0.0));
        let accessible = match p.get("isAccessibleForFree") {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        let venue = match raw.venue_id {
            Some(id) => VenueRef::Linked(id),
            None => VenueRef::Candidate(schema_org_place(&title, p.get("location"), raw.page_id)?),
        };
        let url = ptr_text(p, "/url");
        let external_id = ptr_text(p, "/@id").or_else(|| url.clone());

        Ok(CanonicalEvent {
            description: ptr_text(p, "/description"),
            start_at,
            end_at: ptr_text(p, "/endDate").and_then(|s| parse_datetime(&s, offset)),
            doors_at: ptr_text(p, "/doorTime").and_then(|s| parse_datetime(&s, offset)),
            venue,
            category,
            image_url,
            is_free: accessible || zero_price || mentions_free(&keywords),
            tags,
            external: external_id.map(|id| ExternalRef::new(&raw.source, id)),
            external_url: url,
            social_page_id: raw.page_id,
            title,
        })
    }
}

fn schema_org_place(title: &str, location: Option<&JsonValue>, page_id: Option<uuid::Uuid>) -> Result<CanonicalVenue, RecordError> {
    let place = match location {
        Some(JsonValue::Array(items)) => items.first(),
        other => other,
    }
    .filter(|l| l.is_object())
    .ok_or_else(|| invalid(format!("{title}: missing venue")))?;
    let name = ptr_text(place, "/name").ok_or_else(|| invalid(format!("{title}: venue has no name")))?;
    let (latitude, longitude) = checked_point(
        number(place.pointer("/geo/latitude")),
        number(place.pointer("/geo/longitude")),
        &format!("venue {name}"),
    )?;
    let (address, city, state, zip, country) = match place.get("address") {
        Some(addr @ JsonValue::Object(_)) => (
            ptr_text(addr, "/streetAddress"),
            ptr_text(addr, "/addressLocality"),
            ptr_text(addr, "/addressRegion"),
            ptr_text(addr, "/postalCode"),
            ptr_text(addr, "/addressCountry").or_else(|| ptr_text(addr, "/addressCountry/name")),
        ),
        other => text(other).map(|a| split_address(&a)).unwrap_or_default(),
    };
    Ok(CanonicalVenue {
        name,
        address,
        city,
        state,
        zip,
        country,
        latitude,
        longitude,
        capacity: whole_count(place.get("maximumAttendeeCapacity")),
        website: ptr_text(place, "/url"),
        social_page_id: page_id,
        external: None,
    })
}

fn place_venue(raw: &RawRecord) -> Result<CanonicalVenue, RecordError> {
    let p = &raw.payload;
    let name = ptr_text(p, "/name").ok_or_else(|| invalid("place has no name"))?;
    let (latitude, longitude) = checked_point(
        number(p.pointer("/geometry/location/lat")),
        number(p.pointer("/geometry/location/lng")),
        &format!("place {name}"),
    )?;
    let (address, city, state, zip, country) = ptr_text(p, "/formatted_address")
        .map(|a| split_address(&a))
        .unwrap_or_default();
    Ok(CanonicalVenue {
        name,
        address,
        city,
        state,
        zip,
        country,
        latitude,
        longitude,
        capacity: None,
        website: ptr_text(p, "/website"),
        social_page_id: None,
        external: ptr_text(p, "/place_id").map(|id| ExternalRef::new(&raw.source, id)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    fn pacific() -> FixedOffset {
        FixedOffset::west_opt(8 * 3600).unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(Taxonomy::builtin())
    }

    fn event(record: CanonicalRecord) -> CanonicalEvent {
        match record {
            CanonicalRecord::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    fn tm_payload() -> JsonValue {
        json!({
            "id": "vvG1zZ9",
            "name": "Night Shift",
            "url": "https://tickets.example/event/vvG1zZ9",
            "info": "All ages.",
            "dates": {"start": {"localDate": "2026-05-01", "localTime": "20:00:00"}},
            "classifications": [{
                "segment": {"name": "Music"},
                "genre": {"name": "Hip-Hop/Rap"},
                "subGenre": {"name": "Undefined"}
            }],
            "priceRanges": [{"min": 0.0, "max": 25.0}],
            "images": [{"url": "https://img.example/s.jpg", "width": 100},
                       {"url": "https://img.example/l.jpg", "width": 1024}],
            "_embedded": {"venues": [{
                "id": "KovZpZA7AAEA",
                "name": "The Crocodile",
                "address": {"line1": "2505 1st Ave"},
                "city": {"name": "Seattle"},
                "state": {"stateCode": "WA"},
                "postalCode": "98121",
                "country": {"countryCode": "US"},
                "location": {"latitude": "47.6139", "longitude": "-122.3444"}
            }]}
        })
    }

    #[test]
    fn ticketmaster_local_times_use_the_metro_offset() {
        let raw = RawRecord::new(SourceKind::Ticketmaster, "ticketing-a", tm_payload());
        let e = event(normalizer().normalize(&raw, pacific()).unwrap());
        assert_eq!(e.start_at.to_rfc3339(), "2026-05-02T04:00:00+00:00");
        assert_eq!(e.category, "music");
        assert_eq!(e.tags.iter().collect::<Vec<_>>(), vec!["hip-hop"]);
        assert!(e.is_free);
        assert_eq!(e.image_url.as_deref(), Some("https://img.example/l.jpg"));
        assert_eq!(e.description.as_deref(), Some("All ages."));
        assert_eq!(e.external, Some(ExternalRef::new("ticketing-a", "vvG1zZ9")));
        match e.venue {
            VenueRef::Candidate(v) => {
                assert_eq!(v.name, "The Crocodile");
                assert_eq!(v.city.as_deref(), Some("Seattle"));
                assert!((v.latitude - 47.6139).abs() < 1e-9);
                assert_eq!(v.external, Some(ExternalRef::new("ticketing-a", "KovZpZA7AAEA")));
            }
            other => panic!("unexpected venue {other:?}"),
        }
    }

    #[test]
    fn missing_required_fields_are_validation_errors() {
        let mut payload = tm_payload();
        payload["dates"] = json!({});
        let raw = RawRecord::new(SourceKind::Ticketmaster, "ticketing-a", payload);
        assert!(matches!(
            normalizer().normalize(&raw, pacific()),
            Err(RecordError::Validation(m)) if m.contains("missing start time")
        ));

        let raw = RawRecord::new(SourceKind::Ticketmaster, "ticketing-a", json!({"id": "x"}));
        assert!(matches!(normalizer().normalize(&raw, pacific()), Err(RecordError::Validation(_))));
    }

    #[test]
    fn out_of_range_coordinates_never_reach_the_writer() {
        let mut payload = tm_payload();
        payload["_embedded"]["venues"][0]["location"] = json!({"latitude": "91.2", "longitude": "-122.3"});
        let raw = RawRecord::new(SourceKind::Ticketmaster, "ticketing-a", payload);
        match normalizer().normalize(&raw, pacific()) {
            Err(RecordError::Validation(m)) => assert!(m.contains("latitude"), "{m}"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn seatgeek_utc_times_and_taxonomies() {
        let raw = RawRecord::new(
            SourceKind::Seatgeek,
            "ticketing-b",
            json!({
                "id": 6123456,
                "title": "Sonics Legends Game",
                "datetime_utc": "2026-03-10T03:30:00",
                "type": "nba",
                "taxonomies": [{"name": "sports"}, {"name": "basketball"}],
                "stats": {"lowest_price": 42},
                "performers": [{"image": "https://img.example/p.jpg", "genres": []}],
                "venue": {"id": 77, "name": "Climate Pledge Arena", "city": "Seattle", "state": "WA",
                          "postal_code": "98109", "capacity": 18100,
                          "location": {"lat": 47.6221, "lon": -122.354}}
            }),
        );
        let e = event(normalizer().normalize(&raw, pacific()).unwrap());
        assert_eq!(e.start_at.hour(), 3);
        assert_eq!(e.category, "sports");
        assert!(e.tags.contains("basketball"));
        assert!(!e.is_free);
        assert_eq!(e.external, Some(ExternalRef::new("ticketing-b", "6123456")));
        match e.venue {
            VenueRef::Candidate(v) => assert_eq!(v.capacity, Some(18100)),
            other => panic!("unexpected venue {other:?}"),
        }
    }

    #[test]
    fn schema_org_events_link_to_the_page_venue() {
        let page_id = uuid::Uuid::new_v4();
        let venue_id = uuid::Uuid::new_v4();
        let raw = RawRecord {
            page_id: Some(page_id),
            venue_id: Some(venue_id),
            ..RawRecord::new(
                SourceKind::SocialPage,
                "social",
                json!({
                    "@type": "ComedyEvent",
                    "name": "Late Laughs",
                    "startDate": "2026-05-02T21:00",
                    "url": "https://social.example/events/9",
                    "keywords": "Stand Up, Free Show, Unicorns",
                    "isAccessibleForFree": "True"
                }),
            )
        };
        let e = event(normalizer().normalize(&raw, pacific()).unwrap());
        assert_eq!(e.venue, VenueRef::Linked(venue_id));
        assert_eq!(e.social_page_id, Some(page_id));
        assert_eq!(e.category, "comedy");
        assert_eq!(e.tags.iter().collect::<Vec<_>>(), vec!["stand-up"]);
        assert!(e.is_free);
        assert_eq!(
            e.external,
            Some(ExternalRef::new("social", "https://social.example/events/9"))
        );
    }

    #[test]
    fn schema_org_capacity_must_be_a_positive_whole_number() {
        let capacity = |value: JsonValue| {
            let place = json!({
                "@type": "Place",
                "name": "Neumos",
                "geo": {"latitude": 47.6138, "longitude": -122.3199},
                "maximumAttendeeCapacity": value
            });
            schema_org_place("Show", Some(&place), None).unwrap().capacity
        };
        assert_eq!(capacity(json!(650)), Some(650));
        assert_eq!(capacity(json!("650")), Some(650));
        assert_eq!(capacity(json!(-5)), None);
        assert_eq!(capacity(json!(12.5)), None);
        assert_eq!(capacity(json!(1e12)), None);
        assert_eq!(capacity(json!(0)), None);
    }

    #[test]
    fn schema_org_events_without_venue_link_need_geo() {
        let raw = RawRecord::new(
            SourceKind::VenueWebsite,
            "venue-sites",
            json!({
                "@type": "Event",
                "name": "Hamlet",
                "startDate": "2026-07-11",
                "location": {"@type": "Place", "name": "Center Stage", "address": "1 Main St, Seattle, WA 98101"}
            }),
        );
        assert!(matches!(
            normalizer().normalize(&raw, pacific()),
            Err(RecordError::Validation(m)) if m.contains("no coordinates")
        ));
    }

    #[test]
    fn places_become_venues_with_parsed_addresses() {
        let raw = RawRecord::new(
            SourceKind::GooglePlaces,
            "places",
            json!({
                "place_id": "ChIJ1",
                "name": "The Crocodile",
                "formatted_address": "2505 1st Ave, Seattle, WA 98121, United States",
                "geometry": {"location": {"lat": 47.6139, "lng": -122.3444}}
            }),
        );
        match normalizer().normalize(&raw, pacific()).unwrap() {
            CanonicalRecord::Venue(v) => {
                assert_eq!(v.address.as_deref(), Some("2505 1st Ave"));
                assert_eq!(v.city.as_deref(), Some("Seattle"));
                assert_eq!(v.state.as_deref(), Some("WA"));
                assert_eq!(v.zip.as_deref(), Some("98121"));
                assert_eq!(v.country.as_deref(), Some("United States"));
                assert_eq!(v.external, Some(ExternalRef::new("places", "ChIJ1")));
            }
            other => panic!("expected venue, got {other:?}"),
        }
    }

    #[test]
    fn parses_offsets_naive_times_and_bare_dates() {
        let off = pacific();
        assert_eq!(
            parse_datetime("2026-05-01T20:00:00Z", off).unwrap().to_rfc3339(),
            "2026-05-01T20:00:00+00:00"
        );
        assert_eq!(
            parse_datetime("2026-05-01T20:00", off).unwrap().to_rfc3339(),
            "2026-05-02T04:00:00+00:00"
        );
        assert_eq!(
            parse_datetime("2026-05-01", off).unwrap().to_rfc3339(),
            "2026-05-01T08:00:00+00:00"
        );
        assert!(parse_datetime("next friday", off).is_none());
    }
}
