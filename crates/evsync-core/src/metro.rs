//! Metro configuration and the per-source parameter resolver.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown source kind {0}")]
    UnknownSource(String),
    #[error("unknown metro {0}")]
    UnknownMetro(String),
}

/// A configured geographic market. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metro {
    pub slug: String,
    pub name: String,
    pub state: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_miles: u32,
    pub radius_meters: u32,
    /// Standard offset used for naive local source times and calendar-day matching.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Metro {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

/// Explicit set of metros handed to each trigger call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetroSet {
    pub metros: Vec<Metro>,
}

impl MetroSet {
    pub fn new(metros: Vec<Metro>) -> Self {
        Self { metros }
    }

    pub fn find(&self, slug: &str) -> Option<&Metro> {
        self.metros.iter().find(|m| m.slug == slug)
    }

    /// The default run set: enabled metros only, in configured order.
    pub fn active(&self) -> Vec<Metro> {
        self.metros.iter().filter(|m| m.enabled).cloned().collect()
    }

    /// Explicit selection for backfills; disabled metros are allowed here.
    pub fn select(&self, slugs: &[String]) -> Result<Vec<Metro>, ResolveError> {
        let mut selected: Vec<Metro> = Vec::with_capacity(slugs.len());
        for slug in slugs {
            let metro = self
                .find(slug)
                .ok_or_else(|| ResolveError::UnknownMetro(slug.clone()))?;
            if !selected.iter().any(|m| m.slug == metro.slug) {
                selected.push(metro.clone());
            }
        }
        Ok(selected)
    }
}

/// Source-native query parameters for one metro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SourceParams {
    CityState {
        city: String,
        state_code: String,
    },
    LatLonRange {
        latitude: f64,
        longitude: f64,
        /// e.g. `25mi`
        range: String,
    },
    RegionRadius {
        region: String,
        latitude: f64,
        longitude: f64,
        radius_meters: u32,
    },
}

pub fn resolve(metro: &Metro, kind: SourceKind) -> SourceParams {
    match kind {
        SourceKind::Ticketmaster | SourceKind::SocialPage | SourceKind::VenueWebsite => {
            SourceParams::CityState {
                city: metro.name.clone(),
                state_code: metro.state.clone(),
            }
        }
        SourceKind::Seatgeek => SourceParams::LatLonRange {
            latitude: metro.latitude,
            longitude: metro.longitude,
            range: format!("{}mi", metro.radius_miles),
        },
        SourceKind::GooglePlaces => SourceParams::RegionRadius {
            region: format!("{}, {}", metro.name, metro.state),
            latitude: metro.latitude,
            longitude: metro.longitude,
            radius_meters: metro.radius_meters,
        },
    }
}

/// Resolve by source kind name, guarding against kinds nothing implements.
pub fn resolve_for(metro: &Metro, kind: &str) -> Result<SourceParams, ResolveError> {
    Ok(resolve(metro, kind.parse()?))
}
