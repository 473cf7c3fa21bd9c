//! Coordinate validation and great-circle distance.

use thiserror::Error;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), GeoError> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(GeoError::Latitude(latitude));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(GeoError::Longitude(longitude));
    }
    Ok(())
}

/// Haversine distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Degrees of latitude/longitude spanned by `radius_m` around `latitude`, for bounding-box prefilters.
pub fn bounding_deltas(latitude: f64, radius_m: f64) -> (f64, f64) {
    let d_lat = (radius_m / EARTH_RADIUS_M).to_degrees();
    let cos_lat = latitude.to_radians().cos().abs().max(1e-6);
    let d_lon = (radius_m / (EARTH_RADIUS_M * cos_lat)).to_degrees();
    (d_lat, d_lon.min(180.0))
}
