//! Geographic helpers shared by the SQL scalar functions and the in-process
//! match predicate. Both sides must agree to the last bit, so there is
//! exactly one distance implementation.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to another point, in kilometres
    pub fn distance_km(&self, other: &LatLng) -> f64 {
        great_circle_km(self.lat, self.lng, other.lat, other.lng)
    }
}

/// Haversine great-circle distance in kilometres
pub fn great_circle_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Cheap rectangular pre-filter: is `point` within `lat_margin`/`lng_margin`
/// degrees of `center`. Mirrors the `BETWEEN` clause of the SQL predicate.
pub fn within_box(point: &LatLng, center: &LatLng, lat_margin: f64, lng_margin: f64) -> bool {
    point.lat >= center.lat - lat_margin
        && point.lat <= center.lat + lat_margin
        && point.lng >= center.lng - lng_margin
        && point.lng <= center.lng + lng_margin
}

/// Offset a point by a distance east and north (kilometres). Flat-earth
/// approximation, only meant for building nearby synthetic points.
pub fn offset_km(origin: &LatLng, east_km: f64, north_km: f64) -> LatLng {
    let km_per_deg = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
    let lat = origin.lat + north_km / km_per_deg;
    let lng = origin.lng + east_km / (km_per_deg * origin.lat.to_radians().cos());
    LatLng { lat, lng }
}
