//! Geofence calculation
//!
//! Turns a center and a search radius into an axis-aligned bounding box that
//! a store can answer with a plain range query. The four cardinal destination
//! points are projected along great circles at the requested radius; the
//! longitude extent is then widened to the tangent bound of the spherical cap,
//! since at non-zero latitude the cap bulges past the east/west points.

use beacon_core::geo::normalize_longitude;
use beacon_core::{GeoPosition, EARTH_RADIUS_M};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use thiserror::Error;

/// Geofence errors
#[derive(Debug, Error, PartialEq)]
pub enum GeofenceError {
    /// Radius not in (0, max]
    #[error("Search radius {requested}m outside the allowed range (0, {max}]m")]
    RangeExceeded {
        /// Requested radius in meters
        requested: f64,
        /// Configured maximum radius in meters
        max: f64,
    },
}

/// Axis-aligned latitude/longitude box
///
/// When the box crosses the antimeridian `left > right` and the longitude
/// range wraps through 180.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Northern latitude edge
    pub top: f64,
    /// Southern latitude edge
    pub bottom: f64,
    /// Western longitude edge
    pub left: f64,
    /// Eastern longitude edge
    pub right: f64,
}

impl BoundingBox {
    /// Check whether the longitude range wraps through 180
    pub fn crosses_antimeridian(&self) -> bool {
        self.left > self.right
    }

    /// Inclusive containment test
    pub fn contains(&self, position: &GeoPosition) -> bool {
        if position.lat < self.bottom || position.lat > self.top {
            return false;
        }
        if self.crosses_antimeridian() {
            position.lon >= self.left || position.lon <= self.right
        } else {
            position.lon >= self.left && position.lon <= self.right
        }
    }
}

/// Bounding-box calculator with a configured radius ceiling
#[derive(Debug, Clone, Copy)]
pub struct Geofence {
    max_radius_m: f64,
}

impl Geofence {
    /// Create a calculator accepting radii up to `max_radius_m`
    pub fn new(max_radius_m: f64) -> Self {
        Self { max_radius_m }
    }

    /// Configured maximum radius in meters
    pub fn max_radius_m(&self) -> f64 {
        self.max_radius_m
    }

    /// Validate a radius against (0, max]
    pub fn check_radius(&self, radius_m: f64) -> Result<(), GeofenceError> {
        if radius_m.is_finite() && radius_m > 0.0 && radius_m <= self.max_radius_m {
            Ok(())
        } else {
            Err(GeofenceError::RangeExceeded {
                requested: radius_m,
                max: self.max_radius_m,
            })
        }
    }

    /// Bounding box containing every point within `radius_m` of `center`
    pub fn bounding_box(
        &self,
        center: &GeoPosition,
        radius_m: f64,
    ) -> Result<BoundingBox, GeofenceError> {
        self.check_radius(radius_m)?;

        let points: Vec<GeoPosition> = (0..4)
            .map(|i| center.destination(90.0 * i as f64, radius_m))
            .collect();
        let (north, east, south, west) = (points[0], points[1], points[2], points[3]);

        let delta = radius_m / EARTH_RADIUS_M;
        let lat_rad = center.lat.to_radians();

        // Cap touching a pole covers every meridian
        if lat_rad + delta >= FRAC_PI_2 || lat_rad - delta <= -FRAC_PI_2 {
            return Ok(BoundingBox {
                top: if lat_rad + delta >= FRAC_PI_2 { 90.0 } else { north.lat.max(south.lat) },
                bottom: if lat_rad - delta <= -FRAC_PI_2 { -90.0 } else { north.lat.min(south.lat) },
                left: -180.0,
                right: 180.0,
            });
        }

        let east_span = normalize_longitude(east.lon - center.lon).abs();
        let west_span = normalize_longitude(center.lon - west.lon).abs();
        let tangent_span = (delta.sin() / lat_rad.cos()).clamp(-1.0, 1.0).asin().to_degrees();
        let span = east_span.max(west_span).max(tangent_span);

        if span >= 180.0 {
            return Ok(BoundingBox {
                top: north.lat.max(south.lat),
                bottom: north.lat.min(south.lat),
                left: -180.0,
                right: 180.0,
            });
        }

        Ok(BoundingBox {
            top: north.lat.max(south.lat),
            bottom: north.lat.min(south.lat),
            left: normalize_longitude(center.lon - span),
            right: normalize_longitude(center.lon + span),
        })
    }
}
