//! Candidate discovery
//!
//! A box query narrows the store scan; the exact great-circle check runs
//! when the result is iterated. The fetched rows are shared, so iterating
//! again replays the same sequence.

use beacon_core::GeoPosition;
use std::sync::Arc;
use tracing::debug;

use crate::error::DispatchError;
use crate::geofence::{BoundingBox, Geofence};
use crate::retry::RetryPolicy;
use crate::store::ResponderStore;
use crate::types::ResponderClass;

/// Responders of one class found near a point
#[derive(Debug, Clone)]
pub struct NearbyResponders {
    center: GeoPosition,
    radius_m: f64,
    bbox: BoundingBox,
    rows: Arc<[(String, GeoPosition)]>,
}

impl NearbyResponders {
    /// Box used for the store query
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Identities within the radius, ordered by identity
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .filter(move |(_, pos)| self.center.haversine_distance(pos) <= self.radius_m)
            .map(|(identity, _)| identity.as_str())
    }

    /// Collect the identities within the radius
    pub fn identities(&self) -> Vec<String> {
        self.iter().map(str::to_string).collect()
    }
}

/// Finds responders whose last position is within a radius
#[derive(Clone)]
pub struct CandidateDirectory {
    store: Arc<dyn ResponderStore>,
    geofence: Geofence,
    retry: RetryPolicy,
}

impl CandidateDirectory {
    pub fn new(store: Arc<dyn ResponderStore>, geofence: Geofence, retry: RetryPolicy) -> Self {
        Self {
            store,
            geofence,
            retry,
        }
    }

    /// Responders of `class` within `radius_m` of `center`
    pub async fn nearby(
        &self,
        class: ResponderClass,
        center: &GeoPosition,
        radius_m: f64,
    ) -> Result<NearbyResponders, DispatchError> {
        let bbox = self.geofence.bounding_box(center, radius_m)?;
        let rows = self
            .retry
            .run("find_in_box", || self.store.find_in_box(class, &bbox))
            .await?;

        debug!(
            class = %class,
            radius_m,
            in_box = rows.len(),
            "Candidate box query complete"
        );

        Ok(NearbyResponders {
            center: *center,
            radius_m,
            bbox,
            rows: rows.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResponderStore;
    use crate::types::ResponderProfile;

    async fn seeded() -> CandidateDirectory {
        let store = MemoryResponderStore::new();
        let seeds = [
            ("a@x", 45.005, -122.0),
            ("b@x", 45.01, -122.0),
            // Inside the 2000 m box but outside the circle
            ("corner@x", 45.015, -121.98),
            ("far@x", 45.2, -122.0),
        ];
        for (id, lat, lon) in seeds {
            store
                .put(
                    ResponderProfile::new(id, ResponderClass::Doctor, 0)
                        .with_position(GeoPosition::new(lat, lon).unwrap()),
                )
                .await
                .unwrap();
        }
        store
            .put(ResponderProfile::new("nowhere@x", ResponderClass::Doctor, 0))
            .await
            .unwrap();

        CandidateDirectory::new(Arc::new(store), Geofence::new(10_000.0), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_nearby_applies_exact_radius() {
        let directory = seeded().await;
        let center = GeoPosition::new(45.0, -122.0).unwrap();

        let nearby = directory
            .nearby(ResponderClass::Doctor, &center, 2_000.0)
            .await
            .unwrap();

        assert!(nearby.bbox().contains(&GeoPosition::new(45.015, -121.98).unwrap()));
        assert_eq!(nearby.identities(), vec!["a@x", "b@x"]);
        // Restartable
        assert_eq!(nearby.iter().count(), 2);
        assert_eq!(nearby.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_nearby_rejects_out_of_range_radius() {
        let directory = seeded().await;
        let center = GeoPosition::new(45.0, -122.0).unwrap();

        let result = directory
            .nearby(ResponderClass::Doctor, &center, 20_000.0)
            .await;
        assert!(matches!(result, Err(DispatchError::RangeExceeded { .. })));
    }
}
