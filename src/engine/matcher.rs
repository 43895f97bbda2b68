use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::GeoPoint;
use crate::store::{GeoStore, NearbyCourier};

/// Read-only nearest-courier lookup over the geo store.
pub struct DriverMatcher {
    store: Arc<dyn GeoStore>,
    radius_m: f64,
}

impl DriverMatcher {
    pub fn new(store: Arc<dyn GeoStore>, radius_m: f64) -> Self {
        Self { store, radius_m }
    }

    /// Nearest eligible courier to `origin` that is not in `exclude`.
    ///
    /// `Ok(None)` means nobody is eligible within the radius; store failures
    /// surface as [`AppError::Retryable`].
    pub async fn find_nearest(
        &self,
        origin: &GeoPoint,
        exclude: &HashSet<Uuid>,
    ) -> Result<Option<NearbyCourier>, AppError> {
        let candidates = self
            .store
            .find_eligible_near(origin, self.radius_m, exclude)
            .await?;
        let considered = candidates.len();

        // Re-apply every constraint instead of trusting the store's ordering.
        let nearest = candidates
            .into_iter()
            .filter(|candidate| {
                candidate.courier.is_eligible()
                    && !exclude.contains(&candidate.courier.id)
                    && candidate.distance_m <= self.radius_m
            })
            .min_by(|a, b| {
                a.distance_m
                    .total_cmp(&b.distance_m)
                    .then_with(|| a.courier.id.cmp(&b.courier.id))
            });

        debug!(
            considered,
            excluded = exclude.len(),
            courier_id = ?nearest.as_ref().map(|n| n.courier.id),
            "matcher query"
        );
        Ok(nearest)
    }
}
