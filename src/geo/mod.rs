use crate::models::courier::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_km(a, b) * 1_000.0
}

/// Point `km` kilometres due north of `origin` along its meridian.
pub fn offset_north(origin: &GeoPoint, km: f64) -> GeoPoint {
    GeoPoint {
        lat: origin.lat + (km / EARTH_RADIUS_KM).to_degrees(),
        lng: origin.lng,
    }
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, haversine_m, offset_north};
    use crate::models::courier::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn offset_north_round_trips_through_haversine() {
        let origin = GeoPoint {
            lat: 52.52,
            lng: 13.405,
        };
        for km in [2.0, 10.0, 60.0] {
            let moved = offset_north(&origin, km);
            assert!((haversine_m(&origin, &moved) - km * 1_000.0).abs() < 1.0);
        }
    }

    #[test]
    fn coordinate_order_does_not_predict_distance() {
        // Sorting by raw [lng, lat] puts `south_west` first even though it is farther.
        let origin = GeoPoint { lat: 60.0, lng: 10.0 };
        let east = GeoPoint { lat: 60.0, lng: 10.5 };
        let south_west = GeoPoint { lat: 59.9, lng: 9.0 };
        assert!(haversine_km(&origin, &east) < haversine_km(&origin, &south_west));
    }
}
