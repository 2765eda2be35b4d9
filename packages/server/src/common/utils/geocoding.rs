//! Geospatial helpers shared by the geolocation pipeline.

/// Great-circle distance between two coordinates in kilometers (Haversine).
pub fn calculate_distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_distance() {
        // Minneapolis to St. Paul (≈16 km)
        let minneapolis = (44.98, -93.27);
        let st_paul = (44.95, -93.09);

        let distance = calculate_distance_km(minneapolis.0, minneapolis.1, st_paul.0, st_paul.1);

        assert!(distance > 15.0 && distance < 17.0);

        let distance = calculate_distance_km(44.98, -93.27, 44.98, -93.27);
        assert!(distance < 0.1);
    }

    #[test]
    fn test_calculate_distance_berlin_new_york() {
        // Berlin to New York, used by the impossible-travel scenario.
        let distance = calculate_distance_km(52.5, 13.4, 40.7, -74.0);
        assert!(distance > 6000.0 && distance < 6500.0);
    }
}
