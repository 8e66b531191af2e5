pub static EARTH_RADIUS_APPROX: f64 = 6_371_000f64;

/// Central angle in radians between two points given in degrees, using the
/// haversine half-angle form. NaN inputs propagate to a NaN result.
pub fn central_angle(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push `a` a hair above 1 for antipodal points.
    2.0 * a.clamp(0.0, 1.0).sqrt().asin()
}

/// Great-circle distance in meters on a spherical earth.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    EARTH_RADIUS_APPROX * central_angle(lat1, lng1, lat2, lng2)
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use crate::{haversine_meters, EARTH_RADIUS_APPROX};

    #[test]
    fn test_zero() {
        assert_abs_diff_eq!(
            haversine_meters(1.3513, 103.8486, 1.3513, 103.8486),
            0f64,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let expected = EARTH_RADIUS_APPROX * 1f64.to_radians();
        assert_abs_diff_eq!(haversine_meters(0.0, 0.0, 1.0, 0.0), expected, epsilon = 0.001);
        assert_abs_diff_eq!(haversine_meters(45.0, 10.0, 46.0, 10.0), expected, epsilon = 0.001);
    }

    #[test]
    fn test_symmetric() {
        let there = haversine_meters(47.8161226, -122.2970119, 45.4941787, -122.8094819);
        let back = haversine_meters(45.4941787, -122.8094819, 47.8161226, -122.2970119);
        assert_abs_diff_eq!(there, back, epsilon = 1e-6);
    }

    #[test]
    fn test_antipodes() {
        let half_circumference = EARTH_RADIUS_APPROX * std::f64::consts::PI;
        assert_abs_diff_eq!(
            haversine_meters(0.0, 0.0, 0.0, 180.0),
            half_circumference,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_small_distance() {
        // Bishan town centroid to Bishan MRT, roughly 47 m apart.
        let d = haversine_meters(1.3509, 103.8485, 1.3513, 103.8486);
        assert!(d > 45.0 && d < 50.0, "{d}");
    }

    #[test]
    fn test_nan_propagates() {
        assert!(haversine_meters(f64::NAN, 0.0, 1.0, 1.0).is_nan());
        assert!(haversine_meters(1.3, f64::NAN, 1.3513, 103.8486).is_nan());
        assert!(haversine_meters(1.3, 103.8, 1.3513, f64::INFINITY).is_nan());
    }
}
