//! Great-circle primitives on a spherical Earth.
//!
//! Neither function validates its inputs; callers filter coordinates with
//! [`crate::records::is_valid_coordinate`] first.

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometres.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if lat1 == lat2 && lon1 == lon2 {
        return 0.0;
    }

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Haversine distance in metres.
#[inline]
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    distance(lat1, lon1, lat2, lon2) * 1000.0
}

/// Initial bearing from the first point to the second, in `[0, 360)` degrees.
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let y = d_lon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lon.cos();

    let deg = y.atan2(x).to_degrees().rem_euclid(360.0);
    // rem_euclid can round a tiny negative angle up to exactly 360
    if deg >= 360.0 {
        0.0
    } else {
        deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_points_are_zero_apart() {
        assert_eq!(distance(48.8566, 2.3522, 48.8566, 2.3522), 0.0);
    }

    #[test]
    fn test_paris_to_london() {
        let d = distance(48.8566, 2.3522, 51.5074, -0.1278);
        assert_relative_eq!(d, 343.5, epsilon = 2.0);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = distance(10.0, 20.0, 11.0, 20.0);
        assert_relative_eq!(d, 111.19, epsilon = 0.01);
        assert_relative_eq!(distance_m(10.0, 20.0, 11.0, 20.0), d * 1000.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let ab = distance(-33.8688, 151.2093, 35.6762, 139.6503);
        let ba = distance(35.6762, 139.6503, -33.8688, 151.2093);
        assert_relative_eq!(ab, ba, epsilon = 1e-9);
    }

    #[test]
    fn test_cardinal_bearings() {
        assert_relative_eq!(bearing(0.0, 0.0, 1.0, 0.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(bearing(0.0, 0.0, 0.0, 1.0), 90.0, epsilon = 1e-9);
        assert_relative_eq!(bearing(1.0, 0.0, 0.0, 0.0), 180.0, epsilon = 1e-9);
        assert_relative_eq!(bearing(0.0, 1.0, 0.0, 0.0), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bearing_stays_in_range() {
        for (lat2, lon2) in [(10.0, -10.0), (-10.0, -10.0), (-10.0, 10.0), (0.0, -0.000001)] {
            let b = bearing(0.0, 0.0, lat2, lon2);
            assert!((0.0..360.0).contains(&b), "bearing {b} out of range");
        }
    }
}
