//! Geodesic and circular helpers shared by the decoder, fusion engine and
//! start-line matcher. All distances use a spherical earth of radius
//! `EARTH_RADIUS_M`.

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const MPS_TO_KNOTS: f64 = 1.943_844_5;

/// Great-circle distance in meters (haversine).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial (forward) bearing from point 1 to point 2, degrees in [0, 360).
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let y = d_lon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * d_lon.cos();
    wrap_deg(y.atan2(x).to_degrees())
}

/// Normalise an angle to [0, 360).
pub fn wrap_deg(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed shortest rotation from `from` to `to`, degrees in [-180, 180).
pub fn delta_deg(to: f64, from: f64) -> f64 {
    (to - from + 540.0).rem_euclid(360.0) - 180.0
}

/// Circular weighted mean of two angles. `weight_b` is clamped to [0, 1];
/// 0 returns `a`, 1 returns `b`. Falls back to `a` when the vectors cancel.
pub fn blend_deg(a: f64, b: f64, weight_b: f64) -> f64 {
    let w = weight_b.clamp(0.0, 1.0);
    let (a_rad, b_rad) = (a.to_radians(), b.to_radians());
    let x = (1.0 - w) * a_rad.cos() + w * b_rad.cos();
    let y = (1.0 - w) * a_rad.sin() + w * b_rad.sin();
    if x.abs() < 1e-9 && y.abs() < 1e-9 {
        return wrap_deg(a);
    }
    wrap_deg(y.atan2(x).to_degrees())
}

/// Finite, within ±90/±180, and not the null island.
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    if !lat.is_finite() || !lon.is_finite() {
        return false;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return false;
    }
    !(lat.abs() < 1e-6 && lon.abs() < 1e-6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_distance(42.0, -8.0, 43.0, -8.0);
        // 1° of arc on a 6371 km sphere
        assert_abs_diff_eq!(d, 111_194.9, epsilon = 1.0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert_abs_diff_eq!(bearing_deg(42.0, -8.0, 42.01, -8.0), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bearing_deg(42.0, -8.0, 42.0, -7.99), 90.0, epsilon = 0.01);
        assert_abs_diff_eq!(bearing_deg(42.0, -8.0, 41.99, -8.0), 180.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bearing_deg(42.0, -8.0, 42.0, -8.01), 270.0, epsilon = 0.01);
    }

    #[test]
    fn test_delta_wraps_shortest_way() {
        assert_abs_diff_eq!(delta_deg(10.0, 350.0), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(delta_deg(350.0, 10.0), -20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(delta_deg(90.0, 90.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_blend_identity_and_extremes() {
        for a in [0.0, 45.0, 179.0, 270.0, 359.5] {
            assert_abs_diff_eq!(blend_deg(a, a, 0.37), wrap_deg(a), epsilon = 1e-6);
            assert_abs_diff_eq!(blend_deg(a, 120.0, 0.0), wrap_deg(a), epsilon = 1e-6);
            assert_abs_diff_eq!(blend_deg(a, 120.0, 1.0), 120.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_blend_across_north() {
        let mid = blend_deg(350.0, 10.0, 0.5);
        assert!(mid < 1e-6 || mid > 360.0 - 1e-6, "got {mid}");
    }

    #[test]
    fn test_blend_opposite_falls_back_to_first() {
        assert_abs_diff_eq!(blend_deg(90.0, 270.0, 0.5), 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(is_valid_coordinate(42.23, -8.73));
        assert!(!is_valid_coordinate(0.0, 0.0));
        assert!(!is_valid_coordinate(f64::NAN, 1.0));
        assert!(!is_valid_coordinate(91.0, 1.0));
        assert!(!is_valid_coordinate(10.0, 181.0));
    }
}
