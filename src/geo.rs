//! Metric-to-degree conversions for latitude/longitude offsets.

/// Meters per degree of latitude, constant everywhere on the globe.
pub const METERS_PER_LAT_DEGREE: f64 = 111_320.0;

pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_LAT_DEGREE
}

/// Meters-per-degree of longitude shrinks toward the poles, so the
/// conversion is evaluated at a specific latitude. Returns 0.0 when the
/// denominator degenerates (at the poles).
pub fn meters_to_lng_degrees(meters: f64, lat: f64) -> f64 {
    let denom = METERS_PER_LAT_DEGREE * lat.to_radians().cos();
    if denom.abs() < 1e-9 {
        return 0.0;
    }
    meters / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lat_degrees_are_latitude_independent() {
        assert!((meters_to_lat_degrees(111_320.0) - 1.0).abs() < 1e-12);
        assert!((meters_to_lat_degrees(55_660.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn lng_degrees_match_lat_degrees_at_equator() {
        let lat = meters_to_lat_degrees(1000.0);
        let lng = meters_to_lng_degrees(1000.0, 0.0);
        assert!((lat - lng).abs() < 1e-12);
    }

    #[test]
    fn lng_degrees_double_at_sixty_north() {
        let at_equator = meters_to_lng_degrees(1000.0, 0.0);
        let at_sixty = meters_to_lng_degrees(1000.0, 60.0);
        assert!((at_sixty / at_equator - 2.0).abs() < 1e-9);
    }

    #[test]
    fn lng_degrees_degenerate_at_pole() {
        assert_eq!(meters_to_lng_degrees(1000.0, 90.0), 0.0);
    }
}
