use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance (haversine)
    pub fn distance_meters(&self, other: &Point) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lng = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let gangnam = Point::new(37.4979, 127.0276);
        let seoul_station = Point::new(37.5547, 126.9707);
        let d = gangnam.distance_meters(&seoul_station);
        // roughly 8km apart
        assert!(d > 7_500.0 && d < 8_500.0, "distance was {}", d);
        assert_eq!(gangnam.distance_meters(&gangnam), 0.0);
    }

    #[test]
    fn test_validity() {
        assert!(Point::new(37.5, 127.0).is_valid());
        assert!(!Point::new(91.0, 0.0).is_valid());
        assert!(!Point::new(f64::NAN, 0.0).is_valid());
    }
}
