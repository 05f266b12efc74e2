// Location snapshot model and the nearest-candidate selector.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::RadarError,
    geo::{distance, Coordinate},
};

// Data structures for the flat-JSON live map feed
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocationSnapshot {
    pub countries: Vec<Country>,
    pub cities: Vec<City>,
    pub places: Vec<Place>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Country {
    pub domain: String,
    #[serde(default)]
    pub name: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct City {
    pub uid: u64,
    pub name: String,
    pub domain: String,
    pub lat: f64,
    #[serde(rename = "lng")]
    pub lon: f64,
    #[serde(default)]
    pub zoom: u8,
    pub available_bikes: u32,
}

impl City {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

// A place is the rentable resource: a station or a free-floating bike spot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Place {
    pub uid: u64,
    #[serde(default)]
    pub name: String,
    pub city_id: u64,
    pub lat: f64,
    #[serde(rename = "lng")]
    pub lon: f64,
    pub bikes_available_to_rent: u32,
}

impl Place {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// A place evaluated during one tick, with its distance from the search
/// centre attached. The snapshot's own copy is never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub place: Place,
    pub distance: f64,
}

impl LocationSnapshot {
    pub fn from_json(raw: &[u8]) -> Result<Self, RadarError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn cities_with_bikes(&self) -> impl Iterator<Item = &City> {
        self.cities.iter().filter(|c| c.available_bikes > 0)
    }

    pub fn city_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cities_with_bikes().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn city_by_name(&self, name: &str) -> Option<&City> {
        self.cities.iter().find(|c| c.name == name)
    }

    pub fn city_by_id(&self, city_id: u64) -> Option<&City> {
        self.cities.iter().find(|c| c.uid == city_id)
    }

    // city -> domain -> country timezone
    pub fn timezone_for_city(&self, city_id: u64) -> Option<&str> {
        let domain = &self.city_by_id(city_id)?.domain;
        debug!(city_id, %domain, "looking up timezone");
        self.countries
            .iter()
            .find(|c| &c.domain == domain)
            .map(|c| c.timezone.as_str())
    }

    pub fn bikes_in_city(&self, city_id: u64) -> impl Iterator<Item = &Place> {
        self.places
            .iter()
            .filter(move |p| p.city_id == city_id && p.bikes_available_to_rent > 0)
    }
}

/// Ranks the places of `city_id` with at least one bike to rent by their
/// distance from `center`, keeping at most `limit` within `radius` meters.
///
/// The sort is stable so ties keep snapshot order and repeated evaluations of
/// an unchanged snapshot pick the same candidate.
pub fn select(
    places: &[Place],
    city_id: u64,
    center: Coordinate,
    radius: f64,
    limit: usize,
) -> Vec<Candidate> {
    let mut near: Vec<Candidate> = places
        .iter()
        .filter(|p| p.city_id == city_id)
        .filter(|p| p.bikes_available_to_rent > 0)
        .map(|p| Candidate {
            place: p.clone(),
            distance: distance(center, p.coordinate()),
        })
        .filter(|c| c.distance <= radius)
        .collect();

    near.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    near.truncate(limit);

    debug!(
        city_id,
        radius,
        found = near.len(),
        "selected candidates around {:.5},{:.5}",
        center.lat,
        center.lon
    );
    near
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;

    pub const CENTER: Coordinate = Coordinate {
        lat: 52.5200,
        lon: 13.4050,
    };

    // ~111_195 m per degree of latitude on the sphere
    pub fn lat_offset(meters: f64) -> f64 {
        meters / 111_194.93
    }

    pub fn place(uid: u64, city_id: u64, meters_north: f64, bikes: u32) -> Place {
        Place {
            uid,
            name: format!("Place {uid}"),
            city_id,
            lat: CENTER.lat + lat_offset(meters_north),
            lon: CENTER.lon,
            bikes_available_to_rent: bikes,
        }
    }

    pub const SAMPLE_SNAPSHOT: &str = r#"{
        "countries": [
            {"domain": "bn", "name": "nextbike Berlin", "timezone": "Europe/Berlin"},
            {"domain": "le", "name": "nextbike Leipzig", "timezone": "Europe/Berlin"}
        ],
        "cities": [
            {"uid": 362, "name": "Berlin", "domain": "bn", "lat": 52.52, "lng": 13.405, "zoom": 12, "available_bikes": 120},
            {"uid": 1, "name": "Leipzig", "domain": "le", "lat": 51.34, "lng": 12.37, "zoom": 13, "available_bikes": 0}
        ],
        "places": [
            {"uid": 100, "name": "Alexanderplatz", "city_id": 362, "lat": 52.5219, "lng": 13.4132, "bikes_available_to_rent": 2},
            {"uid": 101, "name": "BIKE 1234", "city_id": 362, "lat": 52.5201, "lng": 13.4051, "bikes_available_to_rent": 1},
            {"uid": 102, "name": "Empty", "city_id": 362, "lat": 52.5200, "lng": 13.4050, "bikes_available_to_rent": 0},
            {"uid": 200, "name": "Hauptbahnhof", "city_id": 1, "lat": 51.345, "lng": 12.381, "bikes_available_to_rent": 4}
        ]
    }"#;

    #[test]
    fn test_scenario_radius_cut_and_order() {
        let places = vec![
            place(3, 362, 800.0, 1),
            place(2, 362, 300.0, 1),
            place(1, 362, 100.0, 1),
        ];

        let selected = select(&places, 362, CENTER, 500.0, 3);

        let ids: Vec<u64> = selected.iter().map(|c| c.place.uid).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!((selected[0].distance - 100.0).abs() < 0.5);
        assert!((selected[1].distance - 300.0).abs() < 0.5);
    }

    #[test]
    fn test_filters_city_and_empty_places() {
        let places = vec![
            place(1, 999, 10.0, 3),
            place(2, 362, 20.0, 0),
            place(3, 362, 30.0, 1),
        ];

        let selected = select(&places, 362, CENTER, 500.0, 3);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].place.uid, 3);
    }

    #[test]
    fn test_ties_keep_snapshot_order() {
        let places = vec![place(7, 362, 50.0, 1), place(4, 362, 50.0, 1), place(9, 362, 50.0, 1)];

        for _ in 0..3 {
            let ids: Vec<u64> = select(&places, 362, CENTER, 500.0, 2)
                .iter()
                .map(|c| c.place.uid)
                .collect();
            assert_eq!(ids, vec![7, 4]);
        }
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        assert!(select(&[], 362, CENTER, 500.0, 3).is_empty());
        assert!(select(&[place(1, 362, 900.0, 1)], 362, CENTER, 500.0, 3).is_empty());
        assert!(select(&[place(1, 362, 10.0, 1)], 362, CENTER, 500.0, 0).is_empty());
    }

    #[test]
    fn test_snapshot_is_not_mutated() {
        let places = vec![place(1, 362, 100.0, 1)];
        let before = places.clone();
        let _ = select(&places, 362, CENTER, 500.0, 3);
        assert_eq!(places, before);
    }

    #[test]
    fn test_random_snapshots_respect_limit_radius_and_order() {
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let places: Vec<Place> = (0..rng.gen_range(0..60))
                .map(|uid| Place {
                    uid,
                    name: String::new(),
                    city_id: rng.gen_range(1..=3),
                    lat: CENTER.lat + rng.gen_range(-0.01..0.01),
                    lon: CENTER.lon + rng.gen_range(-0.01..0.01),
                    bikes_available_to_rent: rng.gen_range(0..3),
                })
                .collect();
            let radius = rng.gen_range(0.0..1500.0);
            let limit = rng.gen_range(0..6);

            let selected = select(&places, 2, CENTER, radius, limit);

            assert!(selected.len() <= limit);
            for candidate in &selected {
                assert_eq!(candidate.place.city_id, 2);
                assert!(candidate.distance <= radius);
                assert!(candidate.place.bikes_available_to_rent > 0);
            }
            assert!(selected.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_parse_snapshot_and_lookups() {
        let snapshot = LocationSnapshot::from_json(SAMPLE_SNAPSHOT.as_bytes()).unwrap();

        assert_eq!(snapshot.places.len(), 4);
        assert_eq!(snapshot.city_names(), vec!["Berlin".to_string()]);
        assert_eq!(snapshot.city_by_name("Berlin").map(|c| c.uid), Some(362));
        assert_eq!(snapshot.timezone_for_city(362), Some("Europe/Berlin"));
        assert_eq!(snapshot.timezone_for_city(4242), None);
        assert_eq!(snapshot.bikes_in_city(362).count(), 2);
    }

    #[test]
    fn test_malformed_snapshot_is_data_error() {
        let raw = br#"{"countries": [], "cities": [], "places": [{"uid": 1}]}"#;
        assert!(matches!(
            LocationSnapshot::from_json(raw),
            Err(RadarError::Data(_))
        ));
    }
}
