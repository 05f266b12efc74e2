use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{config::RadarConfig, error::RadarError, geo::Coordinate, locations::City};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarState {
    Idle,
    Searching,
    Booked,
    Exceeded,
}

/// Per-output result of a controller operation. `Unchanged` tells the caller
/// there is nothing to redraw or store.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    Unchanged,
    Updated(T),
}

impl<T> Update<T> {
    pub fn is_updated(&self) -> bool {
        matches!(self, Update::Updated(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Update::Unchanged => None,
            Update::Updated(value) => Some(value),
        }
    }

    // Keep `current` unless a new value arrived
    pub fn apply(self, current: &mut T) {
        if let Update::Updated(value) = self {
            *current = value;
        }
    }
}

// The user's radar configuration. Serialized as the state the caller keeps
// between ticks (e.g. browser-local storage); the controller never holds on
// to it.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius: u32,
    pub city_id: u64,
    pub token: Option<String>,
    pub enabled: bool,
    pub session_start_ts: Option<i64>,
    pub booked: bool,
    #[serde(default)]
    pub exceeded: bool,
    #[serde(default)]
    pub booking_id: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub zoom: u8,
    #[serde(default)]
    pub map_center: Option<Coordinate>,
    #[serde(default)]
    pub last_status: Option<String>,
}

impl Session {
    /// New session for a freshly selected city. The search centre stays unset
    /// until the user picks a point on the map.
    pub fn for_city(city: &City, timezone: Option<&str>, config: &RadarConfig) -> Self {
        Self {
            radius: config.default_radius,
            city_id: city.uid,
            timezone: timezone.map(str::to_string),
            zoom: city.zoom,
            map_center: Some(city.coordinate()),
            ..Default::default()
        }
    }

    pub fn center(&self) -> Option<Coordinate> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        }
    }

    pub fn set_center(&mut self, center: Coordinate) {
        let center = center.rounded();
        self.lat = Some(center.lat);
        self.lon = Some(center.lon);
    }

    pub fn set_radius(&mut self, radius: u32, config: &RadarConfig) -> Result<(), RadarError> {
        if !(config.min_radius..=config.max_radius).contains(&radius) {
            return Err(RadarError::Validation(format!(
                "Radius must be between {} and {} m",
                config.min_radius, config.max_radius
            )));
        }
        self.radius = radius;
        Ok(())
    }

    pub fn state(&self) -> RadarState {
        if !self.enabled {
            RadarState::Idle
        } else if self.exceeded {
            RadarState::Exceeded
        } else if self.booked {
            RadarState::Booked
        } else {
            RadarState::Searching
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("lat", &self.lat)
            .field("lon", &self.lon)
            .field("radius", &self.radius)
            .field("city_id", &self.city_id)
            .field("token", &self.token.as_ref().map(|_| "***redacted***"))
            .field("enabled", &self.enabled)
            .field("session_start_ts", &self.session_start_ts)
            .field("booked", &self.booked)
            .field("exceeded", &self.exceeded)
            .field("booking_id", &self.booking_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn berlin() -> City {
        City {
            uid: 362,
            name: "Berlin".to_string(),
            domain: "bn".to_string(),
            lat: 52.52,
            lon: 13.405,
            zoom: 12,
            available_bikes: 120,
        }
    }

    #[test]
    fn test_for_city() {
        let session = Session::for_city(&berlin(), Some("Europe/Berlin"), &RadarConfig::default());
        assert_eq!(session.city_id, 362);
        assert_eq!(session.radius, 500);
        assert_eq!(session.center(), None);
        assert_eq!(session.map_center, Some(Coordinate::new(52.52, 13.405)));
        assert_eq!(session.state(), RadarState::Idle);
    }

    #[test]
    fn test_set_radius_bounds() {
        let config = RadarConfig::default();
        let mut session = Session::default();

        assert!(session.set_radius(750, &config).is_ok());
        assert_eq!(session.radius, 750);

        assert!(matches!(
            session.set_radius(50, &config),
            Err(RadarError::Validation(_))
        ));
        assert!(session.set_radius(5000, &config).is_err());
        assert_eq!(session.radius, 750);
    }

    #[test]
    fn test_state_derivation() {
        let mut session = Session::default();
        assert_eq!(session.state(), RadarState::Idle);

        session.enabled = true;
        assert_eq!(session.state(), RadarState::Searching);

        session.booked = true;
        assert_eq!(session.state(), RadarState::Booked);

        session.exceeded = true;
        assert_eq!(session.state(), RadarState::Exceeded);

        session.enabled = false;
        assert_eq!(session.state(), RadarState::Idle);
    }

    #[test]
    fn test_persisted_shape() {
        let mut session = Session {
            radius: 500,
            city_id: 362,
            token: Some("abc".to_string()),
            enabled: true,
            session_start_ts: Some(1_714_557_600),
            ..Default::default()
        };
        session.set_center(Coordinate::new(52.52, 13.405));

        let value = serde_json::to_value(&session).unwrap();
        for key in ["lat", "lon", "radius", "city_id", "token", "enabled", "session_start_ts", "booked"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }

        // older stored state without the bookkeeping fields still loads
        let stored = r#"{"lat": 52.52, "lon": 13.405, "radius": 500, "city_id": 362,
            "token": null, "enabled": false, "session_start_ts": null, "booked": false}"#;
        let restored: Session = serde_json::from_str(stored).unwrap();
        assert_eq!(restored.center(), Some(Coordinate::new(52.52, 13.405)));
        assert!(!restored.exceeded);
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = Session {
            token: Some("loginkey-secret".to_string()),
            ..Default::default()
        };
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("loginkey-secret"));
        assert!(rendered.contains("***redacted***"));
    }

    #[test]
    fn test_update_apply() {
        let mut value = 1;
        Update::Unchanged.apply(&mut value);
        assert_eq!(value, 1);
        Update::Updated(5).apply(&mut value);
        assert_eq!(value, 5);
        assert!(Update::Updated(()).is_updated());
        assert_eq!(Update::<u8>::Unchanged.into_option(), None);
    }
}
