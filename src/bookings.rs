// Current-booking reconciliation against the remote reservation list.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    api::ResourceApi,
    error::RadarError,
    geo::{distance, Coordinate},
    session::Session,
};

/// Remote status code of a reservation that currently blocks a bike.
pub const BOOKING_ACTIVE: i64 = 5;

pub const NO_ACTIVE_BOOKING: &str = "Status: You have no active bookings.";

// A reservation as listed by the remote service. Unknown fields are ignored,
// missing ones fail the whole decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingState {
    pub id: u64,
    pub place_id: u64,
    pub place_name: String,
    pub lat: f64,
    #[serde(rename = "lng")]
    pub lon: f64,
    pub start_time: i64,
    #[serde(rename = "bike_blocking_time_seconds")]
    pub duration_seconds: i64,
    #[serde(rename = "state_id")]
    pub status: i64,
    #[serde(skip)]
    pub distance: Option<f64>,
}

impl BookingState {
    pub fn is_active(&self) -> bool {
        self.status == BOOKING_ACTIVE
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        let end = self.start_time.checked_add(self.duration_seconds)?;
        Utc.timestamp_opt(end, 0).single()
    }
}

/// Human-readable status for the booking derived this tick.
pub fn render_status(
    booking: Option<&BookingState>,
    timezone: Option<&str>,
    time_format: &str,
) -> String {
    let Some(booking) = booking.filter(|b| b.is_active()) else {
        return NO_ACTIVE_BOOKING.to_string();
    };

    let tz = timezone.and_then(|name| name.parse::<Tz>().ok()).unwrap_or(Tz::UTC);
    let until = booking
        .ends_at()
        .map(|end| end.with_timezone(&tz).format(time_format).to_string())
        .unwrap_or_else(|| "--:--".to_string());

    match booking.distance {
        Some(d) => format!(
            "Status: Booked {} in {} m distance until {}.",
            booking.place_name,
            d.round() as i64,
            until
        ),
        None => format!("Status: Booked {} until {}.", booking.place_name, until),
    }
}

pub struct Reconciler {
    api: Arc<dyn ResourceApi>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self { api }
    }

    /// Derives the caller's current booking from the remote reservation list.
    ///
    /// The remote list is in creation order, so the last entry is taken as
    /// authoritative whatever its status. When it is active and the session
    /// has a search centre, its distance from that centre is attached.
    pub async fn reconcile(&self, session: &Session) -> Result<Option<BookingState>, RadarError> {
        let token = session
            .token
            .as_deref()
            .ok_or_else(|| RadarError::Auth("You need to log in first".to_string()))?;

        let mut bookings = self.api.list_bookings(token).await?;
        let Some(mut last) = bookings.pop() else {
            debug!("no bookings found");
            return Ok(None);
        };

        if last.is_active() {
            last.distance = session.center().map(|c| distance(c, last.coordinate()));
            info!(
                booking_id = last.id,
                place_id = last.place_id,
                distance = ?last.distance,
                "active booking found"
            );
        } else {
            debug!(booking_id = last.id, status = last.status, "last booking is not active");
        }

        Ok(Some(last))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::mock_server::{MockResourceApi, ServerMode};
    use crate::locations::tests::{lat_offset, CENTER};

    pub(crate) fn booking(id: u64, status: i64, meters_north: f64) -> BookingState {
        BookingState {
            id,
            place_id: 1000 + id,
            place_name: format!("Station {id}"),
            lat: CENTER.lat + lat_offset(meters_north),
            lon: CENTER.lon,
            // 2024-05-01 10:00:00 UTC
            start_time: 1_714_557_600,
            duration_seconds: 900,
            status,
            distance: None,
        }
    }

    fn session() -> Session {
        let mut session = Session {
            city_id: 362,
            radius: 500,
            token: Some("token".to_string()),
            ..Default::default()
        };
        session.set_center(CENTER);
        session
    }

    #[test]
    fn test_decode_booking_requires_fields() {
        let raw = r#"{"id": 1, "place_id": 2, "place_name": "A", "lat": 52.5, "lng": 13.4,
            "start_time": 1714557600, "bike_blocking_time_seconds": 900, "state_id": 5,
            "booking_code": "X1"}"#;
        let booking: BookingState = serde_json::from_str(raw).unwrap();
        assert!(booking.is_active());
        assert_eq!(booking.distance, None);

        let missing = r#"{"id": 1, "place_id": 2, "lat": 52.5, "lng": 13.4}"#;
        assert!(serde_json::from_str::<BookingState>(missing).is_err());
    }

    #[test]
    fn test_render_status() {
        assert_eq!(render_status(None, None, "%H:%M"), NO_ACTIVE_BOOKING);
        assert_eq!(
            render_status(Some(&booking(1, 7, 0.0)), None, "%H:%M"),
            NO_ACTIVE_BOOKING
        );

        let mut active = booking(1, BOOKING_ACTIVE, 0.0);
        active.distance = Some(119.6);
        assert_eq!(
            render_status(Some(&active), None, "%H:%M"),
            "Status: Booked Station 1 in 120 m distance until 10:15."
        );
        // CEST is UTC+2 in May
        assert_eq!(
            render_status(Some(&active), Some("Europe/Berlin"), "%H:%M"),
            "Status: Booked Station 1 in 120 m distance until 12:15."
        );
        assert_eq!(
            render_status(Some(&active), Some("Not/AZone"), "%H:%M"),
            "Status: Booked Station 1 in 120 m distance until 10:15."
        );

        active.distance = None;
        assert_eq!(
            render_status(Some(&active), None, "%H:%M"),
            "Status: Booked Station 1 until 10:15."
        );
    }

    #[test]
    fn test_end_time_out_of_range() {
        let mut active = booking(1, BOOKING_ACTIVE, 0.0);
        active.start_time = i64::MAX;
        active.distance = Some(10.0);
        assert_eq!(active.ends_at(), None);
        assert_eq!(
            render_status(Some(&active), None, "%H:%M"),
            "Status: Booked Station 1 in 10 m distance until --:--."
        );

        active.start_time = 1_714_557_600;
        active.duration_seconds = i64::MIN;
        assert_eq!(active.ends_at(), None);
    }

    #[tokio::test]
    async fn test_reconcile_empty_list() {
        let server = Arc::new(MockResourceApi::new());
        let reconciler = Reconciler::new(server);
        assert_eq!(reconciler.reconcile(&session()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconcile_takes_last_booking() {
        let server = Arc::new(MockResourceApi::new());
        server.set_bookings(vec![booking(1, 6, 50.0), booking(2, BOOKING_ACTIVE, 200.0)]);
        let reconciler = Reconciler::new(server.clone());

        let current = reconciler.reconcile(&session()).await.unwrap().unwrap();
        assert_eq!(current.id, 2);
        assert!(current.is_active());
        let d = current.distance.unwrap();
        assert!((d - 200.0).abs() < 0.5, "got {d}");
    }

    #[tokio::test]
    async fn test_reconcile_inactive_last_booking_has_no_distance() {
        let server = Arc::new(MockResourceApi::new());
        server.set_bookings(vec![booking(1, BOOKING_ACTIVE, 50.0), booking(2, 6, 200.0)]);
        let reconciler = Reconciler::new(server);

        let current = reconciler.reconcile(&session()).await.unwrap().unwrap();
        assert_eq!(current.id, 2);
        assert!(!current.is_active());
        assert_eq!(current.distance, None);
    }

    #[tokio::test]
    async fn test_reconcile_without_center_leaves_distance_undefined() {
        let server = Arc::new(MockResourceApi::new());
        server.set_bookings(vec![booking(1, BOOKING_ACTIVE, 50.0)]);
        let reconciler = Reconciler::new(server);
        let session = Session {
            token: Some("token".to_string()),
            ..Default::default()
        };

        let current = reconciler.reconcile(&session).await.unwrap().unwrap();
        assert!(current.is_active());
        assert_eq!(current.distance, None);
    }

    #[tokio::test]
    async fn test_reconcile_propagates_errors() {
        let server = Arc::new(MockResourceApi::new());
        let reconciler = Reconciler::new(server.clone());

        let anonymous = Session::default();
        assert!(matches!(
            reconciler.reconcile(&anonymous).await,
            Err(RadarError::Auth(_))
        ));

        server.set_mode(ServerMode::CompleteOutage);
        assert!(matches!(
            reconciler.reconcile(&session()).await,
            Err(RadarError::Transport(_))
        ));
    }
}
