use serde::Serialize;

use crate::{bookings::BookingState, geo::Coordinate, locations::LocationSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookedMarker {
    pub position: Coordinate,
    pub title: String,
}

// What the map layer draws: every place with a bike in the session city, plus
// the booked one highlighted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MapMarkers {
    pub bikes: Vec<Coordinate>,
    pub booked: Option<BookedMarker>,
}

impl MapMarkers {
    pub fn build(snapshot: &LocationSnapshot, city_id: u64, booking: Option<&BookingState>) -> Self {
        let booked = booking.filter(|b| b.is_active()).map(|b| BookedMarker {
            position: b.coordinate(),
            title: format!("Booked bike: {}", b.place_name),
        });

        Self {
            bikes: snapshot.bikes_in_city(city_id).map(|p| p.coordinate()).collect(),
            booked,
        }
    }
}
