// Bike radar: keeps the nearest bookable rental bike reserved around a point.

pub mod api;
pub mod bookings;
pub mod config;
pub mod controller;
pub mod error;
pub mod geo;
pub mod locations;
pub mod markers;
pub mod scheduler;
pub mod session;
pub mod snapshot_cache;

// Re-export key types for convenience
pub use api::{BookingInfo, NextbikeClient, ResourceApi};
pub use bookings::{render_status, BookingState, Reconciler};
pub use config::{CacheConfig, ClientConfig, RadarConfig, Settings};
pub use controller::{AutoBookingController, TickOutcome};
pub use error::{ConfigError, RadarError};
pub use geo::{distance, Coordinate};
pub use locations::{select, Candidate, City, LocationSnapshot, Place};
pub use markers::MapMarkers;
pub use scheduler::{RadarScheduler, TickReport};
pub use session::{RadarState, Session, Update};
pub use snapshot_cache::{CacheStats, SnapshotCache};
