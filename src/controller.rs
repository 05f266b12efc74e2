// Auto-booking control loop.
//
// Each tick reconciles the current booking, ranks nearby places and, when a
// strictly closer bookable place shows up, swaps the booking over to it.
// Remote failures stop at the tick boundary: the caller gets a status line and
// an unchanged session, and the next tick starts from scratch. Failures that a
// retry cannot fix (rejected token, missing centre) switch the radar off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    api::ResourceApi,
    bookings::{render_status, BookingState, Reconciler},
    config::RadarConfig,
    error::RadarError,
    geo::distance,
    locations::{select, Candidate},
    markers::MapMarkers,
    session::{RadarState, Session, Update},
    snapshot_cache::SnapshotCache,
};

pub const WAITING_STATUS: &str = "Status: Please wait. Retrieving current status.";
pub const DISABLED_STATUS: &str = "Status: Auto booking disabled.";

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub session: Update<Session>,
    pub status: String,
    pub markers: Update<MapMarkers>,
}

impl TickOutcome {
    fn unchanged(status: String) -> Self {
        Self {
            session: Update::Unchanged,
            status,
            markers: Update::Unchanged,
        }
    }
}

pub struct AutoBookingController {
    api: Arc<dyn ResourceApi>,
    snapshots: Arc<SnapshotCache>,
    reconciler: Reconciler,
    config: RadarConfig,
}

impl AutoBookingController {
    pub fn new(
        api: Arc<dyn ResourceApi>,
        snapshots: Arc<SnapshotCache>,
        config: RadarConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(api.clone()),
            api,
            snapshots,
            config,
        }
    }

    pub fn config(&self) -> &RadarConfig {
        &self.config
    }

    /// Starts a session for the named city using the cached snapshot.
    pub fn select_city(&self, name: &str) -> Result<Session, RadarError> {
        let snapshot = self.snapshots.get()?;
        let city = snapshot
            .city_by_name(name)
            .ok_or_else(|| RadarError::Validation(format!("Unknown city {name}")))?;
        let timezone = snapshot.timezone_for_city(city.uid);

        info!(city_id = city.uid, city = %city.name, ?timezone, "city selected");
        Ok(Session::for_city(city, timezone, &self.config))
    }

    pub async fn login(
        &self,
        session: &Session,
        identity: &str,
        secret: &str,
    ) -> Result<Session, RadarError> {
        if identity.trim().is_empty() || secret.trim().is_empty() {
            return Err(RadarError::Validation(
                "Please enter your Nextbike phone and PIN.".to_string(),
            ));
        }

        let token = self.api.authenticate(identity, secret).await?;
        let mut next = session.clone();
        next.token = Some(token);
        Ok(next)
    }

    pub fn enable(&self, session: &Session, now: DateTime<Utc>) -> Result<Session, RadarError> {
        if session.center().is_none() {
            return Err(RadarError::Validation(
                "You need to set a location first".to_string(),
            ));
        }
        if session.token.is_none() {
            return Err(RadarError::Validation("You need to log in first".to_string()));
        }

        let mut next = session.clone();
        next.enabled = true;
        next.exceeded = false;
        next.session_start_ts = Some(now.timestamp());
        next.last_status = Some(WAITING_STATUS.to_string());

        info!(city_id = next.city_id, radius = next.radius, "auto booking enabled");
        Ok(next)
    }

    // Stops automatic rebooking only. An active booking stays with the user.
    pub fn disable(&self, session: &Session) -> Session {
        let mut next = session.clone();
        next.enabled = false;
        next.exceeded = false;
        next.last_status = Some(DISABLED_STATUS.to_string());

        info!(booked = next.booked, "auto booking disabled");
        next
    }

    pub fn toggle(&self, session: &Session, now: DateTime<Utc>) -> Result<Session, RadarError> {
        if session.enabled {
            Ok(self.disable(session))
        } else {
            self.enable(session, now)
        }
    }

    pub async fn tick(&self, session: &Session) -> TickOutcome {
        self.tick_at(session, Utc::now()).await
    }

    pub async fn tick_at(&self, session: &Session, now: DateTime<Utc>) -> TickOutcome {
        match session.state() {
            RadarState::Idle => {
                let status = session.last_status.clone();
                return TickOutcome::unchanged(status.unwrap_or_else(|| DISABLED_STATUS.to_string()));
            }
            RadarState::Exceeded => {
                let status = session.last_status.clone();
                return TickOutcome::unchanged(status.unwrap_or_else(|| self.max_duration_status()));
            }
            RadarState::Searching | RadarState::Booked => {}
        }

        if self.duration_exceeded(session, now) {
            let status = self.max_duration_status();
            info!(
                session_start_ts = ?session.session_start_ts,
                "max session duration reached, auto booking stopped"
            );

            let mut next = session.clone();
            next.exceeded = true;
            next.last_status = Some(status.clone());
            return TickOutcome {
                session: Update::Updated(next),
                status,
                markers: Update::Unchanged,
            };
        }

        match self.evaluate(session, now).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "tick failed, retrying next tick");
                TickOutcome::unchanged(format!("Error booking bike: {e}"))
            }
            Err(e) => {
                warn!(error = %e, "tick failed, auto booking stopped");
                let status = format!("Error booking bike: {e}");

                // needs user action before another attempt
                let mut next = session.clone();
                next.enabled = false;
                if matches!(e, RadarError::Auth(_)) {
                    next.token = None;
                }
                next.last_status = Some(status.clone());
                TickOutcome {
                    session: Update::Updated(next),
                    status,
                    markers: Update::Unchanged,
                }
            }
        }
    }

    fn duration_exceeded(&self, session: &Session, now: DateTime<Utc>) -> bool {
        // enabled without a start time: never run unbounded
        let Some(start) = session.session_start_ts else {
            return true;
        };
        now.timestamp() - start >= self.config.max_session_duration.as_secs() as i64
    }

    fn max_duration_status(&self) -> String {
        format!(
            "Status: Auto booking stopped, reached max duration of {} minutes. \
             Disable and enable again to start a new session.",
            self.config.max_session_duration.as_secs() / 60
        )
    }

    async fn evaluate(&self, session: &Session, now: DateTime<Utc>) -> Result<TickOutcome, RadarError> {
        let center = session
            .center()
            .ok_or_else(|| RadarError::Validation("You need to set a location first".to_string()))?;
        let token = session
            .token
            .as_deref()
            .ok_or_else(|| RadarError::Auth("You need to log in first".to_string()))?;

        let mut current = self.reconciler.reconcile(session).await?;

        let snapshot = self.snapshots.get_at(now)?;
        let candidates = select(
            &snapshot.places,
            session.city_id,
            center,
            f64::from(session.radius),
            self.config.max_candidates,
        );
        if candidates.is_empty() {
            info!("no near bikes found");
        }

        let active = current.as_ref().filter(|b| b.is_active());
        if let Some(mut booked) = self.book_nearest(token, active, &candidates).await? {
            current = match self.reconciler.reconcile(session).await {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    // the booking went through, only the confirmation failed
                    warn!(
                        error = %e,
                        booking_id = booked.id,
                        "using booking response as current booking"
                    );
                    booked.distance = Some(distance(center, booked.coordinate()));
                    Some(booked)
                }
            };
        }

        let active = current.as_ref().filter(|b| b.is_active());
        let status = render_status(
            active,
            session.timezone.as_deref(),
            &self.config.booking_time_format,
        );

        let mut next = session.clone();
        next.booked = active.is_some();
        next.booking_id = active.map(|b| b.id);
        next.last_status = Some(status.clone());

        let markers = if next.booking_id != session.booking_id {
            Update::Updated(MapMarkers::build(&snapshot, session.city_id, active))
        } else {
            Update::Unchanged
        };
        let session = if next == *session {
            Update::Unchanged
        } else {
            Update::Updated(next)
        };

        Ok(TickOutcome {
            session,
            status,
            markers,
        })
    }

    /// Books the first candidate, nearest first, that is strictly closer than
    /// the active booking and can actually be reserved. An active booking is
    /// cancelled first; if that fails nothing is booked this tick.
    async fn book_nearest(
        &self,
        token: &str,
        active: Option<&BookingState>,
        candidates: &[Candidate],
    ) -> Result<Option<BookingState>, RadarError> {
        for candidate in candidates {
            let place_id = candidate.place.uid;

            if let Some(active) = active {
                match active.distance {
                    Some(current) if candidate.distance < current => {}
                    current => {
                        debug!(
                            place_id,
                            distance = candidate.distance,
                            ?current,
                            "not closer than current booking"
                        );
                        continue;
                    }
                }
            }

            let info = self.api.booking_info(token, place_id).await?;
            if !info.is_bookable() {
                warn!(place_id, "bike can only be rented but not booked");
                continue;
            }

            if let Some(active) = active {
                info!(booking_id = active.id, "active booking found, cancelling it first");
                if !self.api.cancel_booking(token, active.id).await? {
                    error!(booking_id = active.id, "could not cancel current booking");
                    return Err(RadarError::BookingConflict {
                        booking_id: active.id,
                    });
                }
            }

            let booking = self.api.book(token, place_id).await?;
            info!(
                booking_id = booking.id,
                place_id,
                distance = candidate.distance,
                "bike booked"
            );
            return Ok(Some(booking));
        }

        debug!("no (new) bikes booked");
        Ok(None)
    }
}
