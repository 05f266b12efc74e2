// Remote booking service: the trait the radar talks to, the HTTP client for
// the live service, and an in-process mock used by the tests.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    bookings::BookingState,
    config::ClientConfig,
    error::{ConfigError, RadarError},
    locations::LocationSnapshot,
};

const LOGIN_FAILED: &str = "Login failed. Please check credentials and retry.";

// Eligibility of a place for pre-booking. Some places can be rented on the
// spot but not reserved ahead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingInfo {
    #[serde(default)]
    pub place: Option<BookingInfoPlace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingInfoPlace {
    #[serde(default)]
    pub bike_types: Vec<BikeTypeAvailability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BikeTypeAvailability {
    #[serde(default)]
    pub available: u32,
}

impl BookingInfo {
    pub fn bookable(available: bool) -> Self {
        Self {
            place: Some(BookingInfoPlace {
                bike_types: vec![BikeTypeAvailability {
                    available: available as u32,
                }],
            }),
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.place
            .as_ref()
            .and_then(|p| p.bike_types.first())
            .map_or(false, |t| t.available == 1)
    }
}

// Wire envelopes
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    user: LoginUser,
}

#[derive(Deserialize)]
struct LoginUser {
    loginkey: String,
}

#[derive(Deserialize)]
struct BookingsResponse {
    #[serde(default)]
    items: Vec<BookingState>,
}

#[derive(Deserialize)]
struct BookResponse {
    booking: BookingState,
}

#[derive(Deserialize)]
struct CancelResponse {
    #[serde(default)]
    booking: Option<serde_json::Value>,
}

/// Decodes a response body. The service reports failures in-band as
/// `{"error": {...}}`, often with a 200 status.
pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RadarError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    if let Some(err) = value.get("error") {
        let payload = serde_json::from_value::<ErrorPayload>(err.clone()).unwrap_or_else(|_| {
            ErrorPayload {
                code: 0,
                message: err.to_string(),
            }
        });
        return Err(RadarError::Api {
            code: payload.code,
            message: payload.message,
        });
    }
    Ok(serde_json::from_value(value)?)
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

#[async_trait]
pub trait ResourceApi: Send + Sync + 'static {
    // Exchange credentials for a token used by the privileged calls
    async fn authenticate(&self, identity: &str, secret: &str) -> Result<String, RadarError>;

    // Full countries/cities/places feed, optionally narrowed to one city
    async fn list_locations(&self, city_id: Option<u64>) -> Result<LocationSnapshot, RadarError>;

    async fn booking_info(&self, token: &str, place_id: u64) -> Result<BookingInfo, RadarError>;

    async fn book(&self, token: &str, place_id: u64) -> Result<BookingState, RadarError>;

    // Ok(false) means the service answered but did not cancel
    async fn cancel_booking(&self, token: &str, booking_id: u64) -> Result<bool, RadarError>;

    // All past and present bookings in creation order
    async fn list_bookings(&self, token: &str) -> Result<Vec<BookingState>, RadarError>;
}

#[derive(Clone)]
pub struct NextbikeClient {
    inner: reqwest::Client,
    base: Url,
    maps: Url,
    api_key: String,
}

impl NextbikeClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let parse = |name: &str, value: &str| {
            value.parse::<Url>().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value: value.to_string(),
            })
        };
        let base = parse("base_url", &config.base_url)?;
        let maps = parse("maps_url", &config.maps_url)?;

        let inner = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ConfigError::Invalid {
                name: "http client".to_string(),
                value: e.to_string(),
            })?;

        Ok(Self {
            inner,
            base,
            maps,
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RadarError> {
        self.base
            .join(path)
            .map_err(|e| RadarError::Transport(format!("error joining url: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Bytes, RadarError> {
        let response = request.send().await?;
        let status = response.status();
        let path = response.url().path().to_string();
        let body = response.bytes().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(%path, %status, "request rejected");
            return Err(RadarError::Auth("Not authorized. Please log in again.".to_string()));
        }
        if !status.is_success() {
            error!(%path, %status, "request failed");
            return Err(RadarError::Transport(format!("HTTP {status} from {path}")));
        }

        debug!(%path, bytes = body.len(), "response received");
        Ok(body)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        token: &str,
        params: &[(&str, String)],
    ) -> Result<T, RadarError> {
        let url = self.endpoint(endpoint)?;
        let mut query = vec![
            ("api_key", self.api_key.clone()),
            ("loginkey", token.to_string()),
        ];
        query.extend(params.iter().map(|(k, v)| (*k, v.clone())));

        let body = self.send(self.inner.get(url).query(&query)).await?;
        decode(&body)
    }
}

#[async_trait]
impl ResourceApi for NextbikeClient {
    async fn authenticate(&self, identity: &str, secret: &str) -> Result<String, RadarError> {
        info!("authenticating and requesting login key");
        let payload = serde_json::json!({
            "api_key": self.api_key,
            "mobile": identity,
            "pin": secret,
        });

        let body = self
            .send(self.inner.post(self.endpoint("login.json")?).json(&payload))
            .await?;

        match decode::<LoginResponse>(&body) {
            Ok(response) => {
                info!("authentication successful");
                Ok(response.user.loginkey)
            }
            Err(RadarError::Api { code, .. }) => {
                warn!(code, "authentication rejected");
                Err(RadarError::Auth(LOGIN_FAILED.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_locations(&self, city_id: Option<u64>) -> Result<LocationSnapshot, RadarError> {
        debug!(?city_id, "requesting locations");
        let mut query = vec![("api_key", self.api_key.clone()), ("bikes", "0".to_string())];
        if let Some(city_id) = city_id {
            query.push(("city", city_id.to_string()));
        }

        let body = self
            .send(self.inner.get(self.maps.clone()).query(&query))
            .await?;
        decode(&body)
    }

    async fn booking_info(&self, token: &str, place_id: u64) -> Result<BookingInfo, RadarError> {
        self.get("bookingInfo.json", token, &[("place", place_id.to_string())])
            .await
    }

    async fn book(&self, token: &str, place_id: u64) -> Result<BookingState, RadarError> {
        info!(place_id, "requesting booking");
        let response: BookResponse = self
            .get(
                "booking.json",
                token,
                &[("place", place_id.to_string()), ("num_bikes", "1".to_string())],
            )
            .await?;
        Ok(response.booking)
    }

    async fn cancel_booking(&self, token: &str, booking_id: u64) -> Result<bool, RadarError> {
        info!(booking_id, "requesting booking cancellation");
        let response: CancelResponse = self
            .get(
                "cancelBooking.json",
                token,
                &[("booking_id", booking_id.to_string())],
            )
            .await?;

        Ok(response
            .booking
            .as_ref()
            .and_then(|b| b.get("canceled"))
            .map_or(false, is_truthy))
    }

    async fn list_bookings(&self, token: &str) -> Result<Vec<BookingState>, RadarError> {
        debug!("requesting bookings");
        let response: BookingsResponse = self.get("bookings.json", token, &[]).await?;
        Ok(response.items)
    }
}

// In-process stand-in for the remote service. Keeps a reservation list that
// booking and cancellation act on, and records every call in order.
pub mod mock_server {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

    pub const BOOKING_CANCELED: i64 = 6;

    #[derive(Debug, Clone, Copy)]
    pub enum ServerMode {
        Normal,
        CompleteOutage,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ApiCall {
        Authenticate,
        ListLocations,
        BookingInfo(u64),
        Book(u64),
        CancelBooking(u64),
        ListBookings,
    }

    pub struct MockResourceApi {
        mode: AtomicU8,
        fail_next_requests: AtomicUsize,
        next_booking_id: AtomicU64,
        reject_cancellation: AtomicBool,
        credentials: Mutex<HashMap<String, String>>,
        snapshot: Mutex<LocationSnapshot>,
        bookings: Mutex<Vec<BookingState>>,
        not_bookable: Mutex<Vec<u64>>,
        scheduled_failures: Mutex<Vec<(ApiCall, usize)>>,
        calls: Mutex<Vec<ApiCall>>,
    }

    impl Default for MockResourceApi {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockResourceApi {
        pub fn new() -> Self {
            Self {
                mode: AtomicU8::new(0),
                fail_next_requests: AtomicUsize::new(0),
                next_booking_id: AtomicU64::new(1),
                reject_cancellation: AtomicBool::new(false),
                credentials: Mutex::new(HashMap::new()),
                snapshot: Mutex::new(LocationSnapshot::default()),
                bookings: Mutex::new(Vec::new()),
                not_bookable: Mutex::new(Vec::new()),
                scheduled_failures: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn set_mode(&self, mode: ServerMode) {
            let mode_value = match mode {
                ServerMode::Normal => 0,
                ServerMode::CompleteOutage => 1,
            };
            self.mode.store(mode_value, Ordering::SeqCst);
        }

        pub fn fail_next_requests(&self, count: usize) {
            self.fail_next_requests.store(count, Ordering::SeqCst);
        }

        /// Fails the `occurrence`-th upcoming request equal to `call` (1 is
        /// the very next one) with a transport error.
        pub fn fail_call(&self, call: ApiCall, occurrence: usize) {
            self.scheduled_failures.lock().push((call, occurrence.max(1)));
        }

        pub fn add_user(&self, identity: &str, secret: &str) {
            self.credentials
                .lock()
                .insert(identity.to_string(), secret.to_string());
        }

        pub fn set_snapshot(&self, snapshot: LocationSnapshot) {
            *self.snapshot.lock() = snapshot;
        }

        pub fn set_bookings(&self, bookings: Vec<BookingState>) {
            let max_id = bookings.iter().map(|b| b.id).max().unwrap_or(0);
            self.next_booking_id.fetch_max(max_id + 1, Ordering::SeqCst);
            *self.bookings.lock() = bookings;
        }

        pub fn bookings(&self) -> Vec<BookingState> {
            self.bookings.lock().clone()
        }

        pub fn set_bookable(&self, place_id: u64, bookable: bool) {
            let mut not_bookable = self.not_bookable.lock();
            not_bookable.retain(|id| *id != place_id);
            if !bookable {
                not_bookable.push(place_id);
            }
        }

        pub fn reject_cancellation(&self, reject: bool) {
            self.reject_cancellation.store(reject, Ordering::SeqCst);
        }

        pub fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().clone()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().clear();
        }

        // Calls that change remote state
        pub fn mutating_calls(&self) -> Vec<ApiCall> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, ApiCall::Book(_) | ApiCall::CancelBooking(_)))
                .collect()
        }

        fn handle(&self, call: ApiCall) -> Result<(), RadarError> {
            self.calls.lock().push(call.clone());

            if self.mode.load(Ordering::SeqCst) == 1 {
                return Err(RadarError::Transport("Service unavailable".to_string()));
            }

            let fail_count = self.fail_next_requests.load(Ordering::SeqCst);
            if fail_count > 0 {
                self.fail_next_requests
                    .store(fail_count - 1, Ordering::SeqCst);
                return Err(RadarError::Transport(
                    "HTTP 500 Internal Server Error".to_string(),
                ));
            }

            let mut scheduled = self.scheduled_failures.lock();
            if let Some(pos) = scheduled.iter().position(|(c, _)| *c == call) {
                if scheduled[pos].1 <= 1 {
                    scheduled.remove(pos);
                    return Err(RadarError::Transport(
                        "HTTP 503 Service Unavailable".to_string(),
                    ));
                }
                scheduled[pos].1 -= 1;
            }
            Ok(())
        }

        fn check_token(token: &str) -> Result<(), RadarError> {
            if token.is_empty() {
                return Err(RadarError::Auth(
                    "Not authorized. Please log in again.".to_string(),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceApi for MockResourceApi {
        async fn authenticate(&self, identity: &str, secret: &str) -> Result<String, RadarError> {
            self.handle(ApiCall::Authenticate)?;
            match self.credentials.lock().get(identity) {
                Some(expected) if expected == secret => Ok(format!("loginkey-{identity}")),
                _ => Err(RadarError::Auth(LOGIN_FAILED.to_string())),
            }
        }

        async fn list_locations(
            &self,
            city_id: Option<u64>,
        ) -> Result<LocationSnapshot, RadarError> {
            self.handle(ApiCall::ListLocations)?;
            let mut snapshot = self.snapshot.lock().clone();
            if let Some(city_id) = city_id {
                snapshot.cities.retain(|c| c.uid == city_id);
                snapshot.places.retain(|p| p.city_id == city_id);
            }
            Ok(snapshot)
        }

        async fn booking_info(
            &self,
            token: &str,
            place_id: u64,
        ) -> Result<BookingInfo, RadarError> {
            self.handle(ApiCall::BookingInfo(place_id))?;
            Self::check_token(token)?;
            let bookable = !self.not_bookable.lock().contains(&place_id);
            Ok(BookingInfo::bookable(bookable))
        }

        async fn book(&self, token: &str, place_id: u64) -> Result<BookingState, RadarError> {
            self.handle(ApiCall::Book(place_id))?;
            Self::check_token(token)?;

            let place = self
                .snapshot
                .lock()
                .places
                .iter()
                .find(|p| p.uid == place_id)
                .cloned()
                .ok_or_else(|| RadarError::Api {
                    code: 404,
                    message: format!("Unknown place {place_id}"),
                })?;

            let booking = BookingState {
                id: self.next_booking_id.fetch_add(1, Ordering::SeqCst),
                place_id,
                place_name: place.name,
                lat: place.lat,
                lon: place.lon,
                start_time: Utc::now().timestamp(),
                duration_seconds: 900,
                status: crate::bookings::BOOKING_ACTIVE,
                distance: None,
            };
            self.bookings.lock().push(booking.clone());
            Ok(booking)
        }

        async fn cancel_booking(&self, token: &str, booking_id: u64) -> Result<bool, RadarError> {
            self.handle(ApiCall::CancelBooking(booking_id))?;
            Self::check_token(token)?;

            if self.reject_cancellation.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut bookings = self.bookings.lock();
            match bookings
                .iter_mut()
                .find(|b| b.id == booking_id && b.is_active())
            {
                Some(booking) => {
                    booking.status = BOOKING_CANCELED;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn list_bookings(&self, token: &str) -> Result<Vec<BookingState>, RadarError> {
            self.handle(ApiCall::ListBookings)?;
            Self::check_token(token)?;
            Ok(self.bookings.lock().clone())
        }
    }
}
