use thiserror::Error;

// Failure classes surfaced by the radar. Every remote failure ends up as one of
// these and is rendered into a status line at the tick boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadarError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Validation(String),

    #[error("Could not cancel current booking {booking_id}")]
    BookingConflict { booking_id: u64 },

    #[error("Malformed data: {0}")]
    Data(String),

    #[error("API error: {code} - {message}")]
    Api { code: i64, message: String },
}

impl RadarError {
    /// Whether the next tick may retry the failed step on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            RadarError::Transport(_)
            | RadarError::BookingConflict { .. }
            | RadarError::Data(_)
            | RadarError::Api { .. } => true,
            RadarError::Auth(_) | RadarError::Validation(_) => false,
        }
    }
}

impl From<reqwest::Error> for RadarError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RadarError::Data(err.to_string())
        } else {
            RadarError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RadarError {
    fn from(err: serde_json::Error) -> Self {
        RadarError::Data(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(String),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: String, value: String },
}
