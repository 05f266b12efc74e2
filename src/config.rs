use std::{env::VarError, fmt, str::FromStr, time::Duration};

use crate::error::ConfigError;

// Controller tunables
#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub max_candidates: usize,
    pub max_session_duration: Duration,
    pub tick_interval: Duration,
    pub min_radius: u32,
    pub max_radius: u32,
    pub default_radius: u32,
    pub booking_time_format: String,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            max_candidates: 3,
            max_session_duration: Duration::from_secs(20 * 60),
            tick_interval: Duration::from_secs(15),
            min_radius: 100,
            max_radius: 1000,
            default_radius: 500,
            booking_time_format: "%H:%M".to_string(),
        }
    }
}

// Remote booking service
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub maps_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.nextbike.net/api/v1.1/".to_string(),
            maps_url: "https://maps.nextbike.net/maps/nextbike-live.flatjson".to_string(),
            api_key: String::new(),
            timeout_ms: 20_000,
            user_agent: concat!("bike_radar/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("maps_url", &self.maps_url)
            .field("api_key", &"***redacted***")
            .field("timeout_ms", &self.timeout_ms)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

// Location snapshot store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub refresh_interval_seconds: u64,
    pub max_age_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 30,
            max_age_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub radar: RadarConfig,
    pub client: ClientConfig,
    pub cache: CacheConfig,
}

impl Settings {
    /// Builds settings from the process environment. Only the API key is
    /// mandatory; everything else falls back to the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        settings.client.api_key = env("NEXTBIKE_API_KEY")?;
        if let Some(url) = optional_env("BIKE_RADAR_BASE_URL")? {
            settings.client.base_url = url;
        }
        if let Some(url) = optional_env("BIKE_RADAR_MAPS_URL")? {
            settings.client.maps_url = url;
        }
        if let Some(timeout) = parsed_env("BIKE_RADAR_TIMEOUT_MS")? {
            settings.client.timeout_ms = timeout;
        }

        if let Some(limit) = parsed_env("BIKE_RADAR_MAX_CANDIDATES")? {
            settings.radar.max_candidates = limit;
        }
        if let Some(minutes) = parsed_env::<u64>("BIKE_RADAR_MAX_SESSION_MINUTES")? {
            settings.radar.max_session_duration = Duration::from_secs(minutes * 60);
        }
        if let Some(seconds) = parsed_env("BIKE_RADAR_TICK_SECONDS")? {
            settings.radar.tick_interval = Duration::from_secs(seconds);
        }
        if let Some(radius) = parsed_env("BIKE_RADAR_DEFAULT_RADIUS")? {
            settings.radar.default_radius = radius;
        }

        if let Some(seconds) = parsed_env("BIKE_RADAR_SNAPSHOT_REFRESH_SECONDS")? {
            settings.cache.refresh_interval_seconds = seconds;
        }
        if let Some(seconds) = parsed_env("BIKE_RADAR_SNAPSHOT_MAX_AGE_SECONDS")? {
            settings.cache.max_age_seconds = seconds;
        }

        Ok(settings)
    }
}

fn env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|e| match e {
        VarError::NotPresent => ConfigError::Missing(name.to_string()),
        VarError::NotUnicode(value) => ConfigError::Invalid {
            name: name.to_string(),
            value: value.to_string_lossy().into_owned(),
        },
    })
}

fn optional_env(name: &str) -> Result<Option<String>, ConfigError> {
    match env(name) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::Missing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parsed_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    optional_env(name)?
        .map(|value| {
            value.parse::<T>().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value,
            })
        })
        .transpose()
}
