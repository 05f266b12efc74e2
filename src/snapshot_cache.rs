// Read-through store for the latest location snapshot.
// The feed is pulled on its own (slower) cadence; every controller tick reads
// whatever was stored last.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{api::ResourceApi, config::CacheConfig, error::RadarError, locations::LocationSnapshot};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub places_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub stale_count: usize,
    pub refresh_count: usize,
    pub failed_refresh_count: usize,
}

struct CacheEntry {
    snapshot: Arc<LocationSnapshot>,
    refreshed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SnapshotCache {
    config: CacheConfig,
    entry: RwLock<Option<CacheEntry>>,
    cache_stats: RwLock<CacheStats>,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// A cache pre-loaded with a fixed snapshot.
    pub fn with_snapshot(config: CacheConfig, snapshot: LocationSnapshot) -> Self {
        let cache = Self::new(config);
        cache.store_at(snapshot, Utc::now());
        cache
    }

    pub fn store(&self, snapshot: LocationSnapshot) {
        self.store_at(snapshot, Utc::now());
    }

    pub fn store_at(&self, snapshot: LocationSnapshot, refreshed_at: DateTime<Utc>) {
        {
            let mut stats = self.cache_stats.write();
            stats.places_count = snapshot.places.len();
            stats.refresh_count += 1;
        }
        *self.entry.write() = Some(CacheEntry {
            snapshot: Arc::new(snapshot),
            refreshed_at,
        });
    }

    pub fn get(&self) -> Result<Arc<LocationSnapshot>, RadarError> {
        self.get_at(Utc::now())
    }

    /// Latest snapshot, or `Data` if nothing was stored yet or the stored one
    /// is older than `max_age_seconds` at `now`.
    pub fn get_at(&self, now: DateTime<Utc>) -> Result<Arc<LocationSnapshot>, RadarError> {
        let entry = self.entry.read();
        let Some(entry) = entry.as_ref() else {
            self.cache_stats.write().miss_count += 1;
            return Err(RadarError::Data("no location snapshot loaded yet".to_string()));
        };

        let age = now.signed_duration_since(entry.refreshed_at);
        if age.num_seconds() > self.config.max_age_seconds as i64 {
            self.cache_stats.write().stale_count += 1;
            return Err(RadarError::Data(format!(
                "location snapshot is stale ({}s old)",
                age.num_seconds()
            )));
        }

        self.cache_stats.write().hit_count += 1;
        Ok(entry.snapshot.clone())
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.entry.read().as_ref().map(|e| e.refreshed_at)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache_stats.read().clone()
    }

    /// Pulls the full feed once. On failure the previous snapshot is kept.
    pub async fn refresh(&self, api: &dyn ResourceApi) -> Result<(), RadarError> {
        match api.list_locations(None).await {
            Ok(snapshot) => {
                debug!(places = snapshot.places.len(), "location snapshot refreshed");
                self.store(snapshot);
                Ok(())
            }
            Err(e) => {
                self.cache_stats.write().failed_refresh_count += 1;
                warn!(error = %e, "location snapshot refresh failed");
                Err(e)
            }
        }
    }

    pub fn spawn_refresher(self: Arc<Self>, api: Arc<dyn ResourceApi>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        info!(?interval, "starting location snapshot refresher");

        tokio::spawn(async move {
            loop {
                let _ = self.refresh(api.as_ref()).await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}
