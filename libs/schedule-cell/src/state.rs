use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use shared_config::AppConfig;

use crate::clock::ClinicClock;
use crate::services::cache::ScheduleCache;
use crate::services::lock::GenerationLock;
use crate::store::{InMemoryScheduleStore, ScheduleStore, SupabaseScheduleStore};

/// Everything the schedule handlers and services share.
#[derive(Clone)]
pub struct ScheduleState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ScheduleStore>,
    pub cache: Arc<ScheduleCache>,
    pub locks: Arc<GenerationLock>,
    pub clock: ClinicClock,
}

impl ScheduleState {
    pub fn new(config: Arc<AppConfig>, store: Arc<dyn ScheduleStore>, locks: GenerationLock) -> Self {
        let cache = ScheduleCache::new(Duration::from_secs(config.cache_ttl_seconds));
        let clock = ClinicClock::new(config.clinic_utc_offset_minutes);

        Self {
            config,
            store,
            cache: Arc::new(cache),
            locks: Arc::new(locks),
            clock,
        }
    }

    /// Picks the store and lock backends the configuration allows.
    pub async fn from_config(config: Arc<AppConfig>) -> Self {
        let store: Arc<dyn ScheduleStore> = if config.is_configured() {
            info!("Using Supabase schedule store at {}", config.supabase_url);
            Arc::new(SupabaseScheduleStore::new(&config))
        } else {
            warn!("Supabase is not configured, schedule data is kept in memory only");
            Arc::new(InMemoryScheduleStore::new())
        };

        let locks = match &config.redis_url {
            Some(url) => {
                // A stuck holder releases after the generation ceiling plus a margin.
                let lease = Duration::from_secs(config.generation_timeout_seconds + 5);
                match GenerationLock::redis(url, lease).await {
                    Ok(lock) => lock,
                    Err(e) => {
                        warn!("Redis unavailable ({}), falling back to in-process generation locks", e);
                        GenerationLock::local()
                    }
                }
            }
            None => GenerationLock::local(),
        };

        Self::new(config, store, locks)
    }

    pub fn with_clock(mut self, clock: ClinicClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn generation_ceiling(&self) -> Duration {
        Duration::from_secs(self.config.generation_timeout_seconds)
    }
}
