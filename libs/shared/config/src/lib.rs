use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub default_horizon_days: u32,
    pub max_horizon_days: u32,
    pub generation_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub clinic_utc_offset_minutes: i32,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, requests will use the anon key");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            default_horizon_days: parse_or("SLOT_DEFAULT_HORIZON_DAYS", 14),
            max_horizon_days: parse_or("SLOT_MAX_HORIZON_DAYS", 90),
            generation_timeout_seconds: parse_or("SLOT_GENERATION_TIMEOUT_SECONDS", 30),
            cache_ttl_seconds: parse_or("SLOT_CACHE_TTL_SECONDS", 300),
            sweep_interval_seconds: parse_or("SLOT_SWEEP_INTERVAL_SECONDS", 60),
            clinic_utc_offset_minutes: parse_or("CLINIC_UTC_OFFSET_MINUTES", 0),
            port: parse_or("PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Supabase not configured - slot data will be kept in memory only");
        }

        if config.default_horizon_days > config.max_horizon_days {
            warn!(
                "SLOT_DEFAULT_HORIZON_DAYS ({}) exceeds SLOT_MAX_HORIZON_DAYS ({})",
                config.default_horizon_days, config.max_horizon_days
            );
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Key used for server-side PostgREST calls. Falls back to the anon key.
    pub fn service_key(&self) -> &str {
        if self.supabase_service_role_key.is_empty() {
            &self.supabase_anon_key
        } else {
            &self.supabase_service_role_key
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_value<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    raw.trim().parse().unwrap_or_else(|_| {
        warn!("{} has invalid value {:?}, using default {}", key, raw, default);
        default
    })
}
