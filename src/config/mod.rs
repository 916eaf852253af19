//! Environment-driven configuration.
//!
//! Backoff parameters and staleness thresholds are deliberately configurable
//! rather than hard-coded; the defaults below are conservative.

use std::time::Duration;

use crate::cursor::EntityType;

/// Process configuration, read once at startup from `ADSYNC_*` env vars.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum concurrent account claims per operator.
    pub claim_limit: usize,
    /// How long a claim stays active before it is treated as released.
    pub claim_ttl: Duration,

    /// Remote API requests per minute per credential.
    pub rate_limit_per_minute: u64,
    /// Bounded attempt count per page (RateLimited/Transient retries).
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Per-entity resync thresholds: skip dispatch while the cursor is fresher.
    pub staleness_account: Duration,
    pub staleness_campaign: Duration,
    pub staleness_ad: Duration,
    pub staleness_insight: Duration,

    /// Terminal jobs older than this are archived by the janitor.
    pub job_retention: Duration,
    /// Running jobs whose started_at is older than this are reclaimed.
    pub liveness_timeout: Duration,
    pub janitor_interval: Duration,

    pub worker_count: usize,
    pub worker_poll_interval: Duration,

    pub bind_addr: String,
    pub data_dir: String,
    pub ads_api_base_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            claim_limit: 5,
            claim_ttl: Duration::from_secs(24 * 3600),
            rate_limit_per_minute: 200,
            retry_max_attempts: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            staleness_account: Duration::from_secs(24 * 3600),
            staleness_campaign: Duration::from_secs(6 * 3600),
            staleness_ad: Duration::from_secs(6 * 3600),
            staleness_insight: Duration::from_secs(3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
            liveness_timeout: Duration::from_secs(3600),
            janitor_interval: Duration::from_secs(300),
            worker_count: 2,
            worker_poll_interval: Duration::from_secs(5),
            bind_addr: "0.0.0.0:3000".to_string(),
            data_dir: "./data".to_string(),
            ads_api_base_url: "https://graph.example.com/v19.0".to_string(),
        }
    }
}

impl SyncConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        read_usize("ADSYNC_CLAIM_LIMIT", &mut cfg.claim_limit);
        read_hours("ADSYNC_CLAIM_TTL_HOURS", &mut cfg.claim_ttl);
        read_u64("ADSYNC_RATE_LIMIT_PER_MINUTE", &mut cfg.rate_limit_per_minute);
        read_u32("ADSYNC_RETRY_MAX_ATTEMPTS", &mut cfg.retry_max_attempts);
        read_millis("ADSYNC_RETRY_BASE_DELAY_MS", &mut cfg.retry_base_delay);
        read_millis("ADSYNC_RETRY_MAX_DELAY_MS", &mut cfg.retry_max_delay);
        read_hours("ADSYNC_STALENESS_ACCOUNT_HOURS", &mut cfg.staleness_account);
        read_hours("ADSYNC_STALENESS_CAMPAIGN_HOURS", &mut cfg.staleness_campaign);
        read_hours("ADSYNC_STALENESS_AD_HOURS", &mut cfg.staleness_ad);
        read_hours("ADSYNC_STALENESS_INSIGHT_HOURS", &mut cfg.staleness_insight);
        read_hours("ADSYNC_JOB_RETENTION_HOURS", &mut cfg.job_retention);
        read_minutes("ADSYNC_LIVENESS_TIMEOUT_MINUTES", &mut cfg.liveness_timeout);
        read_secs("ADSYNC_JANITOR_INTERVAL_SECS", &mut cfg.janitor_interval);
        read_usize("ADSYNC_WORKER_COUNT", &mut cfg.worker_count);
        read_secs("ADSYNC_WORKER_POLL_SECS", &mut cfg.worker_poll_interval);
        read_string("ADSYNC_BIND_ADDR", &mut cfg.bind_addr);
        read_string("ADSYNC_DATA_DIR", &mut cfg.data_dir);
        read_string("ADSYNC_ADS_API_BASE_URL", &mut cfg.ads_api_base_url);

        cfg
    }

    /// Staleness threshold for one entity type.
    pub fn staleness_for(&self, entity: EntityType) -> Duration {
        match entity {
            EntityType::Account => self.staleness_account,
            EntityType::Campaign => self.staleness_campaign,
            EntityType::Ad => self.staleness_ad,
            EntityType::Insight => self.staleness_insight,
        }
    }
}

fn read_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn read_usize(key: &str, target: &mut usize) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<usize>() {
            *target = n;
        }
    }
}

fn read_u32(key: &str, target: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u32>() {
            *target = n;
        }
    }
}

fn read_u64(key: &str, target: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = n;
        }
    }
}

fn read_secs(key: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = Duration::from_secs(n);
        }
    }
}

fn read_millis(key: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = Duration::from_millis(n);
        }
    }
}

fn read_minutes(key: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = Duration::from_secs(n * 60);
        }
    }
}

fn read_hours(key: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *target = Duration::from_secs(n * 3600);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.claim_limit, 5);
        assert_eq!(cfg.retry_max_attempts, 5);
        assert!(cfg.retry_base_delay < cfg.retry_max_delay);
        assert_eq!(cfg.liveness_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn staleness_varies_per_entity() {
        let cfg = SyncConfig::default();
        assert!(cfg.staleness_for(EntityType::Insight) < cfg.staleness_for(EntityType::Account));
        assert_eq!(
            cfg.staleness_for(EntityType::Campaign),
            cfg.staleness_for(EntityType::Ad)
        );
    }
}
