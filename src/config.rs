//! Pipeline configuration
//!
//! Tunables for ranking, fraud sampling, pacing and attribution. Loaded from a
//! TOML file with per-field defaults; endpoints and secrets come from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of ranked campaigns returned per ad request
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Campaign snapshot TTL (seconds)
    #[serde(default = "default_campaign_cache_ttl_secs")]
    pub campaign_cache_ttl_secs: u64,

    /// Idempotency window for impressions and clicks (seconds). IAB counting window;
    /// values below 24h are raised to 24h.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub fraud: FraudConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub attribution: AttributionConfig,
}

fn default_top_n() -> usize {
    3
}

fn default_campaign_cache_ttl_secs() -> u64 {
    300
}

/// Impressions and clicks are counted at most once per day.
pub const MIN_DEDUP_WINDOW_SECS: u64 = 86_400;

fn default_dedup_window_secs() -> u64 {
    MIN_DEDUP_WINDOW_SECS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            campaign_cache_ttl_secs: default_campaign_cache_ttl_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            ranking: RankingConfig::default(),
            fraud: FraudConfig::default(),
            pacing: PacingConfig::default(),
            attribution: AttributionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        if config.dedup_window_secs < MIN_DEDUP_WINDOW_SECS {
            tracing::warn!(
                "dedup_window_secs = {} is below {}, using {}",
                config.dedup_window_secs,
                MIN_DEDUP_WINDOW_SECS,
                MIN_DEDUP_WINDOW_SECS
            );
        }
        Ok(config)
    }

    /// Load from `ADSERVE_CONFIG_PATH` (or `adserve.toml`), then apply environment overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("ADSERVE_CONFIG_PATH").unwrap_or_else(|_| "adserve.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pipeline config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FRAUD_API_URL") {
            if !v.trim().is_empty() {
                self.fraud.api_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("FRAUD_API_KEY") {
            if !v.trim().is_empty() {
                self.fraud.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("FRAUD_DAILY_QUOTA") {
            if let Ok(quota) = v.parse() {
                self.fraud.daily_quota = quota;
            }
        }
        if let Ok(v) = std::env::var("ATTRIBUTION_WINDOW_DAYS") {
            if let Ok(days) = v.parse() {
                self.attribution.default_window_days = days;
            }
        }
        if let Ok(v) = std::env::var("TOP_N") {
            if let Ok(n) = v.parse::<usize>() {
                self.top_n = n.max(1);
            }
        }
    }

    pub fn campaign_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.campaign_cache_ttl_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs.max(MIN_DEDUP_WINDOW_SECS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// CTR assumed for CPC campaigns without enough history
    #[serde(default = "default_ctr")]
    pub default_ctr: f64,

    /// Impressions required before historical CTR is trusted
    #[serde(default = "default_min_impressions_for_ctr")]
    pub min_impressions_for_ctr: u64,
}

fn default_ctr() -> f64 {
    0.005
}

fn default_min_impressions_for_ctr() -> u64 {
    100
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            default_ctr: default_ctr(),
            min_impressions_for_ctr: default_min_impressions_for_ctr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    /// Scoring endpoint; SIVT is skipped when unset
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Paid scorer calls per UTC day
    #[serde(default = "default_daily_quota")]
    pub daily_quota: i64,

    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,

    /// Per-IP score cache TTL (seconds)
    #[serde(default = "default_score_cache_ttl_secs")]
    pub score_cache_ttl_secs: u64,

    /// GIVT: events per IP per minute before the rate heuristic trips
    #[serde(default = "default_max_events_per_ip_per_minute")]
    pub max_events_per_ip_per_minute: i64,

    /// GIVT: additional datacenter CIDR ranges
    #[serde(default)]
    pub extra_datacenter_ranges: Vec<String>,

    /// Clicks faster than this after their impression are suspicious
    #[serde(default = "default_fast_click_ms")]
    pub fast_click_ms: i64,
}

fn default_daily_quota() -> i64 {
    1000
}

fn default_api_timeout_ms() -> u64 {
    2000
}

fn default_score_cache_ttl_secs() -> u64 {
    7200
}

fn default_max_events_per_ip_per_minute() -> i64 {
    120
}

fn default_fast_click_ms() -> i64 {
    1000
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            daily_quota: default_daily_quota(),
            api_timeout_ms: default_api_timeout_ms(),
            score_cache_ttl_secs: default_score_cache_ttl_secs(),
            max_events_per_ip_per_minute: default_max_events_per_ip_per_minute(),
            extra_datacenter_ranges: Vec::new(),
            fast_click_ms: default_fast_click_ms(),
        }
    }
}

impl FraudConfig {
    pub fn score_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.score_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Head start added to the elapsed fraction of the day (seconds)
    #[serde(default = "default_grace_secs")]
    pub grace_secs: i64,

    /// Max hourly spend as a multiple of an even hourly share of the daily budget
    #[serde(default = "default_hourly_burst_multiplier")]
    pub hourly_burst_multiplier: f64,
}

fn default_grace_secs() -> i64 {
    3600
}

fn default_hourly_burst_multiplier() -> f64 {
    3.0
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            hourly_burst_multiplier: default_hourly_burst_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_window_days")]
    pub default_window_days: i64,

    /// How long a conversion marker short-circuits duplicate lookups (seconds)
    #[serde(default = "default_marker_ttl_secs")]
    pub duplicate_marker_ttl_secs: u64,
}

fn default_window_days() -> i64 {
    30
}

fn default_marker_ttl_secs() -> u64 {
    3600
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            default_window_days: default_window_days(),
            duplicate_marker_ttl_secs: default_marker_ttl_secs(),
        }
    }
}
