//! Sophisticated invalid traffic scoring
//! Mission: spend a limited daily quota of paid scorer calls where they matter.
//!
//! - Clicks are always scored, impressions are sampled by remaining quota
//! - Scores are cached per IP and reused whenever present
//! - Exhausted quota or scorer failure degrades to a neutral score

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FraudConfig;
use crate::keystore::{get_counter, KeyStore};
use crate::models::EventKind;

pub const NEUTRAL_SCORE: f64 = 0.5;

const QUOTA_KEY_TTL: Duration = Duration::from_secs(48 * 3600);

/// External fraud scoring service.
#[async_trait::async_trait]
pub trait FraudScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Fraud likelihood in [0, 1].
    async fn score(&self, ip: IpAddr, user_agent: Option<&str>) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(alias = "score")]
    fraud_score: f64,
}

/// HTTP scorer. The service answers `{"fraud_score": 0..100}`.
pub struct HttpFraudScorer {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpFraudScorer {
    pub fn new(api_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("adserve-backend/0.1")
            .build()
            .context("Failed to build fraud API client")?;

        Ok(Self {
            client,
            api_url,
            api_key,
        })
    }

    pub fn from_config(config: &FraudConfig) -> Result<Option<Self>> {
        match &config.api_url {
            Some(url) => Ok(Some(Self::new(
                url.clone(),
                config.api_key.clone(),
                Duration::from_millis(config.api_timeout_ms),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl FraudScorer for HttpFraudScorer {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, ip: IpAddr, user_agent: Option<&str>) -> Result<f64> {
        let ip = ip.to_string();
        let mut request = self.client.get(&self.api_url).query(&[("ip", ip.as_str())]);
        if let Some(ua) = user_agent {
            request = request.query(&[("user_agent", ua)]);
        }
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.context("Fraud API request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Fraud API error {}: {}", status, text);
        }

        let body: ScoreResponse = response
            .json()
            .await
            .context("Failed to parse fraud API response")?;
        Ok(normalize_score(body.fraud_score))
    }
}

/// Map the provider's 0–100 scale onto [0, 1].
pub fn normalize_score(raw: f64) -> f64 {
    if raw.is_nan() {
        return NEUTRAL_SCORE;
    }
    (raw / 100.0).clamp(0.0, 1.0)
}

/// Impression sampling rate for the remaining daily quota.
pub fn sample_rate(remaining_quota: i64) -> f64 {
    if remaining_quota < 100 {
        0.05
    } else if remaining_quota < 300 {
        0.10
    } else {
        0.15
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSource {
    Cache,
    Api,
    QuotaExhausted,
    ApiError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SivtVerdict {
    pub score: f64,
    pub source: ScoreSource,
}

pub struct SivtChecker {
    keystore: Arc<dyn KeyStore>,
    scorer: Option<Arc<dyn FraudScorer>>,
    daily_quota: i64,
    cache_ttl: Duration,
    rng: Mutex<StdRng>,
}

impl SivtChecker {
    pub fn new(
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: &FraudConfig,
    ) -> Self {
        Self::with_rng(keystore, scorer, config, StdRng::from_entropy())
    }

    /// Deterministic sampling for tests and replays.
    pub fn with_seed(
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: &FraudConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(keystore, scorer, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: &FraudConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            keystore,
            scorer,
            daily_quota: config.daily_quota,
            cache_ttl: config.score_cache_ttl(),
            rng: Mutex::new(rng),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.scorer.is_some()
    }

    fn quota_key(now: DateTime<Utc>) -> String {
        format!("sivt:quota:{}", now.format("%Y%m%d"))
    }

    fn ip_key(ip: IpAddr) -> String {
        format!("sivt:ip:{}", ip)
    }

    pub async fn remaining_quota(&self, now: DateTime<Utc>) -> Result<i64> {
        let used = get_counter(self.keystore.as_ref(), &Self::quota_key(now)).await?;
        Ok((self.daily_quota - used).max(0))
    }

    /// Score an event, or `None` when the stage does not apply (no scorer,
    /// no client IP, or the impression was not sampled).
    pub async fn check(
        &self,
        kind: EventKind,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SivtVerdict>> {
        let (Some(scorer), Some(ip)) = (self.scorer.as_ref(), ip) else {
            return Ok(None);
        };

        let ip_key = Self::ip_key(ip);
        if let Some(score) = self
            .keystore
            .get(&ip_key)
            .await?
            .and_then(|v| v.parse::<f64>().ok())
        {
            counter!("sivt_cache_hits_total", 1);
            return Ok(Some(SivtVerdict {
                score,
                source: ScoreSource::Cache,
            }));
        }

        if kind == EventKind::Impression {
            let rate = sample_rate(self.remaining_quota(now).await?);
            if !self.rng.lock().gen_bool(rate) {
                return Ok(None);
            }
        }

        let used = self
            .keystore
            .incr_by(&Self::quota_key(now), 1, Some(QUOTA_KEY_TTL))
            .await?;
        if used > self.daily_quota {
            counter!("sivt_quota_fallbacks_total", 1);
            debug!(used, quota = self.daily_quota, "fraud API quota exhausted");
            return Ok(Some(SivtVerdict {
                score: NEUTRAL_SCORE,
                source: ScoreSource::QuotaExhausted,
            }));
        }

        counter!("sivt_api_calls_total", 1);
        match scorer.score(ip, user_agent).await {
            Ok(score) => {
                let score = score.clamp(0.0, 1.0);
                if let Err(e) = self
                    .keystore
                    .set_with_ttl(&ip_key, &score.to_string(), self.cache_ttl)
                    .await
                {
                    warn!("Failed to cache fraud score for {}: {}", ip, e);
                }
                Ok(Some(SivtVerdict {
                    score,
                    source: ScoreSource::Api,
                }))
            }
            Err(e) => {
                counter!("sivt_api_errors_total", 1);
                warn!("⚠️ Fraud scorer {} failed, using neutral score: {}", scorer.name(), e);
                Ok(Some(SivtVerdict {
                    score: NEUTRAL_SCORE,
                    source: ScoreSource::ApiError,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use crate::test_support::StubScorer;

    fn ip() -> Option<IpAddr> {
        Some("203.0.113.7".parse().unwrap())
    }

    fn checker(
        keystore: Arc<MemoryKeyStore>,
        scorer: Arc<StubScorer>,
        quota: i64,
        seed: u64,
    ) -> SivtChecker {
        let config = FraudConfig {
            daily_quota: quota,
            ..FraudConfig::default()
        };
        SivtChecker::with_seed(keystore, Some(scorer), &config, seed)
    }

    #[test]
    fn test_sample_rate_steps() {
        assert_eq!(sample_rate(1000), 0.15);
        assert_eq!(sample_rate(300), 0.15);
        assert_eq!(sample_rate(299), 0.10);
        assert_eq!(sample_rate(100), 0.10);
        assert_eq!(sample_rate(99), 0.05);
        assert_eq!(sample_rate(0), 0.05);
    }

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(85.0), 0.85);
        assert_eq!(normalize_score(250.0), 1.0);
        assert_eq!(normalize_score(-3.0), 0.0);
        assert_eq!(normalize_score(f64::NAN), NEUTRAL_SCORE);
    }

    #[tokio::test]
    async fn test_clicks_always_scored_and_cached_per_ip() {
        let scorer = Arc::new(StubScorer::returning(0.2));
        let sivt = checker(Arc::new(MemoryKeyStore::new()), scorer.clone(), 1000, 7);
        let now = Utc::now();

        let first = sivt.check(EventKind::Click, ip(), None, now).await.unwrap().unwrap();
        assert_eq!(first.source, ScoreSource::Api);
        assert_eq!(first.score, 0.2);

        let second = sivt.check(EventKind::Click, ip(), None, now).await.unwrap().unwrap();
        assert_eq!(second.source, ScoreSource::Cache);
        assert_eq!(scorer.calls(), 1);

        // cached score is reused for impressions without sampling
        let imp = sivt
            .check(EventKind::Impression, ip(), None, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imp.source, ScoreSource::Cache);
        assert_eq!(sivt.remaining_quota(now).await.unwrap(), 999);
    }

    #[tokio::test]
    async fn test_impression_sampling_rate_is_roughly_fifteen_percent() {
        let keystore = Arc::new(MemoryKeyStore::new());
        let scorer = Arc::new(StubScorer::returning(0.1));
        let sivt = checker(keystore.clone(), scorer.clone(), 1_000_000, 42);
        let now = Utc::now();

        let mut scored = 0;
        for i in 0..2000 {
            let ip: IpAddr = format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256)
                .parse()
                .unwrap();
            if sivt
                .check(EventKind::Impression, Some(ip), None, now)
                .await
                .unwrap()
                .is_some()
            {
                scored += 1;
            }
        }
        assert!((220..=380).contains(&scored), "scored {}", scored);
        assert_eq!(scorer.calls(), scored);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_returns_neutral() {
        let scorer = Arc::new(StubScorer::returning(0.1));
        let keystore = Arc::new(MemoryKeyStore::new());
        let sivt = checker(keystore, scorer.clone(), 2, 1);
        let now = Utc::now();

        for i in 0..2 {
            let ip: IpAddr = format!("203.0.113.{}", i + 1).parse().unwrap();
            let v = sivt.check(EventKind::Click, Some(ip), None, now).await.unwrap().unwrap();
            assert_eq!(v.source, ScoreSource::Api);
        }
        let ip: IpAddr = "203.0.113.99".parse().unwrap();
        let v = sivt.check(EventKind::Click, Some(ip), None, now).await.unwrap().unwrap();
        assert_eq!(v.source, ScoreSource::QuotaExhausted);
        assert_eq!(v.score, NEUTRAL_SCORE);
        assert_eq!(scorer.calls(), 2);
        assert_eq!(sivt.remaining_quota(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scorer_failure_is_neutral_and_not_cached() {
        let scorer = Arc::new(StubScorer::failing());
        let sivt = checker(Arc::new(MemoryKeyStore::new()), scorer.clone(), 1000, 1);
        let now = Utc::now();

        for _ in 0..2 {
            let v = sivt.check(EventKind::Click, ip(), None, now).await.unwrap().unwrap();
            assert_eq!(v.source, ScoreSource::ApiError);
            assert_eq!(v.score, NEUTRAL_SCORE);
        }
        assert_eq!(scorer.calls(), 2);
    }

    #[tokio::test]
    async fn test_skipped_without_scorer_or_ip() {
        let config = FraudConfig::default();
        let keystore: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let disabled = SivtChecker::with_seed(keystore.clone(), None, &config, 1);
        assert!(!disabled.is_enabled());
        assert!(disabled
            .check(EventKind::Click, ip(), None, Utc::now())
            .await
            .unwrap()
            .is_none());

        let scorer: Arc<dyn FraudScorer> = Arc::new(StubScorer::returning(0.9));
        let enabled = SivtChecker::with_seed(keystore, Some(scorer), &config, 1);
        assert!(enabled
            .check(EventKind::Click, None, None, Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
