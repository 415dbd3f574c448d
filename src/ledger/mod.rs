//! Budget ledger and pacing
//! Mission: no campaign ever spends past its total budget.
//!
//! Key properties:
//! - The spend guard is one conditional UPDATE; there is no read-then-write path
//! - Billing events commit together with their spend, or are stored unbilled
//! - Pacing counters and cache invalidation are side effects; their failures are logged only

pub mod budget;
pub mod pacing;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use budget::{crossed_thresholds, SpendOutcome, THRESHOLDS};

use crate::cache::CampaignCache;
use crate::config::PacingConfig;
use crate::keystore::{get_counter, KeyStore};
use crate::models::{to_micros, Click, Impression};
use crate::store::{AdStore, EventWrite, SpendResult, ViewabilityWrite};

const HOURLY_COUNTER_TTL: Duration = Duration::from_secs(2 * 3600);

pub struct BudgetLedger {
    store: AdStore,
    keystore: Arc<dyn KeyStore>,
    cache: CampaignCache,
    pacing: PacingConfig,
    rng: Mutex<StdRng>,
}

impl BudgetLedger {
    pub fn new(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        cache: CampaignCache,
        pacing: PacingConfig,
    ) -> Self {
        Self::with_rng(store, keystore, cache, pacing, StdRng::from_entropy())
    }

    pub fn with_seed(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        cache: CampaignCache,
        pacing: PacingConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, keystore, cache, pacing, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        cache: CampaignCache,
        pacing: PacingConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            keystore,
            cache,
            pacing,
            rng: Mutex::new(rng),
        }
    }

    /// Standalone guarded spend with its side effects.
    pub async fn try_spend(&self, campaign_id: &str, amount: f64) -> Result<SpendOutcome> {
        match self.store.try_spend(campaign_id, to_micros(amount)).await? {
            Some(spend) => {
                self.after_spend(campaign_id, &spend, Utc::now()).await;
                Ok(SpendOutcome::accepted(&spend))
            }
            None => {
                counter!("budget_rejections_total", 1);
                Ok(SpendOutcome::rejected())
            }
        }
    }

    pub async fn bill_impression(&self, imp: &Impression) -> Result<EventWrite> {
        let write = self.store.record_impression(imp).await?;
        self.after_write(&imp.campaign_id, &write, imp.created_at).await;
        Ok(write)
    }

    pub async fn bill_click(&self, click: &Click) -> Result<EventWrite> {
        let write = self.store.record_click(click).await?;
        self.after_write(&click.campaign_id, &write, click.created_at).await;
        Ok(write)
    }

    pub async fn bill_viewable(
        &self,
        campaign_id: &str,
        impression_id: &str,
        viewable: bool,
        revenue: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<ViewabilityWrite> {
        let write = self
            .store
            .confirm_viewability(impression_id, viewable, revenue, now)
            .await?;
        match write {
            ViewabilityWrite::Billed(spend) => {
                self.after_spend(campaign_id, &spend, now).await;
            }
            ViewabilityWrite::BudgetExceeded => {
                counter!("budget_rejections_total", 1);
            }
            _ => {}
        }
        Ok(write)
    }

    async fn after_write(&self, campaign_id: &str, write: &EventWrite, now: DateTime<Utc>) {
        match write {
            EventWrite::Inserted { spend: Some(spend) } => {
                self.after_spend(campaign_id, spend, now).await;
            }
            EventWrite::BudgetExceeded => {
                counter!("budget_rejections_total", 1);
                debug!(campaign_id, "spend rejected by budget guard");
            }
            _ => {}
        }
    }

    /// Pacing counter and threshold-driven cache invalidation. Returns true when
    /// the cache was invalidated.
    pub async fn after_spend(
        &self,
        campaign_id: &str,
        spend: &SpendResult,
        now: DateTime<Utc>,
    ) -> bool {
        if let Err(e) = self
            .increment_hourly_spend(campaign_id, spend.after_micros - spend.before_micros, now)
            .await
        {
            warn!("Failed to update pacing counter for {}: {}", campaign_id, e);
        }

        let crossed = crossed_thresholds(spend.before_micros, spend.after_micros, spend.total_micros);
        if crossed.is_empty() {
            return false;
        }

        info!(campaign_id, thresholds = ?crossed, "💰 budget threshold crossed");
        match self.cache.invalidate_campaign_cache().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to invalidate campaign cache: {}", e);
                false
            }
        }
    }

    pub async fn increment_hourly_spend(
        &self,
        campaign_id: &str,
        amount_micros: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.keystore
            .incr_by(
                &pacing::hourly_key(campaign_id, now),
                amount_micros,
                Some(HOURLY_COUNTER_TTL),
            )
            .await
    }

    /// Daily pacing gate. Campaigns without a daily budget always pass.
    pub async fn should_serve_campaign_probabilistic(
        &self,
        campaign_id: &str,
        daily_budget: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(daily) = daily_budget.map(to_micros).filter(|d| *d > 0) else {
            return Ok(true);
        };

        let daily_spent = self.store.daily_spent_micros(campaign_id, now).await?;
        let spent_fraction = daily_spent as f64 / daily as f64;
        if spent_fraction >= 1.0 {
            return Ok(false);
        }

        let hour_spent =
            get_counter(self.keystore.as_ref(), &pacing::hourly_key(campaign_id, now)).await?;
        if pacing::over_hourly_cap(hour_spent, daily, self.pacing.hourly_burst_multiplier) {
            debug!(campaign_id, hour_spent, "hourly pacing cap reached");
            return Ok(false);
        }

        let elapsed = pacing::elapsed_fraction(now, self.pacing.grace_secs);
        let p = pacing::serve_probability(spent_fraction, elapsed);
        if p >= 1.0 {
            return Ok(true);
        }
        Ok(self.rng.lock().gen_bool(p))
    }
}
