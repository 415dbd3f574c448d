//! Fraud classification
//!
//! Two stages, in order: the local GIVT filter, then sampled SIVT scoring.
//! A GIVT hit ends processing with no scorer call. Clicks additionally get the
//! timing heuristic; the worse signal wins.

pub mod classify;
pub mod givt;
pub mod sivt;

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

pub use classify::{classify_score, click_timing_signal, Classification};
pub use givt::GivtFilter;
pub use sivt::{FraudScorer, HttpFraudScorer, ScoreSource, SivtChecker, SivtVerdict, NEUTRAL_SCORE};

use crate::config::FraudConfig;
use crate::keystore::KeyStore;
use crate::models::{EventContext, EventKind};

pub struct FraudClassifier {
    givt: GivtFilter,
    sivt: SivtChecker,
    fast_click_ms: i64,
}

impl FraudClassifier {
    pub fn new(givt: GivtFilter, sivt: SivtChecker, config: &FraudConfig) -> Self {
        Self {
            givt,
            sivt,
            fast_click_ms: config.fast_click_ms,
        }
    }

    pub fn from_config(
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: &FraudConfig,
    ) -> Self {
        Self::new(
            GivtFilter::new(keystore.clone(), config),
            SivtChecker::new(keystore, scorer, config),
            config,
        )
    }

    pub fn sivt(&self) -> &SivtChecker {
        &self.sivt
    }

    async fn run_stages(
        &self,
        kind: EventKind,
        ctx: &EventContext,
        now: DateTime<Utc>,
    ) -> Classification {
        let ua = ctx.user_agent.as_deref();

        match self.givt.check(ctx.ip, ua, now).await {
            Ok(Some(reason)) => {
                counter!("givt_filtered_total", 1, "reason" => reason.as_str());
                debug!(campaign_id = %ctx.campaign_id, reason = reason.as_str(), "GIVT filtered");
                return Classification::givt(reason);
            }
            Ok(None) => {}
            Err(e) => warn!("GIVT rate check unavailable: {}", e),
        }

        match self.sivt.check(kind, ctx.ip, ua, now).await {
            Ok(Some(verdict)) => Classification::from_score(verdict.score),
            Ok(None) => Classification::clean(),
            Err(e) => {
                warn!("SIVT stage unavailable, using neutral score: {}", e);
                Classification::from_score(NEUTRAL_SCORE)
            }
        }
    }

    pub async fn classify_impression(&self, ctx: &EventContext, now: DateTime<Utc>) -> Classification {
        self.run_stages(EventKind::Impression, ctx, now).await
    }

    /// `impression_at` is the paired impression's timestamp, if one was recorded.
    pub async fn classify_click(
        &self,
        ctx: &EventContext,
        impression_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Classification {
        let staged = self.run_stages(EventKind::Click, ctx, now).await;
        if staged.reason.is_some_and(|r| r.is_givt()) {
            return staged;
        }
        staged.with_timing(click_timing_signal(impression_at, now, self.fast_click_ms))
    }
}
