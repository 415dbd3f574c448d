//! Matching orchestrator
//! Mission: compose cache, targeting, ranking, fraud, ledger, dedup and
//! attribution into the serve and tracking flows.
//!
//! Serve: cached campaigns → targeting → pacing → eCPM rank → floor → top N
//! Track: campaign → dedup → GIVT → sampled SIVT → (clicks: timing) → ledger

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attribution::{AttributionEngine, ConversionOutcome};
use crate::cache::CampaignCache;
use crate::config::PipelineConfig;
use crate::dedup::DedupStore;
use crate::fraud::{FraudClassifier, FraudScorer, GivtFilter, SivtChecker};
use crate::keystore::KeyStore;
use crate::ledger::BudgetLedger;
use crate::models::{
    AdRequest, BidModel, BudgetState, Campaign, Click, EventContext, EventKind, FraudStatus,
    Impression, RankedCampaign,
};
use crate::ranking::rank_by_ecpm;
use crate::store::{AdStore, EventWrite, ViewabilityWrite};
use crate::targeting::{filter_by_targeting, passes_floor, TargetingContext};
use crate::viewability::{ViewabilityMeasurement, ViewabilityResult};

#[derive(Debug)]
pub enum PipelineError {
    Validation(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Validation(msg) => write!(f, "validation error: {}", msg),
            PipelineError::NotFound(msg) => write!(f, "not found: {}", msg),
            PipelineError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Internal(e)
    }
}

fn require(field: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpressionReceipt {
    pub impression_id: String,
    pub fraud_status: FraudStatus,
    pub revenue: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImpressionOutcome {
    Logged(ImpressionReceipt),
    AlreadyLogged,
    BudgetExceeded,
    Blocked,
    UnknownCampaign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickStatus {
    /// Stored clean (billed when the campaign pays per click)
    Logged,
    /// Stored with a non-clean fraud status, never billed
    Filtered,
    BudgetExceeded,
    Duplicate,
    /// Persisting failed; the user is still redirected
    NotRecorded,
    /// Missing publisher or slot context; redirected, not recorded
    Invalid,
    UnknownCampaign,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickOutcome {
    /// Landing page; absent only when the campaign is unknown
    pub redirect_url: Option<String>,
    pub status: ClickStatus,
}

pub struct MatchingOrchestrator {
    store: AdStore,
    cache: CampaignCache,
    fraud: FraudClassifier,
    ledger: BudgetLedger,
    dedup: DedupStore,
    attribution: AttributionEngine,
    config: PipelineConfig,
}

impl MatchingOrchestrator {
    pub fn new(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: PipelineConfig,
    ) -> Self {
        let cache = CampaignCache::new(store.clone(), keystore.clone(), config.campaign_cache_ttl());
        let fraud = FraudClassifier::from_config(keystore.clone(), scorer, &config.fraud);
        let ledger = BudgetLedger::new(
            store.clone(),
            keystore.clone(),
            cache.clone(),
            config.pacing.clone(),
        );
        Self::assemble(store, keystore, cache, fraud, ledger, config)
    }

    /// Same wiring with seeded sampling and pacing.
    pub fn with_seed(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        scorer: Option<Arc<dyn FraudScorer>>,
        config: PipelineConfig,
        seed: u64,
    ) -> Self {
        let cache = CampaignCache::new(store.clone(), keystore.clone(), config.campaign_cache_ttl());
        let fraud = FraudClassifier::new(
            GivtFilter::new(keystore.clone(), &config.fraud),
            SivtChecker::with_seed(keystore.clone(), scorer, &config.fraud, seed),
            &config.fraud,
        );
        let ledger = BudgetLedger::with_seed(
            store.clone(),
            keystore.clone(),
            cache.clone(),
            config.pacing.clone(),
            seed.wrapping_add(1),
        );
        Self::assemble(store, keystore, cache, fraud, ledger, config)
    }

    fn assemble(
        store: AdStore,
        keystore: Arc<dyn KeyStore>,
        cache: CampaignCache,
        fraud: FraudClassifier,
        ledger: BudgetLedger,
        config: PipelineConfig,
    ) -> Self {
        let dedup = DedupStore::new(keystore.clone(), config.dedup_window());
        let attribution =
            AttributionEngine::new(store.clone(), keystore, config.attribution.clone());
        Self {
            store,
            cache,
            fraud,
            ledger,
            dedup,
            attribution,
            config,
        }
    }

    pub fn store(&self) -> &AdStore {
        &self.store
    }

    pub fn cache(&self) -> &CampaignCache {
        &self.cache
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn fraud(&self) -> &FraudClassifier {
        &self.fraud
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Top-N campaigns for a placement. Empty when nothing qualifies.
    pub async fn serve_ad(
        &self,
        request: &AdRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedCampaign>, PipelineError> {
        require("publisher_id", &request.publisher_id)?;
        require("slot_id", &request.slot_id)?;
        require("format", &request.format)?;
        counter!("ad_requests_total", 1);

        let Some(publisher) = self.store.get_publisher(&request.publisher_id).await? else {
            debug!(publisher_id = %request.publisher_id, "unknown publisher");
            return Ok(Vec::new());
        };
        let slot = self
            .store
            .get_slot(&request.slot_id)
            .await?
            .filter(|s| s.publisher_id == publisher.id);
        let blocked = self.store.blocked_advertisers(&publisher.id).await?;

        let campaigns = self.cache.get_active_campaigns().await?;
        let ctx = TargetingContext {
            request,
            quality_score: publisher.quality_score,
            publisher_categories: &publisher.categories,
            blocked_advertisers: &blocked,
            slot: slot.as_ref(),
        };
        let targeted = filter_by_targeting(campaigns, &ctx);

        let mut paced: Vec<Campaign> = Vec::with_capacity(targeted.len());
        for campaign in targeted {
            match self
                .ledger
                .should_serve_campaign_probabilistic(&campaign.id, campaign.daily_budget, now)
                .await
            {
                Ok(true) => paced.push(campaign),
                Ok(false) => debug!(campaign_id = %campaign.id, "held back by pacing"),
                Err(e) => {
                    warn!("Pacing check failed for {}, serving: {}", campaign.id, e);
                    paced.push(campaign);
                }
            }
        }

        let cpc_ids: Vec<String> = paced
            .iter()
            .filter(|c| c.bid_model == BidModel::Cpc)
            .map(|c| c.id.clone())
            .collect();
        let history = self.store.ctr_history(&cpc_ids).await?;

        let ranked: Vec<RankedCampaign> = rank_by_ecpm(paced, &history, &self.config.ranking)
            .into_iter()
            .filter(|r| passes_floor(r, slot.as_ref()))
            .take(self.config.top_n)
            .collect();

        debug!(
            publisher_id = %request.publisher_id,
            slot_id = %request.slot_id,
            served = ranked.len(),
            "ad request ranked"
        );
        Ok(ranked)
    }

    fn validate_event(event_id: &str, ctx: &EventContext) -> Result<(), PipelineError> {
        require("impression_id", event_id)?;
        require("campaign_id", &ctx.campaign_id)?;
        require("publisher_id", &ctx.publisher_id)?;
        require("slot_id", &ctx.slot_id)
    }

    /// Claim the idempotency key. A keystore failure falls through to the
    /// store's primary key.
    async fn claim(&self, kind: EventKind, id: &str) -> bool {
        match self.dedup.is_duplicate(kind, id).await {
            Ok(duplicate) => !duplicate,
            Err(e) => {
                warn!("Dedup store unavailable for {}:{}: {}", kind.as_str(), id, e);
                true
            }
        }
    }

    async fn release(&self, kind: EventKind, id: &str) {
        if let Err(e) = self.dedup.release(kind, id).await {
            warn!("Failed to release dedup key {}:{}: {}", kind.as_str(), id, e);
        }
    }

    pub async fn log_impression(
        &self,
        impression_id: &str,
        ctx: &EventContext,
        now: DateTime<Utc>,
    ) -> Result<ImpressionOutcome, PipelineError> {
        Self::validate_event(impression_id, ctx)?;

        let Some(campaign) = self.store.get_campaign(&ctx.campaign_id).await? else {
            return Ok(ImpressionOutcome::UnknownCampaign);
        };

        if !self.claim(EventKind::Impression, impression_id).await {
            counter!("impressions_total", 1, "outcome" => "duplicate");
            return Ok(ImpressionOutcome::AlreadyLogged);
        }

        let verdict = self.fraud.classify_impression(ctx, now).await;
        let revenue = if verdict.is_billable() {
            campaign.impression_revenue()
        } else {
            None
        };

        let impression = Impression {
            id: impression_id.to_string(),
            campaign_id: campaign.id.clone(),
            publisher_id: ctx.publisher_id.clone(),
            slot_id: ctx.slot_id.clone(),
            geo: ctx.geo.clone(),
            device: ctx.device.clone(),
            session_id: ctx.session_id.clone(),
            ip: ctx.ip.map(|ip| ip.to_string()),
            revenue,
            fraud_score: verdict.score,
            fraud_status: verdict.status,
            ivt_reason: verdict.reason,
            sivt_checked: verdict.sivt_checked,
            viewable: None,
            billed: false,
            budget_exceeded: false,
            created_at: now,
        };

        let write = match self.ledger.bill_impression(&impression).await {
            Ok(write) => write,
            Err(e) => {
                self.release(EventKind::Impression, impression_id).await;
                error!("Failed to record impression {}: {}", impression_id, e);
                return Err(e.into());
            }
        };

        let outcome = match write {
            EventWrite::Duplicate => ImpressionOutcome::AlreadyLogged,
            EventWrite::BudgetExceeded => ImpressionOutcome::BudgetExceeded,
            EventWrite::Inserted { .. } if verdict.status == FraudStatus::Blocked => {
                ImpressionOutcome::Blocked
            }
            EventWrite::Inserted { spend } => ImpressionOutcome::Logged(ImpressionReceipt {
                impression_id: impression_id.to_string(),
                fraud_status: verdict.status,
                revenue: spend.and(revenue),
            }),
        };

        let label = match &outcome {
            ImpressionOutcome::Logged(_) => "logged",
            ImpressionOutcome::AlreadyLogged => "duplicate",
            ImpressionOutcome::BudgetExceeded => "budget_exceeded",
            ImpressionOutcome::Blocked => "blocked",
            ImpressionOutcome::UnknownCampaign => "unknown_campaign",
        };
        counter!("impressions_total", 1, "outcome" => label);
        Ok(outcome)
    }

    /// Never fails on a policy or storage decision once the campaign resolves;
    /// the caller always gets the landing page back.
    pub async fn log_click(
        &self,
        impression_id: &str,
        ctx: &EventContext,
        now: DateTime<Utc>,
    ) -> Result<ClickOutcome, PipelineError> {
        let campaign = if ctx.campaign_id.trim().is_empty() {
            None
        } else {
            self.store.get_campaign(&ctx.campaign_id).await?
        };
        let Some(campaign) = campaign else {
            return Ok(ClickOutcome {
                redirect_url: None,
                status: ClickStatus::UnknownCampaign,
            });
        };
        let redirect = |status| ClickOutcome {
            redirect_url: Some(campaign.landing_url.clone()),
            status,
        };

        if let Err(e) = Self::validate_event(impression_id, ctx) {
            warn!(impression_id, campaign_id = %campaign.id, "Click not recorded: {}", e);
            counter!("clicks_total", 1, "outcome" => "invalid");
            return Ok(redirect(ClickStatus::Invalid));
        }

        if !self.claim(EventKind::Click, impression_id).await {
            counter!("clicks_total", 1, "outcome" => "duplicate");
            return Ok(redirect(ClickStatus::Duplicate));
        }

        let impression_at = match self.store.get_impression(impression_id).await {
            Ok(imp) => imp.map(|i| i.created_at),
            Err(e) => {
                warn!("Impression lookup failed for click {}: {}", impression_id, e);
                None
            }
        };
        let verdict = self.fraud.classify_click(ctx, impression_at, now).await;
        let revenue = if verdict.is_billable() {
            campaign.click_revenue()
        } else {
            None
        };

        let click = Click {
            id: Uuid::new_v4().to_string(),
            impression_id: impression_id.to_string(),
            campaign_id: campaign.id.clone(),
            publisher_id: ctx.publisher_id.clone(),
            slot_id: ctx.slot_id.clone(),
            geo: ctx.geo.clone(),
            device: ctx.device.clone(),
            session_id: ctx.session_id.clone(),
            ip: ctx.ip.map(|ip| ip.to_string()),
            revenue,
            fraud_score: verdict.score,
            fraud_status: verdict.status,
            ivt_reason: verdict.reason,
            sivt_checked: verdict.sivt_checked,
            billed: false,
            budget_exceeded: false,
            created_at: now,
        };

        let status = match self.ledger.bill_click(&click).await {
            Ok(EventWrite::Duplicate) => ClickStatus::Duplicate,
            Ok(EventWrite::BudgetExceeded) => ClickStatus::BudgetExceeded,
            Ok(EventWrite::Inserted { .. }) if verdict.is_billable() => ClickStatus::Logged,
            Ok(EventWrite::Inserted { .. }) => ClickStatus::Filtered,
            Err(e) => {
                self.release(EventKind::Click, impression_id).await;
                error!("Failed to record click for {}: {}", impression_id, e);
                ClickStatus::NotRecorded
            }
        };

        counter!("clicks_total", 1, "outcome" => match status {
            ClickStatus::Logged => "logged",
            ClickStatus::Filtered => "filtered",
            ClickStatus::BudgetExceeded => "budget_exceeded",
            ClickStatus::Duplicate => "duplicate",
            ClickStatus::NotRecorded => "not_recorded",
            ClickStatus::Invalid => "invalid",
            ClickStatus::UnknownCampaign => "unknown_campaign",
        });
        Ok(redirect(status))
    }

    pub async fn confirm_viewability(
        &self,
        impression_id: &str,
        measurement: &ViewabilityMeasurement,
        now: DateTime<Utc>,
    ) -> Result<ViewabilityResult, PipelineError> {
        require("impression_id", impression_id)?;
        measurement.validate().map_err(PipelineError::Validation)?;

        let Some(impression) = self.store.get_impression(impression_id).await? else {
            return Err(PipelineError::NotFound(format!("impression {}", impression_id)));
        };
        if impression.slot_id != measurement.slot_id {
            return Err(PipelineError::Validation(
                "slot_id does not match the impression".to_string(),
            ));
        }
        let Some(campaign) = self.store.get_campaign(&impression.campaign_id).await? else {
            return Err(PipelineError::NotFound(format!(
                "campaign {}",
                impression.campaign_id
            )));
        };

        let viewable = measurement.is_viewable();
        let revenue = campaign.viewable_impression_revenue();
        let write = self
            .ledger
            .bill_viewable(&campaign.id, impression_id, viewable, revenue, now)
            .await?;

        match write {
            ViewabilityWrite::Billed(_) => {
                info!(impression_id, campaign_id = %campaign.id, "👁️ viewable impression billed");
                Ok(ViewabilityResult {
                    viewable,
                    billed: true,
                    revenue,
                })
            }
            ViewabilityWrite::UnknownImpression => {
                Err(PipelineError::NotFound(format!("impression {}", impression_id)))
            }
            ViewabilityWrite::NotBilled | ViewabilityWrite::BudgetExceeded => {
                Ok(ViewabilityResult {
                    viewable,
                    billed: false,
                    revenue: None,
                })
            }
        }
    }

    pub async fn track_conversion(
        &self,
        impression_id: &str,
        conversion_type: &str,
        conversion_value: Option<f64>,
        window_days: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome, PipelineError> {
        require("impression_id", impression_id)?;
        require("conversion_type", conversion_type)?;
        if window_days.is_some_and(|d| d < 0) {
            return Err(PipelineError::Validation(
                "attribution_window_days must be non-negative".to_string(),
            ));
        }

        Ok(self
            .attribution
            .track_conversion(impression_id, conversion_type, conversion_value, window_days, now)
            .await?)
    }

    pub async fn budget_state(&self, campaign_id: &str) -> Result<BudgetState, PipelineError> {
        self.store
            .budget_state(campaign_id, Utc::now())
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("campaign {}", campaign_id)))
    }
}
