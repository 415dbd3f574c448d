//! Domain types shared by the matching, fraud, ledger and attribution layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Money is persisted as integer micro-units so the budget guard compares exactly.
pub const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Rounds half away from zero.
pub fn to_micros(amount: f64) -> i64 {
    (amount * MICROS_PER_UNIT).round() as i64
}

/// Revenue worth at least one micro-unit; anything smaller is not billed.
fn billable(amount: f64) -> Option<f64> {
    (to_micros(amount) > 0).then_some(amount)
}

pub fn from_micros(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

/// How an advertiser pays
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BidModel {
    Cpm,
    Cpc,
}

impl BidModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidModel::Cpm => "cpm",
            BidModel::Cpc => "cpc",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpm" => Some(BidModel::Cpm),
            "cpc" => Some(BidModel::Cpc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(CampaignStatus::Draft),
            "active" => Some(CampaignStatus::Active),
            "paused" => Some(CampaignStatus::Paused),
            "archived" => Some(CampaignStatus::Archived),
            _ => None,
        }
    }
}

/// Per-axis targeting. `None` (or an empty list) means no restriction on that axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Targeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Creative {
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub advertiser_id: String,
    pub bid_model: BidModel,
    pub bid_amount: f64,
    pub total_budget: f64,
    pub spent_budget: f64,
    pub daily_budget: Option<f64>,
    pub targeting: Targeting,
    pub creative: Creative,
    pub landing_url: String,
    pub status: CampaignStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Impressions are billed only once viewability is confirmed
    #[serde(default)]
    pub requires_viewability: bool,
}

impl Campaign {
    pub fn remaining_budget(&self) -> f64 {
        (self.total_budget - self.spent_budget).max(0.0)
    }

    /// Revenue for a single clean impression, `None` when impressions are not billed directly.
    pub fn impression_revenue(&self) -> Option<f64> {
        match self.bid_model {
            BidModel::Cpm if !self.requires_viewability => billable(self.bid_amount / 1000.0),
            _ => None,
        }
    }

    /// Revenue attached to a viewability confirmation.
    pub fn viewable_impression_revenue(&self) -> Option<f64> {
        match self.bid_model {
            BidModel::Cpm if self.requires_viewability => billable(self.bid_amount / 1000.0),
            _ => None,
        }
    }

    pub fn click_revenue(&self) -> Option<f64> {
        match self.bid_model {
            BidModel::Cpc => billable(self.bid_amount),
            BidModel::Cpm => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    pub quality_score: f64,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdSlot {
    pub id: String,
    pub publisher_id: String,
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Minimum eCPM the publisher accepts
    pub floor_cpm: Option<f64>,
}

/// Inbound ad request. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequest {
    pub publisher_id: String,
    pub slot_id: String,
    pub format: String,
    pub geo: Option<String>,
    pub device: Option<String>,
}

/// A campaign returned to the client together with its ranking score.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCampaign {
    pub campaign: Campaign,
    pub ecpm: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FraudStatus {
    Clean,
    Suspicious,
    Fraud,
    Blocked,
}

impl FraudStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudStatus::Clean => "clean",
            FraudStatus::Suspicious => "suspicious",
            FraudStatus::Fraud => "fraud",
            FraudStatus::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(FraudStatus::Clean),
            "suspicious" => Some(FraudStatus::Suspicious),
            "fraud" => Some(FraudStatus::Fraud),
            "blocked" => Some(FraudStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_billable(&self) -> bool {
        matches!(self, FraudStatus::Clean)
    }
}

/// Measured reason an event was counted as invalid traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IvtReason {
    BotUserAgent,
    DatacenterIp,
    RateExceeded,
    SivtScore,
    FastClick,
    NoImpression,
}

impl IvtReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IvtReason::BotUserAgent => "bot_user_agent",
            IvtReason::DatacenterIp => "datacenter_ip",
            IvtReason::RateExceeded => "rate_exceeded",
            IvtReason::SivtScore => "sivt_score",
            IvtReason::FastClick => "fast_click",
            IvtReason::NoImpression => "no_impression",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bot_user_agent" => Some(IvtReason::BotUserAgent),
            "datacenter_ip" => Some(IvtReason::DatacenterIp),
            "rate_exceeded" => Some(IvtReason::RateExceeded),
            "sivt_score" => Some(IvtReason::SivtScore),
            "fast_click" => Some(IvtReason::FastClick),
            "no_impression" => Some(IvtReason::NoImpression),
            _ => None,
        }
    }

    pub fn is_givt(&self) -> bool {
        matches!(
            self,
            IvtReason::BotUserAgent | IvtReason::DatacenterIp | IvtReason::RateExceeded
        )
    }
}

/// Billable event kinds that pass through dedup and fraud checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Impression,
    Click,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Impression => "imp",
            EventKind::Click => "click",
        }
    }
}

/// Request context shared by impression and click tracking.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub campaign_id: String,
    pub publisher_id: String,
    pub slot_id: String,
    pub geo: Option<String>,
    pub device: Option<String>,
    pub session_id: Option<String>,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impression {
    pub id: String,
    pub campaign_id: String,
    pub publisher_id: String,
    pub slot_id: String,
    pub geo: Option<String>,
    pub device: Option<String>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub revenue: Option<f64>,
    pub fraud_score: Option<f64>,
    pub fraud_status: FraudStatus,
    pub ivt_reason: Option<IvtReason>,
    pub sivt_checked: bool,
    pub viewable: Option<bool>,
    pub billed: bool,
    pub budget_exceeded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Click {
    pub id: String,
    pub impression_id: String,
    pub campaign_id: String,
    pub publisher_id: String,
    pub slot_id: String,
    pub geo: Option<String>,
    pub device: Option<String>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub revenue: Option<f64>,
    pub fraud_score: Option<f64>,
    pub fraud_status: FraudStatus,
    pub ivt_reason: Option<IvtReason>,
    pub sivt_checked: bool,
    pub billed: bool,
    pub budget_exceeded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub id: String,
    pub impression_id: String,
    pub click_id: String,
    pub conversion_type: String,
    pub conversion_value: Option<f64>,
    pub attributed_within_window: bool,
    pub billable: bool,
    pub time_to_conversion_seconds: i64,
    pub created_at: DateTime<Utc>,
}

/// Derived budget view. `daily_spent` is always recomputed from billed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub campaign_id: String,
    pub total_budget: f64,
    pub spent_budget: f64,
    pub remaining_budget: f64,
    pub daily_budget: Option<f64>,
    pub daily_spent: f64,
}
