//! Shared fixtures for unit tests.

use anyhow::{bail, Result};
use chrono::Utc;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fraud::FraudScorer;
use crate::models::{
    BidModel, Campaign, CampaignStatus, Click, Creative, FraudStatus, Impression, Targeting,
};

/// Active open-targeted CPM campaign: bid 10, budget 100, 300x250 banner.
pub fn sample_campaign(id: &str) -> Campaign {
    Campaign {
        id: id.to_string(),
        advertiser_id: "adv-1".to_string(),
        bid_model: BidModel::Cpm,
        bid_amount: 10.0,
        total_budget: 100.0,
        spent_budget: 0.0,
        daily_budget: None,
        targeting: Targeting::default(),
        creative: Creative {
            format: "banner".to_string(),
            width: Some(300),
            height: Some(250),
            url: format!("https://cdn.example/{}.png", id),
        },
        landing_url: format!("https://advertiser.example/{}", id),
        status: CampaignStatus::Active,
        start_date: None,
        end_date: None,
        requires_viewability: false,
    }
}

/// Clean, unbilled impression.
pub fn sample_impression(id: &str, campaign_id: &str) -> Impression {
    Impression {
        id: id.to_string(),
        campaign_id: campaign_id.to_string(),
        publisher_id: "pub-1".to_string(),
        slot_id: "slot-1".to_string(),
        geo: Some("US".to_string()),
        device: Some("mobile".to_string()),
        session_id: None,
        ip: Some("203.0.113.7".to_string()),
        revenue: None,
        fraud_score: None,
        fraud_status: FraudStatus::Clean,
        ivt_reason: None,
        sivt_checked: false,
        viewable: None,
        billed: false,
        budget_exceeded: false,
        created_at: Utc::now(),
    }
}

/// Clean, unbilled click.
pub fn sample_click(id: &str, impression_id: &str, campaign_id: &str) -> Click {
    Click {
        id: id.to_string(),
        impression_id: impression_id.to_string(),
        campaign_id: campaign_id.to_string(),
        publisher_id: "pub-1".to_string(),
        slot_id: "slot-1".to_string(),
        geo: Some("US".to_string()),
        device: Some("mobile".to_string()),
        session_id: None,
        ip: Some("203.0.113.7".to_string()),
        revenue: None,
        fraud_score: None,
        fraud_status: FraudStatus::Clean,
        ivt_reason: None,
        sivt_checked: false,
        billed: false,
        budget_exceeded: false,
        created_at: Utc::now(),
    }
}

/// Scorer returning a fixed score (or failing) and counting calls.
pub struct StubScorer {
    score: f64,
    fail: bool,
    calls: AtomicUsize,
}

impl StubScorer {
    pub fn returning(score: f64) -> Self {
        Self {
            score,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            score: 0.0,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FraudScorer for StubScorer {
    fn name(&self) -> &str {
        "stub"
    }

    async fn score(&self, _ip: IpAddr, _user_agent: Option<&str>) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("stub scorer unavailable");
        }
        Ok(self.score)
    }
}
