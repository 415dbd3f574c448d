//! eCPM ranking
//!
//! CPM bids compare directly; CPC bids are converted through CTR.
//! Ordering is total: eCPM desc, raw bid desc, campaign id asc.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::RankingConfig;
use crate::models::{BidModel, Campaign, RankedCampaign};
use crate::store::CtrStats;

pub fn estimated_ctr(stats: Option<&CtrStats>, config: &RankingConfig) -> f64 {
    match stats {
        Some(s) if s.impressions >= config.min_impressions_for_ctr && s.impressions > 0 => {
            s.clicks as f64 / s.impressions as f64
        }
        _ => config.default_ctr,
    }
}

pub fn ecpm(campaign: &Campaign, stats: Option<&CtrStats>, config: &RankingConfig) -> f64 {
    match campaign.bid_model {
        BidModel::Cpm => campaign.bid_amount,
        BidModel::Cpc => estimated_ctr(stats, config) * campaign.bid_amount * 1000.0,
    }
}

fn compare(a: &RankedCampaign, b: &RankedCampaign) -> Ordering {
    b.ecpm
        .total_cmp(&a.ecpm)
        .then_with(|| b.campaign.bid_amount.total_cmp(&a.campaign.bid_amount))
        .then_with(|| a.campaign.id.cmp(&b.campaign.id))
}

pub fn rank_by_ecpm(
    campaigns: Vec<Campaign>,
    ctr_history: &HashMap<String, CtrStats>,
    config: &RankingConfig,
) -> Vec<RankedCampaign> {
    let mut ranked: Vec<RankedCampaign> = campaigns
        .into_iter()
        .map(|campaign| {
            let ecpm = ecpm(&campaign, ctr_history.get(&campaign.id), config);
            RankedCampaign { campaign, ecpm }
        })
        .collect();
    ranked.sort_by(compare);
    ranked
}
