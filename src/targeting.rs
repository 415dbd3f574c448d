//! Targeting filter
//!
//! Predicates run in a fixed order, most exclusionary first. An open axis
//! (no list, or an empty one) matches everything; a restricted axis needs a
//! request value to match. Daily pacing is the last gate and runs in the
//! orchestrator because it consults the ledger.

use std::collections::HashSet;

use crate::models::{AdRequest, AdSlot, Campaign, RankedCampaign};

/// Why a campaign was dropped, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BrandBlocked,
    Geo,
    Category,
    QualityScore,
    Device,
    Format,
    Size,
    NoBudget,
}

/// Everything about the placement the predicates need.
pub struct TargetingContext<'a> {
    pub request: &'a AdRequest,
    pub quality_score: f64,
    pub publisher_categories: &'a [String],
    /// Advertisers blocked on this publisher, from either side
    pub blocked_advertisers: &'a HashSet<String>,
    pub slot: Option<&'a AdSlot>,
}

fn open(axis: &Option<Vec<String>>) -> Option<&[String]> {
    axis.as_deref().filter(|v| !v.is_empty())
}

fn allows(list: &[String], value: Option<&str>) -> bool {
    value.is_some_and(|v| list.iter().any(|item| item.eq_ignore_ascii_case(v)))
}

pub fn check_campaign(campaign: &Campaign, ctx: &TargetingContext<'_>) -> Result<(), Rejection> {
    if ctx.blocked_advertisers.contains(&campaign.advertiser_id) {
        return Err(Rejection::BrandBlocked);
    }

    let t = &campaign.targeting;
    if let Some(geo) = open(&t.geo) {
        if !allows(geo, ctx.request.geo.as_deref()) {
            return Err(Rejection::Geo);
        }
    }

    if let Some(categories) = open(&t.categories) {
        let overlap = categories.iter().any(|c| {
            ctx.publisher_categories
                .iter()
                .any(|p| p.eq_ignore_ascii_case(c))
        });
        if !overlap {
            return Err(Rejection::Category);
        }
    }

    if let Some(min) = t.min_quality_score {
        if ctx.quality_score < min {
            return Err(Rejection::QualityScore);
        }
    }

    if let Some(devices) = open(&t.devices) {
        if !allows(devices, ctx.request.device.as_deref()) {
            return Err(Rejection::Device);
        }
    }

    if !campaign.creative.format.eq_ignore_ascii_case(&ctx.request.format) {
        return Err(Rejection::Format);
    }

    if let Some(slot) = ctx.slot {
        if let (Some(w), Some(h)) = (slot.width, slot.height) {
            if campaign.creative.width != Some(w) || campaign.creative.height != Some(h) {
                return Err(Rejection::Size);
            }
        }
    }

    if campaign.remaining_budget() <= 0.0 {
        return Err(Rejection::NoBudget);
    }

    Ok(())
}

pub fn filter_by_targeting(campaigns: Vec<Campaign>, ctx: &TargetingContext<'_>) -> Vec<Campaign> {
    campaigns
        .into_iter()
        .filter(|c| match check_campaign(c, ctx) {
            Ok(()) => true,
            Err(reason) => {
                tracing::trace!(campaign_id = %c.id, ?reason, "campaign filtered");
                false
            }
        })
        .collect()
}

/// Floor price gate, applied after ranking since it needs the predicted eCPM.
pub fn passes_floor(candidate: &RankedCampaign, slot: Option<&AdSlot>) -> bool {
    match slot.and_then(|s| s.floor_cpm) {
        Some(floor) => candidate.ecpm >= floor,
        None => true,
    }
}
