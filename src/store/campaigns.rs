use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{day_start, from_ms, to_ms, AdStore};
use crate::models::{
    from_micros, to_micros, AdSlot, BidModel, BudgetState, Campaign, CampaignStatus, Creative,
    Publisher, Targeting,
};

const CAMPAIGN_COLUMNS: &str = "id, advertiser_id, bid_model, bid_amount, total_micros, spent_micros, \
     daily_micros, targeting_json, creative_format, creative_width, creative_height, creative_url, \
     landing_url, status, start_at, end_at, requires_viewability";

/// Billed spend for a campaign since `?2`, across impressions and clicks.
const DAILY_SPENT_SQL: &str = "(SELECT COALESCE(SUM(revenue_micros), 0) FROM impressions \
        WHERE campaign_id = ?1 AND billed = 1 AND billed_at >= ?2) + \
     (SELECT COALESCE(SUM(revenue_micros), 0) FROM clicks \
        WHERE campaign_id = ?1 AND billed = 1 AND billed_at >= ?2)";

/// Result of an accepted conditional spend, in micro-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendResult {
    pub before_micros: i64,
    pub after_micros: i64,
    pub total_micros: i64,
}

/// Historical delivery used for CTR estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtrStats {
    pub impressions: u64,
    pub clicks: u64,
}

/// Which side of the pair asked for the block. Either side blocks the pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockSide {
    Publisher,
    Advertiser,
}

impl BlockSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSide::Publisher => "publisher",
            BlockSide::Advertiser => "advertiser",
        }
    }
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let bid_model: String = row.get(2)?;
    let targeting_json: String = row.get(7)?;
    let status: String = row.get(13)?;
    let daily_micros: Option<i64> = row.get(6)?;
    let start_at: Option<i64> = row.get(14)?;
    let end_at: Option<i64> = row.get(15)?;

    Ok(Campaign {
        id: row.get(0)?,
        advertiser_id: row.get(1)?,
        bid_model: BidModel::from_str(&bid_model).unwrap_or(BidModel::Cpm),
        bid_amount: row.get(3)?,
        total_budget: from_micros(row.get(4)?),
        spent_budget: from_micros(row.get(5)?),
        daily_budget: daily_micros.map(from_micros),
        targeting: serde_json::from_str::<Targeting>(&targeting_json).unwrap_or_default(),
        creative: Creative {
            format: row.get(8)?,
            width: row.get(9)?,
            height: row.get(10)?,
            url: row.get(11)?,
        },
        landing_url: row.get(12)?,
        status: CampaignStatus::from_str(&status).unwrap_or(CampaignStatus::Paused),
        start_date: start_at.map(from_ms),
        end_date: end_at.map(from_ms),
        requires_viewability: row.get::<_, i64>(16)? != 0,
    })
}

/// Guarded spend inside an open transaction. `None` means the guard rejected it.
pub(crate) fn spend_in_tx(
    tx: &Transaction<'_>,
    campaign_id: &str,
    amount_micros: i64,
) -> Result<Option<SpendResult>> {
    if amount_micros <= 0 {
        bail!("spend amount must be positive, got {} micros", amount_micros);
    }
    let row = tx
        .query_row(
            "UPDATE campaigns SET spent_micros = spent_micros + ?1 \
             WHERE id = ?2 AND spent_micros + ?1 <= total_micros \
             RETURNING spent_micros, total_micros",
            params![amount_micros, campaign_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    Ok(row.map(|(after, total)| SpendResult {
        before_micros: after - amount_micros,
        after_micros: after,
        total_micros: total,
    }))
}

impl AdStore {
    pub async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let targeting_json = serde_json::to_string(&campaign.targeting)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO campaigns ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                CAMPAIGN_COLUMNS
            ),
            params![
                &campaign.id,
                &campaign.advertiser_id,
                campaign.bid_model.as_str(),
                campaign.bid_amount,
                to_micros(campaign.total_budget),
                to_micros(campaign.spent_budget),
                campaign.daily_budget.map(to_micros),
                targeting_json,
                &campaign.creative.format,
                campaign.creative.width,
                campaign.creative.height,
                &campaign.creative.url,
                &campaign.landing_url,
                campaign.status.as_str(),
                campaign.start_date.map(to_ms),
                campaign.end_date.map(to_ms),
                campaign.requires_viewability as i64,
            ],
        )
        .with_context(|| format!("Failed to insert campaign {}", campaign.id))?;
        Ok(())
    }

    pub async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM campaigns WHERE id = ?1",
            CAMPAIGN_COLUMNS
        ))?;
        let campaign = stmt
            .query_row(params![campaign_id], campaign_from_row)
            .optional()?;
        Ok(campaign)
    }

    /// Active, in-flight campaigns with total budget left and (when capped) daily budget left.
    pub async fn list_eligible_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {cols} FROM campaigns c \
             WHERE c.status = 'active' \
               AND (c.start_at IS NULL OR c.start_at <= ?1) \
               AND (c.end_at IS NULL OR c.end_at >= ?1) \
               AND c.spent_micros < c.total_micros \
               AND (c.daily_micros IS NULL OR \
                    (SELECT COALESCE(SUM(revenue_micros), 0) FROM impressions \
                       WHERE campaign_id = c.id AND billed = 1 AND billed_at >= ?2) + \
                    (SELECT COALESCE(SUM(revenue_micros), 0) FROM clicks \
                       WHERE campaign_id = c.id AND billed = 1 AND billed_at >= ?2) \
                    < c.daily_micros) \
             ORDER BY c.id ASC",
            cols = CAMPAIGN_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let campaigns = stmt
            .query_map(params![to_ms(now), to_ms(day_start(now))], campaign_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(campaigns)
    }

    /// Standalone guarded spend.
    pub async fn try_spend(
        &self,
        campaign_id: &str,
        amount_micros: i64,
    ) -> Result<Option<SpendResult>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = spend_in_tx(&tx, campaign_id, amount_micros)?;
        tx.commit()?;
        Ok(result)
    }

    /// Billed spend since the start of the UTC day, in micro-units.
    pub async fn daily_spent_micros(&self, campaign_id: &str, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().await;
        let spent: i64 = conn.query_row(
            &format!("SELECT {}", DAILY_SPENT_SQL),
            params![campaign_id, to_ms(day_start(now))],
            |row| row.get(0),
        )?;
        Ok(spent)
    }

    pub async fn budget_state(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BudgetState>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT total_micros, spent_micros, daily_micros, {} FROM campaigns WHERE id = ?1",
                    DAILY_SPENT_SQL
                ),
                params![campaign_id, to_ms(day_start(now))],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(total, spent, daily, daily_spent)| BudgetState {
            campaign_id: campaign_id.to_string(),
            total_budget: from_micros(total),
            spent_budget: from_micros(spent),
            remaining_budget: from_micros((total - spent).max(0)),
            daily_budget: daily.map(from_micros),
            daily_spent: from_micros(daily_spent),
        }))
    }

    /// Clean impressions and clean clicks per campaign.
    pub async fn ctr_history(&self, campaign_ids: &[String]) -> Result<HashMap<String, CtrStats>> {
        let mut out: HashMap<String, CtrStats> = HashMap::new();
        if campaign_ids.is_empty() {
            return Ok(out);
        }

        let placeholders = vec!["?"; campaign_ids.len()].join(", ");
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT campaign_id, COUNT(*) FROM impressions \
             WHERE fraud_status = 'clean' AND campaign_id IN ({}) GROUP BY campaign_id",
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(campaign_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for r in rows {
            let (id, n) = r?;
            out.entry(id).or_default().impressions = n.max(0) as u64;
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT campaign_id, COUNT(*) FROM clicks \
             WHERE fraud_status = 'clean' AND campaign_id IN ({}) GROUP BY campaign_id",
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(campaign_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for r in rows {
            let (id, n) = r?;
            out.entry(id).or_default().clicks = n.max(0) as u64;
        }

        Ok(out)
    }

    pub async fn upsert_publisher(&self, publisher: &Publisher) -> Result<()> {
        let categories_json = serde_json::to_string(&publisher.categories)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO publishers (id, quality_score, categories_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                quality_score = excluded.quality_score,
                categories_json = excluded.categories_json",
            params![&publisher.id, publisher.quality_score, categories_json],
        )?;
        Ok(())
    }

    pub async fn get_publisher(&self, publisher_id: &str) -> Result<Option<Publisher>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, quality_score, categories_json FROM publishers WHERE id = ?1",
        )?;
        let publisher = stmt
            .query_row(params![publisher_id], |row| {
                let categories_json: String = row.get(2)?;
                Ok(Publisher {
                    id: row.get(0)?,
                    quality_score: row.get(1)?,
                    categories: serde_json::from_str(&categories_json).unwrap_or_default(),
                })
            })
            .optional()?;
        Ok(publisher)
    }

    pub async fn upsert_slot(&self, slot: &AdSlot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ad_slots (id, publisher_id, format, width, height, floor_cpm)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                publisher_id = excluded.publisher_id,
                format = excluded.format,
                width = excluded.width,
                height = excluded.height,
                floor_cpm = excluded.floor_cpm",
            params![
                &slot.id,
                &slot.publisher_id,
                &slot.format,
                slot.width,
                slot.height,
                slot.floor_cpm
            ],
        )?;
        Ok(())
    }

    pub async fn get_slot(&self, slot_id: &str) -> Result<Option<AdSlot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, publisher_id, format, width, height, floor_cpm FROM ad_slots WHERE id = ?1",
        )?;
        let slot = stmt
            .query_row(params![slot_id], |row| {
                Ok(AdSlot {
                    id: row.get(0)?,
                    publisher_id: row.get(1)?,
                    format: row.get(2)?,
                    width: row.get(3)?,
                    height: row.get(4)?,
                    floor_cpm: row.get(5)?,
                })
            })
            .optional()?;
        Ok(slot)
    }

    pub async fn add_brand_block(
        &self,
        publisher_id: &str,
        advertiser_id: &str,
        blocked_by: BlockSide,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO brand_blocks (publisher_id, advertiser_id, blocked_by)
             VALUES (?1, ?2, ?3)",
            params![publisher_id, advertiser_id, blocked_by.as_str()],
        )?;
        Ok(())
    }

    /// Advertisers that may not appear on this publisher, whichever side asked for the block.
    pub async fn blocked_advertisers(&self, publisher_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT advertiser_id FROM brand_blocks WHERE publisher_id = ?1",
        )?;
        let blocked = stmt
            .query_map(params![publisher_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(blocked)
    }
}
