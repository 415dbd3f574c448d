use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::campaigns::{spend_in_tx, SpendResult};
use super::{from_ms, to_ms, AdStore};
use crate::models::{from_micros, to_micros, Click, FraudStatus, Impression, IvtReason};

/// Outcome of persisting an event that may carry a charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventWrite {
    /// Row inserted; `spend` is set when the charge was applied in the same transaction.
    Inserted { spend: Option<SpendResult> },
    /// Charge rejected by the budget guard; the row was inserted unbilled.
    BudgetExceeded,
    /// A row with this id already exists; nothing changed.
    Duplicate,
}

/// Outcome of a viewability confirmation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewabilityWrite {
    Billed(SpendResult),
    /// Nothing to bill: not gated, not clean, or billed by an earlier confirmation.
    NotBilled,
    BudgetExceeded,
    UnknownImpression,
}

const IMPRESSION_COLUMNS: &str = "id, campaign_id, publisher_id, slot_id, geo, device, session_id, ip, \
     revenue_micros, fraud_score, fraud_status, ivt_reason, sivt_checked, viewable, billed, \
     budget_exceeded, created_at";

const CLICK_COLUMNS: &str = "id, impression_id, campaign_id, publisher_id, slot_id, geo, device, \
     session_id, ip, revenue_micros, fraud_score, fraud_status, ivt_reason, sivt_checked, billed, \
     budget_exceeded, created_at";

fn status_from(s: String) -> FraudStatus {
    FraudStatus::from_str(&s).unwrap_or(FraudStatus::Suspicious)
}

fn impression_from_row(row: &Row<'_>) -> rusqlite::Result<Impression> {
    let revenue: Option<i64> = row.get(8)?;
    let reason: Option<String> = row.get(11)?;
    let viewable: Option<i64> = row.get(13)?;
    Ok(Impression {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        publisher_id: row.get(2)?,
        slot_id: row.get(3)?,
        geo: row.get(4)?,
        device: row.get(5)?,
        session_id: row.get(6)?,
        ip: row.get(7)?,
        revenue: revenue.map(from_micros),
        fraud_score: row.get(9)?,
        fraud_status: status_from(row.get(10)?),
        ivt_reason: reason.as_deref().and_then(IvtReason::from_str),
        sivt_checked: row.get::<_, i64>(12)? != 0,
        viewable: viewable.map(|v| v != 0),
        billed: row.get::<_, i64>(14)? != 0,
        budget_exceeded: row.get::<_, i64>(15)? != 0,
        created_at: from_ms(row.get(16)?),
    })
}

fn click_from_row(row: &Row<'_>) -> rusqlite::Result<Click> {
    let revenue: Option<i64> = row.get(9)?;
    let reason: Option<String> = row.get(12)?;
    Ok(Click {
        id: row.get(0)?,
        impression_id: row.get(1)?,
        campaign_id: row.get(2)?,
        publisher_id: row.get(3)?,
        slot_id: row.get(4)?,
        geo: row.get(5)?,
        device: row.get(6)?,
        session_id: row.get(7)?,
        ip: row.get(8)?,
        revenue: revenue.map(from_micros),
        fraud_score: row.get(10)?,
        fraud_status: status_from(row.get(11)?),
        ivt_reason: reason.as_deref().and_then(IvtReason::from_str),
        sivt_checked: row.get::<_, i64>(13)? != 0,
        billed: row.get::<_, i64>(14)? != 0,
        budget_exceeded: row.get::<_, i64>(15)? != 0,
        created_at: from_ms(row.get(16)?),
    })
}

fn insert_impression_tx(
    tx: &Transaction<'_>,
    imp: &Impression,
    billed_at: Option<i64>,
) -> Result<bool> {
    let inserted = tx.execute(
        &format!(
            "INSERT OR IGNORE INTO impressions ({}, billed_at) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            IMPRESSION_COLUMNS
        ),
        params![
            &imp.id,
            &imp.campaign_id,
            &imp.publisher_id,
            &imp.slot_id,
            imp.geo.as_deref(),
            imp.device.as_deref(),
            imp.session_id.as_deref(),
            imp.ip.as_deref(),
            imp.revenue.map(to_micros),
            imp.fraud_score,
            imp.fraud_status.as_str(),
            imp.ivt_reason.map(|r| r.as_str()),
            imp.sivt_checked as i64,
            imp.viewable.map(|v| v as i64),
            imp.billed as i64,
            imp.budget_exceeded as i64,
            to_ms(imp.created_at),
            billed_at,
        ],
    )?;
    Ok(inserted == 1)
}

fn insert_click_tx(tx: &Transaction<'_>, click: &Click, billed_at: Option<i64>) -> Result<bool> {
    let inserted = tx.execute(
        &format!(
            "INSERT OR IGNORE INTO clicks ({}, billed_at) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            CLICK_COLUMNS
        ),
        params![
            &click.id,
            &click.impression_id,
            &click.campaign_id,
            &click.publisher_id,
            &click.slot_id,
            click.geo.as_deref(),
            click.device.as_deref(),
            click.session_id.as_deref(),
            click.ip.as_deref(),
            click.revenue.map(to_micros),
            click.fraud_score,
            click.fraud_status.as_str(),
            click.ivt_reason.map(|r| r.as_str()),
            click.sivt_checked as i64,
            click.billed as i64,
            click.budget_exceeded as i64,
            to_ms(click.created_at),
            billed_at,
        ],
    )?;
    Ok(inserted == 1)
}

impl AdStore {
    /// Persist an impression. When `imp.revenue` is set the charge and the insert
    /// commit together; a rejected charge rolls back and stores the row unbilled.
    pub async fn record_impression(&self, imp: &Impression) -> Result<EventWrite> {
        let mut conn = self.conn.lock().await;

        let Some(revenue) = imp.revenue else {
            let mut row = imp.clone();
            row.billed = false;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = insert_impression_tx(&tx, &row, None)?;
            tx.commit()?;
            return Ok(if inserted {
                EventWrite::Inserted { spend: None }
            } else {
                EventWrite::Duplicate
            });
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match spend_in_tx(&tx, &imp.campaign_id, to_micros(revenue))? {
            Some(spend) => {
                let mut row = imp.clone();
                row.billed = true;
                if !insert_impression_tx(&tx, &row, Some(to_ms(imp.created_at)))? {
                    tx.rollback()?;
                    return Ok(EventWrite::Duplicate);
                }
                tx.commit()?;
                Ok(EventWrite::Inserted { spend: Some(spend) })
            }
            None => {
                tx.rollback()?;

                let mut row = imp.clone();
                row.revenue = None;
                row.billed = false;
                row.budget_exceeded = true;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let inserted = insert_impression_tx(&tx, &row, None)?;
                tx.commit()?;
                Ok(if inserted {
                    EventWrite::BudgetExceeded
                } else {
                    EventWrite::Duplicate
                })
            }
        }
    }

    /// Same contract as [`AdStore::record_impression`], for clicks.
    pub async fn record_click(&self, click: &Click) -> Result<EventWrite> {
        let mut conn = self.conn.lock().await;

        let Some(revenue) = click.revenue else {
            let mut row = click.clone();
            row.billed = false;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = insert_click_tx(&tx, &row, None)?;
            tx.commit()?;
            return Ok(if inserted {
                EventWrite::Inserted { spend: None }
            } else {
                EventWrite::Duplicate
            });
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match spend_in_tx(&tx, &click.campaign_id, to_micros(revenue))? {
            Some(spend) => {
                let mut row = click.clone();
                row.billed = true;
                if !insert_click_tx(&tx, &row, Some(to_ms(click.created_at)))? {
                    tx.rollback()?;
                    return Ok(EventWrite::Duplicate);
                }
                tx.commit()?;
                Ok(EventWrite::Inserted { spend: Some(spend) })
            }
            None => {
                tx.rollback()?;

                let mut row = click.clone();
                row.revenue = None;
                row.billed = false;
                row.budget_exceeded = true;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let inserted = insert_click_tx(&tx, &row, None)?;
                tx.commit()?;
                Ok(if inserted {
                    EventWrite::BudgetExceeded
                } else {
                    EventWrite::Duplicate
                })
            }
        }
    }

    pub async fn get_impression(&self, impression_id: &str) -> Result<Option<Impression>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM impressions WHERE id = ?1",
            IMPRESSION_COLUMNS
        ))?;
        let imp = stmt
            .query_row(params![impression_id], impression_from_row)
            .optional()?;
        Ok(imp)
    }

    /// Most recent click recorded against an impression id.
    pub async fn latest_click_for_impression(&self, impression_id: &str) -> Result<Option<Click>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM clicks WHERE impression_id = ?1 ORDER BY created_at DESC LIMIT 1",
            CLICK_COLUMNS
        ))?;
        let click = stmt
            .query_row(params![impression_id], click_from_row)
            .optional()?;
        Ok(click)
    }

    /// Record a viewability measurement and, when `revenue` is given, bill the
    /// impression exactly once. A met measurement is never downgraded.
    pub async fn confirm_viewability(
        &self,
        impression_id: &str,
        viewable: bool,
        revenue: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<ViewabilityWrite> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let campaign_id: Option<String> = tx
            .query_row(
                "UPDATE impressions SET viewable = CASE WHEN viewable = 1 THEN 1 ELSE ?2 END \
                 WHERE id = ?1 RETURNING campaign_id",
                params![impression_id, viewable as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(campaign_id) = campaign_id else {
            tx.rollback()?;
            return Ok(ViewabilityWrite::UnknownImpression);
        };

        let Some(revenue) = revenue.filter(|_| viewable) else {
            tx.commit()?;
            return Ok(ViewabilityWrite::NotBilled);
        };

        let revenue_micros = to_micros(revenue);
        let claimed = tx.execute(
            "UPDATE impressions SET billed = 1, revenue_micros = ?2, billed_at = ?3 \
             WHERE id = ?1 AND billed = 0 AND fraud_status = 'clean'",
            params![impression_id, revenue_micros, to_ms(now)],
        )?;
        if claimed == 0 {
            tx.commit()?;
            return Ok(ViewabilityWrite::NotBilled);
        }

        match spend_in_tx(&tx, &campaign_id, revenue_micros)? {
            Some(spend) => {
                tx.commit()?;
                Ok(ViewabilityWrite::Billed(spend))
            }
            None => {
                tx.rollback()?;
                conn.execute(
                    "UPDATE impressions SET budget_exceeded = 1, \
                        viewable = CASE WHEN viewable = 1 THEN 1 ELSE ?2 END \
                     WHERE id = ?1",
                    params![impression_id, viewable as i64],
                )?;
                Ok(ViewabilityWrite::BudgetExceeded)
            }
        }
    }
}
