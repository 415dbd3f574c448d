use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;

use super::{to_ms, AdStore};
use crate::models::IvtReason;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IvtReasonCount {
    pub reason: IvtReason,
    pub givt: bool,
    pub impressions: u64,
    pub clicks: u64,
}

/// Measured invalid traffic for one UTC day. Every count comes from the
/// `ivt_reason` recorded on the event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IvtReport {
    pub date: NaiveDate,
    pub total_impressions: u64,
    pub total_clicks: u64,
    pub givt_events: u64,
    pub sivt_events: u64,
    pub ivt_rate: f64,
    pub by_reason: Vec<IvtReasonCount>,
}

impl AdStore {
    pub async fn ivt_report(&self, date: NaiveDate) -> Result<IvtReport> {
        let start = date
            .and_hms_opt(0, 0, 0)
            .map(|d| Utc.from_utc_datetime(&d))
            .ok_or_else(|| anyhow::anyhow!("invalid report date {}", date))?;
        let end = start + chrono::Duration::days(1);
        let (from, to) = (to_ms(start), to_ms(end));

        let conn = self.conn.lock().await;

        let total_impressions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM impressions WHERE created_at >= ?1 AND created_at < ?2",
            params![from, to],
            |row| row.get(0),
        )?;
        let total_clicks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM clicks WHERE created_at >= ?1 AND created_at < ?2",
            params![from, to],
            |row| row.get(0),
        )?;

        let mut by_reason: BTreeMap<&'static str, IvtReasonCount> = BTreeMap::new();
        for (table, is_click) in [("impressions", false), ("clicks", true)] {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT ivt_reason, COUNT(*) FROM {} \
                 WHERE created_at >= ?1 AND created_at < ?2 AND ivt_reason IS NOT NULL \
                 GROUP BY ivt_reason",
                table
            ))?;
            let rows = stmt.query_map(params![from, to], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for r in rows {
                let (raw, n) = r?;
                let Some(reason) = IvtReason::from_str(&raw) else {
                    continue;
                };
                let entry = by_reason.entry(reason.as_str()).or_insert(IvtReasonCount {
                    reason,
                    givt: reason.is_givt(),
                    impressions: 0,
                    clicks: 0,
                });
                if is_click {
                    entry.clicks += n.max(0) as u64;
                } else {
                    entry.impressions += n.max(0) as u64;
                }
            }
        }

        let by_reason: Vec<IvtReasonCount> = by_reason.into_values().collect();
        let (givt_events, sivt_events) = by_reason.iter().fold((0, 0), |(g, s), r| {
            if r.givt {
                (g + r.impressions + r.clicks, s)
            } else {
                (g, s + r.impressions + r.clicks)
            }
        });
        let total = (total_impressions + total_clicks).max(0) as u64;
        let ivt_rate = if total == 0 {
            0.0
        } else {
            (givt_events + sivt_events) as f64 / total as f64
        };

        Ok(IvtReport {
            date,
            total_impressions: total_impressions.max(0) as u64,
            total_clicks: total_clicks.max(0) as u64,
            givt_events,
            sivt_events,
            ivt_rate,
            by_reason,
        })
    }
}
