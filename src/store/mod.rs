//! System of record
//! Mission: campaigns, events and conversions in SQLite with conditional,
//! transactional writes for everything that moves money.
//!
//! Key properties:
//! - WAL mode + busy timeout so several service instances can share one file
//! - Budget guard lives in the UPDATE's WHERE clause, never in application code
//! - Money columns are integer micro-units

pub mod campaigns;
pub mod conversions;
pub mod events;
pub mod reports;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use campaigns::{BlockSide, CtrStats, SpendResult};
pub use conversions::ConversionInsert;
pub use events::{EventWrite, ViewabilityWrite};
pub use reports::{IvtReasonCount, IvtReport};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    advertiser_id TEXT NOT NULL,
    bid_model TEXT NOT NULL,
    bid_amount REAL NOT NULL,
    total_micros INTEGER NOT NULL,
    spent_micros INTEGER NOT NULL DEFAULT 0,
    daily_micros INTEGER,
    targeting_json TEXT NOT NULL DEFAULT '{}',
    creative_format TEXT NOT NULL,
    creative_width INTEGER,
    creative_height INTEGER,
    creative_url TEXT NOT NULL,
    landing_url TEXT NOT NULL,
    status TEXT NOT NULL,
    start_at INTEGER,
    end_at INTEGER,
    requires_viewability INTEGER NOT NULL DEFAULT 0,
    CHECK (spent_micros <= total_micros)
);

CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

CREATE TABLE IF NOT EXISTS publishers (
    id TEXT PRIMARY KEY,
    quality_score REAL NOT NULL,
    categories_json TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS ad_slots (
    id TEXT PRIMARY KEY,
    publisher_id TEXT NOT NULL,
    format TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    floor_cpm REAL
);

CREATE TABLE IF NOT EXISTS brand_blocks (
    publisher_id TEXT NOT NULL,
    advertiser_id TEXT NOT NULL,
    blocked_by TEXT NOT NULL,
    PRIMARY KEY (publisher_id, advertiser_id, blocked_by)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS impressions (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    publisher_id TEXT NOT NULL,
    slot_id TEXT NOT NULL,
    geo TEXT,
    device TEXT,
    session_id TEXT,
    ip TEXT,
    revenue_micros INTEGER,
    fraud_score REAL,
    fraud_status TEXT NOT NULL,
    ivt_reason TEXT,
    sivt_checked INTEGER NOT NULL DEFAULT 0,
    viewable INTEGER,
    billed INTEGER NOT NULL DEFAULT 0,
    budget_exceeded INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    billed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_impressions_campaign_billed
    ON impressions(campaign_id, billed, billed_at);
CREATE INDEX IF NOT EXISTS idx_impressions_created_at ON impressions(created_at);

CREATE TABLE IF NOT EXISTS clicks (
    id TEXT PRIMARY KEY,
    impression_id TEXT NOT NULL UNIQUE,
    campaign_id TEXT NOT NULL,
    publisher_id TEXT NOT NULL,
    slot_id TEXT NOT NULL,
    geo TEXT,
    device TEXT,
    session_id TEXT,
    ip TEXT,
    revenue_micros INTEGER,
    fraud_score REAL,
    fraud_status TEXT NOT NULL,
    ivt_reason TEXT,
    sivt_checked INTEGER NOT NULL DEFAULT 0,
    billed INTEGER NOT NULL DEFAULT 0,
    budget_exceeded INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    billed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_clicks_campaign_billed
    ON clicks(campaign_id, billed, billed_at);
CREATE INDEX IF NOT EXISTS idx_clicks_created_at ON clicks(created_at);

CREATE TABLE IF NOT EXISTS conversions (
    id TEXT PRIMARY KEY,
    impression_id TEXT NOT NULL,
    click_id TEXT NOT NULL,
    conversion_type TEXT NOT NULL,
    conversion_value REAL,
    attributed_within_window INTEGER NOT NULL,
    billable INTEGER NOT NULL,
    time_to_conversion_seconds INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (impression_id, conversion_type)
);
"#;

/// Shared handle to the ad database
#[derive(Clone)]
pub struct AdStore {
    conn: Arc<Mutex<Connection>>,
}

impl AdStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        let store = Self::init(conn)?;

        info!("📊 Ad database initialized at: {}", db_path);
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && journal_mode.to_lowercase() != "memory" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Start of the UTC day containing `now`
pub(crate) fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_start() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(
            day_start(now),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_ms_roundtrip() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(from_ms(to_ms(now)), now);
    }

    #[test]
    fn test_schema_applies_twice() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        AdStore::new(path).unwrap();
        AdStore::new(path).unwrap();
    }
}
