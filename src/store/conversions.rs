use anyhow::Result;
use rusqlite::{params, ErrorCode};

use super::{to_ms, AdStore};
use crate::models::Conversion;

/// Outcome of a conversion insert against the (impression, type) uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionInsert {
    Inserted,
    AlreadyExists,
}

impl AdStore {
    pub async fn conversion_exists(&self, impression_id: &str, conversion_type: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM conversions WHERE impression_id = ?1 AND conversion_type = ?2 LIMIT 1",
        )?;
        Ok(stmt.exists(params![impression_id, conversion_type])?)
    }

    pub async fn insert_conversion(&self, conversion: &Conversion) -> Result<ConversionInsert> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO conversions (
                id, impression_id, click_id, conversion_type, conversion_value,
                attributed_within_window, billable, time_to_conversion_seconds, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &conversion.id,
                &conversion.impression_id,
                &conversion.click_id,
                &conversion.conversion_type,
                conversion.conversion_value,
                conversion.attributed_within_window as i64,
                conversion.billable as i64,
                conversion.time_to_conversion_seconds,
                to_ms(conversion.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(ConversionInsert::Inserted),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(ConversionInsert::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }
}
