//! Click-through attribution for conversions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AttributionConfig;
use crate::keystore::KeyStore;
use crate::models::{Conversion, FraudStatus};
use crate::store::{AdStore, ConversionInsert};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionResult {
    pub conversion_id: String,
    pub click_id: String,
    pub attributed: bool,
    pub billable: bool,
    pub time_to_conversion_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No click was ever recorded for the impression
    NoClick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    Created(AttributionResult),
    AlreadyExists,
    Rejected(RejectReason),
}

/// Inclusive at the boundary: exactly `window_days` after the click still counts.
pub fn within_window(elapsed_seconds: i64, window_days: i64) -> bool {
    elapsed_seconds <= window_days.saturating_mul(SECONDS_PER_DAY)
}

pub struct AttributionEngine {
    store: AdStore,
    keystore: Arc<dyn KeyStore>,
    config: AttributionConfig,
}

impl AttributionEngine {
    pub fn new(store: AdStore, keystore: Arc<dyn KeyStore>, config: AttributionConfig) -> Self {
        Self {
            store,
            keystore,
            config,
        }
    }

    fn marker_key(impression_id: &str, conversion_type: &str) -> String {
        format!("conv:{}:{}", impression_id, conversion_type)
    }

    async fn set_marker(&self, key: &str) {
        let ttl = Duration::from_secs(self.config.duplicate_marker_ttl_secs);
        if let Err(e) = self.keystore.set_with_ttl(key, "1", ttl).await {
            warn!("Failed to set conversion marker {}: {}", key, e);
        }
    }

    pub async fn track_conversion(
        &self,
        impression_id: &str,
        conversion_type: &str,
        conversion_value: Option<f64>,
        window_days: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome> {
        let marker = Self::marker_key(impression_id, conversion_type);
        if self.keystore.exists(&marker).await.unwrap_or_else(|e| {
            warn!("Conversion marker lookup failed: {}", e);
            false
        }) {
            return Ok(ConversionOutcome::AlreadyExists);
        }
        if self
            .store
            .conversion_exists(impression_id, conversion_type)
            .await?
        {
            self.set_marker(&marker).await;
            return Ok(ConversionOutcome::AlreadyExists);
        }

        let Some(click) = self.store.latest_click_for_impression(impression_id).await? else {
            debug!(impression_id, "conversion without click");
            return Ok(ConversionOutcome::Rejected(RejectReason::NoClick));
        };

        let window_days = window_days.unwrap_or(self.config.default_window_days);
        let elapsed = (now - click.created_at).num_seconds().max(0);
        let attributed = within_window(elapsed, window_days);
        let billable = attributed && click.fraud_status == FraudStatus::Clean;

        let conversion = Conversion {
            id: Uuid::new_v4().to_string(),
            impression_id: impression_id.to_string(),
            click_id: click.id.clone(),
            conversion_type: conversion_type.to_string(),
            conversion_value,
            attributed_within_window: attributed,
            billable,
            time_to_conversion_seconds: elapsed,
            created_at: now,
        };

        match self.store.insert_conversion(&conversion).await? {
            ConversionInsert::AlreadyExists => {
                self.set_marker(&marker).await;
                Ok(ConversionOutcome::AlreadyExists)
            }
            ConversionInsert::Inserted => {
                self.set_marker(&marker).await;
                counter!("conversions_total", 1, "attributed" => if attributed { "true" } else { "false" });
                Ok(ConversionOutcome::Created(AttributionResult {
                    conversion_id: conversion.id,
                    click_id: click.id,
                    attributed,
                    billable,
                    time_to_conversion_seconds: elapsed,
                }))
            }
        }
    }
}
