//! Versioned campaign cache
//!
//! Snapshots of eligible campaigns live at `campaigns:v{N}` where N is a shared
//! counter. Invalidation bumps the counter; old snapshots are left to expire.

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::keystore::{get_counter, KeyStore};
use crate::models::Campaign;
use crate::store::AdStore;

pub const VERSION_KEY: &str = "campaigns:version";

pub fn snapshot_key(version: i64) -> String {
    format!("campaigns:v{}", version)
}

#[derive(Clone)]
pub struct CampaignCache {
    store: AdStore,
    keystore: Arc<dyn KeyStore>,
    ttl: Duration,
}

impl CampaignCache {
    pub fn new(store: AdStore, keystore: Arc<dyn KeyStore>, ttl: Duration) -> Self {
        Self {
            store,
            keystore,
            ttl,
        }
    }

    pub async fn current_version(&self) -> Result<i64> {
        get_counter(self.keystore.as_ref(), VERSION_KEY).await
    }

    /// Eligible campaigns for the current cache version.
    pub async fn get_active_campaigns(&self) -> Result<Vec<Campaign>> {
        let version = self.current_version().await?;
        let key = snapshot_key(version);

        if let Some(raw) = self.keystore.get(&key).await? {
            match serde_json::from_str::<Vec<Campaign>>(&raw) {
                Ok(campaigns) => {
                    counter!("campaign_cache_hits_total", 1);
                    debug!(version, count = campaigns.len(), "campaign cache hit");
                    return Ok(campaigns);
                }
                Err(e) => warn!("Discarding unreadable campaign snapshot {}: {}", key, e),
            }
        }

        counter!("campaign_cache_misses_total", 1);
        let campaigns = self
            .store
            .list_eligible_campaigns(Utc::now())
            .await
            .context("Failed to load eligible campaigns")?;
        debug!(version, count = campaigns.len(), "campaign cache miss");

        let raw = serde_json::to_string(&campaigns)?;
        if let Err(e) = self.keystore.set_with_ttl(&key, &raw, self.ttl).await {
            warn!("Failed to write campaign snapshot {}: {}", key, e);
        }
        Ok(campaigns)
    }

    /// Move readers to a fresh snapshot. Returns the new version.
    pub async fn invalidate_campaign_cache(&self) -> Result<i64> {
        let version = self.keystore.incr_by(VERSION_KEY, 1, None).await?;
        counter!("campaign_cache_invalidations_total", 1);
        debug!(version, "campaign cache invalidated");
        Ok(version)
    }
}
