//! Idempotency keys for impressions and clicks.
//!
//! The first caller to claim `dedup:{kind}:{id}` owns the event for the
//! counting window. Claims are released when the event could not be stored.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::keystore::KeyStore;
use crate::models::EventKind;

pub struct DedupStore {
    keystore: Arc<dyn KeyStore>,
    window: Duration,
}

impl DedupStore {
    pub fn new(keystore: Arc<dyn KeyStore>, window: Duration) -> Self {
        Self { keystore, window }
    }

    fn key(kind: EventKind, idempotency_key: &str) -> String {
        format!("dedup:{}:{}", kind.as_str(), idempotency_key)
    }

    /// Claims the key. Returns true when another caller already holds it.
    pub async fn is_duplicate(&self, kind: EventKind, idempotency_key: &str) -> Result<bool> {
        let claimed = self
            .keystore
            .set_if_absent(&Self::key(kind, idempotency_key), "1", self.window)
            .await?;
        Ok(!claimed)
    }

    pub async fn release(&self, kind: EventKind, idempotency_key: &str) -> Result<()> {
        self.keystore.delete(&Self::key(kind, idempotency_key)).await
    }
}
