use chrono::{DateTime, Utc};

use crate::models::{FraudStatus, IvtReason};

pub const SUSPICIOUS_THRESHOLD: f64 = 0.5;
pub const FRAUD_THRESHOLD: f64 = 0.7;
pub const BLOCK_THRESHOLD: f64 = 0.9;

pub fn classify_score(score: f64) -> FraudStatus {
    if score >= BLOCK_THRESHOLD {
        FraudStatus::Blocked
    } else if score >= FRAUD_THRESHOLD {
        FraudStatus::Fraud
    } else if score >= SUSPICIOUS_THRESHOLD {
        FraudStatus::Suspicious
    } else {
        FraudStatus::Clean
    }
}

/// Timing heuristic for clicks: missing impression or a click faster than
/// `fast_click_ms` after it.
pub fn click_timing_signal(
    impression_at: Option<DateTime<Utc>>,
    click_at: DateTime<Utc>,
    fast_click_ms: i64,
) -> Option<IvtReason> {
    match impression_at {
        None => Some(IvtReason::NoImpression),
        Some(at) if (click_at - at).num_milliseconds() < fast_click_ms => {
            Some(IvtReason::FastClick)
        }
        Some(_) => None,
    }
}

/// Final fraud decision for one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub status: FraudStatus,
    pub score: Option<f64>,
    pub reason: Option<IvtReason>,
    pub sivt_checked: bool,
}

impl Classification {
    pub fn clean() -> Self {
        Self {
            status: FraudStatus::Clean,
            score: None,
            reason: None,
            sivt_checked: false,
        }
    }

    /// Filtered before scoring; never reaches the scorer.
    pub fn givt(reason: IvtReason) -> Self {
        Self {
            status: FraudStatus::Blocked,
            score: None,
            reason: Some(reason),
            sivt_checked: false,
        }
    }

    pub fn from_score(score: f64) -> Self {
        let status = classify_score(score);
        Self {
            status,
            score: Some(score),
            reason: (status != FraudStatus::Clean).then_some(IvtReason::SivtScore),
            sivt_checked: true,
        }
    }

    /// Combine with a timing signal (always suspicious). The worse status wins
    /// and its reason is kept; on a tie the timing reason is kept.
    pub fn with_timing(self, signal: Option<IvtReason>) -> Self {
        let Some(reason) = signal else {
            return self;
        };
        if FraudStatus::Suspicious >= self.status {
            Self {
                status: FraudStatus::Suspicious,
                reason: Some(reason),
                ..self
            }
        } else {
            self
        }
    }

    pub fn is_billable(&self) -> bool {
        self.status.is_billable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_threshold_monotonicity() {
        let table = [
            (0.0, FraudStatus::Clean),
            (0.49, FraudStatus::Clean),
            (0.5, FraudStatus::Suspicious),
            (0.69, FraudStatus::Suspicious),
            (0.7, FraudStatus::Fraud),
            (0.89, FraudStatus::Fraud),
            (0.9, FraudStatus::Blocked),
            (1.0, FraudStatus::Blocked),
        ];
        for (score, expected) in table {
            let c = Classification::from_score(score);
            assert_eq!(c.status, expected, "score {}", score);
            assert_eq!(c.is_billable(), expected == FraudStatus::Clean, "score {}", score);
        }
    }

    #[test]
    fn test_fast_click_overrides_clean_score() {
        let imp_at = Utc::now();
        let click_at = imp_at + Duration::milliseconds(500);
        let signal = click_timing_signal(Some(imp_at), click_at, 1000);
        assert_eq!(signal, Some(IvtReason::FastClick));

        let c = Classification::from_score(0.1).with_timing(signal);
        assert_eq!(c.status, FraudStatus::Suspicious);
        assert_eq!(c.reason, Some(IvtReason::FastClick));
        assert!(!c.is_billable());
    }

    #[test]
    fn test_timing_boundaries() {
        let imp_at = Utc::now();
        assert_eq!(
            click_timing_signal(Some(imp_at), imp_at + Duration::milliseconds(1000), 1000),
            None
        );
        assert_eq!(
            click_timing_signal(None, imp_at, 1000),
            Some(IvtReason::NoImpression)
        );
    }

    #[test]
    fn test_worse_status_wins() {
        let fraud = Classification::from_score(0.75).with_timing(Some(IvtReason::FastClick));
        assert_eq!(fraud.status, FraudStatus::Fraud);
        assert_eq!(fraud.reason, Some(IvtReason::SivtScore));

        let untimed = Classification::clean().with_timing(None);
        assert_eq!(untimed, Classification::clean());
    }
}
