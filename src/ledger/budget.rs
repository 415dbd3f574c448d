use serde::Serialize;

use crate::models::from_micros;
use crate::store::SpendResult;

/// Spend percentages at which the campaign cache is refreshed.
pub const THRESHOLDS: [u32; 5] = [25, 50, 75, 90, 100];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpendOutcome {
    pub accepted: bool,
    pub new_spent: f64,
    pub new_total: f64,
}

impl SpendOutcome {
    pub fn accepted(spend: &SpendResult) -> Self {
        Self {
            accepted: true,
            new_spent: from_micros(spend.after_micros),
            new_total: from_micros(spend.total_micros),
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            new_spent: 0.0,
            new_total: 0.0,
        }
    }
}

/// Thresholds `t` with `before < t% <= after`, compared exactly in micro-units.
pub fn crossed_thresholds(before_micros: i64, after_micros: i64, total_micros: i64) -> Vec<u32> {
    if total_micros <= 0 {
        return Vec::new();
    }
    let (before, after, total) = (
        before_micros as i128 * 100,
        after_micros as i128 * 100,
        total_micros as i128,
    );
    THRESHOLDS
        .iter()
        .copied()
        .filter(|&t| {
            let mark = t as i128 * total;
            before < mark && mark <= after
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: i64 = 100_000_000;

    #[test]
    fn test_crossing_25_percent() {
        assert_eq!(crossed_thresholds(24_900_000, 25_100_000, TOTAL), vec![25]);
    }

    #[test]
    fn test_no_crossing_between_marks() {
        assert!(crossed_thresholds(26_000_000, 27_000_000, TOTAL).is_empty());
        assert!(crossed_thresholds(0, 10_000, TOTAL).is_empty());
    }

    #[test]
    fn test_landing_exactly_on_a_mark_counts_once() {
        assert_eq!(crossed_thresholds(49_000_000, 50_000_000, TOTAL), vec![50]);
        assert!(crossed_thresholds(50_000_000, 51_000_000, TOTAL).is_empty());
    }

    #[test]
    fn test_large_spend_crosses_several() {
        assert_eq!(
            crossed_thresholds(20_000_000, 100_000_000, TOTAL),
            vec![25, 50, 75, 90, 100]
        );
        assert!(crossed_thresholds(0, 0, 0).is_empty());
    }
}
