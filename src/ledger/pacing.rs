use chrono::{DateTime, Timelike, Utc};

const SECONDS_PER_DAY: f64 = 86_400.0;

pub fn hourly_key(campaign_id: &str, now: DateTime<Utc>) -> String {
    format!("pacing:{}:{}", campaign_id, now.format("%Y%m%d%H"))
}

/// Fraction of the UTC day elapsed, shifted forward by `grace_secs`, capped at 1.
pub fn elapsed_fraction(now: DateTime<Utc>, grace_secs: i64) -> f64 {
    let since_midnight = now.num_seconds_from_midnight() as f64;
    ((since_midnight + grace_secs as f64) / SECONDS_PER_DAY).clamp(0.0, 1.0)
}

/// Probability of serving given how far spend runs ahead of the clock.
pub fn serve_probability(spent_fraction: f64, elapsed_fraction: f64) -> f64 {
    if spent_fraction >= 1.0 {
        0.0
    } else if spent_fraction <= elapsed_fraction {
        1.0
    } else {
        (elapsed_fraction / spent_fraction).clamp(0.0, 1.0)
    }
}

/// Hourly burst guard, in micro-units.
pub fn over_hourly_cap(hour_spent_micros: i64, daily_budget_micros: i64, multiplier: f64) -> bool {
    hour_spent_micros as f64 > multiplier * daily_budget_micros as f64 / 24.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hourly_key_format() {
        let now = Utc.with_ymd_and_hms(2026, 7, 4, 9, 30, 0).unwrap();
        assert_eq!(hourly_key("c1", now), "pacing:c1:2026070409");
    }

    #[test]
    fn test_elapsed_fraction_with_grace() {
        let midnight = Utc.with_ymd_and_hms(2026, 7, 4, 0, 0, 0).unwrap();
        assert!((elapsed_fraction(midnight, 3600) - 1.0 / 24.0).abs() < 1e-12);
        let noon = Utc.with_ymd_and_hms(2026, 7, 4, 12, 0, 0).unwrap();
        assert!((elapsed_fraction(noon, 0) - 0.5).abs() < 1e-12);
        let late = Utc.with_ymd_and_hms(2026, 7, 4, 23, 30, 0).unwrap();
        assert_eq!(elapsed_fraction(late, 3600), 1.0);
    }

    #[test]
    fn test_serve_probability_steers_to_parity() {
        assert_eq!(serve_probability(0.2, 0.5), 1.0);
        assert_eq!(serve_probability(0.5, 0.5), 1.0);
        assert!((serve_probability(0.8, 0.4) - 0.5).abs() < 1e-12);
        assert_eq!(serve_probability(1.0, 0.9), 0.0);
        assert_eq!(serve_probability(1.2, 1.0), 0.0);
    }

    #[test]
    fn test_hourly_cap() {
        // daily 24.0 => even share 1.0/h, cap 3.0/h
        assert!(!over_hourly_cap(3_000_000, 24_000_000, 3.0));
        assert!(over_hourly_cap(3_000_001, 24_000_000, 3.0));
    }
}
