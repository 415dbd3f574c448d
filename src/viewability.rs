//! IAB/MRC display viewability.

use serde::{Deserialize, Serialize};

pub const MIN_VIEWABLE_TIME_MS: i64 = 1000;
pub const MIN_VIEWPORT_PERCENTAGE: f64 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewabilityMeasurement {
    pub slot_id: String,
    /// Milliseconds with at least the viewport threshold on screen
    pub viewable_time: i64,
    pub total_time: i64,
    pub viewport_percentage: f64,
}

impl ViewabilityMeasurement {
    pub fn validate(&self) -> Result<(), String> {
        if self.slot_id.trim().is_empty() {
            return Err("slot_id is required".to_string());
        }
        if self.viewable_time < 0 || self.total_time < 0 {
            return Err("times must be non-negative".to_string());
        }
        if self.viewable_time > self.total_time {
            return Err("viewable_time cannot exceed total_time".to_string());
        }
        if !(0.0..=100.0).contains(&self.viewport_percentage) {
            return Err("viewport_percentage must be between 0 and 100".to_string());
        }
        Ok(())
    }

    pub fn is_viewable(&self) -> bool {
        self.viewable_time >= MIN_VIEWABLE_TIME_MS
            && self.viewport_percentage >= MIN_VIEWPORT_PERCENTAGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViewabilityResult {
    pub viewable: bool,
    /// True only for the confirmation that billed the impression
    pub billed: bool,
    pub revenue: Option<f64>,
}
