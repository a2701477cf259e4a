//! Speed classifier: (speed, ignition) -> display category and color.

use serde::{Deserialize, Serialize};

/// Speed category key attached to every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeedCategory {
    Stopped,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl SpeedCategory {
    /// All categories, slowest first.
    pub const ALL: [SpeedCategory; 5] = [
        SpeedCategory::Stopped,
        SpeedCategory::Low,
        SpeedCategory::Medium,
        SpeedCategory::High,
        SpeedCategory::VeryHigh,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SpeedCategory::Stopped => "stopped",
            SpeedCategory::Low => "low",
            SpeedCategory::Medium => "medium",
            SpeedCategory::High => "high",
            SpeedCategory::VeryHigh => "very-high",
        }
    }
}

impl std::fmt::Display for SpeedCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Hex colors per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedPalette {
    pub stopped: String,
    pub low: String,
    pub medium: String,
    pub high: String,
    pub very_high: String,
}

impl Default for SpeedPalette {
    fn default() -> Self {
        Self {
            stopped: "#6b7280".to_string(),   // gray
            low: "#10b981".to_string(),       // green
            medium: "#f59e0b".to_string(),    // amber
            high: "#f97316".to_string(),      // orange
            very_high: "#ef4444".to_string(), // red
        }
    }
}

impl SpeedPalette {
    pub fn color(&self, category: SpeedCategory) -> &str {
        match category {
            SpeedCategory::Stopped => &self.stopped,
            SpeedCategory::Low => &self.low,
            SpeedCategory::Medium => &self.medium,
            SpeedCategory::High => &self.high,
            SpeedCategory::VeryHigh => &self.very_high,
        }
    }
}

/// Band upper bounds (inclusive, km/h). Anything above `high_max_kmh` is very high.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedBands {
    /// Speeds at or below this count as stopped (default: 0.0)
    pub stopped_max_kmh: f64,

    /// Parking and crawling traffic (default: 20.0)
    pub low_max_kmh: f64,

    /// City driving (default: 50.0)
    pub medium_max_kmh: f64,

    /// Highway (default: 90.0)
    pub high_max_kmh: f64,

    pub palette: SpeedPalette,
}

impl Default for SpeedBands {
    fn default() -> Self {
        Self {
            stopped_max_kmh: 0.0,
            low_max_kmh: 20.0,
            medium_max_kmh: 50.0,
            high_max_kmh: 90.0,
            palette: SpeedPalette::default(),
        }
    }
}

/// Output of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedClass {
    pub category: SpeedCategory,
    pub color: String,
}

/// One row of the map legend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegendEntry {
    pub category: SpeedCategory,
    pub color: String,
    pub label: String,
    pub range: String,
}

impl SpeedBands {
    /// Category for a speed sample. Ignition off always reads as stopped;
    /// absent or non-finite speed reads as 0.
    pub fn category(&self, speed_kmh: Option<f64>, ignition_on: bool) -> SpeedCategory {
        if !ignition_on {
            return SpeedCategory::Stopped;
        }

        let speed = speed_kmh.filter(|s| s.is_finite()).unwrap_or(0.0);
        if speed <= self.stopped_max_kmh {
            SpeedCategory::Stopped
        } else if speed <= self.low_max_kmh {
            SpeedCategory::Low
        } else if speed <= self.medium_max_kmh {
            SpeedCategory::Medium
        } else if speed <= self.high_max_kmh {
            SpeedCategory::High
        } else {
            SpeedCategory::VeryHigh
        }
    }

    pub fn classify(&self, speed_kmh: Option<f64>, ignition_on: bool) -> SpeedClass {
        let category = self.category(speed_kmh, ignition_on);
        SpeedClass {
            category,
            color: self.palette.color(category).to_string(),
        }
    }

    /// Legend rows in display order.
    pub fn legend(&self) -> Vec<LegendEntry> {
        let row = |category: SpeedCategory, label: &str, range: String| LegendEntry {
            category,
            color: self.palette.color(category).to_string(),
            label: label.to_string(),
            range,
        };

        vec![
            row(SpeedCategory::Stopped, "Stationary", format!("{} km/h", self.stopped_max_kmh)),
            row(
                SpeedCategory::Low,
                "Slow",
                format!("{}-{} km/h", self.stopped_max_kmh, self.low_max_kmh),
            ),
            row(
                SpeedCategory::Medium,
                "City",
                format!("{}-{} km/h", self.low_max_kmh, self.medium_max_kmh),
            ),
            row(
                SpeedCategory::High,
                "Highway",
                format!("{}-{} km/h", self.medium_max_kmh, self.high_max_kmh),
            ),
            row(SpeedCategory::VeryHigh, "High Speed", format!("{}+ km/h", self.high_max_kmh)),
        ]
    }
}
