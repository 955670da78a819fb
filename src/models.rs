use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Measurable quantities tracked per athlete over time.
///
/// Canonical names double as the stored representation and the JSON wire
/// form; CSV column headers are resolved through [`Metric::from_column`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HrvRmssd,
    TotalDistance,
    HighSpeedDistance,
    HighMetabolicLoadDistance,
    SprintDistance,
    SprintSpeed,
    SessionLoad,
    Acwr,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::HrvRmssd,
        Metric::TotalDistance,
        Metric::HighSpeedDistance,
        Metric::HighMetabolicLoadDistance,
        Metric::SprintDistance,
        Metric::SprintSpeed,
        Metric::SessionLoad,
        Metric::Acwr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HrvRmssd => "hrv_rmssd",
            Metric::TotalDistance => "total_distance",
            Metric::HighSpeedDistance => "high_speed_distance",
            Metric::HighMetabolicLoadDistance => "high_metabolic_load_distance",
            Metric::SprintDistance => "sprint_distance",
            Metric::SprintSpeed => "sprint_speed",
            Metric::SessionLoad => "session_load",
            Metric::Acwr => "acwr",
        }
    }

    /// Parses a stored or canonical metric name.
    pub fn parse(name: &str) -> Option<Metric> {
        Metric::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Resolves a CSV header cell to a metric, case-insensitively.
    ///
    /// Vendor exports disagree on naming, so the common aliases from GPS and
    /// HRV platforms map onto the canonical metrics. Unknown headers return
    /// `None` and the column is ignored by the parser.
    pub fn from_column(header: &str) -> Option<Metric> {
        let name = header.trim().to_ascii_lowercase();
        match name.as_str() {
            "hrv_rmssd" | "rmssd" | "hrv" | "avg_hrv" => Some(Metric::HrvRmssd),
            "total_distance" | "total distance" => Some(Metric::TotalDistance),
            "high_speed_distance"
            | "hsr_distance"
            | "hsr distance"
            | "high speed running distance" => Some(Metric::HighSpeedDistance),
            "hmld" | "high_metabolic_load_distance" => Some(Metric::HighMetabolicLoadDistance),
            "sprint_distance" | "sprint distance" => Some(Metric::SprintDistance),
            "sprint_speed" | "sprint speed" | "max_speed" => Some(Metric::SprintSpeed),
            "session_load" | "session load" => Some(Metric::SessionLoad),
            "acwr" => Some(Metric::Acwr),
            _ => None,
        }
    }

    /// Unit applied when a file does not carry one.
    pub fn default_unit(&self) -> &'static str {
        match self {
            Metric::HrvRmssd => "ms",
            Metric::TotalDistance
            | Metric::HighSpeedDistance
            | Metric::HighMetabolicLoadDistance
            | Metric::SprintDistance => "m",
            Metric::SprintSpeed => "km/h",
            Metric::SessionLoad => "au",
            Metric::Acwr => "ratio",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered so that `Moderate < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Moderate,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Moderate => "moderate",
            AlertLevel::High => "high",
            AlertLevel::Critical => "critical",
        }
    }

    pub fn parse(name: &str) -> Option<AlertLevel> {
        match name {
            "moderate" => Some(AlertLevel::Moderate),
            "high" => Some(AlertLevel::High),
            "critical" => Some(AlertLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Athlete {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: Option<String>,
    pub code: Option<String>,
    pub club: Option<String>,
    pub coach: Option<String>,
    pub assessment: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// An athlete referenced by a CSV row, before resolution against the store.
#[derive(Debug, Clone)]
pub struct AthleteRef {
    pub code: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub club: Option<String>,
    pub coach: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAthlete {
    pub first_name: String,
    pub last_name: Option<String>,
    pub code: Option<String>,
    pub club: Option<String>,
    pub coach: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub id: Uuid,
    pub athlete_id: Uuid,
    pub metric: Metric,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMeasurement {
    pub athlete_id: Uuid,
    pub metric: Metric,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
    pub source: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub athlete_id: Uuid,
    pub metric: Metric,
    pub level: AlertLevel,
    pub message: String,
    pub generated_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// An alert proposed by rule evaluation, before deduplication against the
/// open alerts already in the store.
#[derive(Debug, Clone)]
pub struct CandidateAlert {
    pub athlete_id: Uuid,
    pub metric: Metric,
    pub level: AlertLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertWithAthlete {
    pub alert: Alert,
    pub athlete_name: String,
}

#[derive(Debug, Clone)]
pub struct AlertMixSummary {
    pub metric: Metric,
    pub count: usize,
    pub open_count: usize,
    pub max_level: AlertLevel,
}

/// A rejected CSV row: 1-based line number in the uploaded file (the header
/// is line 1) and the reason the row was skipped.
#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub line: u64,
    pub reason: String,
}

/// Outcome of one CSV batch. `inserted` and `skipped` count data rows, so
/// `inserted + skipped` equals the number of data rows in the file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub row_errors: Vec<RowError>,
    pub players_touched: BTreeSet<Uuid>,
    pub metrics_detected: BTreeSet<Metric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_columns_resolve_case_insensitively() {
        assert_eq!(Metric::from_column("HRV_RMSSD"), Some(Metric::HrvRmssd));
        assert_eq!(Metric::from_column("rMSSD"), Some(Metric::HrvRmssd));
        assert_eq!(Metric::from_column("Total Distance"), Some(Metric::TotalDistance));
        assert_eq!(Metric::from_column("HMLD"), Some(Metric::HighMetabolicLoadDistance));
        assert_eq!(Metric::from_column("coach_notes"), None);
    }

    #[test]
    fn metric_round_trips_through_stored_name() {
        for metric in Metric::ALL {
            assert_eq!(Metric::parse(metric.as_str()), Some(metric));
        }
    }

    #[test]
    fn alert_levels_are_ordered_by_severity() {
        assert!(AlertLevel::Moderate < AlertLevel::High);
        assert!(AlertLevel::High < AlertLevel::Critical);
        assert_eq!(AlertLevel::parse("critical"), Some(AlertLevel::Critical));
        assert_eq!(AlertLevel::parse("warning"), None);
    }
}
