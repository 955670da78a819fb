//! Rule and ingestion configuration.
//!
//! Defaults are compiled in; a TOML file passed with `--config` overrides
//! them wholesale. See `monitor.example.toml` for the file layout.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Metric;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default = "default_rules")]
    pub rules: HashMap<Metric, MetricRules>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            rules: default_rules(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestConfig {
    /// When true, a row matching a stored (athlete, metric, recorded_at)
    /// triple is skipped instead of appended again. Off by default: repeat
    /// uploads append duplicate rows.
    #[serde(default)]
    pub dedupe_reingestion: bool,
}

/// Per-metric evaluation settings. Rule shapes are optional; a metric with
/// no shapes configured never produces candidates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricRules {
    /// How many recent measurements the evaluator loads.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Below this many measurements every rule for the metric is skipped.
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default)]
    pub absolute: Option<AbsoluteRule>,
    #[serde(default)]
    pub deviation: Option<DeviationRule>,
    #[serde(default)]
    pub trend: Option<TrendRule>,
}

/// Which side of a bound (or of the trailing mean) counts as a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

/// Latest value crosses a static bound. Bounds tighten with severity: for
/// `Below` the critical bound is the lowest, for `Above` the highest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbsoluteRule {
    pub direction: Direction,
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

/// Latest value sits more than k standard deviations to the adverse side of
/// the trailing mean.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviationRule {
    pub direction: Direction,
    pub moderate_sigma: f64,
    pub high_sigma: f64,
    pub critical_sigma: f64,
}

/// Percentage change between the latest value and the value `span` readings
/// back exceeds a configured delta in the adverse direction.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrendRule {
    pub direction: Direction,
    #[serde(default = "default_span")]
    pub span: usize,
    pub moderate_pct: f64,
    pub high_pct: f64,
    pub critical_pct: f64,
}

fn default_window() -> usize {
    14
}

fn default_min_points() -> usize {
    3
}

fn default_span() -> usize {
    1
}

/// Baseline rule set for the metrics the clubs actually monitor: low HRV and
/// week-over-week HRV drops flag recovery problems, load spikes and ACWR
/// above ~1.5 flag overtraining risk.
pub fn default_rules() -> HashMap<Metric, MetricRules> {
    let mut rules = HashMap::new();

    rules.insert(
        Metric::HrvRmssd,
        MetricRules {
            window: 14,
            min_points: 2,
            absolute: Some(AbsoluteRule {
                direction: Direction::Below,
                moderate: 40.0,
                high: 30.0,
                critical: 20.0,
            }),
            deviation: Some(DeviationRule {
                direction: Direction::Below,
                moderate_sigma: 2.0,
                high_sigma: 3.0,
                critical_sigma: 4.0,
            }),
            trend: Some(TrendRule {
                direction: Direction::Below,
                span: 1,
                moderate_pct: 30.0,
                high_pct: 45.0,
                critical_pct: 60.0,
            }),
        },
    );

    rules.insert(
        Metric::SessionLoad,
        MetricRules {
            window: 10,
            min_points: 3,
            absolute: Some(AbsoluteRule {
                direction: Direction::Above,
                moderate: 600.0,
                high: 750.0,
                critical: 900.0,
            }),
            deviation: Some(DeviationRule {
                direction: Direction::Above,
                moderate_sigma: 2.0,
                high_sigma: 3.0,
                critical_sigma: 4.0,
            }),
            trend: None,
        },
    );

    rules.insert(
        Metric::Acwr,
        MetricRules {
            window: 8,
            min_points: 2,
            absolute: Some(AbsoluteRule {
                direction: Direction::Above,
                moderate: 1.3,
                high: 1.5,
                critical: 1.8,
            }),
            deviation: None,
            trend: None,
        },
    );

    rules.insert(
        Metric::TotalDistance,
        MetricRules {
            window: 14,
            min_points: 4,
            absolute: None,
            deviation: None,
            trend: Some(TrendRule {
                direction: Direction::Below,
                span: 3,
                moderate_pct: 35.0,
                high_pct: 50.0,
                critical_pct: 65.0,
            }),
        },
    );

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_append_duplicate_uploads() {
        assert!(!Config::default().ingest.dedupe_reingestion);
    }

    #[test]
    fn default_rules_cover_hrv_trend_scenario() {
        let rules = default_rules();
        let hrv = rules.get(&Metric::HrvRmssd).expect("hrv rules configured");
        assert_eq!(hrv.min_points, 2);
        let trend = hrv.trend.as_ref().expect("hrv trend rule configured");
        assert_eq!(trend.direction, Direction::Below);
        assert!(trend.moderate_pct <= 30.0);
    }

    #[test]
    fn config_parses_from_toml() {
        let raw = r#"
            [ingest]
            dedupe_reingestion = true

            [rules.hrv_rmssd]
            window = 7
            min_points = 2

            [rules.hrv_rmssd.trend]
            direction = "below"
            span = 1
            moderate_pct = 30.0
            high_pct = 45.0
            critical_pct = 60.0
        "#;
        let config: Config = toml::from_str(raw).expect("config parses");
        assert!(config.ingest.dedupe_reingestion);
        let hrv = config.rules.get(&Metric::HrvRmssd).expect("hrv section");
        assert_eq!(hrv.window, 7);
        assert!(hrv.absolute.is_none());
        assert_eq!(hrv.trend.as_ref().map(|t| t.span), Some(1));
    }
}
