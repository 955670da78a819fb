use uuid::Uuid;

use crate::config::{AbsoluteRule, DeviationRule, Direction, MetricRules, TrendRule};
use crate::models::{AlertLevel, CandidateAlert, Measurement, Metric};

/// Evaluates one athlete/metric window against its configured rules.
///
/// `window` is the most recent measurements, oldest first. Returns at most
/// one candidate: when several rule shapes fire, the highest severity wins
/// and the rest are discarded. Fewer than `min_points` measurements is a
/// normal skip, not an error.
pub fn evaluate_window(
    athlete_id: Uuid,
    metric: Metric,
    rules: &MetricRules,
    window: &[Measurement],
) -> Option<CandidateAlert> {
    if window.len() < rules.min_points {
        tracing::debug!(
            %metric,
            points = window.len(),
            min_points = rules.min_points,
            "insufficient data, rules skipped"
        );
        return None;
    }
    let latest = window.last()?;

    let mut best: Option<(AlertLevel, String)> = None;
    if let Some(rule) = &rules.absolute {
        consider(&mut best, check_absolute(rule, metric, latest.value));
    }
    if let Some(rule) = &rules.deviation {
        consider(&mut best, check_deviation(rule, metric, window));
    }
    if let Some(rule) = &rules.trend {
        consider(&mut best, check_trend(rule, metric, window));
    }

    best.map(|(level, message)| CandidateAlert {
        athlete_id,
        metric,
        level,
        message,
    })
}

fn consider(best: &mut Option<(AlertLevel, String)>, candidate: Option<(AlertLevel, String)>) {
    if let Some((level, message)) = candidate {
        match best {
            Some((current, _)) if *current >= level => {}
            _ => *best = Some((level, message)),
        }
    }
}

fn check_absolute(rule: &AbsoluteRule, metric: Metric, value: f64) -> Option<(AlertLevel, String)> {
    let crossed = |bound: f64| match rule.direction {
        Direction::Above => value > bound,
        Direction::Below => value < bound,
    };
    let (level, bound) = if crossed(rule.critical) {
        (AlertLevel::Critical, rule.critical)
    } else if crossed(rule.high) {
        (AlertLevel::High, rule.high)
    } else if crossed(rule.moderate) {
        (AlertLevel::Moderate, rule.moderate)
    } else {
        return None;
    };
    let side = match rule.direction {
        Direction::Above => "above",
        Direction::Below => "below",
    };
    let message = format!("{metric} at {value:.1} is {side} the {level} bound {bound:.1}");
    Some((level, message))
}

fn check_deviation(
    rule: &DeviationRule,
    metric: Metric,
    window: &[Measurement],
) -> Option<(AlertLevel, String)> {
    let (latest, trailing) = window.split_last()?;
    // Need a usable baseline: at least three trailing readings with spread.
    if trailing.len() < 3 {
        return None;
    }
    let values: Vec<f64> = trailing.iter().map(|m| m.value).collect();
    let mean = mean(&values);
    let sd = pstdev(&values, mean);
    if sd == 0.0 {
        return None;
    }

    let delta = latest.value - mean;
    let adverse_sigmas = match rule.direction {
        Direction::Above => delta / sd,
        Direction::Below => -delta / sd,
    };
    let (level, limit) = if adverse_sigmas > rule.critical_sigma {
        (AlertLevel::Critical, rule.critical_sigma)
    } else if adverse_sigmas > rule.high_sigma {
        (AlertLevel::High, rule.high_sigma)
    } else if adverse_sigmas > rule.moderate_sigma {
        (AlertLevel::Moderate, rule.moderate_sigma)
    } else {
        return None;
    };
    let side = match rule.direction {
        Direction::Above => "above",
        Direction::Below => "below",
    };
    let message = format!(
        "{metric} at {value:.1} is {sigmas:.1} sigma {side} its trailing mean {mean:.1} (limit {limit:.1})",
        value = latest.value,
        sigmas = adverse_sigmas,
    );
    Some((level, message))
}

fn check_trend(
    rule: &TrendRule,
    metric: Metric,
    window: &[Measurement],
) -> Option<(AlertLevel, String)> {
    if rule.span == 0 || window.len() <= rule.span {
        return None;
    }
    let latest = window.last()?;
    let base = &window[window.len() - 1 - rule.span];
    if base.value == 0.0 {
        return None;
    }

    let change_pct = (latest.value - base.value) / base.value * 100.0;
    let adverse_pct = match rule.direction {
        Direction::Above => change_pct,
        Direction::Below => -change_pct,
    };
    let (level, bound) = if adverse_pct > rule.critical_pct {
        (AlertLevel::Critical, rule.critical_pct)
    } else if adverse_pct > rule.high_pct {
        (AlertLevel::High, rule.high_pct)
    } else if adverse_pct > rule.moderate_pct {
        (AlertLevel::Moderate, rule.moderate_pct)
    } else {
        return None;
    };
    let verb = match rule.direction {
        Direction::Above => "rose",
        Direction::Below => "dropped",
    };
    let message = format!(
        "{metric} {verb} {pct:.1}% over {span} reading(s) ({base:.1} -> {value:.1}), past the {bound:.0}% bound",
        pct = adverse_pct,
        span = rule.span,
        base = base.value,
        value = latest.value,
    );
    Some((level, message))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, matching the baseline statistic the
/// scoring window uses elsewhere in the pipeline.
fn pstdev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn window_of(values: &[f64]) -> Vec<Measurement> {
        let athlete_id = Uuid::new_v4();
        let now = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| Measurement {
                id: Uuid::new_v4(),
                athlete_id,
                metric: Metric::HrvRmssd,
                value: *value,
                unit: "ms".to_string(),
                recorded_at: now - Duration::days((values.len() - i) as i64),
            })
            .collect()
    }

    fn hrv_rules() -> MetricRules {
        MetricRules {
            window: 14,
            min_points: 2,
            absolute: None,
            deviation: None,
            trend: Some(TrendRule {
                direction: Direction::Below,
                span: 1,
                moderate_pct: 30.0,
                high_pct: 45.0,
                critical_pct: 60.0,
            }),
        }
    }

    #[test]
    fn week_over_week_hrv_drop_produces_single_high_candidate() {
        // 45.2 -> 20.0 is a 55.8% drop: past the 45% bound, short of 60%.
        let window = window_of(&[45.2, 20.0]);
        let candidate = evaluate_window(window[0].athlete_id, Metric::HrvRmssd, &hrv_rules(), &window)
            .expect("drop must produce a candidate");
        assert_eq!(candidate.level, AlertLevel::High);
        assert!(candidate.message.contains("hrv_rmssd"));
        assert!(candidate.message.contains("55.8"));
    }

    #[test]
    fn fewer_points_than_minimum_is_a_silent_skip() {
        let window = window_of(&[20.0]);
        let candidate =
            evaluate_window(window[0].athlete_id, Metric::HrvRmssd, &hrv_rules(), &window);
        assert!(candidate.is_none());
    }

    #[test]
    fn empty_window_produces_nothing() {
        let rules = hrv_rules();
        assert!(evaluate_window(Uuid::new_v4(), Metric::HrvRmssd, &rules, &[]).is_none());
    }

    #[test]
    fn absolute_bound_severity_tiers() {
        let rule = AbsoluteRule {
            direction: Direction::Below,
            moderate: 40.0,
            high: 30.0,
            critical: 20.0,
        };
        assert_eq!(
            check_absolute(&rule, Metric::HrvRmssd, 35.0).map(|c| c.0),
            Some(AlertLevel::Moderate)
        );
        assert_eq!(
            check_absolute(&rule, Metric::HrvRmssd, 25.0).map(|c| c.0),
            Some(AlertLevel::High)
        );
        assert_eq!(
            check_absolute(&rule, Metric::HrvRmssd, 12.0).map(|c| c.0),
            Some(AlertLevel::Critical)
        );
        assert!(check_absolute(&rule, Metric::HrvRmssd, 41.0).is_none());
        // The bound itself is not a breach.
        assert!(check_absolute(&rule, Metric::HrvRmssd, 40.0).is_none());
    }

    #[test]
    fn deviation_only_fires_on_the_adverse_side() {
        let rule = DeviationRule {
            direction: Direction::Below,
            moderate_sigma: 2.0,
            high_sigma: 3.0,
            critical_sigma: 4.0,
        };
        // Trailing mean 50, sd 2. A spike up is not adverse for HRV.
        let up = window_of(&[48.0, 50.0, 52.0, 50.0, 70.0]);
        assert!(check_deviation(&rule, Metric::HrvRmssd, &up).is_none());

        let down = window_of(&[48.0, 50.0, 52.0, 50.0, 40.0]);
        let fired = check_deviation(&rule, Metric::HrvRmssd, &down).expect("drop fires");
        assert!(fired.0 >= AlertLevel::High);
    }

    #[test]
    fn flat_baseline_yields_no_deviation_candidate() {
        let rule = DeviationRule {
            direction: Direction::Below,
            moderate_sigma: 2.0,
            high_sigma: 3.0,
            critical_sigma: 4.0,
        };
        let window = window_of(&[50.0, 50.0, 50.0, 50.0, 10.0]);
        assert!(check_deviation(&rule, Metric::HrvRmssd, &window).is_none());
    }

    #[test]
    fn highest_severity_candidate_wins_across_rules() {
        let rules = MetricRules {
            window: 14,
            min_points: 2,
            absolute: Some(AbsoluteRule {
                direction: Direction::Below,
                moderate: 40.0,
                high: 30.0,
                critical: 10.0,
            }),
            deviation: None,
            trend: Some(TrendRule {
                direction: Direction::Below,
                span: 1,
                moderate_pct: 10.0,
                high_pct: 30.0,
                critical_pct: 50.0,
            }),
        };
        // Absolute says High (25 < 30); trend says Critical (69% drop).
        let window = window_of(&[80.0, 25.0]);
        let candidate = evaluate_window(window[0].athlete_id, Metric::HrvRmssd, &rules, &window)
            .expect("rules fire");
        assert_eq!(candidate.level, AlertLevel::Critical);
    }

    #[test]
    fn trend_ignores_zero_baseline() {
        let rule = TrendRule {
            direction: Direction::Below,
            span: 1,
            moderate_pct: 30.0,
            high_pct: 45.0,
            critical_pct: 60.0,
        };
        let window = window_of(&[0.0, 10.0]);
        assert!(check_trend(&rule, Metric::HrvRmssd, &window).is_none());
    }

    #[test]
    fn trend_requires_span_plus_one_points() {
        let rule = TrendRule {
            direction: Direction::Below,
            span: 3,
            moderate_pct: 30.0,
            high_pct: 45.0,
            critical_pct: 60.0,
        };
        let window = window_of(&[50.0, 40.0, 30.0]);
        assert!(check_trend(&rule, Metric::HrvRmssd, &window).is_none());
    }

    #[test]
    fn message_names_metric_value_and_bound() {
        let rule = AbsoluteRule {
            direction: Direction::Above,
            moderate: 600.0,
            high: 750.0,
            critical: 900.0,
        };
        let (level, message) =
            check_absolute(&rule, Metric::SessionLoad, 820.0).expect("load breach");
        assert_eq!(level, AlertLevel::High);
        assert!(message.contains("session_load"));
        assert!(message.contains("820.0"));
        assert!(message.contains("750.0"));
    }
}
