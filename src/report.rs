use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{AlertLevel, AlertMixSummary, AlertWithAthlete};

pub fn summarize_by_metric(alerts: &[AlertWithAthlete]) -> Vec<AlertMixSummary> {
    let mut map: std::collections::HashMap<_, (usize, usize, AlertLevel)> =
        std::collections::HashMap::new();

    for entry in alerts {
        let stats = map
            .entry(entry.alert.metric)
            .or_insert((0, 0, entry.alert.level));
        stats.0 += 1;
        if !entry.alert.acknowledged {
            stats.1 += 1;
        }
        if entry.alert.level > stats.2 {
            stats.2 = entry.alert.level;
        }
    }

    let mut summaries: Vec<AlertMixSummary> = map
        .into_iter()
        .map(|(metric, (count, open_count, max_level))| AlertMixSummary {
            metric,
            count,
            open_count,
            max_level,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn build_report(
    scope: Option<&str>,
    since_days: i64,
    cutoff: DateTime<Utc>,
    alerts: &[AlertWithAthlete],
) -> String {
    let summaries = summarize_by_metric(alerts);

    let mut output = String::new();
    let scope_label = scope.unwrap_or("the whole squad");

    let _ = writeln!(output, "# Readiness Report");
    let _ = writeln!(
        output,
        "Generated for {} (alerts from the last {} days, since {})",
        scope_label,
        since_days,
        cutoff.date_naive()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Alert Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No alerts generated in this window.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} alerts ({} open, worst {})",
                summary.metric, summary.count, summary.open_count, summary.max_level
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Alerts");

    let open: Vec<&AlertWithAthlete> = alerts.iter().filter(|a| !a.alert.acknowledged).collect();
    if open.is_empty() {
        let _ = writeln!(output, "No open alerts. Squad is in the clear.");
    } else {
        for entry in open.iter().take(10) {
            let _ = writeln!(
                output,
                "- [{}] {} on {}: {}",
                entry.alert.level,
                entry.athlete_name,
                entry.alert.generated_at.date_naive(),
                entry.alert.message
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Activity");

    if alerts.is_empty() {
        let _ = writeln!(output, "No alert activity in this window.");
    } else {
        for entry in alerts.iter().take(5) {
            let status = if entry.alert.acknowledged {
                "acknowledged"
            } else {
                "open"
            };
            let _ = writeln!(
                output,
                "- {} ({}, {}) on {}: {}",
                entry.athlete_name,
                entry.alert.level,
                status,
                entry.alert.generated_at.date_naive(),
                entry.alert.message
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Alert, Metric};
    use chrono::Duration;
    use uuid::Uuid;

    fn entry(metric: Metric, level: AlertLevel, acknowledged: bool, days_ago: i64) -> AlertWithAthlete {
        AlertWithAthlete {
            alert: Alert {
                id: Uuid::new_v4(),
                athlete_id: Uuid::new_v4(),
                metric,
                level,
                message: format!("{metric} breached a bound"),
                generated_at: Utc::now() - Duration::days(days_ago),
                acknowledged,
            },
            athlete_name: "Rafael Moreira".to_string(),
        }
    }

    #[test]
    fn summaries_track_counts_and_worst_level() {
        let alerts = vec![
            entry(Metric::HrvRmssd, AlertLevel::Moderate, true, 6),
            entry(Metric::HrvRmssd, AlertLevel::Critical, false, 2),
            entry(Metric::SessionLoad, AlertLevel::High, false, 1),
        ];
        let summaries = summarize_by_metric(&alerts);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].metric, Metric::HrvRmssd);
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].open_count, 1);
        assert_eq!(summaries[0].max_level, AlertLevel::Critical);
    }

    #[test]
    fn report_names_scope_and_sections() {
        let alerts = vec![entry(Metric::HrvRmssd, AlertLevel::High, false, 1)];
        let cutoff = Utc::now() - Duration::days(30);
        let report = build_report(Some("Boavista Juniors"), 30, cutoff, &alerts);
        assert!(report.contains("# Readiness Report"));
        assert!(report.contains("Boavista Juniors"));
        assert!(report.contains("## Alert Mix"));
        assert!(report.contains("## Open Alerts"));
        assert!(report.contains("hrv_rmssd"));
    }

    #[test]
    fn empty_window_reports_the_quiet_state() {
        let cutoff = Utc::now() - Duration::days(30);
        let report = build_report(None, 30, cutoff, &[]);
        assert!(report.contains("the whole squad"));
        assert!(report.contains("No alerts generated in this window."));
        assert!(report.contains("No open alerts."));
    }
}
