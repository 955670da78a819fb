//! Alert deduplication and generation.
//!
//! One open alert per (athlete, metric): a candidate at equal-or-higher
//! severity refreshes the open row in place, a weaker candidate is dropped.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::{Alert, CandidateAlert};
use crate::rules;

/// What `submit` should do with a candidate, given the open alert (if any)
/// for the same athlete and metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Create,
    Refresh { existing_id: Uuid },
    Drop,
}

pub fn merge_decision(existing: Option<&Alert>, candidate: &CandidateAlert) -> MergeAction {
    match existing {
        None => MergeAction::Create,
        Some(open) if open.level <= candidate.level => MergeAction::Refresh {
            existing_id: open.id,
        },
        Some(_) => MergeAction::Drop,
    }
}

/// Merges a candidate against the store. Returns the created or refreshed
/// alert, or `None` when a stronger open alert already covers the metric.
pub async fn submit(pool: &PgPool, candidate: CandidateAlert) -> anyhow::Result<Option<Alert>> {
    let existing = db::open_alert(pool, candidate.athlete_id, candidate.metric).await?;
    match merge_decision(existing.as_ref(), &candidate) {
        MergeAction::Create => {
            let alert = db::insert_alert(pool, &candidate, Utc::now()).await?;
            tracing::info!(
                athlete_id = %alert.athlete_id,
                metric = %alert.metric,
                level = %alert.level,
                "alert opened"
            );
            Ok(Some(alert))
        }
        MergeAction::Refresh { existing_id } => {
            let alert = db::refresh_alert(
                pool,
                existing_id,
                candidate.level,
                &candidate.message,
                Utc::now(),
            )
            .await?;
            tracing::info!(
                athlete_id = %alert.athlete_id,
                metric = %alert.metric,
                level = %alert.level,
                "open alert refreshed"
            );
            Ok(Some(alert))
        }
        MergeAction::Drop => {
            tracing::debug!(
                athlete_id = %candidate.athlete_id,
                metric = %candidate.metric,
                level = %candidate.level,
                "candidate dropped, stronger alert already open"
            );
            Ok(None)
        }
    }
}

/// Evaluates every configured metric for one athlete and submits whatever
/// fires. Returns how many alerts were created or refreshed.
pub async fn generate_for_athlete(
    pool: &PgPool,
    config: &Config,
    athlete_id: Uuid,
) -> anyhow::Result<usize> {
    let observed = db::list_metrics(pool, athlete_id).await?;
    let mut submitted = 0;
    for metric in observed {
        let Some(metric_rules) = config.rules.get(&metric) else {
            continue;
        };
        let window =
            db::fetch_window(pool, athlete_id, metric, metric_rules.window as i64).await?;
        if let Some(candidate) = rules::evaluate_window(athlete_id, metric, metric_rules, &window)
        {
            if submit(pool, candidate).await?.is_some() {
                submitted += 1;
            }
        }
    }
    Ok(submitted)
}

/// Batch entry point: one athlete when scoped, otherwise every athlete on
/// record.
pub async fn generate(
    pool: &PgPool,
    config: &Config,
    athlete_id: Option<Uuid>,
) -> anyhow::Result<usize> {
    let targets = match athlete_id {
        Some(id) => vec![id],
        None => db::all_athlete_ids(pool).await?,
    };
    let mut submitted = 0;
    for id in targets {
        submitted += generate_for_athlete(pool, config, id).await?;
    }
    Ok(submitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertLevel, Metric};
    use chrono::Utc;

    fn open_alert(level: AlertLevel) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            athlete_id: Uuid::new_v4(),
            metric: Metric::HrvRmssd,
            level,
            message: "hrv_rmssd at 25.0 is below the high bound 30.0".to_string(),
            generated_at: Utc::now(),
            acknowledged: false,
        }
    }

    fn candidate(level: AlertLevel) -> CandidateAlert {
        CandidateAlert {
            athlete_id: Uuid::new_v4(),
            metric: Metric::HrvRmssd,
            level,
            message: "hrv_rmssd dropped 55.8% over 1 reading(s)".to_string(),
        }
    }

    #[test]
    fn no_open_alert_creates_a_new_row() {
        assert_eq!(
            merge_decision(None, &candidate(AlertLevel::Moderate)),
            MergeAction::Create
        );
    }

    #[test]
    fn higher_severity_candidate_refreshes_the_open_alert() {
        let open = open_alert(AlertLevel::Moderate);
        assert_eq!(
            merge_decision(Some(&open), &candidate(AlertLevel::Critical)),
            MergeAction::Refresh {
                existing_id: open.id
            }
        );
    }

    #[test]
    fn equal_severity_candidate_refreshes_rather_than_duplicates() {
        let open = open_alert(AlertLevel::High);
        assert_eq!(
            merge_decision(Some(&open), &candidate(AlertLevel::High)),
            MergeAction::Refresh {
                existing_id: open.id
            }
        );
    }

    #[test]
    fn weaker_candidate_is_dropped() {
        let open = open_alert(AlertLevel::Critical);
        assert_eq!(
            merge_decision(Some(&open), &candidate(AlertLevel::Moderate)),
            MergeAction::Drop
        );
    }
}
