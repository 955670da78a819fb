use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::{
    Alert, AlertLevel, AlertWithAthlete, Athlete, CandidateAlert, Measurement, Metric, NewAthlete,
    NewMeasurement,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Athletes
// ---------------------------------------------------------------------------

pub async fn find_athlete_by_code(
    conn: &mut PgConnection,
    code: &str,
) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query("SELECT id FROM athlete_monitor.athletes WHERE upper(code) = upper($1)")
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get("id")))
}

pub async fn find_athlete_by_name(
    conn: &mut PgConnection,
    first_name: &str,
    last_name: Option<&str>,
    club: Option<&str>,
) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        SELECT id FROM athlete_monitor.athletes
        WHERE lower(first_name) = lower($1)
          AND lower(coalesce(last_name, '')) = lower(coalesce($2, ''))
          AND ($3::text IS NULL OR lower(coalesce(club, '')) = lower($3))
        "#,
    )
    .bind(first_name)
    .bind(last_name)
    .bind(club)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|r| r.get("id")))
}

pub async fn insert_athlete(conn: &mut PgConnection, athlete: &NewAthlete) -> anyhow::Result<Uuid> {
    let row = sqlx::query(
        r#"
        INSERT INTO athlete_monitor.athletes (id, first_name, last_name, code, club, coach)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&athlete.first_name)
    .bind(&athlete.last_name)
    .bind(&athlete.code)
    .bind(&athlete.club)
    .bind(&athlete.coach)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get("id"))
}

pub async fn get_athlete(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Athlete>> {
    let row = sqlx::query(
        "SELECT id, first_name, last_name, code, club, coach, assessment, created_at \
         FROM athlete_monitor.athletes WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| athlete_from_row(&r)))
}

pub async fn list_athletes(pool: &PgPool) -> anyhow::Result<Vec<Athlete>> {
    let rows = sqlx::query(
        "SELECT id, first_name, last_name, code, club, coach, assessment, created_at \
         FROM athlete_monitor.athletes ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(athlete_from_row).collect())
}

pub async fn all_athlete_ids(pool: &PgPool) -> anyhow::Result<Vec<Uuid>> {
    let rows = sqlx::query("SELECT id FROM athlete_monitor.athletes ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Appends one measurement inside the enclosing batch transaction.
///
/// With `dedupe` set, a row matching a stored (athlete, metric, recorded_at)
/// triple is skipped; returns whether a row was written.
pub async fn append_measurement(
    conn: &mut PgConnection,
    measurement: &NewMeasurement,
    dedupe: bool,
) -> anyhow::Result<bool> {
    if dedupe {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM athlete_monitor.measurements \
             WHERE athlete_id = $1 AND metric = $2 AND recorded_at = $3)",
        )
        .bind(measurement.athlete_id)
        .bind(measurement.metric.as_str())
        .bind(measurement.recorded_at)
        .fetch_one(&mut *conn)
        .await?;
        if exists {
            return Ok(false);
        }
    }

    sqlx::query(
        r#"
        INSERT INTO athlete_monitor.measurements
        (id, athlete_id, metric, value, unit, recorded_at, source)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(measurement.athlete_id)
    .bind(measurement.metric.as_str())
    .bind(measurement.value)
    .bind(&measurement.unit)
    .bind(measurement.recorded_at)
    .bind(measurement.source)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Most recent `limit` measurements for one athlete/metric, oldest first,
/// ready to feed the rule evaluator.
pub async fn fetch_window(
    pool: &PgPool,
    athlete_id: Uuid,
    metric: Metric,
    limit: i64,
) -> anyhow::Result<Vec<Measurement>> {
    let rows = sqlx::query(
        r#"
        SELECT id, athlete_id, metric, value, unit, recorded_at
        FROM athlete_monitor.measurements
        WHERE athlete_id = $1 AND metric = $2
        ORDER BY recorded_at DESC, created_at DESC
        LIMIT $3
        "#,
    )
    .bind(athlete_id)
    .bind(metric.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut measurements = rows
        .iter()
        .map(measurement_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
    measurements.reverse();
    Ok(measurements)
}

pub async fn fetch_measurements(
    pool: &PgPool,
    athlete_id: Uuid,
    metric: Option<Metric>,
    since: Option<DateTime<Utc>>,
) -> anyhow::Result<Vec<Measurement>> {
    let rows = sqlx::query(
        r#"
        SELECT id, athlete_id, metric, value, unit, recorded_at
        FROM athlete_monitor.measurements
        WHERE athlete_id = $1
          AND ($2::text IS NULL OR metric = $2)
          AND ($3::timestamptz IS NULL OR recorded_at >= $3)
        ORDER BY recorded_at, created_at
        "#,
    )
    .bind(athlete_id)
    .bind(metric.map(|m| m.as_str()))
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.iter().map(measurement_from_row).collect()
}

/// Distinct metrics observed for an athlete; drives the evaluator scope and
/// the UI filter population.
pub async fn list_metrics(pool: &PgPool, athlete_id: Uuid) -> anyhow::Result<Vec<Metric>> {
    let rows = sqlx::query(
        "SELECT DISTINCT metric FROM athlete_monitor.measurements \
         WHERE athlete_id = $1 ORDER BY metric",
    )
    .bind(athlete_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let name: String = row.get("metric");
            Metric::parse(&name).ok_or_else(|| anyhow!("unrecognized metric '{name}' in store"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

const ALERT_COLUMNS: &str = "id, athlete_id, metric, level, message, generated_at, acknowledged";

pub async fn open_alert(
    pool: &PgPool,
    athlete_id: Uuid,
    metric: Metric,
) -> anyhow::Result<Option<Alert>> {
    let row = sqlx::query(&format!(
        "SELECT {ALERT_COLUMNS} FROM athlete_monitor.alerts \
         WHERE athlete_id = $1 AND metric = $2 AND NOT acknowledged",
    ))
    .bind(athlete_id)
    .bind(metric.as_str())
    .fetch_optional(pool)
    .await?;
    row.map(|r| alert_from_row(&r)).transpose()
}

pub async fn insert_alert(
    pool: &PgPool,
    candidate: &CandidateAlert,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<Alert> {
    let row = sqlx::query(&format!(
        "INSERT INTO athlete_monitor.alerts \
         (id, athlete_id, metric, level, message, generated_at, acknowledged) \
         VALUES ($1, $2, $3, $4, $5, $6, FALSE) \
         RETURNING {ALERT_COLUMNS}",
    ))
    .bind(Uuid::new_v4())
    .bind(candidate.athlete_id)
    .bind(candidate.metric.as_str())
    .bind(candidate.level.as_str())
    .bind(&candidate.message)
    .bind(generated_at)
    .fetch_one(pool)
    .await?;
    alert_from_row(&row)
}

/// Refreshes an open alert in place: same row, new severity, message and
/// generation time.
pub async fn refresh_alert(
    pool: &PgPool,
    alert_id: Uuid,
    level: AlertLevel,
    message: &str,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<Alert> {
    let row = sqlx::query(&format!(
        "UPDATE athlete_monitor.alerts \
         SET level = $2, message = $3, generated_at = $4 \
         WHERE id = $1 \
         RETURNING {ALERT_COLUMNS}",
    ))
    .bind(alert_id)
    .bind(level.as_str())
    .bind(message)
    .bind(generated_at)
    .fetch_one(pool)
    .await?;
    alert_from_row(&row)
}

pub async fn list_alerts(
    pool: &PgPool,
    athlete_id: Option<Uuid>,
    limit: i64,
) -> anyhow::Result<Vec<Alert>> {
    let mut query = format!("SELECT {ALERT_COLUMNS} FROM athlete_monitor.alerts");
    if athlete_id.is_some() {
        query.push_str(" WHERE athlete_id = $2");
    }
    query.push_str(" ORDER BY generated_at DESC LIMIT $1");

    let mut rows = sqlx::query(&query).bind(limit);
    if let Some(id) = athlete_id {
        rows = rows.bind(id);
    }

    let records = rows.fetch_all(pool).await?;
    records.iter().map(alert_from_row).collect()
}

/// Marks an alert acknowledged. Returns `None` when the id does not exist;
/// acknowledging twice leaves the row acknowledged (idempotent).
pub async fn acknowledge_alert(pool: &PgPool, alert_id: Uuid) -> anyhow::Result<Option<Alert>> {
    let row = sqlx::query(&format!(
        "UPDATE athlete_monitor.alerts SET acknowledged = TRUE \
         WHERE id = $1 \
         RETURNING {ALERT_COLUMNS}",
    ))
    .bind(alert_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| alert_from_row(&r)).transpose()
}

/// Alerts joined with athlete names for the readiness report, scoped by club
/// or athlete code.
pub async fn fetch_alerts_with_athletes(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    club: Option<&str>,
    code: Option<&str>,
) -> anyhow::Result<Vec<AlertWithAthlete>> {
    let mut query = String::from(
        "SELECT a.id, a.athlete_id, a.metric, a.level, a.message, a.generated_at, \
         a.acknowledged, ath.first_name, ath.last_name \
         FROM athlete_monitor.alerts a \
         JOIN athlete_monitor.athletes ath ON ath.id = a.athlete_id \
         WHERE a.generated_at >= $1",
    );

    if club.is_some() {
        query.push_str(" AND lower(coalesce(ath.club, '')) = lower($2)");
    } else if code.is_some() {
        query.push_str(" AND upper(coalesce(ath.code, '')) = upper($2)");
    }
    query.push_str(" ORDER BY a.generated_at DESC");

    let mut rows = sqlx::query(&query).bind(cutoff);
    if let Some(value) = club {
        rows = rows.bind(value);
    } else if let Some(value) = code {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut alerts = Vec::new();
    for row in records {
        let first_name: String = row.get("first_name");
        let last_name: Option<String> = row.get("last_name");
        let athlete_name = match last_name {
            Some(last) => format!("{first_name} {last}"),
            None => first_name,
        };
        alerts.push(AlertWithAthlete {
            alert: alert_from_row(&row)?,
            athlete_name,
        });
    }
    Ok(alerts)
}

// ---------------------------------------------------------------------------
// Seed data
// ---------------------------------------------------------------------------

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let athletes = vec![
        ("Rafael", Some("Moreira"), "BVAJSA001", "Boavista Juniors", "J. Santos"),
        ("Ana", Some("Clemente"), "BVAJSA002", "Boavista Juniors", "J. Santos"),
        ("Tomas", Some("Ferreira"), "LUSCPI001", "Lusitano FC", "C. Pinto"),
    ];

    let mut ids = Vec::new();
    for (first_name, last_name, code, club, coach) in athletes {
        let row = sqlx::query(
            r#"
            INSERT INTO athlete_monitor.athletes (id, first_name, last_name, code, club, coach)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name,
                club = EXCLUDED.club, coach = EXCLUDED.coach
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(first_name)
        .bind(last_name)
        .bind(code)
        .bind(club)
        .bind(coach)
        .fetch_one(pool)
        .await?;
        let id: Uuid = row.get("id");
        ids.push(id);
    }

    // Two weeks of sample data: a sliding HRV for Rafael, a load ramp for
    // Ana, steady readings for Tomas. Anchored to midnight so re-seeding on
    // the same day dedupes instead of doubling.
    let anchor = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    let mut tx = pool.begin().await.context("begin seed transaction")?;
    for day in 0..14i64 {
        let recorded_at = anchor - Duration::days(13 - day);
        let samples = [
            (ids[0], Metric::HrvRmssd, 62.0 - 2.0 * day as f64),
            (ids[0], Metric::TotalDistance, 8200.0 - 60.0 * day as f64),
            (ids[1], Metric::HrvRmssd, 55.0 + (day % 3) as f64),
            (ids[1], Metric::SessionLoad, 420.0 + 40.0 * day as f64),
            (ids[2], Metric::HrvRmssd, 48.0 + (day % 4) as f64),
            (ids[2], Metric::Acwr, 1.05 + 0.01 * (day % 5) as f64),
        ];
        for (athlete_id, metric, value) in samples {
            let measurement = NewMeasurement {
                athlete_id,
                metric,
                value,
                unit: metric.default_unit().to_string(),
                recorded_at,
                source: "seed",
            };
            append_measurement(&mut tx, &measurement, true).await?;
        }
    }
    tx.commit().await.context("commit seed transaction")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn athlete_from_row(row: &PgRow) -> Athlete {
    Athlete {
        id: row.get("id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        code: row.get("code"),
        club: row.get("club"),
        coach: row.get("coach"),
        assessment: row.get("assessment"),
        created_at: row.get("created_at"),
    }
}

fn measurement_from_row(row: &PgRow) -> anyhow::Result<Measurement> {
    let metric: String = row.get("metric");
    Ok(Measurement {
        id: row.get("id"),
        athlete_id: row.get("athlete_id"),
        metric: Metric::parse(&metric)
            .ok_or_else(|| anyhow!("unrecognized metric '{metric}' in store"))?,
        value: row.get("value"),
        unit: row.get("unit"),
        recorded_at: row.get("recorded_at"),
    })
}

fn alert_from_row(row: &PgRow) -> anyhow::Result<Alert> {
    let metric: String = row.get("metric");
    let level: String = row.get("level");
    Ok(Alert {
        id: row.get("id"),
        athlete_id: row.get("athlete_id"),
        metric: Metric::parse(&metric)
            .ok_or_else(|| anyhow!("unrecognized metric '{metric}' in store"))?,
        level: AlertLevel::parse(&level)
            .ok_or_else(|| anyhow!("unrecognized alert level '{level}' in store"))?,
        message: row.get("message"),
        generated_at: row.get("generated_at"),
        acknowledged: row.get("acknowledged"),
    })
}
