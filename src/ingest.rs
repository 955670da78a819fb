//! CSV parsing, normalization and batch ingestion.
//!
//! Uploads are wide-format: one row per athlete per day, one column per
//! metric. The parser is tolerant by design: unknown columns are ignored and
//! bad rows are collected as row errors while the rest of the batch commits.

use std::collections::{BTreeSet, HashMap};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use csv::StringRecord;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::alerts;
use crate::config::Config;
use crate::db;
use crate::models::{AthleteRef, IngestSummary, Metric, NewAthlete, NewMeasurement, RowError};

/// Upload-fatal problems: the file as a whole is unusable. Row-level issues
/// never surface here; they land in `row_errors`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("uploaded file is not valid UTF-8")]
    NotUtf8,
    #[error("missing athlete identifier column (athlete_code or first_name)")]
    MissingIdentifier,
    #[error("no recognized metric columns in header")]
    NoMetricColumns,
    #[error("malformed csv: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One validated data row: who it belongs to, when, and the metric values it
/// carries.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: u64,
    pub athlete: AthleteRef,
    pub recorded_at: Option<DateTime<Utc>>,
    pub values: Vec<(Metric, f64)>,
}

#[derive(Debug, Default)]
pub struct ParsedUpload {
    pub rows: Vec<RawRow>,
    pub errors: Vec<RowError>,
    pub metrics_detected: BTreeSet<Metric>,
}

#[derive(Debug)]
struct ColumnMap {
    code: Option<usize>,
    first_name: Option<usize>,
    last_name: Option<usize>,
    club: Option<usize>,
    coach: Option<usize>,
    recorded_at: Option<usize>,
    metrics: Vec<(usize, Metric)>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Result<ColumnMap, ParseError> {
        let mut map = ColumnMap {
            code: None,
            first_name: None,
            last_name: None,
            club: None,
            coach: None,
            recorded_at: None,
            metrics: Vec::new(),
        };

        for (idx, raw) in headers.iter().enumerate() {
            let name = raw.trim().to_ascii_lowercase();
            match name.as_str() {
                "athlete_code" | "player_code" | "code" => map.code = Some(idx),
                "first_name" | "firstname" => map.first_name = Some(idx),
                "last_name" | "lastname" => map.last_name = Some(idx),
                "club" | "club_name" => map.club = Some(idx),
                "coach" | "coach_name" => map.coach = Some(idx),
                "recorded_at" | "date" | "datetime" | "timestamp" => map.recorded_at = Some(idx),
                _ => {
                    if let Some(metric) = Metric::from_column(&name) {
                        map.metrics.push((idx, metric));
                    }
                    // Anything else is an unrecognized column and is ignored.
                }
            }
        }

        if map.metrics.is_empty() {
            return Err(ParseError::NoMetricColumns);
        }
        if map.code.is_none() && map.first_name.is_none() {
            return Err(ParseError::MissingIdentifier);
        }
        Ok(map)
    }

    fn parse_record(&self, record: &StringRecord) -> Result<(AthleteRef, Option<DateTime<Utc>>, Vec<(Metric, f64)>), String> {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let athlete = AthleteRef {
            code: cell(self.code),
            first_name: cell(self.first_name),
            last_name: cell(self.last_name),
            club: cell(self.club),
            coach: cell(self.coach),
        };
        if athlete.code.is_none() && athlete.first_name.is_none() {
            return Err("missing athlete identifier".to_string());
        }

        let recorded_at = match cell(self.recorded_at) {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        };

        let mut values = Vec::new();
        for (idx, metric) in &self.metrics {
            let raw = record.get(*idx).map(str::trim).unwrap_or("");
            if raw.is_empty() {
                continue;
            }
            let value = parse_value(raw).map_err(|reason| format!("{metric}: {reason}"))?;
            values.push((*metric, value));
        }
        if values.is_empty() {
            return Err("row carries no metric values".to_string());
        }

        Ok((athlete, recorded_at, values))
    }
}

/// Parses an uploaded file into rows and row errors without touching the
/// store. Header matching is case-insensitive; `,` and `;` delimiters are
/// both accepted.
pub fn parse_csv(text: &str) -> Result<ParsedUpload, ParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Malformed(e.to_string()))?
        .clone();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut upload = ParsedUpload::default();
    upload
        .metrics_detected
        .extend(columns.metrics.iter().map(|(_, m)| *m));

    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(error) => {
                let line = error.position().map(|p| p.line()).unwrap_or(0);
                upload.errors.push(RowError {
                    line,
                    reason: format!("unreadable row: {error}"),
                });
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        match columns.parse_record(&record) {
            Ok((athlete, recorded_at, values)) => upload.rows.push(RawRow {
                line,
                athlete,
                recorded_at,
                values,
            }),
            Err(reason) => upload.errors.push(RowError { line, reason }),
        }
    }

    Ok(upload)
}

/// Runs a full batch: parse, resolve athletes, append measurements in one
/// transaction, then evaluate rules for the touched athletes.
///
/// Row-level failures are reported in the summary; a storage failure rolls
/// the whole batch back.
pub async fn ingest_csv(
    pool: &PgPool,
    config: &Config,
    text: &str,
) -> Result<IngestSummary, IngestError> {
    let parsed = parse_csv(text)?;
    let mut summary = IngestSummary {
        row_errors: parsed.errors,
        metrics_detected: parsed.metrics_detected,
        ..Default::default()
    };

    // Request-scoped resolution cache so a thousand-row file does not look
    // the same athlete up a thousand times.
    let mut cache: HashMap<String, Uuid> = HashMap::new();
    let mut tx = pool.begin().await.context("begin ingest batch")?;
    let batch_time = Utc::now();

    for row in parsed.rows {
        let athlete_id = match resolve_athlete(&mut tx, &mut cache, &row.athlete).await? {
            Ok(id) => id,
            Err(reason) => {
                summary.row_errors.push(RowError {
                    line: row.line,
                    reason,
                });
                continue;
            }
        };

        let recorded_at = row.recorded_at.unwrap_or(batch_time);
        for (metric, value) in &row.values {
            let measurement = NewMeasurement {
                athlete_id,
                metric: *metric,
                value: *value,
                unit: metric.default_unit().to_string(),
                recorded_at,
                source: "csv",
            };
            db::append_measurement(&mut tx, &measurement, config.ingest.dedupe_reingestion)
                .await?;
        }
        summary.players_touched.insert(athlete_id);
        summary.inserted += 1;
    }

    tx.commit().await.context("commit ingest batch")?;
    summary.row_errors.sort_by_key(|e| e.line);
    summary.skipped = summary.row_errors.len();
    tracing::info!(
        inserted = summary.inserted,
        skipped = summary.skipped,
        athletes = summary.players_touched.len(),
        "csv batch ingested"
    );

    // The batch is committed and visible; evaluate the athletes it touched.
    // Alert generation failing here does not un-commit measurements, so it
    // is logged rather than failing the upload.
    for athlete_id in &summary.players_touched {
        if let Err(error) = alerts::generate_for_athlete(pool, config, *athlete_id).await {
            tracing::warn!(%athlete_id, error = ?error, "post-ingest alert generation failed");
        }
    }

    Ok(summary)
}

/// Resolves a row's athlete reference: by code, then by name composite,
/// creating the athlete when the row carries name fields. The outer error is
/// a storage failure; the inner one is a row error.
async fn resolve_athlete(
    conn: &mut PgConnection,
    cache: &mut HashMap<String, Uuid>,
    athlete: &AthleteRef,
) -> anyhow::Result<Result<Uuid, String>> {
    let cache_key = match (&athlete.code, &athlete.first_name) {
        (Some(code), _) => format!("code:{}", code.to_ascii_uppercase()),
        (None, Some(first)) => format!(
            "name:{}|{}|{}",
            first.to_lowercase(),
            athlete.last_name.as_deref().unwrap_or("").to_lowercase(),
            athlete.club.as_deref().unwrap_or("").to_lowercase()
        ),
        (None, None) => return Ok(Err("missing athlete identifier".to_string())),
    };
    if let Some(id) = cache.get(&cache_key) {
        return Ok(Ok(*id));
    }

    if let Some(code) = &athlete.code {
        if let Some(id) = db::find_athlete_by_code(conn, code).await? {
            cache.insert(cache_key, id);
            return Ok(Ok(id));
        }
    }

    if let Some(first_name) = &athlete.first_name {
        if let Some(id) = db::find_athlete_by_name(
            conn,
            first_name,
            athlete.last_name.as_deref(),
            athlete.club.as_deref(),
        )
        .await?
        {
            cache.insert(cache_key, id);
            return Ok(Ok(id));
        }

        let id = db::insert_athlete(
            conn,
            &NewAthlete {
                first_name: first_name.clone(),
                last_name: athlete.last_name.clone(),
                code: athlete.code.clone(),
                club: athlete.club.clone(),
                coach: athlete.coach.clone(),
            },
        )
        .await?;
        tracing::info!(%id, %first_name, "created athlete from first csv reference");
        cache.insert(cache_key, id);
        return Ok(Ok(id));
    }

    // A bare code with no name fields cannot create an athlete.
    let code = athlete.code.as_deref().unwrap_or("");
    Ok(Err(format!("unknown athlete code '{code}'")))
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

/// Accepts `,` and `.` decimal separators; rejects empty and non-finite
/// values.
fn parse_value(raw: &str) -> Result<f64, String> {
    let cleaned = raw.trim().replace(',', ".");
    if cleaned.is_empty() {
        return Err("empty value".to_string());
    }
    let value: f64 = cleaned
        .parse()
        .map_err(|_| format!("invalid number '{raw}'"))?;
    if !value.is_finite() {
        return Err(format!("non-finite number '{raw}'"));
    }
    Ok(value)
}

/// RFC 3339 first, then the date-time and date-only forms the GPS vendors
/// export. Date-only rows land at midnight UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(parsed.and_utc());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(parsed.and_time(NaiveTime::MIN).and_utc());
    }
    Err(format!("unrecognized timestamp '{trimmed}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_and_bad_rows_account_for_every_data_row() {
        let csv = "athlete_code,hrv_rmssd,recorded_at\n\
                   A1,45.2,2024-01-01\n\
                   A1,abc,2024-01-02\n\
                   A1,20.0,2024-01-08\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert_eq!(upload.rows.len(), 2);
        assert_eq!(upload.errors.len(), 1);
        assert_eq!(upload.rows.len() + upload.errors.len(), 3);
    }

    #[test]
    fn bad_numeric_cell_reports_its_file_line() {
        let csv = "athlete_code,hrv_rmssd\nA1,45.2\nA1,abc\n";
        let upload = parse_csv(csv).expect("header is valid");
        // Header is line 1, so the offending row is line 3.
        assert_eq!(upload.errors.len(), 1);
        assert_eq!(upload.errors[0].line, 3);
        assert!(upload.errors[0].reason.contains("hrv_rmssd"));
        assert!(upload.errors[0].reason.contains("abc"));
    }

    #[test]
    fn header_matching_is_case_insensitive_and_ignores_unknown_columns() {
        let csv = "Athlete_Code,HRV,Coach_Notes,Total Distance\nA1,51.0,rested,7800\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert_eq!(upload.rows.len(), 1);
        let values = &upload.rows[0].values;
        assert_eq!(values.len(), 2);
        assert!(values.contains(&(Metric::HrvRmssd, 51.0)));
        assert!(values.contains(&(Metric::TotalDistance, 7800.0)));
        assert_eq!(
            upload.metrics_detected,
            BTreeSet::from([Metric::HrvRmssd, Metric::TotalDistance])
        );
    }

    #[test]
    fn semicolon_files_with_decimal_commas_parse() {
        let csv = "athlete_code;hrv_rmssd\nA1;45,2\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert_eq!(upload.rows.len(), 1);
        assert_eq!(upload.rows[0].values, vec![(Metric::HrvRmssd, 45.2)]);
    }

    #[test]
    fn missing_timestamp_column_defaults_to_ingestion_time() {
        let csv = "athlete_code,hrv_rmssd\nA1,45.2\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert!(upload.rows[0].recorded_at.is_none());
    }

    #[test]
    fn unparseable_timestamp_is_a_row_error() {
        let csv = "athlete_code,hrv_rmssd,recorded_at\nA1,45.2,not-a-date\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert!(upload.rows.is_empty());
        assert_eq!(upload.errors.len(), 1);
        assert!(upload.errors[0].reason.contains("not-a-date"));
    }

    #[test]
    fn header_without_identifier_column_is_fatal() {
        let csv = "hrv_rmssd,recorded_at\n45.2,2024-01-01\n";
        assert!(matches!(
            parse_csv(csv),
            Err(ParseError::MissingIdentifier)
        ));
    }

    #[test]
    fn header_without_metric_columns_is_fatal() {
        let csv = "athlete_code,recorded_at\nA1,2024-01-01\n";
        assert!(matches!(parse_csv(csv), Err(ParseError::NoMetricColumns)));
    }

    #[test]
    fn row_missing_identifier_value_is_a_row_error() {
        let csv = "athlete_code,hrv_rmssd\n,45.2\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert_eq!(upload.errors.len(), 1);
        assert!(upload.errors[0].reason.contains("identifier"));
    }

    #[test]
    fn empty_metric_cells_are_skipped_but_empty_rows_are_errors() {
        let csv = "athlete_code,hrv_rmssd,total_distance\nA1,45.2,\nA2,,\n";
        let upload = parse_csv(csv).expect("header is valid");
        assert_eq!(upload.rows.len(), 1);
        assert_eq!(upload.rows[0].values, vec![(Metric::HrvRmssd, 45.2)]);
        assert_eq!(upload.errors.len(), 1);
        assert!(upload.errors[0].reason.contains("no metric values"));
    }

    #[test]
    fn timestamps_parse_in_the_supported_forms() {
        assert!(parse_timestamp("2024-01-01").is_ok());
        assert!(parse_timestamp("2024-01-01 10:30:00").is_ok());
        assert!(parse_timestamp("2024-01-01T10:30:00Z").is_ok());
        assert!(parse_timestamp("January 1st").is_err());
    }

    #[test]
    fn values_reject_non_finite_and_garbage() {
        assert_eq!(parse_value("45,2"), Ok(45.2));
        assert_eq!(parse_value(" 7800 "), Ok(7800.0));
        assert!(parse_value("abc").is_err());
        assert!(parse_value("inf").is_err());
        assert!(parse_value("NaN").is_err());
    }
}
