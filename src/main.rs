use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

mod alerts;
mod config;
mod db;
mod error;
mod ingest;
mod models;
mod report;
mod rules;
mod server;

#[derive(Parser)]
#[command(name = "athlete-monitor")]
#[command(about = "Measurement ingestion and alert pipeline for sports clubs", long_about = None)]
struct Cli {
    /// Rules configuration file (TOML); compiled-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample athletes and two weeks of measurements
    Seed,
    /// Ingest a CSV file and evaluate the touched athletes
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Evaluate rules and refresh alerts
    GenerateAlerts {
        /// Restrict the run to one athlete code
        #[arg(long)]
        code: Option<String>,
    },
    /// Generate a markdown readiness report
    #[command(group(
        ArgGroup::new("scope")
            .args(["club", "code"])
            .multiple(false)
    ))]
    Report {
        #[arg(long)]
        club: Option<String>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run the HTTP API server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("athlete_monitor=info,tower_http=warn")
            }),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let config = config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let text = std::fs::read_to_string(&csv)
                .with_context(|| format!("failed to read {}", csv.display()))?;
            let summary = ingest::ingest_csv(&pool, &config, &text).await?;
            println!(
                "Inserted {} rows, skipped {} ({} athletes touched).",
                summary.inserted,
                summary.skipped,
                summary.players_touched.len()
            );
            for error in &summary.row_errors {
                println!("- line {}: {}", error.line, error.reason);
            }
        }
        Commands::GenerateAlerts { code } => {
            let athlete_id = match code {
                Some(code) => {
                    let mut conn = pool.acquire().await?;
                    let id = db::find_athlete_by_code(&mut conn, &code)
                        .await?
                        .with_context(|| format!("no athlete with code {code}"))?;
                    Some(id)
                }
                None => None,
            };
            let submitted = alerts::generate(&pool, &config, athlete_id).await?;
            if submitted == 0 {
                println!("No alerts produced.");
            } else {
                println!("Created or refreshed {submitted} alerts.");
            }
        }
        Commands::Report {
            club,
            code,
            since_days,
            out,
        } => {
            let cutoff = Utc::now() - Duration::days(since_days.max(1));
            let alert_rows =
                db::fetch_alerts_with_athletes(&pool, cutoff, club.as_deref(), code.as_deref())
                    .await?;
            let scope = club.as_deref().or(code.as_deref());
            let report = report::build_report(scope, since_days, cutoff, &alert_rows);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve { addr } => {
            db::init_db(&pool).await?;
            server::run(pool, config, addr).await?;
        }
    }

    Ok(())
}
