use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest::client::{ConversationSource, HttpConversationClient};
use harvest::config::Config;
use harvest::pipeline::{parse_datetime_text, Chunker};
use harvest::resilience::CircuitBreakerRegistry;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Fetch and enrich support conversations over a date range")]
struct Args {
    /// Range start (RFC 3339 or YYYY-MM-DD), inclusive
    #[arg(long)]
    start: String,

    /// Range end (RFC 3339 or YYYY-MM-DD), inclusive
    #[arg(long)]
    end: String,

    /// Stop once this many conversations have been collected
    #[arg(long)]
    max_records: Option<usize>,

    /// Write JSON here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn parse_bound(label: &str, value: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_datetime_text(value)
        .with_context(|| format!("Could not parse --{label} value '{value}' as a date"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "harvest=info".into());
    let json_logs = std::env::var("HARVEST_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    // Logs go to stderr so stdout stays clean for the JSON payload.
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = Config::from_env();
    config.validate()?;

    if config.api.access_token.is_none() {
        tracing::warn!("HARVEST_ACCESS_TOKEN is not set, requests will be unauthenticated");
    }

    let start = parse_bound("start", &args.start)?;
    let end = parse_bound("end", &args.end)?;

    tracing::info!("Connecting to {}...", config.api.base_url);
    let client: Arc<dyn ConversationSource> =
        Arc::new(HttpConversationClient::new(config.api.clone())?);
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let chunker = Chunker::from_config(client, &config, Some(Arc::clone(&breakers)));

    let report = chunker.fetch(start, end, args.max_records).await?;

    let payload = serde_json::to_string_pretty(&report.records)?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, payload)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {} conversations to {}", report.records.len(), path.display());
        }
        None => println!("{payload}"),
    }

    let metrics = &report.enrichment;
    tracing::info!(
        records = report.records.len(),
        windows = report.windows_fetched,
        partial = report.partial,
        dropped_out_of_window = report.dropped_out_of_window,
        processed = metrics.processed,
        enriched_body = metrics.enriched_body,
        enriched_owner = metrics.enriched_owner,
        enriched_groups = metrics.enriched_groups,
        failed_body = metrics.failed_body,
        failed_owner = metrics.failed_owner,
        failed_groups = metrics.failed_groups,
        skipped_no_owner = metrics.skipped_no_owner,
        "Harvest finished"
    );
    for stats in breakers.snapshot() {
        tracing::info!(
            breaker = %stats.name,
            state = %stats.state,
            times_opened = stats.times_opened,
            rejected_calls = stats.rejected_calls,
            "Circuit breaker summary"
        );
    }

    if report.partial {
        tracing::warn!("Results are partial, a later window failed");
    }

    Ok(())
}
