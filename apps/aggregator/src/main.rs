//! Local batch runner: feeds one event document through an aggregation
//! invocation and prints the transport response.
//!
//! The queue transport is out of scope; this binary stands in for it by
//! reading an `EventPayload` JSON document from a file or stdin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use uuid::Uuid;

use baler_aggregator::clients::FsObjectStore;
use baler_aggregator::config::AppConfig;
use baler_aggregator::orchestrator::BatchOrchestrator;
use baler_bundle::BatchContext;
use baler_core::types::EventPayload;
use baler_idempotency::{
    IdempotencyGuard, InMemoryClaimStore, NatsKvClaimStore, SharedClaimStore,
};
use baler_telemetry::{TelemetryConfig, init_telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "baler-aggregator",
    about = "Dedupes object notifications and bales the objects into compressed archives."
)]
struct Cli {
    /// Path to the event document (JSON); "-" reads stdin.
    event: PathBuf,
    /// Wall-clock budget for this invocation, in milliseconds.
    #[arg(long, default_value_t = 300_000)]
    deadline_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::global().context("loading configuration")?.clone());

    init_telemetry(TelemetryConfig {
        service_name: config.service_name.clone(),
        environment: config.environment.clone(),
        log_level: config.log_level.as_filter().to_string(),
        json_logs: std::env::var("LOG_JSON")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })?;

    let raw_event = if cli.event.to_str() == Some("-") {
        let mut buffered = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffered)
            .await
            .context("reading event from stdin")?;
        buffered
    } else {
        tokio::fs::read_to_string(&cli.event)
            .await
            .with_context(|| format!("reading event {}", cli.event.display()))?
    };
    let payload: EventPayload =
        serde_json::from_str(&raw_event).context("parsing event document")?;

    let claims: SharedClaimStore = match std::env::var("IDEMPOTENCY_NATS_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let client = async_nats::connect(&url)
                .await
                .with_context(|| format!("connecting to NATS at {url}"))?;
            let jetstream = async_nats::jetstream::new(client);
            Arc::new(NatsKvClaimStore::new(&jetstream, &config.idempotency_table).await?)
        }
        _ => {
            tracing::warn!(
                "IDEMPOTENCY_NATS_URL not set, using the in-memory claim store \
                 (duplicates only detected within this process)"
            );
            Arc::new(InMemoryClaimStore::new())
        }
    };
    let guard = IdempotencyGuard::new(claims, config.idempotency_ttl());

    let store_root =
        std::env::var("OBJECT_STORE_ROOT").unwrap_or_else(|_| "./object-store".into());
    let store = Arc::new(FsObjectStore::new(store_root));

    let orchestrator = BatchOrchestrator::new(config, store, guard);
    let ctx = BatchContext {
        invocation_id: Uuid::new_v4().to_string(),
        deadline: Instant::now() + Duration::from_millis(cli.deadline_ms),
    };

    let result = orchestrator.handle(payload, ctx).await?;
    println!("{}", serde_json::to_string_pretty(&result.into_response())?);
    Ok(())
}
