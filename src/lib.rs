//! EnvSentry -- streaming validation and anomaly detection for environmental
//! sensor telemetry.
//!
//! Readings flow through validation, a per-sensor rolling baseline, a blended
//! statistical/isolation-forest detector and a per-sensor alert state
//! machine. Cleaned readings and alert transitions are emitted as streams.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod pipeline;
pub mod sink;
pub mod storage;
pub mod stream;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::ingest::ndjson::{self, FeedStats};
use crate::pipeline::{Pipeline, PipelineOutputs};
use crate::sink::{EventSink, JsonLinesSink, SinkStats};
use crate::storage::SqliteSink;
use crate::validate::QualitySnapshot;

/// Open an NDJSON input; `-` is stdin.
pub async fn open_input(path: &Path) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening input {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn build_sinks(config: &PipelineConfig, readings_to_stdout: bool) -> Result<Vec<Box<dyn EventSink>>> {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    if config.output.stdout {
        sinks.push(Box::new(JsonLinesSink::stdout(readings_to_stdout)));
    }
    if let Some(path) = &config.output.sqlite_path {
        tracing::info!(%path, "Writing events to SQLite");
        sinks.push(Box::new(SqliteSink::new(storage::open_pool(path)?)));
    }
    Ok(sinks)
}

fn spawn_sinks(outputs: PipelineOutputs, sinks: Vec<Box<dyn EventSink>>) -> tokio::task::JoinHandle<SinkStats> {
    tokio::spawn(sink::run_sinks(outputs, sinks))
}

/// Start the EnvSentry daemon: pipeline, background loops and API server.
pub async fn serve(config: PipelineConfig, bind: &str, input: Option<&Path>) -> Result<()> {
    let addr: std::net::SocketAddr = bind.parse().with_context(|| format!("invalid bind address {}", bind))?;

    // 1. Pipeline and output sinks
    let sinks = build_sinks(&config, true)?;
    let (pipeline, outputs) = Pipeline::new(config).context("invalid configuration")?;
    let sink_task = spawn_sinks(outputs, sinks);

    // 2. Background sweep and retrain loops
    let cancel = CancellationToken::new();
    let background = pipeline.spawn_background(cancel.clone());

    // 3. Optional file/stdin feed
    if let Some(path) = input {
        let reader = open_input(path).await?;
        let feeder = pipeline.clone();
        tokio::spawn(async move {
            match ndjson::feed(reader, &feeder, None).await {
                Ok(stats) => tracing::info!(?stats, "Input feed finished"),
                Err(e) => tracing::warn!(error = %e, "Input feed stopped"),
            }
        });
    }

    // 4. API server
    let app = api::router(api::state::AppState {
        pipeline: pipeline.clone(),
    });
    tracing::info!(%addr, "EnvSentry listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    pipeline.close().await;
    for handle in background {
        let _ = handle.await;
    }
    let stats = sink_task.await?;
    tracing::info!(?stats, quality = ?pipeline.quality(), "EnvSentry stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReplayReport {
    pub feed: FeedStats,
    pub quality: QualitySnapshot,
    pub sinks: SinkStats,
    pub resolved_at_end: usize,
}

/// Run a recorded NDJSON stream through the pipeline offline. Alerts are
/// swept on the recording's clock every `alerts.sweep_interval_secs` of
/// event time, never on the wall clock.
///
/// With `resolve`, a final sweep runs at the latest reading time plus the
/// quiet period, so alerts still open at the end of the recording resolve.
pub async fn replay(config: PipelineConfig, input: &Path, resolve: bool, alerts_only: bool) -> Result<ReplayReport> {
    let quiet = config.alerts.quiet_period();
    let sweep_every = config.alerts.sweep_interval();
    let sinks = build_sinks(&config, !alerts_only)?;
    let (pipeline, outputs) = Pipeline::new(config).context("invalid configuration")?;
    let sink_task = spawn_sinks(outputs, sinks);

    let cancel = CancellationToken::new();
    let retrainer = pipeline.spawn_retrain_scheduler(cancel.clone());

    let reader = open_input(input).await?;
    let feed = ndjson::feed(reader, &pipeline, Some(sweep_every)).await?;
    pipeline.drain().await;

    let end = pipeline.latest_event_time().and_then(|t| t.checked_add_signed(quiet));
    let resolved_at_end = match (resolve, end) {
        (true, Some(end)) => pipeline.sweep_alerts(end).await,
        _ => 0,
    };

    pipeline.close().await;
    cancel.cancel();
    if let Some(handle) = retrainer {
        let _ = handle.await;
    }
    let sinks = sink_task.await?;

    Ok(ReplayReport {
        feed,
        quality: pipeline.quality(),
        sinks,
        resolved_at_end,
    })
}
