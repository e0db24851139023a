//! Consumers of the pipeline's output streams.

use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::alert::AlertTransition;
use crate::pipeline::{CleanedReading, PipelineOutputs};

#[async_trait]
pub trait EventSink: Send {
    fn name(&self) -> &str;

    async fn cleaned(&mut self, reading: &CleanedReading) -> Result<()>;

    async fn alert(&mut self, transition: &AlertTransition) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Reading(&'a CleanedReading),
    Alert(&'a AlertTransition),
}

/// Writes one JSON object per event, tagged with `"type"`.
pub struct JsonLinesSink<W> {
    out: W,
    readings: bool,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout(readings: bool) -> Self {
        Self::new(std::io::stdout(), readings)
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// With `readings` off only alert transitions are written.
    pub fn new(out: W, readings: bool) -> Self {
        Self { out, readings }
    }

    fn write(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn cleaned(&mut self, reading: &CleanedReading) -> Result<()> {
        if self.readings {
            self.write(&Line::Reading(reading))?;
        }
        Ok(())
    }

    async fn alert(&mut self, transition: &AlertTransition) -> Result<()> {
        self.write(&Line::Alert(transition))
    }

    async fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub readings: u64,
    pub alerts: u64,
    pub failures: u64,
}

/// Fan both output streams out to every sink until the pipeline closes them.
/// A failing sink is logged and skipped for that event only.
pub async fn run_sinks(mut outputs: PipelineOutputs, mut sinks: Vec<Box<dyn EventSink>>) -> SinkStats {
    let mut stats = SinkStats::default();
    let (mut readings_open, mut alerts_open) = (true, true);

    loop {
        tokio::select! {
            r = outputs.readings.recv(), if readings_open => match r {
                Some(cleaned) => {
                    stats.readings += 1;
                    for sink in sinks.iter_mut() {
                        if let Err(e) = sink.cleaned(&cleaned).await {
                            stats.failures += 1;
                            warn!(sink = sink.name(), error = %e, "Sink rejected reading");
                        }
                    }
                }
                None => readings_open = false,
            },
            a = outputs.alerts.recv(), if alerts_open => match a {
                Some(transition) => {
                    stats.alerts += 1;
                    for sink in sinks.iter_mut() {
                        if let Err(e) = sink.alert(&transition).await {
                            stats.failures += 1;
                            warn!(sink = sink.name(), error = %e, "Sink rejected alert");
                        }
                    }
                }
                None => alerts_open = false,
            },
            else => break,
        }
    }

    for sink in sinks.iter_mut() {
        if let Err(e) = sink.flush().await {
            warn!(sink = sink.name(), error = %e, "Sink flush failed");
        }
    }
    debug!(?stats, "Output streams closed");
    stats
}
