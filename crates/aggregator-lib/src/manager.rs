//! Pipeline manager
//!
//! Owns the scrape tick. Each tick computes the `[now - resolution, now]`
//! window, runs source manager -> processor chain -> sink manager
//! synchronously on the tick worker, and schedules the next tick at
//! `tick_start + resolution` so the cadence never drifts. A tick still
//! executing when the next boundary arrives causes that boundary to be
//! skipped, never overlapped.

use crate::observability::PipelineMetrics;
use crate::processor::DataProcessor;
use crate::sink::SinkManager;
use crate::source::MetricsSource;
use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default tick cadence.
pub const DEFAULT_METRIC_RESOLUTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Running,
    Stopped,
}

pub struct Manager {
    state: Mutex<ManagerState>,
    pipeline: Mutex<Option<Pipeline>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        processors: Vec<Box<dyn DataProcessor>>,
        sinks: SinkManager,
        resolution: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pipeline = Pipeline {
            source,
            processors,
            sinks,
            resolution,
            shutdown: shutdown.child_token(),
            metrics: PipelineMetrics::new(),
        };
        Self {
            state: Mutex::new(ManagerState::Idle),
            pipeline: Mutex::new(Some(pipeline)),
            worker: Mutex::new(None),
            shutdown,
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch the tick worker. Valid only from `Idle`.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ManagerState::Idle {
            bail!("manager cannot start from state {:?}", *state);
        }
        let pipeline = self
            .pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(pipeline) = pipeline else {
            bail!("manager pipeline already consumed");
        };

        info!(
            resolution_secs = pipeline.resolution.as_secs(),
            "Starting metrics pipeline"
        );
        let handle = tokio::spawn(pipeline.run());
        *self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *state = ManagerState::Running;
        Ok(())
    }

    /// Signal the tick worker and join it. Valid only from `Running`.
    /// Cancellation propagates into in-flight scrapes and exports.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ManagerState::Running {
                bail!("manager cannot stop from state {:?}", *state);
            }
            *state = ManagerState::Stopped;
        }
        self.shutdown.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Metrics pipeline stopped");
        Ok(())
    }
}

struct Pipeline {
    source: Arc<dyn MetricsSource>,
    processors: Vec<Box<dyn DataProcessor>>,
    sinks: SinkManager,
    resolution: Duration,
    shutdown: CancellationToken,
    metrics: PipelineMetrics,
}

impl Pipeline {
    async fn run(mut self) {
        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            self.tick().await;

            // Schedule against the tick boundary, not completion time, so
            // slow ticks do not push the cadence. Boundaries the tick ran
            // through are skipped.
            next_tick += self.resolution;
            let now = Instant::now();
            while next_tick <= now {
                self.metrics.inc_ticks_skipped();
                debug!("Tick overran the resolution; skipping the next boundary");
                next_tick += self.resolution;
            }
        }
        self.sinks.stop().await;
    }

    async fn tick(&mut self) {
        let tick_started = Instant::now();
        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(self.resolution)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut batch = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            batch = self.source.scrape_metrics(start, end) => batch,
        };
        self.metrics
            .observe_scrape_latency(tick_started.elapsed().as_secs_f64());

        for processor in &mut self.processors {
            match processor.process(batch) {
                Ok(processed) => batch = processed,
                Err(e) => {
                    error!(
                        processor = processor.name(),
                        error = %e,
                        "Processor failed; dropping this tick's batch"
                    );
                    return;
                }
            }
        }

        self.metrics.set_last_batch_metric_sets(batch.len() as i64);
        debug!(
            timestamp = %batch.timestamp,
            metric_sets = batch.len(),
            "Tick complete"
        );
        self.sinks.export_data(&Arc::new(batch));
        self.metrics
            .observe_tick_latency(tick_started.elapsed().as_secs_f64());
    }
}
