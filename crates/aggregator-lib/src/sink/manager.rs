//! Sink manager
//!
//! One long-lived worker per sink drains a capacity-1 mailbox. Offering a
//! batch never blocks the tick: a full slot means the previous, not yet
//! taken batch is discarded in favour of the latest one. Exports and stop
//! are bounded by deadlines; a sink that cannot keep up drops batches and
//! a sink that cannot stop is abandoned.

use super::DataSink;
use crate::model::DataBatch;
use crate::observability::PipelineMetrics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Budget for a single `export_data` call.
pub const DEFAULT_SINK_EXPORT_TIMEOUT: Duration = Duration::from_secs(15);

/// Budget for a sink to wind down at shutdown.
pub const DEFAULT_SINK_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Latest-wins slot of depth one.
struct Mailbox {
    slot: Mutex<Option<Arc<DataBatch>>>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Put a batch in the slot, displacing any batch still waiting.
    /// Returns true when a previous batch was discarded.
    fn offer(&self, batch: Arc<DataBatch>) -> bool {
        let displaced = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(batch).is_some()
        };
        self.notify.notify_one();
        displaced
    }

    fn take(&self) -> Option<Arc<DataBatch>> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

struct SinkHandle {
    name: String,
    mailbox: Arc<Mailbox>,
    worker: JoinHandle<()>,
}

pub struct SinkManager {
    handles: Vec<SinkHandle>,
    stop_timeout: Duration,
    shutdown: CancellationToken,
    metrics: PipelineMetrics,
}

impl SinkManager {
    pub fn new(
        sinks: Vec<Arc<dyn DataSink>>,
        export_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let metrics = PipelineMetrics::new();

        let handles = sinks
            .into_iter()
            .map(|sink| {
                let mailbox = Arc::new(Mailbox::new());
                let name = sink.name();
                let worker = tokio::spawn(run_sink_worker(
                    sink,
                    mailbox.clone(),
                    export_timeout,
                    shutdown.child_token(),
                    metrics.clone(),
                ));
                SinkHandle {
                    name,
                    mailbox,
                    worker,
                }
            })
            .collect();

        Self {
            handles,
            stop_timeout,
            shutdown,
            metrics,
        }
    }

    /// Offer the batch to every sink. Never blocks; sinks that have not
    /// yet taken the previous batch lose it.
    pub fn export_data(&self, batch: &Arc<DataBatch>) {
        for handle in &self.handles {
            if handle.mailbox.offer(batch.clone()) {
                self.metrics.inc_sink_batches_dropped(&handle.name);
                debug!(sink = %handle.name, "Sink still busy; previous batch discarded");
            }
        }
    }

    /// Signal every worker and wait up to the stop deadline for each;
    /// lagging sinks are abandoned.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for mut handle in self.handles {
            // Wake the worker in case it is parked on an empty mailbox.
            handle.mailbox.notify.notify_one();
            match tokio::time::timeout(self.stop_timeout, &mut handle.worker).await {
                Ok(_) => debug!(sink = %handle.name, "Sink stopped"),
                Err(_) => {
                    warn!(sink = %handle.name, "Sink did not stop within the deadline; abandoning");
                    handle.worker.abort();
                }
            }
        }
    }
}

async fn run_sink_worker(
    sink: Arc<dyn DataSink>,
    mailbox: Arc<Mailbox>,
    export_timeout: Duration,
    shutdown: CancellationToken,
    metrics: PipelineMetrics,
) {
    let name = sink.name();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = mailbox.notify.notified() => {}
        }
        while let Some(batch) = mailbox.take() {
            export_one(&*sink, &name, &batch, export_timeout, &shutdown, &metrics).await;
        }
    }

    // Deliver the final offering, then wind the sink down. This runs
    // after cancellation, so only the export deadline bounds it here and
    // the stop deadline is enforced by the manager's join.
    if let Some(batch) = mailbox.take() {
        export_with_deadline(&*sink, &name, &batch, export_timeout, &metrics).await;
    }
    sink.stop().await;
}

/// Export one batch, racing the pipeline's cancellation token against
/// the export deadline. Shutdown mid-export abandons the batch.
async fn export_one(
    sink: &dyn DataSink,
    name: &str,
    batch: &DataBatch,
    export_timeout: Duration,
    shutdown: &CancellationToken,
    metrics: &PipelineMetrics,
) {
    tokio::select! {
        _ = shutdown.cancelled() => {
            metrics.inc_sink_export_failures(name);
            warn!(sink = %name, "Shutdown during export; abandoning batch");
        }
        _ = export_with_deadline(sink, name, batch, export_timeout, metrics) => {}
    }
}

async fn export_with_deadline(
    sink: &dyn DataSink,
    name: &str,
    batch: &DataBatch,
    export_timeout: Duration,
    metrics: &PipelineMetrics,
) {
    match tokio::time::timeout(export_timeout, sink.export_data(batch)).await {
        Ok(()) => metrics.inc_sink_exports(name),
        Err(_) => {
            metrics.inc_sink_export_failures(name);
            warn!(sink = %name, "Export exceeded deadline; abandoning batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn batch_at(minute: u32) -> Arc<DataBatch> {
        Arc::new(DataBatch::new(t(minute)))
    }

    /// Exports block until the gate has permits.
    #[derive(Debug)]
    struct GatedSink {
        name: String,
        gate: Arc<Semaphore>,
        exported: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl DataSink for GatedSink {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn export_data(&self, batch: &DataBatch) {
            let _permit = self.gate.acquire().await.unwrap();
            self.exported.lock().unwrap().push(batch.timestamp);
        }

        async fn stop(&self) {}
    }

    /// First export hangs forever; later exports succeed.
    #[derive(Debug)]
    struct HangOnceSink {
        name: String,
        hung: AtomicBool,
        exported: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl DataSink for HangOnceSink {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn export_data(&self, batch: &DataBatch) {
            if !self.hung.swap(true, Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            self.exported.lock().unwrap().push(batch.timestamp);
        }

        async fn stop(&self) {}
    }

    async fn wait_for_exports(exported: &Arc<Mutex<Vec<DateTime<Utc>>>>, count: usize) {
        for _ in 0..1000 {
            if exported.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("sink never exported {count} batches");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_delivered_in_order() {
        let exported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(GatedSink {
            name: "ordered".to_string(),
            gate: Arc::new(Semaphore::new(100)),
            exported: exported.clone(),
        });
        let manager = SinkManager::new(
            vec![sink],
            DEFAULT_SINK_EXPORT_TIMEOUT,
            DEFAULT_SINK_STOP_TIMEOUT,
        );

        for minute in 0..3 {
            manager.export_data(&batch_at(minute));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_for_exports(&exported, 3).await;

        assert_eq!(*exported.lock().unwrap(), vec![t(0), t(1), t(2)]);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mailbox_keeps_only_latest() {
        let gate = Arc::new(Semaphore::new(0));
        let exported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(GatedSink {
            name: "blocked_mailbox".to_string(),
            gate: gate.clone(),
            exported: exported.clone(),
        });
        let metrics = PipelineMetrics::new();
        let dropped_before = metrics.sink_batches_dropped("blocked_mailbox");

        let manager = SinkManager::new(
            vec![sink],
            DEFAULT_SINK_EXPORT_TIMEOUT,
            DEFAULT_SINK_STOP_TIMEOUT,
        );

        // The worker takes the first batch and blocks in export.
        manager.export_data(&batch_at(0));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Two more offerings while blocked: the second displaces the
        // first, and export_data returns immediately both times.
        manager.export_data(&batch_at(1));
        manager.export_data(&batch_at(2));
        assert_eq!(
            metrics.sink_batches_dropped("blocked_mailbox") - dropped_before,
            1
        );

        // Unblock: the in-flight batch finishes, then only the most
        // recently offered batch is delivered.
        gate.add_permits(100);
        wait_for_exports(&exported, 2).await;
        assert_eq!(*exported.lock().unwrap(), vec![t(0), t(2)]);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_deadline_abandons_batch() {
        let exported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(HangOnceSink {
            name: "hang_once".to_string(),
            hung: AtomicBool::new(false),
            exported: exported.clone(),
        });
        let manager = SinkManager::new(
            vec![sink],
            DEFAULT_SINK_EXPORT_TIMEOUT,
            DEFAULT_SINK_STOP_TIMEOUT,
        );

        // First export hangs and is abandoned at the deadline; the next
        // tick's batch goes through.
        manager.export_data(&batch_at(0));
        tokio::time::sleep(DEFAULT_SINK_EXPORT_TIMEOUT + Duration::from_secs(1)).await;
        assert!(exported.lock().unwrap().is_empty());

        manager.export_data(&batch_at(1));
        wait_for_exports(&exported, 1).await;
        assert_eq!(*exported.lock().unwrap(), vec![t(1)]);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_does_not_delay_others() {
        let blocked_gate = Arc::new(Semaphore::new(0));
        let blocked_exports = Arc::new(Mutex::new(Vec::new()));
        let fast_exports = Arc::new(Mutex::new(Vec::new()));

        let sinks: Vec<Arc<dyn DataSink>> = vec![
            Arc::new(GatedSink {
                name: "stuck".to_string(),
                gate: blocked_gate,
                exported: blocked_exports.clone(),
            }),
            Arc::new(GatedSink {
                name: "fast".to_string(),
                gate: Arc::new(Semaphore::new(100)),
                exported: fast_exports.clone(),
            }),
        ];
        let manager = SinkManager::new(
            sinks,
            DEFAULT_SINK_EXPORT_TIMEOUT,
            DEFAULT_SINK_STOP_TIMEOUT,
        );

        manager.export_data(&batch_at(0));
        wait_for_exports(&fast_exports, 1).await;
        assert!(blocked_exports.lock().unwrap().is_empty());

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_delivers_final_offering() {
        let exported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(GatedSink {
            name: "final".to_string(),
            gate: Arc::new(Semaphore::new(100)),
            exported: exported.clone(),
        });
        let manager = SinkManager::new(
            vec![sink],
            DEFAULT_SINK_EXPORT_TIMEOUT,
            Duration::from_secs(5),
        );

        manager.export_data(&batch_at(0));
        manager.stop().await;

        assert_eq!(*exported.lock().unwrap(), vec![t(0)]);
    }
}
