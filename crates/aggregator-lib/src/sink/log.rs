//! Reference sink drivers
//!
//! `log` writes a structured summary of every batch to the tracing
//! output; `stdout` dumps batches in a human-readable form. Both exist so
//! a deployment can verify the pipeline end to end without an external
//! store.

use super::DataSink;
use crate::model::DataBatch;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSink for LogSink {
    fn name(&self) -> String {
        "log".to_string()
    }

    async fn export_data(&self, batch: &DataBatch) {
        info!(
            timestamp = %batch.timestamp,
            metric_sets = batch.len(),
            "Exporting batch"
        );
        for (key, set) in &batch.metric_sets {
            debug!(
                key = %key,
                metrics = set.metric_values.len(),
                labeled_metrics = set.labeled_metrics.len(),
                "Batch entry"
            );
        }
    }

    async fn stop(&self) {}
}

#[derive(Debug)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSink for StdoutSink {
    fn name(&self) -> String {
        "stdout".to_string()
    }

    async fn export_data(&self, batch: &DataBatch) {
        println!("{}", format_batch(batch));
    }

    async fn stop(&self) {}
}

fn format_batch(batch: &DataBatch) -> String {
    let mut out = format!(
        "batch @ {} ({} metric sets)\n",
        batch.timestamp.to_rfc3339(),
        batch.len()
    );
    // Sort keys so the dump is stable for eyeballs and tests.
    let sorted: BTreeMap<_, _> = batch.metric_sets.iter().collect();
    for (key, set) in sorted {
        out.push_str(&format!("  {key}\n"));
        let values: BTreeMap<_, _> = set.metric_values.iter().collect();
        for (name, value) in values {
            out.push_str(&format!("    {name} = {value:?}\n"));
        }
        for labeled in &set.labeled_metrics {
            let labels: BTreeMap<_, _> = labeled.labels.iter().collect();
            out.push_str(&format!(
                "    {} {:?} = {:?}\n",
                labeled.name, labels, labeled.value
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        node_key, MetricSet, MetricSetType, MetricValue, METRIC_MEMORY_USAGE,
    };
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_batch_is_stable() {
        let mut batch = DataBatch::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut set = MetricSet::new(MetricSetType::Node);
        set.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(100));
        batch.metric_sets.insert(node_key("n1"), set);

        let dump = format_batch(&batch);
        assert!(dump.contains("batch @ 2024-03-01T12:00:00+00:00 (1 metric sets)"));
        assert!(dump.contains("node:n1"));
        assert!(dump.contains("memory/usage = Int(100)"));
    }
}
