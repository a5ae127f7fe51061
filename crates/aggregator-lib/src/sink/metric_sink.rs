//! Latest-batch cache
//!
//! A distinguished in-memory sink retaining the most recent batches in a
//! small ring. It backs the read API and the health check; it is not
//! durable storage, and one batch displacement is the full extent of its
//! lifecycle management. Contention is tick-rate on the write side, so a
//! plain reader-preferring `RwLock` is all the coordination needed.

use super::DataSink;
use crate::model::{DataBatch, MetricValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::RwLock;

/// Default ring depth; covers ten metric resolutions of history.
pub const DEFAULT_RETAINED_BATCHES: usize = 10;

/// One sample of one metric for one entity, as served by the read API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
}

#[derive(Debug)]
pub struct MetricSink {
    // Newest batch at the front.
    ring: RwLock<VecDeque<DataBatch>>,
    capacity: usize,
}

impl MetricSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// The most recently exported batch, if any.
    pub fn latest_data_batch(&self) -> Option<DataBatch> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        ring.front().cloned()
    }

    /// Timestamp and size of the latest batch, for the health check.
    pub fn latest_batch_info(&self) -> Option<(DateTime<Utc>, usize)> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        ring.front().map(|batch| (batch.timestamp, batch.len()))
    }

    /// Samples of `metric` for the entity at `key`, oldest first,
    /// restricted to batches within `[since, until]` when given.
    pub fn metric_samples(
        &self,
        key: &str,
        metric: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<MetricPoint> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        let mut points = Vec::new();
        for batch in ring.iter().rev() {
            if since.is_some_and(|s| batch.timestamp < s) {
                continue;
            }
            if until.is_some_and(|u| batch.timestamp > u) {
                continue;
            }
            if let Some(set) = batch.metric_sets.get(key) {
                if let Some(value) = set.metric_values.get(metric) {
                    points.push(MetricPoint {
                        timestamp: batch.timestamp,
                        value: *value,
                    });
                }
            }
        }
        points
    }
}

#[async_trait]
impl DataSink for MetricSink {
    fn name(&self) -> String {
        "metric_sink".to_string()
    }

    async fn export_data(&self, batch: &DataBatch) {
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        ring.push_front(batch.clone());
        while ring.len() > self.capacity {
            ring.pop_back();
        }
    }

    async fn stop(&self) {}
}
