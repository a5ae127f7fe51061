//! Metric sources
//!
//! A source scrapes one endpoint (typically one node's kubelet) and
//! yields a partial [`DataBatch`]. The provider enumerates the current
//! sources each tick; the source manager fans scrapes out under a shared
//! deadline and merges the results.

pub mod discovery;
pub mod manager;
pub mod summary;

use crate::model::DataBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Pluggable scraper for one endpoint.
///
/// `scrape_metrics` must return within the source manager's deadline or
/// return a partial/empty batch with a logged error; it never blocks
/// indefinitely and never fails the tick.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> String;
    async fn scrape_metrics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DataBatch;
}

/// Enumerates the sources to scrape this tick.
pub trait MetricsSourceProvider: Send + Sync {
    fn sources(&self) -> Vec<Arc<dyn MetricsSource>>;
}

/// Identity and stats endpoint of one node's kubelet.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub https: bool,
    pub host_id: String,
}
