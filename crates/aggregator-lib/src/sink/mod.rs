//! Data sinks
//!
//! A sink accepts completed batches and writes them to an external store.
//! Sinks are addressed through the [`DataSink`] capability and built from
//! `<scheme>[:<endpoint>][?opts]` URIs by a static registry; an unknown
//! scheme is a startup error.

pub mod log;
pub mod manager;
pub mod metric_sink;

pub use manager::SinkManager;
pub use metric_sink::MetricSink;

use crate::model::DataBatch;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Pluggable batch writer. `export_data` must return within the sink
/// manager's export deadline or be abandoned; `stop` releases resources
/// within the stop deadline.
#[async_trait]
pub trait DataSink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> String;
    async fn export_data(&self, batch: &DataBatch);
    async fn stop(&self);
}

/// Build every sink named on the command line. The latest-batch cache is
/// not built here: it always exists and is registered by the caller.
pub fn build_sinks(uris: &[String]) -> Result<Vec<Arc<dyn DataSink>>> {
    uris.iter().map(|uri| build_sink(uri)).collect()
}

fn build_sink(uri: &str) -> Result<Arc<dyn DataSink>> {
    let scheme = uri.split_once(':').map(|(s, _)| s).unwrap_or(uri);
    match scheme {
        "log" => Ok(Arc::new(log::LogSink::new())),
        "stdout" => Ok(Arc::new(log::StdoutSink::new())),
        other => bail!(
            "unknown sink scheme {other:?} in {uri:?} (known schemes: log, stdout)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_known_sinks() {
        let sinks = build_sinks(&["log".to_string(), "stdout".to_string()]).unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].name(), "log");
        assert_eq!(sinks[1].name(), "stdout");
    }

    #[test]
    fn test_unknown_scheme_is_an_error() {
        let err = build_sinks(&["influxdb:http://db:8086?db=k8s".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown sink scheme"));
    }
}
