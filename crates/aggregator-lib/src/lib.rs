//! Core library for the cluster metrics aggregation service
//!
//! This crate provides the metrics pipeline:
//! - the typed metric model and key schema
//! - per-node kubelet summary sources and node discovery
//! - the source manager fanning out bounded, deadlined scrapes
//! - the processor chain (enrichment, aggregation, rate derivation)
//! - the sink manager and the latest-batch cache behind the read API
//! - the tick manager wiring it all together

pub mod kubernetes;
pub mod manager;
pub mod model;
pub mod observability;
pub mod processor;
pub mod sink;
pub mod source;

pub use manager::{Manager, ManagerState, DEFAULT_METRIC_RESOLUTION};
pub use observability::PipelineMetrics;
