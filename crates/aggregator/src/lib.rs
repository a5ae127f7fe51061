//! Daemon crate for the cluster metrics aggregation service
//!
//! The pipeline itself lives in `aggregator-lib`; this crate adds the
//! flag surface, startup wiring, and the read API.

pub mod api;
pub mod config;
