//! Daemon configuration
//!
//! Flag surface and the definitional validations applied before anything
//! starts. Validation failures are fatal and exit with code 1.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Cluster-wide metrics aggregation service
#[derive(Parser, Debug, Clone)]
#[command(name = "metrics-aggregator")]
#[command(version, about = "Scrapes per-node resource usage and fans it out to sinks")]
pub struct Opts {
    /// Resolution at which metrics are scraped and retained
    #[arg(long = "metric_resolution", default_value = "60s", value_parser = parse_duration)]
    pub metric_resolution: Duration,

    /// Port for the read API
    #[arg(long, default_value_t = 8082)]
    pub port: u16,

    /// IP to listen on; defaults to all interfaces
    #[arg(long = "listen_ip", default_value = "")]
    pub listen_ip: String,

    /// Max number of CPUs used simultaneously; 0 uses all cores
    #[arg(long = "max_procs", default_value_t = 0)]
    pub max_procs: usize,

    /// Source URI to scrape, e.g. kubernetes.summary_api:<host>?kubeletHttps=true
    #[arg(long = "source")]
    pub sources: Vec<String>,

    /// Sink URI receiving every batch (repeatable), e.g. log
    #[arg(long = "sink")]
    pub sinks: Vec<String>,

    /// Processor chain to apply to each batch
    #[arg(long, default_value = "kubernetes")]
    pub processors: String,

    /// File containing the TLS certificate for the read API
    #[arg(long = "tls_cert")]
    pub tls_cert: Option<PathBuf>,

    /// File containing the TLS key for the read API
    #[arg(long = "tls_key")]
    pub tls_key: Option<PathBuf>,

    /// File containing the TLS client CA for client cert validation
    #[arg(long = "tls_client_ca")]
    pub tls_client_ca: Option<PathBuf>,

    /// Comma-separated list of users allowed to access the API
    #[arg(long = "allowed_users", default_value = "")]
    pub allowed_users: String,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

impl Opts {
    pub fn validate(&self) -> Result<()> {
        if self.metric_resolution < Duration::from_secs(5) {
            bail!(
                "metric resolution needs to be greater than 5 seconds - got {:?}",
                self.metric_resolution
            );
        }
        if self.sources.len() != 1 {
            bail!(
                "exactly one --source must be specified - got {}",
                self.sources.len()
            );
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("both TLS certificate & key are required to enable TLS serving");
        }
        if self.tls_client_ca.is_some() && self.tls_cert.is_none() {
            bail!("client cert authentication requires TLS certificate & key");
        }
        if !self.allowed_users.is_empty() && self.tls_client_ca.is_none() {
            bail!("--allowed_users requires client cert authentication (--tls_client_ca)");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        let ip = if self.listen_ip.is_empty() {
            "0.0.0.0"
        } else {
            &self.listen_ip
        };
        format!("{ip}:{}", self.port)
    }
}
