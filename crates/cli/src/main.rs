//! magctl - query CLI for the cluster metrics aggregation service
//!
//! Reads the aggregator's model API: known metric names and the most
//! recent samples for nodes, pods, and containers, plus the health check.

mod client;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{encode_metric, ApiClient};
use output::{MetricResult, OutputFormat};

/// Query CLI for the metrics aggregator
#[derive(Parser)]
#[command(name = "magctl")]
#[command(author, version, about = "Query the metrics aggregator's read API", long_about = None)]
pub struct Cli {
    /// Aggregator API endpoint (can also be set via MAG_API_URL)
    #[arg(long, env = "MAG_API_URL", default_value = "http://localhost:8082")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known metric names
    Metrics,

    /// Show a node metric series
    Node {
        /// Node name
        node: String,
        /// Metric name, e.g. cpu/usage_rate
        metric: String,
        /// Only samples at or after this RFC3339 timestamp
        #[arg(long)]
        start: Option<String>,
        /// Only samples at or before this RFC3339 timestamp
        #[arg(long)]
        end: Option<String>,
    },

    /// Show a pod metric series
    Pod {
        namespace: String,
        pod: String,
        metric: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },

    /// Show a container metric series
    Container {
        namespace: String,
        pod: String,
        container: String,
        metric: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },

    /// Check the aggregator's health endpoint
    Health,
}

fn range_query<'a>(start: &'a Option<String>, end: &'a Option<String>) -> Vec<(&'a str, &'a str)> {
    let mut query = Vec::new();
    if let Some(start) = start {
        query.push(("start", start.as_str()));
    }
    if let Some(end) = end {
        query.push(("end", end.as_str()));
    }
    query
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api_url)?;

    match &cli.command {
        Commands::Metrics => {
            let names: Vec<String> = client.get("/api/v1/model/metrics", &[]).await?;
            output::print_names(&names, cli.format);
        }
        Commands::Node {
            node,
            metric,
            start,
            end,
        } => {
            let path = format!(
                "/api/v1/model/nodes/{node}/metrics/{}",
                encode_metric(metric)
            );
            let result: MetricResult = client.get(&path, &range_query(start, end)).await?;
            output::print_series(&result, cli.format);
        }
        Commands::Pod {
            namespace,
            pod,
            metric,
            start,
            end,
        } => {
            let path = format!(
                "/api/v1/model/namespaces/{namespace}/pods/{pod}/metrics/{}",
                encode_metric(metric)
            );
            let result: MetricResult = client.get(&path, &range_query(start, end)).await?;
            output::print_series(&result, cli.format);
        }
        Commands::Container {
            namespace,
            pod,
            container,
            metric,
            start,
            end,
        } => {
            let path = format!(
                "/api/v1/model/namespaces/{namespace}/pods/{pod}/containers/{container}/metrics/{}",
                encode_metric(metric)
            );
            let result: MetricResult = client.get(&path, &range_query(start, end)).await?;
            output::print_series(&result, cli.format);
        }
        Commands::Health => {
            let (ok, body) = client.get_text("/healthz").await?;
            if ok {
                output::print_success("aggregator is healthy");
            } else {
                output::print_error(&body);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
