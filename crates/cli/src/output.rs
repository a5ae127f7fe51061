//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// One sample as returned by the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// Series response of the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricResult {
    pub metrics: Vec<MetricPoint>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "TIMESTAMP")]
    timestamp: String,
    #[tabled(rename = "VALUE")]
    value: String,
}

/// Print a metric series.
pub fn print_series(result: &MetricResult, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if result.metrics.is_empty() {
                println!("{}", "No samples retained for this metric".yellow());
                return;
            }
            let rows: Vec<SeriesRow> = result
                .metrics
                .iter()
                .map(|p| SeriesRow {
                    timestamp: p.timestamp.to_rfc3339(),
                    value: p.value.to_string(),
                })
                .collect();
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(result) {
                println!("{}", json);
            }
        }
    }
}

/// Print the list of known metric names.
pub fn print_names(names: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            for name in names {
                println!("{name}");
            }
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(names) {
                println!("{}", json);
            }
        }
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
