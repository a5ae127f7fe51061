//! Metric catalog
//!
//! Process-global descriptors for every metric the pipeline emits. The
//! `aggregatable` flag drives the namespace/cluster roll-up processors;
//! network metrics are scraped per pod and therefore never summed upward.

use super::{MetricType, Units, ValueType};

/// Schema descriptor for one metric. Descriptors are process-global
/// constants; samples reference them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
    pub metric_type: MetricType,
    pub value_type: ValueType,
    pub units: Units,
    pub aggregatable: bool,
}

pub const METRIC_UPTIME: Metric = Metric {
    name: "uptime",
    description: "Number of milliseconds since the container was started",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Milliseconds,
    aggregatable: false,
};

pub const METRIC_CPU_USAGE: Metric = Metric {
    name: "cpu/usage",
    description: "Cumulative CPU usage on all cores",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Nanoseconds,
    aggregatable: true,
};

pub const METRIC_CPU_USAGE_RATE: Metric = Metric {
    name: "cpu/usage_rate",
    description: "CPU usage on all cores in nanoseconds per second",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Float64,
    units: Units::NanosecondsPerSecond,
    aggregatable: true,
};

pub const METRIC_MEMORY_USAGE: Metric = Metric {
    name: "memory/usage",
    description: "Total memory usage",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: true,
};

pub const METRIC_MEMORY_WORKING_SET: Metric = Metric {
    name: "memory/working_set",
    description: "Total working set usage; working set is the memory in use that cannot be easily dropped by the kernel",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: true,
};

pub const METRIC_MEMORY_RSS: Metric = Metric {
    name: "memory/rss",
    description: "Resident set size",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: true,
};

pub const METRIC_MEMORY_PAGE_FAULTS: Metric = Metric {
    name: "memory/page_faults",
    description: "Number of page faults",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Count,
    aggregatable: true,
};

pub const METRIC_MEMORY_MAJOR_PAGE_FAULTS: Metric = Metric {
    name: "memory/major_page_faults",
    description: "Number of major page faults",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Count,
    aggregatable: true,
};

pub const METRIC_MEMORY_PAGE_FAULTS_RATE: Metric = Metric {
    name: "memory/page_faults_rate",
    description: "Rate of page faults per second",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Float64,
    units: Units::CountPerSecond,
    aggregatable: true,
};

pub const METRIC_MEMORY_MAJOR_PAGE_FAULTS_RATE: Metric = Metric {
    name: "memory/major_page_faults_rate",
    description: "Rate of major page faults per second",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Float64,
    units: Units::CountPerSecond,
    aggregatable: true,
};

pub const METRIC_NETWORK_RX: Metric = Metric {
    name: "network/rx",
    description: "Cumulative bytes received over the network",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: false,
};

pub const METRIC_NETWORK_RX_ERRORS: Metric = Metric {
    name: "network/rx_errors",
    description: "Cumulative errors while receiving over the network",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Count,
    aggregatable: false,
};

pub const METRIC_NETWORK_TX: Metric = Metric {
    name: "network/tx",
    description: "Cumulative bytes sent over the network",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: false,
};

pub const METRIC_NETWORK_TX_ERRORS: Metric = Metric {
    name: "network/tx_errors",
    description: "Cumulative errors while sending over the network",
    metric_type: MetricType::Cumulative,
    value_type: ValueType::Int64,
    units: Units::Count,
    aggregatable: false,
};

pub const METRIC_NETWORK_RX_RATE: Metric = Metric {
    name: "network/rx_rate",
    description: "Bytes received over the network per second",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Float64,
    units: Units::BytesPerSecond,
    aggregatable: false,
};

pub const METRIC_NETWORK_TX_RATE: Metric = Metric {
    name: "network/tx_rate",
    description: "Bytes sent over the network per second",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Float64,
    units: Units::BytesPerSecond,
    aggregatable: false,
};

pub const METRIC_FILESYSTEM_USAGE: Metric = Metric {
    name: "filesystem/usage",
    description: "Total disk space used on a filesystem",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: false,
};

pub const METRIC_FILESYSTEM_LIMIT: Metric = Metric {
    name: "filesystem/limit",
    description: "Total capacity of a filesystem",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: false,
};

pub const METRIC_FILESYSTEM_AVAILABLE: Metric = Metric {
    name: "filesystem/available",
    description: "Disk space still available on a filesystem",
    metric_type: MetricType::Gauge,
    value_type: ValueType::Int64,
    units: Units::Bytes,
    aggregatable: false,
};

/// Every descriptor the pipeline knows about, derived metrics included.
pub const STANDARD_METRICS: &[&Metric] = &[
    &METRIC_UPTIME,
    &METRIC_CPU_USAGE,
    &METRIC_CPU_USAGE_RATE,
    &METRIC_MEMORY_USAGE,
    &METRIC_MEMORY_WORKING_SET,
    &METRIC_MEMORY_RSS,
    &METRIC_MEMORY_PAGE_FAULTS,
    &METRIC_MEMORY_MAJOR_PAGE_FAULTS,
    &METRIC_MEMORY_PAGE_FAULTS_RATE,
    &METRIC_MEMORY_MAJOR_PAGE_FAULTS_RATE,
    &METRIC_NETWORK_RX,
    &METRIC_NETWORK_RX_ERRORS,
    &METRIC_NETWORK_TX,
    &METRIC_NETWORK_TX_ERRORS,
    &METRIC_NETWORK_RX_RATE,
    &METRIC_NETWORK_TX_RATE,
    &METRIC_FILESYSTEM_USAGE,
    &METRIC_FILESYSTEM_LIMIT,
    &METRIC_FILESYSTEM_AVAILABLE,
];

/// Cumulative metric -> gauge derived by the rate calculator.
pub const RATE_DERIVATIONS: &[(&str, &Metric)] = &[
    ("cpu/usage", &METRIC_CPU_USAGE_RATE),
    ("memory/page_faults", &METRIC_MEMORY_PAGE_FAULTS_RATE),
    ("memory/major_page_faults", &METRIC_MEMORY_MAJOR_PAGE_FAULTS_RATE),
    ("network/rx", &METRIC_NETWORK_RX_RATE),
    ("network/tx", &METRIC_NETWORK_TX_RATE),
];

/// Look up a descriptor by metric name.
pub fn find_metric(name: &str) -> Option<&'static Metric> {
    STANDARD_METRICS.iter().find(|m| m.name == name).copied()
}

/// Names of all known metrics, for the read API listing.
pub fn metric_names() -> Vec<String> {
    STANDARD_METRICS.iter().map(|m| m.name.to_string()).collect()
}
