//! Core data model for the metrics pipeline
//!
//! Every entity observed by the pipeline (node, system container, pod,
//! pod container, namespace, cluster) is identified by a string key with a
//! fixed grammar, so keys collide iff the entities are semantically the
//! same. A [`DataBatch`] holds one tick's worth of [`MetricSet`]s keyed by
//! entity.

mod catalog;

pub use catalog::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a metric behaves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Point-in-time measurement.
    Gauge,
    /// Monotonically non-decreasing counter, reset at entity recreation.
    Cumulative,
    /// Difference since the previous sample.
    Delta,
}

/// Scalar type carried by a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int64,
    Float64,
}

/// Measurement units of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Count,
    Bytes,
    Milliseconds,
    Nanoseconds,
    BytesPerSecond,
    CountPerSecond,
    NanosecondsPerSecond,
}

/// A single scalar sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            MetricValue::Int(_) => ValueType::Int64,
            MetricValue::Float(_) => ValueType::Float64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::Float(v) => *v,
        }
    }

    /// Sum of two values of the same scalar type; mixed types promote to
    /// float.
    pub fn sum(self, other: MetricValue) -> MetricValue {
        match (self, other) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a + b),
            (a, b) => MetricValue::Float(a.as_f64() + b.as_f64()),
        }
    }
}

/// A metric value distinguished within a set by extra labels, e.g. one
/// entry per filesystem with `resource_id = "/"`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMetric {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: MetricValue,
}

/// Kind of entity a [`MetricSet`] describes. Stored as the `type` label
/// and mirrored by the key grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricSetType {
    Node,
    SystemContainer,
    Pod,
    PodContainer,
    Namespace,
    Cluster,
}

impl MetricSetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSetType::Node => "node",
            MetricSetType::SystemContainer => "node_container",
            MetricSetType::Pod => "pod",
            MetricSetType::PodContainer => "pod_container",
            MetricSetType::Namespace => "namespace",
            MetricSetType::Cluster => "cluster",
        }
    }

    pub fn parse(s: &str) -> Option<MetricSetType> {
        match s {
            "node" => Some(MetricSetType::Node),
            "node_container" => Some(MetricSetType::SystemContainer),
            "pod" => Some(MetricSetType::Pod),
            "pod_container" => Some(MetricSetType::PodContainer),
            "namespace" => Some(MetricSetType::Namespace),
            "cluster" => Some(MetricSetType::Cluster),
            _ => None,
        }
    }
}

// Identity label keys. `type` is mandatory on every set.
pub const LABEL_METRIC_SET_TYPE: &str = "type";
pub const LABEL_NODENAME: &str = "nodename";
pub const LABEL_HOSTNAME: &str = "hostname";
pub const LABEL_HOST_ID: &str = "host_id";
pub const LABEL_CONTAINER_NAME: &str = "container_name";
pub const LABEL_POD_NAME: &str = "pod_name";
pub const LABEL_POD_ID: &str = "pod_id";
pub const LABEL_NAMESPACE_NAME: &str = "namespace_name";
pub const LABEL_NAMESPACE_ID: &str = "namespace_id";
pub const LABEL_LABELS: &str = "labels";
pub const LABEL_OWNER: &str = "owner";
pub const LABEL_RESOURCE_ID: &str = "resource_id";

/// Key of the single cluster-wide metric set.
pub const CLUSTER_KEY: &str = "cluster";

pub fn node_key(node: &str) -> String {
    format!("node:{node}")
}

pub fn node_container_key(node: &str, container: &str) -> String {
    format!("node:{node}/container:{container}")
}

pub fn pod_key(namespace: &str, pod: &str) -> String {
    format!("namespace:{namespace}/pod:{pod}")
}

pub fn pod_container_key(namespace: &str, pod: &str, container: &str) -> String {
    format!("namespace:{namespace}/pod:{pod}/container:{container}")
}

pub fn namespace_key(namespace: &str) -> String {
    format!("namespace:{namespace}")
}

/// Entity type implied by a key's grammar, used to check the invariant
/// that a set's key and its `type` label agree.
pub fn key_metric_set_type(key: &str) -> Option<MetricSetType> {
    if key == CLUSTER_KEY {
        return Some(MetricSetType::Cluster);
    }
    if let Some(rest) = key.strip_prefix("node:") {
        return if rest.contains("/container:") {
            Some(MetricSetType::SystemContainer)
        } else {
            Some(MetricSetType::Node)
        };
    }
    if let Some(rest) = key.strip_prefix("namespace:") {
        return if rest.contains("/pod:") {
            if rest.contains("/container:") {
                Some(MetricSetType::PodContainer)
            } else {
                Some(MetricSetType::Pod)
            }
        } else {
            Some(MetricSetType::Namespace)
        };
    }
    None
}

/// The metrics bundle for one keyed entity, produced fresh every tick.
#[derive(Debug, Clone)]
pub struct MetricSet {
    /// Birth time of the underlying entity (container start, pod start).
    pub create_time: DateTime<Utc>,
    /// Time the sample was observed at the source.
    pub scrape_time: DateTime<Utc>,
    /// Identity labels; always contains `type`.
    pub labels: HashMap<String, String>,
    /// Metric name -> value; names unique within the set.
    pub metric_values: HashMap<String, MetricValue>,
    /// Repeated metrics distinguished by extra labels (filesystems,
    /// volumes); duplicates allowed across different label sets.
    pub labeled_metrics: Vec<LabeledMetric>,
}

impl MetricSet {
    pub fn new(set_type: MetricSetType) -> Self {
        let mut labels = HashMap::new();
        labels.insert(
            LABEL_METRIC_SET_TYPE.to_string(),
            set_type.as_str().to_string(),
        );
        Self {
            create_time: DateTime::UNIX_EPOCH,
            scrape_time: DateTime::UNIX_EPOCH,
            labels,
            metric_values: HashMap::new(),
            labeled_metrics: Vec::new(),
        }
    }

    /// The set's declared type, parsed from the `type` label.
    pub fn set_type(&self) -> Option<MetricSetType> {
        self.labels
            .get(LABEL_METRIC_SET_TYPE)
            .and_then(|s| MetricSetType::parse(s))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels.insert(key.to_string(), value.into());
    }

    pub fn add_value(&mut self, metric: &Metric, value: MetricValue) {
        self.metric_values.insert(metric.name.to_string(), value);
    }
}

/// All metric sets produced in one tick, keyed by entity.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// Tick start.
    pub timestamp: DateTime<Utc>,
    pub metric_sets: HashMap<String, MetricSet>,
}

impl DataBatch {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            metric_sets: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metric_sets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metric_sets.len()
    }

    /// Keys of all sets with the given type label.
    pub fn keys_of_type(&self, set_type: MetricSetType) -> Vec<String> {
        self.metric_sets
            .iter()
            .filter(|(_, set)| set.set_type() == Some(set_type))
            .map(|(key, _)| key.clone())
            .collect()
    }
}
