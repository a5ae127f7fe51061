//! Node / system-container aggregation
//!
//! System-container sets (`node_container`) carry their owning node's
//! identity, and node-level metrics the kubelet did not report directly
//! are filled in by summing the node's system containers. A
//! `node_container` set whose node is absent from the batch violates the
//! key invariants and is dropped.

use super::DataProcessor;
use crate::model::{
    find_metric, node_key, DataBatch, MetricSetType, MetricValue, LABEL_HOSTNAME, LABEL_HOST_ID,
    LABEL_NODENAME,
};
use crate::observability::PipelineMetrics;
use anyhow::Result;
use std::collections::HashMap;
use tracing::error;

pub struct NodeContainerAggregator {
    metrics: PipelineMetrics,
}

impl NodeContainerAggregator {
    pub fn new() -> Self {
        Self {
            metrics: PipelineMetrics::new(),
        }
    }
}

impl Default for NodeContainerAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataProcessor for NodeContainerAggregator {
    fn name(&self) -> &'static str {
        "node_container_aggregator"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let container_keys = batch.keys_of_type(MetricSetType::SystemContainer);

        // Owning-node identity per system container, resolved up front so
        // the per-set mutation below needs no second lookup.
        let mut identities: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
        let mut drops = Vec::new();
        // Sums of each node's system-container metrics, candidates for
        // filling gaps in the node set.
        let mut sums: HashMap<String, HashMap<String, MetricValue>> = HashMap::new();

        for key in &container_keys {
            let Some(set) = batch.metric_sets.get(key) else {
                continue;
            };
            let Some(node_name) = set.label(LABEL_NODENAME).map(str::to_string) else {
                error!(key = %key, "System container set lacks a nodename label; dropping");
                drops.push(key.clone());
                continue;
            };
            let owner_key = node_key(&node_name);
            let Some(node_set) = batch.metric_sets.get(&owner_key) else {
                error!(
                    key = %key,
                    node = %node_name,
                    "System container has no owning node set in this batch; dropping"
                );
                drops.push(key.clone());
                continue;
            };

            identities.insert(
                key.clone(),
                (
                    node_set.label(LABEL_HOST_ID).map(str::to_string),
                    node_set.label(LABEL_HOSTNAME).map(str::to_string),
                ),
            );

            let node_sums = sums.entry(owner_key).or_default();
            for (name, value) in &set.metric_values {
                let aggregatable = find_metric(name).map(|m| m.aggregatable).unwrap_or(false);
                if !aggregatable {
                    continue;
                }
                node_sums
                    .entry(name.clone())
                    .and_modify(|sum| *sum = sum.sum(*value))
                    .or_insert(*value);
            }
        }

        for key in drops {
            self.metrics.inc_invariant_breaches();
            batch.metric_sets.remove(&key);
        }

        for (key, (host_id, hostname)) in identities {
            if let Some(set) = batch.metric_sets.get_mut(&key) {
                if let Some(host_id) = host_id {
                    set.set_label(LABEL_HOST_ID, host_id);
                }
                if let Some(hostname) = hostname {
                    set.set_label(LABEL_HOSTNAME, hostname);
                }
            }
        }

        for (owner_key, node_sums) in sums {
            if let Some(node_set) = batch.metric_sets.get_mut(&owner_key) {
                for (name, value) in node_sums {
                    node_set.metric_values.entry(name).or_insert(value);
                }
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        node_container_key, MetricSet, METRIC_CPU_USAGE, METRIC_MEMORY_USAGE,
    };
    use chrono::Utc;

    fn node_set(name: &str) -> MetricSet {
        let mut set = MetricSet::new(MetricSetType::Node);
        set.set_label(LABEL_NODENAME, name);
        set.set_label(LABEL_HOST_ID, format!("{name}-host-id"));
        set.set_label(LABEL_HOSTNAME, format!("{name}-hostname"));
        set
    }

    fn system_container(node: &str, cpu: i64, memory: i64) -> MetricSet {
        let mut set = MetricSet::new(MetricSetType::SystemContainer);
        set.set_label(LABEL_NODENAME, node);
        set.add_value(&METRIC_CPU_USAGE, MetricValue::Int(cpu));
        set.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(memory));
        set
    }

    #[test]
    fn test_system_containers_inherit_node_identity() {
        let mut batch = DataBatch::new(Utc::now());
        batch.metric_sets.insert(node_key("n1"), node_set("n1"));
        batch.metric_sets.insert(
            node_container_key("n1", "kubelet"),
            system_container("n1", 10, 100),
        );

        let mut aggregator = NodeContainerAggregator::new();
        let batch = aggregator.process(batch).unwrap();

        let set = &batch.metric_sets[&node_container_key("n1", "kubelet")];
        assert_eq!(set.label(LABEL_HOST_ID), Some("n1-host-id"));
        assert_eq!(set.label(LABEL_HOSTNAME), Some("n1-hostname"));
    }

    #[test]
    fn test_node_gaps_filled_from_system_containers() {
        let mut batch = DataBatch::new(Utc::now());
        // The node set reports memory but not CPU.
        let mut node = node_set("n1");
        node.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(5000));
        batch.metric_sets.insert(node_key("n1"), node);
        batch.metric_sets.insert(
            node_container_key("n1", "kubelet"),
            system_container("n1", 10, 100),
        );
        batch.metric_sets.insert(
            node_container_key("n1", "docker-daemon"),
            system_container("n1", 30, 200),
        );

        let mut aggregator = NodeContainerAggregator::new();
        let batch = aggregator.process(batch).unwrap();

        let node = &batch.metric_sets[&node_key("n1")];
        // CPU was missing and gets the summed value; memory keeps the
        // node's own reading.
        assert_eq!(node.metric_values["cpu/usage"], MetricValue::Int(40));
        assert_eq!(node.metric_values["memory/usage"], MetricValue::Int(5000));
    }

    #[test]
    fn test_orphan_system_container_dropped() {
        let mut batch = DataBatch::new(Utc::now());
        batch.metric_sets.insert(
            node_container_key("ghost", "kubelet"),
            system_container("ghost", 10, 100),
        );

        let mut aggregator = NodeContainerAggregator::new();
        let batch = aggregator.process(batch).unwrap();
        assert!(batch.is_empty());
    }
}
