//! Upward aggregation
//!
//! Sums aggregatable metrics from pod containers to pods, pods to
//! namespaces, and namespaces to the single cluster set. Only metrics
//! whose descriptor is flagged aggregatable participate; network metrics
//! are scraped per pod and are left alone.

use super::DataProcessor;
use crate::model::{
    find_metric, namespace_key, pod_key, DataBatch, MetricSet, MetricSetType, MetricValue,
    CLUSTER_KEY, LABEL_NAMESPACE_ID, LABEL_NAMESPACE_NAME, LABEL_POD_NAME,
};
use crate::observability::PipelineMetrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::error;

/// Aggregatable metric values of one set, by descriptor flag.
fn aggregatable_values(set: &MetricSet) -> impl Iterator<Item = (&String, MetricValue)> {
    set.metric_values.iter().filter_map(|(name, value)| {
        let metric = find_metric(name)?;
        metric.aggregatable.then_some((name, *value))
    })
}

/// Accumulates sums plus the time bounds of the contributing sets.
#[derive(Default)]
struct Rollup {
    values: HashMap<String, MetricValue>,
    create_time: Option<DateTime<Utc>>,
    scrape_time: Option<DateTime<Utc>>,
    namespace_id: Option<String>,
}

impl Rollup {
    fn absorb(&mut self, set: &MetricSet) {
        for (name, value) in aggregatable_values(set) {
            self.values
                .entry(name.clone())
                .and_modify(|sum| *sum = sum.sum(value))
                .or_insert(value);
        }
        self.create_time = Some(match self.create_time {
            Some(t) => t.min(set.create_time),
            None => set.create_time,
        });
        self.scrape_time = Some(match self.scrape_time {
            Some(t) => t.max(set.scrape_time),
            None => set.scrape_time,
        });
        if self.namespace_id.is_none() {
            self.namespace_id = set.label(LABEL_NAMESPACE_ID).map(str::to_string);
        }
    }

    fn into_set(self, set_type: MetricSetType) -> MetricSet {
        let mut set = MetricSet::new(set_type);
        set.metric_values = self.values;
        if let Some(t) = self.create_time {
            set.create_time = t;
        }
        if let Some(t) = self.scrape_time {
            set.scrape_time = t;
        }
        set
    }
}

/// Fills pod-level metrics missing from a pod set by summing its
/// containers. Pod container sets without a pod set in the batch break
/// the model invariants and are dropped.
pub struct PodAggregator {
    metrics: PipelineMetrics,
}

impl PodAggregator {
    pub fn new() -> Self {
        Self {
            metrics: PipelineMetrics::new(),
        }
    }
}

impl Default for PodAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataProcessor for PodAggregator {
    fn name(&self) -> &'static str {
        "pod_aggregator"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let mut sums: HashMap<String, HashMap<String, MetricValue>> = HashMap::new();
        let mut orphans = Vec::new();

        for (key, set) in &batch.metric_sets {
            if set.set_type() != Some(MetricSetType::PodContainer) {
                continue;
            }
            let namespace = set.label(LABEL_NAMESPACE_NAME);
            let pod_name = set.label(LABEL_POD_NAME);
            let (Some(namespace), Some(pod_name)) = (namespace, pod_name) else {
                error!(key = %key, "Pod container set lacks identity labels; dropping");
                orphans.push(key.clone());
                continue;
            };
            let owner_key = pod_key(namespace, pod_name);
            if !batch.metric_sets.contains_key(&owner_key) {
                error!(
                    key = %key,
                    pod = %owner_key,
                    "Pod container has no pod set in this batch; dropping"
                );
                orphans.push(key.clone());
                continue;
            }

            let pod_sums = sums.entry(owner_key).or_default();
            for (name, value) in aggregatable_values(set) {
                pod_sums
                    .entry(name.clone())
                    .and_modify(|sum| *sum = sum.sum(value))
                    .or_insert(value);
            }
        }

        for key in orphans {
            self.metrics.inc_invariant_breaches();
            batch.metric_sets.remove(&key);
        }

        for (owner_key, pod_sums) in sums {
            if let Some(pod_set) = batch.metric_sets.get_mut(&owner_key) {
                for (name, value) in pod_sums {
                    // The pod's own reading wins when the kubelet
                    // reported one.
                    pod_set.metric_values.entry(name).or_insert(value);
                }
            }
        }

        Ok(batch)
    }
}

/// Sums pod-level metrics into one set per namespace.
pub struct NamespaceAggregator;

impl NamespaceAggregator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NamespaceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataProcessor for NamespaceAggregator {
    fn name(&self) -> &'static str {
        "namespace_aggregator"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let mut rollups: HashMap<String, Rollup> = HashMap::new();

        for set in batch.metric_sets.values() {
            if set.set_type() != Some(MetricSetType::Pod) {
                continue;
            }
            let Some(namespace) = set.label(LABEL_NAMESPACE_NAME).map(str::to_string) else {
                continue;
            };
            rollups.entry(namespace).or_default().absorb(set);
        }

        for (namespace, rollup) in rollups {
            let namespace_id = rollup.namespace_id.clone();
            let mut set = rollup.into_set(MetricSetType::Namespace);
            set.set_label(LABEL_NAMESPACE_NAME, namespace.clone());
            if let Some(id) = namespace_id {
                set.set_label(LABEL_NAMESPACE_ID, id);
            }
            batch.metric_sets.insert(namespace_key(&namespace), set);
        }

        Ok(batch)
    }
}

/// Sums namespace-level metrics into the single cluster set.
pub struct ClusterAggregator;

impl ClusterAggregator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClusterAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataProcessor for ClusterAggregator {
    fn name(&self) -> &'static str {
        "cluster_aggregator"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let mut rollup = Rollup::default();
        for set in batch.metric_sets.values() {
            if set.set_type() == Some(MetricSetType::Namespace) {
                rollup.absorb(set);
            }
        }

        let set = rollup.into_set(MetricSetType::Cluster);
        batch.metric_sets.insert(CLUSTER_KEY.to_string(), set);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        pod_container_key, LABEL_METRIC_SET_TYPE, METRIC_CPU_USAGE, METRIC_MEMORY_USAGE,
        METRIC_NETWORK_RX,
    };
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn pod_set(namespace: &str, pod: &str) -> MetricSet {
        let mut set = MetricSet::new(MetricSetType::Pod);
        set.set_label(LABEL_NAMESPACE_NAME, namespace);
        set.set_label(LABEL_POD_NAME, pod);
        set.create_time = ts();
        set.scrape_time = ts();
        set
    }

    fn container_set(namespace: &str, pod: &str, cpu: i64) -> MetricSet {
        let mut set = MetricSet::new(MetricSetType::PodContainer);
        set.set_label(LABEL_NAMESPACE_NAME, namespace);
        set.set_label(LABEL_POD_NAME, pod);
        set.add_value(&METRIC_CPU_USAGE, MetricValue::Int(cpu));
        set.create_time = ts();
        set.scrape_time = ts();
        set
    }

    fn two_container_batch() -> DataBatch {
        let mut batch = DataBatch::new(ts());
        batch
            .metric_sets
            .insert(pod_key("ns1", "p1"), pod_set("ns1", "p1"));
        batch.metric_sets.insert(
            pod_container_key("ns1", "p1", "c1"),
            container_set("ns1", "p1", 10),
        );
        batch.metric_sets.insert(
            pod_container_key("ns1", "p1", "c2"),
            container_set("ns1", "p1", 30),
        );
        batch
    }

    #[test]
    fn test_pod_aggregator_sums_missing_pod_metrics() {
        let mut aggregator = PodAggregator::new();
        let batch = aggregator.process(two_container_batch()).unwrap();

        let pod = &batch.metric_sets[&pod_key("ns1", "p1")];
        assert_eq!(pod.metric_values["cpu/usage"], MetricValue::Int(40));
    }

    #[test]
    fn test_pod_aggregator_keeps_existing_pod_reading() {
        let mut batch = two_container_batch();
        batch
            .metric_sets
            .get_mut(&pod_key("ns1", "p1"))
            .unwrap()
            .add_value(&METRIC_CPU_USAGE, MetricValue::Int(99));

        let mut aggregator = PodAggregator::new();
        let batch = aggregator.process(batch).unwrap();

        let pod = &batch.metric_sets[&pod_key("ns1", "p1")];
        assert_eq!(pod.metric_values["cpu/usage"], MetricValue::Int(99));
    }

    #[test]
    fn test_pod_aggregator_skips_network_metrics() {
        let mut batch = two_container_batch();
        batch
            .metric_sets
            .get_mut(&pod_container_key("ns1", "p1", "c1"))
            .unwrap()
            .add_value(&METRIC_NETWORK_RX, MetricValue::Int(1234));

        let mut aggregator = PodAggregator::new();
        let batch = aggregator.process(batch).unwrap();

        let pod = &batch.metric_sets[&pod_key("ns1", "p1")];
        assert!(!pod.metric_values.contains_key("network/rx"));
    }

    #[test]
    fn test_pod_aggregator_drops_orphan_containers() {
        let mut batch = DataBatch::new(ts());
        batch.metric_sets.insert(
            pod_container_key("ns1", "ghost", "c1"),
            container_set("ns1", "ghost", 10),
        );

        let mut aggregator = PodAggregator::new();
        let batch = aggregator.process(batch).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_pod_aggregator_is_idempotent() {
        let mut aggregator = PodAggregator::new();
        let once = aggregator.process(two_container_batch()).unwrap();
        let twice = aggregator.process(once.clone()).unwrap();

        let a = &once.metric_sets[&pod_key("ns1", "p1")];
        let b = &twice.metric_sets[&pod_key("ns1", "p1")];
        assert_eq!(a.metric_values, b.metric_values);
    }

    #[test]
    fn test_namespace_and_cluster_aggregation() {
        let mut batch = DataBatch::new(ts());
        let mut p1 = pod_set("ns1", "p1");
        p1.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(100));
        let mut p2 = pod_set("ns1", "p2");
        p2.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(200));
        let mut p3 = pod_set("ns2", "p3");
        p3.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(1000));
        batch.metric_sets.insert(pod_key("ns1", "p1"), p1);
        batch.metric_sets.insert(pod_key("ns1", "p2"), p2);
        batch.metric_sets.insert(pod_key("ns2", "p3"), p3);

        let batch = NamespaceAggregator::new().process(batch).unwrap();
        let batch = ClusterAggregator::new().process(batch).unwrap();

        let ns1 = &batch.metric_sets[&namespace_key("ns1")];
        assert_eq!(ns1.label(LABEL_METRIC_SET_TYPE), Some("namespace"));
        assert_eq!(ns1.label(LABEL_NAMESPACE_NAME), Some("ns1"));
        assert_eq!(ns1.metric_values["memory/usage"], MetricValue::Int(300));

        let ns2 = &batch.metric_sets[&namespace_key("ns2")];
        assert_eq!(ns2.metric_values["memory/usage"], MetricValue::Int(1000));

        let cluster = &batch.metric_sets[CLUSTER_KEY];
        assert_eq!(cluster.label(LABEL_METRIC_SET_TYPE), Some("cluster"));
        assert_eq!(cluster.metric_values["memory/usage"], MetricValue::Int(1300));
    }

    #[test]
    fn test_cluster_set_exists_even_without_namespaces() {
        let batch = ClusterAggregator::new()
            .process(DataBatch::new(ts()))
            .unwrap();
        assert!(batch.metric_sets.contains_key(CLUSTER_KEY));
    }
}
