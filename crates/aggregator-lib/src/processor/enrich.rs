//! Identity enrichment
//!
//! Attaches orchestration-level identity (pod UID, pod labels, owner,
//! namespace UID) to the raw sets scraped from kubelets, using the
//! snapshot caches fed by the orchestrator relist tasks.

use super::DataProcessor;
use crate::kubernetes::{NamespaceCache, PodCache};
use crate::model::{
    DataBatch, MetricSetType, LABEL_LABELS, LABEL_NAMESPACE_ID, LABEL_NAMESPACE_NAME,
    LABEL_NODENAME, LABEL_OWNER, LABEL_POD_ID, LABEL_POD_NAME,
};
use crate::observability::PipelineMetrics;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Flatten pod labels into the single `labels` label value.
fn flatten_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct PodEnricher {
    cache: Arc<PodCache>,
    metrics: PipelineMetrics,
}

impl PodEnricher {
    pub fn new(cache: Arc<PodCache>) -> Self {
        Self {
            cache,
            metrics: PipelineMetrics::new(),
        }
    }
}

impl DataProcessor for PodEnricher {
    fn name(&self) -> &'static str {
        "pod_enricher"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let mut drops = Vec::new();

        for (key, set) in batch.metric_sets.iter_mut() {
            if !matches!(
                set.set_type(),
                Some(MetricSetType::Pod) | Some(MetricSetType::PodContainer)
            ) {
                continue;
            }

            let namespace = set.label(LABEL_NAMESPACE_NAME).map(str::to_string);
            let pod_name = set.label(LABEL_POD_NAME).map(str::to_string);
            let (Some(namespace), Some(pod_name)) = (namespace, pod_name) else {
                error!(key = %key, "Pod metric set lacks identity labels; dropping");
                drops.push(key.clone());
                continue;
            };

            match self.cache.get(&namespace, &pod_name) {
                Some(pod) => {
                    set.set_label(LABEL_POD_ID, pod.uid.clone());
                    if !pod.labels.is_empty() {
                        set.set_label(LABEL_LABELS, flatten_labels(&pod.labels));
                    }
                    if let Some(owner) = &pod.owner {
                        set.set_label(LABEL_OWNER, owner.clone());
                    }
                    if set.label(LABEL_NODENAME).is_none() {
                        if let Some(node) = &pod.node_name {
                            set.set_label(LABEL_NODENAME, node.clone());
                        }
                    }
                }
                None => {
                    // Unknown to the orchestrator (yet); keep the raw set
                    // but tag it as unresolved.
                    set.set_label(LABEL_NAMESPACE_ID, "");
                }
            }
        }

        for key in drops {
            self.metrics.inc_invariant_breaches();
            batch.metric_sets.remove(&key);
        }
        Ok(batch)
    }
}

pub struct NamespaceEnricher {
    cache: Arc<NamespaceCache>,
}

impl NamespaceEnricher {
    pub fn new(cache: Arc<NamespaceCache>) -> Self {
        Self { cache }
    }
}

impl DataProcessor for NamespaceEnricher {
    fn name(&self) -> &'static str {
        "namespace_enricher"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        for set in batch.metric_sets.values_mut() {
            let Some(namespace) = set.label(LABEL_NAMESPACE_NAME).map(str::to_string) else {
                continue;
            };
            if let Some(info) = self.cache.get(&namespace) {
                set.set_label(LABEL_NAMESPACE_ID, info.uid.clone());
            } else if set.label(LABEL_NAMESPACE_ID).is_none() {
                set.set_label(LABEL_NAMESPACE_ID, "");
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{NamespaceInfo, PodInfo};
    use crate::model::{pod_container_key, pod_key, MetricSet};
    use chrono::Utc;
    use std::collections::HashMap;

    fn batch_with_pod(namespace: &str, pod: &str) -> DataBatch {
        let mut batch = DataBatch::new(Utc::now());
        let mut set = MetricSet::new(MetricSetType::Pod);
        set.set_label(LABEL_NAMESPACE_NAME, namespace);
        set.set_label(LABEL_POD_NAME, pod);
        batch.metric_sets.insert(pod_key(namespace, pod), set);

        let mut container = MetricSet::new(MetricSetType::PodContainer);
        container.set_label(LABEL_NAMESPACE_NAME, namespace);
        container.set_label(LABEL_POD_NAME, pod);
        batch
            .metric_sets
            .insert(pod_container_key(namespace, pod, "c1"), container);
        batch
    }

    fn populated_pod_cache() -> Arc<PodCache> {
        let cache = Arc::new(PodCache::new());
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());
        let mut pods = HashMap::new();
        pods.insert(
            ("ns1".to_string(), "p1".to_string()),
            PodInfo {
                uid: "pod-uid-1".to_string(),
                namespace: "ns1".to_string(),
                name: "p1".to_string(),
                node_name: Some("n1".to_string()),
                labels,
                owner: Some("ReplicaSet/web-abc".to_string()),
            },
        );
        cache.replace(pods);
        cache
    }

    #[test]
    fn test_pod_enricher_attaches_identity() {
        let mut enricher = PodEnricher::new(populated_pod_cache());
        let batch = enricher.process(batch_with_pod("ns1", "p1")).unwrap();

        for key in [pod_key("ns1", "p1"), pod_container_key("ns1", "p1", "c1")] {
            let set = &batch.metric_sets[&key];
            assert_eq!(set.label(LABEL_POD_ID), Some("pod-uid-1"), "{key}");
            assert_eq!(set.label(LABEL_LABELS), Some("app:web,tier:frontend"), "{key}");
            assert_eq!(set.label(LABEL_OWNER), Some("ReplicaSet/web-abc"), "{key}");
            assert_eq!(set.label(LABEL_NODENAME), Some("n1"), "{key}");
        }
    }

    #[test]
    fn test_pod_enricher_tags_unknown_pods() {
        let mut enricher = PodEnricher::new(Arc::new(PodCache::new()));
        let batch = enricher.process(batch_with_pod("ns1", "p1")).unwrap();

        let set = &batch.metric_sets[&pod_key("ns1", "p1")];
        assert_eq!(set.label(LABEL_NAMESPACE_ID), Some(""));
        assert!(set.label(LABEL_POD_ID).is_none());
    }

    #[test]
    fn test_pod_enricher_drops_sets_without_identity_labels() {
        let mut batch = DataBatch::new(Utc::now());
        batch
            .metric_sets
            .insert(pod_key("ns1", "p1"), MetricSet::new(MetricSetType::Pod));

        let mut enricher = PodEnricher::new(Arc::new(PodCache::new()));
        let batch = enricher.process(batch).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_namespace_enricher() {
        let cache = Arc::new(NamespaceCache::new());
        let mut namespaces = HashMap::new();
        namespaces.insert(
            "ns1".to_string(),
            NamespaceInfo {
                name: "ns1".to_string(),
                uid: "ns-uid-1".to_string(),
            },
        );
        cache.replace(namespaces);

        let mut enricher = NamespaceEnricher::new(cache);
        let batch = enricher.process(batch_with_pod("ns1", "p1")).unwrap();

        let set = &batch.metric_sets[&pod_key("ns1", "p1")];
        assert_eq!(set.label(LABEL_NAMESPACE_ID), Some("ns-uid-1"));
    }

    #[test]
    fn test_namespace_enricher_tags_unknown_namespaces() {
        let mut enricher = NamespaceEnricher::new(Arc::new(NamespaceCache::new()));
        let batch = enricher.process(batch_with_pod("ns9", "p1")).unwrap();

        let set = &batch.metric_sets[&pod_key("ns9", "p1")];
        assert_eq!(set.label(LABEL_NAMESPACE_ID), Some(""));
    }
}
