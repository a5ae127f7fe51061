//! Kubelet summary source
//!
//! Scrapes one node's kubelet `/stats/summary` endpoint and decodes the
//! summary document into metric sets for the node, its system containers,
//! and every pod and pod container running on it.
//!
//! Decoding rules:
//! - system container names are canonicalised (`runtime` becomes
//!   `docker-daemon`, `misc` becomes `system`); other names pass through
//! - per-filesystem statistics become labeled metrics with
//!   `resource_id` `"/"` (rootfs), `"logs"`, or `"Volume:<name>"`
//! - a container's identity is `(name, startTime)`; duplicate names keep
//!   the entry with the greatest start time (terminated instances are
//!   discarded)
//! - absent (`null`) fields mean "metric absent" and are skipped silently

use super::{MetricsSource, NodeInfo};
use crate::kubernetes::KubernetesConfig;
use crate::model::{
    node_container_key, node_key, pod_container_key, pod_key, DataBatch, LabeledMetric,
    MetricSet, MetricSetType, MetricValue, LABEL_CONTAINER_NAME, LABEL_HOSTNAME, LABEL_HOST_ID,
    LABEL_NAMESPACE_NAME, LABEL_NODENAME, LABEL_POD_ID, LABEL_POD_NAME, LABEL_RESOURCE_ID,
    METRIC_CPU_USAGE, METRIC_FILESYSTEM_AVAILABLE, METRIC_FILESYSTEM_LIMIT,
    METRIC_FILESYSTEM_USAGE, METRIC_MEMORY_MAJOR_PAGE_FAULTS, METRIC_MEMORY_PAGE_FAULTS,
    METRIC_MEMORY_RSS, METRIC_MEMORY_USAGE, METRIC_MEMORY_WORKING_SET, METRIC_NETWORK_RX,
    METRIC_NETWORK_RX_ERRORS, METRIC_NETWORK_TX, METRIC_NETWORK_TX_ERRORS, METRIC_UPTIME,
};
use crate::observability::PipelineMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Resource id of a container's writable layer.
const RESOURCE_ID_ROOTFS: &str = "/";
/// Resource id of a container's log filesystem.
const RESOURCE_ID_LOGS: &str = "logs";

// Kubelet summary document, as served by `/stats/summary`.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub node: NodeStats,
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
    pub network: Option<NetworkStats>,
    pub fs: Option<FsStats>,
    #[serde(default)]
    pub system_containers: Vec<ContainerStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    pub start_time: Option<DateTime<Utc>>,
    pub network: Option<NetworkStats>,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
    #[serde(rename = "volume", default)]
    pub volume_stats: Vec<VolumeStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
    pub rootfs: Option<FsStats>,
    pub logs: Option<FsStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub time: Option<DateTime<Utc>>,
    pub usage_nano_cores: Option<u64>,
    pub usage_core_nano_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub time: Option<DateTime<Utc>>,
    pub available_bytes: Option<u64>,
    pub usage_bytes: Option<u64>,
    pub working_set_bytes: Option<u64>,
    pub rss_bytes: Option<u64>,
    pub page_faults: Option<u64>,
    pub major_page_faults: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub time: Option<DateTime<Utc>>,
    pub rx_bytes: Option<u64>,
    pub rx_errors: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub tx_errors: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsStats {
    pub available_bytes: Option<u64>,
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub inodes_free: Option<u64>,
    pub inodes: Option<u64>,
    pub inodes_used: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub name: String,
    #[serde(flatten)]
    pub fs: FsStats,
}

/// HTTP client for kubelet stats endpoints, shared by all summary
/// sources.
pub struct KubeletClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl KubeletClient {
    pub fn new(insecure: bool, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build kubelet HTTP client")?;
        Ok(Self { client, token })
    }

    /// Build a client for the given source configuration, picking up the
    /// service-account token for authenticated kubelet ports.
    pub fn from_config(cfg: &KubernetesConfig) -> Result<Self> {
        let token = if cfg.kubelet_https {
            std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
                .ok()
                .map(|t| t.trim().to_string())
        } else {
            None
        };
        Self::new(cfg.insecure, token)
    }

    pub async fn summary(&self, node: &NodeInfo) -> Result<Summary> {
        let scheme = if node.https { "https" } else { "http" };
        let url = format!("{scheme}://{}:{}/stats/summary", node.ip, node.port);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("kubelet at {url} returned an error status"))?;

        response
            .json()
            .await
            .with_context(|| format!("failed to decode summary from {url}"))
    }
}

/// Scrapes and decodes one node's kubelet summary.
pub struct SummaryMetricsSource {
    node: NodeInfo,
    client: Arc<KubeletClient>,
    metrics: PipelineMetrics,
}

impl SummaryMetricsSource {
    pub fn new(node: NodeInfo, client: Arc<KubeletClient>) -> Self {
        Self {
            node,
            client,
            metrics: PipelineMetrics::new(),
        }
    }

    fn decode_summary(&self, summary: &Summary, end: DateTime<Utc>) -> HashMap<String, MetricSet> {
        let mut sets = HashMap::new();
        self.decode_node_stats(&mut sets, &summary.node, end);
        for pod in &summary.pods {
            self.decode_pod_stats(&mut sets, pod, end);
        }
        sets
    }

    fn decode_node_stats(
        &self,
        sets: &mut HashMap<String, MetricSet>,
        node: &NodeStats,
        end: DateTime<Utc>,
    ) {
        let mut set = MetricSet::new(MetricSetType::Node);
        self.apply_node_labels(&mut set);
        set.create_time = node.start_time.unwrap_or(DateTime::UNIX_EPOCH);
        set.scrape_time = sample_time(node.cpu.as_ref(), end);

        decode_uptime(&mut set, node.start_time);
        decode_cpu_stats(&mut set, node.cpu.as_ref());
        decode_memory_stats(&mut set, node.memory.as_ref());
        decode_network_stats(&mut set, node.network.as_ref());
        decode_fs_stats(&mut set, RESOURCE_ID_ROOTFS, node.fs.as_ref());

        sets.insert(node_key(&self.node.name), set);

        for container in latest_containers(&node.system_containers) {
            let name = canonical_system_container(&container.name);
            let mut set = MetricSet::new(MetricSetType::SystemContainer);
            self.apply_node_labels(&mut set);
            set.set_label(LABEL_CONTAINER_NAME, name.clone());
            set.create_time = container.start_time.unwrap_or(DateTime::UNIX_EPOCH);
            set.scrape_time = sample_time(container.cpu.as_ref(), end);

            decode_uptime(&mut set, container.start_time);
            decode_cpu_stats(&mut set, container.cpu.as_ref());
            decode_memory_stats(&mut set, container.memory.as_ref());

            sets.insert(node_container_key(&self.node.name, &name), set);
        }
    }

    fn decode_pod_stats(
        &self,
        sets: &mut HashMap<String, MetricSet>,
        pod: &PodStats,
        end: DateTime<Utc>,
    ) {
        let namespace = &pod.pod_ref.namespace;
        let pod_name = &pod.pod_ref.name;

        let mut set = MetricSet::new(MetricSetType::Pod);
        self.apply_node_labels(&mut set);
        set.set_label(LABEL_NAMESPACE_NAME, namespace.clone());
        set.set_label(LABEL_POD_NAME, pod_name.clone());
        if !pod.pod_ref.uid.is_empty() {
            set.set_label(LABEL_POD_ID, pod.pod_ref.uid.clone());
        }
        set.create_time = pod.start_time.unwrap_or(DateTime::UNIX_EPOCH);
        set.scrape_time = pod
            .network
            .as_ref()
            .and_then(|n| n.time)
            .unwrap_or(end);

        decode_uptime(&mut set, pod.start_time);
        decode_network_stats(&mut set, pod.network.as_ref());
        for volume in &pod.volume_stats {
            let resource_id = format!("Volume:{}", volume.name);
            decode_fs_stats(&mut set, &resource_id, Some(&volume.fs));
        }

        sets.insert(pod_key(namespace, pod_name), set);

        for container in latest_containers(&pod.containers) {
            let mut set = MetricSet::new(MetricSetType::PodContainer);
            self.apply_node_labels(&mut set);
            set.set_label(LABEL_NAMESPACE_NAME, namespace.clone());
            set.set_label(LABEL_POD_NAME, pod_name.clone());
            set.set_label(LABEL_CONTAINER_NAME, container.name.clone());
            set.create_time = container.start_time.unwrap_or(DateTime::UNIX_EPOCH);
            set.scrape_time = sample_time(container.cpu.as_ref(), end);

            decode_uptime(&mut set, container.start_time);
            decode_cpu_stats(&mut set, container.cpu.as_ref());
            decode_memory_stats(&mut set, container.memory.as_ref());
            decode_fs_stats(&mut set, RESOURCE_ID_ROOTFS, container.rootfs.as_ref());
            decode_fs_stats(&mut set, RESOURCE_ID_LOGS, container.logs.as_ref());

            sets.insert(
                pod_container_key(namespace, pod_name, &container.name),
                set,
            );
        }
    }

    fn apply_node_labels(&self, set: &mut MetricSet) {
        set.set_label(LABEL_NODENAME, self.node.name.clone());
        set.set_label(LABEL_HOSTNAME, self.node.hostname.clone());
        set.set_label(LABEL_HOST_ID, self.node.host_id.clone());
    }
}

#[async_trait]
impl MetricsSource for SummaryMetricsSource {
    fn name(&self) -> String {
        format!("kubelet_summary:{}:{}", self.node.ip, self.node.port)
    }

    async fn scrape_metrics(&self, _start: DateTime<Utc>, end: DateTime<Utc>) -> DataBatch {
        let mut batch = DataBatch::new(end);
        match self.client.summary(&self.node).await {
            Ok(summary) => {
                batch.metric_sets = self.decode_summary(&summary, end);
            }
            Err(e) => {
                self.metrics.inc_scrape_errors();
                warn!(node = %self.node.name, error = %e, "Failed to scrape kubelet summary");
            }
        }
        batch
    }
}

/// Canonical names for the kubelet's well-known system containers.
fn canonical_system_container(name: &str) -> String {
    match name {
        "kubelet" => "kubelet".to_string(),
        "runtime" => "docker-daemon".to_string(),
        "misc" => "system".to_string(),
        other => other.to_string(),
    }
}

/// Deduplicate containers by name, keeping the entry with the greatest
/// start time. The kubelet reports terminated instances alongside their
/// live replacement under the same name.
fn latest_containers(containers: &[ContainerStats]) -> Vec<&ContainerStats> {
    let mut by_name: HashMap<&str, &ContainerStats> = HashMap::new();
    for container in containers {
        match by_name.get(container.name.as_str()) {
            Some(existing) if container_start(existing) >= container_start(container) => {}
            _ => {
                by_name.insert(container.name.as_str(), container);
            }
        }
    }
    by_name.into_values().collect()
}

fn container_start(container: &ContainerStats) -> DateTime<Utc> {
    container.start_time.unwrap_or(DateTime::UNIX_EPOCH)
}

fn sample_time(cpu: Option<&CpuStats>, end: DateTime<Utc>) -> DateTime<Utc> {
    cpu.and_then(|c| c.time).unwrap_or(end)
}

fn decode_uptime(set: &mut MetricSet, start: Option<DateTime<Utc>>) {
    if let Some(start) = start {
        let uptime = (set.scrape_time - start).num_milliseconds();
        if uptime >= 0 {
            set.add_value(&METRIC_UPTIME, MetricValue::Int(uptime));
        }
    }
}

fn decode_cpu_stats(set: &mut MetricSet, cpu: Option<&CpuStats>) {
    let Some(cpu) = cpu else { return };
    if let Some(usage) = cpu.usage_core_nano_seconds {
        set.add_value(&METRIC_CPU_USAGE, MetricValue::Int(usage as i64));
    }
}

fn decode_memory_stats(set: &mut MetricSet, memory: Option<&MemoryStats>) {
    let Some(memory) = memory else { return };
    let values = [
        (&METRIC_MEMORY_USAGE, memory.usage_bytes),
        (&METRIC_MEMORY_WORKING_SET, memory.working_set_bytes),
        (&METRIC_MEMORY_RSS, memory.rss_bytes),
        (&METRIC_MEMORY_PAGE_FAULTS, memory.page_faults),
        (&METRIC_MEMORY_MAJOR_PAGE_FAULTS, memory.major_page_faults),
    ];
    for (metric, value) in values {
        if let Some(value) = value {
            set.add_value(metric, MetricValue::Int(value as i64));
        }
    }
}

fn decode_network_stats(set: &mut MetricSet, network: Option<&NetworkStats>) {
    let Some(network) = network else { return };
    let values = [
        (&METRIC_NETWORK_RX, network.rx_bytes),
        (&METRIC_NETWORK_RX_ERRORS, network.rx_errors),
        (&METRIC_NETWORK_TX, network.tx_bytes),
        (&METRIC_NETWORK_TX_ERRORS, network.tx_errors),
    ];
    for (metric, value) in values {
        if let Some(value) = value {
            set.add_value(metric, MetricValue::Int(value as i64));
        }
    }
}

fn decode_fs_stats(set: &mut MetricSet, resource_id: &str, fs: Option<&FsStats>) {
    let Some(fs) = fs else { return };
    let values = [
        (&METRIC_FILESYSTEM_USAGE, fs.used_bytes),
        (&METRIC_FILESYSTEM_LIMIT, fs.capacity_bytes),
        (&METRIC_FILESYSTEM_AVAILABLE, fs.available_bytes),
    ];
    for (metric, value) in values {
        if let Some(value) = value {
            let mut labels = HashMap::new();
            labels.insert(LABEL_RESOURCE_ID.to_string(), resource_id.to_string());
            set.labeled_metrics.push(LabeledMetric {
                name: metric.name.to_string(),
                labels,
                value: MetricValue::Int(value as i64),
            });
        }
    }
}
