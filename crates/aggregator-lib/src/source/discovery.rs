//! Node discovery
//!
//! Maintains a registry of live nodes from the orchestrator and produces
//! one kubelet summary source per node each tick. The registry is fed by
//! a background relist task and read by the tick worker.

use super::summary::{KubeletClient, SummaryMetricsSource};
use super::{MetricsSource, MetricsSourceProvider, NodeInfo};
use crate::kubernetes::{KubernetesConfig, NodeLister};
use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the node registry is resynced with a full relist from the
/// orchestrator. Between resyncs the tick worker reads the registry
/// snapshot as-is.
pub const NODE_DISCOVERY_RESYNC: Duration = Duration::from_secs(3600);

/// Registry of nodes currently known to the cluster.
pub struct NodeRegistry {
    nodes: DashMap<String, NodeInfo>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    pub fn upsert(&self, node: NodeInfo) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn remove(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.remove(name).map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Produces one summary source per known node.
pub struct SummarySourceProvider {
    registry: Arc<NodeRegistry>,
    kubelet: Arc<KubeletClient>,
}

impl SummarySourceProvider {
    pub fn new(registry: Arc<NodeRegistry>, kubelet: Arc<KubeletClient>) -> Self {
        Self { registry, kubelet }
    }
}

impl MetricsSourceProvider for SummarySourceProvider {
    fn sources(&self) -> Vec<Arc<dyn MetricsSource>> {
        self.registry
            .list()
            .into_iter()
            .map(|node| {
                Arc::new(SummaryMetricsSource::new(node, self.kubelet.clone()))
                    as Arc<dyn MetricsSource>
            })
            .collect()
    }
}

/// Build the summary source provider for a parsed `kubernetes:` source
/// URI and start its discovery task. Performs one initial relist so the
/// first tick has sources.
pub async fn start_summary_provider(
    client: kube::Client,
    cfg: &KubernetesConfig,
    shutdown: CancellationToken,
) -> Result<Arc<SummarySourceProvider>> {
    let registry = Arc::new(NodeRegistry::new());
    let kubelet = Arc::new(KubeletClient::from_config(cfg)?);
    let lister = NodeLister::new(client);

    let kubelet_port = cfg.kubelet_port;
    let kubelet_https = cfg.kubelet_https;

    if let Err(e) = refresh_nodes(&lister, &registry, kubelet_port, kubelet_https).await {
        warn!(error = %e, "Initial node discovery failed; will retry");
    } else {
        info!(nodes = registry.len(), "Discovered cluster nodes");
    }

    let task_registry = registry.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(NODE_DISCOVERY_RESYNC) => {}
            }
            if let Err(e) =
                refresh_nodes(&lister, &task_registry, kubelet_port, kubelet_https).await
            {
                warn!(error = %e, "Node discovery relist failed");
            }
        }
    });

    Ok(Arc::new(SummarySourceProvider::new(registry, kubelet)))
}

async fn refresh_nodes(
    lister: &NodeLister,
    registry: &NodeRegistry,
    kubelet_port: u16,
    kubelet_https: bool,
) -> Result<()> {
    let listed = lister.list().await?;

    let mut seen = HashSet::with_capacity(listed.len());
    for node in listed {
        let Some(ip) = node.internal_ip else {
            warn!(node = %node.name, "Node has no internal address; skipping");
            continue;
        };
        seen.insert(node.name.clone());
        registry.upsert(NodeInfo {
            hostname: node.hostname.unwrap_or_else(|| node.name.clone()),
            host_id: node.machine_id.unwrap_or_default(),
            name: node.name,
            ip,
            port: kubelet_port,
            https: kubelet_https,
        });
    }

    for node in registry.list() {
        if !seen.contains(&node.name) {
            debug!(node = %node.name, "Node no longer listed; dropping source");
            registry.remove(&node.name);
        }
    }

    Ok(())
}
