//! Kubernetes API plumbing
//!
//! Source-URI parsing, client construction (in-cluster or explicit
//! master), the node lister used by discovery, and the pod/namespace
//! snapshot caches consumed by the enrichment processors.
//!
//! The orchestrator watch is modelled as a periodic full relist: a
//! background task lists the resource and atomically swaps a fresh
//! immutable snapshot in, so readers always see a consistent map and a
//! relist doubles as the resync.

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::{
    api::{Api, ListParams},
    Client, Config,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often the pod and namespace caches are relisted.
pub const DEFAULT_CACHE_REFRESH: Duration = Duration::from_secs(60);

const DEFAULT_KUBELET_PORT: u16 = 10255;
const DEFAULT_KUBELET_HTTPS_PORT: u16 = 10250;

/// Parsed `kubernetes:<host>[?opts]` source URI.
#[derive(Debug, Clone, PartialEq)]
pub struct KubernetesConfig {
    /// Explicit API server address; `None` means in-cluster or kubeconfig
    /// defaults.
    pub master: Option<String>,
    pub in_cluster: bool,
    pub kubelet_port: u16,
    pub kubelet_https: bool,
    /// Skip TLS verification for the API server and kubelets.
    pub insecure: bool,
    /// Path to an explicit kubeconfig.
    pub auth: Option<PathBuf>,
}

impl KubernetesConfig {
    /// Parse a source URI of the form `kubernetes:<host>[?opts]` or
    /// `kubernetes.summary_api:<host>[?opts]`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = match uri.split_once(':') {
            Some((scheme, rest)) => (scheme, rest),
            None => (uri, ""),
        };
        if scheme != "kubernetes" && scheme != "kubernetes.summary_api" {
            bail!("unsupported source scheme {scheme:?} in {uri:?}");
        }

        let (host, query) = match rest.split_once('?') {
            Some((host, query)) => (host, query),
            None => (rest, ""),
        };

        let mut in_cluster = host.is_empty();
        let mut kubelet_https = false;
        let mut kubelet_port: Option<u16> = None;
        let mut insecure = false;
        let mut auth = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "inClusterConfig" => {
                    in_cluster = value
                        .parse()
                        .with_context(|| format!("invalid inClusterConfig value {value:?}"))?
                }
                "kubeletHttps" => {
                    kubelet_https = value
                        .parse()
                        .with_context(|| format!("invalid kubeletHttps value {value:?}"))?
                }
                "kubeletPort" => {
                    kubelet_port = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid kubeletPort value {value:?}"))?,
                    )
                }
                "insecure" => {
                    insecure = value
                        .parse()
                        .with_context(|| format!("invalid insecure value {value:?}"))?
                }
                "auth" => auth = Some(PathBuf::from(value.as_ref())),
                other => bail!("unknown source option {other:?} in {uri:?}"),
            }
        }

        let kubelet_port = kubelet_port.unwrap_or(if kubelet_https {
            DEFAULT_KUBELET_HTTPS_PORT
        } else {
            DEFAULT_KUBELET_PORT
        });

        Ok(Self {
            master: if host.is_empty() {
                None
            } else {
                Some(host.to_string())
            },
            in_cluster,
            kubelet_port,
            kubelet_https,
            insecure,
            auth,
        })
    }
}

/// In-cluster API server address from the standard service environment,
/// if present.
pub fn in_cluster_master() -> Option<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
    Some(format!("https://{host}:{port}"))
}

/// Build a kube client for the given configuration. An explicit
/// kubeconfig (`auth` option) wins, then an explicit master; otherwise
/// in-cluster config or the local kubeconfig applies.
pub async fn make_client(cfg: &KubernetesConfig) -> Result<Client> {
    if let Some(auth) = &cfg.auth {
        let kubeconfig = kube::config::Kubeconfig::read_from(auth)
            .with_context(|| format!("failed to read kubeconfig {auth:?}"))?;
        let options = kube::config::KubeConfigOptions::default();
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .context("invalid kubeconfig")?;
        config.accept_invalid_certs = config.accept_invalid_certs || cfg.insecure;
        return Client::try_from(config).context("failed to build Kubernetes client");
    }
    if let Some(master) = &cfg.master {
        let uri: http::Uri = master
            .parse()
            .with_context(|| format!("invalid API server address {master:?}"))?;
        let mut config = Config::new(uri);
        config.accept_invalid_certs = cfg.insecure;
        Client::try_from(config).context("failed to build Kubernetes client")
    } else if cfg.in_cluster {
        if let Some(master) = in_cluster_master() {
            debug!(master = %master, "Using in-cluster API server");
        }
        let mut config = Config::incluster().context("in-cluster configuration unavailable")?;
        config.accept_invalid_certs = config.accept_invalid_certs || cfg.insecure;
        Client::try_from(config).context("failed to build Kubernetes client")
    } else {
        let options = kube::config::KubeConfigOptions::default();
        let mut config = Config::from_kubeconfig(&options)
            .await
            .context("failed to load the local kubeconfig")?;
        config.accept_invalid_certs = config.accept_invalid_certs || cfg.insecure;
        Client::try_from(config).context("failed to build Kubernetes client")
    }
}

/// Node identity as listed from the API server.
#[derive(Debug, Clone)]
pub struct ListedNode {
    pub name: String,
    pub internal_ip: Option<String>,
    pub hostname: Option<String>,
    pub machine_id: Option<String>,
}

/// Lists cluster nodes for source discovery.
pub struct NodeLister {
    api: Api<Node>,
}

impl NodeLister {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    pub async fn list(&self) -> Result<Vec<ListedNode>> {
        let nodes = self
            .api
            .list(&ListParams::default())
            .await
            .context("failed to list nodes")?;

        let mut listed = Vec::with_capacity(nodes.items.len());
        for node in nodes.items {
            let Some(name) = node.metadata.name else {
                continue;
            };
            let status = node.status.unwrap_or_default();
            let mut internal_ip = None;
            let mut hostname = None;
            for addr in status.addresses.unwrap_or_default() {
                match addr.type_.as_str() {
                    "InternalIP" => internal_ip = Some(addr.address),
                    "Hostname" => hostname = Some(addr.address),
                    _ => {}
                }
            }
            let machine_id = status.node_info.map(|info| info.machine_id);
            listed.push(ListedNode {
                name,
                internal_ip,
                hostname,
                machine_id,
            });
        }
        Ok(listed)
    }
}

/// Pod identity used for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// First owner reference as `Kind/name`.
    pub owner: Option<String>,
}

type PodMap = HashMap<(String, String), PodInfo>;

/// Snapshot cache of pods keyed by (namespace, name). Readers get a
/// consistent snapshot; the refresher swaps in a whole new map.
#[derive(Default)]
pub struct PodCache {
    snapshot: RwLock<Arc<PodMap>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<PodInfo> {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner());
        snapshot
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replace the whole snapshot.
    pub fn replace(&self, pods: PodMap) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *snapshot = Arc::new(pods);
    }
}

/// Namespace identity used for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceInfo {
    pub name: String,
    pub uid: String,
}

type NamespaceMap = HashMap<String, NamespaceInfo>;

/// Snapshot cache of namespaces keyed by name.
#[derive(Default)]
pub struct NamespaceCache {
    snapshot: RwLock<Arc<NamespaceMap>>,
}

impl NamespaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<NamespaceInfo> {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner());
        snapshot.get(name).cloned()
    }

    pub fn replace(&self, namespaces: NamespaceMap) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *snapshot = Arc::new(namespaces);
    }
}

/// Periodically relist pods into the cache until shutdown.
pub async fn run_pod_cache_refresher(
    client: Client,
    cache: Arc<PodCache>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let api: Api<Pod> = Api::all(client);
    loop {
        match api.list(&ListParams::default()).await {
            Ok(list) => {
                let mut pods: PodMap = HashMap::with_capacity(list.items.len());
                for pod in list.items {
                    let (Some(name), Some(namespace)) =
                        (pod.metadata.name, pod.metadata.namespace)
                    else {
                        continue;
                    };
                    let owner = pod
                        .metadata
                        .owner_references
                        .as_ref()
                        .and_then(|refs| refs.first())
                        .map(|r| format!("{}/{}", r.kind, r.name));
                    let info = PodInfo {
                        uid: pod.metadata.uid.unwrap_or_default(),
                        namespace: namespace.clone(),
                        name: name.clone(),
                        node_name: pod.spec.and_then(|spec| spec.node_name),
                        labels: pod.metadata.labels.unwrap_or_default(),
                        owner,
                    };
                    pods.insert((namespace, name), info);
                }
                debug!(count = pods.len(), "Refreshed pod cache");
                cache.replace(pods);
            }
            Err(e) => warn!(error = %e, "Failed to list pods for enrichment cache"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Periodically relist namespaces into the cache until shutdown.
pub async fn run_namespace_cache_refresher(
    client: Client,
    cache: Arc<NamespaceCache>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client);
    loop {
        match api.list(&ListParams::default()).await {
            Ok(list) => {
                let mut namespaces: NamespaceMap = HashMap::with_capacity(list.items.len());
                for ns in list.items {
                    let Some(name) = ns.metadata.name else {
                        continue;
                    };
                    namespaces.insert(
                        name.clone(),
                        NamespaceInfo {
                            name,
                            uid: ns.metadata.uid.unwrap_or_default(),
                        },
                    );
                }
                debug!(count = namespaces.len(), "Refreshed namespace cache");
                cache.replace(namespaces);
            }
            Err(e) => warn!(error = %e, "Failed to list namespaces for enrichment cache"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri_defaults() {
        let cfg = KubernetesConfig::from_uri("kubernetes:").unwrap();
        assert!(cfg.master.is_none());
        assert!(cfg.in_cluster);
        assert_eq!(cfg.kubelet_port, DEFAULT_KUBELET_PORT);
        assert!(!cfg.kubelet_https);
        assert!(!cfg.insecure);
    }

    #[test]
    fn test_from_uri_with_master_and_options() {
        let cfg = KubernetesConfig::from_uri(
            "kubernetes.summary_api:https://10.0.0.1:443?inClusterConfig=false&kubeletHttps=true&insecure=true",
        )
        .unwrap();
        assert_eq!(cfg.master.as_deref(), Some("https://10.0.0.1:443"));
        assert!(!cfg.in_cluster);
        assert!(cfg.kubelet_https);
        assert_eq!(cfg.kubelet_port, DEFAULT_KUBELET_HTTPS_PORT);
        assert!(cfg.insecure);
    }

    #[test]
    fn test_from_uri_explicit_kubelet_port() {
        let cfg = KubernetesConfig::from_uri("kubernetes:?kubeletPort=10266").unwrap();
        assert_eq!(cfg.kubelet_port, 10266);
    }

    #[test]
    fn test_from_uri_rejects_unknown_scheme() {
        assert!(KubernetesConfig::from_uri("cadvisor:host").is_err());
    }

    #[test]
    fn test_from_uri_rejects_unknown_option() {
        assert!(KubernetesConfig::from_uri("kubernetes:?bogus=1").is_err());
    }

    #[test]
    fn test_pod_cache_snapshot_swap() {
        let cache = PodCache::new();
        assert!(cache.get("ns1", "p1").is_none());

        let mut pods = HashMap::new();
        pods.insert(
            ("ns1".to_string(), "p1".to_string()),
            PodInfo {
                uid: "uid-1".to_string(),
                namespace: "ns1".to_string(),
                name: "p1".to_string(),
                node_name: Some("n1".to_string()),
                labels: BTreeMap::new(),
                owner: None,
            },
        );
        cache.replace(pods);

        let info = cache.get("ns1", "p1").unwrap();
        assert_eq!(info.uid, "uid-1");

        // A full resync replaces the snapshot losslessly.
        cache.replace(HashMap::new());
        assert!(cache.get("ns1", "p1").is_none());
    }

    #[test]
    fn test_namespace_cache() {
        let cache = NamespaceCache::new();
        let mut namespaces = HashMap::new();
        namespaces.insert(
            "ns1".to_string(),
            NamespaceInfo {
                name: "ns1".to_string(),
                uid: "ns-uid".to_string(),
            },
        );
        cache.replace(namespaces);
        assert_eq!(cache.get("ns1").unwrap().uid, "ns-uid");
        assert!(cache.get("ns2").is_none());
    }
}
