use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::node::{Node, NodeMetrics, NodeState};

/// Shared membership store the registry mirrors to.
///
/// Production deployments back this with the metadata service; the in-memory
/// implementation serves single-process clusters and tests.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn put(&self, node: &Node) -> Result<(), StoreError>;
    async fn delete(&self, node_id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<Node>, StoreError>;
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<String, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put(&self, node: &Node) -> Result<(), StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete(&self, node_id: &str) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().remove(node_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

/// Node registry timing knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    /// Nodes silent for longer than this are marked Inactive and dropped
    /// from store syncs.
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            heartbeat_interval: secs("NOVA_REGISTRY_HEARTBEAT_INTERVAL_S", d.heartbeat_interval),
            health_check_interval: secs(
                "NOVA_REGISTRY_HEALTH_INTERVAL_S",
                d.health_check_interval,
            ),
            heartbeat_timeout: secs("NOVA_REGISTRY_HEARTBEAT_TIMEOUT_S", d.heartbeat_timeout),
        }
    }
}

/// Cluster membership: local node map mirrored to the shared store, kept
/// fresh by heartbeats and a background staleness sweep.
pub struct NodeRegistry {
    config: RegistryConfig,
    store: Arc<dyn NodeStore>,
    nodes: Arc<RwLock<HashMap<String, Node>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn NodeStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the background staleness sweep.
    pub fn start(&self) {
        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let nodes = Arc::clone(&self.nodes);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let sweep_store = Arc::clone(&store);
                let sweep_nodes = Arc::clone(&nodes);
                let timeout = config.heartbeat_timeout;
                let sweep = tokio::spawn(async move {
                    sweep_stale(&sweep_nodes, sweep_store.as_ref(), timeout).await
                });
                if let Err(e) = sweep.await {
                    error!(error = %e, "registry health tick panicked");
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Upsert a node locally and in the store, stamping its heartbeat.
    pub async fn register(&self, mut node: Node) -> Result<(), RegistryError> {
        node.last_heartbeat = SystemTime::now();
        node.state = NodeState::Active;
        info!(node_id = %node.id, address = %node.address, "registering node");
        self.nodes
            .write()
            .unwrap()
            .insert(node.id.clone(), node.clone());
        self.store
            .put(&node)
            .await
            .map_err(RegistryError::Store)?;
        Ok(())
    }

    /// Fold heartbeat metrics into the node, refresh its timestamp, persist.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        metrics: &NodeMetrics,
    ) -> Result<(), RegistryError> {
        let node = {
            let mut nodes = self.nodes.write().unwrap();
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| RegistryError::NotRegistered(node_id.to_string()))?;
            node.apply_metrics(metrics);
            if node.state == NodeState::Inactive {
                info!(node_id = %node_id, "node returned from inactive");
                node.state = NodeState::Active;
            }
            node.clone()
        };
        self.store.put(&node).await.map_err(RegistryError::Store)?;
        Ok(())
    }

    /// Reload authoritative membership from the store, dropping entries whose
    /// heartbeat is stale beyond the timeout.
    pub async fn sync_from_store(&self) -> Result<(), RegistryError> {
        let listed = self.store.list().await.map_err(RegistryError::Store)?;
        let cutoff = SystemTime::now() - self.config.heartbeat_timeout;
        let fresh: HashMap<String, Node> = listed
            .into_iter()
            .filter(|node| node.last_heartbeat >= cutoff)
            .map(|node| (node.id.clone(), node))
            .collect();

        let mut nodes = self.nodes.write().unwrap();
        let dropped = nodes.len().saturating_sub(fresh.len());
        if dropped > 0 {
            info!(dropped, "dropped stale nodes during store sync");
        }
        *nodes = fresh;
        Ok(())
    }

    /// Mark silent nodes Inactive, locally and (best effort) in the store.
    pub async fn mark_stale_nodes(&self) {
        sweep_stale(&self.nodes, self.store.as_ref(), self.config.heartbeat_timeout).await;
    }

    /// Move a node to Drained so the scheduler stops placing work on it.
    pub async fn drain(&self, node_id: &str) -> Result<(), RegistryError> {
        let node = {
            let mut nodes = self.nodes.write().unwrap();
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| RegistryError::NotRegistered(node_id.to_string()))?;
            node.state = NodeState::Drained;
            node.clone()
        };
        self.store.put(&node).await.map_err(RegistryError::Store)?;
        Ok(())
    }

    /// Remove a node entirely.
    pub async fn deregister(&self, node_id: &str) -> Result<(), RegistryError> {
        self.nodes.write().unwrap().remove(node_id);
        self.store
            .delete(node_id)
            .await
            .map_err(RegistryError::Store)?;
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Nodes eligible for placement.
    pub fn healthy_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|node| node.is_schedulable())
            .cloned()
            .collect()
    }
}

async fn sweep_stale(
    nodes: &RwLock<HashMap<String, Node>>,
    store: &dyn NodeStore,
    timeout: Duration,
) {
    let cutoff = SystemTime::now() - timeout;
    let stale: Vec<Node> = {
        let mut nodes = nodes.write().unwrap();
        nodes
            .values_mut()
            .filter(|node| node.state == NodeState::Active && node.last_heartbeat < cutoff)
            .map(|node| {
                node.state = NodeState::Inactive;
                node.clone()
            })
            .collect()
    };
    for node in stale {
        warn!(node_id = %node.id, "node heartbeat stale, marking inactive");
        if let Err(e) = store.put(&node).await {
            warn!(node_id = %node.id, error = %e, "failed to persist inactive state");
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "node store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug)]
pub enum RegistryError {
    NotRegistered(String),
    Store(StoreError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotRegistered(id) => write!(f, "node not registered: {}", id),
            RegistryError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(60),
        }
    }

    fn metrics() -> NodeMetrics {
        NodeMetrics {
            active_vms: 2,
            queue_depth: 1,
            cpu_pct: 25.0,
            mem_pct: 35.0,
            io_pressure_pct: 5.0,
        }
    }

    #[tokio::test]
    async fn register_and_heartbeat_round_trip() {
        let store = MemoryNodeStore::new();
        let registry = NodeRegistry::new(RegistryConfig::default(), store.clone());

        registry
            .register(Node::new("node_a", "10.0.0.1:7070", 16))
            .await
            .unwrap();
        registry.heartbeat("node_a", &metrics()).await.unwrap();

        let node = registry.get("node_a").unwrap();
        assert_eq!(node.active_vms, 2);
        assert_eq!(node.cpu_pct, 25.0);
        assert_eq!(node.state, NodeState::Active);

        // Mirrored to the store as well.
        let stored = store.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].active_vms, 2);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_node_fails() {
        let registry = NodeRegistry::new(RegistryConfig::default(), MemoryNodeStore::new());
        let err = registry.heartbeat("node_ghost", &metrics()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn stale_nodes_go_inactive_and_recover() {
        let registry = NodeRegistry::new(fast_config(), MemoryNodeStore::new());
        registry
            .register(Node::new("node_a", "10.0.0.1:7070", 16))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.mark_stale_nodes().await;
        assert_eq!(registry.get("node_a").unwrap().state, NodeState::Inactive);
        assert!(registry.healthy_nodes().is_empty());

        // A fresh heartbeat reactivates the node.
        registry.heartbeat("node_a", &metrics()).await.unwrap();
        assert_eq!(registry.get("node_a").unwrap().state, NodeState::Active);
        assert_eq!(registry.healthy_nodes().len(), 1);
    }

    #[tokio::test]
    async fn sync_from_store_drops_stale_entries() {
        let store = MemoryNodeStore::new();
        let registry = NodeRegistry::new(fast_config(), store.clone());

        let mut fresh = Node::new("node_fresh", "10.0.0.1:7070", 16);
        fresh.last_heartbeat = SystemTime::now();
        let mut stale = Node::new("node_stale", "10.0.0.2:7070", 16);
        stale.last_heartbeat = SystemTime::now() - Duration::from_secs(600);
        store.put(&fresh).await.unwrap();
        store.put(&stale).await.unwrap();

        registry.sync_from_store().await.unwrap();
        assert!(registry.get("node_fresh").is_some());
        assert!(registry.get("node_stale").is_none());
    }

    #[tokio::test]
    async fn drained_nodes_leave_the_healthy_set() {
        let registry = NodeRegistry::new(RegistryConfig::default(), MemoryNodeStore::new());
        registry
            .register(Node::new("node_a", "10.0.0.1:7070", 16))
            .await
            .unwrap();
        registry
            .register(Node::new("node_b", "10.0.0.2:7070", 16))
            .await
            .unwrap();

        registry.drain("node_a").await.unwrap();
        let healthy = registry.healthy_nodes();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "node_b");
    }

    #[tokio::test]
    async fn deregister_removes_everywhere() {
        let store = MemoryNodeStore::new();
        let registry = NodeRegistry::new(RegistryConfig::default(), store.clone());
        registry
            .register(Node::new("node_a", "10.0.0.1:7070", 16))
            .await
            .unwrap();

        registry.deregister("node_a").await.unwrap();
        assert!(registry.get("node_a").is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_sweep_marks_silent_nodes() {
        let registry = NodeRegistry::new(fast_config(), MemoryNodeStore::new());
        registry
            .register(Node::new("node_a", "10.0.0.1:7070", 16))
            .await
            .unwrap();
        registry.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.get("node_a").unwrap().state == NodeState::Inactive {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep should mark the silent node inactive");
        registry.stop();
    }

    #[test]
    fn config_defaults_match_contract() {
        let config = RegistryConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
    }
}
