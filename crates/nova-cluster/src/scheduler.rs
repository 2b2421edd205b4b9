use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::node::Node;

/// How long a function sticks to the node that last served it.
const DEFAULT_AFFINITY_TTL: Duration = Duration::from_secs(300);

/// Node selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    /// Minimize weighted cpu/memory/io pressure.
    ResourceAware,
    /// Composite score plus warm-label bonus and a short-lived
    /// function-to-node affinity cache.
    LocalityAware,
}

struct AffinityEntry {
    node_id: String,
    expires: Instant,
}

/// Picks a node for a function from the healthy-node list.
pub struct ClusterScheduler {
    strategy: PlacementStrategy,
    affinity_ttl: Duration,
    rr_counter: AtomicUsize,
    affinity: Mutex<HashMap<String, AffinityEntry>>,
}

impl ClusterScheduler {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self::with_affinity_ttl(strategy, DEFAULT_AFFINITY_TTL)
    }

    pub fn with_affinity_ttl(strategy: PlacementStrategy, affinity_ttl: Duration) -> Self {
        Self {
            strategy,
            affinity_ttl,
            rr_counter: AtomicUsize::new(0),
            affinity: Mutex::new(HashMap::new()),
        }
    }

    /// Select one schedulable node for the function, or `None` when the
    /// cluster has no capacity.
    pub fn select_node(&self, nodes: &[Node], function_id: &str) -> Option<Node> {
        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|node| node.is_schedulable() && node.has_spare_capacity())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            PlacementStrategy::RoundRobin => {
                let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].clone())
            }
            PlacementStrategy::LeastLoaded => candidates
                .into_iter()
                .min_by(|a, b| a.load_ratio().total_cmp(&b.load_ratio()))
                .cloned(),
            PlacementStrategy::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|node| (*node).clone()),
            PlacementStrategy::ResourceAware => candidates
                .into_iter()
                .min_by(|a, b| {
                    a.resource_pressure_score()
                        .total_cmp(&b.resource_pressure_score())
                })
                .cloned(),
            PlacementStrategy::LocalityAware => {
                if let Some(node) = self.affine_node(&candidates, function_id) {
                    debug!(function_id = %function_id, node_id = %node.id, "affinity hit");
                    return Some(node);
                }
                let max_capacity = candidates
                    .iter()
                    .map(|node| node.capacity)
                    .max()
                    .unwrap_or(1)
                    .max(1);
                candidates
                    .into_iter()
                    .max_by(|a, b| {
                        locality_score(a, function_id, max_capacity)
                            .total_cmp(&locality_score(b, function_id, max_capacity))
                    })
                    .cloned()
            }
        }
    }

    /// Strengthen affinity after a successful remote dispatch.
    pub fn record_function_placement(&self, function_id: &str, node_id: &str) {
        self.affinity.lock().unwrap().insert(
            function_id.to_string(),
            AffinityEntry {
                node_id: node_id.to_string(),
                expires: Instant::now() + self.affinity_ttl,
            },
        );
    }

    /// Cached node for the function, honored while it still has capacity.
    fn affine_node(&self, candidates: &[&Node], function_id: &str) -> Option<Node> {
        let mut affinity = self.affinity.lock().unwrap();
        let entry = affinity.get(function_id)?;
        if entry.expires <= Instant::now() {
            affinity.remove(function_id);
            return None;
        }
        candidates
            .iter()
            .find(|node| node.id == entry.node_id)
            .map(|node| (*node).clone())
    }

    #[cfg(test)]
    fn affinity_len(&self) -> usize {
        self.affinity.lock().unwrap().len()
    }
}

/// Composite locality score: spare capacity 0.4, load 0.25, pressure 0.2,
/// queue 0.15, plus 0.1 when the node advertises warm sandboxes. The
/// capacity term is absolute spare slots normalized against the largest
/// node, so big nodes attract work that small idle nodes cannot hold.
fn locality_score(node: &Node, function_id: &str, max_capacity: u32) -> f64 {
    let spare = node.capacity.saturating_sub(node.active_vms) as f64;
    let capacity_score = spare / max_capacity as f64;
    let mut score = 0.4 * capacity_score
        + 0.25 * (1.0 - node.load_ratio())
        + 0.2 * (1.0 - node.resource_pressure_score())
        + 0.15 * (1.0 - node.queue_ratio());
    if node.advertises_warm(function_id) {
        score += 0.1;
    }
    score
}
