use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Cluster membership states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Inactive,
    /// Administratively removed from placement; existing sandboxes drain.
    Drained,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "active"),
            NodeState::Inactive => write!(f, "inactive"),
            NodeState::Drained => write!(f, "drained"),
        }
    }
}

/// Pressure metrics a node reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub active_vms: u32,
    pub queue_depth: u32,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub io_pressure_pct: f64,
}

/// One worker node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub state: NodeState,
    /// Sandbox capacity of this node.
    pub capacity: u32,
    pub active_vms: u32,
    pub queue_depth: u32,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub io_pressure_pct: f64,
    pub last_heartbeat: SystemTime,
    /// Free-form labels; `warm/<function_id> = true` advertises warm
    /// sandboxes for placement affinity.
    pub labels: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            state: NodeState::Active,
            capacity,
            active_vms: 0,
            queue_depth: 0,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            io_pressure_pct: 0.0,
            last_heartbeat: SystemTime::now(),
            labels: HashMap::new(),
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.state == NodeState::Active
    }

    /// Weighted resource pressure in [0, 1]: 0.4 cpu, 0.35 memory, 0.25 io.
    pub fn resource_pressure_score(&self) -> f64 {
        let weighted =
            0.4 * self.cpu_pct + 0.35 * self.mem_pct + 0.25 * self.io_pressure_pct;
        (weighted / 100.0).clamp(0.0, 1.0)
    }

    /// Fraction of sandbox capacity in use, in [0, 1].
    pub fn load_ratio(&self) -> f64 {
        (self.active_vms as f64 / self.capacity.max(1) as f64).clamp(0.0, 1.0)
    }

    /// Queued work relative to capacity, in [0, 1].
    pub fn queue_ratio(&self) -> f64 {
        (self.queue_depth as f64 / self.capacity.max(1) as f64).clamp(0.0, 1.0)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.active_vms < self.capacity
    }

    /// Fold a heartbeat's metrics into the node record.
    pub fn apply_metrics(&mut self, metrics: &NodeMetrics) {
        self.active_vms = metrics.active_vms;
        self.queue_depth = metrics.queue_depth;
        self.cpu_pct = metrics.cpu_pct;
        self.mem_pct = metrics.mem_pct;
        self.io_pressure_pct = metrics.io_pressure_pct;
        self.last_heartbeat = SystemTime::now();
    }

    pub fn warm_label(function_id: &str) -> String {
        format!("warm/{}", function_id)
    }

    pub fn advertises_warm(&self, function_id: &str) -> bool {
        self.labels
            .get(&Self::warm_label(function_id))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Collect pressure metrics for the local machine via sysinfo.
///
/// `active_vms` and `queue_depth` come from the embedding pool; the io
/// pressure approximation uses the 1-minute load average normalized by core
/// count, since Linux PSI is not portably available.
pub fn collect_local_metrics(sys: &mut System, active_vms: u32, queue_depth: u32) -> NodeMetrics {
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpu_pct = sys.global_cpu_usage() as f64;
    let mem_pct = if sys.total_memory() == 0 {
        0.0
    } else {
        sys.used_memory() as f64 * 100.0 / sys.total_memory() as f64
    };
    let cores = sys.cpus().len().max(1) as f64;
    let io_pressure_pct = (System::load_average().one / cores * 100.0).clamp(0.0, 100.0);

    NodeMetrics {
        active_vms,
        queue_depth,
        cpu_pct,
        mem_pct,
        io_pressure_pct,
    }
}
