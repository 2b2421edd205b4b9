use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Map of guest path to file contents, as shipped to the sandbox agent.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Symbolic runtime a function executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Node,
    Go,
    Rust,
    Wasm,
}

impl Runtime {
    /// Runtimes that ship source and compile inside the sandbox.
    pub fn needs_compilation(&self) -> bool {
        matches!(self, Runtime::Go | Runtime::Rust)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Python => "python",
            Runtime::Node => "node",
            Runtime::Go => "go",
            Runtime::Rust => "rust",
            Runtime::Wasm => "wasm",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Runtime::Python),
            "node" => Ok(Runtime::Node),
            "go" => Ok(Runtime::Go),
            "rust" => Ok(Runtime::Rust),
            "wasm" => Ok(Runtime::Wasm),
            other => Err(format!("unknown runtime: {}", other)),
        }
    }
}

/// Whether the user process is torn down between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Process,
    Persistent,
}

/// Per-sandbox resource limits beyond memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub vcpus: u32,
    pub disk_iops: u32,
    pub disk_bw_mbps: u32,
    pub net_iops: u32,
    pub net_bw_mbps: u32,
}

/// Admission control limits applied when a pool cannot grow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub enabled: bool,
    /// Reject when pool-wide inflight reaches this. 0 disables.
    pub max_inflight: u32,
    /// Reject when this many acquisitions are already queued. 0 disables.
    pub max_queue_depth: u32,
    /// Reject after waiting this long for a slot. 0 disables.
    pub max_queue_wait_ms: u64,
}

/// Signal thresholds driving the per-function autoscaler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub enabled: bool,
    pub queue_depth_threshold: u32,
    pub queue_wait_ms_threshold: u64,
    pub cold_start_pct_threshold: f64,
    pub avg_latency_ms_threshold: f64,
    pub target_concurrency: f64,
    pub idle_pct_threshold: f64,
}

impl Default for AutoscalePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_depth_threshold: 2,
            queue_wait_ms_threshold: 500,
            cold_start_pct_threshold: 20.0,
            avg_latency_ms_threshold: 1_000.0,
            target_concurrency: 0.7,
            idle_pct_threshold: 60.0,
        }
    }
}

/// Immutable-per-version function record. The pool key derives from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub runtime: Runtime,
    pub handler: String,
    /// Stable fingerprint of the user code. Changing it evicts the pool.
    pub code_hash: String,
    pub env_vars: HashMap<String, String>,
    pub memory_mb: u32,
    pub timeout_s: u64,
    pub resources: ResourceLimits,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Max concurrent requests per sandbox. Forced to 1 by isolating drivers.
    pub instance_concurrency: u32,
    pub capacity: CapacityPolicy,
    pub autoscale: AutoscalePolicy,
    pub mode: ExecutionMode,
}

impl Function {
    /// Effective per-sandbox concurrency, never zero.
    pub fn concurrency(&self) -> u32 {
        self.instance_concurrency.max(1)
    }
}

/// Stable fingerprint of a code file map: sha256 over sorted (path, bytes).
pub fn hash_code(files: &FileMap) -> String {
    let mut hasher = Sha256::new();
    for (path, bytes) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Fingerprint of the execution profile, used when pools are shared across
/// functions with identical runtime, handler, and resource shape.
pub fn profile_key(function: &Function) -> String {
    let mut hasher = Sha256::new();
    hasher.update(function.runtime.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(function.handler.as_bytes());
    hasher.update([0u8]);
    hasher.update(function.memory_mb.to_be_bytes());
    hasher.update(function.resources.vcpus.to_be_bytes());
    hasher.update(function.resources.disk_iops.to_be_bytes());
    hasher.update(function.resources.disk_bw_mbps.to_be_bytes());
    hasher.update(function.resources.net_iops.to_be_bytes());
    hasher.update(function.resources.net_bw_mbps.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", b));
    }
    format!("prof_{}", out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Baseline function record shared by tests across the crate.
    pub(crate) fn test_function(id: &str) -> Function {
        Function {
            id: id.to_string(),
            name: "echo".to_string(),
            version: 1,
            runtime: Runtime::Python,
            handler: "main.handler".to_string(),
            code_hash: "abc".to_string(),
            env_vars: HashMap::new(),
            memory_mb: 256,
            timeout_s: 30,
            resources: ResourceLimits::default(),
            min_replicas: 0,
            max_replicas: 4,
            instance_concurrency: 1,
            capacity: CapacityPolicy::default(),
            autoscale: AutoscalePolicy::default(),
            mode: ExecutionMode::Process,
        }
    }
}
