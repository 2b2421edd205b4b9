use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{AgentClient, AgentTransport};
use crate::function::{FileMap, Function, Runtime};

/// A sandbox the driver has created and booted, before the pool wraps it.
pub struct CreatedVm {
    pub id: String,
    pub runtime: Runtime,
    /// Transport to the in-sandbox agent endpoint the driver exposed.
    pub transport: Arc<dyn AgentTransport>,
}

impl std::fmt::Debug for CreatedVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedVm")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .finish()
    }
}

/// Capability contract every sandbox driver fulfils.
///
/// Concrete drivers (Firecracker, Docker, Kubernetes, Kata, libkrun, WASM)
/// encapsulate image selection, networking, CID allocation, and snapshot
/// loading behind these four operations.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Boot a sandbox for the function with its code files laid out.
    async fn create(&self, function: &Function, files: &FileMap) -> Result<CreatedVm, DriverError>;

    /// Stop and reclaim a sandbox.
    async fn stop(&self, vm_id: &str) -> Result<(), DriverError>;

    /// Open an agent client bound to the sandbox's transport.
    fn open_client(&self, vm: &CreatedVm) -> AgentClient {
        AgentClient::new(Arc::clone(&vm.transport))
    }

    /// Where this driver persists snapshots. `Some` marks a driver that
    /// enforces per-sandbox isolation, which forces instance concurrency 1.
    fn snapshot_dir(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug)]
pub enum DriverError {
    CreateFailed(String),
    StopFailed(String),
    NotFound(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::CreateFailed(msg) => write!(f, "sandbox creation failed: {}", msg),
            DriverError::StopFailed(msg) => write!(f, "sandbox stop failed: {}", msg),
            DriverError::NotFound(id) => write!(f, "sandbox not found: {}", id),
        }
    }
}

impl std::error::Error for DriverError {}
