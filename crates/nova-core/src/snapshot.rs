use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::function::Function;
use crate::singleflight::InflightSet;

/// Deadline for one background snapshot creation. Independent from any
/// invocation deadline so a slow snapshot cannot stall foreground work.
const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(60);

/// Driver-side snapshot capture, invoked off the invocation path.
///
/// Implementations pause/capture/resume however their hypervisor does it.
/// Failures are logged and retried on a later cold start, never surfaced to
/// the caller of `acquire`.
#[async_trait]
pub trait SnapshotHook: Send + Sync {
    async fn capture(&self, function: &Function, vm_id: &str) -> Result<(), String>;
}

/// Schedules at most one snapshot creation per function.
pub struct SnapshotScheduler {
    hook: Arc<dyn SnapshotHook>,
    inflight: InflightSet,
    completed: Arc<Mutex<HashSet<String>>>,
}

impl SnapshotScheduler {
    pub fn new(hook: Arc<dyn SnapshotHook>) -> Arc<Self> {
        Arc::new(Self {
            hook,
            inflight: InflightSet::new(),
            completed: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Whether a snapshot for the function has been captured this process.
    pub fn has_snapshot(&self, function_id: &str) -> bool {
        self.completed.lock().unwrap().contains(function_id)
    }

    /// Kick off a background capture after a cold start, unless one exists or
    /// is already being captured for this function.
    pub fn maybe_schedule(&self, function: &Function, vm_id: &str) {
        if self.has_snapshot(&function.id) {
            return;
        }
        let Some(guard) = self.inflight.begin(&function.id) else {
            return;
        };

        let hook = Arc::clone(&self.hook);
        let completed = Arc::clone(&self.completed);
        let function = function.clone();
        let vm_id = vm_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match tokio::time::timeout(SNAPSHOT_DEADLINE, hook.capture(&function, &vm_id)).await {
                Ok(Ok(())) => {
                    completed.lock().unwrap().insert(function.id.clone());
                    info!(function_id = %function.id, vm_id = %vm_id, "snapshot captured");
                }
                Ok(Err(e)) => {
                    warn!(function_id = %function.id, vm_id = %vm_id, error = %e, "snapshot capture failed");
                }
                Err(_) => {
                    warn!(
                        function_id = %function.id,
                        vm_id = %vm_id,
                        deadline_s = SNAPSHOT_DEADLINE.as_secs(),
                        "snapshot capture timed out"
                    );
                }
            }
        });
    }
}
