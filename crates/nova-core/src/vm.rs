use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::agent::AgentClient;
use crate::function::Runtime;

/// Sandbox lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Creating,
    Active,
    Idle,
    Suspended,
    Destroyed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Active => write!(f, "active"),
            VmState::Idle => write!(f, "idle"),
            VmState::Suspended => write!(f, "suspended"),
            VmState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Shared handle to one sandbox.
///
/// Once popped from a ready set the holder owns the inflight slot it took;
/// only the owning operation may stop the sandbox or close its client.
pub struct VmHandle {
    pub id: String,
    pub runtime: Runtime,
    pub client: AgentClient,
    pub created_at: Instant,
    /// Max concurrent requests this sandbox accepts. 1 for isolating drivers.
    /// Mutable because a template zygote is retrofitted to its function.
    max_concurrent: AtomicU32,
    /// Wall-clock boot duration. Below the snapshot threshold this is
    /// heuristically counted as a snapshot restore.
    boot_ms: AtomicU64,
    from_snapshot: AtomicBool,
    state: Mutex<VmState>,
    inflight: AtomicU32,
    last_used: Mutex<Instant>,
}

impl VmHandle {
    pub fn new(
        id: String,
        runtime: Runtime,
        max_concurrent: u32,
        boot_ms: u64,
        from_snapshot: bool,
        client: AgentClient,
    ) -> Self {
        Self {
            id,
            runtime,
            max_concurrent: AtomicU32::new(max_concurrent.max(1)),
            boot_ms: AtomicU64::new(boot_ms),
            from_snapshot: AtomicBool::new(from_snapshot),
            client,
            created_at: Instant::now(),
            state: Mutex::new(VmState::Active),
            inflight: AtomicU32::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn set_max_concurrent(&self, max_concurrent: u32) {
        self.max_concurrent
            .store(max_concurrent.max(1), Ordering::SeqCst);
    }

    pub fn boot_ms(&self) -> u64 {
        self.boot_ms.load(Ordering::SeqCst)
    }

    pub fn set_boot_ms(&self, boot_ms: u64) {
        self.boot_ms.store(boot_ms, Ordering::SeqCst);
    }

    pub fn from_snapshot(&self) -> bool {
        self.from_snapshot.load(Ordering::SeqCst)
    }

    pub fn set_from_snapshot(&self, from_snapshot: bool) {
        self.from_snapshot.store(from_snapshot, Ordering::SeqCst);
    }

    pub fn state(&self) -> VmState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: VmState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Claim one request slot. Caller must have verified capacity under the
    /// pool lock; the counter itself never rejects.
    pub fn begin_request(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        self.set_state(VmState::Active);
    }

    /// Release one request slot, clamping at zero.
    pub fn end_request(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        self.touch();
        if self.inflight() == 0 {
            self.set_state(VmState::Idle);
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.inflight() < self.max_concurrent()
    }

    pub fn is_busy(&self) -> bool {
        self.inflight() > 0
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .field("state", &self.state())
            .field("inflight", &self.inflight())
            .field("max_concurrent", &self.max_concurrent())
            .finish()
    }
}
