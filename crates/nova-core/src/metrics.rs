use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::debug;

/// One-minute buckets covering 24 hours.
const RING_MINUTES: usize = 24 * 60;
/// Bound on the hot-path event channel feeding the ring worker.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Autoscaler decision kinds, counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Predictive,
}

/// Per-function running totals. The autoscaler diffs consecutive reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionTotals {
    pub invocations: u64,
    pub cold_starts: u64,
    pub latency_total_ms: u64,
}

#[derive(Default)]
struct FunctionCounters {
    invocations: AtomicU64,
    cold_starts: AtomicU64,
    latency_total_ms: AtomicU64,
}

/// One rotated latency bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinuteBucket {
    /// Epoch minute this bucket currently holds. Zero means never written.
    pub minute: u64,
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

struct MinuteRing {
    buckets: Vec<MinuteBucket>,
}

impl MinuteRing {
    fn new() -> Self {
        Self {
            buckets: vec![MinuteBucket::default(); RING_MINUTES],
        }
    }

    fn record(&mut self, minute: u64, latency_ms: u64) {
        let idx = (minute as usize) % RING_MINUTES;
        let bucket = &mut self.buckets[idx];
        if bucket.minute != minute {
            *bucket = MinuteBucket {
                minute,
                count: 0,
                total_ms: 0,
                max_ms: 0,
            };
        }
        bucket.count += 1;
        bucket.total_ms += latency_ms;
        bucket.max_ms = bucket.max_ms.max(latency_ms);
    }

    fn window(&self, now_minute: u64, minutes: u64) -> Vec<MinuteBucket> {
        let mut out = Vec::new();
        for m in now_minute.saturating_sub(minutes.saturating_sub(1))..=now_minute {
            let bucket = self.buckets[(m as usize) % RING_MINUTES];
            if bucket.minute == m {
                out.push(bucket);
            }
        }
        out
    }
}

struct InvocationEvent {
    minute: u64,
    latency_ms: u64,
}

/// Point-in-time copy of the global counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub invocations_total: u64,
    pub invocations_warm: u64,
    pub invocations_cold: u64,
    pub latency_total_ms: u64,
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub vms_created: u64,
    pub vms_stopped: u64,
    pub vms_crashed: u64,
    pub snapshot_hits: u64,
    pub active_vms: i64,
    pub scale_up_decisions: u64,
    pub scale_down_decisions: u64,
    pub predictive_decisions: u64,
    pub dropped_events: u64,
}

impl MetricsSnapshot {
    pub fn cold_start_pct(&self) -> f64 {
        if self.invocations_total == 0 {
            return 0.0;
        }
        self.invocations_cold as f64 * 100.0 / self.invocations_total as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.invocations_total == 0 {
            return 0.0;
        }
        self.latency_total_ms as f64 / self.invocations_total as f64
    }
}

/// Process-wide execution metrics.
///
/// Counters are plain atomics so the invocation path never takes a lock; the
/// latency ring is folded by a single worker fed through a bounded channel,
/// dropping (and counting) events under pressure.
pub struct MetricsRegistry {
    invocations_total: AtomicU64,
    invocations_warm: AtomicU64,
    invocations_cold: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_min_ms: AtomicU64,
    latency_max_ms: AtomicU64,
    vms_created: AtomicU64,
    vms_stopped: AtomicU64,
    vms_crashed: AtomicU64,
    snapshot_hits: AtomicU64,
    active_vms: AtomicI64,
    scale_up_decisions: AtomicU64,
    scale_down_decisions: AtomicU64,
    predictive_decisions: AtomicU64,
    dropped_events: AtomicU64,
    per_function: RwLock<HashMap<String, Arc<FunctionCounters>>>,
    desired_replicas: Mutex<HashMap<String, u32>>,
    ring: Arc<RwLock<MinuteRing>>,
    event_tx: mpsc::Sender<InvocationEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<InvocationEvent>>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            invocations_total: AtomicU64::new(0),
            invocations_warm: AtomicU64::new(0),
            invocations_cold: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
            latency_min_ms: AtomicU64::new(u64::MAX),
            latency_max_ms: AtomicU64::new(0),
            vms_created: AtomicU64::new(0),
            vms_stopped: AtomicU64::new(0),
            vms_crashed: AtomicU64::new(0),
            snapshot_hits: AtomicU64::new(0),
            active_vms: AtomicI64::new(0),
            scale_up_decisions: AtomicU64::new(0),
            scale_down_decisions: AtomicU64::new(0),
            predictive_decisions: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            per_function: RwLock::new(HashMap::new()),
            desired_replicas: Mutex::new(HashMap::new()),
            ring: Arc::new(RwLock::new(MinuteRing::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Start the ring worker. Call once; later calls return `None`.
    pub fn start_ring_worker(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.event_rx.lock().unwrap().take()?;
        let ring = Arc::clone(&self.ring);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut ring = ring.write().unwrap();
                ring.record(event.minute, event.latency_ms);
            }
            debug!("metrics ring worker stopped");
        }))
    }

    pub fn record_invocation(&self, function_id: &str, cold_start: bool, latency_ms: u64) {
        self.invocations_total.fetch_add(1, Ordering::Relaxed);
        if cold_start {
            self.invocations_cold.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invocations_warm.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(latency_ms, Ordering::Relaxed);

        let counters = self.function_counters(function_id);
        counters.invocations.fetch_add(1, Ordering::Relaxed);
        if cold_start {
            counters.cold_starts.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);

        let event = InvocationEvent {
            minute: epoch_minute(),
            latency_ms,
        };
        if self.event_tx.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_vm_created(&self, from_snapshot: bool) {
        self.vms_created.fetch_add(1, Ordering::Relaxed);
        if from_snapshot {
            self.snapshot_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.active_vms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vm_stopped(&self) {
        self.vms_stopped.fetch_add(1, Ordering::Relaxed);
        self.active_vms.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_vm_crashed(&self) {
        self.vms_crashed.fetch_add(1, Ordering::Relaxed);
        self.active_vms.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_scale_decision(&self, decision: ScaleDecision) {
        match decision {
            ScaleDecision::Up => &self.scale_up_decisions,
            ScaleDecision::Down => &self.scale_down_decisions,
            ScaleDecision::Predictive => &self.predictive_decisions,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_desired_replicas_gauge(&self, function_id: &str, desired: u32) {
        self.desired_replicas
            .lock()
            .unwrap()
            .insert(function_id.to_string(), desired);
    }

    pub fn desired_replicas_gauge(&self, function_id: &str) -> Option<u32> {
        self.desired_replicas.lock().unwrap().get(function_id).copied()
    }

    pub fn function_totals(&self, function_id: &str) -> FunctionTotals {
        let per_function = self.per_function.read().unwrap();
        match per_function.get(function_id) {
            Some(counters) => FunctionTotals {
                invocations: counters.invocations.load(Ordering::Relaxed),
                cold_starts: counters.cold_starts.load(Ordering::Relaxed),
                latency_total_ms: counters.latency_total_ms.load(Ordering::Relaxed),
            },
            None => FunctionTotals::default(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let min = self.latency_min_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            invocations_total: self.invocations_total.load(Ordering::Relaxed),
            invocations_warm: self.invocations_warm.load(Ordering::Relaxed),
            invocations_cold: self.invocations_cold.load(Ordering::Relaxed),
            latency_total_ms: self.latency_total_ms.load(Ordering::Relaxed),
            latency_min_ms: if min == u64::MAX { 0 } else { min },
            latency_max_ms: self.latency_max_ms.load(Ordering::Relaxed),
            vms_created: self.vms_created.load(Ordering::Relaxed),
            vms_stopped: self.vms_stopped.load(Ordering::Relaxed),
            vms_crashed: self.vms_crashed.load(Ordering::Relaxed),
            snapshot_hits: self.snapshot_hits.load(Ordering::Relaxed),
            active_vms: self.active_vms.load(Ordering::Relaxed),
            scale_up_decisions: self.scale_up_decisions.load(Ordering::Relaxed),
            scale_down_decisions: self.scale_down_decisions.load(Ordering::Relaxed),
            predictive_decisions: self.predictive_decisions.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    /// Latency buckets for the trailing `minutes` window, oldest first.
    pub fn latency_window(&self, minutes: u64) -> Vec<MinuteBucket> {
        let ring = self.ring.read().unwrap();
        ring.window(epoch_minute(), minutes.min(RING_MINUTES as u64))
    }

    fn function_counters(&self, function_id: &str) -> Arc<FunctionCounters> {
        {
            let per_function = self.per_function.read().unwrap();
            if let Some(counters) = per_function.get(function_id) {
                return Arc::clone(counters);
            }
        }
        let mut per_function = self.per_function.write().unwrap();
        Arc::clone(
            per_function
                .entry(function_id.to_string())
                .or_insert_with(|| Arc::new(FunctionCounters::default())),
        )
    }
}

fn epoch_minute() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 60)
        .unwrap_or(0)
}
