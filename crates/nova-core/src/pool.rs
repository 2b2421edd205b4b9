use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::driver::SandboxDriver;
use crate::function::{profile_key, FileMap, Function};
use crate::metrics::MetricsRegistry;
use crate::singleflight::Singleflight;
use crate::snapshot::SnapshotScheduler;
use crate::template::TemplatePool;
use crate::vm::{VmHandle, VmState};

/// Boot durations under this are heuristically counted as snapshot restores.
const SNAPSHOT_BOOT_THRESHOLD_MS: u64 = 1000;
/// Upper bound on one condvar wait slice; waiters re-check after each slice.
const WAIT_SLICE: Duration = Duration::from_millis(500);
/// Concurrent stop workers drained by the cleanup tick.
const STOP_WORKERS: usize = 4;

/// What one successful acquisition hands back.
pub struct Acquired {
    pub vm: Arc<VmHandle>,
    pub cold_start: bool,
    pub pool_key: String,
    pub queue_wait_ms: u64,
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("vm_id", &self.vm.id)
            .field("cold_start", &self.cold_start)
            .field("pool_key", &self.pool_key)
            .field("queue_wait_ms", &self.queue_wait_ms)
            .finish()
    }
}

/// Point-in-time view of one function pool, read by the autoscaler.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub queue_depth: u32,
    pub total_inflight: u64,
    pub desired_replicas: u32,
    pub max_replicas: u32,
    pub last_queue_wait_ms: u64,
}

struct PoolInner {
    vms: Vec<Arc<VmHandle>>,
    /// LIFO stack of sandboxes with spare request capacity. The most
    /// recently used sandbox is reused first for cache warmth.
    ready: Vec<Arc<VmHandle>>,
    total_inflight: u64,
    waiters: u32,
    /// Function ids sharing this pool (more than one with shared keying).
    function_refs: HashSet<String>,
    code_hash: String,
}

/// One pool of sandboxes serving a pool key.
pub struct FunctionPool {
    key: String,
    inner: Mutex<PoolInner>,
    notify: Notify,
    max_replicas: AtomicU32,
    desired_replicas: AtomicU32,
    last_queue_wait_ms: AtomicU64,
    /// Representative function record, refreshed on every acquisition.
    function: Mutex<Function>,
}

impl FunctionPool {
    fn new(key: &str, function: &Function) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            inner: Mutex::new(PoolInner {
                vms: Vec::new(),
                ready: Vec::new(),
                total_inflight: 0,
                waiters: 0,
                function_refs: HashSet::new(),
                code_hash: function.code_hash.clone(),
            }),
            notify: Notify::new(),
            max_replicas: AtomicU32::new(function.max_replicas),
            desired_replicas: AtomicU32::new(0),
            last_queue_wait_ms: AtomicU64::new(0),
            function: Mutex::new(function.clone()),
        })
    }
}

/// Decrements the waiter count when a wait ends, normally or by cancellation.
struct WaiterGuard {
    pool: Arc<FunctionPool>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.lock().unwrap();
        inner.waiters = inner.waiters.saturating_sub(1);
    }
}

enum Step {
    Create,
    Wait(Option<Duration>),
}

/// Shared result of a failed cold-start flight.
#[derive(Debug, Clone)]
enum ColdStartFailure {
    /// Capacity filled between admission and creation; not an error.
    Raced,
    Failed(String),
}

impl std::fmt::Display for ColdStartFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColdStartFailure::Raced => write!(f, "lost creation race"),
            ColdStartFailure::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

struct PoolCore {
    config: PoolConfig,
    driver: Arc<dyn SandboxDriver>,
    metrics: Arc<MetricsRegistry>,
    templates: OnceLock<Arc<TemplatePool>>,
    snapshots: OnceLock<Arc<SnapshotScheduler>>,
    pools: RwLock<HashMap<String, Arc<FunctionPool>>>,
    /// Latest desired replica count per function id. Survives pool
    /// recreation after a code change.
    desired: Mutex<HashMap<String, u32>>,
    /// Function id to pool key, for stats and desired-replica routing.
    pool_keys: Mutex<HashMap<String, String>>,
    total_vms: AtomicU64,
    cold_flights: Singleflight<Result<Arc<VmHandle>, ColdStartFailure>>,
    prewarm: Arc<Semaphore>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Per-function pools of reusable sandboxes. Cheap to clone.
///
/// Acquisition prefers a warm sandbox, then a template splice, then a full
/// cold boot deduplicated through a per-key singleflight. Background ticks
/// evict idle sandboxes down to the desired floor and health-check the rest.
/// Network IO and driver calls never run under a pool mutex.
#[derive(Clone)]
pub struct SandboxPool {
    core: Arc<PoolCore>,
}

impl SandboxPool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn SandboxDriver>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let prewarm = Arc::new(Semaphore::new(config.max_prewarm_workers.max(1)));
        Self {
            core: Arc::new(PoolCore {
                config,
                driver,
                metrics,
                templates: OnceLock::new(),
                snapshots: OnceLock::new(),
                pools: RwLock::new(HashMap::new()),
                desired: Mutex::new(HashMap::new()),
                pool_keys: Mutex::new(HashMap::new()),
                total_vms: AtomicU64::new(0),
                cold_flights: Singleflight::new(),
                prewarm,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a template pool consulted before full cold boots.
    pub fn with_templates(self, templates: Arc<TemplatePool>) -> Self {
        let _ = self.core.templates.set(templates);
        self
    }

    /// Attach a snapshot scheduler; enables the Suspended state and
    /// post-cold-start snapshot capture.
    pub fn with_snapshots(self, snapshots: Arc<SnapshotScheduler>) -> Self {
        let _ = self.core.snapshots.set(snapshots);
        self
    }

    /// Start the cleanup and health background loops.
    pub fn start(&self) {
        let cleanup = {
            let pool = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.core.config.cleanup_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let tick = pool.clone();
                    // Ticks run on their own task so a panic is contained.
                    if let Err(e) = tokio::spawn(async move { tick.cleanup_once().await }).await {
                        error!(error = %e, "cleanup tick panicked");
                    }
                }
            })
        };
        let health = {
            let pool = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(pool.core.config.health_check_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let tick = pool.clone();
                    if let Err(e) = tokio::spawn(async move { tick.health_check_once().await }).await
                    {
                        error!(error = %e, "health tick panicked");
                    }
                }
            })
        };
        self.core.tasks.lock().unwrap().extend([cleanup, health]);
    }

    /// Pool key for a function: its id, or its execution profile when pools
    /// are shared across functions with identical profiles.
    pub fn key_for(&self, function: &Function) -> String {
        if self.core.config.shared_pools {
            profile_key(function)
        } else {
            function.id.clone()
        }
    }

    /// Acquire a sandbox for one invocation.
    ///
    /// The loop: prepare the pool (detecting code changes), try a warm take,
    /// create if capacity allows, otherwise run admission control and wait on
    /// the pool's notifier until a release frees a slot.
    pub async fn acquire(
        &self,
        function: &Function,
        code: &FileMap,
    ) -> Result<Acquired, PoolError> {
        let started = Instant::now();
        let key = self.key_for(function);
        let mut after_shared_flight = false;

        loop {
            let pool = self.prepare_pool(function, &key);

            if let Some(vm) = self.try_warm_take(&pool) {
                let waited = started.elapsed().as_millis() as u64;
                pool.last_queue_wait_ms.store(waited, Ordering::SeqCst);
                return Ok(Acquired {
                    vm,
                    cold_start: false,
                    pool_key: key,
                    queue_wait_ms: waited,
                });
            }

            match self.admission_step(&pool, function, started, after_shared_flight)? {
                Step::Create => {
                    let this = self.clone();
                    let pool_for_flight = Arc::clone(&pool);
                    let function_owned = function.clone();
                    let code_owned = code.clone();
                    let flight = self
                        .core
                        .cold_flights
                        .run(&key, move || async move {
                            this.cold_create(pool_for_flight, function_owned, code_owned, true)
                                .await
                        })
                        .await;

                    match flight {
                        Ok((Ok(vm), false)) => {
                            let waited = started.elapsed().as_millis() as u64;
                            pool.last_queue_wait_ms.store(waited, Ordering::SeqCst);
                            return Ok(Acquired {
                                vm,
                                cold_start: true,
                                pool_key: key,
                                queue_wait_ms: waited,
                            });
                        }
                        Ok((Ok(_), true)) => {
                            // The creator owns the new sandbox's slot; shared
                            // winners go back to the top for a warm re-check.
                            after_shared_flight = true;
                            continue;
                        }
                        Ok((Err(ColdStartFailure::Raced), _)) => {
                            // Capacity filled while the flight was starting.
                            after_shared_flight = true;
                            continue;
                        }
                        Ok((Err(ColdStartFailure::Failed(msg)), shared)) => {
                            if shared {
                                // Someone else's cold start failed; retry the
                                // loop so admission control decides our fate.
                                after_shared_flight = true;
                                continue;
                            }
                            return Err(PoolError::ColdStart(msg));
                        }
                        Err(_) => {
                            return Err(PoolError::ColdStart(
                                "cold start worker aborted".to_string(),
                            ))
                        }
                    }
                }
                Step::Wait(remaining) => {
                    let notified = pool.notify.notified();
                    let guard = WaiterGuard {
                        pool: Arc::clone(&pool),
                    };
                    let slice = remaining.map(|r| r.min(WAIT_SLICE)).unwrap_or(WAIT_SLICE);
                    let _ = tokio::time::timeout(slice, notified).await;
                    drop(guard);
                }
            }
        }
    }

    /// Return a sandbox after an invocation. Must be called exactly once per
    /// acquire; broken sandboxes go through `evict_vm` instead.
    pub fn release(&self, pool_key: &str, vm: &Arc<VmHandle>) {
        let Some(pool) = self.get_pool(pool_key) else {
            vm.end_request();
            return;
        };
        let mut inner = pool.inner.lock().unwrap();
        let member = inner.vms.iter().any(|v| Arc::ptr_eq(v, vm));
        if member {
            assert!(
                vm.is_busy(),
                "double release of sandbox {} (release without matching acquire)",
                vm.id
            );
        }
        vm.end_request();
        if member {
            inner.total_inflight = inner.total_inflight.saturating_sub(1);
            if vm.has_capacity()
                && vm.state() != VmState::Destroyed
                && !inner.ready.iter().any(|v| Arc::ptr_eq(v, vm))
            {
                inner.ready.push(Arc::clone(vm));
            }
            pool.notify.notify_one();
        }
    }

    /// Remove an unhealthy sandbox from its pool and stop it asynchronously.
    pub fn evict_vm(&self, pool_key: &str, vm: &Arc<VmHandle>, crashed: bool) {
        let Some(pool) = self.get_pool(pool_key) else {
            return;
        };
        {
            let mut inner = pool.inner.lock().unwrap();
            let before = inner.vms.len();
            inner.vms.retain(|v| !Arc::ptr_eq(v, vm));
            if inner.vms.len() == before {
                return; // already evicted
            }
            inner.ready.retain(|v| !Arc::ptr_eq(v, vm));
            inner.total_inflight = inner.total_inflight.saturating_sub(vm.inflight() as u64);
            pool.notify.notify_one();
        }
        warn!(vm_id = %vm.id, pool_key = %pool_key, crashed, "evicting sandbox");
        self.stop_vm_async(Arc::clone(vm), crashed);
    }

    /// Pre-warm the pool toward `max(min_replicas, desired_replicas)`.
    pub async fn ensure_ready(&self, function: &Function, code: &FileMap) {
        let key = self.key_for(function);
        let pool = self.prepare_pool(function, &key);
        let target = function
            .min_replicas
            .max(pool.desired_replicas.load(Ordering::SeqCst));
        let current = pool.inner.lock().unwrap().vms.len() as u32;
        let needed = target.saturating_sub(current);
        if needed == 0 {
            return;
        }
        info!(pool_key = %key, needed, "pre-warming sandboxes");

        let mut handles = Vec::new();
        for _ in 0..needed {
            if !self.global_capacity_available() {
                warn!(pool_key = %key, "global sandbox cap reached, stopping pre-warm");
                break;
            }
            let this = self.clone();
            let pool = Arc::clone(&pool);
            let function = function.clone();
            let code = code.clone();
            let semaphore = Arc::clone(&self.core.prewarm);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                match this.cold_create(pool, function, code, false).await {
                    Ok(_) | Err(ColdStartFailure::Raced) => {}
                    Err(e) => warn!(error = %e, "pre-warm creation failed"),
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// The autoscaler's sole mutation: record the new target both on the pool
    /// and per function, so a recreated pool reapplies the latest value.
    pub fn set_desired_replicas(&self, function_id: &str, desired: u32) {
        self.core
            .desired
            .lock()
            .unwrap()
            .insert(function_id.to_string(), desired);
        if let Some(pool) = self.pool_for_function(function_id) {
            pool.desired_replicas.store(desired, Ordering::SeqCst);
        }
        self.core.metrics.set_desired_replicas_gauge(function_id, desired);
    }

    pub fn pool_stats(&self, function_id: &str) -> Option<PoolStats> {
        let pool = self.pool_for_function(function_id)?;
        let inner = pool.inner.lock().unwrap();
        let busy = inner.vms.iter().filter(|vm| vm.is_busy()).count();
        Some(PoolStats {
            total: inner.vms.len(),
            busy,
            idle: inner.vms.len() - busy,
            queue_depth: inner.waiters,
            total_inflight: inner.total_inflight,
            desired_replicas: pool.desired_replicas.load(Ordering::SeqCst),
            max_replicas: pool.max_replicas.load(Ordering::SeqCst),
            last_queue_wait_ms: pool.last_queue_wait_ms.load(Ordering::SeqCst),
        })
    }

    /// Sandboxes across all pools, matching the sum of per-pool counts.
    pub fn total_vms(&self) -> u64 {
        self.core.total_vms.load(Ordering::SeqCst)
    }

    /// Stop the background loops and every pooled sandbox.
    pub async fn shutdown(&self) {
        for task in self.core.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let pools: Vec<Arc<FunctionPool>> =
            self.core.pools.read().unwrap().values().cloned().collect();
        let mut stops = Vec::new();
        for pool in pools {
            let drained = {
                let mut inner = pool.inner.lock().unwrap();
                inner.ready.clear();
                inner.total_inflight = 0;
                std::mem::take(&mut inner.vms)
            };
            for vm in drained {
                vm.set_state(VmState::Destroyed);
                let driver = Arc::clone(&self.core.driver);
                let metrics = Arc::clone(&self.core.metrics);
                self.core.total_vms.fetch_sub(1, Ordering::SeqCst);
                stops.push(tokio::spawn(async move {
                    let _ = vm.client.send_stop().await;
                    if let Err(e) = driver.stop(&vm.id).await {
                        warn!(vm_id = %vm.id, error = %e, "failed to stop sandbox on shutdown");
                    }
                    metrics.record_vm_stopped();
                }));
            }
        }
        for stop in stops {
            let _ = stop.await;
        }
        info!("sandbox pool shut down");
    }

    // --- Acquisition internals ---

    /// Look up or create the pool, refresh its function record, and detect
    /// code-hash changes: a changed hash atomically drops every sandbox from
    /// the pool and queues them for an asynchronous stop.
    fn prepare_pool(&self, function: &Function, key: &str) -> Arc<FunctionPool> {
        let pool = {
            let pools = self.core.pools.read().unwrap();
            pools.get(key).cloned()
        };
        let pool = match pool {
            Some(pool) => pool,
            None => {
                let mut pools = self.core.pools.write().unwrap();
                Arc::clone(
                    pools
                        .entry(key.to_string())
                        .or_insert_with(|| FunctionPool::new(key, function)),
                )
            }
        };

        self.core
            .pool_keys
            .lock()
            .unwrap()
            .insert(function.id.clone(), key.to_string());
        if let Some(desired) = self.core.desired.lock().unwrap().get(&function.id) {
            pool.desired_replicas.store(*desired, Ordering::SeqCst);
        }
        pool.max_replicas
            .store(function.max_replicas, Ordering::SeqCst);
        *pool.function.lock().unwrap() = function.clone();

        let evicted = {
            let mut inner = pool.inner.lock().unwrap();
            inner.function_refs.insert(function.id.clone());
            if inner.code_hash != function.code_hash {
                info!(
                    pool_key = %key,
                    old_hash = %inner.code_hash,
                    new_hash = %function.code_hash,
                    "code hash changed, evicting pool"
                );
                inner.code_hash = function.code_hash.clone();
                inner.ready.clear();
                inner.total_inflight = 0;
                std::mem::take(&mut inner.vms)
            } else {
                Vec::new()
            }
        };
        for vm in evicted {
            self.stop_vm_async(vm, false);
        }
        pool
    }

    fn try_warm_take(&self, pool: &Arc<FunctionPool>) -> Option<Arc<VmHandle>> {
        let mut inner = pool.inner.lock().unwrap();
        let vm = inner.ready.pop()?;
        vm.begin_request();
        inner.total_inflight += 1;
        if vm.has_capacity() {
            inner.ready.push(Arc::clone(&vm));
        }
        // Chain the wake so parallel releases cannot strand a waiter.
        if !inner.ready.is_empty() && inner.waiters > 0 {
            pool.notify.notify_one();
        }
        Some(vm)
    }

    /// Decide between creating, waiting, or rejecting, under the pool lock.
    fn admission_step(
        &self,
        pool: &Arc<FunctionPool>,
        function: &Function,
        started: Instant,
        after_shared_flight: bool,
    ) -> Result<Step, PoolError> {
        let mut inner = pool.inner.lock().unwrap();

        let max_replicas = pool.max_replicas.load(Ordering::SeqCst);
        let local_ok = max_replicas == 0 || (inner.vms.len() as u32) < max_replicas;
        let global_ok = self.global_capacity_available();
        if local_ok && global_ok {
            return Ok(Step::Create);
        }

        let cap = &function.capacity;
        if cap.enabled && cap.max_inflight > 0 && inner.total_inflight >= cap.max_inflight as u64 {
            return Err(PoolError::InflightLimit {
                inflight: inner.total_inflight,
                limit: cap.max_inflight,
            });
        }
        if cap.enabled && cap.max_queue_depth > 0 && inner.waiters >= cap.max_queue_depth {
            return Err(PoolError::QueueFull {
                waiters: inner.waiters,
                limit: cap.max_queue_depth,
            });
        }

        let max_wait = (cap.enabled && cap.max_queue_wait_ms > 0)
            .then(|| Duration::from_millis(cap.max_queue_wait_ms));
        let waited = started.elapsed();
        if let Some(max_wait) = max_wait {
            if waited >= max_wait {
                let waited_ms = waited.as_millis() as u64;
                pool.last_queue_wait_ms.store(waited_ms, Ordering::SeqCst);
                return Err(PoolError::QueueWaitTimeout { waited_ms });
            }
        }

        if !global_ok && inner.vms.is_empty() {
            // Nothing in this pool will ever be released; fail fast.
            return Err(PoolError::GlobalVmLimit {
                limit: self.core.config.max_global_vms,
            });
        }

        if after_shared_flight && max_wait.is_none() {
            // Lost the cold-start race and queueing is not configured.
            return Err(PoolError::ConcurrencyLimit);
        }

        inner.waiters += 1;
        Ok(Step::Wait(max_wait.map(|mw| mw.saturating_sub(waited))))
    }

    /// Create one sandbox and register it. Runs outside every pool lock.
    ///
    /// Prefers splicing a template zygote: reload injects the user code and
    /// clears scratch state, init re-binds runtime config. Any splice failure
    /// stops the template (its state is unknown) and falls back to a full
    /// driver boot.
    async fn cold_create(
        &self,
        pool: Arc<FunctionPool>,
        function: Function,
        code: FileMap,
        take_slot: bool,
    ) -> Result<Arc<VmHandle>, ColdStartFailure> {
        // Re-check capacity under the lock: a flight that just finished may
        // have filled the pool between our admission check and this one.
        {
            let inner = pool.inner.lock().unwrap();
            let max = pool.max_replicas.load(Ordering::SeqCst);
            if max != 0 && inner.vms.len() as u32 >= max {
                return Err(ColdStartFailure::Raced);
            }
            if !self.global_capacity_available() {
                return Err(ColdStartFailure::Raced);
            }
        }

        let max_concurrent = if self.core.driver.snapshot_dir().is_some() {
            // Isolating drivers serve one request per sandbox.
            1
        } else {
            function.concurrency()
        };

        if let Some(vm) = self
            .splice_template(&function, &code, max_concurrent)
            .await
        {
            self.register_vm(&pool, &vm, take_slot);
            if let Some(snapshots) = self.core.snapshots.get() {
                snapshots.maybe_schedule(&function, &vm.id);
            }
            return Ok(vm);
        }

        let boot_start = Instant::now();
        let created = self
            .core
            .driver
            .create(&function, &code)
            .await
            .map_err(|e| ColdStartFailure::Failed(e.to_string()))?;
        let client = self.core.driver.open_client(&created);
        if let Err(e) = client.init(&function).await {
            let _ = self.core.driver.stop(&created.id).await;
            return Err(ColdStartFailure::Failed(format!(
                "agent init failed: {}",
                e
            )));
        }

        let boot_ms = boot_start.elapsed().as_millis() as u64;
        let from_snapshot =
            self.core.driver.snapshot_dir().is_some() && boot_ms < SNAPSHOT_BOOT_THRESHOLD_MS;
        info!(
            vm_id = %created.id,
            function_id = %function.id,
            boot_ms,
            from_snapshot,
            "sandbox booted"
        );
        let vm = Arc::new(VmHandle::new(
            created.id,
            function.runtime,
            max_concurrent,
            boot_ms,
            from_snapshot,
            client,
        ));
        self.register_vm(&pool, &vm, take_slot);
        if let Some(snapshots) = self.core.snapshots.get() {
            snapshots.maybe_schedule(&function, &vm.id);
        }
        Ok(vm)
    }

    async fn splice_template(
        &self,
        function: &Function,
        code: &FileMap,
        max_concurrent: u32,
    ) -> Option<Arc<VmHandle>> {
        let templates = self.core.templates.get()?;
        let template = templates.acquire(function.runtime)?;
        let splice_start = Instant::now();

        let splice = async {
            template.client.reload(code.clone()).await?;
            template.client.init(function).await
        };
        match splice.await {
            Ok(()) => {
                template.set_max_concurrent(max_concurrent);
                template.set_boot_ms(splice_start.elapsed().as_millis() as u64);
                template.set_from_snapshot(false);
                template.touch();
                info!(
                    vm_id = %template.id,
                    function_id = %function.id,
                    splice_ms = template.boot_ms(),
                    "template spliced"
                );
                Some(template)
            }
            Err(e) => {
                warn!(
                    template_id = %template.id,
                    function_id = %function.id,
                    error = %e,
                    "template splice failed, stopping template"
                );
                let driver = Arc::clone(&self.core.driver);
                tokio::spawn(async move {
                    let _ = template.client.send_stop().await;
                    let _ = driver.stop(&template.id).await;
                });
                None
            }
        }
    }

    fn register_vm(&self, pool: &Arc<FunctionPool>, vm: &Arc<VmHandle>, take_slot: bool) {
        let mut inner = pool.inner.lock().unwrap();
        inner.vms.push(Arc::clone(vm));
        if take_slot {
            vm.begin_request();
            inner.total_inflight += 1;
        } else {
            vm.set_state(VmState::Idle);
        }
        if vm.has_capacity() {
            inner.ready.push(Arc::clone(vm));
            if inner.waiters > 0 {
                pool.notify.notify_one();
            }
        }
        drop(inner);
        self.core.total_vms.fetch_add(1, Ordering::SeqCst);
        self.core.metrics.record_vm_created(vm.from_snapshot());
    }

    fn global_capacity_available(&self) -> bool {
        let max = self.core.config.max_global_vms;
        max == 0 || self.core.total_vms.load(Ordering::SeqCst) < max
    }

    fn get_pool(&self, key: &str) -> Option<Arc<FunctionPool>> {
        self.core.pools.read().unwrap().get(key).cloned()
    }

    fn pool_for_function(&self, function_id: &str) -> Option<Arc<FunctionPool>> {
        let key = self.core.pool_keys.lock().unwrap().get(function_id).cloned()?;
        self.get_pool(&key)
    }

    fn stop_vm_async(&self, vm: Arc<VmHandle>, crashed: bool) {
        vm.set_state(VmState::Destroyed);
        self.core.total_vms.fetch_sub(1, Ordering::SeqCst);
        let driver = Arc::clone(&self.core.driver);
        let metrics = Arc::clone(&self.core.metrics);
        tokio::spawn(async move {
            let _ = vm.client.send_stop().await;
            if let Err(e) = driver.stop(&vm.id).await {
                warn!(vm_id = %vm.id, error = %e, "failed to stop sandbox");
            }
            if crashed {
                metrics.record_vm_crashed();
            } else {
                metrics.record_vm_stopped();
            }
        });
    }

    // --- Background ticks ---

    /// Evict idle sandboxes above the per-pool floor; optionally move
    /// long-idle sandboxes to Suspended when snapshots are configured.
    async fn cleanup_once(&self) {
        let pools: Vec<Arc<FunctionPool>> =
            self.core.pools.read().unwrap().values().cloned().collect();
        let mut to_stop: Vec<Arc<VmHandle>> = Vec::new();
        let mut to_snapshot: Vec<(Function, String)> = Vec::new();

        for pool in pools {
            let function = pool.function.lock().unwrap().clone();
            let floor = function
                .min_replicas
                .max(pool.desired_replicas.load(Ordering::SeqCst)) as usize;

            let mut inner = pool.inner.lock().unwrap();
            let mut active = inner.vms.len();
            for vm in inner.vms.iter() {
                if vm.is_busy() {
                    vm.set_state(VmState::Active);
                    continue;
                }
                if active > floor && vm.idle_for() > self.core.config.idle_ttl {
                    vm.set_state(VmState::Destroyed);
                    to_stop.push(Arc::clone(vm));
                    active -= 1;
                } else if !self.core.config.suspend_ttl.is_zero()
                    && self.core.snapshots.get().is_some()
                    && vm.state() == VmState::Idle
                    && vm.idle_for() > self.core.config.suspend_ttl
                {
                    vm.set_state(VmState::Suspended);
                    to_snapshot.push((function.clone(), vm.id.clone()));
                }
            }
            inner
                .vms
                .retain(|vm| vm.state() != VmState::Destroyed);
            inner.ready.retain(|vm| {
                vm.state() != VmState::Destroyed && vm.state() != VmState::Suspended
            });
        }

        if let Some(snapshots) = self.core.snapshots.get() {
            for (function, vm_id) in to_snapshot {
                snapshots.maybe_schedule(&function, &vm_id);
            }
        }

        if to_stop.is_empty() {
            return;
        }
        info!(count = to_stop.len(), "cleanup evicting idle sandboxes");
        let semaphore = Arc::new(Semaphore::new(STOP_WORKERS));
        let mut handles = Vec::new();
        for vm in to_stop {
            self.core.total_vms.fetch_sub(1, Ordering::SeqCst);
            let driver = Arc::clone(&self.core.driver);
            let metrics = Arc::clone(&self.core.metrics);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let _ = vm.client.send_stop().await;
                if let Err(e) = driver.stop(&vm.id).await {
                    warn!(vm_id = %vm.id, error = %e, "failed to stop idle sandbox");
                }
                metrics.record_vm_stopped();
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Ping every non-busy sandbox outside the lock; evict failures.
    async fn health_check_once(&self) {
        let pools: Vec<Arc<FunctionPool>> =
            self.core.pools.read().unwrap().values().cloned().collect();
        for pool in pools {
            let candidates: Vec<Arc<VmHandle>> = {
                let inner = pool.inner.lock().unwrap();
                inner
                    .vms
                    .iter()
                    .filter(|vm| !vm.is_busy() && vm.state() != VmState::Suspended)
                    .cloned()
                    .collect()
            };
            for vm in candidates {
                if let Err(e) = vm.client.ping().await {
                    warn!(vm_id = %vm.id, error = %e, "health check failed");
                    self.evict_vm(&pool.key, &vm, true);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_inflight_invariant(&self, pool_key: &str) {
        let pool = self.get_pool(pool_key).expect("pool exists");
        let inner = pool.inner.lock().unwrap();
        let sum: u64 = inner.vms.iter().map(|vm| vm.inflight() as u64).sum();
        assert_eq!(
            inner.total_inflight, sum,
            "pool total_inflight diverged from per-vm sum"
        );
        for vm in &inner.vms {
            let in_ready = inner.ready.iter().any(|v| Arc::ptr_eq(v, vm));
            if vm.state() != VmState::Suspended {
                assert_eq!(
                    in_ready,
                    vm.has_capacity(),
                    "ready set out of sync for {}",
                    vm.id
                );
            }
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    /// Pool-wide inflight reached the capacity policy ceiling.
    InflightLimit { inflight: u64, limit: u32 },
    /// Too many acquisitions already queued.
    QueueFull { waiters: u32, limit: u32 },
    /// Queued longer than the policy allows.
    QueueWaitTimeout { waited_ms: u64 },
    /// Lost the cold-start race with no queueing configured.
    ConcurrencyLimit,
    /// The global sandbox cap blocks creation and the pool is empty.
    GlobalVmLimit { limit: u64 },
    /// Driver create, client open, or agent init failed.
    ColdStart(String),
}

impl PoolError {
    /// Admission errors map to 429-class responses at the API surface.
    pub fn is_admission(&self) -> bool {
        !matches!(self, PoolError::ColdStart(_))
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::InflightLimit { inflight, limit } => {
                write!(f, "inflight limit reached: {} of {}", inflight, limit)
            }
            PoolError::QueueFull { waiters, limit } => {
                write!(f, "queue full: {} waiters of {}", waiters, limit)
            }
            PoolError::QueueWaitTimeout { waited_ms } => {
                write!(f, "queue wait timed out after {}ms", waited_ms)
            }
            PoolError::ConcurrencyLimit => write!(f, "concurrency limit reached"),
            PoolError::GlobalVmLimit { limit } => {
                write!(f, "global sandbox limit reached: {}", limit)
            }
            PoolError::ColdStart(msg) => write!(f, "cold start failed: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplatePoolConfig;
    use crate::driver::testing::MockDriver;
    use crate::function::testing::test_function;
    use crate::function::Runtime;

    fn code() -> FileMap {
        let mut files = FileMap::new();
        files.insert("main.py".to_string(), b"def handler(): pass".to_vec());
        files
    }

    fn pool_with(config: PoolConfig, driver: Arc<MockDriver>) -> SandboxPool {
        SandboxPool::new(
            config,
            driver as Arc<dyn SandboxDriver>,
            MetricsRegistry::new(),
        )
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn cold_start_then_warm_reuse() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let first = pool.acquire(&function, &code()).await.unwrap();
        assert!(first.cold_start);
        assert_eq!(driver.create_count(), 1);
        let first_id = first.vm.id.clone();
        pool.release(&first.pool_key, &first.vm);

        let second = pool.acquire(&function, &code()).await.unwrap();
        assert!(!second.cold_start);
        assert_eq!(second.vm.id, first_id);
        assert_eq!(driver.create_count(), 1);
        pool.release(&second.pool_key, &second.vm);
        pool.assert_inflight_invariant(&second.pool_key);
    }

    #[tokio::test]
    async fn ten_concurrent_acquires_create_once() {
        let driver = MockDriver::new();
        driver.boot_delay_ms.store(30, Ordering::SeqCst);
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;
        function.capacity.enabled = true;
        function.capacity.max_queue_wait_ms = 5000;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            let function = function.clone();
            handles.push(tokio::spawn(async move {
                let acquired = pool.acquire(&function, &code()).await?;
                // Hold briefly, then hand the slot to the next waiter.
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(&acquired.pool_key, &acquired.vm);
                Ok::<_, PoolError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(driver.create_count(), 1);
        assert_eq!(pool.total_vms(), 1);
        pool.assert_inflight_invariant("fn_a");
    }

    #[tokio::test]
    async fn code_hash_change_evicts_all_warm_vms() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        // Build three distinct sandboxes by holding the first two.
        let a = pool.acquire(&function, &code()).await.unwrap();
        let b = pool.acquire(&function, &code()).await.unwrap();
        let c = pool.acquire(&function, &code()).await.unwrap();
        let old_ids: Vec<String> =
            vec![a.vm.id.clone(), b.vm.id.clone(), c.vm.id.clone()];
        assert_eq!(driver.create_count(), 3);
        pool.release(&a.pool_key, &a.vm);
        pool.release(&b.pool_key, &b.vm);
        pool.release(&c.pool_key, &c.vm);

        let mut updated = function.clone();
        updated.code_hash = "v2".to_string();
        let fresh = pool.acquire(&updated, &code()).await.unwrap();
        assert!(fresh.cold_start);
        assert!(!old_ids.contains(&fresh.vm.id));
        assert_eq!(driver.create_count(), 4);

        wait_until(|| driver.stop_count() == 3).await;
        let stopped = driver.stopped_ids.lock().unwrap().clone();
        for id in &old_ids {
            assert!(stopped.contains(id), "{} was not stopped", id);
        }
        assert_eq!(pool.total_vms(), 1);
    }

    #[tokio::test]
    async fn template_splice_serves_cold_start() {
        let driver = MockDriver::new();
        let templates = TemplatePool::new(
            TemplatePoolConfig {
                enabled: true,
                pool_size: 1,
                refill_interval: Duration::from_secs(3600),
                runtimes: vec![Runtime::Python],
            },
            driver.clone() as Arc<dyn SandboxDriver>,
        );
        templates.start().await;
        assert_eq!(driver.create_count(), 1);

        let pool = SandboxPool::new(
            PoolConfig::default(),
            driver.clone() as Arc<dyn SandboxDriver>,
            MetricsRegistry::new(),
        )
        .with_templates(Arc::clone(&templates));

        let acquired = pool.acquire(&test_function("fn_a"), &code()).await.unwrap();
        assert!(acquired.cold_start);
        // No new driver boot: the template was spliced.
        assert_eq!(driver.create_count(), 1);
        assert_eq!(templates.len(Runtime::Python), 0);
    }

    #[tokio::test]
    async fn template_splice_failure_falls_back_to_full_create() {
        let driver = MockDriver::new();
        driver.agents_fail_reload.store(true, Ordering::SeqCst);
        let templates = TemplatePool::new(
            TemplatePoolConfig {
                enabled: true,
                pool_size: 1,
                refill_interval: Duration::from_secs(3600),
                runtimes: vec![Runtime::Python],
            },
            driver.clone() as Arc<dyn SandboxDriver>,
        );
        templates.start().await;
        let template_id = {
            let t = templates.acquire(Runtime::Python).unwrap();
            let id = t.id.clone();
            templates.give_back(Runtime::Python, t);
            id
        };

        let pool = SandboxPool::new(
            PoolConfig::default(),
            driver.clone() as Arc<dyn SandboxDriver>,
            MetricsRegistry::new(),
        )
        .with_templates(Arc::clone(&templates));

        let acquired = pool.acquire(&test_function("fn_a"), &code()).await.unwrap();
        assert!(acquired.cold_start);
        assert_ne!(acquired.vm.id, template_id);
        // Template boot + fallback boot.
        assert_eq!(driver.create_count(), 2);
        assert_eq!(templates.len(Runtime::Python), 0);
        wait_until(|| driver.stop_count() == 1).await;
        assert!(driver.stopped_ids.lock().unwrap().contains(&template_id));
    }

    #[tokio::test]
    async fn inflight_limit_rejects_when_pool_cannot_grow() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;
        function.capacity.enabled = true;
        function.capacity.max_inflight = 1;

        let held = pool.acquire(&function, &code()).await.unwrap();
        let err = pool.acquire(&function, &code()).await.unwrap_err();
        assert!(matches!(err, PoolError::InflightLimit { inflight: 1, limit: 1 }));
        assert!(err.is_admission());
        pool.release(&held.pool_key, &held.vm);
    }

    #[tokio::test]
    async fn queue_full_rejects_excess_waiters() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;
        function.capacity.enabled = true;
        function.capacity.max_queue_depth = 1;
        function.capacity.max_queue_wait_ms = 5000;

        let held = pool.acquire(&function, &code()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let function = function.clone();
            tokio::spawn(async move { pool.acquire(&function, &code()).await })
        };
        wait_until(|| {
            pool.pool_stats("fn_a")
                .map(|s| s.queue_depth == 1)
                .unwrap_or(false)
        })
        .await;

        let err = pool.acquire(&function, &code()).await.unwrap_err();
        assert!(matches!(err, PoolError::QueueFull { waiters: 1, limit: 1 }));

        pool.release(&held.pool_key, &held.vm);
        let handed_over = waiter.await.unwrap().unwrap();
        assert!(!handed_over.cold_start);
        pool.release(&handed_over.pool_key, &handed_over.vm);
    }

    #[tokio::test]
    async fn queue_wait_timeout_fires_after_deadline() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;
        function.capacity.enabled = true;
        function.capacity.max_queue_wait_ms = 80;

        let held = pool.acquire(&function, &code()).await.unwrap();
        let start = Instant::now();
        let err = pool.acquire(&function, &code()).await.unwrap_err();
        assert!(matches!(err, PoolError::QueueWaitTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(80));

        let stats = pool.pool_stats("fn_a").unwrap();
        assert!(stats.last_queue_wait_ms >= 80);
        pool.release(&held.pool_key, &held.vm);
    }

    #[tokio::test]
    async fn lost_creation_race_without_queueing_reports_concurrency_limit() {
        let driver = MockDriver::new();
        driver.boot_delay_ms.store(50, Ordering::SeqCst);
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;

        let code_a = code();
        let code_b = code();
        let (a, b) = tokio::join!(
            pool.acquire(&function, &code_a),
            pool.acquire(&function, &code_b)
        );
        let results = [a, b];
        let won = results.iter().filter(|r| r.is_ok()).count();
        let limited = results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::ConcurrencyLimit)))
            .count();
        assert_eq!(won, 1);
        assert_eq!(limited, 1);
        assert_eq!(driver.create_count(), 1);
    }

    #[tokio::test]
    async fn global_vm_limit_fails_fast_on_empty_pool() {
        let driver = MockDriver::new();
        let config = PoolConfig {
            max_global_vms: 1,
            ..PoolConfig::default()
        };
        let pool = pool_with(config, driver.clone());

        let held = pool.acquire(&test_function("fn_a"), &code()).await.unwrap();
        let err = pool
            .acquire(&test_function("fn_b"), &code())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::GlobalVmLimit { limit: 1 }));
        pool.release(&held.pool_key, &held.vm);
    }

    #[tokio::test]
    #[should_panic(expected = "double release")]
    async fn double_release_panics() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");
        let acquired = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&acquired.pool_key, &acquired.vm);
        pool.release(&acquired.pool_key, &acquired.vm);
    }

    #[tokio::test]
    async fn instance_concurrency_shares_one_sandbox() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.instance_concurrency = 2;

        let a = pool.acquire(&function, &code()).await.unwrap();
        let b = pool.acquire(&function, &code()).await.unwrap();
        assert_eq!(a.vm.id, b.vm.id);
        assert!(!b.cold_start);
        assert_eq!(driver.create_count(), 1);
        assert_eq!(a.vm.inflight(), 2);
        pool.assert_inflight_invariant(&a.pool_key);

        pool.release(&a.pool_key, &a.vm);
        pool.release(&b.pool_key, &b.vm);
        pool.assert_inflight_invariant(&a.pool_key);
    }

    #[tokio::test]
    async fn isolating_driver_forces_single_concurrency() {
        let driver = MockDriver::isolating("/var/nova/snapshots");
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.instance_concurrency = 4;

        let a = pool.acquire(&function, &code()).await.unwrap();
        assert_eq!(a.vm.max_concurrent(), 1);
        let b = pool.acquire(&function, &code()).await.unwrap();
        assert_ne!(a.vm.id, b.vm.id);
        assert_eq!(driver.create_count(), 2);
    }

    #[tokio::test]
    async fn warm_takes_are_lifo() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        let b = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        pool.release(&b.pool_key, &b.vm);

        // b was released last, so it is the cache-warm top of the stack.
        let next = pool.acquire(&function, &code()).await.unwrap();
        assert_eq!(next.vm.id, b.vm.id);
        pool.release(&next.pool_key, &next.vm);
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_vms_above_floor() {
        let driver = MockDriver::new();
        let config = PoolConfig {
            idle_ttl: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let pool = pool_with(config, driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        let b = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        pool.release(&b.pool_key, &b.vm);
        assert_eq!(pool.total_vms(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.cleanup_once().await;

        assert_eq!(pool.total_vms(), 0);
        assert_eq!(driver.stop_count(), 2);
        let stats = pool.pool_stats("fn_a").unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn cleanup_honors_desired_replica_floor() {
        let driver = MockDriver::new();
        let config = PoolConfig {
            idle_ttl: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let pool = pool_with(config, driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        let b = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        pool.release(&b.pool_key, &b.vm);
        pool.set_desired_replicas("fn_a", 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.cleanup_once().await;

        assert_eq!(pool.total_vms(), 1);
        assert_eq!(pool.pool_stats("fn_a").unwrap().total, 1);
    }

    #[tokio::test]
    async fn health_check_evicts_unresponsive_vms() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);

        driver.agents_drop_pings.store(true, Ordering::SeqCst);
        // Existing fake agents read the flag at dial time, so the already
        // pooled sandbox starts failing pings immediately.
        pool.health_check_once().await;

        assert_eq!(pool.pool_stats("fn_a").unwrap().total, 0);
        wait_until(|| driver.stop_count() == 1).await;
    }

    #[tokio::test]
    async fn ensure_ready_prewarms_to_min_replicas() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.min_replicas = 3;

        pool.ensure_ready(&function, &code()).await;
        let stats = pool.pool_stats("fn_a").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(driver.create_count(), 3);
        pool.assert_inflight_invariant("fn_a");

        // Warm takes now hit the pre-warmed stack.
        let acquired = pool.acquire(&function, &code()).await.unwrap();
        assert!(!acquired.cold_start);
        pool.release(&acquired.pool_key, &acquired.vm);
    }

    #[tokio::test]
    async fn desired_replicas_survive_pool_recreation() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        pool.set_desired_replicas("fn_a", 2);

        let mut updated = function.clone();
        updated.code_hash = "v2".to_string();
        let b = pool.acquire(&updated, &code()).await.unwrap();
        pool.release(&b.pool_key, &b.vm);

        assert_eq!(pool.pool_stats("fn_a").unwrap().desired_replicas, 2);
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let mut function = test_function("fn_a");
        function.max_replicas = 1;
        function.capacity.enabled = true;
        function.capacity.max_queue_wait_ms = 5000;

        let held = pool.acquire(&function, &code()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let function = function.clone();
            tokio::spawn(async move { pool.acquire(&function, &code()).await })
        };
        wait_until(|| {
            pool.pool_stats("fn_a")
                .map(|s| s.queue_depth == 1)
                .unwrap_or(false)
        })
        .await;

        pool.release(&held.pool_key, &held.vm);
        let woken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap()
            .unwrap();
        assert!(!woken.cold_start);
        assert_eq!(woken.vm.id, held.vm.id);
        pool.release(&woken.pool_key, &woken.vm);
    }

    #[tokio::test]
    async fn evicted_vm_is_removed_and_stopped() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        pool.evict_vm(&a.pool_key, &a.vm, true);

        assert_eq!(pool.pool_stats("fn_a").unwrap().total, 0);
        assert_eq!(pool.pool_stats("fn_a").unwrap().total_inflight, 0);
        assert_eq!(pool.total_vms(), 0);
        wait_until(|| driver.stop_count() == 1).await;
        pool.assert_inflight_invariant(&a.pool_key);
    }

    #[tokio::test]
    async fn shared_pools_group_identical_profiles() {
        let driver = MockDriver::new();
        let config = PoolConfig {
            shared_pools: true,
            ..PoolConfig::default()
        };
        let pool = pool_with(config, driver.clone());
        let fn_a = test_function("fn_a");
        let fn_b = test_function("fn_b");
        assert_eq!(pool.key_for(&fn_a), pool.key_for(&fn_b));

        let a = pool.acquire(&fn_a, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        let b = pool.acquire(&fn_b, &code()).await.unwrap();
        assert_eq!(b.vm.id, a.vm.id);
        assert_eq!(driver.create_count(), 1);
        pool.release(&b.pool_key, &b.vm);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let driver = MockDriver::new();
        let pool = pool_with(PoolConfig::default(), driver.clone());
        let function = test_function("fn_a");

        let a = pool.acquire(&function, &code()).await.unwrap();
        pool.release(&a.pool_key, &a.vm);
        let b = pool.acquire(&test_function("fn_b"), &code()).await.unwrap();
        pool.release(&b.pool_key, &b.vm);

        pool.shutdown().await;
        assert_eq!(pool.total_vms(), 0);
        assert_eq!(driver.stop_count(), 2);
    }
}
