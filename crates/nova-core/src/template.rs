use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::config::TemplatePoolConfig;
use crate::driver::SandboxDriver;
use crate::function::{
    AutoscalePolicy, CapacityPolicy, ExecutionMode, FileMap, Function, ResourceLimits, Runtime,
};
use crate::id;
use crate::vm::VmHandle;

/// Per-runtime LIFO stack of warm templates.
///
/// LIFO keeps the most recently booted (cache-warm) template on top.
struct TemplateEntry {
    stack: Mutex<Vec<Arc<VmHandle>>>,
    len: AtomicUsize,
}

impl TemplateEntry {
    fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    fn pop(&self) -> Option<Arc<VmHandle>> {
        let popped = self.stack.lock().unwrap().pop();
        if popped.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    fn push(&self, vm: Arc<VmHandle>) {
        self.stack.lock().unwrap().push(vm);
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    fn drain(&self) -> Vec<Arc<VmHandle>> {
        let mut stack = self.stack.lock().unwrap();
        self.len.store(0, Ordering::SeqCst);
        std::mem::take(&mut *stack)
    }
}

/// Pool of pre-warmed runtime zygotes.
///
/// Templates boot the runtime image with no user code; the sandbox pool
/// splices real code in via the agent's reload + init sequence, cutting cold
/// starts by an order of magnitude over a full boot.
pub struct TemplatePool {
    config: TemplatePoolConfig,
    driver: Arc<dyn SandboxDriver>,
    entries: Arc<HashMap<Runtime, TemplateEntry>>,
    refill_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TemplatePool {
    pub fn new(config: TemplatePoolConfig, driver: Arc<dyn SandboxDriver>) -> Arc<Self> {
        let entries = config
            .runtimes
            .iter()
            .map(|rt| (*rt, TemplateEntry::new()))
            .collect();
        Arc::new(Self {
            config,
            driver,
            entries: Arc::new(entries),
            refill_task: Mutex::new(None),
        })
    }

    /// Fill every runtime to its target and start the periodic refill loop.
    pub async fn start(&self) {
        if !self.config.enabled {
            return;
        }
        refill_all(&self.config, &self.driver, &self.entries).await;

        let config = self.config.clone();
        let driver = Arc::clone(&self.driver);
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.refill_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the initial fill already ran.
            interval.tick().await;
            loop {
                interval.tick().await;
                refill_all(&config, &driver, &entries).await;
            }
        });
        *self.refill_task.lock().unwrap() = Some(handle);
    }

    /// Pop the most recently warmed template for `runtime`.
    ///
    /// `None` means the caller falls back to a full cold create.
    pub fn acquire(&self, runtime: Runtime) -> Option<Arc<VmHandle>> {
        let vm = self.entries.get(&runtime)?.pop();
        if let Some(ref vm) = vm {
            info!(template_id = %vm.id, runtime = %runtime, "template checked out");
        }
        vm
    }

    /// Return a template that was checked out but not consumed.
    ///
    /// Only valid for templates whose splice never started; a template that
    /// failed mid-splice is in an unknown state and must be stopped instead.
    pub fn give_back(&self, runtime: Runtime, vm: Arc<VmHandle>) {
        match self.entries.get(&runtime) {
            Some(entry) => entry.push(vm),
            None => warn!(runtime = %runtime, "returned template for unmanaged runtime"),
        }
    }

    pub fn len(&self, runtime: Runtime) -> usize {
        self.entries
            .get(&runtime)
            .map(|e| e.len.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, runtime: Runtime) -> bool {
        self.len(runtime) == 0
    }

    /// Stop the refill loop and every warm template.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.refill_task.lock().unwrap().take() {
            handle.abort();
        }
        let mut stops = Vec::new();
        for entry in self.entries.values() {
            for vm in entry.drain() {
                let driver = Arc::clone(&self.driver);
                stops.push(tokio::spawn(async move {
                    let _ = vm.client.send_stop().await;
                    if let Err(e) = driver.stop(&vm.id).await {
                        warn!(template_id = %vm.id, error = %e, "failed to stop template");
                    }
                }));
            }
        }
        for stop in stops {
            let _ = stop.await;
        }
        info!("template pool shut down");
    }
}

async fn refill_all(
    config: &TemplatePoolConfig,
    driver: &Arc<dyn SandboxDriver>,
    entries: &HashMap<Runtime, TemplateEntry>,
) {
    for (runtime, entry) in entries {
        while entry.len.load(Ordering::SeqCst) < config.pool_size {
            match boot_template(driver, *runtime).await {
                Ok(vm) => entry.push(vm),
                Err(e) => {
                    warn!(runtime = %runtime, error = %e, "template boot failed, deferring refill");
                    break;
                }
            }
        }
    }
}

/// Boot one zygote: create with a sentinel function carrying no code, then
/// init the agent so the runtime is loaded and resident.
async fn boot_template(
    driver: &Arc<dyn SandboxDriver>,
    runtime: Runtime,
) -> Result<Arc<VmHandle>, TemplateError> {
    let sentinel = sentinel_function(runtime);
    let start = Instant::now();

    let created = driver
        .create(&sentinel, &FileMap::new())
        .await
        .map_err(|e| TemplateError::Boot(e.to_string()))?;
    let client = driver.open_client(&created);

    if let Err(e) = client.init(&sentinel).await {
        let _ = driver.stop(&created.id).await;
        return Err(TemplateError::Init(e.to_string()));
    }

    let boot_ms = start.elapsed().as_millis() as u64;
    info!(template_id = %created.id, runtime = %runtime, boot_ms, "template ready");
    Ok(Arc::new(VmHandle::new(
        created.id, runtime, 1, boot_ms, false, client,
    )))
}

/// Sentinel function a template boots under: runtime only, no user code.
fn sentinel_function(runtime: Runtime) -> Function {
    Function {
        id: id::template_function_id(runtime.as_str()),
        name: id::template_function_id(runtime.as_str()),
        version: 0,
        runtime,
        handler: String::new(),
        code_hash: String::new(),
        env_vars: HashMap::new(),
        memory_mb: 256,
        timeout_s: 30,
        resources: ResourceLimits::default(),
        min_replicas: 0,
        max_replicas: 0,
        instance_concurrency: 1,
        capacity: CapacityPolicy::default(),
        autoscale: AutoscalePolicy::default(),
        mode: ExecutionMode::Process,
    }
}

#[derive(Debug)]
pub enum TemplateError {
    Boot(String),
    Init(String),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Boot(msg) => write!(f, "template boot failed: {}", msg),
            TemplateError::Init(msg) => write!(f, "template init failed: {}", msg),
        }
    }
}

impl std::error::Error for TemplateError {}
