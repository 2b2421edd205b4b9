use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::agent::AgentError;
use crate::function::{FileMap, Function};
use crate::id;
use crate::metrics::MetricsRegistry;
use crate::pool::{PoolError, SandboxPool};
use crate::protocol::StreamPayload;

/// Persisted record of one invocation.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub request_id: String,
    pub function_id: String,
    pub sandbox_id: String,
    pub cold_start: bool,
    pub duration_ms: u64,
    pub queue_wait_ms: u64,
    pub error: Option<String>,
    pub started_at: SystemTime,
}

/// Sink for invocation records. The production implementation lives in the
/// metadata service; an in-memory ring is provided for embedding and tests.
#[async_trait]
pub trait InvocationStore: Send + Sync {
    async fn append(&self, record: InvocationRecord);
}

/// Bounded in-memory store, dropping the oldest record when full.
pub struct MemoryInvocationStore {
    records: Mutex<VecDeque<InvocationRecord>>,
    capacity: usize,
}

impl MemoryInvocationStore {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        })
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn append(&self, record: InvocationRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Result of one invocation, as handed to the API surface.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: String,
    pub output: Value,
    /// User-level error from the handler. The sandbox stays healthy.
    pub error: Option<String>,
    pub duration_ms: u64,
    pub queue_wait_ms: u64,
    pub cold_start: bool,
    pub sandbox_id: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Orchestrates one invocation: acquire a sandbox, execute, release or evict,
/// record metrics, persist the invocation record.
pub struct Executor {
    pool: SandboxPool,
    metrics: Arc<MetricsRegistry>,
    store: Arc<dyn InvocationStore>,
}

impl Executor {
    pub fn new(
        pool: SandboxPool,
        metrics: Arc<MetricsRegistry>,
        store: Arc<dyn InvocationStore>,
    ) -> Self {
        Self {
            pool,
            metrics,
            store,
        }
    }

    pub async fn invoke(
        &self,
        function: &Function,
        code: &FileMap,
        input: Value,
    ) -> Result<Invocation, ExecutorError> {
        self.invoke_traced(function, code, input, None, None).await
    }

    pub async fn invoke_traced(
        &self,
        function: &Function,
        code: &FileMap,
        input: Value,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Result<Invocation, ExecutorError> {
        let request_id = id::generate_id(id::REQUEST_PREFIX);
        let started_at = SystemTime::now();
        let started = Instant::now();

        let acquired = self
            .pool
            .acquire(function, code)
            .await
            .map_err(ExecutorError::Pool)?;

        let result = acquired
            .vm
            .client
            .execute(
                &request_id,
                input,
                Duration::from_secs(function.timeout_s),
                traceparent,
                tracestate,
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => {
                self.pool.release(&acquired.pool_key, &acquired.vm);
                self.metrics
                    .record_invocation(&function.id, acquired.cold_start, duration_ms);
                self.store
                    .append(InvocationRecord {
                        request_id: request_id.clone(),
                        function_id: function.id.clone(),
                        sandbox_id: acquired.vm.id.clone(),
                        cold_start: acquired.cold_start,
                        duration_ms,
                        queue_wait_ms: acquired.queue_wait_ms,
                        error: resp.error.clone(),
                        started_at,
                    })
                    .await;
                info!(
                    request_id = %request_id,
                    function_id = %function.id,
                    sandbox_id = %acquired.vm.id,
                    cold_start = acquired.cold_start,
                    duration_ms,
                    "invocation complete"
                );
                Ok(Invocation {
                    request_id,
                    output: resp.output,
                    error: resp.error,
                    duration_ms,
                    queue_wait_ms: acquired.queue_wait_ms,
                    cold_start: acquired.cold_start,
                    sandbox_id: acquired.vm.id.clone(),
                    stdout: resp.stdout,
                    stderr: resp.stderr,
                })
            }
            Err(e) => {
                // The client already retried broken connections; whatever is
                // left means the sandbox cannot be trusted with more work.
                warn!(
                    request_id = %request_id,
                    sandbox_id = %acquired.vm.id,
                    error = %e,
                    "execute failed, evicting sandbox"
                );
                self.pool.evict_vm(&acquired.pool_key, &acquired.vm, true);
                self.metrics
                    .record_invocation(&function.id, acquired.cold_start, duration_ms);
                self.store
                    .append(InvocationRecord {
                        request_id,
                        function_id: function.id.clone(),
                        sandbox_id: acquired.vm.id.clone(),
                        cold_start: acquired.cold_start,
                        duration_ms,
                        queue_wait_ms: acquired.queue_wait_ms,
                        error: Some(e.to_string()),
                        started_at,
                    })
                    .await;
                Err(ExecutorError::Execute(e))
            }
        }
    }

    /// Streaming invocation. Chunks flow through the returned stream; the
    /// sandbox is released (or evicted) when the stream ends.
    pub async fn invoke_stream(
        &self,
        function: &Function,
        code: &FileMap,
        input: Value,
    ) -> Result<ReceiverStream<Result<StreamPayload, AgentError>>, ExecutorError> {
        let request_id = id::generate_id(id::REQUEST_PREFIX);
        let started = Instant::now();

        let acquired = self
            .pool
            .acquire(function, code)
            .await
            .map_err(ExecutorError::Pool)?;

        let mut chunk_rx = match acquired
            .vm
            .client
            .execute_stream(
                &request_id,
                input,
                Duration::from_secs(function.timeout_s),
                None,
                None,
            )
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.pool.evict_vm(&acquired.pool_key, &acquired.vm, true);
                return Err(ExecutorError::Execute(e));
            }
        };

        let (out_tx, out_rx) = mpsc::channel(32);
        let pool = self.pool.clone();
        let metrics = Arc::clone(&self.metrics);
        let function_id = function.id.clone();
        tokio::spawn(async move {
            let mut failed = false;
            while let Some(chunk) = chunk_rx.recv().await {
                let done = match &chunk {
                    Ok(payload) => payload.is_last,
                    Err(_) => {
                        failed = true;
                        true
                    }
                };
                if out_tx.send(chunk).await.is_err() {
                    // Receiver dropped mid-stream; the sandbox state is
                    // unknown, treat it like a failure.
                    failed = true;
                    break;
                }
                if done {
                    break;
                }
            }
            let duration_ms = started.elapsed().as_millis() as u64;
            metrics.record_invocation(&function_id, acquired.cold_start, duration_ms);
            if failed {
                pool.evict_vm(&acquired.pool_key, &acquired.vm, true);
            } else {
                pool.release(&acquired.pool_key, &acquired.vm);
            }
        });
        Ok(ReceiverStream::new(out_rx))
    }
}

#[derive(Debug)]
pub enum ExecutorError {
    /// Admission or cold-start failure; nothing executed.
    Pool(PoolError),
    /// The sandbox failed mid-execution and was evicted.
    Execute(AgentError),
}

impl ExecutorError {
    /// Whether the caller should surface a 429-class rejection.
    pub fn is_admission(&self) -> bool {
        matches!(self, ExecutorError::Pool(e) if e.is_admission())
    }
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::Pool(e) => write!(f, "acquisition failed: {}", e),
            ExecutorError::Execute(e) => write!(f, "execution failed: {}", e),
        }
    }
}

impl std::error::Error for ExecutorError {}
