use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nova_core::function::Function;
use nova_core::metrics::{FunctionTotals, MetricsRegistry, ScaleDecision};
use nova_core::pool::{PoolStats, SandboxPool};
use tracing::{debug, error, info};

/// Smoothing factor for every autoscaling signal.
const EMA_ALPHA: f64 = 0.3;
/// Hour-of-day slots for the predictive pre-warm ring.
const HOURLY_SLOTS: usize = 24;
/// Next-hour to current-hour rate ratio that triggers predictive pre-warm.
const PREDICTIVE_RATIO: f64 = 1.5;

/// Autoscaler timing and step knobs. Per-function thresholds live on the
/// function's autoscale policy.
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub interval: Duration,
    pub target_utilization: f64,
    /// Metric deltas required before the load-driven target applies.
    pub min_sample_count: u32,
    pub cooldown_up: Duration,
    pub cooldown_down: Duration,
    /// Continuous low load required before any scale-down.
    pub scale_down_stabilization: Duration,
    pub scale_up_step_max: u32,
    pub scale_down_step: u32,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            target_utilization: 0.7,
            min_sample_count: 3,
            cooldown_up: Duration::from_secs(15),
            cooldown_down: Duration::from_secs(60),
            scale_down_stabilization: Duration::from_secs(90),
            scale_up_step_max: 4,
            scale_down_step: 1,
        }
    }
}

impl AutoscalerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let num = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };
        Self {
            interval: secs("NOVA_AUTOSCALE_INTERVAL_S", d.interval),
            target_utilization: std::env::var("NOVA_AUTOSCALE_TARGET_UTILIZATION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.target_utilization),
            min_sample_count: num("NOVA_AUTOSCALE_MIN_SAMPLES", d.min_sample_count),
            cooldown_up: secs("NOVA_AUTOSCALE_COOLDOWN_UP_S", d.cooldown_up),
            cooldown_down: secs("NOVA_AUTOSCALE_COOLDOWN_DOWN_S", d.cooldown_down),
            scale_down_stabilization: secs(
                "NOVA_AUTOSCALE_STABILIZATION_S",
                d.scale_down_stabilization,
            ),
            scale_up_step_max: num("NOVA_AUTOSCALE_UP_STEP_MAX", d.scale_up_step_max),
            scale_down_step: num("NOVA_AUTOSCALE_DOWN_STEP", d.scale_down_step),
        }
    }
}

/// What the autoscaler reads from and writes to. The sandbox pool is the
/// production implementation.
pub trait ScaleTarget: Send + Sync {
    fn pool_stats(&self, function_id: &str) -> Option<PoolStats>;
    fn set_desired_replicas(&self, function_id: &str, desired: u32);
}

impl ScaleTarget for SandboxPool {
    fn pool_stats(&self, function_id: &str) -> Option<PoolStats> {
        SandboxPool::pool_stats(self, function_id)
    }

    fn set_desired_replicas(&self, function_id: &str, desired: u32) {
        SandboxPool::set_desired_replicas(self, function_id, desired)
    }
}

struct FunctionScaleState {
    ema_rate: f64,
    ema_latency_ms: f64,
    ema_cold_pct: f64,
    ema_concurrency: f64,
    samples: u32,
    last_totals: FunctionTotals,
    last_tick: Instant,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    low_load_since: Option<Instant>,
    hourly_rates: [f64; HOURLY_SLOTS],
}

impl FunctionScaleState {
    fn new() -> Self {
        Self {
            ema_rate: 0.0,
            ema_latency_ms: 0.0,
            ema_cold_pct: 0.0,
            ema_concurrency: 0.0,
            samples: 0,
            last_totals: FunctionTotals::default(),
            last_tick: Instant::now(),
            last_scale_up: None,
            last_scale_down: None,
            low_load_since: None,
            hourly_rates: [0.0; HOURLY_SLOTS],
        }
    }
}

fn ema(prev: f64, current: f64, first: bool) -> f64 {
    if first {
        current
    } else {
        EMA_ALPHA * current + (1.0 - EMA_ALPHA) * prev
    }
}

fn current_hour() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| ((d.as_secs() / 3600) % HOURLY_SLOTS as u64) as usize)
        .unwrap_or(0)
}

struct ScalerInner {
    config: AutoscalerConfig,
    target: Arc<dyn ScaleTarget>,
    metrics: Arc<MetricsRegistry>,
    functions: Mutex<HashMap<String, Function>>,
    states: Mutex<HashMap<String, FunctionScaleState>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Per-function EMA-driven autoscaler. Cheap to clone.
///
/// Every tick it reads pool statistics and metric deltas, smooths the
/// signals, derives a load target from Little's Law, applies the scale-up
/// and scale-down rules with their cooldowns, folds in hourly predictive
/// pre-warm, clamps, and stores the result through the scale target.
/// Decisions run in one loop, so they are serialized per function.
#[derive(Clone)]
pub struct Autoscaler {
    inner: Arc<ScalerInner>,
}

impl Autoscaler {
    pub fn new(
        config: AutoscalerConfig,
        target: Arc<dyn ScaleTarget>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ScalerInner {
                config,
                target,
                metrics,
                functions: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Track a function. Only functions with an enabled policy are evaluated.
    pub fn register_function(&self, function: Function) {
        self.inner
            .functions
            .lock()
            .unwrap()
            .insert(function.id.clone(), function);
    }

    pub fn deregister_function(&self, function_id: &str) {
        self.inner.functions.lock().unwrap().remove(function_id);
        self.inner.states.lock().unwrap().remove(function_id);
    }

    pub fn start(&self) {
        let scaler = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scaler.inner.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let tick = scaler.clone();
                if let Err(e) = tokio::spawn(async move { tick.tick() }).await {
                    error!(error = %e, "autoscaler tick panicked");
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// One evaluation pass over every registered function.
    pub fn tick(&self) {
        let functions: Vec<Function> = self
            .inner
            .functions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let hour = current_hour();
        for function in functions {
            if function.autoscale.enabled {
                self.evaluate_at(&function, hour);
            }
        }
    }

    fn evaluate_at(&self, function: &Function, hour: usize) {
        let policy = &function.autoscale;
        let config = &self.inner.config;
        let stats = self.inner.target.pool_stats(&function.id).unwrap_or_default();
        let totals = self.inner.metrics.function_totals(&function.id);

        let mut states = self.inner.states.lock().unwrap();
        let state = states
            .entry(function.id.clone())
            .or_insert_with(FunctionScaleState::new);
        let now = Instant::now();
        let first = state.samples == 0;

        // Signal deltas since the last tick.
        let dt = now
            .duration_since(state.last_tick)
            .as_secs_f64()
            .max(0.001);
        let delta = totals
            .invocations
            .saturating_sub(state.last_totals.invocations);
        let delta_cold = totals
            .cold_starts
            .saturating_sub(state.last_totals.cold_starts);
        let delta_latency = totals
            .latency_total_ms
            .saturating_sub(state.last_totals.latency_total_ms);
        let rate = delta as f64 / dt;

        state.ema_rate = ema(state.ema_rate, rate, first);
        if delta > 0 {
            state.ema_latency_ms = ema(
                state.ema_latency_ms,
                delta_latency as f64 / delta as f64,
                first,
            );
            state.ema_cold_pct = ema(
                state.ema_cold_pct,
                delta_cold as f64 * 100.0 / delta as f64,
                first,
            );
        }
        let concurrency = stats.total_inflight as f64 / stats.total.max(1) as f64;
        state.ema_concurrency = ema(state.ema_concurrency, concurrency, first);
        state.samples += 1;
        state.last_totals = totals;
        state.last_tick = now;

        // Load-driven target (Little's Law), once enough deltas accumulated.
        let desired_by_load = if state.samples >= config.min_sample_count {
            let demand = state.ema_rate * (state.ema_latency_ms / 1000.0);
            (demand / (function.concurrency() as f64 * config.target_utilization)).ceil()
                as u32
        } else {
            0
        };

        let current = stats.desired_replicas.max(function.min_replicas);
        let queue_wait_est = (stats.last_queue_wait_ms as f64)
            .max(stats.queue_depth as f64 * state.ema_latency_ms / stats.total.max(1) as f64);

        let scale_up_signal = stats.queue_depth > policy.queue_depth_threshold
            || queue_wait_est > policy.queue_wait_ms_threshold as f64
            || state.ema_cold_pct > policy.cold_start_pct_threshold
            || state.ema_latency_ms > policy.avg_latency_ms_threshold
            || state.ema_concurrency > policy.target_concurrency
            || desired_by_load > current;

        let mut new_desired = current;
        let mut decision = None;

        if scale_up_signal {
            state.low_load_since = None;
            let cooled = state
                .last_scale_up
                .map(|t| now.duration_since(t) >= config.cooldown_up)
                .unwrap_or(true);
            if cooled {
                let step = (stats.queue_depth / 2)
                    .max(desired_by_load.saturating_sub(current))
                    .min(config.scale_up_step_max)
                    .max(1);
                new_desired = current + step;
                state.last_scale_up = Some(now);
                decision = Some(ScaleDecision::Up);
            }
        } else {
            let idle_pct = if stats.total > 0 {
                stats.idle as f64 * 100.0 / stats.total as f64
            } else {
                0.0
            };
            let low_load = idle_pct > policy.idle_pct_threshold
                || (stats.queue_depth == 0
                    && state.ema_concurrency < 0.5 * policy.target_concurrency);
            if low_load {
                let since = *state.low_load_since.get_or_insert(now);
                let stabilized =
                    now.duration_since(since) >= config.scale_down_stabilization;
                let cooled = state
                    .last_scale_down
                    .map(|t| now.duration_since(t) >= config.cooldown_down)
                    .unwrap_or(true);
                if stabilized && cooled {
                    let floor = function.min_replicas.max(desired_by_load);
                    let candidate = current
                        .saturating_sub(config.scale_down_step)
                        .max(floor);
                    if candidate < current {
                        new_desired = candidate;
                        state.last_scale_down = Some(now);
                        decision = Some(ScaleDecision::Down);
                    }
                }
            } else {
                state.low_load_since = None;
            }
        }

        // Hourly predictive pre-warm: lift the target when the next hour
        // historically runs much hotter than this one.
        state.hourly_rates[hour] = ema(state.hourly_rates[hour], rate, state.hourly_rates[hour] == 0.0);
        let current_hour_rate = state.hourly_rates[hour];
        let next_hour_rate = state.hourly_rates[(hour + 1) % HOURLY_SLOTS];
        let mut predictive = false;
        if current_hour_rate > 0.0 && new_desired > 0 {
            let ratio = next_hour_rate / current_hour_rate;
            if ratio > PREDICTIVE_RATIO {
                let lifted = ((new_desired as f64) * ratio).ceil() as u32;
                if lifted > new_desired {
                    new_desired = lifted;
                    predictive = true;
                }
            }
        }

        let max = if function.max_replicas > 0 {
            function.max_replicas
        } else {
            u32::MAX
        };
        new_desired = new_desired.clamp(function.min_replicas, max);
        drop(states);

        if new_desired != stats.desired_replicas {
            info!(
                function_id = %function.id,
                from = stats.desired_replicas,
                to = new_desired,
                ?decision,
                predictive,
                "autoscaler updating desired replicas"
            );
            self.inner.target.set_desired_replicas(&function.id, new_desired);
            if let Some(decision) = decision {
                self.inner.metrics.record_scale_decision(decision);
            }
            if predictive {
                self.inner.metrics.record_scale_decision(ScaleDecision::Predictive);
            }
        } else {
            debug!(function_id = %function.id, desired = new_desired, "autoscaler steady");
        }
    }
}
