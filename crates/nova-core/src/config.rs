use std::time::Duration;

use crate::function::Runtime;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Sandbox pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle sandboxes older than this are eligible for eviction.
    pub idle_ttl: Duration,
    /// Idle sandboxes older than this move to Suspended when a snapshot
    /// hook is configured. Zero disables suspension.
    pub suspend_ttl: Duration,
    pub cleanup_interval: Duration,
    pub health_check_interval: Duration,
    pub max_prewarm_workers: usize,
    /// Global cap on sandboxes across all pools. 0 means unlimited.
    pub max_global_vms: u64,
    /// Key pools by execution profile instead of function id, letting
    /// functions with identical profiles share warm sandboxes.
    pub shared_pools: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(60),
            suspend_ttl: Duration::ZERO,
            cleanup_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            max_prewarm_workers: 8,
            max_global_vms: 0,
            shared_pools: false,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            idle_ttl: Duration::from_secs(env_u64("NOVA_POOL_IDLE_TTL_S", d.idle_ttl.as_secs())),
            suspend_ttl: Duration::from_secs(env_u64("NOVA_POOL_SUSPEND_TTL_S", 0)),
            cleanup_interval: Duration::from_secs(env_u64(
                "NOVA_POOL_CLEANUP_INTERVAL_S",
                d.cleanup_interval.as_secs(),
            )),
            health_check_interval: Duration::from_secs(env_u64(
                "NOVA_POOL_HEALTH_INTERVAL_S",
                d.health_check_interval.as_secs(),
            )),
            max_prewarm_workers: env_u64(
                "NOVA_POOL_MAX_PREWARM_WORKERS",
                d.max_prewarm_workers as u64,
            ) as usize,
            max_global_vms: env_u64("NOVA_POOL_MAX_GLOBAL_VMS", 0),
            shared_pools: env_bool("NOVA_POOL_SHARED", false),
        }
    }
}

/// Template (zygote) pool configuration.
#[derive(Debug, Clone)]
pub struct TemplatePoolConfig {
    pub enabled: bool,
    /// Warm templates maintained per runtime.
    pub pool_size: usize,
    pub refill_interval: Duration,
    pub runtimes: Vec<Runtime>,
}

impl Default for TemplatePoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 2,
            refill_interval: Duration::from_secs(30),
            runtimes: vec![Runtime::Python, Runtime::Node],
        }
    }
}

impl TemplatePoolConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let runtimes = std::env::var("NOVA_TEMPLATE_RUNTIMES")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|r| r.trim().parse().ok())
                    .collect::<Vec<Runtime>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(d.runtimes);
        Self {
            enabled: env_bool("NOVA_TEMPLATE_ENABLED", d.enabled),
            pool_size: env_u64("NOVA_TEMPLATE_POOL_SIZE", d.pool_size as u64) as usize,
            refill_interval: Duration::from_secs(env_u64(
                "NOVA_TEMPLATE_REFILL_INTERVAL_S",
                d.refill_interval.as_secs(),
            )),
            runtimes,
        }
    }
}
