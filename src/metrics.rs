//! Prometheus metrics collection for weft.
//!
//! Metrics live in `OnceLock`s so that recording is a no-op until [`init`]
//! has run; library users that never call it pay nothing.
//!
//! - `weft_commands_dispatched_total{type}` - commands dispatched by packet type
//! - `weft_unknown_commands_total` - commands with no registered handler
//! - `weft_redispatches_total` - commands retried from the pending list
//! - `weft_command_cache_allocations_total` - command buffer growths
//! - `weft_instance_cache_{hits,misses,evictions}_total` - instance cache activity
//! - `weft_object_bytes_sent_total` - object data payload bytes sent
//! - `weft_commits_total` - versions produced by master commits

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Command pipeline
// ========================================================================

/// Commands dispatched, by packet type.
pub static COMMANDS_DISPATCHED: OnceLock<IntCounterVec> = OnceLock::new();

/// Commands that found no handler.
pub static UNKNOWN_COMMANDS: OnceLock<IntCounter> = OnceLock::new();

/// Commands retried from the pending list.
pub static REDISPATCHES: OnceLock<IntCounter> = OnceLock::new();

/// Heap allocations made by the command cache.
pub static COMMAND_CACHE_ALLOCATIONS: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Objects
// ========================================================================

pub static INSTANCE_CACHE_HITS: OnceLock<IntCounter> = OnceLock::new();

pub static INSTANCE_CACHE_MISSES: OnceLock<IntCounter> = OnceLock::new();

pub static INSTANCE_CACHE_EVICTIONS: OnceLock<IntCounter> = OnceLock::new();

/// Object data payload bytes sent.
pub static OBJECT_BYTES_SENT: OnceLock<IntCounter> = OnceLock::new();

/// Versions produced by master commits.
pub static COMMITS: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Nodes
// ========================================================================

/// Currently connected peers.
pub static CONNECTED_NODES: OnceLock<IntGauge> = OnceLock::new();

/// Errors by code.
pub static ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Call once at startup; repeated calls keep the first registration.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            if $metric.get().is_none() {
                match $init {
                    Ok(m) => {
                        if let Err(e) = r.register(Box::new(m.clone())) {
                            tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                        }
                        let _ = $metric.set(m);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                    }
                }
            }
        };
    }

    register!(COMMANDS_DISPATCHED, IntCounterVec::new(Opts::new("weft_commands_dispatched_total", "Commands dispatched by packet type"), &["type"]));
    register!(UNKNOWN_COMMANDS, IntCounter::new("weft_unknown_commands_total", "Commands without a registered handler"));
    register!(REDISPATCHES, IntCounter::new("weft_redispatches_total", "Commands retried from the pending list"));
    register!(COMMAND_CACHE_ALLOCATIONS, IntCounter::new("weft_command_cache_allocations_total", "Command buffer allocations"));
    register!(INSTANCE_CACHE_HITS, IntCounter::new("weft_instance_cache_hits_total", "Instance cache lookups served"));
    register!(INSTANCE_CACHE_MISSES, IntCounter::new("weft_instance_cache_misses_total", "Instance cache lookups missed"));
    register!(INSTANCE_CACHE_EVICTIONS, IntCounter::new("weft_instance_cache_evictions_total", "Instance cache streams evicted"));
    register!(OBJECT_BYTES_SENT, IntCounter::new("weft_object_bytes_sent_total", "Object data bytes sent"));
    register!(COMMITS, IntCounter::new("weft_commits_total", "Versions produced by master commits"));
    register!(CONNECTED_NODES, IntGauge::new("weft_connected_nodes", "Currently connected peers"));
    register!(ERRORS, IntCounterVec::new(Opts::new("weft_errors_total", "Errors by code"), &["code"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for metric updates
// ============================================================================

fn inc(metric: &OnceLock<IntCounter>) {
    if let Some(m) = metric.get() {
        m.inc();
    }
}

pub fn record_dispatch(packet_type: &str) {
    if let Some(m) = COMMANDS_DISPATCHED.get() {
        m.with_label_values(&[packet_type]).inc();
    }
}

pub fn record_unknown_command() {
    inc(&UNKNOWN_COMMANDS);
}

pub fn record_redispatch() {
    inc(&REDISPATCHES);
}

pub fn record_command_allocation() {
    inc(&COMMAND_CACHE_ALLOCATIONS);
}

pub fn record_cache_hit() {
    inc(&INSTANCE_CACHE_HITS);
}

pub fn record_cache_miss() {
    inc(&INSTANCE_CACHE_MISSES);
}

pub fn record_cache_eviction() {
    inc(&INSTANCE_CACHE_EVICTIONS);
}

pub fn record_bytes_sent(bytes: usize) {
    if let Some(m) = OBJECT_BYTES_SENT.get() {
        m.inc_by(bytes as u64);
    }
}

pub fn record_commit() {
    inc(&COMMITS);
}

pub fn set_connected_nodes(count: usize) {
    if let Some(m) = CONNECTED_NODES.get() {
        m.set(count as i64);
    }
}

pub fn record_error(code: &str) {
    if let Some(m) = ERRORS.get() {
        m.with_label_values(&[code]).inc();
    }
}
