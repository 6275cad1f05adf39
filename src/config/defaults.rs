//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

// =============================================================================
// Node Defaults
// =============================================================================

/// Node type advertised in the handshake; 1 is a plain runtime node.
pub fn default_node_type() -> u32 {
    1
}

// =============================================================================
// Object Defaults
// =============================================================================

/// Bytes buffered by a data stream before a packet is sent.
pub fn default_object_buffer_size() -> usize {
    60_000
}

/// Commit incarnations of history kept by buffered masters.
pub fn default_auto_obsolete() -> u32 {
    0
}

// =============================================================================
// Cache Defaults
// =============================================================================

/// Instance cache budget in bytes.
pub fn default_instance_cache_size() -> usize {
    64 * 1024 * 1024
}

/// Number of registered objects queued for send-on-register; 0 disables it.
pub fn default_send_queue_size() -> usize {
    0
}

/// Age after which queued send-on-register entries are dropped.
pub fn default_send_queue_age_ms() -> u64 {
    0
}

// =============================================================================
// Timeout Defaults
// =============================================================================

pub fn default_timeout_ms() -> u64 {
    300_000
}

pub fn default_keepalive_ms() -> u64 {
    2_000
}

pub fn default_handshake_ms() -> u64 {
    10_000
}

pub fn default_select_ms() -> u64 {
    1_000
}

// =============================================================================
// RSP Defaults
// =============================================================================

pub fn default_rsp_num_buffers() -> u32 {
    1024
}

pub fn default_rsp_ack_timeout_ms() -> u32 {
    300
}

pub fn default_rsp_ack_frequency() -> u32 {
    17
}

pub fn default_rsp_error_downscale() -> u32 {
    5
}

pub fn default_rsp_error_upscale() -> u32 {
    5
}

pub fn default_rsp_error_maxscale() -> u32 {
    3
}

pub fn default_rsp_min_sendrate_shift() -> u32 {
    3
}

pub fn default_udp_mtu() -> u32 {
    1470
}

pub fn default_udp_buffer_size() -> u32 {
    1024 * 1024
}
