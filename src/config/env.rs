//! Environment variable overrides.
//!
//! Applied after the TOML file is parsed. An absent or unparseable value
//! leaves the configured value untouched.

use std::str::FromStr;

use super::Config;

/// Object buffer flush size in bytes.
pub const ENV_OBJECT_BUFFER_SIZE: &str = "WEFT_OBJECT_BUFFER_SIZE";

/// Keepalive timeout in milliseconds.
pub const ENV_KEEPALIVE_TIMEOUT: &str = "WEFT_KEEPALIVE_TIMEOUT";

fn parse_var<T: FromStr>(name: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(size) = parse_var::<usize>(ENV_OBJECT_BUFFER_SIZE, &lookup) {
            self.object.buffer_size = size;
        }
        if let Some(ms) = parse_var::<u64>(ENV_KEEPALIVE_TIMEOUT, &lookup) {
            self.timeouts.keepalive_ms = ms;
        }
    }
}
