//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use thiserror::Error;
use weft_proto::ConnectionType;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("object.buffer_size must be greater than zero")]
    ZeroBufferSize,
    #[error("timeouts.select_ms must be greater than zero")]
    ZeroSelectTimeout,
    #[error("timeouts.keepalive_ms must be greater than zero")]
    ZeroKeepalive,
    #[error("listen entry {0} is a multicast description; only tcp and pipe can be bound")]
    UnbindableListener(usize),
    #[error("rsp.udp_mtu {0} is smaller than a packet header")]
    MtuTooSmall(u32),
    #[error("rsp.num_buffers must be greater than zero")]
    ZeroRspBuffers,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.object.buffer_size == 0 {
        errors.push(ValidationError::ZeroBufferSize);
    }
    if config.timeouts.select_ms == 0 {
        errors.push(ValidationError::ZeroSelectTimeout);
    }
    if config.timeouts.keepalive_ms == 0 {
        errors.push(ValidationError::ZeroKeepalive);
    }

    for (index, desc) in config.listen.iter().enumerate() {
        if desc.connection_type == ConnectionType::Multicast {
            errors.push(ValidationError::UnbindableListener(index));
        }
    }

    // RSP settings are only recorded, but keep them sane.
    if config.rsp.udp_mtu < weft_proto::packet::HEADER_SIZE as u32 {
        errors.push(ValidationError::MtuTooSmall(config.rsp.udp_mtu));
    }
    if config.rsp.num_buffers == 0 {
        errors.push(ValidationError::ZeroRspBuffers);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_buffer_and_select_fail_together() {
        let toml = r#"
[object]
buffer_size = 0

[timeouts]
select_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ZeroBufferSize)));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ZeroSelectTimeout)));
    }

    #[test]
    fn test_multicast_listener_fails() {
        let toml = r#"
[[listen]]
type = "multicast"
hostname = "239.0.0.1"
port = 4000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::UnbindableListener(0)));
    }

    #[test]
    fn test_tiny_mtu_fails() {
        let config: Config = toml::from_str("[rsp]\nudp_mtu = 8").unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::MtuTooSmall(8)));
    }
}
