//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BluechatError, Result};
use crate::types::{ServiceRecord, READ_CHUNK_SIZE};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by the discovery controller and the connection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Service both peers listen on and dial
    pub service: ServiceRecord,
    /// Capacity of one inbound read
    pub read_chunk_size: usize,
    /// Events buffered per sequence before the session task waits on the consumer
    pub event_buffer_size: usize,
    /// Upper bound on an outbound connect; `None` waits for the platform
    pub connect_timeout: Option<Duration>,
    /// Re-read the bonded set this often while scanning
    pub paired_refresh_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service: ServiceRecord::default(),
            read_chunk_size: READ_CHUNK_SIZE,
            event_buffer_size: 64,
            connect_timeout: Some(Duration::from_secs(15)),
            paired_refresh_interval: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service record
    pub fn with_service(mut self, service: ServiceRecord) -> Self {
        self.service = service;
        self
    }

    /// Set the inbound read capacity
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Set the per-sequence event buffer
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Set or clear the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set or clear the paired refresh interval
    pub fn with_paired_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.paired_refresh_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(BluechatError::config_error(
                "read_chunk_size must be greater than zero",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(BluechatError::config_error(
                "event_buffer_size must be greater than zero",
            ));
        }
        if self.service.name.trim().is_empty() {
            return Err(BluechatError::config_error("service name must not be empty"));
        }
        if matches!(self.connect_timeout, Some(t) if t.is_zero()) {
            return Err(BluechatError::config_error(
                "connect_timeout must be non-zero when set",
            ));
        }
        if matches!(self.paired_refresh_interval, Some(t) if t.is_zero()) {
            return Err(BluechatError::config_error(
                "paired_refresh_interval must be non-zero when set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.read_chunk_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let config = EngineConfig::new().with_read_chunk_size(0);
        assert!(matches!(
            config.validate(),
            Err(BluechatError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = EngineConfig::new().with_connect_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());

        let config = EngineConfig::new().with_connect_timeout(None);
        assert!(config.validate().is_ok());
    }
}
