//! Error types for the BlueChat engine
//!
//! Setup and mid-session failures are reported to the coordinator as
//! [`ConnectionEvent::Failed`](crate::types::ConnectionEvent) values; the
//! variants here are what the capability layer and the discovery controller
//! return before they are folded into events.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Core error type for the BlueChat engine
#[derive(Debug, Error)]
pub enum BluechatError {
    /// Radio missing or switched off
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// Scan/connect authorization has not been granted
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Accept failed: {reason}")]
    AcceptFailed { reason: String },

    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Connection lost: {reason}")]
    LinkLost { reason: String },

    /// Best-effort write failure, absorbed by the send path
    #[error("Send dropped: {reason}")]
    SendDropped { reason: String },

    #[error("Socket closed")]
    SocketClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Failure reported by a platform backend
    #[error("Transport error: {message}")]
    Transport { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BluechatError {
    /// Create an accept failure with a reason
    pub fn accept_failed<T: Into<String>>(reason: T) -> Self {
        BluechatError::AcceptFailed {
            reason: reason.into(),
        }
    }

    /// Create a connect failure for an address
    pub fn connect_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        BluechatError::ConnectFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a link-lost error with a reason
    pub fn link_lost<T: Into<String>>(reason: T) -> Self {
        BluechatError::LinkLost {
            reason: reason.into(),
        }
    }

    /// Create a dropped-send error with a reason
    pub fn send_dropped<T: Into<String>>(reason: T) -> Self {
        BluechatError::SendDropped {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BluechatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a platform transport error
    pub fn transport<T: Into<String>>(message: T) -> Self {
        BluechatError::Transport {
            message: message.into(),
        }
    }

    /// Whether the user (or a retry) can get past this failure.
    ///
    /// Only configuration errors are programming mistakes; every radio and
    /// link failure is recoverable by enabling the radio, granting
    /// permission, or retrying `listen`/`dial`.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BluechatError::Configuration { .. })
    }

    /// Whether the coordinator should prompt the user to act
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            BluechatError::AdapterUnavailable | BluechatError::PermissionDenied
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BluechatError>;
pub type BluechatResult<T> = Result<T>;
