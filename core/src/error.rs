//! Error taxonomy for the connection manager.
//!
//! State-machine level failures (permission, connect, discovery) end the
//! current `start()` attempt. Per-operation failures only resolve the
//! operation's own completion, except the ones that take the link down.

use crate::platform::Capability;
use crate::state::ConnectionState;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Permission denied for {0} capability")]
    PermissionDenied(Capability),
    #[error("Scan finished without a matching peripheral")]
    ScanTimeout,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Service {0} not found on peripheral")]
    ServiceNotFound(Uuid),
    #[error("Characteristic {0} not found on peripheral")]
    CharacteristicNotFound(Uuid),
    #[error("Link lost")]
    LinkLost,
    #[error("Operation timed out")]
    OperationTimeout,
    #[error("Notifications unavailable: {0}")]
    NotifyUnavailable(String),
    #[error("Rejected by peripheral: {0}")]
    Rejected(String),
    #[error("Link not ready (state: {0})")]
    NotReady(ConnectionState),
    #[error("Connection attempt already active (state: {0})")]
    AlreadyActive(ConnectionState),
    #[error("Cancelled")]
    Cancelled,
    #[error("Characteristic {characteristic} does not support {operation}")]
    Unsupported {
        characteristic: Uuid,
        operation: &'static str,
    },
    #[error("Radio error: {0}")]
    Radio(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkError {
    /// Whether this error means the link is gone and `start()` must be
    /// called again before issuing further operations.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, LinkError::LinkLost | LinkError::OperationTimeout)
    }
}
