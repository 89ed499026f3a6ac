//! Error types for Q-SYS change group monitoring

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the core crate
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Control name error: {0}")]
    ControlName(#[from] ControlNameError),
}

/// Errors reported by a [`CommandGateway`](crate::CommandGateway)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("Not connected to the core")]
    Disconnected,

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Control not found: {0}")]
    ControlNotFound(String),

    #[error("Command {operation} failed: {message}")]
    CommandFailed { operation: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Failures of the link itself rather than of a particular control.
    ///
    /// A transient error fails a whole batch; retrying individual controls
    /// over a dead link would only multiply the failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Disconnected | GatewayError::Timeout(_) | GatewayError::Transport(_)
        )
    }

    /// Failures that can be pinned on the controls named in the command
    pub fn is_control_scoped(&self) -> bool {
        matches!(
            self,
            GatewayError::ControlNotFound(_) | GatewayError::CommandFailed { .. }
        )
    }

    /// Create a CommandFailed error
    pub fn command_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while validating a control name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlNameError {
    #[error("Control name is empty")]
    Empty,

    #[error("Control name has leading or trailing whitespace: {0:?}")]
    SurroundingWhitespace(String),

    #[error("Control name contains control characters: {0:?}")]
    ControlCharacters(String),

    #[error("Control name too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Component part is empty in {0:?}")]
    EmptyComponent(String),

    #[error("Control part is empty in {0:?}")]
    EmptyControl(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
