//! Error types for Lifeline.

use std::time::Duration;

use uuid::Uuid;

use crate::followup::FollowUpStatus;
use crate::session::{EndReason, SessionState};

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Consent error: {0}")]
    Consent(#[from] ConsentError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Follow-up error: {0}")]
    FollowUp(#[from] FollowUpError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Consent store errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("No consent record for user {user_id}")]
    NotFound { user_id: String },
}

/// Errors raised by a channel gateway implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Dial on {channel} failed: {reason}")]
    DialFailed { channel: String, reason: String },

    #[error("Gateway {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Failed to send message: {reason}")]
    SendFailed { reason: String },

    #[error("Transfer to {specialization} failed: {reason}")]
    TransferFailed {
        specialization: String,
        reason: String,
    },

    #[error("Connection {connection_id} is disconnected")]
    Disconnected { connection_id: String },
}

/// Session orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Consent required before connecting user {user_id}")]
    ConsentRequired { user_id: String },

    #[error("User {user_id} already has an active session {session_id}")]
    SessionAlreadyActive { user_id: String, session_id: Uuid },

    #[error("Session {session_id} could not be connected after {attempts} dial attempt(s): {reason}")]
    DialFailed {
        session_id: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("No active session {session_id}")]
    NoActiveSession { session_id: Uuid },

    #[error("Session {session_id} is {state}; cannot {operation}")]
    InvalidState {
        session_id: Uuid,
        state: SessionState,
        operation: &'static str,
    },

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Session {session_id} ended before the operation completed ({reason})")]
    Interrupted { session_id: Uuid, reason: EndReason },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Follow-up scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum FollowUpError {
    #[error("User {user_id} has not consented to follow-up contact")]
    ConsentDenied { user_id: String },

    #[error("Follow-up task {task_id} not found")]
    NotFound { task_id: Uuid },

    #[error("Follow-up task {task_id} is {status}; cannot {operation}")]
    InvalidStatus {
        task_id: Uuid,
        status: FollowUpStatus,
        operation: &'static str,
    },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consent_required_display() {
        let err = OrchestratorError::ConsentRequired {
            user_id: "user-1".to_string(),
        };
        assert!(err.to_string().contains("user-1"));
    }

    #[test]
    fn test_dial_failed_display() {
        let id = Uuid::new_v4();
        let err = OrchestratorError::DialFailed {
            session_id: id,
            attempts: 2,
            reason: "no carrier".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("2 dial attempt"));
        assert!(msg.contains("no carrier"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = OrchestratorError::InvalidState {
            session_id: Uuid::new_v4(),
            state: SessionState::Degraded,
            operation: "transfer",
        };
        let msg = err.to_string();
        assert!(msg.contains("degraded"));
        assert!(msg.contains("transfer"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = OrchestratorError::InvalidTransition {
            from: SessionState::Ended(EndReason::Timeout),
            to: SessionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Invalid session transition: ended(timeout) -> connected"
        );
    }

    #[test]
    fn test_gateway_timeout_display() {
        let err = GatewayError::Timeout {
            operation: "dial".to_string(),
            timeout: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("dial"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn test_followup_invalid_status_display() {
        let err = FollowUpError::InvalidStatus {
            task_id: Uuid::new_v4(),
            status: FollowUpStatus::Pending,
            operation: "acknowledge",
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("acknowledge"));
    }

    #[test]
    fn test_error_from_orchestrator_error() {
        let inner = OrchestratorError::NoActiveSession {
            session_id: Uuid::new_v4(),
        };
        let err = Error::from(inner);
        assert!(err.to_string().contains("Orchestrator error"));
    }

    #[test]
    fn test_error_from_gateway_error() {
        let inner = GatewayError::SendFailed {
            reason: "closed".to_string(),
        };
        let err = Error::from(inner);
        assert!(err.to_string().contains("Gateway error"));
    }

    #[test]
    fn test_error_from_config_error() {
        let inner = ConfigError::ParseError("bad json".to_string());
        let err = Error::from(inner);
        assert!(err.to_string().contains("Configuration error"));
    }
}
