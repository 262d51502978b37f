use std::net::SocketAddr;
use thiserror::Error;

use crate::streaming::types::{PlanId, SessionState};

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Plan {plan_id} is already registered as {kind} on this shard")]
    DuplicatePlan { plan_id: PlanId, kind: &'static str },

    #[error("Plan {0} is not registered on this shard")]
    UnknownPlan(PlanId),

    #[error("Plan {0} still has running sessions")]
    PlanStillRunning(PlanId),

    #[error("Peer {peer} is unreachable: {reason}")]
    PeerUnreachable { peer: SocketAddr, reason: String },

    #[error("Connection to {peer} lost: {reason}")]
    ConnectionLost { peer: SocketAddr, reason: String },

    #[error("Transfer aborted")]
    TransferAborted,

    #[error("Session closed with {pending} unsatisfied summaries")]
    IncompleteSummary { pending: usize },

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Progress for {file} would exceed announced size: {attempted} > {total}")]
    ProgressOverflow {
        file: String,
        attempted: u64,
        total: u64,
    },

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer failed the session: {0}")]
    RemoteFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Shard {0} is not running")]
    ShardUnavailable(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Transport-level failures: they fail one session, never the whole node.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StreamError::PeerUnreachable { .. } | StreamError::ConnectionLost { .. }
        )
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        StreamError::Protocol(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        StreamError::Storage(msg.into())
    }
}

/// Why a session ended without completing.
///
/// This is the by-value form of [`StreamError`] recorded in session snapshots,
/// so it is `Clone` and carries no I/O handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PeerUnreachable,
    ConnectionLost,
    TransferAborted,
    IncompleteSummary,
    Remote(String),
    Other(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::PeerUnreachable => "PeerUnreachable",
            FailureReason::ConnectionLost => "ConnectionLost",
            FailureReason::TransferAborted => "TransferAborted",
            FailureReason::IncompleteSummary => "IncompleteSummary",
            FailureReason::Remote(msg) | FailureReason::Other(msg) => msg,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Remote(msg) => write!(f, "remote: {}", msg),
            other => f.write_str(other.as_str()),
        }
    }
}

impl From<&StreamError> for FailureReason {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::PeerUnreachable { .. } => FailureReason::PeerUnreachable,
            StreamError::ConnectionLost { .. } => FailureReason::ConnectionLost,
            StreamError::TransferAborted => FailureReason::TransferAborted,
            StreamError::IncompleteSummary { .. } => FailureReason::IncompleteSummary,
            StreamError::RemoteFailure(msg) => FailureReason::Remote(msg.clone()),
            other => FailureReason::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_mapping() {
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let err = StreamError::ConnectionLost {
            peer,
            reason: "reset".into(),
        };
        assert!(err.is_transport());
        assert_eq!(FailureReason::from(&err), FailureReason::ConnectionLost);

        let err = StreamError::IncompleteSummary { pending: 2 };
        assert!(!err.is_transport());
        assert_eq!(FailureReason::from(&err).as_str(), "IncompleteSummary");
    }

    #[test]
    fn test_remote_reason_display() {
        let reason = FailureReason::from(&StreamError::RemoteFailure("disk full".into()));
        assert_eq!(reason.to_string(), "remote: disk full");
    }
}
