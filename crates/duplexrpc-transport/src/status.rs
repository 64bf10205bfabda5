//! Status codes and the classifier that maps internal failure conditions to
//! the `{code, message}` pair visible across the RPC boundary.
//!
//! Every call shape converts its failures into a [`Status`] here; nothing
//! else decides which code a condition maps to.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::error::TransportError;

/// Closed set of outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Successful completion.
    Ok,
    /// Domain precondition violated; the caller must fix its input.
    InvalidArgument,
    /// The caller (or its peer) canceled the call.
    Canceled,
    /// The time budget elapsed before completion.
    DeadlineExceeded,
    /// Protocol invariant violated; a programming error.
    Internal,
    /// Transport connection lost mid-call.
    Unavailable,
}

/// Broad grouping used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Not a failure.
    None,
    /// Input fault: retry only with corrected input.
    Domain,
    /// Caller-controlled termination: retry the whole call.
    Caller,
    /// Transport fault: reconnect and retry.
    Transport,
    /// Protocol-usage fault: not recoverable by retry.
    Protocol,
}

impl StatusCode {
    /// Returns `true` for [`StatusCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Ranking used to combine the outcomes of two directions.
    pub fn severity(self) -> u8 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Canceled => 1,
            StatusCode::DeadlineExceeded => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::Unavailable => 4,
            StatusCode::Internal => 5,
        }
    }

    /// Returns the failure category of this code.
    pub fn category(self) -> FailureCategory {
        match self {
            StatusCode::Ok => FailureCategory::None,
            StatusCode::InvalidArgument => FailureCategory::Domain,
            StatusCode::Canceled | StatusCode::DeadlineExceeded => FailureCategory::Caller,
            StatusCode::Unavailable => FailureCategory::Transport,
            StatusCode::Internal => FailureCategory::Protocol,
        }
    }

    /// Whether repeating the identical request can succeed.
    ///
    /// `InvalidArgument` needs corrected input and `Internal` is a bug, so
    /// neither is retryable as-is.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StatusCode::Canceled | StatusCode::DeadlineExceeded | StatusCode::Unavailable
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::InvalidArgument => write!(f, "InvalidArgument"),
            StatusCode::Canceled => write!(f, "Canceled"),
            StatusCode::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            StatusCode::Internal => write!(f, "Internal"),
            StatusCode::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// The outcome of a call: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Creates a status with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Successful completion.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Domain precondition violated.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// Explicit cancellation.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Canceled, message)
    }

    /// Time budget elapsed.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// Protocol invariant violated.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Transport lost.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// The status code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if the code is `Ok`.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Combines two outcomes, keeping the more severe one. On a tie the
    /// receiver (`self`) wins, so the first-observed failure is preserved.
    pub fn worst(self, other: Status) -> Status {
        if other.code.severity() > self.code.severity() {
            other
        } else {
            self
        }
    }
}

/// Internal failure conditions recognized by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A domain-level precondition did not hold (e.g. negative input).
    Precondition(String),
    /// The call was canceled for the given reason.
    Canceled(CancelReason),
    /// The absolute deadline passed before completion.
    DeadlineElapsed,
    /// The transport failed underneath the call.
    Transport(TransportError),
    /// The caller broke the protocol (e.g. send after close).
    ProtocolViolation(String),
}

/// Maps the result of a completed operation to its externally visible status.
pub fn classify(outcome: std::result::Result<(), Failure>) -> Status {
    match outcome {
        Ok(()) => Status::ok(),
        Err(failure) => Status::from(failure),
    }
}

impl From<Failure> for Status {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Precondition(message) => Status::invalid_argument(message),
            Failure::Canceled(reason) => Status::from(reason),
            Failure::DeadlineElapsed => Status::from(CancelReason::DeadlineExceeded),
            Failure::Transport(err) => Status::from(err),
            Failure::ProtocolViolation(message) => Status::internal(message),
        }
    }
}

impl From<CancelReason> for Status {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::UserRequested => Status::canceled("call canceled by caller"),
            CancelReason::ClientDisconnected => Status::canceled("client disconnected"),
            CancelReason::DirectionFailed => {
                Status::canceled("aborted after the opposite direction failed")
            }
            CancelReason::DeadlineExceeded => {
                Status::deadline_exceeded("deadline elapsed before completion")
            }
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionReset | TransportError::NotConnected => {
                Status::unavailable(err.to_string())
            }
            TransportError::WriteClosed { .. }
            | TransportError::StreamEnded { .. }
            | TransportError::UnknownMethod { .. }
            | TransportError::ProtocolViolation { .. } => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(classify(Ok(())).code(), StatusCode::Ok);
    }

    #[test]
    fn test_precondition_is_invalid_argument() {
        let status = classify(Err(Failure::Precondition("negative number: -10".into())));
        assert_eq!(status.code(), StatusCode::InvalidArgument);
        assert_eq!(status.message(), "negative number: -10");
        assert!(!status.code().is_retryable());
        assert_eq!(status.code().category(), FailureCategory::Domain);
    }

    #[test]
    fn test_cancel_and_deadline_are_distinct() {
        let canceled = classify(Err(Failure::Canceled(CancelReason::UserRequested)));
        let elapsed = classify(Err(Failure::DeadlineElapsed));
        assert_eq!(canceled.code(), StatusCode::Canceled);
        assert_eq!(elapsed.code(), StatusCode::DeadlineExceeded);
        assert_ne!(canceled.code(), elapsed.code());
    }

    #[test]
    fn test_connection_lost_is_unavailable() {
        let status = classify(Err(Failure::Transport(TransportError::ConnectionReset)));
        assert_eq!(status.code(), StatusCode::Unavailable);
        assert!(status.code().is_retryable());
        assert_eq!(status.code().category(), FailureCategory::Transport);
    }

    #[test]
    fn test_protocol_violation_is_internal() {
        let status = classify(Err(Failure::ProtocolViolation("send after close".into())));
        assert_eq!(status.code(), StatusCode::Internal);
        let status = Status::from(TransportError::WriteClosed { stream_id: 7 });
        assert_eq!(status.code(), StatusCode::Internal);
        let status = Status::from(TransportError::UnknownMethod { method: "Nope".into() });
        assert_eq!(status.code(), StatusCode::Internal);
    }

    #[test]
    fn test_worst_prefers_failure_over_ok() {
        let combined = Status::ok().worst(Status::unavailable("reset"));
        assert_eq!(combined.code(), StatusCode::Unavailable);
        let combined = Status::unavailable("reset").worst(Status::ok());
        assert_eq!(combined.code(), StatusCode::Unavailable);
    }

    #[test]
    fn test_worst_root_cause_beats_abort() {
        let aborted = Status::from(CancelReason::DirectionFailed);
        let combined = aborted.worst(Status::invalid_argument("bad"));
        assert_eq!(combined.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_worst_tie_keeps_first() {
        let first = Status::canceled("first");
        let combined = first.clone().worst(Status::canceled("second"));
        assert_eq!(combined, first);
    }

    #[test]
    fn test_status_display() {
        let status = Status::invalid_argument("negative");
        assert_eq!(status.to_string(), "InvalidArgument: negative");
    }
}
