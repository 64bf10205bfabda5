//! Message envelope and stream-open metadata.

use crate::deadline::Deadline;
use crate::status::Status;

/// The unit exchanged on one direction of a stream.
///
/// `End` is the end-of-stream marker. It carries the sender's terminal
/// status, `Status::ok()` for a clean close, so a remote failure crosses the
/// boundary as a status code. Nothing follows an `End` on the same direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    /// A payload-bearing message.
    Data(T),
    /// No more messages will be sent in this direction.
    End(Status),
}

impl<T> Envelope<T> {
    /// Returns `true` for the end-of-stream marker.
    pub fn is_end(&self) -> bool {
        matches!(self, Envelope::End(_))
    }

    /// Borrows the payload, if this is a data message.
    pub fn payload(&self) -> Option<&T> {
        match self {
            Envelope::Data(payload) => Some(payload),
            Envelope::End(_) => None,
        }
    }

    /// Consumes the envelope, returning the payload if any.
    pub fn into_payload(self) -> Option<T> {
        match self {
            Envelope::Data(payload) => Some(payload),
            Envelope::End(_) => None,
        }
    }
}

/// Metadata sent when a stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMeta {
    /// Stream identifier assigned by the client.
    pub stream_id: u64,
    /// Fully qualified method name, e.g. `"calculator.Calculator/Sum"`.
    pub method: String,
    /// Absolute deadline propagated to the remote, if any.
    pub deadline: Option<Deadline>,
}

impl CallMeta {
    /// Creates metadata for the given method without a deadline.
    pub fn new(stream_id: u64, method: impl Into<String>) -> Self {
        Self {
            stream_id,
            method: method.into(),
            deadline: None,
        }
    }

    /// Sets the propagated deadline.
    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }
}
