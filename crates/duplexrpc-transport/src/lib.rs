#![warn(missing_docs)]

//! duplexrpc transport subsystem: duplex stream sessions, the four RPC call
//! shapes, deadline-driven cancellation and status classification.

pub mod cancel;
pub mod client;
pub mod config;
pub mod deadline;
pub mod error;
pub mod latch;
pub mod mem;
pub mod message;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use client::{CallOptions, ClientStreaming, RpcClient, ServerStreaming};
pub use config::{ClientConfig, ConfigError, MemTransportConfig};
pub use deadline::{Deadline, DeadlineCheck, DeadlineWatcher};
pub use error::{Result, TransportError};
pub use latch::CompletionLatch;
pub use mem::{pipe, Handler, MemEnd, MemSink, MemSource, MemTransport};
pub use message::{CallMeta, Envelope};
pub use server::ServerCall;
pub use session::{DirectionState, DuplexReceiver, DuplexSender, DuplexSession, SessionCompletion};
pub use status::{classify, Failure, FailureCategory, Status, StatusCode};
pub use transport::{MessageSink, MessageSource, StreamHandle, Transport};
