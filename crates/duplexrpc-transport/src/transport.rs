//! Abstract transport interface consumed by the session layer.
//!
//! A transport opens streams; each stream splits into a write half
//! ([`MessageSink`]) and a read half ([`MessageSource`]) that are driven by
//! different tasks. Dropping both halves closes the stream.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{CallMeta, Envelope};
use crate::status::Status;

/// Write half of a stream.
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send {
    /// Hands a payload to the transport. Suspends while the transport
    /// buffer is full; returns once the payload is accepted.
    async fn write_message(&mut self, payload: T) -> Result<()>;

    /// Emits the end-of-stream marker carrying `status`. No write may follow.
    async fn close_write(&mut self, status: Status) -> Result<()>;
}

/// Read half of a stream.
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send {
    /// Waits for the next envelope.
    ///
    /// `Envelope::End` is the expected end of the direction and is not an
    /// error; a lost connection surfaces as `Err`.
    async fn read_message(&mut self) -> Result<Envelope<T>>;
}

/// An open stream: `Out` messages are written, `In` messages are read.
pub struct StreamHandle<Out, In> {
    id: u64,
    sink: Box<dyn MessageSink<Out>>,
    source: Box<dyn MessageSource<In>>,
}

impl<Out: Send + 'static, In: Send + 'static> StreamHandle<Out, In> {
    /// Assembles a stream from its halves.
    pub fn new(
        id: u64,
        sink: Box<dyn MessageSink<Out>>,
        source: Box<dyn MessageSource<In>>,
    ) -> Self {
        Self { id, sink, source }
    }

    /// Stream identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Splits the stream so each half can be driven independently.
    pub fn into_split(self) -> (Box<dyn MessageSink<Out>>, Box<dyn MessageSource<In>>) {
        (self.sink, self.source)
    }

    /// Closes both halves without an end marker.
    pub fn close_stream(self) {
        drop(self);
    }
}

impl<Out, In> std::fmt::Debug for StreamHandle<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

/// Opens streams carrying `Req` messages out and `Resp` messages in.
///
/// A single transport type may implement this for several payload pairs.
#[async_trait]
pub trait Transport<Req, Resp>: Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Opens a new stream for the method named in `meta`.
    async fn open_stream(&self, meta: CallMeta) -> Result<StreamHandle<Req, Resp>>;
}
