//! In-memory transport.
//!
//! Each stream is a pair of bounded channels of [`Envelope`]s, one per
//! direction. A channel that closes without an `End` marker reads as a reset
//! connection. Opening a stream spawns the handler registered for the
//! method; the handler's result becomes the `End` status of the response
//! direction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::config::MemTransportConfig;
use crate::error::{Result, TransportError};
use crate::message::{CallMeta, Envelope};
use crate::server::ServerCall;
use crate::status::Status;
use crate::transport::{MessageSink, MessageSource, StreamHandle, Transport};

/// Server-side method implementation.
pub type Handler<Req, Resp> = Arc<
    dyn Fn(ServerCall<Req, Resp>) -> BoxFuture<'static, std::result::Result<(), Status>>
        + Send
        + Sync,
>;

/// Fires the server's disconnect signal once every client half is gone.
struct DisconnectGuard(CancelHandle);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.cancel(CancelReason::ClientDisconnected);
    }
}

/// Write half of an in-memory stream.
pub struct MemSink<T> {
    stream_id: u64,
    tx: Option<mpsc::Sender<Envelope<T>>>,
    finished: Arc<AtomicBool>,
    peer_finished: Arc<AtomicBool>,
    _guard: Option<Arc<DisconnectGuard>>,
}

/// Read half of an in-memory stream.
pub struct MemSource<T> {
    stream_id: u64,
    rx: mpsc::Receiver<Envelope<T>>,
    ended: bool,
    _guard: Option<Arc<DisconnectGuard>>,
}

/// One end of an in-memory stream: writes `Out`, reads `In`.
pub struct MemEnd<Out, In> {
    /// Write half.
    pub sink: MemSink<Out>,
    /// Read half.
    pub source: MemSource<In>,
}

impl<Out: Send + 'static, In: Send + 'static> MemEnd<Out, In> {
    /// Boxes the halves into a [`StreamHandle`].
    pub fn into_stream(self) -> StreamHandle<Out, In> {
        let id = self.sink.stream_id;
        StreamHandle::new(id, Box::new(self.sink), Box::new(self.source))
    }
}

/// Creates a connected stream. The first end is the client, the second the
/// server; the token fires with `ClientDisconnected` once both client halves
/// are dropped.
pub fn pipe<Req, Resp>(
    stream_id: u64,
    capacity: usize,
) -> (MemEnd<Req, Resp>, MemEnd<Resp, Req>, CancelToken) {
    let capacity = capacity.max(1);
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    let client_finished = Arc::new(AtomicBool::new(false));
    let server_finished = Arc::new(AtomicBool::new(false));
    let (disconnected, handle) = new_cancel_pair();
    let guard = Arc::new(DisconnectGuard(handle));

    let client = MemEnd {
        sink: MemSink {
            stream_id,
            tx: Some(req_tx),
            finished: client_finished.clone(),
            peer_finished: server_finished.clone(),
            _guard: Some(guard.clone()),
        },
        source: MemSource {
            stream_id,
            rx: resp_rx,
            ended: false,
            _guard: Some(guard),
        },
    };
    let server = MemEnd {
        sink: MemSink {
            stream_id,
            tx: Some(resp_tx),
            finished: server_finished,
            peer_finished: client_finished,
            _guard: None,
        },
        source: MemSource {
            stream_id,
            rx: req_rx,
            ended: false,
            _guard: None,
        },
    };
    (client, server, disconnected)
}

impl<T> MemSink<T> {
    /// Resolves a failed channel send. Once the peer has completed the call
    /// its read half may already be gone; writes are then discarded.
    fn peer_gone(&self) -> Result<()> {
        if self.peer_finished.load(Ordering::Acquire) {
            trace!(stream_id = self.stream_id, "peer finished, discarding write");
            Ok(())
        } else {
            Err(TransportError::ConnectionReset)
        }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for MemSink<T> {
    async fn write_message(&mut self, payload: T) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::WriteClosed {
            stream_id: self.stream_id,
        })?;
        match tx.send(Envelope::Data(payload)).await {
            Ok(()) => Ok(()),
            Err(_) => self.peer_gone(),
        }
    }

    async fn close_write(&mut self, status: Status) -> Result<()> {
        let tx = self.tx.take().ok_or(TransportError::WriteClosed {
            stream_id: self.stream_id,
        })?;
        match tx.send(Envelope::End(status)).await {
            Ok(()) => {
                self.finished.store(true, Ordering::Release);
                Ok(())
            }
            Err(_) => self.peer_gone(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for MemSource<T> {
    async fn read_message(&mut self) -> Result<Envelope<T>> {
        if self.ended {
            return Err(TransportError::StreamEnded {
                stream_id: self.stream_id,
            });
        }
        match self.rx.recv().await {
            Some(envelope) => {
                if envelope.is_end() {
                    self.ended = true;
                }
                Ok(envelope)
            }
            None => Err(TransportError::ConnectionReset),
        }
    }
}

/// In-memory transport dispatching each opened stream to a handler by
/// method name.
pub struct MemTransport<Req, Resp> {
    config: MemTransportConfig,
    routes: HashMap<String, Handler<Req, Resp>>,
}

impl<Req: Send + 'static, Resp: Send + 'static> MemTransport<Req, Resp> {
    /// Creates a transport with no routes.
    pub fn new(config: MemTransportConfig) -> Self {
        Self {
            config,
            routes: HashMap::new(),
        }
    }

    /// Registers `handler` for `method`, replacing any previous handler.
    pub fn route<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(ServerCall<Req, Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let handler: Handler<Req, Resp> = Arc::new(move |call| handler(call).boxed());
        self.routes.insert(method.to_string(), handler);
        self
    }

    /// Registered method names.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Transport configuration.
    pub fn config(&self) -> &MemTransportConfig {
        &self.config
    }
}

#[async_trait]
impl<Req: Send + 'static, Resp: Send + 'static> Transport<Req, Resp> for MemTransport<Req, Resp> {
    async fn open_stream(&self, meta: CallMeta) -> Result<StreamHandle<Req, Resp>> {
        let handler = self
            .routes
            .get(&meta.method)
            .cloned()
            .ok_or_else(|| TransportError::UnknownMethod {
                method: meta.method.clone(),
            })?;
        let (client, server, disconnected) =
            pipe::<Req, Resp>(meta.stream_id, self.config.channel_capacity);
        debug!(stream_id = meta.stream_id, method = %meta.method, "stream opened");
        let call = ServerCall::new(
            meta,
            Box::new(server.source),
            Box::new(server.sink),
            &disconnected,
        );
        tokio::spawn(serve(call, handler));
        Ok(client.into_stream())
    }
}

async fn serve<Req: Send + 'static, Resp: Send + 'static>(
    call: ServerCall<Req, Resp>,
    handler: Handler<Req, Resp>,
) {
    let stream_id = call.stream_id();
    let method = call.method().to_string();
    // keeps the request half open until the trailer is out
    let (requests, responses) = call.shared_halves();
    let status = match handler(call).await {
        Ok(()) => Status::ok(),
        Err(status) => status,
    };
    debug!(stream_id, method = %method, code = %status.code(), "handler finished");
    if let Some(mut sink) = responses.lock().await.take() {
        if let Err(err) = sink.close_write(status).await {
            debug!(stream_id, error = %err, "client gone before trailer");
        }
    }
    drop(requests);
}
