//! Server side of a call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cancel::{CancelReason, CancelToken};
use crate::deadline::{Deadline, DeadlineWatcher};
use crate::error::TransportError;
use crate::message::{CallMeta, Envelope};
use crate::status::Status;
use crate::transport::{MessageSink, MessageSource};

pub(crate) type SharedSink<T> = Arc<Mutex<Option<Box<dyn MessageSink<T>>>>>;
pub(crate) type SharedSource<T> = Arc<Mutex<Option<Box<dyn MessageSource<T>>>>>;

/// What a handler sees of an incoming call: the request stream, the
/// response stream and the call's cancellation context.
///
/// The call is cancelled when the propagated deadline passes or when the
/// client goes away. Handlers observe that through [`check`](Self::check),
/// [`sleep`](Self::sleep) and every stream operation.
pub struct ServerCall<Req, Resp> {
    meta: CallMeta,
    requests: SharedSource<Req>,
    requests_ended: bool,
    responses: SharedSink<Resp>,
    watcher: DeadlineWatcher,
}

impl<Req: Send + 'static, Resp: Send + 'static> ServerCall<Req, Resp> {
    /// Creates the call for a freshly opened stream. `disconnected` fires
    /// when the client side of the stream is gone.
    pub fn new(
        meta: CallMeta,
        requests: Box<dyn MessageSource<Req>>,
        responses: Box<dyn MessageSink<Resp>>,
        disconnected: &CancelToken,
    ) -> Self {
        let watcher = DeadlineWatcher::new(Some(disconnected), meta.deadline);
        Self {
            meta,
            requests: Arc::new(Mutex::new(Some(requests))),
            requests_ended: false,
            responses: Arc::new(Mutex::new(Some(responses))),
            watcher,
        }
    }

    pub(crate) fn shared_halves(&self) -> (SharedSource<Req>, SharedSink<Resp>) {
        (self.requests.clone(), self.responses.clone())
    }

    /// Method name the stream was opened for.
    pub fn method(&self) -> &str {
        &self.meta.method
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> u64 {
        self.meta.stream_id
    }

    /// Deadline propagated by the client, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.watcher.deadline()
    }

    /// The call's cancel token.
    pub fn token(&self) -> &CancelToken {
        self.watcher.token()
    }

    /// Returns `true` once the call is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.watcher.token().is_cancelled()
    }

    /// Fails with `DeadlineExceeded` or `Canceled` once the call is over.
    pub fn check(&self) -> Result<(), Status> {
        self.watcher.check()
    }

    /// Sleeps for `period`, waking early if the call is cancelled.
    pub async fn sleep(&self, period: Duration) -> Result<(), Status> {
        self.watcher.sleep(period).await
    }

    /// Next request, `None` once the client closed its direction.
    pub async fn recv(&mut self) -> Result<Option<Req>, Status> {
        if self.requests_ended {
            return Ok(None);
        }
        let mut requests = self.watcher.guard(self.requests.lock()).await?;
        let source = requests
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        match self.watcher.guard(source.read_message()).await? {
            Ok(Envelope::Data(request)) => Ok(Some(request)),
            Ok(Envelope::End(status)) => {
                self.requests_ended = true;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status)
                }
            }
            Err(err) => Err(Status::from(err)),
        }
    }

    /// The single request of a unary or server-streaming call.
    pub async fn request(&mut self) -> Result<Req, Status> {
        self.recv()
            .await?
            .ok_or_else(|| {
                Status::from(TransportError::ProtocolViolation {
                    reason: "request stream ended before the first message".to_string(),
                })
            })
    }

    /// Writes one response.
    pub async fn send(&mut self, response: Resp) -> Result<(), Status> {
        let mut responses = self.watcher.guard(self.responses.lock()).await?;
        let sink = responses
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        self.watcher
            .guard(sink.write_message(response))
            .await?
            .map_err(Status::from)
    }

    /// Drops both halves without an end marker, as a lost connection would.
    /// The client observes `Unavailable`.
    pub async fn abort_connection(&mut self) {
        debug!(stream_id = self.meta.stream_id, "aborting connection");
        self.responses.lock().await.take();
        self.requests.lock().await.take();
        self.watcher.handle().cancel(CancelReason::ClientDisconnected);
    }
}

impl<Req, Resp> std::fmt::Debug for ServerCall<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("meta", &self.meta)
            .field("requests_ended", &self.requests_ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::mem::pipe;
    use crate::status::StatusCode;

    fn server_call(meta: CallMeta) -> (ServerCall<u32, u32>, crate::mem::MemEnd<u32, u32>) {
        let (client, server, disconnected) = pipe::<u32, u32>(meta.stream_id, 4);
        let call = ServerCall::new(
            meta,
            Box::new(server.source),
            Box::new(server.sink),
            &disconnected,
        );
        (call, client)
    }

    #[tokio::test]
    async fn test_recv_until_end() {
        let (mut call, mut client) = server_call(CallMeta::new(1, "t.T/M"));
        client.sink.write_message(3).await.unwrap();
        client.sink.close_write(Status::ok()).await.unwrap();
        assert_eq!(call.recv().await.unwrap(), Some(3));
        assert_eq!(call.recv().await.unwrap(), None);
        assert_eq!(call.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_requires_a_message() {
        let (mut call, mut client) = server_call(CallMeta::new(1, "t.T/M"));
        client.sink.close_write(Status::ok()).await.unwrap();
        let err = call.request().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
        assert!(err.message().starts_with("protocol violation"));
    }

    #[tokio::test]
    async fn test_send_without_response_half_is_unavailable() {
        let (mut call, _client) = server_call(CallMeta::new(1, "t.T/M"));
        let (_requests, responses) = call.shared_halves();
        responses.lock().await.take();
        let err = call.send(1).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);
        assert_eq!(err.message(), "not connected");
    }

    #[tokio::test]
    async fn test_client_gone_cancels_call() {
        let (call, client) = server_call(CallMeta::new(1, "t.T/M"));
        drop(client);
        assert_eq!(call.check().unwrap_err().code(), StatusCode::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagated_deadline() {
        let meta = CallMeta::new(1, "t.T/M")
            .with_deadline(Some(Deadline::new(Duration::from_secs(1))));
        let (call, _client) = server_call(meta);
        assert!(call.deadline().is_some());
        let err = call.sleep(Duration::from_secs(3)).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
        assert!(call.is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_connection_resets_client() {
        let (mut call, mut client) = server_call(CallMeta::new(1, "t.T/M"));
        call.send(1).await.unwrap();
        call.abort_connection().await;
        assert_eq!(client.source.read_message().await.unwrap(), Envelope::Data(1));
        let err = client.source.read_message().await.unwrap_err();
        assert_eq!(Status::from(err).code(), StatusCode::Unavailable);
        assert_eq!(call.send(2).await.unwrap_err().code(), StatusCode::Canceled);
    }

    #[tokio::test]
    async fn test_external_disconnect_token() {
        let (client, server, _) = pipe::<u32, u32>(5, 4);
        let (token, handle) = new_cancel_pair();
        let call = ServerCall::new(
            CallMeta::new(5, "t.T/M"),
            Box::new(server.source),
            Box::new(server.sink),
            &token,
        );
        handle.cancel(CancelReason::ClientDisconnected);
        assert!(call.is_cancelled());
        drop(client);
    }
}
