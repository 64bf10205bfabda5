//! RPC client: the four call shapes built on [`DuplexSession`].
//!
//! Every call owns a [`DeadlineWatcher`] armed from its options. The
//! shape-specific wrappers turn a session into the call's result: a local
//! failure cancels the session and is reported together with whatever the
//! session itself observed, the more severe of the two winning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::debug;

use crate::cancel::{CancelHandle, CancelToken};
use crate::config::ClientConfig;
use crate::deadline::{Deadline, DeadlineWatcher};
use crate::message::CallMeta;
use crate::session::{DirectionState, DuplexReceiver, DuplexSession, SessionCompletion};
use crate::status::{Failure, Status};
use crate::transport::Transport;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    deadline: Option<Deadline>,
    cancel: Option<CancelToken>,
}

impl CallOptions {
    /// Options with no deadline and no external cancel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative time budget, measured from the start of the call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute deadline. Combined with a timeout, the earlier one applies.
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// External cancel signal. Firing it cancels the call.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn effective_deadline(&self, default_timeout: Option<Duration>) -> Option<Deadline> {
        let timeout = match (self.timeout, self.deadline) {
            (Some(timeout), _) => Some(timeout),
            (None, None) => default_timeout,
            (None, Some(_)) => None,
        };
        Deadline::earliest(self.deadline, timeout.map(Deadline::new))
    }
}

/// Client over a transport `T`.
pub struct RpcClient<T> {
    transport: Arc<T>,
    config: ClientConfig,
    next_stream_id: AtomicU64,
}

impl<T> RpcClient<T> {
    /// Creates a client owning `transport`.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self::with_shared(Arc::new(transport), config)
    }

    /// Creates a client over a shared transport.
    pub fn with_shared(transport: Arc<T>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Opens a bidirectional streaming call.
    pub async fn duplex<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<DuplexSession<Req, Resp>, Status>
    where
        T: Transport<Req, Resp>,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let deadline = options.effective_deadline(self.config.default_timeout());
        let watcher = DeadlineWatcher::new(options.cancel.as_ref(), deadline);
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let meta = CallMeta::new(stream_id, method).with_deadline(deadline);
        let stream = watcher
            .guard(self.transport.open_stream(meta))
            .await?
            .map_err(|err| {
                debug!(stream_id, method, error = %err, "failed to open stream");
                Status::from(err)
            })?;
        Ok(DuplexSession::start(stream, watcher, &self.config))
    }

    /// Sends one request and waits for exactly one response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<Resp, Status>
    where
        T: Transport<Req, Resp>,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut session = self.duplex::<Req, Resp>(method, options).await?;
        let result = async {
            session.send(request).await?;
            session.close_send().await?;
            single_response(&mut session).await
        }
        .await;
        finish(&session, result).await
    }

    /// Sends one request and returns the stream of responses.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<ServerStreaming<Resp>, Status>
    where
        T: Transport<Req, Resp>,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut session = self.duplex::<Req, Resp>(method, options).await?;
        let sent = async {
            session.send(request).await?;
            session.close_send().await
        }
        .await;
        if let Err(local) = sent {
            return Err(abandon(&session, local).await);
        }
        let (_sender, receiver, completion) = session.split();
        Ok(ServerStreaming {
            receiver,
            completion,
        })
    }

    /// Opens a call that streams requests and expects one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStreaming<Req, Resp>, Status>
    where
        T: Transport<Req, Resp>,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let session = self.duplex::<Req, Resp>(method, options).await?;
        Ok(ClientStreaming { session })
    }
}

impl<T> std::fmt::Debug for RpcClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .finish()
    }
}

async fn single_response<Req, Resp>(session: &mut DuplexSession<Req, Resp>) -> Result<Resp, Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let response = session
        .receive()
        .await?
        .ok_or_else(|| {
            Status::from(Failure::ProtocolViolation(
                "call ended without a response".to_string(),
            ))
        })?;
    if session.receive().await?.is_some() {
        return Err(Status::from(Failure::ProtocolViolation(
            "call produced more than one response".to_string(),
        )));
    }
    Ok(response)
}

/// Cancels the session and reports `local` merged with the session outcome.
async fn abandon<Req, Resp>(session: &DuplexSession<Req, Resp>, local: Status) -> Status
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    session.cancel();
    local.worst(session.join().await)
}

async fn finish<Req, Resp, R>(
    session: &DuplexSession<Req, Resp>,
    result: Result<R, Status>,
) -> Result<R, Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    match result {
        Ok(value) => {
            let outcome = session.join().await;
            if outcome.is_ok() {
                Ok(value)
            } else {
                Err(outcome)
            }
        }
        Err(local) => Err(abandon(session, local).await),
    }
}

/// Responses of a server-streaming call.
///
/// Yields payloads until the stream ends, then exactly one terminal
/// outcome: `Ok(None)` or an error, repeated on every later call.
pub struct ServerStreaming<Resp> {
    receiver: DuplexReceiver<Resp>,
    completion: SessionCompletion,
}

impl<Resp: Send + 'static> ServerStreaming<Resp> {
    /// Next response, `None` once the call completed successfully.
    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        match self.receiver.receive().await {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) => {
                let outcome = self.completion.join().await;
                if outcome.is_ok() {
                    Ok(None)
                } else {
                    Err(outcome)
                }
            }
            Err(local) => {
                self.completion.cancel();
                Err(local.worst(self.completion.join().await))
            }
        }
    }

    /// Discards remaining responses and returns the call's outcome.
    pub async fn outcome(&mut self) -> Status {
        loop {
            match self.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => return Status::ok(),
                Err(status) => return status,
            }
        }
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.completion.cancel()
    }

    /// Handle that cancels the call from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.completion.cancel_handle()
    }

    /// Adapts the call into a stream of responses. The stream ends after
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Resp, Status>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut call = state?;
            match call.message().await {
                Ok(Some(response)) => Some((Ok(response), Some(call))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }
}

impl<Resp> std::fmt::Debug for ServerStreaming<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStreaming")
            .field("completion", &self.completion)
            .finish()
    }
}

/// A client-streaming call: any number of requests, one response.
pub struct ClientStreaming<Req, Resp> {
    session: DuplexSession<Req, Resp>,
}

impl<Req: Send + 'static, Resp: Send + 'static> ClientStreaming<Req, Resp> {
    /// Sends one request.
    ///
    /// When the send direction has failed, the error is the call's outcome
    /// rather than the direction's own status.
    pub async fn send(&mut self, request: Req) -> Result<(), Status> {
        match self.session.send(request).await {
            Ok(()) => Ok(()),
            Err(local) if self.session.send_state() == DirectionState::Failed => {
                Err(local.worst(self.session.join().await))
            }
            Err(local) => Err(local),
        }
    }

    /// Ends the request stream without waiting for the response.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.session.close_send().await
    }

    /// Ends the request stream and waits for the single response.
    pub async fn close_and_recv(mut self) -> Result<Resp, Status> {
        let result = async {
            self.session.close_send().await?;
            single_response(&mut self.session).await
        }
        .await;
        finish(&self.session, result).await
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.session.cancel()
    }
}

impl<Req, Resp> std::fmt::Debug for ClientStreaming<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreaming")
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use crate::config::MemTransportConfig;
    use crate::mem::MemTransport;
    use crate::server::ServerCall;
    use crate::status::StatusCode;
    use futures::StreamExt;

    fn client() -> RpcClient<MemTransport<u64, u64>> {
        let transport = MemTransport::new(MemTransportConfig::default())
            .route("t.T/Double", |mut call: ServerCall<u64, u64>| async move {
                let n = call.request().await?;
                call.send(n * 2).await
            })
            .route("t.T/Twice", |mut call: ServerCall<u64, u64>| async move {
                let n = call.request().await?;
                call.send(n).await?;
                call.send(n).await
            })
            .route("t.T/Silent", |mut call: ServerCall<u64, u64>| async move {
                call.request().await?;
                Ok::<(), Status>(())
            })
            .route("t.T/Count", |mut call: ServerCall<u64, u64>| async move {
                let n = call.request().await?;
                for i in 0..n {
                    call.send(i).await?;
                }
                Ok::<(), Status>(())
            })
            .route("t.T/Sum", |mut call: ServerCall<u64, u64>| async move {
                let mut sum = 0;
                while let Some(n) = call.recv().await? {
                    sum += n;
                }
                call.send(sum).await
            })
            .route("t.T/Slow", |mut call: ServerCall<u64, u64>| async move {
                call.request().await?;
                call.sleep(Duration::from_secs(3)).await?;
                call.send(0).await
            });
        RpcClient::new(transport, ClientConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_effective_deadline_prefers_explicit() {
        let none = CallOptions::new().effective_deadline(None);
        assert!(none.is_none());

        let default = CallOptions::new().effective_deadline(Some(Duration::from_secs(5)));
        assert!(default.unwrap().remaining().unwrap() > Duration::from_secs(4));

        let explicit = Deadline::new(Duration::from_secs(1));
        let picked = CallOptions::new()
            .deadline(explicit)
            .effective_deadline(Some(Duration::from_secs(5)));
        assert_eq!(picked, Some(explicit));

        let earlier = CallOptions::new()
            .deadline(Deadline::new(Duration::from_secs(10)))
            .timeout(Duration::from_secs(2))
            .effective_deadline(None)
            .unwrap();
        assert!(earlier.remaining().unwrap() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unary_roundtrip() {
        let client = client();
        let out: u64 = client.unary("t.T/Double", 21, CallOptions::new()).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_unary_two_responses_is_internal() {
        let client = client();
        let err = client
            .unary::<u64, u64>("t.T/Twice", 1, CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[tokio::test]
    async fn test_unary_no_response_is_internal() {
        let client = client();
        let err = client
            .unary::<u64, u64>("t.T/Silent", 1, CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[tokio::test]
    async fn test_unknown_method_is_internal() {
        let client = client();
        let err = client
            .unary::<u64, u64>("t.T/Missing", 1, CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unary_deadline_exceeded() {
        let client = client();
        let err = client
            .unary::<u64, u64>(
                "t.T/Slow",
                1,
                CallOptions::new().timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_from_config() {
        let transport = MemTransport::new(MemTransportConfig::default()).route(
            "t.T/Slow",
            |mut call: ServerCall<u64, u64>| async move {
                call.request().await?;
                call.sleep(Duration::from_secs(3)).await?;
                call.send(0).await
            },
        );
        let config = ClientConfig {
            default_timeout_ms: Some(500),
            ..ClientConfig::default()
        };
        let client = RpcClient::new(transport, config);
        let err = client
            .unary::<u64, u64>("t.T/Slow", 1, CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_external_cancel_before_call() {
        let client = client();
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let err = client
            .unary::<u64, u64>("t.T/Double", 1, CallOptions::new().cancel_token(token))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Canceled);
    }

    #[tokio::test]
    async fn test_server_streaming_yields_then_one_outcome() {
        let client = client();
        let mut call = client
            .server_streaming::<u64, u64>("t.T/Count", 3, CallOptions::new())
            .await
            .unwrap();
        assert_eq!(call.message().await.unwrap(), Some(0));
        assert_eq!(call.message().await.unwrap(), Some(1));
        assert_eq!(call.message().await.unwrap(), Some(2));
        assert_eq!(call.message().await.unwrap(), None);
        assert_eq!(call.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_streaming_as_stream() {
        let client = client();
        let call = client
            .server_streaming::<u64, u64>("t.T/Count", 4, CallOptions::new())
            .await
            .unwrap();
        let items: Vec<_> = call.into_stream().collect().await;
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn test_client_streaming_sum() {
        let client = client();
        let mut call = client
            .client_streaming::<u64, u64>("t.T/Sum", CallOptions::new())
            .await
            .unwrap();
        for n in [1, 2, 3, 4] {
            call.send(n).await.unwrap();
        }
        assert_eq!(call.close_and_recv().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_client_streaming_send_after_close() {
        let client = client();
        let mut call = client
            .client_streaming::<u64, u64>("t.T/Sum", CallOptions::new())
            .await
            .unwrap();
        call.send(5).await.unwrap();
        call.close_send().await.unwrap();
        assert_eq!(call.send(1).await.unwrap_err().code(), StatusCode::Internal);
        assert_eq!(call.close_and_recv().await.unwrap(), 5);
    }
}
