//! Duplex stream session: two independently scheduled directions over one
//! stream, joined by a completion latch.
//!
//! [`DuplexSession::start`] splits the stream and spawns two tasks. The send
//! task drains the caller's outbound queue into the transport's write half;
//! the receive task drains the read half into the caller's inbound queue.
//! Each task owns the state of its own direction. The only state the two
//! tasks share is the call's cancel signal and the [`CompletionLatch`], which
//! releases [`SessionCompletion::join`] once both directions are terminal.
//!
//! A failing direction aborts the other one: a read error stops the send
//! task (its write half is released), and a write error stops the receive
//! task. The aborted direction ends `Failed` with code `Canceled`, which never
//! outranks the failure that caused it.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cancel::{CancelHandle, CancelReason, CancelToken};
use crate::config::ClientConfig;
use crate::deadline::{Deadline, DeadlineCheck, DeadlineWatcher};
use crate::latch::CompletionLatch;
use crate::message::Envelope;
use crate::status::{Failure, Status};
use crate::transport::{MessageSink, MessageSource, StreamHandle};

/// State of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    /// Messages may flow.
    Open,
    /// Close requested; the end marker is being emitted.
    Closing,
    /// End of stream sent or observed without error.
    Closed,
    /// Transport failure, protocol violation, cancellation or remote error.
    Failed,
}

impl DirectionState {
    /// `Closed` and `Failed` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DirectionState::Closed | DirectionState::Failed)
    }
}

struct DirectionCell {
    state: DirectionState,
    failure: Option<Status>,
}

struct Direction {
    name: &'static str,
    stream_id: u64,
    cell: Mutex<DirectionCell>,
}

impl Direction {
    fn new(name: &'static str, stream_id: u64) -> Self {
        Self {
            name,
            stream_id,
            cell: Mutex::new(DirectionCell {
                state: DirectionState::Open,
                failure: None,
            }),
        }
    }

    fn cell(&self) -> MutexGuard<'_, DirectionCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> DirectionState {
        self.cell().state
    }

    fn failure(&self) -> Option<Status> {
        self.cell().failure.clone()
    }

    /// `Open → Closing`. Returns `false` if the direction was not open.
    fn begin_close(&self) -> bool {
        let mut cell = self.cell();
        if cell.state != DirectionState::Open {
            return false;
        }
        cell.state = DirectionState::Closing;
        true
    }

    fn close(&self) {
        let mut cell = self.cell();
        if !cell.state.is_terminal() {
            cell.state = DirectionState::Closed;
            trace!(stream_id = self.stream_id, direction = self.name, "direction closed");
        }
    }

    fn fail(&self, status: Status) {
        let mut cell = self.cell();
        if cell.state.is_terminal() {
            return;
        }
        debug!(
            stream_id = self.stream_id,
            direction = self.name,
            code = %status.code(),
            message = status.message(),
            "direction failed"
        );
        cell.state = DirectionState::Failed;
        cell.failure = Some(status);
    }

    /// Terminal outcome of this direction, `None` while it is still running.
    fn outcome(&self) -> Option<Status> {
        let cell = self.cell();
        match cell.state {
            DirectionState::Closed => Some(Status::ok()),
            DirectionState::Failed => Some(
                cell.failure
                    .clone()
                    .unwrap_or_else(|| Status::internal("direction failed without a status")),
            ),
            DirectionState::Open | DirectionState::Closing => None,
        }
    }
}

/// Bookkeeping owned by a direction task. Dropping it, on any exit path
/// including task abort or panic, makes the direction terminal and counts
/// down the latch.
struct PumpCtx {
    direction: Arc<Direction>,
    abort: CancelToken,
    peer: CancelHandle,
    latch: Arc<CompletionLatch>,
}

impl PumpCtx {
    /// Marks the direction failed and, unless the failure is itself a
    /// cancellation, aborts the opposite direction.
    fn terminate(&self, failure: Failure) -> Status {
        let cancelled = matches!(failure, Failure::Canceled(_));
        if let Failure::Transport(err) = &failure {
            warn!(
                stream_id = self.direction.stream_id,
                direction = self.direction.name,
                error = %err,
                "transport failure"
            );
        }
        let status = Status::from(failure);
        self.direction.fail(status.clone());
        if !cancelled {
            self.peer.cancel(CancelReason::DirectionFailed);
        }
        status
    }

    fn remote_failed(&self, status: Status) {
        self.direction.fail(status);
        self.peer.cancel(CancelReason::DirectionFailed);
    }
}

impl Drop for PumpCtx {
    fn drop(&mut self) {
        if !self.direction.state().is_terminal() {
            let status = if std::thread::panicking() {
                Status::internal("direction task panicked")
            } else {
                Status::canceled("session released before the direction finished")
            };
            self.direction.fail(status);
            self.peer.cancel(CancelReason::DirectionFailed);
        }
        self.latch.count_down();
    }
}

enum Outbound<T> {
    Data(T, oneshot::Sender<Result<(), Status>>),
    Close(oneshot::Sender<Result<(), Status>>),
}

struct SendPump<T: Send + 'static> {
    ctx: PumpCtx,
    sink: Box<dyn MessageSink<T>>,
    outbound: mpsc::Receiver<Outbound<T>>,
}

impl<T: Send + 'static> SendPump<T> {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                biased;
                reason = self.ctx.abort.cancelled() => Err(reason),
                command = self.outbound.recv() => Ok(command),
            };
            let command = match command {
                Ok(command) => command,
                Err(reason) => {
                    self.ctx.terminate(Failure::Canceled(reason));
                    return;
                }
            };
            match command {
                Some(Outbound::Data(payload, ack)) => {
                    let written = tokio::select! {
                        biased;
                        reason = self.ctx.abort.cancelled() => Err(Failure::Canceled(reason)),
                        written = self.sink.write_message(payload) => written.map_err(Failure::Transport),
                    };
                    match written {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(failure) => {
                            let status = self.ctx.terminate(failure);
                            let _ = ack.send(Err(status));
                            return;
                        }
                    }
                }
                Some(Outbound::Close(ack)) => {
                    let closed = self.finish().await;
                    let _ = ack.send(closed);
                    return;
                }
                None => {
                    trace!(
                        stream_id = self.ctx.direction.stream_id,
                        "sender dropped, closing send direction"
                    );
                    let _ = self.finish().await;
                    return;
                }
            }
        }
    }

    async fn finish(&mut self) -> Result<(), Status> {
        let closed = tokio::select! {
            biased;
            reason = self.ctx.abort.cancelled() => Err(Failure::Canceled(reason)),
            closed = self.sink.close_write(Status::ok()) => closed.map_err(Failure::Transport),
        };
        match closed {
            Ok(()) => {
                self.ctx.direction.close();
                Ok(())
            }
            Err(failure) => Err(self.ctx.terminate(failure)),
        }
    }
}

struct RecvPump<T: Send + 'static> {
    ctx: PumpCtx,
    source: Box<dyn MessageSource<T>>,
    inbound: mpsc::Sender<T>,
}

impl<T: Send + 'static> RecvPump<T> {
    async fn run(mut self) {
        loop {
            let read = tokio::select! {
                biased;
                reason = self.ctx.abort.cancelled() => Err(Failure::Canceled(reason)),
                read = self.source.read_message() => read.map_err(Failure::Transport),
            };
            match read {
                Ok(Envelope::Data(payload)) => {
                    let forwarded = tokio::select! {
                        biased;
                        reason = self.ctx.abort.cancelled() => Err(Some(reason)),
                        sent = self.inbound.send(payload) => sent.map_err(|_| None),
                    };
                    match forwarded {
                        Ok(()) => {}
                        Err(Some(reason)) => {
                            self.ctx.terminate(Failure::Canceled(reason));
                            return;
                        }
                        Err(None) => trace!(
                            stream_id = self.ctx.direction.stream_id,
                            "receiver dropped, discarding message"
                        ),
                    }
                }
                Ok(Envelope::End(status)) if status.is_ok() => {
                    self.ctx.direction.close();
                    return;
                }
                Ok(Envelope::End(status)) => {
                    self.ctx.remote_failed(status);
                    return;
                }
                Err(failure) => {
                    self.ctx.terminate(failure);
                    return;
                }
            }
        }
    }
}

/// Send half of a duplex session.
pub struct DuplexSender<Req> {
    stream_id: u64,
    outbound: Option<mpsc::Sender<Outbound<Req>>>,
    direction: Arc<Direction>,
    check: DeadlineCheck,
}

impl<Req: Send + 'static> DuplexSender<Req> {
    /// Current state of the send direction.
    pub fn state(&self) -> DirectionState {
        self.direction.state()
    }

    /// Enqueues `payload` and waits until the transport accepted it.
    ///
    /// Fails with `Internal` after [`close_send`](Self::close_send), with the
    /// direction's failure once it failed, and with the cancellation status
    /// once the call is cancelled or its deadline has passed.
    pub async fn send(&mut self, payload: Req) -> Result<(), Status> {
        match self.direction.state() {
            DirectionState::Open => {}
            DirectionState::Failed => return Err(self.lost()),
            DirectionState::Closing | DirectionState::Closed => {
                return Err(Status::from(Failure::ProtocolViolation(format!(
                    "send on stream {} after close_send",
                    self.stream_id
                ))));
            }
        }
        self.check.check()?;
        let Some(outbound) = &self.outbound else {
            return Err(Status::from(Failure::ProtocolViolation(
                "send direction has no queue".to_string(),
            )));
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound.send(Outbound::Data(payload, ack_tx)).await.is_err() {
            return Err(self.lost());
        }
        ack_rx.await.unwrap_or_else(|_| Err(self.lost()))
    }

    /// Emits the end marker. A no-op unless the direction is open.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        if !self.direction.begin_close() {
            return Ok(());
        }
        let Some(outbound) = self.outbound.take() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound.send(Outbound::Close(ack_tx)).await.is_err() {
            return Err(self.lost());
        }
        ack_rx.await.unwrap_or_else(|_| Err(self.lost()))
    }

    fn lost(&self) -> Status {
        self.direction
            .failure()
            .unwrap_or_else(|| Status::internal("send task exited unexpectedly"))
    }
}

impl<Req> std::fmt::Debug for DuplexSender<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSender")
            .field("stream_id", &self.stream_id)
            .field("state", &self.direction.state())
            .finish()
    }
}

/// Receive half of a duplex session.
pub struct DuplexReceiver<Resp> {
    inbound: mpsc::Receiver<Resp>,
    direction: Arc<Direction>,
    check: DeadlineCheck,
    terminal: Option<Result<(), Status>>,
}

impl<Resp: Send + 'static> DuplexReceiver<Resp> {
    /// Current state of the receive direction.
    pub fn state(&self) -> DirectionState {
        self.direction.state()
    }

    /// Waits for the next payload.
    ///
    /// Returns `Ok(Some(_))` for a payload, `Ok(None)` at a clean end of
    /// stream and `Err` on failure. Once a terminal answer was returned every
    /// later call returns it again. Cancellation or a passed deadline stops
    /// delivery at once, even if payloads are still buffered.
    pub async fn receive(&mut self) -> Result<Option<Resp>, Status> {
        if let Some(terminal) = &self.terminal {
            return terminal.clone().map(|()| None);
        }
        let running = !self.direction.state().is_terminal();
        let gate = if running { self.check.check() } else { Ok(()) };
        let next = match gate {
            Err(status) => Err(status),
            Ok(()) => tokio::select! {
                biased;
                reason = self.check.token().cancelled(), if running => Err(Status::from(reason)),
                item = self.inbound.recv() => Ok(item),
            },
        };
        let terminal = match next {
            Ok(Some(payload)) => return Ok(Some(payload)),
            Ok(None) => match self.direction.outcome() {
                Some(outcome) if outcome.is_ok() => Ok(()),
                Some(failure) => Err(failure),
                None => Err(Status::canceled(
                    "session released before the receive direction finished",
                )),
            },
            Err(status) => Err(status),
        };
        self.inbound.close();
        self.terminal = Some(terminal.clone());
        terminal.map(|()| None)
    }
}

impl<Resp> std::fmt::Debug for DuplexReceiver<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexReceiver")
            .field("state", &self.direction.state())
            .field("terminal", &self.terminal)
            .finish()
    }
}

/// Completion side of a duplex session. Owns the direction tasks and the
/// call's deadline watcher; dropping it releases the stream.
pub struct SessionCompletion {
    stream_id: u64,
    latch: Arc<CompletionLatch>,
    send: Arc<Direction>,
    recv: Arc<Direction>,
    outcome: OnceLock<Status>,
    watcher: DeadlineWatcher,
    tasks: [JoinHandle<()>; 2],
}

impl SessionCompletion {
    /// Waits until both directions are terminal and returns the combined
    /// outcome: the more severe of the two direction outcomes.
    pub async fn join(&self) -> Status {
        if let Some(outcome) = self.outcome.get() {
            return outcome.clone();
        }
        self.latch.wait().await;
        let outcome = self.outcome.get_or_init(|| {
            let recv = self
                .recv
                .outcome()
                .unwrap_or_else(|| Status::internal("receive direction not terminal"));
            let send = self
                .send
                .outcome()
                .unwrap_or_else(|| Status::internal("send direction not terminal"));
            self.watcher.disarm();
            let outcome = recv.worst(send);
            debug!(stream_id = self.stream_id, code = %outcome.code(), "session complete");
            outcome
        });
        outcome.clone()
    }

    /// Cancels the call. Both directions stop and end `Failed` with
    /// `Canceled`; a no-op once the session is complete.
    pub fn cancel(&self) {
        if self.watcher.handle().cancel(CancelReason::UserRequested) {
            debug!(stream_id = self.stream_id, "session cancelled");
        }
    }

    /// Handle that cancels this session from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.watcher.handle().clone()
    }

    /// Returns `true` once both directions are terminal.
    pub fn is_complete(&self) -> bool {
        self.latch.is_released()
    }

    /// State of the send direction.
    pub fn send_state(&self) -> DirectionState {
        self.send.state()
    }

    /// State of the receive direction.
    pub fn receive_state(&self) -> DirectionState {
        self.recv.state()
    }

    /// The call's deadline, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.watcher.deadline()
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl Drop for SessionCompletion {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SessionCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCompletion")
            .field("stream_id", &self.stream_id)
            .field("send", &self.send.state())
            .field("receive", &self.recv.state())
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

/// A bidirectional streaming call.
pub struct DuplexSession<Req, Resp> {
    sender: DuplexSender<Req>,
    receiver: DuplexReceiver<Resp>,
    completion: SessionCompletion,
}

impl<Req: Send + 'static, Resp: Send + 'static> DuplexSession<Req, Resp> {
    /// Starts the direction tasks over `stream`. The session takes
    /// ownership of the call's watcher.
    pub fn start(
        stream: StreamHandle<Req, Resp>,
        watcher: DeadlineWatcher,
        config: &ClientConfig,
    ) -> Self {
        let stream_id = stream.id();
        let (sink, source) = stream.into_split();
        let latch = Arc::new(CompletionLatch::new(2));
        let send_dir = Arc::new(Direction::new("send", stream_id));
        let recv_dir = Arc::new(Direction::new("receive", stream_id));
        let (send_abort, send_abort_handle) = watcher.token().child();
        let (recv_abort, recv_abort_handle) = watcher.token().child();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.recv_buffer.max(1));

        let send_task = tokio::spawn(
            SendPump {
                ctx: PumpCtx {
                    direction: send_dir.clone(),
                    abort: send_abort,
                    peer: recv_abort_handle,
                    latch: latch.clone(),
                },
                sink,
                outbound: outbound_rx,
            }
            .run(),
        );
        let recv_task = tokio::spawn(
            RecvPump {
                ctx: PumpCtx {
                    direction: recv_dir.clone(),
                    abort: recv_abort,
                    peer: send_abort_handle,
                    latch: latch.clone(),
                },
                source,
                inbound: inbound_tx,
            }
            .run(),
        );
        debug!(stream_id, deadline = ?watcher.deadline(), "duplex session started");

        Self {
            sender: DuplexSender {
                stream_id,
                outbound: Some(outbound_tx),
                direction: send_dir.clone(),
                check: watcher.checker(),
            },
            receiver: DuplexReceiver {
                inbound: inbound_rx,
                direction: recv_dir.clone(),
                check: watcher.checker(),
                terminal: None,
            },
            completion: SessionCompletion {
                stream_id,
                latch,
                send: send_dir,
                recv: recv_dir,
                outcome: OnceLock::new(),
                watcher,
                tasks: [send_task, recv_task],
            },
        }
    }

    /// See [`DuplexSender::send`].
    pub async fn send(&mut self, payload: Req) -> Result<(), Status> {
        self.sender.send(payload).await
    }

    /// See [`DuplexSender::close_send`].
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.sender.close_send().await
    }

    /// See [`DuplexReceiver::receive`].
    pub async fn receive(&mut self) -> Result<Option<Resp>, Status> {
        self.receiver.receive().await
    }

    /// See [`SessionCompletion::join`].
    pub async fn join(&self) -> Status {
        self.completion.join().await
    }

    /// See [`SessionCompletion::cancel`].
    pub fn cancel(&self) {
        self.completion.cancel()
    }

    /// Handle that cancels this session from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.completion.cancel_handle()
    }

    /// State of the send direction.
    pub fn send_state(&self) -> DirectionState {
        self.completion.send_state()
    }

    /// State of the receive direction.
    pub fn receive_state(&self) -> DirectionState {
        self.completion.receive_state()
    }

    /// Returns `true` once both directions are terminal.
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> u64 {
        self.completion.stream_id()
    }

    /// Splits the session so the directions can be driven from separate
    /// tasks. Keep the completion alive: dropping it aborts both directions.
    pub fn split(self) -> (DuplexSender<Req>, DuplexReceiver<Resp>, SessionCompletion) {
        (self.sender, self.receiver, self.completion)
    }
}

impl<Req, Resp> std::fmt::Debug for DuplexSession<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSession")
            .field("completion", &self.completion)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::mem::{pipe, MemEnd};
    use crate::status::StatusCode;
    use std::time::Duration;

    fn session_pair(
        capacity: usize,
    ) -> (DuplexSession<u32, u32>, MemEnd<u32, u32>) {
        let (client, server, _disconnected) = pipe::<u32, u32>(1, capacity);
        let session = DuplexSession::start(
            client.into_stream(),
            DeadlineWatcher::unbounded(),
            &ClientConfig::default(),
        );
        (session, server)
    }

    #[tokio::test]
    async fn test_echo_both_directions() {
        let (mut session, mut server) = session_pair(8);
        session.send(1).await.unwrap();
        session.send(2).await.unwrap();
        session.close_send().await.unwrap();

        assert_eq!(server.source.read_message().await.unwrap(), Envelope::Data(1));
        assert_eq!(server.source.read_message().await.unwrap(), Envelope::Data(2));
        assert!(server.source.read_message().await.unwrap().is_end());

        server.sink.write_message(10).await.unwrap();
        server.sink.close_write(Status::ok()).await.unwrap();

        assert_eq!(session.receive().await.unwrap(), Some(10));
        assert_eq!(session.receive().await.unwrap(), None);
        assert!(session.join().await.is_ok());
        assert_eq!(session.send_state(), DirectionState::Closed);
        assert_eq!(session.receive_state(), DirectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_send_idempotent() {
        let (mut session, _server) = session_pair(8);
        session.close_send().await.unwrap();
        let once = session.send_state();
        session.close_send().await.unwrap();
        assert_eq!(session.send_state(), once);
        assert_eq!(once, DirectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_is_internal() {
        let (mut session, _server) = session_pair(8);
        session.close_send().await.unwrap();
        let err = session.send(5).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[tokio::test]
    async fn test_join_waits_for_both_directions() {
        let (session, mut server) = session_pair(8);
        let (mut tx, _rx, completion) = session.split();
        tx.close_send().await.unwrap();
        let completion = Arc::new(completion);
        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.join().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(completion.receive_state(), DirectionState::Open);

        server.sink.close_write(Status::ok()).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("join released")
            .expect("task joined");
        assert!(outcome.is_ok());
        assert!(completion.is_complete());
    }

    #[tokio::test]
    async fn test_read_error_aborts_send_direction() {
        let (mut session, server) = session_pair(8);
        // write half dropped without an end marker
        drop(server.sink);
        let err = session.receive().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);
        let outcome = session.join().await;
        assert_eq!(outcome.code(), StatusCode::Unavailable);
        assert_eq!(session.send_state(), DirectionState::Failed);
        assert_eq!(session.send(1).await.unwrap_err().code(), StatusCode::Canceled);
    }

    #[tokio::test]
    async fn test_remote_error_status_dominates() {
        let (mut session, mut server) = session_pair(8);
        server
            .sink
            .close_write(Status::invalid_argument("negative"))
            .await
            .unwrap();
        let err = session.receive().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        let outcome = session.join().await;
        assert_eq!(outcome.code(), StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let (mut session, mut server) = session_pair(8);
        session.send(1).await.unwrap();
        server.sink.write_message(7).await.unwrap();
        assert_eq!(session.receive().await.unwrap(), Some(7));

        session.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), session.join())
            .await
            .expect("both directions terminal");
        assert_eq!(outcome.code(), StatusCode::Canceled);
        assert_eq!(session.send_state(), DirectionState::Failed);
        assert_eq!(session.receive_state(), DirectionState::Failed);
        assert_eq!(session.receive().await.unwrap_err().code(), StatusCode::Canceled);
    }

    #[tokio::test]
    async fn test_external_cancel_token_reaches_session() {
        let (client, _server, _disconnected) = pipe::<u32, u32>(1, 8);
        let (parent, parent_handle) = new_cancel_pair();
        let session = DuplexSession::start(
            client.into_stream(),
            DeadlineWatcher::new(Some(&parent), None),
            &ClientConfig::default(),
        );
        parent_handle.cancel(CancelReason::UserRequested);
        assert_eq!(session.join().await.code(), StatusCode::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_both_directions() {
        let (client, _server, _disconnected) = pipe::<u32, u32>(1, 8);
        let mut session = DuplexSession::start(
            client.into_stream(),
            DeadlineWatcher::new(None, Some(Deadline::new(Duration::from_secs(1)))),
            &ClientConfig::default(),
        );
        let err = session.receive().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
        assert_eq!(session.join().await.code(), StatusCode::DeadlineExceeded);
    }

    fn session_with_deadline(
        timeout: Duration,
    ) -> (DuplexSession<u32, u32>, MemEnd<u32, u32>) {
        let (client, server, _disconnected) = pipe::<u32, u32>(1, 8);
        let session = DuplexSession::start(
            client.into_stream(),
            DeadlineWatcher::new(None, Some(Deadline::new(timeout))),
            &ClientConfig::default(),
        );
        (session, server)
    }

    #[tokio::test]
    async fn test_send_after_deadline_passed_is_rejected() {
        let (mut session, mut server) = session_with_deadline(Duration::from_millis(10));
        // block the runtime past the deadline before the timer task runs
        std::thread::sleep(Duration::from_millis(50));
        let err = session.send(7).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
        // nothing was delivered; the write half was released without an end
        assert!(server.source.read_message().await.is_err());
        assert_eq!(session.join().await.code(), StatusCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_receive_after_deadline_passed_is_rejected() {
        let (mut session, mut server) = session_with_deadline(Duration::from_millis(10));
        server.sink.write_message(7).await.unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = session.receive().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
        assert_eq!(session.receive().await.unwrap_err(), err);
        assert_eq!(session.join().await.code(), StatusCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_receive_is_not_restartable() {
        let (mut session, mut server) = session_pair(8);
        server.sink.close_write(Status::ok()).await.unwrap();
        assert_eq!(session.receive().await.unwrap(), None);
        assert_eq!(session.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_sender_closes_direction() {
        let (session, mut server) = session_pair(8);
        let (tx, _rx, completion) = session.split();
        drop(tx);
        assert!(server.source.read_message().await.unwrap().is_end());
        server.sink.close_write(Status::ok()).await.unwrap();
        assert!(completion.join().await.is_ok());
        assert_eq!(completion.send_state(), DirectionState::Closed);
    }

    #[tokio::test]
    async fn test_outcome_is_immutable_after_join() {
        let (mut session, mut server) = session_pair(8);
        session.close_send().await.unwrap();
        server.sink.close_write(Status::ok()).await.unwrap();
        assert!(session.join().await.is_ok());
        session.cancel();
        assert!(session.join().await.is_ok());
    }
}
