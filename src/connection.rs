// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Drives one logical message stream: owns its [`AckPumpHandle`], translates
//! server frames into [`MessageHandler`] invocations, and reconnects with
//! bounded backoff on retryable transport errors.
//!
//! Two strategies share this machinery: [`Mode::Streaming`] pumps messages off
//! a bidirectional stream under manual inbound flow control (grounded on the
//! teacher's `subscriber::session::Session`); [`Mode::Polling`] drives intake
//! with repeated unary pulls instead, for transports that cannot hold open a
//! stream. Both feed the same [`crate::ack_pump::AckPumpHandle`] and the same
//! retry/backoff loop: per §4.4, the abstract Connection is one state machine
//! with two capability-equivalent bodies, not two unrelated types.

use crate::ack_pump::{AckPumpHandle, AckPumpSender, FlushTarget};
use crate::distribution::LatencyDistribution;
use crate::flow_control::FlowController;
use crate::handler::{AckOutcome, MessageHandler};
use crate::model::Message;
use crate::retry_policy::{Backoff, ErrorClass, RetryClassifier};
use crate::transport::{StreamRequest, Transport, transport_error};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Messages requested per unary pull, for the Polling strategy.
const POLL_BATCH_SIZE: u32 = 1_000;
/// How long the poll loop waits after a pull returns zero messages.
const POLL_EMPTY_INTERVAL: Duration = Duration::from_millis(100);

/// A Connection's lifecycle state, per §4.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

/// Which intake strategy a Connection runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Streaming,
    Polling,
}

/// Configuration and collaborators shared by every Connection a Supervisor
/// owns. Everything here is either `Arc`-shared (the Distribution, the Flow
/// Controller, the handler) or cheap to clone (the classifier, the padding).
pub(crate) struct ConnectionShared {
    pub(crate) subscription: String,
    pub(crate) ack_expiration_padding: Duration,
    pub(crate) flow_controller: Arc<FlowController>,
    pub(crate) distribution: Arc<LatencyDistribution>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) retry_classifier: RetryClassifier,
}

/// Forwards a flush batch to the transport as unary RPCs.
///
/// A single flush batch may carry more than one distinct extension length
/// (e.g. a nack's `0` alongside a live extension's `N`); `Transport::
/// modify_ack_deadline` takes one `extension_seconds` for a whole batch of
/// ack-ids, so entries are grouped by extension value before dispatch.
struct TransportFlushTarget {
    transport: Arc<dyn Transport>,
    subscription: String,
}

#[async_trait::async_trait]
impl FlushTarget for TransportFlushTarget {
    async fn send_modify_ack_deadline(&self, entries: Vec<(String, u32)>) {
        let mut by_extension: HashMap<u32, Vec<String>> = HashMap::new();
        for (ack_id, extension_seconds) in entries {
            by_extension.entry(extension_seconds).or_default().push(ack_id);
        }
        for (extension_seconds, ack_ids) in by_extension {
            if let Err(e) = self
                .transport
                .modify_ack_deadline(&self.subscription, ack_ids, extension_seconds)
                .await
            {
                // Per §4.3: flush errors never fail the pump. The owning
                // Connection's own retry loop (driven by stream/pull errors,
                // not ack-flush errors) decides whether to reconnect.
                tracing::warn!(error = %e, "modify_ack_deadline flush failed");
            }
        }
    }

    async fn send_ack(&self, ack_ids: Vec<String>) {
        if let Err(e) = self.transport.acknowledge(&self.subscription, ack_ids).await {
            tracing::warn!(error = %e, "acknowledge flush failed");
        }
    }
}

/// One logical stream. Owns its Ack Pump and transport handle exclusively;
/// never shared behind an `Arc` across tasks (see §5) — a Supervisor instead
/// holds one `Connection` per fan-out slot and talks to each through its
/// public methods.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    transport: Arc<dyn Transport>,
    mode: Mode,
    initial_deadline_seconds: u32,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    failure_cause: Arc<Mutex<Option<Arc<Error>>>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    deadline_tx: Mutex<Option<mpsc::UnboundedSender<u32>>>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        transport: Arc<dyn Transport>,
        mode: Mode,
        initial_deadline_seconds: u32,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Self {
            shared,
            transport,
            mode,
            initial_deadline_seconds,
            state_tx,
            state_rx,
            failure_cause: Arc::new(Mutex::new(None)),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
            deadline_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition; used by the
    /// Supervisor to await `start()` reaching RUNNING (or FAILED) without
    /// polling.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The cause of a FAILED transition, if any.
    pub fn failure_cause(&self) -> Option<Arc<Error>> {
        self.failure_cause.lock().unwrap().clone()
    }

    /// Transition NEW→STARTING and begin intake. Idempotent once RUNNING: a
    /// second call while already started is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Starting);

        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        *self.deadline_tx.lock().unwrap() = Some(deadline_tx);

        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let mode = self.mode;
        let initial_deadline_seconds = self.initial_deadline_seconds;
        let state_tx = self.state_tx.clone();
        let failure_cause = self.failure_cause.clone();
        let stop = self.stop.clone();

        *task = Some(tokio::spawn(async move {
            run_retry_loop(
                shared,
                transport,
                mode,
                initial_deadline_seconds,
                deadline_rx,
                state_tx,
                failure_cause,
                stop,
            )
            .await;
        }));
    }

    /// Signal STOPPING and cancel intake, without waiting for the drain to
    /// finish. Split out of [`Connection::stop`] so a caller managing several
    /// Connections can signal all of them before awaiting any one drain.
    pub(crate) fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Await this Connection's run task to completion. A no-op if `start()`
    /// was never called, or if a previous call already took the task.
    pub(crate) async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Transition to STOPPING; cancel intake; best-effort flush of pending
    /// acks/nacks; enter TERMINATED. Idempotent: a second call after the
    /// first has completed is a harmless no-op.
    pub async fn stop(&self) {
        self.signal_stop();
        self.join().await;
    }

    /// Inform the transport (streaming only) of a new stream ack-deadline and
    /// reseed the Ack Pump's extension interval. A no-op before `start()`.
    pub fn update_stream_ack_deadline(&self, seconds: u32) {
        if let Some(tx) = self.deadline_tx.lock().unwrap().as_ref() {
            let _ = tx.send(seconds);
        }
    }
}

/// One reservation, one handler call, one completion.
///
/// Reserving flow control capacity can block: this is the mechanism by which
/// a full Flow Controller throttles intake, per §4.4.1. The handler call
/// itself is not awaited here — it is spawned, so the caller can move on to
/// request the next frame while many handlers run concurrently.
async fn dispatch_message(shared: &ConnectionShared, message: Message, ack_pump: &AckPumpSender) {
    let byte_size = message.byte_size() as u64;
    shared.flow_controller.reserve(1, byte_size).await;

    let ack_id = message.ack_id.clone();
    ack_pump.received(ack_id.clone());

    let handler = shared.handler.clone();
    let flow_controller = shared.flow_controller.clone();
    let distribution = shared.distribution.clone();
    let ack_pump = ack_pump.clone();
    let received_at = Instant::now();

    tokio::spawn(async move {
        let outcome = handler.handle(message).await;
        match outcome {
            AckOutcome::Ack => ack_pump.ack(ack_id),
            AckOutcome::Nack => ack_pump.nack(ack_id),
            AckOutcome::Error(cause) => {
                tracing::warn!(ack_id = %ack_id, error = %cause, "message handler failed; nacking");
                ack_pump.nack(ack_id);
            }
        }
        flow_controller.release(1, byte_size);
        distribution.record(received_at.elapsed().as_secs_f64());
    });
}

/// The reconnect loop common to both strategies: open a session, run it until
/// it ends in `Ok(())` (a clean stop) or `Err(e)` (a stream/pull failure),
/// classify `e`, and either back off and retry or fail the Connection.
#[allow(clippy::too_many_arguments)]
async fn run_retry_loop(
    shared: Arc<ConnectionShared>,
    transport: Arc<dyn Transport>,
    mode: Mode,
    initial_deadline_seconds: u32,
    mut deadline_rx: mpsc::UnboundedReceiver<u32>,
    state_tx: watch::Sender<ConnectionState>,
    failure_cause: Arc<Mutex<Option<Arc<Error>>>>,
    stop: CancellationToken,
) {
    let mut backoff = Backoff::default();
    let mut current_deadline_seconds = initial_deadline_seconds;

    loop {
        if stop.is_cancelled() {
            state_tx.send_replace(ConnectionState::Terminated);
            return;
        }

        let flush_target = Arc::new(TransportFlushTarget {
            transport: transport.clone(),
            subscription: shared.subscription.clone(),
        });
        let ack_pump = AckPumpHandle::new(
            flush_target,
            current_deadline_seconds,
            shared.ack_expiration_padding,
            shared.distribution.clone(),
        );

        let result = match mode {
            Mode::Streaming => {
                run_streaming_session(
                    &shared,
                    transport.as_ref(),
                    &ack_pump,
                    current_deadline_seconds,
                    &mut deadline_rx,
                    &mut current_deadline_seconds,
                    &state_tx,
                    &stop,
                    &mut backoff,
                )
                .await
            }
            Mode::Polling => {
                run_polling_session(
                    &shared,
                    transport.as_ref(),
                    &ack_pump,
                    &mut deadline_rx,
                    &mut current_deadline_seconds,
                    &state_tx,
                    &stop,
                    &mut backoff,
                )
                .await
            }
        };

        ack_pump.shutdown().await;

        match result {
            Ok(()) => {
                state_tx.send_replace(ConnectionState::Terminated);
                return;
            }
            Err(e) => match (shared.retry_classifier)(&e) {
                ErrorClass::Retryable => {
                    tracing::warn!(error = %e, "retryable connection error, reconnecting");
                    state_tx.send_replace(ConnectionState::Starting);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => {
                            state_tx.send_replace(ConnectionState::Terminated);
                            return;
                        }
                    }
                }
                ErrorClass::Fatal => {
                    tracing::error!(error = %e, "fatal connection error");
                    *failure_cause.lock().unwrap() = Some(Arc::new(e));
                    state_tx.send_replace(ConnectionState::Failed);
                    return;
                }
            },
        }
    }
}

/// Runs one streaming session to completion: opens a bidirectional stream,
/// arms a keepalive, and pumps frames under manual inbound flow control until
/// `stop` fires (→ `Ok(())`) or the stream errors (→ `Err`).
#[allow(clippy::too_many_arguments)]
async fn run_streaming_session(
    shared: &ConnectionShared,
    transport: &dyn Transport,
    ack_pump: &AckPumpHandle,
    initial_deadline_seconds: u32,
    deadline_rx: &mut mpsc::UnboundedReceiver<u32>,
    current_deadline_seconds: &mut u32,
    state_tx: &watch::Sender<ConnectionState>,
    stop: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    let opened = transport
        .open_stream(&shared.subscription, initial_deadline_seconds)
        .await?;
    backoff.reset();
    state_tx.send_replace(ConnectionState::Running);

    let request_tx = opened.request_tx;
    let mut response_rx = opened.response_rx;
    let ack_pump_sender = ack_pump.sender();

    // Arm the keepalive before requesting anything: the underlying transport
    // future may not yield until the first response arrives, and by then an
    // idle stream may already have been closed by the server.
    let keepalive_shutdown = CancellationToken::new();
    let keepalive_handle = crate::keepalive::spawn(request_tx.clone(), keepalive_shutdown.clone());

    let result = run_streaming_loop(
        shared,
        &request_tx,
        &mut response_rx,
        &ack_pump_sender,
        ack_pump,
        deadline_rx,
        current_deadline_seconds,
        stop,
    )
    .await;

    keepalive_shutdown.cancel();
    let _ = keepalive_handle.await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_streaming_loop(
    shared: &ConnectionShared,
    request_tx: &mpsc::Sender<StreamRequest>,
    response_rx: &mut mpsc::Receiver<Result<Vec<Message>>>,
    ack_pump_sender: &AckPumpSender,
    ack_pump: &AckPumpHandle,
    deadline_rx: &mut mpsc::UnboundedReceiver<u32>,
    current_deadline_seconds: &mut u32,
    stop: &CancellationToken,
) -> Result<()> {
    // Kick off manual inbound flow control: request the first frame.
    if request_tx.send(StreamRequest::RequestOne).await.is_err() {
        return Err(transport_error("stream request channel closed"));
    }

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            seconds = deadline_rx.recv() => {
                match seconds {
                    Some(seconds) => {
                        *current_deadline_seconds = seconds;
                        ack_pump.set_stream_ack_deadline(seconds);
                        if request_tx.send(StreamRequest::SetStreamAckDeadline(seconds)).await.is_err() {
                            return Err(transport_error("stream request channel closed"));
                        }
                    }
                    None => return Ok(()),
                }
            }
            frame = response_rx.recv() => {
                match frame {
                    Some(Ok(messages)) => {
                        for message in messages {
                            dispatch_message(shared, message, ack_pump_sender).await;
                        }
                        if request_tx.send(StreamRequest::RequestOne).await.is_err() {
                            return Err(transport_error("stream request channel closed"));
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(transport_error("stream closed by transport")),
                }
            }
        }
    }
}

/// Runs one polling session to completion: repeated unary pulls, paced by
/// [`POLL_EMPTY_INTERVAL`] after an empty response, until `stop` fires or a
/// pull errors.
#[allow(clippy::too_many_arguments)]
async fn run_polling_session(
    shared: &ConnectionShared,
    transport: &dyn Transport,
    ack_pump: &AckPumpHandle,
    deadline_rx: &mut mpsc::UnboundedReceiver<u32>,
    current_deadline_seconds: &mut u32,
    state_tx: &watch::Sender<ConnectionState>,
    stop: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    state_tx.send_replace(ConnectionState::Running);
    let ack_pump_sender = ack_pump.sender();
    let mut reset_backoff_on_success = true;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            seconds = deadline_rx.recv() => {
                match seconds {
                    // Polling has no stream frame to update: re-tuning only
                    // reseeds the Ack Pump's own extension interval.
                    Some(seconds) => {
                        *current_deadline_seconds = seconds;
                        ack_pump.set_stream_ack_deadline(seconds);
                    }
                    None => return Ok(()),
                }
            }
            pulled = transport.pull(&shared.subscription, POLL_BATCH_SIZE) => {
                let messages = pulled?;
                if reset_backoff_on_success {
                    backoff.reset();
                    reset_backoff_on_success = false;
                }
                if messages.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_EMPTY_INTERVAL) => {}
                        _ = stop.cancelled() => return Ok(()),
                    }
                } else {
                    for message in messages {
                        dispatch_message(shared, message, &ack_pump_sender).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_ACK_EXPIRATION_PADDING, FlowControlSettings};
    use crate::handler::tests::{AlwaysAck, AlwaysNack};
    use crate::retry_policy::default_classify;
    use crate::transport::{OpenedStream, Transport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::mpsc::{Sender, channel};

    fn shared(handler: Arc<dyn MessageHandler>) -> Arc<ConnectionShared> {
        Arc::new(ConnectionShared {
            subscription: "projects/p/subscriptions/s".to_string(),
            ack_expiration_padding: DEFAULT_ACK_EXPIRATION_PADDING,
            flow_controller: Arc::new(FlowController::new(FlowControlSettings::default())),
            distribution: Arc::new(LatencyDistribution::new()),
            handler,
            retry_classifier: Arc::new(default_classify),
        })
    }

    /// A `Transport` whose `open_stream` hands back channels the test drives
    /// directly, and whose acks/modify-acks are recorded.
    ///
    /// The write half of the most recently opened stream's response channel
    /// is stashed in `responses`, so a test can push frames into a running
    /// Connection after waiting for it to reach RUNNING.
    #[derive(Debug, Default)]
    struct FakeTransport {
        open_attempts: AtomicU32,
        acks: AsyncMutex<Vec<String>>,
        modify_acks: AsyncMutex<Vec<(String, u32)>>,
        fail_opens: AtomicU32,
        responses: AsyncMutex<Option<Sender<Result<Vec<Message>>>>>,
    }

    impl FakeTransport {
        fn acks(&self) -> Vec<String> {
            self.acks.try_lock().unwrap().clone()
        }
        fn modify_acks(&self) -> Vec<(String, u32)> {
            self.modify_acks.try_lock().unwrap().clone()
        }

        /// Push one response frame into the most recently opened stream.
        async fn push_response(&self, messages: Vec<Message>) {
            let tx = self.responses.lock().await.clone().expect("stream not opened yet");
            tx.send(Ok(messages)).await.unwrap();
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn open_stream(&self, _subscription: &str, _initial: u32) -> Result<OpenedStream> {
            self.open_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_opens.load(Ordering::SeqCst) > 0 {
                self.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(transport_error("simulated open failure"));
            }
            let (request_tx, _request_rx) = channel(8);
            let (response_tx, response_rx) = channel(8);
            *self.responses.lock().await = Some(response_tx);
            Ok(OpenedStream {
                request_tx,
                response_rx,
            })
        }

        async fn pull(&self, _subscription: &str, _max: u32) -> Result<Vec<Message>> {
            Ok(vec![])
        }

        async fn acknowledge(&self, _subscription: &str, ack_ids: Vec<String>) -> Result<()> {
            self.acks.lock().await.extend(ack_ids);
            Ok(())
        }

        async fn modify_ack_deadline(
            &self,
            _subscription: &str,
            ack_ids: Vec<String>,
            extension_seconds: u32,
        ) -> Result<()> {
            self.modify_acks
                .lock()
                .await
                .extend(ack_ids.into_iter().map(|id| (id, extension_seconds)));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ack_single_message_end_to_end() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport.clone(), Mode::Streaming, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() == ConnectionState::New || *state_rx.borrow() == ConnectionState::Starting {
            state_rx.changed().await.unwrap();
        }
        assert_eq!(*state_rx.borrow(), ConnectionState::Running);

        transport.push_response(vec![Message::new("A", "payload")]).await;
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;

        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Terminated);
        assert_eq!(transport.acks(), vec!["A".to_string()]);
        assert!(transport.modify_acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_single_message_end_to_end() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared(Arc::new(AlwaysNack));
        let connection = Connection::new(shared, transport.clone(), Mode::Streaming, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }

        transport.push_response(vec![Message::new("A", "payload")]).await;
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;

        connection.stop().await;
        assert!(transport.acks().is_empty());
        assert_eq!(transport.modify_acks(), vec![("A".to_string(), 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn batched_acks_across_two_flushes_end_to_end() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport.clone(), Mode::Streaming, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }

        transport
            .push_response(vec![
                Message::new("A", "x"),
                Message::new("B", "x"),
                Message::new("C", "x"),
            ])
            .await;
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;
        transport
            .push_response(vec![Message::new("D", "x"), Message::new("E", "x")])
            .await;
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;

        connection.stop().await;
        let mut acks = transport.acks();
        acks.sort();
        assert_eq!(acks, vec!["A", "B", "C", "D", "E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_open_error_transitions_to_failed() {
        let transport = Arc::new(FakeTransport {
            fail_opens: AtomicU32::new(1),
            ..Default::default()
        });
        // Override the classifier so the single injected failure is fatal.
        let mut s = ConnectionShared {
            subscription: "projects/p/subscriptions/s".to_string(),
            ack_expiration_padding: DEFAULT_ACK_EXPIRATION_PADDING,
            flow_controller: Arc::new(FlowController::new(FlowControlSettings::default())),
            distribution: Arc::new(LatencyDistribution::new()),
            handler: Arc::new(AlwaysAck),
            retry_classifier: Arc::new(|_: &Error| ErrorClass::Fatal),
        };
        s.subscription = "projects/p/subscriptions/s".to_string();
        let connection = Connection::new(Arc::new(s), transport, Mode::Streaming, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Failed {
            state_rx.changed().await.unwrap();
        }
        assert!(connection.failure_cause().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_open_error_reconnects_and_resets_backoff() {
        let transport = Arc::new(FakeTransport {
            fail_opens: AtomicU32::new(2),
            ..Default::default()
        });
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport.clone(), Mode::Streaming, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }
        // Two failed opens (100ms, 200ms backoff) plus the final successful one.
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 3);

        connection.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_start_does_not_spawn_twice() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport.clone(), Mode::Streaming, 10);
        connection.start();
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 1);
        connection.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_stop() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport, Mode::Streaming, 10);
        connection.start();
        connection.stop().await;
        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_dispatches_and_acks() {
        #[derive(Debug, Default)]
        struct PollOnce {
            served: AtomicU32,
            acks: AsyncMutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl Transport for PollOnce {
            async fn open_stream(&self, _: &str, _: u32) -> Result<OpenedStream> {
                unreachable!("polling never opens a stream")
            }
            async fn pull(&self, _subscription: &str, _max: u32) -> Result<Vec<Message>> {
                if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec![Message::new("A", "payload")])
                } else {
                    Ok(vec![])
                }
            }
            async fn acknowledge(&self, _subscription: &str, ack_ids: Vec<String>) -> Result<()> {
                self.acks.lock().await.extend(ack_ids);
                Ok(())
            }
            async fn modify_ack_deadline(&self, _: &str, _: Vec<String>, _: u32) -> Result<()> {
                Ok(())
            }
        }

        let transport = Arc::new(PollOnce::default());
        let shared = shared(Arc::new(AlwaysAck));
        let connection = Connection::new(shared, transport.clone(), Mode::Polling, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }
        // Let the dispatched handler task and the next ack-send-delay flush run.
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;
        connection.stop().await;

        assert_eq!(transport.acks.lock().await.as_slice(), ["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_nacks_on_handler_error() {
        #[derive(Debug, Default)]
        struct PollOnce {
            served: AtomicU32,
        }

        #[async_trait::async_trait]
        impl Transport for PollOnce {
            async fn open_stream(&self, _: &str, _: u32) -> Result<OpenedStream> {
                unreachable!()
            }
            async fn pull(&self, _subscription: &str, _max: u32) -> Result<Vec<Message>> {
                if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec![Message::new("A", "payload")])
                } else {
                    Ok(vec![])
                }
            }
            async fn acknowledge(&self, _: &str, _: Vec<String>) -> Result<()> {
                Ok(())
            }
            async fn modify_ack_deadline(
                &self,
                _: &str,
                ack_ids: Vec<String>,
                extension_seconds: u32,
            ) -> Result<()> {
                assert_eq!(extension_seconds, 0);
                assert_eq!(ack_ids, vec!["A".to_string()]);
                Ok(())
            }
        }

        let transport = Arc::new(PollOnce::default());
        let shared = shared(Arc::new(AlwaysNack));
        let connection = Connection::new(shared, transport, Mode::Polling, 10);
        connection.start();

        let mut state_rx = connection.watch_state();
        while *state_rx.borrow() != ConnectionState::Running {
            state_rx.changed().await.unwrap();
        }
        tokio::time::sleep(crate::ack_pump::PENDING_ACKS_SEND_DELAY * 2).await;
        connection.stop().await;
    }
}
