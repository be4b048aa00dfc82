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

//! Owns a fan-out of parallel [`Connection`]s, the resources they share, and
//! the ack-deadline auto-tuning loop.
//!
//! A `Supervisor` is the type a `SubscriberBuilder` hands back: applications
//! drive the subscription's lifetime through it and otherwise never touch a
//! `Connection` directly. Every `Connection` method the Supervisor calls
//! (`start`, `stop`, `update_stream_ack_deadline`, `watch_state`,
//! `failure_cause`) takes `&self` and only ever reaches its actor through a
//! channel or a `watch` handle, so sharing the fan-out behind one `Arc` here
//! never risks one Connection mutating another's state.

use crate::config::{SubscriberConfig, clamp_ack_deadline};
use crate::connection::{Connection, ConnectionShared, ConnectionState, Mode};
use crate::distribution::LatencyDistribution;
use crate::flow_control::FlowController;
use crate::handler::MessageHandler;
use crate::retry_policy::RetryClassifier;
use crate::transport::Transport;
use crate::Error;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the ack-deadline auto-tuning task re-samples the Latency
/// Distribution and re-tunes every Connection.
pub const ACK_DEADLINE_UPDATE_PERIOD: Duration = Duration::from_secs(60);

/// A Supervisor's lifecycle state, mirroring [`ConnectionState`] but derived
/// from the aggregate of every Connection it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

/// Owns N parallel Connections plus the resources they share: the Latency
/// Distribution, the Flow Controller, and the periodic ack-deadline tuning
/// task.
///
/// Dropping a `Supervisor` without calling [`Supervisor::stop`] abandons its
/// background tasks; a graceful shutdown always goes through `stop()`.
pub struct Supervisor {
    connections: Arc<Vec<Connection>>,
    distribution: Arc<LatencyDistribution>,
    state_tx: watch::Sender<SupervisorState>,
    state_rx: watch::Receiver<SupervisorState>,
    failure_cause: Arc<Mutex<Option<Arc<Error>>>>,
    tuning_shutdown: CancellationToken,
    tuning_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub(crate) async fn start_streaming(
        config: SubscriberConfig,
        transport_factory: Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>,
        handler: Arc<dyn MessageHandler>,
        retryable_classifier: RetryClassifier,
    ) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let fan_out = cores.saturating_mul(config.channels_per_core()).max(1);
        Self::start(
            config,
            transport_factory,
            handler,
            retryable_classifier,
            Mode::Streaming,
            fan_out,
        )
        .await
    }

    pub(crate) async fn start_polling(
        config: SubscriberConfig,
        transport_factory: Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>,
        handler: Arc<dyn MessageHandler>,
        retryable_classifier: RetryClassifier,
    ) -> Self {
        Self::start(
            config,
            transport_factory,
            handler,
            retryable_classifier,
            Mode::Polling,
            1,
        )
        .await
    }

    async fn start(
        config: SubscriberConfig,
        transport_factory: Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>,
        handler: Arc<dyn MessageHandler>,
        retryable_classifier: RetryClassifier,
        mode: Mode,
        fan_out: u32,
    ) -> Self {
        let distribution = Arc::new(LatencyDistribution::new());
        let flow_controller = Arc::new(FlowController::new(config.flow_control()));
        let initial_deadline_seconds = config.stream_ack_deadline_seconds();

        let connections: Arc<Vec<Connection>> = Arc::new(
            (0..fan_out)
                .map(|_| {
                    let shared = Arc::new(ConnectionShared {
                        subscription: config.subscription().to_string(),
                        ack_expiration_padding: config.ack_expiration_padding(),
                        flow_controller: flow_controller.clone(),
                        distribution: distribution.clone(),
                        handler: handler.clone(),
                        retry_classifier: retryable_classifier.clone(),
                    });
                    Connection::new(shared, transport_factory(), mode, initial_deadline_seconds)
                })
                .collect(),
        );

        for connection in connections.iter() {
            connection.start();
        }

        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let failure_cause = Arc::new(Mutex::new(None));

        let monitor_task = tokio::spawn(run_monitor(
            connections.clone(),
            state_tx.clone(),
            failure_cause.clone(),
        ));

        let tuning_shutdown = CancellationToken::new();
        let tuning_task = if matches!(mode, Mode::Streaming) {
            Some(tokio::spawn(run_tuning_loop(
                connections.clone(),
                distribution.clone(),
                initial_deadline_seconds,
                tuning_shutdown.clone(),
            )))
        } else {
            None
        };

        Self {
            connections,
            distribution,
            state_tx,
            state_rx,
            failure_cause,
            tuning_shutdown,
            tuning_task: Mutex::new(tuning_task),
            monitor_task: Mutex::new(Some(monitor_task)),
        }
    }

    /// Current aggregate state.
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// The cause of a FAILED transition, if any.
    pub fn failure_cause(&self) -> Option<Arc<Error>> {
        self.failure_cause.lock().unwrap().clone()
    }

    /// The current p99 of observed handler ack-latency, in seconds. Exposed
    /// for diagnostics; the tuning task reads the same distribution
    /// internally.
    pub fn current_p99_seconds(&self) -> u32 {
        self.distribution.percentile(0.99)
    }

    /// Signal every Connection to stop, await all drains, and release shared
    /// resources. Idempotent.
    ///
    /// Signalling is fanned out to every Connection before any drain is
    /// awaited, and the drains themselves (along with the tuning and monitor
    /// tasks, which only wait on those same signals) are awaited
    /// concurrently: total latency is bounded by the single slowest drain,
    /// not by the number of Connections.
    pub async fn stop(&self) {
        self.state_tx.send_replace(SupervisorState::Stopping);
        self.tuning_shutdown.cancel();
        for connection in self.connections.iter() {
            connection.signal_stop();
        }
        let tuning_join = async {
            if let Some(task) = self.tuning_task.lock().unwrap().take() {
                let _ = task.await;
            }
        };
        let monitor_join = async {
            if let Some(task) = self.monitor_task.lock().unwrap().take() {
                let _ = task.await;
            }
        };
        let connections_join =
            futures::future::join_all(self.connections.iter().map(|c| c.join()));
        tokio::join!(tuning_join, monitor_join, connections_join);
        self.state_tx.send_replace(SupervisorState::Terminated);
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Waits for every Connection to leave NEW/STARTING, then flips the
/// Supervisor's own state to RUNNING (or FAILED, if one already failed
/// during startup). Afterwards, keeps watching for a later fatal failure in
/// any peer; when one occurs, records its cause, fails the Supervisor, and
/// stops the remaining Connections.
async fn run_monitor(
    connections: Arc<Vec<Connection>>,
    state_tx: watch::Sender<SupervisorState>,
    failure_cause: Arc<Mutex<Option<Arc<Error>>>>,
) {
    let mut watchers: Vec<watch::Receiver<ConnectionState>> =
        connections.iter().map(|c| c.watch_state()).collect();

    for watcher in &mut watchers {
        while matches!(*watcher.borrow(), ConnectionState::New | ConnectionState::Starting) {
            if watcher.changed().await.is_err() {
                break;
            }
        }
    }

    if let Some(index) = watchers.iter().position(|w| *w.borrow() == ConnectionState::Failed) {
        *failure_cause.lock().unwrap() = connections[index].failure_cause();
        state_tx.send_replace(SupervisorState::Failed);
        return;
    }
    state_tx.send_replace(SupervisorState::Running);

    loop {
        let changed = watchers.iter_mut().map(|w| Box::pin(w.changed()));
        let (result, index, _) = futures::future::select_all(changed).await;
        if result.is_err() {
            return;
        }
        if *watchers[index].borrow() != ConnectionState::Failed {
            continue;
        }
        if *state_tx.borrow() == SupervisorState::Stopping {
            // An orderly `stop()` is already tearing connections down; let it
            // own the transition to TERMINATED instead of racing it to FAILED.
            return;
        }
        *failure_cause.lock().unwrap() = connections[index].failure_cause();
        state_tx.send_replace(SupervisorState::Failed);
        for (i, connection) in connections.iter().enumerate() {
            if i != index {
                connection.stop().await;
            }
        }
        return;
    }
}

/// Every [`ACK_DEADLINE_UPDATE_PERIOD`], reads `p99 = Distribution.percentile(0.99)`,
/// clamps it to `[10, 600]`, and if it differs from the currently-applied
/// value, pushes it to every Connection.
async fn run_tuning_loop(
    connections: Arc<Vec<Connection>>,
    distribution: Arc<LatencyDistribution>,
    initial_deadline_seconds: u32,
    shutdown: CancellationToken,
) {
    let mut current = initial_deadline_seconds;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(ACK_DEADLINE_UPDATE_PERIOD) => {}
        }
        let p99 = clamp_ack_deadline(distribution.percentile(0.99));
        if p99 != current {
            tracing::debug!(stream_ack_deadline_seconds = p99, "re-tuning ack deadline");
            for connection in connections.iter() {
                connection.update_stream_ack_deadline(p99);
            }
            current = p99;
        }
    }
}
