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

//! Batches ack / modify-ack-deadline operations and drives the periodic
//! deadline-extension alarm for one Connection.
//!
//! Modelled as a single-owned actor task reached only through channels (the
//! same shape as the lease-management actor this crate's sibling client
//! uses): there is no lock to take, so "never call user code while holding
//! the Ack Pump lock" holds by construction. A [`FlushTarget`] is injected at
//! construction rather than the pump holding a back-reference to its owning
//! Connection.

use crate::distribution::LatencyDistribution;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep, sleep};

/// Default delay between the first pending ack/nack and the flush that
/// drains it.
pub const PENDING_ACKS_SEND_DELAY: Duration = Duration::from_millis(100);

/// Maximum combined ack-id + modify-ack entries per outgoing request.
pub const MAX_PER_REQUEST_CHANGES: usize = 10_000;

/// Seconds below which a stream ack-deadline never sinks.
const MIN_DEADLINE_SECONDS: u32 = 10;
/// Seconds above which a stream ack-deadline never rises.
const MAX_DEADLINE_SECONDS: u32 = 600;

/// Maximum time a message may be kept leased past its first receive, even if
/// the handler is still running. Not independently configurable in this
/// version (see DESIGN.md's Open Question resolution).
pub const MAX_LEASE_EXTENSION: Duration = Duration::from_secs(600);

/// Extension length written into a modify-ack-deadline entry before the
/// shared Distribution has observed its first sample. This is purely an Ack
/// Pump concern: [`LatencyDistribution::percentile`] itself returns `0` on an
/// empty distribution, a total but otherwise uninformative function — this
/// crate substitutes a more useful starting guess only at the one call site
/// that needs one. Not configurable in this version (see DESIGN.md's Open
/// Question resolution).
const EMPTY_DISTRIBUTION_SEED_SECONDS: u32 = 2;

/// Where a flush's batches are sent. Implemented by the owning Connection.
#[async_trait::async_trait]
pub trait FlushTarget: Send + Sync {
    /// Send one batch of modify-ack-deadline entries (nacks included, as
    /// `extension_seconds == 0`). Never fails the pump: errors are the
    /// implementation's to log and handle via its own retry/reconnect path.
    async fn send_modify_ack_deadline(&self, entries: Vec<(String, u32)>);

    /// Send one batch of ack-ids.
    async fn send_ack(&self, ack_ids: Vec<String>);
}

#[derive(Debug)]
enum AckEvent {
    Ack(String),
    Nack(String),
}

struct PumpState {
    pending_acks: HashSet<String>,
    pending_nacks: HashSet<String>,
    pending_extensions: HashMap<String, u32>,
    in_flight: HashMap<String, Instant>,
    stream_ack_deadline_seconds: u32,
    ack_expiration_padding: Duration,
    ack_send_alarm: Option<Pin<Box<Sleep>>>,
    extension_alarm: Option<Pin<Box<Sleep>>>,
    flush_target: Arc<dyn FlushTarget>,
    distribution: Arc<LatencyDistribution>,
}

impl PumpState {
    /// The extension length written into a modify-ack-deadline entry.
    ///
    /// Before the shared Distribution has observed a single handler
    /// completion, the source hard-codes [`EMPTY_DISTRIBUTION_SEED_SECONDS`]
    /// rather than deriving a value from the connection's (still nominal)
    /// `streamAckDeadlineSeconds` — see DESIGN.md's Open Question
    /// resolution. Once at least one sample has landed, §4.3's formula
    /// applies: `clamp(streamAckDeadlineSeconds - ackExpirationPadding, 10,
    /// 600)`.
    fn extension_value_seconds(&self) -> u32 {
        if !self.distribution.has_samples() {
            return EMPTY_DISTRIBUTION_SEED_SECONDS;
        }
        let padding_secs = self.ack_expiration_padding.as_secs() as u32;
        self.stream_ack_deadline_seconds
            .saturating_sub(padding_secs)
            .clamp(MIN_DEADLINE_SECONDS, MAX_DEADLINE_SECONDS)
    }

    /// How long until the next extension alarm fire:
    /// `streamAckDeadlineSeconds - ackExpirationPadding`, per §4.3 — this is
    /// the raw (unclamped) difference, floored at one second so a
    /// misconfigured padding cannot busy-loop the alarm.
    fn rearm_period(&self) -> Duration {
        let padding_secs = self.ack_expiration_padding.as_secs() as u32;
        let raw = self
            .stream_ack_deadline_seconds
            .saturating_sub(padding_secs)
            .max(1);
        Duration::from_secs(raw as u64)
    }

    fn arm_ack_send_alarm(&mut self) {
        if self.ack_send_alarm.is_none() {
            self.ack_send_alarm = Some(Box::pin(sleep(PENDING_ACKS_SEND_DELAY)));
        }
    }

    fn arm_extension_alarm(&mut self) {
        if self.extension_alarm.is_none() {
            self.extension_alarm = Some(Box::pin(sleep(self.rearm_period())));
        }
    }

    fn on_message_received(&mut self, ack_id: String) {
        self.in_flight.insert(ack_id, Instant::now());
        self.arm_extension_alarm();
    }

    fn on_ack(&mut self, ack_id: String) {
        self.in_flight.remove(&ack_id);
        self.pending_extensions.remove(&ack_id);
        self.pending_nacks.remove(&ack_id);
        self.pending_acks.insert(ack_id);
        self.arm_ack_send_alarm();
    }

    fn on_nack(&mut self, ack_id: String) {
        self.in_flight.remove(&ack_id);
        self.pending_extensions.remove(&ack_id);
        self.pending_acks.remove(&ack_id);
        self.pending_nacks.insert(ack_id);
        self.arm_ack_send_alarm();
    }

    fn set_stream_ack_deadline(&mut self, seconds: u32) {
        self.stream_ack_deadline_seconds = seconds;
        if self.extension_alarm.is_some() {
            self.extension_alarm = Some(Box::pin(sleep(self.rearm_period())));
        }
    }

    /// The extension alarm fired: recompute the extension for every message
    /// still in flight, dropping any that have exceeded
    /// [`MAX_LEASE_EXTENSION`].
    fn fire_extension_alarm(&mut self) {
        let now = Instant::now();
        let extension_seconds = self.extension_value_seconds();
        self.in_flight.retain(|_, first_received| {
            now.duration_since(*first_received) < MAX_LEASE_EXTENSION
        });
        for ack_id in self.in_flight.keys() {
            self.pending_extensions
                .insert(ack_id.clone(), extension_seconds);
        }
        if !self.pending_extensions.is_empty() || !self.pending_nacks.is_empty() {
            self.arm_ack_send_alarm();
        }
        self.extension_alarm = if self.in_flight.is_empty() {
            None
        } else {
            Some(Box::pin(sleep(self.rearm_period())))
        };
    }

    async fn flush(&mut self) {
        self.ack_send_alarm = None;

        // Modify-deadline entries (nacks are extension 0) before acks.
        let mut modify_entries: Vec<(String, u32)> = self
            .pending_nacks
            .drain()
            .map(|id| (id, 0))
            .chain(self.pending_extensions.drain())
            .collect();
        let acks: Vec<String> = self.pending_acks.drain().collect();

        for chunk in modify_entries.drain(..).collect::<Vec<_>>().chunks(MAX_PER_REQUEST_CHANGES) {
            self.flush_target
                .send_modify_ack_deadline(chunk.to_vec())
                .await;
        }
        for chunk in acks.chunks(MAX_PER_REQUEST_CHANGES) {
            self.flush_target.send_ack(chunk.to_vec()).await;
        }
    }

    /// Best-effort drain used on shutdown: flush whatever is pending, then
    /// nack every message still in flight (the handler's eventual result, if
    /// any, will simply be ignored) so the server redelivers promptly rather
    /// than waiting out the full lease.
    async fn shutdown(mut self) {
        self.flush().await;
        let remaining: Vec<String> = self.in_flight.drain().map(|(id, _)| id).collect();
        if !remaining.is_empty() {
            self.flush_target
                .send_modify_ack_deadline(remaining.into_iter().map(|id| (id, 0)).collect())
                .await;
        }
    }
}

enum Event {
    Flush,
    Extend,
    Message(String),
    AckEvent(AckEvent),
    SetDeadline(u32),
    Stopped,
}

async fn next_event(
    extension_alarm: &mut Option<Pin<Box<Sleep>>>,
    ack_send_alarm: &mut Option<Pin<Box<Sleep>>>,
    message_rx: &mut UnboundedReceiver<String>,
    ack_rx: &mut UnboundedReceiver<AckEvent>,
    deadline_rx: &mut UnboundedReceiver<u32>,
) -> Event {
    tokio::select! {
        biased;
        _ = async { extension_alarm.as_mut().unwrap().as_mut().await }, if extension_alarm.is_some() => Event::Extend,
        _ = async { ack_send_alarm.as_mut().unwrap().as_mut().await }, if ack_send_alarm.is_some() => Event::Flush,
        message = message_rx.recv() => match message {
            Some(ack_id) => Event::Message(ack_id),
            None => Event::Stopped,
        },
        event = ack_rx.recv() => match event {
            Some(e) => Event::AckEvent(e),
            None => Event::Stopped,
        },
        seconds = deadline_rx.recv() => match seconds {
            Some(s) => Event::SetDeadline(s),
            None => Event::Stopped,
        },
    }
}

/// A clonable, lightweight client handle onto a running Ack Pump.
///
/// Unlike [`AckPumpHandle`], this does not own the actor task: it is meant to
/// be cloned into every per-message completion callback a
/// [`crate::connection::Connection`] spawns, so those callbacks can report
/// ack/nack outcomes without reaching back into the Connection itself.
#[derive(Clone)]
pub struct AckPumpSender {
    message_tx: UnboundedSender<String>,
    ack_tx: UnboundedSender<AckEvent>,
    deadline_tx: UnboundedSender<u32>,
}

impl AckPumpSender {
    pub fn received(&self, ack_id: String) {
        let _ = self.message_tx.send(ack_id);
    }

    pub fn ack(&self, ack_id: String) {
        let _ = self.ack_tx.send(AckEvent::Ack(ack_id));
    }

    pub fn nack(&self, ack_id: String) {
        let _ = self.ack_tx.send(AckEvent::Nack(ack_id));
    }

    pub fn set_stream_ack_deadline(&self, seconds: u32) {
        let _ = self.deadline_tx.send(seconds);
    }
}

/// A live Ack Pump: construction spawns its actor task.
pub struct AckPumpHandle {
    sender: AckPumpSender,
    handle: JoinHandle<()>,
}

impl AckPumpHandle {
    pub fn new(
        flush_target: Arc<dyn FlushTarget>,
        stream_ack_deadline_seconds: u32,
        ack_expiration_padding: Duration,
        distribution: Arc<LatencyDistribution>,
    ) -> Self {
        let (message_tx, mut message_rx) = unbounded_channel();
        let (ack_tx, mut ack_rx) = unbounded_channel();
        let (deadline_tx, mut deadline_rx) = unbounded_channel();

        let mut state = PumpState {
            pending_acks: HashSet::new(),
            pending_nacks: HashSet::new(),
            pending_extensions: HashMap::new(),
            in_flight: HashMap::new(),
            stream_ack_deadline_seconds,
            ack_expiration_padding,
            ack_send_alarm: None,
            extension_alarm: None,
            flush_target,
            distribution,
        };

        let handle = tokio::spawn(async move {
            loop {
                let event = {
                    let PumpState {
                        extension_alarm,
                        ack_send_alarm,
                        ..
                    } = &mut state;
                    next_event(
                        extension_alarm,
                        ack_send_alarm,
                        &mut message_rx,
                        &mut ack_rx,
                        &mut deadline_rx,
                    )
                    .await
                };
                match event {
                    Event::Flush => state.flush().await,
                    Event::Extend => state.fire_extension_alarm(),
                    Event::Message(ack_id) => state.on_message_received(ack_id),
                    Event::AckEvent(AckEvent::Ack(id)) => state.on_ack(id),
                    Event::AckEvent(AckEvent::Nack(id)) => state.on_nack(id),
                    Event::SetDeadline(seconds) => state.set_stream_ack_deadline(seconds),
                    Event::Stopped => {
                        // Drain any already-queued acks/nacks before the
                        // final flush, mirroring a graceful close.
                        while let Ok(event) = ack_rx.try_recv() {
                            match event {
                                AckEvent::Ack(id) => state.on_ack(id),
                                AckEvent::Nack(id) => state.on_nack(id),
                            }
                        }
                        state.shutdown().await;
                        break;
                    }
                }
            }
        });

        Self {
            sender: AckPumpSender {
                message_tx,
                ack_tx,
                deadline_tx,
            },
            handle,
        }
    }

    /// A clonable client handle, for use in spawned per-message completion
    /// callbacks that must not hold a reference to the owning Connection.
    pub fn sender(&self) -> AckPumpSender {
        self.sender.clone()
    }

    pub fn received(&self, ack_id: String) {
        self.sender.received(ack_id);
    }

    pub fn ack(&self, ack_id: String) {
        self.sender.ack(ack_id);
    }

    pub fn nack(&self, ack_id: String) {
        self.sender.nack(ack_id);
    }

    pub fn set_stream_ack_deadline(&self, seconds: u32) {
        self.sender.set_stream_ack_deadline(seconds);
    }

    /// Stop accepting new work, flush what is pending, and nack whatever is
    /// still in flight. Idempotent only in the sense that dropping the
    /// handle after calling this is always safe; calling it twice is a
    /// programming error (it consumes `self`).
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}
