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

//! The four RPC-layer operations a [`crate::connection::Connection`] needs.
//!
//! This crate defines its own minimal transport seam rather than depending on
//! generated pub/sub protobuf stubs: the wire schema of any particular
//! service is out of scope (see the crate's top-level documentation), and a
//! real implementation's `Stub` is inseparable from generated gapic code.
//! Applications (or a higher-level crate) provide a [`Transport`]
//! implementation that actually talks to a server; this crate only drives it.

use crate::model::Message;
use crate::{Error, Result};
use tokio::sync::mpsc;

/// A request sent on the write half of an open stream.
///
/// Acks, nacks, and deadline extensions are never sent as stream frames in
/// this design: they are always unary RPCs dispatched by the Ack Pump (see
/// [`crate::ack_pump`]), for both the Streaming and Polling strategies. Only
/// keepalive pings and deadline re-tune notifications travel over the bidi
/// stream itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRequest {
    /// An empty keepalive frame, or a signal requesting the next response
    /// frame under manual inbound flow control.
    RequestOne,
    /// The Supervisor has re-tuned the stream ack-deadline; propagate it.
    SetStreamAckDeadline(u32),
}

/// A handle to one open bidirectional stream.
pub struct OpenedStream {
    pub request_tx: mpsc::Sender<StreamRequest>,
    pub response_rx: mpsc::Receiver<Result<Vec<Message>>>,
}

/// The RPC-layer operations a Connection consumes.
///
/// Implementations must be cheap to hold behind an `Arc` and safe to call
/// concurrently: a [`crate::supervisor::Supervisor`] may drive many
/// Connections, each against its own `Transport` instance (or, for Polling,
/// a single shared one), simultaneously.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Open a bidirectional stream for `subscription`, seeded with
    /// `initial_deadline_seconds`.
    async fn open_stream(
        &self,
        subscription: &str,
        initial_deadline_seconds: u32,
    ) -> Result<OpenedStream>;

    /// Issue one unary pull, returning up to `max_messages`.
    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<Message>>;

    /// Acknowledge a batch of ack-ids. Unary.
    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> Result<()>;

    /// Extend (or, at `extension_seconds == 0`, nack) a batch of ack-ids.
    /// Unary.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        extension_seconds: u32,
    ) -> Result<()>;
}

pub(crate) fn transport_error(message: impl Into<String>) -> Error {
    Error::io(message.into())
}
