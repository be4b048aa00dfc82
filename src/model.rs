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

//! The data carried between a [`transport::Transport`][crate::transport::Transport]
//! and a [`MessageHandler`][crate::handler::MessageHandler].

use bytes::Bytes;

/// A single message delivered by the server.
///
/// `ack_id` is opaque to this crate: it is only ever echoed back to the
/// transport in ack / modify-ack-deadline requests, never inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub ack_id: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(ack_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            ack_id: ack_id.into(),
            payload: payload.into(),
        }
    }

    /// Size in bytes, as accounted by the [`crate::flow_control::FlowController`].
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}
