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

//! The client-side receiving half of a cloud pub/sub message-delivery service.
//!
//! **WARNING:** this crate is under active development. We expect multiple
//! breaking changes in the upcoming releases. Testing is also incomplete, we do
//! **not** recommend that you use this crate in production. We welcome feedback
//! about the APIs, documentation, missing features, bugs, etc.
//!
//! This crate implements the *subscriber connection core*: the state machine
//! and scheduling that pumps messages off one or more bidirectional streams
//! (or, for services that do not support streaming pulls, repeated polling),
//! keeps long-lived messages leased by extending their deadline while a
//! handler is still working, batches acknowledgements, and auto-tunes the
//! stream ack deadline from observed handler latency.
//!
//! Credential acquisition, RPC channel construction, and the wire schema of
//! any particular pub/sub service are deliberately out of scope: applications
//! (or a higher-level crate) supply a [`transport::Transport`] implementation
//! and a [`handler::MessageHandler`] implementation, and this crate does the
//! rest.

pub use gax::Result;
pub use gax::error::Error;

pub mod ack_pump;
pub mod builder;
pub mod config;
pub mod connection;
pub mod distribution;
pub mod flow_control;
pub mod handler;
pub mod keepalive;
pub mod model;
pub mod retry_policy;
pub mod supervisor;
pub mod transport;

pub use builder::SubscriberBuilder;
pub use config::{FlowControlSettings, LimitBehavior, SubscriberConfig};
pub use connection::ConnectionState;
pub use handler::{AckOutcome, MessageHandler};
pub use model::Message;
pub use supervisor::{Supervisor, SupervisorState};
