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

//! The application-supplied callback invoked for every received message.
//!
//! Unlike a pull-style API where the application calls `.ack()` on a handle
//! it is handed, here the Connection itself calls [`MessageHandler::handle`]
//! and interprets its return value: [`AckOutcome::Ack`] enqueues an ack,
//! [`AckOutcome::Nack`] and [`AckOutcome::Error`] both enqueue a nack (an
//! `Error` outcome additionally gets logged with its cause).
//!
//! # Example
//!
//! ```
//! use subscriber_core::{AckOutcome, Message, MessageHandler};
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, message: Message) -> AckOutcome {
//!         println!("received message: {:?}", message.ack_id);
//!         AckOutcome::Ack
//!     }
//! }
//! ```

use std::fmt;

/// The outcome of processing a single message.
///
/// The handler is called at most once per received copy of a message;
/// duplicate deliveries across reconnects are counted as separate receives
/// and each gets its own `handle` call.
#[derive(Debug)]
pub enum AckOutcome {
    /// Acknowledge the message: the server may delete it.
    Ack,
    /// Negatively acknowledge the message: the server redelivers it
    /// immediately.
    Nack,
    /// The handler failed. Treated identically to [`AckOutcome::Nack`], but
    /// the cause is logged.
    Error(Box<dyn std::error::Error + Send + Sync>),
}

impl AckOutcome {
    /// Build an [`AckOutcome::Error`] from any error type.
    pub fn error(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        AckOutcome::Error(Box::new(e))
    }

    pub(crate) fn is_ack(&self) -> bool {
        matches!(self, AckOutcome::Ack)
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Ack => write!(f, "ack"),
            AckOutcome::Nack => write!(f, "nack"),
            AckOutcome::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Receives message payloads and decides whether to ack or nack them.
///
/// Implementations should tolerate duplicate deliveries: this crate makes no
/// exactly-once guarantee.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: crate::model::Message) -> AckOutcome;
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(crate::model::Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AckOutcome> + Send,
{
    async fn handle(&self, message: crate::model::Message) -> AckOutcome {
        self(message).await
    }
}
