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

//! Classifies a [`gax::error::Error`] as retryable or fatal, and the bounded
//! exponential backoff used between reconnect attempts.
//!
//! This differs in one place from the classification used internally by the
//! sibling subscriber client: there, `Cancelled` is treated as non-retryable
//! for the specific RPCs it classifies; here `Cancelled` and
//! `DeadlineExceeded` are both retryable (see DESIGN.md).

use crate::Error;
use gax::error::rpc::Code;
use std::time::Duration;

/// Initial backoff delay, per the design: "initial 100 ms, doubling, capped
/// at a few seconds".
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound on the backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(4);

/// Whether a retry loop should continue after this error, or give up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// A pluggable override for [`default_classify`], set via
/// `SubscriberBuilder::with_retryable_statuses` style configuration (§6:
/// `retryableStatuses`).
pub type RetryClassifier = std::sync::Arc<dyn Fn(&Error) -> ErrorClass + Send + Sync>;

/// The default classifier: transient-before-rpc and I/O errors are
/// retryable; otherwise classify by the RPC status code.
pub fn default_classify(error: &Error) -> ErrorClass {
    if error.is_transient_and_before_rpc() || error.is_io() || error.is_transport() {
        return ErrorClass::Retryable;
    }
    match error.status().map(|s| s.code) {
        Some(
            Code::Unavailable
            | Code::Internal
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Cancelled,
        ) => ErrorClass::Retryable,
        Some(
            Code::InvalidArgument
            | Code::NotFound
            | Code::PermissionDenied
            | Code::Unauthenticated
            | Code::FailedPrecondition,
        ) => ErrorClass::Fatal,
        // Anything not explicitly listed (Unknown, AlreadyExists, Aborted,
        // OutOfRange, Unimplemented, DataLoss) or no status at all: fail
        // fast rather than retry indefinitely on an error we don't
        // understand.
        _ => ErrorClass::Fatal,
    }
}

/// Tracks the next delay to use for a reconnect loop, doubling on every
/// failure and resetting to [`INITIAL_BACKOFF`] after a successful open.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    /// The delay to wait before the next attempt, then double it for the
    /// attempt after that (capped at [`MAX_BACKOFF`]).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    /// Reset after a successful open: the next failure waits the initial
    /// delay, not a doubled one.
    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}
