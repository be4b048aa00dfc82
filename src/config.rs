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

//! Configuration options, validated once at [`crate::builder::SubscriberBuilder::build`]
//! time so invalid configuration never surfaces as a deferred async error.

use std::time::Duration;

/// Lower and upper bound for `streamAckDeadlineSeconds`, per §3 of the
/// design: "The stream ack-deadline is bounded to `[10, 600]` seconds."
pub const MIN_ACK_DEADLINE_SECONDS: u32 = 10;
pub const MAX_ACK_DEADLINE_SECONDS: u32 = 600;

/// Default initial `streamAckDeadlineSeconds`.
pub const DEFAULT_ACK_DEADLINE_SECONDS: u32 = 10;

/// Default streaming fan-out multiplier (`N = availableCores * channelsPerCore`).
pub const DEFAULT_CHANNELS_PER_CORE: u32 = 4;

/// Default `ackExpirationPadding`.
pub const DEFAULT_ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(1);

/// What a [`FlowController`][crate::flow_control::FlowController] does when a
/// reservation would exceed a configured limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LimitBehavior {
    /// Block the caller until space is available.
    #[default]
    Block,
    /// Admit the message anyway, without accounting for it.
    Ignore,
}

/// Flow control limits. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowControlSettings {
    pub(crate) max_outstanding_messages: Option<u64>,
    pub(crate) max_outstanding_bytes: Option<u64>,
    pub(crate) on_limit_behavior: LimitBehavior,
}

impl FlowControlSettings {
    pub fn with_max_outstanding_messages(mut self, v: u64) -> Self {
        self.max_outstanding_messages = Some(v);
        self
    }

    pub fn with_max_outstanding_bytes(mut self, v: u64) -> Self {
        self.max_outstanding_bytes = Some(v);
        self
    }

    pub fn with_on_limit_behavior(mut self, v: LimitBehavior) -> Self {
        self.on_limit_behavior = v;
        self
    }
}

/// Validated, immutable subscriber configuration.
///
/// Constructed only through [`crate::builder::SubscriberBuilder::build`],
/// which is the single place out-of-range values are rejected.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub(crate) subscription: String,
    pub(crate) ack_expiration_padding: Duration,
    pub(crate) stream_ack_deadline_seconds: u32,
    pub(crate) channels_per_core: u32,
    pub(crate) flow_control: FlowControlSettings,
}

impl SubscriberConfig {
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn ack_expiration_padding(&self) -> Duration {
        self.ack_expiration_padding
    }

    pub fn stream_ack_deadline_seconds(&self) -> u32 {
        self.stream_ack_deadline_seconds
    }

    pub fn channels_per_core(&self) -> u32 {
        self.channels_per_core
    }

    pub fn flow_control(&self) -> FlowControlSettings {
        self.flow_control
    }
}

pub(crate) fn clamp_ack_deadline(seconds: u32) -> u32 {
    seconds.clamp(MIN_ACK_DEADLINE_SECONDS, MAX_ACK_DEADLINE_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_in_range_values() {
        assert_eq!(clamp_ack_deadline(20), 20);
    }

    #[test]
    fn clamp_bounds_out_of_range_values() {
        assert_eq!(clamp_ack_deadline(0), MIN_ACK_DEADLINE_SECONDS);
        assert_eq!(clamp_ack_deadline(10_000), MAX_ACK_DEADLINE_SECONDS);
    }

    #[test]
    fn flow_control_settings_default_to_unlimited_block() {
        let s = FlowControlSettings::default();
        assert!(s.max_outstanding_messages.is_none());
        assert!(s.max_outstanding_bytes.is_none());
        assert_eq!(s.on_limit_behavior, LimitBehavior::Block);
    }
}
