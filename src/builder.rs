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

//! Builds a [`Supervisor`] from validated configuration.
//!
//! Mirrors the two-layer builder idiom used throughout the `google-cloud-rust`
//! family: accumulate options with `with_*` setters, then validate everything
//! in one terminal call. Any out-of-range option is rejected here,
//! synchronously, rather than surfacing later as an async error.

use crate::config::{
    DEFAULT_ACK_DEADLINE_SECONDS, DEFAULT_ACK_EXPIRATION_PADDING, DEFAULT_CHANNELS_PER_CORE,
    FlowControlSettings, MAX_ACK_DEADLINE_SECONDS, MIN_ACK_DEADLINE_SECONDS, SubscriberConfig,
};
use crate::handler::MessageHandler;
use crate::retry_policy::{RetryClassifier, default_classify};
use crate::supervisor::Supervisor;
use crate::transport::Transport;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// A factory that produces one [`Transport`] per Connection.
///
/// Streaming fan-out gives every Connection its own underlying transport
/// channel so that per-channel stream-concurrency limits do not serialise
/// traffic; this closure is called once per Connection at start time.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Accumulates subscriber configuration before a terminal [`SubscriberBuilder::build`].
pub struct SubscriberBuilder {
    subscription: Option<String>,
    ack_expiration_padding: Duration,
    stream_ack_deadline_seconds: u32,
    channels_per_core: u32,
    flow_control: FlowControlSettings,
    transport_factory: Option<TransportFactory>,
    handler: Option<Arc<dyn MessageHandler>>,
    retryable_classifier: Option<RetryClassifier>,
}

impl Default for SubscriberBuilder {
    fn default() -> Self {
        Self {
            subscription: None,
            ack_expiration_padding: DEFAULT_ACK_EXPIRATION_PADDING,
            stream_ack_deadline_seconds: DEFAULT_ACK_DEADLINE_SECONDS,
            channels_per_core: DEFAULT_CHANNELS_PER_CORE,
            flow_control: FlowControlSettings::default(),
            transport_factory: None,
            handler: None,
            retryable_classifier: None,
        }
    }
}

impl SubscriberBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fully-qualified subscription identifier. Required.
    pub fn with_subscription(mut self, v: impl Into<String>) -> Self {
        self.subscription = Some(v.into());
        self
    }

    /// Seconds subtracted from the stream ack-deadline when computing
    /// extension length. Minimum 1 second.
    pub fn with_ack_expiration_padding(mut self, v: Duration) -> Self {
        self.ack_expiration_padding = v;
        self
    }

    /// Initial stream deadline; clamped to `[10, 600]` at build time.
    pub fn with_stream_ack_deadline_seconds(mut self, v: u32) -> Self {
        self.stream_ack_deadline_seconds = v;
        self
    }

    /// Streaming fan-out multiplier: `N = available_cores * channels_per_core`.
    pub fn with_channels_per_core(mut self, v: u32) -> Self {
        self.channels_per_core = v;
        self
    }

    pub fn with_flow_control_settings(mut self, v: FlowControlSettings) -> Self {
        self.flow_control = v;
        self
    }

    /// Supplies one [`Transport`] per Connection. Required.
    pub fn with_transport_factory(
        mut self,
        f: impl Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    ) -> Self {
        self.transport_factory = Some(Arc::new(f));
        self
    }

    /// The callback invoked for every received message. Required.
    pub fn with_handler(mut self, h: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(h));
        self
    }

    /// Overrides which RPC status codes a stream/pull error must carry to be
    /// treated as retryable rather than fatal. Defaults to
    /// [`crate::retry_policy::default_classify`].
    pub fn with_retryable_classifier(
        mut self,
        f: impl Fn(&Error) -> crate::retry_policy::ErrorClass + Send + Sync + 'static,
    ) -> Self {
        self.retryable_classifier = Some(Arc::new(f));
        self
    }

    /// Validate accumulated options and start a [`Supervisor`] using the
    /// streaming strategy.
    pub async fn start_streaming(self) -> Result<Supervisor> {
        let (config, transport_factory, handler, retryable_classifier) = self.validate()?;
        Ok(Supervisor::start_streaming(config, transport_factory, handler, retryable_classifier).await)
    }

    /// Validate accumulated options and start a [`Supervisor`] using the
    /// polling strategy (a single Connection, driven by unary pulls).
    pub async fn start_polling(self) -> Result<Supervisor> {
        let (config, transport_factory, handler, retryable_classifier) = self.validate()?;
        Ok(Supervisor::start_polling(config, transport_factory, handler, retryable_classifier).await)
    }

    #[allow(clippy::type_complexity)]
    fn validate(
        self,
    ) -> Result<(
        SubscriberConfig,
        TransportFactory,
        Arc<dyn MessageHandler>,
        RetryClassifier,
    )> {
        let subscription = self
            .subscription
            .ok_or_else(|| Error::other("subscription is required"))?;
        if subscription.is_empty() {
            return Err(Error::other("subscription must not be empty"));
        }
        if self.ack_expiration_padding < Duration::from_secs(1) {
            return Err(Error::other("ack_expiration_padding must be >= 1s"));
        }
        if self.stream_ack_deadline_seconds < MIN_ACK_DEADLINE_SECONDS
            || self.stream_ack_deadline_seconds > MAX_ACK_DEADLINE_SECONDS
        {
            return Err(Error::other(format!(
                "stream_ack_deadline_seconds must be in [{MIN_ACK_DEADLINE_SECONDS}, {MAX_ACK_DEADLINE_SECONDS}]"
            )));
        }
        if self.channels_per_core == 0 {
            return Err(Error::other("channels_per_core must be > 0"));
        }
        let transport_factory = self
            .transport_factory
            .ok_or_else(|| Error::other("transport_factory is required"))?;
        let handler = self
            .handler
            .ok_or_else(|| Error::other("handler is required"))?;

        Ok((
            SubscriberConfig {
                subscription,
                ack_expiration_padding: self.ack_expiration_padding,
                stream_ack_deadline_seconds: self.stream_ack_deadline_seconds,
                channels_per_core: self.channels_per_core,
                flow_control: self.flow_control,
            },
            transport_factory,
            handler,
            self.retryable_classifier
                .unwrap_or_else(|| Arc::new(default_classify)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::AlwaysAck;
    use crate::transport::tests::NoopTransport;

    #[tokio::test]
    async fn rejects_missing_subscription() {
        let err = SubscriberBuilder::new()
            .with_transport_factory(|| Arc::new(NoopTransport::default()))
            .with_handler(AlwaysAck)
            .start_streaming()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("subscription"));
    }

    #[tokio::test]
    async fn rejects_out_of_range_deadline() {
        let err = SubscriberBuilder::new()
            .with_subscription("projects/p/subscriptions/s")
            .with_stream_ack_deadline_seconds(5)
            .with_transport_factory(|| Arc::new(NoopTransport::default()))
            .with_handler(AlwaysAck)
            .start_streaming()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stream_ack_deadline_seconds"));
    }

    #[tokio::test]
    async fn rejects_zero_channels_per_core() {
        let err = SubscriberBuilder::new()
            .with_subscription("projects/p/subscriptions/s")
            .with_channels_per_core(0)
            .with_transport_factory(|| Arc::new(NoopTransport::default()))
            .with_handler(AlwaysAck)
            .start_streaming()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channels_per_core"));
    }

    #[tokio::test]
    async fn custom_retryable_classifier_is_threaded_through_validate() {
        let (_, _, _, classifier) = SubscriberBuilder::new()
            .with_subscription("projects/p/subscriptions/s")
            .with_transport_factory(|| Arc::new(NoopTransport::default()))
            .with_handler(AlwaysAck)
            .with_retryable_classifier(|_| crate::retry_policy::ErrorClass::Retryable)
            .validate()
            .unwrap();
        assert_eq!(
            classifier(&Error::io("anything")),
            crate::retry_policy::ErrorClass::Retryable
        );
    }
}
